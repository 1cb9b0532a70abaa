use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;

use tileseg_rs::predictor::Backbone;
use tileseg_rs::sandbox::executable_dir;
use tileseg_rs::{logging, JobParameters, JobRunner, ModelResolver, OrtLoader};

/// Executes one segmentation job described by a JSON parameter file.
///
/// Progress and the result path are written to stdout as `PROGRESS:<n>` and
/// `RESULT:<path>` lines; diagnostics go to stderr.
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    params: PathBuf,
}

fn main() -> ExitCode {
    logging::init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("ERROR: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    let params = JobParameters::from_file(&args.params)
        .with_context(|| format!("Failed to load job parameters: {}", args.params.display()))?;

    let runner_dir = std::env::current_exe()
        .ok()
        .and_then(|exe| executable_dir(&exe))
        .unwrap_or_default();
    let loader = OrtLoader::new(params.device_id, Backbone::from_name(&params.backbone));

    let mut runner = JobRunner::new(ModelResolver::new(loader), runner_dir, io::stdout().lock());
    runner.run(&params)?;
    Ok(())
}
