use anyhow::{ensure, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;

use tileseg_rs::{logging, supervisor, Config, JobEvent, Supervisor};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();
    logging::init();

    ensure!(config.input.exists(), "Input raster does not exist");
    if let Some(model_path) = &config.model_path {
        ensure!(model_path.exists(), "Model path does not exist");
    }

    let runner = match &config.runner {
        Some(runner) => runner.clone(),
        None => Supervisor::locate_runner()?,
    };
    let supervisor = Supervisor::new(runner);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let progress_bar = ProgressBar::new(100);
    progress_bar.set_style(
        ProgressStyle::with_template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}% {msg}")?
            .progress_chars("#>-"),
    );

    let params = config.to_params();
    let result = supervisor
        .run(
            &params,
            |event| match event {
                JobEvent::Progress(value) => progress_bar.set_position(u64::from(value)),
                JobEvent::Result(path) => progress_bar.set_message(path.display().to_string()),
            },
            cancel,
        )
        .await;

    let metadata_path = match result {
        Ok(path) => {
            progress_bar.finish();
            path
        }
        Err(err) => {
            progress_bar.abandon();
            return Err(err).context("Segmentation job failed");
        }
    };

    let metadata = supervisor::read_metadata(&metadata_path)
        .with_context(|| format!("Failed to read metadata: {}", metadata_path.display()))?;
    let outputs = if metadata.artifacts.is_empty() {
        vec![metadata.output_path.clone()]
    } else {
        metadata.artifacts.clone()
    };
    for path in &outputs {
        println!("{}", path.display());
    }
    println!("{}", metadata_path.display());

    Ok(())
}
