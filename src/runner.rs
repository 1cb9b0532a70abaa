use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use image::{DynamicImage, GrayImage, ImageBuffer, ImageFormat, PixelWithColorType, RgbImage};
use ndarray::prelude::*;
use tracing::{debug, error, info, warn};

use crate::engine::TiledEngine;
use crate::errors::{Result, SegError};
use crate::geotiff::write_geotiff;
use crate::palette::{argmax, Palette};
use crate::params::{JobMetadata, JobParameters};
use crate::predictor::RemotePredictor;
use crate::protocol::ProtocolWriter;
use crate::raster::{load_image_buffer, to_rgb_image};
use crate::resolver::{ModelResolver, ResolvedModel};

/// Lifecycle of one job. `Failed` is reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    ExportedInput,
    ModelResolved,
    Predicting,
    Colorized,
    Persisted,
    Done,
    Failed,
}

impl JobState {
    /// Progress checkpoint reported on entering the state.
    pub const fn progress(self) -> Option<u8> {
        match self {
            Self::ExportedInput => Some(20),
            Self::ModelResolved => Some(40),
            Self::Predicting => Some(60),
            Self::Colorized => Some(80),
            Self::Persisted => Some(90),
            Self::Done => Some(100),
            Self::Idle | Self::Failed => None,
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

enum Source {
    Local(ResolvedModel),
    Remote(RemotePredictor),
}

/// Runs one job end to end and reports over the line protocol.
pub struct JobRunner<W: Write> {
    resolver: ModelResolver,
    runner_dir: PathBuf,
    protocol: ProtocolWriter<W>,
    states: Vec<JobState>,
}

impl<W: Write> JobRunner<W> {
    /// `runner_dir` anchors the default model location.
    pub fn new(resolver: ModelResolver, runner_dir: impl Into<PathBuf>, out: W) -> Self {
        Self {
            resolver,
            runner_dir: runner_dir.into(),
            protocol: ProtocolWriter::new(out),
            states: vec![JobState::Idle],
        }
    }

    pub fn state(&self) -> JobState {
        self.states.last().copied().unwrap_or(JobState::Idle)
    }

    /// Every state entered so far, starting with `Idle`.
    pub fn states(&self) -> &[JobState] {
        &self.states
    }

    pub fn into_output(self) -> W {
        self.protocol.into_inner()
    }

    /// Returns the metadata sidecar path. Nothing is left on disk when this
    /// fails.
    pub fn run(&mut self, params: &JobParameters) -> Result<PathBuf> {
        let started = Instant::now();
        match self.execute(params) {
            Ok(metadata) => {
                info!(elapsed = ?started.elapsed(), metadata = %metadata.display(), "job finished");
                Ok(metadata)
            }
            Err(err) => {
                error!(state = ?self.state(), error = %err, "job failed");
                self.states.push(JobState::Failed);
                Err(err)
            }
        }
    }

    fn enter(&mut self, state: JobState) -> Result<()> {
        debug!(from = ?self.state(), to = ?state, "job state");
        self.states.push(state);
        if let Some(progress) = state.progress() {
            self.protocol.progress(progress)?;
        }
        Ok(())
    }

    fn execute(&mut self, params: &JobParameters) -> Result<PathBuf> {
        params.validate()?;
        if self.state() != JobState::Idle {
            return Err(SegError::Configuration {
                message: "a runner executes exactly one job".to_string(),
            });
        }

        let image = load_image_buffer(&params.input_path)?;
        let (height, width, _) = image.dim();
        info!(input = %params.input_path.display(), height, width, "input decoded");
        self.enter(JobState::ExportedInput)?;

        let palette = Palette::with_classes(params.num_classes);
        let source = if params.use_api {
            Source::Remote(RemotePredictor::new(
                &params.api_url,
                Duration::from_secs(params.api_timeout_secs),
            )?)
        } else {
            let model_path = params.model_path_or_default(&self.runner_dir);
            Source::Local(self.resolver.resolve(&model_path)?)
        };
        self.enter(JobState::ModelResolved)?;

        self.enter(JobState::Predicting)?;
        let mask = match &source {
            Source::Local(model) => {
                info!(kind = %model.kind, size_mb = model.size_mb, "predicting locally");
                let scores = TiledEngine::new(params.patch_size, params.subdivisions, params.num_classes)?
                    .with_batch_size(params.batch_size)
                    .infer(image.view(), model.predictor.as_ref())?;
                argmax(scores.view())
            }
            Source::Remote(remote) => {
                let rgb = to_rgb_image(image.view()).ok_or_else(|| SegError::ExportFailure {
                    path: params.input_path.clone(),
                    operation: "re-encode input".to_string(),
                    source: "buffer does not match image dimensions".into(),
                })?;
                let result = remote.predict_image(
                    &DynamicImage::ImageRgb8(rgb),
                    params.patch_size,
                    params.subdivisions,
                )?;
                if result.dimensions() != (width as u32, height as u32) {
                    warn!(
                        expected = ?(width, height),
                        received = ?result.dimensions(),
                        "prediction service changed the image size"
                    );
                }
                palette.classify(&result)
            }
        };

        let rgb = palette.colorize(mask.view());
        self.enter(JobState::Colorized)?;

        let metadata = persist(params, mask.view(), &rgb, &palette)?;
        self.enter(JobState::Persisted)?;

        self.protocol.result(&metadata)?;
        self.enter(JobState::Done)?;
        Ok(metadata)
    }
}

/// Writes the mask artifacts and the sidecar. Files written before a failure
/// are removed.
fn persist(params: &JobParameters, mask: ArrayView2<u8>, rgb: &RgbImage, palette: &Palette) -> Result<PathBuf> {
    let outputs = params.absolute_outputs()?;
    let georeference = params.georeference();
    let mut written = Vec::new();

    let result = (|| -> Result<()> {
        if let Some(parent) = outputs.metadata.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| SegError::FileSystem {
                path: parent.to_path_buf(),
                operation: "create output directory".to_string(),
                source: e,
            })?;
        }

        match &georeference {
            Some(geo) => {
                written.push(outputs.geotiff.clone());
                write_geotiff(&outputs.geotiff, mask, geo)?;
            }
            None => {
                let (height, width) = mask.dim();
                let gray = GrayImage::from_raw(width as u32, height as u32, mask.iter().copied().collect())
                    .ok_or_else(|| SegError::invalid_argument("mask", "inconsistent dimensions"))?;
                written.push(outputs.mask.clone());
                save_png(&gray, &outputs.mask)?;
                written.push(outputs.rgb.clone());
                save_png(rgb, &outputs.rgb)?;
            }
        }

        let artifacts = written.clone();
        written.push(outputs.metadata.clone());
        JobMetadata::new(&params.output_path, palette, georeference.is_some(), artifacts)
            .write(&outputs.metadata)
    })();

    match result {
        Ok(()) => {
            info!(files = ?written, "outputs written");
            Ok(outputs.metadata)
        }
        Err(err) => {
            remove_best_effort(&written);
            Err(err)
        }
    }
}

fn save_png<P>(image: &ImageBuffer<P, Vec<u8>>, path: &Path) -> Result<()>
where
    P: PixelWithColorType<Subpixel = u8>,
{
    image
        .save_with_format(path, ImageFormat::Png)
        .map_err(|e| SegError::FileSystem {
            path: path.to_path_buf(),
            operation: "write PNG".to_string(),
            source: std::io::Error::other(e),
        })
}

/// Removes files, logging failures instead of returning them.
pub fn remove_best_effort(paths: &[PathBuf]) {
    for path in paths {
        match fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "cleanup failed"),
        }
    }
}
