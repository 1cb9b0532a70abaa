use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SegError};
use crate::geotiff::GeoReference;
use crate::palette::Palette;

/// Default model location relative to the runner executable.
pub const DEFAULT_MODEL: &str = "models/best_model.onnx";

const fn default_patch_size() -> usize {
    256
}

const fn default_subdivisions() -> usize {
    2
}

const fn default_num_classes() -> usize {
    6
}

fn default_backbone() -> String {
    "efficientnetb1".to_string()
}

const fn default_api_timeout() -> u64 {
    300
}

/// Everything one inference job needs. Written once by the supervisor and
/// read once by the runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobParameters {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    #[serde(default)]
    pub use_api: bool,
    #[serde(default)]
    pub api_url: String,
    #[serde(default)]
    pub model_path: String,
    #[serde(default = "default_patch_size")]
    pub patch_size: usize,
    #[serde(default = "default_subdivisions")]
    pub subdivisions: usize,
    #[serde(default)]
    pub crs: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub georeference_data: Option<GeoReference>,

    #[serde(default = "default_num_classes")]
    pub num_classes: usize,
    #[serde(default = "default_backbone")]
    pub backbone: String,
    #[serde(default)]
    pub device_id: i32,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default = "default_api_timeout")]
    pub api_timeout_secs: u64,
}

impl JobParameters {
    pub fn new(input_path: impl Into<PathBuf>, output_path: impl Into<PathBuf>) -> Self {
        Self {
            input_path: input_path.into(),
            output_path: output_path.into(),
            use_api: false,
            api_url: String::new(),
            model_path: String::new(),
            patch_size: default_patch_size(),
            subdivisions: default_subdivisions(),
            crs: None,
            georeference_data: None,
            num_classes: default_num_classes(),
            backbone: default_backbone(),
            device_id: 0,
            batch_size: None,
            api_timeout_secs: default_api_timeout(),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| SegError::FileSystem {
            path: path.to_path_buf(),
            operation: "read job parameters".to_string(),
            source: e,
        })?;
        let params: Self = serde_json::from_str(&text)?;
        params.validate()?;
        Ok(params)
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text).map_err(|e| SegError::FileSystem {
            path: path.to_path_buf(),
            operation: "write job parameters".to_string(),
            source: e,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.patch_size == 0 {
            return Err(SegError::invalid_argument(
                "patch_size",
                "must be greater than zero",
            ));
        }
        if self.subdivisions == 0 {
            return Err(SegError::invalid_argument("subdivisions", "must be at least 1"));
        }
        if self.num_classes == 0 || self.num_classes > 256 {
            return Err(SegError::invalid_argument(
                "num_classes",
                "must be between 1 and 256",
            ));
        }
        if self.use_api && self.api_url.trim().is_empty() {
            return Err(SegError::invalid_argument(
                "api_url",
                "is required when use_api is set",
            ));
        }
        Ok(())
    }

    /// `model_path`, or [`DEFAULT_MODEL`] under `runner_dir` when empty.
    pub fn model_path_or_default(&self, runner_dir: &Path) -> PathBuf {
        if self.model_path.trim().is_empty() {
            runner_dir.join(DEFAULT_MODEL)
        } else {
            PathBuf::from(&self.model_path)
        }
    }

    /// Georeference with the top-level `crs` filled in when the extent
    /// carries none.
    pub fn georeference(&self) -> Option<GeoReference> {
        let mut geo = self.georeference_data.clone()?;
        if geo.crs.as_deref().map_or(true, str::is_empty) {
            geo.crs = self.crs.clone();
        }
        Some(geo)
    }

    pub fn outputs(&self) -> OutputPaths {
        OutputPaths::for_output(&self.output_path)
    }

    /// [`Self::outputs`] anchored at the current directory when
    /// `output_path` is relative.
    pub fn absolute_outputs(&self) -> Result<OutputPaths> {
        let output = std::path::absolute(&self.output_path).map_err(|e| SegError::FileSystem {
            path: self.output_path.clone(),
            operation: "resolve output path".to_string(),
            source: e,
        })?;
        Ok(OutputPaths::for_output(&output))
    }
}

/// Files a job may write, all derived from `output_path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPaths {
    pub geotiff: PathBuf,
    pub mask: PathBuf,
    pub rgb: PathBuf,
    pub metadata: PathBuf,
}

impl OutputPaths {
    pub fn for_output(output_path: &Path) -> Self {
        let has_tif_extension = output_path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("tif") || e.eq_ignore_ascii_case("tiff"));
        let stem = if has_tif_extension {
            output_path.with_extension("")
        } else {
            output_path.to_path_buf()
        };
        let sibling = |suffix: &str| {
            let mut name = stem.as_os_str().to_os_string();
            name.push(suffix);
            PathBuf::from(name)
        };
        Self {
            geotiff: output_path.to_path_buf(),
            mask: sibling("_mask.png"),
            rgb: sibling("_rgb.png"),
            metadata: sibling("_metadata.json"),
        }
    }
}

/// Sidecar describing a finished job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMetadata {
    pub output_path: PathBuf,
    pub classes: Vec<[u8; 3]>,
    pub num_classes: usize,
    pub has_georef: bool,
    #[serde(default)]
    pub class_names: Vec<String>,
    /// Files actually written by the job.
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,
}

impl JobMetadata {
    pub fn new(output_path: &Path, palette: &Palette, has_georef: bool, artifacts: Vec<PathBuf>) -> Self {
        Self {
            output_path: output_path.to_path_buf(),
            classes: palette.colors().to_vec(),
            num_classes: palette.len(),
            has_georef,
            class_names: palette.names().to_vec(),
            artifacts,
        }
    }

    pub fn read(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| SegError::FileSystem {
            path: path.to_path_buf(),
            operation: "read metadata".to_string(),
            source: e,
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string(self)?;
        fs::write(path, text).map_err(|e| SegError::FileSystem {
            path: path.to_path_buf(),
            operation: "write metadata".to_string(),
            source: e,
        })
    }
}
