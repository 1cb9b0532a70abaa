use clap::Parser;
use std::path::PathBuf;

use crate::geotiff::GeoReference;
use crate::params::JobParameters;

/// Command line of the `tileseg` supervisor.
#[derive(Parser, Clone, Debug)]
#[command(version, about = "Tiled semantic segmentation of large rasters", long_about = None)]
pub struct Config {
    /// Raster to segment.
    pub input: PathBuf,

    /// Output GeoTIFF; PNG and metadata names are derived from it.
    #[arg(default_value = "output.tif")]
    pub output: PathBuf,

    /// Model artifact (.onnx, .h5, .keras, .tflite or a graph directory).
    #[arg(short, long, conflicts_with = "api_url")]
    pub model_path: Option<PathBuf>,

    /// Prediction service base URL; enables remote inference.
    #[arg(long)]
    pub api_url: Option<String>,

    #[arg(short, long, default_value_t = 256, value_parser = check_positive)]
    pub patch_size: usize,

    #[arg(short, long, default_value_t = 2, value_parser = check_positive)]
    pub subdivisions: usize,

    #[arg(long, default_value_t = 6, value_parser = check_positive)]
    pub num_classes: usize,

    #[arg(long, default_value = "efficientnetb1")]
    pub backbone: String,

    #[arg(short, long, default_value_t = 0)]
    pub device_id: i32,

    /// Tiles per predictor call; all tiles at once when omitted.
    #[arg(short, long, value_parser = check_positive)]
    pub batch_size: Option<usize>,

    /// Coordinate reference system of the input, e.g. EPSG:32633.
    #[arg(long)]
    pub crs: Option<String>,

    /// Georeference the output to this extent.
    #[arg(
        long,
        num_args = 4,
        value_names = ["XMIN", "XMAX", "YMIN", "YMAX"],
        allow_negative_numbers = true
    )]
    pub extent: Option<Vec<f64>>,

    #[arg(long, default_value_t = 300)]
    pub api_timeout_secs: u64,

    /// Runner executable; defaults to `tileseg-runner` next to this binary.
    #[arg(long)]
    pub runner: Option<PathBuf>,
}

impl Config {
    pub fn to_params(&self) -> JobParameters {
        let mut params = JobParameters::new(&self.input, &self.output);
        if let Some(api_url) = &self.api_url {
            params.use_api = true;
            params.api_url = api_url.clone();
        }
        if let Some(model_path) = &self.model_path {
            params.model_path = model_path.to_string_lossy().into_owned();
        }
        params.patch_size = self.patch_size;
        params.subdivisions = self.subdivisions;
        params.num_classes = self.num_classes;
        params.backbone = self.backbone.clone();
        params.device_id = self.device_id;
        params.batch_size = self.batch_size;
        params.crs = self.crs.clone();
        params.api_timeout_secs = self.api_timeout_secs;
        params.georeference_data = match self.extent.as_deref() {
            Some(&[xmin, xmax, ymin, ymax]) => Some(GeoReference {
                extent_xmin: xmin,
                extent_xmax: xmax,
                extent_ymin: ymin,
                extent_ymax: ymax,
                crs: self.crs.clone(),
            }),
            _ => None,
        };
        params
    }
}

fn check_positive(s: &str) -> Result<usize, String> {
    let value: usize = s.parse().map_err(|_| format!("{s} is not a number"))?;
    if value == 0 {
        return Err("must be greater than zero".to_string());
    }
    Ok(value)
}
