pub mod config;
pub mod engine;
pub mod errors;
pub mod geotiff;
pub mod logging;
pub mod palette;
pub mod params;
pub mod predictor;
pub mod protocol;
pub mod raster;
pub mod resolver;
pub mod runner;
pub mod sandbox;
pub mod supervisor;
pub mod tiling;
pub mod weights;

pub mod mocks;

pub use config::Config;
pub use engine::{predict_tiled, TiledEngine};
pub use errors::{Result, SegError};
pub use palette::Palette;
pub use params::{JobMetadata, JobParameters};
pub use predictor::{BackendKind, Predictor};
pub use protocol::JobEvent;
pub use resolver::{ModelResolver, OrtLoader, ResolvedModel};
pub use runner::{JobRunner, JobState};
pub use supervisor::Supervisor;
