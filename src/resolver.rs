use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::errors::{Result, SegError};
use crate::predictor::{
    Backbone, BackendKind, GraphPredictor, LoadError, OrtRuntime, Predictor, Signature,
};

/// Graph file inside a frozen-graph directory.
pub const FROZEN_GRAPH_FILE: &str = "model.onnx";
/// Optional serving signature next to [`FROZEN_GRAPH_FILE`].
pub const SIGNATURE_FILE: &str = "signature.json";

/// A loaded model ready for prediction, shared by every caller that asks for
/// the same artifact.
#[derive(Clone)]
pub struct ResolvedModel {
    pub path: PathBuf,
    pub predictor: Arc<dyn Predictor>,
    pub kind: BackendKind,
    pub size_mb: f64,
}

impl std::fmt::Debug for ResolvedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedModel")
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("size_mb", &self.size_mb)
            .finish_non_exhaustive()
    }
}

/// Turns a model artifact into a predictor for an already chosen backend.
pub trait ModelLoader: Send + Sync {
    fn load(&self, path: &Path, kind: BackendKind)
        -> std::result::Result<Arc<dyn Predictor>, LoadError>;
}

/// Loads every backend through ONNX Runtime.
#[derive(Debug, Clone)]
pub struct OrtLoader {
    pub device_id: i32,
    pub backbone: Backbone,
}

impl OrtLoader {
    pub const fn new(device_id: i32, backbone: Backbone) -> Self {
        Self {
            device_id,
            backbone,
        }
    }
}

impl ModelLoader for OrtLoader {
    fn load(
        &self,
        path: &Path,
        kind: BackendKind,
    ) -> std::result::Result<Arc<dyn Predictor>, LoadError> {
        let predictor = match kind {
            BackendKind::DenseGraph => {
                let runtime = OrtRuntime::load(path, self.device_id)?;
                GraphPredictor::dense(Box::new(runtime), self.backbone)
            }
            BackendKind::FrozenGraph => {
                let mut runtime = OrtRuntime::load(&path.join(FROZEN_GRAPH_FILE), self.device_id)?;
                let signature = read_signature(path)?;
                if let Some(signature) = &signature {
                    runtime.bind_signature(signature)?;
                }
                GraphPredictor::frozen(Box::new(runtime), self.backbone, signature)
            }
            BackendKind::Quantized => {
                let runtime = OrtRuntime::load(path, self.device_id)?;
                GraphPredictor::quantized_from_metadata(Box::new(runtime), self.backbone)
            }
        };
        Ok(Arc::new(predictor))
    }
}

fn read_signature(dir: &Path) -> std::result::Result<Option<Signature>, LoadError> {
    let path = dir.join(SIGNATURE_FILE);
    if !path.is_file() {
        return Ok(None);
    }
    let text = fs::read_to_string(&path)?;
    Ok(Some(serde_json::from_str(&text)?))
}

/// Backend implied by an artifact path: `.tflite` is quantized, `.h5`,
/// `.keras` and `.onnx` are dense graphs, anything else is treated as a
/// frozen-graph directory.
pub fn backend_for(path: &Path) -> BackendKind {
    let suffix = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match suffix.as_deref() {
        Some("tflite") => BackendKind::Quantized,
        Some("h5" | "keras" | "onnx") => BackendKind::DenseGraph,
        _ => BackendKind::FrozenGraph,
    }
}

/// Size of a file, or of every file under a directory, in MiB.
pub fn artifact_size_mb(path: &Path) -> Result<f64> {
    let bytes = if path.is_dir() {
        WalkDir::new(path)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| e.metadata().ok())
            .map(|m| m.len())
            .sum()
    } else {
        fs::metadata(path)
            .map_err(|e| SegError::FileSystem {
                path: path.to_path_buf(),
                operation: "model size".to_string(),
                source: e,
            })?
            .len()
    };
    Ok(bytes as f64 / (1024.0 * 1024.0))
}

/// Resolves model paths to predictors, loading each artifact at most once.
pub struct ModelResolver {
    loader: Box<dyn ModelLoader>,
    cache: Mutex<HashMap<PathBuf, ResolvedModel>>,
}

impl ModelResolver {
    pub fn new(loader: impl ModelLoader + 'static) -> Self {
        Self {
            loader: Box::new(loader),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn resolve(&self, path: &Path) -> Result<ResolvedModel> {
        if !path.exists() {
            return Err(SegError::ModelNotFound {
                path: path.to_path_buf(),
            });
        }
        let key = fs::canonicalize(path).map_err(|e| SegError::FileSystem {
            path: path.to_path_buf(),
            operation: "canonicalize model path".to_string(),
            source: e,
        })?;

        // held across the load so concurrent callers never load twice
        let mut cache = self.cache.lock();
        if let Some(model) = cache.get(&key) {
            debug!(path = %key.display(), "model cache hit");
            return Ok(model.clone());
        }

        // the suffix lives on the caller's path; a symlink target may have none
        let kind = backend_for(path);
        let predictor = self
            .loader
            .load(&key, kind)
            .map_err(|source| SegError::UnsupportedFormat {
                path: key.clone(),
                source,
            })?;
        let size_mb = artifact_size_mb(&key)?;
        info!(path = %key.display(), %kind, size_mb, "model loaded");

        let model = ResolvedModel {
            path: key.clone(),
            predictor,
            kind,
            size_mb,
        };
        cache.insert(key, model.clone());
        Ok(model)
    }

    pub fn cached(&self) -> usize {
        self.cache.lock().len()
    }
}
