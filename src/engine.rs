use ndarray::prelude::*;
use tracing::debug;

use crate::errors::{Result, SegError};
use crate::predictor::{check_scores, Predictor};
use crate::tiling::{tile_origins, TileGeometry, TileOrigin};
use crate::weights::build_weight_matrix;

/// Lower bound on accumulated weight when normalizing.
pub const EPSILON: f32 = 1e-8;

/// Splits an image into overlapping tiles, predicts them in batches and
/// blends the per-tile scores back into one `(H, W, nb_classes)` array.
#[derive(Debug, Clone)]
pub struct TiledEngine {
    geometry: TileGeometry,
    nb_classes: usize,
    batch_size: Option<usize>,
}

impl TiledEngine {
    pub fn new(window_size: usize, subdivisions: usize, nb_classes: usize) -> Result<Self> {
        if nb_classes == 0 {
            return Err(SegError::invalid_argument(
                "nb_classes",
                "must be greater than zero",
            ));
        }
        Ok(Self {
            geometry: TileGeometry::new(window_size, subdivisions)?,
            nb_classes,
            batch_size: None,
        })
    }

    /// Caps the number of tiles per predictor call. Without a cap every tile
    /// goes into a single call.
    pub fn with_batch_size(mut self, batch_size: Option<usize>) -> Self {
        self.batch_size = batch_size.filter(|&n| n > 0);
        self
    }

    pub fn geometry(&self) -> &TileGeometry {
        &self.geometry
    }

    pub fn infer(&self, image: ArrayView3<u8>, predictor: &dyn Predictor) -> Result<Array3<f32>> {
        let (height, width, channels) = image.dim();
        if channels != 3 {
            return Err(SegError::invalid_argument(
                "image",
                format!("expected 3 channels, got {channels}"),
            ));
        }
        if height == 0 || width == 0 {
            return Err(SegError::invalid_argument("image", "is empty"));
        }

        let window = self.geometry.window_size;
        if height <= window && width <= window {
            return self.infer_single(image, predictor);
        }
        if height < window || width < window {
            let padded = pad(image, height.max(window), width.max(window));
            let scores = self.infer_tiled(padded.view(), predictor)?;
            return Ok(scores.slice(s![..height, ..width, ..]).to_owned());
        }
        self.infer_tiled(image, predictor)
    }

    fn infer_single(&self, image: ArrayView3<u8>, predictor: &dyn Predictor) -> Result<Array3<f32>> {
        let (height, width, _) = image.dim();
        let window = self.geometry.window_size;
        let padded = pad(image, window, window);

        debug!(height, width, window, "image fits in one tile");
        let scores = predictor.predict(padded.insert_axis(Axis(0)).view())?;
        check_scores(&scores, [1, window, window, self.nb_classes])?;

        Ok(scores.slice(s![0, ..height, ..width, ..]).to_owned())
    }

    fn infer_tiled(&self, image: ArrayView3<u8>, predictor: &dyn Predictor) -> Result<Array3<f32>> {
        let (height, width, _) = image.dim();
        let TileGeometry {
            window_size: window,
            overlap,
            step,
        } = self.geometry;

        let origins = tile_origins(height, width, &self.geometry)?;
        let weight = build_weight_matrix(window, overlap)?;
        let mut prediction = Array3::<f32>::zeros((height, width, self.nb_classes));
        let mut weights = Array3::<f32>::zeros((height, width, 1));

        let batch_size = self.batch_size.unwrap_or(origins.len()).max(1);
        debug!(
            tiles = origins.len(),
            window, overlap, step, batch_size, "tiling image"
        );

        for chunk in origins.chunks(batch_size) {
            let patches = extract_patches(image, chunk, window);
            let scores = predictor.predict(patches.view())?;
            check_scores(&scores, [chunk.len(), window, window, self.nb_classes])?;

            for (tile_scores, origin) in scores.outer_iter().zip(chunk) {
                let (ys, xs) = (origin.y..origin.y + window, origin.x..origin.x + window);
                let mut target = prediction.slice_mut(s![ys.clone(), xs.clone(), ..]);
                target += &(&tile_scores * &weight);
                let mut mass = weights.slice_mut(s![ys, xs, ..]);
                mass += &weight;
            }
        }

        weights.mapv_inplace(|w| w.max(EPSILON));
        prediction /= &weights;
        Ok(prediction)
    }
}

/// Free-function form of [`TiledEngine::infer`] with every tile in one call.
pub fn predict_tiled(
    image: ArrayView3<u8>,
    window_size: usize,
    subdivisions: usize,
    nb_classes: usize,
    predictor: &dyn Predictor,
) -> Result<Array3<f32>> {
    TiledEngine::new(window_size, subdivisions, nb_classes)?.infer(image, predictor)
}

/// Zero-pads on the bottom/right up to `height x width`.
fn pad(image: ArrayView3<u8>, height: usize, width: usize) -> Array3<u8> {
    let (h, w, c) = image.dim();
    let mut padded = Array3::<u8>::zeros((height, width, c));
    padded.slice_mut(s![..h, ..w, ..]).assign(&image);
    padded
}

fn extract_patches(image: ArrayView3<u8>, origins: &[TileOrigin], window: usize) -> Array4<u8> {
    let channels = image.dim().2;
    let mut patches = Array4::<u8>::zeros((origins.len(), window, window, channels));
    for (mut patch, origin) in patches.outer_iter_mut().zip(origins) {
        patch.assign(&image.slice(s![
            origin.y..origin.y + window,
            origin.x..origin.x + window,
            ..
        ]));
    }
    patches
}
