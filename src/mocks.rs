use std::sync::atomic::{AtomicUsize, Ordering};

use ndarray::prelude::*;

use crate::errors::{Result, SegError};
use crate::predictor::Predictor;

/// テスト用: 全画素で同じクラスに確率 1 を返す
#[derive(Debug)]
pub struct ConstantClassPredictor {
    pub nb_classes: usize,
    pub class: usize,
    calls: AtomicUsize,
}

impl ConstantClassPredictor {
    pub const fn new(nb_classes: usize, class: usize) -> Self {
        Self {
            nb_classes,
            class,
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of `predict` invocations so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

impl Predictor for ConstantClassPredictor {
    fn predict(&self, patches: ArrayView4<u8>) -> Result<Array4<f32>> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let (n, h, w, _) = patches.dim();
        let mut scores = Array4::<f32>::zeros((n, h, w, self.nb_classes));
        if self.class < self.nb_classes {
            scores.index_axis_mut(Axis(3), self.class).fill(1.0);
        }
        Ok(scores)
    }
}

/// テスト用: 入力画素値をそのままクラススコアとして返す (3 クラス)
#[derive(Debug, Clone, Copy)]
pub struct PixelEchoPredictor;

impl Predictor for PixelEchoPredictor {
    fn predict(&self, patches: ArrayView4<u8>) -> Result<Array4<f32>> {
        Ok(patches.mapv(f32::from))
    }
}

/// テスト用: 常に失敗する
#[derive(Debug, Clone, Copy)]
pub struct FailingPredictor;

impl Predictor for FailingPredictor {
    fn predict(&self, _patches: ArrayView4<u8>) -> Result<Array4<f32>> {
        Err(SegError::prediction(
            "mock inference",
            std::io::Error::other("backend unavailable"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_predictor_one_hot() -> Result<()> {
        let mock = ConstantClassPredictor::new(6, 2);
        let scores = mock.predict(Array4::<u8>::zeros((2, 4, 4, 3)).view())?;
        assert_eq!(scores.shape(), &[2, 4, 4, 6]);
        assert_eq!(scores.sum(), 32.0);
        assert!(scores.index_axis(Axis(3), 2).iter().all(|&v| v == 1.0));
        assert_eq!(mock.calls(), 1);
        Ok(())
    }

    #[test]
    fn test_echo_predictor_keeps_values() -> Result<()> {
        let patches = Array4::from_shape_fn((1, 2, 2, 3), |(_, y, x, c)| (y * 6 + x * 3 + c) as u8);
        let scores = PixelEchoPredictor.predict(patches.view())?;
        assert_eq!(scores[[0, 1, 1, 2]], 11.0);
        Ok(())
    }

    #[test]
    fn test_failing_predictor() {
        let result = FailingPredictor.predict(Array4::<u8>::zeros((1, 1, 1, 3)).view());
        assert!(matches!(result, Err(SegError::PredictionFailure { .. })));
    }
}
