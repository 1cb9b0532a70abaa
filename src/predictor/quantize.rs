use ndarray::prelude::*;
use num_traits::{Bounded, NumCast};

/// Affine quantization parameters of one tensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantParams {
    pub scale: f32,
    pub zero_point: i32,
}

impl QuantParams {
    /// Returns `None` for a zero or non-finite scale, which marks the tensor
    /// as effectively float.
    pub fn new(scale: f32, zero_point: i32) -> Option<Self> {
        (scale != 0.0 && scale.is_finite()).then_some(Self { scale, zero_point })
    }

    /// `x_q = round(x / scale) + zero_point`, saturated to the range of `T`.
    pub fn quantize<T, D>(&self, x: &Array<f32, D>) -> Array<T, D>
    where
        T: Bounded + NumCast + Copy,
        D: Dimension,
    {
        let lo = T::min_value().to_f32().unwrap_or(f32::MIN);
        let hi = T::max_value().to_f32().unwrap_or(f32::MAX);
        x.mapv(|v| {
            let q = (v / self.scale).round() + self.zero_point as f32;
            T::from(q.clamp(lo, hi)).unwrap_or_else(T::min_value)
        })
    }

    /// `y = (y_q - zero_point) * scale`.
    pub fn dequantize<D: Dimension>(&self, y: &Array<f32, D>) -> Array<f32, D> {
        let zero_point = self.zero_point as f32;
        y.mapv(|v| (v - zero_point) * self.scale)
    }
}

/// Plain saturating cast used when the input tensor is integer typed but the
/// model carries no quantization parameters.
pub fn cast_saturating<T, D>(x: &Array<f32, D>) -> Array<T, D>
where
    T: Bounded + NumCast + Copy,
    D: Dimension,
{
    let lo = T::min_value().to_f32().unwrap_or(f32::MIN);
    let hi = T::max_value().to_f32().unwrap_or(f32::MAX);
    x.mapv(|v| T::from(v.clamp(lo, hi)).unwrap_or_else(T::min_value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_scale_disables_quantization() {
        assert!(QuantParams::new(0.0, 3).is_none());
        assert!(QuantParams::new(f32::NAN, 0).is_none());
        assert!(QuantParams::new(0.5, 0).is_some());
    }

    #[test]
    fn quantize_rounds_and_saturates() {
        let params = QuantParams::new(0.25, 0).unwrap();
        let x = array![0.0f32, 0.3, 0.375, 1.0, 100.0, -1.0];
        let q: Array1<u8> = params.quantize(&x);
        assert_eq!(q, array![0u8, 1, 2, 4, 255, 0]);
    }

    #[test]
    fn signed_zero_point_shifts_range() {
        let params = QuantParams::new(1.0 / 255.0, -128).unwrap();
        let x = array![0.0f32, 1.0];
        let q: Array1<i8> = params.quantize(&x);
        assert_eq!(q, array![-128i8, 127]);
    }

    #[test]
    fn dequantize_inverts_quantize_within_one_step() {
        let params = QuantParams::new(0.02, 7).unwrap();
        let x = Array1::linspace(0.0f32, 2.0, 41);
        let q: Array1<u8> = params.quantize(&x);
        let back = params.dequantize(&q.mapv(|v| v as f32));
        for (a, b) in x.iter().zip(back.iter()) {
            assert!((a - b).abs() <= params.scale / 2.0 + 1e-6);
        }
    }
}
