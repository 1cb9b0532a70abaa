use ndarray::prelude::*;

use crate::errors::{Result, SegError};

/// Lowest weight on the outermost border row/column of a tile.
const FADE_START: f32 = 0.1;

/// Builds the per-pixel blending weights for one square tile.
///
/// The returned array has shape `(window_size, window_size, 1)` so it
/// broadcasts against `(window_size, window_size, nb_classes)` scores. Inside
/// the `overlap`-wide border each edge ramps linearly from 0.1 up to 1.0
/// towards the centre; corners get the product of both ramps. With
/// `overlap == 0` the matrix is all ones.
pub fn build_weight_matrix(window_size: usize, overlap: usize) -> Result<Array3<f32>> {
    if window_size == 0 {
        return Err(SegError::invalid_argument(
            "window_size",
            "must be greater than zero",
        ));
    }
    if overlap > window_size {
        return Err(SegError::invalid_argument(
            "overlap",
            format!("{overlap} exceeds window size {window_size}"),
        ));
    }

    let mut weight = Array3::<f32>::ones((window_size, window_size, 1));
    if overlap == 0 {
        return Ok(weight);
    }

    let fade = Array1::linspace(FADE_START, 1.0, overlap);
    let fade_rev = fade.slice(s![..;-1]).to_owned();

    let rows_top = fade.view().insert_axis(Axis(1)).insert_axis(Axis(2));
    let rows_bottom = fade_rev.view().insert_axis(Axis(1)).insert_axis(Axis(2));
    let cols_left = fade.view().insert_axis(Axis(0)).insert_axis(Axis(2));
    let cols_right = fade_rev.view().insert_axis(Axis(0)).insert_axis(Axis(2));

    let tail = window_size - overlap;
    {
        let mut top = weight.slice_mut(s![..overlap, .., ..]);
        top *= &rows_top;
    }
    {
        let mut bottom = weight.slice_mut(s![tail.., .., ..]);
        bottom *= &rows_bottom;
    }
    {
        let mut left = weight.slice_mut(s![.., ..overlap, ..]);
        left *= &cols_left;
    }
    {
        let mut right = weight.slice_mut(s![.., tail.., ..]);
        right *= &cols_right;
    }

    Ok(weight)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rotated_180(weight: &Array3<f32>) -> Array3<f32> {
        weight.slice(s![..;-1, ..;-1, ..]).to_owned()
    }

    #[test]
    fn zero_overlap_is_all_ones() -> Result<()> {
        let weight = build_weight_matrix(16, 0)?;
        assert_eq!(weight.shape(), &[16, 16, 1]);
        assert!(weight.iter().all(|&v| v == 1.0));
        Ok(())
    }

    #[test]
    fn entries_are_in_unit_interval_and_interior_is_exact() -> Result<()> {
        for window_size in [2usize, 7, 16, 33, 64] {
            for overlap in 0..=window_size / 2 {
                let weight = build_weight_matrix(window_size, overlap)?;
                assert!(weight.iter().all(|&v| v > 0.0 && v <= 1.0));

                let interior = weight.slice(s![
                    overlap..window_size - overlap,
                    overlap..window_size - overlap,
                    ..
                ]);
                assert!(interior.iter().all(|&v| v == 1.0));
            }
        }
        Ok(())
    }

    #[test]
    fn invariant_under_half_turn() -> Result<()> {
        for (window_size, overlap) in [(8, 4), (16, 5), (256, 128), (31, 10)] {
            let weight = build_weight_matrix(window_size, overlap)?;
            let rotated = rotated_180(&weight);
            for (a, b) in weight.iter().zip(rotated.iter()) {
                assert!((a - b).abs() < 1e-6);
            }
        }
        Ok(())
    }

    #[test]
    fn border_ramp_and_corner_product() -> Result<()> {
        let weight = build_weight_matrix(10, 4)?;
        // middle column only sees the vertical ramp
        assert!((weight[[0, 5, 0]] - 0.1).abs() < 1e-6);
        assert!((weight[[1, 5, 0]] - 0.4).abs() < 1e-6);
        assert!((weight[[3, 5, 0]] - 1.0).abs() < 1e-6);
        assert!((weight[[9, 5, 0]] - 0.1).abs() < 1e-6);
        assert!((weight[[0, 0, 0]] - 0.01).abs() < 1e-6);
        assert!((weight[[1, 0, 0]] - 0.04).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn single_pixel_overlap_uses_fade_start() -> Result<()> {
        let weight = build_weight_matrix(4, 1)?;
        assert!((weight[[0, 2, 0]] - FADE_START).abs() < 1e-6);
        assert_eq!(weight[[1, 1, 0]], 1.0);
        Ok(())
    }

    #[test]
    fn rejects_invalid_arguments() {
        assert!(matches!(
            build_weight_matrix(0, 0),
            Err(SegError::InvalidArgument { .. })
        ));
        assert!(matches!(
            build_weight_matrix(8, 9),
            Err(SegError::InvalidArgument { .. })
        ));
    }
}
