use crate::errors::{Result, SegError};

/// Step and overlap derived from a window size and a subdivision count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGeometry {
    pub window_size: usize,
    pub overlap: usize,
    pub step: usize,
}

impl TileGeometry {
    /// `overlap = window_size / subdivisions` when `subdivisions > 1`, else 0.
    pub fn new(window_size: usize, subdivisions: usize) -> Result<Self> {
        if window_size == 0 {
            return Err(SegError::invalid_argument(
                "window_size",
                "must be greater than zero",
            ));
        }
        if subdivisions == 0 {
            return Err(SegError::invalid_argument(
                "subdivisions",
                "must be at least 1",
            ));
        }

        let overlap = if subdivisions > 1 {
            window_size / subdivisions
        } else {
            0
        };

        Ok(Self {
            window_size,
            overlap,
            step: window_size - overlap,
        })
    }
}

/// Top-left pixel coordinate of a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileOrigin {
    pub y: usize,
    pub x: usize,
}

/// Enumerates tile origins covering a `height x width` image.
///
/// Both dimensions must be at least `window_size`. The regular grid uses
/// stride `step`; when the last grid position does not end on the image
/// border a bottom row, a right column and (if both are uneven) the
/// bottom-right corner tile are appended.
pub fn tile_origins(height: usize, width: usize, geometry: &TileGeometry) -> Result<Vec<TileOrigin>> {
    let TileGeometry {
        window_size, step, ..
    } = *geometry;

    if height < window_size || width < window_size {
        return Err(SegError::invalid_argument(
            "image",
            format!("{height}x{width} is smaller than window size {window_size}"),
        ));
    }

    let last_y = height - window_size;
    let last_x = width - window_size;
    let ys: Vec<usize> = (0..=last_y).step_by(step).collect();
    let xs: Vec<usize> = (0..=last_x).step_by(step).collect();
    let uneven_y = last_y % step != 0;
    let uneven_x = last_x % step != 0;

    let mut origins = Vec::with_capacity((ys.len() + 1) * (xs.len() + 1));
    for &y in &ys {
        for &x in &xs {
            origins.push(TileOrigin { y, x });
        }
    }
    if uneven_y {
        origins.extend(xs.iter().map(|&x| TileOrigin { y: last_y, x }));
    }
    if uneven_x {
        origins.extend(ys.iter().map(|&y| TileOrigin { y, x: last_x }));
    }
    if uneven_y && uneven_x {
        origins.push(TileOrigin {
            y: last_y,
            x: last_x,
        });
    }

    Ok(origins)
}
