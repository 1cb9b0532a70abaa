use image::{Rgb, RgbImage};
use ndarray::{parallel::prelude::*, prelude::*, Zip};
use rayon::prelude::*;

/// Colour and display name of every segmentation class, indexed by class id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Palette {
    colors: Vec<[u8; 3]>,
    names: Vec<String>,
}

impl Default for Palette {
    fn default() -> Self {
        Self::new(
            vec![
                [60, 16, 152],
                [132, 41, 246],
                [110, 193, 228],
                [254, 221, 58],
                [226, 169, 41],
                [155, 155, 155],
            ],
            ["Building", "Land", "Road", "Vegetation", "Water", "Unlabeled"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        )
    }
}

impl Palette {
    /// Classes without a name are called `Class <i>`.
    pub fn new(colors: Vec<[u8; 3]>, mut names: Vec<String>) -> Self {
        names.truncate(colors.len());
        for i in names.len()..colors.len() {
            names.push(format!("Class {i}"));
        }
        Self { colors, names }
    }

    /// Default palette resized to `nb_classes`; extra classes reuse the
    /// default colours cyclically.
    pub fn with_classes(nb_classes: usize) -> Self {
        let base = Self::default();
        let colors = base.colors.iter().copied().cycle().take(nb_classes).collect();
        Self::new(colors, base.names)
    }

    pub fn len(&self) -> usize {
        self.colors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.colors.is_empty()
    }

    pub fn colors(&self) -> &[[u8; 3]] {
        &self.colors
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Maps class indices to RGB. Indices outside the palette become black.
    pub fn colorize(&self, mask: ArrayView2<u8>) -> RgbImage {
        let (height, width) = mask.dim();
        let mut raw = vec![0u8; height * width * 3];
        raw.par_chunks_mut(width.max(1) * 3)
            .zip(mask.axis_iter(Axis(0)).into_par_iter())
            .for_each(|(row, classes)| {
                for (pixel, &class) in row.chunks_exact_mut(3).zip(classes.iter()) {
                    if let Some(color) = self.colors.get(class as usize) {
                        pixel.copy_from_slice(color);
                    }
                }
            });
        RgbImage::from_raw(width as u32, height as u32, raw)
            .unwrap_or_else(|| RgbImage::new(width as u32, height as u32))
    }

    /// Reverse of [`Palette::colorize`] by exact colour match; pixels with no
    /// matching colour get class 0.
    pub fn classify(&self, image: &RgbImage) -> Array2<u8> {
        let (width, height) = image.dimensions();
        let mut mask = Array2::<u8>::zeros((height as usize, width as usize));
        mask.axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(y, mut row)| {
                for (x, class) in row.iter_mut().enumerate() {
                    let Rgb(rgb) = *image.get_pixel(x as u32, y as u32);
                    *class = self
                        .colors
                        .iter()
                        .position(|c| *c == rgb)
                        .unwrap_or(0) as u8;
                }
            });
        mask
    }
}

/// Per-pixel index of the highest class score; ties go to the lowest index.
pub fn argmax(scores: ArrayView3<f32>) -> Array2<u8> {
    let (height, width, _) = scores.dim();
    let mut mask = Array2::<u8>::zeros((height, width));
    Zip::from(&mut mask)
        .and(scores.lanes(Axis(2)))
        .par_for_each(|class, lane| {
            let mut best = 0usize;
            for (i, &v) in lane.iter().enumerate() {
                if v > lane[best] {
                    best = i;
                }
            }
            *class = best as u8;
        });
    mask
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_palette_has_six_named_classes() {
        let palette = Palette::default();
        assert_eq!(palette.len(), 6);
        assert_eq!(palette.names()[4], "Water");
        assert_eq!(palette.colors()[0], [60, 16, 152]);
    }

    #[test]
    fn unnamed_classes_get_generic_names() {
        let palette = Palette::new(vec![[0, 0, 0], [1, 1, 1]], vec!["Sky".into()]);
        assert_eq!(palette.names(), &["Sky".to_string(), "Class 1".to_string()]);
    }

    #[test]
    fn resized_palette_cycles_colours() {
        let palette = Palette::with_classes(8);
        assert_eq!(palette.len(), 8);
        assert_eq!(palette.colors()[6], palette.colors()[0]);
        assert_eq!(palette.names()[7], "Class 7");
        assert_eq!(Palette::with_classes(2).names()[1], "Land");
    }

    #[test]
    fn argmax_prefers_first_of_equal_scores() {
        let mut scores = Array3::<f32>::zeros((2, 3, 4));
        scores[[0, 0, 2]] = 0.9;
        scores[[1, 2, 3]] = 0.5;
        scores[[1, 2, 1]] = 0.5;
        let mask = argmax(scores.view());
        assert_eq!(mask, array![[2, 0, 0], [0, 0, 1]]);
    }

    #[test]
    fn colorize_then_classify_recovers_mask() {
        let palette = Palette::default();
        let mask = Array2::from_shape_fn((5, 7), |(y, x)| ((y * 7 + x) % 6) as u8);
        let rgb = palette.colorize(mask.view());
        assert_eq!(rgb.dimensions(), (7, 5));
        assert_eq!(rgb.get_pixel(1, 0).0, palette.colors()[1]);
        assert_eq!(palette.classify(&rgb), mask);
    }

    #[test]
    fn unknown_colours_fall_back_to_class_zero() {
        let palette = Palette::default();
        let mut rgb = RgbImage::from_pixel(2, 2, Rgb([155, 155, 155]));
        rgb.put_pixel(1, 1, Rgb([1, 2, 3]));
        assert_eq!(palette.classify(&rgb), array![[5, 5], [5, 0]]);
    }
}
