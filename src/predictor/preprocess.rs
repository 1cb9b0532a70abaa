use ndarray::prelude::*;
use serde::{Deserialize, Serialize};

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];
const CAFFE_BGR_MEAN: [f32; 3] = [103.939, 116.779, 123.68];

/// Channel normalization profile expected by a model's feature extractor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backbone {
    /// Samples are passed through unchanged.
    #[default]
    Identity,
    /// Scale to [0,1], then subtract the ImageNet mean and divide by its std.
    Torch,
    /// Scale to [-1,1].
    Tf,
    /// Swap RGB to BGR and subtract the ImageNet mean in 0..255 units.
    Caffe,
}

impl Backbone {
    /// Maps a backbone architecture name (e.g. `efficientnetb1`) to its profile.
    pub fn from_name(name: &str) -> Self {
        let name = name.to_ascii_lowercase();
        if name.starts_with("efficientnet") || name.starts_with("densenet") {
            Self::Torch
        } else if name.starts_with("mobilenet") || name.starts_with("inception") {
            Self::Tf
        } else if name.starts_with("vgg") {
            Self::Caffe
        } else {
            Self::Identity
        }
    }

    /// Applies the profile to a `(B,H,W,3)` batch of 8-bit patches.
    pub fn apply(&self, patches: ArrayView4<u8>) -> Array4<f32> {
        let mut x = patches.mapv(f32::from);
        match self {
            Self::Identity => {}
            Self::Torch => {
                for (c, mut channel) in x.axis_iter_mut(Axis(3)).enumerate() {
                    let (mean, std) = (IMAGENET_MEAN[c % 3], IMAGENET_STD[c % 3]);
                    channel.mapv_inplace(|v| (v / 255.0 - mean) / std);
                }
            }
            Self::Tf => x.mapv_inplace(|v| v / 127.5 - 1.0),
            Self::Caffe => {
                x.invert_axis(Axis(3));
                for (c, mut channel) in x.axis_iter_mut(Axis(3)).enumerate() {
                    let mean = CAFFE_BGR_MEAN[c % 3];
                    channel.mapv_inplace(|v| v - mean);
                }
            }
        }
        x
    }
}

/// Backbone normalization followed by the extra division by 255 every
/// backend applies before invocation.
pub fn prepare_batch(patches: ArrayView4<u8>, backbone: Backbone) -> Array4<f32> {
    let mut x = backbone.apply(patches);
    x.mapv_inplace(|v| v / 255.0);
    x
}
