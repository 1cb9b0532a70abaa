pub mod preprocess;
pub mod quantize;
pub mod remote;
pub mod runtime;

use std::fmt;

use ndarray::prelude::*;
use ndarray::{IxDyn, Slice};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::errors::{Result, SegError};
pub use preprocess::{prepare_batch, Backbone};
pub use quantize::QuantParams;
pub use remote::RemotePredictor;
pub use runtime::{
    Binding, ElementType, GraphRuntime, LoadError, OrtRuntime, Signature, TensorData, TensorSpec,
};

/// Per-patch class scorer.
///
/// Takes a `(B,H,W,3)` batch of 8-bit patches and returns `(B,H,W,nb_classes)`
/// float scores. Must accept any batch size on every call.
pub trait Predictor: Send + Sync {
    fn predict(&self, patches: ArrayView4<u8>) -> Result<Array4<f32>>;
}

impl<F> Predictor for F
where
    F: Fn(ArrayView4<u8>) -> Result<Array4<f32>> + Send + Sync,
{
    fn predict(&self, patches: ArrayView4<u8>) -> Result<Array4<f32>> {
        self(patches)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    DenseGraph,
    FrozenGraph,
    Quantized,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::DenseGraph => "dense-graph",
            Self::FrozenGraph => "frozen-graph",
            Self::Quantized => "quantized",
        };
        f.write_str(name)
    }
}

/// Axis order a graph expects for image tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    Nhwc,
    Nchw,
}

impl Layout {
    /// NCHW when axis 1 is the only 3-wide axis of a rank-4 shape.
    pub fn detect(shape: &[i64]) -> Self {
        match shape {
            [_, 3, _, w] if *w != 3 => Self::Nchw,
            _ => Self::Nhwc,
        }
    }

    fn to_model<T: Clone>(self, x: Array4<T>) -> ArrayD<T> {
        match self {
            Self::Nhwc => x.into_dyn(),
            Self::Nchw => x
                .permuted_axes([0, 3, 1, 2])
                .as_standard_layout()
                .into_owned()
                .into_dyn(),
        }
    }

    fn from_model(self, y: ArrayD<f32>) -> Result<Array4<f32>> {
        let y = y.into_dimensionality::<Ix4>()?;
        Ok(match self {
            Self::Nhwc => y,
            Self::Nchw => y
                .permuted_axes([0, 2, 3, 1])
                .as_standard_layout()
                .into_owned(),
        })
    }
}

/// In-memory floating-point graph, bound positionally.
pub struct DenseGraph {
    runtime: Mutex<Box<dyn GraphRuntime>>,
    backbone: Backbone,
    layout: Layout,
}

/// Serialized graph invoked through a named input/output signature.
pub struct FrozenGraph {
    runtime: Mutex<Box<dyn GraphRuntime>>,
    backbone: Backbone,
    layout: Layout,
    signature: Signature,
}

/// Fixed-point graph with affine (de)quantization around every call.
pub struct QuantizedGraph {
    runtime: Mutex<Box<dyn GraphRuntime>>,
    backbone: Backbone,
    layout: Layout,
    input_quant: Option<QuantParams>,
    output_quant: Option<QuantParams>,
}

/// The three local model backends, fixed once at resolve time.
pub enum GraphPredictor {
    Dense(DenseGraph),
    Frozen(FrozenGraph),
    Quantized(QuantizedGraph),
}

impl GraphPredictor {
    pub fn dense(runtime: Box<dyn GraphRuntime>, backbone: Backbone) -> Self {
        let layout = Layout::detect(&runtime.input().shape);
        Self::Dense(DenseGraph {
            runtime: Mutex::new(runtime),
            backbone,
            layout,
        })
    }

    /// The signature defaults to the graph's declared input/output names.
    pub fn frozen(
        runtime: Box<dyn GraphRuntime>,
        backbone: Backbone,
        signature: Option<Signature>,
    ) -> Self {
        let signature = signature.unwrap_or_else(|| Signature {
            input: runtime.input().name.clone(),
            output: runtime.output().name.clone(),
        });
        let layout = Layout::detect(&runtime.input().shape);
        Self::Frozen(FrozenGraph {
            runtime: Mutex::new(runtime),
            backbone,
            layout,
            signature,
        })
    }

    pub fn quantized(
        runtime: Box<dyn GraphRuntime>,
        backbone: Backbone,
        input_quant: Option<QuantParams>,
        output_quant: Option<QuantParams>,
    ) -> Self {
        let layout = Layout::detect(&runtime.input().shape);
        Self::Quantized(QuantizedGraph {
            runtime: Mutex::new(runtime),
            backbone,
            layout,
            input_quant,
            output_quant,
        })
    }

    /// Reads `input_scale`, `input_zero_point`, `output_scale` and
    /// `output_zero_point` from the graph metadata.
    pub fn quantized_from_metadata(runtime: Box<dyn GraphRuntime>, backbone: Backbone) -> Self {
        let input_quant = quant_from_metadata(runtime.as_ref(), "input");
        let output_quant = quant_from_metadata(runtime.as_ref(), "output");
        Self::quantized(runtime, backbone, input_quant, output_quant)
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Dense(_) => BackendKind::DenseGraph,
            Self::Frozen(_) => BackendKind::FrozenGraph,
            Self::Quantized(_) => BackendKind::Quantized,
        }
    }
}

impl Predictor for GraphPredictor {
    fn predict(&self, patches: ArrayView4<u8>) -> Result<Array4<f32>> {
        match self {
            Self::Dense(graph) => {
                let x = prepare_batch(patches, graph.backbone);
                let y = graph
                    .runtime
                    .lock()
                    .run(TensorData::F32(graph.layout.to_model(x)), &Binding::Positional)?;
                graph.layout.from_model(y.into_f32())
            }
            Self::Frozen(graph) => {
                let x = prepare_batch(patches, graph.backbone);
                let binding = Binding::Named(graph.signature.clone());
                let y = graph
                    .runtime
                    .lock()
                    .run(TensorData::F32(graph.layout.to_model(x)), &binding)?;
                graph.layout.from_model(y.into_f32())
            }
            Self::Quantized(graph) => graph.predict(patches),
        }
    }
}

impl QuantizedGraph {
    /// Graphs exported with a fixed batch are run in chunks of that size; the
    /// last chunk is zero-padded and its padding dropped from the output.
    fn predict(&self, patches: ArrayView4<u8>) -> Result<Array4<f32>> {
        let x = prepare_batch(patches, self.backbone);
        let x = self.layout.to_model(x);

        let mut graph = self.runtime.lock();
        let spec = graph.input().clone();
        let fixed = runtime::fixed_batch(&spec.shape, x.shape())?;
        let total = x.len_of(Axis(0));
        let step = fixed.unwrap_or(total).max(1);
        if fixed.is_some_and(|b| b != total) {
            debug!(declared = step, total, "running quantized graph in fixed-size chunks");
        }

        let mut outputs = Vec::with_capacity(total.div_ceil(step));
        for part in x.axis_chunks_iter(Axis(0), step) {
            let n = part.len_of(Axis(0));
            let part = if fixed.is_some() && n < step {
                let mut shape = part.shape().to_vec();
                shape[0] = step;
                let mut padded = ArrayD::<f32>::zeros(IxDyn(&shape));
                padded.slice_axis_mut(Axis(0), Slice::from(..n)).assign(&part);
                padded
            } else {
                part.to_owned()
            };
            let y = graph
                .run(self.encode(part, spec.element_type), &Binding::Positional)?
                .into_f32();
            outputs.push(y.slice_axis(Axis(0), Slice::from(..n)).to_owned());
        }
        drop(graph);

        let views: Vec<_> = outputs.iter().map(|y| y.view()).collect();
        let y = ndarray::concatenate(Axis(0), &views)?;
        let y = match self.output_quant {
            Some(q) => q.dequantize(&y),
            None => y,
        };
        self.layout.from_model(y)
    }

    fn encode(&self, x: ArrayD<f32>, element_type: ElementType) -> TensorData {
        match (element_type, self.input_quant) {
            (ElementType::F32, _) => TensorData::F32(x),
            (ElementType::U8, Some(q)) => TensorData::U8(q.quantize(&x)),
            (ElementType::I8, Some(q)) => TensorData::I8(q.quantize(&x)),
            (ElementType::U8, None) => TensorData::U8(quantize::cast_saturating(&x)),
            (ElementType::I8, None) => TensorData::I8(quantize::cast_saturating(&x)),
        }
    }
}

fn quant_from_metadata(runtime: &dyn GraphRuntime, prefix: &str) -> Option<QuantParams> {
    let scale = runtime
        .metadata(&format!("{prefix}_scale"))?
        .trim()
        .parse::<f32>()
        .ok()?;
    let zero_point = runtime
        .metadata(&format!("{prefix}_zero_point"))
        .and_then(|v| v.trim().parse::<i32>().ok())
        .unwrap_or(0);
    QuantParams::new(scale, zero_point)
}

/// Checks a predictor result against the `(B, window, window, nb_classes)`
/// shape the engine expects.
pub(crate) fn check_scores(scores: &Array4<f32>, expected: [usize; 4]) -> Result<()> {
    if scores.shape() != expected {
        return Err(SegError::prediction(
            "score shape check",
            format!("expected {:?}, predictor returned {:?}", expected, scores.shape()),
        ));
    }
    Ok(())
}
