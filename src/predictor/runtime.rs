use std::fmt::Debug;
use std::path::Path;

use ndarray::prelude::*;
use ort::{
    execution_providers::{CUDAExecutionProvider, TensorRTExecutionProvider},
    session::Session,
    tensor::{PrimitiveTensorElementType, TensorElementType},
    value::{TensorRef, ValueType},
};
use serde::Deserialize;

use crate::errors::{Result, SegError};

pub type LoadError = Box<dyn std::error::Error + Send + Sync>;

/// Numeric element type of a graph input or output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    F32,
    U8,
    I8,
}

/// Name, declared shape and element type of a graph tensor. Dynamic
/// dimensions are negative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorSpec {
    pub name: String,
    pub shape: Vec<i64>,
    pub element_type: ElementType,
}

/// Owned tensor handed to or returned from a graph.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(ArrayD<f32>),
    U8(ArrayD<u8>),
    I8(ArrayD<i8>),
}

impl TensorData {
    pub fn shape(&self) -> &[usize] {
        match self {
            Self::F32(a) => a.shape(),
            Self::U8(a) => a.shape(),
            Self::I8(a) => a.shape(),
        }
    }

    /// Widens any element type to f32.
    pub fn into_f32(self) -> ArrayD<f32> {
        match self {
            Self::F32(a) => a,
            Self::U8(a) => a.mapv(f32::from),
            Self::I8(a) => a.mapv(f32::from),
        }
    }
}

/// Input/output names of a serialized graph's serving signature.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Signature {
    #[serde(rename = "inputs")]
    pub input: String,
    #[serde(rename = "outputs")]
    pub output: String,
}

/// How a tensor is bound when the graph is invoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    /// First input, first output.
    Positional,
    /// Input and output looked up by name.
    Named(Signature),
}

/// A loaded graph that can be invoked with one input tensor.
///
/// Implementations own backend state (sessions, allocated tensors); callers
/// serialize access through a mutex.
pub trait GraphRuntime: Send {
    fn input(&self) -> &TensorSpec;

    fn output(&self) -> &TensorSpec;

    /// Looks up a string entry in the model's custom metadata.
    fn metadata(&self, _key: &str) -> Option<String> {
        None
    }

    fn run(&mut self, input: TensorData, binding: &Binding) -> Result<TensorData>;
}

/// ONNX Runtime session behind the [`GraphRuntime`] seam.
pub struct OrtRuntime {
    session: Session,
    input: TensorSpec,
    output: TensorSpec,
}

impl OrtRuntime {
    pub fn load(model_path: &Path, device_id: i32) -> std::result::Result<Self, LoadError> {
        let session = Session::builder()
            .map_err(to_load_error)?
            .with_execution_providers([
                TensorRTExecutionProvider::default()
                    .with_device_id(device_id)
                    .build(),
                CUDAExecutionProvider::default()
                    .with_device_id(device_id)
                    .build(),
            ])
            .map_err(to_load_error)?
            .with_memory_pattern(true)
            .map_err(to_load_error)?
            .commit_from_file(model_path)
            .map_err(to_load_error)?;

        let input = session
            .inputs
            .first()
            .and_then(|i| tensor_spec(&i.name, &i.input_type))
            .ok_or("graph has no f32/u8/i8 tensor input")?;
        let output = session
            .outputs
            .first()
            .and_then(|o| tensor_spec(&o.name, &o.output_type))
            .ok_or("graph has no f32/u8/i8 tensor output")?;

        Ok(Self {
            session,
            input,
            output,
        })
    }

    /// Resolves a named signature against the graph's declared tensors and
    /// adopts the named tensors' specs.
    pub fn bind_signature(&mut self, signature: &Signature) -> std::result::Result<(), LoadError> {
        let input = self
            .session
            .inputs
            .iter()
            .find(|i| i.name == signature.input)
            .and_then(|i| tensor_spec(&i.name, &i.input_type))
            .ok_or_else(|| format!("signature input `{}` not found", signature.input))?;
        let output = self
            .session
            .outputs
            .iter()
            .find(|o| o.name == signature.output)
            .and_then(|o| tensor_spec(&o.name, &o.output_type))
            .ok_or_else(|| format!("signature output `{}` not found", signature.output))?;
        self.input = input;
        self.output = output;
        Ok(())
    }
}

impl GraphRuntime for OrtRuntime {
    fn input(&self) -> &TensorSpec {
        &self.input
    }

    fn output(&self) -> &TensorSpec {
        &self.output
    }

    fn metadata(&self, key: &str) -> Option<String> {
        self.session.metadata().ok()?.custom(key).ok()?
    }

    fn run(&mut self, input: TensorData, binding: &Binding) -> Result<TensorData> {
        let output_type = self.output.element_type;
        match input {
            TensorData::F32(a) => run_typed(&mut self.session, &a, binding, output_type),
            TensorData::U8(a) => run_typed(&mut self.session, &a, binding, output_type),
            TensorData::I8(a) => run_typed(&mut self.session, &a, binding, output_type),
        }
    }
}

fn run_typed<T>(
    session: &mut Session,
    array: &ArrayD<T>,
    binding: &Binding,
    output_type: ElementType,
) -> Result<TensorData>
where
    T: PrimitiveTensorElementType + Debug + Clone + 'static,
{
    let data = array.as_standard_layout();
    let tensor = TensorRef::from_array_view(&data)?;
    let outputs = match binding {
        Binding::Positional => session.run(ort::inputs![tensor])?,
        Binding::Named(signature) => {
            session.run(ort::inputs![signature.input.as_str() => tensor])?
        }
    };
    let value = match binding {
        Binding::Positional => &outputs[0],
        Binding::Named(signature) => &outputs[signature.output.as_str()],
    };

    Ok(match output_type {
        ElementType::F32 => TensorData::F32(value.try_extract_array::<f32>()?.to_owned()),
        ElementType::U8 => TensorData::U8(value.try_extract_array::<u8>()?.to_owned()),
        ElementType::I8 => TensorData::I8(value.try_extract_array::<i8>()?.to_owned()),
    })
}

fn tensor_spec(name: &str, value_type: &ValueType) -> Option<TensorSpec> {
    let element_type = match value_type.tensor_type()? {
        TensorElementType::Float32 => ElementType::F32,
        TensorElementType::Uint8 => ElementType::U8,
        TensorElementType::Int8 => ElementType::I8,
        _ => return None,
    };
    Some(TensorSpec {
        name: name.to_string(),
        shape: value_type.tensor_shape()?.to_vec(),
        element_type,
    })
}

fn to_load_error(err: impl std::fmt::Display) -> LoadError {
    err.to_string().into()
}

/// Checks `actual` against every fixed non-batch dimension of a declared
/// NHWC/NCHW shape and returns the batch size the graph was exported with,
/// or `None` when the batch axis is dynamic.
pub fn fixed_batch(declared: &[i64], actual: &[usize]) -> Result<Option<usize>> {
    if declared.len() != actual.len() {
        return Err(SegError::prediction(
            "input shape binding",
            format!("graph expects rank {}, got {:?}", declared.len(), actual),
        ));
    }
    for (axis, (&want, &got)) in declared.iter().zip(actual).enumerate().skip(1) {
        if want > 0 && want as usize != got {
            return Err(SegError::prediction(
                "input shape binding",
                format!("axis {axis} must be {want}, got {got}"),
            ));
        }
    }
    Ok(declared.first().copied().filter(|&b| b > 0).map(|b| b as usize))
}
