//! Typed tensor values exchanged with inference sessions.

use std::fmt;

use ndarray::{ArrayD, IxDyn};

use super::Tensor;
use crate::error::{DiffusionError, Result};

/// Element type of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    Float32,
    Float64,
    Int32,
    Int64,
    Bool,
}

impl DType {
    /// Returns the ONNX-style name of this element type.
    pub fn as_str(&self) -> &'static str {
        match self {
            DType::Float32 => "float32",
            DType::Float64 => "float64",
            DType::Int32 => "int32",
            DType::Int64 => "int64",
            DType::Bool => "bool",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A tensor of any supported element type.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Float32(Tensor),
    Float64(ArrayD<f64>),
    Int32(ArrayD<i32>),
    Int64(ArrayD<i64>),
    Bool(ArrayD<bool>),
}

impl Value {
    /// Builds an int64 value, e.g. token ids or an integer timestep.
    pub fn int64(shape: &[usize], data: Vec<i64>) -> Result<Self> {
        Ok(Value::Int64(ArrayD::from_shape_vec(IxDyn(shape), data)?))
    }

    /// Builds an int32 value.
    pub fn int32(shape: &[usize], data: Vec<i32>) -> Result<Self> {
        Ok(Value::Int32(ArrayD::from_shape_vec(IxDyn(shape), data)?))
    }

    /// Builds a float64 value.
    pub fn float64(shape: &[usize], data: Vec<f64>) -> Result<Self> {
        Ok(Value::Float64(ArrayD::from_shape_vec(IxDyn(shape), data)?))
    }

    pub fn dtype(&self) -> DType {
        match self {
            Value::Float32(_) => DType::Float32,
            Value::Float64(_) => DType::Float64,
            Value::Int32(_) => DType::Int32,
            Value::Int64(_) => DType::Int64,
            Value::Bool(_) => DType::Bool,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            Value::Float32(t) => t.shape(),
            Value::Float64(a) => a.shape(),
            Value::Int32(a) => a.shape(),
            Value::Int64(a) => a.shape(),
            Value::Bool(a) => a.shape(),
        }
    }

    /// Borrows the float tensor, failing for any other element type.
    pub fn as_tensor(&self) -> Result<&Tensor> {
        match self {
            Value::Float32(t) => Ok(t),
            other => Err(DiffusionError::inference_failed(format!(
                "Expected a float32 tensor, got {}",
                other.dtype()
            ))),
        }
    }

    /// Converts into a float tensor. Float64 values are narrowed.
    pub fn into_tensor(self) -> Result<Tensor> {
        match self {
            Value::Float32(t) => Ok(t),
            Value::Float64(a) => Ok(Tensor::from_array(a.mapv(|v| v as f32))),
            other => Err(DiffusionError::inference_failed(format!(
                "Expected a float tensor, got {}",
                other.dtype()
            ))),
        }
    }
}

impl From<Tensor> for Value {
    fn from(t: Tensor) -> Self {
        Value::Float32(t)
    }
}
