//! Inference session abstraction and its ONNX Runtime implementation.
//!
//! Pipelines only see [`InferenceSession`]: named [`Value`] inputs in, named
//! values out. [`OrtSession`] runs an exported diffusers graph, converting
//! float inputs to f16 when the graph was exported in half precision.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::path::Path;

use half::f16;
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, CoreMLExecutionProvider,
    ExecutionProviderDispatch,
};
use ort::session::{Session, SessionInputValue};
use ort::tensor::TensorElementType;
use ort::value::{DynValue, Tensor as OrtTensor, ValueType};

use crate::config::Device;
use crate::error::{DiffusionError, Result};
use crate::tensor::{Tensor, Value};

/// Named inputs for one session run.
#[derive(Debug, Clone, Default)]
pub struct SessionInputs {
    values: BTreeMap<String, Value>,
}

impl SessionInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(name.into(), value.into());
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}

impl IntoIterator for SessionInputs {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.into_iter()
    }
}

/// Named outputs of one session run.
#[derive(Debug, Clone, Default)]
pub struct SessionOutputs {
    values: BTreeMap<String, Value>,
}

impl SessionOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Removes an output by name.
    pub fn take(&mut self, name: &str) -> Result<Value> {
        self.values.remove(name).ok_or_else(|| {
            DiffusionError::inference_failed(format!("{} not found in session output", name))
        })
    }

    /// Removes an output by name and converts it to a float tensor.
    pub fn take_tensor(&mut self, name: &str) -> Result<Tensor> {
        self.take(name)?.into_tensor()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Runs a neural network graph.
pub trait InferenceSession: Send {
    /// Runs the graph once.
    fn run(&mut self, inputs: SessionInputs) -> Result<SessionOutputs>;

    /// Names of the graph inputs.
    fn input_names(&self) -> Vec<String>;
}

/// Returns the execution providers for a device, most preferred first.
pub fn execution_providers(device: Device) -> Vec<ExecutionProviderDispatch> {
    match device {
        Device::Cpu => vec![CPUExecutionProvider::default().build()],
        Device::Cuda => vec![
            CUDAExecutionProvider::default().build(),
            CPUExecutionProvider::default().build(),
        ],
        Device::Metal => vec![
            CoreMLExecutionProvider::default().build(),
            CPUExecutionProvider::default().build(),
        ],
        Device::Auto => {
            if cfg!(target_os = "macos") {
                execution_providers(Device::Metal)
            } else {
                execution_providers(Device::Cuda)
            }
        }
    }
}

/// ONNX Runtime session over an exported diffusers component.
pub struct OrtSession {
    session: Session,
    /// Graph inputs declared as float16.
    f16_inputs: Vec<String>,
    input_names: Vec<String>,
    output_names: Vec<String>,
}

impl std::fmt::Debug for OrtSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrtSession")
            .field("inputs", &self.input_names)
            .field("outputs", &self.output_names)
            .finish_non_exhaustive()
    }
}

impl OrtSession {
    /// Loads an ONNX graph.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the `model.onnx` file
    /// * `providers` - Execution providers, tried in order
    /// * `threads` - Intra-op thread count, `None` lets ONNX Runtime decide
    pub fn load(
        path: &Path,
        providers: &[ExecutionProviderDispatch],
        threads: Option<usize>,
    ) -> Result<Self> {
        if !path.exists() {
            return Err(DiffusionError::model_not_found(path.display().to_string()));
        }

        let mut builder = Session::builder().map_err(|e| {
            DiffusionError::model_load_failed(format!("Failed to create session: {}", e))
        })?;

        if !providers.is_empty() {
            builder = builder.with_execution_providers(providers).map_err(|e| {
                DiffusionError::model_load_failed(format!(
                    "Failed to set execution providers: {}",
                    e
                ))
            })?;
        }

        if let Some(threads) = threads {
            builder = builder.with_intra_threads(threads).map_err(|e| {
                DiffusionError::model_load_failed(format!("Failed to set thread count: {}", e))
            })?;
        }

        let session = builder.commit_from_file(path).map_err(|e| {
            DiffusionError::model_load_failed(format!("{}: {}", path.display(), e))
        })?;

        let input_names: Vec<String> = session.inputs.iter().map(|i| i.name.clone()).collect();
        let output_names: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();
        let f16_inputs: Vec<String> = session
            .inputs
            .iter()
            .filter(|i| {
                matches!(
                    i.input_type,
                    ValueType::Tensor {
                        ty: TensorElementType::Float16,
                        ..
                    }
                )
            })
            .map(|i| i.name.clone())
            .collect();

        tracing::debug!(
            path = %path.display(),
            inputs = ?input_names,
            outputs = ?output_names,
            fp16 = !f16_inputs.is_empty(),
            "Loaded ONNX session"
        );

        Ok(Self {
            session,
            f16_inputs,
            input_names,
            output_names,
        })
    }

    fn to_ort_value(&self, name: &str, value: Value) -> Result<DynValue> {
        let shape = value.shape().to_vec();
        let converted = match value {
            Value::Float32(t) => {
                let data = t.to_vec();
                if self.f16_inputs.iter().any(|n| n == name) {
                    let half: Vec<f16> = data.into_iter().map(f16::from_f32).collect();
                    OrtTensor::from_array((shape, half)).map(|t| t.into_dyn())
                } else {
                    OrtTensor::from_array((shape, data)).map(|t| t.into_dyn())
                }
            }
            Value::Float64(a) => {
                OrtTensor::from_array((shape, a.iter().copied().collect::<Vec<f64>>()))
                    .map(|t| t.into_dyn())
            }
            Value::Int32(a) => {
                OrtTensor::from_array((shape, a.iter().copied().collect::<Vec<i32>>()))
                    .map(|t| t.into_dyn())
            }
            Value::Int64(a) => {
                OrtTensor::from_array((shape, a.iter().copied().collect::<Vec<i64>>()))
                    .map(|t| t.into_dyn())
            }
            Value::Bool(a) => {
                OrtTensor::from_array((shape, a.iter().copied().collect::<Vec<bool>>()))
                    .map(|t| t.into_dyn())
            }
        };
        converted.map_err(|e| {
            DiffusionError::inference_failed(format!("Failed to create input '{}': {}", name, e))
        })
    }
}

/// Converts an ONNX Runtime output to a [`Value`], accepting f32, f16, f64 and i64.
fn from_ort_value(name: &str, value: &DynValue) -> Result<Value> {
    if let Ok((shape, data)) = value.try_extract_tensor::<f32>() {
        let shape: Vec<usize> = shape.iter().map(|&x| x as usize).collect();
        return Ok(Value::Float32(Tensor::from_shape_vec(&shape, data.to_vec())?));
    }
    if let Ok((shape, data)) = value.try_extract_tensor::<f16>() {
        let shape: Vec<usize> = shape.iter().map(|&x| x as usize).collect();
        let data: Vec<f32> = data.iter().map(|&v| f32::from(v)).collect();
        return Ok(Value::Float32(Tensor::from_shape_vec(&shape, data)?));
    }
    if let Ok((shape, data)) = value.try_extract_tensor::<f64>() {
        let shape: Vec<usize> = shape.iter().map(|&x| x as usize).collect();
        return Value::float64(&shape, data.to_vec());
    }
    if let Ok((shape, data)) = value.try_extract_tensor::<i64>() {
        let shape: Vec<usize> = shape.iter().map(|&x| x as usize).collect();
        return Value::int64(&shape, data.to_vec());
    }
    Err(DiffusionError::inference_failed(format!(
        "Output '{}' has an unsupported element type",
        name
    )))
}

impl InferenceSession for OrtSession {
    fn run(&mut self, inputs: SessionInputs) -> Result<SessionOutputs> {
        let mut named: Vec<(String, DynValue)> = Vec::with_capacity(inputs.len());
        for (name, value) in inputs {
            let converted = self.to_ort_value(&name, value)?;
            named.push((name, converted));
        }

        let session_inputs: Vec<(Cow<str>, SessionInputValue)> = named
            .iter()
            .map(|(k, v)| (Cow::from(k.as_str()), SessionInputValue::from(v.view())))
            .collect();

        let mut outputs = self.session.run(session_inputs).map_err(|e| {
            DiffusionError::inference_failed(format!("Session run failed: {}", e))
        })?;

        let mut result = SessionOutputs::new();
        for name in &self.output_names {
            if let Some(value) = outputs.remove(name.as_str()) {
                result.insert(name.clone(), from_ort_value(name, &value)?);
            }
        }
        Ok(result)
    }

    fn input_names(&self) -> Vec<String> {
        self.input_names.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn inputs_builder_collects_values() {
        let inputs = SessionInputs::new()
            .with("sample", Tensor::zeros(&[1, 4, 8, 8]))
            .with("timestep", Value::int64(&[1], vec![981]).unwrap());
        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs.get("sample").unwrap().shape(), &[1, 4, 8, 8]);
        let names: Vec<&str> = inputs.names().collect();
        assert_eq!(names, vec!["sample", "timestep"]);
    }

    #[test]
    fn take_tensor_removes_output() {
        let mut outputs = SessionOutputs::new().with("out_sample", Tensor::full(&[1], 2.0));
        assert_eq!(outputs.take_tensor("out_sample").unwrap().to_vec(), vec![2.0]);
        assert!(outputs.is_empty());
        let err = outputs.take_tensor("out_sample").unwrap_err();
        assert_eq!(err.code, ErrorCode::InferenceFailed);
    }

    #[test]
    fn execution_providers_end_with_cpu_fallback() {
        assert_eq!(execution_providers(Device::Cpu).len(), 1);
        assert_eq!(execution_providers(Device::Cuda).len(), 2);
        assert_eq!(execution_providers(Device::Metal).len(), 2);
        assert_eq!(execution_providers(Device::Auto).len(), 2);
    }

    #[test]
    fn missing_model_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = OrtSession::load(&dir.path().join("unet/model.onnx"), &[], None).unwrap_err();
        assert_eq!(err.code, ErrorCode::ModelNotFound);
    }
}
