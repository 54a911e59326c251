//! Error types for diffusers-ort.
//!
//! Every failure surfaced by the schedulers, the tensor layer and the
//! pipelines carries an [`ErrorCode`] so callers can decide how to report it.

use std::fmt;

/// Error codes identifying the failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Scheduler or pipeline configuration is not supported.
    /// Trigger: unknown beta schedule, prediction type or scheduler class,
    /// step count out of range.
    InvalidConfig,

    /// Scheduler used before `set_timesteps`.
    NotConfigured,

    /// Requested batch size is not 1.
    UnsupportedBatchSize,

    /// Tensor shapes do not line up for the requested operation.
    ShapeMismatch,

    /// Generation input is invalid.
    /// Trigger: empty prompt, dimensions not divisible by 8, strength outside [0, 1].
    InvalidInput,

    /// ONNX model files not found at expected path.
    ModelNotFound,

    /// Failed to load an ONNX model or its configuration.
    ModelLoadFailed,

    /// An inference session failed or returned unexpected outputs.
    InferenceFailed,

    /// The tokenizer failed to encode a prompt.
    TokenizerFailed,

    /// Generation was cancelled between steps.
    Cancelled,

    /// Reading or writing an image file failed.
    ImageIo,
}

impl ErrorCode {
    /// Returns the string representation of the error code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidConfig => "INVALID_CONFIG",
            ErrorCode::NotConfigured => "NOT_CONFIGURED",
            ErrorCode::UnsupportedBatchSize => "UNSUPPORTED_BATCH_SIZE",
            ErrorCode::ShapeMismatch => "SHAPE_MISMATCH",
            ErrorCode::InvalidInput => "INVALID_INPUT",
            ErrorCode::ModelNotFound => "MODEL_NOT_FOUND",
            ErrorCode::ModelLoadFailed => "MODEL_LOAD_FAILED",
            ErrorCode::InferenceFailed => "INFERENCE_FAILED",
            ErrorCode::TokenizerFailed => "TOKENIZER_FAILED",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::ImageIo => "IMAGE_IO",
        }
    }

    /// Returns a human-readable description of the error.
    pub fn description(&self) -> &'static str {
        match self {
            ErrorCode::InvalidConfig => "Scheduler or pipeline configuration is not supported",
            ErrorCode::NotConfigured => "Scheduler used before set_timesteps was called",
            ErrorCode::UnsupportedBatchSize => "Only a batch size of 1 is supported",
            ErrorCode::ShapeMismatch => "Tensor shapes are incompatible",
            ErrorCode::InvalidInput => "Generation input is invalid",
            ErrorCode::ModelNotFound => "ONNX model files not found at expected path",
            ErrorCode::ModelLoadFailed => "Failed to load ONNX model into memory",
            ErrorCode::InferenceFailed => "Model inference failed during generation",
            ErrorCode::TokenizerFailed => "Prompt tokenization failed",
            ErrorCode::Cancelled => "Generation was cancelled",
            ErrorCode::ImageIo => "Image file could not be read or written",
        }
    }

    /// Returns a recovery hint suggesting how to resolve this error.
    pub fn recovery_hint(&self) -> &'static str {
        match self {
            ErrorCode::InvalidConfig => {
                "Check scheduler/scheduler_config.json: beta_schedule must be linear, \
                 scaled_linear or squaredcos_cap_v2 and prediction_type epsilon, \
                 v_prediction or sample"
            }
            ErrorCode::NotConfigured => "Call set_timesteps before stepping the scheduler",
            ErrorCode::UnsupportedBatchSize => "Generate one image per run (batch_size = 1)",
            ErrorCode::ShapeMismatch => {
                "Verify the model exports match the expected latent and embedding shapes"
            }
            ErrorCode::InvalidInput => {
                "Use a non-empty prompt, width and height divisible by 8 \
                 and a strength between 0 and 1"
            }
            ErrorCode::ModelNotFound => {
                "Point --model-dir (or DIFFUSERS_MODEL_PATH) at an ONNX diffusers export \
                 containing model_index.json"
            }
            ErrorCode::ModelLoadFailed => {
                "Check available memory, verify model files are not corrupted, \
                 or re-export the model"
            }
            ErrorCode::InferenceFailed => {
                "Try a smaller resolution, restart the process, or force CPU execution \
                 with DIFFUSERS_DEVICE=cpu"
            }
            ErrorCode::TokenizerFailed => {
                "Verify tokenizer/tokenizer.json belongs to the model's text encoder"
            }
            ErrorCode::Cancelled => "Start a new generation",
            ErrorCode::ImageIo => "Check the image path and that the file is a PNG or JPEG",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Main error type for diffusion operations.
#[derive(Debug)]
pub struct DiffusionError {
    /// The error code identifying the type of error.
    pub code: ErrorCode,
    /// Human-readable error message with context.
    pub message: String,
    /// Optional underlying cause of the error.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl DiffusionError {
    /// Creates a new DiffusionError with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new DiffusionError with an underlying cause.
    pub fn with_source(
        code: ErrorCode,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates an INVALID_CONFIG error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidConfig, reason)
    }

    /// Creates an INVALID_CONFIG error for an unknown beta schedule.
    pub fn unsupported_beta_schedule(name: &str) -> Self {
        Self::new(
            ErrorCode::InvalidConfig,
            format!("Beta schedule '{}' is not implemented", name),
        )
    }

    /// Creates an INVALID_CONFIG error for an unknown or unsupported prediction type.
    pub fn unsupported_prediction_type(name: &str, scheduler: &str) -> Self {
        Self::new(
            ErrorCode::InvalidConfig,
            format!(
                "Prediction type '{}' is not supported by {}",
                name, scheduler
            ),
        )
    }

    /// Creates a NOT_CONFIGURED error.
    pub fn not_configured(scheduler: &str) -> Self {
        Self::new(
            ErrorCode::NotConfigured,
            format!(
                "Number of inference steps is not set for {}, call set_timesteps first",
                scheduler
            ),
        )
    }

    /// Creates an UNSUPPORTED_BATCH_SIZE error.
    pub fn unsupported_batch_size(batch_size: usize) -> Self {
        Self::new(
            ErrorCode::UnsupportedBatchSize,
            format!("Batch size {} is not supported (must be 1)", batch_size),
        )
    }

    /// Creates a SHAPE_MISMATCH error.
    pub fn shape_mismatch(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::ShapeMismatch, reason)
    }

    /// Creates an INVALID_INPUT error.
    pub fn invalid_input(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, reason)
    }

    /// Creates a MODEL_NOT_FOUND error.
    pub fn model_not_found(path: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::ModelNotFound,
            format!("Model files not found at: {}", path.into()),
        )
    }

    /// Creates a MODEL_LOAD_FAILED error.
    pub fn model_load_failed(reason: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::ModelLoadFailed,
            format!("Failed to load model: {}", reason.into()),
        )
    }

    /// Creates an INFERENCE_FAILED error.
    pub fn inference_failed(reason: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::InferenceFailed,
            format!("Inference failed: {}", reason.into()),
        )
    }

    /// Creates a TOKENIZER_FAILED error.
    pub fn tokenizer_failed(reason: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::TokenizerFailed,
            format!("Tokenization failed: {}", reason.into()),
        )
    }

    /// Creates a CANCELLED error.
    pub fn cancelled(step: usize, total: usize) -> Self {
        Self::new(
            ErrorCode::Cancelled,
            format!("Generation cancelled after step {}/{}", step, total),
        )
    }

    /// Creates an IMAGE_IO error.
    pub fn image_io(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::ImageIo, reason)
    }
}

impl fmt::Display for DiffusionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}. Recovery: {}",
            self.code,
            self.message,
            self.code.recovery_hint()
        )
    }
}

impl std::error::Error for DiffusionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<ndarray::ShapeError> for DiffusionError {
    fn from(e: ndarray::ShapeError) -> Self {
        Self::with_source(ErrorCode::ShapeMismatch, format!("Invalid tensor shape: {}", e), e)
    }
}

/// Result type alias using DiffusionError.
pub type Result<T> = std::result::Result<T, DiffusionError>;
