//! Model collaborators.
//!
//! - [`InferenceSession`](session::InferenceSession): named-tensor graph execution, backed by ONNX Runtime
//! - [`PromptTokenizer`](tokenizer::PromptTokenizer): CLIP prompt tokenization
//! - [`loader`]: diffusers model directory layout and pipeline selection

pub mod loader;
pub mod session;
pub mod tokenizer;

// Re-export commonly used types
pub use loader::{
    check_models, load_components, required_files, ComponentConfig, ModelComponents,
    ModelIndex, PipelineKind,
};
pub use session::{execution_providers, InferenceSession, OrtSession, SessionInputs, SessionOutputs};
pub use tokenizer::{ClipTokenizer, PromptTokenizer, TokenizeOptions, TokenizedPrompt};
