//! diffusers-ort: Stable Diffusion pipelines on ONNX Runtime.
//!
//! Runs ONNX exports of diffusers models (Stable Diffusion 1.x/2.x, SD Turbo,
//! Latent Consistency Models, SD 1.5 ControlNet) with native PNDM, Euler and
//! LCM schedulers.
//!
//! # Modules
//!
//! - [`schedulers`]: PNDM, Euler discrete and LCM schedulers
//! - [`tensor`]: owned f32 tensors, typed session values, seeded noise
//! - [`models`]: ONNX sessions, CLIP tokenizer, model directory loading
//! - [`pipelines`]: the denoising pipelines and their inputs
//! - [`config`]: runtime configuration (RuntimeConfig, Device)
//! - [`error`]: error types and codes (DiffusionError, ErrorCode)
//!
//! # Example
//!
//! ```rust,ignore
//! use diffusers_ort::{DiffusionPipeline, GenerationInput, RuntimeConfig};
//!
//! let config = RuntimeConfig::from_env();
//! let mut pipeline = DiffusionPipeline::from_pretrained(&config.effective_model_path(), &config)?;
//!
//! let input = GenerationInput {
//!     seed: "42".to_string(),
//!     ..GenerationInput::new("a lighthouse on a cliff at sunset, oil painting")
//! };
//! let images = pipeline.run(&input)?;
//! diffusers_ort::imageio::save_image(&images[0], "out.png".as_ref())?;
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod imageio;
pub mod models;
pub mod pipelines;
pub mod schedulers;
pub mod tensor;

pub use config::{Device, RuntimeConfig};
pub use error::{DiffusionError, ErrorCode, Result};
pub use pipelines::{DiffusionPipeline, GenerationInput, ProgressPayload, ProgressStatus};
pub use schedulers::{DynScheduler, SchedulerConfig, SchedulerKind};
pub use tensor::Tensor;
