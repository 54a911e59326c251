//! Diffusion pipelines.
//!
//! Every variant shares [`PipelineBase`] for prompt encoding, latents, VAE
//! and the denoising loop:
//!
//! - [`StableDiffusionPipeline`]: PNDM, text-to-image and image-to-image
//! - [`ControlNetPipeline`]: PNDM with per-step ControlNet residuals
//! - [`SdTurboPipeline`]: Euler, one step, no guidance
//! - [`LatentConsistencyPipeline`]: LCM with embedded guidance
//!
//! [`DiffusionPipeline`] picks the variant from `model_index.json`.

pub mod base;
pub mod controlnet;
pub mod dispatch;
pub mod guidance;
pub mod input;
pub mod lcm;
pub mod progress;
pub mod sd_turbo;
pub mod stable_diffusion;

#[cfg(test)]
mod testing;

pub use base::{timestep_value, DenoisePlan, PipelineBase};
pub use controlnet::{ControlNetMapping, ControlNetPipeline};
pub use dispatch::DiffusionPipeline;
pub use guidance::{apply_cfg, do_classifier_free_guidance};
pub use input::{check_image_shape, img2img_start, GenerationInput, Img2ImgStart};
pub use lcm::{w_embedding, LatentConsistencyPipeline};
pub use progress::{CancellationToken, ProgressPayload, ProgressStatus};
pub use sd_turbo::SdTurboPipeline;
pub use stable_diffusion::StableDiffusionPipeline;
