//! Classifier-free guidance.

use crate::error::Result;
use crate::tensor::Tensor;

/// Default guidance scale for Stable Diffusion.
pub const DEFAULT_GUIDANCE_SCALE: f32 = 7.5;

/// Default guidance scale for latent consistency models.
pub const DEFAULT_LCM_GUIDANCE_SCALE: f32 = 8.5;

/// Guidance is only worth a doubled batch above 1.
pub fn do_classifier_free_guidance(guidance_scale: f32) -> bool {
    guidance_scale > 1.0
}

/// `uncond + (text - uncond) * guidance_scale`
pub fn apply_cfg(uncond: &Tensor, text: &Tensor, guidance_scale: f32) -> Result<Tensor> {
    let diff = text.sub(uncond)?.mul_scalar(guidance_scale);
    uncond.add(&diff)
}

/// Splits a `[2, ...]` prediction into (uncond, text) halves and blends them.
pub fn guide_batched(noise_pred: &Tensor, guidance_scale: f32) -> Result<Tensor> {
    let (uncond, text) = noise_pred.split_batch()?;
    apply_cfg(&uncond, &text, guidance_scale)
}
