//! Generation request and its validation.

use crate::error::{DiffusionError, Result};
use crate::tensor::Tensor;

use super::progress::CancellationToken;

/// Default image-to-image strength.
pub const DEFAULT_STRENGTH: f32 = 0.8;

/// Parameters of one generation.
///
/// `None` fields take the pipeline's own defaults.
#[derive(Debug, Clone)]
pub struct GenerationInput {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub guidance_scale: Option<f32>,
    /// Seed string; empty draws fresh noise every run.
    pub seed: String,
    pub width: Option<usize>,
    pub height: Option<usize>,
    pub num_inference_steps: Option<usize>,
    /// Pass the timestep as int64 (SD 1.x exports) instead of float32.
    pub sd_v1: bool,
    /// Decode and report a preview after every step.
    pub run_vae_on_each_step: bool,
    /// Init image `[1, 3, H, W]` in `[-1, 1]` for image-to-image.
    pub init_image: Option<Tensor>,
    pub strength: Option<f32>,
    /// Control image `[1, 3, H, W]` in `[0, 1]` for ControlNet.
    pub control_image: Option<Tensor>,
    pub conditioning_scale: f64,
    pub batch_size: usize,
    pub cancel: Option<CancellationToken>,
}

impl Default for GenerationInput {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            negative_prompt: None,
            guidance_scale: None,
            seed: String::new(),
            width: None,
            height: None,
            num_inference_steps: None,
            sd_v1: false,
            run_vae_on_each_step: false,
            init_image: None,
            strength: None,
            control_image: None,
            conditioning_scale: 1.0,
            batch_size: 1,
            cancel: None,
        }
    }
}

impl GenerationInput {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    /// Checks the request before any model runs.
    pub fn validate(&self) -> Result<()> {
        if self.prompt.trim().is_empty() {
            return Err(DiffusionError::invalid_input("Prompt must not be empty"));
        }

        if self.batch_size != 1 {
            return Err(DiffusionError::unsupported_batch_size(self.batch_size));
        }

        for (name, value) in [("width", self.width), ("height", self.height)] {
            if let Some(v) = value {
                if v == 0 || v % 8 != 0 {
                    return Err(DiffusionError::invalid_input(format!(
                        "{} must be a positive multiple of 8, got {}",
                        name, v
                    )));
                }
            }
        }

        if let Some(steps) = self.num_inference_steps {
            if steps == 0 {
                return Err(DiffusionError::invalid_input(
                    "num_inference_steps must be at least 1",
                ));
            }
        }

        if let Some(strength) = self.strength {
            if !(0.0..=1.0).contains(&strength) {
                return Err(DiffusionError::invalid_input(format!(
                    "strength must be in [0, 1], got {}",
                    strength
                )));
            }
        }

        if let Some(guidance) = self.guidance_scale {
            if !guidance.is_finite() || guidance < 0.0 {
                return Err(DiffusionError::invalid_input(format!(
                    "guidance_scale must be a non-negative number, got {}",
                    guidance
                )));
            }
        }

        Ok(())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }
}

/// Checks an image tensor is `[1, 3, height, width]`.
pub fn check_image_shape(name: &str, image: &Tensor, height: usize, width: usize) -> Result<()> {
    if image.shape() != [1, 3, height, width] {
        return Err(DiffusionError::shape_mismatch(format!(
            "{} must have shape [1, 3, {}, {}], got {:?}",
            name,
            height,
            width,
            image.shape()
        )));
    }
    Ok(())
}

/// Where an image-to-image run enters the timestep schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Img2ImgStart {
    /// `round(num_inference_steps * strength)`.
    pub init_timestep: usize,
    /// Timestep the encoded image is noised to.
    pub noise_timestep: i64,
    /// Index of the first timestep the loop runs.
    pub t_start: usize,
}

impl Img2ImgStart {
    /// Timesteps left to run from `timesteps`.
    pub fn remaining<'a>(&self, timesteps: &'a [i64]) -> &'a [i64] {
        &timesteps[self.t_start.min(timesteps.len())..]
    }
}

/// Computes the image-to-image entry point.
///
/// The noise timestep is read from the reversed schedule at `init_timestep`,
/// clamped to the last entry.
pub fn img2img_start(
    num_inference_steps: usize,
    strength: f32,
    timesteps: &[i64],
) -> Result<Img2ImgStart> {
    if timesteps.is_empty() {
        return Err(DiffusionError::invalid_input(
            "Cannot start image-to-image on an empty schedule",
        ));
    }
    let init_timestep = (num_inference_steps as f32 * strength).round() as usize;
    let reversed_index = init_timestep.min(timesteps.len() - 1);
    let noise_timestep = timesteps[timesteps.len() - 1 - reversed_index];
    let t_start = num_inference_steps.saturating_sub(init_timestep);

    Ok(Img2ImgStart {
        init_timestep,
        noise_timestep,
        t_start,
    })
}
