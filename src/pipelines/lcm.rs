//! Latent Consistency Model pipeline.
//!
//! Guidance is distilled into the UNet: instead of a doubled batch, the
//! scale is fed as a sinusoidal `timestep_cond` embedding and a single
//! conditional pass runs per step.

use crate::error::{DiffusionError, Result};
use crate::models::loader::{ModelComponents, PipelineKind};
use crate::models::SessionInputs;
use crate::tensor::{NoiseGenerator, Tensor};

use super::base::{DenoisePlan, PipelineBase};
use super::guidance::DEFAULT_LCM_GUIDANCE_SCALE;
use super::input::GenerationInput;
use super::progress::{ProgressPayload, ProgressStatus};

/// Default denoising steps.
pub const DEFAULT_LCM_STEPS: usize = 5;

/// Width of the guidance embedding the LCM UNet expects.
pub const W_EMBEDDING_DIM: usize = 256;

/// UNet `sample_size` when the config leaves it out.
const DEFAULT_SAMPLE_SIZE: usize = 64;

/// Sinusoidal embedding of the guidance scale, shape `[1, dim]`.
///
/// `w = guidance * 1000`; the first half is `sin(w * f_i)`, the second
/// `cos(w * f_i)`, with `f_i = exp(-i * ln(10000) / (dim/2 - 1))`.
pub fn w_embedding(guidance_scale: f32, dim: usize) -> Result<Tensor> {
    if dim < 4 || dim % 2 != 0 {
        return Err(DiffusionError::invalid_input(format!(
            "Guidance embedding width must be even and at least 4, got {}",
            dim
        )));
    }
    let w = guidance_scale * 1000.0;
    let half = dim / 2;
    let log = 10000f32.ln() / (half - 1) as f32;
    let emb = Tensor::range(0.0, half as f32, 1.0)
        .mul_scalar(-log)
        .exp()
        .mul_scalar(w);
    Tensor::cat(&[&emb.sin(), &emb.cos()], 0)?.reshape(&[1, dim])
}

pub struct LatentConsistencyPipeline {
    base: PipelineBase,
}

impl LatentConsistencyPipeline {
    pub fn new(base: PipelineBase) -> Self {
        Self { base }
    }

    pub fn from_components(components: ModelComponents) -> Result<Self> {
        let (base, _) = PipelineBase::from_components(
            components,
            PipelineKind::LatentConsistency.scheduler_kind(),
        )?;
        Ok(Self::new(base))
    }

    pub fn base(&self) -> &PipelineBase {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut PipelineBase {
        &mut self.base
    }

    /// Output size when the request leaves it out: UNet sample size times
    /// the VAE scale factor.
    pub fn default_image_size(&self) -> usize {
        self.base.unet_config.sample_size.unwrap_or(DEFAULT_SAMPLE_SIZE)
            * self.base.vae_scale_factor()
    }

    pub fn run(&mut self, input: &GenerationInput) -> Result<Vec<Tensor>> {
        self.run_with_progress(input, &mut |_| {})
    }

    pub fn run_with_progress(
        &mut self,
        input: &GenerationInput,
        on_progress: &mut dyn FnMut(&ProgressPayload),
    ) -> Result<Vec<Tensor>> {
        input.validate()?;
        if input.init_image.is_some() {
            tracing::warn!("LCM pipeline does not support image-to-image, ignoring init image");
        }

        let size = self.default_image_size();
        let width = input.width.unwrap_or(size);
        let height = input.height.unwrap_or(size);
        let guidance_scale = input.guidance_scale.unwrap_or(DEFAULT_LCM_GUIDANCE_SCALE);
        let num_inference_steps = input.num_inference_steps.unwrap_or(DEFAULT_LCM_STEPS);

        let base = &mut self.base;
        base.scheduler.set_timesteps(num_inference_steps)?;
        base.reseed_scheduler(&input.seed);

        on_progress(&ProgressPayload::status(ProgressStatus::EncodingPrompt));
        let prompt_embeds = base.encode_single_prompt(&input.prompt)?;

        let mut generator = NoiseGenerator::from_seed(&input.seed);
        let latents = base.prepare_latents(
            input.batch_size,
            base.latent_channels(),
            height,
            width,
            &mut generator,
        );
        let timestep_cond = w_embedding(guidance_scale, W_EMBEDDING_DIM)?;

        let plan = DenoisePlan {
            timesteps: base.scheduler.timesteps().to_vec(),
            index_offset: 0,
            guidance_scale,
            do_cfg: false,
            sd_v1: false,
            scale_model_input: false,
            decode_denoised: true,
            run_vae_on_each_step: input.run_vae_on_each_step,
        };
        tracing::info!(
            width,
            height,
            steps = plan.timesteps.len(),
            guidance = guidance_scale,
            "Prepared LCM run"
        );

        base.denoise(
            latents,
            &prompt_embeds,
            &plan,
            input.cancel.as_ref(),
            on_progress,
            |_, _| Ok(SessionInputs::new().with("timestep_cond", timestep_cond.clone())),
        )
    }
}
