//! SD Turbo: adversarially distilled SD 2.1 sampled with Euler in one or a
//! few steps, without classifier-free guidance.

use crate::error::Result;
use crate::models::loader::{ModelComponents, PipelineKind};
use crate::models::SessionInputs;
use crate::tensor::{NoiseGenerator, Tensor};

use super::base::{DenoisePlan, PipelineBase};
use super::input::GenerationInput;
use super::progress::{ProgressPayload, ProgressStatus};
use super::stable_diffusion::DEFAULT_IMAGE_SIZE;

/// Default denoising steps.
pub const DEFAULT_TURBO_STEPS: usize = 1;

pub struct SdTurboPipeline {
    base: PipelineBase,
}

impl SdTurboPipeline {
    pub fn new(base: PipelineBase) -> Self {
        Self { base }
    }

    pub fn from_components(components: ModelComponents) -> Result<Self> {
        let (base, _) =
            PipelineBase::from_components(components, PipelineKind::SdTurbo.scheduler_kind())?;
        Ok(Self::new(base))
    }

    pub fn base(&self) -> &PipelineBase {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut PipelineBase {
        &mut self.base
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
            tracing::warn!("SD Turbo does not support image-to-image, ignoring init image");
        }

        let width = input.width.unwrap_or(DEFAULT_IMAGE_SIZE);
        let height = input.height.unwrap_or(DEFAULT_IMAGE_SIZE);
        let num_inference_steps = input.num_inference_steps.unwrap_or(DEFAULT_TURBO_STEPS);

        let base = &mut self.base;
        base.scheduler.set_timesteps(num_inference_steps)?;
        base.reseed_scheduler(&input.seed);

        on_progress(&ProgressPayload::status(ProgressStatus::EncodingPrompt));
        let prompt_embeds = base.encode_single_prompt(&input.prompt)?;

        let mut generator = NoiseGenerator::from_seed(&input.seed);
        let latents = base
            .prepare_latents(input.batch_size, base.latent_channels(), height, width, &mut generator)
            .mul_scalar(base.scheduler.init_noise_sigma());

        let plan = DenoisePlan {
            timesteps: base.scheduler.timesteps().to_vec(),
            index_offset: 0,
            guidance_scale: 0.0,
            do_cfg: false,
            sd_v1: input.sd_v1,
            scale_model_input: true,
            decode_denoised: false,
            run_vae_on_each_step: input.run_vae_on_each_step,
        };
        tracing::info!(width, height, steps = plan.timesteps.len(), "Prepared SD Turbo run");

        base.denoise(
            latents,
            &prompt_embeds,
            &plan,
            input.cancel.as_ref(),
            on_progress,
            |_, _| Ok(SessionInputs::new()),
        )
    }
}
