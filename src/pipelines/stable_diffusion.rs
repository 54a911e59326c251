//! Stable Diffusion text-to-image and image-to-image with the PNDM scheduler.

use crate::error::Result;
use crate::models::loader::{ModelComponents, PipelineKind};
use crate::models::SessionInputs;
use crate::tensor::{NoiseGenerator, Tensor};

use super::base::{DenoisePlan, PipelineBase};
use super::guidance::{do_classifier_free_guidance, DEFAULT_GUIDANCE_SCALE};
use super::input::{check_image_shape, GenerationInput, DEFAULT_STRENGTH};
use super::progress::{ProgressPayload, ProgressStatus};

/// Default denoising steps.
pub const DEFAULT_STEPS: usize = 5;

/// Default image width and height.
pub const DEFAULT_IMAGE_SIZE: usize = 512;

/// Latents, embeddings and loop plan of a guided SD run.
pub(crate) struct GuidedRun {
    pub latents: Tensor,
    pub prompt_embeds: Tensor,
    pub plan: DenoisePlan,
    pub width: usize,
    pub height: usize,
}

/// Shared setup of the Stable Diffusion and ControlNet pipelines: schedule,
/// prompt embeddings, seeded latents and the optional image-to-image entry.
pub(crate) fn prepare_guided_run(
    base: &mut PipelineBase,
    input: &GenerationInput,
    on_progress: &mut dyn FnMut(&ProgressPayload),
) -> Result<GuidedRun> {
    input.validate()?;

    let width = input.width.unwrap_or(DEFAULT_IMAGE_SIZE);
    let height = input.height.unwrap_or(DEFAULT_IMAGE_SIZE);
    let guidance_scale = input.guidance_scale.unwrap_or(DEFAULT_GUIDANCE_SCALE);
    let num_inference_steps = input.num_inference_steps.unwrap_or(DEFAULT_STEPS);

    base.scheduler.set_timesteps(num_inference_steps)?;
    base.reseed_scheduler(&input.seed);

    on_progress(&ProgressPayload::status(ProgressStatus::EncodingPrompt));
    let do_cfg = do_classifier_free_guidance(guidance_scale);
    let prompt_embeds =
        base.prompt_embeds(&input.prompt, input.negative_prompt.as_deref(), do_cfg)?;

    let mut generator = NoiseGenerator::from_seed(&input.seed);
    let mut latents =
        base.prepare_latents(input.batch_size, base.latent_channels(), height, width, &mut generator);
    let mut timesteps = base.scheduler.timesteps().to_vec();
    let mut index_offset = 0;

    if let Some(image) = &input.init_image {
        check_image_shape("init_image", image, height, width)?;
        let strength = input.strength.unwrap_or(DEFAULT_STRENGTH);

        on_progress(&ProgressPayload::status(ProgressStatus::EncodingImg2Img));
        let (noised, start) =
            base.prepare_img2img(image, &latents, strength, num_inference_steps, &timesteps)?;
        latents = noised;
        index_offset = start.t_start.min(timesteps.len());
        timesteps = start.remaining(&timesteps).to_vec();
    }

    tracing::info!(
        width,
        height,
        steps = timesteps.len(),
        guidance = guidance_scale,
        img2img = input.init_image.is_some(),
        "Prepared Stable Diffusion run"
    );

    Ok(GuidedRun {
        latents,
        prompt_embeds,
        plan: DenoisePlan {
            timesteps,
            index_offset,
            guidance_scale,
            do_cfg,
            sd_v1: input.sd_v1,
            scale_model_input: false,
            decode_denoised: false,
            run_vae_on_each_step: input.run_vae_on_each_step,
        },
        width,
        height,
    })
}

/// Classic Stable Diffusion (1.x / 2.x) pipeline.
pub struct StableDiffusionPipeline {
    base: PipelineBase,
}

impl StableDiffusionPipeline {
    pub fn new(base: PipelineBase) -> Self {
        Self { base }
    }

    pub fn from_components(components: ModelComponents) -> Result<Self> {
        let (base, _) = PipelineBase::from_components(
            components,
            PipelineKind::StableDiffusion.scheduler_kind(),
        )?;
        Ok(Self::new(base))
    }

    pub fn base(&self) -> &PipelineBase {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut PipelineBase {
        &mut self.base
    }

    /// Generates images, returned as `[1, 3, H, W]` tensors in `[0, 1]`.
    pub fn run(&mut self, input: &GenerationInput) -> Result<Vec<Tensor>> {
        self.run_with_progress(input, &mut |_| {})
    }

    pub fn run_with_progress(
        &mut self,
        input: &GenerationInput,
        on_progress: &mut dyn FnMut(&ProgressPayload),
    ) -> Result<Vec<Tensor>> {
        let run = prepare_guided_run(&mut self.base, input, on_progress)?;
        self.base.denoise(
            run.latents,
            &run.prompt_embeds,
            &run.plan,
            input.cancel.as_ref(),
            on_progress,
            |_, _| Ok(SessionInputs::new()),
        )
    }
}
