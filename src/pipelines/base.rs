//! Shared pipeline machinery.
//!
//! [`PipelineBase`] owns the sessions, tokenizer and scheduler every variant
//! uses, and runs the one denoising loop they all share. Variants differ only
//! in how they prepare latents and which extra UNet inputs they feed per step.

use crate::error::{DiffusionError, Result};
use crate::models::loader::{ComponentConfig, ModelComponents};
use crate::models::{InferenceSession, PromptTokenizer, SessionInputs, TokenizeOptions};
use crate::schedulers::{create_scheduler, DynScheduler, SchedulerKind};
use crate::tensor::{NoiseGenerator, Tensor, Value};

use super::guidance::guide_batched;
use super::input::{img2img_start, Img2ImgStart};
use super::progress::{CancellationToken, ProgressPayload, ProgressStatus};

/// Factor between VAE latents and the unit-variance latent space.
pub const DEFAULT_VAE_SCALING_FACTOR: f32 = 0.18215;

/// Latent channels of the SD 1.x / 2.x UNet.
pub const DEFAULT_LATENT_CHANNELS: usize = 4;

/// How one denoising loop runs.
#[derive(Debug, Clone, PartialEq)]
pub struct DenoisePlan {
    /// Timesteps to visit, in order.
    pub timesteps: Vec<i64>,
    /// Position of `timesteps[0]` in the scheduler's full schedule.
    pub index_offset: usize,
    pub guidance_scale: f32,
    /// Run a doubled (uncond, text) batch and blend the halves.
    pub do_cfg: bool,
    /// Pass the timestep as int64 instead of float32.
    pub sd_v1: bool,
    /// Scale the latent with the scheduler before every UNet call.
    pub scale_model_input: bool,
    /// Decode the scheduler's `denoised` prediction instead of the latent.
    pub decode_denoised: bool,
    pub run_vae_on_each_step: bool,
}

/// Sessions, tokenizer and scheduler shared by every pipeline variant.
pub struct PipelineBase {
    pub unet: Box<dyn InferenceSession>,
    pub text_encoder: Box<dyn InferenceSession>,
    pub vae_encoder: Box<dyn InferenceSession>,
    pub vae_decoder: Box<dyn InferenceSession>,
    pub tokenizer: Box<dyn PromptTokenizer>,
    pub scheduler: DynScheduler,
    pub unet_config: ComponentConfig,
    pub vae_decoder_config: ComponentConfig,
}

impl PipelineBase {
    /// Builds the base from loaded components, returning the ControlNet
    /// session separately when present.
    pub fn from_components(
        components: ModelComponents,
        scheduler_kind: SchedulerKind,
    ) -> Result<(Self, Option<Box<dyn InferenceSession>>)> {
        let scheduler = create_scheduler(scheduler_kind, &components.scheduler_config)?;
        let base = Self {
            unet: components.unet,
            text_encoder: components.text_encoder,
            vae_encoder: components.vae_encoder,
            vae_decoder: components.vae_decoder,
            tokenizer: components.tokenizer,
            scheduler,
            unet_config: components.unet_config,
            vae_decoder_config: components.vae_decoder_config,
        };
        Ok((base, components.controlnet))
    }

    /// Pixel-to-latent downscale, from the VAE's `block_out_channels`.
    pub fn vae_scale_factor(&self) -> usize {
        self.vae_decoder_config.vae_scale_factor()
    }

    pub fn vae_scaling_factor(&self) -> f32 {
        self.vae_decoder_config
            .scaling_factor
            .unwrap_or(DEFAULT_VAE_SCALING_FACTOR)
    }

    pub fn latent_channels(&self) -> usize {
        self.unet_config.in_channels.unwrap_or(DEFAULT_LATENT_CHANNELS)
    }

    /// Reseeds the scheduler's noise source for one generation.
    pub fn reseed_scheduler(&mut self, seed: &str) {
        if seed.is_empty() {
            self.scheduler.reseed("");
        } else {
            self.scheduler.reseed(&format!("{}:scheduler", seed));
        }
    }

    // ========================================================================
    // Prompt encoding
    // ========================================================================

    /// Token count of a prompt, including start and end tokens.
    pub fn token_count(&self, prompt: &str) -> Result<usize> {
        Ok(self
            .tokenizer
            .tokenize(prompt, &TokenizeOptions::unpadded())?
            .len())
    }

    fn run_text_encoder(&mut self, ids: &[i64]) -> Result<Tensor> {
        let ids32 = ids
            .iter()
            .map(|&id| {
                i32::try_from(id).map_err(|_| {
                    DiffusionError::tokenizer_failed(format!("Token id {} out of range", id))
                })
            })
            .collect::<Result<Vec<i32>>>()?;
        let inputs = SessionInputs::new().with("input_ids", Value::int32(&[1, ids32.len()], ids32)?);
        let mut outputs = self.text_encoder.run(inputs)?;
        outputs.take_tensor("last_hidden_state")
    }

    /// Encodes a prompt to `[1, seq, dim]` embeddings.
    ///
    /// When `highest_token_length` exceeds the tokenizer limit the prompt is
    /// split into chunks of `limit - 2` tokens. Each chunk is padded with the
    /// end token, wrapped in start/end tokens and encoded on its own; the
    /// chunk embeddings are concatenated on the sequence axis. Otherwise the
    /// prompt is padded to the limit and encoded once.
    pub fn encode_prompt(&mut self, prompt: &str, highest_token_length: usize) -> Result<Tensor> {
        let max_length = self.tokenizer.model_max_length();

        if highest_token_length <= max_length {
            let tokens = self
                .tokenizer
                .tokenize(prompt, &TokenizeOptions::padded(max_length))?;
            return self.run_text_encoder(&tokens.input_ids);
        }

        if max_length < 3 {
            return Err(DiffusionError::invalid_config(format!(
                "Tokenizer limit {} leaves no room for prompt tokens",
                max_length
            )));
        }
        let chunk_length = max_length - 2;

        let mut ids = self
            .tokenizer
            .tokenize(prompt, &TokenizeOptions::unpadded())?
            .input_ids;
        if ids.len() < 2 {
            return Err(DiffusionError::tokenizer_failed(
                "Tokenized prompt is missing start/end tokens",
            ));
        }
        let start = ids.remove(0);
        let end = ids.pop().unwrap_or(start);

        let mut chunks = Vec::new();
        for offset in (0..highest_token_length).step_by(chunk_length) {
            let mut chunk = Vec::with_capacity(max_length);
            chunk.push(start);
            chunk.extend(ids.iter().skip(offset).take(chunk_length));
            chunk.resize(chunk_length + 1, end);
            chunk.push(end);
            chunks.push(self.run_text_encoder(&chunk)?);
        }

        tracing::debug!(
            chunks = chunks.len(),
            tokens = highest_token_length,
            "Encoded long prompt in chunks"
        );
        let refs: Vec<&Tensor> = chunks.iter().collect();
        Tensor::cat(&refs, 1)
    }

    /// Encodes one prompt, chunking it if it is longer than the limit.
    pub fn encode_single_prompt(&mut self, prompt: &str) -> Result<Tensor> {
        let length = self.token_count(prompt)?;
        self.encode_prompt(prompt, length)
    }

    /// Text embeddings for a guided run.
    ///
    /// Both prompts are encoded to the same length. With guidance the result
    /// is `cat([negative, positive])` on the batch axis, otherwise the
    /// positive embeddings alone.
    pub fn prompt_embeds(
        &mut self,
        prompt: &str,
        negative_prompt: Option<&str>,
        do_cfg: bool,
    ) -> Result<Tensor> {
        let negative_prompt = negative_prompt.unwrap_or("");
        let highest = self
            .token_count(prompt)?
            .max(self.token_count(negative_prompt)?);

        let positive = self.encode_prompt(prompt, highest)?;
        if !do_cfg {
            return Ok(positive);
        }
        let negative = self.encode_prompt(negative_prompt, highest)?;
        Tensor::cat(&[&negative, &positive], 0)
    }

    // ========================================================================
    // Latents and VAE
    // ========================================================================

    /// Draws `[batch, channels, height / f, width / f]` Gaussian latents.
    pub fn prepare_latents(
        &self,
        batch_size: usize,
        channels: usize,
        height: usize,
        width: usize,
        generator: &mut NoiseGenerator,
    ) -> Tensor {
        let factor = self.vae_scale_factor();
        generator.randn(&[batch_size, channels, height / factor, width / factor])
    }

    /// Encodes a `[1, 3, H, W]` image in `[-1, 1]` to scaled latents.
    pub fn encode_image(&mut self, image: &Tensor) -> Result<Tensor> {
        let inputs = SessionInputs::new().with("sample", image.clone());
        let mut outputs = self.vae_encoder.run(inputs)?;
        let latents = outputs.take_tensor("latent_sample")?;
        Ok(latents.mul_scalar(DEFAULT_VAE_SCALING_FACTOR))
    }

    /// Decodes latents to images in `[0, 1]`.
    pub fn make_images(&mut self, latents: &Tensor) -> Result<Vec<Tensor>> {
        let latents = latents.div_scalar(self.vae_scaling_factor());
        let inputs = SessionInputs::new().with("latent_sample", latents);
        let mut outputs = self.vae_decoder.run(inputs)?;
        let mut images = outputs.take_tensor("sample")?.div_scalar(2.0).add_scalar(0.5);
        images.clip_inplace(0.0, 1.0);
        Ok(vec![images])
    }

    /// Noises the encoded init image to the strength's entry timestep.
    ///
    /// `noise` is the freshly drawn latent. Returns the starting latent and the
    /// entry point into `timesteps`.
    pub fn prepare_img2img(
        &mut self,
        init_image: &Tensor,
        noise: &Tensor,
        strength: f32,
        num_inference_steps: usize,
        timesteps: &[i64],
    ) -> Result<(Tensor, Img2ImgStart)> {
        let image_latents = self.encode_image(init_image)?;
        let start = img2img_start(num_inference_steps, strength, timesteps)?;
        let latents = self
            .scheduler
            .add_noise(&image_latents, noise, start.noise_timestep)?;
        tracing::debug!(
            init_timestep = start.init_timestep,
            noise_timestep = start.noise_timestep,
            t_start = start.t_start,
            "Prepared image-to-image latents"
        );
        Ok((latents, start))
    }

    // ========================================================================
    // Denoising loop
    // ========================================================================

    /// Runs the denoising loop and decodes the result.
    ///
    /// `extra_inputs` is called before every UNet run with the batched latent
    /// input and the timestep value, and returns any inputs beyond `sample`,
    /// `timestep` and `encoder_hidden_states`.
    pub fn denoise<F>(
        &mut self,
        mut latents: Tensor,
        prompt_embeds: &Tensor,
        plan: &DenoisePlan,
        cancel: Option<&CancellationToken>,
        on_progress: &mut dyn FnMut(&ProgressPayload),
        mut extra_inputs: F,
    ) -> Result<Vec<Tensor>>
    where
        F: FnMut(&Tensor, &Value) -> Result<SessionInputs>,
    {
        let total = plan.timesteps.len();
        let mut decode_target: Option<Tensor> = None;
        let mut cached_images: Option<Vec<Tensor>> = None;

        tracing::info!(
            steps = total,
            guidance = plan.guidance_scale,
            cfg = plan.do_cfg,
            "Running denoising loop"
        );

        for (i, &t) in plan.timesteps.iter().enumerate() {
            let human_step = i + 1;
            on_progress(&ProgressPayload::step(
                ProgressStatus::RunningUnet,
                human_step,
                total,
            ));

            let model_input = if plan.scale_model_input {
                self.scheduler.scale_model_input(&latents)?
            } else {
                latents.clone()
            };
            let latent_input = if plan.do_cfg {
                Tensor::cat(&[&model_input, &model_input], 0)?
            } else {
                model_input
            };
            let timestep = timestep_value(t, plan.sd_v1)?;

            let mut inputs = extra_inputs(&latent_input, &timestep)?;
            inputs.insert("sample", latent_input);
            inputs.insert("timestep", timestep);
            inputs.insert("encoder_hidden_states", prompt_embeds.clone());

            let mut outputs = self.unet.run(inputs)?;
            let mut noise_pred = outputs.take_tensor("out_sample")?;
            if plan.do_cfg {
                noise_pred = guide_batched(&noise_pred, plan.guidance_scale)?;
            }

            let output = self
                .scheduler
                .step(&noise_pred, t, plan.index_offset + i, &latents)?;
            let target = if plan.decode_denoised {
                output.preview().clone()
            } else {
                output.prev_sample.clone()
            };
            latents = output.prev_sample;

            tracing::debug!(step = human_step, total, timestep = t, "Denoising step done");

            if plan.run_vae_on_each_step {
                let images = self.make_images(&target)?;
                on_progress(
                    &ProgressPayload::step(ProgressStatus::RunningVae, human_step, total)
                        .with_images(images.clone()),
                );
                cached_images = Some(images);
            }
            decode_target = Some(target);

            if cancel.is_some_and(CancellationToken::is_cancelled) {
                tracing::info!(step = human_step, total, "Generation cancelled");
                return Err(DiffusionError::cancelled(human_step, total));
            }
        }

        let images = match cached_images {
            Some(images) => images,
            None => {
                let target = decode_target.unwrap_or(latents);
                self.make_images(&target)?
            }
        };

        on_progress(&ProgressPayload::status(ProgressStatus::Done));
        Ok(images)
    }
}

/// Timestep input: int64 `[1]` for SD 1.x exports, float32 `[1]` otherwise.
pub fn timestep_value(timestep: i64, sd_v1: bool) -> Result<Value> {
    if sd_v1 {
        Value::int64(&[1], vec![timestep])
    } else {
        Ok(Value::Float32(Tensor::scalar(timestep as f32)))
    }
}
