//! Stable Diffusion with ControlNet conditioning.
//!
//! Every step runs the ControlNet on the same latent input, timestep and
//! text embeddings as the UNet, plus the control image. Its residual outputs
//! are renamed to the UNet's extra inputs through a [`ControlNetMapping`].

use crate::error::{DiffusionError, Result};
use crate::models::loader::{ModelComponents, PipelineKind};
use crate::models::{InferenceSession, SessionInputs, SessionOutputs};
use crate::tensor::{Tensor, Value};

use super::base::PipelineBase;
use super::input::{check_image_shape, GenerationInput};
use super::progress::ProgressPayload;
use super::stable_diffusion::prepare_guided_run;

/// Maps ControlNet outputs to UNet inputs, as `(unet_input, controlnet_output)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlNetMapping {
    pub entries: Vec<(String, String)>,
}

impl Default for ControlNetMapping {
    /// Names of the public SD 1.5 ControlNet ONNX export, where the residual
    /// outputs kept their graph node ids.
    fn default() -> Self {
        let mut entries = vec![
            ("down_block_0".to_string(), "down_block_res_samples".to_string()),
            ("down_block_1".to_string(), "mid_block_res_sample".to_string()),
        ];
        for (i, node) in (24549..=24567).step_by(2).enumerate() {
            entries.push((format!("down_block_{}", i + 2), node.to_string()));
        }
        entries.push((
            "mid_block_additional_residual".to_string(),
            "24569".to_string(),
        ));
        Self { entries }
    }
}

impl ControlNetMapping {
    pub fn new(entries: Vec<(String, String)>) -> Self {
        Self { entries }
    }

    /// Picks the mapped outputs out of a ControlNet run.
    fn unet_inputs(&self, outputs: &SessionOutputs) -> Result<SessionInputs> {
        let mut inputs = SessionInputs::new();
        for (unet_input, controlnet_output) in &self.entries {
            let value = outputs.get(controlnet_output).ok_or_else(|| {
                DiffusionError::inference_failed(format!(
                    "{} not found in ControlNet output",
                    controlnet_output
                ))
            })?;
            inputs.insert(unet_input.clone(), value.clone());
        }
        Ok(inputs)
    }
}

/// Stable Diffusion with a ControlNet conditioning network.
pub struct ControlNetPipeline {
    base: PipelineBase,
    controlnet: Box<dyn InferenceSession>,
    mapping: ControlNetMapping,
}

impl ControlNetPipeline {
    pub fn new(base: PipelineBase, controlnet: Box<dyn InferenceSession>) -> Self {
        Self {
            base,
            controlnet,
            mapping: ControlNetMapping::default(),
        }
    }

    pub fn from_components(components: ModelComponents) -> Result<Self> {
        let (base, controlnet) =
            PipelineBase::from_components(components, PipelineKind::ControlNet.scheduler_kind())?;
        let controlnet = controlnet
            .ok_or_else(|| DiffusionError::model_not_found("controlnet/model.onnx"))?;
        Ok(Self::new(base, controlnet))
    }

    /// Replaces the output-to-input mapping for exports with other names.
    pub fn with_mapping(mut self, mapping: ControlNetMapping) -> Self {
        self.mapping = mapping;
        self
    }

    pub fn mapping(&self) -> &ControlNetMapping {
        &self.mapping
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
        let control_image = input.control_image.as_ref().ok_or_else(|| {
            DiffusionError::invalid_input("ControlNet pipeline requires a control image")
        })?;

        let run = prepare_guided_run(&mut self.base, input, on_progress)?;
        check_image_shape("control_image", control_image, run.height, run.width)?;

        let control_cond = if run.plan.do_cfg {
            Tensor::cat(&[control_image, control_image], 0)?
        } else {
            control_image.clone()
        };
        let conditioning_scale = Value::float64(&[1], vec![input.conditioning_scale])?;

        let controlnet = &mut self.controlnet;
        let mapping = &self.mapping;
        let prompt_embeds = &run.prompt_embeds;

        self.base.denoise(
            run.latents,
            prompt_embeds,
            &run.plan,
            input.cancel.as_ref(),
            on_progress,
            |latent_input, timestep| {
                let inputs = SessionInputs::new()
                    .with("sample", latent_input.clone())
                    .with("timestep", timestep.clone())
                    .with("encoder_hidden_states", prompt_embeds.clone())
                    .with("controlnet_cond", control_cond.clone())
                    .with("conditioning_scale", conditioning_scale.clone());
                let outputs = controlnet.run(inputs)?;
                mapping.unet_inputs(&outputs)
            },
        )
    }
}
