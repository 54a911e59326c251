//! In-memory sessions and tokenizer for pipeline tests.

use std::sync::{Arc, Mutex};

use crate::error::{DiffusionError, Result};
use crate::models::loader::{ComponentConfig, ModelComponents};
use crate::models::tokenizer::build_prompt;
use crate::models::{
    InferenceSession, PromptTokenizer, SessionInputs, SessionOutputs, TokenizeOptions,
    TokenizedPrompt,
};
use crate::schedulers::{create_scheduler, SchedulerConfig, SchedulerKind};
use crate::tensor::{Tensor, Value};

use super::base::PipelineBase;

pub const MOCK_MAX_LENGTH: usize = 8;
pub const MOCK_HIDDEN: usize = 2;

type CallLog = Arc<Mutex<Vec<SessionInputs>>>;

fn record(log: &CallLog, inputs: &SessionInputs) {
    if let Ok(mut calls) = log.lock() {
        calls.push(inputs.clone());
    }
}

fn input_tensor(inputs: &SessionInputs, name: &str) -> Result<Tensor> {
    inputs
        .get(name)
        .ok_or_else(|| DiffusionError::inference_failed(format!("missing input {}", name)))?
        .clone()
        .into_tensor()
}

/// One token per whitespace-separated word, id `10 + word length`.
/// Start is 1, end and pad are 2.
pub struct MockTokenizer;

impl PromptTokenizer for MockTokenizer {
    fn tokenize(&self, text: &str, options: &TokenizeOptions) -> Result<TokenizedPrompt> {
        let ids: Vec<u32> = text.split_whitespace().map(|w| 10 + w.len() as u32).collect();
        Ok(build_prompt(&ids, 1, 2, 2, MOCK_MAX_LENGTH, options))
    }

    fn model_max_length(&self) -> usize {
        MOCK_MAX_LENGTH
    }
}

/// `last_hidden_state[0, i, :] = input_ids[i]`.
struct MockTextEncoder {
    log: CallLog,
}

impl InferenceSession for MockTextEncoder {
    fn run(&mut self, inputs: SessionInputs) -> Result<SessionOutputs> {
        record(&self.log, &inputs);
        let ids: Vec<f32> = match inputs.get("input_ids") {
            Some(Value::Int32(a)) => a.iter().map(|&v| v as f32).collect(),
            _ => return Err(DiffusionError::inference_failed("input_ids must be int32")),
        };
        let len = ids.len();
        let data: Vec<f32> = ids.iter().flat_map(|&v| [v; MOCK_HIDDEN]).collect();
        Ok(SessionOutputs::new().with(
            "last_hidden_state",
            Tensor::from_shape_vec(&[1, len, MOCK_HIDDEN], data)?,
        ))
    }

    fn input_names(&self) -> Vec<String> {
        vec!["input_ids".to_string()]
    }
}

/// Predicts a constant 0.1 noise of the sample's shape.
struct MockUnet {
    log: CallLog,
}

impl InferenceSession for MockUnet {
    fn run(&mut self, inputs: SessionInputs) -> Result<SessionOutputs> {
        record(&self.log, &inputs);
        let sample = input_tensor(&inputs, "sample")?;
        Ok(SessionOutputs::new().with("out_sample", Tensor::full(sample.shape(), 0.1)))
    }

    fn input_names(&self) -> Vec<String> {
        ["sample", "timestep", "encoder_hidden_states"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }
}

/// `[1, 3, H, W]` -> ones `[1, 4, H/8, W/8]`.
struct MockVaeEncoder;

impl InferenceSession for MockVaeEncoder {
    fn run(&mut self, inputs: SessionInputs) -> Result<SessionOutputs> {
        let sample = input_tensor(&inputs, "sample")?;
        let shape = sample.shape();
        Ok(SessionOutputs::new().with(
            "latent_sample",
            Tensor::full(&[shape[0], 4, shape[2] / 8, shape[3] / 8], 1.0),
        ))
    }

    fn input_names(&self) -> Vec<String> {
        vec!["sample".to_string()]
    }
}

/// `[1, 4, h, w]` -> `[1, 3, 8h, 8w]` filled with the mean latent value.
struct MockVaeDecoder {
    log: CallLog,
}

impl InferenceSession for MockVaeDecoder {
    fn run(&mut self, inputs: SessionInputs) -> Result<SessionOutputs> {
        record(&self.log, &inputs);
        let latents = input_tensor(&inputs, "latent_sample")?;
        let values = latents.to_vec();
        let mean = values.iter().sum::<f32>() / values.len().max(1) as f32;
        let shape = latents.shape();
        Ok(SessionOutputs::new().with(
            "sample",
            Tensor::full(&[shape[0], 3, shape[2] * 8, shape[3] * 8], mean),
        ))
    }

    fn input_names(&self) -> Vec<String> {
        vec!["latent_sample".to_string()]
    }
}

/// Returns every residual name the default mapping reads, shaped like `sample`.
pub struct MockControlNet {
    log: CallLog,
}

impl InferenceSession for MockControlNet {
    fn run(&mut self, inputs: SessionInputs) -> Result<SessionOutputs> {
        record(&self.log, &inputs);
        let sample = input_tensor(&inputs, "sample")?;
        let mut outputs = SessionOutputs::new()
            .with("down_block_res_samples", Tensor::full(sample.shape(), 0.0))
            .with("mid_block_res_sample", Tensor::full(sample.shape(), 0.0));
        for id in (24549..=24569).step_by(2) {
            outputs.insert(id.to_string(), Tensor::full(sample.shape(), 0.0));
        }
        Ok(outputs)
    }

    fn input_names(&self) -> Vec<String> {
        vec![
            "sample".to_string(),
            "timestep".to_string(),
            "encoder_hidden_states".to_string(),
            "controlnet_cond".to_string(),
            "conditioning_scale".to_string(),
        ]
    }
}

/// Call logs shared with the mocks handed to a pipeline.
pub struct MockSetup {
    pub kind: SchedulerKind,
    text_encoder: CallLog,
    unet: CallLog,
    vae_decoder: CallLog,
    controlnet: CallLog,
}

impl MockSetup {
    pub fn new(kind: SchedulerKind) -> Self {
        Self {
            kind,
            text_encoder: CallLog::default(),
            unet: CallLog::default(),
            vae_decoder: CallLog::default(),
            controlnet: CallLog::default(),
        }
    }

    /// Token ids of every text encoder call.
    pub fn text_encoder_calls(&self) -> Vec<Vec<i64>> {
        self.calls(&self.text_encoder)
            .iter()
            .filter_map(|c| match c.get("input_ids") {
                Some(Value::Int32(a)) => Some(a.iter().map(|&v| v as i64).collect()),
                _ => None,
            })
            .collect()
    }

    pub fn unet_calls(&self) -> Vec<SessionInputs> {
        self.calls(&self.unet)
    }

    pub fn controlnet_calls(&self) -> Vec<SessionInputs> {
        self.calls(&self.controlnet)
    }

    pub fn vae_decoder_calls(&self) -> usize {
        self.calls(&self.vae_decoder).len()
    }

    pub fn controlnet(&self) -> Box<dyn InferenceSession> {
        Box::new(MockControlNet {
            log: self.controlnet.clone(),
        })
    }

    fn calls(&self, log: &CallLog) -> Vec<SessionInputs> {
        log.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

/// Builds a base over mock sessions with the stock SD scheduler config.
pub fn mock_base(setup: &MockSetup) -> PipelineBase {
    let scheduler = create_scheduler(setup.kind, &SchedulerConfig::stable_diffusion()).unwrap();
    PipelineBase {
        unet: Box::new(MockUnet {
            log: setup.unet.clone(),
        }),
        text_encoder: Box::new(MockTextEncoder {
            log: setup.text_encoder.clone(),
        }),
        vae_encoder: Box::new(MockVaeEncoder),
        vae_decoder: Box::new(MockVaeDecoder {
            log: setup.vae_decoder.clone(),
        }),
        tokenizer: Box::new(MockTokenizer),
        scheduler,
        unet_config: ComponentConfig::default(),
        vae_decoder_config: ComponentConfig::default(),
    }
}

/// Mock components for pipeline construction through
/// `from_components`.
pub fn mock_components(setup: &MockSetup, with_controlnet: bool) -> ModelComponents {
    ModelComponents {
        unet: Box::new(MockUnet {
            log: setup.unet.clone(),
        }),
        text_encoder: Box::new(MockTextEncoder {
            log: setup.text_encoder.clone(),
        }),
        vae_encoder: Box::new(MockVaeEncoder),
        vae_decoder: Box::new(MockVaeDecoder {
            log: setup.vae_decoder.clone(),
        }),
        controlnet: with_controlnet.then(|| setup.controlnet()),
        tokenizer: Box::new(MockTokenizer),
        scheduler_config: SchedulerConfig::stable_diffusion(),
        unet_config: ComponentConfig::default(),
        vae_decoder_config: ComponentConfig::default(),
    }
}
