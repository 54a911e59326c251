//! Model directory loader.
//!
//! A model directory follows the diffusers ONNX export layout:
//!
//! ```text
//! model_index.json
//! unet/model.onnx            unet/config.json (optional)
//! text_encoder/model.onnx
//! vae_encoder/model.onnx
//! vae_decoder/model.onnx     vae_decoder/config.json (optional)
//! controlnet/model.onnx      (ControlNet pipelines only)
//! scheduler/scheduler_config.json
//! tokenizer/tokenizer.json   tokenizer/tokenizer_config.json (optional)
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::config::RuntimeConfig;
use crate::error::{DiffusionError, Result};
use crate::schedulers::{SchedulerConfig, SchedulerKind};

use super::session::{execution_providers, InferenceSession, OrtSession};
use super::tokenizer::{ClipTokenizer, PromptTokenizer, DEFAULT_MODEL_MAX_LENGTH};

pub const MODEL_INDEX_FILE: &str = "model_index.json";
pub const SCHEDULER_CONFIG_FILE: &str = "scheduler/scheduler_config.json";
pub const TOKENIZER_FILE: &str = "tokenizer/tokenizer.json";
pub const TOKENIZER_CONFIG_FILE: &str = "tokenizer/tokenizer_config.json";

pub const UNET: &str = "unet";
pub const TEXT_ENCODER: &str = "text_encoder";
pub const VAE_ENCODER: &str = "vae_encoder";
pub const VAE_DECODER: &str = "vae_decoder";
pub const CONTROLNET: &str = "controlnet";

/// Pipeline variant served by a model directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineKind {
    StableDiffusion,
    ControlNet,
    SdTurbo,
    LatentConsistency,
}

impl PipelineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineKind::StableDiffusion => "stable_diffusion",
            PipelineKind::ControlNet => "controlnet",
            PipelineKind::SdTurbo => "sd_turbo",
            PipelineKind::LatentConsistency => "lcm",
        }
    }

    /// Scheduler the variant always runs with, whatever the config names.
    pub fn scheduler_kind(&self) -> SchedulerKind {
        match self {
            PipelineKind::StableDiffusion | PipelineKind::ControlNet => SchedulerKind::Pndm,
            PipelineKind::SdTurbo => SchedulerKind::EulerDiscrete,
            PipelineKind::LatentConsistency => SchedulerKind::Lcm,
        }
    }

    /// ONNX components the variant loads.
    pub fn components(&self) -> &'static [&'static str] {
        match self {
            PipelineKind::ControlNet => &[UNET, CONTROLNET, TEXT_ENCODER, VAE_ENCODER, VAE_DECODER],
            _ => &[UNET, TEXT_ENCODER, VAE_ENCODER, VAE_DECODER],
        }
    }
}

impl std::fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The parts of `model_index.json` that select a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelIndex {
    pub class_name: String,
    pub has_controlnet: bool,
    /// Scheduler class, the second entry of the `scheduler` pair.
    pub scheduler_class: Option<String>,
}

impl ModelIndex {
    pub fn from_json(content: &str) -> Result<Self> {
        let json: serde_json::Value = serde_json::from_str(content).map_err(|e| {
            DiffusionError::invalid_config(format!("Failed to parse {}: {}", MODEL_INDEX_FILE, e))
        })?;

        let class_name = json
            .get("_class_name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                DiffusionError::invalid_config(format!("{} has no _class_name", MODEL_INDEX_FILE))
            })?
            .to_string();

        let scheduler_class = json
            .get("scheduler")
            .and_then(|v| v.get(1))
            .and_then(|v| v.as_str())
            .map(str::to_string);

        Ok(Self {
            class_name,
            has_controlnet: json.get("controlnet").is_some(),
            scheduler_class,
        })
    }

    pub fn from_dir(model_dir: &Path) -> Result<Self> {
        let path = model_dir.join(MODEL_INDEX_FILE);
        if !path.exists() {
            return Err(DiffusionError::model_not_found(path.display().to_string()));
        }
        let content = std::fs::read_to_string(&path).map_err(|e| {
            DiffusionError::model_load_failed(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&content)
    }

    /// Selects the pipeline variant for this model.
    pub fn pipeline_kind(&self) -> Result<PipelineKind> {
        match self.class_name.as_str() {
            "StableDiffusionPipeline" | "OnnxStableDiffusionPipeline" => {
                if self.has_controlnet {
                    Ok(PipelineKind::ControlNet)
                } else if self.scheduler_class.as_deref() == Some("EulerDiscreteScheduler") {
                    Ok(PipelineKind::SdTurbo)
                } else {
                    Ok(PipelineKind::StableDiffusion)
                }
            }
            "LatentConsistencyModelPipeline" => Ok(PipelineKind::LatentConsistency),
            sdxl if sdxl.contains("StableDiffusionXL") => Err(DiffusionError::invalid_config(
                format!("SDXL pipelines are not supported ({})", sdxl),
            )),
            other => Err(DiffusionError::invalid_config(format!(
                "Unknown pipeline type {}",
                other
            ))),
        }
    }
}

/// Optional `config.json` of an ONNX component.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ComponentConfig {
    pub sample_size: Option<usize>,
    pub in_channels: Option<usize>,
    pub scaling_factor: Option<f32>,
    pub block_out_channels: Vec<usize>,
}

impl ComponentConfig {
    /// Reads `<component>/config.json`, or defaults when the file is absent.
    pub fn from_dir(model_dir: &Path, component: &str) -> Result<Self> {
        let path = model_dir.join(component).join("config.json");
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path).map_err(|e| {
            DiffusionError::model_load_failed(format!("Failed to read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            DiffusionError::invalid_config(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    /// `2^(len(block_out_channels) - 1)`, 8 when unknown.
    pub fn vae_scale_factor(&self) -> usize {
        if self.block_out_channels.is_empty() {
            8
        } else {
            1 << (self.block_out_channels.len() - 1)
        }
    }
}

/// Files that must exist for a pipeline variant.
pub fn required_files(kind: PipelineKind) -> Vec<String> {
    let mut files: Vec<String> = kind
        .components()
        .iter()
        .map(|c| format!("{}/model.onnx", c))
        .collect();
    files.push(SCHEDULER_CONFIG_FILE.to_string());
    files.push(TOKENIZER_FILE.to_string());
    files
}

/// Checks that all files for `kind` exist in the directory.
///
/// Returns Ok(()) if all files exist, or an error listing missing files.
pub fn check_models(model_dir: &Path, kind: PipelineKind) -> Result<()> {
    let missing: Vec<String> = required_files(kind)
        .into_iter()
        .filter(|file| !model_dir.join(file).exists())
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(DiffusionError::model_not_found(format!(
            "Missing model files in {}: {}",
            model_dir.display(),
            missing.join(", ")
        )))
    }
}

pub fn load_scheduler_config(model_dir: &Path) -> Result<SchedulerConfig> {
    let path = model_dir.join(SCHEDULER_CONFIG_FILE);
    if !path.exists() {
        return Err(DiffusionError::model_not_found(path.display().to_string()));
    }
    SchedulerConfig::from_file(&path)
}

/// Reads `model_max_length` from `tokenizer_config.json`, falling back to 77.
///
/// Sentinel values (transformers writes `1e30` for "unbounded") also fall back.
pub fn tokenizer_max_length(model_dir: &Path) -> Result<usize> {
    let path = model_dir.join(TOKENIZER_CONFIG_FILE);
    if !path.exists() {
        return Ok(DEFAULT_MODEL_MAX_LENGTH);
    }
    let content = std::fs::read_to_string(&path).map_err(|e| {
        DiffusionError::model_load_failed(format!("Failed to read {}: {}", path.display(), e))
    })?;
    let json: serde_json::Value = serde_json::from_str(&content).map_err(|e| {
        DiffusionError::invalid_config(format!("Failed to parse {}: {}", path.display(), e))
    })?;

    Ok(json
        .get("model_max_length")
        .and_then(|v| v.as_u64())
        .filter(|&n| n > 2 && n <= 4096)
        .map(|n| n as usize)
        .unwrap_or(DEFAULT_MODEL_MAX_LENGTH))
}

/// Everything a pipeline needs, loaded from one model directory.
pub struct ModelComponents {
    pub unet: Box<dyn InferenceSession>,
    pub text_encoder: Box<dyn InferenceSession>,
    pub vae_encoder: Box<dyn InferenceSession>,
    pub vae_decoder: Box<dyn InferenceSession>,
    pub controlnet: Option<Box<dyn InferenceSession>>,
    pub tokenizer: Box<dyn PromptTokenizer>,
    pub scheduler_config: SchedulerConfig,
    pub unet_config: ComponentConfig,
    pub vae_decoder_config: ComponentConfig,
}

/// Loads every component of a pipeline variant.
pub fn load_components(
    model_dir: &Path,
    kind: PipelineKind,
    config: &RuntimeConfig,
) -> Result<ModelComponents> {
    check_models(model_dir, kind)?;

    let providers = execution_providers(config.device);
    let load = |component: &str| -> Result<Box<dyn InferenceSession>> {
        tracing::info!(component, "Loading ONNX session");
        let path = model_dir.join(component).join("model.onnx");
        let session = OrtSession::load(&path, &providers, config.threads)?;
        Ok(Box::new(session))
    };

    // Largest graph first.
    let unet = load(UNET)?;
    let controlnet = match kind {
        PipelineKind::ControlNet => Some(load(CONTROLNET)?),
        _ => None,
    };
    let text_encoder = load(TEXT_ENCODER)?;
    let vae_encoder = load(VAE_ENCODER)?;
    let vae_decoder = load(VAE_DECODER)?;

    let max_length = tokenizer_max_length(model_dir)?;
    let tokenizer = ClipTokenizer::from_file(&model_dir.join(TOKENIZER_FILE), max_length)?;

    let scheduler_config = load_scheduler_config(model_dir)?;
    let unet_config = ComponentConfig::from_dir(model_dir, UNET)?;
    let vae_decoder_config = ComponentConfig::from_dir(model_dir, VAE_DECODER)?;

    tracing::info!(kind = %kind, dir = %model_dir.display(), "All models loaded");

    Ok(ModelComponents {
        unet,
        text_encoder,
        vae_encoder,
        vae_decoder,
        controlnet,
        tokenizer: Box::new(tokenizer),
        scheduler_config,
        unet_config,
        vae_decoder_config,
    })
}
