//! Runtime configuration.
//!
//! Holds the model location, execution device selection and the default
//! generation parameters. The model path is an explicit value handed to the
//! loader rather than global state.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Execution device for ONNX inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    /// Best available device.
    /// Priority: Metal (macOS) > CUDA (Linux/Windows) > CPU
    #[default]
    Auto,

    /// Force CPU execution.
    Cpu,

    /// NVIDIA GPU via CUDA.
    Cuda,

    /// Apple Silicon via CoreML.
    Metal,
}

impl Device {
    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Auto => "auto",
            Device::Cpu => "cpu",
            Device::Cuda => "cuda",
            Device::Metal => "metal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "auto" => Some(Device::Auto),
            "cpu" => Some(Device::Cpu),
            "cuda" => Some(Device::Cuda),
            "metal" | "coreml" => Some(Device::Metal),
            _ => None,
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Default generation parameters.
///
/// `steps` and `guidance_scale` are `None` when each pipeline should use its
/// own default (5 and 7.5 for Stable Diffusion, 1 and none for SD Turbo,
/// 8.5 guidance for LCM).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationDefaults {
    pub steps: Option<usize>,
    pub guidance_scale: Option<f32>,
    pub width: usize,
    pub height: usize,
    /// Image-to-image strength.
    pub strength: f32,
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            steps: None,
            guidance_scale: None,
            width: 512,
            height: 512,
            strength: 0.8,
        }
    }
}

/// Runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Directory holding `model_index.json` and the component folders.
    /// If None, uses the platform-specific default location.
    pub model_path: Option<PathBuf>,

    /// Execution device for inference.
    pub device: Device,

    /// Intra-op thread count for ONNX Runtime.
    /// If None, uses ONNX Runtime's default.
    pub threads: Option<usize>,

    pub defaults: GenerationDefaults,
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a config from environment variables.
    ///
    /// Reads the following environment variables:
    /// - `DIFFUSERS_MODEL_PATH` - Model directory
    /// - `DIFFUSERS_DEVICE` - Device selection (auto, cpu, cuda, metal)
    /// - `DIFFUSERS_THREADS` - Intra-op thread count
    /// - `DIFFUSERS_STEPS` - Default inference steps
    /// - `DIFFUSERS_GUIDANCE` - Default guidance scale
    /// - `DIFFUSERS_WIDTH` / `DIFFUSERS_HEIGHT` - Default image size
    ///
    /// Unset or invalid values fall back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(path) = lookup("DIFFUSERS_MODEL_PATH") {
            config.model_path = Some(PathBuf::from(path));
        }

        if let Some(device) = lookup("DIFFUSERS_DEVICE").and_then(|s| Device::parse(&s)) {
            config.device = device;
        }

        if let Some(threads) = lookup("DIFFUSERS_THREADS").and_then(|s| s.parse::<usize>().ok()) {
            if threads > 0 {
                config.threads = Some(threads);
            }
        }

        if let Some(steps) = lookup("DIFFUSERS_STEPS").and_then(|s| s.parse::<usize>().ok()) {
            if steps > 0 && steps <= 1000 {
                config.defaults.steps = Some(steps);
            }
        }

        if let Some(guidance) = lookup("DIFFUSERS_GUIDANCE").and_then(|s| s.parse::<f32>().ok()) {
            if (0.0..=30.0).contains(&guidance) {
                config.defaults.guidance_scale = Some(guidance);
            }
        }

        if let Some(width) = lookup("DIFFUSERS_WIDTH").and_then(|s| s.parse::<usize>().ok()) {
            if width > 0 && width % 8 == 0 {
                config.defaults.width = width;
            }
        }

        if let Some(height) = lookup("DIFFUSERS_HEIGHT").and_then(|s| s.parse::<usize>().ok()) {
            if height > 0 && height % 8 == 0 {
                config.defaults.height = height;
            }
        }

        config
    }

    /// Returns the model path, using the platform default if not specified.
    pub fn effective_model_path(&self) -> PathBuf {
        match self.model_path {
            Some(ref path) => path.clone(),
            None => default_model_path(),
        }
    }

    /// Validates the configuration.
    ///
    /// Returns an error message if validation fails, None otherwise.
    pub fn validate(&self) -> Option<String> {
        if let Some(threads) = self.threads {
            if threads == 0 {
                return Some("threads must be > 0".to_string());
            }
            if threads > 256 {
                return Some(format!("threads too high: {} (max 256)", threads));
            }
        }

        if self.defaults.width % 8 != 0 || self.defaults.height % 8 != 0 {
            return Some(format!(
                "image size {}x{} is not a multiple of 8",
                self.defaults.width, self.defaults.height
            ));
        }

        if !(0.0..=1.0).contains(&self.defaults.strength) {
            return Some(format!(
                "strength must be in [0, 1], got {}",
                self.defaults.strength
            ));
        }

        None
    }
}

/// Returns the platform-specific default model path.
///
/// - macOS: ~/Library/Caches/diffusers-ort/models
/// - Linux: ~/.cache/diffusers-ort/models
/// - Windows: C:\Users\<user>\AppData\Local\diffusers-ort\cache\models
fn default_model_path() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "diffusers-ort") {
        proj_dirs.cache_dir().join("models")
    } else {
        PathBuf::from("./models")
    }
}
