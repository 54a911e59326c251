//! Command-line interface for one-shot image generation.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::config::{Device, RuntimeConfig};

/// Execution device choices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum DeviceArg {
    /// Metal on macOS, CUDA elsewhere, CPU fallback
    #[default]
    Auto,
    Cpu,
    Cuda,
    /// CoreML on Apple Silicon
    Metal,
}

impl From<DeviceArg> for Device {
    fn from(arg: DeviceArg) -> Self {
        match arg {
            DeviceArg::Auto => Device::Auto,
            DeviceArg::Cpu => Device::Cpu,
            DeviceArg::Cuda => Device::Cuda,
            DeviceArg::Metal => Device::Metal,
        }
    }
}

/// diffusers-ort: Stable Diffusion, SD Turbo, LCM and ControlNet on ONNX Runtime
#[derive(Parser, Debug)]
#[command(name = "diffusers-ort")]
#[command(about = "Generate images with ONNX diffusers exports")]
#[command(version)]
pub struct Cli {
    /// Text prompt describing the image
    #[arg(short, long)]
    pub prompt: String,

    /// What the image should not contain
    #[arg(short, long)]
    pub negative_prompt: Option<String>,

    /// Denoising steps (pipeline default when omitted)
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..=1000))]
    pub steps: Option<u32>,

    /// Classifier-free guidance scale (pipeline default when omitted)
    #[arg(short, long)]
    pub guidance: Option<f32>,

    /// Seed string; the same seed reproduces the same image
    #[arg(short, long, default_value = "")]
    pub seed: String,

    /// Image width, a multiple of 8
    #[arg(long)]
    pub width: Option<usize>,

    /// Image height, a multiple of 8
    #[arg(long)]
    pub height: Option<usize>,

    /// Init image for image-to-image
    #[arg(long)]
    pub init_image: Option<PathBuf>,

    /// How far the init image is noised, 0 keeps it, 1 replaces it
    #[arg(long)]
    pub strength: Option<f32>,

    /// Conditioning image for ControlNet models
    #[arg(long)]
    pub control_image: Option<PathBuf>,

    /// ControlNet conditioning scale
    #[arg(long, default_value = "1.0")]
    pub conditioning_scale: f64,

    /// Directory holding model_index.json and the ONNX components
    #[arg(short, long)]
    pub model_dir: Option<PathBuf>,

    /// Execution device
    #[arg(short, long, value_enum)]
    pub device: Option<DeviceArg>,

    /// Output image path
    #[arg(short, long, default_value = "out.png")]
    pub output: PathBuf,

    /// Decode and save a preview after every step
    #[arg(long)]
    pub preview: bool,

    /// Pass timesteps as int64 (SD 1.x exports)
    #[arg(long)]
    pub sd_v1: bool,

    /// Debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Applies the command-line overrides on top of `config`.
    pub fn apply_to(&self, config: &mut RuntimeConfig) {
        if let Some(ref dir) = self.model_dir {
            config.model_path = Some(dir.clone());
        }
        if let Some(device) = self.device {
            config.device = device.into();
        }
    }

    /// Path of the preview written after `step`, next to the output.
    pub fn preview_path(&self, step: usize) -> PathBuf {
        let stem = self
            .output
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "out".to_string());
        self.output.with_file_name(format!("{}_step{:03}.png", stem, step))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_invocation() {
        let cli = Cli::try_parse_from(["diffusers-ort", "--prompt", "a castle"]).unwrap();
        assert_eq!(cli.prompt, "a castle");
        assert_eq!(cli.output, PathBuf::from("out.png"));
        assert_eq!(cli.seed, "");
        assert_eq!(cli.steps, None);
        assert_eq!(cli.conditioning_scale, 1.0);
        assert!(!cli.preview);
    }

    #[test]
    fn rejects_zero_steps_and_missing_prompt() {
        assert!(Cli::try_parse_from(["diffusers-ort", "-p", "x", "--steps", "0"]).is_err());
        assert!(Cli::try_parse_from(["diffusers-ort"]).is_err());
    }

    #[test]
    fn overrides_config() {
        let cli = Cli::try_parse_from([
            "diffusers-ort",
            "-p",
            "x",
            "--model-dir",
            "/models/sd-turbo",
            "--device",
            "cpu",
        ])
        .unwrap();
        let mut config = RuntimeConfig::default();
        cli.apply_to(&mut config);
        assert_eq!(config.model_path, Some(PathBuf::from("/models/sd-turbo")));
        assert_eq!(config.device, Device::Cpu);
    }

    #[test]
    fn preview_paths_sit_next_to_output() {
        let cli =
            Cli::try_parse_from(["diffusers-ort", "-p", "x", "-o", "renders/fox.png"]).unwrap();
        assert_eq!(cli.preview_path(3), PathBuf::from("renders/fox_step003.png"));
    }
}
