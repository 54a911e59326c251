//! Scheduler configuration as stored in `scheduler/scheduler_config.json`.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{DiffusionError, Result};

/// Noise schedule shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BetaSchedule {
    Linear,
    ScaledLinear,
    SquaredCosCapV2,
}

impl BetaSchedule {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "linear" => Some(BetaSchedule::Linear),
            "scaled_linear" => Some(BetaSchedule::ScaledLinear),
            "squaredcos_cap_v2" => Some(BetaSchedule::SquaredCosCapV2),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BetaSchedule::Linear => "linear",
            BetaSchedule::ScaledLinear => "scaled_linear",
            BetaSchedule::SquaredCosCapV2 => "squaredcos_cap_v2",
        }
    }
}

/// What the noise-prediction network outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictionType {
    /// The noise that was added.
    Epsilon,
    /// Velocity, `sqrt(a) * noise - sqrt(1 - a) * x0`.
    VPrediction,
    /// The denoised sample itself.
    Sample,
}

impl PredictionType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "epsilon" => Some(PredictionType::Epsilon),
            "v_prediction" => Some(PredictionType::VPrediction),
            "sample" => Some(PredictionType::Sample),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PredictionType::Epsilon => "epsilon",
            PredictionType::VPrediction => "v_prediction",
            PredictionType::Sample => "sample",
        }
    }
}

/// Scheduler configuration record.
///
/// Missing JSON fields take the diffusers defaults. Unknown fields such as
/// `timestep_spacing` are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Diffusers class name, e.g. `PNDMScheduler`.
    #[serde(rename = "_class_name", skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    pub num_train_timesteps: usize,
    pub beta_start: f64,
    pub beta_end: f64,
    pub beta_schedule: String,
    /// Explicit betas; when present they replace the computed schedule.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trained_betas: Option<Vec<f64>>,
    pub prediction_type: String,
    pub clip_sample: bool,
    pub clip_sample_range: f32,
    pub set_alpha_to_one: bool,
    pub skip_prk_steps: bool,
    pub steps_offset: i64,
    /// Number of anchor timesteps the LCM schedule is distilled from.
    pub original_inference_steps: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            class_name: None,
            num_train_timesteps: 1000,
            beta_start: 0.0001,
            beta_end: 0.02,
            beta_schedule: "linear".to_string(),
            trained_betas: None,
            prediction_type: "epsilon".to_string(),
            clip_sample: false,
            clip_sample_range: 1.0,
            set_alpha_to_one: false,
            skip_prk_steps: false,
            steps_offset: 0,
            original_inference_steps: 50,
        }
    }
}

impl SchedulerConfig {
    /// The Stable Diffusion v1 PNDM configuration.
    pub fn stable_diffusion() -> Self {
        Self {
            class_name: Some("PNDMScheduler".to_string()),
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: "scaled_linear".to_string(),
            skip_prk_steps: true,
            steps_offset: 1,
            ..Self::default()
        }
    }

    /// Parses a configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            DiffusionError::invalid_config(format!("Invalid scheduler config: {}", e))
        })
    }

    /// Reads a configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            DiffusionError::model_load_failed(format!("{}: {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }

    /// Resolves `beta_schedule`, failing for unknown names.
    pub fn beta_schedule(&self) -> Result<BetaSchedule> {
        BetaSchedule::parse(&self.beta_schedule)
            .ok_or_else(|| DiffusionError::unsupported_beta_schedule(&self.beta_schedule))
    }

    /// Resolves `prediction_type`, failing for unknown names.
    pub fn prediction_type(&self, scheduler: &str) -> Result<PredictionType> {
        PredictionType::parse(&self.prediction_type).ok_or_else(|| {
            DiffusionError::unsupported_prediction_type(&self.prediction_type, scheduler)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn parses_diffusers_json() {
        let json = r#"{
            "_class_name": "PNDMScheduler",
            "_diffusers_version": "0.6.0",
            "beta_end": 0.012,
            "beta_schedule": "scaled_linear",
            "beta_start": 0.00085,
            "num_train_timesteps": 1000,
            "set_alpha_to_one": false,
            "skip_prk_steps": true,
            "steps_offset": 1,
            "timestep_spacing": "leading",
            "trained_betas": null
        }"#;
        let config = SchedulerConfig::from_json(json).unwrap();
        assert_eq!(config, SchedulerConfig::stable_diffusion());
        assert_eq!(config.beta_schedule().unwrap(), BetaSchedule::ScaledLinear);
        assert_eq!(
            config.prediction_type("PNDMScheduler").unwrap(),
            PredictionType::Epsilon
        );
    }

    #[test]
    fn missing_fields_use_defaults() {
        let config = SchedulerConfig::from_json("{}").unwrap();
        assert_eq!(config.num_train_timesteps, 1000);
        assert_eq!(config.original_inference_steps, 50);
        assert_eq!(config.beta_schedule, "linear");
    }

    #[test]
    fn unknown_names_are_config_errors() {
        let config = SchedulerConfig {
            beta_schedule: "sigmoid".to_string(),
            prediction_type: "x0".to_string(),
            ..SchedulerConfig::default()
        };
        assert_eq!(config.beta_schedule().unwrap_err().code, ErrorCode::InvalidConfig);
        assert_eq!(
            config.prediction_type("LCMScheduler").unwrap_err().code,
            ErrorCode::InvalidConfig
        );
    }

    #[test]
    fn malformed_json_is_rejected() {
        assert!(SchedulerConfig::from_json("{ not json").is_err());
    }

    #[test]
    fn enum_names_round_trip() {
        for name in ["linear", "scaled_linear", "squaredcos_cap_v2"] {
            assert_eq!(BetaSchedule::parse(name).unwrap().as_str(), name);
        }
        for name in ["epsilon", "v_prediction", "sample"] {
            assert_eq!(PredictionType::parse(name).unwrap().as_str(), name);
        }
    }
}
