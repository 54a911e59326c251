//! Diffusion schedulers.
//!
//! Implements the PNDMScheduler, EulerDiscreteScheduler and LCMScheduler from
//! diffusers. All three share the beta/alpha noise schedule in [`schedule`]
//! and are driven by the pipelines through [`DynScheduler`].

pub mod config;
pub mod euler;
pub mod lcm;
pub mod pndm;
pub mod schedule;

pub use config::{BetaSchedule, PredictionType, SchedulerConfig};
pub use euler::{EulerDiscreteScheduler, EulerStepParams};
pub use lcm::LcmScheduler;
pub use pndm::PndmScheduler;
pub use schedule::NoiseSchedule;

use crate::error::{DiffusionError, Result};
use crate::tensor::Tensor;

/// Scheduler kind, keyed by the diffusers class name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerKind {
    Pndm,
    EulerDiscrete,
    Lcm,
}

impl SchedulerKind {
    /// Parses a diffusers class name or a short alias.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PNDMScheduler" => return Some(SchedulerKind::Pndm),
            "EulerDiscreteScheduler" => return Some(SchedulerKind::EulerDiscrete),
            "LCMScheduler" => return Some(SchedulerKind::Lcm),
            _ => {}
        }
        match s.to_lowercase().as_str() {
            "pndm" | "plms" => Some(SchedulerKind::Pndm),
            "euler" | "euler_discrete" | "euler-discrete" => Some(SchedulerKind::EulerDiscrete),
            "lcm" => Some(SchedulerKind::Lcm),
            _ => None,
        }
    }

    /// Returns the diffusers class name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerKind::Pndm => "PNDMScheduler",
            SchedulerKind::EulerDiscrete => "EulerDiscreteScheduler",
            SchedulerKind::Lcm => "LCMScheduler",
        }
    }
}

/// Result of one scheduler step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    /// Latent for the next iteration.
    pub prev_sample: Tensor,
    /// Fully denoised prediction, for schedulers that produce one.
    pub denoised: Option<Tensor>,
}

impl StepOutput {
    pub fn new(prev_sample: Tensor) -> Self {
        Self {
            prev_sample,
            denoised: None,
        }
    }

    pub fn with_denoised(prev_sample: Tensor, denoised: Tensor) -> Self {
        Self {
            prev_sample,
            denoised: Some(denoised),
        }
    }

    /// The latent worth decoding as a preview: `denoised` if present.
    pub fn preview(&self) -> &Tensor {
        self.denoised.as_ref().unwrap_or(&self.prev_sample)
    }
}

/// Capability set shared by all schedulers.
pub trait Scheduler {
    /// Computes the timestep sequence for `num_inference_steps` and resets all
    /// running state.
    fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()>;

    /// Timesteps in iteration order.
    fn timesteps(&self) -> &[i64];

    /// Step count passed to the last `set_timesteps`, if any.
    fn num_inference_steps(&self) -> Option<usize>;

    /// Advances `sample` from `timestep` given the network output.
    fn step(&mut self, model_output: &Tensor, timestep: i64, sample: &Tensor) -> Result<StepOutput>;

    /// Scales the latent before it is passed to the network.
    fn scale_model_input(&self, sample: &Tensor) -> Result<Tensor> {
        Ok(sample.clone())
    }

    /// Standard deviation of the initial noise.
    fn init_noise_sigma(&self) -> f32 {
        1.0
    }

    /// Noises `original` to the level of `timestep`.
    fn add_noise(&self, original: &Tensor, noise: &Tensor, timestep: i64) -> Result<Tensor>;

    /// Reseeds the generator used for noise injection.
    fn reseed(&mut self, _seed: &str) {}
}

// ============================================================================
// Scheduler enum for dynamic dispatch
// ============================================================================

/// Scheduler wrapper that can hold any scheduler kind.
#[derive(Debug, Clone)]
pub enum DynScheduler {
    Pndm(PndmScheduler),
    EulerDiscrete(EulerDiscreteScheduler),
    Lcm(LcmScheduler),
}

impl DynScheduler {
    pub fn kind(&self) -> SchedulerKind {
        match self {
            DynScheduler::Pndm(_) => SchedulerKind::Pndm,
            DynScheduler::EulerDiscrete(_) => SchedulerKind::EulerDiscrete,
            DynScheduler::Lcm(_) => SchedulerKind::Lcm,
        }
    }

    pub fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()> {
        match self {
            DynScheduler::Pndm(s) => s.set_timesteps(num_inference_steps),
            DynScheduler::EulerDiscrete(s) => s.set_timesteps(num_inference_steps),
            DynScheduler::Lcm(s) => s.set_timesteps(num_inference_steps),
        }
    }

    pub fn timesteps(&self) -> &[i64] {
        match self {
            DynScheduler::Pndm(s) => s.timesteps(),
            DynScheduler::EulerDiscrete(s) => s.timesteps(),
            DynScheduler::Lcm(s) => s.timesteps(),
        }
    }

    pub fn num_inference_steps(&self) -> Option<usize> {
        match self {
            DynScheduler::Pndm(s) => s.num_inference_steps(),
            DynScheduler::EulerDiscrete(s) => s.num_inference_steps(),
            DynScheduler::Lcm(s) => s.num_inference_steps(),
        }
    }

    /// Performs one step. `time_index` is the position of `timestep` in
    /// [`timesteps`](Self::timesteps); only the LCM scheduler uses it.
    pub fn step(
        &mut self,
        model_output: &Tensor,
        timestep: i64,
        time_index: usize,
        sample: &Tensor,
    ) -> Result<StepOutput> {
        match self {
            DynScheduler::Pndm(s) => s.step(model_output, timestep, sample),
            DynScheduler::EulerDiscrete(s) => s.step(model_output, timestep, sample),
            DynScheduler::Lcm(s) => s.step_at(model_output, timestep, time_index, sample),
        }
    }

    pub fn scale_model_input(&self, sample: &Tensor) -> Result<Tensor> {
        match self {
            DynScheduler::Pndm(s) => s.scale_model_input(sample),
            DynScheduler::EulerDiscrete(s) => s.scale_model_input(sample),
            DynScheduler::Lcm(s) => s.scale_model_input(sample),
        }
    }

    pub fn init_noise_sigma(&self) -> f32 {
        match self {
            DynScheduler::Pndm(s) => s.init_noise_sigma(),
            DynScheduler::EulerDiscrete(s) => s.init_noise_sigma(),
            DynScheduler::Lcm(s) => s.init_noise_sigma(),
        }
    }

    pub fn add_noise(&self, original: &Tensor, noise: &Tensor, timestep: i64) -> Result<Tensor> {
        match self {
            DynScheduler::Pndm(s) => s.add_noise(original, noise, timestep),
            DynScheduler::EulerDiscrete(s) => s.add_noise(original, noise, timestep),
            DynScheduler::Lcm(s) => s.add_noise(original, noise, timestep),
        }
    }

    pub fn reseed(&mut self, seed: &str) {
        match self {
            DynScheduler::Pndm(s) => s.reseed(seed),
            DynScheduler::EulerDiscrete(s) => s.reseed(seed),
            DynScheduler::Lcm(s) => s.reseed(seed),
        }
    }
}

/// Creates a scheduler of the specified kind.
pub fn create_scheduler(kind: SchedulerKind, config: &SchedulerConfig) -> Result<DynScheduler> {
    Ok(match kind {
        SchedulerKind::Pndm => DynScheduler::Pndm(PndmScheduler::new(config)?),
        SchedulerKind::EulerDiscrete => {
            DynScheduler::EulerDiscrete(EulerDiscreteScheduler::new(config)?)
        }
        SchedulerKind::Lcm => DynScheduler::Lcm(LcmScheduler::new(config)?),
    })
}

/// Creates the scheduler named by the config's `_class_name`.
pub fn scheduler_from_config(config: &SchedulerConfig) -> Result<DynScheduler> {
    let name = config
        .class_name
        .as_deref()
        .ok_or_else(|| DiffusionError::invalid_config("Scheduler config has no _class_name"))?;
    let kind = SchedulerKind::parse(name).ok_or_else(|| {
        DiffusionError::invalid_config(format!("Unsupported scheduler class '{}'", name))
    })?;
    create_scheduler(kind, config)
}
