//! Euler discrete scheduler (Karras et al. algorithm 2).
//!
//! Works in sigma space: the latent is scaled by `1 / sqrt(sigma^2 + 1)`
//! before every network call and updated with a first-order Euler step.

use super::config::{PredictionType, SchedulerConfig};
use super::schedule::NoiseSchedule;
use super::{Scheduler, StepOutput};
use crate::error::{DiffusionError, Result};
use crate::tensor::{NoiseGenerator, Tensor};

const NAME: &str = "EulerDiscreteScheduler";

/// Stochastic churn parameters for [`EulerDiscreteScheduler::step_with`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EulerStepParams {
    pub s_churn: f32,
    pub s_tmin: f32,
    pub s_tmax: f32,
    pub s_noise: f32,
}

impl Default for EulerStepParams {
    fn default() -> Self {
        Self {
            s_churn: 0.0,
            s_tmin: 0.0,
            s_tmax: f32::INFINITY,
            s_noise: 1.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EulerDiscreteScheduler {
    schedule: NoiseSchedule,
    /// Sigma for every training timestep, ascending with the timestep.
    train_sigmas: Vec<f32>,
    num_inference_steps: Option<usize>,
    timesteps: Vec<i64>,
    /// Per-step sigmas with a trailing zero.
    sigmas: Vec<f32>,
    step_index: usize,
    init_noise_sigma: f32,
    generator: NoiseGenerator,
}

impl EulerDiscreteScheduler {
    pub fn new(config: &SchedulerConfig) -> Result<Self> {
        let schedule = NoiseSchedule::new(config)?;
        let prediction_type = config.prediction_type(NAME)?;
        if prediction_type != PredictionType::Epsilon {
            return Err(DiffusionError::unsupported_prediction_type(
                prediction_type.as_str(),
                NAME,
            ));
        }

        let train_sigmas: Vec<f32> = schedule
            .alphas_cumprod
            .to_vec()
            .iter()
            .map(|&a| ((1.0 - a) / a).sqrt())
            .collect();

        // Before set_timesteps: the full training curve, descending, plus zero.
        let mut sigmas: Vec<f32> = train_sigmas.iter().rev().copied().collect();
        sigmas.push(0.0);
        let init_noise_sigma = sigmas.iter().copied().fold(0.0, f32::max);
        let timesteps = schedule.training_timesteps();

        Ok(Self {
            schedule,
            train_sigmas,
            num_inference_steps: None,
            timesteps,
            sigmas,
            step_index: 0,
            init_noise_sigma,
            generator: NoiseGenerator::default(),
        })
    }

    pub fn sigmas(&self) -> &[f32] {
        &self.sigmas
    }

    pub fn step_index(&self) -> usize {
        self.step_index
    }

    fn current_sigma(&self) -> Result<f32> {
        if self.num_inference_steps.is_none() {
            return Err(DiffusionError::not_configured(NAME));
        }
        self.sigmas
            .get(self.step_index)
            .copied()
            .filter(|_| self.step_index + 1 < self.sigmas.len())
            .ok_or_else(|| {
                DiffusionError::invalid_input(format!(
                    "{} already completed {} steps",
                    NAME, self.step_index
                ))
            })
    }

    /// Euler step with explicit churn parameters.
    pub fn step_with(
        &mut self,
        model_output: &Tensor,
        sample: &Tensor,
        params: EulerStepParams,
    ) -> Result<StepOutput> {
        let sigma = self.current_sigma()?;
        let sigma_next = self.sigmas[self.step_index + 1];

        let gamma = if params.s_tmin <= sigma && sigma <= params.s_tmax {
            let steps = (self.sigmas.len() - 1) as f32;
            (params.s_churn / steps).min(2f32.sqrt() - 1.0)
        } else {
            0.0
        };
        let sigma_hat = sigma * (gamma + 1.0);

        // Drawn on every step so the noise stream does not depend on churn.
        let noise = self
            .generator
            .randn_like(model_output)
            .mul_scalar(params.s_noise);
        let sample = if gamma > 0.0 {
            let scale = (sigma_hat * sigma_hat - sigma * sigma).sqrt();
            sample.add(&noise.mul_scalar(scale))?
        } else {
            sample.clone()
        };

        let denoised = sample.sub(&model_output.mul_scalar(sigma_hat))?;
        let derivative = sample.sub(&denoised)?.div_scalar(sigma_hat);
        let dt = sigma_next - sigma_hat;
        let prev_sample = sample.add(&derivative.mul_scalar(dt))?;

        self.step_index += 1;
        Ok(StepOutput::with_denoised(prev_sample, denoised))
    }
}

impl Scheduler for EulerDiscreteScheduler {
    fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()> {
        let train = self.schedule.num_train_timesteps();
        if num_inference_steps == 0 || num_inference_steps > train {
            return Err(DiffusionError::invalid_config(format!(
                "{} inference steps requested, must be between 1 and {}",
                num_inference_steps, train
            )));
        }
        let ratio = (train / num_inference_steps) as i64;
        self.timesteps = (1..=num_inference_steps as i64)
            .rev()
            .map(|i| i * ratio - 1)
            .collect();

        let grid: Vec<f32> = (0..train).map(|i| i as f32).collect();
        let at: Vec<f32> = self.timesteps.iter().map(|&t| t as f32).collect();
        let mut sigmas = Tensor::interp(&at, &grid, &self.train_sigmas)?.to_vec();
        sigmas.push(0.0);

        self.init_noise_sigma = sigmas.iter().copied().fold(0.0, f32::max);
        self.sigmas = sigmas;
        self.step_index = 0;
        self.num_inference_steps = Some(num_inference_steps);

        tracing::debug!(
            steps = num_inference_steps,
            init_noise_sigma = self.init_noise_sigma,
            "Euler timesteps set"
        );
        Ok(())
    }

    fn timesteps(&self) -> &[i64] {
        &self.timesteps
    }

    fn num_inference_steps(&self) -> Option<usize> {
        self.num_inference_steps
    }

    fn step(&mut self, model_output: &Tensor, _timestep: i64, sample: &Tensor) -> Result<StepOutput> {
        self.step_with(model_output, sample, EulerStepParams::default())
    }

    fn scale_model_input(&self, sample: &Tensor) -> Result<Tensor> {
        let sigma = self.current_sigma()?;
        Ok(sample.div_scalar((sigma * sigma + 1.0).sqrt()))
    }

    fn init_noise_sigma(&self) -> f32 {
        self.init_noise_sigma
    }

    fn add_noise(&self, original: &Tensor, noise: &Tensor, timestep: i64) -> Result<Tensor> {
        self.schedule.add_noise(original, noise, timestep)
    }

    fn reseed(&mut self, seed: &str) {
        self.generator = NoiseGenerator::from_seed(seed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn turbo_config() -> SchedulerConfig {
        SchedulerConfig {
            class_name: Some(NAME.to_string()),
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: "scaled_linear".to_string(),
            ..SchedulerConfig::default()
        }
    }

    #[test]
    fn timesteps_are_trailing_grid() {
        let mut s = EulerDiscreteScheduler::new(&turbo_config()).unwrap();
        s.set_timesteps(4).unwrap();
        assert_eq!(s.timesteps(), &[999, 749, 499, 249]);
        assert_eq!(s.sigmas().len(), 5);
        assert_eq!(s.sigmas()[4], 0.0);
        assert!(s.sigmas().windows(2).all(|w| w[0] > w[1]));

        s.set_timesteps(1).unwrap();
        assert_eq!(s.timesteps(), &[999]);
    }

    #[test]
    fn sigmas_match_training_curve_at_timesteps() {
        let mut s = EulerDiscreteScheduler::new(&turbo_config()).unwrap();
        s.set_timesteps(4).unwrap();
        for (i, &t) in s.timesteps().to_vec().iter().enumerate() {
            let a = s.schedule.alpha_prod(t).unwrap();
            let want = ((1.0 - a) / a).sqrt();
            assert!((s.sigmas()[i] - want).abs() < 1e-4);
        }
        assert_eq!(s.init_noise_sigma(), s.sigmas()[0]);
    }

    #[test]
    fn scale_model_input_divides_by_sigma_norm() {
        let mut s = EulerDiscreteScheduler::new(&turbo_config()).unwrap();
        s.set_timesteps(2).unwrap();
        let sigma = s.sigmas()[0];
        let x = Tensor::full(&[1, 4, 2, 2], 3.0);
        let scaled = s.scale_model_input(&x).unwrap();
        let want = 3.0 / (sigma * sigma + 1.0).sqrt();
        assert!(scaled.to_vec().iter().all(|v| (v - want).abs() < 1e-5));
    }

    #[test]
    fn deterministic_step_without_churn() {
        let mut a = EulerDiscreteScheduler::new(&turbo_config()).unwrap();
        let mut b = EulerDiscreteScheduler::new(&turbo_config()).unwrap();
        a.set_timesteps(4).unwrap();
        b.set_timesteps(4).unwrap();
        a.reseed("one");
        b.reseed("two");

        let sample = Tensor::full(&[1, 4, 2, 2], 2.0);
        let output = Tensor::full(&[1, 4, 2, 2], 0.5);
        let sigma = a.sigmas()[0];
        let sigma_next = a.sigmas()[1];

        let out_a = a.step(&output, 999, &sample).unwrap();
        let out_b = b.step(&output, 999, &sample).unwrap();
        assert_eq!(out_a.prev_sample, out_b.prev_sample);

        let denoised = out_a.denoised.unwrap();
        let want_denoised = 2.0 - 0.5 * sigma;
        assert!(denoised.to_vec().iter().all(|v| (v - want_denoised).abs() < 1e-4));
        let derivative = (2.0 - want_denoised) / sigma;
        let want = 2.0 + derivative * (sigma_next - sigma);
        assert!(out_a.prev_sample.to_vec().iter().all(|v| (v - want).abs() < 1e-4));
        assert_eq!(a.step_index(), 1);
    }

    #[test]
    fn churn_injects_seeded_noise() {
        let params = EulerStepParams {
            s_churn: 1.0,
            ..EulerStepParams::default()
        };
        let sample = Tensor::full(&[1, 4, 2, 2], 2.0);
        let output = Tensor::full(&[1, 4, 2, 2], 0.5);

        let run = |seed: &str| {
            let mut s = EulerDiscreteScheduler::new(&turbo_config()).unwrap();
            s.set_timesteps(4).unwrap();
            s.reseed(seed);
            s.step_with(&output, &sample, params).unwrap().prev_sample
        };
        assert_eq!(run("abc"), run("abc"));
        assert_ne!(run("abc"), run("xyz"));
    }

    #[test]
    fn noise_stream_advances_without_churn() {
        let mut s = EulerDiscreteScheduler::new(&turbo_config()).unwrap();
        s.set_timesteps(4).unwrap();
        s.reseed("abc");
        let sample = Tensor::full(&[1, 4, 2, 2], 2.0);
        let output = Tensor::full(&[1, 4, 2, 2], 0.5);
        s.step(&output, 999, &sample).unwrap();

        let mut reference = NoiseGenerator::from_seed("abc");
        reference.randn_like(&output);
        assert_eq!(s.generator.randn_like(&output), reference.randn_like(&output));
    }

    #[test]
    fn stepping_past_the_end_fails() {
        let mut s = EulerDiscreteScheduler::new(&turbo_config()).unwrap();
        s.set_timesteps(1).unwrap();
        let x = Tensor::zeros(&[1]);
        s.step(&x, 999, &x).unwrap();
        assert!(s.step(&x, 999, &x).is_err());
    }

    #[test]
    fn use_before_set_timesteps_fails() {
        let mut s = EulerDiscreteScheduler::new(&turbo_config()).unwrap();
        let x = Tensor::zeros(&[1]);
        assert_eq!(s.step(&x, 999, &x).unwrap_err().code, ErrorCode::NotConfigured);
        assert_eq!(s.scale_model_input(&x).unwrap_err().code, ErrorCode::NotConfigured);
    }

    #[test]
    fn non_epsilon_prediction_is_rejected() {
        let config = SchedulerConfig {
            prediction_type: "v_prediction".to_string(),
            ..turbo_config()
        };
        assert!(EulerDiscreteScheduler::new(&config).is_err());
    }
}
