//! Latent consistency model (LCM) scheduler.
//!
//! Each step predicts the fully denoised sample through the consistency
//! boundary condition, then re-noises it to the next timestep of a sparse
//! schedule distilled from `original_inference_steps` anchors.

use super::config::{PredictionType, SchedulerConfig};
use super::schedule::NoiseSchedule;
use super::{Scheduler, StepOutput};
use crate::error::{DiffusionError, Result};
use crate::tensor::{NoiseGenerator, Tensor};

const NAME: &str = "LCMScheduler";

/// Standard deviation of the data distribution in the boundary condition.
const SIGMA_DATA: f64 = 0.5;

/// Timestep scaling applied inside the boundary condition.
const TIMESTEP_SCALING: f64 = 10.0;

#[derive(Debug, Clone)]
pub struct LcmScheduler {
    schedule: NoiseSchedule,
    prediction_type: PredictionType,
    original_inference_steps: usize,
    clip_sample: bool,
    clip_sample_range: f32,
    num_inference_steps: Option<usize>,
    timesteps: Vec<i64>,
    generator: NoiseGenerator,
}

/// `(c_skip, c_out)` for the consistency boundary condition at `timestep`.
pub fn boundary_condition_scalings(timestep: i64) -> (f32, f32) {
    let scaled = timestep as f64 * TIMESTEP_SCALING;
    let denom = scaled * scaled + SIGMA_DATA * SIGMA_DATA;
    let c_skip = SIGMA_DATA * SIGMA_DATA / denom;
    let c_out = scaled / denom.sqrt();
    (c_skip as f32, c_out as f32)
}

impl LcmScheduler {
    pub fn new(config: &SchedulerConfig) -> Result<Self> {
        let schedule = NoiseSchedule::new(config)?;
        let prediction_type = config.prediction_type(NAME)?;
        let timesteps = schedule.training_timesteps();

        Ok(Self {
            schedule,
            prediction_type,
            original_inference_steps: config.original_inference_steps,
            clip_sample: config.clip_sample,
            clip_sample_range: config.clip_sample_range,
            num_inference_steps: None,
            timesteps,
            generator: NoiseGenerator::default(),
        })
    }

    /// `(beta_prev / beta_t) * (1 - alpha_t / alpha_prev)`.
    pub fn get_variance(&self, timestep: i64, prev_timestep: i64) -> Result<f32> {
        let alpha_prod_t = self.schedule.alpha_prod(timestep)? as f64;
        let alpha_prod_t_prev = self.schedule.alpha_prod(prev_timestep)? as f64;
        let beta_prod_t = 1.0 - alpha_prod_t;
        let beta_prod_t_prev = 1.0 - alpha_prod_t_prev;
        Ok(((beta_prod_t_prev / beta_prod_t) * (1.0 - alpha_prod_t / alpha_prod_t_prev)) as f32)
    }

    /// Consistency step at position `time_index` of the schedule.
    pub fn step_at(
        &mut self,
        model_output: &Tensor,
        timestep: i64,
        time_index: usize,
        sample: &Tensor,
    ) -> Result<StepOutput> {
        if self.num_inference_steps.is_none() {
            return Err(DiffusionError::not_configured(NAME));
        }

        let has_next = time_index + 1 < self.timesteps.len();
        let prev_timestep = if has_next {
            self.timesteps[time_index + 1]
        } else {
            timestep
        };

        let alpha_prod_t = self.schedule.alpha_prod(timestep)?;
        let alpha_prod_t_prev = self.schedule.alpha_prod(prev_timestep)?;
        let beta_prod_t = 1.0 - alpha_prod_t;
        let beta_prod_t_prev = 1.0 - alpha_prod_t_prev;

        let (c_skip, c_out) = boundary_condition_scalings(timestep);

        let mut pred_original = match self.prediction_type {
            PredictionType::Epsilon => sample
                .sub(&model_output.mul_scalar(beta_prod_t.sqrt()))?
                .div_scalar(alpha_prod_t.sqrt()),
            PredictionType::Sample => sample.clone(),
            PredictionType::VPrediction => sample
                .mul_scalar(alpha_prod_t.sqrt())
                .sub(&model_output.mul_scalar(beta_prod_t.sqrt()))?,
        };
        if self.clip_sample {
            pred_original.clip_inplace(-self.clip_sample_range, self.clip_sample_range);
        }

        let mut denoised = pred_original.mul_scalar(c_out);
        denoised.add_inplace(&sample.mul_scalar(c_skip))?;

        let prev_sample = if has_next {
            let noise = self.generator.randn_like(model_output);
            let mut prev = denoised.mul_scalar(alpha_prod_t_prev.sqrt());
            prev.add_inplace(&noise.mul_scalar(beta_prod_t_prev.sqrt()))?;
            prev
        } else {
            denoised.clone()
        };

        Ok(StepOutput::with_denoised(prev_sample, denoised))
    }
}

impl Scheduler for LcmScheduler {
    fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()> {
        let train = self.schedule.num_train_timesteps();
        let origin = self.original_inference_steps;
        if num_inference_steps > train {
            return Err(DiffusionError::invalid_config(format!(
                "{} inference steps exceed the {} training timesteps",
                num_inference_steps, train
            )));
        }
        if num_inference_steps == 0 || num_inference_steps > origin || origin > train {
            return Err(DiffusionError::invalid_config(format!(
                "{} inference steps requested, must be between 1 and {} (original_inference_steps)",
                num_inference_steps, origin
            )));
        }

        let c = (train / origin) as i64;
        let anchors: Vec<i64> = (1..=origin as i64).map(|i| i * c - 1).collect();
        let skipping = origin / num_inference_steps;
        self.timesteps = anchors
            .iter()
            .rev()
            .step_by(skipping)
            .take(num_inference_steps)
            .copied()
            .collect();
        self.num_inference_steps = Some(num_inference_steps);

        tracing::debug!(
            steps = num_inference_steps,
            timesteps = ?self.timesteps,
            "LCM timesteps set"
        );
        Ok(())
    }

    fn timesteps(&self) -> &[i64] {
        &self.timesteps
    }

    fn num_inference_steps(&self) -> Option<usize> {
        self.num_inference_steps
    }

    fn step(&mut self, model_output: &Tensor, timestep: i64, sample: &Tensor) -> Result<StepOutput> {
        let time_index = self
            .timesteps
            .iter()
            .position(|&t| t == timestep)
            .ok_or_else(|| {
                DiffusionError::invalid_input(format!(
                    "Timestep {} is not part of the current schedule",
                    timestep
                ))
            })?;
        self.step_at(model_output, timestep, time_index, sample)
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

    fn lcm_config() -> SchedulerConfig {
        SchedulerConfig {
            class_name: Some(NAME.to_string()),
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: "scaled_linear".to_string(),
            set_alpha_to_one: true,
            ..SchedulerConfig::default()
        }
    }

    fn configured(steps: usize) -> LcmScheduler {
        let mut s = LcmScheduler::new(&lcm_config()).unwrap();
        s.set_timesteps(steps).unwrap();
        s.reseed("lcm");
        s
    }

    #[test]
    fn timesteps_subsample_anchors_from_the_end() {
        let s = configured(4);
        assert_eq!(s.timesteps(), &[999, 759, 519, 279]);
        let s = configured(1);
        assert_eq!(s.timesteps(), &[999]);
        let s = configured(50);
        assert_eq!(s.timesteps().len(), 50);
        assert_eq!(s.timesteps().last(), Some(&19));
    }

    #[test]
    fn step_counts_out_of_range_fail() {
        let mut s = LcmScheduler::new(&lcm_config()).unwrap();
        assert_eq!(s.set_timesteps(1001).unwrap_err().code, ErrorCode::InvalidConfig);
        assert_eq!(s.set_timesteps(0).unwrap_err().code, ErrorCode::InvalidConfig);
        assert_eq!(s.set_timesteps(51).unwrap_err().code, ErrorCode::InvalidConfig);
    }

    #[test]
    fn boundary_scalings_at_zero_and_large_timesteps() {
        let (c_skip, c_out) = boundary_condition_scalings(0);
        assert_eq!(c_skip, 1.0);
        assert_eq!(c_out, 0.0);
        let (c_skip, c_out) = boundary_condition_scalings(999);
        assert!(c_skip < 1e-6);
        assert!((c_out - 1.0).abs() < 1e-6);
    }

    #[test]
    fn final_step_returns_denoised() {
        let mut s = configured(4);
        let sample = Tensor::full(&[1, 4, 2, 2], 0.7);
        let output = Tensor::full(&[1, 4, 2, 2], 0.1);
        let out = s.step_at(&output, 279, 3, &sample).unwrap();
        assert_eq!(Some(out.prev_sample), out.denoised);
    }

    #[test]
    fn intermediate_step_renoises_towards_next_timestep() {
        let mut a = configured(4);
        let mut b = configured(4);
        let sample = Tensor::full(&[1, 4, 2, 2], 0.7);
        let output = Tensor::full(&[1, 4, 2, 2], 0.1);

        let out_a = a.step(&output, 999, &sample).unwrap();
        let out_b = b.step(&output, 999, &sample).unwrap();
        assert_eq!(out_a.prev_sample, out_b.prev_sample);
        assert_ne!(Some(out_a.prev_sample.clone()), out_a.denoised);

        // Epsilon x0 prediction through the boundary condition.
        let a_t = a.schedule.alpha_prod(999).unwrap();
        let x0 = (0.7 - 0.1 * (1.0 - a_t).sqrt()) / a_t.sqrt();
        let (c_skip, c_out) = boundary_condition_scalings(999);
        let want = x0 * c_out + 0.7 * c_skip;
        let denoised = out_a.denoised.unwrap();
        assert!(denoised.to_vec().iter().all(|v| (v - want).abs() < 1e-4));
    }

    #[test]
    fn sample_and_v_prediction() {
        let sample = Tensor::full(&[1], 0.5);
        let output = Tensor::full(&[1], 0.2);

        let mut s = LcmScheduler::new(&SchedulerConfig {
            prediction_type: "sample".to_string(),
            ..lcm_config()
        })
        .unwrap();
        s.set_timesteps(1).unwrap();
        let out = s.step_at(&output, 999, 0, &sample).unwrap();
        let (c_skip, c_out) = boundary_condition_scalings(999);
        // The latent itself is taken as the x0 estimate.
        let want = 0.5 * c_out + 0.5 * c_skip;
        assert!((out.prev_sample.to_vec()[0] - want).abs() < 1e-6);

        let mut s = LcmScheduler::new(&SchedulerConfig {
            prediction_type: "v_prediction".to_string(),
            ..lcm_config()
        })
        .unwrap();
        s.set_timesteps(1).unwrap();
        let out = s.step_at(&output, 999, 0, &sample).unwrap();
        let a_t = s.schedule.alpha_prod(999).unwrap();
        let x0 = 0.5 * a_t.sqrt() - 0.2 * (1.0 - a_t).sqrt();
        let want = x0 * c_out + 0.5 * c_skip;
        assert!((out.prev_sample.to_vec()[0] - want).abs() < 1e-5);
    }

    #[test]
    fn clip_sample_bounds_the_x0_estimate() {
        let sample = Tensor::full(&[1, 4, 2, 2], 5.0);
        let output = Tensor::zeros(&[1, 4, 2, 2]);
        let (c_skip, c_out) = boundary_condition_scalings(999);

        for range in [1.0f32, 0.5] {
            let mut s = LcmScheduler::new(&SchedulerConfig {
                clip_sample: true,
                clip_sample_range: range,
                ..lcm_config()
            })
            .unwrap();
            s.set_timesteps(1).unwrap();
            let out = s.step_at(&output, 999, 0, &sample).unwrap();
            let want = range * c_out + 5.0 * c_skip;
            let denoised = out.denoised.unwrap();
            assert!(denoised.to_vec().iter().all(|v| (v - want).abs() < 1e-5), "range {}", range);
        }

        // Without clipping the same inputs overshoot the range.
        let mut s = LcmScheduler::new(&lcm_config()).unwrap();
        s.set_timesteps(1).unwrap();
        let out = s.step_at(&output, 999, 0, &sample).unwrap();
        assert!(out.prev_sample.to_vec().iter().all(|&v| v > 1.5));
    }

    #[test]
    fn variance_is_zero_for_same_timestep() {
        let s = configured(4);
        assert_eq!(s.get_variance(500, 500).unwrap(), 0.0);
        assert!(s.get_variance(759, 519).unwrap() > 0.0);
    }

    #[test]
    fn unknown_timestep_is_rejected() {
        let mut s = configured(4);
        let x = Tensor::zeros(&[1]);
        assert!(s.step(&x, 500, &x).is_err());
    }

    #[test]
    fn step_before_set_timesteps_fails() {
        let mut s = LcmScheduler::new(&lcm_config()).unwrap();
        let x = Tensor::zeros(&[1]);
        assert_eq!(s.step_at(&x, 999, 0, &x).unwrap_err().code, ErrorCode::NotConfigured);
    }
}
