//! Pseudo numerical methods for diffusion models (PNDM).
//!
//! A Runge-Kutta startup phase (PRK) followed by a linear multistep phase
//! (PLMS). Stable Diffusion exports set `skip_prk_steps`, in which case the
//! multistep history is bootstrapped from a duplicated timestep instead.

use super::config::{PredictionType, SchedulerConfig};
use super::schedule::NoiseSchedule;
use super::{Scheduler, StepOutput};
use crate::error::{DiffusionError, Result};
use crate::tensor::Tensor;

const NAME: &str = "PNDMScheduler";

/// Number of history entries the multistep method blends.
const PNDM_ORDER: usize = 4;

#[derive(Debug, Clone)]
pub struct PndmScheduler {
    schedule: NoiseSchedule,
    prediction_type: PredictionType,
    skip_prk_steps: bool,
    steps_offset: i64,
    num_inference_steps: Option<usize>,
    timesteps: Vec<i64>,
    prk_timesteps: Vec<i64>,
    plms_timesteps: Vec<i64>,
    /// Up to four most recent model outputs.
    ets: Vec<Tensor>,
    counter: usize,
    /// Runge-Kutta accumulator, `None` means zero.
    cur_model_output: Option<Tensor>,
    cur_sample: Option<Tensor>,
}

impl PndmScheduler {
    pub fn new(config: &SchedulerConfig) -> Result<Self> {
        let schedule = NoiseSchedule::new(config)?;
        let prediction_type = config.prediction_type(NAME)?;
        if prediction_type == PredictionType::Sample {
            return Err(DiffusionError::unsupported_prediction_type(
                prediction_type.as_str(),
                NAME,
            ));
        }
        let timesteps = schedule.training_timesteps();

        Ok(Self {
            schedule,
            prediction_type,
            skip_prk_steps: config.skip_prk_steps,
            steps_offset: config.steps_offset,
            num_inference_steps: None,
            timesteps,
            prk_timesteps: Vec::new(),
            plms_timesteps: Vec::new(),
            ets: Vec::new(),
            counter: 0,
            cur_model_output: None,
            cur_sample: None,
        })
    }

    pub fn prk_timesteps(&self) -> &[i64] {
        &self.prk_timesteps
    }

    pub fn plms_timesteps(&self) -> &[i64] {
        &self.plms_timesteps
    }

    pub fn noise_schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    fn configured_steps(&self) -> Result<usize> {
        self.num_inference_steps
            .ok_or_else(|| DiffusionError::not_configured(NAME))
    }

    fn step_ratio(&self) -> Result<i64> {
        Ok((self.schedule.num_train_timesteps() / self.configured_steps()?) as i64)
    }

    fn in_prk_phase(&self) -> bool {
        !self.skip_prk_steps && self.counter < self.prk_timesteps.len()
    }

    /// One Runge-Kutta stage. Four consecutive calls make one full step.
    pub fn step_prk(&mut self, model_output: &Tensor, timestep: i64, sample: &Tensor) -> Result<StepOutput> {
        let ratio = self.step_ratio()?;
        let diff_to_prev = if self.counter % 2 == 0 { ratio / 2 } else { 0 };
        let prev_timestep = timestep - diff_to_prev;
        let timestep = *self
            .prk_timesteps
            .get(self.counter / 4 * 4)
            .ok_or_else(|| DiffusionError::invalid_config("Runge-Kutta phase already completed"))?;

        let model_output = match self.counter % 4 {
            0 => {
                self.accumulate(model_output, 1.0 / 6.0)?;
                self.ets.push(model_output.clone());
                self.cur_sample = Some(sample.clone());
                model_output.clone()
            }
            1 | 2 => {
                self.accumulate(model_output, 1.0 / 3.0)?;
                model_output.clone()
            }
            _ => match self.cur_model_output.take() {
                Some(acc) => acc.add(&model_output.mul_scalar(1.0 / 6.0))?,
                None => model_output.mul_scalar(1.0 / 6.0),
            },
        };

        let cur_sample = self.cur_sample.as_ref().unwrap_or(sample);
        let prev_sample = self.prev_sample(cur_sample, timestep, prev_timestep, &model_output)?;
        self.counter += 1;

        Ok(StepOutput::new(prev_sample))
    }

    fn accumulate(&mut self, model_output: &Tensor, weight: f32) -> Result<()> {
        let weighted = model_output.mul_scalar(weight);
        match self.cur_model_output.as_mut() {
            Some(acc) => acc.add_inplace(&weighted)?,
            None => self.cur_model_output = Some(weighted),
        }
        Ok(())
    }

    /// One linear multistep update.
    pub fn step_plms(&mut self, model_output: &Tensor, timestep: i64, sample: &Tensor) -> Result<StepOutput> {
        let ratio = self.step_ratio()?;
        let mut prev_timestep = timestep - ratio;
        let mut timestep = timestep;
        if self.counter == 1 {
            prev_timestep = timestep;
            timestep += ratio;
        }

        let (model_output, sample) = self.plms_model_output(model_output, sample)?;
        let prev_sample = self.prev_sample(&sample, timestep, prev_timestep, &model_output)?;
        self.counter += 1;

        Ok(StepOutput::new(prev_sample))
    }

    /// Updates the history and returns the blended output plus the sample the
    /// update starts from.
    fn plms_model_output(&mut self, model_output: &Tensor, sample: &Tensor) -> Result<(Tensor, Tensor)> {
        if self.counter != 1 {
            let keep_from = self.ets.len().saturating_sub(PNDM_ORDER - 1);
            self.ets.drain(..keep_from);
            self.ets.push(model_output.clone());
        }

        match (self.ets.len(), self.counter) {
            (1, 0) => {
                self.cur_sample = Some(sample.clone());
                Ok((model_output.clone(), sample.clone()))
            }
            (1, 1) => {
                let blended = model_output.add(&self.ets[0])?.div_scalar(2.0);
                let cached = self.cur_sample.take().unwrap_or_else(|| sample.clone());
                Ok((blended, cached))
            }
            _ => Ok((linear_multistep(&self.ets)?, sample.clone())),
        }
    }

    /// Maps `sample` at `timestep` to `prev_timestep` given the network output.
    fn prev_sample(
        &self,
        sample: &Tensor,
        timestep: i64,
        prev_timestep: i64,
        model_output: &Tensor,
    ) -> Result<Tensor> {
        let alpha_prod_t = self.schedule.alpha_prod(timestep)? as f64;
        let alpha_prod_t_prev = self.schedule.alpha_prod(prev_timestep)? as f64;
        let beta_prod_t = 1.0 - alpha_prod_t;
        let beta_prod_t_prev = 1.0 - alpha_prod_t_prev;

        let model_output = match self.prediction_type {
            PredictionType::Epsilon => model_output.clone(),
            PredictionType::VPrediction => {
                let mut eps = model_output.mul_scalar(alpha_prod_t.sqrt() as f32);
                eps.add_inplace(&sample.mul_scalar(beta_prod_t.sqrt() as f32))?;
                eps
            }
            PredictionType::Sample => {
                return Err(DiffusionError::unsupported_prediction_type(
                    self.prediction_type.as_str(),
                    NAME,
                ))
            }
        };

        let sample_coeff = (alpha_prod_t_prev / alpha_prod_t).sqrt();
        let denom = alpha_prod_t * beta_prod_t_prev.sqrt()
            + (alpha_prod_t * beta_prod_t * alpha_prod_t_prev).sqrt();
        let output_coeff = (alpha_prod_t_prev - alpha_prod_t) / denom;

        let mut prev = sample.mul_scalar(sample_coeff as f32);
        prev.sub_inplace(&model_output.mul_scalar(output_coeff as f32))?;
        Ok(prev)
    }
}

/// Adams-Bashforth blend of the history, newest entry last.
fn linear_multistep(ets: &[Tensor]) -> Result<Tensor> {
    let coefficients: &[f32] = match ets.len() {
        0 => return Err(DiffusionError::not_configured(NAME)),
        1 => &[1.0],
        2 => &[3.0 / 2.0, -1.0 / 2.0],
        3 => &[23.0 / 12.0, -16.0 / 12.0, 5.0 / 12.0],
        _ => &[55.0 / 24.0, -59.0 / 24.0, 37.0 / 24.0, -9.0 / 24.0],
    };
    let newest = &ets[ets.len() - 1];
    let mut blended = newest.mul_scalar(coefficients[0]);
    for (k, &c) in coefficients.iter().enumerate().skip(1) {
        blended.add_inplace(&ets[ets.len() - 1 - k].mul_scalar(c))?;
    }
    Ok(blended)
}

impl Scheduler for PndmScheduler {
    fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()> {
        let train = self.schedule.num_train_timesteps();
        if num_inference_steps == 0 || num_inference_steps > train {
            return Err(DiffusionError::invalid_config(format!(
                "{} inference steps requested, must be between 1 and {}",
                num_inference_steps, train
            )));
        }
        self.num_inference_steps = Some(num_inference_steps);

        let n = num_inference_steps;
        let ratio = (train / n) as i64;
        let grid: Vec<i64> = (0..n as i64).map(|i| i * ratio + self.steps_offset).collect();

        if self.skip_prk_steps {
            self.prk_timesteps = Vec::new();
            // The second-highest timestep is repeated for the multistep
            // bootstrap and the lowest grid point is dropped, so the loop
            // still runs exactly `n` steps.
            let mut plms = if n >= 2 {
                let mut v = grid[1..n - 1].to_vec();
                v.push(grid[n - 2]);
                v
            } else {
                Vec::new()
            };
            plms.push(grid[n - 1]);
            plms.reverse();
            self.plms_timesteps = plms;
        } else {
            let half = ratio / 2;
            let tail = &grid[n.saturating_sub(PNDM_ORDER)..];
            let mut stages: Vec<i64> = tail.iter().flat_map(|&t| [t, t + half]).collect();
            stages.pop();
            let repeated: Vec<i64> = stages.iter().flat_map(|&t| [t, t]).collect();
            let mut prk = repeated[1..repeated.len() - 1].to_vec();
            prk.reverse();
            self.prk_timesteps = prk;

            let mut plms = grid[..n.saturating_sub(3)].to_vec();
            plms.reverse();
            self.plms_timesteps = plms;
        }

        self.timesteps = self
            .prk_timesteps
            .iter()
            .chain(self.plms_timesteps.iter())
            .copied()
            .collect();

        self.ets.clear();
        self.counter = 0;
        self.cur_model_output = None;
        self.cur_sample = None;

        tracing::debug!(
            steps = n,
            prk = self.prk_timesteps.len(),
            plms = self.plms_timesteps.len(),
            "PNDM timesteps set"
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
        self.configured_steps()?;
        if self.in_prk_phase() {
            self.step_prk(model_output, timestep, sample)
        } else {
            self.step_plms(model_output, timestep, sample)
        }
    }

    fn add_noise(&self, original: &Tensor, noise: &Tensor, timestep: i64) -> Result<Tensor> {
        self.schedule.add_noise(original, noise, timestep)
    }
}
