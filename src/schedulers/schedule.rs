//! Beta/alpha noise schedule shared by every scheduler.

use std::f64::consts::PI;

use super::config::{BetaSchedule, SchedulerConfig};
use crate::error::{DiffusionError, Result};
use crate::tensor::Tensor;

/// Cap applied to betas derived from an alpha-bar function.
pub const MAX_BETA: f64 = 0.999;

/// Shape of the alpha-bar curve used by [`betas_for_alpha_bar`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlphaTransform {
    /// `cos((t + 0.008) / 1.008 * pi / 2)^2`
    Cosine,
    /// `exp(-12 t)`
    Exp,
}

impl AlphaTransform {
    fn alpha_bar(&self, t: f64) -> f64 {
        match self {
            AlphaTransform::Cosine => ((t + 0.008) / 1.008 * PI / 2.0).cos().powi(2),
            AlphaTransform::Exp => (t * -12.0).exp(),
        }
    }
}

/// Discretizes an alpha-bar function into `num_diffusion_timesteps` betas.
pub fn betas_for_alpha_bar(
    num_diffusion_timesteps: usize,
    max_beta: f64,
    transform: AlphaTransform,
) -> Tensor {
    let n = num_diffusion_timesteps as f64;
    let betas = (0..num_diffusion_timesteps)
        .map(|i| {
            let t1 = i as f64 / n;
            let t2 = (i + 1) as f64 / n;
            let beta = 1.0 - transform.alpha_bar(t2) / transform.alpha_bar(t1);
            beta.min(max_beta) as f32
        })
        .collect();
    Tensor::vector(betas)
}

/// Derived noise schedule.
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    pub betas: Tensor,
    pub alphas: Tensor,
    pub alphas_cumprod: Tensor,
    /// Cumulative alpha used past the final step.
    pub final_alpha_cumprod: f32,
}

impl NoiseSchedule {
    /// Computes the schedule from a scheduler configuration.
    pub fn new(config: &SchedulerConfig) -> Result<Self> {
        let n = config.num_train_timesteps;
        if n == 0 {
            return Err(DiffusionError::invalid_config(
                "num_train_timesteps must be positive",
            ));
        }

        let betas = match &config.trained_betas {
            Some(trained) => {
                if trained.len() != n {
                    return Err(DiffusionError::invalid_config(format!(
                        "trained_betas has {} entries, expected {}",
                        trained.len(),
                        n
                    )));
                }
                Tensor::vector(trained.iter().map(|&b| b as f32).collect())
            }
            None => match config.beta_schedule()? {
                BetaSchedule::Linear => Tensor::linspace(config.beta_start, config.beta_end, n),
                BetaSchedule::ScaledLinear => {
                    Tensor::linspace(config.beta_start.sqrt(), config.beta_end.sqrt(), n).pow(2.0)
                }
                BetaSchedule::SquaredCosCapV2 => {
                    betas_for_alpha_bar(n, MAX_BETA, AlphaTransform::Cosine)
                }
            },
        };

        let alphas = betas.map(|b| 1.0 - b);
        let alphas_cumprod = alphas.cumprod();
        let final_alpha_cumprod = if config.set_alpha_to_one {
            1.0
        } else {
            alphas_cumprod.get(0).unwrap_or(1.0)
        };

        Ok(Self {
            betas,
            alphas,
            alphas_cumprod,
            final_alpha_cumprod,
        })
    }

    pub fn num_train_timesteps(&self) -> usize {
        self.alphas_cumprod.len()
    }

    /// Cumulative alpha at `timestep`; negative timesteps map to the final value.
    pub fn alpha_prod(&self, timestep: i64) -> Result<f32> {
        if timestep < 0 {
            return Ok(self.final_alpha_cumprod);
        }
        self.alphas_cumprod.get(timestep as usize).ok_or_else(|| {
            DiffusionError::invalid_input(format!(
                "Timestep {} is outside the training range 0..{}",
                timestep,
                self.num_train_timesteps()
            ))
        })
    }

    /// The placeholder timestep sequence `[N-1, ..., 0]`.
    pub fn training_timesteps(&self) -> Vec<i64> {
        (0..self.num_train_timesteps() as i64).rev().collect()
    }

    /// Noises `original` to the level of `timestep`:
    /// `original * sqrt(a_t) + noise * sqrt(1 - a_t)`.
    pub fn add_noise(&self, original: &Tensor, noise: &Tensor, timestep: i64) -> Result<Tensor> {
        let alpha_prod = self.alpha_prod(timestep)?;
        let mut noisy = original.mul_scalar(alpha_prod.sqrt());
        noisy.add_inplace(&noise.mul_scalar((1.0 - alpha_prod).sqrt()))?;
        Ok(noisy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alphas_cumprod_is_a_running_product() {
        let schedule = NoiseSchedule::new(&SchedulerConfig::stable_diffusion()).unwrap();
        let alphas = schedule.alphas.to_vec();
        let cumprod = schedule.alphas_cumprod.to_vec();
        assert_eq!(cumprod.len(), 1000);

        let mut product = 1.0f64;
        for i in 0..cumprod.len() {
            product *= alphas[i] as f64;
            assert!((cumprod[i] as f64 - product).abs() < 1e-6);
            assert!((0.0..=1.0).contains(&cumprod[i]));
            if i > 0 {
                assert!(cumprod[i] <= cumprod[i - 1]);
            }
        }
    }

    #[test]
    fn linear_betas_are_evenly_spaced() {
        let schedule = NoiseSchedule::new(&SchedulerConfig::default()).unwrap();
        let betas = schedule.betas.to_vec();
        assert!((betas[0] - 0.0001).abs() < 1e-8);
        assert!((betas[999] - 0.02).abs() < 1e-7);
        assert!((betas[1] - betas[0] - (0.02 - 0.0001) / 999.0).abs() < 1e-7);
    }

    #[test]
    fn scaled_linear_betas_square_the_endpoints() {
        let schedule = NoiseSchedule::new(&SchedulerConfig::stable_diffusion()).unwrap();
        let betas = schedule.betas.to_vec();
        assert!((betas[0] - 0.00085).abs() < 1e-7);
        assert!((betas[999] - 0.012).abs() < 1e-6);
    }

    #[test]
    fn squaredcos_betas_are_capped() {
        let config = SchedulerConfig {
            beta_schedule: "squaredcos_cap_v2".to_string(),
            ..SchedulerConfig::default()
        };
        let schedule = NoiseSchedule::new(&config).unwrap();
        let betas = schedule.betas.to_vec();
        assert_eq!(betas.len(), 1000);
        assert!(betas.iter().all(|&b| b > 0.0 && b <= MAX_BETA as f32));
        assert!((betas[999] - MAX_BETA as f32).abs() < 1e-6);
    }

    #[test]
    fn exp_alpha_bar_is_constant_beta() {
        let betas = betas_for_alpha_bar(10, MAX_BETA, AlphaTransform::Exp).to_vec();
        let expected = 1.0 - (-12.0f64 / 10.0).exp();
        for b in betas {
            assert!((b as f64 - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn trained_betas_are_used_verbatim() {
        let config = SchedulerConfig {
            num_train_timesteps: 3,
            trained_betas: Some(vec![0.1, 0.2, 0.3]),
            beta_schedule: "unknown".to_string(),
            ..SchedulerConfig::default()
        };
        let schedule = NoiseSchedule::new(&config).unwrap();
        let betas = schedule.betas.to_vec();
        assert!((betas[1] - 0.2).abs() < 1e-7);
        let wrong_len = SchedulerConfig {
            trained_betas: Some(vec![0.1]),
            ..config
        };
        assert!(NoiseSchedule::new(&wrong_len).is_err());
    }

    #[test]
    fn unknown_beta_schedule_fails() {
        let config = SchedulerConfig {
            beta_schedule: "quadratic".to_string(),
            ..SchedulerConfig::default()
        };
        assert!(NoiseSchedule::new(&config).is_err());
    }

    #[test]
    fn final_alpha_cumprod_follows_flag() {
        let mut config = SchedulerConfig::stable_diffusion();
        let schedule = NoiseSchedule::new(&config).unwrap();
        assert_eq!(schedule.final_alpha_cumprod, schedule.alphas_cumprod.get(0).unwrap());
        config.set_alpha_to_one = true;
        let schedule = NoiseSchedule::new(&config).unwrap();
        assert_eq!(schedule.final_alpha_cumprod, 1.0);
        assert_eq!(schedule.alpha_prod(-1).unwrap(), 1.0);
    }

    #[test]
    fn training_timesteps_descend() {
        let schedule = NoiseSchedule::new(&SchedulerConfig::default()).unwrap();
        let ts = schedule.training_timesteps();
        assert_eq!(ts.first(), Some(&999));
        assert_eq!(ts.last(), Some(&0));
    }

    #[test]
    fn add_noise_mixes_by_alpha() {
        let schedule = NoiseSchedule::new(&SchedulerConfig::stable_diffusion()).unwrap();
        let original = Tensor::full(&[1, 4, 2, 2], 1.0);
        let noise = Tensor::full(&[1, 4, 2, 2], 2.0);
        let a = schedule.alpha_prod(500).unwrap();
        let noisy = schedule.add_noise(&original, &noise, 500).unwrap();
        let expected = a.sqrt() + 2.0 * (1.0 - a).sqrt();
        assert!(noisy.to_vec().iter().all(|v| (v - expected).abs() < 1e-6));
        assert!(schedule.add_noise(&original, &noise, 1000).is_err());
    }
}
