use crate::params::MutationParams;
use rand::{distributions::Distribution, Rng};
use serde::{Deserialize, Serialize};
use simple_error::{SimpleError, SimpleResult};
use statrs::distribution::Normal;

/// Trainable parameters of a network, flat and in network order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Genome {
    pub thresholds: Vec<f32>,
    pub leaks: Vec<f32>,
    pub weights: Vec<f32>,
}

impl Genome {
    /// Adds independent Gaussian noise to every parameter. Candidates that are not finite are
    /// rejected and the prior value is kept; the number of rejections is returned.
    pub fn mutate<R: Rng>(&mut self, params: &MutationParams, rng: &mut R) -> SimpleResult<usize> {
        let mut rejected = 0;
        rejected += perturb(&mut self.thresholds, params.sigma_threshold, rng, |v| v)?;
        rejected += perturb(&mut self.leaks, params.sigma_leak, rng, |v| v.clamp(0.0, 1.0))?;
        rejected += perturb(&mut self.weights, params.sigma_weight, rng, |v| v)?;
        Ok(rejected)
    }

    pub fn nonzero_weight_fraction(&self) -> f64 {
        if self.weights.is_empty() {
            return 0.0;
        }

        let nonzero = self.weights.iter().filter(|weight| **weight != 0.0).count();
        nonzero as f64 / self.weights.len() as f64
    }
}

fn perturb<R, F>(values: &mut [f32], sigma: f32, rng: &mut R, bound: F) -> SimpleResult<usize>
where
    R: Rng,
    F: Fn(f32) -> f32,
{
    if sigma == 0.0 {
        return Ok(0);
    }

    let noise_dist = Normal::new(0.0, sigma as f64)
        .map_err(|err| SimpleError::new(format!("invalid mutation sigma {}: {}", sigma, err)))?;

    let mut rejected = 0;

    for value in values.iter_mut() {
        let candidate = bound(*value + noise_dist.sample(rng) as f32);

        if candidate.is_finite() {
            *value = candidate;
        } else {
            rejected += 1;
        }
    }

    Ok(rejected)
}
