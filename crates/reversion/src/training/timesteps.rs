//! Diffusion timestep sampling.
//!
//! Relation-focal importance sampling skews the draw toward large `t`, where
//! the noisy latent carries layout and interaction rather than fine appearance:
//!
//! ```text
//! f(t) = (1/T) · (1 − α·cos(π·t/T)),   t ∈ {0, …, T−1}
//! p(t) = f(t) / Σ f
//! ```
//!
//! With `α = 0` the distribution is uniform.

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;

use crate::error::ConfigError;

/// Importance weight of timestep `t` out of `max_t`.
pub fn importance_weight(t: usize, max_t: usize, alpha: f64) -> f64 {
    let max_t = max_t as f64;
    (1.0 / max_t) * (1.0 - alpha * (std::f64::consts::PI * t as f64 / max_t).cos())
}

/// Probability mass over `[0, T)`. Immutable once built.
#[derive(Debug, Clone)]
pub struct TimestepDistribution {
    probs: Vec<f64>,
}

impl TimestepDistribution {
    pub fn uniform(num_timesteps: usize) -> Result<Self, ConfigError> {
        Self::importance(num_timesteps, 0.0)
    }

    /// Normalized importance distribution. `α` must lie in `[0, 1]`.
    pub fn importance(num_timesteps: usize, alpha: f64) -> Result<Self, ConfigError> {
        if num_timesteps == 0 {
            return Err(ConfigError::invalid(
                "num_train_timesteps",
                "must be positive",
            ));
        }
        if !(0.0..=1.0).contains(&alpha) {
            return Err(ConfigError::InvalidAlpha(alpha));
        }
        let weights: Vec<f64> = (0..num_timesteps)
            .map(|t| importance_weight(t, num_timesteps, alpha))
            .collect();
        let total: f64 = weights.iter().sum();
        // T = 1 with α = 1 leaves a single zero weight.
        if total <= 0.0 || !total.is_finite() {
            return Ok(Self {
                probs: vec![1.0 / num_timesteps as f64; num_timesteps],
            });
        }
        Ok(Self {
            probs: weights.into_iter().map(|w| w / total).collect(),
        })
    }

    pub fn probs(&self) -> &[f64] {
        &self.probs
    }

    pub fn num_timesteps(&self) -> usize {
        self.probs.len()
    }
}

/// Per-example timestep draws, with replacement.
#[derive(Debug, Clone)]
pub struct TimestepSampler {
    distribution: TimestepDistribution,
    index: WeightedIndex<f64>,
}

impl TimestepSampler {
    pub fn new(distribution: TimestepDistribution) -> Result<Self, ConfigError> {
        let index = WeightedIndex::new(distribution.probs())
            .map_err(|e| ConfigError::invalid("timestep distribution", e.to_string()))?;
        Ok(Self {
            distribution,
            index,
        })
    }

    /// Build the sampler for the configured policy.
    pub fn from_policy(
        num_timesteps: usize,
        importance_sampling: bool,
        alpha: f64,
    ) -> Result<Self, ConfigError> {
        let distribution = if importance_sampling {
            TimestepDistribution::importance(num_timesteps, alpha)?
        } else {
            TimestepDistribution::uniform(num_timesteps)?
        };
        tracing::info!(
            num_timesteps,
            importance_sampling,
            alpha,
            "Timestep sampler ready"
        );
        Self::new(distribution)
    }

    pub fn distribution(&self) -> &TimestepDistribution {
        &self.distribution
    }

    /// Draw `bsz` timesteps in `[0, T)`.
    pub fn sample(&self, bsz: usize, rng: &mut impl Rng) -> Vec<usize> {
        (0..bsz).map(|_| self.index.sample(rng)).collect()
    }
}
