//! Weighted composition of the generator-side loss terms.
//!
//! ```text
//! L = w_denoise·L_denoise + w_gan·L_gan + w_steer·L_steer
//! ```
//!
//! A term participates only when its weight is strictly positive. The weights
//! are resolved once at startup and never change.

use burn::prelude::*;

use crate::error::ConfigError;

/// Loss multipliers.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LossWeights {
    pub denoise: f64,
    pub gan: f64,
    pub steer: f64,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            denoise: 1.0,
            gan: 0.001,
            steer: 0.0,
        }
    }
}

impl LossWeights {
    /// Reject negative weights and an all-zero objective.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, w) in [
            ("loss.denoise_loss_weight", self.denoise),
            ("loss.gan_loss_weight", self.gan),
            ("loss.steer_loss_weight", self.steer),
        ] {
            if !w.is_finite() || w < 0.0 {
                return Err(ConfigError::invalid(field, format!("must be >= 0, got {w}")));
            }
        }
        if !(self.uses_denoise() || self.uses_gan() || self.uses_steer()) {
            return Err(ConfigError::invalid(
                "loss",
                "all loss weights are zero; nothing to optimize",
            ));
        }
        Ok(())
    }

    pub fn uses_denoise(&self) -> bool {
        self.denoise > 0.0
    }

    /// The discriminator exists and steps only when this is true.
    pub fn uses_gan(&self) -> bool {
        self.gan > 0.0
    }

    pub fn uses_steer(&self) -> bool {
        self.steer > 0.0
    }
}

/// Unweighted loss tensors of one micro-step. Absent terms are `None`.
#[derive(Debug, Clone)]
pub struct LossTerms<B: Backend> {
    pub denoise: Tensor<B, 1>,
    pub gan: Option<Tensor<B, 1>>,
    pub steer: Option<Tensor<B, 1>>,
}

/// Weighted sum of the active terms.
///
/// The denoising MSE is always computed for logging but contributes only when
/// its weight is positive.
pub fn compose<B: Backend>(weights: &LossWeights, terms: LossTerms<B>) -> Tensor<B, 1> {
    let device = terms.denoise.device();
    let mut total = Tensor::<B, 1>::zeros([1], &device);
    if weights.uses_denoise() {
        total = total + terms.denoise * weights.denoise;
    }
    if let (true, Some(gan)) = (weights.uses_gan(), terms.gan) {
        total = total + gan * weights.gan;
    }
    if let (true, Some(steer)) = (weights.uses_steer(), terms.steer) {
        total = total + steer * weights.steer;
    }
    total
}
