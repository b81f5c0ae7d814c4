//! Frozen pretrained collaborators, consumed only through these traits.
//!
//! The text encoder, latent autoencoder and denoising network are loaded and
//! run outside this crate. Training only needs their forward passes, so each
//! is a small trait over burn tensors. Gradients flow *through* the text
//! encoder and denoiser back to the embedding table; none of their own
//! weights are updated.
//!
//! [`DdpmScheduler`] is the one concrete implementation kept here: the forward
//! (noising) half of a DDPM scheduler is a closed-form formula.

use burn::prelude::*;
use burn::tensor::{Distribution, TensorData};

/// Maps token embeddings `[batch, len, dim]` to conditioning hidden states
/// `[batch, len, hidden]`.
pub trait TextEncoder<B: Backend> {
    fn encode(&self, token_embeds: Tensor<B, 3>) -> Tensor<B, 3>;
}

/// Maps pixels `[batch, 3, h, w]` in `[-1, 1]` to latents `[batch, c, h', w']`.
pub trait LatentEncoder<B: Backend> {
    /// One sample from the latent distribution, before scaling.
    fn encode(&self, pixels: Tensor<B, 4>) -> Tensor<B, 4>;

    /// Multiplier applied to every encoded latent.
    fn scaling_factor(&self) -> f64 {
        0.18215
    }
}

/// Predicts the noise residual of noisy latents at the given timesteps.
pub trait Denoiser<B: Backend> {
    fn predict_noise(
        &self,
        noisy_latents: Tensor<B, 4>,
        timesteps: Tensor<B, 1, Int>,
        conditioning: Tensor<B, 3>,
    ) -> Tensor<B, 4>;
}

/// Forward diffusion process.
pub trait NoiseScheduler<B: Backend> {
    /// `T`: timesteps are drawn from `[0, T)`.
    fn num_train_timesteps(&self) -> usize;

    /// Noise `latents` to the level of each example's timestep.
    fn add_noise(
        &self,
        latents: Tensor<B, 4>,
        noise: Tensor<B, 4>,
        timesteps: &[usize],
    ) -> Tensor<B, 4>;

    /// Gaussian noise shaped like the latents. Draws from the backend RNG.
    fn sample_noise(&self, shape: [usize; 4], device: &B::Device) -> Tensor<B, 4> {
        Tensor::random(shape, Distribution::Normal(0.0, 1.0), device)
    }
}

/// Beta schedule of a DDPM scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    Linear,
    /// Linear in `sqrt(beta)`; used by Stable Diffusion.
    ScaledLinear,
}

/// DDPM forward process: `x_t = sqrt(ᾱ_t)·x_0 + sqrt(1 − ᾱ_t)·ε`.
#[derive(Debug, Clone)]
pub struct DdpmScheduler {
    alphas_cumprod: Vec<f64>,
}

impl DdpmScheduler {
    pub fn new(
        num_train_timesteps: usize,
        beta_start: f64,
        beta_end: f64,
        schedule: BetaSchedule,
    ) -> Self {
        let betas: Vec<f64> = (0..num_train_timesteps)
            .map(|i| {
                let frac = if num_train_timesteps > 1 {
                    i as f64 / (num_train_timesteps - 1) as f64
                } else {
                    0.0
                };
                match schedule {
                    BetaSchedule::Linear => beta_start + frac * (beta_end - beta_start),
                    BetaSchedule::ScaledLinear => {
                        let s = beta_start.sqrt() + frac * (beta_end.sqrt() - beta_start.sqrt());
                        s * s
                    }
                }
            })
            .collect();

        let mut acc = 1.0;
        let alphas_cumprod = betas
            .iter()
            .map(|beta| {
                acc *= 1.0 - beta;
                acc
            })
            .collect();
        Self { alphas_cumprod }
    }

    /// Stable Diffusion 1.x/2.x training scheduler.
    pub fn stable_diffusion() -> Self {
        Self::new(1000, 0.00085, 0.012, BetaSchedule::ScaledLinear)
    }

    pub fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }
}

impl<B: Backend> NoiseScheduler<B> for DdpmScheduler {
    fn num_train_timesteps(&self) -> usize {
        self.alphas_cumprod.len()
    }

    fn add_noise(
        &self,
        latents: Tensor<B, 4>,
        noise: Tensor<B, 4>,
        timesteps: &[usize],
    ) -> Tensor<B, 4> {
        let device = latents.device();
        let batch = timesteps.len();
        let (signal, noise_scale): (Vec<f32>, Vec<f32>) = timesteps
            .iter()
            .map(|&t| {
                let ac = self.alphas_cumprod[t];
                (ac.sqrt() as f32, (1.0 - ac).sqrt() as f32)
            })
            .unzip();
        let signal = Tensor::<B, 4>::from_data(TensorData::new(signal, [batch, 1, 1, 1]), &device);
        let noise_scale =
            Tensor::<B, 4>::from_data(TensorData::new(noise_scale, [batch, 1, 1, 1]), &device);
        latents * signal + noise * noise_scale
    }
}
