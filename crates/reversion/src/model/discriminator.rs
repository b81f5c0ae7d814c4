//! Convolutional discriminator over diffusion latents.
//!
//! ```text
//! (batch, 4, 64, 64)
//!   → Conv(4→64, k4 s2 p1) → LeakyReLU(0.2)
//!   → Conv(64→128, k4 s2 p1) → BatchNorm → LeakyReLU(0.2)
//!   → Conv(128→256, k4 s2 p1) → BatchNorm → LeakyReLU(0.2)
//!   → Conv(256→512, k4 s2 p1) → BatchNorm → LeakyReLU(0.2)
//!   → Conv(512→1, k4 s1 p0)   → (batch, 1, 1, 1)
//!   → logit: (batch,)
//! ```
//!
//! [`LatentDiscriminator::forward`] applies the sigmoid; the adversarial
//! losses use [`LatentDiscriminator::forward_logits`] with BCE-with-logits.

use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation::{leaky_relu, sigmoid};

use crate::error::ConfigError;

const NEGATIVE_SLOPE: f64 = 0.2;

/// Configuration for the [`LatentDiscriminator`].
#[derive(Config, Debug)]
pub struct LatentDiscriminatorConfig {
    /// Latent channels produced by the autoencoder.
    #[config(default = 4)]
    pub in_channels: usize,
    /// Channels of the first conv; doubled after each downsample.
    #[config(default = 64)]
    pub base_channels: usize,
    /// Number of stride-2 convs.
    #[config(default = 4)]
    pub num_downsamples: usize,
    /// Spatial side of the (square) latent.
    #[config(default = 64)]
    pub latent_size: usize,
}

impl LatentDiscriminatorConfig {
    /// Kernel of the closing conv: the spatial extent left after downsampling.
    pub fn final_kernel(&self) -> Result<usize, ConfigError> {
        if self.num_downsamples == 0 {
            return Err(ConfigError::invalid(
                "adversarial.num_downsamples",
                "must be at least 1",
            ));
        }
        let factor = 1usize << self.num_downsamples;
        if self.latent_size < factor || self.latent_size % factor != 0 {
            return Err(ConfigError::invalid(
                "adversarial.latent_size",
                format!(
                    "{} is not divisible into a 1x1 output by {} stride-2 convs",
                    self.latent_size, self.num_downsamples
                ),
            ));
        }
        Ok(self.latent_size / factor)
    }

    /// Initialize a discriminator. Fails on geometry that does not reduce to 1x1.
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> Result<LatentDiscriminator<B>, ConfigError> {
        let final_kernel = self.final_kernel()?;
        if self.base_channels == 0 || self.in_channels == 0 {
            return Err(ConfigError::invalid(
                "adversarial.base_channels",
                "channel counts must be positive",
            ));
        }

        let mut blocks = Vec::with_capacity(self.num_downsamples);
        let mut in_ch = self.in_channels;
        for i in 0..self.num_downsamples {
            let out_ch = self.base_channels << i;
            let conv = Conv2dConfig::new([in_ch, out_ch], [4, 4])
                .with_stride([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device);
            let norm = (i > 0).then(|| BatchNormConfig::new(out_ch).init(device));
            blocks.push(DownBlock { conv, norm });
            in_ch = out_ch;
        }
        let head = Conv2dConfig::new([in_ch, 1], [final_kernel, final_kernel])
            .with_padding(PaddingConfig2d::Valid)
            .init(device);

        Ok(LatentDiscriminator { blocks, head })
    }
}

/// Stride-2 conv, optional batch norm, LeakyReLU.
#[derive(Module, Debug)]
pub struct DownBlock<B: Backend> {
    conv: Conv2d<B>,
    norm: Option<BatchNorm<B, 2>>,
}

impl<B: Backend> DownBlock<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = match &self.norm {
            Some(norm) => norm.forward(x),
            None => x,
        };
        leaky_relu(x, NEGATIVE_SLOPE)
    }
}

/// Real/fake classifier over `[batch, c, h, w]` latents.
///
/// Its parameters are disjoint from the embedding table and are updated only
/// by its own optimizer.
#[derive(Module, Debug)]
pub struct LatentDiscriminator<B: Backend> {
    blocks: Vec<DownBlock<B>>,
    head: Conv2d<B>,
}

impl<B: Backend> LatentDiscriminator<B> {
    /// Raw logits, one per example: `(batch,)`.
    pub fn forward_logits(&self, latents: Tensor<B, 4>) -> Tensor<B, 1> {
        let batch = latents.dims()[0];
        let x = self
            .blocks
            .iter()
            .fold(latents, |x, block| block.forward(x));
        self.head.forward(x).reshape([batch])
    }

    /// Probability that each latent is real: `(batch,)` in `(0, 1)`.
    pub fn forward(&self, latents: Tensor<B, 4>) -> Tensor<B, 1> {
        sigmoid(self.forward_logits(latents))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn small_config() -> LatentDiscriminatorConfig {
        LatentDiscriminatorConfig::new()
            .with_base_channels(4)
            .with_num_downsamples(2)
            .with_latent_size(8)
    }

    #[test]
    fn test_default_geometry() {
        let config = LatentDiscriminatorConfig::new();
        assert_eq!(config.final_kernel().unwrap(), 4);
    }

    #[test]
    fn test_rejects_indivisible_geometry() {
        let config = LatentDiscriminatorConfig::new()
            .with_latent_size(12)
            .with_num_downsamples(3);
        assert!(matches!(
            config.final_kernel(),
            Err(ConfigError::Invalid { field: "adversarial.latent_size", .. })
        ));
        let tiny = LatentDiscriminatorConfig::new()
            .with_latent_size(4)
            .with_num_downsamples(3);
        assert!(tiny.final_kernel().is_err());
    }

    #[test]
    fn test_output_shape_and_range() {
        let device = Default::default();
        let disc = small_config().init::<TestBackend>(&device).unwrap();
        let latents = Tensor::<TestBackend, 4>::random(
            [3, 4, 8, 8],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );
        let probs = disc.forward(latents);
        assert_eq!(probs.dims(), [3]);
        let values: Vec<f32> = probs.into_data().to_vec().unwrap();
        for p in values {
            assert!(p > 0.0 && p < 1.0, "probability out of range: {p}");
        }
    }

    #[test]
    fn test_first_block_has_no_norm() {
        let device = Default::default();
        let disc = small_config().init::<TestBackend>(&device).unwrap();
        assert!(disc.blocks[0].norm.is_none());
        assert!(disc.blocks[1].norm.is_some());
    }
}
