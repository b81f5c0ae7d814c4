//! Alternating discriminator/generator updates.
//!
//! Each micro-step runs in a fixed order:
//!
//! 1. [`DiscriminatorStep::step`] scores real latents and the *detached*
//!    denoiser prediction, then updates the discriminator with its own Adam
//!    optimizer. The detach keeps this loss from reaching the embedding table.
//! 2. The returned [`GeneratorStep`] borrows the freshly updated
//!    discriminator and scores the graph-connected prediction as "real". Its
//!    gradients flow back to the embedding table; the ones landing on the
//!    discriminator are never collected.
//!
//! The borrow in step 2 makes the ordering a type-level fact: a generator
//! loss can only be built from a discriminator that has just been stepped.

use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

use crate::model::bridge::tensor_to_f64;
use crate::model::discriminator::LatentDiscriminator;
use crate::training::loss::bce_with_logits;

/// Adam for the discriminator (GAN-style betas, default `β1 = 0.5`).
pub fn discriminator_optimizer<B: AutodiffBackend>(
    beta1: f64,
    beta2: f64,
) -> impl Optimizer<LatentDiscriminator<B>, B> {
    AdamConfig::new()
        .with_beta_1(beta1 as f32)
        .with_beta_2(beta2 as f32)
        .init::<B, LatentDiscriminator<B>>()
}

/// Scalar values of one discriminator update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiscriminatorReport {
    pub real_loss: f64,
    pub fake_loss: f64,
    /// `(real_loss + fake_loss) / 2`.
    pub d_loss: f64,
}

/// Discriminator state machine: the network, its optimizer and learning rate.
pub struct DiscriminatorStep<B: AutodiffBackend, O> {
    discriminator: LatentDiscriminator<B>,
    optimizer: O,
    lr: f64,
}

impl<B, O> DiscriminatorStep<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<LatentDiscriminator<B>, B>,
{
    pub fn new(discriminator: LatentDiscriminator<B>, optimizer: O, lr: f64) -> Self {
        Self {
            discriminator,
            optimizer,
            lr,
        }
    }

    pub fn discriminator(&self) -> &LatentDiscriminator<B> {
        &self.discriminator
    }

    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }

    pub fn lr(&self) -> f64 {
        self.lr
    }

    /// Swap in restored network and optimizer state.
    pub fn restore(self, discriminator: LatentDiscriminator<B>, record: O::Record) -> Self {
        Self {
            discriminator,
            optimizer: self.optimizer.load_record(record),
            lr: self.lr,
        }
    }

    /// Discriminator loss without updating anything.
    pub fn loss(&self, real: Tensor<B, 4>, fake: Tensor<B, 4>) -> (Tensor<B, 1>, Tensor<B, 1>) {
        let real_loss = bce_with_logits(self.discriminator.forward_logits(real.detach()), true);
        let fake_loss = bce_with_logits(self.discriminator.forward_logits(fake.detach()), false);
        (real_loss, fake_loss)
    }

    /// Update the discriminator on real latents and the detached prediction.
    ///
    /// # Returns
    /// The loss values and a [`GeneratorStep`] bound to the updated network.
    pub fn step(
        &mut self,
        real: Tensor<B, 4>,
        fake: Tensor<B, 4>,
    ) -> (DiscriminatorReport, GeneratorStep<'_, B>) {
        let (real_loss, fake_loss) = self.loss(real, fake);
        let report_real = tensor_to_f64(real_loss.clone());
        let report_fake = tensor_to_f64(fake_loss.clone());
        let d_loss = (real_loss + fake_loss) / 2.0;
        let d_value = tensor_to_f64(d_loss.clone());

        let grads = GradientsParams::from_grads(d_loss.backward(), &self.discriminator);
        self.discriminator = self
            .optimizer
            .step(self.lr, self.discriminator.clone(), grads);

        let report = DiscriminatorReport {
            real_loss: report_real,
            fake_loss: report_fake,
            d_loss: d_value,
        };
        (
            report,
            GeneratorStep {
                discriminator: &self.discriminator,
            },
        )
    }
}

/// Generator-side adversarial term against a freshly updated discriminator.
pub struct GeneratorStep<'a, B: Backend> {
    discriminator: &'a LatentDiscriminator<B>,
}

impl<'a, B: Backend> GeneratorStep<'a, B> {
    /// Non-saturating generator loss `BCE(D(pred), 1)`; `pred` stays
    /// graph-connected.
    pub fn loss(&self, pred: Tensor<B, 4>) -> Tensor<B, 1> {
        bce_with_logits(self.discriminator.forward_logits(pred), true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::discriminator::LatentDiscriminatorConfig;
    use crate::model::embedding::TokenEmbedding;
    use burn::backend::ndarray::NdArray;
    use burn::backend::Autodiff;
    use burn::optim::AdamWConfig;
    use burn::tensor::Distribution;

    type TestAutodiffBackend = Autodiff<NdArray<f32>>;

    fn disc_step() -> DiscriminatorStep<
        TestAutodiffBackend,
        impl Optimizer<LatentDiscriminator<TestAutodiffBackend>, TestAutodiffBackend>,
    > {
        let device = Default::default();
        let disc = LatentDiscriminatorConfig::new()
            .with_base_channels(4)
            .with_num_downsamples(2)
            .with_latent_size(8)
            .init::<TestAutodiffBackend>(&device)
            .unwrap();
        DiscriminatorStep::new(disc, discriminator_optimizer(0.5, 0.999), 1e-3)
    }

    fn latents(mean: f64) -> Tensor<TestAutodiffBackend, 4> {
        let device = Default::default();
        Tensor::random([2, 4, 8, 8], Distribution::Normal(mean, 1.0), &device)
    }

    fn probe(
        disc: &LatentDiscriminator<TestAutodiffBackend>,
        x: Tensor<TestAutodiffBackend, 4>,
    ) -> Vec<f32> {
        disc.forward_logits(x).into_data().to_vec().unwrap()
    }

    #[test]
    fn test_discriminator_loss_is_mean_of_bce_terms() {
        let mut step = disc_step();
        let (report, _generator) = step.step(latents(1.0), latents(-1.0));
        assert!(report.real_loss >= 0.0 && report.fake_loss >= 0.0);
        let mean = (report.real_loss + report.fake_loss) / 2.0;
        assert!((report.d_loss - mean).abs() < 1e-5, "{report:?}");
    }

    #[test]
    fn test_discriminator_step_updates_weights() {
        let mut step = disc_step();
        let x = latents(0.0);
        let before = probe(step.discriminator(), x.clone());
        let _ = step.step(latents(1.0), latents(-1.0));
        let after = probe(step.discriminator(), x);
        assert_ne!(before, after, "discriminator weights should move");
    }

    #[test]
    fn test_discriminator_loss_never_reaches_embedding() {
        let device = Default::default();
        let emb = TokenEmbedding::<TestAutodiffBackend>::random(5, 4 * 8 * 8, &device);
        // A prediction graph-connected to the embedding table.
        let pred = emb.rows(&[2, 3]).reshape([2, 4, 8, 8]);

        let step = disc_step();
        let (real_loss, fake_loss) = step.loss(latents(1.0), pred);
        let grads = (real_loss + fake_loss).backward();
        let emb_grads = GradientsParams::from_grads(grads, &emb);
        assert!(
            emb_grads.is_empty(),
            "discriminator loss produced {} embedding gradients",
            emb_grads.len()
        );
    }

    #[test]
    fn test_generator_step_updates_embedding_not_discriminator() {
        let device = Default::default();
        let emb = TokenEmbedding::<TestAutodiffBackend>::random(5, 4 * 8 * 8, &device);
        let pred = emb.rows(&[2, 3]).reshape([2, 4, 8, 8]);
        let mut emb_optim = AdamWConfig::new()
            .init::<TestAutodiffBackend, TokenEmbedding<TestAutodiffBackend>>();

        let mut step = disc_step();
        let x = latents(0.0);
        let row_before: Vec<f32> = emb.row(2).into_data().to_vec().unwrap();
        let (d_after, emb) = {
            let (_, generator) = step.step(latents(1.0), pred.clone());
            let g_loss = generator.loss(pred);
            let emb_grads = GradientsParams::from_grads(g_loss.backward(), &emb);
            assert_eq!(emb_grads.len(), 1, "embedding should receive the generator gradient");
            (probe(step.discriminator(), x.clone()), emb_optim.step(1e-2, emb, emb_grads))
        };

        let row_after: Vec<f32> = emb.row(2).into_data().to_vec().unwrap();
        assert_ne!(row_before, row_after);
        assert_eq!(d_after, probe(step.discriminator(), x));
    }
}
