//! Toy collaborators for testing the training loop without pretrained models.
//!
//! Each mock is small enough to reason about analytically: the denoiser's
//! prediction depends only on the mean of its conditioning, so the direction
//! the relation row must move to lower the denoising loss is known in advance.

use std::collections::HashMap;
use std::path::Path;

use burn::prelude::*;
use burn::tensor::module::avg_pool2d;

use crate::model::collaborators::{
    DdpmScheduler, Denoiser, LatentEncoder, NoiseScheduler, TextEncoder,
};
use crate::model::embedding::TokenEmbedding;
use crate::tokens::{SpecialIds, TextTokenizer};
use crate::training::data::{Exemplar, ImageDecoder};
use crate::validation::{ValidationImage, ValidationRenderer, ValidationRequest};

// ---------------------------------------------------------------------------
// WordTokenizer
// ---------------------------------------------------------------------------

/// Whitespace tokenizer over a fixed word list.
///
/// Id 0 is bos, id 1 is eos (also used for padding), words follow in order.
/// Unknown words are an error.
#[derive(Debug, Clone)]
pub struct WordTokenizer {
    vocab: Vec<String>,
    ids: HashMap<String, u32>,
    max_length: usize,
}

impl WordTokenizer {
    pub const BOS: &'static str = "<|startoftext|>";
    pub const EOS: &'static str = "<|endoftext|>";

    pub fn new(words: &[&str], max_length: usize) -> Self {
        let mut tok = Self {
            vocab: Vec::new(),
            ids: HashMap::new(),
            max_length,
        };
        for w in [Self::BOS, Self::EOS].iter().chain(words.iter()) {
            tok.push(w);
        }
        tok
    }

    fn push(&mut self, word: &str) -> bool {
        if self.ids.contains_key(word) {
            return false;
        }
        self.ids.insert(word.to_string(), self.vocab.len() as u32);
        self.vocab.push(word.to_string());
        true
    }

    pub fn decode(&self, ids: &[u32]) -> Vec<&str> {
        ids.iter()
            .filter_map(|&id| self.vocab.get(id as usize).map(String::as_str))
            .collect()
    }
}

impl TextTokenizer for WordTokenizer {
    fn encode(&self, text: &str, add_special_tokens: bool) -> anyhow::Result<Vec<u32>> {
        let mut ids = Vec::new();
        if add_special_tokens {
            ids.push(0);
        }
        for word in text.split_whitespace() {
            let id = self
                .ids
                .get(word)
                .ok_or_else(|| anyhow::anyhow!("unknown word {word:?}"))?;
            ids.push(*id);
        }
        if add_special_tokens {
            ids.push(1);
        }
        Ok(ids)
    }

    fn add_token(&mut self, token: &str) -> bool {
        self.push(token)
    }

    fn token_to_id(&self, token: &str) -> Option<u32> {
        self.ids.get(token).copied()
    }

    fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    fn special_ids(&self) -> SpecialIds {
        SpecialIds {
            bos: 0,
            eos: 1,
            pad: 1,
        }
    }

    fn model_max_length(&self) -> usize {
        self.max_length
    }
}

// ---------------------------------------------------------------------------
// Frozen networks
// ---------------------------------------------------------------------------

/// Text encoder that returns the token embeddings unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityTextEncoder;

impl<B: Backend> TextEncoder<B> for IdentityTextEncoder {
    fn encode(&self, token_embeds: Tensor<B, 3>) -> Tensor<B, 3> {
        token_embeds
    }
}

/// Latent encoder: average-pool RGB by `factor`, then append the channel mean
/// as a fourth channel.
#[derive(Debug, Clone, Copy)]
pub struct PooledLatentEncoder {
    pub factor: usize,
}

impl<B: Backend> LatentEncoder<B> for PooledLatentEncoder {
    fn encode(&self, pixels: Tensor<B, 4>) -> Tensor<B, 4> {
        let k = self.factor;
        let pooled = avg_pool2d(pixels, [k, k], [k, k], [0, 0], true);
        let mean = pooled.clone().mean_dim(1);
        Tensor::cat(vec![pooled, mean], 1)
    }

    fn scaling_factor(&self) -> f64 {
        1.0
    }
}

/// Denoiser whose prediction is `gain · mean(conditioning)` everywhere.
#[derive(Debug, Clone, Copy)]
pub struct ConditioningBiasDenoiser {
    pub gain: f64,
}

impl<B: Backend> Denoiser<B> for ConditioningBiasDenoiser {
    fn predict_noise(
        &self,
        noisy_latents: Tensor<B, 4>,
        _timesteps: Tensor<B, 1, Int>,
        conditioning: Tensor<B, 3>,
    ) -> Tensor<B, 4> {
        let device = noisy_latents.device();
        let bias = conditioning.mean().reshape([1, 1, 1, 1]) * self.gain;
        Tensor::<B, 4>::ones(noisy_latents.dims(), &device) * bias
    }
}

/// DDPM forward process with deterministic noise of a fixed value.
#[derive(Debug, Clone)]
pub struct ConstantNoiseScheduler {
    pub inner: DdpmScheduler,
    pub value: f64,
}

impl ConstantNoiseScheduler {
    pub fn new(num_train_timesteps: usize, value: f64) -> Self {
        Self {
            inner: DdpmScheduler::new(
                num_train_timesteps,
                0.00085,
                0.012,
                crate::model::collaborators::BetaSchedule::ScaledLinear,
            ),
            value,
        }
    }
}

impl<B: Backend> NoiseScheduler<B> for ConstantNoiseScheduler {
    fn num_train_timesteps(&self) -> usize {
        NoiseScheduler::<B>::num_train_timesteps(&self.inner)
    }

    fn add_noise(
        &self,
        latents: Tensor<B, 4>,
        noise: Tensor<B, 4>,
        timesteps: &[usize],
    ) -> Tensor<B, 4> {
        self.inner.add_noise(latents, noise, timesteps)
    }

    fn sample_noise(&self, shape: [usize; 4], device: &B::Device) -> Tensor<B, 4> {
        Tensor::full(shape, self.value as f32, device)
    }
}

// ---------------------------------------------------------------------------
// Image decoding and rendering
// ---------------------------------------------------------------------------

/// Decoder that synthesizes a flat image whose gray level derives from the
/// file name, ignoring file contents.
#[derive(Debug, Clone, Copy)]
pub struct SyntheticDecoder {
    pub size: usize,
}

impl ImageDecoder for SyntheticDecoder {
    fn decode(&self, path: &Path) -> anyhow::Result<Exemplar> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow::anyhow!("bad image path {}", path.display()))?;
        let level = name.bytes().fold(0u8, |acc, b| acc.wrapping_add(b));
        let rgb = vec![level; self.size * self.size * 3];
        Ok(Exemplar::from_rgb8(name, &rgb, self.size, self.size))
    }
}

/// Renderer that records requests and returns blank images.
#[derive(Debug, Clone)]
pub struct RecordingRenderer {
    width: usize,
    height: usize,
    requests: Vec<ValidationRequest>,
    /// Table size seen by each render call.
    pub vocab_sizes: Vec<usize>,
}

impl RecordingRenderer {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            requests: Vec::new(),
            vocab_sizes: Vec::new(),
        }
    }

    pub fn requests(&self) -> &[ValidationRequest] {
        &self.requests
    }
}

impl<B: Backend> ValidationRenderer<B> for RecordingRenderer {
    fn render(
        &mut self,
        request: &ValidationRequest,
        embedding: &TokenEmbedding<B>,
    ) -> anyhow::Result<Vec<ValidationImage>> {
        self.requests.push(request.clone());
        self.vocab_sizes.push(embedding.vocab_size());
        Ok((0..request.num_images)
            .map(|_| ValidationImage {
                width: self.width,
                height: self.height,
                rgb: vec![127; self.width * self.height * 3],
            })
            .collect())
    }
}
