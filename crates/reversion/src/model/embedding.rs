//! Token-embedding table of the frozen text encoder.
//!
//! The table is the only trainable text-side parameter. Every row except the
//! relation token's is restored after each optimizer step by
//! [`crate::training::guard::EmbeddingGuard`], so in practice a single row
//! learns.

use burn::module::Param;
use burn::prelude::*;

use crate::model::bridge::{id_list_to_tensor, vector_to_tensor};

/// `[vocab, dim]` lookup table.
#[derive(Module, Debug)]
pub struct TokenEmbedding<B: Backend> {
    pub weight: Param<Tensor<B, 2>>,
}

impl<B: Backend> TokenEmbedding<B> {
    /// Wrap a pretrained table.
    pub fn from_tensor(weight: Tensor<B, 2>) -> Self {
        Self {
            weight: Param::from_tensor(weight),
        }
    }

    /// Standard-normal table, for tests and synthetic runs.
    pub fn random(vocab: usize, dim: usize, device: &B::Device) -> Self {
        Self::from_tensor(Tensor::random(
            [vocab, dim],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            device,
        ))
    }

    pub fn vocab_size(&self) -> usize {
        self.weight.val().dims()[0]
    }

    pub fn dim(&self) -> usize {
        self.weight.val().dims()[1]
    }

    /// Look up `[batch, len]` ids, producing `[batch, len, dim]` embeddings.
    pub fn forward(&self, ids: Tensor<B, 2, Int>) -> Tensor<B, 3> {
        let [batch, len] = ids.dims();
        let dim = self.dim();
        self.weight
            .val()
            .select(0, ids.reshape([batch * len]))
            .reshape([batch, len, dim])
    }

    /// Rows for a flat id list, graph-connected to the table.
    pub fn rows(&self, ids: &[u32]) -> Tensor<B, 2> {
        let device = self.weight.device();
        self.weight.val().select(0, id_list_to_tensor::<B>(ids, &device))
    }

    /// A single row as a `[dim]` tensor.
    pub fn row(&self, id: u32) -> Tensor<B, 1> {
        let id = id as usize;
        let dim = self.dim();
        self.weight.val().slice([id..id + 1, 0..dim]).squeeze::<1>(0)
    }

    /// Grow the table by one row copied from `initializer_id`.
    ///
    /// Called once at setup, before any optimizer exists, so the fresh
    /// parameter id is harmless. The grown table is a new leaf.
    pub fn with_added_row(self, initializer_id: u32) -> Self {
        let weight = self.weight.val().detach();
        let dim = weight.dims()[1];
        let init = initializer_id as usize;
        let seed_row = weight.clone().slice([init..init + 1, 0..dim]);
        Self::from_tensor(Tensor::cat(vec![weight, seed_row], 0).detach())
    }

    /// Apply `f` to the table while keeping the parameter id, so optimizer
    /// state stays attached to it. The result is a fresh leaf with the same
    /// gradient tracking as before.
    pub fn map_weight(self, f: impl FnOnce(Tensor<B, 2>) -> Tensor<B, 2>) -> Self {
        Self {
            weight: self.weight.map(|w| {
                let tracked = w.is_require_grad();
                f(w).detach().set_require_grad(tracked)
            }),
        }
    }

    /// Overwrite row `id` with `vector`.
    pub fn install_row(self, id: u32, vector: &[f32]) -> anyhow::Result<Self> {
        let (vocab, dim) = (self.vocab_size(), self.dim());
        anyhow::ensure!((id as usize) < vocab, "row {id} outside table of {vocab} rows");
        anyhow::ensure!(
            vector.len() == dim,
            "vector has {} values, table dim is {dim}",
            vector.len()
        );
        let device = self.weight.device();
        let row = vector_to_tensor::<B>(vector, &device).unsqueeze_dim::<2>(0);
        let id = id as usize;
        Ok(self.map_weight(|w| w.slice_assign([id..id + 1, 0..dim], row)))
    }
}
