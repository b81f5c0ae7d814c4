//! Single-row update guard for the embedding table.
//!
//! AdamW with weight decay moves every row it sees gradients or state for.
//! After each optimizer step the guard writes the pre-training values back
//! into every row except the relation token's, so the rest of the vocabulary
//! stays bitwise identical to the pretrained table.

use burn::prelude::*;

use crate::error::ConfigError;
use crate::model::embedding::TokenEmbedding;

/// Merge a live table into the reference: row `protected` from `live`, every
/// other row from `reference`.
///
/// The result carries no autodiff history.
pub fn restore_rows<B: Backend>(
    live: Tensor<B, 2>,
    reference: Tensor<B, 2>,
    protected: u32,
) -> Tensor<B, 2> {
    let [_, dim] = live.dims();
    let p = protected as usize;
    let row = live.detach().slice([p..p + 1, 0..dim]);
    reference.detach().slice_assign([p..p + 1, 0..dim], row)
}

/// Detached snapshot of the table plus the one row allowed to change.
#[derive(Debug, Clone)]
pub struct EmbeddingGuard<B: Backend> {
    reference: Tensor<B, 2>,
    protected: u32,
}

impl<B: Backend> EmbeddingGuard<B> {
    /// Snapshot `embedding` before any optimization.
    pub fn capture(embedding: &TokenEmbedding<B>, protected: u32) -> Result<Self, ConfigError> {
        let vocab = embedding.vocab_size();
        if protected as usize >= vocab {
            return Err(ConfigError::RelationTokenOutOfRange {
                id: protected,
                vocab,
            });
        }
        Ok(Self {
            reference: embedding.weight.val().detach(),
            protected,
        })
    }

    pub fn protected(&self) -> u32 {
        self.protected
    }

    pub fn reference(&self) -> &Tensor<B, 2> {
        &self.reference
    }

    /// Overwrite every unprotected row of `embedding` with its reference value.
    pub fn restore(&self, embedding: TokenEmbedding<B>) -> TokenEmbedding<B> {
        let reference = self.reference.clone();
        let protected = self.protected;
        embedding.map_weight(|live| restore_rows(live, reference, protected))
    }
}
