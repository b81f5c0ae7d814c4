//! Training losses: denoising MSE, adversarial BCE terms and the steering
//! InfoNCE loss.
//!
//! All functions are generic over `B: Backend` and return scalar tensors of
//! shape `(1,)`.

use burn::nn::loss::{BinaryCrossEntropyLossConfig, MseLoss, Reduction};
use burn::prelude::*;

use crate::error::StepError;
use crate::model::bridge::id_list_to_tensor;
use crate::model::embedding::TokenEmbedding;
use crate::tokens::WordSets;

/// Norm floor for L2 normalization.
const NORM_EPS: f64 = 1e-12;

/// Denoising loss: MSE between predicted and sampled noise.
pub fn denoise_loss<B: Backend>(pred: Tensor<B, 4>, noise: Tensor<B, 4>) -> Tensor<B, 1> {
    MseLoss::new().forward(pred, noise, Reduction::Mean)
}

/// BCE of discriminator logits against an all-`target` label vector.
///
/// Equivalent to BCE on the sigmoid output, without its saturation.
pub fn bce_with_logits<B: Backend>(logits: Tensor<B, 1>, target: bool) -> Tensor<B, 1> {
    let device = logits.device();
    let [batch] = logits.dims();
    let labels = if target {
        Tensor::<B, 1, Int>::ones([batch], &device)
    } else {
        Tensor::<B, 1, Int>::zeros([batch], &device)
    };
    BinaryCrossEntropyLossConfig::new()
        .with_logits(true)
        .init(&device)
        .forward(logits, labels)
}

/// Token ids feeding one steering-loss evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SteeringPools {
    /// Occurrences of the relation token in the first caption.
    pub relation_count: usize,
    /// Relation-word tokens across the batch, specials removed.
    pub positives: Vec<u32>,
    /// Caption tokens across the batch minus stop, special and relation ids.
    pub negatives: Vec<u32>,
}

impl SteeringPools {
    /// Partition a batch's token ids into the pools.
    ///
    /// Every occurrence counts: a token appearing twice contributes two pool
    /// members. Padding shares an id with a special token and never enters a
    /// pool.
    pub fn collect(
        input_ids: &[Vec<u32>],
        positive_ids: &[Vec<u32>],
        relation_id: u32,
        word_sets: &WordSets,
    ) -> Result<Self, StepError> {
        let relation_count = input_ids
            .first()
            .map(|caption| caption.iter().filter(|&&id| id == relation_id).count())
            .unwrap_or(0);
        if relation_count == 0 {
            return Err(StepError::RelationTokenNotInCaption { id: relation_id });
        }

        let positives: Vec<u32> = positive_ids
            .iter()
            .flatten()
            .copied()
            .filter(|id| !word_sets.special_ids.contains(id))
            .collect();
        if positives.is_empty() {
            return Err(StepError::EmptyPositivePool);
        }

        let negatives = input_ids
            .iter()
            .flatten()
            .copied()
            .filter(|&id| word_sets.is_negative_candidate(id, relation_id))
            .collect();

        Ok(Self {
            relation_count,
            positives,
            negatives,
        })
    }
}

/// Row-wise L2 normalization with a norm floor.
fn l2_normalize<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 2> {
    let norm = x.clone().powf_scalar(2.0).sum_dim(1).sqrt().clamp_min(NORM_EPS);
    x / norm
}

/// `log Σ exp(x)` along dim 1, shifted by the (detached) row max.
fn log_sum_exp<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 2> {
    let max = x.clone().max_dim(1).detach();
    (x - max.clone()).exp().sum_dim(1).log() + max
}

/// Multi-positive InfoNCE separating the relation embedding from entity
/// tokens and pulling it toward relation words.
///
/// The relation rows stay graph-connected to `embedding`; pool members are
/// read from a detached copy of the table, so gradients reach only the
/// relation row.
///
/// # Arguments
/// - `embedding`: the live table
/// - `pools`: pool ids from [`SteeringPools::collect`]
/// - `relation_id`: id of the relation token
/// - `temperature`: logit divisor, must be positive
///
/// # Returns
/// `mean_rows(lse(all) − lse(positives))`, a non-negative scalar.
pub fn steering_loss<B: Backend>(
    embedding: &TokenEmbedding<B>,
    pools: &SteeringPools,
    relation_id: u32,
    temperature: f64,
) -> Tensor<B, 1> {
    let device = embedding.weight.device();
    let num_pos = pools.positives.len();

    let relation = l2_normalize(embedding.rows(&vec![relation_id; pools.relation_count]));

    let pool_ids: Vec<u32> = pools
        .positives
        .iter()
        .chain(pools.negatives.iter())
        .copied()
        .collect();
    let pool = embedding
        .weight
        .val()
        .detach()
        .select(0, id_list_to_tensor::<B>(&pool_ids, &device));
    let pool = l2_normalize(pool);

    // (relations, positives + negatives)
    let logits = relation.matmul(pool.transpose()) / temperature;
    let [rows, _] = logits.dims();

    let lse_all = log_sum_exp(logits.clone());
    let lse_pos = log_sum_exp(logits.slice([0..rows, 0..num_pos]));

    (lse_all - lse_pos).mean()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::bridge::tensor_to_f64;
    use burn::backend::ndarray::NdArray;
    use burn::backend::Autodiff;
    use burn::optim::GradientsParams;
    use burn::tensor::TensorData;
    use std::collections::HashSet;

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<NdArray<f32>>;

    const BOS: u32 = 0;
    const EOS: u32 = 1;
    const REL: u32 = 7;

    fn word_sets() -> WordSets {
        WordSets {
            stop_ids: [2u32, 3].into_iter().collect(),
            special_ids: [BOS, EOS].into_iter().collect(),
            relation_words: vec!["on".into(), "under".into()],
        }
    }

    /// Rows: 0 bos, 1 eos, 2-3 stop, 4-5 entities, 6 positive word, 7 relation.
    fn table<B: Backend>(relation: [f32; 2], device: &B::Device) -> TokenEmbedding<B> {
        let rows: Vec<f32> = vec![
            0.3, 0.3, // bos
            0.2, -0.2, // eos
            0.5, 0.5, // stop
            -0.5, 0.5, // stop
            -1.0, 0.0, // entity
            -2.0, 0.0, // entity
            1.0, 0.0, // positive word
            relation[0], relation[1],
        ];
        TokenEmbedding::from_tensor(Tensor::from_data(TensorData::new(rows, [8, 2]), device))
    }

    #[test]
    fn test_pools_partition() {
        let input = vec![
            vec![BOS, 4, REL, 2, 5, EOS, EOS],
            vec![BOS, 5, 3, REL, EOS, EOS, EOS],
        ];
        let positives = vec![vec![BOS, 6, EOS], vec![BOS, 6, EOS]];
        let pools = SteeringPools::collect(&input, &positives, REL, &word_sets()).unwrap();
        assert_eq!(pools.relation_count, 1);
        assert_eq!(pools.positives, vec![6, 6]);
        assert_eq!(pools.negatives, vec![4, 5, 5]);
    }

    #[test]
    fn test_pools_errors() {
        let sets = word_sets();
        let positives = vec![vec![BOS, 6, EOS]];
        let err = SteeringPools::collect(&[vec![BOS, 4, EOS]], &positives, REL, &sets);
        assert!(matches!(err, Err(StepError::RelationTokenNotInCaption { id: REL })));

        let err = SteeringPools::collect(&[vec![BOS, REL, EOS]], &[vec![BOS, EOS]], REL, &sets);
        assert!(matches!(err, Err(StepError::EmptyPositivePool)));
    }

    #[test]
    fn test_steering_loss_near_zero_when_aligned() {
        let device = Default::default();
        let emb = table::<TestBackend>([3.0, 0.0], &device);
        let pools = SteeringPools {
            relation_count: 1,
            positives: vec![6],
            negatives: vec![4, 5],
        };
        let loss = tensor_to_f64(steering_loss(&emb, &pools, REL, 0.07));
        assert!(loss >= 0.0, "loss must be non-negative, got {loss}");
        assert!(loss < 1e-6, "aligned relation should give ~0 loss, got {loss}");
    }

    #[test]
    fn test_steering_loss_large_when_anti_aligned() {
        let device = Default::default();
        let emb = table::<TestBackend>([-1.0, 0.0], &device);
        let pools = SteeringPools {
            relation_count: 1,
            positives: vec![6],
            negatives: vec![4, 5],
        };
        let loss = tensor_to_f64(steering_loss(&emb, &pools, REL, 0.07));
        // positive cosine -1, negatives cosine 1: lse gap ≈ 2/0.07 + ln 2
        assert!(loss > 28.0, "anti-aligned relation should give large loss, got {loss}");
    }

    #[test]
    fn test_steering_loss_without_negatives_is_zero() {
        let device = Default::default();
        let emb = table::<TestBackend>([0.2, 0.9], &device);
        let pools = SteeringPools {
            relation_count: 2,
            positives: vec![6],
            negatives: vec![],
        };
        let loss = tensor_to_f64(steering_loss(&emb, &pools, REL, 0.07));
        assert!(loss.abs() < 1e-6, "single-class softmax gives zero loss, got {loss}");
    }

    #[test]
    fn test_steering_gradient_reaches_only_relation_row() {
        let device = Default::default();
        let emb = table::<TestAutodiffBackend>([0.3, 0.8], &device);
        let pools = SteeringPools {
            relation_count: 1,
            positives: vec![6],
            negatives: vec![4, 5],
        };
        let loss = steering_loss(&emb, &pools, REL, 0.07);
        let grads = GradientsParams::from_grads(loss.backward(), &emb);
        let grad: Tensor<TestBackend, 2> = grads
            .get::<NdArray<f32>, 2>(emb.weight.id)
            .expect("embedding gradient");
        let values: Vec<f32> = grad.into_data().to_vec().unwrap();
        let nonzero_rows: HashSet<usize> = values
            .chunks(2)
            .enumerate()
            .filter(|(_, r)| r.iter().any(|v| *v != 0.0))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(nonzero_rows, [REL as usize].into_iter().collect());
    }

    #[test]
    fn test_bce_with_logits_matches_formula() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 1>::from_data(TensorData::from([0.0_f32, 2.0]), &device);
        let real = tensor_to_f64(bce_with_logits(logits.clone(), true));
        let expected_real = (2.0_f64.ln() + (1.0 + (-2.0_f64).exp()).ln()) / 2.0;
        assert!((real - expected_real).abs() < 1e-5, "got {real}, expected {expected_real}");

        let fake = tensor_to_f64(bce_with_logits(logits, false));
        let expected_fake = (2.0_f64.ln() + (1.0 + 2.0_f64.exp()).ln()) / 2.0;
        assert!((fake - expected_fake).abs() < 1e-5, "got {fake}, expected {expected_fake}");
    }

    #[test]
    fn test_denoise_loss_is_mse() {
        let device = Default::default();
        let pred = Tensor::<TestBackend, 4>::ones([1, 1, 2, 2], &device);
        let noise = Tensor::<TestBackend, 4>::zeros([1, 1, 2, 2], &device);
        let loss = tensor_to_f64(denoise_loss(pred, noise));
        assert!((loss - 1.0).abs() < 1e-6);
    }
}
