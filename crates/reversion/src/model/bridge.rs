//! Tensor bridge: conversions between host-side token ids / vectors and burn
//! tensors.
//!
//! Captions and word lists live on the host as `Vec<u32>` rows; the embedding
//! table and losses need `Tensor<B, _, Int>` indices. Learned vectors leave the
//! graph as `Vec<f32>` for safetensors persistence.

use burn::prelude::*;
use burn::tensor::TensorData;

/// Convert padded token-id rows to a `[rows, len]` int tensor.
///
/// # Panics
/// Panics if `rows` is empty or the rows have inconsistent lengths.
pub fn ids_to_tensor<B: Backend>(rows: &[Vec<u32>], device: &B::Device) -> Tensor<B, 2, Int> {
    assert!(!rows.is_empty(), "id rows must not be empty");
    let len = rows[0].len();
    for (i, row) in rows.iter().enumerate() {
        assert_eq!(row.len(), len, "id row {i} has length {}, expected {len}", row.len());
    }
    let flat: Vec<i64> = rows.iter().flat_map(|r| r.iter().map(|&id| id as i64)).collect();
    Tensor::from_data(TensorData::new(flat, [rows.len(), len]), device)
}

/// Convert a flat id list to a 1D int tensor (used with `select`).
pub fn id_list_to_tensor<B: Backend>(ids: &[u32], device: &B::Device) -> Tensor<B, 1, Int> {
    let flat: Vec<i64> = ids.iter().map(|&id| id as i64).collect();
    Tensor::from_data(TensorData::new(flat, [ids.len()]), device)
}

/// Convert an f32 vector to a 1D tensor.
pub fn vector_to_tensor<B: Backend>(values: &[f32], device: &B::Device) -> Tensor<B, 1> {
    Tensor::from_data(TensorData::new(values.to_vec(), [values.len()]), device)
}

/// Extract f32 values from a burn 1D tensor.
pub fn tensor_to_vec<B: Backend>(tensor: Tensor<B, 1>) -> anyhow::Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| anyhow::anyhow!("Failed to read tensor data: {e:?}"))
}

/// Extract a single f64 scalar from a burn 1D tensor.
///
/// # Panics
/// Panics if the tensor does not contain exactly one element.
pub fn tensor_to_f64<B: Backend>(tensor: Tensor<B, 1>) -> f64 {
    let val: f32 = tensor.into_scalar().elem();
    val as f64
}
