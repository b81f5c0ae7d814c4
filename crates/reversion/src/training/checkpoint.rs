//! Persistence: learned-embedding files and full trainer-state checkpoints.
//!
//! Two artifacts, on two cadences:
//!
//! - `learned_embeds-steps-{g}.safetensors` (every `save_steps`) and the final
//!   `learned_embeds.safetensors`: the relation row only, as a safetensors map
//!   `{placeholder: f32[dim]}`.
//! - `checkpoint-{g}/` (every `checkpointing_steps`): embedding table,
//!   embedding optimizer, discriminator and its optimizer through burn's
//!   `NamedMpkFileRecorder`, plus `meta.json`.
//!
//! Resume recovers everything else from the step number `g`: the data order is
//! a pure function of `(seed, epoch)`, so skipping the consumed micro-batches
//! replays the uninterrupted run.

use std::path::{Path, PathBuf};

use burn::optim::Optimizer;
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder};
use burn::tensor::backend::AutodiffBackend;
use safetensors::tensor::{Dtype, TensorView};
use safetensors::SafeTensors;

use crate::model::bridge::tensor_to_vec;
use crate::model::discriminator::LatentDiscriminator;
use crate::model::embedding::TokenEmbedding;
use crate::tokens::{RelationToken, TextTokenizer};
use crate::training::adversarial::DiscriminatorStep;

pub const LEARNED_EMBEDS_FILE: &str = "learned_embeds.safetensors";
const CHECKPOINT_PREFIX: &str = "checkpoint-";

/// `learned_embeds-steps-{step}.safetensors`.
pub fn learned_embeds_step_file(step: usize) -> String {
    format!("learned_embeds-steps-{step}.safetensors")
}

/// Write the relation row of `embedding` as `{placeholder: vector}`.
pub fn save_learned_embeds<B: Backend>(
    embedding: &TokenEmbedding<B>,
    relation: &RelationToken,
    path: &Path,
) -> anyhow::Result<()> {
    let vector = tensor_to_vec(embedding.row(relation.id).detach())?;
    let bytes: Vec<u8> = vector.iter().flat_map(|v| v.to_le_bytes()).collect();
    let view = TensorView::new(Dtype::F32, vec![vector.len()], &bytes)
        .map_err(|e| anyhow::anyhow!("Failed to build tensor view: {e:?}"))?;
    let serialized = safetensors::serialize(vec![(relation.placeholder.as_str(), view)], &None)
        .map_err(|e| anyhow::anyhow!("Failed to serialize learned embeds: {e:?}"))?;
    std::fs::write(path, serialized)
        .map_err(|e| anyhow::anyhow!("Failed to write {}: {e}", path.display()))?;
    tracing::info!(path = %path.display(), placeholder = %relation.placeholder, "Saved learned embeds");
    Ok(())
}

/// Read every `(placeholder, vector)` pair from a learned-embeds file.
pub fn load_learned_embeds(path: &Path) -> anyhow::Result<Vec<(String, Vec<f32>)>> {
    let bytes = std::fs::read(path)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {e}", path.display()))?;
    let tensors = SafeTensors::deserialize(&bytes)
        .map_err(|e| anyhow::anyhow!("Failed to parse {}: {e:?}", path.display()))?;
    let mut out = Vec::new();
    for (name, view) in tensors.tensors() {
        anyhow::ensure!(
            view.dtype() == Dtype::F32,
            "{name}: expected F32, found {:?}",
            view.dtype()
        );
        anyhow::ensure!(view.shape().len() == 1, "{name}: expected a vector, got {:?}", view.shape());
        let values = view
            .data()
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        out.push((name, values));
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}

/// Install learned vectors into a table, registering placeholders the
/// tokenizer does not know yet.
pub fn install_learned_embeds<B: Backend>(
    mut embedding: TokenEmbedding<B>,
    tokenizer: &mut dyn TextTokenizer,
    path: &Path,
) -> anyhow::Result<TokenEmbedding<B>> {
    for (placeholder, vector) in load_learned_embeds(path)? {
        if tokenizer.add_token(&placeholder) {
            // Fresh row; its value is overwritten right below.
            embedding = embedding.with_added_row(0);
        }
        let id = tokenizer
            .token_to_id(&placeholder)
            .ok_or_else(|| anyhow::anyhow!("placeholder {placeholder:?} missing from tokenizer"))?;
        embedding = embedding.install_row(id, &vector)?;
        tracing::info!(placeholder, id, dim = vector.len(), "Installed learned embedding");
    }
    Ok(embedding)
}

/// Metadata saved alongside each checkpoint.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq)]
pub struct CheckpointMeta {
    pub global_step: usize,
    pub placeholder_token: String,
    pub relation_id: u32,
    pub vocab_size: usize,
    pub seed: Option<u64>,
    /// Whether discriminator state was saved.
    pub adversarial: bool,
}

/// `checkpoint-{step}`.
pub fn checkpoint_dir_name(step: usize) -> String {
    format!("{CHECKPOINT_PREFIX}{step}")
}

/// Step encoded in a `checkpoint-N` directory name.
pub fn parse_checkpoint_step(path: &Path) -> Option<usize> {
    path.file_name()?
        .to_str()?
        .strip_prefix(CHECKPOINT_PREFIX)?
        .parse()
        .ok()
}

/// The `checkpoint-N` directory with the highest `N`.
pub fn latest_checkpoint(output_dir: &Path) -> anyhow::Result<Option<PathBuf>> {
    if !output_dir.exists() {
        return Ok(None);
    }
    let mut best: Option<(usize, PathBuf)> = None;
    for entry in std::fs::read_dir(output_dir)? {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        if let Some(step) = parse_checkpoint_step(&path) {
            if best.as_ref().map_or(true, |(s, _)| step > *s) {
                best = Some((step, path));
            }
        }
    }
    Ok(best.map(|(_, p)| p))
}

/// Resolve `resume_from_checkpoint`.
///
/// - `None`: fresh run.
/// - `"latest"`: highest checkpoint in `output_dir`, or a warning and a fresh
///   run when there is none.
/// - anything else: a path as given, or relative to `output_dir`; missing is
///   an error.
pub fn resolve_resume(request: Option<&str>, output_dir: &Path) -> anyhow::Result<Option<PathBuf>> {
    let Some(request) = request else {
        return Ok(None);
    };
    if request == "latest" {
        let latest = latest_checkpoint(output_dir)?;
        if latest.is_none() {
            tracing::warn!(
                output_dir = %output_dir.display(),
                "resume_from_checkpoint = \"latest\" but no checkpoint exists; starting a new run"
            );
        }
        return Ok(latest);
    }
    let direct = PathBuf::from(request);
    if direct.is_dir() {
        return Ok(Some(direct));
    }
    let joined = output_dir.join(request);
    if joined.is_dir() {
        return Ok(Some(joined));
    }
    anyhow::bail!(
        "checkpoint {request:?} not found (also tried {})",
        joined.display()
    )
}

/// Where a resumed run picks up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumePoint {
    pub global_step: usize,
    pub first_epoch: usize,
    /// Micro-batches of `first_epoch` already consumed.
    pub resume_step: usize,
}

impl ResumePoint {
    pub fn fresh() -> Self {
        Self {
            global_step: 0,
            first_epoch: 0,
            resume_step: 0,
        }
    }

    /// Position after `global_step` optimizer steps.
    pub fn from_global_step(
        global_step: usize,
        updates_per_epoch: usize,
        gradient_accumulation_steps: usize,
    ) -> Self {
        let updates_per_epoch = updates_per_epoch.max(1);
        let resume_global = global_step * gradient_accumulation_steps;
        Self {
            global_step,
            first_epoch: global_step / updates_per_epoch,
            resume_step: resume_global % (updates_per_epoch * gradient_accumulation_steps),
        }
    }
}

/// Everything the optimizer loop mutates.
pub struct TrainerState<B: AutodiffBackend, OE, OD> {
    pub embedding: TokenEmbedding<B>,
    pub optimizer: OE,
    /// Present only when the adversarial term is enabled.
    pub adversary: Option<DiscriminatorStep<B, OD>>,
}

impl<B, OE, OD> TrainerState<B, OE, OD>
where
    B: AutodiffBackend,
    OE: Optimizer<TokenEmbedding<B>, B>,
    OD: Optimizer<LatentDiscriminator<B>, B>,
{
    /// Write `dir/{embedding,optimizer,discriminator,optimizer_d}.mpk` and
    /// `dir/meta.json`.
    pub fn save(&self, dir: &Path, meta: &CheckpointMeta) -> anyhow::Result<()> {
        std::fs::create_dir_all(dir)?;
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        let step = meta.global_step;

        self.embedding
            .clone()
            .save_file(dir.join("embedding"), &recorder)
            .map_err(|e| anyhow::anyhow!("Failed to save embedding at step {step}: {e}"))?;
        recorder
            .record(self.optimizer.to_record(), dir.join("optimizer"))
            .map_err(|e| anyhow::anyhow!("Failed to save optimizer at step {step}: {e}"))?;

        if let Some(adversary) = &self.adversary {
            adversary
                .discriminator()
                .clone()
                .save_file(dir.join("discriminator"), &recorder)
                .map_err(|e| anyhow::anyhow!("Failed to save discriminator at step {step}: {e}"))?;
            recorder
                .record(adversary.optimizer().to_record(), dir.join("optimizer_d"))
                .map_err(|e| {
                    anyhow::anyhow!("Failed to save discriminator optimizer at step {step}: {e}")
                })?;
        }

        let meta_path = dir.join("meta.json");
        serde_json::to_writer_pretty(std::fs::File::create(&meta_path)?, meta)?;
        tracing::info!(step, dir = %dir.display(), "Saved state");
        Ok(())
    }

    /// Restore state written by [`TrainerState::save`] on top of freshly
    /// initialized modules.
    pub fn load(self, dir: &Path, device: &B::Device) -> anyhow::Result<(Self, CheckpointMeta)> {
        let meta_path = dir.join("meta.json");
        let meta: CheckpointMeta = serde_json::from_reader(
            std::fs::File::open(&meta_path)
                .map_err(|e| anyhow::anyhow!("Failed to open {}: {e}", meta_path.display()))?,
        )
        .map_err(|e| anyhow::anyhow!("Failed to parse {}: {e}", meta_path.display()))?;

        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        let embedding = self
            .embedding
            .load_file(dir.join("embedding"), &recorder, device)
            .map_err(|e| anyhow::anyhow!("Failed to load embedding from {}: {e}", dir.display()))?;
        let optim_record = recorder
            .load(dir.join("optimizer"), device)
            .map_err(|e| anyhow::anyhow!("Failed to load optimizer from {}: {e}", dir.display()))?;
        let optimizer = self.optimizer.load_record(optim_record);

        let adversary = match self.adversary {
            None => None,
            Some(adversary) => {
                anyhow::ensure!(
                    meta.adversarial,
                    "checkpoint {} has no discriminator state but the adversarial loss is enabled",
                    dir.display()
                );
                let discriminator = adversary
                    .discriminator()
                    .clone()
                    .load_file(dir.join("discriminator"), &recorder, device)
                    .map_err(|e| {
                        anyhow::anyhow!("Failed to load discriminator from {}: {e}", dir.display())
                    })?;
                let record = recorder.load(dir.join("optimizer_d"), device).map_err(|e| {
                    anyhow::anyhow!(
                        "Failed to load discriminator optimizer from {}: {e}",
                        dir.display()
                    )
                })?;
                Some(adversary.restore(discriminator, record))
            }
        };

        tracing::info!(step = meta.global_step, dir = %dir.display(), "Restored trainer state");
        Ok((
            Self {
                embedding,
                optimizer,
                adversary,
            },
            meta,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::WordTokenizer;
    use burn::backend::ndarray::NdArray;
    use burn::tensor::TensorData;

    type TestBackend = NdArray<f32>;

    fn relation() -> RelationToken {
        RelationToken {
            placeholder: "<R>".into(),
            id: 2,
            initializer_id: 1,
        }
    }

    fn table() -> TokenEmbedding<TestBackend> {
        TokenEmbedding::from_tensor(Tensor::from_data(
            TensorData::new(vec![0.0_f32, 0.0, 1.0, 1.0, 0.5, -0.25], [3, 2]),
            &Default::default(),
        ))
    }

    #[test]
    fn test_learned_embeds_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(LEARNED_EMBEDS_FILE);
        save_learned_embeds(&table(), &relation(), &path).unwrap();
        let loaded = load_learned_embeds(&path).unwrap();
        assert_eq!(loaded, vec![("<R>".to_string(), vec![0.5, -0.25])]);
    }

    #[test]
    fn test_install_learned_embeds_registers_placeholder() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(LEARNED_EMBEDS_FILE);
        save_learned_embeds(&table(), &relation(), &path).unwrap();

        let mut tok = WordTokenizer::new(&[], 8);
        assert_eq!(tok.vocab_size(), 2);
        let base = TokenEmbedding::<TestBackend>::random(2, 2, &Default::default());
        let installed = install_learned_embeds(base, &mut tok, &path).unwrap();
        let id = tok.token_to_id("<R>").unwrap();
        assert_eq!(installed.vocab_size(), 3);
        assert_eq!(tensor_to_vec(installed.row(id)).unwrap(), vec![0.5, -0.25]);
    }

    #[test]
    fn test_file_names() {
        assert_eq!(learned_embeds_step_file(500), "learned_embeds-steps-500.safetensors");
        assert_eq!(checkpoint_dir_name(40), "checkpoint-40");
        assert_eq!(parse_checkpoint_step(Path::new("out/checkpoint-40")), Some(40));
        assert_eq!(parse_checkpoint_step(Path::new("out/checkpoint-x")), None);
        assert_eq!(parse_checkpoint_step(Path::new("out/logs")), None);
    }

    #[test]
    fn test_resolve_latest() {
        let dir = tempfile::TempDir::new().unwrap();
        assert_eq!(resolve_resume(Some("latest"), dir.path()).unwrap(), None);
        for step in [3, 12, 9] {
            std::fs::create_dir(dir.path().join(checkpoint_dir_name(step))).unwrap();
        }
        std::fs::write(dir.path().join("checkpoint-99"), b"not a dir").unwrap();
        let latest = resolve_resume(Some("latest"), dir.path()).unwrap().unwrap();
        assert_eq!(parse_checkpoint_step(&latest), Some(12));
    }

    #[test]
    fn test_resolve_explicit() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("checkpoint-5")).unwrap();
        let resolved = resolve_resume(Some("checkpoint-5"), dir.path()).unwrap().unwrap();
        assert_eq!(resolved, dir.path().join("checkpoint-5"));
        assert!(resolve_resume(Some("checkpoint-6"), dir.path()).is_err());
        assert_eq!(resolve_resume(None, dir.path()).unwrap(), None);
    }

    #[test]
    fn test_resume_point_arithmetic() {
        // 10 micro-batches per epoch, accumulation 2 → 5 updates per epoch.
        let p = ResumePoint::from_global_step(7, 5, 2);
        assert_eq!(p.first_epoch, 1);
        assert_eq!(p.resume_step, 4);

        let p = ResumePoint::from_global_step(10, 5, 2);
        assert_eq!(p.first_epoch, 2);
        assert_eq!(p.resume_step, 0);

        assert_eq!(ResumePoint::from_global_step(0, 5, 1), ResumePoint::fresh());
    }
}
