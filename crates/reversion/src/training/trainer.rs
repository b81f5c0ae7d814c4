//! Relation-token training loop.
//!
//! Ties together batch assembly, the frozen diffusion collaborators, the
//! adversarial subsystem, the steering loss and the update guard. Only the
//! embedding table is optimized (AdamW); the guard restores every row but the
//! relation token's after each optimizer step.
//!
//! One micro-step, in order:
//!
//! 1. encode exemplar pixels to latents, draw noise and timesteps, noise the
//!    latents
//! 2. embed the captions, encode them and predict the noise
//! 3. discriminator update on `(latents, pred.detach())`, then the generator
//!    term against the updated discriminator
//! 4. steering term from the batch's token pools
//! 5. compose, scale by `1 / accumulation`, backward, accumulate
//!
//! On the last micro-step of each accumulation window the gradients are
//! averaged across processes, AdamW steps, the guard restores the table and
//! the global step advances.

use std::path::{Path, PathBuf};
use std::time::Instant;

use burn::optim::{AdamWConfig, GradientsAccumulator, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::ReversionConfig;
use crate::error::StepError;
use crate::model::bridge::{id_list_to_tensor, tensor_to_f64};
use crate::model::collaborators::{Denoiser, LatentEncoder, NoiseScheduler, TextEncoder};
use crate::model::discriminator::LatentDiscriminator;
use crate::model::embedding::TokenEmbedding;
use crate::tokens::{
    load_word_list, owned_words, register_relation_token, RelationToken, TextTokenizer, WordSets,
    DEFAULT_RELATION_WORDS, DEFAULT_STOP_WORDS,
};
use crate::training::adversarial::{discriminator_optimizer, DiscriminatorStep};
use crate::training::checkpoint::{
    checkpoint_dir_name, learned_embeds_step_file, parse_checkpoint_step, resolve_resume,
    save_learned_embeds, CheckpointMeta, ResumePoint, TrainerState, LEARNED_EMBEDS_FILE,
};
use crate::training::composer::{compose, LossTerms, LossWeights};
use crate::training::data::{derive_seed, DatasetOptions, ExemplarBatch, ExemplarDataset};
use crate::training::guard::EmbeddingGuard;
use crate::training::loss::{denoise_loss, steering_loss, SteeringPools};
use crate::training::metrics::{StepLogs, Tracker};
use crate::training::schedule::{lr_at, scale_lr};
use crate::training::sync::ProcessGroup;
use crate::training::timesteps::TimestepSampler;
use crate::validation::{
    is_validation_epoch, run_validation, InferenceScheduler, ValidationRenderer, ValidationRequest,
};

/// Stream tag separating backend noise draws from batch draws.
const BACKEND_STREAM: u64 = 0xB4C;

/// Frozen networks of the diffusion model.
pub struct FrozenModels<'a, B: Backend> {
    pub text_encoder: &'a dyn TextEncoder<B>,
    pub latent_encoder: &'a dyn LatentEncoder<B>,
    pub denoiser: &'a dyn Denoiser<B>,
    pub noise_scheduler: &'a dyn NoiseScheduler<B>,
}

/// Process-level services the loop talks to.
pub struct RunEnv<'a, B: AutodiffBackend> {
    pub tokenizer: &'a dyn TextTokenizer,
    pub process_group: &'a dyn ProcessGroup,
    pub tracker: &'a mut dyn Tracker,
    /// Validation is skipped when absent.
    pub renderer: Option<&'a mut dyn ValidationRenderer<B::InnerBackend>>,
}

/// Result of a finished run.
#[derive(Debug)]
pub struct TrainOutcome<B: AutodiffBackend> {
    pub embedding: TokenEmbedding<B>,
    pub global_step: usize,
    /// Seed actually used; drawn from entropy for unseeded runs.
    pub seed: u64,
    /// Final `learned_embeds.safetensors`, written by the main process only.
    pub learned_embeds: Option<PathBuf>,
}

/// Step and epoch budget derived from the dataset size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainingPlan {
    pub batches_per_epoch: usize,
    pub gradient_accumulation_steps: usize,
    /// `ceil(batches_per_epoch / gradient_accumulation_steps)`.
    pub updates_per_epoch: usize,
    pub max_train_steps: usize,
    pub num_train_epochs: usize,
}

impl TrainingPlan {
    /// Without `max_train_steps` the run lasts `num_train_epochs` full epochs;
    /// with it, the epoch count is recomputed to cover the step budget.
    pub fn new(
        batches_per_epoch: usize,
        gradient_accumulation_steps: usize,
        max_train_steps: Option<usize>,
        num_train_epochs: usize,
    ) -> Self {
        let accumulation = gradient_accumulation_steps.max(1);
        let updates_per_epoch = batches_per_epoch.div_ceil(accumulation).max(1);
        let max_train_steps = max_train_steps.unwrap_or(num_train_epochs * updates_per_epoch);
        Self {
            batches_per_epoch,
            gradient_accumulation_steps: accumulation,
            updates_per_epoch,
            max_train_steps,
            num_train_epochs: max_train_steps.div_ceil(updates_per_epoch),
        }
    }

    /// Whether micro-batch `step` closes an accumulation window. The last
    /// batch of an epoch always does, even when the window is short.
    pub fn is_sync_step(&self, step: usize) -> bool {
        (step + 1) % self.gradient_accumulation_steps == 0 || step + 1 == self.batches_per_epoch
    }
}

/// Add the placeholder to the tokenizer and grow the table by one row copied
/// from the initializer token.
pub fn prepare_relation_token<B: Backend>(
    tokenizer: &mut dyn TextTokenizer,
    embedding: TokenEmbedding<B>,
    placeholder: &str,
    initializer: &str,
) -> anyhow::Result<(TokenEmbedding<B>, RelationToken)> {
    anyhow::ensure!(
        embedding.vocab_size() == tokenizer.vocab_size(),
        "embedding table has {} rows but the tokenizer has {} tokens",
        embedding.vocab_size(),
        tokenizer.vocab_size()
    );
    let relation = register_relation_token(tokenizer, placeholder, initializer)?;
    let embedding = embedding.with_added_row(relation.initializer_id);
    anyhow::ensure!(
        relation.id as usize + 1 == embedding.vocab_size(),
        "placeholder id {} is not the appended row {}",
        relation.id,
        embedding.vocab_size() - 1
    );
    Ok((embedding, relation))
}

/// Stop and relation word lists from the configured files, or the built-in
/// defaults.
pub fn load_word_sets(
    config: &ReversionConfig,
    tokenizer: &dyn TextTokenizer,
) -> anyhow::Result<WordSets> {
    let relation_words = match &config.steering.relation_words_file {
        Some(path) => load_word_list(path)?,
        None => owned_words(DEFAULT_RELATION_WORDS),
    };
    let stop_words = match &config.steering.stop_words_file {
        Some(path) => load_word_list(path)?,
        None => owned_words(DEFAULT_STOP_WORDS),
    };
    config.validate_relation_words(relation_words.len())?;
    WordSets::from_words(tokenizer, &stop_words, &relation_words)
}

/// Dataset options for `config` and the loaded relation words.
pub fn dataset_options(config: &ReversionConfig, word_sets: &WordSets) -> DatasetOptions {
    DatasetOptions {
        placeholder: config.placeholder_token.clone(),
        repeats: config.training.repeats,
        batch_size: config.training.train_batch_size,
        num_positives: config.steering.num_positives,
        relation_words: word_sets.relation_words.clone(),
    }
}

/// Loss settings shared by every micro-step.
struct Objective<'a> {
    weights: LossWeights,
    relation_id: u32,
    word_sets: &'a WordSets,
    temperature: f64,
    /// `[channels, height, width]` the discriminator accepts.
    latent_shape: [usize; 3],
}

/// Loss tensor and scalar values of one micro-step.
struct MicroStep<B: Backend> {
    loss: Tensor<B, 1>,
    total: f64,
    denoise: f64,
    gan: Option<f64>,
    steer: Option<f64>,
    d_loss: Option<f64>,
}

fn micro_step<B, OD>(
    embedding: &TokenEmbedding<B>,
    adversary: Option<&mut DiscriminatorStep<B, OD>>,
    batch: ExemplarBatch<B>,
    models: &FrozenModels<'_, B>,
    sampler: &TimestepSampler,
    objective: &Objective<'_>,
    rng: &mut StdRng,
    device: &B::Device,
) -> anyhow::Result<MicroStep<B>>
where
    B: AutodiffBackend,
    OD: Optimizer<LatentDiscriminator<B>, B>,
{
    let ids = batch.input_ids_tensor(device);
    let latents = models.latent_encoder.encode(batch.pixel_values).detach()
        * models.latent_encoder.scaling_factor();
    let [bsz, channels, height, width] = latents.dims();

    let noise = models
        .noise_scheduler
        .sample_noise([bsz, channels, height, width], device);
    let timesteps = sampler.sample(bsz, rng);
    let noisy = models
        .noise_scheduler
        .add_noise(latents.clone(), noise.clone(), &timesteps);
    let timestep_ids: Vec<u32> = timesteps.iter().map(|&t| t as u32).collect();

    let conditioning = models.text_encoder.encode(embedding.forward(ids));
    let pred = models.denoiser.predict_noise(
        noisy,
        id_list_to_tensor::<B>(&timestep_ids, device),
        conditioning,
    );

    let (d_loss, gan) = match adversary {
        Some(adversary) => {
            anyhow::ensure!(
                [channels, height, width] == objective.latent_shape,
                "latents have shape {:?}, discriminator expects {:?}",
                [channels, height, width],
                objective.latent_shape
            );
            let (report, generator) = adversary.step(latents, pred.clone().detach());
            (Some(report.d_loss), Some(generator.loss(pred.clone())))
        }
        None => (None, None),
    };

    let steer = if objective.weights.uses_steer() {
        let positive_ids = batch
            .positive_ids
            .as_deref()
            .ok_or(StepError::MissingPositiveIds)?;
        let pools = SteeringPools::collect(
            &batch.input_ids,
            positive_ids,
            objective.relation_id,
            objective.word_sets,
        )?;
        Some(steering_loss(
            embedding,
            &pools,
            objective.relation_id,
            objective.temperature,
        ))
    } else {
        None
    };

    let denoise = denoise_loss(pred, noise);
    let denoise_value = tensor_to_f64(denoise.clone());
    let gan_value = gan.clone().map(tensor_to_f64);
    let steer_value = steer.clone().map(tensor_to_f64);

    let loss = compose(
        &objective.weights,
        LossTerms {
            denoise,
            gan,
            steer,
        },
    );
    Ok(MicroStep {
        total: tensor_to_f64(loss.clone()),
        loss,
        denoise: denoise_value,
        gan: gan_value,
        steer: steer_value,
        d_loss,
    })
}

fn progress_bar(is_main: bool, max_train_steps: usize, position: usize) -> ProgressBar {
    if !is_main {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(max_train_steps as u64);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
    {
        pb.set_style(style.progress_chars("=> "));
    }
    pb.set_position(position as u64);
    pb
}

/// Run relation-token training.
///
/// # Arguments
/// - `config`: validated run configuration
/// - `embedding`: table already grown by [`prepare_relation_token`]; its
///   current values become the guard's reference
/// - `relation`: the registered relation token
/// - `word_sets`: stop/special/relation id sets for the steering pools
/// - `dataset`: exemplars with caption templates
/// - `models`: frozen diffusion collaborators
/// - `env`: tokenizer, process group, tracker and optional renderer
/// - `device`: burn device for every tensor
///
/// # Returns
/// The trained table plus the final step and artifact path.
#[allow(clippy::too_many_arguments)]
pub fn train<B: AutodiffBackend>(
    config: &ReversionConfig,
    embedding: TokenEmbedding<B>,
    relation: &RelationToken,
    word_sets: &WordSets,
    dataset: &ExemplarDataset,
    models: FrozenModels<'_, B>,
    mut env: RunEnv<'_, B>,
    device: &B::Device,
) -> anyhow::Result<TrainOutcome<B>> {
    config.validate()?;
    let is_main = env.process_group.is_main_process();
    let output_dir: &Path = &config.output_dir;
    if is_main {
        std::fs::create_dir_all(output_dir).map_err(|e| {
            anyhow::anyhow!("Failed to create output dir {}: {e}", output_dir.display())
        })?;
    }

    let weights = config.loss.weights();
    let guard = EmbeddingGuard::capture(&embedding, relation.id)?;
    let sampler = TimestepSampler::from_policy(
        models.noise_scheduler.num_train_timesteps(),
        config.sampling.importance_sampling,
        config.sampling.scaled_cosine_alpha,
    )?;

    let plan = TrainingPlan::new(
        dataset.batches_per_epoch(),
        config.training.gradient_accumulation_steps,
        config.training.max_train_steps,
        config.training.num_train_epochs,
    );

    let opt = &config.optimizer;
    let base_lr = if opt.scale_lr {
        scale_lr(
            opt.learning_rate,
            plan.gradient_accumulation_steps,
            config.training.train_batch_size,
            env.process_group.num_processes(),
        )
    } else {
        opt.learning_rate
    };

    let optimizer = AdamWConfig::new()
        .with_beta_1(opt.adam_beta1 as f32)
        .with_beta_2(opt.adam_beta2 as f32)
        .with_epsilon(opt.adam_epsilon as f32)
        .with_weight_decay(opt.adam_weight_decay as f32)
        .init::<B, TokenEmbedding<B>>();

    let adversary = if weights.uses_gan() {
        let adv = &config.adversarial;
        let discriminator = adv.discriminator_config().init::<B>(device)?;
        let d_lr = adv.learning_rate.unwrap_or(base_lr);
        tracing::info!(
            lr = d_lr,
            beta1 = adv.adam_beta1,
            latent_size = adv.latent_size,
            "Discriminator enabled"
        );
        Some(DiscriminatorStep::new(
            discriminator,
            discriminator_optimizer::<B>(adv.adam_beta1, adv.adam_beta2),
            d_lr,
        ))
    } else {
        None
    };

    let mut state = TrainerState {
        embedding,
        optimizer,
        adversary,
    };

    let mut resume = ResumePoint::fresh();
    let mut resumed_seed = None;
    if let Some(dir) =
        resolve_resume(config.checkpoint.resume_from_checkpoint.as_deref(), output_dir)?
    {
        let (loaded, meta) = state.load(&dir, device)?;
        anyhow::ensure!(
            meta.relation_id == relation.id && meta.vocab_size == loaded.embedding.vocab_size(),
            "checkpoint {} was written for token {} in a {}-row table, this run has token {} in {} rows",
            dir.display(),
            meta.relation_id,
            meta.vocab_size,
            relation.id,
            loaded.embedding.vocab_size()
        );
        state = loaded;
        let step = parse_checkpoint_step(&dir).unwrap_or(meta.global_step);
        resume = ResumePoint::from_global_step(
            step,
            plan.updates_per_epoch,
            plan.gradient_accumulation_steps,
        );
        resumed_seed = meta.seed;
        tracing::info!(
            global_step = resume.global_step,
            first_epoch = resume.first_epoch,
            resume_step = resume.resume_step,
            "Resuming from checkpoint"
        );
    }

    let seed = match config.seed.or(resumed_seed) {
        Some(seed) => seed,
        None => {
            let seed = rand::random::<u64>();
            tracing::warn!(seed, "No seed configured, drew one from entropy");
            seed
        }
    };

    let objective = Objective {
        weights,
        relation_id: relation.id,
        word_sets,
        temperature: config.steering.temperature,
        latent_shape: [
            config.adversarial.latent_channels,
            config.adversarial.latent_size,
            config.adversarial.latent_size,
        ],
    };

    tracing::info!(
        num_examples = dataset.len(),
        num_epochs = plan.num_train_epochs,
        batch_size = config.training.train_batch_size,
        processes = env.process_group.num_processes(),
        gradient_accumulation_steps = plan.gradient_accumulation_steps,
        max_train_steps = plan.max_train_steps,
        lr = base_lr,
        denoise_weight = weights.denoise,
        gan_weight = weights.gan,
        steer_weight = weights.steer,
        "Starting relation-token training"
    );

    let pb = progress_bar(is_main, plan.max_train_steps, resume.global_step);
    let train_start = Instant::now();
    let mut accumulator = GradientsAccumulator::<TokenEmbedding<B>>::new();
    let mut global_step = resume.global_step;
    let mut last_loss = None;

    for epoch in resume.first_epoch..plan.num_train_epochs {
        if global_step >= plan.max_train_steps {
            break;
        }
        let order = dataset.epoch_order(seed, epoch);

        for step in 0..plan.batches_per_epoch {
            if global_step >= plan.max_train_steps {
                break;
            }
            if epoch == resume.first_epoch && step < resume.resume_step {
                continue;
            }

            let stream = [epoch as u64, step as u64];
            let mut rng = StdRng::seed_from_u64(derive_seed(seed, &stream));
            B::seed(derive_seed(seed, &[epoch as u64, step as u64, BACKEND_STREAM]));

            let batch = dataset.make_batch::<B>(
                dataset.batch_indices(&order, step),
                env.tokenizer,
                &mut rng,
                device,
            )?;
            let lr = lr_at(
                opt.lr_scheduler,
                base_lr,
                opt.lr_warmup_steps,
                plan.max_train_steps,
                global_step,
            );

            let out = micro_step(
                &state.embedding,
                state.adversary.as_mut(),
                batch,
                &models,
                &sampler,
                &objective,
                &mut rng,
                device,
            )?;

            let scaled = out.loss / plan.gradient_accumulation_steps as f64;
            let grads = GradientsParams::from_grads(scaled.backward(), &state.embedding);
            accumulator.accumulate(&state.embedding, grads);

            if plan.is_sync_step(step) {
                let grads = env.process_group.all_reduce_mean(accumulator.grads())?;
                state.embedding = state.optimizer.step(lr, state.embedding, grads);
                state.embedding = guard.restore(state.embedding);
                global_step += 1;
                pb.inc(1);

                let save_embeds = global_step % config.checkpoint.save_steps == 0;
                let save_state = global_step % config.checkpoint.checkpointing_steps == 0;
                if is_main && save_embeds {
                    save_learned_embeds(
                        &state.embedding,
                        relation,
                        &output_dir.join(learned_embeds_step_file(global_step)),
                    )?;
                }
                if is_main && save_state {
                    let meta = CheckpointMeta {
                        global_step,
                        placeholder_token: relation.placeholder.clone(),
                        relation_id: relation.id,
                        vocab_size: state.embedding.vocab_size(),
                        seed: Some(seed),
                        adversarial: state.adversary.is_some(),
                    };
                    state.save(&output_dir.join(checkpoint_dir_name(global_step)), &meta)?;
                }
                if save_embeds || save_state {
                    env.process_group.wait_for_everyone()?;
                }
            }

            let logs = StepLogs {
                global_step,
                epoch,
                lr,
                loss: out.total,
                denoise_loss: out.denoise,
                gan_loss: out.gan,
                steer_loss: out.steer,
                d_loss: out.d_loss,
            };
            pb.set_message(logs.display());
            env.tracker.log_step(&logs);
            last_loss = Some(out.total);
        }

        let validation = &config.validation;
        if is_main
            && is_validation_epoch(
                validation.validation_prompt.as_deref(),
                epoch,
                validation.validation_epochs,
            )
        {
            if let (Some(renderer), Some(prompt)) = (
                env.renderer.as_deref_mut(),
                validation.validation_prompt.as_ref(),
            ) {
                let request = ValidationRequest {
                    prompt: prompt.clone(),
                    num_images: validation.num_validation_images,
                    num_inference_steps: validation.num_inference_steps,
                    scheduler: InferenceScheduler::DpmSolverMultistep,
                    seed: config.seed,
                };
                run_validation(&state.embedding, renderer, &mut *env.tracker, &request, epoch)?;
            }
        }
    }

    pb.finish_with_message("done");
    env.process_group.wait_for_everyone()?;
    let learned_embeds = if is_main {
        let path = output_dir.join(LEARNED_EMBEDS_FILE);
        save_learned_embeds(&state.embedding, relation, &path)?;
        Some(path)
    } else {
        None
    };
    env.process_group.wait_for_everyone()?;

    tracing::info!(
        global_step,
        elapsed_s = train_start.elapsed().as_secs_f64(),
        final_loss = last_loss,
        "Training complete"
    );

    Ok(TrainOutcome {
        embedding: state.embedding,
        global_step,
        seed,
        learned_embeds,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::WordTokenizer;
    use crate::model::bridge::tensor_to_vec;
    use burn::backend::ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_plan_from_max_steps() {
        let plan = TrainingPlan::new(5, 2, Some(7), 100);
        assert_eq!(plan.updates_per_epoch, 3);
        assert_eq!(plan.max_train_steps, 7);
        assert_eq!(plan.num_train_epochs, 3);
    }

    #[test]
    fn test_plan_from_epochs() {
        let plan = TrainingPlan::new(4, 1, None, 3);
        assert_eq!(plan.updates_per_epoch, 4);
        assert_eq!(plan.max_train_steps, 12);
        assert_eq!(plan.num_train_epochs, 3);
    }

    #[test]
    fn test_sync_steps_close_short_last_window() {
        let plan = TrainingPlan::new(5, 2, Some(10), 1);
        let syncs: Vec<usize> = (0..5).filter(|&s| plan.is_sync_step(s)).collect();
        assert_eq!(syncs, vec![1, 3, 4]);
    }

    #[test]
    fn test_resume_point_matches_sync_schedule() {
        let plan = TrainingPlan::new(5, 2, Some(10), 1);
        // Four optimizer steps: one full epoch (3) plus the first window of epoch 1.
        let resume = ResumePoint::from_global_step(4, plan.updates_per_epoch, 2);
        assert_eq!(resume.first_epoch, 1);
        assert_eq!(resume.resume_step, 2);
    }

    #[test]
    fn test_prepare_relation_token_copies_initializer_row() {
        let device = Default::default();
        let mut tok = WordTokenizer::new(&["cat", "and", "dog"], 8);
        let emb = TokenEmbedding::<TestBackend>::random(tok.vocab_size(), 4, &device);
        let init_row = tensor_to_vec(emb.row(3)).unwrap();

        let (emb, relation) = prepare_relation_token(&mut tok, emb, "<R>", "and").unwrap();
        assert_eq!(relation.id, 5);
        assert_eq!(relation.initializer_id, 3);
        assert_eq!(emb.vocab_size(), 6);
        assert_eq!(tensor_to_vec(emb.row(5)).unwrap(), init_row);
    }

    #[test]
    fn test_prepare_relation_token_rejects_mismatched_table() {
        let device = Default::default();
        let mut tok = WordTokenizer::new(&["cat", "and"], 8);
        let emb = TokenEmbedding::<TestBackend>::random(10, 4, &device);
        assert!(prepare_relation_token(&mut tok, emb, "<R>", "and").is_err());
    }

    #[test]
    fn test_prepare_relation_token_rejects_existing_placeholder() {
        let device = Default::default();
        let mut tok = WordTokenizer::new(&["cat", "and"], 8);
        let emb = TokenEmbedding::<TestBackend>::random(tok.vocab_size(), 4, &device);
        let err = prepare_relation_token(&mut tok, emb, "cat", "and").unwrap_err();
        assert!(err.to_string().contains("cat"), "{err}");
    }
}
