//! TOML configuration for a relation-inversion run.
//!
//! Every field has a default, so a minimal file only names the placeholder,
//! the initializer and the data/output directories:
//!
//! ```toml
//! placeholder_token = "<R>"
//! initializer_token = "and"
//! train_data_dir = "data/painted_on"
//! output_dir = "runs/painted_on"
//! seed = 0
//!
//! [loss]
//! steer_loss_weight = 0.01
//!
//! [steering]
//! num_positives = 4
//! ```

use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::model::discriminator::LatentDiscriminatorConfig;
use crate::training::composer::LossWeights;
use crate::training::schedule::LrScheduler;

/// Top-level run configuration.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ReversionConfig {
    /// Literal placeholder added to the vocabulary, e.g. `<R>`.
    #[serde(default = "default_placeholder")]
    pub placeholder_token: String,

    /// Existing single-token word whose embedding seeds the placeholder.
    #[serde(default = "default_initializer")]
    pub initializer_token: String,

    /// Directory holding the exemplar images and `text.json`.
    #[serde(default = "default_train_data_dir")]
    pub train_data_dir: PathBuf,

    /// Destination for learned embeddings and checkpoints.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Seed for every random draw. Without it resumed runs do not replay.
    #[serde(default)]
    pub seed: Option<u64>,

    #[serde(default)]
    pub training: TrainingSection,
    #[serde(default)]
    pub optimizer: OptimizerSection,
    #[serde(default)]
    pub sampling: SamplingSection,
    #[serde(default)]
    pub loss: LossSection,
    #[serde(default)]
    pub steering: SteeringSection,
    #[serde(default)]
    pub adversarial: AdversarialSection,
    #[serde(default)]
    pub checkpoint: CheckpointSection,
    #[serde(default)]
    pub validation: ValidationSection,
}

fn default_placeholder() -> String {
    "<R>".to_string()
}
fn default_initializer() -> String {
    "and".to_string()
}
fn default_train_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("text-inversion-model")
}

impl Default for ReversionConfig {
    fn default() -> Self {
        Self {
            placeholder_token: default_placeholder(),
            initializer_token: default_initializer(),
            train_data_dir: default_train_data_dir(),
            output_dir: default_output_dir(),
            seed: None,
            training: TrainingSection::default(),
            optimizer: OptimizerSection::default(),
            sampling: SamplingSection::default(),
            loss: LossSection::default(),
            steering: SteeringSection::default(),
            adversarial: AdversarialSection::default(),
            checkpoint: CheckpointSection::default(),
            validation: ValidationSection::default(),
        }
    }
}

/// `[training]`: batching and run length.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct TrainingSection {
    #[serde(default = "default_train_batch_size")]
    pub train_batch_size: usize,
    /// Upper bound on epochs; recomputed from `max_train_steps` when set.
    #[serde(default = "default_num_train_epochs")]
    pub num_train_epochs: usize,
    /// Optimizer steps to run. `None` means `num_train_epochs` full epochs.
    #[serde(default = "default_max_train_steps")]
    pub max_train_steps: Option<usize>,
    #[serde(default = "default_gradient_accumulation_steps")]
    pub gradient_accumulation_steps: usize,
    /// How many times each exemplar appears per epoch.
    #[serde(default = "default_repeats")]
    pub repeats: usize,
}

fn default_train_batch_size() -> usize {
    16
}
fn default_num_train_epochs() -> usize {
    100
}
fn default_max_train_steps() -> Option<usize> {
    Some(3000)
}
fn default_gradient_accumulation_steps() -> usize {
    1
}
fn default_repeats() -> usize {
    100
}

impl Default for TrainingSection {
    fn default() -> Self {
        Self {
            train_batch_size: default_train_batch_size(),
            num_train_epochs: default_num_train_epochs(),
            max_train_steps: default_max_train_steps(),
            gradient_accumulation_steps: default_gradient_accumulation_steps(),
            repeats: default_repeats(),
        }
    }
}

/// `[optimizer]`: AdamW over the embedding table and its LR schedule.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct OptimizerSection {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    /// Multiply the base lr by `accumulation × batch × processes`.
    #[serde(default)]
    pub scale_lr: bool,
    #[serde(default)]
    pub lr_scheduler: LrScheduler,
    #[serde(default = "default_lr_warmup_steps")]
    pub lr_warmup_steps: usize,
    #[serde(default = "default_adam_beta1")]
    pub adam_beta1: f64,
    #[serde(default = "default_adam_beta2")]
    pub adam_beta2: f64,
    #[serde(default = "default_adam_weight_decay")]
    pub adam_weight_decay: f64,
    #[serde(default = "default_adam_epsilon")]
    pub adam_epsilon: f64,
}

fn default_learning_rate() -> f64 {
    2.5e-4
}
fn default_lr_warmup_steps() -> usize {
    500
}
fn default_adam_beta1() -> f64 {
    0.9
}
fn default_adam_beta2() -> f64 {
    0.999
}
fn default_adam_weight_decay() -> f64 {
    1e-2
}
fn default_adam_epsilon() -> f64 {
    1e-8
}

impl Default for OptimizerSection {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            scale_lr: false,
            lr_scheduler: LrScheduler::default(),
            lr_warmup_steps: default_lr_warmup_steps(),
            adam_beta1: default_adam_beta1(),
            adam_beta2: default_adam_beta2(),
            adam_weight_decay: default_adam_weight_decay(),
            adam_epsilon: default_adam_epsilon(),
        }
    }
}

/// `[sampling]`: diffusion timestep policy.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct SamplingSection {
    #[serde(default)]
    pub importance_sampling: bool,
    #[serde(default = "default_scaled_cosine_alpha")]
    pub scaled_cosine_alpha: f64,
}

fn default_scaled_cosine_alpha() -> f64 {
    0.5
}

impl Default for SamplingSection {
    fn default() -> Self {
        Self {
            importance_sampling: false,
            scaled_cosine_alpha: default_scaled_cosine_alpha(),
        }
    }
}

/// `[loss]`: term weights.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct LossSection {
    #[serde(default = "default_denoise_weight")]
    pub denoise_loss_weight: f64,
    #[serde(default = "default_gan_weight")]
    pub gan_loss_weight: f64,
    #[serde(default)]
    pub steer_loss_weight: f64,
}

fn default_denoise_weight() -> f64 {
    1.0
}
fn default_gan_weight() -> f64 {
    0.001
}

impl Default for LossSection {
    fn default() -> Self {
        Self {
            denoise_loss_weight: default_denoise_weight(),
            gan_loss_weight: default_gan_weight(),
            steer_loss_weight: 0.0,
        }
    }
}

impl LossSection {
    pub fn weights(&self) -> LossWeights {
        LossWeights {
            denoise: self.denoise_loss_weight,
            gan: self.gan_loss_weight,
            steer: self.steer_loss_weight,
        }
    }
}

/// `[steering]`: contrastive loss inputs.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct SteeringSection {
    /// Relation words drawn per example as positives.
    #[serde(default)]
    pub num_positives: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// One word per line; built-in preposition list when unset.
    #[serde(default)]
    pub relation_words_file: Option<PathBuf>,
    /// One word per line; built-in English stop words when unset.
    #[serde(default)]
    pub stop_words_file: Option<PathBuf>,
}

fn default_temperature() -> f64 {
    0.07
}

impl Default for SteeringSection {
    fn default() -> Self {
        Self {
            num_positives: 0,
            temperature: default_temperature(),
            relation_words_file: None,
            stop_words_file: None,
        }
    }
}

/// `[adversarial]`: discriminator shape and optimizer.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct AdversarialSection {
    /// Discriminator lr; the embedding's base lr when unset. Not scheduled.
    #[serde(default)]
    pub learning_rate: Option<f64>,
    #[serde(default = "default_d_beta1")]
    pub adam_beta1: f64,
    #[serde(default = "default_adam_beta2")]
    pub adam_beta2: f64,
    #[serde(default = "default_base_channels")]
    pub base_channels: usize,
    #[serde(default = "default_num_downsamples")]
    pub num_downsamples: usize,
    #[serde(default = "default_latent_size")]
    pub latent_size: usize,
    #[serde(default = "default_latent_channels")]
    pub latent_channels: usize,
}

fn default_d_beta1() -> f64 {
    0.5
}
fn default_base_channels() -> usize {
    64
}
fn default_num_downsamples() -> usize {
    4
}
fn default_latent_size() -> usize {
    64
}
fn default_latent_channels() -> usize {
    4
}

impl Default for AdversarialSection {
    fn default() -> Self {
        Self {
            learning_rate: None,
            adam_beta1: default_d_beta1(),
            adam_beta2: default_adam_beta2(),
            base_channels: default_base_channels(),
            num_downsamples: default_num_downsamples(),
            latent_size: default_latent_size(),
            latent_channels: default_latent_channels(),
        }
    }
}

impl AdversarialSection {
    pub fn discriminator_config(&self) -> LatentDiscriminatorConfig {
        LatentDiscriminatorConfig::new()
            .with_in_channels(self.latent_channels)
            .with_base_channels(self.base_channels)
            .with_num_downsamples(self.num_downsamples)
            .with_latent_size(self.latent_size)
    }
}

/// `[checkpoint]`: save cadences and resume.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct CheckpointSection {
    /// Global steps between learned-embedding saves.
    #[serde(default = "default_save_steps")]
    pub save_steps: usize,
    /// Global steps between full trainer-state checkpoints.
    #[serde(default = "default_checkpointing_steps")]
    pub checkpointing_steps: usize,
    /// `"latest"` or a `checkpoint-N` directory.
    #[serde(default)]
    pub resume_from_checkpoint: Option<String>,
}

fn default_save_steps() -> usize {
    500
}
fn default_checkpointing_steps() -> usize {
    40_000
}

impl Default for CheckpointSection {
    fn default() -> Self {
        Self {
            save_steps: default_save_steps(),
            checkpointing_steps: default_checkpointing_steps(),
            resume_from_checkpoint: None,
        }
    }
}

/// `[validation]`: periodic rendering.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ValidationSection {
    #[serde(default)]
    pub validation_prompt: Option<String>,
    #[serde(default = "default_num_validation_images")]
    pub num_validation_images: usize,
    #[serde(default = "default_validation_epochs")]
    pub validation_epochs: usize,
    #[serde(default = "default_num_inference_steps")]
    pub num_inference_steps: usize,
}

fn default_num_validation_images() -> usize {
    4
}
fn default_validation_epochs() -> usize {
    50
}
fn default_num_inference_steps() -> usize {
    25
}

impl Default for ValidationSection {
    fn default() -> Self {
        Self {
            validation_prompt: None,
            num_validation_images: default_num_validation_images(),
            validation_epochs: default_validation_epochs(),
            num_inference_steps: default_num_inference_steps(),
        }
    }
}

/// Load and validate a run configuration.
pub fn load_config(path: &Path) -> Result<ReversionConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    let config: ReversionConfig = toml::from_str(&contents)?;
    config.validate()?;
    tracing::info!(path = %path.display(), "Loaded reversion config");
    Ok(config)
}

impl ReversionConfig {
    /// Check every setting that can be judged without the tokenizer or data.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.placeholder_token.trim().is_empty() {
            return Err(ConfigError::invalid("placeholder_token", "must not be empty"));
        }
        for (field, value) in [
            ("training.train_batch_size", self.training.train_batch_size),
            (
                "training.gradient_accumulation_steps",
                self.training.gradient_accumulation_steps,
            ),
            ("training.repeats", self.training.repeats),
            ("checkpoint.save_steps", self.checkpoint.save_steps),
            (
                "checkpoint.checkpointing_steps",
                self.checkpoint.checkpointing_steps,
            ),
            ("validation.validation_epochs", self.validation.validation_epochs),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(field, "must be positive"));
            }
        }
        if self.training.max_train_steps.is_none() && self.training.num_train_epochs == 0 {
            return Err(ConfigError::invalid(
                "training.num_train_epochs",
                "must be positive when max_train_steps is unset",
            ));
        }
        if !(self.optimizer.learning_rate > 0.0) {
            return Err(ConfigError::invalid(
                "optimizer.learning_rate",
                format!("must be positive, got {}", self.optimizer.learning_rate),
            ));
        }

        let alpha = self.sampling.scaled_cosine_alpha;
        if !(0.0..=1.0).contains(&alpha) {
            return Err(ConfigError::InvalidAlpha(alpha));
        }

        let weights = self.loss.weights();
        weights.validate()?;
        if weights.uses_steer() && self.steering.num_positives == 0 {
            return Err(ConfigError::SteeringWithoutPositives {
                weight: weights.steer,
            });
        }
        if !(self.steering.temperature > 0.0) {
            return Err(ConfigError::invalid(
                "steering.temperature",
                format!("must be positive, got {}", self.steering.temperature),
            ));
        }

        if weights.uses_gan() {
            self.adversarial.discriminator_config().final_kernel()?;
        }
        Ok(())
    }

    /// Check `num_positives` against the relation-word list actually loaded.
    pub fn validate_relation_words(&self, available: usize) -> Result<(), ConfigError> {
        let requested = self.steering.num_positives;
        if requested > available {
            return Err(ConfigError::TooManyPositives {
                requested,
                available,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let cfg = ReversionConfig::default();
        assert_eq!(cfg.placeholder_token, "<R>");
        assert_eq!(cfg.training.train_batch_size, 16);
        assert_eq!(cfg.training.max_train_steps, Some(3000));
        assert_eq!(cfg.training.repeats, 100);
        assert!((cfg.optimizer.learning_rate - 2.5e-4).abs() < 1e-12);
        assert_eq!(cfg.optimizer.lr_scheduler, LrScheduler::Constant);
        assert_eq!(cfg.optimizer.lr_warmup_steps, 500);
        assert!((cfg.adversarial.adam_beta1 - 0.5).abs() < 1e-12);
        assert_eq!(cfg.checkpoint.save_steps, 500);
        assert_eq!(cfg.checkpoint.checkpointing_steps, 40_000);
        assert_eq!(cfg.validation.num_inference_steps, 25);
        assert!((cfg.steering.temperature - 0.07).abs() < 1e-12);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_override() {
        let toml_str = r#"
            placeholder_token = "<rel>"
            seed = 7

            [training]
            train_batch_size = 2
            max_train_steps = 10

            [optimizer]
            lr_scheduler = "cosine"

            [loss]
            steer_loss_weight = 0.01

            [steering]
            num_positives = 4
        "#;
        let cfg: ReversionConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.placeholder_token, "<rel>");
        assert_eq!(cfg.seed, Some(7));
        assert_eq!(cfg.training.train_batch_size, 2);
        assert_eq!(cfg.training.gradient_accumulation_steps, 1);
        assert_eq!(cfg.optimizer.lr_scheduler, LrScheduler::Cosine);
        assert_eq!(cfg.steering.num_positives, 4);
        assert!((cfg.loss.gan_loss_weight - 0.001).abs() < 1e-12);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_steering_without_positives_rejected() {
        let mut cfg = ReversionConfig::default();
        cfg.loss.steer_loss_weight = 0.01;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::SteeringWithoutPositives { .. })
        ));
    }

    #[test]
    fn test_bad_alpha_rejected() {
        let mut cfg = ReversionConfig::default();
        cfg.sampling.scaled_cosine_alpha = 1.2;
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidAlpha(_))));
    }

    #[test]
    fn test_zero_cadence_rejected() {
        let mut cfg = ReversionConfig::default();
        cfg.checkpoint.save_steps = 0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid { field: "checkpoint.save_steps", .. })
        ));
    }

    #[test]
    fn test_discriminator_geometry_checked_only_with_gan() {
        let mut cfg = ReversionConfig::default();
        cfg.adversarial.latent_size = 48;
        cfg.adversarial.num_downsamples = 5;
        assert!(cfg.validate().is_err());
        cfg.loss.gan_loss_weight = 0.0;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_too_many_positives() {
        let mut cfg = ReversionConfig::default();
        cfg.steering.num_positives = 5;
        assert!(cfg.validate_relation_words(5).is_ok());
        assert!(matches!(
            cfg.validate_relation_words(3),
            Err(ConfigError::TooManyPositives { requested: 5, available: 3 })
        ));
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("run.toml");
        std::fs::write(&path, "initializer_token = \"with\"\n[sampling]\nimportance_sampling = true\n")
            .unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.initializer_token, "with");
        assert!(cfg.sampling.importance_sampling);

        std::fs::write(&path, "[training]\ntrain_batch_size = \"x\"\n").unwrap();
        assert!(matches!(load_config(&path), Err(ConfigError::Toml(_))));
    }
}
