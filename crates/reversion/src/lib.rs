//! Relation-token inversion for latent diffusion models.
//!
//! Learns a single token embedding that captures the relation shared by a
//! handful of exemplar images. Every other row of the text encoder's
//! embedding table is frozen by a post-step guard; the objective combines the
//! denoising loss with an adversarial term from a small latent discriminator
//! and a contrastive steering loss that pulls the token toward relation words.
//! Timesteps can be importance-sampled toward the high-noise end.
//!
//! The diffusion networks themselves stay outside the crate behind the traits
//! in [`model::collaborators`]; [`mocks`] provides toy versions for tests.

pub mod config;
pub mod error;
pub mod mocks;
pub mod model;
pub mod tokens;
pub mod training;
pub mod validation;

pub use config::{load_config, ReversionConfig};
pub use error::{ConfigError, StepError};
pub use training::trainer::{prepare_relation_token, train, FrozenModels, RunEnv, TrainOutcome};
