//! Typed errors raised at setup and inside a training step.

/// Fatal configuration problems. All of these are raised before the first
/// training step executes.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(
        "the tokenizer already contains the token {0:?}; pass a different placeholder token"
    )]
    PlaceholderExists(String),

    #[error("initializer token {token:?} must encode to a single token, got {count}")]
    InitializerNotSingleToken { token: String, count: usize },

    #[error("steering loss is enabled (weight {weight}) but num_positives is 0")]
    SteeringWithoutPositives { weight: f64 },

    #[error("num_positives = {requested} but only {available} relation words are available")]
    TooManyPositives { requested: usize, available: usize },

    #[error("scaled_cosine_alpha must lie in [0, 1], got {0}")]
    InvalidAlpha(f64),

    #[error("relation token id {id} is outside the embedding table ({vocab} rows)")]
    RelationTokenOutOfRange { id: u32, vocab: usize },

    #[error("no caption templates for exemplar image {0:?}")]
    MissingTemplates(String),

    #[error("invalid setting `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Failures inside a single training step. There is no per-step recovery:
/// these propagate and end the run.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("relation token {id} does not occur in the first caption of the batch")]
    RelationTokenNotInCaption { id: u32 },

    #[error("steering loss has an empty positive pool")]
    EmptyPositivePool,

    #[error("steering loss requires positive-word ids but the batch has none")]
    MissingPositiveIds,
}
