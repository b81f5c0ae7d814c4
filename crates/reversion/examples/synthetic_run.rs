//! Run relation-token training end to end on toy collaborators.
//!
//! Writes a small synthetic data directory (placeholder image files plus
//! `text.json`), then trains the relation token with the mock encoder,
//! denoiser and tokenizer from `reversion::mocks`.
//!
//! Usage:
//!   cargo run -p reversion --example synthetic_run -- \
//!     --output-dir runs/synthetic --max-steps 50 --gan-weight 0.001 --steer-weight 0.1

use std::path::{Path, PathBuf};

use burn::backend::ndarray::NdArray;
use burn::backend::Autodiff;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use reversion::mocks::{
    ConditioningBiasDenoiser, ConstantNoiseScheduler, IdentityTextEncoder, PooledLatentEncoder,
    RecordingRenderer, SyntheticDecoder, WordTokenizer,
};
use reversion::model::embedding::TokenEmbedding;
use reversion::tokens::{owned_words, TextTokenizer, WordSets};
use reversion::training::data::ExemplarDataset;
use reversion::training::metrics::TracingTracker;
use reversion::training::sync::SingleProcess;
use reversion::training::trainer::dataset_options;
use reversion::validation::ValidationRenderer;
use reversion::{load_config, prepare_relation_token, train, FrozenModels, ReversionConfig, RunEnv};

type Backend = Autodiff<NdArray<f32>>;

const WORDS: &[&str] = &[
    "a", "the", "and", "cat", "dog", "table", "box", "man", "horse", "on", "under", "beside",
    "riding", "inside",
];
const STOP_WORDS: &[&str] = &["a", "the", "and"];
const RELATION_WORDS: &[&str] = &["on", "under", "beside", "riding", "inside"];
const CAPTIONS: &[&str] = &["a cat {} the table", "{} dog", "a man {} a horse", "box {} box"];

#[derive(Parser)]
struct Args {
    /// TOML config; built-in toy settings when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Where checkpoints and learned embeddings go.
    #[arg(long, default_value = "runs/synthetic")]
    output_dir: PathBuf,
    #[arg(long, default_value_t = 50)]
    max_steps: usize,
    #[arg(long, default_value_t = 0)]
    seed: u64,
    #[arg(long, default_value_t = 0.001)]
    gan_weight: f64,
    #[arg(long, default_value_t = 0.0)]
    steer_weight: f64,
    /// Side length of the synthetic exemplars in pixels.
    #[arg(long, default_value_t = 32)]
    image_size: usize,
    /// Embedding width of the toy table.
    #[arg(long, default_value_t = 16)]
    dim: usize,
}

fn write_synthetic_data(dir: &Path, images: usize) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir)?;
    let mut templates = serde_json::Map::new();
    for i in 0..images {
        let name = format!("exemplar_{i}.png");
        // SyntheticDecoder only looks at the file name.
        std::fs::write(dir.join(&name), b"")?;
        templates.insert(name, serde_json::json!(CAPTIONS));
    }
    std::fs::write(
        dir.join("text.json"),
        serde_json::to_string_pretty(&templates)?,
    )?;
    Ok(())
}

fn toy_config(args: &Args, data_dir: &Path) -> ReversionConfig {
    let mut config = ReversionConfig::default();
    config.train_data_dir = data_dir.to_path_buf();
    config.output_dir = args.output_dir.clone();
    config.seed = Some(args.seed);
    config.training.train_batch_size = 2;
    config.training.repeats = 2;
    config.training.max_train_steps = Some(args.max_steps);
    config.optimizer.learning_rate = 5e-3;
    config.loss.gan_loss_weight = args.gan_weight;
    config.loss.steer_loss_weight = args.steer_weight;
    config.steering.num_positives = if args.steer_weight > 0.0 { 2 } else { 0 };
    config.adversarial.base_channels = 8;
    config.adversarial.num_downsamples = 2;
    config.adversarial.latent_size = args.image_size / 4;
    config.checkpoint.save_steps = (args.max_steps / 2).max(1);
    config.checkpoint.checkpointing_steps = (args.max_steps / 2).max(1);
    config.validation.validation_prompt = Some("a cat <R> the dog".into());
    config.validation.validation_epochs = 5;
    config
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let data_dir = args.output_dir.join("data");
    write_synthetic_data(&data_dir, 4)?;
    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => toy_config(&args, &data_dir),
    };

    let device = Default::default();
    let mut tokenizer = WordTokenizer::new(WORDS, 12);
    let table = TokenEmbedding::<Backend>::random(tokenizer.vocab_size(), args.dim, &device);
    let (embedding, relation) = prepare_relation_token(
        &mut tokenizer,
        table,
        &config.placeholder_token,
        &config.initializer_token,
    )?;
    let word_sets = WordSets::from_words(
        &tokenizer,
        &owned_words(STOP_WORDS),
        &owned_words(RELATION_WORDS),
    )?;
    config.validate_relation_words(word_sets.relation_words.len())?;

    let decoder = SyntheticDecoder {
        size: args.image_size,
    };
    let dataset = ExemplarDataset::from_dir(
        &config.train_data_dir,
        &decoder,
        dataset_options(&config, &word_sets),
    )?;

    let text_encoder = IdentityTextEncoder;
    let latent_encoder = PooledLatentEncoder { factor: 4 };
    let denoiser = ConditioningBiasDenoiser { gain: 1.0 };
    let noise_scheduler = ConstantNoiseScheduler::new(1000, 1.0);
    let mut tracker = TracingTracker;
    let mut renderer = RecordingRenderer::new(args.image_size, args.image_size);

    let outcome = train(
        &config,
        embedding,
        &relation,
        &word_sets,
        &dataset,
        FrozenModels {
            text_encoder: &text_encoder,
            latent_encoder: &latent_encoder,
            denoiser: &denoiser,
            noise_scheduler: &noise_scheduler,
        },
        RunEnv {
            tokenizer: &tokenizer,
            process_group: &SingleProcess,
            tracker: &mut tracker,
            renderer: Some(&mut renderer as &mut dyn ValidationRenderer<NdArray<f32>>),
        },
        &device,
    )?;

    println!(
        "trained {} steps (seed {}), {} validation passes",
        outcome.global_step,
        outcome.seed,
        renderer.requests().len()
    );
    if let Some(path) = outcome.learned_embeds {
        println!("learned embedding: {}", path.display());
    }
    Ok(())
}
