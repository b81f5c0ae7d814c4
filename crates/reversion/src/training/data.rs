//! Exemplar images, caption templates and batch assembly.
//!
//! A training directory holds a few exemplar images plus `text.json`, which
//! maps each image file name to caption templates containing `{}`:
//!
//! ```json
//! { "cat_on_table.png": ["{} ", "a cat {} a table", "cat {} table"] }
//! ```
//!
//! Each draw picks one template at random and substitutes the placeholder.
//! Image decoding and resizing happen outside the crate through
//! [`ImageDecoder`]; this module only sees normalized pixel buffers.
//!
//! Randomness is derived from `(seed, epoch)` for the shuffle and from
//! `(seed, epoch, step)` for per-batch draws, so a resumed run replays the
//! exact batches an uninterrupted run would have produced.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use burn::prelude::*;
use burn::tensor::TensorData;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::error::ConfigError;
use crate::model::bridge::ids_to_tensor;
use crate::tokens::{encode_padded, TextTokenizer};

/// File extensions treated as exemplar images.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "bmp"];

/// Mix a base seed with stream coordinates (epoch, step, ...).
///
/// SplitMix64 finalizer applied per coordinate.
pub fn derive_seed(seed: u64, stream: &[u64]) -> u64 {
    stream.iter().fold(seed, |acc, &x| {
        let mut z = acc ^ x.wrapping_add(0x9E37_79B9_7F4A_7C15);
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    })
}

/// Per-image caption templates from `text.json`.
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(transparent)]
pub struct CaptionTemplates {
    by_image: HashMap<String, Vec<String>>,
}

impl CaptionTemplates {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)
            .map_err(|e| anyhow::anyhow!("Failed to open {}: {e}", path.display()))?;
        let templates: Self = serde_json::from_reader(std::io::BufReader::new(file))
            .map_err(|e| anyhow::anyhow!("Failed to parse {}: {e}", path.display()))?;
        tracing::info!(
            path = %path.display(),
            images = templates.by_image.len(),
            "Loaded caption templates"
        );
        Ok(templates)
    }

    pub fn from_map(by_image: HashMap<String, Vec<String>>) -> Self {
        Self { by_image }
    }

    pub fn has_templates(&self, image: &str) -> bool {
        self.by_image.get(image).is_some_and(|t| !t.is_empty())
    }

    /// A random template for `image` with `{}` replaced by `placeholder`.
    pub fn caption(
        &self,
        image: &str,
        placeholder: &str,
        rng: &mut impl Rng,
    ) -> Result<String, ConfigError> {
        self.by_image
            .get(image)
            .and_then(|t| t.choose(rng))
            .map(|t| t.replace("{}", placeholder))
            .ok_or_else(|| ConfigError::MissingTemplates(image.to_string()))
    }
}

/// One decoded exemplar: CHW pixels in `[-1, 1]`.
#[derive(Debug, Clone)]
pub struct Exemplar {
    /// File name, the key into `text.json`.
    pub name: String,
    pub pixels: Vec<f32>,
    /// `[channels, height, width]`.
    pub shape: [usize; 3],
}

impl Exemplar {
    /// Build from interleaved RGB8 (`height × width × 3`), mapping
    /// `[0, 255] → [-1, 1]`.
    pub fn from_rgb8(name: impl Into<String>, rgb: &[u8], width: usize, height: usize) -> Self {
        let plane = width * height;
        let mut pixels = vec![0.0_f32; 3 * plane];
        for (i, px) in rgb.chunks_exact(3).take(plane).enumerate() {
            for c in 0..3 {
                pixels[c * plane + i] = px[c] as f32 / 127.5 - 1.0;
            }
        }
        Self {
            name: name.into(),
            pixels,
            shape: [3, height, width],
        }
    }
}

/// Decodes and resizes one image file. Implemented outside the crate.
pub trait ImageDecoder {
    fn decode(&self, path: &Path) -> anyhow::Result<Exemplar>;
}

/// Image files directly inside `dir`, sorted by name.
pub fn list_images(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| anyhow::anyhow!("Failed to read data dir {}: {e}", dir.display()))?;
    let mut paths = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
        if path.is_file() && is_image {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

/// One micro-batch, consumed once.
#[derive(Debug, Clone)]
pub struct ExemplarBatch<B: Backend> {
    /// `[b, c, h, w]` in `[-1, 1]`.
    pub pixel_values: Tensor<B, 4>,
    /// Padded caption ids, one row per example.
    pub input_ids: Vec<Vec<u32>>,
    /// Padded positive-word ids, present when `num_positives > 0`.
    pub positive_ids: Option<Vec<Vec<u32>>>,
}

impl<B: Backend> ExemplarBatch<B> {
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    pub fn input_ids_tensor(&self, device: &B::Device) -> Tensor<B, 2, Int> {
        ids_to_tensor(&self.input_ids, device)
    }
}

/// Batching parameters of an [`ExemplarDataset`].
#[derive(Debug, Clone)]
pub struct DatasetOptions {
    pub placeholder: String,
    pub repeats: usize,
    pub batch_size: usize,
    pub num_positives: usize,
    pub relation_words: Vec<String>,
}

/// Exemplars repeated `repeats` times per epoch.
#[derive(Debug, Clone)]
pub struct ExemplarDataset {
    exemplars: Vec<Exemplar>,
    templates: CaptionTemplates,
    options: DatasetOptions,
}

impl ExemplarDataset {
    /// Validate exemplars against templates and options.
    pub fn new(
        exemplars: Vec<Exemplar>,
        templates: CaptionTemplates,
        options: DatasetOptions,
    ) -> Result<Self, ConfigError> {
        if exemplars.is_empty() {
            return Err(ConfigError::invalid("train_data_dir", "no exemplar images found"));
        }
        if options.batch_size == 0 || options.repeats == 0 {
            return Err(ConfigError::invalid(
                "training",
                "batch size and repeats must be positive",
            ));
        }
        if options.num_positives > options.relation_words.len() {
            return Err(ConfigError::TooManyPositives {
                requested: options.num_positives,
                available: options.relation_words.len(),
            });
        }
        let shape = exemplars[0].shape;
        for ex in &exemplars {
            if !templates.has_templates(&ex.name) {
                return Err(ConfigError::MissingTemplates(ex.name.clone()));
            }
            if ex.shape != shape || ex.pixels.len() != shape.iter().product::<usize>() {
                return Err(ConfigError::invalid(
                    "train_data_dir",
                    format!("exemplar {} has shape {:?}, expected {shape:?}", ex.name, ex.shape),
                ));
            }
        }
        Ok(Self {
            exemplars,
            templates,
            options,
        })
    }

    /// Decode every image in `dir` and read `dir/text.json`.
    pub fn from_dir(
        dir: &Path,
        decoder: &dyn ImageDecoder,
        options: DatasetOptions,
    ) -> anyhow::Result<Self> {
        let templates = CaptionTemplates::load(&dir.join("text.json"))?;
        let exemplars = list_images(dir)?
            .iter()
            .map(|p| decoder.decode(p))
            .collect::<anyhow::Result<Vec<_>>>()?;
        tracing::info!(dir = %dir.display(), images = exemplars.len(), "Decoded exemplars");
        Ok(Self::new(exemplars, templates, options)?)
    }

    pub fn num_images(&self) -> usize {
        self.exemplars.len()
    }

    /// `images × repeats`.
    pub fn len(&self) -> usize {
        self.exemplars.len() * self.options.repeats
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn batch_size(&self) -> usize {
        self.options.batch_size
    }

    /// Micro-batches per epoch; the last one may be short.
    pub fn batches_per_epoch(&self) -> usize {
        self.len().div_ceil(self.options.batch_size)
    }

    /// Shuffled dataset indices for `epoch`.
    pub fn epoch_order(&self, seed: u64, epoch: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.shuffle(&mut StdRng::seed_from_u64(derive_seed(seed, &[epoch as u64])));
        order
    }

    /// Indices of micro-batch `step` within an epoch order.
    pub fn batch_indices<'a>(&self, order: &'a [usize], step: usize) -> &'a [usize] {
        let start = (step * self.options.batch_size).min(order.len());
        let end = (start + self.options.batch_size).min(order.len());
        &order[start..end]
    }

    /// Assemble a batch: pixels, one random caption per example and, when
    /// requested, `num_positives` relation words sampled without replacement.
    pub fn make_batch<B: Backend>(
        &self,
        indices: &[usize],
        tokenizer: &dyn TextTokenizer,
        rng: &mut impl Rng,
        device: &B::Device,
    ) -> anyhow::Result<ExemplarBatch<B>> {
        anyhow::ensure!(!indices.is_empty(), "cannot build an empty batch");
        let max_length = tokenizer.model_max_length();
        let [c, h, w] = self.exemplars[0].shape;

        let mut pixels = Vec::with_capacity(indices.len() * c * h * w);
        let mut input_ids = Vec::with_capacity(indices.len());
        let mut positive_ids = Vec::with_capacity(indices.len());

        for &i in indices {
            let exemplar = &self.exemplars[i % self.exemplars.len()];
            pixels.extend_from_slice(&exemplar.pixels);

            let caption = self
                .templates
                .caption(&exemplar.name, &self.options.placeholder, rng)?;
            input_ids.push(encode_padded(tokenizer, &caption, max_length)?);

            if self.options.num_positives > 0 {
                let words: Vec<&str> = self
                    .options
                    .relation_words
                    .choose_multiple(rng, self.options.num_positives)
                    .map(String::as_str)
                    .collect();
                positive_ids.push(encode_padded(tokenizer, &words.join(" "), max_length)?);
            }
        }

        let pixel_values = Tensor::from_data(
            TensorData::new(pixels, [indices.len(), c, h, w]),
            device,
        );
        Ok(ExemplarBatch {
            pixel_values,
            input_ids,
            positive_ids: (self.options.num_positives > 0).then_some(positive_ids),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::WordTokenizer;
    use burn::backend::ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn templates() -> CaptionTemplates {
        let mut map = HashMap::new();
        map.insert("a.png".to_string(), vec!["cat {} table".to_string()]);
        map.insert("b.png".to_string(), vec!["dog {} rug".to_string(), "{}".to_string()]);
        CaptionTemplates::from_map(map)
    }

    fn exemplar(name: &str, value: u8) -> Exemplar {
        Exemplar::from_rgb8(name, &[value; 2 * 2 * 3], 2, 2)
    }

    fn options(num_positives: usize) -> DatasetOptions {
        DatasetOptions {
            placeholder: "<R>".into(),
            repeats: 3,
            batch_size: 4,
            num_positives,
            relation_words: vec!["on".into(), "under".into(), "beside".into()],
        }
    }

    fn tokenizer() -> WordTokenizer {
        let mut tok = WordTokenizer::new(&["cat", "table", "dog", "rug", "on", "under", "beside"], 8);
        crate::tokens::TextTokenizer::add_token(&mut tok, "<R>");
        tok
    }

    #[test]
    fn test_rgb8_normalization() {
        let ex = Exemplar::from_rgb8("x.png", &[0, 255, 51, 0, 255, 51], 2, 1);
        assert_eq!(ex.shape, [3, 1, 2]);
        assert_eq!(ex.pixels[0], -1.0);
        assert_eq!(ex.pixels[2], 1.0);
        assert!((ex.pixels[4] - (51.0 / 127.5 - 1.0)).abs() < 1e-6);
    }

    #[test]
    fn test_lengths() {
        let ds = ExemplarDataset::new(
            vec![exemplar("a.png", 0), exemplar("b.png", 255)],
            templates(),
            options(0),
        )
        .unwrap();
        assert_eq!(ds.len(), 6);
        assert_eq!(ds.batches_per_epoch(), 2);
        let order = ds.epoch_order(1, 0);
        assert_eq!(ds.batch_indices(&order, 0).len(), 4);
        assert_eq!(ds.batch_indices(&order, 1).len(), 2);
    }

    #[test]
    fn test_epoch_order_is_seeded_permutation() {
        let ds = ExemplarDataset::new(vec![exemplar("a.png", 0)], templates(), options(0)).unwrap();
        let a = ds.epoch_order(5, 2);
        assert_eq!(a, ds.epoch_order(5, 2));
        let mut sorted = a.clone();
        sorted.sort();
        assert_eq!(sorted, vec![0, 1, 2]);
    }

    #[test]
    fn test_missing_templates_rejected() {
        let err = ExemplarDataset::new(vec![exemplar("c.png", 0)], templates(), options(0));
        assert!(matches!(err, Err(ConfigError::MissingTemplates(name)) if name == "c.png"));
    }

    #[test]
    fn test_too_many_positives_rejected() {
        let err = ExemplarDataset::new(vec![exemplar("a.png", 0)], templates(), options(4));
        assert!(matches!(err, Err(ConfigError::TooManyPositives { requested: 4, available: 3 })));
    }

    #[test]
    fn test_make_batch() {
        let device = Default::default();
        let tok = tokenizer();
        let ds = ExemplarDataset::new(
            vec![exemplar("a.png", 0), exemplar("b.png", 255)],
            templates(),
            options(2),
        )
        .unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let batch = ds.make_batch::<TestBackend>(&[0, 2], &tok, &mut rng, &device).unwrap();

        assert_eq!(batch.pixel_values.dims(), [2, 3, 2, 2]);
        assert_eq!(batch.len(), 2);
        let relation = tok.token_to_id("<R>").unwrap();
        let special = tok.special_ids();
        // "cat <R> table" → bos cat <R> table eos pad pad pad
        assert_eq!(batch.input_ids[0].len(), 8);
        assert_eq!(batch.input_ids[0][2], relation);
        assert_eq!(batch.input_ids[0][4], special.eos);

        let positives = batch.positive_ids.unwrap();
        assert_eq!(positives.len(), 2);
        for row in positives {
            let words: Vec<u32> = row[1..3].to_vec();
            assert_ne!(words[0], words[1], "positives are drawn without replacement");
            assert_eq!(row[3], special.eos);
        }
    }

    #[test]
    fn test_caption_substitutes_placeholder() {
        let mut rng = StdRng::seed_from_u64(0);
        let caption = templates().caption("a.png", "<R>", &mut rng).unwrap();
        assert_eq!(caption, "cat <R> table");
    }

    #[test]
    fn test_list_images_filters_and_sorts() {
        let dir = tempfile::TempDir::new().unwrap();
        for name in ["b.PNG", "a.jpg", "text.json", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let names: Vec<String> = list_images(dir.path())
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.jpg", "b.PNG"]);
    }

    #[test]
    fn test_derive_seed_separates_streams() {
        assert_ne!(derive_seed(0, &[1]), derive_seed(0, &[2]));
        assert_ne!(derive_seed(0, &[1, 0]), derive_seed(0, &[0, 1]));
        assert_eq!(derive_seed(9, &[3, 4]), derive_seed(9, &[3, 4]));
    }
}
