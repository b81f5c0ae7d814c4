//! Periodic validation rendering.
//!
//! Rendering runs the full sampling pipeline, which lives outside this crate
//! behind [`ValidationRenderer`]. The trainer hands the renderer a
//! gradient-free copy of the live embedding table; nothing the renderer does
//! can touch training parameters or optimizer state.

use burn::module::AutodiffModule;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

use crate::model::embedding::TokenEmbedding;
use crate::training::metrics::Tracker;

/// Sampler used by the temporary inference pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferenceScheduler {
    /// DPM-Solver++ multistep: good samples in ~25 steps.
    #[default]
    DpmSolverMultistep,
    /// The training DDPM scheduler; slow, for debugging only.
    Ddpm,
}

/// What to render.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationRequest {
    pub prompt: String,
    pub num_images: usize,
    pub num_inference_steps: usize,
    pub scheduler: InferenceScheduler,
    /// Generator seed, shared by every image of the pass.
    pub seed: Option<u64>,
}

/// One rendered RGB8 image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationImage {
    pub width: usize,
    pub height: usize,
    /// Interleaved `height × width × 3`.
    pub rgb: Vec<u8>,
}

/// Renders images from a prompt through the text encoder using `embedding`.
pub trait ValidationRenderer<B: Backend> {
    fn render(
        &mut self,
        request: &ValidationRequest,
        embedding: &TokenEmbedding<B>,
    ) -> anyhow::Result<Vec<ValidationImage>>;
}

/// Render one validation pass and log the images.
pub fn run_validation<B: AutodiffBackend>(
    embedding: &TokenEmbedding<B>,
    renderer: &mut dyn ValidationRenderer<B::InnerBackend>,
    tracker: &mut dyn Tracker,
    request: &ValidationRequest,
    epoch: usize,
) -> anyhow::Result<Vec<ValidationImage>> {
    tracing::info!(
        epoch,
        prompt = %request.prompt,
        num_images = request.num_images,
        steps = request.num_inference_steps,
        "Running validation"
    );
    let frozen = embedding.valid();
    let images = renderer.render(request, &frozen)?;
    tracker.log_validation(epoch, &request.prompt, &images);
    Ok(images)
}

/// Whether validation runs at the end of `epoch`.
pub fn is_validation_epoch(prompt: Option<&str>, epoch: usize, validation_epochs: usize) -> bool {
    prompt.is_some() && validation_epochs > 0 && epoch % validation_epochs == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::RecordingRenderer;
    use crate::model::bridge::tensor_to_vec;
    use crate::training::metrics::MemoryTracker;
    use burn::backend::ndarray::NdArray;
    use burn::backend::Autodiff;

    type TestAutodiffBackend = Autodiff<NdArray<f32>>;

    fn request() -> ValidationRequest {
        ValidationRequest {
            prompt: "cat <R> dog".into(),
            num_images: 2,
            num_inference_steps: 25,
            scheduler: InferenceScheduler::default(),
            seed: Some(0),
        }
    }

    #[test]
    fn test_validation_epoch_cadence() {
        assert!(is_validation_epoch(Some("p"), 0, 50));
        assert!(!is_validation_epoch(Some("p"), 49, 50));
        assert!(is_validation_epoch(Some("p"), 100, 50));
        assert!(!is_validation_epoch(None, 0, 50));
    }

    #[test]
    fn test_run_validation_logs_and_leaves_table_untouched() {
        let device = Default::default();
        let emb = TokenEmbedding::<TestAutodiffBackend>::random(4, 3, &device);
        let before = tensor_to_vec(emb.row(3)).unwrap();

        let mut renderer = RecordingRenderer::new(2, 2);
        let tracker = MemoryTracker::new();
        let mut handle = tracker.clone();
        let images = run_validation(&emb, &mut renderer, &mut handle, &request(), 0).unwrap();

        assert_eq!(images.len(), 2);
        assert_eq!(renderer.requests().len(), 1);
        assert_eq!(renderer.requests()[0].scheduler, InferenceScheduler::DpmSolverMultistep);
        assert_eq!(tracker.history().validations.len(), 1);
        assert_eq!(tensor_to_vec(emb.row(3)).unwrap(), before);
    }
}
