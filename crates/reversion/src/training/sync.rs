//! Data-parallel coordination seam.
//!
//! Multi-process execution is provided by the launcher. The training loop
//! only needs gradient averaging at synchronization boundaries, the
//! main-process flag and a barrier.

use burn::optim::GradientsParams;

pub trait ProcessGroup {
    /// Rank 0: the only process that writes files and renders validation.
    fn is_main_process(&self) -> bool;

    fn num_processes(&self) -> usize;

    /// Block until every process reaches this point.
    fn wait_for_everyone(&self) -> anyhow::Result<()>;

    /// Average accumulated gradients across processes. Called once per
    /// optimizer step, on the last micro-step of the accumulation window.
    fn all_reduce_mean(&self, grads: GradientsParams) -> anyhow::Result<GradientsParams>;
}

/// Single-process training: every collective is the identity.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProcess;

impl ProcessGroup for SingleProcess {
    fn is_main_process(&self) -> bool {
        true
    }

    fn num_processes(&self) -> usize {
        1
    }

    fn wait_for_everyone(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn all_reduce_mean(&self, grads: GradientsParams) -> anyhow::Result<GradientsParams> {
        Ok(grads)
    }
}
