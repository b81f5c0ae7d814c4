//! Learning-rate schedules over optimizer steps.

/// Shape of the embedding learning rate over the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LrScheduler {
    #[default]
    Constant,
    ConstantWithWarmup,
    Linear,
    Cosine,
}

/// Learning rate at optimizer step `step` (0-based).
///
/// - Warmup (`step < warmup_steps`, all but `Constant`): linear ramp from 0.
/// - `Linear`: decays linearly to 0 at `total_steps`.
/// - `Cosine`: half-cosine from `base_lr` to 0 at `total_steps`.
pub fn lr_at(
    schedule: LrScheduler,
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    step: usize,
) -> f64 {
    if schedule == LrScheduler::Constant {
        return base_lr;
    }
    if warmup_steps > 0 && step < warmup_steps {
        return base_lr * step as f64 / warmup_steps as f64;
    }
    let decay_steps = total_steps.saturating_sub(warmup_steps).max(1);
    let progress = (step.saturating_sub(warmup_steps) as f64 / decay_steps as f64).min(1.0);
    match schedule {
        LrScheduler::Constant | LrScheduler::ConstantWithWarmup => base_lr,
        LrScheduler::Linear => base_lr * (1.0 - progress),
        LrScheduler::Cosine => base_lr * 0.5 * (1.0 + (std::f64::consts::PI * progress).cos()),
    }
}

/// Base lr scaled by the effective number of examples per optimizer step.
pub fn scale_lr(
    base_lr: f64,
    gradient_accumulation_steps: usize,
    train_batch_size: usize,
    num_processes: usize,
) -> f64 {
    base_lr * (gradient_accumulation_steps * train_batch_size * num_processes) as f64
}
