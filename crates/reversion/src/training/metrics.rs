//! Per-step training logs and the trackers that receive them.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::validation::ValidationImage;

/// Scalar values logged after every micro-step.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StepLogs {
    /// Optimizer steps completed so far.
    pub global_step: usize,
    pub epoch: usize,
    pub lr: f64,
    /// Composed generator-side loss.
    pub loss: f64,
    /// Unweighted denoising MSE; logged even when its weight is zero.
    pub denoise_loss: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gan_loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steer_loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub d_loss: Option<f64>,
}

impl StepLogs {
    /// Compact `key=value` summary for progress bars.
    pub fn display(&self) -> String {
        let mut s = format!(
            "loss={:.4} denoise={:.4} lr={:.2e}",
            self.loss, self.denoise_loss, self.lr
        );
        if let Some(g) = self.gan_loss {
            s.push_str(&format!(" gan={g:.4}"));
        }
        if let Some(st) = self.steer_loss {
            s.push_str(&format!(" steer={st:.4}"));
        }
        if let Some(d) = self.d_loss {
            s.push_str(&format!(" d={d:.4}"));
        }
        s
    }
}

/// Fixed-window moving average.
#[derive(Debug, Clone)]
pub struct MovingAverage {
    window: usize,
    values: VecDeque<f64>,
    sum: f64,
}

impl MovingAverage {
    pub fn new(window: usize) -> Self {
        assert!(window > 0, "moving average window must be > 0");
        Self {
            window,
            values: VecDeque::with_capacity(window),
            sum: 0.0,
        }
    }

    pub fn push(&mut self, value: f64) {
        self.values.push_back(value);
        self.sum += value;
        if self.values.len() > self.window {
            if let Some(old) = self.values.pop_front() {
                self.sum -= old;
            }
        }
    }

    pub fn is_full(&self) -> bool {
        self.values.len() == self.window
    }

    pub fn count(&self) -> usize {
        self.values.len()
    }

    pub fn mean(&self) -> Option<f64> {
        if self.values.is_empty() {
            None
        } else {
            Some(self.sum / self.values.len() as f64)
        }
    }
}

/// Moving averages of `values` over `window`, one per full window.
pub fn moving_averages(values: &[f64], window: usize) -> Vec<f64> {
    let mut avg = MovingAverage::new(window);
    let mut out = Vec::new();
    for &v in values {
        avg.push(v);
        if avg.is_full() {
            out.extend(avg.mean());
        }
    }
    out
}

/// Sink for step logs and validation images.
pub trait Tracker {
    fn log_step(&mut self, logs: &StepLogs);

    fn log_validation(&mut self, epoch: usize, prompt: &str, images: &[ValidationImage]);
}

/// Emits every record through `tracing`.
#[derive(Debug, Default)]
pub struct TracingTracker;

impl Tracker for TracingTracker {
    fn log_step(&mut self, logs: &StepLogs) {
        tracing::info!(
            step = logs.global_step,
            epoch = logs.epoch,
            lr = %format!("{:.2e}", logs.lr),
            loss = logs.loss,
            denoise_loss = logs.denoise_loss,
            gan_loss = logs.gan_loss,
            steer_loss = logs.steer_loss,
            d_loss = logs.d_loss,
            "train step"
        );
    }

    fn log_validation(&mut self, epoch: usize, prompt: &str, images: &[ValidationImage]) {
        tracing::info!(epoch, prompt, images = images.len(), "Validation images rendered");
    }
}

/// Everything a run logged, kept in memory.
#[derive(Debug, Default, Clone)]
pub struct RunHistory {
    pub steps: Vec<StepLogs>,
    /// `(epoch, prompt, image count)` per validation pass.
    pub validations: Vec<(usize, String, usize)>,
}

/// Records into a shared [`RunHistory`]; clones share the same history.
#[derive(Debug, Default, Clone)]
pub struct MemoryTracker {
    history: Arc<Mutex<RunHistory>>,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history(&self) -> RunHistory {
        self.history
            .lock()
            .map(|h| h.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

impl Tracker for MemoryTracker {
    fn log_step(&mut self, logs: &StepLogs) {
        if let Ok(mut h) = self.history.lock() {
            h.steps.push(logs.clone());
        }
    }

    fn log_validation(&mut self, epoch: usize, prompt: &str, images: &[ValidationImage]) {
        if let Ok(mut h) = self.history.lock() {
            h.validations.push((epoch, prompt.to_string(), images.len()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logs(step: usize, loss: f64) -> StepLogs {
        StepLogs {
            global_step: step,
            epoch: 0,
            lr: 1e-3,
            loss,
            denoise_loss: loss,
            gan_loss: Some(0.7),
            steer_loss: None,
            d_loss: Some(0.69),
        }
    }

    #[test]
    fn test_moving_average_window() {
        let mut avg = MovingAverage::new(3);
        assert!(avg.mean().is_none());
        for v in [1.0, 2.0, 3.0, 4.0] {
            avg.push(v);
        }
        assert!(avg.is_full());
        assert_eq!(avg.count(), 3);
        assert!((avg.mean().unwrap() - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_moving_averages_series() {
        let series = moving_averages(&[4.0, 2.0, 0.0, 2.0], 2);
        assert_eq!(series, vec![3.0, 1.0, 1.0]);
    }

    #[test]
    fn test_step_logs_serialization_skips_absent_terms() {
        let json = serde_json::to_string(&logs(3, 0.5)).unwrap();
        assert!(json.contains("\"gan_loss\":0.7"));
        assert!(!json.contains("steer_loss"));
        let back: StepLogs = serde_json::from_str(&json).unwrap();
        assert_eq!(back, logs(3, 0.5));
    }

    #[test]
    fn test_display() {
        let s = logs(1, 0.25).display();
        assert!(s.contains("loss=0.2500"));
        assert!(s.contains("gan=0.7000"));
        assert!(!s.contains("steer="));
    }

    #[test]
    fn test_memory_tracker_shares_history() {
        let tracker = MemoryTracker::new();
        let mut handle = tracker.clone();
        handle.log_step(&logs(1, 0.5));
        handle.log_step(&logs(2, 0.4));
        handle.log_validation(0, "cat <R> dog", &[]);
        let history = tracker.history();
        assert_eq!(history.steps.len(), 2);
        assert_eq!(history.validations, vec![(0, "cat <R> dog".to_string(), 0)]);
    }
}
