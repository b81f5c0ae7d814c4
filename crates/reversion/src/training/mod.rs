//! Training pipeline: timestep sampling, losses, the adversarial subsystem,
//! the update guard, checkpoints and the optimizer loop.

pub mod adversarial;
pub mod checkpoint;
pub mod composer;
pub mod data;
pub mod guard;
pub mod loss;
pub mod metrics;
pub mod schedule;
pub mod sync;
pub mod timesteps;
pub mod trainer;
