// src/schedule.rs
//
// =============================================================================
// NNPAL: LEARNING-RATE SCHEDULE
// =============================================================================
//
// Exponential decay schedule for the NNP trainer:
//   lr(step) = start_lr * decay_rate ^ (step / decay_steps)
//
// `decay_steps` is sized from the training-set size so that large datasets
// decay more slowly.

use crate::errors::{PipelineError, PipelineResult};

pub const DEFAULT_MIN_DECAY_STEPS: u64 = 5000;

/// Decay steps for a training set of `n_structures`.
///
/// The count is floored to the nearest 10 000 first, then bucketed:
/// below 20 000 uses `min_steps`, below 100 000 uses a quarter of the
/// count, above that grows by `min_steps` every 50 000 structures.
pub fn decay_steps(n_structures: i64, min_steps: u64) -> PipelineResult<u64> {
    if n_structures <= 0 {
        return Err(PipelineError::InvalidArgument(format!(
            "number of structures must be positive, got {}",
            n_structures
        )));
    }
    let rounded = (n_structures / 10_000 * 10_000) as u64;

    let steps = if rounded < 20_000 {
        min_steps
    } else if rounded < 100_000 {
        rounded / 4
    } else {
        20_000 + (rounded - 50_000) / 50_000 * min_steps
    };
    Ok(steps)
}

/// Per-`decay_steps` multiplier that brings `start_lr` to `stop_lr` after
/// `stop_batch` steps.
pub fn decay_rate(stop_batch: u64, start_lr: f64, stop_lr: f64, decay_steps: u64) -> PipelineResult<f64> {
    if start_lr <= 0.0 || stop_lr <= 0.0 {
        return Err(PipelineError::InvalidArgument(format!(
            "learning rates must be positive (start_lr={}, stop_lr={})",
            start_lr, stop_lr
        )));
    }
    if stop_batch == 0 || decay_steps == 0 {
        return Err(PipelineError::InvalidArgument(format!(
            "stop_batch and decay_steps must be positive (stop_batch={}, decay_steps={})",
            stop_batch, decay_steps
        )));
    }
    let periods = stop_batch as f64 / decay_steps as f64;
    Ok(((stop_lr / start_lr).ln() / periods).exp())
}

/// Learning rate reached at `step`.
pub fn learning_rate(step: u64, start_lr: f64, decay_rate: f64, decay_steps: u64) -> PipelineResult<f64> {
    if start_lr <= 0.0 || decay_rate <= 0.0 || decay_steps == 0 {
        return Err(PipelineError::InvalidArgument(format!(
            "start_lr, decay_rate and decay_steps must be positive (got {}, {}, {})",
            start_lr, decay_rate, decay_steps
        )));
    }
    Ok(start_lr * decay_rate.powf(step as f64 / decay_steps as f64))
}

/// Fully resolved schedule written into a training input.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LearningSchedule {
    pub start_lr: f64,
    pub stop_lr: f64,
    pub decay_steps: u64,
    pub decay_rate: f64,
    pub numb_steps: u64,
    /// Learning rate the trainer actually ends on.
    pub final_lr: f64,
}

impl LearningSchedule {
    /// Builds a schedule for `n_structures`, or with a fixed `decay_steps`
    /// when one is given.
    pub fn resolve(
        n_structures: i64,
        numb_steps: u64,
        start_lr: f64,
        stop_lr: f64,
        fixed_decay_steps: Option<u64>,
        min_decay_steps: u64,
    ) -> PipelineResult<Self> {
        let steps = match fixed_decay_steps {
            Some(s) => s,
            None => decay_steps(n_structures, min_decay_steps)?,
        };
        let rate = decay_rate(numb_steps, start_lr, stop_lr, steps)?;
        let final_lr = learning_rate(numb_steps, start_lr, rate, steps)?;
        Ok(Self {
            start_lr,
            stop_lr,
            decay_steps: steps,
            decay_rate: rate,
            numb_steps,
            final_lr,
        })
    }
}
