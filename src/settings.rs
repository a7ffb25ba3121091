// src/settings.rs
//
// =============================================================================
// NNPAL: USER INPUT & RESOLVED SETTINGS
// =============================================================================
//
// `input.json` (passed with `-i`) carries optional knobs for the phase being
// run. Every field is optional; absent fields take the defaults documented
// below. Resolution happens once, at entry, into plain settings structs.

use crate::core::SubsystemParams;
use crate::errors::PipelineError;
use crate::physics::DEFAULT_MIN_DISTANCE;
use crate::schedule::DEFAULT_MIN_DECAY_STEPS;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

// ============================================================================
// 1. RAW INPUT
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UserInput {
    // --- initialization ---
    pub system: Option<String>,
    pub subsystems: Option<Vec<SubsystemParams>>,
    pub nnp_count: Option<u32>,
    pub type_map: Option<Vec<String>>,
    /// Expected structure count per initial dataset; discovered from
    /// `data/init_*` when absent.
    pub datasets_initial: Option<BTreeMap<String, u64>>,

    // --- training ---
    /// Default 1e-3.
    pub start_lr: Option<f64>,
    /// Default 1e-6.
    pub stop_lr: Option<f64>,
    /// Default 400 000.
    pub numb_steps: Option<u64>,
    /// Overrides the size-based decay steps.
    pub decay_steps_fixed: Option<u64>,
    /// Default 5000.
    pub min_decay_steps: Option<u64>,

    // --- exploration ---
    /// Per-subsystem step count for this iteration, bypassing scaling.
    pub nb_steps: Option<BTreeMap<String, u64>>,
    /// Default 0.5 Å.
    pub min_distance: Option<f64>,

    // --- jobs ---
    /// Walltime per job kind (e.g. `"deepmd_train": "20:00:00"`).
    pub walltime: Option<BTreeMap<String, String>>,
}

impl UserInput {
    /// Reads `path`. A missing file is an empty input; a malformed one is an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("No input file at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
        let input = serde_json::from_str(&text).map_err(|e| PipelineError::parse(path, e.to_string()))?;
        Ok(input)
    }

    pub fn training(&self) -> TrainingSettings {
        TrainingSettings {
            start_lr: self.start_lr.unwrap_or(1e-3),
            stop_lr: self.stop_lr.unwrap_or(1e-6),
            numb_steps: self.numb_steps.unwrap_or(400_000),
            decay_steps_fixed: self.decay_steps_fixed,
            min_decay_steps: self.min_decay_steps.unwrap_or(DEFAULT_MIN_DECAY_STEPS),
        }
    }

    pub fn exploration(&self) -> ExplorationSettings {
        ExplorationSettings {
            nb_steps_override: self.nb_steps.clone().unwrap_or_default(),
            min_distance: self.min_distance.unwrap_or(DEFAULT_MIN_DISTANCE),
        }
    }

    pub fn walltime(&self, kind: &str) -> String {
        self.walltime
            .as_ref()
            .and_then(|w| w.get(kind).cloned())
            .unwrap_or_else(|| DEFAULT_WALLTIME.to_string())
    }
}

pub const DEFAULT_WALLTIME: &str = "04:00:00";

// ============================================================================
// 2. RESOLVED SETTINGS
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSettings {
    pub start_lr: f64,
    pub stop_lr: f64,
    pub numb_steps: u64,
    pub decay_steps_fixed: Option<u64>,
    pub min_decay_steps: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExplorationSettings {
    pub nb_steps_override: BTreeMap<String, u64>,
    pub min_distance: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let input = UserInput::default();
        let t = input.training();
        assert_eq!(t.start_lr, 1e-3);
        assert_eq!(t.numb_steps, 400_000);
        assert_eq!(t.decay_steps_fixed, None);
        assert_eq!(input.exploration().min_distance, DEFAULT_MIN_DISTANCE);
        assert_eq!(input.walltime("deepmd_train"), DEFAULT_WALLTIME);
    }

    #[test]
    fn test_partial_input() {
        let input: UserInput = serde_json::from_str(
            r#"{"numb_steps": 1000, "walltime": {"cp2k_label": "01:00:00"}}"#,
        )
        .unwrap();
        assert_eq!(input.training().numb_steps, 1000);
        assert_eq!(input.walltime("cp2k_label"), "01:00:00");
        assert_eq!(input.walltime("deepmd_test"), DEFAULT_WALLTIME);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let input = UserInput::load(Path::new("/nonexistent/input.json")).unwrap();
        assert!(input.system.is_none());
    }
}
