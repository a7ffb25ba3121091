// src/gates.rs
//
// =============================================================================
// NNPAL: PHASE GATE CONTROLLER
// =============================================================================
//
// Every phase of an iteration owns an ordered list of gates. A gate may be
// opened only when the gate before it is open and it is itself still closed,
// so phases run in order and never twice.
//
// The first gate of each phase additionally depends on a gate of another
// phase (e.g. labeling N needs exploration N extracted). Both rules live in
// one table here instead of being re-checked inside every phase runner.

use crate::errors::{PipelineError, PipelineResult};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// 1. PHASES & GATES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    Exploration,
    Labeling,
    Training,
    Test,
}

impl PhaseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseKind::Exploration => "exploration",
            PhaseKind::Labeling => "labeling",
            PhaseKind::Training => "training",
            PhaseKind::Test => "test",
        }
    }

    /// State file name, e.g. `exploration_003.json`.
    pub fn state_file(&self, iteration: u32) -> String {
        format!("{}_{}.json", self.as_str(), crate::core::padded(iteration))
    }

    /// The ordered gate sequence of this phase.
    pub fn gates(&self) -> &'static [Gate] {
        use Gate::*;
        match self {
            PhaseKind::Exploration => &[Locked, Launched, Checked, Deviated, Extracted],
            PhaseKind::Labeling => &[Locked, Launched, Checked, Extracted],
            PhaseKind::Training => &[
                Locked,
                Launched,
                Checked,
                FreezeLaunched,
                Frozen,
                CompressLaunched,
                Compressed,
                Incremented,
            ],
            PhaseKind::Test => &[Locked, Launched, Checked],
        }
    }

    pub fn terminal_gate(&self) -> Gate {
        let gates = self.gates();
        gates[gates.len() - 1]
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Gate {
    #[serde(rename = "is_locked")]
    Locked,
    #[serde(rename = "is_launched")]
    Launched,
    #[serde(rename = "is_checked")]
    Checked,
    #[serde(rename = "is_deviated")]
    Deviated,
    #[serde(rename = "is_extracted")]
    Extracted,
    #[serde(rename = "is_freeze_launched")]
    FreezeLaunched,
    #[serde(rename = "is_frozen")]
    Frozen,
    #[serde(rename = "is_compress_launched")]
    CompressLaunched,
    #[serde(rename = "is_compressed")]
    Compressed,
    #[serde(rename = "is_incremented")]
    Incremented,
}

impl Gate {
    pub fn flag_name(&self) -> &'static str {
        match self {
            Gate::Locked => "is_locked",
            Gate::Launched => "is_launched",
            Gate::Checked => "is_checked",
            Gate::Deviated => "is_deviated",
            Gate::Extracted => "is_extracted",
            Gate::FreezeLaunched => "is_freeze_launched",
            Gate::Frozen => "is_frozen",
            Gate::CompressLaunched => "is_compress_launched",
            Gate::Compressed => "is_compressed",
            Gate::Incremented => "is_incremented",
        }
    }

    /// Past-tense verb for "already ..." messages.
    fn verb(&self) -> &'static str {
        &self.flag_name()[3..]
    }
}

impl fmt::Display for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.flag_name())
    }
}

// ============================================================================
// 2. CROSS-PHASE PREREQUISITES
// ============================================================================

/// A gate of another phase (possibly another iteration) that must be open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Requirement {
    pub phase: PhaseKind,
    pub iteration: u32,
    pub gate: Gate,
}

/// What must hold before `phase` can be locked at `iteration`.
pub fn prerequisite(phase: PhaseKind, iteration: u32) -> Option<Requirement> {
    match phase {
        PhaseKind::Exploration if iteration > 0 => Some(Requirement {
            phase: PhaseKind::Training,
            iteration: iteration - 1,
            gate: Gate::Incremented,
        }),
        PhaseKind::Exploration => None,
        PhaseKind::Labeling => Some(Requirement {
            phase: PhaseKind::Exploration,
            iteration,
            gate: Gate::Extracted,
        }),
        PhaseKind::Training if iteration > 0 => Some(Requirement {
            phase: PhaseKind::Labeling,
            iteration,
            gate: Gate::Extracted,
        }),
        PhaseKind::Training => None,
        PhaseKind::Test => Some(Requirement {
            phase: PhaseKind::Training,
            iteration,
            gate: Gate::Incremented,
        }),
    }
}

// ============================================================================
// 3. PHASE STATE
// ============================================================================

/// `control/<phase>_<NNN>.json`: gate flags plus typed metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(
    serialize = "M: Serialize",
    deserialize = "M: DeserializeOwned + Default"
))]
pub struct PhaseState<M> {
    pub phase: PhaseKind,
    pub iteration: u32,
    #[serde(default)]
    pub gates: BTreeMap<Gate, bool>,
    #[serde(default)]
    pub metrics: M,
    #[serde(default)]
    pub host: String,
    pub updated_at: DateTime<Utc>,
}

impl<M: Default> PhaseState<M> {
    /// Fresh state with every gate of the phase closed.
    pub fn new(phase: PhaseKind, iteration: u32) -> Self {
        Self {
            phase,
            iteration,
            gates: phase.gates().iter().map(|g| (*g, false)).collect(),
            metrics: M::default(),
            host: current_host(),
            updated_at: Utc::now(),
        }
    }
}

impl<M> PhaseState<M> {
    pub fn is_open(&self, gate: Gate) -> bool {
        self.gates.get(&gate).copied().unwrap_or(false)
    }

    /// Checks that `gate` may be opened now without changing anything.
    pub fn check(&self, gate: Gate) -> PipelineResult<()> {
        let sequence = self.phase.gates();
        let pos = sequence.iter().position(|g| *g == gate).ok_or_else(|| {
            PipelineError::Precondition(format!(
                "{} has no gate `{}`",
                self.phase,
                gate.flag_name()
            ))
        })?;

        if pos > 0 {
            let prior = sequence[pos - 1];
            if !self.is_open(prior) {
                return Err(PipelineError::Precondition(format!(
                    "{} {}: lock found, run prior phase first (`{}` is false)",
                    self.phase,
                    crate::core::padded(self.iteration),
                    prior.flag_name()
                )));
            }
        }
        if self.is_open(gate) {
            return Err(PipelineError::Precondition(format!(
                "{} {}: already {}",
                self.phase,
                crate::core::padded(self.iteration),
                gate.verb()
            )));
        }
        Ok(())
    }

    /// Opens `gate` after validating the transition.
    pub fn open(&mut self, gate: Gate) -> PipelineResult<()> {
        self.check(gate)?;
        self.gates.insert(gate, true);
        self.host = current_host();
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Fails unless `gate` is already open.
    pub fn require(&self, gate: Gate) -> PipelineResult<()> {
        if self.is_open(gate) {
            Ok(())
        } else {
            Err(PipelineError::Precondition(format!(
                "{} {}: `{}` is false, run the matching phase first",
                self.phase,
                crate::core::padded(self.iteration),
                gate.flag_name()
            )))
        }
    }

    /// Gates open so far, for logging.
    pub fn progress(&self) -> Vec<&'static str> {
        self.phase
            .gates()
            .iter()
            .filter(|g| self.is_open(**g))
            .map(|g| g.flag_name())
            .collect()
    }
}

fn current_host() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "localhost".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_launch_needs_lock() {
        let mut st: PhaseState<Value> = PhaseState::new(PhaseKind::Exploration, 1);
        let err = st.open(Gate::Launched).unwrap_err();
        assert!(matches!(err, PipelineError::Precondition(_)));
        assert!(err.to_string().contains("lock found"));
    }

    #[test]
    fn test_no_re_entry() {
        let mut st: PhaseState<Value> = PhaseState::new(PhaseKind::Exploration, 1);
        st.open(Gate::Locked).unwrap();
        st.open(Gate::Launched).unwrap();
        let err = st.open(Gate::Launched).unwrap_err();
        assert!(matches!(err, PipelineError::Precondition(_)));
        assert!(err.to_string().contains("already launched"));
    }

    #[test]
    fn test_full_sequence_in_order() {
        let mut st: PhaseState<Value> = PhaseState::new(PhaseKind::Training, 0);
        for gate in PhaseKind::Training.gates() {
            st.open(*gate).unwrap();
        }
        assert!(st.is_open(PhaseKind::Training.terminal_gate()));
        assert_eq!(st.progress().len(), PhaseKind::Training.gates().len());
    }

    #[test]
    fn test_foreign_gate_rejected() {
        let mut st: PhaseState<Value> = PhaseState::new(PhaseKind::Test, 2);
        assert!(st.open(Gate::Frozen).is_err());
    }

    #[test]
    fn test_flags_serialize_by_name() {
        let mut st: PhaseState<Value> = PhaseState::new(PhaseKind::Labeling, 4);
        st.open(Gate::Locked).unwrap();
        let json = serde_json::to_value(&st).unwrap();
        assert_eq!(json["gates"]["is_locked"], Value::Bool(true));
        assert_eq!(json["gates"]["is_launched"], Value::Bool(false));
        assert_eq!(json["phase"], "labeling");
    }

    #[test]
    fn test_prerequisites() {
        assert_eq!(prerequisite(PhaseKind::Training, 0), None);
        assert_eq!(
            prerequisite(PhaseKind::Exploration, 3),
            Some(Requirement {
                phase: PhaseKind::Training,
                iteration: 2,
                gate: Gate::Incremented
            })
        );
        assert_eq!(prerequisite(PhaseKind::Labeling, 3).unwrap().gate, Gate::Extracted);
    }
}
