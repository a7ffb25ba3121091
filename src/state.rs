// src/state.rs
//
// =============================================================================
// NNPAL: ITERATION STATE STORE
// =============================================================================
//
// The Persistence Layer.
//
// Architecture:
// - One JSON document per concern under `control/`:
//   `config.json` plus `<phase>_<NNN>.json` for every phase and iteration.
// - Whole-document writes only. Callers load, modify and save.
// - Writes go to a sibling temp file, are fsynced, then renamed over the
//   target so a reader never sees a half-written document. The directory is
//   synced afterwards for shared filesystems (Lustre/GPFS).
// - No locking: one operator runs one phase at a time.

use crate::core::{IterationConfig, Layout};
use crate::errors::PipelineError;
use crate::gates::{prerequisite, Gate, PhaseKind, PhaseState};
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

// -----------------------------------------------------------------------------
// Raw document I/O
// -----------------------------------------------------------------------------

/// Whether a missing document is an error or an empty default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Required,
    Optional,
}

/// Reads a JSON document. A missing file yields `T::default()` when
/// `presence` is `Optional`.
pub fn load_json<T>(path: &Path, presence: Presence) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    if !path.exists() {
        return match presence {
            Presence::Required => Err(PipelineError::NotFound(path.to_path_buf()).into()),
            Presence::Optional => Ok(T::default()),
        };
    }
    let text = fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    let doc = serde_json::from_str(&text)
        .map_err(|e| PipelineError::parse(path, e.to_string()))?;
    Ok(doc)
}

/// Replaces the document at `path` atomically.
pub fn save_json<T: Serialize>(path: &Path, doc: &T) -> Result<()> {
    let dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&dir).with_context(|| format!("Failed to create {:?}", dir))?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| PipelineError::InvalidArgument(format!("bad state path {:?}", path)))?;
    let tmp_path = dir.join(format!(".{}.tmp", file_name));

    {
        let mut tmp = File::create(&tmp_path)
            .with_context(|| format!("Failed to create temp file {:?}", tmp_path))?;
        let body = serde_json::to_vec_pretty(doc)?;
        tmp.write_all(&body)?;
        tmp.write_all(b"\n")?;
        tmp.sync_all()?;
    }

    fs::rename(&tmp_path, path)
        .with_context(|| format!("Failed to move {:?} into place", path))?;

    if let Ok(d) = File::open(&dir) {
        let _ = d.sync_all();
    }
    Ok(())
}

// -----------------------------------------------------------------------------
// StateStore
// -----------------------------------------------------------------------------

pub struct StateStore {
    layout: Layout,
}

impl StateStore {
    pub fn new(layout: Layout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn config_exists(&self) -> bool {
        self.layout.config_file().exists()
    }

    pub fn load_config(&self) -> Result<IterationConfig> {
        let path = self.layout.config_file();
        if !path.exists() {
            return Err(PipelineError::NotFound(path))
                .context("No config.json: run `initialization start` first");
        }
        let text = fs::read_to_string(&path)?;
        let cfg: IterationConfig =
            serde_json::from_str(&text).map_err(|e| PipelineError::parse(&path, e.to_string()))?;
        Ok(cfg)
    }

    pub fn save_config(&self, cfg: &IterationConfig) -> Result<()> {
        save_json(&self.layout.config_file(), cfg)
    }

    pub fn phase_path(&self, phase: PhaseKind, iteration: u32) -> PathBuf {
        self.layout.control_dir().join(phase.state_file(iteration))
    }

    /// Loads a phase document. With `Optional`, a missing file yields a fresh
    /// state with every gate closed.
    pub fn load_phase<M>(&self, phase: PhaseKind, iteration: u32, presence: Presence) -> Result<PhaseState<M>>
    where
        M: DeserializeOwned + Default,
    {
        let path = self.phase_path(phase, iteration);
        if !path.exists() {
            return match presence {
                Presence::Required => Err(PipelineError::NotFound(path.clone())).with_context(|| {
                    format!(
                        "{} {} has not been prepared",
                        phase,
                        crate::core::padded(iteration)
                    )
                }),
                Presence::Optional => Ok(PhaseState::new(phase, iteration)),
            };
        }
        let text = fs::read_to_string(&path)?;
        let state: PhaseState<M> =
            serde_json::from_str(&text).map_err(|e| PipelineError::parse(&path, e.to_string()))?;
        if state.phase != phase || state.iteration != iteration {
            return Err(PipelineError::parse(
                &path,
                format!(
                    "document describes {} {} instead of {} {}",
                    state.phase, state.iteration, phase, iteration
                ),
            )
            .into());
        }
        Ok(state)
    }

    pub fn save_phase<M: Serialize>(&self, state: &PhaseState<M>) -> Result<()> {
        save_json(&self.phase_path(state.phase, state.iteration), state)
    }

    /// Reads just the gate flags of a phase, ignoring its metrics.
    pub fn gate_is_open(&self, phase: PhaseKind, iteration: u32, gate: Gate) -> Result<bool> {
        let path = self.phase_path(phase, iteration);
        if !path.exists() {
            return Ok(false);
        }
        let state: PhaseState<serde_json::Value> =
            self.load_phase(phase, iteration, Presence::Required)?;
        Ok(state.is_open(gate))
    }

    /// Verifies the cross-phase prerequisite of locking `phase`.
    pub fn check_prerequisite(&self, phase: PhaseKind, iteration: u32) -> Result<()> {
        if let Some(req) = prerequisite(phase, iteration) {
            if !self.gate_is_open(req.phase, req.iteration, req.gate)? {
                return Err(PipelineError::Precondition(format!(
                    "{} {} needs {} {} `{}`: lock found, run prior phase first",
                    phase,
                    crate::core::padded(iteration),
                    req.phase,
                    crate::core::padded(req.iteration),
                    req.gate
                ))
                .into());
            }
        }
        Ok(())
    }
}
