// src/core.rs
//
// =============================================================================
// NNPAL: CORE SCHEMA AUTHORITY
// =============================================================================
//
// The data contracts shared by every phase:
// 1. IterationConfig: the global `control/config.json` document.
// 2. SubsystemParams: per-subsystem exploration/labeling settings.
// 3. DatasetRegistry: dataset name -> expected structure count.
// 4. Workspace layout helpers (padded iteration names, directory names).

use crate::errors::{PipelineError, PipelineResult};
use crate::selection::Thresholds;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ============================================================================
// 1. UNITS
// ============================================================================

/// Hartree to electron volts.
pub const HARTREE_TO_EV: f64 = 27.211_386_245_988;

/// Hartree/Bohr to eV/Å.
pub const HARTREE_BOHR_TO_EV_ANGSTROM: f64 = 51.422_086_190_832_3;

// ============================================================================
// 2. SUBSYSTEM PARAMETERS
// ============================================================================

/// Simulation settings of one subsystem (one chemical composition / phase
/// point explored by the ensemble).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubsystemParams {
    pub name: String,

    #[serde(default = "default_temperature")]
    pub temperature_k: f64,

    /// MD timestep in ps.
    #[serde(default = "default_timestep")]
    pub timestep_ps: f64,

    /// Steps of the first exploration iteration.
    #[serde(default = "default_nb_steps")]
    pub nb_steps_initial: u64,

    /// Upper bound after step scaling.
    #[serde(default = "default_max_nb_steps")]
    pub max_nb_steps: u64,

    /// Steps between two trajectory frames (and deviation rows).
    #[serde(default = "default_print_every")]
    pub print_every: u64,

    #[serde(default = "default_s_low")]
    pub s_low: f64,
    #[serde(default = "default_s_high")]
    pub s_high: f64,
    #[serde(default = "default_s_high_max")]
    pub s_high_max: f64,
    #[serde(default = "default_nb_candidates_max")]
    pub nb_candidates_max: usize,

    /// Equilibration frames ignored by the selector.
    #[serde(default)]
    pub ignore_first_frames: usize,

    /// Trajectories per NNP.
    #[serde(default = "default_traj_count")]
    pub traj_count: u32,

    /// Orthorhombic cell lengths in Å used for labeling inputs and datasets.
    #[serde(default)]
    pub cell: Option<[f64; 3]>,
}

fn default_temperature() -> f64 {
    300.0
}
fn default_timestep() -> f64 {
    0.0005
}
fn default_nb_steps() -> u64 {
    20_000
}
fn default_max_nb_steps() -> u64 {
    400_000
}
fn default_print_every() -> u64 {
    50
}
fn default_s_low() -> f64 {
    0.1
}
fn default_s_high() -> f64 {
    0.8
}
fn default_s_high_max() -> f64 {
    1.0
}
fn default_nb_candidates_max() -> usize {
    500
}
fn default_traj_count() -> u32 {
    2
}

impl SubsystemParams {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            temperature_k: default_temperature(),
            timestep_ps: default_timestep(),
            nb_steps_initial: default_nb_steps(),
            max_nb_steps: default_max_nb_steps(),
            print_every: default_print_every(),
            s_low: default_s_low(),
            s_high: default_s_high(),
            s_high_max: default_s_high_max(),
            nb_candidates_max: default_nb_candidates_max(),
            ignore_first_frames: 0,
            traj_count: default_traj_count(),
            cell: None,
        }
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            s_low: self.s_low,
            s_high: self.s_high,
            s_high_max: self.s_high_max,
            nb_candidates_max: self.nb_candidates_max,
        }
    }
}

// ============================================================================
// 3. DATASET REGISTRY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetEntry {
    pub name: String,
    pub nb_structures: u64,
    /// Iteration that produced it; `None` for initial datasets.
    #[serde(default)]
    pub iteration: Option<u32>,
}

/// Ordered registry of every dataset the ensemble trains on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetRegistry {
    pub entries: Vec<DatasetEntry>,
}

impl DatasetRegistry {
    pub fn get(&self, name: &str) -> Option<&DatasetEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Appends a dataset. Re-registering a name replaces its count, so a
    /// re-run extraction does not duplicate entries.
    pub fn register(&mut self, entry: DatasetEntry) {
        match self.entries.iter_mut().find(|e| e.name == entry.name) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    pub fn total_structures(&self) -> u64 {
        self.entries.iter().map(|e| e.nb_structures).sum()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }
}

// ============================================================================
// 4. ITERATION CONFIG
// ============================================================================

/// `control/config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationConfig {
    pub system: String,
    pub subsystems: Vec<SubsystemParams>,

    #[serde(default = "default_nnp_count")]
    pub nnp_count: u32,

    #[serde(default)]
    pub current_iteration: u32,

    /// Element order shared by every dataset (`type_map.raw`).
    pub type_map: Vec<String>,

    #[serde(default)]
    pub datasets: DatasetRegistry,
}

fn default_nnp_count() -> u32 {
    3
}

impl IterationConfig {
    pub fn subsystem(&self, name: &str) -> PipelineResult<&SubsystemParams> {
        self.subsystems
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| PipelineError::InvalidArgument(format!("unknown subsystem `{}`", name)))
    }

    pub fn validate(&self) -> PipelineResult<()> {
        if self.system.is_empty() {
            return Err(PipelineError::InvalidArgument("system name is empty".into()));
        }
        if self.subsystems.is_empty() {
            return Err(PipelineError::InvalidArgument("no subsystem declared".into()));
        }
        if self.nnp_count == 0 {
            return Err(PipelineError::InvalidArgument("nnp_count must be at least 1".into()));
        }
        if self.type_map.is_empty() {
            return Err(PipelineError::InvalidArgument("type_map is empty".into()));
        }
        for sub in &self.subsystems {
            sub.thresholds().validate()?;
            if sub.traj_count == 0 || sub.print_every == 0 {
                return Err(PipelineError::InvalidArgument(format!(
                    "subsystem `{}`: traj_count and print_every must be positive",
                    sub.name
                )));
            }
        }
        Ok(())
    }

    /// Index of `symbol` in the type map.
    pub fn type_index(&self, symbol: &str) -> PipelineResult<usize> {
        self.type_map
            .iter()
            .position(|s| s == symbol)
            .ok_or_else(|| {
                PipelineError::InvalidArgument(format!("element `{}` is not in type_map", symbol))
            })
    }
}

// ============================================================================
// 5. WORKSPACE LAYOUT
// ============================================================================

/// Zero-padded iteration tag, e.g. `007`.
pub fn padded(iteration: u32) -> String {
    format!("{:03}", iteration)
}

/// Paths of the on-disk layout, all relative to the workspace root.
#[derive(Debug, Clone)]
pub struct Layout {
    pub root: PathBuf,
}

impl Layout {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn control_dir(&self) -> PathBuf {
        self.root.join("control")
    }

    pub fn config_file(&self) -> PathBuf {
        self.control_dir().join("config.json")
    }

    pub fn user_files(&self) -> PathBuf {
        self.root.join("user_files")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    pub fn dataset_dir(&self, name: &str) -> PathBuf {
        self.data_dir().join(name)
    }

    pub fn nnp_dir(&self) -> PathBuf {
        self.root.join("NNP")
    }

    /// `<NNN>-<step>` working directory.
    pub fn iteration_dir(&self, iteration: u32, step: &str) -> PathBuf {
        self.root.join(format!("{}-{}", padded(iteration), step))
    }

    /// Frozen model name of ensemble member `k` at `iteration`.
    pub fn graph_name(&self, k: u32, iteration: u32, compressed: bool) -> String {
        if compressed {
            format!("graph_{}_{}_compressed.pb", k, padded(iteration))
        } else {
            format!("graph_{}_{}.pb", k, padded(iteration))
        }
    }
}
