// src/lib.rs
//
// =============================================================================
// NNPAL: LIBRARY ROOT
// =============================================================================
//
// This file declares the module tree and exports public types.

// 1. Declare Modules
pub mod core;
pub mod errors;
pub mod formats;
pub mod gates;
pub mod jobs;
pub mod logs;
pub mod machines;
pub mod phases;
pub mod physics;
pub mod provenance;
pub mod schedule;
pub mod selection;
pub mod settings;
pub mod state;
pub mod submit;

// 2. Re-exports (The Public API)

pub use crate::core::{IterationConfig, Layout, SubsystemParams};
pub use errors::{PipelineError, PipelineResult};
pub use gates::{Gate, PhaseKind, PhaseState};
pub use phases::{Step, Workspace};
pub use selection::{next_iteration_step_factor, select_candidates, CandidateSet, Thresholds};
pub use state::StateStore;
pub use submit::Submitter;
