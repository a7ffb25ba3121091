// src/phases.rs
//
// =============================================================================
// NNPAL: PHASE RUNNERS
// =============================================================================
//
// The Commander.
//
// One function per `<step> <phase>` pair. Every runner follows the same
// shape:
// 1. Load the state store documents it needs.
// 2. Validate the gate transition (and the cross-phase prerequisite when
//    locking).
// 3. Do the external work (write inputs, submit, scan, parse).
// 4. Open the gate and save the whole document back.
//
// A `Workspace` carries everything a runner needs; nothing is global.

use crate::core::{IterationConfig, Layout};
use crate::errors::PipelineError;
use crate::gates::{Gate, PhaseKind, PhaseState};
use crate::machines::{current_hostname, MachineCatalog, MachineProfile};
use crate::settings::UserInput;
use crate::state::{Presence, StateStore};
use crate::submit::command::CommandSubmitter;
use crate::submit::{leftover_tokens, render_template, JobKind, Submitter};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub mod exploration;
pub mod initialization;
pub mod labeling;
pub mod training;

// ============================================================================
// 1. STEPS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Step {
    Initialization,
    Exploration,
    Labeling,
    Training,
    Test,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Initialization => "initialization",
            Step::Exploration => "exploration",
            Step::Labeling => "labeling",
            Step::Training => "training",
            Step::Test => "test",
        }
    }

    /// Phases accepted after this step on the command line.
    pub fn phases(&self) -> &'static [&'static str] {
        match self {
            Step::Initialization => initialization::PHASES,
            Step::Exploration => exploration::PHASES,
            Step::Labeling => labeling::PHASES,
            Step::Training => training::PHASES,
            Step::Test => test::PHASES,
        }
    }
}

fn unknown_phase(step: Step, phase: &str) -> anyhow::Error {
    PipelineError::InvalidArgument(format!(
        "unknown phase `{}` for {} (expected one of: {})",
        phase,
        step.as_str(),
        step.phases().join(", ")
    ))
    .into()
}

/// Runs `<step> <phase>`.
pub async fn run(step: Step, phase: &str, ws: &Workspace) -> Result<()> {
    if !step.phases().contains(&phase) {
        return Err(unknown_phase(step, phase));
    }
    log::info!("=== {} {} ===", step.as_str(), phase);
    match step {
        Step::Initialization => initialization::run(phase, ws).await,
        Step::Exploration => exploration::run(phase, ws).await,
        Step::Labeling => labeling::run(phase, ws).await,
        Step::Training => training::run(phase, ws).await,
        Step::Test => test::run(phase, ws).await,
    }
}

// ============================================================================
// 2. WORKSPACE CONTEXT
// ============================================================================

pub struct Workspace {
    store: StateStore,
    input: UserInput,
    cluster: Option<String>,
    submitter: Option<Arc<dyn Submitter>>,
}

impl Workspace {
    pub fn new(root: impl AsRef<Path>, input: UserInput, cluster: Option<String>) -> Self {
        Self {
            store: StateStore::new(Layout::new(root)),
            input,
            cluster,
            submitter: None,
        }
    }

    /// Replaces the machine profile's submission program.
    pub fn with_submitter(mut self, submitter: Arc<dyn Submitter>) -> Self {
        self.submitter = Some(submitter);
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn layout(&self) -> &Layout {
        self.store.layout()
    }

    pub fn input(&self) -> &UserInput {
        &self.input
    }

    pub fn config(&self) -> Result<IterationConfig> {
        self.store.load_config()
    }

    /// Profile of the cluster we submit to.
    pub fn machine(&self) -> Result<MachineProfile> {
        let catalog = MachineCatalog::load(&self.layout().user_files().join("machine.json"))?;
        let profile = catalog.resolve(self.cluster.as_deref(), &current_hostname())?;
        log::debug!("Using cluster profile `{}`", profile.name);
        Ok(profile.clone())
    }

    pub fn submitter(&self, profile: &MachineProfile) -> Arc<dyn Submitter> {
        match &self.submitter {
            Some(s) => Arc::clone(s),
            None => Arc::new(CommandSubmitter::for_machine(profile)),
        }
    }

    /// Reads a file from `user_files/`.
    pub fn user_file(&self, name: &str) -> Result<String> {
        let path = self.layout().user_files().join(name);
        if !path.exists() {
            return Err(PipelineError::NotFound(path)).context("expected in user_files/");
        }
        fs::read_to_string(&path).with_context(|| format!("Failed to read {:?}", path))
    }

    /// Renders the `kind` template of `profile` into `dir`. Profile tokens and
    /// `WALLTIME` are always available; `extra` adds the job's own.
    pub fn write_job(
        &self,
        dir: &Path,
        kind: JobKind,
        profile: &MachineProfile,
        extra: &[(&str, String)],
    ) -> Result<()> {
        let template = self.user_file(&kind.template_name(&profile.name))?;
        let mut tokens = profile.tokens();
        tokens.insert("WALLTIME".into(), self.input.walltime(kind.as_str()));
        for (k, v) in extra {
            tokens.insert(k.to_string(), v.clone());
        }
        write_rendered(&dir.join(kind.script_name()), &template, &tokens)
    }

    /// Loads a phase document that must already exist.
    pub fn load_phase<M>(&self, phase: PhaseKind, iteration: u32) -> Result<PhaseState<M>>
    where
        M: DeserializeOwned + Default,
    {
        self.store.load_phase(phase, iteration, Presence::Required)
    }

    /// Validates the prerequisite of `phase` and returns a state whose
    /// `is_locked` gate may be opened.
    pub fn begin_phase<M>(&self, phase: PhaseKind, iteration: u32) -> Result<PhaseState<M>>
    where
        M: DeserializeOwned + Default,
    {
        self.store.check_prerequisite(phase, iteration)?;
        let state: PhaseState<M> = self.store.load_phase(phase, iteration, Presence::Optional)?;
        state.check(Gate::Locked)?;
        Ok(state)
    }

    /// Opens `gate` and persists the document.
    pub fn commit<M: Serialize>(&self, state: &mut PhaseState<M>, gate: Gate) -> Result<()> {
        state.open(gate)?;
        self.store.save_phase(state)?;
        log::info!(
            "{} {}: {} set",
            state.phase,
            crate::core::padded(state.iteration),
            gate
        );
        log::debug!("open gates: {}", state.progress().join(", "));
        Ok(())
    }
}

// ============================================================================
// 3. SHARED HELPERS
// ============================================================================

/// Renders `template` into `path`, warning about tokens nobody provided.
pub fn write_rendered(path: &Path, template: &str, tokens: &BTreeMap<String, String>) -> Result<()> {
    let text = render_template(template, tokens);
    for token in leftover_tokens(&text) {
        log::warn!("{:?}: token {} left unreplaced", path, token);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, text).with_context(|| format!("Failed to write {:?}", path))
}

/// Submits the `kind` script of every directory, skipping those marked
/// `skip`.
pub async fn submit_all(
    ws: &Workspace,
    profile: &MachineProfile,
    kind: JobKind,
    dirs: &[PathBuf],
) -> Result<usize> {
    let submitter = ws.submitter(profile);
    submitter.ensure_available()?;

    let script = kind.script_name();
    let mut submitted = 0;
    for dir in dirs {
        if crate::jobs::is_skipped(dir) {
            log::info!("Skipping {:?}", dir);
            continue;
        }
        if !dir.join(&script).exists() {
            return Err(PipelineError::NotFound(dir.join(&script)).into());
        }
        match submitter.submit(dir, &script).await? {
            Some(id) => log::info!("{:?}: job {}", dir, id),
            None => log::info!("{:?}: submitted", dir),
        }
        submitted += 1;
    }
    log::info!("{} {} job(s) submitted", submitted, kind.as_str());
    Ok(submitted)
}

/// Reproducible random seed for a named simulation.
pub fn derive_seed(tag: &str) -> u64 {
    let digest = Sha256::digest(tag.as_bytes());
    let head = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]);
    // LAMMPS velocity seeds must be in [1, 900000000].
    u64::from(head % 899_999_999) + 1
}
