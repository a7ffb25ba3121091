// src/phases/labeling.rs
//
// =============================================================================
// NNPAL: LABELING STEP
// =============================================================================
//
// Computes reference energies and forces of the selected structures with
// CP2K and turns them into a DeePMD dataset.
//
// Working directories: `<NNN>-labeling/<subsys>/<00001>/`, one structure each:
// - `labeling_<subsys>.xyz`                 the structure
// - `labeling_<subsys>.inp`                 CP2K input (rendered)
// - `labeling_<subsys>.out`                 CP2K output (energy, markers)
// - `labeling_<subsys>-forces-1_0.xyz`      CP2K force dump
//
// `extract` writes `data/<subsys>_<NNN>/` and registers it in the config.

use crate::core::{padded, DatasetEntry, IterationConfig, SubsystemParams, HARTREE_BOHR_TO_EV_ANGSTROM, HARTREE_TO_EV};
use crate::errors::PipelineError;
use crate::formats::markers::CP2K_DONE;
use crate::formats::npy::{self, NpyArray};
use crate::formats::xyz::{self, Frame};
use crate::formats::cp2k;
use crate::gates::{Gate, PhaseKind, PhaseState};
use crate::jobs::{self, Completion, JobItem};
use crate::phases::exploration::candidates_file;
use crate::phases::{submit_all, write_rendered, Workspace};
use crate::physics::SanityCheck;
use crate::submit::JobKind;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const PHASES: &[&str] = &["prepare", "launch", "check", "extract", "clean"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubsystemLabeling {
    pub nb_structures: usize,
    #[serde(default)]
    pub nb_labeled: usize,
    /// Forced jobs whose output could not be used.
    #[serde(default)]
    pub nb_unusable: usize,
    #[serde(default)]
    pub dataset: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LabelingMetrics {
    #[serde(default)]
    pub subsystems: BTreeMap<String, SubsystemLabeling>,
}

type LabelingState = PhaseState<LabelingMetrics>;

fn base_name(sub: &str) -> String {
    format!("labeling_{}", sub)
}

fn structure_dirs(ws: &Workspace, iteration: u32, sub: &str, count: usize) -> Vec<PathBuf> {
    let root = ws.layout().iteration_dir(iteration, "labeling").join(sub);
    (1..=count).map(|i| root.join(format!("{:05}", i))).collect()
}

/// Every job directory of the iteration, per subsystem, from the metrics.
fn all_dirs(ws: &Workspace, cfg: &IterationConfig, state: &LabelingState) -> Vec<(String, PathBuf)> {
    let mut out = Vec::new();
    for (sub, m) in &state.metrics.subsystems {
        for dir in structure_dirs(ws, cfg.current_iteration, sub, m.nb_structures) {
            out.push((sub.clone(), dir));
        }
    }
    out
}

pub async fn run(phase: &str, ws: &Workspace) -> Result<()> {
    let cfg = ws.config()?;
    match phase {
        "prepare" => prepare(ws, &cfg),
        "launch" => launch(ws, &cfg).await,
        "check" => check(ws, &cfg),
        "extract" => extract(ws, cfg),
        "clean" => clean(ws, &cfg),
        other => Err(super::unknown_phase(super::Step::Labeling, other)),
    }
}

// ============================================================================
// 1. PREPARE
// ============================================================================

fn cell_of(sub: &SubsystemParams) -> Result<[f64; 3]> {
    sub.cell.ok_or_else(|| {
        PipelineError::InvalidArgument(format!("subsystem `{}` has no `cell`; labeling needs it", sub.name)).into()
    })
}

fn prepare(ws: &Workspace, cfg: &IterationConfig) -> Result<()> {
    let iteration = cfg.current_iteration;
    let mut state: LabelingState = ws.begin_phase(PhaseKind::Labeling, iteration)?;
    let profile = ws.machine()?;

    for sub in &cfg.subsystems {
        let frames = xyz::read(&candidates_file(ws, iteration, &sub.name))?;
        if frames.is_empty() {
            log::info!("{}: nothing to label", sub.name);
            state.metrics.subsystems.insert(sub.name.clone(), SubsystemLabeling::default());
            continue;
        }
        let cell = cell_of(sub)?;
        if let Some(rho) = frames[0].density(cell) {
            log::info!("{}: density {:.3} g/cm3 in the labeling cell", sub.name, rho);
        }
        let template = ws.user_file(&format!("cp2k_{}.inp", sub.name))?;
        let base = base_name(&sub.name);

        let dirs = structure_dirs(ws, iteration, &sub.name, frames.len());
        for (frame, dir) in frames.iter().zip(&dirs) {
            fs::create_dir_all(dir)?;
            xyz::write(&dir.join(format!("{}.xyz", base)), std::slice::from_ref(frame))?;

            let mut tokens = BTreeMap::new();
            tokens.insert("CP2K_PROJECT".to_string(), base.clone());
            tokens.insert("XYZ_FILE".to_string(), format!("{}.xyz", base));
            tokens.insert("CELL".to_string(), format!("{} {} {}", cell[0], cell[1], cell[2]));
            write_rendered(&dir.join(format!("{}.inp", base)), &template, &tokens)?;

            ws.write_job(
                dir,
                JobKind::Cp2kLabel,
                &profile,
                &[
                    ("INPUT", format!("{}.inp", base)),
                    ("OUTPUT", format!("{}.out", base)),
                ],
            )?;
        }

        log::info!("{}: {} structure(s) to label", sub.name, frames.len());
        state.metrics.subsystems.insert(
            sub.name.clone(),
            SubsystemLabeling {
                nb_structures: frames.len(),
                ..Default::default()
            },
        );
    }

    ws.commit(&mut state, Gate::Locked)
}

// ============================================================================
// 2. LAUNCH / CHECK
// ============================================================================

async fn launch(ws: &Workspace, cfg: &IterationConfig) -> Result<()> {
    let mut state: LabelingState = ws.load_phase(PhaseKind::Labeling, cfg.current_iteration)?;
    state.check(Gate::Launched)?;

    let profile = ws.machine()?;
    let dirs: Vec<PathBuf> = all_dirs(ws, cfg, &state).into_iter().map(|(_, d)| d).collect();
    submit_all(ws, &profile, JobKind::Cp2kLabel, &dirs).await?;
    ws.commit(&mut state, Gate::Launched)
}

fn check(ws: &Workspace, cfg: &IterationConfig) -> Result<()> {
    let mut state: LabelingState = ws.load_phase(PhaseKind::Labeling, cfg.current_iteration)?;
    state.check(Gate::Checked)?;

    let items: Vec<JobItem> = all_dirs(ws, cfg, &state)
        .into_iter()
        .map(|(sub, dir)| JobItem::new(dir, Completion::markers(format!("{}.out", base_name(&sub)), CP2K_DONE)))
        .collect();
    jobs::scan(&items).into_result("labeling")?;
    ws.commit(&mut state, Gate::Checked)
}

// ============================================================================
// 3. EXTRACT
// ============================================================================

/// One labeled structure, in eV and Å.
struct Labeled {
    frame: Frame,
    energy: f64,
    forces: Vec<[f64; 3]>,
}

fn read_labeled(dir: &Path, base: &str) -> Result<Labeled> {
    let mut frames = xyz::read(&dir.join(format!("{}.xyz", base)))?;
    let frame = frames
        .pop()
        .ok_or_else(|| PipelineError::parse(dir.join(format!("{}.xyz", base)), "no frame"))?;
    let energy = cp2k::read_energy(&dir.join(format!("{}.out", base)))? * HARTREE_TO_EV;
    let forces_path = dir.join(format!("{}-forces-1_0.xyz", base));
    let forces: Vec<[f64; 3]> = cp2k::read_forces(&forces_path)?
        .into_iter()
        .map(|f| f.map(|c| c * HARTREE_BOHR_TO_EV_ANGSTROM))
        .collect();
    if forces.len() != frame.len() {
        return Err(PipelineError::parse(
            forces_path,
            format!("{} force rows for {} atoms", forces.len(), frame.len()),
        )
        .into());
    }
    Ok(Labeled { frame, energy, forces })
}

/// Writes `type.raw`, `type_map.raw` and `set.000/*.npy` into `dir`.
fn write_dataset(dir: &Path, cfg: &IterationConfig, cell: [f64; 3], labeled: &[Labeled]) -> Result<()> {
    let first = labeled
        .first()
        .ok_or_else(|| PipelineError::InvalidArgument("empty dataset".into()))?;
    let symbols: Vec<&str> = first.frame.symbols().collect();
    for (i, l) in labeled.iter().enumerate() {
        if !l.frame.symbols().eq(symbols.iter().copied()) {
            return Err(PipelineError::InvalidArgument(format!(
                "structure {} has a different atom order than structure 0",
                i
            ))
            .into());
        }
    }

    let types = symbols
        .iter()
        .map(|s| cfg.type_index(s).map(|i| i.to_string()))
        .collect::<Result<Vec<_>, _>>()?;

    let set = dir.join("set.000");
    fs::create_dir_all(&set).with_context(|| format!("Failed to create {:?}", set))?;
    fs::write(dir.join("type.raw"), types.join("\n") + "\n")?;
    fs::write(dir.join("type_map.raw"), cfg.type_map.join("\n") + "\n")?;

    let n = labeled.len();
    let natoms = symbols.len();
    let cell_row = [cell[0], 0.0, 0.0, 0.0, cell[1], 0.0, 0.0, 0.0, cell[2]];

    let boxes = NpyArray::new(vec![n, 9], labeled.iter().flat_map(|_| cell_row).collect())?;
    let coords = NpyArray::new(vec![n, natoms * 3], labeled.iter().flat_map(|l| l.frame.flat_positions()).collect())?;
    let energies = NpyArray::new(vec![n], labeled.iter().map(|l| l.energy).collect())?;
    let forces = NpyArray::new(
        vec![n, natoms * 3],
        labeled.iter().flat_map(|l| l.forces.iter().flatten().copied()).collect(),
    )?;

    for (name, array) in [("box", &boxes), ("coord", &coords), ("energy", &energies), ("force", &forces)] {
        let path = set.join(format!("{}.npy", name));
        npy::write(&path, array).with_context(|| format!("Failed to write {:?}", path))?;
    }
    Ok(())
}

fn extract(ws: &Workspace, mut cfg: IterationConfig) -> Result<()> {
    let iteration = cfg.current_iteration;
    let mut state: LabelingState = ws.load_phase(PhaseKind::Labeling, iteration)?;
    state.check(Gate::Extracted)?;

    let subsystems = cfg.subsystems.clone();
    for sub in &subsystems {
        let count = state.metrics.subsystems.get(&sub.name).map(|m| m.nb_structures).unwrap_or(0);
        if count == 0 {
            continue;
        }
        let base = base_name(&sub.name);
        let mut labeled = Vec::new();
        let mut nb_unusable = 0;

        for dir in structure_dirs(ws, iteration, &sub.name, count) {
            if jobs::is_skipped(&dir) {
                continue;
            }
            match read_labeled(&dir, &base) {
                Ok(l) => labeled.push(l),
                Err(e) if jobs::is_forced(&dir) => {
                    log::warn!("{:?} is forced but unusable: {:#}", dir, e);
                    nb_unusable += 1;
                }
                Err(e) => return Err(e.context(format!("labeling job {:?}", dir))),
            }
        }

        let entry = state.metrics.subsystems.entry(sub.name.clone()).or_default();
        entry.nb_labeled = labeled.len();
        entry.nb_unusable = nb_unusable;
        if labeled.is_empty() {
            log::warn!("{}: no usable labeled structure", sub.name);
            continue;
        }

        let name = format!("{}_{}", sub.name, padded(iteration));
        write_dataset(&ws.layout().dataset_dir(&name), &cfg, cell_of(sub)?, &labeled)?;
        cfg.datasets.register(DatasetEntry {
            name: name.clone(),
            nb_structures: labeled.len() as u64,
            iteration: Some(iteration),
        });
        log::info!("{}: dataset {} with {} structures", sub.name, name, labeled.len());
        entry.dataset = Some(name);
    }

    ws.store().save_config(&cfg)?;
    ws.commit(&mut state, Gate::Extracted)
}

fn clean(ws: &Workspace, cfg: &IterationConfig) -> Result<()> {
    let state: LabelingState = ws.load_phase(PhaseKind::Labeling, cfg.current_iteration)?;
    state.require(PhaseKind::Labeling.terminal_gate())?;

    let root = ws.layout().iteration_dir(cfg.current_iteration, "labeling");
    let removed = jobs::remove_matching(&root, &["*.wfn", "*.wfn.bak-1"])?;
    log::info!("Removed {} wavefunction file(s) from {:?}", removed, root);
    Ok(())
}
