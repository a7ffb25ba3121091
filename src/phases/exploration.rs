// src/phases/exploration.rs
//
// =============================================================================
// NNPAL: EXPLORATION STEP
// =============================================================================
//
// Runs LAMMPS molecular dynamics driven by the current ensemble, then picks
// the frames the ensemble disagrees on.
//
// Working directories: `<NNN>-exploration/<subsys>/<k>/<t>/`, one trajectory
// per (NNP k, replica t). Trajectory id: `<subsys>_<k>_<t>`.
//
// Files per trajectory:
// - `<id>.in`                       LAMMPS input (rendered)
// - `<id>.log`                      LAMMPS log
// - `model_devi_<id>.out`           ensemble deviation table
// - `<id>.xyz`                      trajectory, same frames as the table
// - `selection_candidates.json`     selector output

use crate::core::{padded, IterationConfig, SubsystemParams};
use crate::errors::PipelineError;
use crate::formats::markers::LAMMPS_DONE;
use crate::formats::{model_devi, xyz};
use crate::gates::{Gate, PhaseKind, PhaseState};
use crate::jobs::{self, Completion, JobItem};
use crate::phases::training::TrainingMetrics;
use crate::phases::{derive_seed, submit_all, write_rendered, Workspace};
use crate::physics::SanityCheck;
use crate::provenance::ModelNotary;
use crate::selection::{cap_pooled, next_iteration_step_factor, select_candidates, CandidateSet, Thresholds};
use crate::state::{load_json, save_json, Presence};
use crate::submit::JobKind;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

pub const PHASES: &[&str] = &["prepare", "launch", "check", "deviate", "extract", "clean"];

pub const SELECTION_FILE: &str = "selection_candidates.json";

// ============================================================================
// 1. METRICS
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubsystemExploration {
    pub nb_steps: u64,
    pub nb_trajectories: u32,
    /// Aggregate over trajectories (no frame indices).
    #[serde(default)]
    pub candidates: CandidateSet,
    #[serde(default)]
    pub step_factor: u64,
    /// Step count the next iteration starts from.
    #[serde(default)]
    pub next_nb_steps: u64,
    #[serde(default)]
    pub nb_extracted: usize,
    /// Selected frames dropped by the overlap check.
    #[serde(default)]
    pub nb_invalid: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExplorationMetrics {
    #[serde(default)]
    pub subsystems: BTreeMap<String, SubsystemExploration>,
}

type ExplorationState = PhaseState<ExplorationMetrics>;

/// One trajectory of the iteration.
struct Trajectory {
    id: String,
    dir: PathBuf,
}

fn trajectories(ws: &Workspace, cfg: &IterationConfig, sub: &SubsystemParams) -> Vec<Trajectory> {
    let root = ws.layout().iteration_dir(cfg.current_iteration, "exploration").join(&sub.name);
    let mut out = Vec::new();
    for k in 1..=cfg.nnp_count {
        for t in 1..=sub.traj_count {
            out.push(Trajectory {
                id: format!("{}_{}_{}", sub.name, k, t),
                dir: root.join(k.to_string()).join(t.to_string()),
            });
        }
    }
    out
}

fn all_trajectories(ws: &Workspace, cfg: &IterationConfig) -> Vec<Trajectory> {
    cfg.subsystems.iter().flat_map(|s| trajectories(ws, cfg, s)).collect()
}

/// `<NNN>-exploration/<subsys>/candidates_<subsys>_<NNN>.xyz`
pub fn candidates_file(ws: &Workspace, iteration: u32, subsystem: &str) -> PathBuf {
    ws.layout()
        .iteration_dir(iteration, "exploration")
        .join(subsystem)
        .join(format!("candidates_{}_{}.xyz", subsystem, padded(iteration)))
}

pub async fn run(phase: &str, ws: &Workspace) -> Result<()> {
    let cfg = ws.config()?;
    match phase {
        "prepare" => prepare(ws, &cfg),
        "launch" => launch(ws, &cfg).await,
        "check" => check(ws, &cfg),
        "deviate" => deviate(ws, &cfg),
        "extract" => extract(ws, &cfg),
        "clean" => clean(ws, &cfg),
        other => Err(super::unknown_phase(super::Step::Exploration, other)),
    }
}

// ============================================================================
// 2. PREPARE
// ============================================================================

fn prepare(ws: &Workspace, cfg: &IterationConfig) -> Result<()> {
    let iteration = cfg.current_iteration;
    if iteration == 0 {
        return Err(PipelineError::Precondition(
            "exploration starts at iteration 001: train and update_iter first".into(),
        )
        .into());
    }
    let mut state: ExplorationState = ws.begin_phase(PhaseKind::Exploration, iteration)?;

    // Models must be the ones promoted by the previous training.
    let training: PhaseState<TrainingMetrics> = ws.load_phase(PhaseKind::Training, iteration - 1)?;
    let mut models = Vec::new();
    for k in 1..=cfg.nnp_count {
        let name = ws.layout().graph_name(k, iteration - 1, true);
        let expected = training.metrics.model(&name).map(|m| m.sha256.as_str());
        if expected.is_none() {
            log::warn!("No recorded hash for {}; skipping integrity check", name);
        }
        ModelNotary::verify(&ws.layout().nnp_dir().join(&name), expected)?;
        models.push(name);
    }

    let previous: PhaseState<ExplorationMetrics> =
        ws.store().load_phase(PhaseKind::Exploration, iteration - 1, Presence::Optional)?;
    let settings = ws.input().exploration();
    let profile = ws.machine()?;

    for sub in &cfg.subsystems {
        let nb_steps = settings
            .nb_steps_override
            .get(&sub.name)
            .copied()
            .or_else(|| {
                previous
                    .metrics
                    .subsystems
                    .get(&sub.name)
                    .map(|p| p.next_nb_steps)
                    .filter(|n| *n > 0)
            })
            .unwrap_or(sub.nb_steps_initial);

        let data_file = format!("{}.lmp", sub.name);
        let structure = ws.user_file(&data_file)?;
        let lammps_template = ws.user_file(&format!("lammps_{}.in", sub.name))?;

        let trajs = trajectories(ws, cfg, sub);
        for (idx, traj) in trajs.iter().enumerate() {
            fs::create_dir_all(&traj.dir)?;
            fs::write(traj.dir.join(&data_file), &structure)?;

            // The driving model goes first; the rest only score deviations.
            let k = idx / sub.traj_count as usize;
            let mut ordered = models.clone();
            ordered.rotate_left(k);
            let models_list: Vec<String> = ordered.iter().map(|m| format!("../../../../NNP/{}", m)).collect();

            let mut tokens = BTreeMap::new();
            tokens.insert("DATA_FILE".to_string(), data_file.clone());
            tokens.insert("TEMPERATURE".to_string(), sub.temperature_k.to_string());
            tokens.insert("TIMESTEP".to_string(), sub.timestep_ps.to_string());
            tokens.insert("NUMBER_OF_STEPS".to_string(), nb_steps.to_string());
            tokens.insert("PRINT_EVERY".to_string(), sub.print_every.to_string());
            tokens.insert(
                "SEED".to_string(),
                derive_seed(&format!("{}-{}-{}", cfg.system, padded(iteration), traj.id)).to_string(),
            );
            tokens.insert("MODELS_LIST".to_string(), models_list.join(" "));
            tokens.insert("DEVI_FILE".to_string(), format!("model_devi_{}.out", traj.id));
            tokens.insert("TRAJ_FILE".to_string(), format!("{}.xyz", traj.id));
            write_rendered(&traj.dir.join(format!("{}.in", traj.id)), &lammps_template, &tokens)?;

            ws.write_job(
                &traj.dir,
                JobKind::LammpsExplore,
                &profile,
                &[
                    ("INPUT", format!("{}.in", traj.id)),
                    ("LOG", format!("{}.log", traj.id)),
                ],
            )?;
        }

        log::info!("{}: {} trajectories of {} steps", sub.name, trajs.len(), nb_steps);
        state.metrics.subsystems.insert(
            sub.name.clone(),
            SubsystemExploration {
                nb_steps,
                nb_trajectories: trajs.len() as u32,
                ..Default::default()
            },
        );
    }

    ws.commit(&mut state, Gate::Locked)
}

// ============================================================================
// 3. LAUNCH / CHECK
// ============================================================================

async fn launch(ws: &Workspace, cfg: &IterationConfig) -> Result<()> {
    let mut state: ExplorationState = ws.load_phase(PhaseKind::Exploration, cfg.current_iteration)?;
    state.check(Gate::Launched)?;

    let profile = ws.machine()?;
    let dirs: Vec<PathBuf> = all_trajectories(ws, cfg).into_iter().map(|t| t.dir).collect();
    submit_all(ws, &profile, JobKind::LammpsExplore, &dirs).await?;
    ws.commit(&mut state, Gate::Launched)
}

fn check(ws: &Workspace, cfg: &IterationConfig) -> Result<()> {
    let mut state: ExplorationState = ws.load_phase(PhaseKind::Exploration, cfg.current_iteration)?;
    state.check(Gate::Checked)?;

    let items: Vec<JobItem> = all_trajectories(ws, cfg)
        .into_iter()
        .map(|t| JobItem::new(t.dir, Completion::markers(format!("{}.log", t.id), LAMMPS_DONE)))
        .collect();
    jobs::scan(&items).into_result("exploration")?;
    ws.commit(&mut state, Gate::Checked)
}

// ============================================================================
// 4. DEVIATE
// ============================================================================

fn deviate(ws: &Workspace, cfg: &IterationConfig) -> Result<()> {
    let mut state: ExplorationState = ws.load_phase(PhaseKind::Exploration, cfg.current_iteration)?;
    state.check(Gate::Deviated)?;

    for sub in &cfg.subsystems {
        let thresholds = sub.thresholds();
        let uncapped = Thresholds {
            nb_candidates_max: usize::MAX,
            ..thresholds
        };

        let mut live = Vec::new();
        let mut sets = Vec::new();
        let mut deviations = Vec::new();
        for traj in trajectories(ws, cfg, sub) {
            if jobs::is_skipped(&traj.dir) {
                continue;
            }
            let devi_path = traj.dir.join(format!("model_devi_{}.out", traj.id));
            let rows = match model_devi::read(&devi_path) {
                Ok(rows) => rows,
                Err(e) if jobs::is_forced(&traj.dir) => {
                    log::warn!("{} is forced but unreadable ({}); ignored", traj.id, e);
                    continue;
                }
                Err(e) => return Err(anyhow::Error::new(e).context(format!("trajectory {}", traj.id))),
            };
            let d = model_devi::max_force_deviation(&rows);
            sets.push(select_candidates(&d, &uncapped, sub.ignore_first_frames)?);
            deviations.push(d);
            live.push(traj);
        }

        cap_pooled(&mut sets, &deviations, thresholds.nb_candidates_max)?;

        let mut aggregate = CandidateSet::default();
        for (traj, set) in live.iter().zip(&sets) {
            log::debug!(
                "{}: {} selected, {} candidates, {} ill-described, {} rejected of {}",
                traj.id,
                set.selected.len(),
                set.nb_candidates,
                set.nb_ill_described,
                set.nb_rejected,
                set.nb_total
            );
            save_json(&traj.dir.join(SELECTION_FILE), set)?;
            aggregate.merge(set);
        }

        let entry = state.metrics.subsystems.entry(sub.name.clone()).or_default();
        let factor = next_iteration_step_factor(
            aggregate.nb_eligible(),
            aggregate.nb_rejected,
            aggregate.nb_total,
        );
        entry.step_factor = factor;
        entry.next_nb_steps = (entry.nb_steps * factor).min(sub.max_nb_steps);
        log::info!(
            "{}: {} eligible / {} rejected / {} frames -> next iteration runs {} steps (x{})",
            sub.name,
            aggregate.nb_eligible(),
            aggregate.nb_rejected,
            aggregate.nb_total,
            entry.next_nb_steps,
            factor
        );
        entry.candidates = aggregate;
    }

    ws.commit(&mut state, Gate::Deviated)
}

// ============================================================================
// 5. EXTRACT
// ============================================================================

fn extract(ws: &Workspace, cfg: &IterationConfig) -> Result<()> {
    let iteration = cfg.current_iteration;
    let mut state: ExplorationState = ws.load_phase(PhaseKind::Exploration, iteration)?;
    state.check(Gate::Extracted)?;
    let min_distance = ws.input().exploration().min_distance;

    for sub in &cfg.subsystems {
        let mut picked = Vec::new();
        let mut nb_invalid = 0;

        for traj in trajectories(ws, cfg, sub) {
            let selection_path = traj.dir.join(SELECTION_FILE);
            if jobs::is_skipped(&traj.dir) || !selection_path.exists() {
                continue;
            }
            let selection: CandidateSet = load_json(&selection_path, Presence::Required)?;
            if selection.selected.is_empty() {
                continue;
            }
            let frames = xyz::read(&traj.dir.join(format!("{}.xyz", traj.id)))?;
            for idx in selection.selected {
                let mut frame = frames.get(idx).cloned().ok_or_else(|| {
                    PipelineError::InvalidArgument(format!(
                        "{}: frame {} selected but trajectory has {} frames",
                        traj.id,
                        idx,
                        frames.len()
                    ))
                })?;
                if let Err(e) = frame.check_overlaps(min_distance) {
                    log::warn!("{} frame {} dropped: {}", traj.id, idx, e);
                    nb_invalid += 1;
                    continue;
                }
                frame.comment = format!("{} frame {}", traj.id, idx);
                picked.push(frame);
            }
        }

        let out = candidates_file(ws, iteration, &sub.name);
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent)?;
        }
        xyz::write(&out, &picked).with_context(|| format!("Failed to write {:?}", out))?;
        log::info!("{}: {} structures to label ({} dropped)", sub.name, picked.len(), nb_invalid);

        let entry = state.metrics.subsystems.entry(sub.name.clone()).or_default();
        entry.nb_extracted = picked.len();
        entry.nb_invalid = nb_invalid;
    }

    ws.commit(&mut state, Gate::Extracted)
}

fn clean(ws: &Workspace, cfg: &IterationConfig) -> Result<()> {
    let state: ExplorationState = ws.load_phase(PhaseKind::Exploration, cfg.current_iteration)?;
    state.require(PhaseKind::Exploration.terminal_gate())?;

    let root = ws.layout().iteration_dir(cfg.current_iteration, "exploration");
    let removed = jobs::remove_matching(&root, &["*.restart", "log.cite"])?;
    log::info!("Removed {} file(s) from {:?}", removed, root);
    Ok(())
}
