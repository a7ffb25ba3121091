// src/phases/training.rs
//
// =============================================================================
// NNPAL: TRAINING STEP
// =============================================================================
//
// Trains the NNP ensemble on every registered dataset, freezes and
// compresses each model, then promotes the graphs into `NNP/`.
//
// Working directories: `<NNN>-training/<k>/` for k in 1..=nnp_count.

use crate::core::{padded, IterationConfig};
use crate::errors::PipelineError;
use crate::formats::markers::DEEPMD_TRAIN_DONE;
use crate::gates::{Gate, PhaseKind, PhaseState};
use crate::jobs::{self, Completion, JobItem};
use crate::phases::initialization::count_structures;
use crate::phases::{derive_seed, submit_all, Workspace};
use crate::provenance::{ModelNotary, ModelRecord};
use crate::schedule::LearningSchedule;
use crate::submit::JobKind;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs;
use std::path::PathBuf;

pub const PHASES: &[&str] = &[
    "prepare",
    "launch",
    "check",
    "freeze",
    "check_freeze",
    "compress",
    "check_compress",
    "increment",
    "update_iter",
    "clean",
];

pub const TRAINING_INPUT: &str = "training.json";
pub const TRAINING_LOG: &str = "training.out";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingMetrics {
    #[serde(default)]
    pub schedule: Option<LearningSchedule>,
    #[serde(default)]
    pub nb_structures: u64,
    #[serde(default)]
    pub datasets: Vec<String>,
    /// Graphs promoted into `NNP/`, frozen and compressed.
    #[serde(default)]
    pub models: Vec<ModelRecord>,
}

impl TrainingMetrics {
    pub fn model(&self, file: &str) -> Option<&ModelRecord> {
        self.models.iter().find(|m| m.file == file)
    }
}

type TrainingState = PhaseState<TrainingMetrics>;

pub async fn run(phase: &str, ws: &Workspace) -> Result<()> {
    let cfg = ws.config()?;
    match phase {
        "prepare" => prepare(ws, &cfg),
        "launch" => launch(ws, &cfg, Gate::Launched, JobKind::DeepmdTrain).await,
        "check" => check(ws, &cfg, Gate::Checked, |_| Completion::markers(TRAINING_LOG, DEEPMD_TRAIN_DONE)),
        "freeze" => {
            write_graph_jobs(ws, &cfg, Gate::FreezeLaunched, JobKind::DeepmdFreeze)?;
            launch(ws, &cfg, Gate::FreezeLaunched, JobKind::DeepmdFreeze).await
        }
        "check_freeze" => check(ws, &cfg, Gate::Frozen, |k| {
            Completion::produces(ws.layout().graph_name(k, cfg.current_iteration, false))
        }),
        "compress" => {
            write_graph_jobs(ws, &cfg, Gate::CompressLaunched, JobKind::DeepmdCompress)?;
            launch(ws, &cfg, Gate::CompressLaunched, JobKind::DeepmdCompress).await
        }
        "check_compress" => check(ws, &cfg, Gate::Compressed, |k| {
            Completion::produces(ws.layout().graph_name(k, cfg.current_iteration, true))
        }),
        "increment" => increment(ws, &cfg),
        "update_iter" => update_iter(ws, cfg),
        "clean" => clean(ws, &cfg),
        other => Err(super::unknown_phase(super::Step::Training, other)),
    }
}

fn model_dirs(ws: &Workspace, cfg: &IterationConfig) -> Vec<(u32, PathBuf)> {
    let root = ws.layout().iteration_dir(cfg.current_iteration, "training");
    (1..=cfg.nnp_count).map(|k| (k, root.join(k.to_string()))).collect()
}

// ============================================================================
// 1. PREPARE
// ============================================================================

fn prepare(ws: &Workspace, cfg: &IterationConfig) -> Result<()> {
    let iteration = cfg.current_iteration;
    let mut state: TrainingState = ws.begin_phase(PhaseKind::Training, iteration)?;

    // The registry must still describe what is on disk.
    for entry in &cfg.datasets.entries {
        let found = count_structures(ws.layout(), &entry.name)?;
        if found != entry.nb_structures {
            return Err(PipelineError::InvalidArgument(format!(
                "dataset `{}` should hold {} structures, found {}",
                entry.name, entry.nb_structures, found
            ))
            .into());
        }
    }

    let settings = ws.input().training();
    let nb_structures = cfg.datasets.total_structures();
    let schedule = LearningSchedule::resolve(
        nb_structures as i64,
        settings.numb_steps,
        settings.start_lr,
        settings.stop_lr,
        settings.decay_steps_fixed,
        settings.min_decay_steps,
    )?;
    log::info!(
        "{} structures: decay_steps={} decay_rate={:.6} final lr={:.3e}",
        nb_structures,
        schedule.decay_steps,
        schedule.decay_rate,
        schedule.final_lr
    );

    let template: Value = serde_json::from_str(&ws.user_file("training_template.json")?)
        .map_err(|e| PipelineError::parse(ws.layout().user_files().join("training_template.json"), e.to_string()))?;
    let systems: Vec<String> = cfg.datasets.names().map(|n| format!("../../data/{}", n)).collect();
    let profile = ws.machine()?;

    for (k, dir) in model_dirs(ws, cfg) {
        fs::create_dir_all(&dir)?;
        let seed = |part: &str| derive_seed(&format!("{}-{}-{}-{}", cfg.system, padded(iteration), k, part));

        let mut doc = template.clone();
        set_at(&mut doc, &["model", "type_map"], json!(cfg.type_map))?;
        set_at(&mut doc, &["model", "descriptor", "seed"], json!(seed("descriptor")))?;
        set_at(&mut doc, &["model", "fitting_net", "seed"], json!(seed("fitting")))?;
        set_at(&mut doc, &["learning_rate", "start_lr"], json!(schedule.start_lr))?;
        set_at(&mut doc, &["learning_rate", "stop_lr"], json!(schedule.stop_lr))?;
        set_at(&mut doc, &["learning_rate", "decay_steps"], json!(schedule.decay_steps))?;
        set_at(&mut doc, &["training", "numb_steps"], json!(schedule.numb_steps))?;
        set_at(&mut doc, &["training", "seed"], json!(seed("training")))?;
        set_at(&mut doc, &["training", "training_data", "systems"], json!(systems))?;

        let input_path = dir.join(TRAINING_INPUT);
        fs::write(&input_path, serde_json::to_string_pretty(&doc)?)
            .with_context(|| format!("Failed to write {:?}", input_path))?;

        ws.write_job(
            &dir,
            JobKind::DeepmdTrain,
            &profile,
            &[
                ("DEEPMD_INPUT", TRAINING_INPUT.to_string()),
                ("DEEPMD_LOG", TRAINING_LOG.to_string()),
                ("MODEL_INDEX", k.to_string()),
            ],
        )?;
    }

    state.metrics.schedule = Some(schedule);
    state.metrics.nb_structures = nb_structures;
    state.metrics.datasets = cfg.datasets.names().map(str::to_string).collect();
    ws.commit(&mut state, Gate::Locked)
}

/// Sets `doc[path[0]][path[1]]... = value`, creating objects on the way.
fn set_at(doc: &mut Value, path: &[&str], value: Value) -> Result<()> {
    let (last, parents) = match path.split_last() {
        Some(split) => split,
        None => return Ok(()),
    };
    let mut current = doc;
    for key in parents {
        let obj = current.as_object_mut().ok_or_else(|| {
            PipelineError::InvalidArgument(format!("training template: `{}` is not an object", path.join(".")))
        })?;
        current = obj.entry(key.to_string()).or_insert_with(|| json!({}));
    }
    let obj = current.as_object_mut().ok_or_else(|| {
        PipelineError::InvalidArgument(format!("training template: `{}` is not an object", path.join(".")))
    })?;
    obj.insert(last.to_string(), value);
    Ok(())
}

// ============================================================================
// 2. LAUNCH / CHECK (training, freeze, compress)
// ============================================================================

fn write_graph_jobs(ws: &Workspace, cfg: &IterationConfig, gate: Gate, kind: JobKind) -> Result<()> {
    let state: TrainingState = ws.load_phase(PhaseKind::Training, cfg.current_iteration)?;
    state.check(gate)?;

    let profile = ws.machine()?;
    let iteration = cfg.current_iteration;
    for (k, dir) in model_dirs(ws, cfg) {
        ws.write_job(
            &dir,
            kind,
            &profile,
            &[
                ("DEEPMD_INPUT", TRAINING_INPUT.to_string()),
                ("FROZEN_GRAPH", ws.layout().graph_name(k, iteration, false)),
                ("COMPRESSED_GRAPH", ws.layout().graph_name(k, iteration, true)),
                ("MODEL_INDEX", k.to_string()),
            ],
        )?;
    }
    Ok(())
}

async fn launch(ws: &Workspace, cfg: &IterationConfig, gate: Gate, kind: JobKind) -> Result<()> {
    let mut state: TrainingState = ws.load_phase(PhaseKind::Training, cfg.current_iteration)?;
    state.check(gate)?;

    let profile = ws.machine()?;
    let dirs: Vec<PathBuf> = model_dirs(ws, cfg).into_iter().map(|(_, d)| d).collect();
    submit_all(ws, &profile, kind, &dirs).await?;
    ws.commit(&mut state, gate)
}

fn check(
    ws: &Workspace,
    cfg: &IterationConfig,
    gate: Gate,
    completion: impl Fn(u32) -> Completion,
) -> Result<()> {
    let mut state: TrainingState = ws.load_phase(PhaseKind::Training, cfg.current_iteration)?;
    state.check(gate)?;

    let items: Vec<JobItem> = model_dirs(ws, cfg)
        .into_iter()
        .map(|(k, dir)| JobItem::new(dir, completion(k)))
        .collect();
    let report = jobs::scan(&items).into_result("training")?;
    if !report.skipped.is_empty() {
        // Every NNP of the ensemble is needed downstream.
        return Err(PipelineError::Precondition(format!(
            "{} model(s) marked skip; the ensemble needs all {}",
            report.skipped.len(),
            cfg.nnp_count
        ))
        .into());
    }
    ws.commit(&mut state, gate)
}

// ============================================================================
// 3. INCREMENT / UPDATE / CLEAN
// ============================================================================

fn increment(ws: &Workspace, cfg: &IterationConfig) -> Result<()> {
    let iteration = cfg.current_iteration;
    let mut state: TrainingState = ws.load_phase(PhaseKind::Training, iteration)?;
    state.check(Gate::Incremented)?;

    let nnp_dir = ws.layout().nnp_dir();
    let mut models = Vec::new();
    for (k, dir) in model_dirs(ws, cfg) {
        for compressed in [false, true] {
            let name = ws.layout().graph_name(k, iteration, compressed);
            let record = ModelNotary::promote(&dir.join(&name), &nnp_dir, &name)?;
            log::info!("Promoted {} ({} bytes, sha256 {})", record.file, record.bytes, &record.sha256[..12]);
            models.push(record);
        }
    }
    state.metrics.models = models;
    ws.commit(&mut state, Gate::Incremented)
}

fn update_iter(ws: &Workspace, mut cfg: IterationConfig) -> Result<()> {
    let state: TrainingState = ws.load_phase(PhaseKind::Training, cfg.current_iteration)?;
    state.require(Gate::Incremented)?;

    cfg.current_iteration += 1;
    ws.store().save_config(&cfg)?;
    log::info!("Current iteration is now {}", padded(cfg.current_iteration));
    Ok(())
}

fn clean(ws: &Workspace, cfg: &IterationConfig) -> Result<()> {
    let state: TrainingState = ws.load_phase(PhaseKind::Training, cfg.current_iteration)?;
    state.require(PhaseKind::Training.terminal_gate())?;

    let root = ws.layout().iteration_dir(cfg.current_iteration, "training");
    let removed = jobs::remove_matching(&root, &["model.ckpt*", "checkpoint"])?;
    log::info!("Removed {} checkpoint file(s) from {:?}", removed, root);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_at_creates_nested_objects() {
        let mut doc = json!({"training": {"disp_freq": 100}});
        set_at(&mut doc, &["training", "training_data", "systems"], json!(["a"])).unwrap();
        set_at(&mut doc, &["learning_rate", "start_lr"], json!(0.001)).unwrap();
        assert_eq!(doc["training"]["disp_freq"], 100);
        assert_eq!(doc["training"]["training_data"]["systems"][0], "a");
        assert_eq!(doc["learning_rate"]["start_lr"], 0.001);
    }

    #[test]
    fn test_set_at_rejects_scalar_parent() {
        let mut doc = json!({"model": 3});
        assert!(set_at(&mut doc, &["model", "type_map"], json!([])).is_err());
    }
}
