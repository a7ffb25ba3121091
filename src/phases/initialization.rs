// src/phases/initialization.rs
//
// `initialization start`: creates `control/config.json` from the user input
// and registers the initial datasets found under `data/init_*`.

use crate::core::{DatasetEntry, DatasetRegistry, IterationConfig, Layout};
use crate::errors::PipelineError;
use crate::formats::npy;
use crate::phases::Workspace;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;

pub const PHASES: &[&str] = &["start"];

/// Prefix of dataset directories that exist before the first iteration.
pub const INITIAL_PREFIX: &str = "init_";

pub async fn run(phase: &str, ws: &Workspace) -> Result<()> {
    match phase {
        "start" => start(ws),
        other => Err(super::unknown_phase(super::Step::Initialization, other)),
    }
}

fn start(ws: &Workspace) -> Result<()> {
    if ws.store().config_exists() {
        return Err(PipelineError::Precondition(format!(
            "{:?} already exists: the workspace is initialized",
            ws.layout().config_file()
        ))
        .into());
    }

    let input = ws.input();
    let missing = |field: &str| PipelineError::InvalidArgument(format!("input.json: `{}` is required", field));
    let system = input.system.clone().ok_or_else(|| missing("system"))?;
    let subsystems = input.subsystems.clone().ok_or_else(|| missing("subsystems"))?;
    let type_map = input.type_map.clone().ok_or_else(|| missing("type_map"))?;

    let datasets = match &input.datasets_initial {
        Some(expected) => validate_initial(ws.layout(), expected)?,
        None => discover_initial(ws.layout())?,
    };
    if datasets.entries.is_empty() {
        return Err(PipelineError::InvalidArgument(format!(
            "no initial dataset: expected {}<name>/set.000/box.npy under {:?}",
            INITIAL_PREFIX,
            ws.layout().data_dir()
        ))
        .into());
    }

    let config = IterationConfig {
        system,
        subsystems,
        nnp_count: input.nnp_count.unwrap_or(3),
        current_iteration: 0,
        type_map,
        datasets,
    };
    config.validate()?;

    fs::create_dir_all(ws.layout().nnp_dir())?;
    if !ws.layout().user_files().join("machine.json").exists() {
        log::warn!("user_files/machine.json is missing; launch phases will fail without it");
    }
    ws.store().save_config(&config)?;

    log::info!(
        "Initialized `{}`: {} subsystem(s), {} NNP(s), {} initial structures in {} dataset(s)",
        config.system,
        config.subsystems.len(),
        config.nnp_count,
        config.datasets.total_structures(),
        config.datasets.entries.len()
    );
    Ok(())
}

/// Number of structures in a dataset: rows of `set.000/box.npy`.
pub fn count_structures(layout: &Layout, name: &str) -> Result<u64> {
    let box_path = layout.dataset_dir(name).join("set.000").join("box.npy");
    if !box_path.exists() {
        return Err(PipelineError::NotFound(box_path)).with_context(|| format!("dataset `{}`", name));
    }
    let shape = npy::read_shape(&box_path)?;
    Ok(shape.first().copied().unwrap_or(0) as u64)
}

fn discover_initial(layout: &Layout) -> Result<DatasetRegistry> {
    let mut names = Vec::new();
    let data_dir = layout.data_dir();
    if data_dir.is_dir() {
        for entry in fs::read_dir(&data_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.file_type()?.is_dir() && name.starts_with(INITIAL_PREFIX) {
                names.push(name);
            }
        }
    }
    names.sort();

    let mut registry = DatasetRegistry::default();
    for name in names {
        let nb_structures = count_structures(layout, &name)?;
        log::info!("Found initial dataset {} ({} structures)", name, nb_structures);
        registry.register(DatasetEntry {
            name,
            nb_structures,
            iteration: None,
        });
    }
    Ok(registry)
}

fn validate_initial(layout: &Layout, expected: &BTreeMap<String, u64>) -> Result<DatasetRegistry> {
    let mut registry = DatasetRegistry::default();
    for (name, &count) in expected {
        let found = count_structures(layout, name)?;
        if found != count {
            return Err(PipelineError::InvalidArgument(format!(
                "dataset `{}` declares {} structures but box.npy has {}",
                name, count, found
            ))
            .into());
        }
        registry.register(DatasetEntry {
            name: name.clone(),
            nb_structures: count,
            iteration: None,
        });
    }
    Ok(registry)
}
