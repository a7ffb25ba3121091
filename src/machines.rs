// src/machines.rs
//
// =============================================================================
// NNPAL: MACHINE PROFILES & DETECTION
// =============================================================================
//
// The Inventory.
//
// Responsibilities:
// 1. Load `user_files/machine.json` (cluster name -> profile).
// 2. Detect which cluster we run on from the hostname, unless `-c` forces one.
// 3. Provide the scheduler tokens (account, partition, ...) that job
//    templates reference.

use crate::errors::PipelineError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

// ============================================================================
// 1. DATA STRUCTURES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    Slurm,
    Pbs,
    /// Jobs are run by a plain shell; useful on workstations.
    Local,
}

/// One entry of `machine.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineProfile {
    /// Filled from the JSON key.
    #[serde(skip)]
    pub name: String,

    /// Substring of the login-node hostname identifying the cluster.
    pub hostname: String,

    #[serde(default = "default_scheduler")]
    pub job_scheduler: SchedulerKind,

    /// Submission program, e.g. `sbatch`.
    #[serde(default = "default_launch_command")]
    pub launch_command: String,

    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub partition: Option<String>,
    #[serde(default)]
    pub qos: Option<String>,

    /// Used when no hostname matches.
    #[serde(default)]
    pub default: bool,
}

fn default_scheduler() -> SchedulerKind {
    SchedulerKind::Slurm
}

fn default_launch_command() -> String {
    "sbatch".into()
}

impl MachineProfile {
    /// Tokens every job template may use.
    pub fn tokens(&self) -> BTreeMap<String, String> {
        let mut t = BTreeMap::new();
        t.insert("CLUSTER".into(), self.name.clone());
        t.insert("ACCOUNT".into(), self.account.clone().unwrap_or_default());
        t.insert("PARTITION".into(), self.partition.clone().unwrap_or_default());
        t.insert("QOS".into(), self.qos.clone().unwrap_or_default());
        t
    }
}

// ============================================================================
// 2. THE CATALOG
// ============================================================================

pub struct MachineCatalog {
    profiles: BTreeMap<String, MachineProfile>,
}

impl MachineCatalog {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(PipelineError::NotFound(path.to_path_buf()))
                .context("machine.json describes the clusters jobs are submitted to");
        }
        let text = fs::read_to_string(path)?;
        let mut profiles: BTreeMap<String, MachineProfile> =
            serde_json::from_str(&text).map_err(|e| PipelineError::parse(path, e.to_string()))?;
        for (name, profile) in profiles.iter_mut() {
            profile.name = name.clone();
        }
        Ok(Self { profiles })
    }

    /// Picks the profile: explicit override, then hostname match, then the
    /// entry flagged `default`.
    pub fn resolve(&self, override_name: Option<&str>, hostname: &str) -> Result<&MachineProfile> {
        if let Some(name) = override_name {
            return self.profiles.get(name).ok_or_else(|| {
                PipelineError::InvalidArgument(format!(
                    "cluster `{}` is not in machine.json (known: {})",
                    name,
                    self.names().join(", ")
                ))
                .into()
            });
        }

        if let Some(p) = self
            .profiles
            .values()
            .find(|p| !p.hostname.is_empty() && hostname.contains(&p.hostname))
        {
            log::debug!("Hostname {} matches cluster {}", hostname, p.name);
            return Ok(p);
        }

        self.profiles.values().find(|p| p.default).ok_or_else(|| {
            PipelineError::InvalidArgument(format!(
                "no cluster in machine.json matches host `{}`; pass -c <cluster>",
                hostname
            ))
            .into()
        })
    }

    pub fn names(&self) -> Vec<String> {
        self.profiles.keys().cloned().collect()
    }
}

/// Hostname of the node running the orchestrator.
pub fn current_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "localhost".into())
}
