// src/submit.rs
//
// =============================================================================
// NNPAL: JOB TEMPLATES & SUBMISSION INTERFACE
// =============================================================================
//
// The Hexagonal Port.
//
// Responsibilities:
// 1. Define the `Submitter` trait (the contract with the batch scheduler).
// 2. Render job-script templates by `_R_<KEY>_` substitution.
// 3. Check that external programs exist before a phase depends on them.

use crate::errors::{PipelineError, PipelineResult};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

pub mod command;

// ============================================================================
// 1. THE SUBMITTER TRAIT
// ============================================================================

#[async_trait]
pub trait Submitter: Send + Sync {
    /// Fails when the submission program is unavailable. Called once at the
    /// start of every launch phase.
    fn ensure_available(&self) -> PipelineResult<()> {
        Ok(())
    }

    /// Submits `script` (a file inside `job_dir`) from `job_dir`.
    ///
    /// Returns the scheduler's job id when it reports one. A scheduler
    /// refusing the job is logged, not fatal: completion is judged later by
    /// the check phase.
    async fn submit(&self, job_dir: &Path, script: &str) -> Result<Option<String>>;
}

// ============================================================================
// 2. JOB KINDS & TEMPLATES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    LammpsExplore,
    Cp2kLabel,
    DeepmdTrain,
    DeepmdFreeze,
    DeepmdCompress,
    DeepmdTest,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::LammpsExplore => "lammps_explore",
            JobKind::Cp2kLabel => "cp2k_label",
            JobKind::DeepmdTrain => "deepmd_train",
            JobKind::DeepmdFreeze => "deepmd_freeze",
            JobKind::DeepmdCompress => "deepmd_compress",
            JobKind::DeepmdTest => "deepmd_test",
        }
    }

    /// Template in `user_files/` for `cluster`.
    pub fn template_name(&self, cluster: &str) -> String {
        format!("job_{}_{}.sh", self.as_str(), cluster)
    }

    /// Rendered script name inside a job directory.
    pub fn script_name(&self) -> String {
        format!("job_{}.sh", self.as_str())
    }
}

/// Replaces every `_R_<KEY>_` with its value. Longer keys go first so a key
/// that prefixes another (`GRAPH` vs `GRAPH_COMPRESSED`) cannot clobber it.
pub fn render_template(template: &str, tokens: &BTreeMap<String, String>) -> String {
    let mut keys: Vec<&String> = tokens.keys().collect();
    keys.sort_by(|a, b| b.len().cmp(&a.len()).then(a.cmp(b)));

    let mut out = template.to_string();
    for key in keys {
        out = out.replace(&format!("_R_{}_", key), &tokens[key]);
    }
    out
}

/// `_R_..._` tokens still present after rendering.
pub fn leftover_tokens(text: &str) -> Vec<String> {
    let mut found = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("_R_") {
        let after = &rest[start + 3..];
        let len = after
            .find(|c: char| !(c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_'))
            .unwrap_or(after.len());
        let body = &after[..len];
        if body.len() > 1 && body.ends_with('_') {
            found.push(format!("_R_{}", body));
        }
        rest = &after[len..];
    }
    found
}

// ============================================================================
// 3. TOOL DISCOVERY
// ============================================================================

/// Resolves `program` the way a shell would: as a path when it contains a
/// separator, otherwise through `PATH`.
pub fn find_tool(program: &str) -> Option<PathBuf> {
    if program.contains('/') {
        let p = PathBuf::from(program);
        return if p.is_file() { Some(p) } else { None };
    }
    let path_var = env::var_os("PATH")?;
    env::split_paths(&path_var)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

pub fn require_tool(program: &str) -> PipelineResult<PathBuf> {
    find_tool(program).ok_or_else(|| PipelineError::MissingTool(program.to_string()))
}
