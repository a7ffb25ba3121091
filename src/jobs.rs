// src/jobs.rs
//
// =============================================================================
// NNPAL: JOB COMPLETION SCANNER
// =============================================================================
//
// Batch jobs finish long after the launch phase returns. A `check` phase
// walks the job directories it expects and decides, per directory, whether
// the job succeeded.
//
// Override files (created by the operator inside a job directory):
// - `skip`:  give up on this job; downstream phases ignore the directory.
// - `force`: accept this job as done; downstream phases use what it left.

use crate::errors::{PipelineError, PipelineResult};
use crate::formats::markers;

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const SKIP_FILE: &str = "skip";
pub const FORCE_FILE: &str = "force";

// ============================================================================
// 1. COMPLETION CRITERIA
// ============================================================================

/// How a job proves it finished. Paths are relative to the job directory.
#[derive(Debug, Clone)]
pub enum Completion {
    /// Every marker appears in `log`.
    Markers {
        log: PathBuf,
        markers: &'static [&'static str],
    },
    /// The file exists and is not empty.
    Produces(PathBuf),
}

impl Completion {
    pub fn markers(log: impl Into<PathBuf>, markers: &'static [&'static str]) -> Self {
        Completion::Markers {
            log: log.into(),
            markers,
        }
    }

    pub fn produces(file: impl Into<PathBuf>) -> Self {
        Completion::Produces(file.into())
    }

    fn is_met(&self, dir: &Path) -> bool {
        match self {
            Completion::Markers { log, markers } => markers::file_has_all(&dir.join(log), markers),
            Completion::Produces(file) => fs::metadata(dir.join(file))
                .map(|m| m.is_file() && m.len() > 0)
                .unwrap_or(false),
        }
    }
}

/// One expected job.
#[derive(Debug, Clone)]
pub struct JobItem {
    pub dir: PathBuf,
    pub completion: Completion,
}

impl JobItem {
    pub fn new(dir: impl Into<PathBuf>, completion: Completion) -> Self {
        Self {
            dir: dir.into(),
            completion,
        }
    }
}

pub fn is_skipped(dir: &Path) -> bool {
    dir.join(SKIP_FILE).exists()
}

pub fn is_forced(dir: &Path) -> bool {
    dir.join(FORCE_FILE).exists()
}

// ============================================================================
// 2. THE REPORT
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct CheckReport {
    pub total: usize,
    pub succeeded: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
    pub forced: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
}

impl CheckReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Logs the per-job failures and the aggregate, then turns remaining
    /// failures into `Incomplete`.
    pub fn into_result(self, what: &str) -> PipelineResult<Self> {
        for dir in &self.failed {
            log::warn!("{} job not finished: {:?}", what, dir);
        }
        log::info!(
            "{}: {}/{} succeeded, {} skipped, {} forced, {} failed",
            what,
            self.succeeded.len(),
            self.total,
            self.skipped.len(),
            self.forced.len(),
            self.failed.len()
        );
        if self.is_complete() {
            Ok(self)
        } else {
            Err(PipelineError::Incomplete {
                failed: self.failed.len(),
                total: self.total,
            })
        }
    }
}

/// Classifies every item. Overrides win over the completion criterion: a
/// job with `skip` is skipped even if it finished.
pub fn scan(items: &[JobItem]) -> CheckReport {
    let mut report = CheckReport {
        total: items.len(),
        ..Default::default()
    };
    for item in items {
        let dir = item.dir.clone();
        if is_skipped(&item.dir) {
            report.skipped.push(dir);
        } else if item.completion.is_met(&item.dir) {
            report.succeeded.push(dir);
        } else if is_forced(&item.dir) {
            report.forced.push(dir);
        } else {
            report.failed.push(dir);
        }
    }
    report
}

// ============================================================================
// 3. CLEANUP
// ============================================================================

fn build_globset(patterns: &[&str]) -> PipelineResult<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| PipelineError::InvalidArgument(format!("bad cleanup pattern `{}`: {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| PipelineError::InvalidArgument(format!("cleanup patterns: {}", e)))
}

/// Removes files under `root` (recursively) whose file name matches one of
/// the glob `patterns`. Returns how many were removed.
pub fn remove_matching(root: &Path, patterns: &[&str]) -> Result<usize> {
    if !root.is_dir() {
        return Ok(0);
    }
    let globset = build_globset(patterns)?;
    let mut removed = 0;
    for entry in WalkDir::new(root) {
        let entry = entry.with_context(|| format!("Failed to walk {:?}", root))?;
        if !entry.file_type().is_file() || !globset.is_match(entry.file_name()) {
            continue;
        }
        fs::remove_file(entry.path()).with_context(|| format!("Failed to remove {:?}", entry.path()))?;
        log::debug!("Removed {:?}", entry.path());
        removed += 1;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::markers::LAMMPS_DONE;

    fn job(root: &Path, name: &str, log: Option<&str>) -> JobItem {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        if let Some(text) = log {
            fs::write(dir.join("run.log"), text).unwrap();
        }
        JobItem::new(dir, Completion::markers("run.log", LAMMPS_DONE))
    }

    #[test]
    fn test_scan_classifies_overrides() {
        let tmp = tempfile::tempdir().unwrap();
        let ok = job(tmp.path(), "ok", Some("Loop time\nTotal wall time: 0:01:02\n"));
        let crashed = job(tmp.path(), "crashed", Some("ERROR: Lost atoms\n"));
        let skipped = job(tmp.path(), "skipped", None);
        fs::write(skipped.dir.join(SKIP_FILE), "").unwrap();
        let forced = job(tmp.path(), "forced", Some("partial"));
        fs::write(forced.dir.join(FORCE_FILE), "").unwrap();

        let report = scan(&[ok, crashed, skipped, forced]);
        assert_eq!(report.total, 4);
        assert_eq!(report.succeeded.len(), 1);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.forced.len(), 1);
        assert_eq!(report.failed, vec![tmp.path().join("crashed")]);

        let err = report.into_result("exploration").unwrap_err();
        assert!(matches!(err, PipelineError::Incomplete { failed: 1, total: 4 }));
    }

    #[test]
    fn test_produces_needs_non_empty_file() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("graph.pb"), "").unwrap();
        let item = JobItem::new(tmp.path(), Completion::produces("graph.pb"));
        assert!(!scan(&[item.clone()]).is_complete());
        fs::write(tmp.path().join("graph.pb"), "weights").unwrap();
        assert!(scan(&[item]).is_complete());
    }

    #[test]
    fn test_remove_matching() {
        let tmp = tempfile::tempdir().unwrap();
        let sub = tmp.path().join("1");
        fs::create_dir_all(&sub).unwrap();
        for name in ["model.ckpt-100.index", "checkpoint", "lcurve.out", "a.restart"] {
            fs::write(sub.join(name), "x").unwrap();
        }
        let n = remove_matching(tmp.path(), &["model.ckpt*", "checkpoint", "*.restart"]).unwrap();
        assert_eq!(n, 3);
        assert!(sub.join("lcurve.out").exists());
        assert_eq!(remove_matching(&tmp.path().join("absent"), &["*"]).unwrap(), 0);
    }

    #[test]
    fn test_remove_matching_full_globs() {
        let tmp = tempfile::tempdir().unwrap();
        let deep = tmp.path().join("bulk/00001");
        fs::create_dir_all(&deep).unwrap();
        for name in ["proj-RESTART.wfn", "proj-RESTART.wfn.bak-1", "proj.out", "a_b.log", "ab"] {
            fs::write(deep.join(name), "x").unwrap();
        }
        let n = remove_matching(tmp.path(), &["*.wfn*", "a*b.log"]).unwrap();
        assert_eq!(n, 3);
        assert!(deep.join("proj.out").exists());
        assert!(deep.join("ab").exists());
        // Directories are never removed, even when their name matches.
        assert!(tmp.path().join("bulk").is_dir());
        assert!(remove_matching(tmp.path(), &["[unclosed"]).is_err());
    }
}
