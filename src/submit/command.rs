// src/submit/command.rs
//
// =============================================================================
// NNPAL: COMMAND-LINE SUBMITTER
// =============================================================================
//
// Hands a rendered job script to the cluster's submission program
// (`sbatch`, `qsub`, or `bash` on a workstation), run from the job directory.
//
// The scheduler's exit status is logged but not trusted: a job that was
// accepted can still die, and a refused one is caught by the check phase the
// same way.

use crate::errors::PipelineResult;
use crate::machines::{MachineProfile, SchedulerKind};
use crate::submit::{require_tool, Submitter};

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

pub struct CommandSubmitter {
    program: String,
    scheduler: SchedulerKind,
}

impl CommandSubmitter {
    pub fn new(program: impl Into<String>, scheduler: SchedulerKind) -> Self {
        Self {
            program: program.into(),
            scheduler,
        }
    }

    pub fn for_machine(profile: &MachineProfile) -> Self {
        Self::new(profile.launch_command.clone(), profile.job_scheduler)
    }

    /// Extracts the job id from the scheduler's answer.
    fn parse_job_id(&self, stdout: &str) -> Option<String> {
        match self.scheduler {
            // "Submitted batch job 123456"
            SchedulerKind::Slurm => stdout
                .lines()
                .find(|l| l.starts_with("Submitted batch job"))
                .and_then(|l| l.split_whitespace().last())
                .map(str::to_string),
            // qsub prints the id alone, e.g. "4242.pbs01"
            SchedulerKind::Pbs => stdout
                .lines()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .map(str::to_string),
            SchedulerKind::Local => None,
        }
    }
}

#[async_trait]
impl Submitter for CommandSubmitter {
    fn ensure_available(&self) -> PipelineResult<()> {
        require_tool(&self.program).map(|_| ())
    }

    async fn submit(&self, job_dir: &Path, script: &str) -> Result<Option<String>> {
        let output = Command::new(&self.program)
            .arg(script)
            .current_dir(job_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("Failed to spawn `{} {}` in {:?}", self.program, script, job_dir))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            log::warn!(
                "`{} {}` in {:?} exited with {:?}: {}",
                self.program,
                script,
                job_dir,
                output.status.code(),
                stderr.lines().rev().take(5).collect::<Vec<_>>().join(" | ")
            );
        }

        let job_id = self.parse_job_id(&stdout);
        log::debug!("Submitted {:?}/{} -> {:?}", job_dir, script, job_id);
        Ok(job_id)
    }
}
