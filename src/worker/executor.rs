use std::fs::{self, File};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use tokio::process::Command;

use super::command::JobCommand;
use super::stager::{STDERR_FILE, STDOUT_FILE};
use crate::error::{JobError, StoreError};
use crate::job::record::{now, JobRecord};
use crate::job::JobRecordStore;

/// Exit code recorded when the process could not be started at all.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 127;

/// Scheduler-style variables exported to every job.
pub mod env {
    pub const JOBID: &str = "PBS_JOBID";
    pub const JOBNAME: &str = "PBS_JOBNAME";
    pub const QUEUE: &str = "PBS_QUEUE";
    pub const WORKDIR: &str = "PBS_O_WORKDIR";
    pub const NODEFILE: &str = "PBS_NODEFILE";
    pub const NP: &str = "PBS_NP";
    pub const NCPUS: &str = "NCPUS";
    pub const TMPDIR: &str = "TMPDIR";
}

/// Identity of the job being executed.
#[derive(Debug, Clone, Copy)]
pub struct JobContext<'a> {
    pub jobid: &'a str,
    pub name: &'a str,
    pub queue: &'a str,
}

/// Result of one execution, after the record has been finished.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub exit_code: i32,
    pub wallclock: f64,
    pub record: JobRecord,
}

/// Decode a POSIX wait status into a shell-style exit code: the exit byte for
/// a normal exit, `128 + signal` for a signal death.
pub fn decode_wait_status(raw: i32) -> i32 {
    let signal = raw & 0x7f;
    if signal == 0 {
        (raw >> 8) & 0xff
    } else {
        128 + signal
    }
}

/// Runs synthesized commands and drives the `running` / `finished` transitions.
#[derive(Clone)]
pub struct SandboxExecutor {
    store: JobRecordStore,
    node: String,
    ncpus: u32,
    scratch_root: PathBuf,
}

impl SandboxExecutor {
    pub fn new(store: JobRecordStore, node: String, ncpus: u32, scratch_root: PathBuf) -> Self {
        Self {
            store,
            node,
            ncpus,
            scratch_root,
        }
    }

    /// Execute `command` to completion. No timeout is applied.
    pub async fn execute(
        &self,
        job: JobContext<'_>,
        command: &JobCommand,
    ) -> Result<ExecutionOutcome, JobError> {
        fs::create_dir_all(&self.scratch_root)?;
        // Both removed on drop, at the end of this call.
        let tmpdir = tempfile::Builder::new()
            .prefix(&format!("{}.", job.jobid))
            .tempdir_in(&self.scratch_root)?;
        let mut nodefile = tempfile::Builder::new()
            .prefix(&format!("{}.", job.jobid))
            .suffix(".nodes")
            .tempfile_in(&self.scratch_root)?;
        writeln!(nodefile, "{}", self.node)?;
        nodefile.flush()?;

        let mut record = match self.store.get(job.jobid, job.queue).await? {
            Some(record) => record,
            None => {
                tracing::warn!(jobid = job.jobid, "No queued record found, creating one");
                JobRecord::queued(job.name)
            }
        };
        record
            .start(&self.node, now())
            .map_err(StoreError::from)?;
        self.store.put(job.jobid, job.queue, &record).await?;

        let workdir = match command.sandbox() {
            Some(sandbox) => sandbox.to_path_buf(),
            None => std::env::current_dir()?,
        };

        tracing::info!(jobid = job.jobid, command = %command, "Job command");
        let clock = Instant::now();
        let exit_code = match self
            .spawn(job, command, &workdir, tmpdir.path(), nodefile.path())
            .await
        {
            Ok(code) => code,
            Err(e) => {
                tracing::error!(jobid = job.jobid, error = %e, "Job could not be started");
                SPAWN_FAILURE_EXIT_CODE
            }
        };
        let wallclock = clock.elapsed().as_millis() as f64 / 1000.0;

        record
            .finish(exit_code, wallclock, now())
            .map_err(StoreError::from)?;
        self.store.put(job.jobid, job.queue, &record).await?;

        tracing::info!(
            jobid = job.jobid,
            exit_code,
            wallclock,
            "Job exited with status {} and the elapsed wallclock time was {:.2} seconds",
            exit_code,
            wallclock
        );

        Ok(ExecutionOutcome {
            exit_code,
            wallclock,
            record,
        })
    }

    async fn spawn(
        &self,
        job: JobContext<'_>,
        command: &JobCommand,
        workdir: &Path,
        tmpdir: &Path,
        nodefile: &Path,
    ) -> std::io::Result<i32> {
        if let Some(path) = command.executable() {
            let mut perms = fs::metadata(&path)?.permissions();
            perms.set_mode(perms.mode() | 0o755);
            fs::set_permissions(&path, perms)?;
        }

        let (program, args) = command.argv();
        let mut cmd = Command::new(program);
        cmd.args(&args)
            .current_dir(workdir)
            .env(env::JOBID, job.jobid)
            .env(env::JOBNAME, job.name)
            .env(env::QUEUE, job.queue)
            .env(env::WORKDIR, workdir)
            .env(env::NODEFILE, nodefile)
            .env(env::TMPDIR, tmpdir)
            .env(env::NCPUS, self.ncpus.to_string())
            .env(env::NP, self.ncpus.to_string())
            .stdin(Stdio::null());

        if let Some(sandbox) = command.sandbox() {
            cmd.stdout(Stdio::from(File::create(sandbox.join(STDOUT_FILE))?))
                .stderr(Stdio::from(File::create(sandbox.join(STDERR_FILE))?));
        }

        let status = cmd.status().await?;
        Ok(decode_wait_status(status.into_raw()))
    }
}
