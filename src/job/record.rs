use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::RecordError;

/// Lifecycle of a job as seen by the status tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Finished,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Finished => write!(f, "finished"),
        }
    }
}

/// Persisted status document, one per `{jobid}@{queue}`.
///
/// Timestamps are seconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub queued: Option<f64>,
    pub started: Option<f64>,
    pub finished: Option<f64>,
    pub name: String,
    pub status: JobStatus,
    pub node: Option<String>,
    pub exit_code: Option<i32>,
    pub wallclock: Option<f64>,
}

impl JobRecord {
    pub fn queued(name: impl Into<String>) -> Self {
        Self::queued_at(name, now())
    }

    pub fn queued_at(name: impl Into<String>, at: f64) -> Self {
        Self {
            queued: Some(at),
            started: None,
            finished: None,
            name: name.into(),
            status: JobStatus::Queued,
            node: None,
            exit_code: None,
            wallclock: None,
        }
    }

    /// `queued` -> `running` on `node`.
    pub fn start(&mut self, node: &str, at: f64) -> Result<(), RecordError> {
        if self.status != JobStatus::Queued {
            return Err(RecordError::InvalidTransition {
                from: self.status,
                to: JobStatus::Running,
            });
        }
        self.started = Some(at);
        self.node = Some(node.to_string());
        self.status = JobStatus::Running;
        Ok(())
    }

    /// `running` -> `queued`, for a job whose worker went away mid-run.
    /// Clears what `start` set.
    pub fn requeue(&mut self) -> Result<(), RecordError> {
        if self.status != JobStatus::Running {
            return Err(RecordError::InvalidTransition {
                from: self.status,
                to: JobStatus::Queued,
            });
        }
        self.started = None;
        self.node = None;
        self.status = JobStatus::Queued;
        Ok(())
    }

    /// `running` -> `finished`. Exit code and wallclock are only ever set here.
    pub fn finish(&mut self, exit_code: i32, wallclock: f64, at: f64) -> Result<(), RecordError> {
        if self.status != JobStatus::Running {
            return Err(RecordError::InvalidTransition {
                from: self.status,
                to: JobStatus::Finished,
            });
        }
        self.finished = Some(at);
        self.exit_code = Some(exit_code);
        self.wallclock = Some(wallclock.max(0.0));
        self.status = JobStatus::Finished;
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.status == JobStatus::Finished
    }
}

/// Current wall-clock time as fractional epoch seconds.
pub fn now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
