use std::sync::Arc;

use tracing::warn;

use crate::broker::{stream_name, Broker};
use crate::error::StoreError;
use crate::job::message::header;
use crate::job::record::now;
use crate::job::{JobRecord, JobRecordStore};

/// Placeholder for a job that has not started yet.
const NO_ELAPSED: &str = "--:--:--";
const NOT_AVAILABLE: &str = "N/A";

/// `H:MM:SS`, hours unbounded, fractional seconds dropped.
pub fn format_elapsed(seconds: f64) -> String {
    let total = if seconds.is_finite() && seconds > 0.0 {
        seconds as u64
    } else {
        0
    };
    format!("{}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

fn column(value: &str, width: usize) -> String {
    let cut: String = value.chars().take(width).collect();
    format!("{:<width$}", cut, width = width)
}

/// One table row for a job. `at` is the current time, used for running jobs.
pub fn format_row(jobid: &str, record: &JobRecord, at: f64) -> String {
    let elapsed = match (record.wallclock, record.started) {
        (Some(wallclock), _) => format_elapsed(wallclock),
        (None, Some(started)) => format_elapsed(at - started),
        (None, None) => NO_ELAPSED.to_string(),
    };
    let exit_code = record
        .exit_code
        .map(|c| c.to_string())
        .unwrap_or_else(|| NOT_AVAILABLE.to_string());

    [
        column(jobid, 11),
        column(&record.name, 22),
        column(record.node.as_deref().unwrap_or(NOT_AVAILABLE), 18),
        column(&record.status.to_string(), 10),
        column(&elapsed, 11),
        column(&exit_code, 3),
    ]
    .join(" ")
}

/// Renders the queue summary and one entry per retained job.
pub struct StatusReporter {
    broker: Arc<dyn Broker>,
    store: JobRecordStore,
}

impl StatusReporter {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        let store = JobRecordStore::new(broker.clone());
        Self { broker, store }
    }

    /// Summary line followed by a row per job, or the pretty JSON record
    /// when `verbose`.
    pub async fn report(&self, queue: &str, verbose: bool) -> Result<Vec<String>, StoreError> {
        let stats = self.broker.stats(queue).await?;
        let mut lines = vec![format!(
            "{} messages {} pending {}",
            stream_name(queue),
            stats.messages,
            stats.pending
        )];

        let at = now();
        for headers in self.broker.replay(queue).await? {
            let jobid = match headers.get(header::JOBID) {
                Some(jobid) => jobid,
                None => continue,
            };
            let record = match self.store.get(jobid, queue).await? {
                Some(record) => record,
                None => {
                    warn!(jobid = %jobid, queue, "Job has no status record");
                    continue;
                }
            };
            if verbose {
                let doc = serde_json::to_string_pretty(&record).map_err(|source| {
                    StoreError::Corrupt {
                        key: JobRecordStore::key(jobid, queue),
                        source,
                    }
                })?;
                lines.push(doc);
            } else {
                lines.push(format_row(jobid, &record, at));
            }
        }
        Ok(lines)
    }
}
