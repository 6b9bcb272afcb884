use std::path::PathBuf;
use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::info;

use crate::broker::Broker;
use crate::error::SubmitError;
use crate::job::{Body, JobMessage, JobRecord, JobRecordStore, MessageDefaults, UploadMode};

/// Length of generated job ids.
pub const JOBID_LEN: usize = 11;

/// New random alphanumeric job id.
pub fn generate_jobid() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(JOBID_LEN)
        .map(char::from)
        .collect()
}

/// What to submit. Anything left `None` takes the configured default.
#[derive(Debug, Clone, Default)]
pub struct SubmitRequest {
    /// File to ship as the payload; its base name becomes the `filename` header.
    pub file: Option<PathBuf>,
    /// Inline command, or the entry to run inside an archive when `file` is set.
    pub command: Option<String>,
    pub name: Option<String>,
    pub upload: Option<UploadMode>,
    pub path: Option<String>,
    pub fixed_path: Option<String>,
}

/// Producer side: records a job as queued, then publishes it.
pub struct Dispatcher {
    broker: Arc<dyn Broker>,
    store: JobRecordStore,
    defaults: MessageDefaults,
}

impl Dispatcher {
    pub fn new(broker: Arc<dyn Broker>, defaults: MessageDefaults) -> Self {
        let store = JobRecordStore::new(broker.clone());
        Self {
            broker,
            store,
            defaults,
        }
    }

    /// Submit a job on `queue` and return its id.
    pub async fn submit(&self, queue: &str, request: SubmitRequest) -> Result<String, SubmitError> {
        let command = request.command.filter(|c| !c.trim().is_empty());

        let (body, command) = match request.file {
            Some(path) => {
                if !path.is_file() {
                    return Err(SubmitError::FileNotFound {
                        path: path.display().to_string(),
                    });
                }
                let data = tokio::fs::read(&path).await.map_err(|source| SubmitError::Read {
                    path: path.display().to_string(),
                    source,
                })?;
                let filename = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                (Body::File { filename, data }, command)
            }
            None => match command {
                Some(command) => (Body::Inline(command), None),
                None => return Err(SubmitError::NothingToSubmit),
            },
        };

        let message = JobMessage {
            jobid: generate_jobid(),
            name: request.name.unwrap_or_else(|| self.defaults.name.clone()),
            command,
            path: request.path.unwrap_or_else(|| self.defaults.path.clone()),
            fixed_path: request.fixed_path,
            upload: request.upload.unwrap_or(self.defaults.upload),
            remote: self.defaults.remote.clone(),
            body,
        };

        // Whatever the worker would drop is rejected here instead.
        let (headers, payload) = message.to_headers();
        JobMessage::from_headers(&headers, payload.clone(), &self.defaults)?;

        self.store
            .put(&message.jobid, queue, &JobRecord::queued(message.name.as_str()))
            .await?;
        let id = self.broker.publish(queue, &headers, &payload).await?;
        info!(
            jobid = %message.jobid,
            queue,
            message_id = %id,
            filename = ?message.filename(),
            "Job submitted"
        );
        Ok(message.jobid)
    }
}
