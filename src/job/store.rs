use std::sync::Arc;

use tracing::debug;

use super::record::JobRecord;
use crate::broker::Broker;
use crate::error::StoreError;

/// Accessor for JobRecord documents kept in the broker's key-value store.
#[derive(Clone)]
pub struct JobRecordStore {
    broker: Arc<dyn Broker>,
}

impl JobRecordStore {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Store key for a job on a queue.
    pub fn key(jobid: &str, queue: &str) -> String {
        format!("{}@{}", jobid, queue)
    }

    pub async fn put(&self, jobid: &str, queue: &str, record: &JobRecord) -> Result<(), StoreError> {
        let key = Self::key(jobid, queue);
        let doc = serde_json::to_vec(record).map_err(|source| StoreError::Corrupt {
            key: key.clone(),
            source,
        })?;
        debug!(key = %key, status = %record.status, "Writing job record");
        self.broker.put(&key, &doc).await?;
        Ok(())
    }

    pub async fn get(&self, jobid: &str, queue: &str) -> Result<Option<JobRecord>, StoreError> {
        let key = Self::key(jobid, queue);
        match self.broker.get(&key).await? {
            Some(doc) => serde_json::from_slice(&doc)
                .map(Some)
                .map_err(|source| StoreError::Corrupt { key, source }),
            None => Ok(None),
        }
    }

    /// Like [`get`](Self::get) but a missing record is an error.
    pub async fn load(&self, jobid: &str, queue: &str) -> Result<JobRecord, StoreError> {
        self.get(jobid, queue)
            .await?
            .ok_or_else(|| StoreError::NotFound(Self::key(jobid, queue)))
    }
}
