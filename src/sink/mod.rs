//! Remote file store that receives job output.
//!
//! [`ResultSink`] is the put/mkdir surface the result stager needs;
//! [`SinkProvider`] builds one per job because every message may carry its
//! own connection overrides.

pub mod retry;
pub mod webdav;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::SinkError;
use crate::job::RemoteStore;

pub use retry::RetryPolicy;
pub use webdav::{WebDavProvider, WebDavSink};

/// Result of a single directory creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MkdirOutcome {
    Created,
    AlreadyExists,
    MissingParent,
}

/// What the store reported about an upload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReceipt {
    /// Lowercase hex SHA-256 of the stored content, when the store returns one.
    pub sha256: Option<String>,
}

#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Create one directory level. Parents are not created implicitly.
    async fn mkdir(&self, remote: &str) -> Result<MkdirOutcome, SinkError>;

    async fn upload(&self, local: &Path, remote: &str) -> Result<UploadReceipt, SinkError>;
}

pub trait SinkProvider: Send + Sync {
    fn sink_for(&self, store: &RemoteStore) -> Result<Arc<dyn ResultSink>, SinkError>;
}

/// Create `remote` and, when its parent is missing, every ancestor first.
pub async fn ensure_dir(sink: &dyn ResultSink, remote: &str) -> Result<(), SinkError> {
    let remote = remote.trim_matches('/');
    if remote.is_empty() {
        return Ok(());
    }
    match sink.mkdir(remote).await? {
        MkdirOutcome::Created | MkdirOutcome::AlreadyExists => Ok(()),
        MkdirOutcome::MissingParent => {
            let parts: Vec<&str> = remote.split('/').filter(|p| !p.is_empty()).collect();
            for depth in 1..=parts.len() {
                let prefix = parts[..depth].join("/");
                if sink.mkdir(&prefix).await? == MkdirOutcome::MissingParent {
                    return Err(SinkError::Status {
                        method: "MKCOL",
                        path: prefix,
                        status: 409,
                    });
                }
            }
            Ok(())
        }
    }
}

/// Join remote path segments with single slashes.
pub fn join_remote(parts: &[&str]) -> String {
    parts
        .iter()
        .flat_map(|p| p.split('/'))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}
