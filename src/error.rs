use thiserror::Error;

use crate::job::record::JobStatus;

/// Failures talking to the queue / key-value broker.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Malformed message {id}: {reason}")]
    Malformed { id: String, reason: String },

    #[error("Unknown delivery: {0}")]
    UnknownDelivery(String),
}

/// Rejected JobRecord transitions.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RecordError {
    #[error("Cannot move job from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("Corrupt job record {key}: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Job record not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Record(#[from] RecordError),
}

/// A message that cannot become a job.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum InvalidJob {
    #[error("missing jobid header")]
    MissingJobId,

    #[error("jobid {0:?} is not alphanumeric")]
    BadJobId(String),

    #[error("neither a file payload nor a command")]
    Empty,

    #[error("command body is not valid UTF-8")]
    NotUtf8,

    #[error("filename {0:?} is not a plain file name")]
    BadFilename(String),

    #[error("unknown upload mode {0:?}")]
    BadUploadMode(String),

    #[error("unsupported message version {0:?}")]
    BadVersion(String),

    #[error("{0}")]
    Validation(String),
}

/// Payload staging and command synthesis failures. All of them abort the job
/// before it reaches `running`.
#[derive(Error, Debug)]
pub enum StageError {
    #[error("sandbox {0} already exists")]
    SandboxExists(String),

    #[error("payload type {0} is unsupported")]
    Unsupported(String),

    #[error("entry file {0} is not found")]
    MissingEntry(String),

    #[error("entry file {0:?} escapes the sandbox")]
    BadEntry(String),

    #[error("zip archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Remote file store failures.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{method} {path} failed with status {status}")]
    Status {
        method: &'static str,
        path: String,
        status: u16,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("zip archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("checksum mismatch for {path}: local {local}, remote {remote}")]
    ChecksumMismatch {
        path: String,
        local: String,
        remote: String,
    },

    #[error("Invalid remote store configuration: {0}")]
    Config(String),
}

/// Everything that can end the processing of a single message.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("invalid job: {0}")]
    Invalid(#[from] InvalidJob),

    #[error("job aborted: {0}")]
    Aborted(#[from] StageError),

    #[error("job store error: {0}")]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures submitting a job.
#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("nothing to submit: give a file or a command")]
    NothingToSubmit,

    #[error("file {path} not found")]
    FileNotFound { path: String },

    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Invalid(#[from] InvalidJob),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}
