//! Job message schema and the persisted status record.

pub mod message;
pub mod record;
pub mod store;

pub use message::{Body, JobMessage, MessageDefaults, RemoteStore, UploadMode};
pub use record::{JobRecord, JobStatus};
pub use store::JobRecordStore;
