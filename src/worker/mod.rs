//! Worker-side job execution pipeline.
//!
//! A message pulled from the broker goes through, in order:
//!
//! 1. [`stager`]: write the payload into a fresh sandbox and classify it
//! 2. [`command`]: decide what to run, without running it
//! 3. [`executor`]: run it with the scheduler environment, persisting
//!    `running` and `finished`
//! 4. [`results`]: ship the sandbox to the remote store
//!
//! [`JobWorker`] drives the loop around it: fetch, acknowledge, process,
//! repeat until `max_jobs` or a shutdown signal.

pub mod command;
pub mod executor;
pub mod job_worker;
pub mod results;
pub mod stager;

pub use command::JobCommand;
pub use executor::{ExecutionOutcome, JobContext, SandboxExecutor};
pub use job_worker::{JobWorker, Outcome};
pub use results::{Destination, ResultStager, UploadReport};
pub use stager::{PayloadKind, Sandbox, StagedPayload};
