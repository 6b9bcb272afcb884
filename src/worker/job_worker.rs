use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

use super::command;
use super::executor::{JobContext, SandboxExecutor};
use super::results::{Destination, ResultStager};
use super::stager::{self, StagedPayload};
use crate::broker::{Broker, BrokerEvent, Delivery};
use crate::config::{AckPolicy, WorkerConfig};
use crate::error::{JobError, StoreError};
use crate::job::{Body, JobMessage, JobRecordStore, JobStatus, MessageDefaults, UploadMode};
use crate::sink::SinkProvider;

/// Pause after a failed fetch before trying again.
const FETCH_ERROR_PAUSE: Duration = Duration::from_secs(1);

/// How one message ended, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The job ran; its record is `finished` with this exit code.
    Finished(i32),
    /// The message was invalid and discarded before any transition.
    Dropped,
    /// Staging or synthesis failed; the record stays `queued`.
    Aborted,
    /// The record store or local filesystem failed mid-job.
    Failed,
}

/// Pull-based worker processing one job at a time.
pub struct JobWorker {
    broker: Arc<dyn Broker>,
    store: JobRecordStore,
    executor: SandboxExecutor,
    results: ResultStager,
    sinks: Arc<dyn SinkProvider>,
    defaults: MessageDefaults,
    config: WorkerConfig,
}

impl JobWorker {
    pub fn new(
        broker: Arc<dyn Broker>,
        sinks: Arc<dyn SinkProvider>,
        defaults: MessageDefaults,
        config: WorkerConfig,
    ) -> Self {
        let store = JobRecordStore::new(broker.clone());
        let executor = SandboxExecutor::new(
            store.clone(),
            config.node.clone(),
            config.ncpus,
            config.scratch_root.clone(),
        );
        Self {
            broker,
            store,
            executor,
            results: ResultStager::new(config.retry),
            sinks,
            defaults,
            config,
        }
    }

    /// Run until `max_jobs` messages were processed or `shutdown` flips to
    /// true. A job in flight always runs to completion first.
    ///
    /// Returns the number of processed messages.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> u64 {
        let queue = self.config.queue.as_str();
        let mut events = self.broker.events();
        let mut processed: u64 = 0;

        info!(
            queue,
            node = %self.config.node,
            ack = ?self.config.ack_policy,
            max_jobs = ?self.config.max_jobs,
            "Worker started"
        );

        loop {
            if let Some(max) = self.config.max_jobs {
                if processed >= max {
                    info!(processed, "Reached the job limit, stopping");
                    break;
                }
            }
            if *shutdown.borrow() {
                info!("Shutdown requested, stopping");
                break;
            }
            drain_events(&mut events);

            let fetched = tokio::select! {
                fetched = self.broker.fetch(queue, self.config.fetch_timeout) => fetched,
                _ = shutdown.changed() => {
                    info!("Shutdown requested while waiting for a job, stopping");
                    break;
                }
            };

            let delivery = match fetched {
                Ok(Some(delivery)) => delivery,
                Ok(None) => continue,
                Err(e) => {
                    error!(queue, error = %e, "Fetch failed");
                    sleep(FETCH_ERROR_PAUSE).await;
                    continue;
                }
            };

            let id = delivery.id.clone();
            if self.config.ack_policy == AckPolicy::BeforeProcess {
                self.acknowledge(&id).await;
            }

            let outcome = self.process(delivery).await;
            info!(id = %id, outcome = ?outcome, "Message processed");

            if self.config.ack_policy == AckPolicy::AfterProcess {
                self.acknowledge(&id).await;
            }
            processed += 1;
        }

        info!(processed, "Worker stopped");
        processed
    }

    async fn acknowledge(&self, id: &str) {
        let queue = self.config.queue.as_str();
        if let Err(e) = self.broker.ack(queue, id).await {
            error!(queue, id, error = %e, "Acknowledge failed");
            return;
        }
        match self.broker.stats(queue).await {
            Ok(stats) => info!(queue, id, pending = stats.pending, "Acknowledged"),
            Err(e) => warn!(queue, id, error = %e, "Acknowledged, pending count unavailable"),
        }
    }

    /// Run one delivery through the pipeline. Never fails: every error is
    /// classified and logged.
    pub async fn process(&self, delivery: Delivery) -> Outcome {
        match self.try_process(delivery).await {
            Ok(exit_code) => Outcome::Finished(exit_code),
            Err(JobError::Invalid(e)) => {
                warn!(error = %e, "Invalid job dropped");
                Outcome::Dropped
            }
            Err(JobError::Aborted(e)) => {
                error!(error = %e, "Job aborted before execution");
                Outcome::Aborted
            }
            Err(e) => {
                error!(error = %e, "Job failed");
                Outcome::Failed
            }
        }
    }

    async fn try_process(&self, delivery: Delivery) -> Result<i32, JobError> {
        let redelivered = delivery.redelivered;
        let mut msg = JobMessage::from_headers(&delivery.headers, delivery.payload, &self.defaults)?;
        info!(jobid = %msg.jobid, name = %msg.name, upload = %msg.upload, redelivered, "Processing job");

        if redelivered {
            if let Some(exit_code) = self.recover(&msg).await? {
                return Ok(exit_code);
            }
        }

        let staged: Option<StagedPayload> = match &mut msg.body {
            Body::File { filename, data } => Some(
                stager::stage(
                    &self.config.sandbox_root,
                    &msg.jobid,
                    filename,
                    std::mem::take(data),
                )
                .await?,
            ),
            Body::Inline(_) => None,
        };

        let inline = match &msg.body {
            Body::Inline(text) => Some(text.as_str()),
            Body::File { .. } => None,
        };
        let job_command = command::synthesize(
            inline,
            staged
                .as_ref()
                .map(|s| (s.sandbox.path(), s.filename.as_str(), s.kind)),
            msg.command.as_deref(),
        )?;

        let job = JobContext {
            jobid: &msg.jobid,
            name: &msg.name,
            queue: &self.config.queue,
        };
        let outcome = self.executor.execute(job, &job_command).await?;

        if let Some(staged) = staged {
            self.stage_results(&msg, &staged).await;
            // Sandbox removed here.
            drop(staged);
        }
        Ok(outcome.exit_code)
    }

    /// Undo what an attempt that died before acknowledging left behind.
    /// Returns the exit code when that attempt already finished the job.
    async fn recover(&self, msg: &JobMessage) -> Result<Option<i32>, JobError> {
        let queue = self.config.queue.as_str();
        if let Some(mut record) = self.store.get(&msg.jobid, queue).await? {
            match record.status {
                JobStatus::Finished => {
                    info!(jobid = %msg.jobid, "Redelivered job already finished, not running it again");
                    return Ok(Some(record.exit_code.unwrap_or_default()));
                }
                JobStatus::Running => {
                    warn!(
                        jobid = %msg.jobid,
                        node = ?record.node,
                        "Job was left running by an interrupted attempt, queueing it again"
                    );
                    record.requeue().map_err(StoreError::from)?;
                    self.store.put(&msg.jobid, queue, &record).await?;
                }
                JobStatus::Queued => {}
            }
        }
        stager::discard_stale(&self.config.sandbox_root, &msg.jobid)?;
        Ok(None)
    }

    async fn stage_results(&self, msg: &JobMessage, staged: &StagedPayload) {
        if msg.upload == UploadMode::None {
            info!(jobid = %msg.jobid, "Upload disabled, nothing to stage");
            return;
        }
        let sink = match self.sinks.sink_for(&msg.remote) {
            Ok(sink) => sink,
            Err(e) => {
                error!(jobid = %msg.jobid, error = %e, "Cannot reach the result store");
                return;
            }
        };
        let dest = Destination {
            jobid: &msg.jobid,
            name: &msg.name,
            path: &msg.path,
            fixed_path: msg.fixed_path.as_deref(),
        };
        self.results
            .stage(sink.as_ref(), msg.upload, staged.sandbox.path(), dest)
            .await;
    }
}

fn drain_events(events: &mut broadcast::Receiver<BrokerEvent>) {
    loop {
        match events.try_recv() {
            Ok(BrokerEvent::Connected(addr)) => info!(addr = %addr, "Broker connected"),
            Ok(BrokerEvent::Reconnected(addr)) => info!(addr = %addr, "Broker reconnected"),
            Ok(BrokerEvent::Error(e)) => warn!(error = %e, "Broker connection error"),
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                warn!(skipped, "Missed broker events")
            }
            Err(_) => break,
        }
    }
}
