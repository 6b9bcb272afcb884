use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use pkbs::broker::{Broker, Headers, MemoryBroker};
use pkbs::config::{AckPolicy, WorkerConfig};
use pkbs::dispatch::{Dispatcher, SubmitRequest};
use pkbs::error::SinkError;
use pkbs::job::message::header;
use pkbs::job::{JobRecord, JobRecordStore, JobStatus, MessageDefaults, RemoteStore, UploadMode};
use pkbs::sink::{MkdirOutcome, ResultSink, RetryPolicy, SinkProvider, UploadReceipt};
use pkbs::status::StatusReporter;
use pkbs::worker::{Destination, JobWorker, Outcome, ResultStager, UploadReport};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Op {
    Mkdir(String),
    Upload(String),
}

/// Result store double that behaves like a WebDAV tree and records every call.
#[derive(Clone, Default)]
struct RecordingSink {
    ops: Arc<Mutex<Vec<Op>>>,
    dirs: Arc<Mutex<Vec<String>>>,
    files: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    attempts: Arc<Mutex<Vec<String>>>,
    /// Remote path suffixes whose uploads fail, and how many more times.
    failing: Arc<Mutex<Vec<(String, u32)>>>,
    /// Report a checksum that never matches the uploaded file.
    wrong_checksum: bool,
}

impl RecordingSink {
    fn ops(&self) -> Vec<Op> {
        self.ops.lock().unwrap().clone()
    }

    fn fail_uploads(&self, suffix: &str, times: u32) {
        self.failing.lock().unwrap().push((suffix.to_string(), times));
    }

    fn attempts(&self, remote: &str) -> usize {
        self.attempts.lock().unwrap().iter().filter(|r| *r == remote).count()
    }

    fn file(&self, remote: &str) -> Option<Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .iter()
            .find(|(path, _)| path == remote)
            .map(|(_, data)| data.clone())
    }
}

#[async_trait]
impl ResultSink for RecordingSink {
    async fn mkdir(&self, remote: &str) -> Result<MkdirOutcome, SinkError> {
        self.ops.lock().unwrap().push(Op::Mkdir(remote.to_string()));
        let mut dirs = self.dirs.lock().unwrap();
        if dirs.iter().any(|d| d == remote) {
            return Ok(MkdirOutcome::AlreadyExists);
        }
        if let Some((parent, _)) = remote.rsplit_once('/') {
            if !dirs.iter().any(|d| d == parent) {
                return Ok(MkdirOutcome::MissingParent);
            }
        }
        dirs.push(remote.to_string());
        Ok(MkdirOutcome::Created)
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<UploadReceipt, SinkError> {
        self.attempts.lock().unwrap().push(remote.to_string());
        if let Some((_, left)) = self
            .failing
            .lock()
            .unwrap()
            .iter_mut()
            .find(|(suffix, left)| *left > 0 && remote.ends_with(suffix.as_str()))
        {
            *left -= 1;
            return Err(SinkError::Status {
                method: "PUT",
                path: remote.to_string(),
                status: 503,
            });
        }
        let data = std::fs::read(local)?;
        self.ops.lock().unwrap().push(Op::Upload(remote.to_string()));
        self.files.lock().unwrap().push((remote.to_string(), data));
        Ok(UploadReceipt {
            sha256: self.wrong_checksum.then(|| "0".repeat(64)),
        })
    }
}

struct RecordingProvider(RecordingSink);

impl SinkProvider for RecordingProvider {
    fn sink_for(&self, _: &RemoteStore) -> Result<Arc<dyn ResultSink>, SinkError> {
        Ok(Arc::new(self.0.clone()))
    }
}

struct Harness {
    dir: tempfile::TempDir,
    broker: Arc<MemoryBroker>,
    sink: RecordingSink,
    config: WorkerConfig,
}

impl Harness {
    fn new() -> Self {
        Self::with_broker(MemoryBroker::new())
    }

    fn with_broker(broker: MemoryBroker) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = WorkerConfig {
            sandbox_root: dir.path().join("sandbox"),
            scratch_root: dir.path().join("scratch"),
            node: "node-1".to_string(),
            fetch_timeout: Duration::from_millis(50),
            ..WorkerConfig::default()
        };
        Self {
            dir,
            broker: Arc::new(broker),
            sink: RecordingSink::default(),
            config,
        }
    }

    fn worker(&self, max_jobs: u64) -> JobWorker {
        let config = WorkerConfig {
            max_jobs: Some(max_jobs),
            ..self.config.clone()
        };
        JobWorker::new(
            self.broker.clone(),
            Arc::new(RecordingProvider(self.sink.clone())),
            MessageDefaults::default(),
            config,
        )
    }

    async fn run(&self, max_jobs: u64) -> u64 {
        let (_tx, rx) = watch::channel(false);
        self.worker(max_jobs).run(rx).await
    }

    async fn submit(&self, request: SubmitRequest) -> String {
        Dispatcher::new(self.broker.clone(), MessageDefaults::default())
            .submit("jobs", request)
            .await
            .unwrap()
    }

    async fn submit_file(&self, name: &str, data: &[u8], request: SubmitRequest) -> String {
        let path = self.dir.path().join(name);
        std::fs::write(&path, data).unwrap();
        self.submit(SubmitRequest {
            file: Some(path),
            ..request
        })
        .await
    }

    async fn record(&self, jobid: &str) -> JobRecord {
        JobRecordStore::new(self.broker.clone())
            .load(jobid, "jobs")
            .await
            .unwrap()
    }

    fn sandbox_is_empty(&self) -> bool {
        dir_is_empty(&self.config.sandbox_root)
    }

    fn scratch_is_empty(&self) -> bool {
        dir_is_empty(&self.config.scratch_root)
    }
}

fn dir_is_empty(path: &Path) -> bool {
    match std::fs::read_dir(path) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => true,
    }
}

/// Sandbox-like directory holding `files`, for driving the result stager directly.
fn sandbox_with(files: &[(&str, &str)]) -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let sandbox = dir.path().join("Job1");
    for (name, body) in files {
        let path = sandbox.join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }
    (dir, sandbox)
}

fn destination() -> Destination<'static> {
    Destination {
        jobid: "Job1",
        name: "qsub",
        path: "pkbs",
        fixed_path: None,
    }
}

fn zip_bytes(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    {
        let mut zip = zip::ZipWriter::new(&mut buf);
        let options = zip::write::SimpleFileOptions::default();
        for (name, body) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(body.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }
    buf.into_inner()
}

fn command(line: &str) -> SubmitRequest {
    SubmitRequest {
        command: Some(line.to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn inline_echo_finishes_with_exit_code_zero() {
    let h = Harness::new();
    let jobid = h.submit(command("echo hi")).await;

    assert_eq!(h.run(1).await, 1);

    let record = h.record(&jobid).await;
    assert_eq!(record.status, JobStatus::Finished);
    assert_eq!(record.exit_code, Some(0));
    assert_eq!(record.node.as_deref(), Some("node-1"));
    let started = record.started.unwrap();
    let finished = record.finished.unwrap();
    let wallclock = record.wallclock.unwrap();
    assert!(record.queued.unwrap() <= started);
    assert!(wallclock >= 0.0);
    assert!((wallclock - (finished - started)).abs() < 1.0);
    // Inline jobs are not staged, so nothing is uploaded.
    assert!(h.sink.ops().is_empty());
    assert!(h.scratch_is_empty());
}

#[tokio::test]
async fn inline_exit_status_and_environment_are_propagated() {
    let h = Harness::new();
    let env_check = h
        .submit(command(
            "test -n \"$PBS_JOBID\" && test \"$PBS_QUEUE\" = jobs && test \"$PBS_JOBNAME\" = qsub \
             && test -d \"$TMPDIR\" && test \"$NCPUS\" = 1 && test \"$PBS_NP\" = 1 \
             && test \"$(cat \"$PBS_NODEFILE\")\" = node-1",
        ))
        .await;
    let failing = h.submit(command("exit 7")).await;
    let killed = h.submit(command("kill -9 $$")).await;

    assert_eq!(h.run(3).await, 3);

    assert_eq!(h.record(&env_check).await.exit_code, Some(0));
    assert_eq!(h.record(&failing).await.exit_code, Some(7));
    assert_eq!(h.record(&killed).await.exit_code, Some(137));
}

#[tokio::test]
async fn script_without_shebang_exits_three_and_ships_a_zip() {
    let h = Harness::new();
    let jobid = h
        .submit_file("run.sh", b"echo out\necho err >&2\nexit 3\n", SubmitRequest::default())
        .await;

    assert_eq!(h.run(1).await, 1);

    let record = h.record(&jobid).await;
    assert_eq!(record.status, JobStatus::Finished);
    assert_eq!(record.exit_code, Some(3));

    let remote = format!("pkbs/qsub-{}.zip", jobid);
    assert_eq!(
        h.sink.ops(),
        vec![Op::Mkdir("pkbs".to_string()), Op::Upload(remote.clone())]
    );

    let data = h.sink.file(&remote).unwrap();
    let mut archive = zip::ZipArchive::new(Cursor::new(data)).unwrap();
    let mut stdout = String::new();
    std::io::Read::read_to_string(
        &mut archive.by_name(&format!("{}/stdout.txt", jobid)).unwrap(),
        &mut stdout,
    )
    .unwrap();
    assert_eq!(stdout, "out\n");
    assert!(archive.by_name(&format!("{}/stderr.txt", jobid)).is_ok());
    assert!(archive.by_name(&format!("{}/run.sh", jobid)).is_ok());

    assert!(h.sandbox_is_empty());
}

#[tokio::test]
async fn archive_without_entry_point_stays_queued() {
    let h = Harness::new();
    let jobid = h
        .submit_file("bundle.zip", &zip_bytes(&[("notes.txt", "hi")]), SubmitRequest::default())
        .await;

    let delivery = h
        .broker
        .fetch("jobs", Duration::from_millis(50))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(h.worker(1).process(delivery).await, Outcome::Aborted);

    let record = h.record(&jobid).await;
    assert_eq!(record.status, JobStatus::Queued);
    assert!(record.started.is_none());
    assert!(record.node.is_none());
    assert!(h.sink.ops().is_empty());
    assert!(h.sandbox_is_empty());
}

#[tokio::test]
async fn unsupported_payload_is_aborted() {
    let h = Harness::new();
    let jobid = h
        .submit_file("blob.bin", &[0x7f, b'E', b'L', b'F', 0, 1, 2], SubmitRequest::default())
        .await;

    assert_eq!(h.run(1).await, 1);

    assert_eq!(h.record(&jobid).await.status, JobStatus::Queued);
    assert!(h.sandbox_is_empty());
}

#[tokio::test]
async fn archive_command_is_made_executable_and_run() {
    let h = Harness::new();
    // Zip entries written by ZipWriter carry no executable bit.
    let bundle = zip_bytes(&[("bin/go", "#!/bin/sh\necho ran > marker\nexit 5\n")]);
    let jobid = h
        .submit_file(
            "bundle.zip",
            &bundle,
            SubmitRequest {
                command: Some("bin/go".to_string()),
                upload: Some(UploadMode::Files),
                ..Default::default()
            },
        )
        .await;

    assert_eq!(h.run(1).await, 1);

    assert_eq!(h.record(&jobid).await.exit_code, Some(5));
    // The entry runs from the sandbox root.
    let marker = format!("pkbs/qsub-{}/marker", jobid);
    assert_eq!(h.sink.file(&marker).unwrap(), b"ran\n");
}

#[tokio::test]
async fn files_mode_creates_directories_before_their_files() {
    let h = Harness::new();
    let bundle = zip_bytes(&[("run.sh", "exit 0\n"), ("a/b.txt", "payload")]);
    let jobid = h
        .submit_file(
            "bundle.zip",
            &bundle,
            SubmitRequest {
                upload: Some(UploadMode::Files),
                name: Some("build".to_string()),
                ..Default::default()
            },
        )
        .await;

    assert_eq!(h.run(1).await, 1);
    assert_eq!(h.record(&jobid).await.exit_code, Some(0));

    let base = format!("pkbs/build-{}", jobid);
    let ops = h.sink.ops();
    let mkdir_a = ops
        .iter()
        .position(|op| *op == Op::Mkdir(format!("{}/a", base)))
        .expect("directory a created");
    let upload_b = ops
        .iter()
        .position(|op| *op == Op::Upload(format!("{}/a/b.txt", base)))
        .expect("a/b.txt uploaded");
    assert!(mkdir_a < upload_b);

    for file in ["run.sh", "stdout.txt", "stderr.txt"] {
        assert!(h.sink.file(&format!("{}/{}", base, file)).is_some(), "{}", file);
    }
    assert_eq!(h.sink.file(&format!("{}/a/b.txt", base)).unwrap(), b"payload");
    assert!(h.sandbox_is_empty());
}

#[tokio::test]
async fn fixed_path_and_disabled_upload() {
    let h = Harness::new();
    let fixed = h
        .submit_file(
            "job.sh",
            b"echo fixed\n",
            SubmitRequest {
                fixed_path: Some("exact/dir".to_string()),
                ..Default::default()
            },
        )
        .await;
    let silent = h
        .submit_file(
            "quiet.sh",
            b"true\n",
            SubmitRequest {
                upload: Some(UploadMode::None),
                ..Default::default()
            },
        )
        .await;

    assert_eq!(h.run(2).await, 2);

    assert_eq!(h.record(&fixed).await.exit_code, Some(0));
    assert_eq!(h.record(&silent).await.exit_code, Some(0));
    let uploads: Vec<Op> = h
        .sink
        .ops()
        .into_iter()
        .filter(|op| matches!(op, Op::Upload(_)))
        .collect();
    assert_eq!(uploads, vec![Op::Upload(format!("exact/dir/qsub-{}.zip", fixed))]);
}

#[tokio::test]
async fn worker_stops_at_max_jobs() {
    let h = Harness::new();
    for _ in 0..3 {
        h.submit(command("true")).await;
    }

    assert_eq!(h.run(2).await, 2);

    let stats = h.broker.stats("jobs").await.unwrap();
    assert_eq!(stats.messages, 3);
    assert_eq!(stats.pending, 1);
}

#[tokio::test]
async fn messages_are_acknowledged_under_both_policies() {
    for policy in [AckPolicy::BeforeProcess, AckPolicy::AfterProcess] {
        let mut h = Harness::new();
        h.config.ack_policy = policy;
        h.submit(command("true")).await;

        assert_eq!(h.run(1).await, 1);
        assert!(h.broker.unacked("jobs").is_empty(), "{:?}", policy);
    }
}

#[tokio::test]
async fn invalid_message_is_dropped_without_a_record() {
    let h = Harness::new();
    let mut headers = Headers::new();
    headers.insert(header::NAME.to_string(), "orphan".to_string());
    h.broker.publish("jobs", &headers, b"echo hi").await.unwrap();

    let mut headers = Headers::new();
    headers.insert(header::JOBID.to_string(), "Empty1".to_string());
    h.broker.publish("jobs", &headers, b"   ").await.unwrap();

    assert_eq!(h.run(2).await, 2);
    assert!(JobRecordStore::new(h.broker.clone())
        .get("Empty1", "jobs")
        .await
        .unwrap()
        .is_none());
    assert!(h.broker.unacked("jobs").is_empty());
}

#[tokio::test]
async fn status_reports_finished_and_queued_jobs() {
    let h = Harness::new();
    let done = h.submit(command("exit 2")).await;
    assert_eq!(h.run(1).await, 1);
    let waiting = h.submit(command("true")).await;

    let lines = StatusReporter::new(h.broker.clone())
        .report("jobs", false)
        .await
        .unwrap();
    assert_eq!(lines[0], "jobs-stream messages 2 pending 1");

    let done_row = lines.iter().find(|l| l.starts_with(&done)).unwrap();
    assert!(done_row.contains("node-1"));
    assert!(done_row.contains("finished"));
    assert!(done_row.trim_end().ends_with('2'));

    let waiting_row = lines.iter().find(|l| l.starts_with(&waiting)).unwrap();
    assert!(waiting_row.contains("queued"));
    assert!(waiting_row.contains("--:--:--"));
    assert!(waiting_row.ends_with("N/A"));
}

#[tokio::test]
async fn job_that_cannot_start_finishes_with_127_and_leaves_no_scratch_files() {
    let h = Harness::new();
    // A directory where the stdout capture file goes makes the launch fail.
    let bundle = zip_bytes(&[("run.sh", "exit 0\n"), ("stdout.txt/keep", "x")]);
    let jobid = h
        .submit_file(
            "bundle.zip",
            &bundle,
            SubmitRequest {
                upload: Some(UploadMode::None),
                ..Default::default()
            },
        )
        .await;

    assert_eq!(h.run(1).await, 1);

    let record = h.record(&jobid).await;
    assert_eq!(record.status, JobStatus::Finished);
    assert_eq!(record.exit_code, Some(127));
    assert!(h.scratch_is_empty());
    assert!(h.sandbox_is_empty());
}

#[tokio::test]
async fn one_failed_upload_does_not_block_the_others() {
    let (_dir, sandbox) = sandbox_with(&[("a/one.txt", "1"), ("two.txt", "2"), ("zz.txt", "3")]);
    let sink = RecordingSink::default();
    sink.fail_uploads("two.txt", u32::MAX);

    let report = ResultStager::default()
        .stage(&sink, UploadMode::Files, &sandbox, destination())
        .await;

    assert_eq!(report, UploadReport { uploaded: 2, failed: 1 });
    assert_eq!(sink.file("pkbs/qsub-Job1/a/one.txt").unwrap(), b"1");
    assert_eq!(sink.file("pkbs/qsub-Job1/zz.txt").unwrap(), b"3");
    assert!(sink.file("pkbs/qsub-Job1/two.txt").is_none());
}

#[tokio::test]
async fn upload_is_retried_until_it_succeeds() {
    let (_dir, sandbox) = sandbox_with(&[("stdout.txt", "out\n")]);
    let sink = RecordingSink::default();
    sink.fail_uploads("stdout.txt", 1);
    let stager = ResultStager::new(RetryPolicy {
        max_retries: 1,
        backoff: Duration::from_millis(1),
    });

    let report = stager
        .stage(&sink, UploadMode::Files, &sandbox, destination())
        .await;

    assert_eq!(report, UploadReport { uploaded: 1, failed: 0 });
    assert_eq!(sink.attempts("pkbs/qsub-Job1/stdout.txt"), 2);
    assert_eq!(sink.file("pkbs/qsub-Job1/stdout.txt").unwrap(), b"out\n");
}

#[tokio::test]
async fn checksum_mismatch_counts_as_failed_upload() {
    let (_dir, sandbox) = sandbox_with(&[("stdout.txt", "out\n")]);
    let sink = RecordingSink {
        wrong_checksum: true,
        ..Default::default()
    };

    let report = ResultStager::default()
        .stage(&sink, UploadMode::Zip, &sandbox, destination())
        .await;

    assert_eq!(report, UploadReport { uploaded: 0, failed: 1 });
}

#[tokio::test]
async fn checksum_mismatch_does_not_change_the_job_result() {
    let mut h = Harness::new();
    h.sink.wrong_checksum = true;
    let jobid = h
        .submit_file("run.sh", b"echo hi\nexit 6\n", SubmitRequest::default())
        .await;

    assert_eq!(h.run(1).await, 1);

    let record = h.record(&jobid).await;
    assert_eq!(record.status, JobStatus::Finished);
    assert_eq!(record.exit_code, Some(6));
    assert_eq!(h.sink.attempts(&format!("pkbs/qsub-{}.zip", jobid)), 1);
    assert!(h.sandbox_is_empty());
}

#[tokio::test]
async fn job_interrupted_mid_run_is_run_again_on_redelivery() {
    let mut h = Harness::with_broker(MemoryBroker::new().with_claim_idle(Duration::ZERO));
    h.config.ack_policy = AckPolicy::AfterProcess;
    let jobid = h
        .submit_file(
            "job.sh",
            b"exit 4\n",
            SubmitRequest {
                upload: Some(UploadMode::None),
                ..Default::default()
            },
        )
        .await;

    // Another worker took the message, marked it running and died.
    let lost = h
        .broker
        .fetch("jobs", Duration::from_millis(50))
        .await
        .unwrap()
        .unwrap();
    let store = JobRecordStore::new(h.broker.clone());
    let mut record = store.load(&jobid, "jobs").await.unwrap();
    record.start("dead-node", record.queued.unwrap()).unwrap();
    store.put(&jobid, "jobs", &record).await.unwrap();
    let stale = h.config.sandbox_root.join(&jobid);
    std::fs::create_dir_all(&stale).unwrap();
    std::fs::write(stale.join("job.sh"), "partial").unwrap();
    assert_eq!(h.broker.unacked("jobs"), vec![lost.id.clone()]);

    assert_eq!(h.run(1).await, 1);

    let record = h.record(&jobid).await;
    assert_eq!(record.status, JobStatus::Finished);
    assert_eq!(record.exit_code, Some(4));
    assert_eq!(record.node.as_deref(), Some("node-1"));
    assert!(h.broker.unacked("jobs").is_empty());
    assert!(h.sandbox_is_empty());
}

#[tokio::test]
async fn finished_job_is_not_run_twice_on_redelivery() {
    let mut h = Harness::with_broker(MemoryBroker::new().with_claim_idle(Duration::ZERO));
    h.config.ack_policy = AckPolicy::AfterProcess;
    let jobid = h.submit(command("exit 9")).await;

    // Finished, but the worker died before acknowledging.
    let delivery = h
        .broker
        .fetch("jobs", Duration::from_millis(50))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(h.worker(1).process(delivery).await, Outcome::Finished(9));
    let finished = h.record(&jobid).await;

    assert_eq!(h.run(1).await, 1);

    assert_eq!(h.record(&jobid).await, finished);
    assert!(h.broker.unacked("jobs").is_empty());
}
