use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::broker::DEFAULT_CLAIM_IDLE;
use crate::job::{MessageDefaults, RemoteStore, UploadMode};
use crate::sink::RetryPolicy;

/// When the worker acknowledges a message relative to processing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckPolicy {
    /// Ack as soon as the message is received. A crash mid-job loses it.
    #[default]
    BeforeProcess,
    /// Ack once processing returns. A crash mid-job leaves it pending until
    /// another worker claims it after the claim idle time.
    AfterProcess,
}

impl FromStr for AckPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "before" => Ok(AckPolicy::BeforeProcess),
            "after" => Ok(AckPolicy::AfterProcess),
            other => Err(format!("ACK_POLICY must be 'before' or 'after', got {:?}", other)),
        }
    }
}

/// Settings for one worker process.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Queue to consume.
    pub queue: String,

    /// Stop after this many messages. `None` runs until signalled.
    pub max_jobs: Option<u64>,

    /// Parent directory of per-job sandboxes.
    /// Default: /var/tmp/pkbs
    pub sandbox_root: PathBuf,

    /// Parent directory of per-job temp dirs and node files.
    /// Default: the system temp dir
    pub scratch_root: PathBuf,

    /// Identity written into `node` of running jobs.
    pub node: String,

    /// CPU count advertised to jobs.
    pub ncpus: u32,

    /// Bounded wait of a single fetch.
    pub fetch_timeout: Duration,

    pub ack_policy: AckPolicy,

    pub retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue: "jobs".to_string(),
            max_jobs: None,
            sandbox_root: PathBuf::from("/var/tmp/pkbs"),
            scratch_root: env::temp_dir(),
            node: "localhost".to_string(),
            ncpus: 1,
            fetch_timeout: Duration::from_secs(10),
            ack_policy: AckPolicy::BeforeProcess,
            retry: RetryPolicy::default(),
        }
    }
}

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Queue server address
    /// Format: redis://[:PASSWORD@]HOST:PORT[/DB]
    pub queue_server: String,

    /// Key-value namespace for job records
    pub bucket: String,

    /// Idle time after which an unacknowledged delivery is claimed by another worker
    pub claim_idle: Duration,

    /// Directory for rotated log files; console only when unset
    pub log_dir: Option<PathBuf>,

    /// Bind address of the worker health server; disabled when unset
    pub health_addr: Option<String>,

    /// Header fallbacks for incoming and outgoing messages
    pub defaults: MessageDefaults,

    pub worker: WorkerConfig,
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// All variables are optional:
    /// - QUEUE_SERVER: broker address (default: redis://127.0.0.1:6379)
    /// - QUEUE_BUCKET: key-value namespace (default: qstat)
    /// - CLAIM_IDLE_SECS: redelivery of unacknowledged jobs (default: 3600)
    /// - SANDBOX_ROOT, SCRATCH_ROOT, WORKER_NODE, WORKER_NCPUS
    /// - FETCH_TIMEOUT_SECS, ACK_POLICY, UPLOAD_RETRIES, UPLOAD_BACKOFF_MS
    /// - WEBDAV_UPLOAD, WEBDAV_PATH, WEBDAV_HOSTNAME, WEBDAV_ROOT,
    ///   WEBDAV_LOGIN, WEBDAV_PASSWORD, WEBDAV_INSECURE
    /// - HEALTH_ADDR, LOG_DIR
    pub fn from_env() -> Result<Self, String> {
        // Load .env file if it exists
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        fn parsed<T: FromStr>(key: &str, value: Option<String>, default: T) -> Result<T, String> {
            match value {
                Some(v) => v
                    .trim()
                    .parse()
                    .map_err(|_| format!("{} has an invalid value: {:?}", key, v)),
                None => Ok(default),
            }
        }

        let worker_defaults = WorkerConfig::default();
        let retry_defaults = RetryPolicy::default();

        let upload = match var("WEBDAV_UPLOAD") {
            Some(mode) => mode
                .parse::<UploadMode>()
                .map_err(|_| format!("WEBDAV_UPLOAD must be none, files or zip, got {:?}", mode))?,
            None => UploadMode::Zip,
        };

        let remote_defaults = RemoteStore::default();
        let remote = RemoteStore {
            hostname: var("WEBDAV_HOSTNAME").unwrap_or(remote_defaults.hostname),
            root: var("WEBDAV_ROOT").unwrap_or(remote_defaults.root),
            login: var("WEBDAV_LOGIN").unwrap_or(remote_defaults.login),
            password: var("WEBDAV_PASSWORD").unwrap_or(remote_defaults.password),
            insecure: var("WEBDAV_INSECURE")
                .map(|v| v.trim() == "1")
                .unwrap_or(remote_defaults.insecure),
        };

        let defaults = MessageDefaults {
            path: var("WEBDAV_PATH").unwrap_or_else(|| "pkbs".to_string()),
            upload,
            remote,
            ..MessageDefaults::default()
        };

        let worker = WorkerConfig {
            sandbox_root: var("SANDBOX_ROOT")
                .map(PathBuf::from)
                .unwrap_or(worker_defaults.sandbox_root),
            scratch_root: var("SCRATCH_ROOT")
                .map(PathBuf::from)
                .unwrap_or(worker_defaults.scratch_root),
            node: var("WORKER_NODE").unwrap_or_else(hostname),
            ncpus: parsed("WORKER_NCPUS", var("WORKER_NCPUS"), worker_defaults.ncpus)?,
            fetch_timeout: Duration::from_secs(parsed(
                "FETCH_TIMEOUT_SECS",
                var("FETCH_TIMEOUT_SECS"),
                worker_defaults.fetch_timeout.as_secs(),
            )?),
            ack_policy: match var("ACK_POLICY") {
                Some(v) => v.parse()?,
                None => worker_defaults.ack_policy,
            },
            retry: RetryPolicy {
                max_retries: parsed("UPLOAD_RETRIES", var("UPLOAD_RETRIES"), retry_defaults.max_retries)?,
                backoff: Duration::from_millis(parsed(
                    "UPLOAD_BACKOFF_MS",
                    var("UPLOAD_BACKOFF_MS"),
                    retry_defaults.backoff.as_millis() as u64,
                )?),
            },
            ..worker_defaults
        };

        Ok(Config {
            queue_server: var("QUEUE_SERVER").unwrap_or_else(|| "redis://127.0.0.1:6379".to_string()),
            bucket: var("QUEUE_BUCKET").unwrap_or_else(|| "qstat".to_string()),
            claim_idle: Duration::from_secs(parsed(
                "CLAIM_IDLE_SECS",
                var("CLAIM_IDLE_SECS"),
                DEFAULT_CLAIM_IDLE.as_secs(),
            )?),
            log_dir: var("LOG_DIR").map(PathBuf::from),
            health_addr: var("HEALTH_ADDR"),
            defaults,
            worker,
        })
    }
}

/// Kernel hostname, falling back to `$HOSTNAME` and then `localhost`.
pub fn hostname() -> String {
    ["/proc/sys/kernel/hostname", "/etc/hostname"]
        .iter()
        .find_map(|path| std::fs::read_to_string(path).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "localhost".to_string())
}
