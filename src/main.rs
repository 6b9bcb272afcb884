use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{
    filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt, Layer, Registry,
};

use pkbs::broker::{Broker, RedisBroker};
use pkbs::config::Config;
use pkbs::dispatch::{Dispatcher, SubmitRequest};
use pkbs::health::{self, HealthState};
use pkbs::job::UploadMode;
use pkbs::shutdown::{HealthServer, ShutdownCoordinator};
use pkbs::sink::WebDavProvider;
use pkbs::status::StatusReporter;
use pkbs::worker::JobWorker;

#[derive(Parser, Debug)]
#[command(name = "pkbs")]
#[command(version)]
#[command(about = "A minimal batch-job queue")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit a job and print its id
    Submit {
        /// File to run: a shell script, or a zip archive with a run.sh
        file: Option<PathBuf>,

        /// Command line to run, or the entry to execute inside an archive
        #[arg(short, long)]
        command: Option<String>,

        #[arg(short = 'N', long, default_value = "qsub")]
        name: String,

        #[arg(short, long, default_value = "jobs")]
        queue: String,

        /// One of none, files or zip
        #[arg(short, long)]
        upload: Option<UploadMode>,

        /// Destination root on the result store
        #[arg(short, long)]
        path: Option<String>,

        /// Exact destination directory, used instead of PATH/NAME-JOBID
        #[arg(short = 'P', long, alias = "path-fixed")]
        fixed_path: Option<String>,
    },

    /// Pull and run jobs
    Worker {
        #[arg(short, long, default_value = "jobs")]
        queue: String,

        /// Exit after this many messages
        #[arg(short, long)]
        max_jobs: Option<u64>,
    },

    /// Show queue counters and job states
    Status {
        #[arg(short, long, default_value = "jobs")]
        queue: String,

        /// Print full status records as JSON
        #[arg(short, long)]
        verbose: bool,
    },
}

/// Console output, plus per-level daily files when `log_dir` is set.
/// Log files are created as: logs/info.log.2024-12-22, logs/error.log.2024-12-22, etc.
fn init_tracing(log_dir: Option<&Path>) -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());

    let mut file_layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    if let Some(dir) = log_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
        for (file, level) in [
            ("info.log", LevelFilter::INFO),
            ("warn.log", LevelFilter::WARN),
            ("error.log", LevelFilter::ERROR),
            ("debug.log", LevelFilter::DEBUG),
        ] {
            file_layers.push(
                tracing_subscriber::fmt::layer()
                    .with_writer(tracing_appender::rolling::daily(dir, file))
                    .with_ansi(false)
                    .with_filter(level)
                    .boxed(),
            );
        }
    }

    // Console goes to stderr: stdout carries jobids and status tables.
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true);

    tracing_subscriber::registry()
        .with(file_layers)
        .with(env_filter)
        .with(console_layer)
        .init();
    Ok(())
}

async fn connect(config: &Config, consumer: &str) -> anyhow::Result<Arc<dyn Broker>> {
    let broker = RedisBroker::connect(&config.queue_server, &config.bucket, consumer)
        .await
        .with_context(|| format!("Cannot connect to queue server {}", config.queue_server))?;
    Ok(Arc::new(broker.with_claim_idle(config.claim_idle)))
}

async fn submit(config: &Config, queue: String, request: SubmitRequest) -> anyhow::Result<()> {
    let broker = connect(config, "pkbs-submit").await?;
    let dispatcher = Dispatcher::new(broker, config.defaults.clone());
    let jobid = dispatcher.submit(&queue, request).await?;
    println!("{}", jobid);
    Ok(())
}

async fn status(config: &Config, queue: String, verbose: bool) -> anyhow::Result<()> {
    let broker = connect(config, "pkbs-status").await?;
    let lines = StatusReporter::new(broker).report(&queue, verbose).await?;
    for line in lines {
        println!("{}", line);
    }
    Ok(())
}

async fn worker(config: Config, queue: String, max_jobs: Option<u64>) -> anyhow::Result<()> {
    let mut worker_config = config.worker.clone();
    worker_config.queue = queue;
    worker_config.max_jobs = max_jobs;

    let consumer = format!("{}-{}", worker_config.node, std::process::id());
    let broker = connect(&config, &consumer).await?;

    std::fs::create_dir_all(&worker_config.sandbox_root).with_context(|| {
        format!(
            "Cannot create sandbox root {}",
            worker_config.sandbox_root.display()
        )
    })?;

    info!("Starting pkbs worker");
    info!("Configuration loaded successfully:");
    info!("  - Queue: {}", worker_config.queue);
    info!("  - Node: {} ({} cpus)", worker_config.node, worker_config.ncpus);
    info!("  - Sandbox root: {}", worker_config.sandbox_root.display());
    info!("  - Ack policy: {:?}", worker_config.ack_policy);
    info!("  - Claim idle: {:?}", config.claim_idle);
    info!("  - Default upload: {}", config.defaults.upload);

    let health = match &config.health_addr {
        Some(addr) => {
            let server = health::serve(
                addr,
                HealthState {
                    broker: broker.clone(),
                    queue: worker_config.queue.clone(),
                },
            )
            .with_context(|| format!("Cannot bind health server on {}", addr))?;
            let handle = server.handle();
            Some(HealthServer {
                handle,
                task: tokio::spawn(server),
            })
        }
        None => None,
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let job_worker = JobWorker::new(
        broker,
        Arc::new(WebDavProvider),
        config.defaults.clone(),
        worker_config,
    );
    let worker_task = tokio::spawn(async move { job_worker.run(shutdown_rx).await });

    ShutdownCoordinator::new(worker_task, shutdown_tx, health)
        .wait_for_shutdown()
        .await;
    Ok(())
}

#[actix_web::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Load configuration from environment
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::from(1);
        }
    };

    if let Err(e) = init_tracing(config.log_dir.as_deref()) {
        eprintln!("Error: {:#}", e);
        return ExitCode::from(1);
    }

    let result = match cli.command {
        Commands::Submit {
            file,
            command,
            name,
            queue,
            upload,
            path,
            fixed_path,
        } => {
            let request = SubmitRequest {
                file,
                command,
                name: Some(name),
                upload,
                path,
                fixed_path,
            };
            submit(&config, queue, request).await
        }
        Commands::Worker { queue, max_jobs } => worker(config, queue, max_jobs).await,
        Commands::Status { queue, verbose } => status(&config, queue, verbose).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(1)
        }
    }
}
