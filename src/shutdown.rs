use actix_web::dev::ServerHandle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Health server running next to the worker.
pub struct HealthServer {
    pub handle: ServerHandle,
    pub task: JoinHandle<Result<(), std::io::Error>>,
}

/// Handles graceful shutdown of a worker process
///
/// The worker stops for one of two reasons: it reached its job limit, or the
/// process got SIGINT/SIGTERM. In the second case the worker is told to stop
/// between jobs, so a job in flight finishes and its record is persisted.
pub struct ShutdownCoordinator {
    worker: JoinHandle<u64>,
    shutdown_tx: watch::Sender<bool>,
    health: Option<HealthServer>,
}

impl ShutdownCoordinator {
    pub fn new(
        worker: JoinHandle<u64>,
        shutdown_tx: watch::Sender<bool>,
        health: Option<HealthServer>,
    ) -> Self {
        Self {
            worker,
            shutdown_tx,
            health,
        }
    }

    /// Wait until the worker exits on its own or a shutdown signal arrives,
    /// then stop everything. Returns the number of processed messages.
    pub async fn wait_for_shutdown(mut self) -> u64 {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to install CTRL+C signal handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM signal handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        let finished = tokio::select! {
            joined = &mut self.worker => Some(joined),
            _ = ctrl_c => {
                info!("Received CTRL+C signal, finishing the current job...");
                None
            }
            _ = terminate => {
                info!("Received SIGTERM signal, finishing the current job...");
                None
            }
        };

        let joined = match finished {
            Some(joined) => joined,
            None => {
                if let Err(e) = self.shutdown_tx.send(true) {
                    error!("Failed to send shutdown signal to the worker: {:?}", e);
                }
                (&mut self.worker).await
            }
        };

        let processed = match joined {
            Ok(processed) => processed,
            Err(e) => {
                error!("Worker task failed: {:?}", e);
                0
            }
        };

        if let Some(health) = self.health {
            info!("Stopping health server...");
            health.handle.stop(true).await;
            match health.task.await {
                Ok(Ok(())) => info!("Health server shut down"),
                Ok(Err(e)) => error!("Health server encountered error during shutdown: {:?}", e),
                Err(e) => error!("Health server task panicked: {:?}", e),
            }
        }

        info!(processed, "Graceful shutdown completed");
        processed
    }
}
