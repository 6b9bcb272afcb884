use std::sync::Arc;

use actix_web::dev::Server;
use actix_web::{get, web, App, HttpResponse, HttpServer, Responder};
use serde::Serialize;
use tracing::{error, info};

use crate::broker::Broker;

/// Shared state of the probe handlers.
pub struct HealthState {
    pub broker: Arc<dyn Broker>,
    pub queue: String,
}

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    broker: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    queue: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Health check endpoint
///
/// General health check including broker connectivity.
#[get("/health")]
async fn health_check(state: web::Data<HealthState>) -> impl Responder {
    match state.broker.ping().await {
        Ok(()) => HttpResponse::Ok().json(HealthResponse {
            status: "healthy".to_string(),
            broker: "connected".to_string(),
            queue: Some(state.queue.clone()),
            error: None,
        }),
        Err(e) => {
            error!(error = %e, "Health check failed");
            HttpResponse::ServiceUnavailable().json(HealthResponse {
                status: "unhealthy".to_string(),
                broker: "disconnected".to_string(),
                queue: Some(state.queue.clone()),
                error: Some(format!("Broker error: {}", e)),
            })
        }
    }
}

/// Readiness check endpoint
///
/// Returns 503 while the broker is unreachable; the worker keeps retrying and
/// becomes ready again once it returns.
#[get("/ready")]
async fn readiness_check(state: web::Data<HealthState>) -> impl Responder {
    match state.broker.ping().await {
        Ok(()) => HttpResponse::Ok().json(HealthResponse {
            status: "ready".to_string(),
            broker: "connected".to_string(),
            queue: None,
            error: None,
        }),
        Err(e) => {
            error!(error = %e, "Readiness check failed: broker unavailable");
            HttpResponse::ServiceUnavailable().json(HealthResponse {
                status: "not_ready".to_string(),
                broker: "disconnected".to_string(),
                queue: None,
                error: Some(format!("Broker unavailable: {}", e)),
            })
        }
    }
}

/// Liveness check endpoint. Does not check dependencies.
#[get("/live")]
async fn liveness_check() -> impl Responder {
    HttpResponse::Ok().json(HealthResponse {
        status: "alive".to_string(),
        broker: "not_checked".to_string(),
        queue: None,
        error: None,
    })
}

pub fn health_config(config: &mut web::ServiceConfig) {
    config
        .service(health_check)
        .service(readiness_check)
        .service(liveness_check);
}

/// Bind the probe server on `addr`. The returned server must be awaited or
/// spawned to start serving.
pub fn serve(addr: &str, state: HealthState) -> std::io::Result<Server> {
    let state = web::Data::new(state);
    let server = HttpServer::new(move || App::new().app_data(state.clone()).configure(health_config))
        .workers(1)
        .bind(addr)?
        .run();
    info!(addr, "Health server listening");
    Ok(server)
}
