use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub database: ComponentHealth,
    pub redis: ComponentHealth,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub latency_ms: Option<u64>,
}

impl ComponentHealth {
    fn ok(started: Instant) -> Self {
        Self {
            status: "ok".to_string(),
            latency_ms: Some(started.elapsed().as_millis() as u64),
        }
    }

    fn error() -> Self {
        Self {
            status: "error".to_string(),
            latency_ms: None,
        }
    }

    fn disabled() -> Self {
        Self {
            status: "disabled".to_string(),
            latency_ms: None,
        }
    }

    fn is_healthy(&self) -> bool {
        self.status != "error"
    }
}

/// GET /health: Dependency status. Redis is optional and reported as "disabled" when unset.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let start = Instant::now();
    let db_check = match state.datasets.health_check().await {
        Ok(()) => ComponentHealth::ok(start),
        Err(e) => {
            tracing::warn!(error = %e, "Database health check failed");
            ComponentHealth::error()
        }
    };

    let redis_start = Instant::now();
    let redis_check = match state.queue.health_check().await {
        None => ComponentHealth::disabled(),
        Some(Ok(())) => ComponentHealth::ok(redis_start),
        Some(Err(e)) => {
            tracing::warn!(error = %e, "Redis health check failed");
            ComponentHealth::error()
        }
    };

    let all_healthy = db_check.is_healthy() && redis_check.is_healthy();
    let status_code = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if all_healthy { "ok" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks {
            database: db_check,
            redis: redis_check,
        },
    };

    (status_code, Json(response))
}
