/**
 * API REST PMS - Consultation de l'état du noyau
 *
 * RÔLE :
 * Lecture seule : la conduite passe exclusivement par le canal MQTT.
 *
 * FONCTIONNEMENT :
 * - Serveur Axum avec middleware auth API key
 * - Routes : /health, /system/health, /devices, /devices/{id}, /operation, /monitor
 *
 * SÉCURITÉ :
 * - Header x-api-key obligatoire sur toutes routes sauf /health
 * - PMS_API_KEY absent : accès refusé (sauf /health)
 */

use crate::automation::operation::{OperationHandle, OperationStatus};
use crate::health::{HealthTracker, KernelHealth};
use crate::models::{Device, TelemetrySnapshot};
use crate::monitor::MonitorReport;
use crate::scheduler::{DeviceScheduler, DeviceStats};
use crate::state::Shared;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::{routing::get, Json, Router};
use serde::Serialize;
use tracing::warn;

pub const API_KEY_ENV: &str = "PMS_API_KEY";

async fn require_api_key(req: Request, next: Next) -> Result<Response, StatusCode> {
    // /health toujours accessible, /system/health non
    if req.uri().path() == "/health" {
        return Ok(next.run(req).await);
    }

    let expected = std::env::var(API_KEY_ENV).unwrap_or_default();
    if expected.is_empty() {
        warn!("SECURITY: {API_KEY_ENV} not set - API access denied");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        warn!(path = %req.uri().path(), "rejected request with missing or invalid API key");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

#[derive(Clone)]
pub struct AppState {
    pub scheduler: DeviceScheduler,
    pub operations: OperationHandle,
    pub monitor: Shared<MonitorReport>,
    pub health_tracker: HealthTracker,
}

#[derive(Serialize)]
struct DeviceView {
    device: Device,
    stats: Option<DeviceStats>,
    latest: Option<TelemetrySnapshot>,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/devices", get(list_devices))
        .route("/devices/{id}", get(get_device))
        .route("/operation", get(get_operation))
        .route("/monitor", get(get_monitor))
        .with_state(app_state)
        .layer(middleware::from_fn(require_api_key))
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    Json(app.health_tracker.get_health(&app.scheduler, &app.monitor))
}

// GET /devices
async fn list_devices(State(app): State<AppState>) -> Json<Vec<DeviceStats>> {
    Json(app.scheduler.stats())
}

// GET /devices/{id}
async fn get_device(State(app): State<AppState>, Path(id): Path<String>) -> Result<Json<DeviceView>, StatusCode> {
    let link = app.scheduler.registry().get(&id).ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(DeviceView {
        device: link.device().clone(),
        stats: app.scheduler.device_stats(&id),
        latest: app.scheduler.latest(&id),
    }))
}

// GET /operation
async fn get_operation(State(app): State<AppState>) -> Json<OperationStatus> {
    Json(app.operations.status())
}

// GET /monitor
async fn get_monitor(State(app): State<AppState>) -> Json<MonitorReport> {
    Json(app.monitor.lock().clone())
}
