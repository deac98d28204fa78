//! Liveness tracking and the health HTTP surface.
//!
//! Loops record progress into a [`Heartbeat`]; checks turn heartbeats into a
//! verdict; [`health_router`] exposes the verdicts to the orchestrator.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::info;

const NEVER: i64 = i64::MIN;

/// Timestamp of the most recent unit of progress made by a loop
#[derive(Debug)]
pub struct Heartbeat {
    last_beat_ms: AtomicI64,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self {
            last_beat_ms: AtomicI64::new(NEVER),
        }
    }
}

impl Heartbeat {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record progress now
    pub fn beat(&self) {
        self.beat_at(Utc::now());
    }

    pub fn beat_at(&self, at: DateTime<Utc>) {
        self.last_beat_ms
            .fetch_max(at.timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_beat(&self) -> Option<DateTime<Utc>> {
        match self.last_beat_ms.load(Ordering::Relaxed) {
            NEVER => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }

    /// Time since the last beat as seen at `now`; `None` if it never beat
    pub fn age_at(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.last_beat()
            .map(|last| (now - last).to_std().unwrap_or(Duration::ZERO))
    }

    pub fn is_fresh_at(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        self.age_at(now).is_some_and(|age| age <= max_age)
    }
}

/// Result of one health check
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: &'static str,
    pub healthy: bool,
    pub detail: String,
}

/// Something the readiness endpoint can ask for a verdict
pub trait HealthCheck: Send + Sync {
    fn check(&self, now: DateTime<Utc>) -> CheckResult;
}

/// Liveness of the log consumer: connected, and committed (or caught up) recently
#[derive(Debug)]
pub struct ConsumerLiveness {
    connected: AtomicBool,
    heartbeat: Heartbeat,
    max_commit_age: Duration,
}

impl ConsumerLiveness {
    pub fn new(max_commit_age: Duration) -> Self {
        Self {
            connected: AtomicBool::new(false),
            heartbeat: Heartbeat::new(),
            max_commit_age,
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn heartbeat(&self) -> &Heartbeat {
        &self.heartbeat
    }
}

impl HealthCheck for ConsumerLiveness {
    fn check(&self, now: DateTime<Utc>) -> CheckResult {
        let connected = self.is_connected();
        let age = self.heartbeat.age_at(now);
        let fresh = self.heartbeat.is_fresh_at(now, self.max_commit_age);

        let detail = match (connected, age) {
            (false, _) => "log consumer is not connected".to_string(),
            (true, None) => "no commit recorded yet".to_string(),
            (true, Some(age)) => format!(
                "last commit {}ms ago (limit {}ms)",
                age.as_millis(),
                self.max_commit_age.as_millis()
            ),
        };

        CheckResult {
            name: "log_consumer",
            healthy: connected && fresh,
            detail,
        }
    }
}

/// Liveness of the cache synchronizer: last successful pass is recent enough
#[derive(Debug)]
pub struct SyncLiveness {
    heartbeat: Heartbeat,
    max_pass_age: Duration,
}

impl SyncLiveness {
    pub fn new(max_pass_age: Duration) -> Self {
        Self {
            heartbeat: Heartbeat::new(),
            max_pass_age,
        }
    }

    pub fn heartbeat(&self) -> &Heartbeat {
        &self.heartbeat
    }
}

impl HealthCheck for SyncLiveness {
    fn check(&self, now: DateTime<Utc>) -> CheckResult {
        let detail = match self.heartbeat.age_at(now) {
            None => "no synchronization pass completed yet".to_string(),
            Some(age) => format!(
                "last pass {}ms ago (limit {}ms)",
                age.as_millis(),
                self.max_pass_age.as_millis()
            ),
        };

        CheckResult {
            name: "cache_synchronizer",
            healthy: self.heartbeat.is_fresh_at(now, self.max_pass_age),
            detail,
        }
    }
}

#[derive(Clone)]
struct HealthState {
    service: String,
    checks: Arc<Vec<Arc<dyn HealthCheck>>>,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    status: &'static str,
    service: String,
    checks: Vec<CheckResult>,
}

/// Create the health router: `/health` answers while the process is up,
/// `/ready` aggregates the registered checks
pub fn health_router(service: impl Into<String>, checks: Vec<Arc<dyn HealthCheck>>) -> Router {
    let state = HealthState {
        service: service.into(),
        checks: Arc::new(checks),
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check(State(state): State<HealthState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": state.service,
    }))
}

async fn readiness_check(State(state): State<HealthState>) -> impl IntoResponse {
    let now = Utc::now();
    let checks: Vec<CheckResult> = state.checks.iter().map(|c| c.check(now)).collect();
    let ready = checks.iter().all(|c| c.healthy);

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            status: if ready { "ready" } else { "not_ready" },
            service: state.service.clone(),
            checks,
        }),
    )
}

/// Serve the health router until `shutdown` resolves
pub async fn serve_health<F>(
    router: Router,
    host: &str,
    port: u16,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(address = %addr, "Starting health endpoint");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}
