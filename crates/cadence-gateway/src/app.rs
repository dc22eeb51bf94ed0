use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use cadence_scheduler::{ManualTriggerRegistry, StatusBoard};
use chrono::{DateTime, Utc};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_SHA: &str = env!("CADENCE_GIT_SHA");

/// Central shared state, passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub manual: ManualTriggerRegistry,
    pub status: StatusBoard,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(manual: ManualTriggerRegistry, status: StatusBoard) -> Self {
        Self {
            manual,
            status,
            started_at: Utc::now(),
        }
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route("/jobs", get(crate::http::jobs::list_jobs))
        .route("/jobs/{name}", get(crate::http::jobs::get_job))
        .route(
            "/jobs/{name}/trigger",
            post(crate::http::jobs::trigger_job),
        )
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
