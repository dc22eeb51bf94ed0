use axum::{extract::State, Json};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::{AppState, GIT_SHA, VERSION};

/// GET /health: liveness probe. Returns server metadata.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": VERSION,
        "git_sha": GIT_SHA,
        "jobs": state.status.len(),
        "uptime_secs": (Utc::now() - state.started_at).num_seconds(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request, http::StatusCode};
    use cadence_scheduler::{ManualTriggerRegistry, StatusBoard};
    use tower::ServiceExt;

    #[tokio::test]
    async fn health_reports_job_count() {
        let status = StatusBoard::new();
        let state = Arc::new(AppState::new(ManualTriggerRegistry::new(), status));
        let app = crate::app::build_router(state);

        let resp = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["jobs"], 0);
        assert_eq!(body["version"], VERSION);
        assert_eq!(body["git_sha"], GIT_SHA);
        assert!(!GIT_SHA.trim().is_empty());
    }
}
