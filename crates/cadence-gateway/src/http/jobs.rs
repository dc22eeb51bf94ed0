//! Job endpoints: status snapshots and manual triggers.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use cadence_scheduler::JobStatus;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use crate::app::AppState;

/// GET /jobs: every hosted job, sorted by name.
pub async fn list_jobs(State(state): State<Arc<AppState>>) -> Json<Vec<JobStatus>> {
    Json(state.status.snapshot())
}

/// GET /jobs/{name}
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<JobStatus>, (StatusCode, Json<Value>)> {
    state.status.get(&name).map(Json).ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("no job named `{name}`"), "code": "JOB_NOT_FOUND"})),
        )
    })
}

/// POST /jobs/{name}/trigger
///
/// 202 when a manually triggerable job was signalled. The run itself still
/// goes through the job's lock and anchor checks.
pub async fn trigger_job(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> (StatusCode, Json<Value>) {
    if state.manual.trigger(&name) {
        info!(job = %name, "manual trigger accepted");
        (
            StatusCode::ACCEPTED,
            Json(json!({"triggered": true, "job": name})),
        )
    } else {
        warn!(job = %name, "manual trigger for unknown or non-manual job");
        (
            StatusCode::NOT_FOUND,
            Json(json!({
                "triggered": false,
                "error": format!("job `{name}` does not accept manual triggers"),
                "code": "JOB_NOT_TRIGGERABLE",
            })),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request, Router};
    use cadence_scheduler::{ManualTriggerRegistry, StatusBoard};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    fn app() -> (Router, ManualTriggerRegistry, StatusBoard) {
        let manual = ManualTriggerRegistry::new();
        let status = StatusBoard::new();
        let state = Arc::new(AppState::new(manual.clone(), status.clone()));
        (crate::app::build_router(state), manual, status)
    }

    async fn body_json(resp: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn trigger_registered_job() {
        let (app, manual, _) = app();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        manual.register("nightly", move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        let resp = app
            .oneshot(
                Request::post("/jobs/nightly/trigger")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(resp).await["triggered"], true);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn trigger_unknown_job_is_404() {
        let (app, _, _) = app();
        let resp = app
            .oneshot(
                Request::post("/jobs/missing/trigger")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(resp).await["code"], "JOB_NOT_TRIGGERABLE");
    }

    #[tokio::test]
    async fn list_and_get_jobs() {
        let (app, _, status) = app();
        status.register("b", "log", uuid::Uuid::new_v4(), vec!["manual"]);
        status.register("a", "command", uuid::Uuid::new_v4(), vec!["schedule"]);

        let resp = app
            .clone()
            .oneshot(Request::get("/jobs").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let list = body_json(resp).await;
        assert_eq!(list[0]["name"], "a");
        assert_eq!(list[1]["name"], "b");
        assert_eq!(list[1]["state"], "waiting");

        let resp = app
            .clone()
            .oneshot(Request::get("/jobs/a").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(resp).await["job_type"], "command");

        let resp = app
            .oneshot(Request::get("/jobs/zzz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
