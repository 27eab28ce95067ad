//! Illustrative admin HTTP endpoints (§6):
//!
//! - `GET /admin/stale-participants-stats?thresholdSec=` — per-meeting
//!   counts of participants whose `lastSeenAt` is older than the given
//!   window, without mutating anything.
//! - `POST /admin/manual-cleanup?thresholdSec=` — forces every live
//!   meeting to run its sweeper immediately.
//!
//! These are operational tools, not part of the client-facing protocol;
//! no `Principal` is threaded through them; deployments are expected to
//! put them behind a separate network boundary (e.g. an internal-only
//! ingress) rather than the Identity Resolver.

use crate::actors::controller::ControllerActorHandle;
use axum::extract::{Query, State};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};

const DEFAULT_THRESHOLD_SEC: i64 = 150;

#[derive(Debug, Deserialize)]
pub struct ThresholdQuery {
    #[serde(rename = "thresholdSec")]
    threshold_sec: Option<i64>,
}

impl ThresholdQuery {
    fn resolve(&self) -> i64 {
        self.threshold_sec.unwrap_or(DEFAULT_THRESHOLD_SEC).max(0)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StaleParticipantsResponse {
    #[serde(rename = "thresholdSec")]
    threshold_sec: i64,
    meetings: Vec<StaleMeetingEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StaleMeetingEntry {
    #[serde(rename = "meetingId")]
    meeting_id: String,
    #[serde(rename = "staleCount")]
    stale_count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct ManualCleanupResponse {
    #[serde(rename = "sessionsClosed")]
    sessions_closed: usize,
}

pub fn admin_router(controller: ControllerActorHandle) -> Router {
    Router::new()
        .route("/admin/stale-participants-stats", get(stale_participants_stats))
        .route("/admin/manual-cleanup", post(manual_cleanup))
        .with_state(controller)
}

async fn stale_participants_stats(
    State(controller): State<ControllerActorHandle>,
    Query(query): Query<ThresholdQuery>,
) -> Json<StaleParticipantsResponse> {
    let threshold_sec = query.resolve();
    let reports = controller.stale_participants_stats(threshold_sec).await;
    Json(StaleParticipantsResponse {
        threshold_sec,
        meetings: reports
            .into_iter()
            .map(|r| StaleMeetingEntry {
                meeting_id: r.meeting_id.to_string(),
                stale_count: r.stale_count,
            })
            .collect(),
    })
}

async fn manual_cleanup(
    State(controller): State<ControllerActorHandle>,
    Query(query): Query<ThresholdQuery>,
) -> Json<ManualCleanupResponse> {
    let threshold_sec = query.resolve();
    let sessions_closed = controller.manual_cleanup(threshold_sec).await;
    Json(ManualCleanupResponse { sessions_closed })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::controller::spawn_registry;
    use crate::config::Config;
    use crate::store::InMemoryStore;
    use axum::body::Body;
    use axum::http::Request;
    use common::types::UserId;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tower::util::ServiceExt;

    fn test_config() -> Config {
        let mut vars = std::collections::HashMap::new();
        vars.insert(
            "DATABASE_URL".to_string(),
            "postgres://localhost/test".to_string(),
        );
        vars.insert("MC_SIGNING_SECRET".to_string(), "0".repeat(64));
        Config::from_vars(&vars).expect("valid config")
    }

    #[tokio::test]
    async fn stale_participants_stats_reports_zero_meetings_when_nothing_is_stale() {
        let store: Arc<dyn crate::store::Store> = Arc::new(InMemoryStore::new());
        let config = test_config();
        let controller = spawn_registry(store, &config).await;
        controller
            .create_meeting("Algebra".to_string(), false, UserId::new(), None)
            .await
            .unwrap();

        let app = admin_router(controller);
        let request = Request::builder()
            .uri("/admin/stale-participants-stats?thresholdSec=150")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: StaleParticipantsResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed.threshold_sec, 150);
        assert!(parsed.meetings.is_empty());
    }

    #[tokio::test]
    async fn manual_cleanup_returns_zero_when_nothing_to_close() {
        let store: Arc<dyn crate::store::Store> = Arc::new(InMemoryStore::new());
        let config = test_config();
        let controller = spawn_registry(store, &config).await;

        let app = admin_router(controller);
        let request = Request::builder()
            .method("POST")
            .uri("/admin/manual-cleanup")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: ManualCleanupResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed.sessions_closed, 0);
    }
}
