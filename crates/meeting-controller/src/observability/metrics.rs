//! Prometheus metrics recorder and gauges for the meeting controller.
//!
//! All metrics use the `mc_` prefix. A `/metrics` endpoint exposes them
//! for scraping; the business-level gauges here are fed by a periodic
//! poll of the registry actor's aggregate stats rather than by every
//! individual mutation, keeping the hot path free of metrics-crate calls.

use crate::actors::controller::ControllerActorHandle;
use axum::extract::State;
use axum::routing::get;
use axum::Router;
use metrics::gauge;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Install the Prometheus recorder. Must be called once, before any
/// metrics are recorded, and before `metrics_router` is mounted.
///
/// # Errors
///
/// Returns an error if a recorder is already installed for this process.
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| format!("failed to install Prometheus metrics recorder: {e}"))
}

/// Set the number of currently tracked (non-removed) meetings.
///
/// Metric: `mc_meetings_active`
pub fn set_meetings_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("mc_meetings_active").set(count as f64);
}

/// Set the number of active (waiting/approved/admitted) participants
/// across every tracked meeting.
///
/// Metric: `mc_participants_active`
pub fn set_participants_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("mc_participants_active").set(count as f64);
}

/// Set the deepest mailbox depth observed among currently-running actors
/// of the given type.
///
/// Metric: `mc_actor_mailbox_depth{actor_type}`
pub fn set_actor_mailbox_depth(actor_type: crate::actors::metrics::ActorType, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("mc_actor_mailbox_depth", "actor_type" => actor_type.as_str()).set(depth as f64);
}

/// Build the `/metrics` router, serving the Prometheus text exposition
/// format rendered by the handle returned from `init_metrics_recorder`.
pub fn metrics_router(handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/metrics", get(render_metrics))
        .with_state(handle)
}

async fn render_metrics(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}

/// Spawn a background task that periodically refreshes the business-level
/// gauges from the registry actor's aggregate stats (§6 `/admin` counts,
/// mirrored here for Prometheus scraping).
pub fn spawn_stats_poller(controller: ControllerActorHandle, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let stats = controller.stats().await;
            set_meetings_active(stats.meeting_count);
            set_participants_active(stats.participant_count);
            set_actor_mailbox_depth(
                crate::actors::metrics::ActorType::Registry,
                controller.mailbox_depth(),
            );
            set_actor_mailbox_depth(
                crate::actors::metrics::ActorType::Meeting,
                stats.max_meeting_mailbox_depth,
            );
        }
    });
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn gauges_do_not_panic_without_an_installed_recorder() {
        set_meetings_active(3);
        set_participants_active(12);
    }
}
