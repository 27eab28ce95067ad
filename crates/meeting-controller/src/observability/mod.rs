//! Process-wide observability surfaces: health/readiness probes, the
//! admin HTTP endpoints (§6), and the Prometheus `/metrics` endpoint.

pub mod admin;
pub mod health;
pub mod metrics;
