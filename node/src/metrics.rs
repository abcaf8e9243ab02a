//! # Prometheus Metrics
//!
//! Session-level metrics for the node, scraped at `/metrics` on the
//! configured metrics port.
//!
//! All metrics are registered in a dedicated [`prometheus::Registry`] under
//! the `pod` namespace so they do not collide with any default global
//! registry consumers.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

/// Metric handles shared by the accept loop and the API.
#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    /// Sessions opened, by role.
    pub sessions_started_total: IntCounterVec,
    /// Sessions that reached their success status, by role and kind.
    pub sessions_completed_total: IntCounterVec,
    /// Sessions that ended in a failure status, by role and error kind.
    pub sessions_failed_total: IntCounterVec,
    /// Sessions currently running, by role.
    pub active_sessions: IntGaugeVec,
    /// Channel bytes, by direction (`sent` / `received`).
    pub bytes_transferred_total: IntCounterVec,
    /// Secrets revealed on chain by this seller.
    pub proofs_submitted_total: IntCounter,
    /// Wall time of a session from accept to close.
    pub session_duration_seconds: Histogram,
}

impl NodeMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("pod".into()), None)?;

        let sessions_started_total = IntCounterVec::new(
            Opts::new("sessions_started_total", "PoD sessions opened"),
            &["role"],
        )?;
        let sessions_completed_total = IntCounterVec::new(
            Opts::new("sessions_completed_total", "PoD sessions that completed"),
            &["role", "kind"],
        )?;
        let sessions_failed_total = IntCounterVec::new(
            Opts::new("sessions_failed_total", "PoD sessions that failed"),
            &["role", "error"],
        )?;
        let active_sessions = IntGaugeVec::new(
            Opts::new("active_sessions", "PoD sessions currently running"),
            &["role"],
        )?;
        let bytes_transferred_total = IntCounterVec::new(
            Opts::new("bytes_transferred_total", "Bytes moved over session channels"),
            &["direction"],
        )?;
        let proofs_submitted_total =
            IntCounter::new("proofs_submitted_total", "Secrets revealed on chain")?;
        let session_duration_seconds = Histogram::with_opts(
            HistogramOpts::new("session_duration_seconds", "Session wall time in seconds")
                .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0]),
        )?;

        registry.register(Box::new(sessions_started_total.clone()))?;
        registry.register(Box::new(sessions_completed_total.clone()))?;
        registry.register(Box::new(sessions_failed_total.clone()))?;
        registry.register(Box::new(active_sessions.clone()))?;
        registry.register(Box::new(bytes_transferred_total.clone()))?;
        registry.register(Box::new(proofs_submitted_total.clone()))?;
        registry.register(Box::new(session_duration_seconds.clone()))?;

        Ok(Self {
            registry,
            sessions_started_total,
            sessions_completed_total,
            sessions_failed_total,
            active_sessions,
            bytes_transferred_total,
            proofs_submitted_total,
            session_duration_seconds,
        })
    }

    /// Encodes all registered metrics into the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

pub type SharedMetrics = Arc<NodeMetrics>;

/// Axum handler that renders `/metrics` in Prometheus text format.
pub async fn metrics_handler(State(metrics): State<SharedMetrics>) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}
