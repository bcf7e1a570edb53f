//! Observability endpoints and metric helpers.
//!
//! Prometheus metrics and a health check, served by a small axum router on
//! the observability port, separate from the stream listener.

use std::sync::OnceLock;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tower_http::trace::TraceLayer;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Idempotent; call once at startup before
/// any metric is recorded.
pub fn init_metrics() -> PrometheusHandle {
    let handle = METRICS_HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder")
    });
    register_default_metrics();
    handle.clone()
}

fn register_default_metrics() {
    gauge!("verbatim_sessions_active").set(0.0);
    counter!("verbatim_sessions_total").absolute(0);
    counter!("verbatim_words_committed_total").absolute(0);
    counter!("verbatim_recognizer_errors_total").absolute(0);
}

/// Serve `/health` and `/metrics` until the process exits.
pub async fn serve(host: &str, port: u16, handle: PrometheusHandle) -> std::io::Result<()> {
    let app = router(handle);
    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    tracing::info!(%host, port, "observability endpoints up");
    axum::serve(listener, app).await
}

pub fn router(handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(handle)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn render_metrics(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}

pub fn record_session_started() {
    counter!("verbatim_sessions_total").increment(1);
    gauge!("verbatim_sessions_active").increment(1.0);
}

pub fn record_session_ended() {
    gauge!("verbatim_sessions_active").decrement(1.0);
}

pub fn record_words_committed(count: usize) {
    counter!("verbatim_words_committed_total").increment(count as u64);
}

pub fn record_recognizer_seconds(seconds: f64) {
    histogram!("verbatim_recognizer_seconds").record(seconds);
}

pub fn record_recognizer_error() {
    counter!("verbatim_recognizer_errors_total").increment(1);
}
