//! HTTP status endpoint.
//!
//! `GET /` returns the client identity, uptime, traffic counters, and the
//! last measured ping. `GET /dns` returns the recorded DNS pairs. Both
//! answers allow cross-origin reads so a dashboard can poll them directly.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::State,
    http::header,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use tokio::sync::broadcast;
use tracing::info;

use super::{DnsLog, LivenessState, TrafficMonitor};

/// Shared state for the status handlers.
#[derive(Clone)]
pub struct StatusState {
    pub monitor: Arc<TrafficMonitor>,
    pub dns_log: Arc<DnsLog>,
    pub liveness: Arc<LivenessState>,
    pub started_at: Instant,
}

/// The status HTTP server.
pub struct StatusServer {
    port: u16,
    state: StatusState,
    shutdown_tx: broadcast::Sender<()>,
}

impl StatusServer {
    pub fn new(port: u16, state: StatusState) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            port,
            state,
            shutdown_tx,
        }
    }

    /// Serve until stopped. Endpoint failures never affect the tunnel.
    pub async fn start(&self) -> std::io::Result<()> {
        let app = Router::new()
            .route("/", get(status_handler))
            .route("/dns", get(dns_handler))
            .with_state(self.state.clone());

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!(port = self.port, "Status endpoint listening");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

async fn status_handler(State(state): State<StatusState>) -> impl IntoResponse {
    let body = serde_json::json!({
        "name": crate::NAME,
        "version": crate::VERSION,
        "time": state.started_at.elapsed().as_secs(),
        "monitor": state.monitor.snapshot(),
        "ping": state.liveness.last_rtt_ms(),
    });

    ([(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")], Json(body))
}

async fn dns_handler(State(state): State<StatusState>) -> impl IntoResponse {
    (
        [(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")],
        Json(state.dns_log.snapshot()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Direction;

    fn test_state() -> StatusState {
        StatusState {
            monitor: Arc::new(TrafficMonitor::new()),
            dns_log: Arc::new(DnsLog::new()),
            liveness: Arc::new(LivenessState::new()),
            started_at: Instant::now(),
        }
    }

    #[tokio::test]
    async fn test_status_body() {
        let state = test_state();
        state.monitor.add("10.0.0.2", "8.8.8.8", Direction::Out, 41);
        state.liveness.record_reply(17, 1);

        let response = status_handler(State(state)).await.into_response();
        assert_eq!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .unwrap(),
            "*"
        );

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(body["name"], crate::NAME);
        assert_eq!(body["ping"], 17);
        assert_eq!(body["monitor"]["10.0.0.2"]["out_bytes"], 41);
    }

    #[tokio::test]
    async fn test_dns_body() {
        let state = test_state();
        state
            .dns_log
            .record("104.244.42.1".parse().unwrap(), "api.example.com");

        let response = dns_handler(State(state)).await.into_response();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(body[0]["ip"], "104.244.42.1");
        assert_eq!(body[0]["name"], "api.example.com");
    }
}
