//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Nonce allocation and lock contention
//! - Supervisor outcomes
//! - Chain head height

use crate::error::{KeeperError, KeeperResult};
use crate::events::TxEvent;

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, CounterVec, Encoder, Gauge,
    HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    pub static ref NONCES_ALLOCATED: CounterVec = register_counter_vec!(
        "nonce_keeper_nonces_allocated_total",
        "Total nonces handed out",
        &[]
    ).unwrap();

    pub static ref LOCK_WAIT: HistogramVec = register_histogram_vec!(
        "nonce_keeper_lock_wait_seconds",
        "Time spent waiting for a nonce lock",
        &["scope"],
        vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 30.0]
    ).unwrap();

    pub static ref TX_EVENTS: CounterVec = register_counter_vec!(
        "nonce_keeper_tx_events_total",
        "Supervisor outcomes by type",
        &["event_type"]
    ).unwrap();

    pub static ref IGNORED_BROADCAST_ERRORS: CounterVec = register_counter_vec!(
        "nonce_keeper_ignored_broadcast_errors_total",
        "Rebroadcast errors classified as already in flight",
        &[]
    ).unwrap();

    pub static ref SWEEPS: CounterVec = register_counter_vec!(
        "nonce_keeper_sweeps_total",
        "Full pending transaction sweeps",
        &[]
    ).unwrap();

    pub static ref BLOCK_HEIGHT: Gauge = register_gauge!(
        "nonce_keeper_block_height",
        "Latest block seen"
    ).unwrap();

    pub static ref HEALTH_CHECKS: CounterVec = register_counter_vec!(
        "nonce_keeper_health_checks_total",
        "Health checks by result",
        &["result"]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> KeeperResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| KeeperError::Internal(format!("metrics bind failed: {}", e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| KeeperError::Internal(format!("metrics server failed: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

// Helper functions to record metrics

pub fn record_nonce_allocated() {
    NONCES_ALLOCATED.with_label_values(&[]).inc();
}

pub fn record_lock_wait(global: bool, wait_secs: f64) {
    let scope = if global { "global" } else { "address" };
    LOCK_WAIT.with_label_values(&[scope]).observe(wait_secs);
}

pub fn record_tx_event(event: &TxEvent) {
    TX_EVENTS.with_label_values(&[event.name()]).inc();
}

pub fn record_ignored_broadcast_error() {
    IGNORED_BROADCAST_ERRORS.with_label_values(&[]).inc();
}

pub fn record_sweep() {
    SWEEPS.with_label_values(&[]).inc();
}

pub fn record_block_height(block_number: u64) {
    BLOCK_HEIGHT.set(block_number as f64);
}

pub fn record_health_check(healthy: bool) {
    let result = if healthy { "success" } else { "failure" };
    HEALTH_CHECKS.with_label_values(&[result]).inc();
}
