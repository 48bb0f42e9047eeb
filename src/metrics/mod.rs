//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Swap creation and phase transitions
//! - Ledger action submission, confirmation and latency
//! - Ledger tip height and health

use crate::error::{SwapError, SwapResult};
use crate::swap::{Phase, Role};
use crate::tx::ActionKind;

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec, CounterVec,
    Encoder, Gauge, GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Swap metrics
    pub static ref SWAPS_CREATED: CounterVec = register_counter_vec!(
        "swap_coordinator_swaps_created_total",
        "Total swaps registered by local role",
        &["role"]
    ).unwrap();

    pub static ref PHASE_TRANSITIONS: CounterVec = register_counter_vec!(
        "swap_coordinator_phase_transitions_total",
        "Total phase transitions",
        &["role", "from", "to"]
    ).unwrap();

    pub static ref SWAPS_TERMINAL: CounterVec = register_counter_vec!(
        "swap_coordinator_swaps_terminal_total",
        "Swaps that reached a terminal phase",
        &["role", "phase"]
    ).unwrap();

    pub static ref ACTIVE_SWAPS: Gauge = register_gauge!(
        "swap_coordinator_active_swaps",
        "Swaps not yet in a terminal phase"
    ).unwrap();

    // Action metrics
    pub static ref ACTIONS_SUBMITTED: CounterVec = register_counter_vec!(
        "swap_coordinator_actions_submitted_total",
        "Ledger actions accepted by a ledger",
        &["ledger", "action"]
    ).unwrap();

    pub static ref ACTIONS_CONFIRMED: CounterVec = register_counter_vec!(
        "swap_coordinator_actions_confirmed_total",
        "Ledger actions observed confirmed",
        &["ledger", "action"]
    ).unwrap();

    pub static ref ACTIONS_FAILED: CounterVec = register_counter_vec!(
        "swap_coordinator_actions_failed_total",
        "Ledger actions that did not confirm",
        &["ledger", "action", "reason"]
    ).unwrap();

    pub static ref ACTION_LATENCY: HistogramVec = register_histogram_vec!(
        "swap_coordinator_action_latency_seconds",
        "Time from first submission to confirmation",
        &["ledger", "action"],
        vec![0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    ).unwrap();

    // Ledger metrics
    pub static ref LEDGER_HEIGHT: GaugeVec = register_gauge_vec!(
        "swap_coordinator_ledger_height",
        "Current tip height per ledger",
        &["ledger"]
    ).unwrap();

    pub static ref LEDGER_HEALTHY: GaugeVec = register_gauge_vec!(
        "swap_coordinator_ledger_healthy",
        "Ledger reachability (1=healthy, 0=unreachable)",
        &["ledger"]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "swap_coordinator_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "swap_coordinator_health_check_failure_total",
        "Total failed health checks",
        &[]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    host: String,
    port: u16,
}

impl MetricsServer {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub async fn run(&self) -> SwapResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr: SocketAddr = format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| SwapError::Config(format!("invalid metrics address: {}", e)))?;
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| SwapError::Internal(format!("failed to bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| SwapError::Internal(format!("metrics server failed: {}", e)))?;

        Ok(())
    }
}

/// Render every registered metric in the text exposition format
pub fn render() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| e.to_string())?;
    String::from_utf8(buffer).map_err(|e| e.to_string())
}

async fn metrics_handler() -> Result<String, (StatusCode, String)> {
    render().map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e))
}

// Helper functions to record metrics

pub fn record_swap_created(role: Role) {
    SWAPS_CREATED.with_label_values(&[role_label(role)]).inc();
}

pub fn record_phase(role: Role, from: Phase, to: Phase) {
    PHASE_TRANSITIONS
        .with_label_values(&[role_label(role), from.as_str(), to.as_str()])
        .inc();
    if to.is_terminal() {
        SWAPS_TERMINAL
            .with_label_values(&[role_label(role), to.as_str()])
            .inc();
    }
}

pub fn set_active_swaps(count: usize) {
    ACTIVE_SWAPS.set(count as f64);
}

pub fn record_action_submitted(ledger: &str, kind: ActionKind) {
    ACTIONS_SUBMITTED
        .with_label_values(&[ledger, action_label(kind)])
        .inc();
}

pub fn record_action_confirmed(ledger: &str, kind: ActionKind) {
    ACTIONS_CONFIRMED
        .with_label_values(&[ledger, action_label(kind)])
        .inc();
}

pub fn record_action_failed(ledger: &str, kind: ActionKind, reason: &str) {
    ACTIONS_FAILED
        .with_label_values(&[ledger, action_label(kind), reason])
        .inc();
}

pub fn record_action_latency(ledger: &str, kind: ActionKind, latency_secs: f64) {
    ACTION_LATENCY
        .with_label_values(&[ledger, action_label(kind)])
        .observe(latency_secs);
}

pub fn record_ledger_height(ledger: &str, height: u64) {
    LEDGER_HEIGHT.with_label_values(&[ledger]).set(height as f64);
}

pub fn record_ledger_health(ledger: &str, healthy: bool) {
    LEDGER_HEALTHY
        .with_label_values(&[ledger])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::Alpha => "alpha",
        Role::Beta => "beta",
    }
}

fn action_label(kind: ActionKind) -> &'static str {
    match kind {
        ActionKind::Deploy => "deploy",
        ActionKind::Fund => "fund",
        ActionKind::Redeem => "redeem",
        ActionKind::Refund => "refund",
    }
}
