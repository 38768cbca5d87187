//! Control-plane HTTP surface: a Prometheus text-exposition `/metrics`
//! endpoint built fresh per scrape, plus a small JSON/WebSocket API for
//! status and manual upstream control.
//!
//! The per-scrape registry build follows `core/src/stats/prometheus.rs`'s
//! shape (a `Registry`, one `Gauge`/`Family` per concept,
//! `prometheus_client::encoding::text::encode`), swapped from `hyper` to
//! `axum` to match this crate's HTTP stack.

use crate::manager::{ManagerMode, UpstreamManager};
use crate::metrics::MetricsRegistry;
use crate::scheduler::MeasurementScheduler;
use crate::status::{StatusEvent, StatusStore};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use serde::{Deserialize, Serialize};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use tracing::debug;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<UpstreamManager>,
    pub status: Arc<StatusStore>,
    pub metrics: Arc<MetricsRegistry>,
    pub scheduler: Arc<MeasurementScheduler>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/api/status", get(get_status))
        .route("/api/status/ws", get(status_ws))
        .route("/api/upstreams", get(list_upstreams))
        .route("/api/upstream", post(set_upstream))
        .route("/api/queue", get(get_queue_status))
        .with_state(state)
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
struct UpstreamLabel {
    upstream: String,
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let mut registry = Registry::default();
    let scoring = crate::config::ScoringConfig::default();

    let rtt_ms: Family<UpstreamLabel, Gauge<f64, AtomicU64>> = Family::default();
    let jitter_ms: Family<UpstreamLabel, Gauge<f64, AtomicU64>> = Family::default();
    let bandwidth_up_bps: Family<UpstreamLabel, Gauge<f64, AtomicU64>> = Family::default();
    let bandwidth_down_bps: Family<UpstreamLabel, Gauge<f64, AtomicU64>> = Family::default();
    let bandwidth_tcp_up_bps: Family<UpstreamLabel, Gauge<f64, AtomicU64>> = Family::default();
    let bandwidth_tcp_down_bps: Family<UpstreamLabel, Gauge<f64, AtomicU64>> = Family::default();
    let bandwidth_udp_up_bps: Family<UpstreamLabel, Gauge<f64, AtomicU64>> = Family::default();
    let bandwidth_udp_down_bps: Family<UpstreamLabel, Gauge<f64, AtomicU64>> = Family::default();
    let retrans_rate: Family<UpstreamLabel, Gauge<f64, AtomicU64>> = Family::default();
    let loss_rate: Family<UpstreamLabel, Gauge<f64, AtomicU64>> = Family::default();
    let loss: Family<UpstreamLabel, Gauge<f64, AtomicU64>> = Family::default();
    let score_tcp: Family<UpstreamLabel, Gauge<f64, AtomicU64>> = Family::default();
    let score_udp: Family<UpstreamLabel, Gauge<f64, AtomicU64>> = Family::default();
    let score_overall: Family<UpstreamLabel, Gauge<f64, AtomicU64>> = Family::default();
    let score: Family<UpstreamLabel, Gauge<f64, AtomicU64>> = Family::default();
    let utilization: Family<UpstreamLabel, Gauge<f64, AtomicU64>> = Family::default();
    let reachable: Family<UpstreamLabel, Gauge> = Family::default();
    let unusable: Family<UpstreamLabel, Gauge> = Family::default();
    let active_upstream: Family<UpstreamLabel, Gauge> = Family::default();

    let mode: Gauge = Gauge::default();
    let tcp_active: Gauge = Gauge::default();
    let udp_mappings_active: Gauge = Gauge::default();
    let bytes_up_total: Gauge<f64, AtomicU64> = Gauge::default();
    let bytes_down_total: Gauge<f64, AtomicU64> = Gauge::default();
    let bytes_up_per_second: Gauge<f64, AtomicU64> = Gauge::default();
    let bytes_down_per_second: Gauge<f64, AtomicU64> = Gauge::default();
    let memory_alloc_bytes: Gauge<f64, AtomicU64> = Gauge::default();
    let uptime_seconds: Gauge<f64, AtomicU64> = Gauge::default();
    let scheduler_skipped: Gauge = Gauge::default();

    let window = scoring.utilization_window_sec;
    let capacity_bps = (scoring.ref_bw_up_bps + scoring.ref_bw_down_bps).max(1.0);
    let active_tag = state.manager.active();

    for tag in state.manager.tags() {
        let label = UpstreamLabel { upstream: tag.clone() };
        let rates = state.metrics.rates(&tag, window);
        bandwidth_up_bps.get_or_create(&label).set(rates.up_bps());
        bandwidth_down_bps.get_or_create(&label).set(rates.down_bps());
        bandwidth_tcp_up_bps.get_or_create(&label).set(rates.up_tcp_bps);
        bandwidth_tcp_down_bps.get_or_create(&label).set(rates.down_tcp_bps);
        bandwidth_udp_up_bps.get_or_create(&label).set(rates.up_udp_bps);
        bandwidth_udp_down_bps.get_or_create(&label).set(rates.down_udp_bps);
        utilization
            .get_or_create(&label)
            .set((rates.up_bps() + rates.down_bps()) / capacity_bps);

        if let Some((upstream, metrics, usable)) = state.manager.snapshot(&tag) {
            rtt_ms.get_or_create(&label).set(metrics.rtt_ms);
            jitter_ms.get_or_create(&label).set(metrics.jitter_ms);
            retrans_rate.get_or_create(&label).set(metrics.retrans_rate);
            loss_rate.get_or_create(&label).set(metrics.loss_rate);
            loss.get_or_create(&label).set(metrics.retrans_rate.max(metrics.loss_rate));
            unusable.get_or_create(&label).set(if usable { 0 } else { 1 });

            let breakdown = crate::scorer::score(&metrics, 0.0, upstream.priority, upstream.bias, &scoring);
            score_tcp.get_or_create(&label).set(breakdown.score_tcp);
            score_udp.get_or_create(&label).set(breakdown.score_udp);
            score_overall.get_or_create(&label).set(breakdown.base);
            score.get_or_create(&label).set(breakdown.score);
        }
        if let Some(r) = state.manager.reachable(&tag) {
            reachable.get_or_create(&label).set(if r { 1 } else { 0 });
        }
        active_upstream
            .get_or_create(&label)
            .set(if Some(&tag) == active_tag.as_ref() { 1 } else { 0 });
    }

    mode.set(match state.manager.mode() {
        ManagerMode::Auto => 0,
        ManagerMode::Manual(_) => 1,
    });
    tcp_active.set(state.status.count_by_kind(crate::status::FlowKind::Tcp) as i64);
    udp_mappings_active.set(state.status.count_by_kind(crate::status::FlowKind::Udp) as i64);
    let (total_up, total_down) = state.metrics.aggregate_totals();
    bytes_up_total.set(total_up as f64);
    bytes_down_total.set(total_down as f64);
    let agg_rates = state.metrics.aggregate_rates(window);
    bytes_up_per_second.set(agg_rates.up_bps() / 8.0);
    bytes_down_per_second.set(agg_rates.down_bps() / 8.0);
    memory_alloc_bytes.set(current_memory_bytes());
    uptime_seconds.set(state.metrics.uptime().as_secs_f64());
    scheduler_skipped.set(state.scheduler.skipped_total() as i64);

    registry.register("fbforward_upstream_rtt_ms", "Smoothed RTT per upstream.", rtt_ms);
    registry.register("fbforward_upstream_jitter_ms", "Smoothed jitter per upstream.", jitter_ms);
    registry.register(
        "fbforward_upstream_bandwidth_up_bps",
        "Upload bits/sec per upstream, TCP + UDP.",
        bandwidth_up_bps,
    );
    registry.register(
        "fbforward_upstream_bandwidth_down_bps",
        "Download bits/sec per upstream, TCP + UDP.",
        bandwidth_down_bps,
    );
    registry.register(
        "fbforward_upstream_bandwidth_tcp_up_bps",
        "TCP upload bits/sec per upstream.",
        bandwidth_tcp_up_bps,
    );
    registry.register(
        "fbforward_upstream_bandwidth_tcp_down_bps",
        "TCP download bits/sec per upstream.",
        bandwidth_tcp_down_bps,
    );
    registry.register(
        "fbforward_upstream_bandwidth_udp_up_bps",
        "UDP upload bits/sec per upstream.",
        bandwidth_udp_up_bps,
    );
    registry.register(
        "fbforward_upstream_bandwidth_udp_down_bps",
        "UDP download bits/sec per upstream.",
        bandwidth_udp_down_bps,
    );
    registry.register(
        "fbforward_upstream_retrans_rate",
        "Smoothed TCP retransmit rate per upstream.",
        retrans_rate,
    );
    registry.register(
        "fbforward_upstream_loss_rate",
        "Smoothed UDP loss rate per upstream.",
        loss_rate,
    );
    registry.register(
        "fbforward_upstream_loss",
        "Worse of retransmit and loss rate per upstream.",
        loss,
    );
    registry.register("fbforward_upstream_score_tcp", "TCP sub-score per upstream.", score_tcp);
    registry.register("fbforward_upstream_score_udp", "UDP sub-score per upstream.", score_udp);
    registry.register(
        "fbforward_upstream_score_overall",
        "Protocol-weighted score before utilization/bias multipliers.",
        score_overall,
    );
    registry.register(
        "fbforward_upstream_score",
        "Final selection score per upstream.",
        score,
    );
    registry.register(
        "fbforward_upstream_utilization",
        "Forwarded throughput over reference bandwidth per upstream.",
        utilization,
    );
    registry.register(
        "fbforward_upstream_reachable",
        "1 if the last measurement round reached this upstream.",
        reachable,
    );
    registry.register(
        "fbforward_upstream_unusable",
        "1 if this upstream is excluded from selection.",
        unusable,
    );
    registry.register(
        "fbforward_upstream_active_upstream",
        "1 if this upstream is currently active, else 0.",
        active_upstream,
    );

    registry.register("fbforward_mode", "0 = auto, 1 = manual.", mode);
    registry.register("fbforward_tcp_active", "Live TCP flow count.", tcp_active);
    registry.register(
        "fbforward_udp_mappings_active",
        "Live UDP mapping count.",
        udp_mappings_active,
    );
    registry.register(
        "fbforward_bytes_up_total",
        "Cumulative uploaded bytes, all upstreams.",
        bytes_up_total,
    );
    registry.register(
        "fbforward_bytes_down_total",
        "Cumulative downloaded bytes, all upstreams.",
        bytes_down_total,
    );
    registry.register(
        "fbforward_bytes_up_per_second",
        "Aggregate upload bytes/sec, all upstreams.",
        bytes_up_per_second,
    );
    registry.register(
        "fbforward_bytes_down_per_second",
        "Aggregate download bytes/sec, all upstreams.",
        bytes_down_per_second,
    );
    registry.register(
        "fbforward_memory_alloc_bytes",
        "Process peak resident set size in bytes.",
        memory_alloc_bytes,
    );
    registry.register("fbforward_uptime_seconds", "Seconds since process start.", uptime_seconds);
    registry.register(
        "fbforward_scheduler_skipped_total",
        "Measurement jobs skipped for lack of headroom.",
        scheduler_skipped,
    );

    let mut buffer = String::new();
    prometheus_client::encoding::text::encode(&mut buffer, &registry).unwrap();
    ([("content-type", "application/openmetrics-text; version=1.0.0; charset=utf-8")], buffer)
}

#[cfg(target_os = "linux")]
fn current_memory_bytes() -> f64 {
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    if unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) } == 0 {
        usage.ru_maxrss as f64 * 1024.0
    } else {
        0.0
    }
}

#[cfg(not(target_os = "linux"))]
fn current_memory_bytes() -> f64 {
    0.0
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    mode: String,
    active: Option<String>,
    flows: Vec<crate::status::FlowSnapshot>,
}

async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        mode: match state.manager.mode() {
            ManagerMode::Auto => "auto".to_string(),
            ManagerMode::Manual(tag) => format!("manual:{tag}"),
        },
        active: state.manager.active(),
        flows: state.status.snapshot_all(),
    })
}

#[derive(Debug, Serialize)]
struct UpstreamSummary {
    tag: String,
    usable: bool,
    score_inputs: crate::scorer::ScoreBreakdown,
}

async fn list_upstreams(State(state): State<AppState>) -> Json<Vec<UpstreamSummary>> {
    let mut out = Vec::new();
    for tag in state.manager.tags() {
        if let Some((_, metrics, usable)) = state.manager.snapshot(&tag) {
            let breakdown = crate::scorer::score(
                &metrics,
                0.0,
                0,
                0.0,
                &crate::config::ScoringConfig::default(),
            );
            out.push(UpstreamSummary { tag, usable, score_inputs: breakdown });
        }
    }
    Json(out)
}

#[derive(Debug, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
enum SetUpstreamRequest {
    Auto,
    Manual { tag: String },
}

async fn set_upstream(
    State(state): State<AppState>,
    Json(req): Json<SetUpstreamRequest>,
) -> impl IntoResponse {
    match req {
        SetUpstreamRequest::Auto => state.manager.set_auto(),
        SetUpstreamRequest::Manual { tag } => state.manager.set_manual(tag),
    }
    Json(serde_json::json!({"ok": true}))
}

#[derive(Debug, Serialize)]
struct QueueStatus {
    skipped_total: u64,
}

async fn get_queue_status(State(state): State<AppState>) -> Json<QueueStatus> {
    Json(QueueStatus {
        skipped_total: state.scheduler.skipped_total(),
    })
}

async fn status_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_status_ws(socket, state))
}

async fn handle_status_ws(mut socket: WebSocket, state: AppState) {
    let snapshot = StatusEvent::Snapshot {
        flows: state.status.snapshot_all(),
    };
    if send_event(&mut socket, &snapshot).await.is_err() {
        return;
    }
    let mut rx = state.status.subscribe();
    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Ok(event) => {
                        if send_event(&mut socket, &event).await.is_err() {
                            return;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        debug!(skipped = n, "status ws receiver lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Err(_)) => return,
                    _ => {}
                }
            }
        }
    }
}

async fn send_event(socket: &mut WebSocket, event: &StatusEvent) -> Result<(), axum::Error> {
    let text = serde_json::to_string(event).unwrap_or_default();
    socket.send(Message::Text(text)).await
}
