//! Entry point: load configuration, build the upstream manager and the
//! measurement/metrics/status plumbing, and spawn one task per listener plus
//! the background measurement and control-plane loops.

use bwprobe::client::{CancelToken, ProbeClient, RunParams};
use clap::Parser;
use common::model::{Direction, Protocol};
use fbforward::config::Config;
use fbforward::http::{self, AppState};
use fbforward::manager::UpstreamManager;
use fbforward::metrics::MetricsRegistry;
use fbforward::scheduler::MeasurementScheduler;
use fbforward::status::StatusStore;
use fbforward::tcp_forwarder::TcpForwarder;
use fbforward::udp_forwarder::UdpForwarder;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fbforward", about = "Path-aware L4 TCP/UDP forwarder")]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "fbforward.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = Config::load_or_default(&args.config);

    let filter = EnvFilter::try_new(&config.logging.level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!(upstreams = config.upstreams.len(), "fbforward starting");

    let status = StatusStore::new();
    let metrics = MetricsRegistry::new();
    let manager = UpstreamManager::new(
        &config.upstreams,
        config.switching.clone(),
        config.scoring.clone(),
        status.clone(),
    );
    let tags: Vec<String> = config.upstreams.iter().map(|u| u.tag.clone()).collect();
    let scheduler = Arc::new(MeasurementScheduler::new(
        &tags,
        config.measurement.schedule.min_interval,
        config.measurement.schedule.max_interval,
        config.measurement.schedule.inter_upstream_gap,
    ));

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    run_fast_start(&manager, &config).await;

    spawn_measurement_loop(
        manager.clone(),
        scheduler.clone(),
        metrics.clone(),
        config.clone(),
        shutdown_tx.subscribe(),
    );
    tokio::spawn(metrics.clone().run_ticker(shutdown_tx.subscribe()));
    spawn_dns_refresh(manager.clone(), config.clone(), shutdown_tx.subscribe());

    for listener_cfg in &config.forwarding.listeners {
        let bind_addr = format!("{}:{}", listener_cfg.addr, listener_cfg.port);
        match listener_cfg.protocol {
            Protocol::Tcp => {
                let listener = TcpListener::bind(&bind_addr).await?;
                tracing::info!(addr = %bind_addr, "tcp listener bound");
                let forwarder = TcpForwarder::new(
                    manager.clone(),
                    status.clone(),
                    metrics.clone(),
                    config.limits.max_tcp_conns,
                    Duration::from_secs(config.timeouts.tcp_idle_seconds),
                );
                tokio::spawn(forwarder.serve(listener, listener_cfg.port, shutdown_tx.subscribe()));
            }
            Protocol::Udp => {
                let socket = UdpSocket::bind(&bind_addr).await?;
                tracing::info!(addr = %bind_addr, "udp listener bound");
                let forwarder = UdpForwarder::new(
                    manager.clone(),
                    status.clone(),
                    metrics.clone(),
                    Duration::from_secs(config.timeouts.udp_idle_seconds),
                    config.limits.max_udp_mappings,
                );
                tokio::spawn(forwarder.serve(socket, listener_cfg.port, shutdown_tx.subscribe()));
            }
        }
    }

    let app_state = AppState {
        manager: manager.clone(),
        status: status.clone(),
        metrics: metrics.clone(),
        scheduler: scheduler.clone(),
    };
    let router = http::router(app_state);
    let metrics_listener = TcpListener::bind(&config.metrics.listen).await?;
    tracing::info!(addr = %config.metrics.listen, "control plane listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(metrics_listener, router).await {
            tracing::error!(error = %e, "control plane server exited");
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    let _ = shutdown_tx.send(());
    status.close_all();
    Ok(())
}

/// Run one RTT-only probe per upstream concurrently so the manager can make
/// an immediate pick instead of forwarding blind during the first warmup
/// window.
async fn run_fast_start(manager: &Arc<UpstreamManager>, config: &Config) {
    let timeout = config.measurement.fast_start_timeout;
    let mut rtts = HashMap::new();
    for tag in manager.tags() {
        let Some((host, port)) = manager.measure_endpoint(&tag) else {
            continue;
        };
        let params = RunParams {
            target_host: host,
            target_port: port,
            bandwidth_target_bps: 1_000_000.0,
            chunk_size: 256,
            sample_count: 1,
            payload_bytes_per_sample: 4096,
            inter_sample_wait: Duration::from_millis(0),
            direction: Direction::Upload,
            protocol: Protocol::Tcp,
            rtt_hint_ms: None,
            rtt_sample_rate_hz: 4.0,
        };
        let client = ProbeClient::new(params);
        let cancel = CancelToken::new();
        let rtt_ms = match tokio::time::timeout(timeout, probe_single_rtt(&client, cancel)).await {
            Ok(Some(ms)) => ms,
            _ => continue,
        };
        rtts.insert(tag, rtt_ms);
    }
    manager.fast_start(&rtts, config.measurement.warmup_duration);
}

/// A single best-effort RTT sample used only by fast start; the regular
/// measurement loop takes over with full-sized samples afterwards.
async fn probe_single_rtt(client: &ProbeClient, cancel: CancelToken) -> Option<f64> {
    let result = client.run(cancel, None).await.ok()?;
    if result.rtt.count > 0 {
        Some(result.rtt.mean_ms())
    } else {
        None
    }
}

fn spawn_measurement_loop(
    manager: Arc<UpstreamManager>,
    scheduler: Arc<MeasurementScheduler>,
    metrics: Arc<MetricsRegistry>,
    config: Config,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut poll = tokio::time::interval(Duration::from_millis(250));
        loop {
            tokio::select! {
                _ = poll.tick() => {
                    run_due_measurements(&manager, &scheduler, &metrics, &config).await;
                }
                _ = shutdown.recv() => return,
            }
        }
    });
}

async fn run_due_measurements(
    manager: &Arc<UpstreamManager>,
    scheduler: &Arc<MeasurementScheduler>,
    metrics: &Arc<MetricsRegistry>,
    config: &Config,
) {
    let window = config.scoring.utilization_window_sec;
    let max_utilization = config.measurement.schedule.max_utilization;
    let headroom = config.measurement.schedule.required_headroom;

    let Some((tag, protocol, direction)) = scheduler.try_dequeue(|(tag, protocol, direction)| {
        let rates = metrics.rates(tag, window);
        let current = match direction {
            Direction::Upload => rates.up_bps(),
            Direction::Download => rates.down_bps(),
        };
        let target = protocol_target_for(config, *protocol, *direction);
        fbforward::scheduler::has_headroom(current, Some(target * 1.25), target, headroom, max_utilization)
    }) else {
        return;
    };

    let Some((host, port)) = manager.measure_endpoint(&tag) else {
        return;
    };
    let target_bps = protocol_target_for(config, protocol, direction);

    let manager = manager.clone();
    let scheduler = scheduler.clone();
    let tag_for_task = tag.clone();
    tokio::spawn(async move {
        let params = RunParams {
            target_host: host,
            target_port: port,
            bandwidth_target_bps: target_bps,
            chunk_size: 16 * 1024,
            sample_count: 3,
            payload_bytes_per_sample: 1024 * 1024,
            inter_sample_wait: Duration::from_millis(200),
            direction,
            protocol,
            rtt_hint_ms: None,
            rtt_sample_rate_hz: 2.0,
        };
        let client = ProbeClient::new(params);
        match client.run(CancelToken::new(), None).await {
            Ok(result) => {
                manager.record_sample(
                    &tag_for_task,
                    protocol,
                    direction,
                    result.achieved_bps,
                    result.rtt.mean_ms(),
                    result.rtt.stddev_ms(),
                    matches!(protocol, Protocol::Tcp).then_some(result.loss),
                    matches!(protocol, Protocol::Udp).then_some(result.loss),
                );
            }
            Err(e) => {
                tracing::debug!(upstream = %tag_for_task, error = %e, "measurement run failed");
            }
        }
        scheduler.mark_run(&(tag_for_task, protocol, direction));
    });
}

fn protocol_target_for(config: &Config, protocol: Protocol, direction: Direction) -> f64 {
    match (protocol, direction) {
        (Protocol::Tcp, Direction::Upload) => config.measurement.tcp_target_bandwidth_up,
        (Protocol::Tcp, Direction::Download) => config.measurement.tcp_target_bandwidth_down,
        (Protocol::Udp, Direction::Upload) => config.measurement.udp_target_bandwidth_up,
        (Protocol::Udp, Direction::Download) => config.measurement.udp_target_bandwidth_down,
    }
}

fn spawn_dns_refresh(
    manager: Arc<UpstreamManager>,
    config: Config,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    for u in &config.upstreams {
                        if let Ok(resolved) = tokio::net::lookup_host((u.host.as_str(), 0)).await {
                            let ips: Vec<_> = resolved.map(|a| a.ip()).collect();
                            manager.refresh_ips(&u.tag, ips);
                        }
                    }
                }
                _ = shutdown.recv() => return,
            }
        }
    });
}
