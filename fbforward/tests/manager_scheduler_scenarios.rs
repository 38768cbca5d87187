//! End-to-end scenarios over the public manager/scheduler/status API: a
//! hysteresis-confirmed switch, a fast dial-failure failover, and a
//! scheduler that skips a job rather than overloading a saturated link.

use common::model::{Direction, Protocol};
use fbforward::config::{ScoringConfig, SwitchingConfig, UpstreamConfig};
use fbforward::manager::UpstreamManager;
use fbforward::metrics::MetricsRegistry;
use fbforward::scheduler::{has_headroom, MeasurementScheduler};
use fbforward::status::StatusStore;
use std::time::Duration;

fn two_upstreams() -> Vec<UpstreamConfig> {
    vec![
        UpstreamConfig {
            tag: "primary".into(),
            host: "10.0.0.1".into(),
            measure_host: None,
            measure_port: 7575,
            priority: 0,
            bias: 0.0,
        },
        UpstreamConfig {
            tag: "backup".into(),
            host: "10.0.0.2".into(),
            measure_host: None,
            measure_port: 7575,
            priority: 0,
            bias: 0.0,
        },
    ]
}

// S3: a sustained quality advantage, confirmed over several samples, wins
// out over a transient one-off that doesn't clear the hold timer.
#[tokio::test]
async fn s3_switch_requires_confirmation_and_respects_hold() {
    let status = StatusStore::new();
    let mut switching = SwitchingConfig::default();
    switching.switch_threshold = 0.15;
    switching.confirm_duration = 3;
    switching.min_hold_seconds = Duration::from_secs(0);
    let manager = UpstreamManager::new(&two_upstreams(), switching, ScoringConfig::default(), status);

    manager.record_sample(
        "primary",
        Protocol::Tcp,
        Direction::Upload,
        2_000_000.0,
        80.0,
        5.0,
        Some(0.0),
        Some(0.0),
    );
    // Force an initial active pick (the real bootstrap is fast_start; here
    // we just drive one sample so `active` gets set by the first reselect).
    assert!(manager.active().is_some());
    let initial = manager.active().unwrap();

    // One good sample for the other upstream is not enough: confirm_duration
    // requires three consecutive reselect passes agreeing on the same best.
    manager.record_sample(
        "backup",
        Protocol::Tcp,
        Direction::Upload,
        40_000_000.0,
        5.0,
        1.0,
        Some(0.0),
        Some(0.0),
    );
    if initial == "primary" {
        assert_eq!(manager.active().as_deref(), Some("primary"));
    }

    // Two more identical samples complete the confirmation window.
    for _ in 0..2 {
        manager.record_sample(
            "backup",
            Protocol::Tcp,
            Direction::Upload,
            40_000_000.0,
            5.0,
            1.0,
            Some(0.0),
            Some(0.0),
        );
    }
    assert_eq!(manager.active().as_deref(), Some("backup"));
}

// S4: a run of dial failures on the active upstream forces an immediate
// failover to the other usable upstream, bypassing the normal hold/confirm
// hysteresis entirely.
#[tokio::test]
async fn s4_dial_failures_force_immediate_failover() {
    let status = StatusStore::new();
    let mut switching = SwitchingConfig::default();
    switching.dial_fail_switch_count = 2;
    switching.min_hold_seconds = Duration::from_secs(3600);
    switching.confirm_duration = 100;
    let manager = UpstreamManager::new(&two_upstreams(), switching, ScoringConfig::default(), status);

    manager.record_sample(
        "backup",
        Protocol::Tcp,
        Direction::Upload,
        1_000_000.0,
        100.0,
        5.0,
        Some(0.0),
        Some(0.0),
    );
    let primary_was_active = manager.active().as_deref() == Some("primary");

    manager.mark_dial_failure("primary", Duration::from_secs(5));
    manager.mark_dial_failure("primary", Duration::from_secs(5));

    if primary_was_active {
        assert_eq!(manager.active().as_deref(), Some("backup"));
    }
}

// S5: the scheduler must not hand out a job whose target bandwidth would
// push a near-saturated link over its configured utilization ceiling; it
// should skip and count the skip rather than stall forever.
#[tokio::test]
async fn s5_scheduler_skips_measurement_on_saturated_link() {
    let tags = vec!["primary".to_string()];
    let scheduler = MeasurementScheduler::new(
        &tags,
        Duration::from_millis(1),
        Duration::from_millis(1),
        Duration::from_millis(1),
    );
    let metrics = MetricsRegistry::new();
    metrics.register_upstream("primary");
    // Simulate heavy existing utilization: 95 Mbps already flowing.
    metrics.add_bytes(
        "primary",
        Protocol::Tcp,
        Direction::Upload,
        (95_000_000.0 / 8.0) as u64,
    );
    metrics.tick();

    let capacity = 100_000_000.0;
    let job = scheduler.try_dequeue(|(tag, _protocol, direction)| {
        let rates = metrics.rates(tag, Duration::from_secs(1));
        let current = match direction {
            Direction::Upload => rates.up_bps(),
            Direction::Download => rates.down_bps(),
        };
        has_headroom(current, Some(capacity), 10_000_000.0, 0.0, 0.8)
    });

    assert!(job.is_none());
    assert_eq!(scheduler.skipped_total(), 1);
}
