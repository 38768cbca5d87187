//! Per-upstream byte counters and the rolling-window rate calculator that
//! turns raw cumulative totals into `GetRates`/`GetAggregateRates` bits/sec.
//!
//! Counters are lock-free atomics on the hot path (every forwarded write
//! bumps one); the rolling window is maintained by a 1 Hz ticker and read
//! under a lock, matching the "all counters are lock-free atomics on the hot
//! path; derived snapshots are locked" split.

use common::model::{Direction, Protocol, UpstreamTag};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const MAX_WINDOW_BUCKETS: usize = 300; // 5 minutes of 1s buckets

#[derive(Debug, Default)]
pub struct ByteCounters {
    pub bytes_up_tcp: AtomicU64,
    pub bytes_down_tcp: AtomicU64,
    pub bytes_up_udp: AtomicU64,
    pub bytes_down_udp: AtomicU64,
}

impl ByteCounters {
    fn add(&self, protocol: Protocol, direction: Direction, n: u64) {
        let field = match (protocol, direction) {
            (Protocol::Tcp, Direction::Upload) => &self.bytes_up_tcp,
            (Protocol::Tcp, Direction::Download) => &self.bytes_down_tcp,
            (Protocol::Udp, Direction::Upload) => &self.bytes_up_udp,
            (Protocol::Udp, Direction::Download) => &self.bytes_down_udp,
        };
        field.fetch_add(n, Ordering::Relaxed);
    }

    pub fn total_up(&self) -> u64 {
        self.bytes_up_tcp.load(Ordering::Relaxed) + self.bytes_up_udp.load(Ordering::Relaxed)
    }

    pub fn total_down(&self) -> u64 {
        self.bytes_down_tcp.load(Ordering::Relaxed) + self.bytes_down_udp.load(Ordering::Relaxed)
    }

    fn snapshot(&self) -> Totals {
        Totals {
            up_tcp: self.bytes_up_tcp.load(Ordering::Relaxed),
            down_tcp: self.bytes_down_tcp.load(Ordering::Relaxed),
            up_udp: self.bytes_up_udp.load(Ordering::Relaxed),
            down_udp: self.bytes_down_udp.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Totals {
    up_tcp: u64,
    down_tcp: u64,
    up_udp: u64,
    down_udp: u64,
}

/// One second's worth of byte deltas, bits/sec already divided by the
/// observed tick duration so a slow tick doesn't skew the rate.
#[derive(Debug, Clone, Copy, Default)]
struct SecondBucket {
    up_tcp_bps: f64,
    down_tcp_bps: f64,
    up_udp_bps: f64,
    down_udp_bps: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RateSnapshot {
    pub up_tcp_bps: f64,
    pub down_tcp_bps: f64,
    pub up_udp_bps: f64,
    pub down_udp_bps: f64,
}

impl RateSnapshot {
    pub fn up_bps(&self) -> f64 {
        self.up_tcp_bps + self.up_udp_bps
    }

    pub fn down_bps(&self) -> f64 {
        self.down_tcp_bps + self.down_udp_bps
    }
}

struct PerUpstream {
    counters: Arc<ByteCounters>,
    last_totals: Totals,
    last_tick: Instant,
    window: VecDeque<SecondBucket>,
}

/// Rolling per-upstream byte counters plus the 1 Hz ticker that turns them
/// into windowed bits/sec rates.
pub struct MetricsRegistry {
    upstreams: RwLock<HashMap<UpstreamTag, PerUpstream>>,
    started_at: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            upstreams: RwLock::new(HashMap::new()),
            started_at: Instant::now(),
        })
    }

    pub fn register_upstream(&self, tag: &str) {
        self.upstreams
            .write()
            .entry(tag.to_string())
            .or_insert_with(|| PerUpstream {
                counters: Arc::new(ByteCounters::default()),
                last_totals: Totals::default(),
                last_tick: Instant::now(),
                window: VecDeque::with_capacity(MAX_WINDOW_BUCKETS),
            });
    }

    pub fn counters(&self, tag: &str) -> Option<Arc<ByteCounters>> {
        self.upstreams.read().get(tag).map(|p| p.counters.clone())
    }

    pub fn add_bytes(&self, tag: &str, protocol: Protocol, direction: Direction, n: u64) {
        self.register_upstream(tag);
        if let Some(entry) = self.upstreams.read().get(tag) {
            entry.counters.add(protocol, direction, n);
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn tags(&self) -> Vec<UpstreamTag> {
        self.upstreams.read().keys().cloned().collect()
    }

    /// Compute this tick's deltas-as-bps for every tracked upstream and push
    /// into its rolling window. Run at 1 Hz by the caller.
    pub fn tick(&self) {
        let mut upstreams = self.upstreams.write();
        let now = Instant::now();
        for entry in upstreams.values_mut() {
            let totals = entry.counters.snapshot();
            let elapsed = now.duration_since(entry.last_tick).as_secs_f64().max(1e-3);
            let bucket = SecondBucket {
                up_tcp_bps: (totals.up_tcp.saturating_sub(entry.last_totals.up_tcp) as f64 * 8.0)
                    / elapsed,
                down_tcp_bps: (totals.down_tcp.saturating_sub(entry.last_totals.down_tcp) as f64
                    * 8.0)
                    / elapsed,
                up_udp_bps: (totals.up_udp.saturating_sub(entry.last_totals.up_udp) as f64 * 8.0)
                    / elapsed,
                down_udp_bps: (totals.down_udp.saturating_sub(entry.last_totals.down_udp) as f64
                    * 8.0)
                    / elapsed,
            };
            entry.window.push_back(bucket);
            while entry.window.len() > MAX_WINDOW_BUCKETS {
                entry.window.pop_front();
            }
            entry.last_totals = totals;
            entry.last_tick = now;
        }
    }

    /// Average bits/sec over the last `window` (clamped to buckets available),
    /// split by protocol and direction, for one upstream.
    pub fn rates(&self, tag: &str, window: Duration) -> RateSnapshot {
        let upstreams = self.upstreams.read();
        let Some(entry) = upstreams.get(tag) else {
            return RateSnapshot::default();
        };
        average_window(&entry.window, window)
    }

    /// Same, summed across every tracked upstream.
    pub fn aggregate_rates(&self, window: Duration) -> RateSnapshot {
        let upstreams = self.upstreams.read();
        let mut agg = RateSnapshot::default();
        for entry in upstreams.values() {
            let r = average_window(&entry.window, window);
            agg.up_tcp_bps += r.up_tcp_bps;
            agg.down_tcp_bps += r.down_tcp_bps;
            agg.up_udp_bps += r.up_udp_bps;
            agg.down_udp_bps += r.down_udp_bps;
        }
        agg
    }

    /// Sum of every upstream's monotonic cumulative totals.
    pub fn aggregate_totals(&self) -> (u64, u64) {
        let upstreams = self.upstreams.read();
        upstreams.values().fold((0, 0), |(up, down), entry| {
            (up + entry.counters.total_up(), down + entry.counters.total_down())
        })
    }

    pub async fn run_ticker(self: Arc<Self>, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = interval.tick() => self.tick(),
                _ = shutdown.recv() => return,
            }
        }
    }
}

fn average_window(window: &VecDeque<SecondBucket>, requested: Duration) -> RateSnapshot {
    let n = (requested.as_secs_f64().ceil() as usize)
        .clamp(1, window.len().max(1))
        .min(window.len().max(1));
    if window.is_empty() {
        return RateSnapshot::default();
    }
    let take = n.min(window.len());
    let slice = window.iter().rev().take(take);
    let mut sum = SecondBucket::default();
    let mut count = 0usize;
    for b in slice {
        sum.up_tcp_bps += b.up_tcp_bps;
        sum.down_tcp_bps += b.down_tcp_bps;
        sum.up_udp_bps += b.up_udp_bps;
        sum.down_udp_bps += b.down_udp_bps;
        count += 1;
    }
    let count = count.max(1) as f64;
    RateSnapshot {
        up_tcp_bps: sum.up_tcp_bps / count,
        down_tcp_bps: sum.down_tcp_bps / count,
        up_udp_bps: sum.up_udp_bps / count,
        down_udp_bps: sum.down_udp_bps / count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_bytes_splits_by_protocol_and_direction() {
        let reg = MetricsRegistry::new();
        reg.add_bytes("a", Protocol::Tcp, Direction::Upload, 100);
        reg.add_bytes("a", Protocol::Udp, Direction::Download, 50);
        let c = reg.counters("a").unwrap();
        assert_eq!(c.bytes_up_tcp.load(Ordering::Relaxed), 100);
        assert_eq!(c.bytes_down_udp.load(Ordering::Relaxed), 50);
        assert_eq!(c.total_up(), 100);
        assert_eq!(c.total_down(), 50);
    }

    #[test]
    fn tick_computes_bits_per_second_from_deltas() {
        let reg = MetricsRegistry::new();
        reg.register_upstream("a");
        reg.add_bytes("a", Protocol::Tcp, Direction::Upload, 125_000); // 1,000,000 bits
        reg.tick();
        let rates = reg.rates("a", Duration::from_secs(1));
        assert!(rates.up_tcp_bps > 0.0);
    }

    #[test]
    fn aggregate_rates_sum_across_upstreams() {
        let reg = MetricsRegistry::new();
        reg.add_bytes("a", Protocol::Tcp, Direction::Upload, 1000);
        reg.add_bytes("b", Protocol::Tcp, Direction::Upload, 2000);
        reg.tick();
        let agg = reg.aggregate_rates(Duration::from_secs(1));
        let a = reg.rates("a", Duration::from_secs(1));
        let b = reg.rates("b", Duration::from_secs(1));
        assert!((agg.up_tcp_bps - (a.up_tcp_bps + b.up_tcp_bps)).abs() < 1e-6);
    }

    #[test]
    fn unknown_tag_returns_zero_rates() {
        let reg = MetricsRegistry::new();
        let r = reg.rates("missing", Duration::from_secs(1));
        assert_eq!(r.up_bps(), 0.0);
    }
}
