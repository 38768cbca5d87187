//! The shared upstream/flow/sample data model: the types shared between the
//! probe engine (`bwprobe`) and the forwarder (`fbforward`).

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Forwarded transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// Upload or download, from the vantage point of the upstream being measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Upload,
    Download,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Upload => "up",
            Direction::Download => "down",
        }
    }
}

/// Unique identifier for a configured upstream.
pub type UpstreamTag = String;

/// One 100ms accounting bucket inside a sample.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct IntervalBucket {
    pub bytes: u64,
    pub duration_ms: u64,
    pub ooo_count: u64,
}

impl IntervalBucket {
    /// Bits-per-second for this single bucket; 0 if the bucket has no
    /// elapsed duration yet.
    pub fn bps(&self) -> f64 {
        if self.duration_ms == 0 {
            0.0
        } else {
            (self.bytes as f64 * 8.0) / (self.duration_ms as f64 / 1000.0)
        }
    }
}

/// TCP_INFO-derived counters snapshotted at sample stop.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TcpInfoSnapshot {
    pub segs_out: u64,
    pub data_segs_out: u64,
    pub total_retrans: u64,
    pub bytes_sent: u64,
    pub bytes_retrans: u64,
    pub snd_mss: u32,
}

impl TcpInfoSnapshot {
    pub fn retransmits(&self) -> u64 {
        self.total_retrans
    }

    pub fn segments_sent(&self) -> u64 {
        self.segs_out.max(self.data_segs_out)
    }
}

/// A complete measurement sample: the per-100ms bucket series plus UDP/TCP
/// loss and retransmit accounting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SampleMetricRecord {
    pub sample_id: u32,
    pub total_bytes: u64,
    pub intervals: Vec<IntervalBucket>,
    pub packets_recv: u64,
    pub packets_lost: u64,
    pub tcp_info: Option<TcpInfoSnapshot>,
    pub total_duration_secs: f64,
}

/// Smoothed per-upstream sub-metrics, each independently EMA-tracked: the
/// first sample overwrites; subsequent ones blend as `x <- a*new + (1-a)*x`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubMetrics {
    pub bandwidth_up_tcp_bps: f64,
    pub bandwidth_down_tcp_bps: f64,
    pub bandwidth_up_udp_bps: f64,
    pub bandwidth_down_udp_bps: f64,
    pub rtt_ms: f64,
    pub jitter_ms: f64,
    pub retrans_rate: f64,
    pub loss_rate: f64,
}

/// One EMA-smoothed scalar, tracking whether it has been initialized yet
/// (the first sample overwrites rather than blending).
#[derive(Debug, Clone, Copy, Default)]
pub struct Ema {
    pub value: f64,
    pub initialized: bool,
}

impl Ema {
    pub fn update(&mut self, new_value: f64, alpha: f64) {
        if !self.initialized {
            self.value = new_value;
            self.initialized = true;
        } else {
            self.value = alpha * new_value + (1.0 - alpha) * self.value;
        }
    }
}

/// Mutable per-upstream state: smoothed metrics, reachability/usability,
/// dial-failure bookkeeping. The EMA-initialized flags are carried inside
/// each [`Ema`].
#[derive(Debug, Clone)]
pub struct UpstreamState {
    pub bandwidth_up_tcp: Ema,
    pub bandwidth_down_tcp: Ema,
    pub bandwidth_up_udp: Ema,
    pub bandwidth_down_udp: Ema,
    pub rtt_ms: Ema,
    pub jitter_ms: Ema,
    pub retrans_rate: Ema,
    pub loss_rate: Ema,
    pub reachable: bool,
    pub dial_fail_count: u32,
    pub dial_cooldown_until: Option<Instant>,
}

impl Default for UpstreamState {
    fn default() -> Self {
        Self {
            bandwidth_up_tcp: Ema::default(),
            bandwidth_down_tcp: Ema::default(),
            bandwidth_up_udp: Ema::default(),
            bandwidth_down_udp: Ema::default(),
            rtt_ms: Ema::default(),
            jitter_ms: Ema::default(),
            retrans_rate: Ema::default(),
            loss_rate: Ema::default(),
            reachable: true,
            dial_fail_count: 0,
            dial_cooldown_until: None,
        }
    }
}

impl UpstreamState {
    /// `usable` iff `loss == 1` is false and dial-failure count is below the
    /// caller-supplied threshold and the cooldown has elapsed.
    pub fn usable(&self, dial_fail_threshold: u32) -> bool {
        if self.loss_rate.value >= 1.0 {
            return false;
        }
        if self.dial_fail_count >= dial_fail_threshold {
            if let Some(until) = self.dial_cooldown_until {
                if Instant::now() < until {
                    return false;
                }
            } else {
                return false;
            }
        }
        true
    }

    pub fn snapshot(&self) -> SubMetrics {
        SubMetrics {
            bandwidth_up_tcp_bps: self.bandwidth_up_tcp.value,
            bandwidth_down_tcp_bps: self.bandwidth_down_tcp.value,
            bandwidth_up_udp_bps: self.bandwidth_up_udp.value,
            bandwidth_down_udp_bps: self.bandwidth_down_udp.value,
            rtt_ms: self.rtt_ms.value,
            jitter_ms: self.jitter_ms.value,
            retrans_rate: self.retrans_rate.value,
            loss_rate: self.loss_rate.value,
        }
    }

    pub fn mark_dial_failure(&mut self, cooldown: Duration) {
        self.dial_fail_count += 1;
        self.dial_cooldown_until = Some(Instant::now() + cooldown);
        self.reachable = false;
    }

    pub fn clear_dial_failure(&mut self) {
        self.dial_fail_count = 0;
        self.dial_cooldown_until = None;
        self.reachable = true;
    }
}

/// Static, configuration-derived identity of a forwarding destination.
#[derive(Debug, Clone)]
pub struct Upstream {
    pub tag: UpstreamTag,
    pub origin_host: String,
    pub resolved_ips: Vec<IpAddr>,
    pub active_ip: IpAddr,
    pub measure_host: String,
    pub measure_port: u16,
    pub priority: u32,
    pub bias: f64,
}

impl Upstream {
    pub fn new(
        tag: UpstreamTag,
        origin_host: String,
        active_ip: IpAddr,
        measure_host: String,
        measure_port: u16,
        priority: u32,
        bias: f64,
    ) -> Self {
        Self {
            tag,
            origin_host,
            resolved_ips: vec![active_ip],
            active_ip,
            measure_host,
            measure_port,
            priority,
            bias: bias.clamp(-1.0, 1.0),
        }
    }
}

/// `(protocol, client_addr_ip, client_addr_port, listener_port)` — the flow
/// identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub protocol: Protocol,
    pub client_ip: IpAddr,
    pub client_port: u16,
    pub listener_port: u16,
}

impl std::fmt::Display for FlowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}->:{}",
            self.protocol.as_str(),
            self.client_ip,
            self.client_port,
            self.listener_port
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_first_sample_overwrites() {
        let mut ema = Ema::default();
        ema.update(42.0, 0.2);
        assert_eq!(ema.value, 42.0);
        ema.update(0.0, 0.2);
        assert!((ema.value - 33.6).abs() < 1e-9);
    }

    #[test]
    fn usable_false_when_loss_is_one() {
        let mut state = UpstreamState::default();
        state.loss_rate.update(1.0, 1.0);
        assert!(!state.usable(10));
    }

    #[test]
    fn usable_false_during_cooldown() {
        let mut state = UpstreamState::default();
        state.mark_dial_failure(Duration::from_secs(5));
        state.dial_fail_count = 2;
        assert!(!state.usable(2));
    }
}
