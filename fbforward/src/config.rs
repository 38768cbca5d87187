//! YAML configuration: upstream inventory, listeners, measurement/scheduler/
//! scoring/switching knobs and resource limits. Loaded via the `config`
//! crate, with a full key table covering everything this forwarder
//! understands.

use crate::error::{Error, Result};
use common::model::Protocol;
use serde::{Deserialize, Deserializer};
use std::time::Duration;

fn de_bitrate<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<f64, D::Error> {
    let raw = RateOrNumber::deserialize(d)?;
    raw.into_bps().map_err(serde::de::Error::custom)
}

fn de_bitrate_opt<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<f64>, D::Error> {
    let raw: Option<RateOrNumber> = Option::deserialize(d)?;
    raw.map(|r| r.into_bps().map_err(serde::de::Error::custom))
        .transpose()
}

fn de_bytesize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<u64, D::Error> {
    let raw = RateOrNumber::deserialize(d)?;
    raw.into_bytes().map_err(serde::de::Error::custom)
}

fn de_duration<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Duration, D::Error> {
    let raw = RateOrNumber::deserialize(d)?;
    raw.into_duration().map_err(serde::de::Error::custom)
}

/// Either a bare number or a suffixed string (`"10m"`, `"512KB"`, `"30s"`).
/// Config authors write whichever is natural; this normalizes both.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RateOrNumber {
    Number(f64),
    Text(String),
}

impl RateOrNumber {
    /// Bits/sec, decimal k/m/g suffixes (case-insensitive).
    fn into_bps(self) -> std::result::Result<f64, String> {
        match self {
            RateOrNumber::Number(n) => Ok(n),
            RateOrNumber::Text(s) => parse_suffixed(&s, &[("k", 1e3), ("m", 1e6), ("g", 1e9)]),
        }
    }

    /// Bytes, decimal KB/MB/GB suffixes.
    fn into_bytes(self) -> std::result::Result<u64, String> {
        match self {
            RateOrNumber::Number(n) => Ok(n as u64),
            RateOrNumber::Text(s) => {
                parse_suffixed(&s, &[("kb", 1e3), ("mb", 1e6), ("gb", 1e9)]).map(|v| v as u64)
            }
        }
    }

    fn into_duration(self) -> std::result::Result<Duration, String> {
        match self {
            RateOrNumber::Number(n) => Ok(Duration::from_secs_f64(n)),
            RateOrNumber::Text(s) => {
                let secs = parse_suffixed(&s, &[("ms", 1e-3), ("s", 1.0), ("m", 60.0), ("h", 3600.0)])?;
                Ok(Duration::from_secs_f64(secs))
            }
        }
    }
}

/// Parse `"<number><suffix>"` case-insensitively against a longest-match-first
/// suffix table, falling back to a bare number (suffix-less) as 1x.
fn parse_suffixed(s: &str, suffixes: &[(&str, f64)]) -> std::result::Result<f64, String> {
    let lower = s.trim().to_ascii_lowercase();
    let mut longest: Option<(&str, f64)> = None;
    for &(suf, mult) in suffixes {
        if lower.ends_with(suf) && longest.map_or(true, |(l, _)| suf.len() > l.len()) {
            longest = Some((suf, mult));
        }
    }
    match longest {
        Some((suf, mult)) => {
            let number_part = &lower[..lower.len() - suf.len()];
            number_part
                .trim()
                .parse::<f64>()
                .map(|n| n * mult)
                .map_err(|e| format!("bad numeric prefix in {s:?}: {e}"))
        }
        None => lower
            .parse::<f64>()
            .map_err(|e| format!("unrecognized value {s:?}: {e}")),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    pub tag: String,
    pub host: String,
    #[serde(default)]
    pub measure_host: Option<String>,
    #[serde(default = "default_measure_port")]
    pub measure_port: u16,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub bias: f64,
}

fn default_measure_port() -> u16 {
    7575
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    pub addr: String,
    pub port: u16,
    pub protocol: Protocol,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForwardingConfig {
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    #[serde(deserialize_with = "de_duration", default = "default_min_interval")]
    pub min_interval: Duration,
    #[serde(deserialize_with = "de_duration", default = "default_max_interval")]
    pub max_interval: Duration,
    #[serde(deserialize_with = "de_duration", default = "default_inter_upstream_gap")]
    pub inter_upstream_gap: Duration,
    #[serde(default = "default_max_utilization")]
    pub max_utilization: f64,
    #[serde(deserialize_with = "de_bitrate", default = "default_headroom")]
    pub required_headroom: f64,
}

fn default_min_interval() -> Duration {
    Duration::from_secs(10)
}
fn default_max_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_inter_upstream_gap() -> Duration {
    Duration::from_secs(2)
}
fn default_max_utilization() -> f64 {
    0.8
}
fn default_headroom() -> f64 {
    1_000_000.0
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            min_interval: default_min_interval(),
            max_interval: default_max_interval(),
            inter_upstream_gap: default_inter_upstream_gap(),
            max_utilization: default_max_utilization(),
            required_headroom: default_headroom(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MeasurementConfig {
    #[serde(deserialize_with = "de_bitrate", default = "default_target_bw")]
    pub tcp_target_bandwidth_up: f64,
    #[serde(deserialize_with = "de_bitrate", default = "default_target_bw")]
    pub tcp_target_bandwidth_down: f64,
    #[serde(deserialize_with = "de_bitrate", default = "default_target_bw")]
    pub udp_target_bandwidth_up: f64,
    #[serde(deserialize_with = "de_bitrate", default = "default_target_bw")]
    pub udp_target_bandwidth_down: f64,
    #[serde(deserialize_with = "de_bytesize", default = "default_sample_bytes")]
    pub sample_bytes: u64,
    #[serde(default = "default_samples")]
    pub samples: u32,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(deserialize_with = "de_duration", default = "default_fast_start_timeout")]
    pub fast_start_timeout: Duration,
    #[serde(deserialize_with = "de_duration", default = "default_warmup_duration")]
    pub warmup_duration: Duration,
    #[serde(deserialize_with = "de_duration", default = "default_stale_threshold")]
    pub stale_threshold: Duration,
    #[serde(default)]
    pub fallback_to_icmp: bool,
}

fn default_target_bw() -> f64 {
    10_000_000.0
}
fn default_sample_bytes() -> u64 {
    1024 * 1024
}
fn default_samples() -> u32 {
    3
}
fn default_fast_start_timeout() -> Duration {
    Duration::from_secs(2)
}
fn default_warmup_duration() -> Duration {
    Duration::from_secs(10)
}
fn default_stale_threshold() -> Duration {
    Duration::from_secs(60)
}

impl Default for MeasurementConfig {
    fn default() -> Self {
        Self {
            tcp_target_bandwidth_up: default_target_bw(),
            tcp_target_bandwidth_down: default_target_bw(),
            udp_target_bandwidth_up: default_target_bw(),
            udp_target_bandwidth_down: default_target_bw(),
            sample_bytes: default_sample_bytes(),
            samples: default_samples(),
            schedule: ScheduleConfig::default(),
            fast_start_timeout: default_fast_start_timeout(),
            warmup_duration: default_warmup_duration(),
            stale_threshold: default_stale_threshold(),
            fallback_to_icmp: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProtocolWeights {
    #[serde(default)]
    pub bw_up: f64,
    #[serde(default)]
    pub bw_dn: f64,
    #[serde(default)]
    pub rtt: f64,
    #[serde(default)]
    pub jit: f64,
    #[serde(default)]
    pub retrans: f64,
    #[serde(default)]
    pub loss: f64,
}

impl ProtocolWeights {
    fn sum(&self) -> f64 {
        self.bw_up + self.bw_dn + self.rtt + self.jit + self.retrans + self.loss
    }

    /// Normalize in place unless the sum is already within (0.999, 1.001);
    /// reject a non-positive sum outright.
    fn normalize(&mut self, label: &str) -> Result<()> {
        let sum = self.sum();
        if sum <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "{label} weights sum to {sum}, must be positive"
            )));
        }
        if !(0.999..=1.001).contains(&sum) {
            self.bw_up /= sum;
            self.bw_dn /= sum;
            self.rtt /= sum;
            self.jit /= sum;
            self.retrans /= sum;
            self.loss /= sum;
        }
        Ok(())
    }
}

impl Default for ProtocolWeights {
    fn default() -> Self {
        default_weights_tcp()
    }
}

/// TCP combines bandwidth/RTT/jitter/retransmits; it has no UDP-style loss
/// term (retransmits already capture TCP loss).
fn default_weights_tcp() -> ProtocolWeights {
    ProtocolWeights {
        bw_up: 0.3,
        bw_dn: 0.3,
        rtt: 0.2,
        jit: 0.1,
        retrans: 0.1,
        loss: 0.0,
    }
}

/// UDP has no retransmits; loss takes that share of the weight instead.
fn default_weights_udp() -> ProtocolWeights {
    ProtocolWeights {
        bw_up: 0.25,
        bw_dn: 0.25,
        rtt: 0.2,
        jit: 0.15,
        retrans: 0.0,
        loss: 0.15,
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScoringConfig {
    #[serde(default = "default_alpha")]
    pub ema_alpha: f64,
    #[serde(default = "default_ref_rtt")]
    pub ref_rtt_ms: f64,
    #[serde(default = "default_ref_jitter")]
    pub ref_jitter_ms: f64,
    #[serde(default = "default_ref_retrans")]
    pub ref_retrans_rate: f64,
    #[serde(default = "default_ref_loss")]
    pub ref_loss_rate: f64,
    #[serde(deserialize_with = "de_bitrate", default = "default_target_bw")]
    pub ref_bw_up_bps: f64,
    #[serde(deserialize_with = "de_bitrate", default = "default_target_bw")]
    pub ref_bw_down_bps: f64,
    #[serde(default = "default_weights_tcp")]
    pub weights_tcp: ProtocolWeights,
    #[serde(default = "default_weights_udp")]
    pub weights_udp: ProtocolWeights,
    #[serde(default = "default_pw_tcp")]
    pub protocol_weight_tcp: f64,
    #[serde(default = "default_pw_udp")]
    pub protocol_weight_udp: f64,
    #[serde(default = "default_true")]
    pub utilization_enabled: bool,
    #[serde(default = "default_util_min_mult")]
    pub utilization_min_mult: f64,
    #[serde(default = "default_util_threshold")]
    pub utilization_threshold: f64,
    #[serde(default = "default_util_exponent")]
    pub utilization_exponent: f64,
    #[serde(deserialize_with = "de_duration", default = "default_util_window")]
    pub utilization_window_sec: Duration,
    #[serde(default = "default_bias_kappa")]
    pub bias_kappa: f64,
}

fn default_alpha() -> f64 {
    0.3
}
fn default_ref_rtt() -> f64 {
    50.0
}
fn default_ref_jitter() -> f64 {
    20.0
}
fn default_ref_retrans() -> f64 {
    0.05
}
fn default_ref_loss() -> f64 {
    0.05
}
fn default_pw_tcp() -> f64 {
    0.5
}
fn default_pw_udp() -> f64 {
    0.5
}
fn default_true() -> bool {
    true
}
fn default_util_min_mult() -> f64 {
    0.3
}
fn default_util_threshold() -> f64 {
    0.7
}
fn default_util_exponent() -> f64 {
    2.0
}
fn default_util_window() -> Duration {
    Duration::from_secs(5)
}
fn default_bias_kappa() -> f64 {
    std::f64::consts::LN_2
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            ema_alpha: default_alpha(),
            ref_rtt_ms: default_ref_rtt(),
            ref_jitter_ms: default_ref_jitter(),
            ref_retrans_rate: default_ref_retrans(),
            ref_loss_rate: default_ref_loss(),
            ref_bw_up_bps: default_target_bw(),
            ref_bw_down_bps: default_target_bw(),
            weights_tcp: default_weights_tcp(),
            weights_udp: default_weights_udp(),
            protocol_weight_tcp: default_pw_tcp(),
            protocol_weight_udp: default_pw_udp(),
            utilization_enabled: true,
            utilization_min_mult: default_util_min_mult(),
            utilization_threshold: default_util_threshold(),
            utilization_exponent: default_util_exponent(),
            utilization_window_sec: default_util_window(),
            bias_kappa: default_bias_kappa(),
        }
    }
}

impl ScoringConfig {
    fn validate(&mut self) -> Result<()> {
        if self.ref_rtt_ms == 0.0
            || self.ref_jitter_ms == 0.0
            || self.ref_retrans_rate == 0.0
            || self.ref_loss_rate == 0.0
            || self.ref_bw_up_bps == 0.0
            || self.ref_bw_down_bps == 0.0
        {
            return Err(Error::InvalidConfig(
                "all scoring reference values must be non-zero".into(),
            ));
        }
        self.weights_tcp.normalize("weights_tcp")?;
        self.weights_udp.normalize("weights_udp")?;
        let pw_sum = self.protocol_weight_tcp + self.protocol_weight_udp;
        if pw_sum <= 0.0 {
            return Err(Error::InvalidConfig(
                "protocol_weight_tcp + protocol_weight_udp must be positive".into(),
            ));
        }
        if !(0.999..=1.001).contains(&pw_sum) {
            self.protocol_weight_tcp /= pw_sum;
            self.protocol_weight_udp /= pw_sum;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SwitchingConfig {
    #[serde(default = "default_confirm_duration")]
    pub confirm_duration: u32,
    #[serde(default = "default_switch_threshold")]
    pub switch_threshold: f64,
    #[serde(deserialize_with = "de_duration", default = "default_min_hold")]
    pub min_hold_seconds: Duration,
    #[serde(default = "default_failure_loss")]
    pub failure_loss_threshold: f64,
    #[serde(default = "default_failure_retrans")]
    pub failure_retrans_threshold: f64,
    #[serde(default)]
    pub close_flows_on_unusable: bool,
    #[serde(default = "default_dial_fail_switch_count")]
    pub dial_fail_switch_count: u32,
}

fn default_confirm_duration() -> u32 {
    3
}
fn default_switch_threshold() -> f64 {
    5.0
}
fn default_min_hold() -> Duration {
    Duration::from_secs(30)
}
fn default_failure_loss() -> f64 {
    0.2
}
fn default_failure_retrans() -> f64 {
    0.2
}
fn default_dial_fail_switch_count() -> u32 {
    2
}

impl Default for SwitchingConfig {
    fn default() -> Self {
        Self {
            confirm_duration: default_confirm_duration(),
            switch_threshold: default_switch_threshold(),
            min_hold_seconds: default_min_hold(),
            failure_loss_threshold: default_failure_loss(),
            failure_retrans_threshold: default_failure_retrans(),
            close_flows_on_unusable: false,
            dial_fail_switch_count: default_dial_fail_switch_count(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_tcp_conns")]
    pub max_tcp_conns: usize,
    #[serde(default = "default_max_udp_mappings")]
    pub max_udp_mappings: usize,
}

fn default_max_tcp_conns() -> usize {
    10_000
}
fn default_max_udp_mappings() -> usize {
    10_000
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_tcp_conns: default_max_tcp_conns(),
            max_udp_mappings: default_max_udp_mappings(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_tcp_idle")]
    pub tcp_idle_seconds: u64,
    #[serde(default = "default_udp_idle")]
    pub udp_idle_seconds: u64,
}

fn default_tcp_idle() -> u64 {
    300
}
fn default_udp_idle() -> u64 {
    60
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            tcp_idle_seconds: default_tcp_idle(),
            udp_idle_seconds: default_udp_idle(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_addr")]
    pub listen: String,
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9898".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            listen: default_metrics_addr(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    pub upstreams: Vec<UpstreamConfig>,
    #[serde(default)]
    pub forwarding: ForwardingConfig,
    #[serde(default)]
    pub measurement: MeasurementConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub switching: SwitchingConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self { listeners: vec![] }
    }
}

const TCP_DATA_FRAME_HEADER: u64 = 8;

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let raw = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("FBFORWARD").separator("__"))
            .build()?;
        let mut cfg: Config = raw.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load_or_default(path: &str) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to load config file, using defaults");
            Config::default()
        })
    }

    /// Rejects configuration the core cannot run with at all: impossible
    /// chunk sizes, non-normalizable weight vectors, zero reference values.
    fn validate(&mut self) -> Result<()> {
        if self.upstreams.is_empty() {
            return Err(Error::InvalidConfig("no upstreams configured".into()));
        }
        if self.measurement.sample_bytes < TCP_DATA_FRAME_HEADER {
            return Err(Error::InvalidConfig(format!(
                "sample_bytes {} smaller than the TCP data frame header ({TCP_DATA_FRAME_HEADER})",
                self.measurement.sample_bytes
            )));
        }
        for u in &self.upstreams {
            if !(-1.0..=1.0).contains(&u.bias) {
                return Err(Error::InvalidConfig(format!(
                    "upstream {} bias {} outside [-1, 1]",
                    u.tag, u.bias
                )));
            }
        }
        self.scoring.validate()?;
        Ok(())
    }
}

/// Clamp a UDP chunk size to the protocol's 64 KiB datagram ceiling.
pub fn clamp_udp_chunk(chunk_size: usize) -> usize {
    chunk_size.min(common::protocol::MAX_UDP_PACKET)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitrate_suffixes_parse() {
        assert_eq!(RateOrNumber::Text("10m".into()).into_bps().unwrap(), 10e6);
        assert_eq!(RateOrNumber::Text("512k".into()).into_bps().unwrap(), 512e3);
        assert_eq!(RateOrNumber::Number(42.0).into_bps().unwrap(), 42.0);
    }

    #[test]
    fn bytesize_suffixes_parse() {
        assert_eq!(RateOrNumber::Text("512KB".into()).into_bytes().unwrap(), 512_000);
        assert_eq!(RateOrNumber::Text("2MB".into()).into_bytes().unwrap(), 2_000_000);
    }

    #[test]
    fn duration_suffixes_parse() {
        assert_eq!(
            RateOrNumber::Text("500ms".into()).into_duration().unwrap(),
            Duration::from_millis(500)
        );
        assert_eq!(
            RateOrNumber::Text("2m".into()).into_duration().unwrap(),
            Duration::from_secs(120)
        );
    }

    #[test]
    fn weight_sum_outside_tolerance_is_normalized() {
        let mut w = ProtocolWeights {
            bw_up: 1.0,
            bw_dn: 1.0,
            rtt: 1.0,
            jit: 1.0,
            retrans: 1.0,
            loss: 0.0,
        };
        w.normalize("test").unwrap();
        assert!((w.sum() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn non_positive_weight_sum_rejected() {
        let mut w = ProtocolWeights {
            bw_up: 0.0,
            bw_dn: 0.0,
            rtt: 0.0,
            jit: 0.0,
            retrans: 0.0,
            loss: 0.0,
        };
        assert!(w.normalize("test").is_err());
    }

    #[test]
    fn zero_ref_rtt_rejected() {
        let mut scoring = ScoringConfig::default();
        scoring.ref_rtt_ms = 0.0;
        assert!(scoring.validate().is_err());
    }

    #[test]
    fn udp_chunk_clamped_to_max_packet() {
        assert_eq!(clamp_udp_chunk(200_000), common::protocol::MAX_UDP_PACKET);
        assert_eq!(clamp_udp_chunk(1000), 1000);
    }
}
