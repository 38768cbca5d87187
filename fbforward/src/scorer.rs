//! Combines an upstream's smoothed sub-metrics into TCP/UDP/overall scores:
//! ratio-to-reference sub-scores, protocol weight combination, a utilization
//! penalty and a bias multiplier.

use crate::config::ScoringConfig;
use common::model::SubMetrics;
use serde::Serialize;

const EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ScoreBreakdown {
    pub score_tcp: f64,
    pub score_udp: f64,
    pub base: f64,
    pub utilization_mult: f64,
    pub bias_mult: f64,
    pub score: f64,
}

fn clamp01(x: f64) -> f64 {
    x.clamp(0.0, 1.0)
}

/// `clamp(ref / max(value, eps), 0, 1)`: monotone decreasing in `value`.
fn ratio_decreasing(value: f64, reference: f64) -> f64 {
    clamp01(reference / value.max(EPSILON))
}

/// `clamp(value / reference, 0, 1)`: monotone increasing in `value`.
fn ratio_increasing(value: f64, reference: f64) -> f64 {
    clamp01(value / reference)
}

/// Utilization multiplier: 1 below `threshold`, decaying to `min_mult` as
/// utilization approaches 1.
pub fn utilization_multiplier(utilization: f64, cfg: &ScoringConfig) -> f64 {
    if !cfg.utilization_enabled {
        return 1.0;
    }
    let u = utilization.max(0.0);
    if u <= cfg.utilization_threshold {
        return 1.0;
    }
    let span = (1.0 - cfg.utilization_threshold).max(EPSILON);
    let x = ((u - cfg.utilization_threshold) / span).clamp(0.0, 1.0);
    let mult = 1.0 - x.powf(cfg.utilization_exponent);
    mult.max(cfg.utilization_min_mult)
}

/// `exp(kappa * bias)`; bias in [-1, 1] maps to [exp(-kappa), exp(kappa)],
/// which is [1/2, 2] at the default `kappa = ln 2`.
pub fn bias_multiplier(bias: f64, kappa: f64) -> f64 {
    (kappa * bias).exp()
}

/// Score a single upstream from its smoothed metrics, current utilization
/// and static priority/bias.
pub fn score(
    metrics: &SubMetrics,
    utilization: f64,
    priority: u32,
    bias: f64,
    cfg: &ScoringConfig,
) -> ScoreBreakdown {
    let s_rtt = ratio_decreasing(metrics.rtt_ms, cfg.ref_rtt_ms);
    let s_jitter = ratio_decreasing(metrics.jitter_ms, cfg.ref_jitter_ms);
    let s_retrans = ratio_decreasing(metrics.retrans_rate, cfg.ref_retrans_rate);
    let s_loss = ratio_decreasing(metrics.loss_rate, cfg.ref_loss_rate);
    let s_bw_up_tcp = ratio_increasing(metrics.bandwidth_up_tcp_bps, cfg.ref_bw_up_bps);
    let s_bw_dn_tcp = ratio_increasing(metrics.bandwidth_down_tcp_bps, cfg.ref_bw_down_bps);
    let s_bw_up_udp = ratio_increasing(metrics.bandwidth_up_udp_bps, cfg.ref_bw_up_bps);
    let s_bw_dn_udp = ratio_increasing(metrics.bandwidth_down_udp_bps, cfg.ref_bw_down_bps);

    let w_tcp = &cfg.weights_tcp;
    let score_tcp = w_tcp.bw_up * s_bw_up_tcp
        + w_tcp.bw_dn * s_bw_dn_tcp
        + w_tcp.rtt * s_rtt
        + w_tcp.jit * s_jitter
        + w_tcp.retrans * s_retrans;

    let w_udp = &cfg.weights_udp;
    let score_udp = w_udp.bw_up * s_bw_up_udp
        + w_udp.bw_dn * s_bw_dn_udp
        + w_udp.rtt * s_rtt
        + w_udp.jit * s_jitter
        + w_udp.loss * s_loss;

    let base = cfg.protocol_weight_tcp * score_tcp + cfg.protocol_weight_udp * score_udp;
    let utilization_mult = utilization_multiplier(utilization, cfg);
    let bias_mult = bias_multiplier(bias, cfg.bias_kappa);

    let final_score = (base * utilization_mult * bias_mult + priority as f64).max(0.0);

    ScoreBreakdown {
        score_tcp,
        score_udp,
        base,
        utilization_mult,
        bias_mult,
        score: final_score,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScoringConfig;

    fn reference_metrics() -> SubMetrics {
        SubMetrics {
            bandwidth_up_tcp_bps: 10_000_000.0,
            bandwidth_down_tcp_bps: 10_000_000.0,
            bandwidth_up_udp_bps: 10_000_000.0,
            bandwidth_down_udp_bps: 10_000_000.0,
            rtt_ms: 50.0,
            jitter_ms: 20.0,
            retrans_rate: 0.05,
            loss_rate: 0.05,
        }
    }

    #[test]
    fn score_at_reference_values_is_bounded() {
        let cfg = ScoringConfig::default();
        let m = reference_metrics();
        let s = score(&m, 0.0, 0, 0.0, &cfg);
        assert!(s.score >= 0.0);
        assert!(s.base <= 1.0 + 1e-9);
    }

    #[test]
    fn utilization_over_threshold_reduces_multiplier() {
        let cfg = ScoringConfig::default();
        let below = utilization_multiplier(0.5, &cfg);
        let above = utilization_multiplier(0.95, &cfg);
        assert_eq!(below, 1.0);
        assert!(above < 1.0);
        assert!(above >= cfg.utilization_min_mult);
    }

    #[test]
    fn bias_multiplier_maps_extremes_to_half_and_double() {
        let kappa = std::f64::consts::LN_2;
        assert!((bias_multiplier(1.0, kappa) - 2.0).abs() < 1e-9);
        assert!((bias_multiplier(-1.0, kappa) - 0.5).abs() < 1e-9);
        assert!((bias_multiplier(0.0, kappa) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn zero_loss_beats_reference_loss() {
        let cfg = ScoringConfig::default();
        let mut m = reference_metrics();
        m.loss_rate = 0.0;
        let good = score(&m, 0.0, 0, 0.0, &cfg);
        m.loss_rate = 0.2;
        let bad = score(&m, 0.0, 0, 0.0, &cfg);
        assert!(good.score_udp >= bad.score_udp);
    }

    #[test]
    fn priority_adds_flat_bonus() {
        let cfg = ScoringConfig::default();
        let m = reference_metrics();
        let base = score(&m, 0.0, 0, 0.0, &cfg);
        let boosted = score(&m, 0.0, 10, 0.0, &cfg);
        assert!((boosted.score - base.score - 10.0).abs() < 1e-9);
    }
}
