//! Upstream manager: holds per-upstream state, dial-failure cooldowns,
//! primary selection with switch confirmation/hold hysteresis, the
//! fast-start RTT-only bootstrap, and periodic DNS refresh.

use crate::config::{ScoringConfig, SwitchingConfig, UpstreamConfig};
use crate::scorer;
use crate::status::StatusStore;
use common::model::{Direction, Protocol, SubMetrics, Upstream, UpstreamState, UpstreamTag};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerMode {
    Auto,
    Manual(UpstreamTag),
}

struct Entry {
    upstream: Upstream,
    state: UpstreamState,
}

struct Inner {
    entries: HashMap<UpstreamTag, Entry>,
    active: Option<UpstreamTag>,
    mode: ManagerMode,
    last_switch: Instant,
    pending_best: Option<UpstreamTag>,
    pending_count: u32,
    warmup_until: Option<Instant>,
}

/// Holds upstream state and elects the `active` primary, per the manager
/// contract: an `auto` mode that scores usable upstreams with hysteresis,
/// and a `manual` mode that pins one tag regardless of score.
pub struct UpstreamManager {
    inner: RwLock<Inner>,
    switching: SwitchingConfig,
    scoring: ScoringConfig,
    status: Arc<StatusStore>,
    switch_tx: broadcast::Sender<UpstreamTag>,
    dial_fail_threshold: u32,
}

impl UpstreamManager {
    pub fn new(
        upstreams: &[UpstreamConfig],
        switching: SwitchingConfig,
        scoring: ScoringConfig,
        status: Arc<StatusStore>,
    ) -> Arc<Self> {
        let mut entries = HashMap::new();
        for u in upstreams {
            let measure_host = u.measure_host.clone().unwrap_or_else(|| u.host.clone());
            let ip: IpAddr = u
                .host
                .parse()
                .unwrap_or_else(|_| IpAddr::from([0, 0, 0, 0]));
            let upstream = Upstream::new(
                u.tag.clone(),
                u.host.clone(),
                ip,
                measure_host,
                u.measure_port,
                u.priority,
                u.bias,
            );
            entries.insert(
                u.tag.clone(),
                Entry {
                    upstream,
                    state: UpstreamState::default(),
                },
            );
        }
        let (switch_tx, _) = broadcast::channel(64);
        let dial_fail_threshold = switching.dial_fail_switch_count;
        Arc::new(Self {
            inner: RwLock::new(Inner {
                entries,
                active: None,
                mode: ManagerMode::Auto,
                last_switch: Instant::now(),
                pending_best: None,
                pending_count: 0,
                warmup_until: None,
            }),
            switching,
            scoring,
            status,
            switch_tx,
            dial_fail_threshold,
        })
    }

    pub fn subscribe_switches(&self) -> broadcast::Receiver<UpstreamTag> {
        self.switch_tx.subscribe()
    }

    pub fn tags(&self) -> Vec<UpstreamTag> {
        self.inner.read().entries.keys().cloned().collect()
    }

    pub fn active(&self) -> Option<UpstreamTag> {
        self.inner.read().active.clone()
    }

    pub fn mode(&self) -> ManagerMode {
        self.inner.read().mode.clone()
    }

    pub fn active_ip(&self, tag: &str) -> Option<IpAddr> {
        self.inner.read().entries.get(tag).map(|e| e.upstream.active_ip)
    }

    pub fn measure_endpoint(&self, tag: &str) -> Option<(String, u16)> {
        self.inner
            .read()
            .entries
            .get(tag)
            .map(|e| (e.upstream.measure_host.clone(), e.upstream.measure_port))
    }

    pub fn set_manual(&self, tag: UpstreamTag) {
        let mut inner = self.inner.write();
        inner.mode = ManagerMode::Manual(tag.clone());
        if inner.entries.contains_key(&tag) {
            inner.active = Some(tag);
            inner.last_switch = Instant::now();
        }
    }

    pub fn set_auto(&self) {
        self.inner.write().mode = ManagerMode::Auto;
    }

    /// Probe-derived RTT-only bootstrap. Picks `100/(1 + rtt_ms/50) + priority`
    /// without confirmation, then enters warmup.
    pub fn fast_start(&self, rtts: &HashMap<UpstreamTag, f64>, warmup_duration: Duration) {
        let mut inner = self.inner.write();
        let mut best: Option<(UpstreamTag, f64)> = None;
        for (tag, entry) in &inner.entries {
            let rtt_ms = rtts.get(tag).copied().unwrap_or(f64::MAX);
            let fast_score = 100.0 / (1.0 + rtt_ms / 50.0) + entry.upstream.priority as f64;
            if best.as_ref().map_or(true, |(_, s)| fast_score > *s) {
                best = Some((tag.clone(), fast_score));
            }
        }
        if let Some((tag, _)) = best {
            inner.active = Some(tag.clone());
            inner.last_switch = Instant::now();
            inner.warmup_until = Some(Instant::now() + warmup_duration);
            let _ = self.switch_tx.send(tag);
        }
    }

    fn in_warmup(inner: &Inner) -> bool {
        inner.warmup_until.map_or(false, |t| Instant::now() < t)
    }

    pub fn mark_dial_failure(&self, tag: &str, cooldown: Duration) {
        let mut inner = self.inner.write();
        if let Some(entry) = inner.entries.get_mut(tag) {
            entry.state.mark_dial_failure(cooldown);
            let fail_count = entry.state.dial_fail_count;
            let is_active = inner.active.as_deref() == Some(tag);
            if is_active && fail_count >= self.dial_fail_threshold {
                self.force_failover(&mut inner);
            }
        }
    }

    pub fn clear_dial_failure(&self, tag: &str) {
        if let Some(entry) = self.inner.write().entries.get_mut(tag) {
            entry.state.clear_dial_failure();
        }
    }

    /// Feed one measurement result for `(tag, protocol, direction)` into the
    /// upstream's EMA state, then run the reselect pass.
    pub fn record_sample(
        &self,
        tag: &str,
        protocol: Protocol,
        direction: Direction,
        bw_bps: f64,
        rtt_ms: f64,
        jitter_ms: f64,
        retrans_rate: Option<f64>,
        loss_rate: Option<f64>,
    ) {
        let alpha = self.scoring.ema_alpha;
        let mut inner = self.inner.write();
        let is_active = inner.active.as_deref() == Some(tag);
        let Some(entry) = inner.entries.get_mut(tag) else {
            return;
        };
        match (protocol, direction) {
            (Protocol::Tcp, Direction::Upload) => entry.state.bandwidth_up_tcp.update(bw_bps, alpha),
            (Protocol::Tcp, Direction::Download) => {
                entry.state.bandwidth_down_tcp.update(bw_bps, alpha)
            }
            (Protocol::Udp, Direction::Upload) => entry.state.bandwidth_up_udp.update(bw_bps, alpha),
            (Protocol::Udp, Direction::Download) => {
                entry.state.bandwidth_down_udp.update(bw_bps, alpha)
            }
        }
        entry.state.rtt_ms.update(rtt_ms, alpha);
        entry.state.jitter_ms.update(jitter_ms, alpha);
        if let Some(r) = retrans_rate {
            entry.state.retrans_rate.update(r, alpha);
        }
        if let Some(l) = loss_rate {
            entry.state.loss_rate.update(l, alpha);
        }
        entry.state.reachable = true;

        let fast_failover = is_active
            && (entry.state.loss_rate.value >= self.switching.failure_loss_threshold
                || entry.state.retrans_rate.value >= self.switching.failure_retrans_threshold);

        if fast_failover {
            self.force_failover(&mut inner);
        } else if !Self::in_warmup(&inner) && inner.mode == ManagerMode::Auto {
            self.reselect(&mut inner);
        }
    }

    fn score_of(&self, entry: &Entry, utilization: f64) -> f64 {
        scorer::score(
            &entry.state.snapshot(),
            utilization,
            entry.upstream.priority,
            entry.upstream.bias,
            &self.scoring,
        )
        .score
    }

    /// Immediate switch (no confirmation) to the best currently usable
    /// upstream, used for dial-failure and fast-loss/retrans triggers.
    fn force_failover(&self, inner: &mut Inner) {
        let current = inner.active.clone();
        let best = inner
            .entries
            .iter()
            .filter(|(tag, e)| {
                Some((*tag).as_str()) != current.as_deref()
                    && e.state.usable(self.dial_fail_threshold)
            })
            .max_by(|(_, a), (_, b)| {
                self.score_of(a, 0.0)
                    .partial_cmp(&self.score_of(b, 0.0))
                    .unwrap()
            })
            .map(|(tag, _)| tag.clone());
        if let Some(tag) = best {
            self.do_switch(inner, tag);
        }
    }

    fn reselect(&self, inner: &mut Inner) {
        let usable: Vec<(UpstreamTag, f64)> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.state.usable(self.dial_fail_threshold))
            .map(|(tag, e)| (tag.clone(), self.score_of(e, 0.0)))
            .collect();
        let Some((best_tag, best_score)) = usable
            .iter()
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap())
            .cloned()
        else {
            return;
        };

        if inner.pending_best.as_deref() != Some(best_tag.as_str()) {
            inner.pending_best = Some(best_tag.clone());
            inner.pending_count = 1;
        } else {
            inner.pending_count += 1;
        }

        let Some(active_tag) = inner.active.clone() else {
            self.do_switch(inner, best_tag);
            return;
        };
        if best_tag == active_tag {
            return;
        }
        let active_score = usable
            .iter()
            .find(|(t, _)| *t == active_tag)
            .map(|(_, s)| *s)
            .unwrap_or(0.0);
        if best_score < active_score + self.switching.switch_threshold {
            return;
        }
        if inner.last_switch.elapsed() < self.switching.min_hold_seconds {
            return;
        }
        if inner.pending_count < self.switching.confirm_duration {
            return;
        }
        self.do_switch(inner, best_tag);
    }

    fn do_switch(&self, inner: &mut Inner, new_tag: UpstreamTag) {
        inner.active = Some(new_tag.clone());
        inner.last_switch = Instant::now();
        inner.pending_best = None;
        inner.pending_count = 0;
        let _ = self.switch_tx.send(new_tag);

        if self.switching.close_flows_on_unusable {
            let unusable: Vec<UpstreamTag> = inner
                .entries
                .iter()
                .filter(|(tag, e)| {
                    Some(tag.as_str()) != inner.active.as_deref()
                        && !e.state.usable(self.dial_fail_threshold)
                })
                .map(|(tag, _)| tag.clone())
                .collect();
            for tag in unusable {
                self.status.close_by_upstream(&tag);
            }
        }
    }

    /// Re-resolve one upstream's IP set; if the active IP disappeared, pick
    /// the first address in the new set.
    pub fn refresh_ips(&self, tag: &str, resolved: Vec<IpAddr>) {
        if resolved.is_empty() {
            return;
        }
        let mut inner = self.inner.write();
        if let Some(entry) = inner.entries.get_mut(tag) {
            let still_present = resolved.contains(&entry.upstream.active_ip);
            entry.upstream.resolved_ips = resolved.clone();
            if !still_present {
                entry.upstream.active_ip = resolved[0];
            }
        }
    }

    pub fn snapshot(&self, tag: &str) -> Option<(Upstream, SubMetrics, bool)> {
        let inner = self.inner.read();
        inner.entries.get(tag).map(|e| {
            (
                e.upstream.clone(),
                e.state.snapshot(),
                e.state.usable(self.dial_fail_threshold),
            )
        })
    }

    /// Whether the last measurement round reached this upstream at all,
    /// independent of the loss/dial-failure criteria `usable` folds in.
    pub fn reachable(&self, tag: &str) -> Option<bool> {
        self.inner.read().entries.get(tag).map(|e| e.state.reachable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ScoringConfig, SwitchingConfig, UpstreamConfig};

    fn manager(switch_threshold: f64, confirm_duration: u32, min_hold: Duration) -> Arc<UpstreamManager> {
        let upstreams = vec![
            UpstreamConfig {
                tag: "a".into(),
                host: "10.0.0.1".into(),
                measure_host: None,
                measure_port: 7575,
                priority: 0,
                bias: 0.0,
            },
            UpstreamConfig {
                tag: "b".into(),
                host: "10.0.0.2".into(),
                measure_host: None,
                measure_port: 7575,
                priority: 0,
                bias: 0.0,
            },
        ];
        let mut switching = SwitchingConfig::default();
        switching.switch_threshold = switch_threshold;
        switching.confirm_duration = confirm_duration;
        switching.min_hold_seconds = min_hold;
        let scoring = ScoringConfig::default();
        let status = StatusStore::new();
        let m = UpstreamManager::new(&upstreams, switching, scoring, status);
        m.do_switch_for_test("a");
        m
    }

    impl UpstreamManager {
        fn do_switch_for_test(&self, tag: &str) {
            let mut inner = self.inner.write();
            inner.active = Some(tag.to_string());
            inner.last_switch = Instant::now() - Duration::from_secs(3600);
        }
    }

    fn feed(m: &UpstreamManager, tag: &str, bw: f64, rtt: f64) {
        m.record_sample(tag, Protocol::Tcp, Direction::Upload, bw, rtt, 1.0, Some(0.0), Some(0.0));
    }

    #[test]
    fn no_switch_below_threshold() {
        let m = manager(10.0, 1, Duration::from_secs(0));
        feed(&m, "a", 5_000_000.0, 50.0);
        feed(&m, "b", 5_100_000.0, 49.0);
        assert_eq!(m.active().as_deref(), Some("a"));
    }

    #[test]
    fn switches_once_after_confirm_duration() {
        let m = manager(0.2, 3, Duration::from_secs(0));
        feed(&m, "a", 1_000_000.0, 100.0);
        for _ in 0..3 {
            feed(&m, "b", 50_000_000.0, 5.0);
        }
        assert_eq!(m.active().as_deref(), Some("b"));
    }

    #[test]
    fn fast_failover_on_high_loss_ignores_hold() {
        let m = manager(1000.0, 100, Duration::from_secs(3600));
        m.record_sample("a", Protocol::Tcp, Direction::Upload, 1_000_000.0, 50.0, 1.0, Some(0.3), Some(0.3));
        assert_eq!(m.active().as_deref(), Some("b"));
    }

    #[test]
    fn dial_failures_reaching_threshold_force_reselection() {
        let m = manager(10.0, 3, Duration::from_secs(0));
        feed(&m, "b", 1.0, 100.0);
        m.mark_dial_failure("a", Duration::from_secs(5));
        m.mark_dial_failure("a", Duration::from_secs(5));
        assert_eq!(m.active().as_deref(), Some("b"));
    }

    #[test]
    fn manual_mode_pins_active_regardless_of_score() {
        let m = manager(1.0, 1, Duration::from_secs(0));
        m.set_manual("a".to_string());
        feed(&m, "b", 50_000_000.0, 1.0);
        assert_eq!(m.active().as_deref(), Some("a"));
    }
}
