//! In-memory flow table for TCP connections and UDP mappings. Each entry
//! tracks byte counters and last-activity independently of the byte-rate
//! metrics registry; this table exists for the control plane's flow list and
//! for `CloseByUpstream`, not as the accounting source of truth.

use common::model::{Protocol, UpstreamTag};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;

pub type FlowId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowKind {
    Tcp,
    Udp,
}

impl From<Protocol> for FlowKind {
    fn from(p: Protocol) -> Self {
        match p {
            Protocol::Tcp => FlowKind::Tcp,
            Protocol::Udp => FlowKind::Udp,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ByteDirection {
    Up,
    Down,
}

/// A live TCP connection or UDP mapping pinned to one upstream.
pub struct FlowEntry {
    pub id: FlowId,
    pub client_ip: IpAddr,
    pub client_port: u16,
    pub listener_port: u16,
    pub upstream: UpstreamTag,
    pub kind: FlowKind,
    pub bytes_up: AtomicU64,
    pub bytes_down: AtomicU64,
    created_at: Instant,
    last_activity: RwLock<Instant>,
    close_fn: Box<dyn Fn() + Send + Sync>,
}

impl FlowEntry {
    pub fn touch(&self) {
        *self.last_activity.write() = Instant::now();
    }

    pub fn add_bytes(&self, direction: ByteDirection, n: u64) {
        match direction {
            ByteDirection::Up => self.bytes_up.fetch_add(n, Ordering::Relaxed),
            ByteDirection::Down => self.bytes_down.fetch_add(n, Ordering::Relaxed),
        };
        self.touch();
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_activity.read().elapsed()
    }

    fn snapshot(&self) -> FlowSnapshot {
        FlowSnapshot {
            id: self.id,
            client_ip: self.client_ip.to_string(),
            client_port: self.client_port,
            listener_port: self.listener_port,
            upstream: self.upstream.clone(),
            kind: self.kind,
            bytes_up: self.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.bytes_down.load(Ordering::Relaxed),
            age_secs: self.age().as_secs_f64(),
            idle_secs: self.idle_for().as_secs_f64(),
        }
    }
}

/// The wire shape of one flow, as sent to the control plane.
#[derive(Debug, Clone, Serialize)]
pub struct FlowSnapshot {
    pub id: FlowId,
    pub client_ip: String,
    pub client_port: u16,
    pub listener_port: u16,
    pub upstream: UpstreamTag,
    pub kind: FlowKind,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub age_secs: f64,
    pub idle_secs: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StatusEvent {
    Snapshot { flows: Vec<FlowSnapshot> },
    Add { flow: FlowSnapshot },
    Update { flow: FlowSnapshot },
    Remove { id: FlowId },
}

/// In-memory flow table supporting add/update/remove/close-by-upstream/
/// close-all, publishing add/update/remove events to any subscriber.
pub struct StatusStore {
    flows: RwLock<BTreeMap<FlowId, Arc<FlowEntry>>>,
    next_id: AtomicU64,
    events: broadcast::Sender<StatusEvent>,
}

impl StatusStore {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            flows: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    /// Register a new flow, returning its handle. `close_fn` is invoked only
    /// by `close_by_upstream`/`close_all`, never by ordinary removal — the
    /// forwarder that owns the socket is the one that calls `remove` when it
    /// closes the connection on its own (EOF, idle timeout, etc).
    pub fn add(
        &self,
        client_ip: IpAddr,
        client_port: u16,
        listener_port: u16,
        upstream: UpstreamTag,
        kind: FlowKind,
        close_fn: impl Fn() + Send + Sync + 'static,
    ) -> Arc<FlowEntry> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let entry = Arc::new(FlowEntry {
            id,
            client_ip,
            client_port,
            listener_port,
            upstream,
            kind,
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
            created_at: now,
            last_activity: RwLock::new(now),
            close_fn: Box::new(close_fn),
        });
        self.flows.write().insert(id, entry.clone());
        let _ = self.events.send(StatusEvent::Add {
            flow: entry.snapshot(),
        });
        entry
    }

    pub fn update(&self, id: FlowId) {
        if let Some(entry) = self.flows.read().get(&id).cloned() {
            let _ = self.events.send(StatusEvent::Update {
                flow: entry.snapshot(),
            });
        }
    }

    pub fn remove(&self, id: FlowId) {
        if self.flows.write().remove(&id).is_some() {
            let _ = self.events.send(StatusEvent::Remove { id });
        }
    }

    pub fn get(&self, id: FlowId) -> Option<Arc<FlowEntry>> {
        self.flows.read().get(&id).cloned()
    }

    pub fn snapshot_all(&self) -> Vec<FlowSnapshot> {
        self.flows.read().values().map(|e| e.snapshot()).collect()
    }

    pub fn count_by_kind(&self, kind: FlowKind) -> usize {
        self.flows
            .read()
            .values()
            .filter(|e| e.kind == kind)
            .count()
    }

    /// Invoke every flow's close callback whose upstream matches `tag`. The
    /// callback is expected to eventually cause the flow's own task to call
    /// `remove`; this does not remove entries itself.
    pub fn close_by_upstream(&self, tag: &str) {
        let matching: Vec<Arc<FlowEntry>> = self
            .flows
            .read()
            .values()
            .filter(|e| e.upstream == tag)
            .cloned()
            .collect();
        for entry in matching {
            (entry.close_fn)();
        }
    }

    pub fn close_all(&self) {
        let all: Vec<Arc<FlowEntry>> = self.flows.read().values().cloned().collect();
        for entry in all {
            (entry.close_fn)();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicBool;

    fn local_ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    #[test]
    fn add_update_remove_round_trip() {
        let store = StatusStore::new();
        let mut rx = store.subscribe();
        let entry = store.add(local_ip(), 1234, 8080, "a".into(), FlowKind::Tcp, || {});
        entry.add_bytes(ByteDirection::Up, 100);
        store.update(entry.id);
        store.remove(entry.id);

        assert!(store.get(entry.id).is_none());
        let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert!(matches!(events[0], StatusEvent::Add { .. }));
        assert!(matches!(events[1], StatusEvent::Update { .. }));
        assert!(matches!(events[2], StatusEvent::Remove { .. }));
    }

    #[test]
    fn close_by_upstream_only_invokes_matching_flows() {
        let store = StatusStore::new();
        let closed_a = Arc::new(AtomicBool::new(false));
        let closed_b = Arc::new(AtomicBool::new(false));
        {
            let closed_a = closed_a.clone();
            store.add(local_ip(), 1, 80, "a".into(), FlowKind::Tcp, move || {
                closed_a.store(true, Ordering::SeqCst);
            });
        }
        {
            let closed_b = closed_b.clone();
            store.add(local_ip(), 2, 80, "b".into(), FlowKind::Tcp, move || {
                closed_b.store(true, Ordering::SeqCst);
            });
        }
        store.close_by_upstream("a");
        assert!(closed_a.load(Ordering::SeqCst));
        assert!(!closed_b.load(Ordering::SeqCst));
    }

    #[test]
    fn count_by_kind_distinguishes_tcp_and_udp() {
        let store = StatusStore::new();
        store.add(local_ip(), 1, 80, "a".into(), FlowKind::Tcp, || {});
        store.add(local_ip(), 2, 80, "a".into(), FlowKind::Udp, || {});
        assert_eq!(store.count_by_kind(FlowKind::Tcp), 1);
        assert_eq!(store.count_by_kind(FlowKind::Udp), 1);
    }
}
