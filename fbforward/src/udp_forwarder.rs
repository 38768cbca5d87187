//! UDP forwarder: a single socket receives client datagrams, a worker pool
//! drains them into a NAT-like client-keyed mapping table, and each mapping
//! owns its own upstream-facing socket and return-path task.

use crate::manager::UpstreamManager;
use crate::metrics::MetricsRegistry;
use crate::status::{ByteDirection, FlowEntry, FlowKind, StatusStore};
use common::model::{Direction, Protocol};
use common::protocol::MAX_UDP_PACKET;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, warn};

const WORKER_QUEUE_DEPTH: usize = 1024;
const DIAL_FAIL_COOLDOWN: Duration = Duration::from_secs(5);

struct Mapping {
    upstream_sock: Arc<UdpSocket>,
    upstream: String,
    flow_id: crate::status::FlowId,
}

struct Datagram {
    from: SocketAddr,
    data: Vec<u8>,
}

/// NAT-like `client_addr -> upstream socket` table plus the worker pool that
/// drains the shared inbound queue.
pub struct UdpForwarder {
    manager: Arc<UpstreamManager>,
    status: Arc<StatusStore>,
    metrics: Arc<MetricsRegistry>,
    mappings: RwLock<HashMap<SocketAddr, Arc<Mapping>>>,
    idle_timeout: Duration,
    max_mappings: usize,
}

impl UdpForwarder {
    pub fn new(
        manager: Arc<UpstreamManager>,
        status: Arc<StatusStore>,
        metrics: Arc<MetricsRegistry>,
        idle_timeout: Duration,
        max_mappings: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            status,
            metrics,
            mappings: RwLock::new(HashMap::new()),
            idle_timeout,
            max_mappings,
        })
    }

    pub async fn serve(
        self: Arc<Self>,
        socket: UdpSocket,
        listener_port: u16,
        mut shutdown: tokio::sync::broadcast::Receiver<()>,
    ) {
        let socket = Arc::new(socket);
        let (tx, rx) = mpsc::channel(WORKER_QUEUE_DEPTH);
        let rx = Arc::new(AsyncMutex::new(rx));
        for _ in 0..worker_count() {
            let this = self.clone();
            let socket = socket.clone();
            let rx = rx.clone();
            tokio::spawn(async move {
                this.worker_loop(socket, rx, listener_port).await;
            });
        }

        let mut buf = vec![0u8; MAX_UDP_PACKET];
        loop {
            tokio::select! {
                recvd = socket.recv_from(&mut buf) => {
                    match recvd {
                        Ok((n, from)) => {
                            let datagram = Datagram { from, data: buf[..n].to_vec() };
                            if tx.try_send(datagram).is_err() {
                                debug!(port = listener_port, "udp worker queue full, dropping datagram");
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "udp recv failed");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    debug!(port = listener_port, "udp listener shutting down");
                    return;
                }
            }
        }
    }

    async fn worker_loop(
        self: Arc<Self>,
        client_socket: Arc<UdpSocket>,
        rx: Arc<AsyncMutex<mpsc::Receiver<Datagram>>>,
        listener_port: u16,
    ) {
        loop {
            let datagram = {
                let mut guard = rx.lock().await;
                guard.recv().await
            };
            let Some(datagram) = datagram else {
                return;
            };
            self.handle_datagram(&client_socket, datagram, listener_port).await;
        }
    }

    async fn handle_datagram(self: &Arc<Self>, client_socket: &Arc<UdpSocket>, datagram: Datagram, listener_port: u16) {
        let mapping = match self.mappings.read().get(&datagram.from).cloned() {
            Some(m) => m,
            None => match self.create_mapping(client_socket, datagram.from, listener_port).await {
                Some(m) => m,
                None => return,
            },
        };

        if let Err(e) = mapping.upstream_sock.send(&datagram.data).await {
            debug!(error = %e, upstream = %mapping.upstream, "udp send to upstream failed");
            return;
        }
        self.metrics.add_bytes(
            &mapping.upstream,
            Protocol::Udp,
            Direction::Upload,
            datagram.data.len() as u64,
        );
        if let Some(flow) = self.status.get(mapping.flow_id) {
            flow.add_bytes(ByteDirection::Up, datagram.data.len() as u64);
        }
    }

    async fn create_mapping(
        self: &Arc<Self>,
        client_socket: &Arc<UdpSocket>,
        client_addr: SocketAddr,
        listener_port: u16,
    ) -> Option<Arc<Mapping>> {
        if self.mappings.read().len() >= self.max_mappings {
            debug!(%client_addr, "udp mapping table full, dropping new client");
            return None;
        }

        let tag = self.manager.active()?;
        match self.manager.snapshot(&tag) {
            Some((_, _, usable)) if usable => {}
            _ => return None,
        }
        let active_ip = self.manager.active_ip(&tag)?;
        let upstream_addr = SocketAddr::new(active_ip, listener_port);

        let upstream_sock = match UdpSocket::bind(("0.0.0.0", 0)).await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to bind upstream udp socket");
                return None;
            }
        };
        if let Err(e) = upstream_sock.connect(upstream_addr).await {
            warn!(upstream = %tag, addr = %upstream_addr, error = %e, "udp connect failed");
            self.manager.mark_dial_failure(&tag, DIAL_FAIL_COOLDOWN);
            return None;
        }
        self.manager.clear_dial_failure(&tag);
        let upstream_sock = Arc::new(upstream_sock);

        self.metrics.register_upstream(&tag);
        let cancelled = Arc::new(AtomicBool::new(false));
        let cancelled_for_close = cancelled.clone();
        let flow = self.status.add(
            client_addr.ip(),
            client_addr.port(),
            listener_port,
            tag.clone(),
            FlowKind::Udp,
            move || cancelled_for_close.store(true, Ordering::SeqCst),
        );

        let mapping = Arc::new(Mapping {
            upstream_sock: upstream_sock.clone(),
            upstream: tag.clone(),
            flow_id: flow.id,
        });
        self.mappings.write().insert(client_addr, mapping.clone());

        let this = self.clone();
        let client_socket = client_socket.clone();
        tokio::spawn(async move {
            this.return_path(upstream_sock, client_socket, client_addr, flow, tag, cancelled)
                .await;
        });

        Some(mapping)
    }

    #[allow(clippy::too_many_arguments)]
    async fn return_path(
        self: Arc<Self>,
        upstream_sock: Arc<UdpSocket>,
        client_socket: Arc<UdpSocket>,
        client_addr: SocketAddr,
        flow: Arc<FlowEntry>,
        tag: String,
        cancelled: Arc<AtomicBool>,
    ) {
        let mut buf = vec![0u8; MAX_UDP_PACKET];
        let idle_timeout = self.idle_timeout;
        loop {
            tokio::select! {
                recvd = upstream_sock.recv(&mut buf) => {
                    match recvd {
                        Ok(n) => {
                            if client_socket.send_to(&buf[..n], client_addr).await.is_ok() {
                                flow.add_bytes(ByteDirection::Down, n as u64);
                                self.metrics.add_bytes(&tag, Protocol::Udp, Direction::Download, n as u64);
                            }
                        }
                        Err(_) => break,
                    }
                }
                _ = tokio::time::sleep(idle_timeout.min(Duration::from_secs(1))) => {
                    if flow.idle_for() >= idle_timeout || cancelled.load(Ordering::SeqCst) {
                        break;
                    }
                }
            }
        }
        self.mappings.write().remove(&client_addr);
        self.status.remove(flow.id);
    }
}

fn worker_count() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_count_is_at_least_one() {
        assert!(worker_count() >= 1);
    }
}
