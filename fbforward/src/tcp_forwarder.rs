//! TCP forwarder: accept, dial the active upstream, bi-directional copy with
//! a shared buffer pool, idle timeout and byte accounting.

use crate::buffer_pool::BufferPool;
use crate::manager::UpstreamManager;
use crate::metrics::MetricsRegistry;
use crate::status::{ByteDirection, FlowKind, StatusStore};
use common::model::{Direction, Protocol};
use socket2::{SockRef, TcpKeepalive};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{debug, warn};

const TCP_COPY_BUFFER: usize = 32 * 1024;
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const DIAL_RETRIES: u32 = 2;
const DIAL_RETRY_SPACING: Duration = Duration::from_millis(150);
const DIAL_FAIL_COOLDOWN: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Eof,
    ReadError,
    WriteError,
    IdleTimeout,
    UpstreamUnusable,
    ContextDone,
}

impl CloseReason {
    fn as_str(self) -> &'static str {
        match self {
            CloseReason::Eof => "eof",
            CloseReason::ReadError => "read_error",
            CloseReason::WriteError => "write_error",
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::UpstreamUnusable => "upstream_unusable",
            CloseReason::ContextDone => "context_done",
        }
    }
}

pub struct TcpForwarder {
    manager: Arc<UpstreamManager>,
    status: Arc<StatusStore>,
    metrics: Arc<MetricsRegistry>,
    pool: Arc<BufferPool>,
    semaphore: Arc<tokio::sync::Semaphore>,
    idle_timeout: Duration,
}

impl TcpForwarder {
    pub fn new(
        manager: Arc<UpstreamManager>,
        status: Arc<StatusStore>,
        metrics: Arc<MetricsRegistry>,
        max_conns: usize,
        idle_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            status,
            metrics,
            pool: Arc::new(BufferPool::new(TCP_COPY_BUFFER)),
            semaphore: Arc::new(tokio::sync::Semaphore::new(max_conns)),
            idle_timeout,
        })
    }

    /// Accept loop for one listener. Returns once `shutdown` fires, after
    /// which the caller is responsible for dropping the listener.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        listener_port: u16,
        mut shutdown: tokio::sync::broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            let this = self.clone();
                            tokio::spawn(async move {
                                this.handle_connection(stream, addr, listener_port).await;
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "tcp accept failed");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    debug!(port = listener_port, "tcp listener shutting down");
                    return;
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, client_addr: SocketAddr, listener_port: u16) {
        let _permit = match self.semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => return,
        };

        tune_client_socket(&stream);

        let Some(tag) = self.manager.active() else {
            debug!(%client_addr, "no active upstream, closing");
            return;
        };
        match self.manager.snapshot(&tag) {
            Some((_, _, usable)) if usable => {}
            _ => {
                debug!(%client_addr, upstream = %tag, "upstream not usable, closing");
                return;
            }
        }

        let Some(active_ip) = self.manager.active_ip(&tag) else {
            return;
        };
        let upstream_addr = SocketAddr::new(active_ip, listener_port);

        let upstream_stream = match dial_with_retries(upstream_addr).await {
            Ok(s) => {
                self.manager.clear_dial_failure(&tag);
                s
            }
            Err(e) => {
                warn!(upstream = %tag, addr = %upstream_addr, error = %e, "dial failed");
                self.manager.mark_dial_failure(&tag, DIAL_FAIL_COOLDOWN);
                return;
            }
        };
        tune_client_socket(&upstream_stream);

        self.metrics.register_upstream(&tag);
        let notify = Arc::new(Notify::new());
        let cancelled = Arc::new(AtomicBool::new(false));
        let notify_for_close = notify.clone();
        let cancelled_for_close = cancelled.clone();
        let flow = self.status.add(
            client_addr.ip(),
            client_addr.port(),
            listener_port,
            tag.clone(),
            FlowKind::Tcp,
            move || {
                cancelled_for_close.store(true, Ordering::SeqCst);
                notify_for_close.notify_waiters();
            },
        );

        let (client_rd, client_wr) = stream.into_split();
        let (upstream_rd, upstream_wr) = upstream_stream.into_split();

        let pool = self.pool.clone();
        let metrics = self.metrics.clone();
        let flow_up = flow.clone();
        let tag_up = tag.clone();
        let up_task = tokio::spawn(copy_direction(
            client_rd,
            upstream_wr,
            pool.clone(),
            move |n| {
                flow_up.add_bytes(ByteDirection::Up, n);
                metrics.add_bytes(&tag_up, Protocol::Tcp, Direction::Upload, n);
            },
        ));

        let pool = self.pool.clone();
        let metrics = self.metrics.clone();
        let flow_dn = flow.clone();
        let tag_dn = tag.clone();
        let down_task = tokio::spawn(copy_direction(
            upstream_rd,
            client_wr,
            pool.clone(),
            move |n| {
                flow_dn.add_bytes(ByteDirection::Down, n);
                metrics.add_bytes(&tag_dn, Protocol::Tcp, Direction::Download, n);
            },
        ));

        let idle_timeout = self.idle_timeout;
        let flow_idle = flow.clone();
        tokio::pin! {
            let up_task = up_task;
            let down_task = down_task;
        }
        let reason = loop {
            tokio::select! {
                r = &mut up_task => break copy_outcome(r),
                r = &mut down_task => break copy_outcome(r),
                _ = tokio::time::sleep(idle_timeout.min(Duration::from_secs(1))) => {
                    if flow_idle.idle_for() >= idle_timeout {
                        break CloseReason::IdleTimeout;
                    }
                }
                _ = notify.notified() => {
                    break if cancelled.load(Ordering::SeqCst) {
                        CloseReason::UpstreamUnusable
                    } else {
                        CloseReason::ContextDone
                    };
                }
            }
        };
        up_task.abort();
        down_task.abort();
        debug!(%client_addr, upstream = %tag, reason = reason.as_str(), "tcp flow closed");
        self.status.remove(flow.id);
    }
}

fn copy_outcome(joined: std::result::Result<CloseReason, tokio::task::JoinError>) -> CloseReason {
    joined.unwrap_or(CloseReason::ReadError)
}

async fn copy_direction<R, W>(
    mut reader: R,
    mut writer: W,
    pool: Arc<BufferPool>,
    mut on_bytes: impl FnMut(u64),
) -> CloseReason
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    let mut buf = pool.take();
    let reason = loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break CloseReason::Eof,
            Ok(n) => n,
            Err(_) => break CloseReason::ReadError,
        };
        if let Err(_) = writer.write_all(&buf[..n]).await {
            break CloseReason::WriteError;
        }
        on_bytes(n as u64);
    };
    pool.give(buf);
    reason
}

async fn dial_with_retries(addr: SocketAddr) -> std::io::Result<TcpStream> {
    let mut last_err = None;
    for attempt in 0..=DIAL_RETRIES {
        if attempt > 0 {
            tokio::time::sleep(DIAL_RETRY_SPACING).await;
        }
        match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => last_err = Some(e),
            Err(_) => {
                last_err = Some(std::io::Error::new(std::io::ErrorKind::TimedOut, "dial timeout"))
            }
        }
    }
    Err(last_err.unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "dial failed")))
}

fn tune_client_socket(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let sock_ref = SockRef::from(stream);
    let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(30));
    let _ = sock_ref.set_tcp_keepalive(&keepalive);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn copy_direction_reports_eof_after_source_closes() {
        let (mut client, server) = duplex(64);
        let (reader, writer) = tokio::io::split(server);
        let pool = Arc::new(BufferPool::new(16));
        client.write_all_buf(&mut bytes::Bytes::from_static(b"hello")).await.unwrap();
        drop(client);
        let counted = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let counted2 = counted.clone();
        let reason = copy_direction(reader, writer, pool, move |n| {
            counted2.fetch_add(n, Ordering::SeqCst);
        })
        .await;
        assert_eq!(reason, CloseReason::Eof);
        assert_eq!(counted.load(Ordering::SeqCst), 5);
    }
}
