//! Probe server: one TCP+UDP port accepting control connections (JSON-RPC
//! or legacy `CTRL` text), data/reverse data connections, and one-shot
//! pings; dispatches UDP by packet type.
//!
//! Grounded on `Iperf3Server` in `iperf3-server/src/server.rs` — the accept
//! loop, per-connection `handle_session` task, and the shutdown broadcast
//! all follow that shape; the method dispatch table and accounting are
//! generalized to the richer bwprobe dialect.

use crate::error::{Error, Result};
use crate::rpc::{self, method, RpcRequest, RpcResponse, SampleStartParams, SampleStopParams};
use crate::session::{snapshot_tcp_info, ProbeSession};
use bytes::Bytes;
use common::model::Protocol;
use common::protocol::{
    read_rpc_message, validate_session_id, write_rpc_message, Mode, TcpDataFrame, UdpPacket,
    TCP_PONG_REPLY,
};
use common::ratelimiter::LeakyBucket;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// Tunables for a running [`ProbeServer`]; all have sensible defaults.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub heartbeat_interval_ms: u64,
    pub session_expiry: Duration,
    pub udp_ping_validity: Duration,
    pub recv_wait: Duration,
    pub janitor_interval: Duration,
    pub udp_ping_retention: Duration,
    pub server_version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 10_000,
            session_expiry: Duration::from_secs(60),
            udp_ping_validity: Duration::from_secs(5),
            recv_wait: Duration::from_secs(5),
            janitor_interval: Duration::from_secs(30),
            udp_ping_retention: Duration::from_secs(15 * 60),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// One bwprobe measurement endpoint: session table, shared UDP socket,
/// shutdown broadcast.
pub struct ProbeServer {
    config: ServerConfig,
    sessions: RwLock<HashMap<Uuid, Arc<ProbeSession>>>,
    recent_udp_pings: RwLock<HashMap<SocketAddr, Instant>>,
    udp_socket: RwLock<Option<Arc<UdpSocket>>>,
    started_at: Instant,
    shutdown_tx: broadcast::Sender<()>,
}

impl ProbeServer {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        Arc::new(Self {
            config,
            sessions: RwLock::new(HashMap::new()),
            recent_udp_pings: RwLock::new(HashMap::new()),
            udp_socket: RwLock::new(None),
            started_at: Instant::now(),
            shutdown_tx,
        })
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Accept TCP connections and UDP packets until shutdown; spawns the
    /// janitor task. Mirrors `Iperf3Server::run`'s accept-loop-plus-shutdown
    /// structure.
    pub async fn run(
        self: Arc<Self>,
        tcp_listener: TcpListener,
        udp_socket: UdpSocket,
    ) -> Result<()> {
        let udp_socket = Arc::new(udp_socket);
        *self.udp_socket.write().await = Some(udp_socket.clone());

        let janitor_self = self.clone();
        tokio::spawn(async move { janitor_self.run_janitor().await });

        let udp_self = self.clone();
        let udp_socket_rx = udp_socket.clone();
        tokio::spawn(async move { udp_self.run_udp_loop(udp_socket_rx).await });

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                accepted = tcp_listener.accept() => {
                    let (stream, peer) = accepted?;
                    let this = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = this.handle_connection(stream, peer).await {
                            tracing::debug!(%peer, error = %e, "probe connection ended with error");
                        }
                    });
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("probe server shutting down");
                    return Ok(());
                }
            }
        }
    }

    async fn run_janitor(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.janitor_interval);
        loop {
            interval.tick().await;
            let mut sessions = self.sessions.write().await;
            sessions.retain(|id, session| {
                let keep = !session.is_expired(self.config.session_expiry);
                if !keep {
                    tracing::debug!(session_id = %id, "janitor pruning idle session");
                }
                keep
            });
            drop(sessions);
            let mut pings = self.recent_udp_pings.write().await;
            pings.retain(|_, at| at.elapsed() <= self.config.udp_ping_retention);
        }
    }

    async fn run_udp_loop(self: Arc<Self>, socket: Arc<UdpSocket>) {
        let mut buf = vec![0u8; common::protocol::MAX_UDP_PACKET];
        loop {
            let (len, addr) = match socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, "udp recv error");
                    continue;
                }
            };
            let packet = match UdpPacket::decode(&buf[..len]) {
                Ok(p) => p,
                Err(e) => {
                    tracing::debug!(%addr, error = %e, "dropping malformed udp packet");
                    continue;
                }
            };
            self.handle_udp_packet(&socket, addr, packet).await;
        }
    }

    async fn handle_udp_packet(&self, socket: &UdpSocket, addr: SocketAddr, packet: UdpPacket) {
        match packet {
            UdpPacket::Ping { nanos } => {
                self.recent_udp_pings.write().await.insert(addr, Instant::now());
                let pong = UdpPacket::Pong { nanos }.encode();
                let _ = socket.send_to(&pong, addr).await;
            }
            UdpPacket::Data { sample_id, seq, payload } => {
                if let Some(session) = self.session_by_udp_endpoint(addr).await {
                    let _ = session.record_payload(sample_id, payload.len(), Some(seq));
                }
            }
            UdpPacket::DataSession {
                session_id,
                sample_id,
                seq,
                payload,
            } => {
                if let Ok(id) = Uuid::parse_str(&session_id) {
                    if let Some(session) = self.sessions.read().await.get(&id).cloned() {
                        let _ = session.record_payload(sample_id, payload.len(), Some(seq));
                    }
                }
            }
            UdpPacket::Done { .. } | UdpPacket::Stats { .. } | UdpPacket::Pong { .. } => {}
        }
    }

    async fn session_by_udp_endpoint(&self, addr: SocketAddr) -> Option<Arc<ProbeSession>> {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .find(|s| s.udp_endpoint() == Some(addr))
            .cloned()
    }

    async fn handle_connection(self: Arc<Self>, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let mode = Mode::read(&mut stream).await?;
        match mode {
            Mode::Rpc => self.handle_rpc_connection(stream, peer).await,
            Mode::Ctrl => self.handle_legacy_connection(stream, peer).await,
            Mode::Ping => {
                stream.write_all(TCP_PONG_REPLY).await?;
                Ok(())
            }
            Mode::Data => self.handle_data_connection(stream).await,
            Mode::Recv => self.handle_recv_connection(stream).await,
        }
    }

    /// `DATA` connections carry uploaded bytes for an already-started
    /// sample: session id first (RPC control only), then a stream of
    /// [`TcpDataFrame`]s until EOF.
    async fn handle_data_connection(self: Arc<Self>, mut stream: TcpStream) -> Result<()> {
        let session_id = common::protocol::read_session_id(&mut stream).await?;
        let id = Uuid::parse_str(&session_id).map_err(|_| Error::SessionInvalid(session_id.clone()))?;
        let session = self
            .sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(Error::SessionInvalid(session_id))?;

        loop {
            match TcpDataFrame::read(&mut stream).await {
                Ok(frame) => {
                    session.record_payload(frame.sample_id, frame.payload.len(), None)?;
                }
                Err(common::Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    if let Some(info) = snapshot_tcp_info(&stream) {
                        session.record_tcp_info(info);
                    }
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// `RECV` connections are the TCP reverse-sample sender: the server
    /// writes framed chunks until told to stop via `sample.stop`'s
    /// bookkeeping (the active sample being cleared ends the loop).
    async fn handle_recv_connection(self: Arc<Self>, mut stream: TcpStream) -> Result<()> {
        let session_id = common::protocol::read_session_id(&mut stream).await?;
        let id = Uuid::parse_str(&session_id).map_err(|_| Error::SessionInvalid(session_id.clone()))?;
        let session = self
            .sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(Error::SessionInvalid(session_id))?;

        let _ = stream.set_nodelay(true);

        let sample_id = session
            .active_sample_id()
            .ok_or(Error::ReverseNotReady)?;
        let chunk = vec![0u8; 64 * 1024];
        let mut sent: u64 = 0;
        let target_bytes = self.reverse_sample_bytes(&session).await;
        while sent < target_bytes {
            let remaining = (target_bytes - sent).min(chunk.len() as u64) as usize;
            let frame = TcpDataFrame {
                sample_id,
                payload: Bytes::copy_from_slice(&chunk[..remaining]),
            };
            if frame.write(&mut stream).await.is_err() {
                break;
            }
            sent += remaining as u64;
            if session.active_sample_id() != Some(sample_id) {
                break;
            }
        }
        Ok(())
    }

    /// Stand-in for the per-sample target byte count while a sample is
    /// active; recv-side samples are open-ended until `sample.stop`, so the
    /// sender just keeps going until the session's active sample changes.
    async fn reverse_sample_bytes(&self, _session: &ProbeSession) -> u64 {
        u64::MAX
    }

    async fn handle_rpc_connection(self: Arc<Self>, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
        loop {
            let value = match read_rpc_message(&mut stream).await {
                Ok(v) => v,
                Err(common::Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            let request: RpcRequest = serde_json::from_value(value)?;
            let response = self.dispatch(&request, peer).await;
            write_rpc_message(&mut stream, &serde_json::to_value(&response)?).await?;
        }
    }

    async fn dispatch(&self, request: &RpcRequest, peer: SocketAddr) -> RpcResponse {
        match self.dispatch_inner(request, peer).await {
            Ok(result) => RpcResponse::ok(request.id.clone(), result),
            Err(e) => RpcResponse::err(request.id.clone(), e.rpc_code(), e.to_string()),
        }
    }

    async fn dispatch_inner(&self, request: &RpcRequest, peer: SocketAddr) -> Result<serde_json::Value> {
        match request.method.as_str() {
            method::SESSION_HELLO => {
                let session = Arc::new(ProbeSession::new());
                let id = session.id;
                self.sessions.write().await.insert(id, session);
                let result = rpc::SessionHelloResult {
                    session_id: id.to_string(),
                    heartbeat_interval_ms: self.config.heartbeat_interval_ms,
                    session_expiry_ms: self.config.session_expiry.as_millis() as u64,
                };
                Ok(serde_json::to_value(result)?)
            }
            method::SESSION_HEARTBEAT => {
                let session = self.resolve_session(request).await?;
                session.touch();
                Ok(serde_json::json!({"server_time_ms": now_ms()}))
            }
            method::SESSION_CLOSE => {
                let params: rpc::SessionScopedParams = serde_json::from_value(request.params.clone())?;
                let id = Uuid::parse_str(&params.session_id)
                    .map_err(|_| Error::SessionInvalid(params.session_id.clone()))?;
                self.sessions.write().await.remove(&id);
                Ok(serde_json::json!({}))
            }
            method::SERVER_INFO => {
                let result = rpc::ServerInfoResult {
                    server_version: self.config.server_version.clone(),
                    max_sample_duration_secs: 3600,
                    max_udp_packet: common::protocol::MAX_UDP_PACKET,
                    max_tcp_frame_payload: common::protocol::MAX_TCP_FRAME_PAYLOAD,
                };
                Ok(serde_json::to_value(result)?)
            }
            method::PING => Ok(serde_json::json!({"server_time_ms": now_ms()})),
            method::UDP_REGISTER => {
                let params: rpc::UdpRegisterParams = serde_json::from_value(request.params.clone())?;
                let session = self.resolve_session_by_id(&params.session_id).await?;
                let addr = SocketAddr::new(peer.ip(), params.client_udp_port);
                let fresh = self
                    .recent_udp_pings
                    .read()
                    .await
                    .get(&addr)
                    .map(|at| at.elapsed() <= self.config.udp_ping_validity)
                    .unwrap_or(false);
                if !fresh {
                    return Err(Error::UdpNotRegistered(params.session_id));
                }
                session.set_udp_endpoint(addr);
                Ok(serde_json::json!({}))
            }
            method::SAMPLE_START => {
                let params: SampleStartParams = serde_json::from_value(request.params.clone())?;
                let session = self.resolve_session_by_id(&params.session_id).await?;
                let sample_id = session.start_sample(params.protocol)?;
                Ok(serde_json::to_value(rpc::SampleStartResult { sample_id })?)
            }
            method::SAMPLE_START_REVERSE => {
                let params: SampleStartParams = serde_json::from_value(request.params.clone())?;
                let session = self.resolve_session_by_id(&params.session_id).await?;
                let sample_id = session.start_sample(params.protocol)?;
                if params.protocol == Protocol::Udp {
                    if let Some(addr) = session.udp_endpoint() {
                        if let Some(socket) = self.udp_socket.read().await.clone() {
                            self.spawn_udp_reverse_sender(socket, addr, sample_id, params.rate_limit_bps);
                        }
                    } else {
                        return Err(Error::ReverseNotReady);
                    }
                }
                Ok(serde_json::to_value(rpc::SampleStartResult { sample_id })?)
            }
            method::SAMPLE_STOP => {
                let params: SampleStopParams = serde_json::from_value(request.params.clone())?;
                let session = self.resolve_session_by_id(&params.session_id).await?;
                tokio::time::sleep(Duration::from_millis(50).min(self.config.recv_wait)).await;
                let tcp_info = session.take_tcp_info();
                let record = session.stop_sample(params.sample_id, tcp_info)?;
                Ok(serde_json::to_value(rpc::SampleStopResult { record })?)
            }
            other => Err(Error::InvalidParameter(format!("unknown method {other}"))),
        }
    }

    fn spawn_udp_reverse_sender(
        &self,
        socket: Arc<UdpSocket>,
        addr: SocketAddr,
        sample_id: u32,
        rate_limit_bps: Option<f64>,
    ) {
        tokio::spawn(async move {
            let bucket = LeakyBucket::new(rate_limit_bps.unwrap_or(0.0));
            let payload = vec![0u8; 1200];
            let mut seq: u64 = 0;
            loop {
                bucket.wait(payload.len() as u64).await;
                let packet = UdpPacket::Data {
                    sample_id,
                    seq,
                    payload: Bytes::copy_from_slice(&payload),
                };
                if socket.send_to(&packet.encode(), addr).await.is_err() {
                    break;
                }
                seq += 1;
                if seq > 2_000_000 {
                    break;
                }
            }
            for _ in 0..3 {
                let done = UdpPacket::Done { sample_id }.encode();
                let _ = socket.send_to(&done, addr).await;
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });
    }

    async fn resolve_session(&self, request: &RpcRequest) -> Result<Arc<ProbeSession>> {
        let params: rpc::SessionScopedParams = serde_json::from_value(request.params.clone())?;
        self.resolve_session_by_id(&params.session_id).await
    }

    async fn resolve_session_by_id(&self, session_id: &str) -> Result<Arc<ProbeSession>> {
        validate_session_id(session_id)?;
        let id = Uuid::parse_str(session_id).map_err(|_| Error::SessionInvalid(session_id.to_string()))?;
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::SessionInvalid(session_id.to_string()))
    }

    /// Legacy newline-delimited `CTRL` dialect: `SAMPLE_START <id> [REVERSE
    /// bw chunk rtt_ms sample_bytes udp_port]` / `SAMPLE_STOP <id>`,
    /// responding `OK` or a JSON report line. The connection doubles as its
    /// own anonymous session for the lifetime of the TCP connection, since
    /// the legacy dialect predates `session.hello` and carries no session
    /// id of its own.
    async fn handle_legacy_connection(self: Arc<Self>, stream: TcpStream, _peer: SocketAddr) -> Result<()> {
        let session = Arc::new(ProbeSession::new());
        let (reader_half, mut writer_half) = stream.into_split();
        let mut lines = BufReader::new(reader_half).lines();

        while let Some(line) = lines.next_line().await? {
            let mut parts = line.split_whitespace();
            match parts.next() {
                Some("SAMPLE_START") => {
                    let id_str = parts.next().unwrap_or_default();
                    let _requested_id: u32 = id_str.parse().unwrap_or(0);
                    let reverse = parts.next() == Some("REVERSE");
                    let protocol = Protocol::Tcp;
                    let sample_id = session.start_sample(protocol)?;
                    if reverse {
                        // Legacy reverse replies with a JSON priming line
                        // instead of switching to framed binary, keeping the
                        // connection text-oriented throughout.
                        let line = serde_json::json!({"sample_id": sample_id, "primed": true});
                        writer_half.write_all(line.to_string().as_bytes()).await?;
                        writer_half.write_all(b"\n").await?;
                    } else {
                        writer_half.write_all(b"OK\n").await?;
                    }
                }
                Some("SAMPLE_STOP") => {
                    let id_str = parts.next().unwrap_or_default();
                    let sample_id: u32 = id_str
                        .parse()
                        .map_err(|_| Error::InvalidParameter(format!("bad sample id {id_str}")))?;
                    let record = session.stop_sample(sample_id, None)?;
                    let report = serde_json::to_string(&record)?;
                    writer_half.write_all(report.as_bytes()).await?;
                    writer_half.write_all(b"\n").await?;
                }
                _ => {
                    writer_half.write_all(b"ERR unknown command\n").await?;
                }
            }
        }
        Ok(())
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub async fn active_session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

fn now_ms() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpStream as TokioTcpStream;

    async fn spawn_server() -> (Arc<ProbeServer>, SocketAddr, SocketAddr) {
        let server = ProbeServer::new(ServerConfig::default());
        let tcp_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let tcp_addr = tcp_listener.local_addr().unwrap();
        let udp_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let udp_addr = udp_socket.local_addr().unwrap();
        let server_clone = server.clone();
        tokio::spawn(async move {
            let _ = server_clone.run(tcp_listener, udp_socket).await;
        });
        (server, tcp_addr, udp_addr)
    }

    #[tokio::test]
    async fn hello_heartbeat_close_round_trip() {
        let (server, tcp_addr, _udp_addr) = spawn_server().await;
        let mut stream = TokioTcpStream::connect(tcp_addr).await.unwrap();
        Mode::Rpc.write(&mut stream).await.unwrap();

        let req = RpcRequest::new(1, method::SESSION_HELLO, serde_json::json!({}));
        write_rpc_message(&mut stream, &serde_json::to_value(&req).unwrap())
            .await
            .unwrap();
        let resp_val = read_rpc_message(&mut stream).await.unwrap();
        let resp: RpcResponse = serde_json::from_value(resp_val).unwrap();
        assert!(resp.error.is_none());
        let hello: rpc::SessionHelloResult =
            serde_json::from_value(resp.result.unwrap()).unwrap();

        let req = RpcRequest::new(
            2,
            method::SESSION_HEARTBEAT,
            serde_json::json!({"session_id": hello.session_id}),
        );
        write_rpc_message(&mut stream, &serde_json::to_value(&req).unwrap())
            .await
            .unwrap();
        let resp_val = read_rpc_message(&mut stream).await.unwrap();
        let resp: RpcResponse = serde_json::from_value(resp_val).unwrap();
        assert!(resp.error.is_none());

        assert_eq!(server.active_session_count().await, 1);

        let req = RpcRequest::new(
            3,
            method::SESSION_CLOSE,
            serde_json::json!({"session_id": hello.session_id}),
        );
        write_rpc_message(&mut stream, &serde_json::to_value(&req).unwrap())
            .await
            .unwrap();
        let _ = read_rpc_message(&mut stream).await.unwrap();
        assert_eq!(server.active_session_count().await, 0);
    }

    #[tokio::test]
    async fn unknown_session_reports_invalid() {
        let (_server, tcp_addr, _udp_addr) = spawn_server().await;
        let mut stream = TokioTcpStream::connect(tcp_addr).await.unwrap();
        Mode::Rpc.write(&mut stream).await.unwrap();
        let req = RpcRequest::new(
            1,
            method::SESSION_HEARTBEAT,
            serde_json::json!({"session_id": Uuid::new_v4().to_string()}),
        );
        write_rpc_message(&mut stream, &serde_json::to_value(&req).unwrap())
            .await
            .unwrap();
        let resp_val = read_rpc_message(&mut stream).await.unwrap();
        let resp: RpcResponse = serde_json::from_value(resp_val).unwrap();
        assert_eq!(resp.error.unwrap().code, crate::error::rpc_code::SESSION_INVALID);
    }

    #[tokio::test]
    async fn ping_one_shot_replies_pong() {
        let (_server, tcp_addr, _udp_addr) = spawn_server().await;
        let mut stream = TokioTcpStream::connect(tcp_addr).await.unwrap();
        Mode::Ping.write(&mut stream).await.unwrap();
        let mut buf = [0u8; 4];
        use tokio::io::AsyncReadExt;
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, TCP_PONG_REPLY);
    }

    #[tokio::test]
    async fn legacy_ctrl_sample_lifecycle() {
        let (_server, tcp_addr, _udp_addr) = spawn_server().await;
        let mut stream = TokioTcpStream::connect(tcp_addr).await.unwrap();
        Mode::Ctrl.write(&mut stream).await.unwrap();
        stream.write_all(b"SAMPLE_START 1\n").await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        assert_eq!(line, "OK");
        writer.write_all(b"SAMPLE_STOP 1\n").await.unwrap();
        let report = lines.next_line().await.unwrap().unwrap();
        let record: common::model::SampleMetricRecord = serde_json::from_str(&report).unwrap();
        assert_eq!(record.total_bytes, 0);
    }
}
