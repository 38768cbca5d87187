//! Probe client: drives a series of samples against one upstream's
//! measurement endpoint and returns aggregated throughput, loss and RTT
//! metrics.
//!
//! The connect-dispatch-and-drive shape follows the client-facing half of
//! `iperf3-server`'s session protocol (hello, then a sequence of framed
//! transfers, then a control message to close out); the statistics are
//! purpose-built for this forwarding use case.

use crate::error::{Error, Result};
use crate::rpc::{self, method, RpcRequest, RpcResponse};
use crate::rtt::{RttSampler, RttStats};
use crate::session::SampleAccounting;
use crate::stats;
use bytes::Bytes;
use common::model::{Direction, IntervalBucket, Protocol, SampleMetricRecord};
use common::protocol::{
    read_rpc_message, write_rpc_message, write_session_id, Mode, TcpDataFrame, UdpPacket,
};
use common::ratelimiter::LeakyBucket;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpStream, UdpSocket};

/// Consecutive read-timeout budget before a run is declared failed.
const N_TIMEOUTS: u32 = 3;
/// Extra time allowed past a sample's expected duration before it is
/// considered overdue.
const DEADLINE_GRACE: Duration = Duration::from_secs(2);

/// Cooperative cancellation handle; cheap to clone and share across the RTT
/// sampler and the per-sample transfer loops.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Inputs for one probe run.
#[derive(Debug, Clone)]
pub struct RunParams {
    pub target_host: String,
    pub target_port: u16,
    pub bandwidth_target_bps: f64,
    pub chunk_size: usize,
    pub sample_count: u32,
    pub payload_bytes_per_sample: u64,
    pub inter_sample_wait: Duration,
    pub direction: Direction,
    pub protocol: Protocol,
    pub rtt_hint_ms: Option<f64>,
    pub rtt_sample_rate_hz: f64,
}

/// Derived statistics plus the raw accounting for one sample.
#[derive(Debug, Clone)]
pub struct SampleResult {
    pub trimmed_mean_bps: f64,
    pub peak_1s_bps: f64,
    pub p90_bps: f64,
    pub p80_bps: f64,
    pub record: SampleMetricRecord,
}

fn sample_result(record: SampleMetricRecord) -> SampleResult {
    let series = stats::interval_bps_series(&record.intervals);
    SampleResult {
        trimmed_mean_bps: stats::trimmed_mean(&series),
        peak_1s_bps: stats::peak_1s(&record.intervals),
        p90_bps: stats::percentile_ceil(&series, 90.0),
        p80_bps: stats::percentile_ceil(&series, 80.0),
        record,
    }
}

/// Aggregated result of a complete run across all samples.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub achieved_bps: f64,
    pub utilization: f64,
    pub loss: f64,
    pub rtt: RttStats,
    pub samples: Vec<SampleResult>,
}

pub type ProgressCallback = Arc<dyn Fn(u32, &SampleResult) + Send + Sync>;

pub struct ProbeClient {
    params: RunParams,
}

impl ProbeClient {
    pub fn new(params: RunParams) -> Self {
        Self { params }
    }

    pub async fn run(
        &self,
        cancel: CancelToken,
        progress: Option<ProgressCallback>,
    ) -> Result<RunResult> {
        let target: SocketAddr = tokio::net::lookup_host((
            self.params.target_host.as_str(),
            self.params.target_port,
        ))
        .await?
        .next()
        .ok_or_else(|| Error::InvalidParameter("no address resolved".into()))?;

        match self.try_rpc_run(target, &cancel, progress.clone()).await {
            Ok(result) => Ok(result),
            Err(Error::Io(_)) => self.run_legacy(target, &cancel, progress).await,
            Err(e) => Err(e),
        }
    }

    async fn try_rpc_run(
        &self,
        target: SocketAddr,
        cancel: &CancelToken,
        progress: Option<ProgressCallback>,
    ) -> Result<RunResult> {
        let mut control = TcpStream::connect(target).await?;
        Mode::Rpc.write(&mut control).await?;

        let id = AtomicI64::new(1);
        let hello: rpc::SessionHelloResult = call_rpc(
            &mut control,
            &id,
            method::SESSION_HELLO,
            serde_json::json!({}),
        )
        .await?;
        let session_id = hello.session_id;

        let udp_socket = if self.params.protocol == Protocol::Udp {
            Some(Arc::new(UdpSocket::bind("0.0.0.0:0").await?))
        } else {
            None
        };

        let rtt_sampler = self.start_rtt_sampler(target, udp_socket.clone());

        let mut samples = Vec::with_capacity(self.params.sample_count as usize);
        for i in 1..=self.params.sample_count {
            if cancel.is_cancelled() {
                break;
            }
            let record = self
                .run_one_sample(&mut control, &id, &session_id, target, udp_socket.clone(), cancel)
                .await?;
            let result = sample_result(record);
            if let Some(cb) = &progress {
                (cb.as_ref())(i, &result);
            }
            samples.push(result);

            if i < self.params.sample_count && !cancel.is_cancelled() {
                sleep_cancellable(self.params.inter_sample_wait, cancel).await;
            }
        }

        rtt_sampler.stop().await;
        let rtt = rtt_sampler.stats().await;

        let _: Value = call_rpc(
            &mut control,
            &id,
            method::SESSION_CLOSE,
            serde_json::json!({"session_id": session_id}),
        )
        .await
        .unwrap_or(Value::Null);

        Ok(self.aggregate(samples, rtt))
    }

    async fn run_one_sample(
        &self,
        control: &mut TcpStream,
        id: &AtomicI64,
        session_id: &str,
        target: SocketAddr,
        udp_socket: Option<Arc<UdpSocket>>,
        cancel: &CancelToken,
    ) -> Result<SampleMetricRecord> {
        let expected_duration = if self.params.bandwidth_target_bps > 0.0 {
            Duration::from_secs_f64(
                (self.params.payload_bytes_per_sample as f64 * 8.0)
                    / self.params.bandwidth_target_bps,
            )
        } else {
            Duration::from_secs(5)
        };
        let deadline = expected_duration + DEADLINE_GRACE;

        match self.params.direction {
            Direction::Upload => {
                let sample_id: rpc::SampleStartResult = call_rpc(
                    control,
                    id,
                    method::SAMPLE_START,
                    serde_json::json!({
                        "session_id": session_id,
                        "protocol": self.params.protocol,
                        "duration_secs": deadline.as_secs(),
                    }),
                )
                .await?;
                match self.params.protocol {
                    Protocol::Tcp => {
                        self.upload_tcp(target, session_id, sample_id.sample_id, deadline, cancel)
                            .await?;
                    }
                    Protocol::Udp => {
                        let socket = udp_socket.expect("udp socket bound for udp run");
                        self.upload_udp(
                            &socket,
                            target,
                            session_id,
                            sample_id.sample_id,
                            deadline,
                            cancel,
                        )
                        .await?;
                    }
                }
                let stop: rpc::SampleStopResult = call_rpc(
                    control,
                    id,
                    method::SAMPLE_STOP,
                    serde_json::json!({"session_id": session_id, "sample_id": sample_id.sample_id}),
                )
                .await?;
                Ok(stop.record)
            }
            Direction::Download => {
                if self.params.protocol == Protocol::Udp {
                    let socket = udp_socket
                        .clone()
                        .expect("udp socket bound for udp run");
                    self.register_udp(control, id, session_id, &socket, target).await?;
                }
                let sample_id: rpc::SampleStartResult = call_rpc(
                    control,
                    id,
                    method::SAMPLE_START_REVERSE,
                    serde_json::json!({
                        "session_id": session_id,
                        "protocol": self.params.protocol,
                        "duration_secs": deadline.as_secs(),
                        "rate_limit_bps": self.params.bandwidth_target_bps,
                    }),
                )
                .await?;
                let record = match self.params.protocol {
                    Protocol::Tcp => {
                        self.download_tcp(target, session_id, sample_id.sample_id, deadline, cancel)
                            .await?
                    }
                    Protocol::Udp => {
                        let socket = udp_socket
                            .clone()
                            .expect("udp socket bound for udp run");
                        self.download_udp(&socket, sample_id.sample_id, deadline, cancel)
                            .await?
                    }
                };
                let _: Value = call_rpc(
                    control,
                    id,
                    method::SAMPLE_STOP,
                    serde_json::json!({"session_id": session_id, "sample_id": sample_id.sample_id}),
                )
                .await
                .unwrap_or(Value::Null);
                Ok(record)
            }
        }
    }

    async fn upload_tcp(
        &self,
        target: SocketAddr,
        session_id: &str,
        sample_id: u32,
        deadline: Duration,
        cancel: &CancelToken,
    ) -> Result<()> {
        let mut data_conn = TcpStream::connect(target).await?;
        Mode::Data.write(&mut data_conn).await?;
        write_session_id(&mut data_conn, session_id).await?;
        tune_tcp_socket(&data_conn, self.params.bandwidth_target_bps, self.rtt_hint_secs());

        let chunk = vec![0u8; self.params.chunk_size.max(1)];
        let mut sent: u64 = 0;
        let start = Instant::now();
        while sent < self.params.payload_bytes_per_sample {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if start.elapsed() > deadline {
                return Err(Error::Timeout(format!("upload exceeded deadline {deadline:?}")));
            }
            let remaining = (self.params.payload_bytes_per_sample - sent).min(chunk.len() as u64) as usize;
            let frame = TcpDataFrame {
                sample_id,
                payload: Bytes::copy_from_slice(&chunk[..remaining]),
            };
            frame.write(&mut data_conn).await?;
            sent += remaining as u64;
        }
        Ok(())
    }

    async fn upload_udp(
        &self,
        socket: &UdpSocket,
        target: SocketAddr,
        session_id: &str,
        sample_id: u32,
        deadline: Duration,
        cancel: &CancelToken,
    ) -> Result<()> {
        let bucket = LeakyBucket::new(self.params.bandwidth_target_bps / 8.0);
        let payload_len = self.params.chunk_size.clamp(1, 1200);
        let payload = vec![0u8; payload_len];
        let mut sent: u64 = 0;
        let mut seq: u64 = 0;
        let start = Instant::now();
        while sent < self.params.payload_bytes_per_sample {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if start.elapsed() > deadline {
                return Err(Error::Timeout(format!("upload exceeded deadline {deadline:?}")));
            }
            bucket.wait(payload_len as u64).await;
            let packet = UdpPacket::DataSession {
                session_id: session_id.to_string(),
                sample_id,
                seq,
                payload: Bytes::copy_from_slice(&payload),
            };
            socket.send_to(&packet.encode(), target).await?;
            seq += 1;
            sent += payload_len as u64;
        }
        Ok(())
    }

    async fn download_tcp(
        &self,
        target: SocketAddr,
        session_id: &str,
        sample_id: u32,
        deadline: Duration,
        cancel: &CancelToken,
    ) -> Result<SampleMetricRecord> {
        let mut data_conn = TcpStream::connect(target).await?;
        Mode::Recv.write(&mut data_conn).await?;
        write_session_id(&mut data_conn, session_id).await?;

        let mut accounting = SampleAccounting::new(sample_id, Protocol::Tcp);
        let start = Instant::now();
        let mut consecutive_timeouts = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if start.elapsed() > deadline {
                break;
            }
            match tokio::time::timeout(Duration::from_secs(1), TcpDataFrame::read(&mut data_conn))
                .await
            {
                Ok(Ok(frame)) => {
                    consecutive_timeouts = 0;
                    accounting.record(frame.payload.len(), None, Instant::now());
                }
                Ok(Err(common::Error::Io(e)))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    break;
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_elapsed) => {
                    consecutive_timeouts += 1;
                    if consecutive_timeouts >= N_TIMEOUTS {
                        return Err(Error::Timeout("download read timed out repeatedly".into()));
                    }
                }
            }
        }
        Ok(accounting.finish(None))
    }

    async fn download_udp(
        &self,
        socket: &UdpSocket,
        sample_id: u32,
        deadline: Duration,
        cancel: &CancelToken,
    ) -> Result<SampleMetricRecord> {
        let mut accounting = SampleAccounting::new(sample_id, Protocol::Udp);
        let mut buf = vec![0u8; common::protocol::MAX_UDP_PACKET];
        let start = Instant::now();
        let mut done_count = 0u32;
        let mut consecutive_timeouts = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if start.elapsed() > deadline || done_count >= 3 {
                break;
            }
            match tokio::time::timeout(Duration::from_secs(1), socket.recv_from(&mut buf)).await {
                Ok(Ok((len, _from))) => {
                    consecutive_timeouts = 0;
                    if let Ok(packet) = UdpPacket::decode(&buf[..len]) {
                        match packet {
                            UdpPacket::Data { sample_id: sid, seq, payload } if sid == sample_id => {
                                accounting.record(payload.len(), Some(seq), Instant::now());
                            }
                            UdpPacket::Done { sample_id: sid } if sid == sample_id => {
                                done_count += 1;
                            }
                            _ => {}
                        }
                    }
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_elapsed) => {
                    consecutive_timeouts += 1;
                    if consecutive_timeouts >= N_TIMEOUTS {
                        return Err(Error::Timeout("download read timed out repeatedly".into()));
                    }
                }
            }
        }
        Ok(accounting.finish(None))
    }

    async fn register_udp(
        &self,
        control: &mut TcpStream,
        id: &AtomicI64,
        session_id: &str,
        socket: &UdpSocket,
        target: SocketAddr,
    ) -> Result<()> {
        let nanos = Instant::now().elapsed().as_nanos() as u64;
        let ping = UdpPacket::Ping { nanos }.encode();
        socket.send_to(&ping, target).await?;
        let local_port = socket.local_addr()?.port();
        let _: Value = call_rpc(
            control,
            id,
            method::UDP_REGISTER,
            serde_json::json!({"session_id": session_id, "client_udp_port": local_port}),
        )
        .await?;
        Ok(())
    }

    fn rtt_hint_secs(&self) -> f64 {
        self.params.rtt_hint_ms.unwrap_or(50.0) / 1000.0
    }

    fn start_rtt_sampler(
        &self,
        target: SocketAddr,
        udp_socket: Option<Arc<UdpSocket>>,
    ) -> Arc<RttSampler> {
        let protocol = self.params.protocol;
        let rate = self.params.rtt_sample_rate_hz.max(0.1);
        RttSampler::start(rate, move || {
            let udp_socket = udp_socket.clone();
            async move {
                match protocol {
                    Protocol::Tcp => tcp_ping(target).await,
                    Protocol::Udp => {
                        let socket = udp_socket.ok_or(())?;
                        udp_ping(&socket, target).await
                    }
                }
            }
        })
    }

    fn aggregate(&self, samples: Vec<SampleResult>, rtt: RttStats) -> RunResult {
        let achieved_bps = if samples.is_empty() {
            0.0
        } else {
            samples.iter().map(|s| s.trimmed_mean_bps).sum::<f64>() / samples.len() as f64
        };
        let utilization = if self.params.bandwidth_target_bps > 0.0 {
            (achieved_bps / self.params.bandwidth_target_bps).max(0.0)
        } else {
            0.0
        };
        let loss = match self.params.protocol {
            Protocol::Tcp => {
                let max_retrans = samples
                    .iter()
                    .filter_map(|s| s.record.tcp_info.map(|t| t.retransmits()))
                    .max()
                    .unwrap_or(0);
                let max_segments = samples
                    .iter()
                    .filter_map(|s| s.record.tcp_info.map(|t| t.segments_sent()))
                    .max()
                    .unwrap_or(0);
                if max_segments == 0 {
                    0.0
                } else {
                    max_retrans as f64 / max_segments as f64
                }
            }
            Protocol::Udp => {
                let recv: u64 = samples.iter().map(|s| s.record.packets_recv).sum();
                let lost: u64 = samples.iter().map(|s| s.record.packets_lost).sum();
                if recv + lost == 0 {
                    0.0
                } else {
                    lost as f64 / (recv + lost) as f64
                }
            }
        };
        RunResult {
            achieved_bps,
            utilization,
            loss,
            rtt,
            samples,
        }
    }

    /// Reduced-feature fallback for servers that only understand the
    /// `CTRL` text dialect: single-connection, TCP-only, upload-only.
    async fn run_legacy(
        &self,
        target: SocketAddr,
        cancel: &CancelToken,
        progress: Option<ProgressCallback>,
    ) -> Result<RunResult> {
        let mut conn = TcpStream::connect(target).await?;
        Mode::Ctrl.write(&mut conn).await?;
        let mut samples = Vec::new();
        for i in 1..=self.params.sample_count {
            if cancel.is_cancelled() {
                break;
            }
            let line = format!("SAMPLE_START {i}\n");
            use tokio::io::AsyncWriteExt;
            conn.write_all(line.as_bytes()).await?;

            let chunk = vec![0u8; self.params.chunk_size.max(1)];
            let mut sent: u64 = 0;
            while sent < self.params.payload_bytes_per_sample {
                let remaining =
                    (self.params.payload_bytes_per_sample - sent).min(chunk.len() as u64) as usize;
                let frame = TcpDataFrame {
                    sample_id: i,
                    payload: Bytes::copy_from_slice(&chunk[..remaining]),
                };
                frame.write(&mut conn).await?;
                sent += remaining as u64;
            }

            conn.write_all(format!("SAMPLE_STOP {i}\n").as_bytes())
                .await?;
            let mut line_buf = Vec::new();
            read_line(&mut conn, &mut line_buf).await?;
            let record: SampleMetricRecord = serde_json::from_slice(&line_buf)?;
            let result = sample_result(record);
            if let Some(cb) = &progress {
                (cb.as_ref())(i, &result);
            }
            samples.push(result);
        }
        Ok(self.aggregate(samples, RttStats::default()))
    }
}

async fn read_line(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Result<()> {
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await?;
        if byte[0] == b'\n' {
            return Ok(());
        }
        buf.push(byte[0]);
    }
}

async fn sleep_cancellable(duration: Duration, cancel: &CancelToken) {
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        if cancel.is_cancelled() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50).min(duration)).await;
    }
}

async fn tcp_ping(target: SocketAddr) -> std::result::Result<Duration, ()> {
    let start = Instant::now();
    let mut conn = TcpStream::connect(target).await.map_err(|_| ())?;
    Mode::Ping.write(&mut conn).await.map_err(|_| ())?;
    let mut buf = [0u8; 4];
    conn.read_exact(&mut buf).await.map_err(|_| ())?;
    Ok(start.elapsed())
}

async fn udp_ping(socket: &UdpSocket, target: SocketAddr) -> std::result::Result<Duration, ()> {
    let start = Instant::now();
    let nanos = start.elapsed().as_nanos() as u64;
    let packet = UdpPacket::Ping { nanos }.encode();
    socket.send_to(&packet, target).await.map_err(|_| ())?;
    let mut buf = [0u8; 32];
    let (len, _from) = tokio::time::timeout(Duration::from_secs(1), socket.recv_from(&mut buf))
        .await
        .map_err(|_| ())?
        .map_err(|_| ())?;
    if UdpPacket::decode(&buf[..len]).is_ok() {
        Ok(start.elapsed())
    } else {
        Err(())
    }
}

fn tune_tcp_socket(stream: &TcpStream, rate_bps: f64, rtt_secs: f64) {
    let _ = stream.set_nodelay(true);
    let bdp_bytes = ((rate_bps / 8.0) * rtt_secs).ceil().max(1.0) as usize;
    set_send_pacing(stream, rate_bps, bdp_bytes);
}

#[cfg(target_os = "linux")]
fn set_send_pacing(stream: &TcpStream, rate_bps: f64, bdp_bytes: usize) {
    use std::os::unix::io::AsRawFd;
    let fd = stream.as_raw_fd();
    let rate = (rate_bps / 8.0) as u64;
    if rate > 0 {
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_MAX_PACING_RATE,
                &rate as *const _ as *const libc::c_void,
                std::mem::size_of::<u64>() as libc::socklen_t,
            );
        }
    }
    let bufsize = bdp_bytes as libc::c_int;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &bufsize as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn set_send_pacing(_stream: &TcpStream, _rate_bps: f64, _bdp_bytes: usize) {}

async fn call_rpc<T: serde::de::DeserializeOwned>(
    stream: &mut TcpStream,
    id: &AtomicI64,
    method: &str,
    params: Value,
) -> Result<T> {
    let request_id = id.fetch_add(1, Ordering::SeqCst);
    let request = RpcRequest::new(request_id, method, params);
    write_rpc_message(stream, &serde_json::to_value(&request)?).await?;
    let value = read_rpc_message(stream).await?;
    let response: RpcResponse = serde_json::from_value(value)?;
    if let Some(err) = response.error {
        return Err(Error::Remote {
            code: err.code,
            message: err.message,
        });
    }
    let result = response.result.unwrap_or(Value::Null);
    Ok(serde_json::from_value(result)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_is_observable_after_cancel() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn sample_result_computes_stats_from_record() {
        let record = SampleMetricRecord {
            sample_id: 1,
            total_bytes: 1_000_000,
            intervals: vec![
                IntervalBucket { bytes: 100_000, duration_ms: 100, ooo_count: 0 };
                10
            ],
            packets_recv: 1000,
            packets_lost: 0,
            tcp_info: None,
            total_duration_secs: 1.0,
        };
        let result = sample_result(record);
        assert!(result.trimmed_mean_bps > 0.0);
        assert!(result.peak_1s_bps > 0.0);
    }
}
