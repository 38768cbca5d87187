//! Probe session accounting: per-session bookkeeping on the server side —
//! 100ms interval buckets, first/last byte timestamps, UDP sequence
//! tracking, and the TCP_INFO snapshot taken at sample stop.
//!
//! Structurally this plays the role `TestSession` does in
//! `iperf3-server/src/session.rs`, but accounts in 100ms interval buckets
//! instead of iperf3's whole-test byte counters, and tracks UDP sequence
//! numbers for loss/reorder accounting rather than deferring that to the
//! kernel.

use crate::error::{Error, Result};
use common::model::{IntervalBucket, Protocol, SampleMetricRecord, TcpInfoSnapshot};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Width of one accounting bucket: interval bucket index =
/// floor((t - start)/100 ms).
pub const BUCKET_MS: u64 = 100;

/// How many recent UDP sequence numbers to remember for duplicate
/// detection. Rather than let duplicates inflate `packets_recv` and
/// silently shrink the reported loss count, we track a bounded seen-set and
/// only count a sequence number once towards `packets_recv`; repeats are
/// counted separately as duplicates and never reduce loss, keeping the
/// `packets_recv + packets_lost = max_seq - base_seq + 1` invariant exact.
const SEEN_SEQ_WINDOW: usize = 8192;

/// Per-sample accounting state, embedded in a [`ProbeSession`] while active
/// and converted to a [`SampleMetricRecord`] on stop.
#[derive(Debug)]
pub struct SampleAccounting {
    sample_id: u32,
    protocol: Protocol,
    start: Option<Instant>,
    last_byte: Option<Instant>,
    buckets: Vec<IntervalBucket>,
    total_bytes: u64,
    base_seq: Option<u64>,
    max_seq: Option<u64>,
    packets_recv: u64,
    packets_duplicate: u64,
    seen_seqs: HashSet<u64>,
    seen_order: std::collections::VecDeque<u64>,
}

impl SampleAccounting {
    pub fn new(sample_id: u32, protocol: Protocol) -> Self {
        Self {
            sample_id,
            protocol,
            start: None,
            last_byte: None,
            buckets: Vec::new(),
            total_bytes: 0,
            base_seq: None,
            max_seq: None,
            packets_recv: 0,
            packets_duplicate: 0,
            seen_seqs: HashSet::new(),
            seen_order: std::collections::VecDeque::new(),
        }
    }

    fn bucket_index(&self, at: Instant) -> usize {
        let start = self.start.expect("start set before first record");
        (at.saturating_duration_since(start).as_millis() / BUCKET_MS as u128) as usize
    }

    fn ensure_bucket(&mut self, idx: usize) {
        if self.buckets.len() <= idx {
            self.buckets.resize(idx + 1, IntervalBucket::default());
        }
    }

    fn remember_seq(&mut self, seq: u64) -> bool {
        if self.seen_seqs.contains(&seq) {
            return true;
        }
        self.seen_seqs.insert(seq);
        self.seen_order.push_back(seq);
        if self.seen_order.len() > SEEN_SEQ_WINDOW {
            if let Some(old) = self.seen_order.pop_front() {
                self.seen_seqs.remove(&old);
            }
        }
        false
    }

    pub fn record(&mut self, len: usize, seq: Option<u64>, at: Instant) {
        if self.start.is_none() {
            self.start = Some(at);
        }
        self.last_byte = Some(at);
        let idx = self.bucket_index(at);
        self.ensure_bucket(idx);
        self.buckets[idx].bytes += len as u64;
        self.total_bytes += len as u64;

        if let Some(seq) = seq {
            if self.base_seq.is_none() {
                self.base_seq = Some(seq);
            }
            let is_dup = self.remember_seq(seq);
            let max_seq = self.max_seq.get_or_insert(seq);
            if seq < *max_seq {
                self.buckets[idx].ooo_count += 1;
            } else {
                *max_seq = seq;
            }
            if is_dup {
                self.packets_duplicate += 1;
            } else {
                self.packets_recv += 1;
            }
        }
    }

    pub fn finish(mut self, tcp_info: Option<TcpInfoSnapshot>) -> SampleMetricRecord {
        let (start, last_byte) = match (self.start, self.last_byte) {
            (Some(s), Some(l)) => (s, l),
            _ => (Instant::now(), Instant::now()),
        };
        // Clamp the last interval's duration to the actual elapsed time:
        // duration_ms = last_byte - (start + idx*100ms).
        if let Some(last_idx) = self.buckets.len().checked_sub(1) {
            let bucket_start = start + Duration::from_millis(last_idx as u64 * BUCKET_MS);
            let dur = last_byte.saturating_duration_since(bucket_start);
            self.buckets[last_idx].duration_ms = dur.as_millis() as u64;
            for (i, bucket) in self.buckets.iter_mut().enumerate().take(last_idx) {
                let _ = i;
                if bucket.duration_ms == 0 {
                    bucket.duration_ms = BUCKET_MS;
                }
            }
        }

        let packets_lost = match (self.base_seq, self.max_seq) {
            (Some(base), Some(max)) => {
                let span = max - base + 1;
                span.saturating_sub(self.packets_recv)
            }
            _ => 0,
        };

        SampleMetricRecord {
            sample_id: self.sample_id,
            total_bytes: self.total_bytes,
            intervals: self.buckets,
            packets_recv: self.packets_recv,
            packets_lost,
            tcp_info,
            total_duration_secs: last_byte.saturating_duration_since(start).as_secs_f64(),
        }
    }
}

/// A bwprobe control session: a UUID, liveness bookkeeping, the optional
/// registered UDP client endpoint, and at most one active sample.
pub struct ProbeSession {
    pub id: Uuid,
    pub created_at: Instant,
    last_heartbeat: Mutex<Instant>,
    udp_client_endpoint: Mutex<Option<SocketAddr>>,
    active: Mutex<Option<SampleAccounting>>,
    next_sample_id: AtomicU32,
    tcp_info: Mutex<Option<TcpInfoSnapshot>>,
}

impl ProbeSession {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4(),
            created_at: now,
            last_heartbeat: Mutex::new(now),
            udp_client_endpoint: Mutex::new(None),
            active: Mutex::new(None),
            next_sample_id: AtomicU32::new(1),
            tcp_info: Mutex::new(None),
        }
    }

    /// Stash a TCP_INFO snapshot taken off the data/recv connection's
    /// socket once it reaches EOF, for the next `stop_sample` to pick up.
    pub fn record_tcp_info(&self, info: TcpInfoSnapshot) {
        *self.tcp_info.lock().unwrap() = Some(info);
    }

    /// Take and clear the stashed TCP_INFO snapshot, if any arrived in time.
    pub fn take_tcp_info(&self) -> Option<TcpInfoSnapshot> {
        self.tcp_info.lock().unwrap().take()
    }

    pub fn touch(&self) {
        *self.last_heartbeat.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_heartbeat.lock().unwrap().elapsed()
    }

    pub fn is_expired(&self, expiry: Duration) -> bool {
        self.idle_for() > expiry
    }

    /// Bind the client's registered UDP endpoint. The freshness check
    /// against a recently observed `PING` happens in the server, which is
    /// the only place that can see UDP packets before a session has an
    /// endpoint to correlate them by.
    pub fn set_udp_endpoint(&self, addr: SocketAddr) {
        *self.udp_client_endpoint.lock().unwrap() = Some(addr);
    }

    pub fn udp_endpoint(&self) -> Option<SocketAddr> {
        *self.udp_client_endpoint.lock().unwrap()
    }

    pub fn active_sample_id(&self) -> Option<u32> {
        self.active.lock().unwrap().as_ref().map(|s| s.sample_id)
    }

    /// Begin a new sample; sample ids are monotonically increasing within a
    /// session. Rejects a second concurrent sample, matching the invariant
    /// "at most one active sample per session".
    pub fn start_sample(&self, protocol: Protocol) -> Result<u32> {
        let mut guard = self.active.lock().unwrap();
        if guard.is_some() {
            return Err(Error::SampleAlreadyActive);
        }
        let id = self.next_sample_id.fetch_add(1, Ordering::SeqCst);
        *guard = Some(SampleAccounting::new(id, protocol));
        Ok(id)
    }

    /// Record one payload delivery against the active sample.
    pub fn record_payload(&self, sample_id: u32, len: usize, seq: Option<u64>) -> Result<()> {
        self.record_payload_at(sample_id, len, seq, Instant::now())
    }

    pub fn record_payload_at(
        &self,
        sample_id: u32,
        len: usize,
        seq: Option<u64>,
        at: Instant,
    ) -> Result<()> {
        let mut guard = self.active.lock().unwrap();
        match guard.as_mut() {
            Some(sample) if sample.sample_id == sample_id => {
                sample.record(len, seq, at);
                Ok(())
            }
            Some(sample) => Err(Error::SampleIdMismatch {
                active: Some(sample.sample_id),
                got: sample_id,
            }),
            None => Err(Error::SampleIdMismatch {
                active: None,
                got: sample_id,
            }),
        }
    }

    /// Stop the active sample and return its accounting. Accepted iff
    /// `sample_id` matches the active sample.
    pub fn stop_sample(
        &self,
        sample_id: u32,
        tcp_info: Option<TcpInfoSnapshot>,
    ) -> Result<SampleMetricRecord> {
        let mut guard = self.active.lock().unwrap();
        match guard.take() {
            Some(sample) if sample.sample_id == sample_id => Ok(sample.finish(tcp_info)),
            Some(sample) => {
                let active_id = sample.sample_id;
                *guard = Some(sample);
                Err(Error::SampleIdMismatch {
                    active: Some(active_id),
                    got: sample_id,
                })
            }
            None => Err(Error::SampleIdMismatch {
                active: None,
                got: sample_id,
            }),
        }
    }

    pub fn duplicate_count(&self) -> u64 {
        self.active
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.packets_duplicate)
            .unwrap_or(0)
    }
}

impl Default for ProbeSession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "linux")]
pub fn snapshot_tcp_info(stream: &tokio::net::TcpStream) -> Option<TcpInfoSnapshot> {
    use std::os::unix::io::AsRawFd;
    let fd = stream.as_raw_fd();
    let mut info: libc::tcp_info = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::tcp_info>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_INFO,
            &mut info as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return None;
    }
    Some(TcpInfoSnapshot {
        segs_out: info.tcpi_segs_out as u64,
        data_segs_out: info.tcpi_data_segs_out as u64,
        total_retrans: info.tcpi_total_retrans as u64,
        bytes_sent: info.tcpi_bytes_sent as u64,
        bytes_retrans: info.tcpi_bytes_retrans as u64,
        snd_mss: info.tcpi_snd_mss,
    })
}

#[cfg(not(target_os = "linux"))]
pub fn snapshot_tcp_info(_stream: &tokio::net::TcpStream) -> Option<TcpInfoSnapshot> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_lifecycle_and_mismatch() {
        let session = ProbeSession::new();
        let id = session.start_sample(Protocol::Tcp).unwrap();
        assert!(session.start_sample(Protocol::Tcp).is_err());
        session.record_payload(id, 1000, None).unwrap();
        let err = session.stop_sample(id + 1, None).unwrap_err();
        assert!(matches!(err, Error::SampleIdMismatch { .. }));
        let record = session.stop_sample(id, None).unwrap();
        assert_eq!(record.total_bytes, 1000);
    }

    #[test]
    fn sample_ids_increase_monotonically() {
        let session = ProbeSession::new();
        let a = session.start_sample(Protocol::Tcp).unwrap();
        session.stop_sample(a, None).unwrap();
        let b = session.start_sample(Protocol::Tcp).unwrap();
        assert!(b > a);
    }

    #[test]
    fn udp_loss_and_duplicate_accounting() {
        let session = ProbeSession::new();
        let id = session.start_sample(Protocol::Udp).unwrap();
        let now = Instant::now();
        // seq 0..10 received, seq 5 missing, seq 3 duplicated.
        for seq in [0u64, 1, 2, 3, 4, 3, 6, 7, 8, 9] {
            session
                .record_payload_at(id, 100, Some(seq), now + Duration::from_millis(seq))
                .unwrap();
        }
        let record = session.stop_sample(id, None).unwrap();
        // max_seq=9, base_seq=0 -> span 10; distinct received = 9 (seq 5 never arrived, dup 3 not counted twice)
        assert_eq!(record.packets_recv, 9);
        assert_eq!(record.packets_lost, 1);
        assert_eq!(record.packets_recv + record.packets_lost, 10);
    }

    #[test]
    fn bucket_index_matches_100ms_floor() {
        let session = ProbeSession::new();
        let id = session.start_sample(Protocol::Tcp).unwrap();
        let start = Instant::now();
        session.record_payload_at(id, 10, None, start).unwrap();
        session
            .record_payload_at(id, 20, None, start + Duration::from_millis(250))
            .unwrap();
        let record = session.stop_sample(id, None).unwrap();
        assert_eq!(record.intervals.len(), 3);
        assert_eq!(record.intervals[0].bytes, 10);
        assert_eq!(record.intervals[2].bytes, 20);
    }
}
