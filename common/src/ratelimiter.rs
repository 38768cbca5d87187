//! Leaky-bucket byte-rate pacer.
//!
//! Used directly by the UDP sender paths in `bwprobe` and by the reverse-UDP
//! sender in the probe server; `rate <= 0` disables pacing entirely.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Paces callers to a target bytes/sec rate by tracking a virtual "next
/// allowed send" timestamp. Safe to share across tasks: each call to
/// [`LeakyBucket::wait`] atomically claims the next slot, so concurrent
/// callers are serialized onto the same schedule rather than each computing
/// their own independent delay.
pub struct LeakyBucket {
    rate_bytes_per_sec: f64,
    next_allowed: Mutex<Instant>,
}

impl LeakyBucket {
    /// `rate_bytes_per_sec <= 0.0` makes every `wait` a no-op.
    pub fn new(rate_bytes_per_sec: f64) -> Self {
        Self {
            rate_bytes_per_sec,
            next_allowed: Mutex::new(Instant::now()),
        }
    }

    fn is_unlimited(&self) -> bool {
        self.rate_bytes_per_sec <= 0.0
    }

    /// Claim a send slot for `n_bytes` and sleep until it arrives.
    pub async fn wait(&self, n_bytes: u64) {
        if self.is_unlimited() {
            return;
        }
        let start = {
            let mut next = self.next_allowed.lock().unwrap();
            let now = Instant::now();
            let start = (*next).max(now);
            let cost = Duration::from_secs_f64(n_bytes as f64 / self.rate_bytes_per_sec);
            *next = start + cost;
            start
        };
        let now = Instant::now();
        if start > now {
            tokio::time::sleep(start - now).await;
        }
    }

    /// Non-blocking variant for callers outside a tokio runtime (e.g. the
    /// probe server's std-thread reverse sender). Returns the duration the
    /// caller should sleep for, if any.
    pub fn reserve(&self, n_bytes: u64) -> Duration {
        if self.is_unlimited() {
            return Duration::ZERO;
        }
        let mut next = self.next_allowed.lock().unwrap();
        let now = Instant::now();
        let start = (*next).max(now);
        let cost = Duration::from_secs_f64(n_bytes as f64 / self.rate_bytes_per_sec);
        *next = start + cost;
        start.saturating_duration_since(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn disabled_rate_is_noop() {
        let bucket = LeakyBucket::new(0.0);
        assert_eq!(bucket.reserve(1_000_000), Duration::ZERO);
    }

    #[tokio::test]
    async fn average_rate_within_tolerance() {
        // 1 MB/s target, send 1 KiB chunks for slightly over 1 second and
        // check the achieved rate is within +-5%.
        let rate = 1_000_000.0;
        let bucket = LeakyBucket::new(rate);
        let chunk = 1024u64;
        let start = Instant::now();
        let mut sent = 0u64;
        while start.elapsed() < Duration::from_millis(1100) {
            bucket.wait(chunk).await;
            sent += chunk;
        }
        let elapsed = start.elapsed().as_secs_f64();
        let achieved = sent as f64 / elapsed;
        let ratio = achieved / rate;
        assert!((0.90..=1.10).contains(&ratio), "achieved rate ratio {ratio}");
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_schedule() {
        let bucket = std::sync::Arc::new(LeakyBucket::new(10_000.0));
        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let bucket = bucket.clone();
            handles.push(tokio::spawn(async move {
                bucket.wait(10_000).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        // four 1-second-equivalent sends sharing one 10kB/s bucket should take
        // roughly 4 seconds total, not ~0 (each claiming its own slot).
        assert!(start.elapsed() >= Duration::from_millis(3500));
    }
}
