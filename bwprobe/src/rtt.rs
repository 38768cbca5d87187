//! Periodic background RTT sampler: ticks at a fixed rate, invokes a
//! caller-supplied async ping, and accumulates count/min/max plus a Welford
//! running mean and variance. `stop()` is idempotent and waits for the
//! worker to drain.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Running count/min/max/Welford accumulator for RTT samples in
/// milliseconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct RttStats {
    pub count: u64,
    pub min_ms: f64,
    pub max_ms: f64,
    mean: f64,
    m2: f64,
    pub errors: u64,
}

impl RttStats {
    fn record(&mut self, sample_ms: f64) {
        if self.count == 0 {
            self.min_ms = sample_ms;
            self.max_ms = sample_ms;
        } else {
            self.min_ms = self.min_ms.min(sample_ms);
            self.max_ms = self.max_ms.max(sample_ms);
        }
        self.count += 1;
        let delta = sample_ms - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = sample_ms - self.mean;
        self.m2 += delta * delta2;
    }

    pub fn mean_ms(&self) -> f64 {
        self.mean
    }

    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    pub fn stddev_ms(&self) -> f64 {
        self.variance().sqrt()
    }
}

/// Background RTT sampler. Create with [`RttSampler::start`], read the
/// running stats with [`RttSampler::stats`], stop with [`RttSampler::stop`].
pub struct RttSampler {
    stats: Arc<Mutex<RttStats>>,
    stopped: Arc<AtomicBool>,
    handle: StdMutex<Option<JoinHandle<()>>>,
}

impl RttSampler {
    /// Spawn the single background worker. `ping` is called once per tick
    /// and must resolve to `Ok(rtt)` or `Err(())` on failure/timeout.
    pub fn start<F, Fut>(rate_per_sec: f64, mut ping: F) -> Arc<Self>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<Duration, ()>> + Send,
    {
        let period = if rate_per_sec <= 0.0 {
            Duration::from_secs(1)
        } else {
            Duration::from_secs_f64(1.0 / rate_per_sec)
        };
        let stats = Arc::new(Mutex::new(RttStats::default()));
        let stopped = Arc::new(AtomicBool::new(false));
        let worker_stopped = stopped.clone();
        let worker_stats = stats.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if worker_stopped.load(Ordering::SeqCst) {
                    break;
                }
                match ping().await {
                    Ok(rtt) => {
                        let mut s = worker_stats.lock().await;
                        s.record(rtt.as_secs_f64() * 1000.0);
                    }
                    Err(()) => {
                        let mut s = worker_stats.lock().await;
                        s.errors += 1;
                    }
                }
            }
        });

        Arc::new(Self {
            stats,
            stopped,
            handle: StdMutex::new(Some(handle)),
        })
    }

    pub async fn stats(&self) -> RttStats {
        *self.stats.lock().await
    }

    /// Idempotent stop: the first caller waits for the worker to exit;
    /// subsequent callers are a no-op.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn welford_mean_and_variance() {
        let mut stats = RttStats::default();
        for v in [10.0, 20.0, 30.0] {
            stats.record(v);
        }
        assert!((stats.mean_ms() - 20.0).abs() < 1e-9);
        assert_eq!(stats.min_ms, 10.0);
        assert_eq!(stats.max_ms, 30.0);
        assert!((stats.variance() - 100.0).abs() < 1e-9);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sampler_accumulates_and_stops_idempotently() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let sampler = RttSampler::start(50.0, move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(Duration::from_millis(5))
            }
        });
        tokio::time::sleep(Duration::from_millis(120)).await;
        sampler.stop().await;
        sampler.stop().await; // idempotent, must not hang or panic
        let stats = sampler.stats().await;
        assert!(stats.count >= 3, "expected several ticks, got {}", stats.count);
    }
}
