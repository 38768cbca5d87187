//! Per-sample throughput statistics derived from a [`SampleMetricRecord`]'s
//! interval buckets: trimmed mean, rolling 1s peak, and ceil-indexed
//! percentiles.

use common::model::IntervalBucket;

/// Drop the top and bottom 10% of interval bps values and average the rest.
pub fn trimmed_mean(bps_values: &[f64]) -> f64 {
    if bps_values.is_empty() {
        return 0.0;
    }
    let mut sorted = bps_values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let n = sorted.len();
    let trim = (n as f64 * 0.1).floor() as usize;
    let hi = n.saturating_sub(trim);
    if trim >= hi {
        return sorted.iter().sum::<f64>() / n as f64;
    }
    let slice = &sorted[trim..hi];
    slice.iter().sum::<f64>() / slice.len() as f64
}

/// Percentile with ceil indexing: `idx = ceil(p/100 * n)`, 1-based, clamped
/// into range.
pub fn percentile_ceil(bps_values: &[f64], p: f64) -> f64 {
    if bps_values.is_empty() {
        return 0.0;
    }
    let mut sorted = bps_values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let n = sorted.len();
    let idx = ((p / 100.0) * n as f64).ceil() as usize;
    let idx = idx.clamp(1, n) - 1;
    sorted[idx]
}

/// Max bits-per-second over any rolling window of consecutive intervals
/// whose combined duration is at least 1.0s.
pub fn peak_1s(intervals: &[IntervalBucket]) -> f64 {
    let mut best = 0.0f64;
    for start in 0..intervals.len() {
        let mut bytes = 0u64;
        let mut dur_ms = 0u64;
        for bucket in &intervals[start..] {
            bytes += bucket.bytes;
            dur_ms += bucket.duration_ms;
            if dur_ms as f64 >= 1000.0 {
                let bps = (bytes as f64 * 8.0) / (dur_ms as f64 / 1000.0);
                if bps > best {
                    best = bps;
                }
                break;
            }
        }
    }
    best
}

/// bits-per-second for every interval bucket, skipping zero-duration ones.
pub fn interval_bps_series(intervals: &[IntervalBucket]) -> Vec<f64> {
    intervals
        .iter()
        .filter(|b| b.duration_ms > 0)
        .map(|b| b.bps())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trimmed_mean_drops_extremes() {
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0];
        let mean = trimmed_mean(&values);
        // drop 1 from each end (10% of 10 = 1): remaining 2..9 -> mean 5.5
        assert!((mean - 5.5).abs() < 1e-9);
    }

    #[test]
    fn percentile_ceil_matches_hand_computed_example() {
        let values = vec![10.0, 20.0, 30.0, 40.0, 50.0];
        // p90 of 5 values: ceil(0.9*5)=5 -> index 4 (0-based) -> 50.0
        assert_eq!(percentile_ceil(&values, 90.0), 50.0);
        // p80: ceil(0.8*5)=4 -> index 3 -> 40.0
        assert_eq!(percentile_ceil(&values, 80.0), 40.0);
    }

    #[test]
    fn peak_1s_finds_best_rolling_window() {
        let intervals = vec![
            IntervalBucket { bytes: 1000, duration_ms: 100, ooo_count: 0 },
            IntervalBucket { bytes: 1000, duration_ms: 100, ooo_count: 0 },
            IntervalBucket { bytes: 100_000, duration_ms: 100, ooo_count: 0 },
            IntervalBucket { bytes: 100_000, duration_ms: 100, ooo_count: 0 },
            IntervalBucket { bytes: 100_000, duration_ms: 100, ooo_count: 0 },
            IntervalBucket { bytes: 100_000, duration_ms: 100, ooo_count: 0 },
            IntervalBucket { bytes: 100_000, duration_ms: 100, ooo_count: 0 },
            IntervalBucket { bytes: 100_000, duration_ms: 100, ooo_count: 0 },
            IntervalBucket { bytes: 100_000, duration_ms: 100, ooo_count: 0 },
            IntervalBucket { bytes: 100_000, duration_ms: 100, ooo_count: 0 },
        ];
        let peak = peak_1s(&intervals);
        assert!(peak > 0.0);
    }
}
