use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

const DEFAULT_WINDOW: Duration = Duration::from_secs(30);
const DEFAULT_MAX_SAMPLES: usize = 256;

struct Sample {
    bytes: u64,
    at: Instant,
}

/// Upload throughput over a sliding window of completed parts.
///
/// Rates are measured from the meter's start instant, so a single finished
/// part already yields a meaningful value.
pub struct ThroughputMeter {
    inner: Mutex<MeterInner>,
}

struct MeterInner {
    started_at: Instant,
    samples: Vec<Sample>,
    window: Duration,
    max_samples: usize,
}

impl ThroughputMeter {
    /// Creates a meter. Defaults: 30 s window, 256 samples.
    pub fn new(window: Option<Duration>, max_samples: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(MeterInner {
                started_at: Instant::now(),
                samples: Vec::new(),
                window: window.unwrap_or(DEFAULT_WINDOW),
                max_samples: max_samples.unwrap_or(DEFAULT_MAX_SAMPLES),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MeterInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records `bytes` confirmed by the store just now.
    pub fn record(&self, bytes: u64) {
        let mut m = self.lock();
        let now = Instant::now();
        m.samples.push(Sample { bytes, at: now });

        if let Some(cutoff) = now.checked_sub(m.window) {
            m.samples.retain(|s| s.at >= cutoff);
        }
        if m.samples.len() > m.max_samples {
            let excess = m.samples.len() - m.max_samples;
            m.samples.drain(..excess);
        }
    }

    /// Average rate in bytes/second over the retained samples.
    pub fn bytes_per_second(&self) -> f64 {
        let m = self.lock();
        let Some(last) = m.samples.last() else {
            return 0.0;
        };
        // Measure from the start of the window, or from the meter start if
        // the window has not filled yet.
        let window_start = last
            .at
            .checked_sub(m.window)
            .map_or(m.started_at, |cutoff| cutoff.max(m.started_at));
        let elapsed = last.at.duration_since(window_start);
        if elapsed.is_zero() {
            return 0.0;
        }
        let total: u64 = m.samples.iter().map(|s| s.bytes).sum();
        total as f64 / elapsed.as_secs_f64()
    }

    /// Estimated time to push `remaining` more bytes, `None` without data.
    pub fn eta(&self, remaining: u64) -> Option<Duration> {
        let rate = self.bytes_per_second();
        if rate <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining as f64 / rate))
    }
}

impl Default for ThroughputMeter {
    fn default() -> Self {
        Self::new(None, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_meter_has_no_rate() {
        let meter = ThroughputMeter::default();
        assert_eq!(meter.bytes_per_second(), 0.0);
        assert!(meter.eta(1000).is_none());
    }

    #[test]
    fn single_part_yields_rate() {
        let meter = ThroughputMeter::default();
        std::thread::sleep(Duration::from_millis(20));
        meter.record(1_000);
        assert!(meter.bytes_per_second() > 0.0);
        assert!(meter.eta(10_000).unwrap() > Duration::ZERO);
    }

    #[test]
    fn sample_count_is_capped() {
        let meter = ThroughputMeter::new(Some(Duration::from_secs(60)), Some(4));
        for i in 0..20 {
            meter.record(i);
        }
        assert!(meter.lock().samples.len() <= 4);
    }

    #[test]
    fn concurrent_recording() {
        use std::sync::Arc;
        use std::thread;

        let meter = Arc::new(ThroughputMeter::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = Arc::clone(&meter);
                thread::spawn(move || {
                    for _ in 0..50 {
                        m.record(1);
                        let _ = m.bytes_per_second();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        // 8 × 50 samples, capped at the default 256.
        assert_eq!(meter.lock().samples.len(), DEFAULT_MAX_SAMPLES);
    }
}
