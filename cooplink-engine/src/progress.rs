use std::time::Duration;

use tokio::time::Instant;

/// Weight of the newest throughput sample.
const SMOOTHING: f64 = 0.3;
/// Below this many bytes per second the transfer counts as stalled and no
/// ETA is given.
const MIN_RATE: f64 = 1.0;

/// Snapshot reported to subscribers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub bytes: u64,
    pub total: u64,
    /// 0–100, never decreases for a given task.
    pub percent: u8,
    /// Smoothed throughput in bytes per second.
    pub bytes_per_sec: f64,
    /// `None` while the rate is unknown or the transfer is stalled.
    pub eta: Option<Duration>,
}

/// Derives percent, throughput and ETA from periodic byte counts.
///
/// Call [`sample`](Self::sample) at the reporting cadence, not per chunk.
#[derive(Debug, Clone)]
pub struct ProgressMeter {
    total: u64,
    last_bytes: u64,
    last_at: Instant,
    rate: Option<f64>,
    percent: u8,
}

impl ProgressMeter {
    #[must_use]
    pub fn new(total: u64, now: Instant) -> Self {
        Self {
            total,
            last_bytes: 0,
            last_at: now,
            rate: None,
            percent: 0,
        }
    }

    #[allow(clippy::cast_precision_loss)] // byte counts well below 2^52 in practice
    pub fn sample(&mut self, bytes: u64, now: Instant) -> Progress {
        let elapsed = now.duration_since(self.last_at).as_secs_f64();
        if elapsed > 0.0 {
            let delta = bytes.saturating_sub(self.last_bytes) as f64;
            let instant_rate = delta / elapsed;
            self.rate = match self.rate {
                None if instant_rate > 0.0 => Some(instant_rate),
                None => None,
                Some(prev) => Some(SMOOTHING * instant_rate + (1.0 - SMOOTHING) * prev),
            };
            self.last_bytes = bytes;
            self.last_at = now;
        }

        self.percent = self.percent.max(percent_of(bytes, self.total));
        self.snapshot(bytes)
    }

    /// Final snapshot once every byte has been accounted for.
    pub fn complete(&mut self) -> Progress {
        self.percent = 100;
        let mut p = self.snapshot(self.total);
        p.eta = Some(Duration::ZERO);
        p
    }

    #[allow(clippy::cast_precision_loss)]
    fn snapshot(&self, bytes: u64) -> Progress {
        let remaining = self.total.saturating_sub(bytes) as f64;
        let eta = self
            .rate
            .filter(|r| *r >= MIN_RATE)
            .and_then(|r| Duration::try_from_secs_f64(remaining / r).ok());
        Progress {
            bytes,
            total: self.total,
            percent: self.percent,
            bytes_per_sec: self.rate.unwrap_or(0.0),
            eta,
        }
    }
}

#[allow(clippy::cast_possible_truncation)] // bytes is clamped to total, so the result is 0..=100
fn percent_of(bytes: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    (u128::from(bytes.min(total)) * 100 / u128::from(total)) as u8
}
