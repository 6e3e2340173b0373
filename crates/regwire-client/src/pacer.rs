//! Per-host minimum inter-request spacing.
//!
//! A configured requests-per-second rate becomes a fixed period between
//! sends. Under sustained load the pacer produces a steady cadence by
//! advancing the next-allowed instant one period at a time; after an idle
//! stretch the cadence restarts from now.
//!
//! The slot mutex is held across the sleep — that is what serializes sends
//! into the cadence. Periods are bounded by `1s / req_per_sec`, so the
//! pacer does not watch for cancellation itself; dropping the future
//! abandons the wait.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Request pacer for a single host.
#[derive(Debug)]
pub struct RatePacer {
    period: Option<Duration>,
    next: Mutex<Option<Instant>>,
}

impl RatePacer {
    /// Create a pacer from a requests-per-second rate; zero or negative
    /// disables pacing.
    #[must_use]
    pub fn new(req_per_sec: f64) -> Self {
        let period = (req_per_sec > 0.0).then(|| Duration::from_secs_f64(1.0 / req_per_sec));
        Self {
            period,
            next: Mutex::new(None),
        }
    }

    /// True when a rate was configured.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.period.is_some()
    }

    /// Wait for this request's turn in the cadence.
    pub async fn pace(&self) {
        let Some(period) = self.period else {
            return;
        };
        let mut next = self.next.lock().await;
        let now = Instant::now();
        match *next {
            Some(at) if now < at => {
                tokio::time::sleep_until(at).await;
                *next = Some(at + period);
            }
            _ => *next = Some(now + period),
        }
    }
}
