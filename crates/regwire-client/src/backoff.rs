//! Per-host exponential backoff with a shared budget.
//!
//! Backoff state is shared across every request to a host: one caller's
//! failures delay everybody until the host recovers. A success is only a
//! partial recovery — the counter steps down by one rather than resetting,
//! so a long history of transient failures is not erased by a single
//! completed transfer.

use regwire_core::{Error, Result};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, Default)]
struct BackoffState {
    cur: u32,
    until: Option<Instant>,
}

/// Exponential backoff controller for a single host.
#[derive(Debug)]
pub struct Backoff {
    host: String,
    delay_init: Duration,
    delay_max: Duration,
    retry_limit: u32,
    state: Mutex<BackoffState>,
}

impl Backoff {
    /// Create a controller for `host` with the client's shared budget.
    #[must_use]
    pub fn new(
        host: impl Into<String>,
        delay_init: Duration,
        delay_max: Duration,
        retry_limit: u32,
    ) -> Self {
        Self {
            host: host.into(),
            delay_init,
            delay_max,
            retry_limit,
            state: Mutex::new(BackoffState::default()),
        }
    }

    /// Record a failure and open a new backoff window.
    ///
    /// The window is `min(delay_init << counter, delay_max)`; a
    /// `Retry-After` duration from the failing response raises the floor:
    /// `min(max(window, retry_after), delay_max)`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BackoffLimit`] once the counter reaches the retry
    /// limit, signaling the host should be dropped from rotation.
    pub fn set(&self, retry_after: Option<Duration>) -> Result<()> {
        let mut state = self.state.lock().expect("backoff mutex poisoned");
        state.cur += 1;

        let factor = 1u32.checked_shl(state.cur).unwrap_or(u32::MAX);
        let mut sleep = self.delay_init.saturating_mul(factor).min(self.delay_max);
        if let Some(ra) = retry_after {
            sleep = sleep.max(ra).min(self.delay_max);
        }
        state.until = Some(Instant::now() + sleep);

        if state.cur >= self.retry_limit {
            return Err(Error::BackoffLimit(self.host.clone()));
        }
        Ok(())
    }

    /// Record a success: step the counter down by one.
    ///
    /// The window is cleared only when the counter reaches zero.
    pub fn clear(&self) {
        let mut state = self.state.lock().expect("backoff mutex poisoned");
        if state.cur > self.retry_limit {
            state.cur = self.retry_limit;
        }
        if state.cur > 0 {
            state.cur -= 1;
        }
        if state.cur == 0 {
            state.until = None;
        }
    }

    /// The instant before which no attempt should be made, if any.
    #[must_use]
    pub fn until(&self) -> Option<Instant> {
        self.state.lock().expect("backoff mutex poisoned").until
    }

    /// Current failure counter.
    #[must_use]
    pub fn current(&self) -> u32 {
        self.state.lock().expect("backoff mutex poisoned").cur
    }

    /// Sleep out the remaining backoff window, if one is open.
    pub async fn wait(&self) {
        let until = self.until();
        if let Some(until) = until {
            if until > Instant::now() {
                tokio::time::sleep_until(until).await;
            }
        }
    }
}
