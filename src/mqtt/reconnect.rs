//! Reconnect bookkeeping for the client session.
//!
//! [`Backoff`] produces the delay sequence (doubling, capped, reset on success).
//! [`ReconnectGuard`] keeps at most one reconnect attempt in flight and drops
//! connection-lost notifications that arrive within the debounce window of the
//! last scheduled attempt.

use std::time::Duration;
use tokio::time::Instant;

/// Window in which repeated connection-lost notifications are ignored
pub const LOSS_DEBOUNCE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        let max = max.max(base);
        Self {
            base,
            max,
            current: base,
        }
    }

    /// Returns the delay for the next attempt and doubles the one after it.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    /// Delay the next scheduled attempt would use
    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

#[derive(Debug, Clone)]
pub struct ReconnectGuard {
    in_flight: bool,
    last_scheduled: Option<Instant>,
    debounce: Duration,
}

impl Default for ReconnectGuard {
    fn default() -> Self {
        Self::new(LOSS_DEBOUNCE)
    }
}

impl ReconnectGuard {
    pub fn new(debounce: Duration) -> Self {
        Self {
            in_flight: false,
            last_scheduled: None,
            debounce,
        }
    }

    /// Tries to claim the single reconnect slot.
    ///
    /// `from_loss` marks a connection-lost notification; only those are
    /// subject to the debounce window.
    pub fn try_schedule(&mut self, now: Instant, from_loss: bool) -> bool {
        if self.in_flight {
            return false;
        }

        if from_loss {
            if let Some(last) = self.last_scheduled {
                if now.saturating_duration_since(last) < self.debounce {
                    return false;
                }
            }
        }

        self.in_flight = true;
        self.last_scheduled = Some(now);
        true
    }

    /// Frees the slot once the scheduled attempt starts.
    pub fn release(&mut self) {
        self.in_flight = false;
    }

    /// Forgets the pending attempt and the debounce window, used once a new
    /// session is established so its own loss is never debounced.
    pub fn reset(&mut self) {
        self.in_flight = false;
        self.last_scheduled = None;
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }
}
