//! Timer primitives for the controller loop.
//!
//! Both types are driven from `tokio::select!`: their wait futures are
//! cancel-safe and stay pending forever while disarmed.

use std::time::Duration;
use tokio::time::{sleep_until, Instant};

/// Fixed-interval tick source that can be armed and disarmed.
pub(crate) struct PollScheduler {
    interval: Duration,
    next_tick: Option<Instant>,
}

impl PollScheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_tick: None,
        }
    }

    /// Arm the first tick one interval from now. Returns false if already armed,
    /// leaving the running cadence alone.
    pub fn arm(&mut self) -> bool {
        if self.next_tick.is_some() {
            return false;
        }
        self.next_tick = Some(Instant::now() + self.interval);
        true
    }

    pub fn disarm(&mut self) -> bool {
        self.next_tick.take().is_some()
    }

    /// Wait for the next tick and schedule the one after it.
    pub async fn tick(&mut self) {
        match self.next_tick {
            Some(at) => {
                sleep_until(at).await;
                self.next_tick = Some(Instant::now() + self.interval);
            }
            None => futures::future::pending().await,
        }
    }
}

/// One-shot deadline, used for the starting-phase grace period.
#[derive(Default)]
pub(crate) struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    pub fn set(&mut self, after: Duration) {
        self.at = Some(Instant::now() + after);
    }

    pub fn clear(&mut self) {
        self.at = None;
    }

    pub async fn elapsed(&mut self) {
        match self.at {
            Some(at) => {
                sleep_until(at).await;
                self.at = None;
            }
            None => futures::future::pending().await,
        }
    }
}
