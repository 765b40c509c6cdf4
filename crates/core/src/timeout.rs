//! Timeout Guard
//!
//! A cancellable, single-shot deadline owned by the session task. The guard
//! does not spawn anything: the owner awaits [`TimeoutGuard::fired`] inside its
//! event loop, so a disarmed guard can never deliver its value late.

use std::{future, pin::Pin, time::Duration};
use tokio::time::{Sleep, sleep};
use tracing::debug;

struct Armed<T> {
    deadline: Pin<Box<Sleep>>,
    on_fire: T,
}

/// Yields `on_fire` once the armed duration has elapsed.
pub struct TimeoutGuard<T> {
    armed: Option<Armed<T>>,
}

impl<T> Default for TimeoutGuard<T> {
    fn default() -> Self {
        Self { armed: None }
    }
}

impl<T> TimeoutGuard<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the countdown. An already armed timer is discarded first.
    pub fn arm(&mut self, duration: Duration, on_fire: T) {
        if self.armed.is_some() {
            debug!("Re-arming timeout guard; previous deadline discarded.");
        }
        self.armed = Some(Armed {
            deadline: Box::pin(sleep(duration)),
            on_fire,
        });
    }

    /// Cancels the countdown. Returns whether a timer was pending.
    pub fn disarm(&mut self) -> bool {
        self.armed.take().is_some()
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    /// Resolves when the armed deadline passes; pending forever otherwise.
    ///
    /// Cancel-safe: dropping the future keeps the deadline, so it can be
    /// polled again from the next iteration of a `select!` loop.
    pub async fn fired(&mut self) -> T {
        if let Some(armed) = self.armed.as_mut() {
            armed.deadline.as_mut().await;
        }
        match self.armed.take() {
            Some(armed) => armed.on_fire,
            None => future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{Instant, timeout};

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_duration() {
        let mut guard = TimeoutGuard::new();
        let started = Instant::now();
        guard.arm(Duration::from_secs(15), "timeout");

        assert_eq!(guard.fired().await, "timeout");
        assert!(started.elapsed() >= Duration::from_secs(15));
        assert!(!guard.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarmed_guard_never_fires() {
        let mut guard = TimeoutGuard::new();
        guard.arm(Duration::from_secs(1), ());
        assert!(guard.disarm());
        assert!(!guard.disarm());

        let waited = timeout(Duration::from_secs(60), guard.fired()).await;
        assert!(waited.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_replaces_previous_timer() {
        let mut guard = TimeoutGuard::new();
        let started = Instant::now();
        guard.arm(Duration::from_secs(1), 1);
        guard.arm(Duration::from_secs(5), 2);

        assert_eq!(guard.fired().await, 2);
        assert!(started.elapsed() >= Duration::from_secs(5));

        let again = timeout(Duration::from_secs(60), guard.fired()).await;
        assert!(again.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_wait_keeps_deadline() {
        let mut guard = TimeoutGuard::new();
        guard.arm(Duration::from_secs(10), "late");

        let early = timeout(Duration::from_secs(3), guard.fired()).await;
        assert!(early.is_err());
        assert!(guard.is_armed());

        assert_eq!(guard.fired().await, "late");
    }
}
