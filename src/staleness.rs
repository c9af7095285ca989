use std::time::Duration;
use tokio::time::Instant;

/// Default stale-data window
pub const DEFAULT_STALE_WINDOW: Duration = Duration::from_millis(3_000);

/// Single-shot watchdog that declares cadence stale after a quiet window
///
/// The monitor holds at most one deadline. [`arm`](Self::arm) replaces it,
/// [`check`](Self::check) consumes it once it has passed, so each quiet
/// period produces exactly one expiry until the monitor is armed again.
#[derive(Debug, Clone)]
pub struct StalenessMonitor {
    window: Duration,
    deadline: Option<Instant>,
}

impl Default for StalenessMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_STALE_WINDOW)
    }
}

impl StalenessMonitor {
    /// Create a disarmed monitor with the given window
    #[must_use]
    pub const fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: None,
        }
    }

    /// Quiet window after which data is considered stale
    #[must_use]
    pub const fn window(&self) -> Duration {
        self.window
    }

    /// Pending deadline, if armed
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether a deadline is pending
    #[must_use]
    pub const fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// (Re)schedule the deadline `window` after `now`
    pub fn arm(&mut self, now: Instant) -> Instant {
        let deadline = now + self.window;
        self.deadline = Some(deadline);
        deadline
    }

    /// Drop any pending deadline
    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    /// Returns `true` exactly once when `now` has reached the pending deadline
    pub fn check(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

/// Sleep until `deadline`, or forever if there is none
pub(crate) async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
