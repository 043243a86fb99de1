//! Cancellable, resettable one-shot deadline.
//!
//! A `Timer` never owns a task of its own. It only records *when* its action
//! is due; the owner (asset, playlist) polls it from the scheduler loop with
//! [`Timer::take_due`] and the loop sleeps on the earliest deadline with
//! [`wait_until`]. Because arming, cancelling and firing all happen through
//! `&mut self`, a cancelled timer can never fire and re-arming can never leave
//! a second, stale deadline behind.

use time::OffsetDateTime;
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Timer {
    deadline: Option<Instant>,
}

impl Timer {
    pub fn idle() -> Self {
        Self::default()
    }

    /// Arm for an absolute monotonic deadline, replacing any previous arm.
    pub fn arm_at(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    /// Arm `delay` after `base`. A deadline past the clock's range means
    /// "never" and leaves the timer idle.
    pub fn arm_after(&mut self, base: Instant, delay: Duration) {
        self.deadline = base.checked_add(delay);
    }

    /// Arm `delay` from now.
    pub fn arm_in(&mut self, delay: Duration) {
        self.arm_after(Instant::now(), delay);
    }

    /// Arm for a wall-clock instant. Instants already in the past fire on the
    /// next poll.
    pub fn arm_at_wall(&mut self, at: OffsetDateTime) {
        self.arm_in(until_wall(at));
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    /// Make the timer due immediately.
    pub fn fire_now(&mut self) {
        self.arm_at(Instant::now());
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the timer fires; zero when due, `None` when idle.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_due(&self, now: Instant) -> bool {
        matches!(self.deadline, Some(d) if d <= now)
    }

    /// Disarm and report `true` if the deadline has passed. Returns `true` at
    /// most once per arm.
    pub fn take_due(&mut self, now: Instant) -> bool {
        if self.is_due(now) {
            self.deadline = None;
            true
        } else {
            false
        }
    }
}

/// Delay from now until a wall-clock instant, zero if it already passed.
pub fn until_wall(at: OffsetDateTime) -> Duration {
    let delta = at - OffsetDateTime::now_utc();
    if delta.is_positive() {
        Duration::try_from(delta).unwrap_or(Duration::ZERO)
    } else {
        Duration::ZERO
    }
}

/// Sleep until `deadline`, or forever when there is none.
pub async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending::<()>().await,
    }
}

/// Earliest of two optional deadlines.
pub fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}
