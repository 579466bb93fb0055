// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::time::{Duration, Instant};

/// Tracks the time budget of a single operation
///
/// Every call into the segment container, and every wait on the index,
/// receives whatever is left of the budget.
#[derive(Clone, Debug)]
pub struct TimeoutTimer {
    deadline: Instant,
}

impl TimeoutTimer {
    /// Starts a timer that expires after `timeout`.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        let now = Instant::now();

        // NOTE: Effectively unbounded budgets (e.g. Duration::MAX) would overflow Instant
        let deadline = now
            .checked_add(timeout)
            .unwrap_or_else(|| now + Duration::from_secs(60 * 60 * 24 * 365));

        Self { deadline }
    }

    /// Returns the remaining budget, which may be zero.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Returns the remaining budget, failing with [`crate::Error::Timeout`] if it is used up.
    ///
    /// # Errors
    ///
    /// Returns `Err` if no time is left.
    pub fn try_remaining(&self) -> crate::Result<Duration> {
        let remaining = self.remaining();

        if remaining.is_zero() {
            Err(crate::Error::Timeout)
        } else {
            Ok(remaining)
        }
    }
}
