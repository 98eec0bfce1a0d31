// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Exponential backoff with a cap, and the retry budget.
//!
//! The delay before the next attempt from a state is
//! `min(base_delay * 2^state_count, max_delay)`, measured from the entity's
//! `state_timestamp`. With the defaults (1s base, 60s cap) attempt counts
//! 0..=6 give delays of 1, 2, 4, 8, 16, 32 and 60 seconds.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::entity::StatefulEntity;
use crate::lease::expiry_after;

/// Default retry budget per state.
pub const DEFAULT_MAX_RETRIES: u32 = 7;
/// Default delay before the first attempt.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
/// Default upper bound on the delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Backoff and retry budget for one entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed from one state before the entity fails.
    pub max_retries: u32,
    /// Delay for `state_count == 0`.
    pub base_delay: Duration,
    /// Cap on the delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Create a policy.
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// `min(base_delay * 2^state_count, max_delay)`, saturating on overflow.
    pub fn delay_for(&self, state_count: u32) -> Duration {
        2u32.checked_pow(state_count)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Earliest instant at which the entity may be processed again.
    pub fn next_due_at<S, P>(&self, entity: &StatefulEntity<S, P>) -> DateTime<Utc> {
        expiry_after(entity.state_timestamp, self.delay_for(entity.state_count))
    }

    /// `now >= state_timestamp + delay_for(state_count)`.
    pub fn is_due<S, P>(&self, entity: &StatefulEntity<S, P>, now: DateTime<Utc>) -> bool {
        now >= self.next_due_at(entity)
    }

    /// `state_count > max_retries`.
    pub fn is_exhausted<S, P>(&self, entity: &StatefulEntity<S, P>) -> bool {
        entity.state_count > self.max_retries
    }

    /// The due predicate at `now` as per-`state_count` timestamp cutoffs, so
    /// SQL stores can select exactly the due rows.
    pub fn due_filter(&self, now: DateTime<Utc>) -> DueFilter {
        let mut cutoffs = Vec::new();
        if self.base_delay.is_zero() {
            return DueFilter {
                cutoffs,
                fallback: now,
            };
        }

        let mut count = 0u32;
        loop {
            let delay = self.delay_for(count);
            if delay >= self.max_delay || count >= 64 {
                return DueFilter {
                    cutoffs,
                    fallback: instant_before(now, delay),
                };
            }
            cutoffs.push(instant_before(now, delay));
            count += 1;
        }
    }
}

/// Due predicate resolved against one instant.
///
/// An entity with `state_count == n` is due iff its `state_timestamp` is at or
/// before `cutoff_for(n)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueFilter {
    /// Cutoff per `state_count`, starting at 0.
    pub cutoffs: Vec<DateTime<Utc>>,
    /// Cutoff for every count beyond `cutoffs`.
    pub fallback: DateTime<Utc>,
}

impl DueFilter {
    /// Latest `state_timestamp` that is due for `state_count`.
    pub fn cutoff_for(&self, state_count: u32) -> DateTime<Utc> {
        usize::try_from(state_count)
            .ok()
            .and_then(|i| self.cutoffs.get(i))
            .copied()
            .unwrap_or(self.fallback)
    }

    /// Whether an entity with these bookkeeping values is due.
    pub fn admits(&self, state_count: u32, state_timestamp: DateTime<Utc>) -> bool {
        state_timestamp <= self.cutoff_for(state_count)
    }
}

fn instant_before(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
