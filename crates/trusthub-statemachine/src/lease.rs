// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Leases: time-bounded ownership claims stored on the entity row itself.
//!
//! There is no lock service. A lease is the pair `(lease_holder, lease_expiry)`
//! on the entity, and every store acquires it with one conditional update:
//!
//! ```text
//! UPDATE <table>
//!    SET lease_holder = :holder, lease_expiry = :now + :duration, version = version + 1
//!  WHERE id = :id
//!    AND (lease_holder IS NULL OR lease_expiry <= :now)
//! ```
//!
//! A lease is live while `lease_expiry > now` and free otherwise, so a crashed
//! worker's lease simply lapses and the entity is picked up by another instance.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::entity::StatefulEntity;

/// Ownership claim on one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Worker instance owning the entity.
    pub holder: String,
    /// Instant after which the lease is free.
    pub expiry: DateTime<Utc>,
}

impl Lease {
    /// A lease for `holder` valid for `duration` from `now`.
    pub fn new(holder: impl Into<String>, now: DateTime<Utc>, duration: Duration) -> Self {
        Self {
            holder: holder.into(),
            expiry: expiry_after(now, duration),
        }
    }

    /// Whether the lease still excludes other holders at `now`.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expiry > now
    }

    /// Extend the lease to `now + duration`. Only the current holder may renew.
    pub fn renew(&mut self, holder: &str, now: DateTime<Utc>, duration: Duration) -> bool {
        if self.holder != holder {
            return false;
        }
        self.expiry = expiry_after(now, duration);
        true
    }
}

/// Whether `holder` is the recorded lease holder of the entity.
pub fn is_leased_by<S, P>(entity: &StatefulEntity<S, P>, holder: &str) -> bool {
    entity.lease.as_ref().is_some_and(|l| l.holder == holder)
}

/// Whether the entity carries a lease that has lapsed at `now`.
pub fn is_expired<S, P>(entity: &StatefulEntity<S, P>, now: DateTime<Utc>) -> bool {
    entity.lease.as_ref().is_some_and(|l| !l.is_live(now))
}

/// The acquisition predicate: no lease, or an expired one.
pub fn is_free<S, P>(entity: &StatefulEntity<S, P>, now: DateTime<Utc>) -> bool {
    entity.lease.as_ref().is_none_or(|l| !l.is_live(now))
}

/// `now + duration`, saturating at the far future.
pub(crate) fn expiry_after(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
