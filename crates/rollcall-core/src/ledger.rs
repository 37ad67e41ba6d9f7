//! Per-identity cooldown ledger.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Last emission time for each identity that has produced a Sent outcome.
///
/// Entries are created on the first emission and overwritten afterwards,
/// never removed. A missing entry means the identity has never been emitted.
#[derive(Debug, Default)]
pub struct DedupLedger {
    last_emitted: Mutex<HashMap<i64, DateTime<Utc>>>,
}

impl DedupLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if `identity_id` has never been emitted, or its last emission is
    /// at least `cooldown` before `now`.
    ///
    /// A `now` earlier than the last emission (clock step backwards) counts
    /// as inside the cooldown.
    pub fn should_emit(&self, identity_id: i64, now: DateTime<Utc>, cooldown: Duration) -> bool {
        let map = self.last_emitted.lock().unwrap_or_else(PoisonError::into_inner);
        cooldown_elapsed(map.get(&identity_id), now, cooldown)
    }

    /// Record an emission, overwriting any previous timestamp.
    pub fn record_emission(&self, identity_id: i64, now: DateTime<Utc>) {
        self.last_emitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(identity_id, now);
    }

    /// Check-and-record under a single lock.
    ///
    /// Two concurrent callers for the same identity can never both get `true`
    /// within one cooldown window.
    pub fn try_emit(&self, identity_id: i64, now: DateTime<Utc>, cooldown: Duration) -> bool {
        let mut map = self.last_emitted.lock().unwrap_or_else(PoisonError::into_inner);
        if cooldown_elapsed(map.get(&identity_id), now, cooldown) {
            map.insert(identity_id, now);
            true
        } else {
            false
        }
    }

    pub fn last_emitted(&self, identity_id: i64) -> Option<DateTime<Utc>> {
        self.last_emitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&identity_id)
            .copied()
    }

    /// Number of identities emitted at least once.
    pub fn len(&self) -> usize {
        self.last_emitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn cooldown_elapsed(last: Option<&DateTime<Utc>>, now: DateTime<Utc>, cooldown: Duration) -> bool {
    match last {
        None => true,
        Some(last) => {
            let elapsed = now.signed_duration_since(*last);
            elapsed >= Duration::zero() && elapsed >= cooldown
        }
    }
}
