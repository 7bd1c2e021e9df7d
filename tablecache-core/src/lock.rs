//! Table lock record stored in the cache.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Value stored under a table lock key.
///
/// The token identifies the holder; release only succeeds while the stored
/// token is still the holder's own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub lock_name: String,
    pub token: Uuid,
    pub acquired_at: DateTime<Utc>,
    /// Taken by overwriting a holder that did not release in time.
    pub forced: bool,
}

impl LockRecord {
    /// A fresh record with a time-ordered token.
    pub fn new(lock_name: impl Into<String>) -> Self {
        Self {
            lock_name: lock_name.into(),
            token: Uuid::now_v7(),
            acquired_at: Utc::now(),
            forced: false,
        }
    }

    /// Same holder, marked as a forced takeover.
    pub fn forced(mut self) -> Self {
        self.forced = true;
        self
    }

    pub fn is_held_by(&self, token: Uuid) -> bool {
        self.token == token
    }
}
