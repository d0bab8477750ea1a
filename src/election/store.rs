use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::lease::lease_expired;
use crate::error::Result;

/// One row of the `leader_election` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionRecord {
    pub key: String,
    /// Empty when nobody holds the election.
    pub leader: String,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    /// Rewritten by every applied compare-and-swap. `None` until the first one.
    pub modified_at: Option<DateTime<Utc>>,
}

impl ElectionRecord {
    pub fn view(&self, now: DateTime<Utc>, lease: Duration) -> ElectionView {
        ElectionView {
            key: self.key.clone(),
            leader: self.leader.clone(),
            created_at: self.created_at,
            modified_at: self.modified_at,
            valid: !lease_expired(self.modified_at, now, lease),
        }
    }
}

/// An election record as seen by an observer, with lease validity derived at read time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionView {
    pub key: String,
    pub leader: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: Option<DateTime<Utc>>,
    pub valid: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseStatus {
    pub leader: String,
    /// Version read in the same query as `leader`.
    pub version: i64,
    pub expired: bool,
}

/// Persistence contract the election state machine runs against.
///
/// `compare_and_swap` must be linearizable with every other
/// `compare_and_swap` on the same key; nothing else in the election logic
/// arbitrates between peers.
pub trait ElectionStore: Send + Sync {
    /// Ensures a record exists with an empty leader and version 0.
    /// Creating an existing key leaves it untouched.
    fn create_election(&self, key: &str) -> Result<()>;

    fn get_version(&self, key: &str) -> Result<i64>;

    /// Sets `leader` and `version = new_version` only if the stored version
    /// equals `expected_version`, refreshing the heartbeat timestamp.
    ///
    /// Returns `Ok(false)` when the precondition fails.
    fn compare_and_swap(
        &self,
        key: &str,
        expected_version: i64,
        new_version: i64,
        leader: &str,
    ) -> Result<bool>;

    fn check_lease_expired(&self, key: &str, lease: Duration) -> Result<LeaseStatus>;

    fn list_elections(&self, lease: Duration) -> Result<Vec<ElectionView>>;
}
