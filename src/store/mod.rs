//! Persistence Seam
//!
//! Race documents and user statistics are mirrored to a store behind
//! this trait. The in-memory room state stays authoritative for live
//! gameplay; the store is written on the hot path (fire-and-forget)
//! and read only at room creation (code collision checks) and by the
//! REST surface.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::race::model::{Race, UserId};

/// Store-level errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Backend rejected or could not complete the operation.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Aggregate race statistics kept per user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStats {
    /// Races completed.
    pub total_races: u32,
    /// Races finished in first position.
    pub races_won: u32,
}

/// Trait for race persistence backends.
#[async_trait]
pub trait RaceStore: Send + Sync {
    /// Durably record a newly created race document.
    async fn insert_race(&self, race: &Race) -> Result<(), StoreError>;

    /// Overwrite the stored document for a race.
    async fn update_race(&self, race: &Race) -> Result<(), StoreError>;

    /// Fetch a race by room code (case-insensitive).
    async fn find_race(&self, room_code: &str) -> Result<Option<Race>, StoreError>;

    /// A user's most recent finished races, newest first.
    async fn race_history(&self, user_id: &UserId, limit: usize) -> Result<Vec<Race>, StoreError>;

    /// Bump a user's races-played (and races-won) counters.
    async fn record_race_result(&self, user_id: &UserId, won: bool) -> Result<(), StoreError>;

    /// Read back a user's counters.
    async fn user_stats(&self, user_id: &UserId) -> Result<UserStats, StoreError>;
}
