//! In-memory reference store.
//!
//! Backs tests and single-process deployments. Swappable for a real
//! database backend through the [`RaceStore`] trait.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{RaceStore, StoreError, UserStats};
use crate::race::model::{Race, RaceStatus, UserId};

/// Process-local store keyed by room code.
pub struct MemoryStore {
    races: RwLock<HashMap<String, Race>>,
    stats: RwLock<HashMap<UserId, UserStats>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            races: RwLock::new(HashMap::new()),
            stats: RwLock::new(HashMap::new()),
        }
    }

    /// Number of stored race documents.
    pub async fn race_count(&self) -> usize {
        self.races.read().await.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RaceStore for MemoryStore {
    async fn insert_race(&self, race: &Race) -> Result<(), StoreError> {
        self.races
            .write()
            .await
            .insert(race.room_code.to_uppercase(), race.clone());
        Ok(())
    }

    async fn update_race(&self, race: &Race) -> Result<(), StoreError> {
        self.races
            .write()
            .await
            .insert(race.room_code.to_uppercase(), race.clone());
        Ok(())
    }

    async fn find_race(&self, room_code: &str) -> Result<Option<Race>, StoreError> {
        Ok(self.races.read().await.get(&room_code.to_uppercase()).cloned())
    }

    async fn race_history(&self, user_id: &UserId, limit: usize) -> Result<Vec<Race>, StoreError> {
        let races = self.races.read().await;
        let mut history: Vec<Race> = races
            .values()
            .filter(|r| r.status == RaceStatus::Finished && r.participant(user_id).is_some())
            .cloned()
            .collect();
        history.sort_by(|a, b| b.ended_at.cmp(&a.ended_at));
        history.truncate(limit);
        Ok(history)
    }

    async fn record_race_result(&self, user_id: &UserId, won: bool) -> Result<(), StoreError> {
        let mut stats = self.stats.write().await;
        let entry = stats.entry(*user_id).or_default();
        entry.total_races += 1;
        if won {
            entry.races_won += 1;
        }
        Ok(())
    }

    async fn user_stats(&self, user_id: &UserId) -> Result<UserStats, StoreError> {
        Ok(self
            .stats
            .read()
            .await
            .get(user_id)
            .copied()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::race::model::{RaceMode, UserIdentity};
    use chrono::{Duration, Utc};

    fn race(code: &str, host: &UserIdentity) -> Race {
        Race::new(code, host, RaceMode::Normal, "english", "one two three")
    }

    #[tokio::test]
    async fn test_insert_and_case_insensitive_find() {
        let store = MemoryStore::new();
        let host = UserIdentity::new(UserId::generate(), "alice");
        store.insert_race(&race("AB12CD", &host)).await.unwrap();

        let found = store.find_race("ab12cd").await.unwrap();
        assert!(found.is_some());
        assert_eq!(found.unwrap().room_code, "AB12CD");

        assert!(store.find_race("ZZZZZZ").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_overwrites() {
        let store = MemoryStore::new();
        let host = UserIdentity::new(UserId::generate(), "alice");
        let mut doc = race("AB12CD", &host);
        store.insert_race(&doc).await.unwrap();

        doc.status = RaceStatus::Finished;
        store.update_race(&doc).await.unwrap();

        let found = store.find_race("AB12CD").await.unwrap().unwrap();
        assert_eq!(found.status, RaceStatus::Finished);
    }

    #[tokio::test]
    async fn test_stats_accumulate() {
        let store = MemoryStore::new();
        let user = UserId::generate();

        store.record_race_result(&user, true).await.unwrap();
        store.record_race_result(&user, false).await.unwrap();

        let stats = store.user_stats(&user).await.unwrap();
        assert_eq!(stats.total_races, 2);
        assert_eq!(stats.races_won, 1);

        // Unknown users read back zeroes
        let stranger = store.user_stats(&UserId::generate()).await.unwrap();
        assert_eq!(stranger, UserStats::default());
    }

    #[tokio::test]
    async fn test_history_finished_only_newest_first() {
        let store = MemoryStore::new();
        let host = UserIdentity::new(UserId::generate(), "alice");

        let mut old = race("AAAAAA", &host);
        old.status = RaceStatus::Finished;
        old.ended_at = Some(Utc::now() - Duration::minutes(10));
        store.insert_race(&old).await.unwrap();

        let mut recent = race("BBBBBB", &host);
        recent.status = RaceStatus::Finished;
        recent.ended_at = Some(Utc::now());
        store.insert_race(&recent).await.unwrap();

        // Still-waiting races are excluded
        store.insert_race(&race("CCCCCC", &host)).await.unwrap();

        let history = store.race_history(&host.id, 20).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].room_code, "BBBBBB");
        assert_eq!(history[1].room_code, "AAAAAA");

        let limited = store.race_history(&host.id, 1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }
}
