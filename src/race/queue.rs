//! Matchmaking Queue
//!
//! Holds players waiting for a race. Entries leave the queue exactly
//! one way each: grouped into a room, expired into bot-fill, or
//! cancelled. The coordinator serializes all mutations behind a single
//! write lock, so an entry removed by grouping can never also be
//! expired by a later sweep.

use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};

use crate::network::protocol::ServerMessage;
use crate::race::model::{RaceMode, UserId, UserIdentity};

/// Queue errors surfaced to the issuing client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// The connection already has a queue entry.
    #[error("Already searching for a race")]
    AlreadyQueued,
}

/// A waiting player.
pub struct QueueEntry {
    /// Searching player.
    pub identity: UserIdentity,
    /// Requested content mode.
    pub mode: RaceMode,
    /// Connection handle for matchmaking notifications.
    pub sender: mpsc::Sender<ServerMessage>,
    /// When the entry was enqueued.
    pub queued_at: Instant,
}

/// FIFO matchmaking queue. Plain data; the coordinator owns the lock.
pub struct MatchmakingQueue {
    entries: Vec<QueueEntry>,
}

impl MatchmakingQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Append an entry. Fails if the same player is already queued.
    pub fn enqueue(
        &mut self,
        identity: UserIdentity,
        mode: RaceMode,
        sender: mpsc::Sender<ServerMessage>,
    ) -> Result<(), QueueError> {
        if self.contains(&identity.id) {
            return Err(QueueError::AlreadyQueued);
        }
        self.entries.push(QueueEntry {
            identity,
            mode,
            sender,
            queued_at: Instant::now(),
        });
        Ok(())
    }

    /// Remove a player's entry if present. No-op otherwise.
    pub fn cancel(&mut self, user_id: &UserId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.identity.id != *user_id);
        self.entries.len() != before
    }

    /// Whether a player is queued.
    pub fn contains(&self, user_id: &UserId) -> bool {
        self.entries.iter().any(|e| e.identity.id == *user_id)
    }

    /// Number of waiting entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove and return up to `max_group` of the oldest entries for
    /// `mode`, earliest enqueue first. Returns `None` without touching
    /// the queue when fewer than two entries share the mode.
    pub fn take_group(&mut self, mode: RaceMode, max_group: usize) -> Option<Vec<QueueEntry>> {
        let matching: Vec<usize> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.mode == mode)
            .map(|(i, _)| i)
            .collect();

        if matching.len() < 2 {
            return None;
        }

        let take = matching.len().min(max_group);
        let mut indices: Vec<usize> = matching[..take].to_vec();

        // Remove from the back so earlier indices stay valid
        indices.sort_by(|a, b| b.cmp(a));
        let mut group: Vec<QueueEntry> = indices
            .into_iter()
            .map(|i| self.entries.remove(i))
            .collect();
        group.reverse();

        Some(group)
    }

    /// Remove and return every entry queued longer than `timeout`.
    /// These are handed to bot-fill room creation.
    pub fn take_expired(&mut self, timeout: Duration) -> Vec<QueueEntry> {
        let now = Instant::now();
        let mut expired = Vec::new();
        let mut index = 0;
        while index < self.entries.len() {
            if now.duration_since(self.entries[index].queued_at) >= timeout {
                expired.push(self.entries.remove(index));
            } else {
                index += 1;
            }
        }
        expired
    }
}

impl Default for MatchmakingQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(name: &str) -> UserIdentity {
        UserIdentity::new(UserId::generate(), name)
    }

    fn sender() -> mpsc::Sender<ServerMessage> {
        mpsc::channel(8).0
    }

    #[tokio::test]
    async fn test_enqueue_and_duplicate() {
        let mut queue = MatchmakingQueue::new();
        let alice = identity("alice");

        queue.enqueue(alice.clone(), RaceMode::Normal, sender()).unwrap();
        assert_eq!(queue.len(), 1);

        let result = queue.enqueue(alice, RaceMode::Normal, sender());
        assert_eq!(result, Err(QueueError::AlreadyQueued));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_is_noop_when_absent() {
        let mut queue = MatchmakingQueue::new();
        let alice = identity("alice");

        assert!(!queue.cancel(&alice.id));

        queue.enqueue(alice.clone(), RaceMode::Normal, sender()).unwrap();
        assert!(queue.cancel(&alice.id));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_take_group_requires_two() {
        let mut queue = MatchmakingQueue::new();
        queue.enqueue(identity("alice"), RaceMode::Normal, sender()).unwrap();

        assert!(queue.take_group(RaceMode::Normal, 5).is_none());
        // Non-destructive when below threshold
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_take_group_fifo_and_mode_filter() {
        let mut queue = MatchmakingQueue::new();
        let alice = identity("alice");
        let bob = identity("bob");
        let carol = identity("carol");

        queue.enqueue(alice.clone(), RaceMode::Normal, sender()).unwrap();
        queue.enqueue(bob.clone(), RaceMode::Code, sender()).unwrap();
        queue.enqueue(carol.clone(), RaceMode::Normal, sender()).unwrap();

        let group = queue.take_group(RaceMode::Normal, 5).unwrap();
        assert_eq!(group.len(), 2);
        // Oldest first
        assert_eq!(group[0].identity.id, alice.id);
        assert_eq!(group[1].identity.id, carol.id);

        // The code-mode entry is untouched
        assert_eq!(queue.len(), 1);
        assert!(queue.contains(&bob.id));
    }

    #[tokio::test]
    async fn test_take_group_caps_at_max() {
        let mut queue = MatchmakingQueue::new();
        let ids: Vec<UserIdentity> = (0..7).map(|i| identity(&format!("p{i}"))).collect();
        for id in &ids {
            queue.enqueue(id.clone(), RaceMode::Normal, sender()).unwrap();
        }

        let group = queue.take_group(RaceMode::Normal, 5).unwrap();
        assert_eq!(group.len(), 5);
        for (entry, expected) in group.iter().zip(&ids[..5]) {
            assert_eq!(entry.identity.id, expected.id);
        }
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_expired_honors_timeout() {
        let mut queue = MatchmakingQueue::new();
        let alice = identity("alice");
        queue.enqueue(alice.clone(), RaceMode::Normal, sender()).unwrap();

        // Not yet expired
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(queue.take_expired(Duration::from_secs(10)).is_empty());
        assert_eq!(queue.len(), 1);

        queue.enqueue(identity("bob"), RaceMode::Normal, sender()).unwrap();

        // Only the older entry crosses the threshold
        tokio::time::advance(Duration::from_secs(6)).await;
        let expired = queue.take_expired(Duration::from_secs(10));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].identity.id, alice.id);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_grouped_entry_cannot_expire() {
        let mut queue = MatchmakingQueue::new();
        queue.enqueue(identity("alice"), RaceMode::Normal, sender()).unwrap();
        queue.enqueue(identity("bob"), RaceMode::Normal, sender()).unwrap();

        let group = queue.take_group(RaceMode::Normal, 5).unwrap();
        assert_eq!(group.len(), 2);

        // Removal doubles as timer cancellation
        assert!(queue.take_expired(Duration::ZERO).is_empty());
    }
}
