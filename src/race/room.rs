//! Race Room
//!
//! The state machine and data holder for one race instance. Manually
//! created rooms and matchmade rooms share this one abstraction; they
//! differ only in admission (explicit host start vs. auto-start once
//! the target size is reached).
//!
//! Rooms are linearized behind `Arc<RwLock<RaceRoom>>` - one room's
//! transitions never interleave with themselves, while different rooms
//! progress in parallel.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::network::protocol::ServerMessage;
use crate::race::model::{BotDifficulty, Participant, Race, RaceStatus, UserId, UserIdentity};

/// Alphabet for room codes (case-insensitive, stored uppercase).
const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Length of a room code.
pub const ROOM_CODE_LEN: usize = 6;

/// Room-level errors surfaced to the issuing client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomError {
    /// Room is at capacity.
    #[error("Race room is full")]
    RoomFull,

    /// Admission or start attempted outside `waiting`.
    #[error("Race has already started")]
    AlreadyStarted,

    /// Identity is already a participant.
    #[error("Already joined this race")]
    DuplicateParticipant,

    /// Start requested by a non-host.
    #[error("Only host can start the race")]
    NotHost,
}

/// A live race room: the authoritative race document plus the
/// subscriber group receiving its broadcasts.
pub struct RaceRoom {
    race: Race,
    /// Maximum participants admitted.
    capacity: usize,
    /// Auto-start threshold for matchmade rooms; `None` for rooms that
    /// wait on an explicit host start.
    target_size: Option<usize>,
    /// Connected members by user id.
    subscribers: HashMap<UserId, mpsc::Sender<ServerMessage>>,
}

impl RaceRoom {
    /// Wrap a race document in a host-started room.
    pub fn new(race: Race, capacity: usize) -> Self {
        Self {
            race,
            capacity,
            target_size: None,
            subscribers: HashMap::new(),
        }
    }

    /// Wrap a race document in a room that auto-starts at `target_size`.
    pub fn with_target(race: Race, capacity: usize, target_size: usize) -> Self {
        Self {
            target_size: Some(target_size),
            ..Self::new(race, capacity)
        }
    }

    /// Room code accessor.
    pub fn room_code(&self) -> &str {
        &self.race.room_code
    }

    /// Current lifecycle status.
    pub fn status(&self) -> RaceStatus {
        self.race.status
    }

    /// Clone of the authoritative race document.
    pub fn snapshot(&self) -> Race {
        self.race.clone()
    }

    /// Consistent snapshot of the participant list.
    pub fn participants(&self) -> Vec<Participant> {
        self.race.participants.clone()
    }

    /// Number of participants.
    pub fn participant_count(&self) -> usize {
        self.race.participants.len()
    }

    /// Whether a matchmade room has reached its auto-start threshold.
    pub fn at_target_size(&self) -> bool {
        self.target_size
            .map(|t| self.race.participants.len() >= t)
            .unwrap_or(false)
    }

    /// Admit a human participant.
    pub fn add_participant(&mut self, identity: &UserIdentity) -> Result<(), RoomError> {
        self.admit(Participant::human(identity))
    }

    /// Admit a bot participant.
    pub fn add_bot(
        &mut self,
        identity: &UserIdentity,
        difficulty: BotDifficulty,
    ) -> Result<(), RoomError> {
        self.admit(Participant::bot(identity, difficulty))
    }

    fn admit(&mut self, participant: Participant) -> Result<(), RoomError> {
        if self.race.status != RaceStatus::Waiting {
            return Err(RoomError::AlreadyStarted);
        }
        if self.race.participants.len() >= self.capacity {
            return Err(RoomError::RoomFull);
        }
        if self.race.participant(&participant.user_id).is_some() {
            return Err(RoomError::DuplicateParticipant);
        }

        self.race.participants.push(participant);
        Ok(())
    }

    /// Remove a participant record. Callers only do this while the room
    /// is still `waiting`; a vacated slot in a running race stays in
    /// place so positions are never renumbered.
    pub fn remove_participant(&mut self, user_id: &UserId) -> bool {
        let before = self.race.participants.len();
        self.race.participants.retain(|p| p.user_id != *user_id);
        self.race.participants.len() != before
    }

    /// Transition waiting → countdown when the host starts the room.
    pub fn start_by_host(&mut self, requester: &UserId) -> Result<(), RoomError> {
        if self.race.host_id != *requester {
            return Err(RoomError::NotHost);
        }
        self.start_countdown()
    }

    /// Transition waiting → countdown. Admission is closed from here on.
    pub fn start_countdown(&mut self) -> Result<(), RoomError> {
        if self.race.status != RaceStatus::Waiting {
            return Err(RoomError::AlreadyStarted);
        }
        self.race.status = RaceStatus::Countdown;
        Ok(())
    }

    /// Transition countdown → started once the last tick is broadcast.
    pub fn begin_running(&mut self) {
        if self.race.status == RaceStatus::Countdown {
            self.race.status = RaceStatus::Started;
            self.race.started_at = Some(Utc::now());
        }
    }

    /// Record a progress report. Fails silently (logged, not surfaced)
    /// when the room is not running, the participant is unknown, or the
    /// report would decrease progress. Returns whether it was applied.
    pub fn record_progress(&mut self, user_id: &UserId, progress: u8, wpm: u32, accuracy: u8) -> bool {
        if self.race.status != RaceStatus::Started {
            debug!(room = %self.race.room_code, status = ?self.race.status,
                "dropping progress report outside running race");
            return false;
        }

        let room_code = self.race.room_code.clone();
        let Some(participant) = self.race.participant_mut(user_id) else {
            debug!(room = %room_code, user = %user_id,
                "dropping progress report from unknown participant");
            return false;
        };

        let progress = progress.min(100);
        if progress < participant.progress {
            debug!(room = %room_code, user = %user_id,
                reported = progress, current = participant.progress,
                "rejecting decreasing progress report");
            return false;
        }

        participant.progress = progress;
        participant.wpm = wpm;
        participant.accuracy = accuracy.min(100);

        if progress >= 100 && participant.finished_at.is_none() {
            participant.finished_at = Some(Utc::now());
        }

        true
    }

    /// Stamp a participant's finish time if it is not already set.
    /// Used by the explicit `finish-race` event and by the disconnect
    /// grace sweep. Returns whether a timestamp was newly assigned.
    pub fn mark_finished(&mut self, user_id: &UserId) -> bool {
        if self.race.status != RaceStatus::Started {
            return false;
        }
        match self.race.participant_mut(user_id) {
            Some(p) if p.finished_at.is_none() => {
                p.finished_at = Some(Utc::now());
                true
            }
            _ => false,
        }
    }

    /// Finalize the race if every participant has finished: sort by
    /// finish time (stable, so sub-resolution ties keep their prior
    /// relative order), assign positions 1..N, and mark the room
    /// finished. Returns whether finalization happened.
    pub fn try_finalize(&mut self) -> bool {
        if self.race.status != RaceStatus::Started || !self.race.all_finished() {
            return false;
        }

        self.race.participants.sort_by_key(|p| p.finished_at);
        for (index, participant) in self.race.participants.iter_mut().enumerate() {
            participant.position = (index + 1) as u32;
        }

        self.race.status = RaceStatus::Finished;
        self.race.ended_at = Some(Utc::now());
        true
    }

    /// Register a member's connection in the broadcast group.
    pub fn subscribe(&mut self, user_id: UserId, sender: mpsc::Sender<ServerMessage>) {
        self.subscribers.insert(user_id, sender);
    }

    /// Remove a member's connection from the broadcast group.
    pub fn unsubscribe(&mut self, user_id: &UserId) -> bool {
        self.subscribers.remove(user_id).is_some()
    }

    /// Whether any members remain subscribed.
    pub fn has_subscribers(&self) -> bool {
        !self.subscribers.is_empty()
    }

    /// Broadcast a message to all connected members.
    pub async fn broadcast(&self, message: ServerMessage) {
        for sender in self.subscribers.values() {
            let _ = sender.send(message.clone()).await;
        }
    }
}

/// Generate a candidate room code. Uniqueness is the caller's job
/// (collision-checked against the registry and the persistence store).
pub fn generate_room_code() -> String {
    let bytes = *Uuid::new_v4().as_bytes();
    bytes[..ROOM_CODE_LEN]
        .iter()
        .map(|b| CODE_ALPHABET[(*b as usize) % CODE_ALPHABET.len()] as char)
        .collect()
}

// =============================================================================
// ROOM REGISTRY
// =============================================================================

/// All live rooms, keyed by room code. Owned by the coordinator for
/// the process lifetime.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<RwLock<RaceRoom>>>>,
}

impl RoomRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a room under its code.
    pub async fn insert(&self, room: RaceRoom) -> Arc<RwLock<RaceRoom>> {
        let code = room.room_code().to_uppercase();
        let room = Arc::new(RwLock::new(room));
        self.rooms.write().await.insert(code, room.clone());
        room
    }

    /// Look up a room by code (case-insensitive).
    pub async fn get(&self, room_code: &str) -> Option<Arc<RwLock<RaceRoom>>> {
        self.rooms.read().await.get(&room_code.to_uppercase()).cloned()
    }

    /// Whether a code is currently live.
    pub async fn contains(&self, room_code: &str) -> bool {
        self.rooms.read().await.contains_key(&room_code.to_uppercase())
    }

    /// Drop a room from the registry.
    pub async fn remove(&self, room_code: &str) -> Option<Arc<RwLock<RaceRoom>>> {
        self.rooms.write().await.remove(&room_code.to_uppercase())
    }

    /// Find the live room a user participates in, if any.
    pub async fn find_for_user(&self, user_id: &UserId) -> Option<(String, Arc<RwLock<RaceRoom>>)> {
        let rooms = self.rooms.read().await;
        for (code, room) in rooms.iter() {
            if room.read().await.race.participant(user_id).is_some() {
                return Some((code.clone(), room.clone()));
            }
        }
        None
    }

    /// Number of live rooms.
    pub async fn count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}
