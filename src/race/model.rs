//! Race Document Model
//!
//! The race document and participant state as persisted and broadcast.
//! Field names serialize camelCase and enums lowercase to match the
//! wire format consumed by clients and the persistence store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// USER IDENTITY
// =============================================================================

/// Unique user identifier.
///
/// Wraps a UUID; bots receive freshly generated v4 ids so they flow
/// through the same code paths as human participants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(pub Uuid);

impl UserId {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from a UUID string.
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// An authenticated identity supplied by the identity provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    /// Stable user id.
    pub id: UserId,
    /// Display name.
    pub username: String,
}

impl UserIdentity {
    /// Build an identity from parts.
    pub fn new(id: UserId, username: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
        }
    }
}

// =============================================================================
// ENUMS
// =============================================================================

/// Bot typing speed tier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BotDifficulty {
    /// 30-45 WPM band.
    Easy,
    /// 45-60 WPM band.
    Medium,
    /// 60-80 WPM band.
    Hard,
}

/// Race content mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RaceMode {
    /// Prose text.
    #[default]
    Normal,
    /// Source-code snippets.
    Code,
}

/// Race room lifecycle state.
///
/// Transitions are monotonic: waiting → countdown → started → finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaceStatus {
    /// Accepting participants.
    Waiting,
    /// Countdown ticking; admission closed.
    Countdown,
    /// Race running; progress accepted.
    Started,
    /// Terminal. Rooms are not reused.
    Finished,
}

// =============================================================================
// PARTICIPANT
// =============================================================================

/// A human or bot entrant in a race room.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    /// Owning user id.
    pub user_id: UserId,
    /// Display name.
    pub username: String,
    /// Whether this entrant is simulated.
    pub is_bot: bool,
    /// Speed tier, present only for bots.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot_difficulty: Option<BotDifficulty>,
    /// Last reported words-per-minute.
    pub wpm: u32,
    /// Last reported accuracy percentage (0-100).
    pub accuracy: u8,
    /// Percentage of the text completed (0-100, never decreases).
    pub progress: u8,
    /// Final rank; 0 until the race finishes.
    pub position: u32,
    /// Set once, when progress first reaches 100.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Participant {
    /// A human participant with zeroed counters.
    pub fn human(identity: &UserIdentity) -> Self {
        Self {
            user_id: identity.id,
            username: identity.username.clone(),
            is_bot: false,
            bot_difficulty: None,
            wpm: 0,
            accuracy: 0,
            progress: 0,
            position: 0,
            finished_at: None,
        }
    }

    /// A bot participant with an assigned difficulty tier.
    pub fn bot(identity: &UserIdentity, difficulty: BotDifficulty) -> Self {
        Self {
            bot_difficulty: Some(difficulty),
            is_bot: true,
            ..Self::human(identity)
        }
    }

    /// Whether this participant has completed the text.
    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}

// =============================================================================
// RACE DOCUMENT
// =============================================================================

/// A race document: the unit persisted to the store and broadcast to
/// room members. The in-memory copy held by the room is authoritative.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Race {
    /// Unique human-shareable room identifier (uppercase alphanumeric).
    pub room_code: String,
    /// Id of the hosting participant.
    pub host_id: UserId,
    /// Content mode.
    pub mode: RaceMode,
    /// Content language tag.
    pub language: String,
    /// Entrants in join order.
    pub participants: Vec<Participant>,
    /// Lifecycle state.
    pub status: RaceStatus,
    /// The text to be typed. Immutable once created.
    pub text_content: String,
    /// When the countdown completed and typing began.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When all participants finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Document creation time.
    pub created_at: DateTime<Utc>,
}

impl Race {
    /// Create a waiting race with the host as sole participant.
    pub fn new(
        room_code: impl Into<String>,
        host: &UserIdentity,
        mode: RaceMode,
        language: impl Into<String>,
        text_content: impl Into<String>,
    ) -> Self {
        Self {
            room_code: room_code.into(),
            host_id: host.id,
            mode,
            language: language.into(),
            participants: vec![Participant::human(host)],
            status: RaceStatus::Waiting,
            text_content: text_content.into(),
            started_at: None,
            ended_at: None,
            created_at: Utc::now(),
        }
    }

    /// Find a participant by user id.
    pub fn participant(&self, user_id: &UserId) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user_id == *user_id)
    }

    /// Find a participant by user id, mutably.
    pub fn participant_mut(&mut self, user_id: &UserId) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| p.user_id == *user_id)
    }

    /// Word count of the text content, the denominator for bot progress.
    pub fn total_words(&self) -> usize {
        self.text_content.split_whitespace().count()
    }

    /// Whether every participant has a finish timestamp.
    pub fn all_finished(&self) -> bool {
        !self.participants.is_empty() && self.participants.iter().all(|p| p.is_finished())
    }
}
