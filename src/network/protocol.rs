//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! All messages are serialized as JSON; tags use the kebab-case event
//! names clients know (`find-race`, `race-countdown`, ...) and payload
//! fields are camelCase, matching the race document wire format.

use serde::{Deserialize, Serialize};

use crate::race::model::{Participant, Race, RaceMode, UserIdentity};

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Enter the matchmaking queue for a mode.
    FindRace {
        /// Authenticated identity of the searching player.
        identity: UserIdentity,
        /// Requested content mode.
        mode: RaceMode,
    },

    /// Leave the matchmaking queue.
    CancelMatchmaking,

    /// Join a race room by code.
    JoinRace {
        /// Target room code.
        room_code: String,
        /// Authenticated identity of the joining player.
        identity: UserIdentity,
    },

    /// Start a manually created room (host only).
    StartRace {
        /// Target room code.
        room_code: String,
    },

    /// Report typing progress for the running race.
    UpdateProgress {
        /// Target room code.
        room_code: String,
        /// Reporting participant.
        identity: UserIdentity,
        /// Completed percentage of the text (0-100).
        progress: u8,
        /// Current words-per-minute.
        wpm: u32,
        /// Current accuracy percentage (0-100).
        accuracy: u8,
    },

    /// Mark the sender finished (fallback for clients that lost the
    /// final progress update).
    FinishRace {
        /// Target room code.
        room_code: String,
        /// Finishing participant.
        identity: UserIdentity,
    },

    /// Leave a race room's broadcast group.
    LeaveRace {
        /// Target room code.
        room_code: String,
    },
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Matchmaking lifecycle announced to the searching client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchmakingStatus {
    /// Enqueued, waiting for opponents.
    Searching,
    /// Entry removed at the player's request.
    Cancelled,
}

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Matchmaking queue status update.
    MatchmakingStatus {
        /// Current status.
        status: MatchmakingStatus,
    },

    /// A race was assembled for a queued player.
    RaceFound {
        /// The assembled race document.
        room: Race,
    },

    /// Roster changed in a waiting room.
    ParticipantJoined {
        /// Full participant list after the join.
        participants: Vec<Participant>,
        /// Current race document.
        room: Race,
    },

    /// Countdown tick (5,4,3,2,1,0 - one per second).
    RaceCountdown {
        /// Seconds remaining before the race starts.
        countdown: u32,
    },

    /// The countdown completed and typing began.
    RaceStarted {
        /// Current race document.
        room: Race,
    },

    /// A participant reported progress.
    ProgressUpdated {
        /// Consistent snapshot of all participants.
        participants: Vec<Participant>,
    },

    /// Every participant finished; final standings inside.
    RaceFinished {
        /// Final race document with positions assigned.
        room: Race,
    },

    /// A client-issued event failed.
    RaceError {
        /// Human-readable reason.
        message: String,
    },
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}
