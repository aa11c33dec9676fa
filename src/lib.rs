//! # Typerace Server
//!
//! Real-time race coordination engine for multiplayer typing races.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    TYPERACE SERVER                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Deterministic primitives                  │
//! │  └── rng.rs      - Deterministic Xorshift128+ PRNG           │
//! │                                                              │
//! │  race/           - Race coordination                         │
//! │  ├── model.rs    - Race document and participant state       │
//! │  ├── room.rs     - Race room state machine and registry      │
//! │  ├── queue.rs    - Matchmaking queue                         │
//! │  ├── bot.rs      - Bot typist simulation                     │
//! │  └── coordinator.rs - Orchestration and broadcast fan-out    │
//! │                                                              │
//! │  network/        - Client-facing transport                   │
//! │  ├── server.rs   - WebSocket server                          │
//! │  ├── protocol.rs - Message types                             │
//! │  └── auth.rs     - Bearer token validation                   │
//! │                                                              │
//! │  store/          - Persistence seam (mirror of live state)   │
//! │  http.rs         - REST surface (create/join/fetch rooms)    │
//! │  content.rs      - Race text source                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Ownership Model
//!
//! A single [`race::coordinator::RaceCoordinator`] owns the matchmaking
//! queue and the set of live race rooms for the process lifetime. Room
//! state is linearized per room behind an `RwLock`; different rooms
//! progress fully in parallel. The persistence store is mirror-only on
//! the hot path - the in-memory room is authoritative for all live
//! gameplay decisions.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod content;
pub mod core;
pub mod http;
pub mod network;
pub mod race;
pub mod store;

// Re-export commonly used types
pub use crate::core::rng::DeterministicRng;
pub use race::coordinator::{CoordinatorError, RaceConfig, RaceCoordinator};
pub use race::model::{BotDifficulty, Participant, Race, RaceMode, RaceStatus, UserId, UserIdentity};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Countdown length in seconds (broadcast ticks 5,4,3,2,1,0)
pub const COUNTDOWN_SECONDS: u64 = 5;

/// Maximum participants in a race room
pub const MAX_RACE_PARTICIPANTS: usize = 5;
