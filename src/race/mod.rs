//! Race Coordination
//!
//! The race domain: document model, per-room state machine,
//! matchmaking queue, bot typists, and the coordinator that
//! composes them.

pub mod bot;
pub mod coordinator;
pub mod model;
pub mod queue;
pub mod room;
