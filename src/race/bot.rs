//! Bot Typist Simulation
//!
//! Synthesizes a stream of progress updates for a non-human participant.
//! The typist itself is pure and deterministic (seeded per bot from the
//! room code); the coordinator drives it on a timer and pushes each step
//! through the same progress contract as a human participant.

use tokio::time::Duration;

use crate::core::rng::DeterministicRng;
use crate::race::model::{BotDifficulty, UserId, UserIdentity};

/// Display names drawn for bot participants.
pub const BOT_NAMES: &[&str] = &[
    "SpeedyBot",
    "TypeMaster",
    "CodeNinja",
    "FastFingers",
    "KeyboardKing",
    "SwiftTyper",
    "RapidWriter",
    "QuickKeys",
    "TurboTypist",
    "FlashTyper",
    "LightningKeys",
    "ThunderType",
    "RocketFingers",
    "BlazeTyper",
    "NitroWriter",
    "HyperType",
    "VelocityBot",
    "AceTyper",
    "ProKeys",
    "EliteWriter",
];

/// Words-per-minute band for a difficulty tier.
fn wpm_band(difficulty: BotDifficulty) -> (u32, u32) {
    match difficulty {
        BotDifficulty::Easy => (30, 45),
        BotDifficulty::Medium => (45, 60),
        BotDifficulty::Hard => (60, 80),
    }
}

/// Draw a bot identity with a fresh id and a pooled display name.
pub fn random_bot_identity(rng: &mut DeterministicRng) -> UserIdentity {
    let name = rng.choose(BOT_NAMES).copied().unwrap_or("SpeedyBot");
    UserIdentity::new(UserId::generate(), name)
}

/// Draw a difficulty tier: 30% easy, 50% medium, 20% hard.
pub fn random_bot_difficulty(rng: &mut DeterministicRng) -> BotDifficulty {
    let roll = rng.next_fraction();
    if roll < 0.3 {
        BotDifficulty::Easy
    } else if roll < 0.8 {
        BotDifficulty::Medium
    } else {
        BotDifficulty::Hard
    }
}

/// One emitted progress step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BotStep {
    /// Completed percentage of the text (0-100).
    pub progress: u8,
    /// Announced instantaneous speed, jittered around the base.
    pub wpm: u32,
    /// Announced accuracy, uniform in [90, 98].
    pub accuracy: u8,
    /// Whether the typist has consumed the whole text.
    pub finished: bool,
}

/// A simulated typist working through a fixed number of words.
pub struct BotTypist {
    base_wpm: u32,
    ms_per_word: u64,
    total_words: usize,
    words_typed: usize,
    rng: DeterministicRng,
}

impl BotTypist {
    /// Create a typist for `total_words` words. The base speed is drawn
    /// uniformly from the tier's band using the given seed.
    pub fn new(difficulty: BotDifficulty, total_words: usize, seed: u64) -> Self {
        let mut rng = DeterministicRng::new(seed);
        let (min_wpm, max_wpm) = wpm_band(difficulty);
        let base_wpm = min_wpm + rng.next_int(max_wpm - min_wpm + 1);

        Self {
            base_wpm,
            ms_per_word: 60_000 / base_wpm as u64,
            total_words,
            words_typed: 0,
            rng,
        }
    }

    /// The drawn base speed.
    pub fn base_wpm(&self) -> u32 {
        self.base_wpm
    }

    /// Whether the whole text has been consumed.
    pub fn is_finished(&self) -> bool {
        self.words_typed >= self.total_words
    }

    /// Delay before the next word, jittered ±10% around the average
    /// inter-word delay so the cadence feels human.
    pub fn step_delay(&mut self) -> Duration {
        let jitter = (self.ms_per_word as f64 * (self.rng.next_fraction() * 0.2 - 0.1)) as i64;
        Duration::from_millis(self.ms_per_word.saturating_add_signed(jitter))
    }

    /// Type one word and produce the step to announce.
    pub fn step(&mut self) -> BotStep {
        self.words_typed += 1;

        let progress = if self.total_words == 0 {
            100
        } else {
            let pct = (self.words_typed as f64 / self.total_words as f64 * 100.0).round() as u32;
            pct.min(100) as u8
        };

        // ±10% of base WPM, floored at 1
        let variance = (self.base_wpm as f64 * (self.rng.next_fraction() * 0.2 - 0.1)) as i64;
        let wpm = (self.base_wpm as i64 + variance).max(1) as u32;

        let accuracy = 90 + self.rng.next_int(9) as u8;

        BotStep {
            progress,
            wpm,
            accuracy,
            finished: self.is_finished(),
        }
    }
}
