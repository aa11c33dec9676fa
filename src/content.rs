//! Race Text Source
//!
//! Supplies the text to be typed for a given mode and language. The
//! coordinator consults this when assembling matchmade rooms; manually
//! created rooms bring their own text through the REST surface.

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::core::rng::DeterministicRng;
use crate::race::model::RaceMode;

/// Content lookup errors.
#[derive(Debug, thiserror::Error)]
pub enum ContentError {
    /// No passage available for the mode/language pair.
    #[error("no content for {mode:?}/{language}")]
    NotFound {
        /// Requested mode.
        mode: RaceMode,
        /// Requested language tag.
        language: String,
    },
}

/// Trait for race text providers.
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Return the text to be typed for a mode/language pair.
    async fn race_text(&self, mode: RaceMode, language: &str) -> Result<String, ContentError>;
}

// =============================================================================
// BUILT-IN PASSAGES
// =============================================================================

const NORMAL_ENGLISH: &[&str] = &[
    "The lighthouse keeper climbed the spiral stairs every evening to light the lamp, \
     counting each worn step as the wind pressed against the tower and the gulls \
     wheeled over the darkening water below.",
    "A good cup of coffee depends on more than the beans alone; the grind, the water \
     temperature, and the patience of the person brewing it all leave their mark on \
     the final cup in ways most drinkers never notice.",
    "Maps once carried sea monsters at their edges where knowledge ran out, and though \
     the monsters are gone, every map still draws a quiet line between the places we \
     have measured and the places we have only imagined.",
    "The orchard stood silent under the first frost of the season, each branch holding \
     its last few apples like small lanterns, while somewhere beyond the hedge a dog \
     barked twice and then thought better of it.",
];

const CODE_RUST: &[&str] = &[
    "fn largest<T: PartialOrd>(list: &[T]) -> &T {\n    let mut largest = &list[0];\n    \
     for item in list {\n        if item > largest {\n            largest = item;\n        }\n    }\n    \
     largest\n}",
    "let counts = words.iter().fold(HashMap::new(), |mut acc, word| {\n    \
     *acc.entry(word).or_insert(0) += 1;\n    acc\n});",
];

const CODE_JAVASCRIPT: &[&str] = &[
    "const debounce = (fn, ms) => {\n  let timer;\n  return (...args) => {\n    \
     clearTimeout(timer);\n    timer = setTimeout(() => fn(...args), ms);\n  };\n};",
    "async function fetchJson(url) {\n  const response = await fetch(url);\n  \
     if (!response.ok) throw new Error(response.statusText);\n  return response.json();\n}",
];

const CODE_PYTHON: &[&str] = &[
    "def flatten(nested):\n    for item in nested:\n        if isinstance(item, list):\n            \
     yield from flatten(item)\n        else:\n            yield item",
    "with open(path) as handle:\n    totals = {}\n    for line in handle:\n        \
     key, value = line.split(',')\n        totals[key] = totals.get(key, 0) + int(value)",
];

/// Built-in passage pool. Passage choice is randomized per request.
pub struct BuiltinContent {
    rng: Mutex<DeterministicRng>,
}

impl BuiltinContent {
    /// Create a pool seeded for this process.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(DeterministicRng::new(seed)),
        }
    }

    fn passages(mode: RaceMode, language: &str) -> Option<&'static [&'static str]> {
        match mode {
            RaceMode::Normal => Some(NORMAL_ENGLISH),
            RaceMode::Code => match language {
                "rust" => Some(CODE_RUST),
                "javascript" => Some(CODE_JAVASCRIPT),
                "python" => Some(CODE_PYTHON),
                _ => None,
            },
        }
    }
}

#[async_trait]
impl ContentSource for BuiltinContent {
    async fn race_text(&self, mode: RaceMode, language: &str) -> Result<String, ContentError> {
        let passages = Self::passages(mode, language).ok_or_else(|| ContentError::NotFound {
            mode,
            language: language.to_string(),
        })?;

        let mut rng = self.rng.lock().await;
        let passage = rng.choose(passages).copied().unwrap_or("");
        Ok(passage.to_string())
    }
}
