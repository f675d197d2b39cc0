// =============================================================================
// Shared types used across the Foresight prediction pipeline
// =============================================================================

use serde::{Deserialize, Serialize};

/// Directional stance of a signal, predictor, prediction, or outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Bullish,
    Bearish,
    Neutral,
}

impl Direction {
    /// The opposite stance. Neutral has no opposite.
    pub fn inverse(self) -> Self {
        match self {
            Self::Bullish => Self::Bearish,
            Self::Bearish => Self::Bullish,
            Self::Neutral => Self::Neutral,
        }
    }
}

impl Default for Direction {
    fn default() -> Self {
        Self::Neutral
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bullish => write!(f, "bullish"),
            Self::Bearish => write!(f, "bearish"),
            Self::Neutral => write!(f, "neutral"),
        }
    }
}

/// LLM quality tier. Each tier maps to a provider + model in the Universe
/// config; gold is the most capable (and most expensive).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmTier {
    Gold,
    Silver,
    Bronze,
}

impl Default for LlmTier {
    fn default() -> Self {
        Self::Silver
    }
}

impl std::fmt::Display for LlmTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gold => write!(f, "gold"),
            Self::Silver => write!(f, "silver"),
            Self::Bronze => write!(f, "bronze"),
        }
    }
}

/// What kind of origin a Source is. `TestDb` sources feed the synthetic test
/// path and force `is_test = true` on everything derived from them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Web,
    Feed,
    TestDb,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Web => write!(f, "web"),
            Self::Feed => write!(f, "feed"),
            Self::TestDb => write!(f, "test_db"),
        }
    }
}

/// Whether analyst dispatch runs against real LLM providers or the
/// deterministic demo backend. The engine starts in Demo for safety.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineMode {
    Demo,
    Live,
}

impl Default for EngineMode {
    fn default() -> Self {
        Self::Demo
    }
}

impl std::fmt::Display for EngineMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Demo => write!(f, "Demo"),
            Self::Live => write!(f, "Live"),
        }
    }
}

/// Analysis domain a Universe is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Equities,
    Crypto,
    Elections,
    PredictionMarkets,
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Equities => write!(f, "equities"),
            Self::Crypto => write!(f, "crypto"),
            Self::Elections => write!(f, "elections"),
            Self::PredictionMarkets => write!(f, "prediction_markets"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_inverse() {
        assert_eq!(Direction::Bullish.inverse(), Direction::Bearish);
        assert_eq!(Direction::Bearish.inverse(), Direction::Bullish);
        assert_eq!(Direction::Neutral.inverse(), Direction::Neutral);
    }

    #[test]
    fn direction_serde_lowercase() {
        let json = serde_json::to_string(&Direction::Bullish).unwrap();
        assert_eq!(json, "\"bullish\"");
        let d: Direction = serde_json::from_str("\"bearish\"").unwrap();
        assert_eq!(d, Direction::Bearish);
    }

    #[test]
    fn source_kind_snake_case() {
        let json = serde_json::to_string(&SourceKind::TestDb).unwrap();
        assert_eq!(json, "\"test_db\"");
    }

    #[test]
    fn defaults_are_safe() {
        assert_eq!(EngineMode::default(), EngineMode::Demo);
        assert_eq!(LlmTier::default(), LlmTier::Silver);
    }
}
