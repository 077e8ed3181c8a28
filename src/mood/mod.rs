pub mod classifier;
pub mod history;
pub mod model;

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub use classifier::{Inference, MoodClassifier};
pub use history::ProbabilityHistory;
pub use model::{FeatureVector, MoodModel, MoodProbabilities, PrototypeModel, FEATURE_DIMS};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mood {
    Energetic,
    Relaxed,
    Happy,
    Melancholic,
    Focused,
    Romantic,
    Angry,
    #[default]
    Neutral,
}

impl Mood {
    pub const COUNT: usize = 8;

    pub const ALL: [Mood; Mood::COUNT] = [
        Mood::Energetic,
        Mood::Relaxed,
        Mood::Happy,
        Mood::Melancholic,
        Mood::Focused,
        Mood::Romantic,
        Mood::Angry,
        Mood::Neutral,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Mood::Energetic => "energetic",
            Mood::Relaxed => "relaxed",
            Mood::Happy => "happy",
            Mood::Melancholic => "melancholic",
            Mood::Focused => "focused",
            Mood::Romantic => "romantic",
            Mood::Angry => "angry",
            Mood::Neutral => "neutral",
        }
    }

    /// Archetype in [`FeatureVector`] space, used by the built-in model.
    /// Each row is the mean vector the analyzer reports for that mood's
    /// reference rendering.
    ///
    /// Order: energy, valence, danceability, acousticness, instrumentalness,
    /// speechiness, liveness, tempo, loudness, minor mode, brightness,
    /// harmonic ratio.
    pub fn profile(self) -> FeatureVector {
        FeatureVector(match self {
            Mood::Energetic => [0.44, 0.22, 0.62, 0.87, 0.46, 0.46, 0.64, 0.57, 0.78, 0.0, 0.17, 0.33],
            Mood::Relaxed => [0.49, 0.2, 0.43, 0.99, 0.79, 0.03, 0.17, 0.43, 0.7, 0.0, 0.03, 0.54],
            Mood::Happy => [0.36, 0.24, 0.7, 0.88, 0.47, 0.46, 0.92, 0.42, 0.73, 0.0, 0.18, 0.35],
            Mood::Melancholic => [0.36, 0.16, 0.64, 0.96, 0.62, 0.24, 0.61, 0.04, 0.68, 0.0, 0.07, 0.4],
            Mood::Focused => [0.55, 0.43, 0.36, 0.92, 0.87, 0.21, 0.08, 0.43, 0.83, 1.0, 0.2, 1.0],
            Mood::Romantic => [0.32, 0.11, 0.72, 0.93, 0.36, 0.47, 0.66, 0.14, 0.69, 0.0, 0.14, 0.1],
            Mood::Angry => [0.96, 0.41, 0.82, 0.56, 0.6, 0.57, 0.34, 0.43, 0.94, 0.0, 0.2, 0.84],
            Mood::Neutral => [0.33, 0.37, 0.5, 0.41, 0.36, 0.63, 0.52, 0.43, 0.63, 1.0, 0.41, 0.36],
        })
    }
}

impl fmt::Display for Mood {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Mood {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        Mood::ALL
            .iter()
            .copied()
            .find(|m| m.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown mood '{}'", s))
    }
}

/// A committed mood with the confidence it was committed at.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MoodSnapshot {
    pub mood: Mood,
    pub confidence: f32,
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: u64,
    /// Counts committed transitions; 0 is the initial state.
    pub sequence: u64,
}

impl MoodSnapshot {
    pub fn initial() -> Self {
        Self {
            mood: Mood::Neutral,
            confidence: 0.0,
            timestamp_ms: unix_millis(),
            sequence: 0,
        }
    }
}

pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
