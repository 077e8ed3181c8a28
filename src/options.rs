use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Bit-set of optional analysis stages.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnalysisOptions(u32);

impl AnalysisOptions {
    pub const NONE: Self = Self(0);
    pub const SPECTRAL: Self = Self(1 << 0);
    pub const TEMPO: Self = Self(1 << 1);
    pub const PITCH: Self = Self(1 << 2);
    pub const LOUDNESS: Self = Self(1 << 3);
    pub const RHYTHM: Self = Self(1 << 4);
    pub const MOOD: Self = Self(1 << 5);
    pub const GENRE: Self = Self(1 << 6);
    pub const HARMONIC: Self = Self(1 << 7);
    pub const CACHING: Self = Self(1 << 8);
    pub const HIGH_PRECISION: Self = Self(1 << 9);
    pub const LOW_LATENCY: Self = Self(1 << 10);

    /// Spectral descriptors and loudness only.
    pub const QUICK: Self = Self(Self::SPECTRAL.0 | Self::LOUDNESS.0);
    /// Quick plus tempo, rhythm and result caching.
    pub const STANDARD: Self =
        Self(Self::QUICK.0 | Self::TEMPO.0 | Self::RHYTHM.0 | Self::CACHING.0);
    /// Standard plus key, mood, harmonic analysis and high precision.
    pub const COMPREHENSIVE: Self = Self(
        Self::STANDARD.0 | Self::PITCH.0 | Self::MOOD.0 | Self::HARMONIC.0 | Self::HIGH_PRECISION.0,
    );

    /// Stages dropped first under critical resource pressure.
    pub const OPTIONAL_UNDER_PRESSURE: Self =
        Self(Self::TEMPO.0 | Self::PITCH.0 | Self::RHYTHM.0 | Self::HARMONIC.0 | Self::HIGH_PRECISION.0);

    const NAMES: &'static [(&'static str, AnalysisOptions)] = &[
        ("spectral", Self::SPECTRAL),
        ("tempo", Self::TEMPO),
        ("pitch", Self::PITCH),
        ("loudness", Self::LOUDNESS),
        ("rhythm", Self::RHYTHM),
        ("mood", Self::MOOD),
        ("genre", Self::GENRE),
        ("harmonic", Self::HARMONIC),
        ("caching", Self::CACHING),
        ("high-precision", Self::HIGH_PRECISION),
        ("low-latency", Self::LOW_LATENCY),
    ];

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for AnalysisOptions {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for AnalysisOptions {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for AnalysisOptions {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl Not for AnalysisOptions {
    type Output = Self;
    fn not(self) -> Self {
        let all = Self::NAMES.iter().fold(0, |acc, (_, o)| acc | o.0);
        Self(!self.0 & all)
    }
}

impl fmt::Debug for AnalysisOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(_, o)| self.contains(*o))
            .map(|(n, _)| *n)
            .collect();
        write!(f, "AnalysisOptions({})", names.join("|"))
    }
}

/// Parses a preset name (`quick`, `standard`, `comprehensive`) or a
/// `+`/`,` separated list of stage names.
impl FromStr for AnalysisOptions {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "quick" => return Ok(Self::QUICK),
            "standard" => return Ok(Self::STANDARD),
            "comprehensive" => return Ok(Self::COMPREHENSIVE),
            _ => {}
        }
        let mut out = Self::NONE;
        for part in s.split(|c| c == '+' || c == ',') {
            let part = part.trim().to_ascii_lowercase();
            if part.is_empty() {
                continue;
            }
            let (_, opt) = Self::NAMES
                .iter()
                .find(|(name, _)| *name == part)
                .ok_or_else(|| format!("unknown analysis stage '{}'", part))?;
            out |= *opt;
        }
        Ok(out)
    }
}
