use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::options::AnalysisOptions;

pub const SUB_BANDS: usize = 8;

pub const MIN_TEMPO: f32 = 60.0;
pub const MAX_TEMPO: f32 = 200.0;
pub const DEFAULT_TEMPO: f32 = 120.0;
pub const MIN_LOUDNESS: f32 = -70.0;
pub const MAX_LOUDNESS: f32 = 0.0;

const KEY_NAMES: [&str; 12] = ["C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B"];

/// Per-buffer spectral descriptors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SpectralFeatures {
    /// Power-weighted mean frequency (Hz)
    pub centroid: f32,
    /// Frequency below which the configured share of power lies (Hz)
    pub rolloff: f32,
    /// Positive change of the normalized magnitude spectrum vs. the previous frame (0.0-1.0)
    pub flux: f32,
    /// Geometric / arithmetic mean of the magnitude spectrum (0.0-1.0)
    pub flatness: f32,
    /// Square root of the power-weighted variance around the centroid (Hz)
    pub spread: f32,
    /// Share of power at the detected fundamental and its harmonics (0.0-1.0)
    pub harmonic_ratio: f32,
    /// Detected fundamental (Hz), 0 when none was found
    pub fundamental: f32,
    /// 20-250 Hz; bass + mid + treble == 1
    pub bass: f32,
    /// 250-4000 Hz
    pub mid: f32,
    /// 4-20 kHz
    pub treble: f32,
    /// Linearly spaced bands from DC to Nyquist, summing to 1
    pub sub_bands: [f32; SUB_BANDS],
}

impl SpectralFeatures {
    /// Arithmetic mean of a sequence of frames.
    pub fn average<'a>(frames: impl IntoIterator<Item = &'a SpectralFeatures>) -> Option<Self> {
        let mut acc = SpectralFeatures::default();
        let mut n = 0usize;
        for f in frames {
            acc.centroid += f.centroid;
            acc.rolloff += f.rolloff;
            acc.flux += f.flux;
            acc.flatness += f.flatness;
            acc.spread += f.spread;
            acc.harmonic_ratio += f.harmonic_ratio;
            acc.fundamental += f.fundamental;
            acc.bass += f.bass;
            acc.mid += f.mid;
            acc.treble += f.treble;
            for (a, b) in acc.sub_bands.iter_mut().zip(f.sub_bands.iter()) {
                *a += b;
            }
            n += 1;
        }
        if n == 0 {
            return None;
        }
        let k = 1.0 / n as f32;
        acc.centroid *= k;
        acc.rolloff *= k;
        acc.flux *= k;
        acc.flatness *= k;
        acc.spread *= k;
        acc.harmonic_ratio *= k;
        acc.fundamental *= k;
        acc.bass *= k;
        acc.mid *= k;
        acc.treble *= k;
        for b in acc.sub_bands.iter_mut() {
            *b *= k;
        }
        Some(acc)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Major,
    Minor,
}

/// Canonical feature snapshot produced once per analysis pass.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AudioFeatures {
    pub energy: f32,
    pub valence: f32,
    pub danceability: f32,
    pub acousticness: f32,
    pub instrumentalness: f32,
    pub speechiness: f32,
    pub liveness: f32,
    /// Beats per minute, 60-200
    pub tempo: f32,
    /// Pitch class, 0 = C .. 11 = B
    pub key: u8,
    pub mode: Mode,
    /// Gated loudness in LUFS, -70..0
    pub loudness: f32,
    /// Seconds of audio that contributed
    pub duration: f32,
    pub sample_rate: u32,
    pub channels: u16,
    pub spectral: SpectralFeatures,
    /// Stages that actually ran; skipped stages leave their defaults
    pub stages: AnalysisOptions,
}

impl AudioFeatures {
    pub fn key_name(&self) -> &'static str {
        KEY_NAMES[(self.key % 12) as usize]
    }

    /// e.g. "A minor"
    pub fn key_signature(&self) -> String {
        let mode = match self.mode {
            Mode::Major => "major",
            Mode::Minor => "minor",
        };
        format!("{} {}", self.key_name(), mode)
    }

    /// Forces every field into its documented range. NaN collapses to the
    /// lower bound.
    pub fn clamped(mut self) -> Self {
        for v in [
            &mut self.energy,
            &mut self.valence,
            &mut self.danceability,
            &mut self.acousticness,
            &mut self.instrumentalness,
            &mut self.speechiness,
            &mut self.liveness,
        ] {
            *v = unit(*v);
        }
        self.tempo = clamp_or(self.tempo, MIN_TEMPO, MAX_TEMPO, DEFAULT_TEMPO);
        self.loudness = clamp_or(self.loudness, MIN_LOUDNESS, MAX_LOUDNESS, MIN_LOUDNESS);
        self.key %= 12;
        self
    }

    pub fn in_range(&self) -> bool {
        let units = [
            self.energy,
            self.valence,
            self.danceability,
            self.acousticness,
            self.instrumentalness,
            self.speechiness,
            self.liveness,
        ];
        units.iter().all(|v| (0.0..=1.0).contains(v))
            && (MIN_TEMPO..=MAX_TEMPO).contains(&self.tempo)
            && (MIN_LOUDNESS..=MAX_LOUDNESS).contains(&self.loudness)
            && self.key < 12
    }

    /// Weighted combination used when a resumed analysis joins its
    /// checkpointed prefix: `self * (1 - weight) + other * weight` for the
    /// scalar fields; discrete fields come from whichever side weighs more.
    pub fn blend(&self, other: &AudioFeatures, weight: f32) -> AudioFeatures {
        let w = weight.clamp(0.0, 1.0);
        let mix = |a: f32, b: f32| a * (1.0 - w) + b * w;
        let dominant = if w >= 0.5 { other } else { self };
        let spectral = SpectralFeatures::average([&self.spectral, &other.spectral])
            .unwrap_or(other.spectral);
        AudioFeatures {
            energy: mix(self.energy, other.energy),
            valence: mix(self.valence, other.valence),
            danceability: mix(self.danceability, other.danceability),
            acousticness: mix(self.acousticness, other.acousticness),
            instrumentalness: mix(self.instrumentalness, other.instrumentalness),
            speechiness: mix(self.speechiness, other.speechiness),
            liveness: mix(self.liveness, other.liveness),
            tempo: mix(self.tempo, other.tempo),
            key: dominant.key,
            mode: dominant.mode,
            loudness: mix(self.loudness, other.loudness),
            duration: self.duration + other.duration,
            sample_rate: other.sample_rate,
            channels: other.channels,
            spectral,
            stages: self.stages | other.stages,
        }
        .clamped()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

pub(crate) fn unit(v: f32) -> f32 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

fn clamp_or(v: f32, lo: f32, hi: f32, fallback: f32) -> f32 {
    if v.is_nan() {
        fallback
    } else {
        v.clamp(lo, hi)
    }
}

#[cfg(test)]
pub(crate) fn sample_features() -> AudioFeatures {
    AudioFeatures {
        energy: 0.73,
        valence: 0.41,
        danceability: 0.66,
        acousticness: 0.2,
        instrumentalness: 0.85,
        speechiness: 0.07,
        liveness: 0.12,
        tempo: 128.5,
        key: 9,
        mode: Mode::Minor,
        loudness: -8.25,
        duration: 3.0,
        sample_rate: 44_100,
        channels: 2,
        spectral: SpectralFeatures {
            centroid: 1850.5,
            rolloff: 4200.0,
            flux: 0.12,
            flatness: 0.03,
            spread: 1400.25,
            harmonic_ratio: 0.64,
            fundamental: 440.0,
            bass: 0.3,
            mid: 0.6,
            treble: 0.1,
            sub_bands: [0.5, 0.25, 0.125, 0.0625, 0.03125, 0.015625, 0.0078125, 0.0078125],
        },
        stages: AnalysisOptions::COMPREHENSIVE,
    }
}
