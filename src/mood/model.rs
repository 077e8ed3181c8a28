use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::Mood;
use crate::analysis::features::{AudioFeatures, Mode, MAX_LOUDNESS, MAX_TEMPO, MIN_LOUDNESS, MIN_TEMPO};
use crate::error::{AnalysisError, Result};

pub const FEATURE_DIMS: usize = 12;

/// Centroid (Hz) mapped to full brightness.
const BRIGHT_CENTROID: f32 = 5000.0;

/// Model input: every component scaled to 0.0-1.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureVector(pub [f32; FEATURE_DIMS]);

impl FeatureVector {
    pub fn from_features(f: &AudioFeatures) -> Self {
        let scale = |v: f32, lo: f32, hi: f32| ((v - lo) / (hi - lo)).clamp(0.0, 1.0);
        Self([
            f.energy,
            f.valence,
            f.danceability,
            f.acousticness,
            f.instrumentalness,
            f.speechiness,
            f.liveness,
            scale(f.tempo, MIN_TEMPO, MAX_TEMPO),
            scale(f.loudness, MIN_LOUDNESS, MAX_LOUDNESS),
            if f.mode == Mode::Minor { 1.0 } else { 0.0 },
            (f.spectral.centroid / BRIGHT_CENTROID).clamp(0.0, 1.0),
            f.spectral.harmonic_ratio.clamp(0.0, 1.0),
        ])
    }

    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|v| v.is_finite())
    }

    pub fn distance(&self, other: &FeatureVector, weights: &[f32; FEATURE_DIMS]) -> f32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .zip(weights.iter())
            .map(|((a, b), w)| w * (a - b) * (a - b))
            .sum::<f32>()
            .sqrt()
    }

    pub fn mean<'a>(vectors: impl IntoIterator<Item = &'a FeatureVector>) -> Option<Self> {
        let mut acc = [0.0f32; FEATURE_DIMS];
        let mut n = 0usize;
        for v in vectors {
            for (a, x) in acc.iter_mut().zip(v.0.iter()) {
                *a += x;
            }
            n += 1;
        }
        if n == 0 {
            return None;
        }
        for a in acc.iter_mut() {
            *a /= n as f32;
        }
        Some(Self(acc))
    }
}

/// One probability per [`Mood`], indexed by [`Mood::index`]; sums to 1.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MoodProbabilities(pub [f32; Mood::COUNT]);

impl MoodProbabilities {
    pub fn get(&self, mood: Mood) -> f32 {
        self.0[mood.index()]
    }

    /// Most probable mood. Ties go to the earlier mood in [`Mood::ALL`].
    pub fn best(&self) -> (Mood, f32) {
        let mut best = (Mood::Neutral, f32::MIN);
        for mood in Mood::ALL {
            let p = self.get(mood);
            if p > best.1 {
                best = (mood, p);
            }
        }
        best
    }

    pub fn iter(&self) -> impl Iterator<Item = (Mood, f32)> + '_ {
        Mood::ALL.iter().map(move |&m| (m, self.get(m)))
    }
}

/// Replaceable feature-to-mood mapping.
pub trait MoodModel: Send {
    /// Makes the model ready for [`predict`](Self::predict). May be called
    /// again after a failure.
    fn load(&mut self) -> Result<()>;

    fn is_loaded(&self) -> bool;

    fn predict(&self, input: &FeatureVector) -> Result<MoodProbabilities>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Prototype {
    mood: Mood,
    vector: FeatureVector,
}

/// On-disk form of a [`PrototypeModel`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ModelArtifact {
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    weights: Option<[f32; FEATURE_DIMS]>,
    prototypes: Vec<Prototype>,
}

/// Softmax over negative weighted distances to one prototype per mood.
/// Moods without a prototype get probability 0.
#[derive(Debug, Clone)]
pub struct PrototypeModel {
    prototypes: Vec<Prototype>,
    weights: [f32; FEATURE_DIMS],
    temperature: f32,
    artifact: Option<PathBuf>,
    loaded: bool,
}

impl PrototypeModel {
    /// Built-in archetypes from [`Mood::profile`].
    pub fn new(temperature: f32) -> Self {
        Self {
            prototypes: Mood::ALL
                .iter()
                .map(|&mood| Prototype {
                    mood,
                    vector: mood.profile(),
                })
                .collect(),
            weights: default_weights(),
            temperature: sanitize_temperature(temperature),
            artifact: None,
            loaded: false,
        }
    }

    /// A model whose prototypes are read from a JSON artifact on
    /// [`load`](MoodModel::load).
    pub fn from_artifact(path: impl Into<PathBuf>, temperature: f32) -> Self {
        Self {
            prototypes: Vec::new(),
            weights: default_weights(),
            temperature: sanitize_temperature(temperature),
            artifact: Some(path.into()),
            loaded: false,
        }
    }

    /// Prototypes as the per-mood mean of labelled reference vectors.
    pub fn from_examples(examples: &[(Mood, FeatureVector)], temperature: f32) -> Result<Self> {
        let prototypes: Vec<Prototype> = Mood::ALL
            .iter()
            .filter_map(|&mood| {
                FeatureVector::mean(examples.iter().filter(|(m, _)| *m == mood).map(|(_, v)| v))
                    .map(|vector| Prototype { mood, vector })
            })
            .collect();
        if prototypes.is_empty() {
            return Err(AnalysisError::ModelLoadFailed("no reference vectors".into()));
        }
        Ok(Self {
            prototypes,
            weights: default_weights(),
            temperature: sanitize_temperature(temperature),
            artifact: None,
            loaded: true,
        })
    }

    pub fn with_weights(mut self, weights: [f32; FEATURE_DIMS]) -> Self {
        self.weights = weights.map(|w| if w.is_finite() { w.max(0.0) } else { 0.0 });
        self
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    pub fn prototype(&self, mood: Mood) -> Option<FeatureVector> {
        self.prototypes.iter().find(|p| p.mood == mood).map(|p| p.vector)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let artifact = ModelArtifact {
            temperature: Some(self.temperature),
            weights: Some(self.weights),
            prototypes: self.prototypes.clone(),
        };
        let json = serde_json::to_string_pretty(&artifact)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    fn read_artifact(path: &Path) -> Result<ModelArtifact> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            AnalysisError::ModelLoadFailed(format!("{}: {}", path.display(), e))
        })?;
        let artifact: ModelArtifact = serde_json::from_str(&text).map_err(|e| {
            AnalysisError::ModelLoadFailed(format!("{}: {}", path.display(), e))
        })?;
        if artifact.prototypes.is_empty() {
            return Err(AnalysisError::ModelLoadFailed(format!(
                "{}: no prototypes",
                path.display()
            )));
        }
        if !artifact.prototypes.iter().all(|p| p.vector.is_finite()) {
            return Err(AnalysisError::ModelLoadFailed(format!(
                "{}: non-finite prototype",
                path.display()
            )));
        }
        Ok(artifact)
    }
}

impl MoodModel for PrototypeModel {
    fn load(&mut self) -> Result<()> {
        if let Some(path) = &self.artifact {
            let artifact = Self::read_artifact(path)?;
            log::info!(
                "Loaded mood model from {} ({} prototypes)",
                path.display(),
                artifact.prototypes.len()
            );
            self.prototypes = artifact.prototypes;
            if let Some(weights) = artifact.weights {
                self.weights = weights;
            }
            if let Some(t) = artifact.temperature {
                self.temperature = sanitize_temperature(t);
            }
        }
        self.loaded = true;
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.loaded
    }

    fn predict(&self, input: &FeatureVector) -> Result<MoodProbabilities> {
        if !self.loaded {
            return Err(AnalysisError::InferenceFailed("model not loaded".into()));
        }
        if !input.is_finite() {
            return Err(AnalysisError::InferenceFailed("non-finite feature vector".into()));
        }
        let mut logits = [f32::NEG_INFINITY; Mood::COUNT];
        for p in &self.prototypes {
            let logit = -p.vector.distance(input, &self.weights) / self.temperature;
            let slot = &mut logits[p.mood.index()];
            *slot = slot.max(logit);
        }
        let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        if !max.is_finite() {
            return Err(AnalysisError::InferenceFailed("no usable prototypes".into()));
        }
        let mut probs = [0.0f32; Mood::COUNT];
        let mut sum = 0.0f32;
        for (p, &l) in probs.iter_mut().zip(logits.iter()) {
            *p = (l - max).exp();
            sum += *p;
        }
        for p in probs.iter_mut() {
            *p /= sum;
        }
        Ok(MoodProbabilities(probs))
    }
}

fn default_weights() -> [f32; FEATURE_DIMS] {
    let mut w = [1.0; FEATURE_DIMS];
    // Mode is binary; a full mismatch should not outweigh the continuous cues.
    w[9] = 0.5;
    w
}

fn sanitize_temperature(t: f32) -> f32 {
    if t.is_finite() && t > 1e-4 {
        t
    } else {
        1e-4
    }
}
