use std::collections::VecDeque;

use super::history::ProbabilityHistory;
use super::model::{FeatureVector, MoodModel};
use super::{unix_millis, Mood, MoodSnapshot};
use crate::analysis::features::AudioFeatures;
use crate::config::ClassifierConfig;
use crate::error::{AnalysisError, ErrorKind, Result};

/// Outcome of one [`MoodClassifier::infer`] call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Inference {
    /// Most probable mood for this input alone
    pub candidate: Mood,
    pub confidence: f32,
    /// Smoothed confidence of `candidate` over the recent history
    pub smoothed: f32,
    /// Mood in effect after this call
    pub current: MoodSnapshot,
    pub transitioned: bool,
}

/// Hysteresis state machine over [`Mood`]. Starts at neutral.
///
/// Switching to a different mood needs both a raw confidence of at least
/// `confidence_threshold` and a smoothed confidence of at least
/// `stability_factor`; the current mood is reaffirmed at the lower
/// `same_mood_threshold`.
pub struct MoodClassifier {
    model: Box<dyn MoodModel>,
    config: ClassifierConfig,
    history: ProbabilityHistory,
    current: MoodSnapshot,
    snapshots: VecDeque<MoodSnapshot>,
}

impl MoodClassifier {
    pub fn new(model: Box<dyn MoodModel>, config: ClassifierConfig) -> Self {
        let history = ProbabilityHistory::new(config.history_len);
        let cap = config.snapshot_history.max(1);
        Self {
            model,
            config,
            history,
            current: MoodSnapshot::initial(),
            snapshots: VecDeque::with_capacity(cap),
        }
    }

    pub fn current(&self) -> MoodSnapshot {
        self.current
    }

    /// Committed transitions, oldest first.
    pub fn snapshots(&self) -> &VecDeque<MoodSnapshot> {
        &self.snapshots
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Loads the model if needed, retrying with the configured backoff.
    /// When every attempt fails the previous mood stays in effect with
    /// confidence 0.
    pub fn ensure_loaded(&mut self) -> Result<()> {
        if self.model.is_loaded() {
            return Ok(());
        }
        let model = &mut self.model;
        let loaded = self.config.retry.run_if(
            |_| model.load(),
            |e| e.kind() == ErrorKind::ModelLoadFailed || e.kind().is_transient(),
        );
        match loaded {
            Ok(()) => Ok(()),
            Err(err) => {
                self.current.confidence = 0.0;
                Err(match err {
                    AnalysisError::ModelLoadFailed(_) => err,
                    other => AnalysisError::ModelLoadFailed(other.to_string()),
                })
            }
        }
    }

    pub fn infer(&mut self, features: &AudioFeatures) -> Result<Inference> {
        self.ensure_loaded()?;
        let input = FeatureVector::from_features(features);
        let probabilities = self.model.predict(&input)?;
        let (candidate, confidence) = probabilities.best();

        self.history.push(candidate, confidence);
        let smoothed = self.history.smoothed(candidate, self.config.smoothing_alpha);

        let mut transitioned = false;
        if candidate != self.current.mood {
            if confidence >= self.config.confidence_threshold
                && smoothed >= self.config.stability_factor
            {
                self.commit(candidate, confidence);
                transitioned = true;
            }
        } else if confidence >= self.config.same_mood_threshold {
            self.current.confidence = confidence;
        }

        Ok(Inference {
            candidate,
            confidence,
            smoothed,
            current: self.current,
            transitioned,
        })
    }

    /// Clears the smoothing history. The committed mood is kept.
    pub fn reset(&mut self) {
        self.history.clear();
    }

    fn commit(&mut self, mood: Mood, confidence: f32) {
        let snapshot = MoodSnapshot {
            mood,
            confidence,
            timestamp_ms: unix_millis(),
            sequence: self.current.sequence + 1,
        };
        log::info!(
            "Mood {} -> {} (confidence {:.2})",
            self.current.mood,
            mood,
            confidence
        );
        if self.snapshots.len() >= self.config.snapshot_history.max(1) {
            self.snapshots.pop_front();
        }
        self.snapshots.push_back(snapshot);
        self.current = snapshot;
    }
}
