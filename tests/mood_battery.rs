mod common;

use common::{archetype, SAMPLE_RATE};
use moodscope::mood::model::{FeatureVector, MoodModel, PrototypeModel};
use moodscope::mood::MoodClassifier;
use moodscope::{AnalysisContext, AnalysisOptions, AudioFeatures, Config, FileAnalyzer, Mood};

const TRAIN: std::ops::Range<usize> = 0..3;
const TEST: std::ops::Range<usize> = 3..6;

fn features_of(samples: &[f32]) -> AudioFeatures {
    let ctx = AnalysisContext::new(Config::default());
    let options = AnalysisOptions::COMPREHENSIVE.without(AnalysisOptions::MOOD | AnalysisOptions::CACHING);
    let mut analyzer = FileAnalyzer::new(ctx, Box::new(PrototypeModel::new(0.03)), options);
    let result = analyzer.analyze_samples(samples, SAMPLE_RATE, 1).unwrap();
    (*result.features).clone()
}

fn fitted_model() -> PrototypeModel {
    let mut examples = Vec::new();
    for mood in Mood::ALL {
        for v in TRAIN {
            let features = features_of(&archetype(mood, v));
            examples.push((mood, FeatureVector::from_features(&features)));
        }
    }
    PrototypeModel::from_examples(&examples, 0.03).unwrap()
}

#[test]
fn archetypes_produce_valid_features() {
    for mood in Mood::ALL {
        let features = features_of(&archetype(mood, 0));
        assert!(features.in_range(), "{}: {:?}", mood, features);
        assert!((features.duration - 3.0).abs() < 0.05);
    }
}

#[test]
fn fitted_model_classifies_the_battery() {
    let model = fitted_model();
    let mut correct = 0;
    let mut total = 0;
    let mut misses = Vec::new();
    for mood in Mood::ALL {
        for v in TEST {
            let features = features_of(&archetype(mood, v));
            let (predicted, _) = model.predict(&FeatureVector::from_features(&features)).unwrap().best();
            total += 1;
            if predicted == mood {
                correct += 1;
            } else {
                misses.push((mood, v, predicted));
            }
        }
    }
    let accuracy = correct as f32 / total as f32;
    assert!(accuracy >= 0.8, "accuracy {:.2}, misses {:?}", accuracy, misses);
}

#[test]
fn archetype_beats_are_read_at_their_tempo() {
    for (mood, bpm) in [
        (Mood::Energetic, 140.0),
        (Mood::Happy, 120.0),
        (Mood::Melancholic, 66.0),
        (Mood::Romantic, 80.0),
    ] {
        for v in [0, 5] {
            let tempo = features_of(&archetype(mood, v)).tempo;
            assert!((tempo - bpm).abs() < 3.0, "{} #{}: {} bpm", mood, v, tempo);
        }
    }
    // Sustained pads carry no beat and fall back to the default tempo.
    for mood in [Mood::Relaxed, Mood::Focused] {
        assert_eq!(features_of(&archetype(mood, 0)).tempo, 120.0, "{}", mood);
    }
}

#[test]
fn built_in_model_classifies_the_battery() {
    let mut model = PrototypeModel::new(Config::default().classifier.temperature);
    model.load().unwrap();
    let mut correct = 0;
    let mut total = 0;
    let mut misses = Vec::new();
    for mood in Mood::ALL {
        for v in TRAIN.start..TEST.end {
            let features = features_of(&archetype(mood, v));
            let (predicted, _) = model.predict(&FeatureVector::from_features(&features)).unwrap().best();
            total += 1;
            if predicted == mood {
                correct += 1;
            } else {
                misses.push((mood, v, predicted));
            }
        }
    }
    let accuracy = correct as f32 / total as f32;
    assert!(accuracy >= 0.8, "accuracy {:.2}, misses {:?}", accuracy, misses);
}

#[test]
fn classifier_settles_on_a_sustained_archetype() {
    let model = fitted_model();
    let mut classifier = MoodClassifier::new(Box::new(model), Config::default().classifier);
    let features = features_of(&archetype(Mood::Energetic, 4));
    for _ in 0..5 {
        classifier.infer(&features).unwrap();
    }
    let current = classifier.current();
    assert_eq!(current.mood, Mood::Energetic);
    assert_eq!(classifier.snapshots().len(), 1);
}
