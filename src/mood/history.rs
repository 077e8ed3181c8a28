use super::Mood;
use crate::ring::Ring;

/// Recent (mood, confidence) samples for exponential smoothing. Storage is
/// fixed at construction.
#[derive(Debug, Clone)]
pub struct ProbabilityHistory {
    samples: Ring<(Mood, f32)>,
}

impl ProbabilityHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: Ring::new(capacity),
        }
    }

    pub fn push(&mut self, mood: Mood, confidence: f32) {
        self.samples.push((mood, confidence));
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Exponentially weighted confidence for `mood`: the newest sample
    /// weighs `alpha`, each older one `(1 - alpha)` times the next. Samples
    /// of other moods count as zero. Normalized by the weights present so a
    /// short history is not penalized.
    pub fn smoothed(&self, mood: Mood, alpha: f32) -> f32 {
        let alpha = alpha.clamp(f32::EPSILON, 1.0);
        let mut weight = alpha;
        let mut total = 0.0f32;
        let mut acc = 0.0f32;
        for (m, confidence) in self.samples.iter().rev() {
            if m == mood {
                acc += weight * confidence;
            }
            total += weight;
            weight *= 1.0 - alpha;
        }
        if total <= 0.0 {
            0.0
        } else {
            (acc / total).clamp(0.0, 1.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_sample_smooths_to_itself() {
        let mut h = ProbabilityHistory::new(8);
        h.push(Mood::Happy, 0.7);
        assert!((h.smoothed(Mood::Happy, 0.5) - 0.7).abs() < 1e-6);
        assert_eq!(h.smoothed(Mood::Angry, 0.5), 0.0);
    }

    #[test]
    fn recent_samples_weigh_more() {
        let mut h = ProbabilityHistory::new(8);
        h.push(Mood::Relaxed, 0.9);
        h.push(Mood::Happy, 0.9);
        // weights 0.5 (happy) and 0.25 (relaxed)
        assert!((h.smoothed(Mood::Happy, 0.5) - 0.6).abs() < 1e-5);
        assert!((h.smoothed(Mood::Relaxed, 0.5) - 0.3).abs() < 1e-5);
    }

    #[test]
    fn capacity_is_fixed() {
        let mut h = ProbabilityHistory::new(3);
        for _ in 0..10 {
            h.push(Mood::Focused, 1.0);
        }
        assert_eq!(h.len(), 3);
        h.clear();
        assert!(h.is_empty());
    }
}
