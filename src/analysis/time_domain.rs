use serde::{Deserialize, Serialize};

/// Crest factor (dB) mapped to 1.0.
const MAX_CREST_DB: f32 = 20.0;

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeDomainStats {
    pub rms: f32,
    pub peak: f32,
    /// Fraction of adjacent sample pairs with opposite sign (0.0-1.0)
    pub zero_crossing_rate: f32,
    /// Crest factor in dB (peak over RMS)
    pub dynamic_range: f32,
    pub frames: usize,
}

impl TimeDomainStats {
    pub fn from_samples(samples: &[f32]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let mut sum_sq = 0.0f64;
        let mut peak = 0.0f32;
        let mut crossings = 0usize;
        for (i, &s) in samples.iter().enumerate() {
            sum_sq += (s as f64) * (s as f64);
            peak = peak.max(s.abs());
            if i > 0 && (samples[i - 1] >= 0.0) != (s >= 0.0) {
                crossings += 1;
            }
        }
        let rms = (sum_sq / samples.len() as f64).sqrt() as f32;
        let zero_crossing_rate = if samples.len() > 1 {
            crossings as f32 / (samples.len() - 1) as f32
        } else {
            0.0
        };
        let dynamic_range = if rms > 1e-9 {
            (20.0 * (peak / rms).log10()).max(0.0)
        } else {
            0.0
        };
        Self {
            rms,
            peak,
            zero_crossing_rate,
            dynamic_range,
            frames: samples.len(),
        }
    }

    /// Crest factor scaled to 0.0-1.0.
    pub fn dynamic_range_norm(&self) -> f32 {
        (self.dynamic_range / MAX_CREST_DB).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sine_statistics() {
        let samples: Vec<f32> = (0..44_100)
            .map(|i| 0.5 * (2.0 * std::f32::consts::PI * 441.0 * i as f32 / 44_100.0).sin())
            .collect();
        let stats = TimeDomainStats::from_samples(&samples);
        assert!((stats.rms - 0.5 / 2f32.sqrt()).abs() < 1e-3);
        assert!((stats.peak - 0.5).abs() < 1e-3);
        // Two crossings per cycle.
        assert!((stats.zero_crossing_rate - 2.0 * 441.0 / 44_100.0).abs() < 1e-3);
        assert!((stats.dynamic_range - 3.01).abs() < 0.05);
    }

    #[test]
    fn alternating_signal_crosses_every_sample() {
        let samples: Vec<f32> = (0..100).map(|i| if i % 2 == 0 { 0.5 } else { -0.5 }).collect();
        let stats = TimeDomainStats::from_samples(&samples);
        assert_eq!(stats.zero_crossing_rate, 1.0);
        assert_eq!(stats.dynamic_range, 0.0);
    }

    #[test]
    fn empty_input_is_all_zero() {
        assert_eq!(TimeDomainStats::from_samples(&[]), TimeDomainStats::default());
    }
}
