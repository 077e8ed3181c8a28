use super::features::{unit, AudioFeatures, Mode, SpectralFeatures, DEFAULT_TEMPO, MIN_LOUDNESS};
use super::key::ChromaAccumulator;
use super::loudness::LoudnessMeter;
use super::spectral::Spectrum;
use super::tempo::OnsetTracker;
use super::time_domain::TimeDomainStats;
use crate::audio::buffer::BufferFormat;
use crate::options::AnalysisOptions;

/// Centroid (Hz) treated as fully bright.
const BRIGHT_CENTROID: f32 = 5000.0;
const WIDE_SPREAD: f32 = 5000.0;
/// RMS treated as full energy.
const LOUD_RMS: f32 = 0.5;
const NOISY_ZCR: f32 = 0.25;
const SPEECH_ZCR: f32 = 0.15;
const FLUX_GAIN: f32 = 5.0;
const FLUX_EMA: f32 = 0.2;
/// Chroma decay per observed buffer; 1.0 would weigh the whole stream equally.
const CHROMA_DECAY: f32 = 0.98;
const LOUDNESS_WINDOW_SECS: f32 = 30.0;
/// With `LOW_LATENCY`, the tempo autocorrelation is refreshed every this many buffers.
const LOW_LATENCY_TEMPO_STRIDE: u32 = 8;

/// Turns per-buffer spectral and time-domain measurements into
/// [`AudioFeatures`].
///
/// Tempo, key and loudness need more context than one buffer, so the
/// aggregator keeps running state for them: callers [`observe`](Self::observe)
/// every buffer in capture order and [`derive`](Self::derive) whenever a
/// snapshot is wanted.
pub struct FeatureAggregator {
    sample_rate: u32,
    channels: u16,
    onsets: OnsetTracker,
    chroma: ChromaAccumulator,
    loudness: LoudnessMeter,
    flux_mean: f32,
    flux_dev: f32,
    observed: u32,
    frames: usize,
    tempo: Option<f32>,
    tempo_age: u32,
}

impl FeatureAggregator {
    pub fn new(sample_rate: u32) -> Self {
        let sample_rate = sample_rate.max(1);
        Self {
            sample_rate,
            channels: 1,
            onsets: OnsetTracker::new(sample_rate),
            chroma: ChromaAccumulator::new(CHROMA_DECAY),
            loudness: LoudnessMeter::new(sample_rate, LOUDNESS_WINDOW_SECS),
            flux_mean: 0.0,
            flux_dev: 0.0,
            observed: 0,
            frames: 0,
            tempo: None,
            tempo_age: 0,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Seconds of audio observed since the last reset.
    pub fn duration(&self) -> f32 {
        self.frames as f32 / self.sample_rate as f32
    }

    pub fn reset(&mut self) {
        self.onsets.reset();
        self.chroma.reset();
        self.loudness.reset();
        self.flux_mean = 0.0;
        self.flux_dev = 0.0;
        self.observed = 0;
        self.frames = 0;
        self.tempo = None;
        self.tempo_age = 0;
    }

    /// Feeds one buffer's worth of context. `mono` is the downmixed buffer
    /// and `spectrum` the power spectrum the analyzer produced for it.
    pub fn observe(
        &mut self,
        mono: &[f32],
        format: &BufferFormat,
        spectral: &SpectralFeatures,
        spectrum: Spectrum<'_>,
        options: AnalysisOptions,
    ) {
        if format.sample_rate != self.sample_rate && format.sample_rate > 0 {
            log::debug!(
                "Sample rate changed {} -> {} Hz, restarting aggregation",
                self.sample_rate,
                format.sample_rate
            );
            *self = Self::new(format.sample_rate);
        }
        self.channels = format.channels;

        if options.contains(AnalysisOptions::TEMPO) || options.contains(AnalysisOptions::RHYTHM) {
            self.onsets.push(mono);
        }
        if options.contains(AnalysisOptions::PITCH) {
            self.chroma.accumulate(spectrum);
        }
        if options.contains(AnalysisOptions::LOUDNESS) {
            self.loudness.push(mono);
        }

        let flux = spectral.flux;
        if self.observed == 0 {
            self.flux_mean = flux;
        } else {
            self.flux_dev += FLUX_EMA * ((flux - self.flux_mean).abs() - self.flux_dev);
            self.flux_mean += FLUX_EMA * (flux - self.flux_mean);
        }
        self.observed = self.observed.saturating_add(1);
        self.frames += mono.len();
    }

    /// Builds the feature snapshot. Stages not in `options` keep their
    /// defaults (120 BPM, C major, RMS-based loudness); every field is
    /// clamped into its range.
    pub fn derive(
        &mut self,
        spectral: &SpectralFeatures,
        stats: &TimeDomainStats,
        options: AnalysisOptions,
    ) -> AudioFeatures {
        let brightness = unit(spectral.centroid / BRIGHT_CENTROID);
        let peak_band = spectral.sub_bands.iter().copied().fold(0.0f32, f32::max);
        let contrast = unit((peak_band - 1.0 / 8.0) / (7.0 / 8.0));
        let flux_norm = unit(spectral.flux * FLUX_GAIN);
        let zcr_norm = unit(stats.zero_crossing_rate / NOISY_ZCR);
        let rms_norm = unit(stats.rms / LOUD_RMS);
        let tonal = if options.contains(AnalysisOptions::HARMONIC) {
            spectral.harmonic_ratio
        } else {
            1.0 - spectral.flatness
        };

        let energy = unit(
            0.35 * (spectral.bass + 0.6 * spectral.mid + 0.3 * spectral.treble) + 0.65 * rms_norm,
        );
        let valence = 0.4 * brightness + 0.35 * tonal + 0.25 * (1.0 - contrast);
        let danceability = 0.4 * flux_norm + 0.3 * (1.0 - zcr_norm) + 0.3 * energy;
        let acousticness = 0.4 * (1.0 - brightness)
            + 0.3 * (1.0 - unit(spectral.spread / WIDE_SPREAD))
            + 0.3 * (1.0 - spectral.flatness);
        let speechiness = unit(
            0.35 * unit(stats.zero_crossing_rate / SPEECH_ZCR)
                + 0.35 * spectral.mid * (1.0 - tonal)
                + 0.3 * spectral.flatness,
        );
        let instrumentalness = 0.6 * (1.0 - speechiness) + 0.4 * tonal;
        let liveness = 0.5 * stats.dynamic_range_norm() + 0.5 * unit(self.flux_dev * FLUX_GAIN);

        let tempo = if options.contains(AnalysisOptions::TEMPO) {
            self.tempo(options).unwrap_or(DEFAULT_TEMPO)
        } else {
            DEFAULT_TEMPO
        };
        let (key, mode) = if options.contains(AnalysisOptions::PITCH) {
            self.chroma.estimate().unwrap_or((0, Mode::Major))
        } else {
            (0, Mode::Major)
        };
        let loudness = if options.contains(AnalysisOptions::LOUDNESS) {
            self.loudness.integrated()
        } else {
            rms_loudness(stats.rms)
        };

        AudioFeatures {
            energy,
            valence,
            danceability,
            acousticness,
            instrumentalness,
            speechiness,
            liveness,
            tempo,
            key,
            mode,
            loudness,
            duration: self.duration(),
            sample_rate: self.sample_rate,
            channels: self.channels,
            spectral: *spectral,
            stages: options,
        }
        .clamped()
    }

    fn tempo(&mut self, options: AnalysisOptions) -> Option<f32> {
        let stale = self.tempo_age == 0 || self.tempo_age >= LOW_LATENCY_TEMPO_STRIDE;
        if !options.contains(AnalysisOptions::LOW_LATENCY) || stale {
            self.tempo = self.onsets.estimate_bpm();
            self.tempo_age = 0;
        }
        self.tempo_age += 1;
        self.tempo
    }
}

/// Unweighted loudness from RMS, used when the gated meter is skipped.
fn rms_loudness(rms: f32) -> f32 {
    if rms <= 0.0 {
        return MIN_LOUDNESS;
    }
    -0.691 + 20.0 * rms.log10()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::spectral::SpectralAnalyzer;

    fn run(samples: &[f32], sr: u32, options: AnalysisOptions) -> AudioFeatures {
        let mut analyzer = SpectralAnalyzer::new(16384, 0.85);
        let mut agg = FeatureAggregator::new(sr);
        let format = BufferFormat::mono(sr);
        let mut last = None;
        for chunk in samples.chunks(4096) {
            let spectral = analyzer.process_samples(chunk, sr).unwrap();
            agg.observe(chunk, &format, &spectral, analyzer.spectrum(), options);
            last = Some((spectral, TimeDomainStats::from_samples(chunk)));
        }
        let (spectral, stats) = last.unwrap();
        agg.derive(&spectral, &stats, options)
    }

    fn tone(freq: f32, amp: f32, secs: f32, sr: u32) -> Vec<f32> {
        (0..(secs * sr as f32) as usize)
            .map(|i| amp * (2.0 * std::f32::consts::PI * freq * i as f32 / sr as f32).sin())
            .collect()
    }

    fn pulses(bpm: f32, secs: f32, sr: u32) -> Vec<f32> {
        let beat = (60.0 / bpm * sr as f32) as usize;
        let mut state = 99u32;
        (0..(secs * sr as f32) as usize)
            .map(|i| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                let noise = (state >> 8) as f32 / (1u32 << 24) as f32 * 2.0 - 1.0;
                let since = (i % beat) as f32 / sr as f32;
                0.2 * (2.0 * std::f32::consts::PI * 220.0 * i as f32 / sr as f32).sin()
                    + 0.7 * noise * (-since * 30.0).exp()
            })
            .collect()
    }

    #[test]
    fn features_stay_in_range() {
        for audio in [tone(60.0, 1.0, 1.0, 44_100), tone(9000.0, 0.01, 1.0, 44_100), pulses(150.0, 3.0, 44_100)] {
            let f = run(&audio, 44_100, AnalysisOptions::COMPREHENSIVE);
            assert!(f.in_range(), "{:?}", f);
        }
    }

    #[test]
    fn skipped_stages_keep_defaults() {
        let f = run(&pulses(140.0, 4.0, 44_100), 44_100, AnalysisOptions::QUICK);
        assert_eq!(f.tempo, DEFAULT_TEMPO);
        assert_eq!((f.key, f.mode), (0, Mode::Major));
        assert_eq!(f.stages, AnalysisOptions::QUICK);
    }

    #[test]
    fn tempo_tracks_pulses() {
        let f = run(&pulses(140.0, 6.0, 44_100), 44_100, AnalysisOptions::STANDARD);
        assert!((f.tempo - 140.0).abs() < 7.0, "tempo {}", f.tempo);
    }

    #[test]
    fn louder_input_has_more_energy_and_loudness() {
        let loud = run(&tone(440.0, 0.8, 2.0, 44_100), 44_100, AnalysisOptions::COMPREHENSIVE);
        let quiet = run(&tone(440.0, 0.1, 2.0, 44_100), 44_100, AnalysisOptions::COMPREHENSIVE);
        assert!(loud.energy > quiet.energy);
        assert!(loud.loudness > quiet.loudness + 10.0);
    }

    #[test]
    fn bright_noise_is_less_acoustic_than_low_tone() {
        let mut state = 5u32;
        let hiss: Vec<f32> = (0..44_100)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                ((state >> 8) as f32 / (1u32 << 24) as f32 * 2.0 - 1.0) * 0.5
            })
            .collect();
        let noisy = run(&hiss, 44_100, AnalysisOptions::COMPREHENSIVE);
        let mellow = run(&tone(220.0, 0.5, 1.0, 44_100), 44_100, AnalysisOptions::COMPREHENSIVE);
        assert!(mellow.acousticness > noisy.acousticness);
        assert!(noisy.speechiness > mellow.speechiness);
    }

    #[test]
    fn reset_clears_duration_and_history() {
        let mut agg = FeatureAggregator::new(44_100);
        let audio = tone(440.0, 0.5, 0.5, 44_100);
        let mut analyzer = SpectralAnalyzer::new(16384, 0.85);
        let spectral = analyzer.process_samples(&audio, 44_100).unwrap();
        agg.observe(&audio, &BufferFormat::mono(44_100), &spectral, analyzer.spectrum(), AnalysisOptions::COMPREHENSIVE);
        assert!(agg.duration() > 0.49);
        agg.reset();
        assert_eq!(agg.duration(), 0.0);
    }
}
