use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};

use super::features::{SpectralFeatures, SUB_BANDS};
use crate::audio::buffer::AudioBuffer;
use crate::config::AnalysisConfig;
use crate::error::{AnalysisError, Result};

pub const MIN_FFT_SIZE: usize = 256;

/// Peak amplitude below which a buffer counts as silent (about -120 dBFS).
pub const SILENCE_FLOOR: f32 = 1e-6;

const BASS_BAND: (f32, f32) = (20.0, 250.0);
const MID_BAND: (f32, f32) = (250.0, 4000.0);
const TREBLE_BAND: (f32, f32) = (4000.0, 20000.0);
const FUNDAMENTAL_RANGE: (f32, f32) = (50.0, 2000.0);
const HARMONICS: usize = 10;
/// Half-width in bins of a Hann main lobe.
const LOBE_BINS: usize = 2;

/// View of the most recent power spectrum.
#[derive(Clone, Copy, Debug)]
pub struct Spectrum<'a> {
    /// |X_k|^2 for k in 0..n/2
    pub power: &'a [f32],
    pub bin_hz: f32,
}

/// Windowed FFT analysis of one buffer at a time.
///
/// Holds the FFT plan, window and scratch space across calls, so steady
/// state processing of equally sized buffers does not allocate. The
/// previous frame's normalized magnitudes are retained for spectral flux.
pub struct SpectralAnalyzer {
    planner: FftPlanner<f32>,
    fft: Option<Arc<dyn Fft<f32>>>,
    fft_size: usize,
    max_fft_size: usize,
    rolloff_percent: f32,
    window: Vec<f32>,
    frame: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    power: Vec<f32>,
    magnitude: Vec<f32>,
    prev_magnitude: Vec<f32>,
    has_prev: bool,
    mono: Vec<f32>,
    bin_hz: f32,
}

impl SpectralAnalyzer {
    pub fn new(max_fft_size: usize, rolloff_percent: f32) -> Self {
        Self {
            planner: FftPlanner::new(),
            fft: None,
            fft_size: 0,
            max_fft_size: max_fft_size.next_power_of_two().max(MIN_FFT_SIZE),
            rolloff_percent: rolloff_percent.clamp(0.01, 1.0),
            window: Vec::new(),
            frame: Vec::new(),
            scratch: Vec::new(),
            power: Vec::new(),
            magnitude: Vec::new(),
            prev_magnitude: Vec::new(),
            has_prev: false,
            mono: Vec::new(),
            bin_hz: 0.0,
        }
    }

    pub fn from_config(config: &AnalysisConfig) -> Self {
        Self::new(config.max_fft_size, config.rolloff_percent)
    }

    /// Radix-2 transform size for a buffer: the next power of two, bounded
    /// by `MIN_FFT_SIZE` and the configured maximum. Longer buffers are
    /// truncated to the maximum.
    pub fn fft_size_for(&self, frames: usize) -> usize {
        frames
            .next_power_of_two()
            .clamp(MIN_FFT_SIZE, self.max_fft_size)
    }

    /// Downmixes `buffer` and analyzes it; see [`process_samples`](Self::process_samples).
    pub fn process(&mut self, buffer: &AudioBuffer) -> Result<SpectralFeatures> {
        let mut mono = std::mem::take(&mut self.mono);
        buffer.mono_into(&mut mono);
        let result = self.process_samples(&mono, buffer.sample_rate());
        self.mono = mono;
        result
    }

    /// Mono samples of the last buffer passed to [`process`](Self::process).
    pub fn mono(&self) -> &[f32] {
        &self.mono
    }

    /// Analyzes one frame and updates the flux reference.
    pub fn process_samples(&mut self, samples: &[f32], sample_rate: u32) -> Result<SpectralFeatures> {
        let mut features = self.analyze_frame(samples, sample_rate)?;
        features.flux = if self.has_prev && self.prev_magnitude.len() == self.magnitude.len() {
            spectral_flux(&self.prev_magnitude, &self.magnitude)
        } else {
            0.0
        };
        std::mem::swap(&mut self.prev_magnitude, &mut self.magnitude);
        self.has_prev = true;
        Ok(features)
    }

    /// Forgets the flux reference frame.
    pub fn reset(&mut self) {
        self.has_prev = false;
    }

    /// Power spectrum of the last analyzed frame.
    pub fn spectrum(&self) -> Spectrum<'_> {
        Spectrum {
            power: &self.power,
            bin_hz: self.bin_hz,
        }
    }

    /// L1-normalized magnitudes of the last analyzed frame (the flux reference).
    pub fn normalized_magnitudes(&self) -> &[f32] {
        if self.has_prev {
            &self.prev_magnitude
        } else {
            &self.magnitude
        }
    }

    /// Normalized magnitudes left by the last [`analyze_frame`](Self::analyze_frame).
    pub fn frame_magnitudes(&self) -> &[f32] {
        &self.magnitude
    }

    /// Stateless part of the analysis: every descriptor except flux.
    /// Leaves the normalized magnitudes in `self.magnitude`.
    pub fn analyze_frame(&mut self, samples: &[f32], sample_rate: u32) -> Result<SpectralFeatures> {
        if samples.is_empty() {
            return Err(AnalysisError::InsufficientAudioData("empty buffer".into()));
        }
        if sample_rate == 0 {
            return Err(AnalysisError::InvalidAudioFormat("sample rate of 0 Hz".into()));
        }
        let peak = samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        if !peak.is_finite() {
            return Err(AnalysisError::InvalidAudioFormat("non-finite samples".into()));
        }
        if peak < SILENCE_FLOOR {
            return Err(AnalysisError::InsufficientAudioData("silent buffer".into()));
        }

        let n = self.fft_size_for(samples.len());
        let used = samples.len().min(n);
        self.prepare(n, used);

        for (i, slot) in self.frame.iter_mut().enumerate() {
            let s = if i < used { samples[i] * self.window[i] } else { 0.0 };
            *slot = Complex::new(s, 0.0);
        }
        if let Some(fft) = &self.fft {
            fft.process_with_scratch(&mut self.frame, &mut self.scratch);
        }

        let half = n / 2;
        self.bin_hz = sample_rate as f32 / n as f32;
        let mut total_power = 0.0f64;
        let mut magnitude_sum = 0.0f64;
        for k in 0..half {
            let p = self.frame[k].norm_sqr();
            self.power[k] = p;
            self.magnitude[k] = p.sqrt();
            total_power += p as f64;
            magnitude_sum += self.magnitude[k] as f64;
        }
        if total_power <= f64::MIN_POSITIVE || magnitude_sum <= 0.0 {
            return Err(AnalysisError::InsufficientAudioData("no spectral energy".into()));
        }

        let bin_hz = self.bin_hz as f64;
        let centroid = self
            .power
            .iter()
            .enumerate()
            .map(|(k, &p)| k as f64 * bin_hz * p as f64)
            .sum::<f64>()
            / total_power;
        let spread = (self
            .power
            .iter()
            .enumerate()
            .map(|(k, &p)| {
                let d = k as f64 * bin_hz - centroid;
                d * d * p as f64
            })
            .sum::<f64>()
            / total_power)
            .sqrt();

        let rolloff = {
            let threshold = total_power * self.rolloff_percent as f64;
            let mut cumulative = 0.0f64;
            let mut bin = half;
            for (k, &p) in self.power.iter().enumerate() {
                cumulative += p as f64;
                if cumulative >= threshold {
                    bin = k;
                    break;
                }
            }
            bin as f64 * bin_hz
        };

        let flatness = spectral_flatness(&self.magnitude[1..]);
        let (fundamental, harmonic_ratio) =
            harmonic_ratio(&self.power, self.bin_hz, total_power);

        let nyquist = sample_rate as f32 / 2.0;
        let bass = self.band_power(BASS_BAND.0, BASS_BAND.1);
        let mid = self.band_power(MID_BAND.0, MID_BAND.1);
        let treble = self.band_power(TREBLE_BAND.0, TREBLE_BAND.1.min(nyquist));
        let band_total = bass + mid + treble;
        let (bass, mid, treble) = if band_total > 0.0 {
            (bass / band_total, mid / band_total, treble / band_total)
        } else {
            (1.0 / 3.0, 1.0 / 3.0, 1.0 / 3.0)
        };

        let mut sub_bands = [0.0f32; SUB_BANDS];
        for (i, band) in sub_bands.iter_mut().enumerate() {
            let lo = i * half / SUB_BANDS;
            let hi = (i + 1) * half / SUB_BANDS;
            let p: f64 = self.power[lo..hi].iter().map(|&p| p as f64).sum();
            *band = (p / total_power) as f32;
        }

        let inv = (1.0 / magnitude_sum) as f32;
        for m in self.magnitude.iter_mut() {
            *m *= inv;
        }

        Ok(SpectralFeatures {
            centroid: centroid as f32,
            rolloff: rolloff as f32,
            flux: 0.0,
            flatness,
            spread: spread as f32,
            harmonic_ratio,
            fundamental,
            bass,
            mid,
            treble,
            sub_bands,
        })
    }

    fn band_power(&self, low_hz: f32, high_hz: f32) -> f32 {
        if self.bin_hz <= 0.0 || high_hz <= low_hz {
            return 0.0;
        }
        let low_bin = (low_hz / self.bin_hz).ceil() as usize;
        let high_bin = ((high_hz / self.bin_hz).ceil() as usize).min(self.power.len());
        if low_bin >= high_bin {
            return 0.0;
        }
        self.power[low_bin..high_bin].iter().sum()
    }

    fn prepare(&mut self, n: usize, used: usize) {
        if n != self.fft_size || self.fft.is_none() {
            let fft = self.planner.plan_fft_forward(n);
            self.scratch = vec![Complex::new(0.0, 0.0); fft.get_inplace_scratch_len()];
            self.frame = vec![Complex::new(0.0, 0.0); n];
            self.power = vec![0.0; n / 2];
            self.magnitude = vec![0.0; n / 2];
            self.prev_magnitude = vec![0.0; n / 2];
            self.fft = Some(fft);
            self.fft_size = n;
            self.has_prev = false;
            self.window.clear();
        }
        if self.window.len() != used {
            self.window = hann_window(used);
        }
    }
}

/// Sum of positive differences between two normalized magnitude spectra.
/// Both inputs sum to 1, so the result lies in [0, 1].
pub fn spectral_flux(prev: &[f32], current: &[f32]) -> f32 {
    if prev.len() != current.len() {
        return 0.0;
    }
    prev.iter()
        .zip(current.iter())
        .map(|(p, c)| (c - p).max(0.0))
        .sum::<f32>()
        .min(1.0)
}

/// Geometric over arithmetic mean; near 0 for pure tones, near 1 for noise.
pub fn spectral_flatness(magnitude: &[f32]) -> f32 {
    if magnitude.is_empty() {
        return 0.0;
    }
    const EPS: f64 = 1e-10;
    let n = magnitude.len() as f64;
    let log_mean = magnitude.iter().map(|&m| (m as f64 + EPS).ln()).sum::<f64>() / n;
    let arith = magnitude.iter().map(|&m| m as f64 + EPS).sum::<f64>() / n;
    if arith <= EPS {
        return 0.0;
    }
    (log_mean.exp() / arith).clamp(0.0, 1.0) as f32
}

/// Locates the strongest peak in the fundamental range, refines it by
/// parabolic interpolation, and sums the main-lobe power at each of its
/// harmonics.
fn harmonic_ratio(power: &[f32], bin_hz: f32, total_power: f64) -> (f32, f32) {
    let half = power.len();
    let lo = ((FUNDAMENTAL_RANGE.0 / bin_hz).floor() as usize).max(1);
    let hi = ((FUNDAMENTAL_RANGE.1 / bin_hz).ceil() as usize).min(half.saturating_sub(1));
    if lo >= hi {
        return (0.0, 0.0);
    }
    let Some((k0, _)) = power[lo..hi]
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, &p)| (i + lo, p))
    else {
        return (0.0, 0.0);
    };

    let (a, b, c) = (
        power[k0 - 1].max(1e-20).ln(),
        power[k0].max(1e-20).ln(),
        power[k0 + 1].max(1e-20).ln(),
    );
    let denom = a - 2.0 * b + c;
    let offset = if denom.abs() > 1e-12 {
        (0.5 * (a - c) / denom).clamp(-0.5, 0.5)
    } else {
        0.0
    };
    let f0_bin = k0 as f32 + offset;

    let mut harmonic = 0.0f64;
    let mut next_free = 0usize;
    for h in 1..=HARMONICS {
        let center = (f0_bin * h as f32).round() as usize;
        if center >= half {
            break;
        }
        let start = center.saturating_sub(LOBE_BINS).max(next_free);
        let end = (center + LOBE_BINS + 1).min(half);
        if start < end {
            harmonic += power[start..end].iter().map(|&p| p as f64).sum::<f64>();
            next_free = end;
        }
    }
    let ratio = (harmonic / total_power).clamp(0.0, 1.0) as f32;
    (f0_bin * bin_hz, ratio)
}

pub fn hann_window(size: usize) -> Vec<f32> {
    if size < 2 {
        return vec![1.0; size];
    }
    (0..size)
        .map(|i| {
            0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / (size - 1) as f32).cos())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::BufferFormat;

    fn sine(freq: f32, sr: u32, len: usize, amp: f32) -> Vec<f32> {
        (0..len)
            .map(|i| amp * (2.0 * std::f32::consts::PI * freq * i as f32 / sr as f32).sin())
            .collect()
    }

    fn noise(len: usize, seed: u32) -> Vec<f32> {
        let mut state = seed;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                (state >> 8) as f32 / (1u32 << 24) as f32 * 2.0 - 1.0
            })
            .collect()
    }

    #[test]
    fn empty_and_silent_buffers_are_insufficient() {
        let mut analyzer = SpectralAnalyzer::new(8192, 0.85);
        assert!(matches!(
            analyzer.process_samples(&[], 44_100),
            Err(AnalysisError::InsufficientAudioData(_))
        ));
        assert!(matches!(
            analyzer.process_samples(&[0.0; 4096], 44_100),
            Err(AnalysisError::InsufficientAudioData(_))
        ));
    }

    #[test]
    fn sine_centroid_and_fundamental_track_frequency() {
        let mut analyzer = SpectralAnalyzer::new(8192, 0.85);
        let f = analyzer
            .process_samples(&sine(1000.0, 44_100, 4096, 0.5), 44_100)
            .unwrap();
        assert!((f.centroid - 1000.0).abs() < 50.0, "centroid {}", f.centroid);
        assert!((f.fundamental - 1000.0).abs() < 10.0, "f0 {}", f.fundamental);
        assert!(f.harmonic_ratio > 0.9);
        assert!(f.flatness < 0.1);
        assert!(f.mid > 0.95);
        assert!((f.bass + f.mid + f.treble - 1.0).abs() < 1e-4);
        assert!((f.sub_bands.iter().sum::<f32>() - 1.0).abs() < 1e-3);
    }

    #[test]
    fn noise_is_flatter_and_less_harmonic_than_a_tone() {
        let mut analyzer = SpectralAnalyzer::new(8192, 0.85);
        let tone = analyzer.process_samples(&sine(440.0, 44_100, 4096, 0.5), 44_100).unwrap();
        analyzer.reset();
        let hiss = analyzer.process_samples(&noise(4096, 7), 44_100).unwrap();
        assert!(hiss.flatness > tone.flatness + 0.3);
        assert!(hiss.harmonic_ratio < tone.harmonic_ratio);
        assert!(hiss.centroid > tone.centroid);
        assert!(hiss.rolloff > 10_000.0);
    }

    #[test]
    fn processing_is_deterministic() {
        let samples = sine(523.25, 48_000, 4096, 0.3);
        let mut a = SpectralAnalyzer::new(8192, 0.85);
        let mut b = SpectralAnalyzer::new(8192, 0.85);
        assert_eq!(
            a.process_samples(&samples, 48_000).unwrap(),
            b.process_samples(&samples, 48_000).unwrap()
        );
    }

    #[test]
    fn flux_is_zero_for_repeated_frame_and_positive_on_change() {
        let mut analyzer = SpectralAnalyzer::new(8192, 0.85);
        let a = sine(440.0, 44_100, 4096, 0.5);
        let first = analyzer.process_samples(&a, 44_100).unwrap();
        assert_eq!(first.flux, 0.0);
        let again = analyzer.process_samples(&a, 44_100).unwrap();
        assert!(again.flux < 1e-4);
        let changed = analyzer.process_samples(&sine(3000.0, 44_100, 4096, 0.5), 44_100).unwrap();
        assert!(changed.flux > 0.5);
        assert!(changed.flux <= 1.0);
    }

    #[test]
    fn consecutive_frames_survive_size_changes() {
        let mut analyzer = SpectralAnalyzer::new(8192, 0.85);
        for len in [4096, 4096, 4096, 2048, 2048, 8192, 4096, 4096] {
            let f = analyzer.process_samples(&sine(440.0, 44_100, len, 0.5), 44_100).unwrap();
            assert!((f.fundamental - 440.0).abs() < 25.0, "{} frames: {}", len, f.fundamental);
            assert_eq!(analyzer.normalized_magnitudes().len(), analyzer.fft_size_for(len) / 2);
        }
        let first = analyzer.process_samples(&sine(440.0, 44_100, 2048, 0.5), 44_100).unwrap();
        assert_eq!(first.flux, 0.0);
        let second = analyzer.process_samples(&sine(440.0, 44_100, 2048, 0.5), 44_100).unwrap();
        assert!(second.flux < 1e-4);
    }

    #[test]
    fn odd_lengths_are_padded_and_long_ones_truncated() {
        let analyzer = SpectralAnalyzer::new(8192, 0.85);
        assert_eq!(analyzer.fft_size_for(3000), 4096);
        assert_eq!(analyzer.fft_size_for(10), MIN_FFT_SIZE);
        assert_eq!(analyzer.fft_size_for(100_000), 8192);

        let mut analyzer = SpectralAnalyzer::new(8192, 0.85);
        let f = analyzer.process_samples(&sine(440.0, 44_100, 3000, 0.5), 44_100).unwrap();
        assert!((f.fundamental - 440.0).abs() < 15.0);
    }

    #[test]
    fn buffer_entry_point_downmixes() {
        let mut buf = AudioBuffer::allocate(1, BufferFormat::new(44_100, 2), 2048).unwrap();
        let mono = sine(440.0, 44_100, 2048, 0.5);
        let stereo: Vec<f32> = mono.iter().flat_map(|&s| [s, s]).collect();
        buf.write_interleaved(&stereo).unwrap();
        let mut analyzer = SpectralAnalyzer::new(8192, 0.85);
        let from_buffer = analyzer.process(&buf).unwrap();
        assert_eq!(analyzer.mono().len(), 2048);
        let mut direct = SpectralAnalyzer::new(8192, 0.85);
        assert_eq!(from_buffer, direct.process_samples(&mono, 44_100).unwrap());
    }

    #[test]
    fn low_tone_lands_in_bass() {
        let mut analyzer = SpectralAnalyzer::new(8192, 0.85);
        let f = analyzer.process_samples(&sine(100.0, 44_100, 8192, 0.5), 44_100).unwrap();
        assert!(f.bass > 0.9, "bass {}", f.bass);
    }
}
