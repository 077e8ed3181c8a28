use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};

use super::features::{MAX_TEMPO, MIN_TEMPO};
use super::spectral::hann_window;
use crate::ring::Ring;

const ONSET_FRAME: usize = 1024;
const ONSET_HOP: usize = 512;
/// Seconds of onset history kept for the autocorrelation.
const HISTORY_SECS: f32 = 12.0;
/// Minimum history before a tempo is reported.
const MIN_HISTORY_SECS: f32 = 2.0;
/// Envelope peak over its mean below which the signal is treated as steady.
const MIN_PEAK_TO_MEAN: f32 = 6.0;
/// Weight of the double-period correlation when scoring a lag.
const HARMONIC_WEIGHT: f32 = 0.5;
/// Tempo the log-Gaussian lag prior is centred on.
const PRIOR_BPM: f32 = 120.0;
/// Weakest correlation at the chosen lag that still counts as a beat.
const MIN_CORRELATION: f32 = 0.2;

/// Onset-strength envelope plus autocorrelation tempo estimate.
///
/// Samples are framed at `ONSET_FRAME` / `ONSET_HOP` independently of the
/// caller's buffer size, so streaming and whole-file input produce the same
/// envelope.
pub struct OnsetTracker {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    frame: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    pending: Vec<f32>,
    magnitude: Vec<f32>,
    prev_magnitude: Vec<f32>,
    has_prev: bool,
    onsets: Ring<f32>,
    envelope: Vec<f32>,
    sample_rate: u32,
}

impl OnsetTracker {
    pub fn new(sample_rate: u32) -> Self {
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(ONSET_FRAME);
        let scratch_len = fft.get_inplace_scratch_len();
        let capacity = (HISTORY_SECS * sample_rate as f32 / ONSET_HOP as f32).ceil() as usize;
        Self {
            fft,
            window: hann_window(ONSET_FRAME),
            frame: vec![Complex::new(0.0, 0.0); ONSET_FRAME],
            scratch: vec![Complex::new(0.0, 0.0); scratch_len],
            pending: Vec::with_capacity(ONSET_FRAME),
            magnitude: vec![0.0; ONSET_FRAME / 2],
            prev_magnitude: vec![0.0; ONSET_FRAME / 2],
            has_prev: false,
            onsets: Ring::new(capacity),
            envelope: Vec::with_capacity(capacity),
            sample_rate,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Onset envelope frames per second.
    pub fn frame_rate(&self) -> f32 {
        self.sample_rate as f32 / ONSET_HOP as f32
    }

    pub fn len(&self) -> usize {
        self.onsets.len()
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        self.onsets.clear();
        self.has_prev = false;
    }

    pub fn push(&mut self, samples: &[f32]) {
        for &s in samples {
            self.pending.push(s);
            if self.pending.len() == ONSET_FRAME {
                let strength = self.onset_strength();
                self.onsets.push(strength);
                self.pending.copy_within(ONSET_HOP.., 0);
                self.pending.truncate(ONSET_FRAME - ONSET_HOP);
            }
        }
    }

    /// Log-compressed positive spectral flux of the pending frame.
    fn onset_strength(&mut self) -> f32 {
        for (i, slot) in self.frame.iter_mut().enumerate() {
            *slot = Complex::new(self.pending[i] * self.window[i], 0.0);
        }
        self.fft.process_with_scratch(&mut self.frame, &mut self.scratch);
        for (m, c) in self.magnitude.iter_mut().zip(self.frame.iter()) {
            *m = (1.0 + 100.0 * c.norm()).ln();
        }
        let strength = if self.has_prev {
            self.magnitude
                .iter()
                .zip(self.prev_magnitude.iter())
                .map(|(c, p)| (c - p).max(0.0))
                .sum()
        } else {
            0.0
        };
        std::mem::swap(&mut self.magnitude, &mut self.prev_magnitude);
        self.has_prev = true;
        strength
    }

    /// Tempo in BPM from the autocorrelation of the onset envelope over the
    /// lag range for 60-200 BPM. `None` until enough history exists or when
    /// the envelope shows no periodicity.
    pub fn estimate_bpm(&mut self) -> Option<f32> {
        let rate = self.frame_rate();
        if (self.onsets.len() as f32) < MIN_HISTORY_SECS * rate {
            return None;
        }
        self.envelope.clear();
        self.envelope.extend(self.onsets.iter());
        autocorrelation_bpm(&mut self.envelope, rate)
    }
}

/// Normalizes `envelope` in place and picks the beat period.
///
/// The envelope is scaled by its mean, so the steadiness gate does not
/// depend on signal level. Each candidate lag is scored by its own
/// correlation plus half the correlation at twice the lag, weighted by a
/// log-Gaussian prior around 120 BPM; this keeps a clean pulse from being
/// read at half or double time. The winning lag is refined by a parabola
/// through its neighbours.
pub fn autocorrelation_bpm(envelope: &mut [f32], frame_rate: f32) -> Option<f32> {
    let n = envelope.len();
    let min_lag = (frame_rate * 60.0 / MAX_TEMPO).floor().max(1.0) as usize;
    let max_lag = ((frame_rate * 60.0 / MIN_TEMPO).ceil() as usize).min(n.saturating_sub(1) / 2);
    if min_lag >= max_lag {
        return None;
    }
    let mean = envelope.iter().sum::<f32>() / n as f32;
    if mean <= 1e-9 {
        return None;
    }
    let mut peak = 0.0f32;
    for v in envelope.iter_mut() {
        *v /= mean;
        peak = peak.max(*v);
    }
    if peak < MIN_PEAK_TO_MEAN {
        return None;
    }

    smooth(envelope);
    let mean = envelope.iter().sum::<f32>() / n as f32;
    for v in envelope.iter_mut() {
        *v -= mean;
    }
    let energy: f32 = envelope.iter().map(|v| v * v).sum::<f32>() / n as f32;
    if energy <= 0.0 {
        return None;
    }

    let envelope = &*envelope;
    let corr = |lag: usize| -> f32 {
        if lag >= n {
            return 0.0;
        }
        let terms = n - lag;
        envelope[..terms]
            .iter()
            .zip(envelope[lag..].iter())
            .map(|(a, b)| a * b)
            .sum::<f32>()
            / terms as f32
            / energy
    };

    let mut best_lag = min_lag;
    let mut best_score = f32::MIN;
    for lag in min_lag..=max_lag {
        let mut score = corr(lag);
        if 2 * lag < n {
            score += HARMONIC_WEIGHT * corr(2 * lag);
        }
        let octaves = (60.0 * frame_rate / lag as f32 / PRIOR_BPM).log2();
        score *= (-0.5 * octaves * octaves).exp();
        if score > best_score {
            best_score = score;
            best_lag = lag;
        }
    }
    let r = corr(best_lag);
    if r < MIN_CORRELATION {
        return None;
    }

    let mut offset = 0.0;
    if best_lag > min_lag && best_lag < max_lag {
        let (a, b, c) = (corr(best_lag - 1), r, corr(best_lag + 1));
        let curvature = a - 2.0 * b + c;
        if curvature.abs() > 1e-12 {
            offset = (0.5 * (a - c) / curvature).clamp(-0.5, 0.5);
        }
    }
    let bpm = 60.0 * frame_rate / (best_lag as f32 + offset);
    Some(bpm.clamp(MIN_TEMPO, MAX_TEMPO))
}

/// In-place [1, 2, 1] / 4 smoothing with clamped edges.
fn smooth(values: &mut [f32]) {
    let n = values.len();
    if n < 2 {
        return;
    }
    let mut prev = values[0];
    for i in 0..n {
        let cur = values[i];
        let next = values[(i + 1).min(n - 1)];
        values[i] = 0.25 * prev + 0.5 * cur + 0.25 * next;
        prev = cur;
    }
}
