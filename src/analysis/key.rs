use super::features::Mode;
use super::spectral::Spectrum;

const MIN_PITCH_HZ: f32 = 55.0;
const MAX_PITCH_HZ: f32 = 5000.0;

/// Chroma vector accumulated across frames, one bin per pitch class.
pub struct ChromaAccumulator {
    chroma: [f32; 12],
    /// Multiplier applied to the running chroma before each frame; 1.0 keeps
    /// the whole history, lower values favour recent frames.
    decay: f32,
    bin_classes: Vec<i8>,
    mapped_bins: usize,
    mapped_bin_hz: f32,
}

impl ChromaAccumulator {
    pub fn new(decay: f32) -> Self {
        Self {
            chroma: [0.0; 12],
            decay: decay.clamp(0.0, 1.0),
            bin_classes: Vec::new(),
            mapped_bins: 0,
            mapped_bin_hz: 0.0,
        }
    }

    pub fn reset(&mut self) {
        self.chroma = [0.0; 12];
    }

    pub fn chroma(&self) -> &[f32; 12] {
        &self.chroma
    }

    /// Folds one power spectrum into the chroma vector, weighting each bin
    /// by its magnitude.
    pub fn accumulate(&mut self, spectrum: Spectrum<'_>) {
        if spectrum.power.is_empty() || spectrum.bin_hz <= 0.0 {
            return;
        }
        self.map_bins(spectrum.power.len(), spectrum.bin_hz);
        for c in self.chroma.iter_mut() {
            *c *= self.decay;
        }
        for (&p, &class) in spectrum.power.iter().zip(self.bin_classes.iter()) {
            if class >= 0 {
                self.chroma[class as usize] += p.sqrt();
            }
        }
    }

    /// Dominant pitch class plus a mode chosen by comparing the major third
    /// against the minor third above it.
    pub fn estimate(&self) -> Option<(u8, Mode)> {
        let total: f32 = self.chroma.iter().sum();
        if total <= 0.0 || !total.is_finite() {
            return None;
        }
        let (key, _) = self
            .chroma
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))?;
        let major_third = self.chroma[(key + 4) % 12];
        let minor_third = self.chroma[(key + 3) % 12];
        let mode = if major_third >= minor_third {
            Mode::Major
        } else {
            Mode::Minor
        };
        Some((key as u8, mode))
    }

    fn map_bins(&mut self, bins: usize, bin_hz: f32) {
        if bins == self.mapped_bins && bin_hz == self.mapped_bin_hz {
            return;
        }
        self.bin_classes.clear();
        self.bin_classes.extend((0..bins).map(|k| pitch_class(k as f32 * bin_hz)));
        self.mapped_bins = bins;
        self.mapped_bin_hz = bin_hz;
    }
}

/// Pitch class of a frequency (0 = C), or -1 outside the tracked range.
pub fn pitch_class(freq: f32) -> i8 {
    if !(MIN_PITCH_HZ..=MAX_PITCH_HZ).contains(&freq) {
        return -1;
    }
    let midi = 69.0 + 12.0 * (freq / 440.0).log2();
    (midi.round() as i32).rem_euclid(12) as i8
}
