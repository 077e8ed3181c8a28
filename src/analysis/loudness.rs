use super::features::{MAX_LOUDNESS, MIN_LOUDNESS};
use crate::ring::Ring;

const ABSOLUTE_GATE: f64 = -70.0;
const RELATIVE_GATE: f64 = -10.0;
const SUB_BLOCK_SECS: f64 = 0.1;
/// A gating block spans four sub-blocks (400 ms, 75% overlap).
const BLOCK_SUB_BLOCKS: usize = 4;

#[derive(Clone, Copy, Debug, Default)]
struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
    x1: f64,
    x2: f64,
    y1: f64,
    y2: f64,
}

impl Biquad {
    fn process(&mut self, x: f64) -> f64 {
        let y = self.b0 * x + self.b1 * self.x1 + self.b2 * self.x2 - self.a1 * self.y1 - self.a2 * self.y2;
        self.x2 = self.x1;
        self.x1 = x;
        self.y2 = self.y1;
        self.y1 = y;
        y
    }

    fn reset(&mut self) {
        self.x1 = 0.0;
        self.x2 = 0.0;
        self.y1 = 0.0;
        self.y2 = 0.0;
    }

    /// Head-related high shelf (+4 dB above ~1.7 kHz).
    fn k_shelf(sample_rate: f64) -> Self {
        let f0 = 1681.974450955533;
        let gain_db = 3.999843853973347;
        let q = 0.7071752369554196;
        let k = (std::f64::consts::PI * f0 / sample_rate).tan();
        let vh = 10f64.powf(gain_db / 20.0);
        let vb = vh.powf(0.4996667741545416);
        let a0 = 1.0 + k / q + k * k;
        Self {
            b0: (vh + vb * k / q + k * k) / a0,
            b1: 2.0 * (k * k - vh) / a0,
            b2: (vh - vb * k / q + k * k) / a0,
            a1: 2.0 * (k * k - 1.0) / a0,
            a2: (1.0 - k / q + k * k) / a0,
            ..Default::default()
        }
    }

    /// Second-order high-pass at ~38 Hz.
    fn k_highpass(sample_rate: f64) -> Self {
        let f0 = 38.13547087602444;
        let q = 0.5003270373238773;
        let k = (std::f64::consts::PI * f0 / sample_rate).tan();
        let a0 = 1.0 + k / q + k * k;
        Self {
            b0: 1.0,
            b1: -2.0,
            b2: 1.0,
            a1: 2.0 * (k * k - 1.0) / a0,
            a2: (1.0 - k / q + k * k) / a0,
            ..Default::default()
        }
    }
}

/// Gated, K-weighted loudness over a sliding window of 100 ms sub-blocks.
pub struct LoudnessMeter {
    shelf: Biquad,
    highpass: Biquad,
    sub_block_len: usize,
    acc: f64,
    acc_count: usize,
    sub_blocks: Ring<f64>,
}

impl LoudnessMeter {
    /// `window_secs` bounds the history used for gating.
    pub fn new(sample_rate: u32, window_secs: f32) -> Self {
        let sr = sample_rate as f64;
        let capacity = ((window_secs as f64 / SUB_BLOCK_SECS).ceil() as usize).max(BLOCK_SUB_BLOCKS);
        Self {
            shelf: Biquad::k_shelf(sr),
            highpass: Biquad::k_highpass(sr),
            sub_block_len: ((sr * SUB_BLOCK_SECS).round() as usize).max(1),
            acc: 0.0,
            acc_count: 0,
            sub_blocks: Ring::new(capacity),
        }
    }

    pub fn reset(&mut self) {
        self.shelf.reset();
        self.highpass.reset();
        self.acc = 0.0;
        self.acc_count = 0;
        self.sub_blocks.clear();
    }

    pub fn push(&mut self, samples: &[f32]) {
        for &s in samples {
            let y = self.highpass.process(self.shelf.process(s as f64));
            self.acc += y * y;
            self.acc_count += 1;
            if self.acc_count == self.sub_block_len {
                self.sub_blocks.push(self.acc / self.acc_count as f64);
                self.acc = 0.0;
                self.acc_count = 0;
            }
        }
    }

    /// Integrated loudness in LUFS, clamped to -70..0.
    ///
    /// Blocks below the absolute gate are dropped, then blocks more than
    /// 10 LU under the mean of the survivors. With less than one full block
    /// of history, everything measured so far forms a single block.
    pub fn integrated(&self) -> f32 {
        let n = self.sub_blocks.len();
        let lufs = if n < BLOCK_SUB_BLOCKS {
            let total: f64 = self.sub_blocks.iter().map(|ms| ms * self.sub_block_len as f64).sum::<f64>() + self.acc;
            let count = n * self.sub_block_len + self.acc_count;
            if count == 0 {
                return MIN_LOUDNESS;
            }
            let ms = total / count as f64;
            if block_loudness(ms) > ABSOLUTE_GATE {
                block_loudness(ms)
            } else {
                ABSOLUTE_GATE
            }
        } else {
            self.gated(n)
        };
        (lufs as f32).clamp(MIN_LOUDNESS, MAX_LOUDNESS)
    }

    fn block(&self, end: usize) -> f64 {
        let sum: f64 = (end + 1 - BLOCK_SUB_BLOCKS..=end)
            .filter_map(|i| self.sub_blocks.get(i))
            .sum();
        sum / BLOCK_SUB_BLOCKS as f64
    }

    fn gated(&self, n: usize) -> f64 {
        let blocks = BLOCK_SUB_BLOCKS - 1..n;

        let (mut sum, mut count) = (0.0f64, 0usize);
        for end in blocks.clone() {
            let ms = self.block(end);
            if block_loudness(ms) > ABSOLUTE_GATE {
                sum += ms;
                count += 1;
            }
        }
        if count == 0 {
            return ABSOLUTE_GATE;
        }
        let relative = block_loudness(sum / count as f64) + RELATIVE_GATE;

        let (mut sum, mut count) = (0.0f64, 0usize);
        for end in blocks {
            let ms = self.block(end);
            let l = block_loudness(ms);
            if l > ABSOLUTE_GATE && l > relative {
                sum += ms;
                count += 1;
            }
        }
        if count == 0 {
            return ABSOLUTE_GATE;
        }
        block_loudness(sum / count as f64)
    }
}

fn block_loudness(mean_square: f64) -> f64 {
    if mean_square <= 0.0 {
        return f64::NEG_INFINITY;
    }
    -0.691 + 10.0 * mean_square.log10()
}
