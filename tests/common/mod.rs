#![allow(dead_code)]

use std::f32::consts::PI;

use moodscope::Mood;

pub const SAMPLE_RATE: u32 = 22_050;

/// Deterministic noise source so every run renders the same audio.
pub struct XorShift(u64);

impl XorShift {
    pub fn new(seed: u64) -> Self {
        Self(seed.max(1).wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1)
    }

    /// Uniform in [-1, 1).
    pub fn next(&mut self) -> f32 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        ((self.0 >> 40) as f32 / (1u64 << 24) as f32) * 2.0 - 1.0
    }
}

pub fn sine(freq: f32, seconds: f32, amplitude: f32) -> Vec<f32> {
    let n = (seconds * SAMPLE_RATE as f32) as usize;
    (0..n)
        .map(|i| amplitude * (2.0 * PI * freq * i as f32 / SAMPLE_RATE as f32).sin())
        .collect()
}

fn partials(t: f32, freqs: &[f32], harmonics: usize) -> f32 {
    let mut s = 0.0;
    for &f in freqs {
        for k in 1..=harmonics {
            s += (2.0 * PI * f * k as f32 * t).sin() / k as f32;
        }
    }
    s / freqs.len() as f32
}

/// Envelope that peaks on each beat and decays over `decay` seconds.
fn pulse(t: f32, bpm: f32, decay: f32, floor: f32) -> f32 {
    let period = 60.0 / bpm;
    let phase = t % period;
    floor + (1.0 - floor) * (-phase / decay).exp()
}

/// Three seconds of audio in the style of `mood`. `variation` nudges pitch,
/// level and noise so no two renders are identical.
pub fn archetype(mood: Mood, variation: usize) -> Vec<f32> {
    let v = variation as f32;
    let detune = 1.0 + 0.004 * (v - 2.5);
    let level = 1.0 - 0.03 * v;
    let mut rng = XorShift::new(1 + mood.index() as u64 * 31 + variation as u64);
    let n = 3 * SAMPLE_RATE as usize;

    (0..n)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            let noise = rng.next();
            let s = match mood {
                Mood::Energetic => {
                    let chord = partials(t, &[440.0 * detune, 554.37 * detune, 659.26 * detune], 6);
                    let kick = (2.0 * PI * 60.0 * t).sin() * pulse(t, 140.0, 0.05, 0.0);
                    0.9 * (0.6 * chord * pulse(t, 140.0, 0.12, 0.5) + 0.4 * kick)
                }
                Mood::Relaxed => {
                    let pad = partials(t, &[110.0 * detune, 164.81 * detune], 1);
                    0.25 * pad * (0.8 + 0.2 * (2.0 * PI * 0.2 * t).sin())
                }
                Mood::Happy => {
                    let chord = partials(t, &[523.25 * detune, 659.26 * detune, 783.99 * detune], 3);
                    0.6 * chord * pulse(t, 120.0, 0.15, 0.1)
                }
                Mood::Melancholic => {
                    let chord = partials(t, &[220.0 * detune, 261.63 * detune, 329.63 * detune], 2);
                    0.3 * chord * pulse(t, 66.0, 0.6, 0.3)
                }
                Mood::Focused => 0.4 * (2.0 * PI * 1000.0 * detune * t).sin(),
                Mood::Romantic => {
                    let vibrato = 1.0 + 0.004 * (2.0 * PI * 5.0 * t).sin();
                    let chord = partials(
                        t * vibrato,
                        &[392.0 * detune, 493.88 * detune, 587.33 * detune, 739.99 * detune],
                        2,
                    );
                    0.35 * chord * pulse(t, 80.0, 0.4, 0.4)
                }
                Mood::Angry => {
                    let saw = partials(t, &[82.41 * detune], 12);
                    let raw = 0.6 * noise + 1.4 * saw * pulse(t, 160.0, 0.08, 0.6);
                    0.95 * raw.clamp(-0.8, 0.8) / 0.8
                }
                Mood::Neutral => {
                    let tones = partials(t, &[196.0 * detune, 246.94 * detune], 1);
                    0.05 * noise + 0.08 * tones
                }
            };
            s * level
        })
        .collect()
}
