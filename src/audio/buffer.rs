use serde::{Deserialize, Serialize};

use crate::error::{AnalysisError, Result};

/// Encoding of the samples handed over by the capture subsystem. Pool
/// buffers always store `f32`; the tag records what was converted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleFormat {
    F32,
    I16,
    I32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Layout {
    Interleaved,
    Planar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufferFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub layout: Layout,
    pub sample_format: SampleFormat,
}

impl BufferFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            layout: Layout::Interleaved,
            sample_format: SampleFormat::F32,
        }
    }

    pub fn mono(sample_rate: u32) -> Self {
        Self::new(sample_rate, 1)
    }

    pub fn with_layout(mut self, layout: Layout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_sample_format(mut self, sample_format: SampleFormat) -> Self {
        self.sample_format = sample_format;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.channels == 0 || self.channels > 32 {
            return Err(AnalysisError::InvalidAudioFormat(format!(
                "unsupported channel count {}",
                self.channels
            )));
        }
        if !(8_000..=384_000).contains(&self.sample_rate) {
            return Err(AnalysisError::InvalidAudioFormat(format!(
                "unsupported sample rate {} Hz",
                self.sample_rate
            )));
        }
        Ok(())
    }
}

/// Fixed-capacity sample storage owned by a [`BufferPool`](super::pool::BufferPool).
///
/// `data` always holds `capacity * channels` samples; only the first
/// `frames` frames are valid. Ownership moves with the buffer, so a buffer
/// has at most one live checkout.
#[derive(Debug)]
pub struct AudioBuffer {
    pub(crate) id: u64,
    format: BufferFormat,
    frames: usize,
    capacity: usize,
    data: Vec<f32>,
}

impl AudioBuffer {
    /// Allocates zeroed storage, surfacing allocation failure instead of
    /// aborting.
    pub(crate) fn allocate(id: u64, format: BufferFormat, capacity: usize) -> Result<Self> {
        let len = capacity
            .checked_mul(format.channels as usize)
            .ok_or_else(|| AnalysisError::DeviceResourcesUnavailable("buffer size overflow".into()))?;
        let mut data = Vec::new();
        data.try_reserve_exact(len).map_err(|e| {
            AnalysisError::DeviceResourcesUnavailable(format!(
                "allocating {} samples: {}",
                len, e
            ))
        })?;
        data.resize(len, 0.0);
        Ok(Self {
            id,
            format,
            frames: 0,
            capacity,
            data,
        })
    }

    pub fn bytes_for(format: &BufferFormat, capacity: usize) -> usize {
        capacity * format.channels as usize * std::mem::size_of::<f32>()
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn format(&self) -> BufferFormat {
        self.format
    }

    pub fn sample_rate(&self) -> u32 {
        self.format.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.format.channels
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn bytes(&self) -> usize {
        Self::bytes_for(&self.format, self.capacity)
    }

    pub fn duration_secs(&self) -> f32 {
        self.frames as f32 / self.format.sample_rate as f32
    }

    /// Valid samples in the buffer's own layout.
    pub fn samples(&self) -> &[f32] {
        &self.data[..self.frames * self.format.channels as usize]
    }

    /// Re-targets a reused buffer at a new stream format. The channel count
    /// must match the buffer's storage.
    pub(crate) fn reset(&mut self, format: BufferFormat) {
        debug_assert_eq!(format.channels, self.format.channels);
        self.format = format;
        self.frames = 0;
    }

    pub(crate) fn clear(&mut self) {
        self.frames = 0;
    }

    fn check_fit(&self, frames: usize) -> Result<()> {
        if frames > self.capacity {
            return Err(AnalysisError::BufferProcessingFailed(format!(
                "{} frames exceed buffer capacity {}",
                frames, self.capacity
            )));
        }
        Ok(())
    }

    /// Copies interleaved `f32` frames; stored in the buffer's layout.
    pub fn write_interleaved(&mut self, samples: &[f32]) -> Result<usize> {
        self.write_converted(samples, |s| s)
    }

    pub fn write_interleaved_i16(&mut self, samples: &[i16]) -> Result<usize> {
        self.write_converted(samples, |s| s as f32 / 32768.0)
    }

    pub fn write_interleaved_i32(&mut self, samples: &[i32]) -> Result<usize> {
        self.write_converted(samples, |s| s as f32 / 2_147_483_648.0)
    }

    fn write_converted<T: Copy>(&mut self, samples: &[T], convert: impl Fn(T) -> f32) -> Result<usize> {
        let channels = self.format.channels as usize;
        if samples.len() % channels != 0 {
            return Err(AnalysisError::InvalidAudioFormat(format!(
                "{} samples is not a whole number of {}-channel frames",
                samples.len(),
                channels
            )));
        }
        let frames = samples.len() / channels;
        self.check_fit(frames)?;
        match self.format.layout {
            Layout::Interleaved => {
                for (dst, &src) in self.data.iter_mut().zip(samples) {
                    *dst = convert(src);
                }
            }
            Layout::Planar => {
                for (i, frame) in samples.chunks_exact(channels).enumerate() {
                    for (ch, &s) in frame.iter().enumerate() {
                        self.data[ch * self.capacity + i] = convert(s);
                    }
                }
            }
        }
        self.frames = frames;
        Ok(frames)
    }

    /// Copies one slice per channel.
    pub fn write_planar(&mut self, planes: &[&[f32]]) -> Result<usize> {
        let channels = self.format.channels as usize;
        if planes.len() != channels {
            return Err(AnalysisError::InvalidAudioFormat(format!(
                "expected {} planes, got {}",
                channels,
                planes.len()
            )));
        }
        let frames = planes.first().map_or(0, |p| p.len());
        if planes.iter().any(|p| p.len() != frames) {
            return Err(AnalysisError::InvalidAudioFormat("planes differ in length".into()));
        }
        self.check_fit(frames)?;
        for (ch, plane) in planes.iter().enumerate() {
            for (i, &s) in plane.iter().enumerate() {
                match self.format.layout {
                    Layout::Interleaved => self.data[i * channels + ch] = s,
                    Layout::Planar => self.data[ch * self.capacity + i] = s,
                }
            }
        }
        self.frames = frames;
        Ok(frames)
    }

    /// Downmixes the valid frames to mono into `out`, reusing its capacity.
    pub fn mono_into(&self, out: &mut Vec<f32>) {
        out.clear();
        let channels = self.format.channels as usize;
        if channels == 1 {
            out.extend_from_slice(&self.data[..self.frames]);
            return;
        }
        let scale = 1.0 / channels as f32;
        match self.format.layout {
            Layout::Interleaved => {
                out.extend(
                    self.data[..self.frames * channels]
                        .chunks_exact(channels)
                        .map(|frame| frame.iter().sum::<f32>() * scale),
                );
            }
            Layout::Planar => {
                out.extend((0..self.frames).map(|i| {
                    (0..channels)
                        .map(|ch| self.data[ch * self.capacity + i])
                        .sum::<f32>()
                        * scale
                }));
            }
        }
    }
}
