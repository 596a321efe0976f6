//! The sample buffer type shared by the store, the transform registry, and
//! the consumer-facing `Sound` object
//!
//! A `Waveform` is an interleaved `Vec<f32>` with a channel count and a
//! sample rate. The methods here are the pure buffer operations that
//! transforms replay during reconstruction: they never touch the store and
//! never allocate identities.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{LineageError, Result};

/// dB SPL reference pressure (RMS), assuming samples are in Pascals.
pub const DB_REFERENCE: f64 = 2e-5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waveform {
    /// Interleaved sample data, `nframes * channels` long.
    pub data: Vec<f32>,
    pub channels: usize,
    pub sample_rate: f32,
}

impl Waveform {
    pub fn new(data: Vec<f32>, channels: usize, sample_rate: f32) -> Result<Self> {
        if channels == 0 {
            return Err(LineageError::BadParameter(
                "waveform must have at least one channel".to_string(),
            ));
        }
        if sample_rate <= 0.0 {
            return Err(LineageError::BadParameter(format!(
                "sample rate must be positive, got {}",
                sample_rate
            )));
        }
        if data.len() % channels != 0 {
            return Err(LineageError::BadParameter(format!(
                "{} samples do not divide into {} channels",
                data.len(),
                channels
            )));
        }
        Ok(Self {
            data,
            channels,
            sample_rate,
        })
    }

    pub fn mono(data: Vec<f32>, sample_rate: f32) -> Result<Self> {
        Self::new(data, 1, sample_rate)
    }

    /// A silent buffer of the given duration.
    pub fn silence(duration: f64, sample_rate: f32, channels: usize) -> Result<Self> {
        let nframes = (duration * sample_rate as f64).round() as usize;
        Self::new(vec![0.0; nframes * channels], channels, sample_rate)
    }

    /// A silent buffer with this buffer's exact shape.
    pub fn silence_like(&self) -> Self {
        Self {
            data: vec![0.0; self.data.len()],
            channels: self.channels,
            sample_rate: self.sample_rate,
        }
    }

    pub fn nframes(&self) -> usize {
        self.data.len() / self.channels
    }

    /// Duration in seconds.
    pub fn duration(&self) -> f64 {
        self.nframes() as f64 / self.sample_rate as f64
    }

    pub fn nyquist(&self) -> f64 {
        self.sample_rate as f64 / 2.0
    }

    /// Nearest sample boundary for a time in seconds.
    pub fn frame_at(&self, time: f64) -> usize {
        (time * self.sample_rate as f64).round() as usize
    }

    pub fn is_silent(&self) -> bool {
        self.data.iter().all(|&v| v == 0.0)
    }

    pub fn slice_frames(&self, start: usize, stop: usize) -> Result<Self> {
        if start > stop || stop > self.nframes() {
            return Err(LineageError::BadParameter(format!(
                "slice range {}..{} out of bounds for {} frames",
                start,
                stop,
                self.nframes()
            )));
        }
        Ok(Self {
            data: self.data[start * self.channels..stop * self.channels].to_vec(),
            channels: self.channels,
            sample_rate: self.sample_rate,
        })
    }

    pub fn slice_time(&self, start: f64, stop: f64) -> Result<Self> {
        self.slice_frames(self.frame_at(start), self.frame_at(stop))
    }

    /// Pad with silence to `duration` seconds total, this buffer starting at
    /// `start` seconds.
    pub fn pad(&self, duration: f64, start: f64) -> Result<Self> {
        let total = (duration * self.sample_rate as f64).round() as usize;
        let offset = self.frame_at(start);
        if offset + self.nframes() > total {
            return Err(LineageError::BadParameter(format!(
                "pad: {} frames at offset {} do not fit in {} frames",
                self.nframes(),
                offset,
                total
            )));
        }
        let mut data = vec![0.0; total * self.channels];
        let begin = offset * self.channels;
        data[begin..begin + self.data.len()].copy_from_slice(&self.data);
        Ok(Self {
            data,
            channels: self.channels,
            sample_rate: self.sample_rate,
        })
    }

    pub fn clip(&self, min_value: f32, max_value: f32) -> Self {
        Self {
            data: self
                .data
                .iter()
                .map(|&v| v.clamp(min_value, max_value))
                .collect(),
            channels: self.channels,
            sample_rate: self.sample_rate,
        }
    }

    pub fn scale(&self, coefficient: f32) -> Self {
        Self {
            data: self.data.iter().map(|&v| v * coefficient).collect(),
            channels: self.channels,
            sample_rate: self.sample_rate,
        }
    }

    /// Sample-wise sum. Durations and shapes must match exactly; tiling the
    /// shorter operand is never the right default for lineage tracking.
    pub fn add(&self, other: &Waveform) -> Result<Self> {
        if self.nframes() != other.nframes() || self.channels != other.channels {
            return Err(LineageError::DurationMismatch(format!(
                "cannot add {}x{} to {}x{}",
                self.nframes(),
                self.channels,
                other.nframes(),
                other.channels
            )));
        }
        Ok(Self {
            data: self
                .data
                .iter()
                .zip(other.data.iter())
                .map(|(&a, &b)| a + b)
                .collect(),
            channels: self.channels,
            sample_rate: self.sample_rate,
        })
    }

    /// Replace the span `start..stop` (seconds) with `other`, which must
    /// cover exactly that many frames.
    pub fn replace_range(&self, start: f64, stop: f64, other: &Waveform) -> Result<Self> {
        let begin = self.frame_at(start);
        let end = self.frame_at(stop);
        if begin > end || end > self.nframes() {
            return Err(LineageError::BadParameter(format!(
                "replace range {}..{} out of bounds for {} frames",
                begin,
                end,
                self.nframes()
            )));
        }
        if end - begin != other.nframes() || self.channels != other.channels {
            return Err(LineageError::DurationMismatch(format!(
                "replacement covers {} frames but the span is {}",
                other.nframes(),
                end - begin
            )));
        }
        let mut data = self.data.clone();
        data[begin * self.channels..end * self.channels].copy_from_slice(&other.data);
        Ok(Self {
            data,
            channels: self.channels,
            sample_rate: self.sample_rate,
        })
    }

    /// Average the channels down to one.
    pub fn to_mono(&self) -> Self {
        if self.channels == 1 {
            return self.clone();
        }
        let data = self
            .data
            .chunks(self.channels)
            .map(|frame| frame.iter().sum::<f32>() / self.channels as f32)
            .collect();
        Self {
            data,
            channels: 1,
            sample_rate: self.sample_rate,
        }
    }

    /// Extract one channel.
    pub fn channel(&self, n: usize) -> Result<Self> {
        if n >= self.channels {
            return Err(LineageError::BadParameter(format!(
                "channel {} out of range for {} channels",
                n, self.channels
            )));
        }
        let data = self
            .data
            .chunks(self.channels)
            .map(|frame| frame[n])
            .collect();
        Ok(Self {
            data,
            channels: 1,
            sample_rate: self.sample_rate,
        })
    }

    /// RMS level in dB SPL, assuming samples are in Pascals.
    pub fn level_db(&self) -> f64 {
        let n = self.data.len().max(1);
        let mean_square =
            self.data.iter().map(|&v| v as f64 * v as f64).sum::<f64>() / n as f64;
        10.0 * (mean_square / (DB_REFERENCE * DB_REFERENCE)).log10()
    }
}

/// Read a WAV file into an interleaved buffer. Integer formats are
/// normalized to [-1, 1); float samples pass through untouched.
pub fn load_wav<P: AsRef<Path>>(path: P) -> Result<Waveform> {
    let reader = hound::WavReader::open(path.as_ref())
        .map_err(|e| LineageError::Encoding(format!("{}: {}", path.as_ref().display(), e)))?;
    let spec = reader.spec();
    let data: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| LineageError::Encoding(e.to_string()))?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| LineageError::Encoding(e.to_string()))?
        }
    };
    Waveform::new(data, spec.channels as usize, spec.sample_rate as f32)
}

/// Write a buffer as a 32-bit float WAV file.
pub fn save_wav<P: AsRef<Path>>(wave: &Waveform, path: P) -> Result<()> {
    let spec = hound::WavSpec {
        channels: wave.channels as u16,
        sample_rate: wave.sample_rate as u32,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(path.as_ref(), spec)
        .map_err(|e| LineageError::Encoding(format!("{}: {}", path.as_ref().display(), e)))?;
    for &sample in &wave.data {
        writer
            .write_sample(sample)
            .map_err(|e| LineageError::Encoding(e.to_string()))?;
    }
    writer
        .finalize()
        .map_err(|e| LineageError::Encoding(e.to_string()))?;
    Ok(())
}
