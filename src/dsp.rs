//! Pure signal-processing helpers used by the transform registry
//!
//! Everything here is a deterministic function of its inputs: buffers in,
//! buffers out, no store access. Noise generators take an explicit seed so
//! replaying a Create transform regenerates the same samples.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{LineageError, Result};
use crate::waveform::Waveform;

/// Filter shape derived from a (min, max) frequency pair, `max` bounded by
/// the Nyquist frequency.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FilterBand {
    Lowpass(f64),
    Highpass(f64),
    Bandpass(f64, f64),
    /// The full band: nothing to do.
    AllPass,
}

impl FilterBand {
    pub fn from_range(min_frequency: f64, max_frequency: f64, nyquist: f64) -> Result<Self> {
        if max_frequency > nyquist {
            return Err(LineageError::BadParameter(format!(
                "max frequency {} exceeds the nyquist frequency {}",
                max_frequency, nyquist
            )));
        }
        if min_frequency < 0.0 || min_frequency >= max_frequency {
            return Err(LineageError::BadParameter(format!(
                "invalid frequency range {}..{}",
                min_frequency, max_frequency
            )));
        }
        if min_frequency == 0.0 {
            if max_frequency < nyquist {
                Ok(FilterBand::Lowpass(max_frequency))
            } else {
                Ok(FilterBand::AllPass)
            }
        } else if max_frequency == nyquist {
            Ok(FilterBand::Highpass(min_frequency))
        } else {
            Ok(FilterBand::Bandpass(min_frequency, max_frequency))
        }
    }
}

/// Default filter order for a buffer length: large orders for long buffers,
/// small ones for short, never more than a third of the samples.
pub fn default_filter_order(nframes: usize) -> usize {
    if nframes > 3 * 512 {
        512
    } else if nframes > 3 * 64 {
        64
    } else {
        16
    }
}

fn sinc(x: f64) -> f64 {
    if x == 0.0 {
        1.0
    } else {
        let px = std::f64::consts::PI * x;
        px.sin() / px
    }
}

/// Hamming-windowed sinc lowpass prototype. `cutoff` is normalized to the
/// Nyquist frequency (0..1).
fn lowpass_taps(ntaps: usize, cutoff: f64) -> Vec<f64> {
    let mid = (ntaps - 1) as f64 / 2.0;
    (0..ntaps)
        .map(|i| {
            let n = i as f64 - mid;
            let window = 0.54
                - 0.46 * (2.0 * std::f64::consts::PI * i as f64 / (ntaps - 1) as f64).cos();
            cutoff * sinc(cutoff * n) * window
        })
        .collect()
}

/// FIR design for the given band. Tap count is `order`, forced odd so the
/// highpass spectral inversion has a center tap.
pub fn design_fir(band: FilterBand, nyquist: f64, order: usize) -> Result<Vec<f64>> {
    let ntaps = if order % 2 == 0 { order + 1 } else { order };
    if ntaps < 3 {
        return Err(LineageError::BadParameter(format!(
            "filter order {} is too small",
            order
        )));
    }
    let taps = match band {
        FilterBand::AllPass => {
            let mut taps = vec![0.0; ntaps];
            taps[(ntaps - 1) / 2] = 1.0;
            taps
        }
        FilterBand::Lowpass(cut) => lowpass_taps(ntaps, cut / nyquist),
        FilterBand::Highpass(cut) => {
            // Spectral inversion of the complementary lowpass
            let mut taps = lowpass_taps(ntaps, cut / nyquist);
            for t in taps.iter_mut() {
                *t = -*t;
            }
            taps[(ntaps - 1) / 2] += 1.0;
            taps
        }
        FilterBand::Bandpass(lo, hi) => {
            let upper = lowpass_taps(ntaps, hi / nyquist);
            let lower = lowpass_taps(ntaps, lo / nyquist);
            upper
                .into_iter()
                .zip(lower)
                .map(|(u, l)| u - l)
                .collect()
        }
    };
    Ok(taps)
}

fn fir_pass(taps: &[f64], input: &[f64]) -> Vec<f64> {
    let mut output = vec![0.0; input.len()];
    for (n, out) in output.iter_mut().enumerate() {
        let mut acc = 0.0;
        for (k, &b) in taps.iter().enumerate() {
            if k > n {
                break;
            }
            acc += b * input[n - k];
        }
        *out = acc;
    }
    output
}

/// Zero-phase filtering: run the FIR forward, then backward, per channel.
pub fn filtfilt(wave: &Waveform, taps: &[f64]) -> Waveform {
    let mut out = wave.clone();
    for ch in 0..wave.channels {
        let samples: Vec<f64> = wave
            .data
            .iter()
            .skip(ch)
            .step_by(wave.channels)
            .map(|&v| v as f64)
            .collect();
        let forward = fir_pass(taps, &samples);
        let mut reversed: Vec<f64> = forward.into_iter().rev().collect();
        reversed = fir_pass(taps, &reversed);
        reversed.reverse();
        for (frame, &v) in reversed.iter().enumerate() {
            out.data[frame * wave.channels + ch] = v as f32;
        }
    }
    out
}

/// Bandlimit a waveform with a zero-phase FIR designed from the frequency
/// range. Returns the input unchanged for an all-pass range.
pub fn fir_filter(
    wave: &Waveform,
    min_frequency: f64,
    max_frequency: f64,
    order: usize,
) -> Result<Waveform> {
    if order * 3 >= wave.nframes() {
        return Err(LineageError::BadParameter(format!(
            "filter order cannot exceed a third of the buffer: 3 * {} >= {}",
            order,
            wave.nframes()
        )));
    }
    let band = FilterBand::from_range(min_frequency, max_frequency, wave.nyquist())?;
    if band == FilterBand::AllPass {
        return Ok(wave.clone());
    }
    let taps = design_fir(band, wave.nyquist(), order)?;
    Ok(filtfilt(wave, &taps))
}

/// Linear-interpolation resampling to a new sample rate.
pub fn resample(wave: &Waveform, new_rate: f32) -> Result<Waveform> {
    if new_rate <= 0.0 {
        return Err(LineageError::BadParameter(format!(
            "resample rate must be positive, got {}",
            new_rate
        )));
    }
    let out_frames = (wave.duration() * new_rate as f64).round() as usize;
    let step = wave.sample_rate as f64 / new_rate as f64;
    let in_frames = wave.nframes();
    let mut data = Vec::with_capacity(out_frames * wave.channels);
    for frame in 0..out_frames {
        let pos = frame as f64 * step;
        let i0 = pos.floor() as usize;
        let frac = (pos - i0 as f64) as f32;
        let i1 = (i0 + 1).min(in_frames.saturating_sub(1));
        for ch in 0..wave.channels {
            let a = wave.data[i0.min(in_frames - 1) * wave.channels + ch];
            let b = wave.data[i1 * wave.channels + ch];
            data.push(a + (b - a) * frac);
        }
    }
    Waveform::new(data, wave.channels, new_rate)
}

/// A pure sine tone.
pub fn tone(frequency: f64, duration: f64, sample_rate: f32, channels: usize) -> Result<Waveform> {
    let nframes = (duration * sample_rate as f64).round() as usize;
    let mut data = Vec::with_capacity(nframes * channels);
    for frame in 0..nframes {
        let t = frame as f64 / sample_rate as f64;
        let v = (2.0 * std::f64::consts::PI * frequency * t).sin() as f32;
        for _ in 0..channels {
            data.push(v);
        }
    }
    Waveform::new(data, channels, sample_rate)
}

/// Uniform white noise in [-1, 1), regenerated exactly by the same seed.
pub fn white_noise(
    duration: f64,
    sample_rate: f32,
    channels: usize,
    seed: u64,
) -> Result<Waveform> {
    let nframes = (duration * sample_rate as f64).round() as usize;
    let mut rng = StdRng::seed_from_u64(seed);
    let data = (0..nframes * channels)
        .map(|_| rng.gen_range(-1.0..1.0))
        .collect();
    Waveform::new(data, channels, sample_rate)
}

/// Raised-cosine (`sin(pi*t/2)^2`) onset/offset ramp.
pub fn ramp(wave: &Waveform, onset: bool, offset: bool, ramp_duration: f64) -> Waveform {
    let ramp_frames = ((ramp_duration * wave.sample_rate as f64).round() as usize)
        .min(wave.nframes());
    let mut out = wave.clone();
    let nframes = wave.nframes();
    for i in 0..ramp_frames {
        let t = i as f64 / ramp_frames as f64;
        let gain = (std::f64::consts::FRAC_PI_2 * t).sin().powi(2) as f32;
        if onset {
            for ch in 0..wave.channels {
                out.data[i * wave.channels + ch] *= gain;
            }
        }
        if offset {
            let frame = nframes - 1 - i;
            for ch in 0..wave.channels {
                out.data[frame * wave.channels + ch] *= gain;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_band_selection() {
        assert_eq!(
            FilterBand::from_range(0.0, 1000.0, 22050.0).unwrap(),
            FilterBand::Lowpass(1000.0)
        );
        assert_eq!(
            FilterBand::from_range(500.0, 22050.0, 22050.0).unwrap(),
            FilterBand::Highpass(500.0)
        );
        assert_eq!(
            FilterBand::from_range(500.0, 1000.0, 22050.0).unwrap(),
            FilterBand::Bandpass(500.0, 1000.0)
        );
        assert_eq!(
            FilterBand::from_range(0.0, 22050.0, 22050.0).unwrap(),
            FilterBand::AllPass
        );
        assert!(FilterBand::from_range(0.0, 30000.0, 22050.0).is_err());
    }

    #[test]
    fn test_default_order_heuristics() {
        assert_eq!(default_filter_order(10_000), 512);
        assert_eq!(default_filter_order(1_000), 64);
        assert_eq!(default_filter_order(100), 16);
    }

    #[test]
    fn test_lowpass_attenuates_high_frequencies() {
        let rate = 8000.0;
        let low = tone(100.0, 0.5, rate, 1).unwrap();
        let high = tone(3000.0, 0.5, rate, 1).unwrap();
        let mixed = low.add(&high).unwrap();

        let filtered = fir_filter(&mixed, 0.0, 500.0, 128).unwrap();

        let power = |w: &Waveform| w.data.iter().map(|&v| v * v).sum::<f32>() / w.data.len() as f32;
        // Compare against the mid-section to avoid filter edge effects
        let mid = filtered.slice_time(0.1, 0.4).unwrap();
        let low_mid = low.slice_time(0.1, 0.4).unwrap();
        let residual: f32 = mid
            .data
            .iter()
            .zip(low_mid.data.iter())
            .map(|(&a, &b)| (a - b) * (a - b))
            .sum::<f32>()
            / mid.data.len() as f32;
        assert!(
            residual < power(&low_mid) * 0.05,
            "lowpass output should track the low tone, residual {}",
            residual
        );
    }

    #[test]
    fn test_filter_is_deterministic() {
        let wave = white_noise(0.2, 8000.0, 1, 7).unwrap();
        let a = fir_filter(&wave, 200.0, 1000.0, 64).unwrap();
        let b = fir_filter(&wave, 200.0, 1000.0, 64).unwrap();
        assert_eq!(a.data, b.data);
    }

    #[test]
    fn test_filter_order_bound() {
        let wave = white_noise(0.01, 8000.0, 1, 7).unwrap();
        assert!(fir_filter(&wave, 0.0, 500.0, 64).is_err());
    }

    #[test]
    fn test_noise_replays_from_seed() {
        let a = white_noise(0.1, 4000.0, 2, 42).unwrap();
        let b = white_noise(0.1, 4000.0, 2, 42).unwrap();
        let c = white_noise(0.1, 4000.0, 2, 43).unwrap();
        assert_eq!(a.data, b.data);
        assert_ne!(a.data, c.data);
    }

    #[test]
    fn test_resample_length() {
        let wave = tone(440.0, 1.0, 44100.0, 1).unwrap();
        let down = resample(&wave, 22050.0).unwrap();
        assert_eq!(down.nframes(), 22050);
        assert_eq!(down.sample_rate, 22050.0);
    }

    #[test]
    fn test_ramp_tapers_both_ends() {
        let wave = Waveform::mono(vec![1.0; 100], 100.0).unwrap();
        let ramped = ramp(&wave, true, true, 0.2);
        assert_eq!(ramped.data[0], 0.0);
        assert!(ramped.data[10] < 1.0);
        assert_eq!(ramped.data[50], 1.0);
        assert_eq!(ramped.data[99], 0.0);
    }
}
