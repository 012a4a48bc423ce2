//! STFT magnitude spectrogram in decibels relative to the signal maximum.

use rustfft::FftPlanner;
use rustfft::num_complex::Complex;

/// FFT window length.
pub const N_FFT: usize = 2048;
/// Hop between successive frames, in samples.
pub const HOP: usize = 412;
/// Number of frequency bins kept from each FFT frame.
pub const N_BINS: usize = N_FFT / 2 + 1;
/// Clamp floor for the dB conversion.
pub const DB_FLOOR: f32 = -80.0;

const AMIN: f32 = 1e-10;

/// Magnitude spectrogram, `bins x frames`, values in dB within
/// `[DB_FLOOR, 0.0]`. Bin-major storage: one contiguous row per frequency bin.
#[derive(Debug, Clone)]
pub struct Spectrogram {
    pub bins: usize,
    pub frames: usize,
    data: Vec<f32>,
}

impl Spectrogram {
    #[inline]
    pub fn value(&self, bin: usize, frame: usize) -> f32 {
        self.data[bin * self.frames + frame]
    }

    #[inline]
    pub fn row(&self, bin: usize) -> &[f32] {
        &self.data[bin * self.frames..(bin + 1) * self.frames]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Assembles a spectrogram from raw bin-major data; `data.len()` must be
    /// `bins * frames`. Used by tests that bypass the STFT.
    #[cfg(test)]
    pub(crate) fn from_raw(bins: usize, frames: usize, data: Vec<f32>) -> Self {
        assert_eq!(data.len(), bins * frames);
        Spectrogram { bins, frames, data }
    }

    #[cfg(test)]
    pub(crate) fn set(&mut self, bin: usize, frame: usize, value: f32) {
        let frames = self.frames;
        self.data[bin * frames + frame] = value;
    }
}

/// Computes the centered STFT of `samples` and converts it to dB re max.
///
/// Framing is centered: the signal is reflect-padded by `N_FFT / 2` on both
/// ends so frame `t` is centered on sample `t * HOP`, giving
/// `len / HOP + 1` frames.
pub fn compute(samples: &[f32]) -> Spectrogram {
    if samples.is_empty() {
        return Spectrogram { bins: N_BINS, frames: 0, data: Vec::new() };
    }

    let pad = N_FFT / 2;
    let frames = samples.len() / HOP + 1;

    let mut planner = FftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(N_FFT);
    let window = hann_window(N_FFT);

    let mut buffer: Vec<Complex<f32>> = vec![Complex::new(0.0, 0.0); N_FFT];
    let mut data = vec![0.0f32; N_BINS * frames];

    for frame in 0..frames {
        let start = frame as isize * HOP as isize - pad as isize;
        for (j, slot) in buffer.iter_mut().enumerate() {
            let sample = samples[reflect_index(start + j as isize, samples.len())];
            *slot = Complex::new(sample * window[j], 0.0);
        }
        fft.process(&mut buffer);
        for bin in 0..N_BINS {
            data[bin * frames + frame] = buffer[bin].norm();
        }
    }

    to_db(&mut data);
    Spectrogram { bins: N_BINS, frames, data }
}

/// Periodic Hann window.
fn hann_window(size: usize) -> Vec<f32> {
    (0..size)
        .map(|i| 0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / size as f32).cos()))
        .collect()
}

/// Mirror an out-of-range index back into `0..len` without repeating the edge
/// sample (numpy-style "reflect" padding).
fn reflect_index(index: isize, len: usize) -> usize {
    let len = len as isize;
    if len == 1 {
        return 0;
    }
    let period = 2 * (len - 1);
    let mut i = index.rem_euclid(period);
    if i >= len {
        i = period - i;
    }
    i as usize
}

fn to_db(magnitudes: &mut [f32]) {
    let reference = magnitudes.iter().fold(0.0f32, |m, &v| m.max(v));
    if reference <= 0.0 {
        magnitudes.fill(DB_FLOOR);
        return;
    }
    for value in magnitudes.iter_mut() {
        *value = (20.0 * (value.max(AMIN) / reference).log10()).max(DB_FLOOR);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: u32 = 44_100;

    fn sine(freq: f32, duration_s: f32) -> Vec<f32> {
        let n = (SR as f32 * duration_s) as usize;
        (0..n)
            .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / SR as f32).sin())
            .collect()
    }

    #[test]
    fn frame_and_bin_counts() {
        let samples = sine(440.0, 1.0);
        let spec = compute(&samples);
        assert_eq!(spec.bins, 1025);
        assert_eq!(spec.frames, samples.len() / HOP + 1);
    }

    #[test]
    fn empty_input_yields_zero_frames() {
        let spec = compute(&[]);
        assert_eq!(spec.frames, 0);
        assert!(spec.as_slice().is_empty());
    }

    #[test]
    fn db_values_are_bounded() {
        let samples = sine(1_000.0, 0.5);
        let spec = compute(&samples);
        let max = spec.as_slice().iter().fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        let min = spec.as_slice().iter().fold(f32::INFINITY, |m, &v| m.min(v));
        assert!(max.abs() < 1e-4, "max should be the 0 dB reference, got {max}");
        assert!(min >= DB_FLOOR);
    }

    #[test]
    fn pure_tone_peaks_at_its_bin() {
        let freq = 1_000.0;
        let samples = sine(freq, 0.5);
        let spec = compute(&samples);

        // Inspect an interior frame, away from the padded edges.
        let frame = spec.frames / 2;
        let (mut best_bin, mut best) = (0, f32::NEG_INFINITY);
        for bin in 0..spec.bins {
            let v = spec.value(bin, frame);
            if v > best {
                best = v;
                best_bin = bin;
            }
        }
        let expected = (freq / (SR as f32 / N_FFT as f32)).round() as usize;
        assert!(
            (best_bin as isize - expected as isize).abs() <= 1,
            "expected the ridge near bin {expected}, got {best_bin}"
        );
    }

    #[test]
    fn silence_maps_to_the_floor() {
        let samples = vec![0.0f32; 4 * HOP];
        let spec = compute(&samples);
        assert!(spec.as_slice().iter().all(|&v| v == DB_FLOOR));
    }

    #[test]
    fn reflect_index_mirrors_both_ends() {
        assert_eq!(reflect_index(0, 5), 0);
        assert_eq!(reflect_index(-1, 5), 1);
        assert_eq!(reflect_index(-2, 5), 2);
        assert_eq!(reflect_index(4, 5), 4);
        assert_eq!(reflect_index(5, 5), 3);
        assert_eq!(reflect_index(6, 5), 2);
        assert_eq!(reflect_index(3, 1), 0);
    }
}
