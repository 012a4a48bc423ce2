//! Sparse peak extraction from a dB spectrogram.
//!
//! A cell is a candidate peak when it equals its 19x19 neighborhood maximum;
//! the candidates' mean dB value then acts as an adaptive amplitude threshold.

use crate::spectrogram::Spectrogram;

/// Maximum-filter neighborhood, `(bins, frames)`.
pub const NEIGHBORHOOD: (usize, usize) = (19, 19);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Peak {
    pub bin: u32,
    pub frame: u32,
}

/// Extracts locally maximal `(bin, frame)` coordinates whose value reaches the
/// adaptive threshold. Ties inside a neighborhood are all emitted.
pub fn find_peaks(spec: &Spectrogram) -> Vec<Peak> {
    if spec.bins == 0 || spec.frames == 0 {
        return Vec::new();
    }

    let maxed = max_filter(spec, NEIGHBORHOOD);
    let values = spec.as_slice();

    // Adaptive threshold: mean dB over the candidate cells. An empty candidate
    // set yields no peaks instead of a division by zero.
    let mut sum = 0.0f64;
    let mut count = 0usize;
    for (value, max) in values.iter().zip(&maxed) {
        if value == max {
            sum += *value as f64;
            count += 1;
        }
    }
    if count == 0 {
        return Vec::new();
    }
    let threshold = (sum / count as f64) as f32;

    let mut peaks = Vec::new();
    for bin in 0..spec.bins {
        for frame in 0..spec.frames {
            let idx = bin * spec.frames + frame;
            if values[idx] == maxed[idx] && values[idx] >= threshold {
                peaks.push(Peak { bin: bin as u32, frame: frame as u32 });
            }
        }
    }
    peaks
}

/// Rectangular 2-D maximum filter with reflected boundaries, computed as two
/// separable 1-D passes (along frames, then along bins).
fn max_filter(spec: &Spectrogram, neighborhood: (usize, usize)) -> Vec<f32> {
    let bin_radius = neighborhood.0 / 2;
    let frame_radius = neighborhood.1 / 2;

    // Pass 1: along time, one contiguous row per bin.
    let mut rows = vec![f32::NEG_INFINITY; spec.bins * spec.frames];
    for bin in 0..spec.bins {
        max_filter_line(spec.row(bin), &mut rows[bin * spec.frames..(bin + 1) * spec.frames], frame_radius);
    }

    // Pass 2: along frequency, strided columns over the first pass.
    let mut out = vec![f32::NEG_INFINITY; spec.bins * spec.frames];
    let mut column = vec![0.0f32; spec.bins];
    let mut filtered = vec![0.0f32; spec.bins];
    for frame in 0..spec.frames {
        for bin in 0..spec.bins {
            column[bin] = rows[bin * spec.frames + frame];
        }
        max_filter_line(&column, &mut filtered, bin_radius);
        for bin in 0..spec.bins {
            out[bin * spec.frames + frame] = filtered[bin];
        }
    }
    out
}

fn max_filter_line(src: &[f32], dst: &mut [f32], radius: usize) {
    let n = src.len();
    for (i, slot) in dst.iter_mut().enumerate() {
        let mut best = f32::NEG_INFINITY;
        for offset in -(radius as isize)..=(radius as isize) {
            let value = src[mirror_index(i as isize + offset, n)];
            if value > best {
                best = value;
            }
        }
        *slot = best;
    }
}

/// Boundary handling of `scipy.ndimage`-style "reflect": the edge sample is
/// repeated in the mirror image.
fn mirror_index(index: isize, len: usize) -> usize {
    let len = len as isize;
    let mut i = index;
    loop {
        if i < 0 {
            i = -i - 1;
        } else if i >= len {
            i = 2 * len - i - 1;
        } else {
            return i as usize;
        }
    }
}
