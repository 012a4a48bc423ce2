//! Signal conditioning: decode, downmix, resample, normalize, trim, bandpass.
//!
//! Everything downstream (STFT, peak picking, hashing) assumes the conditioned
//! signal produced here: mono f32 at the configured sample rate, peak-normalized,
//! silence-trimmed and band-limited to the 200 Hz .. 5 kHz range where the
//! fingerprint hashes live.

use std::fs::File;
use std::path::Path;

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use rustfft::num_complex::Complex;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CODEC_TYPE_NULL, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;
use tracing::{debug, warn};

use crate::spectrogram::HOP;

/// Lower bandpass cutoff in Hz.
pub const BANDPASS_LOW_HZ: f64 = 200.0;
/// Upper bandpass cutoff in Hz, clamped to just below Nyquist at design time.
pub const BANDPASS_HIGH_HZ: f64 = 5_000.0;
/// Butterworth prototype order. The bandpass transform doubles it.
pub const BANDPASS_ORDER: usize = 5;

/// Silence trim threshold relative to peak frame energy, in dB.
const TRIM_DB: f32 = 20.0;
const TRIM_FRAME: usize = 2048;
const TRIM_HOP: usize = 512;

const RESAMPLE_CHUNK: usize = 1024;

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("failed to decode audio: {0}")]
    DecodeFailed(String),
    #[error("audio is empty after silence trimming")]
    EmptyAfterTrim,
    #[error("resampling failed: {0}")]
    Resample(String),
}

/// Decodes an audio file to a mono stream at `target_rate`, then conditions it
/// for fingerprinting. The one-stop entry used by the engine.
pub fn load_conditioned(path: &Path, target_rate: u32) -> Result<Vec<f32>, AudioError> {
    let samples = load_pcm(path, target_rate)?;
    condition(samples, target_rate)
}

/// Decodes any supported container to mono f32 and resamples to `target_rate`.
/// An input-rate mismatch is not an error.
pub fn load_pcm(path: &Path, target_rate: u32) -> Result<Vec<f32>, AudioError> {
    let (samples, source_rate) = decode_mono(path)?;
    debug!(
        source_rate,
        target_rate,
        samples = samples.len(),
        "decoded {}",
        path.display()
    );
    resample(samples, source_rate, target_rate)
}

/// Peak-normalizes, trims leading/trailing silence and applies the bandpass
/// filter. Fails with [`AudioError::EmptyAfterTrim`] when less than one STFT
/// hop of signal survives the trim.
pub fn condition(mut samples: Vec<f32>, sample_rate: u32) -> Result<Vec<f32>, AudioError> {
    peak_normalize(&mut samples);
    let kept = trim_silence(&samples);
    if kept.len() < HOP {
        return Err(AudioError::EmptyAfterTrim);
    }
    let filter = BandpassFilter::design(BANDPASS_LOW_HZ, BANDPASS_HIGH_HZ, BANDPASS_ORDER, sample_rate);
    Ok(filter.apply(kept))
}

fn decode_mono(path: &Path) -> Result<(Vec<f32>, u32), AudioError> {
    let src = File::open(path)
        .map_err(|e| AudioError::DecodeFailed(format!("{}: {e}", path.display())))?;
    let mss = MediaSourceStream::new(Box::new(src), Default::default());

    let mut hint = Hint::new();
    if let Some(extension) = path.extension().and_then(|s| s.to_str()) {
        hint.with_extension(extension);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| AudioError::DecodeFailed(e.to_string()))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL && t.codec_params.sample_rate.is_some())
        .ok_or_else(|| AudioError::DecodeFailed("no decodable audio track".to_string()))?;
    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate.unwrap_or(0);

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| AudioError::DecodeFailed(e.to_string()))?;

    let mut samples: Vec<f32> = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(ref err))
                if err.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(SymphoniaError::ResetRequired) => {
                return Err(AudioError::DecodeFailed("stream reset mid-decode".to_string()));
            }
            Err(err) => return Err(AudioError::DecodeFailed(err.to_string())),
        };
        if packet.track_id() != track_id {
            continue;
        }
        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                sample_rate = spec.rate;
                let channels = spec.channels.count();
                let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                buf.copy_interleaved_ref(decoded);
                let interleaved = buf.samples();
                if channels <= 1 {
                    samples.extend_from_slice(interleaved);
                } else {
                    for frame in interleaved.chunks_exact(channels) {
                        samples.push(frame.iter().sum::<f32>() / channels as f32);
                    }
                }
            }
            // A corrupt packet is skippable; anything else is fatal.
            Err(SymphoniaError::DecodeError(err)) => {
                warn!("skipping undecodable packet: {err}");
            }
            Err(err) => return Err(AudioError::DecodeFailed(err.to_string())),
        }
    }

    if samples.is_empty() || sample_rate == 0 {
        return Err(AudioError::DecodeFailed("no audio samples decoded".to_string()));
    }
    Ok((samples, sample_rate))
}

/// Polyphase sinc resampling. Passthrough when the rates already agree.
fn resample(samples: Vec<f32>, source_rate: u32, target_rate: u32) -> Result<Vec<f32>, AudioError> {
    if source_rate == target_rate || samples.is_empty() {
        return Ok(samples);
    }

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };
    let ratio = target_rate as f64 / source_rate as f64;
    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, RESAMPLE_CHUNK, 1)
        .map_err(|e| AudioError::Resample(e.to_string()))?;
    let delay = resampler.output_delay();

    let expected = (samples.len() as f64 * ratio).round() as usize;
    let mut out: Vec<f32> = Vec::with_capacity(expected + RESAMPLE_CHUNK);
    let mut pos = 0;
    while pos + RESAMPLE_CHUNK <= samples.len() {
        let frames = resampler
            .process(&[&samples[pos..pos + RESAMPLE_CHUNK]], None)
            .map_err(|e| AudioError::Resample(e.to_string()))?;
        out.extend_from_slice(&frames[0]);
        pos += RESAMPLE_CHUNK;
    }
    if pos < samples.len() {
        let frames = resampler
            .process_partial(Some(&[&samples[pos..]]), None)
            .map_err(|e| AudioError::Resample(e.to_string()))?;
        out.extend_from_slice(&frames[0]);
    }
    // Flush the filter tail, then drop the leading group delay so the output
    // stays time-aligned with the input.
    let frames = resampler
        .process_partial(None::<&[&[f32]]>, None)
        .map_err(|e| AudioError::Resample(e.to_string()))?;
    out.extend_from_slice(&frames[0]);

    if delay < out.len() {
        out.drain(..delay);
    }
    out.truncate(expected);
    Ok(out)
}

/// Scales the signal so the largest absolute sample is 1.0. All-zero input is
/// left untouched.
pub fn peak_normalize(samples: &mut [f32]) {
    let peak = samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
    if peak > 0.0 {
        for s in samples.iter_mut() {
            *s /= peak;
        }
    }
}

/// Standard trim semantics: short-window RMS per frame, keep everything from
/// the first to the last frame whose level exceeds peak − 20 dB.
pub fn trim_silence(samples: &[f32]) -> &[f32] {
    if samples.is_empty() {
        return samples;
    }

    let mut rms: Vec<f32> = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + TRIM_FRAME).min(samples.len());
        let frame = &samples[start..end];
        let energy = frame.iter().map(|s| s * s).sum::<f32>() / frame.len() as f32;
        rms.push(energy.sqrt());
        if end == samples.len() {
            break;
        }
        start += TRIM_HOP;
    }

    let peak = rms.iter().fold(0.0f32, |m, &r| m.max(r));
    if peak <= 0.0 {
        return &samples[..0];
    }
    let threshold = peak * 10f32.powf(-TRIM_DB / 20.0);

    let first = rms.iter().position(|&r| r > threshold);
    let last = rms.iter().rposition(|&r| r > threshold);
    match (first, last) {
        (Some(first), Some(last)) => {
            let begin = first * TRIM_HOP;
            let end = (last * TRIM_HOP + TRIM_FRAME).min(samples.len());
            &samples[begin..end]
        }
        _ => &samples[..0],
    }
}

#[derive(Debug, Clone, Copy)]
struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
}

/// Butterworth bandpass realized as a cascade of second-order sections.
///
/// Design path: analog prototype poles -> lowpass-to-bandpass transform with
/// prewarped cutoffs -> bilinear transform -> conjugate poles paired into
/// biquads. The transform places `order` zeros at z = 1 and `order` at z = -1,
/// one of each per section.
#[derive(Debug, Clone)]
pub struct BandpassFilter {
    sections: Vec<Biquad>,
    gain: f64,
}

impl BandpassFilter {
    pub fn design(low_hz: f64, high_hz: f64, order: usize, sample_rate: u32) -> Self {
        let fs = sample_rate as f64;
        let high_hz = high_hz.min(0.999 * fs / 2.0);

        // Prewarp the cutoffs so the digital edges land where requested.
        let wl = 2.0 * fs * (std::f64::consts::PI * low_hz / fs).tan();
        let wh = 2.0 * fs * (std::f64::consts::PI * high_hz / fs).tan();
        let w0_sq = wl * wh;
        let bw = wh - wl;

        let mut analog_poles: Vec<Complex<f64>> = Vec::with_capacity(2 * order);
        for k in 1..=order {
            let theta = std::f64::consts::PI * (2.0 * k as f64 + order as f64 - 1.0)
                / (2.0 * order as f64);
            let prototype = Complex::new(theta.cos(), theta.sin());
            // Each prototype pole p yields the roots of s^2 - p*bw*s + w0^2.
            let half = prototype * (bw / 2.0);
            let disc = (half * half - Complex::new(w0_sq, 0.0)).sqrt();
            analog_poles.push(half + disc);
            analog_poles.push(half - disc);
        }

        let k2 = Complex::new(2.0 * fs, 0.0);
        let digital_poles: Vec<Complex<f64>> =
            analog_poles.iter().map(|&s| (k2 + s) / (k2 - s)).collect();

        // H(s) = bw^N s^N / prod(s - p_i); bilinear maps the N zeros at the
        // origin onto z = 1 and the N zeros at infinity onto z = -1.
        let mut denom = Complex::new(1.0, 0.0);
        for &s in &analog_poles {
            denom *= k2 - s;
        }
        let gain = (Complex::new(bw.powi(order as i32) * (2.0 * fs).powi(order as i32), 0.0)
            / denom)
            .re;

        // Conjugate pairs become one biquad each; the leftover real poles pair
        // up among themselves.
        let mut sections: Vec<Biquad> = Vec::with_capacity(order);
        let mut reals: Vec<f64> = Vec::new();
        for p in &digital_poles {
            if p.im > 1e-10 {
                sections.push(Biquad {
                    b0: 1.0,
                    b1: 0.0,
                    b2: -1.0,
                    a1: -2.0 * p.re,
                    a2: p.norm_sqr(),
                });
            } else if p.im.abs() <= 1e-10 {
                reals.push(p.re);
            }
        }
        for pair in reals.chunks(2) {
            let section = match pair {
                [r1, r2] => Biquad {
                    b0: 1.0,
                    b1: 0.0,
                    b2: -1.0,
                    a1: -(r1 + r2),
                    a2: r1 * r2,
                },
                [r] => Biquad {
                    b0: 1.0,
                    b1: 0.0,
                    b2: -1.0,
                    a1: -r,
                    a2: 0.0,
                },
                _ => unreachable!(),
            };
            sections.push(section);
        }

        BandpassFilter { sections, gain }
    }

    /// Single-pass causal filtering, direct form II transposed per section.
    pub fn apply(&self, input: &[f32]) -> Vec<f32> {
        let mut signal: Vec<f64> = input.iter().map(|&s| s as f64 * self.gain).collect();
        for section in &self.sections {
            let mut z1 = 0.0f64;
            let mut z2 = 0.0f64;
            for value in signal.iter_mut() {
                let x = *value;
                let y = section.b0 * x + z1;
                z1 = section.b1 * x - section.a1 * y + z2;
                z2 = section.b2 * x - section.a2 * y;
                *value = y;
            }
        }
        signal.into_iter().map(|v| v as f32).collect()
    }

    /// Magnitude response at `freq_hz`, used by the design tests.
    #[cfg(test)]
    fn magnitude_at(&self, freq_hz: f64, sample_rate: u32) -> f64 {
        let omega = 2.0 * std::f64::consts::PI * freq_hz / sample_rate as f64;
        let z_inv = Complex::new(omega.cos(), -omega.sin());
        let mut response = Complex::new(self.gain, 0.0);
        for s in &self.sections {
            let numerator = Complex::new(s.b0, 0.0) + z_inv * s.b1 + z_inv * z_inv * s.b2;
            let denominator = Complex::new(1.0, 0.0) + z_inv * s.a1 + z_inv * z_inv * s.a2;
            response *= numerator / denominator;
        }
        response.norm()
    }
}
