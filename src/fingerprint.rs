//! Landmark hashing: anchor peaks paired with a bounded fan of later peaks.

use crate::peaks::Peak;

/// Number of forward pair candidates considered per anchor.
pub const FAN: usize = 9;
/// Inclusive frame-delta window for a valid pair.
pub const MIN_DT: u32 = 1;
pub const MAX_DT: u32 = 30;

const FREQ_MASK: u32 = 0x3FF;
const DT_MASK: u32 = 0xFF;

/// One `(hash, anchor frame)` datum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub hash: u32,
    pub anchor_time: u32,
}

/// Packs `(f1, f2, dt)` into 28 bits: `f1` in bits 18-27, `f2` in bits 8-17,
/// `dt` in bits 0-7.
#[inline]
pub fn encode_hash(f1: u32, f2: u32, dt: u32) -> u32 {
    ((f1 & FREQ_MASK) << 18) | ((f2 & FREQ_MASK) << 8) | (dt & DT_MASK)
}

/// Exact inverse of [`encode_hash`].
#[inline]
pub fn decode_hash(hash: u32) -> (u32, u32, u32) {
    ((hash >> 18) & FREQ_MASK, (hash >> 8) & FREQ_MASK, hash & DT_MASK)
}

/// Turns a peak set into fingerprints.
///
/// Peaks are sorted by `(frame, bin)` first; the sort is part of the contract
/// since each anchor is paired against its next [`FAN`] successors in that
/// order, keeping the pairs whose frame delta falls inside
/// `[MIN_DT, MAX_DT]`. Output is sorted by anchor frame and bit-identical for
/// identical input peak sets.
pub fn create_fingerprints(peaks: &[Peak]) -> Vec<Fingerprint> {
    let mut sorted = peaks.to_vec();
    sorted.sort_unstable_by_key(|p| (p.frame, p.bin));

    let mut fingerprints = Vec::new();
    for (i, anchor) in sorted.iter().enumerate() {
        for target in sorted.iter().skip(i + 1).take(FAN) {
            let dt = target.frame - anchor.frame;
            if !(MIN_DT..=MAX_DT).contains(&dt) {
                continue;
            }
            fingerprints.push(Fingerprint {
                hash: encode_hash(anchor.bin, target.bin, dt),
                anchor_time: anchor.frame,
            });
        }
    }

    fingerprints.sort_by_key(|fp| fp.anchor_time);
    fingerprints
}
