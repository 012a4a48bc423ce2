//! Offset-histogram voting over stored fingerprint rows.
//!
//! Matching never touches the DSP pipeline: it consumes the query's
//! fingerprints plus the rows a hash lookup returned, which keeps the whole
//! ranking pure and testable without a store.

use std::collections::HashMap;

use crate::fingerprint::Fingerprint;
use crate::store::{HashRow, TrackId};

/// Rows whose hash covers at least this share of the lookup result are noise.
pub const SUPPRESSION_RATIO: f64 = 0.10;
/// Number of ranked candidates kept.
pub const TOP_CANDIDATES: usize = 3;

/// One ranked match candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub track_id: TrackId,
    /// Winning offset Δ = t_db − t_q, in frames.
    pub offset_frames: i64,
    pub offset_seconds: f32,
    /// Vote count behind the winning offset.
    pub votes: usize,
    /// Votes over the post-suppression row count.
    pub confidence: f32,
}

/// Ranks candidate tracks for a query against its hash-lookup rows.
///
/// Steps: suppress over-represented hashes, vote `Δ = t_db − t_q` per track
/// (negative offsets are skipped — the catalog occurrence cannot precede the
/// query anchor), take each track's histogram mode, keep the top three by
/// votes and drop anything under `confidence_threshold`. Vote ties resolve
/// toward the smaller offset, then the smaller track id.
pub fn rank(
    query: &[Fingerprint],
    rows: &[HashRow],
    confidence_threshold: f32,
    frame_rate: f32,
) -> Vec<Candidate> {
    if query.is_empty() || rows.is_empty() {
        return Vec::new();
    }

    let mut query_times: HashMap<u32, Vec<u32>> = HashMap::new();
    for fp in query {
        query_times.entry(fp.hash).or_default().push(fp.anchor_time);
    }

    let mut hash_counts: HashMap<u32, usize> = HashMap::new();
    for row in rows {
        *hash_counts.entry(row.hash).or_insert(0) += 1;
    }
    let suppression_cutoff = SUPPRESSION_RATIO * rows.len() as f64;
    let surviving: Vec<&HashRow> = rows
        .iter()
        .filter(|row| (hash_counts[&row.hash] as f64) < suppression_cutoff)
        .collect();
    if surviving.is_empty() {
        return Vec::new();
    }

    let mut votes: HashMap<TrackId, HashMap<i64, usize>> = HashMap::new();
    for row in &surviving {
        let Some(times) = query_times.get(&row.hash) else {
            continue;
        };
        for &query_time in times {
            let delta = row.anchor_time as i64 - query_time as i64;
            if delta < 0 {
                continue;
            }
            *votes.entry(row.track_id).or_default().entry(delta).or_insert(0) += 1;
        }
    }

    // Per-track histogram mode, then a global cut to the strongest three.
    let mut candidates: Vec<(TrackId, i64, usize)> = Vec::new();
    for (track_id, histogram) in &votes {
        let mut best: Option<(i64, usize)> = None;
        for (&delta, &count) in histogram {
            let better = match best {
                None => true,
                Some((best_delta, best_count)) => {
                    count > best_count || (count == best_count && delta < best_delta)
                }
            };
            if better {
                best = Some((delta, count));
            }
        }
        if let Some((delta, count)) = best {
            candidates.push((*track_id, delta, count));
        }
    }
    candidates.sort_by(|a, b| b.2.cmp(&a.2).then(a.1.cmp(&b.1)).then(a.0.cmp(&b.0)));
    candidates.truncate(TOP_CANDIDATES);

    let denominator = surviving.len().max(1) as f32;
    candidates
        .into_iter()
        .filter_map(|(track_id, delta, count)| {
            let confidence = count as f32 / denominator;
            (confidence >= confidence_threshold).then(|| Candidate {
                track_id,
                offset_frames: delta,
                offset_seconds: delta as f32 / frame_rate,
                votes: count,
                confidence,
            })
        })
        .collect()
}
