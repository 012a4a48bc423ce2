//! The recognition engine: one shared, thread-safe object tying the DSP
//! pipeline to the fingerprint store.
//!
//! Construct it once at startup and hand out `&Engine`; per-request state
//! lives on the stack and store access goes through the connection pool, so
//! ingest and match requests run in parallel without further locking.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::audio::{self, AudioError};
use crate::fingerprint::{self, Fingerprint};
use crate::matcher;
use crate::peaks;
use crate::spectrogram::{self, HOP};
use crate::store::{Store, StoreError, Track, TrackId};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Audio(#[from] AudioError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("operation cancelled")]
    Cancelled,
}

/// Cooperative cancellation flag, checked between pipeline stages. Cloning
/// shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    fn checkpoint(&self) -> Result<(), EngineError> {
        if self.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Metadata accompanying an ingest.
#[derive(Debug, Clone)]
pub struct TrackMeta {
    pub title: String,
    pub external_id: String,
    pub artist: Option<String>,
    pub thumbnail_url: String,
}

/// One ranked match with the catalog entry joined in.
#[derive(Debug, Clone)]
pub struct TrackMatch {
    pub track: Track,
    pub offset_seconds: f32,
    pub confidence: f32,
}

pub struct Engine {
    store: Store,
    sample_rate: u32,
    confidence_threshold: f32,
}

impl Engine {
    pub fn new(store: Store, sample_rate: u32, confidence_threshold: f32) -> Self {
        Engine { store, sample_rate, confidence_threshold }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Temporal resolution of the fingerprint anchors, frames per second.
    pub fn frame_rate(&self) -> f32 {
        self.sample_rate as f32 / HOP as f32
    }

    /// Runs the full DSP pipeline over raw decoded samples:
    /// condition -> spectrogram -> peaks -> hashes.
    pub fn fingerprint_pcm(
        &self,
        samples: Vec<f32>,
        cancel: &CancelToken,
    ) -> Result<Vec<Fingerprint>, EngineError> {
        cancel.checkpoint()?;
        let conditioned = audio::condition(samples, self.sample_rate)?;

        cancel.checkpoint()?;
        let spec = spectrogram::compute(&conditioned);
        drop(conditioned);

        cancel.checkpoint()?;
        let peaks = peaks::find_peaks(&spec);
        drop(spec);

        cancel.checkpoint()?;
        let fingerprints = fingerprint::create_fingerprints(&peaks);
        debug!(peaks = peaks.len(), fingerprints = fingerprints.len(), "pipeline done");
        Ok(fingerprints)
    }

    pub fn fingerprint_path(
        &self,
        path: &Path,
        cancel: &CancelToken,
    ) -> Result<Vec<Fingerprint>, EngineError> {
        cancel.checkpoint()?;
        let samples = audio::load_pcm(path, self.sample_rate)?;
        self.fingerprint_pcm(samples, cancel)
    }

    /// Fingerprints the given samples and persists them as a new track.
    pub fn ingest_pcm(
        &self,
        meta: &TrackMeta,
        samples: Vec<f32>,
        cancel: &CancelToken,
    ) -> Result<TrackId, EngineError> {
        let fingerprints = self.fingerprint_pcm(samples, cancel)?;
        self.ingest_fingerprints(meta, &fingerprints, cancel)
    }

    pub fn ingest_path(
        &self,
        meta: &TrackMeta,
        path: &Path,
        cancel: &CancelToken,
    ) -> Result<TrackId, EngineError> {
        let fingerprints = self.fingerprint_path(path, cancel)?;
        self.ingest_fingerprints(meta, &fingerprints, cancel)
    }

    fn ingest_fingerprints(
        &self,
        meta: &TrackMeta,
        fingerprints: &[Fingerprint],
        cancel: &CancelToken,
    ) -> Result<TrackId, EngineError> {
        cancel.checkpoint()?;
        if fingerprints.is_empty() {
            warn!(
                external_id = %meta.external_id,
                "track produced zero fingerprints and will never be matchable"
            );
        }
        let track_id = self.store.insert_track(
            &meta.title,
            &meta.external_id,
            meta.artist.as_deref(),
            &meta.thumbnail_url,
            fingerprints,
        )?;
        info!(
            track_id,
            external_id = %meta.external_id,
            fingerprints = fingerprints.len(),
            "ingested track"
        );
        Ok(track_id)
    }

    /// Matches raw decoded samples against the catalog.
    pub fn match_pcm(
        &self,
        samples: Vec<f32>,
        cancel: &CancelToken,
    ) -> Result<Vec<TrackMatch>, EngineError> {
        let fingerprints = self.fingerprint_pcm(samples, cancel)?;
        self.match_fingerprints(&fingerprints, cancel)
    }

    pub fn match_path(
        &self,
        path: &Path,
        cancel: &CancelToken,
    ) -> Result<Vec<TrackMatch>, EngineError> {
        let fingerprints = self.fingerprint_path(path, cancel)?;
        self.match_fingerprints(&fingerprints, cancel)
    }

    /// Looks up the query hashes, ranks the offset votes and joins the track
    /// metadata. An empty query legally produces an empty result.
    pub fn match_fingerprints(
        &self,
        fingerprints: &[Fingerprint],
        cancel: &CancelToken,
    ) -> Result<Vec<TrackMatch>, EngineError> {
        cancel.checkpoint()?;
        let hashes: Vec<u32> = fingerprints.iter().map(|fp| fp.hash).collect();
        let rows = self.store.lookup_hashes(&hashes)?;
        debug!(query = fingerprints.len(), rows = rows.len(), "hash lookup");

        cancel.checkpoint()?;
        let candidates = matcher::rank(fingerprints, &rows, self.confidence_threshold, self.frame_rate());

        let mut matches = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if let Some(track) = self.store.get_track(candidate.track_id)? {
                info!(
                    track_id = track.track_id,
                    confidence = candidate.confidence,
                    offset_seconds = candidate.offset_seconds,
                    "match candidate"
                );
                matches.push(TrackMatch {
                    track,
                    offset_seconds: candidate.offset_seconds,
                    confidence: candidate.confidence,
                });
            }
        }
        Ok(matches)
    }
}
