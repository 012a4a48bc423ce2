//! Thin service boundary over the engine: AddTrack, MatchAudio, ListTracks.
//!
//! Transport is out of scope; this layer owns the semantics — idempotent
//! catalog additions, input validation, error taxonomy and the cleanup of
//! every transient audio file on every exit path.

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use serde::Serialize;
use tempfile::TempPath;
use thiserror::Error;
use tracing::info;

use crate::audio::AudioError;
use crate::engine::{CancelToken, Engine, EngineError, TrackMatch, TrackMeta};
use crate::fetch::{AudioDownloader, FetchError, MetadataFetcher, extract_video_id};
use crate::store::{StoreError, Track};
use crate::transcode::{TranscodeError, Transcoder};

pub const MAX_PAGE_LIMIT: u64 = 100;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("audio download failed: {0}")]
    Download(#[source] FetchError),
    #[error("metadata fetch failed: {0}")]
    Metadata(#[source] FetchError),
    #[error(transparent)]
    Transcode(#[from] TranscodeError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification for transports mapping errors onto status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed identifier, non-audio payload, decode failure, empty trim.
    Input,
    /// Re-ingest of an existing external id.
    Duplicate,
    /// Downloader or metadata collaborator failed.
    External,
    /// Store connection/transaction failure; retriable.
    Store,
    Internal,
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::InvalidRequest(_) => ErrorKind::Input,
            ServiceError::Transcode(_) => ErrorKind::Input,
            ServiceError::Engine(EngineError::Audio(AudioError::DecodeFailed(_))) => {
                ErrorKind::Input
            }
            ServiceError::Engine(EngineError::Audio(AudioError::EmptyAfterTrim)) => {
                ErrorKind::Input
            }
            ServiceError::Engine(EngineError::Audio(AudioError::Resample(_))) => {
                ErrorKind::Internal
            }
            ServiceError::Download(_) | ServiceError::Metadata(_) => ErrorKind::External,
            ServiceError::Engine(EngineError::Store(StoreError::DuplicateExternalId(_)))
            | ServiceError::Store(StoreError::DuplicateExternalId(_)) => ErrorKind::Duplicate,
            ServiceError::Engine(EngineError::Store(StoreError::Unavailable(_)))
            | ServiceError::Store(StoreError::Unavailable(_)) => ErrorKind::Store,
            ServiceError::Engine(EngineError::Cancelled) => ErrorKind::Internal,
            ServiceError::Io(_) => ErrorKind::Internal,
        }
    }
}

/// Catalog entry as exposed at the boundary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackPayload {
    pub title: String,
    pub external_id: String,
    pub thumbnail: String,
    pub artist: Option<String>,
    pub track_id: i64,
}

impl From<Track> for TrackPayload {
    fn from(track: Track) -> Self {
        TrackPayload {
            title: track.title,
            external_id: track.external_id,
            thumbnail: track.thumbnail_url,
            artist: track.artist,
            track_id: track.track_id,
        }
    }
}

/// AddTrack is idempotent: a resubmitted video comes back as `AlreadyExists`
/// with the stored payload instead of an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AddOutcome {
    Created { track: TrackPayload },
    AlreadyExists { track: TrackPayload },
}

impl AddOutcome {
    pub fn track(&self) -> &TrackPayload {
        match self {
            AddOutcome::Created { track } | AddOutcome::AlreadyExists { track } => track,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, AddOutcome::Created { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchPayload {
    pub title: String,
    pub external_id: String,
    pub thumbnail: String,
    pub artist: Option<String>,
    pub offset_seconds: f32,
    pub confidence: f32,
}

impl From<TrackMatch> for MatchPayload {
    fn from(m: TrackMatch) -> Self {
        MatchPayload {
            title: m.track.title,
            external_id: m.track.external_id,
            thumbnail: m.track.thumbnail_url,
            artist: m.track.artist,
            offset_seconds: m.offset_seconds,
            confidence: m.confidence,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackPage {
    pub total: u64,
    pub count: usize,
    pub tracks: Vec<TrackPayload>,
}

pub struct Service {
    engine: Engine,
    downloader: Box<dyn AudioDownloader>,
    metadata: Box<dyn MetadataFetcher>,
    transcoder: Box<dyn Transcoder>,
    song_dir: PathBuf,
}

impl Service {
    pub fn new(
        engine: Engine,
        downloader: Box<dyn AudioDownloader>,
        metadata: Box<dyn MetadataFetcher>,
        transcoder: Box<dyn Transcoder>,
        song_dir: PathBuf,
    ) -> Result<Self, ServiceError> {
        fs::create_dir_all(&song_dir)?;
        Ok(Service { engine, downloader, metadata, transcoder, song_dir })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Downloads, transcodes and ingests a track identified by a YouTube URL
    /// or bare video id. External failures abort with nothing persisted.
    pub fn add_track(
        &self,
        source: &str,
        cancel: &CancelToken,
    ) -> Result<AddOutcome, ServiceError> {
        let video_id = extract_video_id(source).ok_or_else(|| {
            ServiceError::InvalidRequest(format!("not a YouTube URL or video id: {source:?}"))
        })?;

        if let Some(existing) = self.engine.store().get_track_by_external_id(&video_id)? {
            info!(%video_id, "track already cataloged");
            return Ok(AddOutcome::AlreadyExists { track: existing.into() });
        }

        let downloaded = self.downloader.fetch(&video_id).map_err(ServiceError::Download)?;
        let source_path = downloaded.file.to_path_buf();
        let canonical = self.transcoder.to_canonical(&source_path)?;
        // The download cleans itself up; adopt the transcoded file too so it
        // is removed on every path out of this function.
        let _transcoded = (canonical != source_path).then(|| TempPath::from_path(canonical.clone()));

        let metadata = self.metadata.fetch(&video_id).map_err(ServiceError::Metadata)?;
        let meta = TrackMeta {
            title: downloaded.title.clone(),
            external_id: video_id.clone(),
            artist: Some(metadata.channel_title),
            thumbnail_url: metadata.thumbnail_url,
        };

        match self.engine.ingest_path(&meta, &canonical, cancel) {
            Ok(track_id) => Ok(AddOutcome::Created {
                track: TrackPayload {
                    title: meta.title,
                    external_id: meta.external_id,
                    thumbnail: meta.thumbnail_url,
                    artist: meta.artist,
                    track_id,
                },
            }),
            // Lost a race against a concurrent ingest of the same video:
            // surface the stored track, same as the fast path above.
            Err(EngineError::Store(StoreError::DuplicateExternalId(_))) => {
                let existing = self
                    .engine
                    .store()
                    .get_track_by_external_id(&video_id)?
                    .ok_or_else(|| {
                        ServiceError::Store(StoreError::Unavailable(
                            "duplicate reported but track not found".to_string(),
                        ))
                    })?;
                Ok(AddOutcome::AlreadyExists { track: existing.into() })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Matches an uploaded audio blob against the catalog. Empty result means
    /// no match; non-audio payloads surface as input errors.
    pub fn match_audio(
        &self,
        data: &[u8],
        file_name: &str,
        cancel: &CancelToken,
    ) -> Result<Vec<MatchPayload>, ServiceError> {
        if data.is_empty() {
            return Err(ServiceError::InvalidRequest("empty audio upload".to_string()));
        }

        let mut upload = tempfile::Builder::new()
            .prefix("upload-")
            .suffix(&upload_suffix(file_name))
            .tempfile_in(&self.song_dir)?;
        upload.write_all(data)?;
        upload.flush()?;
        let upload_path = upload.into_temp_path();

        let canonical = self.transcoder.to_canonical(&upload_path)?;
        let _transcoded = (canonical != *upload_path).then(|| TempPath::from_path(canonical.clone()));

        let matches = self.engine.match_path(&canonical, cancel)?;
        Ok(matches.into_iter().map(MatchPayload::from).collect())
    }

    /// Catalog browsing with validated paging.
    pub fn list_tracks(&self, offset: u64, limit: u64) -> Result<TrackPage, ServiceError> {
        if limit < 1 || limit > MAX_PAGE_LIMIT {
            return Err(ServiceError::InvalidRequest(format!(
                "limit must be within 1..={MAX_PAGE_LIMIT}, got {limit}"
            )));
        }
        let (total, tracks) = self.engine.store().list_tracks(offset, limit)?;
        Ok(TrackPage {
            total,
            count: tracks.len(),
            tracks: tracks.into_iter().map(Into::into).collect(),
        })
    }
}

/// Keeps the upload's extension (the transcoder keys off it) while dropping
/// anything path-like from the client-supplied name.
fn upload_suffix(file_name: &str) -> String {
    let ext = std::path::Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| ext.chars().all(|c| c.is_ascii_alphanumeric()));
    match ext {
        Some(ext) => format!(".{ext}"),
        None => ".bin".to_string(),
    }
}
