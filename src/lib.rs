//! Shazam-style audio content identification.
//!
//! Catalog tracks are ingested whole; queries are short snippets. The pipeline
//! turns audio into sparse landmark hashes (condition -> spectrogram -> peaks
//! -> pair hashes), persists them in SQLite and answers queries by
//! offset-histogram voting:
//!
//! ```no_run
//! use resona::{CancelToken, Engine, Store, TrackMeta};
//!
//! let store = Store::open("catalog.sqlite".as_ref(), false)?;
//! let engine = Engine::new(store, 44_100, 0.0);
//! let cancel = CancelToken::new();
//!
//! let meta = TrackMeta {
//!     title: "Some Song".into(),
//!     external_id: "dQw4w9WgXcQ".into(),
//!     artist: Some("Some Artist".into()),
//!     thumbnail_url: "https://img.example/1.jpg".into(),
//! };
//! engine.ingest_path(&meta, "full_track.mp3".as_ref(), &cancel)?;
//!
//! for m in engine.match_path("snippet.wav".as_ref(), &cancel)? {
//!     println!("{} at {:.2}s ({:.0}%)", m.track.title, m.offset_seconds, m.confidence * 100.0);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod audio;
pub mod config;
pub mod engine;
pub mod fetch;
pub mod fingerprint;
pub mod matcher;
pub mod peaks;
pub mod service;
pub mod spectrogram;
pub mod store;
pub mod transcode;

pub use config::{Config, ConfigError};
pub use engine::{CancelToken, Engine, EngineError, TrackMatch, TrackMeta};
pub use service::{
    AddOutcome, ErrorKind, MatchPayload, Service, ServiceError, TrackPage, TrackPayload,
};
pub use store::{Store, StoreError, Track, TrackId};
