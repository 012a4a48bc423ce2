//! SQLite-backed persistence for tracks and their fingerprints.
//!
//! One writer transaction per ingest; queries ride the `hash_value` index.
//! Connections come from a bounded r2d2 pool (pre-pinged on checkout and
//! recycled on a timer) so ingest and match requests can run in parallel.

use std::path::Path;
use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{OptionalExtension, params, params_from_iter};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::fingerprint::Fingerprint;

pub type TrackId = i64;

/// Base pool size plus overflow; checkout blocks once all 15 are in use.
const POOL_BASE: u32 = 5;
const POOL_MAX: u32 = 15;
/// Connections older than this are re-established to survive idle timeouts.
const POOL_RECYCLE: Duration = Duration::from_secs(30 * 60);

/// SQLite caps bound parameters per statement; lookups batch beneath it.
const LOOKUP_CHUNK: usize = 512;

/// One catalog entry. Created at ingest, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Track {
    pub track_id: TrackId,
    pub title: String,
    pub external_id: String,
    pub artist: Option<String>,
    pub thumbnail_url: String,
}

/// One stored fingerprint row returned by a hash lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashRow {
    pub hash: u32,
    pub anchor_time: u32,
    pub track_id: TrackId,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("a track with external id {0:?} already exists")]
    DuplicateExternalId(String),
    /// Backend I/O failure; retriable by the caller.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

impl From<r2d2::Error> for StoreError {
    fn from(err: r2d2::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

#[derive(Clone)]
pub struct Store {
    pool: Pool<SqliteConnectionManager>,
}

impl Store {
    /// Opens (creating if needed) the database at `path` and ensures the
    /// schema. `echo_sql` wires a statement trace hook at DEBUG level.
    pub fn open(path: &Path, echo_sql: bool) -> Result<Self, StoreError> {
        let manager = SqliteConnectionManager::file(path).with_init(move |conn| {
            conn.busy_timeout(Duration::from_millis(5000))?;
            conn.pragma_update(None, "foreign_keys", "ON")?;
            // journal_mode reports the resulting mode as a row.
            conn.query_row("PRAGMA journal_mode = WAL", [], |_row| Ok(()))?;
            if echo_sql {
                conn.trace(Some(trace_sql));
            }
            Ok(())
        });
        let pool = Pool::builder()
            .min_idle(Some(POOL_BASE))
            .max_size(POOL_MAX)
            .test_on_check_out(true)
            .max_lifetime(Some(POOL_RECYCLE))
            .build(manager)?;

        let store = Store { pool };
        store.init_schema()?;
        info!("store ready at {}", path.display());
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.execute_batch(
            "BEGIN;
             CREATE TABLE IF NOT EXISTS tracks (
                 track_id      INTEGER PRIMARY KEY,
                 title         TEXT NOT NULL,
                 external_id   TEXT NOT NULL UNIQUE,
                 artist        TEXT,
                 thumbnail_url TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS fingerprints (
                 fingerprint_id INTEGER PRIMARY KEY,
                 hash_value     INTEGER NOT NULL,
                 anchor_time    INTEGER NOT NULL,
                 track_id       INTEGER NOT NULL
                     REFERENCES tracks (track_id) ON DELETE CASCADE
             );
             CREATE INDEX IF NOT EXISTS idx_fingerprints_hash
                 ON fingerprints (hash_value);
             CREATE INDEX IF NOT EXISTS idx_fingerprints_track
                 ON fingerprints (track_id);
             COMMIT;",
        )?;
        Ok(())
    }

    /// Inserts a track and all of its fingerprints in one transaction.
    ///
    /// Concurrent inserts with the same `external_id` are serialized by the
    /// unique constraint: exactly one succeeds, the rest fail with
    /// [`StoreError::DuplicateExternalId`] and leave the store unchanged.
    pub fn insert_track(
        &self,
        title: &str,
        external_id: &str,
        artist: Option<&str>,
        thumbnail_url: &str,
        fingerprints: &[Fingerprint],
    ) -> Result<TrackId, StoreError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;

        let track_id = match tx.query_row(
            "INSERT INTO tracks (title, external_id, artist, thumbnail_url)
             VALUES (?1, ?2, ?3, ?4)
             RETURNING track_id",
            params![title, external_id, artist, thumbnail_url],
            |row| row.get::<_, i64>(0),
        ) {
            Ok(id) => id,
            Err(err) if is_unique_violation(&err) => {
                return Err(StoreError::DuplicateExternalId(external_id.to_string()));
            }
            Err(err) => return Err(err.into()),
        };

        {
            let mut stmt = tx.prepare(
                "INSERT INTO fingerprints (hash_value, anchor_time, track_id)
                 VALUES (?1, ?2, ?3)",
            )?;
            for fp in fingerprints {
                stmt.execute(params![fp.hash as i64, fp.anchor_time as i64, track_id])?;
            }
        }

        tx.commit()?;
        debug!(track_id, rows = fingerprints.len(), "committed track {external_id:?}");
        Ok(track_id)
    }

    /// Returns every stored row whose hash is in the given set. Duplicate
    /// input hashes collapse; row order is unspecified.
    pub fn lookup_hashes(&self, hashes: &[u32]) -> Result<Vec<HashRow>, StoreError> {
        let mut distinct: Vec<u32> = hashes.to_vec();
        distinct.sort_unstable();
        distinct.dedup();
        if distinct.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.pool.get()?;
        let mut rows = Vec::new();
        for chunk in distinct.chunks(LOOKUP_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let sql = format!(
                "SELECT hash_value, anchor_time, track_id
                 FROM fingerprints WHERE hash_value IN ({placeholders})"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mapped = stmt.query_map(
                params_from_iter(chunk.iter().map(|&h| h as i64)),
                |row| {
                    Ok(HashRow {
                        hash: row.get::<_, i64>(0)? as u32,
                        anchor_time: row.get::<_, i64>(1)? as u32,
                        track_id: row.get(2)?,
                    })
                },
            )?;
            for row in mapped {
                rows.push(row?);
            }
        }
        Ok(rows)
    }

    pub fn get_track(&self, track_id: TrackId) -> Result<Option<Track>, StoreError> {
        let conn = self.pool.get()?;
        let track = conn
            .query_row(
                "SELECT track_id, title, external_id, artist, thumbnail_url
                 FROM tracks WHERE track_id = ?1",
                params![track_id],
                row_to_track,
            )
            .optional()?;
        Ok(track)
    }

    pub fn get_track_by_external_id(&self, external_id: &str) -> Result<Option<Track>, StoreError> {
        let conn = self.pool.get()?;
        let track = conn
            .query_row(
                "SELECT track_id, title, external_id, artist, thumbnail_url
                 FROM tracks WHERE external_id = ?1",
                params![external_id],
                row_to_track,
            )
            .optional()?;
        Ok(track)
    }

    /// Catalog page ordered by `track_id`, plus the total row count.
    pub fn list_tracks(&self, offset: u64, limit: u64) -> Result<(u64, Vec<Track>), StoreError> {
        let conn = self.pool.get()?;
        let total: u64 = conn.query_row("SELECT COUNT(*) FROM tracks", [], |row| {
            row.get::<_, i64>(0).map(|n| n as u64)
        })?;
        let mut stmt = conn.prepare(
            "SELECT track_id, title, external_id, artist, thumbnail_url
             FROM tracks ORDER BY track_id LIMIT ?1 OFFSET ?2",
        )?;
        let mapped = stmt.query_map(params![limit as i64, offset as i64], row_to_track)?;
        let mut tracks = Vec::new();
        for track in mapped {
            tracks.push(track?);
        }
        Ok((total, tracks))
    }

    /// Removes a track; its fingerprints go with it via the cascade.
    pub fn delete_track(&self, track_id: TrackId) -> Result<bool, StoreError> {
        let conn = self.pool.get()?;
        let affected = conn.execute("DELETE FROM tracks WHERE track_id = ?1", params![track_id])?;
        Ok(affected > 0)
    }

    pub fn fingerprint_count(&self, track_id: TrackId) -> Result<u64, StoreError> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM fingerprints WHERE track_id = ?1",
            params![track_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

fn row_to_track(row: &rusqlite::Row<'_>) -> rusqlite::Result<Track> {
    Ok(Track {
        track_id: row.get(0)?,
        title: row.get(1)?,
        external_id: row.get(2)?,
        artist: row.get(3)?,
        thumbnail_url: row.get(4)?,
    })
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn trace_sql(statement: &str) {
    debug!(target: "resona::sql", "{statement}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::encode_hash;
    use tempfile::TempDir;

    fn scratch_store() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("catalog.sqlite"), false).unwrap();
        (dir, store)
    }

    fn fp(hash: u32, anchor_time: u32) -> Fingerprint {
        Fingerprint { hash, anchor_time }
    }

    #[test]
    fn insert_and_fetch_round_trip() {
        let (_dir, store) = scratch_store();
        let prints = vec![fp(encode_hash(1, 2, 3), 0), fp(encode_hash(4, 5, 6), 7)];
        let id = store
            .insert_track("Song A", "vid-a", Some("Artist A"), "https://img/a.jpg", &prints)
            .unwrap();

        let track = store.get_track(id).unwrap().expect("track should exist");
        assert_eq!(track.title, "Song A");
        assert_eq!(track.external_id, "vid-a");
        assert_eq!(track.artist.as_deref(), Some("Artist A"));
        assert_eq!(store.fingerprint_count(id).unwrap(), 2);

        let by_ext = store.get_track_by_external_id("vid-a").unwrap().unwrap();
        assert_eq!(by_ext, track);
        assert!(store.get_track(id + 999).unwrap().is_none());
    }

    #[test]
    fn duplicate_external_id_fails_and_mutates_nothing() {
        let (_dir, store) = scratch_store();
        let prints = vec![fp(10, 0), fp(11, 1), fp(12, 2)];
        let id = store
            .insert_track("First", "dup-id", None, "https://img/1.jpg", &prints)
            .unwrap();

        let again = store.insert_track(
            "Second",
            "dup-id",
            Some("Someone"),
            "https://img/2.jpg",
            &[fp(99, 0)],
        );
        match again {
            Err(StoreError::DuplicateExternalId(ext)) => assert_eq!(ext, "dup-id"),
            other => panic!("expected DuplicateExternalId, got {other:?}"),
        }

        // The first ingest is intact, the second left no rows behind.
        let (total, _) = store.list_tracks(0, 10).unwrap();
        assert_eq!(total, 1);
        assert_eq!(store.fingerprint_count(id).unwrap(), 3);
        assert!(store.lookup_hashes(&[99]).unwrap().is_empty());
    }

    #[test]
    fn lookup_collapses_duplicate_input_hashes() {
        let (_dir, store) = scratch_store();
        let prints = vec![fp(42, 0), fp(42, 5), fp(7, 1)];
        let id = store
            .insert_track("T", "t-1", None, "https://img/t.jpg", &prints)
            .unwrap();

        // The same hash asked for three times still returns each row once.
        let rows = store.lookup_hashes(&[42, 42, 42]).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.hash == 42 && r.track_id == id));

        assert!(store.lookup_hashes(&[]).unwrap().is_empty());
        assert!(store.lookup_hashes(&[1234]).unwrap().is_empty());
    }

    #[test]
    fn inserts_are_immediately_visible_to_lookups() {
        let (_dir, store) = scratch_store();
        let id = store
            .insert_track("T", "t-vis", None, "https://img/v.jpg", &[fp(77, 3)])
            .unwrap();
        let rows = store.lookup_hashes(&[77]).unwrap();
        assert_eq!(rows, vec![HashRow { hash: 77, anchor_time: 3, track_id: id }]);
    }

    #[test]
    fn lookup_spans_multiple_chunks() {
        let (_dir, store) = scratch_store();
        let prints: Vec<Fingerprint> = (0..1500).map(|i| fp(i, i)).collect();
        store
            .insert_track("Big", "big-1", None, "https://img/b.jpg", &prints)
            .unwrap();

        let hashes: Vec<u32> = (0..1500).collect();
        let rows = store.lookup_hashes(&hashes).unwrap();
        assert_eq!(rows.len(), 1500);
    }

    #[test]
    fn delete_cascades_to_fingerprints() {
        let (_dir, store) = scratch_store();
        let prints = vec![fp(1, 0), fp(2, 1)];
        let id = store
            .insert_track("Gone", "gone-1", None, "https://img/g.jpg", &prints)
            .unwrap();

        assert!(store.delete_track(id).unwrap());
        assert!(store.get_track(id).unwrap().is_none());
        assert_eq!(store.fingerprint_count(id).unwrap(), 0);
        assert!(store.lookup_hashes(&[1, 2]).unwrap().is_empty());
        assert!(!store.delete_track(id).unwrap());
    }

    #[test]
    fn zero_fingerprint_tracks_are_allowed() {
        let (_dir, store) = scratch_store();
        let id = store
            .insert_track("Empty", "empty-1", None, "https://img/e.jpg", &[])
            .unwrap();
        assert_eq!(store.fingerprint_count(id).unwrap(), 0);
    }

    #[test]
    fn list_tracks_paginates() {
        let (_dir, store) = scratch_store();
        for i in 0..5 {
            store
                .insert_track(
                    &format!("Track {i}"),
                    &format!("ext-{i}"),
                    None,
                    "https://img/x.jpg",
                    &[],
                )
                .unwrap();
        }

        let (total, page) = store.list_tracks(1, 2).unwrap();
        assert_eq!(total, 5);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].title, "Track 1");
        assert_eq!(page[1].title, "Track 2");

        let (_, tail) = store.list_tracks(4, 10).unwrap();
        assert_eq!(tail.len(), 1);
        let (_, beyond) = store.list_tracks(10, 10).unwrap();
        assert!(beyond.is_empty());
    }
}
