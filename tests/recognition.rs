//! End-to-end recognition: ingest full tracks, identify snippets.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use resona::spectrogram::HOP;
use resona::{CancelToken, Engine, EngineError, Store, StoreError, TrackMeta};
use tempfile::TempDir;

const SR: u32 = 44_100;
const FRAME_RATE: f32 = SR as f32 / HOP as f32;

fn engine_in(dir: &TempDir) -> Engine {
    let store = Store::open(&dir.path().join("catalog.sqlite"), false).unwrap();
    Engine::new(store, SR, 0.0)
}

fn meta(external_id: &str, title: &str) -> TrackMeta {
    TrackMeta {
        title: title.to_string(),
        external_id: external_id.to_string(),
        artist: Some("Test Artist".to_string()),
        thumbnail_url: "https://img.example/thumb.jpg".to_string(),
    }
}

/// Linear sine sweep from `f0` to `f1` Hz.
fn sweep(duration_s: f32, f0: f32, f1: f32) -> Vec<f32> {
    let n = (SR as f32 * duration_s) as usize;
    (0..n)
        .map(|i| {
            let t = i as f32 / SR as f32;
            let phase = 2.0 * std::f32::consts::PI
                * (f0 * t + (f1 - f0) * t * t / (2.0 * duration_s));
            0.8 * phase.sin()
        })
        .collect()
}

fn write_wav(path: &std::path::Path, samples: &[f32]) {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SR,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    for &s in samples {
        writer.write_sample((s * i16::MAX as f32) as i16).unwrap();
    }
    writer.finalize().unwrap();
}

#[test]
fn identity_query_returns_its_track_at_offset_zero() {
    let dir = TempDir::new().unwrap();
    let engine = engine_in(&dir);
    let cancel = CancelToken::new();

    let audio = sweep(30.0, 200.0, 5_000.0);
    let track_id = engine.ingest_pcm(&meta("sweep-up", "Sweep Up"), audio.clone(), &cancel).unwrap();
    // A decoy with different spectral motion.
    engine
        .ingest_pcm(&meta("sweep-down", "Sweep Down"), sweep(20.0, 4_000.0, 400.0), &cancel)
        .unwrap();

    let matches = engine.match_pcm(audio, &cancel).unwrap();
    assert!(!matches.is_empty(), "identical audio must match");
    let top = &matches[0];
    assert_eq!(top.track.track_id, track_id);
    assert_eq!(top.track.title, "Sweep Up");
    assert!(
        top.offset_seconds.abs() < 1.5 / FRAME_RATE,
        "identity offset should be ~0, got {}",
        top.offset_seconds
    );
    assert!(top.confidence > 0.5, "identity confidence {}", top.confidence);
}

#[test]
fn snippet_query_recovers_its_start_offset() {
    let dir = TempDir::new().unwrap();
    let engine = engine_in(&dir);
    let cancel = CancelToken::new();

    let audio = sweep(30.0, 200.0, 5_000.0);
    let track_id = engine.ingest_pcm(&meta("sweep-off", "Sweep"), audio.clone(), &cancel).unwrap();

    // Five seconds starting on a hop boundary near the 10 s mark.
    let start_frame = 1_070usize;
    let start = start_frame * HOP;
    let snippet = audio[start..start + 5 * SR as usize].to_vec();

    let matches = engine.match_pcm(snippet, &cancel).unwrap();
    assert!(!matches.is_empty());
    let top = &matches[0];
    assert_eq!(top.track.track_id, track_id);

    let expected = start_frame as f32 / FRAME_RATE;
    assert!(
        (top.offset_seconds - expected).abs() < 0.05,
        "expected offset ~{expected}, got {}",
        top.offset_seconds
    );
}

#[test]
fn white_noise_never_matches_confidently() {
    let dir = TempDir::new().unwrap();
    let engine = engine_in(&dir);
    let cancel = CancelToken::new();

    engine
        .ingest_pcm(&meta("sweep-n", "Sweep"), sweep(30.0, 200.0, 5_000.0), &cancel)
        .unwrap();

    let mut rng = StdRng::seed_from_u64(0x5eed);
    let noise: Vec<f32> = (0..30 * SR as usize)
        .map(|_| rng.gen_range(-1.0f32, 1.0f32))
        .collect();

    let matches = engine.match_pcm(noise, &cancel).unwrap();
    assert!(
        matches.is_empty() || matches[0].confidence < 0.25,
        "noise matched with confidence {}",
        matches[0].confidence
    );
}

#[test]
fn parallel_duplicate_ingest_succeeds_exactly_once() {
    let dir = TempDir::new().unwrap();
    let engine = engine_in(&dir);
    let audio = sweep(10.0, 300.0, 3_000.0);
    let expected_prints = engine
        .fingerprint_pcm(audio.clone(), &CancelToken::new())
        .unwrap()
        .len() as u64;

    let results = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let audio = audio.clone();
                let engine = &engine;
                scope.spawn(move || {
                    engine.ingest_pcm(&meta("dup-track", "Duplicated"), audio, &CancelToken::new())
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect::<Vec<_>>()
    });

    let successes: Vec<_> = results.iter().filter(|r| r.is_ok()).collect();
    let duplicates = results
        .iter()
        .filter(|r| {
            matches!(
                r,
                Err(EngineError::Store(StoreError::DuplicateExternalId(ext))) if ext == "dup-track"
            )
        })
        .count();
    assert_eq!(successes.len(), 1);
    assert_eq!(duplicates, 1);

    let track_id = *successes[0].as_ref().unwrap();
    assert_eq!(engine.store().fingerprint_count(track_id).unwrap(), expected_prints);
    let (total, _) = engine.store().list_tracks(0, 10).unwrap();
    assert_eq!(total, 1);
}

#[test]
fn wav_files_round_trip_through_decode() {
    let dir = TempDir::new().unwrap();
    let engine = engine_in(&dir);
    let cancel = CancelToken::new();

    let audio = sweep(12.0, 200.0, 5_000.0);
    let track_path = dir.path().join("track.wav");
    write_wav(&track_path, &audio);
    let track_id = engine.ingest_path(&meta("wav-track", "From Wav"), &track_path, &cancel).unwrap();

    let snippet_path = dir.path().join("snippet.wav");
    write_wav(&snippet_path, &audio[4 * SR as usize..8 * SR as usize]);
    let matches = engine.match_path(&snippet_path, &cancel).unwrap();

    assert!(!matches.is_empty());
    assert_eq!(matches[0].track.track_id, track_id);
    assert!((matches[0].offset_seconds - 4.0).abs() < 0.1);
}

#[test]
fn unreadable_file_is_a_decode_error() {
    let dir = TempDir::new().unwrap();
    let engine = engine_in(&dir);

    let bogus = dir.path().join("bogus.mp3");
    std::fs::write(&bogus, b"this is not audio at all").unwrap();
    match engine.match_path(&bogus, &CancelToken::new()) {
        Err(EngineError::Audio(_)) => {}
        other => panic!("expected a decode failure, got {other:?}"),
    }
}
