//! Canonicalizing transcoder: any input audio becomes 192 kbps 44.1 kHz mp3.

use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("failed to run ffmpeg: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("transcoding failed: {0}")]
    Failed(String),
}

/// Normalizes an audio file to the canonical format the pipeline expects.
/// Returns the path of the canonical file, which may be the input itself.
pub trait Transcoder: Send + Sync {
    fn to_canonical(&self, input: &Path) -> Result<PathBuf, TranscodeError>;
}

/// Shells out to ffmpeg. Inputs already in mp3 pass through untouched.
pub struct FfmpegTranscoder;

impl Transcoder for FfmpegTranscoder {
    fn to_canonical(&self, input: &Path) -> Result<PathBuf, TranscodeError> {
        let already_mp3 = input
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("mp3"));
        if already_mp3 {
            return Ok(input.to_path_buf());
        }

        let output = input.with_extension("mp3");
        debug!("transcoding {} -> {}", input.display(), output.display());
        let result = Command::new("ffmpeg")
            .arg("-y")
            .arg("-i")
            .arg(input)
            .arg("-vn")
            .arg("-ab")
            .arg("192k")
            .arg("-ar")
            .arg("44100")
            .arg("-f")
            .arg("mp3")
            .arg(&output)
            .output()?;

        if !result.status.success() {
            return Err(TranscodeError::Failed(
                String::from_utf8_lossy(&result.stderr).into_owned(),
            ));
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mp3_inputs_pass_through() {
        let path = Path::new("/tmp/already.mp3");
        let out = FfmpegTranscoder.to_canonical(path).unwrap();
        assert_eq!(out, path);

        let upper = Path::new("/tmp/SHOUTY.MP3");
        assert_eq!(FfmpegTranscoder.to_canonical(upper).unwrap(), upper);
    }
}
