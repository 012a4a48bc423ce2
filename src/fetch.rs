//! External collaborators: the audio downloader and the metadata fetcher.
//!
//! Both are traits so the service can be exercised with stubs; the shipped
//! implementations talk to a RapidAPI yt-to-mp3 bridge and the YouTube Data
//! v3 API over blocking reqwest.

use std::io::Write;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use tempfile::TempPath;
use thiserror::Error;
use tracing::{error, info};

use crate::config::Config;

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected response: {0}")]
    MalformedResponse(String),
}

/// A downloaded audio asset. The backing file is deleted when this value is
/// dropped, on every exit path.
#[derive(Debug)]
pub struct DownloadedAudio {
    pub file: TempPath,
    pub title: String,
}

/// Resolves an opaque video id into a local audio file plus its title.
pub trait AudioDownloader: Send + Sync {
    fn fetch(&self, video_id: &str) -> Result<DownloadedAudio, FetchError>;
}

/// Per-video metadata used to fill the catalog entry.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoMetadata {
    pub channel_title: String,
    pub thumbnail_url: String,
}

pub trait MetadataFetcher: Send + Sync {
    fn fetch(&self, video_id: &str) -> Result<VideoMetadata, FetchError>;
}

static VIDEO_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?:youtu\.be\/|youtube\.com(?:\/(?:[^\/\n\s]+\/\S+\/|(?:v|e(?:mbed)?)\/|\S*?[?&]v=|shorts\/)|youtu\.be\/|embed\/|v\/|m\/|watch\?(?:[^=]+=[^&]+&)*?v=))([^"&?\/\s]{11})"#,
    )
    .expect("video id pattern compiles")
});

static RAW_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_-]{11}$").expect("raw id pattern compiles")
});

/// Pulls the 11-character video id out of a YouTube URL, or accepts a bare id.
pub fn extract_video_id(input: &str) -> Option<String> {
    let input = input.trim();
    if RAW_ID_RE.is_match(input) {
        return Some(input.to_string());
    }
    VIDEO_ID_RE
        .captures(input)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// yt-to-mp3 conversion bridge behind RapidAPI.
pub struct RapidApiDownloader {
    client: reqwest::blocking::Client,
    endpoint: String,
    query_param: String,
    api_key: String,
    api_host: String,
    song_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct ConversionResponse {
    link: Option<String>,
    title: Option<String>,
}

impl RapidApiDownloader {
    pub fn new(config: &Config) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()?;
        Ok(RapidApiDownloader {
            client,
            endpoint: config.yt_to_mp3_url.clone(),
            query_param: config.query_param.clone(),
            api_key: config.rapid_api_key.clone(),
            api_host: config.rapid_api_host.clone(),
            song_dir: config.song_dir.clone(),
        })
    }
}

impl AudioDownloader for RapidApiDownloader {
    fn fetch(&self, video_id: &str) -> Result<DownloadedAudio, FetchError> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[(self.query_param.as_str(), video_id)])
            .header("x-rapidapi-key", &self.api_key)
            .header("x-rapidapi-host", &self.api_host)
            .send()?
            .error_for_status()?;
        let body: ConversionResponse = response.json()?;

        let (link, title) = match (body.link, body.title) {
            (Some(link), Some(title)) => (link, title),
            _ => {
                error!(video_id, "conversion response missing link or title");
                return Err(FetchError::MalformedResponse(
                    "download link or title missing".to_string(),
                ));
            }
        };

        let mut audio = self.client.get(&link).send()?.error_for_status()?;
        let file = tempfile::Builder::new()
            .prefix("dl-")
            .suffix(".mp3")
            .tempfile_in(&self.song_dir)?;
        let (mut handle, path) = file.into_parts();
        audio.copy_to(&mut handle)?;
        handle.flush()?;

        info!(video_id, title = %title, "downloaded audio to {}", path.display());
        Ok(DownloadedAudio { file: path, title })
    }
}

/// YouTube Data v3 snippet fetcher.
pub struct YouTubeMetadataFetcher {
    client: reqwest::blocking::Client,
    endpoint: String,
    api_key: String,
}

impl YouTubeMetadataFetcher {
    const DEFAULT_ENDPOINT: &'static str = "https://www.googleapis.com/youtube/v3/videos";

    pub fn new(api_key: String) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()?;
        Ok(YouTubeMetadataFetcher {
            client,
            endpoint: Self::DEFAULT_ENDPOINT.to_string(),
            api_key,
        })
    }
}

impl MetadataFetcher for YouTubeMetadataFetcher {
    fn fetch(&self, video_id: &str) -> Result<VideoMetadata, FetchError> {
        let body: serde_json::Value = self
            .client
            .get(&self.endpoint)
            .query(&[("part", "snippet"), ("id", video_id), ("key", &self.api_key)])
            .send()?
            .error_for_status()?
            .json()?;

        let snippet = &body["items"][0]["snippet"];
        let channel_title = snippet["channelTitle"].as_str();
        let thumbnail_url = snippet["thumbnails"]["high"]["url"].as_str();
        match (channel_title, thumbnail_url) {
            (Some(channel_title), Some(thumbnail_url)) => Ok(VideoMetadata {
                channel_title: channel_title.to_string(),
                thumbnail_url: thumbnail_url.to_string(),
            }),
            _ => {
                error!(video_id, "snippet missing channelTitle or high thumbnail");
                Err(FetchError::MalformedResponse(
                    "video snippet incomplete".to_string(),
                ))
            }
        }
    }
}
