//! Process configuration, read from the environment.

use std::env;
use std::path::PathBuf;

use thiserror::Error;

pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;
pub const DEFAULT_SONG_DIR: &str = "downloaded_songs";
pub const DEFAULT_QUERY_PARAM: &str = "id";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    MissingVar(&'static str),
    #[error("environment variable {var} has invalid value {value:?}: {reason}")]
    InvalidVar {
        var: &'static str,
        value: String,
        reason: &'static str,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Path of the SQLite catalog database.
    pub db_path: PathBuf,
    /// Log every store statement at DEBUG.
    pub echo_sql: bool,
    /// Downloader endpoint and credentials.
    pub yt_to_mp3_url: String,
    pub query_param: String,
    pub rapid_api_key: String,
    pub rapid_api_host: String,
    /// Metadata fetcher credential.
    pub youtube_api_key: String,
    /// Directory for transient downloaded/uploaded audio.
    pub song_dir: PathBuf,
    /// DSP sample rate.
    pub sample_rate: u32,
    /// Matcher cutoff in [0, 1].
    pub confidence_threshold: f32,
}

impl Config {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Reads the configuration through an arbitrary variable lookup. Lets
    /// tests supply a map instead of mutating the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |var: &'static str| -> Result<String, ConfigError> {
            match lookup(var) {
                Some(value) if !value.is_empty() => Ok(value),
                _ => Err(ConfigError::MissingVar(var)),
            }
        };

        let sample_rate = match lookup("SAMPLE_RATE") {
            None => DEFAULT_SAMPLE_RATE,
            Some(value) => value.parse::<u32>().ok().filter(|&sr| sr > 0).ok_or(
                ConfigError::InvalidVar {
                    var: "SAMPLE_RATE",
                    value,
                    reason: "expected a positive integer",
                },
            )?,
        };

        let confidence_threshold = match lookup("CONFIDENCE_THRESHOLD") {
            None => 0.0,
            Some(value) => value
                .parse::<f32>()
                .ok()
                .filter(|c| (0.0..=1.0).contains(c))
                .ok_or(ConfigError::InvalidVar {
                    var: "CONFIDENCE_THRESHOLD",
                    value,
                    reason: "expected a number in [0, 1]",
                })?,
        };

        Ok(Config {
            db_path: PathBuf::from(required("DB_URL")?),
            echo_sql: lookup("ECHO_SQL").is_some_and(|v| parse_bool(&v)),
            yt_to_mp3_url: required("YT_TO_MP3_URL")?,
            query_param: lookup("QUERY_PARAM").unwrap_or_else(|| DEFAULT_QUERY_PARAM.to_string()),
            rapid_api_key: required("RAPID_API_KEY")?,
            rapid_api_host: required("RAPID_API_HOST")?,
            youtube_api_key: required("YOUTUBE_API_KEY")?,
            song_dir: PathBuf::from(
                lookup("SONG_DIR").unwrap_or_else(|| DEFAULT_SONG_DIR.to_string()),
            ),
            sample_rate,
            confidence_threshold,
        })
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_vars() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("DB_URL", "/tmp/catalog.sqlite"),
            ("YT_TO_MP3_URL", "https://converter.example/dl"),
            ("RAPID_API_KEY", "key"),
            ("RAPID_API_HOST", "converter.example"),
            ("YOUTUBE_API_KEY", "yt-key"),
        ])
    }

    fn config_from(vars: &HashMap<&'static str, &'static str>) -> Result<Config, ConfigError> {
        Config::from_lookup(|var| vars.get(var).map(|v| v.to_string()))
    }

    #[test]
    fn defaults_apply_when_optionals_are_absent() {
        let config = config_from(&base_vars()).unwrap();
        assert_eq!(config.sample_rate, DEFAULT_SAMPLE_RATE);
        assert_eq!(config.confidence_threshold, 0.0);
        assert_eq!(config.song_dir, PathBuf::from(DEFAULT_SONG_DIR));
        assert_eq!(config.query_param, "id");
        assert!(!config.echo_sql);
    }

    #[test]
    fn missing_required_variable_is_named() {
        let mut vars = base_vars();
        vars.remove("RAPID_API_KEY");
        match config_from(&vars) {
            Err(ConfigError::MissingVar("RAPID_API_KEY")) => {}
            other => panic!("expected MissingVar, got {other:?}"),
        }
    }

    #[test]
    fn overrides_are_honored() {
        let mut vars = base_vars();
        vars.insert("SAMPLE_RATE", "22050");
        vars.insert("CONFIDENCE_THRESHOLD", "0.25");
        vars.insert("SONG_DIR", "scratch");
        vars.insert("QUERY_PARAM", "video");
        vars.insert("ECHO_SQL", "true");

        let config = config_from(&vars).unwrap();
        assert_eq!(config.sample_rate, 22_050);
        assert_eq!(config.confidence_threshold, 0.25);
        assert_eq!(config.song_dir, PathBuf::from("scratch"));
        assert_eq!(config.query_param, "video");
        assert!(config.echo_sql);
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        let mut vars = base_vars();
        vars.insert("SAMPLE_RATE", "not-a-rate");
        assert!(matches!(
            config_from(&vars),
            Err(ConfigError::InvalidVar { var: "SAMPLE_RATE", .. })
        ));

        let mut vars = base_vars();
        vars.insert("CONFIDENCE_THRESHOLD", "1.5");
        assert!(matches!(
            config_from(&vars),
            Err(ConfigError::InvalidVar { var: "CONFIDENCE_THRESHOLD", .. })
        ));
    }
}
