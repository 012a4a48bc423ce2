use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use resona::fetch::{RapidApiDownloader, YouTubeMetadataFetcher};
use resona::transcode::FfmpegTranscoder;
use resona::{CancelToken, Config, Engine, Service, Store};

#[derive(Parser)]
#[command(name = "resona", version, about = "Audio content identification service")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download a track by YouTube URL or video id and add it to the catalog
    Add {
        /// YouTube URL or bare 11-character video id
        source: String,
    },
    /// Match a local audio file against the catalog
    Match {
        /// Path of the audio snippet to identify
        file: PathBuf,
    },
    /// List catalog tracks
    List {
        #[arg(long, default_value_t = 0)]
        offset: u64,
        #[arg(long, default_value_t = 10)]
        limit: u64,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().context("loading configuration")?;

    let store = Store::open(&config.db_path, config.echo_sql).context("opening store")?;
    let engine = Engine::new(store, config.sample_rate, config.confidence_threshold);
    let service = Service::new(
        engine,
        Box::new(RapidApiDownloader::new(&config).context("building downloader")?),
        Box::new(
            YouTubeMetadataFetcher::new(config.youtube_api_key.clone())
                .context("building metadata fetcher")?,
        ),
        Box::new(FfmpegTranscoder),
        config.song_dir.clone(),
    )?;
    let cancel = CancelToken::new();

    match cli.command {
        Command::Add { source } => {
            let outcome = service.add_track(&source, &cancel)?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Command::Match { file } => {
            let data = fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
            let name = file
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("upload.bin");
            let matches = service.match_audio(&data, name, &cancel)?;
            if matches.is_empty() {
                println!("no match");
            } else {
                println!("{}", serde_json::to_string_pretty(&matches)?);
            }
        }
        Command::List { offset, limit } => {
            let page = service.list_tracks(offset, limit)?;
            println!("{}", serde_json::to_string_pretty(&page)?);
        }
    }
    Ok(())
}
