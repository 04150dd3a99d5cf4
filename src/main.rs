use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use dialoguer::{Confirm, FuzzySelect, Input, Select, theme::ColorfulTheme};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod catalog;
mod config;
mod download;
mod error;
mod net;
mod playback;
mod player;
mod progress;
mod resolver;
#[cfg(test)]
mod test_server;
mod types;

use crate::catalog::{AnimeFireCatalog, Catalog, show_slug};
use crate::config::{Settings, default_config_path};
use crate::download::{ChunkedDownloader, DownloadRegistry};
use crate::error::DownloadError;
use crate::net::TrustedDialer;
use crate::playback::PlaybackController;
use crate::player::{ExternalPlayer, detect_player};
use crate::progress::ChunkBars;
use crate::resolver::VideoResolver;
use crate::types::{DownloadJob, Episode, ShowCandidate};

#[derive(Parser, Debug)]
#[command(
    name = "fireplay",
    about = "Search, download and play anime episodes through an external player.",
    version
)]
struct Cli {
    #[arg(short = 'e', long, value_name = "EPISODE")]
    episode: Option<u32>,

    /// Download without asking.
    #[arg(long, conflicts_with = "stream")]
    download: bool,

    /// Stream without asking.
    #[arg(long)]
    stream: bool,

    #[arg(long, value_name = "N")]
    chunks: Option<u64>,

    #[arg(long, value_name = "CMD")]
    player: Option<String>,

    /// Extra player arguments, split like a shell would.
    #[arg(long, value_name = "ARGS", allow_hyphen_values = true)]
    player_args: Option<String>,

    /// Connect and TLS handshake timeout in seconds.
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    #[arg(long, value_name = "DIR")]
    download_dir: Option<PathBuf>,

    /// Allow loopback and private network peers (LAN media servers).
    #[arg(long)]
    allow_private_peers: bool,

    /// Kill the player when quitting instead of leaving it open.
    #[arg(long)]
    stop_on_quit: bool,

    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Write the effective settings to the config file and exit.
    #[arg(long)]
    write_config: bool,

    #[arg(short, long)]
    verbose: bool,

    #[arg(value_name = "QUERY")]
    query: Vec<String>,
}

impl Cli {
    fn download_choice(&self) -> Option<bool> {
        if self.download {
            Some(true)
        } else if self.stream {
            Some(false)
        } else {
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_interrupt(shutdown.clone()));

    let result = run(cli, &shutdown).await;
    if let Err(err) = &result {
        eprintln!("error: {err:?}");
    }
    if shutdown.is_cancelled() {
        // A pending stdin read would otherwise hold the runtime open.
        std::process::exit(130);
    }
    result
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "fireplay=debug"
    } else {
        "fireplay=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn cancel_on_interrupt(token: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("interrupt received");
        token.cancel();
    }
}

async fn interruptible<T>(
    shutdown: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        result = fut => result,
        _ = shutdown.cancelled() => Err(anyhow!("interrupted")),
    }
}

async fn run(cli: Cli, shutdown: &CancellationToken) -> Result<()> {
    let config_path = cli.config.clone().or_else(default_config_path);
    let mut settings = Settings::load(config_path.as_deref())?;
    apply_overrides(&mut settings, &cli)?;

    if cli.write_config {
        let path = config_path.context("no configuration directory available; pass --config")?;
        settings.write(&path)?;
        println!("Wrote configuration to {}.", path.display());
        return Ok(());
    }

    let dialer = TrustedDialer::new(settings.connect_timeout(), settings.peer_policy())?;
    let catalog = AnimeFireCatalog::new(dialer.clone(), &settings.base_url)?;
    let theme = theme();

    let query = if cli.query.is_empty() {
        Input::<String>::with_theme(&theme)
            .with_prompt("Anime name")
            .interact_text()?
    } else {
        cli.query.join(" ")
    };
    let query = query.trim().to_string();
    if query.is_empty() {
        println!("No query provided.");
        return Ok(());
    }

    let shows = interruptible(shutdown, catalog.search(&query)).await?;
    if shows.is_empty() {
        bail!("No anime found for \"{}\"", query);
    }
    let Some(show) = select_show(&theme, &shows)? else {
        println!("Cancelled.");
        return Ok(());
    };

    let episodes = interruptible(shutdown, catalog.list_episodes(&show.url)).await?;
    if episodes.is_empty() {
        bail!("No episodes found for {}", show.name);
    }
    let Some(index) = select_episode(&theme, &episodes, cli.episode)? else {
        println!("Cancelled.");
        return Ok(());
    };

    let resolver = VideoResolver::new(dialer.clone());
    let episode = &episodes[index];
    let media_url = interruptible(shutdown, async {
        resolver
            .resolve_episode(&episode.source_ref)
            .await
            .with_context(|| format!("failed to resolve {}", episode.label))
    })
    .await?;
    info!(episode = episode.ordinal, url = %media_url, "resolved media");

    let downloader = ChunkedDownloader::new(dialer.clone(), DownloadRegistry::default())
        .with_progress(Arc::new(ChunkBars::new()));
    let target = prepare_target(
        &cli, &settings, &theme, &downloader, &show, episode, &media_url, shutdown,
    )
    .await?;

    let player = ExternalPlayer::new(
        detect_player(settings.player.as_deref()),
        settings.player_args.clone(),
    );
    let mut controller = PlaybackController::new(show.name.clone(), episodes, resolver, player)?
        .with_quit_policy(settings.quit_policy());
    controller.start(index, &target)?;

    tokio::select! {
        _ = controller.run(tokio::io::stdin()) => {}
        _ = shutdown.cancelled() => println!("Interrupted."),
    }
    info!(
        state = ?controller.state(),
        episode = controller.current_episode().ordinal,
        "playback ended"
    );
    Ok(())
}

fn apply_overrides(settings: &mut Settings, cli: &Cli) -> Result<()> {
    if let Some(player) = &cli.player {
        settings.player = Some(player.clone());
    }
    if let Some(args) = &cli.player_args {
        settings.player_args = shlex::split(args)
            .with_context(|| format!("could not parse player arguments '{args}'"))?;
    }
    if let Some(chunks) = cli.chunks {
        settings.chunk_count = chunks;
    }
    if let Some(timeout) = cli.timeout {
        settings.connect_timeout_secs = timeout;
    }
    if let Some(dir) = &cli.download_dir {
        settings.download_dir = Some(dir.clone());
    }
    if cli.allow_private_peers {
        settings.allow_private_peers = true;
    }
    if cli.stop_on_quit {
        settings.quit_stops_player = true;
    }
    Ok(())
}

fn select_show(theme: &ColorfulTheme, shows: &[ShowCandidate]) -> Result<Option<ShowCandidate>> {
    let names: Vec<&str> = shows.iter().map(|show| show.name.as_str()).collect();
    let selection = FuzzySelect::with_theme(theme)
        .with_prompt("Select the anime (type to filter, Esc to cancel)")
        .items(&names)
        .default(0)
        .interact_opt()?;
    Ok(selection.map(|idx| shows[idx].clone()))
}

fn find_episode(episodes: &[Episode], ordinal: u32) -> Option<usize> {
    episodes.iter().position(|ep| ep.ordinal == ordinal)
}

fn select_episode(
    theme: &ColorfulTheme,
    episodes: &[Episode],
    requested: Option<u32>,
) -> Result<Option<usize>> {
    if let Some(ordinal) = requested {
        let idx = find_episode(episodes, ordinal).ok_or_else(|| {
            let first = episodes.first().map(|ep| ep.ordinal).unwrap_or_default();
            let last = episodes.last().map(|ep| ep.ordinal).unwrap_or_default();
            anyhow!("Episode {ordinal} not found. Available: {first}-{last}.")
        })?;
        return Ok(Some(idx));
    }
    if episodes.len() == 1 {
        println!("The selected anime has a single episode.");
        return Ok(Some(0));
    }
    println!("The selected anime is a series with {} episodes.", episodes.len());
    let labels: Vec<&str> = episodes.iter().map(|ep| ep.label.as_str()).collect();
    let selection = Select::with_theme(theme)
        .with_prompt("Select the episode (Esc to cancel)")
        .items(&labels)
        .default(0)
        .interact_opt()?;
    Ok(selection)
}

// Local path when the episode is downloaded and wanted offline, else the remote URL.
#[allow(clippy::too_many_arguments)]
async fn prepare_target(
    cli: &Cli,
    settings: &Settings,
    theme: &ColorfulTheme,
    downloader: &ChunkedDownloader,
    show: &ShowCandidate,
    episode: &Episode,
    media_url: &str,
    shutdown: &CancellationToken,
) -> Result<String> {
    let wants_download = match cli.download_choice() {
        Some(choice) => choice,
        None => Confirm::with_theme(theme)
            .with_prompt("Do you want to download the episode?")
            .default(false)
            .interact()?,
    };
    if !wants_download {
        return Ok(media_url.to_string());
    }

    let destination = settings.episode_path(&show_slug(&show.url), episode.ordinal);
    if destination.exists() {
        println!("Already downloaded: {}", destination.display());
    } else {
        let downloaded = download_episode(
            downloader,
            settings.chunk_count,
            media_url,
            &destination,
            shutdown,
        )
        .await;
        match downloaded {
            Ok(bytes) => println!("Saved {} ({bytes} bytes).", destination.display()),
            Err(DownloadError::Cancelled) => bail!("Download cancelled."),
            Err(err) => {
                warn!(error = %err, "download failed");
                println!("Download failed: {err}. Streaming instead.");
                return Ok(media_url.to_string());
            }
        }
    }

    let play_offline = cli.download
        || Confirm::with_theme(theme)
            .with_prompt("Do you want to play the downloaded version offline?")
            .default(true)
            .interact()?;
    if play_offline {
        Ok(destination.to_string_lossy().into_owned())
    } else {
        Ok(media_url.to_string())
    }
}

async fn download_episode(
    downloader: &ChunkedDownloader,
    chunk_count: u64,
    media_url: &str,
    destination: &Path,
    shutdown: &CancellationToken,
) -> Result<u64, DownloadError> {
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let job = DownloadJob::new(media_url, destination, chunk_count);
    println!(
        "Downloading to {} in {} chunks...",
        destination.display(),
        job.chunk_count
    );
    downloader.download_with_fallback(&job, shutdown).await
}

fn theme() -> ColorfulTheme {
    ColorfulTheme::default()
}
