use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use dirs_next::{config_dir, data_dir};
use serde::{Deserialize, Serialize};

use crate::net::PeerPolicy;
use crate::playback::QuitPolicy;

const APP_DIR: &str = "fireplay";
pub const ENV_PREFIX: &str = "FIREPLAY";
pub const DEFAULT_BASE_URL: &str = "https://animefire.plus/";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player: Option<String>,
    pub player_args: Vec<String>,
    pub chunk_count: u64,
    pub connect_timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_dir: Option<PathBuf>,
    pub allow_private_peers: bool,
    pub quit_stops_player: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_url: String::from(DEFAULT_BASE_URL),
            player: None,
            player_args: Vec::new(),
            chunk_count: 4,
            connect_timeout_secs: 10,
            download_dir: None,
            allow_private_peers: false,
            quit_stops_player: false,
        }
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join(APP_DIR).join("config.toml"))
}

impl Settings {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .list_separator(" ")
                .with_list_parse_key("player_args"),
        );
        let settings = builder
            .build()
            .context("failed to read configuration")?
            .try_deserialize()
            .context("invalid configuration")?;
        Ok(settings)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let text = toml::to_string_pretty(self).context("failed to serialize configuration")?;
        fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))
    }

    pub fn download_root(&self) -> PathBuf {
        self.download_dir.clone().unwrap_or_else(|| {
            data_dir()
                .map(|dir| dir.join(APP_DIR).join("downloads"))
                .unwrap_or_else(|| PathBuf::from("downloads"))
        })
    }

    pub fn episode_path(&self, show_slug: &str, ordinal: u32) -> PathBuf {
        self.download_root()
            .join(show_slug)
            .join(format!("{ordinal}.mp4"))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn peer_policy(&self) -> PeerPolicy {
        if self.allow_private_peers {
            PeerPolicy::permissive()
        } else {
            PeerPolicy::strict()
        }
    }

    pub fn quit_policy(&self) -> QuitPolicy {
        if self.quit_stops_player {
            QuitPolicy::Stop
        } else {
            QuitPolicy::Detach
        }
    }
}
