use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tracing::{debug, info, warn};

use crate::error::{PlaybackError, ResolveError};
use crate::player::{PlayerHandle, PlayerLauncher};
use crate::types::Episode;

pub trait MediaSource {
    async fn media_url(&self, episode: &Episode) -> Result<String, ResolveError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Next,
    Prev,
    Quit,
}

impl Command {
    pub fn from_char(ch: char) -> Option<Self> {
        match ch.to_ascii_lowercase() {
            'n' => Some(Command::Next),
            'p' => Some(Command::Prev),
            'q' => Some(Command::Quit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Playing(usize),
    Stopped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QuitPolicy {
    #[default]
    Detach,
    Stop,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

pub struct PlaybackSession {
    episodes: Vec<Episode>,
    current: usize,
    player: Option<PlayerHandle>,
}

pub struct PlaybackController<S, L> {
    title: String,
    source: S,
    launcher: L,
    quit_policy: QuitPolicy,
    session: PlaybackSession,
    state: PlaybackState,
}

impl<S: MediaSource, L: PlayerLauncher> PlaybackController<S, L> {
    pub fn new(
        title: impl Into<String>,
        episodes: Vec<Episode>,
        source: S,
        launcher: L,
    ) -> Result<Self, PlaybackError> {
        if episodes.is_empty() {
            return Err(PlaybackError::EmptyEpisodeList);
        }
        Ok(Self {
            title: title.into(),
            source,
            launcher,
            quit_policy: QuitPolicy::default(),
            session: PlaybackSession {
                episodes,
                current: 0,
                player: None,
            },
            state: PlaybackState::Idle,
        })
    }

    pub fn with_quit_policy(mut self, policy: QuitPolicy) -> Self {
        self.quit_policy = policy;
        self
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn current_episode(&self) -> &Episode {
        &self.session.episodes[self.session.current]
    }

    pub fn start(&mut self, index: usize, target: &str) -> Result<(), PlaybackError> {
        let len = self.session.episodes.len();
        if index >= len {
            return Err(PlaybackError::IndexOutOfRange { index, len });
        }
        let handle = self.launch(index, target)?;
        self.commit(index, handle);
        Ok(())
    }

    pub async fn handle(&mut self, command: Command) -> Result<Flow, PlaybackError> {
        match command {
            Command::Quit => {
                println!("Quitting video playback.");
                self.release_player().await;
                self.state = PlaybackState::Stopped;
                Ok(Flow::Exit)
            }
            Command::Next => {
                if self.session.current + 1 >= self.session.episodes.len() {
                    println!("Already at the last episode.");
                    return Ok(Flow::Continue);
                }
                self.switch_to(self.session.current + 1).await
            }
            Command::Prev => {
                if self.session.current == 0 {
                    println!("Already at the first episode.");
                    return Ok(Flow::Continue);
                }
                self.switch_to(self.session.current - 1).await
            }
        }
    }

    pub async fn run<R: AsyncRead + Unpin>(&mut self, input: R) {
        println!("Press 'n' for next episode, 'p' for previous episode, 'q' to quit:");
        let mut input = BufReader::new(input);
        loop {
            let byte = match input.read_u8().await {
                Ok(byte) => byte,
                Err(err) => {
                    if err.kind() == std::io::ErrorKind::UnexpectedEof {
                        info!("command input closed");
                    } else {
                        warn!(error = %err, "failed to read command");
                    }
                    break;
                }
            };
            let Some(command) = Command::from_char(char::from(byte)) else {
                continue;
            };
            match self.handle(command).await {
                Ok(Flow::Exit) => return,
                Ok(Flow::Continue) => {}
                Err(err) => {
                    warn!(error = %err, ?command, "episode switch failed");
                    println!("Failed to switch episode: {err}");
                }
            }
        }
        self.wait_for_player().await;
        self.state = PlaybackState::Stopped;
    }

    async fn switch_to(&mut self, index: usize) -> Result<Flow, PlaybackError> {
        let episode = self.session.episodes[index].clone();
        if self.session.player.is_some() {
            println!(
                "Switching to episode {}. Close the player to continue.",
                episode.label
            );
        }
        self.wait_for_player().await;
        let url = self.source.media_url(&episode).await?;
        let handle = self.launch(index, &url)?;
        self.commit(index, handle);
        Ok(Flow::Continue)
    }

    fn launch(&self, index: usize, target: &str) -> Result<PlayerHandle, PlaybackError> {
        let episode = &self.session.episodes[index];
        let media_title = format!("{} - {}", self.title, episode.label);
        self.launcher
            .launch(target, &media_title)
            .map_err(PlaybackError::Launch)
    }

    fn commit(&mut self, index: usize, handle: PlayerHandle) {
        info!(episode = self.session.episodes[index].ordinal, "now playing");
        self.session.current = index;
        self.session.player = Some(handle);
        self.state = PlaybackState::Playing(index);
    }

    async fn wait_for_player(&mut self) {
        if let Some(player) = self.session.player.take() {
            let label = player.label().to_string();
            match player.join().await {
                Ok(exit) if exit.success() || exit.killed => {
                    debug!(player = %label, ?exit, "player exited")
                }
                Ok(exit) => warn!(player = %label, code = ?exit.code, "player exited with an error"),
                Err(err) => warn!(player = %label, error = %err, "failed to wait for player"),
            }
        }
    }

    async fn release_player(&mut self) {
        match self.quit_policy {
            QuitPolicy::Detach => {
                if let Some(player) = self.session.player.take() {
                    player.detach();
                }
            }
            QuitPolicy::Stop => {
                if let Some(player) = self.session.player.as_mut() {
                    player.stop();
                }
                self.wait_for_player().await;
            }
        }
    }
}
