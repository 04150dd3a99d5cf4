use anyhow::{Result, anyhow};
use std::io;
use std::path::Path;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub const PLAYER_ENV_KEY: &str = "FIREPLAY_PLAYER";
const DEFAULT_PLAYER: &str = "mpv";

pub fn detect_player(configured: Option<&str>) -> String {
    configured
        .map(str::to_string)
        .or_else(|| std::env::var(PLAYER_ENV_KEY).ok())
        .filter(|val| !val.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_PLAYER.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayerExit {
    pub code: Option<i32>,
    pub killed: bool,
}

impl PlayerExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

// Dropping the handle leaves the process running.
#[derive(Debug)]
pub struct PlayerHandle {
    label: String,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<io::Result<PlayerExit>>,
}

impl PlayerHandle {
    pub fn supervise(label: impl Into<String>, child: Child) -> Self {
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(watch_child(child, stop_rx));
        Self::from_task(label, stop_tx, task)
    }

    pub fn from_task(
        label: impl Into<String>,
        stop: oneshot::Sender<()>,
        task: JoinHandle<io::Result<PlayerExit>>,
    ) -> Self {
        Self {
            label: label.into(),
            stop: Some(stop),
            task,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }

    pub async fn join(self) -> io::Result<PlayerExit> {
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(io::Error::other(err)),
        }
    }

    pub fn detach(self) {
        debug!(player = %self.label, "detaching player");
    }
}

async fn watch_child(mut child: Child, mut stop: oneshot::Receiver<()>) -> io::Result<PlayerExit> {
    tokio::select! {
        status = child.wait() => {
            let status = status?;
            Ok(PlayerExit { code: status.code(), killed: false })
        }
        Ok(()) = &mut stop => {
            child.start_kill()?;
            let status = child.wait().await?;
            Ok(PlayerExit { code: status.code(), killed: true })
        }
    }
}

pub trait PlayerLauncher {
    fn launch(&self, target: &str, title: &str) -> Result<PlayerHandle>;
}

pub struct ExternalPlayer {
    program: String,
    args: Vec<String>,
}

impl ExternalPlayer {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn is_mpv(&self) -> bool {
        Path::new(&self.program)
            .file_stem()
            .is_some_and(|stem| stem == DEFAULT_PLAYER)
    }

    fn command_args(&self, target: &str, title: &str) -> Vec<String> {
        let mut args = Vec::with_capacity(self.args.len() + 4);
        if self.is_mpv() {
            args.push(String::from("--quiet"));
            args.push(String::from("--terminal=no"));
            args.push(format!("--force-media-title={title}"));
        }
        args.extend(self.args.iter().cloned());
        args.push(target.to_string());
        args
    }
}

impl PlayerLauncher for ExternalPlayer {
    fn launch(&self, target: &str, title: &str) -> Result<PlayerHandle> {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.command_args(target, title));
        // stdin carries navigation commands; the player must not read it.
        cmd.stdin(Stdio::null());

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                if err.kind() == io::ErrorKind::NotFound {
                    return Err(anyhow!(
                        "Player '{}' not found. Install mpv or set {} to a valid command.",
                        self.program,
                        PLAYER_ENV_KEY
                    ));
                }
                return Err(anyhow!(err).context(format!("failed to launch player '{}'", self.program)));
            }
        };
        info!(player = %self.program, %target, pid = ?child.id(), "player started");
        Ok(PlayerHandle::supervise(title, child))
    }
}
