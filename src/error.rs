use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("address {0} is not allowed")]
pub struct BlockedAddress(pub IpAddr);

#[derive(Debug, Error)]
pub enum DialError {
    #[error("invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("connection to {0} is not allowed")]
    NotAllowed(IpAddr),

    #[error("connect or handshake timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Network(#[from] DialError),

    #[error("{url} answered with status {status}")]
    Status { url: String, status: StatusCode },

    #[error("failed to parse response from {url}: {reason}")]
    Parse { url: String, reason: String },

    #[error("no video source found on {0}")]
    NotFound(String),

    #[error("no renditions listed at {0}")]
    NoCandidates(String),
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("chunk count {count} is invalid for a resource of {total} bytes")]
    InvalidChunkCount { count: u64, total: u64 },

    #[error("another download is already writing {}", .0.display())]
    DestinationBusy(PathBuf),

    #[error("server rejected the download: {0}")]
    ServerRejected(String),

    #[error("server does not support partial content")]
    PartialContentUnsupported,

    #[error(transparent)]
    Network(#[from] DialError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("downloaded {actual} of {expected} bytes")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("download cancelled")]
    Cancelled,
}

impl DownloadError {
    pub fn wants_single_stream(&self) -> bool {
        matches!(
            self,
            DownloadError::ServerRejected(_) | DownloadError::PartialContentUnsupported
        )
    }
}

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("episode list is empty")]
    EmptyEpisodeList,

    #[error("episode index {index} is out of range for {len} episodes")]
    IndexOutOfRange { index: usize, len: usize },

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("failed to launch player: {0:#}")]
    Launch(anyhow::Error),
}
