use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShowCandidate {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Episode {
    pub label: String,
    pub ordinal: u32,
    pub source_ref: String,
}

impl Episode {
    pub fn new(label: impl Into<String>, ordinal: u32, source_ref: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ordinal,
            source_ref: source_ref.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaCandidate {
    pub label: String,
    pub src: String,
}

#[derive(Debug, Deserialize)]
pub struct RenditionListing {
    #[serde(default)]
    pub data: Vec<MediaCandidate>,
}

#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub source_url: String,
    pub destination: PathBuf,
    pub chunk_count: u64,
}

impl DownloadJob {
    pub fn new(source_url: impl Into<String>, destination: impl Into<PathBuf>, chunk_count: u64) -> Self {
        Self {
            source_url: source_url.into(),
            destination: destination.into(),
            chunk_count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    Pending,
    InFlight,
    Complete,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: u64,
    pub start: u64,
    pub end: u64,
    pub bytes_written: u64,
    pub status: ChunkStatus,
}

impl Chunk {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn range_header(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}
