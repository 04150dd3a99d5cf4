use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::StreamExt;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, RANGE};
use reqwest::{Method, StatusCode};
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::DownloadError;
use crate::net::TrustedDialer;
use crate::progress::{ProgressReporter, ProgressSink, Silent};
use crate::types::{Chunk, ChunkStatus, DownloadJob};

// The last range absorbs the remainder of the integer division.
pub fn plan_chunks(total: u64, count: u64) -> Result<Vec<Chunk>, DownloadError> {
    if count == 0 || count > total {
        return Err(DownloadError::InvalidChunkCount { count, total });
    }
    let size = total / count;
    Ok((0..count)
        .map(|index| {
            let start = index * size;
            let end = if index == count - 1 {
                total - 1
            } else {
                start + size - 1
            };
            Chunk {
                index,
                start,
                end,
                bytes_written: 0,
                status: ChunkStatus::Pending,
            }
        })
        .collect())
}

pub fn part_path(destination: &Path, index: u64) -> PathBuf {
    suffixed(destination, &format!(".part{index}"))
}

fn suffixed(destination: &Path, suffix: &str) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(suffix);
    destination.with_file_name(name)
}

#[derive(Clone, Default)]
pub struct DownloadRegistry {
    active: Arc<Mutex<HashSet<PathBuf>>>,
}

impl DownloadRegistry {
    pub fn reserve(&self, destination: &Path) -> Result<Reservation, DownloadError> {
        let key = std::path::absolute(destination).unwrap_or_else(|_| destination.to_path_buf());
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if !active.insert(key.clone()) {
            return Err(DownloadError::DestinationBusy(destination.to_path_buf()));
        }
        Ok(Reservation {
            registry: self.clone(),
            key,
        })
    }
}

pub struct Reservation {
    registry: DownloadRegistry,
    key: PathBuf,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.registry
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

pub struct ChunkedDownloader {
    dialer: TrustedDialer,
    registry: DownloadRegistry,
    progress: Arc<dyn ProgressReporter>,
}

impl ChunkedDownloader {
    pub fn new(dialer: TrustedDialer, registry: DownloadRegistry) -> Self {
        Self {
            dialer,
            registry,
            progress: Arc::new(Silent),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub async fn probe(&self, url: &str) -> Result<u64, DownloadError> {
        let response = self.dialer.head(url).await?;
        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
            return Err(DownloadError::ServerRejected(format!(
                "HEAD {url} answered {status}"
            )));
        }
        let headers = response.headers();
        let ranged = headers
            .get(ACCEPT_RANGES)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| {
                value
                    .split(',')
                    .any(|unit| unit.trim().eq_ignore_ascii_case("bytes"))
            });
        if !ranged {
            return Err(DownloadError::PartialContentUnsupported);
        }
        headers
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .ok_or_else(|| {
                DownloadError::ServerRejected(format!("HEAD {url} declared no Content-Length"))
            })
    }

    pub async fn download(
        &self,
        job: &DownloadJob,
        cancel: &CancellationToken,
    ) -> Result<u64, DownloadError> {
        let _reservation = self.registry.reserve(&job.destination)?;
        let total = self.probe(&job.source_url).await?;
        let plan = plan_chunks(total, job.chunk_count)?;
        info!(
            url = %job.source_url,
            destination = %job.destination.display(),
            total,
            chunks = plan.len(),
            "starting chunked download"
        );

        let handles: Vec<JoinHandle<Chunk>> = plan
            .iter()
            .cloned()
            .map(|chunk| {
                let task = ChunkTask {
                    dialer: self.dialer.clone(),
                    url: job.source_url.clone(),
                    path: part_path(&job.destination, chunk.index),
                    total,
                    sink: self
                        .progress
                        .sink(format!("part {}", chunk.index), Some(chunk.len())),
                    cancel: cancel.clone(),
                };
                tokio::spawn(task.run(chunk))
            })
            .collect();

        // Every task is joined before the parts are touched.
        let mut finished = Vec::with_capacity(handles.len());
        for (handle, planned) in handles.into_iter().zip(plan) {
            match handle.await {
                Ok(chunk) => finished.push(chunk),
                Err(err) => {
                    warn!(chunk = planned.index, error = %err, "chunk task aborted");
                    finished.push(Chunk {
                        status: ChunkStatus::Failed,
                        ..planned
                    });
                }
            }
        }

        let merged = merge_parts(&job.destination, &finished).await;
        remove_parts(&job.destination, &finished).await;

        if cancel.is_cancelled() {
            discard(&job.destination).await;
            return Err(DownloadError::Cancelled);
        }
        if let Err(err) = merged {
            discard(&job.destination).await;
            return Err(err.into());
        }

        let failed: Vec<u64> = finished
            .iter()
            .filter(|chunk| chunk.status != ChunkStatus::Complete)
            .map(|chunk| chunk.index)
            .collect();
        let written: u64 = finished.iter().map(|chunk| chunk.bytes_written).sum();
        let actual = fs::metadata(&job.destination).await?.len();
        if actual != total || written != total {
            warn!(?failed, expected = total, actual, written, "download incomplete");
            discard(&job.destination).await;
            return Err(DownloadError::SizeMismatch {
                expected: total,
                actual,
            });
        }
        info!(destination = %job.destination.display(), bytes = total, "download complete");
        Ok(total)
    }

    pub async fn download_single(
        &self,
        job: &DownloadJob,
        cancel: &CancellationToken,
    ) -> Result<u64, DownloadError> {
        let _reservation = self.registry.reserve(&job.destination)?;
        let partial = suffixed(&job.destination, ".part");
        let result = self.stream_whole(job, &partial, cancel).await;
        match result {
            Ok(written) => {
                fs::rename(&partial, &job.destination).await?;
                info!(destination = %job.destination.display(), bytes = written, "download complete");
                Ok(written)
            }
            Err(err) => {
                discard(&partial).await;
                Err(err)
            }
        }
    }

    async fn stream_whole(
        &self,
        job: &DownloadJob,
        partial: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64, DownloadError> {
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            response = self.dialer.get(&job.source_url) => response?,
        };
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::ServerRejected(format!(
                "GET {} answered {status}",
                job.source_url
            )));
        }
        let declared = response.content_length();
        let sink = self.progress.sink(String::from("video"), declared);
        let mut writer = BufWriter::new(File::create(partial).await?);
        let mut body = response.bytes_stream();
        let mut written = 0u64;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                next = body.next() => next,
            };
            let Some(piece) = next else { break };
            let piece = piece.map_err(|err| self.dialer.classify(err))?;
            writer.write_all(&piece).await?;
            written += piece.len() as u64;
            sink.add(piece.len() as u64);
        }
        writer.flush().await?;
        sink.finish();
        if let Some(expected) = declared
            && expected != written
        {
            return Err(DownloadError::SizeMismatch {
                expected,
                actual: written,
            });
        }
        Ok(written)
    }

    pub async fn download_with_fallback(
        &self,
        job: &DownloadJob,
        cancel: &CancellationToken,
    ) -> Result<u64, DownloadError> {
        match self.download(job, cancel).await {
            Err(err) if err.wants_single_stream() => {
                warn!(error = %err, "chunked download unavailable, falling back to a single stream");
                self.download_single(job, cancel).await
            }
            other => other,
        }
    }
}

struct ChunkTask {
    dialer: TrustedDialer,
    url: String,
    path: PathBuf,
    total: u64,
    sink: Box<dyn ProgressSink>,
    cancel: CancellationToken,
}

impl ChunkTask {
    async fn run(self, mut chunk: Chunk) -> Chunk {
        chunk.status = ChunkStatus::InFlight;
        match self.fetch(&mut chunk).await {
            Ok(()) => {
                chunk.status = ChunkStatus::Complete;
                debug!(chunk = chunk.index, bytes = chunk.bytes_written, "chunk complete");
            }
            Err(err) => {
                chunk.status = ChunkStatus::Failed;
                warn!(chunk = chunk.index, error = %err, "chunk download failed");
            }
        }
        self.sink.finish();
        chunk
    }

    async fn fetch(&self, chunk: &mut Chunk) -> Result<(), DownloadError> {
        self.dialer.policy().validate_url(&self.url)?;
        // Created up front so the merge always finds one file per index.
        let mut writer = BufWriter::new(File::create(&self.path).await?);

        let request = self
            .dialer
            .request(Method::GET, &self.url)?
            .header(RANGE, chunk.range_header());
        let response = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(DownloadError::Cancelled),
            response = self.dialer.send(request) => response?,
        };
        let status = response.status();
        let spans_resource = chunk.start == 0 && chunk.end + 1 == self.total;
        if status != StatusCode::PARTIAL_CONTENT && !(status == StatusCode::OK && spans_resource) {
            return Err(DownloadError::ServerRejected(format!(
                "range {} answered {status}",
                chunk.range_header()
            )));
        }

        let mut body = response.bytes_stream();
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(DownloadError::Cancelled),
                next = body.next() => next,
            };
            let Some(piece) = next else { break };
            let piece = piece.map_err(|err| self.dialer.classify(err))?;
            let remaining = chunk.len() - chunk.bytes_written;
            if piece.len() as u64 > remaining {
                return Err(DownloadError::ServerRejected(format!(
                    "range {} returned more than {} bytes",
                    chunk.range_header(),
                    chunk.len()
                )));
            }
            writer.write_all(&piece).await?;
            chunk.bytes_written += piece.len() as u64;
            self.sink.add(piece.len() as u64);
        }
        writer.flush().await?;

        if chunk.bytes_written != chunk.len() {
            return Err(DownloadError::SizeMismatch {
                expected: chunk.len(),
                actual: chunk.bytes_written,
            });
        }
        Ok(())
    }
}

async fn merge_parts(destination: &Path, chunks: &[Chunk]) -> std::io::Result<u64> {
    let mut out = BufWriter::new(File::create(destination).await?);
    let mut copied = 0;
    for chunk in chunks {
        let mut part = File::open(part_path(destination, chunk.index)).await?;
        copied += tokio::io::copy(&mut part, &mut out).await?;
    }
    out.flush().await?;
    Ok(copied)
}

async fn remove_parts(destination: &Path, chunks: &[Chunk]) {
    for chunk in chunks {
        let path = part_path(destination, chunk.index);
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %path.display(), error = %err, "failed to remove part file"),
        }
    }
}

async fn discard(path: &Path) {
    if let Err(err) = fs::remove_file(path).await
        && err.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %err, "failed to remove incomplete file");
    }
}
