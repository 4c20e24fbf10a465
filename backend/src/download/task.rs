//! Streamed transfer of one reserved download

use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::manager::{percent, DownloadManager, DownloadTicket, InFlightStatus, ProgressUpdate};
use super::TransferState;
use crate::error::{LibraryError, Result};

/// Background transfer started by [`DownloadManager::start`]
pub struct DownloadHandle {
    pub filename: String,
    task: JoinHandle<Result<CompletedDownload>>,
}

impl DownloadHandle {
    pub async fn wait(self) -> Result<CompletedDownload> {
        self.task
            .await
            .map_err(|e| LibraryError::Transfer(format!("download task failed: {e}")))?
    }
}

/// A validated file on disk. Keeps the filename claimed until dropped so
/// the caller can move the file into place first.
pub struct CompletedDownload {
    pub size: u64,
    pub path: PathBuf,
    _ticket: DownloadTicket,
}

impl DownloadManager {
    /// Stream `response` into `destination` in the background. A failed
    /// transfer releases its ticket immediately.
    pub fn start(
        &self,
        ticket: DownloadTicket,
        response: reqwest::Response,
        destination: PathBuf,
    ) -> DownloadHandle {
        let filename = ticket.filename().to_string();
        let task = tokio::spawn(async move {
            let size = download_file(&ticket, response, &destination).await?;
            Ok(CompletedDownload {
                size,
                path: destination,
                _ticket: ticket,
            })
        });

        DownloadHandle { filename, task }
    }
}

/// Write the body to `destination`, then validate its size. Any failure
/// removes the partial file.
pub async fn download_file(
    ticket: &DownloadTicket,
    response: reqwest::Response,
    destination: &Path,
) -> Result<u64> {
    let manager = ticket.manager();
    let filename = ticket.filename().to_string();
    let content_length = response.content_length();
    let total_size = content_length.or(ticket.expected_size());

    info!("Starting download: {} -> {:?}", ticket.url(), destination);

    let result = stream_to_file(manager, &filename, response, destination, total_size).await;
    let result = match result {
        Ok(()) => validate(manager, ticket, destination, content_length).await,
        Err(e) => Err(e),
    };

    match &result {
        Ok(size) => {
            info!("Download complete: {} ({} bytes)", filename, size);
            manager.publish(ProgressUpdate {
                filename,
                downloaded: *size,
                total: Some(*size),
                progress: 100,
                speed: 0,
                status: TransferState::Completed,
                error: None,
            });
        }
        Err(e) => {
            warn!("Download failed: {}: {}", filename, e);
            if let Err(remove_err) = tokio::fs::remove_file(destination).await {
                if remove_err.kind() != std::io::ErrorKind::NotFound {
                    warn!("Could not remove partial file {:?}: {}", destination, remove_err);
                }
            }
            manager.publish(ProgressUpdate {
                filename,
                downloaded: 0,
                total: total_size,
                progress: 0,
                speed: 0,
                status: TransferState::Failed,
                error: Some(e.to_string()),
            });
        }
    }

    result
}

async fn stream_to_file(
    manager: &DownloadManager,
    filename: &str,
    response: reqwest::Response,
    destination: &Path,
    total_size: Option<u64>,
) -> Result<()> {
    manager.update_record(filename, |record| {
        record.status = InFlightStatus::Downloading;
        record.total_size = total_size;
    });

    // Ensure destination directory exists
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut file = File::create(destination).await?;
    let mut downloaded: u64 = 0;
    let mut stream = response.bytes_stream();
    let start_time = Instant::now();
    let mut last_progress_time = Instant::now();

    while let Some(chunk) = stream.next().await {
        let bytes = chunk.map_err(|e| LibraryError::Transfer(format!("Download error: {e}")))?;
        file.write_all(&bytes).await?;
        downloaded += bytes.len() as u64;

        let progress = percent(downloaded, total_size);
        manager.update_record(filename, |record| {
            record.downloaded_size = downloaded;
            record.progress = progress;
        });

        // Update progress every 200ms
        if last_progress_time.elapsed().as_millis() >= 200 {
            let elapsed = start_time.elapsed().as_secs_f64();
            let speed = if elapsed > 0.0 {
                (downloaded as f64 / elapsed) as u64
            } else {
                0
            };

            manager.publish(ProgressUpdate {
                filename: filename.to_string(),
                downloaded,
                total: total_size,
                progress,
                speed,
                status: TransferState::Downloading,
                error: None,
            });

            last_progress_time = Instant::now();
        }
    }

    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    Ok(())
}

async fn validate(
    manager: &DownloadManager,
    ticket: &DownloadTicket,
    destination: &Path,
    content_length: Option<u64>,
) -> Result<u64> {
    tokio::time::sleep(manager.flush_delay).await;

    let actual = tokio::fs::metadata(destination).await?.len();

    if let Some(expected) = ticket.expected_size().or(content_length) {
        if actual.abs_diff(expected) > manager.size_tolerance {
            return Err(LibraryError::DownloadCorrupt { expected, actual });
        }
    }

    Ok(actual)
}
