//! In-flight download registry keyed by destination filename

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{LibraryError, Result};

/// Phase of an in-flight download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InFlightStatus {
    Starting,
    Downloading,
}

/// Ephemeral bookkeeping for one running transfer
#[derive(Debug, Clone, Serialize)]
pub struct InFlightDownload {
    pub filename: String,
    pub url: String,
    pub title: String,
    /// Percentage, 0-100
    pub progress: u8,
    pub total_size: Option<u64>,
    pub downloaded_size: u64,
    pub status: InFlightStatus,
    pub is_update: bool,
    pub original_archive_id: Option<i64>,
    pub start_time: DateTime<Utc>,
}

/// State carried by a progress event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferState {
    Downloading,
    Completed,
    Failed,
}

/// Progress update sent to clients
#[derive(Debug, Clone, Serialize)]
pub struct ProgressUpdate {
    pub filename: String,
    pub downloaded: u64,
    pub total: Option<u64>,
    pub progress: u8,
    pub speed: u64, // bytes per second
    pub status: TransferState,
    pub error: Option<String>,
}

/// What a caller wants downloaded
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub filename: String,
    pub url: String,
    pub title: String,
    /// Catalog size estimate, also used to validate the finished file
    pub expected_size: Option<u64>,
    pub is_update: bool,
    pub original_archive_id: Option<i64>,
}

/// Exclusive claim on a destination filename. Dropping it removes the
/// in-flight record, whatever the transfer's outcome.
pub struct DownloadTicket {
    manager: DownloadManager,
    filename: String,
    url: String,
    expected_size: Option<u64>,
}

impl DownloadTicket {
    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn expected_size(&self) -> Option<u64> {
        self.expected_size
    }

    pub(super) fn manager(&self) -> &DownloadManager {
        &self.manager
    }
}

impl Drop for DownloadTicket {
    fn drop(&mut self) {
        self.manager.inner.active.write().remove(&self.filename);
        debug!("Released download slot for {}", self.filename);
    }
}

struct DownloadManagerInner {
    /// Active downloads (destination filename -> record)
    active: RwLock<HashMap<String, InFlightDownload>>,
}

/// Download manager that tracks transfers and fans out progress
#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<DownloadManagerInner>,

    /// Broadcast channel for progress updates
    progress_tx: broadcast::Sender<ProgressUpdate>,

    client: reqwest::Client,

    /// Pause between closing the file and measuring it
    pub(super) flush_delay: Duration,

    /// Accepted difference between expected and actual size
    pub(super) size_tolerance: u64,
}

impl DownloadManager {
    pub fn new(flush_delay: Duration, size_tolerance: u64) -> anyhow::Result<Self> {
        let (progress_tx, _) = broadcast::channel(1000);
        let client = reqwest::Client::builder()
            .user_agent(concat!("Zimkeeper/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            inner: Arc::new(DownloadManagerInner {
                active: RwLock::new(HashMap::new()),
            }),
            progress_tx,
            client,
            flush_delay,
            size_tolerance,
        })
    }

    /// Subscribe to progress updates
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressUpdate> {
        self.progress_tx.subscribe()
    }

    pub(super) fn publish(&self, update: ProgressUpdate) {
        // No subscribers is fine
        let _ = self.progress_tx.send(update);
    }

    /// Claim the destination filename, rejecting a second claim while the
    /// first is alive
    pub fn reserve(&self, request: DownloadRequest) -> Result<DownloadTicket> {
        let mut active = self.inner.active.write();
        if active.contains_key(&request.filename) {
            return Err(LibraryError::AlreadyDownloading(request.filename));
        }

        active.insert(
            request.filename.clone(),
            InFlightDownload {
                filename: request.filename.clone(),
                url: request.url.clone(),
                title: request.title,
                progress: 0,
                total_size: request.expected_size,
                downloaded_size: 0,
                status: InFlightStatus::Starting,
                is_update: request.is_update,
                original_archive_id: request.original_archive_id,
                start_time: Utc::now(),
            },
        );

        Ok(DownloadTicket {
            manager: self.clone(),
            filename: request.filename,
            url: request.url,
            expected_size: request.expected_size,
        })
    }

    /// Issue the GET for a reserved download, up to response headers
    pub async fn open(&self, ticket: &DownloadTicket) -> Result<reqwest::Response> {
        let response = self
            .client
            .get(&ticket.url)
            .send()
            .await
            .map_err(|e| LibraryError::UpstreamUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(LibraryError::UpstreamUnavailable(format!(
                "HTTP error: {}",
                response.status()
            )));
        }

        Ok(response)
    }

    pub(super) fn update_record(&self, filename: &str, f: impl FnOnce(&mut InFlightDownload)) {
        if let Some(record) = self.inner.active.write().get_mut(filename) {
            f(record);
        }
    }

    /// Current in-flight downloads, oldest first
    pub fn snapshot(&self) -> Vec<InFlightDownload> {
        let mut downloads: Vec<_> = self.inner.active.read().values().cloned().collect();
        downloads.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        downloads
    }
}

/// Percentage of `downloaded` over `total`, 0 when the total is unknown
pub fn percent(downloaded: u64, total: Option<u64>) -> u8 {
    match total {
        Some(total) if total > 0 => {
            ((downloaded as f64 / total as f64) * 100.0).round().min(100.0) as u8
        }
        _ => 0,
    }
}

/// Archive filename the URL path resolves to
pub fn filename_from_url(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let last = parsed.path_segments()?.last()?;
    let decoded = urlencoding::decode(last)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| last.to_string());

    if decoded.is_empty() || decoded.contains('/') || decoded == "." || decoded == ".." {
        return None;
    }
    Some(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> DownloadManager {
        DownloadManager::new(Duration::ZERO, 1024).unwrap()
    }

    fn request(filename: &str) -> DownloadRequest {
        DownloadRequest {
            filename: filename.to_string(),
            url: format!("https://download.example.org/{filename}"),
            title: "Example".to_string(),
            expected_size: Some(4096),
            is_update: false,
            original_archive_id: None,
        }
    }

    #[test]
    fn second_reservation_for_a_filename_is_rejected() {
        let manager = manager();
        let _first = manager.reserve(request("a_2024-01.zim")).unwrap();

        let err = manager.reserve(request("a_2024-01.zim")).err().unwrap();
        assert!(matches!(err, LibraryError::AlreadyDownloading(ref f) if f == "a_2024-01.zim"));
        assert_eq!(manager.snapshot().len(), 1);

        let _other = manager.reserve(request("b_2024-01.zim")).unwrap();
        assert_eq!(manager.snapshot().len(), 2);
    }

    #[test]
    fn dropping_the_ticket_frees_the_slot() {
        let manager = manager();
        let ticket = manager.reserve(request("a.zim")).unwrap();
        let record = &manager.snapshot()[0];
        assert_eq!(record.status, InFlightStatus::Starting);
        assert_eq!(record.total_size, Some(4096));
        assert_eq!(record.progress, 0);

        drop(ticket);
        assert!(manager.snapshot().is_empty());
        assert!(manager.reserve(request("a.zim")).is_ok());
    }

    #[test]
    fn percent_rounds_and_handles_unknown_totals() {
        assert_eq!(percent(0, None), 0);
        assert_eq!(percent(10, Some(0)), 0);
        assert_eq!(percent(1, Some(3)), 33);
        assert_eq!(percent(2, Some(3)), 67);
        assert_eq!(percent(5, Some(4)), 100);
    }

    #[test]
    fn filenames_come_from_the_last_path_segment() {
        assert_eq!(
            filename_from_url("https://download.kiwix.org/zim/wikipedia/wikipedia_en_all_2024-01.zim")
                .as_deref(),
            Some("wikipedia_en_all_2024-01.zim")
        );
        assert_eq!(
            filename_from_url("https://example.org/files/my%20archive.zim?x=1").as_deref(),
            Some("my archive.zim")
        );
        assert_eq!(filename_from_url("https://example.org/"), None);
        assert_eq!(filename_from_url("https://example.org/a%2F..%2Fb.zim"), None);
        assert_eq!(filename_from_url("not a url"), None);
    }
}
