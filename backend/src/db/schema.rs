//! Database schema types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Lifecycle state of an installed archive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveStatus {
    Active,
    Quarantined,
}

impl ArchiveStatus {
    pub fn from_str(s: &str) -> Self {
        match s {
            "quarantined" => Self::Quarantined,
            _ => Self::Active,
        }
    }
}

/// Snapshot of the newest catalog entry known to be newer than the
/// installed file. Stored and cleared as a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailableUpdate {
    pub url: String,
    pub version: Option<String>,
    pub size: Option<u64>,
    pub date: Option<DateTime<Utc>>,
    pub article_count: Option<u64>,
    pub media_count: Option<u64>,
}

/// An installed archive tracked by the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Archive {
    pub id: i64,
    pub filename: String,
    pub filepath: PathBuf,
    pub title: String,
    pub description: Option<String>,
    pub language: Option<String>,
    pub size: Option<u64>,
    pub article_count: Option<u64>,
    pub media_count: Option<u64>,
    pub source_url: Option<String>,
    pub status: ArchiveStatus,
    pub error_message: Option<String>,
    pub hidden: bool,
    pub auto_update_enabled: bool,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub available_update: Option<AvailableUpdate>,
    pub updated_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Browse link on the content server; set for active archives only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_url: Option<String>,
}

impl Archive {
    pub fn is_active(&self) -> bool {
        self.status == ArchiveStatus::Active
    }
}

/// Fields supplied when a finished download is registered
#[derive(Debug, Clone, Default)]
pub struct NewArchive {
    pub filename: String,
    pub filepath: PathBuf,
    pub title: String,
    pub description: Option<String>,
    pub language: Option<String>,
    pub size: Option<u64>,
    pub article_count: Option<u64>,
    pub media_count: Option<u64>,
    pub source_url: Option<String>,
    pub updated_date: Option<DateTime<Utc>>,
}

/// Which rows `list_archives` returns
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ArchiveFilter {
    #[serde(default)]
    pub include_quarantined: bool,
    #[serde(default)]
    pub include_hidden: bool,
}

/// New file facts written when an update is committed
#[derive(Debug, Clone)]
pub struct CommittedUpdate {
    pub filename: String,
    pub filepath: PathBuf,
    pub size: u64,
    pub source_url: String,
    pub updated_date: Option<DateTime<Utc>>,
    pub article_count: Option<u64>,
    pub media_count: Option<u64>,
}

/// Global auto-update configuration (single row)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateSettings {
    pub check_interval_hours: u32,
    pub auto_download_enabled: bool,
    pub min_space_buffer_gb: u64,
    /// Hour of day (0-23) the download window opens
    pub download_window_start: u32,
    /// Hour of day (0-23) the download window closes, exclusive
    pub download_window_end: u32,
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self {
            check_interval_hours: 24,
            auto_download_enabled: false,
            min_space_buffer_gb: 5,
            download_window_start: 2,
            download_window_end: 6,
        }
    }
}

impl UpdateSettings {
    pub fn min_space_buffer_bytes(&self) -> u64 {
        self.min_space_buffer_gb.saturating_mul(1024 * 1024 * 1024)
    }

    /// Whether `hour` falls in `[start, end)`, wrapping past midnight
    /// when `start > end`. An equal start and end is an empty window.
    pub fn in_download_window(&self, hour: u32) -> bool {
        let (start, end) = (self.download_window_start, self.download_window_end);
        if start <= end {
            hour >= start && hour < end
        } else {
            hour >= start || hour < end
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.check_interval_hours == 0 {
            return Err("check_interval_hours must be at least 1".into());
        }
        if self.download_window_start > 23 || self.download_window_end > 23 {
            return Err("download window hours must be between 0 and 23".into());
        }
        Ok(())
    }
}

/// Kind of lifecycle event recorded in the activity log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityAction {
    DownloadStarted,
    DownloadCompleted,
    DownloadFailed,
    UpdateStarted,
    UpdateCompleted,
    UpdateFailed,
    BackupDeleted,
    Quarantined,
    Reactivated,
    Deleted,
}

impl ActivityAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DownloadStarted => "download_started",
            Self::DownloadCompleted => "download_completed",
            Self::DownloadFailed => "download_failed",
            Self::UpdateStarted => "update_started",
            Self::UpdateCompleted => "update_completed",
            Self::UpdateFailed => "update_failed",
            Self::BackupDeleted => "backup_deleted",
            Self::Quarantined => "quarantined",
            Self::Reactivated => "reactivated",
            Self::Deleted => "deleted",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "download_started" => Self::DownloadStarted,
            "download_completed" => Self::DownloadCompleted,
            "download_failed" => Self::DownloadFailed,
            "update_started" => Self::UpdateStarted,
            "update_completed" => Self::UpdateCompleted,
            "update_failed" => Self::UpdateFailed,
            "backup_deleted" => Self::BackupDeleted,
            "quarantined" => Self::Quarantined,
            "reactivated" => Self::Reactivated,
            "deleted" => Self::Deleted,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    Success,
    InProgress,
    Failed,
}

impl ActivityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::InProgress => "in_progress",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "in_progress" => Self::InProgress,
            "failed" => Self::Failed,
            _ => Self::Success,
        }
    }
}

/// A recorded lifecycle event
#[derive(Debug, Clone, Serialize)]
pub struct ActivityEntry {
    pub id: i64,
    pub action: ActivityAction,
    pub archive_id: Option<i64>,
    pub archive_title: Option<String>,
    pub filename: Option<String>,
    pub details: Option<String>,
    pub status: ActivityStatus,
    pub error_message: Option<String>,
    pub file_size: Option<u64>,
    pub duration_secs: Option<u64>,
    pub created_at: DateTime<Utc>,
}

/// Builder for an activity log row
#[derive(Debug, Clone)]
pub struct NewActivity {
    pub action: ActivityAction,
    pub status: ActivityStatus,
    pub archive_id: Option<i64>,
    pub archive_title: Option<String>,
    pub filename: Option<String>,
    pub details: Option<String>,
    pub error_message: Option<String>,
    pub file_size: Option<u64>,
    pub duration_secs: Option<u64>,
}

impl NewActivity {
    pub fn new(action: ActivityAction, status: ActivityStatus) -> Self {
        Self {
            action,
            status,
            archive_id: None,
            archive_title: None,
            filename: None,
            details: None,
            error_message: None,
            file_size: None,
            duration_secs: None,
        }
    }

    pub fn archive(mut self, archive: &Archive) -> Self {
        self.archive_id = Some(archive.id);
        self.archive_title = Some(archive.title.clone());
        self.filename = Some(archive.filename.clone());
        self
    }

    pub fn filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn file_size(mut self, size: u64) -> Self {
        self.file_size = Some(size);
        self
    }

    pub fn duration_secs(mut self, secs: u64) -> Self {
        self.duration_secs = Some(secs);
        self
    }
}
