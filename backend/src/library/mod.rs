//! Library facade: the operations the HTTP API and the scheduler drive

mod update;

pub use update::UpdateOutcome;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::catalog::{
    newest_match, parse_filename, search_term, CatalogClient, CatalogEntry, CatalogLanguage,
    CatalogQuery, VersionInfo,
};
use crate::config::{ContentServerSettings, Settings};
use crate::content_server::{ContentServer, SupervisorStatus};
use crate::db::{
    ActivityAction, ActivityEntry, ActivityStatus, Archive, ArchiveFilter, ArchiveStatus,
    AvailableUpdate, Database, NewActivity, NewArchive, UpdateSettings,
};
use crate::disk::{DiskGuard, DiskSpace};
use crate::download::{
    filename_from_url, DownloadManager, DownloadRequest, InFlightDownload, ProgressUpdate,
};
use crate::error::{LibraryError, Result};

/// Suffix of a download that has not been validated yet
const DOWNLOADING_SUFFIX: &str = ".downloading";

/// Remove a file this process created, logging anything but "already gone"
fn discard(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Could not remove {:?}: {}", path, e);
        }
    }
}

/// Catalog facts supplied with a new download
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DownloadMetadata {
    pub title: Option<String>,
    pub description: Option<String>,
    pub language: Option<String>,
    pub size: Option<u64>,
    pub article_count: Option<u64>,
    pub media_count: Option<u64>,
    pub updated: Option<DateTime<Utc>>,
}

/// Operator edits to an archive
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetadataUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub hidden: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateCheckResult {
    pub archive_id: i64,
    pub filename: String,
    pub current_version: Option<String>,
    pub update_available: bool,
    pub available_update: Option<AvailableUpdate>,
    pub checked_at: DateTime<Utc>,
}

/// Outcome of one archive in a bulk check
#[derive(Debug, Clone, Serialize)]
pub struct BulkCheckEntry {
    pub archive_id: i64,
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<UpdateCheckResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Owns the collaborators of the archive lifecycle
#[derive(Clone)]
pub struct Library {
    db: Database,
    catalog: CatalogClient,
    downloads: DownloadManager,
    disk: DiskGuard,
    content_server: ContentServer,
    zim_dir: PathBuf,
    backup_grace: Duration,
    serving: ContentServerSettings,
}

impl Library {
    pub fn new(
        settings: &Settings,
        db: Database,
        content_server: ContentServer,
    ) -> anyhow::Result<Self> {
        let zim_dir = settings.library.zim_dir.clone();
        std::fs::create_dir_all(&zim_dir)?;

        Ok(Self {
            db,
            catalog: CatalogClient::new(&settings.catalog)?,
            downloads: DownloadManager::new(
                settings.library.flush_delay(),
                settings.library.size_tolerance_bytes,
            )?,
            disk: DiskGuard::new(&zim_dir),
            content_server,
            zim_dir,
            backup_grace: settings.library.backup_grace(),
            serving: settings.content_server.clone(),
        })
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn zim_dir(&self) -> &Path {
        &self.zim_dir
    }

    pub fn content_server(&self) -> &ContentServer {
        &self.content_server
    }

    fn log_activity(&self, activity: NewActivity) {
        if let Err(e) = self.db.insert_activity(&activity) {
            warn!(error = %e, "Failed to record {} activity", activity.action.as_str());
        }
    }

    fn with_content_url(&self, mut archive: Archive) -> Archive {
        if archive.is_active() {
            archive.content_url = Some(self.serving.content_url(&archive.filename));
        }
        archive
    }

    fn archive(&self, id: i64) -> Result<Archive> {
        let archive = self.db.get_archive(id)?.ok_or(LibraryError::NotFound(id))?;
        Ok(self.with_content_url(archive))
    }

    pub fn list_archives(&self, filter: ArchiveFilter) -> Result<Vec<Archive>> {
        let archives = self.db.list_archives(filter)?;
        Ok(archives
            .into_iter()
            .map(|archive| self.with_content_url(archive))
            .collect())
    }

    pub fn get_archive(&self, id: i64) -> Result<Archive> {
        self.archive(id)
    }

    /// Start downloading a new archive. Returns once the server has
    /// answered; the body is streamed and registered in the background.
    pub async fn download_new(&self, url: &str, metadata: DownloadMetadata) -> Result<String> {
        let filename = filename_from_url(url)
            .ok_or_else(|| LibraryError::InvalidRequest(format!("URL does not name a file: {url}")))?;
        let destination = self.zim_dir.join(&filename);

        if destination.exists() || self.db.find_by_filename(&filename)?.is_some() {
            return Err(LibraryError::AlreadyExists(filename));
        }

        let title = metadata
            .title
            .clone()
            .unwrap_or_else(|| parse_filename(&filename).base_name);
        let ticket = self.downloads.reserve(DownloadRequest {
            filename: filename.clone(),
            url: url.to_string(),
            title: title.clone(),
            expected_size: metadata.size,
            is_update: false,
            original_archive_id: None,
        })?;

        let response = match self.downloads.open(&ticket).await {
            Ok(response) => response,
            Err(e) => {
                self.log_activity(
                    NewActivity::new(ActivityAction::DownloadFailed, ActivityStatus::Failed)
                        .filename(&filename)
                        .details(url)
                        .error(e.to_string()),
                );
                return Err(e);
            }
        };

        info!("Downloading new archive {} from {}", filename, url);
        self.log_activity(
            NewActivity::new(ActivityAction::DownloadStarted, ActivityStatus::InProgress)
                .filename(&filename)
                .details(url),
        );

        let temp = self.zim_dir.join(format!("{filename}{DOWNLOADING_SUFFIX}"));
        let handle = self.downloads.start(ticket, response, temp);
        let library = self.clone();
        let source_url = url.to_string();
        let started = Instant::now();

        tokio::spawn(async move {
            let record = NewArchive {
                filename: handle.filename.clone(),
                filepath: destination,
                title,
                description: metadata.description,
                language: metadata.language,
                size: None,
                article_count: metadata.article_count,
                media_count: metadata.media_count,
                source_url: Some(source_url),
                updated_date: metadata.updated,
            };

            let result = match handle.wait().await {
                Ok(done) => library
                    .register_download(&done.path, record.clone(), done.size)
                    .map(|id| (id, done.size)),
                Err(e) => Err(e),
            };

            match result {
                Ok((id, size)) => library.log_activity(
                    NewActivity::new(ActivityAction::DownloadCompleted, ActivityStatus::Success)
                        .filename(&record.filename)
                        .details(format!("archive {id}"))
                        .file_size(size)
                        .duration_secs(started.elapsed().as_secs()),
                ),
                Err(e) => {
                    error!(error = %e, "Download of {} failed", record.filename);
                    library.log_activity(
                        NewActivity::new(ActivityAction::DownloadFailed, ActivityStatus::Failed)
                            .filename(&record.filename)
                            .error(e.to_string())
                            .duration_secs(started.elapsed().as_secs()),
                    );
                }
            }
        });

        Ok(filename)
    }

    /// Move a validated download into place and make it servable
    fn register_download(&self, temp: &Path, mut record: NewArchive, size: u64) -> Result<i64> {
        if let Err(e) = std::fs::rename(temp, &record.filepath) {
            discard(temp);
            return Err(e.into());
        }
        record.size = Some(size);

        let id = match self.db.insert_archive(&record) {
            Ok(id) => id,
            Err(e) => {
                // An unregistered file would block a retry as AlreadyExists
                discard(&record.filepath);
                return Err(e.into());
            }
        };

        info!("Registered {} as archive {}", record.filename, id);
        self.content_server.mark_touched(id);
        self.content_server.restart();
        Ok(id)
    }

    pub fn download_progress(&self) -> Vec<InFlightDownload> {
        self.downloads.snapshot()
    }

    pub fn subscribe_progress(&self) -> tokio::sync::broadcast::Receiver<ProgressUpdate> {
        self.downloads.subscribe()
    }

    /// Look the archive up in the catalog and record what was found. A
    /// catalog failure only advances `last_checked_at`.
    pub async fn check_for_update(&self, id: i64) -> Result<UpdateCheckResult> {
        let archive = self.archive(id)?;
        let parsed = parse_filename(&archive.filename);
        let term = search_term(&parsed.base_name);
        let checked_at = Utc::now();

        let candidates = match self.catalog.find_candidates(&term).await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("Update check for {} failed: {}", archive.filename, e);
                self.db.mark_checked(id, checked_at)?;
                return Err(e);
            }
        };

        let installed = VersionInfo {
            published: archive.updated_date,
            version: parsed.version.clone(),
        };
        let update = newest_match(&archive.filename, &installed, &candidates).map(|c| {
            AvailableUpdate {
                url: c.url.clone(),
                version: c.version.clone(),
                size: c.size,
                date: c.published,
                article_count: c.article_count,
                media_count: c.media_count,
            }
        });

        self.db.record_check(id, checked_at, update.as_ref())?;

        match &update {
            Some(u) => info!(
                "Update available for {}: {}",
                archive.filename,
                u.version.as_deref().unwrap_or(&u.url)
            ),
            None => info!("{} is up to date", archive.filename),
        }

        Ok(UpdateCheckResult {
            archive_id: id,
            filename: archive.filename,
            current_version: parsed.version,
            update_available: update.is_some(),
            available_update: update,
            checked_at,
        })
    }

    /// Check every tracked archive, one at a time
    pub async fn check_all_for_updates(&self) -> Result<Vec<BulkCheckEntry>> {
        let archives = self.db.all_archives()?;
        let mut results = Vec::with_capacity(archives.len());

        for archive in archives {
            let (result, error) = match self.check_for_update(archive.id).await {
                Ok(result) => (Some(result), None),
                Err(e) => (None, Some(e.to_string())),
            };
            results.push(BulkCheckEntry {
                archive_id: archive.id,
                filename: archive.filename,
                result,
                error,
            });
        }

        Ok(results)
    }

    /// Validate and claim the update, then run it in the background.
    /// Returns the filename being downloaded.
    pub fn apply_update(&self, id: i64) -> Result<String> {
        let prepared = self.prepare_update(id)?;
        let filename = prepared.filename().to_string();
        let library = self.clone();

        tokio::spawn(async move {
            if let Err(e) = library.run_update(prepared).await {
                error!(error = %e, "Update of archive {} failed", id);
            }
        });

        Ok(filename)
    }

    /// Run the whole update sequence inline
    pub async fn apply_update_now(&self, id: i64) -> Result<UpdateOutcome> {
        let prepared = self.prepare_update(id)?;
        self.run_update(prepared).await
    }

    pub fn set_auto_update(&self, id: i64, enabled: bool) -> Result<()> {
        if !self.db.set_auto_update(id, enabled)? {
            return Err(LibraryError::NotFound(id));
        }
        Ok(())
    }

    /// Put a quarantined archive back into service
    pub fn reactivate(&self, id: i64) -> Result<Archive> {
        let archive = self.archive(id)?;
        if archive.status != ArchiveStatus::Quarantined {
            return Err(LibraryError::NotQuarantined(id));
        }

        self.db.reactivate(id)?;
        info!("Reactivated {} (id {})", archive.filename, id);
        self.log_activity(
            NewActivity::new(ActivityAction::Reactivated, ActivityStatus::Success)
                .archive(&archive)
                .details(archive.error_message.clone().unwrap_or_default()),
        );
        self.content_server.restart();

        self.archive(id)
    }

    /// Remove the file and the registry row
    pub fn delete_archive(&self, id: i64) -> Result<()> {
        let archive = self.archive(id)?;

        match std::fs::remove_file(&archive.filepath) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("{:?} was already gone", archive.filepath);
            }
            Err(e) => return Err(e.into()),
        }

        self.db.delete_archive(id)?;
        info!("Deleted {} (id {})", archive.filename, id);
        self.log_activity(
            NewActivity::new(ActivityAction::Deleted, ActivityStatus::Success)
                .archive(&archive)
                .file_size(archive.size.unwrap_or(0)),
        );
        self.content_server.restart();
        Ok(())
    }

    pub fn update_metadata(&self, id: i64, update: MetadataUpdate) -> Result<Archive> {
        if let Some(title) = &update.title {
            if title.trim().is_empty() {
                return Err(LibraryError::InvalidRequest("title must not be empty".into()));
            }
        }

        let found = self.db.update_metadata(
            id,
            update.title.as_deref(),
            update.description.as_deref(),
            update.hidden,
        )?;
        if !found {
            return Err(LibraryError::NotFound(id));
        }
        self.archive(id)
    }

    pub fn update_settings(&self) -> Result<UpdateSettings> {
        Ok(self.db.update_settings()?)
    }

    pub fn save_update_settings(&self, settings: &UpdateSettings) -> Result<UpdateSettings> {
        settings.validate().map_err(LibraryError::InvalidRequest)?;
        self.db.save_update_settings(settings)?;
        self.update_settings()
    }

    pub fn disk_space(&self) -> Result<DiskSpace> {
        Ok(self.disk.check_available()?)
    }

    pub fn list_activity(&self, limit: usize) -> Result<Vec<ActivityEntry>> {
        Ok(self.db.list_activity(limit)?)
    }

    pub async fn browse_catalog(&self, query: &CatalogQuery) -> Result<Vec<CatalogEntry>> {
        self.catalog.browse(query).await
    }

    pub async fn catalog_languages(&self) -> Result<Vec<CatalogLanguage>> {
        self.catalog.languages().await
    }

    pub fn content_server_status(&self) -> SupervisorStatus {
        self.content_server.status()
    }

    pub fn restart_content_server(&self) {
        self.content_server.restart();
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{eventually, install, library};
    use super::*;
    use crate::catalog::opds::tests::{entry_xml, feed};
    use mockito::Matcher;

    const NO_CATALOG: &str = "http://127.0.0.1:1";

    #[tokio::test]
    async fn download_new_registers_the_archive() {
        let mut server = mockito::Server::new_async().await;
        let body = vec![3u8; 32 * 1024];
        let _mock = server
            .mock("GET", "/zim/wikipedia_en_all_2024-01.zim")
            .with_body(body.clone())
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let library = library(dir.path(), NO_CATALOG, None);
        let url = format!("{}/zim/wikipedia_en_all_2024-01.zim", server.url());

        let filename = library
            .download_new(
                &url,
                DownloadMetadata {
                    title: Some("Wikipedia".into()),
                    size: Some(body.len() as u64),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(filename, "wikipedia_en_all_2024-01.zim");

        eventually(|| library.db().find_by_filename(&filename).unwrap().is_some()).await;
        let archive = library.db().find_by_filename(&filename).unwrap().unwrap();

        assert_eq!(archive.title, "Wikipedia");
        assert_eq!(archive.size, Some(body.len() as u64));
        assert_eq!(archive.source_url.as_deref(), Some(url.as_str()));
        assert!(archive.is_active());
        assert_eq!(std::fs::read(&archive.filepath).unwrap(), body);
        assert!(!library
            .zim_dir()
            .join("wikipedia_en_all_2024-01.zim.downloading")
            .exists());

        eventually(|| library.download_progress().is_empty()).await;
        eventually(|| library.content_server_status().restarts == 1).await;
        eventually(|| {
            library
                .list_activity(10)
                .unwrap()
                .iter()
                .any(|a| a.action == ActivityAction::DownloadCompleted)
        })
        .await;
    }

    #[tokio::test]
    async fn failed_move_into_place_removes_the_partial_download() {
        let dir = tempfile::tempdir().unwrap();
        let library = library(dir.path(), NO_CATALOG, None);
        let temp = library.zim_dir().join("wiki_2024-01.zim.downloading");
        std::fs::write(&temp, b"validated").unwrap();

        // A non-empty directory squatting on the final name makes the rename fail
        let destination = library.zim_dir().join("wiki_2024-01.zim");
        std::fs::create_dir(&destination).unwrap();
        std::fs::write(destination.join("occupant"), b"x").unwrap();

        let record = NewArchive {
            filename: "wiki_2024-01.zim".into(),
            filepath: destination.clone(),
            title: "Wiki".into(),
            ..Default::default()
        };
        let err = library.register_download(&temp, record, 9).unwrap_err();

        assert!(matches!(err, LibraryError::Io(_)), "{err}");
        assert!(!temp.exists());
        assert!(destination.join("occupant").exists());
        assert!(library.db().find_by_filename("wiki_2024-01.zim").unwrap().is_none());
        assert_eq!(library.content_server_status().restarts, 0);
    }

    #[tokio::test]
    async fn concurrent_download_of_the_same_file_is_rejected() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/a_2024-01.zim")
            .with_body(vec![0u8; 1024])
            .expect_at_most(2)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut library = library(dir.path(), NO_CATALOG, None);
        // Keep the first transfer in flight while the second arrives
        library.downloads = DownloadManager::new(Duration::from_millis(500), 1024).unwrap();
        let url = format!("{}/a_2024-01.zim", server.url());

        library.download_new(&url, DownloadMetadata::default()).await.unwrap();
        let err = library
            .download_new(&url, DownloadMetadata::default())
            .await
            .unwrap_err();

        assert!(matches!(err, LibraryError::AlreadyDownloading(_)), "{err}");
        assert_eq!(library.download_progress().len(), 1);
    }

    #[tokio::test]
    async fn existing_archives_are_not_downloaded_again() {
        let dir = tempfile::tempdir().unwrap();
        let library = library(dir.path(), NO_CATALOG, None);
        install(&library, "a_2024-01.zim", b"zim");

        let err = library
            .download_new("http://127.0.0.1:1/a_2024-01.zim", DownloadMetadata::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LibraryError::AlreadyExists(_)), "{err}");
    }

    #[tokio::test]
    async fn unreachable_download_server_is_reported_to_the_caller() {
        let dir = tempfile::tempdir().unwrap();
        let library = library(dir.path(), NO_CATALOG, None);

        let err = library
            .download_new("http://127.0.0.1:1/a_2024-01.zim", DownloadMetadata::default())
            .await
            .unwrap_err();

        assert!(matches!(err, LibraryError::UpstreamUnavailable(_)), "{err}");
        assert!(library.download_progress().is_empty());
        assert_eq!(
            library.list_activity(1).unwrap()[0].action,
            ActivityAction::DownloadFailed
        );
    }

    #[tokio::test]
    async fn check_records_the_newest_matching_entry() {
        let mut server = mockito::Server::new_async().await;
        let xml = feed(&[
            entry_xml(
                "wikipedia_en_all",
                "Wikipedia",
                "https://download.example.org/wikipedia_en_all_2024-01.zim.meta4",
                4096,
                "2024-01-20T00:00:00Z",
            ),
            entry_xml(
                "wikipedia_en_all_nopic",
                "Wikipedia (no pictures)",
                "https://download.example.org/wikipedia_en_all_nopic_2024-03.zim",
                1024,
                "2024-03-20T00:00:00Z",
            ),
        ]);
        let _mock = server
            .mock("GET", "/catalog/v2/entries")
            .match_query(Matcher::UrlEncoded("q".into(), "wikipedia en".into()))
            .with_body(xml)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let library = library(dir.path(), &server.url(), None);
        let archive = install(&library, "wikipedia_en_all_2023-10.zim", b"old");

        let result = library.check_for_update(archive.id).await.unwrap();

        assert!(result.update_available);
        assert_eq!(result.current_version.as_deref(), Some("2023-10"));
        let update = library.get_archive(archive.id).unwrap().available_update.unwrap();
        assert_eq!(
            update.url,
            "https://download.example.org/wikipedia_en_all_2024-01.zim"
        );
        assert_eq!(update.version.as_deref(), Some("2024-01"));
        assert_eq!(update.size, Some(4096));
    }

    #[tokio::test]
    async fn catalog_failure_keeps_known_update_but_advances_last_checked() {
        let dir = tempfile::tempdir().unwrap();
        let library = library(dir.path(), NO_CATALOG, None);
        let archive = install(&library, "wiki_2023-10.zim", b"old");
        let known = AvailableUpdate {
            url: "https://download.example.org/wiki_2024-01.zim".into(),
            version: Some("2024-01".into()),
            size: Some(10),
            date: None,
            article_count: None,
            media_count: None,
        };
        let earlier = Utc::now() - chrono::Duration::days(3);
        library
            .db()
            .record_check(archive.id, earlier, Some(&known))
            .unwrap();

        let err = library.check_for_update(archive.id).await.unwrap_err();
        assert!(matches!(err, LibraryError::CatalogUnavailable(_)), "{err}");

        let after = library.get_archive(archive.id).unwrap();
        assert_eq!(after.available_update, Some(known));
        assert!(after.last_checked_at.unwrap() > earlier);
    }

    #[tokio::test]
    async fn reactivation_requires_quarantine() {
        let dir = tempfile::tempdir().unwrap();
        let library = library(dir.path(), NO_CATALOG, None);
        let archive = install(&library, "a.zim", b"zim");

        let err = library.reactivate(archive.id).unwrap_err();
        assert!(matches!(err, LibraryError::NotQuarantined(_)));

        library.db().quarantine(archive.id, "crashed").unwrap();
        assert_eq!(library.get_archive(archive.id).unwrap().content_url, None);

        let back = library.reactivate(archive.id).unwrap();
        assert!(back.is_active());
        assert_eq!(back.error_message, None);
        assert_eq!(back.content_url.as_deref(), Some("http://localhost:8080/content/a"));
        eventually(|| library.content_server_status().restarts == 1).await;
    }

    #[tokio::test]
    async fn delete_removes_file_and_row() {
        let dir = tempfile::tempdir().unwrap();
        let library = library(dir.path(), NO_CATALOG, None);
        let archive = install(&library, "a.zim", b"zim");

        library.delete_archive(archive.id).unwrap();

        assert!(!archive.filepath.exists());
        assert!(matches!(
            library.get_archive(archive.id),
            Err(LibraryError::NotFound(_))
        ));
        assert!(matches!(
            library.delete_archive(archive.id),
            Err(LibraryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn metadata_and_settings_are_validated() {
        let dir = tempfile::tempdir().unwrap();
        let library = library(dir.path(), NO_CATALOG, None);
        let archive = install(&library, "a.zim", b"zim");

        let edited = library
            .update_metadata(
                archive.id,
                MetadataUpdate {
                    title: Some("Renamed".into()),
                    hidden: Some(true),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(edited.title, "Renamed");
        assert!(edited.hidden);
        assert!(library
            .update_metadata(
                archive.id,
                MetadataUpdate {
                    title: Some("  ".into()),
                    ..Default::default()
                }
            )
            .is_err());

        let err = library
            .save_update_settings(&UpdateSettings {
                download_window_end: 30,
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, LibraryError::InvalidRequest(_)));

        let saved = library
            .save_update_settings(&UpdateSettings {
                auto_download_enabled: true,
                ..Default::default()
            })
            .unwrap();
        assert!(saved.auto_download_enabled);
    }
}
