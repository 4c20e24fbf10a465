//! Replacing an installed archive with a newer catalog version.
//!
//! The new file is downloaded next to the old one, then swapped in with
//! two renames: old file to `<path>.backup`, download to its final name.
//! The registry is committed only after both renames; if anything fails
//! past the first rename the backup is put back.

use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{error, info, warn};

use super::{Library, DOWNLOADING_SUFFIX};
use crate::db::{
    ActivityAction, ActivityStatus, Archive, AvailableUpdate, CommittedUpdate, NewActivity,
};
use crate::download::{download_file, filename_from_url, DownloadRequest, DownloadTicket};
use crate::error::{human, LibraryError, Result};

const BACKUP_SUFFIX: &str = ".backup";

/// An update whose preconditions passed and whose download slot is held
pub struct PreparedUpdate {
    archive: Archive,
    update: AvailableUpdate,
    filename: String,
    ticket: DownloadTicket,
}

impl PreparedUpdate {
    pub fn filename(&self) -> &str {
        &self.filename
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateOutcome {
    pub archive_id: i64,
    pub old_filename: String,
    pub new_filename: String,
    pub size: u64,
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

impl Library {
    /// Check that an update is known and fits on disk, then claim its
    /// download slot. No I/O besides the free-space query.
    pub fn prepare_update(&self, id: i64) -> Result<PreparedUpdate> {
        let archive = self.archive(id)?;
        let update = archive
            .available_update
            .clone()
            .ok_or(LibraryError::NoUpdateAvailable)?;
        let filename = filename_from_url(&update.url).ok_or_else(|| {
            LibraryError::InvalidRequest(format!("update URL does not name a file: {}", update.url))
        })?;

        // Never swap onto a file that belongs to another archive
        if filename != archive.filename
            && (self.zim_dir.join(&filename).exists()
                || self.db.find_by_filename(&filename)?.is_some())
        {
            return Err(LibraryError::AlreadyExists(filename));
        }

        let settings = self.db.update_settings()?;
        let size = update.size.unwrap_or(0);
        let buffer = settings.min_space_buffer_bytes();
        match self.disk.check_available() {
            Ok(space) if !space.has_room_for(size, buffer) => {
                return Err(LibraryError::InsufficientDiskSpace {
                    available: space.available_bytes,
                    required: size.saturating_add(buffer),
                });
            }
            Ok(_) => {}
            Err(e) => warn!("Could not query free space ({}); proceeding with update", e),
        }

        let ticket = self.downloads.reserve(DownloadRequest {
            filename: filename.clone(),
            url: update.url.clone(),
            title: archive.title.clone(),
            expected_size: update.size,
            is_update: true,
            original_archive_id: Some(archive.id),
        })?;

        Ok(PreparedUpdate {
            archive,
            update,
            filename,
            ticket,
        })
    }

    /// Download, swap and commit a prepared update
    pub async fn run_update(&self, prepared: PreparedUpdate) -> Result<UpdateOutcome> {
        let PreparedUpdate {
            archive,
            update,
            filename,
            ticket,
        } = prepared;
        let started = Instant::now();

        info!("Updating {} to {}", archive.filename, filename);
        self.log_activity(
            NewActivity::new(ActivityAction::UpdateStarted, ActivityStatus::InProgress)
                .archive(&archive)
                .details(format!("{} -> {}", archive.filename, filename)),
        );

        let temp = self.zim_dir.join(format!("{filename}{DOWNLOADING_SUFFIX}"));
        let final_path = self.zim_dir.join(&filename);

        let downloaded = match self.downloads.open(&ticket).await {
            Ok(response) => download_file(&ticket, response, &temp).await,
            Err(e) => Err(e),
        };
        if let Err(e) = downloaded {
            // The installed file was never touched
            self.update_failed(&archive, &e, started);
            return Err(e);
        }

        let backup = backup_path(&archive.filepath);
        let had_original = archive.filepath.exists();
        if had_original {
            if let Err(e) = std::fs::rename(&archive.filepath, &backup) {
                if let Err(remove_err) = remove_if_exists(&temp) {
                    warn!("Could not remove {:?}: {}", temp, remove_err);
                }
                let e = LibraryError::UpdateFinalization(format!("could not back up old file: {e}"));
                self.update_failed(&archive, &e, started);
                return Err(e);
            }
        }

        // Something appeared under the new name since the update was prepared
        let occupied = final_path.exists();
        let swapped = if occupied {
            Err(LibraryError::AlreadyExists(filename.clone()))
        } else {
            self.swap_in(&archive, &update, &filename, &temp, &final_path)
        };

        let size = match swapped {
            Ok(size) => size,
            Err(e) => {
                error!(error = %e, "Finalizing update of {} failed; rolling back", archive.filename);
                let ours = (!occupied).then_some(final_path.as_path());
                self.roll_back(&archive, ours, &temp, had_original.then_some(&backup));
                let e = LibraryError::UpdateFinalization(e.to_string());
                self.update_failed(&archive, &e, started);
                return Err(e);
            }
        };
        drop(ticket);

        info!(
            "Updated {} to {} ({})",
            archive.filename,
            filename,
            human(size)
        );
        self.log_activity(
            NewActivity::new(ActivityAction::UpdateCompleted, ActivityStatus::Success)
                .archive(&archive)
                .details(format!("{} -> {}", archive.filename, filename))
                .file_size(size)
                .duration_secs(started.elapsed().as_secs()),
        );

        self.content_server.mark_touched(archive.id);
        self.content_server.restart();

        if had_original && backup != final_path {
            self.schedule_backup_removal(&archive, backup);
        }

        Ok(UpdateOutcome {
            archive_id: archive.id,
            old_filename: archive.filename,
            new_filename: filename,
            size,
        })
    }

    /// Move the download into place and commit the registry row
    fn swap_in(
        &self,
        archive: &Archive,
        update: &AvailableUpdate,
        filename: &str,
        temp: &Path,
        final_path: &Path,
    ) -> Result<u64> {
        std::fs::rename(temp, final_path)?;
        let size = std::fs::metadata(final_path)?.len();

        self.db.commit_update(
            archive.id,
            &CommittedUpdate {
                filename: filename.to_string(),
                filepath: final_path.to_path_buf(),
                size,
                source_url: update.url.clone(),
                updated_date: update.date,
                article_count: update.article_count,
                media_count: update.media_count,
            },
        )?;

        Ok(size)
    }

    /// Restore the old file after a failed swap. Every step is attempted
    /// even when an earlier one fails. `final_path` is only given when the
    /// swap may have put a file there.
    fn roll_back(
        &self,
        archive: &Archive,
        final_path: Option<&Path>,
        temp: &Path,
        backup: Option<&PathBuf>,
    ) {
        if let Some(final_path) = final_path {
            if let Err(e) = remove_if_exists(final_path) {
                error!("Rollback: could not remove {:?}: {}", final_path, e);
            }
        }
        if let Some(backup) = backup {
            if let Err(e) = std::fs::rename(backup, &archive.filepath) {
                error!(
                    "Rollback: could not restore {:?} from {:?}: {}",
                    archive.filepath, backup, e
                );
            }
        }
        if let Err(e) = remove_if_exists(temp) {
            warn!("Rollback: could not remove {:?}: {}", temp, e);
        }

        self.content_server.restart();
    }

    fn update_failed(&self, archive: &Archive, err: &LibraryError, started: Instant) {
        self.log_activity(
            NewActivity::new(ActivityAction::UpdateFailed, ActivityStatus::Failed)
                .archive(archive)
                .error(err.to_string())
                .duration_secs(started.elapsed().as_secs()),
        );
    }

    /// Delete the backup once the restarted server had time to reject the
    /// new file
    fn schedule_backup_removal(&self, archive: &Archive, backup: PathBuf) {
        let library = self.clone();
        let archive = archive.clone();
        let grace = self.backup_grace;

        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            match tokio::fs::remove_file(&backup).await {
                Ok(()) => {
                    info!("Removed backup {:?}", backup);
                    library.log_activity(
                        NewActivity::new(ActivityAction::BackupDeleted, ActivityStatus::Success)
                            .archive(&archive)
                            .details(backup.display().to_string()),
                    );
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("Could not remove backup {:?}: {}", backup, e),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{eventually, install, library};
    use super::*;
    use crate::db::UpdateSettings;
    use chrono::Utc;

    const NO_CATALOG: &str = "http://127.0.0.1:1";

    fn offer(library: &Library, archive: &Archive, url: String, size: u64) {
        library
            .db()
            .record_check(
                archive.id,
                Utc::now(),
                Some(&AvailableUpdate {
                    url,
                    version: Some("2024-01".into()),
                    size: Some(size),
                    date: None,
                    article_count: Some(42),
                    media_count: Some(7),
                }),
            )
            .unwrap();
    }

    async fn serve(server: &mut mockito::ServerGuard, path: &str, body: Vec<u8>) -> mockito::Mock {
        server
            .mock("GET", path)
            .with_body(body)
            .create_async()
            .await
    }

    #[tokio::test]
    async fn update_without_known_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let library = library(dir.path(), NO_CATALOG, None);
        let archive = install(&library, "wiki_2023-10.zim", b"old");

        let err = library.apply_update(archive.id).unwrap_err();
        assert!(matches!(err, LibraryError::NoUpdateAvailable));
    }

    #[tokio::test]
    async fn insufficient_space_is_rejected_before_any_io() {
        let dir = tempfile::tempdir().unwrap();
        let library = library(dir.path(), NO_CATALOG, None);
        let archive = install(&library, "wiki_2023-10.zim", b"old");
        offer(
            &library,
            &archive,
            "http://127.0.0.1:1/wiki_2024-01.zim".into(),
            1024,
        );
        library
            .save_update_settings(&UpdateSettings {
                min_space_buffer_gb: 1 << 40,
                ..Default::default()
            })
            .unwrap();

        let err = library.apply_update(archive.id).err().unwrap();
        assert!(matches!(err, LibraryError::InsufficientDiskSpace { .. }), "{err}");
        assert!(err.shortfall().unwrap() > 0);
        assert!(library.download_progress().is_empty());
        assert!(!library.zim_dir().join("wiki_2024-01.zim.downloading").exists());
    }

    #[tokio::test]
    async fn second_update_of_the_same_archive_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let library = library(dir.path(), NO_CATALOG, None);
        let archive = install(&library, "wiki_2023-10.zim", b"old");
        offer(&library, &archive, "http://127.0.0.1:1/wiki_2024-01.zim".into(), 3);

        let _first = library.prepare_update(archive.id).unwrap();
        let err = library.prepare_update(archive.id).err().unwrap();
        assert!(matches!(err, LibraryError::AlreadyDownloading(_)), "{err}");
    }

    #[tokio::test]
    async fn successful_update_swaps_file_and_commits() {
        let mut server = mockito::Server::new_async().await;
        let new_body = b"new archive contents".to_vec();
        let _mock = serve(&mut server, "/wiki_2024-01.zim", new_body.clone()).await;

        let dir = tempfile::tempdir().unwrap();
        let library = library(dir.path(), NO_CATALOG, None);
        let archive = install(&library, "wiki_2023-10.zim", b"old");
        let url = format!("{}/wiki_2024-01.zim", server.url());
        offer(&library, &archive, url.clone(), new_body.len() as u64);

        let outcome = library.apply_update_now(archive.id).await.unwrap();
        assert_eq!(outcome.new_filename, "wiki_2024-01.zim");
        assert_eq!(outcome.size, new_body.len() as u64);

        let updated = library.get_archive(archive.id).unwrap();
        assert_eq!(updated.filename, "wiki_2024-01.zim");
        assert_eq!(std::fs::read(&updated.filepath).unwrap(), new_body);
        assert_eq!(updated.available_update, None);
        assert_eq!(updated.source_url.as_deref(), Some(url.as_str()));
        assert_eq!(updated.article_count, Some(42));
        assert!(!archive.filepath.exists());
        assert!(library.download_progress().is_empty());

        let backup = backup_path(&archive.filepath);
        eventually(|| !backup.exists()).await;
        eventually(|| library.content_server_status().restarts >= 1).await;
    }

    #[tokio::test]
    async fn corrupt_download_leaves_the_installed_file_alone() {
        let mut server = mockito::Server::new_async().await;
        let _mock = serve(&mut server, "/wiki_2024-01.zim", vec![1u8; 100]).await;

        let dir = tempfile::tempdir().unwrap();
        let library = library(dir.path(), NO_CATALOG, None);
        let archive = install(&library, "wiki_2023-10.zim", b"old");
        offer(
            &library,
            &archive,
            format!("{}/wiki_2024-01.zim", server.url()),
            1_000_000,
        );

        let err = library.apply_update_now(archive.id).await.unwrap_err();
        assert!(matches!(err, LibraryError::DownloadCorrupt { .. }), "{err}");

        let after = library.get_archive(archive.id).unwrap();
        assert_eq!(after.filename, "wiki_2023-10.zim");
        assert!(after.available_update.is_some());
        assert_eq!(std::fs::read(&archive.filepath).unwrap(), b"old");
        assert!(!library.zim_dir().join("wiki_2024-01.zim.downloading").exists());
        assert!(!library.zim_dir().join("wiki_2024-01.zim").exists());
    }

    #[tokio::test]
    async fn failed_commit_restores_the_old_file() {
        let mut server = mockito::Server::new_async().await;
        let _mock = serve(&mut server, "/wiki_2024-01.zim", b"new".to_vec()).await;

        let dir = tempfile::tempdir().unwrap();
        let library = library(dir.path(), NO_CATALOG, None);
        let archive = install(&library, "wiki_2023-10.zim", b"old");
        offer(&library, &archive, format!("{}/wiki_2024-01.zim", server.url()), 3);

        library
            .db()
            .execute_batch(
                "CREATE TRIGGER fail_commit BEFORE UPDATE OF filename ON archives
                 BEGIN SELECT RAISE(ABORT, 'simulated commit failure'); END;",
            )
            .unwrap();

        let err = library.apply_update_now(archive.id).await.unwrap_err();
        assert!(matches!(err, LibraryError::UpdateFinalization(_)), "{err}");

        assert_eq!(std::fs::read(&archive.filepath).unwrap(), b"old");
        assert!(!backup_path(&archive.filepath).exists());
        assert!(!library.zim_dir().join("wiki_2024-01.zim").exists());
        assert!(!library.zim_dir().join("wiki_2024-01.zim.downloading").exists());

        let after = library.get_archive(archive.id).unwrap();
        assert_eq!(after.filename, "wiki_2023-10.zim");
        assert_eq!(after.filepath, archive.filepath);
        assert!(after.available_update.is_some());

        let activity = library.list_activity(1).unwrap();
        assert_eq!(activity[0].action, ActivityAction::UpdateFailed);
        eventually(|| library.content_server_status().restarts >= 1).await;
    }

    #[tokio::test]
    async fn update_onto_another_installed_archive_is_rejected() {
        let mut server = mockito::Server::new_async().await;
        let download = server
            .mock("GET", "/wiki_2024-01.zim")
            .with_body(b"new".to_vec())
            .expect(0)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let library = library(dir.path(), NO_CATALOG, None);
        let older = install(&library, "wiki_2023-10.zim", b"old");
        let newer = install(&library, "wiki_2024-01.zim", b"BBB");
        offer(&library, &older, format!("{}/wiki_2024-01.zim", server.url()), 3);

        let err = library.apply_update_now(older.id).await.unwrap_err();
        assert!(
            matches!(err, LibraryError::AlreadyExists(ref f) if f == "wiki_2024-01.zim"),
            "{err}"
        );

        assert_eq!(std::fs::read(&newer.filepath).unwrap(), b"BBB");
        assert_eq!(std::fs::read(&older.filepath).unwrap(), b"old");
        assert!(library.get_archive(newer.id).unwrap().is_active());
        assert_eq!(library.get_archive(older.id).unwrap().filename, "wiki_2023-10.zim");
        assert!(library.download_progress().is_empty());
        download.assert_async().await;
    }

    #[tokio::test]
    async fn file_appearing_during_the_download_is_left_alone() {
        let mut server = mockito::Server::new_async().await;
        let _mock = serve(&mut server, "/wiki_2024-01.zim", b"new".to_vec()).await;

        let dir = tempfile::tempdir().unwrap();
        let library = library(dir.path(), NO_CATALOG, None);
        let archive = install(&library, "wiki_2023-10.zim", b"old");
        offer(&library, &archive, format!("{}/wiki_2024-01.zim", server.url()), 3);

        let prepared = library.prepare_update(archive.id).unwrap();
        let squatter = library.zim_dir().join("wiki_2024-01.zim");
        std::fs::write(&squatter, b"someone else").unwrap();

        let err = library.run_update(prepared).await.unwrap_err();
        assert!(matches!(err, LibraryError::UpdateFinalization(_)), "{err}");

        assert_eq!(std::fs::read(&squatter).unwrap(), b"someone else");
        assert_eq!(std::fs::read(&archive.filepath).unwrap(), b"old");
        assert!(!backup_path(&archive.filepath).exists());
        assert!(!library.zim_dir().join("wiki_2024-01.zim.downloading").exists());
        assert_eq!(library.get_archive(archive.id).unwrap().filename, "wiki_2023-10.zim");
    }
}
