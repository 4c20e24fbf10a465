//! Periodic update checks with optional auto-download inside the
//! configured maintenance window

use chrono::{DateTime, Local, Timelike, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::LibrarySettings;
use crate::error::Result;
use crate::library::Library;

/// Tally of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub checked: usize,
    pub updates_found: usize,
    pub applied: usize,
    pub failed: usize,
}

/// Whether enough time passed since the last check for a new sweep
pub fn is_due(
    last_checked: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    interval_hours: u32,
) -> bool {
    match last_checked {
        None => true,
        Some(last) => now - last >= chrono::Duration::hours(i64::from(interval_hours)),
    }
}

pub struct UpdateScheduler {
    library: Library,
    period: Duration,
    pause: Duration,
}

impl UpdateScheduler {
    pub fn new(library: Library, settings: &LibrarySettings) -> Self {
        Self {
            library,
            period: settings.scheduler_tick(),
            pause: settings.sweep_pause(),
        }
    }

    /// Run as a background task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        info!(period_secs = self.period.as_secs(), "Starting update scheduler");

        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            if let Err(e) = self.tick(Local::now()).await {
                error!(error = %e, "Scheduled update check failed");
            }
        }
    }

    /// Sweep if due. Returns `None` when the interval has not elapsed.
    pub async fn tick(&self, now: DateTime<Local>) -> Result<Option<SweepReport>> {
        let settings = self.library.update_settings()?;
        let last_checked = self.library.db().latest_auto_update_check()?;

        if !is_due(last_checked, now.with_timezone(&Utc), settings.check_interval_hours) {
            return Ok(None);
        }

        self.run_sweep(now.hour()).await.map(Some)
    }

    /// Check every auto-update archive; apply found updates inline when
    /// auto-download is on and `hour` is inside the window
    pub async fn run_sweep(&self, hour: u32) -> Result<SweepReport> {
        let settings = self.library.update_settings()?;
        let archives = self.library.db().auto_update_archives()?;
        let may_download = settings.auto_download_enabled && settings.in_download_window(hour);
        let mut report = SweepReport::default();

        info!(
            count = archives.len(),
            hour,
            may_download,
            "Running scheduled update sweep"
        );

        for (i, archive) in archives.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.pause).await;
            }
            report.checked += 1;

            let result = match self.library.check_for_update(archive.id).await {
                Ok(result) => result,
                Err(e) => {
                    report.failed += 1;
                    warn!(archive_id = archive.id, error = %e, "Update check failed");
                    continue;
                }
            };

            if !result.update_available {
                continue;
            }
            report.updates_found += 1;

            if !may_download {
                info!(
                    archive_id = archive.id,
                    "Update for {} left for manual action", archive.filename
                );
                continue;
            }

            match self.library.apply_update_now(archive.id).await {
                Ok(outcome) => {
                    report.applied += 1;
                    info!(
                        archive_id = archive.id,
                        "Auto-updated {} to {}", outcome.old_filename, outcome.new_filename
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    error!(archive_id = archive.id, error = %e, "Auto-update failed");
                }
            }
        }

        info!(
            checked = report.checked,
            found = report.updates_found,
            applied = report.applied,
            failed = report.failed,
            "Update sweep finished"
        );

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::opds::tests::{entry_xml, feed};
    use crate::db::{NewArchive, UpdateSettings};
    use crate::library::testing::{eventually, install, library};
    use chrono::TimeZone;
    use mockito::Matcher;

    fn scheduler(library: Library) -> UpdateScheduler {
        UpdateScheduler {
            library,
            period: Duration::from_secs(3600),
            pause: Duration::ZERO,
        }
    }

    fn enable_auto_download(library: &Library) {
        library
            .save_update_settings(&UpdateSettings {
                auto_download_enabled: true,
                min_space_buffer_gb: 0,
                download_window_start: 2,
                download_window_end: 6,
                ..Default::default()
            })
            .unwrap();
    }

    #[test]
    fn due_after_the_interval() {
        let now = Utc.with_ymd_and_hms(2024, 2, 1, 12, 0, 0).unwrap();
        assert!(is_due(None, now, 24));
        assert!(!is_due(Some(now - chrono::Duration::hours(23)), now, 24));
        assert!(is_due(Some(now - chrono::Duration::hours(24)), now, 24));
        assert!(is_due(Some(now - chrono::Duration::hours(2)), now, 1));
    }

    #[tokio::test]
    async fn tick_skips_when_recently_checked() {
        let dir = tempfile::tempdir().unwrap();
        let library = library(dir.path(), "http://127.0.0.1:1", None);
        let archive = install(&library, "wiki_2023-10.zim", b"old");
        library.set_auto_update(archive.id, true).unwrap();
        library.db().mark_checked(archive.id, Utc::now()).unwrap();

        let scheduler = scheduler(library);
        assert_eq!(scheduler.tick(Local::now()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn failed_checks_still_advance_last_checked() {
        let dir = tempfile::tempdir().unwrap();
        let library = library(dir.path(), "http://127.0.0.1:1", None);
        let archive = install(&library, "wiki_2023-10.zim", b"old");
        library.set_auto_update(archive.id, true).unwrap();

        let scheduler = scheduler(library.clone());
        let report = scheduler.tick(Local::now()).await.unwrap().unwrap();

        assert_eq!(report.checked, 1);
        assert_eq!(report.failed, 1);
        assert!(library.get_archive(archive.id).unwrap().last_checked_at.is_some());
        assert_eq!(scheduler.tick(Local::now()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn downloads_only_inside_the_window() {
        let mut server = mockito::Server::new_async().await;
        let body = b"fresh archive".to_vec();
        let file_url = format!("{}/zim/wiki_en_all_2024-01.zim", server.url());
        let _catalog = server
            .mock("GET", "/catalog/v2/entries")
            .match_query(Matcher::Any)
            .with_body(feed(&[entry_xml(
                "wiki_en_all",
                "Wiki",
                &file_url,
                body.len() as u64,
                "2024-01-20T00:00:00Z",
            )]))
            .create_async()
            .await;
        let file = server
            .mock("GET", "/zim/wiki_en_all_2024-01.zim")
            .with_body(body)
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let library = library(dir.path(), &server.url(), None);
        let archive = install(&library, "wiki_en_all_2023-10.zim", b"old");
        library.set_auto_update(archive.id, true).unwrap();
        enable_auto_download(&library);
        let scheduler = scheduler(library.clone());

        let report = scheduler.run_sweep(14).await.unwrap();
        assert_eq!(report.updates_found, 1);
        assert_eq!(report.applied, 0);
        let waiting = library.get_archive(archive.id).unwrap();
        assert_eq!(waiting.filename, "wiki_en_all_2023-10.zim");
        assert_eq!(waiting.available_update.unwrap().url, file_url);

        let report = scheduler.run_sweep(3).await.unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(
            library.get_archive(archive.id).unwrap().filename,
            "wiki_en_all_2024-01.zim"
        );
        file.assert_async().await;
    }

    #[tokio::test]
    async fn auto_download_disabled_leaves_updates_pending() {
        let mut server = mockito::Server::new_async().await;
        let _catalog = server
            .mock("GET", "/catalog/v2/entries")
            .match_query(Matcher::Any)
            .with_body(feed(&[entry_xml(
                "wiki_en_all",
                "Wiki",
                "https://download.example.org/wiki_en_all_2024-01.zim",
                10,
                "2024-01-20T00:00:00Z",
            )]))
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let library = library(dir.path(), &server.url(), None);
        let archive = install(&library, "wiki_en_all_2023-10.zim", b"old");
        library.set_auto_update(archive.id, true).unwrap();

        let report = scheduler(library.clone()).run_sweep(3).await.unwrap();
        assert_eq!(report.updates_found, 1);
        assert_eq!(report.applied, 0);
        assert!(library.get_archive(archive.id).unwrap().available_update.is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn end_to_end_auto_update() {
        use crate::content_server::tests::fake_server;
        use crate::content_server::ServerState;

        let mut server = mockito::Server::new_async().await;
        let body = vec![9u8; 48 * 1024];
        let file_url = format!("{}/zim/wikipedia_en_all_2024-01.zim", server.url());
        let _catalog = server
            .mock("GET", "/catalog/v2/entries")
            .match_query(Matcher::UrlEncoded("q".into(), "wikipedia en".into()))
            .with_body(feed(&[entry_xml(
                "wikipedia_en_all",
                "Wikipedia",
                &format!("{file_url}.meta4"),
                body.len() as u64,
                "2024-01-20T00:00:00Z",
            )]))
            .create_async()
            .await;
        let _file = server
            .mock("GET", "/zim/wikipedia_en_all_2024-01.zim")
            .with_body(body.clone())
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let binary = fake_server(dir.path(), &[]);
        let library = library(dir.path(), &server.url(), Some(binary));

        let old_path = library.zim_dir().join("wikipedia_en_all_2023-10.zim");
        std::fs::write(&old_path, b"old wikipedia").unwrap();
        let id = library
            .db()
            .insert_archive(&NewArchive {
                filename: "wikipedia_en_all_2023-10.zim".into(),
                filepath: old_path.clone(),
                title: "Wikipedia".into(),
                updated_date: Some(Utc.with_ymd_and_hms(2023, 10, 15, 0, 0, 0).unwrap()),
                ..Default::default()
            })
            .unwrap();
        library.set_auto_update(id, true).unwrap();
        enable_auto_download(&library);

        library.content_server().start();
        eventually(|| library.content_server_status().state == ServerState::Running).await;

        let report = scheduler(library.clone()).run_sweep(3).await.unwrap();
        assert_eq!(report.applied, 1);

        let archive = library.get_archive(id).unwrap();
        assert_eq!(archive.filename, "wikipedia_en_all_2024-01.zim");
        assert_eq!(archive.available_update, None);
        assert_eq!(std::fs::read(&archive.filepath).unwrap(), body);

        eventually(|| {
            let status = library.content_server_status();
            status.restarts >= 1
                && status.state == ServerState::Running
                && status.archives == vec![archive.filepath.clone()]
        })
        .await;
        eventually(|| !dir.path().join("zim/wikipedia_en_all_2023-10.zim.backup").exists()).await;
        assert!(!old_path.exists());

        library.content_server().stop().await;
    }
}
