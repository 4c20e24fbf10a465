//! Archive registry: installed archives, update settings and the activity log

mod schema;

pub use schema::*;

use anyhow::{bail, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const ARCHIVE_COLUMNS: &str = r#"
    id, filename, filepath, title, description, language, size,
    article_count, media_count, source_url, status, error_message,
    hidden, auto_update_enabled, last_checked_at,
    available_update_url, available_update_version, available_update_size,
    available_update_date, available_update_article_count, available_update_media_count,
    updated_date, created_at
"#;

/// Database wrapper for SQLite operations
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the registry at `path`
    pub fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// Registry backed by an in-memory database
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_schema()?;

        Ok(db)
    }

    /// Initialize the database schema
    fn initialize_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS archives (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                filename TEXT NOT NULL UNIQUE,
                filepath TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT,
                language TEXT,
                size INTEGER,
                article_count INTEGER,
                media_count INTEGER,
                source_url TEXT,
                status TEXT NOT NULL DEFAULT 'active',
                error_message TEXT,
                hidden INTEGER NOT NULL DEFAULT 0,
                auto_update_enabled INTEGER NOT NULL DEFAULT 0,
                last_checked_at TEXT,
                available_update_url TEXT,
                available_update_version TEXT,
                available_update_size INTEGER,
                available_update_date TEXT,
                available_update_article_count INTEGER,
                available_update_media_count INTEGER,
                updated_date TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_archives_status ON archives(status);

            CREATE TABLE IF NOT EXISTS update_settings (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                check_interval_hours INTEGER NOT NULL,
                auto_download_enabled INTEGER NOT NULL,
                min_space_buffer_gb INTEGER NOT NULL,
                download_window_start INTEGER NOT NULL,
                download_window_end INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS activity_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                action TEXT NOT NULL,
                archive_id INTEGER,
                archive_title TEXT,
                filename TEXT,
                details TEXT,
                status TEXT NOT NULL,
                error_message TEXT,
                file_size INTEGER,
                duration_secs INTEGER,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_activity_created_at ON activity_log(created_at);
            "#,
        )?;

        let defaults = UpdateSettings::default();
        conn.execute(
            r#"
            INSERT OR IGNORE INTO update_settings (
                id, check_interval_hours, auto_download_enabled, min_space_buffer_gb,
                download_window_start, download_window_end
            ) VALUES (1, ?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                defaults.check_interval_hours,
                defaults.auto_download_enabled,
                defaults.min_space_buffer_gb,
                defaults.download_window_start,
                defaults.download_window_end,
            ],
        )?;

        Ok(())
    }

    // ============ Archives ============

    /// Insert a newly downloaded archive, returning its id
    pub fn insert_archive(&self, archive: &NewArchive) -> Result<i64> {
        let conn = self.conn.lock();

        conn.execute(
            r#"
            INSERT INTO archives (
                filename, filepath, title, description, language, size,
                article_count, media_count, source_url, updated_date, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                archive.filename,
                archive.filepath.to_string_lossy(),
                archive.title,
                archive.description,
                archive.language,
                archive.size,
                archive.article_count,
                archive.media_count,
                archive.source_url,
                archive.updated_date.map(timestamp),
                timestamp(Utc::now()),
            ],
        )?;

        Ok(conn.last_insert_rowid())
    }

    pub fn get_archive(&self, id: i64) -> Result<Option<Archive>> {
        let conn = self.conn.lock();
        let archive = conn
            .query_row(
                &format!("SELECT {ARCHIVE_COLUMNS} FROM archives WHERE id = ?1"),
                [id],
                row_to_archive,
            )
            .optional()?;
        Ok(archive)
    }

    pub fn find_by_filename(&self, filename: &str) -> Result<Option<Archive>> {
        let conn = self.conn.lock();
        let archive = conn
            .query_row(
                &format!("SELECT {ARCHIVE_COLUMNS} FROM archives WHERE filename = ?1"),
                [filename],
                row_to_archive,
            )
            .optional()?;
        Ok(archive)
    }

    /// List archives ordered by title
    pub fn list_archives(&self, filter: ArchiveFilter) -> Result<Vec<Archive>> {
        let mut clauses = Vec::new();
        if !filter.include_quarantined {
            clauses.push("status = 'active'");
        }
        if !filter.include_hidden {
            clauses.push("hidden = 0");
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        self.query_archives(&format!(
            "SELECT {ARCHIVE_COLUMNS} FROM archives {where_clause} ORDER BY title, id"
        ))
    }

    /// Archives the content server should load
    pub fn active_archives(&self) -> Result<Vec<Archive>> {
        self.query_archives(&format!(
            "SELECT {ARCHIVE_COLUMNS} FROM archives WHERE status = 'active' ORDER BY created_at, id"
        ))
    }

    /// Archives included in the scheduled update sweep
    pub fn auto_update_archives(&self) -> Result<Vec<Archive>> {
        self.query_archives(&format!(
            "SELECT {ARCHIVE_COLUMNS} FROM archives WHERE auto_update_enabled = 1 ORDER BY id"
        ))
    }

    /// Every archive regardless of state
    pub fn all_archives(&self) -> Result<Vec<Archive>> {
        self.query_archives(&format!("SELECT {ARCHIVE_COLUMNS} FROM archives ORDER BY id"))
    }

    fn query_archives(&self, sql: &str) -> Result<Vec<Archive>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let archives = stmt
            .query_map([], row_to_archive)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(archives)
    }

    /// Mark an archive as quarantined. Returns false if it does not exist.
    pub fn quarantine(&self, id: i64, error_message: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE archives SET status = 'quarantined', error_message = ?1 WHERE id = ?2",
            params![error_message, id],
        )?;
        Ok(changed > 0)
    }

    /// Return a quarantined archive to service, clearing its error
    pub fn reactivate(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE archives SET status = 'active', error_message = NULL WHERE id = ?1",
            [id],
        )?;
        Ok(changed > 0)
    }

    pub fn delete_archive(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute("DELETE FROM archives WHERE id = ?1", [id])?;
        Ok(changed > 0)
    }

    pub fn set_auto_update(&self, id: i64, enabled: bool) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE archives SET auto_update_enabled = ?1 WHERE id = ?2",
            params![enabled, id],
        )?;
        Ok(changed > 0)
    }

    /// Edit descriptive metadata; `None` leaves a field untouched
    pub fn update_metadata(
        &self,
        id: i64,
        title: Option<&str>,
        description: Option<&str>,
        hidden: Option<bool>,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            r#"
            UPDATE archives SET
                title = COALESCE(?1, title),
                description = COALESCE(?2, description),
                hidden = COALESCE(?3, hidden)
            WHERE id = ?4
            "#,
            params![title, description, hidden, id],
        )?;
        Ok(changed > 0)
    }

    /// Persist the outcome of a catalog check. All `available_update_*`
    /// columns are written together: set from `update`, or all cleared.
    pub fn record_check(
        &self,
        id: i64,
        checked_at: DateTime<Utc>,
        update: Option<&AvailableUpdate>,
    ) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            r#"
            UPDATE archives SET
                last_checked_at = ?1,
                available_update_url = ?2,
                available_update_version = ?3,
                available_update_size = ?4,
                available_update_date = ?5,
                available_update_article_count = ?6,
                available_update_media_count = ?7
            WHERE id = ?8
            "#,
            params![
                timestamp(checked_at),
                update.map(|u| u.url.as_str()),
                update.and_then(|u| u.version.as_deref()),
                update.and_then(|u| u.size),
                update.and_then(|u| u.date).map(timestamp),
                update.and_then(|u| u.article_count),
                update.and_then(|u| u.media_count),
                id,
            ],
        )?;

        Ok(())
    }

    /// Advance `last_checked_at` without touching known-update metadata
    pub fn mark_checked(&self, id: i64, checked_at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE archives SET last_checked_at = ?1 WHERE id = ?2",
            params![timestamp(checked_at), id],
        )?;
        Ok(())
    }

    /// Most recent check time across auto-update archives
    pub fn latest_auto_update_check(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock();
        let latest: Option<String> = conn.query_row(
            "SELECT MAX(last_checked_at) FROM archives WHERE auto_update_enabled = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(latest.and_then(|s| parse_timestamp(&s)))
    }

    /// Point the row at a freshly swapped-in file and clear the update
    /// snapshot, in one transaction.
    pub fn commit_update(&self, id: i64, update: &CommittedUpdate) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let changed = tx.execute(
            r#"
            UPDATE archives SET
                filename = ?1,
                filepath = ?2,
                size = ?3,
                source_url = ?4,
                updated_date = ?5,
                article_count = ?6,
                media_count = ?7,
                available_update_url = NULL,
                available_update_version = NULL,
                available_update_size = NULL,
                available_update_date = NULL,
                available_update_article_count = NULL,
                available_update_media_count = NULL
            WHERE id = ?8
            "#,
            params![
                update.filename,
                update.filepath.to_string_lossy(),
                update.size,
                update.source_url,
                update.updated_date.map(timestamp),
                update.article_count,
                update.media_count,
                id,
            ],
        )?;

        if changed == 0 {
            bail!("archive {} no longer exists", id);
        }

        tx.commit()?;
        Ok(())
    }

    // ============ Update settings ============

    pub fn update_settings(&self) -> Result<UpdateSettings> {
        let conn = self.conn.lock();
        let settings = conn.query_row(
            r#"
            SELECT check_interval_hours, auto_download_enabled, min_space_buffer_gb,
                   download_window_start, download_window_end
            FROM update_settings WHERE id = 1
            "#,
            [],
            |row| {
                Ok(UpdateSettings {
                    check_interval_hours: row.get(0)?,
                    auto_download_enabled: row.get(1)?,
                    min_space_buffer_gb: row.get(2)?,
                    download_window_start: row.get(3)?,
                    download_window_end: row.get(4)?,
                })
            },
        )?;
        Ok(settings)
    }

    pub fn save_update_settings(&self, settings: &UpdateSettings) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            UPDATE update_settings SET
                check_interval_hours = ?1,
                auto_download_enabled = ?2,
                min_space_buffer_gb = ?3,
                download_window_start = ?4,
                download_window_end = ?5
            WHERE id = 1
            "#,
            params![
                settings.check_interval_hours,
                settings.auto_download_enabled,
                settings.min_space_buffer_gb,
                settings.download_window_start,
                settings.download_window_end,
            ],
        )?;
        Ok(())
    }

    // ============ Activity log ============

    pub fn insert_activity(&self, activity: &NewActivity) -> Result<i64> {
        let conn = self.conn.lock();

        conn.execute(
            r#"
            INSERT INTO activity_log (
                action, archive_id, archive_title, filename, details, status,
                error_message, file_size, duration_secs, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                activity.action.as_str(),
                activity.archive_id,
                activity.archive_title,
                activity.filename,
                activity.details,
                activity.status.as_str(),
                activity.error_message,
                activity.file_size,
                activity.duration_secs,
                timestamp(Utc::now()),
            ],
        )?;

        Ok(conn.last_insert_rowid())
    }

    /// Newest entries first
    pub fn list_activity(&self, limit: usize) -> Result<Vec<ActivityEntry>> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(
            r#"
            SELECT id, action, archive_id, archive_title, filename, details, status,
                   error_message, file_size, duration_secs, created_at
            FROM activity_log
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )?;

        let entries = stmt
            .query_map([limit as i64], |row| {
                let Some(action) = ActivityAction::from_str(&row.get::<_, String>(1)?) else {
                    return Ok(None);
                };
                Ok(Some(ActivityEntry {
                    id: row.get(0)?,
                    action,
                    archive_id: row.get(2)?,
                    archive_title: row.get(3)?,
                    filename: row.get(4)?,
                    details: row.get(5)?,
                    status: ActivityStatus::from_str(&row.get::<_, String>(6)?),
                    error_message: row.get(7)?,
                    file_size: row.get(8)?,
                    duration_secs: row.get(9)?,
                    created_at: parse_timestamp(&row.get::<_, String>(10)?)
                        .unwrap_or_else(Utc::now),
                }))
            })?
            .filter_map(|r| r.ok().flatten())
            .collect();

        Ok(entries)
    }

    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn.lock().execute_batch(sql)?;
        Ok(())
    }
}

fn row_to_archive(row: &Row<'_>) -> rusqlite::Result<Archive> {
    let available_update = row
        .get::<_, Option<String>>(15)?
        .map(|url| -> rusqlite::Result<AvailableUpdate> {
            Ok(AvailableUpdate {
                url,
                version: row.get(16)?,
                size: row.get(17)?,
                date: row
                    .get::<_, Option<String>>(18)?
                    .and_then(|s| parse_timestamp(&s)),
                article_count: row.get(19)?,
                media_count: row.get(20)?,
            })
        })
        .transpose()?;

    Ok(Archive {
        id: row.get(0)?,
        filename: row.get(1)?,
        filepath: PathBuf::from(row.get::<_, String>(2)?),
        title: row.get(3)?,
        description: row.get(4)?,
        language: row.get(5)?,
        size: row.get(6)?,
        article_count: row.get(7)?,
        media_count: row.get(8)?,
        source_url: row.get(9)?,
        status: ArchiveStatus::from_str(&row.get::<_, String>(10)?),
        error_message: row.get(11)?,
        hidden: row.get(12)?,
        auto_update_enabled: row.get(13)?,
        last_checked_at: row
            .get::<_, Option<String>>(14)?
            .and_then(|s| parse_timestamp(&s)),
        available_update,
        updated_date: row
            .get::<_, Option<String>>(21)?
            .and_then(|s| parse_timestamp(&s)),
        created_at: parse_timestamp(&row.get::<_, String>(22)?).unwrap_or_else(Utc::now),
        content_url: None,
    })
}

/// Fixed-width UTC timestamps so `MAX()` over the text column is chronological
fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}
