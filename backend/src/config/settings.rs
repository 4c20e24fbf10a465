//! Settings data structures

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// HTTP API configuration
    pub server: ServerSettings,

    /// Archive storage and update-flow timings
    pub library: LibrarySettings,

    /// Supervised content server
    pub content_server: ContentServerSettings,

    /// Remote archive catalog
    pub catalog: CatalogSettings,
}

impl Settings {
    /// Path of the registry database, defaulting to the config directory
    pub fn database_path(&self) -> PathBuf {
        self.library
            .database_path
            .clone()
            .unwrap_or_else(|| super::config_dir().join("library.db"))
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Host to bind to (0.0.0.0 for LAN access)
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

/// Archive storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LibrarySettings {
    /// Flat directory holding every archive file
    pub zim_dir: PathBuf,

    /// Registry database location
    pub database_path: Option<PathBuf>,

    /// Pause between closing a finished download and checking its size
    pub flush_delay_ms: u64,

    /// Allowed difference between expected and actual download size
    pub size_tolerance_bytes: u64,

    /// How long a replaced archive's `.backup` survives after the swap
    pub backup_grace_secs: u64,

    /// Pause between archives within one scheduled sweep
    pub sweep_pause_secs: u64,

    /// How often the update scheduler wakes up
    pub scheduler_tick_secs: u64,
}

impl Default for LibrarySettings {
    fn default() -> Self {
        Self {
            zim_dir: PathBuf::from("./zim"),
            database_path: None,
            flush_delay_ms: 1000,
            size_tolerance_bytes: 1024,
            backup_grace_secs: 5,
            sweep_pause_secs: 2,
            scheduler_tick_secs: 3600,
        }
    }
}

impl LibrarySettings {
    pub fn flush_delay(&self) -> Duration {
        Duration::from_millis(self.flush_delay_ms)
    }

    pub fn backup_grace(&self) -> Duration {
        Duration::from_secs(self.backup_grace_secs)
    }

    pub fn sweep_pause(&self) -> Duration {
        Duration::from_secs(self.sweep_pause_secs)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_secs(self.scheduler_tick_secs.max(1))
    }
}

/// Content server (kiwix-serve) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentServerSettings {
    /// Executable to spawn; looked up on `PATH` when not absolute
    pub binary: PathBuf,

    /// Port passed as `--port`
    pub port: u16,

    /// Host name clients use to reach the content server
    pub public_host: String,

    /// Wait between stopping and starting during a restart
    pub restart_cooldown_secs: u64,

    /// How long the intentional-restart flag outlives the new spawn
    pub restart_flag_clear_secs: u64,

    /// Delay before restarting after a suspect was quarantined
    pub crash_retry_delay_secs: u64,

    /// Delay before restarting after a crash with no identifiable suspect
    pub blind_retry_delay_secs: u64,

    /// Abnormal exits within this uptime count as crashes
    pub crash_uptime_secs: u64,

    /// Clean exits within this uptime count as crashes unless restarting
    pub clean_exit_crash_uptime_ms: u64,

    /// Grace period after SIGTERM before the process is killed
    pub stop_timeout_secs: u64,
}

impl Default for ContentServerSettings {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("kiwix-serve"),
            port: 8080,
            public_host: "localhost".to_string(),
            restart_cooldown_secs: 3,
            restart_flag_clear_secs: 5,
            crash_retry_delay_secs: 2,
            blind_retry_delay_secs: 10,
            crash_uptime_secs: 5,
            clean_exit_crash_uptime_ms: 2000,
            stop_timeout_secs: 5,
        }
    }
}

impl ContentServerSettings {
    /// Where a served archive can be browsed
    pub fn content_url(&self, filename: &str) -> String {
        let name = filename.strip_suffix(".zim").unwrap_or(filename);
        format!("http://{}:{}/content/{}", self.public_host, self.port, name)
    }
}

/// Remote catalog configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogSettings {
    /// Catalog host, without the `/catalog/v2` suffix
    pub base_url: String,

    /// Result cap for update searches
    pub search_count: u32,

    /// Request timeout
    pub timeout_secs: u64,

    /// Language used when browsing without an explicit filter
    pub default_language: String,
}

impl Default for CatalogSettings {
    fn default() -> Self {
        Self {
            base_url: "https://library.kiwix.org".to_string(),
            search_count: 100,
            timeout_secs: 15,
            default_language: "eng".to_string(),
        }
    }
}
