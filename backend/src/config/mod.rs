//! Configuration management for Zimkeeper

mod settings;

pub use settings::*;

use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable that points at an alternative config file
pub const CONFIG_ENV: &str = "ZIMKEEPER_CONFIG";

/// Get the configuration directory path
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("zimkeeper")
}

/// Get the configuration file path
pub fn config_path() -> PathBuf {
    std::env::var_os(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| config_dir().join("config.toml"))
}

/// Load configuration from file or create default
pub fn load_or_create_default() -> Result<Settings> {
    load_or_create_at(&config_path())
}

/// Load configuration from `path`, writing the defaults there if it is missing
pub fn load_or_create_at(path: &Path) -> Result<Settings> {
    if path.exists() {
        let content = fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        Ok(settings)
    } else {
        let settings = Settings::default();
        save_to(path, &settings)?;
        Ok(settings)
    }
}

/// Save configuration to file
pub fn save_to(path: &Path, settings: &Settings) -> Result<()> {
    // Ensure config directory exists
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let content = toml::to_string_pretty(settings)?;
    fs::write(path, content)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let settings = load_or_create_at(&path).unwrap();

        assert!(path.exists());
        assert_eq!(settings.content_server.port, 8080);
        assert_eq!(settings.catalog.search_count, 100);
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[content_server]\nbinary = \"/opt/kiwix/kiwix-serve\"\nport = 9000\n",
        )
        .unwrap();

        let settings = load_or_create_at(&path).unwrap();

        assert_eq!(settings.content_server.port, 9000);
        assert_eq!(
            settings.content_server.binary,
            PathBuf::from("/opt/kiwix/kiwix-serve")
        );
        assert_eq!(settings.content_server.crash_uptime_secs, 5);
        assert_eq!(
            settings.content_server.content_url("wikipedia_en_all_2024-01.zim"),
            "http://localhost:9000/content/wikipedia_en_all_2024-01"
        );
        assert_eq!(settings.server.port, 3000);
        assert_eq!(settings.library.size_tolerance_bytes, 1024);
    }
}
