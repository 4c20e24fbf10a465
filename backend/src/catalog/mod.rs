//! Remote archive catalog: searching for update candidates and browsing

pub mod naming;
pub mod opds;

pub use naming::{is_newer, match_key, parse_filename, search_term, VersionInfo};
pub use opds::{CatalogEntry, CatalogLanguage};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::config::CatalogSettings;
use crate::error::{LibraryError, Result};

const ENTRIES_PATH: &str = "/catalog/v2/entries";
const LANGUAGES_PATH: &str = "/catalog/v2/languages";

/// A catalog entry reduced to what update detection needs
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateCandidate {
    pub name: Option<String>,
    pub title: Option<String>,
    pub url: String,
    pub size: Option<u64>,
    pub filename: String,
    pub base_name: String,
    pub version: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub article_count: Option<u64>,
    pub media_count: Option<u64>,
}

impl UpdateCandidate {
    /// Entries whose URL does not resolve to a filename are dropped
    pub fn from_entry(entry: CatalogEntry) -> Option<Self> {
        let filename = entry.filename()?;
        let url = entry.url?;
        let parsed = parse_filename(&filename);

        Some(Self {
            name: entry.name,
            title: entry.title,
            url,
            size: entry.size,
            filename,
            base_name: parsed.base_name,
            version: parsed.version,
            published: entry.updated,
            article_count: entry.article_count,
            media_count: entry.media_count,
        })
    }

    pub fn version_info(&self) -> VersionInfo {
        VersionInfo {
            published: self.published,
            version: self.version.clone(),
        }
    }
}

/// Newest candidate that pairs with `installed_filename` and is newer than
/// the installed version
pub fn newest_match<'a>(
    installed_filename: &str,
    installed: &VersionInfo,
    candidates: &'a [UpdateCandidate],
) -> Option<&'a UpdateCandidate> {
    let key = match_key(installed_filename);

    candidates
        .iter()
        .filter(|c| match_key(&c.filename) == key)
        .filter(|c| is_newer(&c.version_info(), installed))
        .fold(None, |best: Option<&UpdateCandidate>, c| match best {
            Some(b) if !is_newer(&c.version_info(), &b.version_info()) => Some(b),
            _ => Some(c),
        })
}

/// Filters for browsing the catalog
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CatalogQuery {
    pub count: Option<u32>,
    pub start: Option<u32>,
    pub category: Option<String>,
    pub lang: Option<String>,
    pub q: Option<String>,
}

/// HTTP client for the catalog's OPDS endpoints
#[derive(Clone)]
pub struct CatalogClient {
    http: reqwest::Client,
    base_url: String,
    search_count: u32,
    default_language: String,
}

impl CatalogClient {
    pub fn new(settings: &CatalogSettings) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("Zimkeeper/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;

        Ok(Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            search_count: settings.search_count,
            default_language: settings.default_language.clone(),
        })
    }

    async fn fetch(&self, path: &str, query: &[(&str, String)]) -> Result<String> {
        let url = format!("{}{}", self.base_url, path);
        debug!("Catalog request: {} {:?}", url, query);

        let response = self
            .http
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| LibraryError::CatalogUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(LibraryError::CatalogUnavailable(format!(
                "catalog returned HTTP {}",
                response.status()
            )));
        }

        response
            .text()
            .await
            .map_err(|e| LibraryError::CatalogUnavailable(e.to_string()))
    }

    /// Search the catalog for entries that may be newer versions of an archive
    pub async fn find_candidates(&self, term: &str) -> Result<Vec<UpdateCandidate>> {
        let body = self
            .fetch(
                ENTRIES_PATH,
                &[
                    ("count", self.search_count.to_string()),
                    ("q", term.to_string()),
                ],
            )
            .await?;

        let entries = opds::parse_entries(&body)
            .map_err(|e| LibraryError::CatalogUnavailable(format!("malformed feed: {e}")))?;

        Ok(entries
            .into_iter()
            .filter_map(UpdateCandidate::from_entry)
            .collect())
    }

    /// Browse catalog entries, defaulting to the configured language
    pub async fn browse(&self, query: &CatalogQuery) -> Result<Vec<CatalogEntry>> {
        let mut params = vec![
            ("count", query.count.unwrap_or(self.search_count).to_string()),
            ("start", query.start.unwrap_or(0).to_string()),
            (
                "lang",
                query
                    .lang
                    .clone()
                    .unwrap_or_else(|| self.default_language.clone()),
            ),
        ];
        if let Some(category) = query.category.as_ref().filter(|c| !c.is_empty()) {
            params.push(("category", category.clone()));
        }
        if let Some(q) = query.q.as_ref().filter(|q| !q.is_empty()) {
            params.push(("q", q.clone()));
        }

        let body = self.fetch(ENTRIES_PATH, &params).await?;
        opds::parse_entries(&body)
            .map_err(|e| LibraryError::CatalogUnavailable(format!("malformed feed: {e}")))
    }

    /// Languages the catalog offers, with entry counts
    pub async fn languages(&self) -> Result<Vec<CatalogLanguage>> {
        let body = self.fetch(LANGUAGES_PATH, &[]).await?;
        opds::parse_languages(&body)
            .map_err(|e| LibraryError::CatalogUnavailable(format!("malformed feed: {e}")))
    }
}
