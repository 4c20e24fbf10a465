//! Archive filename conventions: `<base>_<YYYY-MM>.zim`

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

static VERSIONED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<base>.+?)_(?P<version>\d{4}-\d{2})\.zim$").expect("valid regex")
});

/// Content family whose filenames carry a language segment before the topic
const DEVDOCS_PREFIX: &str = "devdocs_";

/// A filename split into its stable name and its version token
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedName {
    pub base_name: String,
    pub version: Option<String>,
}

/// Split `filename` into base name and `YYYY-MM` version token. Never fails:
/// unversioned names come back whole, minus the `.zim` extension.
pub fn parse_filename(filename: &str) -> ParsedName {
    if let Some(caps) = VERSIONED.captures(filename) {
        return ParsedName {
            base_name: caps["base"].to_string(),
            version: Some(caps["version"].to_string()),
        };
    }

    ParsedName {
        base_name: filename
            .strip_suffix(".zim")
            .unwrap_or(filename)
            .to_string(),
        version: None,
    }
}

/// Best-effort catalog search hint for a base name.
///
/// `pets.stackexchange.com_en_all` searches for `pets`,
/// `devdocs_en_redux` for `redux`, and `wikipedia_en_all_nopic` for
/// `wikipedia en`.
pub fn search_term(base_name: &str) -> String {
    if base_name.contains('.') {
        let domain = base_name.split('_').next().unwrap_or(base_name);
        return domain.split('.').next().unwrap_or(domain).to_string();
    }

    let parts: Vec<&str> = base_name.split('_').collect();

    if base_name.starts_with(DEVDOCS_PREFIX) {
        return if parts.len() > 2 {
            parts[2..].join(" ")
        } else {
            base_name.to_string()
        };
    }

    parts.iter().take(2).copied().collect::<Vec<_>>().join(" ")
}

/// Key used to pair an installed file with catalog files: the base name,
/// lowercased, with `_` and spaces folded to `-`.
pub fn match_key(filename: &str) -> String {
    parse_filename(filename)
        .base_name
        .to_lowercase()
        .replace(['_', ' '], "-")
}

/// Version facts of one side of an update comparison
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionInfo {
    pub published: Option<DateTime<Utc>>,
    pub version: Option<String>,
}

/// Whether `candidate` is strictly newer than `installed`.
///
/// Publish dates win when both sides have one; otherwise `YYYY-MM` tokens
/// are compared as strings. Anything else is reported as not newer.
pub fn is_newer(candidate: &VersionInfo, installed: &VersionInfo) -> bool {
    if let (Some(candidate), Some(installed)) = (candidate.published, installed.published) {
        return candidate > installed;
    }

    match (&candidate.version, &installed.version) {
        (Some(candidate), Some(installed)) => candidate > installed,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn info(published: Option<(i32, u32, u32)>, version: Option<&str>) -> VersionInfo {
        VersionInfo {
            published: published.map(|(y, m, d)| Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()),
            version: version.map(str::to_string),
        }
    }

    #[test]
    fn versioned_names_split_at_the_token() {
        for base in [
            "wikipedia_en_all",
            "wikipedia_en_all_nopic",
            "pets.stackexchange.com_en_all",
            "a_2023-01",
        ] {
            let parsed = parse_filename(&format!("{base}_2024-06.zim"));
            assert_eq!(parsed.base_name, base);
            assert_eq!(parsed.version.as_deref(), Some("2024-06"));
        }
    }

    #[test]
    fn unversioned_names_keep_everything_but_the_extension() {
        assert_eq!(
            parse_filename("gutenberg_en_all.zim"),
            ParsedName {
                base_name: "gutenberg_en_all".into(),
                version: None
            }
        );
        assert_eq!(parse_filename("notes").base_name, "notes");
        assert_eq!(parse_filename("wiki_2024-1.zim").version, None);
        assert_eq!(parse_filename("").base_name, "");
    }

    #[test]
    fn search_terms_follow_the_family_heuristics() {
        assert_eq!(search_term("pets.stackexchange.com_en_all"), "pets");
        assert_eq!(search_term("devdocs_en_redux"), "redux");
        assert_eq!(search_term("devdocs_en"), "devdocs_en");
        assert_eq!(search_term("wikipedia_ace_all_nopic"), "wikipedia ace");
        assert_eq!(search_term("gutenberg"), "gutenberg");
    }

    #[test]
    fn match_key_is_exact_not_fuzzy() {
        assert_eq!(
            match_key("wikipedia_en_all_2023-10.zim"),
            match_key("wikipedia_en_all_2024-01.zim")
        );
        assert_eq!(match_key("Wikipedia_EN_all_2023-10.zim"), "wikipedia-en-all");
        assert_ne!(
            match_key("wikipedia_en_all_2023-10.zim"),
            match_key("wikipedia_en_all_nopic_2024-01.zim")
        );
    }

    #[test]
    fn version_tokens_compare_monotonically() {
        let older = info(None, Some("2023-01"));
        let newer = info(None, Some("2024-06"));
        assert!(is_newer(&newer, &older));
        assert!(!is_newer(&older, &newer));
        assert!(!is_newer(&older, &older));
    }

    #[test]
    fn publish_dates_take_precedence_over_tokens() {
        let installed = info(Some((2024, 6, 1)), Some("2024-06"));
        let candidate = info(Some((2024, 3, 1)), Some("2025-01"));
        assert!(!is_newer(&candidate, &installed));

        let installed = info(Some((2024, 3, 1)), Some("2025-01"));
        let candidate = info(Some((2024, 6, 1)), Some("2024-06"));
        assert!(is_newer(&candidate, &installed));
    }

    #[test]
    fn incomparable_versions_are_never_newer() {
        assert!(!is_newer(&info(Some((2024, 1, 1)), None), &info(None, None)));
        assert!(!is_newer(&info(None, Some("2024-01")), &info(None, None)));
        assert!(!is_newer(&info(None, None), &info(None, Some("2023-01"))));
    }
}
