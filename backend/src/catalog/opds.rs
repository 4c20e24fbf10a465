//! OPDS (Atom) feed parsing for the remote catalog

use chrono::{DateTime, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::Serialize;
use std::collections::HashMap;

use crate::download::filename_from_url;

/// Relation of the link that points at the downloadable archive
pub const ACQUISITION_REL: &str = "http://opds-spec.org/acquisition/open-access";
const THUMBNAIL_REL: &str = "http://opds-spec.org/image/thumbnail";
/// Suffix of metalink descriptors wrapping the direct download URL
const METALINK_SUFFIX: &str = ".meta4";

/// One `<entry>` of the catalog feed
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CatalogEntry {
    pub id: Option<String>,
    pub name: Option<String>,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub language: Option<String>,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub article_count: Option<u64>,
    pub media_count: Option<u64>,
    /// Direct archive URL, with any metalink suffix stripped
    pub url: Option<String>,
    pub size: Option<u64>,
    pub icon: Option<String>,
    pub content_path: Option<String>,
    pub updated: Option<DateTime<Utc>>,
}

impl CatalogEntry {
    /// Archive filename the download URL resolves to
    pub fn filename(&self) -> Option<String> {
        self.url.as_deref().and_then(filename_from_url)
    }
}

/// One language of the catalog's language feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogLanguage {
    pub code: String,
    pub name: String,
    pub count: u64,
}

#[derive(Debug, Default)]
struct Link {
    rel: Option<String>,
    mime: Option<String>,
    href: Option<String>,
    length: Option<u64>,
}

/// Direct children of one `<entry>`, keyed by local name
#[derive(Debug, Default)]
struct RawEntry {
    fields: HashMap<String, String>,
    links: Vec<Link>,
}

impl RawEntry {
    fn text(&self, name: &str) -> Option<String> {
        self.fields
            .get(name)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    fn number(&self, name: &str) -> Option<u64> {
        self.text(name).and_then(|s| s.parse().ok())
    }

    fn into_entry(self) -> CatalogEntry {
        let acquisition = self
            .links
            .iter()
            .find(|l| l.rel.as_deref() == Some(ACQUISITION_REL));

        let url = acquisition.and_then(|l| l.href.clone()).map(|href| {
            match href.strip_suffix(METALINK_SUFFIX) {
                Some(direct) => direct.to_string(),
                None => href,
            }
        });

        let icon = self
            .links
            .iter()
            .find(|l| {
                l.rel
                    .as_deref()
                    .is_some_and(|rel| rel.starts_with(THUMBNAIL_REL))
            })
            .and_then(|l| l.href.clone());

        let content_path = self
            .links
            .iter()
            .find(|l| l.mime.as_deref() == Some("text/html"))
            .and_then(|l| l.href.clone());

        CatalogEntry {
            id: self.text("id"),
            name: self.text("name"),
            title: self.text("title"),
            summary: self.text("summary"),
            language: self.text("language"),
            category: self.text("category"),
            tags: self
                .text("tags")
                .map(|t| {
                    t.split(';')
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            article_count: self.number("articleCount"),
            media_count: self.number("mediaCount"),
            size: acquisition.and_then(|l| l.length),
            url,
            icon,
            content_path,
            updated: self
                .text("updated")
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
        }
    }

    fn into_language(self) -> Option<CatalogLanguage> {
        Some(CatalogLanguage {
            code: self.text("language")?,
            name: self.text("title")?,
            count: self.number("count").unwrap_or(0),
        })
    }
}

/// Parse every `<entry>` of an entries feed
pub fn parse_entries(xml: &str) -> Result<Vec<CatalogEntry>, quick_xml::Error> {
    Ok(collect_entries(xml)?
        .into_iter()
        .map(RawEntry::into_entry)
        .collect())
}

/// Parse the language feed, skipping entries without a code or name
pub fn parse_languages(xml: &str) -> Result<Vec<CatalogLanguage>, quick_xml::Error> {
    Ok(collect_entries(xml)?
        .into_iter()
        .filter_map(RawEntry::into_language)
        .collect())
}

fn local_name(start: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(start.local_name().as_ref()).into_owned()
}

fn parse_link(start: &BytesStart<'_>) -> Result<Link, quick_xml::Error> {
    let mut link = Link::default();
    for attr in start.attributes() {
        let attr = attr?;
        let value = attr.unescape_value()?.into_owned();
        match attr.key.local_name().as_ref() {
            b"rel" => link.rel = Some(value),
            b"type" => link.mime = Some(value),
            b"href" => link.href = Some(value),
            b"length" => link.length = value.trim().parse().ok(),
            _ => {}
        }
    }
    Ok(link)
}

fn collect_entries(xml: &str) -> Result<Vec<RawEntry>, quick_xml::Error> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut current: Option<RawEntry> = None;
    // Element stack below the current <entry>
    let mut path: Vec<String> = Vec::new();
    let mut text = String::new();

    loop {
        match reader.read_event()? {
            Event::Start(start) => {
                let name = local_name(&start);
                match current.as_mut() {
                    None if name == "entry" => {
                        current = Some(RawEntry::default());
                        path.clear();
                    }
                    None => {}
                    Some(entry) => {
                        if path.is_empty() && name == "link" {
                            entry.links.push(parse_link(&start)?);
                        }
                        path.push(name);
                        text.clear();
                    }
                }
            }
            Event::Empty(start) => {
                if let Some(entry) = current.as_mut() {
                    let name = local_name(&start);
                    if path.is_empty() && name == "link" {
                        entry.links.push(parse_link(&start)?);
                    } else if path.is_empty() {
                        entry.fields.entry(name).or_default();
                    }
                }
            }
            Event::Text(t) => {
                if current.is_some() && path.len() == 1 {
                    text.push_str(&t.unescape()?);
                }
            }
            Event::CData(c) => {
                if current.is_some() && path.len() == 1 {
                    text.push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Event::End(end) => {
                if let Some(entry) = current.as_mut() {
                    match path.pop() {
                        Some(name) => {
                            if path.is_empty() {
                                entry
                                    .fields
                                    .entry(name)
                                    .or_insert_with(|| std::mem::take(&mut text));
                                text.clear();
                            }
                        }
                        None if end.local_name().as_ref() == b"entry" => {
                            if let Some(done) = current.take() {
                                entries.push(done);
                            }
                        }
                        None => {}
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(entries)
}
