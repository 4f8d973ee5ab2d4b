//! Bibliographic metadata extraction.
//!
//! [`MetadataExtractor`] derives an [`ItemMetadata`] either from a rendered
//! page (structured meta tags first, visible title second, URL-derived name
//! last) or from an existing PDF's embedded Info dictionary. Extraction never
//! fails: the worst case is a metadata record with only a synthesized title.

use std::collections::BTreeSet;
use std::path::Path;

use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::capture::RenderSession;

/// Extracted bibliographic metadata for one library item.
///
/// Invariant: `title` is non-empty. Every constructor path falls back to a
/// synthesized, filename-safe string when no real title can be found.
#[derive(Debug, Clone)]
pub struct ItemMetadata {
    /// Item title; never empty.
    pub title: String,
    /// Description or abstract, when discoverable.
    pub description: Option<String>,
    /// Author display name, best-effort from structured tags only.
    pub author: Option<String>,
    /// Publication date string as the page declared it.
    pub publication_date: Option<String>,
    /// Tags to apply to the created item.
    pub tags: BTreeSet<String>,
    /// The source URL, when the input was a webpage.
    pub source_url: Option<String>,
    /// ISO-8601 timestamp of when the capture happened.
    pub access_date: String,
    /// Source domain with any `www.` prefix stripped.
    pub domain: Option<String>,
    /// User agent the capture session presented; recorded as provenance.
    pub capture_user_agent: Option<String>,
}

impl ItemMetadata {
    /// Splits `author` into `(first, last)` name parts for creator fields.
    ///
    /// A single-word author becomes a bare last name.
    #[must_use]
    pub fn author_name_parts(&self) -> Option<(String, String)> {
        let author = self.author.as_deref()?.trim();
        if author.is_empty() {
            return None;
        }
        match author.rsplit_once(' ') {
            Some((first, last)) => Some((first.to_string(), last.to_string())),
            None => Some((String::new(), author.to_string())),
        }
    }
}

/// Shape of the metadata object returned by the in-page probe script.
#[derive(Debug, Deserialize)]
struct PageProbe {
    title: Option<String>,
    description: Option<String>,
    author: Option<String>,
    published: Option<String>,
}

/// The probe reads Open Graph / standard meta fields first and falls back to
/// the document title element.
const METADATA_PROBE_SCRIPT: &str = r#"(() => {
    const meta = (selector) => {
        const el = document.querySelector(selector);
        const content = el ? el.getAttribute('content') : null;
        return content && content.trim() ? content.trim() : null;
    };
    return {
        title: meta('meta[property="og:title"]') || (document.title || '').trim() || null,
        description: meta('meta[name="description"]') || meta('meta[property="og:description"]'),
        author: meta('meta[name="author"]') || meta('meta[property="article:author"]'),
        published: meta('meta[name="publication_date"]') || meta('meta[property="article:published_time"]')
    };
})()"#;

/// Derives [`ItemMetadata`] from rendered pages and existing PDFs.
#[derive(Debug, Default)]
pub struct MetadataExtractor;

impl MetadataExtractor {
    /// Creates an extractor.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Extracts metadata from a rendered page.
    ///
    /// Probe failures are logged and degrade to the URL-derived fallback;
    /// this function never fails.
    #[instrument(skip(self, session))]
    pub async fn extract_from_page(&self, session: &RenderSession, url: &str) -> ItemMetadata {
        let probe: Option<PageProbe> = match session.page().evaluate(METADATA_PROBE_SCRIPT).await {
            Ok(result) => result.into_value().ok(),
            Err(error) => {
                warn!(error = %error, "Metadata probe failed, falling back to URL-derived title");
                None
            }
        };

        let probe = probe.unwrap_or(PageProbe {
            title: None,
            description: None,
            author: None,
            published: None,
        });

        let title = probe
            .title
            .filter(|t| !t.trim().is_empty())
            .map(|t| t.trim().to_string())
            .unwrap_or_else(|| title_from_url(url));

        debug!(title = %title, "Extracted page metadata");
        ItemMetadata {
            title,
            description: probe.description,
            author: probe.author,
            publication_date: probe.published,
            tags: BTreeSet::new(),
            source_url: Some(url.to_string()),
            access_date: access_date_now(),
            domain: domain_of(url),
            capture_user_agent: Some(session.user_agent().to_string()),
        }
    }

    /// Extracts metadata from an existing PDF's embedded Info dictionary.
    ///
    /// An unreadable file or empty Title field falls back to the filename
    /// stem with separators normalized to spaces; this function never fails.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub fn extract_from_pdf(&self, path: &Path) -> ItemMetadata {
        let (title, author) = match read_pdf_info(path) {
            Ok(info) => info,
            Err(error) => {
                warn!(error = %error, "Could not read PDF metadata, using filename");
                (None, None)
            }
        };

        let title = title
            .filter(|t| !t.trim().is_empty())
            .map(|t| t.trim().to_string())
            .unwrap_or_else(|| title_from_filename(path));

        ItemMetadata {
            title,
            description: None,
            author,
            publication_date: None,
            tags: BTreeSet::new(),
            source_url: None,
            access_date: access_date_now(),
            domain: None,
            capture_user_agent: None,
        }
    }
}

fn access_date_now() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Domain with the `www.` prefix stripped, for the libraryCatalog-style field.
#[must_use]
pub fn domain_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    Some(host.strip_prefix("www.").unwrap_or(host).to_string())
}

/// Synthesizes a title from the last meaningful URL path segment, or the
/// domain when the path is empty.
fn title_from_url(url: &str) -> String {
    let from_path = Url::parse(url).ok().and_then(|parsed| {
        let segment = parsed
            .path_segments()?
            .filter(|s| !s.is_empty())
            .next_back()?
            .to_string();
        let stem = segment.rsplit_once('.').map_or(segment.as_str(), |(s, _)| s);
        let normalized = normalize_separators(stem);
        (!normalized.is_empty()).then_some(normalized)
    });

    from_path
        .or_else(|| domain_of(url))
        .unwrap_or_else(|| "Untitled capture".to_string())
}

/// Filename stem with `_`/`-` separators turned into spaces.
fn title_from_filename(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let normalized = normalize_separators(&stem);
    if normalized.is_empty() {
        "Untitled document".to_string()
    } else {
        normalized
    }
}

fn normalize_separators(value: &str) -> String {
    value
        .replace(['_', '-'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Builds the attachment filename `{title}_{domain}.pdf` with the title
/// sanitized and limited to 50 characters.
#[must_use]
pub fn attachment_filename(metadata: &ItemMetadata) -> String {
    let title: String = sanitize_component(&metadata.title).chars().take(50).collect();
    let title = title.trim_matches('_').to_string();
    let title = if title.is_empty() { "capture".to_string() } else { title };
    match metadata.domain.as_deref() {
        Some(domain) => format!("{title}_{}.pdf", sanitize_component(domain)),
        None => format!("{title}.pdf"),
    }
}

/// Collapses filesystem-hostile characters into single underscores.
fn sanitize_component(value: &str) -> String {
    let mut out = String::new();
    let mut prev_sep = false;
    for ch in value.chars() {
        let mapped = match ch {
            c if c.is_alphanumeric() || matches!(c, '.' | '-') => c,
            _ => '_',
        };
        if mapped == '_' {
            if !prev_sep {
                out.push('_');
                prev_sep = true;
            }
        } else {
            out.push(mapped);
            prev_sep = false;
        }
    }
    out.trim_matches('_').to_string()
}

/// Provenance lines written into the created item's `extra` field.
#[must_use]
pub fn provenance_extra(metadata: &ItemMetadata) -> String {
    let mut lines = Vec::new();
    lines.push(format!("accessDate: {}", metadata.access_date));
    if let Some(ref domain) = metadata.domain {
        lines.push(format!("domain: {domain}"));
    }
    if let Some(ref agent) = metadata.capture_user_agent {
        lines.push(format!("userAgent: {agent}"));
    }
    lines.push(format!("zotsaveVersion: {}", crate::VERSION));
    lines.join("\n")
}

/// Reads `(Title, Author)` from the PDF Info dictionary.
fn read_pdf_info(path: &Path) -> Result<(Option<String>, Option<String>), lopdf::Error> {
    let doc = lopdf::Document::load(path)?;
    let info_ref = doc.trailer.get(b"Info")?;
    let info = doc.dereference(info_ref)?.1.as_dict()?;

    let title = info
        .get(b"Title")
        .ok()
        .and_then(|obj| doc.dereference(obj).ok())
        .and_then(|(_, obj)| obj.as_str().ok())
        .map(decode_pdf_string);
    let author = info
        .get(b"Author")
        .ok()
        .and_then(|obj| doc.dereference(obj).ok())
        .and_then(|(_, obj)| obj.as_str().ok())
        .map(decode_pdf_string)
        .filter(|a| !a.trim().is_empty());

    Ok((title, author))
}

/// PDF text strings are UTF-16BE with a BOM, or byte strings otherwise.
fn decode_pdf_string(bytes: &[u8]) -> String {
    if bytes.len() >= 2 && bytes[0] == 0xFE && bytes[1] == 0xFF {
        let units: Vec<u16> = bytes[2..]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn bare_metadata(title: &str, domain: Option<&str>) -> ItemMetadata {
        ItemMetadata {
            title: title.to_string(),
            description: None,
            author: None,
            publication_date: None,
            tags: BTreeSet::new(),
            source_url: None,
            access_date: access_date_now(),
            domain: domain.map(str::to_string),
            capture_user_agent: None,
        }
    }

    #[test]
    fn test_title_from_url_uses_last_path_segment() {
        assert_eq!(
            title_from_url("https://example.com/posts/why-rust-wins.html"),
            "why rust wins"
        );
    }

    #[test]
    fn test_title_from_url_falls_back_to_domain() {
        assert_eq!(title_from_url("https://www.example.com/"), "example.com");
    }

    #[test]
    fn test_title_from_url_never_empty() {
        // Even a garbage URL synthesizes a non-empty title.
        assert!(!title_from_url("not a url at all").is_empty());
        assert!(!title_from_url("https://example.com").is_empty());
    }

    #[test]
    fn test_title_from_filename_normalizes_separators() {
        assert_eq!(
            title_from_filename(&PathBuf::from("/tmp/deep_learning-survey_2024.pdf")),
            "deep learning survey 2024"
        );
    }

    #[test]
    fn test_extract_from_pdf_missing_file_synthesizes_title() {
        let extractor = MetadataExtractor::new();
        let metadata = extractor.extract_from_pdf(Path::new("/nonexistent/attention_is_all.pdf"));
        assert_eq!(metadata.title, "attention is all");
        assert!(metadata.source_url.is_none());
    }

    #[test]
    fn test_domain_strips_www() {
        assert_eq!(
            domain_of("https://www.example.org/a/b").as_deref(),
            Some("example.org")
        );
        assert_eq!(
            domain_of("https://blog.example.org/").as_deref(),
            Some("blog.example.org")
        );
    }

    #[test]
    fn test_attachment_filename_sanitizes_and_truncates() {
        let long_title = "A Very Long Title: With/Bad\\Characters? ".repeat(4);
        let metadata = bare_metadata(&long_title, Some("example.com"));
        let filename = attachment_filename(&metadata);
        assert!(filename.ends_with("_example.com.pdf"), "got {filename}");
        assert!(!filename.contains('/'));
        assert!(!filename.contains('?'));
        let stem_len = filename.trim_end_matches("_example.com.pdf").chars().count();
        assert!(stem_len <= 50, "title part too long: {stem_len}");
    }

    #[test]
    fn test_attachment_filename_without_domain() {
        let metadata = bare_metadata("Standalone Paper", None);
        assert_eq!(attachment_filename(&metadata), "Standalone_Paper.pdf");
    }

    #[test]
    fn test_author_name_parts_split() {
        let mut metadata = bare_metadata("t", None);
        metadata.author = Some("Ada Byron Lovelace".to_string());
        assert_eq!(
            metadata.author_name_parts(),
            Some(("Ada Byron".to_string(), "Lovelace".to_string()))
        );

        metadata.author = Some("Prince".to_string());
        assert_eq!(
            metadata.author_name_parts(),
            Some((String::new(), "Prince".to_string()))
        );
    }

    #[test]
    fn test_provenance_extra_contains_version() {
        let mut metadata = bare_metadata("t", Some("example.com"));
        metadata.capture_user_agent = Some("TestAgent/1.0".to_string());
        let extra = provenance_extra(&metadata);
        assert!(extra.contains("domain: example.com"));
        assert!(extra.contains("userAgent: TestAgent/1.0"));
        assert!(extra.contains(crate::VERSION));
    }

    #[test]
    fn test_decode_pdf_string_utf16be() {
        let bytes = [0xFE, 0xFF, 0x00, 0x48, 0x00, 0x69];
        assert_eq!(decode_pdf_string(&bytes), "Hi");
        assert_eq!(decode_pdf_string(b"plain"), "plain");
    }
}
