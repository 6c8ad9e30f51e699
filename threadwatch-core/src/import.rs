//! Finding thread references in user-supplied text and files.

use std::collections::HashSet;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::entity::EntityId;

static THREAD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"threads/(?:([^\./\s]*)\.)?(\d+)").expect("valid regex"));
static HREF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)href\s*=\s*["']([^"']+)["']"#).expect("valid regex"));
static SHORTCUT_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^\s*URL\s*=\s*(\S+)\s*$").expect("valid regex"));

/// A thread reference: the numeric id and the optional slug before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadMatch {
    pub id: EntityId,
    pub slug: Option<String>,
}

/// Every thread reference in `text`, first occurrence per id, in order.
pub fn extract_thread_matches(text: &str) -> Vec<ThreadMatch> {
    let mut seen = HashSet::new();
    THREAD
        .captures_iter(text)
        .filter_map(|caps| {
            let id: EntityId = caps.get(2)?.as_str().parse().ok()?;
            let slug = caps
                .get(1)
                .map(|m| m.as_str().to_owned())
                .filter(|s| !s.is_empty());
            seen.insert(id).then_some(ThreadMatch { id, slug })
        })
        .collect()
}

/// Canonical URL for a thread under `threads_page`.
pub fn clean_thread_url(threads_page: &str, thread: &ThreadMatch) -> String {
    match &thread.slug {
        Some(slug) => format!("{threads_page}{slug}.{}/", thread.id),
        None => format!("{threads_page}{}/", thread.id),
    }
}

/// Threads referenced by an internet shortcut (`[InternetShortcut]` INI).
pub fn from_url_shortcut(text: &str) -> Vec<ThreadMatch> {
    let urls: Vec<&str> = SHORTCUT_URL
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .collect();
    extract_thread_matches(&urls.join("\n"))
}

/// Threads linked from an exported browser bookmarks file.
pub fn from_bookmarks_html(text: &str) -> Vec<ThreadMatch> {
    let hrefs: Vec<&str> = HREF
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .collect();
    extract_thread_matches(&hrefs.join("\n"))
}

/// Read `path` and pick the extraction by extension: `.url` shortcuts,
/// `.html`/`.htm` bookmark exports, anything else as plain text.
pub async fn from_file(path: &Path) -> std::io::Result<Vec<ThreadMatch>> {
    let raw = tokio::fs::read(path).await?;
    let text = String::from_utf8_lossy(&raw);
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    Ok(match ext.as_str() {
        "url" => from_url_shortcut(&text),
        "html" | "htm" => from_bookmarks_html(&text),
        _ => extract_thread_matches(&text),
    })
}
