//! Structured listing: lsjson parsing, continuation tokens, pagination
//!
//! The engine's JSON listing mode emits one entry per line inside an array.
//! The server parses the stream incrementally; a page that fills up stops the
//! subprocess early instead of draining the whole bucket.
//!
//! Because a page may contain both common prefixes ("folders") and objects,
//! and the engine's native pagination is bucket-global, continuation tokens
//! are tagged boundaries: `p:<prefix>` or `o:<key>`. A resume re-reads the
//! engine output from the start and skips entries until the boundary matches.
//! Bare legacy tokens (no tag) are still accepted on input, never emitted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

use crate::process::{Engine, EngineChild};
use crate::remote::RemoteContext;
use crate::EngineError;

// ==================== Entries ====================

/// Raw lsjson record
#[derive(Debug, Deserialize)]
struct LsJsonEntry {
    #[serde(rename = "Path")]
    path: String,
    #[serde(rename = "Size", default)]
    size: i64,
    #[serde(rename = "ModTime")]
    mod_time: Option<String>,
    #[serde(rename = "IsDir", default)]
    is_dir: bool,
    #[serde(rename = "Hashes", default)]
    hashes: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectMeta {
    pub key: String,
    pub size: i64,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// One normalized listing row: a common prefix or an object
#[derive(Debug, Clone, PartialEq)]
pub enum ListEntry {
    /// Always carries a trailing slash
    Prefix(String),
    Object(ObjectMeta),
}

impl ListEntry {
    fn from_raw(raw: LsJsonEntry) -> Self {
        if raw.is_dir {
            return ListEntry::Prefix(format!("{}/", raw.path));
        }
        // Zero-byte keys ending in '/' are folder markers; fold them into
        // common prefixes so the UI never shows duplicate rows.
        if raw.size == 0 && raw.path.ends_with('/') {
            return ListEntry::Prefix(raw.path);
        }
        let etag = raw
            .hashes
            .as_ref()
            .and_then(|h| h.get("md5"))
            .and_then(|v| v.as_str())
            .map(str::to_string);
        ListEntry::Object(ObjectMeta {
            key: raw.path,
            size: raw.size.max(0),
            etag,
            last_modified: raw
                .mod_time
                .as_deref()
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .map(|t| t.with_timezone(&Utc)),
        })
    }
}

/// Parse one line of lsjson array output. Returns None for the array
/// brackets and blank lines.
fn parse_lsjson_line(line: &str) -> Option<Result<LsJsonEntry, EngineError>> {
    let trimmed = line.trim().trim_end_matches(',');
    if trimmed.is_empty() || trimmed == "[" || trimmed == "]" {
        return None;
    }
    Some(
        serde_json::from_str(trimmed)
            .map_err(|e| EngineError::Parse(format!("bad listing entry: {} ({})", trimmed, e))),
    )
}

/// Parse one lsjson line into a normalized entry. Returns None for the
/// array brackets and blank lines.
pub fn parse_entry_line(line: &str) -> Option<Result<ListEntry, EngineError>> {
    parse_lsjson_line(line).map(|parsed| parsed.map(ListEntry::from_raw))
}

// ==================== Continuation tokens ====================

/// Tagged page boundary, serialized opaque (`o:<key>` / `p:<prefix>`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContinuationToken {
    Object(String),
    Prefix(String),
    /// Pre-tagging token format: a bare key that may name either boundary
    /// kind. Accepted on input only.
    Legacy(String),
}

impl ContinuationToken {
    pub fn parse(raw: &str) -> Self {
        if let Some(key) = raw.strip_prefix("o:") {
            ContinuationToken::Object(key.to_string())
        } else if let Some(prefix) = raw.strip_prefix("p:") {
            ContinuationToken::Prefix(prefix.to_string())
        } else {
            ContinuationToken::Legacy(raw.to_string())
        }
    }

    pub fn encode(&self) -> String {
        match self {
            ContinuationToken::Object(key) => format!("o:{}", key),
            ContinuationToken::Prefix(prefix) => format!("p:{}", prefix),
            // Legacy tokens are never emitted; re-tag if one gets this far.
            ContinuationToken::Legacy(key) => format!("o:{}", key),
        }
    }

    pub fn for_entry(entry: &ListEntry) -> Self {
        match entry {
            ListEntry::Prefix(p) => ContinuationToken::Prefix(p.clone()),
            ListEntry::Object(o) => ContinuationToken::Object(o.key.clone()),
        }
    }

    fn matches(&self, entry: &ListEntry) -> bool {
        match (self, entry) {
            (ContinuationToken::Object(k), ListEntry::Object(o)) => o.key == *k,
            (ContinuationToken::Prefix(p), ListEntry::Prefix(q)) => p == q,
            (ContinuationToken::Legacy(raw), ListEntry::Object(o)) => o.key == *raw,
            (ContinuationToken::Legacy(raw), ListEntry::Prefix(q)) => {
                raw == q || format!("{}/", raw) == *q
            }
            _ => false,
        }
    }
}

// ==================== Pagination ====================

#[derive(Debug, Serialize)]
pub struct ListPage {
    #[serde(skip)]
    pub entries: Vec<ListEntry>,
    #[serde(rename = "isTruncated")]
    pub is_truncated: bool,
    #[serde(rename = "nextContinuationToken")]
    pub next_token: Option<String>,
}

/// Incremental page assembler fed from the entry stream.
///
/// `push` returns false once the page budget is reached, which is the stop
/// sentinel for the subprocess driver.
pub struct Paginator {
    token: Option<ContinuationToken>,
    max_keys: usize,
    entries: Vec<ListEntry>,
    seen_prefixes: HashSet<String>,
    skipping: bool,
    truncated: bool,
}

impl Paginator {
    pub fn new(token: Option<ContinuationToken>, max_keys: usize) -> Self {
        let skipping = token.is_some();
        Self {
            token,
            max_keys: max_keys.max(1),
            entries: Vec::new(),
            seen_prefixes: HashSet::new(),
            skipping,
            truncated: false,
        }
    }

    pub fn push(&mut self, entry: ListEntry) -> bool {
        if self.skipping {
            if self
                .token
                .as_ref()
                .map(|t| t.matches(&entry))
                .unwrap_or(false)
            {
                self.skipping = false;
            }
            return true;
        }

        if let ListEntry::Prefix(p) = &entry {
            if !self.seen_prefixes.insert(p.clone()) {
                return true;
            }
        }

        if self.entries.len() == self.max_keys {
            self.truncated = true;
            return false;
        }
        self.entries.push(entry);
        true
    }

    pub fn finish(self) -> ListPage {
        let next_token = if self.truncated {
            self.entries
                .last()
                .map(|e| ContinuationToken::for_entry(e).encode())
        } else {
            None
        };
        ListPage {
            entries: self.entries,
            is_truncated: self.truncated,
            next_token,
        }
    }
}

// ==================== Stream drivers ====================

/// Feed normalized entries from an lsjson stream into `on_entry` until the
/// stream ends or the callback asks to stop.
pub async fn read_entries<R, F>(reader: R, mut on_entry: F) -> Result<bool, EngineError>
where
    R: AsyncRead + Unpin,
    F: FnMut(ListEntry) -> bool,
{
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if let Some(parsed) = parse_entry_line(&line) {
            if !on_entry(parsed?) {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

/// List one page of a bucket (optionally under a prefix).
///
/// Spawns `lsjson` non-recursively, streams the output through a
/// [`Paginator`], and kills the subprocess as soon as the page budget is
/// known to be exceeded.
pub async fn list_page(
    engine: &Engine,
    ctx: RemoteContext,
    bucket: &str,
    prefix: &str,
    raw_token: Option<&str>,
    max_keys: usize,
) -> Result<ListPage, EngineError> {
    let spec = RemoteContext::remote_spec(bucket, prefix.trim_end_matches('/'));
    let mut child = engine.start(ctx, &["lsjson", &spec], false)?;
    let stdout = child
        .stdout()
        .ok_or_else(|| EngineError::Spawn("engine stdout not captured".into()))?;
    let stderr = child.stderr();

    // Drain stderr on the side so a chatty engine can't deadlock the pipe.
    let stderr_task = tokio::spawn(async move {
        let mut buf = String::new();
        if let Some(mut stderr) = stderr {
            let _ = stderr.read_to_string(&mut buf).await;
        }
        buf
    });

    let token = raw_token.map(ContinuationToken::parse);
    let mut paginator = Paginator::new(token, max_keys);
    let drained = read_entries(stdout, |entry| paginator.push(entry)).await?;

    if drained {
        let status = child.wait().await?;
        if !status.success() {
            let stderr = stderr_task.await.unwrap_or_default();
            return Err(EngineError::Exit {
                code: status.code().unwrap_or(-1),
                stderr,
            });
        }
    } else {
        // Page budget reached: stop sentinel fired, terminate the engine.
        child.kill().await;
        stderr_task.abort();
    }

    Ok(paginator.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(key: &str, size: i64) -> ListEntry {
        ListEntry::Object(ObjectMeta {
            key: key.to_string(),
            size,
            etag: None,
            last_modified: None,
        })
    }

    fn prefix(p: &str) -> ListEntry {
        ListEntry::Prefix(p.to_string())
    }

    /// 5 folders then 7 objects, the engine's directory-first output order.
    fn sample_listing() -> Vec<ListEntry> {
        let mut entries: Vec<ListEntry> =
            (1..=5).map(|i| prefix(&format!("dir{}/", i))).collect();
        entries.extend((1..=7).map(|i| obj(&format!("file{}.bin", i), i)));
        entries
    }

    fn run_pages(listing: &[ListEntry], max_keys: usize) -> Vec<ListPage> {
        let mut pages = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut paginator =
                Paginator::new(token.as_deref().map(ContinuationToken::parse), max_keys);
            for entry in listing {
                if !paginator.push(entry.clone()) {
                    break;
                }
            }
            let page = paginator.finish();
            token = page.next_token.clone();
            let done = !page.is_truncated;
            pages.push(page);
            if done {
                return pages;
            }
        }
    }

    #[test]
    fn pages_concatenate_to_the_full_listing() {
        let listing = sample_listing();
        let pages = run_pages(&listing, 3);

        assert_eq!(pages[0].entries.len(), 3);
        assert!(pages[0].is_truncated);
        // Directory output puts folders first, so the first boundary is a prefix.
        assert_eq!(pages[0].next_token.as_deref(), Some("p:dir3/"));

        let flat: Vec<ListEntry> = pages.into_iter().flat_map(|p| p.entries).collect();
        assert_eq!(flat, listing);
    }

    #[test]
    fn resume_skips_to_the_boundary() {
        let listing = sample_listing();
        let mut paginator = Paginator::new(Some(ContinuationToken::parse("o:file2.bin")), 100);
        for entry in &listing {
            paginator.push(entry.clone());
        }
        let page = paginator.finish();
        assert_eq!(page.entries.len(), 5);
        assert_eq!(page.entries[0], obj("file3.bin", 3));
        assert!(!page.is_truncated);
        assert!(page.next_token.is_none());
    }

    #[test]
    fn legacy_bare_tokens_match_either_boundary_kind() {
        let listing = sample_listing();

        // Bare object key.
        let mut p = Paginator::new(Some(ContinuationToken::parse("file6.bin")), 100);
        for entry in &listing {
            p.push(entry.clone());
        }
        assert_eq!(p.finish().entries, vec![obj("file7.bin", 7)]);

        // Bare prefix without its trailing slash.
        let mut p = Paginator::new(Some(ContinuationToken::parse("dir5")), 2);
        for entry in &listing {
            if !p.push(entry.clone()) {
                break;
            }
        }
        let page = p.finish();
        assert_eq!(page.entries, vec![obj("file1.bin", 1), obj("file2.bin", 2)]);
        // Emitted tokens are always tagged, even after a legacy input.
        assert_eq!(page.next_token.as_deref(), Some("o:file2.bin"));
    }

    #[test]
    fn folder_markers_collapse_into_prefixes() {
        let raw = LsJsonEntry {
            path: "photos/".into(),
            size: 0,
            mod_time: None,
            is_dir: false,
            hashes: None,
        };
        assert_eq!(ListEntry::from_raw(raw), prefix("photos/"));
    }

    #[test]
    fn duplicate_prefixes_are_emitted_once() {
        // A real directory entry followed by its zero-byte folder marker.
        let mut p = Paginator::new(None, 10);
        p.push(prefix("photos/"));
        p.push(prefix("photos/"));
        p.push(obj("photos.txt", 1));
        let page = p.finish();
        assert_eq!(page.entries.len(), 2);
    }

    #[test]
    fn lsjson_lines_parse_ignoring_array_brackets() {
        assert!(parse_lsjson_line("[").is_none());
        assert!(parse_lsjson_line("]").is_none());
        assert!(parse_lsjson_line("").is_none());

        let entry = parse_lsjson_line(
            r#"{"Path":"a/b.txt","Name":"b.txt","Size":42,"ModTime":"2024-03-01T10:00:00Z","IsDir":false},"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(entry.path, "a/b.txt");
        assert_eq!(entry.size, 42);

        assert!(parse_lsjson_line("{not json").unwrap().is_err());
    }

    #[tokio::test]
    async fn read_entries_honors_the_stop_sentinel() {
        let body = r#"[
{"Path":"a","Name":"a","Size":1,"IsDir":false},
{"Path":"b","Name":"b","Size":2,"IsDir":false},
{"Path":"c","Name":"c","Size":3,"IsDir":false}
]"#;
        let mut seen = 0;
        let drained = read_entries(body.as_bytes(), |_| {
            seen += 1;
            seen < 2
        })
        .await
        .unwrap();
        assert!(!drained);
        assert_eq!(seen, 2);
    }

    #[test]
    fn token_round_trip() {
        for raw in ["o:some/key.txt", "p:photos/2024/"] {
            assert_eq!(ContinuationToken::parse(raw).encode(), raw);
        }
    }
}
