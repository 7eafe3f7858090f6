use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use super::{RecordSource, SourcePage};
use crate::error::IngestError;
use crate::record::RawRecord;

/// Reads a directory of JSON export files named with a leading ISO-8601
/// timestamp, sorted lexicographically for deterministic order. Each file
/// holds an array of record objects, a single record object, or a map keyed
/// by source key. Filesystem errors are fatal; a file whose JSON does not
/// parse is logged, counted, and skipped.
#[derive(Debug)]
pub struct LocalDirSource {
    label: String,
    files: VecDeque<PathBuf>,
    pending: VecDeque<RawRecord>,
    pending_malformed: usize,
    page_size: usize,
    limit: Option<usize>,
    emitted: usize,
    exhausted: bool,
}

impl LocalDirSource {
    pub fn open(dir: &Path, page_size: usize, limit: Option<usize>) -> Result<Self, IngestError> {
        let entries = fs::read_dir(dir).map_err(|e| {
            IngestError::source_unavailable(format!("cannot read {}: {e}", dir.display()))
        })?;
        let mut files: Vec<PathBuf> = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| {
                IngestError::source_unavailable(format!("cannot read {}: {e}", dir.display()))
            })?;
            let path = entry.path();
            let is_json = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
            if path.is_file() && is_json {
                files.push(path);
            }
        }
        files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        debug!(dir = %dir.display(), files = files.len(), "local source opened");
        Ok(Self {
            label: dir.display().to_string(),
            files: files.into(),
            pending: VecDeque::new(),
            pending_malformed: 0,
            page_size: page_size.max(1),
            limit,
            emitted: 0,
            exhausted: false,
        })
    }

    fn limit_reached(&self) -> bool {
        self.limit.is_some_and(|lim| self.emitted >= lim)
    }

    /// Decode the next file into `pending`. Returns false when no files remain.
    fn load_next_file(&mut self) -> Result<bool, IngestError> {
        let Some(path) = self.files.pop_front() else {
            return Ok(false);
        };
        let raw = fs::read_to_string(&path).map_err(|e| {
            IngestError::source_unavailable(format!("cannot read {}: {e}", path.display()))
        })?;
        let value: Value = match serde_json::from_str(&raw) {
            Ok(v) => v,
            Err(err) => {
                warn!(file = %path.display(), error = %err, "skipping unparseable export file");
                self.pending_malformed += 1;
                return Ok(true);
            }
        };
        let fallback_ts = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(timestamp_prefix)
            .unwrap_or(DateTime::UNIX_EPOCH);

        match value {
            Value::Array(entries) => {
                for entry in &entries {
                    self.push_decoded(RawRecord::from_export_value(entry, None, fallback_ts));
                }
            }
            Value::Object(ref map) if map.contains_key("gameJson") => {
                self.push_decoded(RawRecord::from_export_value(&value, None, fallback_ts));
            }
            Value::Object(map) => {
                // Dump shape keyed by source key.
                for (key, entry) in &map {
                    self.push_decoded(RawRecord::from_export_value(entry, Some(key), fallback_ts));
                }
            }
            _ => {
                warn!(file = %path.display(), "export file is not an array or object; skipping");
                self.pending_malformed += 1;
            }
        }
        Ok(true)
    }

    fn push_decoded(&mut self, rec: Option<RawRecord>) {
        match rec {
            Some(rec) => self.pending.push_back(rec),
            None => self.pending_malformed += 1,
        }
    }
}

/// Creation-time fallback from the file name: a full RFC 3339 prefix when
/// present, else a bare leading date at midnight UTC.
fn timestamp_prefix(name: &str) -> Option<DateTime<Utc>> {
    let head: String = name
        .chars()
        .take_while(|c| c.is_ascii_digit() || matches!(c, '-' | ':' | 'T' | 'Z' | '+' | '.'))
        .collect();
    // The scan keeps the separator joining prefix and stem ("...00Z-export");
    // drop trailing separators so a full RFC 3339 prefix still parses.
    let head = head.trim_end_matches(['-', ':', '+', '.', 'T']);
    if let Ok(dt) = DateTime::parse_from_rfc3339(head) {
        return Some(dt.with_timezone(&Utc));
    }
    let date = head.get(0..10)?;
    let midnight = NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .ok()?
        .and_hms_opt(0, 0, 0)?;
    Some(midnight.and_utc())
}

#[async_trait]
impl RecordSource for LocalDirSource {
    fn label(&self) -> &str {
        &self.label
    }

    async fn next_page(&mut self) -> Result<Option<SourcePage>, IngestError> {
        if self.exhausted || self.limit_reached() {
            return Ok(None);
        }
        let mut page = SourcePage::default();
        while page.records.len() < self.page_size && !self.limit_reached() {
            if let Some(rec) = self.pending.pop_front() {
                page.records.push(rec);
                self.emitted += 1;
            } else if !self.load_next_file()? {
                break;
            }
        }
        page.malformed = std::mem::take(&mut self.pending_malformed);
        if page.records.is_empty() && page.malformed == 0 {
            self.exhausted = true;
            return Ok(None);
        }
        Ok(Some(page))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, contents: &str) {
        let mut f = fs::File::create(dir.join(name)).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    #[tokio::test]
    async fn files_are_read_in_lexicographic_order() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "2023-02-01T00-00-00-export.json",
            r#"[{"firebaseKey":"B","gameJson":"{}"}]"#,
        );
        write_file(
            dir.path(),
            "2023-01-01T00-00-00-export.json",
            r#"[{"firebaseKey":"A","gameJson":"{}"}]"#,
        );
        let mut src = LocalDirSource::open(dir.path(), 10, None).unwrap();
        let page = src.next_page().await.unwrap().unwrap();
        let keys: Vec<&str> = page.records.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, ["A", "B"]);
        assert!(src.next_page().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pages_respect_page_size_and_limit() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "2023-01-01-games.json",
            r#"[
                {"firebaseKey":"A","gameJson":"{}"},
                {"firebaseKey":"B","gameJson":"{}"},
                {"firebaseKey":"C","gameJson":"{}"},
                {"firebaseKey":"D","gameJson":"{}"}
            ]"#,
        );
        let mut src = LocalDirSource::open(dir.path(), 2, Some(3)).unwrap();
        assert_eq!(src.next_page().await.unwrap().unwrap().records.len(), 2);
        assert_eq!(src.next_page().await.unwrap().unwrap().records.len(), 1);
        assert!(src.next_page().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn map_shaped_dumps_take_key_from_map() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "2023-03-05-dump.json",
            r#"{"K1":{"gameJson":"{}"},"K2":{"gameJson":"{}"}}"#,
        );
        let mut src = LocalDirSource::open(dir.path(), 10, None).unwrap();
        let page = src.next_page().await.unwrap().unwrap();
        let mut keys: Vec<&str> = page.records.iter().map(|r| r.key.as_str()).collect();
        keys.sort_unstable();
        assert_eq!(keys, ["K1", "K2"]);
        // Date-only filename prefix becomes the fallback creation time.
        assert_eq!(
            page.records[0].created_at.to_rfc3339(),
            "2023-03-05T00:00:00+00:00"
        );
    }

    #[tokio::test]
    async fn unparseable_file_is_counted_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "2023-01-01-bad.json", "{not json");
        write_file(
            dir.path(),
            "2023-01-02-good.json",
            r#"[{"firebaseKey":"A","gameJson":"{}"}]"#,
        );
        let mut src = LocalDirSource::open(dir.path(), 10, None).unwrap();
        let page = src.next_page().await.unwrap().unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.malformed, 1);
    }

    #[tokio::test]
    async fn missing_directory_is_fatal() {
        let err = LocalDirSource::open(Path::new("/nonexistent/exports"), 10, None).unwrap_err();
        assert!(matches!(err, IngestError::SourceUnavailable(_)));
    }

    #[test]
    fn timestamp_prefix_shapes() {
        assert_eq!(
            timestamp_prefix("2023-05-01T12:30:00Z-export.json")
                .unwrap()
                .to_rfc3339(),
            "2023-05-01T12:30:00+00:00"
        );
        assert_eq!(
            timestamp_prefix("2023-05-01-export.json").unwrap().to_rfc3339(),
            "2023-05-01T00:00:00+00:00"
        );
        assert!(timestamp_prefix("export.json").is_none());
    }
}
