//! Persistence of analysis outcomes.
//!
//! A [`HistoryStore`] turns an [`AnalysisOutcome`] into a [`HistoryRecord`]
//! with a store-assigned id. The default store is a JSON-lines file; records
//! are appended and the whole file is read back for listing. Lines that do not
//! parse (a torn append, a hand edit) are skipped with a warning when reading;
//! [`JsonlHistoryStore::verify`] reports them instead.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::analysis::AnalysisOutcome;

pub const UNKNOWN_PROJECT: &str = "Unknown project";
pub const NO_DESCRIPTION: &str = "No description";

/// Characters of content used as a description when the document has no summary.
const DESCRIPTION_CHARS: usize = 100;
/// Characters of the result kept in CSV exports.
const CSV_SUMMARY_CHARS: usize = 200;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("history I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to serialize history record: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("corrupt history record at line {line}: {source}")]
    Corrupt {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// One persisted analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: u64,
    pub project_path: String,
    pub project_name: String,
    pub project_description: String,
    pub result: String,
    pub analyzed_at: DateTime<Local>,
}

impl HistoryRecord {
    /// Derive a record from an outcome. Display fields are computed here, once.
    pub fn from_outcome(id: u64, outcome: &AnalysisOutcome) -> Self {
        let (project_name, project_description) = derive_display(outcome);
        Self {
            id,
            project_path: outcome.project_path.display().to_string(),
            project_name,
            project_description,
            result: outcome.content.clone(),
            analyzed_at: outcome.analyzed_at,
        }
    }
}

fn derive_display(outcome: &AnalysisOutcome) -> (String, String) {
    if outcome.content.is_empty() {
        return (UNKNOWN_PROJECT.to_string(), NO_DESCRIPTION.to_string());
    }

    let doc_field = |key: &str| {
        outcome
            .document
            .as_ref()
            .and_then(|d| d.get(key))
            .and_then(Value::as_str)
            .map(str::to_string)
    };

    let name = doc_field("project_name").unwrap_or_else(|| {
        outcome
            .project_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| outcome.project_path.display().to_string())
    });
    let description =
        doc_field("summary").unwrap_or_else(|| ellipsize(&outcome.content, DESCRIPTION_CHARS));

    (name, description)
}

/// First `limit` characters of `text`, with `...` appended when cut.
fn ellipsize(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Storage for analysis history.
pub trait HistoryStore: Send + Sync {
    /// Persist `outcome`, returning the stored record with its new id.
    fn save(&self, outcome: &AnalysisOutcome) -> Result<HistoryRecord, HistoryError>;

    /// All records, newest first.
    fn list(&self) -> Result<Vec<HistoryRecord>, HistoryError>;

    /// The newest record for `project_path`, if any.
    fn latest_for(&self, project_path: &Path) -> Result<Option<HistoryRecord>, HistoryError> {
        let wanted = project_path.display().to_string();
        Ok(self.list()?.into_iter().find(|r| r.project_path == wanted))
    }
}

fn sort_newest_first(records: &mut [HistoryRecord]) {
    records.sort_by(|a, b| {
        b.analyzed_at
            .cmp(&a.analyzed_at)
            .then_with(|| b.id.cmp(&a.id))
    });
}

/// JSON-lines file store.
///
/// The id of the last record is cached after the first read, so saves made
/// through one handle do not re-read the file. Another handle writing the
/// same file concurrently is not supported.
pub struct JsonlHistoryStore {
    path: PathBuf,
    last_id: Mutex<Option<u64>>,
}

impl JsonlHistoryStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            last_id: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: io::Error) -> HistoryError {
        HistoryError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Parse every line in file order, keeping per-line failures.
    /// A missing file holds no records.
    fn read_lines(&self) -> Result<Vec<Result<HistoryRecord, HistoryError>>, HistoryError> {
        let file = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_error(e)),
        };

        let mut parsed = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| self.io_error(e))?;
            if line.trim().is_empty() {
                continue;
            }
            parsed.push(
                serde_json::from_str(&line).map_err(|source| HistoryError::Corrupt {
                    line: idx + 1,
                    source,
                }),
            );
        }
        Ok(parsed)
    }

    /// Every readable record in file order. Corrupt lines are logged and skipped.
    fn read_all(&self) -> Result<Vec<HistoryRecord>, HistoryError> {
        let mut records = Vec::new();
        for entry in self.read_lines()? {
            match entry {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %self.path.display(), "skipping {}", e),
            }
        }
        Ok(records)
    }

    /// Check every line, failing on the first one that does not parse.
    pub fn verify(&self) -> Result<usize, HistoryError> {
        let _guard = self.last_id.lock().unwrap_or_else(|e| e.into_inner());
        let mut count = 0;
        for entry in self.read_lines()? {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    /// Open for appending, positioned after a line terminator.
    ///
    /// Returns the file and whether a newline must precede the next record
    /// because the last write was cut short.
    fn open_for_append(&self) -> Result<(fs::File, bool), HistoryError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.io_error(e))?;

        let len = file.metadata().map_err(|e| self.io_error(e))?.len();
        let mut needs_newline = false;
        if len > 0 {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::End(-1))
                .and_then(|_| file.read_exact(&mut last))
                .map_err(|e| self.io_error(e))?;
            needs_newline = last[0] != b'\n';
        }
        Ok((file, needs_newline))
    }
}

impl HistoryStore for JsonlHistoryStore {
    fn save(&self, outcome: &AnalysisOutcome) -> Result<HistoryRecord, HistoryError> {
        let mut last_id = self.last_id.lock().unwrap_or_else(|e| e.into_inner());

        let previous = match *last_id {
            Some(id) => id,
            None => self.read_all()?.iter().map(|r| r.id).max().unwrap_or(0),
        };
        let record = HistoryRecord::from_outcome(previous + 1, outcome);

        let (mut file, needs_newline) = self.open_for_append()?;
        let mut line = String::new();
        if needs_newline {
            warn!(path = %self.path.display(), "history file ends mid-record, starting a new line");
            line.push('\n');
        }
        line.push_str(&serde_json::to_string(&record)?);
        line.push('\n');
        file.write_all(line.as_bytes())
            .map_err(|e| self.io_error(e))?;

        *last_id = Some(record.id);
        info!(id = record.id, project = %record.project_path, "saved analysis record");
        Ok(record)
    }

    fn list(&self) -> Result<Vec<HistoryRecord>, HistoryError> {
        let _guard = self.last_id.lock().unwrap_or_else(|e| e.into_inner());
        let mut records = self.read_all()?;
        sort_newest_first(&mut records);
        debug!(count = records.len(), "listed history");
        Ok(records)
    }
}

/// In-memory store, used for `--no-save` runs and tests.
#[derive(Default)]
pub struct MemoryHistoryStore {
    records: Mutex<Vec<HistoryRecord>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HistoryStore for MemoryHistoryStore {
    fn save(&self, outcome: &AnalysisOutcome) -> Result<HistoryRecord, HistoryError> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let id = records.len() as u64 + 1;
        let record = HistoryRecord::from_outcome(id, outcome);
        records.push(record.clone());
        Ok(record)
    }

    fn list(&self) -> Result<Vec<HistoryRecord>, HistoryError> {
        let mut records = self
            .records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        sort_newest_first(&mut records);
        Ok(records)
    }
}

fn escape_csv(value: &str) -> String {
    value
        .replace('"', "\"\"")
        .replace('\n', " ")
        .replace('\r', "")
}

/// Write `records` as CSV.
pub fn export_csv<W: Write>(records: &[HistoryRecord], mut out: W) -> io::Result<()> {
    writeln!(
        out,
        "ID,Project path,Project name,Description,Analyzed at,Result summary"
    )?;
    for r in records {
        writeln!(
            out,
            "{},\"{}\",\"{}\",\"{}\",\"{}\",\"{}\"",
            r.id,
            escape_csv(&r.project_path),
            escape_csv(&r.project_name),
            escape_csv(&r.project_description),
            r.analyzed_at.format(TIMESTAMP_FORMAT),
            escape_csv(&ellipsize(&r.result, CSV_SUMMARY_CHARS)),
        )?;
    }
    out.flush()
}

/// Write `records` as a pretty JSON array.
///
/// A result that parses as JSON is embedded as a value, otherwise as a string.
pub fn export_json<W: Write>(records: &[HistoryRecord], mut out: W) -> io::Result<()> {
    let items: Vec<Value> = records
        .iter()
        .map(|r| {
            let result = serde_json::from_str::<Value>(&r.result)
                .unwrap_or_else(|_| Value::String(r.result.clone()));
            json!({
                "id": r.id,
                "projectPath": r.project_path,
                "projectName": r.project_name,
                "projectDescription": r.project_description,
                "analyzedAt": r.analyzed_at.format(TIMESTAMP_FORMAT).to_string(),
                "result": result,
            })
        })
        .collect();

    serde_json::to_writer_pretty(&mut out, &items)?;
    writeln!(out)?;
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::ContentSource;
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    fn outcome(path: &str, content: &str, at: DateTime<Local>) -> AnalysisOutcome {
        AnalysisOutcome {
            project_path: PathBuf::from(path),
            content: content.to_string(),
            document: serde_json::from_str::<Value>(content)
                .ok()
                .filter(Value::is_object),
            source: ContentSource::Final,
            analyzed_at: at,
        }
    }

    fn at(secs: i64) -> DateTime<Local> {
        Local.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(secs)
    }

    #[test]
    fn test_derive_from_document() {
        let o = outcome(
            "/w/demo",
            r#"{"project_name":"Demo","summary":"A demo"}"#,
            at(0),
        );
        let r = HistoryRecord::from_outcome(1, &o);
        assert_eq!(r.project_name, "Demo");
        assert_eq!(r.project_description, "A demo");
    }

    #[test]
    fn test_derive_from_plain_text() {
        let long = "y".repeat(150);
        let r = HistoryRecord::from_outcome(1, &outcome("/w/tool", &long, at(0)));
        assert_eq!(r.project_name, "tool");
        assert_eq!(r.project_description, format!("{}...", "y".repeat(100)));

        let short = HistoryRecord::from_outcome(1, &outcome("/w/tool", "short", at(0)));
        assert_eq!(short.project_description, "short");
    }

    #[test]
    fn test_derive_from_empty_content() {
        let r = HistoryRecord::from_outcome(1, &outcome("/w/x", "", at(0)));
        assert_eq!(r.project_name, UNKNOWN_PROJECT);
        assert_eq!(r.project_description, NO_DESCRIPTION);
    }

    #[test]
    fn test_jsonl_ids_and_order() {
        let temp = TempDir::new().unwrap();
        let store = JsonlHistoryStore::new(temp.path().join("deep").join("history.jsonl"));

        let first = store.save(&outcome("/w/a", "one", at(0))).unwrap();
        let second = store.save(&outcome("/w/b", "two", at(10))).unwrap();
        let third = store.save(&outcome("/w/c", "three", at(10))).unwrap();
        assert_eq!((first.id, second.id, third.id), (1, 2, 3));

        let ids: Vec<u64> = store.list().unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![3, 2, 1]);

        // A fresh handle on the same file continues numbering.
        let reopened = JsonlHistoryStore::new(store.path());
        let fourth = reopened.save(&outcome("/w/d", "four", at(20))).unwrap();
        assert_eq!(fourth.id, 4);
    }

    #[test]
    fn test_jsonl_missing_file_is_empty() {
        let temp = TempDir::new().unwrap();
        let store = JsonlHistoryStore::new(temp.path().join("none.jsonl"));
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_jsonl_corrupt_line_is_skipped() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("history.jsonl");
        let store = JsonlHistoryStore::new(&path);
        store.save(&outcome("/w/a", "one", at(0))).unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "not json").unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].result, "one");

        assert!(matches!(
            store.verify(),
            Err(HistoryError::Corrupt { line: 2, .. })
        ));
    }

    #[test]
    fn test_jsonl_torn_tail_recovers() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("history.jsonl");
        JsonlHistoryStore::new(&path)
            .save(&outcome("/w/a", "one", at(0)))
            .unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        write!(file, "{{\"id\":2,\"project_pa").unwrap();
        drop(file);

        let store = JsonlHistoryStore::new(&path);
        let saved = store.save(&outcome("/w/b", "two", at(5))).unwrap();
        assert_eq!(saved.id, 2);

        let results: Vec<String> = store.list().unwrap().into_iter().map(|r| r.result).collect();
        assert_eq!(results, vec!["two", "one"]);

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 3);
        assert!(text.lines().nth(2).unwrap().starts_with("{\"id\":2,"));
    }

    #[test]
    fn test_jsonl_caches_last_id() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("history.jsonl");
        let store = JsonlHistoryStore::new(&path);
        store.save(&outcome("/w/a", "one", at(0))).unwrap();

        // Emptied behind the store; the cached id still decides.
        fs::write(&path, "").unwrap();
        let next = store.save(&outcome("/w/b", "two", at(5))).unwrap();
        assert_eq!(next.id, 2);
    }

    #[test]
    fn test_latest_for() {
        let store = MemoryHistoryStore::new();
        store.save(&outcome("/w/a", "old", at(0))).unwrap();
        store.save(&outcome("/w/b", "other", at(5))).unwrap();
        store.save(&outcome("/w/a", "new", at(10))).unwrap();

        let latest = store.latest_for(Path::new("/w/a")).unwrap().unwrap();
        assert_eq!(latest.result, "new");
        assert!(store.latest_for(Path::new("/w/z")).unwrap().is_none());
    }

    #[test]
    fn test_export_csv_escaping() {
        let store = MemoryHistoryStore::new();
        store
            .save(&outcome("/w/q", "say \"hi\"\r\nnext line", at(0)))
            .unwrap();
        let records = store.list().unwrap();

        let mut out = Vec::new();
        export_csv(&records, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("ID,Project path,Project name,Description,Analyzed at,Result summary")
        );
        let row = lines.next().unwrap();
        assert!(row.starts_with("1,\"/w/q\",\"q\","));
        assert!(row.ends_with(",\"say \"\"hi\"\" next line\""));
        assert!(row.contains(&at(0).format("%Y-%m-%d %H:%M:%S").to_string()));
        assert!(lines.next().is_none());
    }

    #[test]
    fn test_export_csv_truncates_result() {
        let store = MemoryHistoryStore::new();
        store
            .save(&outcome("/w/long", &"z".repeat(250), at(0)))
            .unwrap();
        let mut out = Vec::new();
        export_csv(&store.list().unwrap(), &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains(&format!("\"{}...\"", "z".repeat(200))));
    }

    #[test]
    fn test_export_json_embeds_documents() {
        let store = MemoryHistoryStore::new();
        store
            .save(&outcome("/w/a", r#"{"project_name":"A"}"#, at(0)))
            .unwrap();
        store.save(&outcome("/w/b", "plain answer", at(5))).unwrap();

        let mut out = Vec::new();
        export_json(&store.list().unwrap(), &mut out).unwrap();
        let parsed: Value = serde_json::from_slice(&out).unwrap();
        let items = parsed.as_array().unwrap();

        assert_eq!(items[0]["projectPath"], "/w/b");
        assert_eq!(items[0]["result"], "plain answer");
        assert_eq!(items[1]["result"]["project_name"], "A");
        assert_eq!(items[1]["projectName"], "A");
        assert_eq!(items[1]["id"], 1);
    }
}
