//! File-backed store for saved request/response pairs.
//!
//! Each message is written to `{id}_{request|response}_{n}.xml` where `n` is
//! the smallest free sequence number for that id and kind. Slots are claimed
//! with an exclusive create so concurrent writers never share a number.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write as _};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, TimeZone as _};
use regex::Regex;
use scriptgate_core::{Element, XmlError};
use serde::Serialize;

/// Attribute carrying the save time (epoch milliseconds) in every file.
pub const TIMESTAMP_ATTRIBUTE: &str = "scriptgate-timestamp";

const DISPLAY_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

/// Errors raised by the [`TransactionStore`].
#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    #[error("transaction identifier is not set")]
    MissingId,

    #[error("invalid transaction identifier {0:?}")]
    InvalidId(String),

    #[error("transaction folder does not exist: {}", .0.display())]
    MissingFolder(PathBuf),

    #[error("no free sequence number for transaction {id} (limit {limit})")]
    Exhausted { id: String, limit: u32 },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid transaction pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("unable to read {}: {source}", path.display())]
    Xml {
        path: PathBuf,
        #[source]
        source: XmlError,
    },
}

/// Which side of an exchange a file holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    Request,
    Response,
}

impl TransactionKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
        }
    }
}

/// One saved message with its stamp removed.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub saved_at: Option<DateTime<Local>>,
    pub root: Element,
}

impl StoredMessage {
    fn read(path: &Path) -> Result<Self, TransactionError> {
        let text = std::fs::read_to_string(path).map_err(|source| TransactionError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut root = Element::parse(&text).map_err(|source| TransactionError::Xml {
            path: path.to_path_buf(),
            source,
        })?;
        let saved_at = root
            .remove_attribute(TIMESTAMP_ATTRIBUTE)
            .and_then(|stamp| parse_stamp(&stamp));
        Ok(Self { saved_at, root })
    }

    fn display_timestamp(&self) -> String {
        self.saved_at
            .map(|t| t.format(DISPLAY_TIMESTAMP_FORMAT).to_string())
            .unwrap_or_default()
    }

    fn to_element(&self, tag: &str) -> Element {
        let mut el = Element::new(tag);
        el.set_attribute("timestamp", self.display_timestamp());
        el.push(self.root.clone());
        el
    }
}

fn parse_stamp(stamp: &str) -> Option<DateTime<Local>> {
    let millis = match stamp.trim().parse::<i64>() {
        Ok(millis) => millis,
        Err(err) => {
            tracing::error!(stamp, error = %err, "invalid transaction timestamp");
            return None;
        }
    };
    Local.timestamp_millis_opt(millis).single()
}

/// A request file and the response saved under the same sequence number.
#[derive(Debug, Clone)]
pub struct TransactionRecord {
    pub id: String,
    pub sequence: u32,
    pub request: StoredMessage,
    pub response: Option<StoredMessage>,
}

/// Flat view of a [`TransactionRecord`] for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionSummary {
    pub id: String,
    pub sequence: u32,
    pub request_saved_at: String,
    pub response_saved_at: Option<String>,
}

impl TransactionRecord {
    /// `<transaction id="n" name="id"><request timestamp="..">..</request>..</transaction>`
    #[must_use]
    pub fn to_element(&self) -> Element {
        let mut el = Element::new("transaction");
        el.set_attribute("id", self.sequence.to_string());
        el.set_attribute("name", self.id.clone());
        el.push(self.request.to_element("request"));
        if let Some(response) = &self.response {
            el.push(response.to_element("response"));
        }
        el
    }

    #[must_use]
    pub fn summary(&self) -> TransactionSummary {
        TransactionSummary {
            id: self.id.clone(),
            sequence: self.sequence,
            request_saved_at: self.request.display_timestamp(),
            response_saved_at: self.response.as_ref().map(StoredMessage::display_timestamp),
        }
    }
}

// ---------------------------------------------------------------------------
// TransactionStore
// ---------------------------------------------------------------------------

/// Saved transactions in a single folder.
#[derive(Debug, Clone)]
pub struct TransactionStore {
    folder: PathBuf,
    max_files: u32,
}

impl TransactionStore {
    #[must_use]
    pub fn new(folder: impl Into<PathBuf>, max_files: u32) -> Self {
        Self {
            folder: folder.into(),
            max_files,
        }
    }

    #[must_use]
    pub fn folder(&self) -> &Path {
        &self.folder
    }

    #[must_use]
    pub fn max_files(&self) -> u32 {
        self.max_files
    }

    fn file_path(&self, id: &str, kind: TransactionKind, sequence: u32) -> PathBuf {
        self.folder
            .join(format!("{id}_{}_{sequence}.xml", kind.as_str()))
    }

    /// Rejects identifiers that would escape the folder once joined into a
    /// file name.
    fn check_id(id: &str) -> Result<(), TransactionError> {
        if id.is_empty() {
            return Err(TransactionError::MissingId);
        }
        if id.contains(['/', '\\', '\0']) || id.contains("..") {
            return Err(TransactionError::InvalidId(id.to_string()));
        }
        Ok(())
    }

    fn check_folder(&self) -> Result<(), TransactionError> {
        if self.folder.is_dir() {
            Ok(())
        } else {
            Err(TransactionError::MissingFolder(self.folder.clone()))
        }
    }

    /// Saves `root` under the next free sequence number and returns it.
    ///
    /// The file carries a timestamp attribute and, when `root` does not
    /// declare its own namespace, a declaration for it. Both are removed from
    /// `root` again before returning.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError::Exhausted`] when every sequence number up to
    /// the limit is taken, or an I/O error if the file cannot be written.
    pub fn write(
        &self,
        id: &str,
        kind: TransactionKind,
        root: &mut Element,
    ) -> Result<u32, TransactionError> {
        Self::check_id(id)?;
        self.check_folder()?;

        let (sequence, path, mut file) = self.claim(id, kind)?;
        tracing::debug!(file = %path.display(), kind = kind.as_str(), "saving transaction message");

        let declaration = match root.prefix() {
            Some(prefix) => format!("xmlns:{prefix}"),
            None => "xmlns".to_string(),
        };
        let declared_here = match root.namespace() {
            Some(uri) if root.attribute(&declaration).is_none() => {
                let uri = uri.to_string();
                root.set_attribute(declaration.clone(), uri);
                true
            }
            _ => false,
        };
        root.set_attribute(
            TIMESTAMP_ATTRIBUTE,
            chrono::Utc::now().timestamp_millis().to_string(),
        );

        let written = file.write_all(root.to_pretty_xml().as_bytes());

        root.remove_attribute(TIMESTAMP_ATTRIBUTE);
        if declared_here {
            root.remove_attribute(&declaration);
        }

        drop(file);
        release_on_failure(path, written)?;
        Ok(sequence)
    }

    fn claim(
        &self,
        id: &str,
        kind: TransactionKind,
    ) -> Result<(u32, PathBuf, std::fs::File), TransactionError> {
        for sequence in 1..=self.max_files {
            let path = self.file_path(id, kind, sequence);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((sequence, path, file)),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
                Err(source) => return Err(TransactionError::Io { path, source }),
            }
        }
        Err(TransactionError::Exhausted {
            id: id.to_string(),
            limit: self.max_files,
        })
    }

    /// Reads every saved exchange whose id matches `pattern` (`*` and `?`
    /// wildcards), ordered by id then sequence number.
    ///
    /// # Errors
    ///
    /// Fails if the folder cannot be listed. Files that cannot be parsed are
    /// skipped; an unreadable response leaves the record without one.
    pub fn list(&self, pattern: &str) -> Result<Vec<TransactionRecord>, TransactionError> {
        Self::check_id(pattern)?;
        self.check_folder()?;
        let matcher = request_file_regex(pattern)?;

        let entries = std::fs::read_dir(&self.folder).map_err(|source| TransactionError::Io {
            path: self.folder.clone(),
            source,
        })?;

        let mut found: Vec<(String, u32, PathBuf)> = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| TransactionError::Io {
                path: self.folder.clone(),
                source,
            })?;
            let name = entry.file_name();
            let Some(caps) = name.to_str().and_then(|n| matcher.captures(n)) else {
                continue;
            };
            let Ok(sequence) = caps[2].parse::<u32>() else {
                continue;
            };
            found.push((caps[1].to_string(), sequence, entry.path()));
        }
        found.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

        let records = found
            .into_iter()
            .filter_map(|(id, sequence, request_path)| {
                let request = readable(&request_path)?;
                let response_path = self.file_path(&id, TransactionKind::Response, sequence);
                let response = if response_path.exists() {
                    readable(&response_path)
                } else {
                    None
                };
                Some(TransactionRecord {
                    id,
                    sequence,
                    request,
                    response,
                })
            })
            .collect();
        Ok(records)
    }

    /// Deletes the files of `id` from sequence 1 up to the first missing
    /// request file and returns how many sequence numbers were removed.
    ///
    /// # Errors
    ///
    /// Fails if an existing file cannot be removed.
    pub fn delete(&self, id: &str) -> Result<u32, TransactionError> {
        Self::check_id(id)?;
        self.check_folder()?;

        let mut removed = 0;
        for sequence in 1..=self.max_files {
            let request = self.file_path(id, TransactionKind::Request, sequence);
            if !request.exists() {
                break;
            }
            remove_if_present(&request)?;
            remove_if_present(&self.file_path(id, TransactionKind::Response, sequence))?;
            removed += 1;
        }
        tracing::debug!(id, removed, "deleted saved transactions");
        Ok(removed)
    }
}

/// Removes a claimed file whose contents could not be written, so that no
/// empty or truncated file is left under a sequence number.
fn release_on_failure(path: PathBuf, written: std::io::Result<()>) -> Result<(), TransactionError> {
    let Err(source) = written else {
        return Ok(());
    };
    if let Err(err) = remove_if_present(&path) {
        tracing::warn!(error = %err, "unable to remove partially written transaction file");
    }
    Err(TransactionError::Io { path, source })
}

/// Reads a saved message, skipping files still being written or damaged.
fn readable(path: &Path) -> Option<StoredMessage> {
    match StoredMessage::read(path) {
        Ok(message) => Some(message),
        Err(err) => {
            tracing::warn!(error = %err, "skipping unreadable transaction file");
            None
        }
    }
}

fn remove_if_present(path: &Path) -> Result<(), TransactionError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(source) => Err(TransactionError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// `^(<pattern>)_request_(\d+)\.xml$` with `*` and `?` as wildcards.
fn request_file_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut expr = String::with_capacity(pattern.len() + 32);
    expr.push_str("^(");
    for ch in pattern.chars() {
        match ch {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    expr.push_str(r")_request_(\d+)\.xml$");
    Regex::new(&expr)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;

    fn store(dir: &tempfile::TempDir) -> TransactionStore {
        TransactionStore::new(dir.path(), 500)
    }

    fn message(name: &str) -> Element {
        Element::parse(&format!("<{name} xmlns=\"urn:t\"><v>1</v></{name}>")).unwrap()
    }

    #[test]
    fn sequences_start_at_one_without_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let mut root = message("Order");

        let seqs: Vec<u32> = (0..3)
            .map(|_| store.write("T1", TransactionKind::Request, &mut root).unwrap())
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert!(dir.path().join("T1_request_3.xml").exists());
    }

    #[test]
    fn stamp_is_on_disk_but_not_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let mut root = Element::in_namespace("m:Order", "urn:t");
        root.remove_attribute("xmlns:m");

        store.write("T1", TransactionKind::Request, &mut root).unwrap();

        assert_eq!(root.attribute(TIMESTAMP_ATTRIBUTE), None);
        assert_eq!(root.attribute("xmlns:m"), None);
        let text = std::fs::read_to_string(dir.path().join("T1_request_1.xml")).unwrap();
        assert!(text.contains(TIMESTAMP_ATTRIBUTE));
        assert!(text.contains("xmlns:m=\"urn:t\""));
    }

    #[test]
    fn concurrent_writers_never_share_a_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store(&dir));

        let seqs: Vec<u32> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..16)
                .map(|_| {
                    let store = Arc::clone(&store);
                    s.spawn(move || {
                        let mut root = message("Order");
                        store.write("T1", TransactionKind::Response, &mut root).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let unique: HashSet<_> = seqs.iter().copied().collect();
        assert_eq!(unique.len(), 16);
        assert_eq!(unique, (1..=16).collect::<HashSet<u32>>());
    }

    #[test]
    fn exhausted_limit_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = TransactionStore::new(dir.path(), 2);
        let mut root = message("Order");
        store.write("T1", TransactionKind::Request, &mut root).unwrap();
        store.write("T1", TransactionKind::Request, &mut root).unwrap();

        let err = store.write("T1", TransactionKind::Request, &mut root).unwrap_err();
        assert!(matches!(err, TransactionError::Exhausted { limit: 2, .. }));
    }

    #[test]
    fn list_pairs_and_sorts_by_id_then_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        for id in ["B", "A", "A"] {
            store.write(id, TransactionKind::Request, &mut message("Req")).unwrap();
        }
        store.write("A", TransactionKind::Response, &mut message("Resp")).unwrap();
        for seq in 3..=10 {
            std::fs::write(
                dir.path().join(format!("A_request_{seq}.xml")),
                "<Req/>",
            )
            .unwrap();
        }

        let records = store.list("*").unwrap();
        let keys: Vec<(&str, u32)> = records.iter().map(|r| (r.id.as_str(), r.sequence)).collect();
        let mut expected: Vec<(&str, u32)> = (1..=10).map(|n| ("A", n)).collect();
        expected.push(("B", 1));
        assert_eq!(keys, expected);

        assert!(records[0].response.is_some());
        assert!(records[1].response.is_none());
        assert!(records[0].request.saved_at.is_some());
        assert_eq!(records[0].request.root.attribute(TIMESTAMP_ATTRIBUTE), None);
        assert!(records[2].request.saved_at.is_none());
    }

    #[test]
    fn list_pattern_wildcards() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        for id in ["order.1", "order.2", "orderX1", "invoice"] {
            store.write(id, TransactionKind::Request, &mut message("Req")).unwrap();
        }

        let ids = |pattern: &str| -> Vec<String> {
            store.list(pattern).unwrap().into_iter().map(|r| r.id).collect()
        };
        assert_eq!(ids("order.?"), vec!["order.1", "order.2"]);
        assert_eq!(ids("order?1"), vec!["order.1", "orderX1"]);
        assert_eq!(ids("inv*"), vec!["invoice"]);
        assert!(ids("missing").is_empty());
    }

    #[test]
    fn record_element_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.write("T1", TransactionKind::Request, &mut message("Req")).unwrap();
        store.write("T1", TransactionKind::Response, &mut message("Resp")).unwrap();

        let records = store.list("T1").unwrap();
        let el = records[0].to_element();
        assert_eq!(el.name(), "transaction");
        assert_eq!(el.attribute("id"), Some("1"));
        assert_eq!(el.attribute("name"), Some("T1"));
        let request = el.child("request").unwrap();
        assert!(!request.attribute("timestamp").unwrap().is_empty());
        assert_eq!(request.first_element().unwrap().local_name(), "Req");
        assert_eq!(
            el.find_path("response/Resp/v").map(Element::text).as_deref(),
            Some("1")
        );

        let summary = records[0].summary();
        assert_eq!(summary.sequence, 1);
        assert!(summary.response_saved_at.is_some());
    }

    #[test]
    fn delete_removes_pairs_and_frees_sequence_one() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.write("T1", TransactionKind::Request, &mut message("Req")).unwrap();
        store.write("T1", TransactionKind::Response, &mut message("Resp")).unwrap();

        assert_eq!(store.delete("T1").unwrap(), 1);
        assert!(!dir.path().join("T1_request_1.xml").exists());
        assert!(!dir.path().join("T1_response_1.xml").exists());

        let seq = store.write("T1", TransactionKind::Request, &mut message("Req")).unwrap();
        assert_eq!(seq, 1);
    }

    #[test]
    fn delete_stops_at_first_gap() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        for _ in 0..3 {
            store.write("T1", TransactionKind::Request, &mut message("Req")).unwrap();
        }
        std::fs::remove_file(dir.path().join("T1_request_2.xml")).unwrap();

        assert_eq!(store.delete("T1").unwrap(), 1);
        assert!(dir.path().join("T1_request_3.xml").exists());
    }

    #[test]
    fn missing_folder_and_id_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = TransactionStore::new(dir.path().join("absent"), 500);
        assert!(matches!(store.list("*"), Err(TransactionError::MissingFolder(_))));
        assert!(matches!(store.delete(""), Err(TransactionError::MissingId)));
    }

    #[test]
    fn unreadable_files_are_skipped_by_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.write("A", TransactionKind::Request, &mut message("Order")).unwrap();
        store.write("A", TransactionKind::Response, &mut message("Ack")).unwrap();
        std::fs::write(dir.path().join("B_request_1.xml"), "").unwrap();
        store.write("C", TransactionKind::Request, &mut message("Order")).unwrap();
        std::fs::write(dir.path().join("C_response_1.xml"), "<Ack").unwrap();

        let records = store.list("*").unwrap();
        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["A", "C"]);
        assert!(records[0].response.is_some());
        assert!(records[1].response.is_none());
    }

    #[test]
    fn failed_write_releases_the_claimed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("T1_request_1.xml");
        std::fs::write(&path, "").unwrap();

        let err = release_on_failure(path.clone(), Err(std::io::Error::other("disk full")))
            .unwrap_err();
        assert!(matches!(err, TransactionError::Io { .. }));
        assert!(!path.exists());

        let store = store(&dir);
        let sequence = store
            .write("T1", TransactionKind::Request, &mut message("Order"))
            .unwrap();
        assert_eq!(sequence, 1);
    }

    #[test]
    fn identifiers_cannot_leave_the_folder() {
        let dir = tempfile::tempdir().unwrap();
        let inner = dir.path().join("txn");
        std::fs::create_dir(&inner).unwrap();
        let store = TransactionStore::new(&inner, 500);

        for id in ["../x", "a/b", "a\\b", "..", "a\0b"] {
            assert!(
                matches!(
                    store.write(id, TransactionKind::Request, &mut message("Order")),
                    Err(TransactionError::InvalidId(_))
                ),
                "{id:?} was accepted"
            );
            assert!(matches!(store.delete(id), Err(TransactionError::InvalidId(_))));
        }
        assert!(matches!(store.list("../*"), Err(TransactionError::InvalidId(_))));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
