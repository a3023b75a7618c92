//! Durable record stores persisted as JSON documents.
//!
//! A store is an ordered mapping from a key to a record, loaded from and
//! written back to a single file. Two on-disk layouts exist:
//!
//! - [`IdList`]: a JSON array of objects, each carrying a unique numeric `id`.
//!   The id is hoisted into the mapping key on read and reinjected on write.
//! - [`Keyed`]: a JSON object whose keys are the mapping keys.
//!
//! Serialization is deterministic (sorted keys, tab indentation) so that
//! `check_for_changes` can skip writes whose content is identical to what is
//! already on disk. Files may be gzip-compressed.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::fs;
use tracing::{debug, info, instrument, warn};

use crate::error::StoreError;
use crate::models::{ArticleRecord, Projection};
use crate::utils::truncate_for_log;

/// Byte-level encoding of the store file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Plain,
    Gzip,
}

impl Codec {
    /// File extension appended to `<name>.json`.
    pub fn file_name(self, stem: &str) -> String {
        match self {
            Codec::Plain => format!("{stem}.json"),
            Codec::Gzip => format!("{stem}.json.gz"),
        }
    }

    fn decode(self, path: &Path, bytes: &[u8]) -> Result<String, StoreError> {
        match self {
            Codec::Plain => String::from_utf8(bytes.to_vec()).map_err(|e| StoreError::Corrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }),
            Codec::Gzip => {
                let mut text = String::new();
                GzDecoder::new(bytes)
                    .read_to_string(&mut text)
                    .map_err(|e| StoreError::Corrupt {
                        path: path.to_path_buf(),
                        reason: format!("gzip: {e}"),
                    })?;
                Ok(text)
            }
        }
    }

    fn encode(self, path: &Path, text: &str) -> Result<Vec<u8>, StoreError> {
        match self {
            Codec::Plain => Ok(text.as_bytes().to_vec()),
            Codec::Gzip => {
                let io_err = |source| StoreError::Io {
                    path: path.to_path_buf(),
                    source,
                };
                let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
                encoder.write_all(text.as_bytes()).map_err(io_err)?;
                encoder.finish().map_err(io_err)
            }
        }
    }
}

/// How a document maps to and from the in-memory record mapping.
pub trait Layout {
    type Key: Ord + Clone + fmt::Display;
    type Record;

    fn decode(
        path: &Path,
        document: Value,
    ) -> Result<BTreeMap<Self::Key, Self::Record>, StoreError>;

    fn encode(
        path: &Path,
        records: &BTreeMap<Self::Key, Self::Record>,
    ) -> Result<Value, StoreError>;
}

/// JSON array of objects keyed by their numeric `id` field.
#[derive(Debug)]
pub struct IdList;

impl IdList {
    fn parse_id(
        path: &Path,
        item: &Map<String, Value>,
        id: Option<Value>,
    ) -> Result<u64, StoreError> {
        let missing = || StoreError::MissingId {
            path: path.to_path_buf(),
            item: truncate_for_log(&Value::Object(item.clone()).to_string(), 300),
        };
        let non_numeric = |id: String| StoreError::NonNumericId {
            path: path.to_path_buf(),
            id,
        };
        match id {
            None | Some(Value::Null) => Err(missing()),
            Some(Value::Number(n)) => n.as_u64().ok_or_else(|| non_numeric(n.to_string())),
            Some(Value::String(s)) if s.is_empty() => Err(missing()),
            Some(Value::String(s)) => {
                if s.chars().all(|c| c.is_ascii_digit()) {
                    s.parse().map_err(|_| non_numeric(s))
                } else {
                    Err(non_numeric(s))
                }
            }
            Some(other) => Err(non_numeric(other.to_string())),
        }
    }
}

impl Layout for IdList {
    type Key = u64;
    type Record = ArticleRecord;

    fn decode(path: &Path, document: Value) -> Result<BTreeMap<u64, ArticleRecord>, StoreError> {
        let Value::Array(items) = document else {
            return Err(StoreError::Corrupt {
                path: path.to_path_buf(),
                reason: "JSON list expected".to_string(),
            });
        };
        let mut records = BTreeMap::new();
        for item in items {
            let Value::Object(mut item) = item else {
                return Err(StoreError::Corrupt {
                    path: path.to_path_buf(),
                    reason: format!(
                        "list item is not an object: {}",
                        truncate_for_log(&item.to_string(), 300)
                    ),
                });
            };
            let raw_id = item.remove("id");
            let id = Self::parse_id(path, &item, raw_id)?;
            if records.insert(id, item).is_some() {
                return Err(StoreError::DuplicateId {
                    path: path.to_path_buf(),
                    id,
                });
            }
        }
        Ok(records)
    }

    fn encode(_path: &Path, records: &BTreeMap<u64, ArticleRecord>) -> Result<Value, StoreError> {
        let items = records
            .iter()
            .map(|(id, record)| {
                let mut item = record.clone();
                item.insert("id".to_string(), Value::from(*id));
                Value::Object(item)
            })
            .collect();
        Ok(Value::Array(items))
    }
}

/// JSON object mapping string keys to typed records.
#[derive(Debug)]
pub struct Keyed<R>(PhantomData<R>);

impl<R> Layout for Keyed<R>
where
    R: Serialize + DeserializeOwned,
{
    type Key = String;
    type Record = R;

    fn decode(path: &Path, document: Value) -> Result<BTreeMap<String, R>, StoreError> {
        let Value::Object(entries) = document else {
            return Err(StoreError::Corrupt {
                path: path.to_path_buf(),
                reason: "JSON object expected".to_string(),
            });
        };
        entries
            .into_iter()
            .map(|(key, value)| {
                serde_json::from_value(value)
                    .map(|record| (key.clone(), record))
                    .map_err(|e| StoreError::Corrupt {
                        path: path.to_path_buf(),
                        reason: format!("record {key}: {e}"),
                    })
            })
            .collect()
    }

    fn encode(path: &Path, records: &BTreeMap<String, R>) -> Result<Value, StoreError> {
        let mut document = Map::new();
        for (key, record) in records {
            let value = serde_json::to_value(record).map_err(|source| StoreError::Serialize {
                path: path.to_path_buf(),
                source,
            })?;
            document.insert(key.clone(), value);
        }
        Ok(Value::Object(document))
    }
}

/// Raw articles, keyed by upstream article id.
pub type ArticleStore = DurableStore<IdList>;
/// Projection records, keyed by slug.
pub type ProjectionStore = DurableStore<Keyed<Projection>>;

/// Result of [`DurableStore::write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    Unchanged,
}

/// A key → record mapping persisted to one file.
#[derive(Debug)]
pub struct DurableStore<L: Layout> {
    path: PathBuf,
    codec: Codec,
    records: BTreeMap<L::Key, L::Record>,
}

impl<L: Layout> DurableStore<L> {
    pub fn new(path: impl Into<PathBuf>, codec: Codec) -> Self {
        Self {
            path: path.into(),
            codec,
            records: BTreeMap::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sibling path the previous content is moved to on a backed-up write.
    ///
    /// `articles.json.gz` becomes `articles.json.bak.gz`.
    pub fn backup_path(&self) -> PathBuf {
        match self.path.extension().and_then(|e| e.to_str()) {
            Some(ext) => self.path.with_extension(format!("bak.{ext}")),
            None => self.path.with_extension("bak"),
        }
    }

    /// Replace the in-memory mapping with the file's content.
    ///
    /// A missing file yields an empty store.
    #[instrument(level = "debug", skip_all, fields(path = %self.path.display()))]
    pub async fn read(&mut self) -> Result<(), StoreError> {
        let exists = fs::try_exists(&self.path)
            .await
            .map_err(|source| StoreError::Io {
                path: self.path.clone(),
                source,
            })?;
        if !exists {
            warn!("Store not available; starting empty");
            self.records.clear();
            return Ok(());
        }
        let text = self.read_text().await?;
        let document: Value = serde_json::from_str(&text).map_err(|e| StoreError::Corrupt {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        self.records = L::decode(&self.path, document)?;
        debug!(records = self.records.len(), "Store read");
        Ok(())
    }

    async fn read_text(&self) -> Result<String, StoreError> {
        let bytes = fs::read(&self.path).await.map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })?;
        self.codec.decode(&self.path, &bytes)
    }

    /// Deterministic serialization of the current mapping.
    pub fn render(&self) -> Result<String, StoreError> {
        let document = L::encode(&self.path, &self.records)?;
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"\t");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        document
            .serialize(&mut ser)
            .map_err(|source| StoreError::Serialize {
                path: self.path.clone(),
                source,
            })?;
        buf.push(b'\n');
        String::from_utf8(buf).map_err(|e| StoreError::Corrupt {
            path: self.path.clone(),
            reason: e.to_string(),
        })
    }

    /// Persist the mapping.
    ///
    /// # Arguments
    ///
    /// * `check_for_changes` - Compare with the document on disk first and skip
    ///   the write when it is identical
    /// * `create_backup` - Move the previous file to
    ///   [`backup_path`](Self::backup_path) before writing; a failed move is
    ///   logged and the write proceeds
    ///
    /// # Returns
    ///
    /// [`WriteOutcome::Unchanged`] when the write was skipped,
    /// [`WriteOutcome::Written`] otherwise, or the I/O or serialization error.
    #[instrument(level = "debug", skip_all, fields(path = %self.path.display()))]
    pub async fn write(
        &self,
        create_backup: bool,
        check_for_changes: bool,
    ) -> Result<WriteOutcome, StoreError> {
        let text = self.render()?;
        let exists = fs::try_exists(&self.path).await.unwrap_or(false);

        if exists && check_for_changes {
            match self.read_text().await {
                Ok(old) if old == text => {
                    debug!("No change");
                    return Ok(WriteOutcome::Unchanged);
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Unable to check for changes"),
            }
        }

        if exists && create_backup {
            let backup = self.backup_path();
            if let Err(e) = fs::rename(&self.path, &backup).await {
                warn!(backup = %backup.display(), error = %e, "Unable to replace backup");
            }
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let bytes = self.codec.encode(&self.path, &text)?;
        fs::write(&self.path, bytes)
            .await
            .map_err(|source| StoreError::Io {
                path: self.path.clone(),
                source,
            })?;
        info!(records = self.records.len(), "Store written");
        Ok(WriteOutcome::Written)
    }

    pub fn get(&self, key: &L::Key) -> Option<&L::Record> {
        self.records.get(key)
    }

    pub fn get_mut(&mut self, key: &L::Key) -> Option<&mut L::Record> {
        self.records.get_mut(key)
    }

    #[cfg(test)]
    pub fn contains_key(&self, key: &L::Key) -> bool {
        self.records.contains_key(key)
    }

    pub fn insert(&mut self, key: L::Key, record: L::Record) -> Option<L::Record> {
        self.records.insert(key, record)
    }

    pub fn entry(
        &mut self,
        key: L::Key,
    ) -> std::collections::btree_map::Entry<'_, L::Key, L::Record> {
        self.records.entry(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&L::Key, &L::Record)> {
        self.records.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&L::Key, &mut L::Record)> {
        self.records.iter_mut()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn article(title: &str) -> ArticleRecord {
        match json!({ "title": title, "active": true }) {
            Value::Object(m) => m,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn no_op_write_touches_disk_once() {
        let dir = tempdir().expect("tempdir");
        let mut store = ArticleStore::new(dir.path().join("articles.json.gz"), Codec::Gzip);
        store.insert(7, article("first"));

        let first = store.write(true, true).await.expect("first write");
        let second = store.write(true, true).await.expect("second write");

        assert_eq!(first, WriteOutcome::Written);
        assert_eq!(second, WriteOutcome::Unchanged);
        assert!(!store.backup_path().exists());
    }

    #[tokio::test]
    async fn backup_keeps_previous_content() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("projections.json");
        let mut store = ProjectionStore::new(&path, Codec::Plain);
        store.insert(
            "old-slug".to_string(),
            Projection {
                article_title: Some("Old".to_string()),
                ..Projection::default()
            },
        );
        store.write(true, true).await.expect("first write");
        let before = std::fs::read_to_string(&path).expect("read first");

        store.get_mut(&"old-slug".to_string()).unwrap().article_title = Some("New".to_string());
        let outcome = store.write(true, true).await.expect("second write");
        assert_eq!(outcome, WriteOutcome::Written);

        let backup = dir.path().join("projections.bak.json");
        assert_eq!(store.backup_path(), backup);
        assert_eq!(std::fs::read_to_string(&backup).expect("read backup"), before);
        assert!(std::fs::read_to_string(&path).expect("read new").contains("\"New\""));
    }

    #[tokio::test]
    async fn id_list_hoists_and_reinjects_ids() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("articles.json");
        std::fs::write(
            &path,
            r#"[{"id": 20, "title": "b"}, {"id": "3", "title": "a"}]"#,
        )
        .unwrap();

        let mut store = ArticleStore::new(&path, Codec::Plain);
        store.read().await.expect("read");
        assert_eq!(store.len(), 2);
        assert!(store.get(&3).unwrap().get("id").is_none());

        let text = store.render().expect("render");
        let doc: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(doc[0]["id"], 3);
        assert_eq!(doc[1]["id"], 20);
        assert!(text.contains("\n\t{"));
    }

    #[tokio::test]
    async fn id_list_rejects_malformed_ids() {
        let dir = tempdir().expect("tempdir");
        let cases = [
            (r#"[{"title": "x"}]"#, "missing"),
            (r#"[{"id": "abc"}]"#, "non-numeric"),
            (r#"[{"id": 1}, {"id": "1"}]"#, "duplicate"),
            (r#"{"1": {}}"#, "corrupt"),
            ("not json", "corrupt"),
        ];
        for (i, (content, expected)) in cases.iter().enumerate() {
            let path = dir.path().join(format!("case{i}.json"));
            std::fs::write(&path, content).unwrap();
            let mut store = ArticleStore::new(&path, Codec::Plain);
            let err = store.read().await.expect_err(expected);
            let matched = match (expected, &err) {
                (&"missing", StoreError::MissingId { .. }) => true,
                (&"non-numeric", StoreError::NonNumericId { .. }) => true,
                (&"duplicate", StoreError::DuplicateId { id: 1, .. }) => true,
                (&"corrupt", StoreError::Corrupt { .. }) => true,
                _ => false,
            };
            assert!(matched, "case {i}: {err}");
        }
    }

    #[tokio::test]
    async fn gzip_store_reads_back_and_rejects_garbage() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("projections.json.gz");
        let mut store = ProjectionStore::new(&path, Codec::Gzip);
        store.insert(
            "cikk".to_string(),
            Projection {
                article_title: Some("Árvíztűrő tükörfúrógép".to_string()),
                ..Projection::default()
            },
        );
        store.write(false, false).await.expect("write");

        let mut reread = ProjectionStore::new(&path, Codec::Gzip);
        reread.read().await.expect("read");
        assert_eq!(
            reread.get(&"cikk".to_string()).unwrap().article_title.as_deref(),
            Some("Árvíztűrő tükörfúrógép")
        );

        std::fs::write(&path, b"plain text").unwrap();
        let err = reread.read().await.expect_err("garbage");
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn missing_file_reads_as_empty() {
        let dir = tempdir().expect("tempdir");
        let mut store = ProjectionStore::new(dir.path().join("nope.json"), Codec::Plain);
        store.insert("x".to_string(), Projection::default());
        store.read().await.expect("read");
        assert!(store.is_empty());
    }

    #[test]
    fn render_sorts_keys() {
        let mut store = ProjectionStore::new("p.json", Codec::Plain);
        store.insert(
            "b".to_string(),
            Projection {
                reddit_url: Some(String::new()),
                article_date: Some("2024-01-01T00:00Z".to_string()),
                ..Projection::default()
            },
        );
        store.insert("a".to_string(), Projection::default());
        let text = store.render().unwrap();
        let a = text.find("\"a\"").unwrap();
        let b = text.find("\"b\"").unwrap();
        assert!(a < b);
        let date = text.find("article_date").unwrap();
        let url = text.find("reddit_url").unwrap();
        assert!(date < url);
    }
}
