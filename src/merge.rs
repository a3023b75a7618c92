//! Deep merge of freshly fetched records into stored ones.
//!
//! The upstream feed is the authority for every field it reports. Merging a
//! source record into a destination record:
//!
//! - inserts keys missing from the destination
//! - leaves keys alone whose canonical string forms are equal
//! - recurses into nested mappings and lists
//! - overwrites mismatched scalars
//! - deletes destination keys the source no longer carries, except the
//!   identity key
//!
//! Values are compared by canonical string form rather than typed equality,
//! so `1` and `"1"` are the same value. The feed is not consistent about
//! numeric typing and this tolerance is intentional.
//!
//! Every structural change is logged and returned as a [`Change`].

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::info;

use crate::error::MergeError;
use crate::utils::truncate_for_log;

const LOG_VALUE_MAX: usize = 200;

/// How two lists of unequal content are reconciled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListPolicy {
    /// Equal-length lists merge element by element; resizing is an error.
    #[default]
    Positional,
    /// Items are matched by their `id` or `slug` field.
    Keyed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChangeKind {
    Added(Value),
    Changed { from: Value, to: Value },
    Deleted(Value),
    Extended(usize),
    Cleared(usize),
    Appended(Value),
    Removed(Value),
}

/// One structural change applied to the destination.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    /// Slash-separated location of the parent container.
    pub path: String,
    /// Field name or list index within the parent.
    pub key: String,
    pub kind: ChangeKind,
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = |v: &Value| truncate_for_log(&canonical(v), LOG_VALUE_MAX);
        match &self.kind {
            ChangeKind::Added(v) => write!(f, "{} added {}: {}", self.path, self.key, short(v)),
            ChangeKind::Changed { from, to } => write!(
                f,
                "{} changed {}: from {} to {}",
                self.path,
                self.key,
                short(from),
                short(to)
            ),
            ChangeKind::Deleted(v) => write!(f, "{} deleted {}: {}", self.path, self.key, short(v)),
            ChangeKind::Extended(n) => {
                write!(f, "{} extended {}: {} items", self.path, self.key, n)
            }
            ChangeKind::Cleared(n) => write!(f, "{} cleared {}: {} items", self.path, self.key, n),
            ChangeKind::Appended(v) => {
                write!(f, "{} appended {}: {}", self.path, self.key, short(v))
            }
            ChangeKind::Removed(v) => write!(f, "{} removed {}: {}", self.path, self.key, short(v)),
        }
    }
}

/// Canonical string form used for equality: raw text for strings, compact
/// JSON for everything else.
pub fn canonical(value: &Value) -> Cow<'_, str> {
    match value {
        Value::String(s) => Cow::Borrowed(s),
        other => Cow::Owned(other.to_string()),
    }
}

fn same(a: &Value, b: &Value) -> bool {
    canonical(a) == canonical(b)
}

/// The deep merge algorithm, parameterized by list policy and identity key.
#[derive(Debug, Clone)]
pub struct Reconciler {
    identity_key: &'static str,
    list_policy: ListPolicy,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(ListPolicy::Positional)
    }
}

impl Reconciler {
    pub fn new(list_policy: ListPolicy) -> Self {
        Self {
            identity_key: "id",
            list_policy,
        }
    }

    /// Mutate `dest` in place to match `source`.
    ///
    /// # Arguments
    ///
    /// * `path` - Location prefix used in change records and errors, usually
    ///   the record id
    /// * `source` - The freshly fetched record, authoritative for every field
    /// * `dest` - The stored record to update
    ///
    /// # Returns
    ///
    /// Every change applied, in the order it was made.
    ///
    /// # Errors
    ///
    /// [`MergeError`] for lists that cannot be reconciled under the configured
    /// policy. `dest` may be partially updated in that case, so callers that
    /// need atomicity merge into a copy.
    pub fn merge(
        &self,
        path: &str,
        source: &Map<String, Value>,
        dest: &mut Map<String, Value>,
    ) -> Result<Vec<Change>, MergeError> {
        let mut changes = Vec::new();
        self.merge_map(path, source, dest, &mut changes)?;
        Ok(changes)
    }

    fn record(changes: &mut Vec<Change>, path: &str, key: impl Into<String>, kind: ChangeKind) {
        let change = Change {
            path: path.to_string(),
            key: key.into(),
            kind,
        };
        info!("{change}");
        changes.push(change);
    }

    fn merge_map(
        &self,
        path: &str,
        source: &Map<String, Value>,
        dest: &mut Map<String, Value>,
        changes: &mut Vec<Change>,
    ) -> Result<(), MergeError> {
        for (key, value) in source {
            match dest.get_mut(key) {
                None => {
                    dest.insert(key.clone(), value.clone());
                    Self::record(changes, path, key, ChangeKind::Added(value.clone()));
                }
                Some(existing) => self.merge_value(path, key, value, existing, changes)?,
            }
        }

        let stale: BTreeSet<String> = dest
            .keys()
            .filter(|k| k.as_str() != self.identity_key && !source.contains_key(*k))
            .cloned()
            .collect();
        for key in stale {
            if let Some(old) = dest.remove(&key) {
                Self::record(changes, path, key, ChangeKind::Deleted(old));
            }
        }
        Ok(())
    }

    fn merge_value(
        &self,
        path: &str,
        key: &str,
        source: &Value,
        dest: &mut Value,
        changes: &mut Vec<Change>,
    ) -> Result<(), MergeError> {
        if same(source, dest) {
            return Ok(());
        }
        match (source, dest) {
            (Value::Object(src), Value::Object(dst)) => {
                self.merge_map(&format!("{path}/{key}"), src, dst, changes)
            }
            (Value::Array(src), Value::Array(dst)) => {
                self.merge_list(path, key, src, dst, changes)
            }
            (src, dst) => {
                let from = std::mem::replace(dst, src.clone());
                Self::record(
                    changes,
                    path,
                    key,
                    ChangeKind::Changed {
                        from,
                        to: src.clone(),
                    },
                );
                Ok(())
            }
        }
    }

    fn merge_list(
        &self,
        path: &str,
        key: &str,
        source: &[Value],
        dest: &mut Vec<Value>,
        changes: &mut Vec<Change>,
    ) -> Result<(), MergeError> {
        if dest.is_empty() {
            dest.extend(source.iter().cloned());
            Self::record(changes, path, key, ChangeKind::Extended(source.len()));
            return Ok(());
        }
        if source.is_empty() {
            let cleared = dest.len();
            dest.clear();
            Self::record(changes, path, key, ChangeKind::Cleared(cleared));
            return Ok(());
        }
        let list_path = format!("{path}/{key}");
        match self.list_policy {
            ListPolicy::Positional => {
                if source.len() != dest.len() {
                    return Err(MergeError::IrreconcilableList {
                        path: list_path,
                        source_len: source.len(),
                        dest_len: dest.len(),
                    });
                }
                for (i, (src, dst)) in source.iter().zip(dest.iter_mut()).enumerate() {
                    self.merge_value(&list_path, &i.to_string(), src, dst, changes)?;
                }
                Ok(())
            }
            ListPolicy::Keyed => self.merge_keyed_list(&list_path, source, dest, changes),
        }
    }

    /// Match items by `id` or `slug` (whichever the first source item has),
    /// recurse into matched pairs, append new items and drop vanished ones.
    fn merge_keyed_list(
        &self,
        path: &str,
        source: &[Value],
        dest: &mut Vec<Value>,
        changes: &mut Vec<Change>,
    ) -> Result<(), MergeError> {
        let unkeyed = |item: &Value| MergeError::UnkeyedList {
            path: path.to_string(),
            item: truncate_for_log(&item.to_string(), LOG_VALUE_MAX),
        };
        if let Some(bad) = source.iter().chain(dest.iter()).find(|v| !v.is_object()) {
            return Err(unkeyed(bad));
        }
        let key_name = match source.first().and_then(Value::as_object) {
            Some(first) if first.contains_key("id") => "id",
            Some(first) if first.contains_key("slug") => "slug",
            _ => return Err(unkeyed(&source[0])),
        };
        let key_of = |item: &Value| -> Result<String, MergeError> {
            item.get(key_name)
                .map(|k| canonical(k).into_owned())
                .ok_or_else(|| unkeyed(item))
        };

        let mut source_keys = BTreeMap::new();
        for item in source {
            source_keys.insert(key_of(item)?, item);
        }
        let mut dest_index = BTreeMap::new();
        for (i, item) in dest.iter().enumerate() {
            dest_index.insert(key_of(item)?, i);
        }

        for item in source {
            let k = key_of(item)?;
            match dest_index.get(&k) {
                Some(&i) => {
                    if let (Value::Object(src), Value::Object(dst)) = (item, &mut dest[i]) {
                        self.merge_map(&format!("{path}/{i}"), src, dst, changes)?;
                    }
                }
                None => {
                    dest.push(item.clone());
                    Self::record(changes, path, k, ChangeKind::Appended(item.clone()));
                }
            }
        }

        let mut i = 0;
        while i < dest.len() {
            let k = key_of(&dest[i])?;
            if source_keys.contains_key(&k) {
                i += 1;
            } else {
                let removed = dest.remove(i);
                Self::record(changes, path, k, ChangeKind::Removed(removed));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("object expected"),
        }
    }

    #[test]
    fn merge_is_idempotent() {
        let source = obj(json!({
            "title": "Új cím",
            "pubDate": 1704067200,
            "mainSuperTag": {"slug": "belfold", "name": "Belföld"},
            "tags": [{"id": 1, "v": "a"}]
        }));
        let mut dest = obj(json!({
            "id": 42,
            "title": "Régi cím",
            "mainSuperTag": {"slug": "kulfold"},
            "tags": [{"id": 1, "v": "x"}],
            "stale": true
        }));
        let r = Reconciler::default();

        let first = r.merge("42", &source, &mut dest).unwrap();
        assert!(!first.is_empty());
        let second = r.merge("42", &source, &mut dest).unwrap();
        assert!(second.is_empty());

        let mut expected = source.clone();
        expected.insert("id".to_string(), json!(42));
        assert_eq!(dest, expected);
    }

    #[test]
    fn extra_fields_are_purged_but_identity_survives() {
        let source = obj(json!({"title": "t"}));
        let mut dest = obj(json!({"id": 9, "title": "t", "x": 1}));
        let changes = Reconciler::default().merge("9", &source, &mut dest).unwrap();

        assert!(!dest.contains_key("x"));
        assert_eq!(dest.get("id"), Some(&json!(9)));
        assert_eq!(changes.len(), 1);
        assert!(matches!(changes[0].kind, ChangeKind::Deleted(_)));
        assert_eq!(changes[0].to_string(), "9 deleted x: 1");
    }

    #[test]
    fn equal_length_lists_merge_positionally() {
        let source = obj(json!({"items": [{"id": 1, "v": "a"}, {"id": 2, "v": "b"}]}));
        let mut dest = obj(json!({"items": [{"id": 1, "v": "x"}, {"id": 2, "v": "b"}]}));
        let changes = Reconciler::default().merge("r", &source, &mut dest).unwrap();

        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, "r/items/0");
        assert_eq!(changes[0].key, "v");
        assert_eq!(
            changes[0].kind,
            ChangeKind::Changed {
                from: json!("x"),
                to: json!("a")
            }
        );
        assert_eq!(dest["items"][0]["v"], "a");
        assert_eq!(dest["items"][1]["v"], "b");
    }

    #[test]
    fn resized_lists_are_irreconcilable() {
        let source = obj(json!({"items": [1, 2, 3]}));
        let mut dest = obj(json!({"items": [1, 2]}));
        let err = Reconciler::default()
            .merge("r", &source, &mut dest)
            .unwrap_err();
        match err {
            MergeError::IrreconcilableList {
                path,
                source_len,
                dest_len,
            } => {
                assert_eq!(path, "r/items");
                assert_eq!((source_len, dest_len), (3, 2));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_lists_extend_and_clear() {
        let r = Reconciler::default();

        let mut dest = obj(json!({"authors": []}));
        let changes = r
            .merge("r", &obj(json!({"authors": ["a", "b"]})), &mut dest)
            .unwrap();
        assert_eq!(changes[0].kind, ChangeKind::Extended(2));
        assert_eq!(dest["authors"], json!(["a", "b"]));

        let changes = r
            .merge("r", &obj(json!({"authors": []})), &mut dest)
            .unwrap();
        assert_eq!(changes[0].kind, ChangeKind::Cleared(2));
        assert_eq!(dest["authors"], json!([]));
    }

    #[test]
    fn string_comparison_tolerates_type_drift() {
        let source = obj(json!({"count": "1", "flag": "true"}));
        let mut dest = obj(json!({"count": 1, "flag": true}));
        let changes = Reconciler::default().merge("r", &source, &mut dest).unwrap();
        assert!(changes.is_empty());
        assert_eq!(dest["count"], json!(1));
    }

    #[test]
    fn nested_maps_recurse_with_paths() {
        let source = obj(json!({"tag": {"slug": "gazdasag", "name": "Gazdaság"}}));
        let mut dest = obj(json!({"tag": {"slug": "gazdasag"}}));
        let changes = Reconciler::default().merge("5", &source, &mut dest).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].to_string(), "5/tag added name: Gazdaság");
    }

    #[test]
    fn keyed_lists_match_by_id() {
        let source = obj(json!({"items": [
            {"id": 2, "v": "b2"},
            {"id": 3, "v": "c"}
        ]}));
        let mut dest = obj(json!({"items": [
            {"id": 1, "v": "a"},
            {"id": 2, "v": "b"}
        ]}));
        let changes = Reconciler::new(ListPolicy::Keyed)
            .merge("r", &source, &mut dest)
            .unwrap();

        assert_eq!(dest["items"], json!([{"id": 2, "v": "b2"}, {"id": 3, "v": "c"}]));
        assert!(changes.iter().any(|c| matches!(c.kind, ChangeKind::Appended(_))));
        assert!(changes.iter().any(|c| matches!(c.kind, ChangeKind::Removed(_))));
        assert!(changes.iter().any(|c| c.path == "r/items/1" && c.key == "v"));
    }

    #[test]
    fn keyed_lists_fall_back_to_slug_and_reject_scalars() {
        let r = Reconciler::new(ListPolicy::Keyed);
        let mut dest = obj(json!({"tags": [{"slug": "a", "n": 1}]}));
        r.merge("r", &obj(json!({"tags": [{"slug": "a", "n": 2}, {"slug": "b"}]})), &mut dest)
            .unwrap();
        assert_eq!(dest["tags"], json!([{"slug": "a", "n": 2}, {"slug": "b"}]));

        let mut dest = obj(json!({"tags": [1]}));
        let err = r.merge("r", &obj(json!({"tags": [2, 3]})), &mut dest).unwrap_err();
        assert!(matches!(err, MergeError::UnkeyedList { .. }));
    }

    #[test]
    fn list_policy_deserializes_lowercase() {
        let p: ListPolicy = serde_yaml::from_str("keyed").unwrap();
        assert_eq!(p, ListPolicy::Keyed);
    }
}
