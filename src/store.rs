//! In-memory keyspace holding hash and JSON documents
//!
//! Indexes do not own document bodies; they read them from here when a key
//! is written and when results are loaded.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use serde_json::Value as JsonValue;

use crate::types::{DocumentKind, Value};
use crate::{Error, Result};

/// A stored document
#[derive(Debug, Clone, PartialEq)]
pub enum Document {
    /// Field/value pairs in insertion order
    Hash(Vec<(String, Bytes)>),
    Json(JsonValue),
}

/// A raw value addressed by an attribute path
#[derive(Debug, Clone, Copy)]
pub enum FieldSource<'a> {
    Hash(&'a Bytes),
    Json(&'a JsonValue),
}

impl<'a> FieldSource<'a> {
    /// Text view; JSON arrays are flattened into their string elements.
    pub fn strings(&self) -> Vec<String> {
        match self {
            FieldSource::Hash(bytes) => vec![String::from_utf8_lossy(bytes).into_owned()],
            FieldSource::Json(value) => json_strings(value),
        }
    }

    /// Numeric view; JSON arrays are flattened. Unparseable input is an error.
    pub fn numbers(&self) -> Result<Vec<f64>> {
        match self {
            FieldSource::Hash(bytes) => {
                let s = std::str::from_utf8(bytes)
                    .map_err(|_| Error::bad_argument("numeric value is not valid UTF-8"))?;
                let n = crate::types::parse_f64(s.trim())
                    .ok_or_else(|| Error::bad_argument(format!("Invalid numeric value: `{s}`")))?;
                Ok(vec![n])
            }
            FieldSource::Json(value) => match value {
                JsonValue::Number(n) => Ok(vec![n.as_f64().unwrap_or(f64::NAN)]),
                JsonValue::Array(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        out.extend(FieldSource::Json(item).numbers()?);
                    }
                    Ok(out)
                }
                JsonValue::Null => Ok(Vec::new()),
                other => Err(Error::bad_argument(format!("Invalid numeric value: {other}"))),
            },
        }
    }
}

fn json_strings(value: &JsonValue) -> Vec<String> {
    match value {
        JsonValue::String(s) => vec![s.clone()],
        JsonValue::Bool(b) => vec![b.to_string()],
        JsonValue::Number(n) => vec![n.to_string()],
        JsonValue::Array(items) => items.iter().flat_map(json_strings).collect(),
        JsonValue::Null | JsonValue::Object(_) => Vec::new(),
    }
}

impl Document {
    pub fn kind(&self) -> DocumentKind {
        match self {
            Document::Hash(_) => DocumentKind::Hash,
            Document::Json(_) => DocumentKind::Json,
        }
    }

    /// Build a hash document from string pairs.
    pub fn hash<K: Into<String>, V: AsRef<[u8]>>(pairs: impl IntoIterator<Item = (K, V)>) -> Self {
        Document::Hash(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), Bytes::copy_from_slice(v.as_ref())))
                .collect(),
        )
    }

    /// Raw values at an attribute path.
    pub fn lookup(&self, path: &str) -> Vec<FieldSource<'_>> {
        match self {
            Document::Hash(fields) => fields
                .iter()
                .filter(|(k, _)| k == path)
                .map(|(_, v)| FieldSource::Hash(v))
                .collect(),
            Document::Json(root) => json_path(root, path)
                .unwrap_or_default()
                .into_iter()
                .map(FieldSource::Json)
                .collect(),
        }
    }

    pub fn hash_field(&self, name: &str) -> Option<&Bytes> {
        match self {
            Document::Hash(fields) => fields.iter().find(|(k, _)| k == name).map(|(_, v)| v),
            Document::Json(_) => None,
        }
    }

    /// Load a value for the result pipeline. Missing paths yield `None`.
    pub fn load(&self, path: &str) -> Option<Value> {
        match self {
            Document::Hash(fields) => fields
                .iter()
                .find(|(k, _)| k == path)
                .map(|(_, v)| Value::String(String::from_utf8_lossy(v).into_owned())),
            Document::Json(root) => {
                let nodes = json_path(root, path).ok()?;
                match nodes.as_slice() {
                    [] => None,
                    [single] => Some(json_to_value(single)),
                    many => Some(Value::String(
                        JsonValue::Array(many.iter().map(|v| (*v).clone()).collect()).to_string(),
                    )),
                }
            }
        }
    }

    /// Every field, as returned by a search without RETURN.
    pub fn all_fields(&self) -> Vec<(String, Value)> {
        match self {
            Document::Hash(fields) => fields
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(String::from_utf8_lossy(v).into_owned())))
                .collect(),
            Document::Json(root) => vec![("$".to_string(), Value::String(root.to_string()))],
        }
    }

    /// Merge hash fields; returns how many were new.
    fn merge_hash(&mut self, updates: Vec<(String, Bytes)>) -> usize {
        let Document::Hash(fields) = self else {
            return 0;
        };
        let mut added = 0;
        for (key, value) in updates {
            match fields.iter_mut().find(|(k, _)| *k == key) {
                Some(slot) => slot.1 = value,
                None => {
                    fields.push((key, value));
                    added += 1;
                }
            }
        }
        added
    }
}

/// Scalar JSON values load as plain values, containers as JSON text.
pub fn json_to_value(value: &JsonValue) -> Value {
    match value {
        JsonValue::Null => Value::Null,
        JsonValue::Bool(b) => Value::String(b.to_string()),
        JsonValue::Number(n) => n.as_f64().map(Value::Number).unwrap_or(Value::Null),
        JsonValue::String(s) => Value::String(s.clone()),
        other => Value::String(other.to_string()),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum PathStep {
    Key(String),
    Index(i64),
    Wildcard,
}

fn parse_path(path: &str) -> Result<Vec<PathStep>> {
    let bad = || Error::syntax(format!("Invalid JSONPath `{path}`"));
    if path == "." {
        return Ok(Vec::new());
    }
    let rest = path.strip_prefix('$').unwrap_or(path);
    let chars: Vec<char> = rest.chars().collect();
    let mut steps = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '.' => {
                i += 1;
                let start = i;
                while i < chars.len() && chars[i] != '.' && chars[i] != '[' {
                    i += 1;
                }
                let key: String = chars[start..i].iter().collect();
                if key.is_empty() {
                    return Err(bad());
                }
                if key == "*" {
                    steps.push(PathStep::Wildcard);
                } else {
                    steps.push(PathStep::Key(key));
                }
            }
            '[' => {
                let close = chars[i..].iter().position(|&c| c == ']').ok_or_else(bad)? + i;
                let inner: String = chars[i + 1..close].iter().collect();
                let inner = inner.trim();
                if inner == "*" {
                    steps.push(PathStep::Wildcard);
                } else if let Some(quoted) = inner
                    .strip_prefix('\'')
                    .and_then(|s| s.strip_suffix('\''))
                    .or_else(|| inner.strip_prefix('"').and_then(|s| s.strip_suffix('"')))
                {
                    steps.push(PathStep::Key(quoted.to_string()));
                } else {
                    steps.push(PathStep::Index(inner.parse().map_err(|_| bad())?));
                }
                i = close + 1;
            }
            _ => {
                // Legacy paths without the leading `$.`
                if steps.is_empty() && i == 0 {
                    let start = i;
                    while i < chars.len() && chars[i] != '.' && chars[i] != '[' {
                        i += 1;
                    }
                    steps.push(PathStep::Key(chars[start..i].iter().collect()));
                } else {
                    return Err(bad());
                }
            }
        }
    }
    Ok(steps)
}

/// Evaluate a JSONPath subset: `$`, `.key`, `['key']`, `[N]` (negative
/// counts from the end) and `[*]` / `.*`.
pub fn json_path<'a>(root: &'a JsonValue, path: &str) -> Result<Vec<&'a JsonValue>> {
    let steps = parse_path(path)?;
    let mut current = vec![root];
    for step in &steps {
        let mut next = Vec::new();
        for node in current {
            match (step, node) {
                (PathStep::Key(key), JsonValue::Object(map)) => {
                    if let Some(v) = map.get(key) {
                        next.push(v);
                    }
                }
                (PathStep::Index(idx), JsonValue::Array(items)) => {
                    let len = items.len() as i64;
                    let i = if *idx < 0 { len + idx } else { *idx };
                    if (0..len).contains(&i) {
                        next.push(&items[i as usize]);
                    }
                }
                (PathStep::Wildcard, JsonValue::Array(items)) => next.extend(items.iter()),
                (PathStep::Wildcard, JsonValue::Object(map)) => next.extend(map.values()),
                _ => {}
            }
        }
        current = next;
    }
    Ok(current)
}

fn json_path_set(root: &mut JsonValue, path: &str, value: JsonValue) -> Result<()> {
    let steps = parse_path(path)?;
    let Some((last, parents)) = steps.split_last() else {
        *root = value;
        return Ok(());
    };
    let mut node = root;
    for step in parents {
        node = match (step, node) {
            (PathStep::Key(key), JsonValue::Object(map)) => map
                .get_mut(key)
                .ok_or_else(|| Error::bad_argument(format!("JSONPath `{path}` does not exist")))?,
            (PathStep::Index(idx), JsonValue::Array(items)) => {
                let len = items.len() as i64;
                let i = if *idx < 0 { len + idx } else { *idx };
                items
                    .get_mut(i as usize)
                    .ok_or_else(|| Error::bad_argument("JSONPath index out of range"))?
            }
            _ => return Err(Error::bad_argument(format!("JSONPath `{path}` does not exist"))),
        };
    }
    match (last, node) {
        (PathStep::Key(key), JsonValue::Object(map)) => {
            map.insert(key.clone(), value);
            Ok(())
        }
        (PathStep::Index(idx), JsonValue::Array(items)) => {
            let len = items.len() as i64;
            let i = if *idx < 0 { len + idx } else { *idx };
            let slot = items
                .get_mut(i as usize)
                .ok_or_else(|| Error::bad_argument("JSONPath index out of range"))?;
            *slot = value;
            Ok(())
        }
        _ => Err(Error::bad_argument(format!("JSONPath `{path}` cannot be set"))),
    }
}

/// Concurrent key → document map
#[derive(Debug, Default)]
pub struct DocumentStore {
    docs: DashMap<String, Arc<Document>>,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Arc<Document>> {
        self.docs.get(key).map(|d| d.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.docs.contains_key(key)
    }

    pub fn put(&self, key: &str, doc: Document) {
        self.docs.insert(key.to_string(), Arc::new(doc));
    }

    pub fn remove(&self, key: &str) -> Option<Arc<Document>> {
        self.docs.remove(key).map(|(_, d)| d)
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Merge fields into a hash, creating it when absent. Returns the number
    /// of fields that did not exist before.
    pub fn hset(&self, key: &str, fields: Vec<(String, Bytes)>) -> Result<usize> {
        let mut entry = self
            .docs
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Document::Hash(Vec::new())));
        if entry.kind() != DocumentKind::Hash {
            return Err(Error::bad_argument(
                "WRONGTYPE Operation against a key holding the wrong kind of value",
            ));
        }
        Ok(Arc::make_mut(entry.value_mut()).merge_hash(fields))
    }

    /// Set a JSON value at `path`; `$` replaces the whole document.
    pub fn json_set(&self, key: &str, path: &str, value: JsonValue) -> Result<()> {
        let steps = parse_path(path)?;
        if steps.is_empty() {
            self.put(key, Document::Json(value));
            return Ok(());
        }
        let mut entry = self
            .docs
            .get_mut(key)
            .ok_or_else(|| Error::bad_argument("new objects must be created at the root"))?;
        match Arc::make_mut(entry.value_mut()) {
            Document::Json(root) => json_path_set(root, path, value),
            Document::Hash(_) => Err(Error::bad_argument(
                "WRONGTYPE Operation against a key holding the wrong kind of value",
            )),
        }
    }

    /// Keys matching any of the prefixes, sorted.
    pub fn keys_with_prefixes(&self, prefixes: &[String]) -> Vec<String> {
        let mut keys: Vec<String> = self
            .docs
            .iter()
            .filter(|e| prefixes.iter().any(|p| e.key().starts_with(p.as_str())))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_path_subset() {
        let doc = json!({"a": {"b": [1, 2, 3]}, "tags": ["x", "y"], "name": "n"});
        assert_eq!(json_path(&doc, "$.a.b[1]").unwrap(), vec![&json!(2)]);
        assert_eq!(json_path(&doc, "$.a.b[-1]").unwrap(), vec![&json!(3)]);
        assert_eq!(json_path(&doc, "$.tags[*]").unwrap().len(), 2);
        assert_eq!(json_path(&doc, "$['name']").unwrap(), vec![&json!("n")]);
        assert!(json_path(&doc, "$.missing").unwrap().is_empty());
        assert!(json_path(&doc, "$[").is_err());
    }

    #[test]
    fn test_hset_merges() {
        let store = DocumentStore::new();
        assert_eq!(store.hset("k", vec![("a".into(), Bytes::from("1"))]).unwrap(), 1);
        assert_eq!(
            store
                .hset("k", vec![("a".into(), Bytes::from("2")), ("b".into(), Bytes::from("3"))])
                .unwrap(),
            1
        );
        let doc = store.get("k").unwrap();
        assert_eq!(doc.load("a"), Some(Value::str("2")));
    }

    #[test]
    fn test_json_set_nested() {
        let store = DocumentStore::new();
        store.json_set("j", "$", json!({"a": {"b": 1}})).unwrap();
        store.json_set("j", "$.a.c", json!("x")).unwrap();
        let doc = store.get("j").unwrap();
        assert_eq!(doc.load("$.a.c"), Some(Value::str("x")));
        assert_eq!(doc.load("$.a.b"), Some(Value::Number(1.0)));
        assert!(store.json_set("missing", "$.a", json!(1)).is_err());
    }

    #[test]
    fn test_field_source_numbers() {
        let doc = Document::Json(json!({"n": [1, 2.5]}));
        let values = doc.lookup("$.n");
        assert_eq!(values[0].numbers().unwrap(), vec![1.0, 2.5]);
        let hash = Document::hash([("n", "abc")]);
        assert!(hash.lookup("n")[0].numbers().is_err());
    }
}
