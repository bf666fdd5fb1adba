//! Document writes: the keyspace commands and `ADD`
//!
//! Every write to the keyspace is followed by re-indexing the key in each
//! index that follows it. Indexing failures there are recorded on the index
//! and never fail the write itself.

use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value as JsonValue;

use super::{DocOverrides, Engine, SearchIndex};
use crate::args::ArgCursor;
use crate::query::expr::Expr;
use crate::runtime::Counters;
use crate::store::Document;
use crate::types::{DocumentKind, Value};
use crate::{Error, Result};

/// Result of `ADD`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AddOutcome {
    Added,
    Replaced,
    /// An `IF` condition did not hold
    NotAdded,
}

impl AddOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddOutcome::Added | AddOutcome::Replaced => "OK",
            AddOutcome::NotAdded => "NOADD",
        }
    }
}

/// Parsed `ADD <index> <key> <score> [options] FIELDS <field> <value> ...`
#[derive(Debug, Clone)]
pub struct AddRequest {
    pub key: String,
    pub score: f64,
    pub replace: bool,
    pub partial: bool,
    pub condition: Option<Expr>,
    pub no_save: bool,
    pub payload: Option<Bytes>,
    pub language: Option<String>,
    pub fields: Vec<(String, Bytes)>,
}

impl AddRequest {
    /// Parse the arguments following the index name.
    pub fn parse(args: &mut ArgCursor<'_>) -> Result<Self> {
        let key = args.next_string()?;
        let score = args.next_f64("score")?;
        if !(0.0..=1.0).contains(&score) {
            return Err(Error::bad_argument("Score must be between 0 and 1"));
        }
        let mut request = Self {
            key,
            score,
            replace: false,
            partial: false,
            condition: None,
            no_save: false,
            payload: None,
            language: None,
            fields: Vec::new(),
        };

        loop {
            if args.is_empty() {
                return Err(Error::bad_argument("No field list found"));
            }
            let keyword = args.next_str()?.to_ascii_uppercase();
            match keyword.as_str() {
                "FIELDS" => break,
                "REPLACE" => {
                    request.replace = true;
                    request.partial = args.eat("PARTIAL");
                }
                "PARTIAL" => request.partial = true,
                "NOSAVE" => request.no_save = true,
                "IF" => request.condition = Some(Expr::parse(args.next_str()?)?),
                "PAYLOAD" => request.payload = Some(args.next_bytes()?.clone()),
                "LANGUAGE" => {
                    let lang = args.next_str()?.to_ascii_lowercase();
                    crate::analysis::stemmer_for(&lang)
                        .ok_or_else(|| Error::bad_argument(format!("Invalid language: {lang}")))?;
                    request.language = Some(lang);
                }
                other => return Err(Error::bad_argument(format!("Unknown argument `{other}`"))),
            }
        }

        if request.condition.is_some() && !request.replace {
            return Err(Error::bad_argument("IF requires REPLACE"));
        }
        if args.remaining() % 2 != 0 || args.is_empty() {
            return Err(Error::bad_argument("Fields must be given as name/value pairs"));
        }
        while !args.is_empty() {
            let name = args.next_string()?;
            let value = args.next_bytes()?.clone();
            request.fields.push((name, value));
        }
        Ok(request)
    }
}

impl Engine {
    /// `HSET`: returns the number of new fields.
    pub fn hset(&self, key: &str, fields: Vec<(String, Bytes)>) -> Result<usize> {
        let added = self.store.hset(key, fields)?;
        self.reindex_key(key);
        Ok(added)
    }

    /// `JSON.SET`
    pub fn json_set(&self, key: &str, path: &str, value: JsonValue) -> Result<()> {
        self.store.json_set(key, path, value)?;
        self.reindex_key(key);
        Ok(())
    }

    /// `DEL`: returns the number of keys removed.
    pub fn del(&self, keys: &[String]) -> usize {
        keys.iter().filter(|key| self.delete_key(key)).count()
    }

    /// `HGETALL`
    pub fn hgetall(&self, key: &str) -> Option<Vec<(String, Bytes)>> {
        match self.store.get(key)?.as_ref() {
            Document::Hash(fields) => Some(fields.clone()),
            Document::Json(_) => None,
        }
    }

    /// Remove a key from the keyspace and from every index.
    pub(crate) fn delete_key(&self, key: &str) -> bool {
        let existed = self.store.remove(key).is_some();
        for entry in self.indexes.iter() {
            entry.value().remove_document(key);
        }
        existed
    }

    /// Bring every following index up to date with the stored document.
    fn reindex_key(&self, key: &str) {
        let Some(doc) = self.store.get(key) else {
            return;
        };
        let settings = self.settings();
        let indexes: Vec<Arc<SearchIndex>> = self.indexes.iter().map(|e| e.value().clone()).collect();
        for index in indexes {
            if index.follows(key, doc.kind()) {
                if index
                    .index_document(key, &doc, &DocOverrides::default(), &settings)
                    .is_ok()
                {
                    Counters::incr(&self.runtime.counters.documents_indexed);
                } else {
                    Counters::incr(&self.runtime.counters.indexing_failures);
                }
            } else {
                index.remove_document(key);
            }
        }
    }

    /// `ADD`
    pub fn add(&self, index_name: &str, args: &mut ArgCursor<'_>) -> Result<AddOutcome> {
        let index = self.index(index_name)?;
        let request = AddRequest::parse(args)?;
        if index.read().def.options.kind != DocumentKind::Hash {
            return Err(Error::bad_argument("ADD is only supported on HASH indexes"));
        }
        let key = request.key.as_str();

        let previous = self
            .store
            .get(key)
            .or_else(|| index.read().docs.lookup(key).map(|_| Arc::new(Document::Hash(Vec::new()))));
        if previous.is_some() && !request.replace {
            return Err(Error::bad_argument("Document already exists"));
        }

        if let (Some(condition), Some(prior)) = (&request.condition, &previous) {
            let holds = condition
                .eval(&|name: &str| prior.load(name))
                .map(|v| v.truthy())
                .unwrap_or(false);
            if !holds {
                tracing::debug!(index = %index_name, key, "ADD condition not met");
                return Ok(AddOutcome::NotAdded);
            }
        }

        let doc = match (&previous, request.partial) {
            (Some(prior), true) => {
                let mut fields = match prior.as_ref() {
                    Document::Hash(fields) => fields.clone(),
                    Document::Json(_) => Vec::new(),
                };
                for (name, value) in request.fields.iter().cloned() {
                    match fields.iter_mut().find(|(k, _)| *k == name) {
                        Some(slot) => slot.1 = value,
                        None => fields.push((name, value)),
                    }
                }
                Document::Hash(fields)
            }
            _ => Document::Hash(request.fields.clone()),
        };

        let overrides = DocOverrides {
            score: Some(request.score),
            payload: request.payload.clone(),
            language: request.language.clone(),
        };
        let settings = self.settings();
        if let Err(e) = index
            .validate_document(key, &doc, &overrides)
            .and_then(|_| index.index_document(key, &doc, &overrides, &settings))
        {
            Counters::incr(&self.runtime.counters.indexing_failures);
            return Err(e);
        }
        Counters::incr(&self.runtime.counters.documents_indexed);
        if !request.no_save {
            self.store.put(key, doc.clone());
            for entry in self.indexes.iter() {
                let other = entry.value();
                if other.name() == index_name {
                    continue;
                }
                if other.follows(key, DocumentKind::Hash) {
                    let _ = other.index_document(key, &doc, &DocOverrides::default(), &settings);
                } else {
                    other.remove_document(key);
                }
            }
        }

        Ok(if previous.is_some() {
            AddOutcome::Replaced
        } else {
            AddOutcome::Added
        })
    }

    /// `GET <index> <key>`: the stored fields of an indexed document.
    pub fn get(&self, index_name: &str, key: &str) -> Result<Option<Vec<(String, Value)>>> {
        let index = self.index(index_name)?;
        if index.read().docs.lookup(key).is_none() {
            return Ok(None);
        }
        Ok(self.store.get(key).map(|doc| doc.all_fields()))
    }

    /// `DEL <index> <key> [DD]`: returns whether the index held the key.
    pub fn del_document(&self, index_name: &str, key: &str, delete_document: bool) -> Result<bool> {
        let index = self.index(index_name)?;
        let removed = index.remove_document(key);
        if removed && delete_document {
            self.delete_key(key);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::to_args;
    use crate::engine::tests::{create, engine};

    fn add(engine: &Engine, tokens: &[&str]) -> Result<AddOutcome> {
        let args = to_args(tokens);
        engine.add("idx", &mut ArgCursor::new(&args))
    }

    #[test]
    fn test_parse_add_options() {
        let args = to_args(&[
            "doc:1", "0.5", "REPLACE", "PARTIAL", "IF", "@n > 1", "LANGUAGE", "german", "PAYLOAD", "p",
            "FIELDS", "t", "hello",
        ]);
        let request = AddRequest::parse(&mut ArgCursor::new(&args)).unwrap();
        assert!(request.replace && request.partial);
        assert!(request.condition.is_some());
        assert_eq!(request.language.as_deref(), Some("german"));
        assert_eq!(request.fields.len(), 1);

        let args = to_args(&["doc:1", "2", "FIELDS", "t", "x"]);
        assert!(AddRequest::parse(&mut ArgCursor::new(&args)).is_err());
        let args = to_args(&["doc:1", "1", "IF", "1", "FIELDS", "t", "x"]);
        assert!(AddRequest::parse(&mut ArgCursor::new(&args)).is_err());
    }

    #[test]
    fn test_add_then_replace() {
        let engine = engine();
        create(&engine, "idx", &["SCHEMA", "t", "TEXT", "n", "NUMERIC"]);
        assert_eq!(add(&engine, &["a", "1", "FIELDS", "t", "x"]).unwrap(), AddOutcome::Added);
        assert!(matches!(add(&engine, &["a", "1", "FIELDS", "t", "y"]), Err(Error::BadArgument(_))));
        assert_eq!(
            add(&engine, &["a", "1", "REPLACE", "PARTIAL", "FIELDS", "n", "4"]).unwrap(),
            AddOutcome::Replaced
        );
        let fields = engine.hgetall("a").unwrap();
        assert_eq!(fields.len(), 2);
    }

    #[test]
    fn test_add_if_condition() {
        let engine = engine();
        create(&engine, "idx", &["SCHEMA", "t", "TEXT", "n", "NUMERIC"]);
        add(&engine, &["a", "1", "FIELDS", "t", "x", "n", "1"]).unwrap();
        let outcome = add(&engine, &["a", "1", "REPLACE", "IF", "@n > 5", "FIELDS", "t", "y"]).unwrap();
        assert_eq!(outcome, AddOutcome::NotAdded);
        let outcome = add(&engine, &["a", "1", "REPLACE", "IF", "@n == 1", "FIELDS", "t", "y"]).unwrap();
        assert_eq!(outcome, AddOutcome::Replaced);
        // No prior document: the condition is not consulted.
        let outcome = add(&engine, &["b", "1", "REPLACE", "IF", "@n > 5", "FIELDS", "t", "z"]).unwrap();
        assert_eq!(outcome, AddOutcome::Added);
    }

    #[test]
    fn test_rejected_add_leaves_keyspace_untouched() {
        let engine = engine();
        create(&engine, "idx", &["SCHEMA", "t", "TEXT", "n", "NUMERIC"]);
        create(&engine, "mirror", &["SCHEMA", "t", "TEXT"]);
        add(&engine, &["a", "1", "FIELDS", "t", "first", "n", "1"]).unwrap();

        let err = add(&engine, &["b", "1", "FIELDS", "t", "second", "n", "abc"]).unwrap_err();
        assert!(matches!(err, Error::BadArgument(_)));
        assert!(engine.hgetall("b").is_none());

        let err = add(&engine, &["a", "1", "REPLACE", "FIELDS", "t", "third", "n", "abc"]).unwrap_err();
        assert!(matches!(err, Error::BadArgument(_)));
        let stored = engine.hgetall("a").unwrap();
        assert!(stored.iter().any(|(k, v)| k == "t" && &v[..] == b"first"));

        let none = to_args::<&str>(&[]);
        for index in ["idx", "mirror"] {
            assert_eq!(engine.search(index, "first", &mut ArgCursor::new(&none)).unwrap().total, 1);
            assert_eq!(engine.search(index, "second | third", &mut ArgCursor::new(&none)).unwrap().total, 0);
        }
        assert_eq!(engine.info("idx").unwrap().hash_indexing_failures, 2);
    }

    #[test]
    fn test_nosave_skips_keyspace() {
        let engine = engine();
        create(&engine, "idx", &["SCHEMA", "t", "TEXT"]);
        add(&engine, &["a", "1", "NOSAVE", "FIELDS", "t", "x"]).unwrap();
        assert!(engine.hgetall("a").is_none());
        assert_eq!(engine.index("idx").unwrap().read().docs.num_docs(), 1);
        assert_eq!(engine.get("idx", "a").unwrap(), None);
    }

    #[test]
    fn test_keyspace_writes_follow_prefixes() {
        let engine = engine();
        create(&engine, "idx", &["PREFIX", "1", "doc:", "SCHEMA", "t", "TEXT"]);
        engine.hset("doc:1", vec![("t".into(), "x".into())]).unwrap();
        engine.hset("misc:1", vec![("t".into(), "x".into())]).unwrap();
        let index = engine.index("idx").unwrap();
        assert_eq!(index.read().docs.num_docs(), 1);
        assert!(engine.get("idx", "doc:1").unwrap().is_some());

        assert_eq!(engine.del(&["doc:1".to_string(), "nope".to_string()]), 1);
        assert_eq!(index.read().docs.num_docs(), 0);
    }

    #[test]
    fn test_bad_value_is_recorded_not_fatal() {
        let engine = engine();
        create(&engine, "idx", &["SCHEMA", "n", "NUMERIC"]);
        engine.hset("a", vec![("n".into(), "abc".into())]).unwrap();
        let index = engine.index("idx").unwrap();
        assert_eq!(index.failure_count(), 1);
        assert_eq!(index.last_failure().unwrap().key, "a");
        assert_eq!(index.read().docs.num_docs(), 0);
    }

    #[test]
    fn test_del_document_with_dd() {
        let engine = engine();
        create(&engine, "idx", &["SCHEMA", "t", "TEXT"]);
        engine.hset("a", vec![("t".into(), "x".into())]).unwrap();
        engine.hset("b", vec![("t".into(), "x".into())]).unwrap();
        assert!(engine.del_document("idx", "a", false).unwrap());
        assert!(engine.hgetall("a").is_some());
        assert!(engine.del_document("idx", "b", true).unwrap());
        assert!(engine.hgetall("b").is_none());
        assert!(!engine.del_document("idx", "b", true).unwrap());
    }
}
