//! Field loading stage

use crate::pipeline::{BoxedProcessor, ExecContext, ResultProcessor, Row};
use crate::query::request::{LoadSpec, ReturnField};
use crate::Result;

/// Copies document fields into each row.
///
/// Fields the document does not have are left out of the row rather than
/// set to null.
pub struct Loader {
    upstream: BoxedProcessor,
    spec: LoadSpec,
}

impl Loader {
    pub fn new(upstream: BoxedProcessor, spec: LoadSpec) -> Self {
        Self { upstream, spec }
    }

    pub fn fields(upstream: BoxedProcessor, fields: Vec<ReturnField>) -> Self {
        Self::new(upstream, LoadSpec::Fields(fields))
    }

    fn load(&self, ctx: &ExecContext, row: &mut Row) {
        match &self.spec {
            LoadSpec::All => {
                if let Some(doc) = ctx.document(row) {
                    for (name, value) in doc.all_fields() {
                        if row.get(&name).is_none() {
                            row.values.push((name, value));
                        }
                    }
                }
            }
            LoadSpec::Fields(fields) => {
                for field in fields {
                    if row.get(&field.alias).is_some() {
                        continue;
                    }
                    if let Some(value) = ctx.value(row, &field.path) {
                        row.set(&field.alias, value);
                    }
                }
            }
        }
    }
}

impl ResultProcessor for Loader {
    fn next(&mut self, ctx: &mut ExecContext) -> Result<Option<Row>> {
        let Some(mut row) = self.upstream.next(ctx)? else {
            return Ok(None);
        };
        if row.meta.is_some() {
            self.load(ctx, &mut row);
        }
        Ok(Some(row))
    }

    fn name(&self) -> &'static str {
        "Loader"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::DocMeta;
    use crate::pipeline::tests::{context, source};
    use crate::store::Document;
    use crate::types::Value;
    use std::sync::Arc;

    fn doc_row(key: &str, id: u64) -> Row {
        let mut meta = DocMeta::new(key, 1.0);
        meta.id = id;
        Row::for_doc(Arc::new(meta))
    }

    #[test]
    fn test_load_all_and_selected() {
        let ctx = context();
        ctx.store.put("doc:1", Document::hash([("title", "hello"), ("body", "world")]));
        let mut all = Loader::new(source(vec![doc_row("doc:1", 1)]), LoadSpec::All);
        let mut ctx = ctx;
        let row = all.next(&mut ctx).unwrap().unwrap();
        assert_eq!(row.get("title"), Some(&Value::str("hello")));
        assert_eq!(row.get("body"), Some(&Value::str("world")));

        let fields = vec![
            ReturnField {
                path: "title".into(),
                alias: "t".into(),
            },
            ReturnField {
                path: "missing".into(),
                alias: "missing".into(),
            },
        ];
        let mut some = Loader::fields(source(vec![doc_row("doc:1", 1)]), fields);
        let row = some.next(&mut ctx).unwrap().unwrap();
        assert_eq!(row.values, vec![("t".to_string(), Value::str("hello"))]);
    }

    #[test]
    fn test_deleted_document_loads_nothing() {
        let mut ctx = context();
        let mut loader = Loader::new(source(vec![doc_row("gone", 1)]), LoadSpec::All);
        let row = loader.next(&mut ctx).unwrap().unwrap();
        assert!(row.values.is_empty());
    }
}
