//! INFO and the other read-only index introspection commands

use serde::Serialize;

use super::{Engine, IndexingError};
use crate::cursor::CursorStats;
use crate::gc::GcSnapshot;
use crate::index::FieldIndex;
use crate::schema::{FieldSpec, IndexOptions};
use crate::vector::VectorInfo;
use crate::{Error, Result};

/// Statistics of one attribute
#[derive(Debug, Clone, Serialize)]
pub struct AttributeInfo {
    #[serde(flatten)]
    pub spec: FieldSpec,
    pub num_entries: usize,
    pub memory: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector: Option<VectorInfo>,
}

/// Reply of `INFO <index>`
#[derive(Debug, Clone, Serialize)]
pub struct IndexInfo {
    pub index_name: String,
    pub index_options: IndexOptions,
    pub attributes: Vec<AttributeInfo>,
    pub num_docs: u64,
    pub max_doc_id: u64,
    pub num_terms: usize,
    pub num_records: usize,
    pub memory: usize,
    pub hash_indexing_failures: u64,
    pub last_indexing_error: Option<IndexingError>,
    pub indexing: bool,
    pub percent_indexed: f64,
    pub gc_stats: GcSnapshot,
    pub cursor_stats: CursorStats,
}

impl Engine {
    pub fn info(&self, name: &str) -> Result<IndexInfo> {
        let index = self.index(name)?;
        let state = index.read();
        let attributes = state
            .def
            .schema
            .fields
            .iter()
            .zip(&state.fields)
            .map(|(spec, field)| AttributeInfo {
                spec: spec.clone(),
                num_entries: field.num_entries(),
                memory: field.memory_usage(),
                vector: field.as_vector().map(|v| v.info()),
            })
            .collect();

        Ok(IndexInfo {
            index_name: index.name().to_string(),
            index_options: state.def.options.clone(),
            attributes,
            num_docs: state.docs.num_docs(),
            max_doc_id: state.docs.max_doc_id(),
            num_terms: state.text.num_terms(),
            num_records: state.text.num_records(),
            memory: state.memory_usage(),
            hash_indexing_failures: index.failure_count(),
            last_indexing_error: index.last_failure(),
            indexing: index.scan.is_running(),
            percent_indexed: index.scan.percent(),
            gc_stats: index.gc.snapshot(),
            cursor_stats: self.cursors.stats(name),
        })
    }

    /// `TAGVALS <index> <field>`: distinct values of a tag attribute, sorted
    pub fn tag_values(&self, index_name: &str, field: &str) -> Result<Vec<String>> {
        let index = self.index(index_name)?;
        let state = index.read();
        let (_, spec, field_index) = state.field(field).ok_or_else(|| Error::unknown_field(field))?;
        match field_index {
            FieldIndex::Tag(tags) => {
                let mut values = tags.values();
                values.sort_unstable();
                Ok(values)
            }
            _ => Err(Error::bad_argument(format!(
                "Field `{field}` is of type {}, not TAG",
                spec.kind.type_name()
            ))),
        }
    }
}
