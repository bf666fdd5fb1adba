//! Per-attribute indexes
//!
//! Text attributes share one inverted index per search index and are told
//! apart by field mask. Every other attribute owns a concrete index chosen
//! by its type.

pub mod doc_table;
pub mod geo;
pub mod geoshape;
pub mod inverted;
pub mod numeric;
pub mod tag;

use std::sync::Arc;

use crate::analysis::StopWords;
use crate::pipeline::scorer::CorpusStats;
use crate::runtime::Settings;
use crate::schema::{FieldKind, FieldSpec, IndexDefinition};
use crate::types::DocId;
use crate::vector::VectorIndex;
use crate::workers::WorkerPool;

pub use doc_table::{DocMeta, DocTable};
pub use geo::GeoIndex;
pub use geoshape::GeoShapeIndex;
pub use inverted::InvertedIndex;
pub use numeric::NumericIndex;
pub use tag::TagIndex;

/// The index behind one attribute
#[derive(Debug)]
pub enum FieldIndex {
    /// Postings live in the shared inverted index
    Text,
    Tag(TagIndex),
    Numeric(NumericIndex),
    Geo(GeoIndex),
    GeoShape(GeoShapeIndex),
    Vector(Arc<VectorIndex>),
    /// NOINDEX attributes: values are only kept as sort keys
    Unindexed,
}

impl FieldIndex {
    pub fn for_field(spec: &FieldSpec, settings: &Settings, pool: &WorkerPool) -> Self {
        if spec.noindex {
            return FieldIndex::Unindexed;
        }
        match &spec.kind {
            FieldKind::Text(_) => FieldIndex::Text,
            FieldKind::Tag(opts) => FieldIndex::Tag(TagIndex::new(opts.clone())),
            FieldKind::Numeric => FieldIndex::Numeric(NumericIndex::new()),
            FieldKind::Geo => FieldIndex::Geo(GeoIndex::new()),
            FieldKind::GeoShape => FieldIndex::GeoShape(GeoShapeIndex::new()),
            FieldKind::Vector(opts) => {
                FieldIndex::Vector(Arc::new(VectorIndex::new(opts.clone(), settings, pool)))
            }
        }
    }

    pub fn num_entries(&self) -> usize {
        match self {
            FieldIndex::Tag(t) => t.num_entries() as usize,
            FieldIndex::Numeric(n) => n.num_entries(),
            FieldIndex::Geo(g) => g.num_entries(),
            FieldIndex::GeoShape(s) => s.num_entries(),
            FieldIndex::Vector(v) => v.size(),
            FieldIndex::Text | FieldIndex::Unindexed => 0,
        }
    }

    pub fn memory_usage(&self) -> usize {
        match self {
            FieldIndex::Tag(t) => t.memory_usage(),
            FieldIndex::Numeric(n) => n.memory_usage(),
            FieldIndex::Geo(g) => g.memory_usage(),
            FieldIndex::GeoShape(s) => s.memory_usage(),
            FieldIndex::Vector(v) => v.memory(),
            FieldIndex::Text | FieldIndex::Unindexed => 0,
        }
    }

    /// Drop entries for retired doc-ids (sorted); returns bytes freed.
    pub fn collect_garbage(&mut self, dead: &[DocId]) -> usize {
        match self {
            FieldIndex::Tag(t) => t.collect_garbage(dead),
            FieldIndex::Numeric(n) => n.collect_garbage(dead),
            FieldIndex::Geo(g) => g.collect_garbage(dead),
            FieldIndex::GeoShape(s) => s.collect_garbage(dead),
            FieldIndex::Vector(v) => {
                for id in dead {
                    v.delete(*id);
                }
                v.collect_garbage()
            }
            FieldIndex::Text | FieldIndex::Unindexed => 0,
        }
    }

    pub fn as_vector(&self) -> Option<&Arc<VectorIndex>> {
        match self {
            FieldIndex::Vector(v) => Some(v),
            _ => None,
        }
    }
}

/// Everything one search index owns, guarded by the index lock
#[derive(Debug)]
pub struct IndexState {
    pub def: Arc<IndexDefinition>,
    pub docs: Arc<DocTable>,
    pub text: InvertedIndex,
    /// One entry per schema attribute, by position
    pub fields: Vec<FieldIndex>,
    pub stopwords: StopWords,
}

impl IndexState {
    pub fn new(def: IndexDefinition, settings: &Settings, pool: &WorkerPool) -> Self {
        let fields = def
            .schema
            .fields
            .iter()
            .map(|spec| FieldIndex::for_field(spec, settings, pool))
            .collect();
        let stopwords = StopWords::new(def.options.stopwords.as_deref());
        Self {
            def: Arc::new(def),
            docs: Arc::new(DocTable::new()),
            text: InvertedIndex::new(),
            fields,
            stopwords,
        }
    }

    /// Attribute by public name: position, descriptor and index.
    pub fn field(&self, name: &str) -> Option<(usize, &FieldSpec, &FieldIndex)> {
        let pos = self.def.schema.position(name)?;
        Some((pos, &self.def.schema.fields[pos], self.fields.get(pos)?))
    }

    /// Append attributes added by ALTER. Existing entries are untouched.
    pub fn add_fields(&mut self, specs: Vec<FieldSpec>, settings: &Settings, pool: &WorkerPool) -> crate::Result<()> {
        let mut def = (*self.def).clone();
        let max_text = def.options.max_text_fields;
        def.schema.extend(specs, max_text)?;
        for spec in &def.schema.fields[self.fields.len()..] {
            self.fields.push(FieldIndex::for_field(spec, settings, pool));
        }
        self.def = Arc::new(def);
        Ok(())
    }

    pub fn stats(&self) -> CorpusStats {
        CorpusStats {
            num_docs: self.docs.num_docs(),
            avg_doc_len: self.docs.avg_doc_len(),
        }
    }

    pub fn memory_usage(&self) -> usize {
        self.text.memory_usage()
            + self.docs.memory_usage()
            + self.fields.iter().map(FieldIndex::memory_usage).sum::<usize>()
    }
}
