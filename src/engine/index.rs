//! One search index: its state, document analysis and bookkeeping

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::Serialize;

use crate::analysis::{self, STEM_PREFIX};
use crate::gc::GcStats;
use crate::index::doc_table::{field_slot, TEXT_SLOT};
use crate::index::geoshape::Shape;
use crate::index::inverted::Posting;
use crate::index::{geo, DocMeta, FieldIndex, IndexState};
use crate::runtime::Settings;
use crate::schema::{FieldKind, IndexDefinition};
use crate::store::{Document, FieldSource};
use crate::types::{DocId, DocumentKind, Value};
use crate::workers::WorkerPool;
use crate::{Error, Result};

/// Most recent per-document indexing failure
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexingError {
    pub key: String,
    pub reason: String,
}

/// Progress of the scan that indexes pre-existing keys
#[derive(Debug, Default)]
pub struct ScanProgress {
    running: AtomicBool,
    scanned: AtomicU64,
    total: AtomicU64,
}

impl ScanProgress {
    pub fn begin(&self, total: usize) {
        self.total.store(total as u64, Ordering::SeqCst);
        self.scanned.store(0, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
    }

    pub fn advance(&self) {
        self.scanned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn finish(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Fraction of the scan done, 1.0 when no scan is pending.
    pub fn percent(&self) -> f64 {
        let total = self.total.load(Ordering::Relaxed);
        if !self.is_running() || total == 0 {
            return 1.0;
        }
        (self.scanned.load(Ordering::Relaxed) as f64 / total as f64).min(1.0)
    }
}

/// Per-document overrides from `ADD`
#[derive(Debug, Clone, Default)]
pub struct DocOverrides {
    pub score: Option<f64>,
    pub payload: Option<Bytes>,
    pub language: Option<String>,
}

/// A search index registered with the engine
#[derive(Debug)]
pub struct SearchIndex {
    name: String,
    generation: u64,
    state: RwLock<IndexState>,
    failures: AtomicU64,
    last_failure: Mutex<Option<IndexingError>>,
    pub gc: GcStats,
    pub scan: ScanProgress,
    last_access: Mutex<Instant>,
}

impl SearchIndex {
    pub fn new(def: IndexDefinition, generation: u64, settings: &Settings, pool: &WorkerPool) -> Self {
        Self {
            name: def.name.clone(),
            generation,
            state: RwLock::new(IndexState::new(def, settings, pool)),
            failures: AtomicU64::new(0),
            last_failure: Mutex::new(None),
            gc: GcStats::default(),
            scan: ScanProgress::default(),
            last_access: Mutex::new(Instant::now()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Distinguishes this index from an earlier one of the same name.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn read(&self) -> RwLockReadGuard<'_, IndexState> {
        self.state.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, IndexState> {
        self.state.write()
    }

    pub fn touch(&self) {
        *self.last_access.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_access.lock().elapsed()
    }

    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn last_failure(&self) -> Option<IndexingError> {
        self.last_failure.lock().clone()
    }

    fn record_failure(&self, key: &str, error: &Error) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        *self.last_failure.lock() = Some(IndexingError {
            key: key.to_string(),
            reason: error.to_string(),
        });
        tracing::warn!(index = %self.name, key, error = %error, "Failed to index document");
    }

    /// Whether writes to `key` concern this index.
    pub fn follows(&self, key: &str, kind: DocumentKind) -> bool {
        let state = self.state.read();
        let options = &state.def.options;
        options.kind == kind && options.prefixes.iter().any(|p| key.starts_with(p.as_str()))
    }

    /// Index (or re-index) `doc` under `key`.
    ///
    /// The previous version of the document is always removed. When the new
    /// version cannot be indexed the failure is recorded and the document
    /// is left out of the index.
    pub fn index_document(
        &self,
        key: &str,
        doc: &Document,
        overrides: &DocOverrides,
        settings: &Settings,
    ) -> Result<DocId> {
        let mut state = self.state.write();
        remove_locked(&state, key);
        let outcome = analyze(&state, doc, overrides).and_then(|staged| publish(&mut state, key, staged, settings));
        drop(state);
        match outcome {
            Ok(id) => Ok(id),
            Err(e) => {
                self.record_failure(key, &e);
                Err(e)
            }
        }
    }

    /// Check that `doc` would index cleanly without changing anything.
    /// A rejection is recorded like any other indexing failure.
    pub fn validate_document(&self, key: &str, doc: &Document, overrides: &DocOverrides) -> Result<()> {
        let outcome = analyze(&self.state.read(), doc, overrides).map(|_| ());
        if let Err(e) = &outcome {
            self.record_failure(key, e);
        }
        outcome
    }

    /// Remove the document under `key`; returns whether it was indexed.
    pub fn remove_document(&self, key: &str) -> bool {
        let state = self.state.read();
        remove_locked(&state, key)
    }
}

fn remove_locked(state: &IndexState, key: &str) -> bool {
    let Some(meta) = state.docs.remove(key) else {
        return false;
    };
    // Vector backends stop returning the label at once; GC compacts later.
    for field in &state.fields {
        if let Some(vectors) = field.as_vector() {
            vectors.delete(meta.id);
        }
    }
    true
}

#[derive(Debug, Default)]
struct TermEntry {
    freq: u32,
    field_mask: u128,
    offsets: Vec<u32>,
}

enum VectorInput {
    Blob(Bytes),
    Numbers(Vec<f64>),
}

/// A document broken down into per-index entries, not yet published
#[derive(Default)]
struct Staged {
    score: f64,
    payload: Option<Bytes>,
    terms: BTreeMap<String, TermEntry>,
    len: u32,
    tags: Vec<(usize, Vec<String>)>,
    numbers: Vec<(usize, Vec<f64>)>,
    points: Vec<(usize, Vec<(f64, f64)>)>,
    shapes: Vec<(usize, Vec<Shape>)>,
    vectors: Vec<(usize, VectorInput)>,
    sortables: Vec<Option<Value>>,
}

fn first_string(doc: &Document, path: Option<&String>) -> Option<String> {
    let path = path?;
    doc.lookup(path).first().and_then(|s| s.strings().into_iter().next())
}

fn analyze(state: &IndexState, doc: &Document, overrides: &DocOverrides) -> Result<Staged> {
    let def = &state.def;
    let options = &def.options;
    if doc.kind() != options.kind {
        return Err(Error::bad_argument("document type does not match the index"));
    }
    let mut staged = Staged {
        sortables: vec![None; def.schema.fields.len()],
        ..Default::default()
    };

    staged.score = match overrides.score {
        Some(score) => score,
        None => match first_string(doc, options.score_field.as_ref()) {
            Some(raw) => raw
                .trim()
                .parse::<f64>()
                .map_err(|_| Error::bad_argument(format!("Invalid score `{raw}`")))?,
            None => options.default_score,
        },
    };
    staged.payload = overrides.payload.clone().or_else(|| {
        options
            .payload_field
            .as_ref()
            .and_then(|f| doc.hash_field(f).cloned())
    });
    let language = match overrides.language.clone().or_else(|| first_string(doc, options.language_field.as_ref())) {
        Some(lang) => {
            let lang = lang.to_ascii_lowercase();
            analysis::stemmer_for(&lang).ok_or_else(|| Error::bad_argument(format!("Invalid language: {lang}")))?;
            lang
        }
        None => options.language.clone(),
    };

    let mut position = 0u32;
    for (pos, spec) in def.schema.fields.iter().enumerate() {
        let sources: Vec<FieldSource<'_>> = doc.lookup(&spec.path);
        if sources.is_empty() {
            continue;
        }
        match &spec.kind {
            FieldKind::Text(text) => {
                let strings: Vec<String> = sources.iter().flat_map(|s| s.strings()).collect();
                if spec.sortable {
                    staged.sortables[pos] = strings.first().map(|s| sort_text(s, spec.unf));
                }
                if spec.noindex {
                    continue;
                }
                let stem_language = (!text.nostem).then_some(language.as_str());
                let freq_weight = (text.weight.ceil() as u32).max(1);
                for value in &strings {
                    let tokens = analysis::tokenize(value, &state.stopwords, stem_language, position);
                    if let Some(last) = tokens.last() {
                        position = last.position;
                    }
                    staged.len += tokens.len() as u32;
                    for token in tokens {
                        let stem = token.stem.map(|s| format!("{STEM_PREFIX}{s}"));
                        for term in std::iter::once(token.term).chain(stem) {
                            let entry = staged.terms.entry(term).or_default();
                            entry.freq += if options.no_freqs { 0 } else { freq_weight };
                            entry.field_mask |= spec.field_mask();
                            if !options.no_offsets {
                                entry.offsets.push(token.position);
                            }
                        }
                    }
                }
            }
            FieldKind::Tag(_) => {
                let FieldIndex::Tag(index) = &state.fields[pos] else {
                    if spec.sortable {
                        staged.sortables[pos] = sources.first().and_then(|s| s.strings().into_iter().next()).map(|s| sort_text(&s, spec.unf));
                    }
                    continue;
                };
                let tags: Vec<String> = sources
                    .iter()
                    .flat_map(|s| s.strings())
                    .flat_map(|raw| index.split(&raw))
                    .collect();
                if spec.sortable {
                    staged.sortables[pos] = tags.first().map(|s| Value::str(s.clone()));
                }
                staged.tags.push((pos, tags));
            }
            FieldKind::Numeric => {
                let mut numbers = Vec::new();
                for source in &sources {
                    numbers.extend(source.numbers()?);
                }
                if let Some(bad) = numbers.iter().find(|n| !n.is_finite()) {
                    return Err(Error::bad_argument(format!(
                        "Invalid numeric value `{bad}` for field {}",
                        spec.name
                    )));
                }
                if spec.sortable {
                    staged.sortables[pos] = numbers.first().map(|n| Value::Number(*n));
                }
                if !spec.noindex {
                    staged.numbers.push((pos, numbers));
                }
            }
            FieldKind::Geo => {
                let points = sources
                    .iter()
                    .flat_map(|s| s.strings())
                    .map(|raw| geo::parse_point(&raw))
                    .collect::<Result<Vec<_>>>()?;
                if spec.sortable {
                    staged.sortables[pos] = points.first().map(|(lon, lat)| Value::str(format!("{lon},{lat}")));
                }
                if !spec.noindex {
                    staged.points.push((pos, points));
                }
            }
            FieldKind::GeoShape => {
                let shapes = sources
                    .iter()
                    .flat_map(|s| s.strings())
                    .map(|raw| Shape::parse_wkt(&raw))
                    .collect::<Result<Vec<_>>>()?;
                if !spec.noindex {
                    staged.shapes.push((pos, shapes));
                }
            }
            FieldKind::Vector(opts) => {
                let input = match &sources[0] {
                    FieldSource::Hash(blob) => {
                        if blob.len() != opts.blob_size() {
                            return Err(Error::BadVectorSize {
                                expected: opts.blob_size(),
                                actual: blob.len(),
                            });
                        }
                        VectorInput::Blob((*blob).clone())
                    }
                    source @ FieldSource::Json(_) => {
                        let numbers = source.numbers()?;
                        if numbers.len() != opts.dim {
                            return Err(Error::BadVectorSize {
                                expected: opts.dim,
                                actual: numbers.len(),
                            });
                        }
                        VectorInput::Numbers(numbers)
                    }
                };
                staged.vectors.push((pos, input));
            }
        }
    }
    Ok(staged)
}

fn sort_text(raw: &str, unf: bool) -> Value {
    if unf {
        Value::str(raw)
    } else {
        Value::str(raw.to_lowercase())
    }
}

fn publish(state: &mut IndexState, key: &str, staged: Staged, settings: &Settings) -> Result<DocId> {
    let id = state.docs.next_id();
    let mut slots = Vec::new();

    // Vectors go first: a rejected element must leave no other trace.
    let max_element = settings.max_block_bytes();
    let mut added: Vec<usize> = Vec::new();
    for (pos, input) in &staged.vectors {
        let Some(vectors) = state.fields[*pos].as_vector() else {
            continue;
        };
        let result = match input {
            VectorInput::Blob(blob) => vectors.add_blob(id, blob, max_element),
            VectorInput::Numbers(numbers) => vectors.add_numbers(id, numbers, max_element),
        };
        if let Err(e) = result {
            for pos in added {
                if let Some(v) = state.fields[pos].as_vector() {
                    v.delete(id);
                }
            }
            return Err(e);
        }
        added.push(*pos);
        slots.push(field_slot(*pos));
    }

    let max_freq = staged
        .terms
        .iter()
        .filter(|(term, _)| !term.starts_with(STEM_PREFIX))
        .map(|(_, e)| e.freq)
        .max()
        .unwrap_or(0);
    if !staged.terms.is_empty() {
        slots.push(TEXT_SLOT);
    }
    for (term, entry) in staged.terms {
        state.text.add(
            &term,
            Posting {
                doc_id: id,
                freq: entry.freq.max(1),
                field_mask: entry.field_mask,
                offsets: entry.offsets,
            },
        );
    }
    for (pos, tags) in &staged.tags {
        if let FieldIndex::Tag(index) = &mut state.fields[*pos] {
            if !tags.is_empty() {
                index.insert(id, tags);
                slots.push(field_slot(*pos));
            }
        }
    }
    for (pos, numbers) in &staged.numbers {
        if let FieldIndex::Numeric(index) = &mut state.fields[*pos] {
            for n in numbers {
                index.insert(id, *n);
            }
            if !numbers.is_empty() {
                slots.push(field_slot(*pos));
            }
        }
    }
    for (pos, points) in &staged.points {
        if let FieldIndex::Geo(index) = &mut state.fields[*pos] {
            for (lon, lat) in points {
                index.insert(id, *lon, *lat)?;
            }
            if !points.is_empty() {
                slots.push(field_slot(*pos));
            }
        }
    }
    for (pos, shapes) in staged.shapes {
        if let FieldIndex::GeoShape(index) = &mut state.fields[pos] {
            if !shapes.is_empty() {
                slots.push(field_slot(pos));
            }
            for shape in shapes {
                index.insert(id, shape);
            }
        }
    }

    slots.sort_unstable();
    slots.dedup();
    let mut meta = DocMeta::new(key, staged.score);
    meta.id = id;
    meta.max_freq = max_freq;
    meta.len = staged.len;
    meta.payload = staged.payload;
    meta.sortables = staged.sortables;
    meta.slots = slots;
    state.docs.insert(meta);
    Ok(id)
}
