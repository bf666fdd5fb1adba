//! Index definitions and attribute schemas
//!
//! An index is declared with a set of index-level options followed by an
//! ordered list of attributes. Each attribute carries its source path, public
//! name, type and per-type options. Duplicate public names fail creation,
//! duplicate source paths are allowed.

use serde::Serialize;

use crate::args::ArgCursor;
use crate::types::{DistanceMetric, DocumentKind, VectorType};
use crate::{Error, Result};

/// Text fields supported without MAXTEXTFIELDS
pub const DEFAULT_MAX_TEXT_FIELDS: usize = 32;
/// Text fields supported with MAXTEXTFIELDS (width of the field mask)
pub const WIDE_MAX_TEXT_FIELDS: usize = 128;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TextOptions {
    pub weight: f64,
    pub nostem: bool,
    pub withsuffixtrie: bool,
}

impl Default for TextOptions {
    fn default() -> Self {
        Self {
            weight: 1.0,
            nostem: false,
            withsuffixtrie: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TagOptions {
    pub separator: char,
    pub case_sensitive: bool,
    pub withsuffixtrie: bool,
}

impl Default for TagOptions {
    fn default() -> Self {
        Self {
            separator: ',',
            case_sensitive: false,
            withsuffixtrie: false,
        }
    }
}

/// Vector backend algorithm
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum VectorAlgorithm {
    Flat,
    Hnsw,
    /// Graph index over quantized storage
    SvsVamana,
}

impl VectorAlgorithm {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "FLAT" => Ok(VectorAlgorithm::Flat),
            "HNSW" => Ok(VectorAlgorithm::Hnsw),
            "SVS-VAMANA" => Ok(VectorAlgorithm::SvsVamana),
            other => Err(Error::bad_argument(format!(
                "Bad arguments for vector similarity algorithm: {other}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VectorAlgorithm::Flat => "FLAT",
            VectorAlgorithm::Hnsw => "HNSW",
            VectorAlgorithm::SvsVamana => "SVS-VAMANA",
        }
    }
}

/// Quantization scheme for compressed graph storage
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum Compression {
    Lvq8,
    Lvq4,
}

impl Compression {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "LVQ8" | "LVQ4X8" | "LEANVEC8X8" => Ok(Compression::Lvq8),
            "LVQ4" | "LVQ4X4" | "LEANVEC4X8" => Ok(Compression::Lvq4),
            other => Err(Error::bad_argument(format!(
                "Bad arguments for vector similarity SVS-VAMANA index compression: {other}"
            ))),
        }
    }

    pub fn bits(&self) -> u32 {
        match self {
            Compression::Lvq8 => 8,
            Compression::Lvq4 => 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct VectorOptions {
    pub algorithm: VectorAlgorithm,
    pub elem_type: VectorType,
    pub dim: usize,
    pub metric: DistanceMetric,
    pub initial_cap: usize,
    pub block_size: usize,
    pub m: usize,
    pub ef_construction: usize,
    pub ef_runtime: usize,
    pub epsilon: f64,
    pub compression: Option<Compression>,
    pub training_threshold: usize,
}

impl VectorOptions {
    pub fn new(algorithm: VectorAlgorithm) -> Self {
        Self {
            algorithm,
            elem_type: VectorType::Float32,
            dim: 0,
            metric: DistanceMetric::L2,
            initial_cap: 0,
            block_size: 1024,
            m: 16,
            ef_construction: 200,
            ef_runtime: 10,
            epsilon: 0.01,
            compression: None,
            training_threshold: 10 * 1024,
        }
    }

    /// Bytes one vector blob must have.
    pub fn blob_size(&self) -> usize {
        self.dim * self.elem_type.size()
    }
}

/// Attribute type as a tagged variant
#[derive(Debug, Clone, Serialize, PartialEq)]
pub enum FieldKind {
    Text(TextOptions),
    Tag(TagOptions),
    Numeric,
    Geo,
    GeoShape,
    Vector(VectorOptions),
}

impl FieldKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldKind::Text(_) => "TEXT",
            FieldKind::Tag(_) => "TAG",
            FieldKind::Numeric => "NUMERIC",
            FieldKind::Geo => "GEO",
            FieldKind::GeoShape => "GEOSHAPE",
            FieldKind::Vector(_) => "VECTOR",
        }
    }
}

/// One schema attribute
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FieldSpec {
    /// Source path: hash field name or JSONPath
    pub path: String,
    /// Public name used in queries
    pub name: String,
    pub kind: FieldKind,
    pub sortable: bool,
    /// Keep sortable text un-normalized
    pub unf: bool,
    pub noindex: bool,
    /// Bit of this text field in the field mask
    pub text_index: Option<usize>,
}

impl FieldSpec {
    pub fn is_text(&self) -> bool {
        matches!(self.kind, FieldKind::Text(_))
    }

    pub fn text_weight(&self) -> f64 {
        match &self.kind {
            FieldKind::Text(opts) => opts.weight,
            _ => 1.0,
        }
    }

    pub fn vector_options(&self) -> Option<&VectorOptions> {
        match &self.kind {
            FieldKind::Vector(opts) => Some(opts),
            _ => None,
        }
    }

    pub fn field_mask(&self) -> u128 {
        self.text_index.map(|i| 1u128 << i).unwrap_or(0)
    }
}

/// Index-level options
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct IndexOptions {
    pub kind: DocumentKind,
    pub prefixes: Vec<String>,
    pub language: String,
    pub language_field: Option<String>,
    pub default_score: f64,
    pub score_field: Option<String>,
    pub payload_field: Option<String>,
    pub stopwords: Option<Vec<String>>,
    pub no_offsets: bool,
    pub no_freqs: bool,
    pub no_fields: bool,
    pub no_hl: bool,
    pub max_text_fields: bool,
    pub temporary_secs: Option<u64>,
    pub skip_initial_scan: bool,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            kind: DocumentKind::Hash,
            prefixes: vec![String::new()],
            language: "english".to_string(),
            language_field: None,
            default_score: 1.0,
            score_field: None,
            payload_field: None,
            stopwords: None,
            no_offsets: false,
            no_freqs: false,
            no_fields: false,
            no_hl: false,
            max_text_fields: false,
            temporary_secs: None,
            skip_initial_scan: false,
        }
    }
}

impl IndexOptions {
    pub fn highlight_enabled(&self) -> bool {
        !self.no_hl && !self.no_offsets
    }
}

/// Ordered attribute list with name lookup
#[derive(Debug, Clone, Serialize, Default, PartialEq)]
pub struct Schema {
    pub fields: Vec<FieldSpec>,
}

impl Schema {
    pub fn get(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn text_fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter().filter(|f| f.is_text())
    }

    pub fn text_field_count(&self) -> usize {
        self.text_fields().count()
    }

    /// Mask covering every text field, used by unscoped term queries.
    pub fn all_text_mask(&self) -> u128 {
        self.text_fields().fold(0, |mask, f| mask | f.field_mask())
    }

    /// Add fields, enforcing unique public names and the text-field budget.
    pub fn extend(&mut self, new_fields: Vec<FieldSpec>, max_text_fields: bool) -> Result<()> {
        let limit = if max_text_fields {
            WIDE_MAX_TEXT_FIELDS
        } else {
            DEFAULT_MAX_TEXT_FIELDS
        };
        let mut staged = self.fields.clone();
        let mut next_text = self.text_field_count();
        for mut field in new_fields {
            if staged.iter().any(|f| f.name == field.name) {
                return Err(Error::DuplicateField(field.name));
            }
            if field.is_text() {
                if next_text >= limit {
                    return Err(Error::bad_argument(format!(
                        "Schema is limited to {limit} TEXT attributes"
                    )));
                }
                field.text_index = Some(next_text);
                next_text += 1;
            }
            staged.push(field);
        }
        self.fields = staged;
        Ok(())
    }
}

/// A complete index definition
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct IndexDefinition {
    pub name: String,
    pub options: IndexOptions,
    pub schema: Schema,
}

impl IndexDefinition {
    /// Parse `CREATE` arguments following the index name.
    pub fn parse(name: &str, args: &mut ArgCursor<'_>) -> Result<Self> {
        let mut options = IndexOptions::default();
        loop {
            if args.is_empty() {
                return Err(Error::bad_argument("No schema found"));
            }
            if args.eat("SCHEMA") {
                break;
            }
            let keyword = args.next_str()?.to_ascii_uppercase();
            match keyword.as_str() {
                "ON" => options.kind = DocumentKind::parse(args.next_str()?)?,
                "PREFIX" => {
                    options.prefixes = args.next_counted_strings("PREFIX")?;
                    if options.prefixes.is_empty() {
                        options.prefixes.push(String::new());
                    }
                }
                "LANGUAGE" => {
                    let lang = args.next_str()?.to_ascii_lowercase();
                    crate::analysis::stemmer_for(&lang)
                        .ok_or_else(|| Error::bad_argument(format!("Invalid language: {lang}")))?;
                    options.language = lang;
                }
                "LANGUAGE_FIELD" => options.language_field = Some(args.next_string()?),
                "SCORE" => {
                    let score = args.next_f64("SCORE")?;
                    if !(0.0..=1.0).contains(&score) {
                        return Err(Error::bad_argument("Invalid score: must be between 0 and 1"));
                    }
                    options.default_score = score;
                }
                "SCORE_FIELD" => options.score_field = Some(args.next_string()?),
                "PAYLOAD_FIELD" => options.payload_field = Some(args.next_string()?),
                "STOPWORDS" => {
                    options.stopwords = Some(
                        args.next_counted_strings("STOPWORDS")?
                            .into_iter()
                            .map(|s| s.to_lowercase())
                            .collect(),
                    )
                }
                "NOOFFSETS" => options.no_offsets = true,
                "NOFREQS" => options.no_freqs = true,
                "NOFIELDS" => options.no_fields = true,
                "NOHL" => options.no_hl = true,
                "MAXTEXTFIELDS" => options.max_text_fields = true,
                "TEMPORARY" => options.temporary_secs = Some(args.next_u64("TEMPORARY")?),
                "SKIPINITIALSCAN" => options.skip_initial_scan = true,
                other => return Err(Error::bad_argument(format!("Unknown argument `{other}`"))),
            }
        }

        let fields = parse_attributes(args, options.kind)?;
        if fields.is_empty() {
            return Err(Error::bad_argument("Fields arguments are missing"));
        }
        let mut schema = Schema::default();
        schema.extend(fields, options.max_text_fields)?;

        Ok(Self {
            name: name.to_string(),
            options,
            schema,
        })
    }
}

/// Parse attribute specs until the arguments run out.
pub fn parse_attributes(args: &mut ArgCursor<'_>, kind: DocumentKind) -> Result<Vec<FieldSpec>> {
    let mut fields = Vec::new();
    while !args.is_empty() {
        fields.push(parse_attribute(args, kind)?);
    }
    Ok(fields)
}

fn parse_attribute(args: &mut ArgCursor<'_>, kind: DocumentKind) -> Result<FieldSpec> {
    let path = args.next_string()?;
    if kind == DocumentKind::Json && !path.starts_with('$') {
        return Err(Error::bad_argument(format!(
            "Invalid JSONPath `{path}`: must start with `$`"
        )));
    }
    let name = if args.eat("AS") {
        args.next_string()?
    } else {
        path.clone()
    };

    let type_name = args.next_str()?.to_ascii_uppercase();
    let mut field = FieldSpec {
        path,
        name,
        kind: FieldKind::Numeric,
        sortable: false,
        unf: false,
        noindex: false,
        text_index: None,
    };

    match type_name.as_str() {
        "TEXT" => {
            let mut opts = TextOptions::default();
            loop {
                if args.eat("WEIGHT") {
                    opts.weight = args.next_f64("WEIGHT")?;
                    if opts.weight < 0.0 {
                        return Err(Error::bad_argument("Bad arguments for WEIGHT: must be non-negative"));
                    }
                } else if args.eat("NOSTEM") {
                    opts.nostem = true;
                } else if args.eat("WITHSUFFIXTRIE") {
                    opts.withsuffixtrie = true;
                } else if !parse_common_flag(args, &mut field) {
                    break;
                }
            }
            field.kind = FieldKind::Text(opts);
        }
        "TAG" => {
            let mut opts = TagOptions::default();
            loop {
                if args.eat("SEPARATOR") {
                    let sep = args.next_str()?;
                    let mut chars = sep.chars();
                    match (chars.next(), chars.next()) {
                        (Some(c), None) => opts.separator = c,
                        _ => {
                            return Err(Error::bad_argument(
                                "Tag separator must be a single character",
                            ))
                        }
                    }
                } else if args.eat("CASESENSITIVE") {
                    opts.case_sensitive = true;
                } else if args.eat("WITHSUFFIXTRIE") {
                    opts.withsuffixtrie = true;
                } else if !parse_common_flag(args, &mut field) {
                    break;
                }
            }
            field.kind = FieldKind::Tag(opts);
        }
        "NUMERIC" => {
            while parse_common_flag(args, &mut field) {}
            field.kind = FieldKind::Numeric;
        }
        "GEO" => {
            while parse_common_flag(args, &mut field) {}
            field.kind = FieldKind::Geo;
        }
        "GEOSHAPE" => {
            if args.eat("SPHERICAL") {
                return Err(Error::UnsupportedType(
                    "GEOSHAPE with SPHERICAL coordinates".to_string(),
                ));
            }
            args.eat("FLAT");
            while parse_common_flag(args, &mut field) {}
            if field.sortable {
                return Err(Error::bad_argument("GEOSHAPE attributes cannot be SORTABLE"));
            }
            field.kind = FieldKind::GeoShape;
        }
        "VECTOR" => {
            field.kind = FieldKind::Vector(parse_vector_options(args)?);
            if args.eat("SORTABLE") {
                return Err(Error::bad_argument("VECTOR attributes cannot be SORTABLE"));
            }
            if args.eat("NOINDEX") {
                field.noindex = true;
            }
        }
        other => {
            return Err(Error::UnsupportedType(format!("attribute type `{other}`")));
        }
    }

    Ok(field)
}

/// Flags shared by every scalar attribute type.
fn parse_common_flag(args: &mut ArgCursor<'_>, field: &mut FieldSpec) -> bool {
    if args.eat("SORTABLE") {
        field.sortable = true;
        if args.eat("UNF") {
            field.unf = true;
        }
        true
    } else if args.eat("NOINDEX") {
        field.noindex = true;
        true
    } else if args.eat("INDEXMISSING") || args.eat("INDEXEMPTY") {
        true
    } else {
        false
    }
}

fn parse_vector_options(args: &mut ArgCursor<'_>) -> Result<VectorOptions> {
    let algorithm = VectorAlgorithm::parse(args.next_str()?)?;
    let count = args.next_usize("vector attribute count")?;
    if count % 2 != 0 {
        return Err(Error::bad_argument(
            "Bad number of arguments for vector similarity index: expected an even number",
        ));
    }
    let mut opts = VectorOptions::new(algorithm);
    let mut saw_type = false;
    let mut saw_dim = false;
    let mut saw_metric = false;
    for _ in 0..count / 2 {
        let key = args.next_str()?.to_ascii_uppercase();
        let what = format!("vector similarity {} index {key}", algorithm.as_str());
        match key.as_str() {
            "TYPE" => {
                opts.elem_type = VectorType::parse(args.next_str()?)?;
                saw_type = true;
            }
            "DIM" => {
                opts.dim = args.next_usize(&what)?;
                saw_dim = true;
            }
            "DISTANCE_METRIC" => {
                opts.metric = DistanceMetric::parse(args.next_str()?)?;
                saw_metric = true;
            }
            "INITIAL_CAP" => opts.initial_cap = args.next_usize(&what)?,
            "BLOCK_SIZE" => opts.block_size = args.next_usize(&what)?.max(1),
            "M" if algorithm == VectorAlgorithm::Hnsw => opts.m = args.next_usize(&what)?.max(2),
            "EF_CONSTRUCTION" if algorithm == VectorAlgorithm::Hnsw => {
                opts.ef_construction = args.next_usize(&what)?.max(1)
            }
            "EF_RUNTIME" if algorithm == VectorAlgorithm::Hnsw => {
                opts.ef_runtime = args.next_usize(&what)?.max(1)
            }
            "EPSILON" if algorithm != VectorAlgorithm::Flat => {
                opts.epsilon = args.next_f64(&what)?;
                if opts.epsilon <= 0.0 {
                    return Err(Error::bad_argument(format!("Bad arguments for {what}: must be positive")));
                }
            }
            "GRAPH_MAX_DEGREE" if algorithm == VectorAlgorithm::SvsVamana => {
                opts.m = (args.next_usize(&what)? / 2).max(2)
            }
            "CONSTRUCTION_WINDOW_SIZE" if algorithm == VectorAlgorithm::SvsVamana => {
                opts.ef_construction = args.next_usize(&what)?.max(1)
            }
            "SEARCH_WINDOW_SIZE" if algorithm == VectorAlgorithm::SvsVamana => {
                opts.ef_runtime = args.next_usize(&what)?.max(1)
            }
            "COMPRESSION" if algorithm == VectorAlgorithm::SvsVamana => {
                opts.compression = Some(Compression::parse(args.next_str()?)?)
            }
            "TRAINING_THRESHOLD" if algorithm == VectorAlgorithm::SvsVamana => {
                opts.training_threshold = args.next_usize(&what)?
            }
            _ => {
                return Err(Error::bad_argument(format!(
                    "Bad arguments for vector similarity {} index: unknown parameter `{key}`",
                    algorithm.as_str()
                )))
            }
        }
    }
    if !(saw_type && saw_dim && saw_metric) {
        return Err(Error::bad_argument(format!(
            "Missing mandatory parameter: cannot create {} index without specifying TYPE, DIM and DISTANCE_METRIC",
            algorithm.as_str()
        )));
    }
    if opts.dim == 0 {
        return Err(Error::bad_argument("Vector dimension must be positive"));
    }
    if algorithm == VectorAlgorithm::SvsVamana
        && !matches!(opts.elem_type, VectorType::Float32 | VectorType::Float16)
    {
        return Err(Error::UnsupportedType(format!(
            "SVS-VAMANA does not support {} vectors",
            opts.elem_type.as_str()
        )));
    }
    Ok(opts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::to_args;

    fn parse(tokens: &[&str]) -> Result<IndexDefinition> {
        let args = to_args(tokens);
        let mut cursor = ArgCursor::new(&args);
        IndexDefinition::parse("idx", &mut cursor)
    }

    #[test]
    fn test_parse_text_and_numeric_schema() {
        let def = parse(&[
            "ON", "HASH", "PREFIX", "1", "doc:", "SCHEMA", "title", "TEXT", "WEIGHT", "10",
            "body", "TEXT", "bar", "NUMERIC", "SORTABLE",
        ])
        .unwrap();
        assert_eq!(def.options.prefixes, vec!["doc:".to_string()]);
        assert_eq!(def.schema.fields.len(), 3);
        assert_eq!(def.schema.fields[0].text_weight(), 10.0);
        assert_eq!(def.schema.fields[1].text_index, Some(1));
        assert!(def.schema.fields[2].sortable);
    }

    #[test]
    fn test_duplicate_names_fail_but_duplicate_paths_pass() {
        let dup = parse(&["SCHEMA", "t", "TEXT", "t", "TAG"]);
        assert!(matches!(dup, Err(Error::DuplicateField(_))));

        let aliased = parse(&["SCHEMA", "t", "TEXT", "t", "AS", "t2", "TAG"]).unwrap();
        assert_eq!(aliased.schema.fields[1].path, "t");
        assert_eq!(aliased.schema.fields[1].name, "t2");
    }

    #[test]
    fn test_parse_vector_attribute() {
        let def = parse(&[
            "SCHEMA", "v", "VECTOR", "HNSW", "12", "TYPE", "FLOAT32", "DIM", "4",
            "DISTANCE_METRIC", "COSINE", "M", "8", "EF_RUNTIME", "20",
        ])
        .unwrap();
        let opts = def.schema.fields[0].vector_options().unwrap();
        assert_eq!(opts.dim, 4);
        assert_eq!(opts.metric, DistanceMetric::Cosine);
        assert_eq!(opts.m, 8);
        assert_eq!(opts.ef_runtime, 20);
        assert_eq!(opts.blob_size(), 16);
    }

    #[test]
    fn test_vector_attribute_requires_mandatory_params() {
        let err = parse(&["SCHEMA", "v", "VECTOR", "FLAT", "2", "DIM", "4"]).unwrap_err();
        assert!(matches!(err, Error::BadArgument(_)));
    }

    #[test]
    fn test_flat_rejects_graph_params() {
        let err = parse(&[
            "SCHEMA", "v", "VECTOR", "FLAT", "8", "TYPE", "FLOAT32", "DIM", "2",
            "DISTANCE_METRIC", "L2", "M", "4",
        ])
        .unwrap_err();
        assert!(matches!(err, Error::BadArgument(_)));
    }

    #[test]
    fn test_text_field_limit() {
        let mut tokens = vec!["SCHEMA".to_string()];
        for i in 0..33 {
            tokens.push(format!("f{i}"));
            tokens.push("TEXT".to_string());
        }
        let args = to_args(&tokens);
        let mut cursor = ArgCursor::new(&args);
        assert!(IndexDefinition::parse("idx", &mut cursor).is_err());

        let mut wide = vec!["MAXTEXTFIELDS".to_string()];
        wide.extend(tokens);
        let args = to_args(&wide);
        let mut cursor = ArgCursor::new(&args);
        assert!(IndexDefinition::parse("idx", &mut cursor).is_ok());
    }

    #[test]
    fn test_unknown_type_is_unsupported() {
        let err = parse(&["SCHEMA", "f", "BLOB"]).unwrap_err();
        assert!(matches!(err, Error::UnsupportedType(_)));
    }
}
