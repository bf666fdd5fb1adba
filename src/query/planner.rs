//! Query planner: parsed tree → iterator tree
//!
//! Planning happens under the index read lock. Every leaf materializes or
//! snapshots what it reads, so the returned tree outlives the lock.

use std::fmt::Write as _;

use crate::analysis::{self, StopWords, Token, STEM_PREFIX};
use crate::index::geo::GeoFilter;
use crate::index::inverted::{edit_distance_within, Expansion, TermIterator};
use crate::index::numeric::NumericRange;
use crate::index::{FieldIndex, IndexState};
use crate::pipeline::scorer::CorpusStats;
use crate::pipeline::MAX_EXPANSIONS_WARNING;
use crate::query::ast::{KnnClause, NodeKind, QueryNode, TextOp};
use crate::query::iterators::{
    BoxedIterator, EmptyIterator, IdListIterator, IntersectIterator, NotIterator, OptionalIterator,
    UnionIterator,
};
use crate::query::timeout::TimeoutCheck;
use crate::schema::FieldKind;
use crate::types::{format_number, DocId};
use crate::vector::SearchParams;
use crate::{Error, Result};

/// Knobs that shape planning, taken from the request and the runtime settings
#[derive(Debug, Clone)]
pub struct PlanOptions {
    pub verbatim: bool,
    pub no_stopwords: bool,
    /// Query language for stemming; defaults to the index language
    pub language: Option<String>,
    pub slop: Option<u32>,
    pub in_order: bool,
    /// Restricts unscoped text terms to these fields
    pub in_fields: Option<Vec<String>>,
    pub max_expansions: usize,
    pub min_prefix: usize,
    pub union_heap_threshold: usize,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            verbatim: false,
            no_stopwords: false,
            language: None,
            slop: None,
            in_order: false,
            in_fields: None,
            max_expansions: 200,
            min_prefix: 2,
            union_heap_threshold: 20,
        }
    }
}

pub struct Planner<'a> {
    state: &'a IndexState,
    options: PlanOptions,
    stats: CorpusStats,
    check: TimeoutCheck,
    stopwords: StopWords,
    pub warnings: Vec<String>,
    /// Some expansion hit the cap and was cut short
    pub truncated: bool,
}

impl<'a> Planner<'a> {
    pub fn new(state: &'a IndexState, options: PlanOptions, check: TimeoutCheck) -> Self {
        let stopwords = if options.no_stopwords {
            StopWords::none()
        } else {
            state.stopwords.clone()
        };
        Self {
            state,
            stats: state.stats(),
            options,
            check,
            stopwords,
            warnings: Vec::new(),
            truncated: false,
        }
    }

    fn warn(&mut self, message: String) {
        if !self.warnings.contains(&message) {
            self.warnings.push(message);
        }
    }

    fn max_id(&self) -> DocId {
        self.state.docs.max_doc_id()
    }

    pub fn build(&mut self, node: &QueryNode) -> Result<BoxedIterator> {
        let weight = node.attrs.weight;
        match &node.kind {
            NodeKind::Wildcard => Ok(IdListIterator::new(self.state.docs.live_ids(), weight).boxed()),
            NodeKind::Empty => Ok(EmptyIterator::boxed()),
            NodeKind::Text { op, text, fields } => self.text(*op, text, fields.as_deref(), node),
            NodeKind::And(children) => {
                let built = children
                    .iter()
                    .map(|c| self.build(c))
                    .collect::<Result<Vec<_>>>()?;
                let slop = node.attrs.slop.or(self.options.slop);
                let in_order = node.attrs.in_order.unwrap_or(self.options.in_order);
                let slop = if in_order { slop.or(Some(u32::MAX)) } else { slop };
                Ok(intersect(built, weight, slop, in_order))
            }
            NodeKind::Or(children) => {
                let built = children
                    .iter()
                    .map(|c| self.build(c))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Box::new(UnionIterator::new(built, weight, self.options.union_heap_threshold)))
            }
            NodeKind::Not(child) => {
                let inner = self.build(child)?;
                Ok(Box::new(NotIterator::new(inner, self.max_id(), weight)))
            }
            NodeKind::Optional(child) => {
                let inner = self.build(child)?;
                Ok(Box::new(OptionalIterator::new(inner, self.max_id(), weight)))
            }
            NodeKind::Numeric { field, range } => {
                let Some(index) = self.field_index(field, "NUMERIC")? else {
                    return Ok(EmptyIterator::boxed());
                };
                match index {
                    FieldIndex::Numeric(n) => Ok(IdListIterator::new(n.range(range), weight).boxed()),
                    _ => Ok(EmptyIterator::boxed()),
                }
            }
            NodeKind::Tag { field, values } => {
                let Some(index) = self.field_index(field, "TAG")? else {
                    return Ok(EmptyIterator::boxed());
                };
                let FieldIndex::Tag(tags) = index else {
                    return Ok(EmptyIterator::boxed());
                };
                let (ids, truncated) = tags.query(values, self.options.max_expansions);
                if truncated {
                    self.truncated = true;
                    self.warn(MAX_EXPANSIONS_WARNING.to_string());
                }
                Ok(IdListIterator::new(ids, weight).boxed())
            }
            NodeKind::Geo { field, filter } => {
                let Some(index) = self.field_index(field, "GEO")? else {
                    return Ok(EmptyIterator::boxed());
                };
                match index {
                    FieldIndex::Geo(g) => Ok(IdListIterator::new(g.query(filter), weight).boxed()),
                    _ => Ok(EmptyIterator::boxed()),
                }
            }
            NodeKind::Shape { field, op, shape } => {
                let Some(index) = self.field_index(field, "GEOSHAPE")? else {
                    return Ok(EmptyIterator::boxed());
                };
                match index {
                    FieldIndex::GeoShape(s) => Ok(IdListIterator::new(s.query(*op, shape), weight).boxed()),
                    _ => Ok(EmptyIterator::boxed()),
                }
            }
            NodeKind::VectorRange { field, radius, blob } => {
                let Some(index) = self.field_index(field, "VECTOR")? else {
                    return Ok(EmptyIterator::boxed());
                };
                let Some(vectors) = index.as_vector() else {
                    return Ok(EmptyIterator::boxed());
                };
                let query = vectors.encode_query(blob)?;
                let params = SearchParams {
                    ef_runtime: node.attrs.vector.ef_runtime,
                    epsilon: node.attrs.vector.epsilon,
                };
                let found = vectors.range(&query, *radius, &params, &mut self.check)?;
                let name = node
                    .attrs
                    .vector
                    .yield_distance_as
                    .clone()
                    .unwrap_or_else(|| format!("__{field}_score"));
                let pairs = found
                    .value
                    .iter()
                    .map(|n| (n.label, n.distance as f64))
                    .collect();
                let leaf = IdListIterator::with_distances(pairs, weight, &name);
                Ok(if found.timed_out {
                    leaf.mark_timed_out().boxed()
                } else {
                    leaf.boxed()
                })
            }
        }
    }

    /// Index of a non-text attribute. Unknown names plan to nothing; a
    /// known attribute of the wrong type is a bad argument.
    fn field_index(&self, name: &str, expected: &str) -> Result<Option<&'a FieldIndex>> {
        let state: &'a IndexState = self.state;
        let Some((_, spec, index)) = state.field(name) else {
            return Ok(None);
        };
        if spec.kind.type_name() != expected {
            return Err(Error::bad_argument(format!(
                "Field `{name}` is of type {}, not {expected}",
                spec.kind.type_name()
            )));
        }
        Ok(Some(index))
    }

    /// Field mask for a text leaf.
    fn text_mask(&self, fields: Option<&[String]>) -> u128 {
        let schema = &self.state.def.schema;
        if self.state.def.options.no_fields {
            return u128::MAX;
        }
        let scope = fields.or(self.options.in_fields.as_deref());
        match scope {
            None => schema.all_text_mask(),
            Some(names) => names
                .iter()
                .filter_map(|n| schema.get(n))
                .filter(|f| f.is_text())
                .fold(0, |mask, f| mask | f.field_mask()),
        }
    }

    /// Fields in `mask` that allow stemming.
    fn stem_mask(&self, mask: u128) -> u128 {
        if self.state.def.options.no_fields {
            return mask;
        }
        self.state
            .def
            .schema
            .text_fields()
            .filter(|f| matches!(&f.kind, FieldKind::Text(opts) if !opts.nostem))
            .fold(0, |acc, f| acc | f.field_mask())
            & mask
    }

    fn language(&self) -> Option<String> {
        if self.options.verbatim {
            return None;
        }
        Some(
            self.options
                .language
                .clone()
                .unwrap_or_else(|| self.state.def.options.language.clone()),
        )
    }

    fn text(
        &mut self,
        op: TextOp,
        text: &str,
        fields: Option<&[String]>,
        node: &QueryNode,
    ) -> Result<BoxedIterator> {
        let weight = node.attrs.weight;
        let mask = self.text_mask(fields);
        if mask == 0 {
            return Ok(EmptyIterator::boxed());
        }
        match op {
            TextOp::Term | TextOp::Phrase => {
                let language = self.language();
                let tokens = analysis::tokenize(text, &self.stopwords, language.as_deref(), 0);
                let leaf_weight = if tokens.len() == 1 { weight } else { 1.0 };
                let leaves: Vec<BoxedIterator> = tokens
                    .iter()
                    .map(|t| self.term(t, mask, leaf_weight))
                    .collect();
                match leaves.len() {
                    0 => Ok(EmptyIterator::boxed()),
                    1 if op == TextOp::Term => Ok(leaves.into_iter().next().unwrap_or_else(EmptyIterator::boxed)),
                    _ if op == TextOp::Phrase && !self.state.def.options.no_offsets => {
                        let slop = node.attrs.slop.unwrap_or(0);
                        let in_order = node.attrs.in_order.unwrap_or(true);
                        Ok(intersect(leaves, weight, Some(slop), in_order))
                    }
                    _ => Ok(intersect(leaves, weight, None, false)),
                }
            }
            TextOp::Prefix => {
                let prefix = analysis::normalize(text);
                if prefix.chars().count() < self.options.min_prefix {
                    self.warn(format!(
                        "Prefix `{prefix}` is shorter than the minimum of {} characters",
                        self.options.min_prefix
                    ));
                    return Ok(EmptyIterator::boxed());
                }
                let expansion = self.state.text.prefix(&prefix, self.options.max_expansions);
                Ok(self.expansion(expansion, mask, weight))
            }
            TextOp::Suffix => {
                let suffix = analysis::normalize(text);
                let expansion = self
                    .state
                    .text
                    .matching(self.options.max_expansions, |t| t.ends_with(suffix.as_str()));
                Ok(self.expansion(expansion, mask, weight))
            }
            TextOp::Infix => {
                let infix = analysis::normalize(text);
                let expansion = self
                    .state
                    .text
                    .matching(self.options.max_expansions, |t| t.contains(infix.as_str()));
                Ok(self.expansion(expansion, mask, weight))
            }
            TextOp::Fuzzy(distance) => {
                let term = analysis::normalize(text);
                let expansion = self.state.text.matching(self.options.max_expansions, |t| {
                    edit_distance_within(t, &term, distance as usize)
                });
                Ok(self.expansion(expansion, mask, weight))
            }
        }
    }

    /// One query token: the term itself plus, unless verbatim, its stem
    /// entries restricted to stemmable fields.
    fn term(&self, token: &Token, mask: u128, weight: f64) -> BoxedIterator {
        let mut leaves: Vec<BoxedIterator> = Vec::new();
        if let Some(list) = self.state.text.get(&token.term) {
            leaves.push(Box::new(TermIterator::new(&token.term, list, mask, weight, &self.stats)));
        }
        if !self.options.verbatim {
            let stem_mask = self.stem_mask(mask);
            if stem_mask != 0 {
                let mut variants = vec![format!("{STEM_PREFIX}{}", token.term)];
                if let Some(stem) = &token.stem {
                    variants.push(format!("{STEM_PREFIX}{stem}"));
                    variants.push(stem.clone());
                }
                variants.dedup();
                for variant in variants {
                    if variant == token.term {
                        continue;
                    }
                    if let Some(list) = self.state.text.get(&variant) {
                        leaves.push(Box::new(TermIterator::new(&variant, list, stem_mask, weight, &self.stats)));
                    }
                }
            }
        }
        match leaves.len() {
            0 => EmptyIterator::boxed(),
            1 => leaves.pop().unwrap_or_else(EmptyIterator::boxed),
            _ => Box::new(UnionIterator::new(leaves, 1.0, self.options.union_heap_threshold)),
        }
    }

    fn expansion(&mut self, expansion: Expansion, mask: u128, weight: f64) -> BoxedIterator {
        if expansion.truncated {
            self.truncated = true;
            self.warn(MAX_EXPANSIONS_WARNING.to_string());
        }
        let leaves: Vec<BoxedIterator> = expansion
            .terms
            .into_iter()
            .map(|(term, list)| Box::new(TermIterator::new(&term, list, mask, 1.0, &self.stats)) as BoxedIterator)
            .collect();
        if leaves.is_empty() {
            return EmptyIterator::boxed();
        }
        Box::new(UnionIterator::new(leaves, weight, self.options.union_heap_threshold))
    }

    /// Restrict a tree to the given document keys.
    pub fn restrict_to_keys(&self, root: BoxedIterator, keys: &[String]) -> BoxedIterator {
        let ids: Vec<DocId> = keys.iter().filter_map(|k| self.state.docs.lookup(k)).collect();
        intersect(vec![root, IdListIterator::new(ids, 0.0).boxed()], 1.0, None, false)
    }
}

fn intersect(mut children: Vec<BoxedIterator>, weight: f64, slop: Option<u32>, in_order: bool) -> BoxedIterator {
    match children.len() {
        0 => EmptyIterator::boxed(),
        1 if slop.is_none() => children.pop().unwrap_or_else(EmptyIterator::boxed),
        _ => Box::new(IntersectIterator::new(children, weight, slop, in_order)),
    }
}

/// Wrap `root` with the request-level numeric and geo filters.
pub fn with_filters(root: QueryNode, numeric: &[(String, NumericRange)], geo: &[(String, GeoFilter)]) -> QueryNode {
    if numeric.is_empty() && geo.is_empty() {
        return root;
    }
    let mut children = vec![root];
    children.extend(numeric.iter().map(|(field, range)| {
        QueryNode::new(NodeKind::Numeric {
            field: field.clone(),
            range: *range,
        })
    }));
    children.extend(geo.iter().map(|(field, filter)| {
        QueryNode::new(NodeKind::Geo {
            field: field.clone(),
            filter: *filter,
        })
    }));
    QueryNode::new(NodeKind::And(children))
}

/// Render the query tree, one node per line with two-space indentation.
pub fn explain(node: &QueryNode, knn: Option<&KnnClause>) -> String {
    let mut out = String::new();
    match knn {
        Some(knn) => {
            let _ = writeln!(
                out,
                "VECTOR {{K={} nearest vectors in @{}, yields distance as `{}`}} {{",
                knn.k,
                knn.field,
                knn.score_name()
            );
            explain_node(node, 1, &mut out);
            out.push_str("}\n");
        }
        None => explain_node(node, 0, &mut out),
    }
    out
}

fn explain_node(node: &QueryNode, depth: usize, out: &mut String) {
    let pad = "  ".repeat(depth);
    let block = |out: &mut String, title: &str, children: &[&QueryNode]| {
        let _ = writeln!(out, "{pad}{title} {{");
        for child in children {
            explain_node(child, depth + 1, out);
        }
        let _ = writeln!(out, "{pad}}}");
    };
    match &node.kind {
        NodeKind::Wildcard => {
            let _ = writeln!(out, "{pad}<WILDCARD>");
        }
        NodeKind::Empty => {
            let _ = writeln!(out, "{pad}<EMPTY>");
        }
        NodeKind::Text { op, text, fields } => {
            let scope = fields
                .as_ref()
                .map(|f| format!("@{}:", f.join("|")))
                .unwrap_or_default();
            let rendered = match op {
                TextOp::Term => text.clone(),
                TextOp::Prefix => format!("PREFIX{{{text}*}}"),
                TextOp::Suffix => format!("SUFFIX{{*{text}}}"),
                TextOp::Infix => format!("INFIX{{*{text}*}}"),
                TextOp::Fuzzy(d) => format!("FUZZY{{{text}}} DISTANCE {d}"),
                TextOp::Phrase => {
                    let _ = writeln!(out, "{pad}{scope}EXACT {{");
                    for word in text.split_whitespace() {
                        let _ = writeln!(out, "{pad}  {word}");
                    }
                    let _ = writeln!(out, "{pad}}}");
                    return;
                }
            };
            let _ = writeln!(out, "{pad}{scope}{rendered}");
        }
        NodeKind::And(children) => block(out, "INTERSECT", &children.iter().collect::<Vec<_>>()),
        NodeKind::Or(children) => block(out, "UNION", &children.iter().collect::<Vec<_>>()),
        NodeKind::Not(child) => block(out, "NOT", &[child.as_ref()]),
        NodeKind::Optional(child) => block(out, "OPTIONAL", &[child.as_ref()]),
        NodeKind::Numeric { field, range } => {
            let lo_op = if range.min_inclusive { "<=" } else { "<" };
            let hi_op = if range.max_inclusive { "<=" } else { "<" };
            let _ = writeln!(
                out,
                "{pad}NUMERIC {{{} {lo_op} @{field} {hi_op} {}}}",
                format_number(range.min),
                format_number(range.max)
            );
        }
        NodeKind::Tag { field, values } => {
            let _ = writeln!(out, "{pad}TAG:@{field} {{");
            for value in values {
                let star = if value.prefix { "*" } else { "" };
                let _ = writeln!(out, "{pad}  {}{star}", value.value);
            }
            let _ = writeln!(out, "{pad}}}");
        }
        NodeKind::Geo { field, filter } => {
            let _ = writeln!(
                out,
                "{pad}GEO @{field}:{{{},{} --> {} {:?}}}",
                format_number(filter.lon),
                format_number(filter.lat),
                format_number(filter.radius),
                filter.unit
            );
        }
        NodeKind::Shape { field, op, .. } => {
            let _ = writeln!(out, "{pad}GEOSHAPE {{@{field} {}}}", op.as_str());
        }
        NodeKind::VectorRange { field, radius, .. } => {
            let _ = writeln!(out, "{pad}VECTOR {{@{field} RADIUS {}}}", format_number(*radius));
        }
    }
}
