//! Query string parser
//!
//! The grammar lives in `query.pest`. Parameters (`$name`) are substituted
//! while building the tree, so the planner only ever sees literal values.

use std::collections::HashMap;

use bytes::Bytes;
use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;

use super::ast::{HybridPolicy, KnnClause, NodeAttrs, NodeKind, ParsedQuery, QueryNode, TextOp, VectorAttrs};
use crate::index::geo::{self, GeoFilter, GeoUnit};
use crate::index::geoshape::{Shape, ShapeOp};
use crate::index::numeric::NumericRange;
use crate::index::tag::TagQuery;
use crate::types::parse_f64;
use crate::{Error, Result};

#[derive(Parser)]
#[grammar = "query/query.pest"]
struct QueryGrammar;

/// Inputs that affect how a query string is read
#[derive(Debug, Clone, Copy)]
pub struct ParseOptions<'a> {
    pub dialect: u32,
    pub params: &'a HashMap<String, Bytes>,
}

pub fn parse(text: &str, options: ParseOptions<'_>) -> Result<ParsedQuery> {
    if text.trim().is_empty() {
        return Err(Error::syntax("Empty query"));
    }
    let mut pairs = QueryGrammar::parse(Rule::query, text).map_err(|e| Error::syntax(e.to_string()))?;
    let query = pairs.next().ok_or_else(|| Error::syntax("Empty query"))?;
    let reader = Reader { options };
    let mut root = None;
    let mut knn = None;
    for pair in query.into_inner() {
        match pair.as_rule() {
            Rule::union => root = Some(reader.union(pair)?),
            Rule::knn_clause => knn = Some(reader.knn(pair)?),
            _ => {}
        }
    }
    let root = root.ok_or_else(|| Error::syntax("Empty query"))?;
    if options.dialect < 2 && (knn.is_some() || root.has_vector()) {
        return Err(Error::syntax("Vector queries require DIALECT 2 or greater"));
    }
    Ok(ParsedQuery { root, knn })
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn first<'i>(pair: Pair<'i, Rule>) -> Result<Pair<'i, Rule>> {
    let what = pair.as_str().to_string();
    pair.into_inner()
        .next()
        .ok_or_else(|| Error::syntax(format!("Malformed query near `{what}`")))
}

fn combine(mut nodes: Vec<QueryNode>, wrap: fn(Vec<QueryNode>) -> NodeKind) -> QueryNode {
    if nodes.len() == 1 {
        nodes.remove(0)
    } else {
        QueryNode::new(wrap(nodes))
    }
}

struct Reader<'a> {
    options: ParseOptions<'a>,
}

impl Reader<'_> {
    fn param(&self, pair: Pair<'_, Rule>) -> Result<Bytes> {
        let name = first(pair)?.as_str().to_string();
        if self.options.dialect < 2 {
            return Err(Error::syntax(format!(
                "Parameter `${name}` requires DIALECT 2 or greater"
            )));
        }
        self.options
            .params
            .get(&name)
            .cloned()
            .ok_or_else(|| Error::syntax(format!("No such parameter `{name}`")))
    }

    fn param_str(&self, pair: Pair<'_, Rule>) -> Result<String> {
        let bytes = self.param(pair)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| Error::syntax("Parameter is not valid UTF-8"))
    }

    fn number(&self, pair: Pair<'_, Rule>) -> Result<f64> {
        match pair.as_rule() {
            Rule::param => {
                let raw = self.param_str(pair)?;
                parse_f64(&raw).ok_or_else(|| Error::syntax(format!("Expected a number, got `{raw}`")))
            }
            Rule::inf => Ok(if pair.as_str().starts_with('-') {
                f64::NEG_INFINITY
            } else {
                f64::INFINITY
            }),
            _ => parse_f64(pair.as_str())
                .ok_or_else(|| Error::syntax(format!("Expected a number, got `{}`", pair.as_str()))),
        }
    }

    fn union(&self, pair: Pair<'_, Rule>) -> Result<QueryNode> {
        let branches = pair
            .into_inner()
            .map(|p| self.intersect(p))
            .collect::<Result<Vec<_>>>()?;
        Ok(combine(branches, NodeKind::Or))
    }

    fn intersect(&self, pair: Pair<'_, Rule>) -> Result<QueryNode> {
        let parts = pair
            .into_inner()
            .map(|p| self.modified(p))
            .collect::<Result<Vec<_>>>()?;
        Ok(combine(parts, NodeKind::And))
    }

    fn modified(&self, pair: Pair<'_, Rule>) -> Result<QueryNode> {
        let mut modifier = None;
        let mut node = None;
        let mut attrs = None;
        for inner in pair.into_inner() {
            match inner.as_rule() {
                Rule::modifier => modifier = Some(inner.as_str().to_string()),
                Rule::attributes => attrs = Some(inner),
                _ => node = Some(self.atom(inner)?),
            }
        }
        let mut node = node.ok_or_else(|| Error::syntax("Expected a query term"))?;
        if let Some(attrs) = attrs {
            self.attributes(attrs, &mut node.attrs)?;
        }
        Ok(apply_modifier(node, modifier.as_deref()))
    }

    fn atom(&self, pair: Pair<'_, Rule>) -> Result<QueryNode> {
        let text_node = |op: TextOp, text: String| {
            QueryNode::new(NodeKind::Text {
                op,
                text,
                fields: None,
            })
        };
        match pair.as_rule() {
            Rule::group => self.union(first(pair)?),
            Rule::field_query => self.field_query(pair),
            Rule::phrase => Ok(text_node(TextOp::Phrase, unescape(first(pair)?.as_str()))),
            Rule::fuzzy => {
                let mut marks = Vec::new();
                let mut word = String::new();
                for inner in pair.into_inner() {
                    match inner.as_rule() {
                        Rule::fuzzy_mark => marks.push(inner.as_str().len()),
                        _ => word = unescape(inner.as_str()),
                    }
                }
                if marks.len() != 2 || marks[0] != marks[1] {
                    return Err(Error::syntax("Unbalanced fuzzy markers"));
                }
                Ok(text_node(TextOp::Fuzzy(marks[0] as u32), word))
            }
            Rule::infix => Ok(text_node(TextOp::Infix, unescape(first(pair)?.as_str()))),
            Rule::suffix => Ok(text_node(TextOp::Suffix, unescape(first(pair)?.as_str()))),
            Rule::prefix => Ok(text_node(TextOp::Prefix, unescape(first(pair)?.as_str()))),
            Rule::wildcard => Ok(QueryNode::new(NodeKind::Wildcard)),
            Rule::param => Ok(text_node(TextOp::Term, self.param_str(pair)?)),
            Rule::term => Ok(text_node(TextOp::Term, unescape(pair.as_str()))),
            other => Err(Error::syntax(format!("Unexpected {other:?}"))),
        }
    }

    fn field_query(&self, pair: Pair<'_, Rule>) -> Result<QueryNode> {
        let mut inner = pair.into_inner();
        let spec = inner.next().ok_or_else(|| Error::syntax("Expected a field"))?;
        let fields: Vec<String> = spec.into_inner().map(|f| unescape(f.as_str())).collect();
        let body = inner.next().ok_or_else(|| Error::syntax("Expected a field query"))?;
        let single = || -> Result<String> {
            match fields.as_slice() {
                [f] => Ok(f.clone()),
                _ => Err(Error::syntax("Only text queries may target several fields")),
            }
        };
        let kind = match body.as_rule() {
            Rule::numeric_range => {
                let mut bounds = Vec::with_capacity(2);
                for bound in body.into_inner() {
                    let mut exclusive = false;
                    let mut value = None;
                    for part in bound.into_inner() {
                        match part.as_rule() {
                            Rule::exclusive => exclusive = true,
                            _ => value = Some(self.number(part)?),
                        }
                    }
                    let value = value.ok_or_else(|| Error::syntax("Bad numeric range"))?;
                    bounds.push((value, !exclusive));
                }
                let [(min, min_inclusive), (max, max_inclusive)] = bounds[..] else {
                    return Err(Error::syntax("Bad numeric range"));
                };
                NodeKind::Numeric {
                    field: single()?,
                    range: NumericRange {
                        min,
                        max,
                        min_inclusive,
                        max_inclusive,
                    },
                }
            }
            Rule::tag_set => {
                let mut values = Vec::new();
                for value in body.into_inner() {
                    let part = first(value)?;
                    let raw = match part.as_rule() {
                        Rule::param => self.param_str(part)?,
                        _ => unescape(part.as_str().trim()),
                    };
                    let (text, prefix) = match raw.strip_suffix('*') {
                        Some(stem) if !raw.ends_with("\\*") => (stem.to_string(), true),
                        _ => (raw, false),
                    };
                    values.push(TagQuery { value: text, prefix });
                }
                NodeKind::Tag {
                    field: single()?,
                    values,
                }
            }
            Rule::geo_filter => {
                let mut nums = Vec::with_capacity(3);
                let mut unit = GeoUnit::Kilometers;
                for part in body.into_inner() {
                    match part.as_rule() {
                        Rule::geo_unit => {
                            unit = match part.clone().into_inner().next() {
                                Some(p) => GeoUnit::parse(&self.param_str(p)?)?,
                                None => GeoUnit::parse(part.as_str())?,
                            };
                        }
                        _ => nums.push(self.number(part)?),
                    }
                }
                let [lon, lat, radius] = nums[..] else {
                    return Err(Error::syntax("Bad geo filter"));
                };
                geo::validate(lon, lat)?;
                if radius < 0.0 {
                    return Err(Error::bad_argument("Geo radius must be non-negative"));
                }
                NodeKind::Geo {
                    field: single()?,
                    filter: GeoFilter {
                        lon,
                        lat,
                        radius,
                        unit,
                    },
                }
            }
            Rule::shape_filter => {
                let mut inner = body.into_inner();
                let op = inner.next().ok_or_else(|| Error::syntax("Bad shape filter"))?;
                let op = ShapeOp::parse(op.as_str())?;
                let wkt = inner.next().ok_or_else(|| Error::syntax("Bad shape filter"))?;
                let shape = Shape::parse_wkt(&self.param_str(wkt)?)?;
                NodeKind::Shape {
                    field: single()?,
                    op,
                    shape,
                }
            }
            Rule::vector_range => {
                let mut inner = body.into_inner();
                let radius = inner.next().ok_or_else(|| Error::syntax("Bad vector range"))?;
                let radius = self.number(radius)?;
                if radius < 0.0 {
                    return Err(Error::bad_argument("Vector range radius must be non-negative"));
                }
                let blob = inner.next().ok_or_else(|| Error::syntax("Bad vector range"))?;
                NodeKind::VectorRange {
                    field: single()?,
                    radius,
                    blob: self.param(blob)?,
                }
            }
            Rule::field_text => {
                let mut modifier = None;
                let mut node = None;
                for part in body.into_inner() {
                    match part.as_rule() {
                        Rule::modifier => modifier = Some(part.as_str().to_string()),
                        _ => node = Some(self.atom(part)?),
                    }
                }
                let mut node = node.ok_or_else(|| Error::syntax("Expected a field query"))?;
                node.scope(&fields);
                return Ok(apply_modifier(node, modifier.as_deref()));
            }
            other => return Err(Error::syntax(format!("Unexpected {other:?}"))),
        };
        Ok(QueryNode::new(kind))
    }

    fn attributes(&self, pair: Pair<'_, Rule>, attrs: &mut NodeAttrs) -> Result<()> {
        for attr in pair.into_inner() {
            let mut inner = attr.into_inner();
            let (Some(name), Some(value)) = (inner.next(), inner.next()) else {
                return Err(Error::syntax("Bad attribute"));
            };
            let mut value = value.as_str().trim().to_string();
            if let Some(param) = value.strip_prefix('$') {
                let bytes = self
                    .options
                    .params
                    .get(param)
                    .ok_or_else(|| Error::syntax(format!("No such parameter `{param}`")))?;
                value = String::from_utf8_lossy(bytes).into_owned();
            }
            apply_attribute(attrs, name.as_str(), &value)?;
        }
        Ok(())
    }

    fn knn(&self, pair: Pair<'_, Rule>) -> Result<KnnClause> {
        let mut k = None;
        let mut field = None;
        let mut blob = None;
        let mut attrs = NodeAttrs::default();
        for inner in pair.into_inner() {
            match inner.as_rule() {
                Rule::knn_k => {
                    let value = first(inner)?;
                    let raw = match value.as_rule() {
                        Rule::param => self.param_str(value)?,
                        _ => value.as_str().to_string(),
                    };
                    k = Some(
                        raw.parse::<usize>()
                            .map_err(|_| Error::bad_argument(format!("Invalid KNN k `{raw}`")))?,
                    );
                }
                Rule::knn_field => field = Some(unescape(first(inner)?.as_str())),
                Rule::param => blob = Some(self.param(inner)?),
                Rule::knn_arg => {
                    let mut parts = inner.into_inner();
                    let (Some(name), Some(value)) = (parts.next(), parts.next()) else {
                        return Err(Error::syntax("Bad KNN argument"));
                    };
                    let value = match value.as_rule() {
                        Rule::param => self.param_str(value)?,
                        _ => value.as_str().to_string(),
                    };
                    apply_attribute(&mut attrs, name.as_str(), &value)?;
                }
                Rule::knn_as => {
                    attrs.vector.yield_distance_as = Some(first(inner)?.as_str().to_string());
                }
                Rule::attributes => self.attributes(inner, &mut attrs)?,
                _ => {}
            }
        }
        if attrs.vector.epsilon.is_some() {
            return Err(Error::PolicyMismatch(
                "EPSILON is only valid for range queries".to_string(),
            ));
        }
        let vector: VectorAttrs = attrs.vector;
        if vector.batch_size.is_some() && vector.hybrid_policy == Some(HybridPolicy::AdhocBf) {
            return Err(Error::PolicyMismatch(
                "BATCH_SIZE is only valid with the BATCHES hybrid policy".to_string(),
            ));
        }
        Ok(KnnClause {
            k: k.ok_or_else(|| Error::syntax("KNN requires k"))?,
            field: field.ok_or_else(|| Error::syntax("KNN requires a field"))?,
            blob: blob.ok_or_else(|| Error::syntax("KNN requires a vector parameter"))?,
            attrs: vector,
        })
    }
}

fn apply_modifier(node: QueryNode, modifier: Option<&str>) -> QueryNode {
    match modifier {
        Some("-") => QueryNode::new(NodeKind::Not(Box::new(node))),
        Some("~") => QueryNode::new(NodeKind::Optional(Box::new(node))),
        _ => node,
    }
}

fn apply_attribute(attrs: &mut NodeAttrs, name: &str, value: &str) -> Result<()> {
    let bad = || Error::bad_argument(format!("Invalid value `{value}` for attribute {name}"));
    match name.to_ascii_lowercase().as_str() {
        "weight" => attrs.weight = parse_f64(value).filter(|w| *w >= 0.0).ok_or_else(bad)?,
        "slop" => attrs.slop = Some(value.parse().map_err(|_| bad())?),
        "inorder" => {
            attrs.in_order = Some(match value.to_ascii_lowercase().as_str() {
                "true" | "1" => true,
                "false" | "0" => false,
                _ => return Err(bad()),
            })
        }
        "ef_runtime" => attrs.vector.ef_runtime = Some(value.parse().map_err(|_| bad())?),
        "epsilon" => attrs.vector.epsilon = Some(parse_f64(value).filter(|e| *e > 0.0).ok_or_else(bad)?),
        "hybrid_policy" => attrs.vector.hybrid_policy = Some(HybridPolicy::parse(value)?),
        "batch_size" => {
            let size: usize = value.parse().map_err(|_| bad())?;
            if size == 0 {
                return Err(bad());
            }
            attrs.vector.batch_size = Some(size);
        }
        "yield_distance_as" => attrs.vector.yield_distance_as = Some(value.to_string()),
        _ => return Err(Error::syntax(format!("Unknown attribute `{name}`"))),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse2(text: &str) -> Result<ParsedQuery> {
        let params = HashMap::new();
        parse(text, ParseOptions { dialect: 2, params: &params })
    }

    fn with_params(text: &str, params: &[(&str, &[u8])]) -> Result<ParsedQuery> {
        let params: HashMap<String, Bytes> = params
            .iter()
            .map(|(k, v)| (k.to_string(), Bytes::copy_from_slice(v)))
            .collect();
        parse(text, ParseOptions { dialect: 2, params: &params })
    }

    fn text(node: &QueryNode) -> (TextOp, &str, Option<&Vec<String>>) {
        match &node.kind {
            NodeKind::Text { op, text, fields } => (*op, text.as_str(), fields.as_ref()),
            other => panic!("expected text node, got {other:?}"),
        }
    }

    #[test]
    fn test_intersection_and_union() {
        let q = parse2("hello world | foo").unwrap();
        let NodeKind::Or(branches) = &q.root.kind else {
            panic!("expected union");
        };
        assert_eq!(branches.len(), 2);
        assert!(matches!(&branches[0].kind, NodeKind::And(parts) if parts.len() == 2));
        assert_eq!(text(&branches[1]).1, "foo");
    }

    #[test]
    fn test_affixes_and_fuzzy() {
        let q = parse2("hel* *llo *ell* %helo% %%wrld%%").unwrap();
        let NodeKind::And(parts) = &q.root.kind else {
            panic!("expected intersection");
        };
        let ops: Vec<TextOp> = parts.iter().map(|p| text(p).0).collect();
        assert_eq!(
            ops,
            vec![TextOp::Prefix, TextOp::Suffix, TextOp::Infix, TextOp::Fuzzy(1), TextOp::Fuzzy(2)]
        );
        assert!(parse2("%%bad%").is_err());
    }

    #[test]
    fn test_field_scopes_and_modifiers() {
        let q = parse2("@title|body:(hello -world) ~@title:\"exact phrase\"").unwrap();
        let NodeKind::And(parts) = &q.root.kind else {
            panic!("expected intersection");
        };
        let NodeKind::And(scoped) = &parts[0].kind else {
            panic!("expected scoped group");
        };
        let (_, word, fields) = text(&scoped[0]);
        assert_eq!(word, "hello");
        assert_eq!(fields.unwrap(), &vec!["title".to_string(), "body".to_string()]);
        assert!(matches!(scoped[1].kind, NodeKind::Not(_)));
        let NodeKind::Optional(phrase) = &parts[1].kind else {
            panic!("expected optional");
        };
        assert_eq!(text(phrase).0, TextOp::Phrase);
        assert_eq!(text(phrase).1, "exact phrase");
    }

    #[test]
    fn test_numeric_tag_geo() {
        let q = parse2("@price:[(10 +inf] @color:{red | dark blue* } @loc:[-122.4 37.7 5 km]").unwrap();
        let NodeKind::And(parts) = &q.root.kind else {
            panic!("expected intersection");
        };
        let NodeKind::Numeric { range, .. } = &parts[0].kind else {
            panic!("expected numeric");
        };
        assert_eq!(range.min, 10.0);
        assert!(!range.min_inclusive);
        assert_eq!(range.max, f64::INFINITY);
        let NodeKind::Tag { values, .. } = &parts[1].kind else {
            panic!("expected tag");
        };
        assert_eq!(values[0].value, "red");
        assert_eq!(values[1].value, "dark blue");
        assert!(values[1].prefix);
        let NodeKind::Geo { filter, .. } = &parts[2].kind else {
            panic!("expected geo");
        };
        assert_eq!(filter.unit, GeoUnit::Kilometers);
        assert_eq!(filter.radius, 5.0);
    }

    #[test]
    fn test_knn_clause() {
        let q = with_params(
            "(@t:other)=>[KNN 10 @v $q HYBRID_POLICY ADHOC_BF EF_RUNTIME 50 AS dist]",
            &[("q", &[0u8; 8])],
        )
        .unwrap();
        let knn = q.knn.unwrap();
        assert_eq!(knn.k, 10);
        assert_eq!(knn.field, "v");
        assert_eq!(knn.blob.len(), 8);
        assert_eq!(knn.attrs.hybrid_policy, Some(HybridPolicy::AdhocBf));
        assert_eq!(knn.attrs.ef_runtime, Some(50));
        assert_eq!(knn.score_name(), "dist");
        assert!(matches!(q.root.kind, NodeKind::Text { .. }));
    }

    #[test]
    fn test_knn_policy_mismatch() {
        let err = with_params("*=>[KNN 3 @v $q EPSILON 0.1]", &[("q", &[0u8; 8])]).unwrap_err();
        assert!(matches!(err, Error::PolicyMismatch(_)));
        let err = with_params(
            "*=>[KNN 3 @v $q HYBRID_POLICY ADHOC_BF BATCH_SIZE 10]",
            &[("q", &[0u8; 8])],
        )
        .unwrap_err();
        assert!(matches!(err, Error::PolicyMismatch(_)));
    }

    #[test]
    fn test_vector_range_with_attributes() {
        let q = with_params(
            "@v:[VECTOR_RANGE 0.5 $q]=>{$yield_distance_as: d; $epsilon: 0.2}",
            &[("q", &[0u8; 8])],
        )
        .unwrap();
        let NodeKind::VectorRange { radius, .. } = &q.root.kind else {
            panic!("expected vector range");
        };
        assert_eq!(*radius, 0.5);
        assert_eq!(q.root.attrs.vector.epsilon, Some(0.2));
        let mut names = Vec::new();
        q.root.yielded_distances(&mut names);
        assert_eq!(names, vec![("v".to_string(), "d".to_string())]);
    }

    #[test]
    fn test_dialect_one_rejects_vectors_and_params() {
        let mut params = HashMap::new();
        params.insert("q".to_string(), Bytes::from_static(&[0u8; 8]));
        let opts = ParseOptions { dialect: 1, params: &params };
        assert!(parse("*=>[KNN 3 @v $q]", opts).is_err());
        assert!(parse("hello", opts).is_ok());
    }

    #[test]
    fn test_missing_param_and_syntax_errors() {
        assert!(matches!(parse2("@n:[$lo 5]"), Err(Error::Syntax(_))));
        assert!(matches!(parse2("(unclosed"), Err(Error::Syntax(_))));
        assert!(matches!(parse2(""), Err(Error::Syntax(_))));
    }

    #[test]
    fn test_weight_attribute() {
        let q = parse2("(hello)=>{$weight: 2.5; $slop: 1; $inorder: true}").unwrap();
        assert_eq!(q.root.attrs.weight, 2.5);
        assert_eq!(q.root.attrs.slop, Some(1));
        assert_eq!(q.root.attrs.in_order, Some(true));
    }
}
