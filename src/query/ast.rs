//! Parsed query tree

use bytes::Bytes;

use crate::index::geo::GeoFilter;
use crate::index::geoshape::{Shape, ShapeOp};
use crate::index::numeric::NumericRange;
use crate::index::tag::TagQuery;
use crate::{Error, Result};

/// Text match flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextOp {
    Term,
    Prefix,
    Suffix,
    Infix,
    /// Levenshtein distance 1..=3
    Fuzzy(u32),
    Phrase,
}

/// Hybrid execution strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HybridPolicy {
    AdhocBf,
    Batches,
}

impl HybridPolicy {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "ADHOC_BF" => Ok(HybridPolicy::AdhocBf),
            "BATCHES" => Ok(HybridPolicy::Batches),
            other => Err(Error::bad_argument(format!("invalid hybrid policy {other}"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HybridPolicy::AdhocBf => "ADHOC_BF",
            HybridPolicy::Batches => "BATCHES",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VectorAttrs {
    pub ef_runtime: Option<usize>,
    pub epsilon: Option<f64>,
    pub hybrid_policy: Option<HybridPolicy>,
    pub batch_size: Option<usize>,
    pub yield_distance_as: Option<String>,
}

/// `=>{$name: value; ...}` attributes
#[derive(Debug, Clone, PartialEq)]
pub struct NodeAttrs {
    pub weight: f64,
    pub slop: Option<u32>,
    pub in_order: Option<bool>,
    pub vector: VectorAttrs,
}

impl Default for NodeAttrs {
    fn default() -> Self {
        Self {
            weight: 1.0,
            slop: None,
            in_order: None,
            vector: VectorAttrs::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Wildcard,
    /// Matches nothing (e.g. a term that analyzed to stopwords only)
    Empty,
    Text {
        op: TextOp,
        text: String,
        /// Field scope; None means every text field
        fields: Option<Vec<String>>,
    },
    And(Vec<QueryNode>),
    Or(Vec<QueryNode>),
    Not(Box<QueryNode>),
    Optional(Box<QueryNode>),
    Numeric {
        field: String,
        range: NumericRange,
    },
    Tag {
        field: String,
        values: Vec<TagQuery>,
    },
    Geo {
        field: String,
        filter: GeoFilter,
    },
    Shape {
        field: String,
        op: ShapeOp,
        shape: Shape,
    },
    VectorRange {
        field: String,
        radius: f64,
        blob: Bytes,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryNode {
    pub kind: NodeKind,
    pub attrs: NodeAttrs,
}

impl QueryNode {
    pub fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            attrs: NodeAttrs::default(),
        }
    }

    /// Restrict unscoped text leaves to `fields`.
    pub fn scope(&mut self, scope: &[String]) {
        match &mut self.kind {
            NodeKind::Text { fields, .. } if fields.is_none() => {
                *fields = Some(scope.to_vec());
            }
            NodeKind::And(children) | NodeKind::Or(children) => {
                for child in children {
                    child.scope(scope);
                }
            }
            NodeKind::Not(child) | NodeKind::Optional(child) => child.scope(scope),
            _ => {}
        }
    }

    /// Whether any vector range leaf appears in the tree.
    pub fn has_vector(&self) -> bool {
        match &self.kind {
            NodeKind::VectorRange { .. } => true,
            NodeKind::And(children) | NodeKind::Or(children) => children.iter().any(|c| c.has_vector()),
            NodeKind::Not(child) | NodeKind::Optional(child) => child.has_vector(),
            _ => false,
        }
    }

    /// Names under which vector range distances are exposed.
    pub fn yielded_distances(&self, out: &mut Vec<(String, String)>) {
        match &self.kind {
            NodeKind::VectorRange { field, .. } => {
                let name = self
                    .attrs
                    .vector
                    .yield_distance_as
                    .clone()
                    .unwrap_or_else(|| format!("__{field}_score"));
                out.push((field.clone(), name));
            }
            NodeKind::And(children) | NodeKind::Or(children) => {
                for child in children {
                    child.yielded_distances(out);
                }
            }
            NodeKind::Not(child) | NodeKind::Optional(child) => child.yielded_distances(out),
            _ => {}
        }
    }

    /// Every field name the tree references.
    pub fn referenced_fields(&self, out: &mut Vec<String>) {
        match &self.kind {
            NodeKind::Text {
                fields: Some(fields),
                ..
            } => out.extend(fields.iter().cloned()),
            NodeKind::Numeric { field, .. }
            | NodeKind::Tag { field, .. }
            | NodeKind::Geo { field, .. }
            | NodeKind::Shape { field, .. }
            | NodeKind::VectorRange { field, .. } => out.push(field.clone()),
            NodeKind::And(children) | NodeKind::Or(children) => {
                for child in children {
                    child.referenced_fields(out);
                }
            }
            NodeKind::Not(child) | NodeKind::Optional(child) => child.referenced_fields(out),
            _ => {}
        }
    }
}

/// `=>[KNN k @field $blob ...]`
#[derive(Debug, Clone, PartialEq)]
pub struct KnnClause {
    pub k: usize,
    pub field: String,
    pub blob: Bytes,
    pub attrs: VectorAttrs,
}

impl KnnClause {
    pub fn score_name(&self) -> String {
        self.attrs
            .yield_distance_as
            .clone()
            .unwrap_or_else(|| format!("__{}_score", self.field))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedQuery {
    pub root: QueryNode,
    pub knn: Option<KnnClause>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(t: &str) -> QueryNode {
        QueryNode::new(NodeKind::Text {
            op: TextOp::Term,
            text: t.to_string(),
            fields: None,
        })
    }

    #[test]
    fn test_scope_applies_only_to_unscoped_leaves() {
        let mut scoped = text("b");
        scoped.scope(&["body".to_string()]);
        let mut node = QueryNode::new(NodeKind::And(vec![text("a"), scoped]));
        node.scope(&["title".to_string()]);
        let mut fields = Vec::new();
        node.referenced_fields(&mut fields);
        assert_eq!(fields, vec!["title".to_string(), "body".to_string()]);
    }

    #[test]
    fn test_knn_default_score_name() {
        let knn = KnnClause {
            k: 3,
            field: "v".into(),
            blob: Bytes::new(),
            attrs: VectorAttrs::default(),
        };
        assert_eq!(knn.score_name(), "__v_score");
    }
}
