//! Core types for hybridex

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Error, Result};

/// Dense internal document identifier. Zero is never assigned.
pub type DocId = u64;

/// Sentinel returned by exhausted iterators.
pub const DOCID_EOF: DocId = DocId::MAX;

/// Distance metric for vector attributes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum DistanceMetric {
    L2,
    Ip,
    Cosine,
}

impl DistanceMetric {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "L2" => Ok(DistanceMetric::L2),
            "IP" => Ok(DistanceMetric::Ip),
            "COSINE" => Ok(DistanceMetric::Cosine),
            other => Err(Error::bad_argument(format!(
                "Bad arguments for vector similarity HNSW index metric: {other}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DistanceMetric::L2 => "L2",
            DistanceMetric::Ip => "IP",
            DistanceMetric::Cosine => "COSINE",
        }
    }
}

/// Element type of stored vectors
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum VectorType {
    Float16,
    BFloat16,
    Float32,
    Float64,
    Int8,
    Uint8,
}

impl VectorType {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "FLOAT16" => Ok(VectorType::Float16),
            "BFLOAT16" => Ok(VectorType::BFloat16),
            "FLOAT32" => Ok(VectorType::Float32),
            "FLOAT64" => Ok(VectorType::Float64),
            "INT8" => Ok(VectorType::Int8),
            "UINT8" => Ok(VectorType::Uint8),
            other => Err(Error::UnsupportedType(format!("vector type {other}"))),
        }
    }

    /// Size in bytes of one element.
    pub fn size(&self) -> usize {
        match self {
            VectorType::Float16 | VectorType::BFloat16 => 2,
            VectorType::Float32 => 4,
            VectorType::Float64 => 8,
            VectorType::Int8 | VectorType::Uint8 => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VectorType::Float16 => "FLOAT16",
            VectorType::BFloat16 => "BFLOAT16",
            VectorType::Float32 => "FLOAT32",
            VectorType::Float64 => "FLOAT64",
            VectorType::Int8 => "INT8",
            VectorType::Uint8 => "UINT8",
        }
    }
}

/// What a query does when its deadline passes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutPolicy {
    /// Truncate and flag the reply with a warning
    #[default]
    Return,
    /// Raise a timeout error
    Fail,
}

impl TimeoutPolicy {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "return" => Ok(TimeoutPolicy::Return),
            "fail" => Ok(TimeoutPolicy::Fail),
            other => Err(Error::bad_argument(format!("unknown timeout policy: {other}"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeoutPolicy::Return => "return",
            TimeoutPolicy::Fail => "fail",
        }
    }
}

/// Source document kind for an index
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum DocumentKind {
    #[default]
    Hash,
    Json,
}

impl DocumentKind {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "HASH" => Ok(DocumentKind::Hash),
            "JSON" => Ok(DocumentKind::Json),
            other => Err(Error::bad_argument(format!("unknown index kind: {other}"))),
        }
    }
}

/// Value flowing through the result pipeline and expression evaluator
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Number(f64),
    String(String),
    Array(Vec<Value>),
}

impl Value {
    pub fn str(s: impl Into<String>) -> Self {
        Value::String(s.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric view: numbers pass through, numeric strings are parsed.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Number(n) => *n != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::Array(a) => !a.is_empty(),
        }
    }

    /// Total ordering used by sorters and min/max reducers: numbers sort
    /// numerically, strings lexically, nulls last.
    pub fn cmp_sort(&self, other: &Value) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Greater,
            (_, Value::Null) => Ordering::Less,
            (Value::Number(a), Value::Number(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (Value::Number(a), Value::String(s)) => match s.parse::<f64>() {
                Ok(b) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
                Err(_) => Ordering::Less,
            },
            (Value::String(s), Value::Number(b)) => match s.parse::<f64>() {
                Ok(a) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
                Err(_) => Ordering::Greater,
            },
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Array(a), Value::Array(b)) => a.len().cmp(&b.len()),
            (Value::Array(_), _) => Ordering::Greater,
            (_, Value::Array(_)) => Ordering::Less,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Number(n) => write!(f, "{}", format_number(*n)),
            Value::String(s) => f.write_str(s),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

/// Render a double the way replies do: integral values without a
/// fractional part, everything else with up to 17 significant digits.
pub fn format_number(n: f64) -> String {
    if n.is_infinite() {
        return if n > 0.0 { "inf".into() } else { "-inf".into() };
    }
    if n.is_nan() {
        return "nan".into();
    }
    if n.fract() == 0.0 && n.abs() < 1e17 {
        return format!("{}", n as i64);
    }
    let s = format!("{n}");
    if s.len() > 20 {
        format!("{n:.17e}")
    } else {
        s
    }
}

/// Parse a numeric token accepting `inf`, `+inf`, `-inf`.
pub fn parse_f64(s: &str) -> Option<f64> {
    match s.to_ascii_lowercase().as_str() {
        "inf" | "+inf" | "infinity" | "+infinity" => Some(f64::INFINITY),
        "-inf" | "-infinity" => Some(f64::NEG_INFINITY),
        other => other.parse::<f64>().ok().filter(|n| !n.is_nan()),
    }
}
