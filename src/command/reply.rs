//! Command replies and their wire encodings

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value as JsonValue;

use crate::types::{format_number, Value};
use crate::Error;

/// Reply shape negotiated with `HELLO`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    #[default]
    Resp2,
    Resp3,
}

impl Protocol {
    pub fn from_version(version: u64) -> Option<Self> {
        match version {
            2 => Some(Protocol::Resp2),
            3 => Some(Protocol::Resp3),
            _ => None,
        }
    }

    pub fn version(&self) -> u8 {
        match self {
            Protocol::Resp2 => 2,
            Protocol::Resp3 => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Simple(String),
    Error(String),
    Integer(i64),
    Double(f64),
    Bulk(Bytes),
    Null,
    Array(Vec<Reply>),
    /// Key/value pairs; a flat array under RESP2
    Map(Vec<(Reply, Reply)>),
}

impl Reply {
    pub fn ok() -> Self {
        Reply::Simple("OK".to_string())
    }

    pub fn bulk(s: impl Into<String>) -> Self {
        Reply::Bulk(Bytes::from(s.into()))
    }

    /// `<KIND> <message>`, so clients can branch on the first word.
    pub fn error(err: &Error) -> Self {
        Reply::Error(format!("{} {}", err.kind_token(), err))
    }

    pub fn map<K: Into<String>>(pairs: impl IntoIterator<Item = (K, Reply)>) -> Self {
        Reply::Map(pairs.into_iter().map(|(k, v)| (Reply::bulk(k), v)).collect())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Null => Reply::Null,
            Value::Number(n) => Reply::bulk(format_number(*n)),
            Value::String(s) => Reply::bulk(s.as_str()),
            Value::Array(items) => Reply::Array(items.iter().map(Reply::from_value).collect()),
        }
    }

    /// Flat `field, value, …` list of a row.
    pub fn from_fields(fields: &[(String, Value)]) -> Self {
        Reply::Array(
            fields
                .iter()
                .flat_map(|(k, v)| [Reply::bulk(k.as_str()), Reply::from_value(v)])
                .collect(),
        )
    }

    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => Reply::Null,
            JsonValue::Bool(b) => Reply::Integer(i64::from(*b)),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Reply::Integer(i),
                None => Reply::Double(n.as_f64().unwrap_or(f64::NAN)),
            },
            JsonValue::String(s) => Reply::bulk(s.as_str()),
            JsonValue::Array(items) => Reply::Array(items.iter().map(Reply::from_json).collect()),
            JsonValue::Object(entries) => Reply::Map(
                entries
                    .iter()
                    .map(|(k, v)| (Reply::bulk(k.as_str()), Reply::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// JSON rendering for the HTTP surface. Maps with string keys become
    /// objects; bulk strings that are not UTF-8 are rendered lossily.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Reply::Simple(s) => JsonValue::String(s.clone()),
            Reply::Error(e) => serde_json::json!({ "error": e }),
            Reply::Integer(i) => JsonValue::from(*i),
            Reply::Double(d) => serde_json::Number::from_f64(*d)
                .map(JsonValue::Number)
                .unwrap_or_else(|| JsonValue::String(format_number(*d))),
            Reply::Bulk(b) => JsonValue::String(String::from_utf8_lossy(b).into_owned()),
            Reply::Null => JsonValue::Null,
            Reply::Array(items) => JsonValue::Array(items.iter().map(Reply::to_json).collect()),
            Reply::Map(pairs) => {
                let mut object = serde_json::Map::with_capacity(pairs.len());
                for (k, v) in pairs {
                    let key = match k.to_json() {
                        JsonValue::String(s) => s,
                        other => other.to_string(),
                    };
                    object.insert(key, v.to_json());
                }
                JsonValue::Object(object)
            }
        }
    }

    pub fn encode(&self, protocol: Protocol, out: &mut BytesMut) {
        match self {
            Reply::Simple(s) => {
                out.put_u8(b'+');
                put_line(out, s.replace(['\r', '\n'], " ").as_bytes());
            }
            Reply::Error(e) => {
                out.put_u8(b'-');
                put_line(out, e.replace(['\r', '\n'], " ").as_bytes());
            }
            Reply::Integer(i) => {
                out.put_u8(b':');
                put_line(out, i.to_string().as_bytes());
            }
            Reply::Double(d) => match protocol {
                Protocol::Resp2 => Reply::bulk(format_number(*d)).encode(protocol, out),
                Protocol::Resp3 => {
                    out.put_u8(b',');
                    let text = if d.is_nan() {
                        "nan".to_string()
                    } else if d.is_infinite() {
                        if *d > 0.0 { "inf" } else { "-inf" }.to_string()
                    } else {
                        format_number(*d)
                    };
                    put_line(out, text.as_bytes());
                }
            },
            Reply::Bulk(b) => {
                out.put_u8(b'$');
                put_line(out, b.len().to_string().as_bytes());
                put_line(out, b);
            }
            Reply::Null => match protocol {
                Protocol::Resp2 => out.put_slice(b"$-1\r\n"),
                Protocol::Resp3 => out.put_slice(b"_\r\n"),
            },
            Reply::Array(items) => {
                out.put_u8(b'*');
                put_line(out, items.len().to_string().as_bytes());
                for item in items {
                    item.encode(protocol, out);
                }
            }
            Reply::Map(pairs) => {
                match protocol {
                    Protocol::Resp2 => {
                        out.put_u8(b'*');
                        put_line(out, (pairs.len() * 2).to_string().as_bytes());
                    }
                    Protocol::Resp3 => {
                        out.put_u8(b'%');
                        put_line(out, pairs.len().to_string().as_bytes());
                    }
                }
                for (k, v) in pairs {
                    k.encode(protocol, out);
                    v.encode(protocol, out);
                }
            }
        }
    }

    pub fn to_bytes(&self, protocol: Protocol) -> Bytes {
        let mut out = BytesMut::new();
        self.encode(protocol, &mut out);
        out.freeze()
    }
}

fn put_line(out: &mut BytesMut, data: &[u8]) {
    out.put_slice(data);
    out.put_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_flattens_under_resp2() {
        let reply = Reply::map([("a", Reply::Integer(1))]);
        assert_eq!(&reply.to_bytes(Protocol::Resp2)[..], b"*2\r\n$1\r\na\r\n:1\r\n");
        assert_eq!(&reply.to_bytes(Protocol::Resp3)[..], b"%1\r\n$1\r\na\r\n:1\r\n");
    }

    #[test]
    fn test_null_and_double_per_protocol() {
        assert_eq!(&Reply::Null.to_bytes(Protocol::Resp2)[..], b"$-1\r\n");
        assert_eq!(&Reply::Null.to_bytes(Protocol::Resp3)[..], b"_\r\n");
        assert_eq!(&Reply::Double(1.5).to_bytes(Protocol::Resp2)[..], b"$3\r\n1.5\r\n");
        assert_eq!(&Reply::Double(1.5).to_bytes(Protocol::Resp3)[..], b",1.5\r\n");
    }

    #[test]
    fn test_error_leads_with_kind() {
        let reply = Reply::error(&Error::UnknownIndex("idx".into()));
        assert_eq!(reply, Reply::Error("NOINDEX Unknown index name: idx".into()));
    }

    #[test]
    fn test_json_rendering() {
        let reply = Reply::map([
            ("total", Reply::Integer(2)),
            ("ids", Reply::Array(vec![Reply::bulk("a"), Reply::Null])),
        ]);
        assert_eq!(reply.to_json(), serde_json::json!({"total": 2, "ids": ["a", null]}));
    }
}
