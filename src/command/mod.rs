//! Command surface shared by the TCP and HTTP front ends
//!
//! Commands are accepted with or without the `FT.` prefix. Replies are
//! built once as [`Reply`] trees and encoded per connection protocol.

pub mod codec;
pub mod reply;
pub mod server;

use bytes::Bytes;

use crate::args::ArgCursor;
use crate::engine::{AggregateResult, CursorPage, Engine, SearchResult};
use crate::query::request::SearchRequest;
use crate::runtime::TUNABLES;
use crate::types::Value;
use crate::{Error, Result};

pub use reply::{Protocol, Reply};

/// Per-connection state
#[derive(Debug, Clone, Copy, Default)]
pub struct Session {
    pub protocol: Protocol,
    /// Set once the client asked to close the connection
    pub closing: bool,
}

impl Session {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            closing: false,
        }
    }
}

/// Run one command, turning failures into error replies.
pub fn execute(engine: &Engine, session: &mut Session, args: &[Bytes]) -> Reply {
    match dispatch(engine, session, args) {
        Ok(reply) => reply,
        Err(e) => {
            tracing::debug!(error = %e, kind = e.kind_token(), "Command failed");
            Reply::error(&e)
        }
    }
}

pub fn dispatch(engine: &Engine, session: &mut Session, args: &[Bytes]) -> Result<Reply> {
    let mut cur = ArgCursor::new(args);
    let name = cur.next_str()?.to_ascii_uppercase();
    let command = name.strip_prefix("FT.").unwrap_or(&name);
    let resp3 = session.protocol == Protocol::Resp3;

    let reply = match command {
        "PING" => match cur.peek_str() {
            Some(msg) => Reply::bulk(msg),
            None => Reply::Simple("PONG".to_string()),
        },
        "QUIT" => {
            session.closing = true;
            Reply::ok()
        }
        "HELLO" => hello(session, &mut cur)?,
        "CONFIG" => config(engine, &mut cur, resp3)?,

        "HSET" => {
            let key = cur.next_string()?;
            let mut fields = Vec::new();
            while !cur.is_empty() {
                let field = cur.next_string()?;
                let value = cur
                    .next_bytes()
                    .map_err(|_| Error::bad_argument("wrong number of arguments for HSET"))?;
                fields.push((field, value.clone()));
            }
            if fields.is_empty() {
                return Err(Error::bad_argument("wrong number of arguments for HSET"));
            }
            Reply::Integer(engine.hset(&key, fields)? as i64)
        }
        "HGETALL" => {
            let key = cur.next_str()?;
            let fields = engine.hgetall(key).unwrap_or_default();
            Reply::Map(
                fields
                    .into_iter()
                    .map(|(k, v)| (Reply::bulk(k), Reply::Bulk(v)))
                    .collect(),
            )
        }
        "JSON.SET" => {
            let key = cur.next_str()?;
            let path = cur.next_str()?;
            let value = serde_json::from_str(cur.next_str()?)
                .map_err(|e| Error::bad_argument(format!("Invalid JSON: {e}")))?;
            engine.json_set(key, path, value)?;
            Reply::ok()
        }
        "DEL" if !name.starts_with("FT.") => {
            let keys = (0..cur.remaining())
                .map(|_| cur.next_string())
                .collect::<Result<Vec<_>>>()?;
            Reply::Integer(engine.del(&keys) as i64)
        }

        "CREATE" => {
            let index = cur.next_str()?;
            engine.create_index(index, &mut cur)?;
            Reply::ok()
        }
        "ALTER" => {
            let index = cur.next_str()?;
            engine.alter(index, &mut cur)?;
            Reply::ok()
        }
        "DROPINDEX" | "DROP" => {
            let index = cur.next_str()?;
            let dd = cur.eat("DD");
            engine.drop_index(index, dd)?;
            Reply::ok()
        }
        "ADD" => {
            let index = cur.next_str()?;
            Reply::Simple(engine.add(index, &mut cur)?.as_str().to_string())
        }
        "GET" => {
            let index = cur.next_str()?;
            let key = cur.next_str()?;
            match engine.get(index, key)? {
                Some(fields) => Reply::from_fields(&fields),
                None => Reply::Null,
            }
        }
        "DEL" => {
            let index = cur.next_str()?;
            let key = cur.next_str()?;
            let dd = cur.eat("DD");
            Reply::Integer(i64::from(engine.del_document(index, key, dd)?))
        }
        "_LIST" => Reply::Array(engine.list().into_iter().map(Reply::bulk).collect()),
        "TAGVALS" => {
            let index = cur.next_str()?;
            let field = cur.next_str()?;
            Reply::Array(engine.tag_values(index, field)?.into_iter().map(Reply::bulk).collect())
        }
        "INFO" => {
            let index = cur.next_str()?;
            Reply::from_json(&serde_json::to_value(engine.info(index)?)?)
        }
        "EXPLAIN" => {
            let index = cur.next_str()?;
            let query = cur.next_str()?;
            Reply::bulk(engine.explain(index, query, &mut cur)?)
        }

        "SEARCH" => {
            let index = cur.next_str()?;
            let query = cur.next_str()?;
            let request = SearchRequest::parse(query, &mut cur)?;
            let result = engine.execute_search(index, &request, None)?;
            search_reply(&result, &request, resp3)
        }
        "AGGREGATE" => {
            let index = cur.next_str()?;
            let query = cur.next_str()?;
            aggregate_reply(&engine.aggregate(index, query, &mut cur)?, resp3)
        }
        "CURSOR" => {
            let sub = cur.next_str()?.to_ascii_uppercase();
            let index = cur.next_str()?;
            let id = cur.next_u64("cursor id")?;
            match sub.as_str() {
                "READ" => {
                    let count = if cur.eat("COUNT") {
                        Some(cur.next_usize("COUNT")?)
                    } else {
                        None
                    };
                    cursor_reply(&engine.cursor_read(index, id, count)?, resp3)
                }
                "DEL" => {
                    engine.cursor_del(index, id)?;
                    Reply::ok()
                }
                other => return Err(Error::bad_argument(format!("Unknown CURSOR subcommand `{other}`"))),
            }
        }
        _ => return Err(Error::bad_argument(format!("Unknown command `{name}`"))),
    };
    Ok(reply)
}

fn hello(session: &mut Session, cur: &mut ArgCursor<'_>) -> Result<Reply> {
    if !cur.is_empty() {
        let version = cur.next_u64("protocol version")?;
        session.protocol = Protocol::from_version(version)
            .ok_or_else(|| Error::bad_argument(format!("Unsupported protocol version {version}")))?;
    }
    Ok(Reply::map([
        ("server", Reply::bulk(env!("CARGO_PKG_NAME"))),
        ("version", Reply::bulk(env!("CARGO_PKG_VERSION"))),
        ("proto", Reply::Integer(i64::from(session.protocol.version()))),
        ("mode", Reply::bulk("standalone")),
    ]))
}

fn config(engine: &Engine, cur: &mut ArgCursor<'_>, resp3: bool) -> Result<Reply> {
    let sub = cur.next_str()?.to_ascii_uppercase();
    match sub.as_str() {
        "GET" => {
            let pattern = cur.next_str()?;
            let names: Vec<&str> = if pattern == "*" {
                TUNABLES.to_vec()
            } else {
                vec![pattern]
            };
            let runtime = engine.runtime();
            let mut pairs = Vec::with_capacity(names.len());
            for name in names {
                pairs.push((name.to_ascii_uppercase(), Reply::bulk(runtime.get(name)?)));
            }
            Ok(if resp3 {
                Reply::map(pairs)
            } else {
                Reply::Array(
                    pairs
                        .into_iter()
                        .map(|(k, v)| Reply::Array(vec![Reply::bulk(k), v]))
                        .collect(),
                )
            })
        }
        "SET" => {
            let name = cur.next_str()?;
            let value = cur.next_str()?;
            engine.config_set(name, value)?;
            Ok(Reply::ok())
        }
        other => Err(Error::bad_argument(format!("Unknown CONFIG subcommand `{other}`"))),
    }
}

fn warnings(list: &[String]) -> Reply {
    Reply::Array(list.iter().map(|w| Reply::bulk(w.as_str())).collect())
}

fn search_reply(result: &SearchResult, request: &SearchRequest, resp3: bool) -> Reply {
    let SearchRequest {
        with_scores,
        with_payloads,
        with_sort_keys,
        no_content,
        ..
    } = *request;
    if resp3 {
        let results = result
            .hits
            .iter()
            .map(|hit| {
                let mut entry = vec![("id", Reply::bulk(hit.key.as_str()))];
                if with_scores {
                    entry.push(("score", Reply::Double(hit.score)));
                }
                if with_payloads {
                    entry.push(("payload", hit.payload.clone().map_or(Reply::Null, Reply::bulk)));
                }
                if with_sort_keys {
                    entry.push(("sortkey", Reply::Array(hit.sort_keys.iter().map(Reply::from_value).collect())));
                }
                if !no_content {
                    entry.push((
                        "extra_attributes",
                        Reply::Map(
                            hit.fields
                                .iter()
                                .map(|(k, v)| (Reply::bulk(k.as_str()), Reply::from_value(v)))
                                .collect(),
                        ),
                    ));
                }
                Reply::map(entry)
            })
            .collect();
        let mut reply = vec![
            ("total_results", Reply::Integer(result.total as i64)),
            ("results", Reply::Array(results)),
            ("warning", warnings(&result.warnings)),
            ("error", Reply::Array(Vec::new())),
        ];
        if let Some(report) = &result.hybrid {
            reply.push(("hybrid_mode", Reply::bulk(report.final_mode.as_str())));
        }
        return Reply::map(reply);
    }

    let mut out = vec![Reply::Integer(result.total as i64)];
    for hit in &result.hits {
        out.push(Reply::bulk(hit.key.as_str()));
        if with_scores {
            out.push(Reply::Double(hit.score));
        }
        if with_payloads {
            out.push(hit.payload.clone().map_or(Reply::Null, Reply::bulk));
        }
        if with_sort_keys {
            out.push(match hit.sort_keys.first() {
                Some(key) => Reply::from_value(key),
                None => Reply::Null,
            });
        }
        if !no_content {
            out.push(Reply::from_fields(&hit.fields));
        }
    }
    Reply::Array(out)
}

fn rows_reply(total: usize, rows: &[Vec<(String, Value)>], list: &[String], resp3: bool) -> Reply {
    if resp3 {
        let results = rows
            .iter()
            .map(|row| {
                Reply::map([(
                    "extra_attributes",
                    Reply::Map(
                        row.iter()
                            .map(|(k, v)| (Reply::bulk(k.as_str()), Reply::from_value(v)))
                            .collect(),
                    ),
                )])
            })
            .collect();
        return Reply::map([
            ("total_results", Reply::Integer(total as i64)),
            ("results", Reply::Array(results)),
            ("warning", warnings(list)),
            ("error", Reply::Array(Vec::new())),
        ]);
    }
    let mut out = Vec::with_capacity(rows.len() + 1);
    out.push(Reply::Integer(total as i64));
    out.extend(rows.iter().map(|row| Reply::from_fields(row)));
    Reply::Array(out)
}

fn aggregate_reply(result: &AggregateResult, resp3: bool) -> Reply {
    let body = rows_reply(result.total, &result.rows, &result.warnings, resp3);
    match result.cursor_id {
        Some(id) => Reply::Array(vec![body, Reply::Integer(id as i64)]),
        None => body,
    }
}

fn cursor_reply(page: &CursorPage, resp3: bool) -> Reply {
    let body = rows_reply(page.total, &page.rows, &page.warnings, resp3);
    Reply::Array(vec![body, Reply::Integer(page.cursor_id as i64)])
}
