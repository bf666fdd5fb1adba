//! API handlers

use axum::{extract::State, http::StatusCode, Json};
use bytes::Bytes;
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use std::time::Instant;

use crate::api::AppState;
use crate::command::{self, Protocol, Session};
use crate::Error;

/// Health check with engine status
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        indexes: state.engine.list().len(),
        documents: state.engine.store().len(),
        uptime_secs: state.started.elapsed().as_secs(),
    })
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub indexes: usize,
    pub documents: usize,
    pub uptime_secs: u64,
}

fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::UnknownIndex(_) | Error::CursorNotFound(_) => StatusCode::NOT_FOUND,
        Error::IndexExists(_) => StatusCode::CONFLICT,
        Error::Timeout => StatusCode::GATEWAY_TIMEOUT,
        Error::OutOfMemory => StatusCode::SERVICE_UNAVAILABLE,
        Error::Io(_) | Error::Serialization(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    }
}

/// Run one command given as a JSON array of tokens
///
/// Replies use the structured (RESP3) shapes rendered as JSON.
pub async fn command(
    State(state): State<AppState>,
    Json(tokens): Json<Vec<String>>,
) -> Result<Json<JsonValue>, (StatusCode, Json<JsonValue>)> {
    if tokens.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "BADARGS", "message": "Empty command" })),
        ));
    }

    let start = Instant::now();
    let args: Vec<Bytes> = tokens.into_iter().map(Bytes::from).collect();
    let engine = state.engine.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        let mut session = Session::new(Protocol::Resp3);
        command::dispatch(&engine, &mut session, &args)
    })
    .await
    .map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "ERR", "message": e.to_string() })),
        )
    })?;

    match outcome {
        Ok(reply) => {
            tracing::debug!(took_ms = start.elapsed().as_millis() as u64, "HTTP command finished");
            Ok(Json(json!({ "result": reply.to_json() })))
        }
        Err(e) => Err((
            status_for(&e),
            Json(json!({ "error": e.kind_token(), "message": e.to_string() })),
        )),
    }
}
