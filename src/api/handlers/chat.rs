//! Chat handlers: synchronous and SSE streaming.

use std::convert::Infallible;

use axum::{
    Json,
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::Stream;
use log::warn;
use tokio_stream::{StreamExt, wrappers::ReceiverStream};

use super::super::error::ApiResult;
use super::super::state::AppState;
use crate::session::{ChatRequest, ChatResponse};

/// POST /api/v1/chat — run the turn to completion, return the accumulated
/// response.
pub async fn chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> ApiResult<Json<ChatResponse>> {
    let response = state
        .sessions
        .chat(&request.session_id, &request.message)
        .await?;
    Ok(Json(response))
}

/// POST /api/v1/chat/stream — stream translated records as SSE. Errors
/// before the stream starts map to regular status codes; once headers are
/// flushed, failures appear as in-stream error records. If the client drops
/// the connection the turn still runs to completion server-side.
pub async fn chat_stream(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let records = state
        .sessions
        .chat_stream(&request.session_id, &request.message)
        .await?;

    let stream = ReceiverStream::new(records).map(|record| {
        let payload = serde_json::to_string(&record).unwrap_or_else(|err| {
            warn!("serializing stream record: {err}");
            r#"{"type":"error","kind":"internal","detail":"serialization failure"}"#.to_string()
        });
        Ok(Event::default().data(payload))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
