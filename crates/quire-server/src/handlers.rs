//! HTTP handlers for chats, turns and the turn event stream.

use std::convert::Infallible;
use std::sync::Arc;

use async_stream::stream;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures::Stream;
use serde::Deserialize;
use tracing::{debug, info, warn};

use quire_core::{ClientId, TurnEvent, TurnId};
use quire_engine::TurnExecutor;

use crate::error::ServerError;
use crate::server::AppState;
use crate::service::CreateTurnRequest;

pub const STREAM_NOT_ACTIVE: &str = "streaming not active for this turn";

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "active_turns": state.service.registry().count(),
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateChatBody {
    #[serde(default)]
    pub title: Option<String>,
}

pub async fn create_chat(
    State(state): State<AppState>,
    Json(body): Json<CreateChatBody>,
) -> Result<impl IntoResponse, ServerError> {
    let chat = state.service.create_chat(body.title.as_deref())?;
    Ok((StatusCode::CREATED, Json(chat)))
}

#[derive(Debug, Deserialize)]
pub struct ListChatsQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 {
    50
}

pub async fn list_chats(
    State(state): State<AppState>,
    Query(query): Query<ListChatsQuery>,
) -> Result<impl IntoResponse, ServerError> {
    let chats = state.service.list_chats(query.limit.min(200), query.offset)?;
    Ok(Json(chats))
}

pub async fn create_turn(
    State(state): State<AppState>,
    Json(body): Json<CreateTurnRequest>,
) -> Result<impl IntoResponse, ServerError> {
    let resp = state.service.create_turn(body)?;
    Ok((StatusCode::CREATED, Json(resp)))
}

pub async fn get_turn(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    Ok(Json(state.service.get_turn(&TurnId::from_raw(id))?))
}

pub async fn turn_blocks(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    Ok(Json(state.service.turn_blocks(&TurnId::from_raw(id))?))
}

pub async fn interrupt_turn(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    let turn_id = TurnId::from_raw(id);
    let status = state.service.interrupt_turn(&turn_id)?;
    Ok(Json(serde_json::json!({
        "success": true,
        "turn_id": turn_id,
        "status": status,
    })))
}

/// Server-sent event stream of a turn: catch-up first, then live events
/// until the turn ends or the client goes away.
pub async fn stream_turn(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let turn_id = TurnId::from_raw(id);
    let executor = state.service.executor(&turn_id);
    if executor.is_none() {
        warn!(turn_id = %turn_id, "no executor for stream request");
    }

    let events = stream! {
        let Some(executor) = executor else {
            let event = TurnEvent::TurnError {
                turn_id,
                error: STREAM_NOT_ACTIVE.into(),
                is_cancelled: false,
                last_block_index: None,
            };
            yield Ok(to_sse(&event));
            return;
        };

        let client_id = ClientId::new();
        let mut rx = match executor.connect(client_id.clone()) {
            Ok(rx) => rx,
            Err(e) => {
                warn!(turn_id = %turn_id, client_id = %client_id, error = %e, "catch-up failed, closing stream");
                let event = TurnEvent::TurnError {
                    turn_id,
                    error: e.to_string(),
                    is_cancelled: false,
                    last_block_index: None,
                };
                yield Ok(to_sse(&event));
                return;
            }
        };
        info!(turn_id = %turn_id, client_id = %client_id, "stream client connected");
        let _guard = ClientGuard { executor, client_id };

        while let Some(event) = rx.recv().await {
            yield Ok(to_sse(&event));
        }
        debug!(turn_id = %turn_id, "stream finished");
    };

    Sse::new(events).keep_alive(KeepAlive::new().interval(state.keep_alive).text("keepalive"))
}

fn to_sse(event: &TurnEvent) -> Event {
    let payload = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Event::default().event(event.event_type()).data(payload)
}

/// Detaches the subscriber when the response stream is dropped, which is
/// how a client disconnect shows up.
struct ClientGuard {
    executor: Arc<TurnExecutor>,
    client_id: ClientId,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.executor.remove_client(&self.client_id);
        debug!(turn_id = %self.executor.turn_id(), client_id = %self.client_id, "stream client removed");
    }
}
