use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use futures::stream::Stream;
use serde::Deserialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use ripple_shared::types::auth::{AuthSession, GeneralParams};
use ripple_shared::{AppError, AppResult, ErrorCode};

use crate::events::stream::StreamSession;
use crate::AppState;

const OUTBOUND_BUFFER: usize = 64;

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// Scope the subscription to one room instead of every visible room.
    pub room_id: Option<Uuid>,
}

/// GET /chat/stream -- the server-streaming connection.
///
/// The session task subscribes durable consumers (direct + per room),
/// mutates the set on join/leave events and feeds this SSE response until
/// the client goes away.
pub async fn stream_messages(
    session: AuthSession,
    params: GeneralParams,
    State(state): State<Arc<AppState>>,
    Query(query): Query<StreamQuery>,
) -> AppResult<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>> {
    let client_id = params
        .client_id
        .ok_or_else(|| AppError::new(ErrorCode::ClientIdRequired, "client id is required"))?;

    let (tx, mut rx) = mpsc::channel(OUTBOUND_BUFFER);

    let stream_session = StreamSession {
        broker: state.broker.clone(),
        repository: state.repository.clone(),
        manager: state.stream_manager.clone(),
        user_id: session.user_id,
        client_id: client_id.clone(),
        out: tx,
    };

    tracing::info!(user_id = %session.user_id, client_id = %client_id, "stream connection accepted");

    tokio::spawn(async move {
        if let Err(e) = stream_session.run(query.room_id).await {
            tracing::error!(error = %e, "stream session ended with error");
        }
    });

    let stream = async_stream::stream! {
        while let Some(event) = rx.recv().await {
            match SseEvent::default().json_data(&event) {
                Ok(sse_event) => yield Ok(sse_event),
                Err(e) => tracing::warn!(error = %e, "failed to serialize stream event"),
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    ))
}
