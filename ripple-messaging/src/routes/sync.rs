use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use ripple_shared::types::api::ApiResponse;
use ripple_shared::types::auth::AuthSession;
use ripple_shared::AppResult;

use crate::domain::{MessageData, Room};
use crate::repository::{MessageHistoryFilter, RoomFilter};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct InitialSyncQuery {
    pub last_sync_timestamp: Option<DateTime<Utc>>,
    #[serde(default = "default_messages_per_room")]
    pub messages_per_room: u32,
}

fn default_messages_per_room() -> u32 {
    20
}

#[derive(Debug, Serialize)]
pub struct SyncSummary {
    pub rooms_synced: u32,
    pub rooms_deleted: u32,
    pub messages_synced: u32,
    pub sync_duration_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct InitialSyncResponse {
    pub rooms: Vec<Room>,
    pub rooms_deleted: Vec<Uuid>,
    pub messages: Vec<MessageData>,
    pub sync_timestamp: DateTime<Utc>,
    pub summary: SyncSummary,
}

/// GET /chat/sync
///
/// Delta catch-up after a disconnect: rooms that changed since the client's
/// last sync, rooms it lost access to, and the freshest N messages per
/// changed room, stamped with a new server timestamp for the next round.
pub async fn initial_sync(
    session: AuthSession,
    State(state): State<Arc<AppState>>,
    Query(query): Query<InitialSyncQuery>,
) -> AppResult<Json<ApiResponse<InitialSyncResponse>>> {
    let user_id = session.user_id;
    let started = Instant::now();
    let sync_timestamp = Utc::now();

    let (rooms, _) = state
        .repository
        .get_room_list(
            user_id,
            &RoomFilter {
                since: query.last_sync_timestamp,
                ..RoomFilter::default()
            },
        )
        .await?;

    let rooms_deleted = state
        .repository
        .get_room_list_deleted(user_id, query.last_sync_timestamp)
        .await?;

    let (messages, _) = state
        .repository
        .get_messages_from_room(
            user_id,
            &MessageHistoryFilter {
                after_date: query.last_sync_timestamp,
                messages_per_room: query.messages_per_room,
                ..MessageHistoryFilter::default()
            },
        )
        .await?;

    let summary = SyncSummary {
        rooms_synced: rooms.len() as u32,
        rooms_deleted: rooms_deleted.len() as u32,
        messages_synced: messages.len() as u32,
        sync_duration_ms: started.elapsed().as_millis() as u64,
    };

    tracing::debug!(
        user_id = %user_id,
        rooms = summary.rooms_synced,
        deleted = summary.rooms_deleted,
        messages = summary.messages_synced,
        duration_ms = summary.sync_duration_ms,
        "initial sync served"
    );

    Ok(Json(ApiResponse::ok(InitialSyncResponse {
        rooms,
        rooms_deleted,
        messages,
        sync_timestamp,
        summary,
    })))
}
