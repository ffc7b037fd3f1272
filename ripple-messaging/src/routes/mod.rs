pub mod health;
pub mod messages;
pub mod rooms;
pub mod stream;
pub mod sync;
pub mod tokens;

use serde::Serialize;
use uuid::Uuid;

use ripple_shared::types::PaginationMeta;
use ripple_shared::{AppError, AppResult};

use crate::domain::Room;
use crate::events::{ChatEvent, ChatEventKind};
use crate::AppState;

/// Paged collection envelope shared by list endpoints.
#[derive(Debug, Serialize)]
pub struct ListResponse<T: Serialize> {
    pub items: Vec<T>,
    pub meta: PaginationMeta,
}

/// Push-notification topic for a room.
pub fn room_topic(room_id: Uuid) -> String {
    format!("room-{room_id}")
}

/// Queue a chat event for durable publication on behalf of `dispatch_user`.
pub fn publish_chat_event(state: &AppState, dispatch_user: Uuid, room_id: Uuid, kind: ChatEventKind) {
    tracing::info!(
        room_id = %room_id,
        dispatch_user = %dispatch_user,
        event = ?std::mem::discriminant(&kind),
        "dispatching chat event"
    );
    state
        .dispatcher
        .dispatch_event(dispatch_user, ChatEvent::new(room_id, kind));
}

/// Load a room as seen by `user_id`; a room the user cannot see is
/// indistinguishable from a missing one.
pub async fn load_room(
    state: &AppState,
    user_id: Uuid,
    room_id: Uuid,
    load_all: bool,
    use_cache: bool,
) -> AppResult<Room> {
    state
        .repository
        .get_room(user_id, room_id, load_all, use_cache)
        .await?
        .ok_or_else(|| AppError::not_found("room not found"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_topic_format() {
        let id = Uuid::nil();
        assert_eq!(room_topic(id), format!("room-{id}"));
    }
}
