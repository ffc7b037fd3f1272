//! Chat event model: the typed event union, subject naming and the broker
//! envelope.
//!
//! Room-scoped events travel on `CHAT_EVENTS.<roomId>`. `RoomJoin` is the
//! exception: it goes to the joined user's `CHAT_DIRECT_EVENTS.<userId>`
//! subject so a freshly added user receives it on their always-on direct
//! consumer before any per-room consumer exists.

pub mod dispatcher;
pub mod stream;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{MessageData, MessageStatus, Room};

pub const STREAM_NAME: &str = "CHAT_EVENTS";
pub const DIRECT_SUBJECT_PREFIX: &str = "CHAT_DIRECT_EVENTS";

pub fn room_subject(room_id: Uuid) -> String {
    format!("{STREAM_NAME}.{room_id}")
}

pub fn direct_subject(user_id: Uuid) -> String {
    format!("{DIRECT_SUBJECT_PREFIX}.{user_id}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEventKind {
    RoomJoin {
        user_id: Uuid,
        joined_at: DateTime<Utc>,
        #[serde(skip_serializing_if = "Option::is_none")]
        owner_user_id: Option<Uuid>,
    },
    RoomLeave {
        user_ids: Vec<Uuid>,
    },
    /// Re-fetch signal: something structural about the room changed.
    RoomUpdated,
    Message {
        message: MessageData,
    },
    UpdateMessage {
        message: MessageData,
    },
    DeleteMessage {
        message_id: Uuid,
    },
    StatusUpdate {
        message_id: Uuid,
        status: MessageStatus,
        updated_at: DateTime<Utc>,
        user_id: Uuid,
        sender_id: Uuid,
    },
    /// Liveness signal, sent directly to the client and never published.
    Connected {
        connected: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatEvent {
    pub event_id: Uuid,
    pub room_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room: Option<Room>,
    pub event: ChatEventKind,
}

impl ChatEvent {
    pub fn new(room_id: Uuid, event: ChatEventKind) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            room_id: Some(room_id),
            room: None,
            event,
        }
    }

    pub fn connected() -> Self {
        Self {
            event_id: Uuid::now_v7(),
            room_id: None,
            room: None,
            event: ChatEventKind::Connected { connected: true },
        }
    }

    /// The broker subject this event publishes on; `None` for client-local
    /// events (`Connected`).
    pub fn subject(&self) -> Option<String> {
        match &self.event {
            ChatEventKind::Connected { .. } => None,
            ChatEventKind::RoomJoin { user_id, .. } => Some(direct_subject(*user_id)),
            _ => self.room_id.map(room_subject),
        }
    }
}

/// Wrapper carried by the broker. `user_id` identifies the dispatching
/// user and drives recipient-sensitive suppression at the session edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub user_id: Uuid,
    pub payload: ChatEvent,
}

/// A `SENT` status update is only an echo for the sender; every other
/// status (delivered/read) is for the room at large.
pub fn forwards_to_session(event: &ChatEventKind, dispatch_user: Uuid, session_user: Uuid) -> bool {
    match event {
        ChatEventKind::StatusUpdate { status, .. } if *status == MessageStatus::Sent => {
            dispatch_user == session_user
        }
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subjects_embed_the_stream_names() {
        let room = Uuid::new_v4();
        let user = Uuid::new_v4();
        assert_eq!(room_subject(room), format!("CHAT_EVENTS.{room}"));
        assert_eq!(direct_subject(user), format!("CHAT_DIRECT_EVENTS.{user}"));
    }

    #[test]
    fn room_join_routes_to_the_joiner_direct_subject() {
        let room = Uuid::new_v4();
        let joiner = Uuid::new_v4();
        let event = ChatEvent::new(
            room,
            ChatEventKind::RoomJoin {
                user_id: joiner,
                joined_at: Utc::now(),
                owner_user_id: None,
            },
        );
        assert_eq!(event.subject(), Some(direct_subject(joiner)));

        let leave = ChatEvent::new(room, ChatEventKind::RoomLeave { user_ids: vec![joiner] });
        assert_eq!(leave.subject(), Some(room_subject(room)));
    }

    #[test]
    fn connected_is_never_published() {
        assert_eq!(ChatEvent::connected().subject(), None);
    }

    #[test]
    fn envelope_round_trips_as_json() {
        let room = Uuid::new_v4();
        let user = Uuid::new_v4();
        let envelope = EventEnvelope {
            user_id: user,
            payload: ChatEvent::new(room, ChatEventKind::DeleteMessage { message_id: Uuid::now_v7() }),
        };

        let bytes = serde_json::to_vec(&envelope).unwrap();
        let decoded: EventEnvelope = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded.user_id, user);
        assert_eq!(decoded.payload.room_id, Some(room));
        assert!(matches!(decoded.payload.event, ChatEventKind::DeleteMessage { .. }));
    }

    #[test]
    fn sent_echoes_only_reach_the_dispatcher() {
        let sender = Uuid::new_v4();
        let other = Uuid::new_v4();
        let sent = ChatEventKind::StatusUpdate {
            message_id: Uuid::now_v7(),
            status: MessageStatus::Sent,
            updated_at: Utc::now(),
            user_id: sender,
            sender_id: sender,
        };
        assert!(forwards_to_session(&sent, sender, sender));
        assert!(!forwards_to_session(&sent, sender, other));

        let read = ChatEventKind::StatusUpdate {
            message_id: Uuid::now_v7(),
            status: MessageStatus::Read,
            updated_at: Utc::now(),
            user_id: other,
            sender_id: sender,
        };
        assert!(forwards_to_session(&read, other, sender));
    }
}
