use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use ripple_shared::clients::push::ChatMessagePush;
use ripple_shared::types::api::ApiResponse;
use ripple_shared::types::auth::AuthSession;
use ripple_shared::{AppError, AppResult};

use crate::domain::{
    MemberRole, MessageData, MessageStatus, MessageUserRead, Reaction, Room, RoomType,
    SendMessageRequest,
};
use crate::events::dispatcher::publish_event;
use crate::events::{ChatEvent, ChatEventKind};
use crate::repository::{MessageAudienceFilter, MessageHistoryFilter};
use crate::routes::{load_room, publish_chat_event, ListResponse};
use crate::AppState;

// --- Request/response DTOs ---

#[derive(Debug, Deserialize)]
pub struct EditMessageRequest {
    pub message_id: Uuid,
    pub new_content: String,
}

#[derive(Debug, Deserialize)]
pub struct DeleteMessageRequest {
    pub room_id: Uuid,
    pub message_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub limit: u32,
    pub before_message_id: Option<Uuid>,
    pub after_message_id: Option<Uuid>,
    pub before_date: Option<chrono::DateTime<Utc>>,
    pub after_date: Option<chrono::DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct ReactRequest {
    pub message_id: Uuid,
    #[serde(default)]
    pub reaction: String,
}

#[derive(Debug, Deserialize)]
pub struct MarkReadRequest {
    pub room_id: Uuid,
    #[serde(default)]
    pub message_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct MarkReadResponse {
    pub marked_count: i32,
}

#[derive(Debug, Deserialize)]
pub struct AudienceQuery {
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub limit: u32,
}

#[derive(Debug, Serialize)]
pub struct SenderMessageResponse {
    pub status: MessageStatus,
}

// --- Validation ---

fn check_send_permissions(room: &Room, req: &SendMessageRequest) -> AppResult<()> {
    if room.room_type == RoomType::Group && room.role == MemberRole::Member && !room.send_message {
        return Err(AppError::invalid("sending is restricted in this room"));
    }
    if !req.mentions.is_empty() && room.room_type == RoomType::P2p {
        return Err(AppError::invalid("mentions are not available in p2p rooms"));
    }
    if room.room_type == RoomType::P2p && room.is_partner_blocked {
        return Err(AppError::invalid("the partner is blocked"));
    }
    Ok(())
}

// --- Handlers ---

/// POST /chat/messages
///
/// Persists the message (with the sender's own meta) inside the request,
/// then hands the rest to the fan-out path: recipient metas, the
/// SENT status echo, the room message event and the push notification.
pub async fn send_message(
    session: AuthSession,
    State(state): State<Arc<AppState>>,
    Json(mut req): Json<SendMessageRequest>,
) -> AppResult<Json<ApiResponse<MessageData>>> {
    let user_id = session.user_id;

    let room = load_room(&state, user_id, req.room_id, true, true).await?;
    check_send_permissions(&room, &req)?;

    // Decrypted preview feeds search and push rendering. Send-time
    // encryption happens on the client; a preview that fails to decrypt is
    // not fatal to the request.
    let content_decrypted = if req.content.is_empty() {
        None
    } else {
        match state
            .cipher
            .decrypt_message(&req.content, &room.encryption_data)
        {
            Ok(plain) => Some(plain),
            Err(e) => {
                tracing::warn!(error = %e, room_id = %room.id, "failed to decrypt message preview");
                None
            }
        }
    };

    req.message_type = Some("user_message".to_string());

    let message = state
        .repository
        .save_message(user_id, &req, content_decrypted.as_deref())
        .await?;

    let fanout_state = state.clone();
    let fanout_room = room.clone();
    let fanout_message = message.clone();
    let push_content = content_decrypted.clone().unwrap_or_default();

    state.dispatcher.dispatch_fanout(async move {
        let state = fanout_state;
        let room = fanout_room;
        let message = fanout_message;

        // Missing metas read as unread, so a failure here is logged and
        // left to the next mark-as-read to repair.
        if let Err(e) = state
            .repository
            .create_message_meta_for_participants(room.id, message.id, message.sender_id)
            .await
        {
            tracing::error!(
                error = %e,
                room_id = %room.id,
                message_id = %message.id,
                "message meta fan-out failed"
            );
        } else {
            tracing::info!(room_id = %room.id, message_id = %message.id, "message metadata fanned out");
        }

        // The sender's SENT echo goes out strictly before the room event.
        publish_event(
            &state.broker,
            user_id,
            ChatEvent::new(
                room.id,
                ChatEventKind::StatusUpdate {
                    message_id: message.id,
                    status: message.status,
                    updated_at: message.updated_at,
                    user_id,
                    sender_id: user_id,
                },
            ),
        )
        .await;
        publish_event(
            &state.broker,
            user_id,
            ChatEvent::new(
                room.id,
                ChatEventKind::Message {
                    message: message.clone(),
                },
            ),
        )
        .await;

        // p2p pushes target the partner directly; group pushes ride the
        // room topic. A muted partner gets the stream event but no push.
        let mut recipients: Vec<Uuid> = Vec::new();
        let mut send_push = true;
        if room.room_type == RoomType::P2p {
            if let Some(partner) = &room.partner {
                recipients.push(partner.id);
                match state.repository.is_partner_muted(partner.id, room.id).await {
                    Ok(true) => send_push = false,
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, room_id = %room.id, "partner mute lookup failed")
                    }
                }
            }
        }

        if send_push {
            let push = ChatMessagePush {
                recipient_user_ids: recipients,
                sender_id: user_id,
                sender_display_name: message.sender_name.clone(),
                room_id: room.id,
                room_name: room.name.clone(),
                room_type: room.room_type.as_str().to_string(),
                message_content: push_content,
            };
            if let Err(e) = state.push.send_push_notification(&push).await {
                tracing::error!(error = %e, room_id = %room.id, "push notification failed");
            }
        }
    });

    Ok(Json(ApiResponse::ok(message)))
}

/// PUT /chat/messages
pub async fn edit_message(
    session: AuthSession,
    State(state): State<Arc<AppState>>,
    Json(req): Json<EditMessageRequest>,
) -> AppResult<Json<ApiResponse<MessageData>>> {
    let user_id = session.user_id;

    let mut message = state
        .repository
        .get_message(user_id, req.message_id)
        .await?
        .ok_or_else(|| AppError::not_found("message not found"))?;

    if message.sender_id != user_id {
        return Err(AppError::unauthorized("only the sender can edit a message"));
    }

    state
        .repository
        .update_message(user_id, req.message_id, &req.new_content)
        .await?;

    message.content = req.new_content;
    message.edited = true;
    message.updated_at = Utc::now();

    publish_chat_event(
        &state,
        user_id,
        message.room_id,
        ChatEventKind::UpdateMessage {
            message: message.clone(),
        },
    );

    Ok(Json(ApiResponse::ok(message)))
}

/// POST /chat/messages/delete
pub async fn delete_message(
    session: AuthSession,
    State(state): State<Arc<AppState>>,
    Json(req): Json<DeleteMessageRequest>,
) -> AppResult<Json<ApiResponse<bool>>> {
    let user_id = session.user_id;
    load_room(&state, user_id, req.room_id, false, true).await?;

    state
        .repository
        .delete_messages(user_id, &req.message_ids)
        .await?;

    for message_id in &req.message_ids {
        publish_chat_event(
            &state,
            user_id,
            req.room_id,
            ChatEventKind::DeleteMessage {
                message_id: *message_id,
            },
        );
    }

    Ok(Json(ApiResponse::ok(true)))
}

/// GET /chat/rooms/:id/messages
pub async fn get_message_history(
    session: AuthSession,
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> AppResult<Json<ApiResponse<ListResponse<MessageData>>>> {
    let user_id = session.user_id;
    load_room(&state, user_id, room_id, false, true).await?;

    let filter = MessageHistoryFilter {
        room_id: Some(room_id),
        page: query.page,
        limit: query.limit,
        before_message_id: query.before_message_id,
        after_message_id: query.after_message_id,
        before_date: query.before_date,
        after_date: query.after_date,
        messages_per_room: 0,
    };
    let (items, meta) = state
        .repository
        .get_messages_from_room(user_id, &filter)
        .await?;

    Ok(Json(ApiResponse::ok(ListResponse { items, meta })))
}

/// GET /chat/messages/:id
pub async fn get_message(
    session: AuthSession,
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<MessageData>>> {
    let user_id = session.user_id;

    let message = state
        .repository
        .get_message(user_id, message_id)
        .await?
        .ok_or_else(|| AppError::not_found("message not found"))?;

    // Visibility of the message is visibility of its room.
    load_room(&state, user_id, message.room_id, false, true).await?;

    Ok(Json(ApiResponse::ok(message)))
}

/// POST /chat/messages/reactions
pub async fn react_to_message(
    session: AuthSession,
    State(state): State<Arc<AppState>>,
    Json(req): Json<ReactRequest>,
) -> AppResult<Json<ApiResponse<bool>>> {
    let user_id = session.user_id;

    let message = state
        .repository
        .get_message(user_id, req.message_id)
        .await?
        .ok_or_else(|| AppError::not_found("message not found"))?;

    load_room(&state, user_id, message.room_id, false, true).await?;

    state
        .repository
        .react_to_message(user_id, req.message_id, &req.reaction)
        .await?;

    Ok(Json(ApiResponse::ok(true)))
}

/// POST /chat/messages/read
///
/// Marking a message read also marks everything older in the room; the
/// oldest explicit id anchors the "since" expansion.
pub async fn mark_messages_as_read(
    session: AuthSession,
    State(state): State<Arc<AppState>>,
    Json(req): Json<MarkReadRequest>,
) -> AppResult<Json<ApiResponse<MarkReadResponse>>> {
    let user_id = session.user_id;
    load_room(&state, user_id, req.room_id, false, true).await?;

    let since = match req.message_ids.first() {
        Some(first) => Some(
            state
                .repository
                .get_message_simple(user_id, *first)
                .await?
                .ok_or_else(|| AppError::not_found("message not found"))?
                .created_at,
        ),
        None => None,
    };

    let marked_count = state
        .repository
        .mark_messages_as_read(user_id, req.room_id, &req.message_ids, since)
        .await?;

    let read_at = Utc::now();
    for message_id in &req.message_ids {
        let message = state
            .repository
            .get_message_simple(user_id, *message_id)
            .await?
            .ok_or_else(|| AppError::not_found("message not found"))?;

        publish_chat_event(
            &state,
            user_id,
            req.room_id,
            ChatEventKind::StatusUpdate {
                message_id: *message_id,
                status: MessageStatus::Read,
                updated_at: read_at,
                user_id,
                sender_id: message.sender_id,
            },
        );
    }

    Ok(Json(ApiResponse::ok(MarkReadResponse { marked_count })))
}

/// GET /chat/messages/:id/reads — sender-only.
pub async fn get_message_read(
    session: AuthSession,
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<Uuid>,
    Query(query): Query<AudienceQuery>,
) -> AppResult<Json<ApiResponse<ListResponse<MessageUserRead>>>> {
    let user_id = session.user_id;

    let message = state
        .repository
        .get_message_simple(user_id, message_id)
        .await?
        .ok_or_else(|| AppError::not_found("message not found"))?;
    if message.sender_id != user_id {
        return Err(AppError::not_found("message not found"));
    }

    let filter = MessageAudienceFilter {
        message_id,
        page: query.page,
        limit: query.limit,
    };
    let (items, meta) = state.repository.get_message_read(&filter).await?;

    Ok(Json(ApiResponse::ok(ListResponse { items, meta })))
}

/// GET /chat/messages/:id/reactions — sender-only.
pub async fn get_message_reactions(
    session: AuthSession,
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<Uuid>,
    Query(query): Query<AudienceQuery>,
) -> AppResult<Json<ApiResponse<ListResponse<Reaction>>>> {
    let user_id = session.user_id;

    let message = state
        .repository
        .get_message_simple(user_id, message_id)
        .await?
        .ok_or_else(|| AppError::not_found("message not found"))?;
    if message.sender_id != user_id {
        return Err(AppError::not_found("message not found"));
    }

    let filter = MessageAudienceFilter {
        message_id,
        page: query.page,
        limit: query.limit,
    };
    let (items, meta) = state.repository.get_message_reactions(&filter).await?;

    Ok(Json(ApiResponse::ok(ListResponse { items, meta })))
}

/// GET /chat/messages/sender/:sender_message_id
///
/// Client-side idempotency probe: resolves a caller-supplied id to the
/// stored message's delivery status.
pub async fn get_sender_message(
    session: AuthSession,
    State(state): State<Arc<AppState>>,
    Path(sender_message_id): Path<String>,
) -> AppResult<Json<ApiResponse<SenderMessageResponse>>> {
    let message = state
        .repository
        .get_message_by_sender_message_id(session.user_id, &sender_message_id)
        .await?
        .ok_or_else(|| AppError::not_found("message not found"))?;

    Ok(Json(ApiResponse::ok(SenderMessageResponse {
        status: message.status,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MentionInput;

    fn sample_room(room_type: RoomType) -> Room {
        Room {
            id: Uuid::new_v4(),
            room_type,
            name: "room".to_string(),
            description: String::new(),
            photo_url: String::new(),
            encryption_data: String::new(),
            join_all_user: false,
            send_message: true,
            add_member: false,
            edit_group: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            last_message_at: None,
            last_message: None,
            unread_count: 0,
            is_pinned: false,
            is_muted: false,
            is_partner_blocked: false,
            role: MemberRole::Member,
            partner: None,
            participants: Vec::new(),
        }
    }

    fn sample_send(room_id: Uuid) -> SendMessageRequest {
        SendMessageRequest {
            room_id,
            content: "ciphertext".to_string(),
            message_type: None,
            mentions: Vec::new(),
            reply_id: None,
            forward_id: None,
            lifetime: None,
            origin: None,
            location_name: None,
            location_latitude: None,
            location_longitude: None,
            contact_name: None,
            contact_phone: None,
            file: None,
            event: None,
            sender_message_id: None,
        }
    }

    #[test]
    fn member_without_permission_cannot_send() {
        let mut room = sample_room(RoomType::Group);
        room.send_message = false;
        let req = sample_send(room.id);
        assert!(check_send_permissions(&room, &req).is_err());

        room.role = MemberRole::Owner;
        assert!(check_send_permissions(&room, &req).is_ok());
    }

    #[test]
    fn mentions_are_rejected_in_p2p() {
        let room = sample_room(RoomType::P2p);
        let mut req = sample_send(room.id);
        req.mentions = vec![MentionInput {
            user: Uuid::new_v4(),
            tag: "@ada".to_string(),
        }];
        assert!(check_send_permissions(&room, &req).is_err());
    }

    #[test]
    fn blocked_partner_blocks_the_send() {
        let mut room = sample_room(RoomType::P2p);
        room.is_partner_blocked = true;
        let req = sample_send(room.id);
        assert!(check_send_permissions(&room, &req).is_err());
    }
}
