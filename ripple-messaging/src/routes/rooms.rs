use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use ripple_shared::types::api::ApiResponse;
use ripple_shared::types::auth::AuthSession;
use ripple_shared::{AppError, AppResult};

use crate::domain::{
    CreateRoomRequest, MemberRole, Room, RoomType, SendMessageRequest, UpdateRoomRequest,
};
use crate::events::ChatEventKind;
use crate::repository::{ParticipantFilter, RoomFilter};
use crate::routes::{load_room, publish_chat_event, room_topic, ListResponse};
use crate::AppState;

// --- Request DTOs ---

#[derive(Debug, Deserialize)]
pub struct GetRoomsQuery {
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub limit: u32,
    pub search: Option<String>,
    #[serde(rename = "type")]
    pub room_type: Option<RoomType>,
    pub since: Option<chrono::DateTime<Utc>>,
}

#[derive(Debug, Deserialize, Default)]
pub struct LeaveRoomRequest {
    #[serde(default)]
    pub participants: Vec<Uuid>,
    #[serde(default)]
    pub leave_all: bool,
}

#[derive(Debug, Deserialize)]
pub struct ParticipantsQuery {
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub limit: u32,
    pub search: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AddParticipantsRequest {
    pub participants: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateParticipantRequest {
    pub participant: Uuid,
    pub role: MemberRole,
}

// --- Validation ---

fn validate_create_room(req: &CreateRoomRequest) -> AppResult<()> {
    if req.participants.is_empty() {
        return Err(AppError::invalid("at least one participant is required"));
    }
    if req.room_type == RoomType::P2p && req.participants.len() > 1 {
        return Err(AppError::invalid("p2p rooms take exactly one participant"));
    }
    if req.room_type != RoomType::P2p
        && req.name.as_deref().map(str::trim).unwrap_or("").is_empty()
    {
        return Err(AppError::invalid("group rooms require a name"));
    }
    Ok(())
}

// --- Handlers ---

/// POST /chat/rooms
pub async fn create_room(
    session: AuthSession,
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateRoomRequest>,
) -> AppResult<Json<ApiResponse<Room>>> {
    let user_id = session.user_id;
    validate_create_room(&req)?;

    let mut room = state.repository.create_room(user_id, &req).await?;
    room.role = MemberRole::Owner;

    // Every member, creator included, receives the join on their direct
    // subject; a new member may not have any room consumer yet.
    let mut everyone = req.participants.clone();
    everyone.push(user_id);
    everyone.sort();
    everyone.dedup();

    let joined_at = Utc::now();
    for member in &everyone {
        publish_chat_event(
            &state,
            user_id,
            room.id,
            ChatEventKind::RoomJoin {
                user_id: *member,
                joined_at,
                owner_user_id: Some(user_id),
            },
        );
    }

    if room.room_type == RoomType::Group {
        if let Err(e) = state
            .push
            .subscribe_to_topic(&room_topic(room.id), &everyone)
            .await
        {
            tracing::error!(error = %e, room_id = %room.id, "topic subscription failed");
        }
    }

    Ok(Json(ApiResponse::ok(room)))
}

/// GET /chat/rooms
pub async fn get_rooms(
    session: AuthSession,
    State(state): State<Arc<AppState>>,
    Query(query): Query<GetRoomsQuery>,
) -> AppResult<Json<ApiResponse<ListResponse<Room>>>> {
    let filter = RoomFilter {
        page: query.page,
        limit: query.limit,
        search: query.search,
        room_type: query.room_type,
        since: query.since,
    };

    let (items, meta) = state
        .repository
        .get_room_list(session.user_id, &filter)
        .await?;

    Ok(Json(ApiResponse::ok(ListResponse { items, meta })))
}

/// GET /chat/rooms/:id
pub async fn get_room(
    session: AuthSession,
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<Room>>> {
    let room = load_room(&state, session.user_id, room_id, true, false).await?;
    Ok(Json(ApiResponse::ok(room)))
}

/// POST /chat/rooms/:id/leave
pub async fn leave_room(
    session: AuthSession,
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<Uuid>,
    Json(mut req): Json<LeaveRoomRequest>,
) -> AppResult<Json<ApiResponse<bool>>> {
    let user_id = session.user_id;
    let room = load_room(&state, user_id, room_id, true, true).await?;

    match room.room_type {
        RoomType::P2p => {
            // The last p2p leave always tears the room down for both sides.
            req.leave_all = true;
        }
        _ => {
            if room.role == MemberRole::Member && !req.participants.is_empty() {
                return Err(AppError::invalid("only the owner can remove other members"));
            }
            if req.leave_all && room.role == MemberRole::Member {
                return Err(AppError::invalid("only the owner can dissolve the room"));
            }
            if req.participants.is_empty() {
                req.participants = vec![user_id];
            }
        }
    }

    if req.leave_all {
        let (everyone, _) = state
            .repository
            .get_room_participants(&ParticipantFilter::all(room_id))
            .await?;
        req.participants.extend(everyone.iter().map(|p| p.id));
    }
    req.participants.sort();
    req.participants.dedup();

    let removed = state
        .repository
        .leave_room(user_id, room_id, &req.participants, req.leave_all)
        .await?;

    if !req.leave_all {
        for user in &removed {
            let msg = state
                .repository
                .save_message(
                    user_id,
                    &SendMessageRequest::system(room_id, user.phone.clone(), "remove_member"),
                    None,
                )
                .await?;
            publish_chat_event(&state, user_id, room_id, ChatEventKind::Message { message: msg });
        }
    }

    if let Err(e) = state
        .push
        .unsubscribe_from_topic(&room_topic(room_id), &req.participants)
        .await
    {
        tracing::error!(error = %e, room_id = %room_id, "topic unsubscription failed");
    }

    if req.leave_all {
        state.repository.delete_room(user_id, room_id).await?;
    }

    publish_chat_event(
        &state,
        user_id,
        room_id,
        ChatEventKind::RoomLeave {
            user_ids: req.participants.clone(),
        },
    );

    // Remaining members re-fetch the room (roster and permissions moved).
    if !req.leave_all {
        publish_chat_event(&state, user_id, room_id, ChatEventKind::RoomUpdated);
    }

    Ok(Json(ApiResponse::ok(true)))
}

/// GET /chat/rooms/:id/participants
pub async fn get_room_participants(
    session: AuthSession,
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<Uuid>,
    Query(query): Query<ParticipantsQuery>,
) -> AppResult<Json<ApiResponse<ListResponse<crate::domain::RoomParticipant>>>> {
    load_room(&state, session.user_id, room_id, false, true).await?;

    let filter = ParticipantFilter {
        room_id,
        page: query.page,
        limit: query.limit,
        search: query.search,
    };
    let (items, meta) = state.repository.get_room_participants(&filter).await?;

    Ok(Json(ApiResponse::ok(ListResponse { items, meta })))
}

/// POST /chat/rooms/:id/pin — toggles the caller's pin flag.
pub async fn pin_room(
    session: AuthSession,
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<bool>>> {
    let user_id = session.user_id;
    let room = load_room(&state, user_id, room_id, false, true).await?;

    state
        .repository
        .pin_room(user_id, room_id, !room.is_pinned)
        .await?;

    Ok(Json(ApiResponse::ok(true)))
}

/// POST /chat/rooms/:id/mute — toggles the caller's mute flag and keeps the
/// push topic membership in line with it.
pub async fn mute_room(
    session: AuthSession,
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<bool>>> {
    let user_id = session.user_id;
    let room = load_room(&state, user_id, room_id, false, true).await?;
    let muted = !room.is_muted;

    state.repository.mute_room(user_id, room_id, muted).await?;

    if room.room_type == RoomType::Group {
        let topic = room_topic(room_id);
        let result = if muted {
            state.push.unsubscribe_from_topic(&topic, &[user_id]).await
        } else {
            state.push.subscribe_to_topic(&topic, &[user_id]).await
        };
        if let Err(e) = result {
            tracing::error!(error = %e, room_id = %room_id, muted, "topic membership update failed");
        }
    }

    publish_chat_event(&state, user_id, room_id, ChatEventKind::RoomUpdated);

    Ok(Json(ApiResponse::ok(true)))
}

/// PUT /chat/rooms/:id
pub async fn update_room(
    session: AuthSession,
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<Uuid>,
    Json(req): Json<UpdateRoomRequest>,
) -> AppResult<Json<ApiResponse<bool>>> {
    let user_id = session.user_id;
    let room = load_room(&state, user_id, room_id, false, true).await?;

    if room.room_type != RoomType::Group {
        return Err(AppError::not_found("room not found"));
    }
    // Members without the edit permission are not told the room exists in
    // an editable form.
    if room.role == MemberRole::Member && !room.edit_group {
        return Err(AppError::not_found("room not found"));
    }

    state.repository.update_room(user_id, room_id, &req).await?;
    publish_chat_event(&state, user_id, room_id, ChatEventKind::RoomUpdated);

    if let Some(name) = &req.name {
        if *name != room.name {
            let msg = state
                .repository
                .save_message(
                    user_id,
                    &SendMessageRequest::system(room_id, name.clone(), "new_name"),
                    None,
                )
                .await?;
            publish_chat_event(&state, user_id, room_id, ChatEventKind::Message { message: msg });
        }
    }

    if let Some(photo) = &req.photo_url {
        if *photo != room.photo_url {
            let msg = state
                .repository
                .save_message(
                    user_id,
                    &SendMessageRequest::system(room_id, photo.clone(), "new_photo"),
                    None,
                )
                .await?;
            publish_chat_event(&state, user_id, room_id, ChatEventKind::Message { message: msg });
        }
    }

    Ok(Json(ApiResponse::ok(true)))
}

/// POST /chat/rooms/:id/participants
pub async fn add_participant_to_room(
    session: AuthSession,
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<Uuid>,
    Json(req): Json<AddParticipantsRequest>,
) -> AppResult<Json<ApiResponse<bool>>> {
    let user_id = session.user_id;
    let room = load_room(&state, user_id, room_id, false, true).await?;

    if room.room_type != RoomType::Group {
        return Err(AppError::not_found("room not found"));
    }
    if room.role == MemberRole::Member && !room.add_member {
        return Err(AppError::not_found("room not found"));
    }

    let added = state
        .repository
        .add_participants(user_id, room_id, &req.participants)
        .await?;

    let joined_at = Utc::now();
    for user in &added {
        let msg = state
            .repository
            .save_message(
                user_id,
                &SendMessageRequest::system(room_id, user.phone.clone(), "new_member"),
                None,
            )
            .await?;
        publish_chat_event(&state, user_id, room_id, ChatEventKind::Message { message: msg });

        publish_chat_event(
            &state,
            user_id,
            room_id,
            ChatEventKind::RoomJoin {
                user_id: user.id,
                joined_at,
                owner_user_id: None,
            },
        );
    }

    if let Err(e) = state
        .push
        .subscribe_to_topic(&room_topic(room_id), &req.participants)
        .await
    {
        tracing::error!(error = %e, room_id = %room_id, "topic subscription failed");
    }

    Ok(Json(ApiResponse::ok(true)))
}

/// PUT /chat/rooms/:id/participants
pub async fn update_participant_room(
    session: AuthSession,
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<Uuid>,
    Json(req): Json<UpdateParticipantRequest>,
) -> AppResult<Json<ApiResponse<bool>>> {
    let user_id = session.user_id;
    let room = load_room(&state, user_id, room_id, false, true).await?;

    if room.role == MemberRole::Member {
        return Err(AppError::not_found("room not found"));
    }

    state
        .repository
        .update_participant_role(user_id, room_id, req.participant, req.role)
        .await?;

    publish_chat_event(&state, user_id, room_id, ChatEventKind::RoomUpdated);

    Ok(Json(ApiResponse::ok(true)))
}

/// POST /chat/rooms/:id/block — toggles the p2p partner block.
pub async fn block_user(
    session: AuthSession,
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<bool>>> {
    let user_id = session.user_id;
    let room = load_room(&state, user_id, room_id, true, true).await?;

    if room.room_type != RoomType::P2p {
        return Err(AppError::not_found("room not found"));
    }

    let partner = room.partner.as_ref().map(|p| p.id);
    state
        .repository
        .block_user(user_id, room_id, !room.is_partner_blocked, partner)
        .await?;

    Ok(Json(ApiResponse::ok(true)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_request(room_type: RoomType, participants: Vec<Uuid>) -> CreateRoomRequest {
        CreateRoomRequest {
            room_type,
            name: Some("team".to_string()),
            description: None,
            photo_url: None,
            participants,
            send_message: None,
            add_member: None,
            edit_group: None,
            join_all_user: false,
        }
    }

    #[test]
    fn create_room_requires_participants() {
        let req = base_request(RoomType::Group, vec![]);
        assert!(validate_create_room(&req).is_err());
    }

    #[test]
    fn p2p_takes_exactly_one_participant() {
        let one = base_request(RoomType::P2p, vec![Uuid::new_v4()]);
        assert!(validate_create_room(&one).is_ok());

        let two = base_request(RoomType::P2p, vec![Uuid::new_v4(), Uuid::new_v4()]);
        assert!(validate_create_room(&two).is_err());
    }

    #[test]
    fn group_requires_a_name() {
        let mut req = base_request(RoomType::Group, vec![Uuid::new_v4()]);
        req.name = None;
        assert!(validate_create_room(&req).is_err());

        req.name = Some("  ".to_string());
        assert!(validate_create_room(&req).is_err());

        req.name = Some("g".to_string());
        assert!(validate_create_room(&req).is_ok());
    }
}
