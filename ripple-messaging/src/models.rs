use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;
use uuid::Uuid;

use crate::schema::{
    messaging_token, room, room_member, room_message, room_message_meta, room_message_reaction,
    room_message_tag, users,
};

// --- Room ---

#[derive(Debug, Queryable, Identifiable, Serialize, Clone)]
#[diesel(table_name = room)]
pub struct RoomRow {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub image: String,
    pub room_type: String,
    pub encryption_data: String,
    pub join_all_user: bool,
    pub send_message: bool,
    pub add_member: bool,
    pub edit_group: bool,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = room)]
pub struct NewRoom {
    pub name: String,
    pub description: String,
    pub image: String,
    pub room_type: String,
    pub encryption_data: String,
    pub join_all_user: bool,
    pub send_message: bool,
    pub add_member: bool,
    pub edit_group: bool,
}

// --- RoomMember ---

#[derive(Debug, Queryable, Identifiable, Serialize, Clone)]
#[diesel(table_name = room_member)]
pub struct RoomMemberRow {
    pub id: Uuid,
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub role: String,
    pub is_muted: bool,
    pub is_pinned: bool,
    pub is_partner_blocked: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub removed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = room_member)]
pub struct NewRoomMember {
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub role: String,
}

// --- Message ---

#[derive(Debug, Queryable, Identifiable, Serialize, Clone)]
#[diesel(table_name = room_message)]
pub struct MessageRow {
    pub id: Uuid,
    pub room_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub content_decrypted: Option<String>,
    pub status: i32,
    pub message_type: String,
    pub lifetime: String,
    pub origin: String,
    pub location_name: Option<String>,
    pub location_latitude: Option<f64>,
    pub location_longitude: Option<f64>,
    pub contact_id: Option<Uuid>,
    pub contact_name: Option<String>,
    pub contact_phone: Option<String>,
    pub file: Option<String>,
    pub edited: bool,
    pub is_deleted: bool,
    pub event: Option<String>,
    pub sender_message_id: Option<String>,
    pub replied_message_id: Option<Uuid>,
    pub forwarded_message_id: Option<Uuid>,
    pub forwarded_message_original_sender: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = room_message)]
pub struct NewMessage {
    pub id: Uuid,
    pub room_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub content_decrypted: Option<String>,
    pub status: i32,
    pub message_type: String,
    pub lifetime: String,
    pub origin: String,
    pub location_name: Option<String>,
    pub location_latitude: Option<f64>,
    pub location_longitude: Option<f64>,
    pub contact_id: Option<Uuid>,
    pub contact_name: Option<String>,
    pub contact_phone: Option<String>,
    pub file: Option<String>,
    pub event: Option<String>,
    pub sender_message_id: Option<String>,
    pub replied_message_id: Option<Uuid>,
    pub forwarded_message_id: Option<Uuid>,
    pub forwarded_message_original_sender: Option<Uuid>,
}

// --- MessageMeta ---

#[derive(Debug, Queryable, Identifiable, Serialize, Clone)]
#[diesel(table_name = room_message_meta)]
pub struct MessageMetaRow {
    pub id: Uuid,
    pub message_id: Uuid,
    pub user_id: Uuid,
    pub read_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
    pub is_sender_blocked: bool,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = room_message_meta)]
pub struct NewMessageMeta {
    pub message_id: Uuid,
    pub user_id: Uuid,
    pub read_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
    pub is_sender_blocked: bool,
}

// --- Mentions & reactions ---

#[derive(Debug, Insertable)]
#[diesel(table_name = room_message_tag)]
pub struct NewMessageTag {
    pub message_id: Uuid,
    pub user_id: Uuid,
    pub tag: String,
}

#[derive(Debug, Queryable, Identifiable, Serialize, Clone)]
#[diesel(table_name = room_message_reaction)]
pub struct ReactionRow {
    pub id: Uuid,
    pub message_id: Uuid,
    pub user_id: Uuid,
    pub reaction: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = room_message_reaction)]
pub struct NewReaction {
    pub message_id: Uuid,
    pub user_id: Uuid,
    pub reaction: String,
}

// --- Users ---

#[derive(Debug, Queryable, Identifiable, Serialize, Clone)]
#[diesel(table_name = users)]
pub struct UserRow {
    pub id: Uuid,
    pub name: String,
    pub phone: String,
    pub email: Option<String>,
    pub avatar: Option<String>,
    pub created_at: DateTime<Utc>,
    pub removed_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl From<UserRow> for crate::domain::User {
    fn from(row: UserRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            phone: row.phone,
            email: row.email,
            avatar: row.avatar,
            created_at: Some(row.created_at),
        }
    }
}

// --- Messaging tokens ---

#[derive(Debug, Insertable)]
#[diesel(table_name = messaging_token)]
pub struct NewMessagingToken {
    pub user_id: Uuid,
    pub token: String,
    pub platform: String,
    pub platform_version: String,
    pub device: String,
    pub lang: String,
    pub is_voip: bool,
    pub debug: bool,
}
