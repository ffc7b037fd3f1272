//! Domain model shared by the repositories, the event plane and the route
//! layer: rooms, memberships, messages and the request shapes that cross the
//! repository boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// --- Enums ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomType {
    P2p,
    Group,
    Channel,
}

impl RoomType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::P2p => "p2p",
            Self::Group => "group",
            Self::Channel => "channel",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "p2p" => Some(Self::P2p),
            "group" => Some(Self::Group),
            "channel" => Some(Self::Channel),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MemberRole {
    Owner,
    Member,
}

impl MemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Owner => "OWNER",
            Self::Member => "MEMBER",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "OWNER" => Self::Owner,
            _ => Self::Member,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageStatus {
    #[default]
    Sent,
    Delivered,
    Read,
}

impl MessageStatus {
    pub fn as_i32(&self) -> i32 {
        match self {
            Self::Sent => 0,
            Self::Delivered => 1,
            Self::Read => 2,
        }
    }

    pub fn from_i32(v: i32) -> Self {
        match v {
            2 => Self::Read,
            1 => Self::Delivered,
            _ => Self::Sent,
        }
    }
}

// --- Users & participants ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub phone: String,
    pub email: Option<String>,
    pub avatar: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomParticipant {
    pub id: Uuid,
    pub name: String,
    pub phone: String,
    pub avatar: Option<String>,
    pub role: MemberRole,
    #[serde(default)]
    pub is_partner_blocked: bool,
    #[serde(default)]
    pub is_partner_muted: bool,
}

// --- Rooms ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub room_type: RoomType,
    pub name: String,
    pub description: String,
    pub photo_url: String,
    pub encryption_data: String,
    pub join_all_user: bool,
    pub send_message: bool,
    pub add_member: bool,
    pub edit_group: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_message: Option<MessageData>,
    pub unread_count: i32,
    pub is_pinned: bool,
    pub is_muted: bool,
    pub is_partner_blocked: bool,
    pub role: MemberRole,
    pub partner: Option<RoomParticipant>,
    #[serde(default)]
    pub participants: Vec<RoomParticipant>,
}

impl Room {
    /// Presentation pass applied before a room leaves the repository: p2p
    /// rooms take their name and photo from the partner, and
    /// `last_message_at` mirrors the denormalized last message.
    pub fn format(mut self) -> Self {
        if self.room_type == RoomType::P2p {
            if let Some(partner) = &self.partner {
                self.name = partner.name.clone();
                self.photo_url = partner.avatar.clone().unwrap_or_default();
            }
        }
        if let Some(last) = &self.last_message {
            self.last_message_at = Some(last.created_at);
        }
        self
    }
}

// --- Messages ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mention {
    pub message_id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub phone: String,
    pub tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reaction {
    pub message_id: Uuid,
    pub reacted_by_id: Uuid,
    pub reacted_by_name: String,
    pub reacted_by_phone: String,
    pub reacted_by_avatar: Option<String>,
    pub reaction: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageUserRead {
    pub user_id: Uuid,
    pub user_name: String,
    pub user_phone: String,
    pub user_avatar: Option<String>,
    pub read_at: DateTime<Utc>,
}

/// Snapshot of the original sender carried by forwarded messages, so the
/// attribution survives even if the source message is later deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardInfo {
    pub message_id: Uuid,
    pub sender_id: Option<Uuid>,
    pub sender_name: Option<String>,
    pub sender_phone: Option<String>,
    pub sender_avatar: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageData {
    pub id: Uuid,
    pub room_id: Uuid,
    pub sender_id: Uuid,
    pub sender_name: String,
    pub sender_phone: String,
    pub sender_avatar: Option<String>,
    pub content: String,
    pub status: MessageStatus,
    #[serde(rename = "type")]
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
    pub forward: Option<ForwardInfo>,
    pub reply: Option<Box<MessageData>>,
    #[serde(default)]
    pub mentions: Vec<Mention>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MessageData {
    pub fn bare(id: Uuid, room_id: Uuid, sender_id: Uuid, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            room_id,
            sender_id,
            sender_name: String::new(),
            sender_phone: String::new(),
            sender_avatar: None,
            content: String::new(),
            status: MessageStatus::Sent,
            message_type: "user_message".to_string(),
            lifetime: "normal".to_string(),
            origin: "app".to_string(),
            location_name: None,
            location_latitude: None,
            location_longitude: None,
            contact_id: None,
            contact_name: None,
            contact_phone: None,
            file: None,
            edited: false,
            is_deleted: false,
            event: None,
            sender_message_id: None,
            forward: None,
            reply: None,
            mentions: Vec::new(),
            reactions: Vec::new(),
            created_at,
            updated_at: created_at,
        }
    }

    /// Readers never surface deleted content; the row stays as a tombstone.
    pub fn tombstoned(mut self) -> Self {
        if self.is_deleted {
            self.content.clear();
            self.file = None;
        }
        self
    }
}

// --- Repository-boundary requests ---

#[derive(Debug, Clone, Deserialize)]
pub struct CreateRoomRequest {
    #[serde(rename = "type")]
    pub room_type: RoomType,
    pub name: Option<String>,
    pub description: Option<String>,
    pub photo_url: Option<String>,
    #[serde(default)]
    pub participants: Vec<Uuid>,
    pub send_message: Option<bool>,
    pub add_member: Option<bool>,
    pub edit_group: Option<bool>,
    #[serde(default)]
    pub join_all_user: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateRoomRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub photo_url: Option<String>,
    pub send_message: Option<bool>,
    pub add_member: Option<bool>,
    pub edit_group: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MentionInput {
    pub user: Uuid,
    pub tag: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendMessageRequest {
    pub room_id: Uuid,
    #[serde(default)]
    pub content: String,
    #[serde(rename = "type")]
    pub message_type: Option<String>,
    #[serde(default)]
    pub mentions: Vec<MentionInput>,
    pub reply_id: Option<Uuid>,
    pub forward_id: Option<Uuid>,
    pub lifetime: Option<String>,
    pub origin: Option<String>,
    pub location_name: Option<String>,
    pub location_latitude: Option<f64>,
    pub location_longitude: Option<f64>,
    pub contact_name: Option<String>,
    pub contact_phone: Option<String>,
    pub file: Option<String>,
    pub event: Option<String>,
    pub sender_message_id: Option<String>,
}

impl SendMessageRequest {
    /// A system message authored by the service on behalf of an operation
    /// (member added/removed, room renamed, photo changed).
    pub fn system(room_id: Uuid, content: impl Into<String>, event: &str) -> Self {
        Self {
            room_id,
            content: content.into(),
            message_type: Some("system_message".to_string()),
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
            event: Some(event.to_string()),
            sender_message_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_type_round_trips_through_wire_names() {
        for (ty, name) in [
            (RoomType::P2p, "p2p"),
            (RoomType::Group, "group"),
            (RoomType::Channel, "channel"),
        ] {
            assert_eq!(ty.as_str(), name);
            assert_eq!(RoomType::parse(name), Some(ty));
            assert_eq!(serde_json::to_string(&ty).unwrap(), format!("\"{name}\""));
        }
        assert_eq!(RoomType::parse("broadcast"), None);
    }

    #[test]
    fn message_status_int_mapping() {
        assert_eq!(MessageStatus::from_i32(MessageStatus::Read.as_i32()), MessageStatus::Read);
        assert_eq!(MessageStatus::from_i32(99), MessageStatus::Sent);
    }

    #[test]
    fn p2p_room_takes_partner_identity() {
        let mut room = sample_room(RoomType::P2p);
        room.partner = Some(RoomParticipant {
            id: Uuid::new_v4(),
            name: "Ada".to_string(),
            phone: "+50760000000".to_string(),
            avatar: Some("https://cdn/ada.png".to_string()),
            role: MemberRole::Member,
            is_partner_blocked: false,
            is_partner_muted: false,
        });

        let formatted = room.format();
        assert_eq!(formatted.name, "Ada");
        assert_eq!(formatted.photo_url, "https://cdn/ada.png");
    }

    #[test]
    fn tombstone_hides_content() {
        let mut msg = MessageData::bare(Uuid::now_v7(), Uuid::new_v4(), Uuid::new_v4(), Utc::now());
        msg.content = "secret".to_string();
        msg.is_deleted = true;
        let msg = msg.tombstoned();
        assert!(msg.content.is_empty());
        assert!(msg.is_deleted);
    }

    fn sample_room(room_type: RoomType) -> Room {
        Room {
            id: Uuid::new_v4(),
            room_type,
            name: "group name".to_string(),
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
}
