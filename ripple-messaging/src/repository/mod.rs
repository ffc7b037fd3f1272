//! Storage abstraction for rooms, memberships and messages.
//!
//! Two implementations satisfy the same caller-visible contract: a
//! normalized relational store (strong consistency) and a denormalized
//! wide-column store (eventual consistency, partition-per-access-pattern).
//! Writes own cache invalidation for the rooms they touch; cancellation is
//! carried by the futures themselves.

pub mod postgres;
pub mod scylla;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use ripple_shared::types::PaginationMeta;
use ripple_shared::AppResult;

use crate::domain::{
    CreateRoomRequest, MemberRole, MessageData, MessageUserRead, Reaction, Room, RoomParticipant,
    SendMessageRequest, UpdateRoomRequest, User,
};

pub use self::postgres::PgChatRepository;
pub use self::scylla::ScyllaChatRepository;

// --- Filters ---

#[derive(Debug, Clone, Default)]
pub struct RoomFilter {
    pub page: u32,
    pub limit: u32,
    pub search: Option<String>,
    pub room_type: Option<crate::domain::RoomType>,
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ParticipantFilter {
    pub room_id: Uuid,
    pub page: u32,
    pub limit: u32,
    pub search: Option<String>,
}

impl ParticipantFilter {
    pub fn all(room_id: Uuid) -> Self {
        Self {
            room_id,
            page: 0,
            limit: 0,
            search: None,
        }
    }

    pub fn top(room_id: Uuid, limit: u32) -> Self {
        Self {
            room_id,
            page: 1,
            limit,
            search: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MessageHistoryFilter {
    /// Scope to one room; `None` selects across every room the user is in,
    /// in which case `messages_per_room` caps each room's slice.
    pub room_id: Option<Uuid>,
    pub page: u32,
    pub limit: u32,
    pub before_message_id: Option<Uuid>,
    pub after_message_id: Option<Uuid>,
    pub before_date: Option<DateTime<Utc>>,
    pub after_date: Option<DateTime<Utc>>,
    pub messages_per_room: u32,
}

#[derive(Debug, Clone)]
pub struct MessageAudienceFilter {
    pub message_id: Uuid,
    pub page: u32,
    pub limit: u32,
}

// --- Contract ---

/// User identity lookups. Users are mastered in the relational store; the
/// wide-column repository delegates here.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_user_by_id(&self, id: Uuid) -> AppResult<Option<User>>;
    async fn get_users_by_id(&self, ids: &[Uuid]) -> AppResult<Vec<User>>;
    async fn get_all_user_ids(&self) -> AppResult<Vec<Uuid>>;
}

#[async_trait]
pub trait ChatRepository: UserStore {
    // Rooms
    async fn create_room(&self, user_id: Uuid, req: &CreateRoomRequest) -> AppResult<Room>;
    async fn get_room(
        &self,
        user_id: Uuid,
        room_id: Uuid,
        load_all: bool,
        use_cache: bool,
    ) -> AppResult<Option<Room>>;
    async fn get_room_list(
        &self,
        user_id: Uuid,
        filter: &RoomFilter,
    ) -> AppResult<(Vec<Room>, PaginationMeta)>;
    async fn get_room_list_deleted(
        &self,
        user_id: Uuid,
        since: Option<DateTime<Utc>>,
    ) -> AppResult<Vec<Uuid>>;
    async fn leave_room(
        &self,
        user_id: Uuid,
        room_id: Uuid,
        participants: &[Uuid],
        leave_all: bool,
    ) -> AppResult<Vec<User>>;
    async fn delete_room(&self, user_id: Uuid, room_id: Uuid) -> AppResult<()>;
    async fn update_room(&self, user_id: Uuid, room_id: Uuid, req: &UpdateRoomRequest)
        -> AppResult<()>;
    async fn pin_room(&self, user_id: Uuid, room_id: Uuid, pin: bool) -> AppResult<()>;
    async fn mute_room(&self, user_id: Uuid, room_id: Uuid, mute: bool) -> AppResult<()>;
    async fn block_user(
        &self,
        user_id: Uuid,
        room_id: Uuid,
        block: bool,
        partner: Option<Uuid>,
    ) -> AppResult<()>;

    // Membership
    async fn get_room_participants(
        &self,
        filter: &ParticipantFilter,
    ) -> AppResult<(Vec<RoomParticipant>, PaginationMeta)>;
    async fn add_participants(
        &self,
        user_id: Uuid,
        room_id: Uuid,
        participants: &[Uuid],
    ) -> AppResult<Vec<User>>;
    async fn update_participant_role(
        &self,
        user_id: Uuid,
        room_id: Uuid,
        participant: Uuid,
        role: MemberRole,
    ) -> AppResult<()>;
    async fn is_partner_muted(&self, user_id: Uuid, room_id: Uuid) -> AppResult<bool>;

    // Messages
    async fn save_message(
        &self,
        user_id: Uuid,
        req: &SendMessageRequest,
        content_decrypted: Option<&str>,
    ) -> AppResult<MessageData>;
    async fn get_message(&self, user_id: Uuid, message_id: Uuid) -> AppResult<Option<MessageData>>;
    async fn get_message_simple(
        &self,
        user_id: Uuid,
        message_id: Uuid,
    ) -> AppResult<Option<MessageData>>;
    async fn get_message_by_sender_message_id(
        &self,
        user_id: Uuid,
        sender_message_id: &str,
    ) -> AppResult<Option<MessageData>>;
    async fn update_message(&self, user_id: Uuid, message_id: Uuid, content: &str) -> AppResult<()>;
    async fn delete_messages(&self, user_id: Uuid, message_ids: &[Uuid]) -> AppResult<()>;
    async fn get_messages_from_room(
        &self,
        user_id: Uuid,
        filter: &MessageHistoryFilter,
    ) -> AppResult<(Vec<MessageData>, PaginationMeta)>;
    async fn react_to_message(
        &self,
        user_id: Uuid,
        message_id: Uuid,
        reaction: &str,
    ) -> AppResult<()>;
    async fn mark_messages_as_read(
        &self,
        user_id: Uuid,
        room_id: Uuid,
        message_ids: &[Uuid],
        since: Option<DateTime<Utc>>,
    ) -> AppResult<i32>;
    async fn get_message_read(
        &self,
        filter: &MessageAudienceFilter,
    ) -> AppResult<(Vec<MessageUserRead>, PaginationMeta)>;
    async fn get_message_reactions(
        &self,
        filter: &MessageAudienceFilter,
    ) -> AppResult<(Vec<Reaction>, PaginationMeta)>;

    /// Post-send fan-out: per-recipient metadata for everyone except the
    /// sender. Runs detached from the originating request.
    async fn create_message_meta_for_participants(
        &self,
        room_id: Uuid,
        message_id: Uuid,
        sender_id: Uuid,
    ) -> AppResult<()>;
}
