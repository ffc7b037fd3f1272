//! Wide-column repository over ScyllaDB.
//!
//! One table per access pattern. The inbox (`rooms_by_user`) clusters on
//! `(is_pinned DESC, last_message_at DESC)`, so every new message, pin or
//! role change moves a row: read the current clustering coordinates from
//! `room_membership_lookup`, delete the old row, insert the new one, update
//! the lookup. The lookup table is the source of truth for those
//! coordinates; `rooms_by_user` is never probed by room id directly.
//! Counter statements are never mixed into batches with regular writes.
//! User identity is mastered in the relational store and reached through
//! `UserStore`.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::StreamExt;
use scylla::batch::{Batch, BatchType};
use scylla::frame::value::{Counter, CqlTimeuuid};
use scylla::FromRow;
use scylla::Session;
use scylla::SerializeRow;
use uuid::Uuid;

use ripple_shared::types::PaginationMeta;
use ripple_shared::{AppError, AppResult};

use crate::cache::{room_cache_key, RoomCache};
use crate::crypto::MessageCipher;
use crate::domain::{
    CreateRoomRequest, MemberRole, MessageData, MessageStatus, MessageUserRead, Reaction, Room,
    RoomParticipant, RoomType, SendMessageRequest, UpdateRoomRequest, User,
};
use crate::ids;
use crate::repository::{
    ChatRepository, MessageAudienceFilter, MessageHistoryFilter, ParticipantFilter, RoomFilter,
    UserStore,
};

const AUTO_JOIN_BATCH: usize = 100;
const DEFAULT_MESSAGES_PER_ROOM: u32 = 10;

/// Actor recorded for background maintenance work (channel auto-join).
const SYSTEM_USER: Uuid = Uuid::nil();

fn internal<E>(e: E) -> AppError
where
    E: std::error::Error + Send + Sync + 'static,
{
    AppError::Internal(anyhow::Error::new(e))
}

fn sort_pair(a: Uuid, b: Uuid) -> (Uuid, Uuid) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

#[derive(Clone)]
pub struct ScyllaChatRepository {
    session: Arc<Session>,
    users: Arc<dyn UserStore>,
    cache: RoomCache,
    cipher: Arc<MessageCipher>,
}

// --- Typed rows ---

#[derive(FromRow)]
struct RoomDetailsRow {
    name: Option<String>,
    description: Option<String>,
    image: Option<String>,
    room_type: String,
    encryption_data: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    join_all_user: Option<bool>,
    send_message: Option<bool>,
    add_member: Option<bool>,
    edit_group: Option<bool>,
}

#[derive(FromRow)]
struct InboxRow {
    room_id: Uuid,
    room_name: Option<String>,
    room_image: Option<String>,
    room_type: String,
    last_message_at: DateTime<Utc>,
    is_muted: Option<bool>,
    is_pinned: bool,
    role: String,
    last_message_id: Option<CqlTimeuuid>,
    last_message_preview: Option<String>,
    last_message_type: Option<String>,
    last_message_sender_id: Option<Uuid>,
    last_message_sender_name: Option<String>,
    last_message_sender_phone: Option<String>,
    last_message_status: Option<i32>,
    last_message_updated_at: Option<DateTime<Utc>>,
}

/// Values for the `rooms_by_user` INSERT in the inbox fan-out/pin/mute
/// batches. A plain tuple can't be used here: scylla's `SerializeRow` is
/// only implemented for tuples up to 16 elements, and this insert has 17
/// columns.
#[derive(SerializeRow)]
#[scylla(flavor = "enforce_order", skip_name_checks)]
struct RoomsByUserInsert {
    user_id: Uuid,
    is_pinned: bool,
    last_message_at: DateTime<Utc>,
    room_id: Uuid,
    room_name: Option<String>,
    room_image: Option<String>,
    room_type: String,
    is_muted: Option<bool>,
    role: String,
    last_message_id: Option<CqlTimeuuid>,
    last_message_preview: Option<String>,
    last_message_type: Option<String>,
    last_message_sender_id: Option<Uuid>,
    last_message_sender_name: Option<String>,
    last_message_sender_phone: Option<String>,
    last_message_status: Option<i32>,
    last_message_updated_at: Option<DateTime<Utc>>,
}

#[derive(FromRow)]
struct StoredMessageRow {
    message_id: CqlTimeuuid,
    sender_id: Uuid,
    content: Option<String>,
    message_type: Option<String>,
    created_at: DateTime<Utc>,
    edited: Option<bool>,
    is_deleted: Option<bool>,
}

impl InboxRow {
    fn last_message(&self, room_id: Uuid) -> Option<MessageData> {
        let id: Uuid = (*self.last_message_id.as_ref()?).into();
        let created = self.last_message_updated_at.unwrap_or(self.last_message_at);
        let mut msg = MessageData::bare(
            id,
            room_id,
            self.last_message_sender_id.unwrap_or(Uuid::nil()),
            created,
        );
        msg.content = self.last_message_preview.clone().unwrap_or_default();
        msg.message_type = self
            .last_message_type
            .clone()
            .unwrap_or_else(|| "user_message".into());
        msg.sender_name = self.last_message_sender_name.clone().unwrap_or_default();
        msg.sender_phone = self.last_message_sender_phone.clone().unwrap_or_default();
        msg.status = MessageStatus::from_i32(self.last_message_status.unwrap_or(0));
        msg.updated_at = created;
        Some(msg)
    }

    fn into_room(self) -> Room {
        let last_message = self.last_message(self.room_id);
        Room {
            id: self.room_id,
            room_type: RoomType::parse(&self.room_type).unwrap_or(RoomType::Group),
            name: self.room_name.unwrap_or_default(),
            description: String::new(),
            photo_url: self.room_image.unwrap_or_default(),
            encryption_data: String::new(),
            join_all_user: false,
            send_message: true,
            add_member: false,
            edit_group: false,
            created_at: self.last_message_at,
            updated_at: self.last_message_at,
            last_message_at: Some(self.last_message_at),
            last_message,
            unread_count: 0,
            is_pinned: self.is_pinned,
            is_muted: self.is_muted.unwrap_or(false),
            is_partner_blocked: false,
            role: MemberRole::parse(&self.role),
            partner: None,
            participants: Vec::new(),
        }
    }
}

impl ScyllaChatRepository {
    pub fn new(
        session: Arc<Session>,
        users: Arc<dyn UserStore>,
        cache: RoomCache,
        cipher: Arc<MessageCipher>,
    ) -> Self {
        Self {
            session,
            users,
            cache,
            cipher,
        }
    }

    /// Current clustering coordinates of a user's inbox row.
    async fn membership_lookup(
        &self,
        user_id: Uuid,
        room_id: Uuid,
    ) -> AppResult<Option<(bool, DateTime<Utc>)>> {
        let result = self
            .session
            .query(
                "SELECT is_pinned, last_message_at FROM room_membership_lookup \
                 WHERE user_id = ? AND room_id = ?",
                (user_id, room_id),
            )
            .await
            .map_err(internal)?;
        result
            .maybe_first_row_typed::<(bool, DateTime<Utc>)>()
            .map_err(internal)
    }

    async fn unread_count(&self, user_id: Uuid, room_id: Uuid) -> i64 {
        let fetched = self
            .session
            .query(
                "SELECT unread_count FROM room_counters_by_user WHERE user_id = ? AND room_id = ?",
                (user_id, room_id),
            )
            .await
            .ok()
            .and_then(|r| r.maybe_first_row_typed::<(Counter,)>().ok())
            .flatten();
        fetched.map(|(c,)| c.0).unwrap_or(0)
    }

    /// Counters only move by deltas, so "reset" reads the current value and
    /// decrements it away.
    async fn reset_unread_counter(&self, user_id: Uuid, room_id: Uuid) -> AppResult<()> {
        let current = self.unread_count(user_id, room_id).await;
        if current != 0 {
            self.session
                .query(
                    "UPDATE room_counters_by_user SET unread_count = unread_count - ? \
                     WHERE user_id = ? AND room_id = ?",
                    (Counter(current), user_id, room_id),
                )
                .await
                .map_err(internal)?;
        }
        Ok(())
    }

    async fn init_unread_counter(&self, user_id: Uuid, room_id: Uuid) {
        if let Err(e) = self
            .session
            .query(
                "UPDATE room_counters_by_user SET unread_count = unread_count + 0 \
                 WHERE user_id = ? AND room_id = ?",
                (user_id, room_id),
            )
            .await
        {
            tracing::warn!(error = %e, user_id = %user_id, room_id = %room_id, "failed to initialize unread counter");
        }
    }

    /// Register a member in every membership-facing table. The inbox row,
    /// the lookup row and the roster row go together in one batch; the
    /// counter is initialized separately with `+0`.
    async fn insert_membership(
        &self,
        room_id: Uuid,
        user_id: Uuid,
        role: MemberRole,
        room_name: &str,
        room_image: &str,
        room_type: &str,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        let mut batch = Batch::new(BatchType::Logged);
        batch.append_statement(
            "INSERT INTO participants_by_room (room_id, user_id, role, joined_at, is_muted, is_partner_blocked) \
             VALUES (?, ?, ?, ?, false, false)",
        );
        batch.append_statement(
            "INSERT INTO rooms_by_user (user_id, is_pinned, last_message_at, room_id, room_name, room_image, room_type, is_muted, role) \
             VALUES (?, false, ?, ?, ?, ?, ?, false, ?)",
        );
        batch.append_statement(
            "INSERT INTO room_membership_lookup (user_id, room_id, is_pinned, last_message_at) \
             VALUES (?, ?, false, ?)",
        );

        let values = (
            (room_id, user_id, role.as_str(), now),
            (
                user_id,
                now,
                room_id,
                room_name,
                room_image,
                room_type,
                role.as_str(),
            ),
            (user_id, room_id, now),
        );
        self.session.batch(&batch, values).await.map_err(internal)?;

        self.init_unread_counter(user_id, room_id).await;
        Ok(())
    }

    /// Move a user's inbox row to new clustering coordinates after a new
    /// message: delete at the old `(is_pinned, last_message_at)`, insert at
    /// `(is_pinned, now)`, then advance the lookup.
    async fn move_inbox_row_for_message(
        &self,
        user_id: Uuid,
        room_id: Uuid,
        now: DateTime<Utc>,
        message: &MessageData,
    ) {
        let lookup = match self.membership_lookup(user_id, room_id).await {
            Ok(Some(found)) => found,
            Ok(None) => {
                tracing::warn!(user_id = %user_id, room_id = %room_id, "inbox fan-out skipped: no membership lookup");
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, user_id = %user_id, room_id = %room_id, "inbox fan-out lookup failed");
                return;
            }
        };
        let (is_pinned, last_message_at) = lookup;

        let existing = self
            .session
            .query(
                "SELECT room_name, room_image, room_type, is_muted, role FROM rooms_by_user \
                 WHERE user_id = ? AND is_pinned = ? AND last_message_at = ? AND room_id = ?",
                (user_id, is_pinned, last_message_at, room_id),
            )
            .await
            .ok()
            .and_then(|r| {
                r.maybe_first_row_typed::<(Option<String>, Option<String>, String, Option<bool>, String)>()
                    .ok()
                    .flatten()
            });

        let Some((room_name, room_image, room_type, is_muted, role)) = existing else {
            tracing::warn!(user_id = %user_id, room_id = %room_id, "inbox fan-out skipped: no inbox row at lookup coordinates");
            return;
        };

        let mut batch = Batch::new(BatchType::Logged);
        batch.append_statement(
            "DELETE FROM rooms_by_user \
             WHERE user_id = ? AND is_pinned = ? AND last_message_at = ? AND room_id = ?",
        );
        batch.append_statement(
            "INSERT INTO rooms_by_user (user_id, is_pinned, last_message_at, room_id, room_name, room_image, room_type, is_muted, role, \
             last_message_id, last_message_preview, last_message_type, last_message_sender_id, last_message_sender_name, last_message_sender_phone, last_message_status, last_message_updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        );
        batch.append_statement(
            "UPDATE room_membership_lookup SET last_message_at = ? WHERE user_id = ? AND room_id = ?",
        );

        let values = (
            (user_id, is_pinned, last_message_at, room_id),
            RoomsByUserInsert {
                user_id,
                is_pinned,
                last_message_at: now,
                room_id,
                room_name,
                room_image,
                room_type,
                is_muted,
                role,
                last_message_id: Some(CqlTimeuuid::from(message.id)),
                last_message_preview: Some(message.content.clone()),
                last_message_type: Some(message.message_type.clone()),
                last_message_sender_id: Some(message.sender_id),
                last_message_sender_name: Some(message.sender_name.clone()),
                last_message_sender_phone: Some(message.sender_phone.clone()),
                last_message_status: Some(MessageStatus::Delivered.as_i32()),
                last_message_updated_at: Some(now),
            },
            (now, user_id, room_id),
        );

        if let Err(e) = self.session.batch(&batch, values).await {
            tracing::error!(error = %e, user_id = %user_id, room_id = %room_id, "inbox fan-out batch failed");
        }
    }

    /// Background mass-join for `join_all_user` channels. Batches of 100,
    /// failures logged per batch, no cross-batch guarantee.
    fn spawn_channel_auto_join(&self, room_id: Uuid) {
        let repo = self.clone();
        tokio::spawn(async move {
            tracing::info!(room_id = %room_id, "channel auto-join started");
            let all_users = match repo.users.get_all_user_ids().await {
                Ok(ids) => ids,
                Err(e) => {
                    tracing::error!(error = %e, room_id = %room_id, "channel auto-join aborted: user listing failed");
                    return;
                }
            };

            for chunk in all_users.chunks(AUTO_JOIN_BATCH) {
                match repo.add_participants(SYSTEM_USER, room_id, chunk).await {
                    Ok(added) => {
                        tracing::info!(room_id = %room_id, added = added.len(), "channel auto-join batch done")
                    }
                    Err(e) => {
                        tracing::error!(error = %e, room_id = %room_id, batch = chunk.len(), "channel auto-join batch failed")
                    }
                }
            }
            tracing::info!(room_id = %room_id, total = all_users.len(), "channel auto-join finished");
        });
    }

    async fn get_messages_from_single_room(
        &self,
        user_id: Uuid,
        room_id: Uuid,
        filter: &MessageHistoryFilter,
        limit_override: Option<u32>,
    ) -> AppResult<Vec<MessageData>> {
        let limit = limit_override.unwrap_or(filter.limit);

        let mut cql = String::from(
            "SELECT message_id, sender_id, content, type, created_at, edited, is_deleted \
             FROM messages_by_room WHERE room_id = ?",
        );
        if filter.before_message_id.is_some() {
            cql.push_str(" AND message_id < ?");
        }
        if filter.after_message_id.is_some() {
            cql.push_str(" AND message_id > ?");
        }
        if limit > 0 {
            cql.push_str(" LIMIT ?");
        }

        // The bound-marker set varies, so bind the widest shape used.
        let result = match (filter.before_message_id, filter.after_message_id, limit > 0) {
            (Some(b), Some(a), true) => {
                self.session
                    .query(cql, (room_id, CqlTimeuuid::from(b), CqlTimeuuid::from(a), limit as i32))
                    .await
            }
            (Some(b), Some(a), false) => {
                self.session
                    .query(cql, (room_id, CqlTimeuuid::from(b), CqlTimeuuid::from(a)))
                    .await
            }
            (Some(b), None, true) => {
                self.session
                    .query(cql, (room_id, CqlTimeuuid::from(b), limit as i32))
                    .await
            }
            (Some(b), None, false) => self.session.query(cql, (room_id, CqlTimeuuid::from(b))).await,
            (None, Some(a), true) => {
                self.session
                    .query(cql, (room_id, CqlTimeuuid::from(a), limit as i32))
                    .await
            }
            (None, Some(a), false) => self.session.query(cql, (room_id, CqlTimeuuid::from(a))).await,
            (None, None, true) => self.session.query(cql, (room_id, limit as i32)).await,
            (None, None, false) => self.session.query(cql, (room_id,)).await,
        }
        .map_err(internal)?;

        let rows = result.rows_typed::<StoredMessageRow>().map_err(internal)?;
        let mut messages = Vec::new();
        for row in rows {
            let row = row.map_err(internal)?;
            let mut msg = MessageData::bare(
                row.message_id.into(),
                room_id,
                row.sender_id,
                row.created_at,
            );
            msg.content = row.content.unwrap_or_default();
            msg.message_type = row.message_type.unwrap_or_else(|| "user_message".into());
            msg.edited = row.edited.unwrap_or(false);
            msg.is_deleted = row.is_deleted.unwrap_or(false);
            messages.push(msg.tombstoned());
        }

        self.enrich_messages_with_senders(&mut messages).await?;
        self.enrich_messages_with_status(user_id, room_id, &mut messages)
            .await?;
        Ok(messages)
    }

    async fn enrich_messages_with_senders(&self, messages: &mut [MessageData]) -> AppResult<()> {
        let mut sender_ids: Vec<Uuid> = messages.iter().map(|m| m.sender_id).collect();
        sender_ids.sort();
        sender_ids.dedup();
        if sender_ids.is_empty() {
            return Ok(());
        }

        let users = self.users.get_users_by_id(&sender_ids).await?;
        for msg in messages.iter_mut() {
            if let Some(user) = users.iter().find(|u| u.id == msg.sender_id) {
                msg.sender_name = user.name.clone();
                msg.sender_phone = user.phone.clone();
                msg.sender_avatar = user.avatar.clone();
            }
        }
        Ok(())
    }

    async fn enrich_messages_with_status(
        &self,
        user_id: Uuid,
        room_id: Uuid,
        messages: &mut [MessageData],
    ) -> AppResult<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let ids: Vec<CqlTimeuuid> = messages.iter().map(|m| CqlTimeuuid::from(m.id)).collect();

        let result = self
            .session
            .query(
                "SELECT message_id, status FROM message_status_by_user \
                 WHERE user_id = ? AND room_id = ? AND message_id IN ?",
                (user_id, room_id, ids),
            )
            .await
            .map_err(internal)?;

        for row in result.rows_typed::<(CqlTimeuuid, i32)>().map_err(internal)? {
            let (message_id, status) = row.map_err(internal)?;
            let message_id: Uuid = message_id.into();
            if let Some(msg) = messages.iter_mut().find(|m| m.id == message_id) {
                msg.status = MessageStatus::from_i32(status);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl UserStore for ScyllaChatRepository {
    async fn get_user_by_id(&self, id: Uuid) -> AppResult<Option<User>> {
        self.users.get_user_by_id(id).await
    }

    async fn get_users_by_id(&self, ids: &[Uuid]) -> AppResult<Vec<User>> {
        self.users.get_users_by_id(ids).await
    }

    async fn get_all_user_ids(&self) -> AppResult<Vec<Uuid>> {
        self.users.get_all_user_ids().await
    }
}

#[async_trait]
impl ChatRepository for ScyllaChatRepository {
    async fn create_room(&self, user_id: Uuid, req: &CreateRoomRequest) -> AppResult<Room> {
        // p2p uniqueness is enforced by a probe of the sorted pair. Racing
        // probes can in theory both miss; the next lookup resolves to one
        // room and the duplicate stays unreferenced.
        if req.room_type == RoomType::P2p {
            if let Some(peer) = req.participants.first().copied() {
                let (user1, user2) = sort_pair(user_id, peer);
                let existing = self
                    .session
                    .query(
                        "SELECT room_id FROM p2p_room_by_users WHERE user1_id = ? AND user2_id = ?",
                        (user1, user2),
                    )
                    .await
                    .map_err(internal)?
                    .maybe_first_row_typed::<(Uuid,)>()
                    .map_err(internal)?;

                if let Some((room_id,)) = existing {
                    if let Some(room) = self.get_room(user_id, room_id, true, false).await? {
                        return Ok(room);
                    }
                }
            }
        }

        let room_id = Uuid::new_v4();
        let now = Utc::now();

        let encryption_data = self
            .cipher
            .generate_room_key()
            .map_err(|e| AppError::crypto(e.to_string()))?;

        let (send_message, add_member, edit_group) = if req.room_type == RoomType::P2p {
            (true, false, false)
        } else {
            (
                req.send_message.unwrap_or(true),
                req.add_member.unwrap_or(false),
                req.edit_group.unwrap_or(false),
            )
        };
        let join_all_user = req.join_all_user && req.room_type == RoomType::Channel;
        let name = req.name.clone().unwrap_or_default();
        let image = req.photo_url.clone().unwrap_or_default();

        self.session
            .query(
                "INSERT INTO room_details (room_id, name, description, image, type, encryption_data, created_at, updated_at, join_all_user, send_message, add_member, edit_group) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                (
                    room_id,
                    &name,
                    req.description.clone().unwrap_or_default(),
                    &image,
                    req.room_type.as_str(),
                    &encryption_data,
                    now,
                    now,
                    join_all_user,
                    send_message,
                    add_member,
                    edit_group,
                ),
            )
            .await
            .map_err(internal)?;

        let mut participant_set: HashSet<Uuid> = req.participants.iter().copied().collect();
        participant_set.insert(user_id);

        for participant in &participant_set {
            let role = if *participant == user_id {
                MemberRole::Owner
            } else {
                MemberRole::Member
            };
            self.insert_membership(
                room_id,
                *participant,
                role,
                &name,
                &image,
                req.room_type.as_str(),
                now,
            )
            .await?;
        }

        if req.room_type == RoomType::P2p {
            if let Some(peer) = req.participants.first().copied() {
                let (user1, user2) = sort_pair(user_id, peer);
                self.session
                    .query(
                        "INSERT INTO p2p_room_by_users (user1_id, user2_id, room_id) VALUES (?, ?, ?)",
                        (user1, user2, room_id),
                    )
                    .await
                    .map_err(internal)?;
            }
        }

        if join_all_user {
            self.spawn_channel_auto_join(room_id);
        }

        self.get_room(user_id, room_id, true, false)
            .await?
            .ok_or_else(|| AppError::internal("room vanished after creation"))
    }

    async fn get_room(
        &self,
        user_id: Uuid,
        room_id: Uuid,
        load_all: bool,
        use_cache: bool,
    ) -> AppResult<Option<Room>> {
        let cache_key = room_cache_key(room_id, user_id, load_all);
        if use_cache {
            if let Some(cached) = self.cache.get_room(&cache_key).await {
                return Ok(Some(cached));
            }
        }

        let details = self
            .session
            .query(
                "SELECT name, description, image, type, encryption_data, created_at, updated_at, join_all_user, send_message, add_member, edit_group \
                 FROM room_details WHERE room_id = ?",
                (room_id,),
            )
            .await
            .map_err(internal)?
            .maybe_first_row_typed::<RoomDetailsRow>()
            .map_err(internal)?;

        let Some(details) = details else {
            return Ok(None);
        };

        let mut room = Room {
            id: room_id,
            room_type: RoomType::parse(&details.room_type).unwrap_or(RoomType::Group),
            name: details.name.unwrap_or_default(),
            description: details.description.unwrap_or_default(),
            photo_url: details.image.unwrap_or_default(),
            encryption_data: details.encryption_data.unwrap_or_default(),
            join_all_user: details.join_all_user.unwrap_or(false),
            send_message: details.send_message.unwrap_or(true),
            add_member: details.add_member.unwrap_or(false),
            edit_group: details.edit_group.unwrap_or(false),
            created_at: details.created_at,
            updated_at: details.updated_at,
            last_message_at: None,
            last_message: None,
            unread_count: 0,
            is_pinned: false,
            is_muted: false,
            is_partner_blocked: false,
            role: MemberRole::Member,
            partner: None,
            participants: Vec::new(),
        };

        if let Some((is_pinned, last_message_at)) = self.membership_lookup(user_id, room_id).await? {
            room.is_pinned = is_pinned;
            room.last_message_at = Some(last_message_at);

            let inbox = self
                .session
                .query(
                    "SELECT room_id, room_name, room_image, room_type, last_message_at, is_muted, is_pinned, role, \
                     last_message_id, last_message_preview, last_message_type, last_message_sender_id, last_message_sender_name, last_message_sender_phone, last_message_status, last_message_updated_at \
                     FROM rooms_by_user \
                     WHERE user_id = ? AND is_pinned = ? AND last_message_at = ? AND room_id = ?",
                    (user_id, is_pinned, last_message_at, room_id),
                )
                .await
                .map_err(internal)?
                .maybe_first_row_typed::<InboxRow>()
                .map_err(internal)?;

            if let Some(inbox) = inbox {
                room.role = MemberRole::parse(&inbox.role);
                room.is_muted = inbox.is_muted.unwrap_or(false);
                room.last_message = inbox.last_message(room_id);
            }
        }

        room.unread_count = self.unread_count(user_id, room_id).await as i32;

        // My own roster row carries the per-user block flag.
        let my_flags = self
            .session
            .query(
                "SELECT is_partner_blocked FROM participants_by_room WHERE room_id = ? AND user_id = ?",
                (room_id, user_id),
            )
            .await
            .map_err(internal)?
            .maybe_first_row_typed::<(Option<bool>,)>()
            .map_err(internal)?;
        if let Some((blocked,)) = my_flags {
            room.is_partner_blocked = blocked.unwrap_or(false);
        }

        if load_all {
            let (participants, _) = self
                .get_room_participants(&ParticipantFilter::all(room_id))
                .await?;
            if room.room_type == RoomType::P2p {
                room.partner = participants.into_iter().find(|p| p.id != user_id);
            } else {
                room.participants = participants;
            }
        }

        let room = room.format();
        if use_cache {
            self.cache.set_room(room_id, &cache_key, &room).await;
        }
        Ok(Some(room))
    }

    async fn get_room_list(
        &self,
        user_id: Uuid,
        filter: &RoomFilter,
    ) -> AppResult<(Vec<Room>, PaginationMeta)> {
        let mut iter = self
            .session
            .query_iter(
                "SELECT room_id, room_name, room_image, room_type, last_message_at, is_muted, is_pinned, role, \
                 last_message_id, last_message_preview, last_message_type, last_message_sender_id, last_message_sender_name, last_message_sender_phone, last_message_status, last_message_updated_at \
                 FROM rooms_by_user WHERE user_id = ?",
                (user_id,),
            )
            .await
            .map_err(internal)?;

        let mut all_rooms: Vec<Room> = Vec::new();
        while let Some(row) = iter.next().await {
            let row = row.map_err(internal)?;
            let inbox: InboxRow = row.into_typed().map_err(internal)?;
            all_rooms.push(inbox.into_room());
        }

        // Unread counters, one partition per (user, room).
        let room_ids: Vec<Uuid> = all_rooms.iter().map(|r| r.id).collect();
        if !room_ids.is_empty() {
            let counters = self
                .session
                .query(
                    "SELECT room_id, unread_count FROM room_counters_by_user \
                     WHERE user_id = ? AND room_id IN ?",
                    (user_id, room_ids),
                )
                .await
                .map_err(internal)?;
            for row in counters.rows_typed::<(Uuid, Counter)>().map_err(internal)? {
                let (room_id, count) = row.map_err(internal)?;
                if let Some(room) = all_rooms.iter_mut().find(|r| r.id == room_id) {
                    room.unread_count = count.0 as i32;
                }
            }
        }

        // Roster previews for group rooms, fetched concurrently.
        let group_ids: Vec<Uuid> = all_rooms
            .iter()
            .filter(|r| r.room_type != RoomType::P2p)
            .map(|r| r.id)
            .collect();
        if !group_ids.is_empty() {
            let fetches = group_ids.iter().map(|room_id| {
                let filter = ParticipantFilter::top(*room_id, 5);
                async move {
                    let participants = self.get_room_participants(&filter).await;
                    (*room_id, participants)
                }
            });
            for (room_id, fetched) in join_all(fetches).await {
                match fetched {
                    Ok((participants, _)) => {
                        if let Some(room) = all_rooms.iter_mut().find(|r| r.id == room_id) {
                            room.participants = participants;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, room_id = %room_id, "room list participant fetch failed")
                    }
                }
            }
        }

        let total = all_rooms.len() as u32;

        // Search and pagination happen in the application; the partition is
        // already ordered pinned-first, newest-first by the clustering key.
        let mut filtered: Vec<Room> = if let Some(search) = &filter.search {
            let needle = search.to_lowercase();
            all_rooms
                .into_iter()
                .filter(|r| r.name.to_lowercase().contains(&needle))
                .collect()
        } else {
            all_rooms
        };

        if let Some(room_type) = filter.room_type {
            filtered.retain(|r| r.room_type == room_type);
        }
        if let Some(since) = filter.since {
            filtered.retain(|r| r.last_message_at.map(|t| t > since).unwrap_or(false));
        }

        if filter.page > 0 && filter.limit > 0 {
            let start = ((filter.page - 1) * filter.limit) as usize;
            filtered = if start >= filtered.len() {
                Vec::new()
            } else {
                let end = (start + filter.limit as usize).min(filtered.len());
                filtered[start..end].to_vec()
            };
        }

        let meta = PaginationMeta::new(total, filtered.len() as u32, filter.limit, filter.page);
        Ok((filtered, meta))
    }

    async fn get_room_list_deleted(
        &self,
        user_id: Uuid,
        since: Option<DateTime<Utc>>,
    ) -> AppResult<Vec<Uuid>> {
        let result = match since {
            Some(since) => {
                self.session
                    .query(
                        "SELECT room_id FROM deleted_rooms_by_user \
                         WHERE user_id = ? AND deleted_at > ?",
                        (user_id, since),
                    )
                    .await
            }
            None => {
                self.session
                    .query(
                        "SELECT room_id FROM deleted_rooms_by_user WHERE user_id = ?",
                        (user_id,),
                    )
                    .await
            }
        }
        .map_err(internal)?;

        let mut ids = Vec::new();
        for row in result.rows_typed::<(Uuid,)>().map_err(internal)? {
            let (room_id,) = row.map_err(internal)?;
            ids.push(room_id);
        }
        Ok(ids)
    }

    async fn leave_room(
        &self,
        _user_id: Uuid,
        room_id: Uuid,
        participants: &[Uuid],
        _leave_all: bool,
    ) -> AppResult<Vec<User>> {
        let users = self.users.get_users_by_id(participants).await?;
        let now = Utc::now();

        for participant in participants {
            match self.membership_lookup(*participant, room_id).await {
                Ok(Some((is_pinned, last_message_at))) => {
                    let mut batch = Batch::new(BatchType::Logged);
                    batch.append_statement(
                        "DELETE FROM rooms_by_user \
                         WHERE user_id = ? AND is_pinned = ? AND last_message_at = ? AND room_id = ?",
                    );
                    batch.append_statement(
                        "DELETE FROM room_membership_lookup WHERE user_id = ? AND room_id = ?",
                    );
                    batch.append_statement(
                        "INSERT INTO deleted_rooms_by_user (user_id, deleted_at, room_id, reason) \
                         VALUES (?, ?, ?, 'removed')",
                    );
                    let values = (
                        (*participant, is_pinned, last_message_at, room_id),
                        (*participant, room_id),
                        (*participant, now, room_id),
                    );
                    if let Err(e) = self.session.batch(&batch, values).await {
                        tracing::error!(error = %e, user_id = %participant, room_id = %room_id, "leave batch failed");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(error = %e, user_id = %participant, room_id = %room_id, "leave lookup failed")
                }
            }

            if let Err(e) = self
                .session
                .query(
                    "DELETE FROM room_counters_by_user WHERE user_id = ? AND room_id = ?",
                    (*participant, room_id),
                )
                .await
            {
                tracing::warn!(error = %e, user_id = %participant, "failed to drop unread counter");
            }

            self.session
                .query(
                    "DELETE FROM participants_by_room WHERE room_id = ? AND user_id = ?",
                    (room_id, *participant),
                )
                .await
                .map_err(internal)?;
        }

        self.cache.invalidate_room(room_id).await;
        Ok(users)
    }

    async fn delete_room(&self, _user_id: Uuid, room_id: Uuid) -> AppResult<()> {
        let (participants, _) = self
            .get_room_participants(&ParticipantFilter::all(room_id))
            .await?;
        let now = Utc::now();

        for p in &participants {
            match self.membership_lookup(p.id, room_id).await {
                Ok(Some((is_pinned, last_message_at))) => {
                    let mut batch = Batch::new(BatchType::Logged);
                    batch.append_statement(
                        "DELETE FROM rooms_by_user \
                         WHERE user_id = ? AND is_pinned = ? AND last_message_at = ? AND room_id = ?",
                    );
                    batch.append_statement(
                        "DELETE FROM room_membership_lookup WHERE user_id = ? AND room_id = ?",
                    );
                    batch.append_statement(
                        "INSERT INTO deleted_rooms_by_user (user_id, deleted_at, room_id, reason) \
                         VALUES (?, ?, ?, 'deleted')",
                    );
                    let values = (
                        (p.id, is_pinned, last_message_at, room_id),
                        (p.id, room_id),
                        (p.id, now, room_id),
                    );
                    if let Err(e) = self.session.batch(&batch, values).await {
                        tracing::error!(error = %e, user_id = %p.id, room_id = %room_id, "delete-room batch failed");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(error = %e, user_id = %p.id, room_id = %room_id, "delete-room lookup failed")
                }
            }
            let _ = self
                .session
                .query(
                    "DELETE FROM room_counters_by_user WHERE user_id = ? AND room_id = ?",
                    (p.id, room_id),
                )
                .await;
        }

        // Room-keyed partitions go in one batch.
        let mut batch = Batch::new(BatchType::Logged);
        batch.append_statement("DELETE FROM participants_by_room WHERE room_id = ?");
        batch.append_statement("DELETE FROM room_details WHERE room_id = ?");
        batch.append_statement("DELETE FROM messages_by_room WHERE room_id = ?");
        let values = ((room_id,), (room_id,), (room_id,));
        self.session.batch(&batch, values).await.map_err(internal)?;

        self.cache.invalidate_room(room_id).await;
        Ok(())
    }

    async fn update_room(
        &self,
        _user_id: Uuid,
        room_id: Uuid,
        req: &UpdateRoomRequest,
    ) -> AppResult<()> {
        let current = self
            .session
            .query(
                "SELECT name, description, image, type, encryption_data, created_at, updated_at, join_all_user, send_message, add_member, edit_group \
                 FROM room_details WHERE room_id = ?",
                (room_id,),
            )
            .await
            .map_err(internal)?
            .maybe_first_row_typed::<RoomDetailsRow>()
            .map_err(internal)?
            .ok_or_else(|| AppError::not_found("room not found"))?;

        let name = req.name.clone().or(current.name).unwrap_or_default();
        let description = req
            .description
            .clone()
            .or(current.description)
            .unwrap_or_default();
        let image = req.photo_url.clone().or(current.image).unwrap_or_default();
        let send_message = req.send_message.or(current.send_message).unwrap_or(true);
        let add_member = req.add_member.or(current.add_member).unwrap_or(false);
        let edit_group = req.edit_group.or(current.edit_group).unwrap_or(false);

        self.session
            .query(
                "UPDATE room_details SET name = ?, description = ?, image = ?, send_message = ?, add_member = ?, edit_group = ?, updated_at = ? \
                 WHERE room_id = ?",
                (
                    name,
                    description,
                    image,
                    send_message,
                    add_member,
                    edit_group,
                    Utc::now(),
                    room_id,
                ),
            )
            .await
            .map_err(internal)?;

        self.cache.invalidate_room(room_id).await;
        Ok(())
    }

    async fn pin_room(&self, user_id: Uuid, room_id: Uuid, pin: bool) -> AppResult<()> {
        let (is_pinned_old, last_message_at) = self
            .membership_lookup(user_id, room_id)
            .await?
            .ok_or_else(|| AppError::not_found("membership not found"))?;

        let inbox = self
            .session
            .query(
                "SELECT room_id, room_name, room_image, room_type, last_message_at, is_muted, is_pinned, role, \
                 last_message_id, last_message_preview, last_message_type, last_message_sender_id, last_message_sender_name, last_message_sender_phone, last_message_status, last_message_updated_at \
                 FROM rooms_by_user \
                 WHERE user_id = ? AND is_pinned = ? AND last_message_at = ? AND room_id = ?",
                (user_id, is_pinned_old, last_message_at, room_id),
            )
            .await
            .map_err(internal)?
            .maybe_first_row_typed::<InboxRow>()
            .map_err(internal)?
            .ok_or_else(|| AppError::not_found("inbox row not found"))?;

        let mut batch = Batch::new(BatchType::Logged);
        batch.append_statement(
            "DELETE FROM rooms_by_user \
             WHERE user_id = ? AND is_pinned = ? AND last_message_at = ? AND room_id = ?",
        );
        batch.append_statement(
            "INSERT INTO rooms_by_user (user_id, is_pinned, last_message_at, room_id, room_name, room_image, room_type, is_muted, role, \
             last_message_id, last_message_preview, last_message_type, last_message_sender_id, last_message_sender_name, last_message_sender_phone, last_message_status, last_message_updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        );
        batch.append_statement(
            "UPDATE room_membership_lookup SET is_pinned = ? WHERE user_id = ? AND room_id = ?",
        );

        let values = (
            (user_id, is_pinned_old, last_message_at, room_id),
            RoomsByUserInsert {
                user_id,
                is_pinned: pin,
                last_message_at,
                room_id,
                room_name: inbox.room_name,
                room_image: inbox.room_image,
                room_type: inbox.room_type,
                is_muted: inbox.is_muted,
                role: inbox.role,
                last_message_id: inbox.last_message_id,
                last_message_preview: inbox.last_message_preview,
                last_message_type: inbox.last_message_type,
                last_message_sender_id: inbox.last_message_sender_id,
                last_message_sender_name: inbox.last_message_sender_name,
                last_message_sender_phone: inbox.last_message_sender_phone,
                last_message_status: inbox.last_message_status,
                last_message_updated_at: inbox.last_message_updated_at,
            },
            (pin, user_id, room_id),
        );
        self.session.batch(&batch, values).await.map_err(internal)?;

        self.cache.invalidate_room(room_id).await;
        Ok(())
    }

    async fn mute_room(&self, user_id: Uuid, room_id: Uuid, mute: bool) -> AppResult<()> {
        let (is_pinned, last_message_at) = self
            .membership_lookup(user_id, room_id)
            .await?
            .ok_or_else(|| AppError::not_found("membership not found"))?;

        let mut batch = Batch::new(BatchType::Logged);
        batch.append_statement(
            "UPDATE rooms_by_user SET is_muted = ? \
             WHERE user_id = ? AND is_pinned = ? AND last_message_at = ? AND room_id = ?",
        );
        batch.append_statement(
            "UPDATE participants_by_room SET is_muted = ? WHERE room_id = ? AND user_id = ?",
        );
        let values = (
            (mute, user_id, is_pinned, last_message_at, room_id),
            (mute, room_id, user_id),
        );
        self.session.batch(&batch, values).await.map_err(internal)?;

        self.cache.invalidate_room(room_id).await;
        Ok(())
    }

    async fn block_user(
        &self,
        user_id: Uuid,
        room_id: Uuid,
        block: bool,
        _partner: Option<Uuid>,
    ) -> AppResult<()> {
        self.session
            .query(
                "UPDATE participants_by_room SET is_partner_blocked = ? WHERE room_id = ? AND user_id = ?",
                (block, room_id, user_id),
            )
            .await
            .map_err(internal)?;

        self.cache.invalidate_room(room_id).await;
        Ok(())
    }

    async fn get_room_participants(
        &self,
        filter: &ParticipantFilter,
    ) -> AppResult<(Vec<RoomParticipant>, PaginationMeta)> {
        let result = if filter.limit > 0 {
            self.session
                .query(
                    "SELECT user_id, role, is_muted, is_partner_blocked \
                     FROM participants_by_room WHERE room_id = ? LIMIT ?",
                    (filter.room_id, filter.limit as i32),
                )
                .await
        } else {
            self.session
                .query(
                    "SELECT user_id, role, is_muted, is_partner_blocked \
                     FROM participants_by_room WHERE room_id = ?",
                    (filter.room_id,),
                )
                .await
        }
        .map_err(internal)?;

        let mut roster: Vec<(Uuid, String, bool, bool)> = Vec::new();
        for row in result
            .rows_typed::<(Uuid, String, Option<bool>, Option<bool>)>()
            .map_err(internal)?
        {
            let (user_id, role, is_muted, is_blocked) = row.map_err(internal)?;
            roster.push((
                user_id,
                role,
                is_muted.unwrap_or(false),
                is_blocked.unwrap_or(false),
            ));
        }

        let ids: Vec<Uuid> = roster.iter().map(|(id, ..)| *id).collect();
        let users = self.users.get_users_by_id(&ids).await?;

        let mut participants = Vec::with_capacity(roster.len());
        for (user_id, role, is_muted, is_blocked) in roster {
            let user = users.iter().find(|u| u.id == user_id);
            participants.push(RoomParticipant {
                id: user_id,
                name: user.map(|u| u.name.clone()).unwrap_or_default(),
                phone: user.map(|u| u.phone.clone()).unwrap_or_default(),
                avatar: user.and_then(|u| u.avatar.clone()),
                role: MemberRole::parse(&role),
                is_partner_blocked: is_blocked,
                is_partner_muted: is_muted,
            });
        }

        // Search filtering happens after identity enrichment.
        if let Some(search) = &filter.search {
            let needle = search.to_lowercase();
            participants.retain(|p| p.name.to_lowercase().contains(&needle));
        }

        let meta = PaginationMeta::page_only(participants.len() as u32);
        Ok((participants, meta))
    }

    async fn add_participants(
        &self,
        _user_id: Uuid,
        room_id: Uuid,
        participants: &[Uuid],
    ) -> AppResult<Vec<User>> {
        let details = self
            .session
            .query(
                "SELECT name, image, type FROM room_details WHERE room_id = ?",
                (room_id,),
            )
            .await
            .map_err(internal)?
            .maybe_first_row_typed::<(Option<String>, Option<String>, String)>()
            .map_err(internal)?
            .ok_or_else(|| AppError::not_found("room not found"))?;
        let (room_name, room_image, room_type) = details;

        let users = self.users.get_users_by_id(participants).await?;
        let now = Utc::now();

        for user in &users {
            self.insert_membership(
                room_id,
                user.id,
                MemberRole::Member,
                room_name.as_deref().unwrap_or_default(),
                room_image.as_deref().unwrap_or_default(),
                &room_type,
                now,
            )
            .await?;
        }

        self.cache.invalidate_room(room_id).await;
        Ok(users)
    }

    async fn update_participant_role(
        &self,
        _user_id: Uuid,
        room_id: Uuid,
        participant: Uuid,
        role: MemberRole,
    ) -> AppResult<()> {
        let (is_pinned, last_message_at) = self
            .membership_lookup(participant, room_id)
            .await?
            .ok_or_else(|| AppError::not_found("membership not found"))?;

        let mut batch = Batch::new(BatchType::Logged);
        batch.append_statement(
            "UPDATE participants_by_room SET role = ? WHERE room_id = ? AND user_id = ?",
        );
        batch.append_statement(
            "UPDATE rooms_by_user SET role = ? \
             WHERE user_id = ? AND is_pinned = ? AND last_message_at = ? AND room_id = ?",
        );
        let values = (
            (role.as_str(), room_id, participant),
            (role.as_str(), participant, is_pinned, last_message_at, room_id),
        );
        self.session.batch(&batch, values).await.map_err(internal)?;

        self.cache.invalidate_room(room_id).await;
        Ok(())
    }

    async fn is_partner_muted(&self, user_id: Uuid, room_id: Uuid) -> AppResult<bool> {
        let muted = self
            .session
            .query(
                "SELECT is_muted FROM participants_by_room WHERE room_id = ? AND user_id = ?",
                (room_id, user_id),
            )
            .await
            .map_err(internal)?
            .maybe_first_row_typed::<(Option<bool>,)>()
            .map_err(internal)?;
        Ok(muted.and_then(|(m,)| m).unwrap_or(false))
    }

    async fn save_message(
        &self,
        user_id: Uuid,
        req: &SendMessageRequest,
        content_decrypted: Option<&str>,
    ) -> AppResult<MessageData> {
        let room_id = req.room_id;
        let message_id = ids::new_timeuuid();
        let now = Utc::now();
        let message_type = req
            .message_type
            .clone()
            .unwrap_or_else(|| "user_message".to_string());

        let mut batch = Batch::new(BatchType::Logged);
        batch.append_statement(
            "INSERT INTO messages_by_room (room_id, message_id, sender_id, content, content_decrypted, type, created_at, sender_message_id, edited, is_deleted) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, false, false)",
        );
        batch.append_statement("INSERT INTO room_by_message (message_id, room_id) VALUES (?, ?)");
        let values = (
            (
                room_id,
                CqlTimeuuid::from(message_id),
                user_id,
                &req.content,
                content_decrypted,
                &message_type,
                now,
                req.sender_message_id.as_deref(),
            ),
            (CqlTimeuuid::from(message_id), room_id),
        );
        self.session.batch(&batch, values).await.map_err(internal)?;

        if let Some(sender_message_id) = req.sender_message_id.as_deref().filter(|s| !s.is_empty()) {
            self.session
                .query(
                    "INSERT INTO message_by_sender_message_id (sender_message_id, room_id, message_id) \
                     VALUES (?, ?, ?)",
                    (sender_message_id, room_id, CqlTimeuuid::from(message_id)),
                )
                .await
                .map_err(internal)?;
        }

        let (participants, _) = self
            .get_room_participants(&ParticipantFilter::all(room_id))
            .await?;
        let sender = self
            .users
            .get_user_by_id(user_id)
            .await?
            .ok_or_else(|| AppError::not_found("sender not found"))?;

        let mut message = MessageData::bare(message_id, room_id, user_id, now);
        message.content = req.content.clone();
        message.message_type = message_type;
        message.sender_name = sender.name.clone();
        message.sender_phone = sender.phone.clone();
        message.sender_avatar = sender.avatar.clone();
        message.sender_message_id = req.sender_message_id.clone();

        // Move every participant's inbox row to the new clustering key.
        for p in &participants {
            self.move_inbox_row_for_message(p.id, room_id, now, &message)
                .await;
        }

        // Counters and per-user statuses go through their own single-statement
        // path, never batched with the writes above.
        for p in &participants {
            if p.id == user_id {
                let _ = self
                    .session
                    .query(
                        "INSERT INTO message_status_by_user (user_id, room_id, message_id, status) \
                         VALUES (?, ?, ?, ?)",
                        (p.id, room_id, CqlTimeuuid::from(message_id), MessageStatus::Sent.as_i32()),
                    )
                    .await;
            } else {
                if let Err(e) = self
                    .session
                    .query(
                        "UPDATE room_counters_by_user SET unread_count = unread_count + 1 \
                         WHERE user_id = ? AND room_id = ?",
                        (p.id, room_id),
                    )
                    .await
                {
                    tracing::warn!(error = %e, user_id = %p.id, "unread counter bump failed");
                }
                let _ = self
                    .session
                    .query(
                        "INSERT INTO message_status_by_user (user_id, room_id, message_id, status) \
                         VALUES (?, ?, ?, ?)",
                        (
                            p.id,
                            room_id,
                            CqlTimeuuid::from(message_id),
                            MessageStatus::Delivered.as_i32(),
                        ),
                    )
                    .await;
            }
        }

        self.cache.apply_new_message(&message).await;
        Ok(message)
    }

    async fn get_message(&self, user_id: Uuid, message_id: Uuid) -> AppResult<Option<MessageData>> {
        let room = self
            .session
            .query(
                "SELECT room_id FROM room_by_message WHERE message_id = ?",
                (CqlTimeuuid::from(message_id),),
            )
            .await
            .map_err(internal)?
            .maybe_first_row_typed::<(Uuid,)>()
            .map_err(internal)?;

        let Some((room_id,)) = room else {
            return Ok(None);
        };

        let row = self
            .session
            .query(
                "SELECT message_id, sender_id, content, type, created_at, edited, is_deleted \
                 FROM messages_by_room WHERE room_id = ? AND message_id = ?",
                (room_id, CqlTimeuuid::from(message_id)),
            )
            .await
            .map_err(internal)?
            .maybe_first_row_typed::<StoredMessageRow>()
            .map_err(internal)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let mut msg = MessageData::bare(message_id, room_id, row.sender_id, row.created_at);
        msg.content = row.content.unwrap_or_default();
        msg.message_type = row.message_type.unwrap_or_else(|| "user_message".into());
        msg.edited = row.edited.unwrap_or(false);
        msg.is_deleted = row.is_deleted.unwrap_or(false);

        if let Some(sender) = self.users.get_user_by_id(row.sender_id).await? {
            msg.sender_name = sender.name;
            msg.sender_phone = sender.phone;
            msg.sender_avatar = sender.avatar;
        }

        let status = self
            .session
            .query(
                "SELECT status FROM message_status_by_user \
                 WHERE user_id = ? AND room_id = ? AND message_id = ?",
                (user_id, room_id, CqlTimeuuid::from(message_id)),
            )
            .await
            .map_err(internal)?
            .maybe_first_row_typed::<(i32,)>()
            .map_err(internal)?;
        if let Some((status,)) = status {
            msg.status = MessageStatus::from_i32(status);
        }

        Ok(Some(msg.tombstoned()))
    }

    async fn get_message_simple(
        &self,
        user_id: Uuid,
        message_id: Uuid,
    ) -> AppResult<Option<MessageData>> {
        self.get_message(user_id, message_id).await
    }

    async fn get_message_by_sender_message_id(
        &self,
        user_id: Uuid,
        sender_message_id: &str,
    ) -> AppResult<Option<MessageData>> {
        let found = self
            .session
            .query(
                "SELECT room_id, message_id FROM message_by_sender_message_id \
                 WHERE sender_message_id = ?",
                (sender_message_id,),
            )
            .await
            .map_err(internal)?
            .maybe_first_row_typed::<(Uuid, CqlTimeuuid)>()
            .map_err(internal)?;

        let Some((_, message_id)) = found else {
            return Ok(None);
        };
        self.get_message(user_id, message_id.into()).await
    }

    async fn update_message(&self, _user_id: Uuid, message_id: Uuid, content: &str) -> AppResult<()> {
        let room = self
            .session
            .query(
                "SELECT room_id FROM room_by_message WHERE message_id = ?",
                (CqlTimeuuid::from(message_id),),
            )
            .await
            .map_err(internal)?
            .maybe_first_row_typed::<(Uuid,)>()
            .map_err(internal)?
            .ok_or_else(|| AppError::not_found("message not found"))?;

        self.session
            .query(
                "UPDATE messages_by_room SET content = ?, edited = true \
                 WHERE room_id = ? AND message_id = ?",
                (content, room.0, CqlTimeuuid::from(message_id)),
            )
            .await
            .map_err(internal)?;
        Ok(())
    }

    async fn delete_messages(&self, _user_id: Uuid, message_ids: &[Uuid]) -> AppResult<()> {
        for message_id in message_ids {
            let room = self
                .session
                .query(
                    "SELECT room_id FROM room_by_message WHERE message_id = ?",
                    (CqlTimeuuid::from(*message_id),),
                )
                .await
                .map_err(internal)?
                .maybe_first_row_typed::<(Uuid,)>()
                .map_err(internal)?;

            let Some((room_id,)) = room else {
                continue;
            };

            self.session
                .query(
                    "UPDATE messages_by_room SET is_deleted = true \
                     WHERE room_id = ? AND message_id = ?",
                    (room_id, CqlTimeuuid::from(*message_id)),
                )
                .await
                .map_err(internal)?;
        }
        Ok(())
    }

    async fn get_messages_from_room(
        &self,
        user_id: Uuid,
        filter: &MessageHistoryFilter,
    ) -> AppResult<(Vec<MessageData>, PaginationMeta)> {
        if let Some(room_id) = filter.room_id {
            let messages = self
                .get_messages_from_single_room(user_id, room_id, filter, None)
                .await?;
            let meta = PaginationMeta::page_only(messages.len() as u32);
            return Ok((messages, meta));
        }

        // All-rooms mode: top-N per room, fetched concurrently and merged
        // newest-first.
        let (rooms, _) = self.get_room_list(user_id, &RoomFilter::default()).await?;
        let per_room = if filter.messages_per_room > 0 {
            filter.messages_per_room
        } else {
            DEFAULT_MESSAGES_PER_ROOM
        };

        let fetches = rooms.iter().map(|room| {
            let room_id = room.id;
            async move {
                self.get_messages_from_single_room(user_id, room_id, filter, Some(per_room))
                    .await
            }
        });

        let mut all_messages = Vec::new();
        for fetched in join_all(fetches).await {
            all_messages.extend(fetched?);
        }
        all_messages.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        if filter.limit > 0 && all_messages.len() > filter.limit as usize {
            all_messages.truncate(filter.limit as usize);
        }

        let meta = PaginationMeta::page_only(all_messages.len() as u32);
        Ok((all_messages, meta))
    }

    async fn react_to_message(
        &self,
        user_id: Uuid,
        message_id: Uuid,
        reaction: &str,
    ) -> AppResult<()> {
        let existing = self
            .session
            .query(
                "SELECT reaction FROM reactions_by_message WHERE message_id = ? AND user_id = ?",
                (CqlTimeuuid::from(message_id), user_id),
            )
            .await
            .map_err(internal)?
            .maybe_first_row_typed::<(String,)>()
            .map_err(internal)?;

        // Repeating the same reaction toggles it off, as does an empty one;
        // a different value overwrites the row.
        let clears = reaction.is_empty()
            || existing
                .as_ref()
                .map(|(current,)| current.as_str() == reaction)
                .unwrap_or(false);

        if clears {
            self.session
                .query(
                    "DELETE FROM reactions_by_message WHERE message_id = ? AND user_id = ?",
                    (CqlTimeuuid::from(message_id), user_id),
                )
                .await
                .map_err(internal)?;
        } else {
            self.session
                .query(
                    "INSERT INTO reactions_by_message (message_id, user_id, reaction, created_at) \
                     VALUES (?, ?, ?, ?)",
                    (CqlTimeuuid::from(message_id), user_id, reaction, Utc::now()),
                )
                .await
                .map_err(internal)?;
        }
        Ok(())
    }

    async fn mark_messages_as_read(
        &self,
        user_id: Uuid,
        room_id: Uuid,
        message_ids: &[Uuid],
        since: Option<DateTime<Utc>>,
    ) -> AppResult<i32> {
        let mut targets: Vec<Uuid> = message_ids.to_vec();

        if let Some(since) = since {
            let bound = ids::max_timeuuid(since);
            let mut iter = self
                .session
                .query_iter(
                    "SELECT message_id FROM messages_by_room \
                     WHERE room_id = ? AND message_id < ?",
                    (room_id, CqlTimeuuid::from(bound)),
                )
                .await
                .map_err(internal)?;
            while let Some(row) = iter.next().await {
                let row = row.map_err(internal)?;
                let (message_id,): (CqlTimeuuid,) = row.into_typed().map_err(internal)?;
                targets.push(message_id.into());
            }
        }

        let mut seen = HashSet::new();
        targets.retain(|id| seen.insert(*id));

        if targets.is_empty() {
            return Ok(0);
        }

        let now = Utc::now();
        for message_id in &targets {
            let mut batch = Batch::new(BatchType::Logged);
            batch.append_statement(
                "INSERT INTO read_receipts_by_message (message_id, user_id, read_at) VALUES (?, ?, ?)",
            );
            batch.append_statement(
                "INSERT INTO message_status_by_user (user_id, room_id, message_id, status) \
                 VALUES (?, ?, ?, ?)",
            );
            let values = (
                (CqlTimeuuid::from(*message_id), user_id, now),
                (
                    user_id,
                    room_id,
                    CqlTimeuuid::from(*message_id),
                    MessageStatus::Read.as_i32(),
                ),
            );
            self.session.batch(&batch, values).await.map_err(internal)?;
        }

        self.reset_unread_counter(user_id, room_id).await?;
        self.cache.invalidate_room(room_id).await;
        Ok(targets.len() as i32)
    }

    async fn get_message_read(
        &self,
        filter: &MessageAudienceFilter,
    ) -> AppResult<(Vec<MessageUserRead>, PaginationMeta)> {
        let result = if filter.limit > 0 {
            self.session
                .query(
                    "SELECT user_id, read_at FROM read_receipts_by_message \
                     WHERE message_id = ? LIMIT ?",
                    (CqlTimeuuid::from(filter.message_id), filter.limit as i32),
                )
                .await
        } else {
            self.session
                .query(
                    "SELECT user_id, read_at FROM read_receipts_by_message WHERE message_id = ?",
                    (CqlTimeuuid::from(filter.message_id),),
                )
                .await
        }
        .map_err(internal)?;

        let mut receipts: Vec<(Uuid, DateTime<Utc>)> = Vec::new();
        for row in result
            .rows_typed::<(Uuid, DateTime<Utc>)>()
            .map_err(internal)?
        {
            receipts.push(row.map_err(internal)?);
        }

        let ids: Vec<Uuid> = receipts.iter().map(|(id, _)| *id).collect();
        let users = self.users.get_users_by_id(&ids).await?;

        let items: Vec<MessageUserRead> = receipts
            .into_iter()
            .map(|(user_id, read_at)| {
                let user = users.iter().find(|u| u.id == user_id);
                MessageUserRead {
                    user_id,
                    user_name: user.map(|u| u.name.clone()).unwrap_or_default(),
                    user_phone: user.map(|u| u.phone.clone()).unwrap_or_default(),
                    user_avatar: user.and_then(|u| u.avatar.clone()),
                    read_at,
                }
            })
            .collect();

        let meta = PaginationMeta::page_only(items.len() as u32);
        Ok((items, meta))
    }

    async fn get_message_reactions(
        &self,
        filter: &MessageAudienceFilter,
    ) -> AppResult<(Vec<Reaction>, PaginationMeta)> {
        let result = if filter.limit > 0 {
            self.session
                .query(
                    "SELECT user_id, reaction FROM reactions_by_message \
                     WHERE message_id = ? LIMIT ?",
                    (CqlTimeuuid::from(filter.message_id), filter.limit as i32),
                )
                .await
        } else {
            self.session
                .query(
                    "SELECT user_id, reaction FROM reactions_by_message WHERE message_id = ?",
                    (CqlTimeuuid::from(filter.message_id),),
                )
                .await
        }
        .map_err(internal)?;

        let mut raw: Vec<(Uuid, String)> = Vec::new();
        for row in result.rows_typed::<(Uuid, String)>().map_err(internal)? {
            raw.push(row.map_err(internal)?);
        }

        let ids: Vec<Uuid> = raw.iter().map(|(id, _)| *id).collect();
        let users = self.users.get_users_by_id(&ids).await?;

        let items: Vec<Reaction> = raw
            .into_iter()
            .map(|(user_id, reaction)| {
                let user = users.iter().find(|u| u.id == user_id);
                Reaction {
                    message_id: filter.message_id,
                    reacted_by_id: user_id,
                    reacted_by_name: user.map(|u| u.name.clone()).unwrap_or_default(),
                    reacted_by_phone: user.map(|u| u.phone.clone()).unwrap_or_default(),
                    reacted_by_avatar: user.and_then(|u| u.avatar.clone()),
                    reaction,
                }
            })
            .collect();

        let meta = PaginationMeta::page_only(items.len() as u32);
        Ok((items, meta))
    }

    /// Per-recipient state is written on the save path
    /// (`message_status_by_user`, counters), so there is no detached meta
    /// fan-out here.
    async fn create_message_meta_for_participants(
        &self,
        _room_id: Uuid,
        _message_id: Uuid,
        _sender_id: Uuid,
    ) -> AppResult<()> {
        Ok(())
    }
}
