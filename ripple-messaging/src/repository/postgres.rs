//! Relational repository over the normalized Postgres schema.
//!
//! The hot room queries (single room, inbox list) run as one SQL statement
//! with a LATERAL last-message subquery and an unread-count scalar
//! subquery; everything else uses the diesel DSL. Soft-delete columns
//! (`deleted_at` on rooms/messages, `removed_at` on memberships) gate every
//! read. The inbox search relies on the `unaccent` Postgres extension.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, PooledConnection};
use diesel::sql_query;
use diesel::sql_types::{Array, BigInt, Nullable, Text, Timestamptz, Uuid as SqlUuid};
use uuid::Uuid;

use ripple_shared::clients::db::DbPool;
use ripple_shared::types::PaginationMeta;
use ripple_shared::{AppError, AppResult};

use crate::cache::{room_cache_key, RoomCache};
use crate::crypto::MessageCipher;
use crate::domain::{
    CreateRoomRequest, ForwardInfo, MemberRole, Mention, MessageData, MessageStatus,
    MessageUserRead, Reaction, Room, RoomParticipant, RoomType, SendMessageRequest,
    UpdateRoomRequest, User,
};
use crate::models::{
    MessageRow, NewMessage, NewMessageMeta, NewMessageTag, NewReaction, NewRoom, NewRoomMember,
    UserRow,
};
use crate::repository::{
    ChatRepository, MessageAudienceFilter, MessageHistoryFilter, ParticipantFilter, RoomFilter,
    UserStore,
};
use crate::schema::{
    room, room_member, room_message, room_message_meta, room_message_reaction, room_message_tag,
    users,
};

const META_FANOUT_BATCH: usize = 100;
const LIST_PARTICIPANTS_LIMIT: i64 = 5;

type PgConn = PooledConnection<ConnectionManager<PgConnection>>;

#[derive(Clone)]
pub struct PgChatRepository {
    pool: DbPool,
    cache: RoomCache,
    cipher: Arc<MessageCipher>,
}

impl PgChatRepository {
    pub fn new(pool: DbPool, cache: RoomCache, cipher: Arc<MessageCipher>) -> Self {
        Self { pool, cache, cipher }
    }

    fn conn(&self) -> AppResult<PgConn> {
        self.pool.get().map_err(|e| AppError::Internal(e.into()))
    }
}

// --- Raw room query ---
//
// $1 = user id (repeated), then per-variant binds; see `room_list_sql` /
// `room_by_id_sql`.

const ROOM_QUERY_BASE: &str = r#"
SELECT room.id,
       room.created_at,
       room.updated_at,
       room.image,
       room.name,
       room.description,
       room.type AS room_type,
       room.encryption_data,
       room.join_all_user,
       room.last_message_at,
       room.send_message,
       room.add_member,
       room.edit_group,
       partner.id AS partner_id,
       partner.name AS partner_name,
       partner.phone AS partner_phone,
       partner.avatar AS partner_avatar,
       pm.is_partner_blocked AS partner_blocked,
       pm.is_muted AS partner_muted,
       mm.is_muted,
       mm.is_pinned,
       mm.is_partner_blocked,
       mm.role,
       last_msg.id AS last_message_id,
       last_msg.content AS last_message_content,
       last_msg.type AS last_message_type,
       last_msg.created_at AS last_message_created_at,
       last_sender.name AS last_message_sender_name,
       last_sender.phone AS last_message_sender_phone,
       last_msg.status AS last_message_status,
       last_msg.updated_at AS last_message_updated_at,
       (SELECT COUNT(*)
          FROM room_message AS unread_msg
          LEFT JOIN room_message_meta AS unread_meta
                 ON unread_msg.id = unread_meta.message_id
                AND unread_meta.user_id = $1
                AND (unread_meta.is_deleted = FALSE OR unread_meta.is_deleted IS NULL)
         WHERE unread_msg.room_id = room.id
           AND unread_msg.deleted_at IS NULL
           AND unread_msg.sender_id <> $1
           AND unread_meta.read_at IS NULL) AS unread_count
  FROM room_member AS mm
  JOIN room
    ON room.id = mm.room_id
   AND mm.user_id = $1
   AND mm.removed_at IS NULL
  JOIN users AS me ON mm.user_id = me.id
  LEFT JOIN room_member AS pm
    ON room.id = pm.room_id
   AND pm.user_id <> $1
   AND room.type = 'p2p'
   AND pm.removed_at IS NULL
  LEFT JOIN users AS partner ON pm.user_id = partner.id
  LEFT JOIN LATERAL (
        SELECT msg.id, msg.content, msg.type, msg.created_at, msg.sender_id, msg.status, msg.updated_at
          FROM room_message AS msg
          LEFT JOIN room_message_meta AS meta
                 ON msg.id = meta.message_id
                AND meta.user_id = me.id
         WHERE msg.room_id = room.id
           AND msg.deleted_at IS NULL
           AND (meta.is_sender_blocked = FALSE OR meta.is_sender_blocked IS NULL)
           AND (meta.is_deleted = FALSE OR meta.is_deleted IS NULL)
         ORDER BY msg.created_at DESC
         LIMIT 1
       ) AS last_msg ON TRUE
  LEFT JOIN users AS last_sender ON last_msg.sender_id = last_sender.id
 WHERE room.deleted_at IS NULL
"#;

fn room_by_id_sql() -> String {
    format!("{ROOM_QUERY_BASE} AND room.id = $2 LIMIT 1")
}

fn room_list_sql() -> String {
    format!(
        "{ROOM_QUERY_BASE} \
         AND ($2::timestamptz IS NULL OR room.updated_at > $2 OR mm.updated_at > $2) \
         AND ($3::text IS NULL OR room.type = $3) \
         AND ($4::text IS NULL \
              OR unaccent(room.name) ILIKE unaccent($4) \
              OR unaccent(COALESCE(partner.name, '')) ILIKE unaccent($4)) \
         ORDER BY mm.is_pinned DESC, room.last_message_at DESC NULLS LAST, room.created_at DESC \
         LIMIT NULLIF($5::bigint, 0) OFFSET $6"
    )
}

fn room_count_sql() -> String {
    "SELECT COUNT(*) AS total \
       FROM room_member AS mm \
       JOIN room ON room.id = mm.room_id AND mm.user_id = $1 AND mm.removed_at IS NULL \
       LEFT JOIN room_member AS pm \
              ON room.id = pm.room_id AND pm.user_id <> $1 \
             AND room.type = 'p2p' AND pm.removed_at IS NULL \
       LEFT JOIN users AS partner ON pm.user_id = partner.id \
      WHERE room.deleted_at IS NULL \
        AND ($2::timestamptz IS NULL OR room.updated_at > $2 OR mm.updated_at > $2) \
        AND ($3::text IS NULL OR room.type = $3) \
        AND ($4::text IS NULL \
             OR unaccent(room.name) ILIKE unaccent($4) \
             OR unaccent(COALESCE(partner.name, '')) ILIKE unaccent($4))"
        .to_string()
}

const RANKED_PARTICIPANTS_SQL: &str = r#"
SELECT ranked.user_id,
       ranked.role,
       ranked.name,
       ranked.phone,
       ranked.avatar,
       ranked.room_id
  FROM (
        SELECT rm.user_id, rm.role, u.name, u.phone, u.avatar, rm.room_id,
               ROW_NUMBER() OVER (PARTITION BY rm.room_id ORDER BY rm.created_at DESC) AS rn
          FROM room_member AS rm
          JOIN users AS u ON rm.user_id = u.id
         WHERE rm.room_id = ANY($1)
           AND rm.removed_at IS NULL
           AND u.removed_at IS NULL
       ) AS ranked
 WHERE ranked.rn <= $2
"#;

#[derive(QueryableByName)]
struct RoomQueryRow {
    #[diesel(sql_type = SqlUuid)]
    id: Uuid,
    #[diesel(sql_type = Timestamptz)]
    created_at: DateTime<Utc>,
    #[diesel(sql_type = Timestamptz)]
    updated_at: DateTime<Utc>,
    #[diesel(sql_type = Text)]
    image: String,
    #[diesel(sql_type = Text)]
    name: String,
    #[diesel(sql_type = Text)]
    description: String,
    #[diesel(sql_type = Text)]
    room_type: String,
    #[diesel(sql_type = Text)]
    encryption_data: String,
    #[diesel(sql_type = diesel::sql_types::Bool)]
    join_all_user: bool,
    #[diesel(sql_type = Nullable<Timestamptz>)]
    last_message_at: Option<DateTime<Utc>>,
    #[diesel(sql_type = diesel::sql_types::Bool)]
    send_message: bool,
    #[diesel(sql_type = diesel::sql_types::Bool)]
    add_member: bool,
    #[diesel(sql_type = diesel::sql_types::Bool)]
    edit_group: bool,
    #[diesel(sql_type = Nullable<SqlUuid>)]
    partner_id: Option<Uuid>,
    #[diesel(sql_type = Nullable<Text>)]
    partner_name: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    partner_phone: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    partner_avatar: Option<String>,
    #[diesel(sql_type = Nullable<diesel::sql_types::Bool>)]
    partner_blocked: Option<bool>,
    #[diesel(sql_type = Nullable<diesel::sql_types::Bool>)]
    partner_muted: Option<bool>,
    #[diesel(sql_type = diesel::sql_types::Bool)]
    is_muted: bool,
    #[diesel(sql_type = diesel::sql_types::Bool)]
    is_pinned: bool,
    #[diesel(sql_type = diesel::sql_types::Bool)]
    is_partner_blocked: bool,
    #[diesel(sql_type = Text)]
    role: String,
    #[diesel(sql_type = Nullable<SqlUuid>)]
    last_message_id: Option<Uuid>,
    #[diesel(sql_type = Nullable<Text>)]
    last_message_content: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    last_message_type: Option<String>,
    #[diesel(sql_type = Nullable<Timestamptz>)]
    last_message_created_at: Option<DateTime<Utc>>,
    #[diesel(sql_type = Nullable<Text>)]
    last_message_sender_name: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    last_message_sender_phone: Option<String>,
    #[diesel(sql_type = Nullable<diesel::sql_types::Integer>)]
    last_message_status: Option<i32>,
    #[diesel(sql_type = Nullable<Timestamptz>)]
    last_message_updated_at: Option<DateTime<Utc>>,
    #[diesel(sql_type = BigInt)]
    unread_count: i64,
}

#[derive(QueryableByName)]
struct CountRow {
    #[diesel(sql_type = BigInt)]
    total: i64,
}

#[derive(QueryableByName)]
struct RankedParticipantRow {
    #[diesel(sql_type = SqlUuid)]
    user_id: Uuid,
    #[diesel(sql_type = Text)]
    role: String,
    #[diesel(sql_type = Text)]
    name: String,
    #[diesel(sql_type = Text)]
    phone: String,
    #[diesel(sql_type = Nullable<Text>)]
    avatar: Option<String>,
    #[diesel(sql_type = SqlUuid)]
    room_id: Uuid,
}

fn room_from_row(row: RoomQueryRow) -> Room {
    let last_message = row.last_message_id.map(|id| {
        let created = row.last_message_created_at.unwrap_or(row.created_at);
        let mut msg = MessageData::bare(id, row.id, Uuid::nil(), created);
        msg.content = row.last_message_content.unwrap_or_default();
        msg.message_type = row.last_message_type.unwrap_or_else(|| "user_message".into());
        msg.sender_name = row.last_message_sender_name.unwrap_or_default();
        msg.sender_phone = row.last_message_sender_phone.unwrap_or_default();
        msg.status = MessageStatus::from_i32(row.last_message_status.unwrap_or(0));
        msg.updated_at = row.last_message_updated_at.unwrap_or(created);
        msg
    });

    let partner = row.partner_id.map(|id| RoomParticipant {
        id,
        name: row.partner_name.clone().unwrap_or_default(),
        phone: row.partner_phone.clone().unwrap_or_default(),
        avatar: row.partner_avatar.clone(),
        role: MemberRole::Member,
        is_partner_blocked: row.partner_blocked.unwrap_or(false),
        is_partner_muted: row.partner_muted.unwrap_or(false),
    });

    Room {
        id: row.id,
        room_type: RoomType::parse(&row.room_type).unwrap_or(RoomType::Group),
        name: row.name,
        description: row.description,
        photo_url: row.image,
        encryption_data: row.encryption_data,
        join_all_user: row.join_all_user,
        send_message: row.send_message,
        add_member: row.add_member,
        edit_group: row.edit_group,
        created_at: row.created_at,
        updated_at: row.updated_at,
        last_message_at: row.last_message_at,
        last_message,
        unread_count: row.unread_count as i32,
        is_pinned: row.is_pinned,
        is_muted: row.is_muted,
        is_partner_blocked: row.is_partner_blocked,
        role: MemberRole::parse(&row.role),
        partner,
        participants: Vec::new(),
    }
    .format()
}

// --- Raw message history query ---
//
// $1 = user id (repeated), $2 = room id (null = all rooms), $3/$4 = updated
// before/after, $5/$6 = created before/after (resolved from message-id
// cursors), then either `rn <= $7` (top-N per room) or `LIMIT $7 OFFSET $8`.

const MESSAGE_QUERY_BASE: &str = r#"
SELECT msg.id,
       msg.room_id,
       msg.sender_id,
       sender.name AS sender_name,
       sender.phone AS sender_phone,
       sender.avatar AS sender_avatar,
       msg.content,
       msg.status,
       msg.created_at,
       msg.updated_at,
       msg.type AS message_type,
       msg.lifetime,
       msg.origin,
       msg.location_name,
       msg.location_latitude,
       msg.location_longitude,
       msg.contact_id,
       msg.contact_name,
       msg.contact_phone,
       msg.file,
       msg.edited,
       msg.is_deleted,
       msg.event,
       msg.sender_message_id,
       msg.replied_message_id,
       msg.forwarded_message_id,
       msg.forwarded_message_original_sender,
       meta.read_at AS read_at,
       ROW_NUMBER() OVER (PARTITION BY msg.room_id ORDER BY msg.created_at DESC) AS rn
  FROM room_message AS msg
  JOIN users AS sender ON msg.sender_id = sender.id
  JOIN room_member AS member
    ON member.user_id = $1
   AND member.room_id = msg.room_id
   AND member.removed_at IS NULL
  LEFT JOIN room_message_meta AS meta
         ON msg.id = meta.message_id
        AND meta.user_id = $1
 WHERE (meta.is_sender_blocked IS NULL OR meta.is_sender_blocked = FALSE)
   AND (meta.is_deleted IS NULL OR meta.is_deleted = FALSE)
   AND msg.deleted_at IS NULL
   AND ($2::uuid IS NULL OR msg.room_id = $2)
   AND ($3::timestamptz IS NULL OR msg.updated_at < $3)
   AND ($4::timestamptz IS NULL OR msg.updated_at > $4)
   AND ($5::timestamptz IS NULL OR msg.created_at < $5)
   AND ($6::timestamptz IS NULL OR msg.created_at > $6)
"#;

fn message_history_sql(per_room: bool) -> String {
    if per_room {
        format!(
            "SELECT * FROM ({MESSAGE_QUERY_BASE}) AS ranked \
             WHERE ranked.rn <= $7 ORDER BY ranked.created_at DESC"
        )
    } else {
        format!(
            "{MESSAGE_QUERY_BASE} ORDER BY msg.created_at DESC \
             LIMIT NULLIF($7::bigint, 0) OFFSET $8"
        )
    }
}

fn message_count_sql() -> String {
    "SELECT COUNT(*) AS total \
       FROM room_message AS msg \
       JOIN room_member AS member \
         ON member.user_id = $1 AND member.room_id = msg.room_id AND member.removed_at IS NULL \
       LEFT JOIN room_message_meta AS meta \
              ON msg.id = meta.message_id AND meta.user_id = $1 \
      WHERE (meta.is_sender_blocked IS NULL OR meta.is_sender_blocked = FALSE) \
        AND (meta.is_deleted IS NULL OR meta.is_deleted = FALSE) \
        AND msg.deleted_at IS NULL \
        AND ($2::uuid IS NULL OR msg.room_id = $2) \
        AND ($3::timestamptz IS NULL OR msg.updated_at < $3) \
        AND ($4::timestamptz IS NULL OR msg.updated_at > $4) \
        AND ($5::timestamptz IS NULL OR msg.created_at < $5) \
        AND ($6::timestamptz IS NULL OR msg.created_at > $6)"
        .to_string()
}

#[derive(QueryableByName)]
struct MessageQueryRow {
    #[diesel(sql_type = SqlUuid)]
    id: Uuid,
    #[diesel(sql_type = SqlUuid)]
    room_id: Uuid,
    #[diesel(sql_type = SqlUuid)]
    sender_id: Uuid,
    #[diesel(sql_type = Text)]
    sender_name: String,
    #[diesel(sql_type = Text)]
    sender_phone: String,
    #[diesel(sql_type = Nullable<Text>)]
    sender_avatar: Option<String>,
    #[diesel(sql_type = Text)]
    content: String,
    #[diesel(sql_type = diesel::sql_types::Integer)]
    status: i32,
    #[diesel(sql_type = Timestamptz)]
    created_at: DateTime<Utc>,
    #[diesel(sql_type = Timestamptz)]
    updated_at: DateTime<Utc>,
    #[diesel(sql_type = Text)]
    message_type: String,
    #[diesel(sql_type = Text)]
    lifetime: String,
    #[diesel(sql_type = Text)]
    origin: String,
    #[diesel(sql_type = Nullable<Text>)]
    location_name: Option<String>,
    #[diesel(sql_type = Nullable<diesel::sql_types::Double>)]
    location_latitude: Option<f64>,
    #[diesel(sql_type = Nullable<diesel::sql_types::Double>)]
    location_longitude: Option<f64>,
    #[diesel(sql_type = Nullable<SqlUuid>)]
    contact_id: Option<Uuid>,
    #[diesel(sql_type = Nullable<Text>)]
    contact_name: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    contact_phone: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    file: Option<String>,
    #[diesel(sql_type = diesel::sql_types::Bool)]
    edited: bool,
    #[diesel(sql_type = diesel::sql_types::Bool)]
    is_deleted: bool,
    #[diesel(sql_type = Nullable<Text>)]
    event: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    sender_message_id: Option<String>,
    #[diesel(sql_type = Nullable<SqlUuid>)]
    replied_message_id: Option<Uuid>,
    #[diesel(sql_type = Nullable<SqlUuid>)]
    forwarded_message_id: Option<Uuid>,
    #[diesel(sql_type = Nullable<SqlUuid>)]
    forwarded_message_original_sender: Option<Uuid>,
    #[diesel(sql_type = Nullable<Timestamptz>)]
    read_at: Option<DateTime<Utc>>,
    #[diesel(sql_type = BigInt)]
    #[allow(dead_code)]
    rn: i64,
}

impl PgChatRepository {
    fn attach_group_participants(&self, conn: &mut PgConn, rooms: &mut [Room]) -> AppResult<()> {
        let group_ids: Vec<Uuid> = rooms
            .iter()
            .filter(|r| r.room_type != RoomType::P2p)
            .map(|r| r.id)
            .collect();
        if group_ids.is_empty() {
            return Ok(());
        }

        let ranked: Vec<RankedParticipantRow> = sql_query(RANKED_PARTICIPANTS_SQL)
            .bind::<Array<SqlUuid>, _>(group_ids)
            .bind::<BigInt, _>(LIST_PARTICIPANTS_LIMIT)
            .load(conn)?;

        for p in ranked {
            if let Some(r) = rooms.iter_mut().find(|r| r.id == p.room_id) {
                r.participants.push(RoomParticipant {
                    id: p.user_id,
                    name: p.name,
                    phone: p.phone,
                    avatar: p.avatar,
                    role: MemberRole::parse(&p.role),
                    is_partner_blocked: false,
                    is_partner_muted: false,
                });
            }
        }
        Ok(())
    }

    fn fetch_room(
        &self,
        conn: &mut PgConn,
        user_id: Uuid,
        room_id: Uuid,
    ) -> AppResult<Option<Room>> {
        let mut rows: Vec<RoomQueryRow> = sql_query(room_by_id_sql())
            .bind::<SqlUuid, _>(user_id)
            .bind::<SqlUuid, _>(room_id)
            .load(conn)?;

        Ok(rows.pop().map(room_from_row))
    }

    /// Probe for an existing active p2p room between `user_id` and `peer`.
    fn find_p2p_room(&self, conn: &mut PgConn, user_id: Uuid, peer: Uuid) -> AppResult<Option<Uuid>> {
        let my_p2p_rooms: Vec<Uuid> = room_member::table
            .inner_join(room::table)
            .filter(room_member::user_id.eq(user_id))
            .filter(room_member::removed_at.is_null())
            .filter(room::room_type.eq("p2p"))
            .filter(room::deleted_at.is_null())
            .select(room::id)
            .load(conn)?;

        if my_p2p_rooms.is_empty() {
            return Ok(None);
        }

        let shared: Option<Uuid> = room_member::table
            .filter(room_member::room_id.eq_any(&my_p2p_rooms))
            .filter(room_member::user_id.eq(peer))
            .filter(room_member::removed_at.is_null())
            .select(room_member::room_id)
            .first(conn)
            .optional()?;

        Ok(shared)
    }

    fn resolve_created_at(
        &self,
        conn: &mut PgConn,
        message_id: Option<Uuid>,
    ) -> AppResult<Option<DateTime<Utc>>> {
        let Some(id) = message_id else {
            return Ok(None);
        };
        let found: Option<DateTime<Utc>> = room_message::table
            .filter(room_message::id.eq(id))
            .select(room_message::created_at)
            .first(conn)
            .optional()?;
        Ok(found)
    }

    fn load_mentions(&self, conn: &mut PgConn, message_ids: &[Uuid]) -> AppResult<Vec<Mention>> {
        if message_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<(Uuid, Uuid, String, String, String)> = room_message_tag::table
            .inner_join(users::table)
            .filter(room_message_tag::message_id.eq_any(message_ids))
            .filter(room_message_tag::deleted_at.is_null())
            .select((
                room_message_tag::message_id,
                room_message_tag::user_id,
                users::name,
                users::phone,
                room_message_tag::tag,
            ))
            .load(conn)?;

        Ok(rows
            .into_iter()
            .map(|(message_id, user_id, name, phone, tag)| Mention {
                message_id,
                user_id,
                name,
                phone,
                tag,
            })
            .collect())
    }

    fn load_reactions(&self, conn: &mut PgConn, message_ids: &[Uuid]) -> AppResult<Vec<Reaction>> {
        if message_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<(Uuid, Uuid, String, String, Option<String>, String)> =
            room_message_reaction::table
                .inner_join(users::table)
                .filter(room_message_reaction::message_id.eq_any(message_ids))
                .filter(room_message_reaction::deleted_at.is_null())
                .select((
                    room_message_reaction::message_id,
                    room_message_reaction::user_id,
                    users::name,
                    users::phone,
                    users::avatar,
                    room_message_reaction::reaction,
                ))
                .load(conn)?;

        Ok(rows
            .into_iter()
            .map(
                |(message_id, user_id, name, phone, avatar, reaction)| Reaction {
                    message_id,
                    reacted_by_id: user_id,
                    reacted_by_name: name,
                    reacted_by_phone: phone,
                    reacted_by_avatar: avatar,
                    reaction,
                },
            )
            .collect())
    }

    /// Shallow reply previews for quoted messages.
    fn load_replies(
        &self,
        conn: &mut PgConn,
        reply_ids: &[Uuid],
    ) -> AppResult<Vec<MessageData>> {
        if reply_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<(MessageRow, UserRow)> = room_message::table
            .inner_join(users::table.on(users::id.eq(room_message::sender_id)))
            .filter(room_message::id.eq_any(reply_ids))
            .load(conn)?;

        Ok(rows
            .into_iter()
            .map(|(row, sender)| {
                let mut msg = MessageData::bare(row.id, row.room_id, row.sender_id, row.created_at);
                msg.content = row.content;
                msg.message_type = row.message_type;
                msg.is_deleted = row.is_deleted;
                msg.sender_name = sender.name;
                msg.sender_phone = sender.phone;
                msg.sender_avatar = sender.avatar;
                msg.updated_at = row.updated_at;
                msg.tombstoned()
            })
            .collect())
    }

    fn load_forward_senders(
        &self,
        conn: &mut PgConn,
        sender_ids: &[Uuid],
    ) -> AppResult<Vec<UserRow>> {
        if sender_ids.is_empty() {
            return Ok(Vec::new());
        }
        Ok(users::table
            .filter(users::id.eq_any(sender_ids))
            .load(conn)?)
    }

    fn assemble_messages(
        &self,
        conn: &mut PgConn,
        user_id: Uuid,
        rows: Vec<MessageQueryRow>,
    ) -> AppResult<Vec<MessageData>> {
        let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
        let reply_ids: Vec<Uuid> = rows.iter().filter_map(|r| r.replied_message_id).collect();
        let fwd_ids: Vec<Uuid> = rows
            .iter()
            .filter_map(|r| r.forwarded_message_original_sender)
            .collect();

        let mentions = self.load_mentions(conn, &ids)?;
        let reactions = self.load_reactions(conn, &ids)?;
        let replies = self.load_replies(conn, &reply_ids)?;
        let forward_senders = self.load_forward_senders(conn, &fwd_ids)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut msg = MessageData::bare(row.id, row.room_id, row.sender_id, row.created_at);
            msg.sender_name = row.sender_name;
            msg.sender_phone = row.sender_phone;
            msg.sender_avatar = row.sender_avatar;
            msg.content = row.content;
            msg.updated_at = row.updated_at;
            msg.message_type = row.message_type;
            msg.lifetime = row.lifetime;
            msg.origin = row.origin;
            msg.location_name = row.location_name;
            msg.location_latitude = row.location_latitude;
            msg.location_longitude = row.location_longitude;
            msg.contact_id = row.contact_id;
            msg.contact_name = row.contact_name;
            msg.contact_phone = row.contact_phone;
            msg.file = row.file;
            msg.edited = row.edited;
            msg.is_deleted = row.is_deleted;
            msg.event = row.event;
            msg.sender_message_id = row.sender_message_id;

            // Recipients see their own read state, not the global status.
            msg.status = if row.sender_id == user_id {
                MessageStatus::from_i32(row.status)
            } else if row.read_at.is_some() {
                MessageStatus::Read
            } else {
                MessageStatus::Sent
            };

            if let Some(reply_id) = row.replied_message_id {
                msg.reply = replies
                    .iter()
                    .find(|r| r.id == reply_id)
                    .cloned()
                    .map(Box::new);
            }
            if let Some(fwd_id) = row.forwarded_message_id {
                let original = row
                    .forwarded_message_original_sender
                    .and_then(|sid| forward_senders.iter().find(|u| u.id == sid));
                msg.forward = Some(ForwardInfo {
                    message_id: fwd_id,
                    sender_id: original.map(|u| u.id),
                    sender_name: original.map(|u| u.name.clone()),
                    sender_phone: original.map(|u| u.phone.clone()),
                    sender_avatar: original.and_then(|u| u.avatar.clone()),
                });
            }

            msg.mentions = mentions
                .iter()
                .filter(|m| m.message_id == msg.id)
                .cloned()
                .collect();
            msg.reactions = reactions
                .iter()
                .filter(|r| r.message_id == msg.id)
                .cloned()
                .collect();

            out.push(msg.tombstoned());
        }
        Ok(out)
    }
}

#[async_trait]
impl UserStore for PgChatRepository {
    async fn get_user_by_id(&self, id: Uuid) -> AppResult<Option<User>> {
        let mut conn = self.conn()?;
        let row: Option<UserRow> = users::table
            .filter(users::id.eq(id))
            .filter(users::deleted_at.is_null())
            .first(&mut conn)
            .optional()?;
        Ok(row.map(Into::into))
    }

    async fn get_users_by_id(&self, ids: &[Uuid]) -> AppResult<Vec<User>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn()?;
        let rows: Vec<UserRow> = users::table
            .filter(users::id.eq_any(ids))
            .filter(users::deleted_at.is_null())
            .load(&mut conn)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn get_all_user_ids(&self) -> AppResult<Vec<Uuid>> {
        let mut conn = self.conn()?;
        Ok(users::table
            .filter(users::deleted_at.is_null())
            .filter(users::removed_at.is_null())
            .select(users::id)
            .load(&mut conn)?)
    }
}

#[async_trait]
impl ChatRepository for PgChatRepository {
    async fn create_room(&self, user_id: Uuid, req: &CreateRoomRequest) -> AppResult<Room> {
        let mut conn = self.conn()?;

        // p2p creation is idempotent by participant pair.
        if req.room_type == RoomType::P2p {
            if let Some(peer) = req.participants.first().copied() {
                if let Some(existing) = self.find_p2p_room(&mut conn, user_id, peer)? {
                    if let Some(room) = self.fetch_room(&mut conn, user_id, existing)? {
                        return Ok(room);
                    }
                }
            }
        }

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

        let mut members: Vec<Uuid> = req.participants.clone();
        members.retain(|id| *id != user_id);
        members.sort();
        members.dedup();

        let room_id = conn.transaction::<Uuid, diesel::result::Error, _>(|conn| {
            let new_room = NewRoom {
                name: req.name.clone().unwrap_or_default(),
                description: req.description.clone().unwrap_or_default(),
                image: req.photo_url.clone().unwrap_or_default(),
                room_type: req.room_type.as_str().to_string(),
                encryption_data: encryption_data.clone(),
                join_all_user: req.join_all_user && req.room_type == RoomType::Channel,
                send_message,
                add_member,
                edit_group,
            };

            let room_id: Uuid = diesel::insert_into(room::table)
                .values(&new_room)
                .returning(room::id)
                .get_result(conn)?;

            let mut rows = vec![NewRoomMember {
                room_id,
                user_id,
                role: MemberRole::Owner.as_str().to_string(),
            }];
            for member in &members {
                rows.push(NewRoomMember {
                    room_id,
                    user_id: *member,
                    role: MemberRole::Member.as_str().to_string(),
                });
            }
            diesel::insert_into(room_member::table)
                .values(&rows)
                .execute(conn)?;

            Ok(room_id)
        })?;

        let mut created = self
            .fetch_room(&mut conn, user_id, room_id)?
            .ok_or_else(|| AppError::internal("room vanished after creation"))?;

        if created.room_type != RoomType::P2p {
            let (participants, _) = self
                .get_room_participants(&ParticipantFilter::top(room_id, 5))
                .await?;
            created.participants = participants;
        }

        Ok(created)
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

        let mut conn = self.conn()?;
        let Some(mut found) = self.fetch_room(&mut conn, user_id, room_id)? else {
            return Ok(None);
        };

        if load_all && found.room_type != RoomType::P2p {
            let (participants, _) = self
                .get_room_participants(&ParticipantFilter::top(room_id, 5))
                .await?;
            found.participants = participants;
        }

        self.cache.set_room(room_id, &cache_key, &found).await;
        Ok(Some(found))
    }

    async fn get_room_list(
        &self,
        user_id: Uuid,
        filter: &RoomFilter,
    ) -> AppResult<(Vec<Room>, PaginationMeta)> {
        let mut conn = self.conn()?;

        let search = filter.search.as_ref().map(|s| format!("%{s}%"));
        let type_filter = filter.room_type.map(|t| t.as_str().to_string());
        let limit = filter.limit as i64;
        let offset = if filter.page > 0 && filter.limit > 0 {
            ((filter.page - 1) * filter.limit) as i64
        } else {
            0
        };

        let rows: Vec<RoomQueryRow> = sql_query(room_list_sql())
            .bind::<SqlUuid, _>(user_id)
            .bind::<Nullable<Timestamptz>, _>(filter.since)
            .bind::<Nullable<Text>, _>(type_filter.clone())
            .bind::<Nullable<Text>, _>(search.clone())
            .bind::<BigInt, _>(limit)
            .bind::<BigInt, _>(offset)
            .load(&mut conn)?;

        let mut rooms: Vec<Room> = rows.into_iter().map(room_from_row).collect();
        self.attach_group_participants(&mut conn, &mut rooms)?;

        let total: CountRow = sql_query(room_count_sql())
            .bind::<SqlUuid, _>(user_id)
            .bind::<Nullable<Timestamptz>, _>(filter.since)
            .bind::<Nullable<Text>, _>(type_filter)
            .bind::<Nullable<Text>, _>(search)
            .get_result(&mut conn)?;

        let meta = PaginationMeta::new(
            total.total as u32,
            rooms.len() as u32,
            filter.limit,
            filter.page,
        );
        Ok((rooms, meta))
    }

    async fn get_room_list_deleted(
        &self,
        user_id: Uuid,
        since: Option<DateTime<Utc>>,
    ) -> AppResult<Vec<Uuid>> {
        let mut conn = self.conn()?;

        let mut query = room_member::table
            .inner_join(room::table)
            .filter(room_member::user_id.eq(user_id))
            .filter(
                room::deleted_at
                    .is_not_null()
                    .or(room_member::removed_at.is_not_null()),
            )
            .select(room::id)
            .into_boxed();

        if let Some(since) = since {
            query = query.filter(
                room::deleted_at
                    .gt(since)
                    .or(room_member::removed_at.gt(since)),
            );
        }

        Ok(query.load(&mut conn)?)
    }

    async fn leave_room(
        &self,
        user_id: Uuid,
        room_id: Uuid,
        participants: &[Uuid],
        leave_all: bool,
    ) -> AppResult<Vec<User>> {
        let mut conn = self.conn()?;

        let mut leaving: Vec<Uuid> = participants.to_vec();
        if leave_all {
            let everyone: Vec<Uuid> = room_member::table
                .filter(room_member::room_id.eq(room_id))
                .filter(room_member::removed_at.is_null())
                .select(room_member::user_id)
                .load(&mut conn)?;
            leaving.extend(everyone);
        }
        leaving.sort();
        leaving.dedup();

        diesel::update(
            room_member::table
                .filter(room_member::room_id.eq(room_id))
                .filter(room_member::user_id.eq_any(&leaving))
                .filter(room_member::removed_at.is_null()),
        )
        .set((
            room_member::removed_at.eq(diesel::dsl::now),
            room_member::updated_at.eq(diesel::dsl::now),
        ))
        .execute(&mut conn)?;

        self.cache.invalidate_room(room_id).await;

        tracing::info!(room_id = %room_id, by = %user_id, count = leaving.len(), "members left room");
        self.get_users_by_id(&leaving).await
    }

    async fn delete_room(&self, _user_id: Uuid, room_id: Uuid) -> AppResult<()> {
        let mut conn = self.conn()?;

        diesel::update(
            room::table
                .filter(room::id.eq(room_id))
                .filter(room::deleted_at.is_null()),
        )
        .set((
            room::deleted_at.eq(diesel::dsl::now),
            room::updated_at.eq(diesel::dsl::now),
        ))
        .execute(&mut conn)?;

        diesel::update(
            room_member::table
                .filter(room_member::room_id.eq(room_id))
                .filter(room_member::removed_at.is_null()),
        )
        .set((
            room_member::removed_at.eq(diesel::dsl::now),
            room_member::updated_at.eq(diesel::dsl::now),
        ))
        .execute(&mut conn)?;

        self.cache.invalidate_room(room_id).await;
        Ok(())
    }

    async fn update_room(
        &self,
        _user_id: Uuid,
        room_id: Uuid,
        req: &UpdateRoomRequest,
    ) -> AppResult<()> {
        let mut conn = self.conn()?;

        conn.transaction::<(), diesel::result::Error, _>(|conn| {
            let target = || {
                room::table
                    .filter(room::id.eq(room_id))
                    .filter(room::deleted_at.is_null())
            };

            if let Some(name) = &req.name {
                diesel::update(target()).set(room::name.eq(name)).execute(conn)?;
            }
            if let Some(description) = &req.description {
                diesel::update(target())
                    .set(room::description.eq(description))
                    .execute(conn)?;
            }
            if let Some(photo) = &req.photo_url {
                diesel::update(target()).set(room::image.eq(photo)).execute(conn)?;
            }
            if let Some(send_message) = req.send_message {
                diesel::update(target())
                    .set(room::send_message.eq(send_message))
                    .execute(conn)?;
            }
            if let Some(add_member) = req.add_member {
                diesel::update(target())
                    .set(room::add_member.eq(add_member))
                    .execute(conn)?;
            }
            if let Some(edit_group) = req.edit_group {
                diesel::update(target())
                    .set(room::edit_group.eq(edit_group))
                    .execute(conn)?;
            }

            diesel::update(target())
                .set(room::updated_at.eq(diesel::dsl::now))
                .execute(conn)?;
            Ok(())
        })?;

        self.cache.invalidate_room(room_id).await;
        Ok(())
    }

    async fn pin_room(&self, user_id: Uuid, room_id: Uuid, pin: bool) -> AppResult<()> {
        let mut conn = self.conn()?;
        diesel::update(
            room_member::table
                .filter(room_member::room_id.eq(room_id))
                .filter(room_member::user_id.eq(user_id)),
        )
        .set(room_member::is_pinned.eq(pin))
        .execute(&mut conn)?;

        self.cache.invalidate_room(room_id).await;
        Ok(())
    }

    async fn mute_room(&self, user_id: Uuid, room_id: Uuid, mute: bool) -> AppResult<()> {
        let mut conn = self.conn()?;
        diesel::update(
            room_member::table
                .filter(room_member::room_id.eq(room_id))
                .filter(room_member::user_id.eq(user_id)),
        )
        .set((
            room_member::is_muted.eq(mute),
            room_member::updated_at.eq(diesel::dsl::now),
        ))
        .execute(&mut conn)?;

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
        let mut conn = self.conn()?;
        diesel::update(
            room_member::table
                .filter(room_member::room_id.eq(room_id))
                .filter(room_member::user_id.eq(user_id)),
        )
        .set((
            room_member::is_partner_blocked.eq(block),
            room_member::updated_at.eq(diesel::dsl::now),
        ))
        .execute(&mut conn)?;

        self.cache.invalidate_room(room_id).await;
        Ok(())
    }

    async fn get_room_participants(
        &self,
        filter: &ParticipantFilter,
    ) -> AppResult<(Vec<RoomParticipant>, PaginationMeta)> {
        let mut conn = self.conn()?;

        let mut query = room_member::table
            .inner_join(users::table)
            .filter(room_member::room_id.eq(filter.room_id))
            .filter(room_member::removed_at.is_null())
            .filter(users::removed_at.is_null())
            .select((
                room_member::user_id,
                room_member::role,
                room_member::is_muted,
                room_member::is_partner_blocked,
                users::name,
                users::phone,
                users::avatar,
            ))
            .order(users::name.asc())
            .into_boxed();

        if let Some(search) = &filter.search {
            query = query.filter(users::name.ilike(format!("%{search}%")));
        }
        if filter.page > 0 && filter.limit > 0 {
            query = query
                .offset(((filter.page - 1) * filter.limit) as i64)
                .limit(filter.limit as i64);
        }

        let rows: Vec<(Uuid, String, bool, bool, String, String, Option<String>)> =
            query.load(&mut conn)?;

        let participants: Vec<RoomParticipant> = rows
            .into_iter()
            .map(
                |(user_id, role, is_muted, is_partner_blocked, name, phone, avatar)| {
                    RoomParticipant {
                        id: user_id,
                        name,
                        phone,
                        avatar,
                        role: MemberRole::parse(&role),
                        is_partner_blocked,
                        is_partner_muted: is_muted,
                    }
                },
            )
            .collect();

        let mut count_query = room_member::table
            .inner_join(users::table)
            .filter(room_member::room_id.eq(filter.room_id))
            .filter(room_member::removed_at.is_null())
            .filter(users::removed_at.is_null())
            .count()
            .into_boxed();
        if let Some(search) = &filter.search {
            count_query = count_query.filter(users::name.ilike(format!("%{search}%")));
        }
        let total: i64 = count_query.get_result(&mut conn)?;

        let meta = PaginationMeta::new(
            total as u32,
            participants.len() as u32,
            filter.limit,
            filter.page,
        );
        Ok((participants, meta))
    }

    async fn add_participants(
        &self,
        _user_id: Uuid,
        room_id: Uuid,
        participants: &[Uuid],
    ) -> AppResult<Vec<User>> {
        let mut conn = self.conn()?;

        let mut requested: Vec<Uuid> = participants.to_vec();
        requested.sort();
        requested.dedup();

        let added = conn.transaction::<Vec<UserRow>, diesel::result::Error, _>(|conn| {
            let candidates: Vec<UserRow> = users::table
                .filter(users::id.eq_any(&requested))
                .filter(users::removed_at.is_null())
                .filter(users::deleted_at.is_null())
                .load(conn)?;

            let existing: Vec<(Uuid, Option<DateTime<Utc>>)> = room_member::table
                .filter(room_member::room_id.eq(room_id))
                .filter(room_member::user_id.eq_any(&requested))
                .select((room_member::user_id, room_member::removed_at))
                .load(conn)?;

            let mut already_active = Vec::new();
            let mut to_reactivate = Vec::new();
            for (uid, removed_at) in &existing {
                if removed_at.is_some() {
                    to_reactivate.push(*uid);
                } else {
                    already_active.push(*uid);
                }
            }

            if !to_reactivate.is_empty() {
                diesel::update(
                    room_member::table
                        .filter(room_member::room_id.eq(room_id))
                        .filter(room_member::user_id.eq_any(&to_reactivate)),
                )
                .set((
                    room_member::removed_at.eq(None::<DateTime<Utc>>),
                    room_member::updated_at.eq(diesel::dsl::now),
                ))
                .execute(conn)?;
            }

            let known: Vec<Uuid> = existing.iter().map(|(uid, _)| *uid).collect();
            let new_rows: Vec<NewRoomMember> = candidates
                .iter()
                .filter(|u| !known.contains(&u.id))
                .map(|u| NewRoomMember {
                    room_id,
                    user_id: u.id,
                    role: MemberRole::Member.as_str().to_string(),
                })
                .collect();
            if !new_rows.is_empty() {
                diesel::insert_into(room_member::table)
                    .values(&new_rows)
                    .execute(conn)?;
            }

            // Only users who actually (re)joined are reported back, so the
            // caller can emit one system message per new member.
            Ok(candidates
                .into_iter()
                .filter(|u| !already_active.contains(&u.id))
                .collect())
        })?;

        self.cache.invalidate_room(room_id).await;
        Ok(added.into_iter().map(Into::into).collect())
    }

    async fn update_participant_role(
        &self,
        _user_id: Uuid,
        room_id: Uuid,
        participant: Uuid,
        role: MemberRole,
    ) -> AppResult<()> {
        let mut conn = self.conn()?;
        diesel::update(
            room_member::table
                .filter(room_member::room_id.eq(room_id))
                .filter(room_member::user_id.eq(participant)),
        )
        .set((
            room_member::role.eq(role.as_str()),
            room_member::updated_at.eq(diesel::dsl::now),
        ))
        .execute(&mut conn)?;

        self.cache.invalidate_room(room_id).await;
        Ok(())
    }

    async fn is_partner_muted(&self, user_id: Uuid, room_id: Uuid) -> AppResult<bool> {
        let mut conn = self.conn()?;
        let muted: Option<bool> = room_member::table
            .filter(room_member::room_id.eq(room_id))
            .filter(room_member::user_id.eq(user_id))
            .select(room_member::is_muted)
            .first(&mut conn)
            .optional()?;
        Ok(muted.unwrap_or(false))
    }

    async fn save_message(
        &self,
        user_id: Uuid,
        req: &SendMessageRequest,
        content_decrypted: Option<&str>,
    ) -> AppResult<MessageData> {
        let mut conn = self.conn()?;

        let message_id = conn.transaction::<Uuid, diesel::result::Error, _>(|conn| {
            let message_type = req
                .message_type
                .clone()
                .unwrap_or_else(|| "user_message".to_string());

            // A shared contact that maps to a known user gets linked.
            let contact_id: Option<Uuid> = match (&req.contact_phone, message_type.as_str()) {
                (Some(phone), "contact") => users::table
                    .filter(users::phone.eq(phone))
                    .filter(users::removed_at.is_null())
                    .filter(users::deleted_at.is_null())
                    .select(users::id)
                    .first(conn)
                    .optional()?,
                _ => None,
            };

            let forward_original_sender: Option<Uuid> = match req.forward_id {
                Some(forward_id) => room_message::table
                    .filter(room_message::id.eq(forward_id))
                    .filter(room_message::deleted_at.is_null())
                    .select(room_message::sender_id)
                    .first(conn)
                    .optional()?,
                None => None,
            };

            let new_message = NewMessage {
                id: Uuid::now_v7(),
                room_id: req.room_id,
                sender_id: user_id,
                content: req.content.clone(),
                content_decrypted: content_decrypted.map(str::to_string),
                status: MessageStatus::Sent.as_i32(),
                message_type,
                lifetime: req.lifetime.clone().unwrap_or_else(|| "normal".to_string()),
                origin: req.origin.clone().unwrap_or_else(|| "app".to_string()),
                location_name: req.location_name.clone(),
                location_latitude: req.location_latitude,
                location_longitude: req.location_longitude,
                contact_id,
                contact_name: req.contact_name.clone(),
                contact_phone: req.contact_phone.clone(),
                file: req.file.clone(),
                event: req.event.clone(),
                sender_message_id: req.sender_message_id.clone(),
                replied_message_id: req.reply_id,
                forwarded_message_id: req.forward_id,
                forwarded_message_original_sender: forward_original_sender,
            };

            let message_id: Uuid = diesel::insert_into(room_message::table)
                .values(&new_message)
                .returning(room_message::id)
                .get_result(conn)?;

            if !req.mentions.is_empty() {
                let tags: Vec<NewMessageTag> = req
                    .mentions
                    .iter()
                    .map(|m| NewMessageTag {
                        message_id,
                        user_id: m.user,
                        tag: m.tag.clone(),
                    })
                    .collect();
                diesel::insert_into(room_message_tag::table)
                    .values(&tags)
                    .execute(conn)?;
            }

            // The sender's meta row marks the message read at insert time.
            diesel::insert_into(room_message_meta::table)
                .values(&NewMessageMeta {
                    message_id,
                    user_id,
                    read_at: Some(Utc::now()),
                    is_deleted: false,
                    is_sender_blocked: false,
                })
                .execute(conn)?;

            Ok(message_id)
        })?;
        drop(conn);

        let message = self
            .get_message(user_id, message_id)
            .await?
            .ok_or_else(|| AppError::internal("message vanished after save"))?;

        self.cache.apply_new_message(&message).await;
        Ok(message)
    }

    async fn get_message(&self, user_id: Uuid, message_id: Uuid) -> AppResult<Option<MessageData>> {
        let mut conn = self.conn()?;

        let mut rows: Vec<MessageQueryRow> = sql_query(format!(
            "{MESSAGE_QUERY_BASE} AND msg.id = $7 LIMIT 1"
        ))
        .bind::<SqlUuid, _>(user_id)
        .bind::<Nullable<SqlUuid>, _>(None::<Uuid>)
        .bind::<Nullable<Timestamptz>, _>(None::<DateTime<Utc>>)
        .bind::<Nullable<Timestamptz>, _>(None::<DateTime<Utc>>)
        .bind::<Nullable<Timestamptz>, _>(None::<DateTime<Utc>>)
        .bind::<Nullable<Timestamptz>, _>(None::<DateTime<Utc>>)
        .bind::<SqlUuid, _>(message_id)
        .load(&mut conn)?;

        let Some(row) = rows.pop() else {
            return Ok(None);
        };
        let mut assembled = self.assemble_messages(&mut conn, user_id, vec![row])?;
        Ok(assembled.pop())
    }

    async fn get_message_simple(
        &self,
        _user_id: Uuid,
        message_id: Uuid,
    ) -> AppResult<Option<MessageData>> {
        if let Some(cached) = self.cache.get_message_simple(message_id).await {
            return Ok(Some(cached));
        }

        let mut conn = self.conn()?;
        let row: Option<MessageRow> = room_message::table
            .filter(room_message::id.eq(message_id))
            .filter(room_message::deleted_at.is_null())
            .first(&mut conn)
            .optional()?;

        let Some(row) = row else {
            return Ok(None);
        };

        let mut msg = MessageData::bare(row.id, row.room_id, row.sender_id, row.created_at);
        msg.content = row.content;
        msg.message_type = row.message_type;
        msg.file = row.file;
        msg.status = MessageStatus::from_i32(row.status);
        msg.updated_at = row.updated_at;
        msg.sender_message_id = row.sender_message_id;

        self.cache.set_message_simple(&msg).await;
        Ok(Some(msg))
    }

    async fn get_message_by_sender_message_id(
        &self,
        user_id: Uuid,
        sender_message_id: &str,
    ) -> AppResult<Option<MessageData>> {
        let mut conn = self.conn()?;
        let row: Option<MessageRow> = room_message::table
            .filter(room_message::sender_message_id.eq(sender_message_id))
            .filter(room_message::sender_id.eq(user_id))
            .filter(room_message::deleted_at.is_null())
            .first(&mut conn)
            .optional()?;

        Ok(row.map(|row| {
            let mut msg = MessageData::bare(row.id, row.room_id, row.sender_id, row.created_at);
            msg.status = MessageStatus::from_i32(row.status);
            msg.message_type = row.message_type;
            msg.sender_message_id = row.sender_message_id;
            msg.updated_at = row.updated_at;
            msg
        }))
    }

    async fn update_message(&self, _user_id: Uuid, message_id: Uuid, content: &str) -> AppResult<()> {
        let mut conn = self.conn()?;
        diesel::update(room_message::table.filter(room_message::id.eq(message_id)))
            .set((
                room_message::content.eq(content),
                room_message::edited.eq(true),
                room_message::updated_at.eq(diesel::dsl::now),
            ))
            .execute(&mut conn)?;
        Ok(())
    }

    async fn delete_messages(&self, _user_id: Uuid, message_ids: &[Uuid]) -> AppResult<()> {
        let mut conn = self.conn()?;
        diesel::update(room_message::table.filter(room_message::id.eq_any(message_ids)))
            .set((
                room_message::is_deleted.eq(true),
                room_message::deleted_at.eq(diesel::dsl::now),
                room_message::updated_at.eq(diesel::dsl::now),
            ))
            .execute(&mut conn)?;
        Ok(())
    }

    async fn get_messages_from_room(
        &self,
        user_id: Uuid,
        filter: &MessageHistoryFilter,
    ) -> AppResult<(Vec<MessageData>, PaginationMeta)> {
        let mut conn = self.conn()?;

        let before_created = self.resolve_created_at(&mut conn, filter.before_message_id)?;
        let after_created = self.resolve_created_at(&mut conn, filter.after_message_id)?;
        let per_room = filter.messages_per_room > 0;

        let rows: Vec<MessageQueryRow> = if per_room {
            sql_query(message_history_sql(true))
                .bind::<SqlUuid, _>(user_id)
                .bind::<Nullable<SqlUuid>, _>(filter.room_id)
                .bind::<Nullable<Timestamptz>, _>(filter.before_date)
                .bind::<Nullable<Timestamptz>, _>(filter.after_date)
                .bind::<Nullable<Timestamptz>, _>(before_created)
                .bind::<Nullable<Timestamptz>, _>(after_created)
                .bind::<BigInt, _>(filter.messages_per_room as i64)
                .load(&mut conn)?
        } else {
            let limit = filter.limit as i64;
            let offset = if filter.page > 0 && filter.limit > 0 {
                ((filter.page - 1) * filter.limit) as i64
            } else {
                0
            };
            sql_query(message_history_sql(false))
                .bind::<SqlUuid, _>(user_id)
                .bind::<Nullable<SqlUuid>, _>(filter.room_id)
                .bind::<Nullable<Timestamptz>, _>(filter.before_date)
                .bind::<Nullable<Timestamptz>, _>(filter.after_date)
                .bind::<Nullable<Timestamptz>, _>(before_created)
                .bind::<Nullable<Timestamptz>, _>(after_created)
                .bind::<BigInt, _>(limit)
                .bind::<BigInt, _>(offset)
                .load(&mut conn)?
        };

        let messages = self.assemble_messages(&mut conn, user_id, rows)?;

        let meta = if per_room {
            PaginationMeta::page_only(messages.len() as u32)
        } else {
            let total: CountRow = sql_query(message_count_sql())
                .bind::<SqlUuid, _>(user_id)
                .bind::<Nullable<SqlUuid>, _>(filter.room_id)
                .bind::<Nullable<Timestamptz>, _>(filter.before_date)
                .bind::<Nullable<Timestamptz>, _>(filter.after_date)
                .bind::<Nullable<Timestamptz>, _>(before_created)
                .bind::<Nullable<Timestamptz>, _>(after_created)
                .get_result(&mut conn)?;
            PaginationMeta::new(
                total.total as u32,
                messages.len() as u32,
                filter.limit,
                filter.page,
            )
        };

        Ok((messages, meta))
    }

    async fn react_to_message(
        &self,
        user_id: Uuid,
        message_id: Uuid,
        reaction: &str,
    ) -> AppResult<()> {
        let mut conn = self.conn()?;

        conn.transaction::<(), diesel::result::Error, _>(|conn| {
            let existing: Option<(Uuid, String)> = room_message_reaction::table
                .filter(room_message_reaction::message_id.eq(message_id))
                .filter(room_message_reaction::user_id.eq(user_id))
                .filter(room_message_reaction::deleted_at.is_null())
                .select((room_message_reaction::id, room_message_reaction::reaction))
                .first(conn)
                .optional()?;

            match existing {
                Some((row_id, current)) => {
                    if reaction.is_empty() || current == reaction {
                        // Repeating the same reaction toggles it off.
                        diesel::update(
                            room_message_reaction::table.filter(room_message_reaction::id.eq(row_id)),
                        )
                        .set(room_message_reaction::deleted_at.eq(diesel::dsl::now))
                        .execute(conn)?;
                    } else {
                        diesel::update(
                            room_message_reaction::table.filter(room_message_reaction::id.eq(row_id)),
                        )
                        .set((
                            room_message_reaction::reaction.eq(reaction),
                            room_message_reaction::updated_at.eq(diesel::dsl::now),
                        ))
                        .execute(conn)?;
                    }
                }
                None if !reaction.is_empty() => {
                    diesel::insert_into(room_message_reaction::table)
                        .values(&NewReaction {
                            message_id,
                            user_id,
                            reaction: reaction.to_string(),
                        })
                        .execute(conn)?;
                }
                None => {}
            }

            diesel::update(room_message::table.filter(room_message::id.eq(message_id)))
                .set(room_message::updated_at.eq(diesel::dsl::now))
                .execute(conn)?;
            Ok(())
        })?;

        Ok(())
    }

    async fn mark_messages_as_read(
        &self,
        user_id: Uuid,
        room_id: Uuid,
        message_ids: &[Uuid],
        since: Option<DateTime<Utc>>,
    ) -> AppResult<i32> {
        if message_ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn()?;

        let marked = conn.transaction::<i32, diesel::result::Error, _>(|conn| {
            let mut targets: Vec<Uuid> = message_ids.to_vec();

            // "since" expands the explicit ids to everything unread in the
            // room created strictly before that instant.
            if let Some(since) = since {
                let older_unread: Vec<Uuid> = room_message::table
                    .left_join(
                        room_message_meta::table.on(room_message_meta::message_id
                            .eq(room_message::id)
                            .and(room_message_meta::user_id.eq(user_id))),
                    )
                    .filter(room_message::room_id.eq(room_id))
                    .filter(room_message::created_at.lt(since))
                    .filter(room_message::deleted_at.is_null())
                    .filter(room_message_meta::read_at.is_null())
                    .select(room_message::id)
                    .load(conn)?;
                targets.extend(older_unread);
            }
            targets.sort();
            targets.dedup();

            let existing: Vec<(Uuid, Option<DateTime<Utc>>)> = room_message_meta::table
                .filter(room_message_meta::user_id.eq(user_id))
                .filter(room_message_meta::message_id.eq_any(&targets))
                .select((room_message_meta::message_id, room_message_meta::read_at))
                .load(conn)?;

            let mut to_update = Vec::new();
            for (message_id, read_at) in &existing {
                if read_at.is_none() {
                    to_update.push(*message_id);
                }
            }
            let known: Vec<Uuid> = existing.iter().map(|(id, _)| *id).collect();
            let to_create: Vec<Uuid> = targets
                .iter()
                .filter(|id| !known.contains(id))
                .copied()
                .collect();

            if !to_update.is_empty() {
                diesel::update(
                    room_message_meta::table
                        .filter(room_message_meta::user_id.eq(user_id))
                        .filter(room_message_meta::message_id.eq_any(&to_update))
                        .filter(room_message_meta::read_at.is_null()),
                )
                .set(room_message_meta::read_at.eq(diesel::dsl::now))
                .execute(conn)?;
            }

            if !to_create.is_empty() {
                let rows: Vec<NewMessageMeta> = to_create
                    .iter()
                    .map(|id| NewMessageMeta {
                        message_id: *id,
                        user_id,
                        read_at: Some(Utc::now()),
                        is_deleted: false,
                        is_sender_blocked: false,
                    })
                    .collect();
                diesel::insert_into(room_message_meta::table)
                    .values(&rows)
                    .execute(conn)?;
            }

            diesel::update(room_message::table.filter(room_message::id.eq_any(&targets)))
                .set(room_message::status.eq(MessageStatus::Read.as_i32()))
                .execute(conn)?;

            Ok((to_update.len() + to_create.len()) as i32)
        })?;

        self.cache.invalidate_room(room_id).await;
        Ok(marked)
    }

    async fn get_message_read(
        &self,
        filter: &MessageAudienceFilter,
    ) -> AppResult<(Vec<MessageUserRead>, PaginationMeta)> {
        let mut conn = self.conn()?;

        let mut query = room_message_meta::table
            .inner_join(users::table.on(users::id.eq(room_message_meta::user_id)))
            .filter(room_message_meta::message_id.eq(filter.message_id))
            .filter(room_message_meta::deleted_at.is_null())
            .filter(room_message_meta::read_at.is_not_null())
            .select((
                room_message_meta::user_id,
                users::name,
                users::phone,
                users::avatar,
                room_message_meta::read_at,
            ))
            .order(room_message_meta::read_at.asc())
            .into_boxed();

        if filter.page > 0 && filter.limit > 0 {
            query = query
                .offset(((filter.page - 1) * filter.limit) as i64)
                .limit(filter.limit as i64);
        }

        let rows: Vec<(Uuid, String, String, Option<String>, Option<DateTime<Utc>>)> =
            query.load(&mut conn)?;

        let items: Vec<MessageUserRead> = rows
            .into_iter()
            .filter_map(|(user_id, user_name, user_phone, user_avatar, read_at)| {
                read_at.map(|read_at| MessageUserRead {
                    user_id,
                    user_name,
                    user_phone,
                    user_avatar,
                    read_at,
                })
            })
            .collect();

        let total: i64 = room_message_meta::table
            .filter(room_message_meta::message_id.eq(filter.message_id))
            .filter(room_message_meta::deleted_at.is_null())
            .filter(room_message_meta::read_at.is_not_null())
            .count()
            .get_result(&mut conn)?;

        let meta = PaginationMeta::new(total as u32, items.len() as u32, filter.limit, filter.page);
        Ok((items, meta))
    }

    async fn get_message_reactions(
        &self,
        filter: &MessageAudienceFilter,
    ) -> AppResult<(Vec<Reaction>, PaginationMeta)> {
        let mut conn = self.conn()?;

        let mut query = room_message_reaction::table
            .inner_join(users::table)
            .filter(room_message_reaction::message_id.eq(filter.message_id))
            .filter(room_message_reaction::deleted_at.is_null())
            .select((
                room_message_reaction::message_id,
                room_message_reaction::user_id,
                users::name,
                users::phone,
                users::avatar,
                room_message_reaction::reaction,
            ))
            .order(room_message_reaction::created_at.desc())
            .into_boxed();

        if filter.page > 0 && filter.limit > 0 {
            query = query
                .offset(((filter.page - 1) * filter.limit) as i64)
                .limit(filter.limit as i64);
        }

        let rows: Vec<(Uuid, Uuid, String, String, Option<String>, String)> =
            query.load(&mut conn)?;

        let items: Vec<Reaction> = rows
            .into_iter()
            .map(
                |(message_id, user_id, name, phone, avatar, reaction)| Reaction {
                    message_id,
                    reacted_by_id: user_id,
                    reacted_by_name: name,
                    reacted_by_phone: phone,
                    reacted_by_avatar: avatar,
                    reaction,
                },
            )
            .collect();

        let total: i64 = room_message_reaction::table
            .filter(room_message_reaction::message_id.eq(filter.message_id))
            .filter(room_message_reaction::deleted_at.is_null())
            .count()
            .get_result(&mut conn)?;

        let meta = PaginationMeta::new(total as u32, items.len() as u32, filter.limit, filter.page);
        Ok((items, meta))
    }

    async fn create_message_meta_for_participants(
        &self,
        room_id: Uuid,
        message_id: Uuid,
        sender_id: Uuid,
    ) -> AppResult<()> {
        let mut conn = self.conn()?;

        // Recipient rows carry a snapshot of the blocked state at send time
        // so later blocks do not rewrite history.
        let recipients: Vec<(Uuid, bool)> = room_member::table
            .filter(room_member::room_id.eq(room_id))
            .filter(room_member::removed_at.is_null())
            .filter(room_member::user_id.ne(sender_id))
            .select((room_member::user_id, room_member::is_partner_blocked))
            .load(&mut conn)?;

        if recipients.is_empty() {
            return Ok(());
        }

        for batch in recipients.chunks(META_FANOUT_BATCH) {
            let rows: Vec<NewMessageMeta> = batch
                .iter()
                .map(|(user_id, blocked)| NewMessageMeta {
                    message_id,
                    user_id: *user_id,
                    read_at: None,
                    is_deleted: false,
                    is_sender_blocked: *blocked,
                })
                .collect();

            // A failed batch is logged and skipped; missing metas read as
            // unread, which is the safe default.
            if let Err(e) = diesel::insert_into(room_message_meta::table)
                .values(&rows)
                .on_conflict_do_nothing()
                .execute(&mut conn)
            {
                tracing::error!(
                    error = %e,
                    message_id = %message_id,
                    batch = batch.len(),
                    "message meta batch insert failed"
                );
            }
        }

        Ok(())
    }
}
