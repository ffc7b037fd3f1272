//! Short-TTL per-(room, user, view) cache over Redis.
//!
//! Every cached room view registers its key in a per-room members set so a
//! structural change can drop every live key at once, while the hot send
//! path patches the cached `last_message` in place instead of invalidating
//! warm inboxes. `apply_new_message` is serialized per room by a lock held
//! in a process-global map; entries are tiny and never evicted.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use ripple_shared::clients::redis::RedisClient;

use crate::domain::{MessageData, Room};

const CACHE_TTL_SECS: u64 = 3600;

#[derive(Serialize, Deserialize)]
struct CachedValue<T> {
    data: T,
}

#[derive(Clone)]
pub struct RoomCache {
    redis: RedisClient,
    locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
}

pub fn room_cache_key(room_id: Uuid, user_id: Uuid, full: bool) -> String {
    if full {
        format!("endpoint:chat:room:{{{room_id}}}:user:{user_id}")
    } else {
        format!("endpoint:chat:room:{{{room_id}}}:shim:user:{user_id}")
    }
}

fn members_set_key(room_id: Uuid) -> String {
    format!("endpoint:chat:room:{{{room_id}}}:members")
}

fn message_simple_key(message_id: Uuid) -> String {
    format!("endpoint:chat:messagesimple:messageId:{{{message_id}}}")
}

impl RoomCache {
    pub fn new(redis: RedisClient) -> Self {
        Self {
            redis,
            locks: Arc::new(DashMap::new()),
        }
    }

    fn room_lock(&self, room_id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .entry(room_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn get_room(&self, cache_key: &str) -> Option<Room> {
        self.get_value(cache_key).await
    }

    pub async fn set_room(&self, room_id: Uuid, cache_key: &str, room: &Room) {
        if self.set_value(cache_key, room).await {
            if let Err(e) = self.redis.sadd(&members_set_key(room_id), cache_key).await {
                tracing::warn!(error = %e, room_id = %room_id, "failed to register cache key");
            }
        }
    }

    /// Drop every live cache key for a room, then the members set itself.
    pub async fn invalidate_room(&self, room_id: Uuid) {
        let set_key = members_set_key(room_id);
        match self.redis.smembers(&set_key).await {
            Ok(keys) => {
                if let Err(e) = self.redis.del_many(&keys).await {
                    tracing::warn!(error = %e, room_id = %room_id, "failed to drop cached room views");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, room_id = %room_id, "failed to read cache members set");
            }
        }
        if let Err(e) = self.redis.del(&set_key).await {
            tracing::warn!(error = %e, room_id = %room_id, "failed to drop cache members set");
        }
    }

    /// Patch `last_message` into every cached view of the message's room.
    pub async fn apply_new_message(&self, message: &MessageData) {
        let room_id = message.room_id;
        let lock = self.room_lock(room_id);
        let _guard = lock.lock().await;

        let keys = match self.redis.smembers(&members_set_key(room_id)).await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!(error = %e, room_id = %room_id, "failed to read cache members for patch");
                return;
            }
        };

        for key in keys {
            if let Some(mut room) = self.get_room(&key).await {
                room.last_message = Some(message.clone());
                room.last_message_at = Some(message.created_at);
                // set_room re-adds the key to the members set, which is fine.
                self.set_room(room_id, &key, &room).await;
            }
        }
    }

    pub async fn get_message_simple(&self, message_id: Uuid) -> Option<MessageData> {
        self.get_value(&message_simple_key(message_id)).await
    }

    pub async fn set_message_simple(&self, message: &MessageData) {
        self.set_value(&message_simple_key(message.id), message).await;
    }

    async fn get_value<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.redis.get(key).await.ok().flatten()?;
        serde_json::from_str::<CachedValue<T>>(&raw)
            .map(|cached| cached.data)
            .ok()
    }

    async fn set_value<T: Serialize>(&self, key: &str, value: &T) -> bool {
        let payload = match serde_json::to_string(&CachedValue { data: value }) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, key = %key, "failed to serialize cache value");
                return false;
            }
        };
        match self.redis.set(key, &payload, CACHE_TTL_SECS).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, key = %key, "failed to write cache value");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_keys_follow_the_shared_format() {
        let room = Uuid::nil();
        let user = Uuid::nil();
        assert_eq!(
            room_cache_key(room, user, true),
            format!("endpoint:chat:room:{{{room}}}:user:{user}")
        );
        assert_eq!(
            room_cache_key(room, user, false),
            format!("endpoint:chat:room:{{{room}}}:shim:user:{user}")
        );
        assert_eq!(
            members_set_key(room),
            format!("endpoint:chat:room:{{{room}}}:members")
        );
    }
}
