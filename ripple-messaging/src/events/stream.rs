//! Streaming session plumbing: the process-wide session registry and the
//! per-connection state machine that owns a set of durable broker
//! consumers, grows it on RoomJoin, shrinks it on RoomLeave and heartbeats
//! the client until the connection goes away.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_lite::StreamExt;
use lapin::message::Delivery;
use lapin::options::BasicAckOptions;
use lapin::Channel;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use ripple_shared::clients::rabbitmq::BrokerClient;
use ripple_shared::{AppError, AppResult};

use crate::events::{
    direct_subject, forwards_to_session, room_subject, ChatEvent, ChatEventKind, EventEnvelope,
};
use crate::repository::{ChatRepository, RoomFilter};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const DELIVERY_BUFFER: usize = 128;

/// Maps `(user_id, client_id)` to the active server-side stream handle.
#[derive(Default)]
pub struct StreamManager {
    sessions: DashMap<(Uuid, String), mpsc::Sender<ChatEvent>>,
}

impl StreamManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, user_id: Uuid, client_id: &str, tx: mpsc::Sender<ChatEvent>) {
        self.sessions.insert((user_id, client_id.to_string()), tx);
        tracing::info!(user_id = %user_id, client_id = %client_id, "stream session registered");
    }

    pub fn unregister(&self, user_id: Uuid, client_id: &str) {
        if self
            .sessions
            .remove(&(user_id, client_id.to_string()))
            .is_some()
        {
            tracing::info!(user_id = %user_id, client_id = %client_id, "stream session unregistered");
        }
    }

    /// Best-effort write to a session; a broken stream is unregistered.
    pub fn send(&self, user_id: Uuid, client_id: &str, event: ChatEvent) -> bool {
        let key = (user_id, client_id.to_string());
        let Some(tx) = self.sessions.get(&key).map(|entry| entry.clone()) else {
            return false;
        };
        if tx.try_send(event).is_err() {
            tracing::warn!(user_id = %user_id, client_id = %client_id, "stream send failed, dropping session");
            self.sessions.remove(&key);
            return false;
        }
        true
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }
}

struct ConsumerHandle {
    name: String,
    forwarder: JoinHandle<()>,
}

/// One streaming connection. Owns a broker channel, one durable consumer
/// per subscribed subject and the outbound event channel to the client.
pub struct StreamSession {
    pub broker: BrokerClient,
    pub repository: Arc<dyn ChatRepository>,
    pub manager: Arc<StreamManager>,
    pub user_id: Uuid,
    pub client_id: String,
    pub out: mpsc::Sender<ChatEvent>,
}

impl StreamSession {
    pub async fn run(self, specific_room: Option<Uuid>) -> AppResult<()> {
        let channel = self
            .broker
            .create_channel()
            .await
            .map_err(|e| AppError::Internal(e.into()))?;

        self.manager
            .register(self.user_id, &self.client_id, self.out.clone());

        let (delivery_tx, mut delivery_rx) = mpsc::channel::<Delivery>(DELIVERY_BUFFER);
        let mut consumers: HashMap<String, ConsumerHandle> = HashMap::new();

        let result = self
            .run_inner(
                specific_room,
                &channel,
                &delivery_tx,
                &mut delivery_rx,
                &mut consumers,
            )
            .await;

        for (_, consumer) in consumers.drain() {
            consumer.forwarder.abort();
            if let Err(e) = self.broker.stop_consumer(&channel, &consumer.name).await {
                tracing::warn!(error = %e, consumer = %consumer.name, "failed to stop consumer on teardown");
            }
        }
        self.manager.unregister(self.user_id, &self.client_id);
        tracing::info!(user_id = %self.user_id, client_id = %self.client_id, "stream session closed");

        result
    }

    async fn run_inner(
        &self,
        specific_room: Option<Uuid>,
        channel: &Channel,
        delivery_tx: &mpsc::Sender<Delivery>,
        delivery_rx: &mut mpsc::Receiver<Delivery>,
        consumers: &mut HashMap<String, ConsumerHandle>,
    ) -> AppResult<()> {
        // The direct subject is always on: RoomJoin for rooms we are not
        // yet subscribed to arrives here.
        let direct = self
            .start_consumer(
                channel,
                format!("client-{}-direct", self.client_id),
                direct_subject(self.user_id),
                delivery_tx,
            )
            .await?;
        consumers.insert("direct".to_string(), direct);

        let (rooms, _) = self
            .repository
            .get_room_list(self.user_id, &RoomFilter::default())
            .await?;
        let allowed: Vec<Uuid> = rooms.iter().map(|r| r.id).collect();

        match specific_room.filter(|room_id| allowed.contains(room_id)) {
            Some(room_id) => {
                tracing::info!(client_id = %self.client_id, room_id = %room_id, "subscribing to a single room");
                self.subscribe_room(channel, consumers, delivery_tx, room_id)
                    .await?;
            }
            None => {
                if allowed.is_empty() {
                    tracing::warn!(client_id = %self.client_id, "user has no rooms yet, waiting for a join");
                }
                for room_id in &allowed {
                    self.subscribe_room(channel, consumers, delivery_tx, *room_id)
                        .await?;
                }
            }
        }

        self.manager
            .send(self.user_id, &self.client_id, ChatEvent::connected());

        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + HEARTBEAT_INTERVAL,
            HEARTBEAT_INTERVAL,
        );

        loop {
            tokio::select! {
                maybe_delivery = delivery_rx.recv() => {
                    let Some(delivery) = maybe_delivery else { break };
                    self.handle_delivery(channel, consumers, delivery_tx, &delivery).await;
                    // Ack regardless of downstream outcome: retention plus
                    // incremental sync cover a client that missed an event.
                    if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                        tracing::warn!(error = %e, "failed to ack delivery");
                    }
                }
                _ = heartbeat.tick() => {
                    if !self.manager.send(self.user_id, &self.client_id, ChatEvent::connected()) {
                        break;
                    }
                }
                _ = self.out.closed() => break,
            }
        }

        Ok(())
    }

    async fn handle_delivery(
        &self,
        channel: &Channel,
        consumers: &mut HashMap<String, ConsumerHandle>,
        delivery_tx: &mpsc::Sender<Delivery>,
        delivery: &Delivery,
    ) {
        let envelope: EventEnvelope = match serde_json::from_slice(&delivery.data) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::error!(error = %e, "failed to decode broker envelope");
                return;
            }
        };
        let dispatch_user = envelope.user_id;
        let mut event = envelope.payload;

        let Some(room_id) = event.room_id else {
            return;
        };

        match &event.event {
            ChatEventKind::RoomJoin { user_id: joiner, .. } => {
                // A join may precede this session's room list; treat it as a
                // subscribe signal and fetch the room lazily.
                match self
                    .repository
                    .get_room(self.user_id, room_id, true, true)
                    .await
                {
                    Ok(room) => event.room = room,
                    Err(e) => {
                        tracing::error!(error = %e, room_id = %room_id, "failed to fetch room for join event");
                        return;
                    }
                }

                if (*joiner == self.user_id || dispatch_user == self.user_id)
                    && !consumers.contains_key(&room_id.to_string())
                {
                    match self
                        .subscribe_room(channel, consumers, delivery_tx, room_id)
                        .await
                    {
                        Ok(()) => {
                            tracing::info!(room_id = %room_id, client_id = %self.client_id, "subscribed to room on join event")
                        }
                        Err(e) => {
                            tracing::error!(error = %e, room_id = %room_id, "failed to subscribe on join event")
                        }
                    }
                }
                self.forward(event);
            }

            ChatEventKind::RoomUpdated => {
                match self
                    .repository
                    .get_room(self.user_id, room_id, true, true)
                    .await
                {
                    Ok(room) => event.room = room,
                    Err(e) => {
                        tracing::error!(error = %e, room_id = %room_id, "failed to fetch room for update event");
                        return;
                    }
                }
                self.forward(event);
            }

            ChatEventKind::StatusUpdate { .. } => {
                if forwards_to_session(&event.event, dispatch_user, self.user_id) {
                    self.forward(event);
                }
            }

            ChatEventKind::RoomLeave { user_ids } => {
                let includes_me = user_ids.contains(&self.user_id);
                self.forward(event);

                if includes_me {
                    if let Some(consumer) = consumers.remove(&room_id.to_string()) {
                        consumer.forwarder.abort();
                        if let Err(e) = self.broker.stop_consumer(channel, &consumer.name).await {
                            tracing::warn!(error = %e, consumer = %consumer.name, "failed to stop consumer on leave");
                        }
                        tracing::info!(room_id = %room_id, client_id = %self.client_id, "unsubscribed from room on leave event");
                    }
                }
            }

            _ => self.forward(event),
        }
    }

    fn forward(&self, event: ChatEvent) {
        self.manager.send(self.user_id, &self.client_id, event);
    }

    async fn subscribe_room(
        &self,
        channel: &Channel,
        consumers: &mut HashMap<String, ConsumerHandle>,
        delivery_tx: &mpsc::Sender<Delivery>,
        room_id: Uuid,
    ) -> AppResult<()> {
        let handle = self
            .start_consumer(
                channel,
                format!("client-{}-room-{}", self.client_id, room_id),
                room_subject(room_id),
                delivery_tx,
            )
            .await?;
        consumers.insert(room_id.to_string(), handle);
        Ok(())
    }

    async fn start_consumer(
        &self,
        channel: &Channel,
        consumer_name: String,
        subject: String,
        delivery_tx: &mpsc::Sender<Delivery>,
    ) -> AppResult<ConsumerHandle> {
        let mut consumer = self
            .broker
            .subscribe_durable(channel, &consumer_name, &subject)
            .await
            .map_err(|e| AppError::Internal(e.into()))?;

        let tx = delivery_tx.clone();
        let name = consumer_name.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(next) = consumer.next().await {
                match next {
                    Ok(delivery) => {
                        if tx.send(delivery).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, consumer = %name, "consumer stream error");
                        break;
                    }
                }
            }
        });

        Ok(ConsumerHandle {
            name: consumer_name,
            forwarder,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn manager_register_send_unregister() {
        let manager = StreamManager::new();
        let user = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(4);

        manager.register(user, "client-a", tx);
        assert_eq!(manager.active_sessions(), 1);

        assert!(manager.send(user, "client-a", ChatEvent::connected()));
        assert!(matches!(
            rx.recv().await.unwrap().event,
            ChatEventKind::Connected { connected: true }
        ));

        manager.unregister(user, "client-a");
        assert_eq!(manager.active_sessions(), 0);
        assert!(!manager.send(user, "client-a", ChatEvent::connected()));
    }

    #[tokio::test]
    async fn manager_drops_sessions_with_full_buffers() {
        let manager = StreamManager::new();
        let user = Uuid::new_v4();
        let (tx, _rx) = mpsc::channel(1);

        manager.register(user, "client-b", tx);
        assert!(manager.send(user, "client-b", ChatEvent::connected()));
        // Second send overflows the buffer and evicts the session.
        assert!(!manager.send(user, "client-b", ChatEvent::connected()));
        assert_eq!(manager.active_sessions(), 0);
    }
}
