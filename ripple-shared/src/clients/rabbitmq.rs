use std::sync::Arc;

use lapin::{
    options::*, types::AMQPValue, types::FieldTable, BasicProperties, Channel, Connection,
    ConnectionProperties, Consumer,
};

/// Single durable topic exchange backing all chat events. Subjects
/// (`CHAT_EVENTS.<roomId>`, `CHAT_DIRECT_EVENTS.<userId>`) are routing keys
/// on this exchange; a durable consumer is a durable queue bound to one
/// subject, so the broker keeps the cursor across client reconnects.
const EXCHANGE_NAME: &str = "chat.events";

/// Per-subject retention, mirrored on every consumer queue.
const MAX_MESSAGES_PER_QUEUE: i32 = 1000;
const MESSAGE_TTL_MS: i64 = 7 * 24 * 60 * 60 * 1000;

#[derive(Clone)]
pub struct BrokerClient {
    conn: Arc<Connection>,
    channel: Channel,
}

impl BrokerClient {
    pub async fn connect(url: &str) -> Result<Self, lapin::Error> {
        let conn = Connection::connect(url, ConnectionProperties::default()).await?;
        let channel = conn.create_channel().await?;

        channel
            .exchange_declare(
                EXCHANGE_NAME,
                lapin::ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        tracing::info!(url = %url, exchange = EXCHANGE_NAME, "connected to RabbitMQ");
        Ok(Self {
            conn: Arc::new(conn),
            channel,
        })
    }

    /// Publish a raw payload on a subject. Delivery mode is persistent so
    /// bound consumer queues retain events while clients are away.
    pub async fn publish(&self, subject: &str, payload: &[u8]) -> Result<(), lapin::Error> {
        self.channel
            .basic_publish(
                EXCHANGE_NAME,
                subject,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_delivery_mode(2),
            )
            .await?
            .await?;

        tracing::debug!(subject = %subject, bytes = payload.len(), "event published");
        Ok(())
    }

    /// A dedicated channel for a streaming session; its consumers live and
    /// die with the session while the underlying queues survive.
    pub async fn create_channel(&self) -> Result<Channel, lapin::Error> {
        self.conn.create_channel().await
    }

    /// Declare the durable queue for `consumer_name`, bind it to `subject`
    /// and start consuming on `channel` with manual ack. New queues only
    /// buffer events published after the bind (deliver-new semantics).
    pub async fn subscribe_durable(
        &self,
        channel: &Channel,
        consumer_name: &str,
        subject: &str,
    ) -> Result<Consumer, lapin::Error> {
        let mut args = FieldTable::default();
        args.insert("x-max-length".into(), AMQPValue::LongInt(MAX_MESSAGES_PER_QUEUE));
        args.insert("x-message-ttl".into(), AMQPValue::LongLongInt(MESSAGE_TTL_MS));

        channel
            .queue_declare(
                consumer_name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                args,
            )
            .await?;

        channel
            .queue_bind(
                consumer_name,
                EXCHANGE_NAME,
                subject,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let consumer = channel
            .basic_consume(
                consumer_name,
                consumer_name,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        tracing::info!(consumer = %consumer_name, subject = %subject, "durable consumer started");
        Ok(consumer)
    }

    /// Stop a consumer without dropping its queue; the cursor stays durable
    /// for the next session that registers under the same name.
    pub async fn stop_consumer(
        &self,
        channel: &Channel,
        consumer_name: &str,
    ) -> Result<(), lapin::Error> {
        channel
            .basic_cancel(consumer_name, BasicCancelOptions::default())
            .await?;
        tracing::debug!(consumer = %consumer_name, "consumer stopped");
        Ok(())
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }
}
