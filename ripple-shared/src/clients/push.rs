use serde::Serialize;
use uuid::Uuid;

/// HTTP client for the push-notification service. The service is an opaque
/// collaborator: every call here is fire-and-forget from the caller's point
/// of view (errors are logged and never fail the originating request).
#[derive(Clone)]
pub struct PushClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessagePush {
    pub recipient_user_ids: Vec<Uuid>,
    pub sender_id: Uuid,
    pub sender_display_name: String,
    pub room_id: Uuid,
    pub room_name: String,
    pub room_type: String,
    pub message_content: String,
}

#[derive(Debug, Serialize)]
struct TopicRequest<'a> {
    topic: &'a str,
    user_ids: &'a [Uuid],
}

impl PushClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    pub async fn send_push_notification(&self, push: &ChatMessagePush) -> anyhow::Result<()> {
        let url = format!("{}/internal/push/chat-message", self.base_url);
        self.http
            .post(&url)
            .json(push)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn subscribe_to_topic(&self, topic: &str, user_ids: &[Uuid]) -> anyhow::Result<()> {
        let url = format!("{}/internal/topics/subscribe", self.base_url);
        self.http
            .post(&url)
            .json(&TopicRequest { topic, user_ids })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn unsubscribe_from_topic(&self, topic: &str, user_ids: &[Uuid]) -> anyhow::Result<()> {
        let url = format!("{}/internal/topics/unsubscribe", self.base_url);
        self.http
            .post(&url)
            .json(&TopicRequest { topic, user_ids })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
