//! Asynchronous event dispatch.
//!
//! `dispatch_*` calls return immediately; a background loop drains the job
//! queue and runs each job on its own task, bounded by a semaphore. Durable
//! publishes retry transient broker errors with exponential backoff and are
//! logged (not surfaced) once the attempts are exhausted — the
//! authoritative state lives in storage and reconciles via InitialSync.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use uuid::Uuid;

use ripple_shared::clients::rabbitmq::BrokerClient;

use crate::events::ChatEvent;
use crate::events::EventEnvelope;

const PUBLISH_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: u64 = 200;

type FanoutTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

enum DispatchJob {
    Publish {
        subject: String,
        payload: Vec<u8>,
        event_id: Uuid,
    },
    Fanout(FanoutTask),
}

#[derive(Clone)]
pub struct EventDispatcher {
    jobs: mpsc::UnboundedSender<DispatchJob>,
}

impl EventDispatcher {
    pub fn new(broker: BrokerClient, max_in_flight: usize) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<DispatchJob>();
        let limiter = Arc::new(Semaphore::new(max_in_flight.max(1)));

        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let Ok(permit) = limiter.clone().acquire_owned().await else {
                    break;
                };
                let broker = broker.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    match job {
                        DispatchJob::Publish {
                            subject,
                            payload,
                            event_id,
                        } => publish_with_retry(&broker, &subject, &payload, event_id).await,
                        DispatchJob::Fanout(task) => task.await,
                    }
                });
            }
            tracing::info!("event dispatcher stopped");
        });

        Self { jobs: tx }
    }

    /// Queue a chat event for durable publication. The envelope is
    /// serialized exactly once, here.
    pub fn dispatch_event(&self, dispatch_user: Uuid, event: ChatEvent) {
        let Some(subject) = event.subject() else {
            return;
        };
        let event_id = event.event_id;

        let envelope = EventEnvelope {
            user_id: dispatch_user,
            payload: event,
        };
        let payload = match serde_json::to_vec(&envelope) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(error = %e, subject = %subject, "failed to serialize event envelope");
                return;
            }
        };

        if self
            .jobs
            .send(DispatchJob::Publish {
                subject,
                payload,
                event_id,
            })
            .is_err()
        {
            tracing::error!("event dispatcher queue is closed");
        }
    }

    /// Queue detached fan-out work (recipient metas, push notifications).
    /// The future runs outside the originating request's lifetime.
    pub fn dispatch_fanout<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.jobs.send(DispatchJob::Fanout(Box::pin(task))).is_err() {
            tracing::error!("event dispatcher queue is closed");
        }
    }
}

/// Publish immediately on the caller's task. Fan-out sequences use this
/// when relative order matters (`StatusUpdate(SENT)` strictly before
/// `Message` on a room subject); queued dispatch jobs run concurrently and
/// would not preserve it.
pub async fn publish_event(broker: &BrokerClient, dispatch_user: Uuid, event: ChatEvent) {
    let Some(subject) = event.subject() else {
        return;
    };
    let event_id = event.event_id;
    let envelope = EventEnvelope {
        user_id: dispatch_user,
        payload: event,
    };
    match serde_json::to_vec(&envelope) {
        Ok(payload) => publish_with_retry(broker, &subject, &payload, event_id).await,
        Err(e) => {
            tracing::error!(error = %e, subject = %subject, "failed to serialize event envelope")
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_millis(BACKOFF_BASE_MS * 2u64.pow(attempt))
}

async fn publish_with_retry(broker: &BrokerClient, subject: &str, payload: &[u8], event_id: Uuid) {
    for attempt in 0..PUBLISH_ATTEMPTS {
        match broker.publish(subject, payload).await {
            Ok(()) => return,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    subject = %subject,
                    event_id = %event_id,
                    attempt = attempt + 1,
                    "event publish failed"
                );
                if attempt + 1 < PUBLISH_ATTEMPTS {
                    tokio::time::sleep(backoff_delay(attempt)).await;
                }
            }
        }
    }
    // TODO: route exhausted publishes to a dead-letter stream.
    tracing::error!(subject = %subject, event_id = %event_id, "giving up on event publish");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(backoff_delay(0), Duration::from_millis(200));
        assert_eq!(backoff_delay(1), Duration::from_millis(400));
        assert_eq!(backoff_delay(2), Duration::from_millis(800));
    }
}
