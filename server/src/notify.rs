//! Completion notification delivery
//!
//! Terminal state transitions record a completion event in the outbox as
//! part of the transaction that produced them. Delivery then happens in two
//! layers: an immediate post-commit replay, and a periodic drain that
//! retries whatever the replay failed to push. The notification sink is
//! at-least-once; duplicate delivery is acceptable, losing the terminal
//! state is not, and the terminal state is never rolled back over a
//! delivery failure.

use crate::store::{outbox, QueuedEvent, ServerStore};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Errors a notification sink may surface.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// Worth retrying on the next drain.
    #[error("transient notify failure: {0}")]
    Transient(String),
    /// Retrying will not help; the event is dropped with a log.
    #[error("permanent notify failure: {0}")]
    Permanent(String),
}

/// A pub/sub style notification sink.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, topic: &str, message: &str) -> Result<(), NotifyError>;
}

/// Default sink that writes notifications to the log stream. Deployments
/// with a real pub/sub system replace this behind the same trait.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn publish(&self, topic: &str, message: &str) -> Result<(), NotifyError> {
        tracing::info!(topic = %topic, message = %message, "Task completion notification");
        Ok(())
    }
}

#[derive(Serialize)]
struct NotificationMessage<'a> {
    task_id: &'a str,
    state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    userdata: Option<&'a str>,
}

/// Replays the events recorded by one committed transaction, deleting each
/// outbox row on successful delivery. Failures stay in the outbox for the
/// periodic drain; they are never surfaced to the caller.
pub async fn publish_committed(
    store: &Arc<Mutex<ServerStore>>,
    notifier: &Arc<dyn Notifier>,
    events: Vec<QueuedEvent>,
) {
    for queued in events {
        let message = encode_message(&queued);
        match notifier.publish(&queued.event.topic, &message).await {
            Ok(()) => {
                let mut store = store.lock().await;
                match store.get_connection() {
                    Ok(conn) => {
                        if let Err(e) = outbox::delete(conn, queued.outbox_id) {
                            warn!("Failed to clear delivered outbox event: {}", e);
                        }
                    }
                    Err(e) => warn!("Failed to clear delivered outbox event: {}", e),
                }
            }
            Err(NotifyError::Transient(reason)) => {
                debug!(
                    task_id = %queued.event.task_id,
                    "Notification deferred to outbox drain: {}", reason
                );
            }
            Err(NotifyError::Permanent(reason)) => {
                warn!(
                    task_id = %queued.event.task_id,
                    "Dropping undeliverable notification: {}", reason
                );
                let mut store = store.lock().await;
                if let Ok(conn) = store.get_connection() {
                    let _ = outbox::delete(conn, queued.outbox_id);
                }
            }
        }
    }
}

/// Drains pending outbox events, retrying delivery. Returns the number of
/// events delivered or dropped.
pub async fn drain_outbox(
    store: &Arc<Mutex<ServerStore>>,
    notifier: &Arc<dyn Notifier>,
    limit: usize,
) -> anyhow::Result<usize> {
    let pending = {
        let mut store = store.lock().await;
        let conn = store.get_connection()?;
        outbox::pending_page(conn, limit)?
    };

    let mut acted = 0usize;
    for (id, event, attempts) in pending {
        let queued = QueuedEvent {
            outbox_id: id,
            event,
        };
        let message = encode_message(&queued);
        match notifier.publish(&queued.event.topic, &message).await {
            Ok(()) => {
                let mut store = store.lock().await;
                let conn = store.get_connection()?;
                outbox::delete(conn, id)?;
                acted += 1;
            }
            Err(NotifyError::Permanent(reason)) => {
                warn!(
                    task_id = %queued.event.task_id,
                    "Dropping undeliverable notification: {}", reason
                );
                let mut store = store.lock().await;
                let conn = store.get_connection()?;
                outbox::delete(conn, id)?;
                acted += 1;
            }
            Err(NotifyError::Transient(reason)) => {
                debug!(
                    task_id = %queued.event.task_id,
                    attempts, "Notification retry failed: {}", reason
                );
                let mut store = store.lock().await;
                let conn = store.get_connection()?;
                outbox::bump_attempts(conn, id)?;
            }
        }
    }
    Ok(acted)
}

fn encode_message(queued: &QueuedEvent) -> String {
    serde_json::to_string(&NotificationMessage {
        task_id: &queued.event.task_id,
        state: queued.event.state.to_string(),
        userdata: queued.event.userdata.as_deref(),
    })
    .unwrap_or_else(|_| format!(r#"{{"task_id":"{}"}}"#, queued.event.task_id))
}
