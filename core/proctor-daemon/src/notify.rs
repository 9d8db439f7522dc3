//! Notification hand-off.
//!
//! The daemon does not deliver notifications itself. It records one event per
//! recipient in the SQLite outbox and an external service drains it.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::db::Db;

/// Recipient used when an exam lists no supervising mentors.
pub const ALL_MENTORS: &str = "role:mentor";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    ReviewRequested,
    SessionTerminated,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::ReviewRequested => "review_requested",
            NotificationKind::SessionTerminated => "session_terminated",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub recipient: String,
    pub kind: NotificationKind,
    pub session_id: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &Notification) -> Result<(), String>;
}

pub struct OutboxNotifier {
    db: Db,
}

impl OutboxNotifier {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

impl Notifier for OutboxNotifier {
    fn notify(&self, notification: &Notification) -> Result<(), String> {
        self.db.insert_notification(
            &notification.recipient,
            notification.kind.as_str(),
            &notification.session_id,
            &notification.payload,
            &notification.created_at,
        )?;
        tracing::info!(
            recipient = %notification.recipient,
            kind = notification.kind.as_str(),
            session_id = %notification.session_id,
            "Notification queued"
        );
        Ok(())
    }
}
