//! User-visible notification sink.
//!
//! Every surfaced failure and setup milestone is pushed here in addition to
//! the tracing log. The editor front-end polls the buffer over IPC
//! (`GET /api/notifications?since=<id>`) and renders entries as editor
//! notifications, so nothing the daemon reports is silently swallowed.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// Maximum number of notifications retained for polling.
const NOTIFICATION_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NotifyLevel {
    Info,
    Error,
}

/// A single user-facing message with a sequential ID for polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: u64,
    /// Unix timestamp (seconds)
    pub timestamp: u64,
    pub level: NotifyLevel,
    pub message: String,
}

struct Buffer {
    entries: VecDeque<Notification>,
    next_id: u64,
}

/// Ring buffer of user-facing messages, shared across components.
pub struct NotificationLog {
    inner: Mutex<Buffer>,
}

impl NotificationLog {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Buffer {
                entries: VecDeque::with_capacity(NOTIFICATION_BUFFER),
                next_id: 0,
            }),
        }
    }

    pub async fn info(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!("{}", message);
        self.push(NotifyLevel::Info, message).await;
    }

    pub async fn error(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!("{}", message);
        self.push(NotifyLevel::Error, message).await;
    }

    async fn push(&self, level: NotifyLevel, message: String) {
        let mut inner = self.inner.lock().await;
        let entry = Notification {
            id: inner.next_id,
            timestamp: current_timestamp(),
            level,
            message,
        };
        inner.next_id += 1;
        if inner.entries.len() >= NOTIFICATION_BUFFER {
            inner.entries.pop_front();
        }
        inner.entries.push_back(entry);
    }

    /// All notifications with `id > since_id` (for polling).
    pub async fn since(&self, since_id: u64) -> Vec<Notification> {
        let inner = self.inner.lock().await;
        inner
            .entries
            .iter()
            .filter(|n| n.id > since_id)
            .cloned()
            .collect()
    }

    /// The most recent `count` notifications.
    pub async fn recent(&self, count: usize) -> Vec<Notification> {
        let inner = self.inner.lock().await;
        inner.entries.iter().rev().take(count).rev().cloned().collect()
    }
}

impl Default for NotificationLog {
    fn default() -> Self {
        Self::new()
    }
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
