//! Agent status notifications.
//!
//! Agents push `status_update` frames outside of any request/response
//! exchange. Every connection publishes them on one [`NotificationFeed`]
//! owned by the application root; consumers subscribe independently.
//! [`StatusLog`] keeps a navigable history of received messages.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::models::Address;

/// Buffered events per subscriber before lagging subscribers skip ahead.
const FEED_CAPACITY: usize = 256;

/// Maximum entries the status log keeps
const MAX_LOG_ENTRIES: usize = 500;

/// Severity reported by an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusLevel {
    Error,
    Warning,
    Success,
}

impl StatusLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusLevel::Error => "error",
            StatusLevel::Warning => "warning",
            StatusLevel::Success => "success",
        }
    }

    /// Get icon/prefix for this level
    pub fn icon(&self) -> &'static str {
        match self {
            StatusLevel::Success => "✓",
            StatusLevel::Warning => "⚠",
            StatusLevel::Error => "✗",
        }
    }
}

impl fmt::Display for StatusLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Body of a `status_update` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub status: StatusLevel,
    #[serde(default)]
    pub message: String,
    /// Agent-side timestamp, as sent
    #[serde(default)]
    pub timestamp: f64,
    #[serde(default)]
    pub code: i64,
}

/// A status message together with where and when it arrived.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusEvent {
    pub address: Address,
    pub received_at: DateTime<Utc>,
    #[serde(flatten)]
    pub message: StatusMessage,
}

/// Process-wide broadcast of agent status updates.
///
/// Cloning yields another handle to the same feed.
#[derive(Debug, Clone)]
pub struct NotificationFeed {
    sender: broadcast::Sender<StatusEvent>,
}

impl Default for NotificationFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationFeed {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(FEED_CAPACITY);
        Self { sender }
    }

    /// Publish a status message from `address`. Dropped if nobody listens.
    pub fn publish(&self, address: Address, message: StatusMessage) {
        let _ = self.sender.send(StatusEvent {
            address,
            received_at: Utc::now(),
            message,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Navigable history of status messages.
///
/// New messages become current. Navigation never moves past either end.
#[derive(Debug, Clone, Default)]
pub struct StatusLog {
    entries: Vec<StatusEvent>,
    current: usize,
}

impl StatusLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message and make it current.
    pub fn push(&mut self, event: StatusEvent) {
        self.entries.push(event);
        if self.entries.len() > MAX_LOG_ENTRIES {
            self.entries.remove(0);
        }
        self.current = self.entries.len() - 1;
    }

    pub fn current(&self) -> Option<&StatusEvent> {
        self.entries.get(self.current)
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    /// Move to the previous (older) message.
    pub fn back(&mut self) {
        self.current = self.current.saturating_sub(1);
    }

    /// Move to the next (newer) message.
    pub fn forward(&mut self) {
        if self.current + 1 < self.entries.len() {
            self.current += 1;
        }
    }

    /// Drop the current message; the index stays put unless it ran off the end.
    pub fn remove_current(&mut self) -> Option<StatusEvent> {
        if self.entries.is_empty() {
            return None;
        }
        let removed = self.entries.remove(self.current);
        if self.current >= self.entries.len() {
            self.current = self.entries.len().saturating_sub(1);
        }
        Some(removed)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.current = 0;
    }

    pub fn entries(&self) -> &[StatusEvent] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
