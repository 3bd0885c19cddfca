//! User-facing notifications raised by background work.

use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{error, warn};

/// How long a transient notification stays on screen.
pub const TRANSIENT_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub level: Level,
    pub message: String,
    /// `None` for blocking notifications that need acknowledgement.
    pub expires_after: Option<Duration>,
}

impl Notification {
    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            level: Level::Warning,
            message: message.into(),
            expires_after: Some(TRANSIENT_TTL),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: Level::Info,
            message: message.into(),
            expires_after: Some(TRANSIENT_TTL),
        }
    }

    pub fn blocking_error(message: impl Into<String>) -> Self {
        Self {
            level: Level::Error,
            message: message.into(),
            expires_after: None,
        }
    }

    pub fn is_blocking(&self) -> bool {
        self.expires_after.is_none()
    }
}

/// Fan-out of notifications to whoever renders them. Publishing with no
/// subscriber is not an error.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(64);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub fn publish(&self, notification: Notification) {
        match notification.level {
            Level::Error => error!(message = %notification.message, "Notification"),
            Level::Warning => warn!(message = %notification.message, "Notification"),
            Level::Info => {}
        }
        let _ = self.tx.send(notification);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.publish(Notification::warning(message));
    }
}
