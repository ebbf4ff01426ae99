//! Recipient notification
//!
//! The lifecycle core calls a [`Notifier`] once per finalize and records the
//! outcome. Retry policy, if any, belongs to the notifier.

mod mailjet;

pub use mailjet::MailjetNotifier;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Everything a notifier needs to tell a recipient about a share
#[derive(Debug, Clone)]
pub struct ShareNotification {
    pub token: String,
    pub recipient_email: String,
    pub download_url: String,
    pub file_count: usize,
    pub expires_at: DateTime<Utc>,
}

/// Notification error types
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Notifier not configured: {0}")]
    NotConfigured(String),

    #[error("Delivery failed: {0}")]
    Delivery(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Notifier trait
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &ShareNotification) -> Result<(), NotifyError>;
}

/// Keeps every notification in memory, optionally failing each delivery
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: parking_lot::Mutex<Vec<ShareNotification>>,
    fail_with: Option<String>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record each call, then report `error` as a delivery failure
    pub fn failing(error: impl Into<String>) -> Self {
        Self {
            sent: parking_lot::Mutex::new(Vec::new()),
            fail_with: Some(error.into()),
        }
    }

    pub fn sent(&self) -> Vec<ShareNotification> {
        self.sent.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &ShareNotification) -> Result<(), NotifyError> {
        self.sent.lock().push(notification.clone());
        match &self.fail_with {
            Some(error) => Err(NotifyError::Delivery(error.clone())),
            None => Ok(()),
        }
    }
}

/// Writes notifications to the log instead of delivering them
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &ShareNotification) -> Result<(), NotifyError> {
        tracing::info!(
            recipient = %notification.recipient_email,
            download_url = %notification.download_url,
            files = notification.file_count,
            expires_at = %notification.expires_at,
            "Share ready (no mail transport configured)"
        );
        Ok(())
    }
}
