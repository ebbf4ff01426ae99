//! Mailjet delivery
//!
//! Sends the share notification through the Mailjet v3.1 send API.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::{Notifier, NotifyError, ShareNotification};

const MAILJET_SEND_URL: &str = "https://api.mailjet.com/v3.1/send";

/// Upper bound on one send request, connect included
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(15);

/// Mailjet-backed notifier
pub struct MailjetNotifier {
    client: reqwest::Client,
    api_key: String,
    api_secret: String,
    from_email: String,
    from_name: String,
    endpoint: String,
}

impl MailjetNotifier {
    pub fn new(
        api_key: &str,
        api_secret: &str,
        from_email: &str,
        from_name: &str,
    ) -> Result<Self, NotifyError> {
        Ok(Self {
            client: build_client(DEFAULT_SEND_TIMEOUT)?,
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
            from_email: from_email.to_string(),
            from_name: from_name.to_string(),
            endpoint: MAILJET_SEND_URL.to_string(),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, NotifyError> {
        self.client = build_client(timeout)?;
        Ok(self)
    }

    /// Point at a different send endpoint
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn message_body(&self, notification: &ShareNotification) -> serde_json::Value {
        let expires = notification.expires_at.format("%Y-%m-%d %H:%M UTC").to_string();

        let text = format!(
            "You have received a secure file share.\n\nDownload URL: {}\nToken: {}\nFiles: {}\nExpires: {}",
            notification.download_url, notification.token, notification.file_count, expires
        );

        let html = format!(
            "<h2>Secure files shared with you</h2>\
             <p><a href=\"{url}\">Download your files</a></p>\
             <ul><li>Files: {count}</li><li>Expires: {expires}</li></ul>\
             <p>Token: <code>{token}</code></p>",
            url = notification.download_url,
            count = notification.file_count,
            expires = expires,
            token = notification.token,
        );

        json!({
            "Messages": [{
                "From": { "Email": self.from_email, "Name": self.from_name },
                "To": [{ "Email": notification.recipient_email, "Name": notification.recipient_email }],
                "Subject": "Secure Files Shared With You",
                "TextPart": text,
                "HTMLPart": html,
            }]
        })
    }
}

fn build_client(timeout: Duration) -> Result<reqwest::Client, NotifyError> {
    Ok(reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .build()?)
}

#[async_trait]
impl Notifier for MailjetNotifier {
    async fn notify(&self, notification: &ShareNotification) -> Result<(), NotifyError> {
        if self.api_key.is_empty() || self.api_secret.is_empty() {
            return Err(NotifyError::NotConfigured("missing Mailjet credentials".into()));
        }

        let response = self
            .client
            .post(&self.endpoint)
            .basic_auth(&self.api_key, Some(&self.api_secret))
            .json(&self.message_body(notification))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Delivery(format!("Mailjet returned {}: {}", status, body)));
        }

        tracing::info!(
            recipient = %notification.recipient_email,
            files = notification.file_count,
            "Share notification sent"
        );
        Ok(())
    }
}
