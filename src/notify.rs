//! Alert delivery. Best-effort: delivery failures are logged, never returned.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{info, warn};

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, subject: &str, body: &str);
}

/// Writes alerts to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, subject: &str, body: &str) {
        info!(subject = %subject, "{}", body);
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    subject: &'a str,
    body: &'a str,
}

/// POSTs `{subject, body}` JSON to a webhook.
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, subject: &str, body: &str) {
        let payload = WebhookPayload { subject, body };
        match self.client.post(&self.url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => {
                info!(subject = %subject, "Notification sent");
            }
            Ok(resp) => warn!(status = %resp.status(), subject = %subject, "Notification rejected"),
            Err(e) => warn!(error = %e, subject = %subject, "Notification failed"),
        }
    }
}

/// Keeps every alert in memory.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: tokio::sync::Mutex<Vec<(String, String)>>,
}

#[cfg(test)]
#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, subject: &str, body: &str) {
        self.sent.lock().await.push((subject.to_string(), body.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_webhook_posts_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(body_json(json!({ "subject": "s", "body": "b" })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(format!("{}/hook", server.uri())).unwrap();
        notifier.notify("s", "b").await;
    }

    #[tokio::test]
    async fn test_webhook_failure_is_swallowed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(server.uri()).unwrap();
        notifier.notify("s", "b").await;

        let unreachable = WebhookNotifier::new("http://127.0.0.1:9/none").unwrap();
        unreachable.notify("s", "b").await;
    }
}
