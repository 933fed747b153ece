use std::time::Duration;

use archivist_server::Archive;
use async_trait::async_trait;
use backon::Retryable;
use reqwest::{Client, Url};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::services::retry::RetryPolicy;

/// Announces archives that reached a terminal state. Delivery problems are
/// logged by the implementation and never surface to the pipeline.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, archive: &Archive);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, archive: &Archive) {
        info!(
            archive_id = %archive.id,
            archive_type = %archive.archive_type,
            status = %archive.status,
            hash_info = %archive.hash_info,
            object_id = archive.object_id.as_deref().unwrap_or("-"),
            num_of_samples = archive.num_of_samples,
            "archive finished"
        );
    }
}

#[derive(Debug, Error)]
enum WebhookError {
    #[error("webhook request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("webhook responded {0}")]
    Status(reqwest::StatusCode),
}

impl WebhookError {
    fn is_transient(&self) -> bool {
        match self {
            WebhookError::Request(err) => !err.is_builder(),
            WebhookError::Status(status) => status.is_server_error(),
        }
    }
}

/// POSTs the archive as JSON to a fixed URL.
#[derive(Debug, Clone, bon::Builder)]
pub struct WebhookNotifier {
    client: Client,
    url: Url,
    #[builder(default)]
    retry: RetryPolicy,
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, archive: &Archive) {
        let attempt = {
            let client = self.client.clone();
            let url = self.url.clone();
            let archive = archive.clone();
            move || {
                let client = client.clone();
                let url = url.clone();
                let archive = archive.clone();
                async move {
                    let response = client.post(url).json(&archive).send().await?;
                    let status = response.status();
                    if !status.is_success() {
                        return Err(WebhookError::Status(status));
                    }
                    Ok(())
                }
            }
        };

        let delivered = attempt
            .retry(self.retry.backoff())
            .sleep(sleep)
            .when(WebhookError::is_transient)
            .notify(|err: &WebhookError, delay: Duration| {
                warn!(
                    stage = "notify",
                    archive_id = %archive.id,
                    delay_ms = delay.as_millis(),
                    error = %err,
                    "retrying archive webhook"
                );
            })
            .await;

        match delivered {
            Ok(()) => info!(archive_id = %archive.id, status = %archive.status, "archive webhook delivered"),
            Err(err) => warn!(archive_id = %archive.id, error = %err, "archive webhook dropped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use archivist_server::{ArchiveStatus, ArchiveType};
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn notifier(server: &MockServer) -> WebhookNotifier {
        WebhookNotifier::builder()
            .client(Client::new())
            .url(Url::parse(&format!("{}/hooks/archive", server.uri())).unwrap())
            .retry(RetryPolicy::new(2, Duration::from_millis(1)))
            .build()
    }

    #[tokio::test]
    async fn webhook_posts_archive_json() {
        let server = MockServer::start().await;
        let mut archive = Archive::building(ArchiveType::All, "abc", 3);
        archive.status = ArchiveStatus::Complete;
        Mock::given(method("POST"))
            .and(path("/hooks/archive"))
            .and(body_partial_json(serde_json::json!({
                "status": "COMPLETE",
                "type": "ALL",
                "hashInfo": "abc",
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        notifier(&server).notify(&archive).await;
    }

    #[tokio::test]
    async fn webhook_retries_server_errors_then_gives_up_quietly() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;
        notifier(&server)
            .notify(&Archive::building(ArchiveType::All, "abc", 0))
            .await;
    }

    #[tokio::test]
    async fn webhook_does_not_retry_client_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400))
            .expect(1)
            .mount(&server)
            .await;
        notifier(&server)
            .notify(&Archive::building(ArchiveType::All, "abc", 0))
            .await;
    }
}
