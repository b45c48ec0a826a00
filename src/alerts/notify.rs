//! Notification delivery.

use crate::db::{DbError, Store};

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Notification error types.
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("database error: {0}")]
    Db(#[from] DbError),
    #[error("user {0} has no notification targets")]
    NoTargets(i64),
    #[error("{failed} of {total} deliveries failed")]
    Partial { failed: usize, total: usize },
}

/// A rendered alert addressed to one user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertMessage {
    #[serde(skip)]
    pub user_id: i64,
    pub title: String,
    pub message: String,
    pub link: String,
    pub link_text: String,
}

/// Delivery channel for alert messages.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, msg: AlertMessage) -> Result<(), NotifyError>;
}

/// Posts alerts as JSON to every webhook URL of the addressed user.
pub struct WebhookNotifier {
    client: reqwest::Client,
    store: Arc<Store>,
}

impl WebhookNotifier {
    pub fn new(store: Arc<Store>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { client, store }
    }

    /// Deliver to a single URL, bypassing user lookup.
    pub async fn send_to_url(&self, url: &str, msg: &AlertMessage) -> Result<(), NotifyError> {
        self.client
            .post(url)
            .json(msg)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, msg: AlertMessage) -> Result<(), NotifyError> {
        let user = self.store.get_user(msg.user_id)?;
        if user.webhooks.is_empty() {
            return Err(NotifyError::NoTargets(user.id));
        }

        let mut failed = 0;
        for url in &user.webhooks {
            if let Err(e) = self.send_to_url(url, &msg).await {
                tracing::warn!("Webhook delivery to {} failed: {}", url, e);
                failed += 1;
            }
        }

        if failed > 0 {
            return Err(NotifyError::Partial {
                failed,
                total: user.webhooks.len(),
            });
        }
        Ok(())
    }
}

/// Base used to encode path segments when the hub has no absolute URL.
const RELATIVE_BASE: &str = "http://localhost/";

/// Link into the hub UI: `app_url` followed by the percent-encoded
/// `segments`. An `app_url` that is not an absolute URL is used as a plain
/// prefix.
pub fn app_link(app_url: &str, segments: &[&str]) -> String {
    fn append(mut url: Url, segments: &[&str]) -> Url {
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    match Url::parse(app_url) {
        Ok(url) => append(url, segments).to_string(),
        Err(_) => match Url::parse(RELATIVE_BASE) {
            Ok(base) => format!("{}{}", app_url.trim_end_matches('/'), append(base, segments).path()),
            Err(_) => app_url.to_string(),
        },
    }
}
