//! REST client for the notification endpoints.

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Duration;

use crate::api::ApiResponse;
use crate::notifications::events::Announcement;
use crate::notifications::model::Notification;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ApiError {
    /// Whether trying the same call again may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Rejected { status, .. } => *status >= 500 || *status == 429,
            Self::Malformed(_) => false,
        }
    }
}

/// Server operations the notification store depends on.
pub trait NotificationApi {
    fn list(&self) -> impl Future<Output = Result<Vec<Notification>, ApiError>> + Send;
    fn unread_count(&self) -> impl Future<Output = Result<u64, ApiError>> + Send;
    fn create(
        &self,
        announcement: &Announcement,
    ) -> impl Future<Output = Result<Notification, ApiError>> + Send;
    fn mark_read(&self, id: &str) -> impl Future<Output = Result<(), ApiError>> + Send;
    fn mark_all_read(&self) -> impl Future<Output = Result<u64, ApiError>> + Send;
    fn delete(&self, id: &str) -> impl Future<Output = Result<(), ApiError>> + Send;
}

/// [`NotificationApi`] over HTTP with a bearer token.
#[derive(Clone)]
pub struct RestNotificationApi {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl RestNotificationApi {
    /// `base_url` is the server root, e.g. `http://127.0.0.1:4000`.
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/notifications{}", self.base_url, path)
    }

    async fn read<T: DeserializeOwned>(resp: reqwest::Response) -> Result<ApiResponse<T>, ApiError> {
        let status = resp.status();
        let body = resp.text().await?;
        let parsed: Result<ApiResponse<T>, _> = serde_json::from_str(&body);
        match parsed {
            Ok(envelope) if envelope.success && status.is_success() => Ok(envelope),
            Ok(envelope) => Err(ApiError::Rejected {
                status: status.as_u16(),
                message: envelope
                    .message
                    .unwrap_or_else(|| "request was not successful".to_string()),
            }),
            Err(_) if !status.is_success() => Err(ApiError::Rejected {
                status: status.as_u16(),
                message: status
                    .canonical_reason()
                    .unwrap_or("unexpected status")
                    .to_string(),
            }),
            Err(e) => Err(ApiError::Malformed(e.to_string())),
        }
    }
}

fn require<T>(value: Option<T>, field: &str) -> Result<T, ApiError> {
    value.ok_or_else(|| ApiError::Malformed(format!("response is missing `{}`", field)))
}

impl NotificationApi for RestNotificationApi {
    async fn list(&self) -> Result<Vec<Notification>, ApiError> {
        let resp = self
            .http
            .get(self.url(""))
            .bearer_auth(&self.token)
            .send()
            .await?;
        require(Self::read::<Vec<Notification>>(resp).await?.data, "data")
    }

    async fn unread_count(&self) -> Result<u64, ApiError> {
        let resp = self
            .http
            .get(self.url("/unreadcount"))
            .bearer_auth(&self.token)
            .send()
            .await?;
        require(Self::read::<()>(resp).await?.count, "count")
    }

    async fn create(&self, announcement: &Announcement) -> Result<Notification, ApiError> {
        let resp = self
            .http
            .post(self.url(""))
            .bearer_auth(&self.token)
            .json(announcement)
            .send()
            .await?;
        require(Self::read::<Notification>(resp).await?.data, "data")
    }

    async fn mark_read(&self, id: &str) -> Result<(), ApiError> {
        let resp = self
            .http
            .post(self.url(&format!("/read/{}", id)))
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::read::<()>(resp).await.map(|_| ())
    }

    async fn mark_all_read(&self) -> Result<u64, ApiError> {
        let resp = self
            .http
            .post(self.url("/markallread"))
            .bearer_auth(&self.token)
            .send()
            .await?;
        Ok(Self::read::<()>(resp).await?.count.unwrap_or(0))
    }

    async fn delete(&self, id: &str) -> Result<(), ApiError> {
        let resp = self
            .http
            .delete(self.url(&format!("/{}", id)))
            .bearer_auth(&self.token)
            .send()
            .await?;
        match Self::read::<()>(resp).await {
            Ok(_) => Ok(()),
            // Already gone for this viewer
            Err(ApiError::Rejected { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let server = ApiError::Rejected {
            status: 503,
            message: "busy".to_string(),
        };
        let client = ApiError::Rejected {
            status: 403,
            message: "no".to_string(),
        };
        assert!(server.is_retryable());
        assert!(!client.is_retryable());
        assert!(!ApiError::Malformed("x".to_string()).is_retryable());
    }
}
