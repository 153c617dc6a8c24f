//! REST-backed collaborator implementations. The gateway owns no
//! durable state of its own; history, group membership and push
//! notifications all live behind the backend service.

use std::time::Duration;

use async_trait::async_trait;
use palaver_core::collaborators::{GroupDirectory, MessageStore, OfflineNotifier};
use palaver_core::error::CollaboratorError;
use palaver_models::Envelope;
use reqwest::StatusCode;
use serde::Deserialize;

use crate::config::BackendConfig;

pub struct RestBackend {
    http: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
}

#[derive(Deserialize)]
struct AppendResponse {
    id: i64,
}

#[derive(Deserialize)]
struct MembersResponse {
    members: Vec<i64>,
}

impl RestBackend {
    pub fn new(config: &BackendConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
        })
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

fn unavailable(err: reqwest::Error) -> CollaboratorError {
    CollaboratorError::Unavailable(err.to_string())
}

#[async_trait]
impl MessageStore for RestBackend {
    async fn append(&self, envelope: &Envelope) -> Result<i64, CollaboratorError> {
        let url = format!("{}/internal/messages", self.base_url);
        let response = self
            .request(self.http.post(&url).json(envelope))
            .send()
            .await
            .map_err(unavailable)?;
        if !response.status().is_success() {
            return Err(CollaboratorError::Internal(format!(
                "message append returned {}",
                response.status()
            )));
        }
        let body: AppendResponse = response.json().await.map_err(unavailable)?;
        Ok(body.id)
    }
}

#[async_trait]
impl GroupDirectory for RestBackend {
    async fn members_of(&self, group_id: i64) -> Result<Vec<i64>, CollaboratorError> {
        let url = format!("{}/internal/groups/{}/members", self.base_url, group_id);
        let response = self
            .request(self.http.get(&url))
            .send()
            .await
            .map_err(unavailable)?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(CollaboratorError::NotFound),
            status if status.is_success() => {
                let body: MembersResponse = response.json().await.map_err(unavailable)?;
                Ok(body.members)
            }
            status => Err(CollaboratorError::Internal(format!(
                "membership lookup returned {status}"
            ))),
        }
    }
}

#[async_trait]
impl OfflineNotifier for RestBackend {
    async fn notify(&self, envelope: &Envelope, offline_user_ids: &[i64]) {
        let url = format!("{}/internal/notifications/offline", self.base_url);
        let body = serde_json::json!({
            "envelope": envelope,
            "offline_user_ids": offline_user_ids,
        });
        // Notification failures never fail the routing call.
        match self.request(self.http.post(&url).json(&body)).send().await {
            Ok(response) if !response.status().is_success() => {
                tracing::warn!(status = %response.status(), "offline notification rejected");
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(error = %err, "offline notification failed");
            }
        }
    }
}
