//! REST client for the work item service
//!
//! | Operation       | Request                      | Response          |
//! |-----------------|------------------------------|-------------------|
//! | `get`           | `GET /items/{id}`            | work item JSON    |
//! | `update`        | `PUT /items/{id}`            | any 2xx           |
//! | `attach_output` | `POST /items/{id}/outputs`   | `{"ref": "..."}`  |
//! | `create_item`   | `POST /items`                | `{"id": "..."}`   |
//! | `list_items`    | `GET /items`                 | `[{"id": ...}]`   |

use super::{ItemDraft, ServiceError, WorkItem, WorkItemId, WorkItemService};
use crate::config::{resolve_optional_env_var, ConfigError, WorkItemsSection};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub struct HttpWorkItemService {
    base_url: String,
    token: Option<String>,
    client: Client,
}

impl HttpWorkItemService {
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::InvalidConfig(format!("HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            client,
        })
    }

    /// Build from `[work_items]`, reading the token from the environment
    pub fn from_section(section: &WorkItemsSection) -> Result<Self, ConfigError> {
        Self::new(
            section.base_url.clone(),
            resolve_optional_env_var(section.token_env.as_ref())?,
            Duration::from_secs(section.timeout_secs),
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder, item: Option<&WorkItemId>) -> Result<Response, ServiceError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| ServiceError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        match (status, item) {
            (StatusCode::NOT_FOUND, Some(id)) => Err(ServiceError::NotFound(id.clone())),
            _ => Err(ServiceError::Http {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            }),
        }
    }

    async fn json<T: DeserializeOwned>(response: Response) -> Result<T, ServiceError> {
        response
            .json()
            .await
            .map_err(|e| ServiceError::InvalidResponse(e.to_string()))
    }
}

#[derive(Serialize)]
struct UpdateRequest<'a> {
    body: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<&'a str>,
}

#[derive(Serialize)]
struct OutputRequest<'a> {
    agent: &'a str,
    text: &'a str,
}

#[derive(Deserialize)]
struct OutputResponse {
    #[serde(rename = "ref")]
    reference: String,
}

#[derive(Deserialize)]
struct IdResponse {
    id: WorkItemId,
}

#[async_trait]
impl WorkItemService for HttpWorkItemService {
    async fn get(&self, id: &WorkItemId) -> Result<WorkItem, ServiceError> {
        let request = self.client.get(self.url(&format!("/items/{id}")));
        let response = self.send(request, Some(id)).await?;
        Self::json(response).await
    }

    async fn update(
        &self,
        id: &WorkItemId,
        body: &str,
        status: Option<&str>,
    ) -> Result<(), ServiceError> {
        let request = self
            .client
            .put(self.url(&format!("/items/{id}")))
            .json(&UpdateRequest { body, status });
        self.send(request, Some(id)).await?;
        Ok(())
    }

    async fn attach_output(
        &self,
        id: &WorkItemId,
        agent: &str,
        text: &str,
    ) -> Result<String, ServiceError> {
        let request = self
            .client
            .post(self.url(&format!("/items/{id}/outputs")))
            .json(&OutputRequest { agent, text });
        let response = self.send(request, Some(id)).await?;
        let output: OutputResponse = Self::json(response).await?;
        Ok(output.reference)
    }

    async fn create_item(&self, draft: &ItemDraft) -> Result<WorkItemId, ServiceError> {
        let request = self.client.post(self.url("/items")).json(draft);
        let response = self.send(request, None).await?;
        let created: IdResponse = Self::json(response).await?;
        Ok(created.id)
    }

    async fn list_items(&self) -> Result<Vec<WorkItemId>, ServiceError> {
        let request = self.client.get(self.url("/items"));
        let response = self.send(request, None).await?;
        let items: Vec<IdResponse> = Self::json(response).await?;
        Ok(items.into_iter().map(|item| item.id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let service =
            HttpWorkItemService::new("http://tracker.local/api/", None, Duration::from_secs(5)).unwrap();
        assert_eq!(service.url("/items"), "http://tracker.local/api/items");
    }

    #[test]
    fn test_update_request_omits_missing_status() {
        let value = serde_json::to_value(UpdateRequest {
            body: "text",
            status: None,
        })
        .unwrap();
        assert_eq!(value, serde_json::json!({"body": "text"}));
    }
}
