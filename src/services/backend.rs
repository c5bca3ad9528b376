use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::BackendError;

/// Server-scoped operations a widget may reach through the host.
#[async_trait]
pub(crate) trait WidgetBackend: Send + Sync {
    async fn call_tool(
        &self,
        server_id: &str,
        tool_name: &str,
        arguments: Value,
    ) -> Result<Value, BackendError>;

    async fn read_resource(&self, server_id: &str, uri: &str) -> Result<Value, BackendError>;

    async fn list_resources(
        &self,
        server_id: &str,
        cursor: Option<&str>,
    ) -> Result<Value, BackendError>;

    async fn list_resource_templates(
        &self,
        server_id: &str,
        cursor: Option<&str>,
    ) -> Result<Value, BackendError>;

    async fn list_prompts(&self, server_id: &str, cursor: Option<&str>)
        -> Result<Value, BackendError>;
}

/// Talks to the inspector backend over HTTP.
pub(crate) struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ListRequest<'a> {
    server_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    cursor: Option<&'a str>,
}

impl HttpBackend {
    pub(crate) fn new(base_url: &str, auth_token: Option<String>) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token,
        })
    }

    async fn post(&self, path: &str, body: &impl Serialize) -> Result<Value, BackendError> {
        let url = format!("{}{path}", self.base_url);
        debug!(%url, "backend request");

        let mut request = self.client.post(&url).json(body);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                message: error_message(&message),
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|error| BackendError::InvalidResponse(error.to_string()))
    }
}

#[async_trait]
impl WidgetBackend for HttpBackend {
    async fn call_tool(
        &self,
        server_id: &str,
        tool_name: &str,
        arguments: Value,
    ) -> Result<Value, BackendError> {
        let body = json!({
            "serverId": server_id,
            "toolName": tool_name,
            "parameters": arguments,
        });
        let response = self.post("/api/mcp/tools/execute", &body).await?;
        Ok(response.get("result").cloned().unwrap_or(response))
    }

    async fn read_resource(&self, server_id: &str, uri: &str) -> Result<Value, BackendError> {
        let body = json!({ "serverId": server_id, "uri": uri });
        let response = self.post("/api/mcp/resources/read", &body).await?;
        Ok(response.get("content").cloned().unwrap_or(response))
    }

    async fn list_resources(
        &self,
        server_id: &str,
        cursor: Option<&str>,
    ) -> Result<Value, BackendError> {
        self.post(
            "/api/mcp/resources/list",
            &ListRequest { server_id, cursor },
        )
        .await
    }

    async fn list_resource_templates(
        &self,
        server_id: &str,
        cursor: Option<&str>,
    ) -> Result<Value, BackendError> {
        self.post(
            "/api/mcp/resources/templates/list",
            &ListRequest { server_id, cursor },
        )
        .await
    }

    async fn list_prompts(
        &self,
        server_id: &str,
        cursor: Option<&str>,
    ) -> Result<Value, BackendError> {
        self.post("/api/mcp/prompts/list", &ListRequest { server_id, cursor })
            .await
    }
}

/// Prefers the `error` field of a JSON error body.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| {
            value
                .get("error")
                .or_else(|| value.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string())
}
