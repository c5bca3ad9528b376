//! Backing store for the widget store/content endpoints.
//!
//! The host stores tool input/output under the tool-call id, then asks for
//! prepared content: the widget markup read from the server plus the policy
//! metadata the sandbox needs.

use std::{collections::HashMap, sync::Arc};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::{
    bridge::{DeviceType, ProtocolVariant, Theme},
    error::{BackendError, WidgetError},
    sandbox::{CspMode, WidgetCsp, WidgetPermissions},
    services::backend::WidgetBackend,
};

pub(crate) const MCP_APP_MIME_TYPE: &str = "text/html;profile=mcp-app";
pub(crate) const SKYBRIDGE_MIME_TYPE: &str = "text/html+skybridge";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StoreWidgetRequest {
    pub(crate) server_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) resource_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) output_template: Option<String>,
    #[serde(default)]
    pub(crate) tool_input: Value,
    #[serde(default)]
    pub(crate) tool_output: Value,
    pub(crate) tool_id: String,
    pub(crate) tool_name: String,
    #[serde(default)]
    pub(crate) theme: Theme,
    #[serde(default)]
    pub(crate) csp_mode: CspMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) locale: Option<String>,
    #[serde(default)]
    pub(crate) device_type: DeviceType,
    #[serde(default)]
    pub(crate) protocol: ProtocolVariant,
}

impl StoreWidgetRequest {
    pub(crate) fn template_uri(&self) -> Option<&str> {
        self.resource_uri
            .as_deref()
            .or(self.output_template.as_deref())
            .map(str::trim)
            .filter(|uri| !uri.is_empty())
    }
}

/// Prepared markup plus everything the sandbox needs to confine it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WidgetContent {
    pub(crate) html: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) csp: Option<WidgetCsp>,
    pub(crate) permissions: WidgetPermissions,
    pub(crate) permissive: bool,
    pub(crate) mime_type_valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) mime_type_warning: Option<String>,
    pub(crate) prefers_border: bool,
}

struct StoredWidget {
    request: StoreWidgetRequest,
    stored_at: DateTime<Utc>,
}

pub(crate) struct WidgetStore {
    backend: Arc<dyn WidgetBackend>,
    entries: RwLock<HashMap<String, StoredWidget>>,
}

impl WidgetStore {
    pub(crate) fn new(backend: Arc<dyn WidgetBackend>) -> Self {
        Self {
            backend,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) async fn store(&self, request: StoreWidgetRequest) -> Result<(), WidgetError> {
        if request.tool_id.trim().is_empty() {
            return Err(WidgetError::InvalidRequest("toolId must not be empty".to_string()));
        }
        if request.server_id.trim().is_empty() {
            return Err(WidgetError::InvalidRequest("serverId must not be empty".to_string()));
        }
        if request.template_uri().is_none() {
            return Err(WidgetError::InvalidRequest(
                "resourceUri or outputTemplate is required".to_string(),
            ));
        }

        debug!(tool_id = %request.tool_id, protocol = ?request.protocol, "widget stored");
        self.entries.write().await.insert(
            request.tool_id.clone(),
            StoredWidget {
                request,
                stored_at: Utc::now(),
            },
        );
        Ok(())
    }

    /// Records tool output that arrived after the widget was stored.
    pub(crate) async fn update_output(&self, tool_id: &str, output: Value) {
        if let Some(entry) = self.entries.write().await.get_mut(tool_id) {
            entry.request.tool_output = output;
            entry.stored_at = Utc::now();
        }
    }

    pub(crate) async fn get(&self, tool_id: &str) -> Option<StoreWidgetRequest> {
        self.entries
            .read()
            .await
            .get(tool_id)
            .map(|entry| entry.request.clone())
    }

    pub(crate) async fn remove(&self, tool_id: &str) {
        self.entries.write().await.remove(tool_id);
    }

    /// Reads the widget resource and prepares it for the sandbox. `csp_mode`
    /// overrides the stored mode.
    pub(crate) async fn content(
        &self,
        tool_id: &str,
        csp_mode: Option<CspMode>,
    ) -> Result<WidgetContent, WidgetError> {
        let request = self
            .get(tool_id)
            .await
            .ok_or_else(|| WidgetError::NotFound(tool_id.to_string()))?;
        let uri = request
            .template_uri()
            .ok_or_else(|| WidgetError::InvalidRequest("widget has no template".to_string()))?;

        let resource = self.backend.read_resource(&request.server_id, uri).await?;
        let entry = resource
            .get("contents")
            .and_then(Value::as_array)
            .and_then(|contents| contents.first())
            .ok_or_else(|| BackendError::InvalidResponse(format!("{uri} has no contents")))?;

        let html = markup(entry)?;
        let mime_type = entry.get("mimeType").and_then(Value::as_str);
        let mime_type_warning = mime_type_warning(request.protocol, mime_type);
        if let Some(warning) = &mime_type_warning {
            warn!(tool_id, "{warning}");
        }

        let meta = entry
            .get("_meta")
            .or_else(|| resource.get("_meta"))
            .and_then(Value::as_object);
        let declared = meta.map(|meta| declared_policy(request.protocol, meta));
        let permissive = csp_mode.unwrap_or(request.csp_mode).is_permissive();
        let (csp, permissions, prefers_border) = match declared {
            Some(Declared {
                csp,
                permissions,
                prefers_border,
            }) => (csp, permissions, prefers_border),
            None => (None, WidgetPermissions::default(), false),
        };

        Ok(WidgetContent {
            html,
            csp: if permissive {
                None
            } else {
                Some(csp.unwrap_or_default())
            },
            permissions,
            permissive,
            mime_type_valid: mime_type_warning.is_none(),
            mime_type_warning,
            prefers_border,
        })
    }
}

fn markup(entry: &Value) -> Result<String, BackendError> {
    if let Some(text) = entry.get("text").and_then(Value::as_str) {
        return Ok(text.to_string());
    }
    let blob = entry
        .get("blob")
        .and_then(Value::as_str)
        .ok_or_else(|| BackendError::InvalidResponse("resource has neither text nor blob".to_string()))?;
    let bytes = STANDARD
        .decode(blob.trim())
        .map_err(|error| BackendError::InvalidResponse(format!("invalid blob encoding: {error}")))?;
    String::from_utf8(bytes)
        .map_err(|error| BackendError::InvalidResponse(format!("blob is not utf-8: {error}")))
}

fn expected_mime_type(protocol: ProtocolVariant) -> &'static str {
    match protocol {
        ProtocolVariant::JsonRpc => MCP_APP_MIME_TYPE,
        ProtocolVariant::Flat => SKYBRIDGE_MIME_TYPE,
    }
}

fn mime_type_warning(protocol: ProtocolVariant, actual: Option<&str>) -> Option<String> {
    let expected = expected_mime_type(protocol);
    let normalized = actual.map(|mime| {
        mime.split(';')
            .map(str::trim)
            .collect::<Vec<_>>()
            .join(";")
            .to_ascii_lowercase()
    });
    match normalized {
        Some(mime) if mime == expected => None,
        Some(_) => Some(format!(
            "widget resource has mime type {}; expected {expected}",
            actual.unwrap_or_default()
        )),
        None => Some(format!("widget resource has no mime type; expected {expected}")),
    }
}

struct Declared {
    csp: Option<WidgetCsp>,
    permissions: WidgetPermissions,
    prefers_border: bool,
}

fn declared_policy(protocol: ProtocolVariant, meta: &Map<String, Value>) -> Declared {
    match protocol {
        ProtocolVariant::JsonRpc => {
            let ui = meta.get("ui");
            Declared {
                csp: ui
                    .and_then(|ui| ui.get("csp"))
                    .and_then(|csp| serde_json::from_value(csp.clone()).ok()),
                permissions: ui
                    .and_then(|ui| ui.get("permissions"))
                    .and_then(Value::as_object)
                    .map(|permissions| WidgetPermissions::from(permissions.clone()))
                    .unwrap_or_default(),
                prefers_border: ui
                    .and_then(|ui| ui.get("prefersBorder"))
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            }
        }
        ProtocolVariant::Flat => Declared {
            csp: meta.get("openai/widgetCSP").map(|csp| WidgetCsp {
                connect_domains: string_list(csp.get("connect_domains")),
                resource_domains: string_list(csp.get("resource_domains")),
                frame_domains: string_list(csp.get("frame_domains")),
                base_uri_domains: Vec::new(),
            }),
            permissions: WidgetPermissions::default(),
            prefers_border: meta
                .get("openai/widgetPrefersBorder")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        },
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{sandbox::csp::Permission, services::backend::fake::FakeBackend};
    use serde_json::json;

    fn request(protocol: ProtocolVariant, uri: &str) -> StoreWidgetRequest {
        StoreWidgetRequest {
            server_id: "weather".to_string(),
            resource_uri: Some(uri.to_string()),
            output_template: None,
            tool_input: json!({ "city": "Oslo" }),
            tool_output: Value::Null,
            tool_id: "call-1".to_string(),
            tool_name: "show_weather".to_string(),
            theme: Theme::Light,
            csp_mode: CspMode::WidgetDeclared,
            locale: None,
            device_type: DeviceType::Desktop,
            protocol,
        }
    }

    fn store_with(resources: Vec<(&str, Value)>) -> WidgetStore {
        let mut backend = FakeBackend::default();
        for (uri, resource) in resources {
            backend.resources.insert(uri.to_string(), resource);
        }
        WidgetStore::new(Arc::new(backend))
    }

    #[tokio::test]
    async fn prepares_declared_policy_from_ui_meta() {
        let store = store_with(vec![(
            "ui://weather/card",
            json!({
                "contents": [{
                    "uri": "ui://weather/card",
                    "mimeType": "text/html;profile=mcp-app",
                    "text": "<p>card</p>",
                    "_meta": { "ui": {
                        "csp": { "connectDomains": ["https://api.example.com"] },
                        "permissions": { "geolocation": {} },
                        "prefersBorder": true
                    } }
                }]
            }),
        )]);
        store
            .store(request(ProtocolVariant::JsonRpc, "ui://weather/card"))
            .await
            .expect("stored");

        let content = store.content("call-1", None).await.expect("content");
        assert_eq!(content.html, "<p>card</p>");
        assert!(content.mime_type_valid);
        assert!(content.prefers_border);
        assert!(content.permissions.contains(Permission::Geolocation));
        assert_eq!(
            content.csp.expect("declared csp").connect_domains,
            vec!["https://api.example.com".to_string()]
        );
    }

    #[tokio::test]
    async fn permissive_mode_never_carries_csp() {
        let store = store_with(vec![(
            "ui://weather/card",
            json!({ "contents": [{
                "mimeType": "text/html;profile=mcp-app",
                "text": "<p></p>",
                "_meta": { "ui": { "csp": { "connectDomains": ["https://api.example.com"] } } }
            }] }),
        )]);
        store
            .store(request(ProtocolVariant::JsonRpc, "ui://weather/card"))
            .await
            .expect("stored");

        let content = store
            .content("call-1", Some(CspMode::Permissive))
            .await
            .expect("content");
        assert!(content.permissive);
        assert!(content.csp.is_none());
        let value = serde_json::to_value(&content).expect("serialize");
        assert!(value.get("csp").is_none());
    }

    #[tokio::test]
    async fn declared_mode_without_meta_gets_empty_policy() {
        let store = store_with(vec![(
            "ui://weather/card",
            json!({ "contents": [{ "mimeType": "text/html", "text": "<p></p>" }] }),
        )]);
        store
            .store(request(ProtocolVariant::JsonRpc, "ui://weather/card"))
            .await
            .expect("stored");

        let content = store.content("call-1", None).await.expect("content");
        assert_eq!(content.csp, Some(WidgetCsp::default()));
        assert!(!content.mime_type_valid);
        assert_eq!(
            content.mime_type_warning.as_deref(),
            Some("widget resource has mime type text/html; expected text/html;profile=mcp-app")
        );
    }

    #[tokio::test]
    async fn flat_widgets_use_skybridge_meta_and_blobs() {
        let store = store_with(vec![(
            "ui://widget/board.html",
            json!({ "contents": [{
                "mimeType": "text/html+skybridge",
                "blob": STANDARD.encode("<div>board</div>"),
                "_meta": {
                    "openai/widgetCSP": {
                        "connect_domains": ["https://board.example.com"],
                        "resource_domains": ["https://cdn.example.com"]
                    },
                    "openai/widgetPrefersBorder": true
                }
            }] }),
        )]);
        let mut flat = request(ProtocolVariant::Flat, "");
        flat.resource_uri = None;
        flat.output_template = Some("ui://widget/board.html".to_string());
        store.store(flat).await.expect("stored");

        let content = store.content("call-1", None).await.expect("content");
        assert_eq!(content.html, "<div>board</div>");
        assert!(content.mime_type_valid);
        assert!(content.prefers_border);
        let csp = content.csp.expect("csp");
        assert_eq!(csp.resource_domains, vec!["https://cdn.example.com".to_string()]);
        assert!(csp.base_uri_domains.is_empty());
    }

    #[tokio::test]
    async fn rejects_requests_without_template_and_unknown_ids() {
        let store = store_with(Vec::new());
        let mut missing = request(ProtocolVariant::JsonRpc, " ");
        missing.output_template = None;
        assert!(matches!(
            store.store(missing).await,
            Err(WidgetError::InvalidRequest(_))
        ));
        assert!(matches!(
            store.content("nope", None).await,
            Err(WidgetError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn output_updates_are_kept() {
        let store = store_with(Vec::new());
        store
            .store(request(ProtocolVariant::JsonRpc, "ui://weather/card"))
            .await
            .expect("stored");
        store.update_output("call-1", json!({ "temp": 21 })).await;
        assert_eq!(
            store.get("call-1").await.expect("entry").tool_output,
            json!({ "temp": 21 })
        );
        store.remove("call-1").await;
        assert!(store.get("call-1").await.is_none());
    }
}
