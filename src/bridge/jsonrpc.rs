use serde_json::{json, Map, Value};

use super::{
    DisplayMode, GuestMessage, GuestRequest, HostMessage, LogLevel, ProtocolVariant,
    WireEncoding, PROTOCOL_VERSION,
};
use crate::error::RpcError;

/// JSON-RPC 2.0 framing used by MCP app guests.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct JsonRpcEncoding;

impl WireEncoding for JsonRpcEncoding {
    fn variant(&self) -> ProtocolVariant {
        ProtocolVariant::JsonRpc
    }

    fn encode(&self, message: &HostMessage) -> Value {
        match message {
            HostMessage::InitializeResult { id, context } => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "protocolVersion": PROTOCOL_VERSION,
                    "hostInfo": {
                        "name": env!("CARGO_PKG_NAME"),
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                    "hostCapabilities": {
                        "serverTools": {},
                        "serverResources": {},
                        "logging": {},
                    },
                    "hostContext": context,
                }
            }),
            HostMessage::ContextChanged(context) => {
                notification("ui/notifications/host-context-changed", json!(context))
            }
            HostMessage::ToolInputPartial(arguments) => notification(
                "ui/notifications/tool-input-partial",
                json!({ "arguments": arguments }),
            ),
            HostMessage::ToolInput(arguments) => notification(
                "ui/notifications/tool-input",
                json!({ "arguments": arguments }),
            ),
            HostMessage::ToolResult(result) => {
                notification("ui/notifications/tool-result", result.clone())
            }
            HostMessage::ToolCancelled { reason } => notification(
                "ui/notifications/tool-cancelled",
                json!({ "reason": reason }),
            ),
            HostMessage::Teardown { id, reason } => json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": "ui/resource-teardown",
                "params": { "reason": reason },
            }),
            HostMessage::Response { id, outcome, .. } => match outcome {
                Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
                Err(error) => json!({ "jsonrpc": "2.0", "id": id, "error": error }),
            },
        }
    }

    fn decode(&self, raw: &Value) -> Option<GuestMessage> {
        let object = raw.as_object()?;
        if object.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            return None;
        }
        let params = object.get("params").cloned().unwrap_or_else(|| json!({}));

        let Some(method) = object.get("method").and_then(Value::as_str) else {
            let id = object.get("id")?.clone();
            return decode_response(id, object);
        };

        match object.get("id").cloned() {
            Some(id) => Some(decode_request(id, method, params)),
            None => Some(decode_notification(method, &params)),
        }
    }

    fn label(&self, raw: &Value) -> Option<String> {
        if let Some(method) = raw.get("method").and_then(Value::as_str) {
            return Some(method.to_string());
        }
        if raw.get("error").is_some() {
            return Some("error".to_string());
        }
        raw.get("result").map(|_| "result".to_string())
    }
}

fn notification(method: &str, params: Value) -> Value {
    json!({ "jsonrpc": "2.0", "method": method, "params": params })
}

fn decode_request(id: Value, method: &str, params: Value) -> GuestMessage {
    let request = match method {
        "ui/initialize" => return GuestMessage::Initialize { id },
        "tools/call" => {
            let Some(name) = params.get("name").and_then(Value::as_str) else {
                return malformed(id, "tools/call requires a tool name");
            };
            GuestRequest::CallTool {
                name: name.to_string(),
                arguments: params.get("arguments").cloned().unwrap_or_else(|| json!({})),
            }
        }
        "resources/read" => {
            let Some(uri) = params.get("uri").and_then(Value::as_str) else {
                return malformed(id, "resources/read requires a uri");
            };
            GuestRequest::ReadResource {
                uri: uri.to_string(),
            }
        }
        "resources/list" => GuestRequest::ListResources {
            cursor: cursor(&params),
        },
        "resources/templates/list" => GuestRequest::ListResourceTemplates {
            cursor: cursor(&params),
        },
        "prompts/list" => GuestRequest::ListPrompts {
            cursor: cursor(&params),
        },
        "ui/request-display-mode" => {
            match serde_json::from_value::<DisplayMode>(params.get("mode").cloned().unwrap_or_default())
            {
                Ok(mode) => GuestRequest::RequestDisplayMode { mode },
                Err(_) => return malformed(id, "mode must be one of: inline, pip, fullscreen"),
            }
        }
        "ui/update-model-context" => GuestRequest::UpdateModelContext { context: params },
        "ping" => GuestRequest::Ping,
        _ => return GuestMessage::UnknownRequest { id },
    };
    GuestMessage::Request { id, request }
}

fn decode_notification(method: &str, params: &Value) -> GuestMessage {
    match method {
        "ui/notifications/initialized" => GuestMessage::Initialized,
        "ui/notifications/size-changed" => match params.get("height").and_then(Value::as_f64) {
            Some(height) => GuestMessage::SizeChanged {
                width: params.get("width").and_then(Value::as_f64),
                height,
            },
            None => GuestMessage::UnknownNotification,
        },
        "notifications/message" => GuestMessage::Log {
            level: LogLevel::parse(params.get("level").and_then(Value::as_str)),
            logger: params
                .get("logger")
                .and_then(Value::as_str)
                .map(str::to_string),
            data: params.get("data").cloned().unwrap_or(Value::Null),
        },
        _ => GuestMessage::UnknownNotification,
    }
}

fn decode_response(id: Value, object: &Map<String, Value>) -> Option<GuestMessage> {
    if let Some(error) = object.get("error") {
        let error = serde_json::from_value::<RpcError>(error.clone())
            .unwrap_or_else(|_| RpcError::server("guest returned an unreadable error"));
        return Some(GuestMessage::Response {
            id,
            outcome: Err(error),
        });
    }
    let result = object.get("result")?.clone();
    Some(GuestMessage::Response {
        id,
        outcome: Ok(result),
    })
}

fn cursor(params: &Value) -> Option<String> {
    params
        .get("cursor")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn malformed(id: Value, reason: &str) -> GuestMessage {
    GuestMessage::Malformed {
        id,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::HostContext;

    fn decode(raw: Value) -> Option<GuestMessage> {
        JsonRpcEncoding.decode(&raw)
    }

    #[test]
    fn decodes_guest_requests() {
        assert_eq!(
            decode(json!({
                "jsonrpc": "2.0",
                "id": 3,
                "method": "tools/call",
                "params": { "name": "refresh", "arguments": { "page": 2 } }
            })),
            Some(GuestMessage::Request {
                id: json!(3),
                request: GuestRequest::CallTool {
                    name: "refresh".to_string(),
                    arguments: json!({ "page": 2 }),
                },
            })
        );
        assert_eq!(
            decode(json!({ "jsonrpc": "2.0", "id": "a", "method": "resources/templates/list", "params": { "cursor": "c1" } })),
            Some(GuestMessage::Request {
                id: json!("a"),
                request: GuestRequest::ListResourceTemplates {
                    cursor: Some("c1".to_string())
                },
            })
        );
        assert_eq!(
            decode(json!({ "jsonrpc": "2.0", "id": 1, "method": "ui/initialize", "params": {} })),
            Some(GuestMessage::Initialize { id: json!(1) })
        );
    }

    #[test]
    fn rejects_bad_params_and_unknown_methods() {
        assert_eq!(
            decode(json!({ "jsonrpc": "2.0", "id": 4, "method": "ui/request-display-mode", "params": { "mode": "maximized" } })),
            Some(GuestMessage::Malformed {
                id: json!(4),
                reason: "mode must be one of: inline, pip, fullscreen".to_string(),
            })
        );
        assert_eq!(
            decode(json!({ "jsonrpc": "2.0", "id": 5, "method": "sampling/createMessage" })),
            Some(GuestMessage::UnknownRequest { id: json!(5) })
        );
        assert_eq!(
            decode(json!({ "jsonrpc": "2.0", "method": "ui/notifications/whatever" })),
            Some(GuestMessage::UnknownNotification)
        );
        assert_eq!(decode(json!({ "method": "ui/initialize", "id": 1 })), None);
    }

    #[test]
    fn decodes_notifications_and_responses() {
        assert_eq!(
            decode(json!({ "jsonrpc": "2.0", "method": "ui/notifications/size-changed", "params": { "height": 240 } })),
            Some(GuestMessage::SizeChanged {
                width: None,
                height: 240.0
            })
        );
        assert_eq!(
            decode(json!({ "jsonrpc": "2.0", "method": "notifications/message", "params": { "level": "warning", "data": "slow" } })),
            Some(GuestMessage::Log {
                level: LogLevel::Warning,
                logger: None,
                data: json!("slow"),
            })
        );
        assert_eq!(
            decode(json!({ "jsonrpc": "2.0", "id": 9, "result": {} })),
            Some(GuestMessage::Response {
                id: json!(9),
                outcome: Ok(json!({})),
            })
        );
    }

    #[test]
    fn encodes_host_traffic() {
        let init = JsonRpcEncoding.encode(&HostMessage::InitializeResult {
            id: json!(1),
            context: HostContext::default(),
        });
        assert_eq!(init["id"], 1);
        assert_eq!(init["result"]["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(init["result"]["hostContext"]["displayMode"], "inline");

        let partial = JsonRpcEncoding.encode(&HostMessage::ToolInputPartial(json!({ "a": 1 })));
        assert_eq!(partial["method"], "ui/notifications/tool-input-partial");
        assert_eq!(partial["params"]["arguments"], json!({ "a": 1 }));
        assert!(partial.get("id").is_none());

        let failure = JsonRpcEncoding.encode(&HostMessage::Response {
            id: json!(7),
            label: "tools/call".to_string(),
            outcome: Err(RpcError::server("boom")),
        });
        assert_eq!(failure["error"]["message"], "boom");
        assert!(failure.get("result").is_none());

        let teardown = JsonRpcEncoding.encode(&HostMessage::Teardown {
            id: json!("teardown-1"),
            reason: "unmount".to_string(),
        });
        assert_eq!(teardown["method"], "ui/resource-teardown");
        assert_eq!(teardown["id"], "teardown-1");
    }
}
