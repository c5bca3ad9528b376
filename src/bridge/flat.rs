use serde_json::{json, Map, Value};

use super::{
    DisplayMode, GuestMessage, GuestRequest, HostMessage, LogLevel, ProtocolVariant,
    WireEncoding,
};
use crate::error::RpcError;

/// `{ type, callId?, ... }` envelopes used by apps-SDK style guests.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct FlatEncoding;

impl WireEncoding for FlatEncoding {
    fn variant(&self) -> ProtocolVariant {
        ProtocolVariant::Flat
    }

    fn encode(&self, message: &HostMessage) -> Value {
        match message {
            HostMessage::InitializeResult { id, context } => {
                with_call_id(json!({ "type": "bridge:context", "context": context }), id)
            }
            HostMessage::ContextChanged(context) => {
                json!({ "type": "globals:update", "context": context })
            }
            HostMessage::ToolInputPartial(input) => {
                json!({ "type": "tool:input-partial", "input": input })
            }
            HostMessage::ToolInput(input) => json!({ "type": "tool:input", "input": input }),
            HostMessage::ToolResult(output) => json!({ "type": "tool:output", "output": output }),
            HostMessage::ToolCancelled { reason } => {
                json!({ "type": "tool:cancelled", "reason": reason })
            }
            HostMessage::Teardown { id, reason } => {
                with_call_id(json!({ "type": "bridge:teardown", "reason": reason }), id)
            }
            HostMessage::Response { id, label, outcome } => {
                let kind = format!("{label}:response");
                let body = match outcome {
                    Ok(result) => json!({ "type": kind, "result": result }),
                    Err(error) => json!({
                        "type": kind,
                        "cancelled": true,
                        "error": error.message,
                    }),
                };
                with_call_id(body, id)
            }
        }
    }

    fn decode(&self, raw: &Value) -> Option<GuestMessage> {
        let object = raw.as_object()?;
        let kind = object.get("type").and_then(Value::as_str)?;
        let id = object.get("callId").cloned().unwrap_or(Value::Null);

        let request = match kind {
            "bridge:hello" => return Some(GuestMessage::Initialize { id }),
            "bridge:ready" => return Some(GuestMessage::Initialized),
            "resize" => {
                return Some(match object.get("height").and_then(Value::as_f64) {
                    Some(height) => GuestMessage::SizeChanged {
                        width: object.get("width").and_then(Value::as_f64),
                        height,
                    },
                    None => GuestMessage::UnknownNotification,
                })
            }
            "log" => {
                return Some(GuestMessage::Log {
                    level: LogLevel::parse(object.get("level").and_then(Value::as_str)),
                    logger: None,
                    data: object
                        .get("message")
                        .or_else(|| object.get("data"))
                        .cloned()
                        .unwrap_or(Value::Null),
                })
            }
            "response" => return Some(decode_response(id, object)),
            "tool:call" => {
                let Some(name) = object.get("name").and_then(Value::as_str) else {
                    return Some(malformed(id, "tool:call requires a tool name"));
                };
                GuestRequest::CallTool {
                    name: name.to_string(),
                    arguments: object
                        .get("args")
                        .or_else(|| object.get("arguments"))
                        .cloned()
                        .unwrap_or_else(|| json!({})),
                }
            }
            "resource:read" => {
                let Some(uri) = object.get("uri").and_then(Value::as_str) else {
                    return Some(malformed(id, "resource:read requires a uri"));
                };
                GuestRequest::ReadResource {
                    uri: uri.to_string(),
                }
            }
            "resource:list" => GuestRequest::ListResources {
                cursor: cursor(object),
            },
            "resource-template:list" => GuestRequest::ListResourceTemplates {
                cursor: cursor(object),
            },
            "prompt:list" => GuestRequest::ListPrompts {
                cursor: cursor(object),
            },
            "display:request" => {
                match serde_json::from_value::<DisplayMode>(
                    object.get("mode").cloned().unwrap_or_default(),
                ) {
                    Ok(mode) => GuestRequest::RequestDisplayMode { mode },
                    Err(_) => {
                        return Some(malformed(id, "mode must be one of: inline, pip, fullscreen"))
                    }
                }
            }
            "model-context:set" => GuestRequest::UpdateModelContext {
                context: object.get("context").cloned().unwrap_or(Value::Null),
            },
            "ping" => GuestRequest::Ping,
            _ if object.contains_key("callId") => {
                return Some(GuestMessage::UnknownRequest { id })
            }
            _ => return Some(GuestMessage::UnknownNotification),
        };
        Some(GuestMessage::Request { id, request })
    }

    fn label(&self, raw: &Value) -> Option<String> {
        raw.get("type").and_then(Value::as_str).map(str::to_string)
    }
}

fn with_call_id(mut body: Value, id: &Value) -> Value {
    if !id.is_null() {
        body["callId"] = id.clone();
    }
    body
}

fn decode_response(id: Value, object: &Map<String, Value>) -> GuestMessage {
    let failed = object.get("cancelled").and_then(Value::as_bool) == Some(true)
        || object.get("error").is_some_and(|error| !error.is_null());
    let outcome = if failed {
        let message = match object.get("error") {
            Some(Value::String(message)) => message.clone(),
            Some(other) if !other.is_null() => other.to_string(),
            _ => "cancelled".to_string(),
        };
        Err(RpcError::server(&message))
    } else {
        Ok(object.get("result").cloned().unwrap_or(Value::Null))
    };
    GuestMessage::Response { id, outcome }
}

fn cursor(object: &Map<String, Value>) -> Option<String> {
    object
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

    #[test]
    fn decodes_flat_envelopes() {
        assert_eq!(
            FlatEncoding.decode(&json!({ "type": "tool:call", "callId": "c1", "name": "refresh", "args": { "q": "x" } })),
            Some(GuestMessage::Request {
                id: json!("c1"),
                request: GuestRequest::CallTool {
                    name: "refresh".to_string(),
                    arguments: json!({ "q": "x" }),
                },
            })
        );
        assert_eq!(
            FlatEncoding.decode(&json!({ "type": "display:request", "callId": 2, "mode": "pip" })),
            Some(GuestMessage::Request {
                id: json!(2),
                request: GuestRequest::RequestDisplayMode {
                    mode: DisplayMode::Pip
                },
            })
        );
        assert_eq!(
            FlatEncoding.decode(&json!({ "type": "bridge:hello" })),
            Some(GuestMessage::Initialize { id: Value::Null })
        );
        assert_eq!(
            FlatEncoding.decode(&json!({ "type": "resize", "height": 120.5 })),
            Some(GuestMessage::SizeChanged {
                width: None,
                height: 120.5
            })
        );
        assert_eq!(
            FlatEncoding.decode(&json!({ "type": "widget:custom", "callId": 4 })),
            Some(GuestMessage::UnknownRequest { id: json!(4) })
        );
        assert_eq!(FlatEncoding.decode(&json!({ "method": "ping" })), None);
    }

    #[test]
    fn guest_responses_map_cancellation_to_errors() {
        assert_eq!(
            FlatEncoding.decode(&json!({ "type": "response", "callId": "t1", "cancelled": true, "error": "busy" })),
            Some(GuestMessage::Response {
                id: json!("t1"),
                outcome: Err(RpcError::server("busy")),
            })
        );
        assert_eq!(
            FlatEncoding.decode(&json!({ "type": "response", "callId": "t1", "result": null })),
            Some(GuestMessage::Response {
                id: json!("t1"),
                outcome: Ok(Value::Null),
            })
        );
    }

    #[test]
    fn responses_are_typed_by_request_kind() {
        let ok = FlatEncoding.encode(&HostMessage::Response {
            id: json!("c1"),
            label: "tool:call".to_string(),
            outcome: Ok(json!({ "content": [] })),
        });
        assert_eq!(
            ok,
            json!({ "type": "tool:call:response", "callId": "c1", "result": { "content": [] } })
        );

        let failed = FlatEncoding.encode(&HostMessage::Response {
            id: json!("c2"),
            label: "resource:read".to_string(),
            outcome: Err(RpcError::server("not found")),
        });
        assert_eq!(
            failed,
            json!({ "type": "resource:read:response", "callId": "c2", "cancelled": true, "error": "not found" })
        );
    }

    #[test]
    fn host_notifications_carry_no_call_id() {
        let output = FlatEncoding.encode(&HostMessage::ToolResult(json!({ "ok": true })));
        assert_eq!(output, json!({ "type": "tool:output", "output": { "ok": true } }));

        let cancelled = FlatEncoding.encode(&HostMessage::ToolCancelled {
            reason: "denied".to_string(),
        });
        assert_eq!(cancelled, json!({ "type": "tool:cancelled", "reason": "denied" }));
    }
}
