//! Host/guest bridge: the contract both wire encodings implement.
//!
//! Guest traffic is decoded into [`GuestMessage`] and host traffic is built as
//! [`HostMessage`]; only the [`WireEncoding`] implementations know what either
//! looks like on the wire.

pub(crate) mod client;
pub(crate) mod display;
pub(crate) mod flat;
pub(crate) mod jsonrpc;
pub(crate) mod signature;
pub(crate) mod streaming;

use std::{collections::HashMap, fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{error::RpcError, services::location::UserLocation};

pub(crate) use client::{BridgeClient, BridgeEvent, HostServices, WidgetScope};
pub(crate) use display::{DisplayChange, DisplayModeArbiter};
pub(crate) use streaming::{InputStreamController, RevealGate, ThrottleDecision};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum ProtocolVariant {
    #[default]
    JsonRpc,
    Flat,
}

impl ProtocolVariant {
    pub(crate) fn encoding(self) -> Arc<dyn WireEncoding> {
        match self {
            Self::JsonRpc => Arc::new(jsonrpc::JsonRpcEncoding),
            Self::Flat => Arc::new(flat::FlatEncoding),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum LifecycleState {
    InputStreaming,
    InputAvailable,
    OutputAvailable,
    OutputError,
    OutputDenied,
}

impl LifecycleState {
    pub(crate) fn has_full_input(self) -> bool {
        matches!(self, Self::InputAvailable | Self::OutputAvailable)
    }

    pub(crate) fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::OutputAvailable | Self::OutputError | Self::OutputDenied
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum BridgeState {
    Connecting,
    Ready,
    TornDown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum DisplayMode {
    #[default]
    Inline,
    Pip,
    Fullscreen,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Theme {
    #[default]
    Light,
    Dark,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum DeviceType {
    #[default]
    Desktop,
    Tablet,
    Mobile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct DeviceCapabilities {
    pub(crate) touch: bool,
    pub(crate) hover: bool,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            touch: false,
            hover: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct SafeAreaInsets {
    pub(crate) top: f64,
    pub(crate) right: f64,
    pub(crate) bottom: f64,
    pub(crate) left: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ToolInfo {
    pub(crate) tool_call_id: String,
    pub(crate) tool_name: String,
}

/// Everything the guest is told about its surroundings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HostContext {
    pub(crate) theme: Theme,
    pub(crate) display_mode: DisplayMode,
    pub(crate) available_display_modes: Vec<DisplayMode>,
    pub(crate) locale: String,
    pub(crate) time_zone: String,
    pub(crate) device_type: DeviceType,
    pub(crate) device_capabilities: DeviceCapabilities,
    pub(crate) safe_area_insets: SafeAreaInsets,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) max_height: Option<u32>,
    pub(crate) tool_info: ToolInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) user_location: Option<UserLocation>,
}

impl HostContext {
    /// Small touch-first form factors never get floating overlays.
    pub(crate) fn is_touch_first(&self) -> bool {
        self.device_type == DeviceType::Mobile
            || (self.device_capabilities.touch && !self.device_capabilities.hover)
    }

    pub(crate) fn supported_display_modes(&self) -> Vec<DisplayMode> {
        if self.is_touch_first() {
            vec![DisplayMode::Inline, DisplayMode::Fullscreen]
        } else {
            vec![DisplayMode::Inline, DisplayMode::Pip, DisplayMode::Fullscreen]
        }
    }

    /// Applies `patch` and returns whether anything changed.
    pub(crate) fn apply(&mut self, patch: HostContextPatch) -> bool {
        let before = self.clone();
        if let Some(theme) = patch.theme {
            self.theme = theme;
        }
        if let Some(locale) = patch.locale {
            self.locale = locale;
        }
        if let Some(time_zone) = patch.time_zone {
            self.time_zone = time_zone;
        }
        if let Some(device_type) = patch.device_type {
            self.device_type = device_type;
        }
        if let Some(capabilities) = patch.device_capabilities {
            self.device_capabilities = capabilities;
        }
        if let Some(insets) = patch.safe_area_insets {
            self.safe_area_insets = insets;
        }
        if let Some(max_height) = patch.max_height {
            self.max_height = Some(max_height);
        }
        self.available_display_modes = self.supported_display_modes();
        *self != before
    }
}

/// Host-side changes to a widget's context. Display mode is owned by the
/// arbiter and cannot be patched directly.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HostContextPatch {
    pub(crate) theme: Option<Theme>,
    pub(crate) locale: Option<String>,
    pub(crate) time_zone: Option<String>,
    pub(crate) device_type: Option<DeviceType>,
    pub(crate) device_capabilities: Option<DeviceCapabilities>,
    pub(crate) safe_area_insets: Option<SafeAreaInsets>,
    pub(crate) max_height: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum LogLevel {
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Critical,
    Alert,
    Emergency,
}

impl LogLevel {
    pub(crate) fn parse(raw: Option<&str>) -> Self {
        raw.and_then(|level| {
            serde_json::from_value::<LogLevel>(Value::String(level.to_ascii_lowercase())).ok()
        })
        .or_else(|| match raw {
            Some(level) if level.eq_ignore_ascii_case("warn") => Some(Self::Warning),
            Some(level) if level.eq_ignore_ascii_case("log") => Some(Self::Info),
            _ => None,
        })
        .unwrap_or(Self::Info)
    }
}

/// Requests a guest can make of the host.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum GuestRequest {
    CallTool { name: String, arguments: Value },
    ReadResource { uri: String },
    ListResources { cursor: Option<String> },
    ListResourceTemplates { cursor: Option<String> },
    ListPrompts { cursor: Option<String> },
    RequestDisplayMode { mode: DisplayMode },
    UpdateModelContext { context: Value },
    Ping,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum GuestMessage {
    Initialize { id: Value },
    Initialized,
    Request { id: Value, request: GuestRequest },
    SizeChanged { width: Option<f64>, height: f64 },
    Log {
        level: LogLevel,
        logger: Option<String>,
        data: Value,
    },
    /// Reply to a host-initiated request.
    Response {
        id: Value,
        outcome: Result<Value, RpcError>,
    },
    /// A request whose parameters could not be understood.
    Malformed { id: Value, reason: String },
    UnknownRequest { id: Value },
    UnknownNotification,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum HostMessage {
    InitializeResult { id: Value, context: HostContext },
    ContextChanged(HostContext),
    ToolInputPartial(Value),
    ToolInput(Value),
    ToolResult(Value),
    ToolCancelled { reason: String },
    Teardown { id: Value, reason: String },
    /// Reply to the guest request labelled `label`.
    Response {
        id: Value,
        label: String,
        outcome: Result<Value, RpcError>,
    },
}

/// One concrete wire format for the bridge contract.
pub(crate) trait WireEncoding: Send + Sync + fmt::Debug {
    fn variant(&self) -> ProtocolVariant;

    fn encode(&self, message: &HostMessage) -> Value;

    /// Returns `None` for traffic that is not addressed to this bridge.
    fn decode(&self, raw: &Value) -> Option<GuestMessage>;

    /// The method or type discriminator, used for labelling only.
    fn label(&self, raw: &Value) -> Option<String>;
}

pub(crate) const PROTOCOL_VERSION: &str = "2025-11-21";

/// Tools a widget's server exposes, as announced in the tool list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct ToolDescriptor {
    pub(crate) name: String,
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub(crate) meta: Option<Value>,
}

/// Which callers may invoke each known tool.
#[derive(Debug, Clone, Default)]
pub(crate) struct ToolCatalog {
    model_only: HashMap<String, bool>,
}

impl ToolCatalog {
    pub(crate) fn new(tools: &[ToolDescriptor]) -> Self {
        let model_only = tools
            .iter()
            .map(|tool| (tool.name.clone(), is_model_only(tool.meta.as_ref())))
            .collect();
        Self { model_only }
    }

    /// Unknown tools are left to the backend to authorize.
    pub(crate) fn is_callable_by_widget(&self, name: &str) -> bool {
        !self.model_only.get(name).copied().unwrap_or(false)
    }
}

fn is_model_only(meta: Option<&Value>) -> bool {
    let Some(visibility) = meta
        .and_then(|meta| meta.pointer("/ui/visibility"))
        .and_then(Value::as_array)
    else {
        return false;
    };
    !visibility.is_empty() && visibility.iter().all(|entry| entry.as_str() == Some("model"))
}
