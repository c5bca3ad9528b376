use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Failures raised while mounting, driving or tearing down a widget.
#[derive(Debug, Error)]
pub enum WidgetError {
    /// No origin distinct from the host could be derived. Fatal: widgets are
    /// never embedded same-origin.
    #[error("no sandbox origin available for host origin '{host_origin}': {reason}")]
    Configuration { host_origin: String, reason: String },

    /// The sandbox or bridge could not be brought up.
    #[error("bridge connection failed: {0}")]
    Connection(String),

    /// A host operation was attempted outside its legality window.
    #[error("{operation} is not allowed {reason}")]
    IllegalState {
        operation: &'static str,
        reason: String,
    },

    /// A guest asked for a tool whose visibility excludes widgets.
    #[error("tool \"{0}\" is only callable by the model")]
    ModelOnlyTool(String),

    #[error("widget not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl WidgetError {
    pub(crate) fn illegal(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::IllegalState {
            operation,
            reason: reason.into(),
        }
    }
}

/// Failures talking to the inspector backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("backend returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("invalid backend response: {0}")]
    InvalidResponse(String),
}

/// JSON-RPC error object, shared by `/rpc` and the guest bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub(crate) fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub(crate) fn method_not_found(message: &str) -> Self {
        Self::new(-32601, message)
    }

    pub(crate) fn invalid_params(message: &str) -> Self {
        Self::new(-32602, message)
    }

    pub(crate) fn server(message: &str) -> Self {
        Self::new(-32000, message)
    }

    pub(crate) fn forbidden(error: &str, message: &str) -> Self {
        Self {
            code: -32003,
            message: message.to_string(),
            data: Some(json!({ "error": error })),
        }
    }

    pub(crate) fn not_found(error: &str, message: &str) -> Self {
        Self {
            code: -32004,
            message: message.to_string(),
            data: Some(json!({ "error": error })),
        }
    }
}

impl From<WidgetError> for RpcError {
    fn from(error: WidgetError) -> Self {
        let message = error.to_string();
        match error {
            WidgetError::Configuration { .. } => {
                Self::forbidden("sandbox_origin_unavailable", &message)
            }
            WidgetError::ModelOnlyTool(_) => Self::forbidden("model_only_tool", &message),
            WidgetError::NotFound(_) => Self::not_found("widget_not_found", &message),
            WidgetError::InvalidRequest(_) => Self::invalid_params(&message),
            WidgetError::IllegalState { .. } => Self::new(-32002, message),
            WidgetError::Connection(_) | WidgetError::Backend(_) => Self::server(&message),
        }
    }
}

impl From<BackendError> for RpcError {
    fn from(error: BackendError) -> Self {
        WidgetError::from(error).into()
    }
}
