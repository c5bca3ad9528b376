//! Per-widget bridge state machine.
//!
//! The client is owned by a single widget runtime task and is driven with
//! `&mut self`: guest traffic comes in through [`BridgeClient::handle`], host
//! operations go out through the `send_*` methods. Calls that reach the
//! widget's server run on spawned tasks so a slow backend never stalls the
//! relay; they are aborted on teardown.

use std::{collections::HashMap, sync::Arc};

use serde_json::{json, Value};
use tokio::{sync::oneshot, task::JoinSet};
use tracing::{debug, error, info, trace, warn};

use super::{
    signature::Stable, BridgeState, DisplayMode, DisplayModeArbiter, GuestMessage, GuestRequest,
    HostContext, HostMessage, LogLevel, ToolCatalog, WireEncoding,
};
use crate::{
    debug_sink::{DebugSink, Direction},
    error::{BackendError, RpcError, WidgetError},
    sandbox::FramePort,
    services::{backend::WidgetBackend, model_context::ModelContextStore},
};

/// Identity of the widget a bridge belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WidgetScope {
    pub(crate) tool_call_id: String,
    pub(crate) server_id: String,
}

/// Host-wide collaborators every bridge shares.
#[derive(Clone)]
pub(crate) struct HostServices {
    pub(crate) backend: Arc<dyn WidgetBackend>,
    pub(crate) arbiter: Arc<DisplayModeArbiter>,
    pub(crate) model_context: Arc<ModelContextStore>,
    pub(crate) debug: Arc<DebugSink>,
}

/// Things the widget runtime must react to.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum BridgeEvent {
    Ready,
    SizeChanged { width: Option<f64>, height: f64 },
    DisplayModeGranted(DisplayMode),
    ModelContextUpdated(Value),
    Log { level: LogLevel, data: Value },
}

pub(crate) type TeardownAck = oneshot::Receiver<Result<Value, RpcError>>;

#[derive(Clone)]
struct Outbound {
    tool_call_id: String,
    encoding: Arc<dyn WireEncoding>,
    port: FramePort,
    debug: Arc<DebugSink>,
}

impl Outbound {
    fn send(&self, message: &HostMessage) -> bool {
        let data = self.encoding.encode(message);
        let label = self
            .encoding
            .label(&data)
            .unwrap_or_else(|| "unknown".to_string());
        self.debug
            .record(&self.tool_call_id, Direction::HostToGuest, label.as_str(), data.clone());
        let delivered = self.port.post(data);
        if !delivered {
            debug!(tool_call_id = %self.tool_call_id, %label, "guest frame gone; message dropped");
        }
        delivered
    }
}

#[derive(Default)]
struct Delivery {
    input: Option<Stable>,
    partial_closed: bool,
    terminal: bool,
}

enum BackendCall {
    CallTool { name: String, arguments: Value },
    ReadResource { uri: String },
    ListResources { cursor: Option<String> },
    ListResourceTemplates { cursor: Option<String> },
    ListPrompts { cursor: Option<String> },
}

impl BackendCall {
    async fn run(self, backend: &dyn WidgetBackend, server_id: &str) -> Result<Value, BackendError> {
        match self {
            Self::CallTool { name, arguments } => {
                backend.call_tool(server_id, &name, arguments).await
            }
            Self::ReadResource { uri } => backend.read_resource(server_id, &uri).await,
            Self::ListResources { cursor } => {
                backend.list_resources(server_id, cursor.as_deref()).await
            }
            Self::ListResourceTemplates { cursor } => {
                backend
                    .list_resource_templates(server_id, cursor.as_deref())
                    .await
            }
            Self::ListPrompts { cursor } => backend.list_prompts(server_id, cursor.as_deref()).await,
        }
    }
}

pub(crate) struct BridgeClient {
    scope: WidgetScope,
    outbound: Outbound,
    state: BridgeState,
    context: HostContext,
    context_sent: Option<HostContext>,
    tools: ToolCatalog,
    services: HostServices,
    delivery: Delivery,
    pending: HashMap<String, oneshot::Sender<Result<Value, RpcError>>>,
    next_request_id: u64,
    tasks: JoinSet<()>,
}

impl BridgeClient {
    /// Attaches to the outer frame. The bridge starts out connecting and
    /// only becomes ready once the guest has taken the host context.
    pub(crate) fn connect(
        scope: WidgetScope,
        encoding: Arc<dyn WireEncoding>,
        port: FramePort,
        context: HostContext,
        tools: ToolCatalog,
        services: HostServices,
    ) -> Self {
        info!(
            tool_call_id = %scope.tool_call_id,
            variant = ?encoding.variant(),
            "bridge connecting"
        );
        let outbound = Outbound {
            tool_call_id: scope.tool_call_id.clone(),
            encoding,
            port,
            debug: services.debug.clone(),
        };
        Self {
            scope,
            outbound,
            state: BridgeState::Connecting,
            context,
            context_sent: None,
            tools,
            services,
            delivery: Delivery::default(),
            pending: HashMap::new(),
            next_request_id: 1,
            tasks: JoinSet::new(),
        }
    }

    pub(crate) fn state(&self) -> BridgeState {
        self.state
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.state == BridgeState::Ready
    }

    pub(crate) fn has_delivered_terminal(&self) -> bool {
        self.delivery.terminal
    }

    /// Processes one message relayed from the guest.
    pub(crate) async fn handle(&mut self, raw: Value) -> Option<BridgeEvent> {
        let label = self
            .outbound
            .encoding
            .label(&raw)
            .unwrap_or_else(|| "unknown".to_string());
        self.services.debug.record(
            &self.scope.tool_call_id,
            Direction::GuestToHost,
            label.as_str(),
            raw.clone(),
        );

        let Some(message) = self.outbound.encoding.decode(&raw) else {
            trace!(tool_call_id = %self.scope.tool_call_id, %label, "ignoring non-bridge message");
            return None;
        };

        if self.state == BridgeState::TornDown {
            if let GuestMessage::Response { id, outcome } = message {
                self.resolve(id, outcome);
            }
            return None;
        }

        match message {
            GuestMessage::Initialize { id } => {
                self.outbound.send(&HostMessage::InitializeResult {
                    id,
                    context: self.context.clone(),
                });
                self.context_sent = Some(self.context.clone());
                None
            }
            GuestMessage::Initialized => self.mark_ready(),
            GuestMessage::Request { id, request } => self.handle_request(id, label, request).await,
            GuestMessage::SizeChanged { width, height } => {
                Some(BridgeEvent::SizeChanged { width, height })
            }
            GuestMessage::Log {
                level,
                logger,
                data,
            } => {
                emit_guest_log(&self.scope.tool_call_id, level, logger.as_deref(), &data);
                Some(BridgeEvent::Log { level, data })
            }
            GuestMessage::Response { id, outcome } => {
                self.resolve(id, outcome);
                None
            }
            GuestMessage::Malformed { id, reason } => {
                self.respond(id, label, Err(RpcError::invalid_params(&reason)));
                None
            }
            GuestMessage::UnknownRequest { id } => {
                let error = RpcError::method_not_found(&format!("Unknown method: {label}"));
                self.respond(id, label, Err(error));
                None
            }
            GuestMessage::UnknownNotification => {
                debug!(tool_call_id = %self.scope.tool_call_id, %label, "ignoring unknown notification");
                None
            }
        }
    }

    /// Stores `context` and delivers it if the guest is ready and it differs
    /// from what the guest last saw.
    pub(crate) fn push_host_context(&mut self, context: HostContext) -> Result<bool, WidgetError> {
        if self.state == BridgeState::TornDown {
            return Err(WidgetError::illegal("push_host_context", "after teardown"));
        }
        self.context = context;
        if !self.is_ready() || self.context_sent.as_ref() == Some(&self.context) {
            return Ok(false);
        }
        self.outbound
            .send(&HostMessage::ContextChanged(self.context.clone()));
        self.context_sent = Some(self.context.clone());
        Ok(true)
    }

    pub(crate) fn send_partial_input(&mut self, arguments: Value) -> Result<(), WidgetError> {
        self.ensure_ready("send_partial_input")?;
        if self.delivery.partial_closed {
            return Err(WidgetError::illegal(
                "send_partial_input",
                "after full input or output was delivered",
            ));
        }
        self.outbound.send(&HostMessage::ToolInputPartial(arguments));
        Ok(())
    }

    /// Returns `false` when the guest already has structurally equal input.
    pub(crate) fn send_input(&mut self, arguments: Value) -> Result<bool, WidgetError> {
        self.ensure_ready("send_input")?;
        let input = Stable::new(arguments);
        if self.delivery.input.as_ref() == Some(&input) {
            return Ok(false);
        }
        self.delivery.partial_closed = true;
        self.outbound
            .send(&HostMessage::ToolInput(input.value().clone()));
        self.delivery.input = Some(input);
        Ok(true)
    }

    pub(crate) fn send_result(&mut self, result: Value) -> Result<(), WidgetError> {
        self.ensure_ready("send_result")?;
        self.claim_terminal("send_result")?;
        self.outbound.send(&HostMessage::ToolResult(result));
        Ok(())
    }

    pub(crate) fn send_cancelled(&mut self, reason: &str) -> Result<(), WidgetError> {
        self.ensure_ready("send_cancelled")?;
        self.claim_terminal("send_cancelled")?;
        self.outbound.send(&HostMessage::ToolCancelled {
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Forgets what was delivered so a restarted stream starts clean.
    pub(crate) fn reset_delivery(&mut self) {
        self.delivery = Delivery::default();
    }

    /// Idempotent. Returns the acknowledgement to wait for when a teardown
    /// request actually went out.
    pub(crate) fn teardown(&mut self, reason: &str) -> Option<TeardownAck> {
        if self.state == BridgeState::TornDown {
            return None;
        }
        let was_ready = self.is_ready();
        self.state = BridgeState::TornDown;
        self.tasks.abort_all();
        self.pending.clear();
        info!(tool_call_id = %self.scope.tool_call_id, reason, "bridge torn down");

        if !was_ready {
            return None;
        }

        let id = json!(self.next_request_id);
        self.next_request_id += 1;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.to_string(), tx);
        if !self.outbound.send(&HostMessage::Teardown {
            id,
            reason: reason.to_string(),
        }) {
            self.pending.clear();
            return None;
        }
        Some(rx)
    }

    fn mark_ready(&mut self) -> Option<BridgeEvent> {
        if self.state != BridgeState::Connecting {
            return None;
        }
        if self.context_sent.is_none() {
            warn!(
                tool_call_id = %self.scope.tool_call_id,
                "guest reported initialized before receiving host context"
            );
            return None;
        }
        self.state = BridgeState::Ready;
        info!(tool_call_id = %self.scope.tool_call_id, "bridge ready");
        Some(BridgeEvent::Ready)
    }

    async fn handle_request(
        &mut self,
        id: Value,
        label: String,
        request: GuestRequest,
    ) -> Option<BridgeEvent> {
        let call = match request {
            GuestRequest::RequestDisplayMode { mode } => {
                let granted = self
                    .services
                    .arbiter
                    .request(&self.scope.tool_call_id, mode, &self.context)
                    .await;
                self.respond(id, label, Ok(json!({ "mode": granted })));
                return Some(BridgeEvent::DisplayModeGranted(granted));
            }
            GuestRequest::UpdateModelContext { context } => {
                self.services
                    .model_context
                    .set(&self.scope.tool_call_id, context.clone())
                    .await;
                self.respond(id, label, Ok(json!({})));
                return Some(BridgeEvent::ModelContextUpdated(context));
            }
            GuestRequest::Ping => {
                self.respond(id, label, Ok(json!({})));
                return None;
            }
            GuestRequest::CallTool { name, arguments } => {
                if !self.tools.is_callable_by_widget(&name) {
                    warn!(
                        tool_call_id = %self.scope.tool_call_id,
                        tool = %name,
                        "rejected widget call to model-only tool"
                    );
                    let error = WidgetError::ModelOnlyTool(name);
                    self.respond(id, label, Err(error.into()));
                    return None;
                }
                BackendCall::CallTool { name, arguments }
            }
            GuestRequest::ReadResource { uri } => BackendCall::ReadResource { uri },
            GuestRequest::ListResources { cursor } => BackendCall::ListResources { cursor },
            GuestRequest::ListResourceTemplates { cursor } => {
                BackendCall::ListResourceTemplates { cursor }
            }
            GuestRequest::ListPrompts { cursor } => BackendCall::ListPrompts { cursor },
        };

        self.spawn_backend(id, label, call);
        None
    }

    fn spawn_backend(&mut self, id: Value, label: String, call: BackendCall) {
        while self.tasks.try_join_next().is_some() {}

        let backend = self.services.backend.clone();
        let outbound = self.outbound.clone();
        let server_id = self.scope.server_id.clone();
        self.tasks.spawn(async move {
            let outcome = call.run(backend.as_ref(), &server_id).await.map_err(|error| {
                warn!(
                    tool_call_id = %outbound.tool_call_id,
                    method = %label,
                    "guest request failed: {error}"
                );
                RpcError::from(error)
            });
            outbound.send(&HostMessage::Response { id, label, outcome });
        });
    }

    fn respond(&self, id: Value, label: String, outcome: Result<Value, RpcError>) {
        self.outbound
            .send(&HostMessage::Response { id, label, outcome });
    }

    fn resolve(&mut self, id: Value, outcome: Result<Value, RpcError>) {
        match self.pending.remove(&id.to_string()) {
            Some(waiter) => {
                let _ = waiter.send(outcome);
            }
            None => debug!(tool_call_id = %self.scope.tool_call_id, %id, "response to unknown request"),
        }
    }

    fn ensure_ready(&self, operation: &'static str) -> Result<(), WidgetError> {
        match self.state {
            BridgeState::Ready => Ok(()),
            BridgeState::Connecting => Err(WidgetError::illegal(
                operation,
                "before the guest finished initializing",
            )),
            BridgeState::TornDown => Err(WidgetError::illegal(operation, "after teardown")),
        }
    }

    fn claim_terminal(&mut self, operation: &'static str) -> Result<(), WidgetError> {
        if self.delivery.terminal {
            return Err(WidgetError::illegal(
                operation,
                "after a result or cancellation was delivered",
            ));
        }
        self.delivery.terminal = true;
        self.delivery.partial_closed = true;
        Ok(())
    }
}

fn emit_guest_log(tool_call_id: &str, level: LogLevel, logger: Option<&str>, data: &Value) {
    let logger = logger.unwrap_or("widget");
    match level {
        LogLevel::Debug => debug!(tool_call_id, logger, %data, "guest log"),
        LogLevel::Info | LogLevel::Notice => info!(tool_call_id, logger, %data, "guest log"),
        LogLevel::Warning => warn!(tool_call_id, logger, %data, "guest log"),
        LogLevel::Error | LogLevel::Critical | LogLevel::Alert | LogLevel::Emergency => {
            error!(tool_call_id, logger, %data, "guest log")
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        bridge::{DeviceType, ProtocolVariant, ToolDescriptor},
        sandbox::frame::Mailbox,
        services::backend::fake::FakeBackend,
    };

    const SANDBOX: &str = "http://127.0.0.1:6274";

    struct Harness {
        client: BridgeClient,
        guest: Mailbox,
        backend: Arc<FakeBackend>,
        services: HostServices,
    }

    fn harness(variant: ProtocolVariant, context: HostContext) -> Harness {
        harness_with(variant, context, FakeBackend::default())
    }

    fn harness_with(
        variant: ProtocolVariant,
        context: HostContext,
        mut backend: FakeBackend,
    ) -> Harness {
        backend
            .tool_results
            .insert("refresh".to_string(), json!({ "content": [{ "type": "text", "text": "ok" }] }));
        let backend = Arc::new(backend);
        let services = HostServices {
            backend: backend.clone(),
            arbiter: Arc::new(DisplayModeArbiter::new()),
            model_context: Arc::new(ModelContextStore::default()),
            debug: Arc::new(DebugSink::new(64)),
        };
        let tools = ToolCatalog::new(&[ToolDescriptor {
            name: "delete_all".to_string(),
            meta: Some(json!({ "ui": { "visibility": ["model"] } })),
        }]);
        let (port, guest) = FramePort::loopback(SANDBOX);
        let client = BridgeClient::connect(
            WidgetScope {
                tool_call_id: "call-1".to_string(),
                server_id: "weather".to_string(),
            },
            variant.encoding(),
            port,
            context,
            tools,
            services.clone(),
        );
        Harness {
            client,
            guest,
            backend,
            services,
        }
    }

    async fn next(guest: &mut Mailbox) -> Value {
        tokio::time::timeout(Duration::from_secs(1), guest.recv())
            .await
            .expect("guest message in time")
            .expect("guest mailbox open")
            .data
    }

    async fn ready(harness: &mut Harness) {
        harness
            .client
            .handle(json!({ "jsonrpc": "2.0", "id": 0, "method": "ui/initialize", "params": {} }))
            .await;
        let init = next(&mut harness.guest).await;
        assert_eq!(init["id"], 0);
        let event = harness
            .client
            .handle(json!({ "jsonrpc": "2.0", "method": "ui/notifications/initialized" }))
            .await;
        assert_eq!(event, Some(BridgeEvent::Ready));
    }

    #[tokio::test]
    async fn ready_requires_host_context_first() {
        let mut h = harness(ProtocolVariant::JsonRpc, HostContext::default());
        let early = h
            .client
            .handle(json!({ "jsonrpc": "2.0", "method": "ui/notifications/initialized" }))
            .await;
        assert_eq!(early, None);
        assert_eq!(h.client.state(), BridgeState::Connecting);
        assert!(matches!(
            h.client.send_input(json!({})),
            Err(WidgetError::IllegalState { .. })
        ));

        ready(&mut h).await;
        assert!(h.client.is_ready());
    }

    #[tokio::test]
    async fn teardown_is_idempotent_and_sends_once() {
        let mut h = harness(ProtocolVariant::JsonRpc, HostContext::default());
        ready(&mut h).await;

        let ack = h.client.teardown("unmount").expect("teardown request sent");
        assert!(h.client.teardown("unmount").is_none());
        assert_eq!(h.client.state(), BridgeState::TornDown);

        let request = next(&mut h.guest).await;
        assert_eq!(request["method"], "ui/resource-teardown");
        assert!(h.guest.try_recv().is_none());

        h.client
            .handle(json!({ "jsonrpc": "2.0", "id": request["id"].clone(), "result": {} }))
            .await;
        assert_eq!(ack.await.expect("ack"), Ok(json!({})));
    }

    #[tokio::test]
    async fn teardown_before_ready_sends_nothing() {
        let mut h = harness(ProtocolVariant::JsonRpc, HostContext::default());
        assert!(h.client.teardown("unmount").is_none());
        assert!(h.client.teardown("unmount").is_none());
        assert!(h.guest.try_recv().is_none());
        assert!(matches!(
            h.client.push_host_context(HostContext::default()),
            Err(WidgetError::IllegalState { .. })
        ));
    }

    #[tokio::test]
    async fn model_only_tool_is_rejected_before_backend() {
        let mut h = harness(ProtocolVariant::JsonRpc, HostContext::default());
        ready(&mut h).await;

        h.client
            .handle(json!({
                "jsonrpc": "2.0",
                "id": 5,
                "method": "tools/call",
                "params": { "name": "delete_all", "arguments": {} }
            }))
            .await;
        let response = next(&mut h.guest).await;
        assert_eq!(response["id"], 5);
        assert_eq!(response["error"]["code"], -32003);
        assert!(h.backend.calls().is_empty());
    }

    #[tokio::test]
    async fn tool_calls_are_proxied_to_the_widget_server() {
        let mut h = harness(ProtocolVariant::JsonRpc, HostContext::default());
        ready(&mut h).await;

        h.client
            .handle(json!({
                "jsonrpc": "2.0",
                "id": 6,
                "method": "tools/call",
                "params": { "name": "refresh", "arguments": { "city": "Oslo" } }
            }))
            .await;
        let response = next(&mut h.guest).await;
        assert_eq!(response["id"], 6);
        assert_eq!(response["result"]["content"][0]["text"], "ok");
        assert_eq!(h.backend.calls(), vec!["weather:tools/call:refresh".to_string()]);
    }

    #[tokio::test]
    async fn backend_failures_become_cancellations() {
        let mut h = harness(ProtocolVariant::Flat, HostContext::default());
        h.client
            .handle(json!({ "type": "resource:read", "callId": "r1", "uri": "ui://missing" }))
            .await;
        let response = next(&mut h.guest).await;
        assert_eq!(response["type"], "resource:read:response");
        assert_eq!(response["callId"], "r1");
        assert_eq!(response["cancelled"], true);
        assert!(response["error"]
            .as_str()
            .is_some_and(|message| message.contains("unknown resource ui://missing")));
    }

    #[tokio::test]
    async fn jsonrpc_list_requests_are_scoped_to_the_widget_server() {
        let mut h = harness(ProtocolVariant::JsonRpc, HostContext::default());
        ready(&mut h).await;

        let cases = [
            ("resources/list", json!({}), "resources", "ui://widget/forecast.html"),
            (
                "resources/templates/list",
                json!({ "cursor": "page-2" }),
                "resourceTemplates",
                "ui://widget/{city}.html",
            ),
            ("prompts/list", json!({}), "prompts", "summarize_forecast"),
        ];
        for (id, (method, params, key, expected)) in cases.into_iter().enumerate() {
            h.client
                .handle(json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params }))
                .await;
            let response = next(&mut h.guest).await;
            assert_eq!(response["id"], id);
            assert!(response.get("error").is_none(), "{method} failed: {response}");
            let first = &response["result"][key][0];
            let found = first
                .get("uri")
                .or_else(|| first.get("uriTemplate"))
                .or_else(|| first.get("name"))
                .and_then(Value::as_str);
            assert_eq!(found, Some(expected));
        }

        assert_eq!(
            h.backend.calls(),
            vec![
                "weather:resources/list".to_string(),
                "weather:resources/templates/list:page-2".to_string(),
                "weather:prompts/list".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn flat_list_requests_are_scoped_to_the_widget_server() {
        let mut h = harness(ProtocolVariant::Flat, HostContext::default());

        let cases = [
            ("resource:list", "l1", "resources"),
            ("resource-template:list", "l2", "resourceTemplates"),
            ("prompt:list", "l3", "prompts"),
        ];
        for (kind, call_id, key) in cases {
            h.client
                .handle(json!({ "type": kind, "callId": call_id, "cursor": "next" }))
                .await;
            let response = next(&mut h.guest).await;
            assert_eq!(response["type"], format!("{kind}:response"));
            assert_eq!(response["callId"], call_id);
            assert!(response.get("cancelled").is_none());
            assert_eq!(response["result"][key].as_array().map(Vec::len), Some(1));
        }

        assert_eq!(
            h.backend.calls(),
            vec![
                "weather:resources/list:next".to_string(),
                "weather:resources/templates/list:next".to_string(),
                "weather:prompts/list:next".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn list_failures_settle_as_cancellations_in_both_encodings() {
        let offline = || FakeBackend {
            lists_unavailable: true,
            ..FakeBackend::default()
        };

        let mut h = harness_with(ProtocolVariant::JsonRpc, HostContext::default(), offline());
        ready(&mut h).await;
        for (id, method) in ["resources/list", "resources/templates/list", "prompts/list"]
            .into_iter()
            .enumerate()
        {
            h.client
                .handle(json!({ "jsonrpc": "2.0", "id": id, "method": method }))
                .await;
            let response = next(&mut h.guest).await;
            assert_eq!(response["id"], id);
            assert!(response.get("result").is_none());
            assert_eq!(response["error"]["code"], -32000);
            assert_eq!(
                response["error"]["message"],
                "backend returned 503: server weather is not connected"
            );
        }
        assert_eq!(h.backend.calls().len(), 3);

        let mut h = harness_with(ProtocolVariant::Flat, HostContext::default(), offline());
        for kind in ["resource:list", "resource-template:list", "prompt:list"] {
            h.client.handle(json!({ "type": kind, "callId": kind })).await;
            let response = next(&mut h.guest).await;
            assert_eq!(response["type"], format!("{kind}:response"));
            assert_eq!(response["callId"], kind);
            assert_eq!(response["cancelled"], true);
            assert_eq!(
                response["error"],
                "backend returned 503: server weather is not connected"
            );
        }
        assert!(h
            .backend
            .calls()
            .iter()
            .all(|call| call.starts_with("weather:")));
    }

    #[tokio::test]
    async fn unknown_requests_get_method_not_found() {
        let mut h = harness(ProtocolVariant::JsonRpc, HostContext::default());
        h.client
            .handle(json!({ "jsonrpc": "2.0", "id": 8, "method": "sampling/createMessage" }))
            .await;
        let response = next(&mut h.guest).await;
        assert_eq!(response["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn delivery_windows_are_enforced() {
        let mut h = harness(ProtocolVariant::JsonRpc, HostContext::default());
        ready(&mut h).await;

        h.client.send_partial_input(json!({ "a": 1 })).expect("partial");
        assert!(h.client.send_input(json!({ "a": 1, "b": 2 })).expect("input"));
        assert!(!h
            .client
            .send_input(serde_json::from_str(r#"{"b":2,"a":1}"#).expect("parse"))
            .expect("duplicate input"));
        assert!(h.client.send_partial_input(json!({ "a": 3 })).is_err());

        h.client.send_result(json!({ "content": [] })).expect("result");
        assert!(h.client.send_cancelled("late failure").is_err());
        assert!(h.client.has_delivered_terminal());

        h.client.reset_delivery();
        h.client.send_partial_input(json!({ "a": 1 })).expect("partial after reset");

        let methods = std::iter::from_fn(|| h.guest.try_recv())
            .map(|event| event.data["method"].as_str().unwrap_or_default().to_string())
            .collect::<Vec<_>>();
        assert_eq!(
            methods,
            vec![
                "ui/notifications/tool-input-partial",
                "ui/notifications/tool-input",
                "ui/notifications/tool-result",
                "ui/notifications/tool-input-partial",
            ]
        );
    }

    #[tokio::test]
    async fn context_is_pushed_only_when_changed() {
        let mut h = harness(ProtocolVariant::JsonRpc, HostContext::default());
        assert_eq!(h.client.push_host_context(HostContext::default()).ok(), Some(false));
        ready(&mut h).await;

        assert_eq!(h.client.push_host_context(HostContext::default()).ok(), Some(false));
        let mut dark = HostContext::default();
        dark.theme = crate::bridge::Theme::Dark;
        assert_eq!(h.client.push_host_context(dark).ok(), Some(true));
        let pushed = next(&mut h.guest).await;
        assert_eq!(pushed["method"], "ui/notifications/host-context-changed");
        assert_eq!(pushed["params"]["theme"], "dark");
    }

    #[tokio::test]
    async fn pip_request_on_phone_is_granted_fullscreen() {
        let phone = HostContext {
            device_type: DeviceType::Mobile,
            ..HostContext::default()
        };
        let mut h = harness(ProtocolVariant::JsonRpc, phone);
        ready(&mut h).await;

        let event = h
            .client
            .handle(json!({
                "jsonrpc": "2.0",
                "id": 11,
                "method": "ui/request-display-mode",
                "params": { "mode": "pip" }
            }))
            .await;
        assert_eq!(event, Some(BridgeEvent::DisplayModeGranted(DisplayMode::Fullscreen)));
        assert_eq!(next(&mut h.guest).await["result"]["mode"], "fullscreen");
        assert_eq!(
            h.services.arbiter.holders().await.fullscreen.as_deref(),
            Some("call-1")
        );
    }

    #[tokio::test]
    async fn model_context_is_cached_per_widget() {
        let mut h = harness(ProtocolVariant::Flat, HostContext::default());
        let event = h
            .client
            .handle(json!({ "type": "model-context:set", "callId": "m1", "context": { "selection": [1, 2] } }))
            .await;
        assert_eq!(
            event,
            Some(BridgeEvent::ModelContextUpdated(json!({ "selection": [1, 2] })))
        );
        assert_eq!(next(&mut h.guest).await["type"], "model-context:set:response");
        let stored = h
            .services
            .model_context
            .get("call-1")
            .await
            .expect("stored context");
        assert_eq!(stored.context, json!({ "selection": [1, 2] }));
    }

    #[tokio::test]
    async fn traffic_is_mirrored_to_the_debug_sink() {
        let mut h = harness(ProtocolVariant::JsonRpc, HostContext::default());
        ready(&mut h).await;
        let labels = h
            .services
            .debug
            .entries(Some("call-1"), 10)
            .into_iter()
            .map(|entry| (entry.direction, entry.label))
            .collect::<Vec<_>>();
        assert_eq!(
            labels,
            vec![
                (Direction::GuestToHost, "ui/initialize".to_string()),
                (Direction::HostToGuest, "result".to_string()),
                (
                    Direction::GuestToHost,
                    "ui/notifications/initialized".to_string()
                ),
            ]
        );
    }
}
