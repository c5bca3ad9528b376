//! Per-widget runtime.
//!
//! Every mounted widget is one actor task owning its outer frame, bridge
//! client, input stream controller and reveal gate. The [`WidgetManager`]
//! keeps the command senders and is what `/rpc` talks to.

use std::{
    collections::{hash_map::Entry, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    sync::{broadcast, mpsc, oneshot, Mutex},
    task::JoinHandle,
    time::{sleep_until, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    bridge::{
        BridgeClient, BridgeEvent, BridgeState, DisplayChange, DisplayMode, HostContext,
        HostContextPatch, HostServices, InputStreamController, LifecycleState, LogLevel,
        ProtocolVariant, RevealGate, ThrottleDecision, ToolCatalog, ToolDescriptor, ToolInfo,
        WidgetScope,
    },
    debug_sink::Direction,
    error::WidgetError,
    sandbox::{
        CspMode, CspViolation, FrameEvent, GuestRegistry, OriginResolver, OuterFrameController,
        SandboxResource, WidgetCsp, WidgetPermissions,
    },
    services::{
        location::LocationCache,
        widget_store::{StoreWidgetRequest, WidgetStore},
    },
};

const COMMAND_BUFFER: usize = 32;

#[derive(Debug, Clone, Copy)]
pub(crate) struct WidgetSettings {
    pub(crate) partial_input_interval: Duration,
    pub(crate) reveal_timeout: Duration,
    pub(crate) teardown_timeout: Duration,
    pub(crate) connect_timeout: Duration,
}

impl Default for WidgetSettings {
    fn default() -> Self {
        Self {
            partial_input_interval: Duration::from_millis(250),
            reveal_timeout: Duration::from_millis(1500),
            teardown_timeout: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MountRequest {
    pub(crate) tool_call_id: String,
    pub(crate) server_id: String,
    pub(crate) tool_name: String,
    #[serde(default)]
    pub(crate) resource_uri: Option<String>,
    #[serde(default)]
    pub(crate) output_template: Option<String>,
    #[serde(default)]
    pub(crate) protocol: ProtocolVariant,
    #[serde(default)]
    pub(crate) csp_mode: CspMode,
    /// Requested guest sandbox tokens; filtered by the proxy.
    #[serde(default)]
    pub(crate) sandbox: Option<String>,
    #[serde(default)]
    pub(crate) tools: Vec<ToolDescriptor>,
    #[serde(default)]
    pub(crate) context: HostContextPatch,
    pub(crate) lifecycle: LifecycleUpdate,
}

/// The host's view of a tool call, replayed to the guest once it is ready.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LifecycleUpdate {
    pub(crate) state: LifecycleState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub(crate) enum WidgetStatus {
    Loading,
    Ready,
    LoadError { message: String },
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WidgetSnapshot {
    pub(crate) tool_call_id: String,
    pub(crate) server_id: String,
    pub(crate) tool_name: String,
    pub(crate) resource_uri: Option<String>,
    pub(crate) protocol: ProtocolVariant,
    pub(crate) csp_mode: CspMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) csp: Option<WidgetCsp>,
    pub(crate) permissions: WidgetPermissions,
    pub(crate) prefers_border: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) mime_type_warning: Option<String>,
    pub(crate) status: WidgetStatus,
    pub(crate) proxy_ready: bool,
    pub(crate) bridge_state: Option<BridgeState>,
    pub(crate) display_mode: DisplayMode,
    pub(crate) revealed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) height: Option<f64>,
    pub(crate) lifecycle: LifecycleState,
    pub(crate) violation_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WidgetEvent {
    pub(crate) tool_call_id: String,
    #[serde(flatten)]
    pub(crate) kind: WidgetEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub(crate) enum WidgetEventKind {
    Status { status: WidgetStatus },
    Revealed,
    Resized {
        #[serde(skip_serializing_if = "Option::is_none")]
        width: Option<f64>,
        height: f64,
    },
    DisplayMode { mode: DisplayMode },
    Violation { violation: CspViolation },
    ModelContext { context: Value },
    Log { level: LogLevel, data: Value },
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Lifecycle(LifecycleUpdate, Reply<Result<WidgetSnapshot, WidgetError>>),
    HostContext(HostContextPatch, Reply<WidgetSnapshot>),
    CspMode(CspMode, Reply<WidgetSnapshot>),
    Snapshot(Reply<WidgetSnapshot>),
    Violations(Reply<Vec<CspViolation>>),
    Unmount(Reply<WidgetSnapshot>),
}

struct LoadedContent {
    csp: Option<WidgetCsp>,
    permissions: WidgetPermissions,
    prefers_border: bool,
    mime_type_warning: Option<String>,
}

struct WidgetRuntime {
    scope: WidgetScope,
    tool_name: String,
    resource_uri: Option<String>,
    protocol: ProtocolVariant,
    csp_mode: CspMode,
    sandbox: Option<String>,
    tools: ToolCatalog,
    context: HostContext,
    lifecycle: LifecycleUpdate,
    frame: OuterFrameController,
    bridge: Option<BridgeClient>,
    stream: InputStreamController,
    reveal: RevealGate,
    content: Option<LoadedContent>,
    status: WidgetStatus,
    height: Option<f64>,
    violations: Vec<CspViolation>,
    connect_deadline: Option<Instant>,
    settings: WidgetSettings,
    store: Arc<WidgetStore>,
    services: HostServices,
    events: broadcast::Sender<WidgetEvent>,
    commands: mpsc::Receiver<Command>,
}

impl WidgetRuntime {
    async fn run(mut self) {
        self.stream.observe(self.lifecycle.state);
        self.load().await;

        let mut display = self.services.arbiter.subscribe();
        let mut display_open = true;
        loop {
            let throttle_at = self.stream.deadline();
            let reveal_at = self.reveal.deadline();
            let connect_at = self.connect_deadline;

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command).await {
                            break;
                        }
                    }
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(event) = self.frame.next_event() => self.handle_frame_event(event).await,
                _ = sleep_until(throttle_at.unwrap_or_else(Instant::now)), if throttle_at.is_some() => {
                    self.flush_partial_input();
                }
                _ = sleep_until(reveal_at.unwrap_or_else(Instant::now)), if reveal_at.is_some() => {
                    if self.reveal.on_tick(Instant::now()) {
                        debug!(tool_call_id = %self.scope.tool_call_id, "revealed by fallback timeout");
                        self.emit(WidgetEventKind::Revealed);
                    }
                }
                _ = sleep_until(connect_at.unwrap_or_else(Instant::now)), if connect_at.is_some() => {
                    self.connect_deadline = None;
                    warn!(tool_call_id = %self.scope.tool_call_id, "widget did not finish initializing");
                    self.set_status(WidgetStatus::LoadError {
                        message: "widget did not finish initializing".to_string(),
                    });
                }
                change = display.recv(), if display_open => match change {
                    Ok(change) => self.handle_display_change(change),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "display changes lagged; resyncing");
                        let mode = self.services.arbiter.mode_of(&self.scope.tool_call_id).await;
                        self.apply_display_mode(mode);
                    }
                    Err(broadcast::error::RecvError::Closed) => display_open = false,
                },
            }
        }
        debug!(tool_call_id = %self.scope.tool_call_id, "widget runtime stopped");
    }

    /// Returns `true` once the widget has shut down.
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Lifecycle(update, reply) => {
                let result = self.apply_lifecycle(update).await.map(|()| self.snapshot());
                let _ = reply.send(result);
            }
            Command::HostContext(patch, reply) => {
                if self.context.apply(patch) {
                    self.push_context();
                }
                let _ = reply.send(self.snapshot());
            }
            Command::CspMode(mode, reply) => {
                self.change_csp_mode(mode).await;
                let _ = reply.send(self.snapshot());
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Violations(reply) => {
                let _ = reply.send(self.violations.clone());
            }
            Command::Unmount(reply) => {
                let _ = reply.send(self.shutdown().await);
                return true;
            }
        }
        false
    }

    /// Fetches prepared content and (re)loads the proxy with it. Failures
    /// leave the widget in a load-error state until the CSP mode is toggled.
    async fn load(&mut self) {
        self.set_status(WidgetStatus::Loading);
        let content = match self
            .store
            .content(&self.scope.tool_call_id, Some(self.csp_mode))
            .await
        {
            Ok(content) => content,
            Err(error) => {
                warn!(tool_call_id = %self.scope.tool_call_id, "widget content unavailable: {error}");
                self.content = None;
                self.set_status(WidgetStatus::LoadError {
                    message: error.to_string(),
                });
                return;
            }
        };

        self.content = Some(LoadedContent {
            csp: content.csp.clone(),
            permissions: content.permissions.clone(),
            prefers_border: content.prefers_border,
            mime_type_warning: content.mime_type_warning.clone(),
        });
        let resource = SandboxResource::new(
            content.html,
            self.sandbox.clone(),
            content.csp,
            content.permissions,
            content.permissive,
        );
        if !self.frame.set_resource(resource).await {
            self.frame.reload().await;
        }
        self.connect_deadline = Some(Instant::now() + self.settings.connect_timeout);
    }

    async fn handle_frame_event(&mut self, event: FrameEvent) {
        match event {
            FrameEvent::ProxyReady => self.attach_bridge(),
            FrameEvent::Violation(violation) => {
                warn!(
                    tool_call_id = %self.scope.tool_call_id,
                    directive = %violation.effective_directive,
                    blocked_uri = %violation.blocked_uri,
                    "csp violation"
                );
                self.services.debug.record(
                    &self.scope.tool_call_id,
                    Direction::Sandbox,
                    "sandbox-csp-violation",
                    serde_json::to_value(&violation).unwrap_or(Value::Null),
                );
                self.violations.push(violation.clone());
                self.emit(WidgetEventKind::Violation { violation });
            }
            FrameEvent::Message(raw) => {
                let Some(bridge) = self.bridge.as_mut() else {
                    debug!(tool_call_id = %self.scope.tool_call_id, "dropping message before bridge attached");
                    return;
                };
                if let Some(event) = bridge.handle(raw).await {
                    self.handle_bridge_event(event).await;
                }
            }
        }
    }

    fn attach_bridge(&mut self) {
        if self.bridge.is_some() {
            return;
        }
        let Some(port) = self.frame.port() else {
            return;
        };
        self.bridge = Some(BridgeClient::connect(
            self.scope.clone(),
            self.protocol.encoding(),
            port,
            self.context.clone(),
            self.tools.clone(),
            self.services.clone(),
        ));
        self.reveal.arm(Instant::now());
    }

    async fn handle_bridge_event(&mut self, event: BridgeEvent) {
        match event {
            BridgeEvent::Ready => {
                self.connect_deadline = None;
                self.set_status(WidgetStatus::Ready);
                if let Err(error) = self.deliver_lifecycle() {
                    warn!(tool_call_id = %self.scope.tool_call_id, "lifecycle replay failed: {error}");
                }
            }
            BridgeEvent::SizeChanged { width, height } => {
                self.height = Some(height);
                self.emit(WidgetEventKind::Resized { width, height });
                if self.reveal.on_size_changed() {
                    self.emit(WidgetEventKind::Revealed);
                }
            }
            BridgeEvent::DisplayModeGranted(mode) => self.apply_display_mode(mode),
            BridgeEvent::ModelContextUpdated(context) => {
                self.emit(WidgetEventKind::ModelContext { context });
            }
            BridgeEvent::Log { level, data } => self.emit(WidgetEventKind::Log { level, data }),
        }
    }

    fn handle_display_change(&mut self, change: DisplayChange) {
        if change.tool_call_id == self.scope.tool_call_id {
            self.apply_display_mode(change.mode);
        }
    }

    fn apply_display_mode(&mut self, mode: DisplayMode) {
        if self.context.display_mode == mode {
            return;
        }
        self.context.display_mode = mode;
        self.push_context();
        self.emit(WidgetEventKind::DisplayMode { mode });
    }

    fn push_context(&mut self) {
        if let Some(bridge) = self.bridge.as_mut() {
            if let Err(error) = bridge.push_host_context(self.context.clone()) {
                debug!(tool_call_id = %self.scope.tool_call_id, "host context not pushed: {error}");
            }
        }
    }

    async fn apply_lifecycle(&mut self, update: LifecycleUpdate) -> Result<(), WidgetError> {
        if self.stream.observe(update.state) {
            debug!(tool_call_id = %self.scope.tool_call_id, "input streaming restarted");
            if let Some(bridge) = self.bridge.as_mut() {
                bridge.reset_delivery();
            }
        }
        if let Some(output) = &update.output {
            self.store
                .update_output(&self.scope.tool_call_id, output.clone())
                .await;
        }

        self.lifecycle = LifecycleUpdate {
            state: update.state,
            input: update.input.or_else(|| self.lifecycle.input.take()),
            output: update.output.or_else(|| self.lifecycle.output.take()),
            error: update.error,
        };
        self.deliver_lifecycle()
    }

    /// Delivers whatever the current lifecycle state implies. A no-op until
    /// the bridge is ready; readiness replays it.
    fn deliver_lifecycle(&mut self) -> Result<(), WidgetError> {
        let Some(bridge) = self.bridge.as_mut().filter(|bridge| bridge.is_ready()) else {
            return Ok(());
        };
        let state = self.lifecycle.state;

        if state == LifecycleState::InputStreaming {
            let Some(partial) = self.lifecycle.input.clone() else {
                return Ok(());
            };
            if let ThrottleDecision::SendNow(partial) = self.stream.offer(partial, Instant::now()) {
                bridge.send_partial_input(partial)?;
            }
            return Ok(());
        }

        if state.has_full_input() {
            if let Some(input) = self.lifecycle.input.clone() {
                bridge.send_input(input)?;
            }
        }
        if !state.is_terminal() {
            return Ok(());
        }
        if bridge.has_delivered_terminal() {
            debug!(tool_call_id = %self.scope.tool_call_id, ?state, "terminal delivery already made");
            return Ok(());
        }
        match state {
            LifecycleState::OutputAvailable => {
                bridge.send_result(self.lifecycle.output.clone().unwrap_or(Value::Null))
            }
            LifecycleState::OutputError => bridge.send_cancelled(
                self.lifecycle
                    .error
                    .as_deref()
                    .unwrap_or("Tool execution failed"),
            ),
            LifecycleState::OutputDenied => bridge.send_cancelled(
                self.lifecycle
                    .error
                    .as_deref()
                    .unwrap_or("Tool execution was denied"),
            ),
            LifecycleState::InputStreaming | LifecycleState::InputAvailable => Ok(()),
        }
    }

    fn flush_partial_input(&mut self) {
        let Some(partial) = self.stream.take_due(Instant::now()) else {
            return;
        };
        if let Some(bridge) = self.bridge.as_mut().filter(|bridge| bridge.is_ready()) {
            if let Err(error) = bridge.send_partial_input(partial) {
                debug!(tool_call_id = %self.scope.tool_call_id, "trailing partial input dropped: {error}");
            }
        }
    }

    /// Always a full reload: a loaded document cannot have its policy changed.
    async fn change_csp_mode(&mut self, mode: CspMode) {
        if mode == self.csp_mode && !matches!(self.status, WidgetStatus::LoadError { .. }) {
            return;
        }
        info!(tool_call_id = %self.scope.tool_call_id, mode = mode.as_str(), "csp mode changed");
        self.csp_mode = mode;
        self.violations.clear();
        self.close_bridge("csp-mode-changed").await;
        self.frame.close().await;
        self.stream.reset();
        self.reveal.reset();
        self.height = None;
        self.load().await;
    }

    /// Best-effort teardown. Frame traffic keeps flowing into the bridge
    /// until the guest acknowledges or the wait runs out.
    async fn close_bridge(&mut self, reason: &str) {
        let Some(mut bridge) = self.bridge.take() else {
            return;
        };
        let Some(mut ack) = bridge.teardown(reason) else {
            return;
        };
        let deadline = Instant::now() + self.settings.teardown_timeout;
        loop {
            tokio::select! {
                result = &mut ack => {
                    match result {
                        Ok(Ok(_)) => debug!(tool_call_id = %self.scope.tool_call_id, "teardown acknowledged"),
                        Ok(Err(error)) => debug!(tool_call_id = %self.scope.tool_call_id, "teardown rejected: {}", error.message),
                        Err(_) => debug!(tool_call_id = %self.scope.tool_call_id, "teardown abandoned"),
                    }
                    break;
                }
                Some(event) = self.frame.next_event() => {
                    if let FrameEvent::Message(raw) = event {
                        bridge.handle(raw).await;
                    }
                }
                _ = sleep_until(deadline) => {
                    debug!(tool_call_id = %self.scope.tool_call_id, "teardown acknowledgement timed out");
                    break;
                }
            }
        }
    }

    /// Closes the bridge and frame. Host-wide state keyed by the tool-call
    /// id is released by the manager, which knows whether a newer instance
    /// already owns that id.
    async fn shutdown(&mut self) -> WidgetSnapshot {
        self.close_bridge("unmount").await;
        self.frame.close().await;
        self.connect_deadline = None;
        self.context.display_mode = DisplayMode::Inline;
        self.set_status(WidgetStatus::Closed);
        info!(tool_call_id = %self.scope.tool_call_id, "widget unmounted");
        self.snapshot()
    }

    fn set_status(&mut self, status: WidgetStatus) {
        if self.status == status {
            return;
        }
        self.status = status.clone();
        self.emit(WidgetEventKind::Status { status });
    }

    fn emit(&self, kind: WidgetEventKind) {
        let _ = self.events.send(WidgetEvent {
            tool_call_id: self.scope.tool_call_id.clone(),
            kind,
        });
    }

    fn snapshot(&self) -> WidgetSnapshot {
        let content = self.content.as_ref();
        WidgetSnapshot {
            tool_call_id: self.scope.tool_call_id.clone(),
            server_id: self.scope.server_id.clone(),
            tool_name: self.tool_name.clone(),
            resource_uri: self.resource_uri.clone(),
            protocol: self.protocol,
            csp_mode: self.csp_mode,
            csp: content.and_then(|content| content.csp.clone()),
            permissions: content
                .map(|content| content.permissions.clone())
                .unwrap_or_default(),
            prefers_border: content.is_some_and(|content| content.prefers_border),
            mime_type_warning: content.and_then(|content| content.mime_type_warning.clone()),
            status: self.status.clone(),
            proxy_ready: self.frame.is_proxy_ready(),
            bridge_state: self.bridge.as_ref().map(BridgeClient::state),
            display_mode: self.context.display_mode,
            revealed: self.reveal.is_revealed(),
            height: self.height,
            lifecycle: self.lifecycle.state,
            violation_count: self.violations.len(),
        }
    }
}

struct WidgetHandle {
    generation: u64,
    commands: mpsc::Sender<Command>,
    /// Unset while the mount that reserved the id is still preparing it.
    task: Option<JoinHandle<()>>,
}

/// Owns every mounted widget, keyed by tool-call id.
pub(crate) struct WidgetManager {
    resolver: Arc<OriginResolver>,
    registry: Arc<GuestRegistry>,
    store: Arc<WidgetStore>,
    services: HostServices,
    location: Arc<LocationCache>,
    settings: WidgetSettings,
    events: broadcast::Sender<WidgetEvent>,
    widgets: Mutex<HashMap<String, WidgetHandle>>,
    next_generation: AtomicU64,
}

impl WidgetManager {
    pub(crate) fn new(
        resolver: Arc<OriginResolver>,
        registry: Arc<GuestRegistry>,
        store: Arc<WidgetStore>,
        services: HostServices,
        location: Arc<LocationCache>,
        settings: WidgetSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            resolver,
            registry,
            store,
            services,
            location,
            settings,
            events,
            widgets: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<WidgetEvent> {
        self.events.subscribe()
    }

    pub(crate) fn services(&self) -> &HostServices {
        &self.services
    }

    /// Mounts a widget. The sandbox origin is resolved first so a
    /// configuration error never leaves a frame behind. Mounting an id that
    /// is already live replaces the old instance; the id is reserved for this
    /// mount before the old instance is stopped, so concurrent mounts of one
    /// id resolve to exactly one live instance.
    pub(crate) async fn mount(&self, request: MountRequest) -> Result<WidgetSnapshot, WidgetError> {
        let sandbox_origin = self.resolver.sandbox_origin()?;
        if request.protocol == ProtocolVariant::Flat && !request.lifecycle.state.is_terminal() {
            return Err(WidgetError::illegal(
                "mount",
                "for flat widgets before tool output is available",
            ));
        }

        let tool_call_id = request.tool_call_id.clone();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let reservation = WidgetHandle {
            generation,
            commands: commands_tx.clone(),
            task: None,
        };
        let previous = match self.widgets.lock().await.entry(tool_call_id.clone()) {
            Entry::Occupied(mut slot) => Some(slot.insert(reservation)),
            Entry::Vacant(slot) => {
                slot.insert(reservation);
                None
            }
        };
        if let Some(previous) = previous {
            info!(%tool_call_id, "superseding mounted widget");
            stop(&tool_call_id, previous).await;
            let widgets = self.widgets.lock().await;
            if !is_current(&widgets, &tool_call_id, generation) {
                return Err(superseded(&tool_call_id));
            }
            self.services.arbiter.release(&tool_call_id).await;
            self.services.model_context.remove(&tool_call_id).await;
        }

        let mut context = HostContext {
            tool_info: ToolInfo {
                tool_call_id: request.tool_call_id.clone(),
                tool_name: request.tool_name.clone(),
            },
            locale: "en-US".to_string(),
            user_location: self.location.get().await,
            ..HostContext::default()
        };
        context.time_zone = context
            .user_location
            .as_ref()
            .and_then(|location| location.timezone.clone())
            .unwrap_or_else(|| "UTC".to_string());
        context.apply(request.context.clone());

        let stored = self
            .store
            .store(StoreWidgetRequest {
                server_id: request.server_id.clone(),
                resource_uri: request.resource_uri.clone(),
                output_template: request.output_template.clone(),
                tool_input: request.lifecycle.input.clone().unwrap_or(Value::Null),
                tool_output: request.lifecycle.output.clone().unwrap_or(Value::Null),
                tool_id: request.tool_call_id.clone(),
                tool_name: request.tool_name.clone(),
                theme: context.theme,
                csp_mode: request.csp_mode,
                locale: Some(context.locale.clone()),
                device_type: context.device_type,
                protocol: request.protocol,
            })
            .await;
        if let Err(error) = stored {
            self.abandon(&tool_call_id, generation).await;
            return Err(error);
        }

        let frame = OuterFrameController::new(
            &request.tool_call_id,
            self.resolver.host_origin(),
            &sandbox_origin,
            self.registry.clone(),
        );
        let runtime = WidgetRuntime {
            scope: WidgetScope {
                tool_call_id: request.tool_call_id.clone(),
                server_id: request.server_id,
            },
            tool_name: request.tool_name,
            resource_uri: request.resource_uri.or(request.output_template),
            protocol: request.protocol,
            csp_mode: request.csp_mode,
            sandbox: request.sandbox,
            tools: ToolCatalog::new(&request.tools),
            context,
            lifecycle: request.lifecycle,
            frame,
            bridge: None,
            stream: InputStreamController::new(self.settings.partial_input_interval),
            reveal: RevealGate::new(self.settings.reveal_timeout),
            content: None,
            status: WidgetStatus::Loading,
            height: None,
            violations: Vec::new(),
            connect_deadline: None,
            settings: self.settings,
            store: self.store.clone(),
            services: self.services.clone(),
            events: self.events.clone(),
            commands: commands_rx,
        };
        info!(
            tool_call_id = %request.tool_call_id,
            protocol = ?runtime.protocol,
            %sandbox_origin,
            "mounting widget"
        );
        let task = tokio::spawn(runtime.run());
        match self.widgets.lock().await.get_mut(&tool_call_id) {
            Some(handle) if handle.generation == generation => handle.task = Some(task),
            // A newer mount took the id and is stopping this runtime through
            // its command channel.
            _ => return Err(superseded(&tool_call_id)),
        }

        let (reply, response) = oneshot::channel();
        commands_tx
            .send(Command::Snapshot(reply))
            .await
            .map_err(|_| WidgetError::Connection(format!("widget {tool_call_id} stopped")))?;
        response
            .await
            .map_err(|_| WidgetError::Connection(format!("widget {tool_call_id} stopped")))
    }

    /// Drops a reservation that never got a runtime, unless a newer mount
    /// already replaced it.
    async fn abandon(&self, tool_call_id: &str, generation: u64) {
        let mut widgets = self.widgets.lock().await;
        if is_current(&widgets, tool_call_id, generation) {
            widgets.remove(tool_call_id);
        }
    }

    pub(crate) async fn lifecycle(
        &self,
        tool_call_id: &str,
        update: LifecycleUpdate,
    ) -> Result<WidgetSnapshot, WidgetError> {
        self.send(tool_call_id, |reply| Command::Lifecycle(update, reply))
            .await?
    }

    pub(crate) async fn host_context(
        &self,
        tool_call_id: &str,
        patch: HostContextPatch,
    ) -> Result<WidgetSnapshot, WidgetError> {
        self.send(tool_call_id, |reply| Command::HostContext(patch, reply))
            .await
    }

    pub(crate) async fn set_csp_mode(
        &self,
        tool_call_id: &str,
        mode: CspMode,
    ) -> Result<WidgetSnapshot, WidgetError> {
        self.send(tool_call_id, |reply| Command::CspMode(mode, reply))
            .await
    }

    pub(crate) async fn snapshot(&self, tool_call_id: &str) -> Result<WidgetSnapshot, WidgetError> {
        self.send(tool_call_id, Command::Snapshot).await
    }

    pub(crate) async fn violations(
        &self,
        tool_call_id: &str,
    ) -> Result<Vec<CspViolation>, WidgetError> {
        self.send(tool_call_id, Command::Violations).await
    }

    pub(crate) async fn unmount(&self, tool_call_id: &str) -> Result<WidgetSnapshot, WidgetError> {
        let handle = self
            .widgets
            .lock()
            .await
            .remove(tool_call_id)
            .ok_or_else(|| WidgetError::NotFound(tool_call_id.to_string()))?;

        let snapshot = stop(tool_call_id, handle).await;

        // Held while releasing so a concurrent mount cannot store its entry
        // in between and lose it.
        let widgets = self.widgets.lock().await;
        if !widgets.contains_key(tool_call_id) {
            self.services.arbiter.release(tool_call_id).await;
            self.services.model_context.remove(tool_call_id).await;
            self.store.remove(tool_call_id).await;
        }
        drop(widgets);

        snapshot.ok_or_else(|| WidgetError::Connection(format!("widget {tool_call_id} stopped")))
    }

    pub(crate) async fn mounted(&self) -> Vec<String> {
        let mut ids = self.widgets.lock().await.keys().cloned().collect::<Vec<_>>();
        ids.sort();
        ids
    }

    async fn send<T>(
        &self,
        tool_call_id: &str,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, WidgetError> {
        let sender = self
            .widgets
            .lock()
            .await
            .get(tool_call_id)
            .map(|handle| handle.commands.clone())
            .ok_or_else(|| WidgetError::NotFound(tool_call_id.to_string()))?;

        let (reply, response) = oneshot::channel();
        sender
            .send(command(reply))
            .await
            .map_err(|_| WidgetError::Connection(format!("widget {tool_call_id} stopped")))?;
        response
            .await
            .map_err(|_| WidgetError::Connection(format!("widget {tool_call_id} stopped")))
    }
}

/// Asks a runtime to shut down and waits for it.
async fn stop(tool_call_id: &str, handle: WidgetHandle) -> Option<WidgetSnapshot> {
    let (reply, response) = oneshot::channel();
    let snapshot = match handle.commands.send(Command::Unmount(reply)).await {
        Ok(()) => response.await.ok(),
        Err(_) => None,
    };
    if let Some(task) = handle.task {
        if let Err(error) = task.await {
            warn!(tool_call_id, "widget runtime ended abnormally: {error}");
        }
    }
    snapshot
}

fn is_current(
    widgets: &HashMap<String, WidgetHandle>,
    tool_call_id: &str,
    generation: u64,
) -> bool {
    widgets
        .get(tool_call_id)
        .is_some_and(|handle| handle.generation == generation)
}

fn superseded(tool_call_id: &str) -> WidgetError {
    WidgetError::illegal("mount", format!("of {tool_call_id} was superseded by a newer mount"))
}
