use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{
    csp::CspViolation,
    frame::{Mailbox, WindowHandle},
    proxy::{
        method_of, GuestRegistry, SandboxProxy, SandboxResource, CSP_VIOLATION_METHOD,
        PROXY_READY_METHOD,
    },
};

/// Verified traffic arriving from the outer frame.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum FrameEvent {
    ProxyReady,
    Violation(CspViolation),
    Message(Value),
}

/// Host-side sending half of the outer frame, handed to the bridge client.
#[derive(Debug, Clone)]
pub(crate) struct FramePort {
    host: WindowHandle,
    frame: WindowHandle,
    target_origin: String,
}

impl FramePort {
    pub(crate) fn post(&self, data: Value) -> bool {
        self.frame.post_message(&self.host, data, &self.target_origin)
    }

    /// A port whose far end is a bare mailbox instead of a proxy.
    #[cfg(test)]
    pub(crate) fn loopback(sandbox_origin: &str) -> (Self, Mailbox) {
        let (host, _) = WindowHandle::open("http://localhost:6274");
        let (frame, mailbox) = WindowHandle::open(sandbox_origin);
        let port = Self {
            host,
            frame,
            target_origin: sandbox_origin.to_string(),
        };
        (port, mailbox)
    }
}

/// Owns the frame that points at the sandbox proxy.
pub(crate) struct OuterFrameController {
    key: String,
    sandbox_origin: String,
    host: WindowHandle,
    mailbox: Mailbox,
    registry: Arc<GuestRegistry>,
    frame: Option<WindowHandle>,
    proxy_task: Option<JoinHandle<()>>,
    proxy_ready: bool,
    resource: Option<SandboxResource>,
    delivered: bool,
}

impl OuterFrameController {
    pub(crate) fn new(
        key: &str,
        host_origin: &str,
        sandbox_origin: &str,
        registry: Arc<GuestRegistry>,
    ) -> Self {
        let (host, mailbox) = WindowHandle::open(host_origin);
        Self {
            key: key.to_string(),
            sandbox_origin: sandbox_origin.to_string(),
            host,
            mailbox,
            registry,
            frame: None,
            proxy_task: None,
            proxy_ready: false,
            resource: None,
            delivered: false,
        }
    }

    pub(crate) fn is_proxy_ready(&self) -> bool {
        self.proxy_ready
    }

    pub(crate) fn port(&self) -> Option<FramePort> {
        self.frame.as_ref().map(|frame| FramePort {
            host: self.host.clone(),
            frame: frame.clone(),
            target_origin: self.sandbox_origin.clone(),
        })
    }

    /// Records the markup and policy to deliver. Only a change in any of them
    /// reloads the proxy; an identical resource is a no-op.
    pub(crate) async fn set_resource(&mut self, resource: SandboxResource) -> bool {
        if self.resource.as_ref() == Some(&resource) {
            return false;
        }
        self.resource = Some(resource);
        self.reload().await;
        true
    }

    /// Replaces the proxy with a fresh instance. A loaded document cannot have
    /// its policy changed, so every reload starts from an empty frame.
    pub(crate) async fn reload(&mut self) {
        self.close().await;
        let (frame, task) = SandboxProxy::spawn(
            &self.key,
            &self.sandbox_origin,
            self.host.clone(),
            self.registry.clone(),
        );
        self.frame = Some(frame);
        self.proxy_task = Some(task);
    }

    pub(crate) async fn close(&mut self) {
        if let Some(task) = self.proxy_task.take() {
            task.abort();
        }
        self.frame = None;
        self.proxy_ready = false;
        self.delivered = false;
        self.registry.remove(&self.key).await;
    }

    /// Waits for the next message from the current frame, dropping anything
    /// that does not come from it at the sandbox origin.
    pub(crate) async fn next_event(&mut self) -> Option<FrameEvent> {
        loop {
            let event = self.mailbox.recv().await?;
            let from_frame = self
                .frame
                .as_ref()
                .is_some_and(|frame| frame.id() == event.source);
            if !from_frame || event.origin != self.sandbox_origin {
                debug!(key = %self.key, origin = %event.origin, "rejecting message from unexpected source");
                continue;
            }

            match method_of(&event.data) {
                Some(PROXY_READY_METHOD) => {
                    self.proxy_ready = true;
                    self.deliver();
                    return Some(FrameEvent::ProxyReady);
                }
                Some(CSP_VIOLATION_METHOD) => {
                    let params = event.data.get("params").cloned().unwrap_or(Value::Null);
                    match serde_json::from_value::<CspViolation>(params) {
                        Ok(violation) => return Some(FrameEvent::Violation(violation)),
                        Err(error) => warn!(key = %self.key, "malformed violation record: {error}"),
                    }
                }
                _ => return Some(FrameEvent::Message(event.data)),
            }
        }
    }

    fn deliver(&mut self) {
        if self.delivered || !self.proxy_ready {
            return;
        }
        let (Some(frame), Some(resource)) = (&self.frame, &self.resource) else {
            return;
        };
        self.delivered =
            frame.post_message(&self.host, resource.clone().into_message(), &self.sandbox_origin);
    }
}

impl Drop for OuterFrameController {
    fn drop(&mut self) {
        if let Some(task) = self.proxy_task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::csp::{WidgetCsp, WidgetPermissions};
    use serde_json::json;
    use std::time::Duration;

    const HOST: &str = "http://localhost:6274";
    const SANDBOX: &str = "http://127.0.0.1:6274";

    fn resource(html: &str) -> SandboxResource {
        SandboxResource::new(
            html.to_string(),
            None,
            Some(WidgetCsp::default()),
            WidgetPermissions::default(),
            false,
        )
    }

    #[tokio::test]
    async fn delivers_resource_once_proxy_is_ready() {
        let registry = Arc::new(GuestRegistry::default());
        let mut controller = OuterFrameController::new("call-1", HOST, SANDBOX, registry.clone());
        assert!(controller.port().is_none());

        assert!(controller.set_resource(resource("<p>one</p>")).await);
        assert!(!controller.is_proxy_ready());
        assert_eq!(controller.next_event().await, Some(FrameEvent::ProxyReady));
        assert!(controller.is_proxy_ready());

        let guest = registry
            .claim("call-1", Duration::from_secs(1))
            .await
            .expect("guest created");
        let document = registry.document("call-1").await.expect("document");
        assert!(document.document.contains("<p>one</p>"));

        assert!(!controller.set_resource(resource("<p>one</p>")).await);

        guest.post_to_parent(json!({ "jsonrpc": "2.0", "method": "ui/notifications/initialized" }));
        assert_eq!(
            controller.next_event().await,
            Some(FrameEvent::Message(
                json!({ "jsonrpc": "2.0", "method": "ui/notifications/initialized" })
            ))
        );
    }

    #[tokio::test]
    async fn changed_resource_reloads_a_fresh_proxy() {
        let registry = Arc::new(GuestRegistry::default());
        let mut controller = OuterFrameController::new("call-1", HOST, SANDBOX, registry.clone());
        controller.set_resource(resource("<p>one</p>")).await;
        controller.next_event().await;
        let first_port = controller.port().expect("port");

        assert!(controller.set_resource(resource("<p>two</p>")).await);
        assert!(!controller.is_proxy_ready());
        assert_eq!(controller.next_event().await, Some(FrameEvent::ProxyReady));

        registry
            .claim("call-1", Duration::from_secs(1))
            .await
            .expect("second guest");
        let document = registry.document("call-1").await.expect("document");
        assert!(document.document.contains("<p>two</p>"));

        let second_port = controller.port().expect("port");
        assert_ne!(first_port.frame.id(), second_port.frame.id());
    }

    #[tokio::test]
    async fn rejects_messages_from_other_windows_or_origins() {
        let registry = Arc::new(GuestRegistry::default());
        let mut controller = OuterFrameController::new("call-1", HOST, SANDBOX, registry);
        controller.set_resource(resource("<p></p>")).await;
        controller.next_event().await;

        let host = controller.host.clone();
        let (spoof_same_origin, _a) = WindowHandle::open(SANDBOX);
        let (spoof_host_origin, _b) = WindowHandle::open(HOST);
        host.post_message(&spoof_same_origin, json!({ "method": "spoofed" }), HOST);
        host.post_message(&spoof_host_origin, json!({ "method": "spoofed" }), HOST);

        let result = tokio::time::timeout(Duration::from_millis(50), controller.next_event()).await;
        assert!(result.is_err(), "spoofed messages must not surface");
    }
}
