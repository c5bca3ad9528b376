//! The relay that lives at the sandbox origin.
//!
//! The proxy never interprets bridge traffic. It takes exactly one resource
//! delivery from its parent, turns it into a guest document with the
//! restriction policy baked in, and from then on shuttles messages between
//! parent and guest unchanged.

use std::{collections::HashMap, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::{
    sync::{Mutex, Notify, RwLock},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};

use super::{
    csp::{
        build_allow_attribute, build_policy, sanitize_sandbox, CspViolation, WidgetCsp,
        WidgetPermissions,
    },
    frame::{Mailbox, WindowHandle, OPAQUE_ORIGIN},
};

pub(crate) const PROXY_READY_METHOD: &str = "sandbox-proxy-ready";
pub(crate) const RESOURCE_READY_METHOD: &str = "sandbox-resource-ready";
pub(crate) const CSP_VIOLATION_METHOD: &str = "sandbox-csp-violation";

const VIOLATION_LISTENER: &str = "<script>(function(){document.addEventListener(\"securitypolicyviolation\",function(e){try{window.parent.postMessage({method:\"sandbox-csp-violation\",params:{directive:e.violatedDirective,effectiveDirective:e.effectiveDirective,blockedUri:e.blockedURI,sourceFile:e.sourceFile,lineNumber:e.lineNumber,columnNumber:e.columnNumber,timestamp:Date.now()}},\"*\")}catch(_){}})})();</script>";

/// Payload of the one-shot `sandbox-resource-ready` delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SandboxResource {
    pub(crate) html: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) sandbox: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) csp: Option<WidgetCsp>,
    #[serde(default)]
    pub(crate) permissions: WidgetPermissions,
    #[serde(default)]
    pub(crate) permissive: bool,
}

impl SandboxResource {
    /// Permissive resources never carry a declared policy; its absence is what
    /// marks the guest as unrestricted.
    pub(crate) fn new(
        html: String,
        sandbox: Option<String>,
        csp: Option<WidgetCsp>,
        permissions: WidgetPermissions,
        permissive: bool,
    ) -> Self {
        Self {
            html,
            sandbox,
            csp: if permissive {
                None
            } else {
                Some(csp.unwrap_or_default())
            },
            permissions,
            permissive,
        }
    }

    pub(crate) fn into_message(self) -> Value {
        json!({
            "method": RESOURCE_READY_METHOD,
            "params": self,
        })
    }
}

/// The rendered guest document and the attributes its frame is created with.
#[derive(Debug, Clone)]
pub(crate) struct GuestDocument {
    pub(crate) document: String,
    pub(crate) policy: String,
    pub(crate) sandbox: String,
    pub(crate) allow: String,
    pub(crate) origin: String,
}

/// The guest end of a proxy relay: the guest's own window plus its parent.
#[derive(Debug)]
pub(crate) struct GuestChannel {
    pub(crate) window: WindowHandle,
    pub(crate) mailbox: Mailbox,
    pub(crate) parent: WindowHandle,
}

impl GuestChannel {
    pub(crate) fn post_to_parent(&self, data: Value) -> bool {
        self.parent.post_message(&self.window, data, "*")
    }
}

/// Hands guest frames created by proxies to whoever renders them.
#[derive(Default)]
pub(crate) struct GuestRegistry {
    documents: RwLock<HashMap<String, GuestDocument>>,
    channels: Mutex<HashMap<String, GuestChannel>>,
    published: Notify,
}

impl GuestRegistry {
    pub(crate) async fn publish(&self, key: &str, document: GuestDocument, channel: GuestChannel) {
        self.documents
            .write()
            .await
            .insert(key.to_string(), document);
        self.channels.lock().await.insert(key.to_string(), channel);
        self.published.notify_waiters();
    }

    pub(crate) async fn document(&self, key: &str) -> Option<GuestDocument> {
        self.documents.read().await.get(key).cloned()
    }

    /// Takes the guest channel for `key`, waiting up to `wait` for a proxy to publish it.
    pub(crate) async fn claim(&self, key: &str, wait: Duration) -> Option<GuestChannel> {
        let deadline = Instant::now() + wait;
        loop {
            let published = self.published.notified();
            if let Some(channel) = self.channels.lock().await.remove(key) {
                return Some(channel);
            }
            if tokio::time::timeout_at(deadline, published).await.is_err() {
                return None;
            }
        }
    }

    pub(crate) async fn remove(&self, key: &str) {
        self.documents.write().await.remove(key);
        self.channels.lock().await.remove(key);
    }
}

pub(crate) struct SandboxProxy {
    key: String,
    window: WindowHandle,
    mailbox: Mailbox,
    parent: WindowHandle,
    registry: Arc<GuestRegistry>,
    guest: Option<WindowHandle>,
}

impl SandboxProxy {
    /// Opens a proxy window at `sandbox_origin` and starts relaying for `parent`.
    pub(crate) fn spawn(
        key: &str,
        sandbox_origin: &str,
        parent: WindowHandle,
        registry: Arc<GuestRegistry>,
    ) -> (WindowHandle, JoinHandle<()>) {
        let (window, mailbox) = WindowHandle::open(sandbox_origin);
        let proxy = Self {
            key: key.to_string(),
            window: window.clone(),
            mailbox,
            parent,
            registry,
            guest: None,
        };
        (window, tokio::spawn(proxy.run()))
    }

    async fn run(mut self) {
        self.parent.post_message(
            &self.window,
            json!({ "method": PROXY_READY_METHOD }),
            self.parent.origin(),
        );

        while let Some(event) = self.mailbox.recv().await {
            if event.source == self.parent.id() && event.origin == self.parent.origin() {
                self.handle_parent_message(event.data).await;
            } else if self
                .guest
                .as_ref()
                .is_some_and(|guest| guest.id() == event.source)
            {
                self.handle_guest_message(event.data);
            } else {
                debug!(key = %self.key, origin = %event.origin, "ignoring message from unknown source");
            }
        }
    }

    async fn handle_parent_message(&mut self, data: Value) {
        match method_of(&data) {
            Some(RESOURCE_READY_METHOD) => {
                if self.guest.is_some() {
                    warn!(key = %self.key, "ignoring repeated resource delivery");
                    return;
                }
                let params = data.get("params").cloned().unwrap_or(Value::Null);
                match serde_json::from_value::<SandboxResource>(params) {
                    Ok(resource) => self.load(resource).await,
                    Err(error) => warn!(key = %self.key, "invalid resource delivery: {error}"),
                }
            }
            Some(PROXY_READY_METHOD) => {}
            _ => match &self.guest {
                Some(guest) => {
                    guest.post_message(&self.window, data, "*");
                }
                None => debug!(key = %self.key, "dropping message sent before guest exists"),
            },
        }
    }

    fn handle_guest_message(&self, data: Value) {
        match method_of(&data) {
            Some(CSP_VIOLATION_METHOD) => {
                let Some(violation) =
                    CspViolation::from_guest(data.get("params").unwrap_or(&Value::Null))
                else {
                    debug!(key = %self.key, "dropping malformed violation report");
                    return;
                };
                self.parent.post_message(
                    &self.window,
                    json!({ "method": CSP_VIOLATION_METHOD, "params": violation }),
                    self.parent.origin(),
                );
            }
            Some(PROXY_READY_METHOD) | Some(RESOURCE_READY_METHOD) => {}
            _ => {
                self.parent
                    .post_message(&self.window, data, self.parent.origin());
            }
        }
    }

    async fn load(&mut self, resource: SandboxResource) {
        let policy = build_policy(resource.csp.as_ref(), resource.permissive);
        let sandbox = sanitize_sandbox(resource.sandbox.as_deref());
        let allow = build_allow_attribute(&resource.permissions);
        let origin = if sandbox
            .split_whitespace()
            .any(|token| token == "allow-same-origin")
        {
            self.window.origin().to_string()
        } else {
            OPAQUE_ORIGIN.to_string()
        };

        let (guest, mailbox) = WindowHandle::open(origin.clone());
        let document = GuestDocument {
            document: inject_policy(&resource.html, &policy),
            policy,
            sandbox,
            allow,
            origin,
        };
        let channel = GuestChannel {
            window: guest.clone(),
            mailbox,
            parent: self.window.clone(),
        };

        info!(
            key = %self.key,
            permissive = resource.permissive,
            "guest frame created"
        );
        self.registry.publish(&self.key, document, channel).await;
        self.guest = Some(guest);
    }
}

pub(crate) fn method_of(value: &Value) -> Option<&str> {
    value.get("method").and_then(Value::as_str)
}

/// Inserts the policy tag and violation listener at the very top of `<head>`.
pub(crate) fn inject_policy(html: &str, policy: &str) -> String {
    let tags = format!(
        "<meta http-equiv=\"Content-Security-Policy\" content=\"{}\">{VIOLATION_LISTENER}",
        escape_attribute(policy)
    );
    let lower = html.to_ascii_lowercase();

    if let Some(end) = open_tag_end(&lower, "<head") {
        return format!("{}{tags}{}", &html[..end], &html[end..]);
    }
    if let Some(end) = open_tag_end(&lower, "<html") {
        return format!("{}<head>{tags}</head>{}", &html[..end], &html[end..]);
    }
    let start = doctype_end(&lower);
    format!("{}<head>{tags}</head>{}", &html[..start], &html[start..])
}

/// Byte offset just past a leading `<!doctype ...>`, or 0. Keeps the guest
/// out of quirks mode when a head has to be synthesized.
fn doctype_end(lower: &str) -> usize {
    let body = lower.trim_start();
    let leading = lower.len() - body.len();
    if !body.starts_with("<!doctype") {
        return 0;
    }
    body.find('>').map_or(0, |close| leading + close + 1)
}

fn open_tag_end(lower: &str, tag: &str) -> Option<usize> {
    let mut offset = 0;
    while let Some(found) = lower[offset..].find(tag) {
        let after = offset + found + tag.len();
        match lower.as_bytes().get(after) {
            Some(b'>' | b' ' | b'\t' | b'\n' | b'\r' | b'/') => {
                return lower[after..].find('>').map(|close| after + close + 1);
            }
            _ => offset = after,
        }
    }
    None
}

fn escape_attribute(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
