//! Window and message-event model shared by the host, proxy and guest contexts.
//!
//! Each context owns a [`Mailbox`]; peers hold cloned [`WindowHandle`]s and
//! post JSON values to it. Delivery follows `postMessage` rules: the receiver
//! sees the sender's origin and window id, and a message addressed to a
//! different origin is silently dropped.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::trace;

static NEXT_WINDOW_ID: AtomicU64 = AtomicU64::new(1);

/// Origin carried by documents without a tuple origin (sandboxed without
/// `allow-same-origin`).
pub(crate) const OPAQUE_ORIGIN: &str = "null";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct WindowId(u64);

#[derive(Debug, Clone)]
pub(crate) struct MessageEvent {
    pub(crate) origin: String,
    pub(crate) source: WindowId,
    pub(crate) data: Value,
}

#[derive(Debug, Clone)]
pub(crate) struct WindowHandle {
    id: WindowId,
    origin: String,
    inbox: mpsc::UnboundedSender<MessageEvent>,
}

#[derive(Debug)]
pub(crate) struct Mailbox {
    rx: mpsc::UnboundedReceiver<MessageEvent>,
}

impl WindowHandle {
    pub(crate) fn open(origin: impl Into<String>) -> (Self, Mailbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            id: WindowId(NEXT_WINDOW_ID.fetch_add(1, Ordering::Relaxed)),
            origin: origin.into(),
            inbox: tx,
        };
        (handle, Mailbox { rx })
    }

    pub(crate) fn id(&self) -> WindowId {
        self.id
    }

    pub(crate) fn origin(&self) -> &str {
        &self.origin
    }

    /// Posts `data` to this window on behalf of `sender`.
    ///
    /// Returns `false` when the message was dropped, either because
    /// `target_origin` does not match or because the window is gone.
    pub(crate) fn post_message(&self, sender: &WindowHandle, data: Value, target_origin: &str) -> bool {
        if target_origin != "*" && (target_origin != self.origin || self.origin == OPAQUE_ORIGIN) {
            trace!(
                target_origin,
                origin = %self.origin,
                "dropping message addressed to another origin"
            );
            return false;
        }

        self.inbox
            .send(MessageEvent {
                origin: sender.origin.clone(),
                source: sender.id,
                data,
            })
            .is_ok()
    }
}

impl Mailbox {
    pub(crate) async fn recv(&mut self) -> Option<MessageEvent> {
        self.rx.recv().await
    }

    #[cfg(test)]
    pub(crate) fn try_recv(&mut self) -> Option<MessageEvent> {
        self.rx.try_recv().ok()
    }
}
