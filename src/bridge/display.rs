use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tracing::info;

use super::{DisplayMode, HostContext};

/// A widget whose display mode was changed by someone else's grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DisplayChange {
    pub(crate) tool_call_id: String,
    pub(crate) mode: DisplayMode,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DisplayHolders {
    pub(crate) pip: Option<String>,
    pub(crate) fullscreen: Option<String>,
}

/// Host-wide owner of the pip and fullscreen slots.
pub(crate) struct DisplayModeArbiter {
    holders: Mutex<DisplayHolders>,
    changes: broadcast::Sender<DisplayChange>,
}

impl DisplayModeArbiter {
    pub(crate) fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            holders: Mutex::new(DisplayHolders::default()),
            changes,
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<DisplayChange> {
        self.changes.subscribe()
    }

    /// Decides what `tool_call_id` actually gets for `requested`.
    pub(crate) async fn request(
        &self,
        tool_call_id: &str,
        requested: DisplayMode,
        context: &HostContext,
    ) -> DisplayMode {
        let granted = if requested == DisplayMode::Pip && context.is_touch_first() {
            DisplayMode::Fullscreen
        } else {
            requested
        };

        let displaced = {
            let mut holders = self.holders.lock().await;
            let displaced = match granted {
                DisplayMode::Inline => None,
                DisplayMode::Pip => holders.pip.replace(tool_call_id.to_string()),
                DisplayMode::Fullscreen => holders.fullscreen.replace(tool_call_id.to_string()),
            };
            if granted != DisplayMode::Pip && holders.pip.as_deref() == Some(tool_call_id) {
                holders.pip = None;
            }
            if granted != DisplayMode::Fullscreen
                && holders.fullscreen.as_deref() == Some(tool_call_id)
            {
                holders.fullscreen = None;
            }
            displaced.filter(|previous| previous != tool_call_id)
        };

        info!(tool_call_id, ?requested, ?granted, "display mode arbitrated");
        if let Some(previous) = displaced {
            let _ = self.changes.send(DisplayChange {
                tool_call_id: previous,
                mode: DisplayMode::Inline,
            });
        }
        granted
    }

    pub(crate) async fn release(&self, tool_call_id: &str) {
        let mut holders = self.holders.lock().await;
        if holders.pip.as_deref() == Some(tool_call_id) {
            holders.pip = None;
        }
        if holders.fullscreen.as_deref() == Some(tool_call_id) {
            holders.fullscreen = None;
        }
    }

    pub(crate) async fn mode_of(&self, tool_call_id: &str) -> DisplayMode {
        let holders = self.holders.lock().await;
        if holders.fullscreen.as_deref() == Some(tool_call_id) {
            DisplayMode::Fullscreen
        } else if holders.pip.as_deref() == Some(tool_call_id) {
            DisplayMode::Pip
        } else {
            DisplayMode::Inline
        }
    }

    pub(crate) async fn holders(&self) -> DisplayHolders {
        self.holders.lock().await.clone()
    }
}
