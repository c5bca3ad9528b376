//! Append-only record of bridge traffic and policy violations.
//!
//! Entries are kept in a bounded ring and fanned out live to subscribers
//! (the `/rpc` hub forwards them as `bridge/debug/entry` notifications).

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum Direction {
    HostToGuest,
    GuestToHost,
    Sandbox,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DebugEntry {
    pub(crate) seq: u64,
    pub(crate) at: DateTime<Utc>,
    pub(crate) widget_id: String,
    pub(crate) direction: Direction,
    pub(crate) label: String,
    pub(crate) payload: Value,
}

pub(crate) struct DebugSink {
    capacity: usize,
    next_seq: AtomicU64,
    entries: Mutex<VecDeque<DebugEntry>>,
    live: broadcast::Sender<DebugEntry>,
}

impl DebugSink {
    pub(crate) fn new(capacity: usize) -> Self {
        let (live, _) = broadcast::channel(256);
        Self {
            capacity: capacity.max(1),
            next_seq: AtomicU64::new(1),
            entries: Mutex::new(VecDeque::new()),
            live,
        }
    }

    pub(crate) fn record(
        &self,
        widget_id: &str,
        direction: Direction,
        label: impl Into<String>,
        payload: Value,
    ) {
        let entry = DebugEntry {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            at: Utc::now(),
            widget_id: widget_id.to_string(),
            direction,
            label: label.into(),
            payload,
        };

        {
            let mut entries = self
                .entries
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry.clone());
        }

        let _ = self.live.send(entry);
    }

    /// Most recent entries, oldest first, optionally for one widget.
    pub(crate) fn entries(&self, widget_id: Option<&str>, limit: usize) -> Vec<DebugEntry> {
        let entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut selected = entries
            .iter()
            .rev()
            .filter(|entry| widget_id.is_none() || widget_id == Some(entry.widget_id.as_str()))
            .take(limit)
            .cloned()
            .collect::<Vec<_>>();
        selected.reverse();
        selected
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<DebugEntry> {
        self.live.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keeps_only_the_newest_entries() {
        let sink = DebugSink::new(3);
        for n in 0..5 {
            sink.record("call-1", Direction::HostToGuest, "ping", json!({ "n": n }));
        }
        let entries = sink.entries(None, 10);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].payload["n"], 2);
        assert_eq!(entries[2].payload["n"], 4);
        assert!(entries.windows(2).all(|pair| pair[0].seq < pair[1].seq));
    }

    #[test]
    fn filters_by_widget_and_limit() {
        let sink = DebugSink::new(10);
        sink.record("call-1", Direction::GuestToHost, "tools/call", json!(1));
        sink.record("call-2", Direction::Sandbox, "sandbox-csp-violation", json!(2));
        sink.record("call-1", Direction::HostToGuest, "result", json!(3));

        let entries = sink.entries(Some("call-1"), 1);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].payload, json!(3));
        assert_eq!(sink.entries(Some("call-2"), 10)[0].direction, Direction::Sandbox);
    }

    #[tokio::test]
    async fn subscribers_see_live_entries() {
        let sink = DebugSink::new(4);
        let mut live = sink.subscribe();
        sink.record("call-1", Direction::GuestToHost, "ui/initialize", json!({}));
        let entry = live.recv().await.expect("live entry");
        assert_eq!(entry.label, "ui/initialize");

        let value = serde_json::to_value(&entry).expect("serialize");
        assert_eq!(value["direction"], "guest-to-host");
        assert_eq!(value["widgetId"], "call-1");
    }
}
