use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;

/// Latest model context a widget asked to contribute to the next model turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ModelContextEntry {
    pub(crate) tool_call_id: String,
    pub(crate) context: Value,
    pub(crate) updated_at: DateTime<Utc>,
}

#[derive(Default)]
pub(crate) struct ModelContextStore {
    entries: RwLock<HashMap<String, ModelContextEntry>>,
}

impl ModelContextStore {
    /// Replaces any earlier context from the same widget.
    pub(crate) async fn set(&self, tool_call_id: &str, context: Value) {
        self.entries.write().await.insert(
            tool_call_id.to_string(),
            ModelContextEntry {
                tool_call_id: tool_call_id.to_string(),
                context,
                updated_at: Utc::now(),
            },
        );
    }

    pub(crate) async fn get(&self, tool_call_id: &str) -> Option<ModelContextEntry> {
        self.entries.read().await.get(tool_call_id).cloned()
    }

    pub(crate) async fn remove(&self, tool_call_id: &str) {
        self.entries.write().await.remove(tool_call_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn later_context_overwrites_earlier() {
        let store = ModelContextStore::default();
        store.set("call-1", json!({ "selected": 1 })).await;
        store.set("call-1", json!({ "selected": 2 })).await;
        store.set("call-2", json!({ "selected": 9 })).await;

        let entry = store.get("call-1").await.expect("entry");
        assert_eq!(entry.context, json!({ "selected": 2 }));

        store.remove("call-1").await;
        assert!(store.get("call-1").await.is_none());
        assert!(store.get("call-2").await.is_some());
    }
}
