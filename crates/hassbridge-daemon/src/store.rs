//! In-memory state store fed by the source connection.

use hassbridge_core::{Metadata, Snapshot};
use hassbridge_plugin::{PluginStarted, Runtime};
use serde_json::{Value, json};
use std::collections::HashMap;
use tokio::sync::{RwLock, broadcast};

#[derive(Debug, Default)]
struct NamespaceState {
    online: bool,
    metadata: Option<Metadata>,
    entities: Snapshot,
}

/// Entity states per namespace, plus a feed of everything that changes.
pub struct StateStore {
    namespaces: RwLock<HashMap<String, NamespaceState>>,
    events: broadcast::Sender<Value>,
}

impl StateStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            namespaces: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Receive every stream message produced by the store.
    pub fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.events.subscribe()
    }

    pub async fn entity(&self, namespace: &str, entity_id: &str) -> Option<Value> {
        self.namespaces
            .read()
            .await
            .get(namespace)
            .and_then(|ns| ns.entities.get(entity_id).cloned())
    }

    pub async fn entities(&self, namespace: &str) -> Option<Snapshot> {
        self.namespaces
            .read()
            .await
            .get(namespace)
            .map(|ns| ns.entities.clone())
    }

    pub async fn metadata(&self, namespace: &str) -> Option<Metadata> {
        self.namespaces
            .read()
            .await
            .get(namespace)
            .and_then(|ns| ns.metadata.clone())
    }

    pub async fn is_online(&self, namespace: &str) -> bool {
        self.namespaces
            .read()
            .await
            .get(namespace)
            .is_some_and(|ns| ns.online)
    }

    fn publish(&self, message: Value) {
        // No subscribers just means no dashboards are connected.
        let _ = self.events.send(message);
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply a `state_changed` event to the entity map. Other events leave the
/// map alone.
fn apply_event(entities: &mut Snapshot, event: &Value) {
    if event.get("event_type").and_then(Value::as_str) != Some("state_changed") {
        return;
    }
    let data = &event["data"];
    let Some(entity_id) = data.get("entity_id").and_then(Value::as_str) else {
        return;
    };
    match data.get("new_state") {
        Some(Value::Null) | None => {
            entities.remove(entity_id);
        }
        Some(state) => {
            entities.insert(entity_id, state.clone());
        }
    }
}

impl Runtime for StateStore {
    async fn plugin_started(&self, started: PluginStarted) {
        if started.first_time {
            tracing::info!(
                "{}: started, namespace {} with {} entities",
                started.name,
                started.namespace,
                started.snapshot.len()
            );
        } else {
            tracing::info!(
                "{}: reconnected, namespace {} with {} entities",
                started.name,
                started.namespace,
                started.snapshot.len()
            );
        }

        self.namespaces.write().await.insert(
            started.namespace.clone(),
            NamespaceState {
                online: true,
                metadata: Some(started.metadata),
                entities: started.snapshot,
            },
        );
        self.publish(json!({
            "response_type": "plugin_started",
            "namespace": started.namespace,
        }));
    }

    async fn plugin_stopped(&self, name: &str, namespace: &str) {
        tracing::warn!("{}: stopped, namespace {} offline", name, namespace);
        if let Some(ns) = self.namespaces.write().await.get_mut(namespace) {
            ns.online = false;
        }
        self.publish(json!({
            "response_type": "plugin_stopped",
            "namespace": namespace,
        }));
    }

    async fn state_update(&self, namespace: &str, event: Value) {
        {
            let mut namespaces = self.namespaces.write().await;
            let ns = namespaces.entry(namespace.to_string()).or_default();
            apply_event(&mut ns.entities, &event);
        }
        self.publish(json!({
            "response_type": "event",
            "namespace": namespace,
            "data": event,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(first_time: bool) -> PluginStarted {
        PluginStarted {
            name: "HASS".into(),
            namespace: "default".into(),
            metadata: Metadata::validate(json!({
                "latitude": 1, "longitude": 2, "elevation": 3, "time_zone": "UTC"
            }))
            .unwrap(),
            snapshot: Snapshot::from_value(json!([
                {"entity_id": "light.kitchen", "state": "off"},
                {"entity_id": "sensor.temp", "state": "20"}
            ]))
            .unwrap(),
            first_time,
        }
    }

    fn changed(entity_id: &str, new_state: Value) -> Value {
        json!({
            "event_type": "state_changed",
            "data": {"entity_id": entity_id, "new_state": new_state}
        })
    }

    #[tokio::test]
    async fn start_replaces_snapshot() {
        let store = StateStore::new();
        store.plugin_started(started(true)).await;

        assert!(store.is_online("default").await);
        assert_eq!(store.entities("default").await.unwrap().len(), 2);
        assert_eq!(store.metadata("default").await.unwrap().elevation(), 3.0);
        assert!(store.entity("other", "light.kitchen").await.is_none());
    }

    #[tokio::test]
    async fn state_changed_updates_and_removes() {
        let store = StateStore::new();
        store.plugin_started(started(true)).await;

        let on = json!({"entity_id": "light.kitchen", "state": "on"});
        store
            .state_update("default", changed("light.kitchen", on.clone()))
            .await;
        store
            .state_update("default", changed("sensor.temp", Value::Null))
            .await;
        store
            .state_update("default", json!({"event_type": "call_service", "data": {}}))
            .await;

        assert_eq!(store.entity("default", "light.kitchen").await, Some(on));
        assert_eq!(store.entity("default", "sensor.temp").await, None);
        assert_eq!(store.entities("default").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn events_are_published() {
        let store = StateStore::new();
        let mut rx = store.subscribe();

        let event = changed("switch.fan", json!({"state": "on"}));
        store.state_update("default", event.clone()).await;
        store.plugin_stopped("HASS", "default").await;

        assert_eq!(
            rx.recv().await.unwrap(),
            json!({"response_type": "event", "namespace": "default", "data": event})
        );
        assert_eq!(rx.recv().await.unwrap()["response_type"], "plugin_stopped");
        assert!(!store.is_online("default").await);
    }
}
