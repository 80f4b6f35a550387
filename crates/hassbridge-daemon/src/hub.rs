//! Dashboard-facing side of the daemon.

use crate::store::StateStore;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use hassbridge_plugin::HassClient;
use hassbridge_stream::{ClientSession, SessionHandler, StreamHub};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

/// Requests a dashboard client can make.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "request_type", rename_all = "snake_case")]
pub enum Request {
    /// One entity, or every entity when `entity_id` is absent.
    GetState {
        #[serde(default = "default_namespace")]
        namespace: String,
        entity_id: Option<String>,
    },
    /// Location and version details reported by the source.
    GetMetadata {
        #[serde(default = "default_namespace")]
        namespace: String,
    },
    /// Best-effort service call against the source.
    CallService {
        service: String,
        #[serde(default)]
        data: Value,
    },
}

fn default_namespace() -> String {
    "default".to_string()
}

pub struct DashboardHub {
    store: Arc<StateStore>,
    client: HassClient,
}

impl DashboardHub {
    pub fn new(store: Arc<StateStore>, client: HassClient) -> Self {
        Self { store, client }
    }
}

impl StreamHub for DashboardHub {
    fn on_connect(&self, session: ClientSession) -> BoxFuture<'_, Arc<dyn SessionHandler>> {
        async move {
            let stop = CancellationToken::new();
            tokio::spawn(forward_events(
                session.clone(),
                self.store.subscribe(),
                stop.clone(),
            ));
            Arc::new(DashboardSession {
                session,
                store: self.store.clone(),
                client: self.client.clone(),
                stop,
            }) as Arc<dyn SessionHandler>
        }
        .boxed()
    }
}

/// Push store events to one session until it goes away.
async fn forward_events(
    session: ClientSession,
    mut events: tokio::sync::broadcast::Receiver<Value>,
    stop: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            () = stop.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(event) => {
                if !session.send(&event).await {
                    break;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!("{}: client too slow, skipped {} events", session.id(), skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

struct DashboardSession {
    session: ClientSession,
    store: Arc<StateStore>,
    client: HassClient,
    stop: CancellationToken,
}

impl DashboardSession {
    async fn handle(&self, request: Request) -> Value {
        match request {
            Request::GetState {
                namespace,
                entity_id: Some(entity_id),
            } => match self.store.entity(&namespace, &entity_id).await {
                Some(state) => json!({
                    "response_type": "state",
                    "namespace": namespace,
                    "entity_id": entity_id,
                    "data": state,
                }),
                None => error(format!("unknown entity {entity_id} in namespace {namespace}")),
            },
            Request::GetState {
                namespace,
                entity_id: None,
            } => match self.store.entities(&namespace).await {
                Some(entities) => json!({
                    "response_type": "state",
                    "namespace": namespace,
                    "online": self.store.is_online(&namespace).await,
                    "data": entities,
                }),
                None => error(format!("unknown namespace {namespace}")),
            },
            Request::GetMetadata { namespace } => match self.store.metadata(&namespace).await {
                Some(metadata) => json!({
                    "response_type": "metadata",
                    "namespace": namespace,
                    "data": metadata,
                }),
                None => error(format!("no metadata for namespace {namespace}")),
            },
            Request::CallService { service, data } => {
                match self.client.call_service(&service, data).await {
                    Ok(result) => json!({
                        "response_type": "service_result",
                        "service": service,
                        "data": result,
                    }),
                    Err(e) => error(format!("invalid service {service}: {e}")),
                }
            }
        }
    }
}

fn error(message: String) -> Value {
    json!({"response_type": "error", "message": message})
}

impl SessionHandler for DashboardSession {
    fn on_message(&self, payload: Value) -> BoxFuture<'_, ()> {
        async move {
            let response = match serde_json::from_value::<Request>(payload) {
                Ok(request) => self.handle(request).await,
                Err(e) => {
                    tracing::debug!("{}: bad request: {}", self.session.id(), e);
                    error(format!("bad request: {e}"))
                }
            };
            self.session.send(&response).await;
        }
        .boxed()
    }

    fn on_disconnect(&self) -> BoxFuture<'_, ()> {
        async move {
            self.stop.cancel();
            tracing::debug!("{}: dashboard disconnected", self.session.id());
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hassbridge_core::{Metadata, Snapshot};
    use hassbridge_plugin::{PluginConfig, PluginStarted, Runtime};
    use hassbridge_stream::{Multiplexer, SessionTransport, TransportError};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeTransport {
        sent: Mutex<Vec<Value>>,
    }

    impl FakeTransport {
        async fn wait_for(&self, count: usize) -> Vec<Value> {
            for _ in 0..100 {
                {
                    let sent = self.sent.lock().unwrap();
                    if sent.len() >= count {
                        return sent.clone();
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("expected {count} messages, got {:?}", self.sent.lock().unwrap());
        }
    }

    impl SessionTransport for FakeTransport {
        fn send(&self, text: String) -> Result<(), TransportError> {
            self.sent
                .lock()
                .unwrap()
                .push(serde_json::from_str(&text).unwrap());
            Ok(())
        }

        fn close(&self) {}
    }

    async fn setup() -> (Multiplexer, Arc<StateStore>) {
        let store = Arc::new(StateStore::new());
        store
            .plugin_started(PluginStarted {
                name: "HASS".into(),
                namespace: "default".into(),
                metadata: Metadata::validate(json!({
                    "latitude": 1, "longitude": 2, "elevation": 3, "time_zone": "UTC"
                }))
                .unwrap(),
                snapshot: Snapshot::from_value(json!([
                    {"entity_id": "light.kitchen", "state": "off"}
                ]))
                .unwrap(),
                first_time: true,
            })
            .await;
        let client = HassClient::new("HASS", &PluginConfig::new("http://127.0.0.1:9")).unwrap();
        let hub = DashboardHub::new(store.clone(), client);
        (Multiplexer::new(Arc::new(hub)), store)
    }

    #[tokio::test]
    async fn get_state_answers_from_store() {
        let (mux, _) = setup().await;
        let transport = Arc::new(FakeTransport::default());
        let id = mux.open(transport.clone()).await.unwrap();

        mux.deliver(id, r#"{"request_type":"get_state","entity_id":"light.kitchen"}"#)
            .await;
        mux.deliver(id, r#"{"request_type":"get_state","namespace":"other"}"#)
            .await;
        mux.deliver(id, r#"{"request_type":"get_state"}"#).await;
        mux.deliver(id, r#"{"request_type":"get_metadata"}"#).await;

        let sent = transport.wait_for(4).await;
        assert_eq!(sent[0]["response_type"], "state");
        assert_eq!(sent[0]["data"]["state"], "off");
        assert_eq!(sent[1]["response_type"], "error");
        assert_eq!(sent[2]["online"], true);
        assert_eq!(sent[2]["data"]["light.kitchen"]["state"], "off");
        assert_eq!(sent[3]["data"]["time_zone"], "UTC");
    }

    #[tokio::test]
    async fn bad_requests_get_errors() {
        let (mux, _) = setup().await;
        let transport = Arc::new(FakeTransport::default());
        let id = mux.open(transport.clone()).await.unwrap();

        mux.deliver(id, r#"{"request_type":"reboot"}"#).await;
        mux.deliver(
            id,
            r#"{"request_type":"call_service","service":"light.turn_on","data":{}}"#,
        )
        .await;

        let sent = transport.wait_for(2).await;
        assert!(sent.iter().all(|m| m["response_type"] == "error"));
        assert!(
            sent[1]["message"]
                .as_str()
                .unwrap()
                .starts_with("invalid service")
        );
    }

    #[tokio::test]
    async fn store_events_reach_each_session_until_disconnect() {
        let (mux, store) = setup().await;
        let a = Arc::new(FakeTransport::default());
        let b = Arc::new(FakeTransport::default());
        let id_a = mux.open(a.clone()).await.unwrap();
        mux.open(b.clone()).await.unwrap();

        let event = json!({"event_type": "state_changed", "data": {
            "entity_id": "light.kitchen", "new_state": {"state": "on"}
        }});
        store.state_update("default", event.clone()).await;
        assert_eq!(a.wait_for(1).await[0]["data"], event);
        assert_eq!(b.wait_for(1).await[0]["data"], event);

        mux.close(id_a).await;
        store.plugin_stopped("HASS", "default").await;
        assert_eq!(b.wait_for(2).await[1]["response_type"], "plugin_stopped");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(a.sent.lock().unwrap().len(), 1);
    }
}
