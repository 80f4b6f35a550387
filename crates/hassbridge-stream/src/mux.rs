//! The client session multiplexer.
//!
//! Sessions are keyed by [`SessionId`] in one table. Inbound text is decoded
//! and handed to the handler registered for that session; outbound payloads
//! are encoded and written to that session's transport. A broken or departed
//! session is logged and dropped without touching any other session.

use futures_util::future::BoxFuture;
use hassbridge_core::SessionId;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// The write side of one client connection.
pub trait SessionTransport: Send + Sync + 'static {
    /// Queue an encoded payload for the client.
    fn send(&self, text: String) -> Result<(), TransportError>;
    /// Ask the client connection to close.
    fn close(&self);
}

/// Per-session callbacks, supplied by the [`StreamHub`] when a session opens.
pub trait SessionHandler: Send + Sync + 'static {
    fn on_message(&self, payload: Value) -> BoxFuture<'_, ()>;
    fn on_disconnect(&self) -> BoxFuture<'_, ()>;
}

/// Whatever serves the clients.
pub trait StreamHub: Send + Sync + 'static {
    /// A session opened. Returns the handler for its messages.
    fn on_connect(&self, session: ClientSession) -> BoxFuture<'_, Arc<dyn SessionHandler>>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("session transport closed")]
    Closed,
    #[error("client is not reading, outbound queue full")]
    Backlogged,
}

struct SessionEntry {
    transport: Arc<dyn SessionTransport>,
    handler: Option<Arc<dyn SessionHandler>>,
}

#[derive(Default)]
struct SessionTable {
    entries: RwLock<HashMap<SessionId, SessionEntry>>,
    next_id: AtomicU64,
}

impl SessionTable {
    fn allocate(&self) -> SessionId {
        SessionId::new(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    async fn transport(&self, id: SessionId) -> Option<Arc<dyn SessionTransport>> {
        self.entries
            .read()
            .await
            .get(&id)
            .map(|entry| entry.transport.clone())
    }

    async fn send(&self, id: SessionId, payload: &Value) -> bool {
        let Some(text) = encode(payload) else {
            return false;
        };
        let Some(transport) = self.transport(id).await else {
            tracing::debug!("{}: not connected, dropping outbound message", id);
            return false;
        };
        write(id, transport.as_ref(), text)
    }
}

fn encode(payload: &Value) -> Option<String> {
    match serde_json::to_string(payload) {
        Ok(text) => Some(text),
        Err(e) => {
            tracing::warn!("unexpected error in JSON conversion when writing to stream: {}", e);
            None
        }
    }
}

fn write(id: SessionId, transport: &dyn SessionTransport, text: String) -> bool {
    match transport.send(text) {
        Ok(()) => true,
        Err(e @ TransportError::Backlogged) => {
            tracing::warn!("{}: dropping session: {}", id, e);
            false
        }
        Err(e) => {
            tracing::debug!("{}: client disconnected unexpectedly: {}", id, e);
            false
        }
    }
}

/// Handle to one client session, given to the hub on connect.
#[derive(Clone)]
pub struct ClientSession {
    id: SessionId,
    sessions: Arc<SessionTable>,
}

impl ClientSession {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Send a payload to this session. Returns `false` if it is gone.
    pub async fn send(&self, payload: &Value) -> bool {
        self.sessions.send(self.id, payload).await
    }

    /// Whether the session is still registered.
    pub async fn is_open(&self) -> bool {
        self.sessions.entries.read().await.contains_key(&self.id)
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession").field("id", &self.id).finish()
    }
}

/// Routes client sessions to their handlers. Cheap to clone.
#[derive(Clone)]
pub struct Multiplexer {
    hub: Arc<dyn StreamHub>,
    sessions: Arc<SessionTable>,
    stop: CancellationToken,
}

impl Multiplexer {
    pub fn new(hub: Arc<dyn StreamHub>) -> Self {
        Self {
            hub,
            sessions: Arc::default(),
            stop: CancellationToken::new(),
        }
    }

    /// Register a new session and run the hub's open hook.
    ///
    /// The transport is registered before the hook runs, so the hub may
    /// write to the session straight away. Returns `None` once stopped, or
    /// if the session was closed while the hook ran; in that case the new
    /// handler's disconnect hook still runs.
    pub async fn open(&self, transport: Arc<dyn SessionTransport>) -> Option<SessionId> {
        if self.stop.is_cancelled() {
            transport.close();
            return None;
        }

        let id = self.sessions.allocate();
        self.sessions.entries.write().await.insert(
            id,
            SessionEntry {
                transport,
                handler: None,
            },
        );
        tracing::debug!("stream connect {}", id);

        let session = ClientSession {
            id,
            sessions: self.sessions.clone(),
        };
        let handler = self.hub.on_connect(session).await;

        let registered = match self.sessions.entries.write().await.get_mut(&id) {
            Some(entry) => {
                entry.handler = Some(handler.clone());
                true
            }
            None => false,
        };
        if !registered {
            tracing::debug!("{}: closed during connect", id);
            handler.on_disconnect().await;
            return None;
        }
        Some(id)
    }

    /// Decode an inbound message and hand it to the session's handler.
    pub async fn deliver(&self, id: SessionId, text: &str) {
        let payload: Value = match serde_json::from_str(text) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("{}: unexpected error in JSON conversion when reading from stream", id);
                tracing::debug!("{}: data is {:?}, error is {}", id, text, e);
                return;
            }
        };

        let handler = self
            .sessions
            .entries
            .read()
            .await
            .get(&id)
            .and_then(|entry| entry.handler.clone());

        match handler {
            Some(handler) => handler.on_message(payload).await,
            None => tracing::debug!("{}: no handler, dropping message", id),
        }
    }

    /// The session went away: run its disconnect handler, then forget it.
    pub async fn close(&self, id: SessionId) {
        let handler = self
            .sessions
            .entries
            .read()
            .await
            .get(&id)
            .and_then(|entry| entry.handler.clone());

        if let Some(handler) = handler {
            handler.on_disconnect().await;
        }
        self.sessions.entries.write().await.remove(&id);
        tracing::debug!("stream disconnect {}", id);
    }

    /// Send a payload to one session. A missing or broken session is
    /// logged and reported as `false`, never as an error.
    pub async fn send(&self, id: SessionId, payload: &Value) -> bool {
        self.sessions.send(id, payload).await
    }

    /// Send a payload to every session. Returns how many accepted it.
    pub async fn broadcast(&self, payload: &Value) -> usize {
        let Some(text) = encode(payload) else {
            return 0;
        };
        let targets: Vec<_> = self
            .sessions
            .entries
            .read()
            .await
            .iter()
            .map(|(id, entry)| (*id, entry.transport.clone()))
            .collect();

        targets
            .into_iter()
            .filter(|(id, transport)| write(*id, transport.as_ref(), text.clone()))
            .count()
    }

    pub async fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.sessions.entries.read().await.keys().copied().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.sessions.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Stop accepting sessions and ask every open one to close.
    pub async fn stop(&self) {
        self.stop.cancel();
        for entry in self.sessions.entries.read().await.values() {
            entry.transport.close();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Token cancelled by [`stop`](Self::stop), for transport loops.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeTransport {
        sent: Mutex<Vec<String>>,
        broken: AtomicBool,
        closed: AtomicBool,
    }

    impl FakeTransport {
        fn sent(&self) -> Vec<Value> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|text| serde_json::from_str(text).unwrap())
                .collect()
        }
    }

    impl SessionTransport for FakeTransport {
        fn send(&self, text: String) -> Result<(), TransportError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(TransportError::Closed);
            }
            self.sent.lock().unwrap().push(text);
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Seen {
        Message(SessionId, Value),
        Disconnect(SessionId),
    }

    #[derive(Default)]
    struct RecordingHub {
        seen: Arc<Mutex<Vec<Seen>>>,
        welcome: bool,
        connect_delay: Duration,
    }

    struct RecordingHandler {
        id: SessionId,
        seen: Arc<Mutex<Vec<Seen>>>,
    }

    impl SessionHandler for RecordingHandler {
        fn on_message(&self, payload: Value) -> BoxFuture<'_, ()> {
            async move {
                self.seen.lock().unwrap().push(Seen::Message(self.id, payload));
            }
            .boxed()
        }

        fn on_disconnect(&self) -> BoxFuture<'_, ()> {
            async move {
                self.seen.lock().unwrap().push(Seen::Disconnect(self.id));
            }
            .boxed()
        }
    }

    impl StreamHub for RecordingHub {
        fn on_connect(&self, session: ClientSession) -> BoxFuture<'_, Arc<dyn SessionHandler>> {
            async move {
                if self.welcome {
                    assert!(session.send(&json!({"welcome": session.id()})).await);
                }
                if !self.connect_delay.is_zero() {
                    tokio::time::sleep(self.connect_delay).await;
                }
                Arc::new(RecordingHandler {
                    id: session.id(),
                    seen: self.seen.clone(),
                }) as Arc<dyn SessionHandler>
            }
            .boxed()
        }
    }

    fn mux() -> (Multiplexer, Arc<Mutex<Vec<Seen>>>) {
        let hub = RecordingHub::default();
        let seen = hub.seen.clone();
        (Multiplexer::new(Arc::new(hub)), seen)
    }

    #[tokio::test]
    async fn routes_messages_by_session() {
        let (mux, seen) = mux();
        let a = mux.open(Arc::new(FakeTransport::default())).await.unwrap();
        let b = mux.open(Arc::new(FakeTransport::default())).await.unwrap();
        assert_ne!(a, b);

        mux.deliver(b, r#"{"n":1}"#).await;
        mux.deliver(a, r#"{"n":2}"#).await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                Seen::Message(b, json!({"n": 1})),
                Seen::Message(a, json!({"n": 2})),
            ]
        );
    }

    #[tokio::test]
    async fn undecodable_message_is_dropped() {
        let (mux, seen) = mux();
        let a = mux.open(Arc::new(FakeTransport::default())).await.unwrap();
        let b = mux.open(Arc::new(FakeTransport::default())).await.unwrap();

        mux.deliver(a, "{not json").await;
        mux.deliver(b, r#"{"ok":true}"#).await;

        assert_eq!(*seen.lock().unwrap(), vec![Seen::Message(b, json!({"ok": true}))]);
    }

    #[tokio::test]
    async fn message_for_unknown_session_is_dropped() {
        let (mux, seen) = mux();
        mux.deliver(SessionId::new(42), "{}").await;
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn broken_session_does_not_affect_others() {
        let (mux, _) = mux();
        let broken = Arc::new(FakeTransport::default());
        let healthy = Arc::new(FakeTransport::default());
        let a = mux.open(broken.clone()).await.unwrap();
        let b = mux.open(healthy.clone()).await.unwrap();

        broken.broken.store(true, Ordering::SeqCst);
        assert!(!mux.send(a, &json!({"to": "a"})).await);
        assert!(mux.send(b, &json!({"to": "b"})).await);
        assert_eq!(mux.broadcast(&json!({"all": 1})).await, 1);
        assert_eq!(healthy.sent(), vec![json!({"to": "b"}), json!({"all": 1})]);

        let late = Arc::new(FakeTransport::default());
        let c = mux.open(late.clone()).await.unwrap();
        assert!(mux.send(c, &json!({"to": "c"})).await);
        assert_eq!(late.sent(), vec![json!({"to": "c"})]);
    }

    #[tokio::test]
    async fn close_runs_disconnect_handler_and_forgets_session() {
        let (mux, seen) = mux();
        let a = mux.open(Arc::new(FakeTransport::default())).await.unwrap();
        let b = mux.open(Arc::new(FakeTransport::default())).await.unwrap();

        mux.close(a).await;
        mux.deliver(a, "{}").await;

        assert_eq!(*seen.lock().unwrap(), vec![Seen::Disconnect(a)]);
        assert!(!mux.send(a, &json!({})).await);
        assert_eq!(mux.session_ids().await, vec![b]);
    }

    #[tokio::test]
    async fn close_during_open_hook_runs_disconnect() {
        let hub = RecordingHub {
            connect_delay: Duration::from_millis(100),
            ..Default::default()
        };
        let seen = hub.seen.clone();
        let mux = Multiplexer::new(Arc::new(hub));

        let opening = tokio::spawn({
            let mux = mux.clone();
            async move { mux.open(Arc::new(FakeTransport::default())).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let id = mux.session_ids().await[0];
        mux.close(id).await;

        assert_eq!(opening.await.unwrap(), None);
        assert_eq!(*seen.lock().unwrap(), vec![Seen::Disconnect(id)]);
        assert!(mux.is_empty().await);
    }

    #[tokio::test]
    async fn open_hook_can_write_to_new_session() {
        let hub = RecordingHub {
            welcome: true,
            ..Default::default()
        };
        let mux = Multiplexer::new(Arc::new(hub));
        let transport = Arc::new(FakeTransport::default());
        let id = mux.open(transport.clone()).await.unwrap();

        assert_eq!(transport.sent(), vec![json!({"welcome": id.get()})]);
    }

    #[tokio::test]
    async fn stopped_multiplexer_closes_and_rejects_sessions() {
        let (mux, _) = mux();
        let open = Arc::new(FakeTransport::default());
        mux.open(open.clone()).await.unwrap();

        mux.stop().await;
        assert!(open.closed.load(Ordering::SeqCst));

        let late = Arc::new(FakeTransport::default());
        assert!(mux.open(late.clone()).await.is_none());
        assert!(late.closed.load(Ordering::SeqCst));
        assert_eq!(mux.len().await, 1);
    }
}
