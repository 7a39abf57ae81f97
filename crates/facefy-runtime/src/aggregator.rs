//! Combined connection state for the user interface.
//!
//! [`Aggregator`] owns the [`Session`] and the configured [`Endpoint`], and
//! republishes one [`AggregateSnapshot`] whenever either of them changes.
//! The endpoint is loaded from a [`PreferenceStore`] on construction and
//! written back on every update.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use facefy_core::models::{
    AggregateSnapshot, ConnectionPhase, DetectionEvent, Endpoint, SessionSnapshot, DEFAULT_HOST,
    DEFAULT_PORT,
};
use facefy_core::preferences::{PreferenceStore, KEY_SERVER_HOST, KEY_SERVER_PORT};
use facefy_core::{FacefyError, Result};
use tokio::sync::watch;

use crate::session::{Session, SessionConfig};

// ── Derived state ─────────────────────────────────────────────────────────────

struct Derived {
    /// Current endpoint; holding this lock serializes recomputations.
    endpoint: Mutex<Endpoint>,
    endpoint_tx: watch::Sender<Endpoint>,
    snapshot_tx: watch::Sender<AggregateSnapshot>,
}

impl Derived {
    fn lock(&self) -> MutexGuard<'_, Endpoint> {
        self.endpoint
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Produce and publish a fresh snapshot. Callers hold the endpoint lock.
    fn recompute(&self, session: &SessionSnapshot, endpoint: &Endpoint) {
        let previous = self.snapshot_tx.borrow().clone();
        let next = AggregateSnapshot::derive(&previous, session, endpoint, Utc::now());

        if next.phase == ConnectionPhase::Connected && previous.phase != ConnectionPhase::Connected
        {
            tracing::info!(%endpoint, "connection established");
        }

        self.snapshot_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

// ── Aggregator ────────────────────────────────────────────────────────────────

/// Facade the UI drives: forwards connection commands to the session and
/// owns endpoint persistence.
pub struct Aggregator {
    session: Session,
    store: Arc<dyn PreferenceStore>,
    derived: Arc<Derived>,
}

impl Aggregator {
    /// Build an aggregator, loading the endpoint from `store`.
    ///
    /// Falls back to `localhost:8000` when nothing valid is stored.
    pub fn new(store: Arc<dyn PreferenceStore>, config: SessionConfig) -> Self {
        let endpoint = load_endpoint(store.as_ref());
        let session = Session::new(config);

        let initial = AggregateSnapshot::derive(
            &AggregateSnapshot::default(),
            &session.snapshot(),
            &endpoint,
            Utc::now(),
        );
        let (endpoint_tx, _) = watch::channel(endpoint.clone());
        let (snapshot_tx, _) = watch::channel(initial);

        let derived = Arc::new(Derived {
            endpoint: Mutex::new(endpoint),
            endpoint_tx,
            snapshot_tx,
        });

        let on_change = Arc::clone(&derived);
        session.add_listener(move |status| {
            let endpoint = on_change.lock();
            on_change.recompute(status, &endpoint);
        });

        Self {
            session,
            store,
            derived,
        }
    }

    // ── Commands ──────────────────────────────────────────────────────────

    pub fn connect(&self) {
        let endpoint = self.endpoint();
        self.session.connect(&endpoint);
    }

    pub fn disconnect(&self) {
        self.session.disconnect();
    }

    /// Replace and persist the endpoint.
    ///
    /// The in-memory endpoint only changes once both values are stored; on a
    /// [`FacefyError::Persistence`] error the previous endpoint stays live.
    /// Does not connect or disconnect.
    pub fn update_endpoint(&self, host: &str, port: u32) -> Result<Endpoint> {
        let endpoint = Endpoint::new(host, port)?;

        let mut current = self.derived.lock();
        if let Err(e) = persist_endpoint(self.store.as_ref(), &current, &endpoint) {
            tracing::error!(%endpoint, error = %e, "failed to save endpoint");
            return Err(e);
        }

        tracing::info!(from = %*current, to = %endpoint, "endpoint updated");
        *current = endpoint.clone();
        self.derived.endpoint_tx.send_replace(endpoint.clone());
        self.derived.recompute(&self.session.snapshot(), &current);

        Ok(endpoint)
    }

    /// Save the endpoint and immediately try to connect to it.
    ///
    /// Nothing is attempted when the endpoint is invalid or cannot be saved.
    /// Like [`Aggregator::connect`], this is a no-op while already connected.
    pub fn test_connection(&self, host: &str, port: u32) -> Result<()> {
        self.update_endpoint(host, port)?;
        self.connect();
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn start_stream(&self) -> bool {
        self.session.request_stream(true)
    }

    pub fn stop_stream(&self) -> bool {
        self.session.request_stream(false)
    }

    // ── Observation ───────────────────────────────────────────────────────

    pub fn snapshot(&self) -> AggregateSnapshot {
        self.derived.snapshot_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AggregateSnapshot> {
        self.derived.snapshot_tx.subscribe()
    }

    pub fn endpoint(&self) -> Endpoint {
        self.derived.endpoint_tx.borrow().clone()
    }

    pub fn subscribe_endpoint(&self) -> watch::Receiver<Endpoint> {
        self.derived.endpoint_tx.subscribe()
    }

    pub fn latest_detection(&self) -> Option<DetectionEvent> {
        self.session.latest_detection()
    }

    pub fn subscribe_detections(&self) -> watch::Receiver<Option<DetectionEvent>> {
        self.session.subscribe_detections()
    }

    pub fn is_streaming(&self) -> bool {
        self.session.is_streaming()
    }

    pub fn subscribe_streaming(&self) -> watch::Receiver<bool> {
        self.session.subscribe_streaming()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }
}

// ── Persistence helpers ───────────────────────────────────────────────────────

fn load_endpoint(store: &dyn PreferenceStore) -> Endpoint {
    let host = store.get_string(KEY_SERVER_HOST);
    let port = store.get_int(KEY_SERVER_PORT);
    if host.is_none() && port.is_none() {
        tracing::debug!("no saved endpoint; using default");
        return Endpoint::default();
    }

    let host = host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = port.unwrap_or(i64::from(DEFAULT_PORT));
    let loaded = u32::try_from(port)
        .map_err(|_| FacefyError::InvalidEndpoint(format!("port {port} is outside 1-65535")))
        .and_then(|port| Endpoint::new(&host, port));

    match loaded {
        Ok(endpoint) => {
            tracing::debug!(%endpoint, "loaded saved endpoint");
            endpoint
        }
        Err(e) => {
            tracing::warn!(error = %e, "saved endpoint is invalid; using default");
            Endpoint::default()
        }
    }
}

fn persistence_error(key: &str, error: FacefyError) -> FacefyError {
    match error {
        FacefyError::Persistence { .. } => error,
        other => FacefyError::Persistence {
            key: key.to_string(),
            reason: other.to_string(),
        },
    }
}

/// Write host then port, restoring the previous host if the port write fails.
fn persist_endpoint(
    store: &dyn PreferenceStore,
    previous: &Endpoint,
    next: &Endpoint,
) -> Result<()> {
    store
        .set_string(KEY_SERVER_HOST, next.host())
        .map_err(|e| persistence_error(KEY_SERVER_HOST, e))?;

    if let Err(e) = store.set_int(KEY_SERVER_PORT, i64::from(next.port())) {
        if let Err(rollback) = store.set_string(KEY_SERVER_HOST, previous.host()) {
            tracing::warn!(error = %rollback, "could not restore saved host");
        }
        return Err(persistence_error(KEY_SERVER_PORT, e));
    }

    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use facefy_core::preferences::{FilePreferenceStore, MemoryPreferenceStore, PREFERENCE_SCOPE};
    use futures_util::StreamExt;
    use std::time::Duration;
    use tokio::net::TcpListener;

    const WAIT: Duration = Duration::from_secs(5);

    // ── helpers ───────────────────────────────────────────────────────────

    fn aggregator_with(store: Arc<dyn PreferenceStore>) -> Aggregator {
        Aggregator::new(store, SessionConfig::default())
    }

    async fn wait_for_phase(aggregator: &Aggregator, phase: ConnectionPhase) -> AggregateSnapshot {
        let mut rx = aggregator.subscribe();
        let snapshot = tokio::time::timeout(WAIT, rx.wait_for(|s| s.phase == phase))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {phase}"))
            .expect("snapshot channel closed")
            .clone();
        snapshot
    }

    /// WebSocket server that accepts clients and holds them open.
    async fn spawn_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    while let Some(Ok(_)) = ws.next().await {}
                });
            }
        });
        port
    }

    /// Store whose port writes always fail.
    #[derive(Default)]
    struct PortWriteFails {
        inner: MemoryPreferenceStore,
    }

    impl PreferenceStore for PortWriteFails {
        fn get_string(&self, key: &str) -> Option<String> {
            self.inner.get_string(key)
        }
        fn get_int(&self, key: &str) -> Option<i64> {
            self.inner.get_int(key)
        }
        fn set_string(&self, key: &str, value: &str) -> Result<()> {
            self.inner.set_string(key, value)
        }
        fn set_int(&self, _key: &str, _value: i64) -> Result<()> {
            Err(FacefyError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "read-only storage",
            )))
        }
    }

    // ── endpoint loading ──────────────────────────────────────────────────

    #[test]
    fn test_default_endpoint_when_store_empty() {
        let aggregator = aggregator_with(Arc::new(MemoryPreferenceStore::new()));
        assert_eq!(aggregator.endpoint(), Endpoint::default());

        let snapshot = aggregator.snapshot();
        assert_eq!(snapshot.phase, ConnectionPhase::Disconnected);
        assert_eq!(snapshot.endpoint, Endpoint::default());
        assert!(snapshot.last_connected_at.is_none());
        assert!(snapshot.last_error.is_none());
    }

    #[test]
    fn test_invalid_saved_endpoint_falls_back_to_default() {
        let store = Arc::new(MemoryPreferenceStore::new());
        store.set_string(KEY_SERVER_HOST, "server").unwrap();
        store.set_int(KEY_SERVER_PORT, 70_000).unwrap();

        let aggregator = aggregator_with(store);
        assert_eq!(aggregator.endpoint(), Endpoint::default());
    }

    #[test]
    fn test_saved_host_with_uri_delimiters_falls_back_to_default() {
        let store = Arc::new(MemoryPreferenceStore::new());
        store.set_string(KEY_SERVER_HOST, "server:9000/other").unwrap();
        store.set_int(KEY_SERVER_PORT, 8080).unwrap();

        let aggregator = aggregator_with(store);
        assert_eq!(aggregator.endpoint(), Endpoint::default());
    }

    #[test]
    fn test_partial_saved_endpoint_uses_default_port() {
        let store = Arc::new(MemoryPreferenceStore::new());
        store.set_string(KEY_SERVER_HOST, "server").unwrap();

        let aggregator = aggregator_with(store);
        assert_eq!(aggregator.endpoint(), Endpoint::new("server", 8000).unwrap());
    }

    // ── update_endpoint ───────────────────────────────────────────────────

    #[test]
    fn test_update_endpoint_survives_restart() {
        let store: Arc<dyn PreferenceStore> = Arc::new(MemoryPreferenceStore::new());

        let aggregator = aggregator_with(Arc::clone(&store));
        aggregator.update_endpoint("10.0.0.5", 9000).unwrap();
        drop(aggregator);

        let restarted = aggregator_with(store);
        assert_eq!(restarted.endpoint(), Endpoint::new("10.0.0.5", 9000).unwrap());
        assert_eq!(restarted.snapshot().endpoint.port(), 9000);
    }

    #[test]
    fn test_update_endpoint_survives_restart_on_disk() {
        let tmp = tempfile::TempDir::new().expect("tempdir");

        let store = Arc::new(FilePreferenceStore::open(tmp.path(), PREFERENCE_SCOPE));
        aggregator_with(store)
            .update_endpoint("10.0.0.5", 9000)
            .unwrap();

        let reopened = Arc::new(FilePreferenceStore::open(tmp.path(), PREFERENCE_SCOPE));
        let restarted = aggregator_with(reopened);
        assert_eq!(restarted.endpoint(), Endpoint::new("10.0.0.5", 9000).unwrap());
    }

    #[test]
    fn test_update_endpoint_publishes_endpoint_and_snapshot() {
        let aggregator = aggregator_with(Arc::new(MemoryPreferenceStore::new()));
        let endpoint_rx = aggregator.subscribe_endpoint();
        let snapshot_rx = aggregator.subscribe();

        let endpoint = aggregator.update_endpoint(" 192.168.1.20 ", 8080).unwrap();

        assert_eq!(endpoint.host(), "192.168.1.20");
        assert!(endpoint_rx.has_changed().unwrap());
        assert!(snapshot_rx.has_changed().unwrap());
        assert_eq!(*endpoint_rx.borrow(), endpoint);
        assert_eq!(snapshot_rx.borrow().endpoint, endpoint);
    }

    #[test]
    fn test_update_endpoint_rejects_invalid_values() {
        let store = Arc::new(MemoryPreferenceStore::new());
        let aggregator = aggregator_with(store.clone());

        assert!(matches!(
            aggregator.update_endpoint("host", 0),
            Err(FacefyError::InvalidEndpoint(_))
        ));
        assert!(aggregator.update_endpoint("", 8000).is_err());
        assert!(matches!(
            aggregator.update_endpoint("127.0.0.1:38231/x", 9),
            Err(FacefyError::InvalidEndpoint(_))
        ));

        assert_eq!(aggregator.endpoint(), Endpoint::default());
        assert!(store.get_string(KEY_SERVER_HOST).is_none());
    }

    #[test]
    fn test_persistence_failure_keeps_previous_endpoint() {
        let store = Arc::new(PortWriteFails::default());
        let aggregator = aggregator_with(store.clone());

        let err = aggregator.update_endpoint("10.0.0.5", 9000).unwrap_err();

        assert!(matches!(err, FacefyError::Persistence { ref key, .. } if key == KEY_SERVER_PORT));
        assert_eq!(aggregator.endpoint(), Endpoint::default());
        assert_eq!(aggregator.snapshot().endpoint, Endpoint::default());
        // The host write was rolled back.
        assert_eq!(store.get_string(KEY_SERVER_HOST).as_deref(), Some("localhost"));
    }

    // ── forwarding ────────────────────────────────────────────────────────

    #[test]
    fn test_stream_commands_ignored_while_disconnected() {
        let aggregator = aggregator_with(Arc::new(MemoryPreferenceStore::new()));
        assert!(!aggregator.start_stream());
        assert!(!aggregator.stop_stream());
        assert!(!aggregator.is_streaming());
        assert!(!aggregator.is_connected());
    }

    #[tokio::test]
    async fn test_failed_connect_is_reflected_in_snapshot() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let aggregator = aggregator_with(Arc::new(MemoryPreferenceStore::new()));
        aggregator.update_endpoint("127.0.0.1", u32::from(port)).unwrap();
        aggregator.connect();

        let snapshot = wait_for_phase(&aggregator, ConnectionPhase::Error).await;
        assert_eq!(snapshot.phase, aggregator.session().snapshot().phase);
        assert_eq!(snapshot.last_error, aggregator.session().snapshot().last_error);
        assert!(snapshot.last_error.is_some());
        assert!(snapshot.last_connected_at.is_none());
    }

    #[tokio::test]
    async fn test_test_connection_rejects_invalid_endpoint_without_connecting() {
        let aggregator = aggregator_with(Arc::new(MemoryPreferenceStore::new()));
        assert!(aggregator.test_connection("host", 65_536).is_err());
        assert_eq!(aggregator.snapshot().phase, ConnectionPhase::Disconnected);
    }

    // ── last_connected_at ─────────────────────────────────────────────────

    #[tokio::test]
    async fn test_last_connected_at_follows_connected_phase() {
        let port = spawn_server().await;
        let aggregator = aggregator_with(Arc::new(MemoryPreferenceStore::new()));

        let before = Utc::now();
        aggregator.test_connection("127.0.0.1", u32::from(port)).unwrap();
        let connected = wait_for_phase(&aggregator, ConnectionPhase::Connected).await;

        let stamped = connected.last_connected_at.expect("timestamp on connect");
        assert!(stamped >= before);
        assert!(aggregator.is_connected());

        // Changing the endpoint while connected keeps the original stamp.
        aggregator.update_endpoint("127.0.0.1", 1).unwrap();
        assert_eq!(aggregator.snapshot().last_connected_at, Some(stamped));

        aggregator.disconnect();
        let snapshot = aggregator.snapshot();
        assert_eq!(snapshot.phase, ConnectionPhase::Disconnected);
        assert!(snapshot.last_connected_at.is_none());
    }
}
