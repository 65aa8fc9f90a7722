//! Client side of a window surface: one bound connection, reconciled by the
//! router's context notifications.

use std::{
    sync::{
        Arc, Mutex, MutexGuard, Weak,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use agent_relay_core::{
    ClientMessage, ExecutionId, Frame, Handshake, RelayConfig, ServerMessage, TabHost, TabId,
    WindowId,
};
use agent_relay_session::ClientSessionStore;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use uuid::Uuid;

use crate::connector::{Connector, TransportError};

/// Connection state as seen by the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleState {
    Disconnected,
    Connecting,
    /// Connected; `execution_id` is `None` while nothing is bound.
    Connected { execution_id: Option<ExecutionId> },
}

#[derive(Default)]
struct Link {
    outbound: Option<mpsc::UnboundedSender<Frame<ClientMessage>>>,
    reader: Option<JoinHandle<()>>,
    sweeper: Option<JoinHandle<()>>,
    connecting: bool,
    generation: u64,
    tab_id: Option<TabId>,
}

/// Owns the single connection of one window surface.
///
/// Every resolution attempt (activation, tab switch) takes a new version.
/// An `EXECUTION_CONTEXT` notification marks all versions up to the current
/// one as settled, so an optimistic guess that finishes after it is dropped.
pub struct ConnectionLifecycle {
    connector: Arc<dyn Connector>,
    host: Arc<dyn TabHost>,
    store: Arc<ClientSessionStore>,
    window_id: WindowId,
    name: String,
    sweep_interval: Duration,
    link: Mutex<Link>,
    state: watch::Sender<LifecycleState>,
    version: AtomicU64,
    settled: AtomicU64,
    consumers: AtomicUsize,
}

impl ConnectionLifecycle {
    /// Create a lifecycle for the surface `name` in `window_id` with the
    /// default configuration.
    #[must_use]
    pub fn new(
        connector: Arc<dyn Connector>,
        host: Arc<dyn TabHost>,
        store: Arc<ClientSessionStore>,
        window_id: WindowId,
        name: impl Into<String>,
    ) -> Arc<Self> {
        Self::with_config(connector, host, store, window_id, name, &RelayConfig::default())
    }

    /// Create a lifecycle that sweeps `store` every `config.sweep_interval()`
    /// while connected.
    #[must_use]
    pub fn with_config(
        connector: Arc<dyn Connector>,
        host: Arc<dyn TabHost>,
        store: Arc<ClientSessionStore>,
        window_id: WindowId,
        name: impl Into<String>,
        config: &RelayConfig,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(LifecycleState::Disconnected);
        Arc::new(Self {
            connector,
            host,
            store,
            window_id,
            name: name.into(),
            sweep_interval: config.sweep_interval(),
            link: Mutex::new(Link::default()),
            state,
            version: AtomicU64::new(0),
            settled: AtomicU64::new(0),
            consumers: AtomicUsize::new(0),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Link> {
        self.link
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// The session store this surface renders from.
    #[must_use]
    pub const fn store(&self) -> &Arc<ClientSessionStore> {
        &self.store
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.state.borrow().clone()
    }

    /// Watch state changes.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Tab the router last reported for this surface.
    #[must_use]
    pub fn tab_id(&self) -> Option<TabId> {
        self.lock().tab_id
    }

    /// Connect and handshake. No-op if already connected or connecting.
    ///
    /// # Errors
    /// Returns error if the connector fails or closes before the handshake
    /// is sent. The state falls back to `Disconnected`.
    pub async fn activate(self: &Arc<Self>) -> Result<(), TransportError> {
        {
            let mut link = self.lock();
            if link.outbound.is_some() || link.connecting {
                return Ok(());
            }
            link.connecting = true;
        }
        self.state.send_replace(LifecycleState::Connecting);

        let version = self.begin_resolution();
        let tab_id = self.query_active_tab().await;
        self.apply_guess(version, tab_id, false);

        let link = match self.connector.connect().await {
            Ok(link) => link,
            Err(e) => {
                tracing::error!(surface = %self.name, "Failed to connect: {e}");
                self.lock().connecting = false;
                self.state.send_replace(LifecycleState::Disconnected);
                return Err(e);
            }
        };

        let handshake = Handshake::surface(self.window_id, tab_id).with_name(self.name.clone());
        if link
            .outbound
            .send(Frame::new(ClientMessage::Handshake(handshake)))
            .is_err()
        {
            self.lock().connecting = false;
            self.state.send_replace(LifecycleState::Disconnected);
            return Err(TransportError::Closed);
        }

        let mut guard = self.lock();
        guard.generation += 1;
        let generation = guard.generation;
        guard.connecting = false;
        guard.outbound = Some(link.outbound);
        guard.reader = Some(tokio::spawn(read_loop(
            Arc::downgrade(self),
            link.inbound,
            generation,
        )));
        if guard.sweeper.is_none() {
            guard.sweeper = Some(self.store.spawn_sweeper(self.sweep_interval));
        }
        drop(guard);

        self.state.send_if_modified(|state| {
            if *state == LifecycleState::Connecting {
                *state = LifecycleState::Connected { execution_id: None };
                true
            } else {
                false
            }
        });
        tracing::info!(surface = %self.name, window = self.window_id, "Surface connected");
        Ok(())
    }

    /// The host reported a tab switch in this window.
    ///
    /// Shows the locally cached binding for `tab_id` right away and asks the
    /// router to resend the authoritative one.
    ///
    /// # Errors
    /// Returns error if not connected and activation fails.
    pub async fn on_tab_activated(self: &Arc<Self>, tab_id: TabId) -> Result<(), TransportError> {
        let outbound = self.lock().outbound.clone();
        let Some(outbound) = outbound else {
            return self.activate().await;
        };

        let version = self.begin_resolution();
        self.apply_guess(version, Some(tab_id), true);

        let request = Frame::request(
            ClientMessage::SyncRequest {
                connection_name: self.name.clone(),
                tab_id: Some(tab_id),
            },
            Uuid::new_v4().to_string(),
        );
        outbound.send(request).map_err(|_| TransportError::Closed)
    }

    /// Close the connection and release the listener task.
    ///
    /// Cached execution state stays in the store.
    pub fn shutdown(&self) {
        let (outbound, reader, sweeper) = {
            let mut link = self.lock();
            link.generation += 1;
            link.tab_id = None;
            (link.outbound.take(), link.reader.take(), link.sweeper.take())
        };
        for task in reader.into_iter().chain(sweeper) {
            task.abort();
        }
        if outbound.is_some() {
            tracing::info!(surface = %self.name, "Surface disconnected");
        }
        drop(outbound);
        self.store.set_current(None);
        self.state.send_replace(LifecycleState::Disconnected);
    }

    /// Attach a logical consumer. The connection is shut down when the last
    /// consumer is dropped.
    #[must_use]
    pub fn attach(self: &Arc<Self>) -> Consumer {
        self.consumers.fetch_add(1, Ordering::AcqRel);
        Consumer {
            lifecycle: Arc::clone(self),
            state: self.subscribe_state(),
        }
    }

    /// Number of attached consumers.
    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.consumers.load(Ordering::Acquire)
    }

    fn begin_resolution(&self) -> u64 {
        self.version.fetch_add(1, Ordering::AcqRel) + 1
    }

    async fn query_active_tab(&self) -> Option<TabId> {
        match self.host.active_tab(self.window_id).await {
            Ok(tab) => tab,
            Err(e) => {
                tracing::warn!(window = self.window_id, "Active tab query failed: {e}");
                None
            }
        }
    }

    /// Show the cached binding of `tab_id` unless a notification already
    /// settled this resolution. With `publish`, the state reports the same
    /// binding the store now shows. Returns whether the guess was applied.
    fn apply_guess(&self, version: u64, tab_id: Option<TabId>, publish: bool) -> bool {
        let mut applied = false;
        self.state.send_if_modified(|state| {
            if self.settled.load(Ordering::Acquire) >= version {
                return false;
            }
            let guess = tab_id.and_then(|tab| self.store.tab_binding(tab));
            self.store.set_current(guess.clone());
            applied = true;
            if publish {
                *state = LifecycleState::Connected {
                    execution_id: guess,
                };
            }
            publish
        });
        if !applied {
            tracing::debug!(surface = %self.name, version, "Dropped stale resolution");
        }
        applied
    }

    fn handle_frame(&self, frame: Frame<ServerMessage>) {
        match frame.message {
            ServerMessage::ExecutionContext {
                execution_id,
                tab_id,
            } => {
                self.lock().tab_id = tab_id;
                tracing::debug!(surface = %self.name, ?execution_id, ?tab_id, "Context applied");
                // Under the state lock so a concurrent guess sees either all or none of it.
                self.state.send_modify(|state| {
                    self.settled
                        .store(self.version.load(Ordering::Acquire), Ordering::Release);
                    self.store.set_current(execution_id.clone());
                    match (&execution_id, tab_id) {
                        (Some(id), Some(tab)) => self.store.set_tab_binding(tab, id.clone()),
                        (None, Some(tab)) => self.store.remove_tab_binding(tab),
                        _ => {}
                    }
                    *state = LifecycleState::Connected { execution_id };
                });
            }
            ServerMessage::AgentStreamUpdate {
                execution_id,
                event,
            } => self.store.apply_stream_event(&execution_id, event),
            ServerMessage::WorkflowStatus {
                execution_id,
                status,
            } => self.store.apply_workflow_status(&execution_id, status),
            ServerMessage::ExecutionMigrated { from, to } => {
                self.store.migrate_execution_state(&from, &to);
                self.state.send_if_modified(|state| match state {
                    LifecycleState::Connected {
                        execution_id: Some(current),
                    } if *current == from => {
                        *current = to.clone();
                        true
                    }
                    _ => false,
                });
            }
            ServerMessage::Error { message } => {
                tracing::warn!(surface = %self.name, "Router error: {message}");
            }
            ServerMessage::Pong => {}
        }
    }

    fn on_closed(&self, generation: u64) {
        let mut link = self.lock();
        if link.generation != generation {
            return;
        }
        link.outbound = None;
        link.reader = None;
        link.tab_id = None;
        drop(link);
        tracing::info!(surface = %self.name, "Connection closed by router");
        self.state.send_replace(LifecycleState::Disconnected);
    }
}

async fn read_loop(
    lifecycle: Weak<ConnectionLifecycle>,
    mut inbound: mpsc::UnboundedReceiver<Frame<ServerMessage>>,
    generation: u64,
) {
    while let Some(frame) = inbound.recv().await {
        let Some(lifecycle) = lifecycle.upgrade() else {
            return;
        };
        lifecycle.handle_frame(frame);
    }
    if let Some(lifecycle) = lifecycle.upgrade() {
        lifecycle.on_closed(generation);
    }
}

/// A logical consumer of a shared surface connection.
pub struct Consumer {
    lifecycle: Arc<ConnectionLifecycle>,
    state: watch::Receiver<LifecycleState>,
}

impl Consumer {
    /// The shared lifecycle.
    #[must_use]
    pub const fn lifecycle(&self) -> &Arc<ConnectionLifecycle> {
        &self.lifecycle
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.state.borrow().clone()
    }

    /// Wait for the next state change.
    ///
    /// # Errors
    /// Returns error if the lifecycle was dropped.
    pub async fn changed(&mut self) -> Result<LifecycleState, TransportError> {
        self.state
            .changed()
            .await
            .map_err(|_| TransportError::Closed)?;
        Ok(self.state.borrow_and_update().clone())
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        if self.lifecycle.consumers.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.lifecycle.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use agent_relay_core::{
        ChannelRegistry, Message, MessageRole, MemoryTabHost, StreamEvent, WorkflowStatus,
    };
    use agent_relay_router::ConnectionRegistry;
    use async_trait::async_trait;

    use super::*;
    use crate::connector::{ClientLink, LocalConnector};

    struct Fixture {
        host: Arc<MemoryTabHost>,
        channels: Arc<ChannelRegistry>,
        registry: Arc<ConnectionRegistry>,
        store: Arc<ClientSessionStore>,
    }

    impl Fixture {
        fn new() -> Self {
            let host = Arc::new(MemoryTabHost::new());
            let channels = Arc::new(ChannelRegistry::new());
            let registry = Arc::new(ConnectionRegistry::new(
                Arc::clone(&channels),
                Arc::clone(&host) as Arc<dyn TabHost>,
            ));
            Self {
                host,
                channels,
                registry,
                store: Arc::new(ClientSessionStore::new()),
            }
        }

        fn lifecycle(&self, window: WindowId) -> Arc<ConnectionLifecycle> {
            ConnectionLifecycle::new(
                Arc::new(LocalConnector::new(Arc::clone(&self.registry))),
                Arc::clone(&self.host) as Arc<dyn TabHost>,
                Arc::clone(&self.store),
                window,
                format!("surface-{window}"),
            )
        }
    }

    async fn wait_for(
        rx: &mut watch::Receiver<LifecycleState>,
        expected: LifecycleState,
    ) {
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == expected))
            .await
            .expect("state not reached")
            .expect("lifecycle dropped");
    }

    #[tokio::test]
    async fn test_activate_binds_active_tab() {
        let fx = Fixture::new();
        fx.host.open_tab(1, 10);
        fx.registry.bind_tab_execution(10, "e1".into());

        let lifecycle = fx.lifecycle(1);
        let mut rx = lifecycle.subscribe_state();
        lifecycle.activate().await.unwrap();

        wait_for(
            &mut rx,
            LifecycleState::Connected {
                execution_id: Some("e1".into()),
            },
        )
        .await;
        assert_eq!(fx.store.current_execution(), Some("e1".into()));
        assert_eq!(fx.store.tab_binding(10), Some("e1".into()));
        assert_eq!(lifecycle.tab_id(), Some(10));
        assert_eq!(fx.registry.connections_in_window(1).len(), 1);
    }

    #[tokio::test]
    async fn test_activate_twice_keeps_one_connection() {
        let fx = Fixture::new();
        fx.host.open_tab(1, 10);

        let lifecycle = fx.lifecycle(1);
        let mut rx = lifecycle.subscribe_state();
        lifecycle.activate().await.unwrap();
        lifecycle.activate().await.unwrap();
        wait_for(&mut rx, LifecycleState::Connected { execution_id: None }).await;

        assert_eq!(fx.registry.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_stream_events_reach_store() {
        let fx = Fixture::new();
        fx.host.open_tab(1, 10);
        fx.registry.bind_tab_execution(10, "e1".into());

        let lifecycle = fx.lifecycle(1);
        let mut rx = lifecycle.subscribe_state();
        lifecycle.activate().await.unwrap();
        wait_for(
            &mut rx,
            LifecycleState::Connected {
                execution_id: Some("e1".into()),
            },
        )
        .await;

        let id = ExecutionId::from("e1");
        fx.channels.publish(
            &id,
            StreamEvent::Message {
                message: Message::new("m1", MessageRole::Assistant, "hi", 1),
            },
        );
        fx.channels.publish(&id, WorkflowStatus::Success);

        tokio::time::timeout(Duration::from_secs(5), async {
            while fx.store.processing(&id) || fx.store.messages(&id).is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(fx.store.visible_messages().len(), 1);
    }

    #[tokio::test]
    async fn test_tab_switch_rebinds() {
        let fx = Fixture::new();
        fx.host.open_tab(1, 10);
        fx.host.open_tab(1, 11);
        fx.registry.bind_tab_execution(10, "e1".into());
        fx.registry.bind_tab_execution(11, "e2".into());

        let lifecycle = fx.lifecycle(1);
        let mut rx = lifecycle.subscribe_state();
        lifecycle.activate().await.unwrap();
        wait_for(
            &mut rx,
            LifecycleState::Connected {
                execution_id: Some("e1".into()),
            },
        )
        .await;

        fx.host.activate_tab(1, 11);
        fx.registry.on_tab_activated(1, 11);
        lifecycle.on_tab_activated(11).await.unwrap();

        wait_for(
            &mut rx,
            LifecycleState::Connected {
                execution_id: Some("e2".into()),
            },
        )
        .await;
        assert_eq!(fx.store.current_execution(), Some("e2".into()));
        assert_eq!(lifecycle.tab_id(), Some(11));
    }

    #[tokio::test]
    async fn test_null_context_clears_current() {
        let fx = Fixture::new();
        fx.host.open_tab(1, 10);
        fx.registry.bind_tab_execution(10, "e1".into());

        let lifecycle = fx.lifecycle(1);
        let mut rx = lifecycle.subscribe_state();
        lifecycle.activate().await.unwrap();
        wait_for(
            &mut rx,
            LifecycleState::Connected {
                execution_id: Some("e1".into()),
            },
        )
        .await;

        fx.registry.clear_tab_execution(10);
        wait_for(&mut rx, LifecycleState::Connected { execution_id: None }).await;
        assert_eq!(fx.store.current_execution(), None);
        assert_eq!(fx.store.tab_binding(10), None);
    }

    #[tokio::test]
    async fn test_stale_guess_after_notification_is_dropped() {
        let fx = Fixture::new();
        let lifecycle = fx.lifecycle(1);
        fx.store.set_tab_binding(10, "cached".into());

        let version = lifecycle.begin_resolution();
        lifecycle.handle_frame(Frame::new(ServerMessage::context(
            Some("fresh".into()),
            Some(10),
        )));
        assert!(!lifecycle.apply_guess(version, Some(10), true));

        assert_eq!(fx.store.current_execution(), Some("fresh".into()));
    }

    #[tokio::test]
    async fn test_tab_switch_guess_agrees_with_state() {
        let fx = Fixture::new();
        fx.host.open_tab(1, 10);
        fx.host.open_tab(1, 11);
        fx.registry.bind_tab_execution(10, "e1".into());

        let lifecycle = fx.lifecycle(1);
        let mut rx = lifecycle.subscribe_state();
        lifecycle.activate().await.unwrap();
        wait_for(
            &mut rx,
            LifecycleState::Connected {
                execution_id: Some("e1".into()),
            },
        )
        .await;

        fx.store.set_tab_binding(11, "cached-e2".into());
        fx.host.activate_tab(1, 11);
        fx.registry.on_tab_activated(1, 11);
        lifecycle.on_tab_activated(11).await.unwrap();
        assert_eq!(
            lifecycle.state(),
            LifecycleState::Connected {
                execution_id: fx.store.current_execution()
            }
        );
        assert_eq!(fx.store.current_execution(), Some("cached-e2".into()));

        // Tab 11 has no binding on the router; the authoritative reply clears it.
        wait_for(&mut rx, LifecycleState::Connected { execution_id: None }).await;
        assert_eq!(fx.store.current_execution(), None);
        assert!(fx.store.visible_messages().is_empty());
    }

    #[tokio::test]
    async fn test_tab_switch_without_cache_is_unbound_and_empty() {
        let fx = Fixture::new();
        fx.host.open_tab(1, 10);
        fx.registry.bind_tab_execution(10, "e1".into());
        fx.store
            .upsert_message(&"e1".into(), Message::new("m1", MessageRole::Assistant, "hi", 1));

        let lifecycle = fx.lifecycle(1);
        let mut rx = lifecycle.subscribe_state();
        lifecycle.activate().await.unwrap();
        wait_for(
            &mut rx,
            LifecycleState::Connected {
                execution_id: Some("e1".into()),
            },
        )
        .await;

        lifecycle.on_tab_activated(12).await.unwrap();
        assert_eq!(lifecycle.state(), LifecycleState::Connected { execution_id: None });
        assert_eq!(fx.store.current_execution(), None);
        assert!(fx.store.visible_messages().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connected_surface_sweeps_idle_executions() {
        let fx = Fixture::new();
        fx.host.open_tab(1, 10);
        let config = RelayConfig {
            sweep_interval_secs: 60,
            ..RelayConfig::default()
        };
        let lifecycle = ConnectionLifecycle::with_config(
            Arc::new(LocalConnector::new(Arc::clone(&fx.registry))),
            Arc::clone(&fx.host) as Arc<dyn TabHost>,
            Arc::clone(&fx.store),
            1,
            "surface-1",
            &config,
        );
        fx.store
            .upsert_message(&"idle".into(), Message::new("m1", MessageRole::User, "x", 1));
        lifecycle.activate().await.unwrap();

        tokio::time::sleep(Duration::from_secs(31 * 60 + 60)).await;
        assert!(!fx.store.contains(&"idle".into()));

        lifecycle.shutdown();
        assert!(lifecycle.lock().sweeper.is_none());
    }

    #[tokio::test]
    async fn test_migration_follows_current() {
        let fx = Fixture::new();
        let lifecycle = fx.lifecycle(1);
        lifecycle.handle_frame(Frame::new(ServerMessage::context(Some("tmp".into()), None)));
        lifecycle.handle_frame(Frame::new(ServerMessage::ExecutionMigrated {
            from: "tmp".into(),
            to: "durable".into(),
        }));

        assert_eq!(
            lifecycle.state(),
            LifecycleState::Connected {
                execution_id: Some("durable".into())
            }
        );
        assert!(fx.store.contains(&"durable".into()));
        assert!(!fx.store.contains(&"tmp".into()));
    }

    #[tokio::test]
    async fn test_last_consumer_closes_connection() {
        let fx = Fixture::new();
        fx.host.open_tab(1, 10);

        let lifecycle = fx.lifecycle(1);
        let mut rx = lifecycle.subscribe_state();
        let first = lifecycle.attach();
        let second = lifecycle.attach();
        lifecycle.activate().await.unwrap();
        wait_for(&mut rx, LifecycleState::Connected { execution_id: None }).await;

        drop(first);
        assert_eq!(lifecycle.consumer_count(), 1);
        assert!(matches!(lifecycle.state(), LifecycleState::Connected { .. }));

        drop(second);
        assert_eq!(lifecycle.state(), LifecycleState::Disconnected);
        tokio::time::timeout(Duration::from_secs(5), async {
            while fx.registry.connection_count() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_router_close_marks_disconnected() {
        let fx = Fixture::new();
        fx.host.open_tab(1, 10);

        let lifecycle = fx.lifecycle(1);
        let mut rx = lifecycle.subscribe_state();
        lifecycle.activate().await.unwrap();
        wait_for(&mut rx, LifecycleState::Connected { execution_id: None }).await;

        let id = fx.registry.connections_in_window(1)[0].id;
        fx.registry.unregister_connection(id);
        wait_for(&mut rx, LifecycleState::Disconnected).await;
    }

    struct FailingConnector;

    #[async_trait]
    impl Connector for FailingConnector {
        async fn connect(&self) -> Result<ClientLink, TransportError> {
            Err(TransportError::Connection("refused".into()))
        }
    }

    #[tokio::test]
    async fn test_connect_failure_returns_to_disconnected() {
        let fx = Fixture::new();
        let lifecycle = ConnectionLifecycle::new(
            Arc::new(FailingConnector),
            Arc::clone(&fx.host) as Arc<dyn TabHost>,
            Arc::clone(&fx.store),
            1,
            "surface-1",
        );

        let err = tokio_test::assert_err!(lifecycle.activate().await);
        assert!(matches!(err, TransportError::Connection(_)));
        assert_eq!(lifecycle.state(), LifecycleState::Disconnected);
    }
}
