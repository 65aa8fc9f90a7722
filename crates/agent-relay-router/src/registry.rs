//! Connection registry.
//!
//! Owns the tab to execution bindings, the window to active tab map and the
//! table of live connections. Every mutation happens under one lock and never
//! across an await, so each operation is atomic with respect to the others.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{SystemTime, UNIX_EPOCH},
};

use agent_relay_core::{
    ChannelEvent, ChannelRegistry, ClientMessage, ConnectionId, ConnectionKind, DeliveryError,
    ExecutionId, Frame, Handshake, HostError, ProtocolError, ServerMessage, Subscription, TabHost,
    TabId, WindowId,
};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

/// Sender half a transport hands to the registry for one connection.
///
/// The registry holds the only copy; dropping it closes the connection.
pub type Outbound = mpsc::UnboundedSender<Frame<ServerMessage>>;

/// Router error.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),
    #[error("Stale context: tab {0} is no longer tracked")]
    StaleContext(TabId),
    #[error("Host error: {0}")]
    Host(#[from] HostError),
    #[error("Handshake required as first frame")]
    HandshakeRequired,
    #[error("Connection already completed its handshake")]
    AlreadyHandshaken,
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Who created a tab binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BindingOrigin {
    /// Announced by the execution engine; lives until the tab or execution goes away.
    Engine,
    /// Asserted by a connection; dropped with the last connection on that tab.
    Connection,
}

#[derive(Debug, Clone)]
struct TabBinding {
    execution_id: ExecutionId,
    origin: BindingOrigin,
}

/// Snapshot of one connection's routing state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub kind: ConnectionKind,
    pub name: Option<String>,
    pub tab_id: Option<TabId>,
    /// Set only for window-scoped connections.
    pub window_id: Option<WindowId>,
    pub execution_id: Option<ExecutionId>,
    /// Unix epoch milliseconds.
    pub connected_at: i64,
}

struct ConnectionEntry {
    info: ConnectionInfo,
    outbound: Outbound,
    subscription: Option<Subscription>,
    /// Never sent on; receivers observe the drop when the entry is removed.
    removed: watch::Sender<()>,
}

impl ConnectionEntry {
    /// Point the connection at `execution_id`, releasing any previous
    /// subscription first. Returns the execution whose subscription was released.
    fn rebind(
        &mut self,
        channels: &ChannelRegistry,
        execution_id: Option<&ExecutionId>,
    ) -> Option<ExecutionId> {
        let already_bound = match execution_id {
            Some(target) => self
                .subscription
                .as_ref()
                .is_some_and(|s| s.execution_id() == target),
            None => self.subscription.is_none(),
        };
        if already_bound {
            self.info.execution_id = execution_id.cloned();
            return None;
        }

        let released = self.subscription.take().map(|subscription| {
            let previous = subscription.execution_id().clone();
            subscription.unsubscribe();
            previous
        });

        self.info.execution_id = execution_id.cloned();
        if let Some(target) = execution_id {
            self.subscription = Some(forward(channels, target, self.outbound.clone()));
        }

        tracing::debug!(
            connection = %self.info.id,
            from = ?released,
            to = ?self.info.execution_id,
            "Rebound connection"
        );
        released
    }

    /// Send a frame; a closed connection is logged and skipped.
    fn post(&self, frame: Frame<ServerMessage>) {
        if self.outbound.send(frame).is_err() {
            tracing::debug!(connection = %self.info.id, "Dropping frame for closed connection");
        }
    }

    fn post_context(&self, reply_id: Option<String>) {
        self.post(Frame {
            id: reply_id,
            message: ServerMessage::context(self.info.execution_id.clone(), self.info.tab_id),
        });
    }
}

/// Subscribe a connection's outbound sender to an execution channel.
fn forward(channels: &ChannelRegistry, execution_id: &ExecutionId, outbound: Outbound) -> Subscription {
    let source = execution_id.clone();
    channels.channel(execution_id).subscribe(move |event| {
        let message = match event {
            ChannelEvent::Stream(event) => ServerMessage::AgentStreamUpdate {
                execution_id: source.clone(),
                event: event.clone(),
            },
            ChannelEvent::Status(status) => ServerMessage::WorkflowStatus {
                execution_id: source.clone(),
                status: status.clone(),
            },
        };
        outbound
            .send(Frame::new(message))
            .map_err(|_| DeliveryError::Closed)
    })
}

#[derive(Default)]
struct RegistryState {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    tab_bindings: HashMap<TabId, TabBinding>,
    active_tabs: HashMap<WindowId, TabId>,
}

impl RegistryState {
    fn binding(&self, tab_id: TabId) -> Option<ExecutionId> {
        self.tab_bindings
            .get(&tab_id)
            .map(|b| b.execution_id.clone())
    }

    /// Rebind every connection showing `tab_id` (pinned connections and the
    /// surfaces whose window has it active).
    fn rebind_tab(
        &mut self,
        channels: &ChannelRegistry,
        tab_id: TabId,
        execution_id: Option<&ExecutionId>,
    ) -> Vec<ExecutionId> {
        let mut released = Vec::new();
        for entry in self
            .connections
            .values_mut()
            .filter(|e| e.info.kind != ConnectionKind::Observer && e.info.tab_id == Some(tab_id))
        {
            released.extend(entry.rebind(channels, execution_id));
            entry.post_context(None);
        }
        released
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Authoritative multiplexer between tabs, windows, connections and execution channels.
pub struct ConnectionRegistry {
    channels: Arc<ChannelRegistry>,
    host: Arc<dyn TabHost>,
    state: Mutex<RegistryState>,
}

impl ConnectionRegistry {
    /// Create a registry routing events from `channels`, consulting `host` for tab state.
    #[must_use]
    pub fn new(channels: Arc<ChannelRegistry>, host: Arc<dyn TabHost>) -> Self {
        Self {
            channels,
            host,
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Channels this registry routes from.
    #[must_use]
    pub const fn channels(&self) -> &Arc<ChannelRegistry> {
        &self.channels
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release_channels(&self, released: impl IntoIterator<Item = ExecutionId>) {
        for execution_id in released {
            self.channels.release(&execution_id);
        }
    }

    async fn query_window(&self, tab_id: TabId) -> Option<WindowId> {
        match self.host.window_of_tab(tab_id).await {
            Ok(window_id) => window_id,
            Err(e) => {
                tracing::warn!(tab_id, "Failed to resolve window of tab: {e}");
                None
            }
        }
    }

    async fn query_active_tab(&self, window_id: WindowId) -> Option<TabId> {
        match self.host.active_tab(window_id).await {
            Ok(tab_id) => tab_id,
            Err(e) => {
                tracing::warn!(window_id, "Failed to resolve active tab: {e}");
                None
            }
        }
    }

    /// Register a connection from its handshake and resolve its initial binding.
    ///
    /// Resolution order: an explicit execution hint, then the hinted tab's
    /// binding, otherwise unbound. A window surface instead follows its
    /// window's active tab, ignoring hints that point elsewhere. The
    /// connection is always told its context before this returns.
    ///
    /// # Errors
    /// Currently infallible; host failures degrade to an unresolved window.
    pub async fn register_connection(
        &self,
        handshake: Handshake,
        outbound: Outbound,
    ) -> Result<ConnectionId, RouterError> {
        let window_scoped = handshake.kind.is_window_scoped();

        // Only surfaces belong to a window; pinned connections follow their tab.
        let window_id = match (window_scoped, handshake.window_id, handshake.tab_id) {
            (false, _, _) | (true, None, None) => None,
            (true, Some(w), _) => Some(w),
            (true, None, Some(tab_id)) => self.query_window(tab_id).await,
        };
        let host_active = match window_id {
            Some(w) => self.query_active_tab(w).await,
            None => None,
        };

        let id = Uuid::new_v4();
        let mut state = self.lock();

        // An activation recorded while we were querying the host is newer
        // than the host's answer.
        let active_tab = match window_id {
            Some(w) => match state.active_tabs.get(&w) {
                Some(tab) => Some(*tab),
                None => {
                    if let Some(tab) = host_active {
                        state.active_tabs.insert(w, tab);
                    }
                    host_active
                }
            },
            None => None,
        };

        let (tab_id, execution_id) = match (window_scoped, active_tab) {
            (true, Some(active)) => {
                let hint_matches = handshake.tab_id.is_none_or(|t| t == active);
                let execution_id = state
                    .binding(active)
                    .or_else(|| handshake.execution_id.clone().filter(|_| hint_matches));
                (Some(active), execution_id)
            }
            _ => {
                let execution_id = handshake
                    .execution_id
                    .clone()
                    .or_else(|| handshake.tab_id.and_then(|t| state.binding(t)));
                (handshake.tab_id, execution_id)
            }
        };

        let mut entry = ConnectionEntry {
            info: ConnectionInfo {
                id,
                kind: handshake.kind,
                name: handshake.name,
                tab_id,
                window_id,
                execution_id: None,
                connected_at: now_millis(),
            },
            outbound,
            subscription: None,
            removed: watch::Sender::new(()),
        };
        entry.rebind(&self.channels, execution_id.as_ref());
        entry.post_context(None);

        tracing::info!(
            connection = %id,
            kind = ?entry.info.kind,
            tab_id = ?entry.info.tab_id,
            window_id = ?entry.info.window_id,
            execution_id = ?entry.info.execution_id,
            "Registered connection"
        );
        state.connections.insert(id, entry);
        Ok(id)
    }

    /// Bind a connection to an execution, optionally recording the tab it runs in.
    ///
    /// Rebinding to the current execution keeps the existing subscription,
    /// but the context notice is always re-sent.
    ///
    /// # Errors
    /// Returns error if the connection is not registered.
    pub fn set_connection_execution(
        &self,
        id: ConnectionId,
        execution_id: ExecutionId,
        tab_id: Option<TabId>,
    ) -> Result<(), RouterError> {
        let released = {
            let mut state = self.lock();
            let RegistryState {
                connections,
                tab_bindings,
                ..
            } = &mut *state;
            let entry = connections
                .get_mut(&id)
                .ok_or(RouterError::UnknownConnection(id))?;

            if let Some(tab_id) = tab_id {
                entry.info.tab_id = Some(tab_id);
                let unchanged = tab_bindings
                    .get(&tab_id)
                    .is_some_and(|b| b.execution_id == execution_id);
                if !unchanged {
                    tab_bindings.insert(
                        tab_id,
                        TabBinding {
                            execution_id: execution_id.clone(),
                            origin: BindingOrigin::Connection,
                        },
                    );
                }
            }

            let released = entry.rebind(&self.channels, Some(&execution_id));
            entry.post_context(None);
            released
        };
        self.release_channels(released);
        Ok(())
    }

    /// Rebind every surface of a window to the newly active tab's execution,
    /// or clear them all if it has none. Returns how many surfaces were notified.
    ///
    /// Runs under a single lock, so no surface of the window can be observed
    /// on the old binding once another has moved.
    pub fn notify_window_surfaces(
        &self,
        window_id: WindowId,
        active_tab: TabId,
        execution_id: Option<ExecutionId>,
    ) -> usize {
        let mut released = Vec::new();
        let notified = {
            let mut state = self.lock();
            state.active_tabs.insert(window_id, active_tab);

            let mut notified = 0;
            for entry in state
                .connections
                .values_mut()
                .filter(|e| e.info.window_id == Some(window_id))
            {
                entry.info.tab_id = Some(active_tab);
                released.extend(entry.rebind(&self.channels, execution_id.as_ref()));
                entry.post_context(None);
                notified += 1;
            }
            notified
        };
        tracing::debug!(window_id, active_tab, ?execution_id, notified, "Window surfaces rebound");
        self.release_channels(released);
        notified
    }

    /// Host signal: a tab became active in its window.
    pub fn on_tab_activated(&self, window_id: WindowId, tab_id: TabId) -> usize {
        let execution_id = self.lock().binding(tab_id);
        self.notify_window_surfaces(window_id, tab_id, execution_id)
    }

    /// Host signal: a tab was closed.
    pub fn on_tab_removed(&self, tab_id: TabId) -> usize {
        self.cleanup_tab_ports(tab_id)
    }

    /// Execution engine signal: an execution now runs in `tab_id`.
    ///
    /// Connections showing that tab are rebound immediately.
    pub fn bind_tab_execution(&self, tab_id: TabId, execution_id: ExecutionId) {
        let released = {
            let mut state = self.lock();
            state.tab_bindings.insert(
                tab_id,
                TabBinding {
                    execution_id: execution_id.clone(),
                    origin: BindingOrigin::Engine,
                },
            );
            state.rebind_tab(&self.channels, tab_id, Some(&execution_id))
        };
        tracing::info!(tab_id, %execution_id, "Tab bound to execution");
        self.release_channels(released);
    }

    /// Execution engine signal: nothing runs in `tab_id` any more.
    pub fn clear_tab_execution(&self, tab_id: TabId) {
        let released = {
            let mut state = self.lock();
            if state.tab_bindings.remove(&tab_id).is_none() {
                return;
            }
            state.rebind_tab(&self.channels, tab_id, None)
        };
        tracing::info!(tab_id, "Tab binding cleared");
        self.release_channels(released);
    }

    /// Forget a closed tab: drop its binding, disconnect connections pinned
    /// to it and clear surfaces that were showing it.
    ///
    /// Returns how many connections were disconnected.
    pub fn cleanup_tab_ports(&self, tab_id: TabId) -> usize {
        let mut released = Vec::new();
        let disconnected = {
            let mut state = self.lock();
            state.tab_bindings.remove(&tab_id);
            state.active_tabs.retain(|_, active| *active != tab_id);

            let pinned: Vec<ConnectionId> = state
                .connections
                .values()
                .filter(|e| e.info.kind == ConnectionKind::Tab && e.info.tab_id == Some(tab_id))
                .map(|e| e.info.id)
                .collect();
            for id in &pinned {
                if let Some(mut entry) = state.connections.remove(id) {
                    released.extend(entry.rebind(&self.channels, None));
                    // Dropping the entry drops the only outbound sender.
                }
            }

            released.extend(state.rebind_tab(&self.channels, tab_id, None));
            pinned.len()
        };
        tracing::info!(tab_id, disconnected, "Cleaned up closed tab");
        self.release_channels(released);
        disconnected
    }

    /// Remove a connection, releasing its subscription.
    ///
    /// A connection-created tab binding is dropped with the last connection
    /// referencing that tab. Returns false if the connection was already gone.
    pub fn unregister_connection(&self, id: ConnectionId) -> bool {
        let released = {
            let mut state = self.lock();
            let Some(mut entry) = state.connections.remove(&id) else {
                return false;
            };
            let released = entry.rebind(&self.channels, None);

            if let Some(tab_id) = entry.info.tab_id {
                let referenced = state
                    .connections
                    .values()
                    .any(|e| e.info.tab_id == Some(tab_id));
                let connection_owned = state
                    .tab_bindings
                    .get(&tab_id)
                    .is_some_and(|b| b.origin == BindingOrigin::Connection);
                if !referenced && connection_owned {
                    state.tab_bindings.remove(&tab_id);
                }
            }
            tracing::info!(connection = %id, "Unregistered connection");
            released
        };
        self.release_channels(released);
        true
    }

    /// Replace a provisional execution id with its durable one everywhere.
    pub fn migrate_execution(&self, from: &ExecutionId, to: &ExecutionId) {
        let released = {
            let mut state = self.lock();
            for binding in state.tab_bindings.values_mut() {
                if &binding.execution_id == from {
                    binding.execution_id = to.clone();
                }
            }

            let mut released = Vec::new();
            for entry in state
                .connections
                .values_mut()
                .filter(|e| e.info.execution_id.as_ref() == Some(from))
            {
                released.extend(entry.rebind(&self.channels, Some(to)));
                entry.post(Frame::new(ServerMessage::ExecutionMigrated {
                    from: from.clone(),
                    to: to.clone(),
                }));
                entry.post_context(None);
            }
            released
        };
        tracing::info!(%from, %to, "Migrated execution");
        self.release_channels(released);
    }

    /// Handle a frame received on an established connection.
    ///
    /// # Errors
    /// Returns error if the connection is unknown or the frame is not valid here.
    pub async fn handle_client_frame(
        &self,
        id: ConnectionId,
        frame: Frame<ClientMessage>,
    ) -> Result<(), RouterError> {
        match frame.message {
            ClientMessage::Ping => {
                self.post(id, Frame {
                    id: frame.id,
                    message: ServerMessage::Pong,
                })
            }
            ClientMessage::Handshake(_) => {
                self.post(id, frame.reply(ServerMessage::error("handshake already completed")))?;
                Err(RouterError::AlreadyHandshaken)
            }
            ClientMessage::SyncRequest {
                connection_name,
                tab_id,
            } => {
                tracing::debug!(connection = %id, %connection_name, ?tab_id, "Sync requested");
                self.resync(id, tab_id, frame.id).await
            }
        }
    }

    /// Re-resolve a connection's binding and reply with its context.
    ///
    /// A requested tab the host no longer knows is stale and resolves to a
    /// cleared binding.
    async fn resync(
        &self,
        id: ConnectionId,
        requested_tab: Option<TabId>,
        reply_id: Option<String>,
    ) -> Result<(), RouterError> {
        if !self.lock().connections.contains_key(&id) {
            return Err(RouterError::UnknownConnection(id));
        }

        let stale = match requested_tab {
            Some(tab_id) => match self.host.window_of_tab(tab_id).await {
                Ok(window) => window.is_none(),
                Err(e) => {
                    tracing::warn!(tab_id, "Host check failed during sync: {e}");
                    false
                }
            },
            None => false,
        };

        let released = {
            let mut state = self.lock();
            let RegistryState {
                connections,
                tab_bindings,
                active_tabs,
            } = &mut *state;
            // The connection may have closed while the host was queried.
            let entry = connections
                .get_mut(&id)
                .ok_or(RouterError::UnknownConnection(id))?;

            let tab_id = match entry.info.kind {
                ConnectionKind::Surface => entry
                    .info
                    .window_id
                    .and_then(|w| active_tabs.get(&w).copied())
                    .or(requested_tab),
                ConnectionKind::Tab => entry.info.tab_id.or(requested_tab),
                ConnectionKind::Observer => requested_tab.or(entry.info.tab_id),
            };

            let execution_id = match tab_id {
                Some(tab) if stale && Some(tab) == requested_tab => {
                    tracing::warn!(connection = %id, "{}", RouterError::StaleContext(tab));
                    None
                }
                Some(tab) => tab_bindings.get(&tab).map(|b| b.execution_id.clone()),
                None => entry.info.execution_id.clone(),
            };
            let execution_id = match (entry.info.kind, execution_id) {
                (ConnectionKind::Observer, None) if !stale => entry.info.execution_id.clone(),
                (_, execution_id) => execution_id,
            };

            entry.info.tab_id = tab_id;
            let released = entry.rebind(&self.channels, execution_id.as_ref());
            entry.post_context(reply_id);
            released
        };
        self.release_channels(released);
        Ok(())
    }

    /// Send a frame to one connection.
    ///
    /// # Errors
    /// Returns error if the connection is not registered. A registered but
    /// closed connection is logged and skipped.
    pub fn post(&self, id: ConnectionId, frame: Frame<ServerMessage>) -> Result<(), RouterError> {
        let state = self.lock();
        let entry = state
            .connections
            .get(&id)
            .ok_or(RouterError::UnknownConnection(id))?;
        entry.post(frame);
        Ok(())
    }

    /// Execution currently bound to a tab.
    #[must_use]
    pub fn lookup_tab(&self, tab_id: TabId) -> Option<ExecutionId> {
        self.lock().binding(tab_id)
    }

    /// Active tab of a window, as last recorded by the registry.
    #[must_use]
    pub fn active_tab(&self, window_id: WindowId) -> Option<TabId> {
        self.lock().active_tabs.get(&window_id).copied()
    }

    /// Snapshot of one connection.
    #[must_use]
    pub fn connection(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.lock().connections.get(&id).map(|e| e.info.clone())
    }

    /// Whether a connection is still registered.
    #[must_use]
    pub fn is_connected(&self, id: ConnectionId) -> bool {
        self.lock().connections.contains_key(&id)
    }

    /// Snapshots of the surfaces belonging to a window.
    #[must_use]
    pub fn connections_in_window(&self, window_id: WindowId) -> Vec<ConnectionInfo> {
        self.lock()
            .connections
            .values()
            .filter(|e| e.info.window_id == Some(window_id))
            .map(|e| e.info.clone())
            .collect()
    }

    /// Watch for the connection's removal: `changed()` on the receiver
    /// errors once the registry has dropped it. `None` if already gone.
    #[must_use]
    pub fn watch_removal(&self, id: ConnectionId) -> Option<watch::Receiver<()>> {
        self.lock()
            .connections
            .get(&id)
            .map(|e| e.removed.subscribe())
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }
}
