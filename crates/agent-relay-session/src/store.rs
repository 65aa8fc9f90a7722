//! Per-surface cache of execution state.
//!
//! A surface can be destroyed and recreated while executions keep running;
//! this store keeps what it has seen so a rebind shows the conversation again.
//! The record of the currently visible execution is never evicted.

use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock, RwLockWriteGuard},
    time::Duration,
};

use agent_relay_core::{
    ExecutionId, Feedback, Message, RelayConfig, StreamEvent, TabId, WorkflowStatus,
};
use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};

use crate::execution::{ExecutionState, UpsertOutcome};

/// Limits applied by eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionPolicy {
    /// Executions idle longer than this are removed.
    pub max_age: Duration,
    /// At most this many executions are kept.
    pub max_executions: usize,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(30 * 60),
            max_executions: 20,
        }
    }
}

impl From<&RelayConfig> for EvictionPolicy {
    fn from(config: &RelayConfig) -> Self {
        Self {
            max_age: config.max_execution_age(),
            max_executions: config.max_executions,
        }
    }
}

#[derive(Default)]
struct Inner {
    executions: HashMap<ExecutionId, ExecutionState>,
    tab_bindings: HashMap<TabId, ExecutionId>,
    current: Option<ExecutionId>,
}

impl Inner {
    /// Get or create a record. Returns whether it was created.
    fn record(&mut self, id: &ExecutionId, now: Instant) -> (&mut ExecutionState, bool) {
        let mut created = false;
        let state = self.executions.entry(id.clone()).or_insert_with(|| {
            created = true;
            ExecutionState::new(now)
        });
        (state, created)
    }

    fn evict(&mut self, policy: EvictionPolicy, now: Instant) -> Vec<ExecutionId> {
        let Self {
            executions,
            tab_bindings,
            current,
        } = self;
        let protected = current.as_ref();
        let mut removed = Vec::new();

        executions.retain(|id, state| {
            let keep = Some(id) == protected
                || now.duration_since(state.last_activity_at()) <= policy.max_age;
            if !keep {
                removed.push(id.clone());
            }
            keep
        });

        if executions.len() > policy.max_executions {
            let mut candidates: Vec<(Instant, ExecutionId)> = executions
                .iter()
                .filter(|(id, _)| Some(*id) != protected)
                .map(|(id, state)| (state.last_activity_at(), id.clone()))
                .collect();
            candidates.sort();
            let excess = executions.len() - policy.max_executions;
            for (_, id) in candidates.into_iter().take(excess) {
                executions.remove(&id);
                removed.push(id);
            }
        }

        if !removed.is_empty() {
            tab_bindings.retain(|_, id| executions.contains_key(&*id));
            tracing::debug!(evicted = removed.len(), remaining = executions.len(), "Evicted executions");
        }
        removed
    }
}

/// Cache of execution conversations seen by one surface.
pub struct ClientSessionStore {
    inner: RwLock<Inner>,
    policy: EvictionPolicy,
}

impl Default for ClientSessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientSessionStore {
    /// Create a store with the default limits (30 minutes, 20 executions).
    #[must_use]
    pub fn new() -> Self {
        Self::with_policy(EvictionPolicy::default())
    }

    /// Create a store with custom limits.
    #[must_use]
    pub fn with_policy(policy: EvictionPolicy) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            policy,
        }
    }

    #[must_use]
    pub const fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` on the execution's record, creating it if absent. A newly
    /// created record triggers an eviction check.
    fn mutate<R>(&self, id: &ExecutionId, f: impl FnOnce(&mut ExecutionState, Instant) -> R) -> R {
        let now = Instant::now();
        let mut inner = self.write();
        let (state, created) = inner.record(id, now);
        let result = f(state, now);
        if created {
            inner.evict(self.policy, now);
        }
        result
    }

    /// Insert a message, or replace the content and timestamp of the message
    /// with the same id. A new id marks the execution as processing.
    pub fn upsert_message(&self, id: &ExecutionId, message: Message) -> UpsertOutcome {
        self.mutate(id, |state, now| state.upsert(message, now))
    }

    /// Set the processing flag.
    pub fn set_processing(&self, id: &ExecutionId, processing: bool) {
        self.mutate(id, |state, _| state.set_processing(processing));
    }

    /// Set or clear the error.
    pub fn set_error(&self, id: &ExecutionId, error: Option<String>) {
        self.mutate(id, |state, _| state.set_error(error));
    }

    /// Attach feedback to a message.
    pub fn set_feedback(&self, id: &ExecutionId, msg_id: impl Into<String>, feedback: Feedback) {
        let msg_id = msg_id.into();
        self.mutate(id, |state, _| state.set_feedback(msg_id, feedback));
    }

    /// Make sure a record exists for the execution.
    pub fn ensure_execution(&self, id: &ExecutionId) {
        self.mutate(id, |_, _| ());
    }

    /// Apply an event forwarded from the execution's channel.
    pub fn apply_stream_event(&self, id: &ExecutionId, event: StreamEvent) {
        match event {
            StreamEvent::Message { message } => {
                self.upsert_message(id, message);
            }
            StreamEvent::Error { message } => self.mutate(id, |state, now| {
                state.touch(now);
                state.set_error(Some(message));
                state.set_processing(false);
            }),
        }
    }

    /// Apply an execution lifecycle signal.
    pub fn apply_workflow_status(&self, id: &ExecutionId, status: WorkflowStatus) {
        self.mutate(id, |state, now| {
            state.touch(now);
            match status {
                WorkflowStatus::Running => state.set_processing(true),
                WorkflowStatus::Success | WorkflowStatus::Cancelled => state.set_processing(false),
                WorkflowStatus::Error { message } => {
                    state.set_processing(false);
                    state.set_error(Some(message));
                }
            }
        });
    }

    /// Move everything known about `from` onto `to` and forget `from`.
    ///
    /// `to` wins conflicts; tab bindings and the visible binding pointing at
    /// `from` are rewritten.
    pub fn migrate_execution_state(&self, from: &ExecutionId, to: &ExecutionId) {
        if from == to {
            return;
        }
        let now = Instant::now();
        let mut inner = self.write();

        if let Some(source) = inner.executions.remove(from) {
            let existed = inner.executions.contains_key(to);
            let (dest, _) = inner.record(to, now);
            dest.absorb(source, existed);
        }
        for bound in inner.tab_bindings.values_mut() {
            if bound == from {
                *bound = to.clone();
            }
        }
        if inner.current.as_ref() == Some(from) {
            inner.current = Some(to.clone());
        }
        tracing::debug!(%from, %to, "Migrated execution state");
    }

    /// Evict executions idle past the age limit, then the least recently
    /// active ones beyond the count limit. The visible execution is kept.
    ///
    /// Returns the evicted ids.
    pub fn cleanup_old_executions(&self) -> Vec<ExecutionId> {
        self.write().evict(self.policy, Instant::now())
    }

    /// Forget an execution.
    pub fn remove_execution(&self, id: &ExecutionId) -> bool {
        let mut inner = self.write();
        if inner.current.as_ref() == Some(id) {
            inner.current = None;
        }
        inner.tab_bindings.retain(|_, bound| bound != id);
        inner.executions.remove(id).is_some()
    }

    /// Set the visible execution. A bound execution gets a record so its
    /// cached messages show immediately.
    pub fn set_current(&self, id: Option<ExecutionId>) {
        match id {
            Some(id) => {
                let now = Instant::now();
                let mut inner = self.write();
                let (_, created) = inner.record(&id, now);
                inner.current = Some(id);
                if created {
                    inner.evict(self.policy, now);
                }
            }
            None => self.write().current = None,
        }
    }

    /// Visible execution, if any.
    #[must_use]
    pub fn current_execution(&self) -> Option<ExecutionId> {
        self.read(|inner| inner.current.clone())
    }

    /// Mirror a tab binding learned from the router.
    pub fn set_tab_binding(&self, tab_id: TabId, id: ExecutionId) {
        self.write().tab_bindings.insert(tab_id, id);
    }

    /// Drop a mirrored tab binding.
    pub fn remove_tab_binding(&self, tab_id: TabId) {
        self.write().tab_bindings.remove(&tab_id);
    }

    /// Last known execution of a tab. Advisory only.
    #[must_use]
    pub fn tab_binding(&self, tab_id: TabId) -> Option<ExecutionId> {
        self.read(|inner| inner.tab_bindings.get(&tab_id).cloned())
    }

    fn read<R>(&self, f: impl FnOnce(&Inner) -> R) -> R {
        f(&self.inner.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Read one execution's record without copying it.
    pub fn with_execution<R>(&self, id: &ExecutionId, f: impl FnOnce(&ExecutionState) -> R) -> Option<R> {
        self.read(|inner| inner.executions.get(id).map(f))
    }

    /// Messages of an execution; empty if unknown.
    #[must_use]
    pub fn messages(&self, id: &ExecutionId) -> Vec<Message> {
        self.with_execution(id, |state| state.messages().to_vec())
            .unwrap_or_default()
    }

    /// Messages of the visible execution; empty when nothing is bound.
    #[must_use]
    pub fn visible_messages(&self) -> Vec<Message> {
        self.read(|inner| {
            inner
                .current
                .as_ref()
                .and_then(|id| inner.executions.get(id))
                .map(|state| state.messages().to_vec())
                .unwrap_or_default()
        })
    }

    #[must_use]
    pub fn processing(&self, id: &ExecutionId) -> bool {
        self.with_execution(id, ExecutionState::processing)
            .unwrap_or(false)
    }

    #[must_use]
    pub fn error(&self, id: &ExecutionId) -> Option<String> {
        self.with_execution(id, |state| state.error().map(str::to_string))
            .flatten()
    }

    #[must_use]
    pub fn feedback(&self, id: &ExecutionId) -> HashMap<String, Feedback> {
        self.with_execution(id, |state| state.feedback().clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn contains(&self, id: &ExecutionId) -> bool {
        self.read(|inner| inner.executions.contains_key(id))
    }

    #[must_use]
    pub fn execution_ids(&self) -> Vec<ExecutionId> {
        self.read(|inner| inner.executions.keys().cloned().collect())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read(|inner| inner.executions.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run eviction every `interval` until the store is dropped.
    ///
    /// A connected `ConnectionLifecycle` runs one for its store; embedders
    /// using the store on its own must start it themselves.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                store.cleanup_old_executions();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use agent_relay_core::{FeedbackRating, MessageRole};

    use super::*;

    fn msg(id: &str, content: &str, ts: i64) -> Message {
        Message::new(id, MessageRole::Assistant, content, ts)
    }

    fn exec(id: &str) -> ExecutionId {
        ExecutionId::from(id)
    }

    #[test]
    fn test_progressive_upsert_keeps_one_message() {
        let store = ClientSessionStore::new();
        let id = exec("exec-1");

        assert_eq!(
            store.upsert_message(&id, msg("m1", "Thi", 100)),
            UpsertOutcome::Inserted
        );
        assert!(store.processing(&id));
        store.set_processing(&id, false);

        assert_eq!(
            store.upsert_message(&id, msg("m1", "This is done", 150)),
            UpsertOutcome::Replaced
        );
        let messages = store.messages(&id);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "This is done");
        assert_eq!(messages[0].timestamp, 150);
        assert!(!store.processing(&id));
    }

    #[test]
    fn test_repeated_upserts_end_with_last_values() {
        let store = ClientSessionStore::new();
        let id = exec("exec-1");
        for (i, text) in ["a", "b", "c", "d"].iter().enumerate() {
            store.upsert_message(&id, msg("m1", text, i64::try_from(i).unwrap()));
            store.upsert_message(&id, msg("other", "x", 0));
        }
        let messages = store.messages(&id);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].msg_id, "m1");
        assert_eq!(messages[0].content, "d");
        assert_eq!(messages[0].timestamp, 3);
    }

    #[test]
    fn test_scoped_mutations_create_records() {
        let store = ClientSessionStore::new();
        let id = exec("exec-1");
        store.set_error(&id, Some("boom".into()));
        assert!(store.contains(&id));
        assert_eq!(store.error(&id), Some("boom".into()));
        assert!(!store.processing(&id));

        store.set_processing(&exec("exec-2"), true);
        assert!(store.processing(&exec("exec-2")));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_stream_and_status_events() {
        let store = ClientSessionStore::new();
        let id = exec("exec-1");
        store.apply_stream_event(&id, StreamEvent::Message {
            message: msg("m1", "hi", 1),
        });
        assert!(store.processing(&id));

        store.apply_workflow_status(&id, WorkflowStatus::Success);
        assert!(!store.processing(&id));

        store.apply_workflow_status(&id, WorkflowStatus::Running);
        store.apply_workflow_status(&id, WorkflowStatus::Error {
            message: "failed".into(),
        });
        assert!(!store.processing(&id));
        assert_eq!(store.error(&id), Some("failed".into()));

        store.apply_stream_event(&id, StreamEvent::Error {
            message: "again".into(),
        });
        assert_eq!(store.error(&id), Some("again".into()));
    }

    #[test]
    fn test_migration_merges_and_rewrites_bindings() {
        let store = ClientSessionStore::new();
        let (from, to) = (exec("temp"), exec("durable"));
        store.upsert_message(&from, msg("m1", "from temp", 1));
        store.upsert_message(&from, msg("m2", "shared (temp)", 2));
        store.set_feedback(&from, "m1", Feedback {
            rating: FeedbackRating::Positive,
            comment: None,
        });
        store.upsert_message(&to, msg("m2", "shared (durable)", 3));
        store.set_processing(&to, false);
        store.set_tab_binding(9, from.clone());
        store.set_current(Some(from.clone()));

        store.migrate_execution_state(&from, &to);

        assert!(!store.contains(&from));
        let contents: Vec<String> = store.messages(&to).into_iter().map(|m| m.content).collect();
        assert_eq!(contents, vec!["from temp", "shared (durable)"]);
        assert!(!store.processing(&to));
        assert_eq!(store.feedback(&to)["m1"].rating, FeedbackRating::Positive);
        assert_eq!(store.tab_binding(9), Some(to.clone()));
        assert_eq!(store.current_execution(), Some(to));
    }

    #[test]
    fn test_migration_to_unknown_destination_moves_record() {
        let store = ClientSessionStore::new();
        let (from, to) = (exec("temp"), exec("durable"));
        store.upsert_message(&from, msg("m1", "x", 1));

        store.migrate_execution_state(&from, &to);
        assert!(store.processing(&to));
        assert_eq!(store.messages(&to).len(), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_visible_messages_follow_binding() {
        let store = ClientSessionStore::new();
        let id = exec("exec-1");
        store.upsert_message(&id, msg("m1", "x", 1));
        assert!(store.visible_messages().is_empty());

        store.set_current(Some(id));
        assert_eq!(store.visible_messages().len(), 1);

        store.set_current(None);
        assert!(store.visible_messages().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_executions_are_evicted() {
        let store = ClientSessionStore::new();
        store.upsert_message(&exec("old"), msg("m1", "x", 1));
        store.upsert_message(&exec("bound"), msg("m1", "x", 1));
        store.set_current(Some(exec("bound")));
        store.set_tab_binding(1, exec("old"));

        tokio::time::advance(Duration::from_secs(29 * 60)).await;
        assert!(store.cleanup_old_executions().is_empty());

        tokio::time::advance(Duration::from_secs(2 * 60)).await;
        let evicted = store.cleanup_old_executions();
        assert_eq!(evicted, vec![exec("old")]);
        assert!(store.contains(&exec("bound")));
        assert_eq!(store.tab_binding(1), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_record_triggers_eviction() {
        let store = ClientSessionStore::new();
        store.upsert_message(&exec("old"), msg("m1", "x", 1));

        tokio::time::advance(Duration::from_secs(31 * 60)).await;
        store.upsert_message(&exec("fresh"), msg("m1", "x", 1));

        assert!(!store.contains(&exec("old")));
        assert!(store.contains(&exec("fresh")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_count_cap_removes_least_recent_but_keeps_bound() {
        let store = ClientSessionStore::new();
        store.upsert_message(&exec("bound"), msg("m1", "x", 1));
        store.set_current(Some(exec("bound")));

        for i in 0..25 {
            tokio::time::advance(Duration::from_secs(1)).await;
            store.upsert_message(&exec(&format!("exec-{i}")), msg("m1", "x", 1));
        }

        assert_eq!(store.len(), 20);
        assert!(store.contains(&exec("bound")));
        for i in 0..6 {
            assert!(!store.contains(&exec(&format!("exec-{i}"))), "exec-{i} survived");
        }
        assert!(store.contains(&exec("exec-24")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_evicts_periodically() {
        let store = Arc::new(ClientSessionStore::with_policy(EvictionPolicy {
            max_age: Duration::from_secs(60),
            max_executions: 20,
        }));
        store.upsert_message(&exec("idle"), msg("m1", "x", 1));
        let sweeper = store.spawn_sweeper(Duration::from_secs(30));

        tokio::time::sleep(Duration::from_secs(95)).await;
        assert!(!store.contains(&exec("idle")));

        drop(store);
        tokio_test::assert_ok!(sweeper.await);
    }
}
