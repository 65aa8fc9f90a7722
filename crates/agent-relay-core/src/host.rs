//! In-memory tab host.

use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};

use async_trait::async_trait;

use crate::traits::{HostError, TabHost, TabId, WindowId};

#[derive(Default)]
struct Tabs {
    windows: HashMap<TabId, WindowId>,
    active: HashMap<WindowId, TabId>,
}

/// Tab host backed by a map.
///
/// Useful for tests and for embedding where the real host pushes its state in.
#[derive(Default)]
pub struct MemoryTabHost {
    tabs: RwLock<Tabs>,
}

impl MemoryTabHost {
    /// Create an empty host.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a tab exists in a window.
    pub fn open_tab(&self, window_id: WindowId, tab_id: TabId) {
        let mut tabs = self.tabs.write().unwrap_or_else(PoisonError::into_inner);
        tabs.windows.insert(tab_id, window_id);
        tabs.active.entry(window_id).or_insert(tab_id);
    }

    /// Make a tab the active one in its window.
    pub fn activate_tab(&self, window_id: WindowId, tab_id: TabId) {
        let mut tabs = self.tabs.write().unwrap_or_else(PoisonError::into_inner);
        tabs.windows.insert(tab_id, window_id);
        tabs.active.insert(window_id, tab_id);
    }

    /// Forget a tab.
    pub fn close_tab(&self, tab_id: TabId) {
        let mut tabs = self.tabs.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(window_id) = tabs.windows.remove(&tab_id) {
            if tabs.active.get(&window_id) == Some(&tab_id) {
                tabs.active.remove(&window_id);
            }
        }
    }
}

#[async_trait]
impl TabHost for MemoryTabHost {
    async fn window_of_tab(&self, tab_id: TabId) -> Result<Option<WindowId>, HostError> {
        Ok(self
            .tabs
            .read()
            .map_err(|e| HostError::QueryFailed(e.to_string()))?
            .windows
            .get(&tab_id)
            .copied())
    }

    async fn active_tab(&self, window_id: WindowId) -> Result<Option<TabId>, HostError> {
        Ok(self
            .tabs
            .read()
            .map_err(|e| HostError::QueryFailed(e.to_string()))?
            .active
            .get(&window_id)
            .copied())
    }
}
