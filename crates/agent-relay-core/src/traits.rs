//! Host capability consumed by the router and client.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

/// Browser tab identifier as reported by the host.
pub type TabId = i64;

/// Browser window identifier as reported by the host.
pub type WindowId = i64;

/// Router-assigned connection identifier.
pub type ConnectionId = Uuid;

/// Host query error.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("Host unavailable: {0}")]
    Unavailable(String),
    #[error("Host query failed: {0}")]
    QueryFailed(String),
}

/// Tab/window enumeration provided by the host environment.
///
/// Both queries may suspend; callers must not assume the answer still holds
/// once they resume.
#[async_trait]
pub trait TabHost: Send + Sync {
    /// Window a tab lives in, or `None` if the tab is unknown.
    async fn window_of_tab(&self, tab_id: TabId) -> Result<Option<WindowId>, HostError>;

    /// Currently active tab of a window, or `None` if the window is unknown or empty.
    async fn active_tab(&self, window_id: WindowId) -> Result<Option<TabId>, HostError>;
}
