//! Process-wide session state shared by the dispatcher, tracker and session

use crate::config::AgentConfig;
use parking_lot::RwLock;
use std::sync::Arc;
use synctap_common::{ConnectionState, SyncSettings};
use tokio::sync::watch;
use tracing::{debug, info};

/// State shared by every component of one agent process
pub struct SessionContext {
    config: AgentConfig,
    /// Replaced as a whole, readers clone the `Arc`
    settings: RwLock<Arc<SyncSettings>>,
    connection: RwLock<ConnectionState>,
    launched: watch::Sender<bool>,
}

impl SessionContext {
    pub fn new(config: AgentConfig) -> Arc<Self> {
        let settings = config.sync.initial_settings();
        let (launched, _) = watch::channel(false);

        Arc::new(Self {
            config,
            settings: RwLock::new(Arc::new(settings)),
            connection: RwLock::new(ConnectionState::Disconnected),
            launched,
        })
    }

    /// Get configuration
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn session_id(&self) -> String {
        self.config.session_id()
    }

    // ========================================================================
    // Synchronization settings
    // ========================================================================

    /// Current settings snapshot
    pub fn sync_settings(&self) -> Arc<SyncSettings> {
        self.settings.read().clone()
    }

    pub fn replace_sync_settings(&self, settings: SyncSettings) {
        debug!("Replacing sync settings: {:?}", settings);
        *self.settings.write() = Arc::new(settings);
    }

    // ========================================================================
    // Connection state
    // ========================================================================

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.read()
    }

    /// Record a transport transition; `Connected` is promoted to `Ready`
    /// once the application has launched
    pub fn set_connection_state(&self, state: ConnectionState) {
        let state = match state {
            ConnectionState::Connected if self.is_launched() => ConnectionState::Ready,
            ConnectionState::Ready if !self.is_launched() => ConnectionState::Connected,
            other => other,
        };

        let mut current = self.connection.write();
        if *current != state {
            debug!("Connection state: {} -> {}", *current, state);
            *current = state;
        }
    }

    // ========================================================================
    // Application launch
    // ========================================================================

    /// Signal that the application finished launching
    pub fn mark_launched(&self) {
        if self.launched.send_replace(true) {
            return;
        }
        info!("Application launched");

        let mut current = self.connection.write();
        if *current == ConnectionState::Connected {
            *current = ConnectionState::Ready;
        }
    }

    pub fn is_launched(&self) -> bool {
        *self.launched.borrow()
    }

    /// Resolves once the application has launched
    pub async fn wait_until_launched(&self) {
        let mut rx = self.launched.subscribe();
        // The sender lives as long as `self`, so this cannot fail while borrowed
        let _ = rx.wait_for(|launched| *launched).await;
    }
}
