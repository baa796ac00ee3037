//! Agent configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use synctap_common::{Error, Result, SyncSettings};

/// Timers due within this many milliseconds block idleness by default
pub const DEFAULT_MAX_TIMER_WAIT_MS: f64 = 1500.0;

/// Agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Driver endpoint
    pub server: String,

    /// Session identifier sent at login, defaults to the app identifier
    pub session_id: Option<String>,

    /// Bundle/package identity of the instrumented application
    pub app_identifier: String,

    /// Fixed delay between reconnect attempts
    pub reconnect_delay_ms: u64,

    /// Upper bound on flushing a recording before a crash report is sent
    pub crash_flush_timeout_ms: u64,

    /// Synchronization defaults applied at startup
    pub sync: SyncConfig,

    /// Recording to continue from launch
    pub recording: LaunchRecordingConfig,

    /// View hierarchy capture
    pub hierarchy: HierarchyConfig,

    /// Gesture tuning
    pub gestures: GestureConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server: synctap_common::DEFAULT_SERVER.to_string(),
            session_id: None,
            app_identifier: "com.example.app".to_string(),
            reconnect_delay_ms: 1000,
            crash_flush_timeout_ms: 5000,
            sync: SyncConfig::default(),
            recording: LaunchRecordingConfig::default(),
            hierarchy: HierarchyConfig::default(),
            gestures: GestureConfig::default(),
        }
    }
}

/// Initial synchronization settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Maximum timer delay that still blocks idleness
    pub max_timer_wait_ms: Option<f64>,

    /// URL patterns ignored by network tracking
    pub blacklist_urls: Vec<String>,

    /// Whether synchronization is enabled at all
    pub enabled: bool,

    /// Pause at startup so a debugger can attach
    pub wait_for_debugger_ms: Option<u64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_timer_wait_ms: Some(DEFAULT_MAX_TIMER_WAIT_MS),
            blacklist_urls: Vec::new(),
            enabled: true,
            wait_for_debugger_ms: None,
        }
    }
}

impl SyncConfig {
    pub fn initial_settings(&self) -> SyncSettings {
        SyncSettings {
            max_timer_wait_ms: self.max_timer_wait_ms,
            blacklisted_url_patterns: if self.blacklist_urls.is_empty() {
                None
            } else {
                Some(self.blacklist_urls.clone())
            },
            synchronization_enabled: self.enabled,
        }
    }
}

/// Recording started before the agent came up
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchRecordingConfig {
    pub path: Option<PathBuf>,
    pub sampling_interval: Option<f64>,
}

/// View hierarchy capture configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HierarchyConfig {
    /// Refuse every dump request
    pub disable_dump: bool,

    /// Directory for dumps requested without a destination
    pub output_dir: Option<PathBuf>,
}

impl HierarchyConfig {
    pub fn output_dir(&self) -> PathBuf {
        self.output_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

/// Gesture tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GestureConfig {
    /// Ceiling on swipes for a single scroll-to-edge
    pub max_edge_swipes: u32,

    /// Bounded wait for edit menu items and system alerts
    pub menu_wait_ms: u64,
}

impl Default for GestureConfig {
    fn default() -> Self {
        Self {
            max_edge_swipes: 100,
            menu_wait_ms: 500,
        }
    }
}

impl GestureConfig {
    pub fn menu_wait(&self) -> Duration {
        Duration::from_millis(self.menu_wait_ms)
    }
}

impl AgentConfig {
    /// Load configuration from file
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let url = url::Url::parse(&self.server)
            .map_err(|e| Error::InvalidConfig(format!("server `{}`: {}", self.server, e)))?;

        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(Error::InvalidConfig(format!(
                "server `{}` must use ws:// or wss://",
                self.server
            )));
        }

        if self.gestures.max_edge_swipes == 0 {
            return Err(Error::InvalidConfig(
                "gestures.max_edge_swipes must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Session identifier sent at login
    pub fn session_id(&self) -> String {
        self.session_id
            .clone()
            .unwrap_or_else(|| self.app_identifier.clone())
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn crash_flush_timeout(&self) -> Duration {
        Duration::from_millis(self.crash_flush_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.server, "ws://localhost:8997");
        assert_eq!(config.reconnect_delay(), Duration::from_secs(1));
        assert_eq!(config.session_id(), config.app_identifier);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: AgentConfig = toml::from_str(
            r#"
            app_identifier = "com.acme.shop"

            [sync]
            max_timer_wait_ms = 500.0
            blacklist_urls = [".*analytics.*"]
            "#,
        )
        .unwrap();

        assert_eq!(config.session_id(), "com.acme.shop");
        assert_eq!(config.gestures.max_edge_swipes, 100);

        let settings = config.sync.initial_settings();
        assert_eq!(settings.max_timer_wait_ms, Some(500.0));
        assert_eq!(
            settings.blacklisted_url_patterns,
            Some(vec![".*analytics.*".to_string()])
        );
        assert!(settings.synchronization_enabled);
    }

    #[test]
    fn test_rejects_non_websocket_server() {
        let config = AgentConfig {
            server: "http://localhost:8997".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");

        let config = AgentConfig {
            session_id: Some("session-7".to_string()),
            ..Default::default()
        };
        config.save(&path).unwrap();

        let loaded = AgentConfig::load(&path).unwrap();
        assert_eq!(loaded.session_id(), "session-7");
    }
}
