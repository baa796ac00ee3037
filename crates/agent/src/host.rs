//! Collaborator interfaces supplied by the host platform
//!
//! The agent never walks a real view tree or synthesizes touches itself. The
//! embedding application provides these traits; `VirtualHost` implements them
//! in memory for tests and fixture runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use synctap_common::{AccessibilityTrait, Point, Rect, Size};
use tokio::sync::watch;
use url::Url;

/// Opaque reference to a live element, valid for a single action only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ElementHandle(pub u64);

/// Properties the resolver and matchers read from an element
#[derive(Debug, Clone, PartialEq)]
pub struct ElementProperties {
    pub identifier: Option<String>,
    /// Current frame in screen coordinates
    pub frame: Rect,
    pub text: Option<String>,
    /// Concrete type first, then supertypes and adopted protocols
    pub class_names: Vec<String>,
    pub traits: Vec<AccessibilityTrait>,
    pub is_accessibility_element: bool,
}

/// Accessibility-tree traversal and property extraction
pub trait ViewTree: Send + Sync {
    /// Roots of every attached top-level surface, in host order
    fn surfaces(&self) -> Vec<ElementHandle>;

    fn children(&self, element: ElementHandle) -> Vec<ElementHandle>;

    fn parent(&self, element: ElementHandle) -> Option<ElementHandle>;

    fn properties(&self, element: ElementHandle) -> Option<ElementProperties>;

    /// Platform-specific attribute dump returned by `getAttributes`
    fn attributes(&self, element: ElementHandle) -> Value;
}

/// One continuous press-drag-release gesture
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DragPath {
    pub from: Point,
    pub to: Point,
    pub press: Duration,
    pub velocity: f64,
    pub hold: Duration,
}

/// Hit-testing, gesture synthesis, keyboard and element-level primitives
pub trait InteractionDriver: Send + Sync {
    /// Size of the application window
    fn screen_size(&self) -> Size;

    fn is_hittable(&self, element: ElementHandle) -> bool;

    /// Visual snapshot of the element's on-screen region
    fn snapshot(&self, element: ElementHandle) -> Vec<u8>;

    fn tap(&self, at: Point);

    fn press_and_drag(&self, path: DragPath);

    fn has_keyboard_focus(&self, element: ElementHandle) -> bool;

    /// Text value, `None` for elements that hold no text
    fn text_value(&self, element: ElementHandle) -> Option<String>;

    /// Type into whichever element has keyboard focus
    fn type_text(&self, text: &str);

    fn set_pasteboard(&self, text: &str);

    /// Wait up to `timeout` for an edit-menu item and tap it
    fn tap_menu_item(&self, title: &str, timeout: Duration) -> bool;

    /// Wait up to `timeout` for a system alert button and tap it
    fn tap_alert_button(&self, title: &str, timeout: Duration) -> bool;

    /// Percentage of the element's area currently visible on screen
    fn visible_percent(&self, element: ElementHandle) -> f64;

    fn set_date(&self, element: ElementHandle, date: DateTime<Utc>) -> Result<(), String>;

    fn custom_actions(&self, element: ElementHandle) -> Vec<String>;

    /// Run a named custom accessibility action, `false` when absent
    fn perform_custom_action(&self, element: ElementHandle, name: &str) -> bool;

    fn shake(&self);
}

/// Change of a web surface's loading flag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadStateChange {
    /// `None` for the initial observation
    pub old: Option<bool>,
    pub new: bool,
}

/// Observes `is loading` on a web surface.
///
/// The first call to `next` always yields the current state, even when it
/// never changes afterwards.
pub struct LoadStateObserver {
    rx: watch::Receiver<bool>,
    last: Option<bool>,
}

impl LoadStateObserver {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx, last: None }
    }

    /// Next load-state notification; `None` once the surface is gone
    pub async fn next(&mut self) -> Option<LoadStateChange> {
        if self.last.is_some() {
            self.rx.changed().await.ok()?;
        }

        let new = *self.rx.borrow_and_update();
        let change = LoadStateChange {
            old: self.last,
            new,
        };
        self.last = Some(new);
        Some(change)
    }

    /// Resolve once a notification reports loading finished
    pub async fn until_loaded(&mut self) -> bool {
        while let Some(change) = self.next().await {
            if !change.new {
                return true;
            }
        }
        false
    }
}

/// Script evaluation inside web surfaces
#[async_trait]
pub trait WebContent: Send + Sync {
    /// Observer for the loading flag, `None` if the element is not a web surface
    fn observe_load_state(&self, element: ElementHandle) -> Option<LoadStateObserver>;

    /// Evaluate `script`; `Ok(None)` when the script produced no string
    async fn evaluate_script(
        &self,
        element: ElementHandle,
        script: &str,
    ) -> Result<Option<String>, String>;
}

/// View-hierarchy serialization
pub trait HierarchyDumper: Send + Sync {
    fn dump_view_hierarchy(&self, path: &Path) -> Result<(), String>;
}

/// Payload handed to the application lifecycle
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Url {
        url: Url,
        source_app: Option<String>,
    },
    UserNotification {
        data_path: PathBuf,
    },
    UserActivity {
        data_path: PathBuf,
    },
}

/// Application lifecycle dispatch and reloadable runtime
#[async_trait]
pub trait AppLifecycle: Send + Sync {
    fn dispatch_payload(&self, payload: &Payload, delay_until_active: bool);

    fn has_reloadable_runtime(&self) -> bool;

    fn reload_runtime(&self);

    /// Resolves when the reloadable runtime signals it finished loading
    async fn wait_for_runtime_load(&self);
}

/// Recording configuration passed to the recorder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingConfig {
    pub recording_path: PathBuf,
    /// Sampling interval override in seconds
    pub sampling_interval: Option<f64>,
}

/// Start/stop/continue profiling recorder
#[async_trait]
pub trait Recorder: Send + Sync {
    fn start(&self, config: &RecordingConfig);

    /// Continue a recording begun before launch
    fn resume(&self, config: &RecordingConfig);

    /// Stop and flush; a no-op when nothing is recording
    async fn stop(&self) -> Result<(), String>;
}

/// Everything the dispatcher needs from the host UI
pub trait Host: ViewTree + InteractionDriver + WebContent + HierarchyDumper + AppLifecycle {}

impl<T> Host for T where
    T: ViewTree + InteractionDriver + WebContent + HierarchyDumper + AppLifecycle
{
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_observer_delivers_initial_state() {
        let (_tx, rx) = watch::channel(false);
        let mut observer = LoadStateObserver::new(rx);

        let first = observer.next().await.unwrap();
        assert_eq!(first, LoadStateChange { old: None, new: false });
    }

    #[tokio::test]
    async fn test_observer_waits_for_load_completion() {
        let (tx, rx) = watch::channel(true);
        let mut observer = LoadStateObserver::new(rx);

        let first = observer.next().await.unwrap();
        assert!(first.new);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = tx.send(false);
        });

        let change = observer.next().await.unwrap();
        assert_eq!(change, LoadStateChange { old: Some(true), new: false });
    }

    #[tokio::test]
    async fn test_until_loaded_reports_dropped_surface() {
        let (tx, rx) = watch::channel(true);
        let mut observer = LoadStateObserver::new(rx);
        drop(tx);

        assert!(!observer.until_loaded().await);
    }
}
