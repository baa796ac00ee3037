//! Idle tracking and the serialized UI worker
//!
//! The host instrumentation registers busy resources through `track_*`; each
//! returns a guard that clears the resource when dropped. Work queued with
//! `enqueue_when_idle` runs one job at a time, in arrival order, once no
//! blocking resource remains.

use crate::config::DEFAULT_MAX_TIMER_WAIT_MS;
use crate::context::SessionContext;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use synctap_common::{ConnectionState, SyncSettings};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Category of busy resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Timer,
    Network,
    Animation,
    Layout,
    Other,
}

#[derive(Debug, Clone)]
enum Resource {
    Timer { delay: Duration, description: String },
    Network { url: String },
    Animation { description: String },
    Layout { description: String },
    Other { description: String },
}

impl Resource {
    fn kind(&self) -> ResourceKind {
        match self {
            Resource::Timer { .. } => ResourceKind::Timer,
            Resource::Network { .. } => ResourceKind::Network,
            Resource::Animation { .. } => ResourceKind::Animation,
            Resource::Layout { .. } => ResourceKind::Layout,
            Resource::Other { .. } => ResourceKind::Other,
        }
    }

    fn description(&self) -> String {
        match self {
            Resource::Timer { delay, description } => {
                format!("{} (fires in {}ms)", description, delay.as_millis())
            }
            Resource::Network { url } => url.clone(),
            Resource::Animation { description }
            | Resource::Layout { description }
            | Resource::Other { description } => description.clone(),
        }
    }
}

enum UrlPattern {
    Regex(Regex),
    Literal(String),
}

/// Compiled form of `blacklistedUrlPatterns`
struct UrlBlacklist {
    patterns: Vec<UrlPattern>,
}

impl UrlBlacklist {
    fn compile(patterns: &[String]) -> Self {
        let patterns = patterns
            .iter()
            .map(|pattern| match Regex::new(pattern) {
                Ok(re) => UrlPattern::Regex(re),
                Err(e) => {
                    warn!(
                        "Blacklist pattern `{}` is not a valid regex ({}), matching it literally",
                        pattern, e
                    );
                    UrlPattern::Literal(pattern.clone())
                }
            })
            .collect();
        Self { patterns }
    }

    fn matches(&self, url: &str) -> bool {
        self.patterns.iter().any(|pattern| match pattern {
            UrlPattern::Regex(re) => re.is_match(url),
            UrlPattern::Literal(literal) => url.contains(literal.as_str()),
        })
    }
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    busy: HashMap<u64, Resource>,
}

type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

struct Inner {
    context: Arc<SessionContext>,
    registry: Mutex<Registry>,
    /// Bumped on every registry or settings change
    generation: watch::Sender<u64>,
    blacklist: Mutex<Option<(Arc<SyncSettings>, Arc<UrlBlacklist>)>>,
    pending: AtomicUsize,
}

impl Inner {
    fn bump(&self) {
        self.generation.send_modify(|g| *g = g.wrapping_add(1));
    }

    fn blacklist_for(&self, settings: &Arc<SyncSettings>) -> Arc<UrlBlacklist> {
        let mut cached = self.blacklist.lock();
        if let Some((for_settings, blacklist)) = cached.as_ref() {
            if Arc::ptr_eq(for_settings, settings) {
                return blacklist.clone();
            }
        }

        let patterns = settings.blacklisted_url_patterns.as_deref().unwrap_or(&[]);
        let blacklist = Arc::new(UrlBlacklist::compile(patterns));
        *cached = Some((settings.clone(), blacklist.clone()));
        blacklist
    }

    /// Resources that currently block idleness under the active settings
    fn blocking(&self) -> Vec<Resource> {
        let settings = self.context.sync_settings();
        if !settings.synchronization_enabled {
            return Vec::new();
        }

        let max_timer_wait = settings
            .max_timer_wait_ms
            .unwrap_or(DEFAULT_MAX_TIMER_WAIT_MS);
        let blacklist = self.blacklist_for(&settings);

        let registry = self.registry.lock();
        let mut ids: Vec<&u64> = registry.busy.keys().collect();
        ids.sort();

        ids.into_iter()
            .filter_map(|id| registry.busy.get(id))
            .filter(|resource| match resource {
                Resource::Timer { delay, .. } => delay.as_secs_f64() * 1000.0 <= max_timer_wait,
                Resource::Network { url } => !blacklist.matches(url),
                _ => true,
            })
            .cloned()
            .collect()
    }

    async fn wait_until_idle(&self) {
        let mut rx = self.generation.subscribe();
        loop {
            rx.borrow_and_update();
            if self.blocking().is_empty() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Keeps a resource busy until dropped
#[must_use = "the resource is released as soon as the guard is dropped"]
pub struct ResourceGuard {
    inner: Arc<Inner>,
    id: u64,
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        let removed = self.inner.registry.lock().busy.remove(&self.id);
        if let Some(resource) = removed {
            debug!("Released {:?} resource: {}", resource.kind(), resource.description());
            self.inner.bump();
        }
    }
}

/// Busy resource as reported by `requestCurrentStatus`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusyResource {
    pub kind: ResourceKind,
    pub description: String,
}

/// Diagnostic snapshot of the tracker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub app_status: String,
    pub busy_resources: Vec<BusyResource>,
    pub busy_counts: BTreeMap<ResourceKind, usize>,
    pub pending_work: usize,
    pub settings: SyncSettings,
    pub connection: ConnectionState,
}

impl StatusReport {
    pub fn is_idle(&self) -> bool {
        self.busy_resources.is_empty()
    }
}

/// Partial settings carried by `setSyncSettings`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSettingsUpdate {
    pub max_timer_wait: Option<f64>,
    #[serde(rename = "blacklistURLs")]
    pub blacklist_urls: Option<Vec<String>>,
    pub enabled: Option<bool>,
    pub disabled: Option<bool>,
    /// Milliseconds to pause so a debugger can attach
    pub wait_for_debugger: Option<u64>,
    #[serde(flatten)]
    pub unknown: Map<String, Value>,
}

impl SyncSettingsUpdate {
    /// Merge onto `current`; unknown keys are logged and ignored
    pub fn merge_onto(&self, current: &SyncSettings) -> SyncSettings {
        for key in self.unknown.keys() {
            warn!("Ignoring unknown sync setting `{}`", key);
        }

        let mut next = current.clone();
        if let Some(max) = self.max_timer_wait {
            next.max_timer_wait_ms = Some(max);
        }
        if let Some(urls) = &self.blacklist_urls {
            next.blacklisted_url_patterns = Some(urls.clone());
        }
        if let Some(enabled) = self.enabled {
            next.synchronization_enabled = enabled;
        }
        if let Some(disabled) = self.disabled {
            next.synchronization_enabled = !disabled;
        }
        next
    }
}

/// Idle tracker and single UI worker
#[derive(Clone)]
pub struct IdleTracker {
    inner: Arc<Inner>,
    queue: mpsc::UnboundedSender<Job>,
}

impl IdleTracker {
    /// Create the tracker and spawn its worker on the current runtime
    pub fn new(context: Arc<SessionContext>) -> Self {
        let (generation, _) = watch::channel(0u64);
        let inner = Arc::new(Inner {
            context,
            registry: Mutex::new(Registry::default()),
            generation,
            blacklist: Mutex::new(None),
            pending: AtomicUsize::new(0),
        });

        let (queue, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(inner.clone(), rx));

        Self { inner, queue }
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        &self.inner.context
    }

    // ========================================================================
    // Resource registration
    // ========================================================================

    fn track(&self, resource: Resource) -> ResourceGuard {
        let id = {
            let mut registry = self.inner.registry.lock();
            registry.next_id += 1;
            let id = registry.next_id;
            debug!("Tracking {:?} resource: {}", resource.kind(), resource.description());
            registry.busy.insert(id, resource);
            id
        };
        self.inner.bump();

        ResourceGuard {
            inner: self.inner.clone(),
            id,
        }
    }

    /// Timer due in `delay`; blocks only while `delay` is within `maxTimerWait`
    pub fn track_timer(&self, delay: Duration, description: impl Into<String>) -> ResourceGuard {
        self.track(Resource::Timer {
            delay,
            description: description.into(),
        })
    }

    /// In-flight request; blocks unless the URL is blacklisted
    pub fn track_network_request(&self, url: impl Into<String>) -> ResourceGuard {
        self.track(Resource::Network { url: url.into() })
    }

    pub fn track_animation(&self, description: impl Into<String>) -> ResourceGuard {
        self.track(Resource::Animation {
            description: description.into(),
        })
    }

    pub fn track_layout_pass(&self, description: impl Into<String>) -> ResourceGuard {
        self.track(Resource::Layout {
            description: description.into(),
        })
    }

    pub fn track_other(&self, description: impl Into<String>) -> ResourceGuard {
        self.track(Resource::Other {
            description: description.into(),
        })
    }

    // ========================================================================
    // Idleness
    // ========================================================================

    pub fn is_idle(&self) -> bool {
        self.inner.blocking().is_empty()
    }

    /// Resolves once nothing blocks idleness; never times out
    pub async fn wait_until_idle(&self) {
        self.inner.wait_until_idle().await
    }

    /// Queue `work` behind every earlier job; it runs on the worker once idle.
    ///
    /// The receiver errors only if the job panicked or the worker is gone.
    pub fn enqueue_when_idle<F, Fut, T>(&self, work: F) -> oneshot::Receiver<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            async move {
                let output = work().await;
                let _ = tx.send(output);
            }
            .boxed()
        });

        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        if self.queue.send(job).is_err() {
            self.inner.pending.fetch_sub(1, Ordering::SeqCst);
            error!("UI worker is gone, dropping queued work");
        }
        rx
    }

    // ========================================================================
    // Settings and status
    // ========================================================================

    /// Swap in new settings and re-evaluate idleness
    pub fn set_sync_settings(&self, settings: SyncSettings) {
        info!(
            "Sync settings: enabled={}, maxTimerWait={:?}, blacklist={:?}",
            settings.synchronization_enabled,
            settings.max_timer_wait_ms,
            settings.blacklisted_url_patterns
        );
        self.inner.context.replace_sync_settings(settings);
        self.inner.bump();
    }

    /// Merge a partial update onto the current settings and swap the result in
    pub fn apply_settings_update(&self, update: &SyncSettingsUpdate) -> SyncSettings {
        let next = update.merge_onto(&self.inner.context.sync_settings());
        self.set_sync_settings(next.clone());
        next
    }

    /// Snapshot for `requestCurrentStatus`; never blocks on the worker
    pub fn current_status(&self) -> StatusReport {
        let blocking = self.inner.blocking();

        let mut busy_counts = BTreeMap::new();
        for resource in &blocking {
            *busy_counts.entry(resource.kind()).or_insert(0) += 1;
        }

        StatusReport {
            app_status: if blocking.is_empty() { "idle" } else { "busy" }.to_string(),
            busy_resources: blocking
                .iter()
                .map(|resource| BusyResource {
                    kind: resource.kind(),
                    description: resource.description(),
                })
                .collect(),
            busy_counts,
            pending_work: self.inner.pending.load(Ordering::SeqCst),
            settings: (*self.inner.context.sync_settings()).clone(),
            connection: self.inner.context.connection_state(),
        }
    }
}

async fn run_worker(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<Job>) {
    debug!("UI worker started");

    while let Some(job) = rx.recv().await {
        inner.wait_until_idle().await;

        if AssertUnwindSafe(job()).catch_unwind().await.is_err() {
            error!("Queued UI work panicked");
        }
        inner.pending.fetch_sub(1, Ordering::SeqCst);
    }

    debug!("UI worker stopped");
}
