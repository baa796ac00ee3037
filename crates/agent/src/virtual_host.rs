//! In-memory host described by a JSON fixture
//!
//! Simulates enough of a UI to exercise every action: scrollable containers
//! with content offsets, keyboard focus with an edit menu and pasteboard,
//! web surfaces with a loading flag, date pickers and custom actions.

use crate::host::{
    AppLifecycle, DragPath, ElementHandle, ElementProperties, HierarchyDumper, InteractionDriver,
    LoadStateObserver, Payload, RecordingConfig, Recorder, ViewTree, WebContent,
};
use crate::keyboard::DELETE_KEY;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use synctap_common::{AccessibilityTrait, Point, Rect, Result, Size};
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FixtureDef {
    #[serde(default = "default_screen")]
    screen: [f64; 2],
    #[serde(default)]
    reloadable_runtime: bool,
    /// Reloads finish only when `finish_runtime_load` is called
    #[serde(default)]
    manual_runtime_load: bool,
    surfaces: Vec<NodeDef>,
}

fn default_screen() -> [f64; 2] {
    [390.0, 844.0]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeDef {
    identifier: Option<String>,
    frame: [f64; 4],
    text: Option<String>,
    #[serde(default)]
    classes: Vec<String>,
    #[serde(default)]
    traits: Vec<AccessibilityTrait>,
    /// Defaults to true for leaves and false for containers
    accessible: Option<bool>,
    #[serde(default = "default_true")]
    hittable: bool,
    #[serde(default)]
    editable: bool,
    /// Secure fields offer no edit menu
    #[serde(default)]
    secure: bool,
    #[serde(default)]
    date_picker: bool,
    #[serde(default)]
    custom_actions: Vec<String>,
    scroll: Option<ScrollDef>,
    web: Option<WebDef>,
    #[serde(default)]
    children: Vec<NodeDef>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScrollDef {
    content_width: f64,
    content_height: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WebDef {
    #[serde(default)]
    loading: bool,
    #[serde(default)]
    scripts: HashMap<String, String>,
}

struct Node {
    parent: Option<usize>,
    children: Vec<usize>,
    identifier: Option<String>,
    base_frame: Rect,
    classes: Vec<String>,
    traits: Vec<AccessibilityTrait>,
    accessible: bool,
    hittable: bool,
    editable: bool,
    secure: bool,
    date_picker: bool,
    custom_actions: Vec<String>,
    content_size: Option<Size>,
    scripts: HashMap<String, String>,
}

#[derive(Default)]
struct UiState {
    texts: HashMap<usize, String>,
    offsets: HashMap<usize, (f64, f64)>,
    focused: Option<usize>,
    all_selected: bool,
    menu_visible: bool,
    pasteboard: String,
    pending_alert: Option<String>,
    dates: HashMap<usize, DateTime<Utc>>,
    taps: Vec<Point>,
    drags: Vec<DragPath>,
    performed_actions: Vec<(usize, String)>,
    payloads: Vec<(Payload, bool)>,
    shakes: u32,
    reloads: u32,
}

/// In-memory UI used by tests and fixture runs
pub struct VirtualHost {
    screen: Size,
    reloadable_runtime: bool,
    manual_runtime_load: bool,
    /// Number of finished runtime loads
    runtime_loads: watch::Sender<u32>,
    /// Pre-order; the index is the handle
    nodes: Vec<Node>,
    roots: Vec<usize>,
    web: HashMap<usize, watch::Sender<bool>>,
    state: Mutex<UiState>,
}

impl VirtualHost {
    pub fn from_json(fixture: Value) -> Result<Self> {
        let fixture: FixtureDef = serde_json::from_value(fixture)?;

        let mut host = Self {
            screen: Size::new(fixture.screen[0], fixture.screen[1]),
            reloadable_runtime: fixture.reloadable_runtime,
            manual_runtime_load: fixture.manual_runtime_load,
            runtime_loads: watch::channel(0).0,
            nodes: Vec::new(),
            roots: Vec::new(),
            web: HashMap::new(),
            state: Mutex::new(UiState::default()),
        };

        let mut texts = HashMap::new();
        for surface in &fixture.surfaces {
            let root = host.insert(surface, None, &mut texts);
            host.roots.push(root);
        }
        host.state.lock().texts = texts;

        debug!("Virtual host with {} elements", host.nodes.len());
        Ok(host)
    }

    /// Load a fixture file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(serde_json::from_str(&content)?)
    }

    /// A single empty window
    pub fn blank() -> Self {
        let [width, height] = default_screen();
        Self {
            screen: Size::new(width, height),
            reloadable_runtime: false,
            manual_runtime_load: false,
            runtime_loads: watch::channel(0).0,
            nodes: vec![Node {
                parent: None,
                children: Vec::new(),
                identifier: Some("window".to_string()),
                base_frame: Rect::new(0.0, 0.0, width, height),
                classes: vec!["UIWindow".to_string()],
                traits: Vec::new(),
                accessible: false,
                hittable: true,
                editable: false,
                secure: false,
                date_picker: false,
                custom_actions: Vec::new(),
                content_size: None,
                scripts: HashMap::new(),
            }],
            roots: vec![0],
            web: HashMap::new(),
            state: Mutex::new(UiState::default()),
        }
    }

    fn insert(&mut self, def: &NodeDef, parent: Option<usize>, texts: &mut HashMap<usize, String>) -> usize {
        let index = self.nodes.len();
        let [x, y, width, height] = def.frame;

        self.nodes.push(Node {
            parent,
            children: Vec::new(),
            identifier: def.identifier.clone(),
            base_frame: Rect::new(x, y, width, height),
            classes: if def.classes.is_empty() {
                vec!["UIView".to_string()]
            } else {
                def.classes.clone()
            },
            traits: def.traits.clone(),
            accessible: def.accessible.unwrap_or(def.children.is_empty()),
            hittable: def.hittable,
            editable: def.editable,
            secure: def.secure,
            date_picker: def.date_picker,
            custom_actions: def.custom_actions.clone(),
            content_size: def
                .scroll
                .as_ref()
                .map(|s| Size::new(s.content_width, s.content_height)),
            scripts: def.web.as_ref().map(|w| w.scripts.clone()).unwrap_or_default(),
        });

        if let Some(text) = &def.text {
            texts.insert(index, text.clone());
        } else if def.editable {
            texts.insert(index, String::new());
        }

        if let Some(web) = &def.web {
            let (tx, _) = watch::channel(web.loading);
            self.web.insert(index, tx);
        }

        for child in &def.children {
            let child_index = self.insert(child, Some(index), texts);
            self.nodes[index].children.push(child_index);
        }

        index
    }

    fn node(&self, element: ElementHandle) -> Option<(usize, &Node)> {
        let index = usize::try_from(element.0).ok()?;
        self.nodes.get(index).map(|node| (index, node))
    }

    fn ancestors(&self, index: usize) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(self.nodes[index].parent, move |&i| self.nodes[i].parent)
    }

    fn frame_of(&self, index: usize, state: &UiState) -> Rect {
        let mut frame = self.nodes[index].base_frame;
        for ancestor in self.ancestors(index) {
            if let Some((dx, dy)) = state.offsets.get(&ancestor) {
                frame.x -= dx;
                frame.y -= dy;
            }
        }
        frame
    }

    fn visible_area(&self, index: usize, state: &UiState) -> f64 {
        let frame = self.frame_of(index, state);
        let screen = Rect::new(0.0, 0.0, self.screen.width, self.screen.height);

        let mut visible = match frame.intersection(&screen) {
            Some(rect) => rect,
            None => return 0.0,
        };
        for ancestor in self.ancestors(index) {
            if self.nodes[ancestor].content_size.is_some() {
                match visible.intersection(&self.frame_of(ancestor, state)) {
                    Some(rect) => visible = rect,
                    None => return 0.0,
                }
            }
        }
        visible.area()
    }

    /// Deepest hittable element under `point`, later siblings on top
    fn hit_test(&self, point: Point, state: &UiState) -> Option<usize> {
        let mut best: Option<(usize, usize)> = None;
        for index in 0..self.nodes.len() {
            if !self.nodes[index].hittable || !self.frame_of(index, state).contains(point) {
                continue;
            }
            let depth = self.ancestors(index).count();
            if best.map(|(_, d)| depth >= d).unwrap_or(true) {
                best = Some((index, depth));
            }
        }
        best.map(|(index, _)| index)
    }

    fn describe(&self, index: usize, state: &UiState) -> Value {
        let node = &self.nodes[index];
        json!({
            "identifier": node.identifier,
            "className": node.classes.first(),
            "frame": self.frame_of(index, state).components(),
            "text": state.texts.get(&index),
            "traits": node.traits,
            "isAccessibilityElement": node.accessible,
            "children": node.children.iter().map(|&c| self.describe(c, state)).collect::<Vec<_>>(),
        })
    }

    // ========================================================================
    // Inspection helpers
    // ========================================================================

    /// First element in walk order with this identifier
    pub fn handle_of(&self, identifier: &str) -> Option<ElementHandle> {
        self.nodes
            .iter()
            .position(|node| node.identifier.as_deref() == Some(identifier))
            .map(|index| ElementHandle(index as u64))
    }

    fn index_of(&self, identifier: &str) -> Option<usize> {
        self.handle_of(identifier).map(|h| h.0 as usize)
    }

    pub fn content_offset(&self, identifier: &str) -> Option<(f64, f64)> {
        let index = self.index_of(identifier)?;
        self.nodes[index].content_size?;
        Some(self.state.lock().offsets.get(&index).copied().unwrap_or((0.0, 0.0)))
    }

    pub fn text_of(&self, identifier: &str) -> Option<String> {
        let index = self.index_of(identifier)?;
        self.state.lock().texts.get(&index).cloned()
    }

    pub fn date_of(&self, identifier: &str) -> Option<DateTime<Utc>> {
        let index = self.index_of(identifier)?;
        self.state.lock().dates.get(&index).copied()
    }

    /// Flip a web surface's loading flag to finished
    pub fn finish_loading(&self, identifier: &str) {
        if let Some(tx) = self.index_of(identifier).and_then(|i| self.web.get(&i)) {
            tx.send_replace(false);
        }
    }

    pub fn drag_count(&self) -> usize {
        self.state.lock().drags.len()
    }

    pub fn last_drag(&self) -> Option<DragPath> {
        self.state.lock().drags.last().copied()
    }

    pub fn shake_count(&self) -> u32 {
        self.state.lock().shakes
    }

    pub fn reload_count(&self) -> u32 {
        self.state.lock().reloads
    }

    /// Signal that the runtime finished its latest reload
    pub fn finish_runtime_load(&self) {
        self.runtime_loads.send_modify(|loads| *loads += 1);
    }

    pub fn delivered_payloads(&self) -> Vec<(Payload, bool)> {
        self.state.lock().payloads.clone()
    }
}

impl ViewTree for VirtualHost {
    fn surfaces(&self) -> Vec<ElementHandle> {
        self.roots.iter().map(|&i| ElementHandle(i as u64)).collect()
    }

    fn children(&self, element: ElementHandle) -> Vec<ElementHandle> {
        self.node(element)
            .map(|(_, node)| node.children.iter().map(|&i| ElementHandle(i as u64)).collect())
            .unwrap_or_default()
    }

    fn parent(&self, element: ElementHandle) -> Option<ElementHandle> {
        self.node(element)
            .and_then(|(_, node)| node.parent)
            .map(|i| ElementHandle(i as u64))
    }

    fn properties(&self, element: ElementHandle) -> Option<ElementProperties> {
        let (index, node) = self.node(element)?;
        let state = self.state.lock();

        Some(ElementProperties {
            identifier: node.identifier.clone(),
            frame: self.frame_of(index, &state),
            text: state.texts.get(&index).cloned(),
            class_names: node.classes.clone(),
            traits: node.traits.clone(),
            is_accessibility_element: node.accessible,
        })
    }

    fn attributes(&self, element: ElementHandle) -> Value {
        let Some((index, node)) = self.node(element) else {
            return Value::Null;
        };
        let state = self.state.lock();
        let frame = self.frame_of(index, &state);

        json!({
            "identifier": node.identifier,
            "className": node.classes.first(),
            "frame": frame.components(),
            "text": state.texts.get(&index),
            "traits": node.traits,
            "hittable": node.hittable,
            "isAccessibilityElement": node.accessible,
            "hasFocus": state.focused == Some(index),
            "date": state.dates.get(&index).map(|d| d.to_rfc3339()),
        })
    }
}

impl InteractionDriver for VirtualHost {
    fn screen_size(&self) -> Size {
        self.screen
    }

    fn is_hittable(&self, element: ElementHandle) -> bool {
        let Some((index, node)) = self.node(element) else {
            return false;
        };
        node.hittable && self.visible_area(index, &self.state.lock()) > 0.0
    }

    fn snapshot(&self, element: ElementHandle) -> Vec<u8> {
        let Some((index, _)) = self.node(element) else {
            return Vec::new();
        };
        let state = self.state.lock();

        let offsets: Vec<(f64, f64)> = std::iter::once(index)
            .chain(self.ancestors(index))
            .map(|i| state.offsets.get(&i).copied().unwrap_or((0.0, 0.0)))
            .collect();

        json!({
            "frame": self.frame_of(index, &state).components(),
            "text": state.texts.get(&index),
            "offsets": offsets,
        })
        .to_string()
        .into_bytes()
    }

    fn tap(&self, at: Point) {
        let mut state = self.state.lock();
        state.taps.push(at);

        let hit = self.hit_test(at, &state);
        match hit {
            Some(index) if self.nodes[index].editable => {
                if state.focused == Some(index) {
                    state.menu_visible = !self.nodes[index].secure;
                } else {
                    state.focused = Some(index);
                    state.all_selected = false;
                    state.menu_visible = false;
                }
            }
            _ => {
                state.focused = None;
                state.all_selected = false;
                state.menu_visible = false;
            }
        }
    }

    fn press_and_drag(&self, path: DragPath) {
        let mut state = self.state.lock();
        state.drags.push(path);

        let Some(hit) = self.hit_test(path.from, &state) else {
            return;
        };
        let Some(container) = std::iter::once(hit)
            .chain(self.ancestors(hit))
            .find(|&i| self.nodes[i].content_size.is_some())
        else {
            return;
        };

        let node = &self.nodes[container];
        let Some(content) = node.content_size else {
            return;
        };
        let max_x = (content.width - node.base_frame.width).max(0.0);
        let max_y = (content.height - node.base_frame.height).max(0.0);

        let (x, y) = state.offsets.get(&container).copied().unwrap_or((0.0, 0.0));
        let next = (
            (x - (path.to.x - path.from.x)).clamp(0.0, max_x),
            (y - (path.to.y - path.from.y)).clamp(0.0, max_y),
        );
        state.offsets.insert(container, next);
    }

    fn has_keyboard_focus(&self, element: ElementHandle) -> bool {
        self.node(element)
            .map(|(index, _)| self.state.lock().focused == Some(index))
            .unwrap_or(false)
    }

    fn text_value(&self, element: ElementHandle) -> Option<String> {
        let (index, _) = self.node(element)?;
        self.state.lock().texts.get(&index).cloned()
    }

    fn type_text(&self, text: &str) {
        let mut state = self.state.lock();
        let Some(focused) = state.focused else {
            return;
        };
        let all_selected = state.all_selected;
        let current = state.texts.entry(focused).or_default();

        if text == DELETE_KEY {
            if all_selected {
                current.clear();
            } else {
                current.pop();
            }
        } else if all_selected {
            *current = text.to_string();
        } else {
            current.push_str(text);
        }

        state.all_selected = false;
        state.menu_visible = false;
    }

    fn set_pasteboard(&self, text: &str) {
        self.state.lock().pasteboard = text.to_string();
    }

    fn tap_menu_item(&self, title: &str, _timeout: Duration) -> bool {
        let mut state = self.state.lock();
        let Some(focused) = state.focused else {
            return false;
        };
        if !state.menu_visible {
            return false;
        }

        match title {
            "Select All" => {
                let has_text = state.texts.get(&focused).map(|t| !t.is_empty()).unwrap_or(false);
                if has_text {
                    state.all_selected = true;
                }
                has_text
            }
            "Paste" if !state.pasteboard.is_empty() => {
                let pasted = state.pasteboard.clone();
                let all_selected = state.all_selected;
                let current = state.texts.entry(focused).or_default();
                if all_selected {
                    *current = pasted;
                } else {
                    current.push_str(&pasted);
                }
                state.all_selected = false;
                state.menu_visible = false;
                state.pending_alert = Some("Allow Paste".to_string());
                true
            }
            _ => false,
        }
    }

    fn tap_alert_button(&self, title: &str, _timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if state.pending_alert.as_deref() == Some(title) {
            state.pending_alert = None;
            true
        } else {
            false
        }
    }

    fn visible_percent(&self, element: ElementHandle) -> f64 {
        let Some((index, _)) = self.node(element) else {
            return 0.0;
        };
        let state = self.state.lock();
        let total = self.frame_of(index, &state).area();
        if total <= 0.0 {
            return 0.0;
        }
        self.visible_area(index, &state) / total * 100.0
    }

    fn set_date(&self, element: ElementHandle, date: DateTime<Utc>) -> std::result::Result<(), String> {
        let (index, node) = self.node(element).ok_or("unknown element")?;
        if !node.date_picker {
            return Err(format!(
                "element `{}` is not a date picker",
                node.identifier.as_deref().unwrap_or("?")
            ));
        }
        self.state.lock().dates.insert(index, date);
        Ok(())
    }

    fn custom_actions(&self, element: ElementHandle) -> Vec<String> {
        self.node(element)
            .map(|(_, node)| node.custom_actions.clone())
            .unwrap_or_default()
    }

    fn perform_custom_action(&self, element: ElementHandle, name: &str) -> bool {
        let Some((index, node)) = self.node(element) else {
            return false;
        };
        if !node.custom_actions.iter().any(|a| a == name) {
            return false;
        }
        self.state.lock().performed_actions.push((index, name.to_string()));
        true
    }

    fn shake(&self) {
        self.state.lock().shakes += 1;
    }
}

#[async_trait]
impl WebContent for VirtualHost {
    fn observe_load_state(&self, element: ElementHandle) -> Option<LoadStateObserver> {
        let (index, _) = self.node(element)?;
        self.web
            .get(&index)
            .map(|tx| LoadStateObserver::new(tx.subscribe()))
    }

    async fn evaluate_script(
        &self,
        element: ElementHandle,
        script: &str,
    ) -> std::result::Result<Option<String>, String> {
        let (_, node) = self.node(element).ok_or("unknown element")?;
        match node.scripts.get(script) {
            Some(result) if result.is_empty() => Ok(None),
            Some(result) => Ok(Some(result.clone())),
            None => Err(format!("ReferenceError: cannot evaluate `{}`", script)),
        }
    }
}

impl HierarchyDumper for VirtualHost {
    fn dump_view_hierarchy(&self, path: &Path) -> std::result::Result<(), String> {
        let tree = {
            let state = self.state.lock();
            Value::Array(self.roots.iter().map(|&r| self.describe(r, &state)).collect())
        };

        let content = serde_json::to_vec_pretty(&tree).map_err(|e| e.to_string())?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        std::fs::write(path, content).map_err(|e| e.to_string())
    }
}

#[async_trait]
impl AppLifecycle for VirtualHost {
    fn dispatch_payload(&self, payload: &Payload, delay_until_active: bool) {
        debug!("Delivering {:?} (delayed: {})", payload, delay_until_active);
        self.state.lock().payloads.push((payload.clone(), delay_until_active));
    }

    fn has_reloadable_runtime(&self) -> bool {
        self.reloadable_runtime
    }

    fn reload_runtime(&self) {
        self.state.lock().reloads += 1;
        if !self.manual_runtime_load {
            self.finish_runtime_load();
        }
    }

    async fn wait_for_runtime_load(&self) {
        let reloads = self.state.lock().reloads;
        let mut loads = self.runtime_loads.subscribe();
        // The sender lives as long as `self`
        let _ = loads.wait_for(|finished| *finished >= reloads).await;
    }
}

/// Recorder that logs calls instead of profiling
#[derive(Default)]
pub struct VirtualRecorder {
    events: Mutex<Vec<String>>,
    flush_delay: Duration,
}

impl VirtualRecorder {
    pub fn with_flush_delay(flush_delay: Duration) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            flush_delay,
        }
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl Recorder for VirtualRecorder {
    fn start(&self, config: &RecordingConfig) {
        self.events
            .lock()
            .push(format!("start {}", config.recording_path.display()));
    }

    fn resume(&self, config: &RecordingConfig) {
        self.events
            .lock()
            .push(format!("resume {}", config.recording_path.display()));
    }

    async fn stop(&self) -> std::result::Result<(), String> {
        if !self.flush_delay.is_zero() {
            tokio::time::sleep(self.flush_delay).await;
        }
        self.events.lock().push("stop".to_string());
        Ok(())
    }
}
