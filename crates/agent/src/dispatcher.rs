//! Action dispatch
//!
//! Decodes each inbound action into typed params, queues its UI work behind
//! the idle tracker, and produces exactly one reply correlated by
//! `messageId`. Decoding and queueing happen synchronously, in arrival order;
//! only awaiting the result is deferred.

use crate::context::SessionContext;
use crate::gestures::{scroll_by_offset, GestureTarget, LongPressDrag, ScrollToEdge, DEFAULT_DRAG_HOLD};
use crate::host::{Host, Payload};
use crate::keyboard::{TextChange, TextEditor};
use crate::recording::{RecordingControl, RecordingState};
use crate::resolver::{self, Matcher, TextPattern};
use crate::sync::{IdleTracker, SyncSettingsUpdate};
use chrono::{DateTime, Utc};
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use synctap_common::{
    AccessibilityTrait, ActionKind, ActionMessage, ElementDescriptor, Error, NormalizedPoint,
    OutboundMessage, Rect, Result, ScrollDirection, ScrollEdge, Speed, VIEW_HIERARCHY_EXTENSION,
};
use thiserror::Error as ThisError;
use tracing::{debug, error, info, warn};
use url::Url;

/// Protocol violation that ends the session
#[derive(Debug, ThisError)]
#[error("protocol violation in message {message_id} (`{action}`): {error}")]
pub struct Fault {
    pub message_id: i64,
    pub action: String,
    pub error: Error,
}

/// Result of dispatching one action
#[derive(Debug)]
pub enum DispatchOutcome {
    Reply(OutboundMessage),
    Fault(Fault),
}

// ============================================================================
// Params
// ============================================================================

fn decode<T: DeserializeOwned>(kind: ActionKind, params: &Map<String, Value>) -> Result<T> {
    serde_json::from_value(Value::Object(params.clone())).map_err(|e| Error::InvalidParameterType {
        action: kind.to_string(),
        reason: e.to_string(),
    })
}

fn frame_of(kind: ActionKind, components: &[Option<f64>]) -> Result<Rect> {
    Rect::from_components(components).ok_or_else(|| Error::InvalidParameterType {
        action: kind.to_string(),
        reason: format!("frame must have 4 components, got {}", components.len()),
    })
}

fn millis(kind: ActionKind, name: &str, value: f64) -> Result<Duration> {
    if !value.is_finite() || value < 0.0 {
        return Err(Error::InvalidParameterType {
            action: kind.to_string(),
            reason: format!("`{}` must be a non-negative number of milliseconds, got {}", name, value),
        });
    }
    Ok(Duration::from_secs_f64(value / 1000.0))
}

#[derive(Debug, Deserialize)]
struct ElementTarget {
    #[serde(rename = "elementID")]
    element_id: String,
    #[serde(rename = "elementFrame")]
    element_frame: Vec<Option<f64>>,
}

impl ElementTarget {
    fn descriptor(&self, kind: ActionKind) -> Result<ElementDescriptor> {
        Ok(ElementDescriptor::new(
            self.element_id.clone(),
            frame_of(kind, &self.element_frame)?,
        ))
    }
}

#[derive(Debug, Deserialize)]
struct IdentifiedFrame {
    identifier: String,
    frame: Vec<Option<f64>>,
}

#[derive(Debug, Deserialize)]
struct GetAttributesParams {
    #[serde(rename = "elementIDsAndFrames")]
    elements: Vec<IdentifiedFrame>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FindByTextParams {
    text: String,
    #[serde(default)]
    is_regex: bool,
}

#[derive(Debug, Deserialize)]
struct FindByTypeParams {
    #[serde(rename = "type")]
    type_name: String,
}

#[derive(Debug, Deserialize)]
struct FindByTraitsParams {
    traits: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SetDatePickerParams {
    #[serde(flatten)]
    target: ElementTarget,
    #[serde(rename = "timeIntervalSince1970")]
    time_interval_since_1970: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccessibilityActionParams {
    #[serde(flatten)]
    target: ElementTarget,
    action_name: String,
}

#[derive(Debug, Deserialize)]
struct EvaluateJavaScriptParams {
    #[serde(rename = "webViewIdentifier")]
    web_view_identifier: String,
    #[serde(rename = "webViewFrame")]
    web_view_frame: Vec<Option<f64>>,
    script: String,
}

#[derive(Debug, Deserialize)]
struct CaptureViewHierarchyParams {
    #[serde(rename = "viewHierarchyURL")]
    view_hierarchy_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeliverPayloadParams {
    url: Option<String>,
    #[serde(rename = "sourceApp")]
    source_app: Option<String>,
    #[serde(
        rename = "userNotificationDataURL",
        alias = "detoxUserNotificationDataURL"
    )]
    user_notification_data_url: Option<PathBuf>,
    #[serde(rename = "userActivityDataURL", alias = "detoxUserActivityDataURL")]
    user_activity_data_url: Option<PathBuf>,
    #[serde(rename = "delayPayload", default)]
    delay_payload: bool,
}

impl DeliverPayloadParams {
    fn payload(self) -> Result<Payload> {
        let invalid = |reason: String| Error::InvalidParameterType {
            action: ActionKind::DeliverPayload.to_string(),
            reason,
        };

        if let Some(url) = self.url {
            let url = Url::parse(&url).map_err(|e| invalid(format!("invalid url `{}`: {}", url, e)))?;
            return Ok(Payload::Url {
                url,
                source_app: self.source_app,
            });
        }
        if let Some(data_path) = self.user_notification_data_url {
            return Ok(Payload::UserNotification { data_path });
        }
        if let Some(data_path) = self.user_activity_data_url {
            return Ok(Payload::UserActivity { data_path });
        }
        Err(invalid("no url, user notification or user activity payload".to_string()))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LongPressAndDragParams {
    #[serde(flatten)]
    source: ElementTarget,
    #[serde(rename = "targetElementID")]
    target_element_id: String,
    target_element_frame: Vec<Option<f64>>,
    duration: f64,
    normalized_position_x: Option<f64>,
    normalized_position_y: Option<f64>,
    normalized_target_position_x: Option<f64>,
    normalized_target_position_y: Option<f64>,
    speed: Option<Speed>,
    hold_duration: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScrollToEdgeParams {
    #[serde(flatten)]
    target: ElementTarget,
    edge: ScrollEdge,
    start_position_x: Option<f64>,
    start_position_y: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScrollParams {
    #[serde(flatten)]
    target: ElementTarget,
    offset: f64,
    direction: ScrollDirection,
    start_position_x: Option<f64>,
    start_position_y: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct TextParams {
    #[serde(flatten)]
    target: ElementTarget,
    text: String,
}

#[derive(Debug, Deserialize)]
struct VerifyVisibilityParams {
    #[serde(flatten)]
    target: ElementTarget,
    threshold: f64,
}

// ============================================================================
// Dispatcher
// ============================================================================

fn resolve_target(host: &dyn Host, descriptor: &ElementDescriptor) -> Result<GestureTarget> {
    let handle = resolver::resolve(host, descriptor)?;
    Ok(GestureTarget::new(host, handle, &descriptor.identifier))
}

fn ready(outcome: DispatchOutcome) -> BoxFuture<'static, DispatchOutcome> {
    future::ready(outcome).boxed()
}

/// Routes actions to host operations through the idle-gated UI worker
#[derive(Clone)]
pub struct Dispatcher {
    host: Arc<dyn Host>,
    tracker: IdleTracker,
    recording: Arc<RecordingControl>,
}

impl Dispatcher {
    pub fn new(host: Arc<dyn Host>, tracker: IdleTracker, recording: Arc<RecordingControl>) -> Self {
        Self {
            host,
            tracker,
            recording,
        }
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        self.tracker.context()
    }

    pub fn tracker(&self) -> &IdleTracker {
        &self.tracker
    }

    pub fn recording(&self) -> &Arc<RecordingControl> {
        &self.recording
    }

    /// Dispatch one action; the returned future resolves to its single outcome
    pub fn dispatch(&self, message: ActionMessage) -> BoxFuture<'static, DispatchOutcome> {
        let message_id = message.message_id();
        debug!("Dispatching `{}` (messageId {})", message.action(), message_id);

        let routed = message
            .kind()
            .and_then(|kind| self.route(kind, message_id, message.params()));

        match routed {
            Ok(outcome) => outcome,
            Err(error) => {
                error!("Rejecting `{}` (messageId {}): {}", message.action(), message_id, error);
                ready(DispatchOutcome::Fault(Fault {
                    message_id,
                    action: message.action().to_string(),
                    error,
                }))
            }
        }
    }

    /// Queue `work` behind earlier actions and reply with its params
    fn when_idle<F, Fut>(&self, kind: ActionKind, message_id: i64, work: F) -> BoxFuture<'static, DispatchOutcome>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let rx = self.tracker.enqueue_when_idle(work);

        async move {
            let reply = match rx.await {
                Ok(Ok(params)) => OutboundMessage::reply(kind, message_id, params),
                Ok(Err(error)) => {
                    warn!("`{}` (messageId {}) failed: {}", kind, message_id, error);
                    OutboundMessage::failure(message_id, &error)
                }
                Err(_) => {
                    let error = Error::Host(format!("`{}` was aborted before completing", kind));
                    error!("{}", error);
                    OutboundMessage::failure(message_id, &error)
                }
            };
            DispatchOutcome::Reply(reply)
        }
        .boxed()
    }

    fn route(
        &self,
        kind: ActionKind,
        message_id: i64,
        params: &Map<String, Value>,
    ) -> Result<BoxFuture<'static, DispatchOutcome>> {
        let host = self.host.clone();
        let config = self.context().config().clone();
        let menu_wait = config.gestures.menu_wait();

        let outcome = match kind {
            ActionKind::WaitUntilReady => {
                let context = self.context().clone();
                async move {
                    context.wait_until_launched().await;
                    DispatchOutcome::Reply(OutboundMessage::done(kind, message_id))
                }
                .boxed()
            }

            ActionKind::RequestCurrentStatus => {
                let status = self.tracker.current_status();
                ready(DispatchOutcome::Reply(OutboundMessage::reply(
                    kind,
                    message_id,
                    json!({ "messageId": message_id, "status": status }),
                )))
            }

            ActionKind::ReloadRuntime => {
                if !host.has_reloadable_runtime() {
                    debug!("No reloadable runtime, acknowledging reload");
                    return Ok(ready(DispatchOutcome::Reply(OutboundMessage::done(
                        kind, message_id,
                    ))));
                }

                self.when_idle(kind, message_id, move || async move {
                    info!("Reloading runtime");
                    host.reload_runtime();
                    host.wait_for_runtime_load().await;
                    Ok(json!({}))
                })
            }

            ActionKind::ShakeDevice => self.when_idle(kind, message_id, move || async move {
                host.shake();
                Ok(json!({}))
            }),

            ActionKind::GetAttributes => {
                let params: GetAttributesParams = decode(kind, params)?;
                let descriptors = params
                    .elements
                    .iter()
                    .map(|e| Ok(ElementDescriptor::new(e.identifier.clone(), frame_of(kind, &e.frame)?)))
                    .collect::<Result<Vec<_>>>()?;

                self.when_idle(kind, message_id, move || async move {
                    let elements = descriptors
                        .iter()
                        .map(|descriptor| {
                            let handle = resolver::resolve(&*host, descriptor)?;
                            Ok(host.attributes(handle))
                        })
                        .collect::<Result<Vec<_>>>()?;
                    Ok(json!({ "elements": elements }))
                })
            }

            ActionKind::FindElementsByText
            | ActionKind::FindElementsByType
            | ActionKind::FindElementsByTraits => {
                let matcher = match kind {
                    ActionKind::FindElementsByText => {
                        let params: FindByTextParams = decode(kind, params)?;
                        Matcher::Text(TextPattern::new(&params.text, params.is_regex)?)
                    }
                    ActionKind::FindElementsByType => {
                        let params: FindByTypeParams = decode(kind, params)?;
                        Matcher::Type(params.type_name)
                    }
                    _ => {
                        let params: FindByTraitsParams = decode(kind, params)?;
                        let traits = params
                            .traits
                            .iter()
                            .map(|t| t.parse::<AccessibilityTrait>())
                            .collect::<Result<Vec<_>>>()?;
                        Matcher::Traits(traits)
                    }
                };

                self.when_idle(kind, message_id, move || async move {
                    let found: Vec<Value> = resolver::find(&*host, &matcher)
                        .iter()
                        .map(|element| element.to_json())
                        .collect();
                    Ok(json!({ "elementsIDsAndFrames": found }))
                })
            }

            ActionKind::SetDatePicker => {
                let params: SetDatePickerParams = decode(kind, params)?;
                let descriptor = params.target.descriptor(kind)?;
                let date = date_from_interval(params.time_interval_since_1970).ok_or_else(|| {
                    Error::InvalidParameterType {
                        action: kind.to_string(),
                        reason: format!(
                            "timeIntervalSince1970 {} is out of range",
                            params.time_interval_since_1970
                        ),
                    }
                })?;

                self.when_idle(kind, message_id, move || async move {
                    let target = resolve_target(&*host, &descriptor)?;
                    host.set_date(target.handle, date).map_err(Error::Host)?;
                    Ok(json!({}))
                })
            }

            ActionKind::PerformAccessibilityAction => {
                let params: AccessibilityActionParams = decode(kind, params)?;
                let descriptor = params.target.descriptor(kind)?;
                let action_name = params.action_name;

                self.when_idle(kind, message_id, move || async move {
                    let target = resolve_target(&*host, &descriptor)?;
                    let exists = host
                        .custom_actions(target.handle)
                        .iter()
                        .any(|name| *name == action_name);

                    let did_found = exists && host.perform_custom_action(target.handle, &action_name);
                    if !did_found {
                        debug!("No custom action `{}` on {}", action_name, descriptor);
                    }
                    Ok(json!({ "didFound": did_found }))
                })
            }

            ActionKind::SetSyncSettings => {
                let update: SyncSettingsUpdate = decode(kind, params)?;
                // Applied on receipt so the reply below is gated by the new settings
                self.tracker.apply_settings_update(&update);
                let wait_for_debugger = update.wait_for_debugger;

                self.when_idle(kind, message_id, move || async move {
                    if let Some(ms) = wait_for_debugger {
                        info!("Waiting {}ms for a debugger to attach", ms);
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                    }
                    Ok(json!({}))
                })
            }

            ActionKind::SetRecordingState => {
                let state: RecordingState = decode(kind, params)?;
                let recording = self.recording.clone();

                self.when_idle(kind, message_id, move || async move {
                    recording.apply(state).await?;
                    Ok(json!({}))
                })
            }

            ActionKind::EvaluateJavaScript => {
                let params: EvaluateJavaScriptParams = decode(kind, params)?;
                let descriptor = ElementDescriptor::new(
                    params.web_view_identifier,
                    frame_of(kind, &params.web_view_frame)?,
                );
                let script = params.script;

                self.when_idle(kind, message_id, move || async move {
                    let target = resolve_target(&*host, &descriptor)?;
                    Ok(evaluate_script(&*host, &target, &script).await)
                })
            }

            ActionKind::CaptureViewHierarchy => {
                let params: CaptureViewHierarchyParams = decode(kind, params)?;
                let hierarchy = config.hierarchy.clone();

                self.when_idle(kind, message_id, move || async move {
                    let path = match params.view_hierarchy_url {
                        Some(path) => PathBuf::from(path),
                        None => hierarchy.output_dir().join(format!(
                            "{}.{}",
                            uuid::Uuid::new_v4(),
                            VIEW_HIERARCHY_EXTENSION
                        )),
                    };

                    if path.extension().and_then(|e| e.to_str()) != Some(VIEW_HIERARCHY_EXTENSION) {
                        return Err(Error::InvalidViewHierarchyPath(path.display().to_string()));
                    }

                    if hierarchy.disable_dump {
                        return Ok(json!({ "error": Error::HierarchyDumpDisabled.to_string() }));
                    }

                    match host.dump_view_hierarchy(&path) {
                        Ok(()) => Ok(json!({ "path": path.display().to_string() })),
                        Err(e) => Ok(json!({ "error": e })),
                    }
                })
            }

            ActionKind::DeliverPayload => {
                let params: DeliverPayloadParams = decode(kind, params)?;
                let delay = params.delay_payload;
                let payload = params.payload()?;

                if delay {
                    // Deferred by the lifecycle until the app is active, so no idle wait here
                    host.dispatch_payload(&payload, true);
                    return Ok(ready(DispatchOutcome::Reply(OutboundMessage::done(
                        kind, message_id,
                    ))));
                }

                self.when_idle(kind, message_id, move || async move {
                    host.dispatch_payload(&payload, false);
                    Ok(json!({}))
                })
            }

            ActionKind::LongPressAndDrag => {
                let params: LongPressAndDragParams = decode(kind, params)?;
                let source = params.source.descriptor(kind)?;
                let target = ElementDescriptor::new(
                    params.target_element_id,
                    frame_of(kind, &params.target_element_frame)?,
                );
                let drag = LongPressDrag {
                    start: NormalizedPoint::from_options(
                        params.normalized_position_x,
                        params.normalized_position_y,
                    ),
                    end: NormalizedPoint::from_options(
                        params.normalized_target_position_x,
                        params.normalized_target_position_y,
                    ),
                    duration: millis(kind, "duration", params.duration)?,
                    speed: params.speed.unwrap_or_default(),
                    hold: match params.hold_duration {
                        Some(ms) => millis(kind, "holdDuration", ms)?,
                        None => DEFAULT_DRAG_HOLD,
                    },
                };

                self.when_idle(kind, message_id, move || async move {
                    let source = resolve_target(&*host, &source)?;
                    let target = resolve_target(&*host, &target)?;
                    drag.perform(&*host, &source, &target)?;
                    Ok(json!({}))
                })
            }

            ActionKind::ScrollToEdge => {
                let params: ScrollToEdgeParams = decode(kind, params)?;
                let descriptor = params.target.descriptor(kind)?;
                let start = NormalizedPoint::from_options(params.start_position_x, params.start_position_y);
                let max_swipes = config.gestures.max_edge_swipes;

                self.when_idle(kind, message_id, move || async move {
                    let target = resolve_target(&*host, &descriptor)?;
                    ScrollToEdge::new(&*host, target, params.edge, start, max_swipes).run()?;
                    Ok(json!({}))
                })
            }

            ActionKind::Scroll => {
                let params: ScrollParams = decode(kind, params)?;
                let descriptor = params.target.descriptor(kind)?;
                let start = NormalizedPoint::from_options(params.start_position_x, params.start_position_y);

                self.when_idle(kind, message_id, move || async move {
                    let target = resolve_target(&*host, &descriptor)?;
                    scroll_by_offset(&*host, &target, params.direction, params.offset, start)?;
                    Ok(json!({}))
                })
            }

            ActionKind::TypeText | ActionKind::ClearText | ActionKind::ReplaceText => {
                let (descriptor, change) = match kind {
                    ActionKind::ClearText => {
                        let target: ElementTarget = decode(kind, params)?;
                        (target.descriptor(kind)?, TextChange::Clear)
                    }
                    ActionKind::TypeText => {
                        let params: TextParams = decode(kind, params)?;
                        (params.target.descriptor(kind)?, TextChange::Type(params.text))
                    }
                    _ => {
                        let params: TextParams = decode(kind, params)?;
                        (params.target.descriptor(kind)?, TextChange::Replace(params.text))
                    }
                };

                self.when_idle(kind, message_id, move || async move {
                    let target = resolve_target(&*host, &descriptor)?;
                    TextEditor::new(&*host, &target, menu_wait).apply(&change)?;
                    Ok(json!({}))
                })
            }

            ActionKind::VerifyVisibility => {
                let params: VerifyVisibilityParams = decode(kind, params)?;
                let descriptor = params.target.descriptor(kind)?;
                let threshold = params.threshold;

                self.when_idle(kind, message_id, move || async move {
                    let target = resolve_target(&*host, &descriptor)?;
                    let visible = host.visible_percent(target.handle);
                    Ok(json!({ "isVisible": visible >= threshold }))
                })
            }

            ActionKind::VerifyText => {
                let params: TextParams = decode(kind, params)?;
                let descriptor = params.target.descriptor(kind)?;
                let expected = params.text;

                self.when_idle(kind, message_id, move || async move {
                    let target = resolve_target(&*host, &descriptor)?;
                    let has_text = host.text_value(target.handle).as_deref() == Some(expected.as_str());
                    Ok(json!({ "hasText": has_text }))
                })
            }

            ActionKind::IsElementFocused => {
                let target: ElementTarget = decode(kind, params)?;
                let descriptor = target.descriptor(kind)?;

                self.when_idle(kind, message_id, move || async move {
                    let target = resolve_target(&*host, &descriptor)?;
                    Ok(json!({ "isFocused": host.has_keyboard_focus(target.handle) }))
                })
            }
        };

        Ok(outcome)
    }
}

fn date_from_interval(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() {
        return None;
    }
    let whole = seconds.floor();
    let nanos = ((seconds - whole) * 1e9).round().min(999_999_999.0) as u32;
    DateTime::from_timestamp(whole as i64, nanos)
}

/// Wait for the web surface to finish loading, then evaluate.
///
/// Evaluation problems are reported in the reply, never as a failure.
async fn evaluate_script(host: &dyn Host, target: &GestureTarget, script: &str) -> Value {
    let Some(mut observer) = host.observe_load_state(target.handle) else {
        return json!({ "error": format!("element `{}` is not a web view", target.identifier) });
    };

    if !observer.until_loaded().await {
        return json!({ "error": format!("web view `{}` went away before loading finished", target.identifier) });
    }

    debug!("Evaluating script on `{}`", target.identifier);
    match host.evaluate_script(target.handle, script).await {
        Ok(Some(result)) => json!({ "result": result }),
        Ok(None) => json!({}),
        Err(e) => json!({ "error": e }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::virtual_host::{VirtualHost, VirtualRecorder};
    use serde_json::json;

    fn fixture() -> Value {
        json!({
            "screen": [400, 800],
            "surfaces": [{
                "identifier": "root",
                "frame": [0, 0, 400, 800],
                "children": [
                    { "identifier": "Btn1", "frame": [0, 0, 100, 40], "text": "Top", "classes": ["UIButton", "UIControl"], "traits": ["button"] },
                    { "identifier": "Btn1", "frame": [0, 500, 100, 40], "text": "Bottom", "classes": ["UIButton", "UIControl"], "traits": ["button"] },
                    { "identifier": "web", "frame": [0, 100, 400, 300], "web": { "loading": true, "scripts": { "document.title": "Home" } } },
                    { "identifier": "field", "frame": [20, 600, 360, 44], "editable": true, "text": "" },
                    { "identifier": "picker", "frame": [0, 660, 400, 100], "datePicker": true, "customActions": ["increment"] }
                ]
            }]
        })
    }

    struct Harness {
        host: Arc<VirtualHost>,
        dispatcher: Dispatcher,
    }

    fn harness_with(config: AgentConfig) -> Harness {
        harness_from(config, fixture())
    }

    fn harness_from(config: AgentConfig, fixture: Value) -> Harness {
        let host = Arc::new(VirtualHost::from_json(fixture).unwrap());
        let context = SessionContext::new(config);
        let tracker = IdleTracker::new(context);
        let recording = Arc::new(RecordingControl::new(Arc::new(VirtualRecorder::default())));
        let dispatcher = Dispatcher::new(host.clone(), tracker, recording);
        Harness { host, dispatcher }
    }

    fn harness() -> Harness {
        harness_with(AgentConfig::default())
    }

    fn message(id: i64, action: &str, params: Value) -> ActionMessage {
        let params = match params {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        ActionMessage::new(id, action, params)
    }

    async fn reply(dispatcher: &Dispatcher, msg: ActionMessage) -> OutboundMessage {
        match tokio::time::timeout(Duration::from_secs(2), dispatcher.dispatch(msg))
            .await
            .unwrap()
        {
            DispatchOutcome::Reply(reply) => reply,
            DispatchOutcome::Fault(fault) => panic!("unexpected fault: {}", fault),
        }
    }

    #[tokio::test]
    async fn test_unknown_action_is_fault() {
        let h = harness();
        let outcome = h.dispatcher.dispatch(message(5, "teleport", json!({}))).await;
        match outcome {
            DispatchOutcome::Fault(fault) => {
                assert_eq!(fault.message_id, 5);
                assert!(matches!(fault.error, Error::UnknownActionType(_)));
            }
            other => panic!("expected fault, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_mistyped_params_are_fault() {
        let h = harness();
        let outcome = h
            .dispatcher
            .dispatch(message(6, "scroll", json!({ "elementID": "list", "elementFrame": [0, 0, 1, 1], "offset": "far", "direction": "down" })))
            .await;
        assert!(matches!(
            outcome,
            DispatchOutcome::Fault(Fault { error: Error::InvalidParameterType { .. }, .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_drag_speed_is_fault() {
        let h = harness();
        let outcome = h
            .dispatcher
            .dispatch(message(
                7,
                "longPressAndDrag",
                json!({
                    "elementID": "Btn1", "elementFrame": [0, 0, 100, 40],
                    "targetElementID": "field", "targetElementFrame": [null, null, null, null],
                    "duration": 1000, "speed": "warp"
                }),
            ))
            .await;
        assert!(matches!(outcome, DispatchOutcome::Fault(_)));
    }

    #[tokio::test]
    async fn test_get_attributes_resolves_by_hint() {
        let h = harness();
        let out = reply(
            &h.dispatcher,
            message(
                10,
                "getAttributes",
                json!({ "elementIDsAndFrames": [{ "identifier": "Btn1", "frame": [0, 495, 100, 40] }] }),
            ),
        )
        .await;

        assert_eq!(out.action, "attributes");
        assert_eq!(out.message_id, 10);
        assert_eq!(out.params["elements"][0]["text"], "Bottom");
    }

    #[tokio::test]
    async fn test_missing_element_is_action_failed() {
        let h = harness();
        let out = reply(
            &h.dispatcher,
            message(11, "isElementFocused", json!({ "elementID": "ghost", "elementFrame": [0, 0, 1, 1] })),
        )
        .await;

        assert!(out.is_failure());
        assert_eq!(out.message_id, 11);
        assert_eq!(out.params["error"], "ElementNotFound");
        assert_eq!(out.params["details"]["identifier"], "ghost");
    }

    #[tokio::test]
    async fn test_find_by_traits_and_type() {
        let h = harness();
        let out = reply(
            &h.dispatcher,
            message(12, "findElementsByTraits", json!({ "traits": ["button"] })),
        )
        .await;
        assert_eq!(out.action, "elementsDidFound");
        assert_eq!(out.params["elementsIDsAndFrames"].as_array().unwrap().len(), 2);

        let out = reply(
            &h.dispatcher,
            message(13, "findElementsByType", json!({ "type": "UIControl" })),
        )
        .await;
        assert_eq!(out.params["elementsIDsAndFrames"][1]["frame"], json!([0.0, 500.0, 100.0, 40.0]));
    }

    #[tokio::test]
    async fn test_find_by_regex_text() {
        let h = harness();
        let out = reply(
            &h.dispatcher,
            message(14, "findElementsByText", json!({ "text": "/^bot/i", "isRegex": true })),
        )
        .await;
        let found = out.params["elementsIDsAndFrames"].as_array().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["identifier"], "Btn1");
    }

    #[tokio::test]
    async fn test_status_answers_while_ui_is_blocked() {
        let h = harness();
        let _busy = h.dispatcher.tracker().track_animation("spinner");

        let mut shake = h.dispatcher.dispatch(message(20, "shakeDevice", json!({})));
        let status = reply(&h.dispatcher, message(21, "requestCurrentStatus", json!({}))).await;

        assert_eq!(status.action, "currentStatusResult");
        assert_eq!(status.params["messageId"], 21);
        assert_eq!(status.params["status"]["appStatus"], "busy");
        assert_eq!(status.params["status"]["pendingWork"], 1);

        assert!(tokio::time::timeout(Duration::from_millis(30), &mut shake).await.is_err());
        drop(_busy);
        match shake.await {
            DispatchOutcome::Reply(out) => assert_eq!(out.action, "deviceDidShake"),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(h.host.shake_count(), 1);
    }

    #[tokio::test]
    async fn test_wait_until_ready_waits_for_launch() {
        let h = harness();
        let mut ready = h.dispatcher.dispatch(message(1, "waitUntilReady", json!({})));

        assert!(tokio::time::timeout(Duration::from_millis(30), &mut ready).await.is_err());
        h.dispatcher.context().mark_launched();

        match ready.await {
            DispatchOutcome::Reply(out) => {
                assert_eq!(out.action, "isReady");
                assert_eq!(out.message_id, 1);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sync_settings_round_trip() {
        let h = harness();
        let out = reply(
            &h.dispatcher,
            message(30, "setSyncSettings", json!({ "maxTimerWait": 250, "blacklistURLs": [".*ads.*"] })),
        )
        .await;
        assert_eq!(out.action, "didSetSyncSettings");

        let status = reply(&h.dispatcher, message(31, "requestCurrentStatus", json!({}))).await;
        let settings = &status.params["status"]["settings"];
        assert_eq!(settings["maxTimerWaitMs"], 250.0);
        assert_eq!(settings["blacklistedUrlPatterns"], json!([".*ads.*"]));
    }

    #[tokio::test]
    async fn test_disabling_sync_unblocks_busy_app() {
        let h = harness();
        let _runaway = h.dispatcher.tracker().track_animation("runaway spinner");

        let mut shake = h.dispatcher.dispatch(message(32, "shakeDevice", json!({})));
        assert!(tokio::time::timeout(Duration::from_millis(30), &mut shake).await.is_err());

        let out = reply(&h.dispatcher, message(33, "setSyncSettings", json!({ "enabled": false }))).await;
        assert_eq!(out.action, "didSetSyncSettings");
        assert!(!h.dispatcher.context().sync_settings().synchronization_enabled);

        // Work queued before the update runs once the new settings apply
        match tokio::time::timeout(Duration::from_secs(2), shake).await.unwrap() {
            DispatchOutcome::Reply(out) => assert_eq!(out.action, "deviceDidShake"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_evaluate_javascript_after_load() {
        let h = harness();
        let pending = h.dispatcher.dispatch(message(
            40,
            "evaluateJavaScript",
            json!({ "webViewIdentifier": "web", "webViewFrame": [0, 100, 400, 300], "script": "document.title" }),
        ));

        let host = h.host.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            host.finish_loading("web");
        });

        match tokio::time::timeout(Duration::from_secs(2), pending).await.unwrap() {
            DispatchOutcome::Reply(out) => {
                assert_eq!(out.action, "didEvaluateJavaScript");
                assert_eq!(out.params, json!({ "result": "Home" }));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_evaluate_javascript_reports_script_error() {
        let h = harness();
        h.host.finish_loading("web");

        let out = reply(
            &h.dispatcher,
            message(41, "evaluateJavaScript", json!({ "webViewIdentifier": "web", "webViewFrame": [null, null, null, null], "script": "boom()" })),
        )
        .await;
        assert!(out.params.get("result").is_none());
        assert!(out.params["error"].as_str().unwrap().contains("boom()"));
    }

    #[tokio::test]
    async fn test_capture_view_hierarchy_paths() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AgentConfig::default();
        config.hierarchy.output_dir = Some(dir.path().to_path_buf());
        let h = harness_with(config);

        let out = reply(&h.dispatcher, message(50, "captureViewHierarchy", json!({}))).await;
        let path = PathBuf::from(out.params["path"].as_str().unwrap());
        assert!(path.starts_with(dir.path()));
        assert!(path.exists());

        let out = reply(
            &h.dispatcher,
            message(51, "captureViewHierarchy", json!({ "viewHierarchyURL": "/tmp/dump.json" })),
        )
        .await;
        assert!(out.is_failure());
        assert_eq!(out.params["error"], "InvalidViewHierarchyPath");
    }

    #[tokio::test]
    async fn test_capture_view_hierarchy_disabled() {
        let mut config = AgentConfig::default();
        config.hierarchy.disable_dump = true;
        let h = harness_with(config);

        let out = reply(&h.dispatcher, message(52, "captureViewHierarchy", json!({}))).await;
        assert_eq!(out.action, "didCaptureViewHierarchy");
        assert!(out.params["error"].is_string());
    }

    #[tokio::test]
    async fn test_deliver_payload_variants() {
        let h = harness();

        reply(
            &h.dispatcher,
            message(60, "deliverPayload", json!({ "url": "shop://cart", "sourceApp": "com.apple.mobilesafari" })),
        )
        .await;
        reply(
            &h.dispatcher,
            message(61, "deliverPayload", json!({ "detoxUserNotificationDataURL": "/tmp/n.json", "delayPayload": true })),
        )
        .await;

        let delivered = h.host.delivered_payloads();
        assert_eq!(delivered.len(), 2);
        assert!(matches!(delivered[0].0, Payload::Url { ref source_app, .. } if source_app.as_deref() == Some("com.apple.mobilesafari")));
        assert!(delivered[1].1);
    }

    #[tokio::test]
    async fn test_deliver_payload_without_payload_is_fault() {
        let h = harness();
        let outcome = h.dispatcher.dispatch(message(62, "deliverPayload", json!({}))).await;
        assert!(matches!(outcome, DispatchOutcome::Fault(_)));
    }

    #[tokio::test]
    async fn test_accessibility_action_lookup() {
        let h = harness();
        let found = reply(
            &h.dispatcher,
            message(70, "performAccessibilityAction", json!({ "elementID": "picker", "elementFrame": [0, 660, 400, 100], "actionName": "increment" })),
        )
        .await;
        assert_eq!(found.params["didFound"], true);

        let missing = reply(
            &h.dispatcher,
            message(71, "performAccessibilityAction", json!({ "elementID": "picker", "elementFrame": [0, 660, 400, 100], "actionName": "activate" })),
        )
        .await;
        assert_eq!(missing.params["didFound"], false);
    }

    #[tokio::test]
    async fn test_set_date_picker() {
        let h = harness();
        let out = reply(
            &h.dispatcher,
            message(80, "setDatePicker", json!({ "elementID": "picker", "elementFrame": [0, 660, 400, 100], "timeIntervalSince1970": 1700000000.5 })),
        )
        .await;
        assert_eq!(out.action, "didSetDatePicker");
        assert_eq!(
            h.host.date_of("picker").unwrap().timestamp_millis(),
            1_700_000_000_500
        );
    }

    #[tokio::test]
    async fn test_text_actions_and_checks() {
        let h = harness();
        let target = json!({ "elementID": "field", "elementFrame": [20, 600, 360, 44] });

        let mut typed = target.clone();
        typed["text"] = json!("hello");
        let out = reply(&h.dispatcher, message(90, "typeText", typed)).await;
        assert_eq!(out.action, "didChangeText");

        let mut verify = target.clone();
        verify["text"] = json!("hello");
        let out = reply(&h.dispatcher, message(91, "verifyText", verify)).await;
        assert_eq!(out.params["hasText"], true);

        let out = reply(&h.dispatcher, message(92, "isElementFocused", target.clone())).await;
        assert_eq!(out.params["isFocused"], true);

        let out = reply(&h.dispatcher, message(93, "clearText", target.clone())).await;
        assert_eq!(out.action, "didChangeText");
        assert_eq!(h.host.text_of("field").as_deref(), Some(""));

        let mut visibility = target;
        visibility["threshold"] = json!(75);
        let out = reply(&h.dispatcher, message(94, "verifyVisibility", visibility)).await;
        assert_eq!(out.params["isVisible"], true);
    }

    #[tokio::test]
    async fn test_recording_state() {
        let h = harness();
        reply(
            &h.dispatcher,
            message(100, "setRecordingState", json!({ "recordingPath": "/tmp/a.dtxrec" })),
        )
        .await;
        assert!(h.dispatcher.recording().is_recording());

        let out = reply(&h.dispatcher, message(101, "setRecordingState", json!({}))).await;
        assert_eq!(out.action, "didSetRecordingState");
        assert!(!h.dispatcher.recording().is_recording());
    }

    #[tokio::test]
    async fn test_reload_without_runtime_acknowledges() {
        let h = harness();
        let out = reply(&h.dispatcher, message(110, "reloadRuntime", json!({}))).await;
        assert_eq!(out.action, "runtimeDidReload");
        assert_eq!(h.host.reload_count(), 0);
    }

    #[tokio::test]
    async fn test_reload_waits_for_runtime_load() {
        let mut fixture = fixture();
        fixture["reloadableRuntime"] = json!(true);
        fixture["manualRuntimeLoad"] = json!(true);
        let h = harness_from(AgentConfig::default(), fixture);

        let mut reload = h.dispatcher.dispatch(message(111, "reloadRuntime", json!({})));
        assert!(tokio::time::timeout(Duration::from_millis(50), &mut reload).await.is_err());
        assert_eq!(h.host.reload_count(), 1);

        h.host.finish_runtime_load();
        match tokio::time::timeout(Duration::from_secs(2), reload).await.unwrap() {
            DispatchOutcome::Reply(out) => {
                assert_eq!(out.action, "runtimeDidReload");
                assert_eq!(out.message_id, 111);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(h.host.reload_count(), 1);
    }

    #[test]
    fn test_date_from_interval() {
        let date = date_from_interval(86_400.25).unwrap();
        assert_eq!(date.timestamp(), 86_400);
        assert_eq!(date.timestamp_subsec_millis(), 250);
        assert!(date_from_interval(f64::NAN).is_none());
    }
}
