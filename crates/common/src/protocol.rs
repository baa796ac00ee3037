//! Driver wire protocol
//!
//! Every frame is a JSON object `{"type": ..., "params": {...}, "messageId": n}`.
//! Responses echo the `messageId` of the request they answer; unsolicited
//! notifications use reserved identifiers.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::str::FromStr;

/// Identifier for notifications that answer no request (crash reports)
pub const CRASH_REPORT_MESSAGE_ID: i64 = -10000;

/// Identifier used for the login frame sent after connecting
pub const LOGIN_MESSAGE_ID: i64 = 0;

/// Action name of the failure response
pub const ACTION_FAILED: &str = "actionFailed";

/// Action name of the crash notification
pub const APP_WILL_TERMINATE: &str = "AppWillTerminateWithError";

// Wire envelope shared by both directions
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type", alias = "action")]
    action: String,
    #[serde(default)]
    params: Value,
    #[serde(rename = "messageId")]
    message_id: i64,
}

/// Inbound action, immutable once decoded
#[derive(Debug, Clone, PartialEq)]
pub struct ActionMessage {
    message_id: i64,
    action: String,
    params: Map<String, Value>,
}

impl ActionMessage {
    pub fn new(message_id: i64, action: impl Into<String>, params: Map<String, Value>) -> Self {
        Self {
            message_id,
            action: action.into(),
            params,
        }
    }

    /// Decode a text frame
    pub fn decode(frame: &str) -> Result<Self> {
        let envelope: Envelope = serde_json::from_str(frame)?;

        let params = match envelope.params {
            Value::Null => Map::new(),
            Value::Object(map) => map,
            other => {
                return Err(Error::InvalidParameterType {
                    action: envelope.action,
                    reason: format!("params must be an object, got {}", other),
                })
            }
        };

        Ok(Self {
            message_id: envelope.message_id,
            action: envelope.action,
            params,
        })
    }

    pub fn message_id(&self) -> i64 {
        self.message_id
    }

    /// Raw action name as sent by the driver
    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }

    /// Parse the action name into a known kind
    pub fn kind(&self) -> Result<ActionKind> {
        self.action.parse()
    }
}

/// Outbound frame: a response or an unsolicited notification
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub action: String,
    pub params: Value,
    pub message_id: i64,
}

impl OutboundMessage {
    pub fn new(action: impl Into<String>, params: Value, message_id: i64) -> Self {
        Self {
            action: action.into(),
            params,
            message_id,
        }
    }

    /// Successful response to `kind` without a payload
    pub fn done(kind: ActionKind, message_id: i64) -> Self {
        Self::new(kind.response_name(), json!({}), message_id)
    }

    /// Successful response to `kind` carrying `params`
    pub fn reply(kind: ActionKind, message_id: i64, params: Value) -> Self {
        Self::new(kind.response_name(), params, message_id)
    }

    /// Structured failure response correlated to `message_id`
    pub fn failure(message_id: i64, error: &Error) -> Self {
        Self::new(
            ACTION_FAILED,
            json!({
                "error": error.code(),
                "message": error.to_string(),
                "details": error.details(),
            }),
            message_id,
        )
    }

    /// Unsolicited crash notification
    pub fn crash_report(details: Value) -> Self {
        Self::new(APP_WILL_TERMINATE, details, CRASH_REPORT_MESSAGE_ID)
    }

    /// First frame sent on a fresh connection
    pub fn login(session_id: &str) -> Self {
        Self::new(
            "login",
            json!({ "sessionId": session_id, "role": "app" }),
            LOGIN_MESSAGE_ID,
        )
    }

    pub fn is_failure(&self) -> bool {
        self.action == ACTION_FAILED
    }

    pub fn encode(&self) -> Result<String> {
        let envelope = Envelope {
            action: self.action.clone(),
            params: self.params.clone(),
            message_id: self.message_id,
        };
        Ok(serde_json::to_string(&envelope)?)
    }

    /// Parse a frame produced by `encode` (used by driver-side tooling and tests)
    pub fn decode(frame: &str) -> Result<Self> {
        let envelope: Envelope = serde_json::from_str(frame)?;
        Ok(Self {
            action: envelope.action,
            params: envelope.params,
            message_id: envelope.message_id,
        })
    }
}

/// Every action the dispatcher understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    WaitUntilReady,
    ReloadRuntime,
    RequestCurrentStatus,
    ShakeDevice,
    GetAttributes,
    FindElementsByText,
    FindElementsByType,
    FindElementsByTraits,
    SetDatePicker,
    PerformAccessibilityAction,
    SetSyncSettings,
    SetRecordingState,
    EvaluateJavaScript,
    CaptureViewHierarchy,
    DeliverPayload,
    LongPressAndDrag,
    ScrollToEdge,
    Scroll,
    TypeText,
    ClearText,
    ReplaceText,
    VerifyVisibility,
    VerifyText,
    IsElementFocused,
}

impl ActionKind {
    pub const ALL: &'static [ActionKind] = &[
        ActionKind::WaitUntilReady,
        ActionKind::ReloadRuntime,
        ActionKind::RequestCurrentStatus,
        ActionKind::ShakeDevice,
        ActionKind::GetAttributes,
        ActionKind::FindElementsByText,
        ActionKind::FindElementsByType,
        ActionKind::FindElementsByTraits,
        ActionKind::SetDatePicker,
        ActionKind::PerformAccessibilityAction,
        ActionKind::SetSyncSettings,
        ActionKind::SetRecordingState,
        ActionKind::EvaluateJavaScript,
        ActionKind::CaptureViewHierarchy,
        ActionKind::DeliverPayload,
        ActionKind::LongPressAndDrag,
        ActionKind::ScrollToEdge,
        ActionKind::Scroll,
        ActionKind::TypeText,
        ActionKind::ClearText,
        ActionKind::ReplaceText,
        ActionKind::VerifyVisibility,
        ActionKind::VerifyText,
        ActionKind::IsElementFocused,
    ];

    /// Name used on the wire for requests
    pub fn wire_name(self) -> &'static str {
        match self {
            ActionKind::WaitUntilReady => "waitUntilReady",
            ActionKind::ReloadRuntime => "reloadRuntime",
            ActionKind::RequestCurrentStatus => "requestCurrentStatus",
            ActionKind::ShakeDevice => "shakeDevice",
            ActionKind::GetAttributes => "getAttributes",
            ActionKind::FindElementsByText => "findElementsByText",
            ActionKind::FindElementsByType => "findElementsByType",
            ActionKind::FindElementsByTraits => "findElementsByTraits",
            ActionKind::SetDatePicker => "setDatePicker",
            ActionKind::PerformAccessibilityAction => "performAccessibilityAction",
            ActionKind::SetSyncSettings => "setSyncSettings",
            ActionKind::SetRecordingState => "setRecordingState",
            ActionKind::EvaluateJavaScript => "evaluateJavaScript",
            ActionKind::CaptureViewHierarchy => "captureViewHierarchy",
            ActionKind::DeliverPayload => "deliverPayload",
            ActionKind::LongPressAndDrag => "longPressAndDrag",
            ActionKind::ScrollToEdge => "scrollToEdge",
            ActionKind::Scroll => "scroll",
            ActionKind::TypeText => "typeText",
            ActionKind::ClearText => "clearText",
            ActionKind::ReplaceText => "replaceText",
            ActionKind::VerifyVisibility => "verifyVisibility",
            ActionKind::VerifyText => "verifyText",
            ActionKind::IsElementFocused => "isElementFocused",
        }
    }

    /// Name of the success response
    pub fn response_name(self) -> &'static str {
        match self {
            ActionKind::WaitUntilReady => "isReady",
            ActionKind::ReloadRuntime => "runtimeDidReload",
            ActionKind::RequestCurrentStatus => "currentStatusResult",
            ActionKind::ShakeDevice => "deviceDidShake",
            ActionKind::GetAttributes => "attributes",
            ActionKind::FindElementsByText
            | ActionKind::FindElementsByType
            | ActionKind::FindElementsByTraits => "elementsDidFound",
            ActionKind::SetDatePicker => "didSetDatePicker",
            ActionKind::PerformAccessibilityAction => "didPerformAccessibilityAction",
            ActionKind::SetSyncSettings => "didSetSyncSettings",
            ActionKind::SetRecordingState => "didSetRecordingState",
            ActionKind::EvaluateJavaScript => "didEvaluateJavaScript",
            ActionKind::CaptureViewHierarchy => "didCaptureViewHierarchy",
            ActionKind::DeliverPayload => "didDeliverPayload",
            ActionKind::LongPressAndDrag => "didLongPressAndDrag",
            ActionKind::ScrollToEdge | ActionKind::Scroll => "didScroll",
            ActionKind::TypeText | ActionKind::ClearText | ActionKind::ReplaceText => {
                "didChangeText"
            }
            ActionKind::VerifyVisibility => "didVerifyVisibility",
            ActionKind::VerifyText => "didVerifyText",
            ActionKind::IsElementFocused => "didElementFocusCheck",
        }
    }
}

impl FromStr for ActionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ActionKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.wire_name() == s)
            .ok_or_else(|| Error::UnknownActionType(s.to_string()))
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}
