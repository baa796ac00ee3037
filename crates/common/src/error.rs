//! Error types for synctap

use serde_json::{json, Value};
use thiserror::Error;

use crate::types::Rect;

/// Result type alias using synctap Error
pub type Result<T> = std::result::Result<T, Error>;

/// synctap error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to find element with identifier `{identifier}` and frame {frame} ({scanned} elements scanned)")]
    ElementNotFound {
        identifier: String,
        frame: Rect,
        scanned: usize,
    },

    #[error("Failed to hit element with identifier `{identifier}` at {frame}, element is not hittable")]
    ElementNotHittable { identifier: String, frame: Rect },

    #[error("Failed to scroll element with identifier `{identifier}` at {frame}, element is not scrollable")]
    ElementNotScrollable { identifier: String, frame: Rect },

    #[error("Element with identifier `{identifier}` did not reach its {edge} edge after {swipes} swipes")]
    ScrollEdgeNotReached {
        identifier: String,
        edge: String,
        swipes: u32,
    },

    #[error("Failed to focus on element with the keyboard (element identifier: `{identifier}`)")]
    FailedToFocusKeyboard { identifier: String },

    #[error("Failed to paste new text on text input, on action: {on_action}")]
    FailedToPasteNewText { on_action: String },

    #[error("Cannot change text of element `{identifier}`, it has no text value")]
    NotTextInput { identifier: String },

    #[error("Invalid parameters for `{action}`: {reason}")]
    InvalidParameterType { action: String, reason: String },

    #[error("Unknown action type received: {0}")]
    UnknownActionType(String),

    #[error("Provided view hierarchy path is not in the expected format, ending with `.viewhierarchy`: {0}")]
    InvalidViewHierarchyPath(String),

    #[error("View hierarchy dumping is disabled by configuration")]
    HierarchyDumpDisabled,

    #[error("Host error: {0}")]
    Host(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Stable name reported to the driver
    pub fn code(&self) -> &'static str {
        match self {
            Error::ElementNotFound { .. } => "ElementNotFound",
            Error::ElementNotHittable { .. } => "ElementNotHittable",
            Error::ElementNotScrollable { .. } => "ElementNotScrollable",
            Error::ScrollEdgeNotReached { .. } => "ScrollEdgeNotReached",
            Error::FailedToFocusKeyboard { .. } => "FailedToFocusKeyboard",
            Error::FailedToPasteNewText { .. } => "FailedToPasteNewText",
            Error::NotTextInput { .. } => "NotTextInput",
            Error::InvalidParameterType { .. } => "InvalidParameterType",
            Error::UnknownActionType(_) => "UnknownActionType",
            Error::InvalidViewHierarchyPath(_) => "InvalidViewHierarchyPath",
            Error::HierarchyDumpDisabled => "HierarchyDumpDisabled",
            Error::Host(_) => "HostError",
            Error::Transport(_) => "TransportError",
            Error::InvalidConfig(_) => "InvalidConfig",
            Error::Io(_) => "IoError",
            Error::Serialization(_) => "SerializationError",
        }
    }

    /// Errors that mean driver and agent disagree on the protocol.
    ///
    /// These are never answered with an error response; the session shuts
    /// down instead.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Error::UnknownActionType(_) | Error::InvalidParameterType { .. }
        )
    }

    /// Structured context attached to failure responses
    pub fn details(&self) -> Value {
        match self {
            Error::ElementNotFound {
                identifier,
                frame,
                scanned,
            } => json!({
                "identifier": identifier,
                "frame": frame.components(),
                "scanned": scanned,
            }),
            Error::ElementNotHittable { identifier, frame }
            | Error::ElementNotScrollable { identifier, frame } => json!({
                "identifier": identifier,
                "frame": frame.components(),
            }),
            Error::ScrollEdgeNotReached {
                identifier,
                edge,
                swipes,
            } => json!({
                "identifier": identifier,
                "edge": edge,
                "swipes": swipes,
            }),
            Error::FailedToFocusKeyboard { identifier } | Error::NotTextInput { identifier } => {
                json!({ "identifier": identifier })
            }
            Error::FailedToPasteNewText { on_action } => json!({ "onAction": on_action }),
            Error::InvalidParameterType { action, reason } => json!({
                "action": action,
                "reason": reason,
            }),
            Error::UnknownActionType(action) => json!({ "action": action }),
            Error::InvalidViewHierarchyPath(path) => json!({ "path": path }),
            _ => json!({}),
        }
    }
}
