//! synctap Common Library
//!
//! Shared geometry, settings, wire protocol, and error types used by the
//! synctap agent and by driver-side tooling that speaks the same protocol.

pub mod error;
pub mod protocol;
pub mod types;

// Re-export commonly used types
pub use error::{Error, Result};
pub use protocol::{
    ActionKind, ActionMessage, OutboundMessage, CRASH_REPORT_MESSAGE_ID, LOGIN_MESSAGE_ID,
};
pub use types::*;

/// synctap version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default driver endpoint
pub const DEFAULT_SERVER: &str = "ws://localhost:8997";

/// File extension required for view hierarchy dumps
pub const VIEW_HIERARCHY_EXTENSION: &str = "viewhierarchy";
