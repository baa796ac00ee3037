//! synctap agent
//!
//! Runs inside the application under test. Connects to a remote test driver
//! over WebSocket, executes the UI actions it sends once the application is
//! idle, and answers every action with exactly one correlated reply.

pub mod config;
pub mod context;
pub mod dispatcher;
pub mod gestures;
pub mod host;
pub mod keyboard;
pub mod recording;
pub mod resolver;
pub mod session;
pub mod sync;
pub mod transport;
pub mod virtual_host;

pub use config::AgentConfig;
pub use context::SessionContext;
pub use dispatcher::{DispatchOutcome, Dispatcher, Fault};
pub use host::{ElementHandle, Host, Recorder};
pub use recording::RecordingControl;
pub use session::{CrashReporter, Session};
pub use sync::{IdleTracker, ResourceGuard, StatusReport};
pub use virtual_host::{VirtualHost, VirtualRecorder};

use std::sync::Arc;

/// Wire a session around a host and recorder
pub fn build_session(
    config: AgentConfig,
    host: Arc<dyn Host>,
    recorder: Arc<dyn Recorder>,
) -> Session {
    let context = SessionContext::new(config);
    let recording = Arc::new(RecordingControl::new(recorder));
    recording.resume_from_launch(&context.config().recording);

    let tracker = IdleTracker::new(context);
    Session::new(Dispatcher::new(host, tracker, recording))
}
