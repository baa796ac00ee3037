//! Start/stop/continue control over the profiling recorder

use crate::config::LaunchRecordingConfig;
use crate::host::{RecordingConfig, Recorder};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use synctap_common::{Error, Result};
use tracing::{info, warn};

/// Params of `setRecordingState`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingState {
    /// Present to start recording, absent to stop
    pub recording_path: Option<PathBuf>,
    pub sampling_interval: Option<f64>,
}

/// Tracks whether a recording is active and drives the recorder
pub struct RecordingControl {
    recorder: Arc<dyn Recorder>,
    active: Mutex<Option<RecordingConfig>>,
}

impl RecordingControl {
    pub fn new(recorder: Arc<dyn Recorder>) -> Self {
        Self {
            recorder,
            active: Mutex::new(None),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.active.lock().is_some()
    }

    pub fn active(&self) -> Option<RecordingConfig> {
        self.active.lock().clone()
    }

    /// Continue a recording the launcher started before the agent came up
    pub fn resume_from_launch(&self, launch: &LaunchRecordingConfig) {
        let Some(path) = &launch.path else {
            return;
        };

        let config = RecordingConfig {
            recording_path: path.clone(),
            sampling_interval: launch.sampling_interval,
        };
        info!("Continuing launch recording at {}", path.display());
        self.recorder.resume(&config);
        *self.active.lock() = Some(config);
    }

    /// Start when a path is given, otherwise stop and flush
    pub async fn apply(&self, state: RecordingState) -> Result<()> {
        match state.recording_path {
            Some(recording_path) => {
                if self.is_recording() {
                    self.stop().await?;
                }

                let config = RecordingConfig {
                    recording_path,
                    sampling_interval: state.sampling_interval,
                };
                info!("Starting recording at {}", config.recording_path.display());
                self.recorder.start(&config);
                *self.active.lock() = Some(config);
                Ok(())
            }
            None => self.stop().await,
        }
    }

    /// Stop and flush; a no-op when nothing is recording
    pub async fn stop(&self) -> Result<()> {
        let Some(config) = self.active.lock().take() else {
            return Ok(());
        };

        info!("Stopping recording at {}", config.recording_path.display());
        self.recorder.stop().await.map_err(Error::Host)
    }

    /// Stop with an upper bound on flushing; `false` if the bound was hit
    pub async fn stop_within(&self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.stop()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!("Failed to flush recording: {}", e);
                true
            }
            Err(_) => {
                warn!("Recording did not flush within {:?}", timeout);
                false
            }
        }
    }
}
