//! Agent state management

use std::sync::Arc;

use tokio::sync::Mutex;

use watchsec_core::config::AgentConfig;
use watchsec_protocol::AgentId;

use crate::negotiator::DirectPaths;
use crate::platform::Backend;
use crate::recording::{Recorder, RecordingUploader};
use crate::stream::StreamGate;

/// Process-wide state shared by the agent's workers.
///
/// Outlives individual hub connections: a recording keeps running while the
/// agent reconnects.
pub struct AgentState {
    /// Configuration
    pub config: AgentConfig,
    /// Identity presented to the hub
    pub agent_id: AgentId,
    /// Screen capture and input backend
    pub backend: Arc<dyn Backend>,
    /// Live and recording flags
    pub gate: Arc<StreamGate>,
    /// Connected peer links
    pub paths: DirectPaths,
    pub recorder: Arc<Mutex<Recorder>>,
    /// `None` if the upload client could not be built
    pub uploader: Option<Arc<RecordingUploader>>,
}

impl AgentState {
    /// Create new agent state
    pub fn new(config: AgentConfig, backend: Arc<dyn Backend>) -> Self {
        let agent_id = AgentId::new(config.agent_id());
        let recorder = Recorder::new(
            config.recording.directory.clone(),
            agent_id.clone(),
            config.stream.fps,
        );
        let uploader = match RecordingUploader::from_config(&config) {
            Ok(uploader) => Some(Arc::new(uploader)),
            Err(e) => {
                tracing::warn!("Recording upload disabled: {}", e);
                None
            }
        };

        Self {
            config,
            agent_id,
            backend,
            gate: Arc::new(StreamGate::new()),
            paths: DirectPaths::new(),
            recorder: Arc::new(Mutex::new(recorder)),
            uploader,
        }
    }
}
