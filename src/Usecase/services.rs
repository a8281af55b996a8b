//! Collaborators the engine talks to. All of them are injected through [`EngineServices`].

use std::sync::Arc;

use log::warn;

use crate::Core::error::SubmitError;
use crate::Core::metadata::MetadataPool;
use crate::Usecase::Structs::{FrameworkResult, NotifyMessage, PipelineRequest, SessionId};

/// Downstream processing pipeline.
pub trait PipelineExecutor: Send + Sync {
    /// Hands a request to the pipeline. Results come back through the engine's `on_result`.
    fn submit(&self, request: &PipelineRequest<'_>) -> Result<(), SubmitError>;

    /// Drops or completes everything in flight on one session. Blocks until done.
    fn flush_session(&self, session: SessionId);
}

/// Delivery boundary towards the caller.
pub trait ResultSink: Send + Sync {
    fn deliver_result(&self, result: FrameworkResult);
    fn deliver_message(&self, message: NotifyMessage);
}

pub trait RecoveryCoordinator: Send + Sync {
    /// The engine is in bad state and needs an external recovery.
    fn signal_recovery(&self, camera_id: u32);

    /// Collect platform debug data after a device error.
    fn dump_debug_data(&self, _camera_id: u32) {}
}

/// Recovery coordinator that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogOnlyRecovery;

impl RecoveryCoordinator for LogOnlyRecovery {
    fn signal_recovery(&self, camera_id: u32) {
        warn!("Camera {}: recovery requested but no coordinator is installed", camera_id);
    }
}

/// Context handle passed to the builder.
#[derive(Clone)]
pub struct EngineServices {
    pub executor: Arc<dyn PipelineExecutor>,
    pub sink: Arc<dyn ResultSink>,
    pub recovery: Arc<dyn RecoveryCoordinator>,
    /// Shared metadata pool. When absent the builder creates a private one.
    pub metadata: Option<Arc<MetadataPool>>,
}

impl EngineServices {
    pub fn new(executor: Arc<dyn PipelineExecutor>, sink: Arc<dyn ResultSink>) -> Self {
        Self {
            executor,
            sink,
            recovery: Arc::new(LogOnlyRecovery),
            metadata: None,
        }
    }

    pub fn with_recovery(mut self, recovery: Arc<dyn RecoveryCoordinator>) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn with_metadata_pool(mut self, pool: Arc<MetadataPool>) -> Self {
        self.metadata = Some(pool);
        self
    }
}
