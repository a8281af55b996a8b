//! Error types for the capture override engine.

use std::io;

/// Result alias used throughout the engine.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Engine-level failures. Frame-level dispositions (request/result/buffer errors) are not
/// errors of the engine; they are notifications sent to the caller.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The pipeline did not accept a submission in time. The engine is now in bad state.
    #[error("submission of internal frame {frame} timed out")]
    SubmissionTimeout { frame: u64 },

    /// The pipeline rejected a submission outright.
    #[error("pipeline rejected frame {frame}: {message}")]
    Pipeline { frame: u64, message: String },

    /// No free, reclaimable, growable or evictable metadata buffer.
    #[error("metadata client {client:#x} exhausted ({capacity} buffers, reuse disabled)")]
    PoolExhausted { client: u32, capacity: usize },

    /// The packed client id does not name a registered client/sub-client.
    #[error("invalid metadata client id {0:#x}")]
    InvalidClient(u32),

    /// The handle refers to a buffer that was evicted or flushed since it was rented.
    #[error("stale metadata handle: client {client:#x} index {index} generation {generation}")]
    StaleHandle {
        client: u32,
        index: u32,
        generation: u32,
    },

    /// The buffer content was invalidated by a release.
    #[error("metadata buffer {index} of client {client:#x} has been invalidated")]
    InvalidMetadata { client: u32, index: u32 },

    /// Flush after teardown began.
    #[error("flush rejected: engine has already been torn down")]
    AlreadyFlushed,

    /// Parallel flush did not finish after the bounded wait and its single retry.
    #[error("flush of {outstanding} session(s) did not complete in time")]
    FlushTimeout { outstanding: usize },

    /// A native fence did not signal within the bounded timeout.
    #[error("fence {fd} did not signal within {timeout_ms} ms")]
    FenceTimeout { fd: i32, timeout_ms: u64 },

    /// Diagnostic access could not take the slot-map lock.
    #[error("slot map is busy")]
    Busy,

    /// The external frame number is not present in the slot table.
    #[error("frame {0} is not tracked")]
    UnknownFrame(u64),

    /// Invalid engine configuration.
    #[error("invalid configuration: {parameter} - {message}")]
    InvalidConfig { parameter: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl EngineError {
    pub fn invalid_config(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            parameter: parameter.into(),
            message: message.into(),
        }
    }

    /// Whether this error poisons the whole engine rather than a single frame.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::SubmissionTimeout { .. } | Self::AlreadyFlushed)
    }
}

/// Error reported by a [`PipelineExecutor`](crate::Usecase::PipelineExecutor).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    /// The downstream session did not accept the request in time.
    #[error("timed out")]
    Timeout,

    /// The session is flushing and dropped the request.
    #[error("cancelled by flush")]
    Cancelled,

    #[error("{0}")]
    Failed(String),
}
