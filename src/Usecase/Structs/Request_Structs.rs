// Request, result and notification structures exchanged with the caller and the pipeline

use crate::Core::fence::{RawFence, INVALID_FENCE};
use crate::Core::metadata::{MetadataHandle, OutputMetadata, TagBuffer};

/// Identifier of a downstream pipeline session.
pub type SessionId = u32;

/// Identifier of a configured stream.
pub type StreamId = u32;

/// Role of a stream in the capture configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum StreamKind {
    #[default]
    Preview,
    Video,
    /// Still-capture output. A zero-shutter-lag request with one of these is a snapshot.
    Snapshot,
    /// Reprocess input.
    Input,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum BufferStatus {
    #[default]
    Ok,
    Error,
}

/// Caller-owned buffer descriptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamBuffer {
    pub stream: StreamId,
    pub kind: StreamKind,
    /// `None` once the buffer has been handed back to the caller.
    pub handle: Option<u64>,
    pub status: BufferStatus,
    pub acquire_fence: RawFence,
    pub release_fence: RawFence,
}

impl StreamBuffer {
    pub fn new(stream: StreamId, handle: u64) -> Self {
        Self {
            stream,
            kind: StreamKind::default(),
            handle: Some(handle),
            status: BufferStatus::Ok,
            acquire_fence: INVALID_FENCE,
            release_fence: INVALID_FENCE,
        }
    }

    pub fn with_kind(mut self, kind: StreamKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_acquire_fence(mut self, fence: RawFence) -> Self {
        self.acquire_fence = fence;
        self
    }

    pub fn with_status(mut self, status: BufferStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_outstanding(&self) -> bool {
        self.handle.is_some()
    }
}

/// Request as submitted by the caller. `frame_number` is the external numbering.
#[derive(Clone, Debug, Default)]
pub struct CaptureRequest {
    pub frame_number: u64,
    /// Opaque request settings.
    pub settings: Option<TagBuffer>,
    pub input_buffer: Option<StreamBuffer>,
    pub output_buffers: Vec<StreamBuffer>,
    /// Zero-shutter-lag capture hint.
    pub zsl: bool,
}

impl CaptureRequest {
    pub fn new(frame_number: u64) -> Self {
        Self {
            frame_number,
            ..Default::default()
        }
    }

    pub fn with_output(mut self, buffer: StreamBuffer) -> Self {
        self.output_buffers.push(buffer);
        self
    }

    pub fn with_input(mut self, buffer: StreamBuffer) -> Self {
        self.input_buffer = Some(buffer);
        self
    }

    pub fn with_settings(mut self, settings: TagBuffer) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn with_zsl(mut self, zsl: bool) -> Self {
        self.zsl = zsl;
        self
    }

    /// Snapshot requests may release their shutter ahead of earlier frames.
    pub fn is_snapshot(&self) -> bool {
        self.zsl
            && self
                .output_buffers
                .iter()
                .any(|b| b.kind == StreamKind::Snapshot)
    }
}

/// What the pipeline sees for one submission.
///
/// `request.frame_number` holds the internal number for the duration of the call.
pub struct PipelineRequest<'a> {
    pub request: &'a CaptureRequest,
    /// Request settings staged in the input metadata client, if one is configured.
    pub input_metadata: Option<MetadataHandle>,
}

impl PipelineRequest<'_> {
    pub fn frame_number(&self) -> u64 {
        self.request.frame_number
    }
}

/// Result coming back from the pipeline, in internal numbering.
///
/// The engine takes over the reference held by `metadata` and releases it once the content
/// has been copied out.
#[derive(Clone, Debug, Default)]
pub struct CaptureResult {
    pub frame_number: u64,
    pub output_buffers: Vec<StreamBuffer>,
    pub input_buffer: Option<StreamBuffer>,
    pub metadata: Option<MetadataHandle>,
    /// Partial-result ordinal, 1-based. 0 means no metadata.
    pub partial_result: u32,
}

impl CaptureResult {
    pub fn new(frame_number: u64) -> Self {
        Self {
            frame_number,
            ..Default::default()
        }
    }

    pub fn with_output(mut self, buffer: StreamBuffer) -> Self {
        self.output_buffers.push(buffer);
        self
    }

    pub fn with_input(mut self, buffer: StreamBuffer) -> Self {
        self.input_buffer = Some(buffer);
        self
    }

    pub fn with_metadata(mut self, handle: MetadataHandle, partial_result: u32) -> Self {
        self.metadata = Some(handle);
        self.partial_result = partial_result;
        self
    }
}

/// Result delivered to the caller, in external numbering.
pub struct FrameworkResult {
    pub frame_number: u64,
    pub output_buffers: Vec<StreamBuffer>,
    pub input_buffer: Option<StreamBuffer>,
    pub metadata: Option<OutputMetadata>,
    pub partial_result: u32,
}

impl FrameworkResult {
    /// Buffers handed back after an error, without metadata.
    pub fn is_buffer_return(&self) -> bool {
        self.metadata.is_none()
            && !self.output_buffers.is_empty()
            && self
                .output_buffers
                .iter()
                .all(|b| b.status == BufferStatus::Error)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Fatal for the session. Always forwarded.
    Device,
    /// Whole request failed before anything was delivered.
    Request,
    /// Metadata failed; buffers may still arrive.
    Result,
    /// One output stream failed.
    Buffer,
}

/// Notification delivered to the caller, in external numbering.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NotifyMessage {
    Shutter {
        frame_number: u64,
        timestamp_ns: u64,
    },
    Error {
        frame_number: u64,
        code: ErrorCode,
        stream: Option<StreamId>,
        /// The failed buffer, when the failure is reported by the pipeline for one stream.
        buffer: Option<StreamBuffer>,
    },
}

impl NotifyMessage {
    pub fn frame_number(&self) -> u64 {
        match self {
            Self::Shutter { frame_number, .. } | Self::Error { frame_number, .. } => *frame_number,
        }
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            Self::Error { code, .. } => Some(*code),
            Self::Shutter { .. } => None,
        }
    }

    pub(crate) fn error(frame_number: u64, code: ErrorCode, stream: Option<StreamId>) -> Self {
        Self::Error {
            frame_number,
            code,
            stream,
            buffer: None,
        }
    }
}

/// Notification coming back from the pipeline, in internal numbering.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PipelineMessage {
    Shutter {
        frame_number: u64,
        timestamp_ns: u64,
    },
    Error {
        frame_number: u64,
        code: ErrorCode,
        stream: Option<StreamId>,
    },
    /// The pipeline asks for an external recovery.
    TriggerRecovery,
}
