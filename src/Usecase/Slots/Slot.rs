// Per-request state held in one entry of the slot table

use crate::Usecase::Structs::{CaptureRequest, NotifyMessage, StreamBuffer};

/// Lifecycle of one slot.
///
/// `Error` is a latch: only a table reset leaves it, and no notification is emitted for the
/// slot's frame while it is set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SlotState {
    #[default]
    Idle,
    /// Admitted, nothing returned yet.
    Occupied,
    /// Some buffers or metadata returned.
    PartiallyResolved,
    Error,
    /// Every buffer returned and metadata finished (final or errored).
    Resolved,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CompletionCounters {
    pub total_output: u32,
    pub pending_output: u32,
    pub buffer_errors: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetadataProgress {
    pub driver_partial: bool,
    pub chi_partial: bool,
    pub final_sent: bool,
    pub error_sent: bool,
}

impl MetadataProgress {
    pub fn any_sent(&self) -> bool {
        self.driver_partial || self.chi_partial || self.final_sent || self.error_sent
    }

    pub fn is_done(&self) -> bool {
        self.final_sent || self.error_sent
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MessageProgress {
    /// The frame still owes the caller a shutter.
    pub pending: bool,
    /// The shutter arrived and is held.
    pub available: bool,
    /// Snapshot frame, shutter may go out early.
    pub snapshot: bool,
}

#[derive(Clone, Default)]
pub struct RequestSlot {
    pub state: SlotState,
    pub internal_frame: u64,
    pub external_frame: u64,
    pub counters: CompletionCounters,
    pub metadata: MetadataProgress,
    pub message: MessageProgress,
    pub held_message: Option<NotifyMessage>,
    pub buffer_error_sent: bool,
    pub output_buffers: Vec<StreamBuffer>,
    pub input_buffer: Option<StreamBuffer>,
}

impl RequestSlot {
    /// Re-initializes the slot for a newly admitted request.
    pub(crate) fn occupy(&mut self, internal: u64, request: &CaptureRequest) {
        let outputs = request.output_buffers.len() as u32;
        *self = Self {
            state: SlotState::Occupied,
            internal_frame: internal,
            external_frame: request.frame_number,
            counters: CompletionCounters {
                total_output: outputs,
                pending_output: outputs,
                buffer_errors: 0,
            },
            metadata: MetadataProgress::default(),
            message: MessageProgress {
                pending: true,
                available: false,
                snapshot: request.is_snapshot(),
            },
            held_message: None,
            buffer_error_sent: false,
            output_buffers: request.output_buffers.clone(),
            input_buffer: request.input_buffer.clone(),
        };
    }

    pub(crate) fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn is_occupied(&self) -> bool {
        self.state != SlotState::Idle
    }

    pub fn in_error(&self) -> bool {
        self.state == SlotState::Error
    }

    /// Whether `internal` is the frame currently held by this slot.
    pub fn holds(&self, internal: u64) -> bool {
        self.is_occupied() && self.internal_frame == internal
    }

    pub fn has_pending_buffers(&self) -> bool {
        self.counters.pending_output > 0
    }

    pub fn all_buffers_returned(&self) -> bool {
        self.counters.pending_output == 0
    }

    /// Every output buffer either failed or was returned after a buffer error.
    pub fn no_more_valid_buffers(&self) -> bool {
        self.buffer_error_sent
            && (self.all_buffers_returned()
                || self.counters.buffer_errors == self.counters.total_output)
    }

    /// Nothing more can be delivered for this frame. A metadata error alone does not count
    /// while good buffers are still owed a shutter.
    pub fn is_terminally_errored(&self) -> bool {
        self.in_error() || (self.no_more_valid_buffers() && self.metadata.error_sent)
    }

    /// Counts towards advancing the result cursor.
    pub fn is_settled(&self) -> bool {
        matches!(self.state, SlotState::Error | SlotState::Resolved)
    }

    /// Latches the error state. Returns false if it was already latched.
    pub(crate) fn latch_error(&mut self) -> bool {
        if self.in_error() {
            return false;
        }
        self.state = SlotState::Error;
        self.message.pending = false;
        self.message.available = false;
        self.held_message = None;
        true
    }

    /// Recomputes the non-error state from counters and progress flags.
    pub(crate) fn refresh_state(&mut self) {
        if matches!(self.state, SlotState::Idle | SlotState::Error) {
            return;
        }
        self.state = if self.all_buffers_returned() && self.metadata.is_done() {
            SlotState::Resolved
        } else if self.counters.pending_output < self.counters.total_output
            || self.metadata.any_sent()
        {
            SlotState::PartiallyResolved
        } else {
            SlotState::Occupied
        };
    }

    /// Takes every output buffer that has not been handed back yet.
    pub(crate) fn take_outstanding(&mut self) -> Vec<StreamBuffer> {
        let mut taken = Vec::new();
        for buffer in self.output_buffers.iter_mut().filter(|b| b.is_outstanding()) {
            taken.push(buffer.clone());
            buffer.handle = None;
        }
        self.counters.pending_output = 0;
        taken
    }

    /// Marks the buffer of `stream` as handed back. Returns the descriptor as stored.
    pub(crate) fn return_stream(&mut self, stream: u32) -> Option<StreamBuffer> {
        let buffer = self
            .output_buffers
            .iter_mut()
            .find(|b| b.stream == stream && b.is_outstanding())?;
        let stored = buffer.clone();
        buffer.handle = None;
        Some(stored)
    }

    pub fn has_stream(&self, stream: u32) -> bool {
        self.output_buffers.iter().any(|b| b.stream == stream)
    }
}
