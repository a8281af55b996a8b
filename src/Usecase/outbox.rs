// Work collected while the slot table is borrowed, dispatched once the borrow is released

use std::time::Duration;

use log::{error, trace};

use crate::Core::fence::{fence_close, fence_wait, INVALID_FENCE};
use crate::Core::metadata::OutputMetadata;
use crate::Usecase::services::ResultSink;
use crate::Usecase::Structs::{BufferStatus, FrameworkResult, NotifyMessage, StreamBuffer};

pub(crate) enum Delivery {
    Result(FrameworkResult),
    Message(NotifyMessage),
}

/// Buffers of an errored frame that still have to go back to the caller.
pub(crate) struct ErroredReturn {
    pub(crate) external_frame: u64,
    pub(crate) outputs: Vec<StreamBuffer>,
    pub(crate) input: Option<StreamBuffer>,
}

#[derive(Default)]
pub(crate) struct Outbox {
    deliveries: Vec<Delivery>,
    errored: Vec<ErroredReturn>,
    discarded: Vec<OutputMetadata>,
}

impl Outbox {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn result(&mut self, result: FrameworkResult) {
        self.deliveries.push(Delivery::Result(result));
    }

    pub(crate) fn message(&mut self, message: NotifyMessage) {
        self.deliveries.push(Delivery::Message(message));
    }

    pub(crate) fn errored(&mut self, errored: ErroredReturn) {
        if errored.outputs.is_empty() && errored.input.is_none() {
            return;
        }
        self.errored.push(errored);
    }

    /// Output metadata that will not be delivered. Dropped after the slot lock is gone.
    pub(crate) fn discard(&mut self, metadata: Option<OutputMetadata>) {
        if let Some(metadata) = metadata {
            self.discarded.push(metadata);
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.deliveries.is_empty() && self.errored.is_empty() && self.discarded.is_empty()
    }

    /// Delivers notifications and results in collection order.
    ///
    /// Runs under the slot lock with the table borrow released, so the sink may call back
    /// into the engine from the same thread.
    pub(crate) fn dispatch(&mut self, sink: &dyn ResultSink) {
        for delivery in self.deliveries.drain(..) {
            match delivery {
                Delivery::Result(result) => {
                    trace!("Delivering result for frame {}", result.frame_number);
                    sink.deliver_result(result)
                }
                Delivery::Message(message) => {
                    trace!("Delivering {:?}", message);
                    sink.deliver_message(message)
                }
            }
        }
    }

    /// Returns errored buffers to the caller. Runs with no engine lock held.
    pub(crate) fn finish(mut self, sink: &dyn ResultSink, fence_timeout: Duration) {
        self.discarded.clear();

        for errored in self.errored.drain(..) {
            let mut outputs = errored.outputs;
            for buffer in &mut outputs {
                if let Err(e) = fence_wait(buffer.acquire_fence, fence_timeout) {
                    error!(
                        "Frame {}: acquire fence of stream {} failed: {}",
                        errored.external_frame, buffer.stream, e
                    );
                }
                fence_close(buffer.acquire_fence);
                buffer.acquire_fence = INVALID_FENCE;
                buffer.release_fence = INVALID_FENCE;
                buffer.status = BufferStatus::Error;
            }

            let input = errored.input.map(|mut input| {
                input.release_fence = INVALID_FENCE;
                input.status = BufferStatus::Error;
                input
            });

            sink.deliver_result(FrameworkResult {
                frame_number: errored.external_frame,
                output_buffers: outputs,
                input_buffer: input,
                metadata: None,
                partial_result: 0,
            });
        }
    }
}
