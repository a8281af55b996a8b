//! Request, result and buffer error emission.
//!
//! Every path goes through the slot's `Error` latch, so a frame gets at most one terminal
//! error notification no matter how many internal paths race to report it.

use log::{debug, error, info, warn};

use super::outbox::{ErroredReturn, Outbox};
use super::Slots::{FrameSlotTable, SlotState};
use super::Structs::{BufferStatus, ErrorCode, NotifyMessage, StreamId};

pub(crate) struct ErrorPathHandler<'a> {
    table: &'a mut FrameSlotTable,
    outbox: &'a mut Outbox,
}

impl<'a> ErrorPathHandler<'a> {
    pub(crate) fn new(table: &'a mut FrameSlotTable, outbox: &'a mut Outbox) -> Self {
        Self { table, outbox }
    }

    /// Fails the whole frame and hands its outstanding buffers back.
    ///
    /// Emits a request error when nothing has been delivered for the frame yet, otherwise a
    /// result error (unless metadata is already finished) plus one buffer error per
    /// outstanding stream. Returns false if the frame is untracked or already latched.
    pub(crate) fn request_error(&mut self, internal: u64) -> bool {
        let Some(slot) = self.table.lookup_mut(internal) else {
            debug!("Internal frame {} is no longer tracked, no error sent", internal);
            return false;
        };
        let external = slot.external_frame;
        if slot.in_error() {
            debug!("Frame {} already in error state, skipping notification", external);
            return false;
        }

        let nothing_delivered = !slot.metadata.any_sent()
            && !slot.buffer_error_sent
            && slot.counters.pending_output == slot.counters.total_output;

        if nothing_delivered {
            info!("Frame {}: request error", external);
            self.outbox
                .message(NotifyMessage::error(external, ErrorCode::Request, None));
        } else {
            if !slot.metadata.is_done() {
                info!("Frame {}: result error", external);
                self.outbox
                    .message(NotifyMessage::error(external, ErrorCode::Result, None));
                slot.metadata.error_sent = true;
            }
            for buffer in slot.output_buffers.iter().filter(|b| b.is_outstanding()) {
                info!("Frame {}: buffer error on stream {}", external, buffer.stream);
                self.outbox.message(NotifyMessage::error(
                    external,
                    ErrorCode::Buffer,
                    Some(buffer.stream),
                ));
                slot.buffer_error_sent = true;
            }
        }

        let outputs = slot.take_outstanding();
        let input = slot.input_buffer.take();
        slot.latch_error();
        self.outbox.errored(ErroredReturn {
            external_frame: external,
            outputs,
            input,
        });

        self.table.sweep_results();
        true
    }

    /// Metadata for the frame will never be produced. Buffers may still arrive.
    pub(crate) fn result_error(&mut self, internal: u64) -> bool {
        let Some(slot) = self.table.lookup_mut(internal) else {
            debug!("Internal frame {} is no longer tracked, no error sent", internal);
            return false;
        };
        if slot.in_error() || slot.metadata.is_done() {
            debug!(
                "Frame {}: metadata already finished, result error dropped",
                slot.external_frame
            );
            return false;
        }

        info!("Frame {}: result error", slot.external_frame);
        self.outbox.message(NotifyMessage::error(
            slot.external_frame,
            ErrorCode::Result,
            None,
        ));
        slot.metadata.error_sent = true;
        slot.refresh_state();
        self.table.sweep_results();
        true
    }

    /// The pipeline failed one stream. A stream that is not part of the request fails the
    /// whole request.
    pub(crate) fn buffer_error(&mut self, internal: u64, stream: StreamId) -> bool {
        let Some(slot) = self.table.lookup_mut(internal) else {
            warn!("Buffer error for untracked internal frame {}", internal);
            return false;
        };
        if !slot.has_stream(stream) {
            warn!(
                "Frame {}: buffer error names stream {} outside the request, failing the request",
                slot.external_frame, stream
            );
            return self.request_error(internal);
        }
        if slot.in_error() {
            debug!("Frame {} already in error state, skipping notification", slot.external_frame);
            return false;
        }

        let Some(mut buffer) = slot.return_stream(stream) else {
            debug!(
                "Frame {}: stream {} already returned, buffer error dropped",
                slot.external_frame, stream
            );
            return false;
        };
        buffer.status = BufferStatus::Error;

        slot.counters.pending_output = slot.counters.pending_output.saturating_sub(1);
        slot.counters.buffer_errors += 1;
        slot.buffer_error_sent = true;
        info!("Frame {}: buffer error on stream {}", slot.external_frame, stream);
        self.outbox.message(NotifyMessage::Error {
            frame_number: slot.external_frame,
            code: ErrorCode::Buffer,
            stream: Some(stream),
            buffer: Some(buffer),
        });
        slot.refresh_state();
        self.table.sweep_results();
        true
    }

    /// Forwards a device error. Never suppressed, not even by the latch.
    pub(crate) fn device_error(&mut self, internal: u64) -> bool {
        let external = match self.table.to_external(internal) {
            Some(external) => external,
            None => {
                warn!(
                    "Device error for untracked internal frame {}, forwarding as frame 0",
                    internal
                );
                0
            }
        };
        error!("Frame {}: device error", external);
        self.outbox
            .message(NotifyMessage::error(external, ErrorCode::Device, None));
        true
    }

    /// Errors every unresolved frame and resets the table.
    pub(crate) fn delete_all_pending(&mut self) -> usize {
        let mut errored = 0;
        for internal in self.table.occupied_frames() {
            let unresolved = self
                .table
                .lookup(internal)
                .map(|slot| !matches!(slot.state, SlotState::Error | SlotState::Resolved))
                .unwrap_or(false);
            if unresolved && self.request_error(internal) {
                errored += 1;
            }
        }
        self.table.reset();
        info!("Deleted pending results, {} frame(s) errored", errored);
        errored
    }

    /// Errors frames up to and including `target` that still hold buffers, and moves the
    /// cursors past `target`.
    pub(crate) fn flush_up_to(&mut self, target: u64) -> usize {
        let mut errored = 0;
        for internal in self.table.occupied_frames() {
            if internal > target {
                break;
            }
            let outstanding = self
                .table
                .lookup(internal)
                .map(|slot| !slot.in_error() && slot.has_pending_buffers())
                .unwrap_or(false);
            if outstanding && self.request_error(internal) {
                errored += 1;
            }
            if let Some(slot) = self.table.lookup_mut(internal) {
                slot.message.pending = false;
                slot.message.available = false;
                slot.held_message = None;
            }
        }

        let counters = &mut self.table.counters;
        let next = target + 1;
        counters.next_app_result_frame =
            Some(counters.next_app_result_frame.map_or(next, |n| n.max(next)));
        counters.next_app_message_frame =
            Some(counters.next_app_message_frame.map_or(next, |n| n.max(next)));
        counters.last_result_metadata_frame = Some(
            counters
                .last_result_metadata_frame
                .map_or(target, |last| last.max(target)),
        );
        info!("Flushed up to internal frame {}, {} frame(s) errored", target, errored);
        errored
    }
}
