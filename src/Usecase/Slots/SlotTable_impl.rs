use log::{debug, warn};

use super::SlotTable::FrameSlotTable;
use crate::Usecase::error_path::ErrorPathHandler;
use crate::Usecase::outbox::Outbox;
use crate::Usecase::Structs::CaptureRequest;

impl FrameSlotTable {
    /// Admits a request and returns its internal frame number.
    ///
    /// The previous occupant of the target slot is resolved first: a frame that still owes
    /// buffers gets the request error path, a frame that only owes metadata gets a result
    /// error.
    pub(crate) fn admit(&mut self, request: &CaptureRequest, outbox: &mut Outbox) -> u64 {
        let internal = self.counters.next_internal;
        let index = self.index_of(internal);

        let occupant = &self.slots[index];
        if occupant.is_occupied() && !occupant.in_error() {
            let previous = occupant.internal_frame;
            if occupant.has_pending_buffers() {
                warn!(
                    "Frame {} overwritten with {} buffer(s) pending, cancelling it",
                    occupant.external_frame, occupant.counters.pending_output
                );
                ErrorPathHandler::new(self, outbox).request_error(previous);
            } else if !occupant.metadata.is_done() {
                warn!(
                    "Frame {} overwritten before final metadata, sending result error",
                    occupant.external_frame
                );
                ErrorPathHandler::new(self, outbox).result_error(previous);
            }
        }

        self.counters.next_internal += 1;
        if !self.counters.is_started() {
            self.counters.start_at(internal);
        }
        self.slots[index].occupy(internal, request);
        self.counters.last_app_request_frame = Some(internal);

        debug!(
            "Admitted frame {} as internal {} in slot {}",
            request.frame_number, internal, index
        );
        internal
    }

    /// Latches a frame into `Error` without notifying anyone.
    pub(crate) fn retire_silently(&mut self, internal: u64) {
        if let Some(slot) = self.lookup_mut(internal) {
            slot.take_outstanding();
            slot.input_buffer = None;
            slot.latch_error();
        }
        self.sweep_results();
    }

    /// Moves the result cursor over frames that are resolved or errored.
    pub(crate) fn sweep_results(&mut self) {
        let (Some(mut next), Some(last)) = (
            self.counters.next_app_result_frame,
            self.counters.last_app_request_frame,
        ) else {
            return;
        };

        while next <= last {
            if let Some(slot) = self.lookup(next) {
                if !slot.is_settled() {
                    break;
                }
            }
            self.counters.last_result_metadata_frame = Some(next);
            next += 1;
        }
        self.counters.next_app_result_frame = Some(next);
    }
}
