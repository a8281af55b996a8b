//! Partial/final metadata completion, buffer-return accounting and shutter ordering.

use log::{debug, error, trace, warn};

use super::builder::PartialMetaSupport;
use super::outbox::Outbox;
use super::Slots::{FrameSlotTable, MetadataProgress};
use super::Structs::{CaptureResult, FrameworkResult, NotifyMessage};
use crate::Core::metadata::OutputMetadata;

/// Which metadata a partial-result ordinal carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PartialStage {
    DriverPartial,
    /// Partial produced by the override layer itself.
    ChiPartial,
    Final,
}

/// Fixed ordinal-to-stage mapping for 1, 2 or 3 metadata results per frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartialScheme {
    stages: u32,
    support: PartialMetaSupport,
}

impl PartialScheme {
    /// `stages` is clamped to 1..=3.
    pub fn new(stages: u32, support: PartialMetaSupport) -> Self {
        Self {
            stages: stages.clamp(1, 3),
            support,
        }
    }

    pub fn stage_count(&self) -> u32 {
        self.stages
    }

    pub fn support(&self) -> PartialMetaSupport {
        self.support
    }

    /// Ordinal 0, or one beyond the stage count, carries no metadata.
    pub fn stage_of(&self, ordinal: u32) -> Option<PartialStage> {
        use PartialStage::*;
        match (self.stages, ordinal) {
            (1, 1) => Some(Final),
            (2, 1) if self.support == PartialMetaSupport::Separate => Some(ChiPartial),
            (2, 1) => Some(DriverPartial),
            (2, 2) => Some(Final),
            (3, 1) => Some(ChiPartial),
            (3, 2) => Some(DriverPartial),
            (3, 3) => Some(Final),
            _ => None,
        }
    }

    pub fn ordinal_of(&self, stage: PartialStage) -> Option<u32> {
        (1..=self.stages).find(|&ordinal| self.stage_of(ordinal) == Some(stage))
    }

    pub fn has_sent(progress: &MetadataProgress, stage: PartialStage) -> bool {
        match stage {
            PartialStage::DriverPartial => progress.driver_partial,
            PartialStage::ChiPartial => progress.chi_partial,
            PartialStage::Final => progress.final_sent,
        }
    }

    /// A stage may go out if final is not sent, the stage itself is not sent and no
    /// metadata error was reported.
    pub fn can_send(&self, progress: &MetadataProgress, stage: PartialStage) -> bool {
        if progress.error_sent || progress.final_sent {
            return false;
        }
        !Self::has_sent(progress, stage)
    }

    /// Records `stage` as sent. Final backfills every earlier stage of the scheme, even the
    /// ones that never arrived.
    pub fn mark_sent(&self, progress: &mut MetadataProgress, stage: PartialStage) {
        let combined = self.support == PartialMetaSupport::Combined;
        match stage {
            PartialStage::ChiPartial => progress.chi_partial = true,
            PartialStage::DriverPartial => {
                progress.driver_partial = true;
                if self.stages == 2 && combined {
                    progress.chi_partial = true;
                }
            }
            PartialStage::Final => {
                match self.stages {
                    2 if self.support == PartialMetaSupport::Separate => {
                        progress.chi_partial = true;
                    }
                    2 => {
                        progress.driver_partial = true;
                        if combined {
                            progress.chi_partial = true;
                        }
                    }
                    3 => {
                        progress.driver_partial = true;
                        progress.chi_partial = true;
                    }
                    _ => {}
                }
                progress.final_sent = true;
            }
        }
    }
}

/// Metadata already copied out of the pool, ready to hand to the caller.
pub(crate) struct TranslatedMetadata {
    pub(crate) stage: PartialStage,
    pub(crate) output: OutputMetadata,
}

pub(crate) struct ResultReconciler<'a> {
    table: &'a mut FrameSlotTable,
    outbox: &'a mut Outbox,
    scheme: PartialScheme,
}

impl<'a> ResultReconciler<'a> {
    pub(crate) fn new(
        table: &'a mut FrameSlotTable,
        outbox: &'a mut Outbox,
        scheme: PartialScheme,
    ) -> Self {
        Self {
            table,
            outbox,
            scheme,
        }
    }

    pub(crate) fn on_result(&mut self, result: CaptureResult, metadata: Option<TranslatedMetadata>) {
        let frame = result.frame_number;
        let scheme = self.scheme;

        let Some(slot) = self.table.lookup_mut(frame) else {
            error!("Result for internal frame {} matches no tracked request", frame);
            self.outbox.discard(metadata.map(|m| m.output));
            return;
        };
        let external = slot.external_frame;

        if slot.in_error() {
            debug!("Frame {}: request already errored, dropping late result", external);
            self.outbox.discard(metadata.map(|m| m.output));
            return;
        }

        let returned = result.output_buffers.len() as u32;
        if returned > slot.counters.pending_output {
            error!(
                "Frame {}: result returns {} buffer(s) but only {} outstanding, rejecting it",
                external, returned, slot.counters.pending_output
            );
            self.outbox.discard(metadata.map(|m| m.output));
            return;
        }

        slot.counters.pending_output -= returned;
        for buffer in &result.output_buffers {
            if slot.return_stream(buffer.stream).is_none() {
                warn!(
                    "Frame {}: returned stream {} was not outstanding",
                    external, buffer.stream
                );
            }
        }

        let mut has_new_data = returned > 0;
        if result.input_buffer.is_some() {
            slot.input_buffer = None;
            has_new_data = true;
        }

        let mut delivered = None;
        let mut partial_result = 0;
        if let Some(metadata) = metadata {
            if slot.metadata.final_sent {
                if has_new_data {
                    error!(
                        "Frame {}: {:?} metadata after final, dropping it from a result with buffers",
                        external, metadata.stage
                    );
                } else {
                    warn!(
                        "Frame {}: {:?} metadata after final, suppressed",
                        external, metadata.stage
                    );
                }
                self.outbox.discard(Some(metadata.output));
            } else if scheme.can_send(&slot.metadata, metadata.stage) {
                scheme.mark_sent(&mut slot.metadata, metadata.stage);
                partial_result = result.partial_result;
                delivered = Some(metadata.output);
                has_new_data = true;
            } else {
                debug!(
                    "Frame {}: {:?} metadata already sent or errored, dropping it",
                    external, metadata.stage
                );
                self.outbox.discard(Some(metadata.output));
            }
        }

        slot.refresh_state();

        // Only a frame with nothing left to report drops an empty result
        let result_can_be_sent =
            !(slot.all_buffers_returned() && slot.metadata.is_done() && !has_new_data);

        if result_can_be_sent {
            trace!(
                "Frame {}: delivering {} buffer(s), partial {}",
                external,
                returned,
                partial_result
            );
            self.outbox.result(FrameworkResult {
                frame_number: external,
                output_buffers: result.output_buffers,
                input_buffer: result.input_buffer,
                metadata: delivered,
                partial_result,
            });
        } else {
            warn!(
                "Frame {}: result carries nothing new for a finished frame, suppressed",
                external
            );
        }

        self.table.sweep_results();
        self.release_messages();
    }

    /// Holds a shutter until every earlier frame has had its own.
    pub(crate) fn on_shutter(&mut self, internal: u64, timestamp_ns: u64) {
        if self.table.counters.next_app_message_frame.is_none() {
            warn!("Shutter for internal frame {} before any request, dropped", internal);
            return;
        }
        let Some(slot) = self.table.lookup_mut(internal) else {
            warn!("Shutter for untracked internal frame {}, dropped", internal);
            return;
        };
        if slot.in_error() || !slot.message.pending {
            debug!("Frame {}: shutter not needed, dropped", slot.external_frame);
            return;
        }

        slot.held_message = Some(NotifyMessage::Shutter {
            frame_number: slot.external_frame,
            timestamp_ns,
        });
        slot.message.available = true;

        let received = &mut self.table.counters.last_app_message_frame_received;
        *received = Some(received.map_or(internal, |last| last.max(internal)));

        self.release_messages();
    }

    /// Sends held shutters in frame order. A frame is skipped once its shutter is out or it
    /// can no longer produce one.
    pub(crate) fn release_messages(&mut self) {
        let (Some(mut next), Some(last)) = (
            self.table.counters.next_app_message_frame,
            self.table.counters.last_app_request_frame,
        ) else {
            return;
        };

        while next <= last {
            let Some(slot) = self.table.lookup_mut(next) else {
                // overwritten
                next += 1;
                continue;
            };
            if !slot.message.pending {
                next += 1;
            } else if slot.message.available {
                if let Some(message) = slot.held_message.take() {
                    self.outbox.message(message);
                }
                slot.message.pending = false;
                slot.message.available = false;
                next += 1;
            } else if slot.is_terminally_errored() {
                slot.message.pending = false;
                next += 1;
            } else {
                break;
            }
        }
        self.table.counters.next_app_message_frame = Some(next);

        // Snapshot shutters go out as soon as they arrive
        let Some(received) = self.table.counters.last_app_message_frame_received else {
            return;
        };
        for frame in next..=received {
            if let Some(slot) = self.table.lookup_mut(frame) {
                if slot.message.snapshot && slot.message.pending && slot.message.available {
                    if let Some(message) = slot.held_message.take() {
                        self.outbox.message(message);
                    }
                    slot.message.pending = false;
                    slot.message.available = false;
                }
            }
        }
    }
}
