use std::fmt;
use std::io;

use crate::Core::metadata::{ClientId, MetadataHandle, MetadataPool, OutputMetadata};
use crate::Core::MetadataStore;
use crate::Usecase::engine::CaptureEngine;
use crate::Usecase::Slots::{FrameSlotTable, RequestSlot};

/// Debug function for MetadataPool
///
/// Shows the table size and reuse policy. Per-buffer detail goes through
/// `MetadataPool::print_all_buffers`, which takes the client locks.
pub fn debug_metadata_pool(pool: &MetadataPool, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MetadataPool")
        .field("clients", &pool.client_count())
        .field("reuse", &pool.reuse_enabled())
        .field("pipeline_id", &pool.pipeline_id())
        .finish_non_exhaustive()
}

pub fn debug_client_id(id: &ClientId, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "ClientId({:#x}: index {} sub {})", id.raw(), id.index(), id.sub())
}

pub fn debug_metadata_handle(handle: &MetadataHandle, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MetadataHandle")
        .field("client", &handle.client())
        .field("index", &handle.index())
        .field("generation", &handle.generation())
        .finish()
}

pub fn debug_output_metadata(metadata: &OutputMetadata, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("OutputMetadata")
        .field("sparse", &metadata.is_sparse())
        .field("pooled", &metadata.is_pooled())
        .field("tags", &metadata.count())
        .finish()
}

/// Debug function for RequestSlot
///
/// Buffer descriptors are summarized as `stream:handle` pairs, returned ones shown as `-`.
pub fn debug_request_slot(slot: &RequestSlot, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RequestSlot")
        .field("state", &slot.state)
        .field("internal", &slot.internal_frame)
        .field("external", &slot.external_frame)
        .field("counters", &slot.counters)
        .field("metadata", &slot.metadata)
        .field("message", &slot.message)
        .field("buffers", &format_args!("{}", buffer_summary(slot)))
        .finish()
}

pub fn debug_slot_table(table: &FrameSlotTable, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("FrameSlotTable")
        .field("capacity", &table.capacity())
        .field("occupied", &table.occupied_frames().len())
        .field("counters", table.counters())
        .finish()
}

pub fn debug_capture_engine(engine: &CaptureEngine, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CaptureEngine")
        .field("camera_id", &engine.config().camera_id)
        .field("scheme", &engine.scheme())
        .field("bad_state", &engine.is_bad_state())
        .field("flush", &engine.flush_status())
        .field("submitted", &engine.submitted())
        .finish_non_exhaustive()
}

/// Text snapshot of the slot table, newest frame first.
pub fn dump_slot_table(table: &FrameSlotTable, out: &mut dyn io::Write) -> io::Result<()> {
    let counters = table.counters();
    writeln!(
        out,
        "slots={} next_internal={} next_result={:?} next_message={:?} last_request={:?} last_metadata={:?}",
        table.capacity(),
        counters.next_internal,
        counters.next_app_result_frame,
        counters.next_app_message_frame,
        counters.last_app_request_frame,
        counters.last_result_metadata_frame
    )?;

    for internal in table.occupied_frames().into_iter().rev() {
        let Some(slot) = table.lookup(internal) else {
            continue;
        };
        writeln!(
            out,
            "  frame {:>6} (internal {:>6}) {:<17} pending {}/{} buffer_errors {} \
             meta[drv={} chi={} final={} err={}] msg[pending={} avail={} snap={}] {}",
            slot.external_frame,
            slot.internal_frame,
            format!("{:?}", slot.state),
            slot.counters.pending_output,
            slot.counters.total_output,
            slot.counters.buffer_errors,
            slot.metadata.driver_partial as u8,
            slot.metadata.chi_partial as u8,
            slot.metadata.final_sent as u8,
            slot.metadata.error_sent as u8,
            slot.message.pending as u8,
            slot.message.available as u8,
            slot.message.snapshot as u8,
            buffer_summary(slot)
        )?;
    }
    Ok(())
}

fn buffer_summary(slot: &RequestSlot) -> String {
    let outputs: Vec<String> = slot
        .output_buffers
        .iter()
        .map(|b| match b.handle {
            Some(handle) => format!("{}:{:#x}", b.stream, handle),
            None => format!("{}:-", b.stream),
        })
        .collect();
    format!("[{}]", outputs.join(" "))
}
