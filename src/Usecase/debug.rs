use super::engine::CaptureEngine;
use super::Slots::{FrameSlotTable, RequestSlot};
use std::fmt;

// Debug proxy implementations that call the standalone debug functions
impl fmt::Debug for CaptureEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        crate::Debug::StructDebug::debug_capture_engine(self, f)
    }
}

impl fmt::Debug for RequestSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        crate::Debug::StructDebug::debug_request_slot(self, f)
    }
}

impl fmt::Debug for FrameSlotTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        crate::Debug::StructDebug::debug_slot_table(self, f)
    }
}
