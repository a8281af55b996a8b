// Fixed-size ring of in-flight request state, indexed by internal frame number

use super::Slot::RequestSlot;

/// Frame cursors. Everything except `next_internal` goes back to `None` on a flush.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameCounters {
    /// Next internal number to hand out. Never reset.
    pub next_internal: u64,
    /// Oldest frame whose results may still be delivered.
    pub next_app_result_frame: Option<u64>,
    /// Oldest frame whose shutter may still be delivered.
    pub next_app_message_frame: Option<u64>,
    pub last_app_request_frame: Option<u64>,
    pub last_result_metadata_frame: Option<u64>,
    pub last_app_message_frame_received: Option<u64>,
}

impl FrameCounters {
    /// Initializes the cursors on the first admission after construction or a flush.
    pub(crate) fn start_at(&mut self, internal: u64) {
        self.next_app_result_frame = Some(internal);
        self.next_app_message_frame = Some(internal);
        self.last_result_metadata_frame = internal.checked_sub(1);
        self.last_app_message_frame_received = None;
    }

    pub(crate) fn reset(&mut self) {
        *self = Self {
            next_internal: self.next_internal,
            ..Self::default()
        };
    }

    pub fn is_started(&self) -> bool {
        self.next_app_result_frame.is_some()
    }
}

pub struct FrameSlotTable {
    pub(crate) slots: Vec<RequestSlot>,
    pub(crate) counters: FrameCounters,
}

impl FrameSlotTable {
    /// Creates a table with `capacity` slots. A zero capacity is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: vec![RequestSlot::default(); capacity],
            counters: FrameCounters::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn counters(&self) -> &FrameCounters {
        &self.counters
    }

    pub fn index_of(&self, internal: u64) -> usize {
        (internal % self.slots.len() as u64) as usize
    }

    /// Slot for `internal`, whoever currently occupies it.
    pub fn slot(&self, internal: u64) -> &RequestSlot {
        &self.slots[self.index_of(internal)]
    }

    pub(crate) fn slot_mut(&mut self, internal: u64) -> &mut RequestSlot {
        let index = self.index_of(internal);
        &mut self.slots[index]
    }

    /// Slot for `internal` only if it still holds that frame.
    pub fn lookup(&self, internal: u64) -> Option<&RequestSlot> {
        let slot = self.slot(internal);
        slot.holds(internal).then_some(slot)
    }

    pub(crate) fn lookup_mut(&mut self, internal: u64) -> Option<&mut RequestSlot> {
        let slot = self.slot_mut(internal);
        if slot.holds(internal) {
            Some(slot)
        } else {
            None
        }
    }

    pub fn to_external(&self, internal: u64) -> Option<u64> {
        self.lookup(internal).map(|slot| slot.external_frame)
    }

    /// Newest tracked internal frame for an external number.
    pub fn to_internal(&self, external: u64) -> Option<u64> {
        self.slots
            .iter()
            .filter(|slot| slot.is_occupied() && slot.external_frame == external)
            .map(|slot| slot.internal_frame)
            .max()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RequestSlot> {
        self.slots.iter()
    }

    /// Occupied internal frames in ascending order.
    pub fn occupied_frames(&self) -> Vec<u64> {
        let mut frames: Vec<u64> = self
            .slots
            .iter()
            .filter(|slot| slot.is_occupied())
            .map(|slot| slot.internal_frame)
            .collect();
        frames.sort_unstable();
        frames
    }

    /// Returns every slot to `Idle` and every cursor to its initial marker.
    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            slot.clear();
        }
        self.counters.reset();
    }
}
