use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};

use log::warn;
use parking_lot::Mutex;

use super::store::{MetadataStore, TagBuffer};

struct OutputHolder {
    /// `None` while the buffer is lent out
    buffer: Option<TagBuffer>,
    sparse: bool,
}

pub(crate) struct OutputPoolInner {
    holders: Vec<OutputHolder>,
    capacity: usize,
    transient: u64,
}

/// Pool of caller-facing output metadata buffers, in its own lock domain.
///
/// Sparse buffers carry partial results, full buffers carry final results. When every
/// buffer is lent out a transient one is handed out instead.
#[derive(Clone)]
pub struct OutputMetadataPool {
    inner: Arc<Mutex<OutputPoolInner>>,
}

/// Output buffer on loan. Returns itself, reset, to the pool when dropped.
pub struct OutputMetadata {
    buffer: TagBuffer,
    slot: Option<usize>,
    sparse: bool,
    pool: Weak<Mutex<OutputPoolInner>>,
}

impl OutputMetadataPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(OutputPoolInner {
                holders: Vec::with_capacity(capacity),
                capacity,
                transient: 0,
            })),
        }
    }

    pub fn acquire(&self, sparse: bool) -> OutputMetadata {
        let mut inner = self.inner.lock();

        let free = inner
            .holders
            .iter()
            .position(|h| h.sparse == sparse && h.buffer.is_some());
        let slot = match free {
            Some(slot) => Some(slot),
            None if inner.holders.len() < inner.capacity => {
                inner.holders.push(OutputHolder {
                    buffer: Some(TagBuffer::new()),
                    sparse,
                });
                Some(inner.holders.len() - 1)
            }
            None => None,
        };

        let buffer = match slot {
            Some(slot) => inner.holders[slot].buffer.take().unwrap_or_default(),
            None => {
                inner.transient += 1;
                warn!(
                    "Output metadata pool exhausted ({} buffers), using a transient buffer",
                    inner.capacity
                );
                TagBuffer::new()
            }
        };

        OutputMetadata {
            buffer,
            slot,
            sparse,
            pool: Arc::downgrade(&self.inner),
        }
    }

    /// Buffers currently on loan, transient ones excluded.
    pub fn outstanding(&self) -> usize {
        self.inner
            .lock()
            .holders
            .iter()
            .filter(|h| h.buffer.is_none())
            .count()
    }

    pub fn allocated(&self) -> usize {
        self.inner.lock().holders.len()
    }

    pub fn transient_count(&self) -> u64 {
        self.inner.lock().transient
    }
}

impl OutputMetadata {
    pub fn is_sparse(&self) -> bool {
        self.sparse
    }

    pub fn is_pooled(&self) -> bool {
        self.slot.is_some()
    }

    /// Copy of the content, detached from the pool.
    pub fn to_tag_buffer(&self) -> TagBuffer {
        self.buffer.clone()
    }
}

impl Deref for OutputMetadata {
    type Target = TagBuffer;

    fn deref(&self) -> &TagBuffer {
        &self.buffer
    }
}

impl DerefMut for OutputMetadata {
    fn deref_mut(&mut self) -> &mut TagBuffer {
        &mut self.buffer
    }
}

impl Drop for OutputMetadata {
    fn drop(&mut self) {
        let (Some(slot), Some(pool)) = (self.slot, self.pool.upgrade()) else {
            return;
        };
        let mut buffer = std::mem::take(&mut self.buffer);
        buffer.reset();
        buffer.release_all_references();
        let mut inner = pool.lock();
        if let Some(holder) = inner.holders.get_mut(slot) {
            holder.buffer = Some(buffer);
        }
    }
}
