use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
// Use parking_lot's locks for better performance
use parking_lot::{Mutex, RwLock};

use crate::Core::error::{EngineError, EngineResult};

mod client;
mod debug;
mod eviction;
mod getters;
pub mod output;
pub mod store;

use client::MetaClient;
pub use output::{OutputMetadata, OutputMetadataPool};
pub use store::{MetadataStore, TagBuffer, TagId};

/// Upper bound of the client table. Index 0 is reserved.
pub const MAX_METADATA_CLIENTS: usize = 32;
/// Sub-clients per shared client.
pub const MAX_SUB_CLIENTS: usize = 16;
/// Growth limit of a shared client's buffer list.
pub const MAX_SHARED_BUFFERS: usize = 150;

lazy_static::lazy_static! {
    /// Process epoch for buffer touch timestamps.
    static ref POOL_EPOCH: Instant = Instant::now();
}

pub(crate) fn now_ns() -> u64 {
    POOL_EPOCH.elapsed().as_nanos() as u64
}

/// Builds the backing store for a new pool buffer from the client's tag set.
pub type MetadataFactory = Arc<dyn Fn(&[TagId]) -> Box<dyn MetadataStore> + Send + Sync>;

/// Packed client identifier: `sub << 16 | index`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u32);

impl ClientId {
    pub fn pack(index: u32, sub: u32) -> Self {
        Self((sub << 16) | (index & 0xFFFF))
    }

    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn index(self) -> u32 {
        self.0 & 0xFFFF
    }

    pub fn sub(self) -> u32 {
        self.0 >> 16
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientKind {
    /// Owns a private, fixed-capacity buffer list.
    Exclusive,
    /// Shares one growable buffer list with up to [`MAX_SUB_CLIENTS`] registrants.
    Shared,
}

/// Rental handle. Only valid while its generation matches the holder's.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct MetadataHandle {
    client: ClientId,
    index: u32,
    generation: u32,
}

impl MetadataHandle {
    pub fn client(&self) -> ClientId {
        self.client
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// Buffer that has been held longer than the tracking threshold.
#[derive(Clone, Debug)]
pub struct StaleBuffer {
    pub client: ClientId,
    pub index: u32,
    pub frame_number: u64,
    pub references: u32,
    pub held_for: Duration,
}

/// Reference-counted arena of reusable metadata buffers.
///
/// Each client has its own lock; the client table is behind a manager-wide `RwLock` that is
/// only taken for writing during registration.
pub struct MetadataPool {
    clients: RwLock<Vec<Arc<Mutex<MetaClient>>>>,
    factory: MetadataFactory,
    reuse: bool,
    pipeline_id: Mutex<Option<u32>>,
}

impl MetadataPool {
    /// Creates a pool backed by [`TagBuffer`].
    pub fn new(reuse: bool) -> Self {
        Self::with_factory(
            reuse,
            Arc::new(|_tags: &[TagId]| Box::new(TagBuffer::new()) as Box<dyn MetadataStore>),
        )
    }

    pub fn with_factory(reuse: bool, factory: MetadataFactory) -> Self {
        // Index 0 is reserved and never handed out
        let reserved = Arc::new(Mutex::new(MetaClient::new(0, ClientKind::Exclusive)));
        Self {
            clients: RwLock::new(vec![reserved]),
            factory,
            reuse,
            pipeline_id: Mutex::new(None),
        }
    }

    /// Registers a client and pre-allocates `buffer_count` buffers.
    ///
    /// Exclusive clients take a fresh table entry and are capped at `buffer_count`. Shared
    /// clients join the first shared entry with a free sub-client; tag sets are unioned, the
    /// list starts at the largest requested count and `get` grows it on demand up to
    /// [`MAX_SHARED_BUFFERS`].
    pub fn register_client(
        &self,
        kind: ClientKind,
        tags: &[TagId],
        partial_tags: &[TagId],
        buffer_count: usize,
    ) -> EngineResult<ClientId> {
        if buffer_count == 0 {
            return Err(EngineError::invalid_config(
                "buffer_count",
                "a metadata client needs at least one buffer",
            ));
        }

        let mut table = self.clients.write();

        if kind == ClientKind::Shared {
            for entry in table.iter().skip(1) {
                let mut client = entry.lock();
                if !client.used || client.kind != ClientKind::Shared {
                    continue;
                }
                if let Some(sub) = client.free_sub_client() {
                    client.sub_clients[sub].used = true;
                    client.tags.extend(tags.iter().copied());
                    client.partial_tags.extend(partial_tags.iter().copied());
                    client.reserve(buffer_count, &self.factory);
                    let id = ClientId::pack(client.index, sub as u32);
                    debug!(
                        "Registered shared sub-client {:#x} ({} buffers)",
                        id.raw(),
                        client.holders.len()
                    );
                    return Ok(id);
                }
            }
        }

        // Reuse an unregistered entry before growing the table
        let reusable = table
            .iter()
            .skip(1)
            .position(|entry| !entry.lock().used)
            .map(|pos| pos + 1);

        let slot = match reusable {
            Some(slot) => slot,
            None => {
                if table.len() >= MAX_METADATA_CLIENTS {
                    return Err(EngineError::invalid_config(
                        "metadata_clients",
                        format!("client table is full ({} entries)", MAX_METADATA_CLIENTS),
                    ));
                }
                let index = table.len() as u32;
                table.push(Arc::new(Mutex::new(MetaClient::new(index, kind))));
                index as usize
            }
        };

        let mut client = table[slot].lock();
        client.kind = kind;
        client.used = true;
        client.sub_clients = Default::default();
        client.sub_clients[0].used = true;
        client.tags = tags.iter().copied().collect();
        client.partial_tags = partial_tags.iter().copied().collect();
        client.capacity = 0;
        client.reserve(buffer_count, &self.factory);

        let id = ClientId::pack(client.index, 0);
        info!(
            "Registered {:?} metadata client {:#x} ({} buffers, {} tags)",
            kind,
            id.raw(),
            client.holders.len(),
            client.tags.len()
        );
        Ok(id)
    }

    /// Disables a client or sub-client. Its buffers stay allocated for later registrants.
    pub fn unregister_client(&self, id: ClientId) -> EngineResult<()> {
        let entry = self.client(id)?;
        let mut client = entry.lock();
        if !client.used || !client.is_sub_used(id.sub()) {
            return Err(EngineError::InvalidClient(id.raw()));
        }
        client.sub_clients[id.sub() as usize].used = false;
        if !client.any_sub_used() {
            client.used = false;
        }
        debug!("Unregistered metadata client {:#x}", id.raw());
        Ok(())
    }

    /// Rents a buffer for `frame_number`. The returned buffer is empty and holds one reference.
    pub fn get(&self, id: ClientId, frame_number: u64) -> EngineResult<MetadataHandle> {
        let entry = self.client(id)?;
        let mut client = entry.lock();
        if !client.used || !client.is_sub_used(id.sub()) {
            return Err(EngineError::InvalidClient(id.raw()));
        }

        let index = if let Some(index) = client.free_list.pop_first() {
            index
        } else if let Some(index) = client.reclaimable() {
            debug!(
                "Reclaiming unreferenced buffer {} of client {:#x}",
                index,
                id.raw()
            );
            index
        } else if client.holders.len() < client.capacity {
            let index = client.grow(&self.factory);
            client.free_list.remove(&index);
            index
        } else if self.reuse {
            let victim = eviction::select_eviction_victim(&client.holders).ok_or(
                EngineError::PoolExhausted {
                    client: id.raw(),
                    capacity: client.capacity,
                },
            )?;
            let holder = &mut client.holders[victim];
            warn!(
                "Evicting metadata buffer {} of client {:#x} (frame {}, {} refs)",
                victim,
                id.raw(),
                holder.frame_number,
                holder.store.reference_count()
            );
            holder.store.release_all_references();
            holder.store.invalidate();
            victim as u32
        } else {
            return Err(EngineError::PoolExhausted {
                client: id.raw(),
                capacity: client.capacity,
            });
        };

        let holder = &mut client.holders[index as usize];
        holder.is_free = false;
        holder.generation = holder.generation.wrapping_add(1);
        holder.owner = id;
        holder.stamp = id.index() | (id.sub() << 3);
        holder.frame_number = frame_number;
        holder.store.reset();
        holder.store.add_reference();
        holder.touched_ns = now_ns();

        Ok(MetadataHandle {
            client: id,
            index,
            generation: holder.generation,
        })
    }

    /// Drops one reference. Content is invalidated immediately; the buffer is freed at zero.
    pub fn release(&self, handle: &MetadataHandle) -> EngineResult<()> {
        let entry = self.client(handle.client)?;
        let mut client = entry.lock();
        let holder = Self::checked(&mut client, handle)?;

        let remaining = holder.store.release_reference();
        holder.store.invalidate();
        holder.touched_ns = now_ns();
        if remaining == 0 {
            client.mark_free(handle.index);
        }
        Ok(())
    }

    pub fn add_reference(&self, handle: &MetadataHandle) -> EngineResult<u32> {
        let entry = self.client(handle.client)?;
        let mut client = entry.lock();
        let holder = Self::checked(&mut client, handle)?;
        holder.touched_ns = now_ns();
        Ok(holder.store.add_reference())
    }

    /// Runs `f` on the buffer content. Fails once the content has been invalidated.
    pub fn with_buffer<R>(
        &self,
        handle: &MetadataHandle,
        f: impl FnOnce(&dyn MetadataStore) -> R,
    ) -> EngineResult<R> {
        let entry = self.client(handle.client)?;
        let mut client = entry.lock();
        let holder = Self::checked(&mut client, handle)?;
        if !holder.store.is_valid() {
            return Err(EngineError::InvalidMetadata {
                client: handle.client.raw(),
                index: handle.index,
            });
        }
        Ok(f(&*holder.store))
    }

    pub fn with_buffer_mut<R>(
        &self,
        handle: &MetadataHandle,
        f: impl FnOnce(&mut dyn MetadataStore) -> R,
    ) -> EngineResult<R> {
        let entry = self.client(handle.client)?;
        let mut client = entry.lock();
        let holder = Self::checked(&mut client, handle)?;
        if !holder.store.is_valid() {
            return Err(EngineError::InvalidMetadata {
                client: handle.client.raw(),
                index: handle.index,
            });
        }
        holder.touched_ns = now_ns();
        Ok(f(&mut *holder.store))
    }

    /// Drops all references on every buffer of every client.
    pub fn flush(&self) {
        let table = self.clients.read();
        let mut released = 0usize;
        for entry in table.iter() {
            let mut client = entry.lock();
            for index in 0..client.holders.len() {
                let holder = &mut client.holders[index];
                if !holder.is_free {
                    released += 1;
                }
                holder.store.release_all_references();
                holder.store.invalidate();
                client.mark_free(index as u32);
            }
        }
        info!("Metadata pool flushed ({} buffers released)", released);
    }

    pub fn set_pipeline_id(&self, id: ClientId, pipeline_id: u32) -> EngineResult<()> {
        let entry = self.client(id)?;
        let mut client = entry.lock();
        if !client.is_sub_used(id.sub()) {
            return Err(EngineError::InvalidClient(id.raw()));
        }
        client.sub_clients[id.sub() as usize].pipeline_id = pipeline_id;
        *self.pipeline_id.lock() = Some(pipeline_id);
        Ok(())
    }

    pub fn partial_tags(&self, id: ClientId) -> EngineResult<Vec<TagId>> {
        let entry = self.client(id)?;
        let client = entry.lock();
        Ok(client.partial_tags.iter().copied().collect())
    }

    /// Lists rented buffers that have not been touched for at least `max_hold`.
    pub fn track_stale(&self, max_hold: Duration) -> Vec<StaleBuffer> {
        let now = now_ns();
        let threshold = max_hold.as_nanos() as u64;
        let table = self.clients.read();
        let mut stale = Vec::new();
        for entry in table.iter() {
            let client = entry.lock();
            for (index, holder) in client.holders.iter().enumerate() {
                let held = now.saturating_sub(holder.touched_ns);
                if !holder.is_free && held >= threshold {
                    debug!(
                        "Buffer {} of client {:#x} held for {:?} (frame {}, {} refs)",
                        index,
                        holder.owner.raw(),
                        Duration::from_nanos(held),
                        holder.frame_number,
                        holder.store.reference_count()
                    );
                    stale.push(StaleBuffer {
                        client: holder.owner,
                        index: index as u32,
                        frame_number: holder.frame_number,
                        references: holder.store.reference_count(),
                        held_for: Duration::from_nanos(held),
                    });
                }
            }
        }
        stale
    }

    /// Logs and returns one line per buffer of the client.
    pub fn print_all_buffers(&self, id: ClientId) -> EngineResult<String> {
        let entry = self.client(id)?;
        let client = entry.lock();
        let mut out = format!(
            "client {:#x} kind={:?} used={} capacity={} free={}\n",
            id.raw(),
            client.kind,
            client.used,
            client.capacity,
            client.free_list.len()
        );
        for (index, holder) in client.holders.iter().enumerate() {
            out.push_str(&format!(
                "  [{:>3}] free={} refs={} frame={} stamp={:#x} gen={} valid={} tags={}\n",
                index,
                holder.is_free,
                holder.store.reference_count(),
                holder.frame_number,
                holder.stamp,
                holder.generation,
                holder.store.is_valid(),
                holder.store.count()
            ));
        }
        info!("{}", out.trim_end());
        Ok(out)
    }

    fn client(&self, id: ClientId) -> EngineResult<Arc<Mutex<MetaClient>>> {
        let index = id.index() as usize;
        if index == 0 || id.sub() as usize >= MAX_SUB_CLIENTS {
            return Err(EngineError::InvalidClient(id.raw()));
        }
        self.clients
            .read()
            .get(index)
            .cloned()
            .ok_or(EngineError::InvalidClient(id.raw()))
    }

    fn checked<'a>(
        client: &'a mut MetaClient,
        handle: &MetadataHandle,
    ) -> EngineResult<&'a mut client::MetaHolder> {
        let stale = EngineError::StaleHandle {
            client: handle.client.raw(),
            index: handle.index,
            generation: handle.generation,
        };
        match client.holders.get_mut(handle.index as usize) {
            Some(holder) if !holder.is_free && holder.generation == handle.generation => {
                Ok(holder)
            }
            _ => Err(stale),
        }
    }
}

impl Default for MetadataPool {
    fn default() -> Self {
        Self::new(true)
    }
}
