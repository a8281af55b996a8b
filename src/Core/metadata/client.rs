use std::collections::BTreeSet;

use super::store::{MetadataStore, TagId};
use super::{ClientId, ClientKind, MetadataFactory, MAX_SHARED_BUFFERS, MAX_SUB_CLIENTS};

/// One arena entry of a client.
pub(crate) struct MetaHolder {
    pub(crate) store: Box<dyn MetadataStore>,
    pub(crate) is_free: bool,
    pub(crate) owner: ClientId,
    /// `index | sub << 3`, stamped on every rental
    pub(crate) stamp: u32,
    pub(crate) frame_number: u64,
    pub(crate) touched_ns: u64,
    pub(crate) generation: u32,
}

impl MetaHolder {
    pub(crate) fn new(store: Box<dyn MetadataStore>, owner: ClientId) -> Self {
        Self {
            store,
            is_free: true,
            owner,
            stamp: 0,
            frame_number: 0,
            touched_ns: 0,
            generation: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct SubClient {
    pub(crate) used: bool,
    pub(crate) pipeline_id: u32,
}

/// Per-client state. Guarded by its own mutex inside the pool.
pub(crate) struct MetaClient {
    pub(crate) index: u32,
    pub(crate) kind: ClientKind,
    pub(crate) used: bool,
    pub(crate) tags: BTreeSet<TagId>,
    pub(crate) partial_tags: BTreeSet<TagId>,
    pub(crate) capacity: usize,
    pub(crate) holders: Vec<MetaHolder>,
    /// Indices of holders with `is_free` set. Lowest index is handed out first.
    pub(crate) free_list: BTreeSet<u32>,
    pub(crate) sub_clients: [SubClient; MAX_SUB_CLIENTS],
}

impl MetaClient {
    pub(crate) fn new(index: u32, kind: ClientKind) -> Self {
        Self {
            index,
            kind,
            used: false,
            tags: BTreeSet::new(),
            partial_tags: BTreeSet::new(),
            capacity: 0,
            holders: Vec::new(),
            free_list: BTreeSet::new(),
            sub_clients: [SubClient::default(); MAX_SUB_CLIENTS],
        }
    }

    pub(crate) fn free_sub_client(&self) -> Option<usize> {
        self.sub_clients.iter().position(|sub| !sub.used)
    }

    pub(crate) fn any_sub_used(&self) -> bool {
        self.sub_clients.iter().any(|sub| sub.used)
    }

    pub(crate) fn is_sub_used(&self, sub: u32) -> bool {
        self.sub_clients
            .get(sub as usize)
            .map(|s| s.used)
            .unwrap_or(false)
    }

    /// Appends one new (free) holder built with the client's tag set.
    pub(crate) fn grow(&mut self, factory: &MetadataFactory) -> u32 {
        let tags: Vec<TagId> = self.tags.iter().copied().collect();
        let index = self.holders.len() as u32;
        self.holders.push(MetaHolder::new(
            factory(&tags),
            ClientId::pack(self.index, 0),
        ));
        self.free_list.insert(index);
        index
    }

    /// Ensures at least `count` holders exist. Shared clients keep room to grow past them.
    pub(crate) fn reserve(&mut self, count: usize, factory: &MetadataFactory) {
        let limit = match self.kind {
            ClientKind::Exclusive => count,
            ClientKind::Shared => count.max(MAX_SHARED_BUFFERS),
        };
        self.capacity = self.capacity.max(limit);
        while self.holders.len() < count {
            self.grow(factory);
        }
    }

    /// Zero-ref holder that was never explicitly returned.
    pub(crate) fn reclaimable(&self) -> Option<u32> {
        self.holders
            .iter()
            .position(|h| !h.is_free && h.store.reference_count() == 0)
            .map(|index| index as u32)
    }

    pub(crate) fn mark_free(&mut self, index: u32) {
        if let Some(holder) = self.holders.get_mut(index as usize) {
            holder.is_free = true;
            self.free_list.insert(index);
        }
    }
}
