use super::*;

/// Read-only accessors used by diagnostics and tests.
impl MetadataPool {
    /// Whether eviction is allowed when a client is full.
    pub fn reuse_enabled(&self) -> bool {
        self.reuse
    }

    /// Last pipeline id assigned to any sub-client.
    pub fn pipeline_id(&self) -> Option<u32> {
        *self.pipeline_id.lock()
    }

    /// Number of table entries, including the reserved index 0.
    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Allocated buffers of the client (rented or free).
    pub fn buffer_count(&self, id: ClientId) -> EngineResult<usize> {
        Ok(self.client(id)?.lock().holders.len())
    }

    pub fn free_count(&self, id: ClientId) -> EngineResult<usize> {
        Ok(self.client(id)?.lock().free_list.len())
    }

    pub fn capacity(&self, id: ClientId) -> EngineResult<usize> {
        Ok(self.client(id)?.lock().capacity)
    }

    pub fn kind(&self, id: ClientId) -> EngineResult<ClientKind> {
        Ok(self.client(id)?.lock().kind)
    }

    pub fn tags(&self, id: ClientId) -> EngineResult<Vec<TagId>> {
        Ok(self.client(id)?.lock().tags.iter().copied().collect())
    }

    pub fn sub_pipeline_id(&self, id: ClientId) -> EngineResult<u32> {
        let entry = self.client(id)?;
        let client = entry.lock();
        client
            .sub_clients
            .get(id.sub() as usize)
            .filter(|sub| sub.used)
            .map(|sub| sub.pipeline_id)
            .ok_or(EngineError::InvalidClient(id.raw()))
    }

    /// Current reference count of a rented buffer.
    pub fn reference_count(&self, handle: &MetadataHandle) -> EngineResult<u32> {
        let entry = self.client(handle.client)?;
        let mut client = entry.lock();
        Ok(Self::checked(&mut client, handle)?.store.reference_count())
    }

    /// Frame number stamped on a rented buffer.
    pub fn frame_number(&self, handle: &MetadataHandle) -> EngineResult<u64> {
        let entry = self.client(handle.client)?;
        let mut client = entry.lock();
        Ok(Self::checked(&mut client, handle)?.frame_number)
    }

    /// Whether `handle` still names the current rental of its buffer.
    pub fn is_live(&self, handle: &MetadataHandle) -> bool {
        match self.client(handle.client) {
            Ok(entry) => Self::checked(&mut entry.lock(), handle).is_ok(),
            Err(_) => false,
        }
    }
}
