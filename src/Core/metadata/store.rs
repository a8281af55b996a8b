use std::collections::BTreeMap;

use crate::Core::error::EngineResult;

/// Identifier of a single metadata tag. Tag semantics belong to the platform, not the engine.
pub type TagId = u32;

/// Key-value tag store with a reference-counting contract.
///
/// The engine only moves tags around (merge, filter, copy); it never interprets values.
/// A store that has been invalidated reads as empty until it is `reset`.
pub trait MetadataStore: Send {
    fn get(&self, tag: TagId) -> Option<&[u8]>;
    fn set(&mut self, tag: TagId, value: &[u8]) -> EngineResult<()>;
    fn delete(&mut self, tag: TagId) -> bool;
    fn count(&self) -> usize;

    /// Iterates entries in ascending tag order.
    fn iter(&self) -> Box<dyn Iterator<Item = (TagId, &[u8])> + '_>;

    /// Clears all entries and makes the store valid again.
    fn reset(&mut self);

    /// Clears all entries and marks the content unreadable.
    fn invalidate(&mut self);
    fn is_valid(&self) -> bool;

    fn reference_count(&self) -> u32;
    fn add_reference(&mut self) -> u32;
    /// Saturates at zero.
    fn release_reference(&mut self) -> u32;
    fn release_all_references(&mut self);

    /// Copies every entry of `other` into `self`, overwriting duplicates.
    fn merge(&mut self, other: &dyn MetadataStore) -> EngineResult<()> {
        for (tag, value) in other.iter() {
            self.set(tag, value)?;
        }
        Ok(())
    }

    /// Copies only the entries of `self` whose tag is listed in `tags` into `dst`.
    fn filter_into(&self, tags: &[TagId], dst: &mut dyn MetadataStore) -> EngineResult<()> {
        for (tag, value) in self.iter() {
            if tags.contains(&tag) {
                dst.set(tag, value)?;
            }
        }
        Ok(())
    }
}

/// In-memory [`MetadataStore`] backend.
#[derive(Clone, Debug)]
pub struct TagBuffer {
    entries: BTreeMap<TagId, Vec<u8>>,
    references: u32,
    valid: bool,
}

impl Default for TagBuffer {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            references: 0,
            valid: true,
        }
    }
}

impl TagBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a buffer from `(tag, value)` pairs.
    pub fn from_entries<'a, I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (TagId, &'a [u8])>,
    {
        let mut buffer = Self::new();
        for (tag, value) in entries {
            buffer.entries.insert(tag, value.to_vec());
        }
        buffer
    }

    pub fn tags(&self) -> Vec<TagId> {
        self.entries.keys().copied().collect()
    }
}

impl MetadataStore for TagBuffer {
    fn get(&self, tag: TagId) -> Option<&[u8]> {
        if !self.valid {
            return None;
        }
        self.entries.get(&tag).map(Vec::as_slice)
    }

    fn set(&mut self, tag: TagId, value: &[u8]) -> EngineResult<()> {
        self.valid = true;
        self.entries.insert(tag, value.to_vec());
        Ok(())
    }

    fn delete(&mut self, tag: TagId) -> bool {
        self.entries.remove(&tag).is_some()
    }

    fn count(&self) -> usize {
        if self.valid {
            self.entries.len()
        } else {
            0
        }
    }

    fn iter(&self) -> Box<dyn Iterator<Item = (TagId, &[u8])> + '_> {
        if !self.valid {
            return Box::new(std::iter::empty());
        }
        Box::new(self.entries.iter().map(|(tag, value)| (*tag, value.as_slice())))
    }

    fn reset(&mut self) {
        self.entries.clear();
        self.valid = true;
    }

    fn invalidate(&mut self) {
        self.entries.clear();
        self.valid = false;
    }

    fn is_valid(&self) -> bool {
        self.valid
    }

    fn reference_count(&self) -> u32 {
        self.references
    }

    fn add_reference(&mut self) -> u32 {
        self.references += 1;
        self.references
    }

    fn release_reference(&mut self) -> u32 {
        self.references = self.references.saturating_sub(1);
        self.references
    }

    fn release_all_references(&mut self) {
        self.references = 0;
    }
}
