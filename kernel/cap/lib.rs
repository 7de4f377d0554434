//! Nidus object space.
//!
//! The object space maps capability identifiers to kernel objects. Syscalls
//! that operate on another protection domain (cell creation, habitat
//! updates) name their target by CapId; the dispatch layer resolves the id
//! here and downcasts to the expected object kind.
//!
//! # Design
//!
//! 1. **Generation counters**: each slot carries a generation that is
//!    incremented on revocation, so a CapId held across a revoke can never
//!    reach the recycled slot's new occupant.
//!
//! 2. **Rights model**: capabilities carry explicit rights that can only be
//!    reduced during delegation; the syscall layer checks `CTRL` before any
//!    control operation.

#![no_std]

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

pub mod types;

pub use types::{CapError, CapId, CapRights, KernelObject};

/// Default slot reservation when the space is created.
pub const DEFAULT_CAP_SLOTS: usize = 64;

/// Maximum slots (bounded by the 16-bit index field of CapId).
pub const MAX_CAP_SLOTS: usize = 65535;

// ============================================================================
// Object Space
// ============================================================================

/// A capability entry: the object plus the rights this CapId conveys.
#[derive(Clone)]
pub struct CapEntry {
    pub object: Arc<dyn KernelObject>,
    pub rights: CapRights,
}

/// Slot ties an entry to its generation counter.
struct CapSlot {
    generation: u64,
    entry: Option<CapEntry>,
}

/// The object space: a growable slot table behind a spinlock.
pub struct ObjectSpace {
    inner: Mutex<SpaceInner>,
}

struct SpaceInner {
    slots: Vec<CapSlot>,
    free: Vec<u16>,
    /// Monotonic; starts at 1 because generation 0 means INVALID.
    next_generation: u64,
}

impl ObjectSpace {
    /// Create an empty object space.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SpaceInner {
                slots: Vec::with_capacity(DEFAULT_CAP_SLOTS),
                free: Vec::new(),
                next_generation: 1,
            }),
        }
    }

    /// Install an object, returning the CapId that names it.
    pub fn insert(
        &self,
        object: Arc<dyn KernelObject>,
        rights: CapRights,
    ) -> Result<CapId, CapError> {
        let mut inner = self.inner.lock();
        let generation = inner.next_generation;
        inner.next_generation += 1;

        let entry = CapEntry { object, rights };
        let index = match inner.free.pop() {
            Some(index) => {
                let slot = &mut inner.slots[index as usize];
                slot.generation = generation;
                slot.entry = Some(entry);
                index
            }
            None => {
                if inner.slots.len() >= MAX_CAP_SLOTS {
                    return Err(CapError::TableFull);
                }
                inner.slots.push(CapSlot {
                    generation,
                    entry: Some(entry),
                });
                (inner.slots.len() - 1) as u16
            }
        };
        Ok(CapId::from_parts(index, generation))
    }

    /// Resolve a CapId to its entry.
    ///
    /// Fails if the id was never allocated, has been revoked, or carries a
    /// stale generation.
    pub fn lookup(&self, id: CapId) -> Result<CapEntry, CapError> {
        if !id.is_valid() {
            return Err(CapError::InvalidCapId);
        }
        let inner = self.inner.lock();
        let slot = inner
            .slots
            .get(id.index() as usize)
            .ok_or(CapError::InvalidCapId)?;
        if slot.generation != id.generation() {
            return Err(CapError::InvalidCapId);
        }
        slot.entry.clone().ok_or(CapError::InvalidCapId)
    }

    /// Resolve a CapId, additionally requiring `required` rights.
    pub fn lookup_with_rights(
        &self,
        id: CapId,
        required: CapRights,
    ) -> Result<CapEntry, CapError> {
        let entry = self.lookup(id)?;
        if !entry.rights.contains(required) {
            return Err(CapError::InsufficientRights);
        }
        Ok(entry)
    }

    /// Revoke a capability. The slot returns to the free list with a bumped
    /// generation so the old CapId is dead forever.
    pub fn revoke(&self, id: CapId) -> Result<(), CapError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let slot = inner
            .slots
            .get_mut(id.index() as usize)
            .ok_or(CapError::InvalidCapId)?;
        if slot.generation != id.generation() || slot.entry.is_none() {
            return Err(CapError::InvalidCapId);
        }
        slot.entry = None;
        slot.generation = 0;
        inner.free.push(id.index());
        Ok(())
    }

    /// Derive a new capability for the same object with reduced rights.
    ///
    /// The resulting rights are the intersection of the source rights and
    /// `mask`; rights are never amplified.
    pub fn delegate(&self, id: CapId, mask: CapRights) -> Result<CapId, CapError> {
        let entry = self.lookup(id)?;
        if !entry.rights.contains(CapRights::GRANT) {
            return Err(CapError::InsufficientRights);
        }
        self.insert(entry.object, entry.rights & mask)
    }
}

impl Default for ObjectSpace {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static::lazy_static! {
    /// The global object space shared by all protection domains.
    static ref OBJ_SPACE: ObjectSpace = ObjectSpace::new();
}

/// Access the global object space.
pub fn space() -> &'static ObjectSpace {
    &OBJ_SPACE
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::any::Any;

    struct Dummy(u32);

    impl KernelObject for Dummy {
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn type_name(&self) -> &'static str {
            "Dummy"
        }
    }

    #[test]
    fn test_insert_lookup_roundtrip() {
        let space = ObjectSpace::new();
        let id = space.insert(Arc::new(Dummy(9)), CapRights::ALL).unwrap();
        let entry = space.lookup(id).unwrap();
        let obj = entry.object.as_any().downcast_ref::<Dummy>().unwrap();
        assert_eq!(obj.0, 9);
    }

    #[test]
    fn test_stale_generation_rejected() {
        let space = ObjectSpace::new();
        let id = space.insert(Arc::new(Dummy(1)), CapRights::ALL).unwrap();
        space.revoke(id).unwrap();
        assert!(matches!(space.lookup(id), Err(CapError::InvalidCapId)));
    }

    #[test]
    fn test_slot_reuse_gets_new_generation() {
        let space = ObjectSpace::new();
        let first = space.insert(Arc::new(Dummy(1)), CapRights::ALL).unwrap();
        space.revoke(first).unwrap();
        let second = space.insert(Arc::new(Dummy(2)), CapRights::ALL).unwrap();
        assert_eq!(first.index(), second.index());
        assert_ne!(first.generation(), second.generation());
        assert!(space.lookup(first).is_err());
        assert!(space.lookup(second).is_ok());
    }

    #[test]
    fn test_rights_check() {
        let space = ObjectSpace::new();
        let id = space.insert(Arc::new(Dummy(1)), CapRights::READ).unwrap();
        assert!(space.lookup_with_rights(id, CapRights::READ).is_ok());
        assert!(matches!(
            space.lookup_with_rights(id, CapRights::CTRL),
            Err(CapError::InsufficientRights)
        ));
    }

    #[test]
    fn test_delegate_reduces_rights() {
        let space = ObjectSpace::new();
        let id = space.insert(Arc::new(Dummy(1)), CapRights::ALL).unwrap();
        let derived = space.delegate(id, CapRights::READ).unwrap();
        let entry = space.lookup(derived).unwrap();
        assert_eq!(entry.rights, CapRights::READ);
    }
}
