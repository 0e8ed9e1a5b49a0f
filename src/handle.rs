//! Generation-checked handle arena
//!
//! A handle packs a slot index (low 16 bits, offset by one so zero is never a
//! valid handle) and the slot generation (high 16 bits). Freeing a slot bumps its
//! generation, so a stale handle is detected in O(1) and never aliases the next
//! occupant of the slot.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier of an open session or service flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Handle(u32);

impl Handle {
    /// Rebuild a handle from its raw value (e.g. received over a transport)
    pub fn from_raw(raw: u32) -> Self {
        Handle(raw)
    }

    /// Raw numeric value
    pub fn raw(&self) -> u32 {
        self.0
    }

    fn new(index: usize, generation: u16) -> Self {
        Handle(((generation as u32) << 16) | (index as u32 + 1))
    }

    fn index(&self) -> Option<usize> {
        let low = self.0 & 0xFFFF;
        if low == 0 {
            None
        } else {
            Some(low as usize - 1)
        }
    }

    fn generation(&self) -> u16 {
        (self.0 >> 16) as u16
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

struct Slot<T> {
    generation: u16,
    value: Option<T>,
}

/// Arena of slots addressed by `Handle`
pub struct HandleTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    capacity: usize,
    live: usize,
}

impl<T> HandleTable<T> {
    /// Create a table holding at most `capacity` live entries (capped at 65535)
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            capacity: capacity.min(u16::MAX as usize),
            live: 0,
        }
    }

    /// Store a value and return its handle, `None` when the table is full
    pub fn insert(&mut self, value: T) -> Option<Handle> {
        if self.live >= self.capacity {
            return None;
        }
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot { generation: 0, value: None });
                self.slots.len() - 1
            }
        };
        let slot = &mut self.slots[index];
        slot.value = Some(value);
        self.live += 1;
        Some(Handle::new(index, slot.generation))
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        let slot = self.slots.get(handle.index()?)?;
        if slot.generation != handle.generation() {
            return None;
        }
        slot.value.as_ref()
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        let slot = self.slots.get_mut(handle.index()?)?;
        if slot.generation != handle.generation() {
            return None;
        }
        slot.value.as_mut()
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_some()
    }

    /// Free a slot, invalidating every copy of `handle`
    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        let index = handle.index()?;
        let slot = self.slots.get_mut(index)?;
        if slot.generation != handle.generation() {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);
        self.live -= 1;
        Some(value)
    }

    /// Handles of every live entry
    pub fn handles(&self) -> Vec<Handle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.value.is_some())
            .map(|(index, slot)| Handle::new(index, slot.generation))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}
