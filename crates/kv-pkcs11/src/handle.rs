//! Generation-tagged handle arena.
//!
//! A handle packs a slot index and the slot's generation:
//! `generation << 20 | (index + 1)`. Handles are never zero and fit in 31
//! bits, so they survive a 32-bit `CK_ULONG`. Removing an entry bumps the
//! generation of its slot, which makes stale handles miss instead of aliasing
//! a newer entry.

use cryptoki_sys::CK_ULONG;

const INDEX_BITS: u32 = 20;
const INDEX_MASK: CK_ULONG = (1 << INDEX_BITS) - 1;
const MAX_SLOTS: usize = INDEX_MASK as usize;
const MAX_GENERATION: u32 = (1 << (31 - INDEX_BITS)) - 1;

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

pub struct HandleArena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    len: usize,
}

impl<T> Default for HandleArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandleArena<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    fn encode(index: usize, generation: u32) -> CK_ULONG {
        ((generation as CK_ULONG) << INDEX_BITS) | (index as CK_ULONG + 1)
    }

    fn decode(handle: CK_ULONG) -> Option<(usize, u32)> {
        if handle > 0x7FFF_FFFF {
            return None;
        }
        let low = handle & INDEX_MASK;
        if low == 0 {
            return None;
        }
        Some(((low - 1) as usize, (handle >> INDEX_BITS) as u32))
    }

    /// Whether `count` more entries can be inserted.
    pub fn has_room(&self, count: usize) -> bool {
        self.free.len() + (MAX_SLOTS - self.slots.len()) >= count
    }

    /// Store `value` and return its handle, or `None` when every slot is
    /// taken or retired.
    pub fn insert(&mut self, value: T) -> Option<CK_ULONG> {
        let index = match self.free.pop() {
            Some(index) => index,
            None if self.slots.len() < MAX_SLOTS => {
                self.slots.push(Slot {
                    generation: 0,
                    value: None,
                });
                self.slots.len() - 1
            }
            None => return None,
        };
        let slot = &mut self.slots[index];
        slot.value = Some(value);
        self.len += 1;
        Some(Self::encode(index, slot.generation))
    }

    pub fn get(&self, handle: CK_ULONG) -> Option<&T> {
        let (index, generation) = Self::decode(handle)?;
        let slot = self.slots.get(index)?;
        if slot.generation != generation {
            return None;
        }
        slot.value.as_ref()
    }

    pub fn get_mut(&mut self, handle: CK_ULONG) -> Option<&mut T> {
        let (index, generation) = Self::decode(handle)?;
        let slot = self.slots.get_mut(index)?;
        if slot.generation != generation {
            return None;
        }
        slot.value.as_mut()
    }

    pub fn remove(&mut self, handle: CK_ULONG) -> Option<T> {
        let (index, generation) = Self::decode(handle)?;
        let slot = self.slots.get_mut(index)?;
        if slot.generation != generation {
            return None;
        }
        let value = slot.value.take()?;
        self.len -= 1;
        Self::release(&mut self.free, index, slot);
        Some(value)
    }

    fn release(free: &mut Vec<usize>, index: usize, slot: &mut Slot<T>) {
        // An exhausted slot is retired for good rather than wrapping back to
        // generation zero.
        if slot.generation < MAX_GENERATION {
            slot.generation += 1;
            free.push(index);
        }
    }

    /// Remove every entry. Handles issued so far all become stale.
    pub fn clear(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.value.take().is_some() {
                Self::release(&mut self.free, index, slot);
            }
        }
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().filter_map(|slot| slot.value.as_ref())
    }
}
