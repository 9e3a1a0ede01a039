// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Allocators for memory on the host, used to speed up the allocators for the device.

use std::num::NonZeroUsize;

/// Allocates nodes from a pool on the host instead of going to the global allocator for each of
/// them. Freed slots are recycled.
///
/// The allocator doesn't hand out pointers but rather IDs that are relative to the pool, so the
/// pool can be moved and grown freely.
#[derive(Debug)]
pub(super) struct PoolAllocator<T> {
    pool: Vec<T>,
    // Unsorted list of free slots.
    free_list: Vec<SlotId>,
}

impl<T> PoolAllocator<T> {
    pub fn new(capacity: usize) -> Self {
        PoolAllocator {
            pool: Vec::with_capacity(capacity),
            free_list: Vec::new(),
        }
    }

    /// Allocates a slot and initializes it with the provided value. Returns the ID of the slot.
    pub fn allocate(&mut self, val: T) -> SlotId {
        if let Some(id) = self.free_list.pop() {
            *self.get_mut(id) = val;

            id
        } else {
            self.pool.push(val);

            // `self.pool` is non-empty after the push.
            SlotId(NonZeroUsize::MIN.saturating_add(self.pool.len() - 1))
        }
    }

    /// Returns the slot with the given ID to the allocator to be reused. The ID must not be used
    /// again afterward.
    pub fn free(&mut self, id: SlotId) {
        debug_assert!(!self.free_list.contains(&id));

        self.free_list.push(id);
    }

    /// Returns a mutable reference to the slot with the given ID.
    pub fn get_mut(&mut self, id: SlotId) -> &mut T {
        debug_assert!(!self.free_list.contains(&id));

        &mut self.pool[id.0.get() - 1]
    }
}

impl<T: Copy> PoolAllocator<T> {
    /// Returns a copy of the slot with the given ID.
    pub fn get(&self, id: SlotId) -> T {
        debug_assert!(!self.free_list.contains(&id));

        self.pool[id.0.get() - 1]
    }
}

/// ID of a slot in the pool of the `host::PoolAllocator`. This is used to limit the visibility
/// of the actual ID to this `host` module.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct SlotId(NonZeroUsize);

impl SlotId {
    /// Recreates a `SlotId` from the value returned by [`SlotId::get`].
    ///
    /// # Safety
    ///
    /// - `index` must have been returned by `SlotId::get`.
    pub const unsafe fn new_unchecked(index: usize) -> Self {
        SlotId(unsafe { NonZeroUsize::new_unchecked(index) })
    }

    pub const fn get(self) -> usize {
        self.0.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_recycled() {
        let mut pool = PoolAllocator::new(2);

        let a = pool.allocate(1u32);
        let b = pool.allocate(2u32);
        assert_ne!(a, b);
        assert_eq!(pool.get(a), 1);
        assert_eq!(pool.get(b), 2);

        pool.free(a);

        let c = pool.allocate(3u32);
        assert_eq!(c, a);
        assert_eq!(pool.get(c), 3);

        *pool.get_mut(b) = 4;
        assert_eq!(pool.get(b), 4);
    }
}
