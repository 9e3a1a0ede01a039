// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Blocks of device memory and the regions carved out of them.

use crate::{
    device::DeviceMemory,
    layout::{DeviceAlignment, DeviceLayout},
    suballocator::{
        AllocationHandle, AllocationType, Suballocation, Suballocator, SuballocatorCreateInfo,
    },
    DeviceSize,
};
use ash::vk;
use log::{debug, trace};
use std::fmt;

/// Identifies a [`Block`] within its [`BlockCollection`].
///
/// IDs are handed out in increasing order and never reused within a collection.
///
/// [`BlockCollection`]: crate::collection::BlockCollection
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub(crate) u64);

impl BlockId {
    /// Returns the ID as an integer.
    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One contiguous allocation of [`DeviceMemory`], subdivided by a [`Suballocator`].
#[derive(Debug)]
pub struct Block<S> {
    id: BlockId,
    margin_size: DeviceSize,
    suballocator: S,
    device_memory: DeviceMemory,
}

impl<S: Suballocator> Block<S> {
    pub(crate) fn new(
        id: BlockId,
        device_memory: DeviceMemory,
        margin_size: DeviceSize,
        minimum_free_region_size: DeviceSize,
    ) -> Self {
        let suballocator = S::new(SuballocatorCreateInfo {
            size: device_memory.allocation_size(),
            margin_size,
            minimum_free_region_size,
            ..Default::default()
        });

        debug!(
            "created block {} of {} bytes in memory type {}",
            id,
            device_memory.allocation_size(),
            device_memory.memory_type_index(),
        );

        Block {
            id,
            margin_size,
            suballocator,
            device_memory,
        }
    }

    /// Returns the ID of the block.
    #[inline]
    pub fn id(&self) -> BlockId {
        self.id
    }

    /// Returns the size of the block in bytes.
    #[inline]
    pub fn size(&self) -> DeviceSize {
        self.device_memory.allocation_size()
    }

    /// Returns the padding that is reserved on both ends of every region of the block.
    #[inline]
    pub fn margin_size(&self) -> DeviceSize {
        self.margin_size
    }

    /// Returns the number of bytes that are not taken up by regions or their margins.
    #[inline]
    pub fn free_size(&self) -> DeviceSize {
        self.suballocator.free_size()
    }

    /// Returns `true` if no region of the block is live, in which case the block can be released.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.suballocator.is_empty()
    }

    /// Returns the device memory of the block.
    #[inline]
    pub fn device_memory(&self) -> &DeviceMemory {
        &self.device_memory
    }

    /// Returns the suballocator of the block.
    #[inline]
    pub fn suballocator(&self) -> &S {
        &self.suballocator
    }

    /// Tries to carve a region of the given layout out of the block. Returns `None` if the block
    /// has no free range that fits.
    pub(crate) fn try_allocate(
        &mut self,
        layout: DeviceLayout,
        allocation_type: AllocationType,
        buffer_image_granularity: DeviceAlignment,
    ) -> Option<Region> {
        let suballocation = self
            .suballocator
            .allocate(layout, allocation_type, buffer_image_granularity)
            .ok()?;

        trace!(
            "allocated region of {} bytes at offset {} in block {}",
            suballocation.size,
            suballocation.offset,
            self.id,
        );

        Some(Region {
            block_id: self.id,
            memory_type_index: self.device_memory.memory_type_index(),
            memory: self.device_memory.handle(),
            offset: suballocation.offset,
            size: suballocation.size,
            alignment: layout.alignment(),
            allocation_type,
            handle: suballocation.handle,
        })
    }

    /// Lets the suballocator tidy up its free ranges.
    pub(crate) fn cleanup(&mut self) {
        self.suballocator.cleanup();
    }

    /// Returns the region to the free space of the block.
    ///
    /// # Safety
    ///
    /// - `region` must have been allocated from `self`.
    pub(crate) unsafe fn free(&mut self, region: Region) {
        debug_assert_eq!(region.block_id, self.id);

        trace!(
            "freed region of {} bytes at offset {} in block {}",
            region.size,
            region.offset,
            self.id,
        );

        unsafe { self.suballocator.deallocate(region.into_suballocation()) };
    }
}

impl<S> Drop for Block<S> {
    fn drop(&mut self) {
        debug!(
            "destroyed block {} of {} bytes in memory type {}",
            self.id,
            self.device_memory.allocation_size(),
            self.device_memory.memory_type_index(),
        );
    }
}

/// A sub-range of a [`Block`] that backs exactly one resource.
///
/// A region can't be cloned, so that it can only be freed once. It stays allocated until it is
/// given back to the [`BlockCollection`] it came from.
///
/// [`BlockCollection`]: crate::collection::BlockCollection
#[derive(Debug, PartialEq, Eq)]
pub struct Region {
    block_id: BlockId,
    memory_type_index: u32,
    memory: vk::DeviceMemory,
    offset: DeviceSize,
    size: DeviceSize,
    alignment: DeviceAlignment,
    allocation_type: AllocationType,
    handle: AllocationHandle,
}

impl Region {
    /// Returns the ID of the block the region was allocated from.
    #[inline]
    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    /// Returns the index of the memory type of the region.
    #[inline]
    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    /// Returns the device memory that the region lives in.
    #[inline]
    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    /// Returns the offset of the region in bytes from the start of its block.
    #[inline]
    pub fn offset(&self) -> DeviceSize {
        self.offset
    }

    /// Returns the size of the region in bytes, not counting the margins.
    #[inline]
    pub fn size(&self) -> DeviceSize {
        self.size
    }

    /// Returns the alignment that the offset of the region satisfies.
    #[inline]
    pub fn alignment(&self) -> DeviceAlignment {
        self.alignment
    }

    /// Returns the type of resources that can be bound to the region.
    #[inline]
    pub fn allocation_type(&self) -> AllocationType {
        self.allocation_type
    }

    fn into_suballocation(self) -> Suballocation {
        Suballocation {
            offset: self.offset,
            size: self.size,
            allocation_type: self.allocation_type,
            handle: self.handle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{suballocator::FreeListAllocator, tests::MockDevice};

    #[test]
    fn round_trip() {
        let device = MockDevice::discrete();
        let device_memory = DeviceMemory::allocate(device.clone(), 1024, 1).unwrap();
        let handle = device_memory.handle();
        let mut block = Block::<FreeListAllocator>::new(BlockId(3), device_memory, 0, 0);

        let region = block
            .try_allocate(
                DeviceLayout::from_size_alignment(100, 16).unwrap(),
                AllocationType::Linear,
                DeviceAlignment::MIN,
            )
            .unwrap();
        assert_eq!(region.block_id(), BlockId(3));
        assert_eq!(region.memory_type_index(), 1);
        assert_eq!(region.memory(), handle);
        assert_eq!(region.offset(), 0);
        assert_eq!(region.size(), 100);
        assert_eq!(region.alignment().as_devicesize(), 16);
        assert!(!block.is_empty());
        assert_eq!(block.free_size(), 924);

        unsafe { block.free(region) };
        assert!(block.is_empty());
        assert_eq!(block.free_size(), block.size());

        drop(block);
        assert_eq!(device.live_memory_count(), 0);
    }

    #[test]
    fn no_fit_is_not_an_error() {
        let device = MockDevice::discrete();
        let device_memory = DeviceMemory::allocate(device, 1024, 0).unwrap();
        let mut block = Block::<FreeListAllocator>::new(BlockId(0), device_memory, 8, 0);
        let layout = DeviceLayout::from_size_alignment(600, 1).unwrap();

        let region = block
            .try_allocate(layout, AllocationType::Unknown, DeviceAlignment::MIN)
            .unwrap();
        assert_eq!(region.offset(), block.margin_size());
        assert!(block
            .try_allocate(layout, AllocationType::Unknown, DeviceAlignment::MIN)
            .is_none());

        unsafe { block.free(region) };
    }
}
