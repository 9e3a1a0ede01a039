// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! All blocks of one memory type.
//!
//! A [`BlockCollection`] searches its blocks for room in creation order, creates a new block when
//! none of them fits a request, and releases blocks that become empty as long as that keeps the
//! configured minimum number of blocks around. Everything happens under one lock per collection,
//! so that two threads never both create a block for the same shortfall.

use crate::{
    allocator::{MemoryAllocatePreference, MemoryAllocatorError},
    block::{Block, BlockId, Region},
    device::{DeviceMemory, DeviceProperties, MemoryType, RawDevice},
    layout::{checked_align_up, DeviceAlignment, DeviceLayout},
    suballocator::{AllocationType, FreeListAllocator, Suballocator},
    DeviceSize, NonExhaustive,
};
use ash::vk;
use log::warn;
use parking_lot::Mutex;
use std::{cmp, sync::Arc};

/// The granularity that block sizes are rounded up to when a request doesn't fit the preferred
/// block size.
const BLOCK_SIZE_GRANULARITY: DeviceAlignment = match DeviceAlignment::new(64 * 1024) {
    Some(alignment) => alignment,
    None => unreachable!(),
};

/// The blocks of one memory type.
#[derive(Debug)]
pub struct BlockCollection<S = FreeListAllocator> {
    device: Arc<dyn RawDevice>,
    memory_type_index: u32,
    memory_type: MemoryType,
    buffer_image_granularity: DeviceAlignment,
    // Regions of host-visible memory that isn't host-coherent are aligned to this.
    atom_size: DeviceAlignment,
    block_minimum_size: DeviceSize,
    block_preferred_size: DeviceSize,
    block_margin_size: DeviceSize,
    minimum_free_region_size: DeviceSize,
    minimum_block_count: usize,
    maximum_block_count: usize,
    state: Mutex<BlockCollectionState<S>>,
}

#[derive(Debug)]
struct BlockCollectionState<S> {
    // Sorted by ID, which is the order of creation.
    blocks: Vec<Block<S>>,
    next_block_id: u64,
}

impl<S: Suballocator> BlockCollection<S> {
    /// Creates a new `BlockCollection` for the memory type `memory_type_index` of `device`, and
    /// allocates the minimum number of blocks.
    ///
    /// # Panics
    ///
    /// - Panics if `memory_type_index` is not less than the number of memory types of the device.
    /// - Panics if `create_info` is not valid.
    pub fn new(
        device: Arc<dyn RawDevice>,
        memory_type_index: u32,
        create_info: BlockCollectionCreateInfo,
    ) -> Result<Self, MemoryAllocatorError> {
        let memory_type = device
            .memory_properties()
            .memory_types
            .get(memory_type_index as usize)
            .copied()
            .unwrap_or_else(|| panic!("memory type {} doesn't exist", memory_type_index));
        let properties = device.properties();

        Self::with_memory_type(
            device,
            memory_type_index,
            memory_type,
            &properties,
            create_info,
        )
    }

    pub(crate) fn with_memory_type(
        device: Arc<dyn RawDevice>,
        memory_type_index: u32,
        memory_type: MemoryType,
        properties: &DeviceProperties,
        create_info: BlockCollectionCreateInfo,
    ) -> Result<Self, MemoryAllocatorError> {
        create_info.validate();

        let BlockCollectionCreateInfo {
            block_minimum_size,
            block_preferred_size,
            block_margin_size,
            minimum_free_region_size,
            minimum_block_count,
            maximum_block_count,
            _ne: _,
        } = create_info;

        let buffer_image_granularity = DeviceAlignment::new(properties.buffer_image_granularity)
            .unwrap_or(DeviceAlignment::MIN);

        let property_flags = memory_type.property_flags;
        let atom_size = if property_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
            && !property_flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT)
        {
            DeviceAlignment::new(properties.non_coherent_atom_size).unwrap_or(DeviceAlignment::MIN)
        } else {
            DeviceAlignment::MIN
        };

        let collection = BlockCollection {
            device,
            memory_type_index,
            memory_type,
            buffer_image_granularity,
            atom_size,
            block_minimum_size,
            block_preferred_size,
            block_margin_size,
            minimum_free_region_size,
            minimum_block_count,
            maximum_block_count,
            state: Mutex::new(BlockCollectionState {
                blocks: Vec::with_capacity(minimum_block_count),
                next_block_id: 0,
            }),
        };

        {
            let mut state = collection.state.lock();
            let block_size = collection.base_block_size();

            for _ in 0..minimum_block_count {
                let block = collection.create_block(&mut state, block_size)?;
                state.blocks.push(block);
            }
        }

        Ok(collection)
    }

    /// Returns the index of the memory type of the collection.
    #[inline]
    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    /// Returns the memory type of the collection.
    #[inline]
    pub fn memory_type(&self) -> &MemoryType {
        &self.memory_type
    }

    /// Returns the size of blocks that are created for requests that fit in them.
    #[inline]
    pub fn block_preferred_size(&self) -> DeviceSize {
        cmp::max(self.block_minimum_size, self.block_preferred_size)
    }

    /// Returns the number of blocks that currently exist.
    #[inline]
    pub fn block_count(&self) -> usize {
        self.state.lock().blocks.len()
    }

    /// Allocates a region of the given layout.
    ///
    /// The blocks are searched in the order they were created. If none of them has room, a new
    /// block is created unless `allocate_preference` forbids it or the maximum number of blocks
    /// is reached. With [`MemoryAllocatePreference::AlwaysAllocate`] the existing blocks are
    /// skipped and a block of exactly the required size is created.
    ///
    /// # Errors
    ///
    /// - Returns [`OutOfPoolMemory`] if no block has room and no block can be created.
    /// - Returns [`AllocateDeviceMemory`] if the driver failed to allocate a new block.
    /// - Returns [`BlockSizeExceeded`] if the layout with its margins can't fit in any block.
    ///
    /// [`OutOfPoolMemory`]: MemoryAllocatorError::OutOfPoolMemory
    /// [`AllocateDeviceMemory`]: MemoryAllocatorError::AllocateDeviceMemory
    /// [`BlockSizeExceeded`]: MemoryAllocatorError::BlockSizeExceeded
    pub fn try_allocate(
        &self,
        layout: DeviceLayout,
        allocation_type: AllocationType,
        allocate_preference: MemoryAllocatePreference,
    ) -> Result<Region, MemoryAllocatorError> {
        let layout = layout
            .align_to(self.atom_size)
            .ok_or(MemoryAllocatorError::BlockSizeExceeded)?;
        let mut state = self.state.lock();

        if allocate_preference != MemoryAllocatePreference::AlwaysAllocate {
            for block in &mut state.blocks {
                if let Some(region) =
                    block.try_allocate(layout, allocation_type, self.buffer_image_granularity)
                {
                    return Ok(region);
                }
            }
        }

        if allocate_preference == MemoryAllocatePreference::NeverAllocate
            || state.blocks.len() >= self.maximum_block_count
        {
            return Err(MemoryAllocatorError::OutOfPoolMemory);
        }

        let block_size = self.new_block_size(layout, allocate_preference)?;
        let mut block = self.create_block(&mut state, block_size)?;

        // The block is sized for the request and doesn't have any neighbors to conflict with, so
        // this only fails if the suballocator can't honor its own layouts.
        let region = block
            .try_allocate(layout, allocation_type, self.buffer_image_granularity)
            .ok_or(MemoryAllocatorError::BlockSizeExceeded)?;
        state.blocks.push(block);

        Ok(region)
    }

    /// Returns a region to the free space of its block. If that leaves the block empty and there
    /// are more blocks than the minimum, the block is released.
    ///
    /// # Safety
    ///
    /// - Nothing that is bound to the region may be in use by the device anymore.
    ///
    /// # Panics
    ///
    /// - Panics if `region` was not allocated from `self`.
    pub unsafe fn free(&self, region: Region) {
        assert_eq!(
            region.memory_type_index(),
            self.memory_type_index,
            "the region was allocated from a different memory type",
        );

        let mut state = self.state.lock();
        let index = match state
            .blocks
            .binary_search_by_key(&region.block_id(), Block::id)
        {
            Ok(index) => index,
            Err(_) => panic!(
                "block {} doesn't exist in the collection of memory type {}",
                region.block_id(),
                self.memory_type_index,
            ),
        };

        let block = &mut state.blocks[index];
        assert_eq!(
            region.memory(),
            block.device_memory().handle(),
            "the region was allocated from a different collection",
        );

        // SAFETY: The region belongs to this block, and it can't have been freed before because
        // regions can't be cloned.
        unsafe { block.free(region) };

        if block.is_empty() && state.blocks.len() > self.minimum_block_count {
            state.blocks.remove(index);
        }
    }

    /// Gives the suballocator of every block a chance to tidy up. Regions stay where they are.
    pub fn cleanup(&self) {
        for block in &mut self.state.lock().blocks {
            block.cleanup();
        }
    }

    /// Returns the number of blocks, the total size of the blocks and the total size that is
    /// taken up by regions and their margins, in one consistent snapshot.
    pub(crate) fn totals(&self) -> (usize, DeviceSize, DeviceSize) {
        let state = self.state.lock();

        state
            .blocks
            .iter()
            .fold((0, 0, 0), |(count, block_size, allocated_size), block| {
                (
                    count + 1,
                    block_size + block.size(),
                    allocated_size + (block.size() - block.free_size()),
                )
            })
    }

    fn base_block_size(&self) -> DeviceSize {
        cmp::max(self.block_minimum_size, self.block_preferred_size)
    }

    fn new_block_size(
        &self,
        layout: DeviceLayout,
        allocate_preference: MemoryAllocatePreference,
    ) -> Result<DeviceSize, MemoryAllocatorError> {
        let margin = self.block_margin_size;

        // The region starts after the leading margin, aligned, and is followed by the trailing
        // margin.
        let required_size = checked_align_up(margin, layout.alignment())
            .and_then(|offset| offset.checked_add(layout.size()))
            .and_then(|end| end.checked_add(margin))
            .filter(|&size| size <= DeviceLayout::MAX_SIZE)
            .ok_or(MemoryAllocatorError::BlockSizeExceeded)?;

        if allocate_preference == MemoryAllocatePreference::AlwaysAllocate {
            return Ok(required_size);
        }

        let base_size = self.base_block_size();

        if required_size <= base_size {
            Ok(base_size)
        } else {
            checked_align_up(required_size, BLOCK_SIZE_GRANULARITY)
                .ok_or(MemoryAllocatorError::BlockSizeExceeded)
        }
    }

    fn create_block(
        &self,
        state: &mut BlockCollectionState<S>,
        block_size: DeviceSize,
    ) -> Result<Block<S>, MemoryAllocatorError> {
        let device_memory =
            DeviceMemory::allocate(self.device.clone(), block_size, self.memory_type_index)
                .map_err(|err| {
                    warn!(
                        "failed to allocate a block of {} bytes in memory type {}: {}",
                        block_size, self.memory_type_index, err,
                    );

                    MemoryAllocatorError::AllocateDeviceMemory(err)
                })?;

        let id = BlockId(state.next_block_id);
        state.next_block_id += 1;

        Ok(Block::new(
            id,
            device_memory,
            self.block_margin_size,
            self.minimum_free_region_size,
        ))
    }
}

/// Parameters to create a new [`BlockCollection`].
#[derive(Clone, Debug)]
pub struct BlockCollectionCreateInfo {
    /// The smallest size of a block that is created to suballocate from.
    ///
    /// The default value is `0`.
    pub block_minimum_size: DeviceSize,

    /// The size of blocks that are created to suballocate from. Requests that don't fit in a block
    /// of this size get a block of their size, rounded up to 64 KiB.
    ///
    /// The default value is 64 MiB.
    pub block_preferred_size: DeviceSize,

    /// The padding in bytes that is reserved on both ends of every region. It must not exceed
    /// `block_minimum_size` or `block_preferred_size`, whichever is larger.
    ///
    /// The default value is `0`.
    pub block_margin_size: DeviceSize,

    /// Free ranges smaller than this are not searched when allocating.
    ///
    /// The default value is `0`.
    pub minimum_free_region_size: DeviceSize,

    /// The number of blocks that are allocated up front and never released.
    ///
    /// The default value is `0`.
    pub minimum_block_count: usize,

    /// The number of blocks after which allocations fail instead of creating another block.
    ///
    /// The default value is [`usize::MAX`].
    pub maximum_block_count: usize,

    pub _ne: NonExhaustive,
}

impl Default for BlockCollectionCreateInfo {
    #[inline]
    fn default() -> Self {
        BlockCollectionCreateInfo {
            block_minimum_size: 0,
            block_preferred_size: 64 * 1024 * 1024,
            block_margin_size: 0,
            minimum_free_region_size: 0,
            minimum_block_count: 0,
            maximum_block_count: usize::MAX,
            _ne: NonExhaustive(()),
        }
    }
}

impl BlockCollectionCreateInfo {
    pub(crate) fn validate(&self) {
        assert!(
            cmp::max(self.block_minimum_size, self.block_preferred_size) > 0,
            "`block_preferred_size` must be non-zero",
        );
        assert!(
            self.block_minimum_size <= DeviceLayout::MAX_SIZE
                && self.block_preferred_size <= DeviceLayout::MAX_SIZE,
            "block sizes must not exceed `DeviceLayout::MAX_SIZE`",
        );
        assert!(
            self.block_margin_size
                <= cmp::max(self.block_minimum_size, self.block_preferred_size),
            "`block_margin_size` must not exceed the size of a block",
        );
        assert!(
            self.maximum_block_count >= 1,
            "`maximum_block_count` must be at least 1",
        );
        assert!(
            self.minimum_block_count <= self.maximum_block_count,
            "`minimum_block_count` must not exceed `maximum_block_count`",
        );
    }
}
