// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The top-level memory allocator.
//!
//! A [`GenericMemoryAllocator`] keeps one [`BlockCollection`] for every memory type of the
//! device. For each request it picks the memory type that matches the intended [`MemoryUsage`]
//! best among the types that the resource supports, and suballocates from that type's collection.
//!
//! The memory type is picked by cost: every preferred property flag that a memory type lacks and
//! every not-preferred flag that it has adds one. Memory types missing a required flag are never
//! picked. The first memory type with the lowest cost wins.

use crate::{
    block::Region,
    budget::MemoryBudget,
    collection::{BlockCollection, BlockCollectionCreateInfo},
    device::{
        BufferCreateInfo, DriverError, ImageCreateInfo, MemoryHeap, MemoryRequirements,
        MemoryType, RawDevice,
    },
    layout::{DeviceAlignment, DeviceLayout},
    resource::{Buffer, Image},
    suballocator::{AllocationType, FreeListAllocator, Suballocator},
    DeviceSize, NonExhaustive,
};
use ash::vk;
use log::warn;
use std::{error::Error, fmt, sync::Arc};

const B: DeviceSize = 1;
const K: DeviceSize = 1024 * B;
const M: DeviceSize = 1024 * K;
const G: DeviceSize = 1024 * M;

/// Standard memory allocator intended as a global and general-purpose allocator.
///
/// See [`FreeListAllocator`] for details about the allocation algorithm.
pub type StandardMemoryAllocator = GenericMemoryAllocator<FreeListAllocator>;

impl StandardMemoryAllocator {
    /// Creates a new `StandardMemoryAllocator` with default configuration.
    ///
    /// Memory types in heaps smaller than 1 GiB use blocks of 64 MiB, the others blocks of
    /// 256 MiB.
    pub fn new_default(device: Arc<dyn RawDevice>) -> Result<Self, MemoryAllocatorError> {
        #[allow(clippy::erasing_op, clippy::identity_op)]
        let create_info = GenericMemoryAllocatorCreateInfo {
            #[rustfmt::skip]
            block_sizes: &[
                (0 * B,  64 * M),
                (1 * G, 256 * M),
            ],
            ..Default::default()
        };

        Self::new(device, create_info)
    }
}

/// A generic implementation of a memory allocator.
///
/// The allocator keeps a [`BlockCollection`] for each memory type. The collections are created
/// up front and never change, so that looking one up doesn't need any synchronization. Each
/// collection is locked individually, which means that allocations in different memory types
/// don't contend with each other.
#[derive(Debug)]
pub struct GenericMemoryAllocator<S = FreeListAllocator> {
    device: Arc<dyn RawDevice>,
    pools: Vec<BlockCollection<S>>,
    memory_heaps: Vec<MemoryHeap>,
    is_unified_memory: bool,
    // Global mask of memory types that can be picked for a request.
    memory_type_bits: u32,
}

impl<S: Suballocator> GenericMemoryAllocator<S> {
    /// Creates a new `GenericMemoryAllocator<S>` using the provided suballocator `S` for
    /// suballocation of the blocks.
    ///
    /// # Panics
    ///
    /// - Panics if `create_info.block_sizes` is not sorted by threshold.
    /// - Panics if `create_info.block_sizes` contains duplicate thresholds.
    /// - Panics if `create_info.block_sizes` does not contain a baseline threshold of `0`.
    /// - Panics if the block size for a heap exceeds the size of the heap.
    /// - Panics if the block counts are not valid, see [`BlockCollectionCreateInfo`].
    pub fn new(
        device: Arc<dyn RawDevice>,
        create_info: GenericMemoryAllocatorCreateInfo<'_>,
    ) -> Result<Self, MemoryAllocatorError> {
        create_info.validate();

        let GenericMemoryAllocatorCreateInfo {
            block_sizes,
            block_minimum_size,
            block_margin_size,
            minimum_free_region_size,
            minimum_block_count,
            maximum_block_count,
            _ne: _,
        } = create_info;

        let memory_properties = device.memory_properties();
        let properties = device.properties();

        let heap_block_sizes = memory_properties
            .memory_heaps
            .iter()
            .map(|memory_heap| {
                let idx = match block_sizes.binary_search_by_key(&memory_heap.size, |&(t, _)| t) {
                    Ok(idx) => idx,
                    Err(idx) => idx.saturating_sub(1),
                };
                let block_size = block_sizes[idx].1;

                assert!(
                    block_size <= memory_heap.size,
                    "the block size for a heap of {} bytes exceeds the size of the heap",
                    memory_heap.size,
                );

                block_size
            })
            .collect::<Vec<_>>();

        let mut memory_type_bits = u32::MAX;
        for (index, memory_type) in memory_properties.memory_types.iter().enumerate() {
            if memory_type.property_flags.intersects(
                vk::MemoryPropertyFlags::LAZILY_ALLOCATED
                    | vk::MemoryPropertyFlags::PROTECTED
                    | vk::MemoryPropertyFlags::DEVICE_COHERENT_AMD
                    | vk::MemoryPropertyFlags::DEVICE_UNCACHED_AMD
                    | vk::MemoryPropertyFlags::RDMA_CAPABLE_NV,
            ) {
                memory_type_bits &= !(1 << index);
            }
        }

        let pools = memory_properties
            .memory_types
            .iter()
            .enumerate()
            .map(|(index, &memory_type)| {
                let block_preferred_size = heap_block_sizes
                    .get(memory_type.heap_index as usize)
                    .copied()
                    .unwrap_or_else(|| {
                        panic!(
                            "memory type {} refers to heap {}, which doesn't exist",
                            index, memory_type.heap_index,
                        )
                    });

                // Memory types that are never picked don't get any blocks up front.
                let minimum_block_count = if memory_type_bits & (1 << index) != 0 {
                    minimum_block_count
                } else {
                    0
                };

                BlockCollection::with_memory_type(
                    device.clone(),
                    index as u32,
                    memory_type,
                    &properties,
                    BlockCollectionCreateInfo {
                        block_minimum_size,
                        block_preferred_size,
                        block_margin_size,
                        minimum_free_region_size,
                        minimum_block_count,
                        maximum_block_count,
                        ..Default::default()
                    },
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(GenericMemoryAllocator {
            device,
            pools,
            memory_heaps: memory_properties.memory_heaps,
            is_unified_memory: properties.is_unified_memory(),
            memory_type_bits,
        })
    }

    /// Returns the device that the allocator allocates from.
    #[inline]
    pub fn device(&self) -> &Arc<dyn RawDevice> {
        &self.device
    }

    /// Returns the block collection of the given memory type, or `None` if the memory type
    /// doesn't exist.
    #[inline]
    pub fn block_collection(&self, memory_type_index: u32) -> Option<&BlockCollection<S>> {
        self.pools.get(memory_type_index as usize)
    }

    /// Returns the block collections of all memory types, indexed by memory type index.
    #[inline]
    pub fn block_collections(&self) -> &[BlockCollection<S>] {
        &self.pools
    }

    /// Returns the index of the memory type that is best suited for `filter`, among the types
    /// allowed by `memory_type_bits`. Memory types that the allocator never picks on its own are
    /// excluded.
    pub fn find_memory_type_index(
        &self,
        memory_type_bits: u32,
        filter: &MemoryTypeFilter,
    ) -> Option<u32> {
        find_memory_type_index(
            self.pools.iter().map(|pool| *pool.memory_type()),
            memory_type_bits & self.memory_type_bits,
            filter,
        )
    }

    /// Allocates a region that satisfies `requirements`, in the memory type that is best suited
    /// for the usage in `create_info`.
    ///
    /// # Errors
    ///
    /// - Returns [`InvalidMemoryRequirements`] if the size in `requirements` is zero, the
    ///   alignment is not a power of two, or the size exceeds [`DeviceLayout::MAX_SIZE`].
    /// - Returns [`FindMemoryType`] if none of the memory types in `requirements` can be used.
    /// - Returns the errors of [`BlockCollection::try_allocate`].
    ///
    /// [`InvalidMemoryRequirements`]: MemoryAllocatorError::InvalidMemoryRequirements
    /// [`FindMemoryType`]: MemoryAllocatorError::FindMemoryType
    pub fn allocate(
        &self,
        requirements: MemoryRequirements,
        allocation_type: AllocationType,
        create_info: AllocationCreateInfo,
    ) -> Result<Region, MemoryAllocatorError> {
        let AllocationCreateInfo {
            usage,
            alignment,
            allocate_preference,
            _ne: _,
        } = create_info;

        let MemoryRequirements {
            size,
            alignment: required_alignment,
            memory_type_bits,
        } = requirements;

        let mut layout = DeviceLayout::from_size_alignment(size, required_alignment)
            .ok_or(MemoryAllocatorError::InvalidMemoryRequirements)?;

        if let Some(alignment) = alignment {
            layout = layout
                .align_to(alignment)
                .ok_or(MemoryAllocatorError::InvalidMemoryRequirements)?;
        }

        let filter = MemoryTypeFilter::from_usage(usage, self.is_unified_memory);
        let memory_type_index = self
            .find_memory_type_index(memory_type_bits, &filter)
            .ok_or(MemoryAllocatorError::FindMemoryType { memory_type_bits })?;

        self.pools[memory_type_index as usize].try_allocate(
            layout,
            allocation_type,
            allocate_preference,
        )
    }

    /// Allocates a region of the given layout in a specific memory type.
    ///
    /// Unlike [`allocate`], this can allocate from memory types that are never picked
    /// automatically.
    ///
    /// # Panics
    ///
    /// - Panics if `memory_type_index` is not less than the number of memory types.
    ///
    /// [`allocate`]: Self::allocate
    pub fn allocate_from_type(
        &self,
        memory_type_index: u32,
        layout: DeviceLayout,
        allocation_type: AllocationType,
        allocate_preference: MemoryAllocatePreference,
    ) -> Result<Region, MemoryAllocatorError> {
        let pool = self
            .pools
            .get(memory_type_index as usize)
            .unwrap_or_else(|| panic!("memory type {} doesn't exist", memory_type_index));

        pool.try_allocate(layout, allocation_type, allocate_preference)
    }

    /// Returns a region to the collection it was allocated from.
    ///
    /// # Safety
    ///
    /// - Nothing that is bound to the region may be in use by the device anymore.
    ///
    /// # Panics
    ///
    /// - Panics if `region` was not allocated from `self`.
    pub unsafe fn free(&self, region: Region) {
        let pool = self
            .pools
            .get(region.memory_type_index() as usize)
            .unwrap_or_else(|| panic!("the region was not allocated from this allocator"));

        unsafe { pool.free(region) };
    }

    /// Creates a buffer and binds it to a freshly allocated region.
    ///
    /// If anything fails after the buffer was created, the buffer is destroyed before the error
    /// is returned.
    pub fn create_buffer(
        &self,
        create_info: BufferCreateInfo,
        allocation_info: AllocationCreateInfo,
    ) -> Result<Buffer, MemoryAllocatorError> {
        let handle = self
            .device
            .create_buffer(&create_info)
            .map_err(MemoryAllocatorError::CreateResource)?;

        // SAFETY: The buffer was just created by the same device.
        let requirements = unsafe { self.device.buffer_memory_requirements(handle) };

        let region = match self.allocate(requirements, AllocationType::Linear, allocation_info) {
            Ok(region) => region,
            Err(err) => {
                warn!(
                    "failed to allocate memory for a buffer of {} bytes: {}",
                    create_info.size, err,
                );

                // SAFETY: The buffer was never bound or used.
                unsafe { self.device.destroy_buffer(handle) };

                return Err(err);
            }
        };

        // SAFETY: The region satisfies the requirements of the buffer, and the buffer is unbound.
        if let Err(err) =
            unsafe { self.device.bind_buffer_memory(handle, region.memory(), region.offset()) }
        {
            warn!("failed to bind memory to a buffer: {}", err);

            // SAFETY: Binding failed, so nothing uses the region or the buffer.
            unsafe { self.free(region) };
            unsafe { self.device.destroy_buffer(handle) };

            return Err(MemoryAllocatorError::BindMemory(err));
        }

        Ok(Buffer::new(handle, region))
    }

    /// Creates an image and binds it to a freshly allocated region.
    ///
    /// If anything fails after the image was created, the image is destroyed before the error is
    /// returned.
    pub fn create_image(
        &self,
        create_info: ImageCreateInfo,
        allocation_info: AllocationCreateInfo,
    ) -> Result<Image, MemoryAllocatorError> {
        let handle = self
            .device
            .create_image(&create_info)
            .map_err(MemoryAllocatorError::CreateResource)?;

        // SAFETY: The image was just created by the same device.
        let requirements = unsafe { self.device.image_memory_requirements(handle) };

        let region = match self.allocate(requirements, create_info.tiling.into(), allocation_info)
        {
            Ok(region) => region,
            Err(err) => {
                warn!(
                    "failed to allocate memory for an image of extent {:?}: {}",
                    create_info.extent, err,
                );

                // SAFETY: The image was never bound or used.
                unsafe { self.device.destroy_image(handle) };

                return Err(err);
            }
        };

        // SAFETY: The region satisfies the requirements of the image, and the image is unbound.
        if let Err(err) =
            unsafe { self.device.bind_image_memory(handle, region.memory(), region.offset()) }
        {
            warn!("failed to bind memory to an image: {}", err);

            // SAFETY: Binding failed, so nothing uses the region or the image.
            unsafe { self.free(region) };
            unsafe { self.device.destroy_image(handle) };

            return Err(MemoryAllocatorError::BindMemory(err));
        }

        Ok(Image::new(handle, create_info.extent, region))
    }

    /// Frees the region of a buffer and then destroys the buffer.
    ///
    /// # Safety
    ///
    /// - The buffer must have been created by `self`.
    /// - The buffer must not be in use by the device anymore.
    pub unsafe fn destroy_buffer(&self, buffer: Buffer) {
        let (handle, region) = buffer.into_parts();

        unsafe { self.free(region) };
        unsafe { self.device.destroy_buffer(handle) };
    }

    /// Frees the region of an image and then destroys the image.
    ///
    /// # Safety
    ///
    /// - The image must have been created by `self`.
    /// - The image must not be in use by the device anymore.
    pub unsafe fn destroy_image(&self, image: Image) {
        let (handle, region) = image.into_parts();

        unsafe { self.free(region) };
        unsafe { self.device.destroy_image(handle) };
    }

    /// Returns a snapshot of the memory usage of the given memory type, together with an
    /// estimate of the usage and budget of its heap.
    ///
    /// The estimate comes from the driver if it supports reporting it. Otherwise the usage is the
    /// total size of the blocks this allocator holds in the heap, and the budget is 80% of the
    /// heap size.
    ///
    /// # Panics
    ///
    /// - Panics if `memory_type_index` is not less than the number of memory types.
    pub fn get_budget(&self, memory_type_index: u32) -> MemoryBudget {
        let pool = self
            .pools
            .get(memory_type_index as usize)
            .unwrap_or_else(|| panic!("memory type {} doesn't exist", memory_type_index));
        let heap_index = pool.memory_type().heap_index;
        let (block_count, total_block_size, total_allocated_region_size) = pool.totals();

        let heap_budget = self
            .device
            .memory_budget()
            .and_then(|budgets| budgets.get(heap_index as usize).copied());

        let heap_block_size = || {
            self.pools
                .iter()
                .filter(|pool| pool.memory_type().heap_index == heap_index)
                .map(|pool| pool.totals().1)
                .sum()
        };

        MemoryBudget::new(
            heap_budget,
            &self.memory_heaps[heap_index as usize],
            heap_block_size,
            block_count,
            total_block_size,
            total_allocated_region_size,
        )
    }
}

/// Returns the index of the first memory type with the lowest cost for `filter`, among the types
/// allowed by `memory_type_bits`. Stops looking at further memory types once one matches
/// perfectly.
pub(crate) fn find_memory_type_index(
    memory_types: impl IntoIterator<Item = MemoryType>,
    memory_type_bits: u32,
    filter: &MemoryTypeFilter,
) -> Option<u32> {
    let mut best: Option<(u32, u32)> = None;

    for (index, memory_type) in memory_types.into_iter().enumerate() {
        let index = index as u32;

        if memory_type_bits.checked_shr(index).unwrap_or(0) & 1 == 0 {
            continue;
        }

        let flags = memory_type.property_flags;

        if !flags.contains(filter.required_flags) {
            continue;
        }

        let cost = filter.cost(flags);

        if best.map_or(true, |(_, best_cost)| cost < best_cost) {
            best = Some((index, cost));
        }

        if cost == 0 {
            break;
        }
    }

    best.map(|(index, _)| index)
}

/// Parameters to create a new [`GenericMemoryAllocator`].
#[derive(Clone, Debug)]
pub struct GenericMemoryAllocatorCreateInfo<'a> {
    /// Lets you configure the block sizes for various heap size classes.
    ///
    /// Each entry is a pair of the threshold for the heap size and the block size that should be
    /// used for that heap. Must be sorted by threshold and all thresholds must be unique. Must
    /// contain a baseline threshold of 0.
    ///
    /// The allocator keeps a collection of blocks for each memory type, so each memory type that
    /// resides in a heap whose size crosses one of the thresholds will use the corresponding
    /// block size. If multiple thresholds apply to a given heap, the block size corresponding to
    /// the largest threshold is chosen.
    ///
    /// The default value is `&[]`, which must be overridden.
    pub block_sizes: &'a [(Threshold, BlockSize)],

    /// The smallest size of a block that is created, for all memory types.
    ///
    /// The default value is `0`.
    pub block_minimum_size: DeviceSize,

    /// The padding in bytes that is reserved on both ends of every region.
    ///
    /// The default value is `0`.
    pub block_margin_size: DeviceSize,

    /// Free ranges smaller than this are not searched when allocating.
    ///
    /// The default value is `0`.
    pub minimum_free_region_size: DeviceSize,

    /// The number of blocks that each memory type keeps around even when they are empty.
    ///
    /// The default value is `0`.
    pub minimum_block_count: usize,

    /// The number of blocks after which allocations in a memory type fail instead of creating
    /// another block.
    ///
    /// The default value is [`usize::MAX`].
    pub maximum_block_count: usize,

    pub _ne: NonExhaustive,
}

pub type Threshold = DeviceSize;

pub type BlockSize = DeviceSize;

impl Default for GenericMemoryAllocatorCreateInfo<'_> {
    #[inline]
    fn default() -> Self {
        GenericMemoryAllocatorCreateInfo {
            block_sizes: &[],
            block_minimum_size: 0,
            block_margin_size: 0,
            minimum_free_region_size: 0,
            minimum_block_count: 0,
            maximum_block_count: usize::MAX,
            _ne: NonExhaustive(()),
        }
    }
}

impl GenericMemoryAllocatorCreateInfo<'_> {
    pub(crate) fn validate(&self) {
        let &Self {
            block_sizes,
            block_minimum_size: _,
            block_margin_size: _,
            minimum_free_region_size: _,
            minimum_block_count,
            maximum_block_count,
            _ne: _,
        } = self;

        assert!(
            block_sizes.windows(2).all(|win| win[0].0 < win[1].0),
            "`create_info.block_sizes` must be sorted by threshold without duplicates",
        );
        assert!(
            matches!(block_sizes.first(), Some((0, _))),
            "`create_info.block_sizes` must contain a baseline threshold `0`",
        );
        assert!(
            maximum_block_count >= 1,
            "`create_info.maximum_block_count` must be at least 1",
        );
        assert!(
            minimum_block_count <= maximum_block_count,
            "`create_info.minimum_block_count` must not exceed \
            `create_info.maximum_block_count`",
        );
    }
}

/// Parameters to allocate a region.
#[derive(Clone, Debug)]
pub struct AllocationCreateInfo {
    /// How the memory is going to be accessed.
    ///
    /// The default value is [`MemoryUsage::GpuOnly`].
    pub usage: MemoryUsage,

    /// An alignment that the region must satisfy on top of the requirements of the resource.
    ///
    /// The default value is `None`.
    pub alignment: Option<DeviceAlignment>,

    /// Whether allocating a new block is desired.
    ///
    /// The default value is [`MemoryAllocatePreference::Unknown`].
    pub allocate_preference: MemoryAllocatePreference,

    pub _ne: NonExhaustive,
}

impl Default for AllocationCreateInfo {
    #[inline]
    fn default() -> Self {
        AllocationCreateInfo {
            usage: MemoryUsage::GpuOnly,
            alignment: None,
            allocate_preference: MemoryAllocatePreference::Unknown,
            _ne: NonExhaustive(()),
        }
    }
}

/// Describes how a memory allocation is going to be used.
///
/// This is mostly an optimization, except for `MemoryUsage::CpuToGpu` and `MemoryUsage::GpuToCpu`
/// which guarantee a memory type that the host can access.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MemoryUsage {
    /// The memory is intended to only be used by the GPU.
    ///
    /// Prefers picking a memory type with the `DEVICE_LOCAL` flag, except on devices with
    /// unified memory where any memory type will do.
    ///
    /// This is what resources that the host never touches, like render targets and textures that
    /// are uploaded once, should use.
    #[default]
    GpuOnly,

    /// The memory is intended for upload to the GPU.
    ///
    /// Guarantees picking a memory type with the `HOST_VISIBLE` flag. On devices without unified
    /// memory, prefers picking one with the `DEVICE_LOCAL` flag.
    ///
    /// This is best suited for resources that are constantly updated by the host, like vertex
    /// buffers, and for staging buffers.
    CpuToGpu,

    /// The memory is intended for download from the GPU.
    ///
    /// Guarantees picking a memory type with the `HOST_VISIBLE` flag. Prefers picking one with
    /// the `HOST_CACHED` flag.
    GpuToCpu,
}

/// Describes whether allocating a new block is desired.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MemoryAllocatePreference {
    /// There is no known preference, let the allocator decide.
    #[default]
    Unknown,

    /// The allocator should never allocate a block and should instead only suballocate from
    /// existing blocks.
    ///
    /// This option is best suited if you can not afford the overhead of allocating device memory.
    NeverAllocate,

    /// The allocator should always allocate a block of exactly the size of the allocation.
    ///
    /// This option is best suited if you are allocating a long-lived resource that you know could
    /// benefit from having its own allocation.
    AlwaysAllocate,
}

/// Describes which memory property flags a memory type must have, and which ones it should and
/// should not have.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryTypeFilter {
    /// Memory types that lack any of these flags are never picked.
    pub required_flags: vk::MemoryPropertyFlags,

    /// Every one of these flags that a memory type lacks makes it less suitable.
    pub preferred_flags: vk::MemoryPropertyFlags,

    /// Every one of these flags that a memory type has makes it less suitable.
    pub not_preferred_flags: vk::MemoryPropertyFlags,
}

impl MemoryTypeFilter {
    /// Returns the filter for the given usage. On devices with unified memory, device-local
    /// memory is not preferred over other memory.
    pub fn from_usage(usage: MemoryUsage, is_unified_memory: bool) -> Self {
        let mut filter = MemoryTypeFilter::default();

        match usage {
            MemoryUsage::GpuOnly => {
                if !is_unified_memory {
                    filter.preferred_flags |= vk::MemoryPropertyFlags::DEVICE_LOCAL;
                }
            }
            MemoryUsage::CpuToGpu => {
                filter.required_flags |= vk::MemoryPropertyFlags::HOST_VISIBLE;
                if !is_unified_memory {
                    filter.preferred_flags |= vk::MemoryPropertyFlags::DEVICE_LOCAL;
                }
            }
            MemoryUsage::GpuToCpu => {
                filter.required_flags |= vk::MemoryPropertyFlags::HOST_VISIBLE;
                filter.preferred_flags |= vk::MemoryPropertyFlags::HOST_CACHED;
            }
        }

        filter
    }

    /// Returns how unsuitable a memory type with the given flags is. `0` is a perfect match.
    #[inline]
    pub fn cost(&self, flags: vk::MemoryPropertyFlags) -> u32 {
        (self.preferred_flags & !flags).as_raw().count_ones()
            + (self.not_preferred_flags & flags).as_raw().count_ones()
    }
}

/// Error that can be returned when allocating memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryAllocatorError {
    /// Allocating a new block of device memory failed.
    AllocateDeviceMemory(DriverError),

    /// There is not enough memory in the pool.
    ///
    /// This is returned when using [`MemoryAllocatePreference::NeverAllocate`] and there is not
    /// enough memory in the pool, or when the maximum number of blocks is reached.
    OutOfPoolMemory,

    /// The allocation with its margins is larger than the largest possible block.
    BlockSizeExceeded,

    /// None of the memory types that the resource supports can be used.
    FindMemoryType {
        /// The memory types that the resource supports.
        memory_type_bits: u32,
    },

    /// The driver reported memory requirements that don't describe a valid layout.
    InvalidMemoryRequirements,

    /// Creating the buffer or image failed.
    CreateResource(DriverError),

    /// Binding the buffer or image to its region failed.
    BindMemory(DriverError),
}

impl MemoryAllocatorError {
    /// Returns `true` if the error means that there is not enough memory, as opposed to the
    /// request being one that can't ever be satisfied.
    pub fn is_out_of_memory(&self) -> bool {
        match self {
            Self::AllocateDeviceMemory(err)
            | Self::CreateResource(err)
            | Self::BindMemory(err) => err.is_out_of_memory(),
            Self::OutOfPoolMemory => true,
            Self::BlockSizeExceeded
            | Self::FindMemoryType { .. }
            | Self::InvalidMemoryRequirements => false,
        }
    }
}

impl fmt::Display for MemoryAllocatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllocateDeviceMemory(_) => write!(f, "allocating device memory failed"),
            Self::OutOfPoolMemory => write!(f, "the pool doesn't have enough free space"),
            Self::BlockSizeExceeded => write!(
                f,
                "the allocation size was greater than the largest possible block size",
            ),
            Self::FindMemoryType { memory_type_bits } => write!(
                f,
                "none of the memory types {:#b} can be used for the allocation",
                memory_type_bits,
            ),
            Self::InvalidMemoryRequirements => {
                write!(f, "the memory requirements don't describe a valid layout")
            }
            Self::CreateResource(_) => write!(f, "creating the resource failed"),
            Self::BindMemory(_) => write!(f, "binding memory to the resource failed"),
        }
    }
}

impl Error for MemoryAllocatorError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::AllocateDeviceMemory(err)
            | Self::CreateResource(err)
            | Self::BindMemory(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::{DeviceProperties, HeapBudget, ImageTiling, MemoryProperties},
        tests::{MockDevice, GIB},
    };
    use crossbeam_queue::ArrayQueue;
    use std::{cell::Cell, thread};

    fn allocator(device: &Arc<MockDevice>) -> StandardMemoryAllocator {
        StandardMemoryAllocator::new_default(device.clone()).unwrap()
    }

    fn allocation_info(usage: MemoryUsage) -> AllocationCreateInfo {
        AllocationCreateInfo {
            usage,
            ..Default::default()
        }
    }

    fn requirements(size: DeviceSize, memory_type_bits: u32) -> MemoryRequirements {
        MemoryRequirements {
            size,
            alignment: 256,
            memory_type_bits,
        }
    }

    #[test]
    fn is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}

        assert_send_sync::<StandardMemoryAllocator>();
    }

    #[test]
    fn picks_memory_types_by_usage() {
        let discrete = allocator(&MockDevice::discrete());
        let integrated = allocator(&MockDevice::integrated());

        let pick = |allocator: &StandardMemoryAllocator, usage| {
            let filter = MemoryTypeFilter::from_usage(usage, allocator.is_unified_memory);

            allocator.find_memory_type_index(u32::MAX, &filter)
        };

        assert_eq!(pick(&discrete, MemoryUsage::GpuOnly), Some(0));
        assert_eq!(pick(&discrete, MemoryUsage::CpuToGpu), Some(3));
        assert_eq!(pick(&discrete, MemoryUsage::GpuToCpu), Some(2));

        // Everything is device-local anyway.
        assert_eq!(pick(&integrated, MemoryUsage::GpuOnly), Some(0));
        assert_eq!(pick(&integrated, MemoryUsage::CpuToGpu), Some(1));
        assert_eq!(pick(&integrated, MemoryUsage::GpuToCpu), Some(2));
    }

    fn counted<'a>(
        memory_types: &'a [MemoryType],
        visited: &'a Cell<usize>,
    ) -> impl Iterator<Item = MemoryType> + 'a {
        memory_types
            .iter()
            .copied()
            .inspect(move |_| visited.set(visited.get() + 1))
    }

    #[test]
    fn lowest_cost_wins_and_perfect_matches_stop_the_search() {
        let flags = [
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::empty(),
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED,
        ];
        let memory_types = flags.map(|property_flags| MemoryType {
            property_flags,
            heap_index: 0,
        });
        let visited = Cell::new(0);

        let gpu_only = MemoryTypeFilter::from_usage(MemoryUsage::GpuOnly, false);
        assert_eq!(gpu_only.cost(flags[0]), 1);
        assert_eq!(gpu_only.cost(flags[1]), 1);
        assert_eq!(gpu_only.cost(flags[2]), 0);
        assert_eq!(gpu_only.cost(flags[3]), 0);
        assert_eq!(gpu_only.cost(flags[4]), 1);

        assert_eq!(
            find_memory_type_index(counted(&memory_types, &visited), u32::MAX, &gpu_only),
            Some(2),
        );
        assert_eq!(visited.get(), 3);

        // Without the perfect match every memory type is looked at, and ties go to the first.
        visited.set(0);
        assert_eq!(
            find_memory_type_index(counted(&memory_types, &visited), 0b10011, &gpu_only),
            Some(0),
        );
        assert_eq!(visited.get(), 5);

        assert_eq!(
            find_memory_type_index(counted(&memory_types, &visited), 0b10000, &gpu_only),
            Some(4),
        );

        let download = MemoryTypeFilter::from_usage(MemoryUsage::GpuToCpu, false);
        assert_eq!(
            find_memory_type_index(counted(&memory_types, &visited), u32::MAX, &download),
            Some(4),
        );
        assert_eq!(
            find_memory_type_index(counted(&memory_types, &visited), 0b01001, &download),
            Some(0),
        );
        assert_eq!(
            find_memory_type_index(counted(&memory_types, &visited), 0b00110, &download),
            None,
        );
    }

    #[test]
    fn host_visibility_and_caching_cost_nothing() {
        let memory_types = |flags: &[vk::MemoryPropertyFlags]| {
            flags
                .iter()
                .map(|&property_flags| MemoryType {
                    property_flags,
                    heap_index: 0,
                })
                .collect::<Vec<_>>()
        };
        let visited = Cell::new(0);

        let discrete = memory_types(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ]);
        let gpu_only = MemoryTypeFilter::from_usage(MemoryUsage::GpuOnly, false);
        assert_eq!(gpu_only.not_preferred_flags, vk::MemoryPropertyFlags::empty());
        assert_eq!(
            find_memory_type_index(counted(&discrete, &visited), u32::MAX, &gpu_only),
            Some(0),
        );
        assert_eq!(visited.get(), 1);

        let unified = memory_types(&[
            vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT
                | vk::MemoryPropertyFlags::HOST_CACHED,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ]);
        let upload = MemoryTypeFilter::from_usage(MemoryUsage::CpuToGpu, true);
        assert_eq!(upload.not_preferred_flags, vk::MemoryPropertyFlags::empty());
        assert_eq!(
            find_memory_type_index(counted(&unified, &visited), u32::MAX, &upload),
            Some(0),
        );
    }

    #[test]
    fn excluded_memory_types_are_never_picked() {
        let device = MockDevice::new(
            MemoryProperties {
                memory_types: vec![
                    MemoryType {
                        property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL
                            | vk::MemoryPropertyFlags::LAZILY_ALLOCATED,
                        heap_index: 0,
                    },
                    MemoryType {
                        property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL
                            | vk::MemoryPropertyFlags::PROTECTED,
                        heap_index: 0,
                    },
                    MemoryType {
                        property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL
                            | vk::MemoryPropertyFlags::HOST_VISIBLE,
                        heap_index: 0,
                    },
                ],
                memory_heaps: vec![MemoryHeap {
                    size: 2 * GIB,
                    flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
                }],
            },
            DeviceProperties {
                device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
                buffer_image_granularity: 1,
                non_coherent_atom_size: 1,
            },
        );
        let allocator = allocator(&device);

        let region = allocator
            .allocate(
                requirements(1024, u32::MAX),
                AllocationType::Linear,
                AllocationCreateInfo::default(),
            )
            .unwrap();
        assert_eq!(region.memory_type_index(), 2);
        unsafe { allocator.free(region) };

        assert_eq!(
            allocator.allocate(
                requirements(1024, 0b011),
                AllocationType::Linear,
                AllocationCreateInfo::default(),
            ),
            Err(MemoryAllocatorError::FindMemoryType {
                memory_type_bits: 0b011,
            }),
        );

        // Still reachable on purpose.
        let region = allocator
            .allocate_from_type(
                1,
                DeviceLayout::from_size_alignment(1024, 1).unwrap(),
                AllocationType::Linear,
                MemoryAllocatePreference::Unknown,
            )
            .unwrap();
        assert_eq!(region.memory_type_index(), 1);
        unsafe { allocator.free(region) };
    }

    #[test]
    fn block_sizes_follow_heap_sizes() {
        let device = MockDevice::new(
            MemoryProperties {
                memory_types: vec![
                    MemoryType {
                        property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
                        heap_index: 0,
                    },
                    MemoryType {
                        property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                            | vk::MemoryPropertyFlags::HOST_COHERENT,
                        heap_index: 1,
                    },
                ],
                memory_heaps: vec![
                    MemoryHeap {
                        size: 4 * GIB,
                        flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
                    },
                    MemoryHeap {
                        size: 256 * M,
                        flags: vk::MemoryHeapFlags::empty(),
                    },
                ],
            },
            DeviceProperties {
                device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
                buffer_image_granularity: 1,
                non_coherent_atom_size: 1,
            },
        );
        let allocator = allocator(&device);

        assert_eq!(
            allocator.block_collection(0).unwrap().block_preferred_size(),
            256 * M,
        );
        assert_eq!(
            allocator.block_collection(1).unwrap().block_preferred_size(),
            64 * M,
        );
        assert!(allocator.block_collection(2).is_none());
    }

    #[test]
    fn invalid_create_info() {
        let device = MockDevice::discrete();

        assert_should_panic!("baseline threshold", {
            let _ = StandardMemoryAllocator::new(
                device.clone(),
                GenericMemoryAllocatorCreateInfo {
                    block_sizes: &[(G, 256 * M)],
                    ..Default::default()
                },
            );
        });

        assert_should_panic!("sorted by threshold", {
            let _ = StandardMemoryAllocator::new(
                device.clone(),
                GenericMemoryAllocatorCreateInfo {
                    block_sizes: &[(0, 64 * M), (2 * G, 256 * M), (G, 128 * M)],
                    ..Default::default()
                },
            );
        });

        assert_should_panic!("exceeds the size of the heap", {
            let _ = StandardMemoryAllocator::new(
                device.clone(),
                GenericMemoryAllocatorCreateInfo {
                    block_sizes: &[(0, 32 * G)],
                    ..Default::default()
                },
            );
        });

        assert_should_panic!("must not exceed", {
            let _ = StandardMemoryAllocator::new(
                device.clone(),
                GenericMemoryAllocatorCreateInfo {
                    block_sizes: &[(0, 64 * M)],
                    minimum_block_count: 2,
                    maximum_block_count: 1,
                    ..Default::default()
                },
            );
        });
    }

    #[test]
    fn minimum_blocks_are_created_up_front() {
        let device = MockDevice::discrete();
        let allocator = StandardMemoryAllocator::new(
            device.clone(),
            GenericMemoryAllocatorCreateInfo {
                block_sizes: &[(0, 64 * M)],
                minimum_block_count: 1,
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(device.live_memory_count(), 4);
        assert!(allocator
            .block_collections()
            .iter()
            .all(|pool| pool.block_count() == 1));

        drop(allocator);
        assert_eq!(device.live_memory_count(), 0);

        device.fail_allocations(true);
        assert!(matches!(
            StandardMemoryAllocator::new(
                device.clone(),
                GenericMemoryAllocatorCreateInfo {
                    block_sizes: &[(0, 64 * M)],
                    minimum_block_count: 1,
                    ..Default::default()
                },
            ),
            Err(MemoryAllocatorError::AllocateDeviceMemory(_)),
        ));
    }

    #[test]
    fn invalid_requirements() {
        let device = MockDevice::discrete();
        let allocator = allocator(&device);

        for requirements in [
            MemoryRequirements {
                size: 0,
                alignment: 1,
                memory_type_bits: u32::MAX,
            },
            MemoryRequirements {
                size: 16,
                alignment: 3,
                memory_type_bits: u32::MAX,
            },
        ] {
            assert_eq!(
                allocator.allocate(requirements, AllocationType::Linear, Default::default()),
                Err(MemoryAllocatorError::InvalidMemoryRequirements),
            );
        }

        assert_eq!(device.allocation_count(), 0);
    }

    #[test]
    fn extra_alignment() {
        let device = MockDevice::discrete();
        let allocator = allocator(&device);

        let a = allocator
            .allocate(requirements(16, u32::MAX), AllocationType::Linear, Default::default())
            .unwrap();
        let b = allocator
            .allocate(
                requirements(16, u32::MAX),
                AllocationType::Linear,
                AllocationCreateInfo {
                    alignment: DeviceAlignment::new(4096),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(a.offset(), 0);
        assert_eq!(b.offset(), 4096);
        assert_eq!(b.alignment().as_devicesize(), 4096);

        unsafe { allocator.free(a) };
        unsafe { allocator.free(b) };
    }

    #[test]
    fn buffers_are_bound_to_their_region() {
        let device = MockDevice::discrete();
        let allocator = allocator(&device);

        let buffer = allocator
            .create_buffer(
                BufferCreateInfo {
                    size: 4096,
                    usage: vk::BufferUsageFlags::VERTEX_BUFFER,
                    ..Default::default()
                },
                allocation_info(MemoryUsage::CpuToGpu),
            )
            .unwrap();
        let region = buffer.region();
        assert_eq!(region.memory_type_index(), 3);
        assert_eq!(region.size(), 4096);
        assert_eq!(region.allocation_type(), AllocationType::Linear);

        let resource = device.buffer(buffer.handle()).unwrap();
        assert_eq!(resource.bound, Some((region.memory(), region.offset())));

        unsafe { allocator.destroy_buffer(buffer) };
        assert_eq!(device.live_buffer_count(), 0);
        assert_eq!(allocator.block_collection(3).unwrap().block_count(), 0);
    }

    #[test]
    fn images_are_bound_to_their_region() {
        let device = MockDevice::discrete();
        let allocator = allocator(&device);

        let image = allocator
            .create_image(
                ImageCreateInfo {
                    tiling: ImageTiling::Optimal,
                    usage: vk::ImageUsageFlags::SAMPLED,
                    ..ImageCreateInfo::with_dimensions(60, Some(60), None)
                },
                Default::default(),
            )
            .unwrap();
        let region = image.region();
        assert_eq!(region.memory_type_index(), 0);
        assert_eq!(region.size(), 4 * 60 * 60);
        assert_eq!(region.allocation_type(), AllocationType::NonLinear);
        assert_eq!(image.extent(), [60, 60, 1]);

        let resource = device.image(image.handle()).unwrap();
        assert_eq!(resource.bound, Some((region.memory(), region.offset())));

        // The image ends in the middle of a 1024-byte page, which a buffer can't share.
        let buffer = allocator
            .create_buffer(
                BufferCreateInfo {
                    size: 16,
                    usage: vk::BufferUsageFlags::UNIFORM_BUFFER,
                    ..Default::default()
                },
                Default::default(),
            )
            .unwrap();
        assert_eq!(buffer.region().block_id(), image.region().block_id());
        assert_eq!(buffer.region().offset(), 15360);

        unsafe { allocator.destroy_image(image) };
        unsafe { allocator.destroy_buffer(buffer) };
        assert_eq!(device.live_image_count(), 0);
        assert_eq!(device.live_buffer_count(), 0);
    }

    #[test]
    fn failed_allocations_destroy_the_resource() {
        let device = MockDevice::discrete();
        let allocator = allocator(&device);

        device.fail_allocations(true);
        let res = allocator.create_buffer(
            BufferCreateInfo {
                size: 4096,
                ..Default::default()
            },
            Default::default(),
        );
        let err = res.unwrap_err();
        assert_eq!(
            err,
            MemoryAllocatorError::AllocateDeviceMemory(DriverError::OutOfDeviceMemory),
        );
        assert!(err.is_out_of_memory());
        assert_eq!(device.live_buffer_count(), 0);

        let res = allocator.create_image(
            ImageCreateInfo::with_dimensions(16, Some(16), None),
            Default::default(),
        );
        assert!(res.unwrap_err().is_out_of_memory());
        assert_eq!(device.live_image_count(), 0);
        device.fail_allocations(false);

        // The resource supports no memory type.
        device.set_memory_type_bits(0);
        let res = allocator.create_buffer(
            BufferCreateInfo {
                size: 4096,
                ..Default::default()
            },
            Default::default(),
        );
        let err = res.unwrap_err();
        assert_eq!(err, MemoryAllocatorError::FindMemoryType { memory_type_bits: 0 });
        assert!(!err.is_out_of_memory());
        assert_eq!(device.live_buffer_count(), 0);
    }

    #[test]
    fn failed_binds_free_the_region() {
        let device = MockDevice::discrete();
        let allocator = allocator(&device);

        device.fail_binds(true);
        let res = allocator.create_buffer(
            BufferCreateInfo {
                size: 4096,
                ..Default::default()
            },
            Default::default(),
        );
        assert!(matches!(res, Err(MemoryAllocatorError::BindMemory(_))));
        assert_eq!(device.live_buffer_count(), 0);
        assert_eq!(device.live_memory_count(), 0);
        assert!(allocator
            .block_collections()
            .iter()
            .all(|pool| pool.block_count() == 0));
    }

    #[test]
    fn never_allocate_without_blocks() {
        let device = MockDevice::discrete();
        let allocator = allocator(&device);

        let res = allocator.create_buffer(
            BufferCreateInfo {
                size: 4096,
                ..Default::default()
            },
            AllocationCreateInfo {
                allocate_preference: MemoryAllocatePreference::NeverAllocate,
                ..Default::default()
            },
        );
        assert_eq!(res.unwrap_err(), MemoryAllocatorError::OutOfPoolMemory);
        assert_eq!(device.live_buffer_count(), 0);
        assert_eq!(device.allocation_count(), 0);
    }

    #[test]
    fn budget_from_the_driver() {
        let device = MockDevice::discrete();
        let allocator = allocator(&device);
        device.set_budget(Some(vec![
            HeapBudget {
                usage: 3 * GIB,
                budget: 7 * GIB,
            },
            HeapBudget {
                usage: GIB,
                budget: 12 * GIB,
            },
        ]));

        let buffer = allocator
            .create_buffer(
                BufferCreateInfo {
                    size: 4096,
                    ..Default::default()
                },
                Default::default(),
            )
            .unwrap();

        let budget = allocator.get_budget(0);
        assert_eq!(budget.estimated_usage, 3 * GIB);
        assert_eq!(budget.estimated_budget, 7 * GIB);
        assert_eq!(budget.block_count, 1);
        assert_eq!(budget.total_block_size, 256 * M);
        assert_eq!(budget.total_allocated_region_size, 4096);

        let budget = allocator.get_budget(1);
        assert_eq!(budget.estimated_usage, GIB);
        assert_eq!(budget.block_count, 0);
        assert_eq!(budget.total_block_size, 0);

        unsafe { allocator.destroy_buffer(buffer) };
    }

    #[test]
    fn budget_without_the_driver() {
        let device = MockDevice::discrete();
        let allocator = allocator(&device);

        let a = allocator
            .allocate_from_type(
                0,
                DeviceLayout::from_size_alignment(1024, 1).unwrap(),
                AllocationType::Linear,
                MemoryAllocatePreference::Unknown,
            )
            .unwrap();
        let b = allocator
            .allocate_from_type(
                3,
                DeviceLayout::from_size_alignment(1024, 1).unwrap(),
                AllocationType::Linear,
                MemoryAllocatePreference::Unknown,
            )
            .unwrap();

        // Memory types 0 and 3 share heap 0.
        let budget = allocator.get_budget(0);
        assert_eq!(budget.estimated_usage, 2 * 256 * M);
        assert_eq!(budget.estimated_budget, 8 * GIB / 10 * 8);
        assert_eq!(budget.total_block_size, 256 * M);
        assert_eq!(budget.total_allocated_region_size, 1024);

        unsafe { allocator.free(a) };
        unsafe { allocator.free(b) };

        let budget = allocator.get_budget(0);
        assert_eq!(budget.estimated_usage, 0);
        assert_eq!(budget.block_count, 0);
    }

    #[test]
    fn concurrent_resources() {
        const THREADS: usize = 8;
        const BUFFERS_PER_THREAD: usize = 32;

        let device = MockDevice::discrete();
        let allocator = allocator(&device);
        let buffers = ArrayQueue::new(THREADS * BUFFERS_PER_THREAD);

        thread::scope(|scope| {
            for i in 0..THREADS {
                let (allocator, buffers) = (&allocator, &buffers);
                let usage = [
                    MemoryUsage::GpuOnly,
                    MemoryUsage::CpuToGpu,
                    MemoryUsage::GpuToCpu,
                ][i % 3];

                scope.spawn(move || {
                    for j in 0..BUFFERS_PER_THREAD {
                        let buffer = allocator
                            .create_buffer(
                                BufferCreateInfo {
                                    size: 64 * (j as DeviceSize + 1),
                                    ..Default::default()
                                },
                                allocation_info(usage),
                            )
                            .unwrap();
                        buffers.push(buffer).unwrap();
                    }
                });
            }
        });

        assert_eq!(device.live_buffer_count(), THREADS * BUFFERS_PER_THREAD);
        // One block for each of the three memory types in use.
        assert_eq!(device.live_memory_count(), 3);

        while let Some(buffer) = buffers.pop() {
            unsafe { allocator.destroy_buffer(buffer) };
        }

        assert_eq!(device.live_buffer_count(), 0);
        assert_eq!(device.live_memory_count(), 0);
    }
}
