// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Block-based suballocation of Vulkan device memory.
//!
//! Allocating [`DeviceMemory`] from the driver is expensive, and the number of live allocations
//! is limited by the implementation. This crate allocates a few large *blocks* per memory type
//! and carves them up into many small [`Region`]s, each of which backs exactly one buffer or
//! image.
//!
//! The pieces, from the bottom up:
//!
//! - A [`Suballocator`] tracks which byte ranges of a block are free. The shipped
//!   implementation is the [`FreeListAllocator`].
//! - A [`Block`] owns one `DeviceMemory` allocation together with its suballocator.
//! - A [`BlockCollection`] owns all blocks of one memory type, and decides when blocks are
//!   created and released.
//! - The [`GenericMemoryAllocator`] owns one collection per memory type of the device, picks a
//!   memory type for each request, and creates buffers and images bound to fresh regions.
//!
//! The driver itself is reached only through the [`RawDevice`] trait. [`AshDevice`] implements
//! it on top of [`ash`].
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use vulkano_suballocator::{
//!     AllocationCreateInfo, BufferCreateInfo, MemoryUsage, RawDevice, StandardMemoryAllocator,
//! };
//!
//! # fn example(device: Arc<dyn RawDevice>) -> Result<(), Box<dyn std::error::Error>> {
//! let allocator = StandardMemoryAllocator::new_default(device)?;
//!
//! let buffer = allocator.create_buffer(
//!     BufferCreateInfo {
//!         size: 4096,
//!         usage: ash::vk::BufferUsageFlags::VERTEX_BUFFER,
//!         ..Default::default()
//!     },
//!     AllocationCreateInfo {
//!         usage: MemoryUsage::CpuToGpu,
//!         ..Default::default()
//!     },
//! )?;
//!
//! println!("bound at offset {}", buffer.region().offset());
//!
//! unsafe { allocator.destroy_buffer(buffer) };
//! # Ok(())
//! # }
//! ```
//!
//! [`DeviceMemory`]: device::DeviceMemory
//! [`Region`]: block::Region
//! [`Suballocator`]: suballocator::Suballocator
//! [`FreeListAllocator`]: suballocator::FreeListAllocator
//! [`Block`]: block::Block
//! [`BlockCollection`]: collection::BlockCollection
//! [`GenericMemoryAllocator`]: allocator::GenericMemoryAllocator
//! [`RawDevice`]: device::RawDevice
//! [`AshDevice`]: vulkan::AshDevice

pub use crate::{
    allocator::{
        AllocationCreateInfo, GenericMemoryAllocator, GenericMemoryAllocatorCreateInfo,
        MemoryAllocatePreference, MemoryAllocatorError, MemoryTypeFilter, MemoryUsage,
        StandardMemoryAllocator,
    },
    block::{Block, BlockId, Region},
    budget::MemoryBudget,
    collection::{BlockCollection, BlockCollectionCreateInfo},
    device::{
        BufferCreateInfo, DeviceMemory, DeviceProperties, DriverError, HeapBudget,
        ImageCreateInfo, ImageTiling, MemoryHeap, MemoryProperties, MemoryRequirements,
        MemoryType, RawDevice,
    },
    layout::{DeviceAlignment, DeviceLayout},
    resource::{Buffer, Image},
};
pub use ash::vk::DeviceSize;
use std::num::NonZeroU64;


pub mod allocator;
pub mod block;
mod budget;
pub mod collection;
pub mod device;
pub mod layout;
mod resource;
pub mod suballocator;
pub mod vulkan;

/// A [`DeviceSize`] that is known not to equal zero.
pub type NonZeroDeviceSize = NonZeroU64;

/// A helper type for non-exhaustive structs.
///
/// This type cannot be constructed outside this crate. Structures with a field of this type can
/// only be constructed by calling a constructor function or `Default::default()`. The effect is
/// similar to the standard Rust `#[non_exhaustive]` attribute, except that it does not prevent
/// update syntax from being used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NonExhaustive(pub(crate) ());
