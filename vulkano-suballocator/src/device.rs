// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The boundary between the allocator and the graphics driver.
//!
//! Everything the allocator needs from Vulkan goes through the [`RawDevice`] trait: enumerating
//! memory types, allocating and freeing [`DeviceMemory`], creating buffers and images, querying
//! their memory requirements and binding memory to them. [`AshDevice`] implements the trait on
//! top of `ash`; other implementations can be used to run the allocator against something other
//! than a real driver.
//!
//! [`AshDevice`]: crate::vulkan::AshDevice

use crate::{DeviceSize, NonExhaustive};
use ash::vk;
use std::{
    error::Error,
    fmt::{self, Debug, Display},
    sync::Arc,
};

/// A logical device, as seen by the allocator.
///
/// # Safety
///
/// - `memory_properties` and `properties` must return the same values for the lifetime of the
///   device.
/// - Handles returned by `allocate_memory`, `create_buffer` and `create_image` must be valid and
///   unique until they are passed to the matching `free_memory`/`destroy_*` function.
/// - `buffer_memory_requirements` and `image_memory_requirements` must return requirements that
///   only name memory types reported by `memory_properties`.
pub unsafe trait RawDevice: Send + Sync {
    /// Returns the memory types and heaps of the physical device. The order of the memory types
    /// defines the memory type indices.
    fn memory_properties(&self) -> MemoryProperties;

    /// Returns the properties of the physical device that are relevant to memory allocation.
    fn properties(&self) -> DeviceProperties;

    /// Allocates a block of device memory of `allocation_size` bytes from the given memory type.
    fn allocate_memory(
        &self,
        allocation_size: DeviceSize,
        memory_type_index: u32,
    ) -> Result<vk::DeviceMemory, DriverError>;

    /// Frees a block of device memory.
    ///
    /// # Safety
    ///
    /// - `memory` must have been returned by `allocate_memory` on `self` and not freed yet.
    /// - Nothing may be bound to `memory` that is still in use by the device.
    unsafe fn free_memory(&self, memory: vk::DeviceMemory);

    /// Creates a buffer that has no memory bound to it yet.
    fn create_buffer(&self, create_info: &BufferCreateInfo) -> Result<vk::Buffer, DriverError>;

    /// Creates an image that has no memory bound to it yet.
    fn create_image(&self, create_info: &ImageCreateInfo) -> Result<vk::Image, DriverError>;

    /// Queries the memory requirements of a buffer.
    ///
    /// # Safety
    ///
    /// - `buffer` must be a live buffer created from `self`.
    unsafe fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> MemoryRequirements;

    /// Queries the memory requirements of an image.
    ///
    /// # Safety
    ///
    /// - `image` must be a live image created from `self`.
    unsafe fn image_memory_requirements(&self, image: vk::Image) -> MemoryRequirements;

    /// Binds `memory` at `offset` to `buffer`.
    ///
    /// # Safety
    ///
    /// - `buffer` must not have memory bound to it yet.
    /// - The range starting at `offset` must satisfy the requirements of `buffer`.
    unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: DeviceSize,
    ) -> Result<(), DriverError>;

    /// Binds `memory` at `offset` to `image`.
    ///
    /// # Safety
    ///
    /// - `image` must not have memory bound to it yet.
    /// - The range starting at `offset` must satisfy the requirements of `image`.
    unsafe fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: DeviceSize,
    ) -> Result<(), DriverError>;

    /// Destroys a buffer.
    ///
    /// # Safety
    ///
    /// - `buffer` must be a live buffer created from `self` that is not in use by the device.
    unsafe fn destroy_buffer(&self, buffer: vk::Buffer);

    /// Destroys an image.
    ///
    /// # Safety
    ///
    /// - `image` must be a live image created from `self` that is not in use by the device.
    unsafe fn destroy_image(&self, image: vk::Image);

    /// Returns the current usage and budget of every memory heap, if the driver can estimate
    /// them. The entries are indexed by heap index.
    #[inline]
    fn memory_budget(&self) -> Option<Vec<HeapBudget>> {
        None
    }
}

impl Debug for dyn RawDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawDevice").finish_non_exhaustive()
    }
}

/// Properties of the memory of a physical device.
#[derive(Clone, Debug, Default)]
pub struct MemoryProperties {
    /// The available memory types.
    pub memory_types: Vec<MemoryType>,

    /// The available memory heaps.
    pub memory_heaps: Vec<MemoryHeap>,
}

/// A memory type of a physical device. This is what the allocator refers to as a
/// classification: every memory type gets its own pool of blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryType {
    /// The properties of this memory type.
    pub property_flags: vk::MemoryPropertyFlags,

    /// The index of the memory heap that this memory type corresponds to.
    pub heap_index: u32,
}

/// A memory heap of a physical device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryHeap {
    /// The size of the heap in bytes.
    pub size: DeviceSize,

    /// Attributes of the heap.
    pub flags: vk::MemoryHeapFlags,
}

/// Properties of a physical device that influence how memory is allocated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceProperties {
    /// The kind of device.
    pub device_type: vk::PhysicalDeviceType,

    /// The granularity in bytes at which linear and non-linear resources bound to the same
    /// memory must not share a page.
    pub buffer_image_granularity: DeviceSize,

    /// The size and alignment in bytes that bounds concurrent access to host-mapped memory that
    /// isn't host-coherent.
    pub non_coherent_atom_size: DeviceSize,
}

impl DeviceProperties {
    /// Returns whether the device shares its memory with the host, in which case there is no
    /// point in preferring device-local memory over other memory.
    #[inline]
    pub fn is_unified_memory(&self) -> bool {
        matches!(
            self.device_type,
            vk::PhysicalDeviceType::INTEGRATED_GPU | vk::PhysicalDeviceType::CPU,
        )
    }
}

/// Represents requirements expressed by the Vulkan implementation when it comes to binding memory
/// to a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryRequirements {
    /// Number of bytes of memory required.
    pub size: DeviceSize,

    /// Alignment of the requirement buffer. The base memory address must be a multiple
    /// of this value.
    pub alignment: DeviceSize,

    /// Indicates which memory types can be used. Each bit that is set to 1 means that the memory
    /// type whose index is the same as the position of the bit can be used.
    pub memory_type_bits: u32,
}

/// The estimated usage and budget of one memory heap, for the whole process.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapBudget {
    /// How many bytes of the heap are estimated to be in use by the process.
    pub usage: DeviceSize,

    /// How many bytes of the heap the process is estimated to be able to use before allocations
    /// start failing or performance degrades.
    pub budget: DeviceSize,
}

/// Parameters to create a buffer.
#[derive(Clone, Debug)]
pub struct BufferCreateInfo {
    /// The size in bytes of the buffer.
    ///
    /// The default value is `0`, which must be overridden.
    pub size: DeviceSize,

    /// How the buffer is going to be used.
    ///
    /// The default value is empty, which must be overridden.
    pub usage: vk::BufferUsageFlags,

    pub _ne: NonExhaustive,
}

impl Default for BufferCreateInfo {
    #[inline]
    fn default() -> Self {
        BufferCreateInfo {
            size: 0,
            usage: vk::BufferUsageFlags::empty(),
            _ne: NonExhaustive(()),
        }
    }
}

/// Parameters to create an image.
#[derive(Clone, Debug)]
pub struct ImageCreateInfo {
    /// The basic image dimensionality.
    ///
    /// The default value is [`vk::ImageType::TYPE_2D`].
    pub image_type: vk::ImageType,

    /// The format of the texels.
    ///
    /// The default value is [`vk::Format::R8G8B8A8_UNORM`].
    pub format: vk::Format,

    /// The width, height and depth of the image. Unused dimensions must be `1`.
    ///
    /// The default value is `[0, 0, 0]`, which must be overridden.
    pub extent: [u32; 3],

    /// The number of mip levels.
    ///
    /// The default value is `1`.
    pub mip_levels: u32,

    /// The number of array layers.
    ///
    /// The default value is `1`.
    pub array_layers: u32,

    /// How the texels are laid out in memory.
    ///
    /// The default value is [`ImageTiling::Optimal`].
    pub tiling: ImageTiling,

    /// How the image is going to be used.
    ///
    /// The default value is empty, which must be overridden.
    pub usage: vk::ImageUsageFlags,

    pub _ne: NonExhaustive,
}

impl Default for ImageCreateInfo {
    #[inline]
    fn default() -> Self {
        ImageCreateInfo {
            image_type: vk::ImageType::TYPE_2D,
            format: vk::Format::R8G8B8A8_UNORM,
            extent: [0; 3],
            mip_levels: 1,
            array_layers: 1,
            tiling: ImageTiling::Optimal,
            usage: vk::ImageUsageFlags::empty(),
            _ne: NonExhaustive(()),
        }
    }
}

impl ImageCreateInfo {
    /// Returns create info for an image of the given dimensions. `height` and `depth` default to
    /// `1`, and the image type is derived from which dimensions are given.
    pub fn with_dimensions(width: u32, height: Option<u32>, depth: Option<u32>) -> Self {
        let image_type = match (height, depth) {
            (_, Some(_)) => vk::ImageType::TYPE_3D,
            (Some(_), None) => vk::ImageType::TYPE_2D,
            (None, None) => vk::ImageType::TYPE_1D,
        };

        ImageCreateInfo {
            image_type,
            extent: [width, height.unwrap_or(1), depth.unwrap_or(1)],
            ..Default::default()
        }
    }
}

/// The arrangement of texels in the memory of an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageTiling {
    /// The implementation picks a layout that is efficient for the device. Such an image is a
    /// non-linear resource.
    Optimal,

    /// Texels are laid out row by row. Such an image is a linear resource.
    Linear,
}

impl From<ImageTiling> for vk::ImageTiling {
    #[inline]
    fn from(tiling: ImageTiling) -> Self {
        match tiling {
            ImageTiling::Optimal => vk::ImageTiling::OPTIMAL,
            ImageTiling::Linear => vk::ImageTiling::LINEAR,
        }
    }
}

/// Error returned by the driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriverError {
    OutOfHostMemory,
    OutOfDeviceMemory,
    TooManyObjects,
    InitializationFailed,
    DeviceLost,
    /// Any other failure. The raw result code is not kept.
    Unknown,
}

impl DriverError {
    /// Returns whether the error means that memory or allocation slots ran out.
    #[inline]
    pub fn is_out_of_memory(&self) -> bool {
        matches!(
            self,
            Self::OutOfHostMemory | Self::OutOfDeviceMemory | Self::TooManyObjects,
        )
    }
}

impl From<vk::Result> for DriverError {
    fn from(val: vk::Result) -> Self {
        match val {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => Self::OutOfHostMemory,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => Self::OutOfDeviceMemory,
            vk::Result::ERROR_TOO_MANY_OBJECTS => Self::TooManyObjects,
            vk::Result::ERROR_INITIALIZATION_FAILED => Self::InitializationFailed,
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            _ => Self::Unknown,
        }
    }
}

impl Error for DriverError {}

impl Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfHostMemory => f.write_str("a host memory allocation has failed"),
            Self::OutOfDeviceMemory => f.write_str("a device memory allocation has failed"),
            Self::TooManyObjects => {
                f.write_str("too many objects of the type have already been created")
            }
            Self::InitializationFailed => f.write_str(
                "initialization of an object could not be completed for implementation-specific \
                reasons",
            ),
            Self::DeviceLost => f.write_str("the logical or physical device has been lost"),
            Self::Unknown => f.write_str("an unknown error has occurred"),
        }
    }
}

/// Represents memory that has been allocated from the device.
///
/// The memory is freed when the `DeviceMemory` is dropped.
#[derive(Debug)]
pub struct DeviceMemory {
    handle: vk::DeviceMemory,
    device: Arc<dyn RawDevice>,
    allocation_size: DeviceSize,
    memory_type_index: u32,
}

impl DeviceMemory {
    /// Allocates a block of memory from the device.
    pub fn allocate(
        device: Arc<dyn RawDevice>,
        allocation_size: DeviceSize,
        memory_type_index: u32,
    ) -> Result<Self, DriverError> {
        let handle = device.allocate_memory(allocation_size, memory_type_index)?;

        Ok(DeviceMemory {
            handle,
            device,
            allocation_size,
            memory_type_index,
        })
    }

    /// Returns the native handle.
    #[inline]
    pub fn handle(&self) -> vk::DeviceMemory {
        self.handle
    }

    /// Returns the device that the memory was allocated from.
    #[inline]
    pub fn device(&self) -> &Arc<dyn RawDevice> {
        &self.device
    }

    /// Returns the size in bytes of the memory allocation.
    #[inline]
    pub fn allocation_size(&self) -> DeviceSize {
        self.allocation_size
    }

    /// Returns the index of the memory type that this memory was allocated from.
    #[inline]
    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }
}

impl Drop for DeviceMemory {
    #[inline]
    fn drop(&mut self) {
        unsafe { self.device.free_memory(self.handle) };
    }
}
