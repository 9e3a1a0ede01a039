// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use crate::block::Region;
use ash::vk;

/// A buffer bound to the region it was allocated.
///
/// Dropping a `Buffer` leaks both the buffer and its region. Give it back through
/// [`GenericMemoryAllocator::destroy_buffer`] instead.
///
/// [`GenericMemoryAllocator::destroy_buffer`]: crate::GenericMemoryAllocator::destroy_buffer
#[derive(Debug)]
#[must_use = "the buffer and its region leak unless given back to the allocator"]
pub struct Buffer {
    handle: vk::Buffer,
    region: Region,
}

impl Buffer {
    pub(crate) fn new(handle: vk::Buffer, region: Region) -> Self {
        Buffer { handle, region }
    }

    #[inline]
    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    /// Returns the region that the buffer is bound to.
    #[inline]
    pub fn region(&self) -> &Region {
        &self.region
    }

    /// Splits the buffer into its handle and its region, which then have to be destroyed and
    /// freed separately.
    #[inline]
    pub fn into_parts(self) -> (vk::Buffer, Region) {
        (self.handle, self.region)
    }
}

/// An image bound to the region it was allocated.
///
/// Dropping an `Image` leaks both the image and its region. Give it back through
/// [`GenericMemoryAllocator::destroy_image`] instead.
///
/// [`GenericMemoryAllocator::destroy_image`]: crate::GenericMemoryAllocator::destroy_image
#[derive(Debug)]
#[must_use = "the image and its region leak unless given back to the allocator"]
pub struct Image {
    handle: vk::Image,
    extent: [u32; 3],
    region: Region,
}

impl Image {
    pub(crate) fn new(handle: vk::Image, extent: [u32; 3], region: Region) -> Self {
        Image {
            handle,
            extent,
            region,
        }
    }

    #[inline]
    pub fn handle(&self) -> vk::Image {
        self.handle
    }

    /// Returns the width, height and depth of the image.
    #[inline]
    pub fn extent(&self) -> [u32; 3] {
        self.extent
    }

    /// Returns the region that the image is bound to.
    #[inline]
    pub fn region(&self) -> &Region {
        &self.region
    }

    /// Splits the image into its handle and its region, which then have to be destroyed and
    /// freed separately.
    #[inline]
    pub fn into_parts(self) -> (vk::Image, Region) {
        (self.handle, self.region)
    }
}
