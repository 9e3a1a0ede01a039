// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Suballocators are used to divide a [`Block`] into smaller *suballocations*.
//!
//! # Margins
//!
//! Every suballocation can be surrounded by a margin of padding on both ends. The margin belongs
//! to the suballocation as far as the bookkeeping is concerned: it is unavailable while the
//! suballocation is live and is returned to the free space together with it.
//!
//! # Registering free ranges
//!
//! Not every free range is worth searching. Free ranges smaller than the *minimum free region
//! size* are still part of the address-ordered list, but they are not entered into the index of
//! ranges that allocations are searched in. Such a range becomes searchable again once it is
//! coalesced with a neighbor that is freed.
//!
//! # Buffer-image granularity
//!
//! The driver requires that linear resources (buffers, linear images) and non-linear resources
//! (optimal images) bound to the same memory don't share a *page* whose size is the
//! buffer-image granularity. Suballocators are given the [`AllocationType`] of each request and
//! move suballocations to the next page where a neighbor of a conflicting type would otherwise
//! share a page with them.
//!
//! [`Block`]: crate::block::Block

pub use self::free_list::{FreeListAllocator, Suballocations};
use crate::{
    device::ImageTiling,
    layout::{align_down, DeviceAlignment, DeviceLayout},
    DeviceSize, NonExhaustive,
};
use std::{
    error::Error,
    fmt::{self, Display},
};

mod free_list;
mod host;

/// Suballocators are used to divide a *region* of device memory into smaller *suballocations*.
///
/// # Safety
///
/// First consider using the provided implementation as there should be no reason to implement
/// this trait, but if you **must**:
///
/// - `allocate` must return a suballocation that is in bounds of the region, with its margins.
/// - `allocate` must return a suballocation that doesn't alias any other currently allocated
///   suballocation, margins included, and that doesn't share a page whose size is given by the
///   buffer-image granularity with a neighbor of a conflicting [`AllocationType`].
/// - A suballocation must stay allocated until `deallocate` is called on it or the suballocator
///   is dropped.
/// - `free_size` must account for every byte that is not part of a live suballocation or its
///   margins, whether or not the range it belongs to is registered.
pub unsafe trait Suballocator {
    /// The iterator returned by [`suballocations`].
    ///
    /// [`suballocations`]: Self::suballocations
    type Suballocations<'a>: Iterator<Item = SuballocationNode>
    where
        Self: Sized + 'a;

    /// Creates a new suballocator for a region of the given size.
    fn new(create_info: SuballocatorCreateInfo) -> Self
    where
        Self: Sized;

    /// Creates a new suballocation within the region.
    ///
    /// # Arguments
    ///
    /// - `layout` - The layout of the allocation, not counting the margins.
    ///
    /// - `allocation_type` - The type of resources that can be bound to the allocation.
    ///
    /// - `buffer_image_granularity` - The buffer-image granularity device property. If all
    ///   allocations made with this suballocator are of the same type, this can be
    ///   [`DeviceAlignment::MIN`].
    fn allocate(
        &mut self,
        layout: DeviceLayout,
        allocation_type: AllocationType,
        buffer_image_granularity: DeviceAlignment,
    ) -> Result<Suballocation, SuballocatorError>;

    /// Deallocates the given `suballocation`, together with its margins.
    ///
    /// # Safety
    ///
    /// - `suballocation` must refer to a **currently allocated** suballocation of `self`.
    unsafe fn deallocate(&mut self, suballocation: Suballocation);

    /// Returns the total amount of free space that is left in the region, including free ranges
    /// that are too small to be registered.
    fn free_size(&self) -> DeviceSize;

    /// Returns `true` if there are no live suballocations.
    fn is_empty(&self) -> bool;

    /// Tries to free some space, if applicable.
    ///
    /// This is where defragmentation would go. The provided implementation does nothing.
    fn cleanup(&mut self);

    /// Returns an iterator over all nodes of the region in address order, free ones included.
    fn suballocations(&self) -> Self::Suballocations<'_>
    where
        Self: Sized;
}

/// Parameters to create a new [`Suballocator`].
#[derive(Clone, Debug)]
pub struct SuballocatorCreateInfo {
    /// The size of the region in bytes.
    ///
    /// The default value is `0`, which must be overridden.
    pub size: DeviceSize,

    /// The padding in bytes that is reserved on both ends of every suballocation.
    ///
    /// The default value is `0`.
    pub margin_size: DeviceSize,

    /// Free ranges smaller than this are not searched when allocating.
    ///
    /// The default value is `0`, which means all free ranges are registered.
    pub minimum_free_region_size: DeviceSize,

    pub _ne: NonExhaustive,
}

impl Default for SuballocatorCreateInfo {
    #[inline]
    fn default() -> Self {
        SuballocatorCreateInfo {
            size: 0,
            margin_size: 0,
            minimum_free_region_size: 0,
            _ne: NonExhaustive(()),
        }
    }
}

impl SuballocatorCreateInfo {
    pub(crate) fn validate(&self) {
        assert!(self.size > 0, "the region size must be non-zero");
        assert!(
            self.size <= DeviceLayout::MAX_SIZE,
            "the region size must not exceed `DeviceLayout::MAX_SIZE`",
        );
        assert!(
            self.margin_size <= self.size,
            "the margin size must not exceed the region size",
        );
    }
}

/// Tells the [suballocator] what type of resource will be bound to the allocation, so that it can
/// optimize memory usage while still respecting the buffer-image granularity.
///
/// [suballocator]: Suballocator
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AllocationType {
    /// The type of resource is unknown, it might be either linear or non-linear. What this means
    /// is that allocations created with this type must always be aligned to the buffer-image
    /// granularity.
    Unknown = 0,

    /// The resource is linear, e.g. buffers, linear images. A linear allocation following another
    /// linear allocation never needs to be aligned to the buffer-image granularity.
    Linear = 1,

    /// The resource is non-linear, e.g. optimal images. A non-linear allocation following another
    /// non-linear allocation never needs to be aligned to the buffer-image granularity.
    NonLinear = 2,
}

impl From<ImageTiling> for AllocationType {
    #[inline]
    fn from(tiling: ImageTiling) -> Self {
        match tiling {
            ImageTiling::Optimal => AllocationType::NonLinear,
            ImageTiling::Linear => AllocationType::Linear,
        }
    }
}

/// An opaque handle identifying a suballocation within its suballocator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AllocationHandle(usize);

impl AllocationHandle {
    /// Creates an `AllocationHandle` from an index.
    #[inline]
    pub const fn from_index(index: usize) -> Self {
        AllocationHandle(index)
    }

    /// Returns the index that the handle was created from.
    #[inline]
    pub const fn as_index(self) -> usize {
        self.0
    }
}

/// An allocation made using a [suballocator].
///
/// [suballocator]: Suballocator
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Suballocation {
    /// The offset of the allocation from the start of the region. This is aligned to the
    /// requested alignment and lies past the leading margin.
    pub offset: DeviceSize,

    /// The size of the allocation. This is exactly the requested size, without the margins.
    pub size: DeviceSize,

    /// The type of resources that can be bound to this allocation. This is exactly the requested
    /// allocation type.
    pub allocation_type: AllocationType,

    /// An opaque handle identifying the allocation within the suballocator.
    pub handle: AllocationHandle,
}

/// Error that can be returned when creating a [suballocation] using a [suballocator].
///
/// [suballocation]: Suballocation
/// [suballocator]: Suballocator
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SuballocatorError {
    /// There is no more space available in the region.
    OutOfRegionMemory,

    /// The region has enough free space to satisfy the request but is too fragmented.
    FragmentedRegion,
}

impl Error for SuballocatorError {}

impl Display for SuballocatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::OutOfRegionMemory => "out of region memory",
            Self::FragmentedRegion => "the region is too fragmented",
        };

        f.write_str(msg)
    }
}

/// A node within a [suballocator]'s list of suballocations.
///
/// [suballocator]: Suballocator
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SuballocationNode {
    /// The offset of the node from the start of the region. For allocated nodes this is where
    /// the leading margin starts.
    pub offset: DeviceSize,

    /// The size of the node, margins included.
    pub size: DeviceSize,

    /// Tells us if the node is free, and if not, what type of resources can be bound to it.
    pub allocation_type: SuballocationType,
}

/// Tells us if a node within a [suballocator]'s list of suballocations is free, and if not, what
/// type of resources can be bound to it.
///
/// [suballocator]: Suballocator
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SuballocationType {
    /// The type of resource is unknown, it might be either linear or non-linear.
    Unknown = 0,

    /// The resource is linear, e.g. buffers, linear images.
    Linear = 1,

    /// The resource is non-linear, e.g. optimal images.
    NonLinear = 2,

    /// The node is free. It can take on any of the allocation types once allocated.
    Free = 3,
}

impl From<AllocationType> for SuballocationType {
    #[inline]
    fn from(ty: AllocationType) -> Self {
        match ty {
            AllocationType::Unknown => SuballocationType::Unknown,
            AllocationType::Linear => SuballocationType::Linear,
            AllocationType::NonLinear => SuballocationType::NonLinear,
        }
    }
}

/// Checks if resources A and B share a page.
///
/// > **Note**: Assumes `a_offset + a_size > 0` and `a_offset + a_size <= b_offset`.
fn are_blocks_on_same_page(
    a_offset: DeviceSize,
    a_size: DeviceSize,
    b_offset: DeviceSize,
    page_size: DeviceAlignment,
) -> bool {
    debug_assert!(a_offset + a_size > 0);
    debug_assert!(a_offset + a_size <= b_offset);

    let a_end = a_offset + a_size - 1;
    let a_end_page = align_down(a_end, page_size);
    let b_start_page = align_down(b_offset, page_size);

    a_end_page == b_start_page
}

/// Checks if a resource of type `ty` must not share a page with the allocated neighbor of type
/// `neighbor_ty`.
fn has_granularity_conflict(neighbor_ty: SuballocationType, ty: AllocationType) -> bool {
    match neighbor_ty {
        SuballocationType::Free => false,
        SuballocationType::Unknown => true,
        _ => neighbor_ty != ty.into(),
    }
}
