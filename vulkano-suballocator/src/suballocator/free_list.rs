// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::{
    are_blocks_on_same_page, has_granularity_conflict,
    host::{PoolAllocator, SlotId},
    AllocationHandle, AllocationType, Suballocation, SuballocationNode, SuballocationType,
    Suballocator, SuballocatorCreateInfo, SuballocatorError,
};
use crate::{
    layout::{checked_align_up, DeviceAlignment, DeviceLayout},
    DeviceSize,
};
use std::cmp;

/// A [suballocator] that uses the most generic [free-list].
///
/// The region is covered by a doubly linked list of nodes in address order, each of which is
/// either free or allocated, and no two free nodes are ever adjacent. Free nodes that are at least
/// as large as the minimum free region size are additionally kept in a list sorted by offset,
/// which allocations search first-fit. When a suballocation is freed it is coalesced with its
/// free neighbors, registered or not.
///
/// # Efficiency
///
/// Allocation is *O*(*n*) in the number of registered free ranges in the worst case, and freeing
/// is *O*(log(*n*)) plus the cost of keeping the list sorted.
///
/// [suballocator]: Suballocator
/// [free-list]: Suballocator#free-lists
#[derive(Debug)]
pub struct FreeListAllocator {
    size: DeviceSize,
    margin_size: DeviceSize,
    minimum_free_region_size: DeviceSize,
    // Total memory remaining in the region, registered or not.
    free_size: DeviceSize,
    nodes: PoolAllocator<SuballocationListNode>,
    head: SlotId,
    // Registered free nodes sorted by offset in ascending order.
    free_list: Vec<SlotId>,
}

#[derive(Clone, Copy, Debug)]
struct SuballocationListNode {
    prev: Option<SlotId>,
    next: Option<SlotId>,
    offset: DeviceSize,
    size: DeviceSize,
    ty: SuballocationType,
}

unsafe impl Suballocator for FreeListAllocator {
    type Suballocations<'a> = Suballocations<'a>;

    /// Creates a new `FreeListAllocator` for a region of the given size.
    ///
    /// # Panics
    ///
    /// - Panics if `create_info.size` is zero or exceeds [`DeviceLayout::MAX_SIZE`].
    /// - Panics if `create_info.margin_size` exceeds `create_info.size`.
    fn new(create_info: SuballocatorCreateInfo) -> Self {
        const AVERAGE_ALLOCATION_SIZE: DeviceSize = 64 * 1024;

        create_info.validate();

        let SuballocatorCreateInfo {
            size,
            margin_size,
            minimum_free_region_size,
            _ne: _,
        } = create_info;

        let capacity = cmp::min(size / AVERAGE_ALLOCATION_SIZE, 1 << 16) as usize;
        let mut nodes = PoolAllocator::new(capacity + 64);
        let mut free_list = Vec::with_capacity(capacity / 16 + 16);
        let root_id = nodes.allocate(SuballocationListNode {
            prev: None,
            next: None,
            offset: 0,
            size,
            ty: SuballocationType::Free,
        });
        free_list.push(root_id);

        FreeListAllocator {
            size,
            margin_size,
            minimum_free_region_size,
            free_size: size,
            nodes,
            head: root_id,
            free_list,
        }
    }

    /// Creates a new suballocation within the region.
    ///
    /// # Errors
    ///
    /// - Returns [`OutOfRegionMemory`] if there is not enough free space in total.
    /// - Returns [`FragmentedRegion`] if there is enough free space in total, but no registered
    ///   free range can fit the suballocation with its margins.
    ///
    /// [`OutOfRegionMemory`]: SuballocatorError::OutOfRegionMemory
    /// [`FragmentedRegion`]: SuballocatorError::FragmentedRegion
    fn allocate(
        &mut self,
        layout: DeviceLayout,
        allocation_type: AllocationType,
        buffer_image_granularity: DeviceAlignment,
    ) -> Result<Suballocation, SuballocatorError> {
        let size = layout.size();
        let margin = self.margin_size;

        let found = self.free_list.iter().enumerate().find_map(|(index, &id)| {
            self.fit(id, layout, allocation_type, buffer_image_granularity)
                .map(|offset| (index, id, offset))
        });

        let Some((index, id, offset)) = found else {
            let required = size.saturating_add(margin.saturating_mul(2));

            return if self.free_size >= required {
                Err(SuballocatorError::FragmentedRegion)
            } else {
                Err(SuballocatorError::OutOfRegionMemory)
            };
        };

        self.free_list.remove(index);

        // `fit` checked that the margins and the suballocation fall within the free node, whose
        // end can't exceed `DeviceLayout::MAX_SIZE`, so none of this can overflow.
        let node_size = size + 2 * margin;
        self.split(id, offset - margin, node_size);
        self.nodes.get_mut(id).ty = allocation_type.into();
        self.free_size -= node_size;

        Ok(Suballocation {
            offset,
            size,
            allocation_type,
            handle: AllocationHandle::from_index(id.get()),
        })
    }

    #[inline]
    unsafe fn deallocate(&mut self, suballocation: Suballocation) {
        // SAFETY: The caller must uphold that the suballocation was allocated by `self`, which
        // means its handle was created from a `SlotId`.
        let node_id = unsafe { SlotId::new_unchecked(suballocation.handle.as_index()) };
        let node = self.nodes.get_mut(node_id);

        debug_assert!(node.ty != SuballocationType::Free);
        debug_assert_eq!(node.offset + self.margin_size, suballocation.offset);

        node.ty = SuballocationType::Free;
        // Node sizes are constrained by the size of the region, so they can't possibly overflow
        // when added up.
        self.free_size += node.size;

        self.coalesce(node_id);
        self.register(node_id);
    }

    #[inline]
    fn free_size(&self) -> DeviceSize {
        self.free_size
    }

    #[inline]
    fn is_empty(&self) -> bool {
        self.free_size == self.size
    }

    #[inline]
    fn cleanup(&mut self) {}

    #[inline]
    fn suballocations(&self) -> Self::Suballocations<'_> {
        Suballocations {
            nodes: &self.nodes,
            next: Some(self.head),
        }
    }
}

impl FreeListAllocator {
    /// Returns the size of the region.
    #[inline]
    pub fn size(&self) -> DeviceSize {
        self.size
    }

    /// Returns the padding that is reserved on both ends of every suballocation.
    #[inline]
    pub fn margin_size(&self) -> DeviceSize {
        self.margin_size
    }

    /// Returns the offset at which a suballocation of the given layout would start within the
    /// free node `node_id`, or `None` if it doesn't fit.
    fn fit(
        &self,
        node_id: SlotId,
        layout: DeviceLayout,
        allocation_type: AllocationType,
        buffer_image_granularity: DeviceAlignment,
    ) -> Option<DeviceSize> {
        let node = self.nodes.get(node_id);
        let margin = self.margin_size;
        let size = layout.size();

        debug_assert!(node.ty == SuballocationType::Free);

        // The node offset and the margin are both bounded by `DeviceLayout::MAX_SIZE`, so the
        // sum can't overflow.
        let mut offset = checked_align_up(node.offset + margin, layout.alignment())?;

        if let Some(prev_id) = node.prev {
            let prev = self.nodes.get(prev_id);

            // The resource of an allocated node lies between its margins.
            if has_granularity_conflict(prev.ty, allocation_type)
                && are_blocks_on_same_page(
                    prev.offset + margin,
                    prev.size - 2 * margin,
                    offset,
                    buffer_image_granularity,
                )
            {
                offset = checked_align_up(offset, buffer_image_granularity)?;
            }
        }

        let end = offset.checked_add(size)?;

        if end.checked_add(margin)? > node.offset + node.size {
            return None;
        }

        if let Some(next_id) = node.next {
            let next = self.nodes.get(next_id);

            if has_granularity_conflict(next.ty, allocation_type)
                && are_blocks_on_same_page(
                    offset,
                    size,
                    next.offset + margin,
                    buffer_image_granularity,
                )
            {
                return None;
            }
        }

        Some(offset)
    }

    /// Fits a node inside the target free one, splitting the target at the ends if required.
    /// The residual free nodes are registered if they are large enough.
    ///
    /// `offset` and `size` must refer to a subregion of the given node.
    fn split(&mut self, node_id: SlotId, offset: DeviceSize, size: DeviceSize) {
        let node = self.nodes.get(node_id);

        debug_assert!(node.ty == SuballocationType::Free);
        debug_assert!(offset >= node.offset);
        debug_assert!(offset + size <= node.offset + node.size);

        let padding_front = offset - node.offset;
        let padding_back = node.offset + node.size - offset - size;

        if padding_front > 0 {
            let padding = SuballocationListNode {
                prev: node.prev,
                next: Some(node_id),
                offset: node.offset,
                size: padding_front,
                ty: SuballocationType::Free,
            };
            let padding_id = self.nodes.allocate(padding);

            if let Some(prev_id) = padding.prev {
                self.nodes.get_mut(prev_id).next = Some(padding_id);
            } else {
                self.head = padding_id;
            }

            let node = self.nodes.get_mut(node_id);
            node.prev = Some(padding_id);
            node.offset = offset;
            node.size -= padding.size;

            self.register(padding_id);
        }

        if padding_back > 0 {
            let padding = SuballocationListNode {
                prev: Some(node_id),
                next: node.next,
                offset: offset + size,
                size: padding_back,
                ty: SuballocationType::Free,
            };
            let padding_id = self.nodes.allocate(padding);

            if let Some(next_id) = padding.next {
                self.nodes.get_mut(next_id).prev = Some(padding_id);
            }

            let node = self.nodes.get_mut(node_id);
            node.next = Some(padding_id);
            node.size -= padding.size;

            self.register(padding_id);
        }
    }

    /// Coalesces the target free node with adjacent ones that are also free.
    fn coalesce(&mut self, node_id: SlotId) {
        let node = self.nodes.get(node_id);

        debug_assert!(node.ty == SuballocationType::Free);

        if let Some(prev_id) = node.prev {
            let prev = self.nodes.get(prev_id);

            if prev.ty == SuballocationType::Free {
                self.unregister(prev_id);

                let node = self.nodes.get_mut(node_id);
                node.prev = prev.prev;
                node.offset = prev.offset;
                node.size += prev.size;

                if let Some(prev_id) = prev.prev {
                    self.nodes.get_mut(prev_id).next = Some(node_id);
                } else {
                    self.head = node_id;
                }

                self.nodes.free(prev_id);
            }
        }

        if let Some(next_id) = node.next {
            let next = self.nodes.get(next_id);

            if next.ty == SuballocationType::Free {
                self.unregister(next_id);

                let node = self.nodes.get_mut(node_id);
                node.next = next.next;
                node.size += next.size;

                if let Some(next_id) = next.next {
                    self.nodes.get_mut(next_id).prev = Some(node_id);
                }

                self.nodes.free(next_id);
            }
        }
    }

    /// Inserts the target free node into the free-list if it is large enough to be searched.
    fn register(&mut self, node_id: SlotId) {
        let node = self.nodes.get(node_id);

        if node.size < self.minimum_free_region_size && node.size != self.size {
            return;
        }

        let nodes = &self.nodes;
        let (Ok(index) | Err(index)) = self
            .free_list
            .binary_search_by_key(&node.offset, |&id| nodes.get(id).offset);

        debug_assert!(self.free_list.get(index) != Some(&node_id));

        self.free_list.insert(index, node_id);
    }

    /// Removes the target free node from the free-list, if it was registered.
    fn unregister(&mut self, node_id: SlotId) {
        let offset = self.nodes.get(node_id).offset;
        let nodes = &self.nodes;

        // Node offsets are unique, so a match is the target node.
        if let Ok(index) = self
            .free_list
            .binary_search_by_key(&offset, |&id| nodes.get(id).offset)
        {
            debug_assert!(self.free_list[index] == node_id);

            self.free_list.remove(index);
        }
    }
}

/// An iterator over the nodes of a [`FreeListAllocator`] in address order.
#[derive(Clone, Debug)]
pub struct Suballocations<'a> {
    nodes: &'a PoolAllocator<SuballocationListNode>,
    next: Option<SlotId>,
}

impl Iterator for Suballocations<'_> {
    type Item = SuballocationNode;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.nodes.get(self.next?);
        self.next = node.next;

        Some(SuballocationNode {
            offset: node.offset,
            size: node.size,
            allocation_type: node.ty,
        })
    }
}
