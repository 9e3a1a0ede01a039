// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use crate::{
    device::{HeapBudget, MemoryHeap},
    DeviceSize,
};

/// A snapshot of the memory usage of one memory type, and an estimate of the usage and budget of
/// the heap it resides in.
///
/// This is advisory: the allocator doesn't consult it when allocating. Use
/// [`GenericMemoryAllocator::get_budget`] to get a fresh one.
///
/// [`GenericMemoryAllocator::get_budget`]: crate::GenericMemoryAllocator::get_budget
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MemoryBudget {
    /// How many bytes of the heap the process can use without degrading performance or failing.
    pub estimated_budget: DeviceSize,

    /// How many bytes of the heap the process currently uses.
    pub estimated_usage: DeviceSize,

    /// The bytes taken up by regions of the memory type, including their margins.
    pub total_allocated_region_size: DeviceSize,

    /// The size of all blocks of the memory type.
    pub total_block_size: DeviceSize,

    /// The number of blocks of the memory type.
    pub block_count: usize,
}

impl MemoryBudget {
    /// Combines the totals of a memory type with the estimate for its heap. Without an estimate
    /// from the driver, the usage is the size of all blocks in the heap and the budget is 80% of
    /// the heap.
    pub(crate) fn new(
        heap_budget: Option<HeapBudget>,
        memory_heap: &MemoryHeap,
        heap_block_size: impl FnOnce() -> DeviceSize,
        block_count: usize,
        total_block_size: DeviceSize,
        total_allocated_region_size: DeviceSize,
    ) -> Self {
        let HeapBudget { usage, budget } = heap_budget.unwrap_or_else(|| HeapBudget {
            usage: heap_block_size(),
            budget: memory_heap.size / 10 * 8,
        });

        MemoryBudget {
            estimated_budget: budget,
            estimated_usage: usage,
            total_allocated_region_size,
            total_block_size,
            block_count,
        }
    }

    /// Returns how many more bytes the process can use in the heap, according to the estimate.
    #[inline]
    pub fn estimated_headroom(&self) -> DeviceSize {
        self.estimated_budget.saturating_sub(self.estimated_usage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk;

    const HEAP: MemoryHeap = MemoryHeap {
        size: 1000,
        flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
    };

    #[test]
    fn driver_estimate_wins() {
        let budget = MemoryBudget::new(
            Some(HeapBudget {
                usage: 300,
                budget: 900,
            }),
            &HEAP,
            || unreachable!(),
            2,
            200,
            50,
        );

        assert_eq!(
            budget,
            MemoryBudget {
                estimated_budget: 900,
                estimated_usage: 300,
                total_allocated_region_size: 50,
                total_block_size: 200,
                block_count: 2,
            },
        );
        assert_eq!(budget.estimated_headroom(), 600);
    }

    #[test]
    fn fallback_estimate() {
        let budget = MemoryBudget::new(None, &HEAP, || 850, 1, 100, 0);

        assert_eq!(budget.estimated_budget, 800);
        assert_eq!(budget.estimated_usage, 850);
        assert_eq!(budget.estimated_headroom(), 0);
    }
}
