// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Sizes and alignments of memory blocks, expressed in [`DeviceSize`]s.

use crate::{DeviceSize, NonZeroDeviceSize};
use std::{
    cmp,
    error::Error,
    fmt::{self, Debug, Display},
};

/// Vulkan analog of std's [`Layout`], represented using [`DeviceSize`]s.
///
/// Unlike `Layout`s, `DeviceLayout`s are required to have non-zero size.
///
/// [`Layout`]: std::alloc::Layout
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeviceLayout {
    size: NonZeroDeviceSize,
    alignment: DeviceAlignment,
}

impl DeviceLayout {
    /// The maximum size of a memory block after its layout's size has been rounded up to the
    /// nearest multiple of its layout's alignment.
    ///
    /// Keeping every layout below this bound means that offsets inside a block can be aligned
    /// and extended by a layout's size without overflowing.
    pub const MAX_SIZE: DeviceSize = DeviceAlignment::MAX.as_devicesize() - 1;

    /// Creates a new `DeviceLayout` from the given `size` and `alignment`.
    ///
    /// Returns [`None`] if `size` is zero, `alignment` is not a power of two, or if `size` would
    /// exceed [`DeviceLayout::MAX_SIZE`] when rounded up to the nearest multiple of `alignment`.
    #[inline]
    pub const fn from_size_alignment(size: DeviceSize, alignment: DeviceSize) -> Option<Self> {
        match (NonZeroDeviceSize::new(size), DeviceAlignment::new(alignment)) {
            (Some(size), Some(alignment)) => DeviceLayout::new(size, alignment),
            _ => None,
        }
    }

    /// Creates a new `DeviceLayout` from the given `size` and `alignment`.
    ///
    /// Returns [`None`] if `size` would exceed [`DeviceLayout::MAX_SIZE`] when rounded up to the
    /// nearest multiple of `alignment`.
    #[inline]
    pub const fn new(size: NonZeroDeviceSize, alignment: DeviceAlignment) -> Option<Self> {
        // `DeviceLayout::MAX_SIZE` is `DeviceAlignment::MAX - 1`, so this can't overflow.
        let max_size = DeviceLayout::MAX_SIZE - (alignment.as_devicesize() - 1);

        if size.get() > max_size {
            None
        } else {
            Some(DeviceLayout { size, alignment })
        }
    }

    /// Returns the minimum size in bytes for a memory block of this layout.
    #[inline]
    pub const fn size(&self) -> DeviceSize {
        self.size.get()
    }

    /// Returns the minimum alignment for a memory block of this layout.
    #[inline]
    pub const fn alignment(&self) -> DeviceAlignment {
        self.alignment
    }

    /// Creates a new `DeviceLayout` from `self` that is also aligned to `alignment` at minimum.
    ///
    /// Returns [`None`] if `self.size()` would overflow [`DeviceLayout::MAX_SIZE`] when rounded up
    /// to the nearest multiple of `alignment`.
    #[inline]
    pub fn align_to(&self, alignment: DeviceAlignment) -> Option<Self> {
        DeviceLayout::new(self.size, cmp::max(self.alignment, alignment))
    }
}

/// Vulkan analog of std's `Alignment`, stored as a [`DeviceSize`] that is guaranteed to be a
/// valid alignment, i.e. a power of two in the range \[1,&nbsp;2<sup>63</sup>\].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAlignment(NonZeroDeviceSize);

impl DeviceAlignment {
    /// The smallest possible alignment, 1.
    pub const MIN: Self = DeviceAlignment(match NonZeroDeviceSize::new(1) {
        Some(val) => val,
        None => unreachable!(),
    });

    /// The largest possible alignment, 2<sup>63</sup>.
    pub const MAX: Self = DeviceAlignment(match NonZeroDeviceSize::new(1 << 63) {
        Some(val) => val,
        None => unreachable!(),
    });

    /// Returns the alignment as a [`DeviceSize`].
    #[inline]
    pub const fn as_devicesize(self) -> DeviceSize {
        self.0.get()
    }

    /// Returns the alignment as a [`NonZeroDeviceSize`].
    #[inline]
    pub const fn as_nonzero(self) -> NonZeroDeviceSize {
        self.0
    }

    /// Creates a `DeviceAlignment` from a [`DeviceSize`] if it's a power of two, otherwise
    /// returns [`None`].
    #[inline]
    pub const fn new(alignment: DeviceSize) -> Option<Self> {
        if alignment.is_power_of_two() {
            match NonZeroDeviceSize::new(alignment) {
                Some(alignment) => Some(DeviceAlignment(alignment)),
                None => None,
            }
        } else {
            None
        }
    }

    /// Returns the base-2 logarithm of the alignment.
    #[inline]
    pub const fn log2(self) -> u32 {
        self.0.trailing_zeros()
    }
}

impl Debug for DeviceAlignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (1 << {:?})", self.as_nonzero(), self.log2())
    }
}

impl Default for DeviceAlignment {
    #[inline]
    fn default() -> Self {
        DeviceAlignment::MIN
    }
}

impl TryFrom<DeviceSize> for DeviceAlignment {
    type Error = TryFromIntError;

    #[inline]
    fn try_from(val: DeviceSize) -> Result<Self, Self::Error> {
        DeviceAlignment::new(val).ok_or(TryFromIntError)
    }
}

impl From<DeviceAlignment> for DeviceSize {
    #[inline]
    fn from(alignment: DeviceAlignment) -> Self {
        alignment.as_devicesize()
    }
}

/// Error that can happen when converting an integer that is not a power of two into a
/// [`DeviceAlignment`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TryFromIntError;

impl Error for TryFromIntError {}

impl Display for TryFromIntError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("attempted to convert a value that is not a power of two to an alignment")
    }
}

/// Rounds the given `val` up to the nearest multiple of `alignment`.
///
/// `val` must not exceed [`DeviceLayout::MAX_SIZE`], otherwise the result wraps around.
#[inline(always)]
pub const fn align_up(val: DeviceSize, alignment: DeviceAlignment) -> DeviceSize {
    align_down(val.wrapping_add(alignment.as_devicesize() - 1), alignment)
}

/// Rounds the given `val` down to the nearest multiple of `alignment`.
#[inline(always)]
pub const fn align_down(val: DeviceSize, alignment: DeviceAlignment) -> DeviceSize {
    val & !(alignment.as_devicesize() - 1)
}

/// Checks whether the given `val` is a multiple of `alignment`.
#[inline(always)]
pub const fn is_aligned(val: DeviceSize, alignment: DeviceAlignment) -> bool {
    val & (alignment.as_devicesize() - 1) == 0
}

/// Rounds `val` up to a multiple of `alignment`, returning [`None`] if the result would exceed
/// [`DeviceLayout::MAX_SIZE`].
#[inline]
pub(crate) fn checked_align_up(val: DeviceSize, alignment: DeviceAlignment) -> Option<DeviceSize> {
    let aligned = align_down(val.checked_add(alignment.as_devicesize() - 1)?, alignment);

    (aligned <= DeviceLayout::MAX_SIZE).then_some(aligned)
}
