// Copyright (C) 2022 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

#![deny(missing_docs)]

//! DMA controller for user space device emulation.
//!
//! The controller owns a private 64-bit DMA address space. Foreign memory is
//! made available to it in linear chunks called regions, each registered at a
//! unique, non-overlapping span of the DMA address space and optionally
//! backed by a file which gets mapped into the process at registration time.
//!
//! To perform DMA, a device first translates DMA addresses into a
//! scatter-gather list of [`DmaSg`] entries with
//! [`DmaController::translate()`], then turns the list into buffer views with
//! [`DmaController::map_sg()`] and releases it with
//! [`DmaController::unmap_sg()`] when done. Mapping never creates new
//! mappings, it only hands out views into the regions mapped at registration.
//!
//! Writes performed through write-capable translations are recorded in
//! per-region dirty page bitmaps while dirty page logging is enabled.

use std::io::Error as IOError;
use std::ops::BitOr;

use vm_memory::mmap::MmapRegionError;

mod controller;
pub use self::controller::DmaController;

mod dirty;
pub use self::dirty::{bitmap_size, DirtyBitmap};

mod mapping;

mod region;
pub use self::region::DmaRegion;

mod translate;
pub use self::translate::{DmaSg, RegionHint};

/// Errors associated with DMA address space management.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The new region overlaps the region registered at the given slot.
    #[error("dma region overlaps with existing region {0}")]
    Conflict(usize),

    /// The region table is full.
    #[error("too many dma regions, maximum is {0}")]
    CapacityExceeded(usize),

    /// The scatter-gather list can't hold all entries, the value is the number needed.
    #[error("scatter-gather list too small, {0} entries needed")]
    SgListTooSmall(usize),

    /// Malformed span or span hitting unregistered address space.
    #[error("invalid dma address range (0x{0:x}, 0x{1:x})")]
    InvalidRange(u64, u64),

    /// Write access requested against a read-only region.
    #[error("write access denied at dma address 0x{0:x}")]
    AccessViolation(u64),

    /// The region has no host accessible mapping.
    #[error("dma region {0} is not mappable")]
    NotMappable(usize),

    /// Invalid input parameter.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// No region is registered at the given span.
    #[error("no dma region at (0x{0:x}, 0x{1:x})")]
    NotFound(u64, u64),

    /// The unregister callback refused to release the region.
    #[error("dma region unregister callback failed")]
    Unregister(#[source] IOError),

    /// Failed to map the backing storage of a region.
    #[error("cannot map dma region")]
    Mmap(#[source] MmapRegionError),

    /// Dirty page logging hasn't been started.
    #[error("dirty page logging is not enabled")]
    DirtyLoggingDisabled,

    /// The page size doesn't match the one dirty page logging was started with.
    #[error("dirty page size 0x{0:x} doesn't match active page size 0x{1:x}")]
    PageSizeMismatch(usize, usize),
}

/// Specialized std::result::Result for DMA operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Access rights of a DMA region or a DMA request.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DmaProt(u32);

impl DmaProt {
    /// No access.
    pub const NONE: DmaProt = DmaProt(0);
    /// Read access.
    pub const READ: DmaProt = DmaProt(libc::PROT_READ as u32);
    /// Write access.
    pub const WRITE: DmaProt = DmaProt(libc::PROT_WRITE as u32);
    /// Read and write access.
    pub const READ_WRITE: DmaProt = DmaProt((libc::PROT_READ | libc::PROT_WRITE) as u32);

    /// Build from `PROT_*` bits, unknown bits are dropped.
    pub fn from_bits(bits: u32) -> Self {
        DmaProt(bits & Self::READ_WRITE.0)
    }

    /// Raw `PROT_*` bits.
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Check whether all rights in `other` are granted.
    pub fn contains(&self, other: DmaProt) -> bool {
        self.0 & other.0 == other.0
    }

    /// Check whether write access is granted.
    pub fn is_writable(&self) -> bool {
        self.contains(Self::WRITE)
    }
}

impl BitOr for DmaProt {
    type Output = DmaProt;

    fn bitor(self, rhs: DmaProt) -> DmaProt {
        DmaProt(self.0 | rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dma_prot() {
        assert!(DmaProt::READ_WRITE.contains(DmaProt::READ));
        assert!(DmaProt::READ_WRITE.is_writable());
        assert!(!DmaProt::READ.is_writable());
        assert!(DmaProt::READ.contains(DmaProt::NONE));
        assert_eq!(DmaProt::READ | DmaProt::WRITE, DmaProt::READ_WRITE);
        assert_eq!(DmaProt::from_bits(0xff), DmaProt::READ_WRITE);
        assert_eq!(DmaProt::from_bits(0), DmaProt::NONE);
    }
}
