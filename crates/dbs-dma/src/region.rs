// Copyright (C) 2022 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::convert::TryFrom;
use std::sync::atomic::{AtomicUsize, Ordering};

use vm_memory::{Address, FileOffset, GuestAddress, GuestUsize, MmapRegion};

use crate::dirty::DirtyBitmap;
use crate::{DmaProt, Error, Result};

/// A linear chunk of foreign memory registered in the DMA address space.
#[derive(Debug)]
pub struct DmaRegion {
    /// Base address of the region in the DMA address space.
    base: GuestAddress,
    /// Size of the region.
    size: GuestUsize,
    /// Access rights enforced by address translation.
    prot: DmaProt,
    /// Offset of the region into its backing file.
    file_offset: Option<u64>,
    /// Host mapping of the backing file, `None` for translation only regions.
    mapping: Option<MmapRegion>,
    /// Number of outstanding buffer views handed out by `map_sg()`.
    refcnt: AtomicUsize,
    /// Dirty page bitmap, present while dirty page logging is enabled.
    dirty: Option<DirtyBitmap>,
}

impl DmaRegion {
    /// Create a region, mapping the backing file read/write if there is one.
    ///
    /// The mapping always grants read and write access, `prot` is only
    /// enforced when translating DMA addresses.
    pub(crate) fn new(
        base: GuestAddress,
        size: GuestUsize,
        file_offset: Option<FileOffset>,
        prot: DmaProt,
    ) -> Result<Self> {
        if size == 0 || base.checked_add(size).is_none() {
            return Err(Error::InvalidRange(base.raw_value(), size));
        }

        let start = file_offset.as_ref().map(|f| f.start());
        let mapping = match file_offset {
            Some(file_offset) => {
                let len = usize::try_from(size)
                    .map_err(|_| Error::InvalidRange(base.raw_value(), size))?;
                let mmap = MmapRegion::<()>::build(
                    Some(file_offset),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                )
                .map_err(Error::Mmap)?;
                Some(mmap)
            }
            None => None,
        };

        Ok(DmaRegion {
            base,
            size,
            prot,
            file_offset: start,
            mapping,
            refcnt: AtomicUsize::new(0),
            dirty: None,
        })
    }

    /// Get the base address of the region.
    pub fn start_addr(&self) -> GuestAddress {
        self.base
    }

    /// Get the size of the region.
    pub fn len(&self) -> GuestUsize {
        self.size
    }

    /// Get the first address past the end of the region.
    pub fn end_addr(&self) -> GuestAddress {
        // Safe because the span was validated on creation.
        self.base.unchecked_add(self.size)
    }

    /// Get the access rights of the region.
    pub fn prot(&self) -> DmaProt {
        self.prot
    }

    /// Get the offset into the backing file, if any.
    pub fn file_offset(&self) -> Option<u64> {
        self.file_offset
    }

    /// Check whether the region has a host mapping.
    pub fn is_mappable(&self) -> bool {
        self.mapping.is_some()
    }

    /// Get the host mapping of the region.
    pub fn mapping(&self) -> Option<&MmapRegion> {
        self.mapping.as_ref()
    }

    /// Get the host address where the region is mapped.
    pub fn host_addr(&self) -> Option<*mut u8> {
        self.mapping.as_ref().map(|m| m.as_ptr())
    }

    /// Get the number of outstanding buffer views.
    pub fn refcnt(&self) -> usize {
        self.refcnt.load(Ordering::Acquire)
    }

    /// Check whether `addr` falls into the region.
    pub fn contains(&self, addr: GuestAddress) -> bool {
        addr >= self.base && addr < self.end_addr()
    }

    /// Check whether the region intersects the span `[base, base + size)`.
    pub fn intersect_with(&self, base: GuestAddress, size: GuestUsize) -> bool {
        let end = match base.checked_add(size) {
            Some(addr) => addr,
            // Treat invalid ranges as intersecting always.
            None => return true,
        };

        !(end <= self.base || base >= self.end_addr())
    }

    pub(crate) fn get(&self) {
        self.refcnt.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn put(&self) {
        let _ = self
            .refcnt
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
    }

    /// Get the dirty page bitmap, present while dirty page logging is enabled.
    pub fn dirty_bitmap(&self) -> Option<&DirtyBitmap> {
        self.dirty.as_ref()
    }

    pub(crate) fn set_dirty_bitmap(&mut self, bitmap: Option<DirtyBitmap>) {
        self.dirty = bitmap;
    }

    /// Record a write to `[offset, offset + len)`, relative to the region base.
    pub(crate) fn mark_dirty(&self, offset: u64, len: u64) {
        if let Some(bitmap) = self.dirty.as_ref() {
            bitmap.set_range(offset, len);
        }
    }
}
