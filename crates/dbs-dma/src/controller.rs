// Copyright (C) 2022 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Region table of the DMA controller.

use std::io::Result as IOResult;

use log::{debug, info, warn};
use vm_memory::{Address, FileOffset, GuestAddress, GuestUsize};

use crate::dirty::DirtyBitmap;
use crate::{DmaProt, DmaRegion, Error, Result};

/// Emulated DMA controller owning the DMA address space of a device.
///
/// Regions are kept in slots whose index identifies the region until it is
/// removed. A freed slot is reused by the next registration. An index sorted
/// by base address is maintained alongside the slots to look regions up by
/// binary search.
#[derive(Debug)]
pub struct DmaController {
    pub(crate) regions: Vec<Option<DmaRegion>>,
    /// (base address, slot) of all registered regions, sorted by base address.
    order: Vec<(GuestAddress, usize)>,
    max_regions: usize,
    pub(crate) dirty_pgsize: Option<usize>,
}

impl DmaController {
    /// Create a DMA controller accepting at most `max_regions` regions.
    pub fn new(max_regions: usize) -> Self {
        DmaController {
            regions: Vec::new(),
            order: Vec::new(),
            max_regions,
            dirty_pgsize: None,
        }
    }

    /// Maximum number of regions the controller accepts.
    pub fn max_regions(&self) -> usize {
        self.max_regions
    }

    /// Number of registered regions.
    pub fn nr_regions(&self) -> usize {
        self.order.len()
    }

    /// Get the region registered at slot `index`.
    pub fn region(&self, index: usize) -> Option<&DmaRegion> {
        self.regions.get(index).and_then(Option::as_ref)
    }

    /// Iterate over `(slot, region)` pairs in address order.
    pub fn regions(&self) -> impl Iterator<Item = (usize, &DmaRegion)> + '_ {
        self.order
            .iter()
            .filter_map(move |&(_, idx)| self.region(idx).map(|r| (idx, r)))
    }

    /// Register a new region at `[addr, addr + size)`.
    ///
    /// The backing file, if any, is mapped read/write right away whatever
    /// `prot` says; `prot` is enforced by [`DmaController::translate()`].
    /// Registering the exact same region twice returns the existing slot.
    ///
    /// # Arguments
    /// * `addr` - Base address in the DMA address space
    /// * `size` - Size of the region
    /// * `file_offset` - Optional file and offset backing the region
    /// * `prot` - Access rights granted to DMA requests
    pub fn add_region(
        &mut self,
        addr: GuestAddress,
        size: GuestUsize,
        file_offset: Option<FileOffset>,
        prot: DmaProt,
    ) -> Result<usize> {
        let end = match addr.checked_add(size) {
            Some(end) if size > 0 => end,
            _ => return Err(Error::InvalidRange(addr.raw_value(), size)),
        };

        let pos = self.order.partition_point(|&(base, _)| base < addr);
        if let Some(&(base, idx)) = self.order.get(pos) {
            if let Some(region) = self.region(idx) {
                if base == addr && region.len() == size {
                    let start = file_offset.as_ref().map(|f| f.start());
                    if region.file_offset() != start || region.prot() != prot {
                        return Err(Error::InvalidArgument(
                            "region already registered with different attributes",
                        ));
                    }
                    return Ok(idx);
                }
                if region.intersect_with(addr, size) {
                    info!(
                        "dma region 0x{:x}-0x{:x} overlaps region {}",
                        addr.raw_value(),
                        end.raw_value(),
                        idx
                    );
                    return Err(Error::Conflict(idx));
                }
            }
        }
        if pos > 0 {
            let idx = self.order[pos - 1].1;
            if let Some(region) = self.region(idx) {
                if region.intersect_with(addr, size) {
                    info!(
                        "dma region 0x{:x}-0x{:x} overlaps region {}",
                        addr.raw_value(),
                        end.raw_value(),
                        idx
                    );
                    return Err(Error::Conflict(idx));
                }
            }
        }

        if self.nr_regions() >= self.max_regions {
            return Err(Error::CapacityExceeded(self.max_regions));
        }

        let mut region = DmaRegion::new(addr, size, file_offset, prot)?;
        if let Some(pgsize) = self.dirty_pgsize {
            region.set_dirty_bitmap(Some(DirtyBitmap::new(size, pgsize)));
        }

        let idx = match self.regions.iter().position(Option::is_none) {
            Some(idx) => {
                self.regions[idx] = Some(region);
                idx
            }
            None => {
                self.regions.push(Some(region));
                self.regions.len() - 1
            }
        };
        self.order.insert(pos, (addr, idx));
        debug!(
            "added dma region {} 0x{:x}-0x{:x} prot 0x{:x}",
            idx,
            addr.raw_value(),
            end.raw_value(),
            prot.bits()
        );

        Ok(idx)
    }

    /// Remove the region registered exactly at `[addr, addr + size)`.
    ///
    /// `unregister` is invoked with the region before it goes away so the
    /// owner can quiesce users of the region. Returning an error vetoes the
    /// removal and leaves the region registered.
    pub fn remove_region<F>(
        &mut self,
        addr: GuestAddress,
        size: GuestUsize,
        unregister: F,
    ) -> Result<()>
    where
        F: FnOnce(&DmaRegion) -> IOResult<()>,
    {
        let pos = self
            .order
            .binary_search_by_key(&addr, |&(base, _)| base)
            .map_err(|_| Error::NotFound(addr.raw_value(), size))?;
        let idx = self.order[pos].1;
        let region = match self.region(idx) {
            Some(region) if region.len() == size => region,
            _ => return Err(Error::NotFound(addr.raw_value(), size)),
        };

        unregister(region).map_err(Error::Unregister)?;
        if region.refcnt() > 0 {
            warn!(
                "removing dma region {} 0x{:x}-0x{:x} with {} users",
                idx,
                addr.raw_value(),
                region.end_addr().raw_value(),
                region.refcnt()
            );
        }

        self.order.remove(pos);
        // Dropping the region unmaps its backing file.
        self.regions[idx] = None;
        debug!(
            "removed dma region {} 0x{:x}-0x{:x}",
            idx,
            addr.raw_value(),
            addr.unchecked_add(size).raw_value()
        );

        Ok(())
    }

    /// Remove all regions.
    pub fn remove_regions(&mut self) {
        for (idx, region) in self.regions() {
            if region.refcnt() > 0 {
                warn!(
                    "removing dma region {} 0x{:x}-0x{:x} with {} users",
                    idx,
                    region.start_addr().raw_value(),
                    region.end_addr().raw_value(),
                    region.refcnt()
                );
            }
        }
        self.order.clear();
        self.regions.clear();
    }

    /// Remove all regions and release the controller.
    pub fn destroy(mut self) {
        self.remove_regions();
    }

    /// Find the slot of the region containing `addr`.
    pub(crate) fn find_slot(&self, addr: GuestAddress) -> Option<usize> {
        let pos = self.order.partition_point(|&(base, _)| base <= addr);
        if pos == 0 {
            return None;
        }
        let idx = self.order[pos - 1].1;
        match self.region(idx) {
            Some(region) if region.contains(addr) => Some(idx),
            _ => None,
        }
    }

    /// Find the region containing `addr`.
    pub(crate) fn find_region(&self, addr: GuestAddress) -> Option<&DmaRegion> {
        self.find_slot(addr).and_then(|idx| self.region(idx))
    }

    /// Find the slot of the region starting exactly at `base`.
    pub(crate) fn slot_by_base(&self, base: GuestAddress) -> Option<usize> {
        self.order
            .binary_search_by_key(&base, |&(b, _)| b)
            .ok()
            .map(|pos| self.order[pos].1)
    }
}
