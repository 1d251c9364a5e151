// Copyright (C) 2022 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::convert::TryFrom;

use log::debug;
use vm_memory::{Address, VolatileMemory, VolatileSlice};

use crate::{DmaController, DmaSg, Error, Result};

impl DmaController {
    /// Get buffer views for the memory described by a scatter-gather list.
    ///
    /// No new mapping is created, the views point into the mappings set up
    /// when the regions were registered, and no access rights are checked
    /// since translation already did. Each entry takes a reference on its
    /// region, to be dropped by [`DmaController::unmap_sg()`].
    pub fn map_sg(&self, sg: &[DmaSg]) -> Result<Vec<VolatileSlice>> {
        let mut slices = Vec::with_capacity(sg.len());

        for entry in sg {
            let region = self
                .region(entry.region)
                .ok_or(Error::InvalidArgument("bad dma region index"))?;
            // The slot may have been reused by another region since translation.
            if region.start_addr() != entry.dma_addr {
                return Err(Error::InvalidArgument("stale dma region index"));
            }
            let mmap = region.mapping().ok_or(Error::NotMappable(entry.region))?;
            let invalid = || {
                Error::InvalidRange(
                    entry.dma_addr.raw_value().saturating_add(entry.offset),
                    entry.length,
                )
            };
            match entry.offset.checked_add(entry.length) {
                Some(end) if end <= region.len() => {}
                _ => return Err(invalid()),
            }
            let offset = usize::try_from(entry.offset).map_err(|_| invalid())?;
            let len = usize::try_from(entry.length).map_err(|_| invalid())?;
            let slice = mmap.get_slice(offset, len).map_err(|_| invalid())?;
            slices.push(slice);
        }

        for entry in sg {
            if let Some(region) = self.region(entry.region) {
                let start = entry.dma_addr.raw_value().wrapping_add(entry.offset);
                debug!("map 0x{:x}-0x{:x}", start, start.wrapping_add(entry.length));
                region.get();
            }
        }

        Ok(slices)
    }

    /// Drop the region references taken by [`DmaController::map_sg()`].
    ///
    /// Regions are looked up by base address rather than slot since they may
    /// have been removed in the meantime; entries whose region is gone are
    /// skipped.
    pub fn unmap_sg(&self, sg: &[DmaSg]) {
        for entry in sg {
            let region = match self
                .slot_by_base(entry.dma_addr)
                .and_then(|idx| self.region(idx))
            {
                Some(region) => region,
                None => continue,
            };
            let start = entry.dma_addr.raw_value().wrapping_add(entry.offset);
            debug!("unmap 0x{:x}-0x{:x}", start, start.wrapping_add(entry.length));
            region.put();
        }
    }
}
