// Copyright (C) 2022 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Translation of DMA address spans into scatter-gather lists.

use std::cmp::min;

use vm_memory::{Address, GuestAddress};

use crate::{DmaController, DmaProt, DmaRegion, Error, Result};

/// One contiguous piece of a translated DMA span, bound to a single region.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DmaSg {
    /// Base address of the owning region.
    pub dma_addr: GuestAddress,
    /// Slot of the owning region.
    pub region: usize,
    /// Offset into the owning region.
    pub offset: u64,
    /// Length of the piece.
    pub length: u64,
    /// Whether the owning region has a host mapping.
    pub mappable: bool,
}

impl DmaSg {
    /// DMA address of the first byte covered by the entry.
    pub fn addr(&self) -> GuestAddress {
        self.dma_addr.unchecked_add(self.offset)
    }
}

impl Default for DmaSg {
    fn default() -> Self {
        DmaSg {
            dma_addr: GuestAddress(0),
            region: 0,
            offset: 0,
            length: 0,
            mappable: false,
        }
    }
}

/// Per worker cache of the region used by the last translation.
///
/// Each thread translating against a shared [`DmaController`] should own
/// its hint. A stale hint is harmless: it is revalidated against the current
/// region table before use.
#[derive(Clone, Copy, Debug, Default)]
pub struct RegionHint {
    slot: usize,
}

impl RegionHint {
    /// Slot of the region hit by the last slow path translation.
    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl DmaController {
    /// Translate the DMA span `[addr, addr + len)` into scatter-gather entries.
    ///
    /// The span is split at region boundaries, so `sg` receives one entry per
    /// region touched. Every entry is checked against the rights of its
    /// region. On success the number of entries written is returned and, for
    /// write requests, the pages covered are marked dirty if dirty page
    /// logging is enabled.
    ///
    /// If `sg` is too small, [`Error::SgListTooSmall`] carries the number of
    /// entries needed so the caller can retry with a larger list.
    pub fn translate(
        &self,
        hint: &mut RegionHint,
        addr: GuestAddress,
        len: u64,
        prot: DmaProt,
        sg: &mut [DmaSg],
    ) -> Result<usize> {
        if len == 0 {
            return Ok(0);
        }
        let end = addr
            .checked_add(len)
            .ok_or(Error::InvalidRange(addr.raw_value(), len))?;

        // Fast path: the whole span is in the region we used last time.
        if let Some(region) = self.region(hint.slot) {
            if !sg.is_empty() && addr >= region.start_addr() && end <= region.end_addr() {
                sg[0] = Self::init_sg(hint.slot, region, addr, len, prot)?;
                self.mark_sg_dirty(&sg[..1], prot);
                return Ok(1);
            }
        }

        // Slow path: walk regions in address order.
        let mut cnt = 0;
        let mut cur = addr;
        let mut remaining = len;
        while remaining > 0 {
            let (idx, region) = self
                .find_slot(cur)
                .and_then(|idx| self.region(idx).map(|r| (idx, r)))
                .ok_or(Error::InvalidRange(addr.raw_value(), len))?;
            let chunk = min(region.end_addr().unchecked_offset_from(cur), remaining);
            let entry = Self::init_sg(idx, region, cur, chunk, prot)?;
            if let Some(slot) = sg.get_mut(cnt) {
                *slot = entry;
            }
            cnt += 1;
            cur = cur.unchecked_add(chunk);
            remaining -= chunk;
        }

        if cnt > sg.len() {
            return Err(Error::SgListTooSmall(cnt));
        }
        self.mark_sg_dirty(&sg[..cnt], prot);
        hint.slot = sg[cnt - 1].region;

        Ok(cnt)
    }

    fn init_sg(
        idx: usize,
        region: &DmaRegion,
        addr: GuestAddress,
        len: u64,
        prot: DmaProt,
    ) -> Result<DmaSg> {
        if prot.is_writable() && !region.prot().is_writable() {
            return Err(Error::AccessViolation(addr.raw_value()));
        }

        Ok(DmaSg {
            dma_addr: region.start_addr(),
            region: idx,
            offset: addr.unchecked_offset_from(region.start_addr()),
            length: len,
            mappable: region.is_mappable(),
        })
    }

    fn mark_sg_dirty(&self, sg: &[DmaSg], prot: DmaProt) {
        if !prot.is_writable() || self.dirty_pgsize.is_none() {
            return;
        }
        for entry in sg {
            if let Some(region) = self.region(entry.region) {
                region.mark_dirty(entry.offset, entry.length);
            }
        }
    }
}
