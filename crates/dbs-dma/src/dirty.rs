// Copyright (C) 2022 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Dirty page logging for live migration.

use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, info};
use vm_memory::{Address, GuestAddress};

use crate::{DmaController, Error, Result};

const BITS_PER_WORD: usize = u64::BITS as usize;

/// Number of bytes needed to hold one bit per `pgsize` page of `len` bytes.
///
/// Returns 0 for a zero page size.
pub fn bitmap_size(len: u64, pgsize: usize) -> usize {
    if pgsize == 0 {
        return 0;
    }
    let pages = len.div_ceil(pgsize as u64) as usize;
    pages.div_ceil(8)
}

/// Page granular bitmap recording which parts of a region have been written.
///
/// Bits are updated atomically so that translations running on different
/// threads can mark pages concurrently.
#[derive(Debug)]
pub struct DirtyBitmap {
    words: Vec<AtomicU64>,
    pages: usize,
    pgsize: usize,
}

impl DirtyBitmap {
    /// Create a cleared bitmap covering `len` bytes with `pgsize` granularity,
    /// `pgsize` must not be zero.
    pub(crate) fn new(len: u64, pgsize: usize) -> Self {
        let pages = len.div_ceil(pgsize as u64) as usize;
        let words = (0..pages.div_ceil(BITS_PER_WORD))
            .map(|_| AtomicU64::new(0))
            .collect();

        DirtyBitmap {
            words,
            pages,
            pgsize,
        }
    }

    /// Number of pages tracked by the bitmap.
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Page size of the bitmap.
    pub fn pgsize(&self) -> usize {
        self.pgsize
    }

    /// Mark every page intersecting `[offset, offset + len)` as dirty.
    pub fn set_range(&self, offset: u64, len: u64) {
        if len == 0 {
            return;
        }
        let pgsize = self.pgsize as u64;
        let first = (offset / pgsize) as usize;
        let last = (offset.saturating_add(len - 1) / pgsize) as usize;
        let last = last.min(self.pages.saturating_sub(1));

        for index in first..=last {
            self.words[index / BITS_PER_WORD]
                .fetch_or(1u64 << (index % BITS_PER_WORD), Ordering::AcqRel);
        }
    }

    /// Copy the bits of `pages` pages starting at page `first` into `buf`,
    /// packed least significant bit first, and clear them.
    fn take_range(&self, first: usize, pages: usize, buf: &mut [u8]) {
        for b in buf.iter_mut() {
            *b = 0;
        }
        for i in 0..pages {
            let index = first + i;
            if index >= self.pages {
                break;
            }
            let mask = 1u64 << (index % BITS_PER_WORD);
            let old = self.words[index / BITS_PER_WORD].fetch_and(!mask, Ordering::AcqRel);
            if old & mask != 0 {
                buf[i / 8] |= 1 << (i % 8);
            }
        }
    }
}

impl DmaController {
    /// Get the page size of the active dirty page logging session.
    pub fn dirty_pgsize(&self) -> Option<usize> {
        self.dirty_pgsize
    }

    /// Start dirty page logging with `pgsize` granularity.
    ///
    /// Every registered region gets a cleared bitmap. Starting again with the
    /// same page size is a no-op.
    pub fn start_dirty_logging(&mut self, pgsize: usize) -> Result<()> {
        if pgsize == 0 {
            return Err(Error::InvalidArgument("dirty page size must not be zero"));
        }
        if let Some(active) = self.dirty_pgsize {
            if active != pgsize {
                return Err(Error::PageSizeMismatch(pgsize, active));
            }
            return Ok(());
        }

        for region in self.regions.iter_mut().flatten() {
            region.set_dirty_bitmap(Some(DirtyBitmap::new(region.len(), pgsize)));
        }
        self.dirty_pgsize = Some(pgsize);
        info!("dirty page logging started, page size 0x{:x}", pgsize);

        Ok(())
    }

    /// Stop dirty page logging and drop all bitmaps.
    pub fn stop_dirty_logging(&mut self) {
        if self.dirty_pgsize.take().is_none() {
            return;
        }
        for region in self.regions.iter_mut().flatten() {
            region.set_dirty_bitmap(None);
        }
        info!("dirty page logging stopped");
    }

    /// Copy the dirty bits covering `[addr, addr + len)` into `buf`.
    ///
    /// The span must be inside a single region and start on a page boundary
    /// relative to the region base. `buf` receives one bit per `pgsize` page,
    /// least significant bit first, and must be exactly large enough for
    /// the span. The returned bits are cleared in the region bitmap.
    ///
    /// Returns the number of bytes copied.
    pub fn dirty_pages(
        &self,
        addr: GuestAddress,
        len: u64,
        pgsize: usize,
        buf: &mut [u8],
    ) -> Result<usize> {
        let active = self.dirty_pgsize.ok_or(Error::DirtyLoggingDisabled)?;
        if pgsize != active {
            return Err(Error::PageSizeMismatch(pgsize, active));
        }

        let invalid = Error::InvalidRange(addr.raw_value(), len);
        let end = match addr.checked_add(len) {
            Some(end) if len > 0 => end,
            _ => return Err(invalid),
        };
        let region = self.find_region(addr).ok_or(invalid)?;
        if end > region.end_addr() {
            return Err(Error::InvalidRange(addr.raw_value(), len));
        }

        let offset = addr.unchecked_offset_from(region.start_addr());
        if offset % pgsize as u64 != 0 {
            return Err(Error::InvalidArgument("dirty page range is not page aligned"));
        }
        let size = bitmap_size(len, pgsize);
        if buf.len() != size {
            return Err(Error::InvalidArgument("bad dirty page bitmap size"));
        }

        // Bitmaps exist on every region while logging is active.
        let bitmap = region
            .dirty_bitmap()
            .ok_or(Error::DirtyLoggingDisabled)?;
        let first = (offset / pgsize as u64) as usize;
        let pages = len.div_ceil(pgsize as u64) as usize;
        bitmap.take_range(first, pages, buf);
        debug!(
            "dirty pages 0x{:x}-0x{:x}: {} bytes",
            addr.raw_value(),
            end.raw_value(),
            size
        );

        Ok(size)
    }
}
