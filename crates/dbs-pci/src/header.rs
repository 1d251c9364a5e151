// Copyright (C) 2022 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Standard type 0 header handler.

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, error, info, trace};

use crate::{
    Error, PciConfigSpace, Result, PCI_BASE_ADDRESS_0, PCI_BASE_ADDRESS_5, PCI_COMMAND,
    PCI_COMMAND_INTX_DISABLE, PCI_COMMAND_INVALIDATE, PCI_COMMAND_IO, PCI_COMMAND_MASTER,
    PCI_COMMAND_MEMORY, PCI_COMMAND_SERR, PCI_COMMAND_VGA_PALETTE, PCI_INTERRUPT_LINE,
    PCI_INTERRUPT_PIN, PCI_LATENCY_TIMER, PCI_ROM_ADDRESS, PCI_ROM_ADDRESS_ENABLE,
    PCI_ROM_ADDRESS_MASK, PCI_STATUS, PCI_STD_HEADER_SIZEOF,
};

// Command register bits tracked for edges: (bit, feature, on, off).
const COMMAND_FEATURES: [(u16, &str, &str, &str); 6] = [
    (PCI_COMMAND_IO, "I/O space", "enabled", "disabled"),
    (PCI_COMMAND_MEMORY, "memory space", "enabled", "disabled"),
    (PCI_COMMAND_MASTER, "bus master", "enabled", "disabled"),
    (PCI_COMMAND_SERR, "SERR#", "enabled", "disabled"),
    (PCI_COMMAND_INTX_DISABLE, "INTx emulation", "disabled", "enabled"),
    (
        PCI_COMMAND_INVALIDATE,
        "memory write and invalidate",
        "enabled",
        "disabled",
    ),
];

const COMMAND_FEATURE_MASK: u16 = PCI_COMMAND_IO
    | PCI_COMMAND_MEMORY
    | PCI_COMMAND_MASTER
    | PCI_COMMAND_SERR
    | PCI_COMMAND_INTX_DISABLE
    | PCI_COMMAND_INVALIDATE;

/// A transition of one command register bit caused by a write.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CommandEdge {
    /// The command register bit, one of the `PCI_COMMAND_*` constants.
    pub bit: u16,
    /// New state of the bit.
    pub set: bool,
}

impl PciConfigSpace {
    /// Access the standard header, `buf` must not cross its end.
    pub(crate) fn header_access(
        &mut self,
        buf: &mut [u8],
        offset: usize,
        is_write: bool,
    ) -> Result<usize> {
        debug_assert!(offset + buf.len() <= PCI_STD_HEADER_SIZEOF);

        if !is_write {
            buf.copy_from_slice(&self.data[offset..offset + buf.len()]);
            return Ok(buf.len());
        }

        match self.header_write(buf, offset) {
            Ok(()) => {
                trace!("PCI header write 0x{:x}: {:x?}", offset, buf);
                Ok(buf.len())
            }
            Err(e) => {
                error!("failed to write to PCI header: {}", e);
                Err(e)
            }
        }
    }

    fn header_write(&mut self, buf: &[u8], offset: usize) -> Result<()> {
        match offset {
            PCI_COMMAND => self.write_command(buf),
            PCI_STATUS => {
                info!("write to status ignored");
                Ok(())
            }
            PCI_INTERRUPT_PIN => {
                error!("attempt to write read-only field IPIN");
                Err(Error::InvalidArgument("interrupt pin is read-only"))
            }
            PCI_INTERRUPT_LINE => {
                self.data[PCI_INTERRUPT_LINE] = buf[0];
                debug!("ILINE=0x{:x}", buf[0]);
                Ok(())
            }
            PCI_LATENCY_TIMER => {
                self.data[PCI_LATENCY_TIMER] = buf[0];
                info!("set latency timer to 0x{:x}", buf[0]);
                Ok(())
            }
            PCI_BASE_ADDRESS_0..=PCI_BASE_ADDRESS_5 if offset % 4 == 0 => {
                self.write_bar((offset - PCI_BASE_ADDRESS_0) / 4, buf)
            }
            PCI_ROM_ADDRESS => self.write_rom(buf),
            _ => {
                info!(
                    "PCI config write 0x{:x}-0x{:x} not handled",
                    offset,
                    offset + buf.len()
                );
                Err(Error::InvalidArgument("unhandled header offset"))
            }
        }
    }

    fn write_command(&mut self, buf: &[u8]) -> Result<()> {
        if buf.len() != 2 {
            error!("bad write command size {}", buf.len());
            return Err(Error::InvalidArgument("bad command register write size"));
        }

        let v = LittleEndian::read_u16(buf);
        let unknown = v & !(COMMAND_FEATURE_MASK | PCI_COMMAND_VGA_PALETTE);
        if unknown != 0 {
            error!("unconsumed command flags 0x{:x}", unknown);
            return Err(Error::InvalidArgument("unknown command register bits"));
        }
        if v & PCI_COMMAND_VGA_PALETTE != 0 {
            info!("enabling VGA palette snooping ignored");
        }

        let old = self.command();
        let new = (old & !COMMAND_FEATURE_MASK) | (v & COMMAND_FEATURE_MASK);
        self.command_edges.clear();
        for &(bit, feature, on, off) in COMMAND_FEATURES.iter() {
            if (old ^ new) & bit == 0 {
                continue;
            }
            let set = new & bit != 0;
            info!("{} {}", feature, if set { on } else { off });
            self.command_edges.push(CommandEdge { bit, set });
        }
        LittleEndian::write_u16(&mut self.data[PCI_COMMAND..], new);

        Ok(())
    }

    fn write_bar(&mut self, index: usize, buf: &[u8]) -> Result<()> {
        if buf.len() != 4 {
            return Err(Error::InvalidArgument("bad BAR write size"));
        }
        let bar = self.bars[index];
        if bar.size == 0 {
            return Ok(());
        }

        let mut v = LittleEndian::read_u32(buf);
        debug!("BAR{} addr 0x{:x}", index, v);
        if v == 0xffff_ffff {
            // Size probe, report the two's complement of the region size.
            v = (!bar.size).wrapping_add(1) as u32;
        }

        let mask = bar.kind.address_mask();
        let offset = Self::bar_offset(index);
        let old = LittleEndian::read_u32(&self.data[offset..]);
        LittleEndian::write_u32(&mut self.data[offset..], (v & mask) | (old & !mask));

        Ok(())
    }

    fn write_rom(&mut self, buf: &[u8]) -> Result<()> {
        if buf.len() != 4 {
            error!("bad EROM count {}", buf.len());
            return Err(Error::InvalidArgument("bad expansion ROM write size"));
        }

        let v = LittleEndian::read_u32(buf);
        if v == PCI_ROM_ADDRESS_MASK {
            info!("write mask to EROM ignored");
        } else if v == 0 {
            info!("cleared EROM");
            LittleEndian::write_u32(&mut self.data[PCI_ROM_ADDRESS..], 0);
        } else if v == !PCI_ROM_ADDRESS_ENABLE {
            info!("EROM disable ignored");
        } else {
            error!("bad write to EROM 0x{:x}", v);
            return Err(Error::InvalidArgument("bad expansion ROM value"));
        }

        Ok(())
    }
}
