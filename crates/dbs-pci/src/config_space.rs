// Copyright (C) 2022 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use log::debug;

use crate::{
    CapabilityTable, CommandEdge, ConfigAccessCallback, Error, Result, PCI_BASE_ADDRESS_0,
    PCI_BASE_ADDRESS_IO_MASK, PCI_BASE_ADDRESS_MEM_MASK, PCI_BASE_ADDRESS_SPACE_IO,
    PCI_CFG_SPACE_EXP_SIZE, PCI_CFG_SPACE_SIZE, PCI_CLASS_PROG, PCI_COMMAND, PCI_DEVICE_ID,
    PCI_HEADER_TYPE, PCI_HEADER_TYPE_NORMAL, PCI_INTERRUPT_LINE, PCI_INTERRUPT_PIN,
    PCI_LATENCY_TIMER, PCI_NUM_BARS, PCI_ROM_ADDRESS, PCI_SUBSYSTEM_ID, PCI_SUBSYSTEM_VENDOR_ID,
    PCI_VENDOR_ID,
};

/// Bus flavour of the device, which decides the size of its configuration space.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PciType {
    /// Conventional PCI.
    Conventional,
    /// PCI-X mode 1.
    PciX1,
    /// PCI-X mode 2.
    PciX2,
    /// PCI Express.
    Express,
}

impl PciType {
    /// Size of the configuration space for this bus type.
    pub fn config_size(&self) -> usize {
        match self {
            PciType::Conventional | PciType::PciX1 => PCI_CFG_SPACE_SIZE,
            PciType::PciX2 | PciType::Express => PCI_CFG_SPACE_EXP_SIZE,
        }
    }
}

/// Address space decoded by a base address register.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PciBarKind {
    /// Memory space BAR.
    Memory,
    /// I/O space BAR.
    Io,
}

impl PciBarKind {
    /// Bits of the BAR value holding the address.
    pub fn address_mask(&self) -> u32 {
        match self {
            PciBarKind::Memory => PCI_BASE_ADDRESS_MEM_MASK,
            PciBarKind::Io => PCI_BASE_ADDRESS_IO_MASK,
        }
    }
}

/// Declared geometry of a device region exposed through a BAR.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PciBar {
    /// Size of the region, zero if the BAR is unused.
    pub size: u64,
    /// Address space of the region.
    pub kind: PciBarKind,
}

impl Default for PciBar {
    fn default() -> Self {
        PciBar {
            size: 0,
            kind: PciBarKind::Memory,
        }
    }
}

/// Configuration space of a PCI device with a normal (type 0) header.
pub struct PciConfigSpace {
    pci_type: PciType,
    pub(crate) data: Vec<u8>,
    pub(crate) bars: [PciBar; PCI_NUM_BARS],
    pub(crate) caps: Option<Box<dyn CapabilityTable + Send>>,
    pub(crate) callback: Option<Box<dyn ConfigAccessCallback + Send>>,
    pub(crate) command_edges: Vec<CommandEdge>,
}

impl PciConfigSpace {
    /// Create a zeroed configuration space.
    ///
    /// # Arguments
    /// * `pci_type` - Bus type, selects a 256 or 4096 byte configuration space
    /// * `header_type` - Header layout, only `PCI_HEADER_TYPE_NORMAL` is supported
    pub fn new(pci_type: PciType, header_type: u8) -> Result<Self> {
        if header_type != PCI_HEADER_TYPE_NORMAL {
            return Err(Error::InvalidHeaderType(header_type));
        }

        let mut data = vec![0u8; pci_type.config_size()];
        data[PCI_HEADER_TYPE] = header_type;

        Ok(PciConfigSpace {
            pci_type,
            data,
            bars: [PciBar::default(); PCI_NUM_BARS],
            caps: None,
            callback: None,
            command_edges: Vec::new(),
        })
    }

    /// Get the bus type of the device.
    pub fn pci_type(&self) -> PciType {
        self.pci_type
    }

    /// Get the size of the configuration space.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Get the raw configuration space.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Set the device and subsystem identification.
    pub fn set_id(&mut self, vid: u16, did: u16, ssvid: u16, ssid: u16) {
        LittleEndian::write_u16(&mut self.data[PCI_VENDOR_ID..], vid);
        LittleEndian::write_u16(&mut self.data[PCI_DEVICE_ID..], did);
        LittleEndian::write_u16(&mut self.data[PCI_SUBSYSTEM_VENDOR_ID..], ssvid);
        LittleEndian::write_u16(&mut self.data[PCI_SUBSYSTEM_ID..], ssid);
    }

    /// Set the class code of the device.
    pub fn set_class(&mut self, base: u8, sub: u8, prog_if: u8) {
        self.data[PCI_CLASS_PROG] = prog_if;
        self.data[PCI_CLASS_PROG + 1] = sub;
        self.data[PCI_CLASS_PROG + 2] = base;
    }

    /// Set the value reported by the read-only interrupt pin register.
    pub fn set_interrupt_pin(&mut self, pin: u8) {
        self.data[PCI_INTERRUPT_PIN] = pin;
    }

    /// Declare the region behind BAR `index`.
    ///
    /// The BAR is reset to address zero with the space indicator bit matching
    /// `kind`. A zero `size` leaves the BAR unimplemented, writes to it are
    /// then ignored.
    pub fn set_bar(&mut self, index: usize, size: u64, kind: PciBarKind) -> Result<()> {
        if index >= PCI_NUM_BARS {
            return Err(Error::InvalidArgument("bad BAR index"));
        }

        self.bars[index] = PciBar { size, kind };
        let raw = match kind {
            PciBarKind::Memory => 0,
            PciBarKind::Io => PCI_BASE_ADDRESS_SPACE_IO,
        };
        LittleEndian::write_u32(&mut self.data[Self::bar_offset(index)..], raw);
        debug!("BAR{} size 0x{:x} {:?}", index, size, kind);

        Ok(())
    }

    /// Get the declared geometry of BAR `index`.
    pub fn bar_info(&self, index: usize) -> Option<PciBar> {
        self.bars.get(index).copied()
    }

    /// Install the capability table consulted for accesses past the header.
    pub fn set_capabilities(&mut self, caps: Box<dyn CapabilityTable + Send>) {
        self.caps = Some(caps);
    }

    /// Install the callback serving accesses outside the header and capabilities.
    pub fn set_access_callback(&mut self, callback: Box<dyn ConfigAccessCallback + Send>) {
        self.callback = Some(callback);
    }

    /// Get the command register.
    pub fn command(&self) -> u16 {
        LittleEndian::read_u16(&self.data[PCI_COMMAND..])
    }

    /// Get the raw value of BAR `index`.
    pub fn bar(&self, index: usize) -> Option<u32> {
        if index >= PCI_NUM_BARS {
            return None;
        }
        Some(LittleEndian::read_u32(&self.data[Self::bar_offset(index)..]))
    }

    /// Get the expansion ROM base address register.
    pub fn rom_address(&self) -> u32 {
        LittleEndian::read_u32(&self.data[PCI_ROM_ADDRESS..])
    }

    /// Get the interrupt line register.
    pub fn interrupt_line(&self) -> u8 {
        self.data[PCI_INTERRUPT_LINE]
    }

    /// Get the latency timer register.
    pub fn latency_timer(&self) -> u8 {
        self.data[PCI_LATENCY_TIMER]
    }

    /// Command register transitions applied by the last command register write.
    pub fn last_command_edges(&self) -> &[CommandEdge] {
        &self.command_edges
    }

    pub(crate) fn bar_offset(index: usize) -> usize {
        PCI_BASE_ADDRESS_0 + index * 4
    }
}

impl fmt::Debug for PciConfigSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PciConfigSpace")
            .field("pci_type", &self.pci_type)
            .field("size", &self.data.len())
            .field("bars", &self.bars)
            .field("caps", &self.caps.is_some())
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PCI_STATUS, PCI_STD_HEADER_SIZEOF};

    #[test]
    fn test_config_space_new() {
        let cfg = PciConfigSpace::new(PciType::Conventional, 0).unwrap();
        assert_eq!(cfg.size(), PCI_CFG_SPACE_SIZE);
        assert_eq!(cfg.pci_type(), PciType::Conventional);
        assert!(cfg.as_slice().iter().all(|b| *b == 0));

        assert_eq!(
            PciConfigSpace::new(PciType::PciX1, 0).unwrap().size(),
            PCI_CFG_SPACE_SIZE
        );
        assert_eq!(
            PciConfigSpace::new(PciType::PciX2, 0).unwrap().size(),
            PCI_CFG_SPACE_EXP_SIZE
        );
        assert_eq!(
            PciConfigSpace::new(PciType::Express, 0).unwrap().size(),
            PCI_CFG_SPACE_EXP_SIZE
        );

        assert!(matches!(
            PciConfigSpace::new(PciType::Express, 1),
            Err(Error::InvalidHeaderType(1))
        ));
    }

    #[test]
    fn test_config_space_ids() {
        let mut cfg = PciConfigSpace::new(PciType::Conventional, 0).unwrap();
        cfg.set_id(0x4e58, 0x0001, 0x1af4, 0x1100);
        cfg.set_class(0x01, 0x08, 0x02);
        cfg.set_interrupt_pin(1);

        let raw = cfg.as_slice();
        assert_eq!(&raw[0..4], &[0x58, 0x4e, 0x01, 0x00]);
        assert_eq!(&raw[0x09..0x0c], &[0x02, 0x08, 0x01]);
        assert_eq!(&raw[0x2c..0x30], &[0xf4, 0x1a, 0x00, 0x11]);
        assert_eq!(raw[PCI_INTERRUPT_PIN], 1);
        assert_eq!(LittleEndian::read_u16(&raw[PCI_STATUS..]), 0);
        assert!(raw.len() > PCI_STD_HEADER_SIZEOF);
    }

    #[test]
    fn test_config_space_set_bar() {
        let mut cfg = PciConfigSpace::new(PciType::Conventional, 0).unwrap();

        cfg.set_bar(0, 0x1000, PciBarKind::Memory).unwrap();
        cfg.set_bar(2, 0x100, PciBarKind::Io).unwrap();
        assert!(matches!(
            cfg.set_bar(6, 0x1000, PciBarKind::Memory),
            Err(Error::InvalidArgument(_))
        ));

        assert_eq!(cfg.bar(0), Some(0));
        assert_eq!(cfg.bar(2), Some(PCI_BASE_ADDRESS_SPACE_IO));
        assert_eq!(cfg.bar(6), None);
        assert_eq!(
            cfg.bar_info(2),
            Some(PciBar {
                size: 0x100,
                kind: PciBarKind::Io
            })
        );
        assert_eq!(cfg.bar_info(1), Some(PciBar::default()));
        assert_eq!(cfg.bar_info(6), None);
        assert_eq!(PciBarKind::Io.address_mask(), 0xffff_fffc);
        assert_eq!(PciBarKind::Memory.address_mask(), 0xffff_fff0);
    }
}
