// Copyright (C) 2022 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

#![deny(missing_docs)]

//! PCI configuration space emulation for user space devices.
//!
//! [`PciConfigSpace`] owns the raw configuration space of a type 0 device
//! and services byte-range accesses coming from a remote driver. An access
//! is split into segments, each routed to one of three handlers:
//! - the standard header handler for the first 64 bytes, which interprets
//!   writes to the command register, BARs, expansion ROM and friends;
//! - the capability handler, for ranges covered by an externally supplied
//!   [`CapabilityTable`];
//! - the vendor path for everything else, delegated to an optional
//!   [`ConfigAccessCallback`].

use std::io::Error as IOError;

mod config_space;
pub use self::config_space::{PciBar, PciBarKind, PciConfigSpace, PciType};

mod dispatch;
pub use self::dispatch::{CapabilityTable, ConfigAccessCallback, PciCapability};

mod header;
pub use self::header::CommandEdge;

/// Vendor ID register.
pub const PCI_VENDOR_ID: usize = 0x00;
/// Device ID register.
pub const PCI_DEVICE_ID: usize = 0x02;
/// Command register.
pub const PCI_COMMAND: usize = 0x04;
/// Status register.
pub const PCI_STATUS: usize = 0x06;
/// Programming interface, followed by the sub class and base class.
pub const PCI_CLASS_PROG: usize = 0x09;
/// Latency timer register.
pub const PCI_LATENCY_TIMER: usize = 0x0d;
/// Header type register.
pub const PCI_HEADER_TYPE: usize = 0x0e;
/// First base address register.
pub const PCI_BASE_ADDRESS_0: usize = 0x10;
/// Last base address register.
pub const PCI_BASE_ADDRESS_5: usize = 0x24;
/// Subsystem vendor ID register.
pub const PCI_SUBSYSTEM_VENDOR_ID: usize = 0x2c;
/// Subsystem ID register.
pub const PCI_SUBSYSTEM_ID: usize = 0x2e;
/// Expansion ROM base address register.
pub const PCI_ROM_ADDRESS: usize = 0x30;
/// Interrupt line register.
pub const PCI_INTERRUPT_LINE: usize = 0x3c;
/// Interrupt pin register.
pub const PCI_INTERRUPT_PIN: usize = 0x3d;
/// Size of the standard type 0 header.
pub const PCI_STD_HEADER_SIZEOF: usize = 0x40;
/// Size of the conventional configuration space.
pub const PCI_CFG_SPACE_SIZE: usize = 0x100;
/// Size of the extended configuration space.
pub const PCI_CFG_SPACE_EXP_SIZE: usize = 0x1000;
/// Number of base address registers of a type 0 header.
pub const PCI_NUM_BARS: usize = 6;

/// Header type of a normal device.
pub const PCI_HEADER_TYPE_NORMAL: u8 = 0;

/// Enable response in I/O space.
pub const PCI_COMMAND_IO: u16 = 0x1;
/// Enable response in memory space.
pub const PCI_COMMAND_MEMORY: u16 = 0x2;
/// Enable bus mastering.
pub const PCI_COMMAND_MASTER: u16 = 0x4;
/// Use memory write and invalidate.
pub const PCI_COMMAND_INVALIDATE: u16 = 0x10;
/// Enable VGA palette snooping.
pub const PCI_COMMAND_VGA_PALETTE: u16 = 0x20;
/// Enable SERR#.
pub const PCI_COMMAND_SERR: u16 = 0x100;
/// INTx emulation disable.
pub const PCI_COMMAND_INTX_DISABLE: u16 = 0x400;

/// BAR maps I/O space rather than memory.
pub const PCI_BASE_ADDRESS_SPACE_IO: u32 = 0x1;
/// Address bits of a memory BAR.
pub const PCI_BASE_ADDRESS_MEM_MASK: u32 = !0xf;
/// Address bits of an I/O BAR.
pub const PCI_BASE_ADDRESS_IO_MASK: u32 = !0x3;
/// Expansion ROM enable bit.
pub const PCI_ROM_ADDRESS_ENABLE: u32 = 0x1;
/// Address bits of the expansion ROM base address.
pub const PCI_ROM_ADDRESS_MASK: u32 = !0x7ff;

/// Errors associated with PCI configuration space accesses.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed field write, wrong access size or unrecognized bits.
    #[error("invalid pci config space access: {0}")]
    InvalidArgument(&'static str),

    /// The access doesn't fit in the configuration space.
    #[error("pci config space access at 0x{0:x} of {1} bytes out of range")]
    OutOfRange(usize, usize),

    /// Only normal (type 0) headers are supported.
    #[error("invalid pci header type {0}")]
    InvalidHeaderType(u8),

    /// The vendor access callback failed.
    #[error("pci config space access callback failed")]
    Callback(#[source] IOError),
}

/// Specialized std::result::Result for PCI configuration space operations.
pub type Result<T> = std::result::Result<T, Error>;
