// Copyright (C) 2022 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Routing of configuration space accesses to the header, capability and
//! vendor handlers.

use std::cmp::min;
use std::io::Result as IOResult;

use log::error;

use crate::{Error, PciConfigSpace, Result, PCI_STD_HEADER_SIZEOF};

/// Location of a capability structure in the configuration space.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PciCapability {
    /// Offset of the first byte of the capability.
    pub offset: usize,
    /// Size of the capability in bytes.
    pub size: usize,
}

impl PciCapability {
    /// First offset past the capability.
    pub fn end(&self) -> usize {
        self.offset.saturating_add(self.size)
    }
}

/// Lookup and access of the capabilities exposed by a device.
pub trait CapabilityTable {
    /// Find the first capability intersecting `[offset, offset + count)`.
    fn find_by_offset(&self, offset: usize, count: usize) -> Option<PciCapability>;

    /// Access `buf.len()` bytes of capability `cap` at configuration space
    /// `offset`.
    ///
    /// `space` is the whole configuration space, so that the capability can
    /// keep its registers there. Returns the number of bytes handled.
    fn access(
        &mut self,
        space: &mut [u8],
        cap: PciCapability,
        buf: &mut [u8],
        offset: usize,
        is_write: bool,
    ) -> Result<usize>;
}

/// Device specific handler for the configuration space outside the header
/// and the capabilities.
pub trait ConfigAccessCallback {
    /// Access `buf.len()` bytes at configuration space `offset`, returning
    /// the number of bytes handled.
    fn access(&mut self, buf: &mut [u8], offset: usize, is_write: bool) -> IOResult<usize>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Segment {
    Header,
    Capability(PciCapability),
    Vendor,
}

impl PciConfigSpace {
    /// Read or write `buf.len()` bytes of configuration space at `offset`.
    ///
    /// The access is split into segments handled by the standard header
    /// handler, the capability table or the vendor path. A failing segment
    /// aborts the access, but segments already written are not rolled back.
    ///
    /// Returns the number of bytes accessed, which is `buf.len()` on success.
    pub fn access(&mut self, buf: &mut [u8], offset: usize, is_write: bool) -> Result<usize> {
        let count = buf.len();
        match offset.checked_add(count) {
            Some(end) if end <= self.data.len() => {}
            _ => return Err(Error::OutOfRange(offset, count)),
        }

        let mut done = 0;
        while done < count {
            let pos = offset + done;
            let (segment, size) = self.next_segment(pos, count - done);
            let seg = &mut buf[done..done + size];
            let ret = match segment {
                Segment::Header => self.header_access(seg, pos, is_write)?,
                Segment::Capability(cap) => match self.caps.as_mut() {
                    Some(caps) => caps.access(&mut self.data, cap, seg, pos, is_write)?,
                    None => return Err(Error::InvalidArgument("no capability table")),
                },
                Segment::Vendor => self.vendor_access(seg, pos, is_write)?,
            };

            if ret == 0 || ret > size {
                error!(
                    "config space handler returned {} for 0x{:x}-0x{:x}",
                    ret,
                    pos,
                    pos + size
                );
                return Err(Error::InvalidArgument("bad config space handler result"));
            }
            done += ret;
        }

        Ok(done)
    }

    // Size of the next segment at `offset` and who handles it.
    fn next_segment(&self, offset: usize, count: usize) -> (Segment, usize) {
        if offset < PCI_STD_HEADER_SIZEOF {
            return (
                Segment::Header,
                min(count, PCI_STD_HEADER_SIZEOF - offset),
            );
        }

        let cap = match self.caps.as_ref().and_then(|c| c.find_by_offset(offset, count)) {
            Some(cap) => cap,
            None => return (Segment::Vendor, count),
        };
        if offset < cap.offset {
            return (Segment::Vendor, min(count, cap.offset - offset));
        }

        (
            Segment::Capability(cap),
            min(count, cap.end().saturating_sub(offset)),
        )
    }

    fn vendor_access(&mut self, buf: &mut [u8], offset: usize, is_write: bool) -> Result<usize> {
        if let Some(callback) = self.callback.as_mut() {
            return callback
                .access(buf, offset, is_write)
                .map_err(Error::Callback);
        }

        if is_write {
            error!(
                "no callback for write to config space offset 0x{:x} size {}",
                offset,
                buf.len()
            );
            return Err(Error::InvalidArgument("no config space write handler"));
        }

        buf.copy_from_slice(&self.data[offset..offset + buf.len()]);
        Ok(buf.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PciType, PCI_COMMAND, PCI_COMMAND_MEMORY, PCI_INTERRUPT_LINE};
    use std::io::{Error as IOError, ErrorKind};
    use std::sync::{Arc, Mutex};

    type Calls = Arc<Mutex<Vec<(usize, usize, bool)>>>;

    struct TestCaps {
        caps: Vec<PciCapability>,
        calls: Calls,
    }

    impl CapabilityTable for TestCaps {
        fn find_by_offset(&self, offset: usize, count: usize) -> Option<PciCapability> {
            self.caps
                .iter()
                .find(|c| c.offset < offset + count && offset < c.end())
                .copied()
        }

        fn access(
            &mut self,
            space: &mut [u8],
            _cap: PciCapability,
            buf: &mut [u8],
            offset: usize,
            is_write: bool,
        ) -> Result<usize> {
            self.calls
                .lock()
                .unwrap()
                .push((offset, buf.len(), is_write));
            if is_write {
                space[offset..offset + buf.len()].copy_from_slice(buf);
            } else {
                buf.copy_from_slice(&space[offset..offset + buf.len()]);
            }
            Ok(buf.len())
        }
    }

    struct TestCallback {
        calls: Calls,
        ret: Option<usize>,
    }

    impl ConfigAccessCallback for TestCallback {
        fn access(&mut self, buf: &mut [u8], offset: usize, is_write: bool) -> IOResult<usize> {
            self.calls
                .lock()
                .unwrap()
                .push((offset, buf.len(), is_write));
            for b in buf.iter_mut() {
                *b = 0xab;
            }
            match self.ret {
                Some(ret) => Ok(ret),
                None => Err(IOError::new(ErrorKind::Other, "vendor access failed")),
            }
        }
    }

    fn config_space(calls: &Calls) -> PciConfigSpace {
        let mut cfg = PciConfigSpace::new(PciType::Conventional, 0).unwrap();
        cfg.set_capabilities(Box::new(TestCaps {
            caps: vec![
                PciCapability {
                    offset: 0x40,
                    size: 0x10,
                },
                PciCapability {
                    offset: 0x60,
                    size: 0x8,
                },
            ],
            calls: calls.clone(),
        }));
        cfg
    }

    #[test]
    fn test_next_segment() {
        let calls = Calls::default();
        let cfg = config_space(&calls);

        assert_eq!(cfg.next_segment(0x3c, 8), (Segment::Header, 4));
        assert_eq!(cfg.next_segment(0, 0x100), (Segment::Header, 0x40));
        let cap = PciCapability {
            offset: 0x40,
            size: 0x10,
        };
        assert_eq!(cfg.next_segment(0x40, 0x40), (Segment::Capability(cap), 0x10));
        assert_eq!(cfg.next_segment(0x44, 0x40), (Segment::Capability(cap), 0xc));
        assert_eq!(cfg.next_segment(0x40, 2), (Segment::Capability(cap), 2));
        assert_eq!(cfg.next_segment(0x50, 0x20), (Segment::Vendor, 0x10));
        assert_eq!(cfg.next_segment(0x68, 0x98), (Segment::Vendor, 0x98));
    }

    // Reports a capability past the requested window.
    struct FarCap;

    impl CapabilityTable for FarCap {
        fn find_by_offset(&self, _offset: usize, _count: usize) -> Option<PciCapability> {
            Some(PciCapability {
                offset: 0xc0,
                size: usize::MAX,
            })
        }

        fn access(
            &mut self,
            _space: &mut [u8],
            _cap: PciCapability,
            buf: &mut [u8],
            _offset: usize,
            _is_write: bool,
        ) -> Result<usize> {
            Ok(buf.len())
        }
    }

    #[test]
    fn test_next_segment_far_capability() {
        let mut cfg = PciConfigSpace::new(PciType::Conventional, 0).unwrap();
        cfg.set_capabilities(Box::new(FarCap));
        cfg.data[0x48] = 0x5a;

        assert_eq!(cfg.next_segment(0x48, 4), (Segment::Vendor, 4));
        let mut buf = [0u8; 4];
        assert_eq!(cfg.access(&mut buf, 0x48, false).unwrap(), 4);
        assert_eq!(buf, [0x5a, 0, 0, 0]);

        let cap = PciCapability {
            offset: 0xc0,
            size: usize::MAX,
        };
        assert_eq!(cap.end(), usize::MAX);
        assert_eq!(cfg.next_segment(0xc0, 0x40), (Segment::Capability(cap), 0x40));
        assert_eq!(cfg.access(&mut [0u8; 0x40], 0xc0, false).unwrap(), 0x40);
    }

    #[test]
    fn test_access_header_and_capability() {
        let calls = Calls::default();
        let mut cfg = config_space(&calls);
        cfg.data[0x3c..0x44].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);

        let mut buf = [0u8; 8];
        assert_eq!(cfg.access(&mut buf, 0x3c, false).unwrap(), 8);
        assert_eq!(buf, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(*calls.lock().unwrap(), vec![(0x40, 4, false)]);

        calls.lock().unwrap().clear();
        let mut buf = [0x0a, 0, 0, 0, 0xa5, 0xa5, 0xa5, 0xa5];
        assert_eq!(cfg.access(&mut buf, PCI_INTERRUPT_LINE, true).unwrap(), 8);
        assert_eq!(cfg.interrupt_line(), 0x0a);
        assert_eq!(&cfg.as_slice()[0x40..0x44], &[0xa5; 4]);
        assert_eq!(*calls.lock().unwrap(), vec![(0x40, 4, true)]);
    }

    #[test]
    fn test_access_vendor() {
        let calls = Calls::default();
        let mut cfg = config_space(&calls);
        cfg.data[0x50] = 0x77;

        // raw reads without a callback, writes are refused
        let mut buf = [0u8; 0x20];
        assert_eq!(cfg.access(&mut buf, 0x48, false).unwrap(), 0x20);
        assert_eq!(buf[8], 0x77);
        assert_eq!(calls.lock().unwrap().len(), 2);
        assert!(matches!(
            cfg.access(&mut [0u8; 4], 0x80, true),
            Err(Error::InvalidArgument(_))
        ));

        let vendor = Calls::default();
        cfg.set_access_callback(Box::new(TestCallback {
            calls: vendor.clone(),
            ret: Some(0x8),
        }));
        let mut buf = [0u8; 0x10];
        assert_eq!(cfg.access(&mut buf, 0x50, true).unwrap(), 0x10);
        assert_eq!(*vendor.lock().unwrap(), vec![(0x50, 0x10, true), (0x58, 0x8, true)]);
        assert_eq!(buf, [0xab; 0x10]);
    }

    #[test]
    fn test_access_errors() {
        let calls = Calls::default();
        let mut cfg = config_space(&calls);

        assert!(matches!(
            cfg.access(&mut [0u8; 4], 0xfe, false),
            Err(Error::OutOfRange(0xfe, 4))
        ));
        assert!(matches!(
            cfg.access(&mut [0u8; 1], usize::MAX, false),
            Err(Error::OutOfRange(..))
        ));
        assert_eq!(cfg.access(&mut [], 0x100, false).unwrap(), 0);

        cfg.set_access_callback(Box::new(TestCallback {
            calls: calls.clone(),
            ret: Some(0),
        }));
        assert!(matches!(
            cfg.access(&mut [0u8; 4], 0x80, false),
            Err(Error::InvalidArgument(_))
        ));
        cfg.set_access_callback(Box::new(TestCallback {
            calls: calls.clone(),
            ret: Some(8),
        }));
        assert!(matches!(
            cfg.access(&mut [0u8; 4], 0x80, false),
            Err(Error::InvalidArgument(_))
        ));
        cfg.set_access_callback(Box::new(TestCallback {
            calls: calls.clone(),
            ret: None,
        }));
        assert!(matches!(
            cfg.access(&mut [0u8; 4], 0x80, false),
            Err(Error::Callback(_))
        ));
    }

    #[test]
    fn test_access_partial_failure() {
        let mut cfg = PciConfigSpace::new(PciType::Conventional, 0).unwrap();

        // the interrupt line is updated before the vendor write is refused
        let mut buf = [0x0b, 0, 0, 0, 0, 0, 0, 0];
        assert!(matches!(
            cfg.access(&mut buf, PCI_INTERRUPT_LINE, true),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(cfg.interrupt_line(), 0x0b);

        let mut buf = PCI_COMMAND_MEMORY.to_le_bytes();
        assert_eq!(cfg.access(&mut buf, PCI_COMMAND, true).unwrap(), 2);
        assert_eq!(cfg.command(), PCI_COMMAND_MEMORY);
    }
}
