// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The device side of one mailbox ring.

use iecm_defs::ctlq::CTLQ_DESC_SIZE;
use iecm_defs::ctlq::CtlqDesc;
use iecm_defs::regs;
use user_driver::emulated::EmulatedDma;

/// A message on the mailbox, in either direction.
#[derive(Debug, Clone)]
pub struct Message {
    pub op: iecm_defs::virtchnl2::VirtchnlOp,
    pub status: iecm_defs::virtchnl2::VirtchnlStatus,
    pub data: Vec<u8>,
}

/// The registers of a mailbox ring and the device's position in it.
#[derive(Debug, Default)]
pub struct DeviceRing {
    bal: u32,
    bah: u32,
    len: u32,
    /// The next descriptor the device will consume.
    pub head: u16,
    /// One past the last descriptor the driver made available.
    pub tail: u16,
}

/// Register offsets relative to the first register of a ring.
pub const REG_BAL: usize = 0x0;
pub const REG_BAH: usize = 0x4;
pub const REG_LEN: usize = 0x8;
pub const REG_HEAD: usize = 0xc;
pub const REG_TAIL: usize = 0x10;

impl DeviceRing {
    pub fn count(&self) -> u16 {
        (self.len & regs::QLEN_MASK) as u16
    }

    pub fn is_enabled(&self) -> bool {
        self.len & regs::QLEN_ENABLE != 0 && self.count() > 0
    }

    fn base(&self) -> u64 {
        (self.bah as u64) << 32 | self.bal as u64
    }

    /// Returns true if the driver has made descriptors available.
    pub fn has_work(&self) -> bool {
        self.is_enabled() && self.head != self.tail
    }

    pub fn advance(&mut self) {
        self.head = (self.head + 1) % self.count().max(1);
    }

    pub fn read_reg(&self, reg: usize) -> u32 {
        match reg {
            REG_BAL => self.bal,
            REG_BAH => self.bah,
            REG_LEN => self.len,
            REG_HEAD => self.head.into(),
            REG_TAIL => self.tail.into(),
            _ => 0,
        }
    }

    pub fn write_reg(&mut self, reg: usize, value: u32) {
        match reg {
            REG_BAL => self.bal = value,
            REG_BAH => self.bah = value,
            REG_LEN => {
                self.len = value;
                if !self.is_enabled() {
                    self.head = 0;
                    self.tail = 0;
                }
            }
            REG_HEAD => self.head = (value & regs::QHEAD_MASK) as u16,
            REG_TAIL => self.tail = (value & regs::QHEAD_MASK) as u16,
            _ => {}
        }
    }

    /// Reads the descriptor at the device head.
    pub fn read_head(&self, dma: &EmulatedDma) -> Option<CtlqDesc> {
        let mem = dma.resolve(self.desc_addr(), CTLQ_DESC_SIZE)?;
        Some(mem.read_obj(0))
    }

    /// Writes back the descriptor at the device head.
    pub fn write_head(&self, dma: &EmulatedDma, desc: &CtlqDesc) -> bool {
        let Some(mem) = dma.resolve(self.desc_addr(), CTLQ_DESC_SIZE) else {
            return false;
        };
        mem.write_obj(0, desc);
        true
    }

    fn desc_addr(&self) -> u64 {
        self.base() + self.head as u64 * CTLQ_DESC_SIZE as u64
    }
}
