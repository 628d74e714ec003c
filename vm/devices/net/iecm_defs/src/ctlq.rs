// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Control queue (mailbox) descriptor.

use static_assertions::const_assert_eq;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Descriptor done. Set by the consumer of the descriptor.
pub const CTLQ_FLAG_DD: u16 = 1 << 0;
/// Command completed.
pub const CTLQ_FLAG_CMP: u16 = 1 << 1;
/// The consumer reported an error in `ret_val`.
pub const CTLQ_FLAG_ERR: u16 = 1 << 2;
pub const CTLQ_FLAG_FTYPE_VM: u16 = 1 << 6;
pub const CTLQ_FLAG_FTYPE_PF: u16 = 1 << 7;
/// The indirect buffer is read by the consumer.
pub const CTLQ_FLAG_RD: u16 = 1 << 10;
pub const CTLQ_FLAG_VFC: u16 = 1 << 11;
/// The descriptor carries an indirect buffer.
pub const CTLQ_FLAG_BUF: u16 = 1 << 12;

/// Mailbox opcode for a message to the control plane.
pub const MBQ_OPC_SEND_MSG_TO_CP: u16 = 0x0801;
/// Mailbox opcode for a message to a peer driver.
pub const MBQ_OPC_SEND_MSG_TO_PEER: u16 = 0x0804;

pub const CTLQ_DESC_SIZE: usize = size_of::<CtlqDesc>();

/// Bytes of parameters carried directly in the descriptor.
pub const CTLQ_DIRECT_PARAMS_LEN: usize = 16;

/// A mailbox descriptor.
///
/// The virtchnl opcode of the message travels in `cookie_high` and the
/// virtchnl status of a reply in `cookie_low`.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct CtlqDesc {
    pub flags: u16,
    pub opcode: u16,
    pub datalen: u16,
    pub ret_val: u16,
    pub cookie_high: u32,
    pub cookie_low: u32,
    pub params: CtlqParams,
}

const_assert_eq!(size_of::<CtlqDesc>(), 32);

/// The parameter area of a [`CtlqDesc`], viewed as the indirect-buffer
/// layout. Direct parameters use the same 16 bytes as raw data.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct CtlqParams {
    pub param0: u32,
    pub param1: u32,
    pub addr_high: u32,
    pub addr_low: u32,
}

impl CtlqParams {
    pub fn indirect(addr: u64) -> Self {
        Self {
            param0: 0,
            param1: 0,
            addr_high: (addr >> 32) as u32,
            addr_low: addr as u32,
        }
    }

    pub fn direct(data: [u8; CTLQ_DIRECT_PARAMS_LEN]) -> Self {
        Self::read_from_bytes(&data[..]).unwrap_or_default()
    }

    pub fn addr(&self) -> u64 {
        (self.addr_high as u64) << 32 | self.addr_low as u64
    }

    pub fn direct_bytes(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl CtlqDesc {
    pub fn has_flags(&self, flags: u16) -> bool {
        self.flags & flags == flags
    }
}
