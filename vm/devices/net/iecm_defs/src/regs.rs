// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! BAR 0 register layout.
//!
//! Queue tail and vector control registers are not at fixed offsets; their
//! base and spacing are reported by the control plane in the create-vport and
//! alloc-vectors replies. The defaults below are what the emulated device
//! reports.

use bitfield_struct::bitfield;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Mailbox send queue (driver to control plane).
pub const ATQ_BAL: usize = 0x0000;
pub const ATQ_BAH: usize = 0x0004;
pub const ATQ_LEN: usize = 0x0008;
pub const ATQ_HEAD: usize = 0x000c;
pub const ATQ_TAIL: usize = 0x0010;

/// Mailbox receive queue (control plane to driver).
pub const ARQ_BAL: usize = 0x0020;
pub const ARQ_BAH: usize = 0x0024;
pub const ARQ_LEN: usize = 0x0028;
pub const ARQ_HEAD: usize = 0x002c;
pub const ARQ_TAIL: usize = 0x0030;

/// Set in a `*_LEN` register to enable the queue.
pub const QLEN_ENABLE: u32 = 1 << 31;
pub const QLEN_MASK: u32 = 0x3ff;
pub const QHEAD_MASK: u32 = 0x3ff;

/// Function reset status.
pub const RSTAT: usize = 0x0040;
pub const RSTAT_STATE_MASK: u32 = 0x3;
pub const RSTAT_INPROGRESS: u32 = 0;
pub const RSTAT_COMPLETED: u32 = 1;
pub const RSTAT_ACTIVE: u32 = 2;

/// Dynamic control register of the mailbox vector.
pub const MBX_DYN_CTL: usize = 0x0050;

pub const DEFAULT_QTAIL_BASE: u64 = 0x1_0000;
pub const DEFAULT_QTAIL_SPACING: u32 = 4;
pub const DEFAULT_DYN_CTL_BASE: u32 = 0x2_0000;
pub const DEFAULT_DYN_CTL_SPACING: u32 = 4;

/// ITR register indexes.
pub const ITR_IDX_RX: u8 = 0;
pub const ITR_IDX_TX: u8 = 1;
pub const ITR_IDX_NONE: u8 = 3;

/// The value of a per-vector dynamic control register.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct DynCtl {
    pub intena: bool,
    pub clearpba: bool,
    pub swint_trig: bool,
    #[bits(2)]
    pub itr_indx: u8,
    /// The interval, in 2us units.
    #[bits(12)]
    pub interval: u16,
    #[bits(7)]
    reserved1: u8,
    pub sw_itr_indx_ena: bool,
    #[bits(2)]
    pub sw_itr_indx: u8,
    #[bits(3)]
    reserved2: u8,
    pub wb_on_itr: bool,
    pub intena_msk: bool,
}
