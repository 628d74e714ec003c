// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Transmit, transmit completion, receive and receive buffer descriptors.

use bitfield_struct::bitfield;
use static_assertions::const_assert_eq;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

// Tx descriptor types.
pub const TX_DESC_DTYPE_DATA: u8 = 0x0;
pub const TX_DESC_DTYPE_CTX: u8 = 0x1;
pub const TX_DESC_DTYPE_FLEX_TSO_CTX: u8 = 0x5;
pub const TX_DESC_DTYPE_FLEX_DATA: u8 = 0x8;
pub const TX_DESC_DTYPE_FLEX_FLOW_SCHE: u8 = 0xc;
/// Written back by hardware to a single queue data descriptor once it has
/// been processed.
pub const TX_DESC_DTYPE_DESC_DONE: u8 = 0xf;

pub const TX_DESC_SIZE: usize = 16;

/// The largest buffer a single data descriptor can describe.
pub const TX_MAX_DESC_DATA: u32 = 16 * 1024 - 1;
/// The data limit of one descriptor when a buffer is split, chosen so that
/// every split point falls on a 4KB boundary.
pub const TX_MAX_DESC_DATA_ALIGNED: u32 = TX_MAX_DESC_DATA & !(4096 - 1);

pub const TX_MAX_BUF_SIZE: u32 = 0x3fff;

// Base (single queue) data descriptor commands.
pub const TX_BASE_CMD_EOP: u16 = 0x0001;
pub const TX_BASE_CMD_RS: u16 = 0x0002;
pub const TX_BASE_CMD_ICRC: u16 = 0x0004;
pub const TX_BASE_CMD_IL2TAG1: u16 = 0x0008;
pub const TX_BASE_CMD_IIPT_IPV6: u16 = 0x0020;
pub const TX_BASE_CMD_IIPT_IPV4: u16 = 0x0040;
pub const TX_BASE_CMD_IIPT_IPV4_CSUM: u16 = 0x0060;
pub const TX_BASE_CMD_L4T_EOFT_TCP: u16 = 0x0100;
pub const TX_BASE_CMD_L4T_EOFT_SCTP: u16 = 0x0200;
pub const TX_BASE_CMD_L4T_EOFT_UDP: u16 = 0x0300;

/// Base (single queue) data descriptor.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct TxBaseDesc {
    pub buf_addr: u64,
    pub qw1: TxBaseQw1,
}

#[bitfield(u64)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct TxBaseQw1 {
    #[bits(4)]
    pub dtype: u8,
    #[bits(12)]
    pub cmd: u16,
    /// MAC header length in 2-byte words.
    #[bits(7)]
    pub maclen: u8,
    /// IP header length in 4-byte words.
    #[bits(7)]
    pub iplen: u8,
    /// L4 header length in 4-byte words.
    #[bits(4)]
    pub l4len: u8,
    #[bits(14)]
    pub buf_size: u16,
    pub l2tag1: u16,
}

pub const TX_CTX_CMD_TSO: u8 = 0x01;

/// Base (single queue) context descriptor, used for segmentation offload.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct TxBaseCtxDesc {
    pub tunneling_params: u32,
    pub l2tag2: u16,
    pub reserved: u16,
    pub qw1: TxBaseCtxQw1,
}

#[bitfield(u64)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct TxBaseCtxQw1 {
    #[bits(4)]
    pub dtype: u8,
    #[bits(7)]
    pub cmd: u8,
    #[bits(19)]
    reserved1: u32,
    #[bits(18)]
    pub tso_len: u32,
    #[bits(2)]
    reserved2: u8,
    #[bits(14)]
    pub mss: u16,
}

// Flex (split queue) data descriptor commands.
pub const TX_FLEX_CMD_EOP: u16 = 0x0001;
pub const TX_FLEX_CMD_RS: u16 = 0x0002;
pub const TX_FLEX_CMD_RE: u16 = 0x0004;
pub const TX_FLEX_CMD_CS_EN: u16 = 0x0010;
/// Segmentation command of the flex context descriptor.
pub const TX_FLEX_CTX_CMD_TSO: u16 = 0x0004;

#[bitfield(u16)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct TxFlexCmdDtype {
    #[bits(5)]
    pub dtype: u8,
    #[bits(11)]
    pub cmd: u16,
}

/// Flex data descriptor, used by split queues with queue based scheduling.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct TxFlexDesc {
    pub buf_addr: u64,
    pub cmd_dtype: TxFlexCmdDtype,
    pub l2tag1: u16,
    pub l2tag2: u16,
    pub buf_size: u16,
}

#[bitfield(u8)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct TxFlowCmdDtype {
    #[bits(5)]
    pub dtype: u8,
    pub eop: bool,
    pub cs_en: bool,
    pub re: bool,
}

pub const TX_FLOW_BUF_SIZE_MASK: u16 = 0x3fff;

/// Flow scheduling data descriptor. The completion tag identifies the packet
/// in the out-of-order completion reported for it.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct TxFlowSchedDesc {
    pub buf_addr: u64,
    pub cmd_dtype: TxFlowCmdDtype,
    pub reserved: [u8; 3],
    pub compl_tag: u16,
    pub rxr_bufsize: u16,
}

/// Flex segmentation context descriptor.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct TxFlexTsoCtxDesc {
    /// Total length of the TSO payload, 18 bits.
    pub flex_tlen: u32,
    /// Maximum segment size, 14 bits.
    pub mss_rt: u16,
    pub hdr_len: u8,
    pub flex: u8,
    pub cmd_dtype: TxFlexCmdDtype,
    pub reserved: [u8; 6],
}

pub const TX_FLEX_TLEN_MASK: u32 = 0x3ffff;
pub const TX_MSS_MASK: u16 = 0x3fff;

const_assert_eq!(size_of::<TxBaseDesc>(), TX_DESC_SIZE);
const_assert_eq!(size_of::<TxBaseCtxDesc>(), TX_DESC_SIZE);
const_assert_eq!(size_of::<TxFlexDesc>(), TX_DESC_SIZE);
const_assert_eq!(size_of::<TxFlowSchedDesc>(), TX_DESC_SIZE);
const_assert_eq!(size_of::<TxFlexTsoCtxDesc>(), TX_DESC_SIZE);

// Split completion types.
pub const TX_COMPLT_ITR_FLUSH: u8 = 0;
pub const TX_COMPLT_RULE_MISS: u8 = 1;
/// Buffer completion: queue head (queue scheduling) or completion tag (flow
/// scheduling).
pub const TX_COMPLT_RS: u8 = 2;
pub const TX_COMPLT_REINJECTED: u8 = 3;
/// Descriptor completion: the queue head up to which descriptors are done.
pub const TX_COMPLT_RE: u8 = 4;
pub const TX_COMPLT_SW_MARKER: u8 = 5;

#[bitfield(u16)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct TxComplQidTypeGen {
    #[bits(10)]
    pub qid: u16,
    reserved1: bool,
    #[bits(3)]
    pub compl_type: u8,
    reserved2: bool,
    pub generation: bool,
}

/// Split queue Tx completion descriptor.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct TxSplitqComplDesc {
    pub qid_comptype_gen: TxComplQidTypeGen,
    /// The queue head for RE completions, the completion tag for flow
    /// scheduled RS completions.
    pub q_head_compl_tag: u16,
    pub ts: [u8; 3],
    pub reserved: u8,
}

pub const TX_COMPL_DESC_SIZE: usize = size_of::<TxSplitqComplDesc>();
const_assert_eq!(TX_COMPL_DESC_SIZE, 8);

pub const RX_DESC_SIZE: usize = 32;

/// Single queue receive descriptor, as posted by the driver.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct RxSingleqReadDesc {
    pub pkt_addr: u64,
    pub hdr_addr: u64,
    pub reserved1: u64,
    pub reserved2: u64,
}

/// Single queue receive descriptor, as written back by hardware.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct RxSingleqWbDesc {
    pub l2tag1: u16,
    pub mirroring_status: u16,
    pub rss_hash: u32,
    pub qw1: RxSingleqQw1,
    pub ext_status: u16,
    pub reserved: u16,
    pub l2tag2_1: u16,
    pub l2tag2_2: u16,
    pub flex: u64,
}

/// The filter status value reporting a valid RSS hash.
pub const RX_SINGLEQ_FLTSTAT_RSS_HASH: u8 = 3;

#[bitfield(u64)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct RxSingleqQw1 {
    pub dd: bool,
    pub eof: bool,
    pub l2tag1p: bool,
    pub l3l4p: bool,
    pub crcp: bool,
    #[bits(7)]
    reserved1: u8,
    #[bits(2)]
    pub fltstat: u8,
    pub lpbk: bool,
    pub ipv6exadd: bool,
    #[bits(3)]
    reserved2: u8,
    pub rxe: bool,
    reserved3: bool,
    pub hbo: bool,
    pub ipe: bool,
    pub l4e: bool,
    pub eipe: bool,
    pub oversize: bool,
    reserved4: bool,
    #[bits(3)]
    reserved5: u8,
    pub ptype: u8,
    #[bits(14)]
    pub pkt_len: u16,
    #[bits(11)]
    pub hdr_len: u16,
    pub sph: bool,
}

/// Split queue receive buffer descriptor.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct RxBufDesc {
    pub buf_id: u16,
    pub reserved0: [u8; 6],
    pub pkt_addr: u64,
    pub hdr_addr: u64,
    pub reserved1: u64,
}

// status_err0_qw0 bits of the flex writeback descriptor.
pub const RX_FLEX_STATUS0_LPBK: u8 = 1 << 0;
pub const RX_FLEX_STATUS0_IPV6EXADD: u8 = 1 << 1;
pub const RX_FLEX_STATUS0_RXE: u8 = 1 << 2;
pub const RX_FLEX_STATUS0_CRCP: u8 = 1 << 3;
pub const RX_FLEX_STATUS0_RSS_VALID: u8 = 1 << 4;
pub const RX_FLEX_STATUS0_L2TAG1P: u8 = 1 << 5;

// status_err0_qw1 bits of the flex writeback descriptor.
pub const RX_FLEX_STATUS1_DD: u8 = 1 << 0;
pub const RX_FLEX_STATUS1_EOF: u8 = 1 << 1;
pub const RX_FLEX_STATUS1_HBO: u8 = 1 << 2;
pub const RX_FLEX_STATUS1_L3L4P: u8 = 1 << 3;
pub const RX_FLEX_STATUS1_XSUM_IPE: u8 = 1 << 4;
pub const RX_FLEX_STATUS1_XSUM_L4E: u8 = 1 << 5;
pub const RX_FLEX_STATUS1_XSUM_EIPE: u8 = 1 << 6;
pub const RX_FLEX_STATUS1_XSUM_EUDPE: u8 = 1 << 7;

#[bitfield(u16)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct RxFlexPtype {
    #[bits(10)]
    pub ptype: u16,
    #[bits(6)]
    pub fflags0: u8,
}

#[bitfield(u16)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct RxFlexPktlenGen {
    #[bits(14)]
    pub pkt_len: u16,
    pub generation: bool,
    pub bufq_id: bool,
}

#[bitfield(u16)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct RxFlexHdrlenFlags {
    #[bits(10)]
    pub hdr_len: u16,
    pub rsc: bool,
    pub sph: bool,
    pub miss_prepend: bool,
    #[bits(3)]
    reserved: u8,
}

/// Split queue flex receive writeback descriptor.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct RxFlexWbDesc {
    pub rxdid_ucast: u8,
    pub status_err0_qw0: u8,
    pub ptype_err_fflags0: RxFlexPtype,
    pub pktlen_gen_bufq_id: RxFlexPktlenGen,
    pub hdrlen_flags: RxFlexHdrlenFlags,
    pub status_err0_qw1: u8,
    pub status_err1: u8,
    pub fflags1: u8,
    pub ts_low: u8,
    pub buf_id: u16,
    /// Segment length of the last segment of a coalesced packet.
    pub rscseglen: u16,
    pub hash1: u16,
    pub ff2_mirrid_hash2: u8,
    pub hash3: u8,
    pub l2tag2: u16,
    pub fmd4: u16,
    pub l2tag1: u16,
    pub fmd6: u16,
    pub ts_high: u32,
}

impl RxFlexWbDesc {
    pub fn rss_hash(&self) -> u32 {
        self.hash1 as u32 | (self.ff2_mirrid_hash2 as u32) << 16 | (self.hash3 as u32) << 24
    }

    pub fn set_rss_hash(&mut self, hash: u32) {
        self.hash1 = hash as u16;
        self.ff2_mirrid_hash2 = (hash >> 16) as u8;
        self.hash3 = (hash >> 24) as u8;
    }
}

const_assert_eq!(size_of::<RxSingleqReadDesc>(), RX_DESC_SIZE);
const_assert_eq!(size_of::<RxSingleqWbDesc>(), RX_DESC_SIZE);
const_assert_eq!(size_of::<RxBufDesc>(), RX_DESC_SIZE);
const_assert_eq!(size_of::<RxFlexWbDesc>(), RX_DESC_SIZE);

/// The rx descriptor id of the flex split writeback format.
pub const RXDID_FLEX_SPLITQ: u8 = 7;
/// The rx descriptor id of the single queue base writeback format.
pub const RXDID_BASE: u8 = 1;
