// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! virtchnl2 messages exchanged with the control plane over the mailbox.
//!
//! Messages with a variable number of entries are a fixed header followed
//! directly by the entries, and carry the entry count in the header.

use static_assertions::const_assert_eq;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

pub const VIRTCHNL2_VERSION_MAJOR: u32 = 2;
pub const VIRTCHNL2_VERSION_MINOR: u32 = 0;

wire_enum! {
    pub enum VirtchnlOp: u32 {
        UNKNOWN = 0,
        VERSION = 1,
        GET_CAPS = 500,
        CREATE_VPORT = 501,
        DESTROY_VPORT = 502,
        ENABLE_VPORT = 503,
        DISABLE_VPORT = 504,
        CONFIG_TX_QUEUES = 505,
        CONFIG_RX_QUEUES = 506,
        ENABLE_QUEUES = 507,
        DISABLE_QUEUES = 508,
        ADD_QUEUES = 509,
        DEL_QUEUES = 510,
        MAP_QUEUE_VECTOR = 511,
        UNMAP_QUEUE_VECTOR = 512,
        GET_RSS_KEY = 513,
        SET_RSS_KEY = 514,
        GET_RSS_LUT = 515,
        SET_RSS_LUT = 516,
        GET_RSS_HASH = 517,
        SET_RSS_HASH = 518,
        SET_SRIOV_VFS = 519,
        ALLOC_VECTORS = 520,
        DEALLOC_VECTORS = 521,
        EVENT = 522,
        GET_STATS = 523,
        RESET_VF = 524,
        GET_PTYPE_INFO = 526,
    }
}

wire_enum! {
    pub enum VirtchnlStatus: u32 {
        SUCCESS = 0,
        ERR_EPERM = 1,
        ERR_ESRCH = 3,
        ERR_EIO = 5,
        ERR_ENXIO = 6,
        ERR_EACCES = 13,
        ERR_EBUSY = 16,
        ERR_EEXIST = 17,
        ERR_EINVAL = 22,
        ERR_ENOSPC = 28,
        ERR_ERANGE = 34,
        ERR_EOPNOTSUPP = 95,
    }
}

wire_enum! {
    pub enum QueueType: u32 {
        TX = 0,
        RX = 1,
        TX_COMPLETION = 2,
        RX_BUFFER = 3,
        CONFIG_TX = 4,
        CONFIG_RX = 5,
        MBX_TX = 6,
        MBX_RX = 7,
    }
}

wire_enum! {
    pub enum QueueModel: u16 {
        SINGLE = 0,
        SPLIT = 1,
    }
}

wire_enum! {
    pub enum TxSchedMode: u16 {
        QUEUE = 0,
        FLOW = 1,
    }
}

wire_enum! {
    pub enum EventCode: u32 {
        UNKNOWN = 0,
        LINK_CHANGE = 2,
        RESET_IMPENDING = 3,
    }
}

pub const VPORT_TYPE_DEFAULT: u16 = 0;

// Checksum capabilities.
pub const CAP_TX_CSUM_L3_IPV4: u32 = 1 << 0;
pub const CAP_TX_CSUM_L4_IPV4_TCP: u32 = 1 << 1;
pub const CAP_TX_CSUM_L4_IPV4_UDP: u32 = 1 << 2;
pub const CAP_TX_CSUM_L4_IPV4_SCTP: u32 = 1 << 3;
pub const CAP_TX_CSUM_L4_IPV6_TCP: u32 = 1 << 4;
pub const CAP_TX_CSUM_L4_IPV6_UDP: u32 = 1 << 5;
pub const CAP_TX_CSUM_L4_IPV6_SCTP: u32 = 1 << 6;
pub const CAP_TX_CSUM_GENERIC: u32 = 1 << 7;
pub const CAP_RX_CSUM_L3_IPV4: u32 = 1 << 8;
pub const CAP_RX_CSUM_L4_IPV4_TCP: u32 = 1 << 9;
pub const CAP_RX_CSUM_L4_IPV4_UDP: u32 = 1 << 10;
pub const CAP_RX_CSUM_L4_IPV4_SCTP: u32 = 1 << 11;
pub const CAP_RX_CSUM_L4_IPV6_TCP: u32 = 1 << 12;
pub const CAP_RX_CSUM_L4_IPV6_UDP: u32 = 1 << 13;
pub const CAP_RX_CSUM_L4_IPV6_SCTP: u32 = 1 << 14;
pub const CAP_RX_CSUM_GENERIC: u32 = 1 << 15;

// Segmentation capabilities.
pub const CAP_SEG_IPV4_TCP: u32 = 1 << 0;
pub const CAP_SEG_IPV4_UDP: u32 = 1 << 1;
pub const CAP_SEG_IPV4_SCTP: u32 = 1 << 2;
pub const CAP_SEG_IPV6_TCP: u32 = 1 << 3;
pub const CAP_SEG_IPV6_UDP: u32 = 1 << 4;
pub const CAP_SEG_IPV6_SCTP: u32 = 1 << 5;

// Header split capabilities.
pub const CAP_RX_HSPLIT_AT_L2: u32 = 1 << 0;
pub const CAP_RX_HSPLIT_AT_L3: u32 = 1 << 1;
pub const CAP_RX_HSPLIT_AT_L4V4: u32 = 1 << 2;
pub const CAP_RX_HSPLIT_AT_L4V6: u32 = 1 << 3;

// Receive side coalescing capabilities.
pub const CAP_RSC_IPV4_TCP: u32 = 1 << 0;
pub const CAP_RSC_IPV4_SCTP: u32 = 1 << 1;
pub const CAP_RSC_IPV6_TCP: u32 = 1 << 2;
pub const CAP_RSC_IPV6_SCTP: u32 = 1 << 3;

// Other capabilities.
pub const CAP_SRIOV: u64 = 1 << 1;
pub const CAP_MACFILTER: u64 = 1 << 2;
/// Flow based scheduling of split Tx queues.
pub const CAP_SPLITQ_QSCHED: u64 = 1 << 4;
pub const CAP_WB_ON_ITR: u64 = 1 << 7;
pub const CAP_LINK_SPEED: u64 = 1 << 9;

// Rx queue flags.
pub const RXQ_RSC: u16 = 1 << 0;
pub const RXQ_HDR_SPLIT: u16 = 1 << 1;
pub const RXQ_IMMEDIATE_WRITE_BACK: u16 = 1 << 2;

// Rx descriptor id bitmaps.
pub const RXDID_1_32B_BASE_M: u64 = 1 << 1;
pub const RXDID_7_FLEX_SPLITQ_M: u64 = 1 << 7;

// Tx descriptor id bitmaps.
pub const TXDID_DATA_M: u64 = 1 << 0;
pub const TXDID_FLEX_DATA_M: u64 = 1 << 8;
pub const TXDID_FLEX_FLOW_SCHED_M: u64 = 1 << 12;

/// Bit positions in the ptype group mask of [`RssHash`].
pub const RSS_HASH_IPV4_TCP: u64 = 1 << 31;
pub const RSS_HASH_IPV4_UDP: u64 = 1 << 33;
pub const RSS_HASH_IPV4_OTHER: u64 = 1 << 35;
pub const RSS_HASH_IPV6_TCP: u64 = 1 << 41;
pub const RSS_HASH_IPV6_UDP: u64 = 1 << 43;
pub const RSS_HASH_IPV6_OTHER: u64 = 1 << 45;
pub const RSS_HASH_DEFAULT: u64 = RSS_HASH_IPV4_TCP
    | RSS_HASH_IPV4_UDP
    | RSS_HASH_IPV4_OTHER
    | RSS_HASH_IPV6_TCP
    | RSS_HASH_IPV6_UDP
    | RSS_HASH_IPV6_OTHER;

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct VersionInfo {
    pub major: u32,
    pub minor: u32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct GetCapabilities {
    pub csum_caps: u32,
    pub seg_caps: u32,
    pub hsplit_caps: u32,
    pub rsc_caps: u32,
    pub rss_caps: u64,
    pub other_caps: u64,
    pub mailbox_dyn_ctl: u32,
    pub mailbox_vector_id: u16,
    pub num_allocated_vectors: u16,
    pub max_rx_q: u16,
    pub max_tx_q: u16,
    pub max_rx_bufq: u16,
    pub max_tx_complq: u16,
    pub max_sriov_vfs: u16,
    pub max_vports: u16,
    pub default_num_vports: u16,
    pub max_tx_hdr_size: u16,
    pub max_sg_bufs_per_tx_pkt: u8,
    pub reserved1: u8,
    pub pad1: u16,
    pub reserved2: u32,
}

/// A range of queues of one type, with the location of their tail
/// registers.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct QueueRegChunk {
    pub queue_type: QueueType,
    pub start_queue_id: u32,
    pub num_queues: u32,
    pub pad: u32,
    pub qtail_reg_start: u64,
    pub qtail_reg_spacing: u32,
    pub pad1: u32,
}

/// Create vport request and reply. Followed by `num_chunks`
/// [`QueueRegChunk`] entries in the reply.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct CreateVport {
    pub vport_type: u16,
    pub txq_model: QueueModel,
    pub rxq_model: QueueModel,
    pub num_tx_q: u16,
    pub num_tx_complq: u16,
    pub num_rx_q: u16,
    pub num_rx_bufq: u16,
    pub default_rx_q: u16,
    pub vport_index: u16,
    pub max_mtu: u16,
    pub vport_id: u32,
    pub default_mac_addr: [u8; 6],
    pub pad: u16,
    pub rx_desc_ids: u64,
    pub tx_desc_ids: u64,
    pub rss_algorithm: u32,
    pub rss_key_size: u16,
    pub rss_lut_size: u16,
    pub rx_split_pos: u32,
    pub reserved: u32,
    pub num_chunks: u16,
    pub pad1: [u8; 6],
}

/// Identifies a vport in destroy, enable and disable requests.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct VportId {
    pub vport_id: u32,
}

/// Config Tx queues header. Followed by `num_qinfo` [`TxqInfo`] entries.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ConfigTxQueues {
    pub vport_id: u32,
    pub num_qinfo: u16,
    pub pad: [u8; 10],
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct TxqInfo {
    pub dma_ring_addr: u64,
    pub queue_type: QueueType,
    pub queue_id: u32,
    pub relative_queue_id: u16,
    pub model: QueueModel,
    pub sched_mode: TxSchedMode,
    pub qflags: u16,
    pub ring_len: u16,
    pub tx_compl_queue_id: u16,
    pub peer_type: u16,
    pub peer_rx_queue_id: u16,
    pub pad: [u8; 4],
    pub egress_pasid: u32,
    pub egress_hdr_pasid: u32,
    pub egress_buf_pasid: u32,
    pub pad1: [u8; 8],
}

/// Config Rx queues header. Followed by `num_qinfo` [`RxqInfo`] entries.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ConfigRxQueues {
    pub vport_id: u32,
    pub num_qinfo: u16,
    pub pad: [u8; 18],
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct RxqInfo {
    pub desc_ids: u64,
    pub dma_ring_addr: u64,
    pub queue_type: QueueType,
    pub queue_id: u32,
    pub model: QueueModel,
    pub hdr_buffer_size: u16,
    pub data_buffer_size: u32,
    pub max_pkt_size: u32,
    pub ring_len: u16,
    pub buffer_notif_stride: u8,
    pub pad: u8,
    pub dma_head_wb_addr: u64,
    pub qflags: u16,
    pub rx_buffer_low_watermark: u16,
    pub rx_bufq1_id: u16,
    pub rx_bufq2_id: u16,
    pub bufq2_ena: u8,
    pub pad1: [u8; 3],
    pub ingress_pasid: u32,
    pub ingress_hdr_pasid: u32,
    pub ingress_buf_pasid: u32,
}

/// A range of queues of one type.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct QueueChunk {
    pub queue_type: QueueType,
    pub start_queue_id: u32,
    pub num_queues: u32,
    pub pad: u32,
}

/// Enable, disable and delete queues header. Followed by `num_chunks`
/// [`QueueChunk`] entries.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct DelEnaDisQueues {
    pub vport_id: u32,
    pub pad: u32,
    pub num_chunks: u16,
    pub pad1: [u8; 6],
}

/// Add queues request and reply. Followed by `num_chunks`
/// [`QueueRegChunk`] entries in the reply.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct AddQueues {
    pub vport_id: u32,
    pub num_tx_q: u16,
    pub num_tx_complq: u16,
    pub num_rx_q: u16,
    pub num_rx_bufq: u16,
    pub pad: [u8; 4],
    pub num_chunks: u16,
    pub pad1: [u8; 6],
}

/// Map and unmap queue vector header. Followed by `num_qv_maps`
/// [`QueueVector`] entries.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct QueueVectorMaps {
    pub vport_id: u32,
    pub num_qv_maps: u16,
    pub pad: [u8; 10],
}

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct QueueVector {
    pub queue_id: u32,
    pub vector_id: u16,
    pub pad: u16,
    pub itr_idx: u32,
    pub queue_type: QueueType,
}

/// A range of vectors with the location of their control registers.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct VectorChunk {
    pub start_vector_id: u16,
    pub start_evv_id: u16,
    pub num_vectors: u16,
    pub pad1: u16,
    pub dynctl_reg_start: u32,
    pub dynctl_reg_spacing: u32,
    pub itrn_reg_start: u32,
    pub itrn_reg_spacing: u32,
    pub reserved: [u8; 8],
}

/// Alloc vectors request and reply. Followed by `num_vchunks`
/// [`VectorChunk`] entries in the reply.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct AllocVectors {
    pub num_vectors: u16,
    pub pad: [u8; 14],
    pub num_vchunks: u16,
    pub pad1: [u8; 14],
}

/// Dealloc vectors header. Followed by `num_vchunks` [`VectorChunk`]
/// entries.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct VectorChunks {
    pub num_vchunks: u16,
    pub pad: [u8; 14],
}

/// RSS key header. Followed by `key_len` key bytes.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct RssKey {
    pub vport_id: u32,
    pub key_len: u16,
    pub pad: [u8; 2],
}

/// RSS lookup table header. Followed by `lut_entries` `u32` entries.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct RssLut {
    pub vport_id: u32,
    pub lut_entries_start: u16,
    pub lut_entries: u16,
    pub pad: [u8; 4],
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct RssHash {
    pub ptype_groups: u64,
    pub vport_id: u32,
    pub pad: [u8; 4],
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Default, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct VportStats {
    pub vport_id: u32,
    pub pad: [u8; 4],
    pub rx_bytes: u64,
    pub rx_unicast: u64,
    pub rx_multicast: u64,
    pub rx_broadcast: u64,
    pub rx_discards: u64,
    pub rx_errors: u64,
    pub rx_unknown_protocol: u64,
    pub tx_bytes: u64,
    pub tx_unicast: u64,
    pub tx_multicast: u64,
    pub tx_broadcast: u64,
    pub tx_discards: u64,
    pub tx_errors: u64,
    pub rx_invalid_frame_length: u64,
    pub rx_overflow_drop: u64,
}

/// An unsolicited notification from the control plane.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Event {
    pub event: EventCode,
    /// Link speed in Mbps.
    pub link_speed: u32,
    pub vport_id: u32,
    pub link_status: u8,
    pub pad: u8,
    pub adi_id: u16,
}

const_assert_eq!(size_of::<VersionInfo>(), 8);
const_assert_eq!(size_of::<GetCapabilities>(), 64);
const_assert_eq!(size_of::<QueueRegChunk>(), 32);
const_assert_eq!(size_of::<CreateVport>(), 72);
const_assert_eq!(size_of::<ConfigTxQueues>(), 16);
const_assert_eq!(size_of::<TxqInfo>(), 56);
const_assert_eq!(size_of::<ConfigRxQueues>(), 24);
const_assert_eq!(size_of::<RxqInfo>(), 72);
const_assert_eq!(size_of::<QueueChunk>(), 16);
const_assert_eq!(size_of::<DelEnaDisQueues>(), 16);
const_assert_eq!(size_of::<AddQueues>(), 24);
const_assert_eq!(size_of::<QueueVectorMaps>(), 16);
const_assert_eq!(size_of::<QueueVector>(), 16);
const_assert_eq!(size_of::<VectorChunk>(), 32);
const_assert_eq!(size_of::<AllocVectors>(), 32);
const_assert_eq!(size_of::<VectorChunks>(), 16);
const_assert_eq!(size_of::<RssKey>(), 8);
const_assert_eq!(size_of::<RssLut>(), 12);
const_assert_eq!(size_of::<RssHash>(), 16);
const_assert_eq!(size_of::<VportStats>(), 128);
const_assert_eq!(size_of::<Event>(), 16);

/// Reads `count` entries of `T` from the start of `bytes`. Returns `None` if
/// `bytes` is too short.
pub fn read_entries<T: FromBytes>(bytes: &[u8], count: usize) -> Option<Vec<T>> {
    let len = count.checked_mul(size_of::<T>())?;
    let bytes = bytes.get(..len)?;
    bytes
        .chunks_exact(size_of::<T>())
        .map(|b| T::read_from_bytes(b).ok())
        .collect()
}

/// Encodes a message made of a fixed header and a list of entries.
pub fn encode<H: IntoBytes + Immutable, T: IntoBytes + Immutable>(
    header: &H,
    entries: &[T],
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(size_of::<H>() + size_of_val(entries));
    buf.extend_from_slice(header.as_bytes());
    buf.extend_from_slice(entries.as_bytes());
    buf
}

/// Splits a message into its fixed header and the remaining bytes.
pub fn split_header<H: FromBytes>(bytes: &[u8]) -> Option<(H, &[u8])> {
    H::read_from_prefix(bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_round_trip_through_encode() {
        let header = QueueVectorMaps {
            vport_id: 7,
            num_qv_maps: 2,
            pad: [0; 10],
        };
        let maps = [
            QueueVector {
                queue_id: 1,
                vector_id: 3,
                pad: 0,
                itr_idx: 0,
                queue_type: QueueType::RX,
            },
            QueueVector {
                queue_id: 2,
                vector_id: 4,
                pad: 0,
                itr_idx: 1,
                queue_type: QueueType::TX,
            },
        ];
        let buf = encode(&header, &maps);
        let (h, rest) = split_header::<QueueVectorMaps>(&buf).unwrap();
        assert_eq!(h.vport_id, 7);
        let decoded = read_entries::<QueueVector>(rest, h.num_qv_maps.into()).unwrap();
        assert_eq!(decoded, maps);
        assert!(read_entries::<QueueVector>(rest, 3).is_none());
    }

    #[test]
    fn unknown_values_format_numerically() {
        assert_eq!(format!("{:?}", VirtchnlOp::GET_CAPS), "GET_CAPS");
        assert_eq!(format!("{:?}", VirtchnlOp(9999)), "9999");
    }
}
