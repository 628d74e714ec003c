// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The receive path: descriptor processing, packet assembly, metadata
//! derivation and buffer replenishment for single and split queues.

use crate::bufpool::RxBufPool;
use crate::bufpool::RxFrag;
use crate::error::RingError;
use crate::error::RxError;
use crate::ptype::HashType;
use crate::ptype::L3Type;
use crate::ptype::L4Type;
use crate::ptype::PacketType;
use crate::ring::DescRing;
use crate::ring::RingRole;
use crate::tx::CleanStats;
use iecm_defs::txrx::RX_DESC_SIZE;
use iecm_defs::txrx::RX_FLEX_STATUS0_IPV6EXADD;
use iecm_defs::txrx::RX_FLEX_STATUS0_RSS_VALID;
use iecm_defs::txrx::RX_FLEX_STATUS1_EOF;
use iecm_defs::txrx::RX_FLEX_STATUS1_L3L4P;
use iecm_defs::txrx::RX_FLEX_STATUS1_XSUM_EIPE;
use iecm_defs::txrx::RX_FLEX_STATUS1_XSUM_EUDPE;
use iecm_defs::txrx::RX_FLEX_STATUS1_XSUM_IPE;
use iecm_defs::txrx::RX_FLEX_STATUS1_XSUM_L4E;
use iecm_defs::txrx::RX_SINGLEQ_FLTSTAT_RSS_HASH;
use iecm_defs::txrx::RXDID_FLEX_SPLITQ;
use iecm_defs::txrx::RxBufDesc;
use iecm_defs::txrx::RxFlexWbDesc;
use iecm_defs::txrx::RxSingleqReadDesc;
use iecm_defs::txrx::RxSingleqWbDesc;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use user_driver::DeviceRegisterIo;
use user_driver::DmaClient;

/// Packets up to this size are copied out whole so their buffer can be
/// reused right away. Larger packets get this much room for headers.
pub const RX_HDR_SIZE: usize = 256;
/// Buffer queue tail writes are rounded down to this many descriptors.
pub const RX_BUF_STRIDE: u16 = 8;
const RX_BI_GEN: u16 = 1 << 15;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum ChecksumState {
    #[default]
    Unknown,
    Good,
    Bad,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RxHash {
    pub value: u32,
    pub ty: HashType,
}

/// Reassembly metadata of a coalesced packet.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RscInfo {
    pub segs: u16,
    /// Payload bytes following the headers.
    pub payload_len: u32,
}

/// A received packet: copied header bytes followed by zero-copy page
/// fragments.
#[derive(Debug, Default)]
pub struct RxPacket {
    pub queue_id: u16,
    pub head: Vec<u8>,
    pub frags: Vec<RxFrag>,
    pub ptype: u16,
    pub ip_csum: ChecksumState,
    pub l4_csum: ChecksumState,
    pub hash: Option<RxHash>,
    pub rsc: Option<RscInfo>,
}

impl RxPacket {
    pub fn len(&self) -> usize {
        self.head.len() + self.frag_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn frag_len(&self) -> usize {
        self.frags.iter().map(|f| f.len()).sum()
    }

    /// Returns the packet bytes as one buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut data = self.head.clone();
        for frag in &self.frags {
            frag.copy_to(&mut data);
        }
        data
    }
}

/// Takes ownership of received packets.
pub trait RxDeliver {
    fn deliver(&mut self, packet: RxPacket);
}

impl RxDeliver for Vec<RxPacket> {
    fn deliver(&mut self, packet: RxPacket) {
        self.push(packet);
    }
}

/// Receive features enabled by the stack and granted by the device.
#[derive(Debug, Copy, Clone, Default)]
pub struct RxFeatures {
    pub csum: bool,
    pub hash: bool,
    pub rsc: bool,
    pub hsplit: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RxStats {
    pub packets: u64,
    pub bytes: u64,
    pub csum_errors: u64,
    pub rsc_packets: u64,
    pub rsc_failures: u64,
    pub copybreak: u64,
    pub bad_descs: u64,
}

/// Returns the length of the Ethernet, IP and TCP/UDP headers at the start
/// of `data`, stopping at the first layer it cannot parse.
pub fn eth_headlen(data: &[u8]) -> usize {
    let be16 = |at: usize| u16::from_be_bytes([data[at], data[at + 1]]);
    if data.len() < 14 {
        return data.len();
    }
    let mut off = 14;
    let mut ethertype = be16(12);
    while ethertype == 0x8100 || ethertype == 0x88a8 {
        if data.len() < off + 4 {
            return off;
        }
        ethertype = be16(off + 2);
        off += 4;
    }
    let proto = match ethertype {
        0x0800 => {
            if data.len() < off + 20 {
                return off;
            }
            let ihl = (data[off] & 0xf) as usize * 4;
            if ihl < 20 {
                return off;
            }
            let fragmented = be16(off + 6) & 0x3fff != 0;
            let proto = data[off + 9];
            off += ihl;
            if fragmented {
                return off.min(data.len());
            }
            proto
        }
        0x86dd => {
            if data.len() < off + 40 {
                return off;
            }
            let proto = data[off + 6];
            off += 40;
            proto
        }
        _ => return off,
    };
    let end = match proto {
        6 if data.len() >= off + 20 => off + ((data[off + 12] >> 4) as usize * 4).max(20),
        17 => off + 8,
        _ => off,
    };
    end.min(data.len())
}

/// A software ring through which a receive queue hands consumed buffer ids
/// back to a buffer queue. Entries carry a generation bit so the consumer
/// can tell new entries from stale ones.
pub struct RefillQueue {
    ring: Vec<u16>,
    next_to_use: usize,
    next_to_clean: usize,
    generation: bool,
    gen_chk: bool,
}

impl RefillQueue {
    pub fn new(count: u16) -> Self {
        Self {
            ring: vec![0; count as usize],
            next_to_use: 0,
            next_to_clean: 0,
            generation: true,
            gen_chk: true,
        }
    }

    pub fn push(&mut self, buf_id: u16) {
        self.ring[self.next_to_use] = buf_id | if self.generation { RX_BI_GEN } else { 0 };
        self.next_to_use += 1;
        if self.next_to_use == self.ring.len() {
            self.next_to_use = 0;
            self.generation = !self.generation;
        }
    }

    pub fn peek(&self) -> Option<u16> {
        let entry = self.ring[self.next_to_clean];
        ((entry & RX_BI_GEN != 0) == self.gen_chk).then_some(entry & !RX_BI_GEN)
    }

    pub fn advance(&mut self) {
        self.next_to_clean += 1;
        if self.next_to_clean == self.ring.len() {
            self.next_to_clean = 0;
            self.gen_chk = !self.gen_chk;
        }
    }

    pub fn pending(&self) -> usize {
        let mut n = 0;
        let mut i = self.next_to_clean;
        let mut chk = self.gen_chk;
        while (self.ring[i] & RX_BI_GEN != 0) == chk && n < self.ring.len() {
            n += 1;
            i += 1;
            if i == self.ring.len() {
                i = 0;
                chk = !chk;
            }
        }
        n
    }
}

/// A split model buffer queue, shared by the receive queues of a group.
pub struct RxBufQueue {
    queue_id: u16,
    ring: DescRing,
    pool: RxBufPool,
    refillqs: Vec<RefillQueue>,
    regs: Arc<dyn DeviceRegisterIo>,
    tail: usize,
    last_tail: u16,
}

pub struct RxBufQueueParams {
    pub queue_id: u16,
    pub count: u16,
    pub tail: usize,
    pub page_size: u32,
    pub hsplit: bool,
    /// The number of receive queues feeding this buffer queue.
    pub num_refillqs: usize,
}

impl RxBufQueue {
    pub fn new(
        dma: Arc<dyn DmaClient>,
        regs: Arc<dyn DeviceRegisterIo>,
        params: RxBufQueueParams,
    ) -> anyhow::Result<Self> {
        let ring = DescRing::alloc(dma.as_ref(), RingRole::RxBuffer, params.count, RX_DESC_SIZE)?;
        let pool = RxBufPool::new(dma, params.count, params.page_size, params.hsplit)?;
        let mut refillqs: Vec<_> = (0..params.num_refillqs.max(1))
            .map(|_| RefillQueue::new(params.count))
            .collect();
        // Every buffer starts out waiting to be posted, so buffers that fail
        // to post on the first fill are retried by later refills.
        for buf_id in 0..params.count - 1 {
            refillqs[0].push(buf_id);
        }
        Ok(Self {
            queue_id: params.queue_id,
            ring,
            pool,
            refillqs,
            regs,
            tail: params.tail,
            last_tail: 0,
        })
    }

    pub fn queue_id(&self) -> u16 {
        self.queue_id
    }

    pub fn ring(&self) -> &DescRing {
        &self.ring
    }

    pub fn pool(&self) -> &RxBufPool {
        &self.pool
    }

    fn post(&mut self, buf_id: u16) -> bool {
        if !self.pool.acquire_page(buf_id) {
            return false;
        }
        let (Some(pkt_addr), hdr_addr) = (self.pool.dma_addr(buf_id), self.pool.hdr_addr(buf_id))
        else {
            return false;
        };
        let idx = self.ring.advance_ntu();
        self.ring.write(
            idx,
            &RxBufDesc {
                buf_id,
                reserved0: [0; 6],
                pkt_addr,
                hdr_addr: hdr_addr.unwrap_or(0),
                reserved1: 0,
            },
        );
        true
    }

    fn bump_tail(&mut self) {
        let tail = self.ring.next_to_use() & !(RX_BUF_STRIDE - 1);
        if tail != self.last_tail {
            std::sync::atomic::fence(Ordering::Release);
            self.regs.write_u32(self.tail, tail as u32);
            self.last_tail = tail;
        }
    }

    /// Posts every buffer but one.
    pub fn fill(&mut self) -> Result<(), RxError> {
        self.refill().map(drop)
    }

    /// Notes that the device consumed one posted buffer.
    fn consumed(&mut self) {
        if self.ring.in_flight() > 0 {
            self.ring.advance_ntc();
        }
    }

    /// Reposts buffers handed back by the receive queues.
    pub fn refill(&mut self) -> Result<u16, RxError> {
        let mut posted = 0;
        let mut failed = false;
        'outer: for i in 0..self.refillqs.len() {
            while self.ring.unused() > 0 {
                let Some(buf_id) = self.refillqs[i].peek() else {
                    break;
                };
                if !self.post(buf_id) {
                    failed = true;
                    break 'outer;
                }
                self.refillqs[i].advance();
                posted += 1;
            }
        }
        self.bump_tail();
        if failed {
            let pending: usize = self.refillqs.iter().map(|q| q.pending()).sum();
            return Err(RxError::RefillIncomplete {
                requested: posted + pending as u16,
                posted,
                err: anyhow::anyhow!("out of receive pages"),
            });
        }
        Ok(posted)
    }
}

enum RxQueueKind {
    /// Position addressed: each ring slot owns the buffer at the same index.
    Single {
        pool: RxBufPool,
        tail: usize,
    },
    /// Descriptors name a buffer queue and a buffer id.
    Split {
        refill_index: usize,
    },
}

pub struct RxQueueParams {
    pub queue_id: u16,
    pub count: u16,
    pub features: RxFeatures,
    pub page_size: u32,
    /// Tail doorbell of single model queues.
    pub tail: usize,
}

pub struct RxQueue {
    queue_id: u16,
    ring: DescRing,
    kind: RxQueueKind,
    features: RxFeatures,
    regs: Arc<dyn DeviceRegisterIo>,
    partial: Option<RxPacket>,
    stats: RxStats,
    refill_pending: bool,
}

impl RxQueue {
    /// Creates a single model queue that posts its own buffers.
    pub fn new_single(
        dma: Arc<dyn DmaClient>,
        regs: Arc<dyn DeviceRegisterIo>,
        params: RxQueueParams,
    ) -> anyhow::Result<Self> {
        let ring = DescRing::alloc(dma.as_ref(), RingRole::Rx, params.count, RX_DESC_SIZE)?;
        let pool = RxBufPool::new(dma, params.count, params.page_size, params.features.hsplit)?;
        Ok(Self::new(
            params.queue_id,
            ring,
            RxQueueKind::Single {
                pool,
                tail: params.tail,
            },
            params.features,
            regs,
        ))
    }

    /// Creates a split model queue returning its buffers through refill
    /// queue `refill_index` of each buffer queue in its group.
    pub fn new_split(
        dma: &dyn DmaClient,
        regs: Arc<dyn DeviceRegisterIo>,
        params: RxQueueParams,
        refill_index: usize,
    ) -> Result<Self, RingError> {
        let ring = DescRing::alloc(dma, RingRole::Rx, params.count, RX_DESC_SIZE)?;
        Ok(Self::new(
            params.queue_id,
            ring,
            RxQueueKind::Split { refill_index },
            params.features,
            regs,
        ))
    }

    fn new(
        queue_id: u16,
        ring: DescRing,
        kind: RxQueueKind,
        features: RxFeatures,
        regs: Arc<dyn DeviceRegisterIo>,
    ) -> Self {
        Self {
            queue_id,
            ring,
            kind,
            features,
            regs,
            partial: None,
            stats: RxStats::default(),
            refill_pending: false,
        }
    }

    pub fn queue_id(&self) -> u16 {
        self.queue_id
    }

    pub fn ring(&self) -> &DescRing {
        &self.ring
    }

    pub fn stats(&self) -> RxStats {
        self.stats
    }

    /// Returns true if the last replenish attempt fell short.
    pub fn refill_pending(&self) -> bool {
        self.refill_pending
    }

    /// The buffers of a single model queue.
    pub fn pool(&self) -> Option<&RxBufPool> {
        match &self.kind {
            RxQueueKind::Single { pool, .. } => Some(pool),
            RxQueueKind::Split { .. } => None,
        }
    }

    /// Posts buffers to every free slot of a single model queue.
    pub fn refill_single(&mut self) -> Result<u16, RxError> {
        let RxQueueKind::Single { pool, tail } = &mut self.kind else {
            return Ok(0);
        };
        let requested = self.ring.unused();
        let mut posted = 0;
        while self.ring.unused() > 0 {
            let idx = self.ring.next_to_use();
            if !pool.acquire_page(idx) {
                break;
            }
            let Some(pkt_addr) = pool.dma_addr(idx) else {
                break;
            };
            self.ring.write(
                idx,
                &RxSingleqReadDesc {
                    pkt_addr,
                    hdr_addr: pool.hdr_addr(idx).unwrap_or(0),
                    reserved1: 0,
                    reserved2: 0,
                },
            );
            self.ring.advance_ntu();
            posted += 1;
        }
        if posted > 0 {
            std::sync::atomic::fence(Ordering::Release);
            self.regs.write_u32(*tail, self.ring.next_to_use() as u32);
        }
        self.refill_pending = posted < requested;
        if self.refill_pending {
            return Err(RxError::RefillIncomplete {
                requested,
                posted,
                err: anyhow::anyhow!("out of receive pages"),
            });
        }
        Ok(posted)
    }

    /// Copies small packets out whole; otherwise copies the headers and
    /// attaches the rest of the buffer as a fragment.
    fn attach(
        stats: &mut RxStats,
        pkt: &mut RxPacket,
        pool: &mut RxBufPool,
        buf_id: u16,
        len: u32,
    ) {
        if pkt.head.is_empty() && pkt.frags.is_empty() {
            if len as usize <= RX_HDR_SIZE {
                pool.copy_data(buf_id, 0, len, &mut pkt.head);
                stats.copybreak += 1;
                return;
            }
            let mut hdr = Vec::with_capacity(RX_HDR_SIZE);
            pool.copy_data(buf_id, 0, RX_HDR_SIZE as u32, &mut hdr);
            let head_len = eth_headlen(&hdr);
            pkt.head.extend_from_slice(&hdr[..head_len]);
            let head_len = head_len as u32;
            if len > head_len {
                pkt.frags
                    .extend(pool.take_fragment(buf_id, head_len, len - head_len));
            }
        } else {
            pkt.frags.extend(pool.take_fragment(buf_id, 0, len));
        }
    }

    fn rsc_info(&mut self, pkt: &RxPacket, ptype: &PacketType, seg_len: u16) -> Option<RscInfo> {
        let payload_len = pkt.frag_len() as u32;
        if ptype.l3 == L3Type::None || ptype.l4 != L4Type::Tcp || seg_len == 0 || payload_len == 0
        {
            self.stats.rsc_failures += 1;
            return None;
        }
        self.stats.rsc_packets += 1;
        Some(RscInfo {
            segs: payload_len.div_ceil(seg_len as u32) as u16,
            payload_len,
        })
    }

    fn finish(&mut self, mut pkt: RxPacket, deliver: &mut dyn RxDeliver, stats: &mut CleanStats) {
        if pkt.ip_csum == ChecksumState::Bad || pkt.l4_csum == ChecksumState::Bad {
            self.stats.csum_errors += 1;
        }
        pkt.queue_id = self.queue_id;
        let len = pkt.len() as u64;
        self.stats.packets += 1;
        self.stats.bytes += len;
        stats.packets += 1;
        stats.bytes += len;
        deliver.deliver(pkt);
    }

    fn clean_single(&mut self, budget: u32, deliver: &mut dyn RxDeliver) -> CleanStats {
        let mut stats = CleanStats::default();
        let mut cleaned = 0u32;
        while cleaned < budget && self.ring.in_flight() > 0 {
            let idx = self.ring.next_to_clean();
            let desc: RxSingleqWbDesc = self.ring.read(idx);
            if !desc.qw1.dd() {
                break;
            }
            std::sync::atomic::fence(Ordering::Acquire);
            self.ring.advance_ntc();
            cleaned += 1;

            let RxQueueKind::Single { pool, .. } = &mut self.kind else {
                break;
            };
            let qw1 = desc.qw1;
            let pkt = self.partial.get_or_insert_with(RxPacket::default);
            if self.features.hsplit && qw1.sph() {
                pool.copy_header(idx, qw1.hdr_len() as usize, &mut pkt.head);
            }
            if qw1.pkt_len() > 0 {
                Self::attach(&mut self.stats, pkt, pool, idx, qw1.pkt_len() as u32);
            }
            pool.put_buffer(idx);
            if !qw1.eof() {
                continue;
            }
            let Some(mut pkt) = self.partial.take() else {
                break;
            };

            let ptype = PacketType::lookup(qw1.ptype() as u16);
            pkt.ptype = qw1.ptype() as u16;
            if self.features.hash && qw1.fltstat() == RX_SINGLEQ_FLTSTAT_RSS_HASH && ptype.known {
                pkt.hash = Some(RxHash {
                    value: desc.rss_hash,
                    ty: ptype.hash_type(),
                });
            }
            if self.features.csum && ptype.known && qw1.l3l4p() {
                pkt.ip_csum = if qw1.ipe() || qw1.eipe() {
                    ChecksumState::Bad
                } else {
                    ChecksumState::Good
                };
                if ptype.has_l4_checksum() && !(ptype.l3 == L3Type::Ipv6 && qw1.ipv6exadd()) {
                    pkt.l4_csum = if qw1.l4e() {
                        ChecksumState::Bad
                    } else {
                        ChecksumState::Good
                    };
                }
            }
            self.finish(pkt, deliver, &mut stats);
        }
        if cleaned > 0 || self.refill_pending {
            if let Err(err) = self.refill_single() {
                tracing::trace!(
                    queue_id = self.queue_id,
                    error = &err as &dyn std::error::Error,
                    "rx refill incomplete"
                );
            }
        }
        stats
    }

    fn clean_split(
        &mut self,
        budget: u32,
        bufqs: &mut [RxBufQueue],
        deliver: &mut dyn RxDeliver,
    ) -> CleanStats {
        let mut stats = CleanStats::default();
        let RxQueueKind::Split { refill_index } = self.kind else {
            return stats;
        };
        let mut cleaned = 0u32;
        while cleaned < budget {
            let idx = self.ring.next_to_clean();
            let desc: RxFlexWbDesc = self.ring.read(idx);
            if desc.pktlen_gen_bufq_id.generation() != self.ring.gen_chk() {
                break;
            }
            std::sync::atomic::fence(Ordering::Acquire);
            self.ring.advance_ntc();
            cleaned += 1;

            if desc.rxdid_ucast & 0xf != RXDID_FLEX_SPLITQ {
                self.stats.bad_descs += 1;
                tracing::error!(
                    queue_id = self.queue_id,
                    rxdid = desc.rxdid_ucast & 0xf,
                    "unexpected rx descriptor format"
                );
                continue;
            }
            let bufq_index = (desc.pktlen_gen_bufq_id.bufq_id() && bufqs.len() > 1) as usize;
            let Some(bufq) = bufqs.get_mut(bufq_index) else {
                self.stats.bad_descs += 1;
                continue;
            };
            bufq.consumed();
            let buf_id = desc.buf_id;
            if buf_id as usize >= bufq.pool.len() {
                self.stats.bad_descs += 1;
                tracing::error!(queue_id = self.queue_id, buf_id, "rx buffer id out of range");
                continue;
            }

            let pkt = self.partial.get_or_insert_with(RxPacket::default);
            let flags = desc.hdrlen_flags;
            if self.features.hsplit && flags.sph() {
                bufq.pool
                    .copy_header(buf_id, flags.hdr_len() as usize, &mut pkt.head);
            }
            let pkt_len = desc.pktlen_gen_bufq_id.pkt_len();
            if pkt_len > 0 {
                Self::attach(&mut self.stats, pkt, &mut bufq.pool, buf_id, pkt_len as u32);
            }
            bufq.pool.put_buffer(buf_id);
            if let Some(refillq) = bufq.refillqs.get_mut(refill_index) {
                refillq.push(buf_id);
            }

            if desc.status_err0_qw1 & RX_FLEX_STATUS1_EOF == 0 {
                continue;
            }
            let Some(mut pkt) = self.partial.take() else {
                break;
            };

            let ptype_num = desc.ptype_err_fflags0.ptype();
            let ptype = PacketType::lookup(ptype_num);
            let status0 = desc.status_err0_qw0;
            let status1 = desc.status_err0_qw1;
            pkt.ptype = ptype_num;
            if self.features.hash && status0 & RX_FLEX_STATUS0_RSS_VALID != 0 && ptype.known {
                pkt.hash = Some(RxHash {
                    value: desc.rss_hash(),
                    ty: ptype.hash_type(),
                });
            }
            if self.features.csum && ptype.known && status1 & RX_FLEX_STATUS1_L3L4P != 0 {
                pkt.ip_csum =
                    if status1 & (RX_FLEX_STATUS1_XSUM_IPE | RX_FLEX_STATUS1_XSUM_EIPE) != 0 {
                        ChecksumState::Bad
                    } else {
                        ChecksumState::Good
                    };
                if ptype.has_l4_checksum()
                    && !(ptype.l3 == L3Type::Ipv6 && status0 & RX_FLEX_STATUS0_IPV6EXADD != 0)
                {
                    pkt.l4_csum = if status1
                        & (RX_FLEX_STATUS1_XSUM_L4E | RX_FLEX_STATUS1_XSUM_EUDPE)
                        != 0
                    {
                        ChecksumState::Bad
                    } else {
                        ChecksumState::Good
                    };
                }
            }
            if self.features.rsc && flags.rsc() {
                pkt.rsc = self.rsc_info(&pkt, &ptype, desc.rscseglen);
            }
            self.finish(pkt, deliver, &mut stats);
        }
        stats
    }
}

/// The receive queues and buffer queues polled together. In the single
/// model a group holds one queue and no buffer queues.
pub struct RxGroup {
    pub rxqs: Vec<RxQueue>,
    pub bufqs: Vec<RxBufQueue>,
}

impl RxGroup {
    /// Processes up to `budget` descriptors per queue, then replenishes
    /// buffers. A replenish shortfall is returned alongside the completed
    /// work; the next poll retries it.
    pub fn clean(
        &mut self,
        budget: u32,
        deliver: &mut dyn RxDeliver,
    ) -> (CleanStats, Result<(), RxError>) {
        let mut stats = CleanStats::default();
        for rxq in &mut self.rxqs {
            stats += match rxq.kind {
                RxQueueKind::Single { .. } => rxq.clean_single(budget, deliver),
                RxQueueKind::Split { .. } => rxq.clean_split(budget, &mut self.bufqs, deliver),
            };
        }
        let mut result = Ok(());
        for bufq in &mut self.bufqs {
            if let Err(err) = bufq.refill() {
                tracing::trace!(
                    bufq = bufq.queue_id,
                    error = &err as &dyn std::error::Error,
                    "rx refill incomplete"
                );
                result = Err(err);
            }
        }
        for rxq in &mut self.rxqs {
            if rxq.refill_pending && result.is_ok() {
                result = Err(RxError::RefillIncomplete {
                    requested: rxq.ring.unused(),
                    posted: 0,
                    err: anyhow::anyhow!("out of receive pages"),
                });
            }
        }
        (stats, result)
    }

    /// Posts the initial buffers.
    pub fn fill(&mut self) -> Result<(), RxError> {
        for bufq in &mut self.bufqs {
            bufq.fill()?;
        }
        for rxq in &mut self.rxqs {
            rxq.refill_single()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::ChecksumState;
    use super::RefillQueue;
    use super::RxBufQueue;
    use super::RxBufQueueParams;
    use super::RxFeatures;
    use super::RxGroup;
    use super::RxHash;
    use super::RxQueue;
    use super::RxQueueParams;
    use super::eth_headlen;
    use crate::error::RxError;
    use crate::ptype::HashType;
    use crate::tests::TestRegs;
    use crate::tests::init_tracing;
    use crate::tx::CleanStats;
    use iecm_defs::txrx::RX_FLEX_STATUS0_RSS_VALID;
    use iecm_defs::txrx::RX_FLEX_STATUS1_DD;
    use iecm_defs::txrx::RX_FLEX_STATUS1_EOF;
    use iecm_defs::txrx::RX_FLEX_STATUS1_L3L4P;
    use iecm_defs::txrx::RX_FLEX_STATUS1_XSUM_L4E;
    use iecm_defs::txrx::RXDID_FLEX_SPLITQ;
    use iecm_defs::txrx::RxBufDesc;
    use iecm_defs::txrx::RxFlexHdrlenFlags;
    use iecm_defs::txrx::RxFlexPktlenGen;
    use iecm_defs::txrx::RxFlexPtype;
    use iecm_defs::txrx::RxFlexWbDesc;
    use iecm_defs::txrx::RxSingleqQw1;
    use iecm_defs::txrx::RxSingleqReadDesc;
    use iecm_defs::txrx::RxSingleqWbDesc;
    use std::sync::Arc;
    use user_driver::emulated::EmulatedDma;
    use zerocopy::FromZeros;

    const BUFQ_TAIL: usize = 0x2000;
    const RXQ_TAIL: usize = 0x2004;

    /// A split group with one receive queue and one buffer queue, plus the
    /// device side cursors needed to write completions into it.
    struct Harness {
        dma: Arc<EmulatedDma>,
        regs: Arc<TestRegs>,
        group: RxGroup,
        next_buf: u16,
        next_rx: u16,
        generation: bool,
    }

    fn split_group(features: RxFeatures) -> Harness {
        init_tracing();
        let dma = EmulatedDma::new();
        let regs = Arc::new(TestRegs::default());
        let rxq = RxQueue::new_split(
            &*dma,
            regs.clone(),
            RxQueueParams {
                queue_id: 5,
                count: 64,
                features,
                page_size: 4096,
                tail: 0,
            },
            0,
        )
        .unwrap();
        let bufq = RxBufQueue::new(
            dma.clone(),
            regs.clone(),
            RxBufQueueParams {
                queue_id: 6,
                count: 64,
                tail: BUFQ_TAIL,
                page_size: 4096,
                hsplit: false,
                num_refillqs: 1,
            },
        )
        .unwrap();
        Harness {
            dma,
            regs,
            group: RxGroup {
                rxqs: vec![rxq],
                bufqs: vec![bufq],
            },
            next_buf: 0,
            next_rx: 0,
            generation: true,
        }
    }

    impl Harness {
        /// Fills the next posted buffer with `data` and writes back its
        /// completion.
        fn receive(&mut self, data: &[u8], eof: bool, tweak: impl FnOnce(&mut RxFlexWbDesc)) {
            let bufq = &self.group.bufqs[0];
            let posted: RxBufDesc = bufq.ring().read(self.next_buf);
            self.next_buf = bufq.ring().next(self.next_buf);
            self.dma
                .resolve(posted.pkt_addr, data.len())
                .unwrap()
                .write_at(0, data);

            let mut desc = RxFlexWbDesc::new_zeroed();
            desc.rxdid_ucast = RXDID_FLEX_SPLITQ;
            desc.status_err0_qw0 = RX_FLEX_STATUS0_RSS_VALID;
            desc.status_err0_qw1 = RX_FLEX_STATUS1_DD
                | RX_FLEX_STATUS1_L3L4P
                | if eof { RX_FLEX_STATUS1_EOF } else { 0 };
            desc.ptype_err_fflags0 = RxFlexPtype::new().with_ptype(26);
            desc.pktlen_gen_bufq_id = RxFlexPktlenGen::new()
                .with_pkt_len(data.len() as u16)
                .with_generation(self.generation);
            desc.buf_id = posted.buf_id;
            desc.set_rss_hash(0x1234_5678);
            tweak(&mut desc);

            let rxq = &self.group.rxqs[0];
            rxq.ring().write(self.next_rx, &desc);
            self.next_rx = rxq.ring().next(self.next_rx);
            if self.next_rx == 0 {
                self.generation = !self.generation;
            }
        }
    }

    /// An IPv4/TCP frame with 54 bytes of headers.
    fn tcp_frame(len: usize) -> Vec<u8> {
        let mut frame = vec![0u8; len];
        frame[12..14].copy_from_slice(&0x0800u16.to_be_bytes());
        frame[14] = 0x45;
        frame[14 + 9] = 6;
        frame[14 + 20 + 12] = 5 << 4;
        for (i, b) in frame[54..].iter_mut().enumerate() {
            *b = i as u8;
        }
        frame
    }

    #[test]
    fn small_packets_are_copied_and_large_ones_split() {
        let mut h = split_group(RxFeatures {
            csum: true,
            hash: true,
            ..Default::default()
        });
        h.group.fill().unwrap();
        assert_eq!(h.regs.last(BUFQ_TAIL), Some(56));

        let small = tcp_frame(60);
        let large = tcp_frame(1000);
        h.receive(&small, true, |_| {});
        h.receive(&large, true, |_| {});
        let mut pkts = Vec::new();
        let (stats, result) = h.group.clean(64, &mut pkts);
        result.unwrap();
        assert_eq!(
            stats,
            CleanStats {
                packets: 2,
                bytes: 1060
            }
        );

        assert_eq!(pkts[0].head, small);
        assert!(pkts[0].frags.is_empty());
        assert_eq!(pkts[1].head.len(), 54);
        assert_eq!(pkts[1].frags.len(), 1);
        assert_eq!(pkts[1].to_vec(), large);
        assert_eq!(pkts[1].queue_id, 5);
        assert_eq!(pkts[1].ip_csum, ChecksumState::Good);
        assert_eq!(pkts[1].l4_csum, ChecksumState::Good);
        assert_eq!(
            pkts[1].hash,
            Some(RxHash {
                value: 0x1234_5678,
                ty: HashType::L4
            })
        );
        assert_eq!(h.group.rxqs[0].stats().copybreak, 1);
        // Both buffers were handed back and reposted.
        assert_eq!(h.group.bufqs[0].ring().next_to_use(), 1);
        assert_eq!(h.group.bufqs[0].pool().stats().page_reuses, 2);
    }

    #[test]
    fn multi_buffer_packet_with_bad_checksum() {
        let mut h = split_group(RxFeatures {
            csum: true,
            ..Default::default()
        });
        h.group.fill().unwrap();
        let frame = tcp_frame(2548);
        h.receive(&frame[..2048], false, |_| {});
        h.receive(&frame[2048..], true, |d| {
            d.status_err0_qw1 |= RX_FLEX_STATUS1_XSUM_L4E
        });
        let mut pkts = Vec::new();
        let (stats, result) = h.group.clean(64, &mut pkts);
        result.unwrap();
        assert_eq!(stats.packets, 1);
        assert_eq!(pkts[0].frags.len(), 2);
        assert_eq!(pkts[0].to_vec(), frame);
        assert_eq!(pkts[0].ip_csum, ChecksumState::Good);
        assert_eq!(pkts[0].l4_csum, ChecksumState::Bad);
        assert_eq!(pkts[0].hash, None);
        assert_eq!(h.group.rxqs[0].stats().csum_errors, 1);
    }

    #[test]
    fn coalesced_packets_report_segments() {
        let mut h = split_group(RxFeatures {
            rsc: true,
            ..Default::default()
        });
        h.group.fill().unwrap();
        let rsc = |d: &mut RxFlexWbDesc| {
            d.hdrlen_flags = RxFlexHdrlenFlags::new().with_rsc(true);
            d.rscseglen = 1448;
        };
        let frame = tcp_frame(3548);
        h.receive(&frame[..2048], false, |_| {});
        h.receive(&frame[2048..], true, rsc);
        // Coalescing is only valid for TCP.
        h.receive(&tcp_frame(1000), true, |d| {
            rsc(d);
            d.ptype_err_fflags0 = RxFlexPtype::new().with_ptype(24);
        });
        let mut pkts = Vec::new();
        h.group.clean(64, &mut pkts).1.unwrap();
        let info = pkts[0].rsc.unwrap();
        assert_eq!(info.payload_len, 3494);
        assert_eq!(info.segs, 3);
        assert_eq!(pkts[1].rsc, None);
        let stats = h.group.rxqs[0].stats();
        assert_eq!((stats.rsc_packets, stats.rsc_failures), (1, 1));
    }

    #[test]
    fn refill_shortfall_is_retried() {
        let mut h = split_group(RxFeatures::default());
        h.dma.fail_next_allocations(1);
        let err = h.group.fill().unwrap_err();
        assert!(matches!(
            err,
            RxError::RefillIncomplete {
                requested: 63,
                posted: 0,
                ..
            }
        ));
        assert_eq!(h.regs.last(BUFQ_TAIL), None);

        let (stats, result) = h.group.clean(64, &mut Vec::new());
        result.unwrap();
        assert_eq!(stats.packets, 0);
        assert_eq!(h.regs.last(BUFQ_TAIL), Some(56));
        assert_eq!(h.group.bufqs[0].pool().stats().alloc_failures, 1);
    }

    #[test]
    fn single_queue_receive_and_repost() {
        init_tracing();
        let dma = EmulatedDma::new();
        let regs = Arc::new(TestRegs::default());
        let rxq = RxQueue::new_single(
            dma.clone(),
            regs.clone(),
            RxQueueParams {
                queue_id: 2,
                count: 64,
                features: RxFeatures {
                    csum: true,
                    hash: true,
                    ..Default::default()
                },
                page_size: 4096,
                tail: RXQ_TAIL,
            },
        )
        .unwrap();
        let mut group = RxGroup {
            rxqs: vec![rxq],
            bufqs: Vec::new(),
        };
        group.fill().unwrap();
        assert_eq!(regs.last(RXQ_TAIL), Some(63));

        let frame = tcp_frame(600);
        let ring = group.rxqs[0].ring();
        let posted: RxSingleqReadDesc = ring.read(0);
        dma.resolve(posted.pkt_addr, frame.len())
            .unwrap()
            .write_at(0, &frame);
        let mut wb = RxSingleqWbDesc::new_zeroed();
        wb.rss_hash = 0xfeed;
        wb.qw1 = RxSingleqQw1::new()
            .with_dd(true)
            .with_eof(true)
            .with_l3l4p(true)
            .with_l4e(true)
            .with_fltstat(3)
            .with_ptype(26)
            .with_pkt_len(frame.len() as u16);
        ring.write(0, &wb);

        let mut pkts = Vec::new();
        let (stats, result) = group.clean(64, &mut pkts);
        result.unwrap();
        assert_eq!(stats.packets, 1);
        assert_eq!(pkts[0].to_vec(), frame);
        assert_eq!(pkts[0].l4_csum, ChecksumState::Bad);
        assert_eq!(pkts[0].hash.map(|h| h.value), Some(0xfeed));
        // The cleaned slot was posted again.
        assert_eq!(regs.last(RXQ_TAIL), Some(0));
        assert!(!group.rxqs[0].refill_pending());
    }

    #[test]
    fn refill_queue_generation_wraps() {
        let mut q = RefillQueue::new(4);
        assert_eq!(q.peek(), None);
        for round in 0..3u16 {
            for i in 0..4 {
                q.push(round * 4 + i);
            }
            assert_eq!(q.pending(), 4);
            for i in 0..4 {
                assert_eq!(q.peek(), Some(round * 4 + i));
                q.advance();
            }
            // Entries from the previous lap are stale.
            assert_eq!(q.peek(), None);
        }
    }

    #[test]
    fn header_length_parsing() {
        let mut frame = vec![0u8; 128];
        frame[12..14].copy_from_slice(&0x8100u16.to_be_bytes());
        frame[16..18].copy_from_slice(&0x86ddu16.to_be_bytes());
        frame[18 + 6] = 17;
        assert_eq!(eth_headlen(&frame), 14 + 4 + 40 + 8);
        frame[16..18].copy_from_slice(&0x0806u16.to_be_bytes());
        assert_eq!(eth_headlen(&frame), 18);
        assert_eq!(eth_headlen(&frame[..10]), 10);
    }
}
