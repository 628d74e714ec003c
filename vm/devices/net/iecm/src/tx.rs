// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The transmit path: descriptor building, backpressure, and completion
//! processing for queue and flow scheduling.

use crate::bufpool::TagTable;
use crate::bufpool::TxBuf;
use crate::bufpool::TxBufStack;
use crate::bufpool::TxFirst;
use crate::bufpool::TxId;
use crate::error::L4Proto;
use crate::error::RingError;
use crate::error::TxError;
use crate::ring::DescRing;
use crate::ring::RingRole;
use iecm_defs::txrx::TX_BASE_CMD_EOP;
use iecm_defs::txrx::TX_BASE_CMD_IIPT_IPV4_CSUM;
use iecm_defs::txrx::TX_BASE_CMD_IIPT_IPV6;
use iecm_defs::txrx::TX_BASE_CMD_L4T_EOFT_SCTP;
use iecm_defs::txrx::TX_BASE_CMD_L4T_EOFT_TCP;
use iecm_defs::txrx::TX_BASE_CMD_L4T_EOFT_UDP;
use iecm_defs::txrx::TX_BASE_CMD_RS;
use iecm_defs::txrx::TX_COMPL_DESC_SIZE;
use iecm_defs::txrx::TX_COMPLT_RE;
use iecm_defs::txrx::TX_COMPLT_RS;
use iecm_defs::txrx::TX_CTX_CMD_TSO;
use iecm_defs::txrx::TX_DESC_DTYPE_CTX;
use iecm_defs::txrx::TX_DESC_DTYPE_DATA;
use iecm_defs::txrx::TX_DESC_DTYPE_DESC_DONE;
use iecm_defs::txrx::TX_DESC_DTYPE_FLEX_DATA;
use iecm_defs::txrx::TX_DESC_DTYPE_FLEX_FLOW_SCHE;
use iecm_defs::txrx::TX_DESC_DTYPE_FLEX_TSO_CTX;
use iecm_defs::txrx::TX_DESC_SIZE;
use iecm_defs::txrx::TX_FLEX_CMD_CS_EN;
use iecm_defs::txrx::TX_FLEX_CMD_EOP;
use iecm_defs::txrx::TX_FLEX_CMD_RS;
use iecm_defs::txrx::TX_FLEX_CTX_CMD_TSO;
use iecm_defs::txrx::TX_FLEX_TLEN_MASK;
use iecm_defs::txrx::TX_FLOW_BUF_SIZE_MASK;
use iecm_defs::txrx::TX_MAX_DESC_DATA_ALIGNED;
use iecm_defs::txrx::TX_MSS_MASK;
use iecm_defs::txrx::TxBaseCtxDesc;
use iecm_defs::txrx::TxBaseCtxQw1;
use iecm_defs::txrx::TxBaseDesc;
use iecm_defs::txrx::TxBaseQw1;
use iecm_defs::txrx::TxFlexCmdDtype;
use iecm_defs::txrx::TxFlexDesc;
use iecm_defs::txrx::TxFlexTsoCtxDesc;
use iecm_defs::txrx::TxFlowCmdDtype;
use iecm_defs::txrx::TxFlowSchedDesc;
use iecm_defs::txrx::TxSplitqComplDesc;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use user_driver::DeviceRegisterIo;
use user_driver::DmaClient;
use user_driver::memory::DmaMapping;
use user_driver::memory::MemoryBlock;

/// Slack reserved so a packet never ends in the cache line the device may
/// be fetching.
pub const TX_DESCS_PER_CACHE_LINE: u16 = 4;
pub const TX_DESCS_FOR_CTX: u16 = 1;
/// Free descriptors needed before a stopped queue is woken.
pub const TX_WAKE_THRESH: u16 = 46;
/// Minimum descriptors between descriptor completion requests on flow
/// scheduled queues. Small rings request them every quarter ring instead.
pub const TX_SPLITQ_RE_MIN_GAP: u16 = 64;

/// The hardware queue id field of a completion descriptor.
const COMPL_QID_MASK: u16 = 0x3ff;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum L3Proto {
    #[default]
    None,
    Ipv4,
    Ipv6,
}

/// Offloads requested for a packet, along with the header geometry they
/// need.
#[derive(Debug, Clone, Default)]
pub struct TxOffload {
    pub l3: L3Proto,
    pub l4: Option<L4Proto>,
    /// Insert the L4 checksum. The checksum field must hold the pseudo
    /// header sum.
    pub csum: bool,
    /// Offset of the first byte covered by the checksum.
    pub csum_start: u16,
    /// Offset of the checksum field from `csum_start`.
    pub csum_offset: u16,
    /// Segment the payload into packets of this size.
    pub tso_mss: Option<u16>,
    pub mac_len: u8,
    pub ip_len: u8,
    pub l4_len: u8,
}

/// An outbound packet. The segments must be host memory from the queue's
/// DMA client; they are mapped for the duration of the transmit.
#[derive(Debug, Clone)]
pub struct TxPacket {
    pub id: TxId,
    pub segments: Vec<MemoryBlock>,
    pub offload: TxOffload,
}

impl TxPacket {
    pub fn len(&self) -> usize {
        self.segments.iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The descriptor layout of a transmit queue, fixed when the queue is
/// created from the negotiated queue model.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TxDescFormat {
    /// Single queue: base descriptors, done bit written back in place.
    Base,
    /// Split queue with in-order completions reporting the ring head.
    Flex,
    /// Split queue with out-of-order completions carrying a tag.
    Flow,
}

/// The stop/start state of a transmit queue, shared with the stack.
#[derive(Debug, Default)]
pub struct TxQueueState {
    stopped: AtomicBool,
    starts: AtomicU64,
    wakes: AtomicU64,
}

impl TxQueueState {
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    /// Restarts the queue from the transmit path itself, which needs no
    /// scheduler kick.
    fn start(&self) {
        self.stopped.store(false, Ordering::Release);
        self.starts.fetch_add(1, Ordering::Relaxed);
    }

    /// Restarts the queue from the completion path.
    fn wake(&self) {
        if self.stopped.swap(false, Ordering::AcqRel) {
            self.wakes.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn starts(&self) -> u64 {
        self.starts.load(Ordering::Relaxed)
    }

    pub fn wakes(&self) -> u64 {
        self.wakes.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TxStats {
    pub packets: u64,
    pub bytes: u64,
    pub busy: u64,
    pub lso_packets: u64,
    pub csum_offloads: u64,
    pub sw_csums: u64,
    pub dropped: u64,
    pub unsupported_offload: u64,
    pub dma_errors: u64,
    pub stash_underflows: u64,
}

/// Packets and bytes completed by one cleaning pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanStats {
    pub packets: u32,
    pub bytes: u64,
}

impl std::ops::AddAssign for CleanStats {
    fn add_assign(&mut self, rhs: Self) {
        self.packets += rhs.packets;
        self.bytes += rhs.bytes;
    }
}

pub struct TxQueueParams {
    /// The hardware queue id, reported back in completions.
    pub queue_id: u16,
    pub count: u16,
    pub format: TxDescFormat,
    /// Offset of the tail doorbell register.
    pub tail: usize,
    pub csum: bool,
    pub tso: bool,
}

struct TsoPlan {
    mss: u16,
    hdr_len: u8,
    payload: u32,
    segs: u16,
}

#[derive(Default)]
struct OffloadPlan {
    hw_csum: bool,
    sw_csum: bool,
    tso: Option<TsoPlan>,
    l3: L3Proto,
    l4: Option<L4Proto>,
    /// MAC, IP and L4 header lengths in bytes.
    lens: (u8, u8, u8),
}

/// Returns the number of data descriptors for `len` bytes.
fn data_descs(len: usize) -> usize {
    len.div_ceil(TX_MAX_DESC_DATA_ALIGNED as usize)
}

/// Returns the descriptors a packet needs: one per aligned chunk of each
/// segment, plus a context descriptor for segmentation offload.
pub fn descs_needed(packet: &TxPacket) -> usize {
    packet
        .segments
        .iter()
        .map(|s| data_descs(s.len()))
        .sum::<usize>()
        + packet.offload.tso_mss.is_some() as usize
}

pub struct TxQueue {
    queue_id: u16,
    ring: DescRing,
    format: TxDescFormat,
    bufs: Vec<TxBuf>,
    stack: TxBufStack,
    stash: TagTable,
    dma: Arc<dyn DmaClient>,
    regs: Arc<dyn DeviceRegisterIo>,
    tail: usize,
    state: Arc<TxQueueState>,
    stats: TxStats,
    completed: VecDeque<TxId>,
    csum: bool,
    tso: bool,
    tag_gen: u16,
    tag_gen_shift: u32,
    tag_idx_mask: u16,
    last_re: u16,
    re_gap: u16,
}

impl TxQueue {
    pub fn new(
        dma: Arc<dyn DmaClient>,
        regs: Arc<dyn DeviceRegisterIo>,
        params: TxQueueParams,
    ) -> Result<Self, RingError> {
        let ring = DescRing::alloc(dma.as_ref(), RingRole::Tx, params.count, TX_DESC_SIZE)?;
        let tag_gen_shift = u16::BITS - (params.count - 1).leading_zeros();
        let flow = params.format == TxDescFormat::Flow;
        Ok(Self {
            queue_id: params.queue_id,
            format: params.format,
            bufs: (0..params.count).map(|_| TxBuf::default()).collect(),
            stack: TxBufStack::new(if flow { params.count as usize } else { 0 }),
            stash: TagTable::new(if flow { params.count } else { 1 }),
            dma,
            regs,
            tail: params.tail,
            state: Arc::new(TxQueueState::default()),
            stats: TxStats::default(),
            completed: VecDeque::new(),
            csum: params.csum,
            tso: params.tso,
            tag_gen: 0,
            tag_gen_shift,
            tag_idx_mask: ((1u32 << tag_gen_shift) - 1) as u16,
            last_re: 0,
            re_gap: TX_SPLITQ_RE_MIN_GAP.min(params.count / 4),
            ring,
        })
    }

    pub fn queue_id(&self) -> u16 {
        self.queue_id
    }

    pub fn format(&self) -> TxDescFormat {
        self.format
    }

    pub fn ring(&self) -> &DescRing {
        &self.ring
    }

    pub fn state(&self) -> &Arc<TxQueueState> {
        &self.state
    }

    pub fn stats(&self) -> TxStats {
        self.stats
    }

    /// Records of flow scheduled packets waiting for their tag completion
    /// after their descriptors were reclaimed.
    pub fn stashed(&self) -> usize {
        self.stash.len()
    }

    pub fn free_records(&self) -> usize {
        self.stack.len()
    }

    /// Records that currently hold a DMA mapping in the ring.
    pub fn mapped_records(&self) -> usize {
        self.bufs.iter().filter(|b| b.mapping.is_some()).count()
    }

    /// Returns the ids of packets completed since the last call.
    pub fn take_completed(&mut self) -> impl Iterator<Item = TxId> + '_ {
        self.completed.drain(..)
    }

    fn prepare_offload(&self, offload: &TxOffload, len: usize) -> Result<OffloadPlan, TxError> {
        let mut plan = OffloadPlan {
            l3: offload.l3,
            l4: offload.l4,
            lens: (offload.mac_len, offload.ip_len, offload.l4_len),
            ..Default::default()
        };
        if let Some(mss) = offload.tso_mss {
            match offload.l4 {
                Some(L4Proto::Tcp | L4Proto::Udp) if self.tso && offload.l3 != L3Proto::None => {}
                Some(l4) => return Err(TxError::UnsupportedOffload(l4)),
                None => return Err(TxError::Malformed("segmentation without an l4 header")),
            }
            let hdr_len = offload.mac_len as usize + offload.ip_len as usize + offload.l4_len as usize;
            if mss == 0 || hdr_len >= len || hdr_len > u8::MAX as usize {
                return Err(TxError::Malformed("bad segmentation geometry"));
            }
            if mss > TX_MSS_MASK {
                return Err(TxError::Malformed("segment size exceeds descriptor field"));
            }
            let payload = len - hdr_len;
            if payload > TX_FLEX_TLEN_MASK as usize {
                return Err(TxError::Malformed("segmentation payload exceeds descriptor field"));
            }
            let payload = payload as u32;
            let segs = u16::try_from(payload.div_ceil(mss as u32))
                .map_err(|_| TxError::Malformed("too many segments"))?;
            plan.tso = Some(TsoPlan {
                mss,
                hdr_len: hdr_len as u8,
                payload,
                segs,
            });
            plan.hw_csum = true;
        } else if offload.csum {
            if offload.csum_start as usize + offload.csum_offset as usize + 2 > len {
                return Err(TxError::Malformed("checksum field beyond packet"));
            }
            match offload.l4 {
                Some(L4Proto::Tcp | L4Proto::Udp | L4Proto::Sctp)
                    if self.csum && offload.l3 != L3Proto::None =>
                {
                    plan.hw_csum = true
                }
                // SCTP uses CRC32c, which the software fallback does not
                // compute.
                Some(L4Proto::Sctp) => return Err(TxError::UnsupportedOffload(L4Proto::Sctp)),
                _ => plan.sw_csum = true,
            }
        }
        Ok(plan)
    }

    /// Stops the queue if fewer than `needed` descriptors are free, then
    /// checks again in case completions freed space in the meantime.
    fn maybe_stop(&mut self, needed: u16) -> Result<(), TxError> {
        self.maybe_stop_with(needed, |_| {})
    }

    pub(crate) fn maybe_stop_with(
        &mut self,
        needed: u16,
        recheck: impl FnOnce(&mut Self),
    ) -> Result<(), TxError> {
        if self.ring.unused() >= needed {
            return Ok(());
        }
        self.state.stop();
        // Order the stop against the read of the cleaner's progress.
        std::sync::atomic::fence(Ordering::SeqCst);
        recheck(self);
        if self.ring.unused() < needed {
            self.stats.busy += 1;
            return Err(TxError::Busy);
        }
        self.state.start();
        Ok(())
    }

    fn maybe_wake(&mut self) {
        if self.state.is_stopped() && self.ring.unused() >= TX_WAKE_THRESH {
            self.state.wake();
        }
    }

    /// Posts `packet`. On [`TxError::Busy`] the queue is stopped and the
    /// caller keeps the packet; every other error means the packet was
    /// dropped.
    pub fn send(&mut self, packet: &TxPacket) -> Result<(), TxError> {
        let r = self.send_inner(packet);
        if let Err(err) = &r {
            match err {
                TxError::Busy => {}
                TxError::UnsupportedOffload(_) => {
                    self.stats.unsupported_offload += 1;
                    self.stats.dropped += 1;
                }
                TxError::DmaMap(_) => {
                    self.stats.dma_errors += 1;
                    self.stats.dropped += 1;
                }
                TxError::OutOfBuffers | TxError::Malformed(_) => self.stats.dropped += 1,
            }
        }
        r
    }

    fn send_inner(&mut self, packet: &TxPacket) -> Result<(), TxError> {
        let len = packet.len();
        if len == 0 {
            return Err(TxError::Malformed("empty packet"));
        }
        let plan = self.prepare_offload(&packet.offload, len)?;
        let needed = descs_needed(packet);
        if needed + (TX_DESCS_PER_CACHE_LINE + TX_DESCS_FOR_CTX) as usize
            >= self.ring.count() as usize
        {
            return Err(TxError::Malformed("packet exceeds ring capacity"));
        }
        self.maybe_stop(needed as u16 + TX_DESCS_PER_CACHE_LINE + TX_DESCS_FOR_CTX)?;

        if plan.sw_csum {
            sw_checksum(
                &packet.segments,
                packet.offload.csum_start as usize,
                packet.offload.csum_offset as usize,
            );
            self.stats.sw_csums += 1;
        }

        let mut mappings = Vec::with_capacity(packet.segments.len());
        for seg in packet.segments.iter().filter(|s| !s.is_empty()) {
            match self.dma.map(seg) {
                Ok(mapping) => mappings.push((seg, mapping)),
                Err(err) => {
                    for (_, mapping) in mappings {
                        self.dma.unmap(mapping);
                    }
                    return Err(TxError::DmaMap(err));
                }
            }
        }

        self.post(packet, &plan, mappings);
        if plan.tso.is_some() {
            self.stats.lso_packets += 1;
        }
        if plan.hw_csum {
            self.stats.csum_offloads += 1;
        }
        Ok(())
    }

    fn post(&mut self, packet: &TxPacket, plan: &OffloadPlan, mappings: Vec<(&MemoryBlock, DmaMapping)>) {
        let start = self.ring.next_to_use();
        let tag = (self.tag_gen << self.tag_gen_shift) | start;

        if let Some(tso) = &plan.tso {
            self.write_tso_ctx(start, tso);
            self.bufs[start as usize].compl_tag = tag;
            self.advance();
        }

        let count = mappings.len();
        let mut last = start;
        for (i, (seg, mapping)) in mappings.into_iter().enumerate() {
            let base = mapping.iova();
            let seg_len = seg.len() as u32;
            let chunks = data_descs(seg.len()) as u32;
            let idx = self.ring.next_to_use();
            let buf = &mut self.bufs[idx as usize];
            buf.mem = Some(seg.clone());
            buf.mapping = Some(mapping);
            for chunk in 0..chunks {
                let offset = chunk * TX_MAX_DESC_DATA_ALIGNED;
                let size = (seg_len - offset).min(TX_MAX_DESC_DATA_ALIGNED);
                let eop = i + 1 == count && chunk + 1 == chunks;
                let idx = self.ring.next_to_use();
                self.write_data_desc(idx, base + offset as u64, size as u16, eop, plan, tag);
                self.bufs[idx as usize].compl_tag = tag;
                last = idx;
                self.advance();
            }
        }

        self.bufs[start as usize].first = Some(TxFirst {
            id: packet.id,
            bytes: packet.len() as u32,
            segs: plan.tso.as_ref().map_or(1, |t| t.segs),
            last,
        });

        // Descriptors must be visible before the doorbell.
        std::sync::atomic::fence(Ordering::Release);
        self.regs
            .write_u32(self.tail, self.ring.next_to_use() as u32);
    }

    fn advance(&mut self) {
        self.ring.advance_ntu();
        if self.ring.next_to_use() == 0 {
            self.tag_gen = self.tag_gen.wrapping_add(1) & (u16::MAX >> self.tag_gen_shift);
        }
    }

    fn write_tso_ctx(&mut self, idx: u16, tso: &TsoPlan) {
        match self.format {
            TxDescFormat::Base => self.ring.write(
                idx,
                &TxBaseCtxDesc {
                    tunneling_params: 0,
                    l2tag2: 0,
                    reserved: 0,
                    qw1: TxBaseCtxQw1::new()
                        .with_dtype(TX_DESC_DTYPE_CTX)
                        .with_cmd(TX_CTX_CMD_TSO)
                        .with_tso_len(tso.payload)
                        .with_mss(tso.mss),
                },
            ),
            TxDescFormat::Flex | TxDescFormat::Flow => self.ring.write(
                idx,
                &TxFlexTsoCtxDesc {
                    flex_tlen: tso.payload & TX_FLEX_TLEN_MASK,
                    mss_rt: tso.mss,
                    hdr_len: tso.hdr_len,
                    flex: 0,
                    cmd_dtype: TxFlexCmdDtype::new()
                        .with_dtype(TX_DESC_DTYPE_FLEX_TSO_CTX)
                        .with_cmd(TX_FLEX_CTX_CMD_TSO),
                    reserved: [0; 6],
                },
            ),
        }
    }

    fn write_data_desc(
        &mut self,
        idx: u16,
        addr: u64,
        size: u16,
        eop: bool,
        plan: &OffloadPlan,
        tag: u16,
    ) {
        match self.format {
            TxDescFormat::Base => {
                let mut cmd = if eop {
                    TX_BASE_CMD_EOP | TX_BASE_CMD_RS
                } else {
                    0
                };
                let mut qw1 = TxBaseQw1::new()
                    .with_dtype(TX_DESC_DTYPE_DATA)
                    .with_buf_size(size);
                if plan.hw_csum {
                    cmd |= match plan.l3 {
                        L3Proto::Ipv4 => TX_BASE_CMD_IIPT_IPV4_CSUM,
                        L3Proto::Ipv6 => TX_BASE_CMD_IIPT_IPV6,
                        L3Proto::None => 0,
                    };
                    cmd |= match plan.l4 {
                        Some(L4Proto::Tcp) => TX_BASE_CMD_L4T_EOFT_TCP,
                        Some(L4Proto::Udp) => TX_BASE_CMD_L4T_EOFT_UDP,
                        Some(L4Proto::Sctp) => TX_BASE_CMD_L4T_EOFT_SCTP,
                        _ => 0,
                    };
                    qw1 = qw1
                        .with_maclen(plan.lens.0 / 2)
                        .with_iplen(plan.lens.1 / 4)
                        .with_l4len(plan.lens.2 / 4);
                }
                self.ring.write(
                    idx,
                    &TxBaseDesc {
                        buf_addr: addr,
                        qw1: qw1.with_cmd(cmd),
                    },
                );
            }
            TxDescFormat::Flex => {
                let mut cmd = if eop {
                    TX_FLEX_CMD_EOP | TX_FLEX_CMD_RS
                } else {
                    0
                };
                if plan.hw_csum {
                    cmd |= TX_FLEX_CMD_CS_EN;
                }
                self.ring.write(
                    idx,
                    &TxFlexDesc {
                        buf_addr: addr,
                        cmd_dtype: TxFlexCmdDtype::new()
                            .with_dtype(TX_DESC_DTYPE_FLEX_DATA)
                            .with_cmd(cmd),
                        l2tag1: 0,
                        l2tag2: 0,
                        buf_size: size,
                    },
                );
            }
            TxDescFormat::Flow => {
                // Ask for a descriptor completion once enough descriptors
                // have been posted since the last request.
                let re = eop && self.ring.distance(self.last_re, idx) >= self.re_gap;
                if re {
                    self.last_re = idx;
                }
                self.ring.write(
                    idx,
                    &TxFlowSchedDesc {
                        buf_addr: addr,
                        cmd_dtype: TxFlowCmdDtype::new()
                            .with_dtype(TX_DESC_DTYPE_FLEX_FLOW_SCHE)
                            .with_eop(eop)
                            .with_cs_en(plan.hw_csum)
                            .with_re(re),
                        reserved: [0; 3],
                        compl_tag: tag,
                        rxr_bufsize: size & TX_FLOW_BUF_SIZE_MASK,
                    },
                );
            }
        }
    }

    fn complete(&mut self, first: TxFirst, stats: &mut CleanStats) {
        self.completed.push_back(first.id);
        self.stats.packets += first.segs as u64;
        self.stats.bytes += first.bytes as u64;
        stats.packets += first.segs as u32;
        stats.bytes += first.bytes as u64;
    }

    /// Cleans a single queue ring: each packet is done once the device has
    /// marked its last descriptor.
    pub fn clean_single(&mut self, budget: u32) -> CleanStats {
        let mut stats = CleanStats::default();
        let mut done = 0;
        while done < budget && self.ring.in_flight() > 0 {
            let ntc = self.ring.next_to_clean();
            let Some(first) = self.bufs[ntc as usize].first else {
                tracing::error!(
                    queue_id = self.queue_id,
                    index = ntc,
                    "tx ring out of sync with buffer records"
                );
                break;
            };
            let desc: TxBaseDesc = self.ring.read(first.last);
            if desc.qw1.dtype() != TX_DESC_DTYPE_DESC_DONE {
                break;
            }
            std::sync::atomic::fence(Ordering::Acquire);
            let end = self.ring.next(first.last);
            while self.ring.next_to_clean() != end {
                let idx = self.ring.advance_ntc();
                if let Some(first) = self.bufs[idx as usize].release(self.dma.as_ref()) {
                    self.complete(first, &mut stats);
                }
            }
            done += 1;
        }
        self.maybe_wake();
        stats
    }

    /// Handles a descriptor completion: everything before `head` has been
    /// fetched by the device.
    fn clean_to_head(&mut self, head: u16, stats: &mut CleanStats) {
        if head >= self.ring.count()
            || self.ring.distance(self.ring.next_to_clean(), head) > self.ring.in_flight()
        {
            tracing::error!(
                queue_id = self.queue_id,
                head,
                next_to_clean = self.ring.next_to_clean(),
                next_to_use = self.ring.next_to_use(),
                "tx completion head out of range"
            );
            return;
        }
        while self.ring.next_to_clean() != head {
            let idx = self.ring.next_to_clean() as usize;
            if self.format == TxDescFormat::Flow {
                // The packet may not have completed yet; keep its records
                // until its tag does.
                if !self.bufs[idx].is_empty() {
                    let mut shell = match self.stack.pop() {
                        Ok(shell) => shell,
                        Err(err) => {
                            self.stats.stash_underflows += 1;
                            tracing::error!(
                                queue_id = self.queue_id,
                                error = &err as &dyn std::error::Error,
                                "tx buffer record leaked"
                            );
                            return;
                        }
                    };
                    std::mem::swap(&mut shell, &mut self.bufs[idx]);
                    self.stash.insert(shell);
                }
                self.bufs[idx].compl_tag = 0;
            } else if let Some(first) = self.bufs[idx].release(self.dma.as_ref()) {
                self.complete(first, stats);
            }
            self.ring.advance_ntc();
        }
    }

    /// Handles a flow scheduling packet completion.
    fn clean_tag(&mut self, tag: u16, stats: &mut CleanStats) {
        let idx = tag & self.tag_idx_mask;
        if idx < self.ring.count() {
            let buf = &self.bufs[idx as usize];
            if let (Some(first), true) = (buf.first, buf.compl_tag == tag) {
                // Still in the ring.
                let end = self.ring.next(first.last);
                let mut i = idx;
                while i != end {
                    if let Some(first) = self.bufs[i as usize].release(self.dma.as_ref()) {
                        self.complete(first, stats);
                    }
                    i = self.ring.next(i);
                }
                return;
            }
        }
        let mut firsts = Vec::new();
        let dma = self.dma.clone();
        let stack = &mut self.stack;
        let removed = self.stash.remove_with(tag, |mut buf| {
            if let Some(first) = buf.release(dma.as_ref()) {
                firsts.push(first);
            }
            stack.push(buf);
        });
        for first in firsts {
            self.complete(first, stats);
        }
        if removed == 0 {
            tracing::trace!(queue_id = self.queue_id, tag, "completion for unknown tag");
        }
    }

    /// Handles one split queue completion descriptor addressed to this
    /// queue.
    pub fn handle_completion(&mut self, desc: &TxSplitqComplDesc, stats: &mut CleanStats) {
        let value = desc.q_head_compl_tag;
        match (desc.qid_comptype_gen.compl_type(), self.format) {
            (TX_COMPLT_RE, _) => self.clean_to_head(value, stats),
            (TX_COMPLT_RS, TxDescFormat::Flow) => self.clean_tag(value, stats),
            (TX_COMPLT_RS, _) => self.clean_to_head(value, stats),
            (ty, _) => {
                tracing::trace!(queue_id = self.queue_id, ty, "ignoring tx completion");
            }
        }
        self.maybe_wake();
    }

    /// Unmaps every outstanding record, including stashed ones.
    pub fn release_all(&mut self) {
        let dma = self.dma.clone();
        for buf in &mut self.bufs {
            buf.release(dma.as_ref());
        }
        let stack = &mut self.stack;
        self.stash.drain(|mut buf| {
            buf.release(dma.as_ref());
            stack.push(buf);
        });
        self.ring.release();
    }
}

impl Drop for TxQueue {
    fn drop(&mut self) {
        self.release_all();
    }
}

/// Computes the ones complement checksum from `start` to the end of the
/// packet and stores it at `start + offset`, for checksums the device
/// cannot insert.
fn sw_checksum(segments: &[MemoryBlock], start: usize, offset: usize) {
    let mut data = Vec::new();
    for seg in segments {
        data.extend(seg.to_vec());
    }
    let csum = internet_checksum(&data[start..]).to_be_bytes();
    let mut at = start + offset;
    for byte in csum {
        for seg in segments {
            if at < seg.len() {
                seg.write_at(at, &[byte]);
                break;
            }
            at -= seg.len();
        }
        at = start + offset + 1;
    }
}

/// The RFC 1071 checksum of `data`.
pub fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u64 = 0;
    for chunk in data.chunks(2) {
        sum += u16::from_be_bytes([chunk[0], chunk.get(1).copied().unwrap_or(0)]) as u64;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

pub struct TxComplQueue {
    ring: DescRing,
    unknown_qid: u64,
}

impl TxComplQueue {
    pub fn new(dma: &dyn DmaClient, count: u16) -> Result<Self, RingError> {
        Ok(Self {
            ring: DescRing::alloc(dma, RingRole::TxCompletion, count, TX_COMPL_DESC_SIZE)?,
            unknown_qid: 0,
        })
    }

    pub fn ring(&self) -> &DescRing {
        &self.ring
    }

    pub fn unknown_qid(&self) -> u64 {
        self.unknown_qid
    }

    /// Processes up to `budget` completions, dispatching each to the queue
    /// it names.
    pub fn clean(&mut self, txqs: &mut [TxQueue], budget: u32) -> CleanStats {
        let mut stats = CleanStats::default();
        let mut done = 0;
        while done < budget {
            let ntc = self.ring.next_to_clean();
            let desc: TxSplitqComplDesc = self.ring.read(ntc);
            if desc.qid_comptype_gen.generation() != self.ring.gen_chk() {
                break;
            }
            std::sync::atomic::fence(Ordering::Acquire);
            let qid = desc.qid_comptype_gen.qid();
            match txqs
                .iter_mut()
                .find(|q| q.queue_id() & COMPL_QID_MASK == qid)
            {
                Some(txq) => txq.handle_completion(&desc, &mut stats),
                None => {
                    self.unknown_qid += 1;
                    tracing::error!(qid, "tx completion for unknown queue");
                }
            }
            self.ring.advance_ntc();
            done += 1;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::CleanStats;
    use super::L3Proto;
    use super::TxComplQueue;
    use super::TxDescFormat;
    use super::TxOffload;
    use super::TxPacket;
    use super::TxQueue;
    use super::TxQueueParams;
    use super::descs_needed;
    use super::internet_checksum;
    use crate::bufpool::TxId;
    use crate::error::L4Proto;
    use crate::error::TxError;
    use crate::tests::TestRegs;
    use crate::tests::init_tracing;
    use iecm_defs::txrx::TX_COMPLT_RE;
    use iecm_defs::txrx::TX_COMPLT_RS;
    use iecm_defs::txrx::TX_DESC_DTYPE_DESC_DONE;
    use iecm_defs::txrx::TxBaseDesc;
    use iecm_defs::txrx::TxComplQidTypeGen;
    use iecm_defs::txrx::TxFlowSchedDesc;
    use iecm_defs::txrx::TxSplitqComplDesc;
    use std::sync::Arc;
    use user_driver::DmaClient;
    use user_driver::emulated::EmulatedDma;

    const TAIL: usize = 0x1000;

    fn queue(dma: &Arc<EmulatedDma>, regs: &Arc<TestRegs>, format: TxDescFormat, count: u16) -> TxQueue {
        TxQueue::new(
            dma.clone(),
            regs.clone(),
            TxQueueParams {
                queue_id: 3,
                count,
                format,
                tail: TAIL,
                csum: true,
                tso: true,
            },
        )
        .unwrap()
    }

    fn packet(dma: &EmulatedDma, id: u64, lens: &[usize]) -> TxPacket {
        TxPacket {
            id: TxId(id),
            segments: lens
                .iter()
                .map(|&len| {
                    let mem = dma.allocate_host_buffer(len).unwrap();
                    mem.subblock(0, len)
                })
                .collect(),
            offload: TxOffload::default(),
        }
    }

    fn compl(qid: u16, ty: u8, value: u16, generation: bool) -> TxSplitqComplDesc {
        TxSplitqComplDesc {
            qid_comptype_gen: TxComplQidTypeGen::new()
                .with_qid(qid)
                .with_compl_type(ty)
                .with_generation(generation),
            q_head_compl_tag: value,
            ts: [0; 3],
            reserved: 0,
        }
    }

    #[test]
    fn single_packet_uses_one_descriptor() {
        init_tracing();
        let dma = EmulatedDma::new();
        let regs = Arc::new(TestRegs::default());
        let mut q = queue(&dma, &regs, TxDescFormat::Flex, 512);
        let p = packet(&dma, 1, &[1500]);
        assert_eq!(descs_needed(&p), 1);
        q.send(&p).unwrap();
        assert_eq!(q.ring().next_to_use(), 1);
        assert_eq!(q.mapped_records(), 1);
        assert_eq!(regs.last(TAIL), Some(1));
    }

    #[test]
    fn descriptor_and_record_conservation() {
        let dma = EmulatedDma::new();
        let regs = Arc::new(TestRegs::default());
        let mut q = queue(&dma, &regs, TxDescFormat::Flex, 512);
        let mut p = packet(&dma, 1, &[30000, 100, 0, 12288]);
        p.offload = TxOffload {
            l3: L3Proto::Ipv4,
            l4: Some(L4Proto::Tcp),
            tso_mss: Some(1448),
            mac_len: 14,
            ip_len: 20,
            l4_len: 20,
            ..Default::default()
        };
        let d = descs_needed(&p);
        assert_eq!(d, 3 + 1 + 1 + 1);
        let before = q.ring().next_to_use();
        q.send(&p).unwrap();
        assert_eq!(q.ring().next_to_use() - before, d as u16);
        assert_eq!(q.mapped_records(), 3);
        assert_eq!(dma.stats().maps, 3);
        assert_eq!(q.stats().lso_packets, 1);

        let mut stats = CleanStats::default();
        q.handle_completion(&compl(3, TX_COMPLT_RE, d as u16, true), &mut stats);
        assert_eq!(q.take_completed().collect::<Vec<_>>(), [TxId(1)]);
        assert_eq!(stats.packets, (42388u32 - 54).div_ceil(1448));
        assert_eq!(dma.stats().unmaps, 3);
        assert_eq!(q.mapped_records(), 0);
    }

    #[test]
    fn busy_then_recheck_sees_consumer_progress() {
        init_tracing();
        let dma = EmulatedDma::new();
        let regs = Arc::new(TestRegs::default());
        let mut q = queue(&dma, &regs, TxDescFormat::Flex, 64);
        let p = packet(&dma, 1, &[64]);
        let mut sent = 0;
        loop {
            match q.send(&p) {
                Ok(()) => sent += 1,
                Err(TxError::Busy) => break,
                Err(err) => panic!("{err}"),
            }
        }
        assert_eq!(sent, 58);
        assert!(q.state().is_stopped());
        assert_eq!(q.stats().busy, 1);

        // The consumer advances between the stop and the recheck.
        let mut stats = CleanStats::default();
        q.maybe_stop_with(6, |q| {
            q.handle_completion(&compl(3, TX_COMPLT_RE, 10, true), &mut stats)
        })
        .unwrap();
        assert!(!q.state().is_stopped());
        assert_eq!(q.state().starts(), 1);
        assert_eq!(stats.packets, 10);
        q.send(&p).unwrap();
    }

    #[test]
    fn completion_wakes_stopped_queue() {
        let dma = EmulatedDma::new();
        let regs = Arc::new(TestRegs::default());
        let mut q = queue(&dma, &regs, TxDescFormat::Flex, 64);
        let mut cq = TxComplQueue::new(&*dma, 64).unwrap();
        let p = packet(&dma, 1, &[64]);
        while q.send(&p).is_ok() {}
        assert!(q.state().is_stopped());

        cq.ring().write(0, &compl(3, TX_COMPLT_RE, 20, true));
        cq.clean(std::slice::from_mut(&mut q), 64);
        // Not enough room yet.
        assert!(q.state().is_stopped());
        cq.ring().write(1, &compl(3, TX_COMPLT_RE, 50, true));
        cq.ring().write(2, &compl(99, TX_COMPLT_RE, 50, true));
        let stats = cq.clean(std::slice::from_mut(&mut q), 64);
        assert_eq!(stats.packets, 30);
        assert!(!q.state().is_stopped());
        assert_eq!(q.state().wakes(), 1);
        assert_eq!(cq.unknown_qid(), 1);
        assert_eq!(cq.ring().next_to_clean(), 3);
    }

    #[test]
    fn flow_completion_in_ring_is_idempotent() {
        init_tracing();
        let dma = EmulatedDma::new();
        let regs = Arc::new(TestRegs::default());
        let mut q = queue(&dma, &regs, TxDescFormat::Flow, 256);
        for id in 0..3 {
            q.send(&packet(&dma, id, &[100, 200])).unwrap();
        }
        let desc: TxFlowSchedDesc = q.ring().read(3);
        let tag = desc.compl_tag;
        assert_eq!(tag, 2);
        assert!(desc.cmd_dtype.eop());

        let mut stats = CleanStats::default();
        q.handle_completion(&compl(3, TX_COMPLT_RS, tag, true), &mut stats);
        q.handle_completion(&compl(3, TX_COMPLT_RS, tag, true), &mut stats);
        assert_eq!(stats.packets, 1);
        assert_eq!(q.take_completed().collect::<Vec<_>>(), [TxId(1)]);
        assert_eq!(dma.stats().unmaps, 2);

        // Reclaiming the descriptors stashes the two packets still pending.
        q.handle_completion(&compl(3, TX_COMPLT_RE, 6, true), &mut stats);
        assert_eq!(q.stashed(), 4);
        assert_eq!(q.free_records(), 252);
        assert_eq!(q.ring().unused(), 255);

        for tag in [0, 4, 0, 4] {
            q.handle_completion(&compl(3, TX_COMPLT_RS, tag, true), &mut stats);
        }
        assert_eq!(stats.packets, 3);
        assert_eq!(q.stashed(), 0);
        assert_eq!(q.free_records(), 256);
        assert_eq!(dma.stats().unmaps, 6);
        assert_eq!(dma.stats().bad_unmaps, 0);
    }

    /// Completes a just posted single descriptor flow packet at `idx` the
    /// way the device does: a tag completion, then a descriptor completion
    /// if one was requested.
    fn complete_flow(q: &mut TxQueue, idx: u16, stats: &mut CleanStats) -> bool {
        let desc: TxFlowSchedDesc = q.ring().read(idx);
        q.handle_completion(&compl(3, TX_COMPLT_RS, desc.compl_tag, true), stats);
        if desc.cmd_dtype.re() {
            let head = q.ring().next(idx);
            q.handle_completion(&compl(3, TX_COMPLT_RE, head, true), stats);
        }
        desc.cmd_dtype.re()
    }

    #[test]
    fn flow_tags_change_generation_on_wrap() {
        let dma = EmulatedDma::new();
        let regs = Arc::new(TestRegs::default());
        let mut q = queue(&dma, &regs, TxDescFormat::Flow, 64);
        let mut stats = CleanStats::default();
        let mut requests = Vec::new();
        for id in 0..70u64 {
            let idx = q.ring().next_to_use();
            q.send(&packet(&dma, id, &[64])).unwrap();
            let desc: TxFlowSchedDesc = q.ring().read(idx);
            if id >= 64 {
                assert_eq!(desc.compl_tag, (1 << 6) | idx);
            } else {
                assert_eq!(desc.compl_tag, idx);
            }
            if complete_flow(&mut q, idx, &mut stats) {
                requests.push(idx);
            }
        }
        // A 64 entry ring asks for a descriptor completion every 16.
        assert_eq!(requests, [16, 32, 48, 0]);
        assert_eq!(q.ring().next_to_clean(), 1);
        assert_eq!(stats.packets, 70);
        assert_eq!(q.stashed(), 0);
        assert_eq!(q.free_records(), 64);
    }

    #[test]
    fn flow_small_ring_reclaims_descriptors() {
        init_tracing();
        let dma = EmulatedDma::new();
        let regs = Arc::new(TestRegs::default());
        let mut q = queue(&dma, &regs, TxDescFormat::Flow, 64);
        let mut stats = CleanStats::default();
        let mut id = 0;
        // Post bursts of 40 before completing anything, so the ring only
        // keeps room if descriptor completions are requested.
        for _ in 0..10 {
            let mut posted = Vec::new();
            for _ in 0..40 {
                posted.push(q.ring().next_to_use());
                q.send(&packet(&dma, id, &[64])).unwrap();
                id += 1;
            }
            for idx in posted {
                complete_flow(&mut q, idx, &mut stats);
            }
            assert!(q.ring().in_flight() < 16);
        }
        assert_eq!(stats.packets, 400);
        assert_eq!(q.take_completed().count(), 400);
        assert_eq!(q.stats().busy, 0);
        assert_eq!(q.stashed(), 0);
        assert_eq!(q.mapped_records(), 0);
    }

    #[test]
    fn unsupported_segmentation_is_dropped() {
        let dma = EmulatedDma::new();
        let regs = Arc::new(TestRegs::default());
        let mut q = queue(&dma, &regs, TxDescFormat::Flex, 512);
        let mut p = packet(&dma, 1, &[4000]);
        p.offload = TxOffload {
            l3: L3Proto::Ipv4,
            l4: Some(L4Proto::Sctp),
            tso_mss: Some(1000),
            mac_len: 14,
            ip_len: 20,
            l4_len: 12,
            ..Default::default()
        };
        let err = q.send(&p).unwrap_err();
        assert!(matches!(err, TxError::UnsupportedOffload(L4Proto::Sctp)));
        assert!(!err.is_retryable());
        assert_eq!(q.stats().dropped, 1);
        assert_eq!(q.ring().next_to_use(), 0);
        assert_eq!(dma.stats().maps, 0);
    }

    #[test]
    fn segmentation_beyond_descriptor_fields_is_malformed() {
        let dma = EmulatedDma::new();
        let regs = Arc::new(TestRegs::default());
        let mut q = queue(&dma, &regs, TxDescFormat::Flex, 512);
        let offload = TxOffload {
            l3: L3Proto::Ipv4,
            l4: Some(L4Proto::Tcp),
            tso_mss: Some(0x4000),
            mac_len: 14,
            ip_len: 20,
            l4_len: 20,
            ..Default::default()
        };
        let mut p = packet(&dma, 1, &[40000]);
        p.offload = offload.clone();
        assert!(matches!(q.send(&p), Err(TxError::Malformed(_))));

        let mut p = packet(&dma, 2, &[0x40000, 100]);
        p.offload = TxOffload {
            tso_mss: Some(1448),
            ..offload
        };
        assert!(matches!(q.send(&p), Err(TxError::Malformed(_))));
        assert_eq!(q.stats().dropped, 2);
        assert_eq!(q.ring().next_to_use(), 0);
        assert_eq!(dma.stats().maps, 0);
    }

    #[test]
    fn sctp_checksum_without_offload_is_unsupported() {
        let dma = EmulatedDma::new();
        let regs = Arc::new(TestRegs::default());
        let mut q = TxQueue::new(
            dma.clone(),
            regs.clone(),
            TxQueueParams {
                queue_id: 3,
                count: 64,
                format: TxDescFormat::Flex,
                tail: TAIL,
                csum: false,
                tso: false,
            },
        )
        .unwrap();
        let mut p = packet(&dma, 1, &[200]);
        p.offload = TxOffload {
            l3: L3Proto::Ipv4,
            l4: Some(L4Proto::Sctp),
            csum: true,
            csum_start: 34,
            csum_offset: 8,
            ..Default::default()
        };
        let err = q.send(&p).unwrap_err();
        assert!(matches!(err, TxError::UnsupportedOffload(L4Proto::Sctp)));
        assert_eq!(q.stats().sw_csums, 0);
        assert_eq!(q.stats().unsupported_offload, 1);

        // Other protocols still get a software checksum.
        p.offload.l4 = Some(L4Proto::Udp);
        q.send(&p).unwrap();
        assert_eq!(q.stats().sw_csums, 1);
    }

    #[test]
    fn checksum_falls_back_to_software() {
        let dma = EmulatedDma::new();
        let regs = Arc::new(TestRegs::default());
        let mut q = queue(&dma, &regs, TxDescFormat::Flex, 512);
        let p = packet(&dma, 1, &[40, 61]);
        for (i, seg) in p.segments.iter().enumerate() {
            let bytes: Vec<u8> = (0..seg.len()).map(|b| (b * 7 + i) as u8).collect();
            seg.write_at(0, &bytes);
        }
        // The checksum field straddles the two segments.
        let start = 21;
        let offset = 18;
        p.segments[0].write_at(39, &[0]);
        p.segments[1].write_at(0, &[0]);
        let mut p = p;
        p.offload = TxOffload {
            l3: L3Proto::Ipv4,
            l4: Some(L4Proto::Other(47)),
            csum: true,
            csum_start: start,
            csum_offset: offset,
            ..Default::default()
        };
        q.send(&p).unwrap();
        assert_eq!(q.stats().sw_csums, 1);
        let mut data = p.segments[0].to_vec();
        data.extend(p.segments[1].to_vec());
        assert_eq!(internet_checksum(&data[start as usize..]), 0);
    }

    #[test]
    fn single_queue_cleans_on_done_descriptor() {
        let dma = EmulatedDma::new();
        let regs = Arc::new(TestRegs::default());
        let mut q = queue(&dma, &regs, TxDescFormat::Base, 64);
        q.send(&packet(&dma, 7, &[100, 100])).unwrap();
        q.send(&packet(&dma, 8, &[100])).unwrap();
        assert_eq!(q.clean_single(64).packets, 0);

        let mut desc: TxBaseDesc = q.ring().read(1);
        desc.qw1.set_dtype(TX_DESC_DTYPE_DESC_DONE);
        q.ring().write(1, &desc);
        let stats = q.clean_single(64);
        assert_eq!(stats.packets, 1);
        assert_eq!(stats.bytes, 200);
        assert_eq!(q.ring().next_to_clean(), 2);
        assert_eq!(q.take_completed().collect::<Vec<_>>(), [TxId(7)]);
    }

    #[test]
    fn map_failure_unwinds() {
        let dma = EmulatedDma::new();
        let regs = Arc::new(TestRegs::default());
        let mut q = queue(&dma, &regs, TxDescFormat::Flex, 64);
        q.send(&packet(&dma, 1, &[100, 100])).unwrap();

        // The second segment belongs to another address space, so mapping
        // it fails after the first segment was mapped.
        let other = EmulatedDma::new();
        let mut p = packet(&dma, 2, &[100]);
        p.segments
            .push(other.allocate_host_buffer(100).unwrap().subblock(0, 100));
        let err = q.send(&p).unwrap_err();
        assert!(matches!(err, TxError::DmaMap(_)));
        assert_eq!(q.stats().dma_errors, 1);
        assert_eq!(q.ring().next_to_use(), 2);
        let stats = dma.stats();
        assert_eq!((stats.maps, stats.unmaps), (3, 1));
    }
}
