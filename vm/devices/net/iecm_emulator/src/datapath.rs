// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A loopback datapath. Frames sent on a vport's transmit queues are handed
//! back on the same vport's receive queues.

use iecm_defs::txrx::RX_DESC_SIZE;
use iecm_defs::txrx::RX_FLEX_STATUS0_RSS_VALID;
use iecm_defs::txrx::RX_FLEX_STATUS1_DD;
use iecm_defs::txrx::RX_FLEX_STATUS1_EOF;
use iecm_defs::txrx::RX_FLEX_STATUS1_L3L4P;
use iecm_defs::txrx::RX_SINGLEQ_FLTSTAT_RSS_HASH;
use iecm_defs::txrx::RXDID_FLEX_SPLITQ;
use iecm_defs::txrx::RxBufDesc;
use iecm_defs::txrx::RxFlexPktlenGen;
use iecm_defs::txrx::RxFlexPtype;
use iecm_defs::txrx::RxFlexWbDesc;
use iecm_defs::txrx::RxSingleqQw1;
use iecm_defs::txrx::RxSingleqReadDesc;
use iecm_defs::txrx::RxSingleqWbDesc;
use iecm_defs::txrx::TX_BASE_CMD_EOP;
use iecm_defs::txrx::TX_COMPL_DESC_SIZE;
use iecm_defs::txrx::TX_COMPLT_RE;
use iecm_defs::txrx::TX_COMPLT_RS;
use iecm_defs::txrx::TX_DESC_DTYPE_CTX;
use iecm_defs::txrx::TX_DESC_DTYPE_DATA;
use iecm_defs::txrx::TX_DESC_DTYPE_DESC_DONE;
use iecm_defs::txrx::TX_DESC_DTYPE_FLEX_DATA;
use iecm_defs::txrx::TX_DESC_DTYPE_FLEX_FLOW_SCHE;
use iecm_defs::txrx::TX_DESC_DTYPE_FLEX_TSO_CTX;
use iecm_defs::txrx::TX_DESC_SIZE;
use iecm_defs::txrx::TX_FLEX_CMD_EOP;
use iecm_defs::txrx::TX_FLEX_CMD_RS;
use iecm_defs::txrx::TX_FLOW_BUF_SIZE_MASK;
use iecm_defs::txrx::TxBaseDesc;
use iecm_defs::txrx::TxComplQidTypeGen;
use iecm_defs::txrx::TxFlexDesc;
use iecm_defs::txrx::TxFlowSchedDesc;
use iecm_defs::txrx::TxSplitqComplDesc;
use iecm_defs::virtchnl2::QueueModel;
use iecm_defs::virtchnl2::QueueType;
use iecm_defs::virtchnl2::RxqInfo;
use iecm_defs::virtchnl2::TxSchedMode;
use iecm_defs::virtchnl2::TxqInfo;
use iecm_defs::virtchnl2::VportStats;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use user_driver::emulated::EmulatedDma;
use user_driver::emulated::InterruptLines;
use user_driver::memory::MemoryBlock;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

const COMPL_QID_MASK: u32 = 0x3ff;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum TxFormat {
    Base,
    Flex,
    Flow,
}

#[derive(Debug, Clone)]
enum QueueKind {
    Tx { format: TxFormat, complq: u32 },
    Completion,
    Rx { split: bool, bufqs: Vec<u32>, buf_size: u32 },
    Buffer { buf_size: u32 },
}

/// The device view of one configured queue.
#[derive(Debug)]
struct Queue {
    vport_id: u32,
    kind: QueueKind,
    ring: u64,
    len: u16,
    desc_size: usize,
    /// The next descriptor the device reads or writes.
    head: u16,
    /// The last doorbell value.
    tail: u16,
    /// The generation written with the next completion.
    generation: bool,
    enabled: bool,
    vector: Option<u16>,
}

impl Queue {
    fn new(vport_id: u32, kind: QueueKind, ring: u64, len: u16, desc_size: usize) -> Self {
        Self {
            vport_id,
            kind,
            ring,
            len,
            desc_size,
            head: 0,
            tail: 0,
            generation: true,
            enabled: false,
            vector: None,
        }
    }

    fn desc(&self, dma: &EmulatedDma, index: u16) -> Option<MemoryBlock> {
        dma.resolve(
            self.ring + index as u64 * self.desc_size as u64,
            self.desc_size,
        )
    }

    fn read<T: FromBytes + IntoBytes + Immutable + KnownLayout>(
        &self,
        dma: &EmulatedDma,
        index: u16,
    ) -> Option<T> {
        Some(self.desc(dma, index)?.read_obj(0))
    }

    fn write<T: IntoBytes + Immutable + KnownLayout>(
        &self,
        dma: &EmulatedDma,
        index: u16,
        desc: &T,
    ) -> bool {
        let Some(mem) = self.desc(dma, index) else {
            return false;
        };
        mem.write_obj(0, desc);
        true
    }

    fn next(&self, index: u16) -> u16 {
        if index + 1 == self.len { 0 } else { index + 1 }
    }

    /// Descriptors the driver has made available.
    fn available(&self) -> u16 {
        (self.tail + self.len - self.head) % self.len
    }

    /// Moves the write position of a completion ring, flipping the
    /// generation on wrap.
    fn advance_completion(&mut self) {
        self.head = self.next(self.head);
        if self.head == 0 {
            self.generation = !self.generation;
        }
    }
}

#[derive(Debug, Default)]
struct VportQueues {
    enabled: bool,
    txqs: BTreeSet<u32>,
    rxqs: BTreeSet<u32>,
    rss_key: Vec<u8>,
    stats: VportStats,
}

/// Counters across all vports.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct LoopbackStats {
    pub tx_packets: u64,
    pub rx_packets: u64,
    /// Frames dropped for lack of receive buffers or an enabled queue.
    pub rx_dropped: u64,
    /// Descriptors that could not be read or had an unknown type.
    pub bad_descs: u64,
}

/// A frame pulled off a transmit ring.
struct TxFrame {
    data: Vec<u8>,
    complete: bool,
}

#[derive(Default)]
pub struct Loopback {
    queues: BTreeMap<u32, Queue>,
    vports: BTreeMap<u32, VportQueues>,
    stats: LoopbackStats,
}

impl Loopback {
    pub fn stats(&self) -> LoopbackStats {
        self.stats
    }

    /// Returns the vector mapped to `queue_id`.
    pub fn queue_vector(&self, queue_id: u32) -> Option<u16> {
        self.queues.get(&queue_id)?.vector
    }

    /// Returns true if `queue_id` is configured and enabled.
    pub fn queue_enabled(&self, queue_id: u32) -> bool {
        self.queues.get(&queue_id).is_some_and(|q| q.enabled)
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    pub fn add_vport(&mut self, vport_id: u32) {
        self.vports.insert(vport_id, VportQueues::default());
    }

    pub fn remove_vport(&mut self, vport_id: u32) {
        self.vports.remove(&vport_id);
        self.queues.retain(|_, q| q.vport_id != vport_id);
    }

    pub fn set_vport_enabled(&mut self, vport_id: u32, enabled: bool) {
        if let Some(vport) = self.vports.get_mut(&vport_id) {
            vport.enabled = enabled;
        }
    }

    pub fn set_rss_key(&mut self, vport_id: u32, key: Vec<u8>) {
        if let Some(vport) = self.vports.get_mut(&vport_id) {
            vport.rss_key = key;
        }
    }

    pub fn vport_stats(&self, vport_id: u32) -> VportStats {
        self.vports
            .get(&vport_id)
            .map(|v| v.stats)
            .unwrap_or_default()
    }

    pub fn configure_tx(&mut self, vport_id: u32, info: &TxqInfo) {
        let (kind, desc_size) = if info.queue_type == QueueType::TX_COMPLETION {
            (QueueKind::Completion, TX_COMPL_DESC_SIZE)
        } else {
            let format = match (info.model, info.sched_mode) {
                (QueueModel::SPLIT, TxSchedMode::FLOW) => TxFormat::Flow,
                (QueueModel::SPLIT, _) => TxFormat::Flex,
                _ => TxFormat::Base,
            };
            if let Some(vport) = self.vports.get_mut(&vport_id) {
                vport.txqs.insert(info.queue_id);
            }
            (
                QueueKind::Tx {
                    format,
                    complq: info.tx_compl_queue_id.into(),
                },
                TX_DESC_SIZE,
            )
        };
        tracing::debug!(vport_id, queue_id = info.queue_id, ?kind, "tx queue configured");
        self.insert(
            info.queue_id,
            Queue::new(vport_id, kind, info.dma_ring_addr, info.ring_len, desc_size),
        );
    }

    pub fn configure_rx(&mut self, vport_id: u32, info: &RxqInfo) {
        let kind = if info.queue_type == QueueType::RX_BUFFER {
            QueueKind::Buffer {
                buf_size: info.data_buffer_size,
            }
        } else {
            let split = info.model == QueueModel::SPLIT;
            let mut bufqs = Vec::new();
            if split {
                bufqs.push(info.rx_bufq1_id.into());
                if info.bufq2_ena != 0 {
                    bufqs.push(info.rx_bufq2_id.into());
                }
            }
            if let Some(vport) = self.vports.get_mut(&vport_id) {
                vport.rxqs.insert(info.queue_id);
            }
            QueueKind::Rx {
                split,
                bufqs,
                buf_size: info.data_buffer_size,
            }
        };
        tracing::debug!(vport_id, queue_id = info.queue_id, ?kind, "rx queue configured");
        self.insert(
            info.queue_id,
            Queue::new(vport_id, kind, info.dma_ring_addr, info.ring_len, RX_DESC_SIZE),
        );
    }

    /// Replaces a queue's configuration, keeping its vector mapping.
    fn insert(&mut self, queue_id: u32, mut queue: Queue) {
        if let Some(old) = self.queues.get(&queue_id) {
            queue.vector = old.vector;
        }
        self.queues.insert(queue_id, queue);
    }

    /// Enables or disables a configured queue. Returns false if the queue
    /// was never configured.
    pub fn set_enabled(&mut self, queue_id: u32, enabled: bool) -> bool {
        match self.queues.get_mut(&queue_id) {
            Some(q) => {
                q.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn remove_queue(&mut self, queue_id: u32) {
        self.queues.remove(&queue_id);
        for vport in self.vports.values_mut() {
            vport.txqs.remove(&queue_id);
            vport.rxqs.remove(&queue_id);
        }
    }

    pub fn map_vector(&mut self, queue_id: u32, vector: Option<u16>) {
        if let Some(q) = self.queues.get_mut(&queue_id) {
            q.vector = vector;
        }
    }

    /// Handles a tail doorbell write for `queue_id`.
    pub fn doorbell(
        &mut self,
        dma: &EmulatedDma,
        interrupts: &InterruptLines,
        queue_id: u32,
        value: u32,
    ) {
        let Some(queue) = self.queues.get_mut(&queue_id) else {
            tracing::debug!(queue_id, value, "doorbell for unconfigured queue");
            return;
        };
        if queue.len == 0 || value >= queue.len.into() {
            tracing::warn!(queue_id, value, "doorbell out of range");
            return;
        }
        queue.tail = value as u16;
        let vport_enabled = self
            .vports
            .get(&queue.vport_id)
            .is_some_and(|v| v.enabled);
        if matches!(queue.kind, QueueKind::Tx { .. }) && queue.enabled && vport_enabled {
            let mut signal = BTreeSet::new();
            self.process_tx(dma, queue_id, &mut signal);
            for vector in signal {
                interrupts.signal(vector.into());
            }
        }
    }

    fn process_tx(&mut self, dma: &EmulatedDma, queue_id: u32, signal: &mut BTreeSet<u16>) {
        let Some(txq) = self.queues.get_mut(&queue_id) else {
            return;
        };
        let QueueKind::Tx { format, complq } = txq.kind else {
            return;
        };
        let vport_id = txq.vport_id;
        let mut frames = Vec::new();
        let mut completions = Vec::new();
        let mut bad_descs = 0;

        'packets: while txq.head != txq.tail {
            let mut frame = TxFrame {
                data: Vec::new(),
                complete: true,
            };
            let mut index = txq.head;
            loop {
                if index == txq.tail {
                    // The rest of the packet has not been posted yet.
                    break 'packets;
                }
                let Some(desc) = txq.read::<TxFlexDesc>(dma, index) else {
                    bad_descs += 1;
                    frame.complete = false;
                    index = txq.next(index);
                    break;
                };
                let mut eop = false;
                let mut segment = None;
                match format {
                    TxFormat::Base => {
                        let Some(base) = txq.read::<TxBaseDesc>(dma, index) else {
                            bad_descs += 1;
                            frame.complete = false;
                            index = txq.next(index);
                            break;
                        };
                        match base.qw1.dtype() {
                            TX_DESC_DTYPE_DATA => {
                                segment = Some((base.buf_addr, base.qw1.buf_size()));
                                eop = base.qw1.cmd() & TX_BASE_CMD_EOP != 0;
                            }
                            TX_DESC_DTYPE_CTX => {}
                            _ => {
                                bad_descs += 1;
                                frame.complete = false;
                            }
                        }
                    }
                    TxFormat::Flex | TxFormat::Flow => match desc.cmd_dtype.dtype() {
                        TX_DESC_DTYPE_FLEX_DATA => {
                            segment = Some((desc.buf_addr, desc.buf_size));
                            eop = desc.cmd_dtype.cmd() & TX_FLEX_CMD_EOP != 0;
                            if eop && desc.cmd_dtype.cmd() & TX_FLEX_CMD_RS != 0 {
                                completions.push((TX_COMPLT_RS, txq.next(index)));
                            }
                        }
                        TX_DESC_DTYPE_FLEX_FLOW_SCHE => {
                            let Some(flow) = txq.read::<TxFlowSchedDesc>(dma, index) else {
                                bad_descs += 1;
                                frame.complete = false;
                                index = txq.next(index);
                                break;
                            };
                            segment = Some((flow.buf_addr, flow.rxr_bufsize & TX_FLOW_BUF_SIZE_MASK));
                            eop = flow.cmd_dtype.eop();
                            if eop {
                                completions.push((TX_COMPLT_RS, flow.compl_tag));
                                if flow.cmd_dtype.re() {
                                    completions.push((TX_COMPLT_RE, txq.next(index)));
                                }
                            }
                        }
                        TX_DESC_DTYPE_FLEX_TSO_CTX => {}
                        _ => {
                            bad_descs += 1;
                            frame.complete = false;
                        }
                    },
                }
                if let Some((addr, len)) = segment {
                    match dma.resolve(addr, len.into()) {
                        Some(mem) => frame.data.extend(mem.to_vec()),
                        None => {
                            bad_descs += 1;
                            frame.complete = false;
                        }
                    }
                }
                if eop {
                    if format == TxFormat::Base {
                        if let Some(mut base) = txq.read::<TxBaseDesc>(dma, index) {
                            base.qw1.set_dtype(TX_DESC_DTYPE_DESC_DONE);
                            txq.write(dma, index, &base);
                        }
                    }
                    index = txq.next(index);
                    break;
                }
                index = txq.next(index);
            }
            txq.head = index;
            frames.push(frame);
        }

        let txq_vector = txq.vector;
        self.stats.bad_descs += bad_descs;
        if let Some(vport) = self.vports.get_mut(&vport_id) {
            vport.stats.tx_errors += bad_descs;
        }
        if frames.is_empty() {
            return;
        }
        if format == TxFormat::Base {
            signal.extend(txq_vector);
        } else if let Some(cq) = self.queues.get_mut(&complq) {
            for (ty, value) in completions {
                let desc = TxSplitqComplDesc {
                    qid_comptype_gen: TxComplQidTypeGen::new()
                        .with_qid((queue_id & COMPL_QID_MASK) as u16)
                        .with_compl_type(ty)
                        .with_generation(cq.generation),
                    q_head_compl_tag: value,
                    ts: [0; 3],
                    reserved: 0,
                };
                if cq.write(dma, cq.head, &desc) {
                    cq.advance_completion();
                }
            }
            signal.extend(cq.vector);
        } else {
            tracing::warn!(queue_id, complq, "completion queue not configured");
        }

        let rxq = self.rx_target(vport_id, queue_id);
        for frame in frames {
            if !frame.complete {
                continue;
            }
            self.stats.tx_packets += 1;
            if let Some(vport) = self.vports.get_mut(&vport_id) {
                count_frame(&frame.data, &mut vport.stats, true);
            }
            let delivered = rxq.is_some_and(|rxq| self.deliver(dma, vport_id, rxq, &frame.data, signal));
            if !delivered {
                self.stats.rx_dropped += 1;
                if let Some(vport) = self.vports.get_mut(&vport_id) {
                    vport.stats.rx_discards += 1;
                }
            }
        }
    }

    /// The receive queue frames from transmit queue `txq` land on.
    fn rx_target(&self, vport_id: u32, txq: u32) -> Option<u32> {
        let vport = self.vports.get(&vport_id)?;
        let position = vport.txqs.iter().position(|&q| q == txq)?;
        let rxqs: Vec<u32> = vport
            .rxqs
            .iter()
            .copied()
            .filter(|q| self.queue_enabled(*q))
            .collect();
        rxqs.get(position % rxqs.len().max(1)).copied()
    }

    /// Writes `frame` into the buffers of receive queue `rxq_id`. Returns
    /// false if the frame was dropped.
    fn deliver(
        &mut self,
        dma: &EmulatedDma,
        vport_id: u32,
        rxq_id: u32,
        frame: &[u8],
        signal: &mut BTreeSet<u16>,
    ) -> bool {
        let (ptype, hash_input) = classify(frame);
        let hash = hash_input.map(|input| {
            let key = self
                .vports
                .get(&vport_id)
                .map_or(&[][..], |v| v.rss_key.as_slice());
            toeplitz(key, &input)
        });
        let Some(rxq) = self.queues.get(&rxq_id) else {
            return false;
        };
        let QueueKind::Rx { split, bufqs, buf_size } = rxq.kind.clone() else {
            return false;
        };
        let delivered = if split {
            self.deliver_split(dma, rxq_id, &bufqs, frame, ptype, hash)
        } else {
            self.deliver_single(dma, rxq_id, buf_size, frame, ptype, hash)
        };
        if delivered {
            self.stats.rx_packets += 1;
            if let Some(vport) = self.vports.get_mut(&vport_id) {
                count_frame(frame, &mut vport.stats, false);
            }
            signal.extend(self.queue_vector(rxq_id));
        }
        delivered
    }

    fn deliver_single(
        &mut self,
        dma: &EmulatedDma,
        rxq_id: u32,
        buf_size: u32,
        frame: &[u8],
        ptype: u16,
        hash: Option<u32>,
    ) -> bool {
        let Some(rxq) = self.queues.get_mut(&rxq_id) else {
            return false;
        };
        let buf_size = buf_size.max(1) as usize;
        let needed = frame.len().div_ceil(buf_size).max(1);
        if (rxq.available() as usize) < needed {
            return false;
        }
        let count = frame.chunks(buf_size).len();
        for (i, chunk) in frame.chunks(buf_size).enumerate() {
            let index = rxq.head;
            let Some(read) = rxq.read::<RxSingleqReadDesc>(dma, index) else {
                self.stats.bad_descs += 1;
                return false;
            };
            let Some(buf) = dma.resolve(read.pkt_addr, chunk.len()) else {
                self.stats.bad_descs += 1;
                return false;
            };
            buf.write_at(0, chunk);
            let eof = i + 1 == count;
            let mut wb = RxSingleqWbDesc::new_zeroed();
            let mut qw1 = RxSingleqQw1::new()
                .with_dd(true)
                .with_eof(eof)
                .with_pkt_len(chunk.len() as u16);
            if eof {
                qw1 = qw1.with_l3l4p(ptype != PTYPE_L2).with_ptype(ptype as u8);
                if let Some(hash) = hash {
                    wb.rss_hash = hash;
                    qw1 = qw1.with_fltstat(RX_SINGLEQ_FLTSTAT_RSS_HASH);
                }
            }
            wb.qw1 = qw1;
            rxq.write(dma, index, &wb);
            rxq.head = rxq.next(index);
        }
        true
    }

    fn deliver_split(
        &mut self,
        dma: &EmulatedDma,
        rxq_id: u32,
        bufqs: &[u32],
        frame: &[u8],
        ptype: u16,
        hash: Option<u32>,
    ) -> bool {
        // Check for room before consuming any buffer.
        let mut room = 0usize;
        for q in bufqs.iter().filter_map(|id| self.queues.get(id)) {
            if let QueueKind::Buffer { buf_size } = q.kind {
                if q.enabled {
                    room += q.available() as usize * buf_size as usize;
                }
            }
        }
        if room < frame.len().max(1) {
            return false;
        }

        let mut buffers = Vec::new();
        let mut remaining = frame.len().max(1);
        for (bufq_index, id) in bufqs.iter().enumerate() {
            let Some(bufq) = self.queues.get_mut(id) else {
                continue;
            };
            let QueueKind::Buffer { buf_size } = bufq.kind else {
                continue;
            };
            if !bufq.enabled {
                continue;
            }
            while remaining > 0 && bufq.available() > 0 {
                let Some(desc) = bufq.read::<RxBufDesc>(dma, bufq.head) else {
                    self.stats.bad_descs += 1;
                    return false;
                };
                bufq.head = bufq.next(bufq.head);
                buffers.push((bufq_index, desc, buf_size as usize));
                remaining = remaining.saturating_sub(buf_size as usize);
            }
        }

        let Some(rxq) = self.queues.get_mut(&rxq_id) else {
            return false;
        };
        let mut offset = 0;
        let count = buffers.len();
        for (i, (bufq_index, desc, buf_size)) in buffers.into_iter().enumerate() {
            let len = (frame.len() - offset).min(buf_size);
            let chunk = &frame[offset..offset + len];
            offset += len;
            if let Some(buf) = dma.resolve(desc.pkt_addr, chunk.len()) {
                buf.write_at(0, chunk);
            } else {
                self.stats.bad_descs += 1;
            }
            let eof = i + 1 == count;
            let mut wb = RxFlexWbDesc::new_zeroed();
            wb.rxdid_ucast = RXDID_FLEX_SPLITQ;
            wb.buf_id = desc.buf_id;
            wb.pktlen_gen_bufq_id = RxFlexPktlenGen::new()
                .with_pkt_len(len as u16)
                .with_generation(rxq.generation)
                .with_bufq_id(bufq_index == 1);
            wb.status_err0_qw1 = RX_FLEX_STATUS1_DD;
            if eof {
                wb.status_err0_qw1 |= RX_FLEX_STATUS1_EOF;
                if ptype != PTYPE_L2 {
                    wb.status_err0_qw1 |= RX_FLEX_STATUS1_L3L4P;
                }
                wb.ptype_err_fflags0 = RxFlexPtype::new().with_ptype(ptype);
                if let Some(hash) = hash {
                    wb.status_err0_qw0 |= RX_FLEX_STATUS0_RSS_VALID;
                    wb.set_rss_hash(hash);
                }
            }
            if rxq.write(dma, rxq.head, &wb) {
                rxq.advance_completion();
            }
        }
        true
    }
}

fn count_frame(frame: &[u8], stats: &mut VportStats, tx: bool) {
    let (bytes, unicast, multicast, broadcast) = if tx {
        (
            &mut stats.tx_bytes,
            &mut stats.tx_unicast,
            &mut stats.tx_multicast,
            &mut stats.tx_broadcast,
        )
    } else {
        (
            &mut stats.rx_bytes,
            &mut stats.rx_unicast,
            &mut stats.rx_multicast,
            &mut stats.rx_broadcast,
        )
    };
    *bytes += frame.len() as u64;
    match frame.get(..6) {
        Some([0xff, 0xff, 0xff, 0xff, 0xff, 0xff]) => *broadcast += 1,
        Some([first, ..]) if first & 1 != 0 => *multicast += 1,
        _ => *unicast += 1,
    }
}

/// The packet type for frames without a recognized L3 header.
const PTYPE_L2: u16 = 1;

/// Returns the hardware packet type of `frame`, and the RSS hash input for
/// IP frames.
fn classify(frame: &[u8]) -> (u16, Option<Vec<u8>>) {
    let mut l3 = 14;
    let mut ethertype = match frame.get(12..14) {
        Some(&[a, b]) => u16::from_be_bytes([a, b]),
        _ => return (PTYPE_L2, None),
    };
    if ethertype == 0x8100 {
        ethertype = match frame.get(16..18) {
            Some(&[a, b]) => u16::from_be_bytes([a, b]),
            _ => return (PTYPE_L2, None),
        };
        l3 = 18;
    }
    match ethertype {
        0x0800 => {
            let Some(ip) = frame.get(l3..l3 + 20) else {
                return (PTYPE_L2, None);
            };
            let ihl = (ip[0] & 0xf) as usize * 4;
            let fragment = u16::from_be_bytes([ip[6], ip[7]]) & 0x3fff != 0;
            let mut input = ip[12..20].to_vec();
            let ptype = match ip[9] {
                _ if fragment => 22,
                6 => 26,
                17 => 24,
                132 => 27,
                1 => 28,
                _ => 23,
            };
            if matches!(ptype, 24 | 26) {
                if let Some(ports) = frame.get(l3 + ihl..l3 + ihl + 4) {
                    input.extend_from_slice(ports);
                }
            }
            (ptype, Some(input))
        }
        0x86dd => {
            let Some(ip) = frame.get(l3..l3 + 40) else {
                return (PTYPE_L2, None);
            };
            let mut input = ip[8..40].to_vec();
            let ptype = match ip[6] {
                44 => 88,
                6 => 92,
                17 => 90,
                132 => 93,
                58 => 94,
                _ => 89,
            };
            if matches!(ptype, 90 | 92) {
                if let Some(ports) = frame.get(l3 + 40..l3 + 44) {
                    input.extend_from_slice(ports);
                }
            }
            (ptype, Some(input))
        }
        _ => (PTYPE_L2, None),
    }
}

/// The 32 bits of `key` starting at bit `offset`, reading zeros past its
/// end.
fn key_window(key: &[u8], offset: usize) -> u32 {
    (0..32).fold(0, |window, i| {
        let bit = offset + i;
        let set = key.get(bit / 8).is_some_and(|b| b & (0x80 >> (bit % 8)) != 0);
        (window << 1) | set as u32
    })
}

/// The Toeplitz hash of `input` under `key`.
pub fn toeplitz(key: &[u8], input: &[u8]) -> u32 {
    let mut hash = 0;
    for (i, byte) in input.iter().enumerate() {
        for bit in 0..8 {
            if byte & (0x80 >> bit) != 0 {
                hash ^= key_window(key, i * 8 + bit);
            }
        }
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::PTYPE_L2;
    use super::classify;
    use super::toeplitz;

    const KEY: [u8; 40] = [
        0x6d, 0x5a, 0x56, 0xda, 0x25, 0x5b, 0x0e, 0xc2, 0x41, 0x67, 0x25, 0x3d, 0x43, 0xa3, 0x8f,
        0xb0, 0xd0, 0xca, 0x2b, 0xcb, 0xae, 0x7b, 0x30, 0xb4, 0x77, 0xcb, 0x2d, 0xa3, 0x80, 0x30,
        0xf2, 0x0c, 0x6a, 0x42, 0xb7, 0x3b, 0xbe, 0xac, 0x01, 0xfa,
    ];

    #[test]
    fn toeplitz_verification_vector() {
        // 66.9.149.187:2794 -> 161.142.100.80:1766
        let addrs = [66, 9, 149, 187, 161, 142, 100, 80];
        assert_eq!(toeplitz(&KEY, &addrs), 0x323e_8fc2);
        let mut tuple = addrs.to_vec();
        tuple.extend_from_slice(&2794u16.to_be_bytes());
        tuple.extend_from_slice(&1766u16.to_be_bytes());
        assert_eq!(toeplitz(&KEY, &tuple), 0x51cc_c178);
    }

    #[test]
    fn frames_classify_by_protocol() {
        let mut frame = vec![0u8; 64];
        frame[12..14].copy_from_slice(&0x0800u16.to_be_bytes());
        frame[14] = 0x45;
        frame[23] = 6;
        let (ptype, input) = classify(&frame);
        assert_eq!(ptype, 26);
        assert_eq!(input.unwrap().len(), 12);

        frame[23] = 47;
        let (ptype, input) = classify(&frame);
        assert_eq!(ptype, 23);
        assert_eq!(input.unwrap().len(), 8);

        frame[12..14].copy_from_slice(&0x0806u16.to_be_bytes());
        assert_eq!(classify(&frame), (PTYPE_L2, None));
        assert_eq!(classify(&[0; 10]), (PTYPE_L2, None));
    }
}
