// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Vports and the queue vectors that poll their queues.
//!
//! Queue groups are handed to vectors round robin, and each vector owns its
//! groups outright, so only one poller ever touches a given queue.

use crate::config::IecmConfig;
use crate::config::ItrConfig;
use crate::config::LinkSpeed;
use crate::error::RxError;
use crate::error::TxError;
use crate::itr::ItrWrite;
use crate::itr::VectorItr;
use crate::negotiate::Negotiated;
use crate::resources::Resource;
use crate::resources::ResourceArena;
use crate::rx::RX_BUF_STRIDE;
use crate::rx::RX_HDR_SIZE;
use crate::rx::RxBufQueue;
use crate::rx::RxBufQueueParams;
use crate::rx::RxDeliver;
use crate::rx::RxFeatures;
use crate::rx::RxGroup;
use crate::rx::RxQueue;
use crate::rx::RxQueueParams;
use crate::rx::RxStats;
use crate::tx::CleanStats;
use crate::tx::TxComplQueue;
use crate::tx::TxDescFormat;
use crate::tx::TxQueue;
use crate::tx::TxQueueParams;
use crate::tx::TxStats;
use crate::virtchnl::VirtchnlChannel;
use anyhow::Context;
use iecm_defs::regs::DynCtl;
use iecm_defs::regs::ITR_IDX_RX;
use iecm_defs::regs::ITR_IDX_TX;
use iecm_defs::virtchnl2;
use iecm_defs::virtchnl2::CreateVport;
use iecm_defs::virtchnl2::QueueChunk;
use iecm_defs::virtchnl2::QueueRegChunk;
use iecm_defs::virtchnl2::QueueType;
use iecm_defs::virtchnl2::QueueVector as QueueVectorMap;
use iecm_defs::virtchnl2::RxqInfo;
use iecm_defs::virtchnl2::TxSchedMode;
use iecm_defs::virtchnl2::TxqInfo;
use iecm_defs::virtchnl2::VectorChunk;
use iecm_defs::virtchnl2::VportStats;
use std::sync::Arc;
use std::time::Instant;
use user_driver::DeviceRegisterIo;
use user_driver::DmaClient;
use user_driver::interrupt::DeviceInterrupt;
use zerocopy::FromZeros;

/// The Toeplitz key programmed when the control plane does not supply one,
/// repeated to fill the key size the vport reports.
pub const DEFAULT_RSS_KEY: [u8; 40] = [
    0x6d, 0x5a, 0x56, 0xda, 0x25, 0x5b, 0x0e, 0xc2, 0x41, 0x67, 0x25, 0x3d, 0x43, 0xa3, 0x8f, 0xb0,
    0xd0, 0xca, 0x2b, 0xcb, 0xae, 0x7b, 0x30, 0xb4, 0x77, 0xcb, 0x2d, 0xa3, 0x80, 0x30, 0xf2, 0x0c,
    0x6a, 0x42, 0xb7, 0x3b, 0xbe, 0xac, 0x01, 0xfa,
];
const DEFAULT_RSS_KEY_SIZE: usize = 52;
const DEFAULT_RSS_LUT_SIZE: usize = 64;
/// Ethernet header, FCS and one VLAN tag.
const ETH_OVERHEAD: u32 = 14 + 4 + 4;

/// A queue assigned by the control plane.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct QueueSlot {
    pub queue_id: u32,
    /// Offset of the tail doorbell.
    pub tail: usize,
}

/// Expands the register chunks of queue type `ty` into one slot per queue.
pub fn expand_queue_chunks(chunks: &[QueueRegChunk], ty: QueueType) -> Vec<QueueSlot> {
    chunks
        .iter()
        .filter(|c| c.queue_type == ty)
        .flat_map(|c| {
            (0..c.num_queues).map(move |i| QueueSlot {
                queue_id: c.start_queue_id + i,
                tail: (c.qtail_reg_start + i as u64 * c.qtail_reg_spacing as u64) as usize,
            })
        })
        .collect()
}

/// An interrupt vector assigned by the control plane.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct VectorSlot {
    pub vector_id: u16,
    /// Offset of the dynamic control register.
    pub dyn_ctl: usize,
}

pub fn expand_vector_chunks(chunks: &[VectorChunk]) -> Vec<VectorSlot> {
    chunks
        .iter()
        .flat_map(|c| {
            (0..c.num_vectors).map(move |i| VectorSlot {
                vector_id: c.start_vector_id + i,
                dyn_ctl: (c.dynctl_reg_start + i as u32 * c.dynctl_reg_spacing) as usize,
            })
        })
        .collect()
}

/// Transmit queues completed together. In the split model the group shares
/// one completion queue; in the single model it holds one queue.
pub struct TxGroup {
    pub txqs: Vec<TxQueue>,
    pub complq: Option<TxComplQueue>,
}

impl TxGroup {
    pub fn clean(&mut self, budget: u32) -> CleanStats {
        match &mut self.complq {
            Some(complq) => complq.clean(&mut self.txqs, budget),
            None => {
                let mut stats = CleanStats::default();
                for txq in &mut self.txqs {
                    stats += txq.clean_single(budget);
                }
                stats
            }
        }
    }
}

/// The result of polling a queue vector.
#[derive(Debug)]
pub struct PollResult {
    pub tx: CleanStats,
    pub rx: CleanStats,
    /// A receive buffer shortfall, retried on the next poll.
    pub refill: Result<(), RxError>,
    /// The budget was used up, so the interrupt was left disabled and the
    /// vector should be polled again.
    pub more: bool,
}

pub struct QueueVector {
    vector_id: u16,
    dyn_ctl: usize,
    regs: Arc<dyn DeviceRegisterIo>,
    interrupt: DeviceInterrupt,
    pub tx: Vec<TxGroup>,
    pub rx: Vec<RxGroup>,
    itr: VectorItr,
}

impl QueueVector {
    fn new(
        slot: VectorSlot,
        regs: Arc<dyn DeviceRegisterIo>,
        interrupt: DeviceInterrupt,
        itr: &ItrConfig,
    ) -> Self {
        Self {
            vector_id: slot.vector_id,
            dyn_ctl: slot.dyn_ctl,
            regs,
            interrupt,
            tx: Vec::new(),
            rx: Vec::new(),
            itr: VectorItr::new(itr),
        }
    }

    pub fn vector_id(&self) -> u16 {
        self.vector_id
    }

    /// The interrupt that signals work for this vector.
    pub fn interrupt(&mut self) -> &mut DeviceInterrupt {
        &mut self.interrupt
    }

    pub fn itr(&self) -> &VectorItr {
        &self.itr
    }

    fn write_dyn_ctl(&self, value: DynCtl) {
        self.regs.write_u32(self.dyn_ctl, value.into_bits());
    }

    fn enable_interrupt(&self) {
        self.write_dyn_ctl(ItrWrite::NONE.dyn_ctl());
    }

    fn disable_interrupt(&self) {
        self.write_dyn_ctl(DynCtl::new().with_itr_indx(ItrWrite::NONE.index));
    }

    /// Cleans every queue of the vector, processing up to `budget`
    /// descriptors per queue. Unless the budget ran out, updates interrupt
    /// moderation and re-enables the interrupt.
    pub fn poll(
        &mut self,
        budget: u32,
        itr: &ItrConfig,
        deliver: &mut dyn RxDeliver,
    ) -> PollResult {
        let mut tx = CleanStats::default();
        let mut more = false;
        for group in &mut self.tx {
            let stats = group.clean(budget);
            more |= stats.packets >= budget;
            tx += stats;
        }
        let mut rx = CleanStats::default();
        let mut refill = Ok(());
        for group in &mut self.rx {
            let (stats, result) = group.clean(budget, deliver);
            more |= stats.packets >= budget;
            rx += stats;
            if let Err(err) = result {
                refill = Err(err);
            }
        }

        if !more {
            self.itr.tx.record(tx.packets, tx.bytes);
            self.itr.rx.record(rx.packets, rx.bytes);
            let write = self.itr.update(itr, Instant::now());
            self.write_dyn_ctl(write.dyn_ctl());
        }
        PollResult {
            tx,
            rx,
            refill,
            more,
        }
    }
}

/// The queue layout and offloads of a vport, derived from what was
/// negotiated.
#[derive(Debug, Clone)]
struct VportLayout {
    tx_split: bool,
    rx_split: bool,
    flow: bool,
    txqs: Vec<QueueSlot>,
    complqs: Vec<QueueSlot>,
    rxqs: Vec<QueueSlot>,
    bufqs: Vec<QueueSlot>,
    num_tx_groups: usize,
    num_rx_groups: usize,
    tx_csum: bool,
    tso: bool,
    rx: RxFeatures,
}

impl VportLayout {
    fn new(negotiated: &Negotiated, config: &IecmConfig) -> anyhow::Result<Self> {
        let caps = &negotiated.caps;
        let vport = &negotiated.vport;
        let queues = &config.queues;
        let tx_split = vport.txq_model == virtchnl2::QueueModel::SPLIT;
        let rx_split = vport.rxq_model == virtchnl2::QueueModel::SPLIT;
        let txqs = expand_queue_chunks(&negotiated.chunks, QueueType::TX);
        let complqs = expand_queue_chunks(&negotiated.chunks, QueueType::TX_COMPLETION);
        let rxqs = expand_queue_chunks(&negotiated.chunks, QueueType::RX);
        let bufqs = expand_queue_chunks(&negotiated.chunks, QueueType::RX_BUFFER);
        anyhow::ensure!(
            !txqs.is_empty() && !rxqs.is_empty(),
            "vport {} has no queues",
            vport.vport_id
        );

        let num_tx_groups = if tx_split { complqs.len() } else { txqs.len() };
        anyhow::ensure!(num_tx_groups > 0, "split tx model without completion queues");
        let num_rx_groups = if rx_split {
            bufqs
                .len()
                .div_ceil(queues.bufq_per_group.clamp(1, 2) as usize)
        } else {
            rxqs.len()
        };
        anyhow::ensure!(num_rx_groups > 0, "split rx model without buffer queues");

        Ok(Self {
            tx_split,
            rx_split,
            flow: tx_split && vport.tx_desc_ids & virtchnl2::TXDID_FLEX_FLOW_SCHED_M != 0,
            num_tx_groups,
            num_rx_groups,
            tx_csum: queues.tx_csum && caps.csum_caps & virtchnl2::CAP_TX_CSUM_L4_IPV4_TCP != 0,
            tso: queues.tso && caps.seg_caps & virtchnl2::CAP_SEG_IPV4_TCP != 0,
            rx: RxFeatures {
                csum: queues.rx_csum && caps.csum_caps & virtchnl2::CAP_RX_CSUM_L4_IPV4_TCP != 0,
                hash: queues.rx_hash && caps.rss_caps != 0,
                rsc: queues.rsc && rx_split && caps.rsc_caps != 0,
                hsplit: queues.hsplit && rx_split && caps.hsplit_caps != 0,
            },
            txqs,
            complqs,
            rxqs,
            bufqs,
        })
    }

    fn tx_format(&self) -> TxDescFormat {
        match (self.tx_split, self.flow) {
            (false, _) => TxDescFormat::Base,
            (true, false) => TxDescFormat::Flex,
            (true, true) => TxDescFormat::Flow,
        }
    }

    fn queue_model(split: bool) -> virtchnl2::QueueModel {
        if split {
            virtchnl2::QueueModel::SPLIT
        } else {
            virtchnl2::QueueModel::SINGLE
        }
    }

    fn rx_desc_ids(&self) -> u64 {
        if self.rx_split {
            virtchnl2::RXDID_7_FLEX_SPLITQ_M
        } else {
            virtchnl2::RXDID_1_32B_BASE_M
        }
    }
}

/// Everything a vport needs from its adapter.
pub struct VportParams<'a> {
    pub channel: Arc<VirtchnlChannel>,
    pub dma: Arc<dyn DmaClient>,
    pub regs: Arc<dyn DeviceRegisterIo>,
    pub negotiated: &'a Negotiated,
    pub config: &'a IecmConfig,
    /// Maps a device interrupt vector.
    pub map_interrupt: &'a mut dyn FnMut(u32) -> anyhow::Result<DeviceInterrupt>,
}

/// Messages sent to configure the queues of a vport.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct ConfigMessages {
    pub tx: usize,
    pub rx: usize,
    pub vector_maps: usize,
}

pub struct Vport {
    info: CreateVport,
    channel: Arc<VirtchnlChannel>,
    itr: ItrConfig,
    vectors: Vec<QueueVector>,
    arena: ResourceArena,
    config_msgs: ConfigMessages,
}

impl Vport {
    /// Builds the queues of the negotiated vport, configures them with the
    /// control plane and enables the vport. On failure, everything set up so
    /// far, including the vport itself, is torn down.
    pub fn new(params: VportParams<'_>) -> anyhow::Result<Self> {
        let info = params.negotiated.vport;
        let mut arena = ResourceArena::new();
        arena.push(Resource::Vport(info.vport_id));
        let mut vport = Self {
            info,
            channel: params.channel.clone(),
            itr: params.config.itr.clone(),
            vectors: Vec::new(),
            arena,
            config_msgs: ConfigMessages::default(),
        };
        if let Err(err) = vport.init(params) {
            vport.close();
            return Err(err);
        }
        Ok(vport)
    }

    fn init(&mut self, params: VportParams<'_>) -> anyhow::Result<()> {
        let VportParams {
            channel,
            dma,
            regs,
            negotiated,
            config,
            map_interrupt,
        } = params;
        let vport_id = self.info.vport_id;
        let layout = VportLayout::new(negotiated, config)?;
        let queues = &config.queues;
        tracing::debug!(
            vport_id,
            tx_groups = layout.num_tx_groups,
            rx_groups = layout.num_rx_groups,
            flow = layout.flow,
            "building vport"
        );

        // Vectors first, so that queue groups have somewhere to go.
        let want = layout.num_tx_groups.max(layout.num_rx_groups) as u16;
        let vector_chunks = channel
            .alloc_vectors(want)
            .context("failed to allocate vectors")?;
        self.arena.push(Resource::Vectors(vector_chunks.clone()));
        let slots = expand_vector_chunks(&vector_chunks);
        anyhow::ensure!(!slots.is_empty(), "no vectors allocated");
        for slot in slots {
            let interrupt = map_interrupt(slot.vector_id.into())
                .with_context(|| format!("failed to map vector {}", slot.vector_id))?;
            self.vectors
                .push(QueueVector::new(slot, regs.clone(), interrupt, &self.itr));
        }
        let num_vectors = self.vectors.len();

        let mut txq_info = Vec::new();
        let mut qv_maps = Vec::new();
        let txq_count = crate::config::validate_desc_count(queues.tx_desc_count)?;
        let complq_count = crate::config::validate_desc_count(queues.tx_compl_desc_count)?;
        let txq_per_group = layout.txqs.len().div_ceil(layout.num_tx_groups);
        for (g, txqs) in layout.txqs.chunks(txq_per_group).enumerate() {
            let vector = &mut self.vectors[g % num_vectors];
            let complq_slot = layout.complqs.get(g).copied();
            let mut group = TxGroup {
                txqs: Vec::new(),
                complq: None,
            };
            for (i, slot) in txqs.iter().enumerate() {
                let txq = TxQueue::new(
                    dma.clone(),
                    regs.clone(),
                    TxQueueParams {
                        queue_id: slot.queue_id as u16,
                        count: txq_count,
                        format: layout.tx_format(),
                        tail: slot.tail,
                        csum: layout.tx_csum,
                        tso: layout.tso,
                    },
                )
                .with_context(|| format!("failed to create tx queue {}", slot.queue_id))?;
                let mut info = TxqInfo::new_zeroed();
                info.dma_ring_addr = txq.ring().iova();
                info.queue_type = QueueType::TX;
                info.queue_id = slot.queue_id;
                info.relative_queue_id = i as u16;
                info.model = VportLayout::queue_model(layout.tx_split);
                info.sched_mode = if layout.flow {
                    TxSchedMode::FLOW
                } else {
                    TxSchedMode::QUEUE
                };
                info.ring_len = txq_count;
                if let Some(complq) = complq_slot {
                    info.tx_compl_queue_id = complq.queue_id as u16;
                } else {
                    qv_maps.push(map_entry(slot.queue_id, vector, ITR_IDX_TX, QueueType::TX));
                }
                txq_info.push(info);
                group.txqs.push(txq);
            }
            if let Some(slot) = complq_slot {
                let complq = TxComplQueue::new(dma.as_ref(), complq_count).with_context(|| {
                    format!("failed to create tx completion queue {}", slot.queue_id)
                })?;
                let mut info = TxqInfo::new_zeroed();
                info.dma_ring_addr = complq.ring().iova();
                info.queue_type = QueueType::TX_COMPLETION;
                info.queue_id = slot.queue_id;
                info.model = virtchnl2::QueueModel::SPLIT;
                info.sched_mode = if layout.flow {
                    TxSchedMode::FLOW
                } else {
                    TxSchedMode::QUEUE
                };
                info.ring_len = complq_count;
                txq_info.push(info);
                qv_maps.push(map_entry(
                    slot.queue_id,
                    vector,
                    ITR_IDX_TX,
                    QueueType::TX_COMPLETION,
                ));
                group.complq = Some(complq);
            }
            vector.tx.push(group);
        }

        let mut rxq_info = Vec::new();
        let rxq_count = crate::config::validate_desc_count(queues.rx_desc_count)?;
        let bufq_count = crate::config::validate_desc_count(queues.rx_bufq_desc_count)?;
        let rxq_per_group = layout.rxqs.len().div_ceil(layout.num_rx_groups);
        let bufq_per_group = layout.bufqs.len().div_ceil(layout.num_rx_groups).max(1);
        let mut qflags = 0;
        if layout.rx.rsc {
            qflags |= virtchnl2::RXQ_RSC;
        }
        if layout.rx.hsplit {
            qflags |= virtchnl2::RXQ_HDR_SPLIT;
        }
        let max_pkt_size = queues.max_mtu as u32 + ETH_OVERHEAD;
        for (g, rxqs) in layout.rxqs.chunks(rxq_per_group).enumerate() {
            let vector = &mut self.vectors[g % num_vectors];
            let mut group = RxGroup {
                rxqs: Vec::new(),
                bufqs: Vec::new(),
            };
            let mut bufq_ids = [0u16; 2];
            if layout.rx_split {
                let start = g * bufq_per_group;
                let end = (start + bufq_per_group).min(layout.bufqs.len());
                for (i, slot) in layout.bufqs.get(start..end).unwrap_or(&[]).iter().enumerate() {
                    let bufq = RxBufQueue::new(
                        dma.clone(),
                        regs.clone(),
                        RxBufQueueParams {
                            queue_id: slot.queue_id as u16,
                            count: bufq_count,
                            tail: slot.tail,
                            page_size: queues.rx_page_size,
                            hsplit: layout.rx.hsplit,
                            num_refillqs: rxqs.len(),
                        },
                    )
                    .with_context(|| format!("failed to create buffer queue {}", slot.queue_id))?;
                    let mut info = RxqInfo::new_zeroed();
                    info.desc_ids = layout.rx_desc_ids();
                    info.dma_ring_addr = bufq.ring().iova();
                    info.queue_type = QueueType::RX_BUFFER;
                    info.queue_id = slot.queue_id;
                    info.model = virtchnl2::QueueModel::SPLIT;
                    info.hdr_buffer_size = if layout.rx.hsplit { RX_HDR_SIZE as u16 } else { 0 };
                    info.data_buffer_size = bufq.pool().buf_size();
                    info.ring_len = bufq_count;
                    info.buffer_notif_stride = RX_BUF_STRIDE as u8;
                    info.qflags = qflags;
                    rxq_info.push(info);
                    if let Some(id) = bufq_ids.get_mut(i) {
                        *id = slot.queue_id as u16;
                    }
                    group.bufqs.push(bufq);
                }
                anyhow::ensure!(!group.bufqs.is_empty(), "rx group {g} has no buffer queues");
            }
            for (i, slot) in rxqs.iter().enumerate() {
                let params = RxQueueParams {
                    queue_id: slot.queue_id as u16,
                    count: rxq_count,
                    features: layout.rx,
                    page_size: queues.rx_page_size,
                    tail: slot.tail,
                };
                let rxq = if layout.rx_split {
                    RxQueue::new_split(dma.as_ref(), regs.clone(), params, i)
                        .map_err(anyhow::Error::from)
                } else {
                    RxQueue::new_single(dma.clone(), regs.clone(), params)
                }
                .with_context(|| format!("failed to create rx queue {}", slot.queue_id))?;
                let mut info = RxqInfo::new_zeroed();
                info.desc_ids = layout.rx_desc_ids();
                info.dma_ring_addr = rxq.ring().iova();
                info.queue_type = QueueType::RX;
                info.queue_id = slot.queue_id;
                info.model = VportLayout::queue_model(layout.rx_split);
                info.hdr_buffer_size = if layout.rx.hsplit { RX_HDR_SIZE as u16 } else { 0 };
                info.data_buffer_size = rxq
                    .pool()
                    .or_else(|| group.bufqs.first().map(|b| b.pool()))
                    .map_or(0, |pool| pool.buf_size());
                info.max_pkt_size = max_pkt_size;
                info.ring_len = rxq_count;
                info.qflags = qflags;
                if layout.rx_split {
                    info.rx_bufq1_id = bufq_ids[0];
                    info.rx_bufq2_id = bufq_ids[1];
                    info.bufq2_ena = (group.bufqs.len() > 1) as u8;
                }
                rxq_info.push(info);
                qv_maps.push(map_entry(slot.queue_id, vector, ITR_IDX_RX, QueueType::RX));
                group.rxqs.push(rxq);
            }
            vector.rx.push(group);
        }

        self.config_msgs.tx = channel
            .config_tx_queues(vport_id, &txq_info)
            .context("failed to configure tx queues")?;
        self.config_msgs.rx = channel
            .config_rx_queues(vport_id, &rxq_info)
            .context("failed to configure rx queues")?;

        for vector in &mut self.vectors {
            for group in &mut vector.rx {
                if let Err(err) = group.fill() {
                    tracing::warn!(
                        vport_id,
                        error = &err as &dyn std::error::Error,
                        "initial rx fill incomplete"
                    );
                }
            }
        }

        self.config_msgs.vector_maps = channel
            .map_queue_vector(vport_id, &qv_maps)
            .context("failed to map queue vectors")?;
        self.arena.push(Resource::QueueVectorMaps {
            vport_id,
            maps: qv_maps,
        });

        if layout.rx.hash {
            self.program_rss(&channel, layout.rxqs.len(), negotiated.caps.rss_caps)?;
        }

        let chunks: Vec<_> = negotiated
            .chunks
            .iter()
            .map(|c| QueueChunk {
                queue_type: c.queue_type,
                start_queue_id: c.start_queue_id,
                num_queues: c.num_queues,
                pad: 0,
            })
            .collect();
        channel
            .enable_queues(vport_id, &chunks)
            .context("failed to enable queues")?;
        self.arena
            .push(Resource::EnabledQueues { vport_id, chunks });
        channel
            .enable_vport(vport_id)
            .context("failed to enable vport")?;
        self.arena.push(Resource::EnabledVport(vport_id));

        for vector in &self.vectors {
            vector.enable_interrupt();
        }
        tracing::info!(
            vport_id,
            txqs = layout.txqs.len(),
            rxqs = layout.rxqs.len(),
            vectors = self.vectors.len(),
            "vport enabled"
        );
        Ok(())
    }

    fn program_rss(
        &self,
        channel: &VirtchnlChannel,
        num_rxq: usize,
        rss_caps: u64,
    ) -> anyhow::Result<()> {
        let vport_id = self.info.vport_id;
        let key_size = match self.info.rss_key_size {
            0 => DEFAULT_RSS_KEY_SIZE,
            n => n.into(),
        };
        let key: Vec<u8> = DEFAULT_RSS_KEY.iter().copied().cycle().take(key_size).collect();
        channel
            .set_rss_key(vport_id, &key)
            .context("failed to set rss key")?;
        let lut_size = match self.info.rss_lut_size {
            0 => DEFAULT_RSS_LUT_SIZE,
            n => n.into(),
        };
        let lut: Vec<u32> = (0..lut_size).map(|i| (i % num_rxq) as u32).collect();
        channel
            .set_rss_lut(vport_id, &lut)
            .context("failed to set rss lut")?;
        channel
            .set_rss_hash(vport_id, virtchnl2::RSS_HASH_DEFAULT & rss_caps)
            .context("failed to set rss hash")?;
        Ok(())
    }

    /// Disables the vport and releases its device resources and queues.
    pub fn close(&mut self) {
        for vector in &self.vectors {
            vector.disable_interrupt();
        }
        std::mem::take(&mut self.arena).destroy(&self.channel);
        self.vectors.clear();
    }

    pub fn vport_id(&self) -> u32 {
        self.info.vport_id
    }

    pub fn mac_address(&self) -> [u8; 6] {
        self.info.default_mac_addr
    }

    pub fn info(&self) -> &CreateVport {
        &self.info
    }

    pub fn config_messages(&self) -> ConfigMessages {
        self.config_msgs
    }

    pub fn is_closed(&self) -> bool {
        self.arena.is_empty()
    }

    pub fn vectors(&self) -> &[QueueVector] {
        &self.vectors
    }

    pub fn vectors_mut(&mut self) -> &mut [QueueVector] {
        &mut self.vectors
    }

    pub fn itr_config(&self) -> &ItrConfig {
        &self.itr
    }

    pub fn set_link_speed(&mut self, speed: LinkSpeed) {
        self.itr.link_speed = speed;
    }

    fn txqs(&self) -> impl Iterator<Item = &TxQueue> {
        self.vectors
            .iter()
            .flat_map(|v| &v.tx)
            .flat_map(|g| &g.txqs)
    }

    fn rxqs(&self) -> impl Iterator<Item = &RxQueue> {
        self.vectors
            .iter()
            .flat_map(|v| &v.rx)
            .flat_map(|g| &g.rxqs)
    }

    pub fn num_txq(&self) -> usize {
        self.txqs().count()
    }

    pub fn num_rxq(&self) -> usize {
        self.rxqs().count()
    }

    /// Returns the transmit queue with hardware id `queue_id`.
    pub fn txq_mut(&mut self, queue_id: u16) -> Option<&mut TxQueue> {
        self.vectors
            .iter_mut()
            .flat_map(|v| &mut v.tx)
            .flat_map(|g| &mut g.txqs)
            .find(|q| q.queue_id() == queue_id)
    }

    /// Transmits `packet` on queue `queue_id`.
    pub fn send(
        &mut self,
        queue_id: u16,
        packet: &crate::tx::TxPacket,
    ) -> Result<(), TxError> {
        self.txq_mut(queue_id)
            .ok_or(TxError::Malformed("no such transmit queue"))?
            .send(packet)
    }

    /// Polls vector `index`.
    pub fn poll(
        &mut self,
        index: usize,
        budget: u32,
        deliver: &mut dyn RxDeliver,
    ) -> Option<PollResult> {
        let vector = self.vectors.get_mut(index)?;
        Some(vector.poll(budget, &self.itr, deliver))
    }

    pub fn tx_stats(&self) -> Vec<(u16, TxStats)> {
        self.txqs().map(|q| (q.queue_id(), q.stats())).collect()
    }

    pub fn rx_stats(&self) -> Vec<(u16, RxStats)> {
        self.rxqs().map(|q| (q.queue_id(), q.stats())).collect()
    }

    /// Queries the device counters of the vport.
    pub fn device_stats(&self) -> anyhow::Result<VportStats> {
        self.channel
            .get_stats(self.info.vport_id)
            .context("failed to query vport statistics")
    }
}

fn map_entry(queue_id: u32, vector: &QueueVector, itr_idx: u8, ty: QueueType) -> QueueVectorMap {
    QueueVectorMap {
        queue_id,
        vector_id: vector.vector_id,
        pad: 0,
        itr_idx: itr_idx.into(),
        queue_type: ty,
    }
}
