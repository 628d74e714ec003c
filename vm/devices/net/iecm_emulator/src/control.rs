// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The emulated control plane: handles virtchnl2 requests from the driver
//! and owns the vports, vectors and queues it hands out.

use crate::datapath::Loopback;
use crate::mailbox::Message;
use anyhow::Context;
use iecm_defs::regs;
use iecm_defs::virtchnl2;
use iecm_defs::virtchnl2::AddQueues;
use iecm_defs::virtchnl2::AllocVectors;
use iecm_defs::virtchnl2::ConfigRxQueues;
use iecm_defs::virtchnl2::ConfigTxQueues;
use iecm_defs::virtchnl2::CreateVport;
use iecm_defs::virtchnl2::DelEnaDisQueues;
use iecm_defs::virtchnl2::GetCapabilities;
use iecm_defs::virtchnl2::QueueChunk;
use iecm_defs::virtchnl2::QueueModel;
use iecm_defs::virtchnl2::QueueRegChunk;
use iecm_defs::virtchnl2::QueueType;
use iecm_defs::virtchnl2::QueueVector;
use iecm_defs::virtchnl2::QueueVectorMaps;
use iecm_defs::virtchnl2::RssHash;
use iecm_defs::virtchnl2::RssKey;
use iecm_defs::virtchnl2::RssLut;
use iecm_defs::virtchnl2::RxqInfo;
use iecm_defs::virtchnl2::TxqInfo;
use iecm_defs::virtchnl2::VectorChunk;
use iecm_defs::virtchnl2::VectorChunks;
use iecm_defs::virtchnl2::VersionInfo;
use iecm_defs::virtchnl2::VirtchnlOp;
use iecm_defs::virtchnl2::VirtchnlStatus;
use iecm_defs::virtchnl2::VportId;
use iecm_defs::virtchnl2::VportStats;
use iecm_defs::virtchnl2::encode;
use iecm_defs::virtchnl2::read_entries;
use iecm_defs::virtchnl2::split_header;
use slab::Slab;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

/// Queue ids of a vport are allocated from a block of this many ids, one
/// quarter per queue type.
const QUEUE_ID_BLOCK: u32 = 256;
const QUEUE_ID_TYPE_SPAN: u32 = QUEUE_ID_BLOCK / 4;
const RSS_KEY_SIZE: u16 = 52;
const RSS_LUT_SIZE: u16 = 64;

/// A request refused with a specific virtchnl status.
#[derive(Debug, Error)]
#[error("{reason}")]
pub struct Rejected {
    pub status: VirtchnlStatus,
    pub reason: String,
}

fn reject(status: VirtchnlStatus, reason: impl Into<String>) -> anyhow::Error {
    Rejected {
        status,
        reason: reason.into(),
    }
    .into()
}

/// The status reported for a failed request. Errors that do not name one
/// are invalid arguments.
fn error_status(err: &anyhow::Error) -> VirtchnlStatus {
    err.downcast_ref::<Rejected>()
        .map_or(VirtchnlStatus::ERR_EINVAL, |r| r.status)
}

fn read_header<T: FromBytes>(data: &[u8]) -> anyhow::Result<(T, &[u8])> {
    split_header::<T>(data).with_context(|| {
        format!(
            "request too short: {} < {}",
            data.len(),
            size_of::<T>()
        )
    })
}

fn read_list<T: FromBytes>(data: &[u8], count: usize) -> anyhow::Result<Vec<T>> {
    read_entries(data, count).with_context(|| format!("request truncated at {count} entries"))
}

/// A request as the control plane received it.
#[derive(Debug, Clone)]
pub struct Request {
    pub op: VirtchnlOp,
    pub data: Vec<u8>,
}

struct VportState {
    info: CreateVport,
    chunks: Vec<QueueRegChunk>,
    enabled: bool,
    rss_key: Vec<u8>,
    rss_lut: Vec<u32>,
    rss_hash: u64,
}

impl VportState {
    fn owns(&self, queue_type: QueueType, queue_id: u32) -> bool {
        self.chunks.iter().any(|c| {
            c.queue_type == queue_type
                && (c.start_queue_id..c.start_queue_id + c.num_queues).contains(&queue_id)
        })
    }

    fn queue_count(&self, queue_type: QueueType) -> u32 {
        self.chunks
            .iter()
            .filter(|c| c.queue_type == queue_type)
            .map(|c| c.num_queues)
            .sum()
    }
}

fn queue_base(vport_id: u32, queue_type: QueueType) -> u32 {
    let slot = match queue_type {
        QueueType::TX => 0,
        QueueType::TX_COMPLETION => 1,
        QueueType::RX => 2,
        _ => 3,
    };
    vport_id * QUEUE_ID_BLOCK + slot * QUEUE_ID_TYPE_SPAN
}

/// The tail doorbell offset of a queue.
pub fn queue_tail(queue_id: u32) -> u64 {
    regs::DEFAULT_QTAIL_BASE + queue_id as u64 * regs::DEFAULT_QTAIL_SPACING as u64
}

/// The queue a tail doorbell offset belongs to.
pub fn tail_queue(offset: u64) -> Option<u32> {
    let rel = offset.checked_sub(regs::DEFAULT_QTAIL_BASE)?;
    if rel % regs::DEFAULT_QTAIL_SPACING as u64 != 0 {
        return None;
    }
    u32::try_from(rel / regs::DEFAULT_QTAIL_SPACING as u64).ok()
}

/// The dynamic control register offset of a vector.
pub fn vector_dyn_ctl(vector_id: u16) -> u32 {
    regs::DEFAULT_DYN_CTL_BASE + vector_id as u32 * regs::DEFAULT_DYN_CTL_SPACING
}

fn reg_chunk(vport_id: u32, queue_type: QueueType, start: u32, count: u16) -> QueueRegChunk {
    let start_queue_id = queue_base(vport_id, queue_type) + start;
    QueueRegChunk {
        queue_type,
        start_queue_id,
        num_queues: count.into(),
        pad: 0,
        qtail_reg_start: queue_tail(start_queue_id),
        qtail_reg_spacing: regs::DEFAULT_QTAIL_SPACING,
        pad1: 0,
    }
}

pub struct ControlPlane {
    version: VersionInfo,
    caps: GetCapabilities,
    vports: Slab<VportState>,
    /// Allocation state of each vector id. Vector 0 belongs to the mailbox.
    vectors: Vec<bool>,
    failures: Vec<(VirtchnlOp, VirtchnlStatus)>,
    requests: Vec<Request>,
    resets: u64,
    pub loopback: Loopback,
}

impl ControlPlane {
    pub fn new() -> Self {
        let mut caps = GetCapabilities::new_zeroed();
        caps.csum_caps = !0;
        caps.seg_caps = virtchnl2::CAP_SEG_IPV4_TCP
            | virtchnl2::CAP_SEG_IPV4_UDP
            | virtchnl2::CAP_SEG_IPV6_TCP
            | virtchnl2::CAP_SEG_IPV6_UDP;
        caps.hsplit_caps = virtchnl2::CAP_RX_HSPLIT_AT_L4V4 | virtchnl2::CAP_RX_HSPLIT_AT_L4V6;
        caps.rsc_caps = virtchnl2::CAP_RSC_IPV4_TCP | virtchnl2::CAP_RSC_IPV6_TCP;
        caps.rss_caps = virtchnl2::RSS_HASH_DEFAULT;
        caps.other_caps = virtchnl2::CAP_WB_ON_ITR
            | virtchnl2::CAP_LINK_SPEED
            | virtchnl2::CAP_SPLITQ_QSCHED;
        caps.mailbox_dyn_ctl = regs::MBX_DYN_CTL as u32;
        caps.num_allocated_vectors = 16;
        caps.max_rx_q = QUEUE_ID_TYPE_SPAN as u16;
        caps.max_tx_q = QUEUE_ID_TYPE_SPAN as u16;
        caps.max_rx_bufq = QUEUE_ID_TYPE_SPAN as u16;
        caps.max_tx_complq = QUEUE_ID_TYPE_SPAN as u16;
        caps.max_vports = 4;
        caps.default_num_vports = 1;
        caps.max_sg_bufs_per_tx_pkt = 10;
        Self {
            version: VersionInfo {
                major: virtchnl2::VIRTCHNL2_VERSION_MAJOR,
                minor: virtchnl2::VIRTCHNL2_VERSION_MINOR,
            },
            vectors: vec![false; caps.num_allocated_vectors.into()],
            caps,
            vports: Slab::new(),
            failures: Vec::new(),
            requests: Vec::new(),
            resets: 0,
            loopback: Loopback::default(),
        }
    }

    pub fn set_version(&mut self, major: u32, minor: u32) {
        self.version = VersionInfo { major, minor };
    }

    /// The capabilities and limits the control plane offers. A new vector
    /// count takes effect at the next reset.
    pub fn caps_mut(&mut self) -> &mut GetCapabilities {
        &mut self.caps
    }

    /// Fails the next request for `op` with `status`.
    pub fn fail_next(&mut self, op: VirtchnlOp, status: VirtchnlStatus) {
        self.failures.push((op, status));
    }

    pub fn requests(&self) -> &[Request] {
        &self.requests
    }

    pub fn vport_count(&self) -> usize {
        self.vports.len()
    }

    /// Vectors currently allocated to the driver, not counting the mailbox.
    pub fn allocated_vectors(&self) -> usize {
        self.vectors.iter().skip(1).filter(|&&v| v).count()
    }

    pub fn resets(&self) -> u64 {
        self.resets
    }

    /// The stored RSS lookup table of a vport.
    pub fn rss_lut(&self, vport_id: u32) -> Option<&[u32]> {
        self.vports
            .get(vport_id as usize)
            .map(|v| v.rss_lut.as_slice())
    }

    /// Returns true if vport `vport_id` exists and is enabled.
    pub fn vport_enabled(&self, vport_id: u32) -> bool {
        self.vports
            .get(vport_id as usize)
            .is_some_and(|v| v.enabled)
    }

    /// Drops every vport and vector, as a function level reset does.
    pub fn reset(&mut self) {
        self.resets += 1;
        self.vports.clear();
        self.vectors = vec![false; self.caps.num_allocated_vectors.into()];
        self.loopback = Loopback::default();
    }

    /// Handles one request. Returns the reply, if the request has one.
    pub fn handle(&mut self, op: VirtchnlOp, data: &[u8]) -> Option<Message> {
        self.requests.push(Request {
            op,
            data: data.to_vec(),
        });
        if let Some(i) = self.failures.iter().position(|&(o, _)| o == op) {
            let (_, status) = self.failures.remove(i);
            tracing::debug!(?op, ?status, "injected failure");
            return Some(Message {
                op,
                status,
                data: Vec::new(),
            });
        }
        if op == VirtchnlOp::RESET_VF {
            tracing::info!("function reset requested");
            self.reset();
            return None;
        }
        let (status, data) = match self.handle_req(op, data) {
            Ok(reply) => (VirtchnlStatus::SUCCESS, reply),
            Err(err) => {
                let status = error_status(&err);
                tracing::warn!(
                    ?op,
                    ?status,
                    error = err.as_ref() as &dyn std::error::Error,
                    "request failed"
                );
                (status, Vec::new())
            }
        };
        Some(Message { op, status, data })
    }

    fn vport(&self, vport_id: u32) -> anyhow::Result<&VportState> {
        self.vports
            .get(vport_id as usize)
            .ok_or_else(|| reject(VirtchnlStatus::ERR_ENXIO, format!("no vport {vport_id}")))
    }

    fn vport_mut(&mut self, vport_id: u32) -> anyhow::Result<&mut VportState> {
        self.vports
            .get_mut(vport_id as usize)
            .ok_or_else(|| reject(VirtchnlStatus::ERR_ENXIO, format!("no vport {vport_id}")))
    }

    fn handle_req(&mut self, op: VirtchnlOp, data: &[u8]) -> anyhow::Result<Vec<u8>> {
        tracing::debug!(?op, len = data.len(), "virtchnl request");
        let reply = match op {
            VirtchnlOp::VERSION => {
                let (req, _) = read_header::<VersionInfo>(data)?;
                tracing::debug!(major = req.major, minor = req.minor, "driver version");
                self.version.as_bytes().to_vec()
            }
            VirtchnlOp::GET_CAPS => {
                let (req, _) = read_header::<GetCapabilities>(data)?;
                let mut caps = self.caps;
                caps.csum_caps &= req.csum_caps;
                caps.seg_caps &= req.seg_caps;
                caps.hsplit_caps &= req.hsplit_caps;
                caps.rsc_caps &= req.rsc_caps;
                caps.rss_caps &= req.rss_caps;
                caps.other_caps &= req.other_caps;
                caps.as_bytes().to_vec()
            }
            VirtchnlOp::CREATE_VPORT => {
                let (req, _) = read_header::<CreateVport>(data)?;
                self.create_vport(req)?
            }
            VirtchnlOp::DESTROY_VPORT => {
                let (req, _) = read_header::<VportId>(data)?;
                self.vports
                    .try_remove(req.vport_id as usize)
                    .ok_or_else(|| reject(VirtchnlStatus::ERR_ENXIO, "no such vport"))?;
                self.loopback.remove_vport(req.vport_id);
                Vec::new()
            }
            VirtchnlOp::ENABLE_VPORT | VirtchnlOp::DISABLE_VPORT => {
                let (req, _) = read_header::<VportId>(data)?;
                let enable = op == VirtchnlOp::ENABLE_VPORT;
                self.vport_mut(req.vport_id)?.enabled = enable;
                self.loopback.set_vport_enabled(req.vport_id, enable);
                Vec::new()
            }
            VirtchnlOp::CONFIG_TX_QUEUES => {
                let (req, rest) = read_header::<ConfigTxQueues>(data)?;
                let queues: Vec<TxqInfo> = read_list(rest, req.num_qinfo.into())?;
                let vport = self.vport(req.vport_id)?;
                for q in &queues {
                    anyhow::ensure!(
                        vport.owns(q.queue_type, q.queue_id),
                        "queue {} ({:?}) not owned by vport {}",
                        q.queue_id,
                        q.queue_type,
                        req.vport_id
                    );
                    anyhow::ensure!(q.ring_len > 0, "queue {} has no ring", q.queue_id);
                }
                for q in &queues {
                    self.loopback.configure_tx(req.vport_id, q);
                }
                Vec::new()
            }
            VirtchnlOp::CONFIG_RX_QUEUES => {
                let (req, rest) = read_header::<ConfigRxQueues>(data)?;
                let queues: Vec<RxqInfo> = read_list(rest, req.num_qinfo.into())?;
                let vport = self.vport(req.vport_id)?;
                for q in &queues {
                    anyhow::ensure!(
                        vport.owns(q.queue_type, q.queue_id),
                        "queue {} ({:?}) not owned by vport {}",
                        q.queue_id,
                        q.queue_type,
                        req.vport_id
                    );
                    anyhow::ensure!(q.ring_len > 0, "queue {} has no ring", q.queue_id);
                    if q.queue_type == QueueType::RX && q.model == QueueModel::SPLIT {
                        anyhow::ensure!(
                            vport.owns(QueueType::RX_BUFFER, q.rx_bufq1_id.into()),
                            "queue {} names unknown buffer queue {}",
                            q.queue_id,
                            q.rx_bufq1_id
                        );
                    }
                }
                for q in &queues {
                    self.loopback.configure_rx(req.vport_id, q);
                }
                Vec::new()
            }
            VirtchnlOp::ENABLE_QUEUES | VirtchnlOp::DISABLE_QUEUES | VirtchnlOp::DEL_QUEUES => {
                let (req, rest) = read_header::<DelEnaDisQueues>(data)?;
                let chunks: Vec<QueueChunk> = read_list(rest, req.num_chunks.into())?;
                let vport = self.vport(req.vport_id)?;
                for chunk in &chunks {
                    for id in chunk.start_queue_id..chunk.start_queue_id + chunk.num_queues {
                        anyhow::ensure!(
                            vport.owns(chunk.queue_type, id),
                            "queue {id} not owned by vport {}",
                            req.vport_id
                        );
                    }
                }
                for chunk in &chunks {
                    for id in chunk.start_queue_id..chunk.start_queue_id + chunk.num_queues {
                        match op {
                            VirtchnlOp::ENABLE_QUEUES => {
                                if !self.loopback.set_enabled(id, true) {
                                    return Err(reject(
                                        VirtchnlStatus::ERR_EINVAL,
                                        format!("queue {id} is not configured"),
                                    ));
                                }
                            }
                            VirtchnlOp::DISABLE_QUEUES => {
                                self.loopback.set_enabled(id, false);
                            }
                            _ => self.loopback.remove_queue(id),
                        }
                    }
                }
                Vec::new()
            }
            VirtchnlOp::ADD_QUEUES => {
                let (req, _) = read_header::<AddQueues>(data)?;
                self.add_queues(req)?
            }
            VirtchnlOp::MAP_QUEUE_VECTOR | VirtchnlOp::UNMAP_QUEUE_VECTOR => {
                let (req, rest) = read_header::<QueueVectorMaps>(data)?;
                let maps: Vec<QueueVector> = read_list(rest, req.num_qv_maps.into())?;
                let vport = self.vport(req.vport_id)?;
                for map in &maps {
                    anyhow::ensure!(
                        vport.owns(map.queue_type, map.queue_id),
                        "queue {} not owned by vport {}",
                        map.queue_id,
                        req.vport_id
                    );
                    if op == VirtchnlOp::MAP_QUEUE_VECTOR {
                        anyhow::ensure!(
                            self.vectors
                                .get(map.vector_id as usize)
                                .copied()
                                .unwrap_or(false),
                            "vector {} is not allocated",
                            map.vector_id
                        );
                    }
                }
                for map in &maps {
                    let vector = (op == VirtchnlOp::MAP_QUEUE_VECTOR).then_some(map.vector_id);
                    self.loopback.map_vector(map.queue_id, vector);
                }
                Vec::new()
            }
            VirtchnlOp::ALLOC_VECTORS => {
                let (req, _) = read_header::<AllocVectors>(data)?;
                self.alloc_vectors(req.num_vectors)?
            }
            VirtchnlOp::DEALLOC_VECTORS => {
                let (req, rest) = read_header::<VectorChunks>(data)?;
                let chunks: Vec<VectorChunk> = read_list(rest, req.num_vchunks.into())?;
                for chunk in &chunks {
                    for id in chunk.start_vector_id..chunk.start_vector_id + chunk.num_vectors {
                        anyhow::ensure!(
                            id != 0 && self.vectors.get(id as usize).copied().unwrap_or(false),
                            "vector {id} is not allocated"
                        );
                    }
                }
                for chunk in &chunks {
                    for id in chunk.start_vector_id..chunk.start_vector_id + chunk.num_vectors {
                        self.vectors[id as usize] = false;
                    }
                }
                Vec::new()
            }
            VirtchnlOp::GET_RSS_KEY => {
                let (req, _) = read_header::<RssKey>(data)?;
                let key = &self.vport(req.vport_id)?.rss_key;
                let header = RssKey {
                    vport_id: req.vport_id,
                    key_len: key.len() as u16,
                    pad: [0; 2],
                };
                encode(&header, key.as_slice())
            }
            VirtchnlOp::SET_RSS_KEY => {
                let (req, rest) = read_header::<RssKey>(data)?;
                let key: Vec<u8> = read_list(rest, req.key_len.into())?;
                let vport = self.vport_mut(req.vport_id)?;
                anyhow::ensure!(
                    key.len() <= vport.info.rss_key_size.into(),
                    "rss key of {} bytes exceeds {}",
                    key.len(),
                    vport.info.rss_key_size
                );
                vport.rss_key = key.clone();
                self.loopback.set_rss_key(req.vport_id, key);
                Vec::new()
            }
            VirtchnlOp::GET_RSS_LUT => {
                let (req, _) = read_header::<RssLut>(data)?;
                let lut = &self.vport(req.vport_id)?.rss_lut;
                let header = RssLut {
                    vport_id: req.vport_id,
                    lut_entries_start: 0,
                    lut_entries: lut.len() as u16,
                    pad: [0; 4],
                };
                encode(&header, lut.as_slice())
            }
            VirtchnlOp::SET_RSS_LUT => {
                let (req, rest) = read_header::<RssLut>(data)?;
                let entries: Vec<u32> = read_list(rest, req.lut_entries.into())?;
                let vport = self.vport_mut(req.vport_id)?;
                let start = req.lut_entries_start as usize;
                let end = start + entries.len();
                if end > vport.rss_lut.len() {
                    return Err(reject(
                        VirtchnlStatus::ERR_ERANGE,
                        format!("lut entries {start}..{end} out of range"),
                    ));
                }
                let num_rxq = vport.queue_count(QueueType::RX);
                anyhow::ensure!(
                    entries.iter().all(|&q| q < num_rxq),
                    "lut names a queue beyond {num_rxq}"
                );
                vport.rss_lut[start..end].copy_from_slice(&entries);
                Vec::new()
            }
            VirtchnlOp::GET_RSS_HASH => {
                let (req, _) = read_header::<RssHash>(data)?;
                let hash = RssHash {
                    ptype_groups: self.vport(req.vport_id)?.rss_hash,
                    vport_id: req.vport_id,
                    pad: [0; 4],
                };
                hash.as_bytes().to_vec()
            }
            VirtchnlOp::SET_RSS_HASH => {
                let (req, _) = read_header::<RssHash>(data)?;
                let supported = self.caps.rss_caps;
                if req.ptype_groups & !supported != 0 {
                    return Err(reject(
                        VirtchnlStatus::ERR_EOPNOTSUPP,
                        format!("unsupported hash groups {:#x}", req.ptype_groups & !supported),
                    ));
                }
                self.vport_mut(req.vport_id)?.rss_hash = req.ptype_groups;
                Vec::new()
            }
            VirtchnlOp::GET_STATS => {
                let (req, _) = read_header::<VportStats>(data)?;
                self.vport(req.vport_id)?;
                let mut stats = self.loopback.vport_stats(req.vport_id);
                stats.vport_id = req.vport_id;
                stats.as_bytes().to_vec()
            }
            op => {
                return Err(reject(
                    VirtchnlStatus::ERR_EOPNOTSUPP,
                    format!("unsupported request {op:?}"),
                ));
            }
        };
        Ok(reply)
    }

    fn create_vport(&mut self, req: CreateVport) -> anyhow::Result<Vec<u8>> {
        if self.vports.len() >= self.caps.max_vports.into() {
            return Err(reject(VirtchnlStatus::ERR_ENOSPC, "out of vports"));
        }
        for model in [req.txq_model, req.rxq_model] {
            anyhow::ensure!(
                model == QueueModel::SINGLE || model == QueueModel::SPLIT,
                "unknown queue model {model:?}"
            );
        }
        let tx_split = req.txq_model == QueueModel::SPLIT;
        let rx_split = req.rxq_model == QueueModel::SPLIT;
        anyhow::ensure!(req.num_tx_q > 0 && req.num_rx_q > 0, "vport without queues");
        anyhow::ensure!(!tx_split || req.num_tx_complq > 0, "split tx without completion queues");
        anyhow::ensure!(!rx_split || req.num_rx_bufq > 0, "split rx without buffer queues");
        let limits = [
            (req.num_tx_q, self.caps.max_tx_q),
            (req.num_tx_complq, self.caps.max_tx_complq),
            (req.num_rx_q, self.caps.max_rx_q),
            (req.num_rx_bufq, self.caps.max_rx_bufq),
        ];
        for (want, max) in limits {
            if want > max || want as u32 > QUEUE_ID_TYPE_SPAN {
                return Err(reject(
                    VirtchnlStatus::ERR_ENOSPC,
                    format!("{want} queues requested, limit {max}"),
                ));
            }
        }

        let entry = self.vports.vacant_entry();
        let vport_id = entry.key() as u32;
        let mut chunks = vec![
            reg_chunk(vport_id, QueueType::TX, 0, req.num_tx_q),
            reg_chunk(vport_id, QueueType::RX, 0, req.num_rx_q),
        ];
        if tx_split {
            chunks.push(reg_chunk(vport_id, QueueType::TX_COMPLETION, 0, req.num_tx_complq));
        }
        if rx_split {
            chunks.push(reg_chunk(vport_id, QueueType::RX_BUFFER, 0, req.num_rx_bufq));
        }

        let mut info = req;
        info.vport_id = vport_id;
        info.default_mac_addr = [0x02, 0x00, 0x5e, 0x10, 0x00, vport_id as u8];
        info.rss_key_size = RSS_KEY_SIZE;
        info.rss_lut_size = RSS_LUT_SIZE;
        if info.tx_desc_ids & virtchnl2::TXDID_FLEX_FLOW_SCHED_M != 0
            && self.caps.other_caps & virtchnl2::CAP_SPLITQ_QSCHED == 0
        {
            info.tx_desc_ids = virtchnl2::TXDID_FLEX_DATA_M;
        }
        if !tx_split {
            info.num_tx_complq = 0;
        }
        if !rx_split {
            info.num_rx_bufq = 0;
        }
        info.num_chunks = chunks.len() as u16;
        tracing::info!(
            vport_id,
            num_tx_q = info.num_tx_q,
            num_rx_q = info.num_rx_q,
            "created vport"
        );
        let reply = encode(&info, &chunks);
        entry.insert(VportState {
            info,
            chunks,
            enabled: false,
            rss_key: vec![0; RSS_KEY_SIZE.into()],
            rss_lut: (0..RSS_LUT_SIZE as u32)
                .map(|i| i % req.num_rx_q as u32)
                .collect(),
            rss_hash: virtchnl2::RSS_HASH_DEFAULT & self.caps.rss_caps,
        });
        self.loopback.add_vport(vport_id);
        Ok(reply)
    }

    fn add_queues(&mut self, req: AddQueues) -> anyhow::Result<Vec<u8>> {
        let vport_id = req.vport_id;
        let vport = self.vport_mut(vport_id)?;
        let mut chunks = Vec::new();
        for (ty, count) in [
            (QueueType::TX, req.num_tx_q),
            (QueueType::TX_COMPLETION, req.num_tx_complq),
            (QueueType::RX, req.num_rx_q),
            (QueueType::RX_BUFFER, req.num_rx_bufq),
        ] {
            if count == 0 {
                continue;
            }
            let have = vport.queue_count(ty);
            if have + count as u32 > QUEUE_ID_TYPE_SPAN {
                return Err(reject(
                    VirtchnlStatus::ERR_ENOSPC,
                    format!("cannot add {count} {ty:?} queues to {have}"),
                ));
            }
            chunks.push(reg_chunk(vport_id, ty, have, count));
        }
        vport.chunks.extend_from_slice(&chunks);
        vport.info.num_tx_q += req.num_tx_q;
        vport.info.num_tx_complq += req.num_tx_complq;
        vport.info.num_rx_q += req.num_rx_q;
        vport.info.num_rx_bufq += req.num_rx_bufq;
        let mut reply = req;
        reply.num_chunks = chunks.len() as u16;
        Ok(encode(&reply, &chunks))
    }

    fn alloc_vectors(&mut self, count: u16) -> anyhow::Result<Vec<u8>> {
        anyhow::ensure!(count > 0, "zero vectors requested");
        let count = count as usize;
        let start = (1..self.vectors.len())
            .find(|&start| {
                self.vectors
                    .get(start..start + count)
                    .is_some_and(|run| run.iter().all(|&used| !used))
            })
            .ok_or_else(|| {
                reject(
                    VirtchnlStatus::ERR_ENOSPC,
                    format!("no run of {count} free vectors"),
                )
            })?;
        self.vectors[start..start + count].fill(true);
        let start = start as u16;
        let chunk = VectorChunk {
            start_vector_id: start,
            start_evv_id: start,
            num_vectors: count as u16,
            pad1: 0,
            dynctl_reg_start: vector_dyn_ctl(start),
            dynctl_reg_spacing: regs::DEFAULT_DYN_CTL_SPACING,
            itrn_reg_start: 0,
            itrn_reg_spacing: 0,
            reserved: [0; 8],
        };
        let mut reply = AllocVectors::new_zeroed();
        reply.num_vectors = count as u16;
        reply.num_vchunks = 1;
        Ok(encode(&reply, &[chunk]))
    }
}

impl Default for ControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::ControlPlane;
    use super::tail_queue;
    use iecm_defs::virtchnl2::AllocVectors;
    use iecm_defs::virtchnl2::CreateVport;
    use iecm_defs::virtchnl2::QueueModel;
    use iecm_defs::virtchnl2::QueueRegChunk;
    use iecm_defs::virtchnl2::RssLut;
    use iecm_defs::virtchnl2::VectorChunk;
    use iecm_defs::virtchnl2::VirtchnlOp;
    use iecm_defs::virtchnl2::VirtchnlStatus;
    use iecm_defs::virtchnl2::encode;
    use iecm_defs::virtchnl2::read_entries;
    use iecm_defs::virtchnl2::split_header;
    use zerocopy::FromZeros;
    use zerocopy::IntoBytes;

    fn create(cp: &mut ControlPlane, txq: u16, rxq: u16) -> (CreateVport, Vec<QueueRegChunk>) {
        let mut req = CreateVport::new_zeroed();
        req.txq_model = QueueModel::SPLIT;
        req.rxq_model = QueueModel::SPLIT;
        req.num_tx_q = txq;
        req.num_tx_complq = 1;
        req.num_rx_q = rxq;
        req.num_rx_bufq = 2;
        let reply = cp.handle(VirtchnlOp::CREATE_VPORT, req.as_bytes()).unwrap();
        assert_eq!(reply.status, VirtchnlStatus::SUCCESS);
        let (vport, rest) = split_header::<CreateVport>(&reply.data).unwrap();
        let chunks = read_entries(rest, vport.num_chunks.into()).unwrap();
        (vport, chunks)
    }

    #[test]
    fn vports_get_disjoint_queue_ids() {
        let mut cp = ControlPlane::new();
        let (a, a_chunks) = create(&mut cp, 4, 4);
        let (b, b_chunks) = create(&mut cp, 4, 4);
        assert_ne!(a.vport_id, b.vport_id);
        assert_eq!(a_chunks.len(), 4);
        for ca in &a_chunks {
            for cb in &b_chunks {
                let a_range = ca.start_queue_id..ca.start_queue_id + ca.num_queues;
                assert!(!a_range.contains(&cb.start_queue_id));
            }
            assert_eq!(tail_queue(ca.qtail_reg_start), Some(ca.start_queue_id));
        }
        assert_eq!(cp.vport_count(), 2);
    }

    #[test]
    fn vector_exhaustion_and_release() {
        let mut cp = ControlPlane::new();
        let mut req = AllocVectors::new_zeroed();
        req.num_vectors = 15;
        let reply = cp.handle(VirtchnlOp::ALLOC_VECTORS, req.as_bytes()).unwrap();
        assert_eq!(reply.status, VirtchnlStatus::SUCCESS);
        let (alloc, rest) = split_header::<AllocVectors>(&reply.data).unwrap();
        let chunks: Vec<VectorChunk> = read_entries(rest, alloc.num_vchunks.into()).unwrap();
        assert_eq!(chunks[0].start_vector_id, 1);
        assert_eq!(cp.allocated_vectors(), 15);

        req.num_vectors = 1;
        let reply = cp.handle(VirtchnlOp::ALLOC_VECTORS, req.as_bytes()).unwrap();
        assert_eq!(reply.status, VirtchnlStatus::ERR_ENOSPC);

        let header = iecm_defs::virtchnl2::VectorChunks {
            num_vchunks: 1,
            pad: [0; 14],
        };
        let reply = cp
            .handle(VirtchnlOp::DEALLOC_VECTORS, &encode(&header, &chunks))
            .unwrap();
        assert_eq!(reply.status, VirtchnlStatus::SUCCESS);
        assert_eq!(cp.allocated_vectors(), 0);
    }

    #[test]
    fn lut_outside_table_is_out_of_range() {
        let mut cp = ControlPlane::new();
        let (vport, _) = create(&mut cp, 2, 2);
        let header = RssLut {
            vport_id: vport.vport_id,
            lut_entries_start: 62,
            lut_entries: 4,
            pad: [0; 4],
        };
        let reply = cp
            .handle(VirtchnlOp::SET_RSS_LUT, &encode(&header, &[0u32, 1, 0, 1]))
            .unwrap();
        assert_eq!(reply.status, VirtchnlStatus::ERR_ERANGE);
        assert_eq!(cp.rss_lut(vport.vport_id).unwrap().len(), 64);
    }

    #[test]
    fn injected_failure_applies_once() {
        let mut cp = ControlPlane::new();
        cp.fail_next(VirtchnlOp::VERSION, VirtchnlStatus::ERR_EBUSY);
        let req = iecm_defs::virtchnl2::VersionInfo { major: 2, minor: 0 };
        let reply = cp.handle(VirtchnlOp::VERSION, req.as_bytes()).unwrap();
        assert_eq!(reply.status, VirtchnlStatus::ERR_EBUSY);
        let reply = cp.handle(VirtchnlOp::VERSION, req.as_bytes()).unwrap();
        assert_eq!(reply.status, VirtchnlStatus::SUCCESS);
        assert!(cp.handle(VirtchnlOp::RESET_VF, &[]).is_none());
        assert_eq!(cp.requests().len(), 3);
    }
}
