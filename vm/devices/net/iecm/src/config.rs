// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Driver configuration.

use crate::error::RingError;
use std::time::Duration;

pub const MIN_DESC_COUNT: u32 = 64;
pub const MAX_DESC_COUNT: u32 = 8160;
pub const DESC_COUNT_MULTIPLE: u32 = 32;

/// Checks a ring size against the hardware limits.
pub fn validate_desc_count(count: u32) -> Result<u16, RingError> {
    if !(MIN_DESC_COUNT..=MAX_DESC_COUNT).contains(&count) || count % DESC_COUNT_MULTIPLE != 0 {
        return Err(RingError::InvalidCount(count));
    }
    Ok(count as u16)
}

/// How descriptors are posted and completed on a queue.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum QueueModel {
    /// One ring per queue, used for both posting and completion.
    Single,
    /// Separate completion (Tx) and buffer (Rx) rings.
    Split,
}

impl From<QueueModel> for iecm_defs::virtchnl2::QueueModel {
    fn from(model: QueueModel) -> Self {
        match model {
            QueueModel::Single => Self::SINGLE,
            QueueModel::Split => Self::SPLIT,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct IecmConfig {
    pub mailbox: MailboxConfig,
    pub queues: QueueConfig,
    pub itr: ItrConfig,
}

#[derive(Debug, Clone)]
pub struct MailboxConfig {
    /// Descriptors in each of the send and receive rings.
    pub ring_len: u16,
    /// Size of each receive buffer, which also bounds the size of a sent
    /// message.
    pub buf_size: u16,
    /// How long a request waits for its reply.
    pub timeout: Duration,
    /// Delay between steps of the negotiation state machine.
    pub step_delay: Duration,
    /// Polls for a reply in one negotiation state before starting over.
    pub state_retries: u32,
    /// Times negotiation may start over before the device is declared
    /// unusable.
    pub total_retries: u32,
    /// Completed sends reclaimed per send.
    pub clean_budget: u16,
    /// Caps the number of entries put in one chunked message, in addition to
    /// the limit imposed by `buf_size`.
    pub max_entries_per_msg: Option<usize>,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            ring_len: 64,
            buf_size: 4096,
            timeout: Duration::from_millis(2000),
            step_delay: Duration::from_millis(10),
            state_retries: 10,
            total_retries: 3,
            clean_budget: 16,
            max_entries_per_msg: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub tx_model: QueueModel,
    pub rx_model: QueueModel,
    pub num_txq: u16,
    pub num_rxq: u16,
    /// Tx queues sharing one completion queue in the split model.
    pub txq_per_group: u16,
    /// Rx queues sharing one set of buffer queues in the split model.
    pub rxq_per_group: u16,
    /// Buffer queues per Rx group, 1 or 2.
    pub bufq_per_group: u16,
    pub tx_desc_count: u32,
    pub tx_compl_desc_count: u32,
    pub rx_desc_count: u32,
    pub rx_bufq_desc_count: u32,
    /// Request flow based scheduling for split Tx queues. Only honored when
    /// the control plane grants the capability.
    pub flow_sched: bool,
    pub hsplit: bool,
    pub rx_csum: bool,
    pub rx_hash: bool,
    pub rsc: bool,
    pub tx_csum: bool,
    pub tso: bool,
    /// Size of the host pages backing receive buffers.
    pub rx_page_size: u32,
    pub max_mtu: u16,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            tx_model: QueueModel::Split,
            rx_model: QueueModel::Split,
            num_txq: 4,
            num_rxq: 4,
            txq_per_group: 4,
            rxq_per_group: 4,
            bufq_per_group: 2,
            tx_desc_count: 512,
            tx_compl_desc_count: 512,
            rx_desc_count: 512,
            rx_bufq_desc_count: 512,
            flow_sched: false,
            hsplit: false,
            rx_csum: true,
            rx_hash: true,
            rsc: false,
            tx_csum: true,
            tso: true,
            rx_page_size: 4096,
            max_mtu: 9000,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), RingError> {
        validate_desc_count(self.tx_desc_count)?;
        validate_desc_count(self.tx_compl_desc_count)?;
        validate_desc_count(self.rx_desc_count)?;
        validate_desc_count(self.rx_bufq_desc_count)?;
        Ok(())
    }

    pub fn num_tx_groups(&self) -> u16 {
        match self.tx_model {
            QueueModel::Single => self.num_txq,
            QueueModel::Split => self.num_txq.div_ceil(self.txq_per_group.max(1)),
        }
    }

    pub fn num_rx_groups(&self) -> u16 {
        match self.rx_model {
            QueueModel::Single => self.num_rxq,
            QueueModel::Split => self.num_rxq.div_ceil(self.rxq_per_group.max(1)),
        }
    }
}

/// Link speeds that select the ITR scaling divisor.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LinkSpeed {
    Speed100M,
    Speed1G,
    Speed10G,
    Speed20G,
    Speed25G,
    Speed40G,
    Speed100G,
}

impl LinkSpeed {
    pub fn from_mbps(mbps: u32) -> Self {
        match mbps {
            0..=100 => LinkSpeed::Speed100M,
            101..=1000 => LinkSpeed::Speed1G,
            1001..=10000 => LinkSpeed::Speed10G,
            10001..=20000 => LinkSpeed::Speed20G,
            20001..=25000 => LinkSpeed::Speed25G,
            25001..=40000 => LinkSpeed::Speed40G,
            _ => LinkSpeed::Speed100G,
        }
    }
}

/// One band of the average-wire-size to interval mapping: sizes up to
/// `max_size` map to `size * mul + add`.
#[derive(Debug, Copy, Clone)]
pub struct ItrBand {
    pub max_size: u32,
    pub mul: u32,
    pub add: u32,
}

/// Tuning of the adaptive interrupt moderation engine. The defaults are the
/// classic values for this device family.
#[derive(Debug, Clone)]
pub struct ItrConfig {
    pub adaptive_rx: bool,
    pub adaptive_tx: bool,
    /// Static Rx interval used when `adaptive_rx` is false, in usecs.
    pub rx_usecs: u16,
    /// Static Tx interval used when `adaptive_tx` is false, in usecs.
    pub tx_usecs: u16,
    pub min_inc: u16,
    pub min_usecs: u16,
    pub max_usecs: u16,
    /// Average wire sizes at or below this map to `small_value`.
    pub small_size: u32,
    pub small_value: u32,
    pub bands: [ItrBand; 3],
    pub large_value: u32,
    /// Polls after an update during which new samples are discarded.
    pub countdown_start: u8,
    /// Rx polls with fewer packets than this and fewer than
    /// `latency_bytes` bytes switch to latency mode.
    pub latency_packets: u32,
    pub latency_bytes: u64,
    /// Polls with more packets than this leave latency mode.
    pub bulk_packets: u32,
    /// Below this packet count the interval only creeps up.
    pub small_packets: u32,
    /// Up to this packet count the interval is left alone.
    pub goldilocks_packets: u32,
    /// Up to this packet count the interval is halved.
    pub halve_packets: u32,
    pub link_speed: LinkSpeed,
}

impl Default for ItrConfig {
    fn default() -> Self {
        Self {
            adaptive_rx: true,
            adaptive_tx: true,
            rx_usecs: 50,
            tx_usecs: 50,
            min_inc: 2,
            min_usecs: 2,
            max_usecs: 126,
            small_size: 60,
            small_value: 4096,
            bands: [
                ItrBand {
                    max_size: 380,
                    mul: 40,
                    add: 1696,
                },
                ItrBand {
                    max_size: 1084,
                    mul: 15,
                    add: 11452,
                },
                ItrBand {
                    max_size: 1980,
                    mul: 5,
                    add: 22420,
                },
            ],
            large_value: 32256,
            countdown_start: 3,
            latency_packets: 4,
            latency_bytes: 9000,
            bulk_packets: 32,
            small_packets: 56,
            goldilocks_packets: 112,
            halve_packets: 256,
            link_speed: LinkSpeed::Speed10G,
        }
    }
}

impl ItrConfig {
    /// The divisor applied to the banded size for the current link speed.
    pub fn divisor(&self) -> u32 {
        let scale = match self.link_speed {
            LinkSpeed::Speed40G | LinkSpeed::Speed100G => 1024,
            LinkSpeed::Speed20G | LinkSpeed::Speed25G => 512,
            LinkSpeed::Speed1G | LinkSpeed::Speed100M => 32,
            LinkSpeed::Speed10G => 256,
        };
        self.min_inc as u32 * scale
    }
}
