// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The initialization handshake with the control plane.
//!
//! Each state sends one request and then polls for its reply on later steps,
//! so the owner can drive the machine from a timer without blocking.

use crate::config::IecmConfig;
use crate::config::QueueConfig;
use crate::config::QueueModel;
use crate::ctlq::CtlqMsg;
use crate::error::MailboxError;
use crate::error::NegotiationError;
use crate::virtchnl::VirtchnlChannel;
use iecm_defs::virtchnl2;
use iecm_defs::virtchnl2::CreateVport;
use iecm_defs::virtchnl2::GetCapabilities;
use iecm_defs::virtchnl2::QueueRegChunk;
use iecm_defs::virtchnl2::VersionInfo;
use iecm_defs::virtchnl2::VirtchnlOp;
use iecm_defs::virtchnl2::VirtchnlStatus;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NegotiationState {
    Startup,
    VersionCheck,
    GetCaps,
    GetDefaultVportParams,
    InitSw,
}

impl NegotiationState {
    pub fn name(self) -> &'static str {
        match self {
            NegotiationState::Startup => "startup",
            NegotiationState::VersionCheck => "version_check",
            NegotiationState::GetCaps => "get_caps",
            NegotiationState::GetDefaultVportParams => "get_default_vport_params",
            NegotiationState::InitSw => "init_sw",
        }
    }

    /// The request whose reply this state waits for.
    fn op(self) -> Option<VirtchnlOp> {
        match self {
            NegotiationState::VersionCheck => Some(VirtchnlOp::VERSION),
            NegotiationState::GetCaps => Some(VirtchnlOp::GET_CAPS),
            NegotiationState::GetDefaultVportParams => Some(VirtchnlOp::CREATE_VPORT),
            NegotiationState::Startup | NegotiationState::InitSw => None,
        }
    }
}

/// The outcome of one step.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Step {
    /// Call again after the step delay.
    Pending,
    /// Negotiation is complete.
    Done,
}

/// What the control plane agreed to.
#[derive(Debug, Clone)]
pub struct Negotiated {
    pub version: VersionInfo,
    pub caps: GetCapabilities,
    pub vport: CreateVport,
    pub chunks: Vec<QueueRegChunk>,
}

/// The capabilities requested for a queue configuration.
pub fn caps_request(queues: &QueueConfig) -> GetCapabilities {
    let mut caps = GetCapabilities::new_zeroed();
    if queues.tx_csum {
        caps.csum_caps |= virtchnl2::CAP_TX_CSUM_L3_IPV4
            | virtchnl2::CAP_TX_CSUM_L4_IPV4_TCP
            | virtchnl2::CAP_TX_CSUM_L4_IPV4_UDP
            | virtchnl2::CAP_TX_CSUM_L4_IPV4_SCTP
            | virtchnl2::CAP_TX_CSUM_L4_IPV6_TCP
            | virtchnl2::CAP_TX_CSUM_L4_IPV6_UDP
            | virtchnl2::CAP_TX_CSUM_L4_IPV6_SCTP;
    }
    if queues.rx_csum {
        caps.csum_caps |= virtchnl2::CAP_RX_CSUM_L3_IPV4
            | virtchnl2::CAP_RX_CSUM_L4_IPV4_TCP
            | virtchnl2::CAP_RX_CSUM_L4_IPV4_UDP
            | virtchnl2::CAP_RX_CSUM_L4_IPV4_SCTP
            | virtchnl2::CAP_RX_CSUM_L4_IPV6_TCP
            | virtchnl2::CAP_RX_CSUM_L4_IPV6_UDP
            | virtchnl2::CAP_RX_CSUM_L4_IPV6_SCTP;
    }
    if queues.tso {
        caps.seg_caps = virtchnl2::CAP_SEG_IPV4_TCP
            | virtchnl2::CAP_SEG_IPV4_UDP
            | virtchnl2::CAP_SEG_IPV6_TCP
            | virtchnl2::CAP_SEG_IPV6_UDP;
    }
    if queues.hsplit {
        caps.hsplit_caps = virtchnl2::CAP_RX_HSPLIT_AT_L4V4 | virtchnl2::CAP_RX_HSPLIT_AT_L4V6;
    }
    if queues.rsc {
        caps.rsc_caps = virtchnl2::CAP_RSC_IPV4_TCP | virtchnl2::CAP_RSC_IPV6_TCP;
    }
    if queues.rx_hash {
        caps.rss_caps = virtchnl2::RSS_HASH_DEFAULT;
    }
    caps.other_caps = virtchnl2::CAP_WB_ON_ITR | virtchnl2::CAP_LINK_SPEED;
    if queues.flow_sched {
        caps.other_caps |= virtchnl2::CAP_SPLITQ_QSCHED;
    }
    caps
}

/// The default vport requested for a queue configuration, limited by what
/// the control plane can provide.
pub fn vport_request(queues: &QueueConfig, caps: &GetCapabilities) -> CreateVport {
    let limit = |want: u16, max: u16| if max == 0 { want } else { want.min(max) };
    let tx_split = queues.tx_model == QueueModel::Split;
    let rx_split = queues.rx_model == QueueModel::Split;
    let flow = tx_split && queues.flow_sched && caps.other_caps & virtchnl2::CAP_SPLITQ_QSCHED != 0;

    let mut req = CreateVport::new_zeroed();
    req.vport_type = virtchnl2::VPORT_TYPE_DEFAULT;
    req.txq_model = queues.tx_model.into();
    req.rxq_model = queues.rx_model.into();
    req.num_tx_q = limit(queues.num_txq, caps.max_tx_q);
    req.num_rx_q = limit(queues.num_rxq, caps.max_rx_q);
    if tx_split {
        req.num_tx_complq = limit(queues.num_tx_groups(), caps.max_tx_complq);
    }
    if rx_split {
        req.num_rx_bufq = limit(
            queues.num_rx_groups() * queues.bufq_per_group,
            caps.max_rx_bufq,
        );
    }
    req.max_mtu = queues.max_mtu;
    req.rx_desc_ids = if rx_split {
        virtchnl2::RXDID_7_FLEX_SPLITQ_M
    } else {
        virtchnl2::RXDID_1_32B_BASE_M
    };
    req.tx_desc_ids = match (tx_split, flow) {
        (false, _) => virtchnl2::TXDID_DATA_M,
        (true, false) => virtchnl2::TXDID_FLEX_DATA_M,
        (true, true) => virtchnl2::TXDID_FLEX_FLOW_SCHED_M,
    };
    req
}

pub struct Negotiator {
    queues: QueueConfig,
    state: NegotiationState,
    state_retries: u32,
    total_retries: u32,
    /// Polls made in the current state.
    polls: u32,
    /// Times negotiation started over.
    restarts: u32,
    version: Option<VersionInfo>,
    caps: Option<GetCapabilities>,
    result: Option<Negotiated>,
}

impl Negotiator {
    pub fn new(config: &IecmConfig) -> Self {
        Self {
            queues: config.queues.clone(),
            state: NegotiationState::Startup,
            state_retries: config.mailbox.state_retries,
            total_retries: config.mailbox.total_retries,
            polls: 0,
            restarts: 0,
            version: None,
            caps: None,
            result: None,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    pub fn result(&self) -> Option<&Negotiated> {
        self.result.as_ref()
    }

    /// Returns to `Startup` and forgets everything negotiated so far.
    pub fn reset(&mut self) {
        self.state = NegotiationState::Startup;
        self.polls = 0;
        self.restarts = 0;
        self.version = None;
        self.caps = None;
        self.result = None;
    }

    fn enter(&mut self, state: NegotiationState) {
        tracing::debug!(from = self.state.name(), to = state.name(), "negotiation state");
        self.state = state;
        self.polls = 0;
    }

    /// Starts over from `Startup`, failing once the restart budget is spent.
    fn restart(&mut self, channel: &VirtchnlChannel) -> Result<Step, NegotiationError> {
        let state = self.state.name();
        self.restarts += 1;
        if self.restarts > self.total_retries {
            tracing::error!(state, attempts = self.restarts, "negotiation failed");
            return Err(NegotiationError::RetriesExhausted {
                state,
                attempts: self.restarts,
            });
        }
        channel.drop_stale();
        self.version = None;
        self.caps = None;
        self.enter(NegotiationState::Startup);
        Ok(Step::Pending)
    }

    /// Sends the request of `next` and moves there. Send failures that may
    /// clear up restart the handshake.
    fn send(
        &mut self,
        channel: &VirtchnlChannel,
        next: NegotiationState,
        data: &[u8],
    ) -> Result<Step, NegotiationError> {
        let Some(op) = next.op() else {
            self.enter(next);
            return Ok(Step::Pending);
        };
        match channel.send(op, data) {
            Ok(()) => {
                self.enter(next);
                Ok(Step::Pending)
            }
            Err(err) if err.is_retryable() => {
                tracing::warn!(
                    state = self.state.name(),
                    ?op,
                    error = &err as &dyn std::error::Error,
                    "negotiation send failed"
                );
                self.restart(channel)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Runs one step of the handshake.
    pub fn step(&mut self, channel: &VirtchnlChannel) -> Result<Step, NegotiationError> {
        let Some(op) = self.state.op() else {
            return match self.state {
                NegotiationState::Startup => {
                    let req = VersionInfo {
                        major: virtchnl2::VIRTCHNL2_VERSION_MAJOR,
                        minor: virtchnl2::VIRTCHNL2_VERSION_MINOR,
                    };
                    self.send(channel, NegotiationState::VersionCheck, req.as_bytes())
                }
                _ => Ok(Step::Done),
            };
        };

        let Some(msg) = channel.try_recv(op) else {
            self.polls += 1;
            if self.polls >= self.state_retries {
                tracing::warn!(state = self.state.name(), ?op, "no reply from control plane");
                return self.restart(channel);
            }
            return Ok(Step::Pending);
        };

        match self.handle_reply(op, msg) {
            Ok(Some((next, data))) => self.send(channel, next, &data),
            Ok(None) => Ok(Step::Done),
            Err(NegotiationError::Mailbox(err)) => {
                tracing::warn!(
                    state = self.state.name(),
                    ?op,
                    error = &err as &dyn std::error::Error,
                    "negotiation request failed"
                );
                self.restart(channel)
            }
            Err(err) => Err(err),
        }
    }

    /// Consumes the reply of the current state. Returns the next request to
    /// send, or `None` when the handshake is complete.
    fn handle_reply(
        &mut self,
        op: VirtchnlOp,
        msg: CtlqMsg,
    ) -> Result<Option<(NegotiationState, Vec<u8>)>, NegotiationError> {
        if msg.status != VirtchnlStatus::SUCCESS {
            return Err(MailboxError::Status {
                op,
                status: msg.status,
            }
            .into());
        }
        let truncated = |expected| MailboxError::Truncated {
            op,
            len: msg.data.len(),
            expected,
        };
        match self.state {
            NegotiationState::VersionCheck => {
                let (version, _) = virtchnl2::split_header::<VersionInfo>(&msg.data)
                    .ok_or_else(|| truncated(size_of::<VersionInfo>()))?;
                if version.major != virtchnl2::VIRTCHNL2_VERSION_MAJOR {
                    tracing::error!(
                        major = version.major,
                        minor = version.minor,
                        "unsupported virtchnl version"
                    );
                    return Err(NegotiationError::VersionMismatch {
                        major: version.major,
                        minor: version.minor,
                    });
                }
                tracing::info!(major = version.major, minor = version.minor, "virtchnl version");
                self.version = Some(version);
                let caps = caps_request(&self.queues);
                Ok(Some((NegotiationState::GetCaps, caps.as_bytes().to_vec())))
            }
            NegotiationState::GetCaps => {
                let (caps, _) = virtchnl2::split_header::<GetCapabilities>(&msg.data)
                    .ok_or_else(|| truncated(size_of::<GetCapabilities>()))?;
                tracing::debug!(
                    csum = caps.csum_caps,
                    seg = caps.seg_caps,
                    other = caps.other_caps,
                    vectors = caps.num_allocated_vectors,
                    "control plane capabilities"
                );
                let req = vport_request(&self.queues, &caps);
                self.caps = Some(caps);
                Ok(Some((
                    NegotiationState::GetDefaultVportParams,
                    req.as_bytes().to_vec(),
                )))
            }
            NegotiationState::GetDefaultVportParams => {
                let (vport, rest) = virtchnl2::split_header::<CreateVport>(&msg.data)
                    .ok_or_else(|| truncated(size_of::<CreateVport>()))?;
                let count = vport.num_chunks as usize;
                let chunks = virtchnl2::read_entries::<QueueRegChunk>(rest, count).ok_or_else(
                    || truncated(size_of::<CreateVport>() + count * size_of::<QueueRegChunk>()),
                )?;
                let (Some(version), Some(caps)) = (self.version, self.caps) else {
                    // Only reachable if the earlier replies were lost to a
                    // reset, so start over.
                    return Err(MailboxError::Timeout(op).into());
                };
                tracing::info!(
                    vport_id = vport.vport_id,
                    txqs = vport.num_tx_q,
                    rxqs = vport.num_rx_q,
                    "default vport created"
                );
                self.result = Some(Negotiated {
                    version,
                    caps,
                    vport,
                    chunks,
                });
                self.enter(NegotiationState::InitSw);
                Ok(None)
            }
            NegotiationState::Startup | NegotiationState::InitSw => Ok(None),
        }
    }

    /// Drives the handshake to completion, sleeping between steps.
    pub fn run_blocking(
        &mut self,
        channel: &VirtchnlChannel,
    ) -> Result<Negotiated, NegotiationError> {
        let delay = channel.config().step_delay;
        loop {
            match self.step(channel)? {
                Step::Done => break,
                Step::Pending => std::thread::sleep(delay),
            }
        }
        self.result.clone().ok_or(NegotiationError::RetriesExhausted {
            state: self.state.name(),
            attempts: self.restarts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::caps_request;
    use super::vport_request;
    use crate::config::QueueConfig;
    use crate::config::QueueModel;
    use iecm_defs::virtchnl2;
    use iecm_defs::virtchnl2::GetCapabilities;
    use zerocopy::FromZeros;

    #[test]
    fn flow_scheduling_needs_config_and_capability() {
        let mut queues = QueueConfig {
            num_txq: 8,
            num_rxq: 8,
            ..Default::default()
        };
        let mut caps = GetCapabilities::new_zeroed();
        caps.other_caps = virtchnl2::CAP_SPLITQ_QSCHED;

        let req = vport_request(&queues, &caps);
        assert_eq!(req.tx_desc_ids, virtchnl2::TXDID_FLEX_DATA_M);
        assert_eq!(req.num_tx_complq, 2);
        assert_eq!(req.num_rx_bufq, 4);

        queues.flow_sched = true;
        assert_eq!(
            caps_request(&queues).other_caps & virtchnl2::CAP_SPLITQ_QSCHED,
            virtchnl2::CAP_SPLITQ_QSCHED
        );
        let req = vport_request(&queues, &caps);
        assert_eq!(req.tx_desc_ids, virtchnl2::TXDID_FLEX_FLOW_SCHED_M);

        caps.other_caps = 0;
        let req = vport_request(&queues, &caps);
        assert_eq!(req.tx_desc_ids, virtchnl2::TXDID_FLEX_DATA_M);
    }

    #[test]
    fn vport_request_respects_limits() {
        let queues = QueueConfig {
            tx_model: QueueModel::Single,
            rx_model: QueueModel::Single,
            num_txq: 16,
            num_rxq: 16,
            ..Default::default()
        };
        let mut caps = GetCapabilities::new_zeroed();
        caps.max_tx_q = 4;
        caps.max_rx_q = 2;
        let req = vport_request(&queues, &caps);
        assert_eq!((req.num_tx_q, req.num_rx_q), (4, 2));
        assert_eq!((req.num_tx_complq, req.num_rx_bufq), (0, 0));
        assert_eq!(req.rx_desc_ids, virtchnl2::RXDID_1_32B_BASE_M);
        assert_eq!(req.tx_desc_ids, virtchnl2::TXDID_DATA_M);
    }
}
