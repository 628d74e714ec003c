// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error types.

use iecm_defs::virtchnl2::VirtchnlOp;
use iecm_defs::virtchnl2::VirtchnlStatus;
use thiserror::Error;

/// An error allocating or sizing a descriptor ring.
#[derive(Debug, Error)]
pub enum RingError {
    #[error("out of memory allocating a {count} entry ring")]
    OutOfMemory {
        count: u16,
        #[source]
        err: anyhow::Error,
    },
    #[error("invalid descriptor count {0}, must be a multiple of 32 in [64, 8160]")]
    InvalidCount(u32),
}

/// Layer 4 protocols named in offload requests.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum L4Proto {
    Tcp,
    Udp,
    Sctp,
    /// Any other IP protocol number.
    Other(u8),
}

/// An error transmitting a packet.
#[derive(Debug, Error)]
pub enum TxError {
    /// The ring does not have room for the packet. The queue has been
    /// stopped; retry once it restarts.
    #[error("transmit ring busy")]
    Busy,
    /// The flow scheduling free stack is empty. This means a buffer record
    /// leaked.
    #[error("out of transmit buffer records")]
    OutOfBuffers,
    #[error("segmentation offload is not supported for {0:?}")]
    UnsupportedOffload(L4Proto),
    #[error("failed to map packet memory for dma")]
    DmaMap(#[source] anyhow::Error),
    #[error("malformed packet: {0}")]
    Malformed(&'static str),
}

impl TxError {
    /// Returns true if the caller should retry the same packet later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TxError::Busy)
    }
}

/// An error replenishing receive buffers.
#[derive(Debug, Error)]
pub enum RxError {
    #[error("allocated {posted} of {requested} receive buffers")]
    RefillIncomplete {
        requested: u16,
        posted: u16,
        #[source]
        err: anyhow::Error,
    },
}

impl RxError {
    /// Receive errors are always transient.
    pub fn is_retryable(&self) -> bool {
        true
    }
}

/// An error on the control plane mailbox.
#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("timed out waiting for a reply to {0:?}")]
    Timeout(VirtchnlOp),
    #[error("{op:?} failed with status {status:?}")]
    Status {
        op: VirtchnlOp,
        status: VirtchnlStatus,
    },
    #[error("mailbox send queue is full")]
    RingFull,
    #[error("message of {len} bytes exceeds the {max} byte mailbox buffer")]
    MessageTooLarge { len: usize, max: usize },
    #[error("invalid mailbox configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("reply to {op:?} is {len} bytes, expected at least {expected}")]
    Truncated {
        op: VirtchnlOp,
        len: usize,
        expected: usize,
    },
    #[error("failed to allocate mailbox memory")]
    Dma(#[source] anyhow::Error),
    #[error("mailbox queue setup failed")]
    Ring(#[source] RingError),
}

impl MailboxError {
    /// Returns true if the failed request may succeed when retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MailboxError::Timeout(_) | MailboxError::RingFull)
    }
}

/// An error negotiating with the control plane.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("control plane speaks virtchnl {major}.{minor}")]
    VersionMismatch { major: u32, minor: u32 },
    #[error("negotiation failed after {attempts} attempts, last in state {state}")]
    RetriesExhausted { state: &'static str, attempts: u32 },
    #[error("mailbox failure")]
    Mailbox(#[from] MailboxError),
}
