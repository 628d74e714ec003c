// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The virtchnl2 request/reply channel layered on the mailbox.
//!
//! Replies are matched to requests by opcode. Unsolicited events that arrive
//! while waiting are queued for the owner, and the loop keeps looking for the
//! reply. A request that needs a reply holds the channel lock from send until
//! its reply has been copied out, so two requesters cannot consume each
//! other's replies.

use crate::config::MailboxConfig;
use crate::ctlq::ControlQueue;
use crate::ctlq::CtlqKind;
use crate::ctlq::CtlqMsg;
use crate::error::MailboxError;
use iecm_defs::virtchnl2::AddQueues;
use iecm_defs::virtchnl2::AllocVectors;
use iecm_defs::virtchnl2::ConfigRxQueues;
use iecm_defs::virtchnl2::ConfigTxQueues;
use iecm_defs::virtchnl2::CreateVport;
use iecm_defs::virtchnl2::DelEnaDisQueues;
use iecm_defs::virtchnl2::Event;
use iecm_defs::virtchnl2::EventCode;
use iecm_defs::virtchnl2::GetCapabilities;
use iecm_defs::virtchnl2::QueueChunk;
use iecm_defs::virtchnl2::QueueRegChunk;
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
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use user_driver::DeviceRegisterIo;
use user_driver::DmaClient;
use user_driver::interrupt::DeviceInterrupt;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

/// A notification from the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    LinkChange {
        vport_id: u32,
        up: bool,
        speed_mbps: u32,
    },
    ResetImpending,
    Unknown(EventCode),
}

/// The number of `entry` sized entries that fit in one message after a
/// `header` sized header, optionally capped. Fails if a message cannot carry
/// a single entry.
pub fn entries_per_msg(
    buf_size: usize,
    header: usize,
    entry: usize,
    cap: Option<usize>,
) -> Result<usize, MailboxError> {
    let fit = buf_size.saturating_sub(header) / entry.max(1);
    if fit == 0 {
        return Err(MailboxError::MessageTooLarge {
            len: header + entry,
            max: buf_size,
        });
    }
    match cap {
        Some(0) => Err(MailboxError::InvalidConfig(
            "entries per message cap must be nonzero",
        )),
        Some(cap) => Ok(fit.min(cap)),
        None => Ok(fit),
    }
}

fn decode<T: FromBytes>(op: VirtchnlOp, data: &[u8]) -> Result<(T, &[u8]), MailboxError> {
    split_header::<T>(data).ok_or(MailboxError::Truncated {
        op,
        len: data.len(),
        expected: size_of::<T>(),
    })
}

fn decode_entries<T: FromBytes>(
    op: VirtchnlOp,
    data: &[u8],
    count: usize,
) -> Result<Vec<T>, MailboxError> {
    read_entries(data, count).ok_or(MailboxError::Truncated {
        op,
        len: data.len(),
        expected: count * size_of::<T>(),
    })
}

struct ChannelInner {
    send: ControlQueue,
    recv: ControlQueue,
    interrupt: DeviceInterrupt,
    events: VecDeque<DeviceEvent>,
    /// Replies that arrived while nobody was waiting for them.
    unclaimed: VecDeque<CtlqMsg>,
    stale_replies: u64,
}

impl ChannelInner {
    fn handle_event(&mut self, msg: &CtlqMsg) {
        let Ok((event, _)) = Event::read_from_prefix(&msg.data) else {
            tracing::warn!(len = msg.data.len(), "truncated control plane event");
            return;
        };
        let event = match event.event {
            EventCode::LINK_CHANGE => DeviceEvent::LinkChange {
                vport_id: event.vport_id,
                up: event.link_status != 0,
                speed_mbps: event.link_speed,
            },
            EventCode::RESET_IMPENDING => DeviceEvent::ResetImpending,
            code => DeviceEvent::Unknown(code),
        };
        tracing::debug!(?event, "control plane event");
        self.events.push_back(event);
    }

    /// Returns the reply for `op`, if it has arrived. Events and replies for
    /// other requests are consumed along the way.
    fn dispatch(&mut self, op: VirtchnlOp) -> Option<CtlqMsg> {
        if let Some(i) = self.unclaimed.iter().position(|msg| msg.op == op) {
            return self.unclaimed.remove(i);
        }
        while let Some(msg) = self.recv.receive() {
            if msg.op == VirtchnlOp::EVENT {
                self.handle_event(&msg);
                continue;
            }
            if msg.op == op {
                return Some(msg);
            }
            self.stale_replies += 1;
            tracing::debug!(expected = ?op, op = ?msg.op, "dropping stale mailbox reply");
        }
        None
    }

    fn wait(&mut self, op: VirtchnlOp, deadline: Instant) -> Result<CtlqMsg, MailboxError> {
        loop {
            if let Some(msg) = self.dispatch(op) {
                return Ok(msg);
            }
            if !self.interrupt.wait_until(deadline) {
                // The reply may have raced the deadline.
                return self.dispatch(op).ok_or(MailboxError::Timeout(op));
            }
        }
    }
}

/// The virtchnl2 channel to the control plane.
pub struct VirtchnlChannel {
    inner: Mutex<ChannelInner>,
    config: MailboxConfig,
}

impl VirtchnlChannel {
    /// Creates and enables both mailbox rings. `interrupt` is signaled when
    /// the control plane posts to the receive ring.
    pub fn new(
        dma: &dyn DmaClient,
        regs: Arc<dyn DeviceRegisterIo>,
        interrupt: DeviceInterrupt,
        config: MailboxConfig,
    ) -> Result<Self, MailboxError> {
        let send = ControlQueue::new(
            dma,
            regs.clone(),
            CtlqKind::Send,
            config.ring_len,
            config.buf_size,
        )?;
        let recv = ControlQueue::new(dma, regs, CtlqKind::Recv, config.ring_len, config.buf_size)?;
        Ok(Self {
            inner: Mutex::new(ChannelInner {
                send,
                recv,
                interrupt,
                events: VecDeque::new(),
                unclaimed: VecDeque::new(),
                stale_replies: 0,
            }),
            config,
        })
    }

    pub fn config(&self) -> &MailboxConfig {
        &self.config
    }

    /// Replies dropped because nobody was waiting for them.
    pub fn stale_replies(&self) -> u64 {
        self.inner.lock().stale_replies
    }

    /// Sends a message without waiting for its reply.
    pub fn send(&self, op: VirtchnlOp, data: &[u8]) -> Result<(), MailboxError> {
        self.inner
            .lock()
            .send
            .send(op, data, self.config.clean_budget)
    }

    /// Returns the reply to `op` if it has arrived, without waiting.
    pub fn try_recv(&self, op: VirtchnlOp) -> Option<CtlqMsg> {
        self.inner.lock().dispatch(op)
    }

    /// Waits up to the configured timeout for the reply to `op`.
    pub fn recv(&self, op: VirtchnlOp) -> Result<CtlqMsg, MailboxError> {
        let mut inner = self.inner.lock();
        let deadline = Instant::now() + self.config.timeout;
        inner.wait(op, deadline)
    }

    fn check(msg: CtlqMsg) -> Result<Vec<u8>, MailboxError> {
        if msg.status != VirtchnlStatus::SUCCESS {
            return Err(MailboxError::Status {
                op: msg.op,
                status: msg.status,
            });
        }
        Ok(msg.data)
    }

    /// Sends a request and waits for its reply, failing if the control plane
    /// reports an error.
    pub fn transact(&self, op: VirtchnlOp, data: &[u8]) -> Result<Vec<u8>, MailboxError> {
        let mut inner = self.inner.lock();
        let deadline = Instant::now() + self.config.timeout;
        inner.send.send(op, data, self.config.clean_budget)?;
        let msg = inner.wait(op, deadline)?;
        drop(inner);
        Self::check(msg)
    }

    fn transact_obj<Req: IntoBytes + Immutable, Resp: FromBytes>(
        &self,
        op: VirtchnlOp,
        req: &Req,
    ) -> Result<Resp, MailboxError> {
        let reply = self.transact(op, req.as_bytes())?;
        Ok(decode::<Resp>(op, &reply)?.0)
    }

    /// Sends `entries` in as many messages as needed, each one acknowledged
    /// before the next is sent. `header` builds the header of a chunk from
    /// the index of its first entry and its entries. Returns the number of
    /// messages sent.
    fn transact_chunked<H, T>(
        &self,
        op: VirtchnlOp,
        entries: &[T],
        header: impl Fn(usize, &[T]) -> H,
    ) -> Result<usize, MailboxError>
    where
        H: IntoBytes + Immutable,
        T: IntoBytes + Immutable,
    {
        let per_msg = entries_per_msg(
            self.config.buf_size as usize,
            size_of::<H>(),
            size_of::<T>(),
            self.config.max_entries_per_msg,
        )?;
        let mut msgs = 0;
        for (i, chunk) in entries.chunks(per_msg).enumerate() {
            self.transact(op, &encode(&header(i * per_msg, chunk), chunk))?;
            msgs += 1;
        }
        tracing::trace!(?op, entries = entries.len(), msgs, "chunked request done");
        Ok(msgs)
    }

    /// Queues any events waiting in the receive ring. Replies found there
    /// are kept for a later [`Self::try_recv`].
    pub fn poll_events(&self) {
        let mut inner = self.inner.lock();
        while let Some(msg) = inner.recv.receive() {
            if msg.op == VirtchnlOp::EVENT {
                inner.handle_event(&msg);
            } else {
                if inner.unclaimed.len() >= self.config.ring_len as usize {
                    inner.unclaimed.pop_front();
                    inner.stale_replies += 1;
                }
                inner.unclaimed.push_back(msg);
            }
        }
    }

    /// Takes the queued events.
    pub fn take_events(&self) -> Vec<DeviceEvent> {
        self.poll_events();
        self.inner.lock().events.drain(..).collect()
    }

    /// Drops every reply not yet claimed. Events are kept.
    pub fn drop_stale(&self) {
        self.poll_events();
        let mut inner = self.inner.lock();
        let n = inner.unclaimed.len() as u64;
        inner.unclaimed.clear();
        inner.stale_replies += n;
    }

    /// Disables both rings.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.send.shutdown();
        inner.recv.shutdown();
    }

    #[tracing::instrument(level = "debug", skip(self), err)]
    pub fn version(&self, major: u32, minor: u32) -> Result<VersionInfo, MailboxError> {
        self.transact_obj(VirtchnlOp::VERSION, &VersionInfo { major, minor })
    }

    #[tracing::instrument(level = "debug", skip_all, err)]
    pub fn get_caps(&self, caps: &GetCapabilities) -> Result<GetCapabilities, MailboxError> {
        self.transact_obj(VirtchnlOp::GET_CAPS, caps)
    }

    /// Creates a vport. Returns the reply and the register chunks of the
    /// queues it was given.
    #[tracing::instrument(level = "debug", skip_all, err)]
    pub fn create_vport(
        &self,
        req: &CreateVport,
    ) -> Result<(CreateVport, Vec<QueueRegChunk>), MailboxError> {
        let op = VirtchnlOp::CREATE_VPORT;
        let reply = self.transact(op, req.as_bytes())?;
        let (vport, rest) = decode::<CreateVport>(op, &reply)?;
        let chunks = decode_entries(op, rest, vport.num_chunks.into())?;
        Ok((vport, chunks))
    }

    #[tracing::instrument(level = "debug", skip(self), err)]
    pub fn destroy_vport(&self, vport_id: u32) -> Result<(), MailboxError> {
        self.transact(VirtchnlOp::DESTROY_VPORT, VportId { vport_id }.as_bytes())
            .map(drop)
    }

    #[tracing::instrument(level = "debug", skip(self), err)]
    pub fn enable_vport(&self, vport_id: u32) -> Result<(), MailboxError> {
        self.transact(VirtchnlOp::ENABLE_VPORT, VportId { vport_id }.as_bytes())
            .map(drop)
    }

    #[tracing::instrument(level = "debug", skip(self), err)]
    pub fn disable_vport(&self, vport_id: u32) -> Result<(), MailboxError> {
        self.transact(VirtchnlOp::DISABLE_VPORT, VportId { vport_id }.as_bytes())
            .map(drop)
    }

    /// Configures Tx queues. Returns the number of messages sent.
    #[tracing::instrument(level = "debug", skip(self, queues), fields(count = queues.len()), err)]
    pub fn config_tx_queues(&self, vport_id: u32, queues: &[TxqInfo]) -> Result<usize, MailboxError> {
        self.transact_chunked(VirtchnlOp::CONFIG_TX_QUEUES, queues, |_, chunk| {
            ConfigTxQueues {
                vport_id,
                num_qinfo: chunk.len() as u16,
                pad: [0; 10],
            }
        })
    }

    /// Configures Rx and buffer queues. Returns the number of messages sent.
    #[tracing::instrument(level = "debug", skip(self, queues), fields(count = queues.len()), err)]
    pub fn config_rx_queues(&self, vport_id: u32, queues: &[RxqInfo]) -> Result<usize, MailboxError> {
        self.transact_chunked(VirtchnlOp::CONFIG_RX_QUEUES, queues, |_, chunk| {
            ConfigRxQueues {
                vport_id,
                num_qinfo: chunk.len() as u16,
                pad: [0; 18],
            }
        })
    }

    fn queue_chunks(
        &self,
        op: VirtchnlOp,
        vport_id: u32,
        chunks: &[QueueChunk],
    ) -> Result<usize, MailboxError> {
        self.transact_chunked(op, chunks, |_, chunk| DelEnaDisQueues {
            vport_id,
            pad: 0,
            num_chunks: chunk.len() as u16,
            pad1: [0; 6],
        })
    }

    #[tracing::instrument(level = "debug", skip(self, chunks), err)]
    pub fn enable_queues(&self, vport_id: u32, chunks: &[QueueChunk]) -> Result<(), MailboxError> {
        self.queue_chunks(VirtchnlOp::ENABLE_QUEUES, vport_id, chunks)
            .map(drop)
    }

    #[tracing::instrument(level = "debug", skip(self, chunks), err)]
    pub fn disable_queues(&self, vport_id: u32, chunks: &[QueueChunk]) -> Result<(), MailboxError> {
        self.queue_chunks(VirtchnlOp::DISABLE_QUEUES, vport_id, chunks)
            .map(drop)
    }

    #[tracing::instrument(level = "debug", skip(self, chunks), err)]
    pub fn del_queues(&self, vport_id: u32, chunks: &[QueueChunk]) -> Result<(), MailboxError> {
        self.queue_chunks(VirtchnlOp::DEL_QUEUES, vport_id, chunks)
            .map(drop)
    }

    /// Requests more queues for a vport. Returns the reply and the register
    /// chunks of the new queues.
    #[tracing::instrument(level = "debug", skip_all, err)]
    pub fn add_queues(
        &self,
        req: &AddQueues,
    ) -> Result<(AddQueues, Vec<QueueRegChunk>), MailboxError> {
        let op = VirtchnlOp::ADD_QUEUES;
        let reply = self.transact(op, req.as_bytes())?;
        let (added, rest) = decode::<AddQueues>(op, &reply)?;
        let chunks = decode_entries(op, rest, added.num_chunks.into())?;
        Ok((added, chunks))
    }

    fn queue_vectors(
        &self,
        op: VirtchnlOp,
        vport_id: u32,
        maps: &[QueueVector],
    ) -> Result<usize, MailboxError> {
        self.transact_chunked(op, maps, |_, chunk| QueueVectorMaps {
            vport_id,
            num_qv_maps: chunk.len() as u16,
            pad: [0; 10],
        })
    }

    #[tracing::instrument(level = "debug", skip(self, maps), fields(count = maps.len()), err)]
    pub fn map_queue_vector(&self, vport_id: u32, maps: &[QueueVector]) -> Result<usize, MailboxError> {
        self.queue_vectors(VirtchnlOp::MAP_QUEUE_VECTOR, vport_id, maps)
    }

    #[tracing::instrument(level = "debug", skip(self, maps), fields(count = maps.len()), err)]
    pub fn unmap_queue_vector(&self, vport_id: u32, maps: &[QueueVector]) -> Result<usize, MailboxError> {
        self.queue_vectors(VirtchnlOp::UNMAP_QUEUE_VECTOR, vport_id, maps)
    }

    /// Allocates interrupt vectors. Returns the chunks describing them.
    #[tracing::instrument(level = "debug", skip(self), err)]
    pub fn alloc_vectors(&self, num_vectors: u16) -> Result<Vec<VectorChunk>, MailboxError> {
        let op = VirtchnlOp::ALLOC_VECTORS;
        let mut req = AllocVectors::new_zeroed();
        req.num_vectors = num_vectors;
        let reply = self.transact(op, req.as_bytes())?;
        let (alloc, rest) = decode::<AllocVectors>(op, &reply)?;
        decode_entries(op, rest, alloc.num_vchunks.into())
    }

    #[tracing::instrument(level = "debug", skip_all, err)]
    pub fn dealloc_vectors(&self, chunks: &[VectorChunk]) -> Result<(), MailboxError> {
        self.transact_chunked(VirtchnlOp::DEALLOC_VECTORS, chunks, |_, chunk| {
            VectorChunks {
                num_vchunks: chunk.len() as u16,
                pad: [0; 14],
            }
        })
        .map(drop)
    }

    #[tracing::instrument(level = "debug", skip(self), err)]
    pub fn get_rss_key(&self, vport_id: u32) -> Result<Vec<u8>, MailboxError> {
        let op = VirtchnlOp::GET_RSS_KEY;
        let req = RssKey {
            vport_id,
            key_len: 0,
            pad: [0; 2],
        };
        let reply = self.transact(op, req.as_bytes())?;
        let (key, rest) = decode::<RssKey>(op, &reply)?;
        decode_entries(op, rest, key.key_len.into())
    }

    #[tracing::instrument(level = "debug", skip(self, key), err)]
    pub fn set_rss_key(&self, vport_id: u32, key: &[u8]) -> Result<(), MailboxError> {
        let req = RssKey {
            vport_id,
            key_len: key.len() as u16,
            pad: [0; 2],
        };
        self.transact(VirtchnlOp::SET_RSS_KEY, &encode(&req, key))
            .map(drop)
    }

    #[tracing::instrument(level = "debug", skip(self), err)]
    pub fn get_rss_lut(&self, vport_id: u32) -> Result<Vec<u32>, MailboxError> {
        let op = VirtchnlOp::GET_RSS_LUT;
        let req = RssLut {
            vport_id,
            lut_entries_start: 0,
            lut_entries: 0,
            pad: [0; 4],
        };
        let reply = self.transact(op, req.as_bytes())?;
        let (lut, rest) = decode::<RssLut>(op, &reply)?;
        decode_entries(op, rest, lut.lut_entries.into())
    }

    /// Programs the RSS lookup table, split across messages as needed.
    #[tracing::instrument(level = "debug", skip(self, lut), fields(len = lut.len()), err)]
    pub fn set_rss_lut(&self, vport_id: u32, lut: &[u32]) -> Result<usize, MailboxError> {
        self.transact_chunked(VirtchnlOp::SET_RSS_LUT, lut, |start, chunk| RssLut {
            vport_id,
            lut_entries_start: start as u16,
            lut_entries: chunk.len() as u16,
            pad: [0; 4],
        })
    }

    #[tracing::instrument(level = "debug", skip(self), err)]
    pub fn get_rss_hash(&self, vport_id: u32) -> Result<u64, MailboxError> {
        let req = RssHash {
            ptype_groups: 0,
            vport_id,
            pad: [0; 4],
        };
        let hash: RssHash = self.transact_obj(VirtchnlOp::GET_RSS_HASH, &req)?;
        Ok(hash.ptype_groups)
    }

    #[tracing::instrument(level = "debug", skip(self), err)]
    pub fn set_rss_hash(&self, vport_id: u32, ptype_groups: u64) -> Result<(), MailboxError> {
        let req = RssHash {
            ptype_groups,
            vport_id,
            pad: [0; 4],
        };
        self.transact(VirtchnlOp::SET_RSS_HASH, req.as_bytes())
            .map(drop)
    }

    #[tracing::instrument(level = "debug", skip(self), err)]
    pub fn get_stats(&self, vport_id: u32) -> Result<VportStats, MailboxError> {
        let req = VportStats {
            vport_id,
            ..Default::default()
        };
        self.transact_obj(VirtchnlOp::GET_STATS, &req)
    }

    /// Asks the control plane to reset this function. There is no reply;
    /// the reset is observed through the reset status register.
    #[tracing::instrument(level = "debug", skip(self), err)]
    pub fn reset_vf(&self) -> Result<(), MailboxError> {
        self.send(VirtchnlOp::RESET_VF, &[])
    }
}

#[cfg(test)]
mod tests {
    use super::VirtchnlChannel;
    use super::entries_per_msg;
    use crate::config::MailboxConfig;
    use crate::error::MailboxError;
    use crate::tests::TestRegs;
    use iecm_defs::virtchnl2::ConfigRxQueues;
    use iecm_defs::virtchnl2::ConfigTxQueues;
    use iecm_defs::virtchnl2::RxqInfo;
    use iecm_defs::virtchnl2::TxqInfo;
    use iecm_defs::virtchnl2::VirtchnlOp;
    use std::sync::Arc;
    use std::time::Duration;
    use std::time::Instant;
    use user_driver::emulated::EmulatedDma;
    use user_driver::interrupt::DeviceInterruptSource;

    #[test]
    fn message_capacity() {
        let tx = entries_per_msg(
            4096,
            size_of::<ConfigTxQueues>(),
            size_of::<TxqInfo>(),
            None,
        )
        .unwrap();
        assert_eq!(tx, (4096 - 16) / 56);
        let rx = entries_per_msg(
            4096,
            size_of::<ConfigRxQueues>(),
            size_of::<RxqInfo>(),
            Some(4),
        )
        .unwrap();
        assert_eq!(rx, 4);
        assert_eq!(entries_per_msg(72, 16, 56, None).unwrap(), 1);
    }

    #[test]
    fn message_without_room_for_an_entry() {
        assert!(matches!(
            entries_per_msg(16, 16, 56, None),
            Err(MailboxError::MessageTooLarge { len: 72, max: 16 })
        ));
        assert!(matches!(
            entries_per_msg(71, 16, 56, Some(8)),
            Err(MailboxError::MessageTooLarge { len: 72, max: 71 })
        ));
        assert!(matches!(
            entries_per_msg(4096, 16, 56, Some(0)),
            Err(MailboxError::InvalidConfig(_))
        ));
    }

    #[test]
    fn timeout_starts_after_channel_is_acquired() {
        let dma = EmulatedDma::new();
        let source = DeviceInterruptSource::new();
        let timeout = Duration::from_millis(100);
        let channel = VirtchnlChannel::new(
            &*dma,
            Arc::new(TestRegs::default()),
            source.new_target(),
            MailboxConfig {
                ring_len: 8,
                buf_size: 256,
                timeout,
                ..Default::default()
            },
        )
        .unwrap();

        std::thread::scope(|scope| {
            let held = channel.inner.lock();
            let waiter = scope.spawn(|| {
                let r = channel.recv(VirtchnlOp::GET_CAPS);
                (r, Instant::now())
            });
            std::thread::sleep(Duration::from_millis(200));
            let released = Instant::now();
            drop(held);
            let (r, done) = waiter.join().unwrap();
            assert!(matches!(r, Err(MailboxError::Timeout(VirtchnlOp::GET_CAPS))));
            // The full timeout elapses after the lock is released.
            assert!(done - released >= timeout);
        });
    }
}
