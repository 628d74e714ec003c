// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The mailbox: a send ring and a receive ring of control queue descriptors
//! shared with the control plane.

use crate::error::MailboxError;
use crate::ring::DescRing;
use crate::ring::RingRole;
use iecm_defs::ctlq::CTLQ_DESC_SIZE;
use iecm_defs::ctlq::CTLQ_DIRECT_PARAMS_LEN;
use iecm_defs::ctlq::CTLQ_FLAG_BUF;
use iecm_defs::ctlq::CTLQ_FLAG_DD;
use iecm_defs::ctlq::CTLQ_FLAG_ERR;
use iecm_defs::ctlq::CTLQ_FLAG_RD;
use iecm_defs::ctlq::CtlqDesc;
use iecm_defs::ctlq::CtlqParams;
use iecm_defs::ctlq::MBQ_OPC_SEND_MSG_TO_CP;
use iecm_defs::regs;
use iecm_defs::virtchnl2::VirtchnlOp;
use iecm_defs::virtchnl2::VirtchnlStatus;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use user_driver::DeviceRegisterIo;
use user_driver::DmaClient;
use user_driver::memory::MemoryBlock;

/// The registers of one control queue.
#[derive(Debug, Copy, Clone)]
pub struct CtlqRegs {
    pub bal: usize,
    pub bah: usize,
    pub len: usize,
    pub head: usize,
    pub tail: usize,
}

impl CtlqRegs {
    pub const SEND: Self = Self {
        bal: regs::ATQ_BAL,
        bah: regs::ATQ_BAH,
        len: regs::ATQ_LEN,
        head: regs::ATQ_HEAD,
        tail: regs::ATQ_TAIL,
    };

    pub const RECV: Self = Self {
        bal: regs::ARQ_BAL,
        bah: regs::ARQ_BAH,
        len: regs::ARQ_LEN,
        head: regs::ARQ_HEAD,
        tail: regs::ARQ_TAIL,
    };
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CtlqKind {
    Send,
    Recv,
}

/// A message received from the control plane.
#[derive(Debug, Clone)]
pub struct CtlqMsg {
    pub op: VirtchnlOp,
    pub status: VirtchnlStatus,
    pub data: Vec<u8>,
}

/// One direction of the mailbox. Each descriptor slot owns a buffer of
/// `buf_size` bytes: send slots use it for indirect payloads, receive slots
/// post it for the control plane to write into.
pub struct ControlQueue {
    kind: CtlqKind,
    ring: DescRing,
    bufs: MemoryBlock,
    buf_size: usize,
    regs: Arc<dyn DeviceRegisterIo>,
    offsets: CtlqRegs,
}

impl ControlQueue {
    pub fn new(
        dma: &dyn DmaClient,
        regs: Arc<dyn DeviceRegisterIo>,
        kind: CtlqKind,
        count: u16,
        buf_size: u16,
    ) -> Result<Self, MailboxError> {
        let ring = DescRing::alloc(dma, RingRole::Mailbox, count, CTLQ_DESC_SIZE)
            .map_err(MailboxError::Ring)?;
        let bufs = dma
            .allocate_dma_buffer(count as usize * buf_size as usize)
            .map_err(MailboxError::Dma)?;
        let offsets = match kind {
            CtlqKind::Send => CtlqRegs::SEND,
            CtlqKind::Recv => CtlqRegs::RECV,
        };
        let mut queue = Self {
            kind,
            ring,
            bufs,
            buf_size: buf_size as usize,
            regs,
            offsets,
        };
        queue.program();
        if kind == CtlqKind::Recv {
            queue.post_buffers();
        }
        Ok(queue)
    }

    fn program(&mut self) {
        let iova = self.ring.iova();
        self.regs.write_u32(self.offsets.head, 0);
        self.regs.write_u32(self.offsets.tail, 0);
        self.regs.write_u32(self.offsets.bal, iova as u32);
        self.regs.write_u32(self.offsets.bah, (iova >> 32) as u32);
        self.regs.write_u32(
            self.offsets.len,
            (self.ring.count() as u32 & regs::QLEN_MASK) | regs::QLEN_ENABLE,
        );
    }

    pub fn kind(&self) -> CtlqKind {
        self.kind
    }

    pub fn ring(&self) -> &DescRing {
        &self.ring
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    fn buf(&self, index: u16) -> MemoryBlock {
        self.bufs
            .subblock(index as usize * self.buf_size, self.buf_size)
    }

    /// Sends descriptors still waiting for the control plane.
    pub fn pending(&self) -> u16 {
        self.ring.in_flight()
    }

    /// Reclaims up to `budget` sent descriptors the control plane has
    /// consumed.
    pub fn clean(&mut self, budget: u16) -> u16 {
        let mut cleaned = 0;
        while cleaned < budget && self.ring.in_flight() > 0 {
            let index = self.ring.next_to_clean();
            let desc: CtlqDesc = self.ring.read(index);
            if desc.flags & CTLQ_FLAG_DD == 0 {
                break;
            }
            std::sync::atomic::fence(Ordering::Acquire);
            if desc.flags & CTLQ_FLAG_ERR != 0 {
                tracing::warn!(
                    op = ?VirtchnlOp(desc.cookie_high),
                    ret_val = desc.ret_val,
                    "control plane rejected a mailbox send"
                );
            }
            self.ring.clear(index);
            self.ring.advance_ntc();
            cleaned += 1;
        }
        cleaned
    }

    /// Posts one message to the control plane, after reclaiming up to
    /// `clean_budget` completed sends. Payloads that fit are carried in the
    /// descriptor itself.
    pub fn send(
        &mut self,
        op: VirtchnlOp,
        data: &[u8],
        clean_budget: u16,
    ) -> Result<(), MailboxError> {
        debug_assert_eq!(self.kind, CtlqKind::Send);
        self.clean(clean_budget);
        if data.len() > self.buf_size {
            return Err(MailboxError::MessageTooLarge {
                len: data.len(),
                max: self.buf_size,
            });
        }
        if self.ring.unused() == 0 {
            return Err(MailboxError::RingFull);
        }

        let index = self.ring.next_to_use();
        let (flags, params) = if data.len() <= CTLQ_DIRECT_PARAMS_LEN {
            let mut direct = [0; CTLQ_DIRECT_PARAMS_LEN];
            direct[..data.len()].copy_from_slice(data);
            (0, CtlqParams::direct(direct))
        } else {
            let buf = self.buf(index);
            buf.write_at(0, data);
            (CTLQ_FLAG_RD | CTLQ_FLAG_BUF, CtlqParams::indirect(buf.iova()))
        };
        self.ring.write(
            index,
            &CtlqDesc {
                flags,
                opcode: MBQ_OPC_SEND_MSG_TO_CP,
                datalen: data.len() as u16,
                ret_val: 0,
                cookie_high: op.0,
                cookie_low: 0,
                params,
            },
        );
        self.ring.advance_ntu();
        std::sync::atomic::fence(Ordering::Release);
        self.regs
            .write_u32(self.offsets.tail, self.ring.next_to_use().into());
        tracing::trace!(?op, len = data.len(), "mailbox send");
        Ok(())
    }

    /// Posts receive buffers to every free slot.
    fn post_buffers(&mut self) {
        let mut posted = false;
        while self.ring.unused() > 0 {
            let index = self.ring.next_to_use();
            let buf = self.buf(index);
            self.ring.write(
                index,
                &CtlqDesc {
                    flags: CTLQ_FLAG_BUF,
                    opcode: 0,
                    datalen: self.buf_size as u16,
                    ret_val: 0,
                    cookie_high: 0,
                    cookie_low: 0,
                    params: CtlqParams::indirect(buf.iova()),
                },
            );
            self.ring.advance_ntu();
            posted = true;
        }
        if posted {
            std::sync::atomic::fence(Ordering::Release);
            self.regs
                .write_u32(self.offsets.tail, self.ring.next_to_use().into());
        }
    }

    /// Takes the next message written by the control plane, if any, and
    /// returns its buffer to the ring.
    pub fn receive(&mut self) -> Option<CtlqMsg> {
        debug_assert_eq!(self.kind, CtlqKind::Recv);
        if self.ring.in_flight() == 0 {
            return None;
        }
        let index = self.ring.next_to_clean();
        let desc: CtlqDesc = self.ring.read(index);
        if desc.flags & CTLQ_FLAG_DD == 0 {
            return None;
        }
        std::sync::atomic::fence(Ordering::Acquire);

        let data = if desc.flags & CTLQ_FLAG_BUF != 0 {
            let mut data = vec![0; (desc.datalen as usize).min(self.buf_size)];
            self.buf(index).read_at(0, &mut data);
            data
        } else {
            let len = (desc.datalen as usize).min(CTLQ_DIRECT_PARAMS_LEN);
            desc.params.direct_bytes()[..len].to_vec()
        };
        let mut status = VirtchnlStatus(desc.cookie_low);
        if desc.flags & CTLQ_FLAG_ERR != 0 && status == VirtchnlStatus::SUCCESS {
            status = VirtchnlStatus::ERR_EIO;
        }
        let msg = CtlqMsg {
            op: VirtchnlOp(desc.cookie_high),
            status,
            data,
        };

        self.ring.clear(index);
        self.ring.advance_ntc();
        self.post_buffers();
        Some(msg)
    }

    /// Disables the queue and frees its ring.
    pub fn shutdown(&mut self) {
        if !self.ring.is_allocated() {
            return;
        }
        self.regs.write_u32(self.offsets.len, 0);
        self.regs.write_u32(self.offsets.bal, 0);
        self.regs.write_u32(self.offsets.bah, 0);
        self.ring.release();
    }
}

#[cfg(test)]
mod tests {
    use super::ControlQueue;
    use super::CtlqKind;
    use super::CtlqRegs;
    use crate::error::MailboxError;
    use crate::tests::TestRegs;
    use crate::tests::init_tracing;
    use iecm_defs::ctlq::CTLQ_FLAG_BUF;
    use iecm_defs::ctlq::CTLQ_FLAG_DD;
    use iecm_defs::ctlq::CTLQ_FLAG_ERR;
    use iecm_defs::ctlq::CTLQ_FLAG_RD;
    use iecm_defs::ctlq::CtlqDesc;
    use iecm_defs::ctlq::MBQ_OPC_SEND_MSG_TO_CP;
    use iecm_defs::regs::QLEN_ENABLE;
    use iecm_defs::virtchnl2::VirtchnlOp;
    use iecm_defs::virtchnl2::VirtchnlStatus;
    use std::sync::Arc;
    use user_driver::emulated::EmulatedDma;

    #[test]
    fn send_direct_and_indirect() {
        init_tracing();
        let dma = EmulatedDma::new();
        let regs = Arc::new(TestRegs::default());
        let mut q = ControlQueue::new(&*dma, regs.clone(), CtlqKind::Send, 8, 256).unwrap();
        assert_eq!(regs.last(CtlqRegs::SEND.len), Some(8 | QLEN_ENABLE));

        q.send(VirtchnlOp::VERSION, &[1, 2, 3, 4, 5, 6, 7, 8], 4)
            .unwrap();
        let desc: CtlqDesc = q.ring().read(0);
        assert_eq!(desc.flags, 0);
        assert_eq!(desc.opcode, MBQ_OPC_SEND_MSG_TO_CP);
        assert_eq!(desc.cookie_high, VirtchnlOp::VERSION.0);
        assert_eq!(&desc.params.direct_bytes()[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);

        let payload = [0x5a; 100];
        q.send(VirtchnlOp::GET_CAPS, &payload, 4).unwrap();
        let desc: CtlqDesc = q.ring().read(1);
        assert_eq!(desc.flags, CTLQ_FLAG_RD | CTLQ_FLAG_BUF);
        assert_eq!(desc.datalen, 100);
        let sent = dma.resolve(desc.params.addr(), 100).unwrap().to_vec();
        assert_eq!(sent, payload);
        assert_eq!(regs.last(CtlqRegs::SEND.tail), Some(2));

        assert!(matches!(
            q.send(VirtchnlOp::GET_CAPS, &[0; 257], 4),
            Err(MailboxError::MessageTooLarge { len: 257, max: 256 })
        ));
    }

    #[test]
    fn send_ring_full_until_cleaned() {
        let dma = EmulatedDma::new();
        let regs = Arc::new(TestRegs::default());
        let mut q = ControlQueue::new(&*dma, regs, CtlqKind::Send, 8, 256).unwrap();
        for _ in 0..7 {
            q.send(VirtchnlOp::GET_STATS, &[], 4).unwrap();
        }
        assert!(matches!(
            q.send(VirtchnlOp::GET_STATS, &[], 4),
            Err(MailboxError::RingFull)
        ));
        assert_eq!(q.pending(), 7);

        // The control plane consumes the first two sends.
        for index in 0..2 {
            let mut desc: CtlqDesc = q.ring().read(index);
            desc.flags |= CTLQ_FLAG_DD;
            q.ring().write(index, &desc);
        }
        q.send(VirtchnlOp::GET_STATS, &[], 4).unwrap();
        assert_eq!(q.pending(), 6);
    }

    #[test]
    fn receive_reposts_buffers() {
        init_tracing();
        let dma = EmulatedDma::new();
        let regs = Arc::new(TestRegs::default());
        let mut q = ControlQueue::new(&*dma, regs.clone(), CtlqKind::Recv, 8, 256).unwrap();
        assert_eq!(regs.last(CtlqRegs::RECV.tail), Some(7));
        assert!(q.receive().is_none());

        let mut desc: CtlqDesc = q.ring().read(0);
        assert_eq!(desc.flags, CTLQ_FLAG_BUF);
        dma.resolve(desc.params.addr(), 24)
            .unwrap()
            .write_at(0, &[9; 24]);
        desc.flags |= CTLQ_FLAG_DD;
        desc.datalen = 24;
        desc.cookie_high = VirtchnlOp::CREATE_VPORT.0;
        q.ring().write(0, &desc);

        let msg = q.receive().unwrap();
        assert_eq!(msg.op, VirtchnlOp::CREATE_VPORT);
        assert_eq!(msg.status, VirtchnlStatus::SUCCESS);
        assert_eq!(msg.data, vec![9; 24]);
        // Slot 7 was posted, wrapping the tail.
        assert_eq!(regs.last(CtlqRegs::RECV.tail), Some(0));

        // An error flag without a status is still a failure.
        let mut desc: CtlqDesc = q.ring().read(1);
        desc.flags |= CTLQ_FLAG_DD | CTLQ_FLAG_ERR;
        desc.datalen = 0;
        desc.cookie_high = VirtchnlOp::ENABLE_VPORT.0;
        q.ring().write(1, &desc);
        let msg = q.receive().unwrap();
        assert_eq!(msg.status, VirtchnlStatus::ERR_EIO);
        assert!(msg.data.is_empty());
    }
}
