// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An emulated iecm function: the mailbox, a control plane answering
//! virtchnl2 requests, and a loopback datapath. Used to test the driver
//! without hardware.

#![forbid(unsafe_code)]

mod control;
mod datapath;
mod mailbox;

pub use control::ControlPlane;
pub use control::Request;
pub use datapath::LoopbackStats;
pub use datapath::toeplitz;
pub use mailbox::Message;

use iecm_defs::ctlq::CTLQ_DIRECT_PARAMS_LEN;
use iecm_defs::ctlq::CTLQ_FLAG_BUF;
use iecm_defs::ctlq::CTLQ_FLAG_CMP;
use iecm_defs::ctlq::CTLQ_FLAG_DD;
use iecm_defs::ctlq::MBQ_OPC_SEND_MSG_TO_PEER;
use iecm_defs::regs;
use iecm_defs::virtchnl2::Event;
use iecm_defs::virtchnl2::EventCode;
use iecm_defs::virtchnl2::GetCapabilities;
use iecm_defs::virtchnl2::VirtchnlOp;
use iecm_defs::virtchnl2::VirtchnlStatus;
use mailbox::DeviceRing;
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;
use user_driver::emulated::EmulatedDma;
use user_driver::emulated::EmulatedMmio;
use user_driver::emulated::InterruptLines;
use zerocopy::IntoBytes;

/// The interrupt line of the mailbox.
const MAILBOX_LINE: usize = 0;

pub struct IecmEmulator {
    dma: Arc<EmulatedDma>,
    interrupts: Arc<InterruptLines>,
    rstat: u32,
    atq: DeviceRing,
    arq: DeviceRing,
    /// Messages waiting for a receive buffer.
    outbox: VecDeque<Message>,
    control: ControlPlane,
    writes: BTreeMap<u64, u32>,
    drop_replies: u32,
}

impl IecmEmulator {
    pub fn new(dma: Arc<EmulatedDma>, interrupts: Arc<InterruptLines>) -> Self {
        Self {
            dma,
            interrupts,
            rstat: regs::RSTAT_ACTIVE,
            atq: DeviceRing::default(),
            arq: DeviceRing::default(),
            outbox: VecDeque::new(),
            control: ControlPlane::new(),
            writes: BTreeMap::new(),
            drop_replies: 0,
        }
    }

    pub fn control(&self) -> &ControlPlane {
        &self.control
    }

    pub fn control_mut(&mut self) -> &mut ControlPlane {
        &mut self.control
    }

    /// Sets the version the control plane answers with.
    pub fn set_version(&mut self, major: u32, minor: u32) {
        self.control.set_version(major, minor);
    }

    pub fn caps_mut(&mut self) -> &mut GetCapabilities {
        self.control.caps_mut()
    }

    /// Fails the next request with opcode `op`.
    pub fn fail_next(&mut self, op: VirtchnlOp, status: VirtchnlStatus) {
        self.control.fail_next(op, status);
    }

    /// Handles the next `n` requests without sending their replies.
    pub fn drop_replies(&mut self, n: u32) {
        self.drop_replies = n;
    }

    /// Sends an unsolicited event to the driver.
    pub fn inject_event(&mut self, event: Event) {
        tracing::debug!(code = ?event.event, vport_id = event.vport_id, "injecting event");
        self.outbox.push_back(Message {
            op: VirtchnlOp::EVENT,
            status: VirtchnlStatus::SUCCESS,
            data: event.as_bytes().to_vec(),
        });
        self.flush_arq();
    }

    pub fn link_change(&mut self, vport_id: u32, up: bool, speed_mbps: u32) {
        self.inject_event(Event {
            event: EventCode::LINK_CHANGE,
            link_speed: speed_mbps,
            vport_id,
            link_status: up.into(),
            pad: 0,
            adi_id: 0,
        });
    }

    pub fn reset_impending(&mut self) {
        self.inject_event(Event {
            event: EventCode::RESET_IMPENDING,
            link_speed: 0,
            vport_id: 0,
            link_status: 0,
            pad: 0,
            adi_id: 0,
        });
    }

    /// Sets the state reported in the reset status register.
    pub fn set_reset_state(&mut self, state: u32) {
        self.rstat = state;
    }

    /// The last value the driver wrote at `offset`.
    pub fn last_write(&self, offset: u64) -> Option<u32> {
        self.writes.get(&offset).copied()
    }

    pub fn requests(&self) -> &[Request] {
        self.control.requests()
    }

    pub fn vport_count(&self) -> usize {
        self.control.vport_count()
    }

    pub fn allocated_vectors(&self) -> usize {
        self.control.allocated_vectors()
    }

    pub fn loopback_stats(&self) -> LoopbackStats {
        self.control.loopback.stats()
    }

    fn process_atq(&mut self) {
        while self.atq.has_work() {
            let Some(mut desc) = self.atq.read_head(&self.dma) else {
                tracing::warn!(head = self.atq.head, "send ring not visible to the device");
                break;
            };
            let data = if desc.flags & CTLQ_FLAG_BUF != 0 {
                match self.dma.resolve(desc.params.addr(), desc.datalen.into()) {
                    Some(buf) => buf.to_vec(),
                    None => {
                        tracing::warn!(
                            addr = desc.params.addr(),
                            len = desc.datalen,
                            "message buffer not visible to the device"
                        );
                        Vec::new()
                    }
                }
            } else {
                let len = (desc.datalen as usize).min(CTLQ_DIRECT_PARAMS_LEN);
                desc.params.direct_bytes()[..len].to_vec()
            };
            let op = VirtchnlOp(desc.cookie_high);
            desc.flags |= CTLQ_FLAG_DD | CTLQ_FLAG_CMP;
            desc.ret_val = 0;
            self.atq.write_head(&self.dma, &desc);
            self.atq.advance();

            if let Some(reply) = self.control.handle(op, &data) {
                if self.drop_replies > 0 {
                    self.drop_replies -= 1;
                    tracing::debug!(?op, "dropping reply");
                } else {
                    self.outbox.push_back(reply);
                }
            }
        }
        self.flush_arq();
    }

    /// Moves queued messages into posted receive buffers.
    fn flush_arq(&mut self) {
        let mut posted = false;
        while self.arq.has_work() {
            let Some(msg) = self.outbox.pop_front() else {
                break;
            };
            let Some(mut desc) = self.arq.read_head(&self.dma) else {
                tracing::warn!(head = self.arq.head, "receive ring not visible to the device");
                self.outbox.push_front(msg);
                break;
            };
            let len = msg.data.len().min(desc.datalen.into());
            if len < msg.data.len() {
                tracing::warn!(op = ?msg.op, len = msg.data.len(), "message truncated");
            }
            if len > 0 {
                match self.dma.resolve(desc.params.addr(), len) {
                    Some(buf) => buf.write_at(0, &msg.data[..len]),
                    None => tracing::warn!(op = ?msg.op, "receive buffer not visible to the device"),
                }
            }
            desc.flags = CTLQ_FLAG_BUF | CTLQ_FLAG_DD | CTLQ_FLAG_CMP;
            desc.opcode = MBQ_OPC_SEND_MSG_TO_PEER;
            desc.datalen = len as u16;
            desc.ret_val = 0;
            desc.cookie_high = msg.op.0;
            desc.cookie_low = msg.status.0;
            self.arq.write_head(&self.dma, &desc);
            self.arq.advance();
            posted = true;
        }
        if posted {
            self.interrupts.signal(MAILBOX_LINE);
        }
    }

    fn write_dyn_ctl(&mut self, line: usize, value: u32) {
        if regs::DynCtl::from_bits(value).swint_trig() {
            self.interrupts.signal(line);
        }
    }
}

const ATQ_REGS: std::ops::RangeInclusive<usize> = regs::ATQ_BAL..=regs::ATQ_TAIL;
const ARQ_REGS: std::ops::RangeInclusive<usize> = regs::ARQ_BAL..=regs::ARQ_TAIL;

impl EmulatedMmio for IecmEmulator {
    fn mmio_read(&mut self, bar: u8, offset: u64) -> u32 {
        if bar != 0 {
            return 0;
        }
        match offset as usize {
            reg if ATQ_REGS.contains(&reg) => self.atq.read_reg(reg - regs::ATQ_BAL),
            reg if ARQ_REGS.contains(&reg) => self.arq.read_reg(reg - regs::ARQ_BAL),
            regs::RSTAT => self.rstat,
            _ => self.writes.get(&offset).copied().unwrap_or(0),
        }
    }

    fn mmio_write(&mut self, bar: u8, offset: u64, data: u32) {
        if bar != 0 {
            return;
        }
        self.writes.insert(offset, data);
        match offset as usize {
            reg if ATQ_REGS.contains(&reg) => {
                self.atq.write_reg(reg - regs::ATQ_BAL, data);
                if reg == regs::ATQ_TAIL {
                    self.process_atq();
                }
            }
            reg if ARQ_REGS.contains(&reg) => {
                self.arq.write_reg(reg - regs::ARQ_BAL, data);
                if reg == regs::ARQ_TAIL {
                    self.flush_arq();
                }
            }
            regs::RSTAT => {}
            regs::MBX_DYN_CTL => self.write_dyn_ctl(MAILBOX_LINE, data),
            _ if (regs::DEFAULT_QTAIL_BASE..regs::DEFAULT_DYN_CTL_BASE as u64)
                .contains(&offset) =>
            {
                match control::tail_queue(offset) {
                    Some(queue_id) => self.control.loopback.doorbell(
                        &self.dma,
                        &self.interrupts,
                        queue_id,
                        data,
                    ),
                    None => tracing::debug!(offset, "unaligned doorbell write"),
                }
            }
            _ if offset >= regs::DEFAULT_DYN_CTL_BASE as u64 => {
                let line = (offset - regs::DEFAULT_DYN_CTL_BASE as u64)
                    / regs::DEFAULT_DYN_CTL_SPACING as u64;
                self.write_dyn_ctl(line as usize, data);
            }
            _ => tracing::trace!(offset, data, "unhandled register write"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::IecmEmulator;
    use iecm_defs::ctlq::CTLQ_FLAG_BUF;
    use iecm_defs::ctlq::CTLQ_FLAG_DD;
    use iecm_defs::ctlq::CtlqDesc;
    use iecm_defs::ctlq::CtlqParams;
    use iecm_defs::regs;
    use iecm_defs::virtchnl2::VirtchnlOp;
    use iecm_defs::virtchnl2::VirtchnlStatus;
    use user_driver::DmaClient;
    use user_driver::emulated::EmulatedDma;
    use user_driver::emulated::EmulatedMmio;
    use user_driver::emulated::InterruptLines;
    use user_driver::memory::MemoryBlock;
    use zerocopy::FromZeros;

    const RING: u16 = 4;

    fn program(emu: &mut IecmEmulator, base: usize, ring: &MemoryBlock) {
        emu.mmio_write(0, (base + 0x8) as u64, 0);
        emu.mmio_write(0, base as u64, ring.iova() as u32);
        emu.mmio_write(0, (base + 0x4) as u64, (ring.iova() >> 32) as u32);
        emu.mmio_write(0, (base + 0x8) as u64, RING as u32 | regs::QLEN_ENABLE);
    }

    #[test]
    fn version_request_gets_reply_in_posted_buffer() {
        let dma = EmulatedDma::new();
        let lines = InterruptLines::new(4);
        let mut emu = IecmEmulator::new(dma.clone(), lines);
        let atq = dma.allocate_dma_buffer(4096).unwrap();
        let arq = dma.allocate_dma_buffer(4096).unwrap();
        let buf = dma.allocate_dma_buffer(4096).unwrap();
        program(&mut emu, regs::ATQ_BAL, &atq);
        program(&mut emu, regs::ARQ_BAL, &arq);

        let mut posted = CtlqDesc::new_zeroed();
        posted.flags = CTLQ_FLAG_BUF;
        posted.datalen = 256;
        posted.params = CtlqParams::indirect(buf.iova());
        arq.write_obj(0, &posted);
        emu.mmio_write(0, regs::ARQ_TAIL as u64, 1);

        let mut req = CtlqDesc::new_zeroed();
        req.datalen = 8;
        req.cookie_high = VirtchnlOp::VERSION.0;
        req.params = CtlqParams::direct([2, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        atq.write_obj(0, &req);
        emu.mmio_write(0, regs::ATQ_TAIL as u64, 1);

        let sent: CtlqDesc = atq.read_obj(0);
        assert_ne!(sent.flags & CTLQ_FLAG_DD, 0);
        let reply: CtlqDesc = arq.read_obj(0);
        assert_ne!(reply.flags & CTLQ_FLAG_DD, 0);
        assert_eq!(reply.cookie_high, VirtchnlOp::VERSION.0);
        assert_eq!(reply.cookie_low, VirtchnlStatus::SUCCESS.0);
        assert_eq!(reply.datalen, 8);
        assert_eq!(emu.mmio_read(0, regs::ATQ_HEAD as u64), 1);
        assert_eq!(emu.requests().len(), 1);
    }

    #[test]
    fn events_wait_for_receive_buffers() {
        let dma = EmulatedDma::new();
        let mut emu = IecmEmulator::new(dma.clone(), InterruptLines::new(4));
        let arq = dma.allocate_dma_buffer(4096).unwrap();
        let buf = dma.allocate_dma_buffer(4096).unwrap();
        program(&mut emu, regs::ARQ_BAL, &arq);
        emu.link_change(0, true, 25000);
        assert_eq!(arq.read_obj::<CtlqDesc>(0).flags & CTLQ_FLAG_DD, 0);

        let mut posted = CtlqDesc::new_zeroed();
        posted.flags = CTLQ_FLAG_BUF;
        posted.datalen = 64;
        posted.params = CtlqParams::indirect(buf.iova());
        arq.write_obj(0, &posted);
        emu.mmio_write(0, regs::ARQ_TAIL as u64, 1);
        let reply: CtlqDesc = arq.read_obj(0);
        assert_ne!(reply.flags & CTLQ_FLAG_DD, 0);
        assert_eq!(reply.cookie_high, VirtchnlOp::EVENT.0);
        assert_eq!(reply.datalen, 16);
    }
}
