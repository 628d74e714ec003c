// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! This module drives the iecm emulator with the iecm driver to test the
//! end-to-end flow, and holds helpers shared by the unit tests.

use crate::adapter::Adapter;
use crate::bufpool::TxId;
use crate::config::IecmConfig;
use crate::config::MailboxConfig;
use crate::config::QueueConfig;
use crate::config::QueueModel;
use crate::error::NegotiationError;
use crate::rx::RxPacket;
use crate::tx::TxOffload;
use crate::tx::TxPacket;
use crate::vport::ConfigMessages;
use iecm_defs::virtchnl2::ConfigRxQueues;
use iecm_defs::virtchnl2::ConfigTxQueues;
use iecm_defs::virtchnl2::VirtchnlOp;
use iecm_defs::virtchnl2::VirtchnlStatus;
use iecm_emulator::IecmEmulator;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::metadata::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::prelude::*;
use user_driver::DeviceRegisterIo;
use user_driver::DmaClient;
use user_driver::emulated::EmulatedDevice;
use user_driver::emulated::EmulatedDma;
use user_driver::emulated::InterruptLines;
use zerocopy::FromBytes;

/// Initializes `tracing` for tests.
pub fn init_tracing() {
    static ONCE: std::sync::Once = std::sync::Once::new();

    ONCE.call_once(|| {
        let targets = if let Ok(var) = std::env::var("RUST_LOG") {
            var.parse().unwrap()
        } else {
            Targets::new().with_default(LevelFilter::DEBUG)
        };
        tracing_subscriber::fmt()
            .pretty()
            .with_ansi(false)
            .log_internal_errors(true)
            .with_test_writer()
            .with_max_level(LevelFilter::TRACE)
            .finish()
            .with(targets)
            .init();
    });
}

/// Registers that remember the last value written at each offset.
#[derive(Default)]
pub struct TestRegs {
    writes: Mutex<BTreeMap<usize, u32>>,
}

impl TestRegs {
    pub fn last(&self, offset: usize) -> Option<u32> {
        self.writes.lock().get(&offset).copied()
    }
}

impl DeviceRegisterIo for TestRegs {
    fn len(&self) -> usize {
        u32::MAX as usize
    }

    fn read_u32(&self, offset: usize) -> u32 {
        self.last(offset).unwrap_or(0)
    }

    fn write_u32(&self, offset: usize, data: u32) {
        self.writes.lock().insert(offset, data);
    }
}

struct Harness {
    dma: Arc<EmulatedDma>,
    emu: Arc<Mutex<IecmEmulator>>,
    device: EmulatedDevice<IecmEmulator>,
}

fn harness() -> Harness {
    init_tracing();
    let dma = EmulatedDma::new();
    let lines = InterruptLines::new(16);
    let device = EmulatedDevice::new(
        IecmEmulator::new(dma.clone(), lines.clone()),
        dma.clone(),
        lines,
    );
    Harness {
        dma,
        emu: device.device(),
        device,
    }
}

fn test_config(queues: QueueConfig) -> IecmConfig {
    IecmConfig {
        mailbox: MailboxConfig {
            timeout: Duration::from_millis(500),
            step_delay: Duration::from_millis(1),
            state_retries: 5,
            ..Default::default()
        },
        queues,
        ..Default::default()
    }
}

fn ops(emu: &Mutex<IecmEmulator>) -> Vec<VirtchnlOp> {
    emu.lock().requests().iter().map(|r| r.op).collect()
}

/// An IPv4 UDP frame from 66.9.149.187:2794 to 161.142.100.80:1766.
fn udp_frame(len: usize) -> Vec<u8> {
    let mut frame: Vec<u8> = (0..len).map(|i| i as u8).collect();
    frame[..6].copy_from_slice(&[0x02, 0x00, 0x5e, 0x10, 0x00, 0x00]);
    frame[6..12].copy_from_slice(&[0x02, 0x00, 0x5e, 0x10, 0x00, 0x01]);
    frame[12..14].copy_from_slice(&0x0800u16.to_be_bytes());
    frame[14] = 0x45;
    frame[15] = 0;
    frame[16..18].copy_from_slice(&((len - 14) as u16).to_be_bytes());
    frame[18..22].fill(0);
    frame[22] = 64;
    frame[23] = 17;
    frame[24..26].fill(0);
    frame[26..30].copy_from_slice(&[66, 9, 149, 187]);
    frame[30..34].copy_from_slice(&[161, 142, 100, 80]);
    frame[34..36].copy_from_slice(&2794u16.to_be_bytes());
    frame[36..38].copy_from_slice(&1766u16.to_be_bytes());
    frame[38..40].copy_from_slice(&((len - 34) as u16).to_be_bytes());
    frame[40..42].fill(0);
    frame
}

fn tx_packet(dma: &EmulatedDma, id: u64, frame: &[u8]) -> TxPacket {
    let mem = dma.allocate_host_buffer(frame.len()).unwrap();
    mem.write_at(0, frame);
    TxPacket {
        id: TxId(id),
        segments: vec![mem.subblock(0, frame.len())],
        offload: TxOffload::default(),
    }
}

#[test]
fn negotiation_creates_default_vport() {
    let h = harness();
    let mut adapter = Adapter::new(h.device, test_config(QueueConfig::default())).unwrap();
    adapter.init().unwrap();

    let negotiated = adapter.negotiated().unwrap();
    assert_eq!(negotiated.version.major, 2);
    let vport = adapter.vport().unwrap();
    assert_eq!(vport.num_txq(), 4);
    assert_eq!(vport.num_rxq(), 4);
    assert_eq!(vport.mac_address()[0] & 1, 0);
    assert_eq!(
        ops(&h.emu)[..3],
        [
            VirtchnlOp::VERSION,
            VirtchnlOp::GET_CAPS,
            VirtchnlOp::CREATE_VPORT
        ]
    );
    let emu = h.emu.lock();
    assert_eq!(emu.vport_count(), 1);
    assert_eq!(emu.allocated_vectors(), 1);
    assert!(emu.control().vport_enabled(vport.vport_id()));
    let lut = emu.control().rss_lut(vport.vport_id()).unwrap();
    assert!(lut.iter().enumerate().all(|(i, &q)| q == (i % 4) as u32));
}

#[test]
fn version_mismatch_is_fatal() {
    let h = harness();
    h.emu.lock().set_version(3, 0);
    let mut adapter = Adapter::new(h.device, test_config(QueueConfig::default())).unwrap();
    let err = adapter.init().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<NegotiationError>(),
        Some(NegotiationError::VersionMismatch { major: 3, .. })
    ));
    assert!(adapter.vport().is_none());
    assert_eq!(h.emu.lock().vport_count(), 0);
}

#[test]
fn lost_reply_restarts_negotiation() {
    let h = harness();
    h.emu.lock().drop_replies(1);
    let mut adapter = Adapter::new(h.device, test_config(QueueConfig::default())).unwrap();
    adapter.init().unwrap();
    let versions = ops(&h.emu)
        .iter()
        .filter(|&&op| op == VirtchnlOp::VERSION)
        .count();
    assert_eq!(versions, 2);
    assert_eq!(h.emu.lock().vport_count(), 1);
}

#[test]
fn failed_vport_setup_is_unwound() {
    let h = harness();
    h.emu
        .lock()
        .fail_next(VirtchnlOp::ENABLE_QUEUES, VirtchnlStatus::ERR_EIO);
    let mut adapter = Adapter::new(h.device, test_config(QueueConfig::default())).unwrap();
    assert!(adapter.init().is_err());
    let emu = h.emu.lock();
    assert_eq!(emu.vport_count(), 0);
    assert_eq!(emu.allocated_vectors(), 0);
}

#[test]
fn queue_config_is_split_across_messages() {
    let h = harness();
    let queues = QueueConfig {
        num_txq: 8,
        num_rxq: 8,
        ..Default::default()
    };
    let mut config = test_config(queues);
    config.mailbox.max_entries_per_msg = Some(3);
    let mut adapter = Adapter::new(h.device, config).unwrap();
    adapter.init().unwrap();

    let vport = adapter.vport().unwrap();
    assert_eq!(
        vport.config_messages(),
        ConfigMessages {
            tx: 4,
            rx: 4,
            vector_maps: 4,
        }
    );

    let emu = h.emu.lock();
    let mut tx_entries = 0;
    let mut rx_entries = 0;
    for req in emu.requests() {
        if req.op == VirtchnlOp::CONFIG_TX_QUEUES {
            let (hdr, _) = ConfigTxQueues::read_from_prefix(&req.data).unwrap();
            assert!(hdr.num_qinfo <= 3);
            tx_entries += hdr.num_qinfo;
        } else if req.op == VirtchnlOp::CONFIG_RX_QUEUES {
            let (hdr, _) = ConfigRxQueues::read_from_prefix(&req.data).unwrap();
            assert!(hdr.num_qinfo <= 3);
            rx_entries += hdr.num_qinfo;
        }
    }
    // Two groups of four queues, one completion queue per tx group and two
    // buffer queues per rx group.
    assert_eq!(tx_entries, 10);
    assert_eq!(rx_entries, 12);
    assert_eq!(emu.allocated_vectors(), 2);
}

#[test]
fn event_ahead_of_reply_is_queued() {
    let h = harness();
    let mut adapter = Adapter::new(h.device, test_config(QueueConfig::default())).unwrap();
    h.emu.lock().link_change(0, true, 25000);
    adapter.init().unwrap();
    adapter.process_events().unwrap();
    assert!(adapter.link().up);
    assert_eq!(adapter.link().speed_mbps, 25000);
    assert_eq!(adapter.soft_resets(), 0);
}

#[test]
fn reset_event_rebuilds_vport() {
    let h = harness();
    let mut adapter = Adapter::new(h.device, test_config(QueueConfig::default())).unwrap();
    adapter.init().unwrap();
    h.emu.lock().reset_impending();
    adapter.process_events().unwrap();
    assert_eq!(adapter.soft_resets(), 1);
    assert!(adapter.vport().is_some());
    let emu = h.emu.lock();
    assert_eq!(emu.vport_count(), 1);
    assert_eq!(emu.allocated_vectors(), 1);
}

fn loopback(queues: QueueConfig) {
    let h = harness();
    let mut adapter = Adapter::new(h.device, test_config(queues)).unwrap();
    adapter.init().unwrap();
    let vport = adapter.vport_mut().unwrap();
    let txq = vport.tx_stats()[0].0;

    let frame = udp_frame(200);
    vport.send(txq, &tx_packet(&h.dma, 1, &frame)).unwrap();

    let mut received: Vec<RxPacket> = Vec::new();
    let mut tx_done = 0;
    for index in 0..vport.vectors().len() {
        let result = vport.poll(index, 64, &mut received).unwrap();
        tx_done += result.tx.packets;
    }
    assert_eq!(tx_done, 1);
    assert_eq!(received.len(), 1);
    let pkt = &received[0];
    assert_eq!(pkt.to_vec(), frame);
    assert_eq!(pkt.ptype, 24);
    // The default key begins with the well known verification key.
    assert_eq!(pkt.hash.map(|hash| hash.value), Some(0x51cc_c178));
    let completed: Vec<_> = vport.txq_mut(txq).unwrap().take_completed().collect();
    assert_eq!(completed, [TxId(1)]);

    let stats = adapter.device_stats().unwrap();
    assert_eq!(stats.tx_unicast, 1);
    assert_eq!(stats.rx_unicast, 1);
    assert_eq!(stats.rx_bytes, 200);

    let _device = adapter.shutdown();
    let emu = h.emu.lock();
    assert_eq!(emu.vport_count(), 0);
    assert_eq!(emu.allocated_vectors(), 0);
    assert_eq!(emu.loopback_stats().rx_dropped, 0);
    assert_eq!(h.dma.stats().bad_unmaps, 0);
}

#[test]
fn loopback_split_queues() {
    loopback(QueueConfig::default());
}

#[test]
fn loopback_flow_scheduled() {
    loopback(QueueConfig {
        flow_sched: true,
        ..Default::default()
    });
}

#[test]
fn loopback_single_queues() {
    loopback(QueueConfig {
        tx_model: QueueModel::Single,
        rx_model: QueueModel::Single,
        num_txq: 2,
        num_rxq: 2,
        ..Default::default()
    });
}

/// Streams enough traffic through one queue pair to wrap every ring several
/// times, polling after each packet.
fn sustained_loopback(queues: QueueConfig, ring_len: u32) {
    let h = harness();
    let queues = QueueConfig {
        tx_desc_count: ring_len,
        tx_compl_desc_count: ring_len,
        rx_desc_count: ring_len,
        rx_bufq_desc_count: ring_len,
        ..queues
    };
    let mut adapter = Adapter::new(h.device, test_config(queues)).unwrap();
    adapter.init().unwrap();
    let vport = adapter.vport_mut().unwrap();
    let txq = vport.tx_stats()[0].0;

    let total = 4 * ring_len as u64 + 7;
    let mut bytes = 0;
    let mut tx_done = 0;
    let mut completed = 0;
    let mut received: Vec<RxPacket> = Vec::new();
    for id in 0..total {
        // Frames over the copy threshold arrive with a page fragment.
        let frame = udp_frame(60 + (id as usize * 131) % 1400);
        bytes += frame.len() as u64;
        vport.send(txq, &tx_packet(&h.dma, id, &frame)).unwrap();
        for index in 0..vport.vectors().len() {
            tx_done += vport.poll(index, 64, &mut received).unwrap().tx.packets;
        }
        assert_eq!(received.len(), 1, "packet {id}");
        assert_eq!(received[0].to_vec(), frame, "packet {id}");
        received.clear();
        completed += vport.txq_mut(txq).unwrap().take_completed().count();
    }
    assert_eq!(tx_done as u64, total);
    assert_eq!(completed as u64, total);
    let q = vport.txq_mut(txq).unwrap();
    assert_eq!(q.ring().next_to_use() as u64, total % ring_len as u64);
    assert_eq!(q.stats().busy, 0);
    assert_eq!(q.stats().dropped, 0);

    let stats = adapter.device_stats().unwrap();
    assert_eq!(stats.tx_unicast, total);
    assert_eq!(stats.rx_unicast, total);
    assert_eq!(stats.rx_bytes, bytes);

    let _device = adapter.shutdown();
    let emu = h.emu.lock();
    assert_eq!(emu.loopback_stats().rx_dropped, 0);
    assert_eq!(h.dma.stats().bad_unmaps, 0);
}

fn single_queues() -> QueueConfig {
    QueueConfig {
        tx_model: QueueModel::Single,
        rx_model: QueueModel::Single,
        num_txq: 2,
        num_rxq: 2,
        ..Default::default()
    }
}

fn flow_queues() -> QueueConfig {
    QueueConfig {
        flow_sched: true,
        ..Default::default()
    }
}

#[test]
fn sustained_split_queues_small_ring() {
    sustained_loopback(QueueConfig::default(), 64);
}

#[test]
fn sustained_split_queues() {
    sustained_loopback(QueueConfig::default(), 256);
}

#[test]
fn sustained_flow_scheduled_small_ring() {
    sustained_loopback(flow_queues(), 64);
}

#[test]
fn sustained_flow_scheduled() {
    sustained_loopback(flow_queues(), 256);
}

#[test]
fn sustained_single_queues_small_ring() {
    sustained_loopback(single_queues(), 64);
}

#[test]
fn sustained_single_queues() {
    sustained_loopback(single_queues(), 256);
}
