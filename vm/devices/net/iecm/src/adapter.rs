// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The device level driver object.

use crate::config::IecmConfig;
use crate::config::LinkSpeed;
use crate::negotiate::Negotiated;
use crate::negotiate::Negotiator;
use crate::virtchnl::DeviceEvent;
use crate::virtchnl::VirtchnlChannel;
use crate::vport::Vport;
use crate::vport::VportParams;
use anyhow::Context;
use iecm_defs::regs;
use iecm_defs::virtchnl2::VportStats;
use std::sync::Arc;
use std::time::Instant;
use user_driver::DeviceBacking;
use user_driver::DeviceRegisterIo;
use user_driver::DmaClient;

/// The link state last reported by the control plane.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct LinkState {
    pub up: bool,
    pub speed_mbps: u32,
}

/// An iecm device: its mailbox, the negotiated parameters and the default
/// vport.
pub struct Adapter<T: DeviceBacking> {
    device: T,
    config: IecmConfig,
    regs: Arc<dyn DeviceRegisterIo>,
    dma: Arc<dyn DmaClient>,
    channel: Arc<VirtchnlChannel>,
    negotiator: Negotiator,
    negotiated: Option<Negotiated>,
    vport: Option<Vport>,
    link: LinkState,
    soft_resets: u64,
}

/// Waits for the device to leave reset.
fn wait_for_active(regs: &dyn DeviceRegisterIo, config: &IecmConfig) -> anyhow::Result<()> {
    let deadline = Instant::now() + config.mailbox.timeout;
    loop {
        let state = regs.read_u32(regs::RSTAT) & regs::RSTAT_STATE_MASK;
        if state == regs::RSTAT_ACTIVE {
            return Ok(());
        }
        if Instant::now() >= deadline {
            anyhow::bail!("device stuck in reset state {state}");
        }
        std::thread::sleep(config.mailbox.step_delay);
    }
}

impl<T: DeviceBacking> Adapter<T> {
    /// Brings up the mailbox on `device`. Call [`Self::init`] to negotiate
    /// and create the default vport.
    pub fn new(mut device: T, config: IecmConfig) -> anyhow::Result<Self> {
        config.queues.validate()?;
        let regs: Arc<dyn DeviceRegisterIo> =
            Arc::new(device.map_bar(0).context("failed to map bar 0")?);
        wait_for_active(regs.as_ref(), &config)?;
        let dma = device.dma_client();
        let interrupt = device
            .map_interrupt(0)
            .context("failed to map mailbox interrupt")?;
        let channel = VirtchnlChannel::new(
            dma.as_ref(),
            regs.clone(),
            interrupt,
            config.mailbox.clone(),
        )
        .context("failed to create mailbox")?;
        // Unmask the mailbox interrupt.
        regs.write_u32(
            regs::MBX_DYN_CTL,
            crate::itr::ItrWrite::NONE.dyn_ctl().into_bits(),
        );
        tracing::info!(device = device.id(), "mailbox ready");
        Ok(Self {
            negotiator: Negotiator::new(&config),
            device,
            config,
            regs,
            dma,
            channel: Arc::new(channel),
            negotiated: None,
            vport: None,
            link: LinkState::default(),
            soft_resets: 0,
        })
    }

    /// Negotiates with the control plane and builds the default vport.
    pub fn init(&mut self) -> anyhow::Result<()> {
        let negotiated = self
            .negotiator
            .run_blocking(&self.channel)
            .context("negotiation failed")?;
        let device = &mut self.device;
        let vport = Vport::new(VportParams {
            channel: self.channel.clone(),
            dma: self.dma.clone(),
            regs: self.regs.clone(),
            negotiated: &negotiated,
            config: &self.config,
            map_interrupt: &mut |vector: u32| device.map_interrupt(vector),
        })?;
        self.negotiated = Some(negotiated);
        self.vport = Some(vport);
        Ok(())
    }

    pub fn config(&self) -> &IecmConfig {
        &self.config
    }

    pub fn channel(&self) -> &VirtchnlChannel {
        &self.channel
    }

    pub fn negotiated(&self) -> Option<&Negotiated> {
        self.negotiated.as_ref()
    }

    pub fn vport(&self) -> Option<&Vport> {
        self.vport.as_ref()
    }

    pub fn vport_mut(&mut self) -> Option<&mut Vport> {
        self.vport.as_mut()
    }

    pub fn link(&self) -> LinkState {
        self.link
    }

    pub fn soft_resets(&self) -> u64 {
        self.soft_resets
    }

    /// Handles queued control plane events. A pending reset is carried out
    /// before returning.
    pub fn process_events(&mut self) -> anyhow::Result<()> {
        let mut reset = false;
        for event in self.channel.take_events() {
            match event {
                DeviceEvent::LinkChange {
                    vport_id,
                    up,
                    speed_mbps,
                } => {
                    tracing::info!(vport_id, up, speed_mbps, "link change");
                    self.link = LinkState { up, speed_mbps };
                    let speed = LinkSpeed::from_mbps(speed_mbps);
                    self.config.itr.link_speed = speed;
                    if let Some(vport) = &mut self.vport {
                        vport.set_link_speed(speed);
                    }
                }
                DeviceEvent::ResetImpending => {
                    tracing::warn!("control plane reset impending");
                    reset = true;
                }
                DeviceEvent::Unknown(code) => {
                    tracing::debug!(?code, "ignoring unknown event");
                }
            }
        }
        if reset {
            self.soft_reset()?;
        }
        Ok(())
    }

    /// Tears down the vport, forgets the negotiated state and negotiates
    /// again from the start.
    pub fn soft_reset(&mut self) -> anyhow::Result<()> {
        self.soft_resets += 1;
        tracing::info!(count = self.soft_resets, "soft reset");
        if let Some(mut vport) = self.vport.take() {
            vport.close();
        }
        self.negotiated = None;
        self.negotiator.reset();
        self.channel.drop_stale();
        wait_for_active(self.regs.as_ref(), &self.config)?;
        self.init()
    }

    /// Queries the device counters of the default vport.
    pub fn device_stats(&self) -> anyhow::Result<VportStats> {
        self.vport
            .as_ref()
            .context("no vport")?
            .device_stats()
    }

    /// Releases all device resources and returns the device.
    pub fn shutdown(mut self) -> T {
        if let Some(mut vport) = self.vport.take() {
            vport.close();
        }
        self.channel.shutdown();
        self.device
    }
}
