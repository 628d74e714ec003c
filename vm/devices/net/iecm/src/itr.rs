// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Adaptive interrupt moderation.
//!
//! Each queue vector keeps one moderation state per direction. After every
//! poll the states are fed the packets and bytes processed, a new target
//! interval is computed, and at most one interval is chosen to be written to
//! the device as part of re-enabling the interrupt. Rx is pushed toward low
//! latency and Tx toward batching.

use crate::config::ItrConfig;
use iecm_defs::regs::DynCtl;
use iecm_defs::regs::ITR_IDX_NONE;
use iecm_defs::regs::ITR_IDX_RX;
use iecm_defs::regs::ITR_IDX_TX;
use std::time::Duration;
use std::time::Instant;

/// Set in a target interval when the direction is in latency mode.
pub const ITR_LATENCY: u16 = 0x8000;
/// The interval bits of a target.
pub const ITR_MASK: u16 = 0x1ffe;
const ITR_BULK: u16 = 0;

/// Samples spaced further apart than this are too sparse to measure, and
/// reset the target to its default.
const ITR_STALE_AFTER: Duration = Duration::from_millis(8);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ItrDir {
    Rx,
    Tx,
}

/// The moderation state of one direction of a queue vector.
#[derive(Debug, Clone)]
pub struct ItrState {
    dir: ItrDir,
    dynamic: bool,
    /// The next interval to program, with [`ITR_LATENCY`] possibly set.
    target: u16,
    /// The interval last programmed.
    current: u16,
    next_update: Option<Instant>,
    packets: u32,
    bytes: u64,
}

impl ItrState {
    pub fn new(dir: ItrDir, config: &ItrConfig) -> Self {
        let (dynamic, static_usecs, initial) = match dir {
            ItrDir::Rx => (
                config.adaptive_rx,
                config.rx_usecs,
                config.min_usecs | ITR_LATENCY,
            ),
            ItrDir::Tx => (
                config.adaptive_tx,
                config.tx_usecs,
                config.max_usecs | ITR_LATENCY,
            ),
        };
        let itr = if dynamic { initial } else { static_usecs };
        Self {
            dir,
            dynamic,
            target: itr,
            current: itr,
            next_update: None,
            packets: 0,
            bytes: 0,
        }
    }

    pub fn dir(&self) -> ItrDir {
        self.dir
    }

    pub fn target(&self) -> u16 {
        self.target
    }

    pub fn current(&self) -> u16 {
        self.current
    }

    /// The target interval in usecs.
    pub fn usecs(&self) -> u16 {
        self.target & ITR_MASK
    }

    pub fn is_latency(&self) -> bool {
        self.target & ITR_LATENCY != 0
    }

    /// Accumulates work done since the last update.
    pub fn record(&mut self, packets: u32, bytes: u64) {
        self.packets = self.packets.saturating_add(packets);
        self.bytes = self.bytes.saturating_add(bytes);
    }

    fn clamp(config: &ItrConfig, itr: u16) -> u16 {
        if itr & ITR_MASK > config.max_usecs {
            (itr & ITR_LATENCY) + config.max_usecs
        } else {
            itr
        }
    }

    /// Computes the next target from the accumulated sample. `companion` is
    /// the state of the other direction of the same vector.
    pub fn next_target(&self, config: &ItrConfig, companion: &ItrState) -> u16 {
        let packets = self.packets;
        let bytes = self.bytes;
        match self.dir {
            ItrDir::Rx
                if packets > 0
                    && packets < config.latency_packets
                    && bytes < config.latency_bytes
                    && !companion.is_latency() =>
            {
                return self.by_size(config, ITR_LATENCY, packets, bytes);
            }
            ItrDir::Tx
                if packets < config.latency_packets
                    && self.target == config.max_usecs
                    && companion.target & ITR_MASK == config.max_usecs =>
            {
                return config.min_usecs | ITR_LATENCY;
            }
            _ => {}
        }

        // Too many packets in one poll for latency mode.
        let prev = if packets > config.bulk_packets {
            self.target & !ITR_LATENCY
        } else {
            self.target
        };

        if packets < config.small_packets {
            return Self::clamp(config, prev + config.min_inc);
        }

        if packets <= config.halve_packets {
            let itr = self.current.min(companion.current) & ITR_MASK;
            if packets <= config.goldilocks_packets {
                return itr;
            }
            return ((itr / 2) & ITR_MASK).max(config.min_usecs);
        }

        self.by_size(config, ITR_BULK, packets, bytes)
    }

    fn by_size(&self, config: &ItrConfig, itr: u16, packets: u32, bytes: u64) -> u16 {
        let avg = (bytes / packets as u64) as u32;
        let mut size = if avg <= config.small_size {
            config.small_value
        } else {
            config
                .bands
                .iter()
                .find(|band| avg <= band.max_size)
                .map_or(config.large_value, |band| avg * band.mul + band.add)
        };
        if itr & ITR_LATENCY != 0 {
            size /= 2;
        }
        let steps = size.div_ceil(config.divisor()) as u16;
        Self::clamp(config, itr + steps * config.min_inc)
    }

    /// Commits a new target for this poll and clears the sample.
    fn update(&mut self, config: &ItrConfig, companion: &ItrState, countdown: u8, now: Instant) {
        if self.dynamic {
            self.target = if countdown > 0 {
                self.target
            } else if self.next_update.is_some_and(|next| now > next) {
                config.min_usecs | ITR_LATENCY
            } else {
                self.next_target(config, companion)
            };
        }
        self.next_update = Some(now + ITR_STALE_AFTER);
        self.packets = 0;
        self.bytes = 0;
    }
}

/// The interval change chosen for one interrupt re-enable.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ItrWrite {
    pub index: u8,
    pub usecs: u16,
}

impl ItrWrite {
    pub const NONE: Self = Self {
        index: ITR_IDX_NONE,
        usecs: 0,
    };

    /// The dynamic control value that re-enables the interrupt and applies
    /// this change.
    pub fn dyn_ctl(self) -> DynCtl {
        DynCtl::new()
            .with_intena(true)
            .with_clearpba(true)
            .with_itr_indx(self.index)
            .with_interval(self.usecs >> 1)
    }
}

/// The moderation state of a queue vector.
#[derive(Debug, Clone)]
pub struct VectorItr {
    pub rx: ItrState,
    pub tx: ItrState,
    /// Polls left during which targets are held steady after a write.
    countdown: u8,
}

impl VectorItr {
    pub fn new(config: &ItrConfig) -> Self {
        Self {
            rx: ItrState::new(ItrDir::Rx, config),
            tx: ItrState::new(ItrDir::Tx, config),
            countdown: 0,
        }
    }

    pub fn countdown(&self) -> u8 {
        self.countdown
    }

    /// Updates both directions from their samples and picks the interval,
    /// if any, to write when re-enabling the interrupt. Must be called once
    /// per poll.
    pub fn update(&mut self, config: &ItrConfig, now: Instant) -> ItrWrite {
        let rx = self.rx.clone();
        self.tx.update(config, &rx, self.countdown, now);
        let tx = self.tx.clone();
        self.rx.update(config, &tx, self.countdown, now);

        let rx = &mut self.rx;
        let tx = &mut self.tx;
        let write = if rx.target < rx.current {
            rx.current = rx.target;
            ItrWrite {
                index: ITR_IDX_RX,
                usecs: rx.target & ITR_MASK,
            }
        } else if tx.target < tx.current
            || rx.target.wrapping_sub(rx.current) < tx.target.wrapping_sub(tx.current)
        {
            tx.current = tx.target;
            ItrWrite {
                index: ITR_IDX_TX,
                usecs: tx.target & ITR_MASK,
            }
        } else if rx.current != rx.target {
            rx.current = rx.target;
            ItrWrite {
                index: ITR_IDX_RX,
                usecs: rx.target & ITR_MASK,
            }
        } else {
            self.countdown = self.countdown.saturating_sub(1);
            return ItrWrite::NONE;
        };
        self.countdown = config.countdown_start;
        write
    }
}

#[cfg(test)]
mod tests {
    use super::ITR_LATENCY;
    use super::ITR_MASK;
    use super::ItrDir;
    use super::ItrState;
    use super::ItrWrite;
    use super::VectorItr;
    use crate::config::ItrConfig;
    use crate::config::LinkSpeed;
    use iecm_defs::regs::ITR_IDX_NONE;
    use iecm_defs::regs::ITR_IDX_RX;
    use iecm_defs::regs::ITR_IDX_TX;
    use std::time::Duration;
    use std::time::Instant;

    fn bulk_tx(config: &ItrConfig) -> ItrState {
        let mut tx = ItrState::new(ItrDir::Tx, config);
        tx.target = 118;
        tx.current = 118;
        tx
    }

    #[test]
    fn sparse_rx_follows_bulk_tx_into_latency_mode() {
        let config = ItrConfig::default();
        let tx = bulk_tx(&config);
        let mut rx = ItrState::new(ItrDir::Rx, &config);
        rx.target = 50;
        rx.record(2, 128);
        // 64 byte average: (64 * 40 + 1696) / 2, in steps of 512 at 10G.
        assert_eq!(rx.next_target(&config, &tx), ITR_LATENCY | 10);

        // A latency mode Tx companion leaves Rx on the regular path.
        let latency_tx = ItrState::new(ItrDir::Tx, &config);
        assert_eq!(rx.next_target(&config, &latency_tx), 52);
    }

    #[test]
    fn packet_count_bands() {
        let config = ItrConfig::default();
        let tx = bulk_tx(&config);
        let mut rx = ItrState::new(ItrDir::Rx, &config);
        rx.target = ITR_LATENCY | 20;
        rx.current = 40;

        let sample = |rx: &mut ItrState, packets: u32| {
            rx.packets = packets;
            rx.bytes = packets as u64 * 1500;
        };

        // Many packets leave latency mode before creeping up.
        sample(&mut rx, 40);
        assert_eq!(rx.next_target(&config, &tx), 20 + config.min_inc);

        // Goldilocks: keep the smaller current interval.
        sample(&mut rx, 100);
        assert_eq!(rx.next_target(&config, &tx), 40);

        sample(&mut rx, 200);
        assert_eq!(rx.next_target(&config, &tx), 20);

        // Bulk: 1500 byte average maps to 29920, 59 steps of 512.
        sample(&mut rx, 1000);
        assert_eq!(rx.next_target(&config, &tx), 118);
    }

    #[test]
    fn targets_clamp_to_max() {
        let config = ItrConfig {
            link_speed: LinkSpeed::Speed1G,
            ..Default::default()
        };
        let tx = bulk_tx(&config);
        let mut rx = ItrState::new(ItrDir::Rx, &config);
        rx.record(1000, 1000 * 9000);
        assert_eq!(rx.next_target(&config, &tx), config.max_usecs);
        rx.target = ITR_LATENCY | config.max_usecs;
        rx.packets = 1;
        assert_eq!(rx.next_target(&config, &bulk_tx(&config)) & ITR_MASK, config.max_usecs);
    }

    #[test]
    fn writes_are_spaced_by_countdown() {
        let config = ItrConfig::default();
        let mut itr = VectorItr::new(&config);
        let start = Instant::now();
        let mut now = start;

        itr.tx.record(1000, 1000 * 1500);
        let write = itr.update(&config, now);
        assert_eq!(
            write,
            ItrWrite {
                index: ITR_IDX_TX,
                usecs: 118
            }
        );
        assert_eq!(itr.countdown(), config.countdown_start);
        assert_eq!(write.dyn_ctl().interval(), 59);
        assert!(write.dyn_ctl().intena());

        // Targets are held while counting down, and writes still drain the
        // difference left on the Rx side.
        for _ in 0..10 {
            now += Duration::from_millis(1);
            itr.tx.record(1, 100);
            itr.update(&config, now);
            assert_eq!(itr.tx.target(), 118);
            if itr.countdown() == 0 {
                break;
            }
        }
        assert_eq!(itr.countdown(), 0);
        assert_eq!(ItrWrite::NONE.dyn_ctl().itr_indx(), ITR_IDX_NONE);
    }

    #[test]
    fn stale_samples_reset_target() {
        let config = ItrConfig::default();
        let mut itr = VectorItr::new(&config);
        let now = Instant::now();
        itr.rx.record(1000, 1000 * 1500);
        assert_eq!(itr.update(&config, now).index, ITR_IDX_RX);
        assert_eq!(itr.rx.target(), 118);
        itr.countdown = 0;
        let write = itr.update(&config, now + Duration::from_secs(1));
        assert_eq!(write.index, ITR_IDX_TX);
        assert_eq!(itr.rx.target(), config.min_usecs | ITR_LATENCY);
    }

    #[test]
    fn static_intervals_never_change() {
        let config = ItrConfig {
            adaptive_rx: false,
            adaptive_tx: false,
            ..Default::default()
        };
        let mut itr = VectorItr::new(&config);
        itr.rx.record(1000, 1000 * 1500);
        let write = itr.update(&config, Instant::now());
        assert_eq!(write, ItrWrite::NONE);
        assert_eq!(itr.rx.usecs(), config.rx_usecs);
        assert_eq!(itr.rx.target(), itr.rx.current());
    }
}
