// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! This implements the user-mode driver device traits using an in-process
//! device model.

use crate::DeviceBacking;
use crate::DeviceRegisterIo;
use crate::DmaClient;
use crate::interrupt::DeviceInterrupt;
use crate::interrupt::DeviceInterruptSource;
use crate::memory::DmaMapping;
use crate::memory::DmaRegion;
use crate::memory::MemoryBlock;
use crate::memory::PAGE_SIZE64;
use crate::memory::page_round_up;
use anyhow::Context;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Relaxed;

/// The device addresses handed out by [`EmulatedDma`] start here, so that a
/// zero address in a descriptor is never valid.
const IOVA_BASE: u64 = 0x1_0000_0000;

/// A device model reachable through 32-bit register accesses.
pub trait EmulatedMmio: Send {
    /// Reads the register at `offset` in BAR `bar`.
    fn mmio_read(&mut self, bar: u8, offset: u64) -> u32;
    /// Writes the register at `offset` in BAR `bar`.
    fn mmio_write(&mut self, bar: u8, offset: u64, data: u32);
}

/// The set of interrupt lines of an emulated device.
pub struct InterruptLines {
    sources: Vec<DeviceInterruptSource>,
}

impl InterruptLines {
    /// Creates `count` interrupt lines.
    pub fn new(count: usize) -> Arc<Self> {
        Arc::new(Self {
            sources: (0..count).map(|_| DeviceInterruptSource::new()).collect(),
        })
    }

    /// The number of lines.
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Returns true if there are no lines.
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Raises line `index`.
    pub fn signal(&self, index: usize) {
        if let Some(source) = self.sources.get(index) {
            tracing::trace!(index, "signaling interrupt");
            source.signal();
        } else {
            tracing::info!(index, "interrupt ignored");
        }
    }
}

/// An emulated device.
pub struct EmulatedDevice<T> {
    device: Arc<Mutex<T>>,
    dma: Arc<EmulatedDma>,
    interrupts: Arc<InterruptLines>,
}

impl<T: EmulatedMmio> EmulatedDevice<T> {
    /// Creates a new emulated device, wrapping `device`. The device model is
    /// expected to reach driver memory through `dma` and raise interrupts
    /// through `interrupts`.
    pub fn new(device: T, dma: Arc<EmulatedDma>, interrupts: Arc<InterruptLines>) -> Self {
        Self {
            device: Arc::new(Mutex::new(device)),
            dma,
            interrupts,
        }
    }

    /// Runs `f` with exclusive access to the device model.
    pub fn with_device<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.device.lock())
    }

    /// Returns a shared handle to the device model.
    pub fn device(&self) -> Arc<Mutex<T>> {
        self.device.clone()
    }
}

/// A register mapping for an [`EmulatedDevice`].
pub struct Mapping<T> {
    device: Arc<Mutex<T>>,
    bar: u8,
}

impl<T: 'static + EmulatedMmio> DeviceBacking for EmulatedDevice<T> {
    type Registers = Mapping<T>;

    fn id(&self) -> &str {
        "emulated"
    }

    fn map_bar(&mut self, n: u8) -> anyhow::Result<Self::Registers> {
        Ok(Mapping {
            device: self.device.clone(),
            bar: n,
        })
    }

    fn dma_client(&self) -> Arc<dyn DmaClient> {
        self.dma.clone()
    }

    fn max_interrupt_count(&self) -> u32 {
        self.interrupts.len() as u32
    }

    fn map_interrupt(&mut self, vector: u32) -> anyhow::Result<DeviceInterrupt> {
        Ok(self
            .interrupts
            .sources
            .get(vector as usize)
            .with_context(|| format!("invalid interrupt vector {vector}"))?
            .new_target())
    }
}

impl<T: EmulatedMmio> DeviceRegisterIo for Mapping<T> {
    fn len(&self) -> usize {
        u32::MAX as usize
    }

    fn read_u32(&self, offset: usize) -> u32 {
        self.device.lock().mmio_read(self.bar, offset as u64)
    }

    fn write_u32(&self, offset: usize, data: u32) {
        self.device.lock().mmio_write(self.bar, offset as u64, data)
    }
}

struct RegionEntry {
    region: Weak<DmaRegion>,
    coherent: bool,
    mappings: u32,
}

#[derive(Default)]
struct DmaState {
    next_iova: u64,
    regions: BTreeMap<u64, RegionEntry>,
}

/// Counters kept by [`EmulatedDma`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DmaStats {
    /// Successful calls to `map`.
    pub maps: u64,
    /// Calls to `unmap`.
    pub unmaps: u64,
    /// Calls to `unmap` for memory that had no live mapping.
    pub bad_unmaps: u64,
}

/// A [`DmaClient`] backed by heap memory, with an address table that lets a
/// device model resolve device addresses the way an IOMMU would.
pub struct EmulatedDma {
    state: Mutex<DmaState>,
    fail_allocations: AtomicU32,
    fail_maps: AtomicU32,
    maps: AtomicU64,
    unmaps: AtomicU64,
    bad_unmaps: AtomicU64,
}

impl EmulatedDma {
    /// Creates a new, empty address space.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(DmaState {
                next_iova: IOVA_BASE,
                regions: BTreeMap::new(),
            }),
            fail_allocations: AtomicU32::new(0),
            fail_maps: AtomicU32::new(0),
            maps: AtomicU64::new(0),
            unmaps: AtomicU64::new(0),
            bad_unmaps: AtomicU64::new(0),
        })
    }

    /// Makes the next `n` allocations fail.
    pub fn fail_next_allocations(&self, n: u32) {
        self.fail_allocations.store(n, Relaxed);
    }

    /// Makes the next `n` map requests fail.
    pub fn fail_next_maps(&self, n: u32) {
        self.fail_maps.store(n, Relaxed);
    }

    /// Returns the map/unmap counters.
    pub fn stats(&self) -> DmaStats {
        DmaStats {
            maps: self.maps.load(Relaxed),
            unmaps: self.unmaps.load(Relaxed),
            bad_unmaps: self.bad_unmaps.load(Relaxed),
        }
    }

    /// Returns the number of host allocations that currently have at least
    /// one live mapping.
    pub fn mapped_regions(&self) -> usize {
        self.state
            .lock()
            .regions
            .values()
            .filter(|e| e.mappings > 0 && e.region.strong_count() > 0)
            .count()
    }

    /// Resolves `len` bytes at device address `iova`, as the device would see
    /// them. Returns `None` if any part of the range is not currently visible
    /// to the device.
    pub fn resolve(&self, iova: u64, len: usize) -> Option<MemoryBlock> {
        let state = self.state.lock();
        let (&base, entry) = state.regions.range(..=iova).next_back()?;
        if !entry.coherent && entry.mappings == 0 {
            return None;
        }
        let region = entry.region.upgrade()?;
        let offset = (iova - base) as usize;
        if offset.checked_add(len)? > region.len() {
            return None;
        }
        Some(MemoryBlock::from_region(region).subblock(offset, len))
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Relaxed, Relaxed, |n| n.checked_sub(1))
            .is_ok()
    }

    fn allocate(&self, len: usize, coherent: bool) -> anyhow::Result<MemoryBlock> {
        if Self::take_failure(&self.fail_allocations) {
            anyhow::bail!("out of memory");
        }
        let len = page_round_up(len.max(1));
        let mut state = self.state.lock();
        // Drop entries for freed memory so the table does not grow forever.
        state.regions.retain(|_, e| e.region.strong_count() > 0);
        let iova = state.next_iova;
        // Leave a guard page between allocations.
        state.next_iova += len as u64 + PAGE_SIZE64;
        let region = Arc::new(DmaRegion::new(iova, len));
        state.regions.insert(
            iova,
            RegionEntry {
                region: Arc::downgrade(&region),
                coherent,
                mappings: 0,
            },
        );
        Ok(MemoryBlock::from_region(region))
    }
}

impl DmaClient for EmulatedDma {
    fn allocate_dma_buffer(&self, len: usize) -> anyhow::Result<MemoryBlock> {
        self.allocate(len, true)
    }

    fn allocate_host_buffer(&self, len: usize) -> anyhow::Result<MemoryBlock> {
        self.allocate(len, false)
    }

    fn map(&self, mem: &MemoryBlock) -> anyhow::Result<DmaMapping> {
        if Self::take_failure(&self.fail_maps) {
            anyhow::bail!("iommu mapping failed");
        }
        let base = mem.region().iova();
        let mut state = self.state.lock();
        let entry = state
            .regions
            .get_mut(&base)
            .filter(|e| e.region.ptr_eq(&Arc::downgrade(mem.region())))
            .context("memory was not allocated by this client")?;
        entry.mappings += 1;
        self.maps.fetch_add(1, Relaxed);
        Ok(DmaMapping::new(mem.iova(), mem.len()))
    }

    fn unmap(&self, mapping: DmaMapping) {
        self.unmaps.fetch_add(1, Relaxed);
        let mut state = self.state.lock();
        let entry = state
            .regions
            .range_mut(..=mapping.iova())
            .next_back()
            .map(|(_, e)| e)
            .filter(|e| e.mappings > 0);
        match entry {
            Some(entry) => entry.mappings -= 1,
            None => {
                self.bad_unmaps.fetch_add(1, Relaxed);
                tracing::error!(iova = mapping.iova(), "unmap of memory with no mapping");
            }
        }
    }
}
