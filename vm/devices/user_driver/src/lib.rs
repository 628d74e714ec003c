// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Infrastructure for drivers that reach their device through mapped
//! registers, DMA memory and interrupts, without depending on a particular
//! host OS.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod emulated;
pub mod interrupt;
pub mod memory;

use interrupt::DeviceInterrupt;
use memory::DmaMapping;
use memory::MemoryBlock;
use std::sync::Arc;

/// Access to a device and the host resources it needs.
pub trait DeviceBacking: 'static + Send {
    /// An object for accessing device registers.
    type Registers: 'static + DeviceRegisterIo;

    /// Returns a device ID for diagnostics.
    fn id(&self) -> &str;

    /// Maps a BAR.
    fn map_bar(&mut self, n: u8) -> anyhow::Result<Self::Registers>;

    /// Returns the DMA client used to share memory with the device.
    fn dma_client(&self) -> Arc<dyn DmaClient>;

    /// Returns the maximum number of interrupts that can be mapped.
    fn max_interrupt_count(&self) -> u32;

    /// Maps interrupt vector `vector` and returns an event that is signaled
    /// when the device raises it.
    fn map_interrupt(&mut self, vector: u32) -> anyhow::Result<DeviceInterrupt>;
}

/// Access to device registers.
pub trait DeviceRegisterIo: Send + Sync {
    /// Returns the length of the register space.
    fn len(&self) -> usize;

    /// Reads a `u32` register.
    fn read_u32(&self, offset: usize) -> u32;

    /// Writes a `u32` register.
    fn write_u32(&self, offset: usize, data: u32);

    /// Reads a `u64` register as two consecutive `u32` registers.
    fn read_u64(&self, offset: usize) -> u64 {
        self.read_u32(offset) as u64 | (self.read_u32(offset + 4) as u64) << 32
    }

    /// Writes a `u64` register as two consecutive `u32` registers, low half
    /// first.
    fn write_u64(&self, offset: usize, data: u64) {
        self.write_u32(offset, data as u32);
        self.write_u32(offset + 4, (data >> 32) as u32);
    }
}

/// Allocates and maps memory shared with a device.
pub trait DmaClient: Send + Sync {
    /// Allocates zeroed, page-aligned memory that remains visible to the
    /// device for as long as the returned block is alive.
    fn allocate_dma_buffer(&self, len: usize) -> anyhow::Result<MemoryBlock>;

    /// Allocates zeroed host memory that is not visible to the device until
    /// it is mapped with [`DmaClient::map`].
    fn allocate_host_buffer(&self, len: usize) -> anyhow::Result<MemoryBlock>;

    /// Makes `mem` visible to the device until the returned mapping is passed
    /// to [`DmaClient::unmap`].
    fn map(&self, mem: &MemoryBlock) -> anyhow::Result<DmaMapping>;

    /// Releases a mapping created by [`DmaClient::map`].
    fn unmap(&self, mapping: DmaMapping);
}
