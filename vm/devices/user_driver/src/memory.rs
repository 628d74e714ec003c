// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Types for sharing host memory with the device.

use std::sync::Arc;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering::Relaxed;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// The 4KB page size used by user-mode devices.
pub const PAGE_SIZE: usize = 4096;
#[expect(missing_docs)]
pub const PAGE_SIZE32: u32 = 4096;
#[expect(missing_docs)]
pub const PAGE_SIZE64: u64 = PAGE_SIZE as u64;

/// Rounds `len` up to a whole number of pages.
pub const fn page_round_up(len: usize) -> usize {
    len.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

/// Backing storage for one allocation.
pub(crate) struct DmaRegion {
    bytes: Box<[AtomicU8]>,
    iova: u64,
}

impl DmaRegion {
    pub(crate) fn new(iova: u64, len: usize) -> Self {
        Self {
            bytes: (0..len).map(|_| AtomicU8::new(0)).collect(),
            iova,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.bytes.len()
    }

    pub(crate) fn iova(&self) -> u64 {
        self.iova
    }
}

/// A view of memory that can be accessed by both the host and the device.
///
/// Every access is a sequence of relaxed per-byte atomic operations, so the
/// host and the device may touch the same bytes concurrently. Ordering
/// between the two sides is established with explicit fences by the users.
#[derive(Clone)]
pub struct MemoryBlock {
    region: Arc<DmaRegion>,
    offset: usize,
    len: usize,
}

impl std::fmt::Debug for MemoryBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBlock")
            .field("iova", &format_args!("{:#x}", self.iova()))
            .field("len", &self.len)
            .finish()
    }
}

impl MemoryBlock {
    pub(crate) fn from_region(region: Arc<DmaRegion>) -> Self {
        let len = region.len();
        Self {
            region,
            offset: 0,
            len,
        }
    }

    pub(crate) fn region(&self) -> &Arc<DmaRegion> {
        &self.region
    }

    /// Returns a view of a subset of the buffer.
    ///
    /// Panics if the range is out of bounds.
    pub fn subblock(&self, offset: usize, len: usize) -> Self {
        assert!(offset <= self.len && self.len - offset >= len);
        Self {
            region: self.region.clone(),
            offset: self.offset + offset,
            len,
        }
    }

    /// Gets the length of the buffer in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The address the device uses to reach the first byte of this view.
    pub fn iova(&self) -> u64 {
        self.region.iova + self.offset as u64
    }

    /// Returns the offset of the beginning of the buffer in its page.
    pub fn offset_in_page(&self) -> u32 {
        (self.iova() % PAGE_SIZE as u64) as u32
    }

    /// Returns true if both views refer to the same underlying allocation.
    pub fn same_allocation(&self, other: &MemoryBlock) -> bool {
        Arc::ptr_eq(&self.region, &other.region)
    }

    /// Gets the buffer as an atomic slice.
    pub fn as_slice(&self) -> &[AtomicU8] {
        &self.region.bytes[self.offset..][..self.len]
    }

    /// Reads from the buffer into `data`.
    pub fn read_at(&self, offset: usize, data: &mut [u8]) {
        let len = data.len();
        for (d, s) in data.iter_mut().zip(&self.as_slice()[offset..][..len]) {
            *d = s.load(Relaxed);
        }
    }

    /// Reads an object from the buffer at `offset`.
    pub fn read_obj<T: FromBytes + IntoBytes + Immutable + KnownLayout>(&self, offset: usize) -> T {
        let mut obj = T::new_zeroed();
        self.read_at(offset, obj.as_mut_bytes());
        obj
    }

    /// Writes into the buffer from `data`.
    pub fn write_at(&self, offset: usize, data: &[u8]) {
        for (d, s) in self.as_slice()[offset..][..data.len()].iter().zip(data) {
            d.store(*s, Relaxed);
        }
    }

    /// Writes an object into the buffer at `offset`.
    pub fn write_obj<T: IntoBytes + Immutable + KnownLayout>(&self, offset: usize, data: &T) {
        self.write_at(offset, data.as_bytes());
    }

    /// Fills `len` bytes starting at `offset` with `value`.
    pub fn fill_at(&self, offset: usize, len: usize, value: u8) {
        for b in &self.as_slice()[offset..][..len] {
            b.store(value, Relaxed);
        }
    }

    /// Copies the whole view into a new vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut v = vec![0; self.len];
        self.read_at(0, &mut v);
        v
    }
}

/// A streaming mapping of host memory for device access.
///
/// Must be released with [`DmaClient::unmap`](crate::DmaClient::unmap).
#[derive(Debug, PartialEq, Eq)]
#[must_use]
pub struct DmaMapping {
    iova: u64,
    len: usize,
}

impl DmaMapping {
    pub(crate) fn new(iova: u64, len: usize) -> Self {
        Self { iova, len }
    }

    /// The device address of the mapped memory.
    pub fn iova(&self) -> u64 {
        self.iova
    }

    /// The length of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the mapping covers no bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
