// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Receive page recycling and transmit buffer record bookkeeping.

use crate::error::TxError;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use user_driver::DmaClient;
use user_driver::memory::DmaMapping;
use user_driver::memory::MemoryBlock;

/// The driver's share of a fresh page's reference count. Handing a fragment
/// to the stack draws one reference from this bias instead of touching the
/// shared count.
const PAGECNT_BIAS_MAX: u32 = 0xffff;

/// Bytes reserved per header buffer when header split is enabled.
pub const RX_HDR_BUF_SIZE: usize = 256;

/// Pages at or above this size are carved into consecutive buffers instead
/// of being flipped between two halves.
const LARGE_PAGE_THRESHOLD: u32 = 8192;
const LARGE_PAGE_BUF_SIZE: u32 = 3072;

/// A host page backing receive buffers.
pub struct RxPage {
    mem: MemoryBlock,
    refs: AtomicU32,
    node_local: bool,
    pfmemalloc: bool,
}

impl RxPage {
    /// The current reference count, covering the driver's bias and every
    /// fragment held by the stack.
    pub fn ref_count(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    pub fn memory(&self) -> &MemoryBlock {
        &self.mem
    }
}

/// A zero-copy slice of a receive page owned by the network stack. Dropping
/// it returns the reference to the page.
pub struct RxFrag {
    page: Arc<RxPage>,
    offset: u32,
    len: u32,
}

impl RxFrag {
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends the fragment's bytes to `out`.
    pub fn copy_to(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.resize(start + self.len as usize, 0);
        self.page
            .mem
            .read_at(self.offset as usize, &mut out[start..]);
    }

    pub fn page(&self) -> &Arc<RxPage> {
        &self.page
    }
}

impl std::fmt::Debug for RxFrag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RxFrag")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

impl Drop for RxFrag {
    fn drop(&mut self) {
        self.page.refs.fetch_sub(1, Ordering::AcqRel);
    }
}

struct OwnedPage {
    page: Arc<RxPage>,
    mapping: DmaMapping,
    offset: u32,
    bias: u32,
}

/// One receive buffer slot.
#[derive(Default)]
pub struct RxBuf {
    page: Option<OwnedPage>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RxPoolStats {
    pub page_allocs: u64,
    pub page_reuses: u64,
    pub page_releases: u64,
    pub alloc_failures: u64,
}

/// The receive buffers of one buffer queue (split model) or one receive
/// queue (single model), indexed by buffer id.
pub struct RxBufPool {
    dma: Arc<dyn DmaClient>,
    bufs: Vec<RxBuf>,
    page_size: u32,
    buf_size: u32,
    hdr: Option<MemoryBlock>,
    stats: RxPoolStats,
}

impl RxBufPool {
    /// Creates a pool of `count` buffers carved from pages of `page_size`
    /// bytes. Pages are allocated lazily by [`Self::acquire_page`]. When
    /// `hsplit` is set, a coherent block of header buffers is allocated up
    /// front.
    pub fn new(
        dma: Arc<dyn DmaClient>,
        count: u16,
        page_size: u32,
        hsplit: bool,
    ) -> anyhow::Result<Self> {
        let buf_size = if page_size < LARGE_PAGE_THRESHOLD {
            page_size / 2
        } else {
            LARGE_PAGE_BUF_SIZE
        };
        let hdr = if hsplit {
            Some(dma.allocate_dma_buffer(count as usize * RX_HDR_BUF_SIZE)?)
        } else {
            None
        };
        Ok(Self {
            dma,
            bufs: (0..count).map(|_| RxBuf::default()).collect(),
            page_size,
            buf_size,
            hdr,
            stats: RxPoolStats::default(),
        })
    }

    pub fn len(&self) -> usize {
        self.bufs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bufs.is_empty()
    }

    /// The size of each receive buffer, as programmed into the device.
    pub fn buf_size(&self) -> u32 {
        self.buf_size
    }

    pub fn stats(&self) -> RxPoolStats {
        self.stats
    }

    fn small_pages(&self) -> bool {
        self.page_size < LARGE_PAGE_THRESHOLD
    }

    /// Ensures buffer `id` owns a mapped page. Returns true right away if it
    /// still owns a recycled page. Returns false if a page could not be
    /// allocated or mapped; the caller should stop replenishing and try
    /// again later.
    pub fn acquire_page(&mut self, id: u16) -> bool {
        let buf = &mut self.bufs[id as usize];
        if buf.page.is_some() {
            return true;
        }
        let mem = match self.dma.allocate_host_buffer(self.page_size as usize) {
            Ok(mem) => mem,
            Err(err) => {
                self.stats.alloc_failures += 1;
                tracing::trace!(
                    error = err.as_ref() as &dyn std::error::Error,
                    "rx page allocation failed"
                );
                return false;
            }
        };
        let mapping = match self.dma.map(&mem) {
            Ok(mapping) => mapping,
            Err(err) => {
                self.stats.alloc_failures += 1;
                tracing::trace!(
                    error = err.as_ref() as &dyn std::error::Error,
                    "rx page mapping failed"
                );
                return false;
            }
        };
        self.stats.page_allocs += 1;
        buf.page = Some(OwnedPage {
            page: Arc::new(RxPage {
                mem,
                refs: AtomicU32::new(PAGECNT_BIAS_MAX),
                node_local: true,
                pfmemalloc: false,
            }),
            mapping,
            offset: 0,
            bias: PAGECNT_BIAS_MAX,
        });
        true
    }

    pub fn has_page(&self, id: u16) -> bool {
        self.bufs[id as usize].page.is_some()
    }

    /// The device address of buffer `id`, if it owns a page.
    pub fn dma_addr(&self, id: u16) -> Option<u64> {
        let owned = self.bufs[id as usize].page.as_ref()?;
        Some(owned.mapping.iova() + owned.offset as u64)
    }

    /// The device address of header buffer `id`.
    pub fn hdr_addr(&self, id: u16) -> Option<u64> {
        self.hdr
            .as_ref()
            .map(|hdr| hdr.iova() + (id as usize * RX_HDR_BUF_SIZE) as u64)
    }

    /// Copies `len` bytes of header buffer `id` into `out`.
    pub fn copy_header(&self, id: u16, len: usize, out: &mut Vec<u8>) {
        if let Some(hdr) = &self.hdr {
            let len = len.min(RX_HDR_BUF_SIZE);
            let start = out.len();
            out.resize(start + len, 0);
            hdr.read_at(id as usize * RX_HDR_BUF_SIZE, &mut out[start..]);
        }
    }

    /// Copies `len` bytes at `offset` within buffer `id` into `out`.
    pub fn copy_data(&self, id: u16, offset: u32, len: u32, out: &mut Vec<u8>) {
        if let Some(owned) = &self.bufs[id as usize].page {
            let start = out.len();
            out.resize(start + len as usize, 0);
            owned
                .page
                .mem
                .read_at((owned.offset + offset) as usize, &mut out[start..]);
        }
    }

    /// Hands `len` bytes at `offset` within buffer `id` to the stack as a
    /// zero-copy fragment.
    pub fn take_fragment(&mut self, id: u16, offset: u32, len: u32) -> Option<RxFrag> {
        let owned = self.bufs[id as usize].page.as_mut()?;
        owned.bias -= 1;
        Some(RxFrag {
            page: owned.page.clone(),
            offset: owned.offset + offset,
            len,
        })
    }

    /// Decides whether buffer `id` may keep its page for the next receive,
    /// topping the bias back up when it has been drawn down.
    pub fn can_reuse(&mut self, id: u16) -> bool {
        let small = self.small_pages();
        let last_offset = self.page_size - self.buf_size;
        let Some(owned) = self.bufs[id as usize].page.as_mut() else {
            return false;
        };
        if !owned.page.node_local || owned.page.pfmemalloc {
            return false;
        }
        if small {
            // Only reuse if the stack holds nothing but the fragment just
            // handed to it.
            if owned.page.refs.load(Ordering::Acquire) - owned.bias > 1 {
                return false;
            }
        } else if owned.offset + self.buf_size > last_offset {
            return false;
        }
        if owned.bias == 1 {
            owned
                .page
                .refs
                .fetch_add(PAGECNT_BIAS_MAX - 1, Ordering::AcqRel);
            owned.bias = PAGECNT_BIAS_MAX;
        }
        true
    }

    /// Returns buffer `id` after a receive: either moves it to the unused
    /// part of its page or releases the page.
    pub fn put_buffer(&mut self, id: u16) {
        if self.can_reuse(id) {
            let small = self.small_pages();
            let buf_size = self.buf_size;
            if let Some(owned) = self.bufs[id as usize].page.as_mut() {
                if small {
                    owned.offset ^= buf_size;
                } else {
                    owned.offset += buf_size;
                }
            }
            self.stats.page_reuses += 1;
        } else {
            self.release(id);
        }
    }

    /// Unmaps and drops the page of buffer `id`. Fragments still held by the
    /// stack keep the memory alive.
    pub fn release(&mut self, id: u16) {
        if let Some(owned) = self.bufs[id as usize].page.take() {
            self.dma.unmap(owned.mapping);
            owned.page.refs.fetch_sub(owned.bias, Ordering::AcqRel);
            self.stats.page_releases += 1;
        }
    }

    /// Releases every page.
    pub fn release_all(&mut self) {
        for id in 0..self.bufs.len() {
            self.release(id as u16);
        }
    }

    /// The page currently owned by buffer `id`.
    pub fn page(&self, id: u16) -> Option<&Arc<RxPage>> {
        self.bufs[id as usize].page.as_ref().map(|o| &o.page)
    }

    #[cfg(test)]
    pub(crate) fn mark_remote(&mut self, id: u16) {
        if let Some(owned) = self.bufs[id as usize].page.as_mut() {
            let remote = Arc::new(RxPage {
                mem: owned.page.mem.clone(),
                refs: AtomicU32::new(owned.page.refs.load(Ordering::Acquire)),
                node_local: false,
                pfmemalloc: owned.page.pfmemalloc,
            });
            owned.page = remote;
        }
    }
}

impl Drop for RxBufPool {
    fn drop(&mut self) {
        self.release_all();
    }
}

/// An identifier the owner of a transmitted packet uses to recognize its
/// completion.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TxId(pub u64);

/// Bookkeeping for one mapped fragment of an in-flight packet. The record of
/// a packet's first fragment also carries the packet totals.
#[derive(Default)]
pub struct TxBuf {
    pub(crate) mapping: Option<DmaMapping>,
    pub(crate) mem: Option<MemoryBlock>,
    pub(crate) first: Option<TxFirst>,
    pub(crate) compl_tag: u16,
}

/// Totals kept in the record of a packet's first fragment.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TxFirst {
    pub id: TxId,
    pub bytes: u32,
    pub segs: u16,
    /// Ring index of the packet's last descriptor.
    pub last: u16,
}

impl TxBuf {
    pub fn is_empty(&self) -> bool {
        self.mapping.is_none() && self.first.is_none()
    }

    /// Unmaps the fragment and clears the record, returning the packet
    /// totals if this was the first record of a packet.
    pub(crate) fn release(&mut self, dma: &dyn DmaClient) -> Option<TxFirst> {
        if let Some(mapping) = self.mapping.take() {
            dma.unmap(mapping);
        }
        self.mem = None;
        self.compl_tag = 0;
        self.first.take()
    }
}

/// A fixed-capacity LIFO of spare buffer records, used to hold records of
/// flow scheduled packets whose descriptors were reclaimed before their
/// completion arrived.
pub struct TxBufStack {
    bufs: Vec<TxBuf>,
    capacity: usize,
}

impl TxBufStack {
    /// Creates a stack holding `capacity` empty records.
    pub fn new(capacity: usize) -> Self {
        Self {
            bufs: (0..capacity).map(|_| TxBuf::default()).collect(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.bufs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bufs.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Takes a record. An empty stack means a record leaked.
    pub fn pop(&mut self) -> Result<TxBuf, TxError> {
        self.bufs.pop().ok_or(TxError::OutOfBuffers)
    }

    /// Returns a record.
    pub fn push(&mut self, buf: TxBuf) {
        debug_assert!(buf.is_empty());
        debug_assert!(self.bufs.len() < self.capacity);
        self.bufs.push(buf);
    }
}

/// Buffer records of flow scheduled packets that left the ring, keyed by
/// completion tag.
///
/// The bucket count is fixed at creation and each bucket's storage grows
/// only to the most records it has held, so the steady state does not
/// allocate.
pub struct TagTable {
    buckets: Vec<Vec<TxBuf>>,
    mask: u16,
    len: usize,
}

impl TagTable {
    /// Creates a table for tags whose low bits index a ring of `count`
    /// descriptors.
    pub fn new(count: u16) -> Self {
        let buckets = (count as usize).next_power_of_two();
        Self {
            buckets: (0..buckets).map(|_| Vec::new()).collect(),
            mask: (buckets - 1) as u16,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn insert(&mut self, buf: TxBuf) {
        self.buckets[(buf.compl_tag & self.mask) as usize].push(buf);
        self.len += 1;
    }

    pub fn contains(&self, tag: u16) -> bool {
        self.buckets[(tag & self.mask) as usize]
            .iter()
            .any(|b| b.compl_tag == tag)
    }

    /// Removes every record stored under `tag`, passing each to `f`.
    /// Returns the number of records removed, zero if the tag is unknown.
    pub fn remove_with(&mut self, tag: u16, mut f: impl FnMut(TxBuf)) -> usize {
        let bucket = &mut self.buckets[(tag & self.mask) as usize];
        let mut removed = 0;
        let mut i = 0;
        while i < bucket.len() {
            if bucket[i].compl_tag == tag {
                f(bucket.swap_remove(i));
                removed += 1;
            } else {
                i += 1;
            }
        }
        self.len -= removed;
        removed
    }

    /// Removes all records.
    pub fn drain(&mut self, mut f: impl FnMut(TxBuf)) {
        for bucket in &mut self.buckets {
            for buf in bucket.drain(..) {
                f(buf);
            }
        }
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::RxBufPool;
    use super::TagTable;
    use super::TxBuf;
    use super::TxBufStack;
    use crate::error::TxError;
    use crate::tests::init_tracing;
    use std::sync::Arc;
    use user_driver::emulated::EmulatedDma;

    #[test]
    fn acquire_is_lazy_and_recycles() {
        init_tracing();
        let dma = EmulatedDma::new();
        let mut pool = RxBufPool::new(dma.clone(), 4, 4096, false).unwrap();
        assert!(!pool.has_page(0));
        assert!(pool.acquire_page(0));
        assert!(pool.acquire_page(0));
        assert_eq!(pool.stats().page_allocs, 1);
        assert_eq!(dma.stats().maps, 1);
        assert_eq!(pool.buf_size(), 2048);
    }

    #[test]
    fn allocation_failure_is_soft() {
        let dma = EmulatedDma::new();
        let mut pool = RxBufPool::new(dma.clone(), 4, 4096, false).unwrap();
        dma.fail_next_allocations(1);
        assert!(!pool.acquire_page(1));
        dma.fail_next_maps(1);
        assert!(!pool.acquire_page(1));
        assert!(pool.acquire_page(1));
        assert_eq!(pool.stats().alloc_failures, 2);
    }

    #[test]
    fn small_page_flips_halves_while_stack_lets_go() {
        init_tracing();
        let dma = EmulatedDma::new();
        let mut pool = RxBufPool::new(dma.clone(), 2, 4096, false).unwrap();
        assert!(pool.acquire_page(0));
        let base = pool.dma_addr(0).unwrap();

        let frag = pool.take_fragment(0, 0, 100).unwrap();
        pool.put_buffer(0);
        assert_eq!(pool.dma_addr(0), Some(base + 2048));

        // The stack still holds the first half, so the second half cannot
        // be recycled once it is handed out too.
        let frag2 = pool.take_fragment(0, 0, 100).unwrap();
        let page = pool.page(0).unwrap().clone();
        pool.put_buffer(0);
        assert!(!pool.has_page(0));
        assert_eq!(dma.stats().unmaps, 1);
        assert_eq!(page.ref_count(), 2);
        drop((frag, frag2));
        assert_eq!(page.ref_count(), 0);

        // Releasing again does not unmap twice.
        pool.release(0);
        assert_eq!(dma.stats().unmaps, 1);
        assert_eq!(dma.stats().bad_unmaps, 0);
    }

    #[test]
    fn reused_page_is_never_shared_between_buffers() {
        let dma = EmulatedDma::new();
        let mut pool = RxBufPool::new(dma.clone(), 8, 4096, false).unwrap();
        for round in 0..50u32 {
            for id in 0..8 {
                assert!(pool.acquire_page(id));
            }
            for a in 0..8 {
                for b in (a + 1)..8 {
                    assert!(!Arc::ptr_eq(
                        pool.page(a).unwrap(),
                        pool.page(b).unwrap()
                    ));
                }
            }
            for id in 0..8 {
                let frag = pool.take_fragment(id, 0, 64).unwrap();
                pool.put_buffer(id);
                if (id as u32 + round) % 3 != 0 {
                    drop(frag);
                } else {
                    std::mem::forget(frag);
                }
            }
        }
        let stats = dma.stats();
        assert_eq!(stats.bad_unmaps, 0);
        assert_eq!(stats.unmaps, pool.stats().page_releases);
    }

    #[test]
    fn bias_is_topped_up_when_drawn_down() {
        let dma = EmulatedDma::new();
        let mut pool = RxBufPool::new(dma.clone(), 1, 4096, false).unwrap();
        assert!(pool.acquire_page(0));
        for _ in 0..0x20000 {
            drop(pool.take_fragment(0, 0, 1).unwrap());
            pool.put_buffer(0);
        }
        assert!(pool.has_page(0));
        assert_eq!(pool.stats().page_allocs, 1);
    }

    #[test]
    fn large_pages_advance_until_exhausted() {
        let dma = EmulatedDma::new();
        let mut pool = RxBufPool::new(dma.clone(), 1, 16384, false).unwrap();
        assert!(pool.acquire_page(0));
        let base = pool.dma_addr(0).unwrap();
        let mut frags = Vec::new();
        frags.push(pool.take_fragment(0, 0, 10).unwrap());
        pool.put_buffer(0);
        assert_eq!(pool.dma_addr(0), Some(base + 3072));
        for _ in 0..3 {
            frags.push(pool.take_fragment(0, 0, 10).unwrap());
            pool.put_buffer(0);
        }
        assert_eq!(pool.dma_addr(0), Some(base + 4 * 3072));
        frags.push(pool.take_fragment(0, 0, 10).unwrap());
        pool.put_buffer(0);
        assert!(!pool.has_page(0));
    }

    #[test]
    fn remote_pages_are_not_reused() {
        let dma = EmulatedDma::new();
        let mut pool = RxBufPool::new(dma.clone(), 1, 4096, false).unwrap();
        assert!(pool.acquire_page(0));
        pool.mark_remote(0);
        drop(pool.take_fragment(0, 0, 1).unwrap());
        pool.put_buffer(0);
        assert!(!pool.has_page(0));
        assert_eq!(dma.stats().unmaps, 1);
    }

    #[test]
    fn header_buffers() {
        let dma = EmulatedDma::new();
        let pool = RxBufPool::new(dma.clone(), 4, 4096, true).unwrap();
        let addr = pool.hdr_addr(2).unwrap();
        dma.resolve(addr, 4).unwrap().write_at(0, b"abcd");
        let mut out = Vec::new();
        pool.copy_header(2, 4, &mut out);
        assert_eq!(out, b"abcd");
    }

    #[test]
    fn stack_runs_dry_after_capacity_pops() {
        let mut stack = TxBufStack::new(256);
        let mut held = Vec::new();
        for _ in 0..256 {
            held.push(stack.pop().unwrap());
        }
        assert!(matches!(stack.pop(), Err(TxError::OutOfBuffers)));
        for buf in held {
            stack.push(buf);
        }
        assert_eq!(stack.len(), 256);
    }

    #[test]
    fn tag_removal_is_idempotent() {
        let mut table = TagTable::new(256);
        for tag in [5u16, 5 | 0x100, 7] {
            table.insert(TxBuf {
                compl_tag: tag,
                ..Default::default()
            });
        }
        assert_eq!(table.remove_with(5, drop), 1);
        assert_eq!(table.remove_with(5, drop), 0);
        assert!(table.contains(5 | 0x100));
        assert_eq!(table.len(), 2);
    }
}
