// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Descriptor rings.

use crate::error::RingError;
use user_driver::DmaClient;
use user_driver::memory::MemoryBlock;
use user_driver::memory::page_round_up;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// The role of a ring, which decides which cursor drives the generation bit.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RingRole {
    Tx,
    TxCompletion,
    Rx,
    RxBuffer,
    Mailbox,
}

/// A fixed-size circular array of device-visible descriptors.
///
/// The generation bit starts out set and flips each time the cursor that
/// consumes device writes (`next_to_clean`, or `next_to_use` for buffer
/// rings) wraps. Ring memory starts zeroed, so no descriptor matches the
/// expected generation until the device writes it.
pub struct DescRing {
    mem: Option<MemoryBlock>,
    role: RingRole,
    count: u16,
    desc_size: usize,
    next_to_use: u16,
    next_to_clean: u16,
    next_to_alloc: u16,
    gen_chk: bool,
}

impl std::fmt::Debug for DescRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescRing")
            .field("role", &self.role)
            .field("count", &self.count)
            .field("desc_size", &self.desc_size)
            .field("next_to_use", &self.next_to_use)
            .field("next_to_clean", &self.next_to_clean)
            .field("gen_chk", &self.gen_chk)
            .finish()
    }
}

impl DescRing {
    /// Allocates zeroed, page aligned ring memory for `count` descriptors of
    /// `desc_size` bytes.
    pub fn alloc(
        dma: &dyn DmaClient,
        role: RingRole,
        count: u16,
        desc_size: usize,
    ) -> Result<Self, RingError> {
        if count < 2 {
            return Err(RingError::InvalidCount(count.into()));
        }
        let len = page_round_up(count as usize * desc_size);
        let mem = dma
            .allocate_dma_buffer(len)
            .map_err(|err| RingError::OutOfMemory { count, err })?;
        Ok(Self {
            mem: Some(mem),
            role,
            count,
            desc_size,
            next_to_use: 0,
            next_to_clean: 0,
            next_to_alloc: 0,
            gen_chk: true,
        })
    }

    /// Frees the ring memory and resets all cursors.
    pub fn release(&mut self) {
        self.mem = None;
        self.next_to_use = 0;
        self.next_to_clean = 0;
        self.next_to_alloc = 0;
        self.gen_chk = true;
    }

    pub fn is_allocated(&self) -> bool {
        self.mem.is_some()
    }

    pub fn role(&self) -> RingRole {
        self.role
    }

    pub fn count(&self) -> u16 {
        self.count
    }

    pub fn desc_size(&self) -> usize {
        self.desc_size
    }

    /// The device address of the ring, or zero once released.
    pub fn iova(&self) -> u64 {
        self.mem.as_ref().map_or(0, |m| m.iova())
    }

    pub fn next_to_use(&self) -> u16 {
        self.next_to_use
    }

    pub fn next_to_clean(&self) -> u16 {
        self.next_to_clean
    }

    pub fn next_to_alloc(&self) -> u16 {
        self.next_to_alloc
    }

    pub fn set_next_to_alloc(&mut self, nta: u16) {
        self.next_to_alloc = nta;
    }

    /// The generation value a descriptor must carry to be new.
    pub fn gen_chk(&self) -> bool {
        self.gen_chk
    }

    /// Descriptors that can be posted without overtaking `next_to_clean`.
    /// One slot always stays empty so a full ring can be told from an empty
    /// one.
    pub fn unused(&self) -> u16 {
        let ntc = self.next_to_clean;
        let ntu = self.next_to_use;
        (if ntc > ntu { 0 } else { self.count }) + ntc - ntu - 1
    }

    /// Descriptors posted and not yet cleaned.
    pub fn in_flight(&self) -> u16 {
        self.count - 1 - self.unused()
    }

    pub fn next(&self, index: u16) -> u16 {
        if index + 1 == self.count {
            0
        } else {
            index + 1
        }
    }

    /// The distance from `from` forward to `to`.
    pub fn distance(&self, from: u16, to: u16) -> u16 {
        if to >= from {
            to - from
        } else {
            self.count - from + to
        }
    }

    /// Advances `next_to_use`, returning the old value.
    pub fn advance_ntu(&mut self) -> u16 {
        let old = self.next_to_use;
        self.next_to_use = self.next(old);
        if self.next_to_use == 0 && self.role == RingRole::RxBuffer {
            self.gen_chk = !self.gen_chk;
        }
        old
    }

    /// Advances `next_to_clean`, returning the old value.
    pub fn advance_ntc(&mut self) -> u16 {
        let old = self.next_to_clean;
        self.next_to_clean = self.next(old);
        if self.next_to_clean == 0
            && matches!(self.role, RingRole::TxCompletion | RingRole::Rx)
        {
            self.gen_chk = !self.gen_chk;
        }
        old
    }

    /// Moves `next_to_clean` forward to `index`, which must be within the
    /// in-flight range.
    pub fn clean_to(&mut self, index: u16) {
        debug_assert!(self.distance(self.next_to_clean, index) <= self.in_flight());
        while self.next_to_clean != index {
            self.advance_ntc();
        }
    }

    /// Reads the descriptor at `index`. A released ring reads as zeroes,
    /// which never carries a valid ownership bit.
    pub fn read<T: IntoBytes + FromBytes + Immutable + KnownLayout>(&self, index: u16) -> T {
        debug_assert!(size_of::<T>() <= self.desc_size);
        match &self.mem {
            Some(mem) => mem.read_obj(index as usize * self.desc_size),
            None => T::new_zeroed(),
        }
    }

    /// Writes the descriptor at `index`.
    pub fn write<T: IntoBytes + Immutable + KnownLayout>(&self, index: u16, desc: &T) {
        debug_assert!(size_of::<T>() <= self.desc_size);
        debug_assert!(self.mem.is_some());
        if let Some(mem) = &self.mem {
            mem.write_obj(index as usize * self.desc_size, desc);
        }
    }

    /// Zeroes the descriptor at `index`.
    pub fn clear(&self, index: u16) {
        if let Some(mem) = &self.mem {
            mem.fill_at(index as usize * self.desc_size, self.desc_size, 0);
        }
    }

    /// Returns the memory of the whole ring, for device models.
    pub fn memory(&self) -> Option<&MemoryBlock> {
        self.mem.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::DescRing;
    use super::RingRole;
    use crate::error::RingError;
    use crate::tests::init_tracing;
    use user_driver::emulated::EmulatedDma;

    /// A small deterministic generator for operation sequences.
    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self, bound: u16) -> u16 {
            self.0 = self
                .0
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            ((self.0 >> 33) % (bound as u64 + 1)) as u16
        }
    }

    #[test]
    fn alloc_rounds_to_pages_and_release_resets() {
        init_tracing();
        let dma = EmulatedDma::new();
        let mut ring = DescRing::alloc(&*dma, RingRole::Tx, 100, 16).unwrap();
        assert_eq!(ring.memory().unwrap().len(), 4096);
        assert_eq!(ring.unused(), 99);
        for _ in 0..10 {
            ring.advance_ntu();
        }
        ring.advance_ntc();
        ring.release();
        assert!(!ring.is_allocated());
        assert_eq!(ring.next_to_use(), 0);
        assert_eq!(ring.next_to_clean(), 0);
        assert_eq!(ring.iova(), 0);
    }

    #[test]
    fn alloc_failure_is_out_of_memory() {
        let dma = EmulatedDma::new();
        dma.fail_next_allocations(1);
        let err = DescRing::alloc(&*dma, RingRole::Rx, 64, 32).unwrap_err();
        assert!(matches!(err, RingError::OutOfMemory { count: 64, .. }));
    }

    #[test]
    fn generation_flips_once_per_wrap() {
        init_tracing();
        let dma = EmulatedDma::new();
        for role in [RingRole::TxCompletion, RingRole::Rx] {
            let mut ring = DescRing::alloc(&*dma, role, 64, 32).unwrap();
            let mut rng = Lcg(role as u64 + 7);
            let mut cleaned = 0u32;
            let mut flips = 0u32;
            let mut last_gen = ring.gen_chk();
            for _ in 0..2000 {
                let produce = rng.next(ring.unused());
                for _ in 0..produce {
                    ring.advance_ntu();
                }
                let consume = rng.next(ring.in_flight());
                for _ in 0..consume {
                    ring.advance_ntc();
                    cleaned += 1;
                    if ring.gen_chk() != last_gen {
                        flips += 1;
                        last_gen = ring.gen_chk();
                    }
                }
                // next_to_clean never passes next_to_use.
                assert!(ring.in_flight() < ring.count());
                assert_eq!(
                    ring.distance(ring.next_to_clean(), ring.next_to_use()),
                    ring.in_flight()
                );
            }
            assert_eq!(flips, cleaned / ring.count() as u32);
        }
    }

    #[test]
    fn buffer_rings_flip_on_next_to_use() {
        let dma = EmulatedDma::new();
        let mut ring = DescRing::alloc(&*dma, RingRole::RxBuffer, 64, 32).unwrap();
        for _ in 0..63 {
            ring.advance_ntu();
        }
        assert!(ring.gen_chk());
        for _ in 0..63 {
            ring.advance_ntc();
        }
        ring.advance_ntu();
        assert!(!ring.gen_chk());
    }

    #[test]
    fn descriptors_round_trip_through_memory() {
        let dma = EmulatedDma::new();
        let ring = DescRing::alloc(&*dma, RingRole::Tx, 64, 16).unwrap();
        ring.write(5, &[0xabu8; 16]);
        assert_eq!(ring.read::<[u8; 16]>(5), [0xab; 16]);
        ring.clear(5);
        assert_eq!(ring.read::<[u8; 16]>(5), [0; 16]);
        let mem = dma.resolve(ring.iova() + 5 * 16, 16).unwrap();
        assert_eq!(mem.len(), 16);
    }
}
