//! Physical frame allocator
//!
//! A bitmap with one bit per 4 KiB frame, built from the firmware memory
//! map. Only single-frame allocations are served; freeing clears a bit and
//! nothing is ever coalesced.

use spin::Mutex;

use super::{align_down, align_up, PhysicalAddress, FRAME_SIZE};
use crate::config::MAX_PHYS_FRAMES;
use crate::error::{KernelError, Result};
use crate::handover::Handover;

const BITMAP_WORDS: usize = MAX_PHYS_FRAMES / 64;

/// Global frame allocator instance
pub static FRAME_ALLOCATOR: Mutex<FrameAllocator> = Mutex::new(FrameAllocator::new());

/// Bitmap allocator over physical frames. A set bit means the frame is in
/// use or outside the managed range.
pub struct FrameAllocator {
    bitmap: [u64; BITMAP_WORDS],
    /// Frames tracked; frames at or above this index are never handed out
    limit: u64,
    /// Conventional frames donated by the firmware map
    total: u64,
    /// Currently free frames
    free: u64,
}

impl FrameAllocator {
    pub const fn new() -> Self {
        Self {
            bitmap: [u64::MAX; BITMAP_WORDS],
            limit: 0,
            total: 0,
            free: 0,
        }
    }

    /// Build the bitmap from the firmware memory map.
    ///
    /// Every bit starts in-use; bits are then cleared for each conventional
    /// region, rounded inward to frame boundaries. Conventional memory above
    /// the bitmap's capacity is ignored.
    ///
    /// # Safety
    ///
    /// The handover record must describe a live memory-map array.
    pub unsafe fn init(&mut self, handover: &Handover) {
        self.bitmap = [u64::MAX; BITMAP_WORDS];
        self.total = 0;
        self.free = 0;

        let cap = (MAX_PHYS_FRAMES * FRAME_SIZE) as u64;
        let mut highest = 0u64;
        // SAFETY: caller guarantees the map is live.
        for desc in unsafe { handover.descriptors() } {
            if desc.is_conventional() {
                highest = highest.max(desc.physical_end().min(cap));
            }
        }
        self.limit = highest / FRAME_SIZE as u64;

        // SAFETY: caller guarantees the map is live.
        for desc in unsafe { handover.descriptors() } {
            if !desc.is_conventional() {
                continue;
            }
            let start = align_up(desc.physical_start, FRAME_SIZE as u64) / FRAME_SIZE as u64;
            let end = align_down(desc.physical_end().min(cap), FRAME_SIZE as u64)
                / FRAME_SIZE as u64;
            for frame in start..end {
                if self.clear_bit(frame) {
                    self.total += 1;
                    self.free += 1;
                }
            }
        }

        log::info!(
            "pmm: {} conventional frames ({} KiB), limit frame {}",
            self.total,
            self.total * FRAME_SIZE as u64 / 1024,
            self.limit
        );
    }

    /// Allocate one frame. First-fit scan for a word with a clear bit.
    pub fn alloc_frame(&mut self) -> Result<PhysicalAddress> {
        let words = (self.limit as usize).div_ceil(64).min(BITMAP_WORDS);
        for (wi, word) in self.bitmap[..words].iter_mut().enumerate() {
            if *word != u64::MAX {
                let bit = (!*word).trailing_zeros() as u64;
                let frame = wi as u64 * 64 + bit;
                if frame >= self.limit {
                    break;
                }
                *word |= 1 << bit;
                self.free -= 1;
                return Ok(PhysicalAddress::new(frame * FRAME_SIZE as u64));
            }
        }
        Err(KernelError::NoMem)
    }

    /// Return one frame. Double frees are rejected rather than corrupting
    /// the free count.
    pub fn free_frame(&mut self, phys: PhysicalAddress) {
        debug_assert!(phys.is_frame_aligned());
        let frame = phys.as_frame().as_u64();
        if frame >= self.limit {
            log::warn!("pmm: free of untracked frame {}", phys);
            return;
        }
        if self.clear_bit(frame) {
            self.free += 1;
        } else {
            log::warn!("pmm: double free of frame {}", phys);
        }
    }

    /// Mark `frames` frames starting at `base` as in use. Used for the
    /// kernel image, the handover structures, and the initrd.
    pub fn reserve_range(&mut self, base: PhysicalAddress, bytes: u64) {
        let start = align_down(base.as_u64(), FRAME_SIZE as u64) / FRAME_SIZE as u64;
        let end = align_up(base.as_u64() + bytes, FRAME_SIZE as u64) / FRAME_SIZE as u64;
        for frame in start..end.min(self.limit) {
            if self.set_bit(frame) {
                self.free -= 1;
            }
        }
    }

    /// Return every in-use frame fully contained in the range to the free
    /// pool. Frames that are already free stay free; partial frames at the
    /// edges are left alone.
    pub fn release_range(&mut self, base: PhysicalAddress, bytes: u64) {
        let start = align_up(base.as_u64(), FRAME_SIZE as u64) / FRAME_SIZE as u64;
        let end = align_down(base.as_u64() + bytes, FRAME_SIZE as u64) / FRAME_SIZE as u64;
        for frame in start..end.min(self.limit) {
            if self.clear_bit(frame) {
                self.free += 1;
            }
        }
    }

    /// Find and claim a frame-aligned run of `frames` free frames. Serves
    /// the boot-time carve-out of the initial Untyped donation.
    pub fn reserve_contiguous(&mut self, frames: u64) -> Result<PhysicalAddress> {
        let mut run_start = 0u64;
        let mut run_len = 0u64;
        for frame in 0..self.limit {
            if self.bit(frame) {
                run_len = 0;
            } else {
                if run_len == 0 {
                    run_start = frame;
                }
                run_len += 1;
                if run_len == frames {
                    for f in run_start..run_start + frames {
                        self.set_bit(f);
                    }
                    self.free -= frames;
                    return Ok(PhysicalAddress::new(run_start * FRAME_SIZE as u64));
                }
            }
        }
        Err(KernelError::NoMem)
    }

    pub fn free_frames(&self) -> u64 {
        self.free
    }

    pub fn total_frames(&self) -> u64 {
        self.total
    }

    pub fn used_frames(&self) -> u64 {
        self.total - self.free
    }

    /// Recount free frames straight from the bitmap. The conservation
    /// invariant says this always agrees with the running counter.
    pub fn recount_free(&self) -> u64 {
        let words = (self.limit as usize).div_ceil(64).min(BITMAP_WORDS);
        let mut free = 0u64;
        for (wi, word) in self.bitmap[..words].iter().enumerate() {
            let clear = !word;
            for bit in 0..64u64 {
                let frame = wi as u64 * 64 + bit;
                if frame >= self.limit {
                    break;
                }
                if clear & (1 << bit) != 0 {
                    free += 1;
                }
            }
        }
        free
    }

    pub fn is_free(&self, phys: PhysicalAddress) -> bool {
        let frame = phys.as_frame().as_u64();
        frame < self.limit && !self.bit(frame)
    }

    fn bit(&self, frame: u64) -> bool {
        self.bitmap[(frame / 64) as usize] & (1 << (frame % 64)) != 0
    }

    /// Set a bit; returns true when the bit was previously clear.
    fn set_bit(&mut self, frame: u64) -> bool {
        let word = &mut self.bitmap[(frame / 64) as usize];
        let mask = 1 << (frame % 64);
        let was_clear = *word & mask == 0;
        *word |= mask;
        was_clear
    }

    /// Clear a bit; returns true when the bit was previously set.
    fn clear_bit(&mut self, frame: u64) -> bool {
        let word = &mut self.bitmap[(frame / 64) as usize];
        let mask = 1 << (frame % 64);
        let was_set = *word & mask != 0;
        *word &= !mask;
        was_set
    }
}

impl Default for FrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handover::MemoryDescriptor;

    fn allocator_from(map: &[MemoryDescriptor]) -> FrameAllocator {
        let handover = Handover::for_test(map, core::mem::size_of::<MemoryDescriptor>() as u64);
        let mut pmm = FrameAllocator::new();
        unsafe { pmm.init(&handover) };
        pmm
    }

    #[test]
    fn donates_only_conventional_regions() {
        let pmm = allocator_from(&[
            MemoryDescriptor::conventional(0x0000, 16),
            MemoryDescriptor::reserved(0x10000, 16),
            MemoryDescriptor::conventional(0x20000, 8),
        ]);
        assert_eq!(pmm.total_frames(), 24);
        assert_eq!(pmm.free_frames(), 24);
        assert!(pmm.is_free(PhysicalAddress::new(0x20000)));
        assert!(!pmm.is_free(PhysicalAddress::new(0x10000)));
    }

    #[test]
    fn unaligned_regions_round_inward() {
        let mut map = [MemoryDescriptor::conventional(0, 0)];
        map[0].physical_start = 0x1800;
        map[0].number_of_pages = 4; // ends at 0x5800
        let pmm = allocator_from(&map);
        // 0x2000..0x5000 remain after rounding inward.
        assert_eq!(pmm.total_frames(), 3);
        assert!(!pmm.is_free(PhysicalAddress::new(0x1000)));
        assert!(pmm.is_free(PhysicalAddress::new(0x2000)));
        assert!(pmm.is_free(PhysicalAddress::new(0x4000)));
        assert!(!pmm.is_free(PhysicalAddress::new(0x5000)));
    }

    #[test]
    fn conventional_memory_above_capacity_is_ignored() {
        let cap = (MAX_PHYS_FRAMES * FRAME_SIZE) as u64;
        let pmm = allocator_from(&[
            MemoryDescriptor::conventional(0, 4),
            MemoryDescriptor::conventional(cap, 128),
        ]);
        assert_eq!(pmm.total_frames(), 4);
    }

    #[test]
    fn alloc_free_conservation() {
        let mut pmm = allocator_from(&[MemoryDescriptor::conventional(0, 64)]);
        let total = pmm.total_frames();

        let mut held = std::vec::Vec::new();
        for _ in 0..10 {
            let frame = pmm.alloc_frame().unwrap();
            assert!(!pmm.is_free(frame));
            held.push(frame);
            assert_eq!(pmm.free_frames() + pmm.used_frames(), total);
        }
        for frame in held {
            pmm.free_frame(frame);
            assert_eq!(pmm.free_frames() + pmm.used_frames(), total);
        }
        assert_eq!(pmm.free_frames(), total);
    }

    #[test]
    fn exhaustion_returns_no_mem() {
        let mut pmm = allocator_from(&[MemoryDescriptor::conventional(0, 2)]);
        pmm.alloc_frame().unwrap();
        pmm.alloc_frame().unwrap();
        assert_eq!(pmm.alloc_frame(), Err(KernelError::NoMem));
    }

    #[test]
    fn double_free_does_not_inflate_free_count() {
        let mut pmm = allocator_from(&[MemoryDescriptor::conventional(0, 4)]);
        let frame = pmm.alloc_frame().unwrap();
        pmm.free_frame(frame);
        let free = pmm.free_frames();
        pmm.free_frame(frame);
        assert_eq!(pmm.free_frames(), free);
    }

    #[test]
    fn contiguous_reservation_skips_holes() {
        let mut pmm = allocator_from(&[MemoryDescriptor::conventional(0, 32)]);
        // Poke a hole at frame 2.
        pmm.reserve_range(PhysicalAddress::new(0x2000), FRAME_SIZE as u64);
        let base = pmm.reserve_contiguous(8).unwrap();
        assert_eq!(base.as_u64(), 0x3000);
        for i in 0..8 {
            assert!(!pmm.is_free(base.offset(i * FRAME_SIZE as u64)));
        }
    }
}
