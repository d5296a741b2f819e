//! Virtual memory manager
//!
//! Recursive paging over the four-level tree: the root table's
//! `RECURSIVE_SLOT` entry points at the root itself, which exposes every
//! table in the hierarchy at a fixed virtual window. The walk itself is
//! written against the [`PageTableAccess`] trait so the same algorithm runs
//! on the live tree (through the recursive window) and on the host-side
//! table store used by the test harness.

use bitflags::bitflags;

use super::{FrameAllocator, PhysicalAddress, VirtualAddress, FRAME_SIZE};
use crate::config::RECURSIVE_SLOT;
use crate::error::KernelError;

/// Entries per page table
pub const ENTRIES: usize = 512;

/// Physical-address bits of a page-table entry
pub const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

bitflags! {
    /// Page-table entry flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        const PRESENT       = 1 << 0;
        const WRITE         = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        const HUGE          = 1 << 7;
        const GLOBAL        = 1 << 8;
        const NO_EXECUTE    = 1 << 63;
    }
}

/// Mapping failures surfaced by `map_page`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// No frame available for an intermediate table
    TableAllocFailed,
    /// The leaf entry is already present
    AlreadyMapped,
}

impl From<MapError> for KernelError {
    fn from(err: MapError) -> Self {
        match err {
            MapError::TableAllocFailed => KernelError::NoMem,
            MapError::AlreadyMapped => KernelError::NoSpace,
        }
    }
}

/// Split a canonical virtual address into its four table indices,
/// root-level first.
pub const fn split_virt(virt: VirtualAddress) -> [usize; 4] {
    let v = virt.as_u64();
    [
        ((v >> 39) & 0x1FF) as usize,
        ((v >> 30) & 0x1FF) as usize,
        ((v >> 21) & 0x1FF) as usize,
        ((v >> 12) & 0x1FF) as usize,
    ]
}

/// Virtual address of the table reached by `path` through the recursive
/// window. An empty path names the root itself.
pub fn recursive_table_va(path: &[usize]) -> u64 {
    debug_assert!(path.len() <= 3);
    let mut indices = [RECURSIVE_SLOT; 4];
    // A path of length n occupies the low n index positions; the recursive
    // slot fills the rest, which is what folds the walk back onto the tree.
    for (i, &p) in path.iter().enumerate() {
        indices[4 - path.len() + i] = p;
    }
    let raw = (indices[0] as u64) << 39
        | (indices[1] as u64) << 30
        | (indices[2] as u64) << 21
        | (indices[3] as u64) << 12;
    // Sign-extend bit 47 to make the address canonical.
    if raw & (1 << 47) != 0 {
        raw | 0xFFFF_0000_0000_0000
    } else {
        raw
    }
}

/// Apply the leaf write/execute policy for user mappings: a writable user
/// page is never executable.
pub fn enforce_wx(flags: PageFlags) -> PageFlags {
    if flags.contains(PageFlags::USER) && flags.contains(PageFlags::WRITE) {
        flags | PageFlags::NO_EXECUTE
    } else {
        flags
    }
}

/// Access to the page-table tree of an address space and to raw frames.
///
/// `path` identifies a table by the index route from the root; an empty
/// path is the root. Frame-addressed methods reach tables that are not in
/// the active tree (a freshly created root, a frame being loaded).
pub trait PageTableAccess {
    fn entry(&self, path: &[usize], index: usize) -> u64;
    fn set_entry(&mut self, path: &[usize], index: usize, value: u64);
    fn zero_frame(&mut self, frame: PhysicalAddress);
    fn read_frame_entry(&self, frame: PhysicalAddress, index: usize) -> u64;
    fn write_frame_entry(&mut self, frame: PhysicalAddress, index: usize, value: u64);
    fn copy_into_frame(&mut self, frame: PhysicalAddress, offset: usize, bytes: &[u8]);
    fn flush(&mut self, virt: VirtualAddress);
}

/// Map one 4 KiB page, materialising intermediate tables on demand.
pub fn map_page<A: PageTableAccess + ?Sized>(
    access: &mut A,
    pmm: &mut FrameAllocator,
    virt: VirtualAddress,
    phys: PhysicalAddress,
    flags: PageFlags,
) -> Result<(), MapError> {
    let idx = split_virt(virt);
    let user = flags.contains(PageFlags::USER);

    for depth in 0..3 {
        let entry = access.entry(&idx[..depth], idx[depth]);
        if entry & PageFlags::PRESENT.bits() == 0 {
            let table = pmm
                .alloc_frame()
                .map_err(|_| MapError::TableAllocFailed)?;
            access.zero_frame(table);
            let mut table_flags = PageFlags::PRESENT | PageFlags::WRITE;
            if user {
                table_flags |= PageFlags::USER;
            }
            access.set_entry(&idx[..depth], idx[depth], table.as_u64() | table_flags.bits());
        } else if user && entry & PageFlags::USER.bits() == 0 {
            access.set_entry(&idx[..depth], idx[depth], entry | PageFlags::USER.bits());
        }
    }

    let leaf = access.entry(&idx[..3], idx[3]);
    if leaf & PageFlags::PRESENT.bits() != 0 {
        return Err(MapError::AlreadyMapped);
    }
    let value = (phys.as_u64() & ADDR_MASK) | (enforce_wx(flags) | PageFlags::PRESENT).bits();
    access.set_entry(&idx[..3], idx[3], value);
    access.flush(virt);
    Ok(())
}

/// Remove a leaf mapping. Returns the physical address that was mapped.
pub fn unmap_page<A: PageTableAccess + ?Sized>(
    access: &mut A,
    virt: VirtualAddress,
) -> Result<PhysicalAddress, KernelError> {
    let idx = split_virt(virt);
    for depth in 0..3 {
        let entry = access.entry(&idx[..depth], idx[depth]);
        if entry & PageFlags::PRESENT.bits() == 0 {
            return Err(KernelError::Invalid);
        }
    }
    let leaf = access.entry(&idx[..3], idx[3]);
    if leaf & PageFlags::PRESENT.bits() == 0 {
        return Err(KernelError::Invalid);
    }
    access.set_entry(&idx[..3], idx[3], 0);
    access.flush(virt);
    Ok(PhysicalAddress::new(leaf & ADDR_MASK))
}

/// Whether a leaf mapping exists for `virt`.
pub fn is_mapped<A: PageTableAccess + ?Sized>(access: &A, virt: VirtualAddress) -> bool {
    translate(access, virt).is_some()
}

/// Resolve a virtual address to its mapping, if present.
pub fn translate<A: PageTableAccess + ?Sized>(
    access: &A,
    virt: VirtualAddress,
) -> Option<(PhysicalAddress, PageFlags)> {
    let idx = split_virt(virt);
    for depth in 0..3 {
        if access.entry(&idx[..depth], idx[depth]) & PageFlags::PRESENT.bits() == 0 {
            return None;
        }
    }
    let leaf = access.entry(&idx[..3], idx[3]);
    if leaf & PageFlags::PRESENT.bits() == 0 {
        return None;
    }
    Some((
        PhysicalAddress::new(leaf & ADDR_MASK),
        PageFlags::from_bits_truncate(leaf & !ADDR_MASK),
    ))
}

/// Turn `root` into a fresh address-space root: zeroed, sharing the
/// active tree's kernel half, with its own recursive slot. The frame may
/// come from the allocator or from retyped Untyped bytes.
pub fn init_root_frame<A: PageTableAccess + ?Sized>(access: &mut A, root: PhysicalAddress) {
    access.zero_frame(root);
    for i in ENTRIES / 2..ENTRIES {
        if i == RECURSIVE_SLOT {
            continue;
        }
        let entry = access.entry(&[], i);
        if entry & PageFlags::PRESENT.bits() != 0 {
            access.write_frame_entry(root, i, entry);
        }
    }
    access.write_frame_entry(
        root,
        RECURSIVE_SLOT,
        root.as_u64() | (PageFlags::PRESENT | PageFlags::WRITE).bits(),
    );
}

/// Create a fresh address space: a zeroed root that shares the kernel's
/// higher half and carries its own recursive slot.
pub fn create_address_space<A: PageTableAccess + ?Sized>(
    access: &mut A,
    pmm: &mut FrameAllocator,
) -> Result<PhysicalAddress, KernelError> {
    let root = pmm.alloc_frame()?;
    init_root_frame(access, root);
    Ok(root)
}

/// Run `f` against the address-space tree the kernel is currently
/// operating on: the live recursive window on bare metal, the simulated
/// store under the test harness.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn with_active<R>(f: impl FnOnce(&mut dyn PageTableAccess) -> R) -> R {
    f(&mut *ACTIVE_SPACE.lock())
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub fn with_active<R>(f: impl FnOnce(&mut dyn PageTableAccess) -> R) -> R {
    f(&mut *sim::SIM_ACTIVE.lock())
}

// ---------------------------------------------------------------------------
// Live tree access through the recursive window (bare metal)
// ---------------------------------------------------------------------------

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod active {
    use spin::Mutex;
    use x86_64::instructions::tlb;
    use x86_64::VirtAddr;

    use super::*;

    /// Virtual address the scratch slot maps foreign frames at (own L4
    /// index, away from both the kernel image and the recursive window).
    const SCRATCH_VA: u64 = 0xFFFF_FE80_0000_0000;
    const SCRATCH_PATH: [usize; 3] = [509, 0, 0];

    /// The live address space, manipulated through the recursive window.
    ///
    /// All methods require that the recursive slot of the active root is
    /// installed; `init` establishes that before anything else runs.
    pub struct ActiveSpace;

    pub static ACTIVE_SPACE: Mutex<ActiveSpace> = Mutex::new(ActiveSpace);

    impl ActiveSpace {
        fn table_ptr(path: &[usize]) -> *mut u64 {
            recursive_table_va(path) as *mut u64
        }

        /// Point the scratch slot at `frame` and hand out its window.
        fn scratch_map(&mut self, frame: PhysicalAddress) -> *mut u8 {
            self.set_entry(
                &SCRATCH_PATH,
                0,
                frame.as_u64() | (PageFlags::PRESENT | PageFlags::WRITE).bits(),
            );
            tlb::flush(VirtAddr::new(SCRATCH_VA));
            SCRATCH_VA as *mut u8
        }

        fn scratch_unmap(&mut self) {
            self.set_entry(&SCRATCH_PATH, 0, 0);
            tlb::flush(VirtAddr::new(SCRATCH_VA));
        }
    }

    impl PageTableAccess for ActiveSpace {
        fn entry(&self, path: &[usize], index: usize) -> u64 {
            // SAFETY: the recursive slot maps every table of the active tree
            // at the window address; the index is masked to table bounds.
            unsafe { Self::table_ptr(path).add(index & (ENTRIES - 1)).read_volatile() }
        }

        fn set_entry(&mut self, path: &[usize], index: usize, value: u64) {
            // SAFETY: as for `entry`; the window is writable because the
            // recursive slot carries the write flag.
            unsafe {
                Self::table_ptr(path)
                    .add(index & (ENTRIES - 1))
                    .write_volatile(value);
            }
            if path.len() < 3 && value & PageFlags::PRESENT.bits() != 0 {
                // The window address of the table behind this entry may have
                // a stale translation.
                let mut child = [0usize; 3];
                child[..path.len()].copy_from_slice(path);
                child[path.len()] = index;
                tlb::flush(VirtAddr::new(recursive_table_va(&child[..path.len() + 1])));
            }
        }

        fn zero_frame(&mut self, frame: PhysicalAddress) {
            let window = self.scratch_map(frame);
            // SAFETY: the scratch slot maps exactly one frame at the window.
            unsafe { core::ptr::write_bytes(window, 0, FRAME_SIZE) };
            self.scratch_unmap();
        }

        fn read_frame_entry(&self, frame: PhysicalAddress, index: usize) -> u64 {
            // The shared reference is exclusive in practice: the static is
            // behind a Mutex and the scratch slot is the only way in.
            let this = self as *const Self as *mut Self;
            // SAFETY: see above; no other path touches the scratch slot
            // while the lock is held.
            let this = unsafe { &mut *this };
            let window = this.scratch_map(frame) as *const u64;
            // SAFETY: the window maps `frame`; the index is masked.
            let value = unsafe { window.add(index & (ENTRIES - 1)).read_volatile() };
            this.scratch_unmap();
            value
        }

        fn write_frame_entry(&mut self, frame: PhysicalAddress, index: usize, value: u64) {
            let window = self.scratch_map(frame) as *mut u64;
            // SAFETY: the window maps `frame`; the index is masked.
            unsafe { window.add(index & (ENTRIES - 1)).write_volatile(value) };
            self.scratch_unmap();
        }

        fn copy_into_frame(&mut self, frame: PhysicalAddress, offset: usize, bytes: &[u8]) {
            debug_assert!(offset + bytes.len() <= FRAME_SIZE);
            let window = self.scratch_map(frame);
            // SAFETY: the destination range stays inside the single mapped
            // frame per the assertion above.
            unsafe {
                core::ptr::copy_nonoverlapping(bytes.as_ptr(), window.add(offset), bytes.len());
            }
            self.scratch_unmap();
        }

        fn flush(&mut self, virt: VirtualAddress) {
            tlb::flush(VirtAddr::new(virt.as_u64()));
        }
    }

    /// Install the recursive slot in the firmware-provided root and build
    /// the scratch slot's intermediate tables.
    ///
    /// The scratch path has to be wired up through the loader's identity
    /// mapping: the scratch window is what `zero_frame` itself uses, so it
    /// cannot be materialised through the ordinary map path.
    ///
    /// # Safety
    ///
    /// Must run once during early boot, while the loader's identity mapping
    /// of low physical memory is still in place.
    pub unsafe fn init(root_phys: PhysicalAddress, pmm: &mut FrameAllocator) {
        let table_flags = (PageFlags::PRESENT | PageFlags::WRITE).bits();

        let mut alloc_cleared = |pmm: &mut FrameAllocator| -> u64 {
            let frame = match pmm.alloc_frame() {
                Ok(frame) => frame,
                Err(_) => panic!("vmm: no frames for the scratch path"),
            };
            // SAFETY: the identity mapping covers all of low physical
            // memory during early boot.
            unsafe { core::ptr::write_bytes(frame.as_u64() as *mut u8, 0, FRAME_SIZE) };
            frame.as_u64()
        };

        let l3 = alloc_cleared(pmm);
        let l2 = alloc_cleared(pmm);
        let l1 = alloc_cleared(pmm);

        // SAFETY: caller guarantees the identity mapping covers the root
        // and the freshly allocated tables.
        unsafe {
            let root = root_phys.as_u64() as *mut u64;
            root.add(RECURSIVE_SLOT)
                .write_volatile(root_phys.as_u64() | table_flags);
            root.add(SCRATCH_PATH[0]).write_volatile(l3 | table_flags);
            (l3 as *mut u64).write_volatile(l2 | table_flags);
            (l2 as *mut u64).write_volatile(l1 | table_flags);
        }
        tlb::flush_all();

        log::info!("vmm: recursive window live, root {}", root_phys);
    }

    /// Reload CR3 when switching to a different address space.
    pub fn switch_root(root: PhysicalAddress) {
        use x86_64::registers::control::Cr3;
        use x86_64::structures::paging::PhysFrame;

        let (current, flags) = Cr3::read();
        if current.start_address().as_u64() != root.as_u64() {
            // SAFETY: the root came from `create_address_space` or the
            // firmware handover; both are valid top-level tables that map
            // the kernel's higher half.
            unsafe {
                Cr3::write(
                    PhysFrame::from_start_address(x86_64::PhysAddr::new(root.as_u64())).unwrap(),
                    flags,
                );
            }
        }
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use active::{init, switch_root, ActiveSpace, ACTIVE_SPACE};

// ---------------------------------------------------------------------------
// Host-side table store backing the test harness
// ---------------------------------------------------------------------------

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod sim {
    use lazy_static::lazy_static;
    use spin::Mutex;

    use super::*;

    const MAX_SIM_FRAMES: usize = 64;
    const EMPTY: u64 = u64::MAX;

    /// Root tag for the harness-wide simulated space behind `with_active`.
    /// Far above anything a test frame allocator will ever hand out.
    const SIM_ROOT: u64 = 0x7FFF_FFFF_F000;

    lazy_static! {
        pub(super) static ref SIM_ACTIVE: Mutex<SimSpace> = {
            let root = PhysicalAddress::new(SIM_ROOT);
            let mut space = SimSpace::new(root);
            space.zero_frame(root);
            space.write_frame_entry(
                root,
                RECURSIVE_SLOT,
                SIM_ROOT | (PageFlags::PRESENT | PageFlags::WRITE).bits(),
            );
            Mutex::new(space)
        };
    }

    /// Reset the shared simulated space between host tests.
    pub fn reset_sim_active() {
        let mut space = SIM_ACTIVE.lock();
        *space = SimSpace::new(PhysicalAddress::new(SIM_ROOT));
        space.zero_frame(PhysicalAddress::new(SIM_ROOT));
        space.write_frame_entry(
            PhysicalAddress::new(SIM_ROOT),
            RECURSIVE_SLOT,
            SIM_ROOT | (PageFlags::PRESENT | PageFlags::WRITE).bits(),
        );
    }

    /// Array-backed stand-in for physical memory: page tables and data
    /// frames keyed by their physical address. Lets the host harness run
    /// the exact walk the live kernel runs.
    pub struct SimSpace {
        tags: [u64; MAX_SIM_FRAMES],
        frames: [[u64; ENTRIES]; MAX_SIM_FRAMES],
        root: u64,
    }

    impl SimSpace {
        pub fn new(root: PhysicalAddress) -> Self {
            let mut space = Self {
                tags: [EMPTY; MAX_SIM_FRAMES],
                frames: [[0; ENTRIES]; MAX_SIM_FRAMES],
                root: root.as_u64(),
            };
            space.slot_for(root.as_u64());
            space
        }

        pub fn root(&self) -> PhysicalAddress {
            PhysicalAddress::new(self.root)
        }

        /// Retarget the walk at a different root (address-space switch).
        pub fn set_root(&mut self, root: PhysicalAddress) {
            self.root = root.as_u64();
        }

        fn slot_for(&mut self, frame: u64) -> usize {
            if let Some(i) = self.tags.iter().position(|&t| t == frame) {
                return i;
            }
            let i = self
                .tags
                .iter()
                .position(|&t| t == EMPTY)
                .expect("sim space exhausted");
            self.tags[i] = frame;
            i
        }

        fn find(&self, frame: u64) -> Option<usize> {
            self.tags.iter().position(|&t| t == frame)
        }

        /// Walk `path` from the root, returning the table's frame address.
        fn resolve(&self, path: &[usize]) -> Option<u64> {
            let mut frame = self.root;
            for &index in path {
                let slot = self.find(frame)?;
                let entry = self.frames[slot][index];
                if entry & PageFlags::PRESENT.bits() == 0 {
                    return None;
                }
                frame = entry & ADDR_MASK;
            }
            Some(frame)
        }

        /// Raw view of a frame's bytes, for load-image assertions.
        pub fn frame_bytes(&self, frame: PhysicalAddress) -> [u8; FRAME_SIZE] {
            let slot = self.find(frame.as_u64()).expect("unknown sim frame");
            let mut bytes = [0u8; FRAME_SIZE];
            for (i, word) in self.frames[slot].iter().enumerate() {
                bytes[i * 8..(i + 1) * 8].copy_from_slice(&word.to_le_bytes());
            }
            bytes
        }
    }

    impl PageTableAccess for SimSpace {
        fn entry(&self, path: &[usize], index: usize) -> u64 {
            match self.resolve(path).and_then(|f| self.find(f)) {
                Some(slot) => self.frames[slot][index & (ENTRIES - 1)],
                None => 0,
            }
        }

        fn set_entry(&mut self, path: &[usize], index: usize, value: u64) {
            let frame = self.resolve(path).expect("set_entry on missing table");
            let slot = self.slot_for(frame);
            self.frames[slot][index & (ENTRIES - 1)] = value;
        }

        fn zero_frame(&mut self, frame: PhysicalAddress) {
            let slot = self.slot_for(frame.as_u64());
            self.frames[slot] = [0; ENTRIES];
        }

        fn read_frame_entry(&self, frame: PhysicalAddress, index: usize) -> u64 {
            match self.find(frame.as_u64()) {
                Some(slot) => self.frames[slot][index & (ENTRIES - 1)],
                None => 0,
            }
        }

        fn write_frame_entry(&mut self, frame: PhysicalAddress, index: usize, value: u64) {
            let slot = self.slot_for(frame.as_u64());
            self.frames[slot][index & (ENTRIES - 1)] = value;
        }

        fn copy_into_frame(&mut self, frame: PhysicalAddress, offset: usize, bytes: &[u8]) {
            debug_assert!(offset + bytes.len() <= FRAME_SIZE);
            let slot = self.slot_for(frame.as_u64());
            for (i, &b) in bytes.iter().enumerate() {
                let at = offset + i;
                let word = &mut self.frames[slot][at / 8];
                let shift = (at % 8) as u32 * 8;
                *word = (*word & !(0xFFu64 << shift)) | ((b as u64) << shift);
            }
        }

        fn flush(&mut self, _virt: VirtualAddress) {}
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub use sim::{reset_sim_active, SimSpace};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handover::{Handover, MemoryDescriptor};

    fn test_pmm() -> FrameAllocator {
        let map = [MemoryDescriptor::conventional(0x10000, 48)];
        let handover = Handover::for_test(&map, core::mem::size_of::<MemoryDescriptor>() as u64);
        let mut pmm = FrameAllocator::new();
        unsafe { pmm.init(&handover) };
        pmm
    }

    fn fresh_space(pmm: &mut FrameAllocator) -> SimSpace {
        let root = pmm.alloc_frame().unwrap();
        let mut space = SimSpace::new(root);
        space.zero_frame(root);
        space.write_frame_entry(
            root,
            RECURSIVE_SLOT,
            root.as_u64() | (PageFlags::PRESENT | PageFlags::WRITE).bits(),
        );
        space
    }

    #[test]
    fn split_virt_extracts_indices() {
        let virt = VirtualAddress::new(
            (3u64 << 39) | (7u64 << 30) | (511u64 << 21) | (1u64 << 12) | 0xABC,
        );
        assert_eq!(split_virt(virt), [3, 7, 511, 1]);
    }

    #[test]
    fn recursive_window_addresses() {
        // Root table: all four indices are the recursive slot.
        let r = RECURSIVE_SLOT as u64;
        let root_va = recursive_table_va(&[]);
        let expect = 0xFFFF_0000_0000_0000 | (r << 39) | (r << 30) | (r << 21) | (r << 12);
        assert_eq!(root_va, expect);

        // A level-1 table keeps its own path in the low positions.
        let l1 = recursive_table_va(&[5, 6, 7]);
        assert_eq!(
            l1,
            0xFFFF_0000_0000_0000 | (r << 39) | (5 << 30) | (6 << 21) | (7 << 12)
        );
    }

    #[test]
    fn map_creates_intermediate_tables() {
        let mut pmm = test_pmm();
        let mut space = fresh_space(&mut pmm);
        let before = pmm.free_frames();

        let virt = VirtualAddress::new(0x40_0000_0000);
        let phys = PhysicalAddress::new(0x33000);
        map_page(&mut space, &mut pmm, virt, phys, PageFlags::WRITE | PageFlags::USER).unwrap();

        // Three intermediate tables were materialised.
        assert_eq!(pmm.free_frames(), before - 3);
        let (mapped, flags) = translate(&space, virt).unwrap();
        assert_eq!(mapped, phys);
        assert!(flags.contains(PageFlags::PRESENT | PageFlags::WRITE | PageFlags::USER));
    }

    #[test]
    fn remap_reports_already_mapped_without_leaking() {
        let mut pmm = test_pmm();
        let mut space = fresh_space(&mut pmm);
        let virt = VirtualAddress::new(0x1000_0000);
        map_page(&mut space, &mut pmm, virt, PhysicalAddress::new(0x20000), PageFlags::USER)
            .unwrap();

        let free = pmm.free_frames();
        let before = translate(&space, virt);
        assert_eq!(
            map_page(&mut space, &mut pmm, virt, PhysicalAddress::new(0x21000), PageFlags::USER),
            Err(MapError::AlreadyMapped)
        );
        assert_eq!(pmm.free_frames(), free);
        assert_eq!(translate(&space, virt), before);
    }

    #[test]
    fn unmap_clears_leaf() {
        let mut pmm = test_pmm();
        let mut space = fresh_space(&mut pmm);
        let virt = VirtualAddress::new(0x7000);
        let phys = PhysicalAddress::new(0x2A000);
        map_page(&mut space, &mut pmm, virt, phys, PageFlags::WRITE).unwrap();
        assert!(is_mapped(&space, virt));

        assert_eq!(unmap_page(&mut space, virt), Ok(phys));
        assert!(!is_mapped(&space, virt));
        assert_eq!(unmap_page(&mut space, virt), Err(KernelError::Invalid));
    }

    #[test]
    fn writable_user_pages_are_never_executable() {
        let mut pmm = test_pmm();
        let mut space = fresh_space(&mut pmm);
        let virt = VirtualAddress::new(0x400000);
        map_page(
            &mut space,
            &mut pmm,
            virt,
            PhysicalAddress::new(0x30000),
            PageFlags::USER | PageFlags::WRITE,
        )
        .unwrap();
        let (_, flags) = translate(&space, virt).unwrap();
        assert!(flags.contains(PageFlags::NO_EXECUTE));

        // Kernel mappings are not subject to the policy.
        assert!(!enforce_wx(PageFlags::WRITE).contains(PageFlags::NO_EXECUTE));
    }

    #[test]
    fn new_address_space_shares_kernel_half_and_self_maps() {
        let mut pmm = test_pmm();
        let mut space = fresh_space(&mut pmm);
        let old_root = space.root();
        // Plant a kernel-half entry to be inherited.
        space.write_frame_entry(old_root, 300, 0xCAFE_0000 | PageFlags::PRESENT.bits());

        let new_root = create_address_space(&mut space, &mut pmm).unwrap();
        assert_ne!(new_root, old_root);
        assert_eq!(
            space.read_frame_entry(new_root, 300),
            0xCAFE_0000 | PageFlags::PRESENT.bits()
        );
        // The recursive slot targets the new root itself.
        assert_eq!(
            space.read_frame_entry(new_root, RECURSIVE_SLOT) & ADDR_MASK,
            new_root.as_u64()
        );
        // Lower-half entries are not inherited.
        assert_eq!(space.read_frame_entry(new_root, 0), 0);
    }
}
