//! Boot orchestration
//!
//! Takes the machine from the firmware handover to a scheduled system:
//! processor structures, physical and virtual memory, the capability
//! store, the initial Untyped donation, and the first user service out of
//! the initrd. Ends by handing the processor to the scheduler.

use crate::cap::{CapObject, CapRef, CapSpace, CapType, Resources, Rights, ROOT_CNODE};
use crate::config::INITIAL_UNTYPED_BYTES;
use crate::error::Result;
use crate::handover::Handover;
use crate::mm::{FrameAllocator, PhysicalAddress, FRAME_SIZE};

/// Root CNode slot layout seeded for the first user service.
pub const SLOT_UNTYPED: u16 = 0;
pub const SLOT_INIT_THREAD: u16 = 1;
pub const SLOT_INIT_SPACE: u16 = 2;

/// Name of the first service inside the archive.
pub const INIT_SERVICE: &str = "init";

/// Carve the initial Untyped donation out of physical memory and seed it
/// at slot 0 of the root CNode. Returns its base.
pub fn seed_initial_untyped(
    caps: &mut CapSpace,
    pmm: &mut FrameAllocator,
) -> Result<PhysicalAddress> {
    let frames = INITIAL_UNTYPED_BYTES / FRAME_SIZE as u64;
    let base = pmm.reserve_contiguous(frames)?;
    caps.seed(
        CapRef::new(ROOT_CNODE, SLOT_UNTYPED),
        CapObject::Untyped {
            base,
            size: INITIAL_UNTYPED_BYTES,
            offset: 0,
        },
        Rights::full(),
    )?;
    log::info!(
        "boot: untyped donation {} KiB at {}",
        INITIAL_UNTYPED_BYTES / 1024,
        base
    );
    Ok(base)
}

/// Retype the first service's Thread and AddressSpace capabilities out of
/// the donation. Returns (tid, address-space root).
pub fn seed_init_caps(
    caps: &mut CapSpace,
    res: &mut Resources<'_>,
) -> Result<(crate::sched::Tid, PhysicalAddress)> {
    let untyped = CapRef::new(ROOT_CNODE, SLOT_UNTYPED);
    caps.retype(
        res,
        untyped,
        CapType::AddressSpace,
        CapRef::new(ROOT_CNODE, SLOT_INIT_SPACE),
        1,
    )?;
    caps.retype(
        res,
        untyped,
        CapType::Thread,
        CapRef::new(ROOT_CNODE, SLOT_INIT_THREAD),
        1,
    )?;

    let CapObject::AddressSpace { root } =
        caps.cap(CapRef::new(ROOT_CNODE, SLOT_INIT_SPACE))?.object
    else {
        return Err(crate::error::KernelError::InvalidState);
    };
    let CapObject::Thread { tid } = caps.cap(CapRef::new(ROOT_CNODE, SLOT_INIT_THREAD))?.object
    else {
        return Err(crate::error::KernelError::InvalidState);
    };
    Ok((tid, root))
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod boot {
    use super::*;
    use crate::cap::CAP_SPACE;
    use crate::config::RECURSIVE_SLOT;
    use crate::initrd::CpioArchive;
    use crate::ipc::ENDPOINTS;
    use crate::mm::vmm::{self, PageFlags};
    use crate::mm::{VirtualAddress, FRAME_ALLOCATOR};
    use crate::sched::{self, ThreadState, SCHEDULER, TCBS};
    use crate::{arch, elf, logger};

    /// Kernel-half window the initrd is remapped at, so it stays readable
    /// after the switch into the first service's address space.
    const INITRD_WINDOW: u64 = 0xFFFF_FD00_0000_0000;

    /// Top of the first service's stack, and its extent.
    const USER_STACK_TOP: u64 = 0x0000_7FFF_FFF0_0000;
    const USER_STACK_PAGES: u64 = 16;

    const _: () = assert!((INITRD_WINDOW >> 39) & 0x1FF != RECURSIVE_SLOT as u64);

    /// Full bring-up. Never returns; the scheduler owns the machine once
    /// the first switch happens.
    pub fn run(handover: &'static Handover) -> ! {
        logger::init();
        println!(
            "CinnabarOS v{} ({} MiB framebuffer at {:#x})",
            env!("CARGO_PKG_VERSION"),
            handover.fb_size / (1024 * 1024),
            handover.fb_base
        );

        arch::init();

        {
            let mut pmm = FRAME_ALLOCATOR.lock();
            // SAFETY: the handover record and its memory map come straight
            // from the firmware loader and outlive the kernel.
            unsafe { pmm.init(handover) };
            pmm.reserve_range(
                PhysicalAddress::new(handover.initrd_addr),
                handover.initrd_size,
            );
            pmm.reserve_range(PhysicalAddress::new(handover.pml4_phys), FRAME_SIZE as u64);
            // SAFETY: runs while the loader's identity mapping is intact.
            unsafe {
                vmm::init(PhysicalAddress::new(handover.pml4_phys), &mut pmm);
            }
        }

        crate::cap::init();
        crate::ipc::init();
        crate::namespace::NAMESPACE.lock().reset();
        let idle = sched::init(VirtualAddress::new(
            arch::x86_64::idle_loop as usize as u64,
        ));
        {
            let mut tcbs = TCBS.lock();
            let tcb = tcbs.get_mut(idle);
            tcb.address_space = PhysicalAddress::new(handover.pml4_phys);
        }

        let initrd = map_initrd_window(handover);
        spawn_init(handover, initrd);

        log::info!("boot: handing over to the scheduler");
        let first = {
            let mut tcbs = TCBS.lock();
            let mut sched = SCHEDULER.lock();
            sched.yield_now(&mut tcbs)
        };
        match first {
            Some(switch) => arch::x86_64::context::perform(switch),
            None => log::error!("boot: nothing to schedule"),
        }
        arch::halt();
    }

    /// Remap the initrd into the kernel half so every address space sees
    /// it, and return it as a slice.
    fn map_initrd_window(handover: &Handover) -> &'static [u8] {
        let mut pmm = FRAME_ALLOCATOR.lock();
        let mut space = vmm::ACTIVE_SPACE.lock();
        let base = crate::mm::align_down(handover.initrd_addr, FRAME_SIZE as u64);
        let end = crate::mm::align_up(
            handover.initrd_addr + handover.initrd_size,
            FRAME_SIZE as u64,
        );
        for (i, phys) in (base..end).step_by(FRAME_SIZE).enumerate() {
            let virt = VirtualAddress::new(INITRD_WINDOW + i as u64 * FRAME_SIZE as u64);
            if let Err(err) = vmm::map_page(
                &mut *space,
                &mut pmm,
                virt,
                PhysicalAddress::new(phys),
                PageFlags::NO_EXECUTE,
            ) {
                panic!("boot: initrd window mapping failed: {:?}", err);
            }
        }
        let offset = handover.initrd_addr - base;
        // SAFETY: the window maps exactly the initrd's frames, read-only,
        // for the rest of the kernel's life.
        unsafe {
            core::slice::from_raw_parts(
                (INITRD_WINDOW + offset) as *const u8,
                handover.initrd_size as usize,
            )
        }
    }

    /// Build the first user service: capabilities, address space, image,
    /// stack; leave it runnable.
    fn spawn_init(handover: &Handover, initrd: &[u8]) {
        let archive = CpioArchive::new(initrd);
        let image_bytes = match archive.find(INIT_SERVICE) {
            Some(bytes) => bytes,
            None => panic!("boot: no '{}' service in the initrd", INIT_SERVICE),
        };
        let image = match elf::ElfImage::parse(image_bytes) {
            Ok(image) => image,
            Err(err) => panic!("boot: '{}' is not loadable: {:?}", INIT_SERVICE, err),
        };

        let mut caps = CAP_SPACE.lock();
        let mut pmm = FRAME_ALLOCATOR.lock();
        let mut endpoints = ENDPOINTS.lock();
        let mut tcbs = TCBS.lock();
        let mut sched = SCHEDULER.lock();

        if let Err(err) = seed_initial_untyped(&mut caps, &mut pmm) {
            panic!("boot: seeding the untyped donation failed: {:?}", err);
        }
        let (tid, root) = {
            let mut res = Resources {
                pmm: &mut pmm,
                tcbs: &mut tcbs,
                sched: &mut sched,
                endpoints: &mut endpoints,
            };
            match seed_init_caps(&mut caps, &mut res) {
                Ok(pair) => pair,
                Err(err) => panic!("boot: init capabilities failed: {:?}", err),
            }
        };

        {
            let mut space = vmm::ACTIVE_SPACE.lock();
            vmm::init_root_frame(&mut *space, root);
        }
        // Work inside the new space from here on; the kernel half (initrd
        // window included) came along.
        vmm::switch_root(root);

        let entry = {
            let mut space = vmm::ACTIVE_SPACE.lock();
            match elf::load_image(&mut *space, &mut pmm, &image) {
                Ok(entry) => entry,
                Err(err) => panic!("boot: loading '{}' failed: {:?}", INIT_SERVICE, err),
            }
        };

        // User stack, faulted in eagerly.
        {
            let mut space = vmm::ACTIVE_SPACE.lock();
            for i in 0..USER_STACK_PAGES {
                let frame = match pmm.alloc_frame() {
                    Ok(frame) => frame,
                    Err(err) => panic!("boot: init stack allocation failed: {:?}", err),
                };
                space.zero_frame(frame);
                let virt = VirtualAddress::new(USER_STACK_TOP - (i + 1) * FRAME_SIZE as u64);
                if let Err(err) = vmm::map_page(
                    &mut *space,
                    &mut pmm,
                    virt,
                    frame,
                    PageFlags::USER | PageFlags::WRITE,
                ) {
                    panic!("boot: init stack mapping failed: {:?}", err);
                }
            }
        }

        let tcb = tcbs.get_mut(tid);
        tcb.cap_root = ROOT_CNODE;
        tcb.address_space = root;
        sched::setup_thread(tcb, entry, VirtualAddress::new(USER_STACK_TOP), true);
        tcb.state = ThreadState::Suspended;
        sched.make_runnable(&mut tcbs, tid);

        log::info!(
            "boot: '{}' is tid {}, entry {}, {} byte initrd",
            INIT_SERVICE,
            tid,
            entry,
            handover.initrd_size
        );
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use boot::run;
