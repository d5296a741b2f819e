//! x86_64 architecture support
//!
//! Hardware bring-up (GDT/TSS, IDT, PIC and PIT, fast-syscall MSRs), the
//! kernel-stack context switch, and the per-CPU anchor the syscall entry
//! hangs off.

pub mod context;
pub mod gdt;
pub mod idt;
pub mod percpu;
pub mod syscall;
pub mod timer;

/// Bring up the processor: descriptors first, then traps, then the timer
/// and the syscall entry.
pub fn init() {
    gdt::init();
    idt::init();
    percpu::init();
    timer::init();
    syscall::init();
    log::info!("arch: x86_64 online");
}

/// Stop forever.
pub fn halt() -> ! {
    loop {
        x86_64::instructions::hlt();
    }
}

/// Idle thread body: sleep until the next interrupt, with interrupts
/// closed again before the scheduler is consulted.
pub extern "C" fn idle_loop() -> ! {
    loop {
        x86_64::instructions::interrupts::enable_and_hlt();
        x86_64::instructions::interrupts::disable();
    }
}
