//! CinnabarOS kernel binary
//!
//! The firmware loader jumps here with the handover record's address in
//! the first argument register. Everything after that is `bootstrap`.

#![cfg_attr(all(target_arch = "x86_64", target_os = "none"), no_std)]
#![cfg_attr(all(target_arch = "x86_64", target_os = "none"), no_main)]

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod kernel_entry {
    use core::panic::PanicInfo;

    use cinnabar_kernel::handover::Handover;
    use cinnabar_kernel::{arch, bootstrap, println};

    /// # Safety
    ///
    /// Reached only from the firmware loader, which passes a valid
    /// handover record and an identity mapping of low physical memory.
    #[no_mangle]
    pub unsafe extern "C" fn _start(handover: *const Handover) -> ! {
        // SAFETY: the loader contract guarantees the record is live and
        // immutable for the kernel's lifetime.
        let handover: &'static Handover = unsafe { &*handover };
        bootstrap::run(handover)
    }

    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        println!("[KERNEL PANIC] {}", info);
        arch::halt();
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn main() {
    // Host build of the kernel binary: nothing to boot, the lib carries
    // the testable subsystems.
    std::println!(
        "cinnabar-kernel {} builds for x86_64 bare metal; run `cargo test` here",
        env!("CARGO_PKG_VERSION")
    );
}
