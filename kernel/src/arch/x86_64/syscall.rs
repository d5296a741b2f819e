//! x86_64 fast-syscall entry
//!
//! The naked entry swaps to the current thread's kernel stack, lays the
//! user-visible registers out as a [`UserContext`] image, and hands it to
//! the dispatcher. On the way out the image (which may belong to a
//! different moment: the thread could have slept through several switches)
//! is popped back and `sysretq` crosses into user mode.

use core::arch::naked_asm;

use x86_64::registers::model_specific::{Efer, EferFlags, LStar, SFMask, Star};
use x86_64::registers::rflags::RFlags;
use x86_64::VirtAddr;

use super::{context, gdt, percpu};
use crate::sched::{UserContext, TCBS};

/// Enable SYSCALL/SYSRET and install the entry point. Interrupts stay
/// masked for the whole kernel via SFMASK.
pub fn init() {
    let sel = gdt::selectors();
    // SAFETY: the selectors satisfy the STAR layout rules (see gdt.rs) and
    // the entry symbol is a naked function expecting the SYSCALL register
    // state.
    unsafe {
        Efer::update(|flags| {
            flags.insert(EferFlags::SYSTEM_CALL_EXTENSIONS);
        });
        LStar::write(VirtAddr::new(syscall_entry as usize as u64));
        Star::write(
            sel.user_code_selector,
            sel.user_data_selector,
            sel.code_selector,
            sel.data_selector,
        )
        .unwrap();
        SFMask::write(RFlags::INTERRUPT_FLAG);
    }
}

/// SYSCALL lands here: RCX holds the user RIP, R11 the user RFLAGS, RAX
/// the syscall number, and arguments sit in RDI, RSI, RDX, R10, R8, R9.
///
/// The pushes below build a `UserContext` image in field order (rax at
/// the lowest address), so the stack pointer itself becomes the `&mut
/// UserContext` argument.
///
/// # Safety
///
/// Entered only by the CPU's SYSCALL instruction with the MSR setup from
/// `init` in place.
#[unsafe(naked)]
pub unsafe extern "C" fn syscall_entry() {
    naked_asm!(
        "swapgs",
        "mov gs:[8], rsp",
        "mov rsp, gs:[0]",
        // UserContext image, highest field first.
        "push r11",              // rflags
        "push qword ptr gs:[8]", // user rsp
        "push rcx",              // user rip
        "push r9",
        "push r8",
        "push r10",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rax",
        "mov rdi, rsp",
        "call {handler}",
        // The image now reflects whoever is current; hand it back.
        "pop rax",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop r10",
        "pop r8",
        "pop r9",
        "pop rcx",          // user rip for sysret
        "mov r11, [rsp + 8]", // user rflags for sysret
        "mov rsp, [rsp]",   // user stack
        "swapgs",
        "sysretq",
        handler = sym syscall_rust,
    )
}

/// Rust half of the entry: persist the frame into the TCB, dispatch, run
/// whatever switch fell out, and load the (possibly rewritten) frame back.
extern "C" fn syscall_rust(frame: &mut UserContext) {
    let caller = percpu::current_tid();
    {
        let mut tcbs = TCBS.lock();
        tcbs.get_mut(caller).ctx = *frame;
    }

    let args = frame.args();
    let outcome = crate::syscall::dispatch(caller, frame.rax, args);
    if let Some(switch) = outcome.switch {
        // Control comes back here once the scheduler picks this thread
        // again; for a blocked caller that is after its wake-up wrote the
        // real return registers.
        context::perform(switch);
    }

    let mut tcbs = TCBS.lock();
    *frame = tcbs.get(caller).ctx;
}
