//! x86_64 context switching
//!
//! Each thread owns a kernel stack. Switching threads means saving the
//! callee-saved registers and the stack pointer of the outgoing thread and
//! restoring the incoming one's; a thread that has never run carries a
//! synthetic frame whose tail is a privilege return into its entry point.

use core::arch::naked_asm;

use super::{gdt, percpu};
use crate::config::{KERNEL_STACK_SIZE, MAX_THREADS};
use crate::mm::{vmm, VirtualAddress};
use crate::sched::{Switch, Tid, INITIAL_RFLAGS, TCBS};

#[repr(align(16))]
struct KernelStack([u8; KERNEL_STACK_SIZE]);

static mut KERNEL_STACKS: [KernelStack; MAX_THREADS] =
    [const { KernelStack([0; KERNEL_STACK_SIZE]) }; MAX_THREADS];

/// Where the very first switch parks the boot stack pointer; nothing ever
/// switches back to it.
static mut BOOT_SP_SINK: u64 = 0;

/// Top of the kernel stack owned by `tid`.
pub fn kernel_stack_top(tid: Tid) -> VirtualAddress {
    let base = &raw const KERNEL_STACKS as u64;
    VirtualAddress::new(base + (tid as u64 + 1) * KERNEL_STACK_SIZE as u64)
}

/// Lay down the synthetic kernel-stack frame for a fresh thread: six
/// zeroed callee-saved slots, the trampoline return address, and the
/// privilege-return frame {RIP, CS, RFLAGS, RSP, SS} it consumes.
/// Returns the stack pointer to hand to the first switch.
pub fn build_initial_stack(
    stack_top: VirtualAddress,
    entry: VirtualAddress,
    user_sp: VirtualAddress,
    user_mode: bool,
) -> VirtualAddress {
    let selectors = gdt::selectors();
    let (cs, ss, trampoline) = if user_mode {
        (
            selectors.user_code_selector.0 as u64,
            selectors.user_data_selector.0 as u64,
            user_entry_trampoline as usize as u64,
        )
    } else {
        (
            selectors.code_selector.0 as u64,
            selectors.data_selector.0 as u64,
            kernel_entry_trampoline as usize as u64,
        )
    };

    let sp = (stack_top.as_u64() & !0xF) - 12 * 8;
    let frame = sp as *mut u64;
    // SAFETY: the frame lies inside this thread's own kernel stack, which
    // nothing else touches before the first switch.
    unsafe {
        for i in 0..6 {
            frame.add(i).write(0); // r15, r14, r13, r12, rbx, rbp
        }
        frame.add(6).write(trampoline);
        frame.add(7).write(entry.as_u64());
        frame.add(8).write(cs);
        frame.add(9).write(INITIAL_RFLAGS);
        frame.add(10).write(user_sp.as_u64());
        frame.add(11).write(ss);
    }
    VirtualAddress::new(sp)
}

/// First entry into user mode: make the user GS active so the syscall
/// entry's `swapgs` finds the kernel one.
#[unsafe(naked)]
unsafe extern "C" fn user_entry_trampoline() -> ! {
    naked_asm!("swapgs", "iretq")
}

#[unsafe(naked)]
unsafe extern "C" fn kernel_entry_trampoline() -> ! {
    naked_asm!("iretq")
}

/// Swap kernel stacks: save callee-saved state and RSP of the outgoing
/// thread through `save_sp`, adopt `new_sp`, and return on the incoming
/// thread's stack.
///
/// # Safety
///
/// Interrupts must be disabled. `new_sp` must point at a frame produced
/// by `build_initial_stack` or by an earlier save in this function.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(save_sp: *mut u64, new_sp: u64) {
    naked_asm!(
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [rdi], rsp",
        "mov rsp, rsi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    )
}

/// Carry out a scheduler decision: retarget the per-CPU kernel stack and
/// the TSS, reload CR3 when the address space differs, then switch stacks.
///
/// Returns when this thread is switched back in (never, for a thread that
/// was destroyed).
pub fn perform(switch: Switch) {
    let (save_sp, new_sp, new_stack_top, new_root) = {
        let mut tcbs = TCBS.lock();
        let to = tcbs.get(switch.to);
        let new_sp = to.saved_sp.as_u64();
        let new_stack_top = to.kernel_stack_top.as_u64();
        let new_root = to.address_space;
        let save_sp = match switch.from {
            Some(from) => &raw mut tcbs.get_mut(from).saved_sp.0,
            None => &raw mut BOOT_SP_SINK,
        };
        (save_sp, new_sp, new_stack_top, new_root)
    };

    gdt::set_kernel_stack(new_stack_top);
    percpu::set_current(switch.to, new_stack_top);
    if new_root.as_u64() != 0 {
        vmm::switch_root(new_root);
    }

    // SAFETY: interrupts are off for the whole kernel; the target frame
    // was written by build_initial_stack or by this function's save path.
    unsafe { context_switch(save_sp, new_sp) };
}
