//! Per-CPU anchor
//!
//! The syscall entry reaches this block through GS: the kernel stack to
//! adopt, the parked user stack pointer, and the running thread's id. One
//! instance for the single processor; an SMP port would make this an
//! array indexed by the local APIC id.

use x86_64::registers::model_specific::{GsBase, KernelGsBase};
use x86_64::VirtAddr;

use crate::sched::Tid;

#[repr(C)]
pub struct PerCpu {
    /// gs:[0x00] - kernel stack top of the current thread
    pub kernel_rsp: u64,
    /// gs:[0x08] - user RSP parked across a syscall
    pub user_rsp: u64,
    /// gs:[0x10] - currently running thread
    pub current_tid: u64,
}

static mut PER_CPU: PerCpu = PerCpu {
    kernel_rsp: 0,
    user_rsp: 0,
    current_tid: 0,
};

/// Point the kernel GS at the per-CPU block. While a thread runs in user
/// mode the bases are swapped, so the user sees a zero GS base.
pub fn init() {
    let base = VirtAddr::new(&raw const PER_CPU as u64);
    GsBase::write(base);
    KernelGsBase::write(VirtAddr::new(0));
}

/// Retarget the block at a new current thread. Runs on every switch with
/// interrupts disabled.
pub fn set_current(tid: Tid, kernel_stack_top: u64) {
    let block = &raw mut PER_CPU;
    // SAFETY: single processor and interrupts are off; nothing else is
    // reading the block while it changes.
    unsafe {
        (*block).current_tid = tid as u64;
        (*block).kernel_rsp = kernel_stack_top;
    }
}

pub fn current_tid() -> Tid {
    let block = &raw const PER_CPU;
    // SAFETY: as for `set_current`.
    unsafe { (*block).current_tid as Tid }
}
