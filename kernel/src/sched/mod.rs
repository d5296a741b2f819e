//! Thread management and scheduling
//!
//! The TCB pool, the FIFO run queue, and the scheduler proper. All state
//! lives in fixed pools behind spin locks; scheduling decisions come back
//! as [`Switch`] values that the architecture layer turns into real stack
//! switches.

pub mod queue;
pub mod scheduler;
pub mod tcb;

pub use queue::TidQueue;
pub use scheduler::{Scheduler, Switch};
pub use tcb::{IpcStash, Tcb, TcbPool, ThreadState, Tid, UserContext};

use spin::Mutex;

use crate::mm::VirtualAddress;

/// Global TCB pool
pub static TCBS: Mutex<TcbPool> = Mutex::new(TcbPool::new());

/// Global scheduler state
pub static SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler::new());

/// RFLAGS value for a fresh thread: interrupts enabled, reserved bit set
pub const INITIAL_RFLAGS: u64 = 0x202;

/// Prepare an allocated TCB to run from `entry`.
///
/// Fills the saved user frame and, on bare metal, builds the synthetic
/// kernel-stack frame that makes the first switch to this thread look like
/// a return from an interrupt.
pub fn setup_thread(tcb: &mut Tcb, entry: VirtualAddress, user_sp: VirtualAddress, user_mode: bool) {
    tcb.ctx = UserContext::new();
    tcb.ctx.rip = entry.as_u64();
    tcb.ctx.rsp = user_sp.as_u64();
    tcb.ctx.rflags = INITIAL_RFLAGS;

    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        let stack_top = crate::arch::x86_64::context::kernel_stack_top(tcb.tid);
        tcb.kernel_stack_top = stack_top;
        // A kernel-mode thread (the idle thread) runs on its own kernel
        // stack; only user threads get a separate stack from the caller.
        let initial_sp = if user_mode {
            user_sp
        } else {
            VirtualAddress::new(stack_top.as_u64() & !0xF)
        };
        tcb.ctx.rsp = initial_sp.as_u64();
        tcb.saved_sp = crate::arch::x86_64::context::build_initial_stack(
            stack_top, entry, initial_sp, user_mode,
        );
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        let _ = user_mode;
        tcb.kernel_stack_top = VirtualAddress::new(0);
        tcb.saved_sp = VirtualAddress::new(0);
    }
}

/// Boot-time scheduler setup: pool reset plus the idle thread.
pub fn init(idle_entry: VirtualAddress) -> Tid {
    let mut tcbs = TCBS.lock();
    let mut sched = SCHEDULER.lock();
    tcbs.reset();
    sched.reset();

    let idle = tcbs.alloc().expect("fresh pool cannot be empty");
    let tcb = tcbs.get_mut(idle);
    tcb.priority = crate::config::IDLE_PRIORITY;
    setup_thread(tcb, idle_entry, VirtualAddress::new(0), false);
    tcb.state = ThreadState::Runnable;
    sched.set_idle(idle);

    log::info!("sched: idle thread is tid {}", idle);
    idle
}
