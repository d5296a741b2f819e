//! Thread system calls (30-33)

use super::{HandlerResult, SyscallCtx, NO_SLOT};
use crate::cap::{CapObject, CapType};
use crate::error::KernelError;
use crate::mm::VirtualAddress;
use crate::sched::{self, ThreadState, Tid};

fn thread_of(ctx: &SyscallCtx<'_>, slot_arg: u64) -> Result<Tid, KernelError> {
    let cap = ctx.caps.cap(ctx.slot(slot_arg)?)?;
    let CapObject::Thread { tid } = cap.object else {
        return Err(KernelError::NoCap);
    };
    if !ctx.tcbs.is_live(tid) {
        return Err(KernelError::InvalidState);
    }
    Ok(tid)
}

/// ThreadCreate(untyped_slot, dest_slot, entry, user_sp, aspace_slot)
///
/// Retypes a TCB (and its kernel stack's worth of bytes) out of the
/// Untyped, then prepares it to enter user mode at `entry`. The new thread
/// shares the caller's capability root; `NO_SLOT` for the address-space
/// argument shares the caller's address space. The thread starts
/// Suspended.
pub fn thread_create(ctx: &mut SyscallCtx<'_>, args: [u64; 6]) -> HandlerResult {
    let src = ctx.slot(args[0])?;
    let dest = ctx.slot(args[1])?;
    let entry = VirtualAddress::new(args[2]);
    let user_sp = VirtualAddress::new(args[3]);
    if !entry.is_user() || !user_sp.is_user() {
        return Err(KernelError::Invalid);
    }
    let address_space = if args[4] == NO_SLOT {
        ctx.tcbs.get(ctx.caller).address_space
    } else {
        match ctx.caps.cap(ctx.slot(args[4])?)?.object {
            CapObject::AddressSpace { root } => root,
            _ => return Err(KernelError::NoCap),
        }
    };

    let (caps, mut res) = ctx.cap_op();
    caps.retype(&mut res, src, CapType::Thread, dest, 1)?;
    let CapObject::Thread { tid } = ctx.caps.cap(dest)?.object else {
        return Err(KernelError::InvalidState);
    };

    let caller_root = ctx.cap_root();
    let caller_priority = ctx.tcbs.get(ctx.caller).priority;
    let tcb = ctx.tcbs.get_mut(tid);
    tcb.cap_root = caller_root;
    tcb.address_space = address_space;
    tcb.priority = caller_priority;
    sched::setup_thread(tcb, entry, user_sp, true);
    tcb.state = ThreadState::Suspended;

    Ok((tid as i64, None))
}

/// ThreadResume(slot): Suspended -> Runnable.
pub fn thread_resume(ctx: &mut SyscallCtx<'_>, args: [u64; 6]) -> HandlerResult {
    let tid = thread_of(ctx, args[0])?;
    if ctx.tcbs.get(tid).state != ThreadState::Suspended {
        return Err(KernelError::InvalidState);
    }
    ctx.sched.make_runnable(ctx.tcbs, tid);
    Ok((0, None))
}

/// ThreadSuspend(slot): take a thread off the processor and all queues.
pub fn thread_suspend(ctx: &mut SyscallCtx<'_>, args: [u64; 6]) -> HandlerResult {
    let tid = thread_of(ctx, args[0])?;
    match ctx.tcbs.get(tid).state {
        ThreadState::Suspended => Ok((0, None)),
        ThreadState::Running => {
            // Only the current thread is Running; it is parking itself.
            let switch = ctx.sched.block_current(ctx.tcbs, ThreadState::Suspended);
            Ok((0, switch))
        }
        ThreadState::Runnable => {
            ctx.sched.remove_thread(ctx.tcbs, tid);
            ctx.tcbs.get_mut(tid).state = ThreadState::Suspended;
            Ok((0, None))
        }
        ThreadState::BlockedSend | ThreadState::BlockedRecv => {
            if let Some(ep) = ctx.tcbs.get(tid).wait_on {
                ctx.endpoints.unqueue(ctx.tcbs, ep, tid);
            }
            let tcb = ctx.tcbs.get_mut(tid);
            tcb.wait_on = None;
            tcb.state = ThreadState::Suspended;
            Ok((0, None))
        }
        ThreadState::Blocked | ThreadState::BlockedReply => {
            ctx.tcbs.get_mut(tid).state = ThreadState::Suspended;
            Ok((0, None))
        }
        ThreadState::Free => Err(KernelError::InvalidState),
    }
}

/// ThreadSetPriority(slot, priority)
///
/// Priority is advisory, but raising a thread above the caller's own
/// level is still refused.
pub fn thread_set_priority(ctx: &mut SyscallCtx<'_>, args: [u64; 6]) -> HandlerResult {
    let tid = thread_of(ctx, args[0])?;
    let priority = u8::try_from(args[1]).map_err(|_| KernelError::Invalid)?;
    if priority < ctx.tcbs.get(ctx.caller).priority {
        return Err(KernelError::AccessDenied);
    }
    ctx.tcbs.get_mut(tid).priority = priority;
    Ok((0, None))
}
