//! System call interface
//!
//! Numbered dispatch over the kernel's operation surface: capability
//! management (1-6), IPC (10-13), memory (20-22), threads (30-33),
//! endpoints and naming (40-42), debug (98-99).
//!
//! `dispatch` runs with every subsystem lock held, scrubs the caller's
//! argument registers on entry, routes by number, and stores the signed
//! return value in the caller's frame. Whatever switch decision falls out
//! is handed back to the architecture layer to execute after the locks
//! are gone.

pub mod capability;
pub mod debug;
pub mod endpoint;
pub mod ipc;
pub mod memory;
pub mod thread;

use crate::cap::{CapRef, CapSpace, Resources, CAP_SPACE};
use crate::config::CNODE_SLOTS;
use crate::error::{KernelError, Result};
use crate::ipc::{EndpointPool, ENDPOINTS};
use crate::mm::{FrameAllocator, FRAME_ALLOCATOR};
use crate::sched::{Scheduler, Switch, TcbPool, Tid, SCHEDULER, TCBS};

/// Argument sentinel meaning "no slot": the caller's root CNode for
/// transfer destinations, the caller's own address space for thread
/// creation.
pub const NO_SLOT: u64 = u64::MAX;

/// The numbered operation surface (stable ABI)
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallNumber {
    CapCreate = 1,
    CapDelete = 2,
    CapRevoke = 3,
    CapTransfer = 4,
    CapMint = 5,
    CapVerify = 6,

    IpcSend = 10,
    IpcRecv = 11,
    IpcCall = 12,
    IpcReplyWait = 13,

    Retype = 20,
    MapFrame = 21,
    UnmapFrame = 22,

    ThreadCreate = 30,
    ThreadResume = 31,
    ThreadSuspend = 32,
    ThreadSetPriority = 33,

    EndpointCreate = 40,
    EndpointDelete = 41,
    NamespaceRegister = 42,

    DebugDumpCaps = 98,
    DebugPutchar = 99,
}

impl TryFrom<u64> for SyscallNumber {
    type Error = ();

    fn try_from(n: u64) -> core::result::Result<Self, ()> {
        Ok(match n {
            1 => Self::CapCreate,
            2 => Self::CapDelete,
            3 => Self::CapRevoke,
            4 => Self::CapTransfer,
            5 => Self::CapMint,
            6 => Self::CapVerify,
            10 => Self::IpcSend,
            11 => Self::IpcRecv,
            12 => Self::IpcCall,
            13 => Self::IpcReplyWait,
            20 => Self::Retype,
            21 => Self::MapFrame,
            22 => Self::UnmapFrame,
            30 => Self::ThreadCreate,
            31 => Self::ThreadResume,
            32 => Self::ThreadSuspend,
            33 => Self::ThreadSetPriority,
            40 => Self::EndpointCreate,
            41 => Self::EndpointDelete,
            42 => Self::NamespaceRegister,
            98 => Self::DebugDumpCaps,
            99 => Self::DebugPutchar,
            _ => return Err(()),
        })
    }
}

/// What a completed dispatch hands back to the entry path
#[derive(Debug, Clone, Copy)]
pub struct DispatchOutcome {
    /// Signed return value, already stored in the caller's frame
    pub value: i64,
    /// Context switch to carry out, if any
    pub switch: Option<Switch>,
}

/// Everything a handler may touch, locks already held by `dispatch`
pub struct SyscallCtx<'a> {
    pub caps: &'a mut CapSpace,
    pub pmm: &'a mut FrameAllocator,
    pub endpoints: &'a mut EndpointPool,
    pub tcbs: &'a mut TcbPool,
    pub sched: &'a mut Scheduler,
    pub caller: Tid,
}

impl SyscallCtx<'_> {
    /// The caller's root CNode id
    pub fn cap_root(&self) -> u16 {
        self.tcbs.get(self.caller).cap_root
    }

    /// Interpret a slot argument as a reference into the caller's root
    /// CNode.
    pub fn slot(&self, arg: u64) -> Result<CapRef> {
        if arg >= CNODE_SLOTS as u64 {
            return Err(KernelError::Invalid);
        }
        Ok(CapRef::new(self.cap_root(), arg as u16))
    }

    /// Split into the store and the collaborating pools for retype and
    /// revoke.
    pub fn cap_op(&mut self) -> (&mut CapSpace, Resources<'_>) {
        (
            &mut *self.caps,
            Resources {
                pmm: &mut *self.pmm,
                tcbs: &mut *self.tcbs,
                sched: &mut *self.sched,
                endpoints: &mut *self.endpoints,
            },
        )
    }
}

type HandlerResult = Result<(i64, Option<Switch>)>;

/// Route one decoded syscall.
fn route(n: SyscallNumber, ctx: &mut SyscallCtx<'_>, args: [u64; 6]) -> HandlerResult {
    match n {
        SyscallNumber::CapCreate => capability::cap_create(ctx, args),
        SyscallNumber::CapDelete => capability::cap_delete(ctx, args),
        SyscallNumber::CapRevoke => capability::cap_revoke(ctx, args),
        SyscallNumber::CapTransfer => capability::cap_transfer(ctx, args),
        SyscallNumber::CapMint => capability::cap_mint(ctx, args),
        SyscallNumber::CapVerify => capability::cap_verify(ctx, args),

        SyscallNumber::IpcSend => ipc::ipc_send(ctx, args),
        SyscallNumber::IpcRecv => ipc::ipc_recv(ctx, args),
        SyscallNumber::IpcCall => ipc::ipc_call(ctx, args),
        SyscallNumber::IpcReplyWait => ipc::ipc_reply_wait(ctx, args),

        SyscallNumber::Retype => capability::retype(ctx, args),
        SyscallNumber::MapFrame => memory::map_frame(ctx, args),
        SyscallNumber::UnmapFrame => memory::unmap_frame(ctx, args),

        SyscallNumber::ThreadCreate => thread::thread_create(ctx, args),
        SyscallNumber::ThreadResume => thread::thread_resume(ctx, args),
        SyscallNumber::ThreadSuspend => thread::thread_suspend(ctx, args),
        SyscallNumber::ThreadSetPriority => thread::thread_set_priority(ctx, args),

        SyscallNumber::EndpointCreate => endpoint::endpoint_create(ctx, args),
        SyscallNumber::EndpointDelete => endpoint::endpoint_delete(ctx, args),
        SyscallNumber::NamespaceRegister => endpoint::namespace_register(ctx, args),

        SyscallNumber::DebugDumpCaps => debug::dump_caps(ctx, args),
        SyscallNumber::DebugPutchar => debug::putchar(ctx, args),
    }
}

/// Execute one system call on behalf of `caller`.
///
/// The caller's argument registers are scrubbed before the handler runs,
/// so only values a handler (or a later wake-up) writes back cross the
/// privilege boundary.
pub fn dispatch(caller: Tid, number: u64, args: [u64; 6]) -> DispatchOutcome {
    let mut caps = CAP_SPACE.lock();
    let mut pmm = FRAME_ALLOCATOR.lock();
    let mut endpoints = ENDPOINTS.lock();
    let mut tcbs = TCBS.lock();
    let mut sched = SCHEDULER.lock();

    tcbs.get_mut(caller).ctx.scrub_args();

    let result = {
        let mut ctx = SyscallCtx {
            caps: &mut caps,
            pmm: &mut pmm,
            endpoints: &mut endpoints,
            tcbs: &mut tcbs,
            sched: &mut sched,
            caller,
        };
        match SyscallNumber::try_from(number) {
            Ok(n) => route(n, &mut ctx, args),
            Err(()) => Err(KernelError::Invalid),
        }
    };

    let (value, mut switch) = match result {
        Ok(outcome) => outcome,
        Err(err) => (err.to_errno(), None),
    };

    if tcbs.is_live(caller) {
        tcbs.get_mut(caller).ctx.set_return(value);
    }
    // A handler that destroyed or parked the caller without choosing a
    // successor leaves the processor ownerless; pick someone now.
    if switch.is_none() && sched.current() != Some(caller) {
        switch = sched.yield_now(&mut tcbs);
    }

    DispatchOutcome { value, switch }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_decoding_covers_the_surface() {
        for (raw, expect) in [
            (1, SyscallNumber::CapCreate),
            (6, SyscallNumber::CapVerify),
            (10, SyscallNumber::IpcSend),
            (13, SyscallNumber::IpcReplyWait),
            (20, SyscallNumber::Retype),
            (22, SyscallNumber::UnmapFrame),
            (30, SyscallNumber::ThreadCreate),
            (33, SyscallNumber::ThreadSetPriority),
            (40, SyscallNumber::EndpointCreate),
            (42, SyscallNumber::NamespaceRegister),
            (98, SyscallNumber::DebugDumpCaps),
            (99, SyscallNumber::DebugPutchar),
        ] {
            assert_eq!(SyscallNumber::try_from(raw), Ok(expect));
        }
        for raw in [0u64, 7, 9, 14, 19, 23, 34, 43, 97, 100, u64::MAX] {
            assert!(SyscallNumber::try_from(raw).is_err());
        }
    }
}
