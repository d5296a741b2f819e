//! IPC system calls (10-13)
//!
//! Thin marshalling over `ipc::sync`; the endpoint slot argument indexes
//! the caller's root CNode.

use super::{HandlerResult, SyscallCtx};
use crate::config::CNODE_SLOTS;
use crate::error::KernelError;
use crate::ipc::sync;

fn ep_slot(arg: u64) -> Result<u16, KernelError> {
    if arg >= CNODE_SLOTS as u64 {
        return Err(KernelError::Invalid);
    }
    Ok(arg as u16)
}

/// IpcSend(endpoint_slot, m0, m1, m2): non-blocking fast path only.
pub fn ipc_send(ctx: &mut SyscallCtx<'_>, args: [u64; 6]) -> HandlerResult {
    let (value, switch) = sync::send(
        ctx.caps,
        ctx.endpoints,
        ctx.tcbs,
        ctx.sched,
        ctx.caller,
        ep_slot(args[0])?,
        [args[1], args[2], args[3]],
    )?;
    Ok((value, switch))
}

/// IpcRecv(endpoint_slot): block until a sender arrives.
pub fn ipc_recv(ctx: &mut SyscallCtx<'_>, args: [u64; 6]) -> HandlerResult {
    let (value, switch) = sync::recv(
        ctx.caps,
        ctx.endpoints,
        ctx.tcbs,
        ctx.sched,
        ctx.caller,
        ep_slot(args[0])?,
    )?;
    Ok((value, switch))
}

/// IpcCall(endpoint_slot, m0, m1, m2, timeout)
pub fn ipc_call(ctx: &mut SyscallCtx<'_>, args: [u64; 6]) -> HandlerResult {
    let (value, switch) = sync::call(
        ctx.caps,
        ctx.endpoints,
        ctx.tcbs,
        ctx.sched,
        ctx.caller,
        ep_slot(args[0])?,
        [args[1], args[2], args[3]],
        args[4],
    )?;
    Ok((value, switch))
}

/// IpcReplyWait(client_tid, r0, r1, endpoint_slot)
pub fn ipc_reply_wait(ctx: &mut SyscallCtx<'_>, args: [u64; 6]) -> HandlerResult {
    let (value, switch) = sync::reply_wait(
        ctx.caps,
        ctx.endpoints,
        ctx.tcbs,
        ctx.sched,
        ctx.caller,
        args[0],
        [args[1], args[2]],
        ep_slot(args[3])?,
    )?;
    Ok((value, switch))
}
