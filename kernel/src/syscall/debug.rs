//! Debug system calls (98-99)

use super::{HandlerResult, SyscallCtx};

/// DebugDumpCaps(): log the caller's root CNode.
pub fn dump_caps(ctx: &mut SyscallCtx<'_>, _args: [u64; 6]) -> HandlerResult {
    ctx.caps.dump(ctx.cap_root());
    Ok((0, None))
}

/// DebugPutchar(byte): emit one byte on the kernel console.
pub fn putchar(_ctx: &mut SyscallCtx<'_>, args: [u64; 6]) -> HandlerResult {
    crate::serial::putchar(args[0] as u8);
    Ok((args[0] as i64 & 0xFF, None))
}
