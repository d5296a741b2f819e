//! Capability management system calls (1-6, 20)

use super::{HandlerResult, SyscallCtx, NO_SLOT};
use crate::cap::{CapObject, CapRef, CapType, Rights};
use crate::config::CNODE_SLOTS;
use crate::error::KernelError;
use crate::mm::vmm;

fn cap_type_from(arg: u64) -> Result<CapType, KernelError> {
    Ok(match arg {
        2 => CapType::CNode,
        3 => CapType::Endpoint,
        4 => CapType::Thread,
        5 => CapType::AddressSpace,
        6 => CapType::Frame,
        7 => CapType::PageTable,
        _ => return Err(KernelError::Invalid),
    })
}

/// Give freshly retyped objects their physical identity: new address-space
/// roots inherit the kernel half, and raw memory objects start zeroed.
pub(super) fn materialize(ctx: &mut SyscallCtx<'_>, dest: CapRef, count: usize) {
    for i in 0..count {
        let at = CapRef::new(dest.cnode, dest.slot + i as u16);
        match ctx.caps.cap(at).map(|s| s.object) {
            Ok(CapObject::AddressSpace { root }) => {
                vmm::with_active(|a| vmm::init_root_frame(a, root));
            }
            Ok(CapObject::Frame { base }) | Ok(CapObject::PageTable { base }) => {
                vmm::with_active(|a| a.zero_frame(base));
            }
            _ => {}
        }
    }
}

/// CapCreate(untyped_slot, type, dest_slot): retype a single object.
pub fn cap_create(ctx: &mut SyscallCtx<'_>, args: [u64; 6]) -> HandlerResult {
    let src = ctx.slot(args[0])?;
    let ty = cap_type_from(args[1])?;
    let dest = ctx.slot(args[2])?;
    let (caps, mut res) = ctx.cap_op();
    caps.retype(&mut res, src, ty, dest, 1)?;
    materialize(ctx, dest, 1);
    Ok((dest.slot as i64, None))
}

/// Retype(untyped_slot, type, dest_slot, count)
pub fn retype(ctx: &mut SyscallCtx<'_>, args: [u64; 6]) -> HandlerResult {
    let src = ctx.slot(args[0])?;
    let ty = cap_type_from(args[1])?;
    let dest = ctx.slot(args[2])?;
    let count = usize::try_from(args[3]).map_err(|_| KernelError::Invalid)?;
    let (caps, mut res) = ctx.cap_op();
    caps.retype(&mut res, src, ty, dest, count)?;
    materialize(ctx, dest, count);
    Ok((dest.slot as i64, None))
}

/// CapDelete(slot): detach without destroying the subtree.
pub fn cap_delete(ctx: &mut SyscallCtx<'_>, args: [u64; 6]) -> HandlerResult {
    let at = ctx.slot(args[0])?;
    ctx.caps.delete(at)?;
    Ok((0, None))
}

/// CapRevoke(slot): destroy the whole derivation subtree.
pub fn cap_revoke(ctx: &mut SyscallCtx<'_>, args: [u64; 6]) -> HandlerResult {
    let at = ctx.slot(args[0])?;
    let (caps, mut res) = ctx.cap_op();
    caps.revoke(&mut res, at)?;
    Ok((0, None))
}

/// CapTransfer(src_slot, dest_cnode_slot, dest_slot, move_flag)
///
/// The destination CNode is named by a slot in the caller's root holding
/// a CNode capability; `NO_SLOT` targets the root itself.
pub fn cap_transfer(ctx: &mut SyscallCtx<'_>, args: [u64; 6]) -> HandlerResult {
    let src = ctx.slot(args[0])?;
    let dest_cnode = if args[1] == NO_SLOT {
        ctx.cap_root()
    } else {
        let holder = ctx.caps.cap(ctx.slot(args[1])?)?;
        match holder.object {
            CapObject::CNode { id } => id,
            _ => return Err(KernelError::NoCap),
        }
    };
    if args[2] >= CNODE_SLOTS as u64 {
        return Err(KernelError::Invalid);
    }
    let dest = CapRef::new(dest_cnode, args[2] as u16);
    ctx.caps.transfer(src, dest, args[3] != 0)?;
    Ok((dest.slot as i64, None))
}

/// CapMint(src_slot, dest_slot, rights_mask, badge)
pub fn cap_mint(ctx: &mut SyscallCtx<'_>, args: [u64; 6]) -> HandlerResult {
    let src = ctx.slot(args[0])?;
    let dest = ctx.slot(args[1])?;
    let mask = Rights::from_bits_truncate(args[2] as u8);
    ctx.caps.mint(src, dest, mask, args[3])?;
    Ok((dest.slot as i64, None))
}

/// CapVerify(slot, badge): constant-time badge check; 1 = match.
pub fn cap_verify(ctx: &mut SyscallCtx<'_>, args: [u64; 6]) -> HandlerResult {
    let at = ctx.slot(args[0])?;
    Ok((ctx.caps.verify(at, args[1]) as i64, None))
}
