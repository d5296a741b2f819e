//! Endpoint and naming system calls (40-42)

use super::{HandlerResult, SyscallCtx};
use crate::cap::{CapObject, CapType, Rights};
use crate::error::KernelError;
use crate::namespace::{self, NAMESPACE};

/// EndpointCreate(untyped_slot, dest_slot): retype an Untyped into a
/// fresh Endpoint object.
pub fn endpoint_create(ctx: &mut SyscallCtx<'_>, args: [u64; 6]) -> HandlerResult {
    let src = ctx.slot(args[0])?;
    let dest = ctx.slot(args[1])?;
    let (caps, mut res) = ctx.cap_op();
    caps.retype(&mut res, src, CapType::Endpoint, dest, 1)?;
    Ok((dest.slot as i64, None))
}

/// EndpointDelete(slot): revoke the endpoint; queued threads wake with an
/// error and name bindings disappear.
pub fn endpoint_delete(ctx: &mut SyscallCtx<'_>, args: [u64; 6]) -> HandlerResult {
    let at = ctx.slot(args[0])?;
    let cap = ctx.caps.cap(at)?;
    let CapObject::Endpoint { id } = cap.object else {
        return Err(KernelError::NoCap);
    };
    NAMESPACE.lock().forget_endpoint(id);
    let (caps, mut res) = ctx.cap_op();
    caps.revoke(&mut res, at)?;
    Ok((0, None))
}

/// NamespaceRegister(endpoint_slot, name_word0, name_word1)
///
/// The name travels packed in two argument words; registering requires
/// the Grant right since it hands the endpoint to anyone who asks for
/// the name.
pub fn namespace_register(ctx: &mut SyscallCtx<'_>, args: [u64; 6]) -> HandlerResult {
    let cap = ctx.caps.cap(ctx.slot(args[0])?)?;
    let CapObject::Endpoint { id } = cap.object else {
        return Err(KernelError::NoCap);
    };
    if !cap.rights.contains(Rights::GRANT) {
        return Err(KernelError::AccessDenied);
    }
    let name = namespace::name_from_words(args[1], args[2]);
    NAMESPACE.lock().register(name, id)?;
    Ok((0, None))
}
