//! Synchronous IPC
//!
//! Call and ReplyWait rendezvous on endpoints with register-borne
//! three-word messages. When a partner is already waiting the processor is
//! handed over directly; the scheduler is bypassed. State transitions
//! finish before any switch decision is returned, so a preemption on the
//! boundary never observes a half-moved message.
//!
//! Every function here returns `(return_value, switch)`: the value for the
//! invoking thread's return register and the switch the caller must carry
//! out once locks are dropped. A thread that blocks gets its true return
//! value written by whoever wakes it.

use crate::cap::{CapObject, CapRef, CapSpace, Rights};
use crate::error::{KernelError, Result};
use crate::sched::{Scheduler, Switch, TcbPool, ThreadState, Tid};

use super::endpoint::{EndpointId, EndpointPool};

/// Outcome of an IPC operation
pub type IpcOutcome = (i64, Option<Switch>);

/// Resolve the endpoint capability at `slot` in `caller`'s root CNode,
/// demanding `required` rights. Returns the endpoint id and the badge of
/// the invoked capability (which is what the receiver will observe).
fn resolve_endpoint(
    caps: &CapSpace,
    tcbs: &TcbPool,
    caller: Tid,
    slot: u16,
    required: Rights,
) -> Result<(EndpointId, u64)> {
    let cap_root = tcbs.get(caller).cap_root;
    let cap = caps.cap(CapRef::new(cap_root, slot))?;
    let CapObject::Endpoint { id } = cap.object else {
        return Err(KernelError::NoCap);
    };
    if !cap.rights.contains(required) {
        return Err(KernelError::AccessDenied);
    }
    Ok((id, cap.badge))
}

/// Send `msg` and wait for the reply.
///
/// With a receiver parked on the endpoint the message lands directly in
/// its frame and the processor follows it. Otherwise the caller parks on
/// the send queue; `timeout` of zero means block forever, anything else
/// means fail immediately instead.
#[allow(clippy::too_many_arguments)]
pub fn call(
    caps: &CapSpace,
    endpoints: &mut EndpointPool,
    tcbs: &mut TcbPool,
    sched: &mut Scheduler,
    caller: Tid,
    ep_slot: u16,
    msg: [u64; 3],
    timeout: u64,
) -> Result<IpcOutcome> {
    let (id, badge) = resolve_endpoint(caps, tcbs, caller, ep_slot, Rights::WRITE)?;
    if !endpoints.is_allocated(id) {
        return Err(KernelError::InvalidState);
    }

    if let Some(receiver) = endpoints.pop_recv(tcbs, id) {
        let (rcv, snd) = tcbs.pair_mut(receiver, caller);
        rcv.ctx.set_message(badge, msg);
        rcv.ctx.set_return(caller as i64);
        rcv.wait_on = None;
        snd.state = ThreadState::BlockedReply;
        let switch = sched.direct_switch(tcbs, receiver);
        return Ok((0, Some(switch)));
    }

    if timeout > 0 {
        return Err(KernelError::WouldBlock);
    }

    let tcb = tcbs.get_mut(caller);
    tcb.stash.badge = badge;
    tcb.stash.msg = msg;
    tcb.wait_on = Some(id);
    endpoints.push_send(tcbs, id, caller)?;
    let switch = sched.block_current(tcbs, ThreadState::BlockedSend);
    Ok((0, switch))
}

/// Atomically reply to a previous caller and wait for the next message.
///
/// A zero `client_tid` skips the reply phase (the server's first wait).
#[allow(clippy::too_many_arguments)]
pub fn reply_wait(
    caps: &CapSpace,
    endpoints: &mut EndpointPool,
    tcbs: &mut TcbPool,
    sched: &mut Scheduler,
    server: Tid,
    client_tid: u64,
    reply: [u64; 2],
    ep_slot: u16,
) -> Result<IpcOutcome> {
    let (id, _) = resolve_endpoint(caps, tcbs, server, ep_slot, Rights::READ)?;
    if !endpoints.is_allocated(id) {
        return Err(KernelError::InvalidState);
    }

    if client_tid != 0 {
        let client = Tid::try_from(client_tid).map_err(|_| KernelError::Invalid)?;
        if !tcbs.is_live(client) || tcbs.get(client).state != ThreadState::BlockedReply {
            return Err(KernelError::NoCaller);
        }
        let tcb = tcbs.get_mut(client);
        tcb.ctx.scrub_args();
        tcb.ctx.set_reply(reply[0], reply[1]);
        tcb.ctx.set_return(0);
        sched.make_runnable(tcbs, client);
    }

    if let Some(sender) = endpoints.pop_send(tcbs, id) {
        let stash = tcbs.get(sender).stash;
        tcbs.get_mut(sender).state = ThreadState::BlockedReply;
        tcbs.get_mut(sender).wait_on = None;
        let tcb = tcbs.get_mut(server);
        tcb.ctx.set_message(stash.badge, stash.msg);
        return Ok((sender as i64, None));
    }

    // Nothing pending: a sleeping waiter's message registers must read as
    // zero until a sender fills them.
    tcbs.get_mut(server).ctx.scrub_args();
    tcbs.get_mut(server).wait_on = Some(id);
    endpoints.push_recv(tcbs, id, server)?;
    let switch = sched.block_current(tcbs, ThreadState::BlockedRecv);
    Ok((0, switch))
}

/// One-way send: deliver to a waiting receiver via direct switch, or fail
/// with `WouldBlock` when nobody is listening.
pub fn send(
    caps: &CapSpace,
    endpoints: &mut EndpointPool,
    tcbs: &mut TcbPool,
    sched: &mut Scheduler,
    caller: Tid,
    ep_slot: u16,
    msg: [u64; 3],
) -> Result<IpcOutcome> {
    let (id, badge) = resolve_endpoint(caps, tcbs, caller, ep_slot, Rights::WRITE)?;
    if !endpoints.is_allocated(id) {
        return Err(KernelError::InvalidState);
    }

    let Some(receiver) = endpoints.pop_recv(tcbs, id) else {
        return Err(KernelError::WouldBlock);
    };
    let rcv = tcbs.get_mut(receiver);
    rcv.ctx.set_message(badge, msg);
    rcv.ctx.set_return(caller as i64);
    rcv.wait_on = None;
    // The sender does not await a reply; it lines up behind everyone else
    // while the receiver takes the processor.
    sched.make_runnable(tcbs, caller);
    let switch = sched.direct_switch(tcbs, receiver);
    Ok((0, Some(switch)))
}

/// Block until a sender arrives, then return its message.
pub fn recv(
    caps: &CapSpace,
    endpoints: &mut EndpointPool,
    tcbs: &mut TcbPool,
    sched: &mut Scheduler,
    caller: Tid,
    ep_slot: u16,
) -> Result<IpcOutcome> {
    let (id, _) = resolve_endpoint(caps, tcbs, caller, ep_slot, Rights::READ)?;
    if !endpoints.is_allocated(id) {
        return Err(KernelError::InvalidState);
    }

    if let Some(sender) = endpoints.pop_send(tcbs, id) {
        let stash = tcbs.get(sender).stash;
        tcbs.get_mut(sender).state = ThreadState::BlockedReply;
        tcbs.get_mut(sender).wait_on = None;
        let tcb = tcbs.get_mut(caller);
        tcb.ctx.set_message(stash.badge, stash.msg);
        return Ok((sender as i64, None));
    }

    tcbs.get_mut(caller).ctx.scrub_args();
    tcbs.get_mut(caller).wait_on = Some(id);
    endpoints.push_recv(tcbs, id, caller)?;
    let switch = sched.block_current(tcbs, ThreadState::BlockedRecv);
    Ok((0, switch))
}
