//! IPC subsystem tests
//!
//! These drive the Call/ReplyWait state machine exactly the way the
//! syscall layer does: explicit pools, a scheduler with an idle thread,
//! and switch decisions checked instead of performed.

#![cfg(test)]

use spin::Mutex;

use super::endpoint::EndpointPool;
use super::sync;
use crate::cap::{CapObject, CapRef, CapSpace, CapType, Resources, Rights, ROOT_CNODE};
use crate::config::INITIAL_UNTYPED_BYTES;
use crate::error::KernelError;
use crate::handover::{Handover, MemoryDescriptor};
use crate::mm::{FrameAllocator, FRAME_SIZE};
use crate::sched::{Scheduler, TcbPool, ThreadState, Tid};

static TEST_SPACE: Mutex<CapSpace> = Mutex::new(CapSpace::new());

const UNTYPED_SLOT: CapRef = CapRef::new(ROOT_CNODE, 0);
const EP_SLOT: u16 = 1;

struct Env {
    pmm: FrameAllocator,
    tcbs: TcbPool,
    sched: Scheduler,
    endpoints: EndpointPool,
    idle: Tid,
}

fn with_env(f: impl FnOnce(&mut CapSpace, &mut Env)) {
    let mut caps = TEST_SPACE.lock();
    caps.reset();

    let map = [MemoryDescriptor::conventional(0, 8192)];
    let handover = Handover::for_test(&map, core::mem::size_of::<MemoryDescriptor>() as u64);
    let mut pmm = FrameAllocator::new();
    unsafe { pmm.init(&handover) };

    let mut tcbs = TcbPool::new();
    tcbs.reset();
    let mut sched = Scheduler::new();
    let mut endpoints = EndpointPool::new();
    endpoints.reset();

    let idle = tcbs.alloc().unwrap();
    tcbs.get_mut(idle).state = ThreadState::Runnable;
    sched.set_idle(idle);

    let base = pmm
        .reserve_contiguous(INITIAL_UNTYPED_BYTES / FRAME_SIZE as u64)
        .unwrap();
    caps.seed(
        UNTYPED_SLOT,
        CapObject::Untyped {
            base,
            size: INITIAL_UNTYPED_BYTES,
            offset: 0,
        },
        Rights::full(),
    )
    .unwrap();
    {
        let mut res = Resources {
            pmm: &mut pmm,
            tcbs: &mut tcbs,
            sched: &mut sched,
            endpoints: &mut endpoints,
        };
        caps.retype(
            &mut res,
            UNTYPED_SLOT,
            CapType::Endpoint,
            CapRef::new(ROOT_CNODE, EP_SLOT),
            1,
        )
        .unwrap();
    }

    let mut env = Env {
        pmm,
        tcbs,
        sched,
        endpoints,
        idle,
    };
    f(&mut caps, &mut env);
}

/// Spawn a runnable thread whose capability root is the root CNode.
fn spawn(env: &mut Env) -> Tid {
    let tid = env.tcbs.alloc().unwrap();
    env.tcbs.get_mut(tid).cap_root = ROOT_CNODE;
    env.sched.make_runnable(&mut env.tcbs, tid);
    tid
}

/// Hand the processor to `tid` the way the scheduler would.
fn make_current(env: &mut Env, tid: Tid) {
    if let Some(cur) = env.sched.current() {
        if cur == tid {
            return;
        }
        let tcb = env.tcbs.get_mut(cur);
        if tcb.state == ThreadState::Running {
            tcb.state = ThreadState::Runnable;
            if cur != env.idle {
                env.sched.make_runnable(&mut env.tcbs, cur);
            }
        }
    }
    // Pull it off the run queue if it sits there.
    env.sched.remove_thread(&mut env.tcbs, tid);
    env.sched.direct_switch(&mut env.tcbs, tid);
}

/// Mint the endpoint to a dedicated slot with `badge` and return the slot.
fn mint_ep(caps: &mut CapSpace, slot: u16, badge: u64, rights: Rights) -> u16 {
    caps.mint(
        CapRef::new(ROOT_CNODE, EP_SLOT),
        CapRef::new(ROOT_CNODE, slot),
        rights,
        badge,
    )
    .unwrap();
    slot
}

#[test]
fn call_delivers_badge_and_message_to_waiting_receiver() {
    with_env(|caps, env| {
        let client = spawn(env);
        let server = spawn(env);
        let slot = mint_ep(caps, 2, 0x42, Rights::READ | Rights::WRITE);

        // Server waits first.
        make_current(env, server);
        let (_, switch) = sync::reply_wait(
            caps,
            &mut env.endpoints,
            &mut env.tcbs,
            &mut env.sched,
            server,
            0,
            [0, 0],
            EP_SLOT,
        )
        .unwrap();
        assert!(switch.is_some());
        assert_eq!(env.tcbs.get(server).state, ThreadState::BlockedRecv);

        // Client calls through the badged slot.
        make_current(env, client);
        let (_, switch) = sync::call(
            caps,
            &mut env.endpoints,
            &mut env.tcbs,
            &mut env.sched,
            client,
            slot,
            [0xAA, 0xBB, 0xCC],
            0,
        )
        .unwrap();

        // Direct switch to the server, bypassing the run queue.
        assert_eq!(switch.map(|s| s.to), Some(server));
        assert_eq!(env.sched.current(), Some(server));
        assert_eq!(env.sched.queued_count(&env.tcbs, server), 0);

        let srv = env.tcbs.get(server);
        assert_eq!(srv.state, ThreadState::Running);
        assert_eq!(srv.ctx.rdi, 0x42);
        assert_eq!(srv.ctx.rsi, 0xAA);
        assert_eq!(srv.ctx.rdx, 0xBB);
        assert_eq!(srv.ctx.r10, 0xCC);
        assert_eq!(srv.ctx.rax as i64, client as i64);

        assert_eq!(env.tcbs.get(client).state, ThreadState::BlockedReply);
    });
}

#[test]
fn reply_wait_resumes_client_and_reblocks_server() {
    with_env(|caps, env| {
        let client = spawn(env);
        let server = spawn(env);
        let slot = mint_ep(caps, 2, 0x42, Rights::READ | Rights::WRITE);

        make_current(env, server);
        sync::reply_wait(
            caps,
            &mut env.endpoints,
            &mut env.tcbs,
            &mut env.sched,
            server,
            0,
            [0, 0],
            EP_SLOT,
        )
        .unwrap();
        make_current(env, client);
        sync::call(
            caps,
            &mut env.endpoints,
            &mut env.tcbs,
            &mut env.sched,
            client,
            slot,
            [0xAA, 0xBB, 0xCC],
            0,
        )
        .unwrap();

        // Server replies and waits again; no sender is queued.
        let (_, switch) = sync::reply_wait(
            caps,
            &mut env.endpoints,
            &mut env.tcbs,
            &mut env.sched,
            server,
            client as u64,
            [0x11, 0x22],
            EP_SLOT,
        )
        .unwrap();

        // The resumed client got the freed processor straight away.
        let cli = env.tcbs.get(client);
        assert_eq!(cli.state, ThreadState::Running);
        assert_eq!(cli.ctx.rsi, 0x11);
        assert_eq!(cli.ctx.rdx, 0x22);
        assert_eq!(cli.ctx.rax, 0);
        assert_eq!(env.sched.queued_count(&env.tcbs, client), 0);
        assert_eq!(env.sched.current(), Some(client));

        assert_eq!(env.tcbs.get(server).state, ThreadState::BlockedRecv);
        assert_eq!(switch.map(|s| s.to), Some(client));
    });
}

#[test]
fn queued_senders_pair_with_receivers_in_fifo_order() {
    with_env(|caps, env| {
        let s1 = spawn(env);
        let s2 = spawn(env);
        let server = spawn(env);
        let slot = mint_ep(caps, 2, 0x7, Rights::READ | Rights::WRITE);

        for (i, s) in [s1, s2].into_iter().enumerate() {
            make_current(env, s);
            let (_, _) = sync::call(
                caps,
                &mut env.endpoints,
                &mut env.tcbs,
                &mut env.sched,
                s,
                slot,
                [i as u64, 0, 0],
                0,
            )
            .unwrap();
            assert_eq!(env.tcbs.get(s).state, ThreadState::BlockedSend);
        }

        make_current(env, server);
        let (ret, switch) = sync::reply_wait(
            caps,
            &mut env.endpoints,
            &mut env.tcbs,
            &mut env.sched,
            server,
            0,
            [0, 0],
            EP_SLOT,
        )
        .unwrap();
        assert!(switch.is_none());
        assert_eq!(ret, s1 as i64);
        assert_eq!(env.tcbs.get(server).ctx.rsi, 0);
        assert_eq!(env.tcbs.get(s1).state, ThreadState::BlockedReply);

        // Reply to the first and take the second, atomically.
        let (ret, _) = sync::reply_wait(
            caps,
            &mut env.endpoints,
            &mut env.tcbs,
            &mut env.sched,
            server,
            s1 as u64,
            [1, 2],
            EP_SLOT,
        )
        .unwrap();
        assert_eq!(ret, s2 as i64);
        assert_eq!(env.tcbs.get(server).ctx.rsi, 1);
        assert_eq!(env.tcbs.get(s1).state, ThreadState::Runnable);
        assert_eq!(env.tcbs.get(s2).state, ThreadState::BlockedReply);
    });
}

#[test]
fn badge_identifies_the_invoked_sibling() {
    with_env(|caps, env| {
        let client = spawn(env);
        let server = spawn(env);
        let red = mint_ep(caps, 2, 0x42, Rights::WRITE);
        let blue = mint_ep(caps, 3, 0x43, Rights::WRITE);

        for (slot, badge) in [(red, 0x42), (blue, 0x43)] {
            make_current(env, server);
            sync::reply_wait(
                caps,
                &mut env.endpoints,
                &mut env.tcbs,
                &mut env.sched,
                server,
                0,
                [0, 0],
                EP_SLOT,
            )
            .unwrap();
            make_current(env, client);
            sync::call(
                caps,
                &mut env.endpoints,
                &mut env.tcbs,
                &mut env.sched,
                client,
                slot,
                [1, 2, 3],
                0,
            )
            .unwrap();
            assert_eq!(env.tcbs.get(server).ctx.rdi, badge);

            // Unwind for the next round.
            make_current(env, server);
            sync::reply_wait(
                caps,
                &mut env.endpoints,
                &mut env.tcbs,
                &mut env.sched,
                server,
                client as u64,
                [0, 0],
                EP_SLOT,
            )
            .unwrap();
            env.endpoints.unqueue(&mut env.tcbs, 0, server);
            let tcb = env.tcbs.get_mut(server);
            tcb.state = ThreadState::Suspended;
            tcb.wait_on = None;
            env.sched.make_runnable(&mut env.tcbs, server);
        }
    });
}

#[test]
fn nonblocking_operations_report_would_block() {
    with_env(|caps, env| {
        let client = spawn(env);
        let slot = mint_ep(caps, 2, 0x1, Rights::READ | Rights::WRITE);

        make_current(env, client);
        assert_eq!(
            sync::send(
                caps,
                &mut env.endpoints,
                &mut env.tcbs,
                &mut env.sched,
                client,
                slot,
                [1, 2, 3],
            ),
            Err(KernelError::WouldBlock)
        );
        assert_eq!(
            sync::call(
                caps,
                &mut env.endpoints,
                &mut env.tcbs,
                &mut env.sched,
                client,
                slot,
                [1, 2, 3],
                1,
            ),
            Err(KernelError::WouldBlock)
        );
        assert_eq!(env.tcbs.get(client).state, ThreadState::Running);
    });
}

#[test]
fn rights_gate_send_and_receive() {
    with_env(|caps, env| {
        let thread = spawn(env);
        let send_only = mint_ep(caps, 2, 0x1, Rights::WRITE);
        let recv_only = mint_ep(caps, 3, 0x2, Rights::READ);

        make_current(env, thread);
        assert_eq!(
            sync::recv(
                caps,
                &mut env.endpoints,
                &mut env.tcbs,
                &mut env.sched,
                thread,
                send_only,
            ),
            Err(KernelError::AccessDenied)
        );
        assert_eq!(
            sync::call(
                caps,
                &mut env.endpoints,
                &mut env.tcbs,
                &mut env.sched,
                thread,
                recv_only,
                [0, 0, 0],
                0,
            ),
            Err(KernelError::AccessDenied)
        );
    });
}

#[test]
fn reply_without_prior_call_is_rejected() {
    with_env(|caps, env| {
        let server = spawn(env);
        let bystander = spawn(env);

        make_current(env, server);
        // The bystander never called, so a reply to it has no caller.
        assert_eq!(
            sync::reply_wait(
                caps,
                &mut env.endpoints,
                &mut env.tcbs,
                &mut env.sched,
                server,
                bystander as u64,
                [0, 0],
                EP_SLOT,
            ),
            Err(KernelError::NoCaller)
        );
    });
}

#[test]
fn send_hands_processor_to_receiver_and_requeues_sender() {
    with_env(|caps, env| {
        let sender = spawn(env);
        let receiver = spawn(env);
        let slot = mint_ep(caps, 2, 0x9, Rights::READ | Rights::WRITE);

        make_current(env, receiver);
        sync::recv(
            caps,
            &mut env.endpoints,
            &mut env.tcbs,
            &mut env.sched,
            receiver,
            slot,
        )
        .unwrap();

        make_current(env, sender);
        let (_, switch) = sync::send(
            caps,
            &mut env.endpoints,
            &mut env.tcbs,
            &mut env.sched,
            sender,
            slot,
            [7, 8, 9],
        )
        .unwrap();
        assert_eq!(switch.map(|s| s.to), Some(receiver));
        assert_eq!(env.tcbs.get(receiver).ctx.rdi, 0x9);
        assert_eq!(env.tcbs.get(receiver).ctx.rsi, 7);
        // The sender keeps going later; it is runnable, not reply-blocked.
        assert_eq!(env.tcbs.get(sender).state, ThreadState::Runnable);
        assert_eq!(env.sched.queued_count(&env.tcbs, sender), 1);
    });
}
