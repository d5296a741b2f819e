//! End-to-end scenarios through the syscall dispatcher
//!
//! These run against the kernel's real globals (capability store, frame
//! allocator, endpoint pool, TCB pool, scheduler, simulated page tables),
//! so every test takes the shared guard and resets the world first.

use std::sync::{Mutex, MutexGuard};

use cinnabar_kernel::bootstrap;
use cinnabar_kernel::cap::{CapObject, CapRef, CapType, Rights, CAP_SPACE, ROOT_CNODE};
use cinnabar_kernel::config::INITIAL_UNTYPED_BYTES;
use cinnabar_kernel::error::KernelError;
use cinnabar_kernel::handover::{Handover, MemoryDescriptor};
use cinnabar_kernel::ipc::ENDPOINTS;
use cinnabar_kernel::mm::vmm;
use cinnabar_kernel::mm::{VirtualAddress, FRAME_ALLOCATOR, FRAME_SIZE};
use cinnabar_kernel::namespace::NAMESPACE;
use cinnabar_kernel::sched::{ThreadState, Tid, SCHEDULER, TCBS};
use cinnabar_kernel::syscall::{self, SyscallNumber, NO_SLOT};

static WORLD: Mutex<()> = Mutex::new(());

const UNTYPED: u64 = bootstrap::SLOT_UNTYPED as u64;

fn reset_world() -> MutexGuard<'static, ()> {
    let guard = WORLD.lock().unwrap_or_else(|e| e.into_inner());

    let map = [MemoryDescriptor::conventional(0, 16384)]; // 64 MiB
    let handover = Handover::for_test(&map, core::mem::size_of::<MemoryDescriptor>() as u64);
    unsafe { FRAME_ALLOCATOR.lock().init(&handover) };
    vmm::reset_sim_active();

    CAP_SPACE.lock().reset();
    ENDPOINTS.lock().reset();
    NAMESPACE.lock().reset();
    TCBS.lock().reset();
    SCHEDULER.lock().reset();

    // Idle thread plus the untyped donation at slot 0.
    {
        let mut tcbs = TCBS.lock();
        let mut sched = SCHEDULER.lock();
        let idle = tcbs.alloc().unwrap();
        tcbs.get_mut(idle).state = ThreadState::Runnable;
        sched.set_idle(idle);
    }
    bootstrap::seed_initial_untyped(&mut CAP_SPACE.lock(), &mut FRAME_ALLOCATOR.lock()).unwrap();

    guard
}

/// Allocate a runnable thread whose capabilities live in the root CNode.
fn spawn_thread() -> Tid {
    let mut tcbs = TCBS.lock();
    let mut sched = SCHEDULER.lock();
    let tid = tcbs.alloc().unwrap();
    tcbs.get_mut(tid).cap_root = ROOT_CNODE;
    sched.make_runnable(&mut tcbs, tid);
    tid
}

fn make_current(tid: Tid) {
    let mut tcbs = TCBS.lock();
    let mut sched = SCHEDULER.lock();
    if sched.current() == Some(tid) {
        return;
    }
    if let Some(cur) = sched.current() {
        let tcb = tcbs.get_mut(cur);
        if tcb.state == ThreadState::Running {
            tcb.state = ThreadState::Runnable;
            if Some(cur) != sched.idle {
                sched.make_runnable(&mut tcbs, cur);
            }
        }
    }
    sched.remove_thread(&mut tcbs, tid);
    sched.direct_switch(&mut tcbs, tid);
}

fn sys(caller: Tid, n: SyscallNumber, args: [u64; 6]) -> i64 {
    syscall::dispatch(caller, n as u64, args).value
}

fn slot(index: u64) -> CapRef {
    CapRef::new(ROOT_CNODE, index as u16)
}

fn untyped_offset() -> u64 {
    match CAP_SPACE.lock().cap(slot(UNTYPED)).unwrap().object {
        CapObject::Untyped { offset, .. } => offset,
        other => panic!("slot 0 holds {:?}", other),
    }
}

#[test]
fn s1_retype_installs_a_linked_cnode() {
    let _guard = reset_world();
    let caller = spawn_thread();
    make_current(caller);

    let ret = sys(caller, SyscallNumber::Retype, [UNTYPED, 2, 1, 1, 0, 0]);
    assert_eq!(ret, 1);

    let caps = CAP_SPACE.lock();
    let child = caps.cap(slot(1)).unwrap();
    assert_eq!(child.cap_type(), CapType::CNode);
    assert_eq!(child.parent, Some(slot(UNTYPED)));
    drop(caps);
    assert_eq!(untyped_offset(), FRAME_SIZE as u64);
}

#[test]
fn s2_mint_attenuates_and_revoke_clears_the_mint() {
    let _guard = reset_world();
    let caller = spawn_thread();
    make_current(caller);

    assert_eq!(sys(caller, SyscallNumber::Retype, [UNTYPED, 2, 1, 1, 0, 0]), 1);
    let ret = sys(
        caller,
        SyscallNumber::CapMint,
        [1, 2, Rights::READ.bits() as u64, 0, 0, 0],
    );
    assert_eq!(ret, 2);
    assert_eq!(CAP_SPACE.lock().cap(slot(2)).unwrap().rights, Rights::READ);

    assert_eq!(sys(caller, SyscallNumber::CapRevoke, [1, 0, 0, 0, 0, 0]), 0);
    let caps = CAP_SPACE.lock();
    assert!(caps.get(slot(1)).unwrap().is_null());
    assert!(caps.get(slot(2)).unwrap().is_null());
}

#[test]
fn s3_s4_call_and_reply_wait_round_trip() {
    let _guard = reset_world();
    let client = spawn_thread();
    let server = spawn_thread();

    make_current(server);
    assert_eq!(
        sys(server, SyscallNumber::EndpointCreate, [UNTYPED, 3, 0, 0, 0, 0]),
        3
    );
    let mint_rights = (Rights::READ | Rights::WRITE).bits() as u64;
    assert_eq!(
        sys(server, SyscallNumber::CapMint, [3, 4, mint_rights, 0x42, 0, 0]),
        4
    );

    // Server waits; its message registers must read as zero meanwhile.
    {
        let mut tcbs = TCBS.lock();
        tcbs.get_mut(server).ctx.rsi = 0xDEAD;
    }
    sys(server, SyscallNumber::IpcReplyWait, [0, 0, 0, 3, 0, 0]);
    {
        let tcbs = TCBS.lock();
        assert_eq!(tcbs.get(server).state, ThreadState::BlockedRecv);
        assert_eq!(tcbs.get(server).ctx.rsi, 0);
    }

    // S3: the client calls through the badged sibling.
    make_current(client);
    sys(
        client,
        SyscallNumber::IpcCall,
        [4, 0xAA, 0xBB, 0xCC, 0, 0],
    );
    {
        let tcbs = TCBS.lock();
        let sched = SCHEDULER.lock();
        assert_eq!(sched.current(), Some(server));
        let srv = tcbs.get(server);
        assert_eq!(srv.state, ThreadState::Running);
        assert_eq!(srv.ctx.rdi, 0x42);
        assert_eq!(srv.ctx.rsi, 0xAA);
        assert_eq!(srv.ctx.rdx, 0xBB);
        assert_eq!(srv.ctx.r10, 0xCC);
        assert_eq!(srv.ctx.rax as i64, client as i64);
        assert_eq!(tcbs.get(client).state, ThreadState::BlockedReply);
    }

    // S4: reply and wait again.
    sys(
        server,
        SyscallNumber::IpcReplyWait,
        [client as u64, 0x11, 0x22, 3, 0, 0],
    );
    {
        let tcbs = TCBS.lock();
        let sched = SCHEDULER.lock();
        // The client resumed with the reply words and took the processor
        // the moment the server blocked again.
        let cli = tcbs.get(client);
        assert_eq!(cli.state, ThreadState::Running);
        assert_eq!(sched.current(), Some(client));
        assert_eq!(cli.ctx.rsi, 0x11);
        assert_eq!(cli.ctx.rdx, 0x22);
        assert_eq!(cli.ctx.rax, 0);
        assert_eq!(tcbs.get(server).state, ThreadState::BlockedRecv);
    }
}

#[test]
fn s5_double_map_reports_already_mapped_without_leaks() {
    let _guard = reset_world();
    let caller = spawn_thread();
    make_current(caller);

    assert_eq!(sys(caller, SyscallNumber::CapCreate, [UNTYPED, 6, 5, 0, 0, 0]), 5);

    let vaddr = 0x4000_0000u64;
    assert_eq!(sys(caller, SyscallNumber::MapFrame, [5, vaddr, 1, 0, 0, 0]), 0);
    let mapped_before =
        vmm::with_active(|a| vmm::translate(a, VirtualAddress::new(vaddr))).unwrap();
    let free_before = FRAME_ALLOCATOR.lock().free_frames();

    assert_eq!(
        sys(caller, SyscallNumber::MapFrame, [5, vaddr, 1, 0, 0, 0]),
        KernelError::NoSpace.to_errno()
    );

    let mapped_after =
        vmm::with_active(|a| vmm::translate(a, VirtualAddress::new(vaddr))).unwrap();
    assert_eq!(mapped_before, mapped_after);
    assert_eq!(FRAME_ALLOCATOR.lock().free_frames(), free_before);

    // The mapping disappears again on unmap.
    assert_eq!(sys(caller, SyscallNumber::UnmapFrame, [vaddr, 0, 0, 0, 0, 0]), 0);
    assert!(vmm::with_active(|a| !vmm::is_mapped(a, VirtualAddress::new(vaddr))));
}

#[test]
fn s6_revoking_a_runnable_thread_cleans_up_fully() {
    let _guard = reset_world();
    let caller = spawn_thread();
    make_current(caller);

    let tid = sys(
        caller,
        SyscallNumber::ThreadCreate,
        [UNTYPED, 6, 0x400000, 0x500000, NO_SLOT, 0],
    );
    assert!(tid >= 0);
    let tid = tid as Tid;
    assert_eq!(sys(caller, SyscallNumber::ThreadResume, [6, 0, 0, 0, 0, 0]), 0);
    {
        let tcbs = TCBS.lock();
        let sched = SCHEDULER.lock();
        assert_eq!(tcbs.get(tid).state, ThreadState::Runnable);
        assert_eq!(sched.queued_count(&tcbs, tid), 1);
    }
    let free_tcbs = TCBS.lock().free_count();

    assert_eq!(sys(caller, SyscallNumber::CapRevoke, [6, 0, 0, 0, 0, 0]), 0);
    {
        let tcbs = TCBS.lock();
        let sched = SCHEDULER.lock();
        assert!(!tcbs.is_live(tid));
        assert_eq!(tcbs.free_count(), free_tcbs + 1);
        assert_eq!(sched.queued_count(&tcbs, tid), 0);
        assert!(CAP_SPACE.lock().get(slot(6)).unwrap().is_null());
    }
}

#[test]
fn syscall_return_scrubs_argument_registers() {
    let _guard = reset_world();
    let caller = spawn_thread();
    make_current(caller);

    {
        let mut tcbs = TCBS.lock();
        let ctx = &mut tcbs.get_mut(caller).ctx;
        ctx.rdi = 0x1111;
        ctx.rsi = 0x2222;
        ctx.rdx = 0x3333;
        ctx.r10 = 0x4444;
        ctx.r8 = 0x5555;
        ctx.r9 = 0x6666;
    }
    let ret = sys(caller, SyscallNumber::DebugPutchar, [b'x' as u64, 0, 0, 0, 0, 0]);
    assert_eq!(ret, b'x' as i64);

    let tcbs = TCBS.lock();
    let ctx = &tcbs.get(caller).ctx;
    assert_eq!(ctx.args(), [0; 6]);
    assert_eq!(ctx.rax as i64, ret);
}

#[test]
fn badge_verification_and_namespace_round_trip() {
    let _guard = reset_world();
    let caller = spawn_thread();
    make_current(caller);

    assert_eq!(
        sys(caller, SyscallNumber::EndpointCreate, [UNTYPED, 3, 0, 0, 0, 0]),
        3
    );
    let badge = CAP_SPACE.lock().cap(slot(3)).unwrap().badge;
    assert_eq!(sys(caller, SyscallNumber::CapVerify, [3, badge, 0, 0, 0, 0]), 1);
    assert_eq!(
        sys(caller, SyscallNumber::CapVerify, [3, badge ^ 1, 0, 0, 0, 0]),
        0
    );

    let name = u64::from_le_bytes(*b"console\0");
    assert_eq!(
        sys(caller, SyscallNumber::NamespaceRegister, [3, name, 0, 0, 0, 0]),
        0
    );
    // The same name cannot be taken twice.
    assert_eq!(
        sys(caller, SyscallNumber::NamespaceRegister, [3, name, 0, 0, 0, 0]),
        KernelError::NoSpace.to_errno()
    );

    // Deleting the endpoint clears the binding and wakes nobody.
    assert_eq!(sys(caller, SyscallNumber::EndpointDelete, [3, 0, 0, 0, 0, 0]), 0);
    assert_eq!(
        sys(caller, SyscallNumber::NamespaceRegister, [3, name, 0, 0, 0, 0]),
        KernelError::NoCap.to_errno()
    );
}

#[test]
fn invalid_and_would_block_errors_surface() {
    let _guard = reset_world();
    let caller = spawn_thread();
    make_current(caller);

    assert_eq!(
        syscall::dispatch(caller, 55, [0; 6]).value,
        KernelError::Invalid.to_errno()
    );
    assert_eq!(
        syscall::dispatch(caller, 0, [0; 6]).value,
        KernelError::Invalid.to_errno()
    );

    // Non-blocking call with no receiver.
    assert_eq!(
        sys(caller, SyscallNumber::EndpointCreate, [UNTYPED, 3, 0, 0, 0, 0]),
        3
    );
    assert_eq!(
        sys(caller, SyscallNumber::IpcCall, [3, 1, 2, 3, 1, 0]),
        KernelError::WouldBlock.to_errno()
    );
    assert_eq!(TCBS.lock().get(caller).state, ThreadState::Running);
}

#[test]
fn pmm_conservation_holds_across_a_busy_sequence() {
    let _guard = reset_world();
    let caller = spawn_thread();
    make_current(caller);

    let total = FRAME_ALLOCATOR.lock().total_frames();
    let check = || {
        let pmm = FRAME_ALLOCATOR.lock();
        assert_eq!(pmm.free_frames() + pmm.used_frames(), total);
        // The counter and the bitmap agree at every step.
        assert_eq!(pmm.recount_free(), pmm.free_frames());
    };

    check();
    assert_eq!(sys(caller, SyscallNumber::Retype, [UNTYPED, 6, 1, 4, 0, 0]), 1);
    check();
    for i in 0..4u64 {
        assert_eq!(
            sys(
                caller,
                SyscallNumber::MapFrame,
                [1 + i, 0x1000_0000 + i * FRAME_SIZE as u64, 1, 0, 0, 0],
            ),
            0
        );
        check();
    }
    assert_eq!(sys(caller, SyscallNumber::CapRevoke, [UNTYPED, 0, 0, 0, 0, 0]), 0);
    check();

    // The whole donation is back.
    let pmm = FRAME_ALLOCATOR.lock();
    assert!(pmm.free_frames() >= INITIAL_UNTYPED_BYTES / FRAME_SIZE as u64);
}
