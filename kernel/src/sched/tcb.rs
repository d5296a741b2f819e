//! Thread control blocks
//!
//! A fixed pool of TCBs with a free list threaded through the link field,
//! so allocation and release are both O(1). The thread id is the TCB's
//! index in the pool.

use crate::config::{IPC_SCRATCH_BYTES, MAX_THREADS};
use crate::mm::{PhysicalAddress, VirtualAddress};

/// Thread identifier: index into the TCB pool
pub type Tid = u16;

/// Default priority for freshly created threads
pub const DEFAULT_PRIORITY: u8 = 100;

/// Thread lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// On the pool free list
    Free,
    /// Created but not yet resumed
    Suspended,
    /// Eligible to run, on the run queue
    Runnable,
    /// Owns the processor
    Running,
    /// Blocked outside IPC
    Blocked,
    /// Waiting on an endpoint send queue
    BlockedSend,
    /// Waiting on an endpoint receive queue
    BlockedRecv,
    /// Waiting for the server's reply to a call
    BlockedReply,
}

/// Saved user-visible register frame.
///
/// This is what the syscall entry stores on kernel entry and restores on
/// the way out; IPC delivers messages by writing into the frame of the
/// target thread.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserContext {
    pub rax: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub r10: u64,
    pub r8: u64,
    pub r9: u64,
    pub rip: u64,
    pub rsp: u64,
    pub rflags: u64,
}

impl UserContext {
    pub const fn new() -> Self {
        Self {
            rax: 0,
            rdi: 0,
            rsi: 0,
            rdx: 0,
            r10: 0,
            r8: 0,
            r9: 0,
            rip: 0,
            rsp: 0,
            rflags: 0,
        }
    }

    /// The six syscall argument registers in ABI order
    pub fn args(&self) -> [u64; 6] {
        [self.rdi, self.rsi, self.rdx, self.r10, self.r8, self.r9]
    }

    pub fn set_return(&mut self, value: i64) {
        self.rax = value as u64;
    }

    /// Zero every argument register. Runs on each kernel entry so nothing
    /// kernel-internal leaks back across the privilege boundary.
    pub fn scrub_args(&mut self) {
        self.rdi = 0;
        self.rsi = 0;
        self.rdx = 0;
        self.r10 = 0;
        self.r8 = 0;
        self.r9 = 0;
    }

    /// Deliver a three-word message with the sender badge in the first
    /// argument register.
    pub fn set_message(&mut self, badge: u64, msg: [u64; 3]) {
        self.rdi = badge;
        self.rsi = msg[0];
        self.rdx = msg[1];
        self.r10 = msg[2];
    }

    /// Deliver the two reply words of a completed call.
    pub fn set_reply(&mut self, r0: u64, r1: u64) {
        self.rsi = r0;
        self.rdx = r1;
    }
}

impl Default for UserContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Message and badge parked with a sender while it waits on an endpoint
#[derive(Debug, Clone, Copy)]
pub struct IpcStash {
    pub badge: u64,
    pub msg: [u64; 3],
}

impl IpcStash {
    pub const fn empty() -> Self {
        Self { badge: 0, msg: [0; 3] }
    }
}

/// Thread control block
#[derive(Debug)]
pub struct Tcb {
    pub tid: Tid,
    pub state: ThreadState,
    pub priority: u8,
    /// Top of this thread's kernel stack
    pub kernel_stack_top: VirtualAddress,
    /// Kernel stack pointer saved at switch-out
    pub saved_sp: VirtualAddress,
    /// Root page table of the thread's address space
    pub address_space: PhysicalAddress,
    /// CNode holding the thread's capabilities
    pub cap_root: u16,
    /// Free-list / run-queue / endpoint-queue link
    pub link: Option<Tid>,
    /// Set while the TCB sits on a run or endpoint queue
    pub queued: bool,
    /// Endpoint this thread is blocked on, if any
    pub wait_on: Option<u16>,
    pub ctx: UserContext,
    pub stash: IpcStash,
    pub ipc_scratch: [u8; IPC_SCRATCH_BYTES],
}

impl Tcb {
    pub const fn new() -> Self {
        Self {
            tid: 0,
            state: ThreadState::Free,
            priority: DEFAULT_PRIORITY,
            kernel_stack_top: VirtualAddress::new(0),
            saved_sp: VirtualAddress::new(0),
            address_space: PhysicalAddress::new(0),
            cap_root: 0,
            link: None,
            queued: false,
            wait_on: None,
            ctx: UserContext::new(),
            stash: IpcStash::empty(),
            ipc_scratch: [0; IPC_SCRATCH_BYTES],
        }
    }
}

/// Fixed pool of TCBs with an intrusive free list
pub struct TcbPool {
    tcbs: [Tcb; MAX_THREADS],
    free_head: Option<Tid>,
    free_count: usize,
}

impl TcbPool {
    pub const fn new() -> Self {
        Self {
            tcbs: [const { Tcb::new() }; MAX_THREADS],
            free_head: None,
            free_count: 0,
        }
    }

    /// Link every TCB into the free list. Runs once at boot and between
    /// tests.
    pub fn reset(&mut self) {
        for (i, tcb) in self.tcbs.iter_mut().enumerate() {
            *tcb = Tcb::new();
            tcb.tid = i as Tid;
            tcb.link = if i + 1 < MAX_THREADS {
                Some((i + 1) as Tid)
            } else {
                None
            };
        }
        self.free_head = Some(0);
        self.free_count = MAX_THREADS;
    }

    /// Pop a TCB off the free list. O(1).
    pub fn alloc(&mut self) -> Option<Tid> {
        let tid = self.free_head?;
        let tcb = &mut self.tcbs[tid as usize];
        self.free_head = tcb.link;
        self.free_count -= 1;

        *tcb = Tcb::new();
        tcb.tid = tid;
        tcb.state = ThreadState::Suspended;
        Some(tid)
    }

    /// Push a TCB back onto the free list. O(1).
    pub fn free(&mut self, tid: Tid) {
        let head = self.free_head;
        let tcb = &mut self.tcbs[tid as usize];
        debug_assert_ne!(tcb.state, ThreadState::Free, "double free of tcb {}", tid);
        *tcb = Tcb::new();
        tcb.tid = tid;
        tcb.link = head;
        self.free_head = Some(tid);
        self.free_count += 1;
    }

    pub fn get(&self, tid: Tid) -> &Tcb {
        &self.tcbs[tid as usize]
    }

    pub fn get_mut(&mut self, tid: Tid) -> &mut Tcb {
        &mut self.tcbs[tid as usize]
    }

    /// Borrow two distinct TCBs at once (IPC copies between frames).
    pub fn pair_mut(&mut self, a: Tid, b: Tid) -> (&mut Tcb, &mut Tcb) {
        assert_ne!(a, b);
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        let (left, right) = self.tcbs.split_at_mut(hi as usize);
        let (lo_tcb, hi_tcb) = (&mut left[lo as usize], &mut right[0]);
        if a < b {
            (lo_tcb, hi_tcb)
        } else {
            (hi_tcb, lo_tcb)
        }
    }

    /// Whether `tid` names a live (non-free) TCB.
    pub fn is_live(&self, tid: Tid) -> bool {
        (tid as usize) < MAX_THREADS && self.tcbs[tid as usize].state != ThreadState::Free
    }

    pub fn free_count(&self) -> usize {
        self.free_count
    }

    /// Live TCB ids, for diagnostics and the test suite.
    pub fn live_tids(&self) -> impl Iterator<Item = Tid> + '_ {
        self.tcbs
            .iter()
            .filter(|t| t.state != ThreadState::Free)
            .map(|t| t.tid)
    }
}

impl Default for TcbPool {
    fn default() -> Self {
        Self::new()
    }
}
