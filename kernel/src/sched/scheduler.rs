//! Core scheduler
//!
//! A single global FIFO run queue plus the current-thread slot. Priority is
//! stored on the TCB but advisory; the queue head always wins. The idle
//! thread backstops `schedule` so there is always somewhere to go.
//!
//! Scheduling methods only do the bookkeeping (states, queue, current) and
//! report the resulting [`Switch`]; the architecture layer performs the
//! physical stack switch afterwards, outside any locks.

use super::queue::TidQueue;
use super::tcb::{TcbPool, ThreadState, Tid};

/// A decided context switch, to be carried out by the arch layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Switch {
    /// Thread losing the processor; `None` on the bootstrap switch and
    /// after the current thread was destroyed.
    pub from: Option<Tid>,
    /// Thread receiving the processor
    pub to: Tid,
}

/// Scheduler state
pub struct Scheduler {
    /// Currently running thread
    pub current: Option<Tid>,
    /// The idle thread; never enqueued, always runnable as a fallback
    pub idle: Option<Tid>,
    run_queue: TidQueue,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            current: None,
            idle: None,
            run_queue: TidQueue::new(),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn set_idle(&mut self, tid: Tid) {
        self.idle = Some(tid);
    }

    pub fn current(&self) -> Option<Tid> {
        self.current
    }

    /// Mark a thread runnable and queue it.
    pub fn make_runnable(&mut self, tcbs: &mut TcbPool, tid: Tid) {
        tcbs.get_mut(tid).state = ThreadState::Runnable;
        if Some(tid) != self.idle {
            self.run_queue.enqueue(tcbs, tid);
        }
    }

    /// Wake a blocked thread.
    pub fn unblock(&mut self, tcbs: &mut TcbPool, tid: Tid) {
        self.make_runnable(tcbs, tid);
    }

    /// Give up the processor voluntarily (or on a timer tick). The caller
    /// is re-queued behind everyone already waiting.
    pub fn yield_now(&mut self, tcbs: &mut TcbPool) -> Option<Switch> {
        if let Some(cur) = self.current {
            let tcb = tcbs.get_mut(cur);
            if tcb.state == ThreadState::Running {
                tcb.state = ThreadState::Runnable;
                if Some(cur) != self.idle {
                    self.run_queue.enqueue(tcbs, cur);
                }
            }
        }
        self.schedule(tcbs)
    }

    /// Put the current thread into `state` and pick someone else.
    pub fn block_current(&mut self, tcbs: &mut TcbPool, state: ThreadState) -> Option<Switch> {
        debug_assert!(!matches!(state, ThreadState::Running | ThreadState::Runnable));
        if let Some(cur) = self.current {
            tcbs.get_mut(cur).state = state;
        }
        self.schedule(tcbs)
    }

    /// Hand the processor straight to `target`, bypassing the queue. The
    /// IPC fast path uses this; the caller has already restated both
    /// threads.
    pub fn direct_switch(&mut self, tcbs: &mut TcbPool, target: Tid) -> Switch {
        debug_assert!(!tcbs.get(target).queued, "direct switch to a queued thread");
        let from = self.current;
        tcbs.get_mut(target).state = ThreadState::Running;
        self.current = Some(target);
        Switch { from, to: target }
    }

    /// Take a thread out of scheduling entirely (revocation, faults).
    pub fn remove_thread(&mut self, tcbs: &mut TcbPool, tid: Tid) {
        self.run_queue.remove(tcbs, tid);
        if self.current == Some(tid) {
            self.current = None;
        }
        if self.idle == Some(tid) {
            self.idle = None;
        }
    }

    /// Pick the next thread: queue head, or the idle thread when the queue
    /// is empty.
    fn schedule(&mut self, tcbs: &mut TcbPool) -> Option<Switch> {
        let next = match self.run_queue.dequeue(tcbs) {
            Some(tid) => tid,
            None => self.idle?,
        };
        if Some(next) == self.current {
            tcbs.get_mut(next).state = ThreadState::Running;
            return None;
        }
        let from = self.current;
        tcbs.get_mut(next).state = ThreadState::Running;
        self.current = Some(next);
        Some(Switch { from, to: next })
    }

    /// Run-queue membership probe for the invariant checks.
    pub fn queued_count(&self, tcbs: &TcbPool, tid: Tid) -> usize {
        self.run_queue.count(tcbs, tid)
    }

    pub fn run_queue_len(&self) -> usize {
        self.run_queue.len()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
