//! Endpoint objects
//!
//! An endpoint is a rendezvous point carrying two FIFO queues: senders
//! waiting for a receiver and receivers waiting for a sender. At most one
//! of the two queues is ever non-empty.

use crate::config::MAX_ENDPOINTS;
use crate::error::{KernelError, Result};
use crate::sched::{TcbPool, Tid, TidQueue};

/// Endpoint id: index into the endpoint pool
pub type EndpointId = u16;

#[derive(Debug)]
struct Endpoint {
    allocated: bool,
    default_badge: u64,
    send: TidQueue,
    recv: TidQueue,
}

impl Endpoint {
    const fn new() -> Self {
        Self {
            allocated: false,
            default_badge: 0,
            send: TidQueue::new(),
            recv: TidQueue::new(),
        }
    }
}

/// Fixed pool of endpoint objects
pub struct EndpointPool {
    eps: [Endpoint; MAX_ENDPOINTS],
}

impl EndpointPool {
    pub const fn new() -> Self {
        Self {
            eps: [const { Endpoint::new() }; MAX_ENDPOINTS],
        }
    }

    pub fn reset(&mut self) {
        for ep in &mut self.eps {
            *ep = Endpoint::new();
        }
    }

    /// Claim a fresh endpoint. Queues start empty.
    pub fn alloc(&mut self, default_badge: u64) -> Option<EndpointId> {
        let id = self.eps.iter().position(|e| !e.allocated)?;
        self.eps[id] = Endpoint {
            allocated: true,
            default_badge,
            send: TidQueue::new(),
            recv: TidQueue::new(),
        };
        Some(id as EndpointId)
    }

    /// Release an endpoint. The queues must have been drained first.
    pub fn free(&mut self, id: EndpointId) {
        let ep = &mut self.eps[id as usize];
        debug_assert!(ep.send.is_empty() && ep.recv.is_empty());
        *ep = Endpoint::new();
    }

    pub fn free_count(&self) -> usize {
        self.eps.iter().filter(|e| !e.allocated).count()
    }

    fn live(&mut self, id: EndpointId) -> Result<&mut Endpoint> {
        self.eps
            .get_mut(id as usize)
            .filter(|e| e.allocated)
            .ok_or(KernelError::InvalidState)
    }

    pub fn is_allocated(&self, id: EndpointId) -> bool {
        (id as usize) < MAX_ENDPOINTS && self.eps[id as usize].allocated
    }

    pub fn default_badge(&self, id: EndpointId) -> u64 {
        self.eps[id as usize].default_badge
    }

    pub fn push_send(&mut self, tcbs: &mut TcbPool, id: EndpointId, tid: Tid) -> Result<()> {
        self.live(id)?.send.enqueue(tcbs, tid);
        Ok(())
    }

    pub fn pop_send(&mut self, tcbs: &mut TcbPool, id: EndpointId) -> Option<Tid> {
        self.eps.get_mut(id as usize)?.send.dequeue(tcbs)
    }

    pub fn push_recv(&mut self, tcbs: &mut TcbPool, id: EndpointId, tid: Tid) -> Result<()> {
        self.live(id)?.recv.enqueue(tcbs, tid);
        Ok(())
    }

    pub fn pop_recv(&mut self, tcbs: &mut TcbPool, id: EndpointId) -> Option<Tid> {
        self.eps.get_mut(id as usize)?.recv.dequeue(tcbs)
    }

    /// Take `tid` off whichever queue it sits on.
    pub fn unqueue(&mut self, tcbs: &mut TcbPool, id: EndpointId, tid: Tid) {
        if let Some(ep) = self.eps.get_mut(id as usize) {
            if !ep.send.remove(tcbs, tid) {
                ep.recv.remove(tcbs, tid);
            }
        }
    }

    pub fn send_queue_len(&self, id: EndpointId) -> usize {
        self.eps[id as usize].send.len()
    }

    pub fn recv_queue_len(&self, id: EndpointId) -> usize {
        self.eps[id as usize].recv.len()
    }
}

impl Default for EndpointPool {
    fn default() -> Self {
        Self::new()
    }
}
