//! Recursive revocation
//!
//! Revoke destroys a capability's entire derivation subtree, children
//! before parents, reclaiming every resource on the way: queued threads
//! are woken with an error, TCBs leave the scheduler, and physical frames
//! go back to the allocator. The traversal is iterative over index links;
//! the only recursion is through CNode contents, bounded by the CNode
//! pool size.

use super::space::{CapSpace, Resources};
use super::types::{CapObject, CapRef, CapSlot};
use crate::config::CNODE_SLOTS;
use crate::error::{KernelError, Result};
use crate::mm::PhysicalAddress;
use crate::sched::ThreadState;

impl CapSpace {
    /// Destroy the subtree rooted at `at`, then Null the slot itself.
    ///
    /// No suspension point exists anywhere below; callers observe either
    /// the old state or the fully revoked one.
    pub fn revoke(&mut self, res: &mut Resources<'_>, at: CapRef) -> Result<()> {
        self.cap(at)?;
        let mut node = at;
        loop {
            while let Some(child) = self.get(node)?.first_child {
                node = child;
            }
            let slot = self.get(node)?;
            let parent = slot.parent;
            self.destroy(res, node, slot);
            if node == at {
                break;
            }
            node = match parent {
                Some(p) => p,
                None => break,
            };
        }
        Ok(())
    }

    /// Tear down one childless slot.
    fn destroy(&mut self, res: &mut Resources<'_>, at: CapRef, slot: CapSlot) {
        debug_assert!(slot.first_child.is_none());

        if let Some(parent) = slot.parent {
            let _ = self.unlink_from_parent(parent, at);
            self.roll_back_untyped(parent, &slot);
        }

        // Null the slot before touching the object so a CNode that holds a
        // capability to itself cannot be entered twice.
        self.set_empty(at);

        // Minted and copied slots alias an object owned elsewhere in the
        // tree; only the owning slot (untyped-derived bytes or a seeded
        // root) takes the object down with it.
        let owns_object = !slot.span.is_none() || slot.parent.is_none();
        if !owns_object {
            return;
        }

        match slot.object {
            CapObject::Null => {}
            CapObject::Untyped { base, size, .. } => {
                // The whole donation returns to the allocator; spans of
                // already-destroyed children are free again and skipped.
                res.pmm.release_range(base, size);
            }
            CapObject::CNode { id } => {
                for index in 0..CNODE_SLOTS as u16 {
                    let r = CapRef::new(id, index);
                    if matches!(self.get(r), Ok(s) if !s.is_null()) {
                        let _ = self.revoke(res, r);
                    }
                }
                self.release_cnode(id);
            }
            CapObject::Endpoint { id } => {
                while let Some(tid) = res.endpoints.pop_send(res.tcbs, id) {
                    Self::wake_with_error(res, tid);
                }
                while let Some(tid) = res.endpoints.pop_recv(res.tcbs, id) {
                    Self::wake_with_error(res, tid);
                }
                res.endpoints.free(id);
            }
            CapObject::Thread { tid } => {
                if res.tcbs.is_live(tid) {
                    let state = res.tcbs.get(tid).state;
                    if let (
                        ThreadState::BlockedSend | ThreadState::BlockedRecv,
                        Some(ep),
                    ) = (state, res.tcbs.get(tid).wait_on)
                    {
                        res.endpoints.unqueue(res.tcbs, ep, tid);
                    }
                    res.sched.remove_thread(res.tcbs, tid);
                    res.tcbs.free(tid);
                }
            }
            CapObject::AddressSpace { .. }
            | CapObject::Frame { .. }
            | CapObject::PageTable { .. }
            | CapObject::IrqHandler { .. } => {}
        }

        if !slot.span.is_none() {
            res.pmm
                .release_range(PhysicalAddress::new(slot.span.base), slot.span.len);
        }
    }

    /// If `at`'s bytes sit at the top of the parent Untyped's committed
    /// range, roll the bump watermark back over them.
    fn roll_back_untyped(&mut self, parent: CapRef, child: &CapSlot) {
        if child.span.is_none() {
            return;
        }
        let Ok(mut p) = self.get(parent) else { return };
        let CapObject::Untyped { base, size, offset } = p.object else {
            return;
        };
        if base.as_u64() + offset == child.span.end() {
            p.object = CapObject::Untyped {
                base,
                size,
                offset: child.span.base - base.as_u64(),
            };
            self.set_slot(parent, p);
        }
    }

    /// Wake a thread parked on a revoked endpoint: it becomes runnable and
    /// observes the endpoint's disappearance as its return value.
    fn wake_with_error(res: &mut Resources<'_>, tid: crate::sched::Tid) {
        let tcb = res.tcbs.get_mut(tid);
        tcb.wait_on = None;
        tcb.ctx.set_return(KernelError::InvalidState.to_errno());
        res.sched.make_runnable(res.tcbs, tid);
    }
}
