//! Capability store
//!
//! A fixed pool of CNodes, each a flat array of slots. Slots reference
//! each other by `(cnode, slot)` index pairs, so the derivation tree is a
//! forest of indices with no aliasing anywhere.
//!
//! The store itself is pure bookkeeping: collaborating pools (frames,
//! TCBs, endpoints, the scheduler) are passed in explicitly by the caller
//! holding their locks, which keeps every operation testable on the host.

use super::badge;
use super::types::{CapObject, CapRef, CapSlot, CapType, Rights, Span};
use crate::config::{CNODE_SLOTS, MAX_CNODES};
use crate::error::{KernelError, Result};
use crate::ipc::EndpointPool;
use crate::mm::{align_up, FrameAllocator};
use crate::sched::{Scheduler, TcbPool};

/// The CNode every thread's capability root defaults to
pub const ROOT_CNODE: u16 = 0;

/// Collaborating subsystems for operations that create or destroy kernel
/// objects.
pub struct Resources<'a> {
    pub pmm: &'a mut FrameAllocator,
    pub tcbs: &'a mut TcbPool,
    pub sched: &'a mut Scheduler,
    pub endpoints: &'a mut EndpointPool,
}

struct CNode {
    allocated: bool,
    slots: [CapSlot; CNODE_SLOTS],
}

impl CNode {
    const fn new() -> Self {
        Self {
            allocated: false,
            slots: [const { CapSlot::empty() }; CNODE_SLOTS],
        }
    }
}

/// The kernel's capability storage
pub struct CapSpace {
    cnodes: [CNode; MAX_CNODES],
}

impl CapSpace {
    pub const fn new() -> Self {
        Self {
            cnodes: [const { CNode::new() }; MAX_CNODES],
        }
    }

    /// Clear everything and bring up the root CNode. Runs at boot and
    /// between tests.
    pub fn reset(&mut self) {
        for cnode in &mut self.cnodes {
            *cnode = CNode::new();
        }
        self.cnodes[ROOT_CNODE as usize].allocated = true;
    }

    fn alloc_cnode(&mut self) -> Option<u16> {
        let id = self.cnodes.iter().position(|c| !c.allocated)?;
        self.cnodes[id] = CNode::new();
        self.cnodes[id].allocated = true;
        Some(id as u16)
    }

    fn free_cnode(&mut self, id: u16) {
        self.cnodes[id as usize] = CNode::new();
    }

    fn free_cnode_count(&self) -> usize {
        self.cnodes.iter().filter(|c| !c.allocated).count()
    }

    /// Read a slot; the slot may be Null.
    pub fn get(&self, at: CapRef) -> Result<CapSlot> {
        if !at.is_valid() || !self.cnodes[at.cnode as usize].allocated {
            return Err(KernelError::NoCap);
        }
        Ok(self.cnodes[at.cnode as usize].slots[at.slot as usize])
    }

    /// Read a slot that must hold a capability.
    pub fn cap(&self, at: CapRef) -> Result<CapSlot> {
        let slot = self.get(at)?;
        if slot.is_null() {
            return Err(KernelError::NoCap);
        }
        Ok(slot)
    }

    fn set(&mut self, at: CapRef, slot: CapSlot) {
        self.cnodes[at.cnode as usize].slots[at.slot as usize] = slot;
    }

    pub(super) fn set_slot(&mut self, at: CapRef, slot: CapSlot) {
        self.set(at, slot);
    }

    pub(super) fn set_empty(&mut self, at: CapRef) {
        self.set(at, CapSlot::empty());
    }

    pub(super) fn release_cnode(&mut self, id: u16) {
        self.free_cnode(id);
    }

    /// Install an originally-seeded capability (boot only): no parent, a
    /// fresh badge. Returns the badge.
    pub fn seed(&mut self, at: CapRef, object: CapObject, rights: Rights) -> Result<u64> {
        if !self.get(at)?.is_null() {
            return Err(KernelError::NoSpace);
        }
        let badge = badge::generate(at, object.cap_type());
        self.set(
            at,
            CapSlot {
                object,
                rights,
                badge,
                parent: None,
                first_child: None,
                next_sibling: None,
                span: Span::none(),
            },
        );
        Ok(badge)
    }

    /// Convert Untyped bytes into `count` fresh kernel objects installed
    /// at consecutive slots starting at `dest`.
    ///
    /// Either the whole batch succeeds or nothing is committed; the bump
    /// offset advances by the aligned total.
    pub fn retype(
        &mut self,
        res: &mut Resources<'_>,
        src: CapRef,
        new_type: CapType,
        dest: CapRef,
        count: usize,
    ) -> Result<()> {
        if count == 0 || dest.slot as usize + count > CNODE_SLOTS {
            return Err(KernelError::Invalid);
        }
        let mut parent = self.cap(src)?;
        let CapObject::Untyped { base, size, offset } = parent.object else {
            return Err(KernelError::NoCap);
        };
        let obj_size = new_type.object_size().ok_or(KernelError::Invalid)?;
        let start = align_up(offset, new_type.object_align());
        let need = obj_size.checked_mul(count as u64).ok_or(KernelError::Invalid)?;
        if start + need > size {
            return Err(KernelError::NoSpace);
        }
        for i in 0..count {
            let at = CapRef::new(dest.cnode, dest.slot + i as u16);
            if !self.get(at)?.is_null() {
                return Err(KernelError::NoSpace);
            }
        }
        // Pool capacity up front so the commit below cannot half-finish.
        let enough = match new_type {
            CapType::CNode => self.free_cnode_count() >= count,
            CapType::Thread => res.tcbs.free_count() >= count,
            CapType::Endpoint => res.endpoints.free_count() >= count,
            _ => true,
        };
        if !enough {
            return Err(KernelError::NoMem);
        }

        // The committed bytes belong to the children again as far as the
        // frame allocator is concerned.
        res.pmm.reserve_range(base.offset(start), need);

        let mut first_child = parent.first_child;
        for i in 0..count {
            let at = CapRef::new(dest.cnode, dest.slot + i as u16);
            let obj_base = base.offset(start + i as u64 * obj_size);
            let new_badge = badge::generate(at, new_type);
            let object = match new_type {
                CapType::CNode => {
                    let id = self.alloc_cnode().ok_or(KernelError::NoMem)?;
                    CapObject::CNode { id }
                }
                CapType::Endpoint => {
                    let id = res.endpoints.alloc(new_badge).ok_or(KernelError::NoMem)?;
                    CapObject::Endpoint { id }
                }
                CapType::Thread => {
                    let tid = res.tcbs.alloc().ok_or(KernelError::NoMem)?;
                    CapObject::Thread { tid }
                }
                CapType::AddressSpace => CapObject::AddressSpace { root: obj_base },
                CapType::Frame => CapObject::Frame { base: obj_base },
                CapType::PageTable => CapObject::PageTable { base: obj_base },
                _ => return Err(KernelError::Invalid),
            };
            self.set(
                at,
                CapSlot {
                    object,
                    rights: parent.rights,
                    badge: new_badge,
                    parent: Some(src),
                    first_child: None,
                    next_sibling: first_child,
                    span: Span {
                        base: obj_base.as_u64(),
                        len: obj_size,
                    },
                },
            );
            first_child = Some(at);
        }

        parent.first_child = first_child;
        parent.object = CapObject::Untyped {
            base,
            size,
            offset: start + need,
        };
        self.set(src, parent);
        Ok(())
    }

    /// Derive an attenuated child: rights are the intersection of the
    /// parent's rights and `mask`, and the badge is fresh. A zero badge
    /// argument asks the kernel to mint one.
    pub fn mint(&mut self, src: CapRef, dest: CapRef, mask: Rights, new_badge: u64) -> Result<()> {
        let mut parent = self.cap(src)?;
        if matches!(parent.object, CapObject::Untyped { .. }) {
            // A minted Untyped would alias the bump state of its parent.
            return Err(KernelError::Invalid);
        }
        if !self.get(dest)?.is_null() {
            return Err(KernelError::NoSpace);
        }
        let badge = if new_badge == 0 {
            badge::generate(dest, parent.cap_type())
        } else {
            new_badge & badge::BADGE_MASK
        };
        self.set(
            dest,
            CapSlot {
                object: parent.object,
                rights: parent.rights & mask,
                badge,
                parent: Some(src),
                first_child: None,
                next_sibling: parent.first_child,
                span: Span::none(),
            },
        );
        parent.first_child = Some(dest);
        self.set(src, parent);
        Ok(())
    }

    /// Copy or move a capability to an empty slot. Rights and badge are
    /// preserved either way; a move drags the derivation subtree along.
    pub fn transfer(&mut self, src: CapRef, dest: CapRef, mv: bool) -> Result<()> {
        let mut slot = self.cap(src)?;
        if !slot.rights.contains(Rights::GRANT) {
            return Err(KernelError::AccessDenied);
        }
        if src == dest {
            return Err(KernelError::Invalid);
        }
        if !self.get(dest)?.is_null() {
            return Err(KernelError::NoSpace);
        }

        if mv {
            if let Some(parent) = slot.parent {
                self.replace_in_chain(parent, src, dest)?;
            }
            let mut child = slot.first_child;
            while let Some(c) = child {
                let mut cs = self.get(c)?;
                cs.parent = Some(dest);
                child = cs.next_sibling;
                self.set(c, cs);
            }
            self.set(dest, slot);
            self.set(src, CapSlot::empty());
        } else {
            self.set(
                dest,
                CapSlot {
                    object: slot.object,
                    rights: slot.rights,
                    badge: slot.badge,
                    parent: Some(src),
                    first_child: None,
                    next_sibling: slot.first_child,
                    span: Span::none(),
                },
            );
            slot.first_child = Some(dest);
            self.set(src, slot);
        }
        Ok(())
    }

    /// Remove a slot without destroying its subtree: the children are
    /// spliced up to the removed slot's parent (or become roots).
    pub fn delete(&mut self, at: CapRef) -> Result<()> {
        let slot = self.cap(at)?;
        if let Some(parent) = slot.parent {
            self.unlink_from_parent(parent, at)?;
        }

        match slot.parent {
            Some(parent) => {
                // Reparent, then prepend the chain to the parent's list.
                let mut last = None;
                let mut child = slot.first_child;
                while let Some(c) = child {
                    let mut cs = self.get(c)?;
                    cs.parent = Some(parent);
                    child = cs.next_sibling;
                    last = Some(c);
                    self.set(c, cs);
                }
                if let (Some(first), Some(last)) = (slot.first_child, last) {
                    let mut p = self.get(parent)?;
                    let mut tail = self.get(last)?;
                    tail.next_sibling = p.first_child;
                    self.set(last, tail);
                    p.first_child = Some(first);
                    self.set(parent, p);
                }
            }
            None => {
                let mut child = slot.first_child;
                while let Some(c) = child {
                    let mut cs = self.get(c)?;
                    child = cs.next_sibling;
                    cs.parent = None;
                    cs.next_sibling = None;
                    self.set(c, cs);
                }
            }
        }

        self.set(at, CapSlot::empty());
        Ok(())
    }

    /// Constant-time badge check.
    pub fn verify(&self, at: CapRef, expected: u64) -> bool {
        match self.get(at) {
            Ok(slot) if !slot.is_null() => badge::constant_time_eq(slot.badge, expected),
            _ => false,
        }
    }

    /// Log-formatted dump of one CNode's occupied slots.
    pub fn dump(&self, cnode: u16) {
        if cnode as usize >= MAX_CNODES || !self.cnodes[cnode as usize].allocated {
            log::warn!("caps: dump of dead cnode {}", cnode);
            return;
        }
        log::info!("caps: cnode {} occupied slots:", cnode);
        for (i, slot) in self.cnodes[cnode as usize].slots.iter().enumerate() {
            if !slot.is_null() {
                log::info!(
                    "  [{:4}] {:?} rights={:?} badge={:#x} parent={:?}",
                    i,
                    slot.cap_type(),
                    slot.rights,
                    slot.badge,
                    slot.parent.map(|p| (p.cnode, p.slot)),
                );
            }
        }
    }

    /// Detach `child` from `parent`'s child chain.
    pub(super) fn unlink_from_parent(&mut self, parent: CapRef, child: CapRef) -> Result<()> {
        let p = self.get(parent)?;
        if p.is_null() {
            // The parent was already destroyed; nothing to fix up.
            return Ok(());
        }
        self.replace_in_chain(parent, child, CapRef::new(u16::MAX, u16::MAX))
            .map(|_| ())
    }

    /// Substitute `old` with `new` in `parent`'s child chain. The
    /// out-of-range sentinel ref removes `old` instead.
    fn replace_in_chain(&mut self, parent: CapRef, old: CapRef, new: CapRef) -> Result<()> {
        let removing = !new.is_valid();
        let old_next = self.get(old)?.next_sibling;
        let target = if removing { old_next } else { Some(new) };

        let mut p = self.get(parent)?;
        if p.first_child == Some(old) {
            p.first_child = target;
            self.set(parent, p);
            return Ok(());
        }
        let mut cursor = p.first_child;
        while let Some(cur) = cursor {
            let mut cs = self.get(cur)?;
            if cs.next_sibling == Some(old) {
                cs.next_sibling = target;
                self.set(cur, cs);
                return Ok(());
            }
            cursor = cs.next_sibling;
        }
        Ok(())
    }
}

impl Default for CapSpace {
    fn default() -> Self {
        Self::new()
    }
}
