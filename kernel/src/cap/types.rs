//! Capability system types

use bitflags::bitflags;

use crate::config::{CNODE_SLOTS, KERNEL_STACK_SIZE, MAX_CNODES};
use crate::mm::{PhysicalAddress, FRAME_SIZE};

/// Kernel object types a capability can name
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapType {
    Null = 0,
    /// Raw physical memory, the source material for retype
    Untyped = 1,
    /// A table of capability slots
    CNode = 2,
    /// IPC rendezvous object
    Endpoint = 3,
    /// Thread control block
    Thread = 4,
    /// Page-table root
    AddressSpace = 5,
    /// One mappable physical frame
    Frame = 6,
    /// Intermediate page table
    PageTable = 7,
    /// Interrupt delivery hook
    IrqHandler = 8,
}

impl CapType {
    /// Bytes an object of this type commits from its Untyped region.
    /// `None` for types retype cannot produce.
    pub const fn object_size(self) -> Option<u64> {
        match self {
            CapType::CNode => Some(FRAME_SIZE as u64),
            CapType::Endpoint => Some(64),
            CapType::Thread => Some((FRAME_SIZE + KERNEL_STACK_SIZE) as u64),
            CapType::AddressSpace => Some(FRAME_SIZE as u64),
            CapType::Frame => Some(FRAME_SIZE as u64),
            CapType::PageTable => Some(FRAME_SIZE as u64),
            CapType::Null | CapType::Untyped | CapType::IrqHandler => None,
        }
    }

    /// Alignment of the object within its Untyped region
    pub const fn object_align(self) -> u64 {
        match self {
            CapType::Endpoint => 64,
            _ => FRAME_SIZE as u64,
        }
    }
}

bitflags! {
    /// Capability rights mask
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Rights: u8 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        /// Permission to transfer the capability elsewhere
        const GRANT = 1 << 2;
        /// Permission to map the object into an address space
        const MAP   = 1 << 3;
    }
}

impl Rights {
    pub const fn full() -> Self {
        Self::all()
    }
}

/// Location of a capability slot: (CNode, slot index), packed for storage
/// in derivation links.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapRef {
    pub cnode: u16,
    pub slot: u16,
}

impl CapRef {
    pub const fn new(cnode: u16, slot: u16) -> Self {
        Self { cnode, slot }
    }

    pub const fn pack(self) -> u32 {
        (self.cnode as u32) << 16 | self.slot as u32
    }

    pub const fn unpack(raw: u32) -> Self {
        Self {
            cnode: (raw >> 16) as u16,
            slot: raw as u16,
        }
    }

    pub const fn is_valid(self) -> bool {
        (self.cnode as usize) < MAX_CNODES && (self.slot as usize) < CNODE_SLOTS
    }
}

impl core::fmt::Display for CapRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.cnode, self.slot)
    }
}

/// Per-type payload of a capability slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapObject {
    Null,
    Untyped {
        base: PhysicalAddress,
        size: u64,
        /// Bump watermark; bytes below it are committed to children
        offset: u64,
    },
    CNode {
        id: u16,
    },
    Endpoint {
        id: u16,
    },
    Thread {
        tid: u16,
    },
    AddressSpace {
        root: PhysicalAddress,
    },
    Frame {
        base: PhysicalAddress,
    },
    PageTable {
        base: PhysicalAddress,
    },
    IrqHandler {
        irq: u8,
    },
}

impl CapObject {
    pub const fn cap_type(&self) -> CapType {
        match self {
            CapObject::Null => CapType::Null,
            CapObject::Untyped { .. } => CapType::Untyped,
            CapObject::CNode { .. } => CapType::CNode,
            CapObject::Endpoint { .. } => CapType::Endpoint,
            CapObject::Thread { .. } => CapType::Thread,
            CapObject::AddressSpace { .. } => CapType::AddressSpace,
            CapObject::Frame { .. } => CapType::Frame,
            CapObject::PageTable { .. } => CapType::PageTable,
            CapObject::IrqHandler { .. } => CapType::IrqHandler,
        }
    }
}

/// Physical byte range a slot committed from its parent Untyped. Zero
/// length means the slot owns no untyped bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub base: u64,
    pub len: u64,
}

impl Span {
    pub const fn none() -> Self {
        Self { base: 0, len: 0 }
    }

    pub const fn is_none(&self) -> bool {
        self.len == 0
    }

    pub const fn end(&self) -> u64 {
        self.base + self.len
    }
}

/// One capability slot: the object, its attenuation state, and its place
/// in the derivation tree (index links, never pointers).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CapSlot {
    pub object: CapObject,
    pub rights: Rights,
    pub badge: u64,
    pub parent: Option<CapRef>,
    pub first_child: Option<CapRef>,
    pub next_sibling: Option<CapRef>,
    pub span: Span,
}

impl CapSlot {
    pub const fn empty() -> Self {
        Self {
            object: CapObject::Null,
            rights: Rights::empty(),
            badge: 0,
            parent: None,
            first_child: None,
            next_sibling: None,
            span: Span::none(),
        }
    }

    pub const fn is_null(&self) -> bool {
        matches!(self.object, CapObject::Null)
    }

    pub const fn cap_type(&self) -> CapType {
        self.object.cap_type()
    }
}
