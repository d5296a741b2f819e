//! Capability system
//!
//! Unforgeable handles to kernel objects, stored in CNodes and governed by
//! retype, mint, transfer, delete, and recursive revoke. Every privileged
//! operation in the kernel authorises against this store.

pub mod badge;
pub mod revoke;
pub mod space;
pub mod types;


pub use space::{CapSpace, Resources, ROOT_CNODE};
pub use types::{CapObject, CapRef, CapSlot, CapType, Rights, Span};

use spin::Mutex;

/// Global capability store
pub static CAP_SPACE: Mutex<CapSpace> = Mutex::new(CapSpace::new());

/// Bring up the store with an empty root CNode.
pub fn init() {
    CAP_SPACE.lock().reset();
    log::info!("caps: store ready, root cnode {}", ROOT_CNODE);
}
