//! Inter-process communication
//!
//! Endpoint objects and the synchronous Call/ReplyWait rendezvous with
//! direct switching and kernel-injected badges.

pub mod endpoint;
pub mod sync;

#[cfg(test)]
mod tests;

pub use endpoint::{EndpointId, EndpointPool};
pub use sync::{call, recv, reply_wait, send, IpcOutcome};

use spin::Mutex;

/// Global endpoint pool
pub static ENDPOINTS: Mutex<EndpointPool> = Mutex::new(EndpointPool::new());

pub fn init() {
    ENDPOINTS.lock().reset();
    log::info!("ipc: endpoint pool ready");
}
