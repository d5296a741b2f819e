//! Service name registration
//!
//! A deliberately small hook: services register an endpoint under a short
//! name (carried in two argument words) and the kernel's service wiring
//! looks names up during bootstrap. Anything richer belongs in user space.

use spin::Mutex;

use crate::config::{MAX_NAMESPACE_ENTRIES, NAMESPACE_NAME_BYTES};
use crate::error::{KernelError, Result};
use crate::ipc::EndpointId;

#[derive(Debug, Clone, Copy)]
struct NameEntry {
    used: bool,
    name: [u8; NAMESPACE_NAME_BYTES],
    endpoint: EndpointId,
}

impl NameEntry {
    const fn empty() -> Self {
        Self {
            used: false,
            name: [0; NAMESPACE_NAME_BYTES],
            endpoint: 0,
        }
    }
}

/// Fixed-size name table
pub struct Namespace {
    entries: [NameEntry; MAX_NAMESPACE_ENTRIES],
}

impl Namespace {
    pub const fn new() -> Self {
        Self {
            entries: [NameEntry::empty(); MAX_NAMESPACE_ENTRIES],
        }
    }

    pub fn reset(&mut self) {
        self.entries = [NameEntry::empty(); MAX_NAMESPACE_ENTRIES];
    }

    /// Bind `name` to an endpoint. Re-registering an existing name is an
    /// error; a full table is `NoSpace`.
    pub fn register(&mut self, name: [u8; NAMESPACE_NAME_BYTES], endpoint: EndpointId) -> Result<()> {
        if name == [0; NAMESPACE_NAME_BYTES] {
            return Err(KernelError::Invalid);
        }
        if self.entries.iter().any(|e| e.used && e.name == name) {
            return Err(KernelError::NoSpace);
        }
        let slot = self
            .entries
            .iter_mut()
            .find(|e| !e.used)
            .ok_or(KernelError::NoSpace)?;
        *slot = NameEntry {
            used: true,
            name,
            endpoint,
        };
        Ok(())
    }

    pub fn lookup(&self, name: &[u8; NAMESPACE_NAME_BYTES]) -> Option<EndpointId> {
        self.entries
            .iter()
            .find(|e| e.used && e.name == *name)
            .map(|e| e.endpoint)
    }

    /// Drop every binding to `endpoint` (endpoint deletion).
    pub fn forget_endpoint(&mut self, endpoint: EndpointId) {
        for entry in &mut self.entries {
            if entry.used && entry.endpoint == endpoint {
                *entry = NameEntry::empty();
            }
        }
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new()
    }
}

/// Global name table
pub static NAMESPACE: Mutex<Namespace> = Mutex::new(Namespace::new());

/// Decode the two-argument-word name convention used by the register
/// operation.
pub fn name_from_words(w0: u64, w1: u64) -> [u8; NAMESPACE_NAME_BYTES] {
    let mut name = [0u8; NAMESPACE_NAME_BYTES];
    name[..8].copy_from_slice(&w0.to_le_bytes());
    name[8..].copy_from_slice(&w1.to_le_bytes());
    name
}
