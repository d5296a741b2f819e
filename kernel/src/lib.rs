//! CinnabarOS kernel library
//!
//! A capability-based microkernel for 64-bit x86: unforgeable handles in
//! CNodes, a bitmap frame allocator, recursive paging, a FIFO scheduler
//! over a fixed TCB pool, and synchronous direct-switch IPC.
//!
//! The crate builds two ways. Bare metal gets the full kernel including
//! the architecture layer; host builds compile every portable subsystem
//! for the standard test harness, with simulated page tables standing in
//! for the recursive window.

#![no_std]
#![cfg_attr(
    all(target_arch = "x86_64", target_os = "none"),
    feature(abi_x86_interrupt)
)]

// Host target: the test harness and its collections come from std.
#[cfg(not(target_os = "none"))]
extern crate std;

#[macro_use]
pub mod print;

pub mod arch;
pub mod bootstrap;
pub mod cap;
pub mod config;
pub mod elf;
pub mod error;
pub mod handover;
pub mod initrd;
pub mod ipc;
pub mod logger;
pub mod mm;
pub mod namespace;
pub mod sched;
pub mod serial;
pub mod syscall;

pub use error::{KernelError, Result};
