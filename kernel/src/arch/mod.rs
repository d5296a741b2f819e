//! Architecture support
//!
//! The kernel proper targets 64-bit x86 bare metal. Host builds (the test
//! harness) get no-op stand-ins so the portable subsystems compile and run
//! under the standard test runner.

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod x86_64;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use self::x86_64::{halt, init};

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub fn init() {}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub fn halt() -> ! {
    panic!("halt on host");
}
