//! Kernel error kinds
//!
//! Every fallible kernel path returns one of these kinds. At the syscall
//! boundary each kind maps to a distinct negative return value.

use core::fmt;

/// Kernel operation result type
pub type Result<T> = core::result::Result<T, KernelError>;

/// Kernel error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Malformed arguments or unknown syscall number
    Invalid,
    /// Referenced slot is empty or holds the wrong capability type
    NoCap,
    /// Physical frames or a fixed pool are exhausted
    NoMem,
    /// The capability lacks the required rights
    AccessDenied,
    /// Destination slot occupied or untyped region too small
    NoSpace,
    /// Object is not in the state the operation expects
    InvalidState,
    /// Non-blocking operation found an empty queue
    WouldBlock,
    /// Reply requested without a prior call
    NoCaller,
}

impl KernelError {
    /// Static description of the error
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invalid => "invalid argument",
            Self::NoCap => "no such capability",
            Self::NoMem => "out of memory",
            Self::AccessDenied => "access denied",
            Self::NoSpace => "no space",
            Self::InvalidState => "invalid state",
            Self::WouldBlock => "operation would block",
            Self::NoCaller => "no caller to reply to",
        }
    }

    /// Convert to the negative code returned across the syscall boundary
    pub fn to_errno(self) -> i64 {
        match self {
            Self::Invalid => -1,
            Self::NoCap => -2,
            Self::NoMem => -3,
            Self::AccessDenied => -4,
            Self::NoSpace => -5,
            Self::InvalidState => -6,
            Self::WouldBlock => -7,
            Self::NoCaller => -8,
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
