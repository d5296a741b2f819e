//! Memory system calls (21-22)
//!
//! Frame capabilities are mapped into the caller's own address space,
//! which is the active one; the recursive window (or the simulated store
//! on the host) is reached through `vmm::with_active`.

use super::{HandlerResult, SyscallCtx};
use crate::cap::{CapObject, Rights};
use crate::error::KernelError;
use crate::mm::vmm::{self, PageFlags};
use crate::mm::{VirtualAddress, FRAME_SIZE};

/// Mapping request bit: page is writable
pub const MAP_WRITE: u64 = 1 << 0;
/// Mapping request bit: page is executable (denied when writable)
pub const MAP_EXEC: u64 = 1 << 1;

fn user_page(arg: u64) -> Result<VirtualAddress, KernelError> {
    let virt = VirtualAddress::new(arg);
    if !virt.is_user() || arg % FRAME_SIZE as u64 != 0 {
        return Err(KernelError::Invalid);
    }
    Ok(virt)
}

/// Derive leaf flags from the request bits. Read is implied; a writable
/// page loses execute before it ever reaches the table.
pub fn user_flags(request: u64) -> PageFlags {
    let mut flags = PageFlags::USER;
    if request & MAP_WRITE != 0 {
        flags |= PageFlags::WRITE;
    }
    if request & MAP_EXEC == 0 || request & MAP_WRITE != 0 {
        flags |= PageFlags::NO_EXECUTE;
    }
    flags
}

/// MapFrame(frame_slot, vaddr, flags)
pub fn map_frame(ctx: &mut SyscallCtx<'_>, args: [u64; 6]) -> HandlerResult {
    let cap = ctx.caps.cap(ctx.slot(args[0])?)?;
    let CapObject::Frame { base } = cap.object else {
        return Err(KernelError::NoCap);
    };
    if !cap.rights.contains(Rights::MAP) {
        return Err(KernelError::AccessDenied);
    }
    let virt = user_page(args[1])?;
    let flags = user_flags(args[2]);

    vmm::with_active(|a| vmm::map_page(a, ctx.pmm, virt, base, flags))
        .map_err(KernelError::from)?;
    Ok((0, None))
}

/// UnmapFrame(vaddr)
pub fn unmap_frame(_ctx: &mut SyscallCtx<'_>, args: [u64; 6]) -> HandlerResult {
    let virt = user_page(args[0])?;
    vmm::with_active(|a| vmm::unmap_page(a, virt))?;
    Ok((0, None))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_derivation_enforces_wx() {
        assert!(user_flags(0).contains(PageFlags::NO_EXECUTE));
        assert!(!user_flags(MAP_EXEC).contains(PageFlags::NO_EXECUTE));
        let wx = user_flags(MAP_WRITE | MAP_EXEC);
        assert!(wx.contains(PageFlags::WRITE));
        assert!(wx.contains(PageFlags::NO_EXECUTE));
    }

    #[test]
    fn addresses_must_be_aligned_user_pages() {
        assert!(user_page(0x401000).is_ok());
        assert_eq!(user_page(0x401001), Err(KernelError::Invalid));
        assert_eq!(
            user_page(0xFFFF_8000_0000_0000),
            Err(KernelError::Invalid)
        );
    }
}
