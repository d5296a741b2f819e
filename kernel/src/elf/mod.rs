//! ELF64 loader
//!
//! Parses service executables out of the initrd and maps their `PT_LOAD`
//! segments into the active address space. Permission policy: every page
//! is readable, writable only when the segment says so, and executable
//! only when the segment says so; the page-table layer additionally
//! refuses writable-and-executable user pages.

pub mod types;

use self::types::{
    Elf64Header, ProgramHeader, ELFCLASS64, ELFDATA2LSB, ELF_MAGIC, EM_X86_64, ET_EXEC, PF_W,
    PF_X, PT_LOAD,
};

use crate::error::{KernelError, Result};
use crate::mm::vmm::{self, PageFlags, PageTableAccess};
use crate::mm::{align_down, align_up, FrameAllocator, VirtualAddress, FRAME_SIZE};

/// Bounds-checked unaligned read of a `#[repr(C)]` record out of the
/// image bytes.
fn read_struct<T: Copy>(data: &[u8], offset: usize) -> Result<T> {
    let end = offset
        .checked_add(core::mem::size_of::<T>())
        .ok_or(KernelError::Invalid)?;
    if end > data.len() {
        return Err(KernelError::Invalid);
    }
    // SAFETY: the range check above keeps the read inside `data`; T is a
    // plain-old-data record read unaligned.
    Ok(unsafe { (data.as_ptr().add(offset) as *const T).read_unaligned() })
}

/// A validated ELF64 executable image
pub struct ElfImage<'a> {
    data: &'a [u8],
    header: Elf64Header,
}

impl<'a> ElfImage<'a> {
    /// Validate the file header: 64-bit, little-endian, x86-64
    /// executable.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let header: Elf64Header = read_struct(data, 0)?;
        if header.ident[..4] != ELF_MAGIC
            || header.ident[4] != ELFCLASS64
            || header.ident[5] != ELFDATA2LSB
            || header.e_type != ET_EXEC
            || header.machine != EM_X86_64
        {
            return Err(KernelError::Invalid);
        }
        if header.phentsize as usize != core::mem::size_of::<ProgramHeader>() {
            return Err(KernelError::Invalid);
        }
        Ok(Self { data, header })
    }

    pub fn entry(&self) -> VirtualAddress {
        VirtualAddress::new(self.header.entry)
    }

    /// The `PT_LOAD` program headers, in file order.
    pub fn load_segments(&self) -> impl Iterator<Item = Result<ProgramHeader>> + '_ {
        (0..self.header.phnum as usize).filter_map(move |i| {
            let offset = self.header.phoff as usize + i * self.header.phentsize as usize;
            match read_struct::<ProgramHeader>(self.data, offset) {
                Ok(ph) if ph.p_type != PT_LOAD => None,
                other => Some(other),
            }
        })
    }
}

/// Leaf flags for a loadable segment: read always, write and execute by
/// segment permission.
pub fn segment_flags(p_flags: u32) -> PageFlags {
    let mut flags = PageFlags::USER;
    if p_flags & PF_W != 0 {
        flags |= PageFlags::WRITE;
    }
    if p_flags & PF_X == 0 {
        flags |= PageFlags::NO_EXECUTE;
    }
    flags
}

/// Map an image's segments into the active address space, copying file
/// bytes and zero-filling the BSS tail. Returns the entry point.
///
/// The target range must be unmapped; a collision aborts the load with
/// `NoSpace` before any partial segment is visible at the colliding page.
pub fn load_image<A: PageTableAccess + ?Sized>(
    access: &mut A,
    pmm: &mut FrameAllocator,
    image: &ElfImage<'_>,
) -> Result<VirtualAddress> {
    // Collision check first, across all segments.
    for segment in image.load_segments() {
        let ph = segment?;
        if ph.p_memsz == 0 {
            continue;
        }
        validate_segment(image.data, &ph)?;
        let start = align_down(ph.p_vaddr, FRAME_SIZE as u64);
        let end = align_up(ph.p_vaddr + ph.p_memsz, FRAME_SIZE as u64);
        for page in (start..end).step_by(FRAME_SIZE) {
            if vmm::is_mapped(access, VirtualAddress::new(page)) {
                return Err(KernelError::NoSpace);
            }
        }
    }

    for segment in image.load_segments() {
        let ph = segment?;
        if ph.p_memsz == 0 {
            continue;
        }
        let flags = segment_flags(ph.p_flags);
        let start = align_down(ph.p_vaddr, FRAME_SIZE as u64);
        let end = align_up(ph.p_vaddr + ph.p_memsz, FRAME_SIZE as u64);
        let file_end = ph.p_vaddr + ph.p_filesz;

        for page in (start..end).step_by(FRAME_SIZE) {
            let frame = pmm.alloc_frame()?;
            access.zero_frame(frame);

            // Overlap of this page with the file-backed byte range.
            let copy_from = page.max(ph.p_vaddr);
            let copy_to = (page + FRAME_SIZE as u64).min(file_end);
            if copy_from < copy_to {
                let src = (ph.p_offset + (copy_from - ph.p_vaddr)) as usize;
                let len = (copy_to - copy_from) as usize;
                access.copy_into_frame(
                    frame,
                    (copy_from - page) as usize,
                    &image.data[src..src + len],
                );
            }

            vmm::map_page(access, pmm, VirtualAddress::new(page), frame, flags)
                .map_err(KernelError::from)?;
        }
    }

    Ok(image.entry())
}

fn validate_segment(data: &[u8], ph: &ProgramHeader) -> Result<()> {
    if ph.p_filesz > ph.p_memsz {
        return Err(KernelError::Invalid);
    }
    let file_end = ph
        .p_offset
        .checked_add(ph.p_filesz)
        .ok_or(KernelError::Invalid)?;
    if file_end > data.len() as u64 {
        return Err(KernelError::Invalid);
    }
    let vaddr_end = ph
        .p_vaddr
        .checked_add(ph.p_memsz)
        .ok_or(KernelError::Invalid)?;
    if !VirtualAddress::new(ph.p_vaddr).is_user() || !VirtualAddress::new(vaddr_end).is_user() {
        return Err(KernelError::Invalid);
    }
    Ok(())
}
