//! Service archive parsing
//!
//! The initrd is a POSIX "new ASCII" cpio archive (`070701` magic): a
//! 110-byte header of ASCII-hex fields, the NUL-terminated name, then the
//! data, with name and data each padded to four bytes. A `TRAILER!!!`
//! entry ends the archive. The name length always comes from the header,
//! never from scanning for the NUL.

use crate::error::{KernelError, Result};

const MAGIC: &[u8; 6] = b"070701";
const HEADER_LEN: usize = 110;
const TRAILER: &str = "TRAILER!!!";

/// One archive member
#[derive(Debug, Clone, Copy)]
pub struct CpioEntry<'a> {
    pub name: &'a str,
    pub data: &'a [u8],
}

/// Borrowing view of a cpio archive
#[derive(Debug, Clone, Copy)]
pub struct CpioArchive<'a> {
    data: &'a [u8],
}

impl<'a> CpioArchive<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// Iterate members until the trailer (or a parse error, which ends
    /// iteration with an `Err` item).
    pub fn entries(&self) -> CpioIter<'a> {
        CpioIter {
            data: self.data,
            offset: 0,
            done: false,
        }
    }

    /// Find a member by exact name.
    pub fn find(&self, name: &str) -> Option<&'a [u8]> {
        self.entries()
            .filter_map(|e| e.ok())
            .find(|e| e.name == name)
            .map(|e| e.data)
    }
}

pub struct CpioIter<'a> {
    data: &'a [u8],
    offset: usize,
    done: bool,
}

fn hex_field(data: &[u8], offset: usize) -> Result<u64> {
    let bytes = data
        .get(offset..offset + 8)
        .ok_or(KernelError::Invalid)?;
    let text = core::str::from_utf8(bytes).map_err(|_| KernelError::Invalid)?;
    u64::from_str_radix(text, 16).map_err(|_| KernelError::Invalid)
}

const fn pad4(n: usize) -> usize {
    (n + 3) & !3
}

impl<'a> Iterator for CpioIter<'a> {
    type Item = Result<CpioEntry<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let at = self.offset;
        if self.data.len() < at + HEADER_LEN {
            self.done = true;
            return Some(Err(KernelError::Invalid));
        }
        if &self.data[at..at + 6] != MAGIC {
            self.done = true;
            return Some(Err(KernelError::Invalid));
        }

        let filesize = match hex_field(self.data, at + 54) {
            Ok(v) => v as usize,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };
        let namesize = match hex_field(self.data, at + 94) {
            Ok(v) => v as usize,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };
        if namesize == 0 {
            self.done = true;
            return Some(Err(KernelError::Invalid));
        }

        let name_start = at + HEADER_LEN;
        let data_start = pad4(name_start + namesize);
        let data_end = data_start + filesize;
        if self.data.len() < data_end {
            self.done = true;
            return Some(Err(KernelError::Invalid));
        }

        // namesize counts the terminating NUL.
        let name_bytes = &self.data[name_start..name_start + namesize - 1];
        let name = match core::str::from_utf8(name_bytes) {
            Ok(n) => n,
            Err(_) => {
                self.done = true;
                return Some(Err(KernelError::Invalid));
            }
        };

        if name == TRAILER {
            self.done = true;
            return None;
        }

        self.offset = pad4(data_end);
        Some(Ok(CpioEntry {
            name,
            data: &self.data[data_start..data_end],
        }))
    }
}
