// This module manages the executable memory that compiled fragments live in. Memory is
// obtained from the operating system with mmap in chunks of at least the configured chunk
// size (a single fragment larger than a chunk gets a chunk of its own, rounded up to whole
// pages). Code is installed by bump allocation inside the current chunk with 16-byte
// alignment: the chunk is made writable, the bytes are copied in, and the chunk is flipped
// back to read+execute, so no page is ever writable and executable at the same time. The
// total mapped size is bounded by the configured limit; a request that would exceed it is
// reported as exhaustion rather than mapped. Installed code is never moved or freed
// individually. All chunks are unmapped when the allocator is dropped, which happens when
// the owning context is destroyed.

//! Executable memory for generated code.

use std::ptr::NonNull;

use crate::core::error::CodeAllocError;

const CODE_ALIGN: usize = 16;

/// One mapping of executable pages.
#[derive(Debug)]
struct CodeChunk {
    base: NonNull<u8>,
    size: usize,
    used: usize,
}

impl CodeChunk {
    fn remaining(&self) -> usize {
        self.size - self.used
    }
}

/// Bump allocator over mmap'd executable chunks.
#[derive(Debug)]
pub struct CodeAlloc {
    chunks: Vec<CodeChunk>,
    chunk_size: usize,
    limit: usize,
    mapped: usize,
    bytes_used: usize,
}

impl CodeAlloc {
    pub fn new(chunk_size: usize, limit: usize) -> Self {
        Self {
            chunks: Vec::new(),
            chunk_size: chunk_size.max(CODE_ALIGN),
            limit,
            mapped: 0,
            bytes_used: 0,
        }
    }

    /// Bytes of code installed so far.
    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    /// Bytes mapped from the operating system.
    pub fn bytes_mapped(&self) -> usize {
        self.mapped
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Copy `code` into executable memory and return its address.
    pub fn install(&mut self, code: &[u8]) -> Result<NonNull<u8>, CodeAllocError> {
        let needed = code.len().max(1);
        let fits = self
            .chunks
            .last()
            .is_some_and(|chunk| align_up(chunk.used, CODE_ALIGN) + needed <= chunk.size);
        if !fits {
            self.map_chunk(needed)?;
        }

        let chunk = self.chunks.last_mut().ok_or(CodeAllocError::Unsupported)?;
        let offset = align_up(chunk.used, CODE_ALIGN);
        sys::protect(chunk.base, chunk.size, false)?;
        // SAFETY: offset + needed <= chunk.size and the chunk was just made writable.
        let dest = unsafe {
            let dest = chunk.base.as_ptr().add(offset);
            std::ptr::copy_nonoverlapping(code.as_ptr(), dest, code.len());
            dest
        };
        sys::protect(chunk.base, chunk.size, true)?;

        chunk.used = offset + needed;
        self.bytes_used += code.len();
        log::trace!(
            "installed {} bytes of code at {:p} ({} bytes left in chunk)",
            code.len(),
            dest,
            chunk.remaining()
        );
        NonNull::new(dest).ok_or(CodeAllocError::Unsupported)
    }

    fn map_chunk(&mut self, needed: usize) -> Result<(), CodeAllocError> {
        let page = sys::page_size();
        let size = align_up(needed.max(self.chunk_size), page);
        if self.mapped + size > self.limit {
            return Err(CodeAllocError::Exhausted {
                needed,
                used: self.mapped,
                limit: self.limit,
            });
        }
        let base = sys::map(size)?;
        log::debug!("mapped code chunk of {size} bytes at {:p}", base.as_ptr());
        self.mapped += size;
        self.chunks.push(CodeChunk { base, size, used: 0 });
        Ok(())
    }
}

impl Drop for CodeAlloc {
    fn drop(&mut self) {
        for chunk in self.chunks.drain(..) {
            if let Err(e) = sys::unmap(chunk.base, chunk.size) {
                log::warn!("failed to unmap code chunk at {:p}: {e}", chunk.base.as_ptr());
            }
        }
    }
}

fn align_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

#[cfg(unix)]
mod sys {
    use std::io;
    use std::ptr::NonNull;

    use crate::core::error::CodeAllocError;

    pub fn page_size() -> usize {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            size as usize
        } else {
            4096
        }
    }

    pub fn map(size: usize) -> Result<NonNull<u8>, CodeAllocError> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANON | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(CodeAllocError::Map {
                size,
                source: io::Error::last_os_error(),
            });
        }
        NonNull::new(ptr as *mut u8).ok_or(CodeAllocError::Map {
            size,
            source: io::Error::other("mmap returned null"),
        })
    }

    pub fn protect(base: NonNull<u8>, size: usize, executable: bool) -> Result<(), CodeAllocError> {
        let prot = if executable {
            libc::PROT_READ | libc::PROT_EXEC
        } else {
            libc::PROT_READ | libc::PROT_WRITE
        };
        let rc = unsafe { libc::mprotect(base.as_ptr() as *mut libc::c_void, size, prot) };
        if rc != 0 {
            return Err(CodeAllocError::Protect(io::Error::last_os_error()));
        }
        Ok(())
    }

    pub fn unmap(base: NonNull<u8>, size: usize) -> io::Result<()> {
        let rc = unsafe { libc::munmap(base.as_ptr() as *mut libc::c_void, size) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(not(unix))]
mod sys {
    use std::io;
    use std::ptr::NonNull;

    use crate::core::error::CodeAllocError;

    pub fn page_size() -> usize {
        4096
    }

    pub fn map(_size: usize) -> Result<NonNull<u8>, CodeAllocError> {
        Err(CodeAllocError::Unsupported)
    }

    pub fn protect(_base: NonNull<u8>, _size: usize, _executable: bool) -> Result<(), CodeAllocError> {
        Err(CodeAllocError::Unsupported)
    }

    pub fn unmap(_base: NonNull<u8>, _size: usize) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_install_is_aligned_and_readable() {
        let mut alloc = CodeAlloc::new(4096, 1 << 20);
        let first = alloc.install(&[0xC3]).unwrap();
        let second = alloc.install(&[0x90, 0xC3]).unwrap();

        assert_eq!(first.as_ptr() as usize % CODE_ALIGN, 0);
        assert_eq!(second.as_ptr() as usize % CODE_ALIGN, 0);
        assert_eq!(unsafe { *second.as_ptr().add(1) }, 0xC3);
        assert_eq!(alloc.bytes_used(), 3);
        assert_eq!(alloc.chunk_count(), 1);
    }

    #[test]
    fn test_large_code_gets_own_chunk() {
        let mut alloc = CodeAlloc::new(4096, 1 << 20);
        alloc.install(&[0xC3]).unwrap();
        let big = vec![0x90u8; 10_000];
        alloc.install(&big).unwrap();
        assert_eq!(alloc.chunk_count(), 2);
        assert!(alloc.bytes_mapped() >= 4096 + 10_000);
    }

    #[test]
    fn test_limit_reports_exhaustion() {
        let mut alloc = CodeAlloc::new(4096, 4096);
        let big = vec![0x90u8; 8192];
        let err = alloc.install(&big).unwrap_err();
        assert!(matches!(err, CodeAllocError::Exhausted { needed: 8192, .. }));
        assert_eq!(alloc.chunk_count(), 0);
    }
}
