//! Executable memory management using mmap.
//!
//! This module provides a safe abstraction over OS-level memory mapping
//! for code that is written by the runtime and then executed.

use std::ptr::NonNull;

/// Error type for memory operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    AllocationFailed,
    ProtectionFailed,
    InvalidSize,
}

impl std::fmt::Display for MemoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryError::AllocationFailed => write!(f, "memory allocation failed"),
            MemoryError::ProtectionFailed => write!(f, "memory protection change failed"),
            MemoryError::InvalidSize => write!(f, "invalid memory size"),
        }
    }
}

impl std::error::Error for MemoryError {}

/// Access rights of a block of code memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    ReadWrite,
    ReadExecute,
    /// Code patched in place while other code in the same pages runs
    ReadWriteExecute,
}

impl Protection {
    #[cfg(unix)]
    fn flags(self) -> libc::c_int {
        match self {
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            Protection::ReadExecute => libc::PROT_READ | libc::PROT_EXEC,
            Protection::ReadWriteExecute => libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        }
    }

    pub fn is_writable(self) -> bool {
        self != Protection::ReadExecute
    }

    pub fn is_executable(self) -> bool {
        self != Protection::ReadWrite
    }
}

/// A page-aligned block of code memory allocated via mmap.
pub struct ExecutableMemory {
    ptr: NonNull<u8>,
    size: usize,
    protection: Protection,
}

impl ExecutableMemory {
    /// Allocate a new block of at least `size` bytes.
    pub fn new(size: usize, protection: Protection) -> Result<Self, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidSize);
        }

        // Round up to page size
        let page_size = Self::page_size();
        let aligned_size = (size + page_size - 1) & !(page_size - 1);

        let ptr = Self::mmap_alloc(aligned_size, protection)?;

        Ok(Self {
            ptr,
            size: aligned_size,
            protection,
        })
    }

    /// Get the page size for the current system.
    fn page_size() -> usize {
        #[cfg(unix)]
        {
            unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
        }
        #[cfg(not(unix))]
        {
            4096
        }
    }

    #[cfg(unix)]
    fn mmap_alloc(size: usize, protection: Protection) -> Result<NonNull<u8>, MemoryError> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                protection.flags(),
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(MemoryError::AllocationFailed);
        }

        NonNull::new(ptr as *mut u8).ok_or(MemoryError::AllocationFailed)
    }

    #[cfg(not(unix))]
    fn mmap_alloc(size: usize, _protection: Protection) -> Result<NonNull<u8>, MemoryError> {
        // Fallback for non-Unix systems: use regular allocation
        // Note: This won't actually be executable on most systems
        let layout = std::alloc::Layout::from_size_align(size, Self::page_size())
            .map_err(|_| MemoryError::InvalidSize)?;
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or(MemoryError::AllocationFailed)
    }

    /// Get a pointer to the memory.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Get the size of the allocated memory.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn protection(&self) -> Protection {
        self.protection
    }

    /// Change the access rights of the whole block.
    #[cfg(unix)]
    pub fn protect(&mut self, protection: Protection) -> Result<(), MemoryError> {
        if self.protection == protection {
            return Ok(());
        }

        let result = unsafe {
            libc::mprotect(
                self.ptr.as_ptr() as *mut libc::c_void,
                self.size,
                protection.flags(),
            )
        };

        if result != 0 {
            return Err(MemoryError::ProtectionFailed);
        }

        self.protection = protection;
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn protect(&mut self, protection: Protection) -> Result<(), MemoryError> {
        self.protection = protection;
        Ok(())
    }

    /// The block as instruction words. Fails unless the block is writable.
    pub fn words_mut(&mut self) -> Result<&mut [u32], MemoryError> {
        if !self.protection.is_writable() {
            return Err(MemoryError::ProtectionFailed);
        }
        // SAFETY: the mapping is page aligned, `size` bytes long, writable,
        // and exclusively borrowed through `self`.
        Ok(unsafe {
            std::slice::from_raw_parts_mut(self.ptr.as_ptr() as *mut u32, self.size / 4)
        })
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            unsafe {
                libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
            }
        }
        #[cfg(not(unix))]
        {
            if let Ok(layout) = std::alloc::Layout::from_size_align(self.size, Self::page_size()) {
                unsafe {
                    std::alloc::dealloc(self.ptr.as_ptr(), layout);
                }
            }
        }
    }
}

// ExecutableMemory owns its mapping; mutation requires &mut self.
unsafe impl Send for ExecutableMemory {}
unsafe impl Sync for ExecutableMemory {}
