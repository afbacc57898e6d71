//! Executable memory allocation.
//!
//! Every compiled function owns one [`ExecutableBuffer`], mapped readable,
//! writable and executable so that loop edges can be patched in place while
//! the code is live. Buffers are handed out by a [`CodeAllocator`] that keeps
//! byte and buffer counts for the whole engine.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use pawn_core::ErrorCode;
use tracing::{debug, warn};

// =============================================================================
// Allocator
// =============================================================================

/// Executable memory counters.
#[derive(Debug, Default)]
struct AllocatorCounters {
    live_bytes: AtomicUsize,
    live_buffers: AtomicUsize,
    total_bytes: AtomicU64,
    total_buffers: AtomicU64,
}

/// Snapshot of executable memory usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodeCacheStats {
    /// Bytes currently mapped for code.
    pub live_bytes: usize,
    /// Buffers currently mapped.
    pub live_buffers: usize,
    /// Bytes ever mapped.
    pub total_bytes: u64,
    /// Buffers ever mapped.
    pub total_buffers: u64,
}

/// Hands out executable buffers, optionally under a byte budget.
#[derive(Debug, Clone, Default)]
pub struct CodeAllocator {
    counters: Arc<AllocatorCounters>,
    limit: Option<usize>,
}

impl CodeAllocator {
    /// An allocator with no budget.
    pub fn new() -> Self {
        Self::default()
    }

    /// An allocator that refuses to map more than `limit` live bytes.
    pub fn with_limit(limit: usize) -> Self {
        CodeAllocator {
            counters: Arc::default(),
            limit: Some(limit),
        }
    }

    /// Map a zeroed executable buffer of exactly `len` bytes.
    pub fn allocate(&self, len: usize) -> Result<ExecutableBuffer, ErrorCode> {
        if len == 0 {
            return Err(ErrorCode::OutOfMemory);
        }
        if let Some(limit) = self.limit {
            let live = self.counters.live_bytes.load(Ordering::Relaxed);
            if live.saturating_add(len) > limit {
                warn!(len, live, limit, "executable memory budget exhausted");
                return Err(ErrorCode::OutOfMemory);
            }
        }

        let ptr = alloc_executable_region(len)?;
        self.counters.live_bytes.fetch_add(len, Ordering::Relaxed);
        self.counters.live_buffers.fetch_add(1, Ordering::Relaxed);
        self.counters
            .total_bytes
            .fetch_add(len as u64, Ordering::Relaxed);
        self.counters.total_buffers.fetch_add(1, Ordering::Relaxed);

        Ok(ExecutableBuffer {
            ptr,
            len,
            counters: Arc::clone(&self.counters),
        })
    }

    /// Current usage.
    pub fn stats(&self) -> CodeCacheStats {
        CodeCacheStats {
            live_bytes: self.counters.live_bytes.load(Ordering::Relaxed),
            live_buffers: self.counters.live_buffers.load(Ordering::Relaxed),
            total_bytes: self.counters.total_bytes.load(Ordering::Relaxed),
            total_buffers: self.counters.total_buffers.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Executable Buffer
// =============================================================================

/// An owned RWX mapping.
#[derive(Debug)]
pub struct ExecutableBuffer {
    ptr: NonNull<u8>,
    len: usize,
    counters: Arc<AllocatorCounters>,
}

// SAFETY: the mapping is plain memory owned by this value; concurrent
// writers coordinate through the engine lock and atomic stores.
unsafe impl Send for ExecutableBuffer {}
unsafe impl Sync for ExecutableBuffer {}

impl ExecutableBuffer {
    /// Base address.
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Size in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false; empty buffers are never mapped.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Mutable view for initial code emission.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: the mapping is `len` bytes and uniquely borrowed.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Read-only view.
    ///
    /// Loop-edge fields may change concurrently; callers that compare code
    /// must hold the lock that serializes patching.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the mapping is `len` bytes and lives as long as `self`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Whether `addr` falls inside this buffer.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        let base = self.ptr.as_ptr() as usize;
        addr >= base && addr < base + self.len
    }
}

impl Drop for ExecutableBuffer {
    fn drop(&mut self) {
        self.counters
            .live_bytes
            .fetch_sub(self.len, Ordering::Relaxed);
        self.counters.live_buffers.fetch_sub(1, Ordering::Relaxed);
        if let Err(code) = free_executable_region(self.ptr, self.len) {
            warn!(len = self.len, %code, "failed to unmap code buffer");
        }
    }
}

// =============================================================================
// Platform mapping
// =============================================================================

#[cfg(all(unix, not(target_os = "macos")))]
fn alloc_executable_region(len: usize) -> Result<NonNull<u8>, ErrorCode> {
    // SAFETY: anonymous private mapping with no address hint.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_ANON | libc::MAP_PRIVATE,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        debug!(len, error = %std::io::Error::last_os_error(), "mmap failed");
        return Err(ErrorCode::OutOfMemory);
    }
    NonNull::new(ptr as *mut u8).ok_or(ErrorCode::OutOfMemory)
}

#[cfg(target_os = "macos")]
fn alloc_executable_region(len: usize) -> Result<NonNull<u8>, ErrorCode> {
    // SAFETY: anonymous private mapping with no address hint.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_JIT,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        debug!(len, error = %std::io::Error::last_os_error(), "mmap(MAP_JIT) failed");
        return Err(ErrorCode::OutOfMemory);
    }
    NonNull::new(ptr as *mut u8).ok_or(ErrorCode::OutOfMemory)
}

#[cfg(unix)]
fn free_executable_region(ptr: NonNull<u8>, len: usize) -> Result<(), ErrorCode> {
    // SAFETY: `ptr`/`len` describe a mapping created by `alloc_executable_region`.
    let rc = unsafe { libc::munmap(ptr.as_ptr() as *mut libc::c_void, len) };
    if rc != 0 {
        return Err(ErrorCode::Fatal);
    }
    Ok(())
}

#[cfg(not(unix))]
fn alloc_executable_region(_len: usize) -> Result<NonNull<u8>, ErrorCode> {
    Err(ErrorCode::OutOfMemory)
}

#[cfg(not(unix))]
fn free_executable_region(_ptr: NonNull<u8>, _len: usize) -> Result<(), ErrorCode> {
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_track() {
        let alloc = CodeAllocator::new();
        let mut buf = alloc.allocate(64).unwrap();
        assert_eq!(buf.len(), 64);
        assert!(buf.as_slice().iter().all(|&b| b == 0));
        buf.as_mut_slice()[0] = 0xC3;
        assert_eq!(buf.as_slice()[0], 0xC3);
        assert!(buf.contains(buf.as_ptr() as usize + 63));
        assert!(!buf.contains(buf.as_ptr() as usize + 64));

        let stats = alloc.stats();
        assert_eq!(stats.live_bytes, 64);
        assert_eq!(stats.live_buffers, 1);
        drop(buf);
        let stats = alloc.stats();
        assert_eq!(stats.live_bytes, 0);
        assert_eq!(stats.total_buffers, 1);
    }

    #[test]
    fn test_budget() {
        let alloc = CodeAllocator::with_limit(100);
        let _a = alloc.allocate(80).unwrap();
        assert_eq!(alloc.allocate(40).unwrap_err(), ErrorCode::OutOfMemory);
        assert_eq!(alloc.allocate(0).unwrap_err(), ErrorCode::OutOfMemory);
    }
}
