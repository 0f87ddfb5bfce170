//! Simulated physical memory shared by the endpoints and the relayer.
//!
//! One arena of page-aligned memory with identity VA == PA translation, so a
//! TX/RX buffer address means the same thing on both sides. Endpoints
//! allocate [`PageSpan`]s from it; the relayer reads and writes the same
//! bytes when it consumes descriptors or fills RX buffers.

pub mod allocator;

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

pub use allocator::{PageAllocator, PAGE_SIZE};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MmError {
    #[error("out of memory allocating {pages} page(s)")]
    OutOfMemory { pages: u64 },
    #[error("address range {addr:#x}+{len:#x} outside the arena")]
    OutOfRange { addr: u64, len: u64 },
}

/// A contiguous page-aligned allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSpan {
    pub pa: u64,
    pub pages: u64,
}

impl PageSpan {
    pub fn bytes(&self) -> usize {
        (self.pages * PAGE_SIZE) as usize
    }

    pub fn end(&self) -> u64 {
        self.pa + self.pages * PAGE_SIZE
    }

    /// Address of the `n`th page of this span.
    pub fn page(&self, n: u64) -> u64 {
        self.pa + n * PAGE_SIZE
    }
}

struct Inner {
    base: u64,
    bytes: Vec<u8>,
    allocator: PageAllocator,
}

impl Inner {
    fn offset(&self, addr: u64, len: usize) -> Result<usize, MmError> {
        let err = MmError::OutOfRange {
            addr,
            len: len as u64,
        };
        let off = addr.checked_sub(self.base).ok_or(err)? as usize;
        match off.checked_add(len) {
            Some(end) if end <= self.bytes.len() => Ok(off),
            _ => Err(err),
        }
    }
}

/// Handle to the shared arena. Cloning is cheap; all clones see the same
/// memory.
#[derive(Clone)]
pub struct PhysMemory {
    inner: Arc<Mutex<Inner>>,
}

impl PhysMemory {
    pub fn new(base: u64, pages: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                base,
                bytes: vec![0; (pages * PAGE_SIZE) as usize],
                allocator: PageAllocator::new(base, pages * PAGE_SIZE),
            })),
        }
    }

    pub fn alloc(&self, pages: u64) -> Result<PageSpan, MmError> {
        self.alloc_aligned(pages, PAGE_SIZE)
    }

    pub fn alloc_aligned(&self, pages: u64, align: u64) -> Result<PageSpan, MmError> {
        let mut inner = self.inner.lock();
        let pa = inner
            .allocator
            .alloc_pages(pages, align)
            .ok_or(MmError::OutOfMemory { pages })?;
        // Fresh pages never carry a previous owner's contents.
        let off = inner.offset(pa, (pages * PAGE_SIZE) as usize)?;
        inner.bytes[off..off + (pages * PAGE_SIZE) as usize].fill(0);
        Ok(PageSpan { pa, pages })
    }

    pub fn free(&self, span: PageSpan) {
        self.inner.lock().allocator.free_pages(span.pa, span.pages);
    }

    /// Pages currently handed out and not yet freed.
    pub fn outstanding_pages(&self) -> u64 {
        self.inner.lock().allocator.allocated() / PAGE_SIZE
    }

    pub fn contains(&self, addr: u64, len: u64) -> bool {
        self.inner.lock().offset(addr, len as usize).is_ok()
    }

    pub fn write(&self, addr: u64, data: &[u8]) -> Result<(), MmError> {
        let mut inner = self.inner.lock();
        let off = inner.offset(addr, data.len())?;
        inner.bytes[off..off + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn read(&self, addr: u64, out: &mut [u8]) -> Result<(), MmError> {
        let inner = self.inner.lock();
        let off = inner.offset(addr, out.len())?;
        out.copy_from_slice(&inner.bytes[off..off + out.len()]);
        Ok(())
    }

    pub fn read_vec(&self, addr: u64, len: usize) -> Result<Vec<u8>, MmError> {
        let mut out = vec![0; len];
        self.read(addr, &mut out)?;
        Ok(out)
    }

    pub fn fill(&self, addr: u64, len: usize, byte: u8) -> Result<(), MmError> {
        let mut inner = self.inner.lock();
        let off = inner.offset(addr, len)?;
        inner.bytes[off..off + len].fill(byte);
        Ok(())
    }

    /// Run `f` over the bytes of `span` while holding the arena lock.
    pub fn with_span_mut<R>(
        &self,
        span: PageSpan,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, MmError> {
        let mut inner = self.inner.lock();
        let len = span.bytes();
        let off = inner.offset(span.pa, len)?;
        Ok(f(&mut inner.bytes[off..off + len]))
    }
}

impl core::fmt::Debug for PhysMemory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("PhysMemory")
            .field("base", &format_args!("{:#x}", inner.base))
            .field("size", &inner.bytes.len())
            .field("allocated", &inner.allocator.allocated())
            .finish()
    }
}
