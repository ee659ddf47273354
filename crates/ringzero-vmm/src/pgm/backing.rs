//! Host memory behind guest RAM: page allocation and chunk mappings.
//!
//! Guest RAM is carved out of fixed-size host slabs called *chunks*.
//! The host side owns the chunks; the runtime only maps them in and out
//! through the [`HostMemory`] trait. A [`ChunkMapping`] is one live
//! mapping of one chunk and is what TLB entries and mapping locks hold
//! on to.
//!
//! [`MmapHostMemory`] is the in-process host: every chunk is an anonymous
//! `mmap` region from `vm-memory`, kept in a pool for the lifetime of the
//! host so unmapping a chunk from the cache never loses guest data.
//!
//! # Fake host-physical addresses
//!
//! ```text
//!   HOST_PHYS_BASE + ((chunk * pages_per_chunk + index) << 12)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, info, trace, warn};
use vm_memory::{Bytes, MmapRegion, VolatileMemory};

use super::page::{AllocatedPage, ChunkId, PageId, NIL_CHUNK_ID, ZERO_PAGE_HC_PHYS};
use super::PgmError;
use crate::verified::pgm::{PAGE_SHIFT, PAGE_SIZE};

/// Base of the fake host-physical address space handed out by
/// [`MmapHostMemory`].
pub const HOST_PHYS_BASE: u64 = 0x1_0000_0000;

/// Default chunk size in pages (2 MiB chunks).
pub const DEFAULT_PAGES_PER_CHUNK: u32 = 512;

// ═══════════════════════════════════════════════════════════════════════
//  Host memory interface
// ═══════════════════════════════════════════════════════════════════════

/// The host-kernel side of guest RAM.
pub trait HostMemory: Send + Sync {
    /// Pages per chunk. Constant for the lifetime of the host.
    fn pages_per_chunk(&self) -> u32;

    /// Allocate one private page.
    fn allocate_page(&self) -> Result<AllocatedPage, PgmError>;

    /// Return a page obtained from [`allocate_page`](Self::allocate_page).
    fn free_page(&self, page: PageId);

    /// Host-physical address of an allocated page.
    fn hc_phys(&self, page: PageId) -> u64;

    /// Map a chunk into the runtime.
    fn map_chunk(&self, chunk: ChunkId) -> Result<Arc<ChunkMapping>, PgmError>;

    /// Notification that the runtime dropped its mapping of `chunk`.
    fn unmap_chunk(&self, chunk: ChunkId);

    /// The shared, never-written zero page.
    fn zero_page(&self) -> Arc<ChunkMapping>;
}

// ═══════════════════════════════════════════════════════════════════════
//  Chunk mapping
// ═══════════════════════════════════════════════════════════════════════

/// One live host mapping of a chunk.
#[derive(Debug)]
pub struct ChunkMapping {
    id: ChunkId,
    region: Arc<MmapRegion<()>>,
    hc_phys_base: u64,
}

impl ChunkMapping {
    pub fn new(id: ChunkId, region: Arc<MmapRegion<()>>, hc_phys_base: u64) -> Self {
        Self { id, region, hc_phys_base }
    }

    #[inline]
    pub fn id(&self) -> ChunkId {
        self.id
    }

    #[inline]
    pub fn is_zero_page(&self) -> bool {
        self.id == NIL_CHUNK_ID
    }

    /// Number of pages covered by this mapping.
    pub fn page_count(&self) -> u32 {
        (self.region.size() as u64 >> PAGE_SHIFT) as u32
    }

    /// Byte offset of page `index` inside the mapping.
    #[inline]
    pub fn page_offset(&self, index: u32) -> usize {
        (index as usize) << PAGE_SHIFT
    }

    /// Host-physical address of page `index`.
    #[inline]
    pub fn hc_phys(&self, index: u32) -> u64 {
        self.hc_phys_base + ((index as u64) << PAGE_SHIFT)
    }

    /// Host virtual address of `offset`. Only for identity checks and
    /// for handing to code that does its own volatile access.
    #[inline]
    pub fn host_ptr(&self, offset: usize) -> *mut u8 {
        self.region.as_ptr().wrapping_add(offset)
    }

    /// Copy `buf.len()` bytes out of the mapping.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), PgmError> {
        if buf.is_empty() {
            return Ok(());
        }
        let err = PgmError::HostAccess { chunk: self.id, offset };
        let slice = self.region.get_slice(offset, buf.len()).map_err(|_| err.clone())?;
        slice.read_slice(buf, 0).map_err(|_| err)
    }

    /// Copy `data` into the mapping. The zero page refuses writes.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<(), PgmError> {
        if data.is_empty() {
            return Ok(());
        }
        let err = PgmError::HostAccess { chunk: self.id, offset };
        if self.is_zero_page() {
            return Err(err);
        }
        let slice = self.region.get_slice(offset, data.len()).map_err(|_| err.clone())?;
        slice.write_slice(data, 0).map_err(|_| err)
    }

    /// Zero one full page.
    pub fn clear_page(&self, index: u32) -> Result<(), PgmError> {
        let err = PgmError::HostAccess { chunk: self.id, offset: self.page_offset(index) };
        let slice = self
            .region
            .get_slice(self.page_offset(index), PAGE_SIZE as usize)
            .map_err(|_| err.clone())?;
        slice.write_slice(&[0u8; PAGE_SIZE as usize], 0).map_err(|_| err)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  mmap-backed host
// ═══════════════════════════════════════════════════════════════════════

/// Configuration for [`MmapHostMemory`].
#[derive(Debug, Clone)]
pub struct HostMemoryConfig {
    /// Chunk size in pages. Must be a power of two.
    pub pages_per_chunk: u32,
    /// Page budget; `None` means unlimited.
    pub max_pages: Option<u64>,
}

impl Default for HostMemoryConfig {
    fn default() -> Self {
        Self {
            pages_per_chunk: DEFAULT_PAGES_PER_CHUNK,
            max_pages: None,
        }
    }
}

#[derive(Debug, Default)]
struct Pool {
    chunks: Vec<Arc<MmapRegion<()>>>,
    /// Next free page index in the last chunk.
    next_index: u32,
    /// Returned pages, reused before the last chunk is extended.
    free: Vec<PageId>,
    allocated: u64,
}

/// In-process host memory built on anonymous mmap regions.
#[derive(Debug)]
pub struct MmapHostMemory {
    config: HostMemoryConfig,
    pool: Mutex<Pool>,
    zero_page: Arc<ChunkMapping>,
    maps: AtomicU64,
    unmaps: AtomicU64,
}

impl MmapHostMemory {
    /// Create a host with no chunks allocated yet.
    ///
    /// # Errors
    ///
    /// Returns [`PgmError::OutOfHostMemory`] if the zero page cannot be
    /// allocated.
    pub fn new(config: HostMemoryConfig) -> Result<Self, PgmError> {
        debug_assert!(config.pages_per_chunk.is_power_of_two());
        let zero = MmapRegion::<()>::new(PAGE_SIZE as usize)
            .map_err(|_| PgmError::OutOfHostMemory { allocated: 0 })?;
        info!(
            "Host memory: {} pages per chunk, budget {:?} pages",
            config.pages_per_chunk, config.max_pages
        );
        Ok(Self {
            config,
            pool: Mutex::new(Pool::default()),
            zero_page: Arc::new(ChunkMapping::new(NIL_CHUNK_ID, Arc::new(zero), ZERO_PAGE_HC_PHYS)),
            maps: AtomicU64::new(0),
            unmaps: AtomicU64::new(0),
        })
    }

    /// Number of `map_chunk` calls served.
    pub fn map_calls(&self) -> u64 {
        self.maps.load(Ordering::Relaxed)
    }

    /// Number of `unmap_chunk` notifications received.
    pub fn unmap_calls(&self) -> u64 {
        self.unmaps.load(Ordering::Relaxed)
    }

    /// Pages currently handed out.
    pub fn allocated_pages(&self) -> u64 {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner).allocated
    }

    fn chunk_hc_phys(&self, chunk: ChunkId) -> u64 {
        HOST_PHYS_BASE + ((chunk as u64 * self.config.pages_per_chunk as u64) << PAGE_SHIFT)
    }
}

impl HostMemory for MmapHostMemory {
    fn pages_per_chunk(&self) -> u32 {
        self.config.pages_per_chunk
    }

    fn allocate_page(&self) -> Result<AllocatedPage, PgmError> {
        let mut pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        if self.config.max_pages.is_some_and(|max| pool.allocated >= max) {
            return Err(PgmError::OutOfHostMemory { allocated: pool.allocated });
        }
        if let Some(id) = pool.free.pop() {
            pool.allocated += 1;
            return Ok(AllocatedPage { id, hc_phys: self.hc_phys(id) });
        }
        if pool.chunks.is_empty() || pool.next_index == self.config.pages_per_chunk {
            let size = (self.config.pages_per_chunk as usize) << PAGE_SHIFT;
            let region = MmapRegion::<()>::new(size)
                .map_err(|_| PgmError::OutOfHostMemory { allocated: pool.allocated })?;
            pool.chunks.push(Arc::new(region));
            pool.next_index = 0;
            debug!("Allocated host chunk {} ({} bytes)", pool.chunks.len() - 1, size);
        }
        let id = PageId {
            chunk: (pool.chunks.len() - 1) as ChunkId,
            index: pool.next_index,
        };
        pool.next_index += 1;
        pool.allocated += 1;
        Ok(AllocatedPage { id, hc_phys: self.hc_phys(id) })
    }

    fn free_page(&self, page: PageId) {
        let mut pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(region) = pool.chunks.get(page.chunk as usize) else {
            warn!("Free of unknown page {:?}", page);
            return;
        };
        let offset = (page.index as usize) << PAGE_SHIFT;
        // Reused pages must read as zeros again.
        let cleared = region
            .get_slice(offset, PAGE_SIZE as usize)
            .and_then(|slice| slice.write_slice(&[0u8; PAGE_SIZE as usize], 0));
        if cleared.is_err() {
            warn!("Page {:?} could not be cleared, not reusing it", page);
            return;
        }
        debug_assert!(!pool.free.contains(&page), "double free of {page:?}");
        pool.free.push(page);
        pool.allocated = pool.allocated.saturating_sub(1);
        trace!("Freed host page {:?}", page);
    }

    fn hc_phys(&self, page: PageId) -> u64 {
        self.chunk_hc_phys(page.chunk) + ((page.index as u64) << PAGE_SHIFT)
    }

    fn map_chunk(&self, chunk: ChunkId) -> Result<Arc<ChunkMapping>, PgmError> {
        let region = {
            let pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
            pool.chunks
                .get(chunk as usize)
                .cloned()
                .ok_or(PgmError::ChunkMap { chunk })?
        };
        self.maps.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(ChunkMapping::new(chunk, region, self.chunk_hc_phys(chunk))))
    }

    fn unmap_chunk(&self, chunk: ChunkId) {
        self.unmaps.fetch_add(1, Ordering::Relaxed);
        debug!("Chunk {} unmapped", chunk);
    }

    fn zero_page(&self) -> Arc<ChunkMapping> {
        Arc::clone(&self.zero_page)
    }
}
