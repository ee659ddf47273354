//! Guest-physical memory engine (PGM).
//!
//! Translates guest-physical addresses to host memory and performs guest
//! memory accesses on behalf of device emulation and the instruction
//! emulator.
//!
//! # Architecture
//!
//! ```text
//!   phys_read / phys_write            phys_to_host_ptr / phys_to_host_phys
//!            │                                   │
//!            ▼                                   │
//!   ┌──────────────────┐   miss   ┌────────────┐ │
//!   │ PhysTlb (per EMT)├─────────►│ RAM ranges │◄┘
//!   └────────┬─────────┘          └─────┬──────┘
//!            │ hit                      │ page → chunk id
//!            ▼                          ▼
//!   handlers / MMIO / memcpy    ┌────────────────┐   map/unmap  ┌────────────┐
//!                               │  ChunkCache    ├─────────────►│ HostMemory │
//!                               └────────────────┘              └────────────┘
//! ```
//!
//! | Module      | Contents                                            |
//! |-------------|-----------------------------------------------------|
//! | [`page`]    | Page descriptor and state machine                   |
//! | [`backing`] | Host memory trait, chunk mappings, mmap host        |
//! | [`chunk`]   | Chunk mapping cache with ageing and eviction        |
//! | [`ram`]     | RAM range list                                      |
//! | [`tlb`]     | Per-EMT physical access TLB                         |
//! | [`handler`] | Physical and virtual access handler registries      |
//! | [`phys`]    | Read/write dispatcher and host pointer resolution   |
//!
//! # Locking
//!
//! All descriptor, range, chunk and handler state sits behind one
//! VM-wide mutex. Device callbacks (access handlers, MMIO) are always
//! invoked after the lock is released, so they may call back into the
//! PGM freely. TLB hits on current-generation entries take no lock.

pub mod backing;
pub mod chunk;
pub mod handler;
pub mod page;
pub mod phys;
pub mod ram;
pub mod tlb;

#[cfg(test)]
pub(crate) mod testutil;

pub use backing::{ChunkMapping, HostMemory, HostMemoryConfig, MmapHostMemory};
pub use chunk::ChunkStats;
pub use handler::{
    AccessBuf, AccessHandler, AccessType, GuestPaging, HandlerAccess, HandlerAction, HandlerKind,
    HostSpan,
};
pub use page::{AllocatedPage, ChunkId, PageDesc, PageFlags, PageId, PageState};
pub use phys::{MmioError, MmioFallback, PageMappingLock};
pub use ram::{RamRangeInfo, RamRangeKind};
pub use tlb::{PhysTlb, PhysTlbEntry};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};
use thiserror::Error;

use chunk::ChunkCache;
use handler::{IntervalMap, VirtHandlers};
use page::WritableTransition;
use ram::{RamRange, RamRanges};
use crate::verified::pgm::{is_page_aligned, page_base, PAGE_SHIFT, PAGE_SIZE};

// ═══════════════════════════════════════════════════════════════════════
//  Configuration
// ═══════════════════════════════════════════════════════════════════════

/// Default number of physical TLB entries per EMT.
pub const DEFAULT_PHYS_TLB_ENTRIES: usize = 64;

/// Default number of chunk TLB entries.
pub const DEFAULT_CHUNK_TLB_ENTRIES: usize = 32;

/// Default soft limit on simultaneously mapped chunks.
pub const DEFAULT_MAX_MAPPED_CHUNKS: usize = 256;

/// Tunables for the memory engine.
#[derive(Debug, Clone)]
pub struct PgmConfig {
    /// Physical TLB slots per EMT (power of two).
    pub phys_tlb_entries: usize,
    /// Chunk TLB slots (power of two).
    pub chunk_tlb_entries: usize,
    /// Soft limit on mapped chunks before eviction kicks in.
    pub max_mapped_chunks: usize,
    /// Map past the limit when nothing can be evicted instead of failing.
    pub allow_chunk_cache_growth: bool,
}

impl Default for PgmConfig {
    fn default() -> Self {
        Self {
            phys_tlb_entries: DEFAULT_PHYS_TLB_ENTRIES,
            chunk_tlb_entries: DEFAULT_CHUNK_TLB_ENTRIES,
            max_mapped_chunks: DEFAULT_MAX_MAPPED_CHUNKS,
            allow_chunk_cache_growth: true,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Error type
// ═══════════════════════════════════════════════════════════════════════

/// Errors surfaced by the pointer-resolution, raw-access and setup APIs.
///
/// [`Pgm::phys_read`] and [`Pgm::phys_write`] never return these.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PgmError {
    #[error("Guest-physical address {gc_phys:#x} is not in any RAM range")]
    InvalidGCPhysicalAddress { gc_phys: u64 },

    #[error("Page at {gc_phys:#x} is reserved, MMIO or unbacked")]
    PageReserved { gc_phys: u64 },

    #[error("Access of {len} bytes at {gc_phys:#x} leaves its host chunk")]
    RangeCrossesChunkBoundary { gc_phys: u64, len: usize },

    #[error("Host memory exhausted after {allocated} pages")]
    OutOfHostMemory { allocated: u64 },

    #[error("Failed to map chunk {chunk}")]
    ChunkMap { chunk: ChunkId },

    #[error("Chunk cache full ({mapped} mapped), nothing evictable for chunk {chunk}")]
    ChunkCacheFull { chunk: ChunkId, mapped: usize },

    #[error("Invalid guest-physical range {gc_phys:#x} + {size:#x}")]
    InvalidRange { gc_phys: u64, size: u64 },

    #[error("Range {gc_phys:#x} + {size:#x} overlaps existing range '{existing}'")]
    RangeConflict { gc_phys: u64, size: u64, existing: String },

    #[error("Access handler range {first:#x}..={last:#x} overlaps an existing handler")]
    HandlerConflict { first: u64, last: u64 },

    #[error("No access handler registered at {address:#x}")]
    HandlerNotFound { address: u64 },

    #[error("No guest paging available to translate {gc_ptr:#x}")]
    GuestPagingUnavailable { gc_ptr: u64 },

    #[error("Host access to chunk {chunk} at offset {offset:#x} failed")]
    HostAccess { chunk: ChunkId, offset: usize },

    #[error("Mapping of {gc_phys:#x} is read-only")]
    ReadOnlyMapping { gc_phys: u64 },
}

// ═══════════════════════════════════════════════════════════════════════
//  Statistics
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct PgmCounters {
    page_allocations: AtomicU64,
    unmonitored: AtomicU64,
    unassigned_reads: AtomicU64,
    dropped_writes: AtomicU64,
    handler_calls: AtomicU64,
    mmio_fallbacks: AtomicU64,
    range_growths: AtomicU64,
}

/// Snapshot of memory-engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PgmStats {
    pub page_allocations: u64,
    /// WriteMonitored pages turned back into Allocated by a write.
    pub unmonitored: u64,
    /// Read bytes served from unassigned or unbacked space.
    pub unassigned_reads: u64,
    /// Written bytes dropped (unassigned, reserved, ROM).
    pub dropped_writes: u64,
    pub handler_calls: u64,
    pub mmio_fallbacks: u64,
    pub range_growths: u64,
    pub mapped_chunks: usize,
    pub chunks: ChunkStats,
}

// ═══════════════════════════════════════════════════════════════════════
//  Engine
// ═══════════════════════════════════════════════════════════════════════

/// State behind the VM-wide PGM lock.
#[derive(Debug)]
pub(crate) struct PgmState {
    pub(crate) ranges: RamRanges,
    pub(crate) chunks: ChunkCache,
    pub(crate) phys_handlers: IntervalMap,
    pub(crate) virt_handlers: VirtHandlers,
}

/// The guest-physical memory engine of one VM.
pub struct Pgm {
    config: PgmConfig,
    host: Arc<dyn HostMemory>,
    state: Mutex<PgmState>,
    generation: AtomicU64,
    shared_tlb: Mutex<PhysTlb>,
    paging: Option<Arc<dyn GuestPaging>>,
    mmio: Option<Arc<dyn MmioFallback>>,
    counters: PgmCounters,
}

impl std::fmt::Debug for Pgm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pgm")
            .field("config", &self.config)
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .field("paging", &self.paging.is_some())
            .field("mmio", &self.mmio.is_some())
            .finish_non_exhaustive()
    }
}

impl Pgm {
    /// Create an engine with no RAM ranges.
    pub fn new(config: PgmConfig, host: Arc<dyn HostMemory>) -> Self {
        info!(
            "PGM: {} phys TLB entries, {} chunk TLB entries, {} mapped chunks max, {} pages per chunk",
            config.phys_tlb_entries,
            config.chunk_tlb_entries,
            config.max_mapped_chunks,
            host.pages_per_chunk()
        );
        let state = PgmState {
            ranges: RamRanges::default(),
            chunks: ChunkCache::new(&config),
            phys_handlers: IntervalMap::default(),
            virt_handlers: VirtHandlers::default(),
        };
        Self {
            shared_tlb: Mutex::new(PhysTlb::new(config.phys_tlb_entries)),
            config,
            host,
            state: Mutex::new(state),
            generation: AtomicU64::new(1),
            paging: None,
            mmio: None,
            counters: PgmCounters::default(),
        }
    }

    /// Attach the guest paging used to resolve virtual handlers.
    pub fn with_guest_paging(mut self, paging: Arc<dyn GuestPaging>) -> Self {
        self.paging = Some(paging);
        self
    }

    /// Attach the legacy MMIO fallback for MMIO pages.
    pub fn with_mmio_fallback(mut self, mmio: Arc<dyn MmioFallback>) -> Self {
        self.mmio = Some(mmio);
        self
    }

    pub fn config(&self) -> &PgmConfig {
        &self.config
    }

    pub fn host_memory(&self) -> &Arc<dyn HostMemory> {
        &self.host
    }

    /// Fresh TLB for an EMT.
    pub fn new_tlb(&self) -> PhysTlb {
        PhysTlb::new(self.config.phys_tlb_entries)
    }

    /// Current translation generation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Invalidate every TLB entry in every EMT. Called with the lock held.
    pub(crate) fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn locked(&self) -> MutexGuard<'_, PgmState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn shared_tlb(&self) -> MutexGuard<'_, PhysTlb> {
        self.shared_tlb.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn mmio(&self) -> Option<&Arc<dyn MmioFallback>> {
        self.mmio.as_ref()
    }

    // ─── Ranges ──────────────────────────────────────────────────

    /// Register a guest-physical range.
    ///
    /// RAM and MMIO pages start in the Zero state; dynamic RAM starts
    /// unbacked; ROM and MMIO2 pages are allocated up front.
    ///
    /// # Errors
    ///
    /// - [`PgmError::InvalidRange`] for empty, unaligned or wrapping ranges.
    /// - [`PgmError::RangeConflict`] if it overlaps an existing range.
    /// - Host allocation failures for preallocated kinds.
    pub fn register_ram_range(
        &self,
        gc_phys: u64,
        size: u64,
        kind: RamRangeKind,
        desc: &str,
    ) -> Result<(), PgmError> {
        let invalid = PgmError::InvalidRange { gc_phys, size };
        if size == 0 || !is_page_aligned(gc_phys) || !is_page_aligned(size) {
            return Err(invalid);
        }
        let last = gc_phys.checked_add(size - 1).ok_or(invalid)?;
        {
            let st = self.locked();
            if let Some(existing) = st.ranges.overlapping(gc_phys, last) {
                return Err(PgmError::RangeConflict {
                    gc_phys,
                    size,
                    existing: existing.desc.clone(),
                });
            }
        }

        let count = (size >> PAGE_SHIFT) as usize;
        let flags = kind.page_flags();
        let pages = match kind {
            RamRangeKind::DynamicRam => vec![PageDesc::unbacked(); count],
            k if k.preallocated() => {
                let mut pages = Vec::with_capacity(count);
                for _ in 0..count {
                    match self.host.allocate_page() {
                        Ok(page) => pages.push(PageDesc::allocated(page, flags)),
                        Err(e) => {
                            self.free_pages(&pages);
                            return Err(e);
                        }
                    }
                }
                self.counters.page_allocations.fetch_add(count as u64, Ordering::Relaxed);
                pages
            }
            _ => vec![PageDesc::zero(flags); count],
        };

        let mut st = self.locked();
        if let Some(existing) = st.ranges.overlapping(gc_phys, last) {
            let err = PgmError::RangeConflict { gc_phys, size, existing: existing.desc.clone() };
            drop(st);
            self.free_pages(&pages);
            return Err(err);
        }
        st.ranges.insert(RamRange { gc_phys, last, kind, desc: desc.to_string(), pages });
        self.bump_generation();
        info!("RAM range '{}' {:?} at {:#x}..={:#x} ({} pages)", desc, kind, gc_phys, last, count);
        Ok(())
    }

    fn free_pages(&self, pages: &[PageDesc]) {
        pages.iter().filter_map(|p| p.page_id).for_each(|id| self.host.free_page(id));
    }

    /// Registered ranges in address order.
    pub fn ram_ranges(&self) -> Vec<RamRangeInfo> {
        self.locked().ranges.iter().map(RamRangeInfo::from).collect()
    }

    /// Snapshot of the descriptor of the page holding `gc_phys`.
    pub fn page_info(&self, gc_phys: u64) -> Result<PageDesc, PgmError> {
        self.locked()
            .ranges
            .page(gc_phys)
            .copied()
            .ok_or(PgmError::InvalidGCPhysicalAddress { gc_phys })
    }

    // ─── Page state machine ──────────────────────────────────────

    /// Make the page holding `gc_phys` privately writable.
    ///
    /// Idempotent: an Allocated page is left untouched.
    ///
    /// # Errors
    ///
    /// - [`PgmError::InvalidGCPhysicalAddress`] outside every range.
    /// - [`PgmError::PageReserved`] for MMIO, reserved or unbacked pages.
    /// - Host allocation or chunk mapping failures.
    pub fn make_writable(&self, gc_phys: u64) -> Result<(), PgmError> {
        let mut st = self.locked();
        if self.make_writable_locked(&mut st, gc_phys)? {
            self.bump_generation();
        }
        Ok(())
    }

    /// Lock-held body of [`make_writable`](Self::make_writable). Returns
    /// whether the descriptor changed; the caller bumps the generation.
    pub(crate) fn make_writable_locked(&self, st: &mut PgmState, gc_phys: u64) -> Result<bool, PgmError> {
        let invalid = PgmError::InvalidGCPhysicalAddress { gc_phys };
        let transition = st.ranges.page_mut(gc_phys).ok_or(invalid.clone())?.writable_transition(gc_phys)?;
        let copy_from = match transition {
            WritableTransition::AlreadyWritable => return Ok(false),
            WritableTransition::Unmonitored => {
                self.counters.unmonitored.fetch_add(1, Ordering::Relaxed);
                return Ok(true);
            }
            WritableTransition::Allocate { copy_from } => copy_from,
        };

        let new = self.host.allocate_page()?;
        let filled = self.fill_new_page(st, new, copy_from).and_then(|()| {
            let desc = st.ranges.page_mut(gc_phys).ok_or(invalid)?;
            desc.install(new);
            Ok(())
        });
        if let Err(e) = filled {
            self.host.free_page(new.id);
            return Err(e);
        }
        self.counters.page_allocations.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Page {:#x} now private ({:?} -> chunk {} index {})",
            page_base(gc_phys),
            copy_from,
            new.id.chunk,
            new.id.index
        );
        Ok(true)
    }

    /// Copy the template into (or zero) a freshly allocated page.
    fn fill_new_page(&self, st: &mut PgmState, new: AllocatedPage, copy_from: Option<PageId>) -> Result<(), PgmError> {
        let dst = st.chunks.lookup(new.id.chunk, self.host.as_ref())?;
        match copy_from {
            Some(src_id) => {
                let src = st.chunks.lookup(src_id.chunk, self.host.as_ref())?;
                let mut buf = vec![0u8; PAGE_SIZE as usize];
                src.read(src.page_offset(src_id.index), &mut buf)?;
                dst.write(dst.page_offset(new.id.index), &buf)
            }
            None => dst.clear_page(new.id.index),
        }
    }

    /// Turn the page holding `gc_phys` into a Shared page backed by the
    /// template `page`. Used by the page-sharing allocator; a private
    /// page it replaces goes back to the host.
    pub fn share_page(&self, gc_phys: u64, page: PageId) -> Result<(), PgmError> {
        let hc_phys = self.host.hc_phys(page);
        let mut st = self.locked();
        let desc = st
            .ranges
            .page_mut(gc_phys)
            .ok_or(PgmError::InvalidGCPhysicalAddress { gc_phys })?;
        if desc.flags.intersects(PageFlags::MMIO | PageFlags::ROM | PageFlags::RESERVED | PageFlags::MMIO2)
            || desc.locks != 0
        {
            return Err(PgmError::PageReserved { gc_phys });
        }
        let private = matches!(desc.state, PageState::Allocated | PageState::WriteMonitored);
        let old = desc.page_id.replace(page).filter(|&old| private && old != page);
        desc.state = PageState::Shared;
        desc.hc_phys = hc_phys;
        self.bump_generation();
        if let Some(old) = old {
            self.host.free_page(old);
            debug!("Page {:#x} shared, private page {:?} released", page_base(gc_phys), old);
        }
        Ok(())
    }

    /// Arm write monitoring on every Allocated RAM page in the range.
    /// Returns the number of pages armed.
    pub fn write_monitor_range(&self, gc_phys: u64, size: u64) -> Result<usize, PgmError> {
        let armed = self.for_each_page(gc_phys, size, |desc| {
            let plain = !desc.flags.intersects(PageFlags::MMIO | PageFlags::MMIO2 | PageFlags::ROM);
            if plain && desc.state == PageState::Allocated {
                desc.state = PageState::WriteMonitored;
                desc.written = false;
                true
            } else {
                false
            }
        })?;
        debug!("Write monitoring armed on {} pages at {:#x}", armed.len(), gc_phys);
        Ok(armed.len())
    }

    /// Collect and clear the `written` flag of every page in the range.
    /// Returns the page-aligned addresses that were written.
    pub fn collect_written(&self, gc_phys: u64, size: u64) -> Result<Vec<u64>, PgmError> {
        self.for_each_page(gc_phys, size, |desc| std::mem::take(&mut desc.written))
    }

    fn for_each_page<F>(&self, gc_phys: u64, size: u64, mut f: F) -> Result<Vec<u64>, PgmError>
    where
        F: FnMut(&mut PageDesc) -> bool,
    {
        if size == 0 {
            return Ok(Vec::new());
        }
        let last = gc_phys
            .checked_add(size - 1)
            .ok_or(PgmError::InvalidRange { gc_phys, size })?;
        let mut st = self.locked();
        let mut hits = Vec::new();
        let mut page = page_base(gc_phys);
        while page <= last {
            let desc = st
                .ranges
                .page_mut(page)
                .ok_or(PgmError::InvalidGCPhysicalAddress { gc_phys: page })?;
            if f(desc) {
                hits.push(page);
            }
            page += PAGE_SIZE;
        }
        self.bump_generation();
        Ok(hits)
    }

    // ─── Dynamic growth ──────────────────────────────────────────

    /// Back the chunk-sized window of a dynamic range around `gc_phys`.
    /// Returns the number of pages that gained backing.
    ///
    /// # Errors
    ///
    /// - [`PgmError::InvalidGCPhysicalAddress`] outside every range.
    /// - [`PgmError::InvalidRange`] if the range is not dynamic.
    /// - [`PgmError::OutOfHostMemory`] if not even one page could be
    ///   allocated.
    pub fn grow_ram_range(&self, gc_phys: u64) -> Result<usize, PgmError> {
        let per_chunk = self.host.pages_per_chunk().max(1) as usize;
        let mut st = self.locked();
        let ri = st
            .ranges
            .find(gc_phys)
            .ok_or(PgmError::InvalidGCPhysicalAddress { gc_phys })?;
        let (start, end) = {
            let r = st.ranges.get(ri);
            if r.kind != RamRangeKind::DynamicRam {
                return Err(PgmError::InvalidRange { gc_phys: r.gc_phys, size: r.size() });
            }
            let pi = r.page_index(gc_phys);
            let start = pi / per_chunk * per_chunk;
            (start, (start + per_chunk).min(r.pages.len()))
        };

        let mut grown = 0;
        for pi in start..end {
            if st.ranges.get(ri).pages[pi].is_backed() {
                continue;
            }
            let page = match self.host.allocate_page() {
                Ok(page) => page,
                Err(e) if grown == 0 => return Err(e),
                Err(e) => {
                    warn!("Dynamic range growth stopped early at page {}: {}", pi, e);
                    break;
                }
            };
            let cleared = st
                .chunks
                .lookup(page.id.chunk, self.host.as_ref())
                .and_then(|mapping| mapping.clear_page(page.id.index));
            if let Err(e) = cleared {
                self.host.free_page(page.id);
                if grown == 0 {
                    return Err(e);
                }
                warn!("Dynamic range growth stopped early at page {}: {}", pi, e);
                break;
            }
            st.ranges.get_mut(ri).pages[pi] = PageDesc::allocated(page, PageFlags::empty());
            grown += 1;
        }
        if grown > 0 {
            self.bump_generation();
            self.counters.range_growths.fetch_add(1, Ordering::Relaxed);
            self.counters.page_allocations.fetch_add(grown as u64, Ordering::Relaxed);
        }
        debug!("Grew dynamic range at {:#x} by {} pages", gc_phys, grown);
        Ok(grown)
    }

    // ─── Chunks ──────────────────────────────────────────────────

    /// Run one chunk ageing sweep now.
    pub fn age_chunks(&self) {
        self.locked().chunks.age();
    }

    /// Whether `chunk` is currently mapped by the cache.
    pub fn is_chunk_mapped(&self, chunk: ChunkId) -> bool {
        self.locked().chunks.is_mapped(chunk)
    }

    /// Outstanding mapping references on `chunk`.
    pub fn chunk_refs(&self, chunk: ChunkId) -> Option<u32> {
        self.locked().chunks.refs(chunk)
    }

    /// Counter snapshot.
    pub fn stats(&self) -> PgmStats {
        let st = self.locked();
        let c = &self.counters;
        PgmStats {
            page_allocations: c.page_allocations.load(Ordering::Relaxed),
            unmonitored: c.unmonitored.load(Ordering::Relaxed),
            unassigned_reads: c.unassigned_reads.load(Ordering::Relaxed),
            dropped_writes: c.dropped_writes.load(Ordering::Relaxed),
            handler_calls: c.handler_calls.load(Ordering::Relaxed),
            mmio_fallbacks: c.mmio_fallbacks.load(Ordering::Relaxed),
            range_growths: c.range_growths.load(Ordering::Relaxed),
            mapped_chunks: st.chunks.len(),
            chunks: st.chunks.stats(),
        }
    }

    pub(crate) fn note_unassigned_read(&self, bytes: usize) {
        self.counters.unassigned_reads.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn note_dropped_write(&self, bytes: usize) {
        self.counters.dropped_writes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn note_handler_call(&self) {
        self.counters.handler_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_mmio_fallback(&self) {
        self.counters.mmio_fallbacks.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pgm::testutil::{host, pgm_with_ram};

    #[test]
    fn overlapping_ranges_are_rejected() {
        let (pgm, _host) = pgm_with_ram(0, 4, 4);
        let err = pgm
            .register_ram_range(0x3000, 0x2000, RamRangeKind::Ram, "overlap")
            .unwrap_err();
        assert_eq!(
            err,
            PgmError::RangeConflict { gc_phys: 0x3000, size: 0x2000, existing: String::from("ram") }
        );
        assert!(pgm.register_ram_range(0x4000, 0x1000, RamRangeKind::Ram, "next").is_ok());
        assert_eq!(pgm.ram_ranges().len(), 2);
    }

    #[test]
    fn unaligned_or_empty_ranges_are_invalid() {
        let (pgm, _host) = pgm_with_ram(0, 1, 4);
        assert!(matches!(
            pgm.register_ram_range(0x10_0800, 0x1000, RamRangeKind::Ram, "x"),
            Err(PgmError::InvalidRange { .. })
        ));
        assert!(matches!(
            pgm.register_ram_range(0x10_0000, 0, RamRangeKind::Ram, "x"),
            Err(PgmError::InvalidRange { .. })
        ));
        assert!(matches!(
            pgm.register_ram_range(u64::MAX - 0xfff, 0x2000, RamRangeKind::Ram, "x"),
            Err(PgmError::InvalidRange { .. })
        ));
    }

    #[test]
    fn make_writable_allocates_zero_page_once() {
        let (pgm, host) = pgm_with_ram(0, 2, 4);
        assert_eq!(pgm.page_info(0x1000).unwrap().state, PageState::Zero);
        pgm.make_writable(0x1234).unwrap();
        let page = pgm.page_info(0x1000).unwrap();
        assert_eq!(page.state, PageState::Allocated);
        assert!(page.page_id.is_some());
        let allocated = host.allocated_pages();
        pgm.make_writable(0x1000).unwrap();
        assert_eq!(host.allocated_pages(), allocated, "second call allocates nothing");
    }

    #[test]
    fn write_monitored_page_transitions_once() {
        let (pgm, _host) = pgm_with_ram(0, 1, 4);
        pgm.make_writable(0).unwrap();
        assert_eq!(pgm.write_monitor_range(0, 0x1000).unwrap(), 1);
        assert_eq!(pgm.page_info(0).unwrap().state, PageState::WriteMonitored);

        let generation = pgm.generation();
        pgm.make_writable(0).unwrap();
        let page = pgm.page_info(0).unwrap();
        assert_eq!(page.state, PageState::Allocated);
        assert!(page.written);
        assert!(pgm.generation() > generation);

        let generation = pgm.generation();
        pgm.make_writable(0).unwrap();
        assert_eq!(pgm.generation(), generation, "idempotent second call");
        assert_eq!(pgm.stats().unmonitored, 1);
        assert_eq!(pgm.collect_written(0, 0x1000).unwrap(), vec![0]);
        assert!(pgm.collect_written(0, 0x1000).unwrap().is_empty(), "harvest clears");
    }

    #[test]
    fn mmio_and_reserved_pages_refuse_writability() {
        let h = host(4, None);
        let pgm = Pgm::new(PgmConfig::default(), h);
        pgm.register_ram_range(0, 0x1000, RamRangeKind::Mmio, "mmio").unwrap();
        pgm.register_ram_range(0x1000, 0x1000, RamRangeKind::Reserved, "hole").unwrap();
        assert_eq!(pgm.make_writable(0x10), Err(PgmError::PageReserved { gc_phys: 0x10 }));
        assert_eq!(pgm.make_writable(0x1010), Err(PgmError::PageReserved { gc_phys: 0x1010 }));
    }

    #[test]
    fn shared_page_is_copied_on_write() {
        let (pgm, host) = pgm_with_ram(0, 1, 4);
        let template = host.allocate_page().unwrap();
        let m = host.map_chunk(template.id.chunk).unwrap();
        m.write(m.page_offset(template.id.index), b"template").unwrap();

        pgm.share_page(0, template.id).unwrap();
        assert_eq!(pgm.page_info(0).unwrap().state, PageState::Shared);
        pgm.make_writable(0).unwrap();
        let page = pgm.page_info(0).unwrap();
        assert_eq!(page.state, PageState::Allocated);
        assert_ne!(page.page_id, Some(template.id));

        let mut buf = [0u8; 8];
        pgm.phys_read_raw(0, &mut buf).unwrap();
        assert_eq!(&buf, b"template");
    }

    #[test]
    fn dynamic_range_grows_per_chunk_window() {
        let h = host(2, None);
        let pgm = Pgm::new(PgmConfig::default(), h);
        pgm.register_ram_range(0, 0x5000, RamRangeKind::DynamicRam, "dyn").unwrap();
        assert!(!pgm.page_info(0x2000).unwrap().is_backed());
        assert_eq!(pgm.grow_ram_range(0x3000).unwrap(), 2, "pages 2 and 3");
        assert!(pgm.page_info(0x2000).unwrap().is_backed());
        assert!(!pgm.page_info(0x4000).unwrap().is_backed());
        assert_eq!(pgm.grow_ram_range(0x3000).unwrap(), 0);
        assert!(matches!(
            Pgm::new(PgmConfig::default(), host(2, None)).grow_ram_range(0),
            Err(PgmError::InvalidGCPhysicalAddress { .. })
        ));
    }

    #[test]
    fn sharing_a_private_page_returns_it_to_the_host() {
        let h = host(4, Some(2));
        let pgm = Pgm::new(PgmConfig::default(), h.clone());
        pgm.register_ram_range(0, 0x2000, RamRangeKind::Ram, "ram").unwrap();
        let mut tlb = pgm.new_tlb();
        pgm.phys_write(&mut tlb, 0, &[7]);
        assert_eq!(h.allocated_pages(), 1);

        let template = h.allocate_page().unwrap();
        pgm.share_page(0, template.id).unwrap();
        assert_eq!(h.allocated_pages(), 1, "private page released");

        // Copy-on-write fits in the budget again.
        pgm.phys_write(&mut tlb, 0, &[1]);
        assert_eq!(h.allocated_pages(), 2);
        let mut buf = [0u8; 1];
        pgm.phys_read(&mut tlb, 0, &mut buf);
        assert_eq!(buf, [1]);
        assert_eq!(pgm.stats().dropped_writes, 0);
    }

    #[test]
    fn failed_make_writable_releases_the_new_page() {
        let h = host(1, None);
        let config = PgmConfig { max_mapped_chunks: 1, allow_chunk_cache_growth: false, ..PgmConfig::default() };
        let pgm = Pgm::new(config, h.clone());
        pgm.register_ram_range(0, 0x2000, RamRangeKind::Ram, "ram").unwrap();
        let _pinned = pgm.phys_to_host_ptr(0, 8).unwrap();
        assert_eq!(h.allocated_pages(), 1);

        assert!(matches!(pgm.make_writable(0x1000), Err(PgmError::ChunkCacheFull { chunk: 1, .. })));
        assert_eq!(h.allocated_pages(), 1);
        assert_eq!(pgm.page_info(0x1000).unwrap().state, PageState::Zero);
    }
}
