//! Physical access TLB.
//!
//! Each EMT owns a [`PhysTlb`]: a direct-mapped array of resolved
//! guest-physical pages. An entry snapshots the page descriptor and
//! holds the chunk mapping behind it, so a hit needs neither the PGM
//! lock nor the chunk cache.
//!
//! An entry is trusted only when both its key (page base) and the PGM
//! generation match. Every PGM mutation that can change a translation
//! bumps the generation, which turns every outstanding entry into a
//! miss.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::backing::ChunkMapping;
use super::page::{PageDesc, PageState};
use super::{Pgm, PgmError};
use crate::verified::pgm::{page_base, page_offset, phys_tlb_index};

/// One resolved guest page.
#[derive(Debug, Clone)]
pub struct PhysTlbEntry {
    pub(crate) key: u64,
    pub(crate) generation: u64,
    pub(crate) page: PageDesc,
    pub(crate) mapping: Arc<ChunkMapping>,
    pub(crate) index: u32,
}

impl PhysTlbEntry {
    /// Page-aligned guest-physical address.
    #[inline]
    pub fn gc_phys(&self) -> u64 {
        self.key
    }

    /// Descriptor as it was when the entry was loaded.
    #[inline]
    pub fn page(&self) -> &PageDesc {
        &self.page
    }

    /// Host address of the start of the page.
    #[inline]
    pub fn host_ptr(&self) -> *mut u8 {
        self.mapping.host_ptr(self.mapping.page_offset(self.index))
    }

    #[inline]
    pub(crate) fn host_offset(&self, gc_phys: u64) -> usize {
        self.mapping.page_offset(self.index) + page_offset(gc_phys)
    }

    pub(crate) fn read(&self, gc_phys: u64, buf: &mut [u8]) -> Result<(), PgmError> {
        self.mapping.read(self.host_offset(gc_phys), buf)
    }

    pub(crate) fn write(&self, gc_phys: u64, data: &[u8]) -> Result<(), PgmError> {
        self.mapping.write(self.host_offset(gc_phys), data)
    }

    #[inline]
    fn is_current(&self, key: u64, generation: u64) -> bool {
        self.key == key && self.generation == generation
    }
}

/// Per-EMT physical access TLB.
#[derive(Debug)]
pub struct PhysTlb {
    entries: Vec<Option<PhysTlbEntry>>,
    /// Most recent small plain-memory read.
    pub(crate) recent_read: Option<PhysTlbEntry>,
    /// Most recent small plain-memory write.
    pub(crate) recent_write: Option<PhysTlbEntry>,
    hits: u64,
    misses: u64,
    recent_hits: u64,
}

impl PhysTlb {
    /// Create a TLB with `entries` slots (rounded up to a power of two).
    pub fn new(entries: usize) -> Self {
        let entries = entries.max(1).next_power_of_two();
        Self {
            entries: vec![None; entries],
            recent_read: None,
            recent_write: None,
            hits: 0,
            misses: 0,
            recent_hits: 0,
        }
    }

    /// Drop every cached translation.
    pub fn flush(&mut self) {
        self.entries.iter_mut().for_each(|e| *e = None);
        self.recent_read = None;
        self.recent_write = None;
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    /// Accesses served by the single-entry recent caches.
    pub fn recent_hits(&self) -> u64 {
        self.recent_hits
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn note_recent_hit(&mut self) {
        self.recent_hits += 1;
    }
}

impl Pgm {
    /// Resolve `gc_phys` through `tlb`, loading the entry on a miss.
    ///
    /// # Errors
    ///
    /// - [`PgmError::InvalidGCPhysicalAddress`] outside every RAM range.
    /// - Chunk mapping failures from the chunk cache.
    pub fn query_tlbe<'t>(&self, tlb: &'t mut PhysTlb, gc_phys: u64) -> Result<&'t PhysTlbEntry, PgmError> {
        let key = page_base(gc_phys);
        let slot = phys_tlb_index(key, tlb.entries.len());
        let generation = self.generation.load(Ordering::Acquire);
        let hit = tlb.entries[slot].as_ref().is_some_and(|e| e.is_current(key, generation));
        if hit {
            tlb.hits += 1;
        } else {
            tlb.misses += 1;
            tlb.entries[slot] = None;
            let entry = self.load_tlbe(key)?;
            tlb.entries[slot] = Some(entry);
        }
        tlb.entries[slot]
            .as_ref()
            .ok_or(PgmError::InvalidGCPhysicalAddress { gc_phys })
    }

    /// Slow path: walk the ranges and resolve the page's mapping.
    pub(crate) fn load_tlbe(&self, key: u64) -> Result<PhysTlbEntry, PgmError> {
        let mut st = self.locked();
        let generation = self.generation.load(Ordering::Acquire);
        let page = *st
            .ranges
            .page(key)
            .ok_or(PgmError::InvalidGCPhysicalAddress { gc_phys: key })?;
        let (mapping, index) = match (page.state, page.page_id) {
            (PageState::Zero, _) | (_, None) => (self.host.zero_page(), 0),
            (_, Some(id)) => (st.chunks.lookup(id.chunk, self.host.as_ref())?, id.index),
        };
        Ok(PhysTlbEntry { key, generation, page, mapping, index })
    }
}
