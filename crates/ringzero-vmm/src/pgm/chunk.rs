//! Chunk mapping cache.
//!
//! Keeps a bounded set of chunks mapped into the runtime, with a small
//! direct-mapped TLB in front of the ordered chunk table.
//!
//! # Lookup
//!
//! ```text
//!   chunk TLB[id & (n-1)] ──hit──► mapping (age reset)
//!          │ miss
//!          ▼
//!   BTreeMap<ChunkId, ChunkEntry> ──hit──► mapping, refill TLB slot
//!          │ miss
//!          ▼
//!   cache full? ── evict oldest unpinned, unreferenced chunk
//!          │
//!          ▼
//!   HostMemory::map_chunk(id)
//! ```
//!
//! # Pinning
//!
//! A chunk is never unmapped while `refs > 0` (held by a
//! [`PageMappingLock`](super::PageMappingLock)) or while any TLB entry
//! still references its mapping. TLB references are detected through
//! the mapping's `Arc` strong count: the table owns exactly one
//! reference, every other holder pins it.
//!
//! All methods run under the PGM lock.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, trace};

use super::backing::{ChunkMapping, HostMemory};
use super::page::ChunkId;
use super::{PgmConfig, PgmError};
use crate::verified::pgm::{aged, ageing_interval, chunk_tlb_index, select_unmap_candidate, ChunkAgeView};

/// Counters exposed through [`PgmStats`](super::PgmStats).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkStats {
    pub tlb_hits: u64,
    pub tlb_misses: u64,
    pub maps: u64,
    pub unmaps: u64,
    pub sweeps: u64,
    /// Times the cache grew past its limit because nothing was evictable.
    pub overcommits: u64,
}

#[derive(Debug)]
struct ChunkEntry {
    mapping: Arc<ChunkMapping>,
    refs: u32,
    age: u32,
    touched: bool,
}

#[derive(Debug)]
pub(crate) struct ChunkCache {
    map: BTreeMap<ChunkId, ChunkEntry>,
    tlb: Vec<Option<Arc<ChunkMapping>>>,
    max_mapped: usize,
    allow_growth: bool,
    interval: u32,
    countdown: u32,
    stats: ChunkStats,
}

impl ChunkCache {
    pub(crate) fn new(config: &PgmConfig) -> Self {
        debug_assert!(config.chunk_tlb_entries.is_power_of_two());
        let interval = ageing_interval(config.max_mapped_chunks);
        Self {
            map: BTreeMap::new(),
            tlb: vec![None; config.chunk_tlb_entries],
            max_mapped: config.max_mapped_chunks.max(1),
            allow_growth: config.allow_chunk_cache_growth,
            interval,
            countdown: interval,
            stats: ChunkStats::default(),
        }
    }

    /// Resolve a chunk id to a live mapping, mapping it in if needed.
    pub(crate) fn lookup(
        &mut self,
        id: ChunkId,
        host: &dyn HostMemory,
    ) -> Result<Arc<ChunkMapping>, PgmError> {
        let slot = chunk_tlb_index(id, self.tlb.len());
        if let Some(m) = self.tlb[slot].as_ref().filter(|m| m.id() == id) {
            let m = Arc::clone(m);
            self.stats.tlb_hits += 1;
            self.touch(id);
            return Ok(m);
        }
        self.stats.tlb_misses += 1;

        if let Some(entry) = self.map.get_mut(&id) {
            entry.age = 0;
            entry.touched = true;
            let m = Arc::clone(&entry.mapping);
            self.tlb[slot] = Some(Arc::clone(&m));
            return Ok(m);
        }

        self.countdown = self.countdown.saturating_sub(1);
        if self.countdown == 0 {
            self.age();
        }
        if self.map.len() >= self.max_mapped && !self.evict_one(host) {
            if !self.allow_growth {
                return Err(PgmError::ChunkCacheFull { chunk: id, mapped: self.map.len() });
            }
            self.stats.overcommits += 1;
            debug!(
                "Chunk cache over limit ({} mapped), nothing evictable for chunk {}",
                self.map.len(),
                id
            );
        }

        let m = host.map_chunk(id)?;
        self.stats.maps += 1;
        trace!("Mapped chunk {} ({} cached)", id, self.map.len() + 1);
        self.map.insert(
            id,
            ChunkEntry { mapping: Arc::clone(&m), refs: 0, age: 0, touched: true },
        );
        self.tlb[slot] = Some(Arc::clone(&m));
        Ok(m)
    }

    fn touch(&mut self, id: ChunkId) {
        if let Some(entry) = self.map.get_mut(&id) {
            entry.age = 0;
            entry.touched = true;
        }
    }

    /// Take a reference that keeps `id` mapped.
    pub(crate) fn retain(&mut self, id: ChunkId) {
        match self.map.get_mut(&id) {
            Some(entry) => entry.refs += 1,
            None => debug_assert!(false, "retain of unmapped chunk {id}"),
        }
    }

    /// Drop a reference taken with [`retain`](Self::retain).
    pub(crate) fn release(&mut self, id: ChunkId) {
        if let Some(entry) = self.map.get_mut(&id) {
            debug_assert!(entry.refs > 0, "unbalanced release of chunk {id}");
            entry.refs = entry.refs.saturating_sub(1);
            entry.age = 0;
            entry.touched = true;
        }
    }

    /// One ageing sweep over every mapped chunk.
    pub(crate) fn age(&mut self) {
        for entry in self.map.values_mut() {
            entry.age = aged(entry.age, entry.touched);
            entry.touched = false;
        }
        self.countdown = self.interval;
        self.stats.sweeps += 1;
    }

    /// Unmap the best eviction candidate. Returns `false` if none exists.
    fn evict_one(&mut self, host: &dyn HostMemory) -> bool {
        let victim = select_unmap_candidate(self.map.iter().map(|(&id, e)| ChunkAgeView {
            id,
            age: e.age,
            refs: e.refs,
            pinned: Arc::strong_count(&e.mapping) > 1,
        }));
        let Some(id) = victim else {
            return false;
        };
        self.map.remove(&id);
        host.unmap_chunk(id);
        self.stats.unmaps += 1;
        debug!("Evicted chunk {} from the mapping cache", id);
        true
    }

    pub(crate) fn is_mapped(&self, id: ChunkId) -> bool {
        self.map.contains_key(&id)
    }

    pub(crate) fn refs(&self, id: ChunkId) -> Option<u32> {
        self.map.get(&id).map(|e| e.refs)
    }

    pub(crate) fn age_of(&self, id: ChunkId) -> Option<u32> {
        self.map.get(&id).map(|e| e.age)
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    /// Forget every chunk-TLB entry (they pin their chunks).
    pub(crate) fn flush_tlb(&mut self) {
        self.tlb.iter_mut().for_each(|slot| *slot = None);
    }

    pub(crate) fn stats(&self) -> ChunkStats {
        self.stats
    }
}
