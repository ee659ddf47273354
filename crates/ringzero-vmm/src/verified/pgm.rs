//! Pure, verifiable functions for guest-physical address arithmetic,
//! TLB indexing, access clipping and chunk ageing.
//!
//! Every function in this module is:
//! - **Pure**: no I/O, no locks, no side effects beyond the return value.
//! - **Deterministic**: same inputs always produce the same outputs.
//! - **Assertion-guarded**: `debug_assert!` preconditions and
//!   postconditions on every non-trivial function.
//!
//! # Mapping to `pgm/`
//!
//! | Verified function          | Delegated from                          |
//! |----------------------------|-----------------------------------------|
//! | [`page_base`]              | `tlb::PhysTlb`, `phys` dispatch loop    |
//! | [`phys_tlb_index`]         | `tlb::PhysTlb::slot`                    |
//! | [`chunk_tlb_index`]        | `chunk::ChunkCache::lookup`             |
//! | [`bytes_to_page_end`]      | `phys` dispatch loop                    |
//! | [`clip_to_range`]          | handler dispatch in `phys`              |
//! | [`aged`]                   | `chunk::ChunkCache::age`                |
//! | [`select_unmap_candidate`] | `chunk::ChunkCache::evict_one`          |
//! | [`lock_step`]              | `Pgm` mapping locks                     |
//! | [`unlock_step`]            | `PageMappingLock::drop`                 |

// ═══════════════════════════════════════════════════════════════════════
//  Constants
// ═══════════════════════════════════════════════════════════════════════

/// Guest page shift (4 KiB pages).
pub const PAGE_SHIFT: u32 = 12;

/// Guest page size in bytes.
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Mask selecting the offset within a page.
pub const PAGE_OFFSET_MASK: u64 = PAGE_SIZE - 1;

/// Upper bound on the ageing interval, in chunk-map misses.
pub const MAX_AGEING_INTERVAL: u32 = 1024;

/// Lock count at which a page becomes permanently locked.
pub const MAX_PAGE_LOCKS: u16 = u16::MAX;

const _: () = assert!(PAGE_SIZE == 4096);
const _: () = assert!(PAGE_OFFSET_MASK & PAGE_SIZE == 0);
const _: () = assert!(MAX_AGEING_INTERVAL.is_power_of_two());

// ═══════════════════════════════════════════════════════════════════════
//  Address arithmetic
// ═══════════════════════════════════════════════════════════════════════

/// Round a guest-physical address down to its page boundary.
#[inline]
pub fn page_base(gc_phys: u64) -> u64 {
    gc_phys & !PAGE_OFFSET_MASK
}

/// Offset of `gc_phys` inside its page.
#[inline]
pub fn page_offset(gc_phys: u64) -> usize {
    (gc_phys & PAGE_OFFSET_MASK) as usize
}

/// Bytes from `gc_phys` up to (and excluding) the next page boundary.
///
/// Always in `1..=PAGE_SIZE`.
#[inline]
pub fn bytes_to_page_end(gc_phys: u64) -> usize {
    let n = (PAGE_SIZE - (gc_phys & PAGE_OFFSET_MASK)) as usize;
    debug_assert!(n >= 1 && n as u64 <= PAGE_SIZE, "postcondition: 1..=PAGE_SIZE");
    n
}

/// Whether `addr` is page aligned.
#[inline]
pub fn is_page_aligned(addr: u64) -> bool {
    addr & PAGE_OFFSET_MASK == 0
}

/// Direct-mapped physical TLB slot for `gc_phys`.
///
/// # Panics (debug)
///
/// `entries` must be a non-zero power of two.
#[inline]
pub fn phys_tlb_index(gc_phys: u64, entries: usize) -> usize {
    debug_assert!(entries.is_power_of_two(), "precondition: power-of-two TLB");
    let idx = ((gc_phys >> PAGE_SHIFT) as usize) & (entries - 1);
    debug_assert!(idx < entries, "postcondition: index in bounds");
    idx
}

/// Direct-mapped chunk TLB slot for `chunk_id`.
#[inline]
pub fn chunk_tlb_index(chunk_id: u32, entries: usize) -> usize {
    debug_assert!(entries.is_power_of_two(), "precondition: power-of-two TLB");
    (chunk_id as usize) & (entries - 1)
}

/// Clip an access of `len` bytes at `addr` so that it does not run past
/// `last` (inclusive end of a handler or RAM range).
///
/// Returns at least 1 when `addr <= last` and `len >= 1`.
#[inline]
pub fn clip_to_range(addr: u64, len: usize, last: u64) -> usize {
    debug_assert!(addr <= last, "precondition: addr inside range");
    let room = last - addr;
    let clipped = if room >= len as u64 { len } else { room as usize + 1 };
    debug_assert!(clipped <= len, "postcondition: never grows the access");
    clipped
}

// ═══════════════════════════════════════════════════════════════════════
//  Chunk ageing
// ═══════════════════════════════════════════════════════════════════════

/// Number of chunk-map misses between two ageing sweeps.
#[inline]
pub fn ageing_interval(max_mapped_chunks: usize) -> u32 {
    let quarter = (max_mapped_chunks / 4).min(MAX_AGEING_INTERVAL as usize) as u32;
    quarter.max(1)
}

/// New age of a chunk after one ageing sweep.
///
/// Chunks touched since the previous sweep restart at zero; all others
/// grow one step older.
#[inline]
pub fn aged(age: u32, touched: bool) -> u32 {
    if touched {
        0
    } else {
        age.saturating_add(1)
    }
}

/// Per-chunk facts needed to pick an eviction victim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkAgeView {
    pub id: u32,
    pub age: u32,
    pub refs: u32,
    /// Referenced by a live chunk-TLB or physical-TLB entry.
    pub pinned: bool,
}

/// Pick the oldest chunk that is safe to unmap.
///
/// Candidates must have no references and no live TLB entry. Among
/// equally old candidates the lowest id wins, so the choice is
/// deterministic for a given table.
pub fn select_unmap_candidate<I>(chunks: I) -> Option<u32>
where
    I: IntoIterator<Item = ChunkAgeView>,
{
    let mut best: Option<ChunkAgeView> = None;
    for c in chunks {
        if c.refs != 0 || c.pinned {
            continue;
        }
        best = match best {
            None => Some(c),
            Some(b) if c.age > b.age || (c.age == b.age && c.id < b.id) => Some(c),
            keep => keep,
        };
    }
    debug_assert!(
        best.map_or(true, |b| b.refs == 0 && !b.pinned),
        "postcondition: victim is unreferenced"
    );
    best.map(|b| b.id)
}

// ═══════════════════════════════════════════════════════════════════════
//  Page mapping locks
// ═══════════════════════════════════════════════════════════════════════

/// Outcome of taking one more mapping lock on a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStep {
    /// Counted normally; new count.
    Counted(u16),
    /// This lock saturated the counter; the page is now locked forever
    /// and its chunk gets one extra permanent reference.
    BecamePermanent,
    /// Already permanently locked; nothing to count.
    Permanent,
}

/// Increment a page lock count, saturating at [`MAX_PAGE_LOCKS`].
#[inline]
pub fn lock_step(locks: u16) -> LockStep {
    match locks {
        MAX_PAGE_LOCKS => LockStep::Permanent,
        n if n == MAX_PAGE_LOCKS - 1 => LockStep::BecamePermanent,
        n => LockStep::Counted(n + 1),
    }
}

/// Outcome of dropping one mapping lock on a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockStep {
    Counted(u16),
    Permanent,
}

/// Decrement a page lock count. Permanent locks never decrease.
#[inline]
pub fn unlock_step(locks: u16) -> UnlockStep {
    debug_assert!(locks > 0, "precondition: page is locked");
    match locks {
        MAX_PAGE_LOCKS => UnlockStep::Permanent,
        n => UnlockStep::Counted(n.saturating_sub(1)),
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════
