//! Access handlers: device callbacks that intercept guest memory access.
//!
//! Two independent registries exist:
//!
//! - **Physical** handlers cover a guest-physical interval. Lookup is an
//!   ordered-map floor search.
//! - **Virtual** handlers cover a guest-linear interval. Pages are
//!   resolved to guest-physical addresses through [`GuestPaging`] when
//!   the handler is registered (and on
//!   [`resync_virtual_handlers`](super::Pgm::resync_virtual_handlers)).
//!   Going from a physical page back to the virtual handler watching it
//!   is a full scan over every handler and page. That scan only runs for
//!   pages whose flags say a virtual handler is present.
//!
//! Registration keeps the per-page `*_HANDLER_*` flag bits in sync so
//! the read/write dispatcher can decide from the page descriptor alone
//! whether a lookup is needed.
//!
//! Callbacks never run under the PGM lock.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, info};

use super::backing::ChunkMapping;
use super::page::PageFlags;
use super::ram::{RamRangeKind, RamRanges};
use super::{Pgm, PgmError};
use crate::verified::pgm::{page_base, page_offset, PAGE_SHIFT, PAGE_SIZE};

// ═══════════════════════════════════════════════════════════════════════
//  Callback interface
// ═══════════════════════════════════════════════════════════════════════

/// Which accesses a handler intercepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    Write,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessType {
    Read,
    Write,
}

/// What the dispatcher should do after a callback returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerAction {
    /// Perform the access on guest memory as if no handler existed.
    Default,
    /// The handler completed the access.
    Handled,
}

/// Caller data for one intercepted access.
#[derive(Debug)]
pub enum AccessBuf<'a> {
    /// Fill with the bytes the guest reads.
    Read(&'a mut [u8]),
    /// Bytes the guest is writing.
    Write(&'a [u8]),
}

impl AccessBuf<'_> {
    pub fn len(&self) -> usize {
        match self {
            AccessBuf::Read(b) => b.len(),
            AccessBuf::Write(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The host bytes behind an intercepted access.
#[derive(Debug, Clone, Copy)]
pub struct HostSpan<'a> {
    mapping: &'a ChunkMapping,
    offset: usize,
    len: usize,
}

impl<'a> HostSpan<'a> {
    pub(crate) fn new(mapping: &'a ChunkMapping, offset: usize, len: usize) -> Self {
        Self { mapping, offset, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// False when the span is the shared zero page.
    pub fn is_writable(&self) -> bool {
        !self.mapping.is_zero_page()
    }

    /// Current guest memory content.
    pub fn read(&self, buf: &mut [u8]) -> Result<(), PgmError> {
        let n = buf.len().min(self.len);
        self.mapping.read(self.offset, &mut buf[..n])
    }

    /// Update guest memory underneath the handler.
    pub fn write(&self, data: &[u8]) -> Result<(), PgmError> {
        let n = data.len().min(self.len);
        self.mapping.write(self.offset, &data[..n])
    }
}

/// One intercepted access as seen by a handler.
#[derive(Debug)]
pub struct HandlerAccess<'a> {
    /// Guest-physical address for physical handlers, guest-linear
    /// address for virtual handlers.
    pub address: u64,
    /// Guest-physical address of the access.
    pub gc_phys: u64,
    pub access: AccessType,
    pub host: HostSpan<'a>,
    pub buf: AccessBuf<'a>,
    /// Value supplied at registration.
    pub token: u64,
}

/// Device callback for an access handler.
pub trait AccessHandler: Send + Sync {
    fn handle(&self, access: &mut HandlerAccess<'_>) -> HandlerAction;
}

/// Guest-linear to guest-physical translation, owned by the paging code.
pub trait GuestPaging: Send + Sync {
    /// Guest-physical page base backing the page of `gc_ptr`, if mapped.
    fn translate(&self, gc_ptr: u64) -> Option<u64>;
}

// ═══════════════════════════════════════════════════════════════════════
//  Registries
// ═══════════════════════════════════════════════════════════════════════

#[derive(Clone)]
pub(crate) struct HandlerEntry {
    pub(crate) first: u64,
    pub(crate) last: u64,
    pub(crate) kind: HandlerKind,
    pub(crate) handler: Arc<dyn AccessHandler>,
    pub(crate) token: u64,
    pub(crate) desc: String,
}

impl std::fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("first", &format_args!("{:#x}", self.first))
            .field("last", &format_args!("{:#x}", self.last))
            .field("kind", &self.kind)
            .field("desc", &self.desc)
            .finish()
    }
}

/// Interval map keyed by first address; intervals never overlap.
#[derive(Debug, Default)]
pub(crate) struct IntervalMap {
    map: BTreeMap<u64, HandlerEntry>,
}

impl IntervalMap {
    pub(crate) fn insert(&mut self, entry: HandlerEntry) -> Result<(), PgmError> {
        if self.overlapping(entry.first, entry.last).next().is_some() {
            return Err(PgmError::HandlerConflict { first: entry.first, last: entry.last });
        }
        self.map.insert(entry.first, entry);
        Ok(())
    }

    pub(crate) fn remove(&mut self, first: u64) -> Option<HandlerEntry> {
        self.map.remove(&first)
    }

    /// Entry whose interval contains `addr`.
    pub(crate) fn find(&self, addr: u64) -> Option<&HandlerEntry> {
        self.map
            .range(..=addr)
            .next_back()
            .map(|(_, e)| e)
            .filter(|e| addr <= e.last)
    }

    pub(crate) fn overlapping(&self, first: u64, last: u64) -> impl Iterator<Item = &HandlerEntry> {
        let before = self.map.range(..first).next_back().map(|(_, e)| e).filter(|e| e.last >= first);
        before.into_iter().chain(self.map.range(first..=last).map(|(_, e)| e))
    }

    /// First address of the next interval starting above `addr`.
    pub(crate) fn next_first_after(&self, addr: u64) -> Option<u64> {
        let from = addr.checked_add(1)?;
        self.map.range(from..).next().map(|(first, _)| *first)
    }

    pub(crate) fn values(&self) -> impl Iterator<Item = &HandlerEntry> {
        self.map.values()
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }
}

/// Virtual handlers plus the physical page behind each of their pages.
#[derive(Debug, Default)]
pub(crate) struct VirtHandlers {
    pub(crate) intervals: IntervalMap,
    /// first → physical page base per linear page (None = not present).
    pub(crate) pages: BTreeMap<u64, Vec<Option<u64>>>,
}

/// A resolved handler for one access.
#[derive(Clone)]
pub(crate) struct ResolvedHandler {
    pub(crate) handler: Arc<dyn AccessHandler>,
    pub(crate) token: u64,
    /// Address passed to the callback (physical or linear).
    pub(crate) address: u64,
    /// Inclusive end of the handler range, in the same address space.
    pub(crate) last: u64,
}

impl VirtHandlers {
    /// Reverse lookup: which virtual handler page is backed by `gc_phys`?
    ///
    /// Walks every page of every handler.
    pub(crate) fn find_by_phys(&self, gc_phys: u64) -> Option<ResolvedHandler> {
        let target = page_base(gc_phys);
        for entry in self.intervals.values() {
            let Some(pages) = self.pages.get(&entry.first) else {
                continue;
            };
            if let Some(i) = pages.iter().position(|p| *p == Some(target)) {
                let gc_ptr = page_base(entry.first) + ((i as u64) << PAGE_SHIFT) + page_offset(gc_phys) as u64;
                if gc_ptr < entry.first || gc_ptr > entry.last {
                    continue;
                }
                return Some(ResolvedHandler {
                    handler: Arc::clone(&entry.handler),
                    token: entry.token,
                    address: gc_ptr,
                    last: entry.last,
                });
            }
        }
        None
    }

    /// Lowest physical address above `gc_phys`, on the same page, where
    /// some virtual handler's linear range begins.
    pub(crate) fn next_phys_start_after(&self, gc_phys: u64) -> Option<u64> {
        let target = page_base(gc_phys);
        let mut next: Option<u64> = None;
        for entry in self.intervals.values() {
            let Some(pages) = self.pages.get(&entry.first) else {
                continue;
            };
            for (i, _) in pages.iter().enumerate().filter(|(_, p)| **p == Some(target)) {
                let linear_page = page_base(entry.first) + ((i as u64) << PAGE_SHIFT);
                let start = target + page_offset(entry.first.max(linear_page)) as u64;
                if start > gc_phys {
                    next = Some(next.map_or(start, |n| n.min(start)));
                }
            }
        }
        next
    }

    /// Strongest virtual handler kind watching physical page `page`.
    fn kind_for_page(&self, page: u64) -> Option<HandlerKind> {
        let mut kind = None;
        for entry in self.intervals.values() {
            let watched = self
                .pages
                .get(&entry.first)
                .is_some_and(|pages| pages.contains(&Some(page)));
            if watched {
                kind = strongest(kind, entry.kind);
            }
        }
        kind
    }
}

fn strongest(current: Option<HandlerKind>, next: HandlerKind) -> Option<HandlerKind> {
    match (current, next) {
        (Some(HandlerKind::All), _) | (_, HandlerKind::All) => Some(HandlerKind::All),
        _ => Some(HandlerKind::Write),
    }
}

/// Recompute handler flag bits for every page of `[first, last]`.
pub(crate) fn refresh_page_flags(
    ranges: &mut RamRanges,
    phys: &IntervalMap,
    virt: &VirtHandlers,
    first: u64,
    last: u64,
) {
    let mut page = page_base(first);
    while page <= last {
        let mut flags = PageFlags::empty();
        let phys_kind = phys
            .overlapping(page, page + PAGE_SIZE - 1)
            .fold(None, |k, e| strongest(k, e.kind));
        match phys_kind {
            Some(HandlerKind::All) => flags |= PageFlags::PHYS_HANDLER_ALL,
            Some(HandlerKind::Write) => flags |= PageFlags::PHYS_HANDLER_WRITE,
            None => {}
        }
        match virt.kind_for_page(page) {
            Some(HandlerKind::All) => flags |= PageFlags::VIRT_HANDLER_ALL,
            Some(HandlerKind::Write) => flags |= PageFlags::VIRT_HANDLER_WRITE,
            None => {}
        }
        if let Some(desc) = ranges.page_mut(page) {
            desc.flags = (desc.flags - PageFlags::HANDLERS) | flags;
        }
        match page.checked_add(PAGE_SIZE) {
            Some(next) => page = next,
            None => break,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Registration
// ═══════════════════════════════════════════════════════════════════════

impl Pgm {
    /// Register a physical access handler for `[gc_phys, last]`.
    ///
    /// # Errors
    ///
    /// - [`PgmError::InvalidRange`] if `last < gc_phys`.
    /// - [`PgmError::InvalidGCPhysicalAddress`] if the range is not
    ///   inside registered guest memory.
    /// - [`PgmError::RangeConflict`] on an MMIO range; MMIO pages always
    ///   go to the MMIO fallback.
    /// - [`PgmError::HandlerConflict`] if it overlaps another physical
    ///   handler.
    pub fn register_physical_handler(
        &self,
        kind: HandlerKind,
        gc_phys: u64,
        last: u64,
        handler: Arc<dyn AccessHandler>,
        token: u64,
        desc: &str,
    ) -> Result<(), PgmError> {
        if last < gc_phys {
            return Err(PgmError::InvalidRange { gc_phys, size: 0 });
        }
        let mut st = self.locked();
        let range = st
            .ranges
            .find(gc_phys)
            .map(|i| st.ranges.get(i))
            .filter(|r| r.contains(last))
            .ok_or(PgmError::InvalidGCPhysicalAddress { gc_phys })?;
        if range.kind == RamRangeKind::Mmio {
            return Err(PgmError::RangeConflict {
                gc_phys,
                size: (last - gc_phys).saturating_add(1),
                existing: range.desc.clone(),
            });
        }
        st.phys_handlers.insert(HandlerEntry {
            first: gc_phys,
            last,
            kind,
            handler,
            token,
            desc: desc.to_string(),
        })?;
        let st = &mut *st;
        refresh_page_flags(&mut st.ranges, &st.phys_handlers, &st.virt_handlers, gc_phys, last);
        self.bump_generation();
        info!("Physical {:?} handler '{}' at {:#x}..={:#x}", kind, desc, gc_phys, last);
        Ok(())
    }

    /// Remove the physical handler starting at `gc_phys`.
    pub fn deregister_physical_handler(&self, gc_phys: u64) -> Result<(), PgmError> {
        let mut st = self.locked();
        let entry = st
            .phys_handlers
            .remove(gc_phys)
            .ok_or(PgmError::HandlerNotFound { address: gc_phys })?;
        let st = &mut *st;
        refresh_page_flags(&mut st.ranges, &st.phys_handlers, &st.virt_handlers, entry.first, entry.last);
        self.bump_generation();
        debug!("Physical handler '{}' at {:#x} removed", entry.desc, gc_phys);
        Ok(())
    }

    /// Register a virtual (guest-linear) access handler for
    /// `[gc_ptr, last]`.
    ///
    /// # Errors
    ///
    /// - [`PgmError::GuestPagingUnavailable`] without a [`GuestPaging`].
    /// - [`PgmError::InvalidRange`] if `last < gc_ptr`.
    /// - [`PgmError::HandlerConflict`] if it overlaps another virtual
    ///   handler.
    pub fn register_virtual_handler(
        &self,
        kind: HandlerKind,
        gc_ptr: u64,
        last: u64,
        handler: Arc<dyn AccessHandler>,
        token: u64,
        desc: &str,
    ) -> Result<(), PgmError> {
        let paging = self.paging.as_ref().ok_or(PgmError::GuestPagingUnavailable { gc_ptr })?;
        if last < gc_ptr {
            return Err(PgmError::InvalidRange { gc_phys: gc_ptr, size: 0 });
        }
        let pages = resolve_pages(paging.as_ref(), gc_ptr, last);
        let mut st = self.locked();
        st.virt_handlers.intervals.insert(HandlerEntry {
            first: gc_ptr,
            last,
            kind,
            handler,
            token,
            desc: desc.to_string(),
        })?;
        st.virt_handlers.pages.insert(gc_ptr, pages.clone());
        let st = &mut *st;
        for page in pages.into_iter().flatten() {
            refresh_page_flags(&mut st.ranges, &st.phys_handlers, &st.virt_handlers, page, page);
        }
        self.bump_generation();
        info!("Virtual {:?} handler '{}' at {:#x}..={:#x}", kind, desc, gc_ptr, last);
        Ok(())
    }

    /// Remove the virtual handler starting at `gc_ptr`.
    pub fn deregister_virtual_handler(&self, gc_ptr: u64) -> Result<(), PgmError> {
        let mut st = self.locked();
        let entry = st
            .virt_handlers
            .intervals
            .remove(gc_ptr)
            .ok_or(PgmError::HandlerNotFound { address: gc_ptr })?;
        let pages = st.virt_handlers.pages.remove(&gc_ptr).unwrap_or_default();
        let st = &mut *st;
        for page in pages.into_iter().flatten() {
            refresh_page_flags(&mut st.ranges, &st.phys_handlers, &st.virt_handlers, page, page);
        }
        self.bump_generation();
        debug!("Virtual handler '{}' at {:#x} removed", entry.desc, gc_ptr);
        Ok(())
    }

    /// Re-translate every virtual handler after the guest changed its
    /// page tables, moving the page flag bits along.
    pub fn resync_virtual_handlers(&self) {
        let Some(paging) = self.paging.as_ref() else {
            return;
        };
        let mut st = self.locked();
        let ranges: Vec<(u64, u64)> =
            st.virt_handlers.intervals.values().map(|e| (e.first, e.last)).collect();
        let mut touched = Vec::new();
        for (first, last) in ranges {
            let fresh = resolve_pages(paging.as_ref(), first, last);
            if let Some(old) = st.virt_handlers.pages.insert(first, fresh.clone()) {
                touched.extend(old.into_iter().flatten());
            }
            touched.extend(fresh.into_iter().flatten());
        }
        touched.sort_unstable();
        touched.dedup();
        let st = &mut *st;
        for page in &touched {
            refresh_page_flags(&mut st.ranges, &st.phys_handlers, &st.virt_handlers, *page, *page);
        }
        self.bump_generation();
        debug!("Resynced virtual handlers ({} physical pages)", touched.len());
    }

    /// Physical handler covering `gc_phys`, resolved under the lock.
    pub(crate) fn physical_handler_at(&self, gc_phys: u64) -> Option<ResolvedHandler> {
        let st = self.locked();
        st.phys_handlers.find(gc_phys).map(|e| ResolvedHandler {
            handler: Arc::clone(&e.handler),
            token: e.token,
            address: gc_phys,
            last: e.last,
        })
    }

    /// Virtual handler whose linear range maps onto `gc_phys`.
    pub(crate) fn virtual_handler_at(&self, gc_phys: u64) -> Option<ResolvedHandler> {
        self.locked().virt_handlers.find_by_phys(gc_phys)
    }

    /// Where the next physical and/or virtual handler begins above
    /// `gc_phys`, for clipping accesses on flagged pages.
    pub(crate) fn next_handler_start(&self, gc_phys: u64, phys: bool, virt: bool) -> Option<u64> {
        let st = self.locked();
        let p = if phys { st.phys_handlers.next_first_after(gc_phys) } else { None };
        let v = if virt { st.virt_handlers.next_phys_start_after(gc_phys) } else { None };
        match (p, v) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

fn resolve_pages(paging: &dyn GuestPaging, first: u64, last: u64) -> Vec<Option<u64>> {
    let count = ((page_base(last) - page_base(first)) >> PAGE_SHIFT) + 1;
    (0..count)
        .map(|i| paging.translate(page_base(first) + (i << PAGE_SHIFT)).map(page_base))
        .collect()
}
