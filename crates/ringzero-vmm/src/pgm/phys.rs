//! Guest-physical read/write dispatch and host pointer resolution.
//!
//! [`Pgm::phys_read`] and [`Pgm::phys_write`] are what device emulation
//! and the instruction emulator use to touch guest memory. They never
//! fail: every byte of the request is either served from memory, handed
//! to a device callback, zero-filled or dropped.
//!
//! # Per-page dispatch
//!
//! | Page                                | Read                | Write                          |
//! |-------------------------------------|---------------------|--------------------------------|
//! | outside every range                 | zero-fill           | drop                           |
//! | dynamic, not yet backed             | zero-fill           | grow range, retry once, else drop |
//! | reserved                            | zero-fill           | drop                           |
//! | ROM                                 | memory              | drop                           |
//! | MMIO                                | fallback, ≤ 4 bytes | fallback, ≤ 4 bytes            |
//! | physical handler                    | callback, clipped   | callback, clipped              |
//! | virtual handler                     | callback, clipped   | callback, clipped              |
//! | physical + virtual handler (write)  |                     | physical first, then virtual   |
//! | plain                               | memory              | make writable, memory          |
//!
//! A callback returning [`HandlerAction::Default`] lets the access fall
//! through to memory for the clipped span. With both handler kinds on
//! one page, both callbacks see the pre-write bytes; memory is updated
//! only if neither handled the write.
//!
//! The pointer APIs ([`Pgm::phys_to_host_phys`], [`Pgm::phys_to_host_ptr`])
//! and the raw accessors do fail, with [`PgmError`].

use std::sync::Arc;

use log::{debug, trace, warn};
use thiserror::Error;

use super::backing::ChunkMapping;
use super::handler::{AccessBuf, AccessType, HandlerAccess, HandlerAction, HostSpan, ResolvedHandler};
use super::page::{PageFlags, PageState};
use super::ram::RamRangeKind;
use super::tlb::{PhysTlb, PhysTlbEntry};
use super::{Pgm, PgmError};
use crate::verified::pgm::{
    bytes_to_page_end, clip_to_range, lock_step, page_base, page_offset, unlock_step, LockStep,
    UnlockStep, PAGE_SHIFT, PAGE_SIZE,
};

/// Largest access served by the single-entry recent caches.
pub const RECENT_ACCESS_MAX: usize = 4;

/// Largest access the legacy MMIO fallback is called with.
pub const MMIO_FALLBACK_MAX: usize = 4;

// ═══════════════════════════════════════════════════════════════════════
//  MMIO fallback
// ═══════════════════════════════════════════════════════════════════════

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MmioError {
    #[error("No device claims MMIO address {gc_phys:#x}")]
    Unclaimed { gc_phys: u64 },

    #[error("MMIO access of {len} bytes at {gc_phys:#x} not supported")]
    Unsupported { gc_phys: u64, len: usize },
}

/// Legacy MMIO path for pages without an access handler.
pub trait MmioFallback: Send + Sync {
    /// Read `buf.len()` (1..=4) bytes of device state.
    fn mmio_read(&self, gc_phys: u64, buf: &mut [u8]) -> Result<(), MmioError>;
    /// Write `data.len()` (1..=4) bytes to a device.
    fn mmio_write(&self, gc_phys: u64, data: &[u8]) -> Result<(), MmioError>;
}

// ═══════════════════════════════════════════════════════════════════════
//  Mapping locks
// ═══════════════════════════════════════════════════════════════════════

/// A locked host mapping of guest memory.
///
/// While alive, the chunk cannot be unmapped and the private pages it
/// covers cannot be replaced. A read-only mapping of a Shared page pins
/// only the template: a later write still copies the page, and the
/// mapping keeps showing the template. Dropping it releases everything.
pub struct PageMappingLock<'a> {
    pgm: &'a Pgm,
    gc_phys: u64,
    len: usize,
    mapping: Arc<ChunkMapping>,
    offset: usize,
    writable: bool,
    /// Page bases whose lock was counted (released on drop).
    counted: Vec<u64>,
    /// Chunk references to release on drop.
    chunk_refs: usize,
}

impl PageMappingLock<'_> {
    pub fn gc_phys(&self) -> u64 {
        self.gc_phys
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Host address of `gc_phys`.
    pub fn as_ptr(&self) -> *mut u8 {
        self.mapping.host_ptr(self.offset)
    }

    /// Copy out of the mapped span, starting `at` bytes in.
    pub fn read(&self, at: usize, buf: &mut [u8]) -> Result<(), PgmError> {
        self.check_span(at, buf.len())?;
        self.mapping.read(self.offset + at, buf)
    }

    /// Copy into the mapped span, starting `at` bytes in.
    pub fn write(&self, at: usize, data: &[u8]) -> Result<(), PgmError> {
        if !self.writable {
            return Err(PgmError::ReadOnlyMapping { gc_phys: self.gc_phys });
        }
        self.check_span(at, data.len())?;
        self.mapping.write(self.offset + at, data)
    }

    fn check_span(&self, at: usize, len: usize) -> Result<(), PgmError> {
        match at.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(PgmError::RangeCrossesChunkBoundary { gc_phys: self.gc_phys, len: at.saturating_add(len) }),
        }
    }
}

impl Drop for PageMappingLock<'_> {
    fn drop(&mut self) {
        if self.chunk_refs == 0 {
            return;
        }
        let mut st = self.pgm.locked();
        for page in &self.counted {
            let Some(desc) = st.ranges.page_mut(*page) else {
                continue;
            };
            if let UnlockStep::Counted(n) = unlock_step(desc.locks) {
                desc.locks = n;
            }
        }
        for _ in 0..self.chunk_refs {
            st.chunks.release(self.mapping.id());
        }
    }
}

impl std::fmt::Debug for PageMappingLock<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageMappingLock")
            .field("gc_phys", &format_args!("{:#x}", self.gc_phys))
            .field("len", &self.len)
            .field("chunk", &self.mapping.id())
            .field("writable", &self.writable)
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Pointer resolution
// ═══════════════════════════════════════════════════════════════════════

impl Pgm {
    /// Host-physical address of `gc_phys`.
    ///
    /// # Errors
    ///
    /// - [`PgmError::InvalidGCPhysicalAddress`] outside every range.
    /// - [`PgmError::PageReserved`] for reserved, MMIO and unbacked pages.
    pub fn phys_to_host_phys(&self, gc_phys: u64) -> Result<u64, PgmError> {
        let page = self.page_info(gc_phys)?;
        if !page.is_mappable() {
            return Err(PgmError::PageReserved { gc_phys });
        }
        Ok(page.hc_phys | page_offset(gc_phys) as u64)
    }

    /// Lock a writable host mapping of `[gc_phys, gc_phys + len)`.
    ///
    /// Pages are made writable first. The span may cover several pages
    /// as long as they are consecutive in one host chunk.
    ///
    /// # Errors
    ///
    /// - [`PgmError::InvalidGCPhysicalAddress`] outside every range.
    /// - [`PgmError::PageReserved`] for reserved, MMIO and unbacked pages.
    /// - [`PgmError::RangeCrossesChunkBoundary`] if the span leaves the
    ///   RAM range or its host chunk.
    pub fn phys_to_host_ptr(&self, gc_phys: u64, len: usize) -> Result<PageMappingLock<'_>, PgmError> {
        self.map_span(gc_phys, len, true)
    }

    /// Like [`phys_to_host_ptr`](Self::phys_to_host_ptr) without forcing
    /// the pages writable. Zero pages map the shared zero page.
    pub fn phys_to_host_ptr_read_only(&self, gc_phys: u64, len: usize) -> Result<PageMappingLock<'_>, PgmError> {
        self.map_span(gc_phys, len, false)
    }

    fn map_span(&self, gc_phys: u64, len: usize, writable: bool) -> Result<PageMappingLock<'_>, PgmError> {
        let len = len.max(1);
        let crosses = PgmError::RangeCrossesChunkBoundary { gc_phys, len };
        let last = gc_phys.checked_add(len as u64 - 1).ok_or(crosses.clone())?;

        let mut st = self.locked();
        let ri = st
            .ranges
            .find(gc_phys)
            .ok_or(PgmError::InvalidGCPhysicalAddress { gc_phys })?;
        if !st.ranges.get(ri).contains(last) {
            return Err(crosses);
        }

        let first_page = page_base(gc_phys);
        let pages: Vec<u64> = (0..=((page_base(last) - first_page) >> PAGE_SHIFT))
            .map(|i| first_page + (i << PAGE_SHIFT))
            .collect();

        let mut changed = false;
        for &page in &pages {
            let desc = st.ranges.get(ri).pages[st.ranges.get(ri).page_index(page)];
            if !desc.is_mappable() {
                return Err(PgmError::PageReserved { gc_phys: page });
            }
            if writable {
                changed |= self.make_writable_locked(&mut st, page)?;
            }
        }
        if changed {
            self.bump_generation();
        }

        // Every page must sit at consecutive indices of one chunk.
        let range = st.ranges.get(ri);
        let descs: Vec<_> = pages.iter().map(|&p| range.pages[range.page_index(p)]).collect();
        let first = descs[0];
        let zero = first.state == PageState::Zero || first.page_id.is_none();
        if zero && descs.len() > 1 {
            return Err(crosses);
        }
        if let Some(id) = first.page_id.filter(|_| !zero) {
            let contiguous = descs.iter().enumerate().all(|(i, d)| {
                d.page_id.is_some_and(|p| p.chunk == id.chunk && p.index == id.index + i as u32)
                    && d.state != PageState::Zero
            });
            if !contiguous {
                return Err(crosses);
            }
        }

        let (mapping, index) = match first.page_id {
            Some(id) if !zero => (st.chunks.lookup(id.chunk, self.host.as_ref())?, id.index),
            _ => (self.host.zero_page(), 0),
        };

        let mut counted = Vec::new();
        let mut chunk_refs = 0;
        if !mapping.is_zero_page() {
            for &page in &pages {
                let Some(desc) = st.ranges.page_mut(page) else {
                    continue;
                };
                if desc.state == PageState::Shared {
                    st.chunks.retain(mapping.id());
                    chunk_refs += 1;
                    continue;
                }
                match lock_step(desc.locks) {
                    LockStep::Counted(n) => {
                        desc.locks = n;
                        counted.push(page);
                        chunk_refs += 1;
                    }
                    LockStep::BecamePermanent => {
                        desc.locks = crate::verified::pgm::MAX_PAGE_LOCKS;
                        warn!("Page {:#x} is now permanently locked", page);
                    }
                    LockStep::Permanent => continue,
                }
                st.chunks.retain(mapping.id());
            }
        }
        let offset = mapping.page_offset(index) + page_offset(gc_phys);
        trace!("Locked {:#x}+{} (chunk {}, writable {})", gc_phys, len, mapping.id(), writable);
        Ok(PageMappingLock {
            pgm: self,
            gc_phys,
            len,
            writable: writable && !mapping.is_zero_page(),
            mapping,
            offset,
            counted,
            chunk_refs,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Read/write dispatch
// ═══════════════════════════════════════════════════════════════════════

impl Pgm {
    /// Read guest-physical memory through the caller's TLB. Never fails.
    pub fn phys_read(&self, tlb: &mut PhysTlb, gc_phys: u64, buf: &mut [u8]) {
        if buf.is_empty() {
            return;
        }
        if buf.len() <= RECENT_ACCESS_MAX && self.read_recent(tlb, gc_phys, buf) {
            return;
        }
        let small = buf.len() <= RECENT_ACCESS_MAX;
        let mut done = 0;
        while done < buf.len() {
            let addr = gc_phys.wrapping_add(done as u64);
            let n = self.read_step(tlb, addr, &mut buf[done..], small);
            debug_assert!(n >= 1, "read step made no progress at {addr:#x}");
            done += n.max(1);
        }
    }

    /// Write guest-physical memory through the caller's TLB. Never fails.
    pub fn phys_write(&self, tlb: &mut PhysTlb, gc_phys: u64, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if data.len() <= RECENT_ACCESS_MAX && self.write_recent(tlb, gc_phys, data) {
            return;
        }
        let small = data.len() <= RECENT_ACCESS_MAX;
        let mut grown: Option<u64> = None;
        let mut done = 0;
        while done < data.len() {
            let addr = gc_phys.wrapping_add(done as u64);
            done += self.write_step(tlb, addr, &data[done..], small, &mut grown);
        }
    }

    /// [`phys_read`](Self::phys_read) for callers without their own TLB.
    pub fn phys_read_any(&self, gc_phys: u64, buf: &mut [u8]) {
        let mut tlb = self.shared_tlb();
        self.phys_read(&mut tlb, gc_phys, buf);
    }

    /// [`phys_write`](Self::phys_write) for callers without their own TLB.
    pub fn phys_write_any(&self, gc_phys: u64, data: &[u8]) {
        let mut tlb = self.shared_tlb();
        self.phys_write(&mut tlb, gc_phys, data);
    }

    fn read_recent(&self, tlb: &mut PhysTlb, gc_phys: u64, buf: &mut [u8]) -> bool {
        let generation = self.generation();
        let ok = match &tlb.recent_read {
            Some(e) if e.key == page_base(gc_phys) && e.generation == generation && bytes_to_page_end(gc_phys) >= buf.len() => {
                e.read(gc_phys, buf).is_ok()
            }
            _ => false,
        };
        if ok {
            tlb.note_recent_hit();
        }
        ok
    }

    fn write_recent(&self, tlb: &mut PhysTlb, gc_phys: u64, data: &[u8]) -> bool {
        let generation = self.generation();
        let ok = match &tlb.recent_write {
            Some(e) if e.key == page_base(gc_phys) && e.generation == generation && bytes_to_page_end(gc_phys) >= data.len() => {
                e.write(gc_phys, data).is_ok()
            }
            _ => false,
        };
        if ok {
            tlb.note_recent_hit();
        }
        ok
    }

    /// Bytes from `addr` to the next range (or `len` if none comes first).
    fn gap_len(&self, addr: u64, len: usize) -> usize {
        match self.locked().ranges.next_start_after(addr) {
            Some(start) => clip_to_range(addr, len, start - 1),
            None => len,
        }
    }

    /// Resolve `addr`, distinguishing unassigned space from failures.
    fn resolve(&self, tlb: &mut PhysTlb, addr: u64) -> Result<PhysTlbEntry, PgmError> {
        self.query_tlbe(tlb, addr).cloned()
    }

    fn read_step(&self, tlb: &mut PhysTlb, addr: u64, buf: &mut [u8], small: bool) -> usize {
        let entry = match self.resolve(tlb, addr) {
            Ok(entry) => entry,
            Err(PgmError::InvalidGCPhysicalAddress { .. }) => {
                let n = self.gap_len(addr, buf.len());
                buf[..n].fill(0);
                self.note_unassigned_read(n);
                return n;
            }
            Err(e) => {
                let n = buf.len().min(bytes_to_page_end(addr));
                warn!("Read at {:#x} could not be resolved ({}), returning zeros", addr, e);
                buf[..n].fill(0);
                return n;
            }
        };
        let page = entry.page;
        let cb = buf.len().min(bytes_to_page_end(addr));

        if !page.is_backed() || page.is_reserved() {
            buf[..cb].fill(0);
            self.note_unassigned_read(cb);
            return cb;
        }
        if page.is_mmio() {
            self.mmio_read(addr, &mut buf[..cb]);
            return cb;
        }

        let (wants_phys, wants_virt) = (page.phys_intercepts_read(), page.virt_intercepts_read());
        let handler = wants_phys
            .then(|| self.physical_handler_at(addr))
            .flatten()
            .or_else(|| wants_virt.then(|| self.virtual_handler_at(addr)).flatten());
        let cb = match handler {
            Some(h) => {
                let n = clip_to_range(h.address, cb, h.last);
                let span = HostSpan::new(&entry.mapping, entry.host_offset(addr), n);
                if self.invoke(&h, addr, span, AccessBuf::Read(&mut buf[..n])) == HandlerAction::Handled {
                    return n;
                }
                n
            }
            None if wants_phys || wants_virt => self.clip_to_next_handler(addr, cb, wants_phys, wants_virt),
            None => cb,
        };

        if let Err(e) = entry.read(addr, &mut buf[..cb]) {
            warn!("Host read at {:#x} failed: {}", addr, e);
            buf[..cb].fill(0);
        } else if small && cb == buf.len() && page.flags.intersection(PageFlags::HANDLERS).is_empty() {
            tlb.recent_read = Some(entry);
        }
        cb
    }

    fn write_step(
        &self,
        tlb: &mut PhysTlb,
        addr: u64,
        data: &[u8],
        small: bool,
        grown: &mut Option<u64>,
    ) -> usize {
        let mut entry = match self.resolve(tlb, addr) {
            Ok(entry) => entry,
            Err(PgmError::InvalidGCPhysicalAddress { .. }) => {
                let n = self.gap_len(addr, data.len());
                trace!("Dropping {} byte write to unassigned {:#x}", n, addr);
                self.note_dropped_write(n);
                return n;
            }
            Err(e) => {
                let n = data.len().min(bytes_to_page_end(addr));
                warn!("Write at {:#x} could not be resolved ({}), dropped", addr, e);
                self.note_dropped_write(n);
                return n;
            }
        };
        let page = entry.page;
        let cb = data.len().min(bytes_to_page_end(addr));

        if !page.is_backed() {
            if *grown != Some(page_base(addr)) && self.is_dynamic(addr) {
                *grown = Some(page_base(addr));
                match self.grow_ram_range(addr) {
                    Ok(_) => return 0,
                    Err(e) => debug!("Growing dynamic range at {:#x} failed: {}", addr, e),
                }
            }
            self.note_dropped_write(cb);
            return cb;
        }
        if page.is_reserved() || page.is_rom() {
            trace!("Dropping {} byte write to reserved/ROM {:#x}", cb, addr);
            self.note_dropped_write(cb);
            return cb;
        }
        if page.is_mmio() {
            self.mmio_write(addr, &data[..cb]);
            return cb;
        }

        if page.state != PageState::Allocated {
            entry = match self.make_writable(addr).and_then(|_| self.resolve(tlb, addr)) {
                Ok(e) => e,
                Err(e) => {
                    warn!("Page {:#x} could not be made writable ({}), write dropped", addr, e);
                    self.note_dropped_write(cb);
                    return cb;
                }
            };
        }

        let phys = if page.phys_intercepts_write() { self.physical_handler_at(addr) } else { None };
        let virt = if page.virt_intercepts_write() { self.virtual_handler_at(addr) } else { None };
        let mut n = cb;
        if let Some(h) = &phys {
            n = clip_to_range(h.address, n, h.last);
        }
        if let Some(h) = &virt {
            n = clip_to_range(h.address, n, h.last);
        }
        let unclaimed_phys = phys.is_none() && page.phys_intercepts_write();
        let unclaimed_virt = virt.is_none() && page.virt_intercepts_write();
        if unclaimed_phys || unclaimed_virt {
            n = self.clip_to_next_handler(addr, n, unclaimed_phys, unclaimed_virt);
        }

        let mut action = HandlerAction::Default;
        if let Some(h) = &phys {
            let span = HostSpan::new(&entry.mapping, entry.host_offset(addr), n);
            action = self.invoke(h, addr, span, AccessBuf::Write(&data[..n]));
        }
        if let Some(h) = &virt {
            let span = HostSpan::new(&entry.mapping, entry.host_offset(addr), n);
            let virt_action = self.invoke(h, addr, span, AccessBuf::Write(&data[..n]));
            if action == HandlerAction::Default {
                action = virt_action;
            }
        }
        if action == HandlerAction::Handled {
            return n;
        }

        if let Err(e) = entry.write(addr, &data[..n]) {
            warn!("Host write at {:#x} failed: {}", addr, e);
            self.note_dropped_write(n);
        } else if small && n == data.len() && page.flags.intersection(PageFlags::HANDLERS).is_empty() {
            tlb.recent_write = Some(entry);
        }
        n
    }

    /// Shorten an access that no handler claims so it stops before the
    /// next handler on the page.
    fn clip_to_next_handler(&self, addr: u64, len: usize, phys: bool, virt: bool) -> usize {
        match self.next_handler_start(addr, phys, virt) {
            Some(start) => clip_to_range(addr, len, start - 1),
            None => len,
        }
    }

    fn is_dynamic(&self, addr: u64) -> bool {
        let st = self.locked();
        st.ranges
            .find(addr)
            .is_some_and(|i| st.ranges.get(i).kind == RamRangeKind::DynamicRam)
    }

    fn invoke(&self, h: &ResolvedHandler, gc_phys: u64, host: HostSpan<'_>, buf: AccessBuf<'_>) -> HandlerAction {
        let access = match buf {
            AccessBuf::Read(_) => AccessType::Read,
            AccessBuf::Write(_) => AccessType::Write,
        };
        let mut ctx = HandlerAccess {
            address: h.address,
            gc_phys,
            access,
            host,
            buf,
            token: h.token,
        };
        self.note_handler_call();
        h.handler.handle(&mut ctx)
    }

    fn mmio_read(&self, gc_phys: u64, buf: &mut [u8]) {
        self.note_mmio_fallback();
        let Some(mmio) = self.mmio() else {
            buf.fill(0);
            return;
        };
        let mut off = 0;
        for piece in buf.chunks_mut(MMIO_FALLBACK_MAX) {
            let addr = gc_phys + off as u64;
            if let Err(e) = mmio.mmio_read(addr, piece) {
                debug!("MMIO read at {:#x} failed: {}", addr, e);
                piece.fill(0);
            }
            off += piece.len();
        }
    }

    fn mmio_write(&self, gc_phys: u64, data: &[u8]) {
        self.note_mmio_fallback();
        let Some(mmio) = self.mmio() else {
            self.note_dropped_write(data.len());
            return;
        };
        let mut off = 0;
        for piece in data.chunks(MMIO_FALLBACK_MAX) {
            let addr = gc_phys + off as u64;
            if let Err(e) = mmio.mmio_write(addr, piece) {
                debug!("MMIO write at {:#x} failed: {}", addr, e);
                self.note_dropped_write(piece.len());
            }
            off += piece.len();
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Raw access
// ═══════════════════════════════════════════════════════════════════════

impl Pgm {
    /// Read guest memory directly, bypassing handlers and MMIO.
    ///
    /// # Errors
    ///
    /// [`PgmError::InvalidGCPhysicalAddress`] or [`PgmError::PageReserved`]
    /// for the first page that has no plain memory behind it.
    pub fn phys_read_raw(&self, gc_phys: u64, buf: &mut [u8]) -> Result<(), PgmError> {
        let mut tlb = self.shared_tlb();
        let mut done = 0;
        while done < buf.len() {
            let addr = gc_phys.wrapping_add(done as u64);
            let entry = self.query_tlbe(&mut tlb, addr)?;
            if !entry.page.is_mappable() {
                return Err(PgmError::PageReserved { gc_phys: addr });
            }
            let n = (buf.len() - done).min(bytes_to_page_end(addr));
            entry.read(addr, &mut buf[done..done + n])?;
            done += n;
        }
        Ok(())
    }

    /// Write guest memory directly, bypassing handlers and MMIO. ROM is
    /// writable this way; Zero and Shared pages are made private first.
    pub fn phys_write_raw(&self, gc_phys: u64, data: &[u8]) -> Result<(), PgmError> {
        let mut tlb = self.shared_tlb();
        let mut done = 0;
        while done < data.len() {
            let addr = gc_phys.wrapping_add(done as u64);
            let page = self.query_tlbe(&mut tlb, addr)?.page;
            if !page.is_mappable() {
                return Err(PgmError::PageReserved { gc_phys: addr });
            }
            if page.state != PageState::Allocated {
                self.make_writable(addr)?;
            }
            let entry = self.query_tlbe(&mut tlb, addr)?;
            let n = (data.len() - done).min(bytes_to_page_end(addr));
            entry.write(addr, &data[done..done + n])?;
            done += n;
        }
        Ok(())
    }
}

const _: () = assert!(RECENT_ACCESS_MAX as u64 <= PAGE_SIZE);
