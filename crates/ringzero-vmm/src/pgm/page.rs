//! Page descriptors and the page state machine.
//!
//! Every guest page owned by a RAM range has one [`PageDesc`]. The
//! descriptor records where the page lives on the host, what kind of
//! page it is, which access handlers watch it and how many host
//! mappings currently pin it.
//!
//! # States
//!
//! ```text
//!            write (copy-allocate, zero-filled)
//!   Zero ──────────────────────────────────────────┐
//!                                                  ▼
//!   Shared ──── write (copy-on-write) ──────► Allocated ◄──┐
//!                                                  │       │ write
//!                              arm write monitor   ▼       │ (sets `written`)
//!                                           WriteMonitored ┘
//! ```
//!
//! Zero pages that carry the MMIO or RESERVED flag can never become
//! writable; [`PageDesc::writable_transition`] reports
//! [`PgmError::PageReserved`] for them.

use bitflags::bitflags;

use super::PgmError;

/// Identifier of a host chunk.
pub type ChunkId = u32;

/// Chunk id that never names a real chunk (used by the shared zero page).
pub const NIL_CHUNK_ID: ChunkId = u32::MAX;

/// Host-physical address reported for the shared zero page.
pub const ZERO_PAGE_HC_PHYS: u64 = 0x0fff_f000;

/// Host identity of an allocated page: chunk plus index within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId {
    pub chunk: ChunkId,
    pub index: u32,
}

/// A freshly allocated host page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatedPage {
    pub id: PageId,
    pub hc_phys: u64,
}

/// Backing state of a guest page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageState {
    /// Reads as zeros from the shared zero page; no private backing.
    Zero,
    /// Backed by a deduplicated template page; copy-on-write.
    Shared,
    /// Private, writable backing.
    Allocated,
    /// Private backing with write monitoring armed.
    WriteMonitored,
}

bitflags! {
    /// Page type and access-handler presence bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PageFlags: u16 {
        const MMIO               = 1 << 0;
        const ROM                = 1 << 1;
        const RESERVED           = 1 << 2;
        const MMIO2              = 1 << 3;
        const PHYS_HANDLER_WRITE = 1 << 4;
        const PHYS_HANDLER_ALL   = 1 << 5;
        const VIRT_HANDLER_WRITE = 1 << 6;
        const VIRT_HANDLER_ALL   = 1 << 7;
    }
}

impl PageFlags {
    /// All handler-presence bits.
    pub const HANDLERS: Self = Self::PHYS_HANDLER_WRITE
        .union(Self::PHYS_HANDLER_ALL)
        .union(Self::VIRT_HANDLER_WRITE)
        .union(Self::VIRT_HANDLER_ALL);
}

/// What [`PageDesc::writable_transition`] requires the caller to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritableTransition {
    /// Page was already Allocated.
    AlreadyWritable,
    /// Write monitoring was disarmed in place; `written` is now set.
    Unmonitored,
    /// A private page must be allocated and installed. `copy_from` names
    /// the shared template to copy, or `None` for a zero-filled page.
    Allocate { copy_from: Option<PageId> },
}

/// Per-page descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageDesc {
    /// Host-physical address; `0` means the page has no backing yet.
    pub hc_phys: u64,
    /// Host page backing this guest page (template page when Shared).
    pub page_id: Option<PageId>,
    pub state: PageState,
    pub flags: PageFlags,
    /// Host mapping locks; saturates at
    /// [`MAX_PAGE_LOCKS`](crate::verified::pgm::MAX_PAGE_LOCKS).
    pub locks: u16,
    /// Set when a write-monitored page is written to.
    pub written: bool,
}

impl PageDesc {
    /// A page reading as zeros from the shared zero page.
    pub fn zero(flags: PageFlags) -> Self {
        Self {
            hc_phys: ZERO_PAGE_HC_PHYS,
            page_id: None,
            state: PageState::Zero,
            flags,
            locks: 0,
            written: false,
        }
    }

    /// A page inside a dynamic range that has not been grown yet.
    pub fn unbacked() -> Self {
        Self { hc_phys: 0, ..Self::zero(PageFlags::empty()) }
    }

    /// A private page already holding host memory.
    pub fn allocated(page: AllocatedPage, flags: PageFlags) -> Self {
        Self {
            hc_phys: page.hc_phys,
            page_id: Some(page.id),
            state: PageState::Allocated,
            flags,
            locks: 0,
            written: false,
        }
    }

    #[inline]
    pub fn is_backed(&self) -> bool {
        self.hc_phys != 0
    }

    /// Plain MMIO (not device-owned MMIO2 memory).
    #[inline]
    pub fn is_mmio(&self) -> bool {
        self.flags.contains(PageFlags::MMIO) && !self.flags.contains(PageFlags::MMIO2)
    }

    /// Reserved and not shadowed by ROM or MMIO2.
    #[inline]
    pub fn is_reserved(&self) -> bool {
        self.flags.contains(PageFlags::RESERVED)
            && !self.flags.intersects(PageFlags::ROM | PageFlags::MMIO2)
    }

    /// ROM without an MMIO2 shadow.
    #[inline]
    pub fn is_rom(&self) -> bool {
        self.flags.contains(PageFlags::ROM) && !self.flags.contains(PageFlags::MMIO2)
    }

    /// Whether a host mapping of this page may be handed out.
    #[inline]
    pub fn is_mappable(&self) -> bool {
        self.is_backed() && !self.is_reserved() && !self.is_mmio()
    }

    #[inline]
    pub fn phys_intercepts_read(&self) -> bool {
        self.flags.contains(PageFlags::PHYS_HANDLER_ALL)
    }

    #[inline]
    pub fn phys_intercepts_write(&self) -> bool {
        self.flags.intersects(PageFlags::PHYS_HANDLER_WRITE | PageFlags::PHYS_HANDLER_ALL)
    }

    #[inline]
    pub fn virt_intercepts_read(&self) -> bool {
        self.flags.contains(PageFlags::VIRT_HANDLER_ALL)
    }

    #[inline]
    pub fn virt_intercepts_write(&self) -> bool {
        self.flags.intersects(PageFlags::VIRT_HANDLER_WRITE | PageFlags::VIRT_HANDLER_ALL)
    }

    /// Work out what it takes to make this page writable.
    ///
    /// WriteMonitored pages are disarmed here; allocation is left to the
    /// caller, which must finish with [`install`](Self::install).
    pub fn writable_transition(&mut self, gc_phys: u64) -> Result<WritableTransition, PgmError> {
        match self.state {
            PageState::Allocated => Ok(WritableTransition::AlreadyWritable),
            PageState::WriteMonitored => {
                self.written = true;
                self.state = PageState::Allocated;
                Ok(WritableTransition::Unmonitored)
            }
            PageState::Zero => {
                if self.flags.intersects(PageFlags::MMIO | PageFlags::RESERVED) || !self.is_backed() {
                    return Err(PgmError::PageReserved { gc_phys });
                }
                Ok(WritableTransition::Allocate { copy_from: None })
            }
            PageState::Shared => Ok(WritableTransition::Allocate { copy_from: self.page_id }),
        }
    }

    /// Install a freshly allocated private page.
    pub fn install(&mut self, page: AllocatedPage) {
        debug_assert!(self.locks == 0, "cannot replace a locked page");
        self.hc_phys = page.hc_phys;
        self.page_id = Some(page.id);
        self.state = PageState::Allocated;
    }
}
