//! Guest-physical RAM ranges.
//!
//! A VM's guest-physical address space is an ordered list of
//! non-overlapping [`RamRange`]s. Each range owns one [`PageDesc`] per
//! page. The shape of the list is fixed at VM setup; only dynamic ranges
//! change afterwards, and only by gaining backing for existing pages.

use super::page::{PageDesc, PageFlags};
use crate::verified::pgm::PAGE_SHIFT;

/// What a range is made of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RamRangeKind {
    /// Ordinary guest RAM; pages start as Zero.
    Ram,
    /// RAM whose pages get host backing on first write.
    DynamicRam,
    /// Emulated device registers; accesses go to the MMIO fallback.
    Mmio,
    /// Device-owned memory mapped into the guest.
    Mmio2,
    /// Read-only memory; guest writes are dropped.
    Rom,
    /// Holes that read as zero and swallow writes.
    Reserved,
}

impl RamRangeKind {
    /// Page flags every page of this kind starts with.
    pub fn page_flags(self) -> PageFlags {
        match self {
            Self::Ram | Self::DynamicRam => PageFlags::empty(),
            Self::Mmio => PageFlags::MMIO,
            Self::Mmio2 => PageFlags::MMIO | PageFlags::MMIO2,
            Self::Rom => PageFlags::ROM,
            Self::Reserved => PageFlags::RESERVED,
        }
    }

    /// Whether pages need host memory at registration time.
    pub fn preallocated(self) -> bool {
        matches!(self, Self::Mmio2 | Self::Rom)
    }
}

/// One contiguous guest-physical range.
#[derive(Debug, Clone)]
pub struct RamRange {
    pub gc_phys: u64,
    /// Inclusive last byte.
    pub last: u64,
    pub kind: RamRangeKind,
    pub desc: String,
    pub pages: Vec<PageDesc>,
}

impl RamRange {
    #[inline]
    pub fn contains(&self, gc_phys: u64) -> bool {
        gc_phys >= self.gc_phys && gc_phys <= self.last
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.last - self.gc_phys + 1
    }

    /// Index of the page holding `gc_phys`. Caller checks `contains`.
    #[inline]
    pub fn page_index(&self, gc_phys: u64) -> usize {
        debug_assert!(self.contains(gc_phys));
        ((gc_phys - self.gc_phys) >> PAGE_SHIFT) as usize
    }

    /// Guest-physical address of page `index`.
    #[inline]
    pub fn page_address(&self, index: usize) -> u64 {
        self.gc_phys + ((index as u64) << PAGE_SHIFT)
    }

    pub fn overlaps(&self, first: u64, last: u64) -> bool {
        first <= self.last && last >= self.gc_phys
    }
}

/// Public summary of a registered range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RamRangeInfo {
    pub gc_phys: u64,
    pub size: u64,
    pub kind: RamRangeKind,
    pub desc: String,
}

impl From<&RamRange> for RamRangeInfo {
    fn from(r: &RamRange) -> Self {
        Self {
            gc_phys: r.gc_phys,
            size: r.size(),
            kind: r.kind,
            desc: r.desc.clone(),
        }
    }
}

/// Ordered list of ranges.
#[derive(Debug, Default)]
pub(crate) struct RamRanges {
    ranges: Vec<RamRange>,
}

impl RamRanges {
    /// Index of the range containing `gc_phys`. The first range is
    /// checked before the walk since most accesses land in low RAM.
    pub(crate) fn find(&self, gc_phys: u64) -> Option<usize> {
        match self.ranges.first() {
            Some(first) if first.contains(gc_phys) => Some(0),
            _ => self.ranges.iter().position(|r| r.contains(gc_phys)),
        }
    }

    /// Start of the first range above `gc_phys`.
    pub(crate) fn next_start_after(&self, gc_phys: u64) -> Option<u64> {
        self.ranges.iter().map(|r| r.gc_phys).find(|&start| start > gc_phys)
    }

    /// Range overlapping `[first, last]`, if any.
    pub(crate) fn overlapping(&self, first: u64, last: u64) -> Option<&RamRange> {
        self.ranges.iter().find(|r| r.overlaps(first, last))
    }

    /// Insert keeping the list sorted. Caller has ruled out overlap.
    pub(crate) fn insert(&mut self, range: RamRange) {
        let at = self.ranges.partition_point(|r| r.gc_phys < range.gc_phys);
        self.ranges.insert(at, range);
    }

    pub(crate) fn get(&self, index: usize) -> &RamRange {
        &self.ranges[index]
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> &mut RamRange {
        &mut self.ranges[index]
    }

    pub(crate) fn page(&self, gc_phys: u64) -> Option<&PageDesc> {
        let r = &self.ranges[self.find(gc_phys)?];
        r.pages.get(r.page_index(gc_phys))
    }

    pub(crate) fn page_mut(&mut self, gc_phys: u64) -> Option<&mut PageDesc> {
        let i = self.find(gc_phys)?;
        let r = &mut self.ranges[i];
        let idx = r.page_index(gc_phys);
        r.pages.get_mut(idx)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &RamRange> {
        self.ranges.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(gc_phys: u64, pages: usize) -> RamRange {
        RamRange {
            gc_phys,
            last: gc_phys + ((pages as u64) << PAGE_SHIFT) - 1,
            kind: RamRangeKind::Ram,
            desc: format!("ram@{gc_phys:#x}"),
            pages: vec![PageDesc::zero(PageFlags::empty()); pages],
        }
    }

    #[test]
    fn ranges_stay_sorted_and_findable() {
        let mut rs = RamRanges::default();
        rs.insert(range(0x10_0000, 4));
        rs.insert(range(0, 2));
        rs.insert(range(0x8000, 1));
        let starts: Vec<u64> = rs.iter().map(|r| r.gc_phys).collect();
        assert_eq!(starts, vec![0, 0x8000, 0x10_0000]);
        assert_eq!(rs.find(0x1fff), Some(0));
        assert_eq!(rs.find(0x8abc), Some(1));
        assert_eq!(rs.find(0x2000), None, "gap between ranges");
    }

    #[test]
    fn next_start_skips_gap() {
        let mut rs = RamRanges::default();
        rs.insert(range(0, 1));
        rs.insert(range(0x4000, 1));
        assert_eq!(rs.next_start_after(0x1000), Some(0x4000));
        assert_eq!(rs.next_start_after(0x4000), None);
    }

    #[test]
    fn page_index_and_address_agree() {
        let r = range(0x10_0000, 4);
        assert_eq!(r.page_index(0x10_2fff), 2);
        assert_eq!(r.page_address(2), 0x10_2000);
        assert_eq!(r.size(), 0x4000);
        assert!(r.overlaps(0x10_3000, 0x20_0000));
        assert!(!r.overlaps(0x10_4000, 0x20_0000));
    }

    #[test]
    fn kinds_map_to_flags() {
        assert_eq!(RamRangeKind::Mmio2.page_flags(), PageFlags::MMIO | PageFlags::MMIO2);
        assert!(RamRangeKind::Rom.preallocated());
        assert!(!RamRangeKind::DynamicRam.preallocated());
    }
}
