//! Shared fixtures for memory-engine tests.

use std::sync::{Arc, Mutex};

use super::backing::{HostMemoryConfig, MmapHostMemory};
use super::handler::{AccessBuf, AccessHandler, AccessType, HandlerAccess, HandlerAction};
use super::ram::RamRangeKind;
use super::{Pgm, PgmConfig};
use crate::verified::pgm::PAGE_SHIFT;

pub(crate) fn host(pages_per_chunk: u32, max_pages: Option<u64>) -> Arc<MmapHostMemory> {
    Arc::new(MmapHostMemory::new(HostMemoryConfig { pages_per_chunk, max_pages }).unwrap())
}

/// Engine with one RAM range named "ram" of `pages` pages at `base`.
pub(crate) fn pgm_with_ram(base: u64, pages: u64, pages_per_chunk: u32) -> (Pgm, Arc<MmapHostMemory>) {
    let h = host(pages_per_chunk, None);
    let pgm = Pgm::new(PgmConfig::default(), h.clone());
    pgm.register_ram_range(base, pages << PAGE_SHIFT, RamRangeKind::Ram, "ram")
        .unwrap();
    (pgm, h)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Call {
    pub address: u64,
    pub gc_phys: u64,
    pub len: usize,
    pub token: u64,
    pub access: AccessType,
    /// Bytes written by the guest (empty for reads).
    pub data: Vec<u8>,
}

/// Access handler that records every call.
pub(crate) struct Recorder {
    calls: Mutex<Vec<Call>>,
    /// Fill byte for reads when handling; `None` passes through.
    fill: Option<u8>,
}

impl Recorder {
    /// Completes every access itself, reading back `fill`.
    pub(crate) fn handling(fill: u8) -> Self {
        Self { calls: Mutex::new(Vec::new()), fill: Some(fill) }
    }

    /// Lets every access through to memory.
    pub(crate) fn passthrough() -> Self {
        Self { calls: Mutex::new(Vec::new()), fill: None }
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

impl AccessHandler for Recorder {
    fn handle(&self, access: &mut HandlerAccess<'_>) -> HandlerAction {
        let data = match &access.buf {
            AccessBuf::Write(d) => d.to_vec(),
            AccessBuf::Read(_) => Vec::new(),
        };
        self.calls.lock().unwrap().push(Call {
            address: access.address,
            gc_phys: access.gc_phys,
            len: access.buf.len(),
            token: access.token,
            access: access.access,
            data,
        });
        match (self.fill, &mut access.buf) {
            (Some(fill), AccessBuf::Read(buf)) => {
                buf.fill(fill);
                HandlerAction::Handled
            }
            (Some(_), AccessBuf::Write(_)) => HandlerAction::Handled,
            (None, _) => HandlerAction::Default,
        }
    }
}
