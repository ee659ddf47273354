//! Virtual CPU run state, force flags and halt bookkeeping.
//!
//! Everything here is touched from more than one thread: the EMT owns the
//! VCPU, but device threads raise force flags and other EMTs read the
//! published host CPU to route wake-ups. All shared fields are atomics.
//!
//! # Force flags
//!
//! | Set                 | Scope    | Typical producers                        |
//! |---------------------|----------|------------------------------------------|
//! | [`VmForceFlags`]    | VM-wide  | timers, DMA, debugger, reset, rendezvous |
//! | [`VCpuForceFlags`]  | one VCPU | interrupt controllers, TLB sync, ring-3  |
//!
//! The halt path uses the `HALT_TO_RING3` masks to decide whether ring-3
//! has work pending, and [`VCpuForceFlags::HALT_WAKE`] to decide whether
//! the guest has something to wake up for.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Mutex, PoisonError};

use bitflags::bitflags;

use crate::host::{ContextHookHandle, HostCpu, PreemptState};

// ═══════════════════════════════════════════════════════════════════════
//  Force flags
// ═══════════════════════════════════════════════════════════════════════

bitflags! {
    /// VM-wide pending work.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VmForceFlags: u64 {
        const TM_VIRTUAL_SYNC      = 1 << 0;
        const PDM_QUEUES           = 1 << 1;
        const PDM_DMA              = 1 << 2;
        const DBGF                 = 1 << 3;
        const REQUEST              = 1 << 4;
        const CHECK_VM_STATE       = 1 << 5;
        const RESET                = 1 << 6;
        const EMT_RENDEZVOUS       = 1 << 7;
        const PGM_NEED_HANDY_PAGES = 1 << 8;
        const PGM_NO_MEMORY        = 1 << 9;
        const DEBUG_SUSPEND        = 1 << 10;

        /// Anything here makes a halting VCPU return to ring-3.
        const HALT_TO_RING3 = Self::TM_VIRTUAL_SYNC.bits()
            | Self::PDM_QUEUES.bits()
            | Self::PDM_DMA.bits()
            | Self::DBGF.bits()
            | Self::REQUEST.bits()
            | Self::CHECK_VM_STATE.bits()
            | Self::RESET.bits()
            | Self::EMT_RENDEZVOUS.bits()
            | Self::PGM_NEED_HANDY_PAGES.bits()
            | Self::PGM_NO_MEMORY.bits()
            | Self::DEBUG_SUSPEND.bits();
    }
}

bitflags! {
    /// Per-VCPU pending work.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VCpuForceFlags: u64 {
        const INTERRUPT_APIC          = 1 << 0;
        const INTERRUPT_PIC           = 1 << 1;
        const INTERRUPT_NMI           = 1 << 2;
        const INTERRUPT_SMI           = 1 << 3;
        const INTERRUPT_NESTED_GUEST  = 1 << 4;
        /// Another VCPU asked this one to leave the halted state.
        const UNHALT                  = 1 << 5;
        /// The APIC must fold newly posted interrupts into its IRR.
        const UPDATE_APIC             = 1 << 6;
        const TIMER                   = 1 << 7;
        const PDM_CRITSECT            = 1 << 8;
        const IEM                     = 1 << 9;
        const REQUEST                 = 1 << 10;
        const DBGF                    = 1 << 11;
        const HM_UPDATE_CR3           = 1 << 12;
        const HM_UPDATE_PAE_PDPES     = 1 << 13;
        const PGM_SYNC_CR3            = 1 << 14;
        const PGM_SYNC_CR3_NON_GLOBAL = 1 << 15;
        const TO_R3                   = 1 << 16;
        const IOM                     = 1 << 17;

        /// Anything here makes a halting VCPU return to ring-3.
        const HALT_TO_RING3 = Self::TIMER.bits()
            | Self::PDM_CRITSECT.bits()
            | Self::IEM.bits()
            | Self::REQUEST.bits()
            | Self::DBGF.bits()
            | Self::HM_UPDATE_CR3.bits()
            | Self::HM_UPDATE_PAE_PDPES.bits()
            | Self::PGM_SYNC_CR3.bits()
            | Self::PGM_SYNC_CR3_NON_GLOBAL.bits()
            | Self::TO_R3.bits()
            | Self::IOM.bits();

        /// Sources that end a halt.
        const HALT_WAKE = Self::INTERRUPT_APIC.bits()
            | Self::INTERRUPT_PIC.bits()
            | Self::INTERRUPT_NESTED_GUEST.bits()
            | Self::INTERRUPT_NMI.bits()
            | Self::INTERRUPT_SMI.bits()
            | Self::UNHALT.bits();
    }
}

/// A force-flag set that many threads update concurrently.
///
/// All operations are sequentially consistent; the halt path's
/// check-set-recheck depends on it.
pub struct AtomicForceFlags<F> {
    bits: AtomicU64,
    _flags: PhantomData<fn() -> F>,
}

impl<F: bitflags::Flags<Bits = u64>> AtomicForceFlags<F> {
    pub fn new() -> Self {
        Self { bits: AtomicU64::new(0), _flags: PhantomData }
    }

    pub fn set(&self, flags: F) {
        self.bits.fetch_or(flags.bits(), Ordering::SeqCst);
    }

    pub fn clear(&self, flags: F) {
        self.bits.fetch_and(!flags.bits(), Ordering::SeqCst);
    }

    pub fn load(&self) -> F {
        F::from_bits_retain(self.bits.load(Ordering::SeqCst))
    }

    #[inline]
    pub fn is_any_set(&self, flags: F) -> bool {
        self.bits.load(Ordering::SeqCst) & flags.bits() != 0
    }

    /// Clear `flags` and report whether any of them were set.
    #[inline]
    pub fn test_and_clear(&self, flags: F) -> bool {
        self.bits.fetch_and(!flags.bits(), Ordering::SeqCst) & flags.bits() != 0
    }
}

impl<F: bitflags::Flags<Bits = u64>> Default for AtomicForceFlags<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: bitflags::Flags<Bits = u64> + fmt::Debug> fmt::Debug for AtomicForceFlags<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.load(), f)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Run state
// ═══════════════════════════════════════════════════════════════════════

/// Where a started VCPU is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum VCpuState {
    /// On its EMT, outside guest code.
    Started = 0,
    /// Inside backend context running guest code.
    StartedHm = 1,
    /// Blocked in the ring-0 halt wait.
    StartedHalted = 2,
}

impl VCpuState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::StartedHm,
            2 => Self::StartedHalted,
            _ => Self::Started,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Halt statistics
// ═══════════════════════════════════════════════════════════════════════

/// Counted outcomes of the ring-0 halt path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HaltEvent {
    /// Resumed guest execution from ring-0.
    Exec,
    ExecFromSpin,
    ExecFromBlock,
    /// Returned to ring-3 (every reason).
    ToRing3,
    ToRing3FromSpin,
    ToRing3SmallDelta,
    ToRing3PendingFf,
    ToRing3PostNoInt,
    ToRing3PostPendingFf,
    ToRing3Other,
    /// Blocked in the host scheduler (nanoseconds = time blocked).
    Block,
    /// Woke more than the slack after the deadline (ns = lateness).
    BlockOverslept,
    /// Woke more than the slack before the deadline (ns = time blocked).
    BlockInsomnia,
    BlockOnTime,
}

impl HaltEvent {
    pub const COUNT: usize = 14;

    pub const ALL: [HaltEvent; Self::COUNT] = [
        Self::Exec,
        Self::ExecFromSpin,
        Self::ExecFromBlock,
        Self::ToRing3,
        Self::ToRing3FromSpin,
        Self::ToRing3SmallDelta,
        Self::ToRing3PendingFf,
        Self::ToRing3PostNoInt,
        Self::ToRing3PostPendingFf,
        Self::ToRing3Other,
        Self::Block,
        Self::BlockOverslept,
        Self::BlockInsomnia,
        Self::BlockOnTime,
    ];

    #[inline]
    fn index(self) -> usize {
        self as usize
    }
}

/// Snapshot of a VCPU's halt counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HaltStats {
    counts: [u64; HaltEvent::COUNT],
    nanos: [u64; HaltEvent::COUNT],
}

impl HaltStats {
    pub fn count(&self, event: HaltEvent) -> u64 {
        self.counts[event.index()]
    }

    /// Accumulated nanoseconds for the timed events.
    pub fn nanos(&self, event: HaltEvent) -> u64 {
        self.nanos[event.index()]
    }
}

#[derive(Debug, Default)]
struct HaltCounters {
    counts: [AtomicU64; HaltEvent::COUNT],
    nanos: [AtomicU64; HaltEvent::COUNT],
}

/// Rolling history driving the spin heuristic. Only the EMT writes it.
#[derive(Debug, Default)]
struct HaltHistory {
    halts: AtomicU32,
    succeeded: AtomicU32,
    to_ring3: AtomicU32,
}

// ═══════════════════════════════════════════════════════════════════════
//  VCPU
// ═══════════════════════════════════════════════════════════════════════

/// Host CPU id meaning "not running anywhere".
pub const NIL_HOST_CPU: u32 = u32::MAX;

/// One virtual CPU.
pub struct VCpu {
    id: u32,
    state: AtomicU8,
    /// Per-VCPU force flags.
    pub ff: AtomicForceFlags<VCpuForceFlags>,
    host_cpu_id: AtomicU32,
    host_cpu_set_index: AtomicU32,
    may_halt_in_ring0: AtomicBool,
    in_backend_ctx: AtomicBool,
    ctx_hook: Mutex<Option<ContextHookHandle>>,
    entry_preempt: Mutex<Option<PreemptState>>,
    history: HaltHistory,
    stats: HaltCounters,
}

impl VCpu {
    pub fn new(id: u32, may_halt_in_ring0: bool) -> Self {
        Self {
            id,
            state: AtomicU8::new(VCpuState::Started as u8),
            ff: AtomicForceFlags::new(),
            host_cpu_id: AtomicU32::new(NIL_HOST_CPU),
            host_cpu_set_index: AtomicU32::new(NIL_HOST_CPU),
            may_halt_in_ring0: AtomicBool::new(may_halt_in_ring0),
            in_backend_ctx: AtomicBool::new(false),
            ctx_hook: Mutex::new(None),
            entry_preempt: Mutex::new(None),
            history: HaltHistory::default(),
            stats: HaltCounters::default(),
        }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    // ─── Run state ───────────────────────────────────────────────

    pub fn state(&self) -> VCpuState {
        VCpuState::from_raw(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: VCpuState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Move to `new` only if currently `expected`.
    pub fn cmpxchg_state(&self, new: VCpuState, expected: VCpuState) -> bool {
        self.state
            .compare_exchange(expected as u8, new as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn may_halt_in_ring0(&self) -> bool {
        self.may_halt_in_ring0.load(Ordering::Relaxed)
    }

    pub fn set_may_halt_in_ring0(&self, allowed: bool) {
        self.may_halt_in_ring0.store(allowed, Ordering::Relaxed);
    }

    pub fn in_backend_ctx(&self) -> bool {
        self.in_backend_ctx.load(Ordering::Acquire)
    }

    pub(crate) fn set_in_backend_ctx(&self, inside: bool) {
        self.in_backend_ctx.store(inside, Ordering::Release);
    }

    // ─── Host CPU mapping ────────────────────────────────────────

    /// Host CPU this VCPU is currently published on.
    pub fn host_cpu(&self) -> Option<HostCpu> {
        let id = self.host_cpu_id.load(Ordering::SeqCst);
        if id == NIL_HOST_CPU {
            return None;
        }
        Some(HostCpu { id, set_index: self.host_cpu_set_index.load(Ordering::SeqCst) })
    }

    pub(crate) fn set_host_cpu(&self, cpu: Option<HostCpu>) {
        match cpu {
            Some(cpu) => {
                self.host_cpu_set_index.store(cpu.set_index, Ordering::SeqCst);
                self.host_cpu_id.store(cpu.id, Ordering::SeqCst);
            }
            None => {
                self.host_cpu_set_index.store(NIL_HOST_CPU, Ordering::SeqCst);
                self.host_cpu_id.store(NIL_HOST_CPU, Ordering::SeqCst);
            }
        }
    }

    // ─── Context hook and entry preemption state ─────────────────

    pub fn ctx_hook(&self) -> Option<ContextHookHandle> {
        *self.ctx_hook.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_ctx_hook(&self, hook: Option<ContextHookHandle>) {
        *self.ctx_hook.lock().unwrap_or_else(PoisonError::into_inner) = hook;
    }

    pub(crate) fn take_ctx_hook(&self) -> Option<ContextHookHandle> {
        self.ctx_hook.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Preemption state saved by the entry dispatcher while it runs with
    /// preemption disabled.
    pub(crate) fn entry_preempt(&self) -> Option<PreemptState> {
        *self.entry_preempt.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn stash_entry_preempt(&self, state: PreemptState) {
        *self.entry_preempt.lock().unwrap_or_else(PoisonError::into_inner) = Some(state);
    }

    pub(crate) fn take_entry_preempt(&self) -> Option<PreemptState> {
        self.entry_preempt.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    // ─── Halt history and statistics ─────────────────────────────

    /// Bump the halt count; returns (halts, succeeded, to_ring3).
    pub(crate) fn note_halt(&self) -> (u32, u32, u32) {
        let halts = self.history.halts.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        (
            halts,
            self.history.succeeded.load(Ordering::Relaxed),
            self.history.to_ring3.load(Ordering::Relaxed),
        )
    }

    pub(crate) fn reset_halt_history(&self, succeeded: u32, to_ring3: u32) {
        self.history.succeeded.store(succeeded, Ordering::Relaxed);
        self.history.to_ring3.store(to_ring3, Ordering::Relaxed);
    }

    pub(crate) fn note_halt_succeeded(&self) {
        self.history.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_halt_to_ring3(&self) {
        self.history.to_ring3.fetch_add(1, Ordering::Relaxed);
    }

    /// (succeeded, to_ring3) of the current history window.
    pub fn halt_history(&self) -> (u32, u32) {
        (
            self.history.succeeded.load(Ordering::Relaxed),
            self.history.to_ring3.load(Ordering::Relaxed),
        )
    }

    pub(crate) fn record(&self, event: HaltEvent) {
        self.stats.counts[event.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timed(&self, event: HaltEvent, nanos: u64) {
        self.record(event);
        self.stats.nanos[event.index()].fetch_add(nanos, Ordering::Relaxed);
    }

    pub fn halt_stats(&self) -> HaltStats {
        let mut snapshot = HaltStats::default();
        for event in HaltEvent::ALL {
            let i = event.index();
            snapshot.counts[i] = self.stats.counts[i].load(Ordering::Relaxed);
            snapshot.nanos[i] = self.stats.nanos[i].load(Ordering::Relaxed);
        }
        snapshot
    }
}

impl fmt::Debug for VCpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VCpu")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("ff", &self.ff)
            .field("host_cpu", &self.host_cpu())
            .field("in_backend_ctx", &self.in_backend_ctx())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_and_clear_reports_previous_bits() {
        let ff = AtomicForceFlags::<VCpuForceFlags>::new();
        ff.set(VCpuForceFlags::UPDATE_APIC | VCpuForceFlags::TIMER);
        assert!(ff.test_and_clear(VCpuForceFlags::UPDATE_APIC));
        assert!(!ff.test_and_clear(VCpuForceFlags::UPDATE_APIC));
        assert_eq!(ff.load(), VCpuForceFlags::TIMER);
        assert!(ff.is_any_set(VCpuForceFlags::HALT_TO_RING3));
        assert!(!ff.is_any_set(VCpuForceFlags::HALT_WAKE));
    }

    #[test]
    fn wake_and_ring3_masks_are_disjoint() {
        assert!(!VCpuForceFlags::HALT_WAKE.intersects(VCpuForceFlags::HALT_TO_RING3));
        assert!(VmForceFlags::HALT_TO_RING3.contains(VmForceFlags::RESET));
    }

    #[test]
    fn cmpxchg_only_moves_from_expected_state() {
        let vcpu = VCpu::new(0, true);
        assert!(vcpu.cmpxchg_state(VCpuState::StartedHalted, VCpuState::Started));
        assert!(!vcpu.cmpxchg_state(VCpuState::StartedHalted, VCpuState::Started));
        assert_eq!(vcpu.state(), VCpuState::StartedHalted);
        assert!(vcpu.cmpxchg_state(VCpuState::Started, VCpuState::StartedHalted));
    }

    #[test]
    fn host_cpu_publish_and_clear() {
        let vcpu = VCpu::new(3, false);
        assert_eq!(vcpu.host_cpu(), None);
        vcpu.set_host_cpu(Some(HostCpu { id: 7, set_index: 2 }));
        assert_eq!(vcpu.host_cpu(), Some(HostCpu { id: 7, set_index: 2 }));
        vcpu.set_host_cpu(None);
        assert_eq!(vcpu.host_cpu(), None);
    }

    #[test]
    fn timed_events_accumulate() {
        let vcpu = VCpu::new(0, true);
        vcpu.record_timed(HaltEvent::Block, 100);
        vcpu.record_timed(HaltEvent::Block, 50);
        vcpu.record(HaltEvent::Exec);
        let stats = vcpu.halt_stats();
        assert_eq!(stats.count(HaltEvent::Block), 2);
        assert_eq!(stats.nanos(HaltEvent::Block), 150);
        assert_eq!(stats.count(HaltEvent::Exec), 1);
        assert_eq!(stats.count(HaltEvent::ToRing3), 0);
    }
}
