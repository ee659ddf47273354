//! Host kernel services the scheduling engine depends on.
//!
//! The ring-0 runtime never talks to the host kernel directly. Preemption
//! control, CPU identification, TSC-delta bookkeeping, thread-context
//! hooks and the halt wait queue all go through [`HostScheduler`], so the
//! same engine runs against a real host ([`StdHost`]) or a scripted one
//! in tests.
//!
//! # Preemption model
//!
//! ```text
//!   disable_preemption() ──► PreemptState { depth_before }
//!          │                     (saved by the caller)
//!          ▼
//!   ... pinned to current_cpu() ...
//!          │
//!   restore_preemption(state) ──► depth back to depth_before
//! ```
//!
//! Disabling nests; restoring returns to the exact depth observed at the
//! matching disable, so an early restore followed by a later one is
//! harmless.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use log::{debug, trace};
use thiserror::Error;

/// Size of the host CPU set; set indices at or above this are invalid.
pub const MAX_HOST_CPUS: u32 = 256;

/// A host CPU as seen at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostCpu {
    /// Host-assigned CPU id.
    pub id: u32,
    /// Dense index into the host CPU set.
    pub set_index: u32,
}

/// Opaque token returned by [`HostScheduler::disable_preemption`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreemptState {
    pub depth_before: u32,
}

/// Handle to a host thread-context hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextHookHandle(pub u64);

/// Host scheduling events delivered through a context hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadCtxEvent {
    /// The EMT is about to run again, possibly on another CPU.
    ScheduledIn,
    /// The EMT is being descheduled.
    ScheduledOut,
}

/// How a halt wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockResult {
    /// Poked by another thread.
    Woken,
    /// Deadline reached.
    TimedOut,
    /// Cut short by a host-side interruption (signal, suspend).
    Interrupted,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("Host does not support thread-context hooks")]
    HooksUnsupported,

    #[error("Unknown context hook {0:?}")]
    UnknownHook(ContextHookHandle),

    #[error("Host CPU set index {index} out of range")]
    InvalidCpuIndex { index: u32 },

    #[error("TSC delta measurement failed on host CPU {cpu}: {reason}")]
    TscMeasurement { cpu: u32, reason: String },

    #[error("Halt wait failed for vCPU {vcpu}: {reason}")]
    Block { vcpu: u32, reason: String },

    #[error("vCPU {vcpu} cannot block: {reason}")]
    CannotBlock { vcpu: u32, reason: &'static str },
}

/// Host kernel services used by the scheduling engine.
///
/// Implementations must be callable from any EMT concurrently.
pub trait HostScheduler: Send + Sync {
    // ─── Preemption and CPU identity ─────────────────────────────

    fn disable_preemption(&self) -> PreemptState;
    fn restore_preemption(&self, state: PreemptState);
    fn is_preemption_enabled(&self) -> bool;
    /// CPU the caller runs on. Only stable while preemption is disabled.
    fn current_cpu(&self) -> HostCpu;
    fn online_cpu_count(&self) -> u32;

    // ─── Timekeeping ─────────────────────────────────────────────

    /// Whether the TSC offset of `cpu` relative to the reference CPU is known.
    fn tsc_delta_available(&self, cpu: HostCpu) -> bool;
    fn measure_tsc_delta(&self, cpu: HostCpu) -> Result<(), HostError>;
    /// Monotonic nanoseconds.
    fn now_ns(&self) -> u64;
    /// Retune the periodic preemption timer of `cpu` to `hz`.
    fn update_preemption_timer(&self, cpu: HostCpu, hz: u32);

    // ─── Thread-context hooks ────────────────────────────────────

    /// `Ok(None)` when the host has no hook support.
    fn create_context_hook(&self, vcpu: u32) -> Result<Option<ContextHookHandle>, HostError>;
    fn destroy_context_hook(&self, hook: ContextHookHandle) -> Result<(), HostError>;
    fn enable_context_hook(&self, hook: ContextHookHandle) -> Result<(), HostError>;
    fn disable_context_hook(&self, hook: ContextHookHandle) -> Result<(), HostError>;
    fn is_context_hook_enabled(&self, hook: ContextHookHandle) -> bool;

    // ─── Halt wait queue ─────────────────────────────────────────

    /// Sleep until poked, `deadline_ns` passes, or the host interrupts.
    fn block_until(&self, vcpu: u32, deadline_ns: u64) -> Result<BlockResult, HostError>;
    /// Wake `vcpu` from [`block_until`](Self::block_until). A poke that
    /// arrives before the block is latched.
    fn poke(&self, vcpu: u32);
    /// The host wants every EMT out of ring-0 (suspend, power event).
    fn suspend_pending(&self) -> bool;

    /// Spin-wait hint.
    fn pause(&self) {
        std::hint::spin_loop();
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  StdHost
// ═══════════════════════════════════════════════════════════════════════

thread_local! {
    static PREEMPT_DEPTH: Cell<u32> = const { Cell::new(0) };
}

#[derive(Debug, Default)]
struct WaitSlot {
    poked: Mutex<bool>,
    cv: Condvar,
}

/// [`HostScheduler`] on top of ordinary user-space threads.
///
/// Preemption "disabling" is bookkeeping only (a per-thread depth); the
/// OS may still migrate the thread. There are no context hooks, every
/// CPU counts as TSC-synchronised, and the halt wait is a condvar.
#[derive(Debug)]
pub struct StdHost {
    epoch: Instant,
    online: u32,
    slots: Mutex<HashMap<u32, Arc<WaitSlot>>>,
    suspend: AtomicBool,
}

impl StdHost {
    pub fn new() -> Self {
        let online = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        Self {
            epoch: Instant::now(),
            online,
            slots: Mutex::new(HashMap::new()),
            suspend: AtomicBool::new(false),
        }
    }

    fn slot(&self, vcpu: u32) -> Arc<WaitSlot> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(vcpu)
            .or_default()
            .clone()
    }

    /// Raise or drop the host suspend request; raising wakes every waiter.
    pub fn set_suspend_pending(&self, pending: bool) {
        self.suspend.store(pending, Ordering::SeqCst);
        if pending {
            let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            for slot in slots.values() {
                // Serialise with a waiter between its flag check and wait.
                drop(slot.poked.lock().unwrap_or_else(PoisonError::into_inner));
                slot.cv.notify_all();
            }
        }
    }
}

impl Default for StdHost {
    fn default() -> Self {
        Self::new()
    }
}

impl HostScheduler for StdHost {
    fn disable_preemption(&self) -> PreemptState {
        PREEMPT_DEPTH.with(|d| {
            let before = d.get();
            d.set(before + 1);
            PreemptState { depth_before: before }
        })
    }

    fn restore_preemption(&self, state: PreemptState) {
        PREEMPT_DEPTH.with(|d| d.set(state.depth_before));
    }

    fn is_preemption_enabled(&self) -> bool {
        PREEMPT_DEPTH.with(|d| d.get() == 0)
    }

    fn current_cpu(&self) -> HostCpu {
        // SAFETY: sched_getcpu takes no arguments and only reads the
        // calling thread's scheduler state.
        let raw = unsafe { libc::sched_getcpu() };
        let id = u32::try_from(raw).unwrap_or(0);
        HostCpu { id, set_index: id }
    }

    fn online_cpu_count(&self) -> u32 {
        self.online
    }

    fn tsc_delta_available(&self, _cpu: HostCpu) -> bool {
        true
    }

    fn measure_tsc_delta(&self, _cpu: HostCpu) -> Result<(), HostError> {
        Ok(())
    }

    fn now_ns(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    fn update_preemption_timer(&self, cpu: HostCpu, hz: u32) {
        trace!("preemption timer cpu {} -> {hz} Hz (no-op)", cpu.id);
    }

    fn create_context_hook(&self, _vcpu: u32) -> Result<Option<ContextHookHandle>, HostError> {
        Ok(None)
    }

    fn destroy_context_hook(&self, hook: ContextHookHandle) -> Result<(), HostError> {
        Err(HostError::UnknownHook(hook))
    }

    fn enable_context_hook(&self, hook: ContextHookHandle) -> Result<(), HostError> {
        Err(HostError::UnknownHook(hook))
    }

    fn disable_context_hook(&self, hook: ContextHookHandle) -> Result<(), HostError> {
        Err(HostError::UnknownHook(hook))
    }

    fn is_context_hook_enabled(&self, _hook: ContextHookHandle) -> bool {
        false
    }

    fn block_until(&self, vcpu: u32, deadline_ns: u64) -> Result<BlockResult, HostError> {
        let slot = self.slot(vcpu);
        let mut poked = slot.poked.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if std::mem::take(&mut *poked) {
                return Ok(BlockResult::Woken);
            }
            if self.suspend.load(Ordering::SeqCst) {
                return Ok(BlockResult::Interrupted);
            }
            let now = self.now_ns();
            if now >= deadline_ns {
                return Ok(BlockResult::TimedOut);
            }
            let (guard, _timeout) = slot
                .cv
                .wait_timeout(poked, Duration::from_nanos(deadline_ns - now))
                .unwrap_or_else(PoisonError::into_inner);
            poked = guard;
        }
    }

    fn poke(&self, vcpu: u32) {
        let slot = self.slot(vcpu);
        *slot.poked.lock().unwrap_or_else(PoisonError::into_inner) = true;
        slot.cv.notify_one();
        debug!("poked vCPU {vcpu}");
    }

    fn suspend_pending(&self) -> bool {
        self.suspend.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn preemption_depth_nests_and_restores() {
        let host = StdHost::new();
        assert!(host.is_preemption_enabled());
        let outer = host.disable_preemption();
        let inner = host.disable_preemption();
        assert!(!host.is_preemption_enabled());
        host.restore_preemption(inner);
        assert!(!host.is_preemption_enabled());
        host.restore_preemption(outer);
        assert!(host.is_preemption_enabled());
    }

    #[test]
    fn early_poke_is_latched() {
        let host = StdHost::new();
        host.poke(1);
        let deadline = host.now_ns() + 10_000_000_000;
        assert_eq!(host.block_until(1, deadline).unwrap(), BlockResult::Woken);
    }

    #[test]
    fn block_times_out_at_deadline() {
        let host = StdHost::new();
        let deadline = host.now_ns() + 1_000_000;
        assert_eq!(host.block_until(0, deadline).unwrap(), BlockResult::TimedOut);
        assert!(host.now_ns() >= deadline);
    }

    #[test]
    fn poke_from_another_thread_wakes_waiter() {
        let host = StdHost::new();
        let start = Instant::now();
        thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(Duration::from_millis(20));
                host.poke(2);
            });
            let deadline = host.now_ns() + 10_000_000_000;
            assert_eq!(host.block_until(2, deadline).unwrap(), BlockResult::Woken);
        });
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn suspend_interrupts_waiters() {
        let host = StdHost::new();
        host.set_suspend_pending(true);
        let deadline = host.now_ns() + 10_000_000_000;
        assert_eq!(host.block_until(0, deadline).unwrap(), BlockResult::Interrupted);
        assert!(host.suspend_pending());
    }

    #[test]
    fn no_context_hooks() {
        let host = StdHost::new();
        assert_eq!(host.create_context_hook(0).unwrap(), None);
    }
}
