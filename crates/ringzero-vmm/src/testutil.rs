//! Scripted host, backend, interrupt controller and timer for
//! scheduling-engine tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::entry::{BackendError, ExitReason, HmBackend};
use crate::halt::{InterruptController, TimerPoll, TimerSource};
use crate::host::{
    BlockResult, ContextHookHandle, HostCpu, HostError, HostScheduler, PreemptState, ThreadCtxEvent,
};
use crate::pgm::{Pgm, PgmConfig};
use crate::vcpu::{VCpu, VCpuForceFlags, VCpuState};
use crate::verified::halt::Interruptibility;
use crate::vm::{Platform, Vm, VmConfig};

// ═══════════════════════════════════════════════════════════════════════
//  MockHost
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HookMode {
    Unsupported,
    Supported,
    Failing,
    /// Hooks that stay armed after disable.
    Sticky,
}

type BlockFn = Box<dyn Fn(u32, u64) -> Result<BlockResult, HostError> + Send + Sync>;
type PauseFn = Box<dyn Fn(u32) + Send + Sync>;

/// Single-threaded host with a manual clock.
pub(crate) struct MockHost {
    hook_mode: HookMode,
    next_hook: AtomicU64,
    hooks: Mutex<HashMap<u64, bool>>,
    preempt_depth: AtomicU32,
    cpu: Mutex<HostCpu>,
    online: AtomicU32,
    tsc_ok: AtomicBool,
    tsc_fails: AtomicBool,
    tsc_measurements: AtomicU32,
    clock: AtomicU64,
    block_advance: Mutex<Option<u64>>,
    block_script: Mutex<VecDeque<Result<BlockResult, HostError>>>,
    on_block: Mutex<Option<BlockFn>>,
    on_pause: Mutex<Option<PauseFn>>,
    pauses: AtomicU32,
    blocks: Mutex<Vec<(u32, u64)>>,
    pokes: Mutex<Vec<u32>>,
    suspend: AtomicBool,
    timer_updates: Mutex<Vec<(HostCpu, u32)>>,
}

impl MockHost {
    fn with_mode(hook_mode: HookMode) -> Self {
        Self {
            hook_mode,
            next_hook: AtomicU64::new(1),
            hooks: Mutex::new(HashMap::new()),
            preempt_depth: AtomicU32::new(0),
            cpu: Mutex::new(HostCpu { id: 0, set_index: 0 }),
            online: AtomicU32::new(1),
            tsc_ok: AtomicBool::new(true),
            tsc_fails: AtomicBool::new(false),
            tsc_measurements: AtomicU32::new(0),
            clock: AtomicU64::new(0),
            block_advance: Mutex::new(None),
            block_script: Mutex::new(VecDeque::new()),
            on_block: Mutex::new(None),
            on_pause: Mutex::new(None),
            pauses: AtomicU32::new(0),
            blocks: Mutex::new(Vec::new()),
            pokes: Mutex::new(Vec::new()),
            suspend: AtomicBool::new(false),
            timer_updates: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn hookless() -> Self {
        Self::with_mode(HookMode::Unsupported)
    }

    pub(crate) fn with_hooks() -> Self {
        Self::with_mode(HookMode::Supported)
    }

    pub(crate) fn failing_hooks() -> Self {
        Self::with_mode(HookMode::Failing)
    }

    pub(crate) fn with_sticky_hooks() -> Self {
        Self::with_mode(HookMode::Sticky)
    }

    pub(crate) fn set_cpu(&self, cpu: HostCpu) {
        *self.cpu.lock().unwrap() = cpu;
    }

    pub(crate) fn set_online_cpus(&self, n: u32) {
        self.online.store(n, Ordering::SeqCst);
    }

    pub(crate) fn set_tsc_delta_available(&self, ok: bool) {
        self.tsc_ok.store(ok, Ordering::SeqCst);
    }

    pub(crate) fn set_tsc_measurement_fails(&self, fails: bool) {
        self.tsc_fails.store(fails, Ordering::SeqCst);
    }

    pub(crate) fn tsc_measurements(&self) -> u32 {
        self.tsc_measurements.load(Ordering::SeqCst)
    }

    pub(crate) fn set_suspend(&self, pending: bool) {
        self.suspend.store(pending, Ordering::SeqCst);
    }

    /// Clock advance per block; by default a block ends at its deadline.
    pub(crate) fn set_block_advance(&self, ns: u64) {
        *self.block_advance.lock().unwrap() = Some(ns);
    }

    pub(crate) fn script_block(&self, result: Result<BlockResult, HostError>) {
        self.block_script.lock().unwrap().push_back(result);
    }

    pub(crate) fn on_block(&self, f: impl Fn(u32, u64) -> Result<BlockResult, HostError> + Send + Sync + 'static) {
        *self.on_block.lock().unwrap() = Some(Box::new(f));
    }

    /// `f` gets the 1-based pause count.
    pub(crate) fn on_pause(&self, f: impl Fn(u32) + Send + Sync + 'static) {
        *self.on_pause.lock().unwrap() = Some(Box::new(f));
    }

    /// (vcpu, deadline) of every block.
    pub(crate) fn blocks(&self) -> Vec<(u32, u64)> {
        self.blocks.lock().unwrap().clone()
    }

    pub(crate) fn pokes(&self) -> Vec<u32> {
        self.pokes.lock().unwrap().clone()
    }

    pub(crate) fn timer_updates(&self) -> Vec<(HostCpu, u32)> {
        self.timer_updates.lock().unwrap().clone()
    }

    pub(crate) fn live_hooks(&self) -> usize {
        self.hooks.lock().unwrap().len()
    }

    fn set_hook_enabled(&self, hook: ContextHookHandle, enabled: bool) -> Result<(), HostError> {
        let mut hooks = self.hooks.lock().unwrap();
        let slot = hooks.get_mut(&hook.0).ok_or(HostError::UnknownHook(hook))?;
        if enabled || self.hook_mode != HookMode::Sticky {
            *slot = enabled;
        }
        Ok(())
    }
}

impl HostScheduler for MockHost {
    fn disable_preemption(&self) -> PreemptState {
        PreemptState { depth_before: self.preempt_depth.fetch_add(1, Ordering::SeqCst) }
    }

    fn restore_preemption(&self, state: PreemptState) {
        self.preempt_depth.store(state.depth_before, Ordering::SeqCst);
    }

    fn is_preemption_enabled(&self) -> bool {
        self.preempt_depth.load(Ordering::SeqCst) == 0
    }

    fn current_cpu(&self) -> HostCpu {
        *self.cpu.lock().unwrap()
    }

    fn online_cpu_count(&self) -> u32 {
        self.online.load(Ordering::SeqCst)
    }

    fn tsc_delta_available(&self, _cpu: HostCpu) -> bool {
        self.tsc_ok.load(Ordering::SeqCst)
    }

    fn measure_tsc_delta(&self, cpu: HostCpu) -> Result<(), HostError> {
        self.tsc_measurements.fetch_add(1, Ordering::SeqCst);
        if self.tsc_fails.load(Ordering::SeqCst) {
            return Err(HostError::TscMeasurement { cpu: cpu.id, reason: "scripted".into() });
        }
        Ok(())
    }

    fn now_ns(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }

    fn update_preemption_timer(&self, cpu: HostCpu, hz: u32) {
        self.timer_updates.lock().unwrap().push((cpu, hz));
    }

    fn create_context_hook(&self, _vcpu: u32) -> Result<Option<ContextHookHandle>, HostError> {
        match self.hook_mode {
            HookMode::Unsupported => Ok(None),
            HookMode::Failing => Err(HostError::HooksUnsupported),
            HookMode::Supported | HookMode::Sticky => {
                let id = self.next_hook.fetch_add(1, Ordering::SeqCst);
                self.hooks.lock().unwrap().insert(id, false);
                Ok(Some(ContextHookHandle(id)))
            }
        }
    }

    fn destroy_context_hook(&self, hook: ContextHookHandle) -> Result<(), HostError> {
        self.hooks
            .lock()
            .unwrap()
            .remove(&hook.0)
            .map(|_| ())
            .ok_or(HostError::UnknownHook(hook))
    }

    fn enable_context_hook(&self, hook: ContextHookHandle) -> Result<(), HostError> {
        self.set_hook_enabled(hook, true)
    }

    fn disable_context_hook(&self, hook: ContextHookHandle) -> Result<(), HostError> {
        self.set_hook_enabled(hook, false)
    }

    fn is_context_hook_enabled(&self, hook: ContextHookHandle) -> bool {
        self.hooks.lock().unwrap().get(&hook.0).copied().unwrap_or(false)
    }

    fn block_until(&self, vcpu: u32, deadline_ns: u64) -> Result<BlockResult, HostError> {
        self.blocks.lock().unwrap().push((vcpu, deadline_ns));
        let result = match self.on_block.lock().unwrap().as_ref() {
            Some(f) => f(vcpu, deadline_ns),
            None => self
                .block_script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(BlockResult::TimedOut)),
        };
        match *self.block_advance.lock().unwrap() {
            Some(ns) => {
                self.clock.fetch_add(ns, Ordering::SeqCst);
            }
            None => {
                self.clock.fetch_max(deadline_ns, Ordering::SeqCst);
            }
        }
        result
    }

    fn poke(&self, vcpu: u32) {
        self.pokes.lock().unwrap().push(vcpu);
    }

    fn suspend_pending(&self) -> bool {
        self.suspend.load(Ordering::SeqCst)
    }

    fn pause(&self) {
        let n = self.pauses.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(f) = self.on_pause.lock().unwrap().as_ref() {
            f(n);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  ScriptedBackend
// ═══════════════════════════════════════════════════════════════════════

/// What the backend saw while running guest code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Observed {
    pub preemption_enabled: bool,
    pub hook_enabled: bool,
    pub state: VCpuState,
    pub host_cpu: Option<HostCpu>,
}

pub(crate) struct ScriptedBackend {
    host: Arc<dyn HostScheduler>,
    exits: Mutex<VecDeque<Result<ExitReason, BackendError>>>,
    corrupt: Mutex<Option<VCpuState>>,
    enter_error: Mutex<Option<String>>,
    runs: AtomicU32,
    observed: Mutex<Vec<Observed>>,
    events: Mutex<Vec<ThreadCtxEvent>>,
}

impl ScriptedBackend {
    pub(crate) fn new(host: Arc<dyn HostScheduler>) -> Self {
        Self {
            host,
            exits: Mutex::new(VecDeque::new()),
            corrupt: Mutex::new(None),
            enter_error: Mutex::new(None),
            runs: AtomicU32::new(0),
            observed: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
        }
    }

    /// Queue the result of the next guest run. Unscripted runs exit to ring-3.
    pub(crate) fn script(&self, exit: Result<ExitReason, BackendError>) {
        self.exits.lock().unwrap().push_back(exit);
    }

    /// Overwrite the VCPU state while guest code "runs".
    pub(crate) fn corrupt_state_during_run(&self, state: VCpuState) {
        *self.corrupt.lock().unwrap() = Some(state);
    }

    pub(crate) fn fail_enter(&self, reason: &str) {
        *self.enter_error.lock().unwrap() = Some(reason.to_string());
    }

    pub(crate) fn runs(&self) -> u32 {
        self.runs.load(Ordering::SeqCst)
    }

    pub(crate) fn observed(&self) -> Vec<Observed> {
        self.observed.lock().unwrap().clone()
    }

    pub(crate) fn ctx_events(&self) -> Vec<ThreadCtxEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl HmBackend for ScriptedBackend {
    fn enter(&self, _vcpu: &VCpu) -> Result<(), BackendError> {
        match self.enter_error.lock().unwrap().as_ref() {
            Some(reason) => Err(BackendError::Enter(reason.clone())),
            None => Ok(()),
        }
    }

    fn run_guest_code(&self, vcpu: &VCpu) -> Result<ExitReason, BackendError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.observed.lock().unwrap().push(Observed {
            preemption_enabled: self.host.is_preemption_enabled(),
            hook_enabled: vcpu.ctx_hook().is_some_and(|h| self.host.is_context_hook_enabled(h)),
            state: vcpu.state(),
            host_cpu: vcpu.host_cpu(),
        });
        if let Some(state) = *self.corrupt.lock().unwrap() {
            vcpu.set_state(state);
        }
        self.exits.lock().unwrap().pop_front().unwrap_or(Ok(ExitReason::ToRing3))
    }

    fn context_callback(&self, _vcpu: &VCpu, event: ThreadCtxEvent) {
        self.events.lock().unwrap().push(event);
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  MockIrq / FixedTimer
// ═══════════════════════════════════════════════════════════════════════

pub(crate) struct MockIrq {
    interruptibility: Mutex<Interruptibility>,
    mwait: AtomicU32,
    pending_trap: AtomicBool,
    vector: Mutex<Option<u8>>,
    post_on_update: Mutex<VCpuForceFlags>,
    updates: AtomicU32,
    trapped: Mutex<Vec<u8>>,
}

impl MockIrq {
    pub(crate) fn new() -> Self {
        Self {
            interruptibility: Mutex::new(Interruptibility::Unrestrained),
            mwait: AtomicU32::new(0),
            pending_trap: AtomicBool::new(false),
            vector: Mutex::new(None),
            post_on_update: Mutex::new(VCpuForceFlags::empty()),
            updates: AtomicU32::new(0),
            trapped: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn set_interruptibility(&self, i: Interruptibility) {
        *self.interruptibility.lock().unwrap() = i;
    }

    pub(crate) fn set_mwait(&self, state: u32) {
        self.mwait.store(state, Ordering::SeqCst);
    }

    pub(crate) fn set_pending_trap(&self, pending: bool) {
        self.pending_trap.store(pending, Ordering::SeqCst);
    }

    /// Vector handed out by `get_interrupt`.
    pub(crate) fn set_vector(&self, vector: Option<u8>) {
        *self.vector.lock().unwrap() = vector;
    }

    /// Flags raised on the VCPU when the APIC folds in posted interrupts.
    pub(crate) fn post_on_update(&self, flags: VCpuForceFlags) {
        *self.post_on_update.lock().unwrap() = flags;
    }

    pub(crate) fn updates(&self) -> u32 {
        self.updates.load(Ordering::SeqCst)
    }

    pub(crate) fn trapped(&self) -> Vec<u8> {
        self.trapped.lock().unwrap().clone()
    }
}

impl InterruptController for MockIrq {
    fn interruptibility(&self, _vcpu: &VCpu) -> Interruptibility {
        *self.interruptibility.lock().unwrap()
    }

    fn mwait_state(&self, _vcpu: &VCpu) -> u32 {
        self.mwait.load(Ordering::SeqCst)
    }

    fn has_pending_trap(&self, _vcpu: &VCpu) -> bool {
        self.pending_trap.load(Ordering::SeqCst)
    }

    fn update_pending(&self, vcpu: &VCpu) {
        self.updates.fetch_add(1, Ordering::SeqCst);
        vcpu.ff.set(*self.post_on_update.lock().unwrap());
    }

    fn get_interrupt(&self, vcpu: &VCpu) -> Option<u8> {
        let vector = *self.vector.lock().unwrap();
        if vector.is_some() {
            vcpu.ff.clear(VCpuForceFlags::INTERRUPT_APIC | VCpuForceFlags::INTERRUPT_PIC);
        }
        vector
    }

    fn assert_trap(&self, _vcpu: &VCpu, vector: u8) {
        self.trapped.lock().unwrap().push(vector);
    }
}

/// Timer whose next deadline is always `delta` away.
pub(crate) struct FixedTimer {
    delta: AtomicU64,
    hz: AtomicU32,
}

impl FixedTimer {
    pub(crate) fn new() -> Self {
        Self { delta: AtomicU64::new(1_000_000), hz: AtomicU32::new(100) }
    }

    pub(crate) fn set_delta(&self, ns: u64) {
        self.delta.store(ns, Ordering::SeqCst);
    }

    pub(crate) fn set_hz(&self, hz: u32) {
        self.hz.store(hz, Ordering::SeqCst);
    }
}

impl TimerSource for FixedTimer {
    fn poll(&self, _vcpu: &VCpu, now_ns: u64) -> TimerPoll {
        let delta_ns = self.delta.load(Ordering::SeqCst);
        TimerPoll { deadline_ns: now_ns.saturating_add(delta_ns), delta_ns }
    }

    fn host_timer_hz(&self, _vcpu: &VCpu) -> u32 {
        self.hz.load(Ordering::SeqCst)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Assembly
// ═══════════════════════════════════════════════════════════════════════

/// Test-side handles to the mocks behind a [`Platform`].
pub(crate) struct Parts {
    pub backend: Arc<ScriptedBackend>,
    pub irq: Arc<MockIrq>,
    pub timer: Arc<FixedTimer>,
}

pub(crate) fn empty_pgm() -> Pgm {
    Pgm::new(PgmConfig::default(), crate::pgm::testutil::host(4, None))
}

pub(crate) fn platform(host: Arc<dyn HostScheduler>) -> (Platform, Parts) {
    let parts = Parts {
        backend: Arc::new(ScriptedBackend::new(host.clone())),
        irq: Arc::new(MockIrq::new()),
        timer: Arc::new(FixedTimer::new()),
    };
    let platform = Platform {
        host,
        backend: parts.backend.clone(),
        irq: parts.irq.clone(),
        timers: parts.timer.clone(),
    };
    (platform, parts)
}

pub(crate) fn build_vm(host: Arc<dyn HostScheduler>, config: VmConfig) -> (Vm, Parts) {
    let (platform, parts) = platform(host);
    let vm = Vm::new(config, empty_pgm(), platform).unwrap();
    (vm, parts)
}

/// A VM on a [`MockHost`] with handles to every mock.
pub(crate) struct Fixture {
    pub host: Arc<MockHost>,
    pub backend: Arc<ScriptedBackend>,
    pub irq: Arc<MockIrq>,
    pub timer: Arc<FixedTimer>,
    pub vm: Vm,
}

impl Fixture {
    pub(crate) fn new(host: MockHost) -> Self {
        Self::with_config(host, VmConfig::default())
    }

    pub(crate) fn with_config(host: MockHost, config: VmConfig) -> Self {
        let host = Arc::new(host);
        let (vm, parts) = build_vm(host.clone(), config);
        Self { host, backend: parts.backend, irq: parts.irq, timer: parts.timer, vm }
    }

    /// VCPU 0.
    pub(crate) fn vcpu(&self) -> &VCpu {
        self.vm.vcpu(0).unwrap()
    }
}
