//! The ring-0 VM: memory engine, VCPUs and the host-facing platform.
//!
//! A [`Vm`] ties together the physical memory engine ([`Pgm`]), one
//! [`VCpu`] per virtual CPU, and the four services the scheduling engine
//! calls out to:
//!
//! | Service                  | Used for                                   |
//! |--------------------------|--------------------------------------------|
//! | [`HostScheduler`]        | preemption, CPU id, hooks, halt wait queue |
//! | [`HmBackend`]            | entering backend context, running guest    |
//! | [`InterruptController`]  | wake resolution, vector delivery           |
//! | [`TimerSource`]          | halt deadlines, preemption timer rate      |
//!
//! The VM is shared by reference between all EMTs and device threads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::{error, info};
use thiserror::Error;

use crate::entry::HmBackend;
use crate::halt::{HaltConfig, HaltOutcome, HaltScheduler, InterruptController, TimerSource};
use crate::hook::ContextHookManager;
use crate::host::HostScheduler;
use crate::pgm::Pgm;
use crate::vcpu::{AtomicForceFlags, VCpu, VCpuForceFlags, VmForceFlags};

/// Upper bound on VCPUs per VM.
pub const MAX_VCPUS: u32 = 64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    #[error("VM needs at least one vCPU")]
    NoVcpus,

    #[error("Too many vCPUs: {count} (max {max})", max = MAX_VCPUS)]
    TooManyVcpus { count: u32 },

    #[error("Invalid vCPU id {vcpu} (VM has {count})")]
    InvalidVcpu { vcpu: u32, count: usize },

    #[error("Halt history window {0} is not a power of two")]
    BadHistoryWindow(u32),
}

/// VM-wide configuration.
#[derive(Debug, Clone)]
pub struct VmConfig {
    pub num_vcpus: u32,
    pub halt: HaltConfig,
    /// Retune the host preemption timer on every guest entry.
    pub use_periodic_preemption_timers: bool,
    /// Initial value of each VCPU's "may halt in ring-0" switch.
    pub may_halt_in_ring0: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            num_vcpus: 1,
            halt: HaltConfig::default(),
            use_periodic_preemption_timers: false,
            may_halt_in_ring0: true,
        }
    }
}

/// Host-side services a VM runs on.
#[derive(Clone)]
pub struct Platform {
    pub host: Arc<dyn HostScheduler>,
    pub backend: Arc<dyn HmBackend>,
    pub irq: Arc<dyn InterruptController>,
    pub timers: Arc<dyn TimerSource>,
}

pub struct Vm {
    config: VmConfig,
    pgm: Pgm,
    /// VM-wide force flags.
    pub ff: AtomicForceFlags<VmForceFlags>,
    vcpus: Vec<Arc<VCpu>>,
    platform: Platform,
    aborted: AtomicBool,
    abort_reason: Mutex<Option<String>>,
}

impl Vm {
    pub fn new(config: VmConfig, pgm: Pgm, platform: Platform) -> Result<Self, VmError> {
        if config.num_vcpus == 0 {
            return Err(VmError::NoVcpus);
        }
        if config.num_vcpus > MAX_VCPUS {
            return Err(VmError::TooManyVcpus { count: config.num_vcpus });
        }
        if !config.halt.history_window.is_power_of_two() {
            return Err(VmError::BadHistoryWindow(config.halt.history_window));
        }
        let vcpus = (0..config.num_vcpus)
            .map(|id| Arc::new(VCpu::new(id, config.may_halt_in_ring0)))
            .collect();
        info!("VM created: {} vCPU(s), {} RAM range(s)", config.num_vcpus, pgm.ram_ranges().len());
        Ok(Self {
            config,
            pgm,
            ff: AtomicForceFlags::new(),
            vcpus,
            platform,
            aborted: AtomicBool::new(false),
            abort_reason: Mutex::new(None),
        })
    }

    // ─── Accessors ───────────────────────────────────────────────

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn pgm(&self) -> &Pgm {
        &self.pgm
    }

    pub fn host(&self) -> &Arc<dyn HostScheduler> {
        &self.platform.host
    }

    pub fn backend(&self) -> &Arc<dyn HmBackend> {
        &self.platform.backend
    }

    pub fn irq(&self) -> &Arc<dyn InterruptController> {
        &self.platform.irq
    }

    pub fn timers(&self) -> &Arc<dyn TimerSource> {
        &self.platform.timers
    }

    pub fn vcpu(&self, id: u32) -> Option<&VCpu> {
        self.vcpus.get(id as usize).map(Arc::as_ref)
    }

    /// Shared handle for threads that raise flags on one VCPU.
    pub fn vcpu_handle(&self, id: u32) -> Option<Arc<VCpu>> {
        self.vcpus.get(id as usize).cloned()
    }

    pub fn vcpu_count(&self) -> usize {
        self.vcpus.len()
    }

    fn checked_vcpu(&self, id: u32) -> Result<&VCpu, VmError> {
        self.vcpu(id).ok_or(VmError::InvalidVcpu { vcpu: id, count: self.vcpus.len() })
    }

    pub fn hooks(&self) -> ContextHookManager<'_> {
        ContextHookManager::new(self.platform.host.as_ref(), self.platform.backend.as_ref())
    }

    // ─── EMT lifecycle ───────────────────────────────────────────

    /// Called on the EMT of `id` before its first [`run_once`](Self::run_once).
    pub fn register_vcpu_thread(&self, id: u32) -> Result<(), VmError> {
        let vcpu = self.checked_vcpu(id)?;
        self.hooks().create_for_emt(vcpu);
        Ok(())
    }

    pub fn unregister_vcpu_thread(&self, id: u32) -> Result<(), VmError> {
        let vcpu = self.checked_vcpu(id)?;
        self.hooks().destroy_for_emt(vcpu);
        Ok(())
    }

    // ─── Cross-thread signalling ─────────────────────────────────

    /// Wake `id` if it is blocked in a halt.
    pub fn poke(&self, id: u32) -> Result<(), VmError> {
        self.checked_vcpu(id)?;
        self.platform.host.poke(id);
        Ok(())
    }

    /// Post interrupt `flags` to `id` and wake it.
    pub fn raise_interrupt(&self, id: u32, flags: VCpuForceFlags) -> Result<(), VmError> {
        self.checked_vcpu(id)?.ff.set(flags);
        self.platform.host.poke(id);
        Ok(())
    }

    /// Raise VM-wide flags and wake every VCPU.
    pub fn set_force_flags(&self, flags: VmForceFlags) {
        self.ff.set(flags);
        for vcpu in &self.vcpus {
            self.platform.host.poke(vcpu.id());
        }
    }

    /// Ring-3 entry to the halt path, for halts it wants retried in ring-0.
    pub fn halt(&self, id: u32) -> Result<HaltOutcome, VmError> {
        let vcpu = self.checked_vcpu(id)?;
        Ok(HaltScheduler::new(self).halt(vcpu))
    }

    // ─── Abort ───────────────────────────────────────────────────

    /// Stop the VM after an unrecoverable error. The first reason sticks.
    pub fn abort(&self, reason: &str) {
        let mut slot = self.abort_reason.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            error!("VM aborted: {reason}");
            *slot = Some(reason.to_string());
        }
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn abort_reason(&self) -> Option<String> {
        self.abort_reason.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}
