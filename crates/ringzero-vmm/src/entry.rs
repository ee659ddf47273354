//! Fast ring-0 entry: run guest code once.
//!
//! [`Vm::run_once`] is what a VCPU's EMT calls in its run loop. It pins
//! the thread to a host CPU, enters backend context, runs guest code,
//! leaves backend context again, and returns the exit to ring-3, except
//! for halts that [`HaltScheduler`] can resolve in place. Those loop
//! straight back into guest code.
//!
//! # One iteration
//!
//! ```text
//!   disable preemption ──► current cpu
//!     │  bad set index / no TSC delta ──► restore, measure ──► ToRing3
//!     ▼
//!   publish host cpu, retune preemption timer
//!     │  host suspend pending ──► RawInterrupt
//!     ▼
//!   enable hook ──► backend.enter ──► StartedHm
//!     │  hook armed? restore preemption now
//!     ▼
//!   backend.run_guest_code
//!     ▼
//!   Started, clear host cpu, disable hook, restore preemption
//!     │
//!     └─ Halt ──► HaltScheduler::halt ── Resume ──► next iteration
//! ```
//!
//! Without a context hook preemption stays disabled for the whole guest
//! run, so the EMT cannot migrate away from the per-CPU state the backend
//! loaded.

use log::{debug, trace};
use thiserror::Error;

use crate::halt::{HaltOutcome, HaltScheduler};
use crate::host::{HostCpu, HostError, ThreadCtxEvent, MAX_HOST_CPUS};
use crate::vcpu::{VCpu, VCpuState};
use crate::vm::Vm;

/// Why guest code stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// HLT or MWAIT that ring-0 could not resolve.
    Halt,
    /// The host wants the EMT back; guest code did not run.
    RawInterrupt,
    /// Ring-3 has work (force flags, TSC-delta measurement, ...).
    ToRing3,
    /// Backend-specific exit, passed through untouched.
    Other(u32),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Entering backend context failed: {0}")]
    Enter(String),

    #[error("Running guest code failed: {0}")]
    Run(String),
}

/// Hardware-virtualization backend.
pub trait HmBackend: Send + Sync {
    /// Load per-CPU virtualization state for `vcpu` on the current CPU.
    fn enter(&self, vcpu: &VCpu) -> Result<(), BackendError>;
    /// Run guest code until the next exit.
    fn run_guest_code(&self, vcpu: &VCpu) -> Result<ExitReason, BackendError>;
    /// Save or reload per-CPU state across a host reschedule.
    fn context_callback(&self, vcpu: &VCpu, event: ThreadCtxEvent);
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunError {
    #[error("vCPU {vcpu} left guest code in state {state:?} instead of StartedHm")]
    WrongVcpuState { vcpu: u32, state: VCpuState },

    #[error("Context hook of vCPU {vcpu} still enabled after leaving backend context")]
    ContextHookStillEnabled { vcpu: u32 },

    #[error("Invalid vCPU id {vcpu} (VM has {count})")]
    InvalidVcpu { vcpu: u32, count: usize },

    #[error("Host CPU set index {index} out of range")]
    InvalidCpuIndex { index: u32 },

    #[error("TSC delta measurement failed: {0}")]
    TscMeasurement(#[source] HostError),

    #[error("Backend failure on vCPU {vcpu}: {source}")]
    Backend {
        vcpu: u32,
        #[source]
        source: BackendError,
    },

    #[error("VM has been aborted")]
    VmAborted,
}

impl RunError {
    /// Fatal errors abort the whole VM.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::WrongVcpuState { .. } | Self::ContextHookStillEnabled { .. })
    }
}

impl Vm {
    /// Run guest code on VCPU `vcpu_id` until an exit ring-3 must see.
    ///
    /// Must be called on the VCPU's EMT.
    ///
    /// # Errors
    ///
    /// - [`RunError::InvalidVcpu`] / [`RunError::VmAborted`] before anything runs.
    /// - [`RunError::InvalidCpuIndex`] / [`RunError::TscMeasurement`] when
    ///   the current host CPU cannot run guest code.
    /// - [`RunError::Backend`] from the backend.
    /// - Fatal [`RunError::WrongVcpuState`] / [`RunError::ContextHookStillEnabled`],
    ///   after which the VM is aborted.
    pub fn run_once(&self, vcpu_id: u32) -> Result<ExitReason, RunError> {
        if self.is_aborted() {
            return Err(RunError::VmAborted);
        }
        let vcpu = self
            .vcpu(vcpu_id)
            .ok_or(RunError::InvalidVcpu { vcpu: vcpu_id, count: self.vcpu_count() })?;

        loop {
            let exit = self.run_iteration(vcpu).inspect_err(|e| {
                if e.is_fatal() {
                    self.abort(&format!("vCPU {vcpu_id}: {e}"));
                }
            })?;
            if exit != ExitReason::Halt {
                trace!("vCPU {vcpu_id}: exit {exit:?}");
                return Ok(exit);
            }
            match HaltScheduler::new(self).halt(vcpu) {
                HaltOutcome::Resume => vcpu.note_halt_succeeded(),
                HaltOutcome::ToRing3 => {
                    vcpu.note_halt_to_ring3();
                    return Ok(ExitReason::Halt);
                }
            }
        }
    }

    fn run_iteration(&self, vcpu: &VCpu) -> Result<ExitReason, RunError> {
        let host = self.host().as_ref();
        let hooks = self.hooks();
        debug_assert!(!hooks.is_enabled(vcpu));

        let preempt = host.disable_preemption();
        vcpu.stash_entry_preempt(preempt);
        let cpu = host.current_cpu();

        if cpu.set_index >= MAX_HOST_CPUS || !host.tsc_delta_available(cpu) {
            vcpu.take_entry_preempt();
            host.restore_preemption(preempt);
            vcpu.set_host_cpu(None);
            return self.measure_tsc_delta(cpu);
        }

        vcpu.set_host_cpu(Some(cpu));
        if self.config().use_periodic_preemption_timers {
            host.update_preemption_timer(cpu, self.timers().host_timer_hz(vcpu));
        }

        let result = if host.suspend_pending() {
            debug!("vCPU {}: host suspend pending, not entering guest", vcpu.id());
            vcpu.set_host_cpu(None);
            Ok(ExitReason::RawInterrupt)
        } else {
            let result = self.run_in_backend(vcpu);
            vcpu.set_host_cpu(None);
            hooks.disable(vcpu);
            if hooks.is_enabled(vcpu) {
                Err(RunError::ContextHookStillEnabled { vcpu: vcpu.id() })
            } else {
                result
            }
        };

        // Already restored if the hook was armed inside backend context.
        if let Some(state) = vcpu.take_entry_preempt() {
            host.restore_preemption(state);
        }
        result
    }

    fn run_in_backend(&self, vcpu: &VCpu) -> Result<ExitReason, RunError> {
        let hooks = self.hooks();
        hooks.enable(vcpu);
        self.backend()
            .enter(vcpu)
            .map_err(|source| RunError::Backend { vcpu: vcpu.id(), source })?;

        vcpu.set_in_backend_ctx(true);
        vcpu.set_state(VCpuState::StartedHm);
        if hooks.is_enabled(vcpu) {
            if let Some(state) = vcpu.take_entry_preempt() {
                self.host().restore_preemption(state);
            }
        }

        let rc = self.backend().run_guest_code(vcpu);
        let state = vcpu.state();
        vcpu.set_in_backend_ctx(false);
        vcpu.set_state(VCpuState::Started);

        match rc {
            Ok(_) if state != VCpuState::StartedHm => {
                Err(RunError::WrongVcpuState { vcpu: vcpu.id(), state })
            }
            Ok(exit) => Ok(exit),
            Err(source) => Err(RunError::Backend { vcpu: vcpu.id(), source }),
        }
    }

    fn measure_tsc_delta(&self, cpu: HostCpu) -> Result<ExitReason, RunError> {
        if cpu.set_index >= MAX_HOST_CPUS {
            return Err(RunError::InvalidCpuIndex { index: cpu.set_index });
        }
        debug!("measuring TSC delta for host cpu {}", cpu.id);
        self.host()
            .measure_tsc_delta(cpu)
            .map_err(RunError::TscMeasurement)?;
        Ok(ExitReason::ToRing3)
    }
}
