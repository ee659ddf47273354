//! Thread-context hooks for EMTs running inside backend context.
//!
//! While an EMT is inside backend context its VCPU is bound to one host
//! CPU: per-CPU virtualization state is loaded and the VCPU's host CPU
//! mapping is published. If the host deschedules the EMT, that state has
//! to be saved, and reloaded wherever the thread resumes.
//!
//! With host support a context hook does this on every reschedule, and
//! the entry dispatcher can run guest code with preemption enabled.
//! Without it the dispatcher keeps preemption disabled, and the only
//! place the EMT may voluntarily sleep is bracketed by
//! [`ContextHookManager::prepare_to_block`] and
//! [`ContextHookManager::resume_after_blocking`].
//!
//! ```text
//!   ScheduledOut ──► backend.context_callback(Out) ──► host cpu = NIL
//!   ScheduledIn  ──► preempt off ──► host cpu = current
//!                       └─ no TSC delta? ──► set TO_R3
//!                    ──► backend.context_callback(In) ──► preempt restore
//! ```

use log::{debug, warn};

use crate::entry::HmBackend;
use crate::host::{HostError, HostScheduler, ThreadCtxEvent};
use crate::vcpu::{VCpu, VCpuForceFlags};

/// What [`ContextHookManager::prepare_to_block`] undid.
#[must_use = "pass to resume_after_blocking"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockContext {
    /// The EMT was in backend context without a hook and has been
    /// switched out by hand.
    pub was_in_backend_ctx: bool,
}

/// Hook lifecycle and context-switch handling for one VM.
pub struct ContextHookManager<'a> {
    host: &'a dyn HostScheduler,
    backend: &'a dyn HmBackend,
}

impl<'a> ContextHookManager<'a> {
    pub fn new(host: &'a dyn HostScheduler, backend: &'a dyn HmBackend) -> Self {
        Self { host, backend }
    }

    /// Create the hook for the EMT of `vcpu`. Hosts without hook support,
    /// and creation failures, leave the VCPU hookless.
    pub fn create_for_emt(&self, vcpu: &VCpu) {
        debug_assert!(vcpu.ctx_hook().is_none(), "hook already created");
        match self.host.create_context_hook(vcpu.id()) {
            Ok(Some(hook)) => {
                debug!("vCPU {}: context hook {:?} created", vcpu.id(), hook);
                vcpu.set_ctx_hook(Some(hook));
            }
            Ok(None) => debug!("vCPU {}: host has no context hooks", vcpu.id()),
            Err(e) => warn!("vCPU {}: context hook creation failed, running hookless: {e}", vcpu.id()),
        }
    }

    pub fn destroy_for_emt(&self, vcpu: &VCpu) {
        if let Some(hook) = vcpu.take_ctx_hook() {
            if let Err(e) = self.host.destroy_context_hook(hook) {
                warn!("vCPU {}: destroying context hook failed: {e}", vcpu.id());
            }
        }
    }

    /// Arm the hook (if any) before entering backend context.
    pub fn enable(&self, vcpu: &VCpu) {
        if let Some(hook) = vcpu.ctx_hook() {
            debug_assert!(!self.host.is_context_hook_enabled(hook));
            if let Err(e) = self.host.enable_context_hook(hook) {
                warn!("vCPU {}: enabling context hook failed: {e}", vcpu.id());
            }
        }
    }

    /// Disarm the hook after leaving backend context.
    pub fn disable(&self, vcpu: &VCpu) {
        if let Some(hook) = vcpu.ctx_hook() {
            // A hook firing from here on must not see a stale mapping.
            vcpu.set_host_cpu(None);
            if let Err(e) = self.host.disable_context_hook(hook) {
                warn!("vCPU {}: disabling context hook failed: {e}", vcpu.id());
            }
        }
    }

    pub fn is_enabled(&self, vcpu: &VCpu) -> bool {
        vcpu.ctx_hook().is_some_and(|hook| self.host.is_context_hook_enabled(hook))
    }

    /// Host reschedule of the EMT owning `vcpu`.
    pub fn on_thread_context(&self, vcpu: &VCpu, event: ThreadCtxEvent) {
        match event {
            ThreadCtxEvent::ScheduledIn => {
                let preempt = self.host.disable_preemption();
                let cpu = self.host.current_cpu();
                vcpu.set_host_cpu(Some(cpu));
                if !self.host.tsc_delta_available(cpu) {
                    debug!("vCPU {}: resumed on cpu {} without TSC delta", vcpu.id(), cpu.id);
                    vcpu.ff.set(VCpuForceFlags::TO_R3);
                }
                self.backend.context_callback(vcpu, event);
                self.host.restore_preemption(preempt);
            }
            ThreadCtxEvent::ScheduledOut => {
                self.backend.context_callback(vcpu, event);
                vcpu.set_host_cpu(None);
            }
        }
    }

    /// Leave backend context by hand before a voluntary sleep.
    ///
    /// Inside hookless backend context this switches the VCPU out and
    /// re-enables preemption. Outside backend context preemption must
    /// already be enabled.
    ///
    /// # Errors
    ///
    /// [`HostError::CannotBlock`] when the caller holds preemption
    /// disabled outside backend context.
    pub fn prepare_to_block(&self, vcpu: &VCpu) -> Result<BlockContext, HostError> {
        if vcpu.host_cpu().is_some() && vcpu.ctx_hook().is_none() {
            debug_assert!(vcpu.in_backend_ctx());
            self.on_thread_context(vcpu, ThreadCtxEvent::ScheduledOut);
            if let Some(preempt) = vcpu.entry_preempt() {
                self.host.restore_preemption(preempt);
            }
            return Ok(BlockContext { was_in_backend_ctx: true });
        }
        if !self.host.is_preemption_enabled() {
            return Err(HostError::CannotBlock { vcpu: vcpu.id(), reason: "preemption is disabled" });
        }
        Ok(BlockContext { was_in_backend_ctx: false })
    }

    /// Undo [`prepare_to_block`](Self::prepare_to_block).
    pub fn resume_after_blocking(&self, vcpu: &VCpu, ctx: BlockContext) {
        if ctx.was_in_backend_ctx {
            if vcpu.entry_preempt().is_some() {
                let preempt = self.host.disable_preemption();
                vcpu.stash_entry_preempt(preempt);
            }
            self.on_thread_context(vcpu, ThreadCtxEvent::ScheduledIn);
        }
    }
}
