//! Ring-0 halt handling.
//!
//! When guest code executes HLT (or MWAIT) the backend exits with
//! [`ExitReason::Halt`](crate::entry::ExitReason::Halt). Bouncing every
//! halt to ring-3 costs two world switches, so [`HaltScheduler::halt`]
//! tries to resolve it in place: wait for the next timer deadline or an
//! interrupt, then resume the guest directly.
//!
//! # Flow
//!
//! ```text
//!   preconditions (may halt, no pending trap, interruptible or MWAIT)
//!        │
//!   ring-3 work pending? ─────────────────────────────► ToRing3
//!   wake source pending? ─────────────────────────────► resolve
//!        │
//!   poll timer ──► recheck ──► delta < threshold? ────► ToRing3
//!        │
//!   spin (only if recent halts mostly resolved here)
//!        │
//!   Started ─cmpxchg─► StartedHalted ──► recheck ──► block_until(deadline)
//!        │                                                │
//!   StartedHalted ─cmpxchg─► Started ◄────────────────────┘
//!        │
//!   recheck ──► wake source? ──► resolve : ToRing3
//! ```
//!
//! Every step rechecks both force-flag sets because device threads and
//! other EMTs raise them concurrently. A flag raised after the final
//! recheck is covered by the poke that accompanies it.

use std::sync::Arc;

use log::{debug, trace};

use crate::host::{BlockResult, HostScheduler};
use crate::vcpu::{HaltEvent, VCpu, VCpuForceFlags, VCpuState, VmForceFlags};
use crate::verified::halt::{
    classify_block, halt_allowed, resolve_wake, resolve_wake_fallback, should_spin,
    spin_history_update, BlockTiming, Interruptibility, PendingWake, WakeDecision,
};
use crate::vm::Vm;

/// Halt path tuning.
#[derive(Debug, Clone)]
pub struct HaltConfig {
    /// Timer deltas below this are not worth blocking for.
    pub spin_block_threshold_ns: u64,
    /// Spin iterations before blocking.
    pub spin_loops: u32,
    /// Spinning needs at least this many online host CPUs.
    pub min_cpus_for_spin: u32,
    /// Halts per spin-history window (power of two).
    pub history_window: u32,
    /// Tolerance when classifying a block as overslept or insomniac.
    pub timing_slack_ns: u64,
}

impl Default for HaltConfig {
    fn default() -> Self {
        Self {
            spin_block_threshold_ns: 50_000,
            spin_loops: 42,
            min_cpus_for_spin: 4,
            history_window: 256,
            timing_slack_ns: 50_000,
        }
    }
}

/// Result of a ring-0 halt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltOutcome {
    /// Re-enter guest code.
    Resume,
    /// Leave the halt to ring-3.
    ToRing3,
}

/// Interrupt state of a VCPU as the halt path needs it.
pub trait InterruptController: Send + Sync {
    fn interruptibility(&self, vcpu: &VCpu) -> Interruptibility;
    /// MWAIT state: 0 none, 1 armed, above 1 armed with break-on-interrupt.
    fn mwait_state(&self, vcpu: &VCpu) -> u32;
    /// An event is already queued for injection.
    fn has_pending_trap(&self, vcpu: &VCpu) -> bool;
    /// Fold posted interrupts into the APIC (after `UPDATE_APIC`).
    fn update_pending(&self, vcpu: &VCpu);
    /// Acknowledge the highest-priority external interrupt.
    fn get_interrupt(&self, vcpu: &VCpu) -> Option<u8>;
    /// Queue `vector` for injection on the next entry.
    fn assert_trap(&self, vcpu: &VCpu, vector: u8);
}

/// Next timer event for a VCPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerPoll {
    /// Absolute deadline, host nanoseconds.
    pub deadline_ns: u64,
    /// Time from now until the deadline.
    pub delta_ns: u64,
}

pub trait TimerSource: Send + Sync {
    /// Run expired timers and report the next deadline.
    fn poll(&self, vcpu: &VCpu, now_ns: u64) -> TimerPoll;
    /// Frequency the fastest active guest timer wants from the host.
    fn host_timer_hz(&self, vcpu: &VCpu) -> u32;
}

/// Resolves halts for the VCPUs of one VM.
pub struct HaltScheduler<'a> {
    vm: &'a Vm,
}

impl<'a> HaltScheduler<'a> {
    pub fn new(vm: &'a Vm) -> Self {
        Self { vm }
    }

    fn host(&self) -> &dyn HostScheduler {
        self.vm.host().as_ref()
    }

    fn irq(&self) -> &Arc<dyn InterruptController> {
        self.vm.irq()
    }

    /// Handle a guest halt on the calling EMT.
    ///
    /// Must be called outside backend context with preemption enabled.
    pub fn halt(&self, vcpu: &VCpu) -> HaltOutcome {
        debug_assert!(!vcpu.in_backend_ctx());
        let cfg = &self.vm.config().halt;
        self.roll_history(vcpu, cfg.history_window);

        let mwait = self.irq().mwait_state(vcpu);
        let interruptibility = self.irq().interruptibility(vcpu);
        if !vcpu.may_halt_in_ring0()
            || self.irq().has_pending_trap(vcpu)
            || !halt_allowed(interruptibility, mwait)
        {
            trace!("vCPU {}: halt not allowed in ring-0 ({interruptibility:?}, mwait {mwait})", vcpu.id());
            return self.to_ring3(vcpu, HaltEvent::ToRing3Other);
        }

        if self.ring3_pending(vcpu) {
            return self.to_ring3(vcpu, HaltEvent::ToRing3PendingFf);
        }
        if self.wake_pending(vcpu) {
            return self.resolve(vcpu, interruptibility, mwait);
        }

        self.host().pause();
        let poll = self.vm.timers().poll(vcpu, self.host().now_ns());

        if self.ring3_pending(vcpu) {
            return self.to_ring3(vcpu, HaltEvent::ToRing3PendingFf);
        }
        if self.wake_pending(vcpu) {
            return self.resolve(vcpu, interruptibility, mwait);
        }
        if poll.delta_ns < cfg.spin_block_threshold_ns {
            return self.to_ring3(vcpu, HaltEvent::ToRing3SmallDelta);
        }

        let (succeeded, to_ring3) = vcpu.halt_history();
        if should_spin(succeeded, to_ring3, self.host().online_cpu_count(), cfg.min_cpus_for_spin) {
            for _ in 0..cfg.spin_loops {
                self.host().pause();
                if self.ring3_pending(vcpu) {
                    return self.to_ring3(vcpu, HaltEvent::ToRing3FromSpin);
                }
                if self.wake_pending(vcpu) {
                    vcpu.record(HaltEvent::ExecFromSpin);
                    return self.resolve(vcpu, interruptibility, mwait);
                }
            }
        }

        if !vcpu.cmpxchg_state(VCpuState::StartedHalted, VCpuState::Started) {
            debug!("vCPU {}: unexpected state {:?} entering halt", vcpu.id(), vcpu.state());
            return self.to_ring3(vcpu, HaltEvent::ToRing3Other);
        }
        if self.ring3_pending(vcpu) {
            vcpu.cmpxchg_state(VCpuState::Started, VCpuState::StartedHalted);
            return self.to_ring3(vcpu, HaltEvent::ToRing3PendingFf);
        }
        if self.wake_pending(vcpu) {
            vcpu.cmpxchg_state(VCpuState::Started, VCpuState::StartedHalted);
            return self.resolve(vcpu, interruptibility, mwait);
        }

        let start = self.host().now_ns();
        let rc = self.host().block_until(vcpu.id(), poll.deadline_ns);
        let end = self.host().now_ns();
        vcpu.cmpxchg_state(VCpuState::Started, VCpuState::StartedHalted);
        vcpu.record_timed(HaltEvent::Block, end.saturating_sub(start));

        match rc {
            Ok(result) => {
                trace!("vCPU {}: block ended {result:?}", vcpu.id());
                if result != BlockResult::Interrupted {
                    self.record_timing(vcpu, end, poll.deadline_ns, cfg.timing_slack_ns);
                }
                if self.ring3_pending(vcpu) {
                    return self.to_ring3(vcpu, HaltEvent::ToRing3PostPendingFf);
                }
                if self.wake_pending(vcpu) {
                    vcpu.record(HaltEvent::ExecFromBlock);
                    return self.resolve(vcpu, interruptibility, mwait);
                }
                self.to_ring3(vcpu, HaltEvent::ToRing3PostNoInt)
            }
            Err(e) => {
                debug!("vCPU {}: halt wait failed: {e}", vcpu.id());
                self.to_ring3(vcpu, HaltEvent::ToRing3Other)
            }
        }
    }

    // ─── Steps ───────────────────────────────────────────────────

    fn roll_history(&self, vcpu: &VCpu, window: u32) {
        let (halts, succeeded, to_ring3) = vcpu.note_halt();
        if let Some((s, r)) = spin_history_update(halts, window, succeeded, to_ring3) {
            vcpu.reset_halt_history(s, r);
        }
    }

    /// Ring-3 has work, or the host wants us out.
    fn ring3_pending(&self, vcpu: &VCpu) -> bool {
        self.vm.ff.is_any_set(VmForceFlags::HALT_TO_RING3)
            || vcpu.ff.is_any_set(VCpuForceFlags::HALT_TO_RING3)
            || self.host().suspend_pending()
    }

    fn wake_pending(&self, vcpu: &VCpu) -> bool {
        if vcpu.ff.test_and_clear(VCpuForceFlags::UPDATE_APIC) {
            self.irq().update_pending(vcpu);
        }
        vcpu.ff.is_any_set(VCpuForceFlags::HALT_WAKE)
    }

    fn record_timing(&self, vcpu: &VCpu, woke_ns: u64, deadline_ns: u64, slack_ns: u64) {
        match classify_block(woke_ns, deadline_ns, slack_ns) {
            BlockTiming::Overslept(ns) => vcpu.record_timed(HaltEvent::BlockOverslept, ns),
            BlockTiming::Insomnia(ns) => vcpu.record_timed(HaltEvent::BlockInsomnia, ns),
            BlockTiming::OnTime => vcpu.record(HaltEvent::BlockOnTime),
        }
    }

    fn resolve(&self, vcpu: &VCpu, interruptibility: Interruptibility, mwait: u32) -> HaltOutcome {
        let ff = vcpu.ff.load();
        let pending = PendingWake {
            external: ff.intersects(VCpuForceFlags::INTERRUPT_APIC | VCpuForceFlags::INTERRUPT_PIC),
            nmi: ff.contains(VCpuForceFlags::INTERRUPT_NMI),
            smi: ff.contains(VCpuForceFlags::INTERRUPT_SMI),
            nested_guest: ff.contains(VCpuForceFlags::INTERRUPT_NESTED_GUEST),
            unhalt: ff.contains(VCpuForceFlags::UNHALT),
        };
        let mut decision = resolve_wake(pending, interruptibility, mwait);
        if decision == WakeDecision::DeliverInterrupt {
            match self.irq().get_interrupt(vcpu) {
                Some(vector) => {
                    vcpu.ff.clear(VCpuForceFlags::UNHALT);
                    self.irq().assert_trap(vcpu, vector);
                    trace!("vCPU {}: halt ends with vector {vector:#x}", vcpu.id());
                    return self.resume(vcpu);
                }
                None => {
                    decision = resolve_wake_fallback(vcpu.ff.is_any_set(VCpuForceFlags::UNHALT), mwait);
                }
            }
        }
        match decision {
            WakeDecision::Unhalt => {
                vcpu.ff.test_and_clear(VCpuForceFlags::UNHALT);
                self.resume(vcpu)
            }
            WakeDecision::MwaitBreak => self.resume(vcpu),
            WakeDecision::DeliverInterrupt | WakeDecision::ToRing3 | WakeDecision::StayHalted => {
                self.to_ring3(vcpu, HaltEvent::ToRing3)
            }
        }
    }

    fn resume(&self, vcpu: &VCpu) -> HaltOutcome {
        vcpu.record(HaltEvent::Exec);
        HaltOutcome::Resume
    }

    fn to_ring3(&self, vcpu: &VCpu, reason: HaltEvent) -> HaltOutcome {
        if reason != HaltEvent::ToRing3 {
            vcpu.record(reason);
        }
        vcpu.record(HaltEvent::ToRing3);
        HaltOutcome::ToRing3
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::StdHost;
    use crate::testutil::{build_vm, Fixture, MockHost};
    use crate::vm::VmConfig;
    use std::sync::Mutex;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn pending_apic_interrupt_resumes_without_blocking() {
        let fx = Fixture::new(MockHost::hookless());
        fx.irq.set_vector(Some(0x41));
        fx.vcpu().ff.set(VCpuForceFlags::INTERRUPT_APIC | VCpuForceFlags::UNHALT);

        assert_eq!(fx.vm.halt(0).unwrap(), HaltOutcome::Resume);
        assert!(fx.host.blocks().is_empty());
        assert_eq!(fx.irq.trapped(), vec![0x41]);
        assert!(!fx.vcpu().ff.is_any_set(VCpuForceFlags::UNHALT));
        assert_eq!(fx.vcpu().halt_stats().count(HaltEvent::Exec), 1);
    }

    #[test]
    fn ring3_work_wins_over_wake_sources() {
        let fx = Fixture::new(MockHost::hookless());
        fx.vcpu().ff.set(VCpuForceFlags::INTERRUPT_APIC | VCpuForceFlags::TIMER);
        assert_eq!(fx.vm.halt(0).unwrap(), HaltOutcome::ToRing3);
        let stats = fx.vcpu().halt_stats();
        assert_eq!(stats.count(HaltEvent::ToRing3PendingFf), 1);
        assert_eq!(stats.count(HaltEvent::ToRing3), 1);
        assert!(fx.irq.trapped().is_empty());
    }

    #[test]
    fn vm_wide_flags_also_force_ring3() {
        let fx = Fixture::new(MockHost::hookless());
        fx.vm.set_force_flags(VmForceFlags::EMT_RENDEZVOUS);
        assert_eq!(fx.vm.halt(0).unwrap(), HaltOutcome::ToRing3);
        assert!(fx.host.blocks().is_empty());
    }

    #[test]
    fn pending_suspend_forces_ring3() {
        let fx = Fixture::new(MockHost::hookless());
        fx.host.set_suspend(true);
        assert_eq!(fx.vm.halt(0).unwrap(), HaltOutcome::ToRing3);
        assert!(fx.host.blocks().is_empty());
    }

    #[test]
    fn not_interruptible_goes_to_ring3() {
        let fx = Fixture::new(MockHost::hookless());
        fx.irq.set_interruptibility(Interruptibility::IntDisabled);
        assert_eq!(fx.vm.halt(0).unwrap(), HaltOutcome::ToRing3);
        assert_eq!(fx.vcpu().halt_stats().count(HaltEvent::ToRing3Other), 1);
    }

    #[test]
    fn queued_trap_or_disabled_ring0_halts_go_to_ring3() {
        let fx = Fixture::new(MockHost::hookless());
        fx.irq.set_pending_trap(true);
        assert_eq!(fx.vm.halt(0).unwrap(), HaltOutcome::ToRing3);

        let fx = Fixture::new(MockHost::hookless());
        fx.vcpu().set_may_halt_in_ring0(false);
        fx.vcpu().ff.set(VCpuForceFlags::INTERRUPT_APIC);
        assert_eq!(fx.vm.halt(0).unwrap(), HaltOutcome::ToRing3);
        assert_eq!(fx.vcpu().halt_stats().count(HaltEvent::ToRing3Other), 1);
    }

    #[test]
    fn mwait_break_allows_halt_when_interrupts_are_masked() {
        let fx = Fixture::new(MockHost::hookless());
        fx.irq.set_interruptibility(Interruptibility::IntDisabled);
        fx.irq.set_mwait(2);
        fx.vcpu().ff.set(VCpuForceFlags::INTERRUPT_APIC);
        assert_eq!(fx.vm.halt(0).unwrap(), HaltOutcome::Resume);
        assert!(fx.irq.trapped().is_empty());
    }

    #[test]
    fn small_timer_delta_goes_to_ring3() {
        let fx = Fixture::new(MockHost::hookless());
        fx.timer.set_delta(1_000);
        assert_eq!(fx.vm.halt(0).unwrap(), HaltOutcome::ToRing3);
        assert_eq!(fx.vcpu().halt_stats().count(HaltEvent::ToRing3SmallDelta), 1);
        assert!(fx.host.blocks().is_empty());
    }

    #[test]
    fn update_apic_is_folded_in_before_the_wake_check() {
        let fx = Fixture::new(MockHost::hookless());
        fx.irq.set_vector(Some(0x30));
        fx.irq.post_on_update(VCpuForceFlags::INTERRUPT_APIC);
        fx.vcpu().ff.set(VCpuForceFlags::UPDATE_APIC);
        assert_eq!(fx.vm.halt(0).unwrap(), HaltOutcome::Resume);
        assert_eq!(fx.irq.updates(), 1);
        assert!(!fx.vcpu().ff.is_any_set(VCpuForceFlags::UPDATE_APIC));
    }

    #[test]
    fn blocks_until_deadline_then_returns_to_ring3() {
        let fx = Fixture::new(MockHost::hookless());
        fx.timer.set_delta(1_000_000);
        assert_eq!(fx.vm.halt(0).unwrap(), HaltOutcome::ToRing3);

        let blocks = fx.host.blocks();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0], (0, 1_000_000));
        assert_eq!(fx.vcpu().state(), VCpuState::Started);
        let stats = fx.vcpu().halt_stats();
        assert_eq!(stats.count(HaltEvent::Block), 1);
        assert_eq!(stats.count(HaltEvent::BlockOnTime), 1);
        assert_eq!(stats.count(HaltEvent::ToRing3PostNoInt), 1);
    }

    #[test]
    fn vcpu_is_marked_halted_while_blocked() {
        let fx = Fixture::new(MockHost::hookless());
        fx.irq.set_vector(Some(0x50));
        let vcpu = fx.vm.vcpu_handle(0).unwrap();
        let seen = Arc::new(Mutex::new(None));
        let seen_in_block = seen.clone();
        fx.host.on_block(move |_, _| {
            *seen_in_block.lock().unwrap() = Some(vcpu.state());
            vcpu.ff.set(VCpuForceFlags::INTERRUPT_APIC);
            Ok(BlockResult::Woken)
        });

        assert_eq!(fx.vm.halt(0).unwrap(), HaltOutcome::Resume);
        assert_eq!(*seen.lock().unwrap(), Some(VCpuState::StartedHalted));
        assert_eq!(fx.vcpu().state(), VCpuState::Started);
        assert_eq!(fx.vcpu().halt_stats().count(HaltEvent::ExecFromBlock), 1);
        assert_eq!(fx.irq.trapped(), vec![0x50]);
    }

    #[test]
    fn early_wake_is_classified_as_insomnia() {
        let fx = Fixture::new(MockHost::hookless());
        fx.timer.set_delta(10_000_000);
        fx.host.set_block_advance(1_000_000);
        fx.host.script_block(Ok(BlockResult::Woken));
        assert_eq!(fx.vm.halt(0).unwrap(), HaltOutcome::ToRing3);
        let stats = fx.vcpu().halt_stats();
        assert_eq!(stats.count(HaltEvent::BlockInsomnia), 1);
        assert_eq!(stats.nanos(HaltEvent::BlockInsomnia), 9_000_000);
    }

    #[test]
    fn block_error_goes_to_ring3() {
        let fx = Fixture::new(MockHost::hookless());
        fx.host.script_block(Err(crate::host::HostError::Block { vcpu: 0, reason: "signal".into() }));
        assert_eq!(fx.vm.halt(0).unwrap(), HaltOutcome::ToRing3);
        assert_eq!(fx.vcpu().halt_stats().count(HaltEvent::ToRing3Other), 1);
        assert_eq!(fx.vcpu().state(), VCpuState::Started);
    }

    #[test]
    fn smi_goes_to_ring3_even_when_interruptible() {
        let fx = Fixture::new(MockHost::hookless());
        fx.irq.set_vector(Some(0x20));
        fx.vcpu().ff.set(VCpuForceFlags::INTERRUPT_APIC | VCpuForceFlags::INTERRUPT_SMI);
        assert_eq!(fx.vm.halt(0).unwrap(), HaltOutcome::ToRing3);
        assert!(fx.irq.trapped().is_empty());
    }

    #[test]
    fn failed_vector_fetch_falls_back_to_unhalt() {
        let fx = Fixture::new(MockHost::hookless());
        fx.irq.set_vector(None);
        fx.vcpu().ff.set(VCpuForceFlags::INTERRUPT_PIC | VCpuForceFlags::UNHALT);
        assert_eq!(fx.vm.halt(0).unwrap(), HaltOutcome::Resume);
        assert!(!fx.vcpu().ff.is_any_set(VCpuForceFlags::UNHALT));
    }

    #[test]
    fn spins_only_after_a_history_of_ring0_wins() {
        let fx = Fixture::new(MockHost::hookless());
        fx.host.set_online_cpus(8);
        fx.vcpu().reset_halt_history(5, 0);
        let vcpu = fx.vm.vcpu_handle(0).unwrap();
        fx.host.on_pause(move |n| {
            if n == 3 {
                vcpu.ff.set(VCpuForceFlags::UNHALT);
            }
        });
        assert_eq!(fx.vm.halt(0).unwrap(), HaltOutcome::Resume);
        assert!(fx.host.blocks().is_empty());
        assert_eq!(fx.vcpu().halt_stats().count(HaltEvent::ExecFromSpin), 1);
    }

    #[test]
    fn history_window_rolls_over() {
        let fx = Fixture::new(MockHost::hookless());
        fx.timer.set_delta(1);
        fx.vcpu().reset_halt_history(100, 3);
        for _ in 0..256 {
            fx.vm.halt(0).unwrap();
        }
        assert_eq!(fx.vcpu().halt_history(), (2, 0));
    }

    #[test]
    fn poke_from_another_thread_ends_long_halt() {
        let (vm, parts) = build_vm(Arc::new(StdHost::new()), VmConfig::default());
        parts.timer.set_delta(10_000_000_000);
        parts.irq.set_vector(Some(0x30));
        let start = Instant::now();
        thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(Duration::from_millis(50));
                vm.raise_interrupt(0, VCpuForceFlags::INTERRUPT_APIC).unwrap();
            });
            assert_eq!(vm.halt(0).unwrap(), HaltOutcome::Resume);
        });
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(parts.irq.trapped(), vec![0x30]);
        assert_eq!(vm.vcpu(0).unwrap().halt_stats().count(HaltEvent::ExecFromBlock), 1);
    }
}
