//! Pure decision functions for the ring-0 halt path.
//!
//! The effectful halt loop in [`crate::halt`] polls force flags, flips
//! run states and blocks on the host scheduler. Everything it *decides*
//! lives here: the rolling spin history, whether spinning is worth it,
//! how a finished block is classified, and how pending wake-up sources
//! are resolved against the guest's interruptibility.
//!
//! | Verified function        | Delegated from                     |
//! |--------------------------|------------------------------------|
//! | [`spin_history_update`]  | `halt::HaltScheduler::halt`        |
//! | [`should_spin`]          | `halt::HaltScheduler::halt`        |
//! | [`classify_block`]       | `halt::HaltScheduler::block`       |
//! | [`resolve_wake`]         | `halt::HaltScheduler::resolve`     |
//! | [`resolve_wake_fallback`]| `halt::HaltScheduler::resolve`     |
//! | [`halt_allowed`]         | `halt::HaltScheduler::halt`        |

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

/// How interruptible the guest currently is, from fully open to closed.
///
/// The ordering is meaningful: a state compares "less than" another when
/// it blocks fewer event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Interruptibility {
    Invalid,
    /// External interrupts, NMIs and SMIs can all be delivered.
    Unrestrained,
    /// Nested-guest virtual interrupts are masked.
    VirtIntDisabled,
    /// RFLAGS.IF clear.
    IntDisabled,
    /// Interrupt shadow (STI / MOV SS).
    IntInhibited,
    /// NMIs blocked too.
    NmiInhibit,
    /// GIF clear; nothing gets in.
    GlobalIntDisabled,
}

/// Snapshot of the wake-relevant per-VCPU force flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingWake {
    /// APIC or PIC interrupt pending.
    pub external: bool,
    pub nmi: bool,
    pub smi: bool,
    pub nested_guest: bool,
    pub unhalt: bool,
}

impl PendingWake {
    #[inline]
    pub fn any(&self) -> bool {
        self.external || self.nmi || self.smi || self.nested_guest || self.unhalt
    }
}

/// What to do with a halted VCPU given its pending wake sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeDecision {
    /// Fetch an external interrupt vector and inject it.
    DeliverInterrupt,
    /// Ring-3 has to handle the event (SMI, NMI, nested guest).
    ToRing3,
    /// The UNHALT flag was set: resume without an interrupt.
    Unhalt,
    /// MWAIT with break-on-interrupt is armed: resume.
    MwaitBreak,
    /// Nothing resolvable here; the halt stands.
    StayHalted,
}

/// Outcome of a finished host block, relative to the timer deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTiming {
    /// Woke later than `deadline + slack`; carries the excess in ns.
    Overslept(u64),
    /// Woke earlier than `deadline - slack`; carries the shortfall in ns.
    Insomnia(u64),
    OnTime,
}

// ═══════════════════════════════════════════════════════════════════════
//  Spin heuristic
// ═══════════════════════════════════════════════════════════════════════

/// Update the rolling halt history after the `halts`-th halt.
///
/// Every `window` halts the counters are reset to a small bias
/// reflecting which side won the last window: `(2, 0)` if more halts
/// were resolved in ring-0 than bounced to ring-3, `(0, 2)` otherwise.
/// Returns `None` when the window has not rolled over.
#[inline]
pub fn spin_history_update(
    halts: u32,
    window: u32,
    succeeded: u32,
    to_ring3: u32,
) -> Option<(u32, u32)> {
    debug_assert!(window.is_power_of_two(), "precondition: power-of-two window");
    if halts & (window - 1) != 0 {
        return None;
    }
    Some(if succeeded > to_ring3 { (2, 0) } else { (0, 2) })
}

/// Whether the halt path should spin before blocking.
#[inline]
pub fn should_spin(succeeded: u32, to_ring3: u32, online_cpus: u32, min_cpus: u32) -> bool {
    succeeded > to_ring3 && online_cpus >= min_cpus
}

// ═══════════════════════════════════════════════════════════════════════
//  Block timing
// ═══════════════════════════════════════════════════════════════════════

/// Classify a block that ended at `woke_ns` against `deadline_ns`.
#[inline]
pub fn classify_block(woke_ns: u64, deadline_ns: u64, slack_ns: u64) -> BlockTiming {
    if woke_ns > deadline_ns.saturating_add(slack_ns) {
        BlockTiming::Overslept(woke_ns - deadline_ns)
    } else if woke_ns.saturating_add(slack_ns) < deadline_ns {
        BlockTiming::Insomnia(deadline_ns - woke_ns)
    } else {
        BlockTiming::OnTime
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Wake resolution
// ═══════════════════════════════════════════════════════════════════════

/// Resolve pending wake sources in priority order.
///
/// The first four sources are exclusive: only the first one present is
/// considered.
///
/// 1. External interrupt with no NMI/SMI pending: deliver it if the
///    guest is unrestrained.
/// 2. SMI: ring-3.
/// 3. NMI while NMIs are not inhibited: ring-3.
/// 4. Nested-guest interrupt while virtual interrupts are open: ring-3.
///
/// Anything not decided above goes to [`resolve_wake_fallback`]. A caller
/// that fails to fetch a vector after [`WakeDecision::DeliverInterrupt`]
/// calls that directly.
pub fn resolve_wake(
    pending: PendingWake,
    interruptibility: Interruptibility,
    mwait_state: u32,
) -> WakeDecision {
    if pending.external && !pending.nmi && !pending.smi {
        if interruptibility <= Interruptibility::Unrestrained {
            return WakeDecision::DeliverInterrupt;
        }
    } else if pending.smi {
        return WakeDecision::ToRing3;
    } else if pending.nmi {
        if interruptibility < Interruptibility::NmiInhibit {
            return WakeDecision::ToRing3;
        }
    } else if pending.nested_guest && interruptibility < Interruptibility::VirtIntDisabled {
        return WakeDecision::ToRing3;
    }
    resolve_wake_fallback(pending.unhalt, mwait_state)
}

/// 5. UNHALT: resume. 6. MWAIT state above 1 (break on interrupt):
/// resume. Otherwise the halt stands.
#[inline]
pub fn resolve_wake_fallback(unhalt: bool, mwait_state: u32) -> WakeDecision {
    if unhalt {
        WakeDecision::Unhalt
    } else if mwait_state > 1 {
        WakeDecision::MwaitBreak
    } else {
        WakeDecision::StayHalted
    }
}

/// Whether the guest may halt in ring-0 at all.
#[inline]
pub fn halt_allowed(interruptibility: Interruptibility, mwait_state: u32) -> bool {
    interruptibility == Interruptibility::Unrestrained || mwait_state > 1
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    // ─── Spin history ────────────────────────────────────────────

    #[test]
    fn history_only_rolls_on_window_boundary() {
        assert_eq!(spin_history_update(1, 256, 10, 3), None);
        assert_eq!(spin_history_update(255, 256, 10, 3), None);
        assert_eq!(spin_history_update(256, 256, 10, 3), Some((2, 0)));
        assert_eq!(spin_history_update(512, 256, 3, 10), Some((0, 2)));
    }

    #[test]
    fn history_tie_favors_ring3() {
        assert_eq!(spin_history_update(256, 256, 5, 5), Some((0, 2)));
    }

    #[test]
    fn spin_needs_history_and_cpus() {
        assert!(should_spin(2, 0, 4, 4));
        assert!(!should_spin(2, 0, 3, 4), "too few host CPUs");
        assert!(!should_spin(0, 2, 8, 4), "history says ring-3 wins");
        assert!(!should_spin(0, 0, 8, 4), "fresh history does not spin");
    }

    // ─── Block timing ────────────────────────────────────────────

    #[test]
    fn block_timing_uses_symmetric_slack() {
        let d = 1_000_000;
        assert_eq!(classify_block(d, d, 50_000), BlockTiming::OnTime);
        assert_eq!(classify_block(d + 50_000, d, 50_000), BlockTiming::OnTime);
        assert_eq!(classify_block(d + 50_001, d, 50_000), BlockTiming::Overslept(50_001));
        assert_eq!(classify_block(d - 50_001, d, 50_000), BlockTiming::Insomnia(50_001));
    }

    // ─── Wake resolution ─────────────────────────────────────────

    #[test]
    fn external_interrupt_delivered_when_unrestrained() {
        let p = PendingWake { external: true, ..Default::default() };
        assert_eq!(
            resolve_wake(p, Interruptibility::Unrestrained, 0),
            WakeDecision::DeliverInterrupt
        );
    }

    #[test]
    fn external_interrupt_blocked_by_if_stays_halted() {
        let p = PendingWake { external: true, ..Default::default() };
        assert_eq!(
            resolve_wake(p, Interruptibility::IntDisabled, 0),
            WakeDecision::StayHalted
        );
        assert_eq!(
            resolve_wake(p, Interruptibility::IntDisabled, 2),
            WakeDecision::MwaitBreak
        );
    }

    #[test]
    fn smi_and_nmi_go_to_ring3() {
        let smi = PendingWake { external: true, smi: true, ..Default::default() };
        assert_eq!(resolve_wake(smi, Interruptibility::Unrestrained, 0), WakeDecision::ToRing3);

        let nmi = PendingWake { nmi: true, ..Default::default() };
        assert_eq!(resolve_wake(nmi, Interruptibility::IntInhibited, 0), WakeDecision::ToRing3);
        assert_eq!(
            resolve_wake(nmi, Interruptibility::NmiInhibit, 0),
            WakeDecision::StayHalted,
            "inhibited NMI cannot wake"
        );
    }

    #[test]
    fn nested_guest_interrupt_respects_virt_masking() {
        let p = PendingWake { nested_guest: true, ..Default::default() };
        assert_eq!(resolve_wake(p, Interruptibility::Unrestrained, 0), WakeDecision::ToRing3);
        assert_eq!(
            resolve_wake(p, Interruptibility::VirtIntDisabled, 0),
            WakeDecision::StayHalted
        );
    }

    #[test]
    fn masked_external_interrupt_skips_nested_check() {
        let p = PendingWake { external: true, nested_guest: true, ..Default::default() };
        assert_eq!(resolve_wake(p, Interruptibility::IntDisabled, 0), WakeDecision::StayHalted);
        assert_eq!(resolve_wake_fallback(true, 0), WakeDecision::Unhalt);
    }

    #[test]
    fn unhalt_resumes() {
        let p = PendingWake { unhalt: true, ..Default::default() };
        assert_eq!(resolve_wake(p, Interruptibility::IntDisabled, 0), WakeDecision::Unhalt);
        assert!(p.any());
        assert!(!PendingWake::default().any());
    }

    #[test]
    fn halt_allowed_only_unrestrained_or_mwait() {
        assert!(halt_allowed(Interruptibility::Unrestrained, 0));
        assert!(!halt_allowed(Interruptibility::IntInhibited, 0));
        assert!(halt_allowed(Interruptibility::IntInhibited, 2));
        assert!(!halt_allowed(Interruptibility::Invalid, 1));
    }
}
