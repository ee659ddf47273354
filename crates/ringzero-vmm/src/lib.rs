//! RingZero VMM: the ring-0 half of a hosted hypervisor.
//!
//! This crate provides the two engines a VCPU thread (EMT) spends its
//! time in when it is not in ring-3: the guest-physical memory engine and
//! the halt/run scheduler.
//!
//! # Architecture
//!
//! - [`pgm`]: Guest-physical memory: page state machine, chunk mapping
//!   cache, per-EMT physical TLB, access handlers, PhysRead/PhysWrite
//! - [`vcpu`]: VCPU run state, force flags, halt statistics
//! - [`host`]: Host kernel services (preemption, CPU id, hooks, wait queue)
//! - [`hook`]: Thread-context hooks and manual switch-out around blocking
//! - [`halt`]: Ring-0 halt resolution (spin, block, wake decision)
//! - [`entry`]: The run-once entry dispatcher
//! - [`vm`]: VM object tying memory, VCPUs and host services together
//! - [`verified`]: Pure decision functions behind the engines
//!
//! ```text
//!   ring-3 run loop
//!        │ run_once(vcpu)
//!        ▼
//!   entry ──► hook ──► HmBackend::run_guest_code
//!     │                      │ PhysRead/PhysWrite
//!     │ Halt                 ▼
//!     ▼                     pgm ──► HostMemory chunks
//!   halt ──► HostScheduler::block_until
//! ```

pub mod entry;
pub mod halt;
pub mod hook;
pub mod host;
pub mod pgm;
pub mod vcpu;
pub mod verified;
pub mod vm;

#[cfg(test)]
pub(crate) mod testutil;
