//! Verified pure functions for the ring-0 runtime.
//!
//! This module contains pure, deterministic functions extracted from the
//! imperative shell. Each sub-module corresponds to a subsystem and
//! contains only functions with **no I/O, no locking, and no external
//! state mutation**.
//!
//! # Why a separate module?
//!
//! The hot paths in [`crate::pgm`] and [`crate::halt`] are mostly
//! arithmetic and small decisions wrapped in locking, atomics and host
//! calls. Pulling the decisions out gives:
//!
//! 1. A clear boundary between *decision logic* and *effectful shell*.
//! 2. Functions that are exhaustively testable with plain `#[test]`.
//! 3. No transitive dependency on `vm-memory` or the host traits.
//!
//! | Module        | Shell that delegates here          |
//! |---------------|------------------------------------|
//! | [`pgm`]       | `pgm::{tlb, chunk, phys, page}`    |
//! | [`halt`]      | `halt`, `entry`                    |

pub mod halt;
pub mod pgm;
