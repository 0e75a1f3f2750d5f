// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The hierarchical-isolation microkernel core.
//!
//! This is the trusted portion of the system: the capability table, the
//! domain/thread scheduler, the cross-domain call gate, the audit log, and
//! the runtime invariant checker. Everything outside of `arch` is written to
//! be portable across backends; architecture differences are confined to
//! the three backends in [`arch`] plus the host-only test backend.
//!
//! # Design principles
//!
//! 1. No locks. Core data structures are mutated only with interrupts
//!    disabled (`Arch::irq_save`/`irq_restore`); there is exactly one
//!    hardware execution stream (spec Non-goal: no SMP).
//! 2. No implicit suspension inside core primitives. Capability checks,
//!    audit appends, and scheduler bookkeeping never block.
//! 3. Errors are recognized values, not exceptions: every entry point
//!    returns a [`abi::Status`] (or the richer [`err::CoreError`]
//!    internally), and a failed mutation never leaves state half-changed.

#![cfg_attr(target_os = "none", no_std)]

pub mod arch;
pub mod audit;
pub mod callgate;
pub mod cap;
pub mod config;
pub mod domain;
pub mod err;
pub mod fault;
pub mod invariant;
pub mod resource;
pub mod sched;
pub mod task;

mod kernel;
pub use kernel::Kernel;
