// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client-side call surface for Privileged-tier service code.
//!
//! `kern::Kernel` already exposes a `Status`-returning entry point per
//! spec.md §6 operation; this crate does not reimplement any of those
//! services (memory manager, monitor, capability broker, file system,
//! serial/VGA, libc-service all live outside the core). What it adds is the
//! ergonomic layer a service loop actually wants to write against: a handle
//! that remembers which domain and thread is calling so call sites stop
//! repeating those ids, and a couple of higher-level patterns (`hl`) built
//! on top of the raw entry points the same way hubris's `hl` module sits on
//! top of its syscall stubs.

#![cfg_attr(target_os = "none", no_std)]

pub use abi::*;

mod client;
pub mod hl;

pub use client::CoreClient;
