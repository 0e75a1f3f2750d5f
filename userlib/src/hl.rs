// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! High-level user interface.
//!
//! Thin conveniences on top of [`crate::CoreClient`], the way hubris's own
//! `hl` module sits on top of its syscall stubs. Where hubris marshals
//! messages through byte buffers, our Call Gate is register-based (four
//! `u64` arguments, one `u64` reply), so the patterns here are simpler:
//! a typed request encodes itself into `CallArgs`, and blocking on a
//! deadline is just `thread_block` with a `Signal` wait.

use abi::{CallArgs, CapId, Priority, Status, ThreadId, Timestamp, WaitDescriptor, WaitReason};
use kern::arch::Arch;

use crate::CoreClient;

/// A typed cross-domain request. Implementors describe how their fields
/// pack into the four argument registers the Call Gate carries.
pub trait Call {
    fn encode(&self) -> CallArgs;
}

/// Calls `endpoint` with `request.encode()`, propagating the callee's
/// status verbatim (spec.md §7).
pub fn call<
    A: Arch,
    const CAP_N: usize,
    const MAX_DOMAINS: usize,
    const MAX_HANDLES: usize,
    const MAX_THREADS: usize,
    const MAX_BLOCKS: usize,
    const AUDIT_N: usize,
    const EP_N: usize,
    C: Call,
>(
    client: &mut CoreClient<
        '_,
        A,
        CAP_N,
        MAX_DOMAINS,
        MAX_HANDLES,
        MAX_THREADS,
        MAX_BLOCKS,
        AUDIT_N,
        EP_N,
    >,
    endpoint: CapId,
    request: &C,
    deadline: Option<Timestamp>,
) -> Result<u64, Status> {
    client.endpoint_invoke(endpoint, request.encode(), deadline)
}

/// Blocks `thread` on its own `Signal` wait until the core's clock reaches
/// `deadline`. The actual wakeup is delivered by `Kernel::tick`'s timeout
/// sweep; this just records the wait (spec.md §4.5).
pub fn sleep_until<
    A: Arch,
    const CAP_N: usize,
    const MAX_DOMAINS: usize,
    const MAX_HANDLES: usize,
    const MAX_THREADS: usize,
    const MAX_BLOCKS: usize,
    const AUDIT_N: usize,
    const EP_N: usize,
>(
    client: &mut CoreClient<
        '_,
        A,
        CAP_N,
        MAX_DOMAINS,
        MAX_HANDLES,
        MAX_THREADS,
        MAX_BLOCKS,
        AUDIT_N,
        EP_N,
    >,
    thread: ThreadId,
    deadline: Timestamp,
) -> Result<(), Status> {
    client.thread_block(
        thread,
        WaitDescriptor {
            reason: WaitReason::Signal,
            resource: None,
            deadline: Some(deadline),
        },
    )
}

/// Runs a minimal service loop body once: block `thread` waiting on
/// `endpoint`, yield the core's attention to the scheduler, and return. A
/// real service wraps this in `loop {}` between handling callbacks that
/// the registered `HandlerFn` executes synchronously on its behalf.
pub fn wait_for_request<
    A: Arch,
    const CAP_N: usize,
    const MAX_DOMAINS: usize,
    const MAX_HANDLES: usize,
    const MAX_THREADS: usize,
    const MAX_BLOCKS: usize,
    const AUDIT_N: usize,
    const EP_N: usize,
>(
    client: &mut CoreClient<
        '_,
        A,
        CAP_N,
        MAX_DOMAINS,
        MAX_HANDLES,
        MAX_THREADS,
        MAX_BLOCKS,
        AUDIT_N,
        EP_N,
    >,
    thread: ThreadId,
    endpoint: CapId,
) -> Result<(), Status> {
    client.thread_block(
        thread,
        WaitDescriptor {
            reason: WaitReason::Endpoint,
            resource: Some(endpoint),
            deadline: None,
        },
    )
}

/// Lowest priority a background service loop should run at unless it has a
/// specific reason to run higher (matches `abi::Priority::Low`, one above
/// the idle thread).
pub const DEFAULT_SERVICE_PRIORITY: Priority = Priority::Low;
