// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Exception / panic path (C9).
//!
//! Architectural faults are dispatched here and resolved per spec.md §4.9:
//! most terminate the offending thread and audit the event; a small set
//! (machine check, or a violated core invariant in a release build) are
//! unrecoverable and lead to [`panic_core`].

use abi::{DomainId, EventKind, ThreadId};

use crate::arch::Arch;
use crate::audit::AuditRing;

/// Taxonomy of faults the core recognizes (spec.md §4.9). Granularity
/// mirrors the teacher's `FaultInfo`: distinguishing the access pattern
/// matters for the default resolution, not just that "something went
/// wrong".
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Fault {
    /// Divide-by-zero, invalid opcode, alignment fault: terminate the
    /// thread unconditionally.
    IllegalInstruction,
    /// A memory or device access outside of any region the domain holds a
    /// capability for.
    MemoryAccess { address: Option<u64> },
    /// A memory access that *does* fall within a capability the domain
    /// holds, but protection state needs to be refreshed (e.g. MPU region
    /// reprogrammed) before the access can be retried.
    RecoverableMemoryAccess { address: u64 },
    /// A syscall was malformed: bad syscall number, bad argument, or a
    /// reference to a handle out of range.
    SyscallUsage,
    /// `panic()` invoked explicitly from Privileged/Application code via the
    /// `audit_append`/panic primitive.
    Explicit,
    /// Hardware-reported machine check: always fatal, never thread-local.
    MachineCheck,
    /// Breakpoint/debug exception with no registered handler.
    Debug,
}

impl Fault {
    /// Whether this fault terminates only the faulting thread (true) or
    /// escalates straight to a kernel panic (false).
    pub fn is_domain_local(self) -> bool {
        !matches!(self, Fault::MachineCheck)
    }
}

/// Outcome of dispatching a [`Fault`] against a thread.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum FaultResolution {
    /// The thread was terminated; the domain continues running.
    TerminateThread,
    /// The access was actually legal; protection was refreshed and the
    /// faulting instruction should be retried.
    Resume,
    /// Unrecoverable: the whole system must stop.
    Panic,
}

/// Resolves a fault per the default policy table of spec.md §4.9. A real
/// port additionally consults the domain's Memory capabilities for
/// `MemoryAccess` before concluding `TerminateThread`; that capability
/// lookup lives in `cap`/`resource` and is threaded in by the caller
/// (`Kernel::dispatch_fault`), not duplicated here.
pub fn resolve(fault: Fault) -> FaultResolution {
    match fault {
        Fault::IllegalInstruction
        | Fault::SyscallUsage
        | Fault::Explicit
        | Fault::Debug => FaultResolution::TerminateThread,
        Fault::MemoryAccess { .. } => FaultResolution::TerminateThread,
        Fault::RecoverableMemoryAccess { .. } => FaultResolution::Resume,
        Fault::MachineCheck => FaultResolution::Panic,
    }
}

/// Records a fault in the audit log before it is acted on. Authority over
/// what happens next (terminate vs. panic) lives in [`resolve`]; this is
/// purely the observability side of spec.md §4.9.
pub fn audit_fault<const N: usize>(
    ring: &mut AuditRing<N>,
    now: abi::Timestamp,
    domain: DomainId,
    thread: ThreadId,
    fault: Fault,
) {
    let code = match fault {
        Fault::IllegalInstruction => 1,
        Fault::MemoryAccess { .. } => 2,
        Fault::RecoverableMemoryAccess { .. } => 3,
        Fault::SyscallUsage => 4,
        Fault::Explicit => 5,
        Fault::MachineCheck => 6,
        Fault::Debug => 7,
    };
    ring.append(
        now,
        EventKind::Exception,
        domain,
        abi::CapId::NONE,
        thread,
        [code, 0, 0, 0],
        false,
    );
}

/// Unconditional, unrecoverable stop (spec.md §4.9: "Panic is fatal; no
/// recovery"). Flushes the audit log's tail, prints nothing further (a
/// Privileged console service owns formatting; the core itself only halts),
/// and never returns.
pub fn panic_core<A: Arch>(_reason: &str) -> ! {
    let _guard = crate::arch::IrqGuard::<A>::new();
    A::halt()
}
