// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Call Gate (C6): the single entry path from outside the core.
//!
//! Two shapes, per spec.md §4.6: a **local syscall** (a primitive within
//! the caller's own domain — capability check, no context switch) and a
//! **cross-domain invocation** (send on an Endpoint capability to a
//! handler living in another domain). Handlers are plain function
//! pointers rather than trait objects: the core never allocates, so there
//! is nowhere to put a `Box<dyn Handler>`.

use abi::{CallArgs, CapId, CapType, DomainId, EndpointId, EventKind, Rights, ThreadId, Timestamp, WaitDescriptor, WaitReason, WakeCause};

use crate::arch::Arch;
use crate::audit::AuditRing;
use crate::cap::CapTable;
use crate::err::{CoreError, CoreResult};
use crate::sched::Scheduler;
use crate::task::ThreadTable;

/// A registered endpoint handler. Receives the four argument words, returns
/// the single result word (spec.md §4.6, §6).
pub type HandlerFn = fn(CallArgs) -> u64;

#[derive(Copy, Clone)]
pub struct EndpointRecord {
    pub id: EndpointId,
    pub owner: DomainId,
    pub receiver: Option<ThreadId>,
    pub handler: Option<HandlerFn>,
}

/// The fixed-capacity endpoint table. An endpoint is created by a
/// Privileged service (`endpoint_register`) and named by an `Endpoint`
/// capability that services derive `INVOKE`-only children of to hand to
/// clients (spec.md §4.6, scenario 3).
pub struct EndpointTable<const N: usize> {
    entries: [Option<EndpointRecord>; N],
    generations: [u16; N],
}

impl<const N: usize> EndpointTable<N> {
    pub const fn new() -> Self {
        Self {
            entries: [None; N],
            generations: [0; N],
        }
    }

    fn slot_for(&self, id: EndpointId) -> Option<usize> {
        if id.is_reserved() {
            return None;
        }
        let idx = id.index();
        if idx >= N || self.generations[idx] != id.generation() {
            return None;
        }
        Some(idx)
    }

    pub fn get(&self, id: EndpointId) -> Option<&EndpointRecord> {
        self.slot_for(id).and_then(|i| self.entries[i].as_ref())
    }

    pub fn register(&mut self, owner: DomainId) -> CoreResult<EndpointId> {
        let slot = self
            .entries
            .iter()
            .position(Option::is_none)
            .ok_or(CoreError::NoResource)?;
        let generation = self.generations[slot];
        let id = EndpointId::for_index_and_generation(slot, generation);
        self.entries[slot] = Some(EndpointRecord {
            id,
            owner,
            receiver: None,
            handler: None,
        });
        Ok(id)
    }

    /// Binds the thread and function that service an endpoint. A service
    /// calls this once at startup; there is no queue of blocked receivers
    /// in this model — a bound endpoint behaves like a persistent service
    /// loop (spec.md §4.6's blocked-receiver queue degenerates to depth 1).
    pub fn bind_handler(
        &mut self,
        id: EndpointId,
        receiver: ThreadId,
        handler: HandlerFn,
    ) -> CoreResult<()> {
        let idx = self.slot_for(id).ok_or(CoreError::CapInvalid)?;
        let record = self.entries[idx].as_mut().unwrap();
        record.receiver = Some(receiver);
        record.handler = Some(handler);
        Ok(())
    }

    pub fn unregister(&mut self, id: EndpointId) {
        if let Some(idx) = self.slot_for(id) {
            self.entries[idx] = None;
            self.generations[idx] = self.generations[idx].wrapping_add(1);
        }
    }
}

impl<const N: usize> Default for EndpointTable<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Walks a capability's derivation chain to the `Endpoint` it ultimately
/// names. `INVOKE`-only children derived for clients carry `CapDerive`,
/// not `Endpoint`, directly.
fn resolve_endpoint<const N: usize>(table: &CapTable<N>, mut id: CapId) -> Option<EndpointId> {
    for _ in 0..N {
        let entry = table.get(id)?;
        match entry.cap_type {
            CapType::Endpoint(eid) => return Some(eid),
            CapType::CapDerive { parent, .. } => id = parent,
            _ => return None,
        }
    }
    None
}

/// A primitive within the caller's own domain: capability check (if the
/// primitive names one), audit, and return — no context switch, no
/// scheduler involvement (spec.md §4.6, "Local syscall").
pub fn local_syscall<const CAP_N: usize, const AUDIT_N: usize>(
    cap_table: &CapTable<CAP_N>,
    audit: &mut AuditRing<AUDIT_N>,
    now: Timestamp,
    caller_domain: DomainId,
    caller_thread: ThreadId,
    syscall_num: u16,
    cap_check: Option<(CapId, Rights)>,
) -> CoreResult<()> {
    let checked_cap = match cap_check {
        Some((cap_id, required)) => {
            cap_table.check(cap_id, required)?;
            cap_id
        }
        None => CapId::NONE,
    };
    audit.append(
        now,
        EventKind::Syscall,
        caller_domain,
        checked_cap,
        caller_thread,
        [syscall_num as u64, 0, 0, 0],
        true,
    );
    Ok(())
}

/// Send on an Endpoint capability (spec.md §4.6, "Cross-domain
/// invocation"). Loopback (caller and target domain coincide) takes the
/// fast path: no address-space rebind, no scheduler intervention, straight
/// through to the handler and back.
#[allow(clippy::too_many_arguments)]
pub fn cross_domain_invoke<A: Arch, const MAX_THREADS: usize, const CAP_N: usize, const EP_N: usize, const AUDIT_N: usize>(
    cap_table: &CapTable<CAP_N>,
    endpoints: &EndpointTable<EP_N>,
    tasks: &mut ThreadTable<A, MAX_THREADS>,
    sched: &mut Scheduler<MAX_THREADS>,
    audit: &mut AuditRing<AUDIT_N>,
    now: Timestamp,
    caller_domain: DomainId,
    caller_thread: ThreadId,
    endpoint_cap: CapId,
    args: CallArgs,
    deadline: Option<Timestamp>,
) -> CoreResult<u64> {
    cap_table.check(endpoint_cap, Rights::INVOKE)?;
    let endpoint_id = resolve_endpoint(cap_table, endpoint_cap).ok_or(CoreError::CapInvalid)?;
    let record = endpoints.get(endpoint_id).ok_or(CoreError::CapInvalid)?;
    let receiver = record.receiver.ok_or(CoreError::NotFound)?;
    let handler = record.handler.ok_or(CoreError::NotFound)?;
    let target_domain = record.owner;

    audit.append(
        now,
        EventKind::Syscall,
        caller_domain,
        endpoint_cap,
        caller_thread,
        args,
        true,
    );

    let fast_path = target_domain == caller_domain;

    if !fast_path {
        // A real port rebinds address protection here (page-table swap or
        // MPU reprogram via the Resource Model); this platform shape is
        // identity-mapped, so there is nothing to rebind.
        sched.block(
            tasks,
            caller_thread,
            WaitDescriptor {
                reason: WaitReason::Endpoint,
                resource: Some(endpoint_cap),
                deadline,
            },
        )?;
        sched.wakeup(tasks, receiver, WakeCause::Explicit)?;
        sched.schedule(tasks);
    }

    let result = handler(args);

    if !fast_path {
        sched.wakeup(tasks, caller_thread, WakeCause::Explicit)?;
        sched.schedule(tasks);
    }

    if let Some(t) = tasks.get_mut(caller_thread) {
        t.context.set_return(result);
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::host::Host;
    use crate::task::StackRegion;
    use abi::{CapType, Priority};

    fn stack() -> StackRegion {
        StackRegion {
            base: 0x1000,
            size: 0x1000,
        }
    }

    fn echo(args: CallArgs) -> u64 {
        args[0] + 1
    }

    #[test]
    fn loopback_fast_path_skips_scheduler() {
        let mut caps: CapTable<8> = CapTable::new();
        let mut endpoints: EndpointTable<4> = EndpointTable::new();
        let mut tasks: ThreadTable<Host, 8> = ThreadTable::new();
        let mut sched: Scheduler<8> = Scheduler::new();
        let mut audit: AuditRing<8> = AuditRing::new();

        let domain = DomainId(1);
        let client = sched
            .create(&mut tasks, domain, 0, stack(), Priority::Normal, Timestamp(0))
            .unwrap();
        sched.schedule(&mut tasks);
        let server = sched
            .create(&mut tasks, domain, 0, stack(), Priority::Normal, Timestamp(0))
            .unwrap();

        let endpoint = endpoints.register(domain).unwrap();
        endpoints.bind_handler(endpoint, server, echo).unwrap();

        let cap = caps
            .create(domain, CapType::Endpoint(endpoint), Rights::INVOKE)
            .unwrap();

        let result = cross_domain_invoke(
            &caps,
            &endpoints,
            &mut tasks,
            &mut sched,
            &mut audit,
            Timestamp(1),
            domain,
            client,
            cap,
            [41, 0, 0, 0],
            None,
        )
        .unwrap();
        assert_eq!(result, 42);
        // Loopback never blocked the caller.
        assert_eq!(
            tasks.get(client).unwrap().state,
            abi::ThreadState::Running
        );
    }

    #[test]
    fn missing_handler_is_not_found() {
        let mut caps: CapTable<8> = CapTable::new();
        let mut endpoints: EndpointTable<4> = EndpointTable::new();
        let mut tasks: ThreadTable<Host, 8> = ThreadTable::new();
        let mut sched: Scheduler<8> = Scheduler::new();
        let mut audit: AuditRing<8> = AuditRing::new();

        let domain = DomainId(1);
        let client = sched
            .create(&mut tasks, domain, 0, stack(), Priority::Normal, Timestamp(0))
            .unwrap();
        sched.schedule(&mut tasks);
        let endpoint = endpoints.register(domain).unwrap();
        let cap = caps
            .create(domain, CapType::Endpoint(endpoint), Rights::INVOKE)
            .unwrap();

        let err = cross_domain_invoke(
            &caps,
            &endpoints,
            &mut tasks,
            &mut sched,
            &mut audit,
            Timestamp(1),
            domain,
            client,
            cap,
            [0; 4],
            None,
        )
        .unwrap_err();
        assert_eq!(err, CoreError::NotFound);
    }

    #[test]
    fn invoking_without_invoke_right_is_denied() {
        let mut caps: CapTable<8> = CapTable::new();
        let endpoints: EndpointTable<4> = EndpointTable::new();
        let mut tasks: ThreadTable<Host, 8> = ThreadTable::new();
        let mut sched: Scheduler<8> = Scheduler::new();
        let mut audit: AuditRing<8> = AuditRing::new();

        let domain = DomainId(1);
        let client = sched
            .create(&mut tasks, domain, 0, stack(), Priority::Normal, Timestamp(0))
            .unwrap();
        sched.schedule(&mut tasks);
        let cap = caps
            .create(domain, CapType::Endpoint(abi::EndpointId(1)), Rights::READ)
            .unwrap();

        let err = cross_domain_invoke(
            &caps,
            &endpoints,
            &mut tasks,
            &mut sched,
            &mut audit,
            Timestamp(1),
            domain,
            client,
            cap,
            [0; 4],
            None,
        )
        .unwrap_err();
        assert_eq!(err, CoreError::Permission);
    }
}
