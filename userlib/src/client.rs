// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed wrappers over the raw core entry points (spec.md §6).
//!
//! A [`CoreClient`] borrows the core context value (`kern::Kernel`) and
//! remembers the calling domain and thread, so a service doesn't have to
//! pass its own identity into every call it makes. It does not add any
//! behavior beyond that: every method is a thin forward to the matching
//! `Kernel` method.

use abi::{
    AllocKind, CallArgs, CapId, CapType, DomainId, Handle, Priority, Rights, Status, ThreadId,
    Timestamp, WaitDescriptor,
};
use kern::arch::Arch;
use kern::callgate::HandlerFn;
use kern::Kernel;

/// A capability-mediated handle onto the core, scoped to one calling
/// domain and thread. Build one per service entry and reuse it for the
/// lifetime of the call.
pub struct CoreClient<
    'k,
    A: Arch,
    const CAP_N: usize,
    const MAX_DOMAINS: usize,
    const MAX_HANDLES: usize,
    const MAX_THREADS: usize,
    const MAX_BLOCKS: usize,
    const AUDIT_N: usize,
    const EP_N: usize,
> {
    core: &'k mut Kernel<A, CAP_N, MAX_DOMAINS, MAX_HANDLES, MAX_THREADS, MAX_BLOCKS, AUDIT_N, EP_N>,
    domain: DomainId,
    thread: ThreadId,
}

impl<
        'k,
        A: Arch,
        const CAP_N: usize,
        const MAX_DOMAINS: usize,
        const MAX_HANDLES: usize,
        const MAX_THREADS: usize,
        const MAX_BLOCKS: usize,
        const AUDIT_N: usize,
        const EP_N: usize,
    > CoreClient<'k, A, CAP_N, MAX_DOMAINS, MAX_HANDLES, MAX_THREADS, MAX_BLOCKS, AUDIT_N, EP_N>
{
    pub fn new(
        core: &'k mut Kernel<A, CAP_N, MAX_DOMAINS, MAX_HANDLES, MAX_THREADS, MAX_BLOCKS, AUDIT_N, EP_N>,
        domain: DomainId,
        thread: ThreadId,
    ) -> Self {
        Self { core, domain, thread }
    }

    pub fn domain(&self) -> DomainId {
        self.domain
    }

    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    pub fn domain_memory_alloc(&mut self, size: u64, kind: AllocKind) -> Result<u64, Status> {
        self.core.domain_memory_alloc(self.domain, size, kind)
    }

    /// `authorizing_cap` must carry `Rights::GRANT`, or be omitted for a
    /// privileged boot-time creation (spec.md §4.3).
    pub fn cap_create(
        &mut self,
        cap_type: CapType,
        rights: Rights,
        authorizing_cap: Option<CapId>,
    ) -> Result<CapId, Status> {
        self.core.cap_create(self.domain, cap_type, rights, authorizing_cap)
    }

    pub fn cap_transfer(&mut self, to: DomainId, cap_id: CapId) -> Result<Handle, Status> {
        self.core.cap_transfer(self.domain, to, cap_id)
    }

    pub fn cap_derive(&mut self, parent_id: CapId, sub_rights: Rights) -> Result<CapId, Status> {
        self.core.cap_derive(self.domain, parent_id, sub_rights)
    }

    pub fn cap_revoke(&mut self, cap_id: CapId) -> Result<(), Status> {
        self.core.cap_revoke(cap_id)
    }

    pub fn cap_check(&mut self, handle: Handle, required: Rights) -> Result<(), Status> {
        self.core.cap_check(self.domain, handle, required)
    }

    pub fn thread_create(&mut self, entry: usize, priority: Priority) -> Result<ThreadId, Status> {
        self.core.thread_create(self.domain, entry, priority)
    }

    pub fn thread_block(&mut self, thread: ThreadId, wait: WaitDescriptor) -> Result<(), Status> {
        self.core.thread_block(thread, wait)
    }

    pub fn thread_wakeup(&mut self, thread: ThreadId) -> Result<(), Status> {
        self.core.thread_wakeup(thread)
    }

    pub fn thread_yield(&mut self) {
        self.core.thread_yield()
    }

    pub fn thread_terminate(&mut self, thread: ThreadId) -> Result<(), Status> {
        self.core.thread_terminate(thread)
    }

    pub fn endpoint_register(&mut self, receiver: ThreadId, handler: HandlerFn) -> Result<CapId, Status> {
        self.core.endpoint_register(self.domain, receiver, handler)
    }

    /// Calls through `endpoint_cap` as this client's domain and thread. The
    /// callee's status is propagated verbatim (spec.md §7): this never
    /// synthesizes success on a failed handler.
    pub fn endpoint_invoke(
        &mut self,
        endpoint_cap: CapId,
        args: CallArgs,
        deadline: Option<Timestamp>,
    ) -> Result<u64, Status> {
        self.core
            .endpoint_invoke(self.domain, self.thread, endpoint_cap, args, deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::{DomainType, Quota, RegionAttributes};
    use kern::arch::host::Host;

    type TestKernel = Kernel<Host, 16, 4, 8, 8, 4, 16, 4>;

    fn quota() -> Quota {
        Quota {
            max_memory: 0x10000,
            max_threads: 4,
            max_caps: 8,
            cpu_percent: 100,
        }
    }

    fn new_domain(k: &mut TestKernel, base: u64) -> DomainId {
        k.domain_create(
            DomainType::Application,
            None,
            quota(),
            base,
            0x1000,
            RegionAttributes::R | RegionAttributes::W,
        )
        .unwrap()
    }

    #[test]
    fn client_scopes_cap_create_to_its_own_domain() {
        let mut k = TestKernel::new(false);
        let dom = new_domain(&mut k, 0x1000);
        let thread = k.thread_create(dom, 0x4000, Priority::Normal).unwrap();
        let mut client = CoreClient::new(&mut k, dom, thread);
        let cap = client
            .cap_create(CapType::Memory { base: 0x1000, size: 0x100 }, Rights::READ, None)
            .unwrap();
        assert!(client.cap_check(Handle(0), Rights::READ).is_err());
        let _ = cap;
    }

    #[test]
    fn client_forwards_cross_domain_invoke_result() {
        fn echo(args: CallArgs) -> u64 {
            args[0] + 1
        }

        let mut k = TestKernel::new(false);
        let client_dom = new_domain(&mut k, 0x1000);
        let server_dom = new_domain(&mut k, 0x2000);
        let client_thread = k.thread_create(client_dom, 0x4000, Priority::Normal).unwrap();
        let server_thread = k.thread_create(server_dom, 0x5000, Priority::Normal).unwrap();

        let cap = k.endpoint_register(server_dom, server_thread, echo).unwrap();
        k.thread_block(
            server_thread,
            WaitDescriptor {
                reason: abi::WaitReason::Endpoint,
                resource: Some(cap),
                deadline: None,
            },
        )
        .unwrap();

        let mut client = CoreClient::new(&mut k, client_dom, client_thread);
        let result = client.endpoint_invoke(cap, [41, 0, 0, 0], None).unwrap();
        assert_eq!(result, 42);
    }
}
