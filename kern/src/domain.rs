// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Domain Registry (C4).
//!
//! Maintains the fixed-capacity domain array and each domain's handle
//! space. A handle space is a small, per-domain table redirecting local
//! integer handles to global capability ids (spec.md §3); the Capability
//! Table itself never hears about handles.

use abi::{CapId, DomainFlags, DomainId, DomainState, DomainType, Handle, Quota, Usage};

use crate::err::{CoreError, CoreResult};

/// Per-domain handle space: handle 0 is reserved, assignment is
/// first-free-slot (spec.md §3).
pub struct HandleSpace<const MAX_HANDLES: usize> {
    slots: [Option<CapId>; MAX_HANDLES],
}

impl<const MAX_HANDLES: usize> HandleSpace<MAX_HANDLES> {
    pub const fn new() -> Self {
        Self {
            slots: [None; MAX_HANDLES],
        }
    }

    pub fn resolve(&self, handle: Handle) -> Option<CapId> {
        if handle.is_reserved() {
            return None;
        }
        let idx = handle.0 as usize;
        self.slots.get(idx).copied().flatten()
    }

    /// Installs `cap_id` at the first free slot (slot 0 is never used: it
    /// is reserved as `Handle::NONE`).
    pub fn insert(&mut self, cap_id: CapId) -> CoreResult<Handle> {
        let slot = self.slots[1..]
            .iter()
            .position(Option::is_none)
            .map(|i| i + 1)
            .ok_or(CoreError::NoResource)?;
        self.slots[slot] = Some(cap_id);
        Ok(Handle(slot as u32))
    }

    /// Removes whichever handle names `cap_id`, if any (used when a
    /// capability transfers away from this domain).
    pub fn remove_cap(&mut self, cap_id: CapId) {
        for slot in self.slots.iter_mut() {
            if *slot == Some(cap_id) {
                *slot = None;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live capability ids held in this handle space, for the invariant
    /// checker (`invariant_revoke_consistency`).
    pub fn iter(&self) -> impl Iterator<Item = CapId> + '_ {
        self.slots.iter().filter_map(|s| *s)
    }
}

impl<const MAX_HANDLES: usize> Default for HandleSpace<MAX_HANDLES> {
    fn default() -> Self {
        Self::new()
    }
}

/// A domain's exclusive memory window, as recorded on its control block
/// (spec.md §3). Registration with the resource model is a separate step
/// (`ResourceModel::register_domain`); this is just the descriptive value.
#[derive(Copy, Clone, Debug)]
pub struct MemoryWindow {
    pub phys_base: u64,
    pub phys_size: u64,
}

/// Domain control block (spec.md §3, §4.4).
pub struct DomainControlBlock<const MAX_HANDLES: usize> {
    pub id: DomainId,
    pub kind: DomainType,
    pub state: DomainState,
    pub parent: Option<DomainId>,
    pub memory: MemoryWindow,
    pub handles: HandleSpace<MAX_HANDLES>,
    pub thread_count: u32,
    pub quota: Quota,
    pub usage: Usage,
    pub cap_count: u32,
    pub flags: DomainFlags,
}

impl<const MAX_HANDLES: usize> DomainControlBlock<MAX_HANDLES> {
    pub fn check_memory_quota(&self, additional: u64) -> bool {
        self.usage.memory_used.saturating_add(additional) <= self.quota.max_memory
    }

    pub fn check_thread_quota(&self) -> bool {
        self.usage.thread_used < self.quota.max_threads
    }

    pub fn check_cap_quota(&self) -> bool {
        self.cap_count < self.quota.max_caps
    }
}

/// The fixed-capacity domain array (spec.md §4.4). State machine:
/// `Init -> Ready -> Running <-> Suspended`; any state -> `Terminated`.
pub struct DomainRegistry<const MAX_DOMAINS: usize, const MAX_HANDLES: usize> {
    domains: [Option<DomainControlBlock<MAX_HANDLES>>; MAX_DOMAINS],
    generations: [u16; MAX_DOMAINS],
}

impl<const MAX_DOMAINS: usize, const MAX_HANDLES: usize>
    DomainRegistry<MAX_DOMAINS, MAX_HANDLES>
{
    pub const fn new() -> Self {
        Self {
            domains: [const { None }; MAX_DOMAINS],
            generations: [0; MAX_DOMAINS],
        }
    }

    fn slot_for(&self, id: DomainId) -> Option<usize> {
        if id.is_reserved() {
            return None;
        }
        let idx = id.index();
        if idx >= MAX_DOMAINS || self.generations[idx] != id.generation() {
            return None;
        }
        Some(idx)
    }

    pub fn get(&self, id: DomainId) -> Option<&DomainControlBlock<MAX_HANDLES>> {
        self.slot_for(id).and_then(|i| self.domains[i].as_ref())
    }

    pub fn get_mut(&mut self, id: DomainId) -> Option<&mut DomainControlBlock<MAX_HANDLES>> {
        let idx = self.slot_for(id)?;
        self.domains[idx].as_mut()
    }

    /// Allocates a control block in state `Init`, with an empty handle
    /// space and no capabilities (spec.md §4.4). Registering the actual
    /// memory region with the resource model is the caller's job
    /// (`Kernel::domain_create`), since this module doesn't know about
    /// `ResourceModel`.
    pub fn create(
        &mut self,
        kind: DomainType,
        parent: Option<DomainId>,
        quota: Quota,
        memory: MemoryWindow,
    ) -> CoreResult<DomainId> {
        let slot = self
            .domains
            .iter()
            .position(Option::is_none)
            .ok_or(CoreError::QuotaExceeded)?;
        let generation = self.generations[slot];
        let id = DomainId::for_index_and_generation(slot, generation);
        self.domains[slot] = Some(DomainControlBlock {
            id,
            kind,
            state: DomainState::Init,
            parent,
            memory,
            handles: HandleSpace::new(),
            thread_count: 0,
            quota,
            usage: Usage::default(),
            cap_count: 0,
            flags: DomainFlags::empty(),
        });
        Ok(id)
    }

    /// Only legal in state `Terminated` (spec.md §4.4). Capability revoking
    /// is the caller's responsibility (it needs the `CapTable`, which this
    /// module doesn't hold); by the time this is called the domain's
    /// capabilities must already be gone.
    pub fn destroy(&mut self, id: DomainId) -> CoreResult<()> {
        let idx = self.slot_for(id).ok_or(CoreError::NotFound)?;
        let domain = self.domains[idx].as_ref().unwrap();
        if domain.state != DomainState::Terminated {
            return Err(CoreError::InvalidState);
        }
        self.domains[idx] = None;
        self.generations[idx] = self.generations[idx].wrapping_add(1);
        Ok(())
    }

    pub fn transition_ready(&mut self, id: DomainId) -> CoreResult<()> {
        let d = self.get_mut(id).ok_or(CoreError::NotFound)?;
        if d.state != DomainState::Init {
            return Err(CoreError::InvalidState);
        }
        d.state = DomainState::Ready;
        Ok(())
    }

    pub fn transition_running(&mut self, id: DomainId) -> CoreResult<()> {
        let d = self.get_mut(id).ok_or(CoreError::NotFound)?;
        if !matches!(d.state, DomainState::Ready | DomainState::Suspended) {
            return Err(CoreError::InvalidState);
        }
        d.state = DomainState::Running;
        Ok(())
    }

    pub fn suspend(&mut self, id: DomainId) -> CoreResult<()> {
        let d = self.get_mut(id).ok_or(CoreError::NotFound)?;
        if d.state != DomainState::Running {
            return Err(CoreError::InvalidState);
        }
        d.state = DomainState::Suspended;
        Ok(())
    }

    pub fn resume(&mut self, id: DomainId) -> CoreResult<()> {
        let d = self.get_mut(id).ok_or(CoreError::NotFound)?;
        if d.state != DomainState::Suspended {
            return Err(CoreError::InvalidState);
        }
        d.state = DomainState::Running;
        Ok(())
    }

    pub fn terminate(&mut self, id: DomainId) -> CoreResult<()> {
        let d = self.get_mut(id).ok_or(CoreError::NotFound)?;
        d.state = DomainState::Terminated;
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &DomainControlBlock<MAX_HANDLES>> {
        self.domains.iter().filter_map(|d| d.as_ref())
    }
}

impl<const MAX_DOMAINS: usize, const MAX_HANDLES: usize> Default
    for DomainRegistry<MAX_DOMAINS, MAX_HANDLES>
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quota() -> Quota {
        Quota {
            max_memory: 0x10000,
            max_threads: 4,
            max_caps: 8,
            cpu_percent: 100,
        }
    }

    #[test]
    fn create_then_destroy_requires_terminated() {
        let mut reg: DomainRegistry<4, 4> = DomainRegistry::new();
        let id = reg
            .create(
                DomainType::Application,
                None,
                quota(),
                MemoryWindow {
                    phys_base: 0,
                    phys_size: 0x1000,
                },
            )
            .unwrap();
        assert_eq!(reg.destroy(id), Err(CoreError::InvalidState));
        reg.terminate(id).unwrap();
        assert!(reg.destroy(id).is_ok());
        assert!(reg.get(id).is_none());
    }

    #[test]
    fn state_machine_rejects_bad_transitions() {
        let mut reg: DomainRegistry<4, 4> = DomainRegistry::new();
        let id = reg
            .create(
                DomainType::Application,
                None,
                quota(),
                MemoryWindow {
                    phys_base: 0,
                    phys_size: 0x1000,
                },
            )
            .unwrap();
        assert_eq!(reg.suspend(id), Err(CoreError::InvalidState));
        reg.transition_ready(id).unwrap();
        reg.transition_running(id).unwrap();
        reg.suspend(id).unwrap();
        reg.resume(id).unwrap();
    }

    #[test]
    fn handle_zero_is_reserved() {
        let space: HandleSpace<8> = HandleSpace::new();
        assert_eq!(space.resolve(Handle(0)), None);
    }

    #[test]
    fn recreated_domain_gets_fresh_generation() {
        let mut reg: DomainRegistry<2, 4> = DomainRegistry::new();
        let mw = MemoryWindow {
            phys_base: 0,
            phys_size: 0x1000,
        };
        let id1 = reg
            .create(DomainType::Application, None, quota(), mw)
            .unwrap();
        reg.terminate(id1).unwrap();
        reg.destroy(id1).unwrap();
        let id2 = reg
            .create(DomainType::Application, None, quota(), mw)
            .unwrap();
        assert_ne!(id1, id2);
        assert!(reg.get(id1).is_none());
        assert!(reg.get(id2).is_some());
    }
}
