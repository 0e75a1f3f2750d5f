// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Capability Table (C3).
//!
//! A single, process-wide array of capability entries; entry indices are
//! (the index part of) capability ids. The table is ground truth — handle
//! spaces in `domain` are just redirections into it (spec.md §4.3).
//!
//! The derivation graph is a forest where each entry stores only its parent
//! id, not a child list (spec.md §9): revocation walks the table once,
//! marking every entry whose parent chain reaches the target. This trades
//! O(N) revoke cost for O(1) extra storage per entry and rules out cyclic
//! ownership by construction.

use abi::{CapFlags, CapId, CapType, DomainId, Rights};

use crate::err::{CoreError, CoreResult};

/// One entry of the capability table (spec.md §3).
#[derive(Copy, Clone, Debug)]
pub struct CapEntry {
    pub id: CapId,
    pub cap_type: CapType,
    /// Nominal rights this entry was created with. For a derived entry this
    /// is the `sub_rights` it was created with; the rights actually usable
    /// at check time are `effective_rights`, which re-intersects with the
    /// parent chain live (spec.md §4.3: "a later shrink of the parent
    /// propagates").
    pub rights: Rights,
    pub owner: DomainId,
    pub flags: CapFlags,
}

impl CapEntry {
    pub fn is_revoked(&self) -> bool {
        self.flags.contains(CapFlags::REVOKED)
    }

    fn parent(&self) -> Option<CapId> {
        match self.cap_type {
            CapType::CapDerive { parent, .. } => Some(parent),
            _ => None,
        }
    }
}

/// Up to four revoked ids, for the audit payload (spec.md §4.3: "Emits
/// `CAP_REVOKE` with the set of revoked ids (truncated to payload capacity
/// if large)").
#[derive(Copy, Clone, Debug, Default)]
pub struct RevokeSummary {
    pub total: u32,
    pub sample: [CapId; 4],
}

/// The global capability array (spec.md §4.3). `N` is a platform-config
/// constant, not a hard-coded one (spec.md §9, source ambiguity (a)).
pub struct CapTable<const N: usize> {
    entries: [Option<CapEntry>; N],
    /// Monotonically increasing generation counter. Bumped every time a
    /// slot is reused, so a stale id from before a `revoke` + re-`create`
    /// in the same slot resolves to `CAP_INVALID` rather than aliasing the
    /// new entry (spec.md §8: "create → revoke → create ... produces
    /// distinct cap_ids").
    generations: [u16; N],
}

impl<const N: usize> CapTable<N> {
    pub const fn new() -> Self {
        Self {
            entries: [None; N],
            generations: [0; N],
        }
    }

    fn resolve(&self, id: CapId) -> Option<&CapEntry> {
        if id.is_reserved() {
            return None;
        }
        let idx = id.index();
        if idx >= N {
            return None;
        }
        if self.generations[idx] != id.generation() {
            return None;
        }
        self.entries[idx].as_ref()
    }

    fn resolve_mut(&mut self, id: CapId) -> Option<&mut CapEntry> {
        if id.is_reserved() {
            return None;
        }
        let idx = id.index();
        if idx >= N {
            return None;
        }
        if self.generations[idx] != id.generation() {
            return None;
        }
        self.entries[idx].as_mut()
    }

    pub fn get(&self, id: CapId) -> Option<&CapEntry> {
        self.resolve(id)
    }

    /// Live entries in slot order, for the invariant checker.
    pub fn iter(&self) -> impl Iterator<Item = &CapEntry> {
        self.entries.iter().filter_map(|e| e.as_ref())
    }

    /// Creates a new entry owned by `owner`. Quota (`max_caps`) is a
    /// domain-level concern enforced by the caller (`Kernel::cap_create`)
    /// before this is reached; this function only needs a free slot.
    pub fn create(
        &mut self,
        owner: DomainId,
        cap_type: CapType,
        rights: Rights,
    ) -> CoreResult<CapId> {
        let slot = self
            .entries
            .iter()
            .position(|e| e.is_none())
            .ok_or(CoreError::QuotaExceeded)?;
        let generation = self.generations[slot];
        let id = CapId::for_index_and_generation(slot, generation);
        self.entries[slot] = Some(CapEntry {
            id,
            cap_type,
            rights,
            owner,
            flags: CapFlags::empty(),
        });
        Ok(id)
    }

    /// Changes ownership of `cap_id` from `from` to `to`. The entry's id
    /// never changes (Invariant 4, conservation); only `owner` is mutated,
    /// so any reader sees either the pre- or post-transfer owner, never a
    /// torn state, because the whole operation runs with interrupts
    /// disabled.
    pub fn transfer(&mut self, from: DomainId, to: DomainId, cap_id: CapId) -> CoreResult<()> {
        let entry = self.resolve_mut(cap_id).ok_or(CoreError::CapInvalid)?;
        if entry.is_revoked() {
            return Err(CoreError::CapRevoked);
        }
        if entry.owner != from {
            return Err(CoreError::Permission);
        }
        if !entry.rights.contains(Rights::TRANSFER) {
            return Err(CoreError::Permission);
        }
        entry.owner = to;
        Ok(())
    }

    /// Computes the rights actually usable right now: `sub_rights`
    /// intersected live with every ancestor up the derivation chain
    /// (Invariant 2). Returns `None` if any ancestor is missing or revoked.
    pub fn effective_rights(&self, cap_id: CapId) -> Option<Rights> {
        let entry = self.resolve(cap_id)?;
        if entry.is_revoked() {
            return None;
        }
        match entry.parent() {
            None => Some(entry.rights),
            Some(parent) => {
                let parent_rights = self.effective_rights(parent)?;
                Some(entry.rights & parent_rights)
            }
        }
    }

    /// Derives a new capability from `parent_id` with `sub_rights`, owned
    /// by `owner`. Requires `sub_rights ⊆ effective_rights(parent)` and
    /// `parent` not revoked (spec.md §4.3).
    pub fn derive(
        &mut self,
        owner: DomainId,
        parent_id: CapId,
        sub_rights: Rights,
    ) -> CoreResult<CapId> {
        let parent_rights = self.effective_rights(parent_id).ok_or(CoreError::CapRevoked)?;
        if !parent_rights.contains(sub_rights) {
            return Err(CoreError::Permission);
        }
        self.create(
            owner,
            CapType::CapDerive {
                parent: parent_id,
                sub_rights,
            },
            sub_rights,
        )
    }

    /// Tests whether `id` (or any ancestor reachable by its `CapDerive`
    /// chain) is `target`. Bounded by table depth so a corrupt/cyclic chain
    /// (which construction should never produce) can't loop forever.
    fn reaches(&self, id: CapId, target: CapId) -> bool {
        let mut current = id;
        for _ in 0..N {
            if current == target {
                return true;
            }
            match self.resolve(current).and_then(CapEntry::parent) {
                Some(parent) => current = parent,
                None => return false,
            }
        }
        false
    }

    /// Marks `target` and every descendant of `target` REVOKED. Observable
    /// atomically because the whole scan runs with interrupts disabled
    /// (Invariant 3).
    pub fn revoke(&mut self, target: CapId) -> CoreResult<RevokeSummary> {
        if self.resolve(target).is_none() {
            return Err(CoreError::CapInvalid);
        }
        let mut summary = RevokeSummary::default();
        for slot in 0..N {
            let id = match &self.entries[slot] {
                Some(e) => e.id,
                None => continue,
            };
            if self.reaches(id, target) {
                if let Some(entry) = self.entries[slot].as_mut() {
                    entry.flags.insert(CapFlags::REVOKED);
                }
                if (summary.total as usize) < summary.sample.len() {
                    summary.sample[summary.total as usize] = id;
                }
                summary.total += 1;
            }
        }
        Ok(summary)
    }

    /// Resolves `id` and checks it carries every right in `required`.
    /// Direct array indexing (via `CapId::index`), so this is O(1) —
    /// constant time with respect to table size, per spec.md §4.3.
    pub fn check(&self, id: CapId, required: Rights) -> CoreResult<()> {
        let entry = self.resolve(id).ok_or(CoreError::CapInvalid)?;
        if entry.is_revoked() {
            return Err(CoreError::CapRevoked);
        }
        let effective = self.effective_rights(id).ok_or(CoreError::CapRevoked)?;
        if !effective.contains(required) {
            return Err(CoreError::Permission);
        }
        Ok(())
    }

    /// Frees the slot backing `id` and bumps its generation, reclaiming
    /// storage for `create`. Callers are expected to have already revoked
    /// (or never granted descendants to) `id`.
    pub fn destroy(&mut self, id: CapId) {
        if let Some(idx) = (!id.is_reserved() && id.index() < N).then(|| id.index()) {
            if self.generations[idx] == id.generation() {
                self.entries[idx] = None;
                self.generations[idx] = self.generations[idx].wrapping_add(1);
            }
        }
    }
}

impl<const N: usize> Default for CapTable<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::CapType;

    fn mem() -> CapType {
        CapType::Memory {
            base: 0x0200_0000,
            size: 0x1000,
        }
    }

    #[test]
    fn create_then_check_succeeds() {
        let mut table: CapTable<16> = CapTable::new();
        let id = table
            .create(DomainId(1), mem(), Rights::READ | Rights::WRITE)
            .unwrap();
        assert!(table.check(id, Rights::READ).is_ok());
        assert!(table.check(id, Rights::EXECUTE).is_err());
    }

    #[test]
    fn transfer_changes_owner_not_id() {
        let mut table: CapTable<16> = CapTable::new();
        let id = table
            .create(DomainId(1), mem(), Rights::READ | Rights::TRANSFER)
            .unwrap();
        table.transfer(DomainId(1), DomainId(2), id).unwrap();
        assert_eq!(table.get(id).unwrap().owner, DomainId(2));
        // Reversing the transfer restores the original owner with no new id.
        table
            .entries
            .iter_mut()
            .flatten()
            .find(|e| e.id == id)
            .unwrap()
            .rights
            .insert(Rights::TRANSFER);
        table.transfer(DomainId(2), DomainId(1), id).unwrap();
        assert_eq!(table.get(id).unwrap().owner, DomainId(1));
    }

    #[test]
    fn transfer_without_right_is_denied() {
        let mut table: CapTable<16> = CapTable::new();
        let id = table.create(DomainId(1), mem(), Rights::READ).unwrap();
        assert_eq!(
            table.transfer(DomainId(1), DomainId(2), id),
            Err(CoreError::Permission)
        );
    }

    #[test]
    fn derive_rights_must_be_subset() {
        let mut table: CapTable<16> = CapTable::new();
        let parent = table
            .create(DomainId(1), mem(), Rights::READ | Rights::WRITE | Rights::GRANT)
            .unwrap();
        assert!(table.derive(DomainId(1), parent, Rights::READ).is_ok());
        assert_eq!(
            table.derive(DomainId(1), parent, Rights::EXECUTE),
            Err(CoreError::Permission)
        );
    }

    #[test]
    fn revoke_closure_covers_whole_subtree() {
        let mut table: CapTable<16> = CapTable::new();
        let root = table
            .create(DomainId(1), mem(), Rights::READ | Rights::WRITE | Rights::GRANT)
            .unwrap();
        let child = table.derive(DomainId(2), root, Rights::READ).unwrap();
        let grand = table.derive(DomainId(3), child, Rights::READ).unwrap();

        let summary = table.revoke(root).unwrap();
        assert_eq!(summary.total, 3);
        assert!(table.get(root).unwrap().is_revoked());
        assert!(table.get(child).unwrap().is_revoked());
        assert!(table.get(grand).unwrap().is_revoked());
        assert_eq!(table.check(grand, Rights::READ), Err(CoreError::CapRevoked));
    }

    #[test]
    fn shrinking_parent_rights_propagates_live() {
        let mut table: CapTable<16> = CapTable::new();
        let parent = table
            .create(DomainId(1), mem(), Rights::READ | Rights::WRITE | Rights::GRANT)
            .unwrap();
        let child = table.derive(DomainId(2), parent, Rights::READ).unwrap();
        assert!(table.check(child, Rights::READ).is_ok());

        table
            .resolve_mut(parent)
            .unwrap()
            .rights
            .remove(Rights::READ);
        assert_eq!(table.check(child, Rights::READ), Err(CoreError::Permission));
    }

    #[test]
    fn reserved_ids_are_always_invalid() {
        let table: CapTable<16> = CapTable::new();
        assert_eq!(table.check(CapId::NONE, Rights::READ), Err(CoreError::CapInvalid));
        assert_eq!(table.check(CapId::ANY, Rights::READ), Err(CoreError::CapInvalid));
    }

    #[test]
    fn quota_exhaustion_is_quota_exceeded_not_no_memory() {
        let mut table: CapTable<2> = CapTable::new();
        table.create(DomainId(1), mem(), Rights::READ).unwrap();
        table.create(DomainId(1), mem(), Rights::READ).unwrap();
        assert_eq!(
            table.create(DomainId(1), mem(), Rights::READ),
            Err(CoreError::QuotaExceeded)
        );
    }

    #[test]
    fn recreate_after_revoke_yields_distinct_id() {
        let mut table: CapTable<4> = CapTable::new();
        let id1 = table.create(DomainId(1), mem(), Rights::READ).unwrap();
        table.revoke(id1).unwrap();
        table.destroy(id1);
        let id2 = table.create(DomainId(1), mem(), Rights::READ).unwrap();
        assert_ne!(id1, id2);
        assert_eq!(table.check(id1, Rights::READ), Err(CoreError::CapInvalid));
        assert!(table.check(id2, Rights::READ).is_ok());
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use abi::CapType;
    use proptest::prelude::*;

    fn mem() -> CapType {
        CapType::Memory {
            base: 0x0200_0000,
            size: 0x1000,
        }
    }

    fn rights_strategy() -> impl Strategy<Value = Rights> {
        (0u16..=0x3ff).prop_map(Rights::from_bits_truncate)
    }

    proptest! {
        /// P2: a chain of derives can never end up with rights outside the
        /// root's, no matter how the sub_rights at each step narrow.
        #[test]
        fn rights_never_escape_root(
            root_rights in rights_strategy(),
            narrowings in prop::collection::vec(rights_strategy(), 0..6),
        ) {
            let mut table: CapTable<16> = CapTable::new();
            let root = table.create(DomainId(1), mem(), root_rights).unwrap();
            let mut current = root;
            for want in narrowings {
                let Some(parent_rights) = table.effective_rights(current) else { break };
                let sub = want & parent_rights;
                current = table.derive(DomainId(1), current, sub).unwrap();
                let eff = table.effective_rights(current).unwrap();
                prop_assert!(root_rights.contains(eff));
            }
        }

        /// P4: any sequence of transfers with no intervening create/revoke
        /// leaves the multiset of live capability ids unchanged — here
        /// checked as "the id survives and nothing new appears".
        #[test]
        fn transfer_sequence_conserves_id(hops in prop::collection::vec(1u32..4, 1..8)) {
            let mut table: CapTable<16> = CapTable::new();
            let id = table
                .create(DomainId(1), mem(), Rights::READ | Rights::TRANSFER)
                .unwrap();
            let before = count_live(&table);
            let mut owner = DomainId(1);
            for h in hops {
                let to = DomainId(h);
                if to == owner {
                    continue;
                }
                table.transfer(owner, to, id).unwrap();
                owner = to;
            }
            let after = count_live(&table);
            prop_assert_eq!(before, after);
            prop_assert_eq!(table.get(id).unwrap().owner, owner);
        }
    }

    fn count_live<const N: usize>(table: &CapTable<N>) -> usize {
        table.iter().filter(|e| !e.is_revoked()).count()
    }
}
