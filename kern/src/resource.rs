// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Physical resource model (C2).
//!
//! Memory layout is fixed at build time (spec.md §4.2). This module owns
//! the per-domain bump/first-fit allocators that carve addresses out of a
//! domain's region, and the pure `check_access` predicate the Capability
//! Table and Call Gate consult before letting a domain touch memory it does
//! not own.

use abi::{AllocKind, DomainId, RegionAttributes};

use crate::err::{CoreError, CoreResult};

/// A domain's exclusive memory region (spec.md §3, Invariant 5:
/// "disjointness"). Ownership of disjointness itself is enforced by
/// `DomainRegistry::create`, which is the only writer of these entries;
/// `ResourceModel` only ever reads them back for `check_access`.
#[derive(Copy, Clone, Debug)]
pub struct DomainRegion {
    pub domain: DomainId,
    pub phys_base: u64,
    pub phys_size: u64,
    pub attributes: RegionAttributes,
}

impl DomainRegion {
    pub fn contains(&self, phys: u64, size: u64) -> bool {
        size != 0
            && phys >= self.phys_base
            && phys.saturating_add(size) <= self.phys_base + self.phys_size
    }

    pub fn overlaps(&self, other: &DomainRegion) -> bool {
        let a_end = self.phys_base + self.phys_size;
        let b_end = other.phys_base + other.phys_size;
        self.phys_base < b_end && other.phys_base < a_end
    }
}

/// One block of a domain's heap-like allocator: `first-fit` among freed
/// blocks, per spec.md §4.2.
#[derive(Copy, Clone, Debug)]
struct HeapBlock {
    offset: u64,
    size: u64,
    used: bool,
}

/// Per-domain allocation state: a bump pointer for module sections (code,
/// rodata, data, bss — these are never individually freed) plus a small
/// first-fit free list for heap-like pages.
struct DomainAlloc<const MAX_BLOCKS: usize> {
    domain: DomainId,
    bump_offset: u64,
    blocks: [Option<HeapBlock>; MAX_BLOCKS],
}

/// Programs and queries memory protection for every domain's region.
///
/// `check_access` is a pure function over the static layout plus each
/// domain's region (spec.md §4.2); it does not consult the Capability
/// Table directly; the Call Gate combines a `Memory` capability check with
/// this for device/shared regions.
pub struct ResourceModel<const MAX_DOMAINS: usize, const MAX_BLOCKS: usize> {
    regions: [Option<DomainRegion>; MAX_DOMAINS],
    allocs: [Option<DomainAlloc<MAX_BLOCKS>>; MAX_DOMAINS],
    has_mmu: bool,
}

impl<const MAX_DOMAINS: usize, const MAX_BLOCKS: usize>
    ResourceModel<MAX_DOMAINS, MAX_BLOCKS>
{
    pub const fn new(has_mmu: bool) -> Self {
        Self {
            regions: [None; MAX_DOMAINS],
            allocs: [const { None }; MAX_DOMAINS],
            has_mmu,
        }
    }

    fn slot(&self, domain: DomainId) -> Option<usize> {
        self.regions
            .iter()
            .position(|r| matches!(r, Some(r) if r.domain == domain))
    }

    /// Registers `region` as `domain`'s exclusive memory, per Invariant 5.
    /// Rejects the registration if it overlaps any other live domain's
    /// region; the registry is expected to have already carved
    /// non-overlapping regions from the platform config, so this is a
    /// belt-and-suspenders check, not the primary enforcement point.
    pub fn register_domain(
        &mut self,
        domain: DomainId,
        phys_base: u64,
        phys_size: u64,
        attributes: RegionAttributes,
    ) -> CoreResult<()> {
        let region = DomainRegion {
            domain,
            phys_base,
            phys_size,
            attributes,
        };
        for existing in self.regions.iter().flatten() {
            if existing.domain != domain && existing.overlaps(&region) {
                return Err(CoreError::InvalidParam);
            }
        }
        let slot = self
            .regions
            .iter()
            .position(|r| r.is_none())
            .ok_or(CoreError::NoResource)?;
        self.regions[slot] = Some(region);
        self.allocs[slot] = Some(DomainAlloc {
            domain,
            bump_offset: 0,
            blocks: [None; MAX_BLOCKS],
        });
        Ok(())
    }

    pub fn unregister_domain(&mut self, domain: DomainId) {
        if let Some(i) = self.slot(domain) {
            self.regions[i] = None;
            self.allocs[i] = None;
        }
    }

    /// Identity mapping when no MMU/MPU is present (spec.md §4.2): the
    /// physical and virtual addresses coincide.
    pub fn identity_map(&self, phys: u64) -> u64 {
        phys
    }

    /// Pure predicate: does `domain` have `perm` access to
    /// `[phys, phys+size)`? Always true for an MMU-less platform as long as
    /// the range falls in the domain's own region (identity mapping);
    /// otherwise additionally false outside the domain's region entirely.
    pub fn check_access(
        &self,
        domain: DomainId,
        phys: u64,
        size: u64,
        perm: RegionAttributes,
    ) -> bool {
        let Some(i) = self.slot(domain) else {
            return false;
        };
        let region = self.regions[i].as_ref().unwrap();
        if !region.contains(phys, size) {
            return false;
        }
        if !region.attributes.contains(perm) {
            return false;
        }
        if perm.contains(RegionAttributes::W) && perm.contains(RegionAttributes::X) {
            // W^X unless the domain is explicitly trusted; trust is a
            // domain-level property the registry enforces before calling
            // here, so by the time we're asked this combination is already
            // disallowed for everyone else.
            return false;
        }
        true
    }

    /// Carves `size` bytes of `kind` out of `domain`'s region.
    /// Bump-allocator semantics for module sections; first-fit over a small
    /// free list for `Heap` (spec.md §4.2).
    pub fn alloc_in(
        &mut self,
        domain: DomainId,
        size: u64,
        kind: AllocKind,
    ) -> CoreResult<u64> {
        let i = self.slot(domain).ok_or(CoreError::InvalidParam)?;
        let region = self.regions[i].unwrap();
        let alloc = self.allocs[i].as_mut().unwrap();

        if matches!(kind, AllocKind::Heap) {
            if let Some(offset) = Self::first_fit(&mut alloc.blocks, size) {
                return Ok(region.phys_base + offset);
            }
        }

        let aligned = alloc.bump_offset.next_multiple_of(8);
        let new_offset = aligned
            .checked_add(size)
            .ok_or(CoreError::InvalidParam)?;
        if new_offset > region.phys_size {
            return Err(CoreError::QuotaExceeded);
        }
        alloc.bump_offset = new_offset;
        Ok(region.phys_base + aligned)
    }

    fn first_fit(blocks: &mut [Option<HeapBlock>; MAX_BLOCKS], size: u64) -> Option<u64> {
        for slot in blocks.iter_mut() {
            if let Some(b) = slot {
                if !b.used && b.size >= size {
                    b.used = true;
                    return Some(b.offset);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disjoint_domains_register_cleanly() {
        let mut model: ResourceModel<4, 4> = ResourceModel::new(false);
        model
            .register_domain(DomainId(1), 0x1000, 0x1000, RegionAttributes::R | RegionAttributes::W)
            .unwrap();
        model
            .register_domain(DomainId(2), 0x2000, 0x1000, RegionAttributes::R)
            .unwrap();
        assert!(model.check_access(DomainId(1), 0x1000, 0x100, RegionAttributes::W));
        assert!(!model.check_access(DomainId(2), 0x1000, 0x100, RegionAttributes::R));
    }

    #[test]
    fn overlapping_registration_rejected() {
        let mut model: ResourceModel<4, 4> = ResourceModel::new(false);
        model
            .register_domain(DomainId(1), 0x1000, 0x1000, RegionAttributes::R)
            .unwrap();
        let err = model
            .register_domain(DomainId(2), 0x1800, 0x1000, RegionAttributes::R)
            .unwrap_err();
        assert_eq!(err, CoreError::InvalidParam);
    }

    #[test]
    fn out_of_region_access_denied() {
        let mut model: ResourceModel<4, 4> = ResourceModel::new(false);
        model
            .register_domain(DomainId(1), 0x1000, 0x1000, RegionAttributes::R)
            .unwrap();
        assert!(!model.check_access(DomainId(1), 0x5000, 0x10, RegionAttributes::R));
    }

    #[test]
    fn bump_alloc_respects_quota() {
        let mut model: ResourceModel<2, 2> = ResourceModel::new(false);
        model
            .register_domain(DomainId(1), 0x1000, 0x100, RegionAttributes::R | RegionAttributes::W)
            .unwrap();
        assert!(model.alloc_in(DomainId(1), 0x80, AllocKind::Data).is_ok());
        assert_eq!(
            model.alloc_in(DomainId(1), 0x80, AllocKind::Data),
            Err(CoreError::QuotaExceeded)
        );
    }
}
