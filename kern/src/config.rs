// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Platform configuration (consumed, spec.md §6).
//!
//! In the original system this table is synthesized at build time from a
//! YAML description (out of scope here — spec.md §1). What the core
//! actually consumes is this plain value: memory regions with permissions,
//! interrupt routing, and the initial capability grants per domain. Hubris
//! plays the analogous role with its `App`/`TaskDesc`/`RegionDesc` triad
//! built by `kern/build.rs`; we keep the same split between "descriptor"
//! (this module) and "live state" (`domain`, `task`) but express it as
//! ordinary `const`-friendly Rust values instead of a binary table, since
//! there is no build-time synthesis step in this crate.

use abi::{DomainId, RegionAttributes};

/// Firmware/boot handoff detail the core validates but does not act on
/// beyond seeding the resource model (spec.md §6, "Boot handoff").
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum FirmwareType {
    Uefi,
    Bios,
}

/// One entry of the build-time memory layout (spec.md §4.2).
#[derive(Copy, Clone, Debug)]
pub struct RegionConfig {
    pub phys_base: u64,
    pub phys_size: u64,
    pub attributes: RegionAttributes,
}

/// Routes a hardware interrupt vector to the domain whose thread should be
/// woken. Two routes naming the same vector is a fatal build error (spec.md
/// §6); `PlatformConfig::validate` checks for that.
#[derive(Copy, Clone, Debug)]
pub struct IrqRoute {
    pub vector: u32,
    pub owner: DomainId,
}

/// An initial capability grant installed for a domain at boot, before any
/// syscall has run (spec.md §3, "Lifecycles": "A capability is created
/// either by Core during boot ... or by a grant/derive operation").
#[derive(Copy, Clone, Debug)]
pub struct InitialGrant {
    pub domain: DomainId,
    pub region_index: usize,
    pub attributes: RegionAttributes,
}

/// Static, build-time hardware/software description the core initializes
/// from. Sized by const generics so the platform picks concrete limits
/// instead of the core hard-coding one (spec.md §9, "Source ambiguities":
/// the `HIC_DOMAIN_MAX`/`MAX_THREADS` disagreement is resolved by taking
/// limits from platform config rather than a compiled-in constant).
pub struct PlatformConfig<
    'a,
    const MAX_REGIONS: usize,
    const MAX_IRQ_ROUTES: usize,
    const MAX_GRANTS: usize,
> {
    pub firmware: FirmwareType,
    pub regions: [RegionConfig; MAX_REGIONS],
    pub irq_routes: [Option<IrqRoute>; MAX_IRQ_ROUTES],
    pub initial_grants: [Option<InitialGrant>; MAX_GRANTS],
    pub device_init_order: &'a [u32],
}

impl<'a, const R: usize, const I: usize, const G: usize> PlatformConfig<'a, R, I, G> {
    /// Fatal build errors per spec.md §6: two IRQ routes to the same
    /// vector, or overlapping memory regions with non-device attributes.
    pub fn validate(&self) -> Result<(), &'static str> {
        for i in 0..I {
            let Some(a) = &self.irq_routes[i] else { continue };
            for b in self.irq_routes[i + 1..].iter().flatten() {
                if a.vector == b.vector {
                    return Err("duplicate IRQ route");
                }
            }
        }
        for i in 0..R {
            let a = &self.regions[i];
            for b in &self.regions[i + 1..] {
                let a_end = a.phys_base + a.phys_size;
                let b_end = b.phys_base + b.phys_size;
                let overlap = a.phys_base < b_end && b.phys_base < a_end;
                if overlap {
                    return Err("overlapping memory regions");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(base: u64, size: u64) -> RegionConfig {
        RegionConfig {
            phys_base: base,
            phys_size: size,
            attributes: RegionAttributes::R,
        }
    }

    #[test]
    fn disjoint_regions_validate() {
        let cfg: PlatformConfig<2, 1, 1> = PlatformConfig {
            firmware: FirmwareType::Uefi,
            regions: [region(0, 0x1000), region(0x1000, 0x1000)],
            irq_routes: [None],
            initial_grants: [None],
            device_init_order: &[],
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn overlapping_regions_are_fatal() {
        let cfg: PlatformConfig<2, 1, 1> = PlatformConfig {
            firmware: FirmwareType::Uefi,
            regions: [region(0, 0x2000), region(0x1000, 0x1000)],
            irq_routes: [None],
            initial_grants: [None],
            device_init_order: &[],
        };
        assert_eq!(cfg.validate(), Err("overlapping memory regions"));
    }

    #[test]
    fn duplicate_irq_route_is_fatal() {
        let cfg: PlatformConfig<1, 2, 1> = PlatformConfig {
            firmware: FirmwareType::Uefi,
            regions: [region(0, 0x1000)],
            irq_routes: [
                Some(IrqRoute { vector: 7, owner: DomainId(1) }),
                Some(IrqRoute { vector: 7, owner: DomainId(2) }),
            ],
            initial_grants: [None],
            device_init_order: &[],
        };
        assert_eq!(cfg.validate(), Err("duplicate IRQ route"));
    }
}
