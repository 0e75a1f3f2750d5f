// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Core ABI definitions, shared between the kernel and the Privileged and
//! Application code it hosts.
//!
//! Nothing in this crate can allocate or block; it is pure data plus the
//! small amount of logic (id encoding, rights arithmetic) that both sides of
//! the call gate need to agree on.

#![no_std]

use bitflags::bitflags;
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

/// Number of bits of a generational id reserved for the table-slot index.
/// The remaining high bits are the generation. Chosen generously (1M slots,
/// 4096 generations) since the id width itself (`u32`) is fixed by the wire
/// format in [`AuditEntry`].
const ID_INDEX_BITS: u32 = 20;
const ID_INDEX_MASK: u32 = (1 << ID_INDEX_BITS) - 1;

macro_rules! gen_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
        #[repr(transparent)]
        pub struct $name(pub u32);

        impl $name {
            /// Reserved: never a live id. Rejected as `CAP_INVALID` /
            /// `INVALID_PARAM` wherever it appears in an argument.
            pub const NONE: Self = Self(0);
            /// Reserved: the all-ones sentinel, also always invalid.
            pub const ANY: Self = Self(u32::MAX);

            pub const fn for_index_and_generation(index: usize, generation: u16) -> Self {
                Self((index as u32 & ID_INDEX_MASK) | ((generation as u32) << ID_INDEX_BITS))
            }

            pub const fn index(self) -> usize {
                (self.0 & ID_INDEX_MASK) as usize
            }

            pub const fn generation(self) -> u16 {
                (self.0 >> ID_INDEX_BITS) as u16
            }

            /// True for the two ids that must never name a live entity.
            pub const fn is_reserved(self) -> bool {
                self.0 == Self::NONE.0 || self.0 == Self::ANY.0
            }
        }
    };
}

gen_id!(
    /// Identifies a capability table entry. Stable for the entry's lifetime;
    /// a slot reused after revocation gets a new generation, so a stale id a
    /// peer is still holding never aliases the new entry.
    CapId
);
gen_id!(
    /// Identifies a domain control block.
    DomainId
);
gen_id!(
    /// Identifies a thread control block.
    ThreadId
);
gen_id!(
    /// Identifies a registered endpoint (a handler installed by a
    /// Privileged service), distinct from the capability that names it.
    EndpointId
);

/// A small integer, local to a domain's handle space, aliasing a [`CapId`].
/// Handle 0 is reserved.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
#[repr(transparent)]
pub struct Handle(pub u32);

impl Handle {
    pub const NONE: Self = Self(0);

    pub const fn is_reserved(self) -> bool {
        self.0 == 0
    }
}

/// Monotonic kernel timestamp, nanosecond-granular.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
#[repr(transparent)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const fn as_nanos(self) -> u64 {
        self.0
    }
}

impl From<u64> for Timestamp {
    fn from(v: u64) -> Self {
        Timestamp(v)
    }
}

impl core::ops::Add<u64> for Timestamp {
    type Output = Timestamp;
    fn add(self, rhs: u64) -> Timestamp {
        Timestamp(self.0.saturating_add(rhs))
    }
}

/// Priority of a thread. Numerically higher is strictly more important, per
/// the ordering named in spec.md: IDLE < LOW < NORMAL < HIGH < REALTIME.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
#[repr(u8)]
pub enum Priority {
    Idle = 0,
    Low = 1,
    Normal = 2,
    High = 3,
    Realtime = 4,
}

impl Priority {
    pub const COUNT: usize = 5;
    pub const ALL: [Priority; Self::COUNT] = [
        Priority::Idle,
        Priority::Low,
        Priority::Normal,
        Priority::High,
        Priority::Realtime,
    ];

    /// Checks if `self` is strictly more important than `other`.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self as u8 > other as u8
    }

    pub const fn as_index(self) -> usize {
        self as u8 as usize
    }

    pub const fn from_index(i: usize) -> Option<Self> {
        match i {
            0 => Some(Priority::Idle),
            1 => Some(Priority::Low),
            2 => Some(Priority::Normal),
            3 => Some(Priority::High),
            4 => Some(Priority::Realtime),
            _ => None,
        }
    }
}

bitflags! {
    /// Rights a capability can confer. A derived capability's rights are
    /// always a subset of its parent's (Invariant 2 in spec.md §3).
    #[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
    pub struct Rights: u16 {
        const READ    = 1 << 0;
        const WRITE   = 1 << 1;
        const EXECUTE = 1 << 2;
        const GRANT   = 1 << 3;
        const REVOKE  = 1 << 4;
        const MAP     = 1 << 5;
        const INVOKE  = 1 << 6;
        const SEND    = 1 << 7;
        const RECEIVE = 1 << 8;
        const TRANSFER = 1 << 9;
    }
}

bitflags! {
    /// Per-entry capability flags.
    #[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
    pub struct CapFlags: u8 {
        const REVOKED          = 1 << 0;
        const TRANSFER_PENDING = 1 << 1;
    }
}

bitflags! {
    /// Per-domain behavioral flags.
    #[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
    pub struct DomainFlags: u8 {
        const TRUSTED  = 1 << 0;
        const CRITICAL = 1 << 1;
    }
}

bitflags! {
    /// Memory region access permissions.
    #[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
    pub struct RegionAttributes: u8 {
        const R      = 1 << 0;
        const W      = 1 << 1;
        const X      = 1 << 2;
        const DEVICE = 1 << 3;
        const DMA    = 1 << 4;
    }
}

/// The tagged variants a capability can carry. Only [`CapType::CapDerive`]
/// references another entry (its parent); every other variant names a raw
/// hardware or kernel resource.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum CapType {
    Memory { base: u64, size: u64 },
    Thread(ThreadId),
    IrqLine(u32),
    Endpoint(EndpointId),
    Device { mmio_base: u64, size: u64 },
    Domain(DomainId),
    CapDerive { parent: CapId, sub_rights: Rights },
}

/// Tiers of privilege a domain may occupy.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum DomainType {
    Core,
    Privileged,
    Application,
}

/// Domain lifecycle states (spec.md §4.4).
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum DomainState {
    Init,
    Ready,
    Running,
    Suspended,
    Terminated,
}

/// Thread lifecycle states (spec.md §3).
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ThreadState {
    Ready,
    Running,
    Blocked,
    Waiting,
    Terminated,
}

/// Why a thread last left the Ready state, and what it is waiting on.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum WaitReason {
    /// Blocked sending to, or receiving from, an endpoint.
    Endpoint,
    /// Cooperative signal delivery point (`thread_signal`).
    Signal,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct WaitDescriptor {
    pub reason: WaitReason,
    pub resource: Option<CapId>,
    pub deadline: Option<Timestamp>,
}

/// Why a previously Blocked/Waiting thread became Ready again.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum WakeCause {
    Explicit,
    Timeout,
    Signal(u32),
}

/// Per-domain resource ceilings, enforced before allocation (spec.md §4.2,
/// §4.4, Invariant 6).
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Quota {
    pub max_memory: u64,
    pub max_threads: u32,
    pub max_caps: u32,
    pub cpu_percent: u8,
}

/// Current resource consumption against a [`Quota`].
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct Usage {
    pub memory_used: u64,
    pub thread_used: u32,
    pub cpu_time_total: u64,
}

/// The kind of allocation `domain_memory_alloc`/`alloc_in` is carving.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum AllocKind {
    Code,
    RoData,
    Data,
    Bss,
    Heap,
}

/// 32-bit status code returned by every core entry point (spec.md §6).
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u32)]
pub enum Status {
    Success = 0,
    Generic = 1,
    InvalidParam = 2,
    NoMemory = 3,
    Permission = 4,
    NotFound = 5,
    Timeout = 6,
    Busy = 7,
    NotSupported = 8,
    CapInvalid = 9,
    CapRevoked = 10,
    InvalidDomain = 11,
    QuotaExceeded = 12,
    InvalidState = 13,
    NoResource = 14,
    AlreadyExists = 15,
}

impl Status {
    pub const fn is_success(self) -> bool {
        matches!(self, Status::Success)
    }
}

/// Recognized audit event kinds (spec.md §4.7).
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u16)]
pub enum EventKind {
    CapCreate = 0,
    CapTransfer = 1,
    CapRevoke = 2,
    CapDerive = 3,
    CapVerify = 4,
    Syscall = 5,
    DomainCreate = 6,
    DomainDestroy = 7,
    ThreadCreate = 8,
    ThreadTerminate = 9,
    Exception = 10,
    SecurityViolation = 11,
    ModuleLoad = 12,
    ModuleUnload = 13,
    AuditWrap = 14,
}

/// Magic marking the start of a persisted audit ring header: ASCII "AUDI".
pub const AUDIT_RING_MAGIC: u32 = 0x4155_4449;

/// Fixed 64-byte audit record, little-endian on the wire (spec.md §6).
#[derive(Copy, Clone, Debug, FromBytes, FromZeroes, AsBytes, Unaligned)]
#[repr(C)]
pub struct AuditEntry {
    pub timestamp: u64,
    pub sequence: u32,
    pub kind: u16,
    pub flags: u16,
    pub domain: u32,
    pub cap: u32,
    pub thread: u32,
    pub _pad: u32,
    pub data: [u64; 4],
}

impl AuditEntry {
    pub const SIZE: usize = core::mem::size_of::<Self>();

    pub fn success(&self) -> bool {
        self.flags & 1 != 0
    }
}

const _: () = assert!(AuditEntry::SIZE == 64);

/// Argument words carried by a cross-domain invocation (spec.md §4.6).
pub type CallArgs = [u64; 4];
