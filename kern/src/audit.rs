// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tamper-resistant audit log (C7).
//!
//! Append-only, sequence-numbered ring of fixed-width [`AuditEntry`]
//! records (spec.md §4.7, §6). Only ever written from inside the core
//! under `irq_save`; callers outside this module never get a mutable
//! reference to an entry once appended.

use abi::{AuditEntry, CapId, DomainId, EventKind, ThreadId, Timestamp};

const EMPTY_ENTRY: AuditEntry = AuditEntry {
    timestamp: 0,
    sequence: 0,
    kind: 0,
    flags: 0,
    domain: 0,
    cap: 0,
    thread: 0,
    _pad: 0,
    data: [0; 4],
};

/// A fixed-capacity ring of `N` audit entries. `N` is chosen by whoever
/// embeds the core (spec.md's note that `HIC_DOMAIN_MAX`-style constants
/// belong in platform config, not hard-coded): this module only knows how
/// to wrap and number them.
pub struct AuditRing<const N: usize> {
    entries: [AuditEntry; N],
    /// Sequence number the *next* append will use. Starts at 1, so
    /// sequence 0 never appears on the wire and can mean "no entry" to a
    /// reader.
    next_sequence: u32,
    /// True once the ring has overwritten its first entry.
    wrapped: bool,
}

impl<const N: usize> AuditRing<N> {
    pub const fn new() -> Self {
        Self {
            entries: [EMPTY_ENTRY; N],
            next_sequence: 1,
            wrapped: false,
        }
    }

    /// How many live entries the ring currently holds (saturates at `N`
    /// once it has wrapped).
    pub fn len(&self) -> usize {
        let appended = self.next_sequence.saturating_sub(1) as usize;
        appended.min(N)
    }

    pub fn is_empty(&self) -> bool {
        self.next_sequence == 1
    }

    pub fn capacity(&self) -> usize {
        N
    }

    /// Oldest sequence number still held, or `None` if nothing has been
    /// appended yet. After M > N appends this is `M - N + 1` (spec.md §8).
    pub fn oldest_sequence(&self) -> Option<u32> {
        if self.is_empty() {
            return None;
        }
        let appended = self.next_sequence - 1;
        Some(if self.wrapped {
            appended - N as u32 + 1
        } else {
            1
        })
    }

    pub fn newest_sequence(&self) -> Option<u32> {
        if self.is_empty() {
            None
        } else {
            Some(self.next_sequence - 1)
        }
    }

    /// Looks up a live entry by its sequence number. Returns `None` for a
    /// sequence that was never written, or one the ring has since
    /// overwritten.
    pub fn get_by_sequence(&self, sequence: u32) -> Option<&AuditEntry> {
        let oldest = self.oldest_sequence()?;
        let newest = self.newest_sequence()?;
        if sequence < oldest || sequence > newest {
            return None;
        }
        Some(&self.entries[(sequence as usize - 1) % N])
    }

    /// Iterates live entries in sequence order, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &AuditEntry> {
        let oldest = self.oldest_sequence().unwrap_or(1);
        let newest = self.newest_sequence().unwrap_or(0);
        (oldest..=newest).filter_map(move |s| self.get_by_sequence(s))
    }

    fn write_raw(
        &mut self,
        now: Timestamp,
        kind: EventKind,
        domain: DomainId,
        cap: CapId,
        thread: ThreadId,
        data: [u64; 4],
        success: bool,
    ) {
        let seq = self.next_sequence;
        let slot = (seq as usize - 1) % N;
        if seq as usize > N {
            self.wrapped = true;
        }
        self.entries[slot] = AuditEntry {
            timestamp: now.as_nanos(),
            sequence: seq,
            kind: kind as u16,
            flags: if success { 1 } else { 0 },
            domain: domain.0,
            cap: cap.0,
            thread: thread.0,
            _pad: 0,
            data,
        };
        self.next_sequence = self.next_sequence.wrapping_add(1);
    }

    /// Appends one record (spec.md §6: `audit_append`). The very first
    /// append that overwrites a still-live entry is preceded by one
    /// `AUDIT_WRAP` record, per spec.md §4.7.
    pub fn append(
        &mut self,
        now: Timestamp,
        kind: EventKind,
        domain: DomainId,
        cap: CapId,
        thread: ThreadId,
        data: [u64; 4],
        success: bool,
    ) {
        if !self.wrapped && self.next_sequence as usize > N {
            self.write_raw(
                now,
                EventKind::AuditWrap,
                DomainId::NONE,
                CapId::NONE,
                ThreadId::NONE,
                [0; 4],
                true,
            );
        }
        self.write_raw(now, kind, domain, cap, thread, data, success);
    }
}

impl<const N: usize> Default for AuditRing<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_numbers_are_monotonic() {
        let mut ring: AuditRing<4> = AuditRing::new();
        for i in 0..4 {
            ring.append(
                Timestamp(i as u64),
                EventKind::Syscall,
                DomainId(1),
                CapId::NONE,
                ThreadId::NONE,
                [0; 4],
                true,
            );
        }
        let seqs: Vec<u32> = ring.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
    }

    #[test]
    fn wrap_keeps_newest_n_and_emits_audit_wrap() {
        let mut ring: AuditRing<2> = AuditRing::new();
        ring.append(
            Timestamp(0),
            EventKind::Syscall,
            DomainId(1),
            CapId::NONE,
            ThreadId::NONE,
            [1; 4],
            true,
        );
        ring.append(
            Timestamp(1),
            EventKind::Syscall,
            DomainId(1),
            CapId::NONE,
            ThreadId::NONE,
            [2; 4],
            true,
        );
        // Third append should wrap: the first append's slot is reused, and
        // an AUDIT_WRAP is inserted ahead of it.
        ring.append(
            Timestamp(2),
            EventKind::Syscall,
            DomainId(1),
            CapId::NONE,
            ThreadId::NONE,
            [3; 4],
            true,
        );
        let kinds: Vec<u16> = ring.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::AuditWrap as u16, EventKind::Syscall as u16]);
        assert_eq!(ring.len(), 2);
    }

    #[test]
    fn revoke_event_can_carry_closure_members_in_data() {
        let mut ring: AuditRing<8> = AuditRing::new();
        ring.append(
            Timestamp(0),
            EventKind::CapRevoke,
            DomainId(1),
            CapId(10),
            ThreadId::NONE,
            [10, 11, 12, 0],
            true,
        );
        let entry = ring.get_by_sequence(1).unwrap();
        assert_eq!(entry.data, [10, 11, 12, 0]);
        assert!(entry.success());
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// P8: for any two observed entries, the lower sequence number
        /// never carries a later timestamp, across an arbitrary number of
        /// appends (well past the ring's capacity, so this also exercises
        /// wraparound).
        #[test]
        fn sequence_monotonic_under_wrap(deltas in prop::collection::vec(0u64..50, 1..40)) {
            let mut ring: AuditRing<4> = AuditRing::new();
            let mut now = 0u64;
            for d in deltas {
                now += d;
                ring.append(
                    Timestamp(now),
                    EventKind::Syscall,
                    DomainId(1),
                    CapId::NONE,
                    ThreadId::NONE,
                    [0; 4],
                    true,
                );
            }
            let entries: Vec<_> = ring.iter().collect();
            for pair in entries.windows(2) {
                prop_assert!(pair[0].sequence < pair[1].sequence);
                prop_assert!(pair[0].timestamp <= pair[1].timestamp);
            }
        }
    }
}
