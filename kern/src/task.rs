// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Thread control blocks (C5, part 1 of 2 — see `sched` for the scheduling
//! algorithm itself).
//!
//! Mirrors the split hubris draws between `task::Task` (the data) and the
//! `schedule()`/`select()` algorithm: this module owns the fixed-capacity
//! thread array and per-thread state; `sched` owns the ready queues and the
//! tick/timeout/yield logic that walks them.

use abi::{DomainId, Priority, ThreadId, ThreadState, Timestamp, WaitDescriptor};

use crate::arch::{Arch, SavedContext};
use crate::err::{CoreError, CoreResult};

/// Default time slice, in ticks, a thread is given on creation or wakeup
/// (spec.md §4.5: "resets time slice to default").
pub const DEFAULT_TIME_SLICE: u32 = 10;

#[derive(Copy, Clone, Debug)]
pub struct StackRegion {
    pub base: u64,
    pub size: u64,
}

/// A thread control block (spec.md §3). Scheduler links live here (`prev`,
/// `next`) so the ready queues in `sched` can be plain intrusive lists over
/// the fixed thread array rather than needing a separate allocation.
pub struct ThreadControlBlock<A: Arch> {
    pub id: ThreadId,
    pub domain: DomainId,
    pub state: ThreadState,
    pub priority: Priority,
    pub stack: StackRegion,
    pub context: A::Context,
    pub prev: Option<ThreadId>,
    pub next: Option<ThreadId>,
    pub time_slice: u32,
    pub cpu_time_used: u64,
    pub last_run_time: Timestamp,
    pub wait: Option<WaitDescriptor>,
    pub notifications: u32,
}

impl<A: Arch> ThreadControlBlock<A> {
    /// Posts notification bits. Non-blocking: this never changes
    /// scheduling state, it only sets bits the thread observes on its next
    /// scheduled run (spec.md §5, "Cancellation and timeouts").
    pub fn notify(&mut self, mask: u32) {
        self.notifications |= mask;
    }

    pub fn take_notifications(&mut self) -> u32 {
        core::mem::replace(&mut self.notifications, 0)
    }
}

/// The fixed-capacity thread array (spec.md §4.5).
pub struct ThreadTable<A: Arch, const MAX_THREADS: usize> {
    threads: [Option<ThreadControlBlock<A>>; MAX_THREADS],
    generations: [u16; MAX_THREADS],
}

impl<A: Arch, const MAX_THREADS: usize> ThreadTable<A, MAX_THREADS> {
    pub fn new() -> Self {
        Self {
            threads: core::array::from_fn(|_| None),
            generations: [0; MAX_THREADS],
        }
    }

    fn slot_for(&self, id: ThreadId) -> Option<usize> {
        if id.is_reserved() {
            return None;
        }
        let idx = id.index();
        if idx >= MAX_THREADS || self.generations[idx] != id.generation() {
            return None;
        }
        Some(idx)
    }

    pub fn get(&self, id: ThreadId) -> Option<&ThreadControlBlock<A>> {
        self.slot_for(id).and_then(|i| self.threads[i].as_ref())
    }

    pub fn get_mut(&mut self, id: ThreadId) -> Option<&mut ThreadControlBlock<A>> {
        let idx = self.slot_for(id)?;
        self.threads[idx].as_mut()
    }

    /// Creates a thread in state `Ready`, owned by `domain`. Enqueueing it
    /// onto the scheduler's ready queue (Invariant 7) is the caller's job
    /// (`Scheduler::create`); this only allocates the control block.
    pub fn create(
        &mut self,
        domain: DomainId,
        entry: usize,
        stack: StackRegion,
        priority: Priority,
        now: Timestamp,
    ) -> CoreResult<ThreadId> {
        let slot = self
            .threads
            .iter()
            .position(Option::is_none)
            .ok_or(CoreError::QuotaExceeded)?;
        let generation = self.generations[slot];
        let id = ThreadId::for_index_and_generation(slot, generation);
        self.threads[slot] = Some(ThreadControlBlock {
            id,
            domain,
            state: ThreadState::Ready,
            priority,
            stack,
            context: A::context_init(entry, (stack.base + stack.size) as usize),
            prev: None,
            next: None,
            time_slice: DEFAULT_TIME_SLICE,
            cpu_time_used: 0,
            last_run_time: now,
            wait: None,
            notifications: 0,
        });
        Ok(id)
    }

    /// Frees the control block and bumps its generation.
    pub fn destroy(&mut self, id: ThreadId) {
        if let Some(idx) = self.slot_for(id) {
            self.threads[idx] = None;
            self.generations[idx] = self.generations[idx].wrapping_add(1);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ThreadControlBlock<A>> {
        self.threads.iter().filter_map(|t| t.as_ref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ThreadControlBlock<A>> {
        self.threads.iter_mut().filter_map(|t| t.as_mut())
    }
}

impl<A: Arch, const MAX_THREADS: usize> Default for ThreadTable<A, MAX_THREADS> {
    fn default() -> Self {
        Self::new()
    }
}
