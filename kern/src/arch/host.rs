// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host-only backend (hubris's `arch::fake` role, generalized to an explicit
//! `Arch` impl). Every unit and property test in this crate runs against
//! `Host` so that the rest of the core never needs real hardware or a
//! booted image to exercise.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use abi::Timestamp;

use super::{Arch, IrqState, PrivilegeLevel, SavedContext};

#[derive(Clone, Debug, Default)]
pub struct HostContext {
    pub entry: usize,
    pub stack_top: usize,
    pub args: [u64; 4],
    pub ret: u64,
}

impl SavedContext for HostContext {
    fn arg(&self, index: usize) -> u64 {
        self.args.get(index).copied().unwrap_or(0)
    }

    fn set_return(&mut self, value: u64) {
        self.ret = value;
    }
}

static CLOCK_NANOS: AtomicU64 = AtomicU64::new(0);
static IRQ_DISABLED: AtomicBool = AtomicBool::new(false);

/// Test hook: advances the simulated clock, since `Host` has no real timer.
pub fn advance_clock(nanos: u64) {
    CLOCK_NANOS.fetch_add(nanos, Ordering::SeqCst);
}

pub struct Host;

impl Arch for Host {
    type Context = HostContext;

    fn timestamp() -> Timestamp {
        Timestamp(CLOCK_NANOS.load(Ordering::SeqCst))
    }

    fn irq_save() -> IrqState {
        let was_disabled = IRQ_DISABLED.swap(true, Ordering::SeqCst);
        IrqState(was_disabled)
    }

    fn irq_restore(state: IrqState) {
        IRQ_DISABLED.store(state.0, Ordering::SeqCst);
    }

    fn barrier_full() {
        core::sync::atomic::fence(Ordering::SeqCst);
    }

    fn barrier_acquire() {
        core::sync::atomic::fence(Ordering::Acquire);
    }

    fn barrier_release() {
        core::sync::atomic::fence(Ordering::Release);
    }

    unsafe fn mmio_read8(_addr: usize) -> u8 {
        0
    }
    unsafe fn mmio_read16(_addr: usize) -> u16 {
        0
    }
    unsafe fn mmio_read32(_addr: usize) -> u32 {
        0
    }
    unsafe fn mmio_read64(_addr: usize) -> u64 {
        0
    }
    unsafe fn mmio_write8(_addr: usize, _value: u8) {}
    unsafe fn mmio_write16(_addr: usize, _value: u16) {}
    unsafe fn mmio_write32(_addr: usize, _value: u32) {}
    unsafe fn mmio_write64(_addr: usize, _value: u64) {}

    fn io_port_read(_port: u16) -> u8 {
        0xFF
    }
    fn io_port_write(_port: u16, _value: u8) {}

    fn context_init(entry: usize, stack_top: usize) -> Self::Context {
        HostContext {
            entry,
            stack_top,
            args: [0; 4],
            ret: 0,
        }
    }

    fn context_switch(_prev: &mut Self::Context, _next: &Self::Context) {
        // Nothing to do: there is no real stack to swap on the host. Tests
        // drive scheduler state transitions directly rather than actually
        // transferring control.
    }

    fn current_privilege() -> PrivilegeLevel {
        PrivilegeLevel::Kernel
    }

    fn halt() -> ! {
        panic!("Host::halt() called");
    }

    fn wait_for_interrupt() {}
}
