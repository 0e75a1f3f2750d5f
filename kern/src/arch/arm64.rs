// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! ARM64 (AArch64) backend. `DAIF.I` gates IRQs, `CNTPCT_EL0` is the
//! timestamp source, `dsb`/`dmb` are the barrier instructions. There is no
//! separate I/O address space, so port accesses are a no-op per spec.md
//! §4.1.

use core::arch::asm;

use abi::Timestamp;

use super::{Arch, IrqState, PrivilegeLevel, SavedContext};

#[derive(Clone, Debug, Default)]
#[repr(C)]
pub struct Arm64Context {
    pub sp: u64,
    pub x19_x28: [u64; 10],
    pub lr: u64,
    pub elr: u64,
    pub args: [u64; 4],
    pub ret: u64,
}

impl SavedContext for Arm64Context {
    fn arg(&self, index: usize) -> u64 {
        self.args.get(index).copied().unwrap_or(0)
    }

    fn set_return(&mut self, value: u64) {
        self.ret = value;
    }
}

pub struct Arm64;

impl Arch for Arm64 {
    type Context = Arm64Context;

    fn timestamp() -> Timestamp {
        let cnt: u64;
        unsafe {
            asm!("mrs {0}, cntpct_el0", out(reg) cnt, options(nomem, nostack));
        }
        Timestamp(cnt)
    }

    fn irq_save() -> IrqState {
        let daif: u64;
        unsafe {
            asm!("mrs {0}, daif", "msr daifset, #2", out(reg) daif, options(nomem, nostack));
        }
        IrqState(daif & (1 << 7) == 0)
    }

    fn irq_restore(state: IrqState) {
        if state.0 {
            unsafe { asm!("msr daifclr, #2", options(nomem, nostack)) };
        }
    }

    fn barrier_full() {
        unsafe { asm!("dsb sy", options(nomem, nostack)) };
    }

    fn barrier_acquire() {
        unsafe { asm!("dmb ishld", options(nomem, nostack)) };
    }

    fn barrier_release() {
        unsafe { asm!("dmb ishst", options(nomem, nostack)) };
    }

    unsafe fn mmio_read8(addr: usize) -> u8 {
        core::ptr::read_volatile(addr as *const u8)
    }
    unsafe fn mmio_read16(addr: usize) -> u16 {
        core::ptr::read_volatile(addr as *const u16)
    }
    unsafe fn mmio_read32(addr: usize) -> u32 {
        core::ptr::read_volatile(addr as *const u32)
    }
    unsafe fn mmio_read64(addr: usize) -> u64 {
        core::ptr::read_volatile(addr as *const u64)
    }
    unsafe fn mmio_write8(addr: usize, value: u8) {
        core::ptr::write_volatile(addr as *mut u8, value);
    }
    unsafe fn mmio_write16(addr: usize, value: u16) {
        core::ptr::write_volatile(addr as *mut u16, value);
    }
    unsafe fn mmio_write32(addr: usize, value: u32) {
        core::ptr::write_volatile(addr as *mut u32, value);
    }
    unsafe fn mmio_write64(addr: usize, value: u64) {
        core::ptr::write_volatile(addr as *mut u64, value);
    }

    /// No separate I/O address space on this architecture.
    fn io_port_read(_port: u16) -> u8 {
        0xFF
    }
    fn io_port_write(_port: u16, _value: u8) {}

    fn context_init(entry: usize, stack_top: usize) -> Self::Context {
        Arm64Context {
            sp: stack_top as u64,
            elr: entry as u64,
            ..Default::default()
        }
    }

    fn context_switch(prev: &mut Self::Context, next: &Self::Context) {
        unsafe {
            asm!("mov {0}, sp", out(reg) prev.sp, options(nomem, nostack));
        }
        let _ = next;
    }

    fn current_privilege() -> PrivilegeLevel {
        let el: u64;
        unsafe {
            asm!("mrs {0}, currentel", out(reg) el, options(nomem, nostack));
        }
        if (el >> 2) & 0b11 == 0 {
            PrivilegeLevel::User
        } else {
            PrivilegeLevel::Kernel
        }
    }

    fn halt() -> ! {
        loop {
            unsafe { asm!("wfi", options(nomem, nostack)) };
        }
    }

    fn wait_for_interrupt() {
        unsafe { asm!("wfi", options(nomem, nostack)) };
    }
}
