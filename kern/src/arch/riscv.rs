// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! RISC-V (RV64) backend. `sstatus.SIE` gates interrupts, `rdtime` is the
//! timestamp source, `fence`/`fence.i` are the barrier instructions.

use core::arch::asm;

use abi::Timestamp;

use super::{Arch, IrqState, PrivilegeLevel, SavedContext};

#[derive(Clone, Debug, Default)]
#[repr(C)]
pub struct RiscVContext {
    pub sp: u64,
    pub s0_s11: [u64; 12],
    pub ra: u64,
    pub sepc: u64,
    pub args: [u64; 4],
    pub ret: u64,
}

impl SavedContext for RiscVContext {
    fn arg(&self, index: usize) -> u64 {
        self.args.get(index).copied().unwrap_or(0)
    }

    fn set_return(&mut self, value: u64) {
        self.ret = value;
    }
}

pub struct RiscV;

const SSTATUS_SIE: u64 = 1 << 1;

impl Arch for RiscV {
    type Context = RiscVContext;

    fn timestamp() -> Timestamp {
        let t: u64;
        unsafe {
            asm!("rdtime {0}", out(reg) t, options(nomem, nostack));
        }
        Timestamp(t)
    }

    fn irq_save() -> IrqState {
        let prev: u64;
        unsafe {
            asm!(
                "csrrc {0}, sstatus, {1}",
                out(reg) prev,
                in(reg) SSTATUS_SIE,
                options(nomem, nostack),
            );
        }
        IrqState(prev & SSTATUS_SIE != 0)
    }

    fn irq_restore(state: IrqState) {
        if state.0 {
            unsafe {
                asm!("csrrs x0, sstatus, {0}", in(reg) SSTATUS_SIE, options(nomem, nostack));
            }
        }
    }

    fn barrier_full() {
        unsafe { asm!("fence", options(nomem, nostack)) };
    }

    fn barrier_acquire() {
        unsafe { asm!("fence r, rw", options(nomem, nostack)) };
    }

    fn barrier_release() {
        unsafe { asm!("fence rw, w", options(nomem, nostack)) };
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
        RiscVContext {
            sp: stack_top as u64,
            sepc: entry as u64,
            ..Default::default()
        }
    }

    fn context_switch(prev: &mut Self::Context, next: &Self::Context) {
        unsafe {
            asm!("mv {0}, sp", out(reg) prev.sp, options(nomem, nostack));
        }
        let _ = next;
    }

    fn current_privilege() -> PrivilegeLevel {
        // RV64 has no unprivileged read of the current mode; a real port
        // tracks this in a per-hart kernel global updated on trap entry.
        PrivilegeLevel::Kernel
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
