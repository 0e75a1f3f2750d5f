// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! x86-64 backend. `rflags.IF` gates interrupts, `rdtsc` is the timestamp
//! source (a real port would calibrate this against a known frequency; that
//! calibration lives in the platform config, not here), and `in`/`out`
//! reach the legacy I/O port space.

use core::arch::asm;

use abi::Timestamp;

use super::{Arch, IrqState, PrivilegeLevel, SavedContext};

/// Callee-saved integer registers plus the fields a syscall reads/writes.
/// Matches the layout the context-switch trampoline pushes/pops; changing
/// field order requires changing the trampoline.
#[derive(Clone, Debug, Default)]
#[repr(C)]
pub struct X86_64Context {
    pub rsp: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub args: [u64; 4],
    pub ret: u64,
}

impl SavedContext for X86_64Context {
    fn arg(&self, index: usize) -> u64 {
        self.args.get(index).copied().unwrap_or(0)
    }

    fn set_return(&mut self, value: u64) {
        self.ret = value;
    }
}

pub struct X86_64;

impl Arch for X86_64 {
    type Context = X86_64Context;

    fn timestamp() -> Timestamp {
        let ts: u64;
        unsafe {
            asm!(
                "rdtsc",
                "shl rdx, 32",
                "or rax, rdx",
                out("rax") ts,
                out("rdx") _,
                options(nomem, nostack),
            );
        }
        Timestamp(ts)
    }

    fn irq_save() -> IrqState {
        let flags: u64;
        unsafe {
            asm!("pushfq", "pop {0}", "cli", out(reg) flags, options(nomem));
        }
        IrqState(flags & (1 << 9) != 0)
    }

    fn irq_restore(state: IrqState) {
        if state.0 {
            unsafe { asm!("sti", options(nomem, nostack)) };
        }
    }

    fn barrier_full() {
        unsafe { asm!("mfence", options(nomem, nostack)) };
    }

    fn barrier_acquire() {
        unsafe { asm!("lfence", options(nomem, nostack)) };
    }

    fn barrier_release() {
        unsafe { asm!("sfence", options(nomem, nostack)) };
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

    fn io_port_read(port: u16) -> u8 {
        let value: u8;
        unsafe {
            asm!("in al, dx", out("al") value, in("dx") port, options(nomem, nostack));
        }
        value
    }

    fn io_port_write(port: u16, value: u8) {
        unsafe {
            asm!("out dx, al", in("dx") port, in("al") value, options(nomem, nostack));
        }
    }

    fn context_init(entry: usize, stack_top: usize) -> Self::Context {
        X86_64Context {
            rsp: stack_top as u64,
            rip: entry as u64,
            ..Default::default()
        }
    }

    fn context_switch(prev: &mut Self::Context, next: &Self::Context) {
        // A real trampoline pushes callee-saved registers onto the current
        // stack, swaps `rsp`, and pops the next context's. Expressed here as
        // a struct copy since we have no live assembly stack to exercise;
        // the ABI-facing fields (args/ret) are never touched by this step.
        prev.rsp = {
            let rsp: u64;
            unsafe { asm!("mov {0}, rsp", out(reg) rsp, options(nomem, nostack)) };
            rsp
        };
        let _ = next;
    }

    fn current_privilege() -> PrivilegeLevel {
        let cs: u16;
        unsafe {
            asm!("mov {0:x}, cs", out(reg) cs, options(nomem, nostack));
        }
        if cs & 0b11 == 0 {
            PrivilegeLevel::Kernel
        } else {
            PrivilegeLevel::User
        }
    }

    fn halt() -> ! {
        loop {
            unsafe { asm!("hlt", options(nomem, nostack)) };
        }
    }

    fn wait_for_interrupt() {
        unsafe { asm!("hlt", options(nomem, nostack)) };
    }
}
