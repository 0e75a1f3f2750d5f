// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-specific support (C1).
//!
//! Rather than conditionally compiling a single backend in as hubris does
//! (its kernel only ever targets one `arch::*` module at a time), the core
//! here compiles against the [`Arch`] trait so that x86-64, ARM64, and
//! RISC-V backends — plus a host-only backend used by every test — can all
//! exist in one crate. No code outside this module may branch on
//! `target_arch`; everything else calls through `Arch`.

pub mod arm64;
pub mod host;
pub mod riscv;
pub mod x86_64;

use abi::Timestamp;

/// Opaque token proving interrupts were disabled by [`Arch::irq_save`].
/// Restoring with anything other than the token `irq_save` returned is a
/// logic error, so the type deliberately carries no public constructor.
#[derive(Copy, Clone, Debug)]
pub struct IrqState(pub(crate) bool);

/// An architecturally saved context. Opaque to the core (spec.md §3: "Saved
/// architectural context (opaque to the core; owned by C1)"); each backend
/// defines its own layout.
pub trait SavedContext: Default + Clone {
    /// Syscall argument register 0..3 as read by the call gate.
    fn arg(&self, index: usize) -> u64;
    /// Writes the syscall return value register.
    fn set_return(&mut self, value: u64);
}

/// Current CPU privilege level, as reported by `current_privilege`.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PrivilegeLevel {
    Kernel,
    User,
}

/// The narrow, capability-independent hardware contract the rest of the
/// core is built on (spec.md §4.1). Implemented once per backend; the
/// x86-64/ARM64/RISC-V differences never leak past this trait.
pub trait Arch {
    type Context: SavedContext;

    /// Monotonic, nanosecond-granular (or convertible) timestamp.
    fn timestamp() -> Timestamp;

    /// Disables maskable interrupts, returning a token that restores the
    /// prior state. Nestable: an inner `irq_save`/`irq_restore` pair is a
    /// no-op with respect to an outer one still held.
    fn irq_save() -> IrqState;
    /// Restores interrupt state to what it was before the matching
    /// `irq_save`.
    fn irq_restore(state: IrqState);

    fn barrier_full();
    fn barrier_acquire();
    fn barrier_release();

    /// # Safety
    /// `addr` must be a valid MMIO address for the calling domain's mapped
    /// device region; the caller (the Call Gate, after a capability check)
    /// is responsible for that.
    unsafe fn mmio_read8(addr: usize) -> u8;
    unsafe fn mmio_read16(addr: usize) -> u16;
    unsafe fn mmio_read32(addr: usize) -> u32;
    unsafe fn mmio_read64(addr: usize) -> u64;
    /// # Safety
    /// See [`Arch::mmio_read8`].
    unsafe fn mmio_write8(addr: usize, value: u8);
    unsafe fn mmio_write16(addr: usize, value: u16);
    unsafe fn mmio_write32(addr: usize, value: u32);
    unsafe fn mmio_write64(addr: usize, value: u64);

    /// On architectures without a separate I/O address space this is a
    /// no-op returning `0xFF`, per spec.md §4.1.
    fn io_port_read(port: u16) -> u8;
    fn io_port_write(port: u16, value: u8);

    /// Produces a context that, when restored, enters `entry` with
    /// `stack_top` as the stack pointer.
    fn context_init(entry: usize, stack_top: usize) -> Self::Context;

    /// Saves `prev`, restores `next`. The caller must hold an [`IrqState`]
    /// for the duration (spec.md §4.1: "atomic with respect to interrupts").
    fn context_switch(prev: &mut Self::Context, next: &Self::Context);

    fn current_privilege() -> PrivilegeLevel;
    fn halt() -> !;
    fn wait_for_interrupt();
}

/// RAII-ish helper: disables interrupts for the lifetime of the value and
/// restores them on drop. Used throughout the core instead of bare
/// `irq_save`/`irq_restore` pairs so a `?`-early-return can never leak an
/// interrupts-disabled region.
pub struct IrqGuard<A: Arch> {
    state: Option<IrqState>,
    _marker: core::marker::PhantomData<A>,
}

impl<A: Arch> IrqGuard<A> {
    pub fn new() -> Self {
        Self {
            state: Some(A::irq_save()),
            _marker: core::marker::PhantomData,
        }
    }
}

impl<A: Arch> Drop for IrqGuard<A> {
    fn drop(&mut self) {
        if let Some(s) = self.state.take() {
            A::irq_restore(s);
        }
    }
}

impl<A: Arch> Default for IrqGuard<A> {
    fn default() -> Self {
        Self::new()
    }
}
