//! Architecture abstraction layer.
//!
//! Everything that touches hardware goes through [`Arch`]: masking traps,
//! the non-local transfer that unwinds a protected call, switching integer
//! state, saving FP registers and reading the saved mode bits. The rest of
//! the crate only sees the abstracted bit patterns and records.

use crate::invoke::InvokeStatus;
use crate::state::{FpState, IContext, IntegerState, InvokeFrame, Word};
use core::marker::PhantomData;

/// Architecture abstraction trait.
///
/// # Safety
///
/// Implementations perform raw control transfers. Methods marked unsafe have
/// preconditions documented on each method that the caller must uphold.
pub trait Arch {
    /// Trap-delivery state captured by [`Arch::disable_interrupts`].
    type Mask: Copy;

    /// Mask trap delivery on the current processor, returning the previous
    /// state.
    fn disable_interrupts() -> Self::Mask;

    /// Restore a state returned by [`Arch::disable_interrupts`].
    fn restore_interrupts(previous: Self::Mask);

    /// Mode bits of a saved interrupt context.
    fn read_saved_mode_bits(ic: &IContext) -> Word {
        ic.spsr
    }

    /// Record the caller's callee-saved registers and a continuation in
    /// `frame`, then run `body`.
    ///
    /// Returns [`InvokeStatus::Completed`] when `body` returns and
    /// [`InvokeStatus::Unwound`] when [`Arch::unwind_to`] was called on
    /// `frame` while `body` was running.
    ///
    /// # Safety
    ///
    /// - `frame` must stay valid and unmoved until this call returns
    /// - `frame` must already be linked into the processor's invoke chain
    unsafe fn call_protected(frame: *mut InvokeFrame, body: &mut dyn FnMut()) -> InvokeStatus;

    /// Restore the registers recorded in `frame` and resume at its
    /// continuation, making the matching `call_protected` return
    /// [`InvokeStatus::Unwound`].
    ///
    /// # Safety
    ///
    /// - `frame` must have been filled by a `call_protected` that has not
    ///   yet returned
    /// - Must be called from within the dynamic extent of that call
    unsafe fn unwind_to(frame: *const InvokeFrame) -> !;

    /// Save the running register file into `prev` and resume `next`.
    ///
    /// # Safety
    ///
    /// - Both pointers must reference valid, aligned integer states
    /// - Must be called with traps masked
    /// - `next` must describe a resumable execution state
    unsafe fn switch_integer(prev: *mut IntegerState, next: *const IntegerState);

    /// Store the FP registers into `area`.
    ///
    /// # Safety
    ///
    /// The FPU must be enabled on the current processor.
    unsafe fn save_fp(area: &mut FpState);

    /// Load the FP registers from `area`.
    ///
    /// # Safety
    ///
    /// `area` must hold registers stored by [`Arch::save_fp`].
    unsafe fn load_fp(area: &FpState);
}

/// Masks traps for its lifetime.
pub struct InterruptGuard<A: Arch = DefaultArch> {
    previous: A::Mask,
    _arch: PhantomData<A>,
}

impl<A: Arch> InterruptGuard<A> {
    pub fn new() -> Self {
        Self {
            previous: A::disable_interrupts(),
            _arch: PhantomData,
        }
    }
}

impl<A: Arch> Default for InterruptGuard<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Arch> Drop for InterruptGuard<A> {
    fn drop(&mut self) {
        A::restore_interrupts(self.previous);
    }
}

/// Backend with no hardware behind it. Protected calls run unprotected and
/// an unwind request is fatal.
pub struct NoOpArch;

impl Arch for NoOpArch {
    type Mask = ();

    fn disable_interrupts() -> Self::Mask {}

    fn restore_interrupts(_previous: Self::Mask) {}

    unsafe fn call_protected(_frame: *mut InvokeFrame, body: &mut dyn FnMut()) -> InvokeStatus {
        body();
        InvokeStatus::Completed
    }

    unsafe fn unwind_to(_frame: *const InvokeFrame) -> ! {
        crate::error::fatal(crate::error::Fatal::NoUnwindBackend)
    }

    unsafe fn switch_integer(_prev: *mut IntegerState, _next: *const IntegerState) {}

    unsafe fn save_fp(_area: &mut FpState) {}

    unsafe fn load_fp(_area: &FpState) {}
}

#[cfg(all(target_arch = "arm", feature = "arm"))]
pub mod arm;

#[cfg(any(test, feature = "std"))]
pub mod host;

#[cfg(all(target_arch = "arm", feature = "arm"))]
pub use arm::ArmArch as DefaultArch;

#[cfg(all(
    any(test, feature = "std"),
    not(all(target_arch = "arm", feature = "arm"))
))]
pub use host::HostArch as DefaultArch;

#[cfg(not(any(test, feature = "std", all(target_arch = "arm", feature = "arm"))))]
pub use NoOpArch as DefaultArch;
