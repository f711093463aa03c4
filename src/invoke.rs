//! Protected calls.
//!
//! A protected call pushes an [`InvokeFrame`] onto its processor's chain and
//! runs the callee. If the trap layer detects a fault while the callee runs
//! it calls [`InvokeChain::unwind`], which pops the innermost frame and
//! resumes the caller of the matching [`InvokeChain::invoke`] with
//! [`InvokeStatus::Unwound`]. Every frame is consumed exactly once, by a
//! normal return or by one unwind.

use crate::arch::{Arch, DefaultArch, InterruptGuard};
use crate::config::MAX_INVOKE_DEPTH;
use crate::error::{fatal, Fatal, SvaError, SvaResult};
use crate::state::{InvokeFrame, Word};
use core::cell::UnsafeCell;
use portable_atomic::{AtomicUsize, Ordering};

/// Outcome of a protected call, as reported to the ABI.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeStatus {
    Completed = 0,
    Unwound = 1,
}

/// Function type accepted by [`InvokeChain::invoke`].
pub type InvokeFn = fn(Word, Word, Word) -> Word;

/// A protected call was unwound before its callee returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unwound;

/// Per-processor stack of invoke frames.
///
/// Only the owning processor mutates the chain, with traps masked, so the
/// frame array lives in an `UnsafeCell` and the depth is published through
/// an atomic for readers on the same processor.
pub struct InvokeChain {
    frames: UnsafeCell<[InvokeFrame; MAX_INVOKE_DEPTH]>,
    depth: AtomicUsize,
}

// Mutated only by the owning processor; see the type docs.
unsafe impl Sync for InvokeChain {}

impl Default for InvokeChain {
    fn default() -> Self {
        Self::new()
    }
}

impl InvokeChain {
    pub const fn new() -> Self {
        Self {
            frames: UnsafeCell::new([const { InvokeFrame::new() }; MAX_INVOKE_DEPTH]),
            depth: AtomicUsize::new(0),
        }
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.depth() == 0
    }

    /// Innermost frame, or null when no protected call is in flight.
    pub fn gip(&self) -> *mut InvokeFrame {
        match self.depth() {
            0 => core::ptr::null_mut(),
            depth => self.slot(depth - 1),
        }
    }

    fn slot(&self, index: usize) -> *mut InvokeFrame {
        debug_assert!(index < MAX_INVOKE_DEPTH);
        unsafe { (self.frames.get() as *mut InvokeFrame).add(index) }
    }

    fn push(&self) -> usize {
        let _guard = InterruptGuard::<DefaultArch>::new();

        let index = self.depth.load(Ordering::Acquire);
        if index >= MAX_INVOKE_DEPTH {
            fatal(Fatal::InvokeChainExhausted);
        }
        // Reserve the slot before writing it so a nested trap pushes above it.
        self.depth.store(index + 1, Ordering::Release);

        let next = if index == 0 {
            core::ptr::null_mut()
        } else {
            self.slot(index - 1)
        };
        unsafe {
            self.slot(index).write(InvokeFrame {
                next,
                ..InvokeFrame::new()
            });
        }
        index
    }

    fn pop(&self, index: usize) {
        let _guard = InterruptGuard::<DefaultArch>::new();

        let depth = self.depth.load(Ordering::Acquire);
        if depth != index + 1 {
            fatal(Fatal::NestingViolation {
                expected: index + 1,
                found: depth,
            });
        }
        self.depth.store(index, Ordering::Release);
    }

    /// Run `f` as a protected call.
    pub fn protect<R>(&self, f: impl FnOnce() -> R) -> Result<R, Unwound> {
        let index = self.push();

        let mut f = Some(f);
        let mut result = None;
        let mut body = || {
            if let Some(f) = f.take() {
                result = Some(f());
            }
        };
        let status = unsafe { DefaultArch::call_protected(self.slot(index), &mut body) };

        match status {
            InvokeStatus::Completed => {
                self.pop(index);
                result.ok_or(Unwound)
            }
            InvokeStatus::Unwound => {
                // The unwind already consumed our frame.
                let depth = self.depth();
                if depth != index {
                    fatal(Fatal::NestingViolation {
                        expected: index,
                        found: depth,
                    });
                }
                Err(Unwound)
            }
        }
    }

    /// Call `f(arg1, arg2, arg3)` as a protected call. On completion the
    /// return value is stored in `result`; on unwind `result` is untouched.
    pub fn invoke(
        &self,
        arg1: Word,
        arg2: Word,
        arg3: Word,
        result: &mut Word,
        f: InvokeFn,
    ) -> InvokeStatus {
        match self.protect(|| f(arg1, arg2, arg3)) {
            Ok(value) => {
                *result = value;
                InvokeStatus::Completed
            }
            Err(Unwound) => InvokeStatus::Unwound,
        }
    }

    /// Abandon the innermost protected call. Called by the fault path while
    /// the callee is running; never returns.
    pub fn unwind(&self) -> ! {
        let frame = {
            let _guard = InterruptGuard::<DefaultArch>::new();

            let depth = self.depth.load(Ordering::Acquire);
            if depth == 0 {
                fatal(Fatal::UnwindUnderflow);
            }
            let index = depth - 1;
            let frame = unsafe { self.slot(index).read() };
            self.depth.store(index, Ordering::Release);
            frame
        };

        log::trace!("unwinding invoke frame at depth {}", self.depth());
        unsafe { DefaultArch::unwind_to(&frame) }
    }

    /// Protected `strncpy`: copy from `src` into `dst` until a NUL byte has
    /// been copied or `min(count, dst.len())` bytes have been copied. Returns
    /// the number of non-NUL bytes copied. After a fault the contents of
    /// `dst` are unspecified.
    ///
    /// # Safety
    ///
    /// `src` may point at untrusted memory; a fault while reading it must be
    /// routed by the trap layer to [`InvokeChain::unwind`].
    pub unsafe fn invoke_strncpy(&self, dst: &mut [u8], src: *const u8, count: usize) -> SvaResult<usize> {
        if src.is_null() {
            return Err(SvaError::BoundedCopyFault);
        }
        self.bounded_copy(dst, count, |offset| unsafe {
            core::ptr::read_volatile(src.add(offset))
        })
    }

    /// The copy loop of [`InvokeChain::invoke_strncpy`] over an arbitrary
    /// byte source.
    pub fn bounded_copy(
        &self,
        dst: &mut [u8],
        count: usize,
        mut read: impl FnMut(usize) -> u8,
    ) -> SvaResult<usize> {
        let limit = count.min(dst.len());
        self.protect(|| {
            let mut copied = 0;
            while copied < limit {
                let byte = read(copied);
                dst[copied] = byte;
                if byte == 0 {
                    break;
                }
                copied += 1;
            }
            copied
        })
        .map_err(|Unwound| {
            log::warn!("bounded copy faulted");
            SvaError::BoundedCopyFault
        })
    }
}
