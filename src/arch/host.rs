//! Hosted backend.
//!
//! Runs the runtime as an ordinary process: "traps" are POSIX signals, so
//! masking traps blocks signal delivery for the calling thread, and an
//! unwind is carried by a private panic payload that only the matching
//! protected call catches.

use super::Arch;
use crate::invoke::InvokeStatus;
use crate::state::{FpState, IntegerState, InvokeFrame, Word};
use std::boxed::Box;
use std::panic::{self, AssertUnwindSafe};

/// Hosted architecture implementation.
pub struct HostArch;

/// Panic payload identifying the frame an unwind targets by the stack
/// address its protected call recorded.
struct UnwindToken {
    sp: Word,
}

impl Arch for HostArch {
    #[cfg(target_os = "linux")]
    type Mask = libc::sigset_t;
    #[cfg(not(target_os = "linux"))]
    type Mask = bool;

    #[cfg(target_os = "linux")]
    fn disable_interrupts() -> Self::Mask {
        use core::mem::MaybeUninit;

        unsafe {
            let mut all = MaybeUninit::<libc::sigset_t>::uninit();
            libc::sigfillset(all.as_mut_ptr());
            let mut previous = MaybeUninit::<libc::sigset_t>::uninit();
            libc::sigemptyset(previous.as_mut_ptr());
            libc::pthread_sigmask(libc::SIG_BLOCK, all.as_ptr(), previous.as_mut_ptr());
            previous.assume_init()
        }
    }

    #[cfg(target_os = "linux")]
    fn restore_interrupts(previous: Self::Mask) {
        unsafe {
            libc::pthread_sigmask(libc::SIG_SETMASK, &previous, core::ptr::null_mut());
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn disable_interrupts() -> Self::Mask {
        TRAPS_MASKED.swap(true, portable_atomic::Ordering::AcqRel)
    }

    #[cfg(not(target_os = "linux"))]
    fn restore_interrupts(previous: Self::Mask) {
        TRAPS_MASKED.store(previous, portable_atomic::Ordering::Release);
    }

    unsafe fn call_protected(frame: *mut InvokeFrame, body: &mut dyn FnMut()) -> InvokeStatus {
        // No registers to capture. The address of a local is unique among
        // the protected calls currently on this stack and names the frame.
        let marker = 0u8;
        let sp = &marker as *const u8 as Word;
        unsafe {
            (*frame).sp = sp;
            (*frame).cpinvoke = Self::call_protected as usize;
        }

        match panic::catch_unwind(AssertUnwindSafe(|| body())) {
            Ok(()) => InvokeStatus::Completed,
            Err(payload) => match payload.downcast::<UnwindToken>() {
                Ok(token) if token.sp == sp => InvokeStatus::Unwound,
                Ok(token) => panic::resume_unwind(token),
                Err(other) => panic::resume_unwind(other),
            },
        }
    }

    unsafe fn unwind_to(frame: *const InvokeFrame) -> ! {
        // resume_unwind skips the panic hook, so an unwind prints nothing.
        let sp = unsafe { (*frame).sp };
        panic::resume_unwind(Box::new(UnwindToken { sp }))
    }

    unsafe fn switch_integer(_prev: *mut IntegerState, _next: *const IntegerState) {
        // The host never leaves the calling stack; resting states keep the
        // values recorded when they were built or last saved.
    }

    unsafe fn save_fp(_area: &mut FpState) {}

    unsafe fn load_fp(_area: &FpState) {}
}

impl HostArch {
    /// Whether traps are masked on the calling thread.
    #[cfg(target_os = "linux")]
    pub fn traps_masked() -> bool {
        use core::mem::MaybeUninit;

        unsafe {
            let mut current = MaybeUninit::<libc::sigset_t>::uninit();
            libc::sigemptyset(current.as_mut_ptr());
            libc::pthread_sigmask(libc::SIG_BLOCK, core::ptr::null(), current.as_mut_ptr());
            libc::sigismember(current.as_ptr(), libc::SIGALRM) == 1
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub fn traps_masked() -> bool {
        TRAPS_MASKED.load(portable_atomic::Ordering::Acquire)
    }
}

#[cfg(not(target_os = "linux"))]
static TRAPS_MASKED: portable_atomic::AtomicBool = portable_atomic::AtomicBool::new(false);
