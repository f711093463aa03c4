//! Saved processor state.
//!
//! These records are shared with trap-entry code that addresses fields by
//! fixed byte offset, so field order and alignment are part of the ABI. The
//! `OFFSET_*` constants below are the offsets that code may rely on; they are
//! checked at compile time.
//!
//! The register file follows the ARM layout: thirteen general registers
//! `r0..r12`, then `sp`, `lr` and `pc`, with the processor mode kept in an
//! `spsr`-style status word.

use crate::config::FP_SAVE_BYTES;
use core::mem::{offset_of, size_of};

/// One machine register.
pub type Word = usize;

/// Bytes per machine register.
pub const WORD: usize = size_of::<Word>();

/// General registers `r0..r12`.
pub const NUM_GPRS: usize = 13;

/// Callee-saved registers `r4..r11` captured by an invoke frame.
pub const NUM_CALLEE_SAVED: usize = 8;

/// Processor mode encoding of the saved status word.
pub mod mode {
    use super::Word;

    /// Low five bits of the status word select the mode.
    pub const MODE_MASK: Word = 0x1F;
    pub const USER: Word = 0x10;
    pub const FIQ: Word = 0x11;
    pub const IRQ: Word = 0x12;
    pub const SUPERVISOR: Word = 0x13;
    pub const ABORT: Word = 0x17;
    pub const UNDEFINED: Word = 0x1B;
    pub const SYSTEM: Word = 0x1F;

    /// User mode is the only mode with all of these bits clear.
    pub const USER_MODE_MASK: Word = 0x0F;

    /// Trap-mask flags. Clear in a status word means the trap is taken.
    pub const IRQ_DISABLE: Word = 0x80;
    pub const FIQ_DISABLE: Word = 0x40;

    #[inline]
    pub const fn is_privileged(bits: Word) -> bool {
        bits & USER_MODE_MASK != 0
    }

    /// Replace the mode bits of `status`, keeping the flag bits.
    #[inline]
    pub const fn with_mode(status: Word, mode: Word) -> Word {
        (status & !MODE_MASK) | (mode & MODE_MASK)
    }
}

/// Floating-point register save area. Filled lazily: `present` is non-zero
/// only once the registers have actually been stored here.
#[repr(C, align(16))]
#[derive(Clone, Copy)]
pub struct FpState {
    pub words: [u8; FP_SAVE_BYTES],
    pub present: u8,
}

impl FpState {
    pub const fn new() -> Self {
        Self {
            words: [0; FP_SAVE_BYTES],
            present: 0,
        }
    }

    pub fn is_present(&self) -> bool {
        self.present != 0
    }
}

impl Default for FpState {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for FpState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FpState")
            .field("present", &self.present)
            .finish_non_exhaustive()
    }
}

/// State saved when a trap, exception or system call interrupts a thread.
///
/// The record is an even number of words and a multiple of 16 bytes; the
/// trap-entry code pushes it in 16-byte units.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy)]
pub struct IContext {
    /// Invoke pointer of the interrupted code.
    pub invokep: Word,
    pub gpr: [Word; NUM_GPRS],
    pub sp: Word,
    pub lr: Word,
    pub pc: Word,
    /// Hardware trap number.
    pub trapno: Word,
    /// Saved program status, mode in the low five bits.
    pub spsr: Word,
    /// Non-zero once every register above has been written.
    pub valid: Word,
    /// FP registers saved on entry to this context, or null.
    pub fpstate: *mut FpState,
    _reserved: Word,
}

// The record is plain data; the FP pointer only ever names a slot inside
// the same thread's pool.
unsafe impl Send for IContext {}

impl IContext {
    pub const fn new() -> Self {
        Self {
            invokep: 0,
            gpr: [0; NUM_GPRS],
            sp: 0,
            lr: 0,
            pc: 0,
            trapno: 0,
            spsr: 0,
            valid: 0,
            fpstate: core::ptr::null_mut(),
            _reserved: 0,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid != 0
    }

    /// Publish the record. Call only after every register is written.
    pub fn mark_valid(&mut self) {
        self.valid = 1;
    }

    /// Reset to the invalid default.
    pub fn clear(&mut self) {
        *self = Self::new();
    }

    pub fn mode(&self) -> Word {
        self.spsr & mode::MODE_MASK
    }

    /// Whether the interrupted code ran in a privileged mode.
    pub fn was_privileged(&self) -> bool {
        mode::is_privileged(self.spsr)
    }
}

impl Default for IContext {
    fn default() -> Self {
        Self::new()
    }
}

pub const OFFSET_INVOKEP: usize = offset_of!(IContext, invokep);
pub const OFFSET_GPR: usize = offset_of!(IContext, gpr);
pub const OFFSET_SP: usize = offset_of!(IContext, sp);
pub const OFFSET_LR: usize = offset_of!(IContext, lr);
pub const OFFSET_PC: usize = offset_of!(IContext, pc);
pub const OFFSET_TRAPNO: usize = offset_of!(IContext, trapno);
pub const OFFSET_SPSR: usize = offset_of!(IContext, spsr);
pub const OFFSET_VALID: usize = offset_of!(IContext, valid);
pub const OFFSET_FPSTATE: usize = offset_of!(IContext, fpstate);

const _: () = {
    assert!(size_of::<IContext>() % 16 == 0);
    assert!((size_of::<IContext>() / WORD) % 2 == 0);
    assert!(OFFSET_INVOKEP == 0);
    assert!(OFFSET_GPR == WORD);
    assert!(OFFSET_SP == 14 * WORD);
    assert!(OFFSET_LR == 15 * WORD);
    assert!(OFFSET_PC == 16 * WORD);
    assert!(OFFSET_TRAPNO == 17 * WORD);
    assert!(OFFSET_SPSR == 18 * WORD);
    assert!(OFFSET_VALID == 19 * WORD);
    assert!(OFFSET_FPSTATE == 20 * WORD);
    assert!(size_of::<FpState>() % 16 == 0);
};

/// Callee-saved registers and continuation of a suspended `invoke` caller.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct InvokeFrame {
    /// `r4..r11`
    pub callee_saved: [Word; NUM_CALLEE_SAVED],
    pub sp: Word,
    /// Next-older frame on the same processor, null at the bottom.
    pub next: *mut InvokeFrame,
    /// Address execution resumes at when this frame is unwound.
    pub cpinvoke: Word,
}

impl InvokeFrame {
    pub const fn new() -> Self {
        Self {
            callee_saved: [0; NUM_CALLEE_SAVED],
            sp: 0,
            next: core::ptr::null_mut(),
            cpinvoke: 0,
        }
    }
}

impl Default for InvokeFrame {
    fn default() -> Self {
        Self::new()
    }
}

pub const FRAME_OFFSET_CALLEE_SAVED: usize = offset_of!(InvokeFrame, callee_saved);
pub const FRAME_OFFSET_SP: usize = offset_of!(InvokeFrame, sp);
pub const FRAME_OFFSET_NEXT: usize = offset_of!(InvokeFrame, next);
pub const FRAME_OFFSET_CPINVOKE: usize = offset_of!(InvokeFrame, cpinvoke);

/// Resting register file of a thread that is not on a processor.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy)]
pub struct IntegerState {
    pub invokep: Word,
    pub gpr: [Word; NUM_GPRS],
    pub sp: Word,
    pub lr: Word,
    pub pc: Word,
    pub trapno: Word,
    pub spsr: Word,
    pub valid: Word,
    /// Kernel stack pointer loaded on the next trap.
    pub kstackp: Word,
    /// Interrupt-context depth of the thread when it was switched out.
    pub current_ic: Word,
    /// Lazily saved FP registers.
    pub fpstate: FpState,
    /// Invoke frame pointer; always null while the thread is resting.
    pub ifp: *mut InvokeFrame,
}

unsafe impl Send for IntegerState {}

impl IntegerState {
    pub const fn new() -> Self {
        Self {
            invokep: 0,
            gpr: [0; NUM_GPRS],
            sp: 0,
            lr: 0,
            pc: 0,
            trapno: 0,
            spsr: 0,
            valid: 0,
            kstackp: 0,
            current_ic: 0,
            fpstate: FpState::new(),
            ifp: core::ptr::null_mut(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid != 0
    }
}

impl Default for IntegerState {
    fn default() -> Self {
        Self::new()
    }
}

pub const INT_OFFSET_GPR: usize = offset_of!(IntegerState, gpr);
pub const INT_OFFSET_SP: usize = offset_of!(IntegerState, sp);
pub const INT_OFFSET_LR: usize = offset_of!(IntegerState, lr);
pub const INT_OFFSET_PC: usize = offset_of!(IntegerState, pc);
pub const INT_OFFSET_SPSR: usize = offset_of!(IntegerState, spsr);
pub const INT_OFFSET_VALID: usize = offset_of!(IntegerState, valid);

const _: () = {
    assert!(INT_OFFSET_GPR == WORD);
    assert!(INT_OFFSET_SP == 14 * WORD);
    assert!(INT_OFFSET_PC == 16 * WORD);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn icontext_layout_is_even_quadwords() {
        let size = size_of::<IContext>();
        assert_eq!(size % 16, 0);
        assert_eq!((size / WORD) % 2, 0);
        assert_eq!(core::mem::align_of::<IContext>(), 16);
    }

    #[test]
    fn fresh_icontext_is_invalid() {
        let ic = IContext::new();
        assert!(!ic.is_valid());
        assert!(ic.fpstate.is_null());

        let mut ic = ic;
        ic.pc = 0x8000;
        ic.mark_valid();
        assert!(ic.is_valid());
        ic.clear();
        assert!(!ic.is_valid());
        assert_eq!(ic.pc, 0);
    }

    #[test]
    fn mode_bits() {
        assert!(!mode::is_privileged(mode::USER));
        for m in [mode::FIQ, mode::IRQ, mode::SUPERVISOR, mode::ABORT, mode::UNDEFINED, mode::SYSTEM] {
            assert!(mode::is_privileged(m), "mode {:#x}", m);
        }
        // Condition flags above the mode field do not matter.
        assert!(!mode::is_privileged(0xF000_0000 | mode::USER));
        assert_eq!(mode::with_mode(0x6000_0013, mode::USER), 0x6000_0010);
    }

    #[test]
    fn fp_state_defaults_absent() {
        let fp = FpState::new();
        assert!(!fp.is_present());
        assert_eq!(core::mem::align_of::<FpState>(), 16);
    }
}
