//! ARM (A32 state) backend.
//!
//! Protected calls record `r4..r11`, `sp` and a continuation label in the
//! invoke frame before calling the body; an unwind reloads them and branches
//! to the label with `r0 = 1`. The frame handed to an unwind may sit below
//! the restored stack pointer, so every field is loaded before `sp` moves.
//!
//! Integer-state switches store the callee-saved registers and resume at a
//! label. A state whose `lr` is zero has never run: it is entered at its
//! staged `pc` with the arguments in `r0..r2` and the mode and trap mask of
//! its staged `spsr`.

#[cfg(target_feature = "thumb-mode")]
compile_error!("the ARM backend switches stacks in A32 state; build for an ARM-state target");

use super::Arch;
use crate::invoke::InvokeStatus;
use crate::state::{
    FpState, IntegerState, InvokeFrame, FRAME_OFFSET_CPINVOKE, FRAME_OFFSET_SP, INT_OFFSET_GPR,
    INT_OFFSET_LR, INT_OFFSET_PC, INT_OFFSET_SP, INT_OFFSET_SPSR, INT_OFFSET_VALID, WORD,
};
use core::arch::{asm, naked_asm};

/// ARM architecture implementation.
pub struct ArmArch;

/// CPSR I and F bits.
const CPSR_IRQ_FIQ: u32 = 0xC0;

type Body<'a> = &'a mut dyn FnMut();

unsafe extern "C" fn run_body(body: *mut Body<'_>) {
    unsafe { (*body)() }
}

/// Returns 0 when the body returns, 1 when resumed by `unwind_frame`.
#[unsafe(naked)]
unsafe extern "C" fn invoke_trampoline(
    frame: *mut InvokeFrame,
    body: *mut Body<'_>,
    run: unsafe extern "C" fn(*mut Body<'_>),
) -> u32 {
    naked_asm!(
        "push {{r4, lr}}",
        "stmia r0, {{r4-r11}}",
        "str sp, [r0, #{sp}]",
        "adr r3, 2f",
        "str r3, [r0, #{cont}]",
        "mov r0, r1",
        "blx r2",
        "mov r0, #0",
        "pop {{r4, pc}}",
        "2:",
        "mov r0, #1",
        "pop {{r4, pc}}",
        sp = const FRAME_OFFSET_SP,
        cont = const FRAME_OFFSET_CPINVOKE,
    );
}

#[unsafe(naked)]
unsafe extern "C" fn unwind_frame(frame: *const InvokeFrame) -> ! {
    naked_asm!(
        "ldr r1, [r0, #{cont}]",
        "ldr r2, [r0, #{sp}]",
        "ldmia r0, {{r4-r11}}",
        "mov sp, r2",
        "bx r1",
        sp = const FRAME_OFFSET_SP,
        cont = const FRAME_OFFSET_CPINVOKE,
    );
}

/// Saves into `prev` and resumes `next`. A thread switched out here later
/// resumes at label `1` and returns to its caller; a fresh one starts at
/// label `2`.
#[unsafe(naked)]
unsafe extern "C" fn switch_integer_state(prev: *mut IntegerState, next: *const IntegerState) {
    naked_asm!(
        "add r2, r0, #{r4}",
        "stmia r2, {{r4-r11}}",
        "str sp, [r0, #{sp}]",
        "str lr, [r0, #{lr}]",
        "adr r2, 1f",
        "str r2, [r0, #{pc}]",
        "mov r2, #1",
        "str r2, [r0, #{valid}]",
        "ldr r2, [r1, #{lr}]",
        "cmp r2, #0",
        "beq 2f",
        "ldr sp, [r1, #{sp}]",
        "mov lr, r2",
        "ldr r2, [r1, #{pc}]",
        "push {{r2}}",
        "add r0, r1, #{gpr}",
        "ldmia r0, {{r0-r12}}",
        "pop {{pc}}",
        "1:",
        "bx lr",
        // Fresh thread: take mode and trap mask from the staged spsr. The
        // mode switch happens with traps still masked so the banked sp is
        // loaded before anything can be taken on it.
        "2:",
        "ldr r4, [r1, #{pc}]",
        "ldr r5, [r1, #{spsr}]",
        "orr r6, r5, #{masked}",
        "msr cpsr_c, r6",
        "ldr sp, [r1, #{sp}]",
        "add r3, r1, #{gpr}",
        "ldmia r3, {{r0-r2}}",
        "mov lr, #0",
        "msr cpsr_c, r5",
        "bx r4",
        r4 = const INT_OFFSET_GPR + 4 * WORD,
        gpr = const INT_OFFSET_GPR,
        sp = const INT_OFFSET_SP,
        lr = const INT_OFFSET_LR,
        pc = const INT_OFFSET_PC,
        spsr = const INT_OFFSET_SPSR,
        masked = const CPSR_IRQ_FIQ,
        valid = const INT_OFFSET_VALID,
    );
}

impl Arch for ArmArch {
    type Mask = u32;

    fn disable_interrupts() -> Self::Mask {
        let cpsr: u32;
        unsafe {
            asm!("mrs {}, cpsr", "cpsid if", out(reg) cpsr, options(nostack, preserves_flags));
        }
        cpsr
    }

    fn restore_interrupts(previous: Self::Mask) {
        if previous & CPSR_IRQ_FIQ != CPSR_IRQ_FIQ {
            unsafe {
                asm!("msr cpsr_c, {}", in(reg) previous, options(nostack));
            }
        }
    }

    unsafe fn call_protected(frame: *mut InvokeFrame, body: &mut dyn FnMut()) -> InvokeStatus {
        let mut body: Body<'_> = body;
        match unsafe { invoke_trampoline(frame, &mut body, run_body) } {
            0 => InvokeStatus::Completed,
            _ => InvokeStatus::Unwound,
        }
    }

    unsafe fn unwind_to(frame: *const InvokeFrame) -> ! {
        unsafe { unwind_frame(frame) }
    }

    unsafe fn switch_integer(prev: *mut IntegerState, next: *const IntegerState) {
        unsafe { switch_integer_state(prev, next) }
    }

    #[cfg(target_feature = "vfp2")]
    unsafe fn save_fp(area: &mut FpState) {
        unsafe {
            asm!(
                "vstmia {base}, {{d0-d15}}",
                "vmrs {tmp}, fpscr",
                "str {tmp}, [{base}, #128]",
                base = in(reg) area.words.as_mut_ptr(),
                tmp = out(reg) _,
                options(nostack),
            );
        }
    }

    #[cfg(not(target_feature = "vfp2"))]
    unsafe fn save_fp(_area: &mut FpState) {}

    #[cfg(target_feature = "vfp2")]
    unsafe fn load_fp(area: &FpState) {
        unsafe {
            asm!(
                "vldmia {base}, {{d0-d15}}",
                "ldr {tmp}, [{base}, #128]",
                "vmsr fpscr, {tmp}",
                base = in(reg) area.words.as_ptr(),
                tmp = out(reg) _,
                options(nostack),
            );
        }
    }

    #[cfg(not(target_feature = "vfp2"))]
    unsafe fn load_fp(_area: &FpState) {}
}
