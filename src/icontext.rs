//! Per-thread interrupt-context allocator.
//!
//! Each thread owns `MAX_IC + 1` interrupt-context slots. Slot 0 is the
//! thread's base context; nested traps reserve slots `1..=MAX_IC` in strict
//! LIFO order. A parallel sequence holds contexts preserved across a
//! synthetic re-entry (signal-style dispatch), and a third holds the FP
//! registers of contexts that interrupted FP-using code.
//!
//! Every cursor stays in `[0, MAX_IC]`. Running past the ceiling stops the
//! processor: there is no fallback storage.

use crate::arch::{Arch, DefaultArch, InterruptGuard};
use crate::config::{IC_SLOTS, MAX_IC};
use crate::error::{fatal, Fatal};
use crate::state::{FpState, IContext};

#[repr(C, align(16))]
pub struct InterruptContextPool {
    contexts: [IContext; IC_SLOTS],
    saved: [IContext; IC_SLOTS],
    fp: [FpState; IC_SLOTS],
    depth: usize,
    saved_depth: usize,
    fp_index: usize,
}

impl Default for InterruptContextPool {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptContextPool {
    pub const fn new() -> Self {
        Self {
            contexts: [IContext::new(); IC_SLOTS],
            saved: [IContext::new(); IC_SLOTS],
            fp: [FpState::new(); IC_SLOTS],
            depth: 0,
            saved_depth: 0,
            fp_index: 0,
        }
    }

    /// Invalidate every slot and rewind every cursor.
    pub fn reset(&mut self) {
        let _guard = InterruptGuard::<DefaultArch>::new();
        self.depth = 0;
        self.saved_depth = 0;
        self.fp_index = 0;
        self.contexts.iter_mut().for_each(IContext::clear);
        self.saved.iter_mut().for_each(IContext::clear);
        self.fp.iter_mut().for_each(|fp| fp.present = 0);
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn saved_depth(&self) -> usize {
        self.saved_depth
    }

    pub fn fp_index(&self) -> usize {
        self.fp_index
    }

    pub fn context(&self, index: usize) -> Option<&IContext> {
        self.contexts.get(index)
    }

    pub fn context_mut(&mut self, index: usize) -> Option<&mut IContext> {
        self.contexts.get_mut(index)
    }

    pub fn saved(&self, index: usize) -> Option<&IContext> {
        self.saved.get(index)
    }

    pub fn fp_slot(&self, index: usize) -> Option<&FpState> {
        self.fp.get(index)
    }

    /// The thread's base context, slot 0.
    pub fn base_mut(&mut self) -> &mut IContext {
        &mut self.contexts[0]
    }

    /// Most recently entered context.
    pub fn current(&self) -> &IContext {
        &self.contexts[self.depth]
    }

    pub fn current_mut(&mut self) -> &mut IContext {
        &mut self.contexts[self.depth]
    }

    /// Reserve the slot for a new nested trap and return its index. The slot
    /// starts invalid; the trap layer fills it and marks it valid.
    pub fn enter(&mut self) -> usize {
        let _guard = InterruptGuard::<DefaultArch>::new();

        if self.depth >= MAX_IC {
            fatal(Fatal::InterruptContextExhausted);
        }
        self.depth += 1;
        let index = self.depth;
        self.contexts[index].clear();
        index
    }

    /// Free the slot returned by the matching [`enter`](Self::enter). Slots
    /// must be left in reverse order of entry.
    pub fn leave(&mut self, index: usize) {
        let _guard = InterruptGuard::<DefaultArch>::new();

        if index == 0 || index != self.depth {
            fatal(Fatal::NestingViolation {
                expected: self.depth,
                found: index,
            });
        }
        if !self.contexts[index].fpstate.is_null() {
            self.release_fp(index);
        }
        self.contexts[index].clear();
        self.depth -= 1;
    }

    fn release_fp(&mut self, index: usize) {
        let linked = self.contexts[index].fpstate as *const FpState;
        let top = &self.fp[self.fp_index] as *const FpState;
        if self.fp_index == 0 || !core::ptr::eq(linked, top) {
            let found = self
                .fp
                .iter()
                .position(|slot| core::ptr::eq(slot, linked))
                .unwrap_or(usize::MAX);
            fatal(Fatal::NestingViolation {
                expected: self.fp_index,
                found,
            });
        }

        let area = &mut self.fp[self.fp_index];
        if area.is_present() {
            unsafe { DefaultArch::load_fp(area) };
        }
        area.present = 0;
        self.fp_index -= 1;
    }

    /// Save the FP registers for the current context, but only if the FPU
    /// was used since the last switch. Returns the FP slot holding them.
    pub fn allocate_fp(&mut self, fp_used: bool) -> Option<usize> {
        if !fp_used {
            return None;
        }
        let _guard = InterruptGuard::<DefaultArch>::new();

        if !self.contexts[self.depth].fpstate.is_null() {
            // Already linked for this context; refresh it.
            let area = &mut self.fp[self.fp_index];
            unsafe { DefaultArch::save_fp(area) };
            area.present = 1;
            return Some(self.fp_index);
        }

        if self.fp_index >= MAX_IC {
            fatal(Fatal::FpStateExhausted);
        }
        self.fp_index += 1;
        let slot = self.fp_index;
        let area = &mut self.fp[slot];
        unsafe { DefaultArch::save_fp(area) };
        area.present = 1;
        self.contexts[self.depth].fpstate = area as *mut FpState;
        Some(slot)
    }

    /// Preserve the current context before it is redirected. Returns the
    /// saved slot index.
    pub fn saved_context_push(&mut self) -> usize {
        let _guard = InterruptGuard::<DefaultArch>::new();

        if self.saved_depth >= MAX_IC {
            fatal(Fatal::SavedContextExhausted);
        }
        self.saved_depth += 1;
        let index = self.saved_depth;
        let mut copy = self.contexts[self.depth];
        copy.fpstate = core::ptr::null_mut();
        self.saved[index] = copy;
        index
    }

    /// Put the most recently preserved context back into the current slot.
    /// The current slot keeps its own FP link. Returns the saved slot index
    /// that was consumed.
    pub fn saved_context_pop(&mut self) -> usize {
        let _guard = InterruptGuard::<DefaultArch>::new();

        if self.saved_depth == 0 {
            fatal(Fatal::SavedContextUnderflow);
        }
        let index = self.saved_depth;
        let fpstate = self.contexts[self.depth].fpstate;
        self.contexts[self.depth] = self.saved[index];
        self.contexts[self.depth].fpstate = fpstate;
        self.saved[index].clear();
        self.saved_depth -= 1;
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::boxed::Box;

    fn pool() -> Box<InterruptContextPool> {
        Box::new(InterruptContextPool::new())
    }

    #[test]
    fn enter_and_leave_nest() {
        let mut pool = pool();
        let first = pool.enter();
        let second = pool.enter();
        assert_eq!((first, second), (1, 2));
        assert_eq!(pool.depth(), 2);
        assert!(!pool.current().is_valid());

        pool.current_mut().pc = 0x1000;
        pool.current_mut().mark_valid();

        pool.leave(second);
        assert!(!pool.context(second).unwrap().is_valid());
        pool.leave(first);
        assert_eq!(pool.depth(), 0);
    }

    #[test]
    fn full_depth_is_usable() {
        let mut pool = pool();
        for expected in 1..=MAX_IC {
            assert_eq!(pool.enter(), expected);
        }
        assert_eq!(pool.depth(), MAX_IC);
        for index in (1..=MAX_IC).rev() {
            pool.leave(index);
        }
        assert_eq!(pool.depth(), 0);
    }

    #[test]
    #[should_panic(expected = "interrupt context pool exhausted")]
    fn entry_past_ceiling_is_fatal() {
        let mut pool = pool();
        for _ in 0..=MAX_IC {
            pool.enter();
        }
    }

    #[test]
    #[should_panic(expected = "nesting violation")]
    fn leaving_out_of_order_is_fatal() {
        let mut pool = pool();
        let first = pool.enter();
        let _second = pool.enter();
        pool.leave(first);
    }

    #[test]
    #[should_panic(expected = "nesting violation")]
    fn leaving_base_slot_is_fatal() {
        let mut pool = pool();
        pool.leave(0);
    }

    #[test]
    fn fp_slots_are_lazy() {
        let mut pool = pool();
        let index = pool.enter();

        assert_eq!(pool.allocate_fp(false), None);
        assert_eq!(pool.fp_index(), 0);
        assert!(pool.current().fpstate.is_null());

        assert_eq!(pool.allocate_fp(true), Some(1));
        assert!(pool.fp_slot(1).unwrap().is_present());
        assert!(!pool.current().fpstate.is_null());

        // A second request for the same context reuses its slot.
        assert_eq!(pool.allocate_fp(true), Some(1));
        assert_eq!(pool.fp_index(), 1);

        pool.leave(index);
        assert_eq!(pool.fp_index(), 0);
        assert!(!pool.fp_slot(1).unwrap().is_present());
    }

    #[test]
    #[should_panic(expected = "floating-point save slots exhausted")]
    fn fp_ceiling_is_fatal() {
        let mut pool = pool();
        for _ in 0..MAX_IC {
            pool.enter();
            pool.allocate_fp(true);
        }
        // Every context holds an FP slot; the next one must come from the
        // pool and there is none left.
        pool.current_mut().fpstate = core::ptr::null_mut();
        pool.allocate_fp(true);
    }

    #[test]
    fn saved_context_round_trip() {
        let mut pool = pool();
        pool.enter();
        pool.current_mut().pc = 0x4000;
        pool.current_mut().gpr[0] = 7;
        pool.current_mut().mark_valid();

        assert_eq!(pool.saved_context_push(), 1);
        pool.current_mut().pc = 0x9000;
        pool.current_mut().gpr[0] = 0;

        assert_eq!(pool.saved_context_pop(), 1);
        assert_eq!(pool.current().pc, 0x4000);
        assert_eq!(pool.current().gpr[0], 7);
        assert_eq!(pool.saved_depth(), 0);
    }

    #[test]
    #[should_panic(expected = "saved interrupt context pool exhausted")]
    fn saved_ceiling_is_fatal() {
        let mut pool = pool();
        for _ in 0..=MAX_IC {
            pool.saved_context_push();
        }
    }

    #[test]
    #[should_panic(expected = "no saved interrupt context")]
    fn saved_underflow_is_fatal() {
        let mut pool = pool();
        pool.saved_context_pop();
    }

    #[test]
    fn reset_rewinds_cursors() {
        let mut pool = pool();
        pool.enter();
        pool.allocate_fp(true);
        pool.saved_context_push();
        pool.reset();
        assert_eq!((pool.depth(), pool.saved_depth(), pool.fp_index()), (0, 0, 0));
    }
}
