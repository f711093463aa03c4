//! Per-processor state.
//!
//! One [`ProcessorState`] exists per core. It names the thread running on
//! the core, publishes the interrupt context the trap layer is currently
//! working on, owns the core's invoke chain and tracks whether the FPU was
//! touched since the last switch.
//!
//! Fields are only written by the owning core, with traps masked. The
//! atomics make those writes visible to trap handlers on the same core.

use crate::arch::{Arch, DefaultArch, InterruptGuard};
use crate::cfi;
use crate::error::{SvaError, SvaResult};
use crate::invoke::{InvokeChain, InvokeFn, InvokeStatus};
use crate::state::{mode, IContext, Word};
use crate::thread::{StackId, ThreadState};
use bitflags::bitflags;
use portable_atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

bitflags! {
    /// Options for [`ProcessorState::reinit_icontext`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ReinitFlags: u32 {
        /// Resume in supervisor mode instead of user mode.
        const PRIVILEGED = 1 << 0;
        /// Do not restore the FP registers saved for this context.
        const DISCARD_FP = 1 << 1;
    }
}

#[repr(C)]
pub struct ProcessorState {
    current_thread: AtomicPtr<ThreadState>,
    /// Address of the hardware task-state record.
    tssp: AtomicUsize,
    new_current_ic: AtomicPtr<IContext>,
    invoke_chain: InvokeChain,
    fp_used: AtomicBool,
    /// Thread switched out whose registers may still be in flight.
    switched_out: AtomicPtr<ThreadState>,
}

impl Default for ProcessorState {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessorState {
    pub const fn new() -> Self {
        Self {
            current_thread: AtomicPtr::new(core::ptr::null_mut()),
            tssp: AtomicUsize::new(0),
            new_current_ic: AtomicPtr::new(core::ptr::null_mut()),
            invoke_chain: InvokeChain::new(),
            fp_used: AtomicBool::new(false),
            switched_out: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    pub fn current_thread(&self) -> *mut ThreadState {
        self.current_thread.load(Ordering::Acquire)
    }

    pub fn current_id(&self) -> StackId {
        match unsafe { self.current_thread().as_ref() } {
            Some(ts) => ts.id(),
            None => StackId::NONE,
        }
    }

    /// Interrupt context the trap layer is currently operating on.
    pub fn new_current_ic(&self) -> *mut IContext {
        self.new_current_ic.load(Ordering::Acquire)
    }

    pub(crate) fn publish(&self, thread: *mut ThreadState, ic: *mut IContext) {
        self.current_thread.store(thread, Ordering::Release);
        self.new_current_ic.store(ic, Ordering::Release);
    }

    pub(crate) fn set_switched_out(&self, thread: *mut ThreadState) {
        self.switched_out.store(thread, Ordering::Release);
    }

    /// Drop the running mark of the thread this processor last switched
    /// away from. Its registers are saved by the time this runs.
    pub(crate) fn finish_switch(&self) {
        let outgoing = self.switched_out.swap(core::ptr::null_mut(), Ordering::AcqRel);
        if let Some(ts) = unsafe { outgoing.as_ref() } {
            ts.clear_running();
        }
    }

    pub fn tssp(&self) -> Word {
        self.tssp.load(Ordering::Acquire)
    }

    pub fn set_tssp(&self, tssp: Word) {
        self.tssp.store(tssp, Ordering::Release);
    }

    pub fn invoke_chain(&self) -> &InvokeChain {
        &self.invoke_chain
    }

    pub fn fp_used(&self) -> bool {
        self.fp_used.load(Ordering::Acquire)
    }

    /// Called from the FPU-access trap.
    pub fn mark_fp_used(&self) {
        self.fp_used.store(true, Ordering::Release);
    }

    pub(crate) fn take_fp_used(&self) -> bool {
        self.fp_used.swap(false, Ordering::AcqRel)
    }

    #[allow(clippy::mut_from_ref)]
    fn running(&self) -> SvaResult<&mut ThreadState> {
        unsafe { self.current_thread().as_mut() }.ok_or(SvaError::NoCurrentThread)
    }

    /// Run `f` on the published context with traps masked.
    fn with_current_ic<R>(&self, f: impl FnOnce(&mut IContext) -> R) -> SvaResult<R> {
        let _guard = InterruptGuard::<DefaultArch>::new();
        self.running()?;
        let ic = unsafe { self.new_current_ic().as_mut() }.ok_or(SvaError::NoCurrentThread)?;
        Ok(f(ic))
    }

    /// Reserve an interrupt context for a trap taken by the running thread
    /// and publish it.
    pub fn trap_enter(&self) -> SvaResult<usize> {
        let _guard = InterruptGuard::<DefaultArch>::new();
        self.finish_switch();
        let contexts = self.running()?.interrupt_contexts_mut();
        let index = contexts.enter();
        self.new_current_ic.store(contexts.current_mut(), Ordering::Release);
        Ok(index)
    }

    /// Release the context reserved by the matching
    /// [`trap_enter`](Self::trap_enter) and publish the one below it.
    pub fn trap_leave(&self, index: usize) -> SvaResult<()> {
        let _guard = InterruptGuard::<DefaultArch>::new();
        let contexts = self.running()?.interrupt_contexts_mut();
        contexts.leave(index);
        self.new_current_ic.store(contexts.current_mut(), Ordering::Release);
        Ok(())
    }

    /// Lazily save the FP registers for the published context.
    pub fn allocate_fp(&self) -> SvaResult<Option<usize>> {
        let _guard = InterruptGuard::<DefaultArch>::new();
        let fp_used = self.fp_used();
        Ok(self.running()?.interrupt_contexts_mut().allocate_fp(fp_used))
    }

    pub fn saved_context_push(&self) -> SvaResult<usize> {
        Ok(self.running()?.interrupt_contexts_mut().saved_context_push())
    }

    pub fn saved_context_pop(&self) -> SvaResult<usize> {
        Ok(self.running()?.interrupt_contexts_mut().saved_context_pop())
    }

    /// Run `f(arg1, arg2, arg3)` as a protected call on this processor.
    pub fn invoke(&self, arg1: Word, arg2: Word, arg3: Word, result: &mut Word, f: InvokeFn) -> InvokeStatus {
        self.invoke_chain.invoke(arg1, arg2, arg3, result, f)
    }

    /// Abandon the innermost protected call on this processor.
    pub fn iunwind(&self) -> ! {
        self.invoke_chain.unwind()
    }

    /// # Safety
    ///
    /// See [`InvokeChain::invoke_strncpy`].
    pub unsafe fn invoke_strncpy(&self, dst: &mut [u8], src: *const u8, count: usize) -> SvaResult<usize> {
        unsafe { self.invoke_chain.invoke_strncpy(dst, src, count) }
    }

    /// Whether the published interrupt context was taken from a privileged
    /// mode. With nothing published the kernel itself is running.
    pub fn was_privileged(&self) -> bool {
        match unsafe { self.new_current_ic().as_ref() } {
            Some(ic) if ic.is_valid() => mode::is_privileged(DefaultArch::read_saved_mode_bits(ic)),
            _ => true,
        }
    }

    /// Program counter of the published interrupt context, or 0.
    pub fn icontext_get_pc(&self) -> Word {
        match unsafe { self.new_current_ic().as_ref() } {
            Some(ic) => ic.pc,
            None => 0,
        }
    }

    /// Carve `size` bytes off the interrupted user stack, aligned to
    /// `align`, and copy `init` into them. Returns the new stack pointer.
    ///
    /// # Safety
    ///
    /// The stack pointer of the published context must reference writable
    /// memory with at least `size + align` bytes below it.
    pub unsafe fn ialloca(&self, size: usize, align: usize, init: Option<&[u8]>) -> SvaResult<*mut u8> {
        if !align.is_power_of_two() {
            return Err(SvaError::InvalidAlignment(align));
        }
        self.with_current_ic(|ic| {
            if !ic.is_valid() || mode::is_privileged(DefaultArch::read_saved_mode_bits(ic)) {
                return Err(SvaError::PrivilegedContext);
            }

            let sp = ic.sp.checked_sub(size).ok_or(SvaError::StackOverflow)? & !(align - 1);
            if let Some(init) = init {
                let len = init.len().min(size);
                unsafe { core::ptr::copy_nonoverlapping(init.as_ptr(), sp as *mut u8, len) };
            }
            ic.sp = sp;
            Ok(sp as *mut u8)
        })?
    }

    /// Redirect the published context to `target` with stack `a1` and
    /// first argument `a2`. Other saved registers are left alone.
    pub fn reinit_icontext(&self, target: Word, flags: ReinitFlags, a1: Word, a2: Word) -> SvaResult<()> {
        let resume_mode = if flags.contains(ReinitFlags::PRIVILEGED) {
            mode::SUPERVISOR
        } else {
            mode::USER
        };
        self.with_current_ic(|ic| {
            ic.pc = target;
            ic.sp = a1;
            ic.gpr[0] = a2;
            ic.lr = 0;
            ic.spsr = mode::with_mode(ic.spsr, resume_mode);
            if flags.contains(ReinitFlags::DISCARD_FP) {
                if let Some(fp) = unsafe { ic.fpstate.as_mut() } {
                    fp.present = 0;
                }
            }
        })?;
        log::debug!("reinit_icontext: pc {:#x} sp {:#x} flags {:?}", target, a1, flags);
        Ok(())
    }

    /// Replace the running thread's push-target whitelist.
    pub fn register_push_targets(&self, targets: &[Word]) -> SvaResult<()> {
        self.running()?.register_push_targets(targets)
    }

    /// Call `target(args..)` as a protected call if the running thread
    /// whitelisted it.
    ///
    /// # Safety
    ///
    /// Every registered target must be a [`cfi::PushFn`].
    pub unsafe fn push_function(&self, target: Word, args: [Word; 5]) -> SvaResult<Word> {
        let targets = *self.running()?.push_targets();
        unsafe { cfi::call_whitelisted(&self.invoke_chain, &targets, target, args) }
    }
}
