//! Free-function entry points.
//!
//! Instrumented kernel code calls these without holding a processor
//! reference. The embedding kernel installs, once at boot, an accessor
//! returning the [`ProcessorState`] of the calling core and the shared
//! [`ThreadPool`].

use crate::cpu::{ProcessorState, ReinitFlags};
use crate::error::{fatal, Fatal, SvaResult};
use crate::invoke::{InvokeFn, InvokeStatus};
use crate::state::Word;
use crate::thread::{StackId, ThreadPool};
use spin::Once;

struct Runtime {
    processor: fn() -> &'static ProcessorState,
    threads: &'static ThreadPool,
}

static RUNTIME: Once<Runtime> = Once::new();

/// Install the runtime accessors. Returns `false` if they were already
/// installed; the first installation wins.
pub fn install_runtime(processor: fn() -> &'static ProcessorState, threads: &'static ThreadPool) -> bool {
    let mut installed = false;
    RUNTIME.call_once(|| {
        installed = true;
        Runtime { processor, threads }
    });
    if !installed {
        log::warn!("runtime accessors already installed");
    }
    installed
}

fn runtime() -> &'static Runtime {
    match RUNTIME.get() {
        Some(runtime) => runtime,
        None => fatal(Fatal::NoRuntime),
    }
}

/// Processor state of the calling core.
pub fn processor() -> &'static ProcessorState {
    (runtime().processor)()
}

pub fn threads() -> &'static ThreadPool {
    runtime().threads
}

pub fn invoke(arg1: Word, arg2: Word, arg3: Word, result: &mut Word, f: InvokeFn) -> InvokeStatus {
    processor().invoke(arg1, arg2, arg3, result, f)
}

pub fn iunwind() -> ! {
    processor().iunwind()
}

/// # Safety
///
/// See [`crate::invoke::InvokeChain::invoke_strncpy`].
pub unsafe fn invoke_strncpy(dst: &mut [u8], src: *const u8, count: usize) -> SvaResult<usize> {
    unsafe { processor().invoke_strncpy(dst, src, count) }
}

pub fn was_privileged() -> bool {
    processor().was_privileged()
}

pub fn icontext_get_pc() -> Word {
    processor().icontext_get_pc()
}

/// # Safety
///
/// See [`ProcessorState::ialloca`].
pub unsafe fn ialloca(size: usize, align: usize, init: Option<&[u8]>) -> SvaResult<*mut u8> {
    unsafe { processor().ialloca(size, align, init) }
}

pub fn reinit_icontext(target: Word, flags: ReinitFlags, a1: Word, a2: Word) -> SvaResult<()> {
    processor().reinit_icontext(target, flags, a1, a2)
}

pub fn register_push_targets(targets: &[Word]) -> SvaResult<()> {
    processor().register_push_targets(targets)
}

/// # Safety
///
/// See [`ProcessorState::push_function`].
pub unsafe fn push_function(target: Word, args: [Word; 5]) -> SvaResult<Word> {
    unsafe { processor().push_function(target, args) }
}

pub fn init_stack(stack: *mut u8, length: usize, f: Word, a1: Word, a2: Word, a3: Word) -> SvaResult<StackId> {
    threads().init_stack(processor(), stack, length, f, a1, a2, a3)
}

pub fn swap_integer(new: StackId, prev: &mut StackId) -> SvaResult<StackId> {
    threads().swap_integer(processor(), new, prev)
}

pub fn release_stack(id: StackId) -> SvaResult<()> {
    threads().release_stack(processor(), id)
}
