//! Thread state and lifecycle.
//!
//! A [`ThreadPool`] owns a fixed array of [`ThreadState`] slots. Creating a
//! thread claims a free slot and stamps it with a fresh reuse-detection
//! token; the returned [`StackId`] carries both the slot index and that
//! token, so a handle kept past `release_stack` or across reuse of the slot
//! no longer resolves.

use crate::arch::{Arch, DefaultArch, InterruptGuard};
use crate::cfi::PushTargets;
use crate::config::{MAX_THREADS, MIN_STACK_SIZE, STACK_ALIGN};
use crate::cpu::ProcessorState;
use crate::error::{SvaError, SvaResult};
use crate::icontext::InterruptContextPool;
use crate::state::{mode, IntegerState, Word};
use core::cell::UnsafeCell;
use core::ptr::NonNull;
use portable_atomic::{AtomicU64, AtomicUsize, Ordering};

/// Handle to a thread slot. Zero never names a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct StackId(Word);

impl StackId {
    /// Low bits of the id hold the slot index.
    pub const INDEX_BITS: u32 = 8;
    const INDEX_MASK: Word = (1 << Self::INDEX_BITS) - 1;
    const STAMP_BITS: u32 = Word::BITS - Self::INDEX_BITS;

    pub const NONE: StackId = StackId(0);

    fn new(index: usize, stamp: Word) -> Self {
        Self((stamp << Self::INDEX_BITS) | (index as Word & Self::INDEX_MASK))
    }

    pub const fn from_word(word: Word) -> Self {
        Self(word)
    }

    pub const fn as_word(self) -> Word {
        self.0
    }

    pub const fn index(self) -> usize {
        self.0 & Self::INDEX_MASK
    }

    pub const fn stamp(self) -> Word {
        self.0 >> Self::INDEX_BITS
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// Slot tag: the slot's current stamp above its status bits. Stamp and
/// status live in one atomic word so a reader never pairs the status of one
/// generation with the stamp of another.
mod tag {
    use super::StackId;
    use crate::state::Word;

    pub const FREE: Word = 0;
    /// Being initialised or released; resolves for nobody.
    pub const CLAIMED: Word = 1;
    pub const LIVE: Word = 2;
    /// Set while some processor has the thread installed.
    pub const RUNNING: Word = 1 << 2;
    const STATUS: Word = (1 << StackId::INDEX_BITS) - 1;

    pub const fn pack(stamp: Word, status: Word) -> Word {
        (stamp << StackId::INDEX_BITS) | status
    }

    pub const fn stamp(tag: Word) -> Word {
        tag >> StackId::INDEX_BITS
    }

    pub const fn status(tag: Word) -> Word {
        tag & STATUS
    }
}

/// Everything the runtime keeps for one thread.
#[repr(C, align(16))]
pub struct ThreadState {
    interrupt_contexts: InterruptContextPool,
    push_targets: PushTargets,
    /// Resting register file, used while the thread is switched out.
    pub integer_state: IntegerState,
    /// Bytes of isolated memory attached to the thread.
    pub secmem_size: usize,
    rid: AtomicUsize,
    tag: AtomicUsize,
}

impl Default for ThreadState {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadState {
    pub const fn new() -> Self {
        Self {
            interrupt_contexts: InterruptContextPool::new(),
            push_targets: PushTargets::new(),
            integer_state: IntegerState::new(),
            secmem_size: 0,
            rid: AtomicUsize::new(0),
            tag: AtomicUsize::new(tag::FREE),
        }
    }

    pub fn interrupt_contexts(&self) -> &InterruptContextPool {
        &self.interrupt_contexts
    }

    pub fn interrupt_contexts_mut(&mut self) -> &mut InterruptContextPool {
        &mut self.interrupt_contexts
    }

    pub fn push_targets(&self) -> &PushTargets {
        &self.push_targets
    }

    /// Replace the thread's push-target whitelist.
    pub fn register_push_targets(&mut self, targets: &[Word]) -> SvaResult<()> {
        self.push_targets.register(targets)
    }

    pub fn id(&self) -> StackId {
        StackId(self.rid.load(Ordering::Acquire))
    }

    pub fn is_used(&self) -> bool {
        tag::status(self.tag.load(Ordering::Acquire)) & tag::LIVE != 0
    }

    /// Installed on some processor.
    pub fn is_running(&self) -> bool {
        tag::status(self.tag.load(Ordering::Acquire)) & tag::RUNNING != 0
    }

    pub(crate) fn clear_running(&self) {
        self.tag.fetch_and(!tag::RUNNING, Ordering::AcqRel);
    }

    /// Wipe everything but the tag of a claimed slot.
    #[cfg(feature = "hardened")]
    unsafe fn scrub(this: *mut Self) {
        unsafe {
            (*this).interrupt_contexts.reset();
            (*this).push_targets.clear();
            (*this).integer_state = IntegerState::new();
            (*this).secmem_size = 0;
        }
    }
}

/// Fixed set of thread slots shared by every processor.
pub struct ThreadPool<const N: usize = MAX_THREADS> {
    slots: [UnsafeCell<ThreadState>; N],
    seed: AtomicU64,
}

// Slot ownership moves through the slot tag; the register state behind it
// is touched only by the owner, with traps masked.
unsafe impl<const N: usize> Sync for ThreadPool<N> {}

impl<const N: usize> Default for ThreadPool<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> ThreadPool<N> {
    /// Pool with a fixed stamp seed. Kernels should prefer
    /// [`ThreadPool::with_seed`] fed from an entropy source.
    pub const fn new() -> Self {
        Self::with_seed(0x5EED_0F_7A_CE_57A7)
    }

    pub const fn with_seed(seed: u64) -> Self {
        const { assert!(N > 0 && N <= 1 << StackId::INDEX_BITS) };
        Self {
            slots: [const { UnsafeCell::new(ThreadState::new()) }; N],
            seed: AtomicU64::new(seed),
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    fn slot(&self, index: usize) -> *mut ThreadState {
        self.slots[index].get()
    }

    /// Slot named by `id`, whatever its state.
    fn slot_of(&self, id: StackId) -> Option<*mut ThreadState> {
        (!id.is_none() && id.index() < N).then(|| self.slot(id.index()))
    }

    /// Next stamp for a slot whose previous stamp was `old`; never zero and
    /// never `old`.
    fn next_stamp(&self, old: Word) -> Word {
        const GAMMA: u64 = 0x9E37_79B9_7F4A_7C15;
        loop {
            let mut z = self.seed.fetch_add(GAMMA, Ordering::Relaxed).wrapping_add(GAMMA);
            z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
            z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
            z ^= z >> 31;

            let stamp = (z as Word) & (Word::MAX >> StackId::INDEX_BITS);
            if stamp != 0 && stamp != old {
                debug_assert!(stamp >> StackId::STAMP_BITS == 0);
                return stamp;
            }
        }
    }

    /// Claim the first free slot. Returns its index and the stamp it last
    /// carried. A claimed slot resolves for nobody until it is published.
    fn claim(&self) -> SvaResult<(usize, Word)> {
        for index in 0..N {
            let ts = unsafe { &*self.slot(index) };
            let current = ts.tag.load(Ordering::Acquire);
            if tag::status(current) != tag::FREE {
                continue;
            }
            let claimed = tag::pack(tag::stamp(current), tag::CLAIMED);
            if ts
                .tag
                .compare_exchange(current, claimed, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok((index, tag::stamp(current)));
            }
        }
        Err(SvaError::NoFreeThread)
    }

    /// Resolve `id` to its slot if the slot is live under the same stamp.
    pub fn lookup(&self, id: StackId) -> Option<NonNull<ThreadState>> {
        let ptr = self.slot_of(id)?;
        let current = unsafe { &*ptr }.tag.load(Ordering::Acquire);
        if current & !tag::RUNNING == tag::pack(id.stamp(), tag::LIVE) {
            NonNull::new(ptr)
        } else {
            None
        }
    }

    pub fn in_use(&self, id: StackId) -> bool {
        self.lookup(id).is_some()
    }

    /// Copy of the resting register file of `id`.
    pub fn integer_state(&self, id: StackId) -> SvaResult<IntegerState> {
        let ts = self.lookup(id).ok_or(SvaError::StaleHandle(id.as_word()))?;
        Ok(unsafe { ts.as_ref() }.integer_state)
    }

    /// Run `f` on the thread named by `id` with traps masked.
    pub fn with_thread_mut<R>(&self, id: StackId, f: impl FnOnce(&mut ThreadState) -> R) -> SvaResult<R> {
        let _guard = InterruptGuard::<DefaultArch>::new();
        let mut ts = self.lookup(id).ok_or(SvaError::StaleHandle(id.as_word()))?;
        Ok(f(unsafe { ts.as_mut() }))
    }

    /// Move `id` from live to live-and-running.
    fn mark_running(&self, id: StackId) -> SvaResult<()> {
        let ptr = self.slot_of(id).ok_or(SvaError::StaleHandle(id.as_word()))?;
        let live = tag::pack(id.stamp(), tag::LIVE);
        match unsafe { &*ptr }.tag.compare_exchange(
            live,
            live | tag::RUNNING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(found) if found == live | tag::RUNNING => Err(SvaError::ThreadRunning),
            Err(_) => Err(SvaError::StaleHandle(id.as_word())),
        }
    }

    /// Create a thread that starts at `f(a1, a2, a3)` on the stack region
    /// `[stack, stack + length)`.
    ///
    /// If `cpu` is running a thread, the new thread inherits that thread's
    /// active interrupt context as its base context and its push targets.
    pub fn init_stack(
        &self,
        cpu: &ProcessorState,
        stack: *mut u8,
        length: usize,
        f: Word,
        a1: Word,
        a2: Word,
        a3: Word,
    ) -> SvaResult<StackId> {
        if stack.is_null() || length < MIN_STACK_SIZE {
            return Err(SvaError::InvalidStack);
        }
        let top = (stack as Word)
            .checked_add(length)
            .ok_or(SvaError::InvalidStack)?
            & !(STACK_ALIGN - 1);

        let _guard = InterruptGuard::<DefaultArch>::new();

        let (index, old_stamp) = self.claim()?;
        let stamp = self.next_stamp(old_stamp);
        let id = StackId::new(index, stamp);

        // Readers may load the tag concurrently; only the fields below are
        // borrowed mutably.
        let ts = self.slot(index);
        let (contexts, targets, state) = unsafe {
            (*ts).secmem_size = 0;
            (
                &mut (*ts).interrupt_contexts,
                &mut (*ts).push_targets,
                &mut (*ts).integer_state,
            )
        };
        contexts.reset();
        targets.clear();

        // A fresh thread enters with lr = 0 and takes its status word from
        // spsr: supervisor mode, traps enabled.
        *state = IntegerState::new();
        state.pc = f;
        state.gpr[0] = a1;
        state.gpr[1] = a2;
        state.gpr[2] = a3;
        state.sp = top;
        state.kstackp = top;
        state.spsr = mode::SUPERVISOR;
        state.valid = 1;

        if let Some(parent) = NonNull::new(cpu.current_thread()) {
            let parent = unsafe { parent.as_ref() };
            let mut base = *parent.interrupt_contexts.current();
            base.fpstate = core::ptr::null_mut();
            *contexts.base_mut() = base;
            *targets = parent.push_targets;
        }

        let ts = unsafe { &*ts };
        ts.rid.store(id.as_word(), Ordering::Relaxed);
        ts.tag.store(tag::pack(stamp, tag::LIVE), Ordering::Release);

        log::debug!("init_stack: slot {} id {:#x} entry {:#x}", index, id.as_word(), f);
        Ok(id)
    }

    /// Switch `cpu` from its current thread to `new`. The id of the thread
    /// switched out (or [`StackId::NONE`]) is written to `prev` and returned.
    ///
    /// On hardware this returns only when some later switch resumes the
    /// outgoing thread.
    pub fn swap_integer(&self, cpu: &ProcessorState, new: StackId, prev: &mut StackId) -> SvaResult<StackId> {
        let _guard = InterruptGuard::<DefaultArch>::new();
        cpu.finish_switch();

        let mut next = self.lookup(new).ok_or_else(|| {
            log::warn!("swap_integer: stale id {:#x}", new.as_word());
            SvaError::StaleHandle(new.as_word())
        })?;
        if !cpu.invoke_chain().is_empty() {
            return Err(SvaError::InvokeActive);
        }

        let current = cpu.current_thread();
        if current == next.as_ptr() {
            *prev = new;
            return Ok(new);
        }
        self.mark_running(new)?;

        let mut bootstrap = IntegerState::new();
        let (old_id, prev_state) = match unsafe { current.as_mut() } {
            Some(outgoing) => {
                outgoing.integer_state.current_ic = outgoing.interrupt_contexts.depth();
                if cpu.take_fp_used() {
                    unsafe { DefaultArch::save_fp(&mut outgoing.integer_state.fpstate) };
                    outgoing.integer_state.fpstate.present = 1;
                }
                (outgoing.id(), &mut outgoing.integer_state as *mut IntegerState)
            }
            None => (StackId::NONE, &mut bootstrap as *mut IntegerState),
        };

        let incoming = unsafe { next.as_mut() };
        if incoming.integer_state.fpstate.is_present() {
            unsafe { DefaultArch::load_fp(&incoming.integer_state.fpstate) };
            incoming.integer_state.fpstate.present = 0;
        }
        // The outgoing thread stays marked running until its registers are
        // saved.
        cpu.set_switched_out(current);
        cpu.publish(next.as_ptr(), incoming.interrupt_contexts.current_mut());
        cpu.take_fp_used();
        *prev = old_id;

        log::debug!("swap_integer: {:#x} -> {:#x}", old_id.as_word(), new.as_word());
        unsafe { DefaultArch::switch_integer(prev_state, &incoming.integer_state) };
        cpu.finish_switch();
        Ok(old_id)
    }

    /// Mark `id` free. The stamp is kept so the handle stays stale until the
    /// slot is reused under a new stamp. A thread installed on any processor
    /// is refused.
    pub fn release_stack(&self, cpu: &ProcessorState, id: StackId) -> SvaResult<()> {
        let _guard = InterruptGuard::<DefaultArch>::new();
        cpu.finish_switch();

        let stale = || {
            log::warn!("release_stack: stale id {:#x}", id.as_word());
            SvaError::StaleHandle(id.as_word())
        };
        let ptr = self.slot_of(id).ok_or_else(stale)?;
        let live = tag::pack(id.stamp(), tag::LIVE);
        let claimed = tag::pack(id.stamp(), tag::CLAIMED);
        match unsafe { &*ptr }
            .tag
            .compare_exchange(live, claimed, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {}
            Err(found) if found == live | tag::RUNNING => return Err(SvaError::ThreadRunning),
            Err(_) => return Err(stale()),
        }

        #[cfg(feature = "hardened")]
        unsafe { ThreadState::scrub(ptr) };
        unsafe { &*ptr }
            .tag
            .store(tag::pack(id.stamp(), tag::FREE), Ordering::Release);

        log::debug!("release_stack: {:#x}", id.as_word());
        Ok(())
    }

    /// Install `id` as the running thread of `cpu` without switching. Used
    /// once per processor to adopt the boot context.
    pub fn adopt(&self, cpu: &ProcessorState, id: StackId) -> SvaResult<()> {
        let _guard = InterruptGuard::<DefaultArch>::new();
        cpu.finish_switch();

        let mut ts = self.lookup(id).ok_or(SvaError::StaleHandle(id.as_word()))?;
        let current = cpu.current_thread();
        if current == ts.as_ptr() {
            return Ok(());
        }
        self.mark_running(id)?;
        if let Some(previous) = unsafe { current.as_ref() } {
            previous.clear_running();
        }

        let ic = unsafe { ts.as_mut() }.interrupt_contexts.current_mut() as *mut _;
        cpu.publish(ts.as_ptr(), ic);
        log::debug!("adopt: {:#x}", id.as_word());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::boxed::Box;
    use std::vec;
    use std::vec::Vec;

    fn setup() -> (Box<ThreadPool<4>>, Box<ProcessorState>) {
        (Box::new(ThreadPool::new()), Box::new(ProcessorState::new()))
    }

    fn stack() -> Vec<u8> {
        vec![0u8; 4096]
    }

    #[test]
    fn init_stack_stages_entry_state() {
        let (pool, cpu) = setup();
        let mut region = stack();
        let base = region.as_mut_ptr();
        let id = pool.init_stack(&cpu, base, region.len(), 0x8000, 1, 2, 3).unwrap();

        assert!(!id.is_none());
        let state = pool.integer_state(id).unwrap();
        assert!(state.is_valid());
        assert_eq!(state.pc, 0x8000);
        assert_eq!(&state.gpr[..3], &[1, 2, 3]);
        assert_eq!(state.sp % STACK_ALIGN, 0);
        assert!(state.sp <= base as Word + region.len());
        assert!(state.sp > base as Word);
        assert_eq!(state.spsr & mode::MODE_MASK, mode::SUPERVISOR);
    }

    #[test]
    fn rejects_bad_regions() {
        let (pool, cpu) = setup();
        let mut region = stack();
        assert_eq!(
            pool.init_stack(&cpu, core::ptr::null_mut(), 4096, 0x8000, 0, 0, 0),
            Err(SvaError::InvalidStack)
        );
        assert_eq!(
            pool.init_stack(&cpu, region.as_mut_ptr(), MIN_STACK_SIZE - 1, 0x8000, 0, 0, 0),
            Err(SvaError::InvalidStack)
        );
    }

    #[test]
    fn pool_runs_out_of_slots() {
        let (pool, cpu) = setup();
        let mut regions: Vec<Vec<u8>> = (0..5).map(|_| stack()).collect();
        for region in regions.iter_mut().take(4) {
            pool.init_stack(&cpu, region.as_mut_ptr(), region.len(), 0x8000, 0, 0, 0)
                .unwrap();
        }
        let last = &mut regions[4];
        assert_eq!(
            pool.init_stack(&cpu, last.as_mut_ptr(), last.len(), 0x8000, 0, 0, 0),
            Err(SvaError::NoFreeThread)
        );
    }

    #[test]
    fn double_release_is_stale() {
        let (pool, cpu) = setup();
        let mut region = stack();
        let id = pool.init_stack(&cpu, region.as_mut_ptr(), region.len(), 0x8000, 0, 0, 0).unwrap();

        assert_eq!(pool.release_stack(&cpu, id), Ok(()));
        assert!(!pool.in_use(id));
        assert_eq!(pool.release_stack(&cpu, id), Err(SvaError::StaleHandle(id.as_word())));
    }

    #[test]
    fn reused_slot_gets_fresh_id() {
        let (pool, cpu) = setup();
        let mut region = stack();
        let old = pool.init_stack(&cpu, region.as_mut_ptr(), region.len(), 0x8000, 0, 0, 0).unwrap();
        pool.release_stack(&cpu, old).unwrap();

        let new = pool.init_stack(&cpu, region.as_mut_ptr(), region.len(), 0x9000, 0, 0, 0).unwrap();
        assert_eq!(new.index(), old.index());
        assert_ne!(new, old);
        assert!(pool.lookup(old).is_none());
        assert_eq!(pool.release_stack(&cpu, old), Err(SvaError::StaleHandle(old.as_word())));
        assert!(pool.in_use(new));
    }

    #[test]
    fn unknown_ids_do_not_resolve() {
        let (pool, _cpu) = setup();
        assert!(pool.lookup(StackId::NONE).is_none());
        assert!(pool.lookup(StackId::from_word(0xFFFF_FF03)).is_none());
        assert!(pool.lookup(StackId::from_word(0x100 | 200)).is_none());
    }

    #[test]
    fn swap_publishes_incoming_thread() {
        let (pool, cpu) = setup();
        let mut a_stack = stack();
        let mut b_stack = stack();
        let a = pool.init_stack(&cpu, a_stack.as_mut_ptr(), a_stack.len(), 0x8000, 0, 0, 0).unwrap();
        let b = pool.init_stack(&cpu, b_stack.as_mut_ptr(), b_stack.len(), 0x9000, 0, 0, 0).unwrap();

        let mut prev = StackId::from_word(0xDEAD);
        assert_eq!(pool.swap_integer(&cpu, a, &mut prev), Ok(StackId::NONE));
        assert_eq!(prev, StackId::NONE);
        assert_eq!(cpu.current_id(), a);

        assert_eq!(pool.swap_integer(&cpu, b, &mut prev), Ok(a));
        assert_eq!(prev, a);
        assert_eq!(cpu.current_id(), b);
        assert!(!cpu.new_current_ic().is_null());
    }

    #[test]
    fn swap_to_stale_id_changes_nothing() {
        let (pool, cpu) = setup();
        let mut region = stack();
        let id = pool.init_stack(&cpu, region.as_mut_ptr(), region.len(), 0x8000, 0, 0, 0).unwrap();
        pool.adopt(&cpu, id).unwrap();

        let mut prev = StackId::NONE;
        let stale = StackId::from_word(id.as_word() ^ (1 << StackId::INDEX_BITS));
        assert_eq!(
            pool.swap_integer(&cpu, stale, &mut prev),
            Err(SvaError::StaleHandle(stale.as_word()))
        );
        assert_eq!(cpu.current_id(), id);
        assert_eq!(prev, StackId::NONE);
    }

    #[test]
    fn swap_refused_inside_protected_call() {
        let (pool, cpu) = setup();
        let mut region = stack();
        let id = pool.init_stack(&cpu, region.as_mut_ptr(), region.len(), 0x8000, 0, 0, 0).unwrap();

        let mut prev = StackId::NONE;
        let result = cpu
            .invoke_chain()
            .protect(|| pool.swap_integer(&cpu, id, &mut prev))
            .unwrap();
        assert_eq!(result, Err(SvaError::InvokeActive));
        assert!(cpu.current_thread().is_null());
    }

    #[test]
    fn running_thread_cannot_be_released() {
        let (pool, cpu) = setup();
        let mut region = stack();
        let id = pool.init_stack(&cpu, region.as_mut_ptr(), region.len(), 0x8000, 0, 0, 0).unwrap();
        pool.adopt(&cpu, id).unwrap();

        assert_eq!(pool.release_stack(&cpu, id), Err(SvaError::ThreadRunning));
        assert!(pool.in_use(id));
    }

    #[test]
    fn thread_running_on_another_processor_is_refused() {
        let (pool, cpu0) = setup();
        let cpu1 = Box::new(ProcessorState::new());
        let mut a_stack = stack();
        let mut b_stack = stack();
        let a = pool.init_stack(&cpu0, a_stack.as_mut_ptr(), a_stack.len(), 0x8000, 0, 0, 0).unwrap();
        let b = pool.init_stack(&cpu0, b_stack.as_mut_ptr(), b_stack.len(), 0x9000, 0, 0, 0).unwrap();
        let mut prev = StackId::NONE;

        pool.adopt(&cpu0, a).unwrap();
        assert_eq!(pool.release_stack(&cpu1, a), Err(SvaError::ThreadRunning));
        assert_eq!(pool.swap_integer(&cpu1, a, &mut prev), Err(SvaError::ThreadRunning));
        assert_eq!(pool.adopt(&cpu1, a), Err(SvaError::ThreadRunning));
        assert!(cpu1.current_thread().is_null());
        assert!(pool.in_use(a));

        pool.swap_integer(&cpu0, b, &mut prev).unwrap();
        assert!(!pool.with_thread_mut(a, |ts| ts.is_running()).unwrap());
        assert_eq!(pool.swap_integer(&cpu1, a, &mut prev), Ok(StackId::NONE));
        assert_eq!(pool.release_stack(&cpu0, a), Err(SvaError::ThreadRunning));
        assert_eq!(pool.release_stack(&cpu1, b), Err(SvaError::ThreadRunning));
    }

    #[test]
    fn swap_round_trip_keeps_entry_state() {
        let (pool, cpu) = setup();
        let mut a_stack = stack();
        let mut b_stack = stack();
        let a = pool.init_stack(&cpu, a_stack.as_mut_ptr(), a_stack.len(), 0x8000, 0, 0, 0).unwrap();
        pool.adopt(&cpu, a).unwrap();
        let b = pool.init_stack(&cpu, b_stack.as_mut_ptr(), b_stack.len(), 0x9000, 7, 8, 9).unwrap();
        let mut prev = StackId::NONE;

        assert_eq!(pool.swap_integer(&cpu, b, &mut prev), Ok(a));
        assert_eq!(pool.swap_integer(&cpu, a, &mut prev), Ok(b));
        assert_eq!(pool.swap_integer(&cpu, b, &mut prev), Ok(a));

        let state = pool.integer_state(b).unwrap();
        assert!(state.is_valid());
        assert_eq!(state.pc, 0x9000);
        assert_eq!(&state.gpr[..3], &[7, 8, 9]);
        assert_eq!(cpu.current_id(), b);
    }

    #[test]
    fn fresh_thread_enters_with_traps_enabled() {
        let (pool, cpu) = setup();
        let mut region = stack();
        let id = pool.init_stack(&cpu, region.as_mut_ptr(), region.len(), 0x8000, 0, 0, 0).unwrap();

        let state = pool.integer_state(id).unwrap();
        assert_eq!(state.lr, 0);
        assert_eq!(state.spsr & (mode::IRQ_DISABLE | mode::FIQ_DISABLE), 0);
        assert_eq!(state.spsr & mode::MODE_MASK, mode::SUPERVISOR);
    }

    #[test]
    fn fp_state_saved_only_when_used() {
        let (pool, cpu) = setup();
        let mut a_stack = stack();
        let mut b_stack = stack();
        let a = pool.init_stack(&cpu, a_stack.as_mut_ptr(), a_stack.len(), 0x8000, 0, 0, 0).unwrap();
        let b = pool.init_stack(&cpu, b_stack.as_mut_ptr(), b_stack.len(), 0x9000, 0, 0, 0).unwrap();
        let mut prev = StackId::NONE;

        pool.adopt(&cpu, a).unwrap();
        pool.swap_integer(&cpu, b, &mut prev).unwrap();
        assert!(!pool.integer_state(a).unwrap().fpstate.is_present());

        cpu.mark_fp_used();
        pool.swap_integer(&cpu, a, &mut prev).unwrap();
        assert!(!cpu.fp_used());
        assert!(pool.integer_state(b).unwrap().fpstate.is_present());
    }

    #[test]
    fn child_inherits_parent_context_and_targets() {
        let (pool, cpu) = setup();
        let mut parent_stack = stack();
        let mut child_stack = stack();
        let parent = pool
            .init_stack(&cpu, parent_stack.as_mut_ptr(), parent_stack.len(), 0x8000, 0, 0, 0)
            .unwrap();
        pool.with_thread_mut(parent, |ts| {
            ts.register_push_targets(&[0x4000, 0x5000]).unwrap();
            let ic = ts.interrupt_contexts_mut().base_mut();
            ic.pc = 0x1234;
            ic.spsr = mode::USER;
            ic.mark_valid();
        })
        .unwrap();
        pool.adopt(&cpu, parent).unwrap();

        let child = pool
            .init_stack(&cpu, child_stack.as_mut_ptr(), child_stack.len(), 0x9000, 0, 0, 0)
            .unwrap();
        pool.with_thread_mut(child, |ts| {
            let base = ts.interrupt_contexts().current();
            assert!(base.is_valid());
            assert_eq!(base.pc, 0x1234);
            assert_eq!(ts.push_targets().as_slice(), &[0x4000, 0x5000]);
        })
        .unwrap();
    }
}
