//! Push-target whitelist.
//!
//! A thread may only redirect control into functions it registered up
//! front. Anything else is refused before the call is made.

use crate::config::MAX_PUSH_TARGETS;
use crate::error::{SvaError, SvaResult};
use crate::invoke::{InvokeChain, Unwound};
use crate::state::Word;

/// Signature of a whitelisted push target.
pub type PushFn = extern "C-unwind" fn(Word, Word, Word, Word, Word) -> Word;

/// Fixed-capacity set of permitted indirect-call targets.
#[derive(Debug, Clone, Copy)]
pub struct PushTargets {
    targets: [Word; MAX_PUSH_TARGETS],
    count: usize,
}

impl Default for PushTargets {
    fn default() -> Self {
        Self::new()
    }
}

impl PushTargets {
    pub const fn new() -> Self {
        Self {
            targets: [0; MAX_PUSH_TARGETS],
            count: 0,
        }
    }

    /// Replace the whitelist with `targets`. On error the old whitelist is
    /// kept.
    pub fn register(&mut self, targets: &[Word]) -> SvaResult<()> {
        if targets.len() > MAX_PUSH_TARGETS {
            return Err(SvaError::TooManyPushTargets {
                requested: targets.len(),
                capacity: MAX_PUSH_TARGETS,
            });
        }
        if targets.contains(&0) {
            return Err(SvaError::IntegrityViolation { target: 0 });
        }

        self.targets = [0; MAX_PUSH_TARGETS];
        self.targets[..targets.len()].copy_from_slice(targets);
        self.count = targets.len();
        log::debug!("registered {} push targets", self.count);
        Ok(())
    }

    pub fn contains(&self, target: Word) -> bool {
        target != 0 && self.as_slice().contains(&target)
    }

    pub fn as_slice(&self) -> &[Word] {
        &self.targets[..self.count]
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn clear(&mut self) {
        self.targets = [0; MAX_PUSH_TARGETS];
        self.count = 0;
    }
}

/// Call `target` as a protected call if `targets` permits it.
///
/// # Safety
///
/// Every address registered in `targets` must be a function with the
/// [`PushFn`] signature.
pub unsafe fn call_whitelisted(
    chain: &InvokeChain,
    targets: &PushTargets,
    target: Word,
    args: [Word; 5],
) -> SvaResult<Word> {
    if !targets.contains(target) {
        log::warn!("refused push to {:#x}: not whitelisted", target);
        return Err(SvaError::IntegrityViolation { target });
    }

    let f = unsafe { core::mem::transmute::<Word, PushFn>(target) };
    chain
        .protect(|| f(args[0], args[1], args[2], args[3], args[4]))
        .map_err(|Unwound| SvaError::CallFaulted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec;

    extern "C-unwind" fn weighted(a: Word, b: Word, c: Word, d: Word, e: Word) -> Word {
        a + 2 * b + 3 * c + 4 * d + 5 * e
    }

    extern "C-unwind" fn never_listed(_: Word, _: Word, _: Word, _: Word, _: Word) -> Word {
        panic!("called a target that was not whitelisted")
    }

    extern "C-unwind" fn faults(chain: Word, _: Word, _: Word, _: Word, _: Word) -> Word {
        unsafe { &*(chain as *const InvokeChain) }.unwind()
    }

    #[test]
    fn register_replaces_previous_targets() {
        let mut targets = PushTargets::new();
        targets.register(&[0x1000, 0x2000]).unwrap();
        assert_eq!(targets.len(), 2);
        targets.register(&[0x3000]).unwrap();
        assert_eq!(targets.as_slice(), &[0x3000]);
        assert!(!targets.contains(0x1000));
    }

    #[test]
    fn overfull_registration_keeps_old_whitelist() {
        let mut targets = PushTargets::new();
        targets.register(&[0x1000]).unwrap();

        let too_many: Vec<Word> = (1..=MAX_PUSH_TARGETS + 1).map(|i| i * 0x100).collect();
        assert_eq!(
            targets.register(&too_many),
            Err(SvaError::TooManyPushTargets {
                requested: MAX_PUSH_TARGETS + 1,
                capacity: MAX_PUSH_TARGETS,
            })
        );
        assert_eq!(targets.as_slice(), &[0x1000]);

        let exactly: Vec<Word> = (1..=MAX_PUSH_TARGETS).map(|i| i * 0x100).collect();
        targets.register(&exactly).unwrap();
        assert_eq!(targets.len(), MAX_PUSH_TARGETS);
    }

    #[test]
    fn null_target_is_never_whitelisted() {
        let mut targets = PushTargets::new();
        assert!(targets.register(&[0x1000, 0]).is_err());
        assert!(targets.is_empty());
        assert!(!targets.contains(0));
    }

    #[test]
    fn whitelisted_target_is_called() {
        let chain = InvokeChain::new();
        let mut targets = PushTargets::new();
        targets.register(&[weighted as PushFn as Word]).unwrap();

        let value = unsafe { call_whitelisted(&chain, &targets, weighted as PushFn as Word, [1, 1, 1, 1, 1]) };
        assert_eq!(value, Ok(15));
        assert!(chain.is_empty());
    }

    #[test]
    fn unlisted_target_is_refused_without_calling() {
        let chain = InvokeChain::new();
        let mut targets = PushTargets::new();
        targets.register(&[weighted as PushFn as Word]).unwrap();

        let target = never_listed as PushFn as Word;
        let result = unsafe { call_whitelisted(&chain, &targets, target, [0; 5]) };
        assert_eq!(result, Err(SvaError::IntegrityViolation { target }));
        assert!(chain.is_empty());
    }

    #[test]
    fn faulting_target_reports_call_faulted() {
        let chain = InvokeChain::new();
        let mut targets = PushTargets::new();
        targets.register(&[faults as PushFn as Word]).unwrap();

        let args = [&chain as *const InvokeChain as Word, 0, 0, 0, 0];
        let result = unsafe { call_whitelisted(&chain, &targets, faults as PushFn as Word, args) };
        assert_eq!(result, Err(SvaError::CallFaulted));
        assert!(chain.is_empty());
    }
}
