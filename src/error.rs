use crate::state::Word;
use thiserror::Error;

/// Recoverable failures. The operation that returns one has not changed any
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SvaError {
    #[error("indirect call target {target:#x} is not whitelisted")]
    IntegrityViolation { target: Word },
    #[error("{requested} push targets exceed the whitelist capacity of {capacity}")]
    TooManyPushTargets { requested: usize, capacity: usize },
    #[error("thread identifier {0:#x} does not name an in-use thread")]
    StaleHandle(Word),
    #[error("no free thread slot")]
    NoFreeThread,
    #[error("stack region is null or too small")]
    InvalidStack,
    #[error("thread is running on a processor")]
    ThreadRunning,
    #[error("no thread is scheduled on this processor")]
    NoCurrentThread,
    #[error("a protected call is in flight")]
    InvokeActive,
    #[error("fault during bounded string copy")]
    BoundedCopyFault,
    #[error("protected call was unwound by a fault")]
    CallFaulted,
    #[error("alignment {0} is not a power of two")]
    InvalidAlignment(usize),
    #[error("interrupt context was not taken from user mode")]
    PrivilegedContext,
    #[error("stack allocation would wrap the address space")]
    StackOverflow,
}

impl SvaError {
    pub fn as_str(self) -> &'static str {
        match self {
            SvaError::IntegrityViolation { .. } => "Call target is not whitelisted",
            SvaError::TooManyPushTargets { .. } => "Too many push targets",
            SvaError::StaleHandle(_) => "Stale thread identifier",
            SvaError::NoFreeThread => "No free thread slot",
            SvaError::InvalidStack => "Invalid stack region",
            SvaError::ThreadRunning => "Thread is currently running",
            SvaError::NoCurrentThread => "No current thread",
            SvaError::InvokeActive => "Protected call in flight",
            SvaError::BoundedCopyFault => "Fault during bounded copy",
            SvaError::CallFaulted => "Protected call faulted",
            SvaError::InvalidAlignment(_) => "Invalid alignment",
            SvaError::PrivilegedContext => "Interrupt context is privileged",
            SvaError::StackOverflow => "Stack allocation overflow",
        }
    }
}

pub type SvaResult<T> = Result<T, SvaError>;

/// Conditions that stop the processor. None of these can be handled: each
/// means a fixed ceiling was hit or a nesting contract with the trap layer
/// was broken, and continuing would corrupt saved state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Fatal {
    #[error("interrupt context pool exhausted")]
    InterruptContextExhausted,
    #[error("floating-point save slots exhausted")]
    FpStateExhausted,
    #[error("saved interrupt context pool exhausted")]
    SavedContextExhausted,
    #[error("no saved interrupt context to restore")]
    SavedContextUnderflow,
    #[error("invoke chain exhausted")]
    InvokeChainExhausted,
    #[error("unwind with an empty invoke chain")]
    UnwindUnderflow,
    #[error("nesting violation: expected index {expected}, found {found}")]
    NestingViolation { expected: usize, found: usize },
    #[error("architecture backend cannot unwind")]
    NoUnwindBackend,
    #[error("runtime accessors are not installed")]
    NoRuntime,
}

/// Fail-stop. Logs the condition and panics; the embedding kernel's panic
/// handler is responsible for halting the processor.
#[cold]
#[track_caller]
pub fn fatal(kind: Fatal) -> ! {
    log::error!("fatal: {}", kind);
    panic!("trapstate fatal: {}", kind)
}
