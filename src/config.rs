//! Compile-time capacities.
//!
//! Every pool in this crate is a fixed array sized by one of these constants.
//! Nothing grows at runtime; running out is either a reported error (thread
//! slots) or a fatal stop (interrupt contexts, FP slots, invoke frames).

/// Deepest interrupt-context nesting a thread may reach.
pub const MAX_IC: usize = 32;

/// Number of interrupt-context slots per thread, including the base slot 0.
pub const IC_SLOTS: usize = MAX_IC + 1;

/// Capacity of a thread's control-flow whitelist.
pub const MAX_PUSH_TARGETS: usize = 16;

/// Deepest protected-call nesting on one processor.
pub const MAX_INVOKE_DEPTH: usize = 32;

/// Default thread-pool size.
pub const MAX_THREADS: usize = 64;

/// Smallest stack region `init_stack` accepts.
pub const MIN_STACK_SIZE: usize = 256;

/// Alignment of the initial stack pointer handed to a new thread.
pub const STACK_ALIGN: usize = 16;

/// Size of the opaque floating-point save area.
pub const FP_SAVE_BYTES: usize = 512;
