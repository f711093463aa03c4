#![no_std]

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod arch;
pub mod cfi;
pub mod config;
pub mod cpu;
pub mod error;
pub mod icontext;
pub mod intrinsics;
pub mod invoke;
pub mod state;
pub mod thread;

pub use arch::{Arch, DefaultArch, InterruptGuard};
pub use cfi::{PushFn, PushTargets};
pub use cpu::{ProcessorState, ReinitFlags};
pub use error::{Fatal, SvaError, SvaResult};
pub use icontext::InterruptContextPool;
pub use invoke::{InvokeChain, InvokeFn, InvokeStatus, Unwound};
pub use state::{FpState, IContext, IntegerState, InvokeFrame, Word};
pub use thread::{StackId, ThreadPool, ThreadState};
