// Cooperative, stackless task runtime for single-core targets
//
// Routines are plain state machines re-entered at a saved resume point;
// nested calls push frames onto a per-task chain instead of growing a
// native stack. Tasks suspend on descriptor readiness (fdmon modules,
// select backend) or on one-shot timers (sleep).

#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;

pub mod error;
pub mod fdmon;
#[cfg(feature = "select")]
pub mod io;
pub mod kernel;
pub mod module;
pub mod select;

pub use error::{Error, Result};
pub use fdmon::{Events, FdMonitor, RawFd, Registration};
pub use kernel::{
    BEGIN, Config, Context, FINALLY, Point, Routine, Runtime, SoftTimer, Status, Step, TaskId,
    TimerDriver, from_fn,
};
#[cfg(feature = "std")]
pub use kernel::wake::ThreadTimer;
pub use module::{Module, ModuleId};
pub use select::{Readiness, SameTaskPolicy, Select, SelectConfig};
