// Stackless task kernel
// Single core, no preemption. A task runs until its routine suspends or
// terminates, then control returns to the scheduler loop.

pub mod coro;
pub mod frame;
pub mod queue;
pub mod scheduler;
pub mod tasks;
pub mod wake;

pub use coro::{Context, Step, from_fn};
pub use frame::{BEGIN, FINALLY, Point, Routine};
pub use scheduler::{Config, Runtime};
pub use tasks::{Status, Task, TaskId, TaskPool};
pub use wake::{Alarm, SoftTimer, TimerDriver, TimerError, TimerId};
