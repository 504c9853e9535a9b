// File-descriptor monitor capability
//
// A module that can park a task until a descriptor is ready. At most one
// waiter per descriptor; a wake consumes the registration.

use bitflags::bitflags;

use crate::error::Result;
use crate::kernel::tasks::TaskId;

pub type RawFd = core::ffi::c_int;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Events: u8 {
        const IN = 0x1;
        const ERR = 0x2;
        const OUT = 0x4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub task: TaskId,
    pub events: Events,
}

pub trait FdMonitor {
    /// Register `task` as the waiter for `events` on `fd`.
    fn monitor(&mut self, task: TaskId, fd: RawFd, events: Events) -> Result<()>;

    /// Drop any registration for `fd`. Idempotent.
    fn forget(&mut self, fd: RawFd) -> Result<()>;

    fn registration(&self, fd: RawFd) -> Option<Registration>;
}
