// Runtime error type and the integer codes stored on tasks
//
// Requesting calls return Error synchronously. When a routine's await
// fails the code from Error::errno() is recorded on the task, so the
// enclosing frames can inspect it after unwinding.

use alloc::boxed::Box;
use core::fmt;

use crate::kernel::wake::TimerError;

// POSIX values, kept here so the core builds without libc
pub mod errno {
    pub const EBADF: i32 = 9;
    pub const ENOMEM: i32 = 12;
    pub const EBUSY: i32 = 16;
    pub const EEXIST: i32 = 17;
    pub const ENODEV: i32 = 19;
    pub const EAGAIN: i32 = 11;
    pub const EPROTO: i32 = 71;
    pub const ETIME: i32 = 62;
    pub const ESRCH: i32 = 3;
    pub const EIO: i32 = 5;
    pub const ECANCELED: i32 = 125;
}

#[derive(Debug)]
pub enum Error {
    /// Every slot of the task pool is in use
    PoolExhausted,
    /// Stale or foreign task handle
    NoSuchTask,
    /// Task already has a root frame
    TaskBusy,
    /// Descriptor is registered to another task (or re-monitor rejected)
    AlreadyMonitored { fd: i32 },
    /// Negative descriptor or one past the monitor's capacity
    BadDescriptor { fd: i32 },
    NoSuchModule,
    /// Module has no fdmon capability
    NotFdmon,
    /// No timer driver attached to the runtime
    NoTimer,
    /// Task already has an outstanding sleep timer
    TimerBusy,
    Timer(TimerError),
    /// Readiness poll failed with this OS error
    Poll(i32),
    /// Suspending primitive used with an invalid resume point or state
    Protocol,
    /// A module hook failed during an iteration
    Module { index: usize, source: Box<Error> },
}

impl Error {
    pub fn errno(&self) -> i32 {
        match self {
            Error::PoolExhausted => errno::ENOMEM,
            Error::NoSuchTask => errno::ESRCH,
            Error::TaskBusy => errno::EBUSY,
            Error::AlreadyMonitored { .. } => errno::EEXIST,
            Error::BadDescriptor { .. } => errno::EBADF,
            Error::NoSuchModule | Error::NotFdmon => errno::ENODEV,
            Error::NoTimer => errno::ENODEV,
            Error::TimerBusy => errno::EBUSY,
            Error::Timer(_) => errno::ETIME,
            Error::Poll(e) => *e,
            Error::Protocol => errno::EPROTO,
            Error::Module { source, .. } => source.errno(),
        }
    }
}

impl From<TimerError> for Error {
    fn from(e: TimerError) -> Self {
        Error::Timer(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::PoolExhausted => write!(f, "task pool exhausted"),
            Error::NoSuchTask => write!(f, "no such task"),
            Error::TaskBusy => write!(f, "task already started"),
            Error::AlreadyMonitored { fd } => write!(f, "fd {} already monitored", fd),
            Error::BadDescriptor { fd } => write!(f, "bad descriptor {}", fd),
            Error::NoSuchModule => write!(f, "no such module"),
            Error::NotFdmon => write!(f, "module is not an fd monitor"),
            Error::NoTimer => write!(f, "no timer driver"),
            Error::TimerBusy => write!(f, "sleep timer already outstanding"),
            Error::Timer(e) => write!(f, "timer: {}", e),
            Error::Poll(e) => write!(f, "poll failed, errno {}", e),
            Error::Protocol => write!(f, "coroutine protocol misuse"),
            Error::Module { index, source } => write!(f, "module #{}: {}", index, source),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;
