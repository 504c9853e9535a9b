// Control-flow protocol for stackless routines
//
// A routine is re-entered from the top on every dispatch and matches on
// cx.point() to continue where it left off. Locals that must survive a
// suspension live in the routine value itself. Suspending primitives
// store the resume point, arrange the wake-up, set the task status and
// hand back a Step, which the routine returns right away:
//
//     match cx.point() {
//         BEGIN => cx.wait_fd(1, fdmon, fd, Events::IN),
//         1 => { /* readable */ cx.ret() }
//         _ => cx.finally(),
//     }
//
// Errors are stored on the task, not on the frame, so a caller resumed
// after cx.call() sees what its callee threw.

use alloc::boxed::Box;

use log::{debug, warn};

use super::frame::{BEGIN, FINALLY, FrameArena, FrameId, Point, Routine};
use super::tasks::{Status, Task, TaskId};
use super::wake::{self, TimerDriver};
use crate::error::{Error, Result, errno};
use crate::fdmon::{Events, RawFd};
use crate::module::{ModuleId, ModuleTable};

/// Proof that a routine ended its invocation through a primitive.
#[must_use = "return the Step from the routine"]
pub struct Step(());

pub struct Context<'a> {
    pub(crate) id: TaskId,
    pub(crate) task: &'a mut Task,
    pub(crate) frame: FrameId,
    pub(crate) frames: &'a mut FrameArena,
    pub(crate) modules: &'a mut ModuleTable,
    pub(crate) timer: &'a mut Option<Box<dyn TimerDriver>>,
    // cleanup dispatch: no further suspension allowed
    pub(crate) unwinding: bool,
}

impl Context<'_> {
    #[inline]
    pub fn task(&self) -> TaskId {
        self.id
    }

    #[inline]
    pub fn status(&self) -> Status {
        self.task.status()
    }

    /// Resume point of the current frame (BEGIN on first entry).
    pub fn point(&self) -> Point {
        self.frames.point(self.frame).unwrap_or(FINALLY)
    }

    /// Ready events delivered by the last descriptor wake.
    pub fn revents(&self) -> Events {
        self.task.revents
    }

    pub fn error(&self) -> i32 {
        self.task.eno
    }

    pub fn has_error(&self) -> bool {
        self.task.eno != 0
    }

    pub fn is_error(&self, code: i32) -> bool {
        self.has_error() && self.task.eno == code
    }

    pub fn clear_error(&mut self) {
        self.task.eno = 0;
    }

    /// Suspend until `fd` is ready for one of `events` on the given
    /// fdmon module. Resumes at `at`.
    pub fn wait_fd(&mut self, at: Point, fdmon: ModuleId, fd: RawFd, events: Events) -> Step {
        if !self.suspend_at(at) {
            return Step(());
        }
        let id = self.id;
        let registered = self
            .modules
            .fdmon(fdmon)
            .and_then(|m| m.monitor(id, fd, events));
        match registered {
            Ok(()) => {
                self.task.waiting_fd = Some((fdmon, fd));
                self.task.revents = Events::empty();
                self.task.signal.set(Status::Waiting);
            }
            Err(e) => self.fail(e),
        }
        Step(())
    }

    /// Drop any registration for `fd`; does not suspend.
    pub fn forget(&mut self, fdmon: ModuleId, fd: RawFd) -> Result<()> {
        if self.task.waiting_fd == Some((fdmon, fd)) {
            self.task.waiting_fd = None;
        }
        self.modules.fdmon(fdmon)?.forget(fd)
    }

    /// Suspend for `us` microseconds on a one-shot timer. Resumes at `at`.
    pub fn sleep(&mut self, at: Point, us: u64) -> Step {
        if !self.suspend_at(at) {
            return Step(());
        }
        if let Err(e) = wake::arm(self.task, self.timer, us) {
            self.fail(e);
        }
        Step(())
    }

    /// Run `routine` as a nested call; the caller resumes at `at` once
    /// the callee's frame is gone.
    pub fn call<R: Routine + 'static>(&mut self, at: Point, routine: R) -> Step {
        if !self.suspend_at(at) {
            return Step(());
        }
        let child = self.frames.push(Some(self.frame), Box::new(routine));
        self.task.current = Some(child);
        debug!("coro: {} pushed frame {:?}", self.id, child);
        Step(())
    }

    pub fn throw(&mut self, code: i32) -> Step {
        self.task.eno = code;
        self.unwind()
    }

    pub fn ret(&mut self) -> Step {
        self.task.eno = 0;
        self.unwind()
    }

    pub fn rethrow(&mut self) -> Step {
        self.unwind()
    }

    /// Terminal point: the frame is done.
    pub fn finally(&mut self) -> Step {
        self.task.signal.set(Status::Terminated);
        Step(())
    }

    fn unwind(&mut self) -> Step {
        let next = if self.unwinding {
            Status::Terminated
        } else {
            Status::Terminating
        };
        self.task.signal.set(next);
        Step(())
    }

    fn suspend_at(&mut self, at: Point) -> bool {
        if self.unwinding {
            warn!("coro: {} tried to suspend during cleanup", self.id);
            if self.task.eno == 0 {
                self.task.eno = errno::EPROTO;
            }
            self.task.signal.set(Status::Terminated);
            return false;
        }
        if at == BEGIN || at == FINALLY {
            warn!("coro: {} used reserved resume point {}", self.id, at);
            self.fail(Error::Protocol);
            return false;
        }
        if let Some(frame) = self.frames.get_mut(self.frame) {
            frame.point = at;
        }
        true
    }

    fn fail(&mut self, e: Error) {
        debug!("coro: {} await failed: {}", self.id, e);
        self.task.eno = e.errno();
        self.task.signal.set(Status::Terminating);
    }
}

/// Routine backed by a closure, see `core::iter::from_fn`.
pub struct FnRoutine<F>(F);

pub fn from_fn<F>(f: F) -> FnRoutine<F>
where
    F: FnMut(&mut Context<'_>) -> Step,
{
    FnRoutine(f)
}

impl<F> Routine for FnRoutine<F>
where
    F: FnMut(&mut Context<'_>) -> Step,
{
    fn resume(&mut self, cx: &mut Context<'_>) -> Step {
        (self.0)(cx)
    }
}
