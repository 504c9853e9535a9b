// The runtime: task pool, frame arena, modules and the scheduler loop
//
// One iteration (run_once):
//   reap fired timers -> loopstart* -> tick*(timeout) -> loopend*
//   -> reap again -> dispatch every task that was runnable at that point
//
// Dispatch re-enters a task's innermost frame. After the call the task
// status says what happened: Waiting (parked), Running (a callee frame
// was pushed, runs next pass), Terminating (run the frame once more at
// FINALLY), Terminated (pop the frame; the caller resumes next pass, or
// the task is released when the chain is empty).

use alloc::boxed::Box;

use log::{debug, info, warn};

use super::coro::Context;
use super::frame::{FINALLY, FrameArena, Routine};
use super::tasks::{Status, Task, TaskId, TaskPool};
use super::wake::{self, TimerDriver};
use crate::error::{Error, Result, errno};
use crate::fdmon::{FdMonitor, RawFd};
use crate::module::{Module, ModuleId, ModuleTable};

/// Base poll period when nothing is runnable (the 10ms tick).
pub const IDLE_TIMEOUT_US: u32 = 10_000;
pub const DEFAULT_MAX_TASKS: usize = 8;

#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Task pool capacity, fixed for the runtime's lifetime.
    pub max_tasks: usize,
    /// Poll timeout when no task is runnable and no module asks for less.
    pub idle_timeout_us: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_tasks: DEFAULT_MAX_TASKS,
            idle_timeout_us: IDLE_TIMEOUT_US,
        }
    }
}

pub struct Runtime {
    config: Config,
    tasks: TaskPool,
    frames: FrameArena,
    modules: ModuleTable,
    timer: Option<Box<dyn TimerDriver>>,
}

impl Runtime {
    pub fn new(max_tasks: usize) -> Self {
        Self::with_config(Config {
            max_tasks,
            ..Config::default()
        })
    }

    pub fn with_config(config: Config) -> Self {
        info!(
            "uaio: runtime up, {} task slots, idle timeout {}us",
            config.max_tasks, config.idle_timeout_us
        );
        Self {
            config,
            tasks: TaskPool::with_capacity(config.max_tasks),
            frames: FrameArena::default(),
            modules: ModuleTable::default(),
            timer: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Attach the one-shot timer used by sleep. Timers of the previous
    /// driver are cancelled first.
    pub fn set_timer<T: TimerDriver + 'static>(&mut self, driver: T) {
        for i in 0..self.tasks.capacity() {
            if let Some(id) = self.tasks.id_at(i) {
                if let Some(task) = self.tasks.get_mut(id) {
                    wake::cancel(task, &mut self.timer);
                }
            }
        }
        self.timer = Some(Box::new(driver));
    }

    // ── tasks ───────────────────────────────────────────────────────────

    pub fn allocate(&mut self) -> Result<TaskId> {
        self.tasks.allocate()
    }

    /// Push the root frame of an Idle task and make it runnable.
    pub fn start<R: Routine + 'static>(&mut self, id: TaskId, routine: R) -> Result<()> {
        let task = self.tasks.get_mut(id).ok_or(Error::NoSuchTask)?;
        if task.current.is_some() || task.status() != Status::Idle {
            return Err(Error::TaskBusy);
        }
        task.current = Some(self.frames.push(None, Box::new(routine)));
        task.signal.set(Status::Running);
        self.tasks.schedule(id);
        debug!("uaio: started {}", id);
        Ok(())
    }

    pub fn spawn<R: Routine + 'static>(&mut self, routine: R) -> Result<TaskId> {
        let id = self.tasks.allocate()?;
        if let Err(e) = self.start(id, routine) {
            self.release(id);
            return Err(e);
        }
        Ok(id)
    }

    /// Release a task without running its cleanup: its registration and
    /// timer are cancelled and its frames dropped.
    pub fn dispose(&mut self, id: TaskId) -> Result<()> {
        if self.tasks.get(id).is_none() {
            return Err(Error::NoSuchTask);
        }
        self.cancel_waits(id);
        self.release(id);
        Ok(())
    }

    /// Tear down every live task. Pending waits are cancelled, then each
    /// frame gets a final FINALLY dispatch, innermost first.
    pub fn kill_all(&mut self) {
        let mut killed = 0;
        for i in 0..self.tasks.capacity() {
            let Some(id) = self.tasks.id_at(i) else {
                continue;
            };
            self.cancel_waits(id);
            self.unwind(id);
            self.release(id);
            killed += 1;
        }
        self.tasks.clear_runnable();
        if killed > 0 {
            info!("uaio: killed {} tasks", killed);
        }
    }

    pub fn status(&self, id: TaskId) -> Option<Status> {
        self.tasks.status(id)
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn live(&self) -> usize {
        self.tasks.live()
    }

    pub fn tasks(&self) -> &TaskPool {
        &self.tasks
    }

    /// Put a runnable task to sleep for `us` microseconds outside of a
    /// routine. Fails if it is already waiting on something.
    pub fn sleep(&mut self, id: TaskId, us: u64) -> Result<()> {
        let task = self.tasks.get_mut(id).ok_or(Error::NoSuchTask)?;
        if task.current.is_none() {
            return Err(Error::Protocol);
        }
        if task.timer.is_some() {
            return Err(Error::TimerBusy);
        }
        if task.status() != Status::Running || task.waiting_fd.is_some() {
            return Err(Error::TaskBusy);
        }
        let result = wake::arm(task, &mut self.timer, us);
        if result.is_ok() {
            self.tasks.remove_runnable(id);
        }
        result
    }

    // ── modules ─────────────────────────────────────────────────────────

    pub fn install<M: Module + 'static>(&mut self, module: M) -> ModuleId {
        let id = self.modules.install(Box::new(module));
        info!("uaio: module #{} installed", id.index());
        id
    }

    /// Remove a module; tasks still waiting on it are terminated with
    /// ECANCELED.
    pub fn uninstall(&mut self, id: ModuleId) -> Result<Box<dyn Module>> {
        let mut module = self.modules.uninstall(id).ok_or(Error::NoSuchModule)?;
        module.detach(&mut self.tasks);
        for i in 0..self.tasks.capacity() {
            if let Some(task) = self.tasks.id_at(i).and_then(|t| self.tasks.get_mut(t)) {
                if matches!(task.waiting_fd, Some((m, _)) if m == id) {
                    task.waiting_fd = None;
                }
            }
        }
        info!("uaio: module #{} uninstalled", id.index());
        Ok(module)
    }

    pub fn module(&mut self, id: ModuleId) -> Option<&mut (dyn Module + 'static)> {
        self.modules.get_mut(id)
    }

    pub fn fdmon(&mut self, id: ModuleId) -> Result<&mut dyn FdMonitor> {
        self.modules.fdmon(id)
    }

    pub fn forget(&mut self, fdmon: ModuleId, fd: RawFd) -> Result<()> {
        self.modules.fdmon(fdmon)?.forget(fd)
    }

    // ── loop ────────────────────────────────────────────────────────────

    /// One scheduler iteration. Module failures do not stop the
    /// iteration; the first one is reported once everything has run.
    pub fn run_once(&mut self) -> Result<()> {
        let mut failure = None;
        self.reap_alarms();
        self.modules.reset_failed();

        for i in 0..self.modules.slots() {
            if let Some(m) = self.modules.active(i) {
                if let Err(e) = m.loopstart(&mut self.tasks) {
                    self.hook_failed(i, "loopstart", e, &mut failure);
                }
            }
        }

        let timeout = self.timeout();
        for i in 0..self.modules.slots() {
            if let Some(m) = self.modules.active(i) {
                if let Err(e) = m.tick(&mut self.tasks, timeout) {
                    self.hook_failed(i, "tick", e, &mut failure);
                }
            }
        }

        for i in 0..self.modules.slots() {
            if let Some(m) = self.modules.active(i) {
                if let Err(e) = m.loopend(&mut self.tasks) {
                    self.hook_failed(i, "loopend", e, &mut failure);
                }
            }
        }

        if self.modules.is_empty() && timeout > 0 {
            wake::wait_for_interrupt();
        }

        self.reap_alarms();
        for _ in 0..self.tasks.runnable() {
            let Some(id) = self.tasks.next_runnable() else {
                break;
            };
            self.dispatch(id);
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Iterate until every started task has finished. Tasks that were
    /// allocated but never started do not keep the loop alive.
    pub fn run(&mut self) {
        while self.started() > 0 {
            if let Err(e) = self.run_once() {
                warn!("uaio: {}", e);
            }
        }
    }

    fn started(&self) -> usize {
        (0..self.tasks.capacity())
            .filter_map(|i| self.tasks.id_at(i).and_then(|id| self.tasks.get(id)))
            .filter(|t| t.status() != Status::Idle)
            .count()
    }

    fn hook_failed(&mut self, index: usize, hook: &str, e: Error, failure: &mut Option<Error>) {
        warn!("uaio: module #{} {} failed: {}", index, hook, e);
        self.modules.mark_failed(index);
        if failure.is_none() {
            *failure = Some(Error::Module {
                index,
                source: Box::new(e),
            });
        }
    }

    fn timeout(&self) -> u32 {
        if self.tasks.runnable() > 0 || self.alarm_pending() {
            return 0;
        }
        let idle = self.config.idle_timeout_us;
        self.modules.timeout_hint().map_or(idle, |t| t.min(idle))
    }

    fn alarm_pending(&self) -> bool {
        (0..self.tasks.capacity())
            .filter_map(|i| self.tasks.id_at(i).and_then(|id| self.tasks.get(id)))
            .any(|t| t.has_timer() && t.signal.fired())
    }

    fn reap_alarms(&mut self) {
        for i in 0..self.tasks.capacity() {
            let Some(id) = self.tasks.id_at(i) else {
                continue;
            };
            let Some(task) = self.tasks.get_mut(id) else {
                continue;
            };
            if wake::reap(task, &mut self.timer) && task.status() == Status::Running {
                debug!("uaio: {} woke from sleep", id);
                self.tasks.schedule(id);
            }
        }
    }

    fn dispatch(&mut self, id: TaskId) {
        let Some(task) = self.tasks.get_mut(id) else {
            return;
        };
        let status = task.status();
        // stale queue entry
        if !matches!(status, Status::Running | Status::Terminating) {
            return;
        }
        // woken by something other than its descriptor
        let stale = task.waiting_fd.take();
        forget_owned(&mut self.modules, id, stale);
        if status == Status::Running {
            self.invoke(id, false);
        }

        let Some(status) = self.tasks.status(id) else {
            return;
        };
        match status {
            Status::Waiting => {}
            Status::Running => self.tasks.schedule(id),
            Status::Terminating => {
                self.invoke(id, true);
                self.pop_frame(id);
            }
            Status::Terminated => self.pop_frame(id),
            Status::Idle => {}
        }
    }

    // run the innermost frame once
    fn invoke(&mut self, id: TaskId, unwinding: bool) {
        let Some(task) = self.tasks.get_mut(id) else {
            return;
        };
        let Some(frame) = task.current else {
            task.signal.set(Status::Terminated);
            return;
        };
        if unwinding {
            if let Some(f) = self.frames.get_mut(frame) {
                f.point = FINALLY;
            }
        }
        let Some(mut routine) = self.frames.take_routine(frame) else {
            warn!("uaio: {} frame {:?} re-entered", id, frame);
            task.signal.set(Status::Terminated);
            return;
        };

        let mut cx = Context {
            id,
            task,
            frame,
            frames: &mut self.frames,
            modules: &mut self.modules,
            timer: &mut self.timer,
            unwinding,
        };
        let _ = routine.resume(&mut cx);
        self.frames.put_routine(frame, routine);

        if unwinding {
            if let Some(task) = self.tasks.get_mut(id) {
                if task.status() != Status::Terminated {
                    task.signal.set(Status::Terminated);
                }
            }
        }
    }

    // drop the innermost frame; resume the caller or release the task
    fn pop_frame(&mut self, id: TaskId) {
        let Some(task) = self.tasks.get_mut(id) else {
            return;
        };
        let Some(frame) = task.current else {
            self.release(id);
            return;
        };
        match self.frames.pop(frame) {
            Some(parent) => {
                debug!("uaio: {} returned to frame {:?}", id, parent);
                task.current = Some(parent);
                task.signal.set(Status::Running);
                self.tasks.schedule(id);
            }
            None => {
                task.current = None;
                debug!("uaio: {} terminated, errno {}", id, task.eno);
                self.release(id);
            }
        }
    }

    // cleanup dispatch for every frame of a task, innermost first
    fn unwind(&mut self, id: TaskId) {
        loop {
            let Some(task) = self.tasks.get_mut(id) else {
                return;
            };
            let Some(frame) = task.current else {
                task.signal.set(Status::Terminated);
                return;
            };
            if task.eno == 0 {
                task.eno = errno::ECANCELED;
            }
            task.signal.set(Status::Terminating);
            self.invoke(id, true);

            let Some(task) = self.tasks.get_mut(id) else {
                return;
            };
            // anything the cleanup pass armed is cancelled too
            wake::cancel(task, &mut self.timer);
            task.current = self.frames.pop(frame);
        }
    }

    fn cancel_waits(&mut self, id: TaskId) {
        let Some(task) = self.tasks.get_mut(id) else {
            return;
        };
        forget_owned(&mut self.modules, id, task.waiting_fd.take());
        wake::cancel(task, &mut self.timer);
    }

    fn release(&mut self, id: TaskId) {
        let Some(mut task) = self.tasks.release(id) else {
            return;
        };
        forget_owned(&mut self.modules, id, task.waiting_fd.take());
        wake::cancel(&mut task, &mut self.timer);
        let mut frame = task.current.take();
        while let Some(f) = frame {
            frame = self.frames.pop(f);
        }
    }
}

// drop the task's fd registration if the monitor still holds it for this task
fn forget_owned(modules: &mut ModuleTable, id: TaskId, waiting: Option<(ModuleId, RawFd)>) {
    let Some((module, fd)) = waiting else {
        return;
    };
    let Ok(m) = modules.fdmon(module) else {
        return;
    };
    if m.registration(fd).is_some_and(|r| r.task == id) {
        if let Err(e) = m.forget(fd) {
            warn!("uaio: {} forget fd {}: {}", id, fd, e);
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.kill_all();
        info!("uaio: runtime down");
    }
}
