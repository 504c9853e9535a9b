// Task pool and task status
//
// The pool is a fixed array of slots sized at runtime creation. A
// TaskId carries the slot generation so handles to a released task go
// stale instead of aliasing the next occupant.
//
// Status lives in a TaskSignal shared with armed timers: a timer
// callback may run on an interrupt or alternate context and is only
// allowed to flip Waiting -> Running and mark its alarm fired. Every
// other transition happens on the scheduler's thread. A critical
// section guards the read-modify-write (riscv32imc has no atomic RMW).

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};

use log::{debug, warn};

use super::frame::FrameId;
use super::queue::RingQueue;
use super::wake::TimerId;
use crate::error::{Error, Result};
use crate::fdmon::{Events, RawFd};
use crate::module::ModuleId;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Idle = 1,
    Running = 2,
    Waiting = 4,
    Terminating = 8,
    Terminated = 16,
}

impl Status {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Status::Idle,
            2 => Status::Running,
            4 => Status::Waiting,
            8 => Status::Terminating,
            _ => Status::Terminated,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Idle => write!(f, "idle"),
            Status::Running => write!(f, "running"),
            Status::Waiting => write!(f, "waiting"),
            Status::Terminating => write!(f, "terminating"),
            Status::Terminated => write!(f, "terminated"),
        }
    }
}

const ALARM_NONE: u8 = 0;
const ALARM_ARMED: u8 = 1;
const ALARM_FIRED: u8 = 2;

pub struct TaskSignal {
    status: AtomicU8,
    alarm: AtomicU8,
}

impl TaskSignal {
    fn new() -> Self {
        Self {
            status: AtomicU8::new(Status::Idle as u8),
            alarm: AtomicU8::new(ALARM_NONE),
        }
    }

    #[inline]
    pub fn status(&self) -> Status {
        Status::from_raw(self.status.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set(&self, status: Status) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub(crate) fn arm(&self) {
        self.alarm.store(ALARM_ARMED, Ordering::Release);
    }

    pub(crate) fn disarm(&self) {
        critical_section::with(|_| self.alarm.store(ALARM_NONE, Ordering::Relaxed));
    }

    // timer context: the only write allowed outside the scheduler
    pub(crate) fn fire(&self) {
        critical_section::with(|_| {
            if self.alarm.load(Ordering::Relaxed) != ALARM_ARMED {
                return;
            }
            self.alarm.store(ALARM_FIRED, Ordering::Relaxed);
            if self.status.load(Ordering::Relaxed) == Status::Waiting as u8 {
                self.status.store(Status::Running as u8, Ordering::Relaxed);
            }
        });
    }

    pub(crate) fn fired(&self) -> bool {
        self.alarm.load(Ordering::Acquire) == ALARM_FIRED
    }

    pub(crate) fn take_fired(&self) -> bool {
        critical_section::with(|_| {
            let fired = self.alarm.load(Ordering::Relaxed) == ALARM_FIRED;
            if fired {
                self.alarm.store(ALARM_NONE, Ordering::Relaxed);
            }
            fired
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId {
    index: u32,
    generation: u32,
}

impl TaskId {
    pub const fn index(self) -> usize {
        self.index as usize
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}.{}", self.index, self.generation)
    }
}

pub struct Task {
    pub(crate) signal: Arc<TaskSignal>,
    // innermost frame; None until started and after the chain unwinds
    pub(crate) current: Option<FrameId>,
    pub(crate) eno: i32,
    pub(crate) timer: Option<TimerId>,
    pub(crate) waiting_fd: Option<(ModuleId, RawFd)>,
    pub(crate) revents: Events,
}

impl Task {
    fn new() -> Self {
        Self {
            signal: Arc::new(TaskSignal::new()),
            current: None,
            eno: 0,
            timer: None,
            waiting_fd: None,
            revents: Events::empty(),
        }
    }

    #[inline]
    pub fn status(&self) -> Status {
        self.signal.status()
    }

    #[inline]
    pub fn last_error(&self) -> i32 {
        self.eno
    }

    pub fn has_timer(&self) -> bool {
        self.timer.is_some()
    }
}

struct Slot {
    generation: u32,
    task: Option<Task>,
}

pub struct TaskPool {
    slots: Box<[Slot]>,
    runq: RingQueue<TaskId>,
    live: usize,
}

impl TaskPool {
    pub fn with_capacity(max_tasks: usize) -> Self {
        let mut slots = Vec::with_capacity(max_tasks);
        slots.resize_with(max_tasks, || Slot {
            generation: 0,
            task: None,
        });
        Self {
            slots: slots.into_boxed_slice(),
            runq: RingQueue::with_capacity(max_tasks),
            live: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn live(&self) -> usize {
        self.live
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        let slot = self.slots.get(id.index())?;
        if slot.generation != id.generation {
            return None;
        }
        slot.task.as_ref()
    }

    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        let slot = self.slots.get_mut(id.index())?;
        if slot.generation != id.generation {
            return None;
        }
        slot.task.as_mut()
    }

    pub fn status(&self, id: TaskId) -> Option<Status> {
        self.get(id).map(Task::status)
    }

    // handle of whatever occupies slot i
    pub fn id_at(&self, index: usize) -> Option<TaskId> {
        let slot = self.slots.get(index)?;
        slot.task.as_ref().map(|_| TaskId {
            index: index as u32,
            generation: slot.generation,
        })
    }

    pub(crate) fn allocate(&mut self) -> Result<TaskId> {
        let Some(index) = self.slots.iter().position(|s| s.task.is_none()) else {
            warn!("tasks: pool exhausted ({} slots)", self.slots.len());
            return Err(Error::PoolExhausted);
        };
        let slot = &mut self.slots[index];
        slot.task = Some(Task::new());
        self.live += 1;
        let id = TaskId {
            index: index as u32,
            generation: slot.generation,
        };
        debug!("tasks: allocated {}", id);
        Ok(id)
    }

    pub(crate) fn release(&mut self, id: TaskId) -> Option<Task> {
        let slot = self.slots.get_mut(id.index())?;
        if slot.generation != id.generation {
            return None;
        }
        let task = slot.task.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.live -= 1;
        self.runq.remove(&id);
        debug!("tasks: released {}", id);
        Some(task)
    }

    /// Wake a task waiting on a readiness event. Returns false when the
    /// task is gone or no longer waiting.
    pub fn wake(&mut self, id: TaskId, revents: Events) -> bool {
        let Some(task) = self.get_mut(id) else {
            return false;
        };
        if task.status() != Status::Waiting {
            return false;
        }
        task.revents = revents;
        task.signal.set(Status::Running);
        self.schedule(id);
        true
    }

    /// Force a waiter onto the error-terminating path. Its registration
    /// must already be dropped by the caller.
    pub fn terminate(&mut self, id: TaskId, code: i32) -> bool {
        let Some(task) = self.get_mut(id) else {
            return false;
        };
        match task.status() {
            Status::Terminating | Status::Terminated => return false,
            _ => {}
        }
        task.eno = code;
        task.waiting_fd = None;
        task.signal.set(Status::Terminating);
        self.schedule(id);
        true
    }

    pub(crate) fn schedule(&mut self, id: TaskId) {
        // capacity == pool size and entries are unique, so this cannot fill
        if self.runq.push_unique(id).is_err() {
            warn!("tasks: run queue full, dropping {}", id);
        }
    }

    pub(crate) fn next_runnable(&mut self) -> Option<TaskId> {
        self.runq.pop()
    }

    pub(crate) fn remove_runnable(&mut self, id: TaskId) {
        self.runq.remove(&id);
    }

    pub(crate) fn runnable(&self) -> usize {
        self.runq.len()
    }

    pub(crate) fn clear_runnable(&mut self) {
        self.runq.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhaustion_leaves_existing_tasks_alone() {
        let mut pool = TaskPool::with_capacity(2);
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert!(matches!(pool.allocate(), Err(Error::PoolExhausted)));
        assert_eq!(pool.status(a), Some(Status::Idle));
        assert_eq!(pool.status(b), Some(Status::Idle));
        assert_eq!(pool.live(), 2);
    }

    #[test]
    fn released_handle_goes_stale() {
        let mut pool = TaskPool::with_capacity(1);
        let a = pool.allocate().unwrap();
        assert!(pool.release(a).is_some());
        let b = pool.allocate().unwrap();
        assert_eq!(a.index(), b.index());
        assert_ne!(a, b);
        assert!(pool.get(a).is_none());
        assert!(pool.release(a).is_none());
    }

    #[test]
    fn wake_only_moves_waiting_tasks() {
        let mut pool = TaskPool::with_capacity(2);
        let a = pool.allocate().unwrap();
        assert!(!pool.wake(a, Events::IN));
        pool.get_mut(a).unwrap().signal.set(Status::Waiting);
        assert!(pool.wake(a, Events::IN));
        assert_eq!(pool.status(a), Some(Status::Running));
        assert_eq!(pool.get(a).unwrap().revents, Events::IN);
        assert!(!pool.wake(a, Events::IN));
        assert_eq!(pool.next_runnable(), Some(a));
        assert_eq!(pool.next_runnable(), None);
    }

    #[test]
    fn fire_ignores_disarmed_alarm() {
        let signal = TaskSignal::new();
        signal.set(Status::Waiting);
        signal.fire();
        assert_eq!(signal.status(), Status::Waiting);

        signal.arm();
        signal.fire();
        assert_eq!(signal.status(), Status::Running);
        assert!(signal.take_fired());
        assert!(!signal.take_fired());
    }

    #[test]
    fn fire_does_not_resurrect_a_terminating_task() {
        let signal = TaskSignal::new();
        signal.arm();
        signal.set(Status::Terminating);
        signal.fire();
        assert_eq!(signal.status(), Status::Terminating);
        assert!(signal.fired());
    }
}
