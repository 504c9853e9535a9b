// One-shot timers for sleep, and idling between events
//
// A sleeping task owns exactly one timer. The driver calls Alarm::fire
// from whatever context its timer runs on (ISR, timer thread). fire()
// only flips Waiting -> Running and marks the alarm; the scheduler then
// deletes the timer handle and queues the task on its next pass.

use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::RefCell;
use core::fmt;

use log::{debug, warn};

use super::tasks::{Status, Task, TaskSignal};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerError {
    Create,
    Start,
    Delete,
}

impl fmt::Display for TimerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerError::Create => write!(f, "create failed"),
            TimerError::Start => write!(f, "start failed"),
            TimerError::Delete => write!(f, "delete failed"),
        }
    }
}

/// Callback argument bound to one task for the duration of one sleep.
#[derive(Clone)]
pub struct Alarm(Arc<TaskSignal>);

impl Alarm {
    /// Timer expiry. Safe to call from interrupt context, and more than
    /// once; only the first call on an armed alarm has an effect.
    #[inline]
    pub fn fire(&self) {
        self.0.fire();
    }
}

/// Hardware one-shot timer contract.
pub trait TimerDriver {
    fn create(&mut self, alarm: Alarm) -> core::result::Result<TimerId, TimerError>;
    fn start_once(&mut self, id: TimerId, us: u64) -> core::result::Result<(), TimerError>;
    /// Release the handle; cancels it if it has not fired yet.
    fn delete(&mut self, id: TimerId) -> core::result::Result<(), TimerError>;
}

// bind a fresh one-shot timer to the task; status is Waiting on success
pub(crate) fn arm(
    task: &mut Task,
    driver: &mut Option<Box<dyn TimerDriver>>,
    us: u64,
) -> Result<()> {
    let driver = driver.as_deref_mut().ok_or(Error::NoTimer)?;
    if task.timer.is_some() {
        return Err(Error::TimerBusy);
    }

    task.signal.set(Status::Waiting);
    task.signal.arm();
    let id = match driver.create(Alarm(task.signal.clone())) {
        Ok(id) => id,
        Err(e) => {
            task.signal.disarm();
            return Err(e.into());
        }
    };
    if let Err(e) = driver.start_once(id, us) {
        task.signal.disarm();
        if let Err(d) = driver.delete(id) {
            warn!("wake: release timer {:?} after failed start: {}", id, d);
        }
        return Err(e.into());
    }
    task.timer = Some(id);
    debug!("wake: timer {:?} armed for {}us", id, us);
    Ok(())
}

// cancel whatever timer the task holds; best effort
pub(crate) fn cancel(task: &mut Task, driver: &mut Option<Box<dyn TimerDriver>>) {
    let Some(id) = task.timer.take() else {
        return;
    };
    task.signal.disarm();
    match driver.as_deref_mut() {
        Some(d) => {
            if let Err(e) = d.delete(id) {
                warn!("wake: cancel timer {:?}: {}", id, e);
            }
        }
        None => warn!("wake: timer {:?} outlived its driver", id),
    }
}

// release the handle of a fired timer; true if it had fired
pub(crate) fn reap(task: &mut Task, driver: &mut Option<Box<dyn TimerDriver>>) -> bool {
    if task.timer.is_none() || !task.signal.take_fired() {
        return false;
    }
    if let (Some(id), Some(d)) = (task.timer.take(), driver.as_deref_mut()) {
        if let Err(e) = d.delete(id) {
            warn!("wake: release timer {:?}: {}", id, e);
        }
    }
    true
}

#[inline]
pub fn wait_for_interrupt() {
    #[cfg(target_arch = "riscv32")]
    unsafe {
        core::arch::asm!("wfi", options(nomem, nostack));
    }

    #[cfg(all(not(target_arch = "riscv32"), feature = "std"))]
    {
        std::thread::yield_now();
    }

    #[cfg(all(not(target_arch = "riscv32"), not(feature = "std")))]
    {
        core::hint::spin_loop();
    }
}

// ═════════════════════════════════════════════════════════════════════════
// Software timer
// ═════════════════════════════════════════════════════════════════════════

struct SoftEntry {
    id: TimerId,
    alarm: Alarm,
    deadline: Option<u64>,
}

#[derive(Default)]
struct SoftInner {
    next_id: u32,
    now: u64,
    entries: Vec<SoftEntry>,
}

/// Timer driver with a manually advanced clock. Clones share state, so
/// one handle can go to the runtime while the caller keeps another.
#[derive(Clone, Default)]
pub struct SoftTimer {
    inner: Rc<RefCell<SoftInner>>,
}

impl SoftTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock forward and fire everything that came due, in
    /// deadline order. Returns the number of alarms fired.
    pub fn advance(&self, us: u64) -> usize {
        let mut inner = self.inner.borrow_mut();
        inner.now = inner.now.saturating_add(us);
        let now = inner.now;

        let mut due: Vec<(u64, usize)> = inner
            .entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.deadline.filter(|&d| d <= now).map(|d| (d, i)))
            .collect();
        due.sort_unstable();
        for &(_, i) in &due {
            let entry = &mut inner.entries[i];
            entry.deadline = None;
            entry.alarm.fire();
        }
        due.len()
    }

    pub fn now(&self) -> u64 {
        self.inner.borrow().now
    }

    /// Handles created and not yet deleted.
    pub fn outstanding(&self) -> usize {
        self.inner.borrow().entries.len()
    }
}

impl TimerDriver for SoftTimer {
    fn create(&mut self, alarm: Alarm) -> core::result::Result<TimerId, TimerError> {
        let mut inner = self.inner.borrow_mut();
        let id = TimerId(inner.next_id);
        inner.next_id = inner.next_id.wrapping_add(1);
        inner.entries.push(SoftEntry {
            id,
            alarm,
            deadline: None,
        });
        Ok(id)
    }

    fn start_once(&mut self, id: TimerId, us: u64) -> core::result::Result<(), TimerError> {
        let mut inner = self.inner.borrow_mut();
        let now = inner.now;
        let entry = inner
            .entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(TimerError::Start)?;
        entry.deadline = Some(now.saturating_add(us));
        Ok(())
    }

    fn delete(&mut self, id: TimerId) -> core::result::Result<(), TimerError> {
        let mut inner = self.inner.borrow_mut();
        let pos = inner
            .entries
            .iter()
            .position(|e| e.id == id)
            .ok_or(TimerError::Delete)?;
        inner.entries.swap_remove(pos);
        Ok(())
    }
}

// ═════════════════════════════════════════════════════════════════════════
// Thread timer (hosted builds)
// ═════════════════════════════════════════════════════════════════════════

#[cfg(feature = "std")]
pub use self::thread::ThreadTimer;

#[cfg(feature = "std")]
mod thread {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use std::vec::Vec;

    use super::{Alarm, TimerDriver, TimerError, TimerId};

    struct Armed {
        alarm: Alarm,
        cancelled: AtomicBool,
    }

    /// One OS thread per started timer; the alarm fires from that thread.
    #[derive(Default)]
    pub struct ThreadTimer {
        next_id: u32,
        entries: Vec<(TimerId, Arc<Armed>)>,
    }

    impl ThreadTimer {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl TimerDriver for ThreadTimer {
        fn create(&mut self, alarm: Alarm) -> Result<TimerId, TimerError> {
            let id = TimerId(self.next_id);
            self.next_id = self.next_id.wrapping_add(1);
            let armed = Arc::new(Armed {
                alarm,
                cancelled: AtomicBool::new(false),
            });
            self.entries.push((id, armed));
            Ok(id)
        }

        fn start_once(&mut self, id: TimerId, us: u64) -> Result<(), TimerError> {
            let armed = self
                .entries
                .iter()
                .find(|(i, _)| *i == id)
                .map(|(_, a)| a.clone())
                .ok_or(TimerError::Start)?;
            std::thread::Builder::new()
                .name("uaio-timer".into())
                .spawn(move || {
                    std::thread::sleep(Duration::from_micros(us));
                    if !armed.cancelled.load(Ordering::Acquire) {
                        armed.alarm.fire();
                    }
                })
                .map(|_| ())
                .map_err(|_| TimerError::Start)
        }

        fn delete(&mut self, id: TimerId) -> Result<(), TimerError> {
            let pos = self
                .entries
                .iter()
                .position(|(i, _)| *i == id)
                .ok_or(TimerError::Delete)?;
            let (_, armed) = self.entries.swap_remove(pos);
            armed.cancelled.store(true, Ordering::Release);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::tasks::TaskPool;

    fn driver(t: &SoftTimer) -> Option<Box<dyn TimerDriver>> {
        Some(Box::new(t.clone()))
    }

    #[test]
    fn sleep_round_trip_releases_the_timer() {
        let soft = SoftTimer::new();
        let mut drv = driver(&soft);
        let mut pool = TaskPool::with_capacity(1);
        let id = pool.allocate().unwrap();
        let task = pool.get_mut(id).unwrap();

        arm(task, &mut drv, 1000).unwrap();
        assert_eq!(task.status(), Status::Waiting);
        assert!(matches!(arm(task, &mut drv, 1000), Err(Error::TimerBusy)));

        assert_eq!(soft.advance(999), 0);
        assert_eq!(task.status(), Status::Waiting);
        assert_eq!(soft.advance(1), 1);
        assert_eq!(task.status(), Status::Running);
        assert_eq!(soft.outstanding(), 1);

        assert!(reap(task, &mut drv));
        assert!(!task.has_timer());
        assert_eq!(soft.outstanding(), 0);
        assert!(!reap(task, &mut drv));
    }

    #[test]
    fn cancelled_timer_never_wakes() {
        let soft = SoftTimer::new();
        let mut drv = driver(&soft);
        let mut pool = TaskPool::with_capacity(1);
        let id = pool.allocate().unwrap();
        let task = pool.get_mut(id).unwrap();

        arm(task, &mut drv, 10).unwrap();
        cancel(task, &mut drv);
        assert_eq!(soft.outstanding(), 0);
        assert_eq!(soft.advance(100), 0);
        assert_eq!(task.status(), Status::Waiting);
    }

    #[test]
    fn arming_without_driver_fails() {
        let mut drv: Option<Box<dyn TimerDriver>> = None;
        let mut pool = TaskPool::with_capacity(1);
        let id = pool.allocate().unwrap();
        let task = pool.get_mut(id).unwrap();
        assert!(matches!(arm(task, &mut drv, 10), Err(Error::NoTimer)));
        assert_eq!(task.status(), Status::Idle);
    }

    struct Refusing;

    impl TimerDriver for Refusing {
        fn create(&mut self, _: Alarm) -> core::result::Result<TimerId, TimerError> {
            Err(TimerError::Create)
        }
        fn start_once(&mut self, _: TimerId, _: u64) -> core::result::Result<(), TimerError> {
            Err(TimerError::Start)
        }
        fn delete(&mut self, _: TimerId) -> core::result::Result<(), TimerError> {
            Ok(())
        }
    }

    // creates fine, then refuses to start or delete
    struct Stuck;

    impl TimerDriver for Stuck {
        fn create(&mut self, _: Alarm) -> core::result::Result<TimerId, TimerError> {
            Ok(TimerId(7))
        }
        fn start_once(&mut self, _: TimerId, _: u64) -> core::result::Result<(), TimerError> {
            Err(TimerError::Start)
        }
        fn delete(&mut self, _: TimerId) -> core::result::Result<(), TimerError> {
            Err(TimerError::Delete)
        }
    }

    #[test]
    fn start_failure_reports_start_even_if_delete_fails() {
        let mut drv: Option<Box<dyn TimerDriver>> = Some(Box::new(Stuck));
        let mut pool = TaskPool::with_capacity(1);
        let id = pool.allocate().unwrap();
        let task = pool.get_mut(id).unwrap();
        assert!(matches!(
            arm(task, &mut drv, 10),
            Err(Error::Timer(TimerError::Start))
        ));
        assert!(!task.has_timer());
        task.signal.fire();
        assert!(!task.signal.fired());
    }

    #[test]
    fn create_failure_leaves_no_timer() {
        let mut drv: Option<Box<dyn TimerDriver>> = Some(Box::new(Refusing));
        let mut pool = TaskPool::with_capacity(1);
        let id = pool.allocate().unwrap();
        let task = pool.get_mut(id).unwrap();
        assert!(matches!(
            arm(task, &mut drv, 10),
            Err(Error::Timer(TimerError::Create))
        ));
        assert!(!task.has_timer());
    }
}
