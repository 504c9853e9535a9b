// select(2)-style fd monitor
//
// Registrations are indexed by descriptor, so building the interest sets
// and delivering wakes both walk fds in ascending order. A wake removes
// the registration; the routine has to wait_fd again for the next event.
//
// The readiness primitive is behind the Readiness trait: SysSelect calls
// libc::select, tests substitute a scripted source.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use log::{debug, info};

use crate::error::{Error, Result, errno};
use crate::fdmon::{Events, FdMonitor, RawFd, Registration};
use crate::kernel::tasks::{TaskId, TaskPool};
use crate::module::Module;

/// Bitset over descriptors 0..len.
#[derive(Debug, Clone)]
pub struct FdSet {
    words: Vec<u64>,
}

impl FdSet {
    pub fn with_capacity(nfds: usize) -> Self {
        Self {
            words: vec![0; nfds.div_ceil(64)],
        }
    }

    pub fn insert(&mut self, fd: usize) {
        if let Some(w) = self.words.get_mut(fd / 64) {
            *w |= 1u64 << (fd % 64);
        }
    }

    pub fn remove(&mut self, fd: usize) {
        if let Some(w) = self.words.get_mut(fd / 64) {
            *w &= !(1u64 << (fd % 64));
        }
    }

    pub fn contains(&self, fd: usize) -> bool {
        self.words
            .get(fd / 64)
            .is_some_and(|&w| w & (1u64 << (fd % 64)) != 0)
    }

    pub fn clear(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &w)| {
            (0..64usize)
                .filter(move |&b| w & (1u64 << b) != 0)
                .map(move |b| i * 64 + b)
        })
    }
}

/// Interest on the way in, readiness on the way out.
#[derive(Debug, Clone)]
pub struct FdSets {
    pub read: FdSet,
    pub write: FdSet,
    pub error: FdSet,
}

impl FdSets {
    pub fn with_capacity(nfds: usize) -> Self {
        Self {
            read: FdSet::with_capacity(nfds),
            write: FdSet::with_capacity(nfds),
            error: FdSet::with_capacity(nfds),
        }
    }

    pub fn clear(&mut self) {
        self.read.clear();
        self.write.clear();
        self.error.clear();
    }

    fn ready(&self, fd: usize) -> Events {
        let mut ev = Events::empty();
        if self.read.contains(fd) {
            ev |= Events::IN;
        }
        if self.error.contains(fd) {
            ev |= Events::ERR;
        }
        if self.write.contains(fd) {
            ev |= Events::OUT;
        }
        ev
    }
}

/// Blocking-with-timeout readiness primitive. On return the sets hold
/// only the ready descriptors; the result is how many are ready.
pub trait Readiness {
    fn wait(&mut self, sets: &mut FdSets, nfds: usize, timeout_us: u32) -> Result<usize>;
}

/// What monitor() does when the same task registers an fd again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SameTaskPolicy {
    /// New interest replaces the old one.
    #[default]
    Replace,
    /// New interest is added to the old one.
    Merge,
    /// Second registration fails like a foreign one.
    Reject,
}

#[derive(Debug, Clone, Copy)]
pub struct SelectConfig {
    /// Largest descriptor + 1.
    pub maxfileno: usize,
    pub policy: SameTaskPolicy,
}

impl SelectConfig {
    pub const fn new(maxfileno: usize) -> Self {
        Self {
            maxfileno,
            policy: SameTaskPolicy::Replace,
        }
    }

    pub const fn policy(mut self, policy: SameTaskPolicy) -> Self {
        self.policy = policy;
        self
    }
}

pub struct Select<R> {
    policy: SameTaskPolicy,
    waiters: Box<[Option<Registration>]>,
    sets: FdSets,
    count: usize,
    poller: R,
}

#[cfg(feature = "select")]
impl Select<SysSelect> {
    pub fn new(maxfileno: usize) -> Self {
        Self::with_config(SelectConfig::new(maxfileno))
    }

    pub fn with_config(config: SelectConfig) -> Self {
        let config = SelectConfig {
            maxfileno: config.maxfileno.min(libc::FD_SETSIZE as usize),
            ..config
        };
        Self::with_poller(config, SysSelect)
    }
}

impl<R: Readiness> Select<R> {
    pub fn with_poller(config: SelectConfig, poller: R) -> Self {
        info!(
            "select: maxfileno {}, same-task policy {:?}",
            config.maxfileno, config.policy
        );
        Self {
            policy: config.policy,
            waiters: vec![None; config.maxfileno].into_boxed_slice(),
            sets: FdSets::with_capacity(config.maxfileno),
            count: 0,
            poller,
        }
    }

    pub fn maxfileno(&self) -> usize {
        self.waiters.len()
    }

    /// Number of registered descriptors.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn poller(&self) -> &R {
        &self.poller
    }

    fn slot(&self, fd: RawFd) -> Result<usize> {
        match usize::try_from(fd) {
            Ok(i) if i < self.waiters.len() => Ok(i),
            _ => Err(Error::BadDescriptor { fd }),
        }
    }
}

impl<R: Readiness> FdMonitor for Select<R> {
    fn monitor(&mut self, task: TaskId, fd: RawFd, events: Events) -> Result<()> {
        let i = self.slot(fd)?;
        if events.is_empty() {
            return Err(Error::Protocol);
        }
        let events = match self.waiters[i] {
            None => {
                self.count += 1;
                events
            }
            Some(r) if r.task != task => return Err(Error::AlreadyMonitored { fd }),
            Some(r) => match self.policy {
                SameTaskPolicy::Replace => events,
                SameTaskPolicy::Merge => r.events | events,
                SameTaskPolicy::Reject => return Err(Error::AlreadyMonitored { fd }),
            },
        };
        self.waiters[i] = Some(Registration { task, events });
        debug!("select: {} waits on fd {} for {:?}", task, fd, events);
        Ok(())
    }

    fn forget(&mut self, fd: RawFd) -> Result<()> {
        let i = self.slot(fd)?;
        if self.waiters[i].take().is_some() {
            self.count -= 1;
            debug!("select: forgot fd {}", fd);
        }
        Ok(())
    }

    fn registration(&self, fd: RawFd) -> Option<Registration> {
        let i = self.slot(fd).ok()?;
        self.waiters[i]
    }
}

impl<R: Readiness> Module for Select<R> {
    fn tick(&mut self, tasks: &mut TaskPool, timeout_us: u32) -> Result<()> {
        self.sets.clear();
        let mut nfds = 0;
        for (fd, reg) in self.waiters.iter().enumerate() {
            let Some(reg) = reg else { continue };
            if reg.events.contains(Events::IN) {
                self.sets.read.insert(fd);
            }
            if reg.events.contains(Events::OUT) {
                self.sets.write.insert(fd);
            }
            if reg.events.contains(Events::ERR) {
                self.sets.error.insert(fd);
            }
            nfds = fd + 1;
        }

        let ready = self.poller.wait(&mut self.sets, nfds, timeout_us)?;
        if ready == 0 {
            return Ok(());
        }

        for fd in 0..nfds {
            let revents = self.sets.ready(fd);
            if revents.is_empty() {
                continue;
            }
            let Some(reg) = self.waiters[fd].take() else {
                continue;
            };
            self.count -= 1;
            if !tasks.wake(reg.task, revents) {
                debug!("select: fd {} ready but {} is not waiting", fd, reg.task);
            }
        }
        Ok(())
    }

    fn detach(&mut self, tasks: &mut TaskPool) {
        for reg in self.waiters.iter_mut() {
            if let Some(r) = reg.take() {
                tasks.terminate(r.task, errno::ECANCELED);
            }
        }
        self.count = 0;
    }

    fn as_fdmon(&mut self) -> Option<&mut dyn FdMonitor> {
        Some(self)
    }
}

#[cfg(feature = "select")]
pub use self::sys::SysSelect;

#[cfg(feature = "select")]
mod sys {
    use core::{mem, ptr};

    use super::{FdSet, FdSets, Readiness};
    use crate::error::{Error, Result};

    /// libc::select over the registered descriptors.
    pub struct SysSelect;

    fn to_libc(set: &FdSet) -> libc::fd_set {
        unsafe {
            let mut raw: libc::fd_set = mem::zeroed();
            libc::FD_ZERO(&mut raw);
            for fd in set.iter() {
                libc::FD_SET(fd as libc::c_int, &mut raw);
            }
            raw
        }
    }

    fn keep_ready(set: &mut FdSet, raw: &libc::fd_set, nfds: usize) {
        for fd in 0..nfds {
            if set.contains(fd) && !unsafe { libc::FD_ISSET(fd as libc::c_int, raw) } {
                set.remove(fd);
            }
        }
    }

    impl Readiness for SysSelect {
        fn wait(&mut self, sets: &mut FdSets, nfds: usize, timeout_us: u32) -> Result<usize> {
            // fd_set has no room past FD_SETSIZE; FD_SET would abort
            let limit = libc::FD_SETSIZE as usize;
            if nfds > limit {
                let fd = [&sets.read, &sets.write, &sets.error]
                    .iter()
                    .filter_map(|set| set.iter().find(|&fd| fd >= limit))
                    .min()
                    .unwrap_or(nfds - 1);
                sets.clear();
                return Err(Error::BadDescriptor { fd: fd as i32 });
            }
            let mut read = to_libc(&sets.read);
            let mut write = to_libc(&sets.write);
            let mut error = to_libc(&sets.error);
            let mut tv = libc::timeval {
                tv_sec: (timeout_us / 1_000_000) as libc::time_t,
                tv_usec: (timeout_us % 1_000_000) as libc::suseconds_t,
            };

            let n = unsafe {
                libc::select(
                    nfds as libc::c_int,
                    &mut read,
                    &mut write,
                    &mut error,
                    ptr::addr_of_mut!(tv),
                )
            };
            if n < 0 {
                let e = std::io::Error::last_os_error()
                    .raw_os_error()
                    .unwrap_or(libc::EIO);
                sets.clear();
                // a signal cut the wait short; nothing is ready
                if e == libc::EINTR {
                    return Ok(0);
                }
                return Err(Error::Poll(e));
            }

            keep_ready(&mut sets.read, &read, nfds);
            keep_ready(&mut sets.write, &write, nfds);
            keep_ready(&mut sets.error, &error, nfds);
            Ok(n as usize)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::tasks::Status;

    // reports the scripted fds ready for whatever interest they carry
    #[derive(Default)]
    struct Scripted {
        ready: Vec<usize>,
        polls: usize,
        last_nfds: usize,
    }

    impl Readiness for Scripted {
        fn wait(&mut self, sets: &mut FdSets, nfds: usize, _timeout_us: u32) -> Result<usize> {
            self.polls += 1;
            self.last_nfds = nfds;
            let mut n = 0;
            for set in [&mut sets.read, &mut sets.write, &mut sets.error] {
                let hits: Vec<usize> = set.iter().collect();
                for fd in hits {
                    if self.ready.contains(&fd) {
                        n += 1;
                    } else {
                        set.remove(fd);
                    }
                }
            }
            Ok(n)
        }
    }

    fn select(maxfileno: usize, ready: &[usize]) -> Select<Scripted> {
        let poller = Scripted {
            ready: ready.to_vec(),
            ..Default::default()
        };
        Select::with_poller(SelectConfig::new(maxfileno), poller)
    }

    fn waiting(pool: &mut TaskPool) -> TaskId {
        let id = pool.allocate().unwrap();
        pool.get_mut(id).unwrap().signal.set(Status::Waiting);
        id
    }

    #[test]
    fn second_task_cannot_take_a_monitored_fd() {
        let mut pool = TaskPool::with_capacity(2);
        let a = waiting(&mut pool);
        let b = waiting(&mut pool);
        let mut sel = select(16, &[]);

        sel.monitor(a, 3, Events::IN).unwrap();
        assert!(matches!(
            sel.monitor(b, 3, Events::OUT),
            Err(Error::AlreadyMonitored { fd: 3 })
        ));
        assert_eq!(
            sel.registration(3),
            Some(Registration {
                task: a,
                events: Events::IN
            })
        );
        assert_eq!(sel.len(), 1);
    }

    #[test]
    fn out_of_range_fds_are_rejected() {
        let mut pool = TaskPool::with_capacity(1);
        let a = waiting(&mut pool);
        let mut sel = select(8, &[]);
        assert!(matches!(
            sel.monitor(a, 8, Events::IN),
            Err(Error::BadDescriptor { fd: 8 })
        ));
        assert!(matches!(
            sel.monitor(a, -1, Events::IN),
            Err(Error::BadDescriptor { fd: -1 })
        ));
        assert!(matches!(sel.monitor(a, 1, Events::empty()), Err(Error::Protocol)));
        assert!(sel.is_empty());
    }

    #[test]
    fn same_task_policies() {
        let mut pool = TaskPool::with_capacity(1);
        let a = waiting(&mut pool);

        let mut replace = select(8, &[]);
        replace.monitor(a, 4, Events::IN).unwrap();
        replace.monitor(a, 4, Events::OUT).unwrap();
        assert_eq!(replace.registration(4).unwrap().events, Events::OUT);
        assert_eq!(replace.len(), 1);

        let mut merge = Select::with_poller(
            SelectConfig::new(8).policy(SameTaskPolicy::Merge),
            Scripted::default(),
        );
        merge.monitor(a, 4, Events::IN).unwrap();
        merge.monitor(a, 4, Events::OUT).unwrap();
        assert_eq!(merge.registration(4).unwrap().events, Events::IN | Events::OUT);
        assert_eq!(merge.len(), 1);

        let mut reject = Select::with_poller(
            SelectConfig::new(8).policy(SameTaskPolicy::Reject),
            Scripted::default(),
        );
        reject.monitor(a, 4, Events::IN).unwrap();
        assert!(reject.monitor(a, 4, Events::OUT).is_err());
        assert_eq!(reject.registration(4).unwrap().events, Events::IN);
    }

    #[test]
    fn wakes_in_ascending_fd_order() {
        let mut pool = TaskPool::with_capacity(3);
        let on5 = waiting(&mut pool);
        let on2 = waiting(&mut pool);
        let on9 = waiting(&mut pool);
        let mut sel = select(16, &[5, 2, 9]);
        sel.monitor(on5, 5, Events::IN).unwrap();
        sel.monitor(on2, 2, Events::IN).unwrap();
        sel.monitor(on9, 9, Events::IN).unwrap();

        sel.tick(&mut pool, 0).unwrap();
        assert_eq!(sel.poller().last_nfds, 10);
        assert_eq!(pool.next_runnable(), Some(on2));
        assert_eq!(pool.next_runnable(), Some(on5));
        assert_eq!(pool.next_runnable(), Some(on9));
        assert_eq!(pool.next_runnable(), None);
        assert!(sel.is_empty());
    }

    #[test]
    fn wake_consumes_the_registration() {
        let mut pool = TaskPool::with_capacity(1);
        let a = waiting(&mut pool);
        let mut sel = select(8, &[3]);
        sel.monitor(a, 3, Events::IN | Events::OUT).unwrap();

        sel.tick(&mut pool, 0).unwrap();
        assert_eq!(pool.status(a), Some(Status::Running));
        assert_eq!(pool.get(a).unwrap().revents, Events::IN | Events::OUT);
        assert_eq!(sel.registration(3), None);

        // still "readable", but nobody asked
        pool.get_mut(a).unwrap().signal.set(Status::Waiting);
        let _ = pool.next_runnable();
        sel.tick(&mut pool, 0).unwrap();
        assert_eq!(sel.poller().last_nfds, 0);
        assert_eq!(pool.status(a), Some(Status::Waiting));
        assert_eq!(pool.next_runnable(), None);
    }

    #[test]
    fn forget_is_idempotent() {
        let mut pool = TaskPool::with_capacity(1);
        let a = waiting(&mut pool);
        let mut sel = select(8, &[]);
        sel.monitor(a, 6, Events::ERR).unwrap();
        sel.forget(6).unwrap();
        sel.forget(6).unwrap();
        assert!(sel.is_empty());
        assert!(sel.registration(6).is_none());
    }

    #[test]
    fn detach_terminates_waiters() {
        let mut pool = TaskPool::with_capacity(2);
        let a = waiting(&mut pool);
        let b = waiting(&mut pool);
        let mut sel = select(8, &[]);
        sel.monitor(a, 1, Events::IN).unwrap();
        sel.monitor(b, 2, Events::OUT).unwrap();

        sel.detach(&mut pool);
        assert!(sel.is_empty());
        for id in [a, b] {
            assert_eq!(pool.status(id), Some(Status::Terminating));
            assert_eq!(pool.get(id).unwrap().last_error(), errno::ECANCELED);
        }
    }

    #[cfg(feature = "select")]
    #[test]
    fn sys_select_refuses_fds_past_fd_setsize() {
        let mut pool = TaskPool::with_capacity(1);
        let a = waiting(&mut pool);
        let mut sel = Select::with_poller(SelectConfig::new(4096), SysSelect);
        sel.monitor(a, 2000, Events::IN).unwrap();

        assert!(matches!(
            sel.tick(&mut pool, 0),
            Err(Error::BadDescriptor { fd: 2000 })
        ));
        assert_eq!(pool.status(a), Some(Status::Waiting));
    }

    #[test]
    fn fd_set_iterates_in_order() {
        let mut set = FdSet::with_capacity(130);
        for fd in [129, 0, 64, 63] {
            set.insert(fd);
        }
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 63, 64, 129]);
        set.remove(64);
        assert!(!set.contains(64));
        set.clear();
        assert!(set.is_empty());
    }
}
