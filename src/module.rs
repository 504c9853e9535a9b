// Pluggable scheduler modules
//
// Each iteration the runtime calls loopstart on every installed module,
// then tick(timeout), then loopend. A failing hook only takes that one
// module out of the rest of the iteration.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::error::{Error, Result};
use crate::fdmon::FdMonitor;
use crate::kernel::tasks::TaskPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleId(usize);

impl ModuleId {
    pub const fn index(self) -> usize {
        self.0
    }
}

pub trait Module {
    fn loopstart(&mut self, _tasks: &mut TaskPool) -> Result<()> {
        Ok(())
    }

    /// Poll for events, blocking at most `timeout_us`.
    fn tick(&mut self, tasks: &mut TaskPool, timeout_us: u32) -> Result<()>;

    fn loopend(&mut self, _tasks: &mut TaskPool) -> Result<()> {
        Ok(())
    }

    /// Upper bound this module wants on the next poll timeout.
    fn timeout_hint(&self) -> Option<u32> {
        None
    }

    /// Called on uninstall. Live waiters must be moved to an error path.
    fn detach(&mut self, _tasks: &mut TaskPool) {}

    fn as_fdmon(&mut self) -> Option<&mut dyn FdMonitor> {
        None
    }
}

struct Slot {
    module: Box<dyn Module>,
    // skipped for the rest of the current iteration
    failed: bool,
}

#[derive(Default)]
pub struct ModuleTable {
    slots: Vec<Option<Slot>>,
}

impl ModuleTable {
    pub(crate) fn install(&mut self, module: Box<dyn Module>) -> ModuleId {
        let slot = Some(Slot {
            module,
            failed: false,
        });
        match self.slots.iter().position(Option::is_none) {
            Some(i) => {
                self.slots[i] = slot;
                ModuleId(i)
            }
            None => {
                self.slots.push(slot);
                ModuleId(self.slots.len() - 1)
            }
        }
    }

    pub(crate) fn uninstall(&mut self, id: ModuleId) -> Option<Box<dyn Module>> {
        self.slots.get_mut(id.0)?.take().map(|s| s.module)
    }

    pub fn get_mut(&mut self, id: ModuleId) -> Option<&mut (dyn Module + 'static)> {
        self.slots
            .get_mut(id.0)?
            .as_mut()
            .map(|s| s.module.as_mut())
    }

    pub fn fdmon(&mut self, id: ModuleId) -> Result<&mut dyn FdMonitor> {
        self.get_mut(id)
            .ok_or(Error::NoSuchModule)?
            .as_fdmon()
            .ok_or(Error::NotFdmon)
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    pub(crate) fn slots(&self) -> usize {
        self.slots.len()
    }

    // hook access for the scheduler; None for empty or failed slots
    pub(crate) fn active(&mut self, index: usize) -> Option<&mut (dyn Module + 'static)> {
        match self.slots.get_mut(index)? {
            Some(slot) if !slot.failed => Some(slot.module.as_mut()),
            _ => None,
        }
    }

    pub(crate) fn mark_failed(&mut self, index: usize) {
        if let Some(Some(slot)) = self.slots.get_mut(index) {
            slot.failed = true;
        }
    }

    pub(crate) fn reset_failed(&mut self) {
        for slot in self.slots.iter_mut().flatten() {
            slot.failed = false;
        }
    }

    pub(crate) fn timeout_hint(&self) -> Option<u32> {
        self.slots
            .iter()
            .flatten()
            .filter_map(|s| s.module.timeout_hint())
            .min()
    }
}
