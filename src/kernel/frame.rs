// Call frames: one stackless activation record per routine invocation
//
// Frames live in an arena owned by the runtime. A task only stores the
// id of its innermost frame; each frame links to its caller, so the
// chain ends at the task's root routine (parent == None).

use alloc::boxed::Box;
use alloc::vec::Vec;

use super::coro::{Context, Step};

/// Saved resume marker. A routine matches on it to jump back to the
/// statement after its last suspension.
pub type Point = u32;

/// First entry into a routine.
pub const BEGIN: Point = 0;
/// Cleanup entry, dispatched once after the routine asks to unwind.
pub const FINALLY: Point = Point::MAX;

/// A coroutine body. Every invocation must end by returning the Step
/// of exactly one protocol primitive.
pub trait Routine {
    fn resume(&mut self, cx: &mut Context<'_>) -> Step;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameId(u32);

pub(crate) struct Frame {
    pub(crate) parent: Option<FrameId>,
    pub(crate) point: Point,
    // taken out while the routine runs
    routine: Option<Box<dyn Routine>>,
}

#[derive(Default)]
pub(crate) struct FrameArena {
    frames: Vec<Option<Frame>>,
    free: Vec<u32>,
}

impl FrameArena {
    pub(crate) fn push(&mut self, parent: Option<FrameId>, routine: Box<dyn Routine>) -> FrameId {
        let frame = Frame {
            parent,
            point: BEGIN,
            routine: Some(routine),
        };
        match self.free.pop() {
            Some(i) => {
                self.frames[i as usize] = Some(frame);
                FrameId(i)
            }
            None => {
                self.frames.push(Some(frame));
                FrameId(self.frames.len() as u32 - 1)
            }
        }
    }

    // drops the frame and its routine, returns the caller frame
    pub(crate) fn pop(&mut self, id: FrameId) -> Option<FrameId> {
        let frame = self.frames.get_mut(id.0 as usize)?.take()?;
        self.free.push(id.0);
        frame.parent
    }

    pub(crate) fn get_mut(&mut self, id: FrameId) -> Option<&mut Frame> {
        self.frames.get_mut(id.0 as usize)?.as_mut()
    }

    pub(crate) fn point(&self, id: FrameId) -> Option<Point> {
        self.frames.get(id.0 as usize)?.as_ref().map(|f| f.point)
    }

    pub(crate) fn take_routine(&mut self, id: FrameId) -> Option<Box<dyn Routine>> {
        self.get_mut(id)?.routine.take()
    }

    pub(crate) fn put_routine(&mut self, id: FrameId, routine: Box<dyn Routine>) {
        if let Some(frame) = self.get_mut(id) {
            frame.routine = Some(routine);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.frames.len() - self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::coro::from_fn;

    fn noop() -> Box<dyn Routine> {
        Box::new(from_fn(|cx| cx.finally()))
    }

    #[test]
    fn chain_unwinds_to_root_and_slots_are_reused() {
        let mut arena = FrameArena::default();
        let root = arena.push(None, noop());
        let child = arena.push(Some(root), noop());
        assert_eq!(arena.len(), 2);
        assert_eq!(arena.get_mut(child).unwrap().point, BEGIN);

        assert_eq!(arena.pop(child), Some(root));
        assert_eq!(arena.pop(root), None);
        assert_eq!(arena.len(), 0);
        assert!(arena.pop(root).is_none());

        let again = arena.push(None, noop());
        assert!(again == root || again == child);
        assert_eq!(arena.len(), 1);
    }
}
