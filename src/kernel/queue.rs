// Fixed-capacity ring buffer used as the run queue
// NOTE: capacity is set once at construction, push never reallocates

use alloc::boxed::Box;
use alloc::vec::Vec;

pub struct RingQueue<T> {
    buf: Box<[Option<T>]>,
    head: usize, // next to read
    tail: usize, // next to write
    len: usize,
}

impl<T: Copy + PartialEq> RingQueue<T> {
    pub fn with_capacity(cap: usize) -> Self {
        let mut buf = Vec::with_capacity(cap);
        buf.resize_with(cap, || None);
        Self {
            buf: buf.into_boxed_slice(),
            head: 0,
            tail: 0,
            len: 0,
        }
    }

    pub fn push(&mut self, item: T) -> Result<(), T> {
        if self.len >= self.buf.len() {
            return Err(item);
        }
        self.buf[self.tail] = Some(item);
        self.tail = (self.tail + 1) % self.buf.len();
        self.len += 1;
        Ok(())
    }

    // push unless already queued; Ok(false) when it was a duplicate
    pub fn push_unique(&mut self, item: T) -> Result<bool, T> {
        if self.contains(&item) {
            return Ok(false);
        }
        self.push(item).map(|_| true)
    }

    pub fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let item = self.buf[self.head].take();
        self.head = (self.head + 1) % self.buf.len();
        self.len -= 1;
        item
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        while self.pop().is_some() {}
    }

    pub fn contains(&self, item: &T) -> bool {
        let mut i = self.head;
        for _ in 0..self.len {
            if self.buf[i].as_ref() == Some(item) {
                return true;
            }
            i = (i + 1) % self.buf.len();
        }
        false
    }

    // drop every queued occurrence of item, keeping order of the rest
    pub fn remove(&mut self, item: &T) {
        let n = self.len;
        for _ in 0..n {
            if let Some(x) = self.pop() {
                if &x != item {
                    let _ = self.push(x);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_around_and_rejects_when_full() {
        let mut q = RingQueue::with_capacity(2);
        assert!(q.push(1).is_ok());
        assert!(q.push(2).is_ok());
        assert_eq!(q.push(3), Err(3));
        assert_eq!(q.pop(), Some(1));
        assert!(q.push(3).is_ok());
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
        assert!(q.is_empty());
    }

    #[test]
    fn unique_push_and_remove() {
        let mut q = RingQueue::with_capacity(4);
        assert_eq!(q.push_unique(7), Ok(true));
        assert_eq!(q.push_unique(7), Ok(false));
        q.push(8).unwrap();
        q.push(9).unwrap();
        q.remove(&8);
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop(), Some(7));
        assert_eq!(q.pop(), Some(9));
    }
}
