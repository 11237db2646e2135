//! Cross-thread contract: the interrupt flag and the bounded block-run
//! queue. These are the only two ways outside threads talk to the VM;
//! object memory itself is never touched off the VM thread.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

use crate::oop::Oop;

/// One boolean the interpreter polls at bytecode boundaries. A setter
/// that finds it already raised waits for the interpreter to take the
/// previous interrupt first.
pub struct InterruptFlag {
    state: Mutex<bool>,
    taken: Condvar,
}

impl InterruptFlag {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(false),
            taken: Condvar::new(),
        }
    }

    /// Raise the flag, blocking while a previous raise is still pending.
    pub fn raise(&self) {
        let mut set = self.state.lock();
        while *set {
            self.taken.wait(&mut set);
        }
        *set = true;
    }

    /// Interpreter side: check and clear in one step.
    pub fn observe_and_clear(&self) -> bool {
        let mut set = self.state.lock();
        if *set {
            *set = false;
            self.taken.notify_one();
            true
        } else {
            false
        }
    }

    pub fn is_set(&self) -> bool {
        *self.state.lock()
    }
}

impl Default for InterruptFlag {
    fn default() -> Self {
        Self::new()
    }
}

pub const DEFAULT_QUEUE_DEPTH: usize = 16;

/// Bounded queue of blocks waiting to be wrapped in a process. Enqueue
/// blocks when full; dequeue never blocks.
pub struct BlockQueue {
    inner: Mutex<VecDeque<Oop>>,
    capacity: usize,
    space: Condvar,
}

impl BlockQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            space: Condvar::new(),
        }
    }

    /// Blocks while the queue is full. Always answers true once queued.
    pub fn enqueue(&self, block: Oop) -> bool {
        let mut q = self.inner.lock();
        while q.len() >= self.capacity {
            self.space.wait(&mut q);
        }
        q.push_back(block);
        true
    }

    pub fn try_dequeue(&self) -> Option<Oop> {
        let mut q = self.inner.lock();
        let b = q.pop_front();
        if b.is_some() {
            self.space.notify_one();
        }
        b
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_observe_clears_the_flag() {
        let flag = InterruptFlag::new();
        assert!(!flag.observe_and_clear());
        flag.raise();
        assert!(flag.is_set());
        assert!(flag.observe_and_clear());
        assert!(!flag.is_set());
    }

    #[test]
    fn test_second_raise_waits_for_observe() {
        let flag = Arc::new(InterruptFlag::new());
        flag.raise();
        let f2 = Arc::clone(&flag);
        let setter = thread::spawn(move || {
            f2.raise();
        });
        thread::sleep(Duration::from_millis(20));
        assert!(!setter.is_finished());
        assert!(flag.observe_and_clear());
        setter.join().unwrap();
        assert!(flag.is_set());
    }

    #[test]
    fn test_queue_is_fifo() {
        let q = BlockQueue::new(4);
        q.enqueue(Oop::reference(10));
        q.enqueue(Oop::reference(20));
        assert_eq!(q.try_dequeue(), Some(Oop::reference(10)));
        assert_eq!(q.try_dequeue(), Some(Oop::reference(20)));
        assert_eq!(q.try_dequeue(), None);
    }

    #[test]
    fn test_full_queue_blocks_until_dequeue() {
        let q = Arc::new(BlockQueue::new(2));
        q.enqueue(Oop::reference(1));
        q.enqueue(Oop::reference(2));
        let q2 = Arc::clone(&q);
        let producer = thread::spawn(move || {
            q2.enqueue(Oop::reference(3));
        });
        thread::sleep(Duration::from_millis(20));
        assert!(!producer.is_finished());
        assert_eq!(q.try_dequeue(), Some(Oop::reference(1)));
        producer.join().unwrap();
        assert_eq!(q.len(), 2);
    }
}
