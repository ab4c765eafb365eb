//! The conduit between the I/O tasks and the worker threads.
//!
//! Every command decoded from an encrypted frame is wrapped in a
//! [`Message`] and enqueued; workers block on [`MessageQueue::dequeue`]
//! and never touch sockets. Enqueueing never blocks, so it is safe from
//! async context.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::connection::Connection;
use crate::read_only_packet::ReadOnlyPacket;

/// A single decoded command: which connection it arrived on, the command
/// code, and a read-only view of the command body.
pub struct Message {
    pub connection: Arc<Connection>,
    pub command_code: u16,
    pub packet: ReadOnlyPacket,
}

/// FIFO queue with a blocking consumer side.
pub struct MessageQueue<T> {
    queue: Mutex<VecDeque<T>>,
    ready: Condvar,
}

impl<T> MessageQueue<T> {
    pub fn new() -> MessageQueue<T> {
        MessageQueue {
            queue: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
        }
    }

    pub fn enqueue(&self, item: T) {
        let mut queue = self.queue.lock().expect("message queue poisoned");
        queue.push_back(item);
        drop(queue);
        self.ready.notify_one();
    }

    pub fn enqueue_all(&self, items: impl IntoIterator<Item = T>) {
        let mut queue = self.queue.lock().expect("message queue poisoned");
        queue.extend(items);
        drop(queue);
        self.ready.notify_all();
    }

    /// Block until an item is available.
    pub fn dequeue(&self) -> T {
        let mut queue = self.queue.lock().expect("message queue poisoned");

        loop {
            if let Some(item) = queue.pop_front() {
                return item;
            }

            queue = self.ready.wait(queue).expect("message queue poisoned");
        }
    }

    /// Block until an item is available or `timeout` elapses.
    pub fn dequeue_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.queue.lock().expect("message queue poisoned");

        loop {
            if let Some(item) = queue.pop_front() {
                return Some(item);
            }

            let now = Instant::now();

            if now >= deadline {
                return None;
            }

            let (guard, _) = self
                .ready
                .wait_timeout(queue, deadline - now)
                .expect("message queue poisoned");
            queue = guard;
        }
    }

    pub fn try_dequeue(&self) -> Option<T> {
        self.queue
            .lock()
            .expect("message queue poisoned")
            .pop_front()
    }

    /// Block until at least one item is available, then drain everything.
    pub fn dequeue_all(&self, destination: &mut Vec<T>) {
        let mut queue = self.queue.lock().expect("message queue poisoned");

        while queue.is_empty() {
            queue = self.ready.wait(queue).expect("message queue poisoned");
        }

        destination.extend(queue.drain(..));
    }

    pub fn len(&self) -> usize {
        self.queue.lock().expect("message queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for MessageQueue<T> {
    fn default() -> Self {
        MessageQueue::new()
    }
}
