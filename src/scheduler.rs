//! Per-instance task queue and affinity-thread loop.
//!
//! Every engine instance owns exactly one affinity thread that drains a
//! [`TaskQueue`]. Ordinary work is appended; termination control
//! messages jump the queue via [`TaskQueue::post_front`]. Once closed, a
//! queue refuses new tasks and wakes every waiter; tasks still queued at
//! close are dropped, which releases the completion channels of any
//! blocked dispatchers.

use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::ThreadId;

use crate::worker::Envelope;

/// One unit of work for an affinity thread.
pub enum Task {
    /// A closure to run on the affinity thread, typically a dispatched
    /// call carrying its completion channel.
    Call(Box<dyn FnOnce() + Send>),
    /// A worker-protocol message for the loop's message handler.
    Message(Envelope),
}

struct QueueInner {
    tasks: VecDeque<Task>,
    closed: bool,
}

/// FIFO queue with a priority front slot, drained by one thread.
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
    available: Condvar,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                tasks: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Append a task. Returns `false` if the queue is closed.
    pub fn post(&self, task: Task) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return false;
        }
        inner.tasks.push_back(task);
        self.available.notify_one();
        true
    }

    /// Push a task ahead of everything queued. Returns `false` if the
    /// queue is closed.
    pub fn post_front(&self, task: Task) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return false;
        }
        inner.tasks.push_front(task);
        self.available.notify_one();
        true
    }

    /// Block until a task is available. Returns `None` once the queue is
    /// closed; tasks still queued at that point are dropped.
    pub fn take(&self) -> Option<Task> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.closed {
                inner.tasks.clear();
                return None;
            }
            if let Some(task) = inner.tasks.pop_front() {
                return Some(task);
            }
            inner = self.available.wait(inner).unwrap();
        }
    }

    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        inner.tasks.clear();
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cloneable handle to one affinity thread's queue.
#[derive(Clone)]
pub struct SchedulerHandle {
    queue: Arc<TaskQueue>,
    thread_id: Arc<OnceLock<ThreadId>>,
    alive: Arc<AtomicBool>,
}

impl Default for SchedulerHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerHandle {
    pub fn new() -> Self {
        Self {
            queue: Arc::new(TaskQueue::new()),
            thread_id: Arc::new(OnceLock::new()),
            alive: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Claim the calling thread as the queue's affinity thread. Called
    /// once, at the top of the affinity thread.
    pub(crate) fn bind_current_thread(&self) {
        let _ = self.thread_id.set(std::thread::current().id());
        self.alive.store(true, Ordering::Release);
    }

    /// Whether the caller is on the affinity thread.
    pub fn is_current(&self) -> bool {
        self.thread_id.get() == Some(&std::thread::current().id())
    }

    /// Whether the affinity thread is still draining the queue.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn post(&self, task: Task) -> bool {
        self.queue.post(task)
    }

    pub fn post_front(&self, task: Task) -> bool {
        self.queue.post_front(task)
    }

    fn take(&self) -> Option<Task> {
        self.queue.take()
    }

    fn shut_down(&self) {
        self.alive.store(false, Ordering::Release);
        self.queue.close();
    }
}

/// Drain the queue on the calling thread until the handler breaks or the
/// queue closes. Closes the queue on the way out so late posts fail fast.
pub(crate) fn run_loop<F>(handle: &SchedulerHandle, mut on_message: F)
where
    F: FnMut(Envelope) -> ControlFlow<()>,
{
    while let Some(task) = handle.take() {
        match task {
            Task::Call(call) => call(),
            Task::Message(envelope) => {
                if on_message(envelope).is_break() {
                    break;
                }
            }
        }
    }
    handle.shut_down();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn recording_call(order: &Arc<Mutex<Vec<usize>>>, n: usize) -> Task {
        let order = Arc::clone(order);
        Task::Call(Box::new(move || order.lock().unwrap().push(n)))
    }

    #[test]
    fn test_fifo_order() {
        let queue = TaskQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 0..5 {
            assert!(queue.post(recording_call(&order, n)));
        }
        for _ in 0..5 {
            match queue.take() {
                Some(Task::Call(call)) => call(),
                _ => panic!("expected a call task"),
            }
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_post_front_jumps_queue() {
        let queue = TaskQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        queue.post(recording_call(&order, 1));
        queue.post(recording_call(&order, 2));
        queue.post_front(recording_call(&order, 0));
        for _ in 0..3 {
            match queue.take() {
                Some(Task::Call(call)) => call(),
                _ => panic!("expected a call task"),
            }
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_closed_queue_refuses_tasks_and_wakes_taker() {
        let queue = Arc::new(TaskQueue::new());
        let taker = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.take().is_none())
        };
        // Give the taker a moment to block.
        std::thread::sleep(std::time::Duration::from_millis(20));
        queue.close();
        assert!(taker.join().unwrap());
        assert!(!queue.post(Task::Call(Box::new(|| {}))));
    }

    #[test]
    fn test_close_drops_queued_tasks() {
        let queue = TaskQueue::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        queue.post(Task::Call(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })));
        queue.close();
        assert!(queue.take().is_none());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_handle_binding_and_liveness() {
        let handle = SchedulerHandle::new();
        assert!(!handle.is_current());
        assert!(!handle.is_alive());
        handle.bind_current_thread();
        assert!(handle.is_current());
        assert!(handle.is_alive());
        handle.shut_down();
        assert!(!handle.is_alive());
    }
}
