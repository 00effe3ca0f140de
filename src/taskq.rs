//! Issue/intr task-queue families (spec §4.7). The engine runs stages
//! `< VDEV_IO_DONE` on the issue family and `VDEV_IO_DONE` onward on the
//! intr family, so that issue threads stalled on dependent reads can never
//! starve the completion path (spec §4.7, §5 "Suspension points").
//!
//! Grounded on `taskq_dispatch`/`TQ_SLEEP` in the original; implemented
//! with `crossbeam::channel` worker pools rather than a raw OS-thread
//! taskq, matching the pack's convention of a channel-backed work queue
//! for a bounded worker pool (`rusty-db`'s `crossbeam` dependency, used
//! the same way).

use crossbeam::channel::{unbounded, Receiver, Sender};
use std::thread::JoinHandle;

/// A unit of deferred pipeline work: advance the `Zio` at arena index
/// `idx` by running its current stage. The closure captures the `Spa`
/// handle each task needs; see `spa::Spa::dispatch_stage`.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// One task queue: a bounded pool of worker threads pulling from a shared
/// channel. `taskq_dispatch` in the original never fails; dispatch here
/// only fails if every worker has been shut down, which doesn't happen
/// during the lifetime of an open `Spa`.
pub struct TaskQueue {
    sender: Option<Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
}

impl TaskQueue {
    pub fn new(name: impl Into<String>, workers: usize) -> Self {
        let name = name.into();
        let (sender, receiver): (Sender<Task>, Receiver<Task>) = unbounded();
        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers.max(1) {
            let rx = receiver.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{name}-{i}"))
                .spawn(move || {
                    for task in rx.iter() {
                        task();
                    }
                })
                .expect("failed to spawn task queue worker");
            handles.push(handle);
        }
        TaskQueue { sender: Some(sender), workers: handles }
    }

    /// `taskq_dispatch(tq, fn, arg, TQ_SLEEP)`: posts `task` for a worker
    /// to run. Assumed to always succeed (spec §6 "Task-queue contract").
    pub fn dispatch(&self, task: Task) {
        self.sender.as_ref().expect("dispatch after shutdown").send(task).expect("task queue receiver dropped while dispatching");
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        // Struct fields drop after this body runs, so joining first would
        // deadlock: every worker's `for task in rx.iter()` only ends once
        // all senders disconnect, and `self.sender` is the only one left.
        // Drop it explicitly to close the channel before joining.
        self.sender.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

/// The two task-queue families for one I/O type (spec §4.7): `issue` runs
/// stages before `VDEV_IO_DONE`, `intr` runs `VDEV_IO_DONE` onward.
pub struct TaskQueuePair {
    pub issue: TaskQueue,
    pub intr: TaskQueue,
}

impl TaskQueuePair {
    pub fn new(type_name: &'static str, issue_workers: usize, intr_workers: usize) -> Self {
        TaskQueuePair {
            issue: TaskQueue::new(format!("{type_name}-issue"), issue_workers),
            intr: TaskQueue::new(format!("{type_name}-intr"), intr_workers),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn dispatched_tasks_run() {
        let tq = TaskQueue::new("test", 2);
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = crossbeam::channel::bounded(8);
        for _ in 0..8 {
            let counter = counter.clone();
            let tx = tx.clone();
            tq.dispatch(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                tx.send(()).unwrap();
            }));
        }
        for _ in 0..8 {
            rx.recv_timeout(std::time::Duration::from_secs(2)).unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }
}
