//! Worker thread that executes queued Tasks

use crate::task::Task;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// How long `stop` waits for the worker thread before detaching it.
/// A thread that misses the deadline is mid-body; it exits on its own
/// once the current batch finishes.
const JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// State shared between the Worker handle and its thread
struct Shared {
    /// Pending tasks, strict FIFO
    queue: Mutex<VecDeque<Arc<Task>>>,

    /// Signalled on enqueue and on stop
    available: Condvar,

    /// Shutdown signal
    stop: AtomicBool,
}

/// A dedicated background executor: one FIFO queue, one thread.
///
/// Tasks execute strictly in enqueue order. On each wake the thread detaches
/// the entire queue into a private batch, so tasks enqueued while a batch is
/// executing wait for the next wake cycle.
pub struct Worker {
    /// Worker ID (used for the thread name; stable across pool resizes)
    id: usize,

    shared: Arc<Shared>,

    /// Worker thread handle
    handle: Option<thread::JoinHandle<()>>,
}

impl Worker {
    /// Spawn a new worker with a running execution thread
    pub fn spawn(id: usize) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            stop: AtomicBool::new(false),
        });

        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name(format!("tickpool-worker-{}", id))
            .spawn(move || {
                Worker::run_loop(id, thread_shared);
            })
            .expect("Failed to spawn worker thread");

        Self {
            id,
            shared,
            handle: Some(handle),
        }
    }

    /// Get the worker ID
    pub fn id(&self) -> usize {
        self.id
    }

    /// Number of tasks waiting in the queue (excludes the batch currently
    /// executing, which has already been detached)
    pub fn queue_len(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Append a task to the tail of the queue and wake the thread.
    /// Called only by the Dispatcher.
    pub fn enqueue(&self, task: Arc<Task>) {
        let mut queue = self.shared.queue.lock();
        queue.push_back(task);
        self.shared.available.notify_one();
    }

    /// Signal stop, cancel everything still queued, and join the thread with
    /// a bounded timeout. Returns the cancelled tasks so the caller can
    /// account for them; their `done` flag is set, so a later drain
    /// finalizes them with a Cancelled outcome.
    pub fn stop(&mut self) -> Vec<Arc<Task>> {
        self.shared.stop.store(true, Ordering::Release);

        let cancelled: Vec<Arc<Task>> = {
            let mut queue = self.shared.queue.lock();
            let cancelled: Vec<_> = queue.drain(..).collect();
            self.shared.available.notify_one();
            cancelled
        };
        for task in &cancelled {
            task.cancel();
        }

        if let Some(handle) = self.handle.take() {
            let deadline = Instant::now() + JOIN_TIMEOUT;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(1));
            }
            if handle.is_finished() {
                let _ = handle.join();
            }
            // else: detached — the thread exits after its current batch
        }

        cancelled
    }

    /// Worker thread main loop
    fn run_loop(id: usize, shared: Arc<Shared>) {
        loop {
            // Wait for work or a stop signal, then detach the whole queue
            let batch: Vec<Arc<Task>> = {
                let mut queue = shared.queue.lock();
                while queue.is_empty() && !shared.stop.load(Ordering::Acquire) {
                    shared.available.wait(&mut queue);
                }
                if shared.stop.load(Ordering::Acquire) {
                    break;
                }
                queue.drain(..).collect()
            };

            // Execute the batch in detached order; a panicking body is
            // contained inside Task::run and never reaches this loop
            for task in batch {
                task.run();
            }
        }

        #[cfg(debug_assertions)]
        eprintln!("tickpool worker {} shutting down", id);
        #[cfg(not(debug_assertions))]
        let _ = id;
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
        }
    }
}
