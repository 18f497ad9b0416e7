//! Dispatcher coordinating the worker pool and the task registry

use crate::task::{Affinity, Task, TaskId, TaskMode, TaskOutcome};
use crate::worker::Worker;
use crate::{DispatchError, DispatchResult};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, ThreadId};

/// Completion event handler, run on the calling thread from inside `drain`
type DoneHandler = Arc<dyn Fn(TaskId, &TaskOutcome) + Send + Sync>;

/// Options for `submit_async_with`
#[derive(Debug, Copy, Clone)]
pub struct SubmitOptions {
    /// If true, the task is registered but not routed until `start` is called
    pub manual_start: bool,

    /// Worker placement
    pub affinity: Affinity,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            manual_start: false,
            affinity: Affinity::Auto,
        }
    }
}

/// State guarded by the dispatcher lock
struct Inner {
    /// Worker pool, index-addressable (pinned affinity indexes this Vec)
    workers: Vec<Worker>,

    /// Live tasks not yet finalized, in submission order.
    /// Drain order follows this order, not completion order.
    registry: Vec<Arc<Task>>,

    /// Next worker ID, monotonic across pool resizes (thread naming only)
    next_worker_id: usize,
}

/// Owns the worker pool and the live task registry.
///
/// Submission may happen from any thread; `drain` must be called periodically
/// from the single calling thread, and every completion callback runs there.
/// There is no internal timer or event loop: a host that never drains never
/// finalizes a task.
pub struct Dispatcher {
    inner: Mutex<Inner>,

    /// Completion event subscribers; snapshotted before emitting so handlers
    /// run with no dispatcher lock held
    subscribers: Mutex<Vec<DoneHandler>>,

    /// Thread that constructed the dispatcher; expected to own `drain`
    calling_thread: ThreadId,
}

impl Dispatcher {
    /// Create a dispatcher with a single worker
    pub fn new() -> Self {
        Self::with_workers(1).expect("worker count is non-zero")
    }

    /// Create a dispatcher with `worker_count` workers
    pub fn with_workers(worker_count: usize) -> DispatchResult<Self> {
        if worker_count == 0 {
            return Err(DispatchError::InvalidWorkerCount);
        }

        let workers = (0..worker_count).map(Worker::spawn).collect();

        Ok(Self {
            inner: Mutex::new(Inner {
                workers,
                registry: Vec::new(),
                next_worker_id: worker_count,
            }),
            subscribers: Mutex::new(Vec::new()),
            calling_thread: thread::current().id(),
        })
    }

    /// Create a dispatcher with one worker per CPU core
    pub fn with_default_workers() -> Self {
        Self::with_workers(num_cpus::get().max(1)).expect("worker count is non-zero")
    }

    /// Submit work that runs inline on the calling thread during the next
    /// drain. The task is immediately ready; nothing touches a worker.
    pub fn submit_sync(&self, body: impl FnOnce() + Send + 'static) -> TaskId {
        let task = Arc::new(Task::sync(body));
        let id = task.id();
        self.inner.lock().registry.push(task);
        id
    }

    /// Submit background work with an optional completion callback.
    /// The body runs on the least-loaded worker; the callback runs on the
    /// calling thread during a later drain, after the body finished.
    pub fn submit_async(
        &self,
        body: impl FnOnce() + Send + 'static,
        on_complete: impl FnOnce(&TaskOutcome) + Send + 'static,
    ) -> TaskId {
        self.submit_async_with(body, Some(Box::new(on_complete)), SubmitOptions::default())
            .expect("auto-affinity routing is infallible")
    }

    /// Submit background work with explicit options.
    ///
    /// A pinned affinity is validated at routing time: an out-of-range index
    /// fails with `InvalidWorkerIndex` and the task is never registered,
    /// queued, or run. With `manual_start` the task is registered but stays
    /// off every queue until `start`.
    pub fn submit_async_with(
        &self,
        body: impl FnOnce() + Send + 'static,
        on_complete: Option<Box<dyn FnOnce(&TaskOutcome) + Send>>,
        options: SubmitOptions,
    ) -> DispatchResult<TaskId> {
        let task = Arc::new(Task::background(body, on_complete, options.affinity));
        let id = task.id();

        let mut inner = self.inner.lock();
        if options.manual_start {
            inner.registry.push(task);
        } else {
            // Validate placement before registering so a bad pin leaves no trace
            let index = Self::resolve_worker(&inner, options.affinity)?;
            inner.registry.push(task.clone());
            task.mark_started();
            inner.workers[index].enqueue(task);
        }

        Ok(id)
    }

    /// Route a manually started task to a worker. Idempotent: repeated calls
    /// (and calls for tasks already routed at submission) do nothing. An
    /// unknown id is a no-op — a finalized task is indistinguishable from one
    /// that never existed.
    pub fn start(&self, id: TaskId) -> DispatchResult<()> {
        let mut inner = self.inner.lock();
        let Some(task) = inner.registry.iter().find(|t| t.id() == id).cloned() else {
            return Ok(());
        };

        if task.mode() == TaskMode::Sync {
            // Sync tasks are ready from the moment they are submitted
            return Ok(());
        }

        let index = Self::resolve_worker(&inner, task.affinity())?;
        if !task.mark_started() {
            return Ok(());
        }
        inner.workers[index].enqueue(task);
        Ok(())
    }

    /// Finalize every completed task: run deferred sync bodies and completion
    /// callbacks on this thread, then emit one completion event per task.
    ///
    /// The host must call this periodically from the calling thread. The
    /// registry is swept and pruned under the lock, then callbacks run with
    /// no lock held — so a callback may submit new tasks reentrantly; those
    /// are picked up by a later drain, never this one. Returns the number of
    /// tasks finalized.
    pub fn drain(&self) -> usize {
        let finished: Vec<Arc<Task>> = {
            let mut inner = self.inner.lock();
            let registry = std::mem::take(&mut inner.registry);
            let mut finished = Vec::new();
            for task in registry {
                if task.is_done() {
                    finished.push(task);
                } else {
                    inner.registry.push(task);
                }
            }
            finished
        };

        let subscribers: Vec<DoneHandler> = self.subscribers.lock().clone();

        for task in &finished {
            if task.mode() == TaskMode::Sync && !task.is_cancelled() {
                // Deferred body, runs inline here on the calling thread
                task.run();
            }

            let outcome = task.outcome();
            if let Some(on_complete) = task.take_on_complete() {
                on_complete(&outcome);
            }
            for handler in &subscribers {
                handler(task.id(), &outcome);
            }
        }

        finished.len()
    }

    /// Resize the worker pool.
    ///
    /// Growing appends idle workers. Shrinking stops the excess workers;
    /// every task still queued on them is cancelled, stays in the registry,
    /// and is finalized by a later drain with a Cancelled outcome.
    pub fn set_worker_count(&self, worker_count: usize) -> DispatchResult<()> {
        if worker_count == 0 {
            return Err(DispatchError::InvalidWorkerCount);
        }

        // Collect removed workers under the lock, stop them outside it:
        // stop joins the worker thread with a bounded timeout and must not
        // stall submissions from other threads.
        let removed: Vec<Worker> = {
            let mut inner = self.inner.lock();
            if worker_count > inner.workers.len() {
                while inner.workers.len() < worker_count {
                    let id = inner.next_worker_id;
                    inner.next_worker_id += 1;
                    inner.workers.push(Worker::spawn(id));
                }
                Vec::new()
            } else {
                inner.workers.split_off(worker_count)
            }
        };

        for mut worker in removed {
            let cancelled = worker.stop();
            #[cfg(debug_assertions)]
            if !cancelled.is_empty() {
                eprintln!(
                    "tickpool worker {} stopped with {} tasks cancelled",
                    worker.id(),
                    cancelled.len()
                );
            }
            #[cfg(not(debug_assertions))]
            let _ = cancelled;
        }

        Ok(())
    }

    /// Current worker pool size
    pub fn worker_count(&self) -> usize {
        self.inner.lock().workers.len()
    }

    /// Pending queue length per worker, by pool index. Excludes batches
    /// already detached by worker threads.
    pub fn queue_depths(&self) -> Vec<usize> {
        self.inner
            .lock()
            .workers
            .iter()
            .map(Worker::queue_len)
            .collect()
    }

    /// Number of live tasks not yet finalized
    pub fn pending_tasks(&self) -> usize {
        self.inner.lock().registry.len()
    }

    /// True on the thread that constructed the dispatcher (advisory — the
    /// host contract, not an enforced check)
    pub fn is_calling_thread(&self) -> bool {
        thread::current().id() == self.calling_thread
    }

    /// Subscribe a completion event handler. It runs synchronously inside
    /// `drain`, once per finalized task, on the calling thread, with no
    /// dispatcher lock held.
    pub fn on_task_done(&self, handler: impl Fn(TaskId, &TaskOutcome) + Send + Sync + 'static) {
        self.subscribers.lock().push(Arc::new(handler));
    }

    /// Pinned index validated against the pool; Auto picks the worker with
    /// the shortest queue, ties resolved by lowest index. A single greedy
    /// choice at routing time — no rebalancing afterward.
    fn resolve_worker(inner: &Inner, affinity: Affinity) -> DispatchResult<usize> {
        match affinity {
            Affinity::Pinned(index) => {
                if index >= inner.workers.len() {
                    Err(DispatchError::InvalidWorkerIndex {
                        index,
                        worker_count: inner.workers.len(),
                    })
                } else {
                    Ok(index)
                }
            }
            Affinity::Auto => {
                let mut best = 0;
                let mut best_len = inner.workers[0].queue_len();
                for (index, worker) in inner.workers.iter().enumerate().skip(1) {
                    let len = worker.queue_len();
                    if len < best_len {
                        best = index;
                        best_len = len;
                    }
                }
                Ok(best)
            }
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // Explicit shutdown: signal every worker, join with a bounded
        // timeout, cancel whatever was still queued. Tasks left in the
        // registry are never finalized — the host that would drain them
        // is letting go of the dispatcher.
        let workers = std::mem::take(&mut self.inner.lock().workers);
        for mut worker in workers {
            worker.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn drain_until(dispatcher: &Dispatcher, cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            dispatcher.drain();
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn test_sync_task_deferred_until_drain() {
        let dispatcher = Dispatcher::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let c = counter.clone();
        dispatcher.submit_sync(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(counter.load(Ordering::SeqCst), 0);

        assert_eq!(dispatcher.drain(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // Already finalized — a second drain sees nothing
        assert_eq!(dispatcher.drain(), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_background_callback_on_calling_thread() {
        let dispatcher = Dispatcher::new();
        let calling = thread::current().id();
        let body_thread = Arc::new(Mutex::new(None));
        let callback_thread = Arc::new(Mutex::new(None));

        let bt = body_thread.clone();
        let ct = callback_thread.clone();
        dispatcher.submit_async(
            move || {
                *bt.lock() = Some(thread::current().id());
            },
            move |outcome| {
                assert!(outcome.is_success());
                *ct.lock() = Some(thread::current().id());
            },
        );

        assert!(drain_until(&dispatcher, || callback_thread.lock().is_some()));
        assert_ne!(body_thread.lock().unwrap(), calling);
        assert_eq!(callback_thread.lock().unwrap(), calling);
        assert_eq!(dispatcher.pending_tasks(), 0);
    }

    #[test]
    fn test_zero_worker_count_rejected() {
        let dispatcher = Dispatcher::with_workers(2).unwrap();

        assert_eq!(
            dispatcher.set_worker_count(0),
            Err(DispatchError::InvalidWorkerCount)
        );
        assert_eq!(dispatcher.worker_count(), 2);

        assert!(matches!(
            Dispatcher::with_workers(0),
            Err(DispatchError::InvalidWorkerCount)
        ));
    }

    #[test]
    fn test_pin_out_of_range_never_queued() {
        let dispatcher = Dispatcher::with_workers(2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        let c = counter.clone();
        let result = dispatcher.submit_async_with(
            move || {
                c.fetch_add(1, Ordering::SeqCst);
            },
            None,
            SubmitOptions {
                manual_start: false,
                affinity: Affinity::Pinned(5),
            },
        );

        assert_eq!(
            result,
            Err(DispatchError::InvalidWorkerIndex {
                index: 5,
                worker_count: 2,
            })
        );
        assert_eq!(dispatcher.pending_tasks(), 0);
        assert_eq!(dispatcher.queue_depths(), vec![0, 0]);

        thread::sleep(Duration::from_millis(20));
        dispatcher.drain();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_manual_start_routes_once() {
        let dispatcher = Dispatcher::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let callbacks = Arc::new(AtomicUsize::new(0));

        let r = runs.clone();
        let cb = callbacks.clone();
        let id = dispatcher
            .submit_async_with(
                move || {
                    r.fetch_add(1, Ordering::SeqCst);
                },
                Some(Box::new(move |_| {
                    cb.fetch_add(1, Ordering::SeqCst);
                })),
                SubmitOptions {
                    manual_start: true,
                    affinity: Affinity::Auto,
                },
            )
            .unwrap();

        // Not routed yet: drains observe nothing
        thread::sleep(Duration::from_millis(20));
        assert_eq!(dispatcher.drain(), 0);
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        dispatcher.start(id).unwrap();
        dispatcher.start(id).unwrap();

        let cbs = callbacks.clone();
        assert!(drain_until(&dispatcher, || cbs.load(Ordering::SeqCst) == 1));
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // Finalized; a stale handle is a no-op
        dispatcher.start(id).unwrap();
        assert_eq!(dispatcher.drain(), 0);
    }

    #[test]
    fn test_completion_event_fires_once_per_task() {
        let dispatcher = Dispatcher::new();
        let events = Arc::new(Mutex::new(Vec::new()));

        let e = events.clone();
        dispatcher.on_task_done(move |id, outcome| {
            e.lock().push((id, outcome.clone()));
        });

        let first = dispatcher.submit_sync(|| {});
        let second = dispatcher.submit_async(|| {}, |_| {});

        let e = events.clone();
        assert!(drain_until(&dispatcher, || e.lock().len() == 2));

        let events = events.lock();
        assert_eq!(events.len(), 2);
        assert!(events.iter().any(|(id, o)| *id == first && o.is_success()));
        assert!(events.iter().any(|(id, o)| *id == second && o.is_success()));
    }

    #[test]
    fn test_reentrant_submission_from_callback() {
        let dispatcher = Arc::new(Dispatcher::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let d = dispatcher.clone();
        let c = counter.clone();
        dispatcher.submit_sync(move || {
            let inner_c = c.clone();
            d.submit_sync(move || {
                inner_c.fetch_add(1, Ordering::SeqCst);
            });
        });

        // First drain runs the outer body (which submits); the inner task is
        // not observed in the same pass
        assert_eq!(dispatcher.drain(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        assert_eq!(dispatcher.drain(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_is_calling_thread() {
        let dispatcher = Arc::new(Dispatcher::new());
        assert!(dispatcher.is_calling_thread());

        let d = dispatcher.clone();
        thread::spawn(move || {
            assert!(!d.is_calling_thread());
        })
        .join()
        .unwrap();
    }
}
