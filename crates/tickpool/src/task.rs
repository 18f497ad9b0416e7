//! Task structure and execution state

use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Unique identifier for a Task
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

impl TaskId {
    /// Generate a new unique TaskId
    pub fn new() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a task's body runs
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TaskMode {
    /// Body runs inline on the calling thread, during the drain that observes it
    Sync,
    /// Body runs on a worker thread
    Background,
}

/// Worker placement for a background task
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Affinity {
    /// Dispatcher picks the least-loaded worker at routing time
    Auto,
    /// Task must run on the worker at this pool index
    Pinned(usize),
}

/// How a task's body finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Body ran to completion
    Success,
    /// Body panicked; carries the panic message
    Failed(String),
    /// Task was still queued when its worker was stopped; body never ran
    Cancelled,
}

impl TaskOutcome {
    /// True unless the task failed or was cancelled
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success)
    }
}

type Body = Box<dyn FnOnce() + Send>;
type Callback = Box<dyn FnOnce(&TaskOutcome) + Send>;

/// A unit of work: a body, an optional completion callback, and a mode.
///
/// Shared between the dispatcher registry and a worker queue via `Arc`;
/// the `done` flag is the only cross-thread signal, everything else is
/// taken exactly once under its own lock.
pub struct Task {
    /// Unique identifier
    id: TaskId,

    /// Where the body runs
    mode: TaskMode,

    /// Worker placement (background tasks only)
    affinity: Affinity,

    /// Guards idempotent start
    started: AtomicBool,

    /// Set exactly once, after the body ran (or the task was cancelled)
    done: AtomicBool,

    /// The work itself, taken exactly once
    body: Mutex<Option<Body>>,

    /// Completion callback, run only on the calling thread inside drain
    on_complete: Mutex<Option<Callback>>,

    /// Recorded when the body finishes or the task is cancelled
    outcome: Mutex<Option<TaskOutcome>>,
}

impl Task {
    /// Create a synchronous task.
    ///
    /// Sync tasks are born started and done: the body execution is deferred
    /// to the first drain that observes them.
    pub fn sync(body: impl FnOnce() + Send + 'static) -> Self {
        Self {
            id: TaskId::new(),
            mode: TaskMode::Sync,
            affinity: Affinity::Auto,
            started: AtomicBool::new(true),
            done: AtomicBool::new(true),
            body: Mutex::new(Some(Box::new(body))),
            on_complete: Mutex::new(None),
            outcome: Mutex::new(None),
        }
    }

    /// Create a background task
    pub fn background(
        body: impl FnOnce() + Send + 'static,
        on_complete: Option<Callback>,
        affinity: Affinity,
    ) -> Self {
        Self {
            id: TaskId::new(),
            mode: TaskMode::Background,
            affinity,
            started: AtomicBool::new(false),
            done: AtomicBool::new(false),
            body: Mutex::new(Some(Box::new(body))),
            on_complete: Mutex::new(on_complete),
            outcome: Mutex::new(None),
        }
    }

    /// Get the Task's unique ID
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Get the mode
    pub fn mode(&self) -> TaskMode {
        self.mode
    }

    /// Get the worker placement
    pub fn affinity(&self) -> Affinity {
        self.affinity
    }

    /// Consume the started flag; returns true exactly once
    pub fn mark_started(&self) -> bool {
        !self.started.swap(true, Ordering::AcqRel)
    }

    /// True once the body ran (or the task was cancelled)
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// True if the task was cancelled before its body ran
    pub fn is_cancelled(&self) -> bool {
        matches!(*self.outcome.lock(), Some(TaskOutcome::Cancelled))
    }

    /// Execute the body inside a panic boundary and record the outcome.
    ///
    /// Invoked by a worker thread for background tasks, or by drain (on the
    /// calling thread) for sync tasks. Never touches `on_complete` — that is
    /// reserved for the calling thread inside drain.
    pub fn run(&self) {
        let body = self.body.lock().take();
        if let Some(body) = body {
            let outcome = match panic::catch_unwind(AssertUnwindSafe(body)) {
                Ok(()) => TaskOutcome::Success,
                Err(payload) => TaskOutcome::Failed(panic_message(payload.as_ref())),
            };
            *self.outcome.lock() = Some(outcome);
        }
        self.done.store(true, Ordering::Release);
    }

    /// Mark the task cancelled: the body is discarded and will never run
    pub fn cancel(&self) {
        self.body.lock().take();
        *self.outcome.lock() = Some(TaskOutcome::Cancelled);
        self.done.store(true, Ordering::Release);
    }

    /// Get the recorded outcome (Success if the body set none)
    pub fn outcome(&self) -> TaskOutcome {
        self.outcome.lock().clone().unwrap_or(TaskOutcome::Success)
    }

    /// Take the completion callback (used once, by drain)
    pub fn take_on_complete(&self) -> Option<Callback> {
        self.on_complete.lock().take()
    }
}

/// Extract a readable message from a panic payload
fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task body panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_task_ids_unique() {
        let a = Task::sync(|| {});
        let b = Task::sync(|| {});
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_sync_task_born_done() {
        let task = Task::sync(|| {});
        assert!(task.is_done());
        assert!(!task.mark_started());
        assert_eq!(task.mode(), TaskMode::Sync);
    }

    #[test]
    fn test_background_task_starts_unstarted() {
        let task = Task::background(|| {}, None, Affinity::Auto);
        assert!(!task.is_done());
        assert!(task.mark_started());
        assert!(!task.mark_started());
    }

    #[test]
    fn test_run_executes_body_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let task = Task::background(
            move || {
                c.fetch_add(1, Ordering::SeqCst);
            },
            None,
            Affinity::Auto,
        );

        task.run();
        task.run();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(task.is_done());
        assert_eq!(task.outcome(), TaskOutcome::Success);
    }

    #[test]
    fn test_panicking_body_records_failure() {
        let task = Task::background(|| panic!("boom"), None, Affinity::Auto);

        task.run();

        assert!(task.is_done());
        assert_eq!(task.outcome(), TaskOutcome::Failed("boom".to_string()));
    }

    #[test]
    fn test_cancel_discards_body() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let task = Task::background(
            move || {
                c.fetch_add(1, Ordering::SeqCst);
            },
            None,
            Affinity::Auto,
        );

        task.cancel();
        task.run();

        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(task.is_cancelled());
        assert_eq!(task.outcome(), TaskOutcome::Cancelled);
    }
}
