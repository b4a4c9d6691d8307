//! Single-flight task serialization for one script instance.
//!
//! Bodies are boxed closures run in submission order by a dedicated worker
//! thread. The worker owns the context the bodies operate on, so a context
//! that is not `Send` (a Lua state) never leaves the thread that created it.

use std::collections::VecDeque;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use crate::lock;

type Job<C> = Box<dyn FnOnce(&mut C) + Send + 'static>;

/// How a queued body ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    /// The body panicked; the worker caught it and moved on.
    Panicked,
    /// The queue shut down before the body ran.
    Dropped,
}

#[derive(Debug, Default)]
struct TaskSignal {
    outcome: Mutex<Option<TaskOutcome>>,
    finished: Condvar,
}

/// Completion handle for one queued body.
#[derive(Debug, Clone, Default)]
pub struct TaskHandle {
    signal: Arc<TaskSignal>,
}

impl TaskHandle {
    pub fn is_done(&self) -> bool {
        lock(&self.signal.outcome).is_some()
    }

    pub fn outcome(&self) -> Option<TaskOutcome> {
        *lock(&self.signal.outcome)
    }

    /// Blocks until the body has finished.
    pub fn wait(&self) -> TaskOutcome {
        let mut outcome = lock(&self.signal.outcome);
        loop {
            if let Some(done) = *outcome {
                return done;
            }
            outcome = self
                .signal
                .finished
                .wait(outcome)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Like [`TaskHandle::wait`] but gives up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<TaskOutcome> {
        let outcome = lock(&self.signal.outcome);
        let (outcome, _) = self
            .signal
            .finished
            .wait_timeout_while(outcome, timeout, |outcome| outcome.is_none())
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *outcome
    }

    fn complete(&self, result: TaskOutcome) {
        *lock(&self.signal.outcome) = Some(result);
        self.signal.finished.notify_all();
    }

    fn same_task(&self, other: &TaskHandle) -> bool {
        Arc::ptr_eq(&self.signal, &other.signal)
    }
}

struct QueueState<C> {
    pending: VecDeque<(Job<C>, TaskHandle)>,
    /// Tail of the chain: the last body enqueued that has not finished yet.
    current: Option<TaskHandle>,
    closed: bool,
}

struct QueueShared<C> {
    state: Mutex<QueueState<C>>,
    work: Condvar,
}

impl<C> QueueShared<C> {
    fn drop_pending(&self) {
        let pending = {
            let mut state = lock(&self.state);
            state.closed = true;
            state.current = None;
            std::mem::take(&mut state.pending)
        };
        for (_, handle) in pending {
            handle.complete(TaskOutcome::Dropped);
        }
    }
}

/// Per-instance FIFO of bodies drained by one worker thread.
pub struct TaskQueue<C> {
    shared: Arc<QueueShared<C>>,
}

impl<C: 'static> TaskQueue<C> {
    /// Starts the worker. `init` runs on the worker thread and builds the
    /// context every body receives.
    pub fn spawn<F>(name: &str, init: F) -> io::Result<Self>
    where
        F: FnOnce() -> C + Send + 'static,
    {
        let shared = Arc::new(QueueShared {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                current: None,
                closed: false,
            }),
            work: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        thread::Builder::new()
            .name(format!("script-{name}"))
            .spawn(move || run_worker(worker_shared, init))?;
        Ok(Self { shared })
    }

    /// Chains `body` after the current chain, or starts it when idle.
    pub fn enqueue<F>(&self, body: F) -> TaskHandle
    where
        F: FnOnce(&mut C) + Send + 'static,
    {
        let mut state = lock(&self.shared.state);
        self.push_locked(&mut state, Box::new(body))
    }

    /// Enqueues `body` only when nothing is pending or running.
    pub fn enqueue_if_idle<F>(&self, body: F) -> Option<TaskHandle>
    where
        F: FnOnce(&mut C) + Send + 'static,
    {
        let mut state = lock(&self.shared.state);
        if state.current.is_some() {
            return None;
        }
        Some(self.push_locked(&mut state, Box::new(body)))
    }

    pub fn is_idle(&self) -> bool {
        lock(&self.shared.state).current.is_none()
    }

    /// Handle of the last body in the chain, if it has not finished.
    pub fn current(&self) -> Option<TaskHandle> {
        lock(&self.shared.state).current.clone()
    }

    fn push_locked(&self, state: &mut QueueState<C>, job: Job<C>) -> TaskHandle {
        let handle = TaskHandle::default();
        if state.closed {
            handle.complete(TaskOutcome::Dropped);
            return handle;
        }
        state.pending.push_back((job, handle.clone()));
        state.current = Some(handle.clone());
        self.shared.work.notify_one();
        handle
    }
}

impl<C> Drop for TaskQueue<C> {
    fn drop(&mut self) {
        lock(&self.shared.state).closed = true;
        self.shared.work.notify_all();
    }
}

fn run_worker<C, F>(shared: Arc<QueueShared<C>>, init: F)
where
    F: FnOnce() -> C,
{
    let mut context = match panic::catch_unwind(AssertUnwindSafe(init)) {
        Ok(context) => context,
        Err(_) => {
            log::error!("[avatar_script] script worker failed to initialise");
            shared.drop_pending();
            return;
        }
    };

    loop {
        let (job, handle) = {
            let mut state = lock(&shared.state);
            loop {
                if state.closed {
                    drop(state);
                    shared.drop_pending();
                    return;
                }
                if let Some(next) = state.pending.pop_front() {
                    break next;
                }
                state = shared
                    .work
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
        };

        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| job(&mut context))) {
            Ok(()) => TaskOutcome::Completed,
            Err(_) => {
                log::error!("[avatar_script] script task panicked; continuing with the next task");
                TaskOutcome::Panicked
            }
        };

        let mut state = lock(&shared.state);
        if state
            .current
            .as_ref()
            .is_some_and(|current| current.same_task(&handle))
        {
            state.current = None;
        }
        handle.complete(outcome);
    }
}
