//! Cancellable move tasks and the serial executor that runs them.
//!
//! A [`MoveTask`] is the handle returned by every move, reference and
//! orchestrated transition.  Callers get it immediately and may poll it,
//! await it, or cancel it.
//!
//! # State machine
//!
//! ```text
//!   Running ──────────────► Finished (outcome = work result)
//!      │
//!      └──► Cancelled ────► Finished (outcome = Err(Cancelled))
//! ```
//!
//! Every transition happens under the task's mutex.  A task that reaches
//! `Finished` before `cancel` is called keeps its own outcome and `cancel`
//! returns `false`.
//!
//! Cancellation is cooperative: it marks the task, then cancels every
//! sub-task currently recorded in its [`TaskContext`].  Work already handed to
//! hardware runs to completion; the cancelled outcome is reported once the
//! work returns.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use cryomove_types::MoveError;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Cancelled,
    Finished,
}

type Outcome = Option<Result<(), MoveError>>;

struct Control {
    state: TaskState,
    running: Vec<MoveTask>,
}

struct Shared {
    id: Uuid,
    label: String,
    control: Mutex<Control>,
    outcome: watch::Sender<Outcome>,
}

/// Handle to one in-flight (or finished) operation.
#[derive(Clone)]
pub struct MoveTask {
    shared: Arc<Shared>,
}

impl MoveTask {
    /// A running task with no work attached.  Whoever creates it must
    /// eventually call [`MoveTask::finish`].
    pub fn new(label: impl Into<String>) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                id: Uuid::new_v4(),
                label: label.into(),
                control: Mutex::new(Control {
                    state: TaskState::Running,
                    running: Vec::new(),
                }),
                outcome,
            }),
        }
    }

    /// An already successful task.
    pub fn completed(label: impl Into<String>) -> Self {
        let task = Self::new(label);
        task.finish(Ok(()));
        task
    }

    /// An already failed task, used to report validation errors through the
    /// same channel as execution errors.
    pub fn failed(label: impl Into<String>, err: MoveError) -> Self {
        let task = Self::new(label);
        task.finish(Err(err));
        task
    }

    /// Run `work` on the current tokio runtime as a new task.
    ///
    /// When no runtime is available the returned task has already failed with
    /// [`MoveError::InvalidConfiguration`].
    pub fn spawn<F, Fut>(label: impl Into<String>, work: F) -> Self
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), MoveError>> + Send + 'static,
    {
        let task = Self::new(label);
        match Handle::try_current() {
            Ok(handle) => {
                let job: Job = Box::new(move |ctx| work(ctx).boxed());
                handle.spawn(run_job(task.clone(), job));
            }
            Err(_) => {
                task.finish(Err(MoveError::InvalidConfiguration(format!(
                    "no async runtime available to run '{}'",
                    task.label()
                ))));
            }
        }
        task
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    pub fn state(&self) -> TaskState {
        self.control().state
    }

    pub fn is_done(&self) -> bool {
        self.shared.outcome.borrow().is_some()
    }

    /// The outcome, if the task has finished.
    pub fn try_result(&self) -> Option<Result<(), MoveError>> {
        self.shared.outcome.borrow().clone()
    }

    /// Request cancellation.
    ///
    /// Returns `false` if the task had already finished.  Otherwise marks it
    /// cancelled and cancels every recorded running sub-task.
    pub fn cancel(&self) -> bool {
        let running = {
            let mut ctl = self.control();
            match ctl.state {
                TaskState::Finished => return false,
                TaskState::Cancelled => return true,
                TaskState::Running => {
                    ctl.state = TaskState::Cancelled;
                    std::mem::take(&mut ctl.running)
                }
            }
        };
        debug!(task = %self.label(), id = %self.id(), subs = running.len(), "cancelling task");
        for sub in running {
            sub.cancel();
        }
        true
    }

    /// Terminate the task with `result`.
    ///
    /// A cancelled task always ends with `Err(Cancelled)` whatever `result`
    /// is.  Returns `false` if the task had already finished.
    pub fn finish(&self, result: Result<(), MoveError>) -> bool {
        let mut ctl = self.control();
        let outcome = match ctl.state {
            TaskState::Finished => return false,
            TaskState::Cancelled => Err(MoveError::Cancelled),
            TaskState::Running => result,
        };
        ctl.state = TaskState::Finished;
        ctl.running.clear();
        self.shared.outcome.send_replace(Some(outcome));
        true
    }

    /// Wait for the task to finish and return its outcome.
    pub async fn wait(&self) -> Result<(), MoveError> {
        let mut rx = self.shared.outcome.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().unwrap_or(Err(MoveError::Cancelled)),
            Err(_) => Err(MoveError::Cancelled),
        }
    }

    /// Like [`MoveTask::wait`] but gives up after `limit`.
    ///
    /// # Errors
    ///
    /// [`MoveError::Timeout`] when the task is still running after `limit`.
    /// The task itself is left untouched.
    pub async fn wait_timeout(&self, limit: Duration) -> Result<(), MoveError> {
        match tokio::time::timeout(limit, self.wait()).await {
            Ok(result) => result,
            Err(_) => Err(MoveError::Timeout {
                operation: self.label().to_string(),
                seconds: limit.as_secs_f64(),
            }),
        }
    }

    fn control(&self) -> MutexGuard<'_, Control> {
        self.shared
            .control
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for MoveTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MoveTask")
            .field("id", &self.id())
            .field("label", &self.label())
            .field("state", &self.state())
            .finish()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// TaskContext
// ────────────────────────────────────────────────────────────────────────────

/// Handed to the work of a task; the cancellation token of that task.
pub struct TaskContext {
    task: MoveTask,
}

impl TaskContext {
    pub fn task(&self) -> &MoveTask {
        &self.task
    }

    pub fn is_cancelled(&self) -> bool {
        self.task.state() == TaskState::Cancelled
    }

    /// # Errors
    ///
    /// [`MoveError::Cancelled`] once the owning task has been cancelled.
    pub fn check_cancelled(&self) -> Result<(), MoveError> {
        if self.is_cancelled() {
            Err(MoveError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Start a sub-task and record it so cancelling the owner cancels it too.
    ///
    /// The cancellation check and the recording happen under the owner's
    /// lock, so a sub-task is either never started or always reachable by
    /// `cancel`.
    ///
    /// # Errors
    ///
    /// [`MoveError::Cancelled`] if the owner is already cancelled; `start` is
    /// not called in that case.
    pub fn dispatch(&self, start: impl FnOnce() -> MoveTask) -> Result<MoveTask, MoveError> {
        let mut ctl = self.task.control();
        if ctl.state != TaskState::Running {
            return Err(MoveError::Cancelled);
        }
        let sub = start();
        ctl.running.push(sub.clone());
        Ok(sub)
    }

    /// Record an already started sub-task, whatever the owner's state.
    pub fn attach(&self, sub: MoveTask) -> MoveTask {
        let mut ctl = self.task.control();
        if ctl.state == TaskState::Running {
            ctl.running.push(sub.clone());
        }
        sub
    }

    /// Await a recorded sub-task, then forget it.
    pub async fn wait(&self, sub: &MoveTask) -> Result<(), MoveError> {
        let result = sub.wait().await;
        self.forget(sub);
        result
    }

    /// Dispatch, await, then check for cancellation.
    pub async fn run(&self, start: impl FnOnce() -> MoveTask) -> Result<(), MoveError> {
        let sub = self.dispatch(start)?;
        self.wait(&sub).await?;
        self.check_cancelled()
    }

    fn forget(&self, sub: &MoveTask) {
        self.task.control().running.retain(|t| t.id() != sub.id());
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SerialExecutor
// ────────────────────────────────────────────────────────────────────────────

type Job = Box<dyn FnOnce(TaskContext) -> BoxFuture<'static, Result<(), MoveError>> + Send>;

async fn run_job(task: MoveTask, job: Job) {
    if task.state() == TaskState::Cancelled {
        task.finish(Err(MoveError::Cancelled));
        return;
    }
    let ctx = TaskContext { task: task.clone() };
    let result = AssertUnwindSafe(job(ctx))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| {
            error!(task = %task.label(), "task work panicked");
            Err(MoveError::HardwareFault {
                component: task.label().to_string(),
                details: "task work panicked".to_string(),
            })
        });
    task.finish(result);
}

/// Single-worker queue: at most one job runs at a time, in submission order.
///
/// Each composite actuator owns one, so at most one logical move (and its
/// cascade of child moves) is in flight per actuator.
pub struct SerialExecutor {
    name: String,
    tx: Mutex<Option<mpsc::UnboundedSender<(MoveTask, Job)>>>,
    active: Arc<Mutex<Vec<MoveTask>>>,
}

impl SerialExecutor {
    /// Start the worker on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// [`MoveError::InvalidConfiguration`] when called outside a runtime.
    pub fn new(name: impl Into<String>) -> Result<Self, MoveError> {
        let name = name.into();
        let handle = Handle::try_current().map_err(|_| {
            MoveError::InvalidConfiguration(format!("{name}: no async runtime available"))
        })?;

        let (tx, mut rx) = mpsc::unbounded_channel::<(MoveTask, Job)>();
        let active: Arc<Mutex<Vec<MoveTask>>> = Arc::new(Mutex::new(Vec::new()));
        let worker_active = Arc::clone(&active);
        handle.spawn(async move {
            while let Some((task, job)) = rx.recv().await {
                run_job(task.clone(), job).await;
                worker_active
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .retain(|t| t.id() != task.id());
            }
        });

        Ok(Self {
            name,
            tx: Mutex::new(Some(tx)),
            active,
        })
    }

    /// Queue `work` and return its task handle immediately.
    pub fn submit<F, Fut>(&self, label: impl Into<String>, work: F) -> MoveTask
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), MoveError>> + Send + 'static,
    {
        let task = MoveTask::new(label);
        let job: Job = Box::new(move |ctx| work(ctx).boxed());

        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        let queued = match tx.as_ref() {
            Some(tx) => {
                self.lock_active().push(task.clone());
                tx.send((task.clone(), job)).is_ok()
            }
            None => false,
        };
        drop(tx);

        if !queued {
            self.lock_active().retain(|t| t.id() != task.id());
            task.finish(Err(MoveError::UnsupportedOperation {
                actuator: self.name.clone(),
                details: "executor is shut down".to_string(),
            }));
        }
        task
    }

    /// Cancel every queued and running task. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let tasks = self.lock_active().clone();
        let count = tasks.iter().filter(|t| t.cancel()).count();
        if count > 0 {
            debug!(executor = %self.name, count, "cancelled queued tasks");
        }
        count
    }

    /// Cancel everything and refuse further submissions.
    pub fn shutdown(&self) {
        self.cancel_all();
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    fn lock_active(&self) -> MutexGuard<'_, Vec<MoveTask>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Semaphore;

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn ready_made_tasks_are_finished() {
        assert_eq!(MoveTask::completed("noop").wait().await, Ok(()));
        let t = MoveTask::failed("bad", MoveError::SafetyCheckFailed("x".into()));
        assert_eq!(t.state(), TaskState::Finished);
        assert!(matches!(t.wait().await, Err(MoveError::SafetyCheckFailed(_))));
    }

    #[tokio::test]
    async fn finish_before_cancel_reports_completion() {
        let t = MoveTask::new("move");
        assert!(t.finish(Ok(())));
        assert!(!t.cancel());
        assert_eq!(t.try_result(), Some(Ok(())));
    }

    #[tokio::test]
    async fn cancel_before_start_skips_work() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let t = MoveTask::spawn("transition", move |_ctx| async move {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        assert!(t.cancel());
        assert_eq!(t.wait().await, Err(MoveError::Cancelled));
        assert_eq!(t.state(), TaskState::Finished);
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancel_propagates_to_running_sub_task() {
        let sub = MoveTask::new("leg");
        let inner = sub.clone();
        let parent = MoveTask::spawn("transition", move |ctx| async move {
            ctx.run(|| inner).await
        });
        settle().await;

        assert!(parent.cancel());
        assert_eq!(sub.state(), TaskState::Cancelled);
        // The hardware finishes the leg anyway.
        sub.finish(Ok(()));

        assert_eq!(sub.wait().await, Err(MoveError::Cancelled));
        assert_eq!(parent.wait().await, Err(MoveError::Cancelled));
        assert_eq!(parent.state(), TaskState::Finished);
    }

    #[tokio::test]
    async fn dispatch_refuses_after_cancel() {
        let started = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&started);
        let parent = MoveTask::spawn("transition", move |ctx| async move {
            ctx.task().cancel();
            ctx.dispatch(|| {
                flag.store(true, Ordering::SeqCst);
                MoveTask::completed("leg")
            })?;
            Ok(())
        });
        assert_eq!(parent.wait().await, Err(MoveError::Cancelled));
        assert!(!started.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn wait_timeout_reports_timeout() {
        let t = MoveTask::new("stuck");
        let err = t.wait_timeout(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, MoveError::Timeout { ref operation, .. } if operation == "stuck"));
        assert_eq!(t.state(), TaskState::Running);
    }

    #[tokio::test]
    async fn executor_runs_jobs_in_submission_order() {
        let exec = SerialExecutor::new("test").unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let tasks: Vec<MoveTask> = (0..3)
            .map(|i| {
                let order = Arc::clone(&order);
                exec.submit(format!("job{i}"), move |_ctx| async move {
                    tokio::time::sleep(Duration::from_millis(3 - i)).await;
                    order.lock().unwrap().push(i);
                    Ok(())
                })
            })
            .collect();
        for t in &tasks {
            t.wait().await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn cancel_all_skips_queued_and_marks_running() {
        let exec = SerialExecutor::new("test").unwrap();
        let gate = Arc::new(Semaphore::new(0));
        let second_ran = Arc::new(AtomicBool::new(false));

        let g = Arc::clone(&gate);
        let first = exec.submit("first", move |_ctx| async move {
            let _permit = g.acquire().await;
            Ok(())
        });
        let flag = Arc::clone(&second_ran);
        let second = exec.submit("second", move |_ctx| async move {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        settle().await;

        assert_eq!(exec.cancel_all(), 2);
        gate.add_permits(1);

        assert_eq!(first.wait().await, Err(MoveError::Cancelled));
        assert_eq!(second.wait().await, Err(MoveError::Cancelled));
        assert!(!second_ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn shut_down_executor_rejects_work() {
        let exec = SerialExecutor::new("wheel").unwrap();
        exec.shutdown();
        let t = exec.submit("late", |_ctx| async { Ok(()) });
        assert!(matches!(
            t.wait().await,
            Err(MoveError::UnsupportedOperation { .. })
        ));
    }

    #[tokio::test]
    async fn panicking_work_becomes_hardware_fault() {
        let t = MoveTask::spawn("boom", |_ctx| async {
            if true {
                panic!("driver crashed");
            }
            Ok(())
        });
        assert!(matches!(t.wait().await, Err(MoveError::HardwareFault { .. })));
    }

    #[test]
    fn executor_needs_a_runtime() {
        assert!(matches!(
            SerialExecutor::new("orphan"),
            Err(MoveError::InvalidConfiguration(_))
        ));
        let t = MoveTask::spawn("orphan", |_ctx| async { Ok(()) });
        assert!(matches!(t.try_result(), Some(Err(MoveError::InvalidConfiguration(_)))));
    }
}
