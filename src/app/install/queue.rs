use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::app::dispatch::{UiDispatcher, UiMessage};
use crate::app::install::driver::{DriverState, DriverUpdate};
use crate::app::install::process::ProcessHandle;
use crate::app::install::task::{CancelFlag, InstallTask};
use crate::app::log_sink::LogSink;
use crate::app::models::{Credentials, TaskSnapshot, TaskStatus};

/// Everything a worker needs to run one task, plus the channel back into the queue.
pub struct TaskContext {
    pub task_id: String,
    pub package_path: String,
    pub credentials: Credentials,
    pub cancel: CancelFlag,
    pub trace_id: String,
    shared: Arc<Shared>,
}

impl TaskContext {
    /// Applies a non-terminal update to the task and forwards it to the UI.
    pub fn update(&self, update: &DriverUpdate) {
        let mut state = self.shared.lock();
        if let Some(task) = state.find_mut(&self.task_id) {
            if task.status.is_terminal() {
                return;
            }
            task.status = update.state.task_status();
            task.set_progress(update.progress);
            task.detail = update.detail.clone();
            self.shared.dispatcher.post(UiMessage::TaskUpdated(task.snapshot()));
        }
    }

    /// Registers the running helper so `cancel` can reach it. A cancel that
    /// arrived before the helper existed is applied immediately.
    pub fn attach_process(&self, handle: ProcessHandle) {
        {
            let mut state = self.shared.lock();
            if let Some(task) = state.find_mut(&self.task_id) {
                task.process_handle = Some(Arc::clone(&handle));
            }
        }
        if self.cancel.is_requested() {
            handle.terminate();
        }
    }

    pub fn log_sink(&self) -> Option<&Arc<LogSink>> {
        self.shared.log_sink.as_ref()
    }
}

/// Runs a promoted task to completion on the calling worker thread and
/// returns its terminal update.
pub trait TaskRunner: Send + Sync {
    fn run(&self, context: &TaskContext) -> DriverUpdate;
}

#[derive(Default)]
struct QueueState {
    tasks: Vec<InstallTask>,
    active: Option<String>,
}

impl QueueState {
    fn index_of(&self, task_id: &str) -> Option<usize> {
        self.tasks.iter().position(|task| task.id == task_id)
    }

    fn find_mut(&mut self, task_id: &str) -> Option<&mut InstallTask> {
        self.tasks.iter_mut().find(|task| task.id == task_id)
    }

    fn snapshots(&self) -> Vec<TaskSnapshot> {
        self.tasks.iter().map(InstallTask::snapshot).collect()
    }

    fn is_idle(&self) -> bool {
        self.active.is_none()
            && !self
                .tasks
                .iter()
                .any(|task| task.status == TaskStatus::Pending)
    }
}

struct Shared {
    state: Mutex<QueueState>,
    idle: Condvar,
    dispatcher: Arc<dyn UiDispatcher>,
    runner: Arc<dyn TaskRunner>,
    log_sink: Option<Arc<LogSink>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().expect("install queue lock poisoned")
    }

    fn post_queue(&self, state: &QueueState) {
        self.dispatcher.post(UiMessage::QueueChanged(state.snapshots()));
    }
}

/// Serializes installs: at most one task is `Installing` at a time, the rest
/// wait in submission order unless reordered. All list mutation happens under
/// one lock, so the pending order is never observed half-updated.
#[derive(Clone)]
pub struct InstallQueueManager {
    shared: Arc<Shared>,
}

impl InstallQueueManager {
    pub fn new(runner: Arc<dyn TaskRunner>, dispatcher: Arc<dyn UiDispatcher>) -> Self {
        Self::build(runner, dispatcher, None)
    }

    pub fn with_log_sink(
        runner: Arc<dyn TaskRunner>,
        dispatcher: Arc<dyn UiDispatcher>,
        log_sink: Arc<LogSink>,
    ) -> Self {
        Self::build(runner, dispatcher, Some(log_sink))
    }

    fn build(
        runner: Arc<dyn TaskRunner>,
        dispatcher: Arc<dyn UiDispatcher>,
        log_sink: Option<Arc<LogSink>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                idle: Condvar::new(),
                dispatcher,
                runner,
                log_sink,
            }),
        }
    }

    pub fn enqueue(&self, task: InstallTask) -> String {
        let task_id = task.id.clone();
        {
            let mut state = self.shared.lock();
            info!(task_id = %task_id, package = %task.package_path, "install enqueued");
            state.tasks.push(task);
            self.shared.post_queue(&state);
        }
        Self::start_next(&self.shared);
        task_id
    }

    pub fn snapshot(&self) -> Vec<TaskSnapshot> {
        self.shared.lock().snapshots()
    }

    pub fn move_up(&self, task_id: &str) -> bool {
        self.reorder(task_id, true)
    }

    pub fn move_down(&self, task_id: &str) -> bool {
        self.reorder(task_id, false)
    }

    /// Swaps with the nearest pending task in the given direction; running and
    /// finished tasks keep their rows.
    fn reorder(&self, task_id: &str, up: bool) -> bool {
        let mut state = self.shared.lock();
        let Some(index) = state.index_of(task_id) else {
            return false;
        };
        if state.tasks[index].status != TaskStatus::Pending {
            return false;
        }
        let is_pending = |task: &InstallTask| task.status == TaskStatus::Pending;
        let neighbor = if up {
            state.tasks[..index].iter().rposition(is_pending)
        } else {
            state.tasks[index + 1..]
                .iter()
                .position(is_pending)
                .map(|offset| index + 1 + offset)
        };
        let Some(neighbor) = neighbor else {
            return false;
        };
        state.tasks.swap(index, neighbor);
        self.shared.post_queue(&state);
        true
    }

    /// Pending tasks are dropped outright. An installing task is only flagged;
    /// the worker settles it into `Canceled`.
    pub fn cancel(&self, task_id: &str) -> bool {
        let handle = {
            let mut state = self.shared.lock();
            let Some(index) = state.index_of(task_id) else {
                return false;
            };
            match state.tasks[index].status {
                TaskStatus::Pending => {
                    let mut task = state.tasks.remove(index);
                    task.status = TaskStatus::Canceled;
                    task.request_cancel();
                    info!(task_id = %task_id, "pending install removed");
                    self.shared.post_queue(&state);
                    self.shared.idle.notify_all();
                    return true;
                }
                TaskStatus::Installing => {
                    let task = &mut state.tasks[index];
                    task.request_cancel();
                    self.shared
                        .dispatcher
                        .post(UiMessage::TaskUpdated(task.snapshot()));
                    info!(task_id = %task_id, "cancel requested for running install");
                    task.process_handle.clone()
                }
                TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Canceled => return false,
            }
        };
        // Termination waits out a grace period; keep it off the caller's thread.
        if let Some(handle) = handle {
            thread::spawn(move || handle.terminate());
        }
        true
    }

    /// Drops finished rows from the list.
    pub fn clear_finished(&self) -> usize {
        let mut state = self.shared.lock();
        let before = state.tasks.len();
        state.tasks.retain(|task| !task.status.is_terminal());
        let removed = before - state.tasks.len();
        if removed > 0 {
            self.shared.post_queue(&state);
        }
        removed
    }

    pub fn is_idle(&self) -> bool {
        self.shared.lock().is_idle()
    }

    /// Blocks until nothing is installing or pending. Not for the event loop.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let state = self.shared.lock();
        let (state, _) = self
            .shared
            .idle
            .wait_timeout_while(state, timeout, |state| !state.is_idle())
            .expect("install queue lock poisoned");
        state.is_idle()
    }

    fn start_next(shared: &Arc<Shared>) {
        let context = {
            let mut state = shared.lock();
            if state.active.is_some() {
                return;
            }
            let Some(task) = state
                .tasks
                .iter_mut()
                .find(|task| task.status == TaskStatus::Pending)
            else {
                shared.idle.notify_all();
                return;
            };
            task.status = TaskStatus::Installing;
            task.detail = "Starting…".to_string();
            let context = TaskContext {
                task_id: task.id.clone(),
                package_path: task.package_path.clone(),
                credentials: task.credentials.clone(),
                cancel: task.cancel_flag(),
                trace_id: task.id.clone(),
                shared: Arc::clone(shared),
            };
            shared.dispatcher.post(UiMessage::TaskUpdated(task.snapshot()));
            state.active = Some(context.task_id.clone());
            context
        };

        info!(task_id = %context.task_id, "install started");
        let worker_shared = Arc::clone(shared);
        let task_id = context.task_id.clone();
        let spawned = thread::Builder::new()
            .name("install-worker".to_string())
            .spawn(move || {
                let runner = Arc::clone(&worker_shared.runner);
                let outcome = catch_unwind(AssertUnwindSafe(|| runner.run(&context)));
                let last = outcome.unwrap_or_else(|_| {
                    error!(task_id = %context.task_id, "install worker panicked");
                    if let Some(sink) = &worker_shared.log_sink {
                        sink.note(&format!("Install task crashed: {}", context.task_id));
                    }
                    DriverUpdate {
                        state: DriverState::Failed,
                        progress: None,
                        detail: "Internal error".to_string(),
                    }
                });
                Self::finish(&worker_shared, &context.task_id, last);
            });
        if let Err(err) = spawned {
            warn!(task_id = %task_id, error = %err, "failed to start install worker");
            Self::finish(
                shared,
                &task_id,
                DriverUpdate {
                    state: DriverState::Failed,
                    progress: None,
                    detail: "Internal error".to_string(),
                },
            );
        }
    }

    fn finish(shared: &Arc<Shared>, task_id: &str, last: DriverUpdate) {
        {
            let mut state = shared.lock();
            if let Some(task) = state.find_mut(task_id) {
                let status = if task.cancel_requested() && !last.state.is_terminal() {
                    TaskStatus::Canceled
                } else if last.state.is_terminal() {
                    last.state.task_status()
                } else {
                    TaskStatus::Failed
                };
                task.status = status;
                task.set_progress(last.progress);
                if status == TaskStatus::Succeeded {
                    task.progress = Some(1.0);
                }
                task.detail = last.detail;
                task.process_handle = None;
                shared.dispatcher.post(UiMessage::TaskUpdated(task.snapshot()));
                info!(task_id = %task_id, status = status.label(), "install settled");
            }
            if state.active.as_deref() == Some(task_id) {
                state.active = None;
            }
            shared.post_queue(&state);
        }
        Self::start_next(shared);
    }
}
