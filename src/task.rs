//! Cancellable per-stage worker task.
//!
//! Each async-mode filter owns one [`Task`]: a dedicated thread with a job
//! queue. Jobs come in two flavors:
//!
//! - one-shot jobs (`submit_once`) run regardless of the task's run state,
//!   used for setup work like post-link initialization
//! - queued jobs (`submit` / `submit_delayed`) run only while the task is
//!   running, used for buffer-processing work
//!
//! `pause` and `stop` are blocking with respect to the in-flight job: when
//! they return, no job is executing and none will start until the task is
//! resumed. Callers rely on this for deadlock-free teardown.

use crate::error::{Error, Result};
use std::collections::{BinaryHeap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Scheduling lane a task belongs to.
///
/// Stages of different kinds get different lanes so a heavy video stage
/// cannot starve audio. With one OS thread per task this is a tag for
/// naming/diagnostics rather than a shared-scheduler assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskType {
    /// Video decode/encode lane.
    Video,
    /// Audio lane, kept isolated from video work.
    Audio,
    /// Source/sink I/O lane.
    Io,
    /// Everything else (muxers, one-off stages).
    Single,
}

type Job = Box<dyn FnOnce() + Send>;

/// Run state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Paused,
    Running,
    Stopped,
}

struct DelayedJob {
    due: Instant,
    seq: u64,
    job: Job,
}

// BinaryHeap is a max-heap; reverse ordering yields earliest-due first, with
// submission order breaking ties.
impl PartialEq for DelayedJob {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}
impl Eq for DelayedJob {}
impl PartialOrd for DelayedJob {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for DelayedJob {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (other.due, other.seq).cmp(&(self.due, self.seq))
    }
}

struct TaskState {
    run_state: RunState,
    /// One-shot jobs; run even while paused.
    once_jobs: VecDeque<Job>,
    /// Queued (possibly delayed) jobs; run only while running.
    jobs: BinaryHeap<DelayedJob>,
    /// A job is currently executing on the worker thread.
    active: bool,
    next_seq: u64,
}

struct TaskInner {
    name: String,
    state: Mutex<TaskState>,
    work_cond: Condvar,
    idle_cond: Condvar,
}

/// A cancellable unit of execution backing one async filter stage.
pub struct Task {
    inner: Arc<TaskInner>,
    task_type: TaskType,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Task {
    /// Create a task; the worker thread starts immediately in the paused
    /// state. `group_id` tags the thread name for diagnostics.
    pub fn new(name: impl Into<String>, task_type: TaskType, group_id: &str) -> Self {
        let name = name.into();
        let thread_name = if group_id.is_empty() {
            name.clone()
        } else {
            format!("{group_id}/{name}")
        };

        let inner = Arc::new(TaskInner {
            name: thread_name.clone(),
            state: Mutex::new(TaskState {
                run_state: RunState::Paused,
                once_jobs: VecDeque::new(),
                jobs: BinaryHeap::new(),
                active: false,
                next_seq: 0,
            }),
            work_cond: Condvar::new(),
            idle_cond: Condvar::new(),
        });

        let worker = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || worker_loop(worker))
            .expect("failed to spawn task thread");

        Self {
            inner,
            task_type,
            thread: Mutex::new(Some(handle)),
        }
    }

    /// The task's scheduling lane.
    pub fn task_type(&self) -> TaskType {
        self.task_type
    }

    /// Submit a one-shot job that runs even while the task is paused.
    pub fn submit_once(&self, job: impl FnOnce() + Send + 'static) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        if state.run_state == RunState::Stopped {
            return Err(Error::invalid_op(format!(
                "task '{}' is stopped",
                self.inner.name
            )));
        }
        state.once_jobs.push_back(Box::new(job));
        self.inner.work_cond.notify_one();
        Ok(())
    }

    /// Submit a queued job, executed once the task is running.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> Result<()> {
        self.submit_delayed(job, Duration::ZERO)
    }

    /// Submit a queued job that becomes due after `delay`.
    pub fn submit_delayed(&self, job: impl FnOnce() + Send + 'static, delay: Duration) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        if state.run_state == RunState::Stopped {
            return Err(Error::invalid_op(format!(
                "task '{}' is stopped",
                self.inner.name
            )));
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.jobs.push(DelayedJob {
            due: Instant::now() + delay,
            seq,
            job: Box::new(job),
        });
        self.inner.work_cond.notify_one();
        Ok(())
    }

    /// Begin (or resume) executing queued jobs.
    pub fn start(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if state.run_state != RunState::Stopped {
            state.run_state = RunState::Running;
            self.inner.work_cond.notify_one();
        }
    }

    /// Pause queued-job execution.
    ///
    /// Blocks until the in-flight job, if any, has finished. After return no
    /// queued job executes until [`Task::start`] is called again.
    pub fn pause(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if state.run_state == RunState::Running {
            state.run_state = RunState::Paused;
        }
        self.inner.work_cond.notify_one();
        while state.active {
            state = self.inner.idle_cond.wait(state).unwrap();
        }
    }

    /// Stop the task permanently.
    ///
    /// Blocks until the in-flight job has finished, then joins the worker
    /// thread. Remaining queued jobs are discarded. Idempotent.
    pub fn stop(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.run_state = RunState::Stopped;
            self.inner.work_cond.notify_one();
            while state.active {
                state = self.inner.idle_cond.wait(state).unwrap();
            }
            state.once_jobs.clear();
            state.jobs.clear();
        }
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// True once the task has been stopped.
    pub fn is_stopped(&self) -> bool {
        self.inner.state.lock().unwrap().run_state == RunState::Stopped
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.inner.name)
            .field("task_type", &self.task_type)
            .finish()
    }
}

fn worker_loop(inner: Arc<TaskInner>) {
    tracing::debug!(task = %inner.name, "task thread started");
    let mut state = inner.state.lock().unwrap();
    loop {
        if state.run_state == RunState::Stopped {
            break;
        }

        // One-shot jobs run regardless of run state.
        if let Some(job) = state.once_jobs.pop_front() {
            state.active = true;
            drop(state);
            job();
            state = inner.state.lock().unwrap();
            state.active = false;
            inner.idle_cond.notify_all();
            continue;
        }

        if state.run_state == RunState::Running {
            let now = Instant::now();
            let next_due = state.jobs.peek().map(|j| j.due);
            match next_due {
                Some(due) if due <= now => {
                    let job = state.jobs.pop().unwrap().job;
                    state.active = true;
                    drop(state);
                    job();
                    state = inner.state.lock().unwrap();
                    state.active = false;
                    inner.idle_cond.notify_all();
                    continue;
                }
                Some(due) => {
                    let (s, _) = inner
                        .work_cond
                        .wait_timeout(state, due.saturating_duration_since(now))
                        .unwrap();
                    state = s;
                    continue;
                }
                None => {}
            }
        }

        state = inner.work_cond.wait(state).unwrap();
    }
    drop(state);
    tracing::debug!(task = %inner.name, "task thread finished");
}
