//! Filter stage abstraction and lifecycle engine.
//!
//! A [`Filter`] is one stage of a media pipeline (demuxer, decoder, sink,
//! ...). The engine owns the lifecycle state machine and the per-stage
//! [`Task`]; stage-specific behavior plugs in through [`FilterBehavior`].
//!
//! Lifecycle fan-out follows a submit-then-recurse protocol: each call runs
//! as one unit (state check, hook, state transition, then downstream
//! fan-out). In async mode the unit is a one-shot job on the filter's task,
//! so downstream calls are issued only after the local hook has returned,
//! and consecutive lifecycle calls queue in submission order. Results
//! aggregate to the first non-OK outcome; fan-out continues past a failing
//! filter so siblings still receive the call.
//!
//! ERROR is absorbing. Once a filter has failed, every lifecycle call
//! except `release` reports the stored first error, and `change_state`
//! refuses to move the machine anywhere else.

mod arena;
mod factory;

pub use arena::{FilterArena, FilterId};
pub use factory::FilterFactory;

use crate::buffer::{FrameBuffer, StreamType};
use crate::error::{Error, Result};
use crate::event::{CallbackCommand, Event, EventReceiver, EventType, FilterCallback};
use crate::queue::BlockingQueue;
use crate::task::{Task, TaskType};
use smallvec::SmallVec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

/// Upper bound on one `wait_all_state` traversal.
pub(crate) const WAIT_ALL_STATE_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Types
// ============================================================================

/// Role a filter plays in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterType {
    /// Pull or push media source.
    Source,
    /// Container demuxer.
    Demuxer,
    /// Audio decoder.
    AudioDecoder,
    /// Audio encoder.
    AudioEncoder,
    /// Video decoder.
    VideoDecoder,
    /// Video encoder.
    VideoEncoder,
    /// Container muxer.
    Muxer,
    /// Audio render sink.
    AudioSink,
    /// File output sink.
    FileSink,
    /// Microphone/line-in capture.
    AudioCapture,
    /// Camera/screen capture.
    VideoCapture,
}

impl FilterType {
    /// Scheduling lane filters of this type run on.
    pub fn task_type(self) -> TaskType {
        match self {
            FilterType::VideoDecoder | FilterType::VideoEncoder | FilterType::VideoCapture => {
                TaskType::Video
            }
            FilterType::AudioDecoder
            | FilterType::AudioEncoder
            | FilterType::AudioSink
            | FilterType::AudioCapture => TaskType::Audio,
            FilterType::Source | FilterType::Demuxer | FilterType::Muxer | FilterType::FileSink => {
                TaskType::Io
            }
        }
    }
}

/// Lifecycle state of a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterState {
    /// Constructed, dependencies not yet injected.
    Created,
    /// Linked into a pipeline, post-link initialization done.
    Initialized,
    /// Prepare dispatched, resources being allocated.
    Preparing,
    /// Resources allocated, ready to run.
    Ready,
    /// Actively processing buffers.
    Running,
    /// Suspended; resources retained.
    Paused,
    /// Processing stopped; resources retained until release.
    Stopped,
    /// Torn down. Terminal.
    Released,
    /// Failed. Absorbing; only release leaves it.
    Error,
}

impl std::fmt::Display for FilterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Whether a filter processes buffers on its own task or inline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingMode {
    /// Buffer work runs inline on the caller's thread.
    Sync,
    /// Buffer work is submitted to the filter's task.
    Async,
}

// ============================================================================
// Behavior seam
// ============================================================================

/// Data-plane entry point a downstream filter exposes to its upstream.
///
/// `push` must not block: a producer thread parked inside a full
/// downstream stage would stall its own filter's pause/stop. A saturated
/// stage reports [`Error::Again`] and the producer retries or drops.
pub trait InputPort: Send + Sync {
    /// Hand one buffer to this filter without blocking.
    fn push(&self, buffer: FrameBuffer) -> Result<()>;
}

impl InputPort for BlockingQueue<FrameBuffer> {
    fn push(&self, buffer: FrameBuffer) -> Result<()> {
        self.try_push(buffer)
    }
}

/// Stage-specific hooks driven by the filter engine.
///
/// Every hook has a no-op default so simple stages implement only what they
/// need. Hooks run with the behavior lock held; they must not call back
/// into lifecycle methods of their own filter.
#[allow(unused_variables)]
pub trait FilterBehavior: Send {
    /// Runs once after the filter is linked into a pipeline.
    fn do_init_after_link(&mut self, ctx: &FilterContext) -> Result<()> {
        Ok(())
    }
    /// Allocate resources for the negotiated stream parameters.
    fn do_prepare(&mut self, ctx: &FilterContext) -> Result<()> {
        Ok(())
    }
    /// Begin processing.
    fn do_start(&mut self, ctx: &FilterContext) -> Result<()> {
        Ok(())
    }
    /// Suspend processing. The filter's task is already halted.
    fn do_pause(&mut self, ctx: &FilterContext) -> Result<()> {
        Ok(())
    }
    /// Resume after a pause.
    fn do_resume(&mut self, ctx: &FilterContext) -> Result<()> {
        Ok(())
    }
    /// Stop processing. The filter's task is already stopped.
    fn do_stop(&mut self, ctx: &FilterContext) -> Result<()> {
        Ok(())
    }
    /// Discard in-flight data without changing lifecycle state.
    fn do_flush(&mut self, ctx: &FilterContext) -> Result<()> {
        Ok(())
    }
    /// Final teardown.
    fn do_release(&mut self, ctx: &FilterContext) -> Result<()> {
        Ok(())
    }

    /// Process one input buffer. `dropping` is true when the buffer's job
    /// predates the latest flush and its payload must be discarded.
    fn do_process_input_buffer(&mut self, ctx: &FilterContext, dropping: bool) -> Result<()> {
        Ok(())
    }
    /// Process one output buffer. Same `dropping` contract as input.
    fn do_process_output_buffer(&mut self, ctx: &FilterContext, dropping: bool) -> Result<()> {
        Ok(())
    }

    /// An upstream filter linked to this one. Negotiate capabilities and
    /// return the input port the upstream should push buffers into, if any.
    fn on_linked(&mut self, stream: StreamType, ctx: &FilterContext) -> Result<Option<Arc<dyn InputPort>>> {
        Ok(None)
    }
    /// The upstream link was renegotiated; return the (possibly new) port.
    fn on_updated(&mut self, stream: StreamType, ctx: &FilterContext) -> Result<Option<Arc<dyn InputPort>>> {
        Ok(None)
    }
    /// The upstream link was removed.
    fn on_unlinked(&mut self, stream: StreamType, ctx: &FilterContext) -> Result<()> {
        Ok(())
    }

    /// Called on the upstream side with the port its new downstream returned.
    fn bind_output_port(&mut self, stream: StreamType, port: Arc<dyn InputPort>) {}
    /// Called on the upstream side when a downstream link goes away.
    fn unbind_output_port(&mut self, stream: StreamType) {}
}

/// Per-invocation view of a filter handed to behavior hooks and workers.
///
/// Cheap to clone; workers on codec tasks keep one to report events and
/// raise errors without holding any filter lock.
#[derive(Clone)]
pub struct FilterContext {
    name: String,
    filter_type: FilterType,
    filter: Weak<Filter>,
    receiver: Option<Arc<dyn EventReceiver>>,
    callback: Option<Arc<dyn FilterCallback>>,
}

impl FilterContext {
    /// Name of the owning filter.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Type of the owning filter.
    pub fn filter_type(&self) -> FilterType {
        self.filter_type
    }

    /// Post an event upward on behalf of the owning filter.
    pub fn post_event(&self, event_type: EventType) {
        if let Some(receiver) = &self.receiver {
            receiver.on_event(Event::new(self.name.clone(), event_type));
        }
    }

    /// Post an event with an opaque payload.
    pub fn post_event_with_param(&self, event_type: EventType, param: impl std::any::Any + Send) {
        if let Some(receiver) = &self.receiver {
            receiver.on_event(Event::with_param(self.name.clone(), event_type, param));
        }
    }

    /// Move the owning filter to ERROR and report the failure upward.
    pub fn raise_error(&self, error: Error) {
        if let Some(filter) = self.filter.upgrade() {
            filter.set_error(error);
        } else {
            tracing::warn!(filter = %self.name, %error, "error raised on dropped filter");
        }
    }

    /// Ask the owning engine for a graph mutation.
    pub fn request_graph_change(&self, command: CallbackCommand, stream: StreamType) {
        if let Some(callback) = &self.callback {
            callback.on_callback(&self.name, command, stream);
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(name: &str) -> Self {
        Self {
            name: name.into(),
            filter_type: FilterType::AudioDecoder,
            filter: Weak::new(),
            receiver: None,
            callback: None,
        }
    }
}

// ============================================================================
// Filter
// ============================================================================

/// One stage of a media pipeline.
pub struct Filter {
    name: String,
    filter_type: FilterType,
    mode: ProcessingMode,
    id: OnceLock<FilterId>,

    state: Mutex<FilterState>,
    state_cond: Condvar,
    /// First error, kept verbatim; later errors do not overwrite it.
    error: Mutex<Option<Error>>,

    behavior: Mutex<Box<dyn FilterBehavior>>,
    /// Downstream edges, per stream type, in link order.
    links: Mutex<HashMap<StreamType, SmallVec<[FilterId; 2]>>>,
    task: Mutex<Option<Arc<Task>>>,

    receiver: Mutex<Option<Arc<dyn EventReceiver>>>,
    callback: Mutex<Option<Arc<dyn FilterCallback>>>,

    /// Buffer jobs submitted so far.
    job_idx: AtomicU64,
    /// Buffer jobs executed so far.
    process_idx: AtomicU64,
    /// Flush watermark: jobs at or below it execute with `dropping = true`.
    job_idx_base: AtomicU64,
}

impl Filter {
    /// Create an async-mode filter.
    pub fn new(
        name: impl Into<String>,
        filter_type: FilterType,
        behavior: Box<dyn FilterBehavior>,
    ) -> Arc<Self> {
        Self::with_mode(name, filter_type, ProcessingMode::Async, behavior)
    }

    /// Create a filter with an explicit processing mode.
    pub fn with_mode(
        name: impl Into<String>,
        filter_type: FilterType,
        mode: ProcessingMode,
        behavior: Box<dyn FilterBehavior>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            filter_type,
            mode,
            id: OnceLock::new(),
            state: Mutex::new(FilterState::Created),
            state_cond: Condvar::new(),
            error: Mutex::new(None),
            behavior: Mutex::new(behavior),
            links: Mutex::new(HashMap::new()),
            task: Mutex::new(None),
            receiver: Mutex::new(None),
            callback: Mutex::new(None),
            job_idx: AtomicU64::new(0),
            process_idx: AtomicU64::new(0),
            job_idx_base: AtomicU64::new(0),
        })
    }

    /// The filter's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The filter's role.
    pub fn filter_type(&self) -> FilterType {
        self.filter_type
    }

    /// The filter's processing mode.
    pub fn mode(&self) -> ProcessingMode {
        self.mode
    }

    /// Current lifecycle state.
    pub fn state(&self) -> FilterState {
        *self.state.lock().unwrap()
    }

    /// Arena handle, once inserted.
    pub fn id(&self) -> Option<FilterId> {
        self.id.get().copied()
    }

    pub(crate) fn assign_id(&self, id: FilterId) {
        let _ = self.id.set(id);
    }

    /// Downstream edges as `(stream, target)` pairs. Order is stable within
    /// one stream type; across stream types it is unspecified.
    pub fn downstream_ids(&self) -> Vec<(StreamType, FilterId)> {
        let links = self.links.lock().unwrap();
        links
            .iter()
            .flat_map(|(stream, ids)| ids.iter().map(move |id| (*stream, *id)))
            .collect()
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Inject the upward event receiver and engine callback.
    ///
    /// Must be the first call after construction.
    pub fn init(
        &self,
        receiver: Arc<dyn EventReceiver>,
        callback: Arc<dyn FilterCallback>,
    ) -> Result<()> {
        self.expect_state(&[FilterState::Created], "init")?;
        *self.receiver.lock().unwrap() = Some(receiver);
        *self.callback.lock().unwrap() = Some(callback);
        Ok(())
    }

    /// Attach the filter to a pipeline's task group and run post-link
    /// initialization. Async filters get their task here.
    pub fn link_pipeline(self: &Arc<Self>, group_id: &str) -> Result<()> {
        self.expect_state(&[FilterState::Created], "link_pipeline")?;
        if self.receiver.lock().unwrap().is_none() {
            return Err(Error::invalid_op(format!(
                "filter '{}': init must precede link_pipeline",
                self.name
            )));
        }

        if self.mode == ProcessingMode::Async {
            let task = Arc::new(Task::new(
                self.name.clone(),
                self.filter_type.task_type(),
                group_id,
            ));
            *self.task.lock().unwrap() = Some(task);
        }

        self.dispatch_once("link_pipeline", |f| {
            let r = f.behavior.lock().unwrap().do_init_after_link(&f.context());
            r?;
            f.change_state(FilterState::Initialized);
            Ok(())
        })
    }

    /// Allocate resources, fan out to downstream filters, and move to READY.
    ///
    /// The whole step (state check, `do_prepare`, READY transition, then
    /// downstream fan-out) runs as one unit: on the filter's task in async
    /// mode, inline in sync mode. Downstream prepare is issued only after
    /// the local hook has returned, and a prepare issued right after
    /// [`Filter::link_pipeline`] queues behind the post-link init job on the
    /// same task. Async callers observe completion through
    /// [`Filter::wait_all_state`] or the READY event. Refused outright from
    /// ERROR.
    pub fn prepare(self: &Arc<Self>, arena: &Arc<FilterArena>) -> Result<()> {
        if self.state() == FilterState::Error {
            return Err(self.stored_error());
        }
        self.dispatch(arena, "prepare", |f, arena| f.prepare_inner(arena))
    }

    fn prepare_inner(self: &Arc<Self>, arena: &Arc<FilterArena>) -> Result<()> {
        if self.is_settled(&[FilterState::Preparing, FilterState::Ready]) {
            return self.fan_out(arena, |child, arena| child.prepare(arena));
        }

        let local = match self.expect_state(&[FilterState::Initialized], "prepare") {
            Err(e) => Err(e),
            Ok(()) => {
                self.change_state(FilterState::Preparing);
                let r = self.behavior.lock().unwrap().do_prepare(&self.context());
                match r {
                    Ok(()) => {
                        self.change_state(FilterState::Ready);
                        self.emit_event(EventType::Ready, None);
                        Ok(())
                    }
                    Err(e) => {
                        self.set_error(e.clone());
                        Err(e)
                    }
                }
            }
        };

        let children = self.fan_out(arena, |child, arena| child.prepare(arena));
        local.and(children)
    }

    /// Begin processing and fan out. Queues behind earlier lifecycle jobs
    /// in async mode, so start issued right after prepare runs once the
    /// filter is READY.
    pub fn start(self: &Arc<Self>, arena: &Arc<FilterArena>) -> Result<()> {
        if self.state() == FilterState::Error {
            return Err(self.stored_error());
        }
        self.dispatch(arena, "start", |f, arena| f.start_inner(arena))
    }

    fn start_inner(self: &Arc<Self>, arena: &Arc<FilterArena>) -> Result<()> {
        if self.is_settled(&[FilterState::Running]) {
            return self.fan_out(arena, |child, arena| child.start(arena));
        }

        let local = match self.expect_state(&[FilterState::Ready], "start") {
            Err(e) => Err(e),
            Ok(()) => {
                let r = self.behavior.lock().unwrap().do_start(&self.context());
                match r {
                    Ok(()) => {
                        self.change_state(FilterState::Running);
                        if let Some(task) = self.current_task() {
                            task.start();
                        }
                        Ok(())
                    }
                    Err(e) => {
                        self.set_error(e.clone());
                        Err(e)
                    }
                }
            }
        };

        let children = self.fan_out(arena, |child, arena| child.start(arena));
        local.and(children)
    }

    /// Suspend processing.
    ///
    /// The filter's task is paused synchronously before the hook runs and
    /// before fan-out, so no local buffer job is in flight afterwards.
    pub fn pause(self: &Arc<Self>, arena: &Arc<FilterArena>) -> Result<()> {
        if self.is_settled(&[FilterState::Paused]) {
            return self.fan_out(arena, |child, arena| child.pause(arena));
        }

        let local = if self.state() == FilterState::Error {
            self.halt_task();
            Err(self.stored_error())
        } else {
            match self.expect_state(&[FilterState::Running], "pause") {
                Err(e) => Err(e),
                Ok(()) => {
                    self.halt_task();
                    let r = self.behavior.lock().unwrap().do_pause(&self.context());
                    match r {
                        Ok(()) => {
                            self.change_state(FilterState::Paused);
                            Ok(())
                        }
                        Err(e) => {
                            self.set_error(e.clone());
                            Err(e)
                        }
                    }
                }
            }
        };

        let children = self.fan_out(arena, |child, arena| child.pause(arena));
        local.and(children)
    }

    /// Resume after a pause.
    pub fn resume(self: &Arc<Self>, arena: &Arc<FilterArena>) -> Result<()> {
        if self.state() == FilterState::Error {
            return Err(self.stored_error());
        }
        self.dispatch(arena, "resume", |f, arena| f.resume_inner(arena))
    }

    fn resume_inner(self: &Arc<Self>, arena: &Arc<FilterArena>) -> Result<()> {
        if self.is_settled(&[FilterState::Running]) {
            return self.fan_out(arena, |child, arena| child.resume(arena));
        }

        let local = match self.expect_state(&[FilterState::Paused], "resume") {
            Err(e) => Err(e),
            Ok(()) => {
                let r = self.behavior.lock().unwrap().do_resume(&self.context());
                match r {
                    Ok(()) => {
                        self.change_state(FilterState::Running);
                        if let Some(task) = self.current_task() {
                            task.start();
                        }
                        Ok(())
                    }
                    Err(e) => {
                        self.set_error(e.clone());
                        Err(e)
                    }
                }
            }
        };

        let children = self.fan_out(arena, |child, arena| child.resume(arena));
        local.and(children)
    }

    /// Stop processing.
    ///
    /// The filter's task is stopped synchronously (joining its thread)
    /// before the hook runs. Fan-out proceeds even when this filter is in
    /// ERROR so downstream filters still stop.
    pub fn stop(self: &Arc<Self>, arena: &Arc<FilterArena>) -> Result<()> {
        if self.is_settled(&[FilterState::Stopped, FilterState::Released]) {
            return self.fan_out(arena, |child, arena| child.stop(arena));
        }

        let local = if self.state() == FilterState::Error {
            self.halt_task();
            Err(self.stored_error())
        } else {
            match self.expect_state(
                &[FilterState::Ready, FilterState::Running, FilterState::Paused],
                "stop",
            ) {
                Err(e) => Err(e),
                Ok(()) => {
                    self.halt_task();
                    let r = self.behavior.lock().unwrap().do_stop(&self.context());
                    match r {
                        Ok(()) => {
                            self.change_state(FilterState::Stopped);
                            Ok(())
                        }
                        Err(e) => {
                            self.set_error(e.clone());
                            Err(e)
                        }
                    }
                }
            }
        };

        let children = self.fan_out(arena, |child, arena| child.stop(arena));
        local.and(children)
    }

    /// Tear the filter down. Allowed from any state, including ERROR.
    pub fn release(self: &Arc<Self>, arena: &Arc<FilterArena>) -> Result<()> {
        if self.is_settled(&[FilterState::Released]) {
            return self.fan_out(arena, |child, arena| child.release(arena));
        }

        if let Some(task) = self.task.lock().unwrap().take() {
            task.stop();
        }
        let local = self.behavior.lock().unwrap().do_release(&self.context());
        if let Err(e) = &local {
            tracing::warn!(filter = %self.name, error = %e, "release hook failed");
        }
        {
            // release leaves even ERROR; bypass the pinning in change_state.
            let mut state = self.state.lock().unwrap();
            *state = FilterState::Released;
            self.state_cond.notify_all();
        }

        let children = self.fan_out(arena, |child, arena| child.release(arena));
        local.and(children)
    }

    /// Discard in-flight data without changing lifecycle state.
    ///
    /// Downstream filters flush first so they are ready to drop whatever is
    /// still traveling toward them; then the flush watermark moves up to the
    /// latest submitted job, marking every not-yet-executed buffer job
    /// stale; then the local hook runs.
    pub fn flush(self: &Arc<Self>, arena: &Arc<FilterArena>) -> Result<()> {
        if self.state() == FilterState::Error {
            return Err(self.stored_error());
        }

        let children = self.fan_out(arena, |child, arena| child.flush(arena));

        self.job_idx_base
            .store(self.job_idx.load(Ordering::SeqCst), Ordering::SeqCst);

        let local = {
            let r = self.behavior.lock().unwrap().do_flush(&self.context());
            match r {
                Ok(()) => {
                    self.emit_event(EventType::Flushed, None);
                    Ok(())
                }
                Err(e) => {
                    self.set_error(e.clone());
                    Err(e)
                }
            }
        };

        local.and(children)
    }

    // ------------------------------------------------------------------------
    // Buffer jobs
    // ------------------------------------------------------------------------

    /// Schedule one input-buffer processing round, optionally delayed.
    ///
    /// Async mode requires the task, so this fails before `link_pipeline`
    /// and after the task has been stopped. The job decides at execution
    /// time whether it is stale: a flush that lands between submission and
    /// execution turns it into a drop.
    pub fn process_input_buffer(self: &Arc<Self>, delay: Duration) -> Result<()> {
        self.submit_buffer_job(delay, |behavior, ctx, dropping| {
            behavior.do_process_input_buffer(ctx, dropping)
        })
    }

    /// Schedule one output-buffer processing round, optionally delayed.
    pub fn process_output_buffer(self: &Arc<Self>, delay: Duration) -> Result<()> {
        self.submit_buffer_job(delay, |behavior, ctx, dropping| {
            behavior.do_process_output_buffer(ctx, dropping)
        })
    }

    fn submit_buffer_job<F>(self: &Arc<Self>, delay: Duration, hook: F) -> Result<()>
    where
        F: Fn(&mut dyn FilterBehavior, &FilterContext, bool) -> Result<()> + Send + 'static,
    {
        self.job_idx.fetch_add(1, Ordering::SeqCst);

        match self.mode {
            ProcessingMode::Async => {
                let task = self.current_task().ok_or_else(|| {
                    Error::invalid_op(format!("filter '{}' has no task", self.name))
                })?;
                let f = Arc::clone(self);
                task.submit_delayed(
                    move || {
                        f.run_buffer_job(&hook);
                    },
                    delay,
                )
            }
            ProcessingMode::Sync => {
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
                self.run_buffer_job(&hook);
                Ok(())
            }
        }
    }

    fn run_buffer_job<F>(self: &Arc<Self>, hook: &F)
    where
        F: Fn(&mut dyn FilterBehavior, &FilterContext, bool) -> Result<()>,
    {
        let idx = self.process_idx.fetch_add(1, Ordering::SeqCst) + 1;
        let dropping = idx <= self.job_idx_base.load(Ordering::SeqCst);
        if dropping {
            tracing::debug!(filter = %self.name, idx, "dropping stale buffer job");
        }
        let ctx = self.context();
        let r = hook(&mut **self.behavior.lock().unwrap(), &ctx, dropping);
        if let Err(e) = r {
            if e.is_transient() {
                tracing::debug!(filter = %self.name, error = %e, "transient buffer error");
            } else {
                self.set_error(e);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Waiting
    // ------------------------------------------------------------------------

    /// Block until this filter and everything downstream reach `target`.
    ///
    /// Returns the stored error for a filter that failed instead, and
    /// [`Error::TimedOut`] if the subtree does not settle within the bound.
    pub fn wait_all_state(
        self: &Arc<Self>,
        arena: &Arc<FilterArena>,
        target: FilterState,
    ) -> Result<()> {
        self.wait_all_state_within(arena, target, WAIT_ALL_STATE_TIMEOUT)
    }

    /// [`Filter::wait_all_state`] with an explicit per-filter bound.
    pub fn wait_all_state_within(
        self: &Arc<Self>,
        arena: &Arc<FilterArena>,
        target: FilterState,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let local = self.wait_state_until(target, deadline);
        let children = self.fan_out(arena, |child, arena| {
            child.wait_all_state_within(arena, target, timeout)
        });
        local.and(children)
    }

    fn wait_state_until(&self, target: FilterState, deadline: Instant) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        while *state != target && *state != FilterState::Error {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::TimedOut);
            }
            let (s, _) = self.state_cond.wait_timeout(state, remaining).unwrap();
            state = s;
        }
        if *state == FilterState::Error && target != FilterState::Error {
            drop(state);
            Err(self.stored_error())
        } else {
            Ok(())
        }
    }

    // ------------------------------------------------------------------------
    // Graph edges
    // ------------------------------------------------------------------------

    /// Link `next` downstream of this filter for `stream`.
    ///
    /// Negotiation runs on the downstream filter via
    /// [`FilterBehavior::on_linked`]; the port it returns is bound to this
    /// filter's output side. Rejects links that would close a cycle.
    pub fn link_next(
        self: &Arc<Self>,
        arena: &Arc<FilterArena>,
        next: FilterId,
        stream: StreamType,
    ) -> Result<()> {
        let self_id = self
            .id()
            .ok_or_else(|| Error::invalid_op(format!("filter '{}' not in an arena", self.name)))?;
        if arena.reaches(next, self_id) {
            return Err(Error::InvalidParameter(format!(
                "linking '{}' would create a cycle",
                self.name
            )));
        }
        let next_filter = arena
            .get(next)
            .ok_or_else(|| Error::InvalidParameter("unknown downstream filter id".into()))?;

        let port = {
            let ctx = next_filter.context();
            next_filter.behavior.lock().unwrap().on_linked(stream, &ctx)?
        };

        {
            let mut links = self.links.lock().unwrap();
            let targets = links.entry(stream).or_default();
            if !targets.contains(&next) {
                targets.push(next);
            }
        }
        if let Some(port) = port {
            self.behavior.lock().unwrap().bind_output_port(stream, port);
        }
        tracing::debug!(from = %self.name, to = %next_filter.name, ?stream, "linked");
        Ok(())
    }

    /// Renegotiate an existing downstream link.
    pub fn update_next(
        self: &Arc<Self>,
        arena: &Arc<FilterArena>,
        next: FilterId,
        stream: StreamType,
    ) -> Result<()> {
        {
            let links = self.links.lock().unwrap();
            if !links.get(&stream).is_some_and(|t| t.contains(&next)) {
                return Err(Error::InvalidParameter(format!(
                    "filter '{}' has no {stream:?} link to update",
                    self.name
                )));
            }
        }
        let next_filter = arena
            .get(next)
            .ok_or_else(|| Error::InvalidParameter("unknown downstream filter id".into()))?;

        let port = {
            let ctx = next_filter.context();
            next_filter.behavior.lock().unwrap().on_updated(stream, &ctx)?
        };
        if let Some(port) = port {
            self.behavior.lock().unwrap().bind_output_port(stream, port);
        }
        Ok(())
    }

    /// Remove a downstream link.
    pub fn unlink_next(
        self: &Arc<Self>,
        arena: &Arc<FilterArena>,
        next: FilterId,
        stream: StreamType,
    ) -> Result<()> {
        let removed = {
            let mut links = self.links.lock().unwrap();
            match links.get_mut(&stream) {
                Some(targets) => {
                    let before = targets.len();
                    targets.retain(|id| *id != next);
                    targets.len() != before
                }
                None => false,
            }
        };
        if !removed {
            return Err(Error::InvalidParameter(format!(
                "filter '{}' has no {stream:?} link to remove",
                self.name
            )));
        }

        if let Some(next_filter) = arena.get(next) {
            let ctx = next_filter.context();
            next_filter
                .behavior
                .lock()
                .unwrap()
                .on_unlinked(stream, &ctx)?;
        }
        self.behavior.lock().unwrap().unbind_output_port(stream);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // State machine internals
    // ------------------------------------------------------------------------

    /// Sole mutator of the lifecycle state. ERROR is pinned: once entered,
    /// only `release` (which bypasses this) leaves it.
    pub(crate) fn change_state(&self, new: FilterState) {
        let mut state = self.state.lock().unwrap();
        if *state == FilterState::Error && new != FilterState::Error {
            return;
        }
        if *state != new {
            tracing::debug!(filter = %self.name, from = %*state, to = %new, "state change");
            *state = new;
            self.state_cond.notify_all();
        }
    }

    /// Record the first error, pin the state machine to ERROR, and emit
    /// EVENT_ERROR upward.
    pub(crate) fn set_error(&self, error: Error) {
        {
            let mut stored = self.error.lock().unwrap();
            if stored.is_none() {
                *stored = Some(error.clone());
            }
        }
        tracing::error!(filter = %self.name, %error, "filter error");
        self.change_state(FilterState::Error);
        self.emit_event(EventType::Error, Some(Box::new(error)));
    }

    fn stored_error(&self) -> Error {
        self.error
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| Error::invalid_op(format!("filter '{}' is in error", self.name)))
    }

    fn emit_event(&self, event_type: EventType, param: Option<Box<dyn std::any::Any + Send>>) {
        let receiver = self.receiver.lock().unwrap().clone();
        if let Some(receiver) = receiver {
            receiver.on_event(Event {
                src_filter: self.name.clone(),
                event_type,
                param,
            });
        }
    }

    fn context(self: &Arc<Self>) -> FilterContext {
        FilterContext {
            name: self.name.clone(),
            filter_type: self.filter_type,
            filter: Arc::downgrade(self),
            receiver: self.receiver.lock().unwrap().clone(),
            callback: self.callback.lock().unwrap().clone(),
        }
    }

    fn current_task(&self) -> Option<Arc<Task>> {
        self.task.lock().unwrap().clone()
    }

    fn halt_task(&self) {
        if let Some(task) = self.current_task() {
            task.pause();
        }
    }

    fn is_settled(&self, states: &[FilterState]) -> bool {
        states.contains(&self.state())
    }

    fn expect_state(&self, allowed: &[FilterState], op: &str) -> Result<()> {
        let s = self.state();
        if s == FilterState::Error {
            return Err(self.stored_error());
        }
        if allowed.contains(&s) {
            Ok(())
        } else {
            Err(Error::invalid_op(format!(
                "cannot {op} filter '{}' from {s}",
                self.name
            )))
        }
    }

    /// Run one lifecycle step, fan-out included: as a one-shot job on the
    /// filter's task in async mode, inline in sync mode. One-shot jobs run
    /// in submission order, so consecutive lifecycle calls execute in the
    /// order they were issued.
    fn dispatch<F>(
        self: &Arc<Self>,
        arena: &Arc<FilterArena>,
        op: &'static str,
        step: F,
    ) -> Result<()>
    where
        F: FnOnce(&Arc<Filter>, &Arc<FilterArena>) -> Result<()> + Send + 'static,
    {
        match self.mode {
            ProcessingMode::Async => {
                let task = self.current_task().ok_or_else(|| {
                    Error::invalid_op(format!("filter '{}': no task for {op}", self.name))
                })?;
                let f = Arc::clone(self);
                let a = Arc::clone(arena);
                task.submit_once(move || {
                    if let Err(e) = step(&f, &a) {
                        tracing::debug!(filter = %f.name, error = %e, "{op} not applied");
                    }
                })
            }
            ProcessingMode::Sync => step(self, arena),
        }
    }

    /// Dispatch a lifecycle hook with no fan-out: one-shot task job in
    /// async mode, inline in sync mode. Hook failures move the filter to
    /// ERROR either way.
    fn dispatch_once<F>(self: &Arc<Self>, op: &'static str, hook: F) -> Result<()>
    where
        F: FnOnce(&Arc<Filter>) -> Result<()> + Send + 'static,
    {
        match self.mode {
            ProcessingMode::Async => {
                let task = self.current_task().ok_or_else(|| {
                    Error::invalid_op(format!("filter '{}': no task for {op}", self.name))
                })?;
                let f = Arc::clone(self);
                task.submit_once(move || {
                    if let Err(e) = hook(&f) {
                        f.set_error(e);
                    }
                })
            }
            ProcessingMode::Sync => hook(self).map_err(|e| {
                self.set_error(e.clone());
                e
            }),
        }
    }

    fn fan_out<F>(&self, arena: &Arc<FilterArena>, mut call: F) -> Result<()>
    where
        F: FnMut(&Arc<Filter>, &Arc<FilterArena>) -> Result<()>,
    {
        let mut result = Ok(());
        for (_, id) in self.downstream_ids() {
            let Some(child) = arena.get(id) else { continue };
            if let Err(e) = call(&child, arena) {
                tracing::debug!(filter = %self.name, child = %child.name, error = %e, "fan-out error");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }
}

impl std::fmt::Debug for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filter")
            .field("name", &self.name)
            .field("filter_type", &self.filter_type)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct NullReceiver;
    impl EventReceiver for NullReceiver {
        fn on_event(&self, _event: Event) {}
    }

    struct NullCallback;
    impl FilterCallback for NullCallback {
        fn on_callback(&self, _: &str, _: CallbackCommand, _: StreamType) {}
    }

    #[derive(Default)]
    struct Recorder {
        calls: Arc<Mutex<Vec<&'static str>>>,
        drops: Arc<Mutex<Vec<bool>>>,
        fail_on: Option<&'static str>,
    }

    impl FilterBehavior for Recorder {
        fn do_prepare(&mut self, _ctx: &FilterContext) -> Result<()> {
            self.calls.lock().unwrap().push("prepare");
            if self.fail_on == Some("prepare") {
                return Err(Error::Plugin("prepare failed".into()));
            }
            Ok(())
        }
        fn do_start(&mut self, _ctx: &FilterContext) -> Result<()> {
            self.calls.lock().unwrap().push("start");
            if self.fail_on == Some("start") {
                return Err(Error::Plugin("start failed".into()));
            }
            Ok(())
        }
        fn do_stop(&mut self, _ctx: &FilterContext) -> Result<()> {
            self.calls.lock().unwrap().push("stop");
            Ok(())
        }
        fn do_flush(&mut self, _ctx: &FilterContext) -> Result<()> {
            self.calls.lock().unwrap().push("flush");
            Ok(())
        }
        fn do_process_input_buffer(&mut self, _ctx: &FilterContext, dropping: bool) -> Result<()> {
            self.drops.lock().unwrap().push(dropping);
            Ok(())
        }
    }

    fn wire(filter: &Arc<Filter>) {
        filter
            .init(Arc::new(NullReceiver), Arc::new(NullCallback))
            .unwrap();
    }

    #[test]
    fn test_sync_lifecycle_happy_path() {
        let arena = FilterArena::new();
        let recorder = Recorder::default();
        let calls = Arc::clone(&recorder.calls);
        let filter = Filter::with_mode(
            "src",
            FilterType::Source,
            ProcessingMode::Sync,
            Box::new(recorder),
        );
        arena.insert(Arc::clone(&filter));
        wire(&filter);

        filter.link_pipeline("g0").unwrap();
        assert_eq!(filter.state(), FilterState::Initialized);
        filter.prepare(&arena).unwrap();
        assert_eq!(filter.state(), FilterState::Ready);
        filter.start(&arena).unwrap();
        assert_eq!(filter.state(), FilterState::Running);
        filter.pause(&arena).unwrap();
        assert_eq!(filter.state(), FilterState::Paused);
        filter.resume(&arena).unwrap();
        filter.stop(&arena).unwrap();
        assert_eq!(filter.state(), FilterState::Stopped);
        filter.release(&arena).unwrap();
        assert_eq!(filter.state(), FilterState::Released);

        assert_eq!(
            *calls.lock().unwrap(),
            vec!["prepare", "start", "stop"]
        );
    }

    #[test]
    fn test_start_from_created_is_invalid() {
        let arena = FilterArena::new();
        let filter = Filter::with_mode(
            "src",
            FilterType::Source,
            ProcessingMode::Sync,
            Box::new(Recorder::default()),
        );
        arena.insert(Arc::clone(&filter));
        wire(&filter);
        assert!(matches!(
            filter.start(&arena),
            Err(Error::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_error_is_absorbing() {
        let arena = FilterArena::new();
        let recorder = Recorder {
            fail_on: Some("prepare"),
            ..Default::default()
        };
        let filter = Filter::with_mode(
            "adec",
            FilterType::AudioDecoder,
            ProcessingMode::Sync,
            Box::new(recorder),
        );
        arena.insert(Arc::clone(&filter));
        wire(&filter);
        filter.link_pipeline("g0").unwrap();

        assert!(filter.prepare(&arena).is_err());
        assert_eq!(filter.state(), FilterState::Error);

        // Subsequent calls report the stored first error.
        assert_eq!(
            filter.start(&arena),
            Err(Error::Plugin("prepare failed".into()))
        );
        filter.change_state(FilterState::Running);
        assert_eq!(filter.state(), FilterState::Error);

        // Release still works and leaves ERROR.
        filter.release(&arena).unwrap();
        assert_eq!(filter.state(), FilterState::Released);
    }

    #[test]
    fn test_async_prepare_reaches_ready() {
        let arena = FilterArena::new();
        let filter = Filter::new("vdec", FilterType::VideoDecoder, Box::new(Recorder::default()));
        arena.insert(Arc::clone(&filter));
        wire(&filter);
        filter.link_pipeline("g0").unwrap();
        filter.prepare(&arena).unwrap();
        filter.wait_all_state(&arena, FilterState::Ready).unwrap();
        assert_eq!(filter.state(), FilterState::Ready);
    }

    #[test]
    fn test_flush_drops_pending_buffer_jobs() {
        let arena = FilterArena::new();
        let recorder = Recorder::default();
        let drops = Arc::clone(&recorder.drops);
        let filter = Filter::new("adec", FilterType::AudioDecoder, Box::new(recorder));
        arena.insert(Arc::clone(&filter));
        wire(&filter);
        filter.link_pipeline("g0").unwrap();
        filter.prepare(&arena).unwrap();
        filter.wait_all_state(&arena, FilterState::Ready).unwrap();

        // Task is not running yet: jobs queue up but do not execute.
        for _ in 0..3 {
            filter.process_input_buffer(Duration::ZERO).unwrap();
        }
        filter.flush(&arena).unwrap();

        // One more submitted after the flush; it must survive.
        filter.process_input_buffer(Duration::ZERO).unwrap();

        filter.start(&arena).unwrap();
        filter.wait_all_state(&arena, FilterState::Running).unwrap();
        std::thread::sleep(Duration::from_millis(100));

        assert_eq!(*drops.lock().unwrap(), vec![true, true, true, false]);
    }

    #[test]
    fn test_fan_out_continues_past_failing_child() {
        let arena = FilterArena::new();
        let parent = Filter::with_mode(
            "demux",
            FilterType::Demuxer,
            ProcessingMode::Sync,
            Box::new(Recorder::default()),
        );
        let bad = Filter::with_mode(
            "adec",
            FilterType::AudioDecoder,
            ProcessingMode::Sync,
            Box::new(Recorder {
                fail_on: Some("prepare"),
                ..Default::default()
            }),
        );
        let good_recorder = Recorder::default();
        let good_calls = Arc::clone(&good_recorder.calls);
        let good = Filter::with_mode(
            "vdec",
            FilterType::VideoDecoder,
            ProcessingMode::Sync,
            Box::new(good_recorder),
        );

        let parent_id = arena.insert(Arc::clone(&parent));
        let bad_id = arena.insert(Arc::clone(&bad));
        let good_id = arena.insert(Arc::clone(&good));
        assert_eq!(parent_id.index(), 0);

        for f in [&parent, &bad, &good] {
            wire(f);
            f.link_pipeline("g0").unwrap();
        }
        parent
            .link_next(&arena, bad_id, StreamType::EncodedAudio)
            .unwrap();
        parent
            .link_next(&arena, good_id, StreamType::EncodedVideo)
            .unwrap();

        assert!(parent.prepare(&arena).is_err());
        assert_eq!(bad.state(), FilterState::Error);
        assert_eq!(good.state(), FilterState::Ready);
        assert!(good_calls.lock().unwrap().contains(&"prepare"));
    }

    #[test]
    fn test_cycle_link_rejected() {
        let arena = FilterArena::new();
        let a = Filter::with_mode(
            "a",
            FilterType::Source,
            ProcessingMode::Sync,
            Box::new(Recorder::default()),
        );
        let b = Filter::with_mode(
            "b",
            FilterType::FileSink,
            ProcessingMode::Sync,
            Box::new(Recorder::default()),
        );
        let a_id = arena.insert(Arc::clone(&a));
        let b_id = arena.insert(Arc::clone(&b));
        wire(&a);
        wire(&b);

        a.link_next(&arena, b_id, StreamType::RawVideo).unwrap();
        assert!(matches!(
            b.link_next(&arena, a_id, StreamType::RawVideo),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            a.link_next(&arena, a_id, StreamType::RawVideo),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_link_binds_downstream_port() {
        struct QueueSink {
            queue: Arc<BlockingQueue<FrameBuffer>>,
        }
        impl FilterBehavior for QueueSink {
            fn on_linked(
                &mut self,
                _stream: StreamType,
                _ctx: &FilterContext,
            ) -> Result<Option<Arc<dyn InputPort>>> {
                Ok(Some(Arc::clone(&self.queue) as Arc<dyn InputPort>))
            }
        }
        #[derive(Default)]
        struct PortHolder {
            bound: Arc<AtomicUsize>,
        }
        impl FilterBehavior for PortHolder {
            fn bind_output_port(&mut self, _stream: StreamType, port: Arc<dyn InputPort>) {
                self.bound.fetch_add(1, Ordering::SeqCst);
                port.push(FrameBuffer::new(vec![7], Default::default()))
                    .unwrap();
            }
        }

        let arena = FilterArena::new();
        let queue = Arc::new(BlockingQueue::new("sink-in", 4));
        let holder = PortHolder::default();
        let bound = Arc::clone(&holder.bound);

        let up = Filter::with_mode(
            "demux",
            FilterType::Demuxer,
            ProcessingMode::Sync,
            Box::new(holder),
        );
        let down = Filter::with_mode(
            "asink",
            FilterType::AudioSink,
            ProcessingMode::Sync,
            Box::new(QueueSink {
                queue: Arc::clone(&queue),
            }),
        );
        arena.insert(Arc::clone(&up));
        let down_id = arena.insert(Arc::clone(&down));
        wire(&up);
        wire(&down);

        up.link_next(&arena, down_id, StreamType::RawAudio).unwrap();
        assert_eq!(bound.load(Ordering::SeqCst), 1);
        assert_eq!(queue.try_pop().unwrap().data(), &[7]);
    }

    #[test]
    fn test_downstream_prepare_waits_for_upstream_hook() {
        struct Marking {
            log: Arc<Mutex<Vec<&'static str>>>,
            begin: &'static str,
            end: &'static str,
            work: Duration,
        }
        impl FilterBehavior for Marking {
            fn do_prepare(&mut self, _ctx: &FilterContext) -> Result<()> {
                self.log.lock().unwrap().push(self.begin);
                std::thread::sleep(self.work);
                self.log.lock().unwrap().push(self.end);
                Ok(())
            }
        }

        let arena = FilterArena::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let up = Filter::new(
            "demux",
            FilterType::Demuxer,
            Box::new(Marking {
                log: Arc::clone(&log),
                begin: "up-begin",
                end: "up-end",
                work: Duration::from_millis(80),
            }),
        );
        let down = Filter::new(
            "adec",
            FilterType::AudioDecoder,
            Box::new(Marking {
                log: Arc::clone(&log),
                begin: "down-begin",
                end: "down-end",
                work: Duration::ZERO,
            }),
        );
        arena.insert(Arc::clone(&up));
        let down_id = arena.insert(Arc::clone(&down));
        for f in [&up, &down] {
            wire(f);
            f.link_pipeline("g0").unwrap();
        }
        up.link_next(&arena, down_id, StreamType::EncodedAudio)
            .unwrap();

        up.prepare(&arena).unwrap();
        up.wait_all_state(&arena, FilterState::Ready).unwrap();

        // The downstream hook may only run once the upstream one returned.
        assert_eq!(
            *log.lock().unwrap(),
            vec!["up-begin", "up-end", "down-begin", "down-end"]
        );
    }

    #[test]
    fn test_async_lifecycle_calls_queue_in_order() {
        let arena = FilterArena::new();
        let filter = Filter::new("vdec", FilterType::VideoDecoder, Box::new(Recorder::default()));
        arena.insert(Arc::clone(&filter));
        wire(&filter);

        // Issued back to back with no waits in between: each step queues
        // behind the previous one's job on the same task.
        filter.link_pipeline("g0").unwrap();
        filter.prepare(&arena).unwrap();
        filter.start(&arena).unwrap();

        filter.wait_all_state(&arena, FilterState::Running).unwrap();
        assert_eq!(filter.state(), FilterState::Running);
    }

    #[test]
    fn test_queue_port_is_nonblocking_when_full() {
        let queue: Arc<BlockingQueue<FrameBuffer>> = Arc::new(BlockingQueue::new("q", 1));
        let port = Arc::clone(&queue) as Arc<dyn InputPort>;
        port.push(FrameBuffer::new(vec![1], Default::default()))
            .unwrap();
        assert_eq!(
            port.push(FrameBuffer::new(vec![2], Default::default())),
            Err(Error::Again)
        );
    }

    #[test]
    fn test_wait_all_state_timeout_is_distinct_from_error() {
        let arena = FilterArena::new();
        let stuck = Filter::with_mode(
            "src",
            FilterType::Source,
            ProcessingMode::Sync,
            Box::new(Recorder::default()),
        );
        arena.insert(Arc::clone(&stuck));
        wire(&stuck);
        stuck.link_pipeline("g0").unwrap();

        // Never prepared: the bounded wait expires.
        assert_eq!(
            stuck.wait_all_state_within(&arena, FilterState::Ready, Duration::from_millis(50)),
            Err(Error::TimedOut)
        );

        // A failed filter reports its stored error, not a timeout.
        let bad = Filter::with_mode(
            "adec",
            FilterType::AudioDecoder,
            ProcessingMode::Sync,
            Box::new(Recorder {
                fail_on: Some("prepare"),
                ..Default::default()
            }),
        );
        arena.insert(Arc::clone(&bad));
        wire(&bad);
        bad.link_pipeline("g0").unwrap();
        assert!(bad.prepare(&arena).is_err());
        assert_eq!(
            bad.wait_all_state_within(&arena, FilterState::Ready, Duration::from_millis(50)),
            Err(Error::Plugin("prepare failed".into()))
        );
    }
}
