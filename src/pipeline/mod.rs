//! Pipeline: the DAG container driving filter lifecycles.
//!
//! A pipeline owns a [`FilterArena`] and a set of head filters. Lifecycle
//! calls fan out from the heads through the downstream edges; results
//! aggregate to the first failure while every reachable filter still gets
//! the call.
//!
//! The pipeline sits between its filters and the engine as an event relay:
//! filter READY events are aggregated into one pipeline-level READY once
//! every filter has reported in, ERROR is forwarded immediately, and
//! everything else passes through untouched.

use crate::error::{Error, Result};
use crate::event::{Event, EventReceiver, EventType, FilterCallback};
use crate::filter::{Filter, FilterArena, FilterId, FilterState};
use crate::buffer::StreamType;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Container and lifecycle driver for a filter graph.
pub struct Pipeline {
    name: String,
    arena: Arc<FilterArena>,
    heads: Mutex<Vec<FilterId>>,
    group_id: Mutex<String>,
    receiver: Mutex<Option<Arc<dyn EventReceiver>>>,
    callback: Mutex<Option<Arc<dyn FilterCallback>>>,
    /// Filters that reported READY since the last prepare.
    ready_count: AtomicUsize,
    initialized: AtomicBool,
    /// Set by start/resume, cleared by pause/stop/release. Graph mutation
    /// is refused while it holds.
    running: AtomicBool,
}

impl Pipeline {
    /// Create an empty pipeline.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            arena: FilterArena::new(),
            heads: Mutex::new(Vec::new()),
            group_id: Mutex::new(String::new()),
            receiver: Mutex::new(None),
            callback: Mutex::new(None),
            ready_count: AtomicUsize::new(0),
            initialized: AtomicBool::new(false),
            running: AtomicBool::new(false),
        })
    }

    /// The pipeline's name. Also the source name of aggregated events.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The arena all of this pipeline's filters live in.
    pub fn arena(&self) -> &Arc<FilterArena> {
        &self.arena
    }

    /// Number of filters currently in the pipeline.
    pub fn filter_count(&self) -> usize {
        self.arena.len()
    }

    /// Inject the upward event receiver and the engine callback.
    ///
    /// Must be the first call on a new pipeline; every other operation
    /// fails until it has happened.
    pub fn init(
        &self,
        receiver: Arc<dyn EventReceiver>,
        callback: Arc<dyn FilterCallback>,
        group_id: &str,
    ) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Err(Error::invalid_op(format!(
                "pipeline '{}' already initialized",
                self.name
            )));
        }
        *self.receiver.lock().unwrap() = Some(receiver);
        *self.callback.lock().unwrap() = Some(callback);
        *self.group_id.lock().unwrap() = group_id.to_string();
        Ok(())
    }

    fn check_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::invalid_op(format!(
                "pipeline '{}' not initialized",
                self.name
            )))
        }
    }

    fn check_not_running(&self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            Err(Error::invalid_op(format!(
                "pipeline '{}' is running; pause or stop before changing the graph",
                self.name
            )))
        } else {
            Ok(())
        }
    }

    /// Wire one filter into this pipeline: events route through the
    /// pipeline, the engine callback passes straight through.
    fn adopt(self: &Arc<Self>, filter: &Arc<Filter>) -> Result<FilterId> {
        let callback = self
            .callback
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::invalid_op("pipeline callback missing"))?;
        let id = self.arena.insert(Arc::clone(filter));
        filter.init(Arc::clone(self) as Arc<dyn EventReceiver>, callback)?;
        filter.link_pipeline(&self.group_id.lock().unwrap())?;
        Ok(id)
    }

    /// Add filters at the head of the graph (sources, demuxer).
    ///
    /// Refused while the pipeline is running.
    pub fn add_head_filters(self: &Arc<Self>, filters: Vec<Arc<Filter>>) -> Result<Vec<FilterId>> {
        self.check_initialized()?;
        self.check_not_running()?;
        let mut ids = Vec::with_capacity(filters.len());
        for filter in &filters {
            let id = self.adopt(filter)?;
            self.heads.lock().unwrap().push(id);
            ids.push(id);
        }
        Ok(ids)
    }

    /// Remove a head filter from the graph.
    pub fn remove_head_filter(&self, id: FilterId) -> Result<()> {
        self.check_initialized()?;
        let mut heads = self.heads.lock().unwrap();
        let before = heads.len();
        heads.retain(|h| *h != id);
        if heads.len() == before {
            return Err(Error::InvalidParameter("not a head filter".into()));
        }
        drop(heads);
        self.arena.remove(id);
        Ok(())
    }

    /// Add `filters` to the pipeline and link them downstream of `pre` for
    /// `stream`. Negotiation runs on each new filter as it is linked.
    ///
    /// Refused while the pipeline is running.
    pub fn link_filters(
        self: &Arc<Self>,
        pre: FilterId,
        filters: Vec<Arc<Filter>>,
        stream: StreamType,
    ) -> Result<Vec<FilterId>> {
        self.check_initialized()?;
        self.check_not_running()?;
        if filters.is_empty() {
            return Err(Error::InvalidParameter("no filters to link".into()));
        }
        let pre_filter = self
            .arena
            .get(pre)
            .ok_or_else(|| Error::InvalidParameter("unknown upstream filter id".into()))?;

        let mut ids = Vec::with_capacity(filters.len());
        for filter in &filters {
            let id = self.adopt(filter)?;
            pre_filter.link_next(&self.arena, id, stream)?;
            ids.push(id);
        }
        Ok(ids)
    }

    /// Renegotiate existing links from `pre` to `nexts`.
    pub fn update_filters(
        &self,
        pre: FilterId,
        nexts: &[FilterId],
        stream: StreamType,
    ) -> Result<()> {
        self.check_initialized()?;
        let pre_filter = self
            .arena
            .get(pre)
            .ok_or_else(|| Error::InvalidParameter("unknown upstream filter id".into()))?;
        for next in nexts {
            pre_filter.update_next(&self.arena, *next, stream)?;
        }
        Ok(())
    }

    /// Unlink `nexts` from `pre` and drop them from the pipeline.
    pub fn unlink_filters(
        &self,
        pre: FilterId,
        nexts: &[FilterId],
        stream: StreamType,
    ) -> Result<()> {
        self.check_initialized()?;
        let pre_filter = self
            .arena
            .get(pre)
            .ok_or_else(|| Error::InvalidParameter("unknown upstream filter id".into()))?;
        for next in nexts {
            pre_filter.unlink_next(&self.arena, *next, stream)?;
            self.arena.remove(*next);
        }
        Ok(())
    }

    fn for_each_head<F>(&self, mut call: F) -> Result<()>
    where
        F: FnMut(&Arc<Filter>) -> Result<()>,
    {
        self.check_initialized()?;
        let heads = self.heads.lock().unwrap().clone();
        let mut result = Ok(());
        for id in heads {
            let Some(filter) = self.arena.get(id) else { continue };
            if let Err(e) = call(&filter) {
                tracing::debug!(pipeline = %self.name, filter = %filter.name(), error = %e, "head fan-out error");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Prepare every filter reachable from the heads.
    ///
    /// Resets READY aggregation; the pipeline reports one READY event once
    /// every filter in the arena has reached READY. An empty pipeline
    /// prepares trivially.
    pub fn prepare(&self) -> Result<()> {
        self.ready_count.store(0, Ordering::SeqCst);
        self.for_each_head(|f| f.prepare(&self.arena))
    }

    /// Start every filter reachable from the heads.
    pub fn start(&self) -> Result<()> {
        self.check_initialized()?;
        self.running.store(true, Ordering::SeqCst);
        self.for_each_head(|f| f.start(&self.arena))
    }

    /// Pause every filter reachable from the heads.
    pub fn pause(&self) -> Result<()> {
        let r = self.for_each_head(|f| f.pause(&self.arena));
        self.running.store(false, Ordering::SeqCst);
        r
    }

    /// Resume every filter reachable from the heads.
    pub fn resume(&self) -> Result<()> {
        self.check_initialized()?;
        self.running.store(true, Ordering::SeqCst);
        self.for_each_head(|f| f.resume(&self.arena))
    }

    /// Stop every filter reachable from the heads.
    pub fn stop(&self) -> Result<()> {
        let r = self.for_each_head(|f| f.stop(&self.arena));
        self.running.store(false, Ordering::SeqCst);
        r
    }

    /// Flush in-flight data across the graph.
    pub fn flush(&self) -> Result<()> {
        self.for_each_head(|f| f.flush(&self.arena))
    }

    /// Release every filter reachable from the heads.
    pub fn release(&self) -> Result<()> {
        let r = self.for_each_head(|f| f.release(&self.arena));
        self.running.store(false, Ordering::SeqCst);
        r
    }

    /// Block until every filter reachable from the heads is in `target`.
    pub fn wait_all_state(&self, target: FilterState) -> Result<()> {
        self.for_each_head(|f| f.wait_all_state(&self.arena, target))
    }

    fn forward(&self, event: Event) {
        let receiver = self.receiver.lock().unwrap().clone();
        if let Some(receiver) = receiver {
            receiver.on_event(event);
        }
    }
}

impl EventReceiver for Pipeline {
    fn on_event(&self, event: Event) {
        match event.event_type {
            EventType::Ready => {
                let ready = self.ready_count.fetch_add(1, Ordering::SeqCst) + 1;
                let total = self.filter_count();
                tracing::debug!(pipeline = %self.name, from = %event.src_filter, ready, total, "filter ready");
                if ready >= total {
                    self.forward(Event::new(self.name.clone(), EventType::Ready));
                }
            }
            // Fail fast: errors go up unmodified and immediately.
            EventType::Error => self.forward(event),
            _ => self.forward(event),
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("filters", &self.filter_count())
            .finish()
    }
}
