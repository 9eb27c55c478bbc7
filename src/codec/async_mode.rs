//! Task-driven buffer flow around a codec plugin.
//!
//! Two workers run between the filter's queues and the plugin:
//!
//! - the feed worker pops the input queue (bounded wait, so it stays
//!   responsive to stop) and hands buffers to the plugin, retrying a few
//!   times when the plugin is transiently busy before dropping the frame
//! - the drain worker collects completed buffers from the plugin's data
//!   channel, forwards output downstream, and re-seeds the plugin's output
//!   ring from the pool's allocation

use super::{CodecMode, FEED_POP_TIMEOUT, INPUT_RETRY_LIMIT, QUEUE_ATTEMPT_TIMEOUT, RETRY_DELAY};
use crate::buffer::{FrameBuffer, StreamType};
use crate::error::{Error, Result};
use crate::event::EventType;
use crate::filter::{FilterContext, InputPort};
use crate::plugin::CodecPlugin;
use crate::pool::BufferPool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Sleep between drain polls when no buffer was available.
const DRAIN_IDLE: Duration = Duration::from_millis(5);

struct ModeShared {
    name: String,
    plugin: Arc<dyn CodecPlugin>,
    output_stream: StreamType,
    input: crate::queue::BlockingQueue<FrameBuffer>,
    pool: Mutex<Option<Arc<BufferPool>>>,
    input_done: Mutex<Option<kanal::Receiver<FrameBuffer>>>,
    output_done: Mutex<Option<kanal::Receiver<FrameBuffer>>>,
    out_ports: Mutex<HashMap<StreamType, Arc<dyn InputPort>>>,
    running: AtomicBool,
}

/// Asynchronous codec controller: dedicated feed and drain workers.
pub struct AsyncCodecMode {
    shared: Arc<ModeShared>,
    feed: Option<JoinHandle<()>>,
    drain: Option<JoinHandle<()>>,
    /// Captured at configure; lets a flush restart the workers.
    ctx: Option<FilterContext>,
    resume_after_flush: bool,
}

impl AsyncCodecMode {
    /// Create a controller around `plugin`. `output_stream` selects the
    /// downstream port completed output is forwarded to.
    pub fn new(
        name: impl Into<String>,
        plugin: Arc<dyn CodecPlugin>,
        output_stream: StreamType,
        input_capacity: usize,
    ) -> Self {
        let name = name.into();
        Self {
            shared: Arc::new(ModeShared {
                input: crate::queue::BlockingQueue::new(format!("{name}/in"), input_capacity),
                name,
                plugin,
                output_stream,
                pool: Mutex::new(None),
                input_done: Mutex::new(None),
                output_done: Mutex::new(None),
                out_ports: Mutex::new(HashMap::new()),
                running: AtomicBool::new(false),
            }),
            feed: None,
            drain: None,
            ctx: None,
            resume_after_flush: false,
        }
    }

    /// Pool statistics, once configured.
    pub fn pool(&self) -> Option<Arc<BufferPool>> {
        self.shared.pool.lock().unwrap().clone()
    }
}

impl CodecMode for AsyncCodecMode {
    fn configure(&mut self, ctx: &FilterContext) -> Result<()> {
        let (pool, receiver) = super::configure_plugin_io(&self.shared.name, &self.shared.plugin)?;
        *self.shared.pool.lock().unwrap() = Some(pool);
        *self.shared.input_done.lock().unwrap() = Some(receiver.input_done);
        *self.shared.output_done.lock().unwrap() = Some(receiver.output_done);
        self.shared.input.set_active(true, true);
        self.ctx = Some(ctx.clone());
        Ok(())
    }

    fn start_workers(&mut self, ctx: &FilterContext) -> Result<()> {
        self.ctx = Some(ctx.clone());
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        let feed_ctx = ctx.clone();
        self.feed = Some(
            std::thread::Builder::new()
                .name(format!("{}/feed", self.shared.name))
                .spawn(move || feed_loop(shared, feed_ctx))
                .map_err(|e| Error::Plugin(format!("spawn feed worker: {e}")))?,
        );

        let shared = Arc::clone(&self.shared);
        let drain_ctx = ctx.clone();
        self.drain = Some(
            std::thread::Builder::new()
                .name(format!("{}/drain", self.shared.name))
                .spawn(move || drain_loop(shared, drain_ctx))
                .map_err(|e| Error::Plugin(format!("spawn drain worker: {e}")))?,
        );
        Ok(())
    }

    fn stop_workers(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.feed.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.drain.take() {
            let _ = handle.join();
        }
    }

    fn teardown_io(&mut self) {
        self.shared.input.set_active(false, true);
    }

    fn flush_start(&mut self) {
        // Join the workers before the plugin flushes: a feed worker still
        // alive could hand the plugin a pre-flush frame after its flush.
        self.resume_after_flush = self.shared.running.load(Ordering::SeqCst);
        self.stop_workers();
        self.shared.input.set_active(false, true);
        // Completed-but-unforwarded output is stale too; recycle it.
        let receiver = self.shared.output_done.lock().unwrap().clone();
        if let Some(receiver) = receiver {
            while let Ok(Some(mut buffer)) = receiver.try_recv() {
                buffer.reset();
                let _ = self
                    .shared
                    .plugin
                    .queue_output_buffer(buffer, QUEUE_ATTEMPT_TIMEOUT);
            }
        }
    }

    fn flush_end(&mut self) {
        self.shared.input.set_active(true, false);
        // Re-seed the ring with whatever came home to the pool during the
        // flush, then bring the workers back if the flush interrupted them.
        let pool = self.shared.pool.lock().unwrap().clone();
        if let Some(pool) = pool {
            while let Some(pooled) = pool.try_acquire() {
                if self
                    .shared
                    .plugin
                    .queue_output_buffer(pooled.detach(), QUEUE_ATTEMPT_TIMEOUT)
                    .is_err()
                {
                    break;
                }
            }
        }
        if self.resume_after_flush {
            self.resume_after_flush = false;
            if let Some(ctx) = self.ctx.clone() {
                if let Err(e) = self.start_workers(&ctx) {
                    tracing::warn!(mode = %self.shared.name, error = %e, "worker restart after flush failed");
                }
            }
        }
    }

    fn push_data(&self, _ctx: &FilterContext, buffer: FrameBuffer) -> Result<()> {
        self.shared.input.try_push(buffer)
    }

    fn input_port(&self) -> Option<Arc<dyn InputPort>> {
        Some(Arc::new(self.shared.input.clone()))
    }

    fn bind_output_port(&mut self, stream: StreamType, port: Arc<dyn InputPort>) {
        self.shared.out_ports.lock().unwrap().insert(stream, port);
    }

    fn unbind_output_port(&mut self, stream: StreamType) {
        self.shared.out_ports.lock().unwrap().remove(&stream);
    }
}

impl Drop for AsyncCodecMode {
    fn drop(&mut self) {
        self.stop_workers();
    }
}

fn feed_loop(shared: Arc<ModeShared>, ctx: FilterContext) {
    tracing::debug!(mode = %shared.name, "feed worker started");
    while shared.running.load(Ordering::SeqCst) {
        let Some(buffer) = shared.input.pop_timeout(FEED_POP_TIMEOUT) else {
            continue;
        };
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }

        let mut pending = buffer;
        let mut attempt = 0;
        loop {
            match shared.plugin.queue_input_buffer(pending, QUEUE_ATTEMPT_TIMEOUT) {
                Ok(()) => break,
                Err((returned, e)) if e.is_transient() => {
                    attempt += 1;
                    if attempt >= INPUT_RETRY_LIMIT {
                        tracing::debug!(mode = %shared.name, "input dropped after {attempt} busy attempts");
                        ctx.post_event(EventType::BufferDropped);
                        break;
                    }
                    if !shared.running.load(Ordering::SeqCst) {
                        // A stop or flush landed mid-retry; the frame is
                        // stale now.
                        break;
                    }
                    pending = returned;
                    std::thread::sleep(RETRY_DELAY);
                }
                Err((_, e)) => {
                    ctx.raise_error(e);
                    shared.running.store(false, Ordering::SeqCst);
                    return;
                }
            }
        }
    }
    tracing::debug!(mode = %shared.name, "feed worker finished");
}

fn drain_loop(shared: Arc<ModeShared>, ctx: FilterContext) {
    tracing::debug!(mode = %shared.name, "drain worker started");
    let input_done = shared.input_done.lock().unwrap().clone();
    let output_done = shared.output_done.lock().unwrap().clone();

    while shared.running.load(Ordering::SeqCst) {
        let mut idle = true;

        // Consumed input buffers just get dropped; their allocation came
        // from upstream.
        if let Some(receiver) = &input_done {
            while let Ok(Some(_)) = receiver.try_recv() {
                idle = false;
            }
        }

        if let Some(receiver) = &output_done {
            match receiver.try_recv() {
                Ok(Some(mut buffer)) => {
                    idle = false;
                    let eos = buffer.is_eos();
                    let port = shared
                        .out_ports
                        .lock()
                        .unwrap()
                        .get(&shared.output_stream)
                        .cloned();
                    if let Some(port) = port {
                        let outgoing = FrameBuffer::new(buffer.data().to_vec(), buffer.meta().clone());
                        if let Err(e) = port.push(outgoing) {
                            tracing::debug!(mode = %shared.name, error = %e, "downstream rejected output");
                        }
                    }
                    if eos {
                        ctx.post_event(EventType::Complete);
                    }
                    // The ring buffer itself goes straight back to the plugin.
                    buffer.reset();
                    if let Err((_, e)) = shared
                        .plugin
                        .queue_output_buffer(buffer, QUEUE_ATTEMPT_TIMEOUT)
                    {
                        if !e.is_transient() {
                            ctx.raise_error(e);
                            return;
                        }
                    }
                }
                Ok(None) => {}
                Err(_) => break,
            }
        }

        if idle {
            std::thread::sleep(DRAIN_IDLE);
        }
    }
    tracing::debug!(mode = %shared.name, "drain worker finished");
}
