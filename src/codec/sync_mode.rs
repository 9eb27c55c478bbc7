//! Inline buffer flow around a codec plugin.
//!
//! No workers: each buffer pushed in is fed to the plugin on the caller's
//! thread, and whatever output the plugin has completed by then is drained
//! and forwarded before the call returns. Low-latency stages (audio render,
//! passthrough) use this; everything else runs async.

use super::{CodecMode, INPUT_RETRY_LIMIT, QUEUE_ATTEMPT_TIMEOUT, RETRY_DELAY};
use crate::buffer::{FrameBuffer, StreamType};
use crate::error::Result;
use crate::filter::{FilterContext, InputPort};
use crate::plugin::CodecPlugin;
use crate::pool::BufferPool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

struct SyncShared {
    name: String,
    plugin: Arc<dyn CodecPlugin>,
    output_stream: StreamType,
    input_done: Mutex<Option<kanal::Receiver<FrameBuffer>>>,
    output_done: Mutex<Option<kanal::Receiver<FrameBuffer>>>,
    out_ports: Mutex<HashMap<StreamType, Arc<dyn InputPort>>>,
    /// Captured at configure; lets the inline drain report completion.
    ctx: Mutex<Option<FilterContext>>,
}

impl SyncShared {
    /// Feed one buffer and drain completed output, all inline.
    fn process(&self, buffer: FrameBuffer) -> Result<()> {
        let mut pending = buffer;
        let mut attempt = 0;
        loop {
            match self.plugin.queue_input_buffer(pending, QUEUE_ATTEMPT_TIMEOUT) {
                Ok(()) => break,
                Err((returned, e)) if e.is_transient() => {
                    attempt += 1;
                    if attempt >= INPUT_RETRY_LIMIT {
                        tracing::debug!(mode = %self.name, "input dropped after {attempt} busy attempts");
                        return Ok(());
                    }
                    pending = returned;
                    std::thread::sleep(RETRY_DELAY);
                }
                Err((_, e)) => return Err(e),
            }
        }
        self.drain();
        Ok(())
    }

    fn drain(&self) {
        let input_done = self.input_done.lock().unwrap().clone();
        if let Some(receiver) = input_done {
            while let Ok(Some(_)) = receiver.try_recv() {}
        }

        let output_done = self.output_done.lock().unwrap().clone();
        let Some(receiver) = output_done else { return };
        while let Ok(Some(mut buffer)) = receiver.try_recv() {
            let eos = buffer.is_eos();
            let port = self
                .out_ports
                .lock()
                .unwrap()
                .get(&self.output_stream)
                .cloned();
            if let Some(port) = port {
                let outgoing = FrameBuffer::new(buffer.data().to_vec(), buffer.meta().clone());
                if let Err(e) = port.push(outgoing) {
                    tracing::debug!(mode = %self.name, error = %e, "downstream rejected output");
                }
            }
            if eos {
                if let Some(ctx) = self.ctx.lock().unwrap().as_ref() {
                    ctx.post_event(crate::event::EventType::Complete);
                }
            }
            buffer.reset();
            let _ = self
                .plugin
                .queue_output_buffer(buffer, QUEUE_ATTEMPT_TIMEOUT);
        }
    }
}

/// Port adapter so upstream filters can push straight into the plugin.
struct SyncPort {
    shared: Arc<SyncShared>,
}

impl InputPort for SyncPort {
    fn push(&self, buffer: FrameBuffer) -> Result<()> {
        self.shared.process(buffer)
    }
}

/// Synchronous codec controller: feed and drain run inline.
pub struct SyncCodecMode {
    shared: Arc<SyncShared>,
    pool: Option<Arc<BufferPool>>,
}

impl SyncCodecMode {
    /// Create a controller around `plugin`.
    pub fn new(
        name: impl Into<String>,
        plugin: Arc<dyn CodecPlugin>,
        output_stream: StreamType,
    ) -> Self {
        Self {
            shared: Arc::new(SyncShared {
                name: name.into(),
                plugin,
                output_stream,
                input_done: Mutex::new(None),
                output_done: Mutex::new(None),
                out_ports: Mutex::new(HashMap::new()),
                ctx: Mutex::new(None),
            }),
            pool: None,
        }
    }

    /// The output ring's pool, once configured.
    pub fn pool(&self) -> Option<Arc<BufferPool>> {
        self.pool.clone()
    }
}

impl CodecMode for SyncCodecMode {
    fn configure(&mut self, ctx: &FilterContext) -> Result<()> {
        let (pool, receiver) = super::configure_plugin_io(&self.shared.name, &self.shared.plugin)?;
        self.pool = Some(pool);
        *self.shared.input_done.lock().unwrap() = Some(receiver.input_done);
        *self.shared.output_done.lock().unwrap() = Some(receiver.output_done);
        *self.shared.ctx.lock().unwrap() = Some(ctx.clone());
        Ok(())
    }

    fn start_workers(&mut self, _ctx: &FilterContext) -> Result<()> {
        Ok(())
    }

    fn stop_workers(&mut self) {}

    fn teardown_io(&mut self) {
        *self.shared.input_done.lock().unwrap() = None;
        *self.shared.output_done.lock().unwrap() = None;
    }

    fn flush_start(&mut self) {
        // Recycle whatever the plugin completed but nobody consumed yet.
        let output_done = self.shared.output_done.lock().unwrap().clone();
        if let Some(receiver) = output_done {
            while let Ok(Some(mut buffer)) = receiver.try_recv() {
                buffer.reset();
                let _ = self
                    .shared
                    .plugin
                    .queue_output_buffer(buffer, QUEUE_ATTEMPT_TIMEOUT);
            }
        }
    }

    fn flush_end(&mut self) {}

    fn push_data(&self, _ctx: &FilterContext, buffer: FrameBuffer) -> Result<()> {
        self.shared.process(buffer)
    }

    fn input_port(&self) -> Option<Arc<dyn InputPort>> {
        Some(Arc::new(SyncPort {
            shared: Arc::clone(&self.shared),
        }))
    }

    fn bind_output_port(&mut self, stream: StreamType, port: Arc<dyn InputPort>) {
        self.shared.out_ports.lock().unwrap().insert(stream, port);
    }

    fn unbind_output_port(&mut self, stream: StreamType) {
        self.shared.out_ports.lock().unwrap().remove(&stream);
    }
}
