//! Buffer-flow controllers binding a [`CodecPlugin`] into a filter.
//!
//! A [`CodecMode`] owns the data path around a plugin: the input queue,
//! the output buffer ring, and (in async mode) the feed and drain workers.
//! [`CodecFilter`] is the [`FilterBehavior`] that wires a mode into the
//! filter lifecycle, keeping the ordering rules in one place:
//!
//! - start: plugin first, then workers
//! - stop/release: workers first, then plugin, then queue teardown, so no
//!   worker can touch a stopped plugin and teardown never deadlocks on a
//!   blocked pop
//! - flush: quiesce workers and halt intake, flush the plugin, then
//!   re-seed the ring and bring both back

mod async_mode;
mod sync_mode;

pub use async_mode::AsyncCodecMode;
pub use sync_mode::SyncCodecMode;

use crate::buffer::{FrameBuffer, StreamType};
use crate::error::Result;
use crate::filter::{FilterBehavior, FilterContext, InputPort};
use crate::plugin::{data_channel, CodecDataReceiver, CodecPlugin, ParamTag};
use crate::pool::BufferPool;
use std::sync::Arc;
use std::time::Duration;

/// How long a feed worker waits on the input queue before re-checking its
/// run flag.
pub(crate) const FEED_POP_TIMEOUT: Duration = Duration::from_millis(300);
/// Timeout for one `queue_input_buffer` / `queue_output_buffer` attempt.
pub(crate) const QUEUE_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(10);
/// Attempts before a transiently rejected input buffer is dropped.
pub(crate) const INPUT_RETRY_LIMIT: u32 = 3;
/// Back-off between retry attempts.
pub(crate) const RETRY_DELAY: Duration = Duration::from_millis(10);
/// Output buffers negotiated when the plugin does not say.
pub(crate) const DEFAULT_OUTPUT_BUFFER_COUNT: u64 = 8;
/// Output buffer size negotiated when the plugin does not say.
pub(crate) const DEFAULT_OUTPUT_BUFFER_SIZE: u64 = 64 * 1024;

/// Prepare a plugin and build its output ring: negotiate buffer count and
/// size, install the data channel, and seed the ring from a fresh pool.
///
/// The pool is rebuilt on every configure because renegotiation changes
/// both size and count.
pub(crate) fn configure_plugin_io(
    name: &str,
    plugin: &Arc<dyn CodecPlugin>,
) -> Result<(Arc<BufferPool>, CodecDataReceiver)> {
    plugin.prepare()?;

    let param_or = |tag, fallback| {
        plugin
            .get_parameter(tag)
            .ok()
            .and_then(|v| v.as_u64())
            .unwrap_or(fallback)
    };
    let count = param_or(ParamTag::OutputBufferCount, DEFAULT_OUTPUT_BUFFER_COUNT);
    let size = param_or(ParamTag::OutputBufferSize, DEFAULT_OUTPUT_BUFFER_SIZE);

    let (channel, receiver) = data_channel(count as usize);
    plugin.set_data_channel(channel);

    let pool = match plugin.allocator() {
        Some(allocator) => BufferPool::with_allocator(size as usize, count as usize, &*allocator),
        None => BufferPool::new(size as usize, count as usize),
    };
    while let Some(pooled) = pool.try_acquire() {
        if let Err((_, e)) = plugin.queue_output_buffer(pooled.detach(), QUEUE_ATTEMPT_TIMEOUT) {
            if !e.is_transient() {
                return Err(e);
            }
            tracing::debug!(mode = %name, "plugin refused output seed");
            break;
        }
    }
    tracing::debug!(mode = %name, count, size, "codec io configured");
    Ok((pool, receiver))
}

/// Data-path controller around one codec plugin.
pub trait CodecMode: Send {
    /// Build the input queue, negotiate and build the output ring, and hand
    /// the plugin its data channel. Called from `do_prepare`.
    fn configure(&mut self, ctx: &FilterContext) -> Result<()>;
    /// Spawn workers (no-op in sync mode). Called from `do_start`.
    fn start_workers(&mut self, ctx: &FilterContext) -> Result<()>;
    /// Stop and join workers. Must be safe to call more than once and must
    /// return even if a worker is currently blocked waiting for input.
    fn stop_workers(&mut self);
    /// Deactivate and clear the input queue. Called after the plugin has
    /// stopped.
    fn teardown_io(&mut self);
    /// Quiesce the workers, close intake, and discard buffered data ahead
    /// of a plugin flush. No worker may touch the plugin once this returns.
    fn flush_start(&mut self);
    /// Re-open intake, re-seed the output ring, and restart workers that
    /// `flush_start` halted.
    fn flush_end(&mut self);
    /// Upstream entry point: accept one buffer into the input path. Must
    /// not block; a full stage reports `Again`.
    fn push_data(&self, ctx: &FilterContext, buffer: FrameBuffer) -> Result<()>;
    /// The port upstream filters push into, if this mode has one.
    fn input_port(&self) -> Option<Arc<dyn InputPort>>;
    /// Attach the downstream port completed output travels to.
    fn bind_output_port(&mut self, stream: StreamType, port: Arc<dyn InputPort>);
    /// Detach a downstream port.
    fn unbind_output_port(&mut self, stream: StreamType);
}

/// Filter behavior that drives a [`CodecPlugin`] through a [`CodecMode`].
pub struct CodecFilter {
    plugin: Arc<dyn CodecPlugin>,
    mode: Box<dyn CodecMode>,
}

impl CodecFilter {
    /// Bind a plugin and a mode into one filter behavior.
    pub fn new(plugin: Arc<dyn CodecPlugin>, mode: Box<dyn CodecMode>) -> Self {
        Self { plugin, mode }
    }

    /// Accept one buffer from outside the port mechanism (sources, tests).
    pub fn push_data(&self, ctx: &FilterContext, buffer: FrameBuffer) -> Result<()> {
        self.mode.push_data(ctx, buffer)
    }
}

impl FilterBehavior for CodecFilter {
    fn do_init_after_link(&mut self, _ctx: &FilterContext) -> Result<()> {
        self.plugin.init()
    }

    fn do_prepare(&mut self, ctx: &FilterContext) -> Result<()> {
        self.mode.configure(ctx)
    }

    fn do_start(&mut self, ctx: &FilterContext) -> Result<()> {
        self.plugin.start()?;
        self.mode.start_workers(ctx)
    }

    fn do_pause(&mut self, _ctx: &FilterContext) -> Result<()> {
        // Workers keep running; intake simply starves while upstream is
        // paused. Only the plugin is told.
        self.plugin.pause()
    }

    fn do_resume(&mut self, _ctx: &FilterContext) -> Result<()> {
        self.plugin.resume()
    }

    fn do_stop(&mut self, _ctx: &FilterContext) -> Result<()> {
        self.mode.stop_workers();
        self.plugin.stop()?;
        self.mode.teardown_io();
        Ok(())
    }

    fn do_flush(&mut self, _ctx: &FilterContext) -> Result<()> {
        self.mode.flush_start();
        self.plugin.flush()?;
        self.mode.flush_end();
        Ok(())
    }

    fn do_release(&mut self, _ctx: &FilterContext) -> Result<()> {
        self.mode.stop_workers();
        let r = self.plugin.deinit();
        self.mode.teardown_io();
        r
    }

    fn on_linked(
        &mut self,
        _stream: StreamType,
        _ctx: &FilterContext,
    ) -> Result<Option<Arc<dyn InputPort>>> {
        Ok(self.mode.input_port())
    }

    fn on_updated(
        &mut self,
        _stream: StreamType,
        _ctx: &FilterContext,
    ) -> Result<Option<Arc<dyn InputPort>>> {
        Ok(self.mode.input_port())
    }

    fn bind_output_port(&mut self, stream: StreamType, port: Arc<dyn InputPort>) {
        self.mode.bind_output_port(stream, port);
    }

    fn unbind_output_port(&mut self, stream: StreamType) {
        self.mode.unbind_output_port(stream);
    }
}
