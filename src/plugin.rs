//! Codec plugin seam.
//!
//! Concrete codec/demux/mux implementations live outside this crate and are
//! bound through [`CodecPlugin`]. The engine drives the plugin's lifecycle,
//! exchanges parameters through one typed channel ([`ParamTag`] +
//! [`Value`]), and feeds it buffers via the queue/dequeue protocol.
//!
//! Completed buffers come back over a bounded [`CodecDataChannel`] the
//! plugin sends into from its own thread; the engine's drain worker owns
//! the receiving side, so plugin threads never call back into filter state.

use crate::buffer::FrameBuffer;
use crate::error::{Error, Result};
use crate::pool::BufferAllocator;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of handing a buffer to a plugin.
///
/// On failure the buffer comes back with the error so the caller can retry
/// or drop it without copying.
pub type QueueResult = std::result::Result<(), (FrameBuffer, Error)>;

/// Keys for the typed parameter channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamTag {
    /// Negotiated count of output buffers the plugin wants queued.
    OutputBufferCount,
    /// Negotiated size in bytes of each output buffer.
    OutputBufferSize,
    /// Input sample rate / frame rate numerator.
    SampleRate,
    /// Channel count (audio) or plane count (video).
    ChannelCount,
    /// Frame width in pixels.
    Width,
    /// Frame height in pixels.
    Height,
    /// Target bitrate in bits per second.
    Bitrate,
    /// Codec-specific configuration blob (extradata).
    CodecConfig,
}

/// Typed parameter values exchanged with plugins.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Unsigned integer parameter.
    UInt(u64),
    /// Signed integer parameter.
    Int(i64),
    /// Floating-point parameter.
    Float(f64),
    /// String parameter.
    String(String),
    /// Opaque byte blob.
    Bytes(Vec<u8>),
}

impl Value {
    /// Interpret as an unsigned integer where sensible.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt(v) => Some(*v),
            Value::Int(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }
}

/// Sending half handed to the plugin for completed-buffer notification.
#[derive(Clone)]
pub struct CodecDataChannel {
    /// Consumed input buffers, returned once the plugin is done reading.
    pub input_done: kanal::Sender<FrameBuffer>,
    /// Filled output buffers, ready to travel downstream.
    pub output_done: kanal::Sender<FrameBuffer>,
}

/// Receiving half kept by the engine's drain worker.
pub struct CodecDataReceiver {
    /// Consumed input buffers.
    pub input_done: kanal::Receiver<FrameBuffer>,
    /// Filled output buffers.
    pub output_done: kanal::Receiver<FrameBuffer>,
}

/// Create a bounded data channel pair for plugin↔engine buffer hand-off.
pub fn data_channel(capacity: usize) -> (CodecDataChannel, CodecDataReceiver) {
    let (in_tx, in_rx) = kanal::bounded(capacity);
    let (out_tx, out_rx) = kanal::bounded(capacity);
    (
        CodecDataChannel {
            input_done: in_tx,
            output_done: out_tx,
        },
        CodecDataReceiver {
            input_done: in_rx,
            output_done: out_rx,
        },
    )
}

/// Contract every codec/demux/mux plugin implements.
///
/// Lifecycle calls mirror the filter lifecycle. `queue_input_buffer` may
/// return [`crate::Error::Again`] under transient load; the engine retries
/// a bounded number of times before dropping the frame.
pub trait CodecPlugin: Send + Sync {
    /// One-time plugin initialization.
    fn init(&self) -> Result<()>;
    /// Final teardown; the plugin must not be used afterwards.
    fn deinit(&self) -> Result<()>;
    /// Allocate internal resources for the negotiated parameters.
    fn prepare(&self) -> Result<()>;
    /// Return to the post-init state, dropping negotiated resources.
    fn reset(&self) -> Result<()>;
    /// Begin accepting buffers.
    fn start(&self) -> Result<()>;
    /// Stop accepting buffers.
    fn stop(&self) -> Result<()>;
    /// Suspend processing without dropping state.
    fn pause(&self) -> Result<()> {
        Ok(())
    }
    /// Resume after [`CodecPlugin::pause`].
    fn resume(&self) -> Result<()> {
        Ok(())
    }
    /// Discard all in-flight data.
    fn flush(&self) -> Result<()>;

    /// Set one typed parameter.
    fn set_parameter(&self, tag: ParamTag, value: Value) -> Result<()>;
    /// Read one typed parameter.
    fn get_parameter(&self, tag: ParamTag) -> Result<Value>;

    /// Hand a filled input buffer to the plugin.
    fn queue_input_buffer(&self, buffer: FrameBuffer, timeout: Duration) -> QueueResult;
    /// Hand an empty output buffer to the plugin for filling.
    fn queue_output_buffer(&self, buffer: FrameBuffer, timeout: Duration) -> QueueResult;

    /// Install the completed-buffer channel the plugin sends into.
    fn set_data_channel(&self, channel: CodecDataChannel);

    /// Plugin-preferred buffer allocator; `None` selects the framework
    /// default heap allocation.
    fn allocator(&self) -> Option<Arc<dyn BufferAllocator>> {
        None
    }
}
