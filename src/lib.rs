//! avflow: a task-driven media pipeline engine.
//!
//! Filters (demuxers, codecs, sinks) form a DAG owned by a [`Pipeline`].
//! Each async filter runs its work on a dedicated task; lifecycle calls fan
//! out from pipeline heads through the graph, and events travel back up
//! through the pipeline's relay to the owning engine.
//!
//! Codec work is delegated to out-of-crate [`plugin::CodecPlugin`]
//! implementations; the [`codec`] module owns the buffer flow around them.
//!
//! ```no_run
//! use avflow::prelude::*;
//! use std::sync::Arc;
//!
//! struct Engine;
//! impl EventReceiver for Engine {
//!     fn on_event(&self, event: Event) {
//!         println!("{event}");
//!     }
//! }
//! impl FilterCallback for Engine {
//!     fn on_callback(&self, _: &str, _: CallbackCommand, _: StreamType) {}
//! }
//!
//! # fn demo(source: Arc<avflow::filter::Filter>) -> avflow::Result<()> {
//! let pipeline = Pipeline::new("playback");
//! pipeline.init(Arc::new(Engine), Arc::new(Engine), "session-1")?;
//! pipeline.add_head_filters(vec![source])?;
//! pipeline.prepare()?;
//! pipeline.wait_all_state(FilterState::Ready)?;
//! pipeline.start()?;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod codec;
pub mod error;
pub mod event;
pub mod filter;
pub mod pipeline;
pub mod plugin;
pub mod pool;
pub mod queue;
pub mod task;

pub use error::{Error, Result};
pub use pipeline::Pipeline;

/// Commonly used types, in one import.
pub mod prelude {
    pub use crate::buffer::{BufferFlags, BufferMeta, FrameBuffer, StreamType};
    pub use crate::codec::{AsyncCodecMode, CodecFilter, CodecMode, SyncCodecMode};
    pub use crate::error::{Error, Result};
    pub use crate::event::{CallbackCommand, Event, EventReceiver, EventType, FilterCallback};
    pub use crate::filter::{
        Filter, FilterArena, FilterBehavior, FilterContext, FilterFactory, FilterId, FilterState,
        FilterType, InputPort, ProcessingMode,
    };
    pub use crate::pipeline::Pipeline;
    pub use crate::plugin::{CodecDataChannel, CodecPlugin, ParamTag, Value};
    pub use crate::pool::{BufferAllocator, BufferPool, PooledBuffer};
    pub use crate::queue::BlockingQueue;
    pub use crate::task::{Task, TaskType};
}
