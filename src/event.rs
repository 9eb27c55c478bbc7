//! Event protocol between filters, the pipeline, and the owning engine.
//!
//! Filters report conditions upward as [`Event`]s. The pipeline is a
//! transparent relay except for READY aggregation and fail-fast ERROR
//! forwarding; everything else passes through to the engine's
//! [`EventReceiver`] unchanged, payload uninspected.

use crate::buffer::StreamType;
use std::any::Any;
use std::fmt;

/// Conditions a filter can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// The filter finished preparing and reached READY.
    Ready,
    /// The filter entered the ERROR state.
    Error,
    /// Playback/recording of the stream completed (EOS reached the sink).
    Complete,
    /// Periodic progress report (position, bytes written, ...).
    Progress,
    /// Data starvation began; the engine may want to surface buffering UI.
    BufferingStart,
    /// Data starvation ended.
    BufferingEnd,
    /// The active track changed (e.g. audio language switch).
    TrackChange,
    /// A flush completed on this filter.
    Flushed,
    /// The source has no more data to deliver.
    SourceDrained,
    /// Stream resolution changed mid-stream.
    ResolutionChange,
    /// Audio focus was interrupted by the platform.
    AudioInterrupt,
    /// Stream bitrate changed (adaptive sources).
    BitrateChange,
    /// A buffer was dropped (stale after flush, or codec overrun).
    BufferDropped,
    /// First frame decoded and delivered.
    FirstFrame,
}

/// An event traveling filter → pipeline → engine.
///
/// `param` is an opaque payload only the final receiver interprets.
pub struct Event {
    /// Name of the filter that originated the event.
    pub src_filter: String,
    /// What happened.
    pub event_type: EventType,
    /// Opaque payload, untouched by the relay chain.
    pub param: Option<Box<dyn Any + Send>>,
}

impl Event {
    /// Create an event without a payload.
    pub fn new(src_filter: impl Into<String>, event_type: EventType) -> Self {
        Self {
            src_filter: src_filter.into(),
            event_type,
            param: None,
        }
    }

    /// Create an event carrying an opaque payload.
    pub fn with_param(
        src_filter: impl Into<String>,
        event_type: EventType,
        param: impl Any + Send,
    ) -> Self {
        Self {
            src_filter: src_filter.into(),
            event_type,
            param: Some(Box::new(param)),
        }
    }

    /// Downcast the payload to a concrete type, if present and matching.
    pub fn param_as<T: Any>(&self) -> Option<&T> {
        self.param.as_ref().and_then(|p| p.downcast_ref::<T>())
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("src_filter", &self.src_filter)
            .field("event_type", &self.event_type)
            .field("has_param", &self.param.is_some())
            .finish()
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} from '{}'", self.event_type, self.src_filter)
    }
}

/// Upward notification sink for filter/pipeline events.
pub trait EventReceiver: Send + Sync {
    /// Handle one event. Must not block for long; called from filter tasks.
    fn on_event(&self, event: Event);
}

/// Graph-mutation request a filter can make of the owning engine.
///
/// Used when negotiation discovers a new required stage, e.g. a muxer
/// needing an additional track sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackCommand {
    /// A downstream filter of the given stream type should be created.
    AddFilter,
    /// The downstream filter for the given stream type is obsolete.
    RemoveFilter,
    /// The downstream link needs renegotiation.
    UpdateFilter,
}

/// Downstream notification interface from a filter to the owning engine.
pub trait FilterCallback: Send + Sync {
    /// Handle a graph-mutation request originated by `filter_name`.
    fn on_callback(&self, filter_name: &str, command: CallbackCommand, stream_type: StreamType);
}
