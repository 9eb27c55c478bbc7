//! Frame buffer and metadata types.
//!
//! A [`FrameBuffer`] is the unit of data handed between pipeline stages.
//! Ownership is transferred on every hand-off (push into a queue, send over
//! a channel), so a buffer has a single writer at any point in time.

use std::time::Duration;

/// Kind of stream a buffer (or a filter link) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamType {
    /// Uncompressed PCM audio.
    RawAudio,
    /// Compressed audio (AAC, Opus, ...).
    EncodedAudio,
    /// Uncompressed video frames.
    RawVideo,
    /// Compressed video (H.264, HEVC, ...).
    EncodedVideo,
    /// Subtitle / timed-text data.
    Subtitle,
}

/// Flags indicating buffer properties.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferFlags {
    /// Buffer marks end of stream.
    pub eos: bool,
    /// Buffer contains a sync point (keyframe equivalent).
    pub sync_point: bool,
    /// Buffer is corrupted or incomplete.
    pub corrupted: bool,
    /// Buffer carries no payload, only a discontinuity marker.
    pub gap: bool,
}

/// Metadata associated with a frame buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferMeta {
    /// Presentation timestamp.
    pub pts: Option<Duration>,
    /// Decode timestamp.
    pub dts: Option<Duration>,
    /// Duration of this buffer's content.
    pub duration: Option<Duration>,
    /// Monotonic sequence number within a stream.
    pub sequence: u64,
    /// Stream this buffer belongs to, once known.
    pub stream_type: Option<StreamType>,
    /// Buffer flags.
    pub flags: BufferFlags,
}

impl BufferMeta {
    /// Create metadata with a sequence number.
    pub fn with_sequence(sequence: u64) -> Self {
        Self {
            sequence,
            ..Default::default()
        }
    }
}

/// A data buffer moving through the pipeline.
#[derive(Debug, Clone, Default)]
pub struct FrameBuffer {
    data: Vec<u8>,
    meta: BufferMeta,
}

impl FrameBuffer {
    /// Create a buffer from raw bytes and metadata.
    pub fn new(data: Vec<u8>, meta: BufferMeta) -> Self {
        Self { data, meta }
    }

    /// Create an empty buffer with `capacity` bytes pre-allocated.
    ///
    /// Used by pools to carve out reusable buffers up front.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            meta: BufferMeta::default(),
        }
    }

    /// Create a zero-length end-of-stream marker.
    pub fn eos() -> Self {
        let mut buf = Self::default();
        buf.meta.flags.eos = true;
        buf
    }

    /// Get the payload.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Get the payload mutably.
    pub fn data_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Allocated capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Get the metadata.
    pub fn meta(&self) -> &BufferMeta {
        &self.meta
    }

    /// Get the metadata mutably.
    pub fn meta_mut(&mut self) -> &mut BufferMeta {
        &mut self.meta
    }

    /// True if this buffer marks end of stream.
    pub fn is_eos(&self) -> bool {
        self.meta.flags.eos
    }

    /// Clear payload and metadata for reuse, keeping the allocation.
    pub fn reset(&mut self) {
        self.data.clear();
        self.meta = BufferMeta::default();
    }
}
