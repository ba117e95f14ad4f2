//! Provider seam for the black-box demux/decode library.
//!
//! The engine never touches a container format or codec directly: a
//! [`MediaBackend`] opens an [`OpenedSource`] into a [`ContainerReader`],
//! and the reader opens per-stream [`VideoDecoder`](crate::codec::VideoDecoder)s.
//! The `ffmpeg` feature ships a real backend; tests script their own.

use bytes::Bytes;

use crate::codec::{DecoderConfig, VideoDecoder};
use crate::source::OpenedSource;
use crate::video::{MediaError, Rational, TimeValue};

/// Classification of an elementary stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
    Other,
}

/// What the container reports about one elementary stream.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    /// Stream index within the container
    pub index: usize,
    pub kind: StreamKind,
    /// Units for every timestamp on this stream
    pub time_base: Rational,
    /// Stream-level start time in time-base units
    pub start_time: TimeValue,
    /// Stream-level duration in time-base units
    pub duration: TimeValue,
    /// Coded width; non-positive values mark the stream unusable
    pub width: i32,
    /// Coded height; non-positive values mark the stream unusable
    pub height: i32,
    /// Pixel aspect ratio when the source specifies one
    pub pixel_aspect: Option<Rational>,
    pub codec_name: String,
}

/// An opaque compressed data unit as demuxed from the container.
#[derive(Debug, Clone)]
pub struct Packet {
    pub stream_index: usize,
    /// Presentation timestamp in the stream's time-base units
    pub pts: i64,
    /// Compressed payload; cheap to clone
    pub data: Bytes,
    pub is_keyframe: bool,
}

/// An opened container: stream enumeration, packet reads, and seeking.
///
/// Owned by the demux stage thread once playback starts.
pub trait ContainerReader: Send {
    /// The streams discovered in the container.
    fn streams(&self) -> &[StreamInfo];

    /// Container-level start time in microseconds, when known. Used as a
    /// fallback when the selected stream does not report its own start.
    fn container_start_us(&self) -> TimeValue;

    /// Container-level duration in microseconds, when known.
    fn container_duration_us(&self) -> TimeValue;

    /// Opens a decoder for the given video stream.
    ///
    /// Opening is atomic: either a fully configured decode context is
    /// returned, or the call fails and nothing leaks.
    fn open_video_decoder(
        &mut self,
        stream_index: usize,
        config: &DecoderConfig,
    ) -> Result<Box<dyn VideoDecoder>, MediaError>;

    /// Reads the next packet in source order; `None` at end-of-stream.
    fn read_packet(&mut self) -> Result<Option<Packet>, MediaError>;

    /// Seeks the given stream to the nearest keyframe at-or-before `pts`
    /// (stream time-base units).
    fn seek(&mut self, stream_index: usize, pts: i64) -> Result<(), MediaError>;
}

/// The demux/decode library behind the engine.
pub trait MediaBackend: Send + Sync {
    fn open_container(&self, source: OpenedSource)
        -> Result<Box<dyn ContainerReader>, MediaError>;
}
