//! reel-core: threaded video playback engine.
//!
//! Wraps a demuxing/decoding provider into a continuous stream of
//! displayable frames from a file, URL, camera, or desktop-capture source,
//! with pause/resume, seeking, looping, and hardware-accelerated decode
//! falling back to software.
//!
//! The engine is a three-stage producer/consumer pipeline:
//!
//! ```text
//! SourceAdapter -> Demux -> packet queue -> Decode -> frame queue -> Display -> sink
//! ```
//!
//! Each stage runs on its own thread, coordinated through bounded queues
//! ([`queue::BoundedQueue`]) and single-slot atomic mailboxes for seek/reset
//! requests. A monotonically increasing *generation* counter invalidates
//! frames produced before the most recent seek or reset.
//!
//! The demux/decode library itself is a provider behind the
//! [`MediaBackend`] trait; the `ffmpeg` feature ships an implementation
//! built on `ffmpeg-next`.
//!
//! # Example
//!
//! ```no_run
//! # fn backend() -> std::sync::Arc<dyn reel_core::MediaBackend> { unimplemented!() }
//! use reel_core::Player;
//!
//! let mut player = Player::new(backend());
//! if player.open_file("movie.mkv") {
//!     player.play(false);
//!     // ... the presentation sink pulls frames and acknowledges them ...
//!     player.close();
//! }
//! ```

pub mod codec;
pub mod container;
pub mod player;
pub mod queue;
pub mod source;
pub mod video;

mod decode;
mod demux;
mod display;
mod session;

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;

pub use codec::{
    DecodeBackend, DecoderConfig, FrameSurface, HardwareSurface, RawFrame, SoftwareConfig,
    VideoDecoder,
};
pub use container::{ContainerReader, MediaBackend, Packet, StreamInfo, StreamKind};
pub use player::{Player, PlayerListener, PresentationSink};
pub use queue::BoundedQueue;
pub use source::{ByteStream, MediaLocator, OpenedSource, SourceAdapter};
pub use video::{
    DecodedFrame, FrameRenderingData, MediaError, PixelBuffer, PixelFormat, Plane, PlayerState,
    Rational, TimeValue,
};

#[cfg(feature = "ffmpeg")]
pub use ffmpeg::FfmpegBackend;
