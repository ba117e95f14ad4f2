//! Core playback types shared across the pipeline stages.
//!
//! Timestamps throughout the engine are expressed in the video stream's
//! time-base units (see [`Rational`]); conversion to wall-clock seconds
//! happens only at the display stage.

use std::sync::Arc;

/// Pixel format of decoded output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUV 4:2:0 planar (most common video format)
    Yuv420p,
    /// NV12 (Y plane + interleaved UV, common for hardware decoders)
    Nv12,
    /// RGB 24-bit
    Rgb24,
    /// RGBA 32-bit
    Rgba,
    /// BGRA 32-bit
    Bgra,
}

impl PixelFormat {
    /// Returns the number of planes for this format.
    pub fn num_planes(&self) -> usize {
        match self {
            PixelFormat::Yuv420p => 3,
            PixelFormat::Nv12 => 2,
            PixelFormat::Rgb24 | PixelFormat::Rgba | PixelFormat::Bgra => 1,
        }
    }

    /// Returns true if this is a YUV-based format.
    pub fn is_yuv(&self) -> bool {
        matches!(self, PixelFormat::Yuv420p | PixelFormat::Nv12)
    }
}

/// A single plane of pixel data.
#[derive(Debug, Clone)]
pub struct Plane {
    /// Raw pixel data
    pub data: Vec<u8>,
    /// Stride (bytes per row, may include padding)
    pub stride: usize,
}

/// A CPU-accessible pixel buffer.
#[derive(Debug, Clone)]
pub struct PixelBuffer {
    /// Pixel format of the buffer
    pub format: PixelFormat,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Pixel data planes
    pub planes: Vec<Plane>,
}

impl PixelBuffer {
    /// Creates a new buffer from its parts.
    pub fn new(format: PixelFormat, width: u32, height: u32, planes: Vec<Plane>) -> Self {
        Self {
            format,
            width,
            height,
            planes,
        }
    }

    /// Returns the plane at `index`, if present.
    pub fn plane(&self, index: usize) -> Option<&Plane> {
        self.planes.get(index)
    }
}

/// A rational number, used for stream time-bases and pixel aspect ratios.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

impl Rational {
    /// 1/1, the default pixel aspect ratio.
    pub const ONE: Rational = Rational { num: 1, den: 1 };

    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    /// The value as a float; zero when the denominator is degenerate.
    pub fn as_f64(&self) -> f64 {
        if self.den == 0 {
            return 0.0;
        }
        self.num as f64 / self.den as f64
    }
}

/// A stream time that may be unknown, instead of overloading zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeValue {
    /// A known timestamp/duration in stream time-base units.
    Known(i64),
    /// The source did not report a value.
    Unknown,
}

impl TimeValue {
    /// Returns the value, or zero when unknown. Used only at the listener
    /// boundary, which reports plain integers and has no unknown state.
    pub fn or_zero(&self) -> i64 {
        match self {
            TimeValue::Known(v) => *v,
            TimeValue::Unknown => 0,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, TimeValue::Known(_))
    }
}

/// A decoded video frame ready for presentation.
///
/// Frames are cheap to clone: the pixel data is shared behind an [`Arc`].
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    /// Presentation timestamp in stream time-base units
    pub pts: i64,
    /// Decoded pixel data
    pub pixels: Arc<PixelBuffer>,
    /// Pixel aspect ratio; 1/1 when the source does not specify one
    pub aspect: Rational,
    /// Session generation the frame was decoded under. Frames whose
    /// generation precedes the current one are stale and never presented.
    pub generation: u64,
}

impl DecodedFrame {
    pub fn width(&self) -> u32 {
        self.pixels.width
    }

    pub fn height(&self) -> u32 {
        self.pixels.height
    }
}

/// What the presentation sink pulls for the currently offered frame.
#[derive(Debug, Clone)]
pub struct FrameRenderingData {
    pub width: u32,
    pub height: u32,
    pub pixels: Arc<PixelBuffer>,
    pub aspect_num: i32,
    pub aspect_den: i32,
}

/// Lifecycle state of the player facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    /// No media open
    Closed,
    /// An open call is in progress
    Opening,
    /// Media open, stage threads not started
    Idle,
    /// Stage threads running, clock advancing
    Playing,
    /// Stage threads running, clock frozen
    Paused,
    /// Teardown in progress
    Closing,
}

impl PlayerState {
    /// Returns true while the stage threads exist.
    pub fn is_active(&self) -> bool {
        matches!(self, PlayerState::Playing | PlayerState::Paused)
    }
}

/// Errors surfaced by the engine and its providers.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaError {
    /// The source could not be opened or probed
    OpenFailed(String),
    /// No decodable video stream in the container
    NoVideoStream,
    /// Codec context allocation/open failed
    CodecInit(String),
    /// The stream reports a non-positive resolution
    BadResolution { width: i32, height: i32 },
    /// Hardware setup failed; non-fatal, triggers software fallback
    HardwareAccel(String),
    /// Frame decoding error
    DecodeFailed(String),
    /// Seek operation failed
    SeekFailed(String),
    /// Read/seek error from the byte source
    Io(String),
}

impl std::fmt::Display for MediaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaError::OpenFailed(msg) => write!(f, "failed to open media: {msg}"),
            MediaError::NoVideoStream => write!(f, "no usable video stream"),
            MediaError::CodecInit(msg) => write!(f, "codec initialization failed: {msg}"),
            MediaError::BadResolution { width, height } => {
                write!(f, "stream reports degenerate resolution {width}x{height}")
            }
            MediaError::HardwareAccel(msg) => write!(f, "hardware acceleration failed: {msg}"),
            MediaError::DecodeFailed(msg) => write!(f, "frame decode failed: {msg}"),
            MediaError::SeekFailed(msg) => write!(f, "seek failed: {msg}"),
            MediaError::Io(msg) => write!(f, "i/o error: {msg}"),
        }
    }
}

impl std::error::Error for MediaError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_format_planes() {
        assert_eq!(PixelFormat::Yuv420p.num_planes(), 3);
        assert_eq!(PixelFormat::Nv12.num_planes(), 2);
        assert_eq!(PixelFormat::Rgba.num_planes(), 1);
    }

    #[test]
    fn test_rational_degenerate_denominator() {
        assert_eq!(Rational::new(1, 0).as_f64(), 0.0);
        assert_eq!(Rational::new(1, 4).as_f64(), 0.25);
    }

    #[test]
    fn test_time_value_or_zero() {
        assert_eq!(TimeValue::Known(42).or_zero(), 42);
        assert_eq!(TimeValue::Unknown.or_zero(), 0);
        assert!(!TimeValue::Unknown.is_known());
    }

    #[test]
    fn test_frame_dimensions() {
        let buffer = PixelBuffer::new(
            PixelFormat::Rgba,
            4,
            2,
            vec![Plane {
                data: vec![0; 32],
                stride: 16,
            }],
        );
        let frame = DecodedFrame {
            pts: 0,
            pixels: Arc::new(buffer),
            aspect: Rational::ONE,
            generation: 0,
        };
        assert_eq!(frame.width(), 4);
        assert_eq!(frame.height(), 2);
    }
}
