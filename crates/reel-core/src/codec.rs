//! Codec seam: decode contexts and the hardware/software surface duality.

use crate::container::Packet;
use crate::video::{MediaError, PixelBuffer, PixelFormat, Rational};

/// Which path a decode context was opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeBackend {
    Hardware,
    Software,
}

/// A frame still resident on a device surface.
///
/// The buffer behind the surface belongs to the provider and is recycled
/// once the surface is dropped, so [`HardwareSurface::download`] must be
/// called before handing the frame to anything that outlives the surface.
pub trait HardwareSurface: Send {
    /// Copies the surface into a CPU pixel buffer in `format`.
    fn download(&self, format: PixelFormat) -> Result<PixelBuffer, MediaError>;

    fn width(&self) -> u32;

    fn height(&self) -> u32;
}

/// Raw decoder output, before normalization by the decode stage.
pub enum FrameSurface {
    /// Device-resident frame; downloaded before queueing
    Hardware(Box<dyn HardwareSurface>),
    /// CPU frame passed through as-is
    Software(PixelBuffer),
}

/// One frame as produced by a decode context.
pub struct RawFrame {
    /// Presentation timestamp in stream time-base units
    pub pts: i64,
    pub surface: FrameSurface,
    /// Pixel aspect ratio when the codec reports one
    pub aspect: Option<Rational>,
}

/// Software-decode tuning applied when hardware setup fails or is declined.
#[derive(Debug, Clone, Copy)]
pub struct SoftwareConfig {
    /// Worker threads for the codec; zero lets the provider decide.
    pub threads: usize,
    /// Enable the codec's speed-over-conformance trade-off.
    pub fast: bool,
}

impl Default for SoftwareConfig {
    fn default() -> Self {
        Self {
            threads: 2,
            fast: true,
        }
    }
}

/// How a decode context should be opened.
#[derive(Debug, Clone)]
pub struct DecoderConfig {
    /// Output pixel format for normalized frames. Must be one of the
    /// provider's native enumerants.
    pub output_format: PixelFormat,
    /// Permit hardware-native surfaces; when denied the provider opens a
    /// software context directly.
    pub allow_hardware: bool,
    /// Fallback tuning for software decode.
    pub software: SoftwareConfig,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            output_format: PixelFormat::Yuv420p,
            allow_hardware: false,
            software: SoftwareConfig::default(),
        }
    }
}

impl DecoderConfig {
    /// Device-context negotiation: given the provider's native surface
    /// formats, reports the preferred one. `None` declines hardware output
    /// and the provider falls back to software decode.
    pub fn preferred_hardware_format(&self, native: &[PixelFormat]) -> Option<PixelFormat> {
        if !self.allow_hardware {
            return None;
        }
        native
            .iter()
            .copied()
            .find(|f| *f == self.output_format)
            .or_else(|| native.first().copied())
    }
}

/// An opened decode context. Owned by the decode stage thread.
pub trait VideoDecoder: Send {
    /// Submits one compressed packet. The codec may buffer internally and
    /// produce zero or more frames per packet.
    fn send_packet(&mut self, packet: &Packet) -> Result<(), MediaError>;

    /// Drains the next produced frame, if any.
    fn receive_frame(&mut self) -> Result<Option<RawFrame>, MediaError>;

    /// Signals end of input so delayed frames can be drained.
    fn send_eof(&mut self) -> Result<(), MediaError>;

    /// Drops the codec's internal buffers after a seek.
    fn flush(&mut self);

    /// Which decode path the context was opened with.
    fn backend(&self) -> DecodeBackend;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiation_declines_when_hardware_denied() {
        let config = DecoderConfig {
            allow_hardware: false,
            ..DecoderConfig::default()
        };
        assert_eq!(
            config.preferred_hardware_format(&[PixelFormat::Nv12]),
            None
        );
    }

    #[test]
    fn test_negotiation_prefers_output_format() {
        let config = DecoderConfig {
            output_format: PixelFormat::Nv12,
            allow_hardware: true,
            ..DecoderConfig::default()
        };
        assert_eq!(
            config.preferred_hardware_format(&[PixelFormat::Yuv420p, PixelFormat::Nv12]),
            Some(PixelFormat::Nv12)
        );
        // Falls back to the provider's first native format.
        assert_eq!(
            config.preferred_hardware_format(&[PixelFormat::Bgra]),
            Some(PixelFormat::Bgra)
        );
    }
}
