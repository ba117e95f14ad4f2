//! FFmpeg-backed media provider (feature `ffmpeg`).
//!
//! Implements [`MediaBackend`] on top of `ffmpeg-next`: container demuxing,
//! codec open with an optional hardware device context, and hardware frame
//! download via `av_hwframe_transfer_data` followed by software scaling to
//! the requested output format.
//!
//! FFmpeg libraries must be installed on the system:
//! - **macOS**: `brew install ffmpeg`
//! - **Ubuntu/Debian**: `apt-get install libavcodec-dev libavformat-dev
//!   libavutil-dev libswscale-dev libavdevice-dev`
//! - **Windows**: shared libraries from <https://ffmpeg.org/download.html>

use std::ffi::CString;

use bytes::Bytes;
use ffmpeg_next as ffmpeg;
use ffmpeg_next::ffi;

use crate::codec::{
    DecodeBackend, DecoderConfig, FrameSurface, HardwareSurface, RawFrame, VideoDecoder,
};
use crate::container::{ContainerReader, MediaBackend, Packet, StreamInfo, StreamKind};
use crate::source::{CaptureBackend, MediaLocator, OpenedSource, NETWORK_TIMEOUT};
use crate::video::{MediaError, PixelBuffer, PixelFormat, Plane, Rational, TimeValue};

fn to_ffmpeg_pixel(format: PixelFormat) -> ffmpeg::format::Pixel {
    match format {
        PixelFormat::Yuv420p => ffmpeg::format::Pixel::YUV420P,
        PixelFormat::Nv12 => ffmpeg::format::Pixel::NV12,
        PixelFormat::Rgb24 => ffmpeg::format::Pixel::RGB24,
        PixelFormat::Rgba => ffmpeg::format::Pixel::RGBA,
        PixelFormat::Bgra => ffmpeg::format::Pixel::BGRA,
    }
}

fn time_value(raw: i64) -> TimeValue {
    if raw > 0 && raw != ffi::AV_NOPTS_VALUE {
        TimeValue::Known(raw)
    } else {
        TimeValue::Unknown
    }
}

/// The FFmpeg demux/decode provider.
pub struct FfmpegBackend;

impl FfmpegBackend {
    pub fn new() -> Result<Self, MediaError> {
        ffmpeg::init().map_err(|e| MediaError::OpenFailed(format!("ffmpeg init: {e}")))?;
        Ok(Self)
    }
}

impl MediaBackend for FfmpegBackend {
    fn open_container(
        &self,
        source: OpenedSource,
    ) -> Result<Box<dyn ContainerReader>, MediaError> {
        let input = match &source.locator {
            MediaLocator::File(path) => ffmpeg::format::input(path)
                .map_err(|e| MediaError::OpenFailed(format!("{}: {e}", path.display())))?,
            MediaLocator::Url(url) => {
                let mut options = ffmpeg::Dictionary::new();
                let timeout = source.network_timeout.unwrap_or(NETWORK_TIMEOUT);
                options.set("stimeout", &timeout.as_micros().to_string());
                ffmpeg::format::input_with_dictionary(&url.as_str(), options)
                    .map_err(|e| MediaError::OpenFailed(format!("{url}: {e}")))?
            }
            MediaLocator::Camera | MediaLocator::Desktop => {
                let capture = source
                    .capture
                    .as_ref()
                    .ok_or_else(|| MediaError::OpenFailed("no capture backend".into()))?;
                open_capture(capture)?
            }
        };

        let streams = enumerate_streams(&input);
        tracing::debug!(streams = streams.len(), "container opened");
        Ok(Box::new(FfmpegContainer { input, streams }))
    }
}

/// Opens a named capture device (camera/desktop) through libavdevice.
fn open_capture(capture: &CaptureBackend) -> Result<ffmpeg::format::context::Input, MediaError> {
    ffmpeg::device::register_all();

    let name = CString::new(capture.name)
        .map_err(|e| MediaError::OpenFailed(format!("backend name: {e}")))?;
    let target = CString::new(capture.target.unwrap_or(""))
        .map_err(|e| MediaError::OpenFailed(format!("capture target: {e}")))?;

    unsafe {
        let format = ffi::av_find_input_format(name.as_ptr());
        if format.is_null() {
            return Err(MediaError::OpenFailed(format!(
                "capture backend {} not available",
                capture.name
            )));
        }
        let mut ctx: *mut ffi::AVFormatContext = std::ptr::null_mut();
        let ret = ffi::avformat_open_input(
            &mut ctx,
            target.as_ptr(),
            format as *mut ffi::AVInputFormat,
            std::ptr::null_mut(),
        );
        if ret < 0 {
            return Err(MediaError::OpenFailed(format!(
                "capture backend {} open failed: {ret}",
                capture.name
            )));
        }
        let ret = ffi::avformat_find_stream_info(ctx, std::ptr::null_mut());
        if ret < 0 {
            ffi::avformat_close_input(&mut ctx);
            return Err(MediaError::OpenFailed(format!(
                "capture stream info failed: {ret}"
            )));
        }
        Ok(ffmpeg::format::context::Input::wrap(ctx))
    }
}

fn enumerate_streams(input: &ffmpeg::format::context::Input) -> Vec<StreamInfo> {
    input
        .streams()
        .map(|stream| {
            let params = stream.parameters();
            // Width/height/aspect/kind come from the raw codec parameters;
            // the safe wrapper does not expose them pre-open.
            let (kind, width, height, aspect) = unsafe {
                let par = params.as_ptr();
                let kind = match (*par).codec_type {
                    ffi::AVMediaType::AVMEDIA_TYPE_VIDEO => StreamKind::Video,
                    ffi::AVMediaType::AVMEDIA_TYPE_AUDIO => StreamKind::Audio,
                    _ => StreamKind::Other,
                };
                let sar = (*par).sample_aspect_ratio;
                let aspect = if sar.num > 0 && sar.den > 0 {
                    Some(Rational::new(sar.num, sar.den))
                } else {
                    None
                };
                (kind, (*par).width, (*par).height, aspect)
            };
            let time_base = stream.time_base();
            let codec_name = ffmpeg::codec::decoder::find(params.id())
                .map(|c| c.name().to_string())
                .unwrap_or_else(|| "unknown".to_string());
            StreamInfo {
                index: stream.index(),
                kind,
                time_base: Rational::new(time_base.0, time_base.1),
                start_time: time_value(stream.start_time()),
                duration: time_value(stream.duration()),
                width,
                height,
                pixel_aspect: aspect,
                codec_name,
            }
        })
        .collect()
}

struct FfmpegContainer {
    input: ffmpeg::format::context::Input,
    streams: Vec<StreamInfo>,
}

// SAFETY: the format context is owned exclusively by this struct, and the
// pipeline moves the container onto the demux thread without sharing it.
unsafe impl Send for FfmpegContainer {}

impl ContainerReader for FfmpegContainer {
    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn container_start_us(&self) -> TimeValue {
        // Not exposed by the safe wrapper.
        time_value(unsafe { (*self.input.as_ptr()).start_time })
    }

    fn container_duration_us(&self) -> TimeValue {
        time_value(self.input.duration())
    }

    fn open_video_decoder(
        &mut self,
        stream_index: usize,
        config: &DecoderConfig,
    ) -> Result<Box<dyn VideoDecoder>, MediaError> {
        let stream = self
            .input
            .stream(stream_index)
            .ok_or(MediaError::NoVideoStream)?;
        let params = stream.parameters();

        let mut context = ffmpeg::codec::context::Context::from_parameters(params)
            .map_err(|e| MediaError::CodecInit(format!("codec context: {e}")))?;

        let (hw_device, backend) = init_hardware(&mut context, config);
        if backend == DecodeBackend::Software {
            // Software fallback: multi-threaded decode plus the fast,
            // speed-over-conformance trade-off.
            unsafe {
                let ptr = context.as_mut_ptr();
                (*ptr).thread_count = config.software.threads as i32;
                if config.software.fast {
                    (*ptr).flags2 |= ffi::AV_CODEC_FLAG2_FAST as i32;
                }
            }
        }

        let decoder = context
            .decoder()
            .video()
            .map_err(|e| MediaError::CodecInit(format!("codec open: {e}")))?;

        if decoder.width() == 0 || decoder.height() == 0 {
            return Err(MediaError::BadResolution {
                width: decoder.width() as i32,
                height: decoder.height() as i32,
            });
        }

        let aspect = {
            let sar = decoder.aspect_ratio();
            if sar.0 > 0 && sar.1 > 0 {
                Some(Rational::new(sar.0, sar.1))
            } else {
                None
            }
        };

        tracing::info!(
            backend = ?backend,
            width = decoder.width(),
            height = decoder.height(),
            "video decoder opened"
        );

        Ok(Box::new(FfmpegVideoDecoder {
            decoder,
            backend,
            output_format: config.output_format,
            aspect,
            scaler: None,
            _hw_device: hw_device,
        }))
    }

    fn read_packet(&mut self) -> Result<Option<Packet>, MediaError> {
        let mut packet = ffmpeg::Packet::empty();
        loop {
            match packet.read(&mut self.input) {
                Ok(()) => {
                    let data = packet
                        .data()
                        .map(Bytes::copy_from_slice)
                        .unwrap_or_default();
                    return Ok(Some(Packet {
                        stream_index: packet.stream(),
                        pts: packet.pts().or(packet.dts()).unwrap_or(0),
                        data,
                        is_keyframe: packet.is_key(),
                    }));
                }
                Err(ffmpeg::Error::Eof) => return Ok(None),
                Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => continue,
                Err(e) => return Err(MediaError::Io(e.to_string())),
            }
        }
    }

    fn seek(&mut self, stream_index: usize, pts: i64) -> Result<(), MediaError> {
        // Backward flag lands on the nearest keyframe at-or-before the target.
        let ret = unsafe {
            ffi::av_seek_frame(
                self.input.as_mut_ptr(),
                stream_index as i32,
                pts,
                ffi::AVSEEK_FLAG_BACKWARD as i32,
            )
        };
        if ret < 0 {
            return Err(MediaError::SeekFailed(format!("av_seek_frame: {ret}")));
        }
        Ok(())
    }
}

/// RAII wrapper for a hardware device context buffer reference.
struct HwDeviceCtx {
    ptr: *mut ffi::AVBufferRef,
}

impl HwDeviceCtx {
    fn create(hw_type: ffi::AVHWDeviceType) -> Option<Self> {
        let mut ptr: *mut ffi::AVBufferRef = std::ptr::null_mut();
        let ret = unsafe {
            ffi::av_hwdevice_ctx_create(
                &mut ptr,
                hw_type,
                std::ptr::null(),
                std::ptr::null_mut(),
                0,
            )
        };
        if ret < 0 || ptr.is_null() {
            tracing::warn!(?hw_type, ret, "hardware device context unavailable");
            None
        } else {
            Some(Self { ptr })
        }
    }
}

impl Drop for HwDeviceCtx {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe { ffi::av_buffer_unref(&mut self.ptr) };
        }
    }
}

// SAFETY: exclusive ownership of the buffer reference; only the decode
// thread touches it after open.
unsafe impl Send for HwDeviceCtx {}

#[cfg(target_os = "macos")]
const PLATFORM_HW_TYPE: ffi::AVHWDeviceType = ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_VIDEOTOOLBOX;
#[cfg(target_os = "linux")]
const PLATFORM_HW_TYPE: ffi::AVHWDeviceType = ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_VAAPI;
#[cfg(target_os = "windows")]
const PLATFORM_HW_TYPE: ffi::AVHWDeviceType = ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_DXVA2;
#[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
const PLATFORM_HW_TYPE: ffi::AVHWDeviceType = ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_NONE;

/// Attempts hardware setup; any failure falls back to software decode.
fn init_hardware(
    context: &mut ffmpeg::codec::context::Context,
    config: &DecoderConfig,
) -> (Option<HwDeviceCtx>, DecodeBackend) {
    // Negotiation: the provider's surfaces download as NV12.
    if config.preferred_hardware_format(&[PixelFormat::Nv12]).is_none() {
        return (None, DecodeBackend::Software);
    }
    if PLATFORM_HW_TYPE == ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_NONE {
        return (None, DecodeBackend::Software);
    }
    match HwDeviceCtx::create(PLATFORM_HW_TYPE) {
        Some(device) => {
            unsafe {
                (*context.as_mut_ptr()).hw_device_ctx = ffi::av_buffer_ref(device.ptr);
            }
            tracing::info!(hw_type = ?PLATFORM_HW_TYPE, "hardware decode enabled");
            (Some(device), DecodeBackend::Hardware)
        }
        None => {
            tracing::warn!("hardware setup failed, falling back to software decode");
            (None, DecodeBackend::Software)
        }
    }
}

fn is_hardware_frame(frame: &ffmpeg::frame::Video) -> bool {
    let format = unsafe { (*frame.as_ptr()).format };
    format == ffi::AVPixelFormat::AV_PIX_FMT_VIDEOTOOLBOX as i32
        || format == ffi::AVPixelFormat::AV_PIX_FMT_VAAPI as i32
        || format == ffi::AVPixelFormat::AV_PIX_FMT_D3D11 as i32
        || format == ffi::AVPixelFormat::AV_PIX_FMT_DXVA2_VLD as i32
}

/// Copies an ffmpeg frame's planes into an owned [`PixelBuffer`].
fn buffer_from_frame(frame: &ffmpeg::frame::Video, format: PixelFormat) -> PixelBuffer {
    let planes = (0..format.num_planes())
        .map(|i| Plane {
            data: frame.data(i).to_vec(),
            stride: frame.stride(i),
        })
        .collect();
    PixelBuffer::new(format, frame.width(), frame.height(), planes)
}

/// Scales/converts a CPU frame to the requested output format.
fn convert_frame(
    scaler: &mut Option<ffmpeg::software::scaling::Context>,
    frame: &ffmpeg::frame::Video,
    format: PixelFormat,
) -> Result<PixelBuffer, MediaError> {
    let dst = to_ffmpeg_pixel(format);
    if frame.format() == dst {
        return Ok(buffer_from_frame(frame, format));
    }

    // Recreate the scaler when the source geometry or format changes.
    let needs_recreate = scaler.as_ref().map_or(true, |s| {
        let input = s.input();
        input.format != frame.format()
            || input.width != frame.width()
            || input.height != frame.height()
    });
    if needs_recreate {
        let ctx = ffmpeg::software::scaling::Context::get(
            frame.format(),
            frame.width(),
            frame.height(),
            dst,
            frame.width(),
            frame.height(),
            ffmpeg::software::scaling::Flags::BILINEAR,
        )
        .map_err(|e| MediaError::DecodeFailed(format!("scaler: {e}")))?;
        *scaler = Some(ctx);
    }

    let Some(scaler) = scaler.as_mut() else {
        return Err(MediaError::DecodeFailed("scaler not initialized".into()));
    };
    let mut converted = ffmpeg::frame::Video::empty();
    scaler
        .run(frame, &mut converted)
        .map_err(|e| MediaError::DecodeFailed(format!("scaling: {e}")))?;
    Ok(buffer_from_frame(&converted, format))
}

/// A decoded frame still resident on a device surface.
struct FfmpegHwSurface {
    frame: ffmpeg::frame::Video,
}

// SAFETY: the frame's buffer references are reference-counted by libav and
// the surface is consumed by the single decode-stage thread.
unsafe impl Send for FfmpegHwSurface {}

impl HardwareSurface for FfmpegHwSurface {
    fn download(&self, format: PixelFormat) -> Result<PixelBuffer, MediaError> {
        let mut sw_frame = ffmpeg::frame::Video::empty();
        let ret = unsafe {
            ffi::av_hwframe_transfer_data(sw_frame.as_mut_ptr(), self.frame.as_ptr(), 0)
        };
        if ret < 0 {
            return Err(MediaError::HardwareAccel(format!(
                "av_hwframe_transfer_data: {ret}"
            )));
        }
        let mut scaler = None;
        convert_frame(&mut scaler, &sw_frame, format)
    }

    fn width(&self) -> u32 {
        self.frame.width()
    }

    fn height(&self) -> u32 {
        self.frame.height()
    }
}

struct FfmpegVideoDecoder {
    decoder: ffmpeg::decoder::Video,
    backend: DecodeBackend,
    output_format: PixelFormat,
    aspect: Option<Rational>,
    scaler: Option<ffmpeg::software::scaling::Context>,
    /// Kept alive for the decoder lifetime.
    _hw_device: Option<HwDeviceCtx>,
}

// SAFETY: the codec context is owned exclusively by this struct and the
// pipeline confines it to the decode thread.
unsafe impl Send for FfmpegVideoDecoder {}

impl VideoDecoder for FfmpegVideoDecoder {
    fn send_packet(&mut self, packet: &Packet) -> Result<(), MediaError> {
        let mut av_packet = ffmpeg::Packet::copy(&packet.data);
        av_packet.set_pts(Some(packet.pts));
        self.decoder
            .send_packet(&av_packet)
            .map_err(|e| MediaError::DecodeFailed(format!("send_packet: {e}")))
    }

    fn receive_frame(&mut self) -> Result<Option<RawFrame>, MediaError> {
        let mut frame = ffmpeg::frame::Video::empty();
        match self.decoder.receive_frame(&mut frame) {
            Ok(()) => {
                let pts = frame.pts().unwrap_or(0);
                let surface = if is_hardware_frame(&frame) {
                    FrameSurface::Hardware(Box::new(FfmpegHwSurface { frame }))
                } else {
                    FrameSurface::Software(convert_frame(
                        &mut self.scaler,
                        &frame,
                        self.output_format,
                    )?)
                };
                Ok(Some(RawFrame {
                    pts,
                    surface,
                    aspect: self.aspect,
                }))
            }
            Err(ffmpeg::Error::Eof) => Ok(None),
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => Ok(None),
            Err(e) => Err(MediaError::DecodeFailed(e.to_string())),
        }
    }

    fn send_eof(&mut self) -> Result<(), MediaError> {
        self.decoder
            .send_eof()
            .map_err(|e| MediaError::DecodeFailed(format!("send_eof: {e}")))
    }

    fn flush(&mut self) {
        self.decoder.flush();
    }

    fn backend(&self) -> DecodeBackend {
        self.backend
    }
}
