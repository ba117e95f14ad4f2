//! Player facade: the public lifecycle/control surface.
//!
//! Owns the three stage threads and all shared session state, and brokers
//! notifications between the pipeline and the listener/sink interfaces.
//!
//! # State Machine
//!
//! ```text
//! open_file/open_url/open_camera/open_desktop   [Closed]
//!   -> Opening -> Idle        on success (file_loaded + changed_frame_position)
//!   -> Closed                 on failure (everything released, returns false)
//!
//! play(start_paused)  [Idle]          -> Playing | Paused (spawns stages)
//! pause()             [Playing]       -> Paused
//! resume()            [Paused]        -> Playing
//! close()             [any non-Closed] -> Closing -> Closed
//! ```

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;

use url::Url;

use crate::codec::DecoderConfig;
use crate::container::{ContainerReader, MediaBackend};
use crate::decode::DecodeStage;
use crate::demux::{self, DemuxStage};
use crate::display::DisplayStage;
use crate::session::Session;
use crate::source::{MediaLocator, SourceAdapter};
use crate::video::{FrameRenderingData, MediaError, PixelFormat, PlayerState, TimeValue};

/// Lifecycle callbacks emitted by the engine.
///
/// Callbacks run on engine threads; implementations must not call back into
/// blocking player methods.
pub trait PlayerListener: Send + Sync {
    fn file_loaded(&self) {}
    fn file_released(&self) {}
    fn decoder_closed(&self) {}
    fn playing_finished(&self) {}
    fn changed_frame_position(&self, _start: i64, _current: i64, _end: i64) {}
}

/// Consumes presented frames.
///
/// `frame_ready` announces that a frame is offered; the sink pulls it via
/// [`Player::frame_rendering_data`] and acknowledges with
/// [`Player::finished_displaying_frame`] once it is done rendering.
pub trait PresentationSink: Send + Sync {
    fn frame_ready(&self, generation: u64);
}

/// Explicit stage-thread lifecycle, instead of a nullable handle.
enum StageState {
    NotStarted,
    Running(JoinHandle<()>),
    JoinRequested(JoinHandle<()>),
}

struct StageHandle {
    name: &'static str,
    state: StageState,
}

impl StageHandle {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            state: StageState::NotStarted,
        }
    }

    fn spawn(&mut self, f: impl FnOnce() + Send + 'static) {
        match std::thread::Builder::new().name(self.name.into()).spawn(f) {
            Ok(handle) => self.state = StageState::Running(handle),
            Err(err) => {
                tracing::error!(stage = self.name, "failed to spawn stage thread: {err}");
                self.state = StageState::NotStarted;
            }
        }
    }

    fn is_running(&self) -> bool {
        matches!(
            self.state,
            StageState::Running(_) | StageState::JoinRequested(_)
        )
    }

    fn request_join(&mut self) {
        if let StageState::Running(handle) =
            std::mem::replace(&mut self.state, StageState::NotStarted)
        {
            self.state = StageState::JoinRequested(handle);
        }
    }

    fn join(&mut self) {
        match std::mem::replace(&mut self.state, StageState::NotStarted) {
            StageState::Running(handle) | StageState::JoinRequested(handle) => {
                if handle.join().is_err() {
                    tracing::error!(stage = self.name, "stage thread panicked");
                }
            }
            StageState::NotStarted => {}
        }
    }
}

/// Provider handles held between a successful open and `play`.
struct OpenMedia {
    reader: Box<dyn ContainerReader>,
    decoder: Box<dyn crate::codec::VideoDecoder>,
    video_stream: usize,
}

/// The playback engine facade.
pub struct Player {
    backend: Arc<dyn MediaBackend>,
    listener: Option<Arc<dyn PlayerListener>>,
    sink: Option<Arc<dyn PresentationSink>>,

    output_format: PixelFormat,
    allow_hardware: bool,
    loop_enabled: bool,

    state: PlayerState,
    session: Option<Arc<Session>>,
    media: Option<OpenMedia>,
    is_file: bool,

    demux: StageHandle,
    decode: StageHandle,
    display: StageHandle,
}

impl Player {
    pub fn new(backend: Arc<dyn MediaBackend>) -> Self {
        Self {
            backend,
            listener: None,
            sink: None,
            output_format: PixelFormat::Yuv420p,
            allow_hardware: false,
            loop_enabled: false,
            state: PlayerState::Closed,
            session: None,
            media: None,
            is_file: false,
            demux: StageHandle::new("demux"),
            decode: StageHandle::new("decode"),
            display: StageHandle::new("display"),
        }
    }

    pub fn set_listener(&mut self, listener: Arc<dyn PlayerListener>) {
        self.listener = Some(listener);
    }

    pub fn set_sink(&mut self, sink: Arc<dyn PresentationSink>) {
        self.sink = Some(sink);
    }

    /// Selects the output pixel format and whether hardware-native surfaces
    /// are permitted. Applies to the next open.
    pub fn set_frame_format(&mut self, format: PixelFormat, allow_hardware: bool) {
        self.output_format = format;
        self.allow_hardware = allow_hardware;
    }

    pub fn state(&self) -> PlayerState {
        self.state
    }

    pub fn is_playing(&self) -> bool {
        self.state == PlayerState::Playing
    }

    pub fn is_paused(&self) -> bool {
        self.state == PlayerState::Paused
    }

    // =========================================================================
    // Opening
    // =========================================================================

    pub fn open_file(&mut self, path: impl AsRef<Path>) -> bool {
        self.open_locator(MediaLocator::File(path.as_ref().to_path_buf()))
    }

    pub fn open_url(&mut self, url: &str) -> bool {
        match Url::parse(url) {
            Ok(url) => self.open_locator(MediaLocator::Url(url)),
            Err(err) => {
                tracing::warn!(url, "invalid url: {err}");
                false
            }
        }
    }

    pub fn open_camera(&mut self) -> bool {
        self.open_locator(MediaLocator::Camera)
    }

    pub fn open_desktop(&mut self) -> bool {
        self.open_locator(MediaLocator::Desktop)
    }

    fn open_locator(&mut self, locator: MediaLocator) -> bool {
        if self.state != PlayerState::Closed {
            tracing::warn!(state = ?self.state, "open requested while not closed");
            return false;
        }
        self.state = PlayerState::Opening;
        let is_file = locator.is_file();

        match self.try_open(locator) {
            Ok(()) => {
                self.is_file = is_file;
                self.state = PlayerState::Idle;
                if let Some(listener) = &self.listener {
                    listener.file_loaded();
                    if let Some(session) = &self.session {
                        let timeline = *session.timeline.lock();
                        listener.changed_frame_position(
                            timeline.start.or_zero(),
                            timeline.start.or_zero(),
                            timeline.end(),
                        );
                    }
                }
                true
            }
            Err(err) => {
                tracing::warn!("open failed: {err}");
                // Strong exception safety: no partial session persists.
                self.session = None;
                self.media = None;
                self.state = PlayerState::Closed;
                false
            }
        }
    }

    fn try_open(&mut self, locator: MediaLocator) -> Result<(), MediaError> {
        let source = SourceAdapter::open(locator)?;
        let mut reader = self.backend.open_container(source)?;

        let video_stream =
            demux::select_video_stream(reader.streams()).ok_or(MediaError::NoVideoStream)?;
        let stream = reader
            .streams()
            .iter()
            .find(|s| s.index == video_stream)
            .cloned()
            .ok_or(MediaError::NoVideoStream)?;

        if stream.width <= 0 || stream.height <= 0 {
            return Err(MediaError::BadResolution {
                width: stream.width,
                height: stream.height,
            });
        }

        let config = DecoderConfig {
            output_format: self.output_format,
            allow_hardware: self.allow_hardware,
            software: Default::default(),
        };
        let decoder = reader.open_video_decoder(video_stream, &config)?;

        let timeline = demux::compute_timeline(&stream, reader.as_ref());
        tracing::info!(
            stream = video_stream,
            codec = %stream.codec_name,
            width = stream.width,
            height = stream.height,
            start = ?timeline.start,
            duration = ?timeline.duration,
            "media opened"
        );

        let session = Arc::new(Session::new(timeline));
        session
            .loop_enabled
            .store(self.loop_enabled, Ordering::Release);

        self.session = Some(session);
        self.media = Some(OpenMedia {
            reader,
            decoder,
            video_stream,
        });
        Ok(())
    }

    // =========================================================================
    // Playback control
    // =========================================================================

    /// Spawns the stage threads. A no-op while already playing.
    pub fn play(&mut self, start_paused: bool) {
        match self.state {
            PlayerState::Idle => {}
            PlayerState::Playing | PlayerState::Paused => {
                tracing::debug!("play ignored, already playing");
                return;
            }
            _ => {
                tracing::warn!(state = ?self.state, "play requested with no open media");
                return;
            }
        }
        let (Some(session), Some(media)) = (self.session.as_ref(), self.media.take()) else {
            tracing::warn!("play requested with no open media");
            return;
        };
        let session = Arc::clone(session);
        session.set_paused(start_paused);

        let demux_stage = DemuxStage::new(
            Arc::clone(&session),
            media.reader,
            media.video_stream,
            self.listener.clone(),
        );
        self.demux.spawn(move || demux_stage.run());

        let decode_stage =
            DecodeStage::new(Arc::clone(&session), media.decoder, self.output_format);
        self.decode.spawn(move || decode_stage.run());

        let display_stage =
            DisplayStage::new(session, self.sink.clone(), self.listener.clone());
        self.display.spawn(move || display_stage.run());

        self.state = if start_paused {
            PlayerState::Paused
        } else {
            PlayerState::Playing
        };
        tracing::info!(start_paused, "playback started");
    }

    pub fn pause(&mut self) {
        if self.state != PlayerState::Playing {
            return;
        }
        if let Some(session) = &self.session {
            session.set_paused(true);
        }
        self.state = PlayerState::Paused;
        tracing::debug!("paused");
    }

    pub fn resume(&mut self) {
        if self.state != PlayerState::Paused {
            return;
        }
        if let Some(session) = &self.session {
            session.set_paused(false);
        }
        self.state = PlayerState::Playing;
        tracing::debug!("resumed");
    }

    /// Requests an absolute seek. Accepted only while the stages are running
    /// and only for file-backed sessions.
    pub fn seek_duration(&mut self, target: i64) -> bool {
        if !self.is_file || !self.state.is_active() {
            return false;
        }
        let Some(session) = &self.session else {
            return false;
        };
        let target = target.max(0);
        if session.pending_seek.request(target) {
            session.packets.notify();
            session.notify_control();
        }
        tracing::debug!(seek_target = target, "seek requested");
        true
    }

    /// Seeks to a fraction of the duration. False for non-file sessions or
    /// an out-of-range fraction.
    pub fn seek_by_percent(&mut self, percent: f64) -> bool {
        if !(0.0..=1.0).contains(&percent) {
            return false;
        }
        let Some(session) = &self.session else {
            return false;
        };
        let timeline = *session.timeline.lock();
        let target = timeline.start.or_zero() + (timeline.duration.or_zero() as f64 * percent) as i64;
        self.seek_duration(target)
    }

    /// Requests an internal reset at the current position (error recovery /
    /// loop restart). Frame delivery is suppressed until the resync completes.
    pub fn video_reset(&mut self) {
        if !self.state.is_active() {
            return;
        }
        let Some(session) = &self.session else {
            return;
        };
        session.resetting.store(true, Ordering::Release);
        let current = session.current_pts.load(Ordering::Acquire);
        if session.pending_reset.request(current) {
            session.packets.notify();
            session.notify_control();
        }
        tracing::debug!(current, "reset requested");
    }

    pub fn set_loop_enabled(&mut self, enabled: bool) {
        self.loop_enabled = enabled;
        if let Some(session) = &self.session {
            session.loop_enabled.store(enabled, Ordering::Release);
        }
    }

    /// Tears the session down. Safe to call at any point, including mid-seek;
    /// permitted from any state and a no-op when already closed.
    pub fn close(&mut self) {
        if self.state == PlayerState::Closed {
            return;
        }
        self.state = PlayerState::Closing;
        tracing::debug!("closing");

        if let Some(session) = &self.session {
            session.interrupt();
        }
        // Demux governs the others, so it goes down first.
        self.demux.request_join();
        self.decode.request_join();
        self.display.request_join();
        self.demux.join();
        self.decode.join();
        self.display.join();

        let was_open = self.session.is_some();
        if let Some(session) = self.session.take() {
            session.packets.clear();
            session.frames.clear();
        }
        // Dropping the provider handles releases codec/container/source.
        self.media = None;
        self.state = PlayerState::Closed;

        if let Some(listener) = &self.listener {
            if was_open {
                listener.file_released();
            }
            listener.decoder_closed();
            listener.playing_finished();
        }
        tracing::info!("closed");
    }

    // =========================================================================
    // Frame consumption
    // =========================================================================

    /// The currently offered frame, unless none is offered or the session is
    /// mid-reset.
    pub fn frame_rendering_data(&self) -> Option<FrameRenderingData> {
        self.session.as_ref()?.frame_rendering_data()
    }

    /// Acknowledges the offered frame. Stale generations are a no-op.
    pub fn finished_displaying_frame(&self, generation: u64) {
        if let Some(session) = &self.session {
            session.finish_displaying(generation);
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Current presentation position in stream time-base units.
    pub fn position(&self) -> i64 {
        self.session
            .as_ref()
            .map(|s| s.current_pts.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn start_time(&self) -> TimeValue {
        self.session
            .as_ref()
            .map(|s| s.timeline.lock().start)
            .unwrap_or(TimeValue::Unknown)
    }

    pub fn duration(&self) -> TimeValue {
        self.session
            .as_ref()
            .map(|s| s.timeline.lock().duration)
            .unwrap_or(TimeValue::Unknown)
    }

    /// Session generation; bumped once per completed seek/reset.
    pub fn generation(&self) -> u64 {
        self.session.as_ref().map(|s| s.generation()).unwrap_or(0)
    }

    /// True while any stage thread is running (used by tests and teardown
    /// diagnostics).
    pub fn has_running_stages(&self) -> bool {
        self.demux.is_running() || self.decode.is_running() || self.display.is_running()
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.close();
    }
}
