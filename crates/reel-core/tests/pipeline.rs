//! End-to-end pipeline tests against a scripted media backend.
//!
//! The mock container produces one video frame per packet at a fixed PTS
//! step (time base 1/1000, so PTS values are milliseconds). The test thread
//! plays the presentation sink's role: it receives `frame_ready`
//! notifications over a channel, pulls the offered frame, and acknowledges.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};

use reel_core::{
    ContainerReader, DecodeBackend, DecoderConfig, FrameSurface, HardwareSurface, MediaBackend,
    MediaError, OpenedSource, Packet, PixelBuffer, PixelFormat, Plane, Player, PlayerListener,
    PlayerState, PresentationSink, RawFrame, Rational, StreamInfo, StreamKind, TimeValue,
    VideoDecoder,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

// =============================================================================
// Scripted backend
// =============================================================================

#[derive(Clone)]
struct MockSpec {
    /// Number of video packets (one frame each)
    frames: usize,
    /// PTS step between packets, in milliseconds
    step: i64,
    start: TimeValue,
    duration: TimeValue,
    include_video: bool,
    /// Produce frames on hardware surfaces
    hardware: bool,
}

impl Default for MockSpec {
    fn default() -> Self {
        Self {
            frames: 5,
            step: 20,
            start: TimeValue::Known(0),
            duration: TimeValue::Known(10_000),
            include_video: true,
            hardware: false,
        }
    }
}

struct MockBackend {
    spec: MockSpec,
}

impl MediaBackend for MockBackend {
    fn open_container(
        &self,
        _source: OpenedSource,
    ) -> Result<Box<dyn ContainerReader>, MediaError> {
        let mut streams = vec![StreamInfo {
            index: 0,
            kind: StreamKind::Audio,
            time_base: Rational::new(1, 48_000),
            start_time: TimeValue::Unknown,
            duration: TimeValue::Unknown,
            width: 0,
            height: 0,
            pixel_aspect: None,
            codec_name: "aac".into(),
        }];
        if self.spec.include_video {
            streams.push(StreamInfo {
                index: 1,
                kind: StreamKind::Video,
                time_base: Rational::new(1, 1000),
                start_time: self.spec.start,
                duration: self.spec.duration,
                width: 64,
                height: 48,
                pixel_aspect: Some(Rational::new(1, 1)),
                codec_name: "h264".into(),
            });
        }
        Ok(Box::new(MockReader {
            spec: self.spec.clone(),
            streams,
            next: 0,
            audio_turn: true,
        }))
    }
}

struct MockReader {
    spec: MockSpec,
    streams: Vec<StreamInfo>,
    /// Index of the next video packet
    next: usize,
    /// Interleave one audio packet before each video packet
    audio_turn: bool,
}

impl ContainerReader for MockReader {
    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn container_start_us(&self) -> TimeValue {
        TimeValue::Unknown
    }

    fn container_duration_us(&self) -> TimeValue {
        TimeValue::Unknown
    }

    fn open_video_decoder(
        &mut self,
        _stream_index: usize,
        config: &DecoderConfig,
    ) -> Result<Box<dyn VideoDecoder>, MediaError> {
        Ok(Box::new(MockDecoder {
            pending: VecDeque::new(),
            output_format: config.output_format,
            hardware: self.spec.hardware,
        }))
    }

    fn read_packet(&mut self) -> Result<Option<Packet>, MediaError> {
        // A touch of latency so EOF loop-restarts do not spin unthrottled
        // the way a zero-cost in-memory read would.
        std::thread::sleep(Duration::from_millis(1));
        if self.next >= self.spec.frames {
            return Ok(None);
        }
        let pts = self.spec.start.or_zero() + self.next as i64 * self.spec.step;
        if self.audio_turn {
            self.audio_turn = false;
            return Ok(Some(Packet {
                stream_index: 0,
                pts,
                data: bytes::Bytes::from_static(b"audio"),
                is_keyframe: false,
            }));
        }
        self.audio_turn = true;
        self.next += 1;
        Ok(Some(Packet {
            stream_index: 1,
            pts,
            data: bytes::Bytes::from_static(b"video"),
            is_keyframe: true,
        }))
    }

    fn seek(&mut self, _stream_index: usize, pts: i64) -> Result<(), MediaError> {
        let offset = (pts - self.spec.start.or_zero()).max(0);
        let index = (offset / self.spec.step) as usize;
        self.next = index.min(self.spec.frames);
        self.audio_turn = true;
        Ok(())
    }
}

struct MockHwSurface {
    pts: i64,
}

impl HardwareSurface for MockHwSurface {
    fn download(&self, format: PixelFormat) -> Result<PixelBuffer, MediaError> {
        Ok(test_buffer(format, self.pts))
    }

    fn width(&self) -> u32 {
        64
    }

    fn height(&self) -> u32 {
        48
    }
}

fn test_buffer(format: PixelFormat, pts: i64) -> PixelBuffer {
    PixelBuffer::new(
        format,
        64,
        48,
        vec![Plane {
            data: vec![(pts % 251) as u8; 64 * 48],
            stride: 64,
        }],
    )
}

struct MockDecoder {
    pending: VecDeque<RawFrame>,
    output_format: PixelFormat,
    hardware: bool,
}

impl VideoDecoder for MockDecoder {
    fn send_packet(&mut self, packet: &Packet) -> Result<(), MediaError> {
        let surface = if self.hardware {
            FrameSurface::Hardware(Box::new(MockHwSurface { pts: packet.pts }))
        } else {
            FrameSurface::Software(test_buffer(self.output_format, packet.pts))
        };
        self.pending.push_back(RawFrame {
            pts: packet.pts,
            surface,
            aspect: Some(Rational::new(1, 1)),
        });
        Ok(())
    }

    fn receive_frame(&mut self) -> Result<Option<RawFrame>, MediaError> {
        Ok(self.pending.pop_front())
    }

    fn send_eof(&mut self) -> Result<(), MediaError> {
        Ok(())
    }

    fn flush(&mut self) {
        self.pending.clear();
    }

    fn backend(&self) -> DecodeBackend {
        if self.hardware {
            DecodeBackend::Hardware
        } else {
            DecodeBackend::Software
        }
    }
}

// =============================================================================
// Listener / sink harness
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Loaded,
    Released,
    Closed,
    Finished,
    Position { current: i64 },
}

struct ChannelListener {
    tx: Sender<Event>,
}

impl PlayerListener for ChannelListener {
    fn file_loaded(&self) {
        let _ = self.tx.send(Event::Loaded);
    }

    fn file_released(&self) {
        let _ = self.tx.send(Event::Released);
    }

    fn decoder_closed(&self) {
        let _ = self.tx.send(Event::Closed);
    }

    fn playing_finished(&self) {
        let _ = self.tx.send(Event::Finished);
    }

    fn changed_frame_position(&self, _start: i64, current: i64, _end: i64) {
        let _ = self.tx.send(Event::Position { current });
    }
}

struct ChannelSink {
    tx: Sender<u64>,
}

impl PresentationSink for ChannelSink {
    fn frame_ready(&self, generation: u64) {
        let _ = self.tx.send(generation);
    }
}

struct Harness {
    player: Player,
    events: Receiver<Event>,
    ready: Receiver<u64>,
    file: tempfile::NamedTempFile,
}

fn harness(spec: MockSpec) -> Harness {
    let (event_tx, events) = unbounded();
    let (ready_tx, ready) = unbounded();
    let mut player = Player::new(Arc::new(MockBackend { spec }));
    player.set_listener(Arc::new(ChannelListener { tx: event_tx }));
    player.set_sink(Arc::new(ChannelSink { tx: ready_tx }));

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"mock-container-bytes").unwrap();

    Harness {
        player,
        events,
        ready,
        file,
    }
}

impl Harness {
    fn open(&mut self) -> bool {
        let path = self.file.path().to_path_buf();
        self.player.open_file(path)
    }

    /// Receives a `frame_ready`, pulls the offered frame, and acknowledges.
    ///
    /// Notifications for frames that a seek made stale can still sit in the
    /// channel; those either find no offered frame (skipped) or ack with a
    /// stale generation (a no-op, retried on the re-present notification).
    fn ack_next(&self) -> Option<(u64, u32, u32)> {
        let deadline = Instant::now() + RECV_TIMEOUT;
        while Instant::now() < deadline {
            let Ok(generation) = self.ready.recv_timeout(Duration::from_millis(100)) else {
                continue;
            };
            let Some(data) = self.player.frame_rendering_data() else {
                continue;
            };
            self.player.finished_displaying_frame(generation);
            return Some((generation, data.width, data.height));
        }
        None
    }

    /// Waits for a `changed_frame_position` event matching `current`.
    fn wait_position(&self, current: i64) -> bool {
        let deadline = Instant::now() + RECV_TIMEOUT;
        while Instant::now() < deadline {
            match self.events.recv_timeout(Duration::from_millis(100)) {
                Ok(Event::Position { current: c }) if c == current => return true,
                Ok(_) => continue,
                Err(_) => continue,
            }
        }
        false
    }

    fn drain_events(&self) -> Vec<Event> {
        let mut out = Vec::new();
        while let Ok(ev) = self.events.try_recv() {
            out.push(ev);
        }
        out
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[test]
fn frames_flow_through_the_pipeline_in_order() {
    let mut h = harness(MockSpec {
        frames: 5,
        step: 20,
        ..MockSpec::default()
    });
    assert!(h.open());
    assert_eq!(h.drain_events().first(), Some(&Event::Loaded));

    h.player.play(false);
    let mut presented = 0;
    let mut last_position = -1;
    while presented < 5 {
        let Some((generation, width, height)) = h.ack_next() else {
            panic!("pipeline stalled after {presented} frames");
        };
        assert_eq!(generation, 0);
        assert_eq!((width, height), (64, 48));
        let position = h.player.position();
        assert!(position >= last_position, "position went backwards");
        last_position = position;
        presented += 1;
    }

    // Natural completion after the last acknowledgement.
    let deadline = std::time::Instant::now() + RECV_TIMEOUT;
    let mut finished = false;
    while std::time::Instant::now() < deadline && !finished {
        if let Ok(ev) = h.events.recv_timeout(Duration::from_millis(100)) {
            finished = ev == Event::Finished;
        }
    }
    assert!(finished, "playing_finished not observed at end of stream");

    h.player.close();
    assert!(!h.player.has_running_stages());
}

#[test]
fn open_fails_without_a_video_stream() {
    let mut h = harness(MockSpec {
        include_video: false,
        ..MockSpec::default()
    });
    assert!(!h.open());
    assert_eq!(h.player.state(), PlayerState::Closed);
    // No lifecycle callbacks fired: nothing was loaded, nothing to release.
    assert!(h.drain_events().is_empty());
    assert!(!h.player.has_running_stages());
}

#[test]
fn open_fails_for_a_missing_file() {
    let mut h = harness(MockSpec::default());
    assert!(!h.player.open_file("/nonexistent/missing.mp4"));
    assert_eq!(h.player.state(), PlayerState::Closed);
    assert!(h.drain_events().is_empty());
}

#[test]
fn seek_by_percent_lands_mid_file() {
    // A "10 second file": duration 10_000ms, packets every 20ms.
    let mut h = harness(MockSpec {
        frames: 500,
        step: 20,
        duration: TimeValue::Known(10_000),
        ..MockSpec::default()
    });
    assert!(h.open());
    h.player.play(false);

    // Let at least one frame through before seeking.
    assert!(h.ack_next().is_some());
    let generation_before = h.player.generation();

    assert!(h.player.seek_by_percent(0.5));
    assert!(
        h.wait_position(5_000),
        "no position update at the seek target"
    );
    assert!(h.player.generation() > generation_before);

    // Frames keep flowing from the new segment.
    let mut post_seek_position = 0;
    for _ in 0..3 {
        assert!(h.ack_next().is_some());
        post_seek_position = h.player.position();
    }
    assert!(post_seek_position >= 5_000);

    h.player.close();
}

#[test]
fn generation_strictly_increases_across_seeks() {
    let mut h = harness(MockSpec {
        frames: 500,
        step: 20,
        ..MockSpec::default()
    });
    assert!(h.open());
    h.player.play(false);
    assert!(h.ack_next().is_some());

    assert!(h.player.seek_duration(2_000));
    assert!(h.wait_position(2_000));
    let g1 = h.player.generation();

    assert!(h.player.seek_duration(6_000));
    assert!(h.wait_position(6_000));
    let g2 = h.player.generation();

    assert!(g1 >= 1);
    assert!(g2 > g1, "generation must strictly increase per seek");
    h.player.close();
}

#[test]
fn seeks_are_rejected_for_non_file_sources() {
    let mut h = harness(MockSpec::default());
    assert!(h.player.open_url("rtsp://example.com/live"));
    h.player.play(false);
    assert!(h.ack_next().is_some());

    assert!(!h.player.seek_duration(1_000));
    assert!(!h.player.seek_by_percent(0.5));
    // The pending-seek slot was never touched: no resync, same generation.
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(h.player.generation(), 0);

    h.player.close();
}

#[test]
fn start_paused_offers_first_frame_without_advancing() {
    let mut h = harness(MockSpec {
        frames: 50,
        step: 20,
        ..MockSpec::default()
    });
    assert!(h.open());
    h.player.play(true);
    assert!(h.player.is_paused());

    // The first frame is presented for preview even though we are paused.
    let generation = h.ready.recv_timeout(RECV_TIMEOUT).expect("preview frame");
    let first = h.player.frame_rendering_data().expect("offered frame");

    // Repeated pulls return the same frame; the clock does not advance.
    let position = h.player.position();
    std::thread::sleep(Duration::from_millis(120));
    let again = h.player.frame_rendering_data().expect("still offered");
    assert_eq!(first.width, again.width);
    assert_eq!(h.player.position(), position);
    // And no further frame was offered while paused.
    assert!(h.ready.try_recv().is_err());

    // Resume: acknowledge the preview frame, playback proceeds.
    h.player.resume();
    h.player.finished_displaying_frame(generation);
    assert!(
        h.ready.recv_timeout(RECV_TIMEOUT).is_ok(),
        "no frame after resume"
    );

    h.player.close();
}

#[test]
fn seek_while_paused_presents_the_target_frame() {
    let mut h = harness(MockSpec {
        frames: 500,
        step: 20,
        ..MockSpec::default()
    });
    assert!(h.open());
    h.player.play(true);

    // Acknowledge the paused preview frame.
    let generation = h.ready.recv_timeout(RECV_TIMEOUT).expect("preview frame");
    h.player.finished_displaying_frame(generation);

    // Seek while paused: the frame at the target is offered immediately,
    // without waiting for resume.
    assert!(h.player.seek_duration(4_000));
    assert!(h.wait_position(4_000));
    let generation = h.ready.recv_timeout(RECV_TIMEOUT).expect("seeked frame");
    assert!(h.player.frame_rendering_data().is_some());
    assert!(h.player.is_paused());
    assert!(h.player.position() >= 4_000);
    h.player.finished_displaying_frame(generation);

    h.player.close();
}

#[test]
fn stale_generation_ack_is_a_noop() {
    let mut h = harness(MockSpec {
        frames: 50,
        step: 20,
        ..MockSpec::default()
    });
    assert!(h.open());
    h.player.play(true);

    let generation = h.ready.recv_timeout(RECV_TIMEOUT).expect("preview frame");
    assert!(h.player.frame_rendering_data().is_some());

    // Wrong generation: the offered frame must stay offered.
    h.player.finished_displaying_frame(generation + 17);
    std::thread::sleep(Duration::from_millis(50));
    assert!(h.player.frame_rendering_data().is_some());

    // Correct generation pops it; paused, so nothing else is offered.
    h.player.finished_displaying_frame(generation);
    std::thread::sleep(Duration::from_millis(50));
    assert!(h.player.frame_rendering_data().is_none());

    h.player.close();
}

#[test]
fn loop_enabled_restarts_instead_of_finishing() {
    let mut h = harness(MockSpec {
        frames: 3,
        step: 10,
        duration: TimeValue::Known(30),
        ..MockSpec::default()
    });
    h.player.set_loop_enabled(true);
    assert!(h.open());
    h.player.play(false);

    // Keep acknowledging; the loop restart bumps the generation.
    let deadline = std::time::Instant::now() + RECV_TIMEOUT;
    let mut looped = false;
    while std::time::Instant::now() < deadline && !looped {
        if let Ok(generation) = h.ready.recv_timeout(Duration::from_millis(200)) {
            h.player.finished_displaying_frame(generation);
        }
        looped = h.player.generation() >= 1;
    }
    assert!(looped, "loop restart never happened");

    // End-of-stream with looping must not report completion.
    assert!(!h.drain_events().contains(&Event::Finished));

    h.player.close();
}

#[test]
fn close_joins_stages_and_notifies_in_order() {
    let mut h = harness(MockSpec {
        frames: 50,
        step: 20,
        ..MockSpec::default()
    });
    assert!(h.open());
    h.player.play(false);
    assert!(h.ack_next().is_some());
    assert!(h.player.has_running_stages());

    h.player.close();
    assert!(!h.player.has_running_stages());
    assert_eq!(h.player.state(), PlayerState::Closed);

    let events = h.drain_events();
    let released = events.iter().position(|e| *e == Event::Released);
    let closed = events.iter().position(|e| *e == Event::Closed);
    let finished = events.iter().rposition(|e| *e == Event::Finished);
    assert!(released.is_some(), "file_released not emitted");
    assert!(closed.is_some(), "decoder_closed not emitted");
    assert!(finished.is_some(), "playing_finished not emitted");
    assert!(released < closed && closed < finished);

    // The facade can open again after a full close.
    assert!(h.open());
    h.player.play(false);
    assert!(h.ack_next().is_some());
    h.player.close();
}

#[test]
fn close_is_safe_mid_seek() {
    let mut h = harness(MockSpec {
        frames: 500,
        step: 20,
        ..MockSpec::default()
    });
    assert!(h.open());
    h.player.play(false);
    assert!(h.ack_next().is_some());

    assert!(h.player.seek_duration(8_000));
    h.player.close();
    assert!(!h.player.has_running_stages());
}

#[test]
fn hardware_surfaces_are_normalized_before_presentation() {
    let mut h = harness(MockSpec {
        frames: 5,
        step: 20,
        hardware: true,
        ..MockSpec::default()
    });
    assert!(h.open());
    h.player.play(true);

    let _generation = h.ready.recv_timeout(RECV_TIMEOUT).expect("frame");
    let data = h.player.frame_rendering_data().expect("offered frame");
    // The hardware surface was downloaded into the configured output format.
    assert_eq!(data.pixels.format, PixelFormat::Yuv420p);
    assert_eq!((data.aspect_num, data.aspect_den), (1, 1));

    h.player.close();
}

#[test]
fn video_reset_resynchronizes_at_current_position() {
    let mut h = harness(MockSpec {
        frames: 500,
        step: 20,
        ..MockSpec::default()
    });
    assert!(h.open());
    h.player.play(false);
    assert!(h.ack_next().is_some());

    let generation_before = h.player.generation();
    h.player.video_reset();

    let deadline = std::time::Instant::now() + RECV_TIMEOUT;
    while std::time::Instant::now() < deadline {
        if h.player.generation() > generation_before {
            break;
        }
        if let Ok(generation) = h.ready.recv_timeout(Duration::from_millis(50)) {
            h.player.finished_displaying_frame(generation);
        }
    }
    assert!(h.player.generation() > generation_before);

    // Frames keep flowing after the reset.
    assert!(h.ack_next().is_some());
    h.player.close();
}
