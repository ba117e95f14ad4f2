//! Demux/parse stage.
//!
//! Runs on its own thread once playback starts: reads packets from the
//! container, forwards video packets to the packet queue, and owns the
//! flush-and-resync protocol for seek/reset requests. The stage moves
//! through `Idle -> Probing -> StreamsDiscovered` inside the facade's open
//! call (stream selection and timeline computation below), then `Running`
//! with `SeekRequested`/`ResetRequested` excursions here, and `Stopped`
//! when interrupted.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::container::{ContainerReader, StreamInfo, StreamKind};
use crate::player::PlayerListener;
use crate::session::{PacketItem, Session, Timeline};
use crate::video::{Rational, TimeValue};

/// How long the stage parks between control checks after end-of-stream.
const EOF_PARK: Duration = Duration::from_millis(50);

/// Selects the video stream by scanning indices in reverse, overwriting on
/// every match, so the lowest-index video stream wins deterministically.
pub(crate) fn select_video_stream(streams: &[StreamInfo]) -> Option<usize> {
    let mut selected = None;
    for stream in streams.iter().rev() {
        if stream.kind == StreamKind::Video {
            selected = Some(stream.index);
        }
    }
    selected
}

fn container_us_to_pts(us: i64, time_base: Rational) -> Option<i64> {
    if time_base.num <= 0 || time_base.den <= 0 {
        return None;
    }
    // us / (num/den) / 1e6: microseconds rescaled into time-base ticks.
    Some(((us as f64 / time_base.as_f64()) / 1_000_000.0) as i64)
}

/// Computes the session timeline, preferring the stream's own start/duration
/// over the container's microsecond-level values.
pub(crate) fn compute_timeline(stream: &StreamInfo, reader: &dyn ContainerReader) -> Timeline {
    let time_base = stream.time_base;

    let start = match stream.start_time {
        TimeValue::Known(v) if v > 0 => TimeValue::Known(v),
        _ => match reader.container_start_us() {
            TimeValue::Known(us) => container_us_to_pts(us, time_base)
                .map(TimeValue::Known)
                .unwrap_or(TimeValue::Unknown),
            TimeValue::Unknown => TimeValue::Unknown,
        },
    };

    let duration = match stream.duration {
        TimeValue::Known(v) if v > 0 => TimeValue::Known(v),
        _ => match reader.container_duration_us() {
            TimeValue::Known(us) => container_us_to_pts(us, time_base)
                .map(TimeValue::Known)
                .unwrap_or(TimeValue::Unknown),
            TimeValue::Unknown => TimeValue::Unknown,
        },
    };

    Timeline {
        time_base,
        start,
        duration,
    }
}

pub(crate) struct DemuxStage {
    session: Arc<Session>,
    reader: Box<dyn ContainerReader>,
    video_stream: usize,
    listener: Option<Arc<dyn PlayerListener>>,
}

impl DemuxStage {
    pub fn new(
        session: Arc<Session>,
        reader: Box<dyn ContainerReader>,
        video_stream: usize,
        listener: Option<Arc<dyn PlayerListener>>,
    ) -> Self {
        Self {
            session,
            reader,
            video_stream,
            listener,
        }
    }

    pub fn run(mut self) {
        tracing::debug!(stream = self.video_stream, "demux stage started");
        loop {
            if self.session.is_interrupted() {
                break;
            }
            if self.handle_pending_signals() {
                continue;
            }
            match self.reader.read_packet() {
                Ok(Some(packet)) => {
                    if packet.stream_index != self.video_stream {
                        continue;
                    }
                    let generation = self.session.generation();
                    if !self
                        .session
                        .packets
                        .push(PacketItem::Packet { packet, generation })
                    {
                        // Woken without queueing: shutdown or a pending
                        // signal; the loop top sorts out which.
                        continue;
                    }
                }
                Ok(None) => self.on_end_of_stream(),
                Err(err) => {
                    tracing::warn!("read error, treating as end of stream: {err}");
                    self.on_end_of_stream();
                }
            }
        }
        tracing::debug!("demux stage stopped");
    }

    /// Consumes pending seek/reset requests. Returns true when a resync ran.
    fn handle_pending_signals(&mut self) -> bool {
        let mut handled = false;
        if let Some(target) = self.session.pending_seek.take() {
            self.flush_and_resync(target);
            handled = true;
        }
        if let Some(target) = self.session.pending_reset.take() {
            self.flush_and_resync(target);
            handled = true;
        }
        handled
    }

    /// The seek/reset protocol: discard buffered packets, reposition the
    /// container at the nearest keyframe at-or-before `target`, bump the
    /// generation (the decode stage flushes its codec when it sees the new
    /// tag), and resume reading.
    fn flush_and_resync(&mut self, target: i64) {
        self.session.packets.clear();
        if let Err(err) = self.reader.seek(self.video_stream, target) {
            tracing::warn!(seek_target = target, "container seek failed: {err}");
        }
        let generation = self.session.bump_generation();
        self.session.eof.store(false, Ordering::Release);
        self.session.current_pts.store(target, Ordering::Release);
        self.session.clock.lock().rearm();
        self.session.resetting.store(false, Ordering::Release);
        self.session.wake_display();
        self.notify_position(target);
        tracing::debug!(seek_target = target, generation, "resync complete");
    }

    fn notify_position(&self, current: i64) {
        if let Some(listener) = &self.listener {
            let timeline = *self.session.timeline.lock();
            listener.changed_frame_position(timeline.start.or_zero(), current, timeline.end());
        }
    }

    /// End-of-stream: with looping enabled restart from the session start,
    /// otherwise queue the sentinel and park until a seek/reset/close.
    fn on_end_of_stream(&mut self) {
        if self.session.loop_enabled.load(Ordering::Acquire) {
            let start = self.session.timeline.lock().start.or_zero();
            tracing::debug!("end of stream with looping enabled, restarting");
            self.session.resetting.store(true, Ordering::Release);
            self.flush_and_resync(start);
            return;
        }

        let generation = self.session.generation();
        let _ = self
            .session
            .packets
            .push(PacketItem::EndOfStream { generation });
        tracing::debug!("end of stream, sentinel queued");

        loop {
            if self.session.is_interrupted() {
                return;
            }
            if self.session.pending_seek.is_pending() || self.session.pending_reset.is_pending() {
                // Back to the main loop, which runs the resync.
                return;
            }
            self.session.wait_control(EOF_PARK);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{DecoderConfig, VideoDecoder};
    use crate::container::Packet;
    use crate::video::MediaError;

    fn stream(index: usize, kind: StreamKind) -> StreamInfo {
        StreamInfo {
            index,
            kind,
            time_base: Rational::new(1, 1000),
            start_time: TimeValue::Unknown,
            duration: TimeValue::Unknown,
            width: 320,
            height: 240,
            pixel_aspect: None,
            codec_name: "test".into(),
        }
    }

    struct FixedReader {
        streams: Vec<StreamInfo>,
        start_us: TimeValue,
        duration_us: TimeValue,
    }

    impl ContainerReader for FixedReader {
        fn streams(&self) -> &[StreamInfo] {
            &self.streams
        }

        fn container_start_us(&self) -> TimeValue {
            self.start_us
        }

        fn container_duration_us(&self) -> TimeValue {
            self.duration_us
        }

        fn open_video_decoder(
            &mut self,
            _stream_index: usize,
            _config: &DecoderConfig,
        ) -> Result<Box<dyn VideoDecoder>, MediaError> {
            Err(MediaError::CodecInit("not used".into()))
        }

        fn read_packet(&mut self) -> Result<Option<Packet>, MediaError> {
            Ok(None)
        }

        fn seek(&mut self, _stream_index: usize, _pts: i64) -> Result<(), MediaError> {
            Ok(())
        }
    }

    #[test]
    fn test_stream_selection_prefers_lowest_video_index() {
        let streams = vec![
            stream(0, StreamKind::Audio),
            stream(1, StreamKind::Video),
            stream(2, StreamKind::Video),
        ];
        assert_eq!(select_video_stream(&streams), Some(1));
    }

    #[test]
    fn test_stream_selection_none_without_video() {
        let streams = vec![stream(0, StreamKind::Audio), stream(1, StreamKind::Other)];
        assert_eq!(select_video_stream(&streams), None);
    }

    #[test]
    fn test_timeline_prefers_stream_values() {
        let mut s = stream(0, StreamKind::Video);
        s.start_time = TimeValue::Known(500);
        s.duration = TimeValue::Known(9_000);
        let reader = FixedReader {
            streams: vec![],
            start_us: TimeValue::Known(0),
            duration_us: TimeValue::Known(1),
        };
        let timeline = compute_timeline(&s, &reader);
        assert_eq!(timeline.start, TimeValue::Known(500));
        assert_eq!(timeline.duration, TimeValue::Known(9_000));
    }

    #[test]
    fn test_timeline_falls_back_to_container_microseconds() {
        // time_base 1/1000: one tick per millisecond, so 2s = 2000 ticks.
        let s = stream(0, StreamKind::Video);
        let reader = FixedReader {
            streams: vec![],
            start_us: TimeValue::Unknown,
            duration_us: TimeValue::Known(2_000_000),
        };
        let timeline = compute_timeline(&s, &reader);
        assert_eq!(timeline.start, TimeValue::Unknown);
        assert_eq!(timeline.duration, TimeValue::Known(2_000));
    }

    #[test]
    fn test_timeline_unknown_when_nothing_reported() {
        let s = stream(0, StreamKind::Video);
        let reader = FixedReader {
            streams: vec![],
            start_us: TimeValue::Unknown,
            duration_us: TimeValue::Unknown,
        };
        let timeline = compute_timeline(&s, &reader);
        assert!(!timeline.start.is_known());
        assert!(!timeline.duration.is_known());
        assert_eq!(timeline.end(), 0);
    }
}
