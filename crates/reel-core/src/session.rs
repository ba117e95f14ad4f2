//! Shared state of one open media session.
//!
//! The [`Session`] is the only data shared between the three stage threads
//! and the control thread. Queues are internally synchronized; everything
//! else is either an atomic or sits behind a short-lived parking_lot lock.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::container::Packet;
use crate::queue::BoundedQueue;
use crate::video::{DecodedFrame, FrameRenderingData, Rational, TimeValue};

/// Compressed packets buffered between demux and decode.
const PACKET_QUEUE_CAPACITY: usize = 64;

/// Decoded frames buffered ahead of presentation.
const FRAME_QUEUE_CAPACITY: usize = 5;

/// Sentinel marking an empty signal slot. Matches the provider convention
/// of `i64::MIN` for "no timestamp"; seek targets are clamped non-negative
/// before they reach a slot.
const SLOT_EMPTY: i64 = i64::MIN;

/// Single-slot exchange mailbox for seek/reset requests.
///
/// A new request overwrites an unacknowledged one. [`SignalSlot::request`]
/// reports whether the slot transitioned from empty so the caller wakes the
/// consumer exactly once per burst instead of on every overwrite.
pub(crate) struct SignalSlot {
    value: AtomicI64,
}

impl SignalSlot {
    pub fn new() -> Self {
        Self {
            value: AtomicI64::new(SLOT_EMPTY),
        }
    }

    /// Stores `target`, returning true when the slot was empty.
    pub fn request(&self, target: i64) -> bool {
        self.value.swap(target, Ordering::AcqRel) == SLOT_EMPTY
    }

    /// Consumes the pending value, if any.
    pub fn take(&self) -> Option<i64> {
        let value = self.value.swap(SLOT_EMPTY, Ordering::AcqRel);
        (value != SLOT_EMPTY).then_some(value)
    }

    pub fn is_pending(&self) -> bool {
        self.value.load(Ordering::Acquire) != SLOT_EMPTY
    }
}

/// An item on the packet queue.
pub(crate) enum PacketItem {
    /// A compressed video packet tagged with the generation it was demuxed
    /// under.
    Packet { packet: Packet, generation: u64 },
    /// End-of-stream sentinel; the decode stage drains delayed frames.
    EndOfStream { generation: u64 },
}

/// Start/duration of the open stream, in its time-base units.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Timeline {
    pub time_base: Rational,
    pub start: TimeValue,
    pub duration: TimeValue,
}

impl Timeline {
    /// End position reported to listeners (zero stands in for unknown).
    pub fn end(&self) -> i64 {
        self.start.or_zero() + self.duration.or_zero()
    }
}

/// Wall-clock pacing for presentation deadlines.
///
/// The clock anchors at the first frame presented while playing; a frame's
/// deadline is the anchor plus its PTS distance from the anchor frame.
/// Pausing records an instant, and resuming shifts the anchor forward by the
/// pause duration so deadlines freeze while paused.
pub(crate) struct PlaybackClock {
    anchor: Option<Instant>,
    anchor_pts_secs: f64,
    pause_started: Option<Instant>,
}

impl PlaybackClock {
    pub fn new() -> Self {
        Self {
            anchor: None,
            anchor_pts_secs: 0.0,
            pause_started: None,
        }
    }

    /// Forgets the anchor; the next presented frame re-anchors (play/seek).
    pub fn rearm(&mut self) {
        self.anchor = None;
    }

    /// Anchors the clock at `pts_secs` if it is not anchored yet.
    pub fn anchor_if_needed(&mut self, pts_secs: f64) {
        if self.anchor.is_none() {
            self.anchor = Some(Instant::now());
            self.anchor_pts_secs = pts_secs;
        }
    }

    pub fn pause(&mut self) {
        if self.pause_started.is_none() {
            self.pause_started = Some(Instant::now());
        }
    }

    pub fn resume(&mut self) {
        if let Some(paused_at) = self.pause_started.take() {
            if let Some(anchor) = self.anchor.as_mut() {
                *anchor += paused_at.elapsed();
            }
        }
    }

    /// The wall-clock deadline for `pts_secs`, or `None` when the frame is
    /// due immediately (unanchored clock, non-monotonic PTS, or overflow).
    pub fn deadline(&self, pts_secs: f64) -> Option<Instant> {
        let anchor = self.anchor?;
        let delta = pts_secs - self.anchor_pts_secs;
        if !delta.is_finite() || delta <= 0.0 {
            return None;
        }
        anchor.checked_add(Duration::from_secs_f64(delta))
    }
}

struct PresentState {
    /// A frame is offered to the sink and awaits acknowledgement.
    displaying_requested: bool,
}

/// Aggregate state of one open media source.
pub(crate) struct Session {
    pub packets: BoundedQueue<PacketItem>,
    pub frames: BoundedQueue<DecodedFrame>,

    /// Bumped exactly once per completed seek/reset. Read with relaxed
    /// ordering by decode/display: only inequality is tested, under the
    /// documented assumption that a u64 bumped once per seek never wraps
    /// within a session lifetime.
    generation: AtomicU64,

    pub pending_seek: SignalSlot,
    pub pending_reset: SignalSlot,
    /// Set by a reset request, cleared when the resync completes; the
    /// display stage treats it as "no frame available".
    pub resetting: AtomicBool,
    pub paused: AtomicBool,
    pub loop_enabled: AtomicBool,
    interrupted: AtomicBool,
    /// The decode stage drained the codec after the EOF sentinel.
    pub eof: AtomicBool,
    /// Current presentation position in stream time-base units.
    pub current_pts: AtomicI64,

    pub timeline: Mutex<Timeline>,
    pub clock: Mutex<PlaybackClock>,

    present: Mutex<PresentState>,
    present_cv: Condvar,

    /// Parking spot for the demux stage after end-of-stream.
    control: Mutex<()>,
    control_cv: Condvar,
}

impl Session {
    pub fn new(timeline: Timeline) -> Self {
        Self {
            packets: BoundedQueue::new(PACKET_QUEUE_CAPACITY),
            frames: BoundedQueue::new(FRAME_QUEUE_CAPACITY),
            generation: AtomicU64::new(0),
            pending_seek: SignalSlot::new(),
            pending_reset: SignalSlot::new(),
            resetting: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            loop_enabled: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            eof: AtomicBool::new(false),
            current_pts: AtomicI64::new(timeline.start.or_zero()),
            timeline: Mutex::new(timeline),
            clock: Mutex::new(PlaybackClock::new()),
            present: Mutex::new(PresentState {
                displaying_requested: false,
            }),
            present_cv: Condvar::new(),
            control: Mutex::new(()),
            control_cv: Condvar::new(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    /// Increments the generation; called only by the demux stage as part of
    /// the flush-and-resync protocol.
    pub fn bump_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Cooperative shutdown: unblocks every stage wait.
    ///
    /// Condvar notifications happen with the guarding mutex held so a waiter
    /// between its condition check and the wait cannot miss the wakeup.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        self.packets.interrupt();
        self.frames.interrupt();
        {
            let _guard = self.present.lock();
            self.present_cv.notify_all();
        }
        {
            let _guard = self.control.lock();
            self.control_cv.notify_all();
        }
    }

    pub fn is_resetting(&self) -> bool {
        self.resetting.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Flips the pause flag and maintains the pause-aware clock.
    pub fn set_paused(&self, paused: bool) {
        let was = self.paused.swap(paused, Ordering::AcqRel);
        if was == paused {
            return;
        }
        {
            let mut clock = self.clock.lock();
            if paused {
                clock.pause();
            } else {
                clock.resume();
            }
        }
        let _guard = self.present.lock();
        self.present_cv.notify_all();
    }

    /// Wakes the display stage so it re-evaluates generation/reset/pause.
    pub fn wake_display(&self) {
        self.frames.notify();
        let _guard = self.present.lock();
        self.present_cv.notify_all();
    }

    /// Wakes the demux stage out of its post-EOF parking.
    pub fn notify_control(&self) {
        let _guard = self.control.lock();
        self.control_cv.notify_all();
    }

    /// Parks the demux stage for up to `timeout` (woken by control events).
    pub fn wait_control(&self, timeout: Duration) {
        let mut guard = self.control.lock();
        if self.is_interrupted() {
            return;
        }
        let _ = self.control_cv.wait_for(&mut guard, timeout);
    }

    /// Marks the queue-front frame as offered to the sink.
    pub fn begin_display(&self) {
        self.present.lock().displaying_requested = true;
    }

    /// Clears the offered flag (stale frame discarded mid-reset/seek).
    pub fn cancel_display(&self) {
        self.present.lock().displaying_requested = false;
    }

    pub fn is_displaying_requested(&self) -> bool {
        self.present.lock().displaying_requested
    }

    /// Acknowledgement from the sink. No-op unless `generation` matches the
    /// current session generation and a frame is actually queued; otherwise
    /// pops the displayed frame, clears the offered flag, and wakes both the
    /// display stage and any producer waiting on frame-queue space.
    pub fn finish_displaying(&self, generation: u64) -> bool {
        let mut present = self.present.lock();
        if generation != self.generation()
            || !present.displaying_requested
            || !self.frames.can_pop()
        {
            return false;
        }
        self.frames.pop_front();
        present.displaying_requested = false;
        drop(present);
        self.present_cv.notify_all();
        true
    }

    /// The currently offered frame, unless the session is mid-reset.
    pub fn frame_rendering_data(&self) -> Option<FrameRenderingData> {
        if self.is_resetting() {
            return None;
        }
        if !self.is_displaying_requested() {
            return None;
        }
        let frame = self.frames.front()?;
        if frame.generation != self.generation() {
            return None;
        }
        if frame.width() == 0 || frame.height() == 0 {
            return None;
        }
        Some(FrameRenderingData {
            width: frame.width(),
            height: frame.height(),
            pixels: frame.pixels,
            aspect_num: frame.aspect.num,
            aspect_den: frame.aspect.den,
        })
    }

    /// Blocks until the offered frame is acknowledged, or until shutdown, a
    /// generation change, or a reset makes waiting pointless.
    pub fn wait_ack(&self, generation: u64) {
        let mut present = self.present.lock();
        while present.displaying_requested
            && !self.is_interrupted()
            && self.generation() == generation
            && !self.is_resetting()
        {
            self.present_cv.wait(&mut present);
        }
    }

    /// Blocks while the resetting flag is up; returns when the resync
    /// completes, or on shutdown or a generation change.
    pub fn block_while_resetting(&self, generation: u64) {
        let mut present = self.present.lock();
        while self.is_resetting() && !self.is_interrupted() && self.generation() == generation {
            self.present_cv.wait(&mut present);
        }
    }

    /// Blocks while paused; returns on resume, shutdown, generation change,
    /// or reset.
    pub fn block_while_paused(&self, generation: u64) {
        let mut present = self.present.lock();
        while self.is_paused()
            && !self.is_interrupted()
            && self.generation() == generation
            && !self.is_resetting()
        {
            self.present_cv.wait(&mut present);
        }
    }

    /// Waits until `deadline`. Returns true when the deadline elapsed, false
    /// when the wait was cut short (shutdown, seek, reset, pause) and the
    /// caller must re-evaluate.
    pub fn wait_deadline(&self, deadline: Instant, generation: u64) -> bool {
        let mut present = self.present.lock();
        loop {
            if self.is_interrupted()
                || self.generation() != generation
                || self.is_resetting()
                || self.is_paused()
            {
                return false;
            }
            if Instant::now() >= deadline {
                return true;
            }
            if self.present_cv.wait_until(&mut present, deadline).timed_out() {
                return true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_slot_exchange_semantics() {
        let slot = SignalSlot::new();
        assert!(!slot.is_pending());
        // First request transitions empty -> some.
        assert!(slot.request(100));
        // Overwrite of an unacknowledged request does not re-signal.
        assert!(!slot.request(200));
        assert_eq!(slot.take(), Some(200));
        assert_eq!(slot.take(), None);
        assert!(slot.request(300));
    }

    #[test]
    fn test_generation_strictly_increases() {
        let session = Session::new(Timeline {
            time_base: Rational::new(1, 1000),
            start: TimeValue::Known(0),
            duration: TimeValue::Known(10_000),
        });
        let g0 = session.generation();
        let g1 = session.bump_generation();
        let g2 = session.bump_generation();
        assert!(g0 < g1 && g1 < g2);
        assert_eq!(session.generation(), g2);
    }

    #[test]
    fn test_clock_pause_shifts_deadlines() {
        let mut clock = PlaybackClock::new();
        clock.anchor_if_needed(0.0);
        let before = clock.deadline(1.0).unwrap();

        clock.pause();
        std::thread::sleep(Duration::from_millis(30));
        clock.resume();

        let after = clock.deadline(1.0).unwrap();
        assert!(after >= before + Duration::from_millis(25));
    }

    #[test]
    fn test_clock_unanchored_is_due_immediately() {
        let clock = PlaybackClock::new();
        assert!(clock.deadline(5.0).is_none());
    }

    #[test]
    fn test_rearm_forgets_anchor() {
        let mut clock = PlaybackClock::new();
        clock.anchor_if_needed(0.0);
        assert!(clock.deadline(1.0).is_some());
        clock.rearm();
        assert!(clock.deadline(1.0).is_none());
    }

    #[test]
    fn test_timeline_end_with_unknowns() {
        let timeline = Timeline {
            time_base: Rational::new(1, 1000),
            start: TimeValue::Unknown,
            duration: TimeValue::Known(5_000),
        };
        assert_eq!(timeline.end(), 5_000);
    }
}
