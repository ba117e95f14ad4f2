//! Display/present stage.
//!
//! Paces frames against a pause-aware wall clock, offers each to the
//! presentation sink, and holds until the sink acknowledges with
//! `finished_displaying_frame`. The offered frame stays at the queue front
//! until the acknowledgement pops it, so at most one frame awaits an ack.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::player::{PlayerListener, PresentationSink};
use crate::session::Session;
use crate::video::DecodedFrame;

pub(crate) struct DisplayStage {
    session: Arc<Session>,
    sink: Option<Arc<dyn PresentationSink>>,
    listener: Option<Arc<dyn PlayerListener>>,
}

impl DisplayStage {
    pub fn new(
        session: Arc<Session>,
        sink: Option<Arc<dyn PresentationSink>>,
        listener: Option<Arc<dyn PlayerListener>>,
    ) -> Self {
        Self {
            session,
            sink,
            listener,
        }
    }

    pub fn run(self) {
        tracing::debug!("display stage started");
        // The first frame after play or after a resync is presented without
        // waiting for its deadline: this gives the paused preview and the
        // immediate frame after a seek-while-paused.
        let mut primed = false;
        let mut last_generation = self.session.generation();
        let mut finished_notified = false;

        loop {
            if self.session.is_interrupted() {
                break;
            }

            let generation = self.session.generation();
            if generation != last_generation {
                last_generation = generation;
                primed = false;
                finished_notified = false;
            }

            if self.session.is_resetting() {
                // Mid-reset there is no frame, whatever the queue holds.
                self.session.block_while_resetting(generation);
                continue;
            }

            // Natural completion: sentinel processed and nothing left to show.
            if self.session.eof.load(Ordering::Acquire) && self.session.frames.is_empty() {
                if !finished_notified {
                    finished_notified = true;
                    tracing::debug!("playback finished");
                    if let Some(listener) = &self.listener {
                        listener.playing_finished();
                    }
                }
                // Park until a seek/reset/close wakes the queue.
                let _ = self.session.frames.wait_front();
                continue;
            }

            let Some(frame) = self.session.frames.wait_front() else {
                continue;
            };

            if frame.generation != generation {
                // Stale frame from before a resync: discard unpresented.
                self.session.frames.pop_front();
                self.session.cancel_display();
                continue;
            }

            if primed && !self.pace(&frame, generation) {
                continue;
            }

            if self.session.is_interrupted()
                || self.session.generation() != generation
                || self.session.is_resetting()
            {
                continue;
            }

            primed = true;
            self.present(&frame, generation);
        }
        tracing::debug!("display stage stopped");
    }

    /// Waits out the frame's deadline. Returns false when the wait was cut
    /// short and the outer loop must re-evaluate the world.
    fn pace(&self, frame: &DecodedFrame, generation: u64) -> bool {
        let pts_secs = frame.pts as f64 * self.session.timeline.lock().time_base.as_f64();
        loop {
            if self.session.is_interrupted()
                || self.session.generation() != generation
                || self.session.is_resetting()
            {
                return false;
            }
            if self.session.is_paused() {
                self.session.block_while_paused(generation);
                continue;
            }
            let deadline = {
                let mut clock = self.session.clock.lock();
                clock.anchor_if_needed(pts_secs);
                clock.deadline(pts_secs)
            };
            let Some(deadline) = deadline else {
                return true;
            };
            if self.session.wait_deadline(deadline, generation) {
                return true;
            }
            // Woken early: loop and re-check pause/seek/shutdown.
        }
    }

    /// Offers the queue-front frame to the sink and holds for the ack.
    fn present(&self, frame: &DecodedFrame, generation: u64) {
        if !self.session.is_paused() {
            let pts_secs = frame.pts as f64 * self.session.timeline.lock().time_base.as_f64();
            self.session.clock.lock().anchor_if_needed(pts_secs);
        }

        self.session.current_pts.store(frame.pts, Ordering::Release);
        self.session.begin_display();
        tracing::trace!(pts = frame.pts, generation, "frame offered");

        if let Some(listener) = &self.listener {
            let timeline = *self.session.timeline.lock();
            listener.changed_frame_position(timeline.start.or_zero(), frame.pts, timeline.end());
        }
        if let Some(sink) = &self.sink {
            sink.frame_ready(generation);
        }

        self.session.wait_ack(generation);
    }
}
