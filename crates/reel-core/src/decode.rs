//! Decode stage.
//!
//! Pops packets, feeds the codec, drains produced frames, and normalizes
//! them into CPU pixel buffers for the frame queue. The codec is owned by
//! this thread; resyncs are observed through the generation tag carried by
//! every packet, so the flush happens here before any post-seek packet is
//! submitted.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::codec::{FrameSurface, RawFrame, VideoDecoder};
use crate::session::{PacketItem, Session};
use crate::video::{DecodedFrame, PixelFormat, Rational};

pub(crate) struct DecodeStage {
    session: Arc<Session>,
    decoder: Box<dyn VideoDecoder>,
    output_format: PixelFormat,
}

impl DecodeStage {
    pub fn new(
        session: Arc<Session>,
        decoder: Box<dyn VideoDecoder>,
        output_format: PixelFormat,
    ) -> Self {
        Self {
            session,
            decoder,
            output_format,
        }
    }

    pub fn run(mut self) {
        tracing::debug!(backend = ?self.decoder.backend(), "decode stage started");
        let mut last_generation = self.session.generation();

        loop {
            if self.session.is_interrupted() {
                break;
            }
            let Some(item) = self.session.packets.wait_pop() else {
                continue;
            };
            match item {
                PacketItem::Packet { packet, generation } => {
                    if generation != last_generation {
                        // A resync completed since the last packet: drop the
                        // codec's buffered state before feeding the new
                        // segment.
                        self.decoder.flush();
                        last_generation = generation;
                    }
                    if generation != self.session.generation() {
                        // Stale packet demuxed before an even newer resync.
                        continue;
                    }
                    if let Err(err) = self.decoder.send_packet(&packet) {
                        tracing::warn!(pts = packet.pts, "packet rejected, skipping: {err}");
                        continue;
                    }
                    self.drain_frames(generation);
                }
                PacketItem::EndOfStream { generation } => {
                    if generation != self.session.generation() {
                        continue;
                    }
                    if let Err(err) = self.decoder.send_eof() {
                        tracing::debug!("send_eof: {err}");
                    }
                    self.drain_frames(generation);
                    self.session.eof.store(true, Ordering::Release);
                    self.session.wake_display();
                    tracing::debug!("codec drained at end of stream");
                }
            }
        }
        tracing::debug!("decode stage stopped");
    }

    /// Drains every frame the codec currently has and queues the live ones.
    fn drain_frames(&mut self, generation: u64) {
        loop {
            match self.decoder.receive_frame() {
                Ok(Some(raw)) => {
                    if generation != self.session.generation() {
                        // Produced by a context that predates a completed
                        // resync; keep draining but queue nothing.
                        continue;
                    }
                    let Some(frame) = self.normalize(raw, generation) else {
                        continue;
                    };
                    if !self.session.frames.push(frame) {
                        // Shutdown or resync while blocked on queue space.
                        return;
                    }
                }
                Ok(None) => return,
                Err(err) => {
                    tracing::warn!("decode error, skipping: {err}");
                    return;
                }
            }
        }
    }

    /// Normalizes decoder output to a CPU frame. Hardware surfaces are
    /// downloaded here, before the provider can recycle the buffer.
    fn normalize(&self, raw: RawFrame, generation: u64) -> Option<DecodedFrame> {
        let pixels = match raw.surface {
            FrameSurface::Software(buffer) => buffer,
            FrameSurface::Hardware(surface) => match surface.download(self.output_format) {
                Ok(buffer) => buffer,
                Err(err) => {
                    tracing::warn!("hardware surface download failed, dropping frame: {err}");
                    return None;
                }
            },
        };
        Some(DecodedFrame {
            pts: raw.pts,
            pixels: Arc::new(pixels),
            aspect: raw.aspect.unwrap_or(Rational::ONE),
            generation,
        })
    }
}
