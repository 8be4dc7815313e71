//! Realtime render path
//!
//! The device invokes [`Renderer::render`] from its realtime context. The
//! pass must not allocate, block, or wait on a lock: every early exit
//! leaves the output buffer silent, the converter link is taken with
//! `try_lock`, and all bookkeeping is atomic.

use crate::audio::buffer::PcmChunk;
use crate::audio::converter::PcmConverter;
use crate::audio::device::{RenderOutcome, RenderSink};
use crate::playback::ring_buffer::PcmRingBuffer;
use crate::playback::shared::{EngineShared, FLAG_IS_SEEKING, FLAG_VIRTUAL_FORMAT_CHANGED};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::debug;

/// Render-side view of the pipeline: the ring being drained and the
/// converter draining it
///
/// Rebuilt whenever a format is adopted or the stream's virtual format
/// changes; both happen while rendering is already forced to silence.
pub struct RenderLink {
    pub ring: Arc<PcmRingBuffer>,
    pub converter: PcmConverter,
}

/// The engine's render sink
pub struct Renderer {
    shared: Arc<EngineShared>,
}

impl Renderer {
    pub fn new(shared: Arc<EngineShared>) -> Self {
        Self { shared }
    }

    /// Ring empty and nothing active: stop playback from the render path
    ///
    /// Only flag stores, counter stores, and semaphore signals; the device
    /// side of the stop is carried by the returned outcome.
    fn stop_from_render(&self) {
        debug!("Ring buffer empty with no active decoder; requesting stop");
        let shared = &self.shared;
        shared.stop_all_decoders();
        shared.reset_output();
        shared.counters.reset();
        shared.is_playing.store(false, Ordering::SeqCst);
    }

    /// Split the frames consumed this pass across active decoders in
    /// timestamp order, firing lifecycle callbacks as attribution crosses
    /// each decoder's start and end
    fn distribute(&self, rendered_this_pass: usize) {
        let shared = &self.shared;
        let mut remaining = rendered_this_pass as i64;
        let mut cursor = shared.active.current();

        while let Some(state) = cursor {
            let timestamp = state.timestamp;

            // Every decoder the scan visits gets its start event, including
            // one whose stream ended before contributing a single frame;
            // its finish event below must never fire without this one.
            if state.mark_rendering_started() {
                state.events.rendering_started();
            }

            let total = state.total_frames.load(Ordering::SeqCst);
            let already = state.frames_rendered.load(Ordering::SeqCst);
            let from_this = (total - already).max(0).min(remaining);

            state.frames_rendered.fetch_add(from_this, Ordering::SeqCst);

            if state.is_fully_rendered() && state.mark_ready_for_collection() {
                state.events.rendering_finished();
                shared.collector_sem.signal();
            }

            remaining -= from_this;
            if remaining <= 0 {
                break;
            }
            cursor = shared.active.next_after(timestamp);
        }
    }
}

impl RenderSink for Renderer {
    fn render(&self, output: &mut [f32], frames: usize) -> RenderOutcome {
        let shared = &self.shared;

        // Every exit path below leaves silence in place.
        output.fill(0.0);

        // A partially-rebuilt converter must never be observed; stop IO
        // until the format change completes.
        if shared.flag_set(FLAG_VIRTUAL_FORMAT_CHANGED) {
            return RenderOutcome::StopOutput;
        }

        // Counters shift during seeks.
        if shared.flag_set(FLAG_IS_SEEKING) {
            return RenderOutcome::Silence;
        }

        if shared.counters.available() == 0 {
            if shared.active.current().is_none() {
                self.stop_from_render();
                return RenderOutcome::StopOutput;
            }
            return RenderOutcome::Silence;
        }

        let Ok(mut guard) = shared.render_link.try_lock() else {
            return RenderOutcome::Silence;
        };
        let Some(link) = guard.as_mut() else {
            return RenderOutcome::Silence;
        };

        let mut rendered_this_pass = 0usize;
        {
            let RenderLink { ring, converter } = link;
            let counters = &shared.counters;
            let mut pull = |chunk: &mut PcmChunk, want: usize| {
                let avail = counters.available().max(0) as usize;
                let n = want.min(avail);
                if n == 0 {
                    return 0;
                }
                let position = counters.rendered.load(Ordering::SeqCst);
                ring.fetch(chunk, n, position);
                counters.rendered.fetch_add(n as i64, Ordering::SeqCst);
                rendered_this_pass += n;
                n
            };
            converter.fill(frames, output, &mut pull);
        }

        // Wake the worker once a whole chunk of free space exists.
        let free = link.ring.free_frames();
        drop(guard);
        if free >= shared.config.write_chunk_frames {
            shared.decoder_sem.signal();
        }

        if rendered_this_pass == 0 {
            return RenderOutcome::Silence;
        }

        self.distribute(rendered_this_pass);
        RenderOutcome::Rendered(frames)
    }
}
