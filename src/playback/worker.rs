//! Decoder worker thread
//!
//! Pulls queued decoders one at a time, creates their state, and refills the
//! ring buffer in fixed-size chunks until end of stream or cancellation.
//! Steady state is a bounded wait on the decoder semaphore; the render path
//! signals it whenever a chunk of free space opens up.

use crate::audio::decoder::Decoder;
use crate::error::{Error, Result};
use crate::events::EngineEvent;
use crate::playback::decoder_state::{DecoderState, NO_SEEK};
use crate::playback::ring_buffer::PcmRingBuffer;
use crate::playback::shared::{EngineShared, FLAG_IS_SEEKING};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Launch the worker on its own named thread
pub fn spawn(shared: Arc<EngineShared>) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("decoder".to_string())
        .spawn(move || run(shared))
        .map_err(|e| Error::ResourceAllocation(format!("decoder thread: {e}")))
}

fn run(shared: Arc<EngineShared>) {
    debug!("Decoder worker started");
    let timeout = shared.config.wake_timeout();

    while shared.keep_decoding.load(Ordering::SeqCst) {
        let next = {
            let mut queue = shared.queue.lock().unwrap();
            let decoder = queue.pop_front();
            if decoder.is_some() {
                // Raised under the queue mutex so the enqueue idle check
                // cannot observe "queue empty, nothing active" while this
                // decoder is between pop and activation.
                shared.activating.store(true, Ordering::SeqCst);
            }
            decoder
        };

        if let Some(decoder) = next {
            activate_and_decode(&shared, decoder);
        }

        shared.decoder_sem.wait_timeout(timeout);
    }

    debug!("Decoder worker exiting");
}

/// Result of one decode step
enum Step {
    /// Frames were stored into the ring
    Decoded(usize),
    /// The decoder returned no frames; `starting` is its final position
    EndOfStream(i64),
    /// Transient decode error; the chunk is skipped
    Skipped,
}

fn activate_and_decode(shared: &Arc<EngineShared>, decoder: Box<dyn Decoder>) {
    let url = decoder.url().to_string();
    let Some(ring) = shared.current_ring() else {
        error!("No ring buffer allocated; dropping decoder for {}", url);
        shared.activating.store(false, Ordering::SeqCst);
        return;
    };

    let timestamp = shared.counters.decoded.load(Ordering::SeqCst);
    let state = Arc::new(DecoderState::new(decoder, timestamp));

    let inserted = shared.active.try_insert(Arc::clone(&state));
    shared.activating.store(false, Ordering::SeqCst);
    if !inserted {
        error!("Could not activate decoder for {}; all slots occupied", url);
        return;
    }

    info!(
        "Activated decoder {} for {} at frame {}",
        state.id, state.url, timestamp
    );
    shared.events.emit(EngineEvent::DecoderActivated {
        id: state.id,
        url,
    });

    state.allocate_scratch(shared.config.write_chunk_frames);
    let timeout = shared.config.wake_timeout();
    let mut started = false;

    while state.keep_decoding() {
        // Seeks are honored on every wake, even when the ring is full:
        // with output paused nothing would otherwise free the space that
        // gates the fill loop.
        service_seek(shared, &state);
        if !state.keep_decoding() {
            break;
        }

        fill_ring(shared, &state, &ring, &mut started);
        if !state.keep_decoding() {
            break;
        }
        shared.decoder_sem.wait_timeout(timeout);
    }

    // Scratch is not needed once the decoder is done; the state itself
    // lives on until the collector reclaims it.
    state.allocate_scratch(0);
    debug!("Decoder {} finished decoding", state.id);
}

/// Fill the ring with whole chunks while space allows
fn fill_ring(
    shared: &Arc<EngineShared>,
    state: &Arc<DecoderState>,
    ring: &Arc<PcmRingBuffer>,
    started: &mut bool,
) {
    let chunk_frames = shared.config.write_chunk_frames;

    loop {
        if ring.free_frames() < chunk_frames {
            return;
        }

        service_seek(shared, state);
        if !state.keep_decoding() {
            return;
        }

        let step = state.with_decoder(|decoder, scratch| {
            let starting = decoder.current_frame();

            if starting == 0 && !*started {
                *started = true;
                state.events.decoding_started();
            }

            scratch.reset();
            match decoder.read(scratch, chunk_frames) {
                Ok(0) => Step::EndOfStream(starting),
                Ok(frames) => {
                    if let Err(e) = ring.store(scratch, frames, starting + state.timestamp) {
                        error!("Ring buffer store failed: {}", e);
                    }
                    Step::Decoded(frames)
                }
                Err(e) => {
                    warn!("Decode error for {}: {}; skipping chunk", state.url, e);
                    Step::Skipped
                }
            }
        });

        match step {
            Step::Decoded(frames) => {
                // A cancellation that raced the read must not advance the
                // counter: stop() may have zeroed it already, and the
                // stored audio will never be rendered.
                if !state.keep_decoding() {
                    return;
                }
                shared
                    .counters
                    .decoded
                    .fetch_add(frames as i64, Ordering::SeqCst);
            }
            Step::EndOfStream(starting) => {
                state.events.decoding_finished();
                state.keep_decoding.store(false, Ordering::SeqCst);

                // Formats without reliable frame counts only reveal their
                // length here; rewrite the total so the render side detects
                // completion at the final decoded position.
                state.total_frames.store(starting, Ordering::SeqCst);

                debug!(
                    "Decoder {} reached end of stream at frame {}",
                    state.id, starting
                );
                return;
            }
            Step::Skipped => {}
        }
    }
}

/// Service a pending seek request
///
/// The seeking flag is published before any counter moves so the render
/// path goes silent for the duration; the ring window is invalidated by
/// equalizing the global counters rather than clearing memory.
fn service_seek(shared: &Arc<EngineShared>, state: &Arc<DecoderState>) {
    let target = state.frame_to_seek.load(Ordering::SeqCst);
    if target == NO_SEEK {
        return;
    }

    shared.set_flag(FLAG_IS_SEEKING);

    let (before, landing) = state.with_decoder(|decoder, _| {
        let before = decoder.current_frame();
        (before, decoder.seek_to_frame(target))
    });

    if state
        .frame_to_seek
        .compare_exchange(target, NO_SEEK, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        debug!("Seek target changed while servicing; new request stays pending");
    }

    match landing {
        Ok(landed) => {
            info!(
                "Decoder {} seeked to {} (requested {}, was at {})",
                state.id, landed, target, before
            );

            state.frames_rendered.store(landed, Ordering::SeqCst);

            let skipped = landed - before;
            shared.counters.decoded.fetch_add(skipped, Ordering::SeqCst);
            let decoded = shared.counters.decoded.load(Ordering::SeqCst);
            shared.counters.rendered.store(decoded, Ordering::SeqCst);

            // The render thread is silenced by the seeking flag, so taking
            // the link here cannot stall a pass for long.
            if let Some(link) = shared.render_link.lock().unwrap().as_mut() {
                link.converter.reset();
            }
            shared.reset_output();
        }
        Err(e) => {
            warn!("Decoder {} seek to {} failed: {}", state.id, target, e);
        }
    }

    shared.clear_flag(FLAG_IS_SEEKING);
}
