//! Per-decoder bookkeeping
//!
//! A `DecoderState` exists from the moment the worker dequeues a decoder
//! until the collector reclaims it after its last frame has been rendered.
//! Control and render threads read the atomic fields; only the worker
//! touches the decoder and its scratch buffer.

use crate::audio::buffer::PcmChunk;
use crate::audio::decoder::{Decoder, DecoderEvents};
use crate::audio::format::PcmFormat;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Sentinel in `frame_to_seek` meaning no request is pending
pub const NO_SEEK: i64 = -1;

/// State of one active decoder
pub struct DecoderState {
    /// Instance id for event correlation and logging
    pub id: Uuid,

    /// Source URL, cached so non-worker threads never touch the decoder
    pub url: Arc<str>,

    /// Format the decoder produces, cached at activation
    pub format: PcmFormat,

    /// Seek capability, cached at activation
    pub supports_seeking: bool,

    /// Absolute frame index of this decoder's first frame in the ring
    pub timestamp: i64,

    /// Total frames; provisional until rewritten at end of stream
    pub total_frames: AtomicI64,

    /// Frames of this decoder attributed by the render path
    pub frames_rendered: AtomicI64,

    /// Pending seek target, [`NO_SEEK`] when none
    pub frame_to_seek: AtomicI64,

    /// Cleared to cancel the worker's decode loop
    pub keep_decoding: AtomicBool,

    /// Set by the render path when the last frame has been rendered
    pub ready_for_collection: AtomicBool,

    /// Latch so `rendering_started` fires exactly once
    rendering_started: AtomicBool,

    /// Lifecycle hooks, shared with the render thread
    pub events: Arc<dyn DecoderEvents>,

    /// The decoder itself; worker thread only
    decoder: Mutex<Box<dyn Decoder>>,

    /// Scratch for one decode chunk; worker thread only
    scratch: Mutex<PcmChunk>,
}

impl DecoderState {
    /// Create state for a dequeued decoder at ring position `timestamp`
    pub fn new(decoder: Box<dyn Decoder>, timestamp: i64) -> Self {
        let format = decoder.format();
        let url: Arc<str> = Arc::from(decoder.url());
        let supports_seeking = decoder.supports_seeking();
        let total_frames = decoder.total_frames();
        let events = decoder.events();

        Self {
            id: Uuid::new_v4(),
            url,
            format,
            supports_seeking,
            timestamp,
            total_frames: AtomicI64::new(total_frames),
            frames_rendered: AtomicI64::new(0),
            frame_to_seek: AtomicI64::new(NO_SEEK),
            keep_decoding: AtomicBool::new(true),
            ready_for_collection: AtomicBool::new(false),
            rendering_started: AtomicBool::new(false),
            events,
            decoder: Mutex::new(decoder),
            scratch: Mutex::new(PcmChunk::new(format.channels, 0)),
        }
    }

    /// Size the scratch buffer for one decode chunk
    pub fn allocate_scratch(&self, frames: usize) {
        *self.scratch.lock().unwrap() = PcmChunk::new(self.format.channels, frames);
    }

    /// Run `f` with exclusive access to the decoder and its scratch
    ///
    /// Worker thread only; the locks are never contended.
    pub fn with_decoder<R>(&self, f: impl FnOnce(&mut dyn Decoder, &mut PcmChunk) -> R) -> R {
        let mut decoder = self.decoder.lock().unwrap();
        let mut scratch = self.scratch.lock().unwrap();
        f(decoder.as_mut(), &mut scratch)
    }

    /// Completion predicate used by every reader
    ///
    /// `frames_rendered` may briefly exceed an optimistic total in the
    /// end-of-stream race window, so this is an inequality.
    pub fn is_fully_rendered(&self) -> bool {
        self.frames_rendered.load(Ordering::SeqCst) >= self.total_frames.load(Ordering::SeqCst)
    }

    pub fn is_ready_for_collection(&self) -> bool {
        self.ready_for_collection.load(Ordering::SeqCst)
    }

    pub fn keep_decoding(&self) -> bool {
        self.keep_decoding.load(Ordering::SeqCst)
    }

    /// Latch the first frame attribution; true exactly once
    pub fn mark_rendering_started(&self) -> bool {
        self.rendering_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Latch the collection handoff; true exactly once
    ///
    /// The one-shot transition is what lets the render path fire
    /// `rendering_finished` without double-firing across passes.
    pub fn mark_ready_for_collection(&self) -> bool {
        self.ready_for_collection
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Cancel decoding and hand the slot to the collector
    pub fn cancel(&self) {
        self.keep_decoding.store(false, Ordering::SeqCst);
        self.ready_for_collection.store(true, Ordering::SeqCst);
    }

    /// The frame the playhead reports: a pending seek target wins over the
    /// rendered position
    pub fn playhead_frame(&self) -> i64 {
        let pending = self.frame_to_seek.load(Ordering::SeqCst);
        if pending != NO_SEEK {
            pending
        } else {
            self.frames_rendered.load(Ordering::SeqCst)
        }
    }
}

impl std::fmt::Debug for DecoderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderState")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("timestamp", &self.timestamp)
            .field("total_frames", &self.total_frames.load(Ordering::Relaxed))
            .field(
                "frames_rendered",
                &self.frames_rendered.load(Ordering::Relaxed),
            )
            .field(
                "ready_for_collection",
                &self.ready_for_collection.load(Ordering::Relaxed),
            )
            .finish()
    }
}
