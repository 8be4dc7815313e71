//! Decoder collaborator interface
//!
//! A decoder produces PCM frames from a source URL. The engine drives one
//! decoder at a time from its worker thread; the only decoder state touched
//! from other threads is the lifecycle hook object, which is split out as
//! `DecoderEvents` so the render thread never aliases the decoder itself.

use crate::audio::buffer::PcmChunk;
use crate::audio::format::PcmFormat;
use crate::error::Result;
use std::sync::{Arc, OnceLock};

/// Sentinel for decoders that cannot report a frame total up front
///
/// Compressed formats may only learn their length at end of stream; the
/// worker rewrites the total from the final read position in that case.
pub const TOTAL_FRAMES_UNKNOWN: i64 = i64::MAX;

/// Lifecycle notification hooks for one decoder
///
/// `decoding_started` and `decoding_finished` are raised from the worker
/// thread. `rendering_started` and `rendering_finished` are raised from the
/// realtime render thread and implementations must not allocate, block, or
/// take locks there.
pub trait DecoderEvents: Send + Sync {
    fn decoding_started(&self) {}
    fn decoding_finished(&self) {}
    fn rendering_started(&self) {}
    fn rendering_finished(&self) {}
}

/// Hook object that ignores every notification
pub struct NoEvents;

impl DecoderEvents for NoEvents {}

fn no_events() -> Arc<dyn DecoderEvents> {
    static NOOP: OnceLock<Arc<NoEvents>> = OnceLock::new();
    NOOP.get_or_init(|| Arc::new(NoEvents)).clone()
}

/// A source of decoded PCM frames
pub trait Decoder: Send {
    /// Source location, for diagnostics and the playing-URL query
    fn url(&self) -> &str;

    /// Format of the frames this decoder produces
    ///
    /// Must not change over the decoder's lifetime; it is the gapless-join
    /// equality gate at enqueue.
    fn format(&self) -> PcmFormat;

    /// Whether `seek_to_frame` is usable
    fn supports_seeking(&self) -> bool;

    /// Total frame count, or [`TOTAL_FRAMES_UNKNOWN`]
    ///
    /// May be an estimate; the engine corrects it at end of stream.
    fn total_frames(&self) -> i64;

    /// Next frame `read` will produce
    fn current_frame(&self) -> i64;

    /// Seek so the next read produces `frame`, returning the actual landing
    /// frame
    fn seek_to_frame(&mut self, frame: i64) -> Result<i64>;

    /// Decode up to `max_frames` frames into `chunk`
    ///
    /// Returns the number of frames produced; 0 is end of stream. The chunk
    /// is reset by the caller before each read.
    fn read(&mut self, chunk: &mut PcmChunk, max_frames: usize) -> Result<usize>;

    /// Lifecycle hooks for this decoder
    ///
    /// Captured once at activation. The default is a shared no-op object.
    fn events(&self) -> Arc<dyn DecoderEvents> {
        no_events()
    }
}
