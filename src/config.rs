//! Engine tuning parameters
//!
//! All sizes are in frames of the adopted ring buffer format. Defaults match
//! the sizing the pipeline was designed around: a 16384-frame ring refilled
//! in 2048-frame chunks, with 2-second bounded waits on the worker threads.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Number of slots in the active decoder set.
///
/// Fixed so render-path scans are bounded and allocation-free.
pub const ACTIVE_DECODER_SLOTS: usize = 8;

/// Playback engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Ring buffer capacity in frames
    pub ring_capacity_frames: usize,

    /// Write unit from decoder to ring buffer, in frames
    ///
    /// Decoding is gated on at least one chunk of free space.
    pub write_chunk_frames: usize,

    /// Bounded wait timeout for the decoder and collector threads, in
    /// milliseconds
    ///
    /// Bounds wake latency on missed signals; not a watchdog.
    pub wake_timeout_ms: u64,

    /// Capacity of the control-plane event broadcast channel
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ring_capacity_frames: 16384,
            write_chunk_frames: 2048,
            wake_timeout_ms: 2000,
            event_capacity: 64,
        }
    }
}

impl EngineConfig {
    /// Validate parameter relationships
    ///
    /// The chunk size must leave room for at least two chunks in the ring,
    /// otherwise the producer and consumer cannot overlap.
    pub fn validate(&self) -> Result<()> {
        if self.ring_capacity_frames == 0 || self.write_chunk_frames == 0 {
            return Err(Error::Config(
                "ring capacity and write chunk must be non-zero".to_string(),
            ));
        }
        if self.write_chunk_frames * 2 > self.ring_capacity_frames {
            return Err(Error::Config(format!(
                "write chunk ({} frames) must fit twice in the ring ({} frames)",
                self.write_chunk_frames, self.ring_capacity_frames
            )));
        }
        if self.event_capacity == 0 {
            return Err(Error::Config("event capacity must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Bounded wait timeout as a Duration
    pub fn wake_timeout(&self) -> Duration {
        Duration::from_millis(self.wake_timeout_ms)
    }
}
