//! PCM format descriptors
//!
//! The descriptor plays two roles: it describes the layout a decoder
//! produces, and its derived equality is the gate for gapless joins. Two
//! decoders may share the ring buffer only when their descriptors compare
//! bit-exactly equal.

use serde::{Deserialize, Serialize};

/// PCM stream format descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcmFormat {
    /// Frames per second
    pub sample_rate: u32,

    /// Channels per frame
    pub channels: u16,

    /// Bytes per frame in the described layout
    pub bytes_per_frame: u16,

    /// Channel-per-buffer (planar) layout when false
    pub interleaved: bool,
}

impl PcmFormat {
    /// Descriptor for planar f32 PCM, the transport format of the pipeline
    pub fn planar_f32(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bytes_per_frame: 4,
            interleaved: false,
        }
    }

    /// Descriptor for interleaved f32 PCM, the usual device-side layout
    pub fn interleaved_f32(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bytes_per_frame: 4 * channels,
            interleaved: true,
        }
    }

    /// Convert a frame count to seconds at this rate
    pub fn frames_to_seconds(&self, frames: i64) -> f64 {
        frames as f64 / self.sample_rate as f64
    }

    /// Convert seconds to a frame count at this rate
    pub fn seconds_to_frames(&self, seconds: f64) -> i64 {
        (seconds * self.sample_rate as f64) as i64
    }
}

impl std::fmt::Display for PcmFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} Hz, {} ch, {} B/frame, {}",
            self.sample_rate,
            self.channels,
            self.bytes_per_frame,
            if self.interleaved {
                "interleaved"
            } else {
                "planar"
            }
        )
    }
}
