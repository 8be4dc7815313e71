//! Error types for the playback engine
//!
//! Only `Io` carries a `#[from]` conversion: it is the one foreign error
//! that reaches the crate boundary untouched (opening a source file).
//! Everything else is raised at a specific pipeline seam, and that seam
//! picks the variant so the failure keeps its context instead of falling
//! into a blanket conversion.

use crate::audio::format::PcmFormat;
use thiserror::Error;

/// Main error type for the playback engine
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Device or stream binding errors
    #[error("Invalid device or stream: {0}")]
    InvalidDeviceOrStream(String),

    /// Resource allocation failure (ring buffer, converter, threads)
    #[error("Resource allocation failed: {0}")]
    ResourceAllocation(String),

    /// Decoder could not be activated
    #[error("Decoder rejected: {0}")]
    DecoderRejected(String),

    /// Enqueued decoder format does not match the adopted ring buffer format
    ///
    /// Gapless joins require bit-exact format descriptors.
    #[error("Format mismatch on enqueue: expected {expected:?}, got {actual:?}")]
    FormatMismatch {
        expected: PcmFormat,
        actual: PcmFormat,
    },

    /// The current decoder does not support seeking
    #[error("Seek unsupported by current decoder")]
    SeekUnsupported,

    /// The decoder failed to land a seek request
    #[error("Seek to frame {requested} failed")]
    SeekFailed { requested: i64 },

    /// Device property read/write or reconfiguration errors
    #[error("Device configuration failed: {0}")]
    DeviceConfiguration(String),

    /// Ring buffer write would overrun the reader
    ///
    /// Defensive: the worker gates writes on free space, so this must not
    /// occur on the hot path.
    #[error("Ring buffer overrun: requested {requested} frames, {free} free")]
    BufferOverrun { requested: usize, free: usize },

    /// Audio decoding errors (general)
    #[error("Audio decode error: {0}")]
    Decode(String),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience Result type using the engine Error
pub type Result<T> = std::result::Result<T, Error>;
