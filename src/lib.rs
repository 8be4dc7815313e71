//! # Gapless audio playback engine
//!
//! Plays a queue of decoded audio streams to a hardware output device with
//! no gaps between format-identical streams.
//!
//! **Architecture:** a decoder worker refills a lock-free ring buffer; the
//! device's realtime callback drains it through a format converter; a
//! collector reclaims finished decoders once no realtime context can still
//! reference them. A [`Player`] orchestrates the pipeline and exposes the
//! control surface.
//!
//! Collaborators are traits in [`audio`]: bring your own [`audio::decoder::Decoder`]
//! and [`audio::device::OutputDevice`], or use the bundled symphonia and
//! cpal backends.

pub mod audio;
pub mod config;
pub mod error;
pub mod events;
pub mod playback;

pub use audio::format::PcmFormat;
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use events::EngineEvent;
pub use playback::engine::{EnqueueError, Player};
