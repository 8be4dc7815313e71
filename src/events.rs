//! Control-plane event broadcasting
//!
//! One-to-many notifications for embedders: playback state, queue changes,
//! device rebinding, format changes. Emission is non-blocking and lossy
//! when nobody subscribes.
//!
//! Per-decoder lifecycle callbacks do not pass through here; those are the
//! `DecoderEvents` hooks, raised directly from the worker and render
//! threads.

use crate::audio::format::PcmFormat;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Engine-level events
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Output started or stopped
    PlaybackStateChanged { playing: bool },

    /// A decoder was accepted into the pending queue
    DecoderQueued { url: String },

    /// A decoder was activated by the worker
    DecoderActivated { id: Uuid, url: String },

    /// The pending queue was cleared
    QueueCleared,

    /// Output was rebound to a device
    DeviceChanged { name: String },

    /// The stream's virtual format changed and the converter was rebuilt
    StreamFormatChanged { format: PcmFormat },
}

/// Broadcast channel for [`EngineEvent`]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to the event stream
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Broadcast an event; no subscribers is not an error
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
