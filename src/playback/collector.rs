//! Deferred reclamation of decoder states
//!
//! The render path marks a state ready for collection; this thread swaps
//! the slot back to empty and destroys the state. Destruction is deferred
//! by one full wake cycle: slot removal already hides the state from new
//! render scans, and the extra cycle guarantees that a scan which loaded
//! the slot pointer just before removal has finished long before the memory
//! goes away.

use crate::error::{Error, Result};
use crate::playback::decoder_state::DecoderState;
use crate::playback::shared::EngineShared;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::debug;

/// Launch the collector on its own named thread
pub fn spawn(shared: Arc<EngineShared>) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("collector".to_string())
        .spawn(move || run(shared))
        .map_err(|e| Error::ResourceAllocation(format!("collector thread: {e}")))
}

fn run(shared: Arc<EngineShared>) {
    debug!("Collector started");
    let timeout = shared.config.wake_timeout();
    let mut graveyard: Vec<Arc<DecoderState>> = Vec::new();

    while shared.keep_collecting.load(Ordering::SeqCst) {
        // Destroy what was unlinked last cycle.
        graveyard.clear();

        shared.active.take_ready(&mut graveyard);
        for state in &graveyard {
            debug!("Collected decoder {} ({})", state.id, state.url);
        }

        shared.collector_sem.wait_timeout(timeout);
    }

    // Shutdown sweep; remaining slots are drained when the set drops.
    graveyard.clear();
    shared.active.take_ready(&mut graveyard);
    debug!("Collector exiting ({} reclaimed on shutdown)", graveyard.len());
}
