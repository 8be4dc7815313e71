//! Active decoder set
//!
//! A fixed array of eight slots, each empty or owning one `DecoderState`.
//! Slots are claimed with a compare-and-swap from null by the worker and
//! released with a compare-and-swap back to null by the collector, so the
//! render thread can scan the array without locks.
//!
//! Slots are unordered; logical order is by `DecoderState::timestamp`, which
//! is strictly increasing across insertions, so ties cannot occur.
//!
//! ## Reference protocol
//!
//! `current` and `next_after` return plain references obtained from the slot
//! pointer. A reference must not be held across a collector wake cycle: slot
//! removal makes the state invisible to new scans, and the collector defers
//! the final drop by one full cycle, so any scan that loaded the pointer
//! before removal finishes safely.

use crate::config::ACTIVE_DECODER_SLOTS;
use crate::playback::decoder_state::DecoderState;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Fixed-capacity set of active decoder states
pub struct ActiveDecoders {
    slots: [AtomicPtr<DecoderState>; ACTIVE_DECODER_SLOTS],
}

impl ActiveDecoders {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
        }
    }

    /// Claim an empty slot for `state`
    ///
    /// Returns false when all slots are occupied; the caller aborts the
    /// activation in that case.
    pub fn try_insert(&self, state: Arc<DecoderState>) -> bool {
        let raw = Arc::into_raw(state) as *mut DecoderState;
        for slot in &self.slots {
            if !slot.load(Ordering::SeqCst).is_null() {
                continue;
            }
            if slot
                .compare_exchange(ptr::null_mut(), raw, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
        warn!("Active decoder set is full; activation rejected");
        // Reclaim the strong count we took for the slot.
        drop(unsafe { Arc::from_raw(raw) });
        false
    }

    fn slot_ref(&self, index: usize) -> Option<&DecoderState> {
        let raw = self.slots[index].load(Ordering::SeqCst);
        // Valid per the reference protocol above: a non-null slot pointer
        // stays allocated for at least one collector cycle after removal.
        unsafe { raw.as_ref() }
    }

    /// The state with the smallest timestamp that is neither fully rendered
    /// nor ready for collection
    pub fn current(&self) -> Option<&DecoderState> {
        let mut result: Option<&DecoderState> = None;
        for index in 0..ACTIVE_DECODER_SLOTS {
            let Some(state) = self.slot_ref(index) else {
                continue;
            };
            if state.is_ready_for_collection() || state.is_fully_rendered() {
                continue;
            }
            if result.map_or(true, |best| state.timestamp < best.timestamp) {
                result = Some(state);
            }
        }
        result
    }

    /// The state with the smallest timestamp strictly greater than `after`,
    /// ignoring collection-ready states
    pub fn next_after(&self, after: i64) -> Option<&DecoderState> {
        let mut result: Option<&DecoderState> = None;
        for index in 0..ACTIVE_DECODER_SLOTS {
            let Some(state) = self.slot_ref(index) else {
                continue;
            };
            if state.is_ready_for_collection() || state.timestamp <= after {
                continue;
            }
            if result.map_or(true, |best| state.timestamp < best.timestamp) {
                result = Some(state);
            }
        }
        result
    }

    /// Cancel every active state and flag it for collection
    pub fn cancel_all(&self) {
        for index in 0..ACTIVE_DECODER_SLOTS {
            if let Some(state) = self.slot_ref(index) {
                state.cancel();
            }
        }
    }

    /// Release every collection-ready slot, appending the owned states to
    /// `out` for deferred destruction
    pub fn take_ready(&self, out: &mut Vec<Arc<DecoderState>>) {
        for slot in &self.slots {
            let raw = slot.load(Ordering::SeqCst);
            let Some(state) = (unsafe { raw.as_ref() }) else {
                continue;
            };
            if !state.is_ready_for_collection() {
                continue;
            }
            if slot
                .compare_exchange(raw, ptr::null_mut(), Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                out.push(unsafe { Arc::from_raw(raw) });
            }
        }
    }

    /// Number of occupied slots
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| !slot.load(Ordering::SeqCst).is_null())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ActiveDecoders {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ActiveDecoders {
    fn drop(&mut self) {
        // Single-threaded by now; reclaim whatever the collector left.
        for slot in &self.slots {
            let raw = slot.swap(ptr::null_mut(), Ordering::SeqCst);
            if !raw.is_null() {
                drop(unsafe { Arc::from_raw(raw) });
            }
        }
    }
}
