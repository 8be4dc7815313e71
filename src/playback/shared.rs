//! State shared between the controller and its three worker contexts
//!
//! The controller owns everything; the worker, collector, and render sink
//! each hold an `Arc` of this struct and nothing else, so there is a single
//! ownership root and no cycles.

use crate::audio::decoder::Decoder;
use crate::config::EngineConfig;
use crate::events::EventBus;
use crate::playback::active::ActiveDecoders;
use crate::playback::render::RenderLink;
use crate::playback::ring_buffer::{FrameCounters, PcmRingBuffer};
use crate::playback::sync::Semaphore;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::trace;

/// The stream's virtual format changed; rendering must cease until the
/// converter has been rebuilt
pub const FLAG_VIRTUAL_FORMAT_CHANGED: u32 = 1 << 0;

/// A seek is mutating the frame counters; rendering must skip this pass
pub const FLAG_IS_SEEKING: u32 = 1 << 1;

/// Shared engine state
pub struct EngineShared {
    pub config: EngineConfig,

    /// Mode flag word gating the render fast path
    flags: AtomicU32,

    /// Absolute frame counters, also held by the ring buffer
    pub counters: Arc<FrameCounters>,

    /// Active decoder slots
    pub active: ActiveDecoders,

    /// Decoders awaiting activation, FIFO
    ///
    /// The mutex is never held across a blocking call or device operation.
    pub queue: Mutex<VecDeque<Box<dyn Decoder>>>,

    /// Set by the worker, under the queue mutex, for the window between
    /// popping a decoder and inserting its state into the active set
    ///
    /// The enqueue idle check reads it under the same mutex, so a decoder
    /// in that window can never be mistaken for an idle engine.
    pub activating: AtomicBool,

    /// Ring buffer for the adopted format; rebuilt only while output is
    /// stopped and the queue is idle
    pub ring: RwLock<Option<Arc<PcmRingBuffer>>>,

    /// Render-side view of ring and converter
    ///
    /// Contended only during reconfiguration or seek servicing; the render
    /// thread uses `try_lock` and both contending paths already force it to
    /// silence first.
    pub render_link: Mutex<Option<RenderLink>>,

    /// Wakes the decoder worker
    pub decoder_sem: Semaphore,

    /// Wakes the collector
    pub collector_sem: Semaphore,

    /// Worker thread liveness
    pub keep_decoding: AtomicBool,

    /// Collector thread liveness
    pub keep_collecting: AtomicBool,

    /// Controller-level playing state
    pub is_playing: AtomicBool,

    /// Control-plane event broadcasting
    pub events: EventBus,
}

impl EngineShared {
    pub fn new(config: EngineConfig) -> Self {
        let event_capacity = config.event_capacity;
        Self {
            config,
            flags: AtomicU32::new(0),
            counters: Arc::new(FrameCounters::new()),
            active: ActiveDecoders::new(),
            queue: Mutex::new(VecDeque::new()),
            activating: AtomicBool::new(false),
            ring: RwLock::new(None),
            render_link: Mutex::new(None),
            decoder_sem: Semaphore::new(),
            collector_sem: Semaphore::new(),
            keep_decoding: AtomicBool::new(true),
            keep_collecting: AtomicBool::new(true),
            is_playing: AtomicBool::new(false),
            events: EventBus::new(event_capacity),
        }
    }

    pub fn set_flag(&self, flag: u32) {
        self.flags.fetch_or(flag, Ordering::SeqCst);
    }

    pub fn clear_flag(&self, flag: u32) {
        self.flags.fetch_and(!flag, Ordering::SeqCst);
    }

    pub fn flag_set(&self, flag: u32) -> bool {
        self.flags.load(Ordering::SeqCst) & flag != 0
    }

    /// Current ring buffer, if a format has been adopted
    pub fn current_ring(&self) -> Option<Arc<PcmRingBuffer>> {
        self.ring.read().unwrap().clone()
    }

    /// Device-side latency flush hook, invoked after a successful seek and
    /// from stop
    ///
    /// Intentionally a no-op; kept as the seam where a platform would flush
    /// device-side latency.
    pub fn reset_output(&self) {
        trace!("reset_output");
    }

    /// Cancel all active decoders and zero the frame counters
    ///
    /// Callable from the render thread: flag stores, semaphore signals, and
    /// counter stores only.
    pub fn stop_all_decoders(&self) {
        self.active.cancel_all();
        self.decoder_sem.signal();
        self.collector_sem.signal();
    }
}
