//! Lock-free ring buffer for PCM frames
//!
//! Single-producer single-consumer circular buffer holding multi-channel
//! planar f32 frames. Positions are absolute monotonic frame indices; the
//! physical slot is the index modulo the capacity. The valid window at any
//! instant is `[frames_rendered, frames_decoded)` and never exceeds the
//! capacity.
//!
//! ## Thread safety
//!
//! - Producer (decoder worker) calls `store`; consumer (converter input
//!   callback on the render thread) calls `fetch`. Both take `&self` and may
//!   run concurrently without locks.
//! - Samples are stored in `AtomicU32` cells as f32 bit patterns, so the
//!   two sides never form a data race. Cell accesses are Relaxed; the
//!   publication edge is the SeqCst update of the shared frame counters,
//!   which the producer bumps after writing and the consumer reads before
//!   fetching.

use crate::audio::buffer::PcmChunk;
use crate::error::{Error, Result};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Absolute frame counters shared across the pipeline
///
/// Both advance monotonically and give positions in the ring buffer's
/// address space. `rendered` never passes `decoded`.
#[derive(Debug, Default)]
pub struct FrameCounters {
    pub decoded: AtomicI64,
    pub rendered: AtomicI64,
}

impl FrameCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames currently valid in the ring
    pub fn available(&self) -> i64 {
        self.decoded.load(Ordering::SeqCst) - self.rendered.load(Ordering::SeqCst)
    }

    /// Zero both counters (output must be stopped)
    pub fn reset(&self) {
        self.decoded.store(0, Ordering::SeqCst);
        self.rendered.store(0, Ordering::SeqCst);
    }
}

/// SPSC ring buffer addressed by absolute frame indices
pub struct PcmRingBuffer {
    planes: Vec<Box<[AtomicU32]>>,
    capacity: usize,
    counters: Arc<FrameCounters>,
}

impl PcmRingBuffer {
    /// Allocate a ring for `channels` planes of `capacity` frames
    pub fn new(channels: u16, capacity: usize, counters: Arc<FrameCounters>) -> Self {
        debug!(
            "Allocating ring buffer: {} channels x {} frames",
            channels, capacity
        );
        let planes = (0..channels)
            .map(|_| {
                (0..capacity)
                    .map(|_| AtomicU32::new(0))
                    .collect::<Vec<_>>()
                    .into_boxed_slice()
            })
            .collect();
        Self {
            planes,
            capacity,
            counters,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn channels(&self) -> u16 {
        self.planes.len() as u16
    }

    /// Frames the producer may write without overrunning the reader
    pub fn free_frames(&self) -> usize {
        let used = self.counters.available().max(0) as usize;
        self.capacity.saturating_sub(used)
    }

    /// Write `frames` frames from `src` starting at absolute index `dest`
    ///
    /// Producer side only. Fails if the write would overrun the reader
    /// window; the worker gates on `free_frames` so this is defensive.
    pub fn store(&self, src: &PcmChunk, frames: usize, dest: i64) -> Result<()> {
        let rendered = self.counters.rendered.load(Ordering::SeqCst);
        let writable_end = rendered + self.capacity as i64;
        if dest + frames as i64 > writable_end {
            return Err(Error::BufferOverrun {
                requested: frames,
                free: (writable_end - dest).max(0) as usize,
            });
        }

        let channels = self.planes.len().min(src.channels() as usize);
        let start = (dest.rem_euclid(self.capacity as i64)) as usize;
        let first = frames.min(self.capacity - start);

        for ch in 0..channels {
            let plane = &self.planes[ch];
            let samples = src.plane(ch);
            for i in 0..first {
                plane[start + i].store(samples[i].to_bits(), Ordering::Relaxed);
            }
            for i in first..frames {
                plane[i - first].store(samples[i].to_bits(), Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Read `frames` frames starting at absolute index `src` into `dst`
    ///
    /// Consumer side only. Frames outside the valid window come back as
    /// silence; callers avoid that by checking `FrameCounters::available`
    /// first.
    pub fn fetch(&self, dst: &mut PcmChunk, frames: usize, src: i64) {
        let frames = frames.min(dst.capacity());
        let rendered = self.counters.rendered.load(Ordering::SeqCst);
        let decoded = self.counters.decoded.load(Ordering::SeqCst);

        let channels = self.planes.len().min(dst.channels() as usize);
        for ch in 0..channels {
            let plane = &self.planes[ch];
            let out = dst.plane_mut(ch);
            for i in 0..frames {
                let abs = src + i as i64;
                out[i] = if abs < rendered || abs >= decoded {
                    0.0
                } else {
                    let slot = (abs.rem_euclid(self.capacity as i64)) as usize;
                    f32::from_bits(plane[slot].load(Ordering::Relaxed))
                };
            }
        }
        dst.set_frames(frames);
    }
}
