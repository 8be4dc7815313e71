//! Pull-model PCM format converter
//!
//! Converts from the ring buffer format (planar f32 at the decoders' rate)
//! to the stream's virtual format (interleaved f32 at the device rate). The
//! device side calls [`PcmConverter::fill`], which pulls source frames
//! through an input callback one slab at a time.
//!
//! `fill` runs on the realtime render thread: all buffers are allocated at
//! construction or reset time and reused, and sample-rate conversion goes
//! through rubato's `process_into_buffer` so no allocation happens per pass.

use crate::audio::buffer::PcmChunk;
use crate::audio::format::PcmFormat;
use crate::error::{Error, Result};
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::{debug, warn};

/// Fixed input block for the resampler, in source frames
const RESAMPLER_CHUNK_FRAMES: usize = 1024;

/// Input callback: fill the chunk with up to `want` source frames, return
/// the count produced. 0 means no more input for this pass.
pub type InputCallback<'a> = dyn FnMut(&mut PcmChunk, usize) -> usize + 'a;

/// Converter between a source and destination PCM format
pub struct PcmConverter {
    src: PcmFormat,
    dst: PcmFormat,

    /// Slab handed to the input callback, sized from the device buffer
    slab: PcmChunk,

    /// Present only when source and destination rates differ
    resampler: Option<FastFixedIn<f32>>,

    /// Staged source frames awaiting one fixed resampler block
    staged: Vec<Vec<f32>>,
    staged_len: usize,

    /// Resampled output not yet drained into a fill
    pending: Vec<Vec<f32>>,
    pending_len: usize,
    pending_pos: usize,
}

impl PcmConverter {
    /// Create a converter producing `output_frames_hint` frames per fill
    ///
    /// The hint sizes the input slab; fills for other frame counts still
    /// work, pulling more slabs as needed.
    pub fn new(src: &PcmFormat, dst: &PcmFormat, output_frames_hint: usize) -> Result<Self> {
        let resampler = if src.sample_rate != dst.sample_rate {
            Some(Self::build_resampler(src, dst)?)
        } else {
            None
        };

        let pending_capacity = resampler
            .as_ref()
            .map(|r| r.output_frames_max())
            .unwrap_or(0);

        let slab_frames = Self::input_frames_for(src, dst, output_frames_hint.max(1));

        debug!(
            "Creating converter: {} -> {}, slab {} frames, resampling {}",
            src,
            dst,
            slab_frames,
            resampler.is_some()
        );

        Ok(Self {
            src: *src,
            dst: *dst,
            slab: PcmChunk::new(src.channels, slab_frames),
            resampler,
            staged: vec![vec![0.0; RESAMPLER_CHUNK_FRAMES]; src.channels as usize],
            staged_len: 0,
            pending: vec![vec![0.0; pending_capacity]; src.channels as usize],
            pending_len: 0,
            pending_pos: 0,
        })
    }

    fn build_resampler(src: &PcmFormat, dst: &PcmFormat) -> Result<FastFixedIn<f32>> {
        FastFixedIn::<f32>::new(
            dst.sample_rate as f64 / src.sample_rate as f64,
            1.0,
            PolynomialDegree::Septic,
            RESAMPLER_CHUNK_FRAMES,
            src.channels as usize,
        )
        .map_err(|e| {
            Error::ResourceAllocation(format!(
                "resampler {} Hz -> {} Hz: {}",
                src.sample_rate, dst.sample_rate, e
            ))
        })
    }

    fn input_frames_for(src: &PcmFormat, dst: &PcmFormat, output_frames: usize) -> usize {
        if src.sample_rate == dst.sample_rate {
            output_frames
        } else {
            let ratio = src.sample_rate as f64 / dst.sample_rate as f64;
            (output_frames as f64 * ratio).ceil() as usize + RESAMPLER_CHUNK_FRAMES
        }
    }

    /// Source frames needed to produce `output_frames` destination frames
    pub fn calculate_input_frames(&self, output_frames: usize) -> usize {
        Self::input_frames_for(&self.src, &self.dst, output_frames)
    }

    /// Source format
    pub fn source_format(&self) -> PcmFormat {
        self.src
    }

    /// Destination format
    pub fn destination_format(&self) -> PcmFormat {
        self.dst
    }

    /// Discard internal state after a seek or rebuild
    ///
    /// The resampler is recreated so its filter history cannot smear audio
    /// from before the discontinuity into the next pass.
    pub fn reset(&mut self) {
        self.staged_len = 0;
        self.pending_len = 0;
        self.pending_pos = 0;
        if self.resampler.is_some() {
            match Self::build_resampler(&self.src, &self.dst) {
                Ok(r) => self.resampler = Some(r),
                Err(e) => warn!("Converter reset failed to rebuild resampler: {}", e),
            }
        }
    }

    /// Produce up to `frames` destination frames into `output`
    ///
    /// `output` is interleaved in the destination format and must hold at
    /// least `frames * dst.channels` samples. The unfilled tail is zeroed.
    /// Returns the number of destination frames produced.
    pub fn fill(
        &mut self,
        frames: usize,
        output: &mut [f32],
        input: &mut InputCallback<'_>,
    ) -> usize {
        let produced = if self.resampler.is_some() {
            self.fill_resampled(frames, output, input)
        } else {
            self.fill_direct(frames, output, input)
        };

        let dst_ch = self.dst.channels as usize;
        output[produced * dst_ch..frames * dst_ch].fill(0.0);
        produced
    }

    /// Same-rate path: interleave and channel-map slab by slab
    fn fill_direct(
        &mut self,
        frames: usize,
        output: &mut [f32],
        input: &mut InputCallback<'_>,
    ) -> usize {
        let mut produced = 0;
        while produced < frames {
            let want = (frames - produced).min(self.slab.capacity());
            self.slab.reset();
            let got = input(&mut self.slab, want);
            if got == 0 {
                break;
            }
            self.interleave_from_slab(got, produced, output);
            produced += got;
        }
        produced
    }

    /// Rate-converting path: stage fixed blocks, resample, drain
    fn fill_resampled(
        &mut self,
        frames: usize,
        output: &mut [f32],
        input: &mut InputCallback<'_>,
    ) -> usize {
        let mut produced = 0;

        while produced < frames {
            if self.pending_pos < self.pending_len {
                produced += self.drain_pending(frames - produced, produced, output);
                continue;
            }

            // Stage one fixed resampler block from the input callback.
            while self.staged_len < RESAMPLER_CHUNK_FRAMES {
                let want = (RESAMPLER_CHUNK_FRAMES - self.staged_len).min(self.slab.capacity());
                self.slab.reset();
                let got = input(&mut self.slab, want);
                if got == 0 {
                    break;
                }
                for ch in 0..self.src.channels as usize {
                    self.staged[ch][self.staged_len..self.staged_len + got]
                        .copy_from_slice(&self.slab.plane(ch)[..got]);
                }
                self.staged_len += got;
            }

            if self.staged_len == 0 {
                break;
            }

            // A short final block is padded with silence so the resampler
            // flushes the tail of the stream.
            for ch in 0..self.src.channels as usize {
                self.staged[ch][self.staged_len..].fill(0.0);
            }
            self.staged_len = 0;

            let resampler = self.resampler.as_mut().unwrap();
            match resampler.process_into_buffer(&self.staged, &mut self.pending, None) {
                Ok((_, out_frames)) => {
                    self.pending_len = out_frames;
                    self.pending_pos = 0;
                }
                Err(e) => {
                    warn!("Resampler process failed: {}", e);
                    break;
                }
            }
        }

        produced
    }

    fn drain_pending(&mut self, frames: usize, at: usize, output: &mut [f32]) -> usize {
        let take = frames.min(self.pending_len - self.pending_pos);
        let src_ch = self.src.channels as usize;
        let dst_ch = self.dst.channels as usize;

        for i in 0..take {
            let base = (at + i) * dst_ch;
            for c in 0..dst_ch {
                output[base + c] =
                    Self::map_channel(&self.pending, self.pending_pos + i, c, src_ch);
            }
        }

        self.pending_pos += take;
        take
    }

    fn interleave_from_slab(&self, got: usize, at: usize, output: &mut [f32]) {
        let src_ch = self.src.channels as usize;
        let dst_ch = self.dst.channels as usize;

        for i in 0..got {
            let base = (at + i) * dst_ch;
            for c in 0..dst_ch {
                output[base + c] = if src_ch == 1 {
                    self.slab.plane(0)[i]
                } else if c < src_ch {
                    self.slab.plane(c)[i]
                } else {
                    0.0
                };
            }
        }
    }

    /// Mono sources are duplicated to every destination channel; otherwise
    /// channels map positionally and extra destination channels get silence.
    fn map_channel(planes: &[Vec<f32>], frame: usize, dst_channel: usize, src_ch: usize) -> f32 {
        if src_ch == 1 {
            planes[0][frame]
        } else if dst_channel < src_ch {
            planes[dst_channel][frame]
        } else {
            0.0
        }
    }
}
