//! File decoder backed by symphonia
//!
//! Streams PCM from an audio file (MP3, FLAC, Vorbis, AAC, WAV and friends)
//! through the [`Decoder`] interface. Packets are decoded on demand; frames
//! beyond the requested chunk are carried over to the next read.

use crate::audio::buffer::PcmChunk;
use crate::audio::decoder::{Decoder, TOTAL_FRAMES_UNKNOWN};
use crate::audio::format::PcmFormat;
use crate::error::{Error, Result};
use std::collections::VecDeque;
use std::path::Path;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;
use tracing::{debug, warn};

/// Streaming decoder for a local audio file
pub struct FileDecoder {
    url: String,
    format: PcmFormat,
    total_frames: i64,
    current_frame: i64,

    reader: Box<dyn FormatReader>,
    decoder: Box<dyn symphonia::core::codecs::Decoder>,
    track_id: u32,

    /// Interleaved samples decoded past the end of the last chunk
    carry: VecDeque<f32>,
    eof: bool,
}

impl FileDecoder {
    /// Open and probe `path`
    pub fn open(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(extension) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(extension);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| Error::Decode(format!("probe {}: {}", path.display(), e)))?;

        let reader = probed.format;
        let track = reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| Error::Decode(format!("no audio track in {}", path.display())))?;

        let track_id = track.id;
        let codec_params = track.codec_params.clone();

        let sample_rate = codec_params
            .sample_rate
            .ok_or_else(|| Error::Decode("sample rate not reported".to_string()))?;
        let channels = codec_params
            .channels
            .map(|c| c.count() as u16)
            .ok_or_else(|| Error::Decode("channel count not reported".to_string()))?;

        let total_frames = codec_params
            .n_frames
            .map(|n| n as i64)
            .unwrap_or(TOTAL_FRAMES_UNKNOWN);

        let decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| Error::Decode(format!("codec for {}: {}", path.display(), e)))?;

        debug!(
            "Opened {}: {} Hz, {} ch, {} frames",
            path.display(),
            sample_rate,
            channels,
            total_frames
        );

        Ok(Self {
            url: format!("file://{}", path.display()),
            format: PcmFormat::planar_f32(sample_rate, channels),
            total_frames,
            current_frame: 0,
            reader,
            decoder,
            track_id,
            carry: VecDeque::new(),
            eof: false,
        })
    }

    /// Decode the next packet of our track into the carry queue
    ///
    /// Returns false at end of stream.
    fn decode_next_packet(&mut self) -> Result<bool> {
        loop {
            let packet = match self.reader.next_packet() {
                Ok(packet) => packet,
                Err(symphonia::core::errors::Error::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(false);
                }
                Err(symphonia::core::errors::Error::ResetRequired) => {
                    return Ok(false);
                }
                Err(e) => {
                    return Err(Error::Decode(format!("read packet: {}", e)));
                }
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    let spec = *decoded.spec();
                    let duration = decoded.capacity() as u64;
                    let mut buf = SampleBuffer::<f32>::new(duration, spec);
                    buf.copy_interleaved_ref(decoded);
                    self.carry.extend(buf.samples().iter().copied());
                    return Ok(true);
                }
                Err(symphonia::core::errors::Error::DecodeError(e)) => {
                    // Corrupt packet; symphonia recommends skipping it.
                    warn!("Skipping undecodable packet in {}: {}", self.url, e);
                    continue;
                }
                Err(e) => {
                    return Err(Error::Decode(format!("decode packet: {}", e)));
                }
            }
        }
    }
}

impl Decoder for FileDecoder {
    fn url(&self) -> &str {
        &self.url
    }

    fn format(&self) -> PcmFormat {
        self.format
    }

    fn supports_seeking(&self) -> bool {
        true
    }

    fn total_frames(&self) -> i64 {
        self.total_frames
    }

    fn current_frame(&self) -> i64 {
        self.current_frame
    }

    fn seek_to_frame(&mut self, frame: i64) -> Result<i64> {
        // Seeks past the end land on the final frame, keeping the request
        // renderable.
        let frame = if self.total_frames != TOTAL_FRAMES_UNKNOWN {
            frame.clamp(0, (self.total_frames - 1).max(0))
        } else {
            frame.max(0)
        };

        let time = Time::from(frame as f64 / self.format.sample_rate as f64);
        let seeked = self
            .reader
            .seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    time,
                    track_id: Some(self.track_id),
                },
            )
            .map_err(|e| Error::Decode(format!("seek to {}: {}", frame, e)))?;

        self.decoder.reset();
        self.carry.clear();
        self.eof = false;
        self.current_frame = seeked.actual_ts as i64;

        Ok(self.current_frame)
    }

    fn read(&mut self, chunk: &mut PcmChunk, max_frames: usize) -> Result<usize> {
        let channels = self.format.channels as usize;
        let max_frames = max_frames.min(chunk.capacity());
        let wanted_samples = max_frames * channels;

        while self.carry.len() < wanted_samples && !self.eof {
            if !self.decode_next_packet()? {
                self.eof = true;
            }
        }

        let frames = (self.carry.len() / channels).min(max_frames);
        for i in 0..frames {
            for ch in 0..channels {
                let sample = self.carry.pop_front().unwrap_or(0.0);
                chunk.plane_mut(ch)[i] = sample;
            }
        }
        chunk.set_frames(frames);
        self.current_frame += frames as i64;

        Ok(frames)
    }
}
