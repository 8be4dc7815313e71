//! Shared test fixtures: a manually-driven output device and scripted
//! decoders with lifecycle recording

use gapless_player::audio::buffer::PcmChunk;
use gapless_player::audio::decoder::{Decoder, DecoderEvents};
use gapless_player::audio::device::{
    DevicePropertyListener, ListenerId, OutputDevice, OutputStream, RenderOutcome, RenderSink,
    StreamProperty, StreamPropertyListener,
};
use gapless_player::audio::format::PcmFormat;
use gapless_player::error::{Error, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// Install the test tracing subscriber
///
/// Capture goes to the per-test writer so failure output carries the
/// engine's logs. First caller wins; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("gapless_player=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Poll `condition` every few milliseconds until it holds or `timeout`
/// expires; returns whether it held
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

// ========================================
// Lifecycle recording
// ========================================

/// Ordered log of lifecycle callbacks across all decoders under test
#[derive(Default)]
pub struct EventLog {
    entries: Mutex<Vec<String>>,
}

impl EventLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, name: &str, event: &str) {
        self.entries.lock().unwrap().push(format!("{name}:{event}"));
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries()
            .iter()
            .filter(|recorded| recorded.as_str() == entry)
            .count()
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.count(entry) > 0
    }

    /// Index of the first occurrence, if any
    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries()
            .iter()
            .position(|recorded| recorded.as_str() == entry)
    }
}

/// Hook object writing into a shared [`EventLog`] under a decoder name
pub struct Recorder {
    name: String,
    log: Arc<EventLog>,
}

impl Recorder {
    pub fn new(name: &str, log: Arc<EventLog>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            log,
        })
    }
}

impl DecoderEvents for Recorder {
    fn decoding_started(&self) {
        self.log.push(&self.name, "decoding_started");
    }
    fn decoding_finished(&self) {
        self.log.push(&self.name, "decoding_finished");
    }
    fn rendering_started(&self) {
        self.log.push(&self.name, "rendering_started");
    }
    fn rendering_finished(&self) {
        self.log.push(&self.name, "rendering_finished");
    }
}

// ========================================
// Scripted decoder
// ========================================

/// Deterministic sample value for a frame of a scripted decoder
pub fn sample_at(frame: i64) -> f32 {
    ((frame % 997) as f32) / 997.0
}

/// Decoder producing a deterministic ramp of `total` frames
pub struct ScriptedDecoder {
    name: String,
    format: PcmFormat,
    total: i64,
    position: i64,
    seekable: bool,
    events: Arc<Recorder>,
}

impl ScriptedDecoder {
    pub fn new(
        name: &str,
        format: PcmFormat,
        total: i64,
        log: Arc<EventLog>,
    ) -> Box<Self> {
        Box::new(Self {
            name: name.to_string(),
            format,
            total,
            position: 0,
            seekable: true,
            events: Recorder::new(name, log),
        })
    }

    pub fn unseekable(mut self: Box<Self>) -> Box<Self> {
        self.seekable = false;
        self
    }
}

impl Decoder for ScriptedDecoder {
    fn url(&self) -> &str {
        &self.name
    }

    fn format(&self) -> PcmFormat {
        self.format
    }

    fn supports_seeking(&self) -> bool {
        self.seekable
    }

    fn total_frames(&self) -> i64 {
        self.total
    }

    fn current_frame(&self) -> i64 {
        self.position
    }

    fn seek_to_frame(&mut self, frame: i64) -> Result<i64> {
        if !self.seekable {
            return Err(Error::SeekFailed { requested: frame });
        }
        self.position = frame.clamp(0, (self.total - 1).max(0));
        Ok(self.position)
    }

    fn read(&mut self, chunk: &mut PcmChunk, max_frames: usize) -> Result<usize> {
        let remaining = (self.total - self.position).max(0) as usize;
        let frames = remaining.min(max_frames).min(chunk.capacity());

        for i in 0..frames {
            let value = sample_at(self.position + i as i64);
            for ch in 0..self.format.channels as usize {
                chunk.plane_mut(ch)[i] = value;
            }
        }
        chunk.set_frames(frames);
        self.position += frames as i64;
        Ok(frames)
    }

    fn events(&self) -> Arc<dyn DecoderEvents> {
        Arc::clone(&self.events) as Arc<dyn DecoderEvents>
    }
}

// ========================================
// Manual device
// ========================================

pub struct ManualStream {
    virtual_format: Mutex<PcmFormat>,
    listeners: Mutex<Vec<(ListenerId, Weak<dyn StreamPropertyListener>)>>,
    next_id: AtomicU64,
}

impl ManualStream {
    fn notify(&self, property: StreamProperty) {
        let listeners = self.listeners.lock().unwrap().clone();
        for (_, listener) in listeners {
            if let Some(listener) = listener.upgrade() {
                listener.stream_property_changed(property);
            }
        }
    }
}

impl OutputStream for ManualStream {
    fn virtual_format(&self) -> Result<PcmFormat> {
        Ok(*self.virtual_format.lock().unwrap())
    }

    fn physical_format(&self) -> Result<PcmFormat> {
        Ok(*self.virtual_format.lock().unwrap())
    }

    fn set_physical_format(&self, format: &PcmFormat) -> Result<()> {
        *self.virtual_format.lock().unwrap() = *format;
        self.notify(StreamProperty::PhysicalFormat);
        Ok(())
    }

    fn add_listener(&self, listener: Weak<dyn StreamPropertyListener>) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.lock().unwrap().push((id, listener));
        id
    }

    fn remove_listener(&self, id: ListenerId) {
        self.listeners
            .lock()
            .unwrap()
            .retain(|(lid, _)| *lid != id);
    }
}

/// Output device driven explicitly from the test thread
///
/// `drive` performs one render pass, standing in for the device's periodic
/// realtime callback. Property changes are delivered synchronously from the
/// calling thread, standing in for a property-listener thread.
pub struct ManualDevice {
    stream: Arc<ManualStream>,
    sink: Mutex<Option<Arc<dyn RenderSink>>>,
    running: AtomicBool,
    hog: Mutex<Option<u32>>,
    volume: Mutex<f32>,
    buffer_frames: usize,
    listeners: Mutex<Vec<(ListenerId, Weak<dyn DevicePropertyListener>)>>,
    next_id: AtomicU64,
}

impl ManualDevice {
    pub fn new(virtual_format: PcmFormat, buffer_frames: usize) -> Arc<Self> {
        Arc::new(Self {
            stream: Arc::new(ManualStream {
                virtual_format: Mutex::new(virtual_format),
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
            sink: Mutex::new(None),
            running: AtomicBool::new(false),
            hog: Mutex::new(None),
            volume: Mutex::new(1.0),
            buffer_frames,
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// One render pass of `frames` frames; returns the outcome and the
    /// produced interleaved buffer
    pub fn drive(&self, frames: usize) -> (RenderOutcome, Vec<f32>) {
        let sink = self
            .sink
            .lock()
            .unwrap()
            .clone()
            .expect("device has no render sink attached");
        let channels = self.stream.virtual_format.lock().unwrap().channels as usize;

        let mut buffer = vec![0.0f32; frames * channels];
        let outcome = sink.render(&mut buffer, frames);
        if outcome == RenderOutcome::StopOutput {
            self.running.store(false, Ordering::SeqCst);
        }
        (outcome, buffer)
    }

    /// Change the virtual format and deliver the property notification,
    /// as the platform would from its listener thread
    pub fn change_virtual_format(&self, format: PcmFormat) {
        *self.stream.virtual_format.lock().unwrap() = format;
        self.stream.notify(StreamProperty::VirtualFormat);
    }
}

impl OutputDevice for ManualDevice {
    fn name(&self) -> String {
        "manual test device".to_string()
    }

    fn open(&self, sink: Arc<dyn RenderSink>) -> Result<()> {
        *self.sink.lock().unwrap() = Some(sink);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        *self.sink.lock().unwrap() = None;
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn start(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn nominal_sample_rate(&self) -> Result<f64> {
        Ok(self.stream.virtual_format.lock().unwrap().sample_rate as f64)
    }

    fn set_nominal_sample_rate(&self, _rate: f64) -> Result<()> {
        Ok(())
    }

    fn buffer_frame_size(&self) -> Result<usize> {
        Ok(self.buffer_frames)
    }

    fn volume(&self, _channel: u32) -> Result<f32> {
        Ok(*self.volume.lock().unwrap())
    }

    fn set_volume(&self, _channel: u32, volume: f32) -> Result<()> {
        *self.volume.lock().unwrap() = volume.clamp(0.0, 1.0);
        Ok(())
    }

    fn hog_pid(&self) -> Result<Option<u32>> {
        Ok(*self.hog.lock().unwrap())
    }

    fn set_hog_pid(&self, pid: Option<u32>) -> Result<()> {
        *self.hog.lock().unwrap() = pid;
        Ok(())
    }

    fn streams(&self) -> Result<Vec<Arc<dyn OutputStream>>> {
        Ok(vec![Arc::clone(&self.stream) as Arc<dyn OutputStream>])
    }

    fn add_listener(&self, listener: Weak<dyn DevicePropertyListener>) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.lock().unwrap().push((id, listener));
        id
    }

    fn remove_listener(&self, id: ListenerId) {
        self.listeners
            .lock()
            .unwrap()
            .retain(|(lid, _)| *lid != id);
    }
}
