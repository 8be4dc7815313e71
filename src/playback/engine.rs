//! Player controller
//!
//! Owns the shared pipeline state, the worker and collector threads, and the
//! device/stream bindings. Every public operation is callable from any
//! thread; blocking is limited to brief mutex holds, never across a device
//! call on a lock also touched by the render path.

use crate::audio::converter::PcmConverter;
use crate::audio::decoder::Decoder;
use crate::audio::device::{
    DeviceProperty, DevicePropertyListener, ListenerId, OutputDevice, OutputStream, RenderSink,
    StreamProperty, StreamPropertyListener,
};
use crate::audio::format::PcmFormat;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::events::{EngineEvent, EventBus};
use crate::playback::collector;
use crate::playback::decoder_state::NO_SEEK;
use crate::playback::render::{RenderLink, Renderer};
use crate::playback::ring_buffer::PcmRingBuffer;
use crate::playback::shared::{EngineShared, FLAG_VIRTUAL_FORMAT_CHANGED};
use crate::playback::worker;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

/// Fallback render size used to dimension the conversion buffer when the
/// device cannot report one
const DEFAULT_RENDER_FRAMES: usize = 2048;

/// An enqueue rejection; the caller keeps the decoder
pub struct EnqueueError {
    pub decoder: Box<dyn Decoder>,
    pub error: Error,
}

impl std::fmt::Debug for EnqueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnqueueError")
            .field("url", &self.decoder.url())
            .field("error", &self.error)
            .finish()
    }
}

impl std::fmt::Display for EnqueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "enqueue rejected for {}: {}", self.decoder.url(), self.error)
    }
}

impl std::error::Error for EnqueueError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Gapless audio player
///
/// Dropping the player stops output, cancels active decoders, and joins the
/// worker threads.
pub struct Player {
    core: Arc<PlayerCore>,
}

struct PlayerCore {
    self_weak: Weak<PlayerCore>,
    shared: Arc<EngineShared>,
    renderer: Arc<Renderer>,
    device: RwLock<Option<Arc<dyn OutputDevice>>>,
    device_listener: Mutex<Option<ListenerId>>,
    stream: RwLock<Option<Arc<dyn OutputStream>>>,
    stream_listener: Mutex<Option<ListenerId>>,
    stream_virtual_format: RwLock<Option<PcmFormat>>,
    ring_format: RwLock<Option<PcmFormat>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    collector: Mutex<Option<JoinHandle<()>>>,
}

impl Player {
    /// Create a player bound to `device`
    ///
    /// Spawns the decoder and collector threads, opens the device, and
    /// selects its first output stream. On failure everything acquired so
    /// far is released in reverse order.
    pub fn new(config: EngineConfig, device: Arc<dyn OutputDevice>) -> Result<Self> {
        config.validate()?;

        let shared = Arc::new(EngineShared::new(config));
        let renderer = Arc::new(Renderer::new(Arc::clone(&shared)));

        let worker = worker::spawn(Arc::clone(&shared))?;
        let collector = match collector::spawn(Arc::clone(&shared)) {
            Ok(handle) => handle,
            Err(e) => {
                shared.keep_decoding.store(false, Ordering::SeqCst);
                shared.decoder_sem.signal();
                let _ = worker.join();
                return Err(e);
            }
        };

        let core = Arc::new_cyclic(|weak| PlayerCore {
            self_weak: weak.clone(),
            shared,
            renderer,
            device: RwLock::new(Some(device)),
            device_listener: Mutex::new(None),
            stream: RwLock::new(None),
            stream_listener: Mutex::new(None),
            stream_virtual_format: RwLock::new(None),
            ring_format: RwLock::new(None),
            worker: Mutex::new(Some(worker)),
            collector: Mutex::new(Some(collector)),
        });

        let player = Player { core };
        // A failed open drops the player, which joins the threads.
        PlayerCore::open_output(&player.core)?;
        Ok(player)
    }

    /// Create a player on the system default output device
    pub fn with_default_output(config: EngineConfig) -> Result<Self> {
        let device = crate::audio::output_cpal::CpalOutput::default_device()?;
        Self::new(config, device)
    }

    /// Subscribe to control-plane events
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.core.shared.events.subscribe()
    }

    /// Decoded frames not yet rendered
    pub fn buffered_frames(&self) -> usize {
        self.core.shared.counters.available().max(0) as usize
    }

    fn events(&self) -> &EventBus {
        &self.core.shared.events
    }

    // ========================================
    // Playback control
    // ========================================

    pub fn is_playing(&self) -> bool {
        self.core.shared.is_playing.load(Ordering::SeqCst)
    }

    /// Start output; a no-op when already playing
    pub fn play(&self) -> Result<()> {
        if self.is_playing() {
            return Ok(());
        }
        self.core.device_ref()?.start()?;
        self.core.shared.is_playing.store(true, Ordering::SeqCst);
        self.events()
            .emit(EngineEvent::PlaybackStateChanged { playing: true });
        Ok(())
    }

    /// Stop output, keeping all positions; a no-op when already paused
    pub fn pause(&self) -> Result<()> {
        if !self.is_playing() {
            return Ok(());
        }
        self.core.device_ref()?.stop()?;
        self.core.shared.is_playing.store(false, Ordering::SeqCst);
        self.events()
            .emit(EngineEvent::PlaybackStateChanged { playing: false });
        Ok(())
    }

    /// Stop output, cancel every active decoder, and rewind the counters
    ///
    /// Queued decoders stay queued; the next activation starts from frame 0
    /// of the ring's address space.
    pub fn stop(&self) -> Result<()> {
        self.pause()?;
        let shared = &self.core.shared;
        shared.stop_all_decoders();
        shared.reset_output();
        shared.counters.reset();
        info!("Playback stopped");
        Ok(())
    }

    // ========================================
    // Queue management
    // ========================================

    /// Enqueue a decoder for gapless playback
    ///
    /// The first decoder of an idle engine donates its format to the ring
    /// buffer and converter. Subsequent decoders must match that format
    /// bit-exactly; otherwise the decoder is handed back in the error.
    pub fn enqueue(&self, decoder: Box<dyn Decoder>) -> std::result::Result<(), EnqueueError> {
        let core = &self.core;
        let shared = &core.shared;

        let (queue_empty, activating) = {
            let queue = shared.queue.lock().unwrap();
            (queue.is_empty(), shared.activating.load(Ordering::SeqCst))
        };
        let idle = queue_empty && !activating && shared.active.current().is_none();

        if idle {
            if let Err(error) = PlayerCore::adopt_format(core, &decoder.format()) {
                return Err(EnqueueError { decoder, error });
            }
        } else {
            let adopted = *core.ring_format.read().unwrap();
            match adopted {
                Some(expected) if decoder.format() == expected => {}
                Some(expected) => {
                    let actual = decoder.format();
                    debug!(
                        "Rejecting {}: format {} does not match adopted {}",
                        decoder.url(),
                        actual,
                        expected
                    );
                    return Err(EnqueueError {
                        decoder,
                        error: Error::FormatMismatch { expected, actual },
                    });
                }
                None => {
                    return Err(EnqueueError {
                        decoder,
                        error: Error::InvalidDeviceOrStream(
                            "no format adopted while decoders are active".to_string(),
                        ),
                    })
                }
            }
        }

        let url = decoder.url().to_string();
        shared.queue.lock().unwrap().push_back(decoder);
        shared.decoder_sem.signal();
        debug!("Enqueued decoder for {}", url);
        self.events().emit(EngineEvent::DecoderQueued { url });
        Ok(())
    }

    /// Drop every queued decoder; active decoders are unaffected
    pub fn clear_queue(&self) {
        self.core.shared.queue.lock().unwrap().clear();
        self.events().emit(EngineEvent::QueueCleared);
    }

    /// Number of decoders awaiting activation
    pub fn queue_len(&self) -> usize {
        self.core.shared.queue.lock().unwrap().len()
    }

    // ========================================
    // Playback position
    // ========================================

    /// URL of the current decoder
    pub fn playing_url(&self) -> Option<String> {
        self.core
            .shared
            .active
            .current()
            .map(|state| state.url.to_string())
    }

    /// Playhead frame of the current decoder; a pending seek target wins
    pub fn current_frame(&self) -> Option<i64> {
        self.core
            .shared
            .active
            .current()
            .map(|state| state.playhead_frame())
    }

    /// Total frames of the current decoder (provisional until end of stream)
    pub fn total_frames(&self) -> Option<i64> {
        self.core
            .shared
            .active
            .current()
            .map(|state| state.total_frames.load(Ordering::SeqCst))
    }

    /// Playhead position in seconds
    pub fn current_time(&self) -> Option<f64> {
        self.core
            .shared
            .active
            .current()
            .map(|state| state.format.frames_to_seconds(state.playhead_frame()))
    }

    /// Total duration in seconds (provisional until end of stream)
    pub fn total_time(&self) -> Option<f64> {
        self.core.shared.active.current().map(|state| {
            state
                .format
                .frames_to_seconds(state.total_frames.load(Ordering::SeqCst))
        })
    }

    // ========================================
    // Seeking
    // ========================================

    /// Whether the current decoder can seek
    pub fn supports_seeking(&self) -> bool {
        self.core
            .shared
            .active
            .current()
            .map(|state| state.supports_seeking)
            .unwrap_or(false)
    }

    /// Request a seek to `frame` on the current decoder
    ///
    /// Returns false when there is no current decoder, it cannot seek, or
    /// another seek is already in flight. The worker services the request.
    pub fn seek_to_frame(&self, frame: i64) -> bool {
        let shared = &self.core.shared;
        let Some(state) = shared.active.current() else {
            return false;
        };
        if !state.supports_seeking {
            return false;
        }
        if state
            .frame_to_seek
            .compare_exchange(NO_SEEK, frame.max(0), Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        shared.decoder_sem.signal();
        true
    }

    /// Seek relative to the playhead by `seconds` (negative is backward)
    pub fn seek_by(&self, seconds: f64) -> bool {
        let shared = &self.core.shared;
        let Some(state) = shared.active.current() else {
            return false;
        };
        let total = state.total_frames.load(Ordering::SeqCst);
        let desired = state.playhead_frame() + state.format.seconds_to_frames(seconds);
        self.seek_to_frame(desired.clamp(0, (total - 1).max(0)))
    }

    // ========================================
    // Device and stream binding
    // ========================================

    /// Name of the bound output device
    pub fn output_device_name(&self) -> Result<String> {
        Ok(self.core.device_ref()?.name())
    }

    /// Rebind output to a different device, preserving the playing state
    pub fn set_output_device(&self, device: Arc<dyn OutputDevice>) -> Result<()> {
        let was_playing = self.is_playing();

        PlayerCore::close_output(&self.core)?;
        *self.core.device.write().unwrap() = Some(device);
        PlayerCore::open_output(&self.core)?;

        if was_playing {
            self.core.device_ref()?.start()?;
        }
        Ok(())
    }

    /// Select a specific output stream and follow its virtual format
    pub fn set_output_stream(&self, stream: Arc<dyn OutputStream>) -> Result<()> {
        PlayerCore::select_stream(&self.core, stream)?;

        let shared = &self.core.shared;
        shared.set_flag(FLAG_VIRTUAL_FORMAT_CHANGED);
        let result = PlayerCore::rebuild_converter(&self.core);
        shared.clear_flag(FLAG_VIRTUAL_FORMAT_CHANGED);
        result
    }

    pub fn output_device_sample_rate(&self) -> Result<f64> {
        self.core.device_ref()?.nominal_sample_rate()
    }

    pub fn set_output_device_sample_rate(&self, rate: f64) -> Result<()> {
        self.core.device_ref()?.set_nominal_sample_rate(rate)
    }

    pub fn master_volume(&self) -> Result<f32> {
        self.core.device_ref()?.volume(0)
    }

    pub fn set_master_volume(&self, volume: f32) -> Result<()> {
        self.core.device_ref()?.set_volume(0, volume)
    }

    pub fn volume_for_channel(&self, channel: u32) -> Result<f32> {
        self.core.device_ref()?.volume(channel)
    }

    pub fn set_volume_for_channel(&self, channel: u32, volume: f32) -> Result<()> {
        self.core.device_ref()?.set_volume(channel, volume)
    }

    // ========================================
    // Hog mode
    // ========================================

    /// Whether this process holds exclusive access to the device
    pub fn device_is_hogged(&self) -> Result<bool> {
        Ok(self.core.device_ref()?.hog_pid()? == Some(std::process::id()))
    }

    /// Acquire exclusive device access
    ///
    /// IO is paused around the acquisition because the platform does not
    /// restart it automatically, then restored.
    pub fn hog_device(&self) -> Result<()> {
        let device = self.core.device_ref()?;
        if let Some(pid) = device.hog_pid()? {
            debug!("Device already hogged by pid {}", pid);
            return Ok(());
        }

        let was_playing = self.is_playing();
        if was_playing {
            self.pause()?;
        }
        device.set_hog_pid(Some(std::process::id()))?;
        if was_playing {
            self.play()?;
        }
        Ok(())
    }

    /// Release exclusive device access held by this process
    pub fn release_hog(&self) -> Result<()> {
        let device = self.core.device_ref()?;
        if device.hog_pid()? != Some(std::process::id()) {
            return Err(Error::DeviceConfiguration(
                "device is not hogged by this process".to_string(),
            ));
        }

        let was_playing = self.is_playing();
        if was_playing {
            self.pause()?;
        }
        device.set_hog_pid(None)?;
        if was_playing {
            self.play()?;
        }
        Ok(())
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        if let Err(e) = PlayerCore::close_output(&self.core) {
            warn!("Closing output during shutdown failed: {}", e);
        }

        let shared = &self.core.shared;
        shared.active.cancel_all();
        shared.keep_decoding.store(false, Ordering::SeqCst);
        shared.keep_collecting.store(false, Ordering::SeqCst);

        // Twice each: one permit may be consumed by an inner wait before
        // the liveness flag is rechecked.
        shared.decoder_sem.signal();
        shared.decoder_sem.signal();
        shared.collector_sem.signal();
        shared.collector_sem.signal();

        if let Some(handle) = self.core.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.core.collector.lock().unwrap().take() {
            let _ = handle.join();
        }

        self.core.shared.queue.lock().unwrap().clear();
        debug!("Player shut down");
    }
}

impl PlayerCore {
    fn device_ref(&self) -> Result<Arc<dyn OutputDevice>> {
        self.device
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::InvalidDeviceOrStream("no output device bound".to_string()))
    }

    fn stream_ref(&self) -> Result<Arc<dyn OutputStream>> {
        self.stream
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::InvalidDeviceOrStream("no output stream bound".to_string()))
    }

    /// Open the bound device: attach the render sink, register property
    /// listeners, and select the first output stream
    fn open_output(core: &Arc<PlayerCore>) -> Result<()> {
        let device = core.device_ref()?;
        let sink: Arc<dyn RenderSink> = Arc::clone(&core.renderer) as Arc<dyn RenderSink>;
        device.open(sink)?;

        let listener: Weak<dyn DevicePropertyListener> = core.self_weak.clone();
        *core.device_listener.lock().unwrap() = Some(device.add_listener(listener));

        let first = device
            .streams()?
            .into_iter()
            .next()
            .ok_or_else(|| {
                Error::InvalidDeviceOrStream("device has no output streams".to_string())
            })?;
        Self::select_stream(core, first)?;

        info!("Output open on {}", device.name());
        core.shared
            .events
            .emit(EngineEvent::DeviceChanged { name: device.name() });
        Ok(())
    }

    /// Detach listeners and release the device binding
    fn close_output(core: &Arc<PlayerCore>) -> Result<()> {
        let old_stream = core.stream.write().unwrap().take();
        if let Some(stream) = old_stream {
            if let Some(id) = core.stream_listener.lock().unwrap().take() {
                stream.remove_listener(id);
            }
        }

        let device = core.device.read().unwrap().clone();
        if let Some(device) = device {
            if let Some(id) = core.device_listener.lock().unwrap().take() {
                device.remove_listener(id);
            }
            device.close()?;
        }
        Ok(())
    }

    /// Bind `stream`, cache its virtual format, and subscribe to its
    /// format-change notifications
    fn select_stream(core: &Arc<PlayerCore>, stream: Arc<dyn OutputStream>) -> Result<()> {
        let old_stream = core.stream.write().unwrap().take();
        if let Some(old) = old_stream {
            if let Some(id) = core.stream_listener.lock().unwrap().take() {
                old.remove_listener(id);
            }
        }

        let virtual_format = stream.virtual_format()?;
        *core.stream_virtual_format.write().unwrap() = Some(virtual_format);

        let listener: Weak<dyn StreamPropertyListener> = core.self_weak.clone();
        *core.stream_listener.lock().unwrap() = Some(stream.add_listener(listener));
        *core.stream.write().unwrap() = Some(stream);

        debug!("Selected output stream, virtual format {}", virtual_format);
        Ok(())
    }

    /// Frames per render pass, used to dimension conversion buffers
    fn render_frames_hint(&self) -> usize {
        self.device_ref()
            .and_then(|device| device.buffer_frame_size())
            .unwrap_or(DEFAULT_RENDER_FRAMES)
    }

    /// Adopt `format` for the ring buffer and build the render link
    ///
    /// Only called while the engine is idle, so the render path cannot be
    /// mid-pull on the structures being replaced.
    fn adopt_format(core: &Arc<PlayerCore>, format: &PcmFormat) -> Result<()> {
        let virtual_format = core
            .stream_virtual_format
            .read()
            .unwrap()
            .ok_or_else(|| Error::InvalidDeviceOrStream("no output stream bound".to_string()))?;

        let converter = PcmConverter::new(format, &virtual_format, core.render_frames_hint())?;
        let ring = Arc::new(PcmRingBuffer::new(
            format.channels,
            core.shared.config.ring_capacity_frames,
            Arc::clone(&core.shared.counters),
        ));

        *core.ring_format.write().unwrap() = Some(*format);
        *core.shared.ring.write().unwrap() = Some(Arc::clone(&ring));
        *core.shared.render_link.lock().unwrap() = Some(RenderLink { ring, converter });

        info!("Adopted ring buffer format: {}", format);
        Ok(())
    }

    /// Rebuild the converter for the current ring and virtual formats
    ///
    /// Callers silence the render path first (format-changed flag or stopped
    /// output).
    fn rebuild_converter(core: &Arc<PlayerCore>) -> Result<()> {
        let Some(ring_format) = *core.ring_format.read().unwrap() else {
            return Ok(());
        };
        let Some(virtual_format) = *core.stream_virtual_format.read().unwrap() else {
            return Ok(());
        };

        let converter =
            PcmConverter::new(&ring_format, &virtual_format, core.render_frames_hint())?;
        if let Some(link) = core.shared.render_link.lock().unwrap().as_mut() {
            link.converter = converter;
        }
        debug!("Converter rebuilt for virtual format {}", virtual_format);
        Ok(())
    }

    /// Stream list changed; re-select the first stream as on open
    fn rebind_first_stream(core: &Arc<PlayerCore>) -> Result<()> {
        let device = core.device_ref()?;
        let first = device
            .streams()?
            .into_iter()
            .next()
            .ok_or_else(|| {
                Error::InvalidDeviceOrStream("device has no output streams".to_string())
            })?;
        Self::select_stream(core, first)
    }

    /// The stream's virtual format changed out from under us
    ///
    /// Rendering is fenced off by the format-changed flag while the cached
    /// format and the converter are replaced, then output resumes if the
    /// controller was playing.
    fn handle_virtual_format_change(core: &Arc<PlayerCore>) {
        let Ok(device) = core.device_ref() else {
            return;
        };
        let Ok(stream) = core.stream_ref() else {
            return;
        };

        if let Err(e) = device.stop() {
            warn!("Stopping output for format change failed: {}", e);
        }

        core.shared.set_flag(FLAG_VIRTUAL_FORMAT_CHANGED);

        match stream.virtual_format() {
            Ok(virtual_format) => {
                *core.stream_virtual_format.write().unwrap() = Some(virtual_format);
                if let Err(e) = Self::rebuild_converter(core) {
                    error!("Converter rebuild after format change failed: {}", e);
                }
                core.shared.events.emit(EngineEvent::StreamFormatChanged {
                    format: virtual_format,
                });
            }
            Err(e) => error!("Reading new virtual format failed: {}", e),
        }

        core.shared.clear_flag(FLAG_VIRTUAL_FORMAT_CHANGED);

        if core.shared.is_playing.load(Ordering::SeqCst) {
            if let Err(e) = device.start() {
                error!("Restarting output after format change failed: {}", e);
            }
        }
    }
}

impl DevicePropertyListener for PlayerCore {
    fn device_property_changed(&self, property: DeviceProperty) {
        match property {
            DeviceProperty::IsRunning => {
                debug!("Device running state changed");
            }
            DeviceProperty::NominalSampleRate => {
                debug!("Device nominal sample rate changed");
            }
            DeviceProperty::ProcessorOverload => {
                warn!("Processor overload: render deadline missed");
            }
            DeviceProperty::Streams => {
                let Some(core) = self.self_weak.upgrade() else {
                    return;
                };
                if let Err(e) = PlayerCore::rebind_first_stream(&core) {
                    error!("Unable to re-select output stream: {}", e);
                }
            }
        }
    }
}

impl StreamPropertyListener for PlayerCore {
    fn stream_property_changed(&self, property: StreamProperty) {
        match property {
            StreamProperty::VirtualFormat => {
                let Some(core) = self.self_weak.upgrade() else {
                    return;
                };
                PlayerCore::handle_virtual_format_change(&core);
            }
            StreamProperty::PhysicalFormat => {
                debug!("Stream physical format changed");
            }
        }
    }
}
