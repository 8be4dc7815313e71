//! Output device backed by cpal
//!
//! Adapts a cpal output device to the [`OutputDevice`] interface. A cpal
//! stream must stay on the thread that built it, so a keeper thread owns
//! the stream and services start/stop/close commands over a channel.
//!
//! Limitations of the platform layer are surfaced as configuration errors:
//! cpal has no hog mode, no runtime sample-rate switching, and exactly one
//! logical stream per device. Volume is applied in software inside the
//! callback, the same way the render path would otherwise never see a
//! hardware volume.

use crate::audio::device::{
    DeviceProperty, DevicePropertyListener, ListenerId, OutputDevice, OutputStream, RenderOutcome,
    RenderSink, StreamProperty, StreamPropertyListener,
};
use crate::audio::format::PcmFormat;
use crate::error::{Error, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

enum Command {
    Start,
    Stop,
    Close,
}

struct Request {
    command: Command,
    reply: mpsc::Sender<std::result::Result<(), String>>,
}

type DeviceListeners = Arc<Mutex<Vec<(ListenerId, Weak<dyn DevicePropertyListener>)>>>;

/// The single logical output stream of a cpal device
pub struct CpalStream {
    virtual_format: PcmFormat,
    listeners: Mutex<Vec<(ListenerId, Weak<dyn StreamPropertyListener>)>>,
    next_id: AtomicU64,
}

impl OutputStream for CpalStream {
    fn virtual_format(&self) -> Result<PcmFormat> {
        Ok(self.virtual_format)
    }

    fn physical_format(&self) -> Result<PcmFormat> {
        // cpal hides the wire format; the virtual format is the best answer.
        Ok(self.virtual_format)
    }

    fn set_physical_format(&self, _format: &PcmFormat) -> Result<()> {
        Err(Error::DeviceConfiguration(
            "cpal streams cannot change physical format".to_string(),
        ))
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

/// cpal-backed output device
pub struct CpalOutput {
    device: cpal::Device,
    config: StreamConfig,
    sample_format: SampleFormat,
    name: String,
    stream: Arc<CpalStream>,

    commands: Mutex<Option<mpsc::Sender<Request>>>,
    keeper: Mutex<Option<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
    pending_stop: Arc<AtomicBool>,
    volume_bits: Arc<AtomicU32>,
    listeners: DeviceListeners,
    next_listener_id: AtomicU64,
}

impl CpalOutput {
    /// List available output device names
    pub fn list_device_names() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let names = host
            .output_devices()
            .map_err(|e| Error::InvalidDeviceOrStream(format!("enumerate devices: {}", e)))?
            .filter_map(|device| device.name().ok())
            .collect::<Vec<_>>();
        debug!("Found {} output devices", names.len());
        Ok(names)
    }

    /// Open the system default output device
    pub fn default_device() -> Result<Arc<Self>> {
        let host = cpal::default_host();
        let device = host.default_output_device().ok_or_else(|| {
            Error::InvalidDeviceOrStream("no default output device".to_string())
        })?;
        Self::from_device(device)
    }

    /// Open a device by name, falling back to the default
    pub fn named(name: &str) -> Result<Arc<Self>> {
        let host = cpal::default_host();
        let mut devices = host
            .output_devices()
            .map_err(|e| Error::InvalidDeviceOrStream(format!("enumerate devices: {}", e)))?;

        match devices.find(|d| d.name().ok().as_deref() == Some(name)) {
            Some(device) => Self::from_device(device),
            None => {
                warn!("Device '{}' not found, falling back to default", name);
                Self::default_device()
            }
        }
    }

    fn from_device(device: cpal::Device) -> Result<Arc<Self>> {
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        let (config, sample_format) = Self::best_config(&device)?;

        info!(
            "Using output device '{}': {} Hz, {} ch, {:?}",
            name, config.sample_rate.0, config.channels, sample_format
        );

        let virtual_format =
            PcmFormat::interleaved_f32(config.sample_rate.0, config.channels);

        Ok(Arc::new(Self {
            device,
            config,
            sample_format,
            name,
            stream: Arc::new(CpalStream {
                virtual_format,
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
            commands: Mutex::new(None),
            keeper: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            pending_stop: Arc::new(AtomicBool::new(false)),
            volume_bits: Arc::new(AtomicU32::new(1.0f32.to_bits())),
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_listener_id: AtomicU64::new(1),
        }))
    }

    /// Prefer an f32 stereo configuration, else take the device default
    fn best_config(device: &cpal::Device) -> Result<(StreamConfig, SampleFormat)> {
        let mut supported = device
            .supported_output_configs()
            .map_err(|e| Error::InvalidDeviceOrStream(format!("device configs: {}", e)))?;

        if let Some(preferred) = supported
            .find(|config| config.channels() == 2 && config.sample_format() == SampleFormat::F32)
        {
            let config = preferred.with_max_sample_rate();
            return Ok((config.config(), SampleFormat::F32));
        }

        let default = device
            .default_output_config()
            .map_err(|e| Error::InvalidDeviceOrStream(format!("default config: {}", e)))?;
        let sample_format = default.sample_format();
        Ok((default.config(), sample_format))
    }

    fn request(&self, command: Command) -> Result<()> {
        let sender = self
            .commands
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::InvalidDeviceOrStream("device is not open".to_string()))?;

        let (reply_tx, reply_rx) = mpsc::channel();
        sender
            .send(Request {
                command,
                reply: reply_tx,
            })
            .map_err(|_| Error::DeviceConfiguration("audio keeper thread gone".to_string()))?;

        reply_rx
            .recv()
            .map_err(|_| Error::DeviceConfiguration("audio keeper thread gone".to_string()))?
            .map_err(Error::DeviceConfiguration)
    }

    fn notify(&self, property: DeviceProperty) {
        notify_listeners(&self.listeners, property);
    }
}

fn notify_listeners(listeners: &DeviceListeners, property: DeviceProperty) {
    let listeners = listeners.lock().unwrap();
    for (_, listener) in listeners.iter() {
        if let Some(listener) = listener.upgrade() {
            listener.device_property_changed(property);
        }
    }
}

impl OutputDevice for CpalOutput {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn open(&self, sink: Arc<dyn RenderSink>) -> Result<()> {
        let mut commands = self.commands.lock().unwrap();
        if commands.is_some() {
            return Err(Error::InvalidDeviceOrStream(
                "device already open".to_string(),
            ));
        }

        let (tx, rx) = mpsc::channel::<Request>();
        let (ready_tx, ready_rx) = mpsc::channel::<std::result::Result<(), String>>();

        let device = self.device.clone();
        let config = self.config.clone();
        let sample_format = self.sample_format;
        let volume = Arc::clone(&self.volume_bits);
        let pending_stop = Arc::clone(&self.pending_stop);
        let running = Arc::clone(&self.running);
        let listeners = Arc::clone(&self.listeners);

        let handle = thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || {
                keeper_main(
                    device,
                    config,
                    sample_format,
                    sink,
                    volume,
                    pending_stop,
                    running,
                    listeners,
                    rx,
                    ready_tx,
                );
            })
            .map_err(|e| Error::ResourceAllocation(format!("audio keeper thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                *commands = Some(tx);
                *self.keeper.lock().unwrap() = Some(handle);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(Error::DeviceConfiguration(e))
            }
            Err(_) => {
                let _ = handle.join();
                Err(Error::DeviceConfiguration(
                    "audio keeper thread died during open".to_string(),
                ))
            }
        }
    }

    fn close(&self) -> Result<()> {
        let had_keeper = self.commands.lock().unwrap().is_some();
        if !had_keeper {
            return Ok(());
        }

        let result = self.request(Command::Close);
        *self.commands.lock().unwrap() = None;
        if let Some(handle) = self.keeper.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.running.store(false, Ordering::SeqCst);
        result
    }

    fn start(&self) -> Result<()> {
        self.request(Command::Start)?;
        self.running.store(true, Ordering::SeqCst);
        self.notify(DeviceProperty::IsRunning);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.request(Command::Stop)?;
        self.running.store(false, Ordering::SeqCst);
        self.notify(DeviceProperty::IsRunning);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn nominal_sample_rate(&self) -> Result<f64> {
        Ok(self.config.sample_rate.0 as f64)
    }

    fn set_nominal_sample_rate(&self, _rate: f64) -> Result<()> {
        Err(Error::DeviceConfiguration(
            "cpal devices cannot switch sample rates while open".to_string(),
        ))
    }

    fn buffer_frame_size(&self) -> Result<usize> {
        match self.config.buffer_size {
            cpal::BufferSize::Fixed(frames) => Ok(frames as usize),
            cpal::BufferSize::Default => {
                // cpal does not report the default; 512 is a typical value.
                Ok(512)
            }
        }
    }

    fn volume(&self, channel: u32) -> Result<f32> {
        if channel != 0 {
            return Err(Error::DeviceConfiguration(
                "only master volume is supported".to_string(),
            ));
        }
        Ok(f32::from_bits(self.volume_bits.load(Ordering::Relaxed)))
    }

    fn set_volume(&self, channel: u32, volume: f32) -> Result<()> {
        if channel != 0 {
            return Err(Error::DeviceConfiguration(
                "only master volume is supported".to_string(),
            ));
        }
        let clamped = volume.clamp(0.0, 1.0);
        self.volume_bits
            .store(clamped.to_bits(), Ordering::Relaxed);
        debug!("Volume set to {:.2}", clamped);
        Ok(())
    }

    fn hog_pid(&self) -> Result<Option<u32>> {
        Ok(None)
    }

    fn set_hog_pid(&self, _pid: Option<u32>) -> Result<()> {
        Err(Error::DeviceConfiguration(
            "cpal devices do not support exclusive access".to_string(),
        ))
    }

    fn streams(&self) -> Result<Vec<Arc<dyn OutputStream>>> {
        Ok(vec![Arc::clone(&self.stream) as Arc<dyn OutputStream>])
    }

    fn add_listener(&self, listener: Weak<dyn DevicePropertyListener>) -> ListenerId {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
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

#[allow(clippy::too_many_arguments)]
fn keeper_main(
    device: cpal::Device,
    config: StreamConfig,
    sample_format: SampleFormat,
    sink: Arc<dyn RenderSink>,
    volume: Arc<AtomicU32>,
    pending_stop: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    listeners: DeviceListeners,
    rx: mpsc::Receiver<Request>,
    ready_tx: mpsc::Sender<std::result::Result<(), String>>,
) {
    let stream = match build_stream(
        &device,
        &config,
        sample_format,
        sink,
        volume,
        Arc::clone(&pending_stop),
    ) {
        Ok(stream) => {
            let _ = ready_tx.send(Ok(()));
            stream
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e.to_string()));
            return;
        }
    };

    loop {
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(request) => match request.command {
                Command::Start => {
                    let _ = request.reply.send(stream.play().map_err(|e| e.to_string()));
                }
                Command::Stop => {
                    let _ = request.reply.send(stream.pause().map_err(|e| e.to_string()));
                }
                Command::Close => {
                    let _ = stream.pause();
                    let _ = request.reply.send(Ok(()));
                    break;
                }
            },
            Err(mpsc::RecvTimeoutError::Timeout) => {
                // The render sink asked for a stop from the realtime
                // context; carry it out here.
                if pending_stop.swap(false, Ordering::SeqCst) {
                    if let Err(e) = stream.pause() {
                        warn!("Deferred stop failed: {}", e);
                    }
                    running.store(false, Ordering::SeqCst);
                    notify_listeners(&listeners, DeviceProperty::IsRunning);
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    debug!("Audio keeper thread exiting");
}

fn build_stream(
    device: &cpal::Device,
    config: &StreamConfig,
    sample_format: SampleFormat,
    sink: Arc<dyn RenderSink>,
    volume: Arc<AtomicU32>,
    pending_stop: Arc<AtomicBool>,
) -> Result<Stream> {
    let channels = config.channels as usize;
    let err_fn = |e| error!("Audio stream error: {}", e);

    let stream = match sample_format {
        SampleFormat::F32 => device
            .build_output_stream(
                config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let frames = data.len() / channels;
                    if let RenderOutcome::StopOutput = sink.render(data, frames) {
                        pending_stop.store(true, Ordering::SeqCst);
                    }
                    let gain = f32::from_bits(volume.load(Ordering::Relaxed));
                    for sample in data.iter_mut() {
                        *sample = (*sample * gain).clamp(-1.0, 1.0);
                    }
                },
                err_fn,
                None,
            )
            .map_err(|e| Error::DeviceConfiguration(format!("build stream: {}", e)))?,
        SampleFormat::I16 => {
            let mut scratch = vec![0.0f32; 8192];
            device
                .build_output_stream(
                    config,
                    move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                        if scratch.len() < data.len() {
                            scratch.resize(data.len(), 0.0);
                        }
                        let buf = &mut scratch[..data.len()];
                        let frames = data.len() / channels;
                        if let RenderOutcome::StopOutput = sink.render(buf, frames) {
                            pending_stop.store(true, Ordering::SeqCst);
                        }
                        let gain = f32::from_bits(volume.load(Ordering::Relaxed));
                        for (out, sample) in data.iter_mut().zip(buf.iter()) {
                            let scaled = (sample * gain).clamp(-1.0, 1.0);
                            *out = (scaled * i16::MAX as f32) as i16;
                        }
                    },
                    err_fn,
                    None,
                )
                .map_err(|e| Error::DeviceConfiguration(format!("build stream: {}", e)))?
        }
        other => {
            return Err(Error::DeviceConfiguration(format!(
                "unsupported sample format: {:?}",
                other
            )));
        }
    };

    Ok(stream)
}
