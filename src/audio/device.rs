//! Output device collaborator interface
//!
//! The platform audio subsystem owns the output device. It periodically
//! invokes the registered render sink from its realtime context, exposes
//! device and stream properties, and notifies listeners when properties
//! change from outside (a user switching sample rates, a stream being
//! reconfigured).
//!
//! Listener registrations hold `Weak` references so a device never keeps its
//! controller alive.

use crate::audio::format::PcmFormat;
use crate::error::Result;
use std::sync::{Arc, Weak};

/// Handle for removing a property listener
pub type ListenerId = u64;

/// Observable device properties
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceProperty {
    /// IO started or stopped
    IsRunning,
    /// Nominal sample rate changed
    NominalSampleRate,
    /// Stream list changed; the first stream should be re-selected
    Streams,
    /// The realtime callback missed its deadline
    ProcessorOverload,
}

/// Observable stream properties
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamProperty {
    /// The format the device expects from the render sink
    VirtualFormat,
    /// The format on the wire to the hardware
    PhysicalFormat,
}

/// Device property change notifications
///
/// Invoked from a property-listener thread, never from the realtime context.
pub trait DevicePropertyListener: Send + Sync {
    fn device_property_changed(&self, property: DeviceProperty);
}

/// Stream property change notifications
pub trait StreamPropertyListener: Send + Sync {
    fn stream_property_changed(&self, property: StreamProperty);
}

/// Result of one render pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderOutcome {
    /// Frames were produced into the output buffer
    Rendered(usize),
    /// The buffer was left silent; keep calling
    Silence,
    /// The buffer was left silent and the device should stop IO
    StopOutput,
}

/// The realtime render callback
///
/// Invoked from the device's realtime context with an interleaved output
/// buffer in the stream's virtual format. Implementations must not
/// allocate, block, or take locks.
pub trait RenderSink: Send + Sync {
    fn render(&self, output: &mut [f32], frames: usize) -> RenderOutcome;
}

/// One output stream of a device
pub trait OutputStream: Send + Sync {
    /// The format the render sink must produce
    fn virtual_format(&self) -> Result<PcmFormat>;

    /// The hardware-side format
    fn physical_format(&self) -> Result<PcmFormat>;

    /// Request a hardware-side format change
    fn set_physical_format(&self, format: &PcmFormat) -> Result<()>;

    fn add_listener(&self, listener: Weak<dyn StreamPropertyListener>) -> ListenerId;
    fn remove_listener(&self, id: ListenerId);
}

/// An output device
pub trait OutputDevice: Send + Sync {
    /// Human-readable device name
    fn name(&self) -> String;

    /// Bind a render sink and prepare IO
    ///
    /// The sink stays registered until `close`. IO does not start until
    /// `start` is called.
    fn open(&self, sink: Arc<dyn RenderSink>) -> Result<()>;

    /// Release the render binding and stop IO
    fn close(&self) -> Result<()>;

    /// Start periodic render callbacks
    fn start(&self) -> Result<()>;

    /// Stop periodic render callbacks
    fn stop(&self) -> Result<()>;

    /// Whether IO is currently running
    fn is_running(&self) -> bool;

    fn nominal_sample_rate(&self) -> Result<f64>;
    fn set_nominal_sample_rate(&self, rate: f64) -> Result<()>;

    /// Frames per render callback
    fn buffer_frame_size(&self) -> Result<usize>;

    /// Volume scalar for one channel, 0 = master
    fn volume(&self, channel: u32) -> Result<f32>;
    fn set_volume(&self, channel: u32, volume: f32) -> Result<()>;

    /// Process id holding exclusive access, if any
    fn hog_pid(&self) -> Result<Option<u32>>;

    /// Acquire (`Some(pid)`) or release (`None`) exclusive access
    fn set_hog_pid(&self, pid: Option<u32>) -> Result<()>;

    /// Output streams, first is the default selection
    fn streams(&self) -> Result<Vec<Arc<dyn OutputStream>>>;

    fn add_listener(&self, listener: Weak<dyn DevicePropertyListener>) -> ListenerId;
    fn remove_listener(&self, id: ListenerId);
}
