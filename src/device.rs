//! Device handle and the backend boundary.
//!
//! The core never performs transport I/O itself. A [`DeviceBackend`]
//! advertises capabilities and hands out per-instrument endpoints:
//!
//! - [`SampleSource`] - raw production counter plus indexed reads (inputs)
//! - [`GeneratorSink`] - elapsed clock plus data writes (outputs)
//! - [`GpioPort`], [`UartPort`], [`SpiPort`], [`I2cPort`], [`CanPort`] -
//!   bit-level bus endpoints
//!
//! [`Device`] wraps a backend together with the state shared by everything
//! on that device: the capability set, the pin registry and the trigger bus.
//! Cloning is cheap; all clones refer to the same device.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::capabilities::DeviceCapabilities;
use crate::error::Result;
use crate::gpio::{Gpio, GpioPort};
use crate::instrument::analog_in::AnalogIn;
use crate::instrument::analog_out::AnalogOut;
use crate::instrument::digital_in::DigitalIn;
use crate::instrument::digital_out::DigitalOut;
use crate::pins::PinRegistry;
use crate::protocol::can::{Can, CanPort};
use crate::protocol::i2c::{I2c, I2cPort};
use crate::protocol::spi::{Spi, SpiPort};
use crate::protocol::uart::{Uart, UartPort};
use crate::trigger::{TriggerBus, TriggerSource};

/// Acquisition parameters handed to a [`SampleSource`] on start.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionPlan {
    /// Hardware sample rate in Hz
    pub rate_hz: f64,
    /// Enable flag per physical channel
    pub channels: Vec<bool>,
    /// Hardware buffer depth in samples
    pub capacity: u64,
}

/// Input endpoint: a free-running sample producer with a bounded buffer.
pub trait SampleSource<S>: Send {
    /// Start producing samples from index 0.
    fn start(&mut self, plan: &AcquisitionPlan) -> Result<()>;

    /// Stop producing; the counter keeps its value.
    fn stop(&mut self) -> Result<()>;

    /// Total samples produced since start.
    fn produced(&mut self) -> Result<u64>;

    /// Append samples `first..first + count` of every physical channel to `out`.
    fn read(&mut self, first: u64, count: usize, out: &mut [Vec<S>]) -> Result<()>;
}

/// Generation parameters handed to a [`GeneratorSink`] on start.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationPlan {
    /// Output sample (or pattern clock) rate in Hz
    pub rate_hz: f64,
    /// Enable flag per physical channel
    pub channels: Vec<bool>,
}

/// Output endpoint: a running clock plus uploaded data.
pub trait GeneratorSink<S>: Send {
    /// Start the output clock.
    fn start(&mut self, plan: &GenerationPlan) -> Result<()>;

    /// Stop the output clock.
    fn stop(&mut self) -> Result<()>;

    /// Device time since start.
    fn elapsed(&mut self) -> Result<Duration>;

    /// Upload data for one channel (custom waveforms, play data, patterns).
    fn write(&mut self, channel: usize, data: &[S]) -> Result<()>;
}

/// Hardware abstraction a device implementation provides.
pub trait DeviceBackend: Send + Sync {
    /// Everything the device advertises.
    fn capabilities(&self) -> DeviceCapabilities;

    /// Oscilloscope sample source.
    fn open_analog_in(&self) -> Result<Box<dyn SampleSource<f64>>>;

    /// Logic analyzer sample source (one word per sample).
    fn open_digital_in(&self) -> Result<Box<dyn SampleSource<u32>>>;

    /// Waveform generator sink.
    fn open_analog_out(&self) -> Result<Box<dyn GeneratorSink<f64>>>;

    /// Pattern generator sink (custom bit streams per pin).
    fn open_digital_out(&self) -> Result<Box<dyn GeneratorSink<bool>>>;

    /// Static digital I/O.
    fn open_gpio(&self) -> Result<Box<dyn GpioPort>>;

    /// UART endpoint.
    fn open_uart(&self) -> Result<Box<dyn UartPort>>;

    /// SPI endpoint.
    fn open_spi(&self) -> Result<Box<dyn SpiPort>>;

    /// I2C endpoint.
    fn open_i2c(&self) -> Result<Box<dyn I2cPort>>;

    /// CAN endpoint.
    fn open_can(&self) -> Result<Box<dyn CanPort>>;
}

struct DeviceInner {
    backend: Arc<dyn DeviceBackend>,
    caps: Arc<DeviceCapabilities>,
    pins: PinRegistry,
    triggers: TriggerBus,
}

/// Shared handle to an attached device.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.inner.caps.name)
            .field("pins", &self.inner.pins)
            .finish()
    }
}

impl Device {
    /// Wrap a backend.
    pub fn new(backend: impl DeviceBackend + 'static) -> Self {
        Self::from_arc(Arc::new(backend))
    }

    /// Wrap a shared backend.
    pub fn from_arc(backend: Arc<dyn DeviceBackend>) -> Self {
        let caps = Arc::new(backend.capabilities());
        info!(
            name = %caps.name,
            digital_pins = caps.digital_pins,
            scope_channels = caps.analog_in.channels,
            generator_channels = caps.analog_out.channels,
            "Device attached"
        );
        let pins = PinRegistry::new(caps.digital_pins);
        Self {
            inner: Arc::new(DeviceInner {
                backend,
                caps,
                pins,
                triggers: TriggerBus::new(),
            }),
        }
    }

    /// Capability set shared by every instrument on this device.
    pub fn capabilities(&self) -> &Arc<DeviceCapabilities> {
        &self.inner.caps
    }

    /// Pin ownership table.
    pub fn pins(&self) -> &PinRegistry {
        &self.inner.pins
    }

    /// Trigger distribution bus.
    pub fn triggers(&self) -> &TriggerBus {
        &self.inner.triggers
    }

    /// Issue a software (PC) trigger to every instrument listening for it.
    pub fn trigger_pc(&self) {
        self.inner.triggers.publish(TriggerSource::Pc);
    }

    pub(crate) fn backend(&self) -> &dyn DeviceBackend {
        self.inner.backend.as_ref()
    }

    /// Open the oscilloscope.
    pub fn analog_in(&self) -> Result<AnalogIn> {
        AnalogIn::open(self.clone())
    }

    /// Open the waveform generator.
    pub fn analog_out(&self) -> Result<AnalogOut> {
        AnalogOut::open(self.clone())
    }

    /// Open the logic analyzer.
    pub fn digital_in(&self) -> Result<DigitalIn> {
        DigitalIn::open(self.clone())
    }

    /// Open the pattern generator.
    pub fn digital_out(&self) -> Result<DigitalOut> {
        DigitalOut::open(self.clone())
    }

    /// Open the static I/O engine.
    pub fn gpio(&self) -> Result<Gpio> {
        Gpio::open(self.clone())
    }

    /// Open the UART engine.
    pub fn uart(&self) -> Result<Uart> {
        Uart::open(self.clone())
    }

    /// Open the SPI engine.
    pub fn spi(&self) -> Result<Spi> {
        Spi::open(self.clone())
    }

    /// Open the I2C engine.
    pub fn i2c(&self) -> Result<I2c> {
        I2c::open(self.clone())
    }

    /// Open the CAN engine.
    pub fn can(&self) -> Result<Can> {
        Can::open(self.clone())
    }
}
