//! Control and data-streaming core for mixed-signal instruments.
//!
//! This crate drives the analog and digital input/output instruments of an
//! attached device, arbitrates triggering between them, streams sampled data
//! through a bounded host-side buffer, and multiplexes UART, SPI, I2C and CAN
//! over a shared pool of digital pins.
//!
//! # Architecture
//!
//! ## Device Access
//! - [`Device`] - Shared handle over a [`DeviceBackend`], owning the
//!   capability set, the pin registry and the trigger bus
//! - [`DeviceCapabilities`] - Advertised ranges and bitflag sets
//!
//! ## Instruments
//! - [`AnalogIn`] / [`DigitalIn`] - Triggered capture into a ring buffer
//! - [`AnalogOut`] / [`DigitalOut`] - Wait/run/repeat generators
//! - [`Instrument`] - Common state machine (`configure`, `poll`,
//!   `force_trigger`, `stop`, `reset`)
//!
//! ## Bus Engines
//! - [`Uart`], [`Spi`], [`I2c`], [`Can`] - Synchronous request/response
//!   engines over claimed pins
//! - [`Gpio`] - Static digital I/O
//!
//! ## Simulation
//! - [`sim::SimDevice`] - Deterministic backend with a manual clock
//!
//! # Example
//!
//! ```no_run
//! use mixsig_daq::instrument::{AcquisitionMode, ChannelSelector, Instrument, InstrumentState};
//! use mixsig_daq::sim::{Signal, SimDevice};
//! use mixsig_daq::Device;
//! use std::time::Duration;
//!
//! # fn example() -> mixsig_daq::Result<()> {
//! let (backend, handle) = SimDevice::new();
//! handle.set_analog_signal(0, Signal::sine(1.0, 1_000.0));
//! let device = Device::new(backend);
//!
//! let mut scope = device.analog_in()?;
//! scope.set_mode(AcquisitionMode::Single)?;
//! scope.set_channel_enable(ChannelSelector::Index(0), true)?;
//! scope.set_sample_rate(1_000_000.0)?;
//! scope.set_buffer_size(1_000)?;
//! scope.configure(false, true)?;
//!
//! while scope.poll(true)? != InstrumentState::Done {
//!     handle.advance(Duration::from_micros(100));
//! }
//! let data = scope.read_samples(0, 0, 1_000)?;
//! println!("{} samples", data.samples.len());
//! # Ok(())
//! # }
//! ```

pub mod capabilities;
pub mod capture;
pub mod config;
pub mod device;
pub mod error;
pub mod generator;
pub mod gpio;
pub mod instrument;
pub mod logging;
pub mod pins;
pub mod protocol;
pub mod record;
pub mod sim;
pub mod trigger;
pub mod watch;
pub mod waveform;

pub use capabilities::DeviceCapabilities;
pub use device::{Device, DeviceBackend, GeneratorSink, SampleSource};
pub use error::{DaqError, ErrorKind, Result};
pub use gpio::Gpio;
pub use instrument::analog_in::AnalogIn;
pub use instrument::analog_out::AnalogOut;
pub use instrument::digital_in::DigitalIn;
pub use instrument::digital_out::DigitalOut;
pub use instrument::{Instrument, InstrumentKind, InstrumentState, SharedInstrument};
pub use pins::{EngineId, PinRegistry, PinRole};
pub use protocol::can::Can;
pub use protocol::i2c::I2c;
pub use protocol::spi::Spi;
pub use protocol::uart::Uart;
pub use record::RecordStatus;
pub use trigger::{TriggerSource, TriggerSpec};
