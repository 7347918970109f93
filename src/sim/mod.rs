//! Simulated device backend.
//!
//! [`SimDevice`] implements [`DeviceBackend`] over a manual clock: nothing
//! happens until the paired [`SimHandle`] advances time. Inputs then report
//! `floor(elapsed * rate)` produced samples computed from deterministic
//! [`Signal`]s, outputs report elapsed device time, and the bus endpoints
//! behave as loopbacks or simple slaves that tests can inspect and disturb.
//!
//! ```no_run
//! use std::time::Duration;
//! use mixsig_daq::sim::{Signal, SimDevice};
//! use mixsig_daq::Device;
//!
//! let (backend, handle) = SimDevice::new();
//! handle.set_analog_signal(0, Signal::sine(1.0, 1_000.0));
//! let device = Device::new(backend);
//! handle.advance(Duration::from_millis(1));
//! # let _ = device;
//! ```

mod bus;
mod signal;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

use crate::capabilities::DeviceCapabilities;
use crate::device::{
    AcquisitionPlan, DeviceBackend, GenerationPlan, GeneratorSink, SampleSource,
};
use crate::error::{DaqError, Result};
use crate::gpio::GpioPort;
use crate::instrument::InstrumentKind;
use crate::protocol::can::CanPort;
use crate::protocol::i2c::I2cPort;
use crate::protocol::spi::{ChipSelect, SpiFrame, SpiPort};
use crate::protocol::uart::UartPort;

pub use bus::I2cSlave;
pub use signal::{DigitalSignal, Signal};

use bus::{CanState, GpioState, I2cState, SimCan, SimGpio, SimI2c, SimSpi, SimUart, SpiState, UartState};

/// Production clock of one input stream.
#[derive(Debug, Default)]
struct StreamClock {
    rate_hz: f64,
    started_ns: Option<u64>,
    stopped_ns: Option<u64>,
    /// Samples produced beyond the clock (transfer overrun injection)
    extra: u64,
    /// Overrun added on the next read
    overrun_on_read: u64,
}

impl StreamClock {
    fn is_running(&self) -> bool {
        self.started_ns.is_some() && self.stopped_ns.is_none()
    }

    fn start(&mut self, now: u64, plan: &AcquisitionPlan) {
        self.rate_hz = plan.rate_hz;
        self.started_ns = Some(now);
        self.stopped_ns = None;
        self.extra = 0;
    }

    fn stop(&mut self, now: u64) {
        if self.started_ns.is_some() && self.stopped_ns.is_none() {
            self.stopped_ns = Some(now);
        }
    }

    fn produced(&self, now: u64) -> u64 {
        let Some(start) = self.started_ns else {
            return 0;
        };
        let end = self.stopped_ns.unwrap_or(now);
        let elapsed = end.saturating_sub(start) as f64 * 1e-9;
        // small bias absorbs float error at exact sample boundaries
        (elapsed * self.rate_hz + 1e-6).floor() as u64 + self.extra
    }
}

/// Running clock of one output.
#[derive(Debug, Default)]
struct OutputClock {
    started_ns: Option<u64>,
    stopped_ns: Option<u64>,
}

impl OutputClock {
    fn is_running(&self) -> bool {
        self.started_ns.is_some() && self.stopped_ns.is_none()
    }

    fn elapsed(&self, now: u64) -> Duration {
        match self.started_ns {
            Some(start) => Duration::from_nanos(self.stopped_ns.unwrap_or(now).saturating_sub(start)),
            None => Duration::ZERO,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct SimState {
    now_ns: u64,
    analog: Vec<Signal>,
    digital: DigitalSignal,
    analog_in: StreamClock,
    digital_in: StreamClock,
    analog_out: OutputClock,
    digital_out: OutputClock,
    analog_out_data: Vec<Vec<f64>>,
    digital_out_data: Vec<Vec<bool>>,
    fail_next: Option<String>,
    gpio: GpioState,
    uart: UartState,
    spi: SpiState,
    i2c: I2cState,
    can: CanState,
}

impl SimState {
    fn take_failure(&mut self) -> Result<()> {
        match self.fail_next.take() {
            Some(message) => Err(DaqError::device(message)),
            None => Ok(()),
        }
    }
}

/// Simulated device backend.
pub struct SimDevice {
    caps: DeviceCapabilities,
    state: Arc<Mutex<SimState>>,
}

/// Test-side control of a [`SimDevice`].
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimDevice {
    /// Simulated device with the default capability profile.
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (Self, SimHandle) {
        Self::with_capabilities(DeviceCapabilities::default())
    }

    /// Simulated device with the given capability set, plus its control handle.
    pub fn with_capabilities(caps: DeviceCapabilities) -> (Self, SimHandle) {
        let state = SimState {
            analog: vec![Signal::default(); caps.analog_in.channels],
            analog_out_data: vec![Vec::new(); caps.analog_out.channels],
            digital_out_data: vec![Vec::new(); caps.digital_out.pins],
            ..Default::default()
        };
        let state = Arc::new(Mutex::new(state));
        (
            Self {
                caps,
                state: state.clone(),
            },
            SimHandle { state },
        )
    }
}

impl SimHandle {
    /// Advance the device clock.
    pub fn advance(&self, by: Duration) {
        let mut state = self.state.lock();
        state.now_ns = state
            .now_ns
            .saturating_add(u64::try_from(by.as_nanos()).unwrap_or(u64::MAX));
        trace!(now_ns = state.now_ns, "Simulated clock advanced");
    }

    /// Device time since creation.
    pub fn now(&self) -> Duration {
        Duration::from_nanos(self.state.lock().now_ns)
    }

    /// Drive an analog input channel.
    pub fn set_analog_signal(&self, channel: usize, signal: Signal) {
        let mut state = self.state.lock();
        if let Some(slot) = state.analog.get_mut(channel) {
            *slot = signal;
        }
    }

    /// Drive the digital inputs.
    pub fn set_digital_signal(&self, signal: DigitalSignal) {
        self.state.lock().digital = signal;
    }

    /// Make the next analog-input read see `samples` more produced samples,
    /// as if the hardware overwrote data during the transfer.
    pub fn inject_analog_overrun(&self, samples: u64) {
        self.state.lock().analog_in.overrun_on_read += samples;
    }

    /// Logic analyzer counterpart of [`Self::inject_analog_overrun`].
    pub fn inject_digital_overrun(&self, samples: u64) {
        self.state.lock().digital_in.overrun_on_read += samples;
    }

    /// Fail the next backend call with a device error.
    pub fn fail_next(&self, message: &str) {
        self.state.lock().fail_next = Some(message.to_string());
    }

    /// Whether the instrument's endpoint was started and not stopped since.
    pub fn is_streaming(&self, kind: InstrumentKind) -> bool {
        let state = self.state.lock();
        match kind {
            InstrumentKind::AnalogIn => state.analog_in.is_running(),
            InstrumentKind::DigitalIn => state.digital_in.is_running(),
            InstrumentKind::AnalogOut => state.analog_out.is_running(),
            InstrumentKind::DigitalOut => state.digital_out.is_running(),
        }
    }

    /// Data uploaded to an analog output channel.
    pub fn analog_out_data(&self, channel: usize) -> Vec<f64> {
        self.state
            .lock()
            .analog_out_data
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }

    /// Bits uploaded to a digital output pin.
    pub fn digital_out_data(&self, pin: usize) -> Vec<bool> {
        self.state
            .lock()
            .digital_out_data
            .get(pin)
            .cloned()
            .unwrap_or_default()
    }

    /// Drive undriven GPIO pins from outside.
    pub fn set_gpio_external(&self, levels: u32) {
        self.state.lock().gpio.external = levels;
    }

    /// GPIO output enable and level registers.
    pub fn gpio_outputs(&self) -> (u32, u32) {
        let state = self.state.lock();
        (state.gpio.enable, state.gpio.output)
    }

    /// Echo TX frames back to RX.
    pub fn set_uart_loopback(&self, enabled: bool) {
        self.state.lock().uart.loopback = enabled;
    }

    /// Queue raw line frames on UART RX.
    pub fn push_uart_rx(&self, frames: Vec<Vec<bool>>) {
        self.state.lock().uart.rx.extend(frames);
    }

    /// Frames written on TX so far.
    pub fn uart_tx_log(&self) -> Vec<Vec<bool>> {
        self.state.lock().uart.tx_log.clone()
    }

    /// Words the SPI slave answers with, before echoing again.
    pub fn queue_spi_response(&self, words: &[u32]) {
        self.state.lock().spi.responses.extend(words.iter().copied());
    }

    /// Every SPI frame clocked so far.
    pub fn spi_log(&self) -> Vec<SpiFrame> {
        self.state.lock().spi.log.clone()
    }

    /// Last chip select level driven.
    pub fn spi_chip_select(&self) -> Option<ChipSelect> {
        self.state.lock().spi.chip_select
    }

    /// Attach a slave to the I2C bus.
    pub fn add_i2c_slave(&self, slave: I2cSlave) {
        self.state.lock().i2c.slaves.push(slave);
    }

    /// Register file of the slave at `address`.
    pub fn i2c_memory(&self, address: u8) -> Option<Vec<u8>> {
        self.state
            .lock()
            .i2c
            .slaves
            .iter()
            .find(|s| s.address == address)
            .map(|s| s.memory.clone())
    }

    /// Whether the I2C bus is between START and STOP.
    pub fn i2c_bus_held(&self) -> bool {
        self.state.lock().i2c.is_held()
    }

    /// Whether another node acknowledges CAN frames.
    pub fn set_can_ack(&self, acked: bool) {
        self.state.lock().can.acked = acked;
    }

    /// Echo transmitted CAN frames back to RX.
    pub fn set_can_loopback(&self, enabled: bool) {
        self.state.lock().can.loopback = enabled;
    }

    /// Flip one line bit of the next looped-back CAN frame.
    pub fn flip_next_can_bit(&self, index: usize) {
        self.state.lock().can.flip_next = Some(index);
    }

    /// Queue raw line bits on CAN RX.
    pub fn push_can_rx(&self, bits: Vec<bool>) {
        self.state.lock().can.rx.push_back(bits);
    }

    /// Bit streams transmitted on CAN so far.
    pub fn can_tx_log(&self) -> Vec<Vec<bool>> {
        self.state.lock().can.tx_log.clone()
    }
}

struct SimAnalogIn(Arc<Mutex<SimState>>);

impl SampleSource<f64> for SimAnalogIn {
    fn start(&mut self, plan: &AcquisitionPlan) -> Result<()> {
        let mut state = self.0.lock();
        state.take_failure()?;
        let now = state.now_ns;
        state.analog_in.start(now, plan);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let mut state = self.0.lock();
        let now = state.now_ns;
        state.analog_in.stop(now);
        Ok(())
    }

    fn produced(&mut self) -> Result<u64> {
        let mut state = self.0.lock();
        state.take_failure()?;
        Ok(state.analog_in.produced(state.now_ns))
    }

    fn read(&mut self, first: u64, count: usize, out: &mut [Vec<f64>]) -> Result<()> {
        let mut state = self.0.lock();
        state.take_failure()?;
        let rate = state.analog_in.rate_hz;
        for (ch, buf) in out.iter_mut().enumerate() {
            let signal = state.analog.get(ch).cloned().unwrap_or_default();
            buf.extend((first..first + count as u64).map(|i| signal.value(i, rate)));
        }
        let overrun = std::mem::take(&mut state.analog_in.overrun_on_read);
        state.analog_in.extra += overrun;
        Ok(())
    }
}

struct SimDigitalIn(Arc<Mutex<SimState>>);

impl SampleSource<u32> for SimDigitalIn {
    fn start(&mut self, plan: &AcquisitionPlan) -> Result<()> {
        let mut state = self.0.lock();
        state.take_failure()?;
        let now = state.now_ns;
        state.digital_in.start(now, plan);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let mut state = self.0.lock();
        let now = state.now_ns;
        state.digital_in.stop(now);
        Ok(())
    }

    fn produced(&mut self) -> Result<u64> {
        let mut state = self.0.lock();
        state.take_failure()?;
        Ok(state.digital_in.produced(state.now_ns))
    }

    fn read(&mut self, first: u64, count: usize, out: &mut [Vec<u32>]) -> Result<()> {
        let mut state = self.0.lock();
        state.take_failure()?;
        if let Some(buf) = out.first_mut() {
            buf.extend((first..first + count as u64).map(|i| state.digital.value(i)));
        }
        let overrun = std::mem::take(&mut state.digital_in.overrun_on_read);
        state.digital_in.extra += overrun;
        Ok(())
    }
}

struct SimAnalogOut(Arc<Mutex<SimState>>);

impl GeneratorSink<f64> for SimAnalogOut {
    fn start(&mut self, _plan: &GenerationPlan) -> Result<()> {
        let mut state = self.0.lock();
        state.take_failure()?;
        let now = state.now_ns;
        state.analog_out = OutputClock {
            started_ns: Some(now),
            stopped_ns: None,
        };
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let mut state = self.0.lock();
        let now = state.now_ns;
        if state.analog_out.stopped_ns.is_none() {
            state.analog_out.stopped_ns = Some(now);
        }
        Ok(())
    }

    fn elapsed(&mut self) -> Result<Duration> {
        let state = self.0.lock();
        Ok(state.analog_out.elapsed(state.now_ns))
    }

    fn write(&mut self, channel: usize, data: &[f64]) -> Result<()> {
        let mut state = self.0.lock();
        state.take_failure()?;
        let slot = state
            .analog_out_data
            .get_mut(channel)
            .ok_or_else(|| DaqError::device(format!("no analog output channel {channel}")))?;
        slot.extend_from_slice(data);
        Ok(())
    }
}

struct SimDigitalOut(Arc<Mutex<SimState>>);

impl GeneratorSink<bool> for SimDigitalOut {
    fn start(&mut self, _plan: &GenerationPlan) -> Result<()> {
        let mut state = self.0.lock();
        state.take_failure()?;
        let now = state.now_ns;
        state.digital_out = OutputClock {
            started_ns: Some(now),
            stopped_ns: None,
        };
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let mut state = self.0.lock();
        let now = state.now_ns;
        if state.digital_out.stopped_ns.is_none() {
            state.digital_out.stopped_ns = Some(now);
        }
        Ok(())
    }

    fn elapsed(&mut self) -> Result<Duration> {
        let state = self.0.lock();
        Ok(state.digital_out.elapsed(state.now_ns))
    }

    fn write(&mut self, pin: usize, data: &[bool]) -> Result<()> {
        let mut state = self.0.lock();
        state.take_failure()?;
        let slot = state
            .digital_out_data
            .get_mut(pin)
            .ok_or_else(|| DaqError::device(format!("no digital output pin {pin}")))?;
        slot.clear();
        slot.extend_from_slice(data);
        Ok(())
    }
}

impl DeviceBackend for SimDevice {
    fn capabilities(&self) -> DeviceCapabilities {
        self.caps.clone()
    }

    fn open_analog_in(&self) -> Result<Box<dyn SampleSource<f64>>> {
        Ok(Box::new(SimAnalogIn(self.state.clone())))
    }

    fn open_digital_in(&self) -> Result<Box<dyn SampleSource<u32>>> {
        Ok(Box::new(SimDigitalIn(self.state.clone())))
    }

    fn open_analog_out(&self) -> Result<Box<dyn GeneratorSink<f64>>> {
        Ok(Box::new(SimAnalogOut(self.state.clone())))
    }

    fn open_digital_out(&self) -> Result<Box<dyn GeneratorSink<bool>>> {
        Ok(Box::new(SimDigitalOut(self.state.clone())))
    }

    fn open_gpio(&self) -> Result<Box<dyn GpioPort>> {
        Ok(Box::new(SimGpio(self.state.clone())))
    }

    fn open_uart(&self) -> Result<Box<dyn UartPort>> {
        Ok(Box::new(SimUart(self.state.clone())))
    }

    fn open_spi(&self) -> Result<Box<dyn SpiPort>> {
        Ok(Box::new(SimSpi(self.state.clone())))
    }

    fn open_i2c(&self) -> Result<Box<dyn I2cPort>> {
        Ok(Box::new(SimI2c(self.state.clone())))
    }

    fn open_can(&self) -> Result<Box<dyn CanPort>> {
        Ok(Box::new(SimCan(self.state.clone())))
    }
}
