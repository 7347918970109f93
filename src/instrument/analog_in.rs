//! Analog input (oscilloscope) instrument.
//!
//! Setters validate against [`AnalogInCapabilities`] and queue the value;
//! getters return the queued value (snapped to the advertised step), so a
//! set followed by a get round-trips within step resolution. `configure`
//! applies the queue to the next capture cycle.
//!
//! Voltages are attenuated input volts: the backend delivers hardware volts and
//! samples are multiplied by the channel attenuation on the way out.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::capabilities::{AnalogInCapabilities, DeviceCapabilities};
use crate::capture::{CaptureEngine, CaptureSettings};
use crate::device::Device;
use crate::error::{DaqError, Result};
use crate::instrument::{
    configure_step, AcquisitionMode, ChannelSelector, ConfigureStep, Instrument, InstrumentKind,
    InstrumentState,
};
use crate::record::{ReadOutcome, RecordStatus};
use crate::trigger::{DigitalPattern, LocalDetector, TriggerLimits, TriggerSource, TriggerSpec};

const KIND: InstrumentKind = InstrumentKind::AnalogIn;

/// Per-channel input settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalogInChannel {
    /// Acquired and returned by reads
    pub enabled: bool,
    /// Full-scale range in volts peak-to-peak
    pub range: f64,
    /// Offset in volts
    pub offset: f64,
    /// Input attenuation factor
    pub attenuation: f64,
}

impl Default for AnalogInChannel {
    fn default() -> Self {
        Self {
            enabled: true,
            range: 5.0,
            offset: 0.0,
            attenuation: 1.0,
        }
    }
}

impl AnalogInChannel {
    /// Signed 16-bit ADC code for an attenuated input voltage.
    pub fn to_code(&self, volts: f64) -> i16 {
        let span = self.range / 2.0;
        let scaled = (volts + self.offset) / span * f64::from(i16::MAX);
        // clamped to the i16 range before the cast
        scaled.round().clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16
    }
}

#[derive(Debug, Clone, PartialEq)]
struct AnalogInSettings {
    mode: AcquisitionMode,
    sample_rate: f64,
    buffer_size: usize,
    oversample: u32,
    record_length: f64,
    trigger: TriggerSpec,
    channels: Vec<AnalogInChannel>,
}

impl AnalogInSettings {
    fn defaults(caps: &AnalogInCapabilities) -> Self {
        let default_rate = 1_000_000.0_f64.min(caps.clock.base_hz);
        Self {
            mode: AcquisitionMode::Single,
            sample_rate: caps.clock.base_hz / f64::from(caps.clock.divider_for(default_rate)),
            buffer_size: caps.buffer_size.1,
            oversample: 1,
            record_length: 0.0,
            trigger: TriggerSpec::default(),
            channels: vec![AnalogInChannel::default(); caps.channels],
        }
    }
}

/// Oscilloscope instrument.
pub struct AnalogIn {
    device: Device,
    caps: Arc<DeviceCapabilities>,
    pending: AnalogInSettings,
    applied: AnalogInSettings,
    dirty: bool,
    capture: CaptureEngine<f64>,
}

impl std::fmt::Debug for AnalogIn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalogIn")
            .field("state", &self.capture.state())
            .field("settings", &self.pending)
            .finish_non_exhaustive()
    }
}

impl AnalogIn {
    pub(crate) fn open(device: Device) -> Result<Self> {
        let caps = device.capabilities().clone();
        let source = device.backend().open_analog_in()?;
        let defaults = AnalogInSettings::defaults(&caps.analog_in);
        debug!(channels = caps.analog_in.channels, "Opened analog input");
        Ok(Self {
            capture: CaptureEngine::new(KIND, source, device.triggers().clone()),
            device,
            caps,
            pending: defaults.clone(),
            applied: defaults,
            dirty: false,
        })
    }

    fn limits(&self) -> &AnalogInCapabilities {
        &self.caps.analog_in
    }

    /// Device this instrument belongs to.
    pub fn device(&self) -> &Device {
        &self.device
    }

    fn channels_for(&self, selector: ChannelSelector) -> Result<Vec<usize>> {
        let enabled: Vec<bool> = self.pending.channels.iter().map(|c| c.enabled).collect();
        selector.resolve(KIND, &enabled)
    }

    fn check_channel(&self, channel: usize) -> Result<()> {
        if channel < self.pending.channels.len() {
            Ok(())
        } else {
            Err(DaqError::InvalidChannel {
                instrument: KIND,
                channel,
                max: self.pending.channels.len(),
            })
        }
    }

    // ---- acquisition settings ----

    /// Select the acquisition mode.
    pub fn set_mode(&mut self, mode: AcquisitionMode) -> Result<()> {
        if !self.limits().modes.contains(mode.flag()) {
            return Err(DaqError::not_supported(format!("{mode:?} acquisition")));
        }
        self.pending.mode = mode;
        self.dirty = true;
        Ok(())
    }

    /// Current acquisition mode.
    pub fn mode(&self) -> AcquisitionMode {
        self.pending.mode
    }

    /// Set the hardware sample rate; snapped to the nearest divider.
    pub fn set_sample_rate(&mut self, hz: f64) -> Result<()> {
        self.pending.sample_rate = self.limits().clock.snap("sample rate", hz)?;
        self.dirty = true;
        Ok(())
    }

    /// Sample rate in Hz.
    pub fn sample_rate(&self) -> f64 {
        self.pending.sample_rate
    }

    /// Set the capture buffer size in samples.
    pub fn set_buffer_size(&mut self, samples: usize) -> Result<()> {
        let (min, max) = self.limits().buffer_size;
        if !(min..=max).contains(&samples) {
            return Err(DaqError::invalid(
                "buffer size",
                format!("{samples} outside {min}..={max}"),
            ));
        }
        self.pending.buffer_size = samples;
        self.dirty = true;
        Ok(())
    }

    /// Samples per channel.
    pub fn buffer_size(&self) -> usize {
        self.pending.buffer_size
    }

    /// Hardware samples averaged per stored sample in oversample mode.
    pub fn set_oversample(&mut self, factor: u32) -> Result<()> {
        let max = self.limits().max_oversample;
        if factor == 0 || factor > max {
            return Err(DaqError::invalid(
                "oversample",
                format!("{factor} outside 1..={max}"),
            ));
        }
        self.pending.oversample = factor;
        self.dirty = true;
        Ok(())
    }

    /// Oversampling factor.
    pub fn oversample(&self) -> u32 {
        self.pending.oversample
    }

    /// Record length in seconds for record mode (0 = until stopped).
    pub fn set_record_length(&mut self, seconds: f64) -> Result<()> {
        self.pending.record_length = self.limits().record_length.snap("record length", seconds)?;
        self.dirty = true;
        Ok(())
    }

    /// Record length in seconds, 0 for unbounded.
    pub fn record_length(&self) -> f64 {
        self.pending.record_length
    }

    // ---- channels ----

    /// Enable or disable the selected channels.
    pub fn set_channel_enable(&mut self, selector: ChannelSelector, enabled: bool) -> Result<()> {
        for ch in self.channels_for(selector)? {
            self.pending.channels[ch].enabled = enabled;
        }
        self.dirty = true;
        Ok(())
    }

    /// Set the input range; snapped up to the smallest covering range.
    pub fn set_channel_range(&mut self, selector: ChannelSelector, volts: f64) -> Result<()> {
        let range = self.limits().snap_range(volts)?;
        for ch in self.channels_for(selector)? {
            self.pending.channels[ch].range = range;
        }
        self.dirty = true;
        Ok(())
    }

    /// Set the offset, in volts, of the selected channels.
    pub fn set_channel_offset(&mut self, selector: ChannelSelector, volts: f64) -> Result<()> {
        let offset = self.limits().offset.snap("channel offset", volts)?;
        for ch in self.channels_for(selector)? {
            self.pending.channels[ch].offset = offset;
        }
        self.dirty = true;
        Ok(())
    }

    /// Set the attenuation factor of the selected channels.
    pub fn set_channel_attenuation(&mut self, selector: ChannelSelector, factor: f64) -> Result<()> {
        let attenuation = self.limits().attenuation.snap("attenuation", factor)?;
        for ch in self.channels_for(selector)? {
            self.pending.channels[ch].attenuation = attenuation;
        }
        self.dirty = true;
        Ok(())
    }

    /// Queued settings of one channel.
    pub fn channel(&self, channel: usize) -> Result<&AnalogInChannel> {
        self.check_channel(channel)?;
        Ok(&self.pending.channels[channel])
    }

    /// Number of analog input channels.
    pub fn channel_count(&self) -> usize {
        self.pending.channels.len()
    }

    // ---- trigger ----

    /// Replace the trigger configuration.
    pub fn set_trigger(&mut self, spec: TriggerSpec) -> Result<()> {
        let caps = self.limits();
        let limits = TriggerLimits {
            detector: LocalDetector::Analog,
            sources: caps.trigger_sources,
            kinds: caps.trigger_kinds,
            external_inputs: caps.external_triggers,
            channels: caps.channels,
            level: Some(&caps.trigger_level),
            hysteresis: Some(&caps.trigger_hysteresis),
            length: Some(&caps.trigger_length),
            holdoff: &caps.holdoff,
            auto_timeout: &caps.auto_timeout,
            position: &caps.position,
        };
        self.pending.trigger = spec.validated(&limits)?;
        self.dirty = true;
        Ok(())
    }

    /// Change only the trigger source.
    pub fn set_trigger_source(&mut self, source: TriggerSource) -> Result<()> {
        let mut spec = self.pending.trigger.clone();
        spec.source = source;
        if !spec.uses_level() {
            spec.level = None;
            spec.hysteresis = None;
        }
        self.set_trigger(spec)
    }

    /// Current trigger.
    pub fn trigger(&self) -> &TriggerSpec {
        &self.pending.trigger
    }

    // ---- data ----

    fn applied_channel(&self, channel: usize) -> Result<&AnalogInChannel> {
        let settings = self.applied.channels.get(channel).ok_or(DaqError::InvalidChannel {
            instrument: KIND,
            channel,
            max: self.applied.channels.len(),
        })?;
        if !settings.enabled {
            return Err(DaqError::invalid(
                "channel",
                format!("channel {channel} is disabled"),
            ));
        }
        Ok(settings)
    }

    /// Read captured samples in volts without consuming them.
    ///
    /// In record mode the samples of the last poll are the tail of the buffer.
    pub fn read_samples(&self, channel: usize, offset: usize, count: usize) -> Result<ReadOutcome<f64>> {
        let attenuation = self.applied_channel(channel)?.attenuation;
        let mut out = self.capture.read(channel, offset, count);
        for v in &mut out.samples {
            *v *= attenuation;
        }
        Ok(out)
    }

    /// Read captured samples as signed 16-bit ADC codes.
    pub fn read_raw(&self, channel: usize, offset: usize, count: usize) -> Result<ReadOutcome<i16>> {
        let settings = self.applied_channel(channel)?.clone();
        let out = self.read_samples(channel, offset, count)?;
        Ok(ReadOutcome {
            samples: out.samples.iter().map(|v| settings.to_code(*v)).collect(),
            requested: out.requested,
        })
    }

    /// Loss/corruption counters of the last poll (record mode only).
    pub fn record_status(&self) -> Result<RecordStatus> {
        self.capture.record_status()
    }

    /// Valid samples per channel in the buffer.
    pub fn valid_samples(&self) -> usize {
        self.capture.valid_samples()
    }

    /// Windows discarded because the hardware buffer overflowed under them.
    pub fn window_restarts(&self) -> u64 {
        self.capture.window_restarts()
    }

    /// Whether the last capture was started by the auto timeout.
    pub fn auto_triggered(&self) -> bool {
        self.capture.auto_triggered()
    }

    /// Position of the trigger sample in the buffer.
    pub fn trigger_offset(&self) -> Option<usize> {
        self.capture.trigger_offset()
    }

    /// Next physical write position (scan-screen mode).
    pub fn write_index(&self) -> usize {
        self.capture.write_index()
    }

    fn capture_settings(&self) -> Result<CaptureSettings> {
        let settings = &self.applied;
        if !settings.channels.iter().any(|c| c.enabled) {
            return Err(DaqError::invalid("channel", "no channel enabled"));
        }
        let mut trigger = settings.trigger.clone();
        if let Some(ch) = settings.channels.get(trigger.channel) {
            trigger.level = trigger.level.map(|l| l / ch.attenuation);
            trigger.hysteresis = trigger.hysteresis.map(|h| h / ch.attenuation);
        }
        Ok(CaptureSettings {
            mode: settings.mode,
            rate_hz: settings.sample_rate,
            buffer_size: settings.buffer_size,
            oversample: settings.oversample,
            record_length: settings.record_length,
            trigger,
            pattern: DigitalPattern::default(),
            channels: settings.channels.iter().map(|c| c.enabled).collect(),
        })
    }
}

impl Instrument for AnalogIn {
    fn kind(&self) -> InstrumentKind {
        KIND
    }

    fn state(&self) -> InstrumentState {
        self.capture.state()
    }

    fn configure(&mut self, reconfigure: bool, start: bool) -> Result<InstrumentState> {
        let step = configure_step(KIND, self.capture.state(), self.dirty, reconfigure, start)?;
        let ConfigureStep::Apply { abort } = step else {
            return Ok(self.capture.state());
        };
        if abort {
            self.capture.halt(InstrumentState::Config)?;
        }
        if self.dirty {
            self.applied = self.pending.clone();
            self.dirty = false;
            debug!(
                mode = ?self.applied.mode,
                rate_hz = self.applied.sample_rate,
                buffer = self.applied.buffer_size,
                "Analog input configured"
            );
        }
        self.capture.set_state(InstrumentState::Config);
        if start {
            let settings = self.capture_settings()?;
            self.capture.start(settings)?;
        }
        Ok(self.capture.state())
    }

    fn poll(&mut self, read_data: bool) -> Result<InstrumentState> {
        self.capture.poll(read_data)
    }

    fn force_trigger(&mut self) -> Result<()> {
        self.capture.force_trigger()
    }

    fn stop(&mut self) -> Result<()> {
        self.capture.halt(InstrumentState::Ready)
    }

    fn reset(&mut self) -> Result<()> {
        let defaults = AnalogInSettings::defaults(self.limits());
        self.pending = defaults.clone();
        self.applied = defaults;
        self.dirty = false;
        info!("Analog input reset");
        self.capture.reset()
    }
}
