//! Analog output (waveform generator) instrument.
//!
//! Every channel has three nodes: the carrier, an amplitude modulator and a
//! frequency modulator. Modulator amplitude and offset are percentages of
//! the carrier. In play mode the carrier frequency is the playback sample
//! rate and the caller streams data through [`AnalogOut::play_data`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::capabilities::{AnalogOutCapabilities, DeviceCapabilities, ParamRange};
use crate::device::{Device, GenerationPlan};
use crate::error::{DaqError, Result};
use crate::generator::{OutputEngine, PlayQueue, PlayStatus, RunPlan};
use crate::instrument::{
    configure_step, ChannelSelector, ConfigureStep, Instrument, InstrumentKind, InstrumentState,
};
use crate::trigger::TriggerSource;
use crate::waveform::{synthesize, NodeSettings, WaveFunction};

const KIND: InstrumentKind = InstrumentKind::AnalogOut;

/// Seed mixed into noise generation per channel.
const NOISE_SEED: u64 = 0x5EED_0A0A;

/// A node of an analog output channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Node {
    /// The generated waveform
    Carrier,
    /// Amplitude modulation
    Am,
    /// Frequency modulation
    Fm,
}

/// Carrier plus modulators of one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalogOutChannel {
    /// Output node
    pub carrier: NodeSettings,
    /// Amplitude modulator
    pub am: NodeSettings,
    /// Frequency modulator
    pub fm: NodeSettings,
}

impl Default for AnalogOutChannel {
    fn default() -> Self {
        let modulator = NodeSettings {
            amplitude: 0.0,
            ..NodeSettings::default()
        };
        Self {
            carrier: NodeSettings::default(),
            am: modulator.clone(),
            fm: modulator,
        }
    }
}

impl AnalogOutChannel {
    /// Settings of one node.
    pub fn node(&self, node: Node) -> &NodeSettings {
        match node {
            Node::Carrier => &self.carrier,
            Node::Am => &self.am,
            Node::Fm => &self.fm,
        }
    }

    fn node_mut(&mut self, node: Node) -> &mut NodeSettings {
        match node {
            Node::Carrier => &mut self.carrier,
            Node::Am => &mut self.am,
            Node::Fm => &mut self.fm,
        }
    }

    fn plays(&self) -> bool {
        self.carrier.enabled && self.carrier.function == WaveFunction::Play
    }
}

#[derive(Debug, Clone, PartialEq)]
struct AnalogOutSettings {
    channels: Vec<AnalogOutChannel>,
    run: RunPlan,
    trigger: TriggerSource,
}

impl AnalogOutSettings {
    fn defaults(caps: &AnalogOutCapabilities) -> Self {
        Self {
            channels: vec![AnalogOutChannel::default(); caps.channels],
            run: RunPlan::default(),
            trigger: TriggerSource::None,
        }
    }
}

/// Waveform generator instrument.
pub struct AnalogOut {
    device: Device,
    caps: Arc<DeviceCapabilities>,
    pending: AnalogOutSettings,
    applied: AnalogOutSettings,
    dirty: bool,
    output: OutputEngine<f64>,
    play: Vec<PlayQueue>,
}

impl std::fmt::Debug for AnalogOut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalogOut")
            .field("state", &self.output.state())
            .field("settings", &self.pending)
            .finish_non_exhaustive()
    }
}

impl AnalogOut {
    pub(crate) fn open(device: Device) -> Result<Self> {
        let caps = device.capabilities().clone();
        let sink = device.backend().open_analog_out()?;
        let defaults = AnalogOutSettings::defaults(&caps.analog_out);
        let play = (0..caps.analog_out.channels)
            .map(|_| PlayQueue::new(caps.analog_out.play_buffer))
            .collect();
        debug!(channels = caps.analog_out.channels, "Opened analog output");
        Ok(Self {
            output: OutputEngine::new(KIND, sink, device.triggers().clone()),
            device,
            caps,
            pending: defaults.clone(),
            applied: defaults,
            dirty: false,
            play,
        })
    }

    fn limits(&self) -> &AnalogOutCapabilities {
        &self.caps.analog_out
    }

    /// The owning device.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Number of output channels.
    pub fn channel_count(&self) -> usize {
        self.pending.channels.len()
    }

    fn channels_for(&self, selector: ChannelSelector) -> Result<Vec<usize>> {
        let enabled: Vec<bool> = self.pending.channels.iter().map(|c| c.carrier.enabled).collect();
        selector.resolve(KIND, &enabled)
    }

    fn set_nodes(
        &mut self,
        selector: ChannelSelector,
        node: Node,
        apply: impl Fn(&mut NodeSettings),
    ) -> Result<()> {
        for ch in self.channels_for(selector)? {
            apply(self.pending.channels[ch].node_mut(node));
        }
        self.dirty = true;
        Ok(())
    }

    /// Queued settings of one channel.
    pub fn channel(&self, channel: usize) -> Result<&AnalogOutChannel> {
        self.pending.channels.get(channel).ok_or(DaqError::InvalidChannel {
            instrument: KIND,
            channel,
            max: self.pending.channels.len(),
        })
    }

    /// Queued settings of one node.
    pub fn node(&self, channel: usize, node: Node) -> Result<&NodeSettings> {
        Ok(self.channel(channel)?.node(node))
    }

    /// Enable a channel (its carrier node).
    pub fn set_channel_enable(&mut self, selector: ChannelSelector, enabled: bool) -> Result<()> {
        self.set_nodes(selector, Node::Carrier, |n| n.enabled = enabled)
    }

    /// Enable or disable a node on the selected channels.
    pub fn set_node_enable(&mut self, selector: ChannelSelector, node: Node, enabled: bool) -> Result<()> {
        self.set_nodes(selector, node, |n| n.enabled = enabled)
    }

    /// Select the unit shape of a node.
    pub fn set_node_function(
        &mut self,
        selector: ChannelSelector,
        node: Node,
        function: WaveFunction,
    ) -> Result<()> {
        if !self.limits().functions.contains(function.flag()) {
            return Err(DaqError::not_supported(format!("{function:?} waveform")));
        }
        if function == WaveFunction::Play && node != Node::Carrier {
            return Err(DaqError::not_supported("play mode on a modulator node"));
        }
        self.set_nodes(selector, node, |n| n.function = function)
    }

    /// Node frequency in Hz; for a playing carrier, the playback sample rate.
    pub fn set_node_frequency(&mut self, selector: ChannelSelector, node: Node, hz: f64) -> Result<()> {
        let hz = self.limits().frequency.snap("frequency", hz)?;
        self.set_nodes(selector, node, |n| n.frequency = hz)
    }

    /// Carrier amplitude in volts, or modulation depth in percent.
    pub fn set_node_amplitude(&mut self, selector: ChannelSelector, node: Node, value: f64) -> Result<()> {
        let value = match node {
            Node::Carrier => self.limits().amplitude.snap("amplitude", value)?,
            Node::Am | Node::Fm => self.limits().modulation.snap("modulation", value)?,
        };
        self.set_nodes(selector, node, |n| n.amplitude = value)
    }

    /// Carrier offset in volts, or modulator offset in percent.
    pub fn set_node_offset(&mut self, selector: ChannelSelector, node: Node, value: f64) -> Result<()> {
        let value = match node {
            Node::Carrier => self.limits().offset.snap("offset", value)?,
            Node::Am | Node::Fm => {
                let max = self.limits().modulation.max;
                ParamRange::continuous(-max, max).snap("modulation offset", value)?
            }
        };
        self.set_nodes(selector, node, |n| n.offset = value)
    }

    /// Set the symmetry of a node, in percent.
    pub fn set_node_symmetry(&mut self, selector: ChannelSelector, node: Node, percent: f64) -> Result<()> {
        let percent = self.limits().symmetry.snap("symmetry", percent)?;
        self.set_nodes(selector, node, |n| n.symmetry = percent)
    }

    /// Set the phase offset of a node, in degrees.
    pub fn set_node_phase(&mut self, selector: ChannelSelector, node: Node, degrees: f64) -> Result<()> {
        let degrees = self.limits().phase.snap("phase", degrees)?;
        self.set_nodes(selector, node, |n| n.phase = degrees)
    }

    /// Custom waveform, one period, normalized to -1..=1.
    pub fn set_node_custom(&mut self, selector: ChannelSelector, node: Node, data: &[f64]) -> Result<()> {
        let max = self.limits().custom_samples;
        if data.is_empty() || data.len() > max {
            return Err(DaqError::invalid(
                "custom waveform",
                format!("{} samples outside 1..={max}", data.len()),
            ));
        }
        if let Some(bad) = data.iter().find(|v| !v.is_finite() || v.abs() > 1.0) {
            return Err(DaqError::invalid(
                "custom waveform",
                format!("sample {bad} outside -1..=1"),
            ));
        }
        self.set_nodes(selector, node, |n| n.custom = data.to_vec())
    }

    // ---- run control ----

    fn duration(&self, parameter: &str, seconds: f64) -> Result<f64> {
        self.limits().duration.snap(parameter, seconds)
    }

    /// Idle time before each run.
    pub fn set_wait(&mut self, seconds: f64) -> Result<()> {
        self.pending.run.wait = self.duration("wait", seconds)?;
        self.dirty = true;
        Ok(())
    }

    /// Generation time per run (0 = indefinite).
    pub fn set_run(&mut self, seconds: f64) -> Result<()> {
        self.pending.run.run = self.duration("run", seconds)?;
        self.dirty = true;
        Ok(())
    }

    /// Number of runs (0 = indefinite).
    pub fn set_repeat(&mut self, count: u32) -> Result<()> {
        let max = self.limits().max_repeat;
        if count > max {
            return Err(DaqError::invalid("repeat", format!("{count} exceeds {max}")));
        }
        self.pending.run.repeat = count;
        self.dirty = true;
        Ok(())
    }

    /// Wait for a new trigger before every repeat.
    pub fn set_repeat_trigger(&mut self, enabled: bool) {
        self.pending.run.repeat_trigger = enabled;
        self.dirty = true;
    }

    /// Wait, run and repeat settings.
    pub fn run_plan(&self) -> RunPlan {
        self.pending.run
    }

    /// Select what starts the generator.
    pub fn set_trigger_source(&mut self, source: TriggerSource) -> Result<()> {
        source.check(self.limits().trigger_sources, self.caps.analog_in.external_triggers)?;
        self.pending.trigger = source;
        self.dirty = true;
        Ok(())
    }

    /// Current start trigger.
    pub fn trigger_source(&self) -> TriggerSource {
        self.pending.trigger
    }

    // ---- output ----

    /// Seconds of generation so far in the current sequence.
    pub fn running_time(&mut self) -> Result<f64> {
        self.output.running_time()
    }

    /// Expected output voltage of a channel `t` seconds into a run.
    pub fn sample_at(&self, channel: usize, t: f64) -> Result<f64> {
        let settings = self.applied.channels.get(channel).ok_or(DaqError::InvalidChannel {
            instrument: KIND,
            channel,
            max: self.applied.channels.len(),
        })?;
        if !settings.carrier.enabled {
            return Ok(0.0);
        }
        let seed = NOISE_SEED ^ channel as u64;
        Ok(synthesize(
            &settings.carrier,
            Some(&settings.am),
            Some(&settings.fm),
            t,
            seed,
        ))
    }

    fn play_channel(&self, channel: usize) -> Result<()> {
        let settings = self.applied.channels.get(channel).ok_or(DaqError::InvalidChannel {
            instrument: KIND,
            channel,
            max: self.applied.channels.len(),
        })?;
        if !settings.plays() {
            return Err(DaqError::invalid(
                "channel",
                format!("channel {channel} is not configured for play"),
            ));
        }
        Ok(())
    }

    /// Playback head in samples for a playing channel.
    fn play_head(&mut self, channel: usize) -> Result<u64> {
        if !self.output.state().is_active() {
            return Ok(0);
        }
        let rate = self.applied.channels[channel].carrier.frequency;
        let played = self.output.running_time()? * rate;
        // non-negative and finite by construction
        Ok(played.floor().max(0.0) as u64)
    }

    /// Queue play data; returns how many samples fit.
    pub fn play_data(&mut self, channel: usize, data: &[f64]) -> Result<usize> {
        self.play_channel(channel)?;
        let head = self.play_head(channel)?;
        self.play[channel].consume_to(head);

        let start = self.play[channel].written();
        let accepted = self.play[channel].accept(data.len());
        if accepted > 0 {
            self.output.sink().write(channel, &data[..accepted])?;
        }
        let head_after = self.play_head(channel)?;
        self.play[channel].overtaken(start, accepted, head_after);
        if accepted < data.len() {
            debug!(channel, accepted, offered = data.len(), "Play buffer full");
        }
        Ok(accepted)
    }

    /// Free space, underrun loss and late samples since the last call.
    pub fn play_status(&mut self, channel: usize) -> Result<PlayStatus> {
        self.play_channel(channel)?;
        let head = self.play_head(channel)?;
        self.play[channel].consume_to(head);
        let status = self.play[channel].status();
        if status.lost > 0 {
            warn!(channel, lost = status.lost, "Play data underrun");
        }
        Ok(status)
    }

    fn generation_plan(&self) -> GenerationPlan {
        let channels: Vec<bool> = self.applied.channels.iter().map(|c| c.carrier.enabled).collect();
        let rate_hz = self
            .applied
            .channels
            .iter()
            .filter(|c| c.carrier.enabled)
            .map(|c| c.carrier.frequency)
            .fold(0.0, f64::max);
        GenerationPlan { rate_hz, channels }
    }

    fn start(&mut self) -> Result<()> {
        if !self.applied.channels.iter().any(|c| c.carrier.enabled) {
            return Err(DaqError::invalid("channel", "no channel enabled"));
        }
        let plan = self.generation_plan();
        for (ch, settings) in self.applied.channels.iter().enumerate() {
            if settings.carrier.enabled && settings.carrier.function == WaveFunction::Custom {
                self.output.sink().write(ch, &settings.carrier.custom)?;
            }
        }
        self.output.start(&plan, self.applied.run, self.applied.trigger)
    }
}

impl Instrument for AnalogOut {
    fn kind(&self) -> InstrumentKind {
        KIND
    }

    fn state(&self) -> InstrumentState {
        self.output.state()
    }

    fn configure(&mut self, reconfigure: bool, start: bool) -> Result<InstrumentState> {
        let step = configure_step(KIND, self.output.state(), self.dirty, reconfigure, start)?;
        let ConfigureStep::Apply { abort } = step else {
            return Ok(self.output.state());
        };
        if abort {
            self.output.halt(InstrumentState::Config)?;
        }
        if self.dirty {
            self.applied = self.pending.clone();
            self.dirty = false;
            let depth = self.limits().play_buffer;
            for queue in &mut self.play {
                *queue = PlayQueue::new(depth);
            }
            debug!(
                trigger = %self.applied.trigger,
                run = self.applied.run.run,
                repeat = self.applied.run.repeat,
                "Analog output configured"
            );
        }
        self.output.set_state(InstrumentState::Config);
        if start {
            self.start()?;
        }
        Ok(self.output.state())
    }

    /// Advances the output clock; outputs never transfer data on poll.
    fn poll(&mut self, _read_data: bool) -> Result<InstrumentState> {
        self.output.poll()
    }

    fn force_trigger(&mut self) -> Result<()> {
        self.output.force_trigger()
    }

    fn stop(&mut self) -> Result<()> {
        self.output.halt(InstrumentState::Ready)
    }

    fn reset(&mut self) -> Result<()> {
        let defaults = AnalogOutSettings::defaults(self.limits());
        self.pending = defaults.clone();
        self.applied = defaults;
        self.dirty = false;
        let depth = self.limits().play_buffer;
        for queue in &mut self.play {
            *queue = PlayQueue::new(depth);
        }
        info!("Analog output reset");
        self.output.reset()
    }
}
