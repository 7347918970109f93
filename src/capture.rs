//! Triggered capture engine shared by the analog and digital inputs.
//!
//! The engine owns the instrument's [`SampleSource`], drains it on every
//! `poll(true)` through a [`DrainTracker`], optionally decimates
//! (oversample mode), feeds the [`TriggerEngine`] and stores into a
//! [`SampleRing`] according to the acquisition mode:
//!
//! | Mode | Trigger | Stores | Ends |
//! |------|---------|--------|------|
//! | Single / Oversample | yes | pre-trigger + post-trigger window | Done |
//! | Record | yes | everything from the trigger on | Done if the record length is finite |
//! | ScanShift / ScanScreen | no | everything | never |
//!
//! All indices here are in *stored* samples: for oversample mode one stored
//! sample is the mean of `oversample` hardware samples.
//!
//! A Single/Oversample window must be contiguous. When the hardware buffer
//! overflows between polls, or overwrites the head of a transfer, before
//! the window is complete, the stored samples are discarded and the cycle
//! goes back to Prefill (or Armed without pre-trigger data). Each such
//! restart is counted in [`CaptureEngine::window_restarts`].

use tracing::{debug, info, warn};

use crate::device::{AcquisitionPlan, SampleSource};
use crate::error::{DaqError, Result};
use crate::instrument::{require_armed, AcquisitionMode, InstrumentKind, InstrumentState};
use crate::record::{DrainTracker, ReadOutcome, RecordStatus, SampleRing};
use crate::trigger::{
    seconds_to_samples, DetectorValue, DigitalPattern, TriggerBus, TriggerEngine, TriggerFire,
    TriggerSource, TriggerSpec,
};

/// A sample type the capture engine can store.
pub trait Sample: Copy + Default + Send + 'static {
    /// View for the trigger detector.
    fn detector_value(self) -> DetectorValue;

    /// Combine a group of hardware samples into one stored sample.
    fn decimate(group: &[Self]) -> Self;
}

impl Sample for f64 {
    fn detector_value(self) -> DetectorValue {
        DetectorValue::Analog(self)
    }

    fn decimate(group: &[Self]) -> Self {
        if group.is_empty() {
            0.0
        } else {
            group.iter().sum::<f64>() / group.len() as f64
        }
    }
}

impl Sample for u32 {
    fn detector_value(self) -> DetectorValue {
        DetectorValue::Digital(self)
    }

    fn decimate(group: &[Self]) -> Self {
        group.last().copied().unwrap_or_default()
    }
}

/// Applied acquisition settings for one capture cycle.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CaptureSettings {
    pub mode: AcquisitionMode,
    pub rate_hz: f64,
    pub buffer_size: usize,
    pub oversample: u32,
    pub record_length: f64,
    pub trigger: TriggerSpec,
    pub pattern: DigitalPattern,
    pub channels: Vec<bool>,
}

/// Number of pre-trigger samples for a window of `buffer` samples.
fn pre_trigger_samples(buffer: usize, position: f64, rate_hz: f64) -> u64 {
    let centre = (buffer / 2) as f64;
    let shifted = (centre - position * rate_hz).round();
    shifted.clamp(0.0, buffer.saturating_sub(1) as f64) as u64
}

/// Drains a sample source into a ring buffer under trigger control.
pub(crate) struct CaptureEngine<S: Sample> {
    kind: InstrumentKind,
    source: Box<dyn SampleSource<S>>,
    bus: TriggerBus,
    settings: Option<CaptureSettings>,
    state: InstrumentState,
    ring: SampleRing<S>,
    tracker: DrainTracker,
    trigger: Option<TriggerEngine>,
    oversample: usize,
    detector_channel: usize,
    pre: u64,
    prefill_until: u64,
    index: u64,
    group: Vec<Vec<S>>,
    scratch: Vec<Vec<S>>,
    scan: Vec<S>,
    trigger_index: Option<u64>,
    window_end: Option<u64>,
    auto_triggered: bool,
    recording: bool,
    record_remaining: Option<u64>,
    poll_available: u64,
    status: RecordStatus,
    window_restarts: u64,
}

impl<S: Sample> CaptureEngine<S> {
    pub fn new(kind: InstrumentKind, source: Box<dyn SampleSource<S>>, bus: TriggerBus) -> Self {
        Self {
            kind,
            source,
            bus,
            settings: None,
            state: InstrumentState::Ready,
            ring: SampleRing::new(0, 0),
            tracker: DrainTracker::new(0),
            trigger: None,
            oversample: 1,
            detector_channel: 0,
            pre: 0,
            prefill_until: 0,
            index: 0,
            group: Vec::new(),
            scratch: Vec::new(),
            scan: Vec::new(),
            trigger_index: None,
            window_end: None,
            auto_triggered: false,
            recording: false,
            record_remaining: None,
            poll_available: 0,
            status: RecordStatus::default(),
            window_restarts: 0,
        }
    }

    pub fn state(&self) -> InstrumentState {
        self.state
    }

    pub fn set_state(&mut self, state: InstrumentState) {
        self.state = state;
    }

    fn instrument_source(&self) -> TriggerSource {
        match self.kind {
            InstrumentKind::DigitalIn => TriggerSource::DigitalIn,
            _ => TriggerSource::AnalogIn,
        }
    }

    fn detector_source(&self) -> TriggerSource {
        match self.kind {
            InstrumentKind::DigitalIn => TriggerSource::DigitalInDetector,
            _ => TriggerSource::AnalogInDetector,
        }
    }

    /// Start a new cycle with `settings`.
    pub fn start(&mut self, settings: CaptureSettings) -> Result<()> {
        let mode = settings.mode;
        let oversample = if mode == AcquisitionMode::Oversample {
            settings.oversample.max(1)
        } else {
            1
        };
        let channels = settings.channels.len();
        let buffer = settings.buffer_size;
        let stored_rate = settings.rate_hz / f64::from(oversample);
        let immediate = settings.trigger.source == TriggerSource::None;

        self.ring = SampleRing::new(channels, buffer);
        self.tracker = DrainTracker::new(buffer as u64 * u64::from(oversample));
        self.oversample = oversample as usize;
        self.group = vec![Vec::with_capacity(self.oversample); channels];
        self.scratch = vec![Vec::with_capacity(buffer); channels];
        self.scan = Vec::with_capacity(channels);
        self.detector_channel = if settings.trigger.source == TriggerSource::AnalogInDetector {
            settings.trigger.channel
        } else {
            0
        };
        self.index = 0;
        self.trigger_index = None;
        self.window_end = None;
        self.auto_triggered = false;
        self.status = RecordStatus::default();
        self.window_restarts = 0;
        self.recording = mode == AcquisitionMode::Record && immediate;
        self.record_remaining = (mode == AcquisitionMode::Record && settings.record_length > 0.0)
            .then(|| seconds_to_samples(settings.record_length, stored_rate).max(1));
        self.pre = match mode {
            AcquisitionMode::Single | AcquisitionMode::Oversample if !immediate => {
                pre_trigger_samples(buffer, settings.trigger.position, stored_rate)
            }
            _ => 0,
        };
        self.prefill_until = self.pre;

        let mut engine =
            TriggerEngine::new(&settings.trigger, &settings.pattern, stored_rate, &self.bus);

        self.source.start(&AcquisitionPlan {
            rate_hz: settings.rate_hz,
            channels: settings.channels.clone(),
            capacity: self.tracker.capacity(),
        })?;

        self.state = if mode.is_scan() {
            self.bus.publish(self.instrument_source());
            InstrumentState::Triggered
        } else if self.pre > 0 {
            InstrumentState::Prefill
        } else {
            engine.arm(0);
            InstrumentState::Armed
        };
        self.trigger = (!mode.is_scan() && !self.recording).then_some(engine);

        info!(
            instrument = %self.kind,
            mode = ?mode,
            rate_hz = settings.rate_hz,
            buffer = buffer,
            pre_trigger = self.pre,
            source = %settings.trigger.source,
            "Capture started"
        );
        self.settings = Some(settings);
        Ok(())
    }

    /// End the cycle; the buffer stays readable.
    pub fn halt(&mut self, next: InstrumentState) -> Result<()> {
        if self.state.is_active() {
            self.source.stop()?;
            debug!(instrument = %self.kind, from = %self.state, "Capture halted");
        }
        if let Some(engine) = &mut self.trigger {
            engine.disarm();
        }
        self.state = next;
        Ok(())
    }

    /// Stop the source unconditionally and forget the applied cycle.
    ///
    /// The source is stopped even when the state machine was already
    /// forced out of an active state, so a reset never leaves the hardware
    /// streaming.
    pub fn reset(&mut self) -> Result<()> {
        let stopped = self.source.stop();
        self.settings = None;
        self.trigger = None;
        self.state = InstrumentState::Ready;
        self.ring = SampleRing::new(0, 0);
        self.tracker = DrainTracker::new(0);
        self.index = 0;
        self.trigger_index = None;
        self.window_end = None;
        self.auto_triggered = false;
        self.recording = false;
        self.record_remaining = None;
        self.status = RecordStatus::default();
        self.window_restarts = 0;
        debug!(instrument = %self.kind, "Capture reset");
        stopped
    }

    /// Throw away a window that is no longer contiguous and wait for a new one.
    fn restart_window(&mut self, gap: u64) {
        let discarded = self.ring.len();
        if discarded == 0 {
            return;
        }
        self.ring.clear();
        self.trigger_index = None;
        self.window_end = None;
        self.auto_triggered = false;
        self.window_restarts += 1;
        self.prefill_until = self.index + self.pre;
        self.state = if self.pre > 0 {
            if let Some(engine) = &mut self.trigger {
                engine.disarm();
            }
            InstrumentState::Prefill
        } else {
            if let Some(engine) = &mut self.trigger {
                engine.arm(self.index);
            }
            InstrumentState::Armed
        };
        warn!(
            instrument = %self.kind,
            gap = gap,
            discarded = discarded,
            restarts = self.window_restarts,
            "Capture window lost samples, restarting"
        );
    }

    /// Drain new samples and advance the state machine.
    pub fn poll(&mut self, read_data: bool) -> Result<InstrumentState> {
        if !read_data || !self.state.is_active() {
            return Ok(self.state);
        }
        let Some(mode) = self.settings.as_ref().map(|s| s.mode) else {
            return Ok(self.state);
        };

        if let Some(engine) = &mut self.trigger {
            engine.check_bus(&self.bus);
        }

        let corrupt = self.tracker.take_corrupt();
        let produced = self.source.produced()?;
        let plan = self.tracker.plan(produced);
        let recording_before = self.recording;

        if plan.lost > 0 {
            debug!(
                instrument = %self.kind,
                lost = plan.lost,
                produced = produced,
                "Hardware buffer overflowed between polls"
            );
            for group in &mut self.group {
                group.clear();
            }
        }

        let count = usize::try_from(plan.count)
            .map_err(|_| DaqError::device(format!("transfer of {} samples", plan.count)))?;
        for buf in &mut self.scratch {
            buf.clear();
        }
        if count > 0 {
            self.source.read(plan.first, count, &mut self.scratch)?;
        }
        let produced_after = self.source.produced()?;
        self.tracker.finish(&plan, produced_after);

        // windowed captures cannot wait a poll to learn about overwritten
        // samples: the window may complete in this one
        let mut skip = 0;
        if mode.is_windowed() {
            let overwritten = self.tracker.take_corrupt();
            skip = usize::try_from(overwritten).map_or(count, |n| n.min(count));
            if plan.lost + overwritten > 0 {
                self.restart_window(plan.lost + overwritten);
            }
        }

        self.poll_available = 0;
        let mut scan = std::mem::take(&mut self.scan);
        for i in skip..count {
            for (group, buf) in self.group.iter_mut().zip(&self.scratch) {
                group.push(buf.get(i).copied().unwrap_or_default());
            }
            if self.group.first().map_or(0, Vec::len) < self.oversample {
                continue;
            }
            scan.clear();
            for group in &mut self.group {
                scan.push(S::decimate(group));
                group.clear();
            }
            if self.process(&scan) {
                break;
            }
        }
        self.scan = scan;

        if mode == AcquisitionMode::Record {
            let counted = recording_before || self.recording;
            self.status = RecordStatus {
                available: self.poll_available,
                lost: if recording_before { plan.lost } else { 0 },
                corrupt: if counted { corrupt } else { 0 },
            };
            if self.status.has_gap() {
                warn!(
                    instrument = %self.kind,
                    lost = self.status.lost,
                    corrupt = self.status.corrupt,
                    "Record stream has a gap"
                );
            }
            if self.state != InstrumentState::Done && self.recording {
                self.state = if self.poll_available > 0 {
                    InstrumentState::Triggered
                } else {
                    InstrumentState::Wait
                };
            }
        }

        if self.state == InstrumentState::Done {
            self.source.stop()?;
            info!(
                instrument = %self.kind,
                samples = self.ring.len(),
                auto = self.auto_triggered,
                "Capture complete"
            );
        }
        Ok(self.state)
    }

    /// Handle one stored sample; returns true when the cycle ended.
    fn process(&mut self, scan: &[S]) -> bool {
        let index = self.index;
        self.index += 1;

        let fire = match (&mut self.trigger, scan.get(self.detector_channel)) {
            (Some(engine), Some(sample)) => engine.feed(index, sample.detector_value()),
            _ => None,
        };
        let Some(mode) = self.settings.as_ref().map(|s| s.mode) else {
            return true;
        };

        match mode {
            AcquisitionMode::Record => {
                if !self.recording {
                    let Some(fire) = fire else {
                        return false;
                    };
                    self.on_fire(fire, true);
                    self.recording = true;
                }
                self.ring.push(scan);
                self.poll_available += 1;
                if let Some(remaining) = &mut self.record_remaining {
                    *remaining = remaining.saturating_sub(1);
                    if *remaining == 0 {
                        self.state = InstrumentState::Done;
                        return true;
                    }
                }
                false
            }
            AcquisitionMode::ScanShift | AcquisitionMode::ScanScreen => {
                self.ring.push(scan);
                false
            }
            AcquisitionMode::Single | AcquisitionMode::Oversample => {
                self.ring.push(scan);
                match self.state {
                    InstrumentState::Prefill if index + 1 >= self.prefill_until => {
                        self.state = InstrumentState::Armed;
                        if let Some(engine) = &mut self.trigger {
                            engine.arm(index + 1);
                        }
                    }
                    InstrumentState::Armed => {
                        if let Some(fire) = fire {
                            self.on_fire(fire, true);
                        }
                    }
                    _ => {}
                }
                if self.window_end.is_some_and(|end| index + 1 >= end) {
                    self.state = InstrumentState::Done;
                    return true;
                }
                false
            }
        }
    }

    fn on_fire(&mut self, fire: TriggerFire, from_detector: bool) {
        let buffer = self.ring.capacity() as u64;
        self.trigger_index = Some(fire.index);
        self.auto_triggered = fire.auto;
        self.window_end = Some(fire.index + buffer.saturating_sub(self.pre));
        self.state = InstrumentState::Triggered;
        if let Some(engine) = &mut self.trigger {
            engine.disarm();
        }

        let local = self
            .trigger
            .as_ref()
            .is_some_and(|engine| engine.source() == self.detector_source());
        if from_detector && local && !fire.auto {
            self.bus.publish(self.detector_source());
        }
        self.bus.publish(self.instrument_source());
        debug!(
            instrument = %self.kind,
            index = fire.index,
            auto = fire.auto,
            "Triggered"
        );
    }

    pub fn force_trigger(&mut self) -> Result<()> {
        require_armed(self.kind, self.state)?;
        let fire = TriggerFire {
            index: self.index,
            auto: false,
        };
        self.on_fire(fire, false);
        if self.settings.as_ref().is_some_and(|s| s.mode == AcquisitionMode::Record) {
            self.recording = true;
        }
        Ok(())
    }

    pub fn record_status(&self) -> Result<RecordStatus> {
        match self.settings.as_ref().map(|s| s.mode) {
            Some(AcquisitionMode::Record) => Ok(self.status),
            _ => Err(DaqError::not_supported(
                "record status outside record mode",
            )),
        }
    }

    pub fn read(&self, channel: usize, offset: usize, count: usize) -> ReadOutcome<S> {
        match self.settings.as_ref().map(|s| s.mode) {
            Some(AcquisitionMode::ScanScreen) => self.ring.read_physical(channel, offset, count),
            _ => self.ring.read(channel, offset, count),
        }
    }

    pub fn valid_samples(&self) -> usize {
        self.ring.len()
    }

    pub fn write_index(&self) -> usize {
        self.ring.write_index()
    }

    pub fn auto_triggered(&self) -> bool {
        self.auto_triggered
    }

    /// Windows discarded this cycle because samples were lost under them.
    pub fn window_restarts(&self) -> u64 {
        self.window_restarts
    }

    /// Position of the trigger sample in the logical buffer.
    pub fn trigger_offset(&self) -> Option<usize> {
        let trigger = self.trigger_index?;
        let newer = self.index.checked_sub(trigger)?;
        usize::try_from(newer)
            .ok()
            .and_then(|newer| self.ring.len().checked_sub(newer))
    }
}
