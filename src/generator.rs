//! Output sequencing shared by the waveform and pattern generators.
//!
//! A generator cycle is `wait` seconds of idle output followed by `run`
//! seconds of generation (0 = indefinite), repeated `repeat` times
//! (0 = indefinite). With `repeat_trigger` every repeat waits for a new
//! trigger; otherwise cycles follow back to back.
//!
//! ```text
//!  Armed ──trigger──► Wait ──► Running ──► (repeat) ──► Done
//!    ▲                                        │
//!    └──────────── repeat_trigger ────────────┘
//! ```
//!
//! Time comes from the sink's device clock, so the sequence advances only
//! as far as the hardware actually ran.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::device::{GenerationPlan, GeneratorSink};
use crate::error::Result;
use crate::instrument::{require_armed, InstrumentKind, InstrumentState};
use crate::trigger::{BusTrigger, TriggerBus, TriggerSource};

/// Wait / run / repeat parameters of a generator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunPlan {
    /// Idle time before each run, seconds
    pub wait: f64,
    /// Run length, seconds (0 = indefinite)
    pub run: f64,
    /// Number of cycles (0 = indefinite)
    pub repeat: u32,
    /// Wait for a new trigger before every repeat
    pub repeat_trigger: bool,
}

impl Default for RunPlan {
    fn default() -> Self {
        Self {
            wait: 0.0,
            run: 0.0,
            repeat: 1,
            repeat_trigger: false,
        }
    }
}

/// Phase of a generator sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenPhase {
    /// Waiting for the trigger
    Armed,
    /// Triggered, in the wait interval
    Wait,
    /// Producing output
    Running,
    /// All repeats finished
    Done,
}

impl From<GenPhase> for InstrumentState {
    fn from(phase: GenPhase) -> Self {
        match phase {
            GenPhase::Armed => InstrumentState::Armed,
            GenPhase::Wait => InstrumentState::Wait,
            GenPhase::Running => InstrumentState::Running,
            GenPhase::Done => InstrumentState::Done,
        }
    }
}

/// Wait/run/repeat state driven by device time.
#[derive(Debug, Clone)]
pub struct Sequencer {
    plan: RunPlan,
    phase: GenPhase,
    cycle: u32,
    cycle_start: f64,
    completed_run: f64,
}

impl Sequencer {
    /// New sequence waiting for its first trigger.
    pub fn new(plan: RunPlan) -> Self {
        Self {
            plan,
            phase: GenPhase::Armed,
            cycle: 0,
            cycle_start: 0.0,
            completed_run: 0.0,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> GenPhase {
        self.phase
    }

    /// Completed cycles.
    pub fn cycles(&self) -> u32 {
        self.cycle
    }

    /// Begin a cycle at device time `now`; ignored unless armed.
    pub fn trigger(&mut self, now: f64) {
        if self.phase == GenPhase::Armed {
            self.cycle_start = now;
            self.phase = GenPhase::Wait;
        }
    }

    /// Advance to device time `now`.
    pub fn advance(&mut self, now: f64) -> GenPhase {
        let RunPlan {
            wait,
            run,
            repeat,
            repeat_trigger,
        } = self.plan;

        while matches!(self.phase, GenPhase::Wait | GenPhase::Running) {
            let elapsed = now - self.cycle_start;
            if elapsed < wait {
                self.phase = GenPhase::Wait;
                break;
            }
            if run <= 0.0 || elapsed < wait + run {
                self.phase = GenPhase::Running;
                break;
            }

            self.cycle += 1;
            self.completed_run += run;
            if repeat != 0 && self.cycle >= repeat {
                self.phase = GenPhase::Done;
                break;
            }
            if repeat_trigger {
                self.phase = GenPhase::Armed;
                break;
            }
            self.cycle_start += wait + run;

            // skip whole cycles in one step
            let period = wait + run;
            let whole = ((now - self.cycle_start) / period).floor();
            if whole >= 1.0 {
                let mut skip = whole.min(f64::from(u32::MAX)) as u32;
                if repeat != 0 {
                    skip = skip.min(repeat - self.cycle - 1);
                }
                self.cycle += skip;
                self.completed_run += f64::from(skip) * run;
                self.cycle_start += f64::from(skip) * period;
            }
        }
        self.phase
    }

    /// Total time spent running up to device time `now`.
    pub fn running_time(&self, now: f64) -> f64 {
        let current = match self.phase {
            GenPhase::Running => {
                let into = now - self.cycle_start - self.plan.wait;
                if self.plan.run > 0.0 {
                    into.clamp(0.0, self.plan.run)
                } else {
                    into.max(0.0)
                }
            }
            _ => 0.0,
        };
        self.completed_run + current
    }
}

/// Play-mode buffer status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlayStatus {
    /// Samples the caller may write now
    pub free: usize,
    /// Samples the device needed but did not have (underrun)
    pub lost: u64,
    /// Samples written too late to be played correctly
    pub corrupted: u64,
}

/// Accounting for caller-streamed output data.
#[derive(Debug, Clone)]
pub struct PlayQueue {
    capacity: usize,
    written: u64,
    consumed: u64,
    pending_lost: u64,
    pending_corrupt: u64,
}

impl PlayQueue {
    /// Create a queue with room for `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            written: 0,
            consumed: 0,
            pending_lost: 0,
            pending_corrupt: 0,
        }
    }

    /// Samples queued and not yet played.
    pub fn queued(&self) -> u64 {
        self.written - self.consumed
    }

    /// Free space in samples.
    pub fn free(&self) -> usize {
        self.capacity
            .saturating_sub(usize::try_from(self.queued()).unwrap_or(usize::MAX))
    }

    /// Total samples accepted.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Move the playback head to `consumed_total` samples.
    pub fn consume_to(&mut self, consumed_total: u64) {
        if consumed_total <= self.consumed {
            return;
        }
        if consumed_total > self.written {
            let underrun = consumed_total - self.written;
            debug!(underrun = underrun, "Play buffer underrun");
            self.pending_lost += underrun;
            self.written = consumed_total;
        }
        self.consumed = consumed_total;
    }

    /// Accept up to `count` samples; returns how many fit.
    pub fn accept(&mut self, count: usize) -> usize {
        let taken = count.min(self.free());
        self.written += taken as u64;
        taken
    }

    /// Record that samples starting at `start` were overtaken by the head at `head`.
    pub fn overtaken(&mut self, start: u64, count: usize, head: u64) {
        let late = head.saturating_sub(start).min(count as u64);
        self.pending_corrupt += late;
    }

    /// Status since the last call.
    pub fn status(&mut self) -> PlayStatus {
        PlayStatus {
            free: self.free(),
            lost: std::mem::take(&mut self.pending_lost),
            corrupted: std::mem::take(&mut self.pending_corrupt),
        }
    }
}

/// Drives a [`GeneratorSink`] through the output state machine.
pub(crate) struct OutputEngine<S> {
    kind: InstrumentKind,
    sink: Box<dyn GeneratorSink<S>>,
    bus: TriggerBus,
    state: InstrumentState,
    sequencer: Sequencer,
    listener: Option<BusTrigger>,
}

impl<S> OutputEngine<S> {
    pub fn new(kind: InstrumentKind, sink: Box<dyn GeneratorSink<S>>, bus: TriggerBus) -> Self {
        Self {
            kind,
            sink,
            bus,
            state: InstrumentState::Ready,
            sequencer: Sequencer::new(RunPlan::default()),
            listener: None,
        }
    }

    pub fn state(&self) -> InstrumentState {
        self.state
    }

    pub fn set_state(&mut self, state: InstrumentState) {
        self.state = state;
    }

    fn own_source(&self) -> TriggerSource {
        match self.kind {
            InstrumentKind::DigitalOut => TriggerSource::DigitalOut,
            _ => TriggerSource::AnalogOut,
        }
    }

    pub fn sink(&mut self) -> &mut dyn GeneratorSink<S> {
        self.sink.as_mut()
    }

    pub fn start(&mut self, plan: &GenerationPlan, run: RunPlan, source: TriggerSource) -> Result<()> {
        self.sink.start(plan)?;
        self.sequencer = Sequencer::new(run);
        self.listener = match source {
            TriggerSource::None | TriggerSource::High | TriggerSource::Low => None,
            other => Some(self.bus.listen(other)),
        };
        if matches!(source, TriggerSource::None | TriggerSource::High) {
            self.sequencer.trigger(0.0);
            self.bus.publish(self.own_source());
        }
        self.state = self.sequencer.advance(0.0).into();
        info!(
            instrument = %self.kind,
            rate_hz = plan.rate_hz,
            source = %source,
            wait = run.wait,
            run = run.run,
            repeat = run.repeat,
            "Generator started"
        );
        Ok(())
    }

    /// Device time in seconds since start.
    pub fn now(&mut self) -> Result<f64> {
        Ok(self.sink.elapsed()?.as_secs_f64())
    }

    pub fn running_time(&mut self) -> Result<f64> {
        let now = self.now()?;
        Ok(self.sequencer.running_time(now))
    }

    pub fn poll(&mut self) -> Result<InstrumentState> {
        if !self.state.is_active() {
            return Ok(self.state);
        }
        let now = self.now()?;
        if self.sequencer.phase() == GenPhase::Armed {
            let fired = self
                .listener
                .as_mut()
                .is_some_and(|listener| listener.fired(&self.bus));
            if fired {
                self.begin_cycle(now);
            }
        }
        let before = self.sequencer.phase();
        let phase = self.sequencer.advance(now);
        if phase == GenPhase::Armed && before != GenPhase::Armed {
            if let Some(listener) = &mut self.listener {
                listener.rearm(&self.bus);
            }
        }
        self.state = phase.into();
        if phase == GenPhase::Done {
            self.sink.stop()?;
            info!(instrument = %self.kind, cycles = self.sequencer.cycles(), "Generator done");
        }
        Ok(self.state)
    }

    fn begin_cycle(&mut self, now: f64) {
        self.sequencer.trigger(now);
        self.bus.publish(self.own_source());
        debug!(instrument = %self.kind, at = now, "Generator triggered");
    }

    pub fn force_trigger(&mut self) -> Result<()> {
        require_armed(self.kind, self.state)?;
        let now = self.now()?;
        self.begin_cycle(now);
        self.state = self.sequencer.advance(now).into();
        Ok(())
    }

    pub fn halt(&mut self, next: InstrumentState) -> Result<()> {
        if self.state.is_active() {
            self.sink.stop()?;
            debug!(instrument = %self.kind, from = %self.state, "Generator halted");
        }
        self.state = next;
        Ok(())
    }

    /// Stop the sink regardless of state and drop the run plan.
    pub fn reset(&mut self) -> Result<()> {
        let stopped = self.sink.stop();
        self.sequencer = Sequencer::new(RunPlan::default());
        self.listener = None;
        self.state = InstrumentState::Ready;
        debug!(instrument = %self.kind, "Generator reset");
        stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_run_repeat() {
        let mut seq = Sequencer::new(RunPlan {
            wait: 1.0,
            run: 2.0,
            repeat: 2,
            repeat_trigger: false,
        });
        assert_eq!(seq.advance(0.5), GenPhase::Armed);
        seq.trigger(0.0);
        assert_eq!(seq.advance(0.5), GenPhase::Wait);
        assert_eq!(seq.advance(1.5), GenPhase::Running);
        assert_eq!(seq.advance(3.5), GenPhase::Wait);
        assert_eq!(seq.advance(4.5), GenPhase::Running);
        assert_eq!(seq.advance(6.5), GenPhase::Done);
        assert_eq!(seq.running_time(6.5), 4.0);
    }

    #[test]
    fn test_indefinite_run_never_ends() {
        let mut seq = Sequencer::new(RunPlan::default());
        seq.trigger(0.0);
        assert_eq!(seq.advance(1e6), GenPhase::Running);
        assert_eq!(seq.running_time(10.0), 10.0);
    }

    #[test]
    fn test_repeat_trigger_rearms() {
        let mut seq = Sequencer::new(RunPlan {
            wait: 0.0,
            run: 1.0,
            repeat: 0,
            repeat_trigger: true,
        });
        seq.trigger(0.0);
        assert_eq!(seq.advance(0.5), GenPhase::Running);
        assert_eq!(seq.advance(1.5), GenPhase::Armed);
        seq.trigger(2.0);
        assert_eq!(seq.advance(2.5), GenPhase::Running);
        assert_eq!(seq.cycles(), 1);
    }

    #[test]
    fn test_many_cycles_skipped_at_once() {
        let mut seq = Sequencer::new(RunPlan {
            wait: 0.0,
            run: 0.001,
            repeat: 0,
            repeat_trigger: false,
        });
        seq.trigger(0.0);
        assert_eq!(seq.advance(100.0005), GenPhase::Running);
        assert!(seq.cycles() >= 99_999);
    }

    #[test]
    fn test_play_queue_underrun_and_free() {
        let mut queue = PlayQueue::new(100);
        assert_eq!(queue.accept(150), 100);
        assert_eq!(queue.free(), 0);
        queue.consume_to(60);
        assert_eq!(queue.free(), 60);
        queue.consume_to(130);
        let status = queue.status();
        assert_eq!(status.lost, 30);
        assert_eq!(status.free, 100);
        assert_eq!(queue.status().lost, 0);
    }

    #[test]
    fn test_play_queue_late_write_reported() {
        let mut queue = PlayQueue::new(100);
        queue.overtaken(10, 20, 15);
        assert_eq!(queue.status().corrupted, 5);
        assert_eq!(queue.status().corrupted, 0);
    }
}
