//! Input instruments driven through the simulated device: trigger sources,
//! pre-trigger windows, scan modes, raw codes and configure semantics.

use std::time::Duration;

use mixsig_daq::instrument::{
    AcquisitionMode, ChannelSelector, Instrument, InstrumentKind, InstrumentState,
};
use mixsig_daq::sim::{DigitalSignal, Signal, SimDevice, SimHandle};
use mixsig_daq::trigger::{DigitalPattern, Slope, TriggerKind, TriggerSource, TriggerSpec};
use mixsig_daq::{Device, ErrorKind};

fn sim() -> (Device, SimHandle) {
    let (backend, handle) = SimDevice::new();
    (Device::new(backend), handle)
}

/// Advance in `step`s, polling after each, until `target` or a step limit.
fn poll_until<I: Instrument>(
    instrument: &mut I,
    handle: &SimHandle,
    step: Duration,
    target: InstrumentState,
) -> InstrumentState {
    for _ in 0..1000 {
        handle.advance(step);
        if instrument.poll(true).unwrap() == target {
            return target;
        }
    }
    instrument.state()
}

fn step_signal(low_until: usize, len: usize) -> Signal {
    Signal::Sequence((0..len).map(|i| if i < low_until { 0.0 } else { 1.0 }).collect())
}

#[test]
fn test_edge_trigger_centres_window() {
    let (device, handle) = sim();
    handle.set_analog_signal(0, step_signal(300, 1000));

    let mut scope = device.analog_in().unwrap();
    scope.set_sample_rate(1_000_000.0).unwrap();
    scope.set_buffer_size(100).unwrap();
    scope
        .set_trigger(TriggerSpec {
            source: TriggerSource::AnalogInDetector,
            slope: Slope::Rise,
            level: Some(0.5),
            hysteresis: Some(0.1),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(scope.configure(false, true).unwrap(), InstrumentState::Prefill);

    let step = Duration::from_micros(10);
    assert_eq!(
        poll_until(&mut scope, &handle, step, InstrumentState::Done),
        InstrumentState::Done
    );
    assert_eq!(scope.trigger_offset(), Some(50));
    let data = scope.read_samples(0, 0, 100).unwrap().samples;
    assert!(data[..50].iter().all(|v| *v == 0.0));
    assert!(data[50..].iter().all(|v| *v == 1.0));
}

#[test]
fn test_auto_timeout_flags_capture() {
    let (device, handle) = sim();
    let mut scope = device.analog_in().unwrap();
    scope.set_sample_rate(1_000_000.0).unwrap();
    scope.set_buffer_size(100).unwrap();
    scope
        .set_trigger(TriggerSpec {
            source: TriggerSource::AnalogInDetector,
            level: Some(0.5),
            auto_timeout: 0.0001,
            ..Default::default()
        })
        .unwrap();
    scope.configure(false, true).unwrap();

    let state = poll_until(&mut scope, &handle, Duration::from_micros(10), InstrumentState::Done);
    assert_eq!(state, InstrumentState::Done);
    assert!(scope.auto_triggered());
}

#[test]
fn test_pc_trigger_and_force_trigger_need_armed() {
    let (device, handle) = sim();
    let mut scope = device.analog_in().unwrap();
    scope.set_sample_rate(1_000_000.0).unwrap();
    scope.set_buffer_size(100).unwrap();
    scope.set_trigger_source(TriggerSource::Pc).unwrap();
    assert_eq!(scope.configure(false, true).unwrap(), InstrumentState::Prefill);

    let err = scope.force_trigger().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    let step = Duration::from_micros(10);
    assert_eq!(
        poll_until(&mut scope, &handle, step, InstrumentState::Armed),
        InstrumentState::Armed
    );
    // nothing fires on its own
    handle.advance(step);
    assert_eq!(scope.poll(true).unwrap(), InstrumentState::Armed);

    device.trigger_pc();
    handle.advance(step);
    assert_eq!(scope.poll(true).unwrap(), InstrumentState::Triggered);
    assert_eq!(
        poll_until(&mut scope, &handle, step, InstrumentState::Done),
        InstrumentState::Done
    );
    assert_eq!(scope.valid_samples(), 100);
    assert_eq!(scope.trigger_offset(), Some(50));
}

#[test]
fn test_analog_capture_triggers_logic_analyzer() {
    let (device, handle) = sim();
    let mut logic = device.digital_in().unwrap();
    logic.set_sample_rate(1_000_000.0).unwrap();
    logic.set_buffer_size(64).unwrap();
    logic
        .set_trigger(TriggerSpec {
            source: TriggerSource::AnalogIn,
            ..Default::default()
        })
        .unwrap();
    logic.configure(false, true).unwrap();

    let mut scope = device.analog_in().unwrap();
    scope.set_sample_rate(1_000_000.0).unwrap();
    scope.set_buffer_size(100).unwrap();
    scope.configure(false, true).unwrap();

    handle.advance(Duration::from_micros(40));
    assert_eq!(logic.poll(true).unwrap(), InstrumentState::Armed);
    assert_eq!(scope.poll(true).unwrap(), InstrumentState::Triggered);

    handle.advance(Duration::from_micros(10));
    assert_eq!(logic.poll(true).unwrap(), InstrumentState::Triggered);
    let state = poll_until(&mut logic, &handle, Duration::from_micros(10), InstrumentState::Done);
    assert_eq!(state, InstrumentState::Done);
    assert_eq!(logic.trigger_offset(), Some(32));
}

#[test]
fn test_digital_pattern_trigger_and_bit_reads() {
    let (device, handle) = sim();
    handle.set_digital_signal(DigitalSignal::Counter);

    let mut logic = device.digital_in().unwrap();
    logic.set_sample_rate(1_000_000.0).unwrap();
    logic.set_buffer_size(64).unwrap();
    logic
        .set_trigger(TriggerSpec {
            source: TriggerSource::DigitalInDetector,
            kind: TriggerKind::Transition,
            ..Default::default()
        })
        .unwrap();
    logic
        .set_trigger_pattern(DigitalPattern {
            level_high: 1 << 6,
            ..Default::default()
        })
        .unwrap();
    logic.configure(false, true).unwrap();

    let state = poll_until(&mut logic, &handle, Duration::from_micros(10), InstrumentState::Done);
    assert_eq!(state, InstrumentState::Done);

    // bit 6 of the counter first rises at sample 64
    let words = logic.read_samples(0, 64).samples;
    assert_eq!(words[32], 64);
    assert_eq!(words[0], 32);
    let bit6 = logic.read_bits(6, 0, 64).unwrap().samples;
    assert!(!bit6[31]);
    assert!(bit6[32]);

    let err = logic.read_bits(16, 0, 1).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);
}

#[test]
fn test_conflicting_pattern_rejected() {
    let (device, _handle) = sim();
    let mut logic = device.digital_in().unwrap();
    let bad = DigitalPattern {
        level_low: 0b10,
        level_high: 0b11,
        ..Default::default()
    };
    assert!(logic.set_trigger_pattern(bad).is_err());
    assert_eq!(logic.trigger_pattern(), DigitalPattern::default());
    assert!(logic.set_sample_format(12).unwrap_err().is_invalid_parameter());
}

#[test]
fn test_scan_screen_exposes_write_index() {
    let (device, handle) = sim();
    handle.set_analog_signal(0, Signal::Sequence((0..1000).map(f64::from).collect()));

    let mut scope = device.analog_in().unwrap();
    scope.set_mode(AcquisitionMode::ScanScreen).unwrap();
    scope.set_sample_rate(1_000_000.0).unwrap();
    scope.set_buffer_size(100).unwrap();
    assert_eq!(scope.configure(false, true).unwrap(), InstrumentState::Triggered);

    for _ in 0..5 {
        handle.advance(Duration::from_micros(50));
        assert_eq!(scope.poll(true).unwrap(), InstrumentState::Triggered);
    }
    assert_eq!(scope.write_index(), 50);
    let data = scope.read_samples(0, 0, 100).unwrap().samples;
    // physical order: newest half first
    assert_eq!(data[0], 200.0);
    assert_eq!(data[50], 150.0);
}

#[test]
fn test_scan_shift_reads_oldest_first() {
    let (device, handle) = sim();
    handle.set_analog_signal(0, Signal::Sequence((0..1000).map(f64::from).collect()));

    let mut scope = device.analog_in().unwrap();
    scope.set_mode(AcquisitionMode::ScanShift).unwrap();
    scope.set_sample_rate(1_000_000.0).unwrap();
    scope.set_buffer_size(100).unwrap();
    scope.configure(false, true).unwrap();
    for _ in 0..5 {
        handle.advance(Duration::from_micros(50));
        scope.poll(true).unwrap();
    }
    let data = scope.read_samples(0, 0, 100).unwrap().samples;
    assert_eq!(data[0], 150.0);
    assert_eq!(data[99], 249.0);
}

#[test]
fn test_oversample_stores_means() {
    let (device, handle) = sim();
    handle.set_analog_signal(0, Signal::Sequence(vec![0.0, 1.0, 2.0, 3.0]));

    let mut scope = device.analog_in().unwrap();
    scope.set_mode(AcquisitionMode::Oversample).unwrap();
    scope.set_oversample(4).unwrap();
    scope.set_sample_rate(1_000_000.0).unwrap();
    scope.set_buffer_size(100).unwrap();
    scope.configure(false, true).unwrap();

    handle.advance(Duration::from_micros(400));
    assert_eq!(scope.poll(true).unwrap(), InstrumentState::Done);
    let data = scope.read_samples(0, 0, 100).unwrap().samples;
    assert_eq!(data.len(), 100);
    assert!(data.iter().all(|v| *v == 1.5));
}

#[test]
fn test_finite_record_length() {
    let (device, handle) = sim();
    let mut scope = device.analog_in().unwrap();
    scope.set_mode(AcquisitionMode::Record).unwrap();
    scope.set_sample_rate(1_000_000.0).unwrap();
    scope.set_buffer_size(1000).unwrap();
    scope.set_record_length(0.0005).unwrap();
    scope.configure(false, true).unwrap();

    handle.advance(Duration::from_millis(1));
    assert_eq!(scope.poll(true).unwrap(), InstrumentState::Done);
    assert_eq!(scope.record_status().unwrap().available, 500);
}

#[test]
fn test_transfer_overrun_reported_as_corrupt() {
    let (device, handle) = sim();
    let mut scope = device.analog_in().unwrap();
    scope.set_mode(AcquisitionMode::Record).unwrap();
    scope.set_sample_rate(1_000_000.0).unwrap();
    scope.set_buffer_size(1000).unwrap();
    scope.configure(false, true).unwrap();

    handle.advance(Duration::from_millis(1));
    handle.inject_analog_overrun(300);
    scope.poll(true).unwrap();
    assert_eq!(scope.record_status().unwrap().corrupt, 0);

    scope.poll(true).unwrap();
    let status = scope.record_status().unwrap();
    assert_eq!(status.corrupt, 300);
    assert_eq!(status.available, 300);
}

#[test]
fn test_raw_codes_and_attenuation() {
    let (device, handle) = sim();
    handle.set_analog_signal(0, Signal::Constant(2.5));
    handle.set_analog_signal(1, Signal::Constant(0.25));

    let mut scope = device.analog_in().unwrap();
    scope.set_sample_rate(1_000_000.0).unwrap();
    scope.set_buffer_size(100).unwrap();
    scope.set_channel_range(ChannelSelector::Index(0), 10.0).unwrap();
    scope.set_channel_attenuation(ChannelSelector::Index(1), 10.0).unwrap();
    scope.configure(false, true).unwrap();
    handle.advance(Duration::from_micros(100));
    assert_eq!(scope.poll(true).unwrap(), InstrumentState::Done);

    let raw = scope.read_raw(0, 0, 10).unwrap().samples;
    assert!(raw.iter().all(|code| *code == 16384));
    let scaled = scope.read_samples(1, 0, 10).unwrap().samples;
    assert!(scaled.iter().all(|v| (*v - 2.5).abs() < 1e-12));
}

#[test]
fn test_disabled_and_unknown_channels_rejected() {
    let (device, handle) = sim();
    let mut scope = device.analog_in().unwrap();
    scope.set_buffer_size(100).unwrap();
    scope.set_channel_enable(ChannelSelector::Index(1), false).unwrap();
    scope.configure(false, true).unwrap();
    handle.advance(Duration::from_micros(100));
    scope.poll(true).unwrap();

    assert!(scope.read_samples(0, 0, 10).is_ok());
    assert!(scope.read_samples(1, 0, 10).unwrap_err().is_invalid_parameter());
    assert!(matches!(
        scope.read_samples(5, 0, 10),
        Err(mixsig_daq::DaqError::InvalidChannel { channel: 5, .. })
    ));
}

#[test]
fn test_configure_semantics() {
    let (device, handle) = sim();
    let mut scope = device.analog_in().unwrap();

    // nothing queued: no-op on Ready, repeatable
    assert_eq!(scope.configure(false, false).unwrap(), InstrumentState::Ready);
    assert_eq!(scope.configure(false, false).unwrap(), InstrumentState::Ready);

    scope.set_buffer_size(100).unwrap();
    scope.set_trigger_source(TriggerSource::Low).unwrap();
    scope.configure(false, true).unwrap();
    assert!(scope.state().is_active());

    let err = scope.configure(false, true).unwrap_err();
    assert!(err.is_busy());

    // reconfigure aborts the running cycle and starts a new one
    scope.set_trigger_source(TriggerSource::None).unwrap();
    assert_eq!(scope.configure(true, true).unwrap(), InstrumentState::Armed);
    handle.advance(Duration::from_micros(100));
    assert_eq!(scope.poll(true).unwrap(), InstrumentState::Done);

    scope.stop().unwrap();
    assert_eq!(scope.state(), InstrumentState::Ready);
    assert_eq!(scope.valid_samples(), 100);
}

#[test]
fn test_poll_without_read_data_only_reports() {
    let (device, handle) = sim();
    let mut scope = device.analog_in().unwrap();
    scope.set_buffer_size(100).unwrap();
    scope.configure(false, true).unwrap();
    handle.advance(Duration::from_micros(100));
    assert_eq!(scope.poll(false).unwrap(), InstrumentState::Armed);
    assert_eq!(scope.valid_samples(), 0);
}

#[test]
fn test_failed_setters_keep_previous_values() {
    let (device, _handle) = sim();
    let mut scope = device.analog_in().unwrap();

    scope.set_sample_rate(1_000_000.0).unwrap();
    assert!(scope.set_sample_rate(1e12).is_err());
    assert_eq!(scope.sample_rate(), 1_000_000.0);

    scope.set_buffer_size(500).unwrap();
    assert!(scope.set_buffer_size(4).is_err());
    assert_eq!(scope.buffer_size(), 500);

    scope.set_channel_range(ChannelSelector::Index(0), 7.0).unwrap();
    assert_eq!(scope.channel(0).unwrap().range, 10.0);
    assert!(scope.set_channel_range(ChannelSelector::Index(0), 500.0).is_err());
    assert_eq!(scope.channel(0).unwrap().range, 10.0);

    let before = scope.trigger().clone();
    let bad = TriggerSpec {
        source: TriggerSource::External(9),
        ..Default::default()
    };
    assert!(scope.set_trigger(bad).is_err());
    assert_eq!(scope.trigger(), &before);
}

#[test]
fn test_rate_snaps_to_clock_divider() {
    let (device, _handle) = sim();
    let mut scope = device.analog_in().unwrap();
    scope.set_sample_rate(33_000_000.0).unwrap();
    assert!((scope.sample_rate() - 100_000_000.0 / 3.0).abs() < 1e-6);
}

#[test]
fn test_reset_stops_stream_and_forgets_record_status() {
    let (device, handle) = sim();
    let mut scope = device.analog_in().unwrap();
    scope.set_mode(AcquisitionMode::Record).unwrap();
    scope.set_sample_rate(1_000_000.0).unwrap();
    scope.set_buffer_size(100).unwrap();
    scope.configure(false, true).unwrap();

    handle.advance(Duration::from_micros(50));
    scope.poll(true).unwrap();
    assert_eq!(scope.record_status().unwrap().available, 50);
    assert!(handle.is_streaming(InstrumentKind::AnalogIn));

    scope.reset().unwrap();
    assert!(!handle.is_streaming(InstrumentKind::AnalogIn));
    assert_eq!(scope.state(), InstrumentState::Ready);
    assert_eq!(scope.mode(), AcquisitionMode::Single);
    assert_eq!(scope.buffer_size(), device.capabilities().analog_in.buffer_size.1);
    assert_eq!(scope.valid_samples(), 0);
    let err = scope.record_status().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotSupported);

    // a reset scope starts cleanly again
    scope.set_sample_rate(1_000_000.0).unwrap();
    scope.set_buffer_size(100).unwrap();
    scope.configure(false, true).unwrap();
    assert!(handle.is_streaming(InstrumentKind::AnalogIn));
}

#[test]
fn test_reset_stops_logic_analyzer_while_armed() {
    let (device, handle) = sim();
    let mut logic = device.digital_in().unwrap();
    logic.set_sample_rate(1_000_000.0).unwrap();
    logic.set_buffer_size(64).unwrap();
    logic.set_trigger_source(TriggerSource::Pc).unwrap();
    logic.configure(false, true).unwrap();
    handle.advance(Duration::from_micros(40));
    assert_eq!(logic.poll(true).unwrap(), InstrumentState::Armed);

    logic.reset().unwrap();
    assert!(!handle.is_streaming(InstrumentKind::DigitalIn));
    // stop after reset is a no-op, not an error
    logic.stop().unwrap();
    assert_eq!(logic.state(), InstrumentState::Ready);
}

/// Sawtooth of 0.0, 0.1, .. 19.9 V repeating every 200 samples.
fn sawtooth() -> Signal {
    Signal::Sequence((0..200).map(|i| f64::from(i) * 0.1).collect())
}

#[test]
fn test_overflow_after_trigger_discards_window() {
    let (device, handle) = sim();
    handle.set_analog_signal(0, sawtooth());

    let mut scope = device.analog_in().unwrap();
    scope.set_sample_rate(1_000_000.0).unwrap();
    scope.set_buffer_size(100).unwrap();
    scope
        .set_trigger(TriggerSpec {
            source: TriggerSource::AnalogInDetector,
            slope: Slope::Rise,
            level: Some(6.05),
            hysteresis: Some(0.1),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(scope.configure(false, true).unwrap(), InstrumentState::Prefill);

    // fires at sample 61, window would end at sample 111
    handle.advance(Duration::from_micros(70));
    assert_eq!(scope.poll(true).unwrap(), InstrumentState::Triggered);
    assert_eq!(scope.window_restarts(), 0);

    // 400 samples overwritten before the window completed
    handle.advance(Duration::from_micros(500));
    assert_eq!(scope.poll(true).unwrap(), InstrumentState::Armed);
    assert_eq!(scope.window_restarts(), 1);
    assert_eq!(scope.trigger_offset(), None);

    // the next sawtooth period fires at hardware sample 661
    handle.advance(Duration::from_micros(100));
    assert_eq!(scope.poll(true).unwrap(), InstrumentState::Triggered);
    handle.advance(Duration::from_micros(100));
    assert_eq!(scope.poll(true).unwrap(), InstrumentState::Done);

    assert_eq!(scope.trigger_offset(), Some(50));
    let expected: Vec<f64> = (11..=110).map(|i| f64::from(i) * 0.1).collect();
    assert_eq!(scope.read_samples(0, 0, 100).unwrap().samples, expected);
    assert_eq!(scope.window_restarts(), 1);
}

#[test]
fn test_overwrite_during_transfer_discards_window() {
    let (device, handle) = sim();
    let mut scope = device.analog_in().unwrap();
    scope.set_sample_rate(1_000_000.0).unwrap();
    scope.set_buffer_size(100).unwrap();
    assert_eq!(scope.configure(false, true).unwrap(), InstrumentState::Armed);

    handle.advance(Duration::from_micros(60));
    assert_eq!(scope.poll(true).unwrap(), InstrumentState::Triggered);

    // the hardware runs 70 samples ahead during the next 60-sample
    // transfer, overwriting its first 30
    handle.advance(Duration::from_micros(60));
    handle.inject_analog_overrun(70);
    assert_eq!(scope.poll(true).unwrap(), InstrumentState::Triggered);
    assert_eq!(scope.window_restarts(), 1);
    assert_eq!(scope.valid_samples(), 30);
}
