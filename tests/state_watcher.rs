//! Background state polling with `StateWatcher`.

use std::time::Duration;

use mixsig_daq::instrument::{shared, AcquisitionMode, Instrument, InstrumentState};
use mixsig_daq::sim::{Signal, SimDevice, SimHandle};
use mixsig_daq::watch::StateWatcher;
use mixsig_daq::{AnalogIn, Device, ErrorKind};
use tokio::task::JoinHandle;

fn armed_scope() -> (Device, SimHandle, AnalogIn) {
    let (backend, handle) = SimDevice::new();
    let device = Device::new(backend);
    handle.set_analog_signal(0, Signal::Constant(1.25));
    let mut scope = device.analog_in().unwrap();
    scope.set_mode(AcquisitionMode::Single).unwrap();
    scope.set_sample_rate(1_000_000.0).unwrap();
    scope.set_buffer_size(1000).unwrap();
    assert_eq!(scope.configure(false, true).unwrap(), InstrumentState::Armed);
    (device, handle, scope)
}

/// Advance the simulated device by `step` every millisecond.
fn run_clock(handle: SimHandle, step: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(1)).await;
            handle.advance(step);
        }
    })
}

#[tokio::test(start_paused = true)]
async fn test_watcher_reports_done() {
    let (_device, handle, scope) = armed_scope();
    let scope = shared(scope);
    let watcher = StateWatcher::spawn(scope.clone(), Duration::from_millis(1), true);
    assert_eq!(watcher.state(), InstrumentState::Armed);

    let clock = run_clock(handle, Duration::from_micros(100));
    let state = tokio::time::timeout(
        Duration::from_secs(5),
        watcher.wait_for(|state| state == InstrumentState::Done),
    )
    .await
    .unwrap()
    .unwrap();
    clock.abort();

    assert_eq!(state, InstrumentState::Done);
    let scope = scope.lock();
    assert_eq!(scope.valid_samples(), 1000);
    let data = scope.read_samples(0, 0, 1000).unwrap();
    assert!(data.samples.iter().all(|v| *v == 1.25));
}

#[tokio::test(start_paused = true)]
async fn test_subscribers_see_transitions() {
    let (_device, handle, scope) = armed_scope();
    let watcher = StateWatcher::spawn(shared(scope), Duration::from_millis(1), true);
    let mut rx = watcher.subscribe();
    let clock = run_clock(handle, Duration::from_micros(100));

    let mut seen = Vec::new();
    while rx.changed().await.is_ok() {
        let state = *rx.borrow_and_update();
        seen.push(state);
        if state == InstrumentState::Done {
            break;
        }
    }
    clock.abort();

    assert_eq!(seen.first(), Some(&InstrumentState::Triggered));
    assert_eq!(seen.last(), Some(&InstrumentState::Done));
}

#[tokio::test(start_paused = true)]
async fn test_watcher_stops_on_device_error() {
    let (_device, handle, scope) = armed_scope();
    let watcher = StateWatcher::spawn(shared(scope), Duration::from_millis(1), true);

    handle.advance(Duration::from_micros(100));
    handle.fail_next("cable unplugged");
    let err = watcher
        .wait_for(|state| state == InstrumentState::Done)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Device);

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(watcher.is_finished());
    // the last good state is kept
    assert_eq!(watcher.state(), InstrumentState::Armed);
}

#[tokio::test(start_paused = true)]
async fn test_stop_ends_polling() {
    let (_device, _handle, scope) = armed_scope();
    let watcher = StateWatcher::spawn(shared(scope), Duration::from_millis(1), true);
    watcher.stop();
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(watcher.is_finished());
}
