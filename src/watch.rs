//! Asynchronous state notifications on top of the polling core.
//!
//! The instruments themselves are synchronous and caller-driven. A
//! [`StateWatcher`] runs a tokio task that polls a [`SharedInstrument`] on
//! a fixed interval and publishes every state change through a
//! `tokio::sync::watch` channel, so any number of subscribers can await
//! transitions without polling themselves.
//!
//! ```rust,ignore
//! let scope = shared(device.analog_in()?);
//! let watcher = StateWatcher::spawn(scope.clone(), Duration::from_millis(5), true);
//! let mut rx = watcher.subscribe();
//! while rx.changed().await.is_ok() {
//!     if *rx.borrow() == InstrumentState::Done {
//!         break;
//!     }
//! }
//! ```
//!
//! The polling task holds the instrument lock only for the duration of one
//! `poll` call.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::error::{DaqError, Result};
use crate::instrument::{Instrument, InstrumentState, SharedInstrument};

/// Background poller publishing instrument state changes.
///
/// Dropping the watcher stops the task.
#[derive(Debug)]
pub struct StateWatcher {
    receiver: watch::Receiver<InstrumentState>,
    task: JoinHandle<()>,
}

impl StateWatcher {
    /// Start polling `instrument` every `interval`.
    ///
    /// `read_data` is passed to every [`Instrument::poll`]. The task ends
    /// when polling fails or every subscriber, including the watcher, is gone.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<I>(instrument: SharedInstrument<I>, interval: Duration, read_data: bool) -> Self
    where
        I: Instrument + 'static,
    {
        let initial = instrument.lock().state();
        let (sender, receiver) = watch::channel(initial);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if sender.is_closed() {
                    break;
                }
                let polled = {
                    let mut guard = instrument.lock();
                    guard.poll(read_data).map(|state| (guard.kind(), state))
                };
                match polled {
                    Ok((kind, state)) => {
                        let changed = sender.send_if_modified(|current| {
                            if *current == state {
                                return false;
                            }
                            *current = state;
                            true
                        });
                        if changed {
                            debug!(instrument = %kind, state = %state, "Watcher observed state change");
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Watcher poll failed, stopping");
                        break;
                    }
                }
            }
        });
        Self { receiver, task }
    }

    /// Latest observed state.
    pub fn state(&self) -> InstrumentState {
        *self.receiver.borrow()
    }

    /// New receiver for state changes.
    pub fn subscribe(&self) -> watch::Receiver<InstrumentState> {
        self.receiver.clone()
    }

    /// Wait until the observed state satisfies `predicate`.
    ///
    /// Fails with a device error if the polling task ended first.
    pub async fn wait_for<F>(&self, mut predicate: F) -> Result<InstrumentState>
    where
        F: FnMut(InstrumentState) -> bool,
    {
        let mut receiver = self.receiver.clone();
        let state = receiver
            .wait_for(|state| predicate(*state))
            .await
            .map_err(|_| DaqError::device("state watcher stopped"))?;
        Ok(*state)
    }

    /// Whether the polling task has ended.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop polling.
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for StateWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}
