//! Host-side acquisition buffer and drain accounting.
//!
//! The hardware keeps a bounded buffer of `capacity` samples and a
//! monotonically increasing production counter. Each poll the capture
//! engine asks a [`DrainTracker`] what to fetch:
//!
//! ```text
//!   fetched_until             produced - capacity        produced
//!        │◄──────── lost ────────►│◄──────── fetch ────────►│
//! ```
//!
//! Anything older than `produced - capacity` has been overwritten by the
//! hardware and is counted as lost. If the hardware keeps producing while
//! the fetch is in flight, the head of the fetched block may already have
//! been overwritten; those samples are reported as corrupt on the *next*
//! poll, since the current poll's counters were taken before the transfer.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Per-poll sample accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RecordStatus {
    /// New valid samples stored by this poll
    pub available: u64,
    /// Samples produced but never fetched
    pub lost: u64,
    /// Samples fetched by the previous poll that the hardware overwrote mid-transfer
    pub corrupt: u64,
}

impl RecordStatus {
    /// Whether any loss or corruption occurred.
    pub fn has_gap(&self) -> bool {
        self.lost > 0 || self.corrupt > 0
    }
}

/// Result of a non-blocking buffer read.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadOutcome<S> {
    /// Valid samples, oldest first
    pub samples: Vec<S>,
    /// Number of samples the caller asked for
    pub requested: usize,
}

impl<S> ReadOutcome<S> {
    /// Whether fewer samples than requested were valid.
    pub fn is_short(&self) -> bool {
        self.samples.len() < self.requested
    }
}

/// Fixed-capacity multi-channel ring buffer.
///
/// Logical reads start at the oldest valid sample; physical reads index the
/// storage directly (used by scan-screen displays that draw in place).
#[derive(Debug, Clone)]
pub struct SampleRing<S> {
    channels: Vec<Vec<S>>,
    capacity: usize,
    write: usize,
    len: usize,
}

impl<S: Copy + Default> SampleRing<S> {
    /// Create a ring of `capacity` samples per channel.
    pub fn new(channels: usize, capacity: usize) -> Self {
        Self {
            channels: vec![vec![S::default(); capacity]; channels],
            capacity,
            write: 0,
            len: 0,
        }
    }

    /// Samples per channel the ring holds.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of channels.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Valid samples per channel.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no sample has been stored.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Physical index the next sample goes to.
    pub fn write_index(&self) -> usize {
        self.write
    }

    /// Drop all samples.
    pub fn clear(&mut self) {
        self.write = 0;
        self.len = 0;
    }

    /// Append one sample for every channel.
    pub fn push(&mut self, scan: &[S]) {
        if self.capacity == 0 {
            return;
        }
        for (storage, value) in self.channels.iter_mut().zip(scan) {
            storage[self.write] = *value;
        }
        self.write = (self.write + 1) % self.capacity;
        self.len = (self.len + 1).min(self.capacity);
    }

    /// Read `count` samples starting `offset` samples after the oldest valid one.
    pub fn read(&self, channel: usize, offset: usize, count: usize) -> ReadOutcome<S> {
        let Some(storage) = self.channels.get(channel) else {
            return ReadOutcome {
                samples: Vec::new(),
                requested: count,
            };
        };
        let oldest = (self.write + self.capacity - self.len) % self.capacity.max(1);
        let valid = self.len.saturating_sub(offset).min(count);
        let samples = (0..valid)
            .map(|i| storage[(oldest + offset + i) % self.capacity])
            .collect();
        ReadOutcome {
            samples,
            requested: count,
        }
    }

    /// Read by physical position, ignoring the logical start.
    pub fn read_physical(&self, channel: usize, offset: usize, count: usize) -> ReadOutcome<S> {
        let Some(storage) = self.channels.get(channel) else {
            return ReadOutcome {
                samples: Vec::new(),
                requested: count,
            };
        };
        let end = (offset + count).min(self.len);
        let samples = storage.get(offset..end).map(<[S]>::to_vec).unwrap_or_default();
        ReadOutcome {
            samples,
            requested: count,
        }
    }
}

/// What to fetch from the hardware on one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainPlan {
    /// First hardware sample index to fetch
    pub first: u64,
    /// Number of samples to fetch
    pub count: u64,
    /// Samples skipped because the hardware already overwrote them
    pub lost: u64,
}

/// Tracks the hardware production counter across polls.
#[derive(Debug, Clone)]
pub struct DrainTracker {
    capacity: u64,
    fetched_until: u64,
    pending_corrupt: u64,
}

impl DrainTracker {
    /// Create a tracker for a hardware buffer of `capacity` samples.
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            fetched_until: 0,
            pending_corrupt: 0,
        }
    }

    /// Hardware buffer depth.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// First sample index not yet fetched.
    pub fn fetched_until(&self) -> u64 {
        self.fetched_until
    }

    /// Decide what to fetch given the current production counter.
    pub fn plan(&self, produced: u64) -> DrainPlan {
        let delta = produced.saturating_sub(self.fetched_until);
        let lost = delta.saturating_sub(self.capacity);
        DrainPlan {
            first: self.fetched_until + lost,
            count: delta - lost,
            lost,
        }
    }

    /// Record a completed fetch and the production counter read after it.
    pub fn finish(&mut self, plan: &DrainPlan, produced_after: u64) {
        let oldest_valid = produced_after.saturating_sub(self.capacity);
        let overwritten = oldest_valid.saturating_sub(plan.first).min(plan.count);
        if overwritten > 0 {
            debug!(
                first = plan.first,
                count = plan.count,
                overwritten = overwritten,
                "Hardware overwrote samples during transfer"
            );
        }
        self.pending_corrupt += overwritten;
        self.fetched_until = plan.first + plan.count;
    }

    /// Corruption detected by earlier transfers, cleared on read.
    pub fn take_corrupt(&mut self) -> u64 {
        std::mem::take(&mut self.pending_corrupt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_wraps_and_reads_oldest_first() {
        let mut ring = SampleRing::<f64>::new(1, 4);
        for v in 0..6 {
            ring.push(&[f64::from(v)]);
        }
        assert_eq!(ring.len(), 4);
        assert_eq!(ring.read(0, 0, 4).samples, vec![2.0, 3.0, 4.0, 5.0]);
        assert_eq!(ring.write_index(), 2);
        assert_eq!(ring.read_physical(0, 0, 4).samples, vec![4.0, 5.0, 2.0, 3.0]);
    }

    #[test]
    fn test_short_read() {
        let mut ring = SampleRing::<u32>::new(2, 8);
        ring.push(&[1, 10]);
        ring.push(&[2, 20]);
        let out = ring.read(1, 1, 5);
        assert_eq!(out.samples, vec![20]);
        assert!(out.is_short());
        assert!(ring.read(0, 5, 1).samples.is_empty());
        assert!(ring.read(3, 0, 1).is_short());
    }

    #[test]
    fn test_drain_without_loss() {
        let mut tracker = DrainTracker::new(100);
        let plan = tracker.plan(60);
        assert_eq!(plan, DrainPlan { first: 0, count: 60, lost: 0 });
        tracker.finish(&plan, 60);
        assert_eq!(tracker.plan(130), DrainPlan { first: 60, count: 70, lost: 0 });
    }

    #[test]
    fn test_drain_counts_loss() {
        let mut tracker = DrainTracker::new(100);
        let plan = tracker.plan(250);
        assert_eq!(plan, DrainPlan { first: 150, count: 100, lost: 150 });
        tracker.finish(&plan, 250);
        assert_eq!(tracker.take_corrupt(), 0);
        assert_eq!(tracker.fetched_until(), 250);
    }

    #[test]
    fn test_overrun_during_transfer_reported_later() {
        let mut tracker = DrainTracker::new(100);
        let plan = tracker.plan(100);
        // hardware produced 30 more while we copied
        tracker.finish(&plan, 130);
        assert_eq!(tracker.take_corrupt(), 30);
        assert_eq!(tracker.take_corrupt(), 0);
    }
}
